//! Seeded Gaussian noise for the synthetic host.
//!
//! Uses MT19937 with a Box-Muller transform so latents and synthetic prompt
//! embeddings are reproducible on every device (CPU seeding is not supported
//! by candle itself).

use candle::{DType, Device, Result, Tensor};
use rand_mt::Mt;

/// MT19937 + Box-Muller normal sampler.
#[derive(Debug, Clone)]
pub struct SeededNoise {
    rng: Mt,
    /// Second Box-Muller value, returned on the next call.
    cached_value: Option<f32>,
}

impl SeededNoise {
    /// MT19937 is 32-bit, so only the lower 32 bits of the seed are used.
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mt::new(seed as u32),
            cached_value: None,
        }
    }

    /// Sampler whose stream depends on both `seed` and `text`.
    ///
    /// The same prompt always maps to the same embedding for a given seed.
    pub fn for_text(seed: u64, text: &str) -> Self {
        // FNV-1a
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for byte in text.bytes() {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0100_0000_01b3);
        }
        Self::new(seed ^ hash ^ (hash >> 32))
    }

    /// Two MT19937 outputs to a 53-bit uniform in [0, 1).
    #[inline]
    fn uniform(&mut self) -> f64 {
        let combined = ((self.rng.next_u32() as u64) << 32) | (self.rng.next_u32() as u64);
        const MASK_53BIT: u64 = 0x001F_FFFF_FFFF_FFFF;
        const DIVISOR: f64 = 9_007_199_254_740_992.0; // 2^53
        (combined & MASK_53BIT) as f64 / DIVISOR
    }

    /// One sample from N(0, 1).
    pub fn sample(&mut self) -> f32 {
        if let Some(cached) = self.cached_value.take() {
            return cached;
        }

        let u1 = self.uniform();
        let u2 = self.uniform();
        // log(1 - u2) keeps the argument away from zero
        let r = (-2.0_f64 * (1.0_f64 - u2).ln()).sqrt();
        let theta = 2.0_f64 * std::f64::consts::PI * u1;

        self.cached_value = Some((r * theta.sin()) as f32);
        (r * theta.cos()) as f32
    }

    /// Tensor of N(0, 1) samples, built on the CPU and moved to `device`.
    pub fn randn(&mut self, shape: &[usize], device: &Device, dtype: DType) -> Result<Tensor> {
        let elem_count: usize = shape.iter().product();
        let data: Vec<f32> = (0..elem_count).map(|_| self.sample()).collect();
        let tensor = Tensor::from_vec(data, shape, &Device::Cpu)?;
        let tensor = if matches!(device, Device::Cpu) {
            tensor
        } else {
            tensor.to_device(device)?
        };
        tensor.to_dtype(dtype)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_determinism() {
        let mut a = SeededNoise::new(42);
        let mut b = SeededNoise::new(42);
        for _ in 0..100 {
            assert_eq!(a.sample(), b.sample());
        }
    }

    #[test]
    fn test_text_streams_differ() {
        let mut cat = SeededNoise::for_text(7, "cat");
        let mut dog = SeededNoise::for_text(7, "dog");
        let cat: Vec<f32> = (0..8).map(|_| cat.sample()).collect();
        let dog: Vec<f32> = (0..8).map(|_| dog.sample()).collect();
        assert_ne!(cat, dog);
    }

    #[test]
    fn test_randn_tensor() -> Result<()> {
        let mut rng = SeededNoise::new(42);
        let tensor = rng.randn(&[2, 3, 4], &Device::Cpu, DType::F32)?;
        assert_eq!(tensor.dims(), &[2, 3, 4]);
        Ok(())
    }
}
