//! Debug utilities for semantic guidance.
//!
//! Set `SEGA_DEBUG=1` to log tensor statistics of the edit directions and the
//! injected deltas at every hooked step (emitted at `debug` level).

use std::sync::atomic::{AtomicBool, Ordering};

use candle::{DType, Result, Tensor};

static DEBUG_MODE: AtomicBool = AtomicBool::new(false);
static DEBUG_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Check if debug mode is enabled (via SEGA_DEBUG environment variable).
pub fn is_debug_mode() -> bool {
    if !DEBUG_INITIALIZED.load(Ordering::Relaxed) {
        let enabled = std::env::var("SEGA_DEBUG").is_ok();
        DEBUG_MODE.store(enabled, Ordering::Relaxed);
        DEBUG_INITIALIZED.store(true, Ordering::Relaxed);
    }
    DEBUG_MODE.load(Ordering::Relaxed)
}

/// Summary statistics of a tensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TensorStats {
    pub mean: f32,
    pub std: f32,
    pub min: f32,
    pub max: f32,
    /// Number of non-zero elements.
    pub nonzero: usize,
}

/// Compute mean, population std, min, max and non-zero count.
pub fn tensor_stats(t: &Tensor) -> Result<TensorStats> {
    let t_f32 = t.to_dtype(DType::F32)?.flatten_all()?;
    let mean = t_f32.mean_all()?.to_scalar::<f32>()?;
    let diff = t_f32.broadcast_sub(&t_f32.mean_all()?)?;
    let var = (&diff * &diff)?.mean_all()?.to_scalar::<f32>()?;
    let min = t_f32.min(0)?.to_scalar::<f32>()?;
    let max = t_f32.max(0)?.to_scalar::<f32>()?;
    let nonzero = t_f32
        .ne(0f32)?
        .to_dtype(DType::U32)?
        .sum_all()?
        .to_scalar::<u32>()? as usize;
    Ok(TensorStats {
        mean,
        std: var.sqrt(),
        min,
        max,
        nonzero,
    })
}

/// Log tensor statistics under `name`.
///
/// Only logs if `SEGA_DEBUG` is set.
pub fn debug_tensor(name: &str, t: &Tensor) {
    if !is_debug_mode() {
        return;
    }

    match tensor_stats(t) {
        Ok(s) => tracing::debug!(
            target: "sega",
            "{}: shape={:?}, mean={:.6}, std={:.6}, min={:.6}, max={:.6}, nonzero={}",
            name,
            t.dims(),
            s.mean,
            s.std,
            s.min,
            s.max,
            s.nonzero
        ),
        Err(e) => tracing::debug!(target: "sega", "{}: shape={:?}, stats error: {}", name, t.dims(), e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn test_tensor_stats() -> Result<()> {
        let t = Tensor::new(&[0f32, 0., 2., -2.], &Device::Cpu)?;
        let s = tensor_stats(&t)?;
        assert_eq!(s.mean, 0.0);
        assert_eq!(s.std, 2f32.sqrt());
        assert_eq!(s.min, -2.0);
        assert_eq!(s.max, 2.0);
        assert_eq!(s.nonzero, 2);
        Ok(())
    }
}
