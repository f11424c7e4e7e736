//! Thresholded edit directions.
//!
//! For each concept the edit direction is the difference between the concept
//! conditioning and the unconditioned baseline, restricted to the elements
//! whose magnitude lands in the upper tail of the concept's own distribution:
//!
//! ```text
//! diff      = concept - uncond
//! z         = Φ⁻¹(1 - tail_percentage_threshold)
//! threshold = mean(concept) + z × std(concept)      (per sample, last two dims)
//! direction = where(|diff| > threshold, edit_guidance_scale, 0) × diff × strength
//! ```
//!
//! Concept tensors arrive stacked over a leading concept dimension, e.g.
//! `[concepts, batch, tokens, dim]`, and the baseline broadcasts against them.

use candle::{DType, Tensor, D};
use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{Result, SegaError};

/// Upper z-score of the standard normal for the given tail probability.
///
/// `tail_percentage_threshold → 0` sends the cutoff to `+∞` (nothing passes),
/// `→ 1` sends it to `-∞` (everything passes).
pub fn tail_z_score(tail_percentage_threshold: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&tail_percentage_threshold) {
        return Err(SegaError::Statistics(format!(
            "tail percentage threshold {tail_percentage_threshold} is not a probability"
        )));
    }
    let normal = Normal::new(0.0, 1.0).map_err(|e| SegaError::Statistics(e.to_string()))?;
    Ok(normal.inverse_cdf(1.0 - tail_percentage_threshold))
}

/// Warmup gate: `0` before the warmup has elapsed, `1` afterwards.
pub fn guidance_strength(sampling_step: usize, warmup_steps: usize) -> f64 {
    if sampling_step < warmup_steps {
        0.0
    } else {
        1.0
    }
}

/// Per-sample mean and unbiased standard deviation over the last two dims.
///
/// Both results keep their reduced dims so they broadcast back onto `xs`.
pub fn feature_stats(xs: &Tensor) -> Result<(Tensor, Tensor)> {
    let dims = xs.dims();
    if dims.len() < 2 {
        return Err(SegaError::Statistics(format!(
            "feature stats need rank >= 2, got {dims:?}"
        )));
    }
    let n = dims[dims.len() - 1] * dims[dims.len() - 2];
    let xs = xs.to_dtype(DType::F32)?;

    let mean = (xs.sum_keepdim(D::Minus1)?.sum_keepdim(D::Minus2)? / n as f64)?;
    let centered = xs.broadcast_sub(&mean)?;
    // Bessel-corrected, a single element gives inf/NaN like torch.std
    let var = (centered
        .sqr()?
        .sum_keepdim(D::Minus1)?
        .sum_keepdim(D::Minus2)?
        / n.saturating_sub(1) as f64)?;
    Ok((mean, var.sqrt()?))
}

/// Elements of `diff` whose magnitude exceeds the tail threshold of `concept`.
///
/// Returns a `u8` mask with the shape of `diff`.
pub fn selection_mask(concept: &Tensor, diff: &Tensor, upper_z: f64) -> Result<Tensor> {
    let (mean, std) = feature_stats(concept)?;
    let upper_threshold = (mean + (std * upper_z)?)?;
    Ok(diff.abs()?.broadcast_gt(&upper_threshold)?)
}

/// Compute the thresholded, scaled edit direction of stacked concepts.
///
/// The result is F32 with the broadcast shape of `concept` and `uncond`.
pub fn compute_edit_direction(
    concept: &Tensor,
    uncond: &Tensor,
    tail_percentage_threshold: f64,
    edit_guidance_scale: f64,
    guidance_strength: f64,
) -> Result<Tensor> {
    let concept = concept.to_dtype(DType::F32)?;
    let uncond = uncond.to_dtype(DType::F32)?;

    let edit_dir = concept.broadcast_sub(&uncond)?;
    let upper_z = tail_z_score(tail_percentage_threshold)?;
    let mask = selection_mask(&concept, &edit_dir, upper_z)?;

    let zero_tensor = edit_dir.zeros_like()?;
    let scale_tensor = (edit_dir.ones_like()? * edit_guidance_scale)?;
    let scale_tensor = mask.where_cond(&scale_tensor, &zero_tensor)?;

    let edit_dir = (scale_tensor * edit_dir)?;
    Ok((edit_dir * guidance_strength)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    #[test]
    fn test_tail_z_score() -> Result<()> {
        assert!(tail_z_score(0.5)?.abs() < 1e-9);
        // Φ⁻¹(0.75) ≈ 0.6745
        assert!((tail_z_score(0.25)? - 0.674_489_75).abs() < 1e-6);
        assert!(tail_z_score(0.05)? > tail_z_score(0.25)?);
        assert!(tail_z_score(1.5).is_err());
        Ok(())
    }

    #[test]
    fn test_guidance_strength_is_on_off() {
        assert_eq!(guidance_strength(0, 5), 0.0);
        assert_eq!(guidance_strength(4, 5), 0.0);
        assert_eq!(guidance_strength(5, 5), 1.0);
        assert_eq!(guidance_strength(19, 5), 1.0);
        assert_eq!(guidance_strength(0, 0), 1.0);
    }

    #[test]
    fn test_feature_stats_per_sample() -> Result<()> {
        let device = Device::Cpu;
        // Two samples of 2x2 features
        let xs = Tensor::new(&[[[1f32, 1.], [1., 1.]], [[0., 2.], [0., 2.]]], &device)?;
        let (mean, std) = feature_stats(&xs)?;
        assert_eq!(mean.dims(), &[2, 1, 1]);
        assert_eq!(mean.flatten_all()?.to_vec1::<f32>()?, [1.0, 1.0]);

        let std = std.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(std[0], 0.0);
        // sqrt(4 / 3)
        assert!((std[1] - (4f32 / 3.).sqrt()).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_direction_keeps_only_tail_elements() -> Result<()> {
        let device = Device::Cpu;
        let concept = Tensor::new(&[[[1f32, 1., 1., 1.]]], &device)?;
        let uncond = Tensor::new(&[[[1f32, -2., 0.5, 1.]]], &device)?;

        // std = 0 so the threshold equals the mean (1.0)
        let dir = compute_edit_direction(&concept, &uncond, 0.25, 2.0, 1.0)?;
        assert_eq!(dir.flatten_all()?.to_vec1::<f32>()?, [0.0, 6.0, 0.0, 0.0]);

        let gated = compute_edit_direction(&concept, &uncond, 0.25, 2.0, 0.0)?;
        assert_eq!(gated.abs()?.sum_all()?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn test_direction_broadcasts_over_concepts() -> Result<()> {
        let device = Device::Cpu;
        let concepts = Tensor::randn(0f32, 1f32, (3, 2, 4, 8), &device)?;
        let uncond = Tensor::randn(0f32, 1f32, (2, 4, 8), &device)?;
        let dir = compute_edit_direction(&concepts, &uncond, 0.25, 1.0, 1.0)?;
        assert_eq!(dir.dims(), &[3, 2, 4, 8]);
        assert_eq!(dir.dtype(), DType::F32);
        Ok(())
    }
}
