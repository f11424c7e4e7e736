//! Sequence-length reconciliation between conditioning tensors.
//!
//! Prompts longer than one encoder chunk produce longer conditioning, so the
//! conditioned, unconditioned and concept tensors of one key can disagree on
//! dim 1. The shorter side is extended with whole copies of the host's
//! empty-prompt conditioning until the lengths match:
//!
//! ```text
//! num_repeats = (len_a - len_b) / len_empty
//! num_repeats < 0  =>  pad a with -num_repeats copies of empty
//! num_repeats > 0  =>  pad b with  num_repeats copies of empty
//! ```
//!
//! Padding only ever appends, so narrowing a padded tensor back to its original
//! length recovers it exactly.

use candle::Tensor;

use crate::conditioning::{TensorKey, SEQ_DIM};
use crate::error::{Result, SegaError};

/// Length of the sequence dimension, rejecting tensors without one.
pub fn seq_len(key: &TensorKey, tensor: &Tensor) -> Result<usize> {
    if tensor.rank() < 2 {
        return Err(SegaError::shape_mismatch(
            key,
            format!("expected a batch-first tensor of rank >= 2, got {:?}", tensor.dims()),
        ));
    }
    Ok(tensor.dim(SEQ_DIM)?)
}

/// Append `num_repeats` copies of `empty` to `tensor` along the sequence dim.
///
/// `empty` is broadcast over the batch of `tensor`, matching the host padding
/// of its own batched conditioning.
pub fn pad_cond(
    key: &TensorKey,
    tensor: &Tensor,
    num_repeats: usize,
    empty: &Tensor,
) -> Result<Tensor> {
    if num_repeats == 0 {
        return Ok(tensor.clone());
    }
    let dims = tensor.dims();
    let empty_dims = empty.dims();
    if empty_dims.len() != dims.len() || empty_dims[SEQ_DIM + 1..] != dims[SEQ_DIM + 1..] {
        return Err(SegaError::shape_mismatch(
            key,
            format!("empty prompt {empty_dims:?} cannot pad conditioning {dims:?}"),
        ));
    }

    let mut target = dims.to_vec();
    target[SEQ_DIM] = empty_dims[SEQ_DIM];
    let empty = empty
        .to_device(tensor.device())?
        .to_dtype(tensor.dtype())?
        .broadcast_as(target)
        .map_err(|e| SegaError::shape_mismatch(key, format!("empty prompt batch: {e}")))?
        .contiguous()?;

    let mut parts = Vec::with_capacity(num_repeats + 1);
    parts.push(tensor.clone());
    parts.extend(std::iter::repeat_n(empty, num_repeats));
    Ok(Tensor::cat(&parts, SEQ_DIM)?)
}

/// Number of empty-prompt chunks that bring a length up to `target`.
fn repeats_to(key: &TensorKey, len: usize, target: usize, len_empty: usize) -> Result<usize> {
    if len > target {
        return Err(SegaError::shape_mismatch(
            key,
            format!("length {len} exceeds reconciled length {target}"),
        ));
    }
    let diff = target - len;
    if diff == 0 {
        return Ok(0);
    }
    if len_empty == 0 || diff % len_empty != 0 {
        return Err(SegaError::IncompatibleConditioningShape {
            key: key.clone(),
            len_a: target,
            len_b: len,
            len_empty,
        });
    }
    Ok(diff / len_empty)
}

/// Pad `tensor` up to `target` sequence length.
pub fn reconcile_to(
    key: &TensorKey,
    tensor: &Tensor,
    target: usize,
    empty: &Tensor,
) -> Result<Tensor> {
    let len = seq_len(key, tensor)?;
    if len == target {
        return Ok(tensor.clone());
    }
    let len_empty = seq_len(key, empty)?;
    let num_repeats = repeats_to(key, len, target, len_empty)?;
    pad_cond(key, tensor, num_repeats, empty)
}

/// Equalize the sequence length of two tensors by padding the shorter one.
///
/// Returns the reconciled pair and whether any padding happened.
pub fn reconcile_pair(
    key: &TensorKey,
    a: &Tensor,
    b: &Tensor,
    empty: &Tensor,
) -> Result<(Tensor, Tensor, bool)> {
    let len_a = seq_len(key, a)?;
    let len_b = seq_len(key, b)?;
    if len_a == len_b {
        return Ok((a.clone(), b.clone(), false));
    }

    let len_empty = seq_len(key, empty)?;
    let diff = len_a.abs_diff(len_b);
    if len_empty == 0 || diff % len_empty != 0 {
        return Err(SegaError::IncompatibleConditioningShape {
            key: key.clone(),
            len_a,
            len_b,
            len_empty,
        });
    }

    let num_repeats = diff / len_empty;
    if len_a < len_b {
        Ok((pad_cond(key, a, num_repeats, empty)?, b.clone(), true))
    } else {
        Ok((a.clone(), pad_cond(key, b, num_repeats, empty)?, true))
    }
}

/// Common sequence length of a set of tensors, validated against `len_empty`.
///
/// Every length must reach the longest one in whole empty-prompt chunks.
pub fn common_len(key: &TensorKey, lens: &[usize], len_empty: Option<usize>) -> Result<usize> {
    let Some(&target) = lens.iter().max() else {
        return Err(SegaError::shape_mismatch(key, "no tensors to reconcile"));
    };
    if lens.iter().any(|&len| len != target) {
        let Some(len_empty) = len_empty else {
            return Err(SegaError::MissingEmptyPrompt(key.clone()));
        };
        for &len in lens {
            repeats_to(key, len, target, len_empty)?;
        }
    }
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::{DType, Device, IndexOp};

    fn key() -> TensorKey {
        TensorKey::CROSSATTN
    }

    #[test]
    fn test_pad_cond_appends_empty() -> Result<()> {
        let device = Device::Cpu;
        let cond = Tensor::ones((2, 4, 3), DType::F32, &device)?;
        let empty = Tensor::full(7f32, (1, 2, 3), &device)?;

        let padded = pad_cond(&key(), &cond, 2, &empty)?;
        assert_eq!(padded.dims(), &[2, 8, 3]);

        let tail = padded.i((.., 4.., ..))?.flatten_all()?.to_vec1::<f32>()?;
        assert!(tail.iter().all(|&v| v == 7.0));
        let head = padded.i((.., ..4, ..))?.flatten_all()?.to_vec1::<f32>()?;
        assert!(head.iter().all(|&v| v == 1.0));
        Ok(())
    }

    #[test]
    fn test_reconcile_pair_pads_shorter_side() -> Result<()> {
        let device = Device::Cpu;
        let empty = Tensor::zeros((1, 77, 8), DType::F32, &device)?;
        let short = Tensor::ones((1, 77, 8), DType::F32, &device)?;
        let long = Tensor::ones((1, 231, 8), DType::F32, &device)?;

        let (a, b, padded) = reconcile_pair(&key(), &short, &long, &empty)?;
        assert!(padded);
        assert_eq!(a.dims(), &[1, 231, 8]);
        assert_eq!(b.dims(), &[1, 231, 8]);

        let (a, b, padded) = reconcile_pair(&key(), &long, &short, &empty)?;
        assert!(padded);
        assert_eq!(a.dims(), b.dims());

        let (_, _, padded) = reconcile_pair(&key(), &short, &short, &empty)?;
        assert!(!padded);
        Ok(())
    }

    #[test]
    fn test_non_divisible_difference_is_fatal() -> Result<()> {
        let device = Device::Cpu;
        let empty = Tensor::zeros((1, 77, 8), DType::F32, &device)?;
        let a = Tensor::ones((1, 77, 8), DType::F32, &device)?;
        let b = Tensor::ones((1, 100, 8), DType::F32, &device)?;

        let err = reconcile_pair(&key(), &a, &b, &empty).unwrap_err();
        assert!(matches!(
            err,
            SegaError::IncompatibleConditioningShape {
                len_a: 77,
                len_b: 100,
                len_empty: 77,
                ..
            }
        ));

        assert!(reconcile_to(&key(), &a, 100, &empty).is_err());
        assert!(common_len(&key(), &[77, 100], Some(77)).is_err());
        Ok(())
    }

    #[test]
    fn test_padding_round_trip() -> Result<()> {
        let device = Device::Cpu;
        let original = Tensor::arange(0f32, 24., &device)?.reshape((2, 3, 4))?;
        let empty = Tensor::full(-1f32, (1, 3, 4), &device)?;

        let padded = reconcile_to(&key(), &original, 9, &empty)?;
        assert_eq!(padded.dims(), &[2, 9, 4]);

        let recovered = padded.narrow(SEQ_DIM, 0, 3)?;
        assert_eq!(
            recovered.flatten_all()?.to_vec1::<f32>()?,
            original.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }

    #[test]
    fn test_common_len() -> Result<()> {
        assert_eq!(common_len(&key(), &[77, 77], None)?, 77);
        assert_eq!(common_len(&key(), &[77, 154, 231], Some(77))?, 231);
        assert!(matches!(
            common_len(&key(), &[77, 154], None),
            Err(SegaError::MissingEmptyPrompt(_))
        ));
        Ok(())
    }

    #[test]
    fn test_rank_one_rejected() -> Result<()> {
        let t = Tensor::zeros(8, DType::F32, &Device::Cpu)?;
        assert!(matches!(
            seq_len(&key(), &t),
            Err(SegaError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
