//! Per-concept momentum across sampling steps.
//!
//! Each concept carries one velocity tensor per tensor-group key. At every
//! step the velocity is folded into the raw edit direction and then updated:
//!
//! ```text
//! adjusted = raw + momentum_scale × v_t
//! v_{t+1}  = momentum_beta × ((1 - momentum_beta) × v_t) × adjusted
//! ```
//!
//! The update is element-wise multiplicative in both `v_t` and `adjusted`.
//! Starting from `v_0 = 0` the velocity therefore stays zero; this mirrors the
//! reference behavior and is kept as is.

use std::collections::BTreeMap;

use candle::{DType, Tensor};

use crate::conditioning::{TensorKey, SEQ_DIM};
use crate::error::{Result, SegaError};

/// Velocity tensors of one concept, keyed by tensor group.
#[derive(Debug, Clone, Default)]
pub struct MomentumState {
    velocity: BTreeMap<TensorKey, Tensor>,
}

impl MomentumState {
    pub fn get(&self, key: &TensorKey) -> Option<&Tensor> {
        self.velocity.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TensorKey> {
        self.velocity.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.velocity.is_empty()
    }
}

/// Smooths the edit directions of one concept across steps.
#[derive(Debug, Clone, Default)]
pub struct MomentumTracker {
    state: MomentumState,
}

impl MomentumTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a zero velocity for `key` shaped like `direction`.
    ///
    /// Existing entries are left untouched.
    pub fn initialize(&mut self, key: &TensorKey, direction: &Tensor) -> Result<()> {
        if !self.state.velocity.contains_key(key) {
            let zeros = Tensor::zeros(direction.shape(), DType::F32, direction.device())?;
            self.state.velocity.insert(key.clone(), zeros);
        }
        Ok(())
    }

    pub fn is_initialized(&self, key: &TensorKey) -> bool {
        self.state.velocity.contains_key(key)
    }

    pub fn state(&self) -> &MomentumState {
        &self.state
    }

    /// Fold the velocity of `key` into `raw_direction` and advance it.
    ///
    /// Returns the adjusted direction and the new velocity, which is also
    /// stored for the next step.
    pub fn update(
        &mut self,
        key: &TensorKey,
        raw_direction: &Tensor,
        momentum_scale: f64,
        momentum_beta: f64,
    ) -> Result<(Tensor, Tensor)> {
        let Some(v_t) = self.state.velocity.get(key) else {
            return Err(SegaError::shape_mismatch(key, "velocity used before initialization"));
        };
        let raw_direction = raw_direction.to_dtype(DType::F32)?;
        let v_t = fit_velocity(key, v_t, raw_direction.dims())?;

        let adjusted = (&raw_direction + (&v_t * momentum_scale)?)?;
        let v_t_1 = (((&v_t * (1.0 - momentum_beta))? * momentum_beta)? * &adjusted)?;

        self.state.velocity.insert(key.clone(), v_t_1.clone());
        Ok((adjusted, v_t_1))
    }

    /// Drop all velocity state.
    pub fn reset(&mut self) {
        self.state.velocity.clear();
    }
}

/// Bring a stored velocity to the shape of the current direction.
///
/// Only the sequence dimension may change between steps; a longer sequence is
/// zero-padded and a shorter one is narrowed.
fn fit_velocity(key: &TensorKey, v_t: &Tensor, dims: &[usize]) -> Result<Tensor> {
    let v_dims = v_t.dims();
    if v_dims == dims {
        return Ok(v_t.clone());
    }
    let same_outside_seq = v_dims.len() == dims.len()
        && v_dims.len() > SEQ_DIM
        && v_dims
            .iter()
            .zip(dims)
            .enumerate()
            .all(|(i, (a, b))| i == SEQ_DIM || a == b);
    if !same_outside_seq {
        return Err(SegaError::shape_mismatch(
            key,
            format!("velocity {v_dims:?} does not match direction {dims:?}"),
        ));
    }

    let (have, want) = (v_dims[SEQ_DIM], dims[SEQ_DIM]);
    tracing::debug!(%key, have, want, "resizing velocity to new sequence length");
    if want < have {
        return Ok(v_t.narrow(SEQ_DIM, 0, want)?);
    }
    let mut pad_dims = v_dims.to_vec();
    pad_dims[SEQ_DIM] = want - have;
    let pad = Tensor::zeros(pad_dims, v_t.dtype(), v_t.device())?;
    Ok(Tensor::cat(&[v_t, &pad], SEQ_DIM)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle::Device;

    fn scalar(t: &Tensor) -> Result<f32> {
        Ok(t.flatten_all()?.get(0)?.to_scalar::<f32>()?)
    }

    #[test]
    fn test_update_requires_initialization() -> Result<()> {
        let mut tracker = MomentumTracker::new();
        let dir = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu)?;
        assert!(tracker.update(&TensorKey::CROSSATTN, &dir, 1.0, 0.5).is_err());

        tracker.initialize(&TensorKey::CROSSATTN, &dir)?;
        assert!(tracker.is_initialized(&TensorKey::CROSSATTN));
        let (adjusted, velocity) = tracker.update(&TensorKey::CROSSATTN, &dir, 1.0, 0.5)?;
        // Zero initial velocity leaves the direction unchanged
        assert_eq!(scalar(&adjusted)?, 1.0);
        assert_eq!(scalar(&velocity)?, 0.0);
        Ok(())
    }

    #[test]
    fn test_multiplicative_recurrence_from_nonzero_velocity() -> Result<()> {
        let device = Device::Cpu;
        let key = TensorKey::CROSSATTN;
        let mut tracker = MomentumTracker::new();
        let shape = (1, 1, 1);
        tracker.initialize(&key, &Tensor::zeros(shape, DType::F32, &device)?)?;
        tracker
            .state
            .velocity
            .insert(key.clone(), Tensor::full(2f32, shape, &device)?);

        let (ms, mb) = (0.5, 0.25);
        let d = Tensor::full(3f32, shape, &device)?;
        let (adjusted, v1) = tracker.update(&key, &d, ms, mb)?;
        // adj = 3 + 0.5 * 2 = 4 ; v1 = 0.25 * 0.75 * 2 * 4 = 1.5
        assert_eq!(scalar(&adjusted)?, 4.0);
        assert_eq!(scalar(&v1)?, 1.5);

        let (adjusted, v2) = tracker.update(&key, &d, ms, mb)?;
        // adj = 3 + 0.75 = 3.75 ; v2 = 0.1875 * 1.5 * 3.75
        assert_eq!(scalar(&adjusted)?, 3.75);
        assert!((scalar(&v2)? - 0.1875 * 1.5 * 3.75).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_velocity_follows_sequence_length() -> Result<()> {
        let device = Device::Cpu;
        let key = TensorKey::CROSSATTN;
        let mut tracker = MomentumTracker::new();
        tracker.initialize(&key, &Tensor::zeros((1, 2, 3), DType::F32, &device)?)?;

        let longer = Tensor::ones((1, 4, 3), DType::F32, &device)?;
        let (adjusted, velocity) = tracker.update(&key, &longer, 1.0, 0.5)?;
        assert_eq!(adjusted.dims(), &[1, 4, 3]);
        assert_eq!(velocity.dims(), &[1, 4, 3]);

        let wrong_batch = Tensor::ones((2, 4, 3), DType::F32, &device)?;
        assert!(tracker.update(&key, &wrong_batch, 1.0, 0.5).is_err());

        tracker.reset();
        assert!(tracker.state().is_empty());
        Ok(())
    }
}
