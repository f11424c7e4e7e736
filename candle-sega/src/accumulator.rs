//! Combination and injection of concept edit directions.

use std::collections::BTreeMap;

use candle::Tensor;

use crate::conditioning::{ConditioningGroup, TensorKey};
use crate::error::{Result, SegaError};

/// Sums momentum-adjusted directions per key, in the order they are added.
#[derive(Debug, Default)]
pub struct GuidanceAccumulator {
    deltas: BTreeMap<TensorKey, Tensor>,
}

impl GuidanceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one concept's direction for `key`.
    pub fn add(&mut self, key: &TensorKey, direction: &Tensor) -> Result<()> {
        let summed = match self.deltas.get(key) {
            Some(delta) => delta
                .broadcast_add(direction)
                .map_err(|e| SegaError::shape_mismatch(key, format!("summing concepts: {e}")))?,
            None => direction.clone(),
        };
        self.deltas.insert(key.clone(), summed);
        Ok(())
    }

    /// Combined delta for `key`, if any concept contributed to it.
    pub fn delta(&self, key: &TensorKey) -> Option<&Tensor> {
        self.deltas.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }

    /// Add the accumulated deltas into `cond` once the warmup has elapsed.
    ///
    /// Returns the new conditioning and whether the deltas were applied, which
    /// holds after `warmup_steps` whenever any concept was added, even if every
    /// delta element is zero. Keys without a delta are passed through
    /// unchanged, as is everything before `warmup_steps`.
    pub fn inject(
        &self,
        cond: &ConditioningGroup,
        sampling_step: usize,
        warmup_steps: usize,
    ) -> Result<(ConditioningGroup, bool)> {
        if sampling_step < warmup_steps || self.deltas.is_empty() {
            return Ok((cond.clone(), false));
        }

        let mut guided = ConditioningGroup::new();
        for (key, tensor) in cond.iter() {
            let tensor = match self.deltas.get(key) {
                Some(delta) => add_delta(key, tensor, delta)?,
                None => tensor.clone(),
            };
            guided.insert(key.clone(), tensor);
        }
        if let Some(key) = self.deltas.keys().find(|k| !cond.contains_key(k)) {
            return Err(SegaError::shape_mismatch(
                key,
                "guidance delta has no conditioned tensor to inject into",
            ));
        }
        Ok((guided, true))
    }
}

/// `cond + delta`, computed in the delta's precision and cast back.
fn add_delta(key: &TensorKey, cond: &Tensor, delta: &Tensor) -> Result<Tensor> {
    let summed = cond
        .to_dtype(delta.dtype())?
        .broadcast_add(delta)
        .map_err(|e| SegaError::shape_mismatch(key, format!("injecting guidance: {e}")))?;
    if summed.dims() != cond.dims() {
        return Err(SegaError::shape_mismatch(
            key,
            format!(
                "guidance {:?} would reshape conditioning {:?}",
                delta.dims(),
                cond.dims()
            ),
        ));
    }
    Ok(summed.to_dtype(cond.dtype())?)
}
