//! Conditioning containers exchanged with the host.
//!
//! A prompt is encoded into one tensor per conditioning slot (`crossattn` for
//! the cross-attention context, `vector` for pooled embeddings on SDXL-style
//! models, ...). Each slot is addressed by a [`TensorKey`] and tensors are
//! batch-first with the sequence dimension at dim 1.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;

use candle::Tensor;

/// Sequence dimension of every conditioning tensor.
pub const SEQ_DIM: usize = 1;

/// Identifier of a conditioning slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorKey(Cow<'static, str>);

impl TensorKey {
    /// Cross-attention context (`[batch, tokens, dim]`).
    pub const CROSSATTN: TensorKey = TensorKey(Cow::Borrowed("crossattn"));
    /// Pooled vector conditioning (`[batch, dim]`).
    pub const VECTOR: TensorKey = TensorKey(Cow::Borrowed("vector"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TensorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&'static str> for TensorKey {
    fn from(name: &'static str) -> Self {
        Self::new(name)
    }
}

/// Ordered mapping from tensor-group key to conditioning tensor.
#[derive(Debug, Clone, Default)]
pub struct ConditioningGroup {
    tensors: BTreeMap<TensorKey, Tensor>,
}

impl ConditioningGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group holding a single cross-attention tensor.
    pub fn crossattn(tensor: Tensor) -> Self {
        let mut group = Self::new();
        group.insert(TensorKey::CROSSATTN, tensor);
        group
    }

    pub fn insert(&mut self, key: TensorKey, tensor: Tensor) -> Option<Tensor> {
        self.tensors.insert(key, tensor)
    }

    pub fn get(&self, key: &TensorKey) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    pub fn contains_key(&self, key: &TensorKey) -> bool {
        self.tensors.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &TensorKey> {
        self.tensors.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&TensorKey, &Tensor)> {
        self.tensors.iter()
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl FromIterator<(TensorKey, Tensor)> for ConditioningGroup {
    fn from_iter<I: IntoIterator<Item = (TensorKey, Tensor)>>(iter: I) -> Self {
        Self {
            tensors: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for ConditioningGroup {
    type Item = (TensorKey, Tensor);
    type IntoIter = std::collections::btree_map::IntoIter<TensorKey, Tensor>;

    fn into_iter(self) -> Self::IntoIter {
        self.tensors.into_iter()
    }
}

/// One entry of a prompt schedule: conditioning valid up to `end_at_step`.
#[derive(Debug, Clone)]
pub struct ScheduledCond {
    pub end_at_step: usize,
    pub cond: ConditioningGroup,
}

/// Conditioning for one prompt across the sampling schedule.
///
/// Hosts that support prompt editing return several entries; plain prompts
/// return a single entry covering every step.
#[derive(Debug, Clone, Default)]
pub struct ScheduledConditioning {
    schedule: Vec<ScheduledCond>,
}

impl ScheduledConditioning {
    pub fn new(schedule: Vec<ScheduledCond>) -> Self {
        Self { schedule }
    }

    /// Conditioning that does not change over the schedule.
    pub fn constant(cond: ConditioningGroup, steps: usize) -> Self {
        Self::new(vec![ScheduledCond {
            end_at_step: steps,
            cond,
        }])
    }

    /// Conditioning active at `step`: the first entry ending at or after it,
    /// otherwise the last entry.
    pub fn at_step(&self, step: usize) -> Option<&ConditioningGroup> {
        self.schedule
            .iter()
            .find(|entry| entry.end_at_step >= step)
            .or_else(|| self.schedule.last())
            .map(|entry| &entry.cond)
    }

    pub fn entries(&self) -> &[ScheduledCond] {
        &self.schedule
    }

    pub fn is_empty(&self) -> bool {
        self.schedule.is_empty()
    }
}
