//! Error type for semantic guidance.

use crate::conditioning::TensorKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SegaError {
    /// Tensor op or host encoder failure, propagated unchanged.
    #[error(transparent)]
    Candle(#[from] candle::Error),

    /// A key is missing on one side, or its tensors cannot be combined.
    #[error("shape mismatch for tensor group '{key}': {reason}")]
    ShapeMismatch { key: TensorKey, reason: String },

    /// The length difference is not a whole number of empty-prompt chunks.
    #[error(
        "incompatible conditioning shape for '{key}': lengths {len_a} and {len_b} \
         differ by a non-multiple of the empty prompt length {len_empty}"
    )]
    IncompatibleConditioningShape {
        key: TensorKey,
        len_a: usize,
        len_b: usize,
        len_empty: usize,
    },

    #[error("host provided no empty-prompt padding for tensor group '{0}'")]
    MissingEmptyPrompt(TensorKey),

    #[error("invalid guidance config: {0}")]
    InvalidConfig(String),

    #[error("statistics error: {0}")]
    Statistics(String),
}

impl SegaError {
    pub(crate) fn shape_mismatch(key: &TensorKey, reason: impl Into<String>) -> Self {
        Self::ShapeMismatch {
            key: key.clone(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, SegaError>;
