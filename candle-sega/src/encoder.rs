//! Concept encoding through the host text encoder.
//!
//! The host owns the text encoder; this module only describes what is asked
//! of it and memoizes the answers for the lifetime of one generation request.

use std::collections::HashMap;

use crate::conditioning::ScheduledConditioning;
use crate::error::Result;

/// Everything that determines the conditioning a host produces for a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EncodeRequest {
    /// One prompt per image of the batch.
    pub prompts: Vec<String>,
    pub width: usize,
    pub height: usize,
    /// Total number of sampling steps, used by host prompt schedules.
    pub steps: usize,
}

impl EncodeRequest {
    /// Request `batch_size` copies of a single concept prompt.
    pub fn for_concept(
        concept: &str,
        batch_size: usize,
        width: usize,
        height: usize,
        steps: usize,
    ) -> Self {
        Self {
            prompts: vec![concept.to_string(); batch_size],
            width,
            height,
            steps,
        }
    }
}

/// Host text-to-conditioning encoder.
pub trait TextEncoder {
    fn encode(&mut self, request: &EncodeRequest) -> candle::Result<ScheduledConditioning>;
}

impl<E: TextEncoder + ?Sized> TextEncoder for &mut E {
    fn encode(&mut self, request: &EncodeRequest) -> candle::Result<ScheduledConditioning> {
        (**self).encode(request)
    }
}

/// A semantic guidance target and its conditioning over the schedule.
#[derive(Debug, Clone)]
pub struct Concept {
    prompt: String,
    conditioning: ScheduledConditioning,
}

impl Concept {
    pub fn new(prompt: impl Into<String>, conditioning: ScheduledConditioning) -> Self {
        Self {
            prompt: prompt.into(),
            conditioning,
        }
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn conditioning(&self) -> &ScheduledConditioning {
        &self.conditioning
    }
}

/// Memoizes host encodings keyed by the exact request.
#[derive(Debug, Default)]
pub struct CachedConceptEncoder {
    cache: HashMap<EncodeRequest, ScheduledConditioning>,
    hits: usize,
}

impl CachedConceptEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode a concept, reusing an earlier result for an identical request.
    pub fn encode<E: TextEncoder + ?Sized>(
        &mut self,
        encoder: &mut E,
        concept: &str,
        batch_size: usize,
        width: usize,
        height: usize,
        steps: usize,
    ) -> Result<ScheduledConditioning> {
        let request = EncodeRequest::for_concept(concept, batch_size, width, height, steps);
        if let Some(cached) = self.cache.get(&request) {
            self.hits += 1;
            tracing::trace!(concept, "concept conditioning served from cache");
            return Ok(cached.clone());
        }

        let encoded = encoder.encode(&request)?;
        self.cache.insert(request, encoded.clone());
        Ok(encoded)
    }

    /// Encode a concept prompt into a [`Concept`].
    pub fn encode_concept<E: TextEncoder + ?Sized>(
        &mut self,
        encoder: &mut E,
        concept: &str,
        batch_size: usize,
        width: usize,
        height: usize,
        steps: usize,
    ) -> Result<Concept> {
        let conditioning = self.encode(encoder, concept, batch_size, width, height, steps)?;
        Ok(Concept::new(concept, conditioning))
    }

    /// Number of requests answered without calling the host.
    pub fn hits(&self) -> usize {
        self.hits
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
        self.hits = 0;
    }
}
