//! Lifecycle of semantic guidance for one generation request.
//!
//! A [`SegaSession`] is owned by the generation request. The host calls
//! [`SegaSession::attach`] before sampling, [`SegaSession::on_cfg_denoiser`]
//! once per denoising step and [`SegaSession::detach`] when the request ends.
//!
//! ```ignore
//! let mut session = SegaSession::new(options);
//! session.attach(&mut host, &request)?;
//!
//! for step in 0..steps {
//!     let outcome = session.on_cfg_denoiser(&StepContext { .. })?;
//!     let noise_pred = denoise(&latents, &outcome.text_cond, &outcome.text_uncond)?;
//!     latents = scheduler.step(&noise_pred, &latents)?;
//! }
//!
//! session.detach();
//! ```

use crate::conditioning::ConditioningGroup;
use crate::config::SegaOptions;
use crate::encoder::{CachedConceptEncoder, Concept, TextEncoder};
use crate::error::Result;
use crate::hook::{StepContext, StepHook, StepOutcome};
use crate::prompt::parse_concept_prompt;

/// Services a host application provides to semantic guidance.
pub trait SegaHost: TextEncoder {
    /// Empty-prompt conditioning per tensor-group key, used as padding.
    fn empty_prompt(&self) -> candle::Result<ConditioningGroup>;

    /// Store the guidance parameters alongside the generation metadata.
    fn record_generation_params(&mut self, _params: &[(&'static str, String)]) {}
}

/// Shape of the generation request the concepts are encoded for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationRequest {
    pub batch_size: usize,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
}

/// Semantic guidance state owned by one generation request.
#[derive(Debug)]
pub struct SegaSession {
    options: SegaOptions,
    encoder: CachedConceptEncoder,
    hook: Option<StepHook>,
}

impl SegaSession {
    pub fn new(options: SegaOptions) -> Self {
        Self {
            options,
            encoder: CachedConceptEncoder::new(),
            hook: None,
        }
    }

    pub fn options(&self) -> &SegaOptions {
        &self.options
    }

    pub fn is_attached(&self) -> bool {
        self.hook.is_some()
    }

    /// Concepts of the attached request.
    pub fn concepts(&self) -> &[Concept] {
        self.hook.as_ref().map(StepHook::concepts).unwrap_or_default()
    }

    pub fn hook(&self) -> Option<&StepHook> {
        self.hook.as_ref()
    }

    /// Encode the concepts and start guiding.
    ///
    /// Returns `Ok(false)` without touching the host when guidance is inactive
    /// or the prompt names no concept.
    pub fn attach<H: SegaHost + ?Sized>(
        &mut self,
        host: &mut H,
        request: &GenerationRequest,
    ) -> Result<bool> {
        if !self.options.active {
            tracing::debug!("semantic guidance inactive");
            return Ok(false);
        }
        let prompts = parse_concept_prompt(&self.options.prompt);
        if prompts.is_empty() {
            tracing::debug!("semantic guidance has no concepts, skipping");
            return Ok(false);
        }
        self.options.guidance.validate()?;
        if self.hook.is_some() {
            self.detach();
        }

        host.record_generation_params(&self.options.generation_params());

        let mut concepts = Vec::with_capacity(prompts.len());
        for prompt in &prompts {
            concepts.push(self.encoder.encode_concept(
                host,
                prompt,
                request.batch_size,
                request.width,
                request.height,
                request.steps,
            )?);
        }
        let empty_prompt = host.empty_prompt()?;

        tracing::debug!(concepts = ?prompts, "hooked semantic guidance");
        self.hook = Some(StepHook::new(
            self.options.guidance.clone(),
            concepts,
            empty_prompt,
        ));
        Ok(true)
    }

    /// Per-step callback. Passes the conditioning through when not attached.
    pub fn on_cfg_denoiser(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        match self.hook.as_mut() {
            Some(hook) => hook.on_step(ctx),
            None => Ok(StepOutcome::passthrough(ctx)),
        }
    }

    /// Release momentum state, concepts and cached encodings.
    pub fn detach(&mut self) {
        if self.hook.take().is_some() {
            tracing::debug!("unhooked semantic guidance");
        }
        self.encoder.clear();
    }
}

impl Drop for SegaSession {
    fn drop(&mut self) {
        self.detach();
    }
}
