//! Per-step orchestration of semantic guidance.
//!
//! [`StepHook`] runs once per denoising step, between the host's prompt
//! reconstruction and its noise prediction:
//!
//! ```text
//! text_cond, text_uncond, concepts[step]
//!        │
//!        ├── reconcile sequence lengths per key (empty-prompt padding)
//!        ├── stack concepts per key → thresholded edit directions
//!        ├── per concept: momentum update → adjusted direction
//!        └── sum adjusted directions in concept order → inject after warmup
//!        ↓
//! StepOutcome { text_cond', text_uncond' }
//! ```
//!
//! The hook never mutates host tensors; the host continues with the returned
//! groups.

use std::collections::BTreeMap;

use candle::Tensor;

use crate::accumulator::GuidanceAccumulator;
use crate::conditioning::{ConditioningGroup, TensorKey};
use crate::config::GuidanceConfig;
use crate::debug::debug_tensor;
use crate::edit_direction::{compute_edit_direction, guidance_strength};
use crate::encoder::Concept;
use crate::error::{Result, SegaError};
use crate::momentum::MomentumTracker;
use crate::reconcile::{common_len, reconcile_to, seq_len};

/// Inputs the host supplies for one denoising step.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub sampling_step: usize,
    pub total_sampling_steps: usize,
    /// Latent batch being denoised.
    pub x: &'a Tensor,
    pub text_cond: &'a ConditioningGroup,
    pub text_uncond: &'a ConditioningGroup,
}

/// Conditioning the host should use for this step's noise prediction.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub text_cond: ConditioningGroup,
    pub text_uncond: ConditioningGroup,
    /// Whether cond or uncond had to be padded to a common length.
    pub padded: bool,
    /// Whether the warmup had elapsed and at least one concept contributed
    /// a delta to `text_cond`. The delta itself may be all zeros.
    pub injected: bool,
}

impl StepOutcome {
    /// Hand the host's conditioning back untouched.
    pub fn passthrough(ctx: &StepContext<'_>) -> Self {
        Self {
            text_cond: ctx.text_cond.clone(),
            text_uncond: ctx.text_uncond.clone(),
            padded: false,
            injected: false,
        }
    }
}

/// Stateful guidance for one generation request.
#[derive(Debug)]
pub struct StepHook {
    config: GuidanceConfig,
    concepts: Vec<Concept>,
    trackers: Vec<MomentumTracker>,
    empty_prompt: ConditioningGroup,
    /// Tensor-group keys, fixed by the unconditioned group of the first step.
    keys: Option<Vec<TensorKey>>,
    last_step: Option<usize>,
    span: tracing::Span,
}

impl StepHook {
    /// `empty_prompt` holds the host's empty-prompt conditioning per key, used
    /// to pad shorter sequences.
    pub fn new(
        config: GuidanceConfig,
        concepts: Vec<Concept>,
        empty_prompt: ConditioningGroup,
    ) -> Self {
        let trackers = vec![MomentumTracker::new(); concepts.len()];
        let span = tracing::span!(tracing::Level::TRACE, "sega-step");
        Self {
            config,
            concepts,
            trackers,
            empty_prompt,
            keys: None,
            last_step: None,
            span,
        }
    }

    pub fn config(&self) -> &GuidanceConfig {
        &self.config
    }

    pub fn concepts(&self) -> &[Concept] {
        &self.concepts
    }

    /// Momentum tracker of the concept at `index`.
    pub fn tracker(&self, index: usize) -> Option<&MomentumTracker> {
        self.trackers.get(index)
    }

    /// Keys discovered at the first step, if it already ran.
    pub fn keys(&self) -> Option<&[TensorKey]> {
        self.keys.as_deref()
    }

    /// Run semantic guidance for one step.
    pub fn on_step(&mut self, ctx: &StepContext<'_>) -> Result<StepOutcome> {
        let span = self.span.clone();
        let _enter = span.enter();

        let step = ctx.sampling_step;
        let warmup_steps = self.config.warmup_steps(ctx.total_sampling_steps);
        let strength = guidance_strength(step, warmup_steps);
        if let Some(last) = self.last_step {
            if step < last {
                tracing::warn!(step, last, "sampling step went backwards, momentum may be stale");
            }
        }
        self.last_step = Some(step);

        let keys = self.guidance_keys(ctx.text_uncond)?;
        for key in ctx.text_cond.keys() {
            if !ctx.text_uncond.contains_key(key) {
                return Err(SegaError::shape_mismatch(
                    key,
                    "present in the conditioned group but not in the unconditioned baseline",
                ));
            }
        }

        let mut concept_conds = Vec::with_capacity(self.concepts.len());
        for concept in &self.concepts {
            let cond = concept.conditioning().at_step(step).ok_or_else(|| {
                SegaError::InvalidConfig(format!("concept '{}' has no conditioning", concept.prompt()))
            })?;
            if let Some(key) = cond.keys().find(|k| !ctx.text_uncond.contains_key(k)) {
                return Err(SegaError::shape_mismatch(
                    key,
                    format!(
                        "concept '{}' carries a tensor group missing from the unconditioned baseline",
                        concept.prompt()
                    ),
                ));
            }
            concept_conds.push(cond);
        }

        let mut text_cond = ConditioningGroup::new();
        let mut text_uncond = ConditioningGroup::new();
        let mut padded = false;
        let mut raw_directions: Vec<BTreeMap<TensorKey, Tensor>> =
            vec![BTreeMap::new(); self.concepts.len()];

        for key in &keys {
            let uncond = ctx
                .text_uncond
                .get(key)
                .ok_or_else(|| SegaError::shape_mismatch(key, "missing from the unconditioned baseline"))?;
            let cond = ctx.text_cond.get(key);
            let members: Vec<(usize, &Tensor)> = concept_conds
                .iter()
                .enumerate()
                .filter_map(|(i, group)| group.get(key).map(|t| (i, t)))
                .collect();
            if cond.is_none() && !members.is_empty() {
                return Err(SegaError::shape_mismatch(
                    key,
                    "concepts guide a tensor group the conditioned batch does not have",
                ));
            }

            // Bring uncond, cond and every concept of this key to one length
            let uncond_len = seq_len(key, uncond)?;
            let mut lens = vec![uncond_len];
            if let Some(cond) = cond {
                lens.push(seq_len(key, cond)?);
            }
            for (_, t) in &members {
                lens.push(seq_len(key, t)?);
            }
            let empty = self.empty_prompt.get(key);
            let len_empty = empty.map(|e| seq_len(key, e)).transpose()?;
            let target = common_len(key, &lens, len_empty)?;
            let pad = |t: &Tensor| -> Result<Tensor> {
                match empty {
                    Some(empty) => reconcile_to(key, t, target, empty),
                    None => Ok(t.clone()),
                }
            };

            let uncond = pad(uncond)?;
            padded |= uncond_len != target;
            if let Some(cond) = cond {
                padded |= seq_len(key, cond)? != target;
                text_cond.insert(key.clone(), pad(cond)?);
            }
            text_uncond.insert(key.clone(), uncond.clone());
            if members.is_empty() {
                continue;
            }

            let stacked = members
                .iter()
                .map(|&(_, t)| pad(t))
                .collect::<Result<Vec<_>>>()?;
            let stacked = Tensor::stack(&stacked, 0)
                .map_err(|e| SegaError::shape_mismatch(key, format!("stacking concepts: {e}")))?;
            stacked
                .shape()
                .broadcast_shape_binary_op(uncond.shape(), "edit_direction")
                .map_err(|e| SegaError::shape_mismatch(key, format!("concept vs baseline: {e}")))?;

            let directions = compute_edit_direction(
                &stacked,
                &uncond,
                self.config.tail_percentage_threshold,
                self.config.edit_guidance_scale,
                strength,
            )?;
            debug_tensor(&format!("{key}/edit_direction"), &directions);
            for (j, (concept_idx, _)) in members.iter().enumerate() {
                raw_directions[*concept_idx].insert(key.clone(), directions.get(j)?);
            }
        }

        // Zero velocities for every (concept, key) pair before any update
        for (tracker, directions) in self.trackers.iter_mut().zip(&raw_directions) {
            for (key, direction) in directions {
                tracker.initialize(key, direction)?;
            }
        }

        let (momentum_scale, momentum_beta) = (self.config.momentum_scale, self.config.momentum_beta);
        let mut accumulator = GuidanceAccumulator::new();
        for (tracker, directions) in self.trackers.iter_mut().zip(&raw_directions) {
            for (key, direction) in directions {
                let (adjusted, _velocity) =
                    tracker.update(key, direction, momentum_scale, momentum_beta)?;
                accumulator.add(key, &adjusted)?;
            }
        }

        let (text_cond, injected) = accumulator.inject(&text_cond, step, warmup_steps)?;
        if injected {
            for key in &keys {
                if let Some(delta) = accumulator.delta(key) {
                    debug_tensor(&format!("{key}/injected"), delta);
                }
            }
        }
        tracing::debug!(
            step,
            total = ctx.total_sampling_steps,
            warmup_steps,
            injected,
            padded,
            x = ?ctx.x.dims(),
            "semantic guidance step"
        );

        Ok(StepOutcome {
            text_cond,
            text_uncond,
            padded,
            injected,
        })
    }

    /// Tensor-group keys of this request, discovered on the first call.
    fn guidance_keys(&mut self, uncond: &ConditioningGroup) -> Result<Vec<TensorKey>> {
        let keys = self
            .keys
            .get_or_insert_with(|| uncond.keys().cloned().collect());
        if let Some(key) = keys.iter().find(|k| !uncond.contains_key(k)) {
            return Err(SegaError::shape_mismatch(
                key,
                "missing from the unconditioned baseline of this step",
            ));
        }
        if let Some(key) = uncond.keys().find(|k| !keys.contains(k)) {
            return Err(SegaError::shape_mismatch(
                key,
                "appeared in the unconditioned baseline after the first step",
            ));
        }
        Ok(keys.clone())
    }
}
