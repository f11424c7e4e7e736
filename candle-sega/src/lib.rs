//! SEGA: Semantic Guidance for diffusion samplers.
//!
//! Steers the denoising of a text-to-image diffusion model toward (or away
//! from) named concepts without retraining. The host keeps its model and its
//! sampling loop; once per step it hands its conditioned and unconditioned
//! text conditioning to a [`SegaSession`] and continues with the guided
//! conditioning it gets back.
//!
//! # Per-step algorithm
//!
//! ```text
//! concept prompts ──► host text encoder ──► concept conditioning (cached)
//!                                                   │
//! text_uncond ───────────────┬──────────────────────┤
//!                            ▼                      ▼
//!                 reconcile sequence lengths (empty-prompt padding)
//!                            │
//!                 diff = concept - uncond
//!                 keep |diff| > mean + Φ⁻¹(1 - tail) × std, scale it
//!                            │
//!                 momentum:  adj = dir + ms × v ;  v ← mb × (1 - mb) × v × adj
//!                            │
//! text_cond ───────────────► + Σ adj   (only once the warmup has elapsed)
//! ```
//!
//! # Modules
//!
//! - [`config`]: guidance knobs, user options and the metadata echo
//! - [`conditioning`]: tensor-group keys and conditioning containers
//! - [`encoder`]: host text-encoder seam and the per-request cache
//! - [`reconcile`]: sequence-length reconciliation
//! - [`edit_direction`]: thresholded edit directions
//! - [`momentum`]: per-concept velocity across steps
//! - [`accumulator`]: summing concepts and injecting into the conditioning
//! - [`hook`]: the per-step orchestration
//! - [`session`]: attach/detach lifecycle owned by a generation request
//!
//! # References
//!
//! - Paper: Brack et al., "SEGA: Instructing Text-to-Image Models using
//!   Semantic Guidance", <https://arxiv.org/abs/2301.12247>

pub mod accumulator;
pub mod conditioning;
pub mod config;
pub mod debug;
pub mod edit_direction;
pub mod encoder;
pub mod error;
pub mod hook;
pub mod momentum;
pub mod prompt;
pub mod reconcile;
pub mod session;

pub use accumulator::GuidanceAccumulator;
pub use conditioning::{ConditioningGroup, ScheduledCond, ScheduledConditioning, TensorKey, SEQ_DIM};
pub use config::{GuidanceConfig, SegaOptions};
pub use edit_direction::{compute_edit_direction, guidance_strength, selection_mask, tail_z_score};
pub use encoder::{CachedConceptEncoder, Concept, EncodeRequest, TextEncoder};
pub use error::{Result, SegaError};
pub use hook::{StepContext, StepHook, StepOutcome};
pub use momentum::{MomentumState, MomentumTracker};
pub use prompt::parse_concept_prompt;
pub use reconcile::{pad_cond, reconcile_pair, reconcile_to};
pub use session::{GenerationRequest, SegaHost, SegaSession};
