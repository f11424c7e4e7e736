//! SEGA: semantic guidance on a synthetic diffusion host.
//!
//! Runs the same seeded sampling loop twice, once plain and once with semantic
//! guidance attached, and reports how far the guided latents moved.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release --example sega -- \
//!     --prompt "a portrait photo of a person" \
//!     --sega-prompt "sunglasses, smile" \
//!     --steps 20
//!
//! # Guidance knobs from a JSON file, CLI flags win
//! cargo run --release --example sega -- \
//!     --config sega.json --edit-guidance-scale 2.0
//! ```
//!
//! Set `SEGA_DEBUG=1` and `RUST_LOG=sega=debug` for per-step tensor statistics.

mod host;
mod noise;
mod scheduler;

use anyhow::{Context, Result};
use candle::{DType, Device, Tensor};
use candle_sega::debug::tensor_stats;
use candle_sega::{
    EncodeRequest, GenerationRequest, SegaOptions, SegaSession, StepContext, TextEncoder,
};
use clap::Parser;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use host::{SyntheticHost, ToyDenoiser};
use noise::SeededNoise;
use scheduler::FlowMatchEulerScheduler;

/// Latent channels of the synthetic denoiser.
const LATENT_CHANNELS: usize = 4;

/// Spatial compression between image and latent space.
const VAE_SCALE_FACTOR: usize = 8;

#[derive(Parser)]
#[command(
    name = "sega",
    about = "Semantic guidance on a synthetic diffusion sampler",
    version
)]
struct Args {
    /// The prompt to generate from.
    #[arg(long, default_value = "a portrait photo of a person")]
    prompt: String,

    /// Negative prompt describing what to avoid.
    #[arg(long, default_value = "")]
    negative_prompt: String,

    /// Comma-separated list of concepts to guide towards.
    #[arg(long)]
    sega_prompt: Option<String>,

    /// JSON file with semantic guidance options.
    #[arg(long)]
    config: Option<String>,

    /// Disable semantic guidance even when concepts are given.
    #[arg(long)]
    no_sega: bool,

    /// Fraction of the steps before guidance is applied.
    #[arg(long)]
    warmup_period: Option<f64>,

    /// Scale of the selected edit direction elements.
    #[arg(long)]
    edit_guidance_scale: Option<f64>,

    /// Fraction of the highest-deviation elements to keep.
    #[arg(long)]
    tail_percentage_threshold: Option<f64>,

    /// Weight of the velocity in the adjusted direction.
    #[arg(long)]
    momentum_scale: Option<f64>,

    /// Decay of the velocity between steps.
    #[arg(long)]
    momentum_beta: Option<f64>,

    /// Number of denoising steps.
    #[arg(long, default_value_t = 20)]
    steps: usize,

    /// Classifier-free guidance scale.
    #[arg(long, default_value_t = 7.0)]
    cfg_scale: f64,

    /// Exponential time shift of the sigma schedule.
    #[arg(long)]
    shift: Option<f64>,

    #[arg(long, default_value_t = 512)]
    width: usize,

    #[arg(long, default_value_t = 512)]
    height: usize,

    #[arg(long, default_value_t = 1)]
    batch_size: usize,

    /// Width of the synthetic text embeddings.
    #[arg(long, default_value_t = 64)]
    hidden_size: usize,

    /// Also emit a pooled `vector` conditioning of this width.
    #[arg(long)]
    pooled_size: Option<usize>,

    /// Random seed for reproducibility.
    #[arg(long)]
    seed: Option<u64>,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Enable Chrome tracing profiler.
    #[arg(long)]
    tracing: bool,
}

impl Args {
    fn sega_options(&self) -> Result<SegaOptions> {
        let mut options = match &self.config {
            Some(path) => {
                let file = std::fs::File::open(path)
                    .with_context(|| format!("cannot open sega config {path}"))?;
                serde_json::from_reader(file)
                    .with_context(|| format!("cannot parse sega config {path}"))?
            }
            None => SegaOptions::default(),
        };
        if let Some(prompt) = &self.sega_prompt {
            options.prompt = prompt.clone();
            options.active = true;
        }
        if self.no_sega {
            options.active = false;
        }

        let g = &mut options.guidance;
        if let Some(v) = self.warmup_period {
            g.warmup_period = v;
        }
        if let Some(v) = self.edit_guidance_scale {
            g.edit_guidance_scale = v;
        }
        if let Some(v) = self.tail_percentage_threshold {
            g.tail_percentage_threshold = v;
        }
        if let Some(v) = self.momentum_scale {
            g.momentum_scale = v;
        }
        if let Some(v) = self.momentum_beta {
            g.momentum_beta = v;
        }
        Ok(options)
    }
}

/// Console logging filtered by `RUST_LOG`, plus Chrome tracing if enabled.
///
/// Returns a guard that must be kept alive for the duration of tracing.
fn setup_tracing(chrome: bool) -> Option<tracing_chrome::FlushGuard> {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let (chrome_layer, guard) = if chrome {
        let (layer, guard) = ChromeLayerBuilder::new().build();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(chrome_layer)
        .init();
    guard
}

/// Seeded flow-matching loop, steered by `session` when it is attached.
fn sample(
    host: &mut SyntheticHost,
    session: &mut SegaSession,
    request: &GenerationRequest,
    args: &Args,
    seed: u64,
    device: &Device,
) -> Result<Tensor> {
    let cond = host.encode(&EncodeRequest {
        prompts: vec![args.prompt.clone(); request.batch_size],
        width: request.width,
        height: request.height,
        steps: request.steps,
    })?;
    let uncond = host.encode(&EncodeRequest {
        prompts: vec![args.negative_prompt.clone(); request.batch_size],
        width: request.width,
        height: request.height,
        steps: request.steps,
    })?;

    let attached = session.attach(host, request)?;
    if attached {
        println!(
            "semantic guidance attached with {} concept(s): {:?}",
            session.concepts().len(),
            session
                .concepts()
                .iter()
                .map(|c| c.prompt())
                .collect::<Vec<_>>()
        );
    }

    let mut scheduler = FlowMatchEulerScheduler::new(1000, args.shift);
    scheduler.set_timesteps(request.steps);
    let timesteps = scheduler.timesteps();

    let mut latents = SeededNoise::new(seed).randn(
        &[
            request.batch_size,
            LATENT_CHANNELS,
            request.height / VAE_SCALE_FACTOR,
            request.width / VAE_SCALE_FACTOR,
        ],
        device,
        DType::F32,
    )?;
    let denoiser = ToyDenoiser {
        cfg_scale: args.cfg_scale,
    };

    for step in 0..scheduler.num_inference_steps() {
        let text_cond = cond
            .at_step(step)
            .context("empty conditioning schedule")?;
        let text_uncond = uncond
            .at_step(step)
            .context("empty conditioning schedule")?;
        let outcome = session.on_cfg_denoiser(&StepContext {
            sampling_step: step,
            total_sampling_steps: request.steps,
            x: &latents,
            text_cond,
            text_uncond,
        })?;

        let velocity = denoiser.predict(&latents, &outcome.text_cond, &outcome.text_uncond)?;
        latents = scheduler.step(&velocity, &latents)?;

        if attached && (step + 1) % 5 == 0 {
            println!(
                "step {:>3}/{} t={:>7.2} padded={} injected={}",
                step + 1,
                request.steps,
                timesteps[step],
                outcome.padded,
                outcome.injected
            );
        }
    }

    session.detach();
    Ok(latents)
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _guard = setup_tracing(args.tracing);

    let options = args.sega_options()?;
    let device = candle_sega_examples::device(args.cpu)?;
    let seed = args.seed.unwrap_or(0);
    let request = GenerationRequest {
        batch_size: args.batch_size,
        width: args.width,
        height: args.height,
        steps: args.steps,
    };

    let mut host = SyntheticHost::new(
        device.clone(),
        DType::F32,
        seed,
        args.hidden_size,
        args.pooled_size,
    );

    println!("sampling without semantic guidance...");
    let mut plain = SegaSession::new(SegaOptions::default());
    let baseline = sample(&mut host, &mut plain, &request, &args, seed, &device)?;

    println!("sampling with semantic guidance...");
    let mut guided_session = SegaSession::new(options.clone());
    let guided = sample(&mut host, &mut guided_session, &request, &args, seed, &device)?;

    let params = host.generation_params();
    if !params.is_empty() {
        println!("generation params:");
        for (key, value) in params {
            println!("  {key}: {value}");
        }
        let restored = SegaOptions::from_generation_params(
            params.iter().map(|(k, v)| (*k, v.as_str())),
        )?;
        if restored != options {
            tracing::warn!(?restored, "generation params do not restore the options");
        }
    }

    let stats = tensor_stats(&(&guided - &baseline)?)?;
    println!(
        "guided - baseline: mean={:.6} std={:.6} min={:.6} max={:.6} nonzero={}",
        stats.mean, stats.std, stats.min, stats.max, stats.nonzero
    );
    println!("text encoder calls: {}", host.encode_calls());
    Ok(())
}
