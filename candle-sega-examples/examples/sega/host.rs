//! Synthetic diffusion host.
//!
//! Stands in for a real text encoder and denoiser so the guidance can be
//! exercised end to end without model weights:
//! - prompts become seeded pseudo-embeddings, one 77-token chunk per 75 words
//! - the "denoiser" predicts a velocity pulling latents towards the mean of
//!   the conditioning, combined with classifier-free guidance

use anyhow::Result;
use candle::{DType, Device, Tensor, D};
use candle_sega::{
    pad_cond, ConditioningGroup, EncodeRequest, ScheduledConditioning, SegaHost, TensorKey,
    TextEncoder,
};

use crate::noise::SeededNoise;

/// Tokens per encoder chunk, including the BOS/EOS pair.
pub const CHUNK_LEN: usize = 77;

/// Words that fit into one chunk.
const WORDS_PER_CHUNK: usize = 75;

pub struct SyntheticHost {
    device: Device,
    dtype: DType,
    seed: u64,
    hidden_size: usize,
    /// Width of the pooled `vector` conditioning, if emitted.
    pooled_size: Option<usize>,
    encode_calls: usize,
    generation_params: Vec<(&'static str, String)>,
}

impl SyntheticHost {
    pub fn new(
        device: Device,
        dtype: DType,
        seed: u64,
        hidden_size: usize,
        pooled_size: Option<usize>,
    ) -> Self {
        Self {
            device,
            dtype,
            seed,
            hidden_size,
            pooled_size,
            encode_calls: 0,
            generation_params: Vec::new(),
        }
    }

    pub fn encode_calls(&self) -> usize {
        self.encode_calls
    }

    pub fn generation_params(&self) -> &[(&'static str, String)] {
        &self.generation_params
    }

    fn chunks(prompt: &str) -> usize {
        let words = prompt.split_whitespace().count();
        words.div_ceil(WORDS_PER_CHUNK).max(1)
    }

    /// Pseudo-embedding of one prompt, `[1, chunks * 77, hidden]`.
    fn embed(&self, prompt: &str) -> candle::Result<Tensor> {
        let len = Self::chunks(prompt) * CHUNK_LEN;
        let mut noise = SeededNoise::for_text(self.seed, prompt);
        noise.randn(&[1, len, self.hidden_size], &self.device, self.dtype)
    }

    fn pooled(&self, prompt: &str, size: usize) -> candle::Result<Tensor> {
        let mut noise = SeededNoise::for_text(self.seed.wrapping_add(1), prompt);
        noise.randn(&[1, size], &self.device, self.dtype)
    }

    /// Encode a batch of prompts, padding every row to the longest one.
    pub fn encode_batch(&self, prompts: &[String]) -> candle::Result<ConditioningGroup> {
        let empty = self.embed("")?;
        let rows = prompts
            .iter()
            .map(|p| self.embed(p))
            .collect::<candle::Result<Vec<_>>>()?;
        let longest = prompts
            .iter()
            .map(|p| Self::chunks(p) * CHUNK_LEN)
            .max()
            .unwrap_or(CHUNK_LEN);
        let rows = rows
            .iter()
            .map(|row| {
                let repeats = (longest - row.dim(1)?) / CHUNK_LEN;
                pad_cond(&TensorKey::CROSSATTN, row, repeats, &empty).map_err(candle::Error::wrap)
            })
            .collect::<candle::Result<Vec<_>>>()?;

        let mut group = ConditioningGroup::crossattn(Tensor::cat(&rows, 0)?);
        if let Some(size) = self.pooled_size {
            let pooled = prompts
                .iter()
                .map(|p| self.pooled(p, size))
                .collect::<candle::Result<Vec<_>>>()?;
            group.insert(TensorKey::VECTOR, Tensor::cat(&pooled, 0)?);
        }
        Ok(group)
    }
}

impl TextEncoder for SyntheticHost {
    fn encode(&mut self, request: &EncodeRequest) -> candle::Result<ScheduledConditioning> {
        self.encode_calls += 1;
        let group = self.encode_batch(&request.prompts)?;
        Ok(ScheduledConditioning::constant(group, request.steps))
    }
}

impl SegaHost for SyntheticHost {
    fn empty_prompt(&self) -> candle::Result<ConditioningGroup> {
        Ok(ConditioningGroup::crossattn(self.embed("")?))
    }

    fn record_generation_params(&mut self, params: &[(&'static str, String)]) {
        self.generation_params.extend_from_slice(params);
    }
}

/// Toy velocity predictor with classifier-free guidance.
pub struct ToyDenoiser {
    pub cfg_scale: f64,
}

impl ToyDenoiser {
    /// Per-sample mean of the cross-attention context, `[batch, 1, 1, 1]`.
    fn context(cond: &ConditioningGroup) -> Result<Tensor> {
        let context = cond
            .get(&TensorKey::CROSSATTN)
            .ok_or_else(|| anyhow::anyhow!("conditioning has no crossattn tensor"))?
            .to_dtype(DType::F32)?;
        let context = context.mean_keepdim(D::Minus1)?.mean_keepdim(1)?;
        Ok(context.unsqueeze(D::Minus1)?)
    }

    fn velocity(x: &Tensor, cond: &ConditioningGroup) -> Result<Tensor> {
        Ok(x.broadcast_sub(&Self::context(cond)?)?)
    }

    /// `uncond + scale * (cond - uncond)` of the two velocity predictions.
    pub fn predict(
        &self,
        x: &Tensor,
        cond: &ConditioningGroup,
        uncond: &ConditioningGroup,
    ) -> Result<Tensor> {
        let pos = Self::velocity(x, cond)?;
        let neg = Self::velocity(x, uncond)?;
        Ok((&neg + ((&pos - &neg)? * self.cfg_scale)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host() -> SyntheticHost {
        SyntheticHost::new(Device::Cpu, DType::F32, 0, 8, Some(4))
    }

    #[test]
    fn test_long_prompts_span_more_chunks() -> Result<()> {
        let long = vec!["word"; 80].join(" ");
        let group = host().encode_batch(&["a cat".to_string(), long])?;
        let crossattn = group.get(&TensorKey::CROSSATTN).expect("crossattn");
        assert_eq!(crossattn.dims(), &[2, 2 * CHUNK_LEN, 8]);
        assert_eq!(group.get(&TensorKey::VECTOR).expect("vector").dims(), &[2, 4]);
        Ok(())
    }

    #[test]
    fn test_cfg_scale_one_is_conditional() -> Result<()> {
        let host = host();
        let cond = host.encode_batch(&["a cat".to_string()])?;
        let uncond = host.encode_batch(&[String::new()])?;
        let x = Tensor::zeros((1, 4, 2, 2), DType::F32, &Device::Cpu)?;

        let guided = ToyDenoiser { cfg_scale: 1.0 }.predict(&x, &cond, &uncond)?;
        let plain = ToyDenoiser::velocity(&x, &cond)?;
        let diff = (guided - plain)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }
}
