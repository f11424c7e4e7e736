//! Flow-match Euler scheduler driving the synthetic sampling loop.
//!
//! ```text
//! x_t     = (1 - sigma) * x_0 + sigma * noise
//! x_{t+1} = x_t + (sigma_next - sigma) * v(x_t, t)
//! ```
//!
//! Sigmas go from 1.0 (pure noise) to 0.0 (clean sample).

use candle::{Result, Tensor};

#[derive(Debug, Clone)]
pub struct FlowMatchEulerScheduler {
    num_train_timesteps: usize,
    /// Exponential time shift, `None` keeps the linear schedule.
    shift: Option<f64>,
    sigmas: Vec<f64>,
    step_index: usize,
}

impl FlowMatchEulerScheduler {
    pub fn new(num_train_timesteps: usize, shift: Option<f64>) -> Self {
        Self {
            num_train_timesteps,
            shift,
            sigmas: Vec::new(),
            step_index: 0,
        }
    }

    fn time_shift(mu: f64, t: f64) -> f64 {
        if t <= 0.0 || t >= 1.0 {
            return t;
        }
        let exp_mu = mu.exp();
        exp_mu / (exp_mu + (1.0 / t - 1.0))
    }

    /// Linspace from 1.0 to `1 / num_train_timesteps`, shifted, with a final 0.0.
    pub fn set_timesteps(&mut self, num_inference_steps: usize) {
        let sigma_max = 1.0;
        let sigma_min = 1.0 / self.num_train_timesteps as f64;
        let mut sigmas: Vec<f64> = (0..num_inference_steps)
            .map(|i| {
                sigma_max
                    - (sigma_max - sigma_min) * i as f64 / (num_inference_steps - 1).max(1) as f64
            })
            .collect();
        if let Some(mu) = self.shift {
            sigmas = sigmas.iter().map(|&s| Self::time_shift(mu, s)).collect();
        }
        sigmas.push(0.0);
        self.sigmas = sigmas;
        self.step_index = 0;
    }

    pub fn timesteps(&self) -> Vec<f64> {
        self.sigmas
            .iter()
            .map(|&s| s * self.num_train_timesteps as f64)
            .collect()
    }

    pub fn num_inference_steps(&self) -> usize {
        self.sigmas.len().saturating_sub(1)
    }

    pub fn step(&mut self, model_output: &Tensor, sample: &Tensor) -> Result<Tensor> {
        let sigma = self.sigmas[self.step_index];
        let sigma_next = self.sigmas[self.step_index + 1];
        let dt = sigma_next - sigma;
        let prev_sample = (sample + (model_output * dt)?)?;
        self.step_index += 1;
        Ok(prev_sample)
    }
}
