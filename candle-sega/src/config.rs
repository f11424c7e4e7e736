//! Configuration for semantic guidance.
//!
//! [`GuidanceConfig`] holds the numeric knobs of the algorithm and is fixed
//! for the whole sampling run. [`SegaOptions`] is the user-facing surface
//! (active flag, concept prompt and the guidance knobs) that hosts expose in
//! their UI and echo into the generation metadata.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SegaError};

/// Upper bound of the UI slider for `edit_guidance_scale`.
pub const MAX_EDIT_GUIDANCE_SCALE: f64 = 10.0;

/// Upper bound of the UI slider for `momentum_beta`.
pub const MAX_MOMENTUM_BETA: f64 = 0.999;

/// Numeric parameters of semantic guidance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuidanceConfig {
    /// Fraction of the total steps during which injection is suppressed (default: 0.2).
    #[serde(default = "default_warmup_period")]
    pub warmup_period: f64,

    /// Multiplier applied to the thresholded edit direction (default: 1.0).
    #[serde(default = "default_edit_guidance_scale")]
    pub edit_guidance_scale: f64,

    /// Two-sided tail probability selecting which elements are pushed (default: 0.25).
    #[serde(default = "default_tail_percentage_threshold")]
    pub tail_percentage_threshold: f64,

    /// Weight of the accumulated velocity added to each direction (default: 1.0).
    #[serde(default = "default_momentum_scale")]
    pub momentum_scale: f64,

    /// Smoothing factor of the velocity update (default: 0.5).
    #[serde(default = "default_momentum_beta")]
    pub momentum_beta: f64,
}

fn default_warmup_period() -> f64 {
    0.2
}
fn default_edit_guidance_scale() -> f64 {
    1.0
}
fn default_tail_percentage_threshold() -> f64 {
    0.25
}
fn default_momentum_scale() -> f64 {
    1.0
}
fn default_momentum_beta() -> f64 {
    0.5
}

impl Default for GuidanceConfig {
    fn default() -> Self {
        Self {
            warmup_period: default_warmup_period(),
            edit_guidance_scale: default_edit_guidance_scale(),
            tail_percentage_threshold: default_tail_percentage_threshold(),
            momentum_scale: default_momentum_scale(),
            momentum_beta: default_momentum_beta(),
        }
    }
}

impl GuidanceConfig {
    /// Check every field against the range the UI allows.
    pub fn validate(&self) -> Result<()> {
        check_range("warmup_period", self.warmup_period, 0.0, 1.0)?;
        check_range(
            "edit_guidance_scale",
            self.edit_guidance_scale,
            0.0,
            MAX_EDIT_GUIDANCE_SCALE,
        )?;
        check_range(
            "tail_percentage_threshold",
            self.tail_percentage_threshold,
            0.0,
            1.0,
        )?;
        check_range("momentum_scale", self.momentum_scale, 0.0, 1.0)?;
        check_range("momentum_beta", self.momentum_beta, 0.0, MAX_MOMENTUM_BETA)?;
        Ok(())
    }

    /// Number of leading steps during which guidance is not injected.
    ///
    /// ```
    /// use candle_sega::GuidanceConfig;
    ///
    /// let config = GuidanceConfig { warmup_period: 0.25, ..Default::default() };
    /// assert_eq!(config.warmup_steps(20), 5);
    /// ```
    pub fn warmup_steps(&self, total_steps: usize) -> usize {
        let steps = (total_steps as f64 * self.warmup_period).round();
        steps.max(0.0) as usize
    }
}

fn check_range(name: &str, value: f64, min: f64, max: f64) -> Result<()> {
    if !value.is_finite() || value < min || value > max {
        return Err(SegaError::InvalidConfig(format!(
            "{name}={value} is outside [{min}, {max}]"
        )));
    }
    Ok(())
}

// ============================================================================
// User-facing options and metadata echo
// ============================================================================

const PARAM_ACTIVE: &str = "SEGA Active";
const PARAM_PROMPT: &str = "SEGA Prompt";
const PARAM_WARMUP: &str = "SEGA Warmup Period";
const PARAM_EDIT_SCALE: &str = "SEGA Edit Guidance Scale";
const PARAM_TAIL: &str = "SEGA Tail Percentage Threshold";
const PARAM_MOMENTUM_SCALE: &str = "SEGA Momentum Scale";
const PARAM_MOMENTUM_BETA: &str = "SEGA Momentum Beta";

/// Options a host collects from the user for one generation request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SegaOptions {
    /// Whether semantic guidance runs at all.
    #[serde(default)]
    pub active: bool,

    /// Comma-separated list of concepts.
    #[serde(default)]
    pub prompt: String,

    #[serde(flatten)]
    pub guidance: GuidanceConfig,
}

impl SegaOptions {
    pub fn new(prompt: impl Into<String>, guidance: GuidanceConfig) -> Self {
        Self {
            active: true,
            prompt: prompt.into(),
            guidance,
        }
    }

    /// Key/value pairs recorded alongside the generation metadata.
    pub fn generation_params(&self) -> Vec<(&'static str, String)> {
        let g = &self.guidance;
        vec![
            (PARAM_ACTIVE, self.active.to_string()),
            (PARAM_PROMPT, self.prompt.clone()),
            (PARAM_WARMUP, g.warmup_period.to_string()),
            (PARAM_EDIT_SCALE, g.edit_guidance_scale.to_string()),
            (PARAM_TAIL, g.tail_percentage_threshold.to_string()),
            (PARAM_MOMENTUM_SCALE, g.momentum_scale.to_string()),
            (PARAM_MOMENTUM_BETA, g.momentum_beta.to_string()),
        ]
    }

    /// Rebuild options from recorded metadata.
    ///
    /// Unknown keys are ignored and missing keys keep their defaults.
    pub fn from_generation_params<'a, I>(params: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut options = Self::default();
        for (key, value) in params {
            let value = value.trim();
            match key {
                PARAM_ACTIVE => options.active = parse_param(key, value)?,
                PARAM_PROMPT => options.prompt = value.to_string(),
                PARAM_WARMUP => options.guidance.warmup_period = parse_param(key, value)?,
                PARAM_EDIT_SCALE => {
                    options.guidance.edit_guidance_scale = parse_param(key, value)?
                }
                PARAM_TAIL => {
                    options.guidance.tail_percentage_threshold = parse_param(key, value)?
                }
                PARAM_MOMENTUM_SCALE => options.guidance.momentum_scale = parse_param(key, value)?,
                PARAM_MOMENTUM_BETA => options.guidance.momentum_beta = parse_param(key, value)?,
                _ => {}
            }
        }
        Ok(options)
    }
}

fn parse_param<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| SegaError::InvalidConfig(format!("cannot parse '{key}' from '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_ui() {
        let config = GuidanceConfig::default();
        assert_eq!(config.warmup_period, 0.2);
        assert_eq!(config.edit_guidance_scale, 1.0);
        assert_eq!(config.tail_percentage_threshold, 0.25);
        assert_eq!(config.momentum_scale, 1.0);
        assert_eq!(config.momentum_beta, 0.5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_warmup_steps_rounding() {
        let mut config = GuidanceConfig::default();
        config.warmup_period = 0.25;
        assert_eq!(config.warmup_steps(20), 5);
        assert_eq!(config.warmup_steps(0), 0);

        // round(7 * 0.5) = round(3.5) = 4
        config.warmup_period = 0.5;
        assert_eq!(config.warmup_steps(7), 4);

        config.warmup_period = 0.0;
        assert_eq!(config.warmup_steps(50), 0);
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        let config = GuidanceConfig {
            momentum_beta: 1.0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(SegaError::InvalidConfig(_))));

        let config = GuidanceConfig {
            edit_guidance_scale: 10.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GuidanceConfig {
            tail_percentage_threshold: f64::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        // The UI allows edit scales above 1
        let config = GuidanceConfig {
            edit_guidance_scale: 7.5,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_partial_json() {
        let options: SegaOptions =
            serde_json::from_str(r#"{"active": true, "prompt": "cat, dog", "momentum_beta": 0.9}"#)
                .expect("valid json");
        assert!(options.active);
        assert_eq!(options.prompt, "cat, dog");
        assert_eq!(options.guidance.momentum_beta, 0.9);
        assert_eq!(options.guidance.warmup_period, 0.2);
    }

    #[test]
    fn test_generation_params_round_trip() -> Result<()> {
        let options = SegaOptions::new(
            "sunglasses, smile",
            GuidanceConfig {
                warmup_period: 0.1,
                edit_guidance_scale: 2.5,
                ..Default::default()
            },
        );
        let params = options.generation_params();
        assert_eq!(params[0], ("SEGA Active", "true".to_string()));
        assert_eq!(params.len(), 7);

        let parsed = SegaOptions::from_generation_params(
            params.iter().map(|(k, v)| (*k, v.as_str())),
        )?;
        assert_eq!(parsed, options);
        Ok(())
    }

    #[test]
    fn test_from_generation_params_ignores_unknown() -> Result<()> {
        let parsed = SegaOptions::from_generation_params([
            ("Steps", "20"),
            ("SEGA Momentum Scale", " 0.3 "),
        ])?;
        assert!(!parsed.active);
        assert_eq!(parsed.guidance.momentum_scale, 0.3);

        let bad = SegaOptions::from_generation_params([("SEGA Active", "maybe")]);
        assert!(bad.is_err());
        Ok(())
    }
}
