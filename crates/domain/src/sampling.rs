use serde::{Deserialize, Serialize};

/// Sampling parameters for one generation. Unset fields fall back to the
/// model's configured `completion_defaults`, then to the runtime's own
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_penalty: Option<RepeatPenalty>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u32>,
}

/// Repeat-penalty triple applied over the last `last_tokens` tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RepeatPenalty {
    pub last_tokens: u32,
    #[serde(default)]
    pub frequency_penalty: f32,
    #[serde(default)]
    pub presence_penalty: f32,
}

impl SamplingParams {
    /// Per-field fallback: fields set on `self` win, unset fields take the
    /// value from `defaults`.
    pub fn merged_with(&self, defaults: &SamplingParams) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature.or(defaults.temperature),
            top_p: self.top_p.or(defaults.top_p),
            top_k: self.top_k.or(defaults.top_k),
            min_p: self.min_p.or(defaults.min_p),
            max_tokens: self.max_tokens.or(defaults.max_tokens),
            repeat_penalty: self.repeat_penalty.or(defaults.repeat_penalty),
            seed: self.seed.or(defaults.seed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merged_with_prefers_request_fields() {
        let request = SamplingParams {
            temperature: Some(0.2),
            ..Default::default()
        };
        let defaults = SamplingParams {
            temperature: Some(0.7),
            max_tokens: Some(256),
            ..Default::default()
        };
        let merged = request.merged_with(&defaults);
        assert_eq!(merged.temperature, Some(0.2));
        assert_eq!(merged.max_tokens, Some(256));
        assert_eq!(merged.top_p, None);
    }
}
