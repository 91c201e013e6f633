// Server, model and generation settings read from the environment
use anyhow::{anyhow, Context};
use candle::{DType, Device};
use std::num::NonZeroUsize;
use std::str::FromStr;

pub const DEFAULT_MODEL_ID: &str = "meta-llama/Llama-3.2-1B";
pub const DEFAULT_PORT: u16 = 11434;
pub const DEFAULT_MAX_NEW_TOKENS: usize = 128;
pub const DEFAULT_MAX_NEW_TOKENS_LIMIT: usize = 2048;

/// Sampling temperature. Not exposed to callers.
pub const TEMPERATURE: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: Option<NonZeroUsize>,
    pub model: ModelSettings,
    pub generation: GenerationSettings,
}

#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub model_id: String,
    pub revision: String,
    pub huggingface_token: Option<String>,
    pub device: DevicePreference,
    pub dtype: DType,
    pub use_flash_attn: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationSettings {
    pub default_max_new_tokens: usize,
    pub max_new_tokens_limit: usize,
    pub temperature: f64,
    /// Fixed sampling seed; a fresh random seed is drawn per request when unset.
    pub seed: Option<u64>,
    pub continuation: ContinuationMode,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            default_max_new_tokens: DEFAULT_MAX_NEW_TOKENS,
            max_new_tokens_limit: DEFAULT_MAX_NEW_TOKENS_LIMIT,
            temperature: TEMPERATURE,
            seed: None,
            continuation: ContinuationMode::PromptOffset,
        }
    }
}

impl GenerationSettings {
    /// Applies the default and the upper bound to a caller-supplied token budget.
    pub fn resolve_max_new_tokens(&self, requested: Option<usize>) -> usize {
        let requested = requested.unwrap_or(self.default_max_new_tokens);
        if requested > self.max_new_tokens_limit {
            log::warn!(
                "max_new_tokens {} exceeds limit, clamping to {}",
                requested,
                self.max_new_tokens_limit
            );
            return self.max_new_tokens_limit;
        }
        requested
    }

    pub fn seed(&self) -> u64 {
        self.seed.unwrap_or_else(rand::random)
    }
}

/// How the echoed prompt is removed from the generated sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationMode {
    /// Decode prompt + generated tokens, then drop as many characters as the prompt has.
    PromptOffset,
    /// Decode only the tokens produced after the prompt.
    NewTokens,
}

impl FromStr for ContinuationMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "prompt-offset" | "prompt_offset" => Ok(Self::PromptOffset),
            "new-tokens" | "new_tokens" => Ok(Self::NewTokens),
            other => Err(anyhow!("unknown continuation mode '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePreference {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl DevicePreference {
    pub fn build(self) -> anyhow::Result<Device> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda(ordinal) => Device::new_cuda(ordinal)
                .with_context(|| format!("requested CUDA device {ordinal} but initialization failed")),
            Self::Metal(ordinal) => Device::new_metal(ordinal)
                .with_context(|| format!("requested Metal device {ordinal} but initialization failed")),
        }
    }
}

impl FromStr for DevicePreference {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let lower = trimmed.to_ascii_lowercase();
        let ordinal = || -> anyhow::Result<usize> {
            match trimmed.split_once(':') {
                Some((_, index)) => index
                    .parse()
                    .with_context(|| format!("invalid device ordinal in '{trimmed}'")),
                None => Ok(0),
            }
        };
        if lower == "cpu" {
            Ok(Self::Cpu)
        } else if lower.starts_with("cuda") || lower.starts_with("gpu") {
            Ok(Self::Cuda(ordinal()?))
        } else if lower.starts_with("metal") {
            Ok(Self::Metal(ordinal()?))
        } else {
            Err(anyhow!("unknown device '{trimmed}'"))
        }
    }
}

fn parse_dtype(value: &str) -> anyhow::Result<DType> {
    match value.trim().to_ascii_lowercase().as_str() {
        "f32" => Ok(DType::F32),
        "f16" => Ok(DType::F16),
        "bf16" => Ok(DType::BF16),
        other => Err(anyhow!("unsupported dtype '{other}'")),
    }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected a boolean, got '{other}'")),
    }
}

impl ServerConfig {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up a `.env` file.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| dotenvy::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        fn field<T, E>(
            key: &str,
            value: Option<String>,
            parse: impl Fn(&str) -> Result<T, E>,
        ) -> anyhow::Result<Option<T>>
        where
            E: Into<anyhow::Error>,
        {
            value
                .map(|v| {
                    parse(v.trim()).map_err(|e| {
                        let e: anyhow::Error = e.into();
                        e.context(format!("invalid value for {key}"))
                    })
                })
                .transpose()
        }

        let model = ModelSettings {
            model_id: var("LLM_MODEL_ID").unwrap_or_else(|| DEFAULT_MODEL_ID.to_string()),
            revision: var("LLM_MODEL_REVISION").unwrap_or_else(|| "main".to_string()),
            huggingface_token: var("HF_TOKEN"),
            device: field("LLM_DEVICE", var("LLM_DEVICE"), DevicePreference::from_str)?
                .unwrap_or(DevicePreference::Cpu),
            dtype: field("LLM_DTYPE", var("LLM_DTYPE"), parse_dtype)?.unwrap_or(DType::F32),
            use_flash_attn: field("LLM_USE_FLASH_ATTN", var("LLM_USE_FLASH_ATTN"), parse_bool)?
                .unwrap_or(false),
        };
        if model.use_flash_attn && !cfg!(feature = "flash-attn") {
            return Err(anyhow!(
                "invalid value for LLM_USE_FLASH_ATTN: build with the 'flash-attn' feature to enable it"
            ));
        }

        let generation = GenerationSettings {
            default_max_new_tokens: field(
                "LLM_DEFAULT_MAX_NEW_TOKENS",
                var("LLM_DEFAULT_MAX_NEW_TOKENS"),
                usize::from_str,
            )?
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS),
            max_new_tokens_limit: field(
                "LLM_MAX_NEW_TOKENS_LIMIT",
                var("LLM_MAX_NEW_TOKENS_LIMIT"),
                usize::from_str,
            )?
            .unwrap_or(DEFAULT_MAX_NEW_TOKENS_LIMIT),
            temperature: TEMPERATURE,
            seed: field("LLM_SEED", var("LLM_SEED"), u64::from_str)?,
            continuation: field(
                "LLM_CONTINUATION_MODE",
                var("LLM_CONTINUATION_MODE"),
                ContinuationMode::from_str,
            )?
            .unwrap_or(ContinuationMode::PromptOffset),
        };

        Ok(Self {
            host: var("LLM_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: field("LLM_PORT", var("LLM_PORT"), u16::from_str)?.unwrap_or(DEFAULT_PORT),
            workers: field("LLM_WORKERS", var("LLM_WORKERS"), NonZeroUsize::from_str)?,
            model,
            generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<ServerConfig> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults_match_reference_deployment() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 11434);
        assert_eq!(config.model.model_id, "meta-llama/Llama-3.2-1B");
        assert_eq!(config.model.revision, "main");
        assert_eq!(config.model.device, DevicePreference::Cpu);
        assert_eq!(config.model.dtype, DType::F32);
        assert_eq!(config.generation, GenerationSettings::default());
        assert_eq!(config.generation.temperature, 0.7);
    }

    #[test]
    fn reads_overrides() {
        let config = config_from(&[
            ("LLM_PORT", "8080"),
            ("LLM_DEVICE", "cuda:1"),
            ("LLM_DTYPE", "bf16"),
            ("LLM_SEED", "42"),
            ("LLM_MAX_NEW_TOKENS_LIMIT", "64"),
            ("LLM_CONTINUATION_MODE", "new-tokens"),
            ("HF_TOKEN", "hf_abc"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.model.device, DevicePreference::Cuda(1));
        assert_eq!(config.model.dtype, DType::BF16);
        assert_eq!(config.model.huggingface_token.as_deref(), Some("hf_abc"));
        assert_eq!(config.generation.seed, Some(42));
        assert_eq!(config.generation.max_new_tokens_limit, 64);
        assert_eq!(config.generation.continuation, ContinuationMode::NewTokens);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = config_from(&[("LLM_PORT", "  "), ("HF_TOKEN", "")]).unwrap();
        assert_eq!(config.port, 11434);
        assert!(config.model.huggingface_token.is_none());
    }

    #[test]
    fn invalid_value_names_the_variable() {
        let err = config_from(&[("LLM_PORT", "eleven")]).unwrap_err();
        assert!(format!("{err:#}").contains("LLM_PORT"));
        assert!(config_from(&[("LLM_DEVICE", "tpu")]).is_err());
        assert!(config_from(&[("LLM_CONTINUATION_MODE", "whatever")]).is_err());
    }

    #[test]
    fn zero_workers_is_rejected() {
        let err = config_from(&[("LLM_WORKERS", "0")]).unwrap_err();
        assert!(format!("{err:#}").contains("LLM_WORKERS"));
        let config = config_from(&[("LLM_WORKERS", "4")]).unwrap();
        assert_eq!(config.workers.map(NonZeroUsize::get), Some(4));
    }

    #[test]
    fn flash_attention_requires_the_feature() {
        let result = config_from(&[("LLM_USE_FLASH_ATTN", "true")]);
        if cfg!(feature = "flash-attn") {
            assert!(result.unwrap().model.use_flash_attn);
        } else {
            let err = result.unwrap_err();
            assert!(format!("{err:#}").contains("LLM_USE_FLASH_ATTN"));
        }
        let config = config_from(&[("LLM_USE_FLASH_ATTN", "false")]).unwrap();
        assert!(!config.model.use_flash_attn);
    }

    #[test]
    fn device_preference_parsing() {
        assert_eq!("CPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cpu);
        assert_eq!("cuda".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda(0));
        assert_eq!("gpu:2".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda(2));
        assert_eq!("metal".parse::<DevicePreference>().unwrap(), DevicePreference::Metal(0));
        assert!("cuda:x".parse::<DevicePreference>().is_err());
    }

    #[test]
    fn max_new_tokens_default_and_clamp() {
        let settings = GenerationSettings {
            max_new_tokens_limit: 256,
            ..GenerationSettings::default()
        };
        assert_eq!(settings.resolve_max_new_tokens(None), 128);
        assert_eq!(settings.resolve_max_new_tokens(Some(0)), 0);
        assert_eq!(settings.resolve_max_new_tokens(Some(5)), 5);
        assert_eq!(settings.resolve_max_new_tokens(Some(1_000_000)), 256);
    }

    #[test]
    fn fixed_seed_is_reused() {
        let settings = GenerationSettings {
            seed: Some(7),
            ..GenerationSettings::default()
        };
        assert_eq!(settings.seed(), 7);
        assert_eq!(settings.seed(), 7);
    }
}
