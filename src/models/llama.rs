use crate::config::ModelSettings;
use crate::runtime::{GenerationParams, ModelRuntime};
use anyhow::{anyhow, bail, Context};
use candle::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::llama as model;
use hf_hub::api::sync::{ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use model::{Config, Llama, LlamaConfig, LlamaEosToks};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tokenizers::Tokenizer;

const EOS_TOKENS: [&str; 3] = ["</s>", "<|end_of_text|>", "<|eot_id|>"];

/// Used when sampling without an explicit top-k, matching the usual `generate` default.
const DEFAULT_TOP_K: usize = 50;

/// The subset of `generation_config.json` that affects sampling and stopping.
#[derive(Debug, Default, Deserialize)]
struct GenerationConfig {
    #[serde(default)]
    eos_token_id: Option<EosTokenIds>,
    #[serde(default)]
    top_k: Option<usize>,
    #[serde(default)]
    top_p: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum EosTokenIds {
    Single(u32),
    Multiple(Vec<u32>),
}

#[derive(Debug, Deserialize)]
struct SafetensorsIndex {
    weight_map: std::collections::HashMap<String, String>,
}

pub struct LlamaInferenceModel {
    model: Llama,
    tokenizer: Tokenizer,
    device: Device,
    dtype: DType,
    config: Config,
    eos_token_ids: Vec<u32>,
    top_k: usize,
    top_p: Option<f64>,
}

impl LlamaInferenceModel {
    pub fn load_from_hub(settings: &ModelSettings, device: Device) -> anyhow::Result<Self> {
        // Configure the API client
        let api = ApiBuilder::new()
            .with_token(settings.huggingface_token.clone())
            .build()?;

        // Set up the repo and retrieve config and tokenizer files
        let repo = api.repo(Repo::with_revision(
            settings.model_id.clone(),
            RepoType::Model,
            settings.revision.clone(),
        ));
        log::info!(
            "fetching {}@{} from the hub",
            settings.model_id,
            settings.revision
        );
        let tokenizer_filename = repo.get("tokenizer.json")?;
        let config_filename = repo.get("config.json")?;

        // Parse LLaMA configuration
        let config: LlamaConfig = serde_json::from_slice(&std::fs::read(config_filename)?)?;
        let config = config.into_config(settings.use_flash_attn);

        let generation_config = match repo.get("generation_config.json") {
            Ok(path) => serde_json::from_slice::<GenerationConfig>(&std::fs::read(path)?)
                .context("failed to parse generation_config.json")?,
            Err(e) => {
                log::debug!("no generation_config.json ({e}), using sampling defaults");
                GenerationConfig::default()
            }
        };

        let filenames = weight_files(&repo)?;
        log::info!("loading {} safetensors file(s)", filenames.len());

        // Load the model
        let vb = unsafe {
            VarBuilder::from_mmaped_safetensors(&filenames, settings.dtype, &device)?
        };
        let model = Llama::load(vb, &config)?;

        // Load the tokenizer
        let tokenizer = Tokenizer::from_file(tokenizer_filename).map_err(|e| anyhow!(e))?;

        let eos_token_ids = collect_eos_token_ids(&config, &generation_config, &tokenizer);
        log::info!("EOS token IDs: {:?}", eos_token_ids);

        Ok(Self {
            model,
            tokenizer,
            device,
            dtype: settings.dtype,
            config,
            eos_token_ids,
            top_k: generation_config.top_k.unwrap_or(DEFAULT_TOP_K),
            top_p: generation_config.top_p,
        })
    }

    fn sampling(&self, temperature: f64) -> Sampling {
        sampling_for(temperature, self.top_k, self.top_p)
    }
}

impl ModelRuntime for LlamaInferenceModel {
    fn tokenize(&self, text: &str) -> anyhow::Result<Vec<u32>> {
        Ok(self
            .tokenizer
            .encode(text, true)
            .map_err(|e| anyhow!(e))?
            .get_ids()
            .to_vec())
    }

    fn generate(&self, prompt: &[u32], params: &GenerationParams) -> anyhow::Result<Vec<u32>> {
        check_context(
            prompt.len(),
            params.max_new_tokens,
            self.config.max_position_embeddings,
        )?;

        // First parameter 'true' means to use key-value cache; one cache per call
        let mut cache = model::Cache::new(true, self.dtype, &self.config, &self.device)?;
        let mut tokens = prompt.to_vec();
        log::debug!("Tokens: {:?}", tokens);

        let mut logits_processor =
            LogitsProcessor::from_sampling(params.seed, self.sampling(params.temperature));
        let start_gen = std::time::Instant::now();
        let mut index_pos = 0;

        for index in 0..params.max_new_tokens {
            // Determine the context size and index for the current token
            let (context_size, context_index) = if index > 0 {
                (1, index_pos)
            } else {
                (tokens.len(), 0)
            };

            let ctxt = &tokens[tokens.len().saturating_sub(context_size)..];
            let input = Tensor::new(ctxt, &self.device)?.unsqueeze(0)?;

            let logits = self
                .model
                .forward(&input, context_index, &mut cache)?
                .squeeze(0)?
                .to_dtype(DType::F32)?;

            // Update the index position
            index_pos += ctxt.len();

            let next_token = logits_processor.sample(&logits)?;
            tokens.push(next_token);

            if self.eos_token_ids.contains(&next_token) {
                log::debug!("EOS token found");
                break;
            }
        }

        let generated = tokens.len() - prompt.len();
        let dt = start_gen.elapsed();
        log::debug!(
            "{} tokens generated ({:.2} token/s)",
            generated,
            generated as f64 / dt.as_secs_f64(),
        );

        Ok(tokens)
    }

    fn detokenize(&self, tokens: &[u32]) -> anyhow::Result<String> {
        self.tokenizer.decode(tokens, true).map_err(|e| anyhow!(e))
    }
}

/// Resolves the weight files of a checkpoint, sharded or not.
fn weight_files(repo: &ApiRepo) -> anyhow::Result<Vec<PathBuf>> {
    match repo.get("model.safetensors.index.json") {
        Ok(index_path) => {
            let index: SafetensorsIndex = serde_json::from_slice(&std::fs::read(&index_path)?)
                .context("failed to parse model.safetensors.index.json")?;
            shard_names(&index)
                .iter()
                .map(|filename| repo.get(filename).map_err(anyhow::Error::from))
                .collect()
        }
        Err(_) => Ok(vec![repo.get("model.safetensors")?]),
    }
}

fn shard_names(index: &SafetensorsIndex) -> Vec<String> {
    index
        .weight_map
        .values()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn collect_eos_token_ids(
    config: &Config,
    generation_config: &GenerationConfig,
    tokenizer: &Tokenizer,
) -> Vec<u32> {
    let mut ids = BTreeSet::new();
    match &config.eos_token_id {
        Some(LlamaEosToks::Single(id)) => {
            ids.insert(*id);
        }
        Some(LlamaEosToks::Multiple(list)) => ids.extend(list.iter().copied()),
        None => {}
    }
    ids.extend(eos_from_generation_config(generation_config));
    ids.extend(
        EOS_TOKENS
            .iter()
            .filter_map(|token| tokenizer.token_to_id(token)),
    );
    ids.into_iter().collect()
}

fn eos_from_generation_config(generation_config: &GenerationConfig) -> Vec<u32> {
    match &generation_config.eos_token_id {
        Some(EosTokenIds::Single(id)) => vec![*id],
        Some(EosTokenIds::Multiple(list)) => list.clone(),
        None => Vec::new(),
    }
}

/// The last sampled token is never fed back, so a run occupies
/// `prompt_len + max_new_tokens - 1` positions.
fn check_context(
    prompt_len: usize,
    max_new_tokens: usize,
    max_position_embeddings: usize,
) -> anyhow::Result<()> {
    if prompt_len == 0 {
        bail!("prompt encoded to zero tokens");
    }
    let positions = prompt_len + max_new_tokens.saturating_sub(1);
    if positions > max_position_embeddings {
        bail!(
            "prompt ({} tokens) plus {} new tokens exceeds the model context of {}",
            prompt_len,
            max_new_tokens,
            max_position_embeddings
        );
    }
    Ok(())
}

fn sampling_for(temperature: f64, top_k: usize, top_p: Option<f64>) -> Sampling {
    if temperature <= 0.0 {
        return Sampling::ArgMax;
    }
    let top_p = top_p.filter(|p| *p > 0.0 && *p < 1.0);
    match (top_k, top_p) {
        (0, None) => Sampling::All { temperature },
        (0, Some(p)) => Sampling::TopP { p, temperature },
        (k, None) => Sampling::TopK { k, temperature },
        (k, Some(p)) => Sampling::TopKThenTopP { k, p, temperature },
    }
}
