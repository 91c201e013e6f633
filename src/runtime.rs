// Interface between the request pipeline and a loaded language model

/// Per-call decoding parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub seed: u64,
}

/// A tokenizer plus causal language model, loaded once and shared read-only.
///
/// Implementations must be usable from several threads at once; every call
/// keeps its own decoding state (KV cache, sampler).
pub trait ModelRuntime: Send + Sync {
    /// Encodes `text`, including any special tokens the tokenizer adds (e.g. BOS).
    fn tokenize(&self, text: &str) -> anyhow::Result<Vec<u32>>;

    /// Samples up to `params.max_new_tokens` tokens after `prompt`, stopping early
    /// on an end-of-sequence token. Returns the prompt followed by the new tokens.
    fn generate(&self, prompt: &[u32], params: &GenerationParams) -> anyhow::Result<Vec<u32>>;

    /// Decodes `tokens` with special tokens removed.
    fn detokenize(&self, tokens: &[u32]) -> anyhow::Result<String>;
}
