// Prompt-to-continuation pipeline on top of a ModelRuntime
use crate::config::ContinuationMode;
use crate::runtime::{GenerationParams, ModelRuntime};
use anyhow::anyhow;

#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
}

/// Tokenizes `prompt`, samples a continuation and returns only the newly generated text.
pub fn generate_continuation(
    runtime: &dyn ModelRuntime,
    prompt: &str,
    params: &GenerationParams,
    mode: ContinuationMode,
) -> anyhow::Result<Generation> {
    let prompt_ids = runtime.tokenize(prompt)?;
    let output_ids = runtime.generate(&prompt_ids, params)?;
    let new_ids = output_ids
        .get(prompt_ids.len()..)
        .ok_or_else(|| anyhow!("generated sequence is shorter than the prompt"))?;

    let text = match mode {
        ContinuationMode::PromptOffset => {
            let decoded = runtime.detokenize(&output_ids)?;
            strip_prompt_prefix(&decoded, prompt)
        }
        ContinuationMode::NewTokens => runtime.detokenize(new_ids)?,
    };

    Ok(Generation {
        text,
        prompt_tokens: prompt_ids.len(),
        generated_tokens: new_ids.len(),
    })
}

/// Drops as many leading characters from `decoded` as `prompt` contains.
///
/// This assumes decoding reproduces the prompt verbatim. Tokenizers that
/// normalize whitespace, case or Unicode break that assumption and the result
/// is cut in the wrong place; `ContinuationMode::NewTokens` avoids it.
pub fn strip_prompt_prefix(decoded: &str, prompt: &str) -> String {
    let skip = prompt.chars().count();
    match decoded.char_indices().nth(skip) {
        Some((offset, _)) => decoded[offset..].to_string(),
        None => String::new(),
    }
}
