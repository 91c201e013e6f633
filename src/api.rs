// API routes and handlers
use crate::error::ApiError;
use crate::generation;
use crate::runtime::GenerationParams;
use crate::state::AppState;
use actix_web::{post, web, HttpResponse};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Deserialize)]
pub struct GenerateRequest {
    pub prompt: Option<String>,
    pub max_new_tokens: Option<usize>,
}

impl GenerateRequest {
    /// Parses the body as JSON whatever the declared content type; it must be an object.
    pub fn from_body(body: &[u8]) -> Result<Self, ApiError> {
        let value: serde_json::Value =
            serde_json::from_slice(body).map_err(|e| ApiError::MalformedBody(e.to_string()))?;
        if !value.is_object() {
            return Err(ApiError::MalformedBody(
                "expected a JSON object".to_string(),
            ));
        }
        serde_json::from_value(value).map_err(|e| ApiError::MalformedBody(e.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub response: String,
}

#[post("/api/generate")]
pub async fn generate(
    state: web::Data<AppState>,
    body: web::Bytes,
) -> Result<HttpResponse, ApiError> {
    let request = GenerateRequest::from_body(&body)?;
    let prompt = request.prompt.unwrap_or_default();
    let params = GenerationParams {
        max_new_tokens: state
            .generation
            .resolve_max_new_tokens(request.max_new_tokens),
        temperature: state.generation.temperature,
        seed: state.generation.seed(),
    };
    log::info!(
        "Generating up to {} tokens for a {}-character prompt",
        params.max_new_tokens,
        prompt.chars().count()
    );

    // Decoding blocks for the whole generation, keep it off the async workers
    let runtime = state.runtime.clone();
    let mode = state.generation.continuation;
    let result = web::block(move || {
        generation::generate_continuation(runtime.as_ref(), &prompt, &params, mode)
    })
    .await??;

    log::info!(
        "Generated {} tokens after a {}-token prompt",
        result.generated_tokens,
        result.prompt_tokens
    );
    Ok(HttpResponse::Ok().json(GenerateResponse {
        response: result.text,
    }))
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(generate);
}
