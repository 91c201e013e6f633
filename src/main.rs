// Web server entry point
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use generate_server::api;
use generate_server::config::ServerConfig;
use generate_server::models::llama::LlamaInferenceModel;
use generate_server::state::AppState;
use std::sync::Arc;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load .env before the logger so RUST_LOG set there is honored
    let dotenv = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Ok(path) = dotenv {
        log::info!("loaded environment from {}", path.display());
    }

    let config = ServerConfig::from_env()?;
    let device = config.model.device.build()?;
    log::info!("Using device {:?} with dtype {:?}", device, config.model.dtype);

    let llama_model = LlamaInferenceModel::load_from_hub(&config.model, device)?;
    log::info!("Loaded model {}", config.model.model_id);

    let shared_state = web::Data::new(AppState::new(
        Arc::new(llama_model),
        config.generation.clone(),
    ));

    let mut server = HttpServer::new(move || {
        App::new()
            .app_data(shared_state.clone())
            .wrap(Logger::default())
            .configure(api::configure)
    });
    if let Some(workers) = config.workers {
        server = server.workers(workers.get());
    }

    log::info!("Listening on http://{}:{}", config.host, config.port);
    server
        .bind((config.host.as_str(), config.port))?
        .run()
        .await?;
    Ok(())
}
