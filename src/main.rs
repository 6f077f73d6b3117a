use std::sync::Arc;

use duplex_rpc::{
    config::Config,
    engine::{Engine, EngineOptions},
    logging,
    message::{ErrorObject, Request},
    transport::http::{build_router, HttpServerTransport, HttpTransportState},
    transport::Transport,
};
use serde_json::json;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_logging();

    let config = Config::from_env()?;

    let engine = Engine::with_options(EngineOptions {
        default_request_timeout: config.request_timeout,
        ..EngineOptions::default()
    });
    engine.register("ping", |_request, _context| async move { Ok(json!({})) });
    engine.register("echo", |request: Request, _context| async move {
        request
            .params
            .ok_or_else(|| ErrorObject::invalid_params("params required"))
    });

    let transport = HttpServerTransport::new();
    engine
        .connect(Arc::clone(&transport) as Arc<dyn Transport>)
        .await?;

    let state = HttpTransportState::new(config.api_token.clone(), transport);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_socket()?).await?;

    info!(
        bind_addr = %config.bind_addr,
        bind_port = config.bind_port,
        "server starting"
    );

    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}
