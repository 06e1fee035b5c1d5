//! Portfolio chat server.
//!
//! Entry point for the retrieval-augmented streaming chat backend.

use mimalloc::MiMalloc;

/// Global allocator for improved performance (M-MIMALLOC-APPS).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use dotenvy::dotenv;
use portfolio_chat::config::{AppConfig, load_llm_settings};
use portfolio_chat::{server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env (if present) before anything reads the environment
    let _ = dotenv();

    telemetry::init();

    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };

    // Missing LLM settings leave the agent unready instead of aborting
    let settings = load_llm_settings();
    if let Err(e) = &settings {
        tracing::error!(error = %e, "LLM settings unavailable");
    }

    server::start_server(config, settings).await
}
