pub mod account;
pub mod config;
pub mod db;
pub mod error;

pub use account::AccountService;
pub use config::AccountConfig;
pub use error::{Error, FieldError};

/// Installs the tracing subscriber for embedding binaries. Reads `RUST_LOG`
/// for the filter and `LOG_FORMAT=json` for structured output.
pub fn init_tracing() {
    dotenvy::dotenv().ok();

    let env_filter =
        std::env::var("RUST_LOG").unwrap_or_else(|_| "uaa_core=debug".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}
