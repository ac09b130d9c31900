//! Bracket Daemon
//!
//! Runs the protective-order engine against ProjectX, or against the
//! in-memory broker when `BRACKET_ENV=test`.
//!
//! # Usage
//!
//! ```bash
//! # Paper run on the in-memory broker
//! BRACKET_ENV=test BRACKET_API_PORT=8081 cargo run -p bracketd
//!
//! # Live
//! BRACKET_PROJECTX_USERNAME=... BRACKET_PROJECTX_API_KEY=... cargo run -p bracketd
//! ```
//!
//! # Environment Variables
//!
//! - `BRACKET_ENV`: Environment (test, development, production)
//! - `BRACKET_API_HOST`: API host (default: 0.0.0.0)
//! - `BRACKET_API_PORT`: API port (default: 8080)
//! - `BRACKET_INSTRUMENT`: Contract id (default: CON.F.US.MGC.Z25)
//! - `BRACKET_POLL_INTERVAL_SECS`: Status poll interval (default: 10)
//! - `BRACKET_LOG_JSON`: Emit JSON log lines when set to 1

use bracketd::{Config, Daemon, Environment};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("bracketd=info".parse()?);
    if config.log_json {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        api_host = %config.api.host,
        api_port = config.api.port,
        "Bracket Daemon"
    );

    // Create and run daemon
    match config.environment {
        Environment::Test => Daemon::new_stub(config)?.run().await?,
        Environment::Development | Environment::Production => Daemon::new_projectx(config).await?.run().await?,
    }

    Ok(())
}
