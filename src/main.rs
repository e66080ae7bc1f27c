//! Webhook Security Gateway
//!
//! ```text
//!   Commerce platform
//!          │  POST /webhooks/{topic}
//!          ▼
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │  http (request id, trace, timeout, bounded body read)        │
//!   │     │                                                        │
//!   │     ▼                                                        │
//!   │  security::SecurityGateway                                   │
//!   │     inspector → reputation → rate_limit → signature → replay │
//!   │                              │                               │
//!   │                              ▼                               │
//!   │                  store (Redis, breaker-guarded)              │
//!   │                  └─ local fixed windows on failure           │
//!   │                                                              │
//!   │  admin API · sweeper · config reload · metrics · signals     │
//!   └──────────────────────────────────────────────────────────────┘
//!          │
//!          ▼
//!   allow / deny decision (JSON)
//! ```

use std::path::PathBuf;

use clap::Parser;

use webhook_gateway::lifecycle::startup;

#[derive(Parser)]
#[command(name = "webhook-gateway")]
#[command(about = "Security gateway for inbound commerce webhooks", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config/gateway.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    startup::run(&cli.config).await?;
    Ok(())
}
