use std::path::PathBuf;

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde_json::{json, Value};

use webhook_gateway::security::signature::sign;

#[derive(Parser)]
#[command(name = "gateway-cli")]
#[command(about = "Management CLI for the webhook security gateway", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    /// Admin API key. Falls back to `ADMIN_API_KEY`.
    #[arg(short, long, env = "ADMIN_API_KEY", default_value = "")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Security metrics snapshot and running configuration
    Status,
    /// List blocked source addresses
    BlockedIps,
    /// Derived health status
    Health,
    /// Lift the block on an address
    Unblock { ip: std::net::IpAddr },
    /// Run the synthetic security self-test
    TestSecurity,
    /// Print the signature header for a payload file
    Sign {
        #[arg(long, env = "WEBHOOK_SECRET")]
        secret: String,
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if let Commands::Sign { secret, file } = &cli.command {
        let body = std::fs::read(file)?;
        println!("{}", sign(secret.as_bytes(), &body));
        return Ok(());
    }

    let client = reqwest::Client::new();
    let mut headers = HeaderMap::new();
    headers.insert(
        AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", cli.key))?,
    );
    let base = cli.url.trim_end_matches('/');

    let res = match cli.command {
        Commands::Status => {
            client.get(format!("{}/admin/security/status", base))
                .headers(headers)
                .send()
                .await?
        }
        Commands::BlockedIps => {
            client.get(format!("{}/admin/security/blocked-ips", base))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Health => {
            client.get(format!("{}/admin/security/health", base))
                .headers(headers)
                .send()
                .await?
        }
        Commands::Unblock { ip } => {
            client.post(format!("{}/admin/security", base))
                .headers(headers)
                .json(&json!({ "action": "unblock-ip", "ip": ip }))
                .send()
                .await?
        }
        Commands::TestSecurity => {
            client.post(format!("{}/admin/security", base))
                .headers(headers)
                .json(&json!({ "action": "test-security" }))
                .send()
                .await?
        }
        Commands::Sign { .. } => return Ok(()),
    };
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    let text = res.text().await?;

    // Degraded health comes back as 503 with a useful body.
    match serde_json::from_str::<Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) if !status.is_success() => {
            eprintln!("Error: Admin API returned status {}", status);
            if !text.is_empty() {
                eprintln!("Response: {}", text);
            }
        }
        Err(e) => return Err(e.into()),
    }
    if !status.is_success() {
        std::process::exit(1);
    }
    Ok(())
}
