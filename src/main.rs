use anyhow::{Context, Result};
use bilan_gateway::client::GeminiClient;
use bilan_gateway::core::config::Config;
use bilan_gateway::core::error::GatewayError;
use bilan_gateway::gateway::Gateway;
use bilan_gateway::providers::{GenerateRequest, GenerateResponse};
use clap::{Parser, Subcommand};
use log::{error, info, LevelFilter};
use std::path::Path;

#[derive(Parser)]
#[clap(author, version, about = "Rate-limited gateway for Gemini calls")]
struct Cli {
    /// Path to config file (defaults plus environment when absent)
    #[clap(short, long)]
    config: Option<String>,

    /// Debug mode
    #[clap(short, long)]
    debug: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send one prompt through the gateway and print the reply
    Generate {
        /// Prompt text
        #[clap(short, long)]
        prompt: String,

        /// Override the configured model
        #[clap(short, long)]
        model: Option<String>,

        /// Operation label used in logs and metrics
        #[clap(short, long, default_value = "cli")]
        label: String,

        /// Optional system instruction
        #[clap(short, long)]
        system: Option<String>,
    },

    /// Print the effective gateway settings and an empty metrics snapshot
    Metrics,
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(p) => Config::from_file(Path::new(p)),
        None => Ok(Config::from_env()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    env_logger::Builder::new().filter_level(log_level).init();

    let mut config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Generate {
            prompt,
            model,
            label,
            system,
        } => {
            if let Some(model) = model {
                config.gemini.model = model;
            }
            let client = GeminiClient::from_config(&config).context("Failed to initialise Gemini client")?;

            let mut req = GenerateRequest::from_prompt(prompt);
            req.system = system;

            let result = client.generate_request(req, &label).await;
            let metrics = client.gateway().metrics();
            info!("Gateway metrics: {}", serde_json::to_string(&metrics)?);
            client.gateway().shutdown();

            report(result)
        }
        Command::Metrics => {
            let gateway: Gateway<GenerateResponse> = Gateway::new(&config.gateway);
            let policy = gateway.policy();
            println!(
                "max_concurrency={} coalesce_window_ms={} base_delay_ms={} max_delay_ms={} max_retries={} factor={}",
                gateway.max_concurrency(),
                config.gateway.coalesce_window_ms,
                policy.base_delay.as_millis(),
                policy.max_delay.as_millis(),
                policy.max_retries,
                policy.factor
            );
            println!("{}", serde_json::to_string_pretty(&gateway.metrics())?);
            Ok(())
        }
    }
}

fn report(result: Result<GenerateResponse, GatewayError>) -> Result<()> {
    match result {
        Ok(resp) => {
            println!("{}", resp.text);
            Ok(())
        }
        Err(err) => {
            if let Some(at) = err.next_retry_at() {
                error!("Quota exhausted; retry after {}", at.to_rfc3339());
            }
            Err(err.into())
        }
    }
}
