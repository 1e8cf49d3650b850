mod server;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use linkhub_core::{config::load_config, logging};

use server::LinkHubServer;

#[derive(Parser, Debug)]
#[command(name = "linkhub")]
#[command(about = "LinkHub real-time connection hub", long_about = None)]
struct Args {
    /// YAML config file (defaults to ./config.yaml when present)
    #[arg(long, env = "LINKHUB_CONFIG_PATH")]
    config: Option<String>,

    /// Listen host, overrides `server.host`
    #[arg(long, env = "LINKHUB_HOST")]
    host: Option<String>,

    /// Listen port, overrides `server.port`
    #[arg(long, env = "LINKHUB_PORT")]
    port: Option<u16>,

    /// Redis URL for the presence store; empty keeps presence in memory
    #[arg(long, env = "LINKHUB_REDIS_URL")]
    redis_url: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration, then apply CLI overrides
    let mut config = load_config(args.config.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(redis_url) = args.redis_url {
        config.redis.url = redis_url;
    }

    // 2. Validate (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("LinkHub starting...");
    info!("Listen address: {}", config.listen_address());

    // 4. Build and run
    let server = LinkHubServer::build(config).await?;
    server.run().await
}
