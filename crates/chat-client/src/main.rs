//! Chat client entry point
//!
//! Run with:
//! ```bash
//! CHAT_TOKEN=... cargo run -p chat-client
//! ```
//!
//! Configuration is loaded from environment variables.

use chat_client::{Client, ClientConfig, EventKind};
use chat_common::{try_init_tracing_with_config, TracingConfig};
use chat_gateway::protocol::ReadyPayload;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = try_init_tracing_with_config(TracingConfig::for_environment(config.app.env)) {
        eprintln!("Warning: Failed to initialize tracing: {e}");
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "Client failed");
        std::process::exit(1);
    }
}

async fn run(config: ClientConfig) -> anyhow::Result<()> {
    info!("Starting chat client...");

    info!(
        env = ?config.app.env,
        intents = config.gateway.intents,
        shard_count = ?config.gateway.shard_count,
        voice = config.voice.enabled,
        "Configuration loaded"
    );

    let mut client = Client::builder(config)
        .on(EventKind::Ready, |event| async move {
            let ready: ReadyPayload = event.parse()?;
            info!(
                shard_id = event.shard_id,
                user = %ready.user.username,
                session_id = %ready.session_id,
                "Logged in"
            );
            anyhow::Ok(())
        })
        .on(EventKind::MessageCreate, |event| async move {
            info!(
                shard_id = event.shard_id,
                channel_id = %event.data["channel_id"],
                "Message received"
            );
            anyhow::Ok(())
        })
        .build()?;

    tokio::select! {
        result = client.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }
    client.shutdown().await;

    Ok(())
}
