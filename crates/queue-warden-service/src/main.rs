//! # Queue Warden Service
//!
//! Binary entry point. Loads server settings, discovers broker bindings
//! from the environment, constructs one backend per binding, and starts
//! the HTTP server from queue-warden-api.

mod config;

use crate::config::{discover_broker_configs, BrokerConfig};
use broker_runtime::{ActiveMqBackend, BrokerAdapter, MemoryBackend, RabbitMqBackend, SqsBackend};
use queue_warden_api::{start_server, AdapterMap, ServerConfig};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "queue_warden_service=info,queue_warden_api=info,broker_runtime=info,tower_http=debug"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Queue Warden");

    // -------------------------------------------------------------------------
    // Server settings
    //
    // Environment variables prefixed QW__ (double-underscore separator),
    // e.g. QW__PORT=9090. Every field carries a serde default, so an
    // unconfigured environment yields the built-in listen address.
    // Broker bindings use the separate BROKER{i}_ slot scheme; see the
    // config module.
    // -------------------------------------------------------------------------
    let server_config: ServerConfig = match ::config::Config::builder()
        .add_source(
            ::config::Environment::with_prefix("QW")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(::config::Config::try_deserialize)
    {
        Ok(server_config) => server_config,
        Err(e) => {
            error!(error = %e, "Failed to load server configuration; aborting");
            std::process::exit(3);
        }
    };

    let broker_configs = discover_broker_configs();
    let mut adapters = build_adapters(&broker_configs).await;

    // The seeded in-memory binding is always available so the UI has
    // something to browse before any real broker is configured.
    adapters.insert(
        "test".to_string(),
        Arc::new(MemoryBackend::seeded()) as Arc<dyn BrokerAdapter>,
    );

    start_server(server_config, adapters).await?;
    Ok(())
}

/// Construct one backend per discovered binding. A binding whose backend
/// cannot be constructed is logged and skipped; the service still starts
/// with the remaining bindings.
async fn build_adapters(configs: &[BrokerConfig]) -> AdapterMap {
    let mut adapters = AdapterMap::new();

    for config in configs {
        let adapter: Option<Arc<dyn BrokerAdapter>> = match config.kind.as_str() {
            "amq" => match ActiveMqBackend::connect(
                &config.url,
                &config.user,
                &config.pass,
                config.extra("CONSOLE_URL"),
                config.extra("CONSOLE_USER"),
                config.extra("CONSOLE_PASS"),
            )
            .await
            {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    error!(broker = %config.name, error = %e, "Adapter construction failed");
                    None
                }
            },
            "rabbitmq" => match RabbitMqBackend::connect(
                &config.url,
                config.extra("CONSOLE_URL"),
                &config.user,
                &config.pass,
                config.extra("HOST"),
            )
            .await
            {
                Ok(backend) => {
                    info!(broker = %config.name, "Connected to management-API broker");
                    Some(Arc::new(backend))
                }
                Err(e) => {
                    error!(broker = %config.name, error = %e, "Adapter construction failed");
                    None
                }
            },
            "sqs" => match SqsBackend::new(
                config.extra("REGION"),
                config.extra("ACCESS_KEY"),
                config.extra("SECRET_KEY"),
            ) {
                Ok(backend) => Some(Arc::new(backend)),
                Err(e) => {
                    error!(broker = %config.name, error = %e, "Adapter construction failed");
                    None
                }
            },
            other => {
                warn!(broker = %config.name, kind = %other, "Broker type not supported");
                None
            }
        };

        if let Some(adapter) = adapter {
            adapters.insert(config.name.clone(), adapter);
        }
    }

    adapters
}
