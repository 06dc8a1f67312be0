use anyhow::{Context, Result};
use canary_connector::canary::CanaryClient;
use canary_connector::clock::SystemClock;
use canary_connector::config::{self, ConnectorConfig};
use canary_connector::http;
use canary_connector::pipeline::Pipeline;
use std::sync::Arc;

fn init_tracing(default_filter: &str) -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("{default_filter},canary_connector={default_filter}").into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = config::config_path();
    let generated = !config_path.exists();
    let config = ConnectorConfig::load(&config_path)?;
    init_tracing(config.log_filter())?;
    if generated {
        tracing::warn!(
            path = %config_path.display(),
            "no configuration file found; wrote documented defaults"
        );
    }
    config.validate().context("invalid configuration")?;

    tracing::info!(
        api = %config.api_base_url(),
        client_id = %config.canary.api.api_client_id,
        historians = ?config.canary.api.historian_server_name.names(),
        poll_size_mins = config.general.queue_data_poll_size_mins,
        poll_interval_ms = config.general.queue_data_poll_interval_millis,
        post_rate_ms = config.canary.api.queue_data_post_rate_millis,
        "canary-connector starting"
    );

    let client = CanaryClient::new(&config.api_base_url(), config.http_timeout())?;
    let pipeline = Pipeline::build(&config, Arc::new(client), Arc::new(SystemClock))?;
    let handle = pipeline.handle();
    let (poll, post) = pipeline.into_services();

    let cancel = handle.controls.shutdown_token();
    let poll_handle = poll.start(cancel.clone());
    let post_handle = post.start(cancel.clone());

    let http_handle = match config.status_bind() {
        Some(bind) => {
            let app = http::router(http::HttpState {
                pipeline: handle.clone(),
            });
            let listener = tokio::net::TcpListener::bind(bind)
                .await
                .with_context(|| format!("failed to bind status listener on {bind}"))?;
            tracing::info!(bind, "status HTTP listening");
            let shutdown = cancel.clone();
            Some(tokio::spawn(async move {
                axum::serve(listener, app)
                    .with_graceful_shutdown(async move { shutdown.cancelled().await })
                    .await
                    .ok();
            }))
        }
        None => None,
    };

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(err) = signal {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        }
        _ = cancel.cancelled() => {}
    }
    handle.controls.request_shutdown();

    if let Err(err) = poll_handle.await {
        tracing::warn!(error = %err, "poll loop ended abnormally");
    }
    if let Err(err) = post_handle.await {
        tracing::warn!(error = %err, "post loop ended abnormally");
    }
    if let Some(http_handle) = http_handle {
        http_handle.await.ok();
    }
    tracing::info!("canary-connector stopped");
    Ok(())
}
