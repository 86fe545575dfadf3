use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use sluice_engine::{Relay, UpstreamConfig};

use crate::api::{ApiServer, AppState};
use crate::cli::ServeArgs;

/// Run the relay until ctrl-c.
pub async fn run(args: ServeArgs, upstream: UpstreamConfig) -> anyhow::Result<()> {
    let config = args.relay_config(upstream);
    info!(
        cache = config.cache.enabled,
        segment_ttl_secs = config.cache.segment_ttl.as_secs(),
        playlist_ttl_secs = config.cache.playlist_ttl.as_secs(),
        public_base = %config.manifest.public_base,
        "Starting relay"
    );

    let relay = Relay::with_http(config).context("Failed to build upstream client")?;
    let server = ApiServer::new(args.server_config(), AppState::new(Arc::new(relay)));

    let cancel = server.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received ctrl-c");
        }
        cancel.cancel();
    });

    server.run().await
}
