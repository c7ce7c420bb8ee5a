use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ouicache::config::Config;
use ouicache::dht::MainlineDht;
use ouicache::serve;
use ouicache::store::Store;
use ouicache::swarm;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const ANNOUNCE_PERIOD: Duration = Duration::from_secs(10 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::new();

    let cache_key = match &config.cache_key {
        Some(b64) => {
            let bytes = B64.decode(b64).context("cache key is not valid base64")?;
            let key: [u8; 32] = bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("cache key must be 32 bytes"))?;
            Some(key)
        }
        None => None,
    };

    let store = Store::new(config.cache_dir.clone());
    let cancel = CancellationToken::new();

    let dht = MainlineDht::bind(
        &config.dht_endpoint,
        config.bootstrap.clone(),
        Some(config.cache_dir.clone()),
    )
    .await
    .context("binding DHT endpoints")?;
    info!(endpoints = ?dht.local_endpoints(), "dht started");

    let listener = TcpListener::bind(config.serve_endpoint)
        .await
        .context("binding serve endpoint")?;
    info!(endpoint = %config.serve_endpoint, "serving cached responses");
    tokio::spawn(serve::serve(listener, store.clone(), cancel.child_token()));

    if config.announce {
        let Some(public_key) = cache_key else {
            anyhow::bail!("--announce requires --cache-key");
        };
        let announce_port = config.serve_endpoint.port();
        let dht_handle = dht;
        let announce_cancel = cancel.child_token();
        let announcer = async move {
            if dht_handle
                .wait_all_ready(&announce_cancel)
                .await
                .is_err()
            {
                return;
            }
            info!("dht ready, announcing cached entries");

            loop {
                announce_entries(
                    &dht_handle,
                    &store,
                    &public_key,
                    announce_port,
                    &announce_cancel,
                )
                .await;

                tokio::select! {
                    _ = announce_cancel.cancelled() => return,
                    _ = tokio::time::sleep(ANNOUNCE_PERIOD) => {}
                }
            }
        };

        tokio::select! {
            _ = announcer => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    info!("shutting down");
    cancel.cancel();
    Ok(())
}

/// Announce every stored entry on its uri swarm.
async fn announce_entries(
    dht: &MainlineDht,
    store: &Store,
    public_key: &[u8; 32],
    port: u16,
    cancel: &CancellationToken,
) {
    let keys = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let listing = store
        .for_each(
            |mut entry| {
                let cancel = cancel.clone();
                let keys = keys.clone();
                async move {
                    if let Ok(Some(part)) = entry.read_part(&cancel).await {
                        if let Some(head) = part.as_head() {
                            if let Some(uri) = head.get(ouicache::sign::HDR_URI) {
                                keys.lock().unwrap().push(uri.to_owned());
                            }
                        }
                    }
                    Ok(true)
                }
            },
            cancel,
        )
        .await;
    if let Err(e) = listing {
        warn!(?e, "listing cached entries failed");
        return;
    }

    let keys = keys.lock().unwrap().clone();
    for key in keys {
        let name = swarm::uri_swarm_name(public_key, &key);
        let infohash = swarm::swarm_infohash(&name);
        match dht.tracker_announce(infohash, Some(port), cancel).await {
            Ok(peers) => info!(%key, swarm = %name, peers = peers.len(), "announced"),
            Err(e) => warn!(%key, ?e, "announce failed"),
        }
    }
}
