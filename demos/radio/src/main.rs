//! FM radio demo.
//!
//! Wires a broker, one lazily started worker host serving the `logic`,
//! `history` and `favorites` contracts, and clients that talk to it:
//! - calls made before the host is up are queued and flushed in order
//! - the worker is started on the first client and co-hosts all three contracts
//! - bookmark changes are broadcast to every connected `favorites` client
//!
//! Run:
//!   cargo run -p courier-demo-radio -- --frequency 98.5
//!   RUST_LOG=debug cargo run -p courier-demo-radio

mod station;

use courier_broker::{Broker, HostingConfig, TaskLauncher};
use courier_client::Client;
use courier_core::{ContractRegistry, DirectorySource, Hub};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("radio=info".parse()?))
        .init();

    let args: Vec<String> = std::env::args().collect();
    let frequency = flag_value::<f64>(&args, "--frequency").unwrap_or(91.1);
    let contracts = flag_value::<String>(&args, "--contracts")
        .unwrap_or_else(|| concat!(env!("CARGO_MANIFEST_DIR"), "/contracts").to_string());
    let hosting = flag_value::<String>(&args, "--hosting")
        .unwrap_or_else(|| concat!(env!("CARGO_MANIFEST_DIR"), "/hosting.toml").to_string());

    let hub = Hub::new();
    let registry = Arc::new(ContractRegistry::new(DirectorySource::new(contracts)));
    let launcher = TaskLauncher::new(hub.clone())
        .host("servers/main", station::host(registry, station::shared()));
    let broker = Broker::new(&hub, launcher).spawn();
    HostingConfig::load(&hosting)?.publish(&hub)?;

    let logic = Client::open(hub.clone(), "logic", "1.0")?;
    let favorites = Client::open(hub.clone(), "favorites", "1.0")?;
    favorites.add_event_listener("changed", |list| {
        tracing::info!("favorites changed: {}", list);
    });

    // Queued: the worker is not running yet.
    let tuned = logic.call("setFrequency", vec![json!(frequency)])?;
    let seeked = logic.call("seekUp", vec![])?;
    let bookmarked = logic.call("toggleBookmark", vec![])?;
    tracing::info!("{} calls queued while {}", logic.pending_calls(), logic.state());

    favorites.connect().await?;
    logic.connect().await?;
    tracing::info!("tuned to {} MHz", tuned.await?);
    tracing::info!("seeked to {} MHz", seeked.await?);
    tracing::info!("bookmarked: {}", bookmarked.await?);

    let dialer = logic.bound()?;
    let now = dialer.call("getFrequency", vec![])?.await?;
    if let Err(e) = dialer.call("setFrequency", vec![json!("loud")]) {
        tracing::info!("rejected before sending: {}", e);
    }
    if let Err(e) = dialer.call("setFrequency", vec![json!(150)])?.await {
        tracing::info!("rejected by the station: {}", e);
    }

    let history = Client::open(hub.clone(), "history", "1.0")?;
    history.connect().await?;
    history.call("save", vec![now.clone()])?.await?;
    tracing::info!("last station: {}", history.call("restore", vec![])?.await?);
    tracing::info!("favorites: {}", favorites.call("getAll", vec![])?.await?);

    history.disconnect().await?;
    favorites.disconnect().await?;
    logic.disconnect().await?;
    broker.shutdown().await;
    Ok(())
}

/// Value following `flag`, if present and parseable.
fn flag_value<T: FromStr>(args: &[String], flag: &str) -> Option<T> {
    let i = args.iter().position(|a| a == flag)?;
    args.get(i + 1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_values_parse_to_the_requested_type() {
        let args: Vec<String> = ["radio", "--frequency", "104.3", "--hosting", "h.toml", "--bad"]
            .into_iter()
            .map(String::from)
            .collect();

        assert_eq!(flag_value::<f64>(&args, "--frequency"), Some(104.3));
        assert_eq!(flag_value::<String>(&args, "--hosting").as_deref(), Some("h.toml"));
        assert_eq!(flag_value::<u32>(&args, "--hosting"), None);
        assert_eq!(flag_value::<String>(&args, "--bad"), None);
        assert_eq!(flag_value::<String>(&args, "--contracts"), None);
    }
}
