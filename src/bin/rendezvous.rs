//! Peerchat rendezvous directory
//!
//! Usage: `peerchat-rendezvous [settings.json]`. Without a settings file the
//! server binds `0.0.0.0:8000` and stores data in `rendezvous.db`.

use anyhow::Context;
use peerchat::config::RendezvousSettings;
use peerchat::rendezvous::{DirectoryStore, RendezvousServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peerchat::init();

    let settings = match std::env::args().nth(1) {
        Some(path) => RendezvousSettings::load(&path).with_context(|| format!("Failed to load {}", path))?,
        None => RendezvousSettings::default(),
    };

    let store = DirectoryStore::new(&settings.database_path)
        .with_context(|| format!("Failed to open database {}", settings.database_path))?;

    let mut server = RendezvousServer::new(store);
    let addr = server
        .start(&settings.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.bind_addr))?;
    tracing::info!("Rendezvous directory ready on {}", addr);

    tokio::signal::ctrl_c().await.context("Failed to wait for Ctrl+C")?;
    server.stop().await;

    Ok(())
}
