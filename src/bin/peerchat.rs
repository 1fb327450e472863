//! Peerchat interactive peer
//!
//! Reads commands from stdin. Settings come from `PEERCHAT_CONFIG`
//! (default `peerchat.json`) with `PEERCHAT_DIRECTORY_URL` overriding the
//! directory address.

use anyhow::Context;
use peerchat::config::Settings;
use peerchat::node::Node;
use peerchat::repl::Repl;
use tokio::io::BufReader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    peerchat::init();

    let settings = Settings::from_env().context("Failed to load settings")?;
    tracing::info!("Using directory at {}", settings.directory_url);

    let node = Node::new(settings).context("Failed to create node")?;
    let repl = Repl::new(node.clone(), BufReader::new(tokio::io::stdin()), tokio::io::stdout());

    tokio::select! {
        result = repl.run() => result.context("Command loop failed")?,
        _ = tokio::signal::ctrl_c() => {
            println!("\nExiting application by user...");
            node.logout().await;
        }
    }

    Ok(())
}
