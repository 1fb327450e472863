//! Inbound connection handler
//!
//! One handler per accepted connection: read the identity frame, make the
//! peer a friend, then apply every following frame as a chat line from that
//! peer until the connection closes. No retries; the socket is closed when
//! the handler returns.

use crate::node::{Node, PeerEvent};
use crate::protocol::{frame_reader, read_frame, read_identity};
use crate::{Error, Result};
use std::io::ErrorKind;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Serve one inbound connection for the session started at `epoch`
pub async fn handle_connection(stream: TcpStream, remote_addr: SocketAddr, node: Node, epoch: u64) {
    match serve_peer(stream, remote_addr, &node, epoch).await {
        Ok(()) => {}
        Err(Error::SessionClosed) => debug!("Session ended, dropping connection from {}", remote_addr),
        Err(Error::Io(e)) if e.kind() == ErrorKind::ConnectionReset => {
            info!("Connection from {} reset", remote_addr)
        }
        Err(e) => warn!("Connection from {} failed: {}", remote_addr, e),
    }
}

async fn serve_peer(stream: TcpStream, remote_addr: SocketAddr, node: &Node, epoch: u64) -> Result<()> {
    let mut reader = frame_reader(stream, node.settings().max_frame_bytes);

    let Some(username) = read_identity(&mut reader).await? else {
        debug!("{} closed before identifying", remote_addr);
        return Ok(());
    };

    info!("{} connected from {}", username, remote_addr);
    node.ensure_friend(epoch, &username).await?;
    node.publish(PeerEvent::Connected {
        username: username.clone(),
        addr: remote_addr,
    });

    let result = receive_lines(&mut reader, &username, node, epoch).await;

    info!("{} disconnected", username);
    node.publish(PeerEvent::Disconnected { username });
    result
}

async fn receive_lines(
    reader: &mut crate::protocol::FrameReader<TcpStream>,
    username: &str,
    node: &Node,
    epoch: u64,
) -> Result<()> {
    while let Some(text) = read_frame(reader).await? {
        if text.is_empty() {
            debug!("Skipping empty frame from {}", username);
            continue;
        }
        debug!("Frame from {}: {} bytes", username, text.len());
        node.accept_message(epoch, username, &text).await?;
    }
    Ok(())
}
