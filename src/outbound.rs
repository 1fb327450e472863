//! Outbound chat session
//!
//! Dials a peer, sends the identity frame and then relays the user's lines.
//! Each line is written to the socket, persisted with the directory and
//! recorded in the local log, in that order. If the write fails the line is
//! still persisted and recorded, the result is reported as
//! [`DeliveryStatus::Unconfirmed`], and the chat ends.

use crate::directory::PeerAddress;
use crate::node::{Node, PeerEvent};
use crate::protocol::{frame_writer, validate_chat_text, write_frame, write_identity, FrameWriter};
use crate::{Error, Result};
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};
use tokio::net::TcpStream;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

/// Line that ends the chat without sending anything
pub const EXIT_COMMAND: &str = "exit";

const CHAT_PROMPT: &[u8] = b"message (type 'exit' to end)> ";

/// What happened to a relayed line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Written and flushed to the peer's socket
    Delivered,
    /// The write failed; the line is kept locally and in the directory, but
    /// the peer may not have received it
    Unconfirmed,
}

/// Why an interactive chat ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatEnd {
    /// The user typed `exit`
    UserExit,
    /// The input stream ended
    InputClosed,
    /// The peer's socket broke
    PeerGone,
}

/// `true` for `exit` in any letter case
pub fn is_exit_command(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(EXIT_COMMAND)
}

/// An open connection to a peer
pub struct OutboundSession {
    node: Node,
    epoch: u64,
    me: String,
    peer: PeerAddress,
    writer: FrameWriter<TcpStream>,
}

impl OutboundSession {
    /// Dial `peer` and identify as `me`
    ///
    /// Refusal, timeout or a failed identity write all become
    /// [`Error::PeerOffline`].
    pub async fn dial(node: Node, epoch: u64, me: String, peer: PeerAddress) -> Result<Self> {
        let addr = peer.socket_addr();
        let timeout = node.settings().connect_timeout();

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                info!("Peer {} at {} unreachable: {}", peer.username, addr, e);
                return Err(Error::PeerOffline(peer.username));
            }
            Err(_) => {
                info!("Peer {} at {} did not answer within {:?}", peer.username, addr, timeout);
                return Err(Error::PeerOffline(peer.username));
            }
        };

        let mut writer = frame_writer(stream, node.settings().max_frame_bytes);
        if let Err(e) = write_identity(&mut writer, &me).await {
            warn!("Failed to identify to {}: {}", peer.username, e);
            return Err(Error::PeerOffline(peer.username));
        }

        info!("Connected to {} at {}", peer.username, addr);
        Ok(Self {
            node,
            epoch,
            me,
            peer,
            writer,
        })
    }

    /// The peer this session talks to
    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    /// Send one line, persist it and record it locally
    ///
    /// Text that cannot be framed is rejected with [`Error::Protocol`]
    /// before anything is sent.
    pub async fn relay(&mut self, text: &str) -> Result<DeliveryStatus> {
        validate_chat_text(text, self.node.settings().max_frame_bytes)?;

        let status = match write_frame(&mut self.writer, text).await {
            Ok(()) => DeliveryStatus::Delivered,
            Err(e) => {
                info!("{} disconnected: {}", self.peer.username, e);
                DeliveryStatus::Unconfirmed
            }
        };

        if let Err(e) = self
            .node
            .directory()
            .persist_message(&self.me, &self.peer.username, text)
            .await
        {
            warn!("Could not persist line to {}: {}", self.peer.username, e);
        }

        self.node
            .session()
            .record_outgoing(self.epoch, &self.peer.username, text)
            .await?;

        debug!("Relayed line to {} ({:?})", self.peer.username, status);
        Ok(status)
    }

    /// Relay lines from `input` until `exit`, end of input or a broken socket
    ///
    /// Prompts and notices are written to `out`. With `events`, lines that
    /// arrive from this peer, or for the active chat, are printed while
    /// waiting for input. The socket is closed on every exit path.
    pub async fn run<R, W>(
        mut self,
        input: &mut Lines<R>,
        out: &mut W,
        events: Option<&mut broadcast::Receiver<PeerEvent>>,
    ) -> Result<ChatEnd>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self.chat_loop(input, out, events).await;
        self.close().await;
        result
    }

    async fn chat_loop<R, W>(
        &mut self,
        input: &mut Lines<R>,
        out: &mut W,
        mut events: Option<&mut broadcast::Receiver<PeerEvent>>,
    ) -> Result<ChatEnd>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            out.write_all(CHAT_PROMPT).await?;
            out.flush().await?;

            let Some(line) = self.next_line(input, out, &mut events).await? else {
                return Ok(ChatEnd::InputClosed);
            };
            let line = line.trim();

            if is_exit_command(line) {
                out.write_all(b"Chat ended\n").await?;
                return Ok(ChatEnd::UserExit);
            }
            if line.is_empty() {
                continue;
            }

            match self.relay(line).await {
                Ok(DeliveryStatus::Delivered) => {}
                Ok(DeliveryStatus::Unconfirmed) => {
                    let notice = format!(
                        "{} disconnected; last message saved but delivery unconfirmed\n",
                        self.peer.username
                    );
                    out.write_all(notice.as_bytes()).await?;
                    return Ok(ChatEnd::PeerGone);
                }
                Err(Error::Protocol(reason)) => {
                    out.write_all(format!("Not sent: {}\n", reason).as_bytes()).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Wait for the next input line, printing incoming lines meanwhile
    async fn next_line<R, W>(
        &self,
        input: &mut Lines<R>,
        out: &mut W,
        events: &mut Option<&mut broadcast::Receiver<PeerEvent>>,
    ) -> Result<Option<String>>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let event = match events.as_deref_mut() {
                Some(receiver) => tokio::select! {
                    line = input.next_line() => return Ok(line?),
                    event = receiver.recv() => event,
                },
                None => return Ok(input.next_line().await?),
            };

            match event {
                Ok(PeerEvent::Message {
                    from,
                    text,
                    chat_active,
                }) if chat_active || from == self.peer.username => {
                    out.write_all(format!("\n[{}]: {}\n", from, text).as_bytes()).await?;
                    out.write_all(CHAT_PROMPT).await?;
                    out.flush().await?;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => debug!("Missed {} peer events", missed),
                Err(RecvError::Closed) => *events = None,
            }
        }
    }

    /// Close the connection
    pub async fn close(mut self) {
        if let Err(e) = self.writer.get_mut().shutdown().await {
            debug!("Error closing connection to {}: {}", self.peer.username, e);
        }
        info!("Connection to {} closed", self.peer.username);
    }
}
