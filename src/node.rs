//! Peer node
//!
//! [`Node`] ties the directory client, the session state and the inbound
//! listener together and exposes the operations the command loop drives:
//! register, login, connect, status, show chat, end chat and logout.
//!
//! Login and logout are serialized behind the control lock that also owns
//! the listener, so a logout followed by a login always releases the old
//! socket before the new one is bound. Directory calls are made without any
//! session lock held.

use crate::config::Settings;
use crate::connection;
use crate::directory::{DirectoryClient, PeerAddress, RegisterOutcome};
use crate::listener::{ConnectionHandler, Listener, ListenerState};
use crate::outbound::OutboundSession;
use crate::session::{ChatLine, FriendStatus, HistoryState, Identity, SessionState};
use crate::{Error, Result};
use futures_util::FutureExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// Capacity of the peer event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notifications about remote-initiated traffic
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A peer connected and identified itself
    Connected {
        /// Username from the identity frame
        username: String,
        /// Remote socket address
        addr: SocketAddr,
    },
    /// A chat line arrived
    Message {
        /// Sending peer
        from: String,
        /// Chat text
        text: String,
        /// The sender's chat is open in the foreground
        chat_active: bool,
    },
    /// A peer's connection ended
    Disconnected {
        /// Username from the identity frame
        username: String,
    },
}

/// Result of a successful login
#[derive(Debug, Clone)]
pub struct LoginSummary {
    /// Registration record of the logged-in peer
    pub identity: Identity,
    /// Friends loaded from the directory
    pub friends: Vec<String>,
    /// Address the inbound listener is bound to
    pub listen_addr: SocketAddr,
}

/// A peer process's networking and session engine
#[derive(Clone)]
pub struct Node {
    settings: Arc<Settings>,
    directory: DirectoryClient,
    session: SessionState,
    control: Arc<Mutex<Listener>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Node {
    /// Create a logged-out node talking to the configured directory
    pub fn new(settings: Settings) -> Result<Self> {
        let directory = DirectoryClient::new(&settings)?;
        Ok(Self::with_directory(settings, directory))
    }

    /// Create a logged-out node with an explicit directory client
    pub fn with_directory(settings: Settings, directory: DirectoryClient) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session: SessionState::new(settings.exclusive_active_chat),
            settings: Arc::new(settings),
            directory,
            control: Arc::new(Mutex::new(Listener::new())),
            events,
        }
    }

    /// Node settings
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Directory client
    pub fn directory(&self) -> &DirectoryClient {
        &self.directory
    }

    /// Session state
    pub fn session(&self) -> &SessionState {
        &self.session
    }

    /// Subscribe to peer events
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: PeerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Lifecycle state of the inbound listener
    pub async fn listener_state(&self) -> ListenerState {
        self.control.lock().await.state()
    }

    /// Register `username` at `ip:port` with the directory
    ///
    /// Refused while logged in.
    pub async fn register(&self, username: &str, ip: &str, port: u16) -> Result<RegisterOutcome> {
        if let Some(identity) = self.session.identity().await {
            return Err(Error::AlreadyLoggedIn(identity.username));
        }
        crate::protocol::validate_username(username)?;

        let outcome = self.directory.register(username, ip, port).await?;
        info!("Registered {} at {}:{} ({:?})", username, ip, port, outcome);
        Ok(outcome)
    }

    /// Log in as `username` and start listening on its registered port
    ///
    /// The username must be known to the directory. A friend list that
    /// cannot be fetched degrades to an empty one. If the port cannot be
    /// bound the login is rolled back and [`Error::Bind`] returned.
    pub async fn login(&self, username: &str) -> Result<LoginSummary> {
        let mut listener = self.control.lock().await;

        if let Some(identity) = self.session.identity().await {
            return Err(Error::AlreadyLoggedIn(identity.username));
        }

        let peers = self.directory.list_peers().await?;
        if !peers.iter().any(|p| p == username) {
            return Err(Error::UnknownUser(username.to_string()));
        }

        let identity: Identity = self
            .directory
            .lookup_peer(username)
            .await?
            .ok_or_else(|| Error::UnknownUser(username.to_string()))?
            .into();

        let friends = match self.directory.list_friends(username).await {
            Ok(friends) => friends,
            Err(e) => {
                warn!("Could not load friends for {}, starting with none: {}", username, e);
                Vec::new()
            }
        };

        let epoch = self.session.login(identity.clone(), friends.clone()).await;

        let listen_addr = match listener
            .start(&self.settings.listen_host, identity.port, self.connection_handler(epoch))
            .await
        {
            Ok(addr) => addr,
            Err(e) => {
                self.session.logout().await;
                return Err(e);
            }
        };

        info!("Logged in as {}", identity.username);
        Ok(LoginSummary {
            identity,
            friends,
            listen_addr,
        })
    }

    /// Stop the listener and clear the session
    ///
    /// Returns the identity that was logged out; calling it while logged out
    /// returns `None` and changes nothing.
    pub async fn logout(&self) -> Option<Identity> {
        let mut listener = self.control.lock().await;
        listener.stop().await;

        let identity = self.session.logout().await;
        if let Some(identity) = &identity {
            info!("Logged out {}", identity.username);
        }
        identity
    }

    fn connection_handler(&self, epoch: u64) -> ConnectionHandler {
        let node = self.clone();
        Arc::new(move |stream: TcpStream, addr: SocketAddr| {
            connection::handle_connection(stream, addr, node.clone(), epoch).boxed()
        })
    }

    /// Add `username` to the friend set, recording the friendship with the
    /// directory in the background when it is new
    pub async fn ensure_friend(&self, epoch: u64, username: &str) -> Result<()> {
        if !self.session.ensure_friend(epoch, username).await? {
            return Ok(());
        }

        let identity = self.session.identity_at(epoch).await?;

        let directory = self.directory.clone();
        let friend = username.to_string();
        tokio::spawn(async move {
            if let Err(e) = directory.add_friendship(&identity.username, &friend).await {
                warn!("Could not record friendship {} -> {}: {}", identity.username, friend, e);
            }
        });
        Ok(())
    }

    /// Fetch `username`'s history from the directory unless already loaded
    ///
    /// Only one successful fetch happens per friend per session. When another
    /// task is already fetching, this waits for it to settle, at most for one
    /// directory request timeout. If the directory is unavailable the log
    /// keeps its local lines and a later call tries again.
    pub async fn ensure_history_loaded(&self, epoch: u64, username: &str) -> Result<()> {
        loop {
            let settled = self.session.history_settled().notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            if self.session.begin_history_load(epoch, username).await? {
                return self.load_history(epoch, username).await;
            }
            if self.session.history_state(epoch, username).await? == HistoryState::Loaded {
                return Ok(());
            }

            debug!("History with {} is being fetched elsewhere, waiting", username);
            if tokio::time::timeout(self.settings.request_timeout(), settled).await.is_err() {
                warn!("Gave up waiting for history with {}", username);
                return Ok(());
            }
        }
    }

    async fn load_history(&self, epoch: u64, username: &str) -> Result<()> {
        let identity = self.session.identity_at(epoch).await?;

        match self.directory.fetch_history(&identity.username, username).await {
            Ok(entries) => self.session.finish_history_load(epoch, username, entries).await,
            Err(e) => {
                warn!("Could not load history with {}: {}", username, e);
                self.session.abort_history_load(epoch, username).await
            }
        }
    }

    /// Apply one chat line received from `from`
    ///
    /// The line is recorded before the history fetch, so a fetch that
    /// already contains it does not add it a second time.
    pub async fn accept_message(&self, epoch: u64, from: &str, text: &str) -> Result<()> {
        self.ensure_friend(epoch, from).await?;
        let chat_active = self.session.record_incoming(epoch, from, text).await?;
        self.ensure_history_loaded(epoch, from).await?;

        debug!("Recorded line from {} (chat active: {})", from, chat_active);
        self.publish(PeerEvent::Message {
            from: from.to_string(),
            text: text.to_string(),
            chat_active,
        });
        Ok(())
    }

    /// Friends with their unread / active flags
    pub async fn status(&self) -> Result<Vec<FriendStatus>> {
        let epoch = self.session.current_epoch().await?;
        self.session.friends(epoch).await
    }

    /// Load `username`'s history if needed, open the chat and return its lines
    pub async fn show_chat(&self, username: &str) -> Result<Vec<ChatLine>> {
        let epoch = self.session.current_epoch().await?;
        self.ensure_history_loaded(epoch, username).await?;
        self.session.open_chat(epoch, username).await
    }

    /// Move `username`'s chat to the background
    pub async fn end_chat(&self, username: &str) -> Result<()> {
        let epoch = self.session.current_epoch().await?;
        self.session.close_chat(epoch, username).await
    }

    /// Look up `username`, make it a friend, load history and dial it
    ///
    /// Returns [`Error::UnknownUser`] when the directory has no such peer
    /// and [`Error::PeerOffline`] when the dial fails; in both cases the
    /// session is left as it was apart from the friendship.
    pub async fn connect(&self, username: &str) -> Result<OutboundSession> {
        let epoch = self.session.current_epoch().await?;
        let identity = self.session.identity_at(epoch).await?;

        let peer: PeerAddress = self
            .directory
            .lookup_peer(username)
            .await?
            .ok_or_else(|| Error::UnknownUser(username.to_string()))?;

        self.ensure_friend(epoch, username).await?;
        self.ensure_history_loaded(epoch, username).await?;

        OutboundSession::dial(self.clone(), epoch, identity.username, peer).await
    }
}
