//! Session state owner
//!
//! [`SessionState`] is the only writer of the identity, friend set and
//! conversations. Every operation takes the one session lock, applies a pure
//! state transition and releases it; none of them perform network I/O, so a
//! slow directory or peer never holds up other tasks.
//!
//! Each login starts a new epoch. Operations carry the epoch of the caller
//! and fail with [`Error::SessionClosed`] once that session has ended, which
//! is how connection handlers from a previous login find out they should
//! stop.

use crate::directory::{HistoryEntry, PeerAddress};
use crate::session::conversation::{ChatLine, Conversation, HistoryState};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info};

/// The logged-in peer's own registration record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Username
    pub username: String,
    /// Advertised IP address
    pub ip: String,
    /// Listening port
    pub port: u16,
}

impl From<PeerAddress> for Identity {
    fn from(peer: PeerAddress) -> Self {
        Self {
            username: peer.username,
            ip: peer.ip,
            port: peer.port,
        }
    }
}

/// Friend entry for the `status` listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendStatus {
    /// Friend username
    pub username: String,
    /// Unread lines are waiting
    pub has_unread: bool,
    /// Chat is open in the foreground
    pub chat_active: bool,
}

#[derive(Debug)]
struct ActiveSession {
    epoch: u64,
    identity: Identity,
    friends: BTreeSet<String>,
    conversations: HashMap<String, Conversation>,
}

impl ActiveSession {
    fn conversation(&mut self, friend: &str) -> &mut Conversation {
        self.conversations
            .entry(friend.to_string())
            .or_insert_with(|| Conversation::new(friend.to_string()))
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_epoch: u64,
    active: Option<ActiveSession>,
}

impl Inner {
    fn session(&mut self, epoch: u64) -> Result<&mut ActiveSession> {
        match self.active.as_mut() {
            Some(session) if session.epoch == epoch => Ok(session),
            _ => Err(Error::SessionClosed),
        }
    }
}

/// Shared handle to the session state
#[derive(Debug, Clone)]
pub struct SessionState {
    inner: Arc<Mutex<Inner>>,
    history_settled: Arc<Notify>,
    exclusive_active_chat: bool,
}

impl SessionState {
    /// Create an empty, logged-out session state
    ///
    /// With `exclusive_active_chat`, opening one chat moves every other chat
    /// to the background.
    pub fn new(exclusive_active_chat: bool) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            history_settled: Arc::new(Notify::new()),
            exclusive_active_chat,
        }
    }

    /// Install a new session, discarding any previous one
    ///
    /// Every friend starts with an unfetched log and both flags cleared.
    /// Returns the epoch of the new session.
    pub async fn login(&self, identity: Identity, friends: Vec<String>) -> u64 {
        let mut inner = self.inner.lock().await;
        inner.next_epoch += 1;
        let epoch = inner.next_epoch;

        let conversations = friends
            .iter()
            .map(|f| (f.clone(), Conversation::new(f.clone())))
            .collect();

        info!("Session {} started for {} with {} friends", epoch, identity.username, friends.len());
        inner.active = Some(ActiveSession {
            epoch,
            identity,
            friends: friends.into_iter().collect(),
            conversations,
        });
        epoch
    }

    /// Clear identity, friends, logs and flags
    ///
    /// Returns the identity that was logged in, or `None` if there was no
    /// session, so repeated calls are harmless.
    pub async fn logout(&self) -> Option<Identity> {
        let mut inner = self.inner.lock().await;
        let ended = inner.active.take()?;
        info!("Session {} ended for {}", ended.epoch, ended.identity.username);
        self.history_settled.notify_waiters();
        Some(ended.identity)
    }

    /// Epoch of the current session
    pub async fn current_epoch(&self) -> Result<u64> {
        let inner = self.inner.lock().await;
        inner.active.as_ref().map(|s| s.epoch).ok_or(Error::NotLoggedIn)
    }

    /// Identity of the current session, if any
    pub async fn identity(&self) -> Option<Identity> {
        let inner = self.inner.lock().await;
        inner.active.as_ref().map(|s| s.identity.clone())
    }

    /// Identity of the session started at `epoch`
    pub async fn identity_at(&self, epoch: u64) -> Result<Identity> {
        let mut inner = self.inner.lock().await;
        Ok(inner.session(epoch)?.identity.clone())
    }

    /// Whether a session is active
    pub async fn is_logged_in(&self) -> bool {
        self.inner.lock().await.active.is_some()
    }

    /// Add `username` to the friend set
    ///
    /// Returns `true` if the friend was new; the caller is then responsible
    /// for recording the friendship with the directory.
    pub async fn ensure_friend(&self, epoch: u64, username: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let session = inner.session(epoch)?;

        session.conversation(username);
        let added = session.friends.insert(username.to_string());
        if added {
            debug!("Added {} to friend set", username);
        }
        Ok(added)
    }

    /// Whether `username` is in the friend set
    pub async fn is_friend(&self, epoch: u64, username: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.session(epoch)?.friends.contains(username))
    }

    /// Woken whenever an in-flight history fetch finishes or is abandoned,
    /// and when the session ends
    ///
    /// Tasks that find a fetch in flight register with
    /// [`Notified::enable`](tokio::sync::futures::Notified::enable) before
    /// checking the state again, then wait.
    pub fn history_settled(&self) -> &Notify {
        &self.history_settled
    }

    /// Claim the one history fetch for `username`
    ///
    /// Returns `true` if the caller must fetch the history and report back
    /// with [`finish_history_load`](Self::finish_history_load) or
    /// [`abort_history_load`](Self::abort_history_load). Returns `false`
    /// when the history is already loaded or another task is loading it.
    pub async fn begin_history_load(&self, epoch: u64, username: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.session(epoch)?.conversation(username).begin_load())
    }

    /// Install fetched history for `username`
    pub async fn finish_history_load(&self, epoch: u64, username: &str, entries: Vec<HistoryEntry>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let session = inner.session(epoch)?;
        let me = session.identity.username.clone();

        let fetched = entries
            .into_iter()
            .map(|entry| ChatLine::from_history(entry, &me))
            .collect::<Vec<_>>();
        debug!("Loaded {} history lines for {}", fetched.len(), username);

        session.conversation(username).finish_load(fetched);
        self.history_settled.notify_waiters();
        Ok(())
    }

    /// Return `username` to the unfetched state after a failed fetch
    pub async fn abort_history_load(&self, epoch: u64, username: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.session(epoch)?.conversation(username).abort_load();
        self.history_settled.notify_waiters();
        Ok(())
    }

    /// Hydration state of `username`'s log
    pub async fn history_state(&self, epoch: u64, username: &str) -> Result<HistoryState> {
        let mut inner = self.inner.lock().await;
        Ok(inner
            .session(epoch)?
            .conversations
            .get(username)
            .map(|c| c.history)
            .unwrap_or(HistoryState::NotLoaded))
    }

    /// Append a line received from `from`
    ///
    /// Sets the unread flag exactly when the chat is not active. Returns
    /// whether the chat is active, so the caller can display the line.
    pub async fn record_incoming(&self, epoch: u64, from: &str, text: &str) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        let conversation = inner.session(epoch)?.conversation(from);
        conversation.receive(ChatLine::from_peer(from, text));
        Ok(conversation.chat_active)
    }

    /// Append a line the local user sent to `to`
    pub async fn record_outgoing(&self, epoch: u64, to: &str, text: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.session(epoch)?.conversation(to).append(ChatLine::mine(text));
        Ok(())
    }

    /// Open `username`'s chat and return a snapshot of its lines
    pub async fn open_chat(&self, epoch: u64, username: &str) -> Result<Vec<ChatLine>> {
        let mut inner = self.inner.lock().await;
        let session = inner.session(epoch)?;

        if self.exclusive_active_chat {
            for (friend, conversation) in session.conversations.iter_mut() {
                if friend != username {
                    conversation.close();
                }
            }
        }

        let conversation = session.conversation(username);
        conversation.open();
        Ok(conversation.lines.clone())
    }

    /// Move `username`'s chat to the background
    pub async fn close_chat(&self, epoch: u64, username: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(conversation) = inner.session(epoch)?.conversations.get_mut(username) {
            conversation.close();
        }
        Ok(())
    }

    /// Snapshot of `username`'s conversation
    pub async fn conversation(&self, epoch: u64, username: &str) -> Result<Option<Conversation>> {
        let mut inner = self.inner.lock().await;
        Ok(inner.session(epoch)?.conversations.get(username).cloned())
    }

    /// Friends sorted by username, with their flags
    pub async fn friends(&self, epoch: u64) -> Result<Vec<FriendStatus>> {
        let mut inner = self.inner.lock().await;
        let session = inner.session(epoch)?;

        Ok(session
            .friends
            .iter()
            .map(|friend| {
                let (has_unread, chat_active) = session
                    .conversations
                    .get(friend)
                    .map(|c| (c.has_unread, c.chat_active))
                    .unwrap_or((false, false));
                FriendStatus {
                    username: friend.clone(),
                    has_unread,
                    chat_active,
                }
            })
            .collect())
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new(true)
    }
}
