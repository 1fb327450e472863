//! Per-friend conversation management

use crate::directory::HistoryEntry;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Who wrote a chat line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sender {
    /// The logged-in user
    Me,
    /// A remote peer
    Peer(String),
}

/// One line of a conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    /// Chat text
    pub text: String,
    /// Author of the line
    pub sender: Sender,
}

impl ChatLine {
    /// Line written by the local user
    pub fn mine(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::Me,
        }
    }

    /// Line written by `from`
    pub fn from_peer(from: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            sender: Sender::Peer(from.into()),
        }
    }

    /// Convert a persisted entry, attributing it to `Me` when it was sent
    /// by `self_username`
    pub fn from_history(entry: HistoryEntry, self_username: &str) -> Self {
        if entry.from == self_username {
            Self::mine(entry.content)
        } else {
            Self::from_peer(entry.from, entry.content)
        }
    }

    /// `[YOU]: text` or `[name]: text`
    pub fn display(&self) -> String {
        match &self.sender {
            Sender::Me => format!("[YOU]: {}", self.text),
            Sender::Peer(name) => format!("[{}]: {}", name, self.text),
        }
    }
}

/// Whether the directory's history has been merged into the log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HistoryState {
    /// Never fetched
    NotLoaded,
    /// A fetch is in flight
    Loading,
    /// Fetched once; never fetched again this session
    Loaded,
}

/// Conversation with one friend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    /// Friend username
    pub friend: String,
    /// Lines in chronological order
    pub lines: Vec<ChatLine>,
    /// Hydration state of `lines`
    pub history: HistoryState,
    /// A line arrived while the chat was not open
    pub has_unread: bool,
    /// The user has this chat open in the foreground
    pub chat_active: bool,
    /// Fetched lines that are already in `lines` but have not arrived live yet
    #[serde(skip)]
    in_flight: VecDeque<ChatLine>,
}

impl Conversation {
    /// Empty, unfetched conversation
    pub fn new(friend: String) -> Self {
        Self {
            friend,
            lines: Vec::new(),
            history: HistoryState::NotLoaded,
            has_unread: false,
            chat_active: false,
            in_flight: VecDeque::new(),
        }
    }

    /// Append a line
    ///
    /// A line that the history fetch already returned is not added twice.
    pub fn append(&mut self, line: ChatLine) {
        if self.in_flight.front() == Some(&line) {
            self.in_flight.pop_front();
        } else {
            self.in_flight.clear();
            self.lines.push(line);
        }
    }

    /// Record a line from the friend, flagging it unread unless the chat is open
    pub fn receive(&mut self, line: ChatLine) {
        self.append(line);
        self.has_unread = !self.chat_active;
    }

    /// Claim the history fetch. Returns `true` only for the caller that
    /// moves the conversation out of `NotLoaded`.
    pub fn begin_load(&mut self) -> bool {
        if self.history == HistoryState::NotLoaded {
            self.history = HistoryState::Loading;
            true
        } else {
            false
        }
    }

    /// Install fetched history ahead of the lines recorded before it arrived
    ///
    /// Senders persist a line right after writing it, so the fetch may
    /// already contain lines that were recorded locally, or lines that are
    /// still on their way. Local lines that line up with the end of the
    /// fetch are kept once; fetched lines past them are remembered so their
    /// live copies are dropped on arrival.
    pub fn finish_load(&mut self, fetched: Vec<ChatLine>) {
        let local = std::mem::take(&mut self.lines);
        let mut lines = fetched;

        match overlap_start(&lines, &local) {
            Some(start) if lines.len() - start > local.len() => {
                self.in_flight = lines[start + local.len()..].iter().cloned().collect();
            }
            Some(start) => {
                let known = lines.len() - start;
                lines.extend(local.into_iter().skip(known));
            }
            None => lines.extend(local),
        }

        self.lines = lines;
        self.history = HistoryState::Loaded;
    }

    /// Give up on an in-flight fetch so a later call can retry
    pub fn abort_load(&mut self) {
        if self.history == HistoryState::Loading {
            self.history = HistoryState::NotLoaded;
        }
    }

    /// Bring the chat to the foreground and clear the unread flag
    pub fn open(&mut self) {
        self.chat_active = true;
        self.has_unread = false;
    }

    /// Move the chat to the background
    pub fn close(&mut self) {
        self.chat_active = false;
    }
}

/// Latest index of `fetched` from which it agrees line by line with `local`
fn overlap_start(fetched: &[ChatLine], local: &[ChatLine]) -> Option<usize> {
    if local.is_empty() {
        return None;
    }
    (0..fetched.len())
        .rev()
        .find(|&start| fetched[start..].iter().zip(local).all(|(a, b)| a == b))
}
