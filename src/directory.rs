//! Rendezvous directory client
//!
//! Typed wrapper around the directory's HTTP+JSON API. Every call carries the
//! configured timeout. Transport failures, timeouts and undecodable bodies all
//! surface as [`Error::DirectoryUnavailable`]; callers are expected to carry
//! on with local state when they see it.
//!
//! The request/response bodies defined here are shared with the in-process
//! directory server in [`crate::rendezvous`].

use crate::{config::Settings, Error, Result};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// Body of `POST /register`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    /// Username to register
    pub username: String,
    /// Address other peers should dial
    pub ip: String,
    /// Port the peer listens on
    pub port: u16,
}

/// Registration record of a peer, as returned by `GET /peerinfo`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    /// Peer username
    pub username: String,
    /// Advertised IP address
    pub ip: String,
    /// Advertised listening port
    pub port: u16,
}

impl PeerAddress {
    /// `ip:port` form suitable for dialing
    pub fn socket_addr(&self) -> String {
        if self.ip.contains(':') {
            format!("[{}]:{}", self.ip, self.port)
        } else {
            format!("{}:{}", self.ip, self.port)
        }
    }
}

/// One element of the `peers` or `friends` arrays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsernameEntry {
    /// Username
    pub username: String,
}

/// Body of `GET /peers`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeersResponse {
    /// Every registered peer
    pub peers: Vec<UsernameEntry>,
}

/// Body of `GET /friend/get/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendsResponse {
    /// Friends recorded for the requested owner
    pub friends: Vec<UsernameEntry>,
}

/// Body of `POST /friend/start/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FriendshipRequest {
    /// Owner of the friendship record
    pub user1: String,
    /// Friend being added
    pub user2: String,
}

/// Body of `POST /message/create/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateMessageRequest {
    /// Sending username
    pub sender: String,
    /// Receiving username
    pub receiver: String,
    /// Chat text
    pub content: String,
}

/// A persisted chat line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Chat text
    #[serde(rename = "message")]
    pub content: String,
    /// Username of the sender
    pub from: String,
}

/// Body of `GET /message/get/`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Messages between the two peers, oldest first
    pub messages: Vec<HistoryEntry>,
}

/// Result of a successful registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// A new registration was created
    Created,
    /// An existing registration was updated
    Updated,
}

/// HTTP client for the rendezvous directory
#[derive(Debug, Clone)]
pub struct DirectoryClient {
    client: reqwest::Client,
    base_url: String,
}

impl DirectoryClient {
    /// Create a client from peer settings
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_timeout(&settings.directory_url, settings.request_timeout())
    }

    /// Create a client for `base_url` with an explicit request timeout
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Base URL requests are sent to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Register or update `username` at `ip:port`
    pub async fn register(&self, username: &str, ip: &str, port: u16) -> Result<RegisterOutcome> {
        let body = RegisterRequest {
            username: username.to_string(),
            ip: ip.to_string(),
            port,
        };

        let response = self
            .client
            .post(self.url("/register"))
            .json(&body)
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::CREATED => Ok(RegisterOutcome::Created),
            StatusCode::OK => Ok(RegisterOutcome::Updated),
            status => Err(rejected(status, response).await),
        }
    }

    /// Look up a peer's advertised address; `None` when the directory does
    /// not know the username
    pub async fn lookup_peer(&self, username: &str) -> Result<Option<PeerAddress>> {
        let response = self
            .client
            .get(self.url("/peerinfo"))
            .query(&[("username", username)])
            .send()
            .await
            .map_err(unavailable)?;

        match response.status() {
            StatusCode::OK => Ok(Some(decode(response).await?)),
            StatusCode::NOT_FOUND => {
                debug!("Peer {} not found in directory", username);
                Ok(None)
            }
            status => Err(rejected(status, response).await),
        }
    }

    /// Usernames of every registered peer
    pub async fn list_peers(&self) -> Result<Vec<String>> {
        let peers: PeersResponse = self.get_json("/peers", &[]).await?;
        Ok(peers.peers.into_iter().map(|p| p.username).collect())
    }

    /// Friends recorded for `username`
    pub async fn list_friends(&self, username: &str) -> Result<Vec<String>> {
        let friends: FriendsResponse = self.get_json("/friend/get/", &[("username", username)]).await?;
        Ok(friends.friends.into_iter().map(|f| f.username).collect())
    }

    /// Record that `owner` is friends with `friend`
    pub async fn add_friendship(&self, owner: &str, friend: &str) -> Result<()> {
        let body = FriendshipRequest {
            user1: owner.to_string(),
            user2: friend.to_string(),
        };
        self.post_ok("/friend/start/", &body).await
    }

    /// Persist one chat line
    pub async fn persist_message(&self, sender: &str, receiver: &str, content: &str) -> Result<()> {
        let body = CreateMessageRequest {
            sender: sender.to_string(),
            receiver: receiver.to_string(),
            content: content.to_string(),
        };
        self.post_ok("/message/create/", &body).await
    }

    /// Persisted conversation between two peers, oldest first
    pub async fn fetch_history(&self, peer1: &str, peer2: &str) -> Result<Vec<HistoryEntry>> {
        let history: HistoryResponse = self
            .get_json("/message/get/", &[("peer1", peer1), ("peer2", peer2)])
            .await?;
        Ok(history.messages)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T> {
        let response = self
            .client
            .get(self.url(path))
            .query(query)
            .send()
            .await
            .map_err(unavailable)?;

        if response.status() != StatusCode::OK {
            return Err(rejected(response.status(), response).await);
        }
        decode(response).await
    }

    async fn post_ok<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let response = self
            .client
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(unavailable)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(rejected(response.status(), response).await)
        }
    }
}

fn unavailable(e: reqwest::Error) -> Error {
    warn!("Cannot reach directory: {}", e);
    Error::DirectoryUnavailable(e.to_string())
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    response.json::<T>().await.map_err(|e| {
        warn!("Malformed directory response: {}", e);
        Error::DirectoryUnavailable(format!("malformed response: {}", e))
    })
}

async fn rejected(status: StatusCode, response: reqwest::Response) -> Error {
    let body = response.text().await.unwrap_or_default();
    warn!("Directory answered {}: {}", status, body);
    Error::DirectoryRejected {
        status: status.as_u16(),
        body,
    }
}
