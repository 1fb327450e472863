// Shared fixtures: an in-process directory and helpers to build nodes

use crate::config::Settings;
use crate::node::Node;
use crate::protocol::{frame_reader, read_frame, read_identity};
use crate::rendezvous::{DirectoryStore, RendezvousServer};
use std::future::Future;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, Instant};

/// In-process directory on an ephemeral port
pub struct TestDirectory {
    pub server: RendezvousServer,
    pub url: String,
}

impl TestDirectory {
    pub async fn start() -> Self {
        let store = DirectoryStore::new_in_memory().expect("Failed to open in-memory store");
        let mut server = RendezvousServer::new(store);
        let addr = server.start("127.0.0.1:0").await.expect("Failed to start directory");
        Self {
            server,
            url: format!("http://{}", addr),
        }
    }

    /// Register a peer directly in the store
    pub async fn seed_peer(&self, username: &str, port: u16) {
        self.server
            .store()
            .lock()
            .await
            .upsert_peer(username, "127.0.0.1", port)
            .expect("Failed to seed peer");
    }

    pub async fn seed_friendship(&self, owner: &str, friend: &str) {
        self.server
            .store()
            .lock()
            .await
            .add_friendship(owner, friend)
            .expect("Failed to seed friendship");
    }

    pub async fn seed_message(&self, sender: &str, receiver: &str, content: &str) {
        self.server
            .store()
            .lock()
            .await
            .add_message(sender, receiver, content)
            .expect("Failed to seed message");
    }

    pub async fn request_count(&self, method: &str, path: &str) -> usize {
        self.server
            .store()
            .lock()
            .await
            .request_count(method, path)
            .expect("Failed to count requests")
    }

    pub fn settings(&self) -> Settings {
        test_settings(&self.url)
    }
}

/// Settings that keep everything on loopback
pub fn test_settings(directory_url: &str) -> Settings {
    Settings {
        directory_url: directory_url.to_string(),
        request_timeout_secs: 3,
        connect_timeout_secs: 1,
        listen_host: "127.0.0.1".to_string(),
        advertise_ip: Some("127.0.0.1".to_string()),
        max_frame_bytes: 1024,
        exclusive_active_chat: true,
    }
}

/// A port that was free a moment ago
pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("Failed to bind probe socket");
    listener.local_addr().expect("Failed to read probe address").port()
}

/// Register `username` on a free port and log it in
pub async fn logged_in_node(directory: &TestDirectory, username: &str) -> (Node, u16) {
    let node = Node::new(directory.settings()).expect("Failed to create node");
    let port = free_port();
    node.register(username, "127.0.0.1", port).await.expect("Failed to register");
    node.login(username).await.expect("Failed to log in");
    (node, port)
}

/// Poll `check` until it returns true or two seconds pass
pub async fn wait_until<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if check().await {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    check().await
}

/// A bare peer that reports the identity and every line it receives
pub async fn recording_peer() -> (u16, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let port = listener.local_addr().expect("addr").port();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut reader = frame_reader(stream, 1024);
        if let Ok(Some(identity)) = read_identity(&mut reader).await {
            let _ = tx.send(identity);
        }
        while let Ok(Some(line)) = read_frame(&mut reader).await {
            let _ = tx.send(line);
        }
    });

    (port, rx)
}

