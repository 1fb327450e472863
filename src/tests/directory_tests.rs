// Directory client tests against the in-process rendezvous server

use super::support::{free_port, TestDirectory};
use crate::directory::{DirectoryClient, RegisterOutcome};
use crate::Error;
use std::time::Duration;

async fn client(directory: &TestDirectory) -> DirectoryClient {
    DirectoryClient::new(&directory.settings()).expect("Failed to build client")
}

#[tokio::test]
async fn test_register_created_then_updated() {
    let directory = TestDirectory::start().await;
    let client = client(&directory).await;

    let first = client.register("alice", "127.0.0.1", 9001).await.expect("register");
    assert_eq!(first, RegisterOutcome::Created);

    let second = client.register("alice", "127.0.0.2", 9002).await.expect("register");
    assert_eq!(second, RegisterOutcome::Updated);

    let peer = client.lookup_peer("alice").await.expect("lookup").expect("alice missing");
    assert_eq!(peer.ip, "127.0.0.2");
    assert_eq!(peer.port, 9002);
}

#[tokio::test]
async fn test_lookup_unknown_peer_is_none() {
    let directory = TestDirectory::start().await;
    let client = client(&directory).await;

    assert!(client.lookup_peer("ghost").await.expect("lookup").is_none());
}

#[tokio::test]
async fn test_list_peers() {
    let directory = TestDirectory::start().await;
    let client = client(&directory).await;

    assert!(client.list_peers().await.expect("peers").is_empty());
    client.register("bob", "127.0.0.1", 9002).await.expect("register");
    client.register("alice", "127.0.0.1", 9001).await.expect("register");

    assert_eq!(client.list_peers().await.expect("peers"), vec!["alice", "bob"]);
}

#[tokio::test]
async fn test_friendships_are_per_owner() {
    let directory = TestDirectory::start().await;
    let client = client(&directory).await;
    client.register("alice", "127.0.0.1", 9001).await.expect("register");
    client.register("bob", "127.0.0.1", 9002).await.expect("register");

    client.add_friendship("alice", "bob").await.expect("friendship");
    client.add_friendship("alice", "bob").await.expect("repeat friendship");

    assert_eq!(client.list_friends("alice").await.expect("friends"), vec!["bob"]);
    assert!(client.list_friends("bob").await.expect("friends").is_empty());
}

#[tokio::test]
async fn test_friendship_with_unknown_peer_rejected() {
    let directory = TestDirectory::start().await;
    let client = client(&directory).await;
    client.register("alice", "127.0.0.1", 9001).await.expect("register");

    let result = client.add_friendship("alice", "ghost").await;
    assert!(matches!(result, Err(Error::DirectoryRejected { status: 404, .. })));
}

#[tokio::test]
async fn test_persist_and_fetch_history() {
    let directory = TestDirectory::start().await;
    let client = client(&directory).await;
    client.register("alice", "127.0.0.1", 9001).await.expect("register");
    client.register("bob", "127.0.0.1", 9002).await.expect("register");

    client.persist_message("alice", "bob", "hi bob").await.expect("persist");
    client.persist_message("bob", "alice", "hi alice").await.expect("persist");

    let history = client.fetch_history("bob", "alice").await.expect("history");
    let lines: Vec<_> = history.iter().map(|m| (m.from.as_str(), m.content.as_str())).collect();
    assert_eq!(lines, vec![("alice", "hi bob"), ("bob", "hi alice")]);
}

#[tokio::test]
async fn test_unreachable_directory_is_unavailable() {
    let url = format!("http://127.0.0.1:{}", free_port());
    let client = DirectoryClient::with_timeout(&url, Duration::from_secs(1)).expect("Failed to build client");

    assert!(matches!(client.list_peers().await, Err(Error::DirectoryUnavailable(_))));
    assert!(matches!(client.lookup_peer("bob").await, Err(Error::DirectoryUnavailable(_))));
    assert!(matches!(
        client.register("bob", "127.0.0.1", 9002).await,
        Err(Error::DirectoryUnavailable(_))
    ));
}

#[tokio::test]
async fn test_malformed_response_is_unavailable() {
    // A plain TCP server that answers every request with non-JSON
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        while let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            let _ = stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 5\r\nconnection: close\r\n\r\nhello")
                .await;
        }
    });

    let client = DirectoryClient::with_timeout(&format!("http://{}", addr), Duration::from_secs(1))
        .expect("Failed to build client");
    assert!(matches!(client.list_peers().await, Err(Error::DirectoryUnavailable(_))));
}
