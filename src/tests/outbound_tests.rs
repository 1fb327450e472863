// Outbound session tests - relay ordering, delivery status and the chat loop

use super::support::{free_port, logged_in_node, recording_peer, wait_until, TestDirectory};
use crate::node::Node;
use crate::outbound::{is_exit_command, ChatEnd, DeliveryStatus};
use crate::protocol::{frame_reader, read_identity};
use crate::session::ChatLine;
use crate::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::time::{sleep, Duration};

/// A bare peer that hangs up right after reading the identity
async fn hang_up_peer() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("Failed to bind");
    let port = listener.local_addr().expect("addr").port();

    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            let mut reader = frame_reader(stream, 1024);
            let _ = read_identity(&mut reader).await;
        }
    });

    port
}

async fn lines_with(node: &Node, friend: &str) -> Vec<ChatLine> {
    let epoch = node.session().current_epoch().await.expect("not logged in");
    node.session()
        .conversation(epoch, friend)
        .await
        .expect("session closed")
        .map(|c| c.lines)
        .unwrap_or_default()
}

#[test]
fn test_exit_command_any_case() {
    assert!(is_exit_command("exit"));
    assert!(is_exit_command("  EXIT "));
    assert!(is_exit_command("Exit"));
    assert!(!is_exit_command("exit now"));
    assert!(!is_exit_command(""));
}

#[tokio::test]
async fn test_dial_sends_identity_then_lines() {
    let directory = TestDirectory::start().await;
    let (node, _) = logged_in_node(&directory, "alice").await;
    let (port, mut received) = recording_peer().await;
    directory.seed_peer("bob", port).await;

    let mut session = node.connect("bob").await.expect("Failed to connect");
    assert_eq!(session.peer().username, "bob");
    session.relay("hi").await.expect("relay");
    session.relay("there").await.expect("relay");
    session.close().await;

    assert_eq!(received.recv().await.as_deref(), Some("alice"));
    assert_eq!(received.recv().await.as_deref(), Some("hi"));
    assert_eq!(received.recv().await.as_deref(), Some("there"));
    node.logout().await;
}

#[tokio::test]
async fn test_relay_rejects_multiline_text() {
    let directory = TestDirectory::start().await;
    let (node, _) = logged_in_node(&directory, "alice").await;
    let (port, _received) = recording_peer().await;
    directory.seed_peer("bob", port).await;

    let mut session = node.connect("bob").await.expect("Failed to connect");
    assert!(matches!(session.relay("two\nlines").await, Err(Error::Protocol(_))));
    assert!(lines_with(&node, "bob").await.is_empty());

    let too_long = "x".repeat(2048);
    assert!(matches!(session.relay(&too_long).await, Err(Error::Protocol(_))));
    session.close().await;
    node.logout().await;
}

#[tokio::test]
async fn test_failed_send_is_unconfirmed_but_kept() {
    let directory = TestDirectory::start().await;
    let (node, _) = logged_in_node(&directory, "alice").await;
    let port = hang_up_peer().await;
    directory.seed_peer("bob", port).await;

    let mut session = node.connect("bob").await.expect("Failed to connect");
    sleep(Duration::from_millis(100)).await;

    // The first writes may still land in the kernel buffer; keep going
    // until the broken socket is noticed
    let mut sent = 0;
    let mut status = DeliveryStatus::Delivered;
    while status == DeliveryStatus::Delivered && sent < 50 {
        status = session.relay(&format!("line {}", sent)).await.expect("relay");
        sent += 1;
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, DeliveryStatus::Unconfirmed);

    // Every line, including the unconfirmed one, is recorded and persisted
    let lines = lines_with(&node, "bob").await;
    assert_eq!(lines.len(), sent);
    assert_eq!(lines.last(), Some(&ChatLine::mine(format!("line {}", sent - 1))));

    let persisted = node.directory().fetch_history("alice", "bob").await.expect("history");
    assert_eq!(persisted.len(), sent);
    session.close().await;
    node.logout().await;
}

#[tokio::test]
async fn test_chat_loop_until_exit() {
    let directory = TestDirectory::start().await;
    let (node, _) = logged_in_node(&directory, "alice").await;
    let (port, mut received) = recording_peer().await;
    directory.seed_peer("bob", port).await;

    let session = node.connect("bob").await.expect("Failed to connect");
    let input: &[u8] = b"hello\n\n  \nExit\nnot sent\n";
    let mut input = BufReader::new(input).lines();
    let mut out = Vec::new();

    let end = session.run(&mut input, &mut out, None).await.expect("chat loop");
    assert_eq!(end, ChatEnd::UserExit);

    let transcript = String::from_utf8(out).expect("utf8");
    assert!(transcript.contains("message (type 'exit' to end)> "));
    assert!(transcript.contains("Chat ended"));

    assert_eq!(received.recv().await.as_deref(), Some("alice"));
    assert_eq!(received.recv().await.as_deref(), Some("hello"));
    // The socket is closed after exit, so the channel drains
    assert_eq!(received.recv().await, None);

    assert_eq!(lines_with(&node, "bob").await, vec![ChatLine::mine("hello")]);
    assert_eq!(
        input.next_line().await.expect("read").as_deref(),
        Some("not sent")
    );
    node.logout().await;
}

#[tokio::test]
async fn test_chat_loop_ends_when_input_closes() {
    let directory = TestDirectory::start().await;
    let (node, _) = logged_in_node(&directory, "alice").await;
    let (port, _received) = recording_peer().await;
    directory.seed_peer("bob", port).await;

    let session = node.connect("bob").await.expect("Failed to connect");
    let input: &[u8] = b"only line\n";
    let mut input = BufReader::new(input).lines();
    let mut out = Vec::new();

    let end = session.run(&mut input, &mut out, None).await.expect("chat loop");
    assert_eq!(end, ChatEnd::InputClosed);
    assert!(
        wait_until(|| {
            let node = node.clone();
            async move { lines_with(&node, "bob").await.len() == 1 }
        })
        .await
    );
    node.logout().await;
}

#[tokio::test]
async fn test_relay_after_logout_fails_with_session_closed() {
    let directory = TestDirectory::start().await;
    let (node, _) = logged_in_node(&directory, "alice").await;
    let (port, _received) = recording_peer().await;
    directory.seed_peer("bob", port).await;

    let mut session = node.connect("bob").await.expect("Failed to connect");
    node.logout().await;

    assert!(matches!(session.relay("late").await, Err(Error::SessionClosed)));
    session.close().await;
}

#[tokio::test]
async fn test_dial_timeout_to_offline_port() {
    let directory = TestDirectory::start().await;
    let (node, _) = logged_in_node(&directory, "alice").await;
    directory.seed_peer("bob", free_port()).await;

    assert!(matches!(node.connect("bob").await, Err(Error::PeerOffline(name)) if name == "bob"));
    node.logout().await;
}
