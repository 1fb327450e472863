// Rendezvous server tests - raw HTTP status codes and the request log

use super::support::TestDirectory;
use reqwest::StatusCode;
use serde_json::{json, Value};

#[tokio::test]
async fn test_register_status_codes() {
    let directory = TestDirectory::start().await;
    let http = reqwest::Client::new();
    let url = format!("{}/register", directory.url);

    let body = json!({"username": "alice", "ip": "127.0.0.1", "port": 9001});
    let created = http.post(&url).json(&body).send().await.expect("request");
    assert_eq!(created.status(), StatusCode::CREATED);

    let updated = http.post(&url).json(&body).send().await.expect("request");
    assert_eq!(updated.status(), StatusCode::OK);

    let missing = http
        .post(&url)
        .json(&json!({"username": "bob"}))
        .send()
        .await
        .expect("request");
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let garbage = http.post(&url).body("{oops").send().await.expect("request");
    assert_eq!(garbage.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_peerinfo_status_codes() {
    let directory = TestDirectory::start().await;
    directory.seed_peer("alice", 9001).await;

    let found = reqwest::get(format!("{}/peerinfo?username=alice", directory.url))
        .await
        .expect("request");
    assert_eq!(found.status(), StatusCode::OK);
    let body: Value = found.json().await.expect("json");
    assert_eq!(body, json!({"username": "alice", "ip": "127.0.0.1", "port": 9001}));

    let unknown = reqwest::get(format!("{}/peerinfo?username=ghost", directory.url))
        .await
        .expect("request");
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let missing = reqwest::get(format!("{}/peerinfo", directory.url)).await.expect("request");
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_peers_body_shape() {
    let directory = TestDirectory::start().await;
    directory.seed_peer("bob", 9002).await;

    let body: Value = reqwest::get(format!("{}/peers", directory.url))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(body, json!({"peers": [{"username": "bob"}]}));
}

#[tokio::test]
async fn test_message_create_status_codes() {
    let directory = TestDirectory::start().await;
    directory.seed_peer("alice", 9001).await;
    directory.seed_peer("bob", 9002).await;
    let http = reqwest::Client::new();
    let url = format!("{}/message/create/", directory.url);

    let created = http
        .post(&url)
        .json(&json!({"sender": "alice", "receiver": "bob", "content": "hi"}))
        .send()
        .await
        .expect("request");
    assert_eq!(created.status(), StatusCode::CREATED);

    let unknown = http
        .post(&url)
        .json(&json!({"sender": "alice", "receiver": "ghost", "content": "hi"}))
        .send()
        .await
        .expect("request");
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let missing = http
        .post(&url)
        .json(&json!({"sender": "alice"}))
        .send()
        .await
        .expect("request");
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

    let empty = http
        .post(&url)
        .json(&json!({"sender": "alice", "receiver": "bob", "content": ""}))
        .send()
        .await
        .expect("request");
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let stored = directory
        .server
        .store()
        .lock()
        .await
        .messages_between("alice", "bob")
        .expect("history");
    assert_eq!(stored.len(), 1);
}

#[tokio::test]
async fn test_message_get_body_shape() {
    let directory = TestDirectory::start().await;
    directory.seed_message("alice", "bob", "one").await;
    directory.seed_message("bob", "alice", "two").await;

    let body: Value = reqwest::get(format!("{}/message/get/?peer1=alice&peer2=bob", directory.url))
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(
        body,
        json!({"messages": [
            {"message": "one", "from": "alice"},
            {"message": "two", "from": "bob"},
        ]})
    );

    let missing = reqwest::get(format!("{}/message/get/?peer1=alice", directory.url))
        .await
        .expect("request");
    assert_eq!(missing.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_route_and_wrong_method() {
    let directory = TestDirectory::start().await;

    let unknown = reqwest::get(format!("{}/nowhere", directory.url)).await.expect("request");
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let wrong_method = reqwest::get(format!("{}/register", directory.url)).await.expect("request");
    assert_eq!(wrong_method.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_every_request_is_logged() {
    let directory = TestDirectory::start().await;

    reqwest::get(format!("{}/peers", directory.url)).await.expect("request");
    reqwest::get(format!("{}/peers", directory.url)).await.expect("request");
    reqwest::get(format!("{}/nowhere", directory.url)).await.expect("request");

    assert_eq!(directory.request_count("GET", "/peers").await, 2);
    let logs = directory
        .server
        .store()
        .lock()
        .await
        .request_logs(1)
        .expect("logs");
    assert_eq!(logs[0].path, "/nowhere");
    assert_eq!(logs[0].status, 404);
}

#[tokio::test]
async fn test_stop_releases_port() {
    let mut directory = TestDirectory::start().await;
    let addr = directory.server.local_addr().expect("running");

    directory.server.stop().await;
    assert!(directory.server.local_addr().is_none());

    let rebound = tokio::net::TcpListener::bind(addr).await;
    assert!(rebound.is_ok(), "port should be free after stop");
}
