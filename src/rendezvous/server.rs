//! HTTP+JSON front end of the rendezvous directory

use crate::directory::{
    CreateMessageRequest, FriendsResponse, FriendshipRequest, HistoryResponse, PeersResponse, RegisterRequest,
    UsernameEntry,
};
use crate::rendezvous::store::DirectoryStore;
use crate::{Error, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const ROUTES: &[&str] = &[
    "/register",
    "/peers",
    "/peerinfo",
    "/friend/start",
    "/friend/get",
    "/message/create",
    "/message/get",
];

/// Rendezvous directory server
pub struct RendezvousServer {
    store: Arc<Mutex<DirectoryStore>>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

impl RendezvousServer {
    /// Create a stopped server over `store`
    pub fn new(store: DirectoryStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            local_addr: None,
            shutdown: None,
            accept_task: None,
        }
    }

    /// Shared handle to the backing store
    pub fn store(&self) -> Arc<Mutex<DirectoryStore>> {
        self.store.clone()
    }

    /// Address the server is bound to while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Base URL clients should use, once started
    pub fn base_url(&self) -> Option<String> {
        self.local_addr.map(|addr| format!("http://{}", addr))
    }

    /// Bind `addr` and start serving
    ///
    /// Returns the bound address, which matters when `addr` asks for port 0.
    pub async fn start(&mut self, addr: &str) -> Result<SocketAddr> {
        self.stop().await;

        let listener = TcpListener::bind(addr).await.map_err(|source| {
            error!("Failed to bind directory on {}: {}", addr, source);
            Error::Bind {
                port: addr.rsplit(':').next().and_then(|p| p.parse().ok()).unwrap_or(0),
                source,
            }
        })?;
        let actual_addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.accept_task = Some(tokio::spawn(serve(listener, shutdown_rx, self.store.clone())));
        self.shutdown = Some(shutdown_tx);
        self.local_addr = Some(actual_addr);

        info!("Directory listening on {}", actual_addr);
        Ok(actual_addr)
    }

    /// Stop accepting connections; does nothing when not running
    pub async fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = self.accept_task.take() {
            if let Err(e) = task.await {
                warn!("Directory accept loop ended abnormally: {}", e);
            }
        }
        if let Some(addr) = self.local_addr.take() {
            info!("Directory on {} stopped", addr);
        }
    }
}

impl Drop for RendezvousServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}

async fn serve(listener: TcpListener, mut shutdown: watch::Receiver<bool>, store: Arc<Mutex<DirectoryStore>>) {
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, remote_addr)) => {
                        debug!("Accepted directory connection from {}", remote_addr);

                        let io = TokioIo::new(stream);
                        let store = store.clone();
                        let mut shutdown = shutdown.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, store.clone()));
                            let conn = http1::Builder::new().serve_connection(io, service);
                            tokio::pin!(conn);

                            // Keep-alive connections must not outlive the server
                            let result = tokio::select! {
                                result = conn.as_mut() => result,
                                _ = shutdown.changed() => {
                                    conn.as_mut().graceful_shutdown();
                                    conn.await
                                }
                            };
                            if let Err(e) = result {
                                debug!("Error serving directory connection: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                    }
                }
            }
        }
    }
}

/// Answer one request and record it in the request log
async fn handle_request(
    req: Request<Incoming>,
    store: Arc<Mutex<DirectoryStore>>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = match route(req, &store).await {
        Ok(response) => response,
        Err(e) => {
            error!("{} {} failed: {}", method, path, e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    };

    debug!("{} {} -> {}", method, path, response.status());
    if let Err(e) = store
        .lock()
        .await
        .log_request(method.as_str(), &path, response.status().as_u16())
    {
        warn!("Failed to record request {} {}: {}", method, path, e);
    }

    Ok(response)
}

async fn route(req: Request<Incoming>, store: &Mutex<DirectoryStore>) -> Result<Response<Full<Bytes>>> {
    let method = req.method().clone();
    let path = normalize(req.uri().path()).to_string();

    match (&method, path.as_str()) {
        (&Method::POST, "/register") => {
            let body: RegisterRequest = match read_json(req).await? {
                Ok(body) => body,
                Err(response) => return Ok(response),
            };
            if body.username.trim().is_empty() || body.username.contains(char::is_whitespace) {
                return Ok(error_response(StatusCode::BAD_REQUEST, "invalid username"));
            }
            if body.ip.trim().is_empty() || body.port == 0 {
                return Ok(error_response(StatusCode::BAD_REQUEST, "ip and port are required"));
            }

            let created = store.lock().await.upsert_peer(&body.username, &body.ip, body.port)?;
            let status = if created { StatusCode::CREATED } else { StatusCode::OK };
            info!("Registered {} at {}:{} ({})", body.username, body.ip, body.port, status);
            json_response(status, &body)
        }

        (&Method::GET, "/peers") => {
            let peers = store.lock().await.peers()?;
            json_response(
                StatusCode::OK,
                &PeersResponse {
                    peers: peers.into_iter().map(|username| UsernameEntry { username }).collect(),
                },
            )
        }

        (&Method::GET, "/peerinfo") => {
            let Some(username) = query_param(req.uri(), "username") else {
                return Ok(error_response(StatusCode::BAD_REQUEST, "username is required"));
            };
            match store.lock().await.peer(&username)? {
                Some(peer) => json_response(StatusCode::OK, &peer),
                None => Ok(error_response(StatusCode::NOT_FOUND, "peer not found")),
            }
        }

        (&Method::POST, "/friend/start") => {
            let body: FriendshipRequest = match read_json(req).await? {
                Ok(body) => body,
                Err(response) => return Ok(response),
            };

            let store = store.lock().await;
            if store.peer(&body.user1)?.is_none() || store.peer(&body.user2)?.is_none() {
                return Ok(error_response(StatusCode::NOT_FOUND, "peer not found"));
            }
            store.add_friendship(&body.user1, &body.user2)?;
            debug!("Friendship {} -> {}", body.user1, body.user2);
            json_response(StatusCode::OK, &body)
        }

        (&Method::GET, "/friend/get") => {
            let Some(username) = query_param(req.uri(), "username") else {
                return Ok(error_response(StatusCode::BAD_REQUEST, "username is required"));
            };
            let friends = store.lock().await.friends(&username)?;
            json_response(
                StatusCode::OK,
                &FriendsResponse {
                    friends: friends.into_iter().map(|username| UsernameEntry { username }).collect(),
                },
            )
        }

        (&Method::POST, "/message/create") => {
            let body: CreateMessageRequest = match read_json(req).await? {
                Ok(body) => body,
                Err(response) => return Ok(response),
            };
            if body.sender.is_empty() || body.receiver.is_empty() || body.content.is_empty() {
                return Ok(error_response(StatusCode::BAD_REQUEST, "sender, receiver and content are required"));
            }

            let store = store.lock().await;
            if store.peer(&body.sender)?.is_none() || store.peer(&body.receiver)?.is_none() {
                return Ok(error_response(StatusCode::NOT_FOUND, "peer not found"));
            }
            let id = store.add_message(&body.sender, &body.receiver, &body.content)?;
            debug!("Stored message {} from {} to {}", id, body.sender, body.receiver);
            json_response(StatusCode::CREATED, &serde_json::json!({ "id": id }))
        }

        (&Method::GET, "/message/get") => {
            let (Some(peer1), Some(peer2)) = (query_param(req.uri(), "peer1"), query_param(req.uri(), "peer2")) else {
                return Ok(error_response(StatusCode::BAD_REQUEST, "peer1 and peer2 are required"));
            };
            let messages = store.lock().await.messages_between(&peer1, &peer2)?;
            json_response(StatusCode::OK, &HistoryResponse { messages })
        }

        (_, known) if ROUTES.contains(&known) => {
            Ok(error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"))
        }

        _ => Ok(error_response(StatusCode::NOT_FOUND, "not found")),
    }
}

/// `/friend/start/` and `/friend/start` are the same route
fn normalize(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" => "/",
        trimmed => trimmed,
    }
}

fn query_param(uri: &Uri, name: &str) -> Option<String> {
    let query = uri.query()?;
    let url = reqwest::Url::parse(&format!("http://directory/?{}", query)).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == name)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// Decode a JSON body; malformed input becomes a ready 400 response
async fn read_json<T: DeserializeOwned>(
    req: Request<Incoming>,
) -> Result<std::result::Result<T, Response<Full<Bytes>>>> {
    let body = req.collect().await?.to_bytes();
    match serde_json::from_slice(&body) {
        Ok(value) => Ok(Ok(value)),
        Err(e) => {
            debug!("Rejected request body: {}", e);
            Ok(Err(error_response(StatusCode::BAD_REQUEST, &format!("invalid body: {}", e))))
        }
    }
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Result<Response<Full<Bytes>>> {
    let body = serde_json::to_vec(value)?;
    Ok(with_status(status, body))
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "error": message }).to_string();
    with_status(status, body.into_bytes())
}

fn with_status(status: StatusCode, body: Vec<u8>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
