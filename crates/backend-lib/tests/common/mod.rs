// ============================
// crates/backend-lib/tests/common/mod.rs
// ============================
//! Shared helpers for the integration tests: a real server on an ephemeral
//! port and thin WebSocket client wrappers.
#![allow(dead_code)]

use backend_lib::{
    auth::JwtAuth,
    clock::ManualClock,
    config::Settings,
    ids::UserIdentity,
    lease_store::InMemoryLeaseStore,
    ws_router::create_router,
    AppState,
};
use chapterlock_common::{ChapterLockState, ClientToServer, ServerToClient};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{tungstenite::Message, MaybeTlsStream, WebSocketStream};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
    pub clock: Arc<ManualClock>,
    auth: JwtAuth,
}

impl TestServer {
    /// Start a server whose leases follow a manual clock.
    pub async fn start() -> Self {
        Self::start_with(Settings::default()).await
    }

    pub async fn start_with(settings: Settings) -> Self {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(InMemoryLeaseStore::new(clock.clone()));
        let auth = JwtAuth::new(&settings.auth.jwt_secret);
        let verifier = Arc::new(JwtAuth::new(&settings.auth.jwt_secret));
        let state = Arc::new(AppState::with_components(settings, store, verifier));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind test listener");
        let addr = listener.local_addr().unwrap();
        let app = create_router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            addr,
            state,
            clock,
            auth,
        }
    }

    pub fn token(&self, user_id: &str, name: &str) -> String {
        self.auth
            .issue(&UserIdentity::new(user_id, name), TOKEN_LIFETIME)
            .unwrap()
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    /// Open an authenticated socket for `user_id`.
    pub async fn connect(&self, user_id: &str, name: &str) -> WsClient {
        let url = format!("ws://{}/ws?token={}", self.addr, self.token(user_id, name));
        let (ws, _) = tokio_tungstenite::connect_async(url)
            .await
            .expect("Failed to connect");
        ws
    }

    /// Connect and join `story_id`, returning the client and the room's locks.
    pub async fn join(&self, user_id: &str, name: &str, story_id: &str) -> (WsClient, Vec<ChapterLockState>) {
        let mut ws = self.connect(user_id, name).await;
        send(
            &mut ws,
            &ClientToServer::JoinStory {
                story_id: story_id.to_string(),
            },
        )
        .await;
        match recv(&mut ws).await {
            ServerToClient::StoryJoined { locks, .. } => (ws, locks),
            other => panic!("expected StoryJoined, got {other:?}"),
        }
    }
}

pub async fn send(ws: &mut WsClient, msg: &ClientToServer) {
    ws.send(Message::Text(serde_json::to_string(msg).unwrap().into()))
        .await
        .unwrap();
}

/// Next protocol message, skipping control frames.
pub async fn recv(ws: &mut WsClient) -> ServerToClient {
    loop {
        let frame = match tokio::time::timeout(RECV_TIMEOUT, ws.next()).await {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => panic!("socket error: {e:?}"),
            Ok(None) => panic!("socket closed"),
            Err(_) => panic!("timed out after {RECV_TIMEOUT:?} waiting for a message"),
        };
        if let Message::Text(text) = frame {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Assert nothing arrives within `wait`.
pub async fn expect_silence(ws: &mut WsClient, wait: Duration) {
    if let Ok(Some(Ok(Message::Text(text)))) = tokio::time::timeout(wait, ws.next()).await {
        panic!("unexpected message: {text}");
    }
}

pub fn acquire(story_id: &str, chapter_id: &str) -> ClientToServer {
    ClientToServer::AcquireLock {
        story_id: story_id.to_string(),
        chapter_id: chapter_id.to_string(),
    }
}

pub fn heartbeat(story_id: &str, chapter_id: &str) -> ClientToServer {
    ClientToServer::Heartbeat {
        story_id: story_id.to_string(),
        chapter_id: chapter_id.to_string(),
    }
}

pub fn release(story_id: &str, chapter_id: &str) -> ClientToServer {
    ClientToServer::ReleaseLock {
        story_id: story_id.to_string(),
        chapter_id: chapter_id.to_string(),
    }
}

pub fn query(story_id: &str, chapter_id: &str) -> ClientToServer {
    ClientToServer::QueryLock {
        story_id: story_id.to_string(),
        chapter_id: chapter_id.to_string(),
    }
}
