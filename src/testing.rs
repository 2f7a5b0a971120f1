//! In-process fake Appium server for tests

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;

#[derive(Default)]
pub(crate) struct FakeState {
    pub version: String,
    pub status_calls: AtomicUsize,
    pub created: AtomicUsize,
    pub deleted: AtomicUsize,
    pub refuse_sessions: AtomicBool,
    capabilities: Mutex<Option<Value>>,
}

impl FakeState {
    /// `capabilities` object of the most recent new-session request
    pub(crate) fn last_capabilities(&self) -> Option<Value> {
        self.capabilities.lock().unwrap().clone()
    }
}

/// Answers `/status`, `POST /session` and `DELETE /session/:id` on a random
/// loopback port. Stops when dropped.
pub(crate) struct FakeAppium {
    pub url: String,
    pub port: u16,
    pub state: Arc<FakeState>,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl FakeAppium {
    pub(crate) fn start(version: &str) -> Self {
        let state = Arc::new(FakeState {
            version: version.to_string(),
            ..Default::default()
        });

        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        std_listener.set_nonblocking(true).unwrap();
        let port = std_listener.local_addr().unwrap().port();

        let app = Router::new()
            .route("/status", get(status))
            .route("/session", post(create_session))
            .route("/session/:id", delete(delete_session))
            .with_state(state.clone());

        let (tx, rx) = oneshot::channel::<()>();
        let thread = std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
                axum::serve(listener, app)
                    .with_graceful_shutdown(async {
                        let _ = rx.await;
                    })
                    .await
                    .unwrap();
            });
        });

        Self {
            url: format!("http://127.0.0.1:{}", port),
            port,
            state,
            shutdown: Some(tx),
            thread: Some(thread),
        }
    }
}

impl Drop for FakeAppium {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn status(State(state): State<Arc<FakeState>>) -> Json<Value> {
    state.status_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "value": {
            "ready": true,
            "message": "The server is ready to accept new connections",
            "build": { "version": state.version }
        }
    }))
}

async fn create_session(
    State(state): State<Arc<FakeState>>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    *state.capabilities.lock().unwrap() = body.get("capabilities").cloned();

    if state.refuse_sessions.load(Ordering::SeqCst) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "value": {
                    "error": "session not created",
                    "message": "Could not find a connected Android device"
                }
            })),
        );
    }

    state.created.fetch_add(1, Ordering::SeqCst);
    let id = uuid::Uuid::new_v4().to_string();
    (
        StatusCode::OK,
        Json(json!({ "value": { "sessionId": id, "capabilities": {} } })),
    )
}

async fn delete_session(
    State(state): State<Arc<FakeState>>,
    Path(_id): Path<String>,
) -> Json<Value> {
    state.deleted.fetch_add(1, Ordering::SeqCst);
    Json(json!({ "value": null }))
}
