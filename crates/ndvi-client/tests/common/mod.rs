#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Form, Query, State};
use axum::http::{StatusCode, Uri};
use axum::routing::{get, post};
use axum::Router;
use ndvi_client::overlay::{BandRenderer, Opacity, OverlayHandle};
use ndvi_client::remote::RemoteClient;
use ndvi_client::session::{self, SessionHandle, SessionUpdate};
use ndvi_proto::config::Config;
use ndvi_proto::protocol::{AlertMessage, Frame};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};

pub const CLIENT_ID: &str = "1700000000TEST01";

// ── Mock compute backend ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Call {
    pub path: String,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct Rule {
    path: &'static str,
    when: Option<(&'static str, String)>,
    status: StatusCode,
    body: String,
    delay: Duration,
}

/// In-process stand-in for the compute service.  Replies come from rules
/// (first match wins) and every request is recorded.
#[derive(Clone, Default)]
pub struct MockBackend {
    calls: Arc<Mutex<Vec<Call>>>,
    rules: Arc<Mutex<Vec<Rule>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reply(&self, path: &'static str, body: &str) -> &Self {
        self.rule(path, None, StatusCode::OK, body, Duration::ZERO)
    }

    pub fn reply_status(&self, path: &'static str, status: StatusCode) -> &Self {
        self.rule(path, None, status, "", Duration::ZERO)
    }

    /// Reply only when form field `field` equals `value`, after `delay`.
    pub fn reply_when(
        &self,
        path: &'static str,
        field: &'static str,
        value: &str,
        body: &str,
        delay: Duration,
    ) -> &Self {
        self.rule(path, Some((field, value.to_string())), StatusCode::OK, body, delay)
    }

    pub fn reply_delayed(&self, path: &'static str, body: &str, delay: Duration) -> &Self {
        self.rule(path, None, StatusCode::OK, body, delay)
    }

    fn rule(
        &self,
        path: &'static str,
        when: Option<(&'static str, String)>,
        status: StatusCode,
        body: &str,
        delay: Duration,
    ) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            path,
            when,
            status,
            body: body.to_string(),
            delay,
        });
        self
    }

    pub fn calls(&self, path: &str) -> Vec<Call> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.path == path)
            .cloned()
            .collect()
    }

    async fn answer(&self, path: String, params: HashMap<String, String>) -> (StatusCode, String) {
        let rule = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .find(|r| {
                r.path == path
                    && r.when
                        .as_ref()
                        .map(|(field, value)| params.get(*field) == Some(value))
                        .unwrap_or(true)
            })
            .cloned();
        self.calls.lock().unwrap().push(Call { path, params });
        match rule {
            Some(rule) => {
                tokio::time::sleep(rule.delay).await;
                (rule.status, rule.body)
            }
            None => (StatusCode::OK, String::new()),
        }
    }

    /// Serve on an ephemeral port and return the base URL.
    pub async fn start(&self) -> String {
        let app = Router::new()
            .route("/mapid", post(form_handler))
            .route("/chart", post(form_handler))
            .route("/export", post(form_handler))
            .route("/download", post(form_handler))
            .route("/clean", get(query_handler))
            .with_state(self.clone());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }
}

async fn form_handler(
    State(backend): State<MockBackend>,
    uri: Uri,
    Form(params): Form<HashMap<String, String>>,
) -> (StatusCode, String) {
    backend.answer(uri.path().to_string(), params).await
}

async fn query_handler(
    State(backend): State<MockBackend>,
    uri: Uri,
    Query(params): Query<HashMap<String, String>>,
) -> (StatusCode, String) {
    backend.answer(uri.path().to_string(), params).await
}

// ── Mock push server ──────────────────────────────────────────────────────────

pub struct MockPush {
    pub address: String,
    /// Alerts to push.  Dropping it closes the connection.
    pub alerts: mpsc::Sender<AlertMessage>,
    /// Resolves with the client id from the `Subscribe` frame.
    pub subscribed: oneshot::Receiver<String>,
}

pub async fn start_push() -> MockPush {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let (alert_tx, mut alert_rx) = mpsc::channel::<AlertMessage>(16);
    let (sub_tx, sub_rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut tmp = [0u8; 1024];
        let mut read_buf = Vec::new();
        loop {
            let n = socket.read(&mut tmp).await.unwrap();
            if n == 0 {
                return;
            }
            read_buf.extend_from_slice(&tmp[..n]);
            if let Some((Frame::Subscribe { client_id, .. }, _)) = Frame::decode(&read_buf).unwrap() {
                let _ = sub_tx.send(client_id);
                break;
            }
        }
        while let Some(alert) = alert_rx.recv().await {
            let encoded = Frame::Alert(alert).encode().unwrap();
            if socket.write_all(&encoded).await.is_err() {
                return;
            }
        }
    });

    MockPush {
        address,
        alerts: alert_tx,
        subscribed: sub_rx,
    }
}

// ── Session fixtures ──────────────────────────────────────────────────────────

/// Renderer that remembers every call as `"render <band> <opacity>"` or
/// `"remove <band>"`.
#[derive(Clone, Default)]
pub struct Recorder(Arc<Mutex<Vec<String>>>);

impl Recorder {
    pub fn ops(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

impl BandRenderer for Recorder {
    fn render_band(&mut self, handle: &OverlayHandle, opacity: Opacity) {
        self.0
            .lock()
            .unwrap()
            .push(format!("render {} {:?}", handle.band, opacity));
    }

    fn remove_band(&mut self, handle: &OverlayHandle) {
        self.0
            .lock()
            .unwrap()
            .push(format!("remove {}", handle.band));
    }
}

pub struct TestSession {
    pub handle: SessionHandle,
    pub updates: broadcast::Receiver<SessionUpdate>,
    pub recorder: Recorder,
}

pub fn start_session(base_url: &str) -> TestSession {
    let mut config = Config::default();
    config.alerts.fade_out_ms = 0;
    let remote = RemoteClient::new(base_url, CLIENT_ID, Duration::from_secs(2)).unwrap();
    let recorder = Recorder::default();
    let (handle, _task) = session::start(&config, remote, Box::new(recorder.clone()));
    let updates = handle.subscribe();
    TestSession {
        handle,
        updates,
        recorder,
    }
}

/// Wait until `pick` accepts an update, failing after five seconds.
pub async fn wait_for<T>(
    updates: &mut broadcast::Receiver<SessionUpdate>,
    mut pick: impl FnMut(&SessionUpdate) -> Option<T>,
) -> T {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    if let Some(value) = pick(&update) {
                        return value;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => panic!("update stream ended: {}", e),
            }
        }
    })
    .await
    .expect("timed out waiting for a session update")
}
