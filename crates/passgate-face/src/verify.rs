//! WebSocket verification client.
//!
//! One connection per pending session, against
//! `ws://{host}:{port}/api/cameras/{cam}/verify?person_id={cid}&...`.
//! The handshake carries `Origin`, the configured extra headers, and
//! `Sec-WebSocket-Protocol: verification`; the `Sec-WebSocket-Key` is a
//! random 16-byte nonce and the server's `Sec-WebSocket-Accept` is
//! verified against SHA-1 of key + RFC 6455 magic during the client
//! handshake.
//!
//! Exactly one verdict is emitted per request; further events are
//! ignored and the connection closes with code 1000.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Local};
use futures::{SinkExt, StreamExt};
use passgate_core::{CamResult, Config};
use rand::RngCore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

const ORIGIN: &str = "passgate";
const SUBPROTOCOL: &str = "verification";
/// Close code the server uses for "person has no face card".
const CLOSE_NOT_FOUND: u16 = 4002;

/// Events delivered to the orchestrator.
#[derive(Debug, Clone)]
pub enum VerifyEvent {
    /// The one verdict of a request: YES / NO / NF / FAIL.
    Verdict {
        request_id: String,
        session_id: String,
        result: CamResult,
        message: String,
    },
    /// Correlation progress, as the best percentage seen.
    Progress {
        request_id: String,
        session_id: String,
        percent: u8,
    },
}

/// Read-only request snapshot for the status surface.
#[derive(Debug, Clone)]
pub struct VerifyRequestInfo {
    pub request_id: String,
    pub session_id: String,
    pub camera_id: String,
    pub person_id: String,
    pub started_at: DateTime<Local>,
    pub last_event: String,
}

/// Spawns one task per verification request and demultiplexes server
/// events back to the orchestrator.
pub struct VerifyClient {
    cfg: Arc<Config>,
    events: mpsc::Sender<VerifyEvent>,
    requests: Arc<Mutex<HashMap<String, VerifyRequestInfo>>>,
    counter: AtomicU64,
    cancel_tx: watch::Sender<bool>,
}

impl VerifyClient {
    #[must_use]
    pub fn new(cfg: Arc<Config>, events: mpsc::Sender<VerifyEvent>) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        VerifyClient {
            cfg,
            events,
            requests: Arc::new(Mutex::new(HashMap::new())),
            counter: AtomicU64::new(0),
            cancel_tx,
        }
    }

    /// Open a verification request for a session. The verdict arrives as
    /// a [`VerifyEvent`] on the client's event channel.
    pub fn start(&self, session_id: &str, camera_id: &str, person_id: &str) -> String {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let request_id = format!("vrq{n:06}");

        self.requests.lock().unwrap().insert(
            request_id.clone(),
            VerifyRequestInfo {
                request_id: request_id.clone(),
                session_id: session_id.to_string(),
                camera_id: camera_id.to_string(),
                person_id: person_id.to_string(),
                started_at: Local::now(),
                last_event: "connecting".to_string(),
            },
        );

        let task = RequestTask {
            cfg: self.cfg.clone(),
            events: self.events.clone(),
            requests: self.requests.clone(),
            request_id: request_id.clone(),
            session_id: session_id.to_string(),
            camera_id: camera_id.to_string(),
            person_id: person_id.to_string(),
            cancel_rx: self.cancel_tx.subscribe(),
        };
        tokio::spawn(task.run());
        request_id
    }

    /// Snapshot of in-flight requests.
    #[must_use]
    pub fn requests(&self) -> Vec<VerifyRequestInfo> {
        let mut list: Vec<VerifyRequestInfo> =
            self.requests.lock().unwrap().values().cloned().collect();
        list.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        list
    }

    /// Close every open request with code 1000 (shutdown path).
    pub fn close_all(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

struct RequestTask {
    cfg: Arc<Config>,
    events: mpsc::Sender<VerifyEvent>,
    requests: Arc<Mutex<HashMap<String, VerifyRequestInfo>>>,
    request_id: String,
    session_id: String,
    camera_id: String,
    person_id: String,
    cancel_rx: watch::Receiver<bool>,
}

impl RequestTask {
    fn url(&self) -> String {
        format!(
            "ws://{}:{}/api/cameras/{}/verify?person_id={}&subscribe=&max_mps=10&detect_face=none&correlation_face=none",
            self.cfg.cam_host, self.cfg.cam_port, self.camera_id, self.person_id
        )
    }

    fn note(&self, what: &str) {
        if let Some(info) = self.requests.lock().unwrap().get_mut(&self.request_id) {
            info.last_event = what.to_string();
        }
    }

    async fn emit_verdict(&self, verdict_sent: &mut bool, result: CamResult, message: String) {
        if *verdict_sent {
            return;
        }
        *verdict_sent = true;
        self.note(result.as_str());
        let _ = self
            .events
            .send(VerifyEvent::Verdict {
                request_id: self.request_id.clone(),
                session_id: self.session_id.clone(),
                result,
                message,
            })
            .await;
    }

    async fn run(mut self) {
        let deadline = Duration::from_secs_f64(self.cfg.service_request_expire_time);
        let mut verdict_sent = false;

        let connect = async {
            let mut request = self
                .url()
                .into_client_request()
                .map_err(|e| e.to_string())?;

            // 16-byte random nonce; the handshake verifies the server's
            // accept against it
            let mut nonce = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut nonce);
            let headers = request.headers_mut();
            headers.insert(
                "Sec-WebSocket-Key",
                HeaderValue::from_str(&BASE64.encode(nonce)).map_err(|e| e.to_string())?,
            );
            headers.insert("Origin", HeaderValue::from_static(ORIGIN));
            headers.insert(
                "Sec-WebSocket-Protocol",
                HeaderValue::from_static(SUBPROTOCOL),
            );
            for header in &self.cfg.cam_extra_headers {
                if let Some((name, value)) = header.split_once(':') {
                    if let (Ok(name), Ok(value)) = (
                        name.trim()
                            .parse::<tokio_tungstenite::tungstenite::http::header::HeaderName>(),
                        HeaderValue::from_str(value.trim()),
                    ) {
                        headers.insert(name, value);
                    }
                }
            }

            tokio::time::timeout(deadline, connect_async(request))
                .await
                .map_err(|_| "handshake timeout".to_string())?
                .map_err(|e| e.to_string())
        };

        let mut ws = match connect.await {
            Ok((ws, _response)) => ws,
            Err(e) => {
                warn!(request = %self.request_id, error = %e, "verification connect failed");
                self.emit_verdict(&mut verdict_sent, CamResult::Fail, e).await;
                self.requests.lock().unwrap().remove(&self.request_id);
                return;
            }
        };
        self.note("open");
        debug!(request = %self.request_id, camera = %self.camera_id, "verification open");

        loop {
            let message = tokio::select! {
                _ = self.cancel_rx.changed() => {
                    let _ = ws.send(close_frame(1000, "shutdown")).await;
                    break;
                }
                read = tokio::time::timeout(deadline, ws.next()) => match read {
                    Err(_) => {
                        self.emit_verdict(
                            &mut verdict_sent,
                            CamResult::Fail,
                            "read timeout".to_string(),
                        )
                        .await;
                        let _ = ws.send(close_frame(1000, "timeout")).await;
                        break;
                    }
                    Ok(None) => {
                        self.emit_verdict(
                            &mut verdict_sent,
                            CamResult::Fail,
                            "connection closed".to_string(),
                        )
                        .await;
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        self.emit_verdict(&mut verdict_sent, CamResult::Fail, e.to_string())
                            .await;
                        break;
                    }
                    Ok(Some(Ok(message))) => message,
                },
            };

            match message {
                Message::Text(text) => {
                    let Ok(event) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };

                    if event.get("verified").and_then(Value::as_bool) == Some(true) {
                        self.emit_verdict(&mut verdict_sent, CamResult::Yes, text.to_string())
                            .await;
                        let _ = ws.send(close_frame(1000, "autoclose")).await;
                        break;
                    }
                    if event.get("terminated").and_then(Value::as_bool) == Some(true) {
                        let _ = ws.send(close_frame(1000, "autoclose")).await;
                        break;
                    }
                    if let Some(percent) = max_correlation(&event) {
                        self.note("correlation");
                        let _ = self
                            .events
                            .send(VerifyEvent::Progress {
                                request_id: self.request_id.clone(),
                                session_id: self.session_id.clone(),
                                percent,
                            })
                            .await;
                    }
                }
                Message::Close(frame) => {
                    let (code, reason) = match frame {
                        Some(f) => (u16::from(f.code), f.reason.to_string()),
                        None => (1000, String::new()),
                    };
                    if code == CLOSE_NOT_FOUND {
                        self.emit_verdict(&mut verdict_sent, CamResult::Nf, reason).await;
                    }
                    break;
                }
                Message::Ping(payload) => {
                    let _ = ws.send(Message::Pong(payload)).await;
                }
                _ => {}
            }
        }

        self.requests.lock().unwrap().remove(&self.request_id);
        info!(request = %self.request_id, "verification closed");
    }
}

fn close_frame(code: u16, reason: &str) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(code),
        reason: reason.to_string().into(),
    }))
}

/// Best correlation percentage across all cameras in a correlations
/// event, `None` when the event carries no correlations.
fn max_correlation(event: &Value) -> Option<u8> {
    let correlations = event.get("correlations")?.as_object()?;
    let mut best: Option<u8> = None;
    for entry in correlations.values() {
        let Some(matches) = entry.get("matches").and_then(Value::as_array) else {
            continue;
        };
        for m in matches {
            if let Some(c) = m.get("correlation").and_then(Value::as_f64) {
                let percent = (c * 100.0).round().clamp(0.0, 100.0) as u8;
                best = Some(best.map_or(percent, |b| b.max(percent)));
            }
        }
    }
    best
}
