// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Session supervisor.
//!
//! Accepts the client handshake, builds the session's components
//! (persistence row, receiver task, frame source, recorder, pacing loop)
//! and guarantees the teardown ladder runs on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{error, info, warn};

use crate::api::AppState;
use crate::db::{Db, SessionMeta};
use crate::pacing::{self, TickSink};
use crate::params::{ParamStore, Params};
use crate::protocol::{Inbound, Outbound, StartRequest};
use crate::recorder::Recorder;
use crate::source;

/// Terminal session states; `Running` is the only non-terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Running,
    Done,
    Stopped,
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Done => "done",
            SessionStatus::Stopped => "stopped",
            SessionStatus::Error => "error",
        }
    }
}

/// Stop flag + monotonic terminal status, shared between the receiver
/// task and the pacing loop.
pub struct SessionState {
    stop: AtomicBool,
    status: Mutex<SessionStatus>,
    notify: Notify,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            status: Mutex::new(SessionStatus::Running),
            notify: Notify::new(),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Record a terminal status; the first terminal value wins.
    pub fn finish(&self, status: SessionStatus) {
        let mut guard = self.status.lock();
        if *guard == SessionStatus::Running {
            *guard = status;
        }
    }

    /// Record a terminal status and ask the loops to exit.
    pub fn request_stop(&self, status: SessionStatus) {
        self.finish(status);
        self.stop.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Resolves when a stop has been requested.
    pub async fn wait_stop(&self) {
        while !self.stop_requested() {
            self.notify.notified().await;
        }
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock()
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Run one client session to completion. Entered from the WebSocket
/// upgrade handler; returning closes the connection.
pub async fn run(socket: WebSocket, app: Arc<AppState>) {
    let (sink, stream) = socket.split();

    // Single writer task serialises all outbound records; both the pacing
    // loop and the receiver enqueue through clones of this sender.
    let (out_tx, out_rx) = mpsc::channel::<Outbound>(64);
    let writer = tokio::spawn(writer_task(sink, out_rx));

    if let Err(msg) = run_inner(stream, &app, out_tx).await {
        info!(reason = msg, "Session rejected");
    }

    // All senders are gone by now; the writer drains and closes.
    if let Err(e) = writer.await {
        warn!(error = %e, "Outbound writer task failed");
    }
}

/// Handshake + session body. `Err` carries the rejection reason for
/// protocol failures before a session exists.
async fn run_inner(
    mut stream: SplitStream<WebSocket>,
    app: &Arc<AppState>,
    out_tx: mpsc::Sender<Outbound>,
) -> Result<(), &'static str> {
    // ===== 1. Start record =====
    let start = match read_start(&mut stream).await {
        Some(start) => start,
        None => {
            send_error(&out_tx, "invalid start message").await;
            return Err("invalid start message");
        }
    };
    let Some(raw_url) = start.source_url().map(str::to_string) else {
        send_error(&out_tx, "missing video_url").await;
        return Err("missing video_url");
    };

    let camera_id = start.camera_id.as_deref().unwrap_or("").trim().to_string();
    let camera_name = start.camera_name.as_deref().unwrap_or("").trim().to_string();
    let location = start.location.as_deref().unwrap_or("").trim().to_string();
    let source_type = start
        .source_type
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("video")
        .to_string();
    // HLS and MJPEG default to recording; files don't.
    let record_video = start
        .record_video
        .unwrap_or(matches!(source_type.as_str(), "hls" | "mjpeg"));

    let mut params = Params::from_defaults(&app.config.defaults);
    params.apply(&start.params);

    let resolved = source::resolve_source_url(&raw_url, &app.config.paths.video_root);
    info!(raw = %raw_url, resolved = %resolved, source_type = %source_type, "Session starting");

    // ===== 2. Persistence row =====
    let mut db_session: Option<(Db, i64)> = None;
    if start.save_to_db {
        match &app.db {
            Some(db) => {
                let meta = SessionMeta {
                    camera_id: &camera_id,
                    camera_name: &camera_name,
                    location: &location,
                    source_type: &source_type,
                    // The original address, useful when reviewing history.
                    source_url: &raw_url,
                };
                match db.create_session(&meta, &params).await {
                    Ok(session_id) => {
                        info!(session_id, "Session row created");
                        let _ = out_tx.send(Outbound::SessionCreated { session_id }).await;
                        db_session = Some((db.clone(), session_id));
                    }
                    Err(e) => {
                        warn!(error = %e, "Session row creation failed, continuing without persistence");
                    }
                }
            }
            None => warn!("save_to_db requested but the database is disabled"),
        }
    }

    let state = Arc::new(SessionState::new());
    let params = Arc::new(ParamStore::new(params));

    // ===== 3. Receiver task: set_params / stop / disconnect =====
    let receiver = tokio::spawn(receiver_task(
        stream,
        state.clone(),
        params.clone(),
        out_tx.clone(),
    ));

    // ===== 4. Frame source =====
    let source = match source::open(&resolved).await {
        Ok(source) => source,
        Err(e) => {
            error!(error = %e, url = %resolved, "Source open failed");
            send_error(&out_tx, &format!("video open failed: {e}")).await;
            state.request_stop(SessionStatus::Error);
            receiver.abort();
            finish_persistence(&db_session, None, SessionStatus::Error).await;
            return Ok(());
        }
    };

    // ===== 5. Recorder (optional, independent of the loop) =====
    let recorder = if record_video {
        match Recorder::spawn(
            &app.config.paths.record_root,
            &camera_id,
            &resolved,
            Some(params.snapshot().fps),
        ) {
            Ok(recorder) => Some(recorder),
            Err(e) => {
                warn!(error = %e, "Recorder failed to start");
                None
            }
        }
    } else {
        None
    };
    let record_rel = recorder.as_ref().map(|r| r.rel_path.clone());

    // ===== 6. Pacing loop =====
    let sink = db_session
        .as_ref()
        .map(|(db, session_id)| TickSink { db: db.clone(), session_id: *session_id });
    pacing::run(source, app.models.clone(), params, state.clone(), out_tx, sink).await;

    // ===== 7. Teardown ladder; every step runs =====
    state.request_stop(SessionStatus::Stopped);
    receiver.abort();
    if let Some(recorder) = recorder {
        recorder.stop().await;
    }
    let status = state.status();
    finish_persistence(&db_session, record_rel.as_deref(), status).await;
    info!(status = status.as_str(), "Session finished");
    Ok(())
}

/// Pull text messages until the start record arrives; anything that is
/// not parseable JSON rejects the session.
async fn read_start(stream: &mut SplitStream<WebSocket>) -> Option<StartRequest> {
    loop {
        match stream.next().await? {
            Ok(Message::Text(text)) => {
                return serde_json::from_str::<StartRequest>(text.as_str()).ok();
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            // Pings and binary noise before the handshake are ignored.
            Ok(_) => continue,
        }
    }
}

async fn receiver_task(
    mut stream: SplitStream<WebSocket>,
    state: Arc<SessionState>,
    params: Arc<ParamStore>,
    out_tx: mpsc::Sender<Outbound>,
) {
    while !state.stop_requested() {
        let msg = match stream.next().await {
            Some(Ok(msg)) => msg,
            // Disconnect mid-stream is treated like a stop request.
            Some(Err(_)) | None => {
                state.request_stop(SessionStatus::Stopped);
                break;
            }
        };
        match msg {
            Message::Text(text) => handle_inbound(text.as_str(), &state, &params, &out_tx).await,
            Message::Close(_) => {
                state.request_stop(SessionStatus::Stopped);
                break;
            }
            _ => {}
        }
    }
}

/// Dispatch one inbound control record. Malformed JSON is ignored, like
/// any unknown record type.
pub async fn handle_inbound(
    text: &str,
    state: &SessionState,
    params: &ParamStore,
    out_tx: &mpsc::Sender<Outbound>,
) {
    let Ok(msg) = serde_json::from_str::<Inbound>(text) else {
        return;
    };
    match msg {
        Inbound::SetParams(update) => {
            let (accepted, snapshot) = params.update(&update);
            let _ = out_tx
                .send(Outbound::Ack {
                    updated: accepted.iter().map(|k| k.to_string()).collect(),
                    params: snapshot,
                })
                .await;
        }
        Inbound::Stop => {
            state.request_stop(SessionStatus::Stopped);
        }
    }
}

async fn writer_task(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::Receiver<Outbound>,
) {
    while let Some(msg) = out_rx.recv().await {
        let text = match serde_json::to_string(&msg) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "Outbound record failed to serialise");
                continue;
            }
        };
        if sink.send(Message::Text(text.into())).await.is_err() {
            // Peer is gone. Dropping the receiver makes the next enqueue
            // fail, which the pacing loop treats as terminal.
            break;
        }
    }
    let _ = sink.close().await;
}

async fn send_error(out_tx: &mpsc::Sender<Outbound>, msg: &str) {
    let _ = out_tx.send(Outbound::Error { msg: msg.to_string() }).await;
}

/// Final persistence updates; each failure is logged and skipped over.
async fn finish_persistence(
    db_session: &Option<(Db, i64)>,
    record_path: Option<&str>,
    status: SessionStatus,
) {
    let Some((db, session_id)) = db_session else {
        return;
    };
    if let Some(path) = record_path {
        if let Err(e) = db.update_record_path(*session_id, path).await {
            warn!(session = session_id, error = %e, "Record path update failed");
        }
    }
    if let Err(e) = db.finish_session(*session_id, status.as_str()).await {
        warn!(session = session_id, error = %e, "Session finish update failed");
    }
}
