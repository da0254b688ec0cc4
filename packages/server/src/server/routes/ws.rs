//! Live job stream over WebSockets.
//!
//! GET /ws/jobs/:projectId?token=JWT
//!
//! Auth happens at open time from the `?token=` query param (browsers can't
//! set headers on WebSocket upgrades). The path names the project; the token
//! must belong to its organization. Close codes: 4000 bad path, 4001 auth,
//! 4500 internal.
//!
//! Back-pressure: each connection owns a bounded send queue. When it fills,
//! the oldest LOG event goes first, then non-terminal JOB_UPDATEs; terminal
//! JOB_UPDATEs are never dropped.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Path, Query};
use axum::response::Response;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Notify;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::kernel::event_bus::LiveEvent;
use crate::server::app::AppState;

/// Server ping cadence; a connection that misses a whole tick is dead.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Events buffered per connection before the drop policy kicks in.
const SEND_QUEUE_CAPACITY: usize = 256;

pub const CLOSE_BAD_PATH: u16 = 4000;
pub const CLOSE_AUTH: u16 = 4001;
pub const CLOSE_INTERNAL: u16 = 4500;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

/// Bounded per-connection event queue with the LOG-first drop policy.
struct SendQueue {
    events: Mutex<VecDeque<LiveEvent>>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        })
    }

    fn push(&self, event: LiveEvent) {
        {
            let mut events = self.events.lock().unwrap_or_else(|e| e.into_inner());
            if events.len() >= self.capacity {
                if let Some(pos) = events.iter().position(|e| matches!(e, LiveEvent::Log(_))) {
                    events.remove(pos);
                } else if let Some(pos) =
                    events.iter().position(|e| !e.is_terminal_job_update())
                {
                    events.remove(pos);
                } else if !event.is_terminal_job_update() {
                    // nothing droppable buffered; shed the incoming event
                    return;
                }
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<LiveEvent> {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    async fn wait(&self) {
        self.notify.notified().await;
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(project_id): Path<String>,
    Query(query): Query<WsQuery>,
    Extension(state): Extension<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, project_id, query.token))
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, raw_project_id: String, token: Option<String>) {
    let Ok(project_id) = Uuid::parse_str(&raw_project_id) else {
        return close_with(socket, CLOSE_BAD_PATH, "bad project path").await;
    };

    let Some(token) = token else {
        return close_with(socket, CLOSE_AUTH, "missing token").await;
    };
    let Ok(claims) = state.jwt.verify_token(&token) else {
        return close_with(socket, CLOSE_AUTH, "invalid token").await;
    };

    let organization_id: Option<Uuid> = match sqlx::query_scalar(
        "SELECT organization_id FROM projects WHERE id = $1",
    )
    .bind(project_id)
    .fetch_optional(&state.kernel.db_pool)
    .await
    {
        Ok(row) => row,
        Err(e) => {
            warn!(error = %e, "project lookup failed during ws open");
            return close_with(socket, CLOSE_INTERNAL, "internal error").await;
        }
    };
    let Some(organization_id) = organization_id else {
        return close_with(socket, CLOSE_BAD_PATH, "unknown project").await;
    };
    if organization_id != claims.organization_id {
        return close_with(socket, CLOSE_AUTH, "project not in organization").await;
    }

    let bus_rx = state.kernel.event_bus.subscribe(organization_id, project_id).await;
    debug!(project_id = %project_id, user = %claims.sub, "ws subscriber connected");

    let (mut sink, mut stream) = socket.split();

    let connected = json!({
        "type": "CONNECTED",
        "payload": {"projectId": project_id, "timestamp": Utc::now()},
    });
    if sink.send(Message::Text(connected.to_string().into())).await.is_err() {
        return;
    }

    let queue = SendQueue::new(SEND_QUEUE_CAPACITY);

    // Forwarder: bus → bounded queue. Lag on the bus surfaces as skipped
    // events; the queue's own policy handles slow sockets.
    let forwarder = {
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut events = BroadcastStream::new(bus_rx);
            while let Some(result) = events.next().await {
                match result {
                    Ok(event) => queue.push(event),
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(missed, "ws subscriber lagged behind the bus");
                    }
                }
            }
        })
    };

    let pong_seen = AtomicBool::new(true);
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // immediate first tick

    loop {
        tokio::select! {
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let parsed: serde_json::Value =
                            serde_json::from_str(&text).unwrap_or_default();
                        match parsed.get("type").and_then(|t| t.as_str()) {
                            Some("PING") => {
                                let pong = json!({
                                    "type": "PONG",
                                    "payload": {"timestamp": Utc::now()},
                                });
                                if sink.send(Message::Text(pong.to_string().into())).await.is_err() {
                                    break;
                                }
                            }
                            // subscription is implicit in the path
                            Some("SUBSCRIBE") => {}
                            _ => {}
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_seen.store(true, Ordering::Relaxed);
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
            _ = queue.wait() => {
                let mut failed = false;
                while let Some(event) = queue.pop() {
                    match serde_json::to_string(&event) {
                        Ok(text) => {
                            if sink.send(Message::Text(text.into())).await.is_err() {
                                failed = true;
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "failed to serialize live event"),
                    }
                }
                if failed {
                    break;
                }
            }
            _ = heartbeat.tick() => {
                if !pong_seen.swap(false, Ordering::Relaxed) {
                    debug!(project_id = %project_id, "ws heartbeat missed, terminating");
                    break;
                }
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    forwarder.abort();
    debug!(project_id = %project_id, "ws subscriber disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::event_bus::{JobUpdate, LogEvent, LogLevel, LogModule};
    use crate::kernel::jobs::{JobStatus, JobType};

    fn log_event(message: &str) -> LiveEvent {
        LiveEvent::Log(LogEvent {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            level: LogLevel::Info,
            module: LogModule::Worker,
            message: message.to_string(),
            job_id: None,
            project_id: None,
            fields: serde_json::Value::Null,
        })
    }

    fn job_update(status: JobStatus) -> LiveEvent {
        LiveEvent::JobUpdate(JobUpdate {
            id: Uuid::new_v4(),
            job_type: JobType::FullScan,
            status,
            progress: 50,
            processed_items: 1,
            total_items: 2,
        })
    }

    #[test]
    fn full_queue_drops_oldest_log_first() {
        let queue = SendQueue::new(2);
        queue.push(log_event("first"));
        queue.push(job_update(JobStatus::Processing));
        queue.push(job_update(JobStatus::Completed));

        // "first" was shed; both job updates survive
        assert!(matches!(queue.pop(), Some(LiveEvent::JobUpdate(_))));
        assert!(matches!(queue.pop(), Some(LiveEvent::JobUpdate(_))));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn terminal_updates_survive_overflow() {
        let queue = SendQueue::new(2);
        queue.push(job_update(JobStatus::Completed));
        queue.push(job_update(JobStatus::Failed));
        queue.push(log_event("shed me"));

        // queue holds only terminal updates; the incoming log is shed
        assert!(matches!(
            queue.pop(),
            Some(LiveEvent::JobUpdate(update)) if update.status == JobStatus::Completed
        ));
        assert!(matches!(
            queue.pop(),
            Some(LiveEvent::JobUpdate(update)) if update.status == JobStatus::Failed
        ));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn non_terminal_updates_are_shed_before_terminal_ones() {
        let queue = SendQueue::new(2);
        queue.push(job_update(JobStatus::Processing));
        queue.push(job_update(JobStatus::Completed));
        queue.push(job_update(JobStatus::Cancelled));

        let statuses: Vec<JobStatus> = std::iter::from_fn(|| {
            queue.pop().map(|e| match e {
                LiveEvent::JobUpdate(update) => update.status,
                _ => panic!("unexpected event"),
            })
        })
        .collect();
        assert_eq!(statuses, vec![JobStatus::Completed, JobStatus::Cancelled]);
    }

    #[test]
    fn close_codes_match_the_surface_contract() {
        assert_eq!(CLOSE_BAD_PATH, 4000);
        assert_eq!(CLOSE_AUTH, 4001);
        assert_eq!(CLOSE_INTERNAL, 4500);
    }
}
