//! One browser connection: connected notice, baseline snapshot, then a single
//! loop multiplexing heartbeats, group events, and client frames.

use std::{fmt::Display, future::pending, sync::Arc, time::Duration};

use axum::extract::ws::Message;
use callboard_core::{ClientMessage, ServerMessage};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    broadcast::{GroupHub, GroupMessage, Membership},
    fetcher::SnapshotFetcher,
    upstream::preview,
};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

const FRAME_LOG_PREVIEW: usize = 128;

/// Everything a session needs from the server.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: GroupHub,
    pub fetcher: SnapshotFetcher,
    pub group: String,
    pub heartbeat_interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Active,
    Closing,
    Closed,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to send {kind} frame: {reason}")]
    Transport { kind: &'static str, reason: String },
    #[error("failed to encode {kind} frame: {source}")]
    Encode {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientClosed,
    StreamEnded,
    ReceiveError,
    SendFailed,
    GroupClosed,
}

impl CloseReason {
    pub fn metric_label(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::StreamEnded => "stream_ended",
            CloseReason::ReceiveError => "receive_error",
            CloseReason::SendFailed => "send_failed",
            CloseReason::GroupClosed => "group_closed",
        }
    }
}

/// Drives one connection until it closes. Membership and the heartbeat are
/// released before this returns, whichever way the session ends.
pub async fn serve<S, R, E>(
    session_id: Uuid,
    sink: S,
    mut stream: R,
    ctx: SessionContext,
) -> CloseReason
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: Display,
{
    let mut session = Session::new(session_id, sink, ctx);
    let reason = match session.open().await {
        Ok(()) => session.run(&mut stream).await,
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "session failed while opening");
            CloseReason::SendFailed
        }
    };
    session.close(reason).await;
    reason
}

struct Session<S> {
    id: Uuid,
    sink: S,
    ctx: SessionContext,
    state: SessionState,
    membership: Option<Membership>,
    heartbeat: Option<Interval>,
    started: Instant,
    _active: ActiveSession,
}

impl<S> Session<S>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    fn new(id: Uuid, sink: S, ctx: SessionContext) -> Self {
        Self {
            id,
            sink,
            ctx,
            state: SessionState::Connecting,
            membership: None,
            heartbeat: None,
            started: Instant::now(),
            _active: ActiveSession::new(),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(session_id = %self.id, from = ?self.state, to = ?next, "session state change");
        self.state = next;
    }

    async fn open(&mut self) -> Result<(), SessionError> {
        self.send(&ServerMessage::connected()).await?;
        self.membership = Some(self.ctx.hub.join(&self.ctx.group, self.id));
        self.transition(SessionState::Open);

        let baseline = self.ctx.fetcher.fetch().await;
        self.send(&ServerMessage::DataUpdate { payload: baseline })
            .await?;

        let period = self.ctx.heartbeat_interval;
        let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.heartbeat = Some(heartbeat);
        self.transition(SessionState::Active);
        info!(session_id = %self.id, group = %self.ctx.group, "session active");
        Ok(())
    }

    async fn run<R, E>(&mut self, stream: &mut R) -> CloseReason
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        loop {
            tokio::select! {
                _ = next_tick(&mut self.heartbeat) => {
                    if let Err(err) = self.send(&ServerMessage::Heartbeat).await {
                        debug!(session_id = %self.id, error = %err, "heartbeat send failed");
                        return CloseReason::SendFailed;
                    }
                }
                message = next_event(&mut self.membership) => {
                    let Some(message) = message else {
                        return CloseReason::GroupClosed;
                    };
                    if let Err(err) = self.forward(&message).await {
                        debug!(session_id = %self.id, error = %err, "update send failed");
                        return CloseReason::SendFailed;
                    }
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Close(frame))) => {
                        debug!(
                            session_id = %self.id,
                            reason = ?frame.map(|f| f.reason.to_string()),
                            "client closed websocket"
                        );
                        return CloseReason::ClientClosed;
                    }
                    Some(Ok(Message::Text(text))) => {
                        let parsed = serde_json::from_str::<ClientMessage>(&text);
                        if let Err(err) = self.handle_client(parsed, &text).await {
                            debug!(session_id = %self.id, error = %err, "reply send failed");
                            return CloseReason::SendFailed;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        let parsed = serde_json::from_slice::<ClientMessage>(&bytes);
                        let text = String::from_utf8_lossy(&bytes);
                        if let Err(err) = self.handle_client(parsed, &text).await {
                            debug!(session_id = %self.id, error = %err, "reply send failed");
                            return CloseReason::SendFailed;
                        }
                    }
                    // Transport-level ping/pong is answered by the socket itself.
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(session_id = %self.id, error = %err, "error receiving frame");
                        return CloseReason::ReceiveError;
                    }
                    None => return CloseReason::StreamEnded,
                },
            }
        }
    }

    async fn handle_client(
        &mut self,
        parsed: Result<ClientMessage, serde_json::Error>,
        raw: &str,
    ) -> Result<(), SessionError> {
        match parsed {
            Ok(ClientMessage::Ping) => {
                counter!("callboard_client_pings_total").increment(1);
                self.send(&ServerMessage::Pong).await
            }
            Ok(ClientMessage::Unknown) => {
                counter!("callboard_client_frames_ignored_total", "reason" => "unknown_type").increment(1);
                debug!(
                    session_id = %self.id,
                    frame = %preview(raw, FRAME_LOG_PREVIEW),
                    "ignoring frame with unknown type"
                );
                Ok(())
            }
            Err(err) => {
                counter!("callboard_client_frames_ignored_total", "reason" => "malformed").increment(1);
                warn!(
                    session_id = %self.id,
                    error = %err,
                    frame = %preview(raw, FRAME_LOG_PREVIEW),
                    "ignoring malformed client frame"
                );
                Ok(())
            }
        }
    }

    async fn forward(&mut self, message: &GroupMessage) -> Result<(), SessionError> {
        self.send_text("data_update", message.text.clone()).await
    }

    async fn send(&mut self, message: &ServerMessage) -> Result<(), SessionError> {
        let kind = message.kind();
        let text = serde_json::to_string(message)
            .map_err(|source| SessionError::Encode { kind, source })?;
        self.send_text(kind, text).await
    }

    async fn send_text(&mut self, kind: &'static str, text: String) -> Result<(), SessionError> {
        self.sink
            .send(Message::Text(text))
            .await
            .map_err(|err| SessionError::Transport {
                kind,
                reason: err.to_string(),
            })?;
        counter!("callboard_frames_sent_total", "kind" => kind).increment(1);
        Ok(())
    }

    async fn close(&mut self, reason: CloseReason) {
        self.transition(SessionState::Closing);
        self.heartbeat = None;
        self.membership = None;
        if let Err(err) = self.sink.close().await {
            debug!(session_id = %self.id, error = %err, "socket close failed");
        }
        self.transition(SessionState::Closed);

        let lifetime = self.started.elapsed();
        counter!("callboard_sessions_closed_total", "reason" => reason.metric_label()).increment(1);
        histogram!("callboard_session_duration_seconds").record(lifetime.as_secs_f64());
        info!(
            session_id = %self.id,
            reason = reason.metric_label(),
            lifetime_ms = lifetime.as_millis() as u64,
            "session closed"
        );
    }
}

async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => pending().await,
    }
}

async fn next_event(membership: &mut Option<Membership>) -> Option<Arc<GroupMessage>> {
    match membership {
        Some(membership) => membership.recv().await,
        None => pending().await,
    }
}

/// Holds one unit of the active-session gauge until dropped.
struct ActiveSession;

impl ActiveSession {
    fn new() -> Self {
        counter!("callboard_sessions_opened_total").increment(1);
        gauge!("callboard_sessions_active").increment(1.0);
        ActiveSession
    }
}

impl Drop for ActiveSession {
    fn drop(&mut self) {
        gauge!("callboard_sessions_active").decrement(1.0);
    }
}
