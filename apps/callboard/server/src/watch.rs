use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use callboard_core::ServerMessage;
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Connects to `url` and prints a line per frame until the server closes
/// the socket or `count` frames have arrived.
pub async fn run_watch(
    url: String,
    token: Option<String>,
    ping_secs: Option<u64>,
    count: Option<usize>,
) -> Result<()> {
    let target = match token {
        Some(token) => format!("{url}?token={token}"),
        None => url,
    };
    debug!(url = %target, "connecting");

    let (ws_stream, _) = timeout(CONNECT_TIMEOUT, connect_async(target.as_str()))
        .await
        .map_err(|_| anyhow!("connection timeout - is the callboard server running?"))?
        .with_context(|| format!("failed to connect to {target}"))?;
    info!(url = %target, "connected");
    let (mut write, mut read) = ws_stream.split();

    let mut pinger = ping_secs.filter(|secs| *secs > 0).map(|secs| {
        let mut interval = tokio::time::interval(Duration::from_secs(secs));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let mut seen = 0usize;
    loop {
        tokio::select! {
            _ = async {
                match pinger.as_mut() {
                    Some(interval) => { interval.tick().await; }
                    None => std::future::pending::<()>().await,
                }
            } => {
                write
                    .send(Message::Text(r#"{"type":"ping"}"#.to_string().into()))
                    .await
                    .context("failed to send ping")?;
            }
            frame = read.next() => {
                let Some(frame) = frame else {
                    info!("server closed the stream");
                    break;
                };
                match frame.context("websocket error")? {
                    Message::Text(text) => {
                        println!("{}", describe(text.as_str()));
                        seen += 1;
                        if count.is_some_and(|limit| seen >= limit) {
                            break;
                        }
                    }
                    Message::Close(frame) => {
                        info!(reason = ?frame.map(|f| f.reason.to_string()), "server closed websocket");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Err(err) = write.close().await {
        warn!(error = %err, "failed to close websocket cleanly");
    }
    Ok(())
}

fn describe(text: &str) -> String {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(ServerMessage::DataUpdate { payload }) => format!(
            "dataUpdate calls_on_hold={} live_queue_status={}",
            payload.calls_on_hold.len(),
            payload.live_queue_status.len()
        ),
        Ok(ServerMessage::Connected { message }) => format!("connected {message}"),
        Ok(other) => other.kind().to_string(),
        Err(_) => format!("unrecognised frame: {text}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn frames_are_summarised() {
        assert_eq!(
            describe(r#"{"type":"dataUpdate","payload":{"getCallsOnHoldData":[{"id":1}],"getLiveQueueStatusData":[]}}"#),
            "dataUpdate calls_on_hold=1 live_queue_status=0"
        );
        assert_eq!(describe(r#"{"type":"heartbeat"}"#), "heartbeat");
        assert_eq!(
            describe(r#"{"type":"connected","message":"connected"}"#),
            "connected connected"
        );
        assert_eq!(describe("hello"), "unrecognised frame: hello");
    }
}
