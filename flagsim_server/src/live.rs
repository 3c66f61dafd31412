//! Live push channel.
//!
//! Clients connect over TCP and speak newline-delimited JSON frames. The
//! handshake names the session to watch, which is what makes reconnection
//! safe: a returning client subscribes with the same session token and
//! immediately receives a fresh status snapshot before the delta stream.
//!
//! The server sends periodic `ping` frames and tracks client liveness;
//! client frames (any frame, `ping` included) refresh it. Dead or errored
//! connections are deregistered silently - dropping the subscription is
//! the whole teardown.

use flagsim_core::{EngineError, LogEntry, SessionSnapshot, SimulationController};
use flagsim_env::TokioContext;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Cadence of server-side ping frames.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// A connection that has sent nothing for this long is considered dead.
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(45);

type Controller = Arc<SimulationController<TokioContext>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ClientFrame {
    /// Handshake: names the session this connection watches
    Subscribe { session_id: String },
    /// Liveness frame
    Ping,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ServerFrame<'a> {
    Status {
        data: &'a SessionSnapshot,
    },
    Log {
        #[serde(flatten)]
        entry: &'a LogEntry,
    },
    Ping,
}

/// Accepts live-channel connections forever.
pub async fn serve(listen: &str, controller: Controller) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen).await?;
    info!(%listen, "live channel listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "failed to accept live connection");
                continue;
            }
        };
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, controller).await {
                // transport failures never reach the simulation run
                let err = EngineError::Transport(err.to_string());
                debug!(%peer, %err, "live connection closed");
            }
        });
    }
}

async fn handle_connection(stream: TcpStream, controller: Controller) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Handshake: the first frame must name a session
    let first = tokio::time::timeout(LIVENESS_TIMEOUT, lines.next_line())
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake timed out"))??;
    let Some(first) = first else {
        return Ok(()); // closed before handshake
    };
    let session_id = match serde_json::from_str::<ClientFrame>(&first) {
        Ok(ClientFrame::Subscribe { session_id }) => session_id,
        _ => {
            write_frame(
                &mut writer,
                &serde_json::json!({"type": "error", "message": "expected subscribe frame"}),
            )
            .await?;
            return Ok(());
        }
    };
    debug!(%session_id, "live subscriber attached");

    let mut subscription = controller.subscribe(&session_id);

    // Fresh snapshot on connect, so reconnecting clients resume instantly
    let snapshot = controller.status(&session_id);
    write_frame(&mut writer, &ServerFrame::Status { data: &snapshot }).await?;

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            changed = subscription.status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = subscription.status.borrow_and_update().clone();
                if let Some(snapshot) = snapshot {
                    write_frame(&mut writer, &ServerFrame::Status { data: &snapshot }).await?;
                }
            }
            log = subscription.logs.recv() => {
                match log {
                    Ok(entry) => {
                        write_frame(&mut writer, &ServerFrame::Log { entry: &entry }).await?;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // slow consumer: skip ahead rather than buffer
                        debug!(%session_id, skipped, "live subscriber lagged on logs");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        last_seen = Instant::now();
                        if serde_json::from_str::<ClientFrame>(&line).is_err() {
                            debug!(%session_id, "ignoring malformed client frame");
                        }
                    }
                    // peer closed or transport error: deregister silently
                    Ok(None) | Err(_) => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_seen.elapsed() > LIVENESS_TIMEOUT {
                    debug!(%session_id, "live subscriber timed out");
                    break;
                }
                write_frame(&mut writer, &ServerFrame::Ping).await?;
            }
        }
    }

    Ok(())
}

async fn write_frame<T: Serialize>(
    writer: &mut OwnedWriteHalf,
    frame: &T,
) -> std::io::Result<()> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use flagsim_core::session::StatsSnapshot;

    #[test]
    fn test_client_frames_parse() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"subscribe","session_id":"s-1"}"#).unwrap();
        assert!(matches!(
            frame,
            ClientFrame::Subscribe { session_id } if session_id == "s-1"
        ));

        let frame: ClientFrame = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(frame, ClientFrame::Ping));
    }

    #[test]
    fn test_server_frames_are_tagged() {
        let snapshot = SessionSnapshot {
            session_id: "s-1".into(),
            running: true,
            events_sent: 3,
            first_event_time: None,
            end_time: None,
            stats: StatsSnapshot::default(),
            last_error: None,
            total_logs_generated: 0,
            config: None,
        };
        let json = serde_json::to_value(ServerFrame::Status { data: &snapshot }).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["data"]["events_sent"], 3);

        let entry = LogEntry {
            timestamp: 1,
            formatted_time: "00:00:00.001".into(),
            message: "hello".into(),
            user_key: Some("usr-1".into()),
        };
        let json = serde_json::to_value(ServerFrame::Log { entry: &entry }).unwrap();
        assert_eq!(json["type"], "log");
        assert_eq!(json["message"], "hello");
        assert_eq!(json["user_key"], "usr-1");

        let json = serde_json::to_value(ServerFrame::Ping).unwrap();
        assert_eq!(json["type"], "ping");
    }
}
