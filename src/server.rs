//! The governor's IPC accept loop and maintenance task.
//!
//! Structurally this mirrors `network/server_actor.rs::run()`: a
//! `tokio::select!` over the listener's accept future, a periodic
//! maintenance tick, and a shutdown signal; one task per accepted
//! connection, each looping over line-delimited reads until the peer
//! disconnects. The difference is the framing (JSON-lines instead of the
//! teacher's length-prefixed binary messages) and the destination of
//! dispatched requests (the token pool directly, rather than an
//! `mpsc`-routed `DaqCommand` actor — there is only one stateful resource
//! here, so the extra indirection the teacher needed for its instrument
//! registry has no counterpart).

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::ipc::{self, IpcListener};
use crate::pool::{AcquireOutcome, TokenPool};
use crate::protocol::{
    self, AcquireResponseData, Envelope, HeartbeatResponseData, ReleaseResponseData, Request,
    StatusResponseData,
};

/// Runs the accept loop until ctrl-c or (in background mode) until the pool
/// has been idle for `idle_shutdown` with no active leases. `maintenance_interval`
/// is the configured period between budget-refresh/lease-sweep ticks.
pub async fn run(
    pool: Arc<TokenPool>,
    mut listener: IpcListener,
    idle_shutdown: Option<Duration>,
    maintenance_interval: Duration,
) {
    let mut maintenance_interval = tokio::time::interval(maintenance_interval);
    let mut last_active = Instant::now();

    loop {
        tokio::select! {
            accepted = accept_one(&mut listener) => {
                match accepted {
                    Ok(stream) => {
                        let pool = pool.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, pool).await;
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                }
            }

            _ = maintenance_interval.tick() => {
                pool.run_maintenance().await;
                let status = pool.status().await;
                if status.active_leases > 0 {
                    last_active = Instant::now();
                }
                if let Some(idle_limit) = idle_shutdown {
                    if Instant::now().saturating_duration_since(last_active) >= idle_limit {
                        info!("idle shutdown threshold reached, exiting");
                        break;
                    }
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    ipc::cleanup();
}

#[cfg(unix)]
async fn accept_one(listener: &mut IpcListener) -> std::io::Result<tokio::net::UnixStream> {
    listener.accept().await.map(|(stream, _)| stream)
}

/// Waits for a client on the current pipe instance, then swaps in a freshly
/// created instance so the next call has something to wait on.
#[cfg(windows)]
async fn accept_one(
    listener: &mut IpcListener,
) -> std::io::Result<tokio::net::windows::named_pipe::NamedPipeServer> {
    listener.connect().await?;
    let connected = std::mem::replace(listener, crate::ipc::rebind()?);
    Ok(connected)
}

async fn handle_connection<S>(stream: S, pool: Arc<TokenPool>)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "connection read error");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let response_line = dispatch(&line, &pool).await;
        if let Err(e) = write_half.write_all(response_line.as_bytes()).await {
            error!(error = %e, "failed to write response");
            break;
        }
    }
}

async fn dispatch(line: &str, pool: &TokenPool) -> String {
    let request = match protocol::parse_request(line) {
        Ok(request) => request,
        Err(reason) => {
            debug!(reason = %reason, "malformed protocol message");
            return protocol::encode_error(&reason);
        }
    };

    match request {
        Request::Acquire(data) => {
            let outcome = pool
                .try_acquire(
                    &data.tool,
                    data.requested_tokens,
                    Duration::from_millis(data.timeout_ms),
                )
                .await;
            let response_data = match outcome {
                AcquireOutcome::Granted {
                    lease_id,
                    granted_tokens,
                    recommended_parallelism,
                    commit_ratio,
                } => AcquireResponseData {
                    granted: true,
                    lease_id: Some(lease_id),
                    granted_tokens,
                    recommended_parallelism,
                    reason: None,
                    commit_ratio,
                },
                AcquireOutcome::Denied {
                    reason,
                    recommended_parallelism,
                    commit_ratio,
                } => AcquireResponseData {
                    granted: false,
                    lease_id: None,
                    granted_tokens: 0,
                    recommended_parallelism,
                    reason: Some(reason),
                    commit_ratio,
                },
            };
            encode(Envelope::new("acquire_response", response_data))
        }
        Request::Release(data) => {
            let outcome = pool
                .release(
                    &data.lease_id,
                    data.peak_working_set_bytes,
                    data.peak_commit_bytes,
                    data.exit_code,
                    Duration::from_millis(data.duration_ms),
                    data.stderr_had_diagnostics,
                )
                .await;
            let response_data = ReleaseResponseData {
                acknowledged: outcome.acknowledged,
                classification: outcome
                    .classification
                    .unwrap_or(crate::classifier::Classification::Unknown),
                message: outcome.message,
                should_retry: outcome.should_retry,
                retry_with_tokens: outcome.retry_with_tokens,
            };
            encode(Envelope::new("release_response", response_data))
        }
        Request::Status(_) => {
            let status = pool.status().await;
            let response_data = StatusResponseData {
                total_tokens: status.total_tokens,
                available_tokens: status.available_tokens,
                active_leases: status.active_leases,
                commit_ratio: status.commit_ratio,
                commit_charge_bytes: status.commit_charge_bytes,
                commit_limit_bytes: status.commit_limit_bytes,
                available_memory_bytes: status.available_memory_bytes,
                recommended_parallelism: status.recommended_parallelism,
            };
            encode(Envelope::new("status_response", response_data))
        }
        Request::Heartbeat(data) => {
            let alive = pool.heartbeat(&data.lease_id).await;
            let timestamp = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let response_data = HeartbeatResponseData { alive, timestamp };
            encode(Envelope::new("heartbeat_response", response_data))
        }
    }
}

fn encode<T: serde::Serialize>(envelope: Envelope<T>) -> String {
    envelope
        .encode_line()
        .unwrap_or_else(|_| protocol::encode_error("failed to encode response"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::TokenBudgetConfig;
    use crate::classifier::ClassifierConfig;
    use crate::memory_probe::MemoryProbe;

    fn pool() -> TokenPool {
        TokenPool::new(
            Arc::new(MemoryProbe::new()),
            TokenBudgetConfig::default(),
            ClassifierConfig::default(),
        )
    }

    #[tokio::test]
    async fn status_request_dispatches_to_response() {
        let pool = pool();
        let line = r#"{"type":"status","data":{}}"#;
        let response = dispatch(line, &pool).await;
        assert!(response.contains("status_response"));
        assert!(response.contains("totalTokens"));
    }

    #[tokio::test]
    async fn malformed_line_produces_error_object() {
        let pool = pool();
        let response = dispatch("not json", &pool).await;
        assert!(response.contains("\"error\""));
    }

    #[tokio::test]
    async fn acquire_then_release_round_trips_through_dispatch() {
        let pool = pool();
        let acquire_line = r#"{"type":"acquire","data":{"tool":"cl","argsHash":"h","requestedTokens":1,"timeoutMs":10}}"#;
        let acquire_response = dispatch(acquire_line, &pool).await;
        assert!(acquire_response.contains("\"granted\":true"));

        let lease_id: serde_json::Value = serde_json::from_str(
            acquire_response
                .split_once('\n')
                .map(|(l, _)| l)
                .unwrap_or(&acquire_response),
        )
        .unwrap();
        let lease_id = lease_id["data"]["leaseId"].as_str().unwrap();

        let release_line = format!(
            r#"{{"type":"release","data":{{"leaseId":"{lease_id}","peakWorkingSetBytes":0,"peakCommitBytes":0,"exitCode":0,"durationMs":100,"stderrHadDiagnostics":true}}}}"#
        );
        let release_response = dispatch(&release_line, &pool).await;
        assert!(release_response.contains("\"acknowledged\":true"));
        assert!(release_response.contains("Success"));
    }
}
