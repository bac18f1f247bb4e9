//! RPC server over a Unix socket.
//!
//! Each connection is a stream of newline-delimited JSON requests. Requests
//! are handled concurrently, so a slow switch does not block a `ping` on the
//! same connection. Every client also receives a notification whenever a
//! filtering operation completes, whoever triggered it.

use crate::filter::{FilterEngine, FilterError};
use crate::queue::{QueueError, SwitchQueue};
use crate::registry::ProjectCatalog;
use anyhow::{Context, Result};
use i3pm_core::{EnvironmentSource, FilterMode, FilterResult, WindowManager};
use i3pm_ipc::{
    RpcCall, RpcErrorCode, RpcRequest, RpcResult, ServerMessage, MAX_IPC_MESSAGE_SIZE,
};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

/// Outgoing messages buffered per connection.
const CLIENT_CHANNEL_CAPACITY: usize = 64;

/// Everything a request handler needs.
pub struct RpcContext<M, E> {
    pub engine: Arc<FilterEngine<M, E>>,
    pub queue: SwitchQueue,
    /// Known projects. `None` accepts any project name.
    pub catalog: Option<Arc<ProjectCatalog>>,
}

impl<M: WindowManager, E: EnvironmentSource> RpcContext<M, E> {
    fn check_project(&self, id: u64, project: &str, allow_empty: bool) -> Result<(), ServerMessage> {
        if project.is_empty() {
            if allow_empty {
                return Ok(());
            }
            return Err(ServerMessage::error(
                id,
                RpcErrorCode::InvalidRequest,
                "project must not be empty",
            ));
        }
        match &self.catalog {
            Some(catalog) if !catalog.contains(project) => Err(ServerMessage::error(
                id,
                RpcErrorCode::UnknownProject,
                format!("Unknown project: {}", project),
            )),
            _ => Ok(()),
        }
    }

    async fn filter(&self, id: u64, mode: FilterMode, project: String) -> ServerMessage {
        // An empty switch target clears the active project.
        if let Err(reply) = self.check_project(id, &project, mode == FilterMode::Switch) {
            return reply;
        }
        match self.queue.submit(mode, project).await {
            Ok(result) => ServerMessage::Response {
                id,
                result: RpcResult::Filter(result),
            },
            Err(e) => queue_error(id, e),
        }
    }
}

fn queue_error(id: u64, error: QueueError) -> ServerMessage {
    match error {
        QueueError::ShuttingDown => {
            ServerMessage::error(id, RpcErrorCode::ShuttingDown, error.to_string())
        }
        QueueError::Filter(e) => filter_error(id, e),
    }
}

fn filter_error(id: u64, error: FilterError) -> ServerMessage {
    match error {
        FilterError::Manager(e) => {
            ServerMessage::error(id, RpcErrorCode::ManagerUnavailable, e.to_string())
        }
    }
}

/// Answer one request.
pub async fn handle_request<M, E>(ctx: &RpcContext<M, E>, request: RpcRequest) -> ServerMessage
where
    M: WindowManager,
    E: EnvironmentSource,
{
    let id = request.id;
    debug!("RPC {} (id {})", request.call.method_name(), id);

    match request.call {
        RpcCall::HideWindows { project } => ctx.filter(id, FilterMode::Hide, project).await,
        RpcCall::RestoreWindows { project } => ctx.filter(id, FilterMode::Restore, project).await,
        RpcCall::SwitchWithFiltering { project } => {
            ctx.filter(id, FilterMode::Switch, project).await
        }
        RpcCall::GetHidden { project } => {
            match ctx.engine.hidden_windows(project.as_deref()).await {
                Ok(listing) => ServerMessage::Response {
                    id,
                    result: RpcResult::Hidden(listing),
                },
                Err(e) => filter_error(id, e),
            }
        }
        RpcCall::GetState { window_id } => match ctx.engine.window_state(window_id).await {
            Ok(Some(state)) => ServerMessage::Response {
                id,
                result: RpcResult::State(state),
            },
            Ok(None) => ServerMessage::error(
                id,
                RpcErrorCode::NotFound,
                format!("Unknown window: {}", window_id),
            ),
            Err(e) => filter_error(id, e),
        },
        RpcCall::GetActiveProject => ServerMessage::Response {
            id,
            result: RpcResult::ActiveProject {
                project: ctx.engine.active_project().await,
            },
        },
        RpcCall::Ping => ServerMessage::Response {
            id,
            result: RpcResult::Pong {
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
        },
    }
}

/// Parse one request line. Invalid input becomes an `invalid_request` error
/// carrying the request id when one can be recovered.
pub fn parse_request(line: &str) -> Result<RpcRequest, ServerMessage> {
    serde_json::from_str::<RpcRequest>(line).map_err(|e| {
        let id = serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_u64()))
            .unwrap_or(0);
        ServerMessage::error(id, RpcErrorCode::InvalidRequest, format!("Invalid request: {}", e))
    })
}

/// Bind the RPC socket, replacing a stale socket file.
pub async fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create socket directory: {}", parent.display()))?;
    }
    if UnixStream::connect(path).await.is_ok() {
        anyhow::bail!("Another i3pm daemon is already listening on {}", path.display());
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to remove stale socket: {}", path.display()))
        }
    }
    UnixListener::bind(path).with_context(|| format!("Failed to bind RPC socket: {}", path.display()))
}

/// Accept clients until the listener fails.
pub async fn run_rpc_server<M, E>(
    listener: UnixListener,
    ctx: Arc<RpcContext<M, E>>,
    results: broadcast::Sender<FilterResult>,
) where
    M: WindowManager,
    E: EnvironmentSource,
{
    loop {
        let stream = match listener.accept().await {
            Ok((stream, _)) => stream,
            Err(e) => {
                error!("Failed to accept RPC client: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                continue;
            }
        };
        debug!("RPC client connected");

        let ctx = Arc::clone(&ctx);
        let notifications = results.subscribe();
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(e) = serve_connection(reader, writer, ctx, notifications).await {
                warn!("RPC client handler error: {}", e);
            }
            debug!("RPC client disconnected");
        });
    }
}

/// Serve one connection until the client hangs up.
pub async fn serve_connection<R, W, M, E>(
    reader: R,
    writer: W,
    ctx: Arc<RpcContext<M, E>>,
    notifications: broadcast::Receiver<FilterResult>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    M: WindowManager,
    E: EnvironmentSource,
{
    let (out_tx, out_rx) = mpsc::channel::<ServerMessage>(CLIENT_CHANNEL_CAPACITY);
    let writer_task = tokio::spawn(write_messages(writer, out_rx, notifications));

    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        let limit = MAX_IPC_MESSAGE_SIZE as u64 + 1;
        let n = (&mut reader).take(limit).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') && n as u64 >= limit {
            let reply = ServerMessage::error(
                0,
                RpcErrorCode::InvalidRequest,
                format!("Request exceeds {} bytes", MAX_IPC_MESSAGE_SIZE),
            );
            let _ = out_tx.send(reply).await;
            break;
        }

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                debug!("Rejected non-UTF-8 RPC line: {}", e);
                let reply = ServerMessage::error(
                    0,
                    RpcErrorCode::InvalidRequest,
                    "Request is not valid UTF-8",
                );
                if out_tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let request = match parse_request(trimmed) {
            Ok(request) => request,
            Err(reply) => {
                debug!("Rejected RPC line: {}", trimmed);
                if out_tx.send(reply).await.is_err() {
                    break;
                }
                continue;
            }
        };

        let ctx = Arc::clone(&ctx);
        let out_tx = out_tx.clone();
        tokio::spawn(async move {
            let reply = handle_request(&ctx, request).await;
            let _ = out_tx.send(reply).await;
        });
    }

    drop(out_tx);
    writer_task.await??;
    Ok(())
}

/// Write replies and notifications until every reply sender is gone.
async fn write_messages<W>(
    mut writer: W,
    mut replies: mpsc::Receiver<ServerMessage>,
    mut notifications: broadcast::Receiver<FilterResult>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut notifying = true;
    loop {
        let message = tokio::select! {
            reply = replies.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
            note = notifications.recv(), if notifying => match note {
                Ok(result) => ServerMessage::notification(&result),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("RPC client missed {} notifications", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    notifying = false;
                    continue;
                }
            },
        };
        writer.write_all(message.to_line().as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_recovers_id() {
        let err = parse_request(r#"{"id":12,"method":"launchRockets"}"#).unwrap_err();
        match err {
            ServerMessage::Error { id, error } => {
                assert_eq!(id, 12);
                assert_eq!(error.code, RpcErrorCode::InvalidRequest);
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_request_garbage() {
        let err = parse_request("{{{{").unwrap_err();
        assert!(matches!(err, ServerMessage::Error { id: 0, .. }));
    }

    #[test]
    fn test_parse_request_ok() {
        let req = parse_request(r#"{"id":1,"method":"ping"}"#).unwrap();
        assert_eq!(req.call, RpcCall::Ping);
    }

    #[test]
    fn test_queue_errors_map_to_codes() {
        let msg = queue_error(3, QueueError::ShuttingDown);
        assert!(matches!(
            msg,
            ServerMessage::Error { id: 3, ref error } if error.code == RpcErrorCode::ShuttingDown
        ));

        let msg = queue_error(
            4,
            QueueError::Filter(FilterError::Manager(i3pm_core::ManagerError::Io(
                "broken pipe".into(),
            ))),
        );
        assert!(matches!(
            msg,
            ServerMessage::Error { id: 4, ref error } if error.code == RpcErrorCode::ManagerUnavailable
        ));
    }
}
