//! [`WindowManager`] implementation backed by i3/sway IPC.
//!
//! One persistent command connection is kept for queries and commands; its
//! round trips are serialized by an async mutex so a reply can never be read
//! by the wrong caller. Event subscriptions use their own connection, read by
//! a background task that forwards decoded events into a channel.

use crate::protocol::{self, message, EventKind};
use crate::tree;
use crate::SwayError;
use i3pm_core::{
    CommandOutcome, ManagerCommand, ManagerError, ManagerEvent, WindowManager, WindowSnapshot,
    WorkspaceInfo,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

/// Capacity of the event channel handed out by [`SwayClient::subscribe`].
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Backoff policy for the initial connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first.
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt number `attempt` (0-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Resolve the manager socket from `SWAYSOCK` or `I3SOCK`.
pub fn socket_path_from_env() -> Result<PathBuf, SwayError> {
    ["SWAYSOCK", "I3SOCK"]
        .iter()
        .filter_map(|var| std::env::var_os(var))
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
        .ok_or(SwayError::NoSocket)
}

/// A connected i3/sway IPC client.
pub struct SwayClient {
    path: PathBuf,
    stream: Mutex<UnixStream>,
}

impl std::fmt::Debug for SwayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwayClient").field("path", &self.path).finish()
    }
}

impl SwayClient {
    /// Connect to the manager socket at `path`.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, SwayError> {
        let path = path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&path)
            .await
            .map_err(|source| SwayError::Connect {
                path: path.clone(),
                source,
            })?;
        debug!("Connected to window manager at {}", path.display());
        Ok(Self {
            path,
            stream: Mutex::new(stream),
        })
    }

    /// Connect, retrying with exponential backoff.
    pub async fn connect_with_retry(
        path: impl AsRef<Path>,
        policy: RetryPolicy,
    ) -> Result<Self, SwayError> {
        let path = path.as_ref();
        let attempts = policy.attempts.max(1);
        let mut attempt = 0;
        loop {
            match Self::connect(path).await {
                Ok(client) => return Ok(client),
                Err(e) if attempt + 1 < attempts => {
                    let delay = policy.delay_after(attempt);
                    warn!(
                        "Connection attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt + 1,
                        attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// The socket this client talks to.
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// One request/reply round trip on the command connection.
    async fn request(&self, msg_type: u32, payload: &[u8]) -> Result<Vec<u8>, SwayError> {
        let mut stream = self.stream.lock().await;
        protocol::write_frame(&mut *stream, msg_type, payload).await?;
        loop {
            let frame = protocol::read_frame(&mut *stream).await?;
            if frame.is_event() {
                // Not subscribed on this connection, but never mistake an event for a reply.
                trace!("Dropping stray event frame on command connection");
                continue;
            }
            if frame.msg_type != msg_type {
                return Err(SwayError::Protocol(format!(
                    "expected reply type {}, got {}",
                    msg_type, frame.msg_type
                )));
            }
            return Ok(frame.payload);
        }
    }

    /// Subscribe to `kinds` on a dedicated connection.
    ///
    /// The returned receiver yields decoded events in emission order and
    /// closes when the manager closes the connection.
    pub async fn subscribe(&self, kinds: &[EventKind]) -> Result<mpsc::Receiver<ManagerEvent>, SwayError> {
        let mut stream = UnixStream::connect(&self.path)
            .await
            .map_err(|source| SwayError::Connect {
                path: self.path.clone(),
                source,
            })?;

        let names: Vec<&str> = kinds.iter().map(|k| k.name()).collect();
        let payload = serde_json::to_vec(&names)?;
        protocol::write_frame(&mut stream, message::SUBSCRIBE, &payload).await?;

        let reply = protocol::read_frame(&mut stream).await?;
        let ack: serde_json::Value = serde_json::from_slice(&reply.payload)?;
        if ack.get("success").and_then(|v| v.as_bool()) != Some(true) {
            return Err(SwayError::Protocol(format!("subscribe rejected: {}", ack)));
        }
        info!("Subscribed to window manager events: {}", names.join(", "));

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        tokio::spawn(async move {
            if let Err(e) = forward_events(stream, tx).await {
                warn!("Event stream ended: {}", e);
            }
        });
        Ok(rx)
    }
}

/// Read event frames until the connection or the receiver goes away.
async fn forward_events(mut stream: UnixStream, tx: mpsc::Sender<ManagerEvent>) -> Result<(), SwayError> {
    loop {
        let frame = protocol::read_frame(&mut stream).await?;
        let Some(kind) = EventKind::from_frame_type(frame.msg_type) else {
            trace!("Ignoring non-event frame type {}", frame.msg_type);
            continue;
        };
        match tree::parse_event(kind, &frame.payload) {
            Ok(Some(event)) => {
                if tx.send(event).await.is_err() {
                    debug!("Event receiver dropped, closing subscription");
                    return Ok(());
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to decode {} event: {}", kind.name(), e),
        }
    }
}

impl WindowManager for SwayClient {
    async fn query_tree(&self) -> Result<Vec<WindowSnapshot>, ManagerError> {
        let payload = self.request(message::GET_TREE, b"").await?;
        Ok(tree::parse_tree(&payload)?)
    }

    async fn query_workspaces(&self) -> Result<Vec<WorkspaceInfo>, ManagerError> {
        let payload = self.request(message::GET_WORKSPACES, b"").await?;
        Ok(tree::parse_workspaces(&payload)?)
    }

    async fn run_commands(&self, batch: &[ManagerCommand]) -> Result<Vec<CommandOutcome>, ManagerError> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let command = tree::render_batch(batch);
        debug!("RUN_COMMAND ({} sub-commands): {}", batch.len(), command);
        let payload = self.request(message::RUN_COMMAND, command.as_bytes()).await?;
        Ok(tree::parse_command_reply(&payload, batch.len())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::EVENT_FLAG;
    use i3pm_core::{CommandOp, WindowChange};
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::net::UnixListener;

    static TEST_ID: AtomicU32 = AtomicU32::new(0);

    fn tmp_socket_path() -> PathBuf {
        let id = TEST_ID.fetch_add(1, Ordering::SeqCst);
        std::env::temp_dir().join(format!("i3pm-sway-test-{}-{}.sock", std::process::id(), id))
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    /// Answer each request on one connection with the canned reply for its type.
    async fn serve_one(listener: UnixListener, replies: Vec<(u32, &'static str)>) -> Vec<(u32, String)> {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        for (msg_type, reply) in replies {
            let frame = protocol::read_frame(&mut stream).await.unwrap();
            assert_eq!(frame.msg_type, msg_type);
            seen.push((frame.msg_type, String::from_utf8(frame.payload).unwrap()));
            protocol::write_frame(&mut stream, msg_type, reply.as_bytes()).await.unwrap();
        }
        seen
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RetryPolicy {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_after(0), Duration::from_millis(100));
        assert_eq!(policy.delay_after(1), Duration::from_millis(200));
        assert_eq!(policy.delay_after(2), Duration::from_millis(350));
        assert_eq!(policy.delay_after(40), Duration::from_millis(350));
    }

    #[test]
    fn test_connect_with_retry_exhausts() {
        let path = tmp_socket_path();
        let policy = RetryPolicy {
            attempts: 2,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let result = block_on(SwayClient::connect_with_retry(&path, policy));
        assert!(matches!(result, Err(SwayError::Connect { .. })));
    }

    #[test]
    fn test_queries_and_batched_commands() {
        let path = tmp_socket_path();
        let _ = std::fs::remove_file(&path);

        let seen = block_on(async {
            let listener = UnixListener::bind(&path).unwrap();
            let server = tokio::spawn(serve_one(
                listener,
                vec![
                    (message::GET_WORKSPACES, r#"[{"num":3,"name":"3","output":"eDP-1","visible":true,"focused":true}]"#),
                    (message::RUN_COMMAND, r#"[{"success":true},{"success":false,"error":"nope"}]"#),
                ],
            ));

            let client = SwayClient::connect(&path).await.unwrap();
            let workspaces = client.query_workspaces().await.unwrap();
            assert_eq!(workspaces.len(), 1);
            assert_eq!(workspaces[0].num, 3);

            let outcomes = client
                .run_commands(&[
                    ManagerCommand::new(1, CommandOp::MoveToScratchpad),
                    ManagerCommand::new(2, CommandOp::MoveToScratchpad),
                ])
                .await
                .unwrap();
            assert!(outcomes[0].success);
            assert_eq!(outcomes[1].error.as_deref(), Some("nope"));

            // Empty batches never hit the socket.
            assert!(client.run_commands(&[]).await.unwrap().is_empty());

            server.await.unwrap()
        });

        assert_eq!(seen[1].1, "[con_id=1] move scratchpad; [con_id=2] move scratchpad");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_subscribe_forwards_events() {
        let path = tmp_socket_path();
        let _ = std::fs::remove_file(&path);

        block_on(async {
            let listener = UnixListener::bind(&path).unwrap();
            let server = tokio::spawn(async move {
                // Command connection, unused.
                let (_cmd, _) = listener.accept().await.unwrap();
                let (mut events, _) = listener.accept().await.unwrap();
                let frame = protocol::read_frame(&mut events).await.unwrap();
                assert_eq!(frame.msg_type, message::SUBSCRIBE);
                let kinds: Vec<String> = serde_json::from_slice(&frame.payload).unwrap();
                assert_eq!(kinds, vec!["window", "tick"]);
                protocol::write_frame(&mut events, message::SUBSCRIBE, br#"{"success":true}"#)
                    .await
                    .unwrap();
                protocol::write_frame(
                    &mut events,
                    EVENT_FLAG | 3,
                    br#"{"change":"close","container":{"id":42,"type":"con","app_id":"foot","nodes":[],"floating_nodes":[]}}"#,
                )
                .await
                .unwrap();
                protocol::write_frame(
                    &mut events,
                    EVENT_FLAG | 7,
                    br#"{"first":false,"payload":"i3pm:switch:nixos"}"#,
                )
                .await
                .unwrap();
                // Closing the connection ends the subscription.
                drop(events);
            });

            let client = SwayClient::connect(&path).await.unwrap();
            let mut rx = client
                .subscribe(&[EventKind::Window, EventKind::Tick])
                .await
                .unwrap();

            match rx.recv().await {
                Some(ManagerEvent::Window { change, window }) => {
                    assert_eq!(change, WindowChange::Close);
                    assert_eq!(window.id, 42);
                }
                other => panic!("unexpected event: {:?}", other),
            }
            assert_eq!(
                rx.recv().await,
                Some(ManagerEvent::Tick {
                    payload: "i3pm:switch:nixos".into(),
                    first: false
                })
            );
            server.await.unwrap();
            assert_eq!(rx.recv().await, None);
        });

        let _ = std::fs::remove_file(&path);
    }
}
