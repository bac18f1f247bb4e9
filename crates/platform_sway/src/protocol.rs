//! i3 IPC framing.
//!
//! Every message is `"i3-ipc"`, a payload length and a message type (both
//! u32 in native byte order), followed by a JSON payload. Replies to requests
//! carry the request's type; events have the high bit set.

use crate::SwayError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic string starting every frame.
pub const MAGIC: &[u8; 6] = b"i3-ipc";

/// Size of the fixed frame header.
pub const HEADER_LEN: usize = MAGIC.len() + 8;

/// Upper bound on an accepted payload. Large trees are a few MiB at most.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Bit set on the type of every event frame.
pub const EVENT_FLAG: u32 = 0x8000_0000;

/// Request message types.
pub mod message {
    pub const RUN_COMMAND: u32 = 0;
    pub const GET_WORKSPACES: u32 = 1;
    pub const SUBSCRIBE: u32 = 2;
    pub const GET_TREE: u32 = 4;
}

/// Event kinds a client can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Workspace,
    Output,
    Mode,
    Window,
    BarconfigUpdate,
    Binding,
    Shutdown,
    Tick,
}

impl EventKind {
    /// Name used in SUBSCRIBE payloads.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::Workspace => "workspace",
            EventKind::Output => "output",
            EventKind::Mode => "mode",
            EventKind::Window => "window",
            EventKind::BarconfigUpdate => "barconfig_update",
            EventKind::Binding => "binding",
            EventKind::Shutdown => "shutdown",
            EventKind::Tick => "tick",
        }
    }

    /// Decode the kind from a frame type, if it is an event.
    pub fn from_frame_type(msg_type: u32) -> Option<Self> {
        if msg_type & EVENT_FLAG == 0 {
            return None;
        }
        match msg_type & !EVENT_FLAG {
            0 => Some(EventKind::Workspace),
            1 => Some(EventKind::Output),
            2 => Some(EventKind::Mode),
            3 => Some(EventKind::Window),
            4 => Some(EventKind::BarconfigUpdate),
            5 => Some(EventKind::Binding),
            6 => Some(EventKind::Shutdown),
            7 => Some(EventKind::Tick),
            _ => None,
        }
    }
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Whether this frame is an event rather than a reply.
    pub fn is_event(&self) -> bool {
        self.msg_type & EVENT_FLAG != 0
    }
}

/// Encode a frame.
pub fn encode(msg_type: u32, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.extend_from_slice(MAGIC);
    buf.extend_from_slice(&(payload.len() as u32).to_ne_bytes());
    buf.extend_from_slice(&msg_type.to_ne_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Write one frame.
pub async fn write_frame<W>(writer: &mut W, msg_type: u32, payload: &[u8]) -> Result<(), SwayError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode(msg_type, payload)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, SwayError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).await?;

    if &header[..MAGIC.len()] != MAGIC {
        return Err(SwayError::Protocol("bad magic in frame header".to_string()));
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[6..10]);
    let mut type_bytes = [0u8; 4];
    type_bytes.copy_from_slice(&header[10..14]);
    let len = u32::from_ne_bytes(len_bytes);
    let msg_type = u32::from_ne_bytes(type_bytes);

    if len > MAX_PAYLOAD_LEN {
        return Err(SwayError::Protocol(format!(
            "payload of {} bytes exceeds limit",
            len
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Frame { msg_type, payload })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
            .block_on(future)
    }

    #[test]
    fn test_encode_layout() {
        let buf = encode(message::GET_TREE, b"");
        assert_eq!(buf.len(), HEADER_LEN);
        assert_eq!(&buf[..6], b"i3-ipc");
        assert_eq!(u32::from_ne_bytes([buf[6], buf[7], buf[8], buf[9]]), 0);
        assert_eq!(u32::from_ne_bytes([buf[10], buf[11], buf[12], buf[13]]), 4);
    }

    #[test]
    fn test_read_frame_decodes_payload() {
        let bytes = encode(message::RUN_COMMAND, br#"[{"success":true}]"#);
        let frame = block_on(async { read_frame(&mut bytes.as_slice()).await }).unwrap();
        assert_eq!(frame.msg_type, message::RUN_COMMAND);
        assert_eq!(frame.payload, br#"[{"success":true}]"#.to_vec());
        assert!(!frame.is_event());
    }

    #[test]
    fn test_read_frame_consecutive() {
        let mut bytes = encode(message::GET_WORKSPACES, b"[]");
        bytes.extend(encode(EVENT_FLAG | 7, br#"{"first":false,"payload":"x"}"#));
        let (a, b) = block_on(async {
            let mut reader = bytes.as_slice();
            let a = read_frame(&mut reader).await.unwrap();
            let b = read_frame(&mut reader).await.unwrap();
            (a, b)
        });
        assert_eq!(a.msg_type, message::GET_WORKSPACES);
        assert!(b.is_event());
        assert_eq!(EventKind::from_frame_type(b.msg_type), Some(EventKind::Tick));
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        let mut bytes = encode(message::GET_TREE, b"{}");
        bytes[0] = b'x';
        let result = block_on(async { read_frame(&mut bytes.as_slice()).await });
        assert!(matches!(result, Err(SwayError::Protocol(_))));
    }

    #[test]
    fn test_truncated_frame_is_io_error() {
        let bytes = encode(message::GET_TREE, b"{\"id\":1}");
        let truncated = &bytes[..bytes.len() - 3];
        let result = block_on(async { read_frame(&mut &truncated[..]).await });
        assert!(matches!(result, Err(SwayError::Io(_))));
    }

    #[test]
    fn test_event_kind_decoding() {
        assert_eq!(EventKind::from_frame_type(EVENT_FLAG | 3), Some(EventKind::Window));
        assert_eq!(EventKind::from_frame_type(EVENT_FLAG | 6), Some(EventKind::Shutdown));
        assert_eq!(EventKind::from_frame_type(3), None);
        assert_eq!(EventKind::from_frame_type(EVENT_FLAG | 42), None);
        assert_eq!(EventKind::Window.name(), "window");
    }
}
