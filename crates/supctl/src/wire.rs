//! Frame codec for the supervisor control protocol
//!
//! Every message is a length-prefixed frame:
//!
//! ```text
//! [Length: u32 (big-endian)][Payload (postcard serialized)]
//! ```
//!
//! Client-to-supervisor frames carry an [`Envelope`] (sequence number plus
//! request). Supervisor-to-client frames carry a [`Packet`]: either a reply
//! tagged with the originating sequence number, or an unsolicited service
//! event for a handle the client holds.

use crate::error::{Result, SupCtlError};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum allowed frame size; control messages are tiny, anything bigger
/// is a corrupt stream.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

/// An opaque reference to a loaded service.
///
/// Handles are only meaningful within the session that produced them and
/// must be released with a close request when no longer needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceHandle(pub u32);

/// Coarse service state as reported by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceState {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// A state-change notification for a held handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServiceEvent {
    Started,
    StartFailed,
    StartCancelled,
    Stopped,
}

/// Requests the client can issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Load (or find) a service by name, returning a handle to it.
    LoadService { name: String, allow_missing: bool },
    /// Release a handle obtained from `LoadService`.
    CloseHandle { handle: ServiceHandle },
    /// Add or remove a waits-for dependency between two held handles.
    SetWaitsFor {
        from: ServiceHandle,
        to: ServiceHandle,
        remove: bool,
        ignore_missing: bool,
    },
    /// Wake a service so its waiters are re-evaluated.
    WakeService { handle: ServiceHandle },
}

/// Replies to [`Request`]s.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reply {
    /// The service was loaded.
    Loaded {
        handle: ServiceHandle,
        state: ServiceState,
    },
    /// The named service does not exist.
    NoService,
    /// The request completed.
    Done,
    /// The request failed permanently.
    Failed { message: String },
}

/// A client-to-supervisor frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u32,
    pub request: Request,
}

/// A supervisor-to-client frame payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Packet {
    /// Reply to the request issued with sequence number `seq`.
    Reply { seq: u32, reply: Reply },
    /// Unsolicited state change for a held handle.
    Event {
        handle: ServiceHandle,
        event: ServiceEvent,
    },
}

/// Write one length-prefixed frame.
pub async fn write_frame<W, T>(writer: &mut W, payload: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = postcard::to_allocvec(payload)?;
    if bytes.len() > MAX_FRAME_SIZE {
        return Err(SupCtlError::FrameTooLarge {
            size: bytes.len(),
            max: MAX_FRAME_SIZE,
        });
    }
    writer.write_all(&(bytes.len() as u32).to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let length = u32::from_be_bytes(len_bytes) as usize;

    if length > MAX_FRAME_SIZE {
        return Err(SupCtlError::FrameTooLarge {
            size: length,
            max: MAX_FRAME_SIZE,
        });
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;
    Ok(postcard::from_bytes(&payload)?)
}
