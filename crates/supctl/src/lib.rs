//! Asynchronous control client for the init supervisor
//!
//! The supervisor exposes a control socket over which services can be
//! loaded, woken, and linked by dependencies. This crate wraps that socket
//! in a small async client: requests are sequenced over one stream, replies
//! are matched back to callers, and unsolicited service events are routed
//! to whoever registered interest in the affected handle.
//!
//! The I/O runs in a task on the caller's runtime; every method is
//! non-blocking and resolves when the supervisor has answered. A dead
//! session surfaces as [`SupCtlError::SessionClosed`] on every in-flight
//! and subsequent call; callers are expected to treat that as fatal.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo() -> Result<(), supctl::SupCtlError> {
//! use supctl::Session;
//!
//! let session = Session::connect("/run/dinitctl".as_ref()).await?;
//! if let Some(loaded) = session.load_service("system", true).await? {
//!     session.wake_service(loaded.handle).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod session;
pub mod wire;

/// Default system control socket of the supervisor.
pub const SYSTEM_SOCKET: &str = "/run/dinitctl";

pub use error::{Result, SupCtlError};
pub use session::{LoadedService, Session};
pub use wire::{ServiceEvent, ServiceHandle, ServiceState};
