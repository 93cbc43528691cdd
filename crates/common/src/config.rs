//! Environment-driven broker configuration
//!
//! The broker is configured entirely through its environment; there are no
//! configuration files. The knobs and their defaults:
//!
//! - `DEVMON_SOCKET` -- control socket path (default `/run/devmon.sock`)
//! - `DINIT_SYSTEM_SERVICE` -- root service device services hang off
//!   (default `system`)
//! - `DINIT_CS_FD` -- numeric descriptor of an already-open supervisor
//!   session; when unset the broker connects to the system socket
//! - `DINIT_DEVMON_DUMMY_MODE` -- force dummy mode when set
//! - `DINIT_CONTAINER=1`, or the sentinel file `/run/dinit/container` --
//!   container environment, which also forces dummy mode

use crate::error::{Error, Result};
use std::env;
use std::ffi::OsString;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// Default control socket path.
pub const DEFAULT_SOCKET_PATH: &str = "/run/devmon.sock";

/// Default name of the root service.
pub const DEFAULT_SYSTEM_SERVICE: &str = "system";

/// Sentinel file marking a container environment.
pub const CONTAINER_SENTINEL: &str = "/run/dinit/container";

const SOCKET_ENV: &str = "DEVMON_SOCKET";
const SYSTEM_SERVICE_ENV: &str = "DINIT_SYSTEM_SERVICE";
const CONTROL_FD_ENV: &str = "DINIT_CS_FD";
const DUMMY_MODE_ENV: &str = "DINIT_DEVMON_DUMMY_MODE";
const CONTAINER_ENV: &str = "DINIT_CONTAINER";

/// Resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Control socket path the broker listens on.
    pub socket_path: PathBuf,
    /// Root service that device services are wired under.
    pub system_service: String,
    /// Inherited supervisor session descriptor, if any.
    pub control_fd: Option<RawFd>,
    /// Run without a kernel device source.
    pub dummy_mode: bool,
}

impl BrokerConfig {
    /// Read the configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var_os(name), Path::new(CONTAINER_SENTINEL).exists())
    }

    /// Build the configuration from an arbitrary variable lookup.
    ///
    /// Split out so tests can inject an environment without mutating the
    /// process-global one.
    pub fn from_lookup<F>(lookup: F, container_sentinel: bool) -> Result<Self>
    where
        F: Fn(&str) -> Option<OsString>,
    {
        let socket_path = lookup(SOCKET_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));

        let system_service = match lookup(SYSTEM_SERVICE_ENV) {
            Some(v) if !v.is_empty() => v
                .into_string()
                .map_err(|_| Error::Config("DINIT_SYSTEM_SERVICE is not valid UTF-8".into()))?,
            _ => DEFAULT_SYSTEM_SERVICE.to_string(),
        };

        let control_fd = match lookup(CONTROL_FD_ENV) {
            None => None,
            Some(v) => {
                let s = v.into_string().map_err(|_| {
                    Error::Config("DINIT_CS_FD is not valid UTF-8".into())
                })?;
                let fd: RawFd = s.parse().map_err(|_| {
                    Error::Config(format!("DINIT_CS_FD is not a file descriptor: '{}'", s))
                })?;
                if fd <= 0 {
                    return Err(Error::Config(format!(
                        "DINIT_CS_FD is not a file descriptor: '{}'",
                        s
                    )));
                }
                Some(fd)
            }
        };

        let container =
            container_sentinel || lookup(CONTAINER_ENV).is_some_and(|v| v == OsString::from("1"));
        let dummy_mode = container || lookup(DUMMY_MODE_ENV).is_some();

        Ok(Self {
            socket_path,
            system_service,
            control_fd,
            dummy_mode,
        })
    }
}

/// Control socket path as seen by clients (env override or default).
pub fn broker_socket_path() -> PathBuf {
    env::var_os(SOCKET_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH))
}
