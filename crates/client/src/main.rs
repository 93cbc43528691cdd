//! devmon-client: device readiness client
//!
//! Spawned once per device dependency. Connects to the broker, subscribes
//! to one device, and signals readiness on an inherited descriptor once
//! the device is available. It stays running for as long as the device
//! does; when the device disappears again the client exits so the
//! supervisor can tear down dependent services.

mod specifier;

use anyhow::{bail, Context, Result};
use clap::Parser;
use common::{broker_socket_path, setup_logging};
use protocol::{read_status, write_query, ProtocolError};
use std::fs::File;
use std::io::{ErrorKind, Write};
use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// How long to wait between connection attempts while the broker is not
/// up yet.
const CONNECT_RETRY_DELAY: Duration = Duration::from_millis(250);

#[derive(Parser, Debug)]
#[command(name = "devmon-client")]
#[command(author, version, about = "Wait for a device via the availability broker")]
#[command(long_about = "
Blocks until the given device becomes available, then reports readiness
on the inherited descriptor. Exits once the device disappears again.

SPECIFIERS:
    LABEL=x, UUID=x, PARTLABEL=x, PARTUUID=x, ID=x
                        disk alias (resolved via /dev/disk/by-*)
    /dev/...            device node path
    /sys/...            kernel syspath
    netif:<name>        network interface
    mac:<addr>          MAC address (lowercase colon form)
    usb:<vend>:<prod>   USB identity (lowercase hex)
")]
struct Args {
    /// Device dependency specifier
    specifier: String,

    /// Inherited descriptor to report readiness on
    readiness_fd: RawFd,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level).context("failed to setup logging")?;

    let (kind, value) = specifier::parse(&args.specifier)?;

    if args.readiness_fd <= 0 {
        bail!("invalid readiness descriptor {}", args.readiness_fd);
    }
    let readiness = unsafe { File::from_raw_fd(args.readiness_fd) };
    readiness
        .metadata()
        .with_context(|| format!("readiness descriptor {} is not usable", args.readiness_fd))?;

    let socket_path = broker_socket_path();
    let mut stream = connect_with_retry(&socket_path)
        .with_context(|| format!("failed to connect to '{}'", socket_path.display()))?;
    info!("connected to broker");

    write_query(&mut stream, kind, value.as_bytes()).context("handshake failed")?;
    info!("watching '{}'", value);

    let mut readiness = Some(readiness);
    loop {
        let status = match read_status(&mut stream) {
            Ok(status) => status,
            Err(ProtocolError::Closed) => bail!("broker closed the connection"),
            Err(e) => return Err(e).context("status read failed"),
        };
        if status != 0 && readiness.is_some() {
            info!("device available, signalling readiness");
            let mut pipe = readiness.take().expect("unsignalled");
            pipe.write_all(b"READY=1\n")
                .context("failed to signal readiness")?;
            // drop closes the descriptor; the supervisor sees readiness
            // exactly once
        } else if status == 0 && readiness.is_none() {
            info!("device disappeared, exiting");
            return Ok(());
        }
    }
}

/// Connect to the broker, retrying for as long as it does not exist yet:
/// device dependencies can be spawned before the broker itself is up.
fn connect_with_retry(path: &Path) -> std::io::Result<UnixStream> {
    loop {
        match UnixStream::connect(path) {
            Ok(stream) => return Ok(stream),
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::NotADirectory
                ) =>
            {
                std::thread::sleep(CONNECT_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}
