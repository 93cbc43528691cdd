//! devmond: device availability broker
//!
//! Long-running daemon that tracks kernel device availability, serves
//! queries and subscriptions over a Unix control socket, and mirrors
//! tagged devices into the init supervisor as `device@...` services.

use anyhow::{Context, Result};
use clap::Parser;
use common::{setup_logging, BrokerConfig};
use nix::sys::stat::{umask, Mode};
use server::broker::{bind_listener, signal_readiness, Broker};
use server::devsrc::DeviceSource;
use std::os::unix::io::RawFd;
use std::path::Path;
use supctl::Session;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "devmond")]
#[command(author, version, about = "Device availability broker")]
#[command(long_about = "
Watches the kernel device model and serves device availability over a
Unix control socket. Tagged devices are additionally loaded into the init
supervisor as synthetic device services with their waits-for dependencies
kept in sync.

The broker is configured through the environment: DEVMON_SOCKET,
DINIT_SYSTEM_SERVICE, DINIT_CS_FD, DINIT_DEVMON_DUMMY_MODE and
DINIT_CONTAINER; see the service bundle documentation.
")]
struct Args {
    /// Inherited descriptor to report readiness on once the control
    /// socket is listening
    readiness_fd: Option<RawFd>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    setup_logging(&args.log_level).context("failed to setup logging")?;

    // nothing the broker creates may be group or world accessible
    umask(Mode::from_bits_truncate(0o077));

    let config = BrokerConfig::from_env().context("bad environment")?;
    info!("devmond v{}", env!("CARGO_PKG_VERSION"));
    if config.dummy_mode {
        info!("dummy mode: running without a device source");
    }

    let session = match config.control_fd {
        Some(fd) => unsafe { Session::from_raw_fd(fd) }
            .context("DINIT_CS_FD is not a usable session descriptor")?,
        None => Session::connect(Path::new(supctl::SYSTEM_SOCKET))
            .await
            .context("failed to connect to the supervisor")?,
    };

    info!("locate service '{}'", config.system_service);
    let root = session
        .load_service(&config.system_service, true)
        .await
        .context("failed to load the root service")?
        .with_context(|| format!("root service '{}' does not exist", config.system_service))?
        .handle;

    let listener = bind_listener(&config.socket_path)?;
    if let Some(fd) = args.readiness_fd {
        signal_readiness(fd)?;
    }

    let source = DeviceSource::new(config.dummy_mode).context("failed to set up device source")?;
    let mut broker = Broker::new(listener, source, session, root);
    broker.seed()?;
    broker.run().await?;

    info!("exit");
    Ok(())
}
