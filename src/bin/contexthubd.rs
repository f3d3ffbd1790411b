//! Hub runtime daemon.
//!
//! Brings up the runtime with the platform seams this build provides,
//! connects the host socket when one is configured, and runs the event
//! loop on the main thread until the process is killed.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::Parser;
use tracing::{error, info, warn};

use contexthub::core::{Platform, RuntimeContext};
use contexthub::host::{
    ClientCallbacks, HostCommsManager, LinkSlot, ReconnectPolicy, SocketClient,
};
use contexthub::{Config, PlatformWifi};

#[derive(Parser, Debug)]
#[command(name = "contexthubd", about = "Context hub runtime daemon")]
struct Args {
    /// Path to a JSON config file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host daemon socket path (overrides the config).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

/// Placeholder wifi seam for builds without a wifi HAL: every scan-monitor
/// change is rejected so nanoapps get an honest failure.
struct UnsupportedWifi;

impl PlatformWifi for UnsupportedWifi {
    fn configure_scan_monitor(&mut self, _enable: bool) -> bool {
        false
    }
}

struct HostRx {
    comms: Arc<Mutex<HostCommsManager>>,
}

impl ClientCallbacks for HostRx {
    fn on_message(&mut self, payload: &[u8]) {
        let result = self
            .comms
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .handle_host_message(payload);
        if let Err(err) = result {
            warn!(%err, "host message rejected");
        }
    }

    fn on_connected(&mut self) {
        info!("host socket connected");
        let _ = self
            .comms
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .send_time_sync_request();
    }

    fn on_connection_aborted(&mut self) {
        error!("host socket reconnection abandoned");
    }
}

fn main() {
    let args = Args::parse();
    contexthub::telemetry::init(args.verbose);

    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, "invalid config");
                std::process::exit(2);
            }
        },
        None => Config::default(),
    };
    if let Some(socket) = args.socket {
        config.host.socket_path = socket;
    }

    let link = LinkSlot::new();
    let (ctx, mut event_loop) = RuntimeContext::init(
        &config,
        Platform {
            wifi: Box::new(UnsupportedWifi),
            sensors: Vec::new(),
            host_link: Box::new(link.clone()),
            system_timer: None,
            clock: None,
        },
    );

    let policy = ReconnectPolicy {
        initial_delay: Duration::from_millis(config.host.reconnect_initial_ms),
        max_delay: Duration::from_millis(config.host.reconnect_max_ms),
        max_attempts: config.host.reconnect_max_attempts,
    };
    let client = SocketClient::connect(
        &config.host.socket_path,
        Box::new(HostRx {
            comms: Arc::clone(ctx.host_comms()),
        }),
        policy,
        config.limits.max_frame_bytes,
    );
    let _client = match client {
        Ok(client) => {
            link.bind(Box::new(client.frame_sender()));
            Some(client)
        }
        Err(err) => {
            warn!(
                %err,
                path = %config.host.socket_path.display(),
                "host socket unavailable; running without host link"
            );
            None
        }
    };

    // Embedded nanoapps would be registered here through ctx.loop_handle()
    // before (or from another thread after) the loop starts.
    info!("runtime initialised");
    event_loop.run();
}
