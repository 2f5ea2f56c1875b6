//! Helper process entry point. Receives a single positional argument of the
//! form `<pluginId>,<transportSuffixes>`, reconstructs the four transport
//! files the client already created, performs the readiness handshake over
//! the response pipe, then runs the control and ring dispatch loops on
//! separate threads so a blocking control-channel read never stalls
//! realtime audio dispatch.

mod reference_plugin;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rplugin_ipc::{parse_helper_arg, ControlPipe, ServerTransport, TransportPaths};
use rplugin_server::{ControlDispatcher, Heartbeat, RingDispatcher, ServerEndpoint, RING_DISPATCH_SCHED_PRIORITY};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rplugin_helper=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    init_logging();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let gui = if args.first().map(String::as_str) == Some("-g") {
        args.remove(0);
        true
    } else {
        false
    };
    let raw_arg = args
        .first()
        .context("expected a single \"<pluginId>,<transportSuffixes>\" argument")?;

    let (plugin_id, suffixes) =
        parse_helper_arg(raw_arg).context("failed to parse helper argument")?;
    info!(%plugin_id, gui, "helper starting");

    let paths = TransportPaths::reconstruct(&suffixes).context("failed to reconstruct transport paths")?;
    run(&paths).context("helper run loop exited with an error")
}

fn run(paths: &TransportPaths) -> Result<()> {
    let control_shm_path = std::path::Path::new(&paths.control_shm_name);
    let transport =
        ServerTransport::open(control_shm_path).context("failed to open control shared memory")?;
    let audio_shm_path = PathBuf::from(&paths.audio_shm_name);

    let mut response = ControlPipe::open_writer(&paths.response_pipe)
        .context("failed to open response pipe for writing")?;

    let plugin: Box<dyn rplugin_plugin::HostedPlugin> =
        Box::new(reference_plugin::GainPlugin::default());

    let request = match ControlPipe::open_reader(&paths.request_pipe) {
        Ok(request) => request,
        Err(e) => {
            error!(error = %e, "failed to open request pipe");
            let _ = response.write_bool(false);
            return Err(e.into());
        }
    };

    response
        .write_bool(true)
        .context("failed to send readiness response")?;

    let heartbeat = Heartbeat::new();
    let watchdog_heartbeat = heartbeat.clone();
    let _watchdog = rplugin_server::watchdog::spawn(watchdog_heartbeat, || {
        error!("watchdog tripped, exiting helper process");
        std::process::exit(1);
    });

    let endpoint = ServerEndpoint::new(transport, request, response, plugin, heartbeat, audio_shm_path);
    let (control, ring) = endpoint.split();

    let ring_thread = std::thread::Builder::new()
        .name("rplugin-ring-dispatch".to_string())
        .spawn(move || run_ring_dispatch(ring))
        .context("failed to spawn ring-dispatch thread")?;

    run_control_dispatch(control);

    ring_thread
        .join()
        .map_err(|_| anyhow::anyhow!("ring-dispatch thread panicked"))?;
    Ok(())
}

/// Runs on the main thread at default OS priority: a long or arbitrary
/// control-pipe block here must never be able to stall the ring thread
/// below, which is why the two run on separate threads at all.
fn run_control_dispatch(mut control: ControlDispatcher) {
    loop {
        match control.dispatch_control() {
            Ok(()) => {}
            Err(e) if e.is_fatal() => {
                info!("control channel closed, shutting down");
                return;
            }
            Err(e) => error!(error = %e, "error servicing control channel"),
        }
    }
}

/// Runs on its own `SCHED_FIFO` thread, one priority tier below the
/// watchdog, polling the ring non-blockingly so an idle host isn't mistaken
/// for a dead one.
fn run_ring_dispatch(mut ring: RingDispatcher) {
    rplugin_server::raise_to_realtime_priority(RING_DISPATCH_SCHED_PRIORITY);
    loop {
        match ring.try_dispatch_ring() {
            Ok(true) => continue,
            Ok(false) => std::thread::sleep(Duration::from_millis(1)),
            Err(e) if e.is_fatal() => {
                info!("ring channel closed, shutting down");
                return;
            }
            Err(e) => error!(error = %e, "error servicing ring channel"),
        }
    }
}
