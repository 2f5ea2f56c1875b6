//! Spawns the helper process, drives it through a representative session
//! (handshake, buffer/sample-rate setup, a parameter round trip, one
//! process call, clean shutdown) and prints what it observed. Useful as a
//! smoke test and as a worked example of the client-side API.

use anyhow::{Context, Result};
use rplugin_client::{find_helper_binary, ClientEndpoint, HelperLifecycle};
use rplugin_ipc::TransportPaths;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rplugin_demo_roundtrip=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn main() -> Result<()> {
    init_logging();

    let helper_path =
        find_helper_binary("rplugin-helper").context("could not locate the helper binary")?;
    let paths = TransportPaths::generate();

    let lifecycle = HelperLifecycle::spawn(&helper_path, "reference-gain", paths, false)
        .context("helper failed to start")?;
    let mut endpoint = ClientEndpoint::new(lifecycle);

    let name = endpoint.get_name().context("get_name failed")?;
    let maker = endpoint.get_maker().context("get_maker failed")?;
    println!("connected to \"{name}\" by \"{maker}\"");

    let input_count = endpoint.input_count().context("input_count failed")?;
    let output_count = endpoint.output_count().context("output_count failed")?;
    endpoint.set_sample_rate(48_000).context("set_sample_rate failed")?;
    let buffer_size = 256;
    endpoint.set_buffer_size(buffer_size).context("set_buffer_size failed")?;

    endpoint.set_parameter(0, 0.5).context("set_parameter failed")?;
    let readback = endpoint.parameter(0).context("parameter failed")?;
    println!("parameter 0 set to 0.5, read back {readback}");

    let inputs: Vec<Vec<f32>> = (0..input_count).map(|_| vec![0.25_f32; buffer_size]).collect();
    let input_refs: Vec<&[f32]> = inputs.iter().map(Vec::as_slice).collect();
    let mut outputs: Vec<Vec<f32>> = (0..output_count).map(|_| vec![0.0_f32; buffer_size]).collect();
    let mut output_refs: Vec<&mut [f32]> = outputs.iter_mut().map(Vec::as_mut_slice).collect();
    endpoint.process(&input_refs, &mut output_refs).context("process failed")?;
    println!("one process cycle completed, first output sample {}", outputs[0][0]);

    endpoint.terminate().context("terminate failed")?;
    println!("helper terminated cleanly");

    Ok(())
}
