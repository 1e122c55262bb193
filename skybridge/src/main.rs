#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]

#[macro_use]
extern crate tracing;

use anyhow::Context as _;
use skybridge::config::ConfHandle;
use skybridge::service::{BridgeService, SERVICE_NAME};

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args();
    let executable = args.next().context("executable name is missing from the environment")?;

    match args.next().as_deref() {
        None => run(),
        Some("--help" | "-h") => {
            println!(
                r#"{SERVICE_NAME}

Usage:
    "{executable}"

Configuration is environment-driven; see the SKYBRIDGE_* variables in the README.
"#
            );
            Ok(())
        }
        Some(unexpected) => anyhow::bail!("unexpected argument: {unexpected}"),
    }
}

fn run() -> anyhow::Result<()> {
    let conf_handle = ConfHandle::init().context("unable to initialize configuration")?;

    let mut service = BridgeService::load(conf_handle).context("service loading failed")?;

    service
        .start()
        .inspect_err(|error| error!(error = format!("{error:#}"), "Failed to start"))?;

    // Waiting for some stop signal (CTRL-C…).
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
        .context("failed to build the async runtime")?;
    rt.block_on(build_signals_fut())?;

    service.stop();

    Ok(())
}

#[cfg(unix)]
async fn build_signals_fut() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate_signal = signal(SignalKind::terminate()).context("failed to create terminate signal stream")?;
    let mut quit_signal = signal(SignalKind::quit()).context("failed to create quit signal stream")?;
    let mut interrupt_signal =
        signal(SignalKind::interrupt()).context("failed to create interrupt signal stream")?;

    futures::future::select_all(vec![
        Box::pin(terminate_signal.recv()),
        Box::pin(quit_signal.recv()),
        Box::pin(interrupt_signal.recv()),
    ])
    .await;

    Ok(())
}

#[cfg(not(unix))]
async fn build_signals_fut() -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await.context("CTRL_C signal failed")
}
