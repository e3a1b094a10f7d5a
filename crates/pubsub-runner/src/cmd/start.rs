use redis_pubsub_input::{DecoderRegistry, Error, RedisPubSubInput, StopHandle, exchange};
use tracing::{error, info, warn};

use super::InputArgs;
use crate::config::RunnerConfig;
use crate::error::RunnerResult;
use crate::host;

/// Resolve config, start the input, and print injected messages until the
/// input stops.
pub async fn run_start(args: InputArgs) -> RunnerResult<()> {
    let RunnerConfig { input, pool_size } = args.resolve().await?;
    info!(
        address = %input.address,
        channel = %input.channel,
        decoder = %input.decoder,
        pool_size,
        "starting redis pub/sub input"
    );

    let registry = DecoderRegistry::with_builtins();
    let (mut buffers, pipeline) = exchange(pool_size);
    let mut input = RedisPubSubInput::init(input, &registry).await?;

    let signals = tokio::spawn(stop_on_signal(input.stop_handle()));
    let host = tokio::spawn(host::drain(pipeline, tokio::io::stdout()));

    let reason = input.run(&mut buffers).await;
    signals.abort();

    // Closing the input side ends the host once it has written the backlog.
    drop(buffers);
    match host.await {
        Ok(Ok(written)) => info!(written, "pipeline drained"),
        Ok(Err(e)) => warn!(error = %e, "pipeline output failed"),
        Err(e) => warn!(error = %e, "pipeline task failed"),
    }

    match reason {
        Error::Closed => {
            info!("input stopped");
            Ok(())
        }
        other => {
            error!(error = %other, "input terminated");
            Err(other.into())
        }
    }
}

/// Wait for SIGTERM or SIGINT, then ask the input to stop.
async fn stop_on_signal(stop: StopHandle) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => {
            info!("received SIGTERM, stopping");
        }
        _ = recv_signal(&mut sigint) => {
            info!("received SIGINT, stopping");
        }
    }
    stop.stop();
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
