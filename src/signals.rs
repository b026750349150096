//! Two-stage shutdown on SIGINT/SIGTERM.
//!
//! The first signal cancels the returned token so workers can drain; a second
//! one exits the process immediately with status 1.

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{Error, Result};

/// Install the signal handlers and return the shutdown token.
///
/// Must be called from within a Tokio runtime.
pub fn shutdown_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let signals = termination_signals()?;
    tokio::spawn(escalate(signals, token.clone(), || std::process::exit(1)));
    Ok(token)
}

/// Cancel `token` on the first item of `signals`, call `force` on the second.
pub async fn escalate<S, F>(signals: S, token: CancellationToken, force: F)
where
    S: Stream<Item = ()>,
    F: FnOnce(),
{
    let mut signals = std::pin::pin!(signals);
    if signals.next().await.is_none() {
        return;
    }
    info!("shutdown signal received, finishing in-flight work (repeat to force exit)");
    token.cancel();

    if signals.next().await.is_some() {
        warn!("second shutdown signal received, exiting immediately");
        force();
    }
}

#[cfg(unix)]
fn termination_signals() -> Result<impl Stream<Item = ()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let terminate = signal(SignalKind::terminate())
        .map_err(|e| Error::internal(format!("failed to install SIGTERM handler: {e}")))?;
    Ok(futures::stream::unfold(terminate, |mut terminate| async move {
        tokio::select! {
            result = tokio::signal::ctrl_c() => result.ok()?,
            received = terminate.recv() => received?,
        }
        Some(((), terminate))
    }))
}

#[cfg(not(unix))]
fn termination_signals() -> Result<impl Stream<Item = ()>> {
    Ok(futures::stream::unfold((), |()| async move {
        tokio::signal::ctrl_c().await.ok()?;
        Some(((), ()))
    }))
}
