//! Ctrl-C / SIGTERM handling for an in-progress install.

use tokio::signal;
use tracing::warn;

use crate::dispatch::CancelToken;

/// Wait for an interrupt, then stop handing out new work.
///
/// In-flight actions still finish or time out so every host ends with a
/// recorded outcome.
pub(super) async fn cancel_on_signal(cancel: CancelToken) {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            signal.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let source = tokio::select! {
        _ = ctrl_c => "interrupt",
        _ = terminate => "terminate",
    };
    warn!(signal = source, "stopping install; waiting for in-flight actions");
    cancel.cancel();
}
