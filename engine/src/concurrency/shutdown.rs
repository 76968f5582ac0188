//! Broadcast of the shutdown request to every scheduler task.

use tokio::sync::watch;

/// Transmitter side of the shutdown channel.
pub type ShutdownTx = watch::Sender<bool>;

/// Receiver side of the shutdown channel. The value turns `true` once shutdown is requested.
pub type ShutdownRx = watch::Receiver<bool>;

/// Creates a shutdown channel in the "running" state.
pub fn create_shutdown_channel() -> (ShutdownTx, ShutdownRx) {
    watch::channel(false)
}

/// Returns `true` if shutdown was already requested.
pub fn is_shutdown_requested(shutdown_rx: &ShutdownRx) -> bool {
    *shutdown_rx.borrow()
}

/// Waits until shutdown is requested or every transmitter is dropped.
pub async fn wait_for_shutdown(shutdown_rx: &mut ShutdownRx) {
    // A closed channel means nobody can request shutdown anymore; treat it as a request.
    let _ = shutdown_rx.wait_for(|requested| *requested).await;
}
