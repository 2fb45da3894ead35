use std::future::pending;

use tokio::{select, signal};

/// Resolves on ctrl-c or SIGTERM. A handler that cannot be installed is
/// logged and never fires, so the other one still stops the loop.
pub async fn shutdown_signal() {
  let ctrl_c = async {
    if let Err(error) = signal::ctrl_c().await {
      tracing::error!("failed to listen for ctrl-c: {}", error);
      pending::<()>().await;
    }
  };

  #[cfg(unix)]
  let terminate = async {
    match signal::unix::signal(signal::unix::SignalKind::terminate()) {
      Ok(mut stream) => {
        stream.recv().await;
      }
      Err(error) => {
        tracing::error!("failed to install the SIGTERM handler: {}", error);
        pending::<()>().await;
      }
    }
  };

  #[cfg(not(unix))]
  let terminate = pending::<()>();

  select! {
    () = ctrl_c => {},
    () = terminate => {},
  }

  tracing::info!("shutdown signal received, stopping the refresh loop");
}
