use tracing::info;

/// Resolves once the operator asks the process to stop. Listening starts
/// before the caller awaits, so a signal delivered mid-startup is not lost.
#[cfg(unix)]
pub async fn wait_for_shutdown() {
	use tokio::signal::unix::{SignalKind, signal};

	let mut interrupt =
		signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
	let mut terminate =
		signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
	let name = tokio::select! {
		_ = interrupt.recv() => "SIGINT",
		_ = terminate.recv() => "SIGTERM",
	};
	info!("received {name}, shutting down");
}

/// Non-unix targets only get Ctrl+C.
#[cfg(not(unix))]
pub async fn wait_for_shutdown() {
	match tokio::signal::ctrl_c().await {
		Ok(()) => info!("received Ctrl+C, shutting down"),
		Err(e) => {
			info!("could not watch for Ctrl+C ({e}); running until killed");
			std::future::pending::<()>().await;
		},
	}
}
