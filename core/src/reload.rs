// Originally derived from https://github.com/istio/ztunnel (Apache 2.0 licensed)

use tokio::sync::mpsc;

/// Watches for the configuration-reload signal (SIGHUP or equivalent).
pub struct ReloadWatcher {
	rx: mpsc::Receiver<()>,
}

#[derive(Clone, Debug)]
pub struct ReloadTrigger {
	tx: mpsc::Sender<()>,
}

impl ReloadTrigger {
	pub async fn reload_now(&self) {
		let _ = self.tx.send(()).await;
	}
}

impl ReloadWatcher {
	pub fn new() -> (ReloadTrigger, Self) {
		let (tx, rx) = mpsc::channel(1);
		(ReloadTrigger { tx }, ReloadWatcher { rx })
	}

	/// Waits for the next reload request, whether from the OS signal or an explicit trigger.
	pub async fn recv(&mut self) {
		imp::wait(&mut self.rx).await
	}
}

#[cfg(unix)]
mod imp {
	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = watch_sighup() => {}
			_ = receiver.recv() => { info!("received explicit reload request") }
		};
	}

	async fn watch_sighup() {
		signal(SignalKind::hangup())
			.expect("failed to register SIGHUP handler")
			.recv()
			.await;
		info!("received SIGHUP, reloading configuration");
	}
}

#[cfg(not(unix))]
mod imp {
	use std::future::pending;

	use tokio::sync::mpsc::Receiver;

	pub(super) async fn wait(receiver: &mut Receiver<()>) {
		tokio::select! {
			_ = pending::<()>() => {}
			_ = receiver.recv() => {}
		};
	}
}
