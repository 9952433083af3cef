//! Top-level wiring: builds a [`crate::proxy::ProxyState`] from [`Config`] and
//! runs the listener until a shutdown signal arrives, reloading the allowlist
//! on SIGHUP along the way. Grounded on the `agentgateway-app` binary's use of
//! `agent_core::{drain, signal}` to coordinate listener lifecycle with
//! graceful connection drain.

use std::sync::Arc;

use moltproxy_core::{drain, reload, signal, telemetry};

use crate::allowlist::Allowlist;
use crate::audit::AuditRecord;
use crate::config::{Config, DRAIN_DEADLINE};
use crate::proxy::{self, ProxyState};
use crate::store::Store;
use crate::upstream::MoltbookClient;

pub async fn run(config: Config) -> anyhow::Result<()> {
	telemetry::init();

	let allowlist = Allowlist::load(&config.allowlist_path).await?;
	let store = Store::from_url(&config.object_store_url)?;
	let moltbook = MoltbookClient::new(config.moltbook_base_url.clone(), config.moltbook_token.clone())?;
	let state = Arc::new(ProxyState::new(allowlist, store, moltbook)?);

	// Held for the lifetime of the run: dropping it would close the reload
	// channel and make every `recv()` resolve immediately.
	let (_reload_trigger, mut reload_watcher) = reload::ReloadWatcher::new();
	let shutdown = signal::Shutdown::new();

	let (drain_tx, drain_rx) = drain::new();

	let reload_state = state.clone();
	let reload_task = tokio::spawn(async move {
		loop {
			reload_watcher.recv().await;
			match reload_state.allowlist.reload().await {
				Ok(()) => tracing::info!("allowlist reloaded"),
				Err(e) => reload_state.audit.log_error("allowlist reload failed", Some(&e)),
			}
		}
	});

	let serve_state = state.clone();
	let serve_task = tokio::spawn(async move { proxy::serve(&config, serve_state, drain_rx).await });

	shutdown.wait().await;
	tracing::info!("shutdown requested, draining connections");
	state.audit.log(
		AuditRecord::new("SHUTDOWN")
			.path("-")
			.allowed(true)
			.sanitized(false)
			.duration_ms(0)
			.message("graceful shutdown requested, draining in-flight connections")
			.into_map(),
	);
	reload_task.abort();

	if tokio::time::timeout(DRAIN_DEADLINE, drain_tx.start_drain_and_wait(drain::DrainMode::Graceful))
		.await
		.is_err()
	{
		tracing::warn!("drain deadline exceeded, forcing shutdown");
		return Err(anyhow::anyhow!("drain deadline of {:?} exceeded, forcing shutdown", DRAIN_DEADLINE));
	}

	match serve_task.await {
		Ok(result) => result,
		Err(e) if e.is_cancelled() => Ok(()),
		Err(e) => Err(e.into()),
	}
}
