use std::pin::pin;
use std::sync::Arc;

use anyhow::Context;
use discovery_core::prelude::*;
use discovery_core::signal::Shutdown;
use tokio::sync::mpsc;

use crate::config::Config;
use crate::kv::Kv;
use crate::runtime::{self, RuntimeAdapter, WorkloadEvent};
use crate::types::EventType;
use crate::types::workload::short_id;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Watcher daemon: drives one runtime adapter and mirrors its workloads
/// into the KV store. The KV store is the single source of truth; this
/// process keeps no index of its own.
pub async fn run(config: Config) -> anyhow::Result<()> {
	let kv = Kv::connect(&config.etcd)
		.await
		.context("failed to connect to the KV store")?;

	let mut adapter = runtime::from_config(&config);
	info!(
		runtime = %adapter.runtime(),
		registrar = %config.registrar,
		"starting workload watcher"
	);
	// A runtime we cannot reach at startup is fatal; everything later
	// retries.
	adapter
		.connect()
		.await
		.with_context(|| format!("failed to connect to {} runtime", adapter.runtime()))?;
	let adapter: Arc<dyn RuntimeAdapter> = Arc::from(adapter);

	sync_initial(&kv, &config, adapter.as_ref()).await?;

	let shutdown = Shutdown::new();
	let mut stopped = pin!(shutdown.wait());
	let mut backoff = INITIAL_BACKOFF;

	loop {
		let (tx, mut rx) = mpsc::channel::<WorkloadEvent>(EVENT_CHANNEL_CAPACITY);
		let stream_adapter = adapter.clone();
		let mut stream_task =
			tokio::spawn(async move { stream_adapter.watch_events(tx).await });

		loop {
			tokio::select! {
				_ = &mut stopped => {
					adapter.close();
					let _ = (&mut stream_task).await;
					info!("watcher stopped");
					return Ok(());
				},
				event = rx.recv() => match event {
					Some(event) => {
						handle_event(&kv, &config, event).await;
						backoff = INITIAL_BACKOFF;
					},
					// Sender dropped: the event stream is over.
					None => break,
				},
			}
		}

		match stream_task.await {
			Ok(Ok(())) => info!("event stream ended, reconnecting in {backoff:?}"),
			Ok(Err(e)) => warn!("event stream failed: {e}, reconnecting in {backoff:?}"),
			Err(e) => warn!("event task aborted: {e}, reconnecting in {backoff:?}"),
		}
		tokio::select! {
			_ = &mut stopped => {
				adapter.close();
				info!("watcher stopped");
				return Ok(());
			},
			_ = tokio::time::sleep(backoff) => {},
		}
		backoff = std::cmp::min(MAX_BACKOFF, backoff * 2);
	}
}

/// Register everything the runtime currently reports, so the store reflects
/// workloads that started while no watcher was running.
async fn sync_initial(
	kv: &Kv,
	config: &Config,
	adapter: &dyn RuntimeAdapter,
) -> anyhow::Result<()> {
	let workloads = adapter
		.list_workloads()
		.await
		.context("initial workload listing failed")?;
	let total = workloads.len();
	for mut workload in workloads {
		workload.registrar = Some(config.registrar.clone());
		if let Err(e) = kv.put_workload(&workload).await {
			warn!(name = %workload.name, "failed to register workload: {e}");
		}
	}
	info!(total, runtime = %adapter.runtime(), "initial sync complete");
	Ok(())
}

async fn handle_event(kv: &Kv, config: &Config, event: WorkloadEvent) {
	let WorkloadEvent { kind, mut workload } = event;
	match kind {
		EventType::Added | EventType::Modified | EventType::NetworkChanged => {
			workload.registrar = Some(config.registrar.clone());
			match kv.put_workload(&workload).await {
				Ok(()) => info!(
					event = %kind,
					runtime = %workload.runtime,
					name = %workload.name,
					id = %short_id(&workload.id),
					groups = ?workload.isolation_groups,
					"registered workload"
				),
				Err(e) => warn!(name = %workload.name, "failed to register workload: {e}"),
			}
		},
		EventType::Deleted => match kv.delete_workload(&workload.id).await {
			Ok(()) => info!(
				event = %kind,
				runtime = %workload.runtime,
				name = %workload.name,
				id = %short_id(&workload.id),
				"deregistered workload"
			),
			Err(e) => warn!(name = %workload.name, "failed to deregister workload: {e}"),
		},
	}
}
