use tokio::sync::mpsc;

/// Shutdown coordinates process termination: it completes on SIGINT/SIGTERM
/// or when any holder of a [ShutdownTrigger] requests it.
pub struct Shutdown {
	tx: mpsc::Sender<()>,
	rx: mpsc::Receiver<()>,
}

impl Shutdown {
	pub fn new() -> Self {
		let (tx, rx) = mpsc::channel(1);
		Shutdown { tx, rx }
	}

	/// A handle that can request shutdown from anywhere in the process.
	pub fn trigger(&self) -> ShutdownTrigger {
		ShutdownTrigger {
			tx: self.tx.clone(),
		}
	}

	/// Resolves once a shutdown has been requested, by signal or by trigger.
	pub async fn wait(mut self) {
		imp::wait(&mut self.rx).await
	}
}

impl Default for Shutdown {
	fn default() -> Self {
		Self::new()
	}
}

#[derive(Clone, Debug)]
pub struct ShutdownTrigger {
	tx: mpsc::Sender<()>,
}

impl ShutdownTrigger {
	pub async fn shutdown_now(&self) {
		let _ = self.tx.send(()).await;
	}
}

#[cfg(unix)]
mod imp {
	use std::process;

	use tokio::signal::unix::{SignalKind, signal};
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait(rx: &mut Receiver<()>) {
		tokio::select! {
			_ = catch(SignalKind::interrupt(), "SIGINT") => {
				// A second Ctrl+C skips graceful teardown entirely.
				tokio::spawn(async {
					catch(SignalKind::interrupt(), "SIGINT").await;
					info!("second SIGINT, exiting immediately");
					process::exit(0);
				});
			}
			_ = catch(SignalKind::terminate(), "SIGTERM") => {}
			_ = rx.recv() => {
				info!("explicit shutdown requested");
			}
		};
	}

	async fn catch(kind: SignalKind, name: &'static str) {
		signal(kind)
			.expect("failed to register signal handler")
			.recv()
			.await;
		info!("received {name}, starting shutdown");
	}
}

#[cfg(not(unix))]
mod imp {
	use tokio::sync::mpsc::Receiver;
	use tracing::info;

	pub(super) async fn wait(rx: &mut Receiver<()>) {
		tokio::select! {
			_ = ctrl_c() => {}
			_ = rx.recv() => {
				info!("explicit shutdown requested");
			}
		};
	}

	async fn ctrl_c() {
		tokio::signal::ctrl_c()
			.await
			.expect("failed to register signal handler");
		info!("received interrupt, starting shutdown");
	}
}
