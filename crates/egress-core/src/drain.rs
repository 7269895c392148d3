//! Graceful draining primitives.
//!
//! A (trigger, watcher) pair coordinates shutdown: the trigger starts a drain
//! and waits for it to finish; watchers are held (cloned) by anything that
//! wants to delay completion. The drain finishes when every watcher clone has
//! been dropped.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{Instrument, debug, info, warn};

/// How aggressively in-flight work should be terminated.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum DrainMode {
	/// Terminate as fast as possible, without waiting for requests to complete.
	Immediate,
	/// Allow in-flight work to finish (up to the caller's deadline).
	Graceful,
}

/// Constructs a new pair for draining.
/// * [`DrainTrigger`] starts a draining sequence and waits for it to complete.
/// * [`DrainWatcher`] should be held by anything that wants to participate in
///   draining; it can be cloned, and a drain will not complete until all
///   outstanding clones are dropped.
pub fn new() -> (DrainTrigger, DrainWatcher) {
	let (mode_tx, mode_rx) = watch::channel(None);
	let (alive_tx, alive_rx) = mpsc::channel::<()>(1);
	(
		DrainTrigger { mode_tx, alive_rx },
		DrainWatcher {
			mode_rx,
			_alive: alive_tx,
		},
	)
}

pub struct DrainTrigger {
	mode_tx: watch::Sender<Option<DrainMode>>,
	alive_rx: mpsc::Receiver<()>,
}

impl DrainTrigger {
	/// Signals all watchers to drain and waits until every one has dropped.
	pub async fn start_drain_and_wait(self, mode: DrainMode) {
		let Self { mode_tx, mut alive_rx } = self;
		let _ = mode_tx.send(Some(mode));
		// recv() returns None once every watcher (sender clone) is gone.
		while alive_rx.recv().await.is_some() {}
		debug!("drain complete");
	}
}

#[derive(Clone)]
pub struct DrainWatcher {
	mode_rx: watch::Receiver<Option<DrainMode>>,
	_alive: mpsc::Sender<()>,
}

impl DrainWatcher {
	/// Resolves once a drain has been requested. Consumes this watcher, so the
	/// caller stops blocking the drain; hold another clone to keep blocking it.
	pub async fn wait_for_drain(mut self) -> DrainMode {
		loop {
			if let Some(mode) = *self.mode_rx.borrow() {
				return mode;
			}
			if self.mode_rx.changed().await.is_err() {
				// Trigger is gone without signaling; treat as an immediate stop.
				return DrainMode::Immediate;
			}
		}
	}
}

/// Runs a future with graceful shutdown/draining support.
///
/// `make_future` receives two arguments:
/// * a sub-drain watcher: holding it marks the component active; watching it
///   shows when to begin a graceful shutdown.
/// * a force-shutdown channel: when triggered, the graceful deadline has been
///   exceeded and all remaining work must terminate now.
pub async fn run_with_drain<F, O>(
	component: String,
	drain: DrainWatcher,
	deadline: Duration,
	make_future: F,
) where
	F: AsyncFnOnce(DrainWatcher, watch::Receiver<()>) -> O,
	O: Send + 'static,
{
	let (sub_trigger, sub_watcher) = new();
	let (force_tx, force_rx) = watch::channel(());
	let fut = make_future(sub_watcher, force_rx).in_current_span();
	let watch = async {
		let mode = drain.wait_for_drain().await;
		match mode {
			DrainMode::Graceful => {
				info!(
					component,
					"drain started, waiting up to {:?} for work to complete", deadline
				);
				if tokio::time::timeout(deadline, sub_trigger.start_drain_and_wait(mode))
					.await
					.is_err()
				{
					warn!(
						component,
						"drain deadline expired with pending work, forcefully shutting down"
					);
					let _ = force_tx.send(());
				}
			},
			DrainMode::Immediate => {
				let _ = force_tx.send(());
				sub_trigger.start_drain_and_wait(mode).await;
			},
		}
		info!(component, "drained");
	};
	tokio::select! {
		_ = fut => {
			debug!("component completed before drain");
		}
		_ = watch => {}
	}
}
