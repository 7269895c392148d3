use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use egress_core::drain::DrainMode;
use egress_core::{drain, signal};
use egressgateway::client::pool;
use egressgateway::proxy::gateway::Gateway;
use egressgateway::{ProxyInputs, config};
use tracing::info;

#[derive(Parser)]
#[command(name = "egressgateway", about = "Egress policy-enforcement proxy", version)]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short, long)]
	config: Option<PathBuf>,
	/// Validate the configuration and exit.
	#[arg(long)]
	validate: bool,
}

fn main() -> anyhow::Result<()> {
	egress_core::telemetry::setup_logging();
	let args = Args::parse();
	let cfg = config::load(args.config.as_deref())?;
	if args.validate {
		println!("configuration OK");
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.worker_threads(num_cpus::get())
		.enable_all()
		.build()?
		.block_on(run(cfg))
}

async fn run(cfg: egressgateway::Config) -> anyhow::Result<()> {
	let inputs = ProxyInputs::new(cfg)?;

	pool::spawn_reaper(inputs.pool.clone(), Duration::from_secs(5));
	spawn_rate_sweeper(inputs.clone());

	let (trigger, watcher) = drain::new();
	let gateway = Gateway::new(inputs, watcher);
	let gateway_task = tokio::spawn(gateway.run());

	signal::Shutdown::new().wait().await;
	info!("shutting down; draining connections");
	trigger.start_drain_and_wait(DrainMode::Graceful).await;
	gateway_task.abort();
	Ok(())
}

/// Prunes idle rate-limit buckets across all tenants, plus circuit entries
/// that have not been touched in an hour.
fn spawn_rate_sweeper(inputs: Arc<ProxyInputs>) {
	tokio::spawn(async move {
		let mut tick = tokio::time::interval(Duration::from_secs(60));
		tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		loop {
			tick.tick().await;
			let mut removed = inputs.default_tenant.limiter.prune_idle();
			if let Some(tenants) = &inputs.tenants {
				for ctx in tenants.contexts() {
					removed += ctx.limiter.prune_idle();
				}
			}
			removed += inputs.breaker.prune_idle(Duration::from_secs(3600));
			if removed > 0 {
				tracing::debug!(removed, "pruned idle rate-limit and circuit state");
			}
		}
	});
}
