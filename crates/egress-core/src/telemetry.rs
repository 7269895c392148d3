use tracing_subscriber::EnvFilter;

/// Initializes the global tracing subscriber. `RUST_LOG` controls filtering;
/// the default level is `info`.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.init();
}

/// Like [`setup_logging`] but safe to call repeatedly (tests).
pub fn try_setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let _ = tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(true)
		.try_init();
}
