use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;

use momentum_engine::config::{CliArgs, EngineConfig};
use momentum_engine::deadline::current_timestamp_ms;
use momentum_engine::engine::Engine;
use momentum_engine::protocol::methods::ENGINE_READY;
use momentum_engine::server::EngineServer;
use momentum_engine::transport::NdjsonTransport;

fn main() {
	let args = CliArgs::parse();

	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_env_filter(
			tracing_subscriber::EnvFilter::try_from_default_env()
				.unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&args.log_level)),
		)
		.init();

	let config = match &args.config {
		Some(path) => match EngineConfig::from_file(path) {
			Ok(c) => c,
			Err(e) => {
				tracing::error!(path = %path, "Failed to load config: {}", e);
				std::process::exit(1);
			}
		},
		None => EngineConfig::default(),
	}
	.with_cli(&args);

	let runtime = match tokio::runtime::Builder::new_multi_thread()
		.worker_threads(args.request_workers.max(1))
		.thread_name("momentum-worker")
		.enable_all()
		.build()
	{
		Ok(rt) => rt,
		Err(e) => {
			tracing::error!("Failed to start runtime: {}", e);
			std::process::exit(1);
		}
	};

	let engine = match Engine::open(config, current_timestamp_ms()) {
		Ok(engine) => Arc::new(engine),
		Err(e) => {
			tracing::error!("Failed to open engine: {}", e);
			std::process::exit(1);
		}
	};

	let stop = Arc::new(AtomicBool::new(false));
	let refresh_loop = if args.no_background {
		None
	} else {
		Some(engine.orchestrator().clone().spawn(
			runtime.handle(),
			args.background_workers,
			stop.clone(),
		))
	};

	let transport = NdjsonTransport::new();
	let server = Arc::new(EngineServer::new(transport, engine.clone()));

	transport.write_notification(ENGINE_READY, serde_json::json!(engine.stats()));
	tracing::info!(
		dimension = engine.config().index.dimension,
		background = !args.no_background,
		"momentum-engine ready"
	);

	let result = server.run(runtime.handle());

	stop.store(true, Ordering::Relaxed);
	if let Some(handle) = refresh_loop {
		handle.abort();
	}
	if engine.has_storage() {
		if let Err(e) = engine.save(current_timestamp_ms()) {
			tracing::error!("Failed to save on shutdown: {}", e);
		}
	}

	if let Err(e) = result {
		tracing::error!("Server error: {}", e);
		std::process::exit(1);
	}
}
