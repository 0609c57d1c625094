//! Thin binary entrypoint. Building a `TunnelConfig` from a config file or
//! flags is out of scope here; this wires an already-constructed config into
//! the supervisor and runs it to completion.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use tunnel_agent::config::TunnelConfig;
use tunnel_agent::supervisor::Supervisor;
use tunnel_core::clock::SystemClock;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let shutdown = tokio_util::sync::CancellationToken::new();
	{
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			let _ = tokio::signal::ctrl_c().await;
			tracing::info!("received interrupt, shutting down");
			shutdown.cancel();
		});
	}

	let config = load_config()?;
	let supervisor = Arc::new(build_supervisor(config)?);
	supervisor.run(shutdown).await?;
	Ok(())
}

/// Placeholder for the caller's config-loading path (file, env, flags); a
/// real binary embedding this crate replaces this with its own loader.
fn load_config() -> anyhow::Result<TunnelConfig> {
	anyhow::bail!("this binary requires embedding a TunnelConfig; see tunnel_agent::config::TunnelConfig::builder")
}

fn build_supervisor(_config: TunnelConfig) -> anyhow::Result<Supervisor> {
	let _clock = Arc::new(SystemClock);
	anyhow::bail!("wiring a TunnelConfig into a Supervisor requires a concrete RpcClient and MuxerDialer implementation")
}
