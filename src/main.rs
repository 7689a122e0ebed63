use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use discoveryd::config::Config;

#[derive(Parser, Debug)]
#[command(version, about = "Multi-runtime workload discovery and reachability")]
struct Args {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Watch a container runtime and sync its workloads into the KV store.
	Watcher,
	/// Serve reachability queries from a replicated in-memory index.
	Server,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	let args = Args::parse();
	let config = Config::from_env()?;

	match args.command {
		Command::Watcher => discoveryd::watcher::run(config).await,
		Command::Server => discoveryd::server::run(config).await,
	}
}
