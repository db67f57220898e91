use std::path::PathBuf;

use clap::Parser;
use harborgate::config;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about, long_about = None, version)]
struct Args {
	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,

	/// Validate the configuration and exit
	#[arg(long)]
	validate_only: bool,
}

fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	// Several TLS stacks are linked in; pin the process default provider so
	// every rustls builder resolves to the same one.
	rustls::crypto::ring::default_provider()
		.install_default()
		.ok();

	let args = Args::parse();

	let contents = match &args.file {
		Some(path) => Some(
			std::fs::read_to_string(path)
				.map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?,
		),
		None => None,
	};
	let cfg = config::parse_config(contents.as_deref())?;
	if args.validate_only {
		info!("configuration is valid");
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to build runtime")
		.block_on(async move {
			info!(version = harborgate::VERSION, "starting {}", harborgate::SERVICE_NAME);
			harborgate::app::run(cfg).await
		})
}
