use clap::Parser;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
#[command(disable_version_flag = true)]
struct Args {
	/// Validate the allowlist file and environment, then exit without serving.
	#[arg(long)]
	validate_only: bool,

	/// Print version.
	#[arg(short = 'V', long = "version")]
	version: bool,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	if args.version {
		println!("moltproxy {}", env!("CARGO_PKG_VERSION"));
		return Ok(());
	}

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.unwrap()
		.block_on(async move {
			let config = moltproxy::Config::from_env()?;
			if args.validate_only {
				return validate(&config).await;
			}
			moltproxy::run(config).await
		})
}

async fn validate(config: &moltproxy::Config) -> anyhow::Result<()> {
	moltproxy::allowlist::Allowlist::load(&config.allowlist_path).await?;
	println!("Configuration is valid!");
	Ok(())
}
