use std::path::PathBuf;

use clap::Parser;
use svctunnel_core::{Settings, error::Result, logging};
use svctunnel_daemon::run_daemon;

#[derive(Parser)]
#[command(name = "svctunneld")]
#[command(about = "WireGuard tunnel service daemon", long_about = None)]
struct Args {
    /// INI file overriding the default paths and timeouts
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log to stdout only
    #[arg(long)]
    no_log_file: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let settings = match &args.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::platform_default()?,
    };
    let _log_guard = logging::init(&settings.paths.log_file, !args.no_log_file)?;
    run_daemon(settings).await
}
