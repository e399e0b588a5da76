//! Host binary: boots the framework and runs until a shutdown trigger.

use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use modulith::{Framework, FrameworkConfig, Result};

#[derive(Parser, Debug)]
#[command(name = "modulith-host", about = "In-process module runtime host")]
struct Args {
    /// Framework configuration file (TOML). Defaults apply when absent.
    #[arg(long, env = "MODULITH_CONFIG", default_value = "modulith.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    modulith::observability::init_tracing();
    let args = Args::parse();

    let config = if args.config.is_file() {
        FrameworkConfig::load(&args.config)?
    } else {
        info!(config = %args.config.display(), "no config file, using defaults");
        FrameworkConfig::default()
    };

    let framework = Framework::new(config)?;
    let port = framework.startup().await?;
    info!(port, "host running, awaiting shutdown trigger");

    tokio::select! {
        _ = framework.wait_for_shutdown() => {}
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received");
        }
    }
    framework.shutdown().await;
    Ok(())
}
