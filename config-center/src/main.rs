use anyhow::Result;
use clap::Parser;

use config_center::config::{Cli, Command, Settings};
use config_center::server;

fn init_tracing(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => {
            let settings = Settings::load(&args)?;
            init_tracing(&settings.log_level);
            server::run_until_ctrl_c(settings).await?;
        }
    }

    Ok(())
}
