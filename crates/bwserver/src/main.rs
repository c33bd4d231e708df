//! Entry point of the cluster server binary.
//!
//! Loads configuration, applies command-line overrides, sets up logging and
//! runs the selected process.

mod app;
mod cli;
mod config;
mod logging;
mod signals;
mod status;
mod worker;

use anyhow::Context;
use tracing::error;

use cli::{CliArgs, Role};
use config::AppConfig;
use mercury::Address;

async fn run(args: CliArgs) -> anyhow::Result<()> {
    let mut config = AppConfig::load_from_file(&args.config_path).await?;

    if let Some(bind_address) = args.bind_address {
        config.nub.bind_address = bind_address;
    }
    if let Some(log_level) = args.log_level {
        config.logging.level = log_level;
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    config
        .validate()
        .context("Configuration validation failed")?;

    match args.role {
        Role::Status { manager } => {
            // Only the summary goes to stdout
            let manager: Address = manager.parse()?;
            let mut nub_config = config.to_nub_config()?;
            nub_config.bind_address = Address::new(nub_config.bind_address.ip(), 0);
            let summary = status::query_status(nub_config, manager).await?;
            println!("{}", status::render(&summary)?);
            Ok(())
        }
        Role::BaseAppMgr => {
            logging::setup_logging(&config.logging)?;
            display_banner("BaseAppMgr");
            app::run_base_app_mgr(&config).await
        }
        Role::BaseApp { manager, backup } => {
            logging::setup_logging(&config.logging)?;
            display_banner(if backup { "Backup BaseApp" } else { "BaseApp" });
            let manager = manager.as_deref().map(str::parse::<Address>).transpose()?;
            app::run_base_app(&config, manager, backup).await
        }
    }
}

fn display_banner(role: &str) {
    let version = env!("CARGO_PKG_VERSION");
    tracing::info!("🚀 bwserver v{} - {}", version, role);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = CliArgs::parse();

    if let Err(e) = run(args).await {
        error!("❌ {:#}", e);
        eprintln!("❌ {e:#}");
        std::process::exit(1);
    }
}
