use anyhow::Result;
use log::error;

use rtu_master::cli::{build_cli, commands::handle_subcommands};

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_target(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let matches = build_cli().get_matches();
    let verbose = matches
        .subcommand()
        .map(|(_, sub)| sub.get_flag("verbose"))
        .unwrap_or_else(|| matches.get_flag("verbose"));
    init_logging(verbose);

    if let Err(e) = handle_subcommands(&matches).await {
        error!("❌ {:#}", e);
        return Err(e);
    }
    Ok(())
}
