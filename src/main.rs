mod app;
mod config;
mod server;
mod state;
mod tunnel;

use clap::Parser;

use config::Config;

/// Default config file name.
const DEFAULT_CONFIG: &str = "tunnelbroker.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_file_path =
        std::env::var("TUNNELBROKER_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config_path = std::path::Path::new(&config_file_path);
    if config_path.exists() {
        if let Ok(file_cfg) = config::ConfigFile::load(config_path) {
            file_cfg.inject_env();
        }
    }

    let config = Config::parse();
    app::run(config).await
}
