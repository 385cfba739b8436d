use std::sync::Arc;

use acme_manager::{AcmeManager, SettingsLoader};
use anyhow::Result;
use clap::Parser;
use tracing::info;

mod config;
mod web_api;

#[derive(Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[rocket::main]
async fn main() -> Result<()> {
    {
        use tracing_subscriber::{fmt, EnvFilter};
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        fmt().with_env_filter(filter).init();
    }

    let _ = rustls::crypto::ring::default_provider().install_default();

    let args = Args::parse();
    let figment = config::load_config_figment(args.config.as_deref());
    let api_config: config::ApiConfig = figment.focus("api").extract()?;

    // Settings are re-read from disk at every cycle, so edits to the config
    // files take effect on the next renewal or forced update.
    let config_file = args.config.clone();
    let loader: SettingsLoader = Arc::new(move || {
        config::acme_settings(&config::load_config_figment(config_file.as_deref()))
    });
    let manager = AcmeManager::new(loader);
    manager.start();

    let mut updates = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(paths) = updates.recv().await {
            info!(
                "certificate updated at {} and {}",
                paths.cert.display(),
                paths.key.display()
            );
        }
    });

    rocket::custom(figment)
        .manage(manager)
        .manage(api_config)
        .mount("/acme", web_api::routes())
        .launch()
        .await?;
    Ok(())
}
