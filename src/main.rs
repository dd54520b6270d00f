//! `hvctl`: print the status table of one ESXi host.

mod config;
mod table;

use config::{AppConfig, AppError};
use hvctl_esxi::InventoryService;
use tracing_subscriber::EnvFilter;

async fn run() -> Result<String, AppError> {
    let cfg = AppConfig::from_env()?;
    let service = InventoryService::new(cfg.service);
    let id = service.add_vim_endpoint(cfg.endpoint)?;
    let opts = service.default_options();

    let result = async {
        let host = service.get_host_info(&id, &opts).await?;
        let listing = service
            .collect_datastores(&id, Some(&host.reference), &opts)
            .await?;
        Ok::<_, AppError>(table::render(&table::rows(&host, &listing)))
    }
    .await;

    service.shutdown().await;
    result
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(rendered) => print!("{rendered}"),
        Err(e) => {
            tracing::error!("{e}");
            std::process::exit(e.exit_code());
        }
    }
}
