use std::panic;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::native::executor::NativeExecutor;
use crate::service::DiffService;

mod config;
mod constants;
mod core;
mod native;
mod pipeline;
mod service;
#[cfg(test)]
mod stubs;


#[tokio::main]
#[tracing::instrument]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    set_panic_hook();

    let mut config = Config::from_env()?;
    tokio::fs::create_dir_all(&config.workdir).await?;
    // Children run in their own directories, so artifact paths must be absolute.
    config.workdir = tokio::fs::canonicalize(&config.workdir).await?;
    let config = Arc::new(config);
    tracing::debug!("Configuration: {:?}", config);

    let executor = NativeExecutor::new(&config.workdir, config.toolchains.clone());
    let service = Arc::new(DiffService::new(Arc::new(executor), config.clone()));

    let listener = TcpListener::bind(&config.listen_addr).await?;
    tracing::info!("Differential runner listening on {}", listener.local_addr()?);
    pipeline::serve(listener, service, config.max_request_bytes).await?;

    Ok(())
}

fn set_panic_hook() {
    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(
            message = "panic occurred",
            panic = %panic_info
        );
    }));
}
