//! kudzu-operator binary: wires the callback server and the API controller
//! together and runs them until a shutdown signal arrives.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use kudzu_rs::delegate::{
    self, Config as DelegateConfig, Manager, MemoryResultStorage, ResultStorage,
    DEFAULT_BASE_URL, DEFAULT_CALLBACK_IMAGE, DEFAULT_NAMESPACE,
};
use kudzu_rs::operator::{run_api_controller, Context};
use kudzu_rs::logging;

#[derive(Parser, Debug)]
#[command(name = "kudzu-operator", version, about = "Kudzu API and Operator controller")]
struct Flags {
    /// Use production log behavior (JSON output)
    #[arg(short = 'p', long, env = "KUDZU_PRODUCTION")]
    production: bool,

    /// Address the callback server listens on
    #[arg(long, env = "KUDZU_LISTEN", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Base URL delegate sidecars reach the callback server at
    #[arg(long, env = "KUDZU_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Image for the delegate callback sidecar
    #[arg(long, env = "KUDZU_CALLBACK_IMAGE", default_value = DEFAULT_CALLBACK_IMAGE)]
    callback_image: String,

    /// Namespace delegate pods run in
    #[arg(long, env = "KUDZU_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    logging::init(flags.production)?;

    info!("initializing");

    let client = Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;

    let storage: Arc<dyn ResultStorage> = Arc::new(MemoryResultStorage::default());
    let delegates = Manager::new(
        client.clone(),
        DelegateConfig {
            callback_image: flags.callback_image,
            base_url: flags.base_url,
            namespace: flags.namespace,
        },
    );
    let ctx = Arc::new(Context::new(client, delegates, storage.clone()));

    let server = tokio::spawn(delegate::serve(flags.listen, storage, shutdown_signal()));

    run_api_controller(ctx).await?;

    info!("shutting down callback server");
    server
        .await
        .context("callback server task panicked")?
        .context("callback server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Resolves when the process receives SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut interrupt = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }

    info!("caught signal; starting graceful shutdown");
}
