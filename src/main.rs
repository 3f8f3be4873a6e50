use clap::Parser;
use k8s_openapi::serde_json;
use kube_informer::informer::{
    Informer, InformerAdapter, InformerConfig, Observation, Selector, SourceKind,
};
use kube_informer::k8s::{KubeSource, USER_AGENT, client};
use kube_informer::manager::SourceManager;
use prometheus::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// API version of the resource to watch, e.g. `v1` or `apps/v1`
    #[arg(long, default_value = "v1")]
    api_version: String,

    /// Kind of the resource to watch, e.g. `ConfigMap`
    #[arg(short, long)]
    kind: String,

    /// Namespace to watch; all namespaces when omitted
    #[arg(short, long, env = "INFORMER_NAMESPACE")]
    namespace: Option<String>,

    /// Label selector, e.g. `app=trivy,tier!=test`
    #[arg(short = 'l', long, env = "INFORMER_LABEL_SELECTOR")]
    selector: Option<String>,

    /// Seconds between forced re-lists; 0 disables the timer
    #[arg(long)]
    resync_seconds: Option<u64>,

    /// Number of concurrent handler workers
    #[arg(short, long)]
    workers: Option<usize>,
}

impl Args {
    fn config(&self) -> InformerConfig {
        let name = self.kind.to_lowercase();
        let mut config = InformerConfig::from_env(name).with_selector(Selector {
            namespace: self.namespace.clone(),
            label_selector: self.selector.clone(),
        });
        if let Some(secs) = self.resync_seconds {
            config = config.with_resync_period(Duration::from_secs(secs));
        }
        if let Some(workers) = self.workers {
            config = config.with_worker_count(workers);
        }
        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = args.config();

    let client = client::new(Some(USER_AGENT)).await?;
    let source = KubeSource::for_kind(client, &args.api_version, &args.kind);

    let mut manager = SourceManager::new(Registry::new());
    let metrics = manager.informer_metrics(&config.name)?;
    let informer = Informer::new(Arc::new(source), config, metrics);
    manager.add(Arc::new(InformerAdapter::new(SourceKind::Crd, informer)))?;

    let printers: Vec<_> = manager
        .take_observations()
        .into_iter()
        .map(|rx| tokio::spawn(print_observations(rx)))
        .collect();

    if let Err(e) = manager.start_all().await {
        error!("❌ Failed to start: {}", e);
        manager.shutdown().await;
        return Err(e.into());
    }

    tokio::signal::ctrl_c().await?;
    info!("Ctrl+C detected, shutting down");
    manager.shutdown().await;

    match manager.render_metrics() {
        Ok(text) => debug!("Final metrics:\n{}", text),
        Err(e) => error!("Failed to render metrics: {}", e),
    }

    // observation senders close once the informers are dropped
    drop(manager);
    let flushed = futures::future::join_all(printers);
    if tokio::time::timeout(Duration::from_secs(1), flushed).await.is_err() {
        debug!("Observation printers still running at exit");
    }
    Ok(())
}

/// Print each observation as one JSON line on stdout
async fn print_observations(mut rx: mpsc::Receiver<Observation>) {
    while let Some(observation) = rx.recv().await {
        match serde_json::to_string(&observation) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("Failed to encode observation for {}: {}", observation.key, e),
        }
    }
}
