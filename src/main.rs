use clap::Parser;
use kubesync::error::{Error, Result};
use kubesync::k8s::cache::{ObserverFns, ResourceSynchronizer};
use kubesync::k8s::registry::{KubeRegistry, ResourceKind};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Watch one Kubernetes collection and log every change after the initial sync
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// API group of the resource, empty for the core group
    #[arg(short, long, default_value = "")]
    group: String,

    /// API version of the resource
    #[arg(short = 'v', long, default_value = "v1")]
    api_version: String,

    /// Plural resource name, e.g. pods or deployments
    #[arg(short, long, default_value = "pods")]
    resource: String,

    /// Namespace to watch, all namespaces when omitted
    #[arg(short, long)]
    namespace: Option<String>,

    /// Seconds between re-list/reconcile passes
    #[arg(long, default_value_t = 60)]
    resync_secs: u64,

    /// Give up if the initial sync takes longer than this many seconds
    #[arg(long)]
    ready_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let args = Args::parse();
    let kind = ResourceKind::new(args.group, args.api_version, args.resource);

    info!("Configuration:");
    info!("  Resource: {}", kind);
    info!("  Namespace: {}", args.namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Resync: {}s", args.resync_secs);

    let cancel = CancellationToken::new();
    let ready_cancel = cancel.child_token();

    let registry = Arc::new(KubeRegistry::try_default().await?);
    let sync = {
        let ready_cancel = ready_cancel.clone();
        ResourceSynchronizer::new(
            registry,
            kind,
            args.namespace,
            Duration::from_secs(args.resync_secs),
        )?
        .with_error_reporter(move |err| {
            error!("❌ {}", err);
            if err.is_fatal() {
                ready_cancel.cancel();
            }
        })
    };
    sync.register_observer(Arc::new(
        ObserverFns::new()
            .named("log")
            .on_add(|record| info!("➕ Add event for {}", record.key))
            .on_update(|_, new| {
                info!(
                    "📝 Update event for {} (resourceVersion {})",
                    new.key,
                    new.resource_version.as_deref().unwrap_or("-")
                );
            })
            .on_delete(|record| info!("🗑️  Delete event for {}", record.key)),
    ));

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupt received, shutting down");
            }
            cancel.cancel();
        });
    }
    if let Some(secs) = args.ready_timeout_secs {
        let ready_cancel = ready_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            ready_cancel.cancel();
        });
    }

    sync.start(cancel.clone())?;

    if !sync.wait_until_ready(&ready_cancel).await {
        let interrupted = cancel.is_cancelled();
        cancel.cancel();
        sync.join().await;
        if interrupted {
            return Ok(());
        }
        return Err(Error::SyncFailure(Box::new(Error::Registry(format!(
            "{} did not sync",
            sync.kind()
        )))));
    }

    info!("Watching {} objects of {}", sync.len(), sync.kind());
    cancel.cancelled().await;
    sync.join().await;

    Ok(())
}
