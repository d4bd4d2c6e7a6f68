mod cni;
mod config;
mod device;
mod reconciler;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use netmesh_inventory::{resolve_self_predicate, Inventory, K8sNodeSource, NodeSource};
use netmesh_routing::gre::GreProvider;
use netmesh_routing::ipsec::IpsecProvider;
use netmesh_routing::layer2::Layer2Provider;
use netmesh_routing::vxlan::VxlanProvider;
use netmesh_routing::Provider;
use netmesh_types::{Config, Provider as ProviderKind};
use rtnetlink::Handle;
use tokio::sync::watch;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = config::Args::parse();
    let config = config::load(&args)?;

    init_tracing(config.log_level);

    let self_predicate = resolve_self_predicate(&config).context("resolving self-identification")?;
    let inventory = Arc::new(Inventory::new(self_predicate));

    let node_source: Arc<dyn NodeSource> =
        Arc::new(K8sNodeSource::in_cluster().context("building cluster inventory client")?);

    let (cancel_tx, cancel_rx) = watch::channel(false);

    let watcher_task = tokio::spawn({
        let inventory = inventory.clone();
        let node_source = node_source.clone();
        let cancel = cancel_rx.clone();
        async move { netmesh_inventory::watch(node_source, inventory, cancel).await }
    });

    let (connection, handle, _) = rtnetlink::new_connection().context("opening rtnetlink connection")?;
    tokio::spawn(connection);

    let provider = build_provider(&config, handle).await?;

    let reconciler_task = tokio::spawn({
        let inventory = inventory.clone();
        let node_source = node_source.clone();
        let cancel = cancel_rx.clone();
        let reconciler_config = reconciler::ReconcilerConfig {
            cni_config_path: config.cni_config_path.clone(),
        };
        async move { reconciler::run(inventory, provider, node_source, reconciler_config, cancel).await }
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping background tasks");
    let _ = cancel_tx.send(true);

    let _ = watcher_task.await;
    let _ = reconciler_task.await;
    Ok(())
}

fn init_tracing(log_level: i32) {
    let directive = match log_level {
        l if l <= 0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt().with_env_filter(directive).init();
}

/// Constructs the active backend per `config.provider`. Layer-2 and
/// VXLAN need an underlay device name, auto-detected when
/// `targetLinkName` is empty; an unresolvable device, like an unknown
/// backend name, is a fatal startup error (§7).
async fn build_provider(config: &Config, handle: Handle) -> Result<Arc<dyn Provider>> {
    match config.provider {
        ProviderKind::Layer2 => {
            let link_name = resolve_link_name(config, handle.clone()).await?;
            let provider = Layer2Provider::new(handle, &link_name)
                .await
                .context("constructing layer-2 backend")?;
            Ok(Arc::new(provider))
        }
        ProviderKind::Gre => Ok(Arc::new(GreProvider::new(handle))),
        ProviderKind::Vxlan => {
            let link_name = resolve_link_name(config, handle.clone()).await?;
            Ok(Arc::new(VxlanProvider::new(handle, link_name)))
        }
        ProviderKind::Ipsec => {
            let provider = IpsecProvider::new(&config.ipsec, true)
                .await
                .context("constructing IPsec backend")?;
            Ok(Arc::new(provider))
        }
    }
}

async fn resolve_link_name(config: &Config, handle: Handle) -> Result<String> {
    match config.target_link_name.clone().filter(|name| !name.is_empty()) {
        Some(name) => Ok(name),
        None => device::detect_underlay(handle).await.context("auto-detecting underlay device"),
    }
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
