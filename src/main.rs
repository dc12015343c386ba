//! Karpenter cloud provider for vSphere
//!
//! ## Usage
//!
//! ```bash
//! # Run against the current kubeconfig and a vCenter from the GOVC_* environment
//! karpenter-provider-vsphere --cluster-name demo --cluster-endpoint https://10.0.0.10:9345
//!
//! # Run with custom log level
//! RUST_LOG=debug karpenter-provider-vsphere
//! ```

use clap::Parser;
use karpenter_provider_vsphere::cloudprovider::{CloudProvider, VsphereCloudProvider};
use karpenter_provider_vsphere::events::{DedupingEventPublisher, EventPublisher, KubeEventPublisher};
use karpenter_provider_vsphere::kube_store::{KubeClientStore, KubeStore};
use karpenter_provider_vsphere::leader_election::{self, LeaderElector};
use karpenter_provider_vsphere::providers::{
    BootDataBuilder, DefaultProvider, InstanceProvider, KubernetesVersionProvider, KubernetesVersionSource,
};
use karpenter_provider_vsphere::scheduling::SchedulingConfig;
use karpenter_provider_vsphere::vsphere::{VsphereApi, VsphereClient};
use karpenter_provider_vsphere::{
    GarbageCollector, NodeClassHashController, NodeClassStatusController, NodeClassTerminationController,
    Options,
};
use kube::Client;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CONTROLLER_NAME: &str = "karpenter-provider-vsphere";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let options = Options::parse();
    options.validate()?;

    info!(
        cluster = %options.cluster_name,
        zone = options.zone().unwrap_or("none"),
        leader_election = options.leader_election,
        "Starting vSphere cloud provider"
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let elector = if options.leader_election {
        let ns = leader_election::detect_namespace(&options.leader_election_namespace);
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let vsphere: Arc<dyn VsphereApi> = Arc::new(VsphereClient::connect(options.vsphere_config()).await?);
    let kube: Arc<dyn KubeStore> = Arc::new(KubeClientStore::new(client.clone()));

    let boot = BootDataBuilder::new(Arc::clone(&kube), options.boot_settings()?);
    let instances: Arc<dyn InstanceProvider> =
        Arc::new(DefaultProvider::new(Arc::clone(&vsphere), boot, options.provider_settings()));
    let cloud_provider: Arc<dyn CloudProvider> = Arc::new(VsphereCloudProvider::new(
        Arc::clone(&kube),
        instances,
        SchedulingConfig::default(),
        &options.cluster_name,
        options.zone().map(str::to_string),
    ));
    let versions: Arc<dyn KubernetesVersionSource> = Arc::new(KubernetesVersionProvider::new(Arc::clone(&kube)));
    let events: Arc<dyn EventPublisher> = Arc::new(DedupingEventPublisher::new(Arc::new(
        KubeEventPublisher::new(client.clone(), CONTROLLER_NAME),
    )));

    let hash_controller = Arc::new(NodeClassHashController::new(Arc::clone(&kube)));
    let status_controller = Arc::new(NodeClassStatusController::new(Arc::clone(&kube), versions));
    let termination_controller = Arc::new(NodeClassTerminationController::new(Arc::clone(&kube), events));
    let garbage_collector = Arc::new(GarbageCollector::new(Arc::clone(&kube), cloud_provider));

    let hash_handle = {
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = hash_controller.run(client).await {
                error!("nodeclass.hash controller error: {}", e);
            }
        })
    };

    let status_handle = {
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = status_controller.run(client).await {
                error!("nodeclass.status controller error: {}", e);
            }
        })
    };

    let termination_handle = tokio::spawn(async move {
        if let Err(e) = termination_controller.run(client).await {
            error!("nodeclass.termination controller error: {}", e);
        }
    });

    let gc_handle = tokio::spawn(garbage_collector.run());

    // Pending forever when leader election is disabled
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = hash_handle => {
            if let Err(e) = result {
                error!("nodeclass.hash task failed: {}", e);
            }
        }
        result = status_handle => {
            if let Err(e) = result {
                error!("nodeclass.status task failed: {}", e);
            }
        }
        result = termination_handle => {
            if let Err(e) = result {
                error!("nodeclass.termination task failed: {}", e);
            }
        }
        result = gc_handle => {
            if let Err(e) = result {
                error!("instance.garbagecollection task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, shutting down");
        }
    }

    if let Some(e) = &elector {
        e.release().await;
    }

    info!("vSphere cloud provider shutting down");
    Ok(())
}
