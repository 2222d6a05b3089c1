#[macro_use]
extern crate log;

use futures::TryStreamExt;
use ingress::group::{ConfigScope, GroupSettings, StoreIndex};
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::{Api, Client};
use kube_runtime::{
    WatchStreamExt,
    reflector::{reflector, store::Writer},
    watcher::{self},
};
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus_exporter::start_prometheus_metrics_server;
use rustrial_k8s_alb_controller_apis::LoadBalancerConfig;
use std::{collections::HashSet, sync::Arc};
use tokio_util::sync::CancellationToken;

mod builder;
mod cloud;
mod controller;
use controller::*;
mod deploy;
mod errors;
mod events;
mod ingress;
mod model;
mod modifications;
mod panics;
mod prometheus_exporter;
mod tracking;
mod utils;

use cloud::{
    CloudProvider,
    job::{JobExecutor, JobSettings},
    memory::InMemoryCloud,
};

/// The K8s field manager name.
const MANAGER: &'static str = "rustrial-alb-controller";

#[derive(Clone)]
struct Configuration {
    client: Client,
    /// The `LoadBalancerConfig` objects to reconcile.
    configs: Api<LoadBalancerConfig>,
    watch_namespaces: Option<HashSet<String>>,
    /// Recorded in the ownership tags of every cloud resource.
    cluster_id: String,
    vpc_id: String,
    group: GroupSettings,
    max_concurrent_reconciles: u16,
    /// Reporting instance of published events.
    instance: Option<String>,
}

impl Configuration {
    pub fn new(client: Client) -> anyhow::Result<Self> {
        fn normalize(hs: HashSet<String>) -> Option<HashSet<String>> {
            if hs.is_empty() || hs.contains("*") || hs.contains("") {
                None
            } else {
                Some(hs)
            }
        }
        let watch_namespaces: Option<HashSet<String>> = env_var("WATCH_NAMESPACES")
            .map(|v| normalize(v.split(",").map(|v| v.trim().to_string()).collect()))
            .flatten();
        let mut tmp = watch_namespaces.iter().flatten();
        let configs = if let (Some(ns), None) = (tmp.next(), tmp.next()) {
            // Optimize for the use-case where exactly one watch-namespace is provided.
            info!("Controller is only watching LoadBalancerConfig objects in namespace {}", ns);
            Api::<LoadBalancerConfig>::namespaced(client.clone(), ns.as_str())
        } else {
            if let Some(namespaces) = &watch_namespaces {
                let namespaces: Vec<&str> = namespaces.iter().map(|v| v.as_str()).collect();
                info!(
                    "Controller is watching LoadBalancerConfig objects in namespaces: {}",
                    namespaces.join(",")
                );
            } else {
                info!("Controller is watching LoadBalancerConfig objects in all namespaces");
            }
            Api::<LoadBalancerConfig>::all(client.clone())
        };
        let scope = env_var("CONFIG_SCOPE").unwrap_or_else(|| "cluster".to_string());
        let scope = ConfigScope::parse(&scope)
            .ok_or_else(|| anyhow::anyhow!("invalid CONFIG_SCOPE {}, expected cluster or namespaced", scope))?;
        let max_concurrent_reconciles = match env_var("MAX_CONCURRENT_RECONCILES") {
            Some(v) => v.parse()?,
            None => 3,
        };
        let vpc_id = env_var("VPC_ID").unwrap_or_default();
        if vpc_id.is_empty() {
            warn!("VPC_ID is not set, subnets must be configured explicitly in spec.config.zoneMappings");
        }
        Ok(Configuration {
            client,
            configs,
            watch_namespaces,
            cluster_id: env_var("CLUSTER_ID").unwrap_or_else(|| "kubernetes".to_string()),
            vpc_id,
            group: GroupSettings {
                system_namespace: env_var("SYSTEM_NAMESPACE")
                    .unwrap_or_else(|| "kube-system".to_string()),
                default_group_name: env_var("DEFAULT_GROUP_NAME")
                    .unwrap_or_else(|| "default".to_string()),
                scope,
            },
            max_concurrent_reconciles,
            instance: env_var("POD_NAME"),
        })
    }

    pub fn is_watched(&self, namespace: &str) -> bool {
        self.watch_namespaces
            .as_ref()
            .map_or(true, |v| v.is_empty() || v.contains(namespace) || v.contains("*"))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn ok<T, E>(_: T) -> Result<(), E> {
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    panics::install_hook();
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        debug!("rustls crypto provider is already installed");
    }
    let metrics_addr = env_var("METRICS_LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0".to_string());
    let metrics_port = env_var("METRICS_LISTEN_PORT").unwrap_or_else(|| "9000".to_string());
    let metrics_addr = format!("{}:{}", metrics_addr, metrics_port).parse()?;
    let registry = prometheus::Registry::new();
    let exporter = opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()?;
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    opentelemetry::global::set_meter_provider(provider);
    let prometheus_metrics_exporter = start_prometheus_metrics_server(metrics_addr, registry);

    let client = Client::try_default().await?;
    let ingress_writer: Writer<Ingress> = Default::default();
    let ingress_cache = ingress_writer.as_reader();
    let ingress_reflector = reflector(
        ingress_writer,
        watcher::watcher(Api::<Ingress>::all(client.clone()), watcher::Config::default()),
    )
    .applied_objects()
    .try_for_each(ok);
    let class_writer: Writer<IngressClass> = Default::default();
    let class_cache = class_writer.as_reader();
    let class_reflector = reflector(
        class_writer,
        watcher::watcher(
            Api::<IngressClass>::all(client.clone()),
            watcher::Config::default(),
        ),
    )
    .applied_objects()
    .try_for_each(ok);
    // All namespaces, the group loader resolves configurations across namespaces.
    let config_writer: Writer<LoadBalancerConfig> = Default::default();
    let config_cache = config_writer.as_reader();
    let config_reflector = reflector(
        config_writer,
        watcher::watcher(
            Api::<LoadBalancerConfig>::all(client.clone()),
            watcher::Config::default(),
        ),
    )
    .applied_objects()
    .try_for_each(ok);

    let configuration = Configuration::new(client)?;
    info!(
        "cluster {}, configurations in {} scope",
        configuration.cluster_id,
        match configuration.group.scope {
            ConfigScope::Cluster => "cluster",
            ConfigScope::Namespaced => "namespaced",
        }
    );
    let cloud: Arc<dyn CloudProvider> = Arc::new(InMemoryCloud::new());
    let jobs = JobExecutor::new(cloud.clone(), JobSettings::default());
    let shutdown = CancellationToken::new();
    let index = StoreIndex {
        ingress_classes: class_cache,
        configs: config_cache,
    };
    let controller = AlbController::new(
        configuration,
        ingress_cache,
        index,
        cloud,
        jobs,
        shutdown.clone(),
    )
    .start();
    // Abort pending cloud jobs, the controller drains in-flight reconciliations.
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            shutdown.cancel();
        }
    });
    info!("start controllers ...");
    tokio::select! {
       _ = controller => (),
       _ = ingress_reflector => (),
       _ = class_reflector => (),
       _ = config_reflector => (),
       r = prometheus_metrics_exporter => r?,
    };
    Ok(())
}
