use crate::{
    Configuration,
    builder::{
        ModelBuilder, certificates::CloudCertDiscovery, deletion_stack, subnets::CloudSubnetResolver,
    },
    cloud::{CloudProvider, job::JobExecutor},
    deploy::{ApplyContext, ApplySettings, deploy},
    errors::ControllerError,
    events::{ControllerEvent, EventPublisher},
    ingress::{
        backend::{KubeBackendLookup, SERVICE_NAME_LABEL},
        group::{Group, GroupId, GroupLoader, GroupSettings, StoreIndex},
        ingress_id, referenced_services,
    },
    model::{Listener, LoadBalancer, Stack},
    modifications::LoadBalancerConfigModifications,
    panics,
    tracking::TrackingProvider,
    utils::{add_finalizer_if_missing, metric_name, remove_finalizer, set_ingress_hostname},
};

use futures::StreamExt;
use k8s_openapi::api::{
    core::v1::Service, discovery::v1::EndpointSlice, networking::v1::Ingress,
};
use kube::{Api, Client, ResourceExt};
use kube_runtime::{
    controller::{self, Action, Controller},
    reflector::{ObjectRef, Store},
    watcher::Config,
};
use log::{Level, debug, info, log_enabled};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use rustrial_k8s_alb_controller_apis::{
    Condition, FINALIZER, ListenerStatus, LoadBalancerConfig, LoadBalancerStatus,
};
use std::{future::Future, sync::Arc, time::Instant};
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

const READY: &'static str = "Ready";
pub(crate) const SUCCESS: &'static str = "Success";
pub(crate) const FAILURE: &'static str = "Failure";

const ALB_CONTROLLER: &'static str = "alb_controller";

/// Reconciles `LoadBalancerConfig` objects together with the Ingress objects
/// of their group.
pub(crate) struct AlbController {
    pub configuration: Configuration,
    /// All Ingress objects of the cluster.
    ingresses: Store<Ingress>,
    index: StoreIndex,
    cloud: Arc<dyn CloudProvider>,
    /// Shared by all reconciliations, bounds the number of in-flight cloud jobs.
    jobs: JobExecutor,
    tracking: TrackingProvider,
    settings: ApplySettings,
    events: EventPublisher,
    shutdown: CancellationToken,

    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
}

impl AlbController {
    pub fn new(
        configuration: Configuration,
        ingresses: Store<Ingress>,
        index: StoreIndex,
        cloud: Arc<dyn CloudProvider>,
        jobs: JobExecutor,
        shutdown: CancellationToken,
    ) -> Self {
        let meter: Meter = global::meter(ALB_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of LoadBalancerConfig reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of LoadBalancerConfig objects in milliseconds")
            .with_unit("ms")
            .build();
        let tracking = TrackingProvider::new(configuration.cluster_id.clone());
        let events = EventPublisher::new(
            configuration.client.clone(),
            configuration.instance.clone(),
        );
        Self {
            configuration,
            ingresses,
            index,
            cloud,
            jobs,
            tracking,
            settings: ApplySettings::default(),
            events,
            shutdown,
            reconcile_count,
            reconcile_duration,
        }
    }

    fn client(&self) -> Client {
        self.configuration.client.clone()
    }

    fn ingress_api(&self, ingress: &Ingress) -> Api<Ingress> {
        Api::namespaced(self.client(), &ingress.namespace().unwrap_or_default())
    }

    fn group_settings(&self) -> &GroupSettings {
        &self.configuration.group
    }

    /// Apply `stack` with a cancellation token scoped to this pass.
    async fn deploy(&self, stack: &Stack) -> Result<(), ControllerError> {
        let cancel = self.shutdown.child_token();
        let ctx = ApplyContext {
            cloud: self.cloud.as_ref(),
            jobs: &self.jobs,
            tracking: &self.tracking,
            settings: &self.settings,
            cancel: &cancel,
        };
        deploy(&ctx, stack).await
    }

    async fn add_finalizer_if_missing(
        &self,
        event: &mut LoadBalancerConfigModifications,
    ) -> Result<(), ControllerError> {
        let finalizers = event.finalizers_mut();
        if !finalizers.iter().any(|f| f.as_str() == FINALIZER) {
            finalizers.push(FINALIZER.to_string());
            event.patch_spec(self.client()).await?;
        }
        Ok(())
    }

    async fn remove_finalizer(
        &self,
        event: &mut LoadBalancerConfigModifications,
    ) -> Result<(), ControllerError> {
        let finalizers = event.finalizers_mut();
        let original_size = finalizers.len();
        finalizers.retain(|f| f.as_str() != FINALIZER);
        if finalizers.len() != original_size {
            event.patch_spec(self.client()).await?;
        }
        Ok(())
    }

    async fn delete(&self, event: &mut LoadBalancerConfigModifications) -> Result<(), ControllerError> {
        if !event.finalizers().iter().any(|f| f.as_str() == FINALIZER) {
            return Ok(());
        }
        let stack = deletion_stack(&event.modified);
        if let Err(e) = self.deploy(&stack).await {
            self.events
                .publish(
                    &event.modified,
                    ControllerEvent::ApplyFailed {
                        reason: e.reason().to_string(),
                        message: e.to_string(),
                    },
                )
                .await;
            return Err(e);
        }
        info!("released all cloud resources of {}", event.id());
        // Remove the group finalizer from every member, active or not.
        let finalizer = GroupId::of(&event.modified).finalizer();
        for ingress in self.ingresses.state() {
            if ingress.finalizers().iter().any(|f| f == &finalizer) {
                let mut ingress = ingress.as_ref().clone();
                if remove_finalizer(self.ingress_api(&ingress), &mut ingress, &finalizer).await? {
                    info!("removed finalizer {} from {}", finalizer, ingress_id(&ingress));
                }
            }
        }
        self.events
            .publish(&event.modified, ControllerEvent::Deleted)
            .await;
        self.remove_finalizer(event).await
    }

    fn load_group(&self, event: &LoadBalancerConfigModifications) -> Result<Group, ControllerError> {
        let loader = GroupLoader::new(&self.index, self.group_settings());
        loader.load(&GroupId::of(&event.modified), &self.ingresses.state())
    }

    async fn build(
        &self,
        event: &LoadBalancerConfigModifications,
        group: &Group,
    ) -> Result<Stack, ControllerError> {
        let backends = KubeBackendLookup::new(self.client());
        let certificates = CloudCertDiscovery::new(self.cloud.as_ref());
        let subnets = CloudSubnetResolver::new(self.cloud.as_ref(), &self.configuration.vpc_id);
        let builder = ModelBuilder {
            backends: &backends,
            certificates: &certificates,
            subnets: &subnets,
        };
        let outcome = builder.build(&event.modified, group).await;
        for (member, message) in outcome.member_errors {
            if let Some(m) = group.members.iter().find(|m| m.id() == member) {
                self.events
                    .publish(
                        m.ingress.as_ref(),
                        ControllerEvent::MemberFailed {
                            group: group.id.to_string(),
                            message,
                        },
                    )
                    .await;
            }
        }
        outcome.stack
    }

    /// Copy what was applied into the status of the configuration.
    fn update_status(
        &self,
        event: &mut LoadBalancerConfigModifications,
        stack: &Stack,
    ) -> Result<LoadBalancerStatus, ControllerError> {
        let (lb, _) = stack
            .list::<LoadBalancer>()
            .into_iter()
            .next()
            .ok_or_else(|| ControllerError::UnknownResource("load balancer".to_string()))?;
        let applied = stack
            .status(&lb)
            .ok_or_else(|| ControllerError::UnresolvedReference(lb.id().to_string()))?;
        let mut listeners = Vec::new();
        for (_, listener) in stack.list::<Listener>() {
            listeners.push(ListenerStatus {
                port: listener.port,
                protocol: listener.protocol,
                certificates: listener
                    .certificates
                    .iter()
                    .map(|c| stack.resolve(&c.certificate))
                    .collect::<Result<Vec<_>, _>>()?,
            });
        }
        listeners.sort_by_key(|l| (l.port, l.protocol));
        let status = LoadBalancerStatus {
            id: applied.id.clone(),
            dns_name: applied.dns_name.clone(),
            listeners,
        };
        event.update_load_balancer(Some(status.clone()));
        event.update_condition(Condition::new(
            READY,
            Some(true),
            SUCCESS,
            format!("load balancer {} is available at {}", status.id, status.dns_name),
        ));
        Ok(status)
    }

    async fn check(&self, event: &mut LoadBalancerConfigModifications) -> Result<(), ControllerError> {
        // First of all make sure the finalizer is in place.
        self.add_finalizer_if_missing(event).await?;
        let group = match self.load_group(event) {
            Ok(group) => group,
            Err(e) => {
                self.events
                    .publish(
                        &event.modified,
                        ControllerEvent::BuildFailed {
                            message: e.to_string(),
                        },
                    )
                    .await;
                return Err(e);
            }
        };
        debug!(
            "group {} has {} active and {} inactive members",
            group.id,
            group.members.len(),
            group.inactive_members.len()
        );
        let finalizer = group.id.finalizer();
        for member in group.members.iter() {
            let mut ingress = member.ingress.as_ref().clone();
            if add_finalizer_if_missing(self.ingress_api(&ingress), &mut ingress, &finalizer).await? {
                info!("added finalizer {} to {}", finalizer, member.id());
            }
        }
        let stack = match self.build(event, &group).await {
            Ok(stack) => stack,
            Err(e) => {
                self.events
                    .publish(
                        &event.modified,
                        ControllerEvent::BuildFailed {
                            message: e.to_string(),
                        },
                    )
                    .await;
                return Err(e);
            }
        };
        if log_enabled!(Level::Debug) {
            debug!("desired stack of {}: {}", event.id(), stack.to_json()?);
        }
        let result = match self.deploy(&stack).await {
            r @ (Ok(()) | Err(ControllerError::RetryPotentialReadyEndpoints)) => r,
            Err(e) => {
                self.events
                    .publish(
                        &event.modified,
                        ControllerEvent::ApplyFailed {
                            reason: e.reason().to_string(),
                            message: e.to_string(),
                        },
                    )
                    .await;
                return Err(e);
            }
        };
        let before = event.status.clone();
        let status = self.update_status(event, &stack)?;
        let changed = before != event.status;
        event.replace_status(self.client()).await?;
        for member in group.members.iter() {
            let ingress = member.ingress.as_ref();
            if set_ingress_hostname(self.ingress_api(ingress), ingress, &status.dns_name).await? {
                debug!("published {} on {}", status.dns_name, member.id());
            }
        }
        // Only now that the new state is applied may former members go.
        for ingress in group.inactive_members.iter() {
            let mut ingress = ingress.as_ref().clone();
            if remove_finalizer(self.ingress_api(&ingress), &mut ingress, &finalizer).await? {
                info!("{} left group {}", ingress_id(&ingress), group.id);
                self.events
                    .publish(
                        &ingress,
                        ControllerEvent::Released {
                            group: group.id.to_string(),
                        },
                    )
                    .await;
            }
        }
        if changed {
            self.events
                .publish(
                    &event.modified,
                    ControllerEvent::Reconciled {
                        dns_name: status.dns_name.clone(),
                    },
                )
                .await;
        }
        result
    }

    async fn reconcile_config(
        &self,
        event: &mut LoadBalancerConfigModifications,
    ) -> Result<(), ControllerError> {
        if event.is_deleted() {
            self.delete(event).await
        } else {
            self.check(event).await
        }
    }

    /// Controller triggers this whenever our main object or one of its group members changed
    async fn reconcile(
        object: Arc<LoadBalancerConfig>,
        ctx: Arc<Self>,
    ) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let mut event = LoadBalancerConfigModifications::new(object.as_ref().clone());
        let namespace = event.namespace().unwrap_or_else(|| "".to_string());
        if !me.configuration.is_watched(&namespace) {
            debug!(
                "Ignore {} as its namespace is not in the set of namespaces to watch",
                event.id()
            );
            return Ok(Action::await_change());
        }
        let start = Instant::now();
        let result = panics::catch(me.reconcile_config(&mut event)).await;
        let duration = Instant::now() - start;
        let labels = &[
            KeyValue::new("object_name", event.name_any()),
            KeyValue::new("object_namespace", namespace),
        ];
        me.reconcile_count.add(1, labels);
        me.reconcile_duration
            .record(duration.as_millis() as u64, labels);
        match result {
            Ok(()) => Ok(Action::requeue(Duration::from_secs(600))),
            Err(e @ ControllerError::RetryPotentialReadyEndpoints) => Err(e),
            Err(e) => {
                if let ControllerError::Panic { message, .. } = &e {
                    me.events
                        .publish(
                            &event.modified,
                            ControllerEvent::ApplyFailed {
                                reason: "Panic".to_string(),
                                message: message.clone(),
                            },
                        )
                        .await;
                }
                if !event.is_deleted() {
                    event.update_condition(Condition::new(
                        READY,
                        Some(false),
                        FAILURE,
                        format!("{}", e),
                    ));
                    event.replace_status(me.client()).await?;
                }
                Err(e)
            }
        }
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(
        _object: Arc<LoadBalancerConfig>,
        error: &ControllerError,
        _ctx: Arc<Self>,
    ) -> Action {
        match error {
            ControllerError::RetryPotentialReadyEndpoints => Action::requeue(Duration::from_secs(15)),
            e if e.is_temporary() => Action::requeue(Duration::from_secs(30)),
            _ => Action::requeue(Duration::from_secs(300)),
        }
    }

    pub fn start(self) -> impl Future<Output = ()> {
        let client = self.client();
        let group_settings = self.configuration.group.clone();
        let concurrency = self.configuration.max_concurrent_reconciles;
        let controller = Controller::new(self.configuration.configs.clone(), Config::default())
            .with_config(controller::Config::default().concurrency(concurrency));
        // Ingress changes trigger the group they join and the groups they leave.
        let index = self.index.clone();
        let settings = group_settings.clone();
        let controller = controller.watches(
            Api::<Ingress>::all(client.clone()),
            Config::default(),
            move |ingress: Ingress| {
                let loader = GroupLoader::new(&index, &settings);
                groups_of(&loader, &ingress)
            },
        );
        // Endpoint and Service changes trigger the groups of the Ingress
        // objects referring to the Service.
        let (index, settings, ingresses) = (
            self.index.clone(),
            group_settings.clone(),
            self.ingresses.clone(),
        );
        let controller = controller.watches(
            Api::<EndpointSlice>::all(client.clone()),
            Config::default().labels(SERVICE_NAME_LABEL),
            move |slice: EndpointSlice| {
                let service = slice.labels().get(SERVICE_NAME_LABEL).cloned();
                let namespace = slice.namespace().unwrap_or_default();
                let loader = GroupLoader::new(&index, &settings);
                match service {
                    Some(service) => groups_of_service(&loader, &ingresses, &namespace, &service),
                    None => vec![],
                }
            },
        );
        let (index, settings, ingresses) = (
            self.index.clone(),
            group_settings,
            self.ingresses.clone(),
        );
        let controller = controller.watches(
            Api::<Service>::all(client),
            Config::default(),
            move |service: Service| {
                let namespace = service.namespace().unwrap_or_default();
                let loader = GroupLoader::new(&index, &settings);
                groups_of_service(&loader, &ingresses, &namespace, &service.name_any())
            },
        );
        let meter: Meter = global::meter(ALB_CONTROLLER);
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of reconcile invocation errors for LoadBalancerConfig resources")
            .build();
        controller
            .shutdown_on_signal()
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(move |res| {
                let reconcile_errors = reconcile_errors.clone();
                async move {
                    match res {
                        Ok(o) => {
                            debug!("reconciled {:?}", o);
                        }
                        Err(e) => {
                            let labels = &[];
                            match e {
                                a @ kube_runtime::controller::Error::QueueError { .. } => {
                                    debug!("reconcile failed: {:?}", a);
                                    reconcile_errors.add(1, labels);
                                    // Slow down on errors caused by missing CRDs or permissions.
                                    sleep(Duration::from_secs(30)).await;
                                }
                                a @ kube_runtime::controller::Error::ObjectNotFound { .. } => {
                                    debug!("reconcile failed: {:?}", a);
                                }
                                kube_runtime::controller::Error::ReconcilerFailed(
                                    ControllerError::RetryPotentialReadyEndpoints,
                                    o,
                                ) => {
                                    debug!("waiting for endpoints of {} to become ready", o);
                                }
                                e => {
                                    warn!("reconcile failed: {:?}", e);
                                    reconcile_errors.add(1, labels);
                                }
                            };
                        }
                    }
                }
            })
    }
}

/// Groups `ingress` currently belongs to or still holds a finalizer of.
fn groups_of(loader: &GroupLoader<'_>, ingress: &Ingress) -> Vec<ObjectRef<LoadBalancerConfig>> {
    let mut groups: Vec<GroupId> = ingress
        .finalizers()
        .iter()
        .filter_map(|f| loader.group_of_finalizer(f))
        .collect();
    if let Some(id) = loader.load_group_id(ingress) {
        groups.push(id);
    }
    groups.sort();
    groups.dedup();
    groups.iter().map(GroupId::object_ref).collect()
}

fn groups_of_service(
    loader: &GroupLoader<'_>,
    ingresses: &Store<Ingress>,
    namespace: &str,
    service: &str,
) -> Vec<ObjectRef<LoadBalancerConfig>> {
    ingresses
        .state()
        .iter()
        .filter(|i| i.namespace().as_deref() == Some(namespace))
        .filter(|i| referenced_services(i).contains(service))
        .filter_map(|i| loader.load_group_id(i))
        .map(|id| id.object_ref())
        .collect()
}
