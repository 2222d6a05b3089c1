//! Aggregation of Ingress objects into ordered groups sharing one
//! `LoadBalancerConfig`.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::ResourceExt;
use kube_runtime::reflector::{ObjectRef, Store};
use log::debug;
use sha2::{Digest, Sha256};
use rustrial_k8s_alb_controller_apis::{
    API_GROUP, CONTROLLER_NAME, GROUP_FINALIZER_PREFIX, INGRESS_CLASS_ANNOTATION,
    LEGACY_INGRESS_CLASS, LOAD_BALANCER_CONFIG_KIND, LoadBalancerConfig, annotations,
};

use super::{annotations as ann, ingress_id, is_deleted};
use crate::errors::ControllerError;

const DEFAULT_CLASS_ANNOTATION: &'static str = "ingressclass.kubernetes.io/is-default-class";
/// Maximum length of the name part of a qualified finalizer name.
const MAX_FINALIZER_NAME: usize = 63;
const FINALIZER_DIGEST: usize = 16;

/// Names the `LoadBalancerConfig` a group of Ingress objects belongs to.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct GroupId {
    pub namespace: String,
    pub name: String,
}

impl GroupId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn of(config: &LoadBalancerConfig) -> Self {
        Self::new(config.namespace().unwrap_or_default(), config.name_any())
    }

    /// Group-completion finalizer set on active members, `<namespace>_<name>`
    /// or, if that is too long, its truncation followed by a digest of it.
    pub fn finalizer(&self) -> String {
        let name = format!("{}_{}", self.namespace, self.name);
        if name.len() <= MAX_FINALIZER_NAME {
            return format!("{}{}", GROUP_FINALIZER_PREFIX, name);
        }
        let digest = hex::encode(Sha256::digest(name.as_bytes()));
        let truncated: String = name
            .chars()
            .take(MAX_FINALIZER_NAME - FINALIZER_DIGEST - 1)
            .collect();
        format!(
            "{}{}-{}",
            GROUP_FINALIZER_PREFIX,
            truncated,
            &digest[..FINALIZER_DIGEST]
        )
    }

    /// Inverse of [`GroupId::finalizer`], `None` for digest finalizers.
    pub fn from_finalizer(finalizer: &str) -> Option<Self> {
        let (namespace, name) = finalizer.strip_prefix(GROUP_FINALIZER_PREFIX)?.split_once('_')?;
        Some(Self::new(namespace, name)).filter(|id| id.finalizer() == finalizer)
    }

    pub fn object_ref(&self) -> ObjectRef<LoadBalancerConfig> {
        ObjectRef::new(&self.name).within(&self.namespace)
    }
}

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Member {
    pub ingress: Arc<Ingress>,
    pub order: i64,
    pub explicit_order: bool,
}

impl Member {
    pub fn id(&self) -> String {
        ingress_id(&self.ingress)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct Group {
    pub id: GroupId,
    /// Ordered by (order, namespace, name).
    pub members: Vec<Member>,
    /// Objects which still carry the group finalizer but left the group.
    pub inactive_members: Vec<Arc<Ingress>>,
}

/// Where `LoadBalancerConfig` objects live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ConfigScope {
    /// All configurations live in the system namespace.
    Cluster,
    /// Configurations live next to their Ingress objects.
    Namespaced,
}

impl ConfigScope {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "cluster" => Some(Self::Cluster),
            "namespaced" => Some(Self::Namespaced),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct GroupSettings {
    pub system_namespace: String,
    pub default_group_name: String,
    pub scope: ConfigScope,
}

/// Read access to the cluster state the group loader depends on.
pub(crate) trait ConfigIndex: Send + Sync {
    fn ingress_class(&self, name: &str) -> Option<Arc<IngressClass>>;
    fn ingress_classes(&self) -> Vec<Arc<IngressClass>>;
    fn configs(&self) -> Vec<Arc<LoadBalancerConfig>>;
}

/// [`ConfigIndex`] backed by reflector stores.
#[derive(Clone)]
pub(crate) struct StoreIndex {
    pub ingress_classes: Store<IngressClass>,
    pub configs: Store<LoadBalancerConfig>,
}

impl ConfigIndex for StoreIndex {
    fn ingress_class(&self, name: &str) -> Option<Arc<IngressClass>> {
        self.ingress_classes.get(&ObjectRef::new(name))
    }

    fn ingress_classes(&self) -> Vec<Arc<IngressClass>> {
        self.ingress_classes.state()
    }

    fn configs(&self) -> Vec<Arc<LoadBalancerConfig>> {
        self.configs.state()
    }
}

fn is_own_class(class: &IngressClass) -> bool {
    class.spec.as_ref().and_then(|s| s.controller.as_deref()) == Some(CONTROLLER_NAME)
}

/// Inputs which determine the group of an Ingress, used as memoization key.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct GroupKey {
    namespace: String,
    group_name: Option<String>,
    class: Option<String>,
}

pub(crate) struct GroupLoader<'a> {
    index: &'a dyn ConfigIndex,
    settings: &'a GroupSettings,
    memo: Mutex<BTreeMap<GroupKey, Option<GroupId>>>,
}

impl<'a> GroupLoader<'a> {
    pub fn new(index: &'a dyn ConfigIndex, settings: &'a GroupSettings) -> Self {
        Self {
            index,
            settings,
            memo: Default::default(),
        }
    }

    fn class_name(ingress: &Ingress) -> Option<String> {
        ingress
            .spec
            .as_ref()
            .and_then(|s| s.ingress_class_name.clone())
            .or_else(|| ingress.annotations().get(INGRESS_CLASS_ANNOTATION).cloned())
    }

    /// The IngressClass handling `ingress`, if it is one of ours.
    fn own_class(&self, ingress: &Ingress) -> Option<Option<Arc<IngressClass>>> {
        match Self::class_name(ingress) {
            Some(name) if name == LEGACY_INGRESS_CLASS => Some(
                self.index
                    .ingress_class(&name)
                    .filter(|c| is_own_class(c)),
            ),
            Some(name) => self
                .index
                .ingress_class(&name)
                .filter(|c| is_own_class(c))
                .map(Some),
            None => self
                .index
                .ingress_classes()
                .into_iter()
                .find(|c| {
                    is_own_class(c)
                        && c.annotations().get(DEFAULT_CLASS_ANNOTATION).map(|v| v.as_str())
                            == Some("true")
                })
                .map(Some),
        }
    }

    /// Whether `ingress` is handled by this controller.
    pub fn is_managed(&self, ingress: &Ingress) -> bool {
        self.own_class(ingress).is_some()
    }

    /// Namespace of a configuration referenced by name only.
    fn config_namespace(&self, name: &str, ingress_namespace: &str) -> String {
        match self.settings.scope {
            ConfigScope::Cluster => self.settings.system_namespace.clone(),
            ConfigScope::Namespaced => {
                let configs = self.index.configs();
                let with_name = || configs.iter().filter(|c| c.name_any() == name);
                if with_name().any(|c| c.namespace().as_deref() == Some(ingress_namespace)) {
                    return ingress_namespace.to_string();
                }
                let mut provisioned: Vec<String> = with_name()
                    .filter(|c| c.dns_name().is_some())
                    .filter_map(|c| c.namespace())
                    .collect();
                provisioned.sort();
                provisioned
                    .into_iter()
                    .next()
                    .unwrap_or_else(|| ingress_namespace.to_string())
            }
        }
    }

    /// Group of `ingress`: the group-name annotation, the configuration linked
    /// by its IngressClass or the default group. `None` if the Ingress is
    /// not handled by this controller.
    pub fn load_group_id(&self, ingress: &Ingress) -> Option<GroupId> {
        let namespace = ingress.namespace().unwrap_or_default();
        let key = GroupKey {
            namespace: namespace.clone(),
            group_name: ann::get(ingress, annotations::GROUP_NAME).map(|v| v.to_string()),
            class: Self::class_name(ingress),
        };
        let mut memo = self.memo.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(id) = memo.get(&key) {
            return id.clone();
        }
        let id = self.own_class(ingress).map(|class| {
            if let Some(group) = &key.group_name {
                return match group.split_once('/') {
                    Some((ns, name)) => GroupId::new(ns, name),
                    None => GroupId::new(self.config_namespace(group, &namespace), group.as_str()),
                };
            }
            let parameters = class
                .as_ref()
                .and_then(|c| c.spec.as_ref())
                .and_then(|s| s.parameters.as_ref())
                .filter(|p| {
                    p.kind == LOAD_BALANCER_CONFIG_KIND && p.api_group.as_deref() == Some(API_GROUP)
                });
            if let Some(p) = parameters {
                let ns = match p.namespace.as_deref().filter(|ns| !ns.is_empty()) {
                    Some(ns) => ns.to_string(),
                    None => self.config_namespace(&p.name, &namespace),
                };
                return GroupId::new(ns, p.name.as_str());
            }
            let name = &self.settings.default_group_name;
            GroupId::new(self.config_namespace(name, &namespace), name.as_str())
        });
        memo.insert(key, id.clone());
        id
    }

    /// Group of a group-completion finalizer, digest finalizers are resolved
    /// against the known configurations.
    pub fn group_of_finalizer(&self, finalizer: &str) -> Option<GroupId> {
        if !finalizer.starts_with(GROUP_FINALIZER_PREFIX) {
            return None;
        }
        GroupId::from_finalizer(finalizer).or_else(|| {
            self.index
                .configs()
                .iter()
                .map(|c| GroupId::of(c))
                .find(|id| id.finalizer() == finalizer)
        })
    }

    /// Active and inactive members of group `id`.
    pub fn load(&self, id: &GroupId, ingresses: &[Arc<Ingress>]) -> Result<Group, ControllerError> {
        let finalizer = id.finalizer();
        let mut members = vec![];
        let mut inactive_members = vec![];
        for ingress in ingresses {
            let active = !is_deleted(ingress) && self.load_group_id(ingress).as_ref() == Some(id);
            if active {
                let (order, explicit_order) = ann::group_order(ingress)?;
                members.push(Member {
                    ingress: ingress.clone(),
                    order,
                    explicit_order,
                });
            } else if ingress.finalizers().iter().any(|f| f == &finalizer) {
                debug!("{} is an inactive member of group {}", ingress_id(ingress), id);
                inactive_members.push(ingress.clone());
            }
        }
        sort_members(&mut members)?;
        Ok(Group {
            id: id.clone(),
            members,
            inactive_members,
        })
    }
}

/// Sort by (order, namespace, name), rejecting explicit order collisions.
pub(crate) fn sort_members(members: &mut [Member]) -> Result<(), ControllerError> {
    members.sort_by_key(|m| {
        (
            m.order,
            m.ingress.namespace().unwrap_or_default(),
            m.ingress.name_any(),
        )
    });
    let mut explicit: BTreeMap<i64, String> = BTreeMap::new();
    for m in members.iter().filter(|m| m.explicit_order) {
        if let Some(first) = explicit.insert(m.order, m.id()) {
            return Err(ControllerError::GroupOrderConflict {
                first,
                second: m.id(),
                order: m.order,
            });
        }
    }
    Ok(())
}
