use std::{
    collections::{BTreeMap, BTreeSet},
    marker::PhantomData,
    sync::OnceLock,
};

use serde::Serialize;
use serde_json::json;

use super::resources::{ResourceSpec, ResourceStatus, StackResource, Token};
use crate::errors::ControllerError;

/// Identifies one reconciliation unit, i.e. one `LoadBalancerConfig`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct StackId {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for StackId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Resource type tag, ordered in apply pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ResourceKind {
    Certificate,
    ServerGroup,
    LoadBalancer,
    Listener,
    Acl,
    ListenerRule,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct ResourceKey {
    pub kind: ResourceKind,
    pub id: String,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}", self.kind, self.id)
    }
}

/// Typed handle of a resource owned by a [`Stack`].
pub struct ResourceRef<T> {
    key: ResourceKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ResourceRef<T> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for ResourceRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ResourceRef({})", self.key)
    }
}

impl<T> ResourceRef<T> {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn id(&self) -> &str {
        &self.key.id
    }

    /// Token resolving to the cloud ID of the referenced resource.
    pub fn token(&self) -> Token {
        Token::Resource(self.key.clone())
    }
}

struct Node {
    spec: ResourceSpec,
    status: OnceLock<ResourceStatus>,
}

/// Dependency graph of desired resources built for one reconciliation pass.
///
/// The stack owns all resources, handles only carry the resource key. Status
/// values are written through a shared reference, at most once per resource,
/// so that appliers can fan out over a borrowed stack.
pub struct Stack {
    id: StackId,
    nodes: BTreeMap<ResourceKey, Node>,
    /// depender -> dependees
    dependencies: BTreeMap<ResourceKey, BTreeSet<ResourceKey>>,
}

impl Stack {
    pub fn new(id: StackId) -> Self {
        Self {
            id,
            nodes: Default::default(),
            dependencies: Default::default(),
        }
    }

    pub fn id(&self) -> &StackId {
        &self.id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add<T: StackResource>(
        &mut self,
        id: impl Into<String>,
        resource: T,
    ) -> Result<ResourceRef<T>, ControllerError> {
        let key = ResourceKey {
            kind: T::KIND,
            id: id.into(),
        };
        if self.nodes.contains_key(&key) {
            return Err(ControllerError::DuplicateResource(key.to_string()));
        }
        self.nodes.insert(
            key.clone(),
            Node {
                spec: resource.into_spec(),
                status: OnceLock::new(),
            },
        );
        Ok(ResourceRef {
            key,
            _marker: PhantomData,
        })
    }

    /// Register that `depender` must be applied after `dependee`.
    pub fn add_dependency(
        &mut self,
        dependee: &ResourceKey,
        depender: &ResourceKey,
    ) -> Result<(), ControllerError> {
        for key in [dependee, depender] {
            if !self.nodes.contains_key(key) {
                return Err(ControllerError::UnknownResource(key.to_string()));
            }
        }
        self.dependencies
            .entry(depender.clone())
            .or_default()
            .insert(dependee.clone());
        Ok(())
    }

    pub fn get<T: StackResource>(&self, r: &ResourceRef<T>) -> Option<&T> {
        self.nodes.get(&r.key).and_then(|n| T::from_spec(&n.spec))
    }

    /// All resources of type `T`, ordered by resource ID.
    pub fn list<T: StackResource>(&self) -> Vec<(ResourceRef<T>, &T)> {
        self.nodes
            .iter()
            .filter(|(k, _)| k.kind == T::KIND)
            .filter_map(|(k, n)| {
                T::from_spec(&n.spec).map(|spec| {
                    (
                        ResourceRef {
                            key: k.clone(),
                            _marker: PhantomData,
                        },
                        spec,
                    )
                })
            })
            .collect()
    }

    pub fn status<T: StackResource>(&self, r: &ResourceRef<T>) -> Option<&T::Status> {
        self.nodes
            .get(&r.key)
            .and_then(|n| n.status.get())
            .and_then(|s| T::from_status(s))
    }

    pub fn set_status<T: StackResource>(
        &self,
        r: &ResourceRef<T>,
        status: T::Status,
    ) -> Result<(), ControllerError> {
        let node = self
            .nodes
            .get(&r.key)
            .ok_or_else(|| ControllerError::UnknownResource(r.key.to_string()))?;
        node.status
            .set(T::into_status(status))
            .map_err(|_| ControllerError::StatusAlreadySet(r.key.to_string()))
    }

    /// Resolve a token, resource references resolve to the ID of the applied resource.
    pub fn resolve(&self, token: &Token) -> Result<String, ControllerError> {
        match token {
            Token::Value(v) => Ok(v.clone()),
            Token::Resource(key) => self
                .nodes
                .get(key)
                .and_then(|n| n.status.get())
                .and_then(|s| s.id())
                .map(|id| id.to_string())
                .ok_or_else(|| ControllerError::UnresolvedReference(key.to_string())),
        }
    }

    /// Visit every resource exactly once, dependees before their dependers.
    /// Ties are broken by resource key to keep the order deterministic.
    pub fn topological_traversal<F>(&self, mut visitor: F) -> Result<(), ControllerError>
    where
        F: FnMut(&ResourceKey, &ResourceSpec) -> Result<(), ControllerError>,
    {
        let mut pending: BTreeMap<&ResourceKey, usize> = self
            .nodes
            .keys()
            .map(|k| (k, self.dependencies.get(k).map_or(0, |d| d.len())))
            .collect();
        let mut dependers: BTreeMap<&ResourceKey, Vec<&ResourceKey>> = Default::default();
        for (depender, dependees) in &self.dependencies {
            for dependee in dependees {
                dependers.entry(dependee).or_default().push(depender);
            }
        }
        let mut ready: BTreeSet<&ResourceKey> = pending
            .iter()
            .filter(|(_, n)| **n == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut visited = 0usize;
        while let Some(key) = ready.pop_first() {
            pending.remove(key);
            if let Some(node) = self.nodes.get(key) {
                visitor(key, &node.spec)?;
            }
            visited += 1;
            for depender in dependers.get(key).into_iter().flatten() {
                if let Some(n) = pending.get_mut(*depender) {
                    *n -= 1;
                    if *n == 0 {
                        ready.insert(*depender);
                    }
                }
            }
        }
        if visited != self.nodes.len() {
            let remaining: Vec<String> = pending.keys().map(|k| k.to_string()).collect();
            return Err(ControllerError::CycleDetected(remaining.join(", ")));
        }
        Ok(())
    }

    /// JSON dump of all desired resources in topological order, used for audit logging.
    pub fn to_json(&self) -> Result<serde_json::Value, ControllerError> {
        let mut resources = Vec::with_capacity(self.nodes.len());
        self.topological_traversal(|key, spec| {
            let depends_on: Vec<String> = self
                .dependencies
                .get(key)
                .into_iter()
                .flatten()
                .map(|k| k.to_string())
                .collect();
            resources.push(json!({
                "type": key.kind,
                "id": key.id,
                "dependsOn": depends_on,
                "spec": serde_json::to_value(spec)?,
            }));
            Ok(())
        })?;
        Ok(json!({
            "id": self.id.to_string(),
            "resources": resources,
        }))
    }
}
