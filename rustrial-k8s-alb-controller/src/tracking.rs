//! Ownership tags of cloud resources.
//!
//! Every cloud resource created for a stack carries the cluster ID, the stack
//! ID (namespace/name of the `LoadBalancerConfig`) and the ID of the stack
//! resource it was created from. The same tags are used to list the observed
//! resources of a stack and to refuse adopting resources owned by someone else.

use std::collections::BTreeMap;

use rustrial_k8s_alb_controller_apis::tags;

use crate::model::{ResourceKey, StackId};

#[derive(Clone, Debug)]
pub(crate) struct TrackingProvider {
    cluster_id: String,
}

impl TrackingProvider {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
        }
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Tags shared by all resources of a stack, also used as list filter.
    pub fn stack_tags(&self, stack: &StackId) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        tags.insert(tags::CLUSTER_ID.to_string(), self.cluster_id.clone());
        tags.insert(tags::CONFIG.to_string(), stack.to_string());
        tags
    }

    /// Tags of one resource, user tags never override tracking tags.
    pub fn resource_tags(
        &self,
        stack: &StackId,
        resource: &ResourceKey,
        user_tags: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut tags = user_tags.clone();
        tags.extend(self.stack_tags(stack));
        tags.insert(tags::RESOURCE.to_string(), resource.id.clone());
        tags
    }

    /// Stack resource ID recorded on a cloud resource.
    pub fn resource_id<'a>(&self, tags: &'a BTreeMap<String, String>) -> Option<&'a str> {
        tags.get(tags::RESOURCE).map(|v| v.as_str())
    }

    pub fn is_owned(&self, stack: &StackId, tags: &BTreeMap<String, String>) -> bool {
        tags.get(tags::CLUSTER_ID).map(|v| v.as_str()) == Some(self.cluster_id.as_str())
            && tags.get(tags::CONFIG) == Some(&stack.to_string())
    }

    /// Describes the conflict if `tags` claim ownership by a different cluster
    /// or a different stack, untagged resources are free to adopt.
    pub fn ownership_conflict(
        &self,
        stack: &StackId,
        tags: &BTreeMap<String, String>,
    ) -> Option<String> {
        if let Some(cluster) = tags.get(tags::CLUSTER_ID) {
            if cluster != &self.cluster_id {
                return Some(format!(
                    "resource is owned by cluster {}, not by {}",
                    cluster, self.cluster_id
                ));
            }
        }
        if let Some(config) = tags.get(tags::CONFIG) {
            if config != &stack.to_string() {
                return Some(format!(
                    "resource is owned by configuration {}, not by {}",
                    config, stack
                ));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;

    fn stack() -> StackId {
        StackId {
            namespace: "kube-system".into(),
            name: "web".into(),
        }
    }

    #[test]
    fn resource_tags_keep_tracking_tags() {
        let tracking = TrackingProvider::new("c1");
        let mut user = BTreeMap::new();
        user.insert(tags::CLUSTER_ID.to_string(), "evil".to_string());
        user.insert("team".to_string(), "a".to_string());
        let key = ResourceKey {
            kind: ResourceKind::Listener,
            id: "80-http".into(),
        };
        let tags = tracking.resource_tags(&stack(), &key, &user);
        assert_eq!("c1", tags[tags::CLUSTER_ID]);
        assert_eq!("kube-system/web", tags[tags::CONFIG]);
        assert_eq!("a", tags["team"]);
        assert_eq!(Some("80-http"), tracking.resource_id(&tags));
        assert!(tracking.is_owned(&stack(), &tags));
    }

    #[test]
    fn conflicts() {
        let tracking = TrackingProvider::new("c1");
        assert_eq!(None, tracking.ownership_conflict(&stack(), &BTreeMap::new()));
        assert_eq!(
            None,
            tracking.ownership_conflict(&stack(), &tracking.stack_tags(&stack()))
        );
        let other_cluster = TrackingProvider::new("c2").stack_tags(&stack());
        assert!(tracking.ownership_conflict(&stack(), &other_cluster).is_some());
        let other_stack = tracking.stack_tags(&StackId {
            namespace: "kube-system".into(),
            name: "other".into(),
        });
        assert!(tracking.ownership_conflict(&stack(), &other_stack).is_some());
        assert!(!tracking.is_owned(&stack(), &other_stack));
    }
}
