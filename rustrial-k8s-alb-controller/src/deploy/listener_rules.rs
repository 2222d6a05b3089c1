use std::collections::BTreeMap;

use async_trait::async_trait;
use log::{debug, info};

use super::{ApplyContext, ResourceApplier, parallel::for_each_bounded};
use crate::{
    cloud::{CloudError, ListenerRuleRequest, SdkListenerRule, retry::{classify, retry, retry_call}},
    errors::ControllerError,
    model::{Listener, ListenerRule, ListenerRuleStatus, ResourceKind, ResourceRef, Stack},
};

/// Converges the rules of every applied listener, rules are matched by priority.
#[derive(Default)]
pub(crate) struct ListenerRuleApplier;

fn request(stack: &Stack, rule: &ListenerRule) -> Result<ListenerRuleRequest, ControllerError> {
    Ok(ListenerRuleRequest {
        priority: rule.priority,
        name: rule.name.clone(),
        conditions: rule.conditions.clone(),
        actions: rule
            .actions
            .iter()
            .map(|a| a.try_map(|t| stack.resolve(t)))
            .collect::<Result<Vec<_>, ControllerError>>()?,
    })
}

fn needs_update(observed: &SdkListenerRule, desired: &ListenerRuleRequest) -> bool {
    observed.name != desired.name
        || observed.conditions != desired.conditions
        || observed.actions != desired.actions
}

impl ListenerRuleApplier {
    async fn apply_listener(
        &self,
        ctx: &ApplyContext<'_>,
        stack: &Stack,
        listener: &ResourceRef<Listener>,
        listener_id: &str,
    ) -> Result<(), ControllerError> {
        let cloud = ctx.cloud;
        let mut observed: BTreeMap<u32, SdkListenerRule> =
            retry_call("list listener rules", || cloud.list_listener_rules(listener_id))
                .await?
                .into_iter()
            .map(|r| (r.priority, r))
            .collect();
        let token = listener.token();
        let mut matched = Vec::new();
        let mut created = Vec::new();
        for (r, rule) in stack.list::<ListenerRule>() {
            if rule.listener != token {
                continue;
            }
            let req = request(stack, rule)?;
            match observed.remove(&rule.priority) {
                Some(o) => matched.push((r, o, req)),
                None => created.push((r, req)),
            }
        }
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            matched,
            |(r, observed, req)| async move {
                if needs_update(&observed, &req) {
                    info!("updating rule {} (priority {}) of listener {}", observed.id, req.priority, listener_id);
                    retry_call("update listener rule", || {
                        cloud.update_listener_rule(&observed.id, &req)
                    })
                    .await?;
                }
                stack.set_status(&r, ListenerRuleStatus { id: observed.id })
            },
        )
        .await?;
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            created,
            |(r, req)| async move {
                let id = retry_call("create listener rule", || {
                    cloud.create_listener_rule(listener_id, &req)
                })
                .await?;
                info!("created rule {} (priority {}) of listener {}", id, req.priority, listener_id);
                stack.set_status(&r, ListenerRuleStatus { id })
            },
        )
        .await?;
        let stale: Vec<SdkListenerRule> = observed.into_values().collect();
        for_each_bounded(
            ctx.settings.concurrency,
            ctx.settings.jitter,
            stale,
            |rule| async move {
                let id = rule.id.as_str();
                retry("delete listener rule", move || async move {
                    match cloud.delete_listener_rule(id).await {
                        Ok(()) | Err(CloudError::NotFound(_)) => Ok(()),
                        Err(e) => Err(classify("delete listener rule", e)),
                    }
                })
                .await?;
                info!("deleted rule {} (priority {}) of listener {}", id, rule.priority, listener_id);
                Ok(())
            },
        )
        .await
    }
}

#[async_trait]
impl ResourceApplier for ListenerRuleApplier {
    fn kind(&self) -> ResourceKind {
        ResourceKind::ListenerRule
    }

    async fn apply(&mut self, ctx: &ApplyContext<'_>, stack: &Stack) -> Result<(), ControllerError> {
        for (r, listener) in stack.list::<Listener>() {
            let Some(status) = stack.status(&r) else {
                debug!("listener {}/{} has not been applied", listener.port, listener.protocol);
                continue;
            };
            self.apply_listener(ctx, stack, &r, &status.id).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        deploy::{
            deploy,
            tests::{Fixture, http_stack, load_balancer},
        },
        model::{RuleAction, RuleCondition},
    };

    fn fixed_response(stack: &mut Stack, priority: u32, path: &str) {
        let (listener, _) = stack.list::<Listener>().into_iter().next().unwrap();
        let r = stack
            .add(
                format!("80-http-{}", priority),
                ListenerRule {
                    listener: listener.token(),
                    priority,
                    name: format!("rule-80-{}", priority),
                    conditions: vec![RuleCondition::Path {
                        values: vec![path.to_string()],
                    }],
                    actions: vec![RuleAction::FixedResponse {
                        http_code: 404,
                        content: "not found".into(),
                    }],
                },
            )
            .unwrap();
        stack.add_dependency(listener.key(), r.key()).unwrap();
    }

    #[tokio::test]
    async fn rules_are_matched_by_priority() {
        let f = Fixture::new();
        let mut stack = http_stack(load_balancer(), 0);
        fixed_response(&mut stack, 2, "/old");
        fixed_response(&mut stack, 3, "/gone");
        deploy(&f.ctx(), &stack).await.unwrap();
        assert_eq!(3, f.cloud.rules().len());
        let second = f
            .cloud
            .rules()
            .into_iter()
            .find(|r| r.priority == 2)
            .unwrap();

        let mut stack = http_stack(load_balancer(), 0);
        fixed_response(&mut stack, 2, "/new");
        deploy(&f.ctx(), &stack).await.unwrap();
        let rules = f.cloud.rules();
        assert_eq!(2, rules.len());
        let updated = rules.iter().find(|r| r.priority == 2).unwrap();
        assert_eq!(second.id, updated.id);
        assert_eq!(
            vec![RuleCondition::Path {
                values: vec!["/new".into()]
            }],
            updated.conditions
        );
        assert!(rules.iter().all(|r| r.priority != 3));
    }
}
