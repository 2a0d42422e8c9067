//! Process-wide store of service definitions, instances and routing rules.
//!
//! Rules are published as one immutable [`RuleIndex`] behind an `ArcSwap`;
//! a refresh builds a complete new index and swaps it in, so a reader holding
//! a snapshot sees either the old rule set or the new one, never a mix.
//! Definitions and instance sets live in concurrent maps and are replaced per
//! service, with single-instance edits applied to a fresh copy of the set.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use arc_swap::ArcSwap;

use crate::{
    core::{
        error::{GatewayError, GatewayResult},
        model::{Rule, ServiceDefinition, ServiceInstance},
    },
    ports::discovery::{DiscoverySnapshot, ServiceEntry},
};

/// Path segment after which encrypted payloads start; rule lookup ignores it.
pub const ENCRYPT_SEGMENT: &str = "/encrypt";

/// Key of the by-path index: `serviceId.path`.
pub fn path_key(service_id: &str, path: &str) -> String {
    format!("{service_id}.{path}")
}

/// Immutable set of the three rule indexes.
#[derive(Debug, Default)]
pub struct RuleIndex {
    version: u64,
    by_id: HashMap<String, Arc<Rule>>,
    by_path: HashMap<String, Arc<Rule>>,
    by_service: HashMap<String, Vec<Arc<Rule>>>,
}

impl RuleIndex {
    pub fn build(rules: Vec<Rule>, version: u64) -> Self {
        let mut index = Self {
            version,
            ..Self::default()
        };
        for mut rule in rules {
            rule.dedup_filter_configs();
            let rule = Arc::new(rule);
            for path in &rule.paths {
                index
                    .by_path
                    .insert(path_key(&rule.service_id, path), rule.clone());
            }
            index
                .by_service
                .entry(rule.service_id.clone())
                .or_default()
                .push(rule.clone());
            index.by_id.insert(rule.id.clone(), rule);
        }
        for rules in index.by_service.values_mut() {
            rules.sort_by(|a, b| a.priority_cmp(b));
        }
        index
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn rule(&self, id: &str) -> Option<Arc<Rule>> {
        self.by_id.get(id).cloned()
    }

    pub fn rule_by_path_key(&self, key: &str) -> Option<Arc<Rule>> {
        self.by_path.get(key).cloned()
    }

    pub fn rules_by_service(&self, service_id: &str) -> &[Arc<Rule>] {
        self.by_service
            .get(service_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// All rules in presentation order.
    pub fn sorted_rules(&self) -> Vec<Arc<Rule>> {
        let mut rules: Vec<_> = self.by_id.values().cloned().collect();
        rules.sort_by(|a, b| a.priority_cmp(b));
        rules
    }

    /// Exact `serviceId.path` match first, then the highest-priority rule of
    /// the service whose prefix the path starts with.
    pub fn match_rule(&self, service_id: &str, path: &str) -> Option<Arc<Rule>> {
        let path = path.find(ENCRYPT_SEGMENT).map_or(path, |at| &path[..at]);
        if let Some(rule) = self.by_path.get(&path_key(service_id, path)) {
            return Some(rule.clone());
        }
        self.rules_by_service(service_id)
            .iter()
            .find(|rule| !rule.prefix.is_empty() && path.starts_with(&rule.prefix))
            .cloned()
    }
}

/// Concurrent store read by the pipeline and written by the discovery refresh.
pub struct DynamicConfigStore {
    definitions: scc::HashMap<String, Arc<ServiceDefinition>>,
    instances: scc::HashMap<String, Arc<Vec<ServiceInstance>>>,
    rules: ArcSwap<RuleIndex>,
    next_version: AtomicU64,
}

impl Default for DynamicConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DynamicConfigStore {
    pub fn new() -> Self {
        Self {
            definitions: scc::HashMap::new(),
            instances: scc::HashMap::new(),
            rules: ArcSwap::from_pointee(RuleIndex::default()),
            next_version: AtomicU64::new(1),
        }
    }

    /// Replaces the entire rule set.
    pub fn put_all_rules(&self, rules: Vec<Rule>) -> u64 {
        let version = self.next_version.fetch_add(1, Ordering::Relaxed);
        let index = RuleIndex::build(rules, version);
        tracing::info!(version, rules = index.len(), "Publishing rule set");
        self.rules.store(Arc::new(index));
        version
    }

    /// Consistent view of all rule indexes.
    pub fn rules(&self) -> Arc<RuleIndex> {
        self.rules.load_full()
    }

    pub fn rule(&self, id: &str) -> Option<Arc<Rule>> {
        self.rules.load().rule(id)
    }

    pub fn match_rule(&self, service_id: &str, path: &str) -> GatewayResult<Arc<Rule>> {
        self.rules
            .load()
            .match_rule(service_id, path)
            .ok_or_else(|| GatewayError::PathNotMatched {
                service_id: service_id.to_string(),
                path: path.to_string(),
            })
    }

    pub async fn put_service_definition(&self, definition: ServiceDefinition) {
        let _ = self
            .definitions
            .upsert_async(definition.unique_id.clone(), Arc::new(definition))
            .await;
    }

    pub async fn service_definition(&self, unique_id: &str) -> Option<Arc<ServiceDefinition>> {
        self.definitions
            .get_async(unique_id)
            .await
            .map(|entry| entry.get().clone())
    }

    pub async fn remove_service_definition(&self, unique_id: &str) {
        let _ = self.definitions.remove_async(unique_id).await;
    }

    /// Replaces the instance set of a service. Instances are kept ordered by
    /// instance id; a duplicate id keeps its last occurrence.
    pub async fn put_service_instances(&self, unique_id: &str, instances: Vec<ServiceInstance>) {
        let mut by_id: HashMap<String, ServiceInstance> = HashMap::new();
        for instance in instances {
            by_id.insert(instance.instance_id.clone(), instance);
        }
        let mut set: Vec<_> = by_id.into_values().collect();
        set.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        let _ = self
            .instances
            .upsert_async(unique_id.to_string(), Arc::new(set))
            .await;
    }

    /// Adds or replaces one instance.
    pub async fn update_service_instance(&self, unique_id: &str, instance: ServiceInstance) {
        let mut next: Vec<ServiceInstance> = self
            .instance_set(unique_id)
            .await
            .map(|set| set.as_ref().clone())
            .unwrap_or_default();
        next.retain(|i| i.instance_id != instance.instance_id);
        next.push(instance);
        self.put_service_instances(unique_id, next).await;
    }

    pub async fn remove_service_instance(&self, unique_id: &str, instance_id: &str) {
        if let Some(set) = self.instance_set(unique_id).await {
            let next: Vec<_> = set
                .iter()
                .filter(|i| i.instance_id != instance_id)
                .cloned()
                .collect();
            self.put_service_instances(unique_id, next).await;
        }
    }

    pub async fn remove_service_instances(&self, unique_id: &str) {
        let _ = self.instances.remove_async(unique_id).await;
    }

    async fn instance_set(&self, unique_id: &str) -> Option<Arc<Vec<ServiceInstance>>> {
        self.instances
            .get_async(unique_id)
            .await
            .map(|entry| entry.get().clone())
    }

    /// Enabled instances of a service; gray requests only see gray instances.
    pub async fn service_instances(&self, unique_id: &str, gray: bool) -> Vec<ServiceInstance> {
        let Some(set) = self.instance_set(unique_id).await else {
            return Vec::new();
        };
        set.iter()
            .filter(|i| i.enable && (!gray || i.gray))
            .cloned()
            .collect()
    }

    /// Applies one service change event: definition plus its full instance set.
    pub async fn apply_service_change(&self, entry: ServiceEntry) {
        let unique_id = entry.definition.unique_id.clone();
        tracing::debug!(
            unique_id = %unique_id,
            instances = entry.instances.len(),
            "Applying service change"
        );
        self.put_service_definition(entry.definition).await;
        self.put_service_instances(&unique_id, entry.instances).await;
    }

    /// Applies a full discovery snapshot. Services missing from the snapshot
    /// are dropped.
    pub async fn apply_snapshot(&self, snapshot: DiscoverySnapshot) -> u64 {
        let mut present = std::collections::HashSet::new();
        for entry in snapshot.services {
            present.insert(entry.definition.unique_id.clone());
            self.apply_service_change(entry).await;
        }

        let mut stale = Vec::new();
        self.definitions
            .retain_async(|unique_id, _| {
                if present.contains(unique_id) {
                    true
                } else {
                    stale.push(unique_id.clone());
                    false
                }
            })
            .await;
        for unique_id in stale {
            tracing::info!(unique_id = %unique_id, "Removing service missing from discovery");
            self.remove_service_instances(&unique_id).await;
        }

        self.put_all_rules(snapshot.rules)
    }

    pub fn service_count(&self) -> usize {
        self.definitions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(id: &str, service: &str, prefix: &str, paths: &[&str], order: i32) -> Rule {
        Rule {
            id: id.into(),
            service_id: service.into(),
            prefix: prefix.into(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
            order,
            ..Rule::default()
        }
    }

    #[test]
    fn exact_path_beats_prefix() {
        let index = RuleIndex::build(
            vec![
                rule("prefix", "user", "/user", &[], 10),
                rule("exact", "user", "/user", &["/user/login"], 1),
            ],
            1,
        );
        assert_eq!(index.match_rule("user", "/user/login").unwrap().id, "exact");
        assert_eq!(index.match_rule("user", "/user/other").unwrap().id, "prefix");
        assert!(index.match_rule("user", "/order").is_none());
        assert!(index.match_rule("order", "/user/login").is_none());
    }

    #[test]
    fn encrypted_suffix_is_ignored_for_lookup() {
        let index = RuleIndex::build(vec![rule("r", "user", "", &["/user/pay"], 0)], 1);
        assert_eq!(
            index.match_rule("user", "/user/pay/encrypt/abcd").unwrap().id,
            "r"
        );
    }

    #[test]
    fn prefix_fallback_prefers_higher_order() {
        let index = RuleIndex::build(
            vec![
                rule("low", "user", "/user", &[], 1),
                rule("high", "user", "/user", &[], 9),
            ],
            1,
        );
        assert_eq!(index.match_rule("user", "/user/x").unwrap().id, "high");
    }

    #[test]
    fn put_all_rules_replaces_everything() {
        let store = DynamicConfigStore::new();
        store.put_all_rules(vec![rule("a", "user", "/user", &["/user/a"], 0)]);
        let old = store.rules();
        let version = store.put_all_rules(vec![rule("b", "order", "/order", &[], 0)]);

        assert!(store.rule("a").is_none());
        assert!(store.rule("b").is_some());
        assert_eq!(store.rules().version(), version);
        // Earlier snapshots stay intact.
        assert!(old.rule("a").is_some());
        assert!(old.rule_by_path_key("user./user/a").is_some());
    }

    #[tokio::test]
    async fn gray_requests_only_see_gray_instances() {
        let store = DynamicConfigStore::new();
        let mut disabled = ServiceInstance::new("user:1", "10.0.0.3", 80);
        disabled.enable = false;
        store
            .put_service_instances(
                "user:1",
                vec![
                    ServiceInstance::new("user:1", "10.0.0.1", 80),
                    ServiceInstance::new("user:1", "10.0.0.2", 80).with_gray(true),
                    disabled,
                ],
            )
            .await;

        assert_eq!(store.service_instances("user:1", false).await.len(), 2);
        let gray = store.service_instances("user:1", true).await;
        assert_eq!(gray.len(), 1);
        assert_eq!(gray[0].instance_id, "10.0.0.2:80");
        assert!(store.service_instances("missing", false).await.is_empty());
    }

    #[tokio::test]
    async fn single_instance_updates_copy_the_set() {
        let store = DynamicConfigStore::new();
        store
            .put_service_instances("user:1", vec![ServiceInstance::new("user:1", "10.0.0.1", 80)])
            .await;
        let before = store.service_instances("user:1", false).await;

        store
            .update_service_instance(
                "user:1",
                ServiceInstance::new("user:1", "10.0.0.1", 80).with_weight(7),
            )
            .await;
        store
            .update_service_instance("user:1", ServiceInstance::new("user:1", "10.0.0.2", 80))
            .await;

        let after = store.service_instances("user:1", false).await;
        assert_eq!(before[0].weight, 100);
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].weight, 7);

        store.remove_service_instance("user:1", "10.0.0.1:80").await;
        assert_eq!(store.service_instances("user:1", false).await.len(), 1);
    }

    #[tokio::test]
    async fn snapshot_drops_services_that_disappeared() {
        let store = DynamicConfigStore::new();
        let entry = |service: &str| ServiceEntry {
            definition: ServiceDefinition::new(service, "1.0"),
            instances: vec![ServiceInstance::new(format!("{service}:1.0"), "10.0.0.1", 80)],
        };

        store
            .apply_snapshot(DiscoverySnapshot {
                rules: vec![],
                services: vec![entry("user"), entry("order")],
            })
            .await;
        assert_eq!(store.service_count(), 2);

        store
            .apply_snapshot(DiscoverySnapshot {
                rules: vec![],
                services: vec![entry("user")],
            })
            .await;
        assert!(store.service_definition("order:1.0").await.is_none());
        assert!(store.service_instances("order:1.0", false).await.is_empty());
        assert!(store.service_definition("user:1.0").await.is_some());
    }
}
