//! Resource group descriptors consulted by admission

use admit_common::GroupId;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceGroup {
    pub id: GroupId,
    pub name: String,
    /// Allocated slots allowed in this group; non-positive means unlimited.
    pub concurrency_limit: i32,
    /// Cpu cap in cores; non-positive means uncapped.
    pub max_cpu_cores: i32,
}

impl ResourceGroup {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id: GroupId(id),
            name: name.into(),
            concurrency_limit: 0,
            max_cpu_cores: 0,
        }
    }

    pub fn with_concurrency_limit(mut self, limit: i32) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub fn with_max_cpu_cores(mut self, cores: i32) -> Self {
        self.max_cpu_cores = cores;
        self
    }

    pub fn effective_concurrency_limit(&self) -> Option<usize> {
        (self.concurrency_limit > 0).then_some(self.concurrency_limit as usize)
    }

    pub fn effective_max_cpu_cores(&self) -> Option<i32> {
        (self.max_cpu_cores > 0).then_some(self.max_cpu_cores)
    }
}

pub struct ResourceGroupRegistry {
    groups: RwLock<HashMap<GroupId, ResourceGroup>>,
}

impl ResourceGroupRegistry {
    pub fn new() -> Self {
        Self {
            groups: RwLock::new(HashMap::new()),
        }
    }

    pub fn upsert(&self, group: ResourceGroup) {
        tracing::info!(
            "Resource group {} ({}) concurrency_limit={} max_cpu_cores={}",
            group.name,
            group.id,
            group.concurrency_limit,
            group.max_cpu_cores
        );
        self.groups.write().insert(group.id, group);
    }

    pub fn get(&self, id: GroupId) -> Option<ResourceGroup> {
        self.groups.read().get(&id).cloned()
    }

    pub fn name_of(&self, id: GroupId) -> Option<String> {
        self.groups.read().get(&id).map(|g| g.name.clone())
    }
}

impl Default for ResourceGroupRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_positive_limits_are_disabled() {
        let g = ResourceGroup::new(1, "rg1");
        assert_eq!(g.effective_concurrency_limit(), None);
        assert_eq!(g.effective_max_cpu_cores(), None);

        let g = g.with_concurrency_limit(2).with_max_cpu_cores(-1);
        assert_eq!(g.effective_concurrency_limit(), Some(2));
        assert_eq!(g.effective_max_cpu_cores(), None);
    }

    #[test]
    fn test_registry_upsert_replaces() {
        let registry = ResourceGroupRegistry::new();
        registry.upsert(ResourceGroup::new(2, "etl"));
        registry.upsert(ResourceGroup::new(1, "adhoc"));
        registry.upsert(ResourceGroup::new(2, "etl").with_concurrency_limit(4));

        assert_eq!(registry.name_of(GroupId(1)).as_deref(), Some("adhoc"));
        assert_eq!(registry.get(GroupId(2)).unwrap().concurrency_limit, 4);
        assert_eq!(registry.name_of(GroupId(3)), None);
    }
}
