//! Filtering and pagination for instance listings.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vscode_swarm_store::{InstanceStatus, VSCodeInstance};

/// Status criterion: a single status or any of a set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusFilter {
    /// Exactly this status.
    One(InstanceStatus),
    /// Any of these statuses.
    Any(Vec<InstanceStatus>),
}

impl StatusFilter {
    fn matches(&self, status: InstanceStatus) -> bool {
        match self {
            Self::One(s) => *s == status,
            Self::Any(set) => set.contains(&status),
        }
    }
}

/// Criteria for `list_instances`. All criteria are conjunctive; an empty
/// filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InstanceFilter {
    /// Status criterion.
    pub status: Option<StatusFilter>,
    /// Substring the name must contain.
    pub name_pattern: Option<String>,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<DateTime<Utc>>,
    /// Inclusive upper bound on `created_at`.
    pub created_before: Option<DateTime<Utc>>,
    /// Metadata entries that must all be present with equal values.
    pub tags: Option<BTreeMap<String, String>>,
    /// Entries to skip after filtering.
    pub offset: Option<usize>,
    /// Maximum entries to return after the offset.
    pub limit: Option<usize>,
}

impl InstanceFilter {
    /// Match a single status.
    #[must_use]
    pub fn with_status(mut self, status: InstanceStatus) -> Self {
        self.status = Some(StatusFilter::One(status));
        self
    }

    /// Match any of the given statuses.
    #[must_use]
    pub fn with_statuses(mut self, statuses: impl Into<Vec<InstanceStatus>>) -> Self {
        self.status = Some(StatusFilter::Any(statuses.into()));
        self
    }

    /// Require `pattern` in the name.
    #[must_use]
    pub fn with_name(mut self, pattern: impl Into<String>) -> Self {
        self.name_pattern = Some(pattern.into());
        self
    }

    /// Require a metadata entry.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Paginate.
    #[must_use]
    pub const fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = Some(offset);
        self.limit = Some(limit);
        self
    }

    /// Whether an instance satisfies every criterion. Pagination is ignored.
    #[must_use]
    pub fn matches(&self, instance: &VSCodeInstance) -> bool {
        if let Some(status) = &self.status {
            if !status.matches(instance.status) {
                return false;
            }
        }
        if let Some(pattern) = &self.name_pattern {
            if !instance.name.contains(pattern.as_str()) {
                return false;
            }
        }
        if self.created_after.is_some_and(|t| instance.created_at < t) {
            return false;
        }
        if self.created_before.is_some_and(|t| instance.created_at > t) {
            return false;
        }
        if let Some(tags) = &self.tags {
            if !tags
                .iter()
                .all(|(k, v)| instance.metadata.get(k) == Some(v))
            {
                return false;
            }
        }
        true
    }

    /// Filter a creation-ordered list, then skip `offset` and take `limit`.
    #[must_use]
    pub fn apply(&self, instances: Vec<VSCodeInstance>) -> Vec<VSCodeInstance> {
        instances
            .into_iter()
            .filter(|i| self.matches(i))
            .skip(self.offset.unwrap_or(0))
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use vscode_swarm_core::InstanceId;
    use vscode_swarm_store::{InstanceConfig, ProviderType};

    fn fixture() -> Vec<VSCodeInstance> {
        let base = Utc::now();
        let specs = [
            ("web-1", InstanceStatus::Running, "frontend"),
            ("api-1", InstanceStatus::Stopped, "backend"),
            ("web-2", InstanceStatus::Running, "frontend"),
            ("api-2", InstanceStatus::Failed, "backend"),
        ];

        specs
            .iter()
            .enumerate()
            .map(|(i, (name, status, team))| {
                let created = base + Duration::seconds(i64::try_from(i).unwrap());
                let mut metadata = BTreeMap::new();
                metadata.insert("team".to_string(), (*team).to_string());
                VSCodeInstance {
                    id: InstanceId::generate(name),
                    name: (*name).to_string(),
                    provider_type: ProviderType::Docker,
                    provider_name: "local".to_string(),
                    provider_region: "eu".to_string(),
                    provider_instance_id: String::new(),
                    status: *status,
                    config: InstanceConfig::new(*name, "/src"),
                    resources: vscode_swarm_store::InstanceResources {
                        requested: vscode_swarm_store::ResourceConfig::default(),
                        used: vscode_swarm_store::ResourceUsage::default(),
                    },
                    network: vscode_swarm_store::InstanceNetwork::default(),
                    metadata,
                    created_at: created,
                    updated_at: created,
                }
            })
            .collect()
    }

    fn names(instances: &[VSCodeInstance]) -> Vec<&str> {
        instances.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn empty_filter_returns_everything() {
        let all = fixture();
        assert_eq!(InstanceFilter::default().apply(all.clone()), all);
    }

    #[test]
    fn status_and_tags_commute() {
        let all = fixture();
        let by_status = InstanceFilter::default().with_status(InstanceStatus::Running);
        let by_tag = InstanceFilter::default().with_tag("team", "frontend");

        let status_then_tag = by_tag.apply(by_status.apply(all.clone()));
        let tag_then_status = by_status.apply(by_tag.apply(all.clone()));
        let combined = InstanceFilter::default()
            .with_status(InstanceStatus::Running)
            .with_tag("team", "frontend")
            .apply(all);

        assert_eq!(status_then_tag, tag_then_status);
        assert_eq!(status_then_tag, combined);
        assert_eq!(names(&combined), vec!["web-1", "web-2"]);
    }

    #[test]
    fn pagination_equals_slicing() {
        let all = fixture();
        for offset in 0..=all.len() + 1 {
            for limit in 0..=all.len() + 1 {
                let page = InstanceFilter::default().page(offset, limit).apply(all.clone());
                let start = offset.min(all.len());
                let end = (offset + limit).min(all.len());
                assert_eq!(page, all[start..end].to_vec(), "offset {offset} limit {limit}");
            }
        }
    }

    #[test]
    fn status_set_with_offset_and_limit() {
        let filter = InstanceFilter::default()
            .with_statuses([InstanceStatus::Running, InstanceStatus::Failed])
            .page(1, 2);
        assert_eq!(names(&filter.apply(fixture())), vec!["web-2", "api-2"]);
    }

    #[test]
    fn name_and_time_bounds_are_inclusive() {
        let all = fixture();
        let second = all[1].created_at;
        let third = all[2].created_at;

        let filter = InstanceFilter {
            created_after: Some(second),
            created_before: Some(third),
            ..InstanceFilter::default()
        };
        assert_eq!(names(&filter.apply(all.clone())), vec!["api-1", "web-2"]);

        let filter = InstanceFilter::default().with_name("api");
        assert_eq!(names(&filter.apply(all)), vec!["api-1", "api-2"]);
    }

    #[test]
    fn deserializes_scalar_or_set_status() {
        let scalar: InstanceFilter =
            serde_json::from_value(serde_json::json!({"status": "running"})).unwrap();
        assert_eq!(scalar.status, Some(StatusFilter::One(InstanceStatus::Running)));

        let set: InstanceFilter = serde_json::from_value(
            serde_json::json!({"status": ["running", "failed"], "namePattern": "web"}),
        )
        .unwrap();
        assert_eq!(
            set.status,
            Some(StatusFilter::Any(vec![InstanceStatus::Running, InstanceStatus::Failed]))
        );
        assert_eq!(set.name_pattern.as_deref(), Some("web"));
    }
}
