use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{Worker, WorkerStatus};

/// Worker筛选条件
///
/// 所有条件取交集；标签和能力按集合包含匹配。
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WorkerFilter {
    pub zone: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    pub min_status: Option<WorkerStatus>,
    pub min_available_cpu: Option<u32>,
    pub min_available_memory_mb: Option<u64>,
}

impl WorkerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    pub fn min_status(mut self, status: WorkerStatus) -> Self {
        self.min_status = Some(status);
        self
    }

    pub fn min_available(mut self, cpu_cores: u32, memory_mb: u64) -> Self {
        self.min_available_cpu = Some(cpu_cores);
        self.min_available_memory_mb = Some(memory_mb);
        self
    }

    /// 判断Worker是否满足全部条件，调用方需先应用惰性过期
    pub fn matches(&self, worker: &Worker) -> bool {
        if let Some(zone) = &self.zone {
            if &worker.zone != zone {
                return false;
            }
        }

        if !self
            .labels
            .iter()
            .all(|(key, value)| worker.labels.get(key) == Some(value))
        {
            return false;
        }

        if !self.capabilities.is_subset(&worker.capabilities) {
            return false;
        }

        if let Some(min_status) = self.min_status {
            if worker.status < min_status {
                return false;
            }
        }

        if let Some(cpu) = self.min_available_cpu {
            if worker.resources.available_cpu() < cpu {
                return false;
            }
        }

        if let Some(memory) = self.min_available_memory_mb {
            if worker.resources.available_memory_mb() < memory {
                return false;
            }
        }

        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ResourceCapacity, ResourceRequest, WorkerRegistration};

    fn worker(zone: &str, caps: &[&str], labels: &[(&str, &str)]) -> Worker {
        Worker::new(WorkerRegistration {
            worker_id: "w1".to_string(),
            hostname: "host-1".to_string(),
            address: "10.0.0.1".to_string(),
            zone: zone.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            capabilities: caps.iter().map(|c| c.to_string()).collect(),
            capacity: ResourceCapacity {
                cpu_cores: 8,
                memory_mb: 8192,
                disk_mb: 0,
                max_sandboxes: 4,
            },
        })
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        assert!(WorkerFilter::new().matches(&worker("a", &[], &[])));
    }

    #[test]
    fn test_conjunctive_matching() {
        let w = worker("zone-a", &["firecracker", "process"], &[("gpu", "false")]);

        let filter = WorkerFilter::new()
            .zone("zone-a")
            .capability("firecracker")
            .label("gpu", "false");
        assert!(filter.matches(&w));

        let wrong_zone = filter.clone().zone("zone-b");
        assert!(!wrong_zone.matches(&w));

        let missing_cap = WorkerFilter::new().capability("docker");
        assert!(!missing_cap.matches(&w));

        let wrong_label = WorkerFilter::new().label("gpu", "true");
        assert!(!wrong_label.matches(&w));
    }

    #[test]
    fn test_min_status_and_available_resources() {
        let mut w = worker("a", &[], &[]);
        w.resources.allocate(&ResourceRequest::new(6, 4096));

        assert!(WorkerFilter::new().min_available(2, 4096).matches(&w));
        assert!(!WorkerFilter::new().min_available(3, 0).matches(&w));

        w.status = WorkerStatus::Draining;
        assert!(!WorkerFilter::new()
            .min_status(WorkerStatus::Active)
            .matches(&w));
        assert!(WorkerFilter::new()
            .min_status(WorkerStatus::Draining)
            .matches(&w));
    }
}
