use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Worker节点信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Worker {
    pub id: String,
    pub hostname: String,
    pub address: String,
    pub status: WorkerStatus,
    pub zone: String,
    pub labels: BTreeMap<String, String>,
    /// 支持的沙箱后端，例如 "process"、"firecracker"
    pub capabilities: BTreeSet<String>,
    pub resources: WorkerResources,
    pub last_seen: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    /// 记录所属进程每次修改时递增
    #[serde(default)]
    pub revision: u64,
}

/// Worker状态
///
/// 排序用于过滤器的最低状态判断：`Offline < Draining < Active`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WorkerStatus {
    #[serde(rename = "OFFLINE")]
    Offline,
    #[serde(rename = "DRAINING")]
    Draining,
    #[serde(rename = "ACTIVE")]
    Active,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Offline => "offline",
            WorkerStatus::Draining => "draining",
            WorkerStatus::Active => "active",
        }
    }
}

/// Worker注册请求
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub worker_id: String,
    pub hostname: String,
    pub address: String,
    pub zone: String,
    pub labels: BTreeMap<String, String>,
    pub capabilities: BTreeSet<String>,
    pub capacity: ResourceCapacity,
}

/// 资源容量
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceCapacity {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub max_sandboxes: u32,
}

/// 资源使用量
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceUsage {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    pub disk_mb: u64,
    pub running_sandboxes: u32,
}

/// 单个沙箱的资源需求
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceRequest {
    pub cpu_cores: u32,
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_mb: u64,
}

impl ResourceRequest {
    pub fn new(cpu_cores: u32, memory_mb: u64) -> Self {
        Self {
            cpu_cores,
            memory_mb,
            disk_mb: 0,
        }
    }

    pub fn with_disk(mut self, disk_mb: u64) -> Self {
        self.disk_mb = disk_mb;
        self
    }
}

/// Worker资源快照
///
/// 可用量只在读取时由 `capacity - usage` 计算，不单独存储，避免计数漂移。
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerResources {
    pub capacity: ResourceCapacity,
    pub usage: ResourceUsage,
}

impl WorkerResources {
    pub fn new(capacity: ResourceCapacity) -> Self {
        Self {
            capacity,
            usage: ResourceUsage::default(),
        }
    }

    pub fn available_cpu(&self) -> u32 {
        self.capacity.cpu_cores.saturating_sub(self.usage.cpu_cores)
    }

    pub fn available_memory_mb(&self) -> u64 {
        self.capacity.memory_mb.saturating_sub(self.usage.memory_mb)
    }

    pub fn available_disk_mb(&self) -> u64 {
        self.capacity.disk_mb.saturating_sub(self.usage.disk_mb)
    }

    pub fn available_sandboxes(&self) -> u32 {
        self.capacity
            .max_sandboxes
            .saturating_sub(self.usage.running_sandboxes)
    }

    /// 检查是否可以分配指定的CPU和内存
    pub fn can_allocate(&self, cpu_cores: u32, memory_mb: u64) -> bool {
        self.can_allocate_request(&ResourceRequest::new(cpu_cores, memory_mb))
    }

    pub fn can_allocate_request(&self, request: &ResourceRequest) -> bool {
        self.is_consistent()
            && self.available_cpu() >= request.cpu_cores
            && self.available_memory_mb() >= request.memory_mb
            && self.available_disk_mb() >= request.disk_mb
            && self.usage.running_sandboxes < self.capacity.max_sandboxes
    }

    /// 每个维度都满足 `used <= capacity`
    pub fn is_consistent(&self) -> bool {
        self.usage.cpu_cores <= self.capacity.cpu_cores
            && self.usage.memory_mb <= self.capacity.memory_mb
            && self.usage.disk_mb <= self.capacity.disk_mb
            && self.usage.running_sandboxes <= self.capacity.max_sandboxes
    }

    /// 占用资源，调用方必须先确认 `can_allocate_request`
    pub fn allocate(&mut self, request: &ResourceRequest) {
        self.usage.cpu_cores += request.cpu_cores;
        self.usage.memory_mb += request.memory_mb;
        self.usage.disk_mb += request.disk_mb;
        self.usage.running_sandboxes += 1;
    }

    /// 释放资源，计数不会低于0
    pub fn release(&mut self, request: &ResourceRequest) {
        self.usage.cpu_cores = self.usage.cpu_cores.saturating_sub(request.cpu_cores);
        self.usage.memory_mb = self.usage.memory_mb.saturating_sub(request.memory_mb);
        self.usage.disk_mb = self.usage.disk_mb.saturating_sub(request.disk_mb);
        self.usage.running_sandboxes = self.usage.running_sandboxes.saturating_sub(1);
    }

    /// CPU使用率（百分比）
    pub fn cpu_load_percentage(&self) -> f64 {
        if self.capacity.cpu_cores == 0 {
            0.0
        } else {
            (self.usage.cpu_cores as f64 / self.capacity.cpu_cores as f64) * 100.0
        }
    }
}

impl Worker {
    /// 创建新的Worker信息
    pub fn new(registration: WorkerRegistration) -> Self {
        let now = Utc::now();
        Self {
            id: registration.worker_id,
            hostname: registration.hostname,
            address: registration.address,
            status: WorkerStatus::Active,
            zone: registration.zone,
            labels: registration.labels,
            capabilities: registration.capabilities,
            resources: WorkerResources::new(registration.capacity),
            last_seen: now,
            started_at: now,
            revision: 0,
        }
    }

    /// 按 `(last_seen, revision)` 判断是否比另一份快照更新
    ///
    /// 心跳相同时只比较修改序号，存储回放的旧快照不会覆盖本地较新的记录。
    pub fn is_newer_than(&self, other: &Worker) -> bool {
        (self.last_seen, self.revision) > (other.last_seen, other.revision)
    }

    /// 心跳是否已超过阈值
    pub fn is_heartbeat_expired(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_seen > threshold
    }

    /// 应用惰性过期后的有效状态
    pub fn effective_status(&self, threshold: Duration, now: DateTime<Utc>) -> WorkerStatus {
        if self.is_heartbeat_expired(threshold, now) {
            WorkerStatus::Offline
        } else {
            self.status
        }
    }

    /// 返回应用惰性过期后的副本
    pub fn with_lazy_expiry(&self, threshold: Duration, now: DateTime<Utc>) -> Self {
        let mut worker = self.clone();
        worker.status = self.effective_status(threshold, now);
        worker
    }

    pub fn is_active(&self) -> bool {
        matches!(self.status, WorkerStatus::Active)
    }
}

/// Worker变更事件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerEvent {
    Joined(Worker),
    Left { worker_id: String },
    Updated(Worker),
}

impl WorkerEvent {
    pub fn worker_id(&self) -> &str {
        match self {
            WorkerEvent::Joined(worker) | WorkerEvent::Updated(worker) => &worker.id,
            WorkerEvent::Left { worker_id } => worker_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capacity(cpu: u32, mem: u64) -> ResourceCapacity {
        ResourceCapacity {
            cpu_cores: cpu,
            memory_mb: mem,
            disk_mb: 10_240,
            max_sandboxes: 8,
        }
    }

    #[test]
    fn test_available_is_derived_from_capacity_and_usage() {
        let mut resources = WorkerResources::new(capacity(4, 4096));
        assert_eq!(resources.available_cpu(), 4);
        assert_eq!(resources.available_memory_mb(), 4096);

        resources.allocate(&ResourceRequest::new(1, 1024));
        assert_eq!(resources.available_cpu(), 3);
        assert_eq!(resources.available_memory_mb(), 3072);
        assert_eq!(resources.usage.running_sandboxes, 1);
    }

    #[test]
    fn test_can_allocate_requires_every_dimension() {
        let resources = WorkerResources::new(capacity(4, 4096));
        assert!(resources.can_allocate(4, 4096));
        assert!(!resources.can_allocate(5, 1));
        assert!(!resources.can_allocate(1, 4097));
        assert!(!resources.can_allocate_request(&ResourceRequest::new(1, 1).with_disk(20_000)));
    }

    #[test]
    fn test_can_allocate_respects_max_sandboxes() {
        let mut resources = WorkerResources::new(ResourceCapacity {
            cpu_cores: 16,
            memory_mb: 16_384,
            disk_mb: 0,
            max_sandboxes: 1,
        });
        assert!(resources.can_allocate(1, 1));
        resources.allocate(&ResourceRequest::new(1, 1));
        assert!(!resources.can_allocate(0, 0));
    }

    #[test]
    fn test_release_saturates_at_zero() {
        let mut resources = WorkerResources::new(capacity(4, 4096));
        resources.release(&ResourceRequest::new(2, 2048));
        assert_eq!(resources.usage, ResourceUsage::default());
        assert!(resources.is_consistent());
    }

    #[test]
    fn test_lazy_expiry_reports_offline() {
        let worker = Worker::new(WorkerRegistration {
            worker_id: "w1".to_string(),
            hostname: "host".to_string(),
            address: "10.0.0.1".to_string(),
            zone: "zone-a".to_string(),
            labels: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            capacity: capacity(4, 4096),
        });
        let later = worker.last_seen + Duration::seconds(120);
        assert_eq!(
            worker.effective_status(Duration::seconds(90), later),
            WorkerStatus::Offline
        );
        assert_eq!(
            worker.effective_status(Duration::seconds(300), later),
            WorkerStatus::Active
        );
        // 惰性过期不修改原记录
        assert_eq!(worker.status, WorkerStatus::Active);
    }

    #[test]
    fn test_newer_snapshot_compares_heartbeat_then_revision() {
        let worker = Worker::new(WorkerRegistration {
            worker_id: "w1".to_string(),
            hostname: "host".to_string(),
            address: "10.0.0.1".to_string(),
            zone: "zone-a".to_string(),
            labels: BTreeMap::new(),
            capabilities: BTreeSet::new(),
            capacity: capacity(4, 4096),
        });

        let mut allocated = worker.clone();
        allocated.revision = 1;
        allocated.resources.allocate(&ResourceRequest::new(1, 512));
        assert!(allocated.is_newer_than(&worker));
        assert!(!worker.is_newer_than(&allocated));
        assert!(!allocated.is_newer_than(&allocated));

        // 更晚的心跳优先于修改序号，重启后的进程从0开始计数
        let mut restarted = worker.clone();
        restarted.last_seen = worker.last_seen + Duration::seconds(1);
        assert!(restarted.is_newer_than(&allocated));
    }

    #[test]
    fn test_status_ordering() {
        assert!(WorkerStatus::Offline < WorkerStatus::Draining);
        assert!(WorkerStatus::Draining < WorkerStatus::Active);
    }
}
