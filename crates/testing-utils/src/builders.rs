//! Test data builders with sensible defaults

use std::collections::{BTreeMap, BTreeSet};

use vmfleet_core::models::{
    ResourceCapacity, SandboxConfig, Task, ToolRequest, WorkerRegistration,
};

/// Builder for creating test WorkerRegistration entities
pub struct WorkerRegistrationBuilder {
    registration: WorkerRegistration,
}

impl WorkerRegistrationBuilder {
    pub fn new(worker_id: &str) -> Self {
        Self {
            registration: WorkerRegistration {
                worker_id: worker_id.to_string(),
                hostname: format!("{worker_id}.test"),
                address: "127.0.0.1".to_string(),
                zone: "zone-a".to_string(),
                labels: BTreeMap::new(),
                capabilities: BTreeSet::from(["mock".to_string()]),
                capacity: ResourceCapacity {
                    cpu_cores: 4,
                    memory_mb: 4096,
                    disk_mb: 10_240,
                    max_sandboxes: 8,
                },
            },
        }
    }

    pub fn with_zone(mut self, zone: &str) -> Self {
        self.registration.zone = zone.to_string();
        self
    }

    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.registration
            .labels
            .insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_capability(mut self, capability: &str) -> Self {
        self.registration
            .capabilities
            .insert(capability.to_string());
        self
    }

    pub fn with_capacity(mut self, cpu_cores: u32, memory_mb: u64) -> Self {
        self.registration.capacity.cpu_cores = cpu_cores;
        self.registration.capacity.memory_mb = memory_mb;
        self
    }

    pub fn with_disk(mut self, disk_mb: u64) -> Self {
        self.registration.capacity.disk_mb = disk_mb;
        self
    }

    pub fn with_max_sandboxes(mut self, max_sandboxes: u32) -> Self {
        self.registration.capacity.max_sandboxes = max_sandboxes;
        self
    }

    pub fn build(self) -> WorkerRegistration {
        self.registration
    }
}

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(task_type: &str) -> Self {
        Self {
            task: Task::new(
                format!("task-{}", &uuid::Uuid::new_v4().to_string()[..8]),
                task_type,
                serde_json::json!({}),
            ),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.task.payload = payload;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Builder for creating test SandboxConfig entities
pub struct SandboxConfigBuilder {
    config: SandboxConfig,
}

impl SandboxConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SandboxConfig {
                include_default_tools: false,
                ..Default::default()
            },
        }
    }

    pub fn with_resources(mut self, vcpus: u32, memory_mb: u64) -> Self {
        self.config.vcpus = vcpus;
        self.config.memory_mb = memory_mb;
        self
    }

    pub fn with_image(mut self, image: &str) -> Self {
        self.config.image = image.to_string();
        self
    }

    pub fn with_tool(mut self, tool: &str) -> Self {
        self.config.tools.push(ToolRequest::parse(tool));
        self
    }

    pub fn with_default_tools(mut self) -> Self {
        self.config.include_default_tools = true;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.config.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> SandboxConfig {
        self.config
    }
}

impl Default for SandboxConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
