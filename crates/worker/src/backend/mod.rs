//! 沙箱后端
//!
//! 只随附本地进程后端，虚拟化后端在外部实现 [`SandboxBackend`] 后接入。

pub mod process;

use std::sync::Arc;

use vmfleet_core::config::SandboxSettings;
use vmfleet_core::traits::SandboxBackend;
use vmfleet_errors::{FleetError, FleetResult};

pub use process::LocalProcessBackend;

/// 按配置选择后端，启动时调用一次
pub fn create_backend(settings: &SandboxSettings) -> FleetResult<Arc<dyn SandboxBackend>> {
    match settings.backend.as_str() {
        "process" => Ok(Arc::new(LocalProcessBackend::new(&settings.workdir_root))),
        other => Err(FleetError::config_error(format!(
            "不支持的沙箱后端: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_backend_by_name() {
        let settings = SandboxSettings::default();
        assert_eq!(create_backend(&settings).unwrap().name(), "process");

        let settings = SandboxSettings {
            backend: "firecracker".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_backend(&settings),
            Err(FleetError::Configuration(_))
        ));
    }
}
