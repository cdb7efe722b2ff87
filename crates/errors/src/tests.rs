#[cfg(test)]
mod error_tests {
    use crate::*;

    #[test]
    fn test_fleet_error_display() {
        let worker_error = FleetError::worker_not_found("worker-1");
        assert_eq!(worker_error.to_string(), "Worker未找到: worker-1");

        let sandbox_error = FleetError::sandbox_not_found("sb-1");
        assert_eq!(sandbox_error.to_string(), "沙箱未找到: sb-1");

        let duplicate = FleetError::DuplicateHandler {
            task_type: "sandbox-create".to_string(),
        };
        assert_eq!(duplicate.to_string(), "任务类型 sandbox-create 已注册处理器");

        let install = FleetError::InstallFailed {
            tool: "bun".to_string(),
            reason: "exit code 1".to_string(),
        };
        assert_eq!(install.to_string(), "工具 bun 安装失败: exit code 1");

        let bootstrap = FleetError::BootstrapTimeout { timeout_ms: 500 };
        assert_eq!(bootstrap.to_string(), "沙箱引导超时: 已超过 500ms");

        let busy = FleetError::Busy {
            sandbox_id: "sb-2".to_string(),
        };
        assert_eq!(busy.to_string(), "沙箱 sb-2 正忙");
    }

    #[test]
    fn test_error_classification() {
        assert!(FleetError::Storage("down".to_string()).is_retryable());
        assert!(FleetError::CapacityExceeded("cpu".to_string()).is_retryable());
        assert!(!FleetError::worker_not_found("w").is_retryable());

        assert!(FleetError::Internal("boom".to_string()).is_fatal());
        assert!(FleetError::ResourceExhausted("vsock".to_string()).is_fatal());
        assert!(!FleetError::Timeout("x".to_string()).is_fatal());

        assert!(FleetError::Timeout("x".to_string()).is_outcome_unknown());
        assert!(FleetError::BootstrapTimeout { timeout_ms: 1 }.is_outcome_unknown());
        assert!(!FleetError::BackendFailure("x".to_string()).is_outcome_unknown());

        assert!(FleetError::task_not_found("t-1").is_not_found());
    }

    #[test]
    fn test_install_failed_is_distinct_from_bootstrap_timeout() {
        let install = FleetError::InstallFailed {
            tool: "git".to_string(),
            reason: "verify failed".to_string(),
        };
        assert!(matches!(install, FleetError::InstallFailed { ref tool, .. } if tool == "git"));
        assert!(!install.is_outcome_unknown());
    }

    #[test]
    fn test_from_serde_json_error() {
        let err = serde_json::from_str::<serde_json::Value>("{invalid").unwrap_err();
        let fleet_error: FleetError = err.into();
        assert!(matches!(fleet_error, FleetError::Serialization(_)));
    }

    #[test]
    fn test_user_message() {
        assert_eq!(
            FleetError::CapacityExceeded("mem".to_string()).user_message(),
            "集群容量不足，请稍后重试"
        );
        assert_eq!(
            FleetError::Configuration("x".to_string()).user_message(),
            "系统繁忙，请稍后重试"
        );
    }
}
