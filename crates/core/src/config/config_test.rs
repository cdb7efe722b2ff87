use crate::config::*;
use std::io::Write;
use std::sync::Mutex;
use tempfile::NamedTempFile;

static ENV_LOCK: Mutex<()> = Mutex::new(());

#[test]
fn test_default_config() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());

    assert_eq!(config.backend.kind, BackendKind::Memory);
    assert_eq!(config.queue.concurrency, 4);
    assert_eq!(config.queue.default_max_retry, 3);
    assert_eq!(config.registry.deregister_threshold_seconds, 60);
    assert_eq!(config.sandbox.default_tools, vec!["git", "curl"]);
}

#[test]
fn test_config_from_partial_toml() {
    let toml_content = r#"
[backend]
kind = "redis"

[backend.redis]
url = "redis://cache:6379/2"
key_prefix = "fleet-test"

[queue]
concurrency = 8

[worker]
worker_id = "worker-a"
cpu_cores = 16
labels = { rack = "r1" }

[sandbox.tool_catalog.rg]
install = "cargo install ripgrep --version {version}"
verify = "rg --version"
default_version = "14.1.0"
"#;

    let config = AppConfig::from_toml(toml_content).unwrap();
    assert_eq!(config.backend.kind, BackendKind::Redis);
    assert_eq!(config.backend.redis.key_prefix, "fleet-test");
    assert_eq!(config.backend.redis.connection_timeout_seconds, 10);
    assert_eq!(config.queue.concurrency, 8);
    assert_eq!(config.queue.poll_interval_ms, 200);
    assert_eq!(config.worker.worker_id, "worker-a");
    assert_eq!(config.worker.labels.get("rack").map(String::as_str), Some("r1"));
    assert_eq!(config.worker.capacity().cpu_cores, 16);
    let recipe = config.sandbox.tool_catalog.get("rg").unwrap();
    assert_eq!(recipe.default_version.as_deref(), Some("14.1.0"));
}

#[test]
fn test_toml_round_trip_keeps_values() {
    let mut config = AppConfig::default();
    config.queue.retry.backoff_multiplier = 3.0;
    config.observability.log_format = "json".to_string();

    let text = config.to_toml().unwrap();
    let parsed = AppConfig::from_toml(&text).unwrap();
    assert_eq!(parsed.queue.retry.backoff_multiplier, 3.0);
    assert_eq!(parsed.observability.log_format, "json");
}

#[test]
fn test_validation_failures() {
    let mut config = AppConfig::default();
    config.queue.concurrency = 0;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.registry.deregister_threshold_seconds = config.registry.heartbeat_interval_seconds;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.backend.kind = BackendKind::Redis;
    config.backend.redis.url = "http://localhost:6379".to_string();
    assert!(config.validate().is_err());

    // 内存后端不校验Redis配置
    let mut config = AppConfig::default();
    config.backend.redis.url = "http://localhost:6379".to_string();
    assert!(config.validate().is_ok());

    let mut config = AppConfig::default();
    config.observability.log_level = "verbose".to_string();
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.queue.retry.jitter_factor = 1.5;
    assert!(config.validate().is_err());

    let mut config = AppConfig::default();
    config.sandbox.tool_catalog.insert(
        "empty".to_string(),
        ToolRecipeConfig {
            install: " ".to_string(),
            verify: "true".to_string(),
            default_version: None,
        },
    );
    assert!(config.validate().is_err());
}

#[test]
fn test_load_from_file_with_env_override() {
    let _guard = ENV_LOCK.lock().unwrap();

    let mut file = NamedTempFile::new().unwrap();
    writeln!(
        file,
        r#"
[queue]
concurrency = 2
default_max_retry = 5

[worker]
worker_id = "file-worker"
"#
    )
    .unwrap();
    let path = file.path().to_str().unwrap().to_string();

    std::env::set_var("VMFLEET_QUEUE__CONCURRENCY", "6");
    let result = AppConfig::load(Some(&path));
    std::env::remove_var("VMFLEET_QUEUE__CONCURRENCY");

    let config = result.unwrap();
    assert_eq!(config.queue.concurrency, 6);
    assert_eq!(config.queue.default_max_retry, 5);
    assert_eq!(config.worker.worker_id, "file-worker");
    assert_eq!(config.worker.cpu_cores, 4);
}

#[test]
fn test_load_missing_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    let result = AppConfig::load(Some("/nonexistent/vmfleet.toml"));
    assert!(result.is_err());
    assert!(result.unwrap_err().to_string().contains("配置文件不存在"));
}

#[test]
fn test_sample_config_file_is_valid() {
    let config = AppConfig::from_toml(include_str!("../../../../config/vmfleet.toml")).unwrap();
    assert_eq!(config.backend.kind, BackendKind::Memory);
    assert_eq!(config.worker.labels.get("tier").map(String::as_str), Some("dev"));
    assert!(config.sandbox.tool_catalog.contains_key("jq"));
}
