//! 沙箱引导：在交给调用方之前安装默认工具和额外请求的工具
//!
//! 工具逐个安装，每个工具先执行安装脚本再执行校验命令，两者都必须以0退出，
//! 否则返回指明工具名的 `InstallFailed`。整个引导过程受一个总超时约束，
//! 超时返回 `BootstrapTimeout`。

use std::collections::BTreeMap;
use std::time::Duration;

use tracing::{debug, info};

use vmfleet_core::config::{SandboxSettings, ToolRecipeConfig};
use vmfleet_core::models::{BackendHandle, CommandRequest, SandboxConfig, ToolRequest};
use vmfleet_core::traits::SandboxBackend;
use vmfleet_errors::{FleetError, FleetResult};

const VERSION_PLACEHOLDER: &str = "{version}";

/// 工具安装配方
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRecipe {
    pub name: String,
    pub install: String,
    pub verify: String,
    pub default_version: Option<String>,
}

impl ToolRecipe {
    pub fn new(name: &str, install: &str, verify: &str) -> Self {
        Self {
            name: name.to_string(),
            install: install.to_string(),
            verify: verify.to_string(),
            default_version: None,
        }
    }

    pub fn with_default_version(mut self, version: &str) -> Self {
        self.default_version = Some(version.to_string());
        self
    }

    /// 代入版本号，返回 (安装脚本, 校验命令)
    pub fn render(&self, version: Option<&str>) -> FleetResult<(String, String)> {
        let version = version.or(self.default_version.as_deref());
        let needs_version =
            self.install.contains(VERSION_PLACEHOLDER) || self.verify.contains(VERSION_PLACEHOLDER);

        match (needs_version, version) {
            (true, None) => Err(FleetError::InstallFailed {
                tool: self.name.clone(),
                reason: "配方需要版本号，但既没有指定也没有默认版本".to_string(),
            }),
            (true, Some(version)) => Ok((
                self.install.replace(VERSION_PLACEHOLDER, version),
                self.verify.replace(VERSION_PLACEHOLDER, version),
            )),
            (false, _) => Ok((self.install.clone(), self.verify.clone())),
        }
    }
}

/// 工具配方目录
#[derive(Debug, Clone)]
pub struct ToolCatalog {
    recipes: BTreeMap<String, ToolRecipe>,
}

impl ToolCatalog {
    /// 内置的 git、curl、node、bun、python3 配方
    pub fn builtin() -> Self {
        let recipes = [
            ToolRecipe::new(
                "git",
                "command -v git >/dev/null 2>&1 || (apt-get update -qq && apt-get install -y -qq git)",
                "git --version",
            ),
            ToolRecipe::new(
                "curl",
                "command -v curl >/dev/null 2>&1 || (apt-get update -qq && apt-get install -y -qq curl)",
                "curl --version",
            ),
            ToolRecipe::new(
                "node",
                "command -v node >/dev/null 2>&1 || (curl -fsSL https://deb.nodesource.com/setup_{version}.x | bash - && apt-get install -y -qq nodejs)",
                "node --version",
            )
            .with_default_version("20"),
            ToolRecipe::new(
                "bun",
                "test -x \"$HOME/.bun/bin/bun\" || curl -fsSL https://bun.sh/install | bash -s \"bun-v{version}\"",
                "\"$HOME/.bun/bin/bun\" --version",
            )
            .with_default_version("1.1.38"),
            ToolRecipe::new(
                "python3",
                "command -v python3 >/dev/null 2>&1 || (apt-get update -qq && apt-get install -y -qq python3)",
                "python3 --version",
            ),
        ];

        Self {
            recipes: recipes
                .into_iter()
                .map(|recipe| (recipe.name.clone(), recipe))
                .collect(),
        }
    }

    /// 内置配方加上配置中的扩展，同名配置覆盖内置配方
    pub fn from_settings(settings: &SandboxSettings) -> Self {
        let mut catalog = Self::builtin();
        for (name, recipe) in &settings.tool_catalog {
            catalog.insert(Self::recipe_from_config(name, recipe));
        }
        catalog
    }

    fn recipe_from_config(name: &str, config: &ToolRecipeConfig) -> ToolRecipe {
        ToolRecipe {
            name: name.to_string(),
            install: config.install.clone(),
            verify: config.verify.clone(),
            default_version: config.default_version.clone(),
        }
    }

    pub fn insert(&mut self, recipe: ToolRecipe) {
        self.recipes.insert(recipe.name.clone(), recipe);
    }

    pub fn get(&self, name: &str) -> Option<&ToolRecipe> {
        self.recipes.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.recipes.keys().cloned().collect()
    }
}

/// 一个已解析的安装步骤
#[derive(Debug, Clone, PartialEq)]
pub struct InstallStep {
    pub tool: ToolRequest,
    pub install: String,
    pub verify: String,
}

pub struct BootstrapInstaller {
    catalog: ToolCatalog,
    default_tools: Vec<ToolRequest>,
    timeout: Duration,
}

impl BootstrapInstaller {
    pub fn new(catalog: ToolCatalog, default_tools: Vec<ToolRequest>, timeout: Duration) -> Self {
        Self {
            catalog,
            default_tools,
            timeout,
        }
    }

    pub fn from_settings(settings: &SandboxSettings) -> Self {
        Self::new(
            ToolCatalog::from_settings(settings),
            settings
                .default_tools
                .iter()
                .map(|spec| ToolRequest::parse(spec))
                .collect(),
            settings.bootstrap_timeout(),
        )
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// 合并默认工具与请求的工具并去重
    ///
    /// 保持首次出现的顺序；同名工具后出现的版本号覆盖前面未指定的版本。
    pub fn plan(&self, config: &SandboxConfig) -> FleetResult<Vec<InstallStep>> {
        let defaults: &[ToolRequest] = if config.include_default_tools {
            self.default_tools.as_slice()
        } else {
            &[]
        };

        let mut tools: Vec<ToolRequest> = Vec::new();
        for request in defaults.iter().chain(config.tools.iter()) {
            match tools.iter_mut().find(|t| t.name == request.name) {
                Some(existing) => {
                    if request.version.is_some() {
                        existing.version = request.version.clone();
                    }
                }
                None => tools.push(request.clone()),
            }
        }

        tools
            .into_iter()
            .map(|tool| {
                let recipe = self
                    .catalog
                    .get(&tool.name)
                    .ok_or_else(|| FleetError::InstallFailed {
                        tool: tool.name.clone(),
                        reason: "工具目录中没有该工具的配方".to_string(),
                    })?;
                let (install, verify) = recipe.render(tool.version.as_deref())?;
                Ok(InstallStep {
                    tool,
                    install,
                    verify,
                })
            })
            .collect()
    }

    /// 按顺序安装全部工具，返回已安装的工具名
    pub async fn run(
        &self,
        backend: &dyn SandboxBackend,
        handle: &BackendHandle,
        config: &SandboxConfig,
    ) -> FleetResult<Vec<String>> {
        let steps = self.plan(config)?;
        if steps.is_empty() {
            return Ok(Vec::new());
        }

        info!(
            sandbox_id = %handle.sandbox_id,
            tools = ?steps.iter().map(|s| s.tool.name.as_str()).collect::<Vec<_>>(),
            timeout_ms = self.timeout.as_millis() as u64,
            "开始沙箱引导"
        );

        let installation = async {
            let mut installed = Vec::with_capacity(steps.len());
            for step in &steps {
                Self::run_step(backend, handle, &step.tool.name, &step.install, "安装").await?;
                Self::run_step(backend, handle, &step.tool.name, &step.verify, "校验").await?;
                debug!(sandbox_id = %handle.sandbox_id, tool = %step.tool.name, "工具安装完成");
                installed.push(step.tool.name.clone());
            }
            Ok::<_, FleetError>(installed)
        };

        match tokio::time::timeout(self.timeout, installation).await {
            Ok(result) => result,
            Err(_) => Err(FleetError::BootstrapTimeout {
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }

    async fn run_step(
        backend: &dyn SandboxBackend,
        handle: &BackendHandle,
        tool: &str,
        script: &str,
        phase: &str,
    ) -> FleetResult<()> {
        let output = backend
            .command(handle, &CommandRequest::shell(script))
            .await
            .map_err(|e| FleetError::InstallFailed {
                tool: tool.to_string(),
                reason: format!("{phase}命令执行出错: {e}"),
            })?;

        if output.success() {
            return Ok(());
        }

        let detail = output.stderr.trim();
        Err(FleetError::InstallFailed {
            tool: tool.to_string(),
            reason: if detail.is_empty() {
                format!("{phase}命令退出码 {}", output.exit_code)
            } else {
                format!("{phase}命令退出码 {}: {detail}", output.exit_code)
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmfleet_core::models::SandboxSpec;
    use vmfleet_testing_utils::{MockSandboxBackend, SandboxConfigBuilder};

    fn installer(timeout: Duration) -> BootstrapInstaller {
        BootstrapInstaller::new(
            ToolCatalog::builtin(),
            vec![ToolRequest::new("git"), ToolRequest::new("curl")],
            timeout,
        )
    }

    async fn booted(backend: &MockSandboxBackend, id: &str) -> BackendHandle {
        let handle = backend
            .create(&SandboxSpec::from_config(id, &SandboxConfig::default()))
            .await
            .unwrap();
        backend.boot(&handle).await.unwrap();
        handle
    }

    #[test]
    fn test_plan_merges_defaults_and_requests() {
        let config = SandboxConfigBuilder::new()
            .with_default_tools()
            .with_tool("bun@1.0.0")
            .with_tool("git")
            .build();
        let steps = installer(Duration::from_secs(1)).plan(&config).unwrap();
        let names: Vec<&str> = steps.iter().map(|s| s.tool.name.as_str()).collect();
        assert_eq!(names, vec!["git", "curl", "bun"]);
        assert!(steps[2].install.contains("bun-v1.0.0"));
    }

    #[test]
    fn test_plan_without_defaults_and_version_pin_override() {
        let config = SandboxConfigBuilder::new().with_tool("node").with_tool("node@18").build();
        let steps = installer(Duration::from_secs(1)).plan(&config).unwrap();
        assert_eq!(steps.len(), 1);
        assert!(steps[0].install.contains("setup_18.x"));
    }

    #[test]
    fn test_unknown_tool_is_install_failure() {
        let config = SandboxConfigBuilder::new().with_tool("cobol").build();
        match installer(Duration::from_secs(1)).plan(&config) {
            Err(FleetError::InstallFailed { tool, .. }) => assert_eq!(tool, "cobol"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_catalog_from_settings_overrides_builtin() {
        let mut settings = SandboxSettings::default();
        settings.tool_catalog.insert(
            "git".to_string(),
            ToolRecipeConfig {
                install: "true".to_string(),
                verify: "git version".to_string(),
                default_version: None,
            },
        );
        settings.tool_catalog.insert(
            "deno".to_string(),
            ToolRecipeConfig {
                install: "install-deno {version}".to_string(),
                verify: "deno --version".to_string(),
                default_version: Some("1.40".to_string()),
            },
        );

        let catalog = ToolCatalog::from_settings(&settings);
        assert_eq!(catalog.get("git").unwrap().install, "true");
        let (install, _) = catalog.get("deno").unwrap().render(None).unwrap();
        assert_eq!(install, "install-deno 1.40");
        assert!(catalog.names().contains(&"python3".to_string()));
    }

    #[tokio::test]
    async fn test_run_installs_then_verifies_each_tool() {
        let backend = MockSandboxBackend::new();
        let handle = booted(&backend, "sb-1").await;
        let config = SandboxConfigBuilder::new()
            .with_default_tools()
            .with_tool("python3")
            .build();

        let installed = installer(Duration::from_secs(5))
            .run(&backend, &handle, &config)
            .await
            .unwrap();
        assert_eq!(installed, vec!["git", "curl", "python3"]);

        let commands = backend.commands_for("sb-1");
        assert_eq!(commands.len(), 6);
        assert!(commands[1].contains("git --version"));
        assert!(commands[5].contains("python3 --version"));
    }

    #[tokio::test]
    async fn test_failed_verify_names_the_tool() {
        let backend = MockSandboxBackend::new().with_command_exit("curl --version", 127);
        let handle = booted(&backend, "sb-1").await;
        let config = SandboxConfigBuilder::new().with_default_tools().build();

        let err = installer(Duration::from_secs(5))
            .run(&backend, &handle, &config)
            .await
            .unwrap_err();
        match err {
            FleetError::InstallFailed { tool, reason } => {
                assert_eq!(tool, "curl");
                assert!(reason.contains("127"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_aggregate_timeout_is_distinct_from_install_failure() {
        let backend = MockSandboxBackend::new().with_command_delay("bun.sh", Duration::from_secs(5));
        let handle = booted(&backend, "sb-1").await;
        let config = SandboxConfigBuilder::new()
            .with_tool("git")
            .with_tool("bun")
            .build();

        let err = installer(Duration::from_millis(100))
            .run(&backend, &handle, &config)
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::BootstrapTimeout { timeout_ms: 100 }));
    }
}
