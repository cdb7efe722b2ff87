use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use vmfleet_core::models::{BackendHandle, CommandOutput, CommandRequest, SandboxSpec};
use vmfleet_core::traits::SandboxBackend;
use vmfleet_errors::{FleetError, FleetResult};

/// 实例目录中的元数据文件，重启后据此发现遗留实例
const MARKER_FILE: &str = ".vmfleet-sandbox.json";
const BACKEND_NAME: &str = "process";

struct ProcessInstance {
    dir: PathBuf,
    env: std::collections::BTreeMap<String, String>,
    booted: bool,
}

/// 本地进程后端
///
/// 每个沙箱对应根目录下的一个私有工作目录，命令以 `tokio::process` 运行，
/// 工作目录和 `HOME` 都指向该目录。只提供文件系统层面的隔离，
/// 适合开发和测试环境，硬件隔离由外部的虚拟化后端提供。
pub struct LocalProcessBackend {
    root: PathBuf,
    instances: RwLock<HashMap<String, ProcessInstance>>,
}

impl LocalProcessBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            instances: RwLock::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn instance_dir(&self, sandbox_id: &str) -> FleetResult<PathBuf> {
        if sandbox_id.is_empty()
            || sandbox_id.contains('/')
            || sandbox_id.contains('\\')
            || sandbox_id.starts_with('.')
        {
            return Err(FleetError::backend_error(format!(
                "非法的沙箱ID: {sandbox_id}"
            )));
        }
        Ok(self.root.join(sandbox_id))
    }

    fn handle_for(sandbox_id: &str, dir: &Path) -> BackendHandle {
        BackendHandle {
            sandbox_id: sandbox_id.to_string(),
            backend: BACKEND_NAME.to_string(),
            instance: dir.display().to_string(),
        }
    }
}

#[async_trait]
impl SandboxBackend for LocalProcessBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn create(&self, spec: &SandboxSpec) -> FleetResult<BackendHandle> {
        let dir = self.instance_dir(&spec.sandbox_id)?;
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            FleetError::ResourceExhausted(format!("创建沙箱目录 {} 失败: {e}", dir.display()))
        })?;

        let marker = serde_json::to_string_pretty(spec)?;
        tokio::fs::write(dir.join(MARKER_FILE), marker)
            .await
            .map_err(|e| FleetError::backend_error(format!("写入沙箱元数据失败: {e}")))?;

        self.instances.write().await.insert(
            spec.sandbox_id.clone(),
            ProcessInstance {
                dir: dir.clone(),
                env: spec.env.clone(),
                booted: false,
            },
        );

        debug!(sandbox_id = %spec.sandbox_id, dir = %dir.display(), "创建进程沙箱目录");
        Ok(Self::handle_for(&spec.sandbox_id, &dir))
    }

    async fn boot(&self, handle: &BackendHandle) -> FleetResult<()> {
        let mut instances = self.instances.write().await;
        let instance = instances
            .get_mut(&handle.sandbox_id)
            .ok_or_else(|| FleetError::backend_error(format!("沙箱 {} 未创建", handle.sandbox_id)))?;
        instance.booted = true;
        Ok(())
    }

    async fn probe(&self, handle: &BackendHandle) -> FleetResult<()> {
        let dir = {
            let instances = self.instances.read().await;
            match instances.get(&handle.sandbox_id) {
                Some(instance) if instance.booted => instance.dir.clone(),
                Some(_) => return Err(FleetError::backend_error("沙箱尚未启动")),
                None => {
                    return Err(FleetError::backend_error(format!(
                        "沙箱 {} 不存在",
                        handle.sandbox_id
                    )))
                }
            }
        };

        let status = Command::new("sh")
            .arg("-c")
            .arg("true")
            .current_dir(&dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| FleetError::backend_error(format!("探活命令启动失败: {e}")))?;

        if status.success() {
            Ok(())
        } else {
            Err(FleetError::backend_error(format!("探活命令退出码: {status}")))
        }
    }

    async fn command(
        &self,
        handle: &BackendHandle,
        request: &CommandRequest,
    ) -> FleetResult<CommandOutput> {
        let (dir, base_env) = {
            let instances = self.instances.read().await;
            let instance = instances.get(&handle.sandbox_id).ok_or_else(|| {
                FleetError::backend_error(format!("沙箱 {} 不存在", handle.sandbox_id))
            })?;
            if !instance.booted {
                return Err(FleetError::backend_error("沙箱尚未启动"));
            }
            (instance.dir.clone(), instance.env.clone())
        };

        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args)
            .current_dir(&dir)
            .env("HOME", &dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in base_env.iter().chain(request.env.iter()) {
            cmd.env(key, value);
        }

        let started = Instant::now();
        let child = cmd
            .spawn()
            .map_err(|e| FleetError::backend_error(format!("启动命令 {} 失败: {e}", request.command)))?;

        let output = match request.timeout {
            Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
                .await
                .map_err(|_| {
                    FleetError::Timeout(format!(
                        "沙箱 {} 中的命令 {} 超过 {}ms",
                        handle.sandbox_id,
                        request.command,
                        timeout.as_millis()
                    ))
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| FleetError::backend_error(format!("等待命令结束失败: {e}")))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn destroy(&self, handle: &BackendHandle) -> FleetResult<()> {
        let removed = self.instances.write().await.remove(&handle.sandbox_id);
        let dir = match removed {
            Some(instance) => instance.dir,
            None => self.instance_dir(&handle.sandbox_id)?,
        };

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {
                info!(sandbox_id = %handle.sandbox_id, "删除进程沙箱目录");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FleetError::backend_error(format!(
                "删除沙箱目录 {} 失败: {e}",
                dir.display()
            ))),
        }
    }

    async fn list(&self) -> FleetResult<Vec<BackendHandle>> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(FleetError::backend_error(format!(
                    "读取沙箱根目录 {} 失败: {e}",
                    self.root.display()
                )))
            }
        };

        let mut handles = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| FleetError::backend_error(format!("遍历沙箱根目录失败: {e}")))?
        {
            let dir = entry.path();
            if !tokio::fs::try_exists(dir.join(MARKER_FILE))
                .await
                .unwrap_or(false)
            {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(sandbox_id) => handles.push(Self::handle_for(&sandbox_id, &dir)),
                Err(name) => warn!(?name, "忽略非UTF-8的沙箱目录"),
            }
        }
        handles.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        Ok(handles)
    }
}
