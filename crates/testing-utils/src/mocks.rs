//! Mock implementations with scriptable behaviour
//!
//! 所有mock都使用同步互斥锁保存记录，测试中可以直接读取。

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use vmfleet_core::models::{
    BackendHandle, CommandOutput, CommandRequest, Event, SandboxSpec, Task,
};
use vmfleet_core::traits::{
    EventHandler, RegistryStore, SandboxBackend, StoreChange, TaskContext, TaskHandler,
};
use vmfleet_errors::{FleetError, FleetResult};

use crate::helpers::TestEnv;

/// 记录收到的全部事件
pub struct RecordingEventHandler {
    events: Mutex<Vec<Event>>,
    delay: Option<Duration>,
}

impl RecordingEventHandler {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    /// 每个事件处理前先等待，模拟慢订阅者
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            delay: Some(delay),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn topics(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.topic).collect()
    }

    pub fn count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let this = self;
        TestEnv::wait_for(move || async move { this.count() >= count }, timeout).await
    }
}

impl Default for RecordingEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for RecordingEventHandler {
    async fn handle_event(&self, event: &Event) -> FleetResult<()> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// 总是返回错误或panic的事件处理器
pub struct FailingEventHandler {
    calls: AtomicUsize,
    panic: bool,
}

impl FailingEventHandler {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            panic: false,
        }
    }

    pub fn panicking() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            panic: true,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for FailingEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventHandler for FailingEventHandler {
    async fn handle_event(&self, event: &Event) -> FleetResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panic {
            panic!("handler panicked on {}", event.topic);
        }
        Err(FleetError::Internal(format!("rejected {}", event.topic)))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// 任务处理器单次调用的行为
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerBehavior {
    Succeed,
    Fail,
    Panic,
    /// 等待指定时长后成功
    Sleep(Duration),
}

/// 按脚本依次执行行为的任务处理器，脚本用完后使用兜底行为
pub struct ScriptedTaskHandler {
    script: Mutex<VecDeque<HandlerBehavior>>,
    fallback: HandlerBehavior,
    deliveries: Mutex<Vec<(String, TaskContext)>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: AtomicUsize,
}

impl ScriptedTaskHandler {
    pub fn with_script(script: Vec<HandlerBehavior>, fallback: HandlerBehavior) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            deliveries: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        }
    }

    pub fn succeeding() -> Self {
        Self::with_script(Vec::new(), HandlerBehavior::Succeed)
    }

    pub fn always_failing() -> Self {
        Self::with_script(Vec::new(), HandlerBehavior::Fail)
    }

    /// 前 `times` 次失败，之后成功
    pub fn failing_times(times: usize) -> Self {
        Self::with_script(vec![HandlerBehavior::Fail; times], HandlerBehavior::Succeed)
    }

    pub fn panicking() -> Self {
        Self::with_script(Vec::new(), HandlerBehavior::Panic)
    }

    pub fn sleeping(duration: Duration) -> Self {
        Self::with_script(Vec::new(), HandlerBehavior::Sleep(duration))
    }

    /// 已开始的调用次数
    pub fn calls(&self) -> usize {
        self.deliveries.lock().unwrap().len()
    }

    /// 已返回成功的调用次数
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn deliveries(&self) -> Vec<TaskContext> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(_, ctx)| ctx.clone())
            .collect()
    }

    pub fn task_ids(&self) -> Vec<String> {
        self.deliveries
            .lock()
            .unwrap()
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub async fn wait_for_calls(&self, count: usize, timeout: Duration) -> bool {
        let this = self;
        TestEnv::wait_for(move || async move { this.calls() >= count }, timeout).await
    }

    fn next_behavior(&self) -> HandlerBehavior {
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TaskHandler for ScriptedTaskHandler {
    async fn handle(&self, task: &Task, ctx: &TaskContext) -> FleetResult<serde_json::Value> {
        self.deliveries
            .lock()
            .unwrap()
            .push((task.id.clone(), ctx.clone()));
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        match self.next_behavior() {
            HandlerBehavior::Succeed => {}
            HandlerBehavior::Fail => {
                return Err(FleetError::TaskExecution(format!(
                    "scripted failure on delivery {}",
                    ctx.delivery
                )))
            }
            HandlerBehavior::Panic => panic!("scripted panic for task {}", task.id),
            HandlerBehavior::Sleep(duration) => tokio::time::sleep(duration).await,
        }

        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(serde_json::json!({ "task_id": task.id, "delivery": ctx.delivery }))
    }
}

/// 写入按脚本延迟的注册表存储
///
/// 每次 `put` 从队列头取一个延迟，队列为空时立即写入。不支持TTL。
pub struct DelayedRegistryStore {
    entries: Mutex<HashMap<String, String>>,
    put_delays: Mutex<VecDeque<Duration>>,
    puts: AtomicUsize,
    changes: tokio::sync::broadcast::Sender<StoreChange>,
}

impl DelayedRegistryStore {
    pub fn new() -> Self {
        let (changes, _) = tokio::sync::broadcast::channel(64);
        Self {
            entries: Mutex::new(HashMap::new()),
            put_delays: Mutex::new(VecDeque::new()),
            puts: AtomicUsize::new(0),
            changes,
        }
    }

    /// 追加后续写入的延迟
    pub fn delay_next_puts(&self, delays: impl IntoIterator<Item = Duration>) {
        self.put_delays.lock().unwrap().extend(delays);
    }

    /// 已完成的写入次数
    pub fn puts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.entries.lock().unwrap().get(key).cloned()
    }
}

impl Default for DelayedRegistryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryStore for DelayedRegistryStore {
    async fn put(&self, key: &str, value: &str, _ttl: Option<Duration>) -> FleetResult<()> {
        let delay = self.put_delays.lock().unwrap().pop_front();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.entries
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self.puts.fetch_add(1, Ordering::SeqCst);
        let _ = self.changes.send(StoreChange::Put {
            key: key.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }

    async fn get(&self, key: &str) -> FleetResult<Option<String>> {
        Ok(self.value(key))
    }

    async fn delete(&self, key: &str) -> FleetResult<bool> {
        let existed = self.entries.lock().unwrap().remove(key).is_some();
        if existed {
            let _ = self.changes.send(StoreChange::Deleted {
                key: key.to_string(),
            });
        }
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> FleetResult<Vec<(String, String)>> {
        let mut entries: Vec<(String, String)> = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        entries.sort();
        Ok(entries)
    }

    async fn watch(&self) -> FleetResult<tokio::sync::broadcast::Receiver<StoreChange>> {
        Ok(self.changes.subscribe())
    }

    fn backend_name(&self) -> &'static str {
        "delayed"
    }
}

struct CommandRule {
    pattern: String,
    exit_code: i32,
    delay: Duration,
    stdout: String,
    /// 剩余生效次数，`None` 表示一直生效
    remaining: Option<usize>,
}

/// 可编排的沙箱后端
///
/// 命令按 `command args...` 拼接成一行后与规则做子串匹配，第一个匹配的规则生效，
/// 没有匹配时立即以退出码0返回。
pub struct MockSandboxBackend {
    instances: Mutex<HashMap<String, BackendHandle>>,
    commands: Mutex<Vec<(String, String)>>,
    destroyed: Mutex<Vec<String>>,
    rules: Mutex<Vec<CommandRule>>,
    boot_delay: Mutex<Duration>,
    ready_after: Mutex<Option<Duration>>,
    booted_at: Mutex<HashMap<String, Instant>>,
    fail_create: AtomicBool,
    fail_boot: AtomicBool,
    active_commands: AtomicUsize,
    max_concurrent_commands: AtomicUsize,
}

impl MockSandboxBackend {
    pub fn new() -> Self {
        Self {
            instances: Mutex::new(HashMap::new()),
            commands: Mutex::new(Vec::new()),
            destroyed: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            boot_delay: Mutex::new(Duration::ZERO),
            ready_after: Mutex::new(Some(Duration::ZERO)),
            booted_at: Mutex::new(HashMap::new()),
            fail_create: AtomicBool::new(false),
            fail_boot: AtomicBool::new(false),
            active_commands: AtomicUsize::new(0),
            max_concurrent_commands: AtomicUsize::new(0),
        }
    }

    pub fn with_boot_delay(self, delay: Duration) -> Self {
        *self.boot_delay.lock().unwrap() = delay;
        self
    }

    /// 启动后经过指定时长探活才成功
    pub fn with_ready_after(self, delay: Duration) -> Self {
        *self.ready_after.lock().unwrap() = Some(delay);
        self
    }

    /// 探活永远失败
    pub fn never_ready(self) -> Self {
        *self.ready_after.lock().unwrap() = None;
        self
    }

    pub fn failing_create(self) -> Self {
        self.fail_create.store(true, Ordering::SeqCst);
        self
    }

    pub fn failing_boot(self) -> Self {
        self.fail_boot.store(true, Ordering::SeqCst);
        self
    }

    /// 匹配的命令以指定退出码结束
    pub fn with_command_exit(self, pattern: &str, exit_code: i32) -> Self {
        self.add_rule(pattern, exit_code, Duration::ZERO, "");
        self
    }

    /// 匹配的命令前 `times` 次以指定退出码结束，之后按其余规则执行
    pub fn with_command_failures(self, pattern: &str, times: usize, exit_code: i32) -> Self {
        self.rules.lock().unwrap().push(CommandRule {
            pattern: pattern.to_string(),
            exit_code,
            delay: Duration::ZERO,
            stdout: String::new(),
            remaining: Some(times),
        });
        self
    }

    /// 匹配的命令在指定时长后成功结束
    pub fn with_command_delay(self, pattern: &str, delay: Duration) -> Self {
        self.add_rule(pattern, 0, delay, "");
        self
    }

    /// 匹配的命令输出指定内容
    pub fn with_command_stdout(self, pattern: &str, stdout: &str) -> Self {
        self.add_rule(pattern, 0, Duration::ZERO, stdout);
        self
    }

    fn add_rule(&self, pattern: &str, exit_code: i32, delay: Duration, stdout: &str) {
        self.rules.lock().unwrap().push(CommandRule {
            pattern: pattern.to_string(),
            exit_code,
            delay,
            stdout: stdout.to_string(),
            remaining: None,
        });
    }

    /// 预置一个编排器不知道的实例，用于对账测试
    pub fn insert_orphan(&self, sandbox_id: &str) -> BackendHandle {
        let handle = self.make_handle(sandbox_id);
        self.instances
            .lock()
            .unwrap()
            .insert(sandbox_id.to_string(), handle.clone());
        handle
    }

    /// 已执行的命令行（含沙箱ID）
    pub fn commands(&self) -> Vec<(String, String)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn commands_for(&self, sandbox_id: &str) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == sandbox_id)
            .map(|(_, line)| line.clone())
            .collect()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }

    pub fn instance_count(&self) -> usize {
        self.instances.lock().unwrap().len()
    }

    pub fn max_concurrent_commands(&self) -> usize {
        self.max_concurrent_commands.load(Ordering::SeqCst)
    }

    fn make_handle(&self, sandbox_id: &str) -> BackendHandle {
        BackendHandle {
            sandbox_id: sandbox_id.to_string(),
            backend: "mock".to_string(),
            instance: format!("mock://{sandbox_id}"),
        }
    }

    fn command_line(request: &CommandRequest) -> String {
        std::iter::once(request.command.as_str())
            .chain(request.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for MockSandboxBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SandboxBackend for MockSandboxBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(&self, spec: &SandboxSpec) -> FleetResult<BackendHandle> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(FleetError::backend_error("mock create failure"));
        }
        let handle = self.make_handle(&spec.sandbox_id);
        self.instances
            .lock()
            .unwrap()
            .insert(spec.sandbox_id.clone(), handle.clone());
        Ok(handle)
    }

    async fn boot(&self, handle: &BackendHandle) -> FleetResult<()> {
        let delay = *self.boot_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_boot.load(Ordering::SeqCst) {
            return Err(FleetError::backend_error("mock boot failure"));
        }
        self.booted_at
            .lock()
            .unwrap()
            .insert(handle.sandbox_id.clone(), Instant::now());
        Ok(())
    }

    async fn probe(&self, handle: &BackendHandle) -> FleetResult<()> {
        let ready_after = *self.ready_after.lock().unwrap();
        let booted_at = self
            .booted_at
            .lock()
            .unwrap()
            .get(&handle.sandbox_id)
            .copied();
        match (ready_after, booted_at) {
            (Some(after), Some(at)) if at.elapsed() >= after => Ok(()),
            _ => Err(FleetError::backend_error("mock probe: not ready")),
        }
    }

    async fn command(
        &self,
        handle: &BackendHandle,
        request: &CommandRequest,
    ) -> FleetResult<CommandOutput> {
        let line = Self::command_line(request);
        self.commands
            .lock()
            .unwrap()
            .push((handle.sandbox_id.clone(), line.clone()));

        let current = self.active_commands.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_commands
            .fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.active_commands);

        let (exit_code, delay, stdout) = {
            let mut rules = self.rules.lock().unwrap();
            rules
                .iter_mut()
                .find(|r| line.contains(&r.pattern) && r.remaining != Some(0))
                .map(|r| {
                    if let Some(remaining) = r.remaining.as_mut() {
                        *remaining -= 1;
                    }
                    (r.exit_code, r.delay, r.stdout.clone())
                })
                .unwrap_or((0, Duration::ZERO, String::new()))
        };

        let started = Instant::now();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr: if exit_code == 0 {
                String::new()
            } else {
                format!("mock failure: {line}")
            },
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    async fn destroy(&self, handle: &BackendHandle) -> FleetResult<()> {
        self.instances.lock().unwrap().remove(&handle.sandbox_id);
        self.booted_at.lock().unwrap().remove(&handle.sandbox_id);
        self.destroyed
            .lock()
            .unwrap()
            .push(handle.sandbox_id.clone());
        Ok(())
    }

    async fn list(&self) -> FleetResult<Vec<BackendHandle>> {
        Ok(self.instances.lock().unwrap().values().cloned().collect())
    }
}
