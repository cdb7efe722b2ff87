use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::registry::WorkerRegistry;

/// Worker过期清理器
///
/// 周期性地从注册存储合并远端记录，然后删除心跳超过注销阈值的Worker。
pub struct ExpirySweeper {
    registry: Arc<WorkerRegistry>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(registry: Arc<WorkerRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// 执行一轮同步与清理，返回被删除的Worker ID
    pub async fn run_once(&self) -> Vec<String> {
        if let Err(e) = self.registry.sync_from_store().await {
            error!("同步注册存储时出错: {}", e);
        }

        match self.registry.sweep_expired().await {
            Ok(removed) => {
                if !removed.is_empty() {
                    info!("清理了 {} 个过期的Worker", removed.len());
                }
                removed
            }
            Err(e) => {
                error!("清理过期Worker时出错: {}", e);
                Vec::new()
            }
        }
    }

    /// 在后台运行清理循环，直到令牌被取消
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_ms = self.interval.as_millis() as u64, "启动Worker过期清理循环");
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        info!("收到停止信号，退出Worker过期清理循环");
                        break;
                    }
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                }
            }
        })
    }
}
