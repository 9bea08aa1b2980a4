use crate::credential::pool::CredentialPool;
use crate::logging::mask_token;
use crate::runtime_config::{RuntimeConfig, RuntimeSettings};
use crate::upstream::UpstreamClient;
use crate::upstream::UpstreamError;
use crate::upstream::types::UpstreamRequest;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

/// 一轮检查出错后的等待时间。
const ERROR_BACKOFF: Duration = Duration::from_secs(300);
/// 同时进行的探测数量上限。
const MAX_CONCURRENT_PROBES: usize = 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub checked: usize,
    pub recovered: usize,
}

/// 后台健康检查：定期探测失效的 Cookie，通过的恢复为可用。
#[derive(Clone)]
pub struct HealthChecker {
    pool: Arc<CredentialPool>,
    upstream: UpstreamClient,
    runtime: RuntimeConfig,
}

pub struct HealthCheckerHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

impl HealthCheckerHandle {
    /// 取消后台任务并等待其退出。
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.join.await {
            tracing::warn!("健康检查任务退出异常: {e}");
        }
    }
}

impl HealthChecker {
    pub fn new(pool: Arc<CredentialPool>, upstream: UpstreamClient, runtime: RuntimeConfig) -> Self {
        Self {
            pool,
            upstream,
            runtime,
        }
    }

    pub fn start(self) -> HealthCheckerHandle {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let join = tokio::spawn(async move { self.run(token).await });
        HealthCheckerHandle { cancel, join }
    }

    async fn run(self, cancel: CancellationToken) {
        // RuntimeConfig 内持有发送端，接收端不会因发送端关闭而出错。
        let mut reload = self.runtime.subscribe();
        let mut wait = check_interval(&self.runtime.get());
        tracing::info!("Cookie 健康检查已启动，间隔 {:?}", wait);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
                _ = reload.changed() => {
                    wait = check_interval(&self.runtime.get());
                    tracing::debug!("配置已更新，健康检查间隔调整为 {:?}", wait);
                    continue;
                }
            }

            let settings = self.runtime.get();
            if !settings.auto_refresh_tokens {
                tracing::debug!("AUTO_REFRESH_TOKENS 已关闭，跳过本轮健康检查");
                wait = check_interval(&settings);
                continue;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.run_cycle() => r,
            };
            wait = match outcome {
                Ok(report) => {
                    if report.checked > 0 {
                        tracing::info!(
                            "健康检查完成：检查 {} 个，恢复 {} 个",
                            report.checked,
                            report.recovered
                        );
                    }
                    check_interval(&self.runtime.get())
                }
                Err(e) => {
                    tracing::error!("健康检查执行失败: {e:#}");
                    ERROR_BACKOFF
                }
            };
        }

        tracing::info!("Cookie 健康检查已停止");
    }

    /// 探测当前所有失效的 Cookie，通过的恢复为可用。
    pub async fn run_cycle(&self) -> anyhow::Result<CycleReport> {
        let failed = self.pool.failed_tokens().await;
        if failed.is_empty() {
            return Ok(CycleReport::default());
        }
        tracing::info!("开始检查 {} 个失效的 Cookie", failed.len());

        let semaphore = Arc::new(Semaphore::new(MAX_CONCURRENT_PROBES));
        let mut set = JoinSet::new();
        for token in failed {
            let checker = self.clone();
            let semaphore = semaphore.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = checker.probe(&token).await;
                checker.pool.record_checked(&token).await;
                match result {
                    Ok(()) => checker.pool.mark_recovered(&token).await,
                    Err(e) => {
                        tracing::debug!(
                            token = %mask_token(&token),
                            class = e.class(),
                            "Cookie 仍不可用: {e}"
                        );
                        false
                    }
                }
            });
        }

        let mut report = CycleReport::default();
        while let Some(joined) = set.join_next().await {
            report.checked += 1;
            if joined? {
                report.recovered += 1;
            }
        }
        Ok(report)
    }

    /// 用与真实请求相同的接口发送 "hi"，2xx 视为可用。
    pub async fn probe(&self, token: &str) -> Result<(), UpstreamError> {
        let settings = self.runtime.get();
        let req = UpstreamRequest::probe(&settings.upstream_model, &settings.model_name);
        self.upstream.probe(token, &req).await
    }
}

fn check_interval(settings: &RuntimeSettings) -> Duration {
    Duration::from_secs(settings.refresh_check_interval_secs.max(1))
}
