//! 请求转发核心：模型校验、凭证轮换与失败切换、聚合与流式打开。

use super::convert::{to_chat_completion, to_upstream_request};
use super::types::{ChatCompletion, ChatRequest};
use crate::credential::pool::CredentialPool;
use crate::credential::types::Lease;
use crate::error::GatewayError;
use crate::gateway::think::{ThinkTagger, strip_think_segments};
use crate::runtime_config::RuntimeConfig;
use crate::upstream::types::{UpstreamEvent, UpstreamUsage};
use crate::upstream::{EventStream, UpstreamClient, UpstreamError};
use crate::util::id;
use futures::StreamExt;
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
pub struct ChatRelay {
    pool: Arc<CredentialPool>,
    upstream: UpstreamClient,
    runtime: RuntimeConfig,
}

/// 已确认可用的上游流：首个事件已被读取，剩余部分尚未消费。
pub struct OpenedStream {
    pub lease: Lease,
    pub first: UpstreamEvent,
    pub rest: EventStream,
}

impl ChatRelay {
    pub fn new(pool: Arc<CredentialPool>, upstream: UpstreamClient, runtime: RuntimeConfig) -> Self {
        Self {
            pool,
            upstream,
            runtime,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn validate_model(&self, req: &ChatRequest) -> Result<(), GatewayError> {
        let settings = self.runtime.get();
        if req.model != settings.model_name {
            return Err(GatewayError::InvalidModel(req.model.clone()));
        }
        Ok(())
    }

    /// 非流式：完整读取上游流，拼接后按 `show_think_tags` 过滤思考段。
    pub async fn complete(&self, req: &ChatRequest) -> Result<ChatCompletion, GatewayError> {
        self.validate_model(req)?;
        let settings = self.runtime.get();
        let ureq = to_upstream_request(req, &settings);

        let (text, usage) = self
            .with_failover(|lease| {
                let ureq = &ureq;
                async move {
                    let events = self.upstream.chat_stream(&lease.token, ureq).await?;
                    aggregate(events).await
                }
            })
            .await?;

        let content = if settings.show_think_tags {
            text
        } else {
            strip_think_segments(&text)
        };
        Ok(to_chat_completion(
            id::chat_completion_id(),
            &req.model,
            content,
            usage,
        ))
    }

    /// 流式：切换凭证直到拿到第一个上游事件，之后的错误不再切换。
    pub async fn open_stream(&self, req: &ChatRequest) -> Result<OpenedStream, GatewayError> {
        self.validate_model(req)?;
        let ureq = to_upstream_request(req, &self.runtime.get());

        self.with_failover(|lease| {
            let ureq = &ureq;
            async move {
                let mut rest = self.upstream.chat_stream(&lease.token, ureq).await?;
                match rest.next().await {
                    Some(Ok(first)) => Ok(OpenedStream { lease, first, rest }),
                    Some(Err(e)) => Err(e),
                    None => Err(empty_stream()),
                }
            }
        })
        .await
    }

    /// 每个凭证最多尝试一次，总次数不超过池大小。失败的凭证立即标记为失效。
    async fn with_failover<T, F, Fut>(&self, mut op: F) -> Result<T, GatewayError>
    where
        F: FnMut(Lease) -> Fut,
        Fut: Future<Output = Result<T, UpstreamError>>,
    {
        let attempts = self.pool.len().await.max(1);
        let mut tried: HashSet<Arc<str>> = HashSet::new();
        let mut last_err: Option<UpstreamError> = None;

        for attempt in 0..attempts {
            let lease = match self.pool.acquire().await {
                Ok(l) => l,
                Err(e) if last_err.is_none() => return Err(e),
                Err(_) => break,
            };
            if !tried.insert(lease.token.clone()) {
                break;
            }

            let slot = lease.slot;
            let token = lease.token.clone();
            let masked = lease.masked();
            match op(lease).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    tracing::warn!(
                        slot,
                        token = %masked,
                        class = e.class(),
                        status = ?e.status(),
                        attempt = attempt + 1,
                        "上游请求失败，切换 Cookie: {e}"
                    );
                    self.pool.mark_failed(&token).await;
                    last_err = Some(e);
                }
            }
        }

        let msg = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "后端请求失败".to_string());
        Err(GatewayError::UpstreamUnavailable(msg))
    }
}

fn empty_stream() -> UpstreamError {
    UpstreamError::Malformed("上游未返回任何数据".to_string())
}

/// 读取全部事件，按 phase 插入思考标签后拼接。
async fn aggregate(
    mut events: EventStream,
) -> Result<(String, Option<UpstreamUsage>), UpstreamError> {
    let mut tagger = ThinkTagger::new();
    let mut text = String::new();
    let mut usage = None;
    let mut seen = false;

    while let Some(item) = events.next().await {
        let ev = item?;
        seen = true;
        text.push_str(&tagger.tag(&ev));
        if ev.usage.is_some() {
            usage = ev.usage;
        }
    }
    if !seen {
        return Err(empty_stream());
    }
    if let Some(close) = tagger.finish() {
        text.push_str(close);
    }
    Ok((text, usage))
}
