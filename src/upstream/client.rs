use crate::config::Config;
use crate::logging;
use crate::upstream::stream::{EventStream, parse_events};
use crate::upstream::types::UpstreamRequest;
use reqwest::header::{
    ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, REFERER,
    USER_AGENT,
};
use sonic_rs::JsonValueTrait;
use std::time::Duration;
use thiserror::Error;

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/138.0.0.0 Safari/537.36";
const FE_VERSION: &str = "prod-fe-1.0.53";
const SITE_ORIGIN: &str = "https://chat.z.ai";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("上游返回 {status}: {message}")]
    Http { status: u16, message: String },

    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    /// 流中出现无法解析的数据或上游在流内报错。
    #[error("上游数据格式错误: {0}")]
    Malformed(String),

    #[error(transparent)]
    Json(#[from] sonic_rs::Error),
}

impl UpstreamError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// 日志里的失败分类。
    pub fn class(&self) -> &'static str {
        match self {
            Self::Http { .. } => "http",
            Self::Transport(_) => "transport",
            Self::Malformed(_) => "malformed",
            Self::Json(_) => "json",
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    url: String,
    log_level: logging::LogLevel,
}

impl UpstreamClient {
    pub fn new(cfg: &Config) -> Result<Self, anyhow::Error> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90));

        if cfg.timeout_ms > 0 {
            builder = builder.timeout(Duration::from_millis(cfg.timeout_ms));
        }
        if !cfg.proxy.trim().is_empty() {
            builder = builder.proxy(reqwest::Proxy::all(cfg.proxy.trim())?);
        }

        Ok(Self {
            http: builder.build()?,
            url: cfg.upstream_url.clone(),
            log_level: cfg.detail_log_level(),
        })
    }

    pub fn build_headers(&self, token: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}"))
                .unwrap_or(HeaderValue::from_static("")),
        );
        h.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        h.insert(USER_AGENT, HeaderValue::from_static(BROWSER_USER_AGENT));
        h.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );
        h.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN"));
        h.insert("x-fe-version", HeaderValue::from_static(FE_VERSION));
        h.insert(ORIGIN, HeaderValue::from_static(SITE_ORIGIN));
        h.insert(REFERER, HeaderValue::from_static("https://chat.z.ai/"));
        h
    }

    /// 发起流式对话。非 2xx 直接返回错误，成功时返回惰性事件流。
    pub async fn chat_stream(
        &self,
        token: &str,
        req: &UpstreamRequest,
    ) -> Result<EventStream, UpstreamError> {
        let body = sonic_rs::to_vec(req)?;
        let headers = self.build_headers(token);
        if self.log_level.backend_enabled() {
            logging::backend_request("POST", &self.url, &headers, &body);
        }

        let start = std::time::Instant::now();
        let resp = self
            .http
            .post(&self.url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let bytes = resp.bytes().await.unwrap_or_default();
            if self.log_level.backend_enabled() {
                logging::backend_response(status.as_u16(), start.elapsed(), &bytes);
            }
            return Err(extract_error(status.as_u16(), &bytes));
        }

        Ok(parse_events(resp.bytes_stream()))
    }

    /// 健康检查：发送一条最小请求，2xx 即视为可用，响应体不读取。
    pub async fn probe(&self, token: &str, req: &UpstreamRequest) -> Result<(), UpstreamError> {
        let body = sonic_rs::to_vec(req)?;
        let resp = self
            .http
            .post(&self.url)
            .headers(self.build_headers(token))
            .timeout(PROBE_TIMEOUT)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        drop(resp);
        if status.is_success() {
            Ok(())
        } else {
            Err(UpstreamError::Http {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("").to_string(),
            })
        }
    }
}

/// z.ai 的错误体通常是 `{"detail": ".."}`，也兼容 `{"error":{"message":".."}}`。
fn extract_error(status: u16, body: &[u8]) -> UpstreamError {
    let parsed = sonic_rs::from_slice::<sonic_rs::Value>(body).ok();
    let message = parsed
        .as_ref()
        .and_then(|v| {
            v.get("detail")
                .and_then(|d| d.as_str())
                .or_else(|| v.get("message").and_then(|m| m.as_str()))
                .or_else(|| {
                    v.get("error")
                        .and_then(|e| e.get("message"))
                        .and_then(|m| m.as_str())
                })
                .map(str::to_string)
        })
        .unwrap_or_else(|| {
            let text = String::from_utf8_lossy(body);
            text.chars().take(512).collect()
        });

    UpstreamError::Http { status, message }
}
