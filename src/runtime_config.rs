//! 运行时可动态修改的配置。
//!
//! 管理接口修改后"立即生效"：ArcSwap 无锁读取，写入时替换整个快照，
//! 同时通过 watch 通道通知后台任务（健康检查会据此调整间隔）。

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::Config;
use crate::logging::LogLevel;

/// 运行时配置快照。
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub api_key: String,
    /// 非流式响应是否保留 `<think>` 段
    pub show_think_tags: bool,
    /// 请求未携带 stream 字段时的默认值
    pub default_stream: bool,
    /// tracing 日志级别（启动时生效）
    pub log_level: String,
    /// 客户端/后端请求详细日志级别
    pub debug: String,
    pub max_requests_per_minute: u32,
    pub auto_refresh_tokens: bool,
    pub refresh_check_interval_secs: u64,
    /// 以下字段只读：修改后需重启
    pub host: String,
    pub port: u16,
    pub model_name: String,
    pub upstream_model: String,
}

impl RuntimeSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            api_key: cfg.api_key.clone(),
            show_think_tags: cfg.show_think_tags,
            default_stream: cfg.default_stream,
            log_level: cfg.log_level.clone(),
            debug: cfg.debug.clone(),
            max_requests_per_minute: cfg.max_requests_per_minute,
            auto_refresh_tokens: cfg.auto_refresh_tokens,
            refresh_check_interval_secs: cfg.refresh_check_interval_secs,
            host: cfg.host.clone(),
            port: cfg.port,
            model_name: cfg.model_name.clone(),
            upstream_model: cfg.upstream_model.clone(),
        }
    }

    pub fn detail_log_level(&self) -> LogLevel {
        LogLevel::parse(&self.debug)
    }
}

/// 运行时配置存储，克隆后共享同一份快照。
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    current: Arc<ArcSwap<RuntimeSettings>>,
    notify: Arc<watch::Sender<u64>>,
}

impl RuntimeConfig {
    pub fn new(settings: RuntimeSettings) -> Self {
        let (tx, _rx) = watch::channel(0u64);
        Self {
            current: Arc::new(ArcSwap::from_pointee(settings)),
            notify: Arc::new(tx),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        Self::new(RuntimeSettings::from_config(cfg))
    }

    /// 获取当前配置快照。
    pub fn get(&self) -> Arc<RuntimeSettings> {
        self.current.load_full()
    }

    /// 基于当前快照计算新配置并原子替换（并发更新不会互相覆盖），然后通知订阅者。
    ///
    /// 发生竞争时 `f` 可能被调用多次，不应有副作用。
    pub fn update_with<F>(&self, mut f: F)
    where
        F: FnMut(&RuntimeSettings) -> RuntimeSettings,
    {
        self.current.rcu(|cur| Arc::new(f(&**cur)));
        self.notify.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// 订阅配置变更通知（值为变更序号，仅用于唤醒）。
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }
}

/// 管理接口的配置更新请求：未提供的字段保持不变。
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigUpdate {
    pub api_key: Option<String>,
    pub show_think_tags: Option<bool>,
    pub default_stream: Option<bool>,
    pub log_level: Option<String>,
    pub max_requests_per_minute: Option<u32>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub auto_refresh_tokens: Option<bool>,
    pub refresh_check_interval: Option<u64>,
}

const LOG_LEVELS: [&str; 7] = [
    "trace", "debug", "info", "warn", "warning", "error", "critical",
];

impl ConfigUpdate {
    pub fn validate(&self) -> Result<(), &'static str> {
        if let Some(level) = &self.log_level
            && !LOG_LEVELS.contains(&level.trim().to_lowercase().as_str())
        {
            return Err("log_level 必须是 trace、debug、info、warning 或 error");
        }
        if self.refresh_check_interval == Some(0) {
            return Err("refresh_check_interval 必须大于 0");
        }
        if self.port == Some(0) {
            return Err("port 无效");
        }
        if let Some(host) = &self.host
            && host.trim().is_empty()
        {
            return Err("host 不能为空");
        }
        Ok(())
    }

    /// 更新了哪些字段（按请求字段名）。
    pub fn updated_fields(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.api_key.is_some() {
            out.push("api_key");
        }
        if self.show_think_tags.is_some() {
            out.push("show_think_tags");
        }
        if self.default_stream.is_some() {
            out.push("default_stream");
        }
        if self.log_level.is_some() {
            out.push("log_level");
        }
        if self.max_requests_per_minute.is_some() {
            out.push("max_requests_per_minute");
        }
        if self.port.is_some() {
            out.push("port");
        }
        if self.host.is_some() {
            out.push("host");
        }
        if self.auto_refresh_tokens.is_some() {
            out.push("auto_refresh_tokens");
        }
        if self.refresh_check_interval.is_some() {
            out.push("refresh_check_interval");
        }
        out
    }

    /// 应用到运行时配置。host/port 只写入快照供展示，监听地址需重启后生效。
    pub fn apply_to(&self, current: &RuntimeSettings) -> RuntimeSettings {
        let mut next = current.clone();
        if let Some(v) = &self.api_key {
            next.api_key = v.trim().to_string();
        }
        if let Some(v) = self.show_think_tags {
            next.show_think_tags = v;
        }
        if let Some(v) = self.default_stream {
            next.default_stream = v;
        }
        if let Some(v) = &self.log_level {
            next.log_level = normalize_log_level(v);
        }
        if let Some(v) = self.max_requests_per_minute {
            next.max_requests_per_minute = v;
        }
        if let Some(v) = self.port {
            next.port = v;
        }
        if let Some(v) = &self.host {
            next.host = v.trim().to_string();
        }
        if let Some(v) = self.auto_refresh_tokens {
            next.auto_refresh_tokens = v;
        }
        if let Some(v) = self.refresh_check_interval {
            next.refresh_check_interval_secs = v;
        }
        next
    }

    /// 需要写回 `.env` 的键值对。
    pub fn dotenv_pairs(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if let Some(v) = &self.api_key {
            out.push(("API_KEY", v.trim().to_string()));
        }
        if let Some(v) = self.show_think_tags {
            out.push(("SHOW_THINK_TAGS", v.to_string()));
        }
        if let Some(v) = self.default_stream {
            out.push(("DEFAULT_STREAM", v.to_string()));
        }
        if let Some(v) = &self.log_level {
            out.push(("LOG_LEVEL", normalize_log_level(v).to_uppercase()));
        }
        if let Some(v) = self.max_requests_per_minute {
            out.push(("MAX_REQUESTS_PER_MINUTE", v.to_string()));
        }
        if let Some(v) = self.port {
            out.push(("PORT", v.to_string()));
        }
        if let Some(v) = &self.host {
            out.push(("HOST", v.trim().to_string()));
        }
        if let Some(v) = self.auto_refresh_tokens {
            out.push(("AUTO_REFRESH_TOKENS", v.to_string()));
        }
        if let Some(v) = self.refresh_check_interval {
            out.push(("REFRESH_CHECK_INTERVAL", v.to_string()));
        }
        out
    }
}

/// 管理接口返回的配置视图。
#[derive(Debug, Clone, Serialize)]
pub struct ConfigView {
    pub api_key: String,
    pub show_think_tags: bool,
    pub default_stream: bool,
    pub log_level: String,
    pub max_requests_per_minute: u32,
    pub port: u16,
    pub host: String,
    pub auto_refresh_tokens: bool,
    pub refresh_check_interval: u64,
    pub model_name: String,
    pub upstream_model: String,
}

impl ConfigView {
    pub fn from_runtime(rt: &RuntimeSettings) -> Self {
        Self {
            api_key: rt.api_key.clone(),
            show_think_tags: rt.show_think_tags,
            default_stream: rt.default_stream,
            log_level: rt.log_level.to_uppercase(),
            max_requests_per_minute: rt.max_requests_per_minute,
            port: rt.port,
            host: rt.host.clone(),
            auto_refresh_tokens: rt.auto_refresh_tokens,
            refresh_check_interval: rt.refresh_check_interval_secs,
            model_name: rt.model_name.clone(),
            upstream_model: rt.upstream_model.clone(),
        }
    }
}

/// WARNING/CRITICAL 等常见别名映射为 tracing 的级别名。
pub fn normalize_log_level(value: &str) -> String {
    match value.trim().to_lowercase().as_str() {
        "trace" => "trace",
        "debug" => "debug",
        "warn" | "warning" => "warn",
        "error" | "critical" => "error",
        _ => "info",
    }
    .to_string()
}
