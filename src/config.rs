use crate::util::dotenv;
use figment::Figment;
use figment::providers::{Env, Serialized};
use figment::value::Value;
use std::collections::BTreeMap;
use serde::Deserialize;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8000;
const DEFAULT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_MODEL_NAME: &str = "GLM-4.5";
const DEFAULT_UPSTREAM_MODEL: &str = "0727-360B-API";
pub const DEFAULT_UPSTREAM_URL: &str = "https://chat.z.ai/api/chat/completions";
const DEFAULT_REFRESH_CHECK_INTERVAL_SECS: u64 = 600;
const DEFAULT_MAX_REQUESTS_PER_MINUTE: u32 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,

    pub api_key: String,
    pub cookies: Vec<String>,

    pub model_name: String,
    pub upstream_model: String,
    pub upstream_url: String,
    pub timeout_ms: u64,
    pub proxy: String,

    pub show_think_tags: bool,
    pub default_stream: bool,

    pub log_level: String,
    pub debug: String,

    /// 仅作为配置项保存和展示，限流不在本服务内实现。
    pub max_requests_per_minute: u32,
    pub auto_refresh_tokens: bool,
    pub refresh_check_interval_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RawEnv {
    #[serde(alias = "HOST")]
    host: Option<String>,
    #[serde(alias = "PORT")]
    port: Option<u16>,

    #[serde(alias = "API_KEY")]
    api_key: Option<String>,
    #[serde(alias = "Z_AI_COOKIES")]
    z_ai_cookies: Option<String>,

    #[serde(alias = "MODEL_NAME")]
    model_name: Option<String>,
    #[serde(alias = "UPSTREAM_MODEL")]
    upstream_model: Option<String>,
    #[serde(alias = "UPSTREAM_URL")]
    upstream_url: Option<String>,
    #[serde(alias = "TIMEOUT")]
    timeout: Option<u64>,
    #[serde(alias = "PROXY")]
    proxy: Option<String>,

    #[serde(alias = "SHOW_THINK_TAGS")]
    show_think_tags: Option<bool>,
    #[serde(alias = "DEFAULT_STREAM")]
    default_stream: Option<bool>,

    #[serde(alias = "LOG_LEVEL")]
    log_level: Option<String>,
    #[serde(alias = "DEBUG")]
    debug: Option<String>,

    #[serde(alias = "MAX_REQUESTS_PER_MINUTE")]
    max_requests_per_minute: Option<u32>,
    #[serde(alias = "AUTO_REFRESH_TOKENS")]
    auto_refresh_tokens: Option<bool>,
    #[serde(alias = "REFRESH_CHECK_INTERVAL")]
    refresh_check_interval: Option<u64>,
}

impl Config {
    pub fn load() -> Self {
        dotenv::load();
        Self::from_env()
    }

    /// 只读取当前进程环境变量（不再加载 `.env`）。
    pub fn from_env() -> Self {
        match Figment::from(Env::raw()).extract::<RawEnv>() {
            Ok(raw) => Self::from_raw(raw),
            Err(e) => {
                // 此时 tracing 可能尚未初始化，直接输出到 stderr。
                eprintln!("解析环境变量失败，使用默认配置: {e}");
                Self::defaults()
            }
        }
    }

    /// 运行期热重载：进程环境变量叠加 `.env` 的当前内容，`.env` 优先。
    ///
    /// 只读文件、不修改进程环境变量。
    pub fn reload() -> Self {
        Self::with_dotenv(dotenv::read())
    }

    fn with_dotenv(values: BTreeMap<String, String>) -> Self {
        // Env::raw() 会把 key 转成小写，这里保持一致，合并时才能覆盖同名项。
        let layer: BTreeMap<String, Value> = values
            .into_iter()
            .map(|(k, v)| {
                let parsed = v.parse::<Value>().unwrap_or_else(|_| Value::from(v.clone()));
                (k.to_lowercase(), parsed)
            })
            .collect();
        let figment = Figment::from(Env::raw()).merge(Serialized::defaults(layer));
        match figment.extract::<RawEnv>() {
            Ok(raw) => Self::from_raw(raw),
            Err(e) => {
                tracing::warn!("重新加载配置失败，沿用环境变量: {e}");
                Self::from_env()
            }
        }
    }

    fn from_raw(raw: RawEnv) -> Self {
        Self {
            host: raw.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            port: raw.port.unwrap_or(DEFAULT_PORT),
            api_key: raw.api_key.unwrap_or_default().trim().to_string(),
            cookies: parse_cookie_list(raw.z_ai_cookies.as_deref().unwrap_or_default()),
            model_name: non_empty_or(raw.model_name, DEFAULT_MODEL_NAME),
            upstream_model: non_empty_or(raw.upstream_model, DEFAULT_UPSTREAM_MODEL),
            upstream_url: non_empty_or(raw.upstream_url, DEFAULT_UPSTREAM_URL),
            timeout_ms: raw.timeout.unwrap_or(DEFAULT_TIMEOUT_MS),
            proxy: raw.proxy.unwrap_or_default(),
            show_think_tags: raw.show_think_tags.unwrap_or(false),
            default_stream: raw.default_stream.unwrap_or(false),
            log_level: non_empty_or(raw.log_level, "info").to_lowercase(),
            debug: raw.debug.unwrap_or_else(|| "off".to_string()),
            max_requests_per_minute: raw
                .max_requests_per_minute
                .unwrap_or(DEFAULT_MAX_REQUESTS_PER_MINUTE),
            auto_refresh_tokens: raw.auto_refresh_tokens.unwrap_or(true),
            refresh_check_interval_secs: raw
                .refresh_check_interval
                .filter(|v| *v > 0)
                .unwrap_or(DEFAULT_REFRESH_CHECK_INTERVAL_SECS),
        }
    }

    /// 全部取默认值，不读取环境变量。
    pub fn defaults() -> Self {
        Self::from_raw(RawEnv::default())
    }

    pub fn detail_log_level(&self) -> crate::logging::LogLevel {
        crate::logging::LogLevel::parse(&self.debug)
    }
}

/// `Z_AI_COOKIES` 为逗号分隔的 token 列表；空白项忽略。
pub fn parse_cookie_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    match value {
        Some(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}
