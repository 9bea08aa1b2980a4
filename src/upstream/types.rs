use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// z.ai `/api/chat/completions` 请求体。
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamRequest {
    pub stream: bool,
    pub model: String,
    pub messages: Vec<UpstreamMessage>,
    pub background_tasks: BackgroundTasks,
    pub chat_id: String,
    pub features: Features,
    pub id: String,
    pub mcp_servers: Vec<sonic_rs::Value>,
    pub model_item: ModelItem,
    pub params: Params,
    pub tool_servers: Vec<sonic_rs::Value>,
    pub variables: BTreeMap<String, String>,
}

/// 消息原样透传，content 可能是字符串也可能是多模态数组。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamMessage {
    pub role: String,
    #[serde(default)]
    pub content: sonic_rs::Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BackgroundTasks {
    pub title_generation: bool,
    pub tags_generation: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Features {
    pub image_generation: bool,
    pub code_interpreter: bool,
    pub web_search: bool,
    pub auto_web_search: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelItem {
    pub id: String,
    pub name: String,
    pub owned_by: String,
}

/// 采样参数，未提供的字段不发送。
#[derive(Debug, Clone, Default, Serialize)]
pub struct Params {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl UpstreamRequest {
    /// 构造一个带完整外壳字段的请求，chat_id/id 每次新生成。
    pub fn new(
        upstream_model: &str,
        display_name: &str,
        messages: Vec<UpstreamMessage>,
        params: Params,
    ) -> Self {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let variables = BTreeMap::from([
            ("{{USER_NAME}}".to_string(), "User".to_string()),
            ("{{USER_LOCATION}}".to_string(), "Unknown".to_string()),
            ("{{CURRENT_DATETIME}}".to_string(), now),
        ]);
        Self {
            stream: true,
            model: upstream_model.to_string(),
            messages,
            background_tasks: BackgroundTasks::default(),
            chat_id: crate::util::id::uuid(),
            features: Features::default(),
            id: crate::util::id::uuid(),
            mcp_servers: Vec::new(),
            model_item: ModelItem {
                id: upstream_model.to_string(),
                name: display_name.to_string(),
                owned_by: "openai".to_string(),
            },
            params,
            tool_servers: Vec::new(),
            variables,
        }
    }

    /// 健康检查用的最小请求：一条 "hi"。
    pub fn probe(upstream_model: &str, display_name: &str) -> Self {
        Self::new(
            upstream_model,
            display_name,
            vec![UpstreamMessage {
                role: "user".to_string(),
                content: sonic_rs::Value::from("hi"),
            }],
            Params::default(),
        )
    }
}

/// 上游的回答阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    Thinking,
    #[default]
    Answer,
    /// 工具调用等其它阶段，按正文处理
    Other,
}

impl Phase {
    pub fn parse(s: &str) -> Self {
        match s {
            "thinking" => Self::Thinking,
            "answer" => Self::Answer,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamUsage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// 解析后的一条上游事件。
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UpstreamEvent {
    pub delta: String,
    pub phase: Phase,
    pub done: bool,
    pub usage: Option<UpstreamUsage>,
}

/// `data: ` 之后的 JSON。
#[derive(Debug, Deserialize)]
pub(crate) struct SseEnvelope {
    #[serde(rename = "type", default)]
    pub ty: String,
    #[serde(default)]
    pub data: Option<SseData>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SseData {
    #[serde(default)]
    pub delta_content: String,
    #[serde(default)]
    pub phase: Option<String>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub usage: Option<UpstreamUsage>,
    #[serde(default)]
    pub error: Option<sonic_rs::Value>,
}
