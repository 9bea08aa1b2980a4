use super::stream::now_unix;
use super::types::{
    AssistantMessage, ChatCompletion, ChatRequest, Choice, ModelItem, ModelsResponse, Usage,
};
use crate::runtime_config::RuntimeSettings;
use crate::upstream::types::{Params, UpstreamMessage, UpstreamRequest, UpstreamUsage};

/// 消息与采样参数原样透传，模型映射为上游模型 ID。
pub fn to_upstream_request(req: &ChatRequest, settings: &RuntimeSettings) -> UpstreamRequest {
    let messages = req
        .messages
        .iter()
        .map(|m| UpstreamMessage {
            role: m.role.clone(),
            content: m.content.clone(),
        })
        .collect();
    let params = Params {
        temperature: req.temperature,
        top_p: req.top_p,
        max_tokens: req.max_tokens,
        extra: req.extra.clone(),
    };
    UpstreamRequest::new(
        &settings.upstream_model,
        &settings.model_name,
        messages,
        params,
    )
}

pub fn convert_usage(usage: Option<UpstreamUsage>) -> Option<Usage> {
    let u = usage?;
    let total = if u.total_tokens > 0 {
        u.total_tokens
    } else {
        u.prompt_tokens + u.completion_tokens
    };
    Some(Usage {
        prompt_tokens: u.prompt_tokens,
        completion_tokens: u.completion_tokens,
        total_tokens: total,
    })
}

pub fn to_chat_completion(
    id: String,
    model: &str,
    content: String,
    usage: Option<UpstreamUsage>,
) -> ChatCompletion {
    ChatCompletion {
        id,
        object: "chat.completion".to_string(),
        created: now_unix(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: Some(AssistantMessage {
                role: "assistant".to_string(),
                content,
            }),
            delta: None,
            finish_reason: Some("stop".to_string()),
        }],
        usage: convert_usage(usage),
    }
}

pub fn to_models_response(model_name: &str) -> ModelsResponse {
    ModelsResponse {
        object: "list".to_string(),
        data: vec![ModelItem {
            id: model_name.to_string(),
            object: "model".to_string(),
            created: now_unix(),
            owned_by: "z.ai".to_string(),
        }],
    }
}
