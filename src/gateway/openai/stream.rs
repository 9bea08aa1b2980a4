use super::types::{ChatCompletion, Choice, Delta, Usage};
use chrono::Utc;

/// OpenAI SSE: 写入 `{"error":{"message":...,"type":"server_error"}}` 事件并结束。
pub fn sse_error_events(msg: &str) -> Vec<String> {
    let encoded = sonic_rs::to_string(msg).unwrap_or_else(|_| "\"\"".to_string());
    let json = format!("{{\"error\":{{\"message\":{encoded},\"type\":\"server_error\"}}}}");
    vec![json, "[DONE]".to_string()]
}

/// 把文本增量编码为 `chat.completion.chunk`：首个 chunk 带 role，结束时带 finish_reason 和 `[DONE]`。
pub struct StreamWriter {
    id: String,
    created: i64,
    model: String,

    sent_role: bool,
    chunks: usize,

    log_enabled: bool,
    merged: String,
}

impl StreamWriter {
    pub fn new(id: String, created: i64, model: String, log_enabled: bool) -> Self {
        Self {
            id,
            created,
            model,
            sent_role: false,
            chunks: 0,
            log_enabled,
            merged: String::new(),
        }
    }

    pub fn write_content(&mut self, s: &str) -> Vec<String> {
        let mut out = self.write_role();
        if s.is_empty() {
            return out;
        }
        if self.log_enabled {
            self.merged.push_str(s);
        }
        out.extend(self.write_chunk(
            Delta {
                content: s.to_string(),
                ..Delta::default()
            },
            None,
            None,
        ));
        out
    }

    pub fn finish_events(&mut self, finish_reason: &str, usage: Option<Usage>) -> Vec<String> {
        let mut out = self.write_role();
        out.extend(self.write_chunk(
            Delta::default(),
            Some(finish_reason.to_string()),
            usage,
        ));
        out.push("[DONE]".to_string());
        out
    }

    /// 已写出的 chunk 数（不含 `[DONE]`）。
    pub fn chunk_count(&self) -> usize {
        self.chunks
    }

    /// 合并后的正文，仅在开启客户端日志时收集。
    pub fn merged_content(&self) -> &str {
        &self.merged
    }

    fn write_role(&mut self) -> Vec<String> {
        if self.sent_role {
            return Vec::new();
        }
        self.sent_role = true;
        self.write_chunk(
            Delta {
                role: "assistant".to_string(),
                ..Delta::default()
            },
            None,
            None,
        )
    }

    fn write_chunk(
        &mut self,
        delta: Delta,
        finish_reason: Option<String>,
        usage: Option<Usage>,
    ) -> Vec<String> {
        let chunk = ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![Choice {
                index: 0,
                message: None,
                delta: Some(delta),
                finish_reason,
            }],
            usage,
        };

        match sonic_rs::to_string(&chunk) {
            Ok(s) => {
                self.chunks += 1;
                vec![s]
            }
            Err(_) => Vec::new(),
        }
    }
}

pub fn now_unix() -> i64 {
    Utc::now().timestamp()
}
