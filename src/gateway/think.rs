use crate::upstream::types::{Phase, UpstreamEvent};

pub const THINK_OPEN: &str = "<think>";
pub const THINK_CLOSE: &str = "</think>";

/// 按上游 phase 在文本中插入 `<think>`/`</think>`。
///
/// 流式与非流式共用，保证两种模式看到的文本一致。
#[derive(Debug, Default)]
pub struct ThinkTagger {
    in_thinking: bool,
}

impl ThinkTagger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tag(&mut self, ev: &UpstreamEvent) -> String {
        let mut out = String::with_capacity(ev.delta.len() + THINK_CLOSE.len());
        match (ev.phase == Phase::Thinking, self.in_thinking) {
            (true, false) => {
                out.push_str(THINK_OPEN);
                self.in_thinking = true;
            }
            (false, true) => {
                out.push_str(THINK_CLOSE);
                self.in_thinking = false;
            }
            _ => {}
        }
        out.push_str(&ev.delta);
        out
    }

    /// 正常结束时补上未闭合的 `</think>`。被截断的流不调用。
    pub fn finish(&mut self) -> Option<&'static str> {
        if self.in_thinking {
            self.in_thinking = false;
            Some(THINK_CLOSE)
        } else {
            None
        }
    }
}

/// 去掉所有 `<think>...</think>` 段（含标签）。
///
/// 未闭合的 `<think>` 一直延伸到文本末尾；没有开标签的 `</think>` 原样保留。
pub fn strip_think_segments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(open) = rest.find(THINK_OPEN) {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + THINK_OPEN.len()..];
        match after_open.find(THINK_CLOSE) {
            Some(close) => rest = &after_open[close + THINK_CLOSE.len()..],
            None => return out,
        }
    }
    out.push_str(rest);
    out
}
