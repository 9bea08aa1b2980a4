use crate::upstream::client::UpstreamError;
use crate::upstream::types::{Phase, SseEnvelope, UpstreamEvent};
use futures::{Stream, StreamExt};
use std::pin::Pin;

/// 上游事件流：惰性、有序、不可重放。丢弃即关闭底层连接。
pub type EventStream = Pin<Box<dyn Stream<Item = Result<UpstreamEvent, UpstreamError>> + Send>>;

enum Line {
    Skip,
    Done,
    Event(UpstreamEvent),
}

/// 把 SSE 字节流按行切分并解析为事件。
///
/// `data.done == true` 或 `[DONE]` 结束流；出现格式错误时产出一个 `Malformed` 后结束。
pub fn parse_events<S, B>(body: S) -> EventStream
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    Box::pin(async_stream::stream! {
        let mut body = Box::pin(body);
        let mut buf: Vec<u8> = Vec::with_capacity(4 * 1024);
        let mut phase = Phase::default();

        loop {
            let chunk = match body.next().await {
                Some(Ok(c)) => c,
                Some(Err(e)) => {
                    yield Err(UpstreamError::Transport(e));
                    return;
                }
                None => break,
            };
            buf.extend_from_slice(chunk.as_ref());

            let mut processed = 0;
            while let Some(nl_rel) = buf[processed..].iter().position(|&b| b == b'\n') {
                let nl = processed + nl_rel;
                let parsed = parse_line(&buf[processed..nl], &mut phase);
                processed = nl + 1;
                match parsed {
                    Ok(Line::Skip) => {}
                    Ok(Line::Done) => return,
                    Ok(Line::Event(ev)) => {
                        let done = ev.done;
                        yield Ok(ev);
                        if done {
                            return;
                        }
                    }
                    Err(e) => {
                        yield Err(e);
                        return;
                    }
                }
            }
            if processed > 0 {
                buf.drain(..processed);
            }
        }

        // 连接关闭时最后一行可能没有换行符。
        if !buf.is_empty() {
            match parse_line(&buf, &mut phase) {
                Ok(Line::Event(ev)) => yield Ok(ev),
                Ok(_) => {}
                Err(e) => yield Err(e),
            }
        }
    })
}

fn parse_line(raw: &[u8], phase: &mut Phase) -> Result<Line, UpstreamError> {
    let line = raw.strip_suffix(b"\r").unwrap_or(raw);
    let Some(payload) = line.strip_prefix(b"data:") else {
        return Ok(Line::Skip);
    };
    let payload = payload.strip_prefix(b" ").unwrap_or(payload);
    if payload.is_empty() {
        return Ok(Line::Skip);
    }
    if payload == b"[DONE]" {
        return Ok(Line::Done);
    }

    let envelope: SseEnvelope = sonic_rs::from_slice(payload).map_err(|e| {
        UpstreamError::Malformed(format!(
            "{e}: {}",
            String::from_utf8_lossy(&payload[..payload.len().min(200)])
        ))
    })?;

    let Some(data) = envelope.data else {
        return Ok(Line::Skip);
    };
    if let Some(err) = data.error {
        return Err(UpstreamError::Malformed(
            sonic_rs::to_string(&err).unwrap_or_default(),
        ));
    }
    if !envelope.ty.is_empty() && envelope.ty != "chat:completion" {
        return Ok(Line::Skip);
    }

    // 后续分片可能不带 phase，沿用上一个。
    if let Some(p) = data.phase.as_deref() {
        *phase = Phase::parse(p);
    }
    if data.delta_content.is_empty() && !data.done && data.usage.is_none() {
        return Ok(Line::Skip);
    }

    Ok(Line::Event(UpstreamEvent {
        delta: data.delta_content,
        phase: *phase,
        done: data.done,
        usage: data.usage,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(chunks: &[&str]) -> impl Stream<Item = Result<Vec<u8>, reqwest::Error>> + Send + 'static {
        let owned: Vec<Result<Vec<u8>, reqwest::Error>> =
            chunks.iter().map(|c| Ok(c.as_bytes().to_vec())).collect();
        futures::stream::iter(owned)
    }

    async fn collect(chunks: &[&str]) -> Vec<Result<UpstreamEvent, UpstreamError>> {
        parse_events(body(chunks)).collect().await
    }

    fn line(delta: &str, phase: &str, done: bool) -> String {
        format!(
            "data: {{\"type\":\"chat:completion\",\"data\":{{\"delta_content\":\"{delta}\",\"phase\":\"{phase}\",\"done\":{done}}}}}\n\n"
        )
    }

    #[tokio::test]
    async fn parses_lines_split_across_chunks() {
        let full = format!("{}{}", line("思考", "thinking", false), line("答案", "answer", true));
        let (a, b) = full.split_at(17);
        let events = collect(&[a, b]).await;

        assert_eq!(events.len(), 2);
        let first = events[0].as_ref().expect("event");
        assert_eq!(first.delta, "思考");
        assert_eq!(first.phase, Phase::Thinking);
        let second = events[1].as_ref().expect("event");
        assert_eq!(second.phase, Phase::Answer);
        assert!(second.done);
    }

    #[tokio::test]
    async fn stops_at_done_marker() {
        let first = line("a", "answer", false);
        let after = line("never", "answer", false);
        let events = collect(&[first.as_str(), "data: [DONE]\n", after.as_str()]).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn malformed_json_ends_stream_with_error() {
        let ok = line("ok", "answer", false);
        let after = line("x", "answer", false);
        let events = collect(&[ok.as_str(), "data: {not json}\n", after.as_str()]).await;
        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(UpstreamError::Malformed(_))));
    }

    #[tokio::test]
    async fn inline_error_is_malformed() {
        let events = collect(&[
            "data: {\"type\":\"chat:completion\",\"data\":{\"error\":{\"detail\":\"limit\"}}}\n",
        ])
        .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(UpstreamError::Malformed(_))));
    }

    #[tokio::test]
    async fn missing_phase_keeps_previous_and_comments_are_skipped() {
        let thinking = line("t", "thinking", false);
        let events = collect(&[
            ": keep-alive\n",
            thinking.as_str(),
            "data: {\"type\":\"chat:completion\",\"data\":{\"delta_content\":\"u\"}}\r\n",
        ])
        .await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].as_ref().expect("event").phase, Phase::Thinking);
    }

    #[tokio::test]
    async fn trailing_line_without_newline_is_parsed() {
        let last = line("tail", "answer", true);
        let events = collect(&[last.trim_end()]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().expect("event").delta, "tail");
    }

    #[tokio::test]
    async fn body_error_ends_stream_with_transport_error() {
        let transport_err = reqwest::Client::new()
            .get("not a url")
            .build()
            .expect_err("invalid url");
        let first = line("a", "answer", false);
        let after = line("b", "answer", false);
        let chunks: Vec<Result<Vec<u8>, reqwest::Error>> = vec![
            Ok(first.into_bytes()),
            Err(transport_err),
            Ok(after.into_bytes()),
        ];

        let events: Vec<_> = parse_events(futures::stream::iter(chunks)).collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().expect("event").delta, "a");
        assert!(matches!(events[1], Err(UpstreamError::Transport(_))));
    }

    #[tokio::test]
    async fn usage_only_event_is_kept() {
        let events = collect(&[
            "data: {\"type\":\"chat:completion\",\"data\":{\"phase\":\"answer\",\"done\":true,\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":5,\"total_tokens\":8}}}\n",
        ])
        .await;
        let ev = events[0].as_ref().expect("event");
        assert!(ev.done);
        assert_eq!(ev.usage.map(|u| u.total_tokens), Some(8));
    }
}
