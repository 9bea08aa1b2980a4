use super::convert::{convert_usage, to_models_response};
use super::relay::OpenedStream;
use super::stream::{StreamWriter, now_unix, sse_error_events};
use super::types::ChatRequest;
use crate::credential::pool::CredentialPool;
use crate::error::GatewayError;
use crate::gateway::GatewayState;
use crate::gateway::think::ThinkTagger;
use crate::logging;
use crate::util::id;
use axum::Json;
use axum::body::Bytes;
use axum::extract::OriginalUri;
use axum::extract::State;
use axum::http::StatusCode;
use axum::http::{HeaderMap, Method};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub async fn handle_list_models(State(state): State<Arc<GatewayState>>) -> Response {
    let settings = state.runtime.get();
    (StatusCode::OK, Json(to_models_response(&settings.model_name))).into_response()
}

pub async fn handle_chat_completions(
    State(state): State<Arc<GatewayState>>,
    method: Method,
    uri: OriginalUri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let start = Instant::now();
    let settings = state.runtime.get();
    let log_level = settings.detail_log_level();
    if log_level.client_enabled() {
        logging::client_request(method.as_str(), uri.0.path(), &headers, body.as_ref());
    }

    let req: ChatRequest = match sonic_rs::from_slice(body.as_ref()) {
        Ok(v) => v,
        Err(_) => {
            let msg = "请求 JSON 解析失败，请检查请求体格式。";
            if log_level.client_enabled() {
                logging::client_response(
                    StatusCode::BAD_REQUEST.as_u16(),
                    start.elapsed(),
                    openai_error_body(msg).as_bytes(),
                );
            }
            return openai_error(StatusCode::BAD_REQUEST, msg);
        }
    };

    if req.wants_stream(settings.default_stream) {
        let opened = match state.relay.open_stream(&req).await {
            Ok(v) => v,
            Err(e) => return gateway_error(e, log_level.client_enabled(), start),
        };
        tracing::debug!(slot = opened.lease.slot, "上游流已建立");

        let (tx, rx) = mpsc::channel::<String>(256);
        let writer = StreamWriter::new(
            id::chat_completion_id(),
            now_unix(),
            req.model.clone(),
            log_level.client_enabled(),
        );
        let pool = state.relay.pool().clone();
        tokio::spawn(async move {
            let writer = pump_stream(opened, pool, writer, tx).await;
            if log_level.client_enabled() {
                logging::client_stream_response(
                    StatusCode::OK.as_u16(),
                    start.elapsed(),
                    writer.merged_content(),
                    writer.chunk_count(),
                );
            }
        });

        let events = ReceiverStream::new(rx).map(|s| Ok::<_, Infallible>(Event::default().data(s)));
        return Sse::new(events).into_response();
    }

    match state.relay.complete(&req).await {
        Ok(out) => {
            if log_level.client_enabled()
                && let Ok(bytes) = sonic_rs::to_vec(&out)
            {
                logging::client_response(StatusCode::OK.as_u16(), start.elapsed(), &bytes);
            }
            (StatusCode::OK, Json(out)).into_response()
        }
        Err(e) => gateway_error(e, log_level.client_enabled(), start),
    }
}

/// 把上游事件逐个转成 OpenAI chunk 发给客户端，不做思考段过滤。
///
/// 客户端断开（接收端关闭）时立即停止并丢弃上游流；
/// 流中途出错时标记凭证失效，发送错误事件与 `[DONE]` 后结束。
pub(crate) async fn pump_stream(
    opened: OpenedStream,
    pool: Arc<CredentialPool>,
    mut writer: StreamWriter,
    tx: mpsc::Sender<String>,
) -> StreamWriter {
    let OpenedStream {
        lease,
        first,
        mut rest,
    } = opened;
    let mut tagger = ThinkTagger::new();
    let mut usage = first.usage;

    if !send_all(&tx, writer.write_content(&tagger.tag(&first))).await {
        return writer;
    }
    let mut done = first.done;

    while !done {
        let next = tokio::select! {
            _ = tx.closed() => {
                tracing::debug!(slot = lease.slot, "客户端已断开，停止读取上游");
                return writer;
            }
            n = rest.next() => n,
        };
        match next {
            None => break,
            Some(Ok(ev)) => {
                if ev.usage.is_some() {
                    usage = ev.usage;
                }
                done = ev.done;
                if !send_all(&tx, writer.write_content(&tagger.tag(&ev))).await {
                    return writer;
                }
            }
            Some(Err(e)) => {
                tracing::warn!(
                    slot = lease.slot,
                    token = %lease.masked(),
                    class = e.class(),
                    "上游流中断: {e}"
                );
                pool.mark_failed(&lease.token).await;
                send_all(&tx, sse_error_events(&e.to_string())).await;
                return writer;
            }
        }
    }
    drop(rest);

    if let Some(close) = tagger.finish() {
        let events = writer.write_content(close);
        if !send_all(&tx, events).await {
            return writer;
        }
    }
    let events = writer.finish_events("stop", convert_usage(usage));
    send_all(&tx, events).await;
    writer
}

async fn send_all(tx: &mpsc::Sender<String>, events: Vec<String>) -> bool {
    for ev in events {
        if tx.send(ev).await.is_err() {
            return false;
        }
    }
    true
}

fn gateway_error(e: GatewayError, log: bool, start: Instant) -> Response {
    let status = e.status();
    tracing::warn!(kind = e.kind(), "请求失败: {e}");
    if log {
        logging::client_response(
            status.as_u16(),
            start.elapsed(),
            openai_error_body(&e.to_string()).as_bytes(),
        );
    }
    e.into_response()
}

fn openai_error(status: StatusCode, msg: &str) -> Response {
    let body = openai_error_body(msg);
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}

fn openai_error_body(msg: &str) -> String {
    let encoded = sonic_rs::to_string(msg).unwrap_or_else(|_| "\"\"".to_string());
    format!("{{\"error\":{{\"message\":{encoded},\"type\":\"invalid_request_error\"}}}}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::types::CredentialStatus;
    use crate::gateway::openai::relay::tests::{THINK_THEN_ANSWER, chat, mount_sse, relay_for};
    use sonic_rs::JsonValueTrait;
    use wiremock::MockServer;

    fn contents(events: &[String]) -> String {
        events
            .iter()
            .filter(|e| e.as_str() != "[DONE]")
            .filter_map(|e| sonic_rs::from_str::<sonic_rs::Value>(e).ok())
            .filter_map(|v| {
                v["choices"][0]["delta"]["content"]
                    .as_str()
                    .map(str::to_string)
            })
            .collect()
    }

    async fn drain(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(s) = rx.recv().await {
            out.push(s);
        }
        out
    }

    #[tokio::test]
    async fn streaming_never_filters_reasoning() {
        let server = MockServer::start().await;
        mount_sse(&server, "token-a", THINK_THEN_ANSWER).await;
        // show_think_tags=false 只影响非流式
        let relay = relay_for(&server, &["token-a"], false).await;

        let opened = relay.open_stream(&chat("GLM-4.5", Some(true))).await.expect("opened");
        let (tx, rx) = mpsc::channel(256);
        let writer = StreamWriter::new("chatcmpl-t".into(), 1, "GLM-4.5".into(), true);
        let pump = tokio::spawn(pump_stream(opened, relay.pool().clone(), writer, tx));
        let events = drain(rx).await;
        let writer = pump.await.expect("join");

        assert_eq!(contents(&events), "<think>reasoning</think>answer");
        assert_eq!(events.last().map(String::as_str), Some("[DONE]"));
        let role: sonic_rs::Value = sonic_rs::from_str(&events[0]).expect("json");
        assert_eq!(role["choices"][0]["delta"]["role"].as_str(), Some("assistant"));
        let fin: sonic_rs::Value = sonic_rs::from_str(&events[events.len() - 2]).expect("json");
        assert_eq!(fin["choices"][0]["finish_reason"].as_str(), Some("stop"));
        assert_eq!(fin["usage"]["total_tokens"].as_u64(), Some(3));
        assert_eq!(writer.merged_content(), "<think>reasoning</think>answer");
    }

    #[tokio::test]
    async fn mid_stream_error_marks_credential_and_ends_with_error_event() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"type\":\"chat:completion\",\"data\":{\"delta_content\":\"partial\",\"phase\":\"answer\"}}\n\n",
            "data: {\"type\":\"chat:completion\",\"data\":{\"error\":{\"detail\":\"boom\"}}}\n\n",
        );
        mount_sse(&server, "token-a", body).await;
        let relay = relay_for(&server, &["token-a"], false).await;

        let opened = relay.open_stream(&chat("GLM-4.5", Some(true))).await.expect("opened");
        let (tx, rx) = mpsc::channel(256);
        let writer = StreamWriter::new("chatcmpl-t".into(), 1, "GLM-4.5".into(), false);
        let pump = tokio::spawn(pump_stream(opened, relay.pool().clone(), writer, tx));
        let events = drain(rx).await;
        pump.await.expect("join");

        assert_eq!(contents(&events), "partial");
        let err: sonic_rs::Value = sonic_rs::from_str(&events[events.len() - 2]).expect("json");
        assert_eq!(err["error"]["type"].as_str(), Some("server_error"));
        assert_eq!(events.last().map(String::as_str), Some("[DONE]"));
        assert_eq!(relay.pool().entries().await[0].status, CredentialStatus::Failed);
    }

    #[tokio::test]
    async fn closed_receiver_stops_pump() {
        let server = MockServer::start().await;
        mount_sse(&server, "token-a", THINK_THEN_ANSWER).await;
        let relay = relay_for(&server, &["token-a"], false).await;

        let opened = relay.open_stream(&chat("GLM-4.5", Some(true))).await.expect("opened");
        let (tx, rx) = mpsc::channel(256);
        drop(rx);
        let writer = StreamWriter::new("chatcmpl-t".into(), 1, "GLM-4.5".into(), false);
        let writer = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            pump_stream(opened, relay.pool().clone(), writer, tx),
        )
        .await
        .expect("pump 应立即返回");

        // 发送首个 chunk 即失败，不会写出 finish
        assert!(writer.chunk_count() <= 2);
        assert_eq!(relay.pool().snapshot().await.failed, 0);
    }
}
