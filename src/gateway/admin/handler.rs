use crate::config::Config;
use crate::credential::types::{CredentialView, PoolSnapshot};
use crate::error::AppError;
use crate::gateway::GatewayState;
use crate::logging::mask_token;
use crate::runtime_config::{ConfigUpdate, ConfigView, RuntimeConfig, RuntimeSettings};
use crate::util::dotenv;
use axum::Json;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize)]
pub struct CookiesResponse {
    #[serde(flatten)]
    pub snapshot: PoolSnapshot,
    pub cookies: Vec<CredentialView>,
}

#[derive(Debug, Deserialize)]
pub struct CookieUpdateRequest {
    #[serde(default)]
    pub cookies: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct CookieTestRequest {
    #[serde(default)]
    pub cookie: String,
}

#[derive(Debug, Serialize)]
pub struct CookieTestResponse {
    pub cookie: String,
    pub is_valid: bool,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub updated_fields: Vec<&'static str>,
}

impl MessageResponse {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            count: None,
            updated_fields: Vec::new(),
        }
    }
}

pub async fn handle_cookies_get(State(state): State<Arc<GatewayState>>) -> Json<CookiesResponse> {
    let pool = state.relay.pool();
    Json(CookiesResponse {
        snapshot: pool.snapshot().await,
        cookies: pool.entries().await,
    })
}

pub async fn handle_cookies_post(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CookieUpdateRequest>,
) -> Result<Json<MessageResponse>, AppError> {
    let valid: Vec<String> = req
        .cookies
        .iter()
        .map(|c| c.trim())
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    if valid.is_empty() {
        return Err(AppError::bad_request("至少需要一个有效的 Cookie"));
    }

    let count = state.relay.pool().load(&valid).await;
    persist(&state, vec![("Z_AI_COOKIES", valid.join(","))]).await;

    Ok(Json(MessageResponse {
        count: Some(count),
        ..MessageResponse::new(format!("成功更新 {count} 个 Cookie"))
    }))
}

pub async fn handle_cookies_delete(State(state): State<Arc<GatewayState>>) -> Json<MessageResponse> {
    state.relay.pool().clear().await;
    persist(&state, vec![("Z_AI_COOKIES", String::new())]).await;
    Json(MessageResponse::new("已清空所有 Cookie"))
}

pub async fn handle_cookie_test(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<CookieTestRequest>,
) -> Result<Json<CookieTestResponse>, AppError> {
    let cookie = req.cookie.trim();
    if cookie.is_empty() {
        return Err(AppError::bad_request("请提供 Cookie"));
    }

    let (is_valid, message) = match state.checker.probe(cookie).await {
        Ok(()) => (true, "Cookie 有效".to_string()),
        Err(e) => (false, format!("Cookie 无效: {e}")),
    };
    Ok(Json(CookieTestResponse {
        cookie: mask_token(cookie),
        is_valid,
        message,
    }))
}

pub async fn handle_config_get(State(state): State<Arc<GatewayState>>) -> Json<ConfigView> {
    Json(ConfigView::from_runtime(&state.runtime.get()))
}

pub async fn handle_config_put(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<ConfigUpdate>,
) -> Result<Json<MessageResponse>, AppError> {
    req.validate().map_err(AppError::bad_request)?;

    state.runtime.update_with(|cur| req.apply_to(cur));
    persist(&state, req.dotenv_pairs()).await;

    let updated_fields = req.updated_fields();
    tracing::info!("配置已更新: {}", updated_fields.join(", "));
    Ok(Json(MessageResponse {
        updated_fields: updated_fields.clone(),
        ..MessageResponse::new(format!("已更新配置: {}", updated_fields.join(", ")))
    }))
}

/// 重新读取 `.env` 与环境变量，刷新运行时配置并按 `Z_AI_COOKIES` 重新装载 Cookie 池。
pub async fn handle_config_reload(State(state): State<Arc<GatewayState>>) -> Json<MessageResponse> {
    let cfg = if state.persist_dotenv {
        match tokio::task::spawn_blocking(Config::reload).await {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("读取 .env 失败，只使用环境变量: {e}");
                Config::from_env()
            }
        }
    } else {
        Config::from_env()
    };
    reload_from(&state, &cfg).await
}

async fn reload_from(state: &GatewayState, cfg: &Config) -> Json<MessageResponse> {
    state.runtime.update_with(|current| {
        let mut next = RuntimeSettings::from_config(cfg);
        // 监听地址与模型名只在启动时生效
        next.host = current.host.clone();
        next.port = current.port;
        next.model_name = current.model_name.clone();
        next.upstream_model = current.upstream_model.clone();
        next
    });

    let count = state.relay.pool().load(&cfg.cookies).await;
    Json(MessageResponse {
        count: Some(count),
        ..MessageResponse::new("配置已重新加载")
    })
}

/// 写回 `.env`。文件读写放到阻塞线程池，不占用 runtime 工作线程。
async fn persist(state: &GatewayState, updates: Vec<(&'static str, String)>) {
    if !state.persist_dotenv || updates.is_empty() {
        return;
    }
    match tokio::task::spawn_blocking(move || dotenv::persist(&updates)).await {
        Ok(Ok(path)) => tracing::debug!("已写回 {}", path.display()),
        Ok(Err(e)) => tracing::warn!("写回 .env 失败: {e}"),
        Err(e) => tracing::warn!("写回 .env 任务异常: {e}"),
    }
}

/// `API_KEY` 认证：`Authorization: Bearer <key>` 或 `x-api-key`。未配置 `API_KEY` 时放行。
pub async fn api_key_auth(
    State(runtime): State<RuntimeConfig>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let expected = runtime.get().api_key.clone();
    if expected.is_empty() || presented_key(&headers).is_some_and(|k| k == expected) {
        return next.run(request).await;
    }
    AppError::unauthorized("API Key 无效或缺失").into_response()
}

fn presented_key(headers: &HeaderMap) -> Option<&str> {
    if let Some(v) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    {
        let v = v.trim();
        return Some(v.strip_prefix("Bearer ").unwrap_or(v).trim());
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::health_task::HealthChecker;
    use crate::credential::pool::CredentialPool;
    use crate::credential::types::CredentialStatus;
    use crate::gateway::openai::relay::ChatRelay;
    use crate::upstream::UpstreamClient;
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn state_for(server_uri: &str, api_key: &str) -> Arc<GatewayState> {
        let mut cfg = Config::defaults();
        cfg.upstream_url = format!("{server_uri}/api/chat/completions");
        cfg.api_key = api_key.to_string();
        let pool = Arc::new(CredentialPool::new());
        let upstream = UpstreamClient::new(&cfg).expect("client");
        let runtime = RuntimeConfig::from_config(&cfg);
        Arc::new(GatewayState {
            relay: ChatRelay::new(pool.clone(), upstream.clone(), runtime.clone()),
            checker: HealthChecker::new(pool, upstream, runtime.clone()),
            runtime,
            persist_dotenv: false,
        })
    }

    #[tokio::test]
    async fn post_cookies_replaces_pool_and_rejects_empty() {
        let state = state_for("http://127.0.0.1:9", "");
        let Json(resp) = handle_cookies_post(
            State(state.clone()),
            Json(CookieUpdateRequest {
                cookies: vec![" a-token ".into(), "".into(), "b-token".into(), "a-token".into()],
            }),
        )
        .await
        .expect("loaded");
        assert_eq!(resp.count, Some(2));

        let Json(view) = handle_cookies_get(State(state.clone())).await;
        assert_eq!(view.snapshot.total, 2);
        assert_eq!(view.cookies[0].status, CredentialStatus::Active);

        let err = handle_cookies_post(
            State(state.clone()),
            Json(CookieUpdateRequest {
                cookies: vec!["  ".into()],
            }),
        )
        .await
        .expect_err("empty");
        assert!(matches!(err, AppError::BadRequest(_)));
        // 失败的请求不改变现有 Cookie
        assert_eq!(state.relay.pool().len().await, 2);

        handle_cookies_delete(State(state.clone())).await;
        assert_eq!(state.relay.pool().len().await, 0);
    }

    #[tokio::test]
    async fn cookie_test_reports_probe_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer good-cookie-value"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        let state = state_for(&server.uri(), "");

        let Json(ok) = handle_cookie_test(
            State(state.clone()),
            Json(CookieTestRequest {
                cookie: "good-cookie-value".into(),
            }),
        )
        .await
        .expect("tested");
        assert!(ok.is_valid);
        assert_eq!(ok.cookie, "good-c...alue");

        let Json(bad) = handle_cookie_test(
            State(state.clone()),
            Json(CookieTestRequest {
                cookie: "bad-cookie-value".into(),
            }),
        )
        .await
        .expect("tested");
        assert!(!bad.is_valid);

        let err = handle_cookie_test(State(state), Json(CookieTestRequest { cookie: " ".into() }))
            .await
            .expect_err("missing");
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[tokio::test]
    async fn config_put_applies_immediately() {
        let state = state_for("http://127.0.0.1:9", "");
        let req: ConfigUpdate =
            serde_json::from_str(r#"{"show_think_tags":true,"refresh_check_interval":30}"#)
                .expect("update");
        let Json(resp) = handle_config_put(State(state.clone()), Json(req))
            .await
            .expect("updated");
        assert_eq!(
            resp.updated_fields,
            vec!["show_think_tags", "refresh_check_interval"]
        );

        let Json(view) = handle_config_get(State(state.clone())).await;
        assert!(view.show_think_tags);
        assert_eq!(view.refresh_check_interval, 30);

        let bad: ConfigUpdate =
            serde_json::from_str(r#"{"log_level":"loud"}"#).expect("update");
        assert!(handle_config_put(State(state), Json(bad)).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_config_puts_keep_both_changes() {
        let state = state_for("http://127.0.0.1:9", "");
        let think: ConfigUpdate =
            serde_json::from_str(r#"{"show_think_tags":true}"#).expect("update");
        let stream: ConfigUpdate =
            serde_json::from_str(r#"{"default_stream":true}"#).expect("update");

        let (a, b) = tokio::join!(
            tokio::spawn(handle_config_put(State(state.clone()), Json(think))),
            tokio::spawn(handle_config_put(State(state.clone()), Json(stream))),
        );
        assert!(a.expect("join").is_ok());
        assert!(b.expect("join").is_ok());

        let settings = state.runtime.get();
        assert!(settings.show_think_tags);
        assert!(settings.default_stream);
    }

    #[tokio::test]
    async fn reload_replaces_pool_from_config() {
        let state = state_for("http://127.0.0.1:9", "");
        state.relay.pool().load(["old-token"]).await;
        let mut cfg = Config::defaults();
        cfg.cookies = vec!["new-1".into(), "new-2".into()];
        cfg.show_think_tags = true;

        let Json(resp) = reload_from(&state, &cfg).await;
        assert_eq!(resp.count, Some(2));
        assert!(state.runtime.get().show_think_tags);
        assert_eq!(state.relay.pool().snapshot().await.total, 2);
    }

    #[tokio::test]
    async fn api_key_middleware_guards_routes() {
        let state = state_for("http://127.0.0.1:9", "sk-secret");
        let app = Router::new()
            .route("/api/cookies", get(handle_cookies_get))
            .with_state(state.clone())
            .layer(axum::middleware::from_fn_with_state(
                state.runtime.clone(),
                api_key_auth,
            ));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        let url = format!("http://{addr}/api/cookies");
        let client = reqwest::Client::new();
        let denied = client.get(&url).send().await.expect("send");
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let wrong = client
            .get(&url)
            .bearer_auth("nope")
            .send()
            .await
            .expect("send");
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let ok = client
            .get(&url)
            .bearer_auth("sk-secret")
            .send()
            .await
            .expect("send");
        assert_eq!(ok.status(), StatusCode::OK);

        let via_header = client
            .get(&url)
            .header("x-api-key", "sk-secret")
            .send()
            .await
            .expect("send");
        assert_eq!(via_header.status(), StatusCode::OK);
    }
}
