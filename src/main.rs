pub mod config;
pub mod credential;
pub mod error;
pub mod gateway;
pub mod logging;
pub mod runtime_config;
pub mod upstream;
pub mod util;

use anyhow::Context;
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use crate::credential::types::PoolSnapshot;
use crate::credential::{CredentialPool, HealthChecker};
use crate::gateway::GatewayState;
use crate::runtime_config::RuntimeConfig;
use crate::upstream::UpstreamClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::Config::load();

    init_tracing(&cfg);

    let runtime = RuntimeConfig::from_config(&cfg);

    let pool = Arc::new(CredentialPool::new());
    if pool.load(&cfg.cookies).await == 0 {
        tracing::warn!("未配置 Z_AI_COOKIES，可通过 /api/cookies 添加");
    }

    let upstream = UpstreamClient::new(&cfg).context("初始化上游客户端失败")?;

    // 后台健康检查：定期探测失效的 Cookie 并恢复。
    let checker = HealthChecker::new(pool.clone(), upstream.clone(), runtime.clone());
    let checker_handle = checker.clone().start();

    let state = Arc::new(GatewayState {
        relay: gateway::openai::relay::ChatRelay::new(pool, upstream, runtime.clone()),
        runtime: runtime.clone(),
        checker,
        persist_dotenv: true,
    });

    // === 公开路由（不需要认证）===
    let public_routes = Router::new()
        .route("/health", get(handle_health))
        .with_state(state.clone());

    // === OpenAI 兼容 API ===
    let api_routes = Router::new()
        .route("/v1/models", get(gateway::openai::handle_list_models))
        .route(
            "/v1/chat/completions",
            post(gateway::openai::handle_chat_completions),
        )
        // 允许尾随斜杠的同一路径
        .route(
            "/v1/chat/completions/",
            post(gateway::openai::handle_chat_completions),
        );

    // === 管理 API ===
    let admin_routes = Router::new()
        .route(
            "/api/cookies",
            get(gateway::admin::handle_cookies_get)
                .post(gateway::admin::handle_cookies_post)
                .delete(gateway::admin::handle_cookies_delete),
        )
        .route("/api/cookies/test", post(gateway::admin::handle_cookie_test))
        .route(
            "/api/config",
            get(gateway::admin::handle_config_get).put(gateway::admin::handle_config_put),
        )
        .route(
            "/api/config/reload",
            post(gateway::admin::handle_config_reload),
        );

    // 受保护路由（API_KEY 为空时放行）
    let protected_routes = Router::new()
        .merge(api_routes)
        .merge(admin_routes)
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            runtime.clone(),
            gateway::admin::api_key_auth,
        ));

    let app = Router::new().merge(public_routes).merge(protected_routes);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], cfg.port)));

    tracing::info!("Server listening on http://{addr}");
    tracing::info!("对外模型: {} -> 上游模型: {}", cfg.model_name, cfg.upstream_model);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("绑定监听端口失败")?;

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("服务异常退出");

    checker_handle.stop().await;
    served
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    model: String,
    pool: PoolSnapshot,
}

async fn handle_health(State(state): State<Arc<GatewayState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        model: state.runtime.get().model_name.clone(),
        pool: state.relay.pool().snapshot().await,
    })
}

fn init_tracing(cfg: &config::Config) {
    // LOG_LEVEL 控制本项目日志级别，依赖库默认 warn；设置 RUST_LOG 时以其为准。
    let level = runtime_config::normalize_log_level(&cfg.log_level);
    let env = std::env::var("RUST_LOG").unwrap_or_default();
    let env = env.trim();
    let filter = if env.is_empty() {
        EnvFilter::new(format!("warn,zai2api={level}"))
    } else {
        EnvFilter::new(env)
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("收到退出信号，准备关闭服务...");
}
