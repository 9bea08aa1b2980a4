use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

/// 管理接口与通用处理器的错误。
#[derive(Debug, Error)]
pub enum AppError {
    #[error("未授权: {0}")]
    Unauthorized(String),

    #[error("参数错误: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// 网关请求路径上的错误，对应 OpenAI 风格的错误响应。
#[derive(Debug, Error)]
pub enum GatewayError {
    /// 不支持的模型：客户端错误，不消耗任何凭证。
    #[error("不支持的模型: {0}")]
    InvalidModel(String),

    /// 没有可用（Active）的凭证。
    #[error("没有可用的 Cookie，请等待健康检查恢复或重新加载")]
    PoolExhausted,

    /// 已对所有可用凭证各尝试一次，仍然失败。
    #[error("上游服务不可用: {0}")]
    UpstreamUnavailable(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidModel(_) => StatusCode::BAD_REQUEST,
            Self::PoolExhausted => StatusCode::SERVICE_UNAVAILABLE,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidModel(_) => "invalid_request_error",
            Self::PoolExhausted => "pool_exhausted",
            Self::UpstreamUnavailable(_) => "upstream_error",
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorBodyInner,
}

#[derive(Debug, Serialize)]
pub struct ErrorBodyInner {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#type: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            error: ErrorBodyInner {
                message: message.into(),
                r#type: Some(ty.into()),
            },
        }
    }
}

impl AppError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, ty) = match self {
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Anyhow(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        (status, Json(ErrorBody::new(self.to_string(), ty))).into_response()
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        (status, Json(ErrorBody::new(self.to_string(), self.kind()))).into_response()
    }
}
