//! 对外的 HTTP 网关：OpenAI 兼容接口与管理接口共用同一份状态。

pub mod admin;
pub mod openai;
pub mod think;

use crate::credential::health_task::HealthChecker;
use crate::gateway::openai::relay::ChatRelay;
use crate::runtime_config::RuntimeConfig;

pub struct GatewayState {
    pub relay: ChatRelay,
    pub runtime: RuntimeConfig,
    /// 管理接口测试单个 Cookie 时复用健康检查的探测逻辑
    pub checker: HealthChecker,
    /// 管理接口的修改是否写回 `.env`
    pub persist_dotenv: bool,
}
