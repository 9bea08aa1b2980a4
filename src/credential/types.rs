use crate::logging::mask_token;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Failed,
}

/// 池内的一个凭证（z.ai 的 bearer token，对外称 Cookie）。
#[derive(Debug, Clone)]
pub struct Credential {
    pub token: Arc<str>,
    pub status: CredentialStatus,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(token: Arc<str>) -> Self {
        Self {
            token,
            status: CredentialStatus::Active,
            last_failure_at: None,
            last_checked_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }
}

/// `acquire` 的结果：凭证本身加上它在池中的位置（仅用于日志定位）。
#[derive(Debug, Clone)]
pub struct Lease {
    pub slot: usize,
    pub token: Arc<str>,
}

impl Lease {
    pub fn masked(&self) -> String {
        mask_token(&self.token)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolSnapshot {
    pub total: usize,
    pub active: usize,
    pub failed: usize,
    /// 进程启动以来成功 acquire 的次数
    pub acquired_total: u64,
}

/// 管理接口看到的凭证信息，token 已脱敏。
#[derive(Debug, Clone, Serialize)]
pub struct CredentialView {
    pub slot: usize,
    pub token: String,
    pub status: CredentialStatus,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

impl CredentialView {
    pub fn from_credential(slot: usize, c: &Credential) -> Self {
        Self {
            slot,
            token: mask_token(&c.token),
            status: c.status,
            last_failure_at: c.last_failure_at,
            last_checked_at: c.last_checked_at,
        }
    }
}
