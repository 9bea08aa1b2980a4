use crate::credential::types::{
    Credential, CredentialStatus, CredentialView, Lease, PoolSnapshot,
};
use crate::error::GatewayError;
use crate::logging::mask_token;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// 凭证池：轮询选择、失效标记与恢复。
///
/// 所有状态都在同一把锁内修改，锁只覆盖内存操作，网络请求一律在锁外进行。
#[derive(Debug, Default)]
pub struct CredentialPool {
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    credentials: Vec<Credential>,
    cursor: usize,
    acquired_total: u64,
}

impl State {
    fn find_mut(&mut self, token: &str) -> Option<(usize, &mut Credential)> {
        self.credentials
            .iter_mut()
            .enumerate()
            .find(|(_, c)| &*c.token == token)
    }
}

impl CredentialPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// 整体替换凭证集合：去空白、去重（保留首次出现的顺序），游标归零。
    /// 返回装载后的数量。
    pub async fn load<I, S>(&self, tokens: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let credentials = dedup_tokens(tokens);
        let count = credentials.len();

        let mut state = self.state.write().await;
        state.credentials = credentials;
        state.cursor = 0;
        drop(state);

        if count == 0 {
            tracing::warn!("Cookie 池已清空，请求将返回 503 直到重新加载");
        } else {
            tracing::info!("Cookie 池已加载 {count} 个凭证");
        }
        count
    }

    pub async fn clear(&self) {
        self.load(std::iter::empty::<&str>()).await;
    }

    /// 从游标位置开始轮询，跳过失效凭证；最多检查一整圈。
    pub async fn acquire(&self) -> Result<Lease, GatewayError> {
        let mut state = self.state.write().await;
        let len = state.credentials.len();
        for _ in 0..len {
            let idx = state.cursor % len;
            state.cursor = (idx + 1) % len;
            if state.credentials[idx].is_active() {
                state.acquired_total += 1;
                return Ok(Lease {
                    slot: idx,
                    token: state.credentials[idx].token.clone(),
                });
            }
        }
        Err(GatewayError::PoolExhausted)
    }

    /// Active → Failed。已是 Failed 或凭证已不在池中（被重新加载替换）时不做任何事。
    pub async fn mark_failed(&self, token: &str) -> bool {
        let mut state = self.state.write().await;
        let Some((slot, c)) = state.find_mut(token) else {
            return false;
        };
        if c.status == CredentialStatus::Failed {
            return false;
        }
        c.status = CredentialStatus::Failed;
        c.last_failure_at = Some(Utc::now());
        drop(state);

        tracing::warn!(slot, token = %mask_token(token), "Cookie 已标记为失效");
        true
    }

    /// Failed → Active。
    pub async fn mark_recovered(&self, token: &str) -> bool {
        let mut state = self.state.write().await;
        let Some((slot, c)) = state.find_mut(token) else {
            return false;
        };
        if c.status == CredentialStatus::Active {
            return false;
        }
        c.status = CredentialStatus::Active;
        drop(state);

        tracing::info!(slot, token = %mask_token(token), "Cookie 已恢复");
        true
    }

    /// 记录一次健康检查时间（无论结果）。
    pub async fn record_checked(&self, token: &str) {
        let mut state = self.state.write().await;
        if let Some((_, c)) = state.find_mut(token) {
            c.last_checked_at = Some(Utc::now());
        }
    }

    pub async fn failed_tokens(&self) -> Vec<Arc<str>> {
        let state = self.state.read().await;
        state
            .credentials
            .iter()
            .filter(|c| !c.is_active())
            .map(|c| c.token.clone())
            .collect()
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.read().await;
        let total = state.credentials.len();
        let active = state.credentials.iter().filter(|c| c.is_active()).count();
        PoolSnapshot {
            total,
            active,
            failed: total - active,
            acquired_total: state.acquired_total,
        }
    }

    pub async fn entries(&self) -> Vec<CredentialView> {
        let state = self.state.read().await;
        state
            .credentials
            .iter()
            .enumerate()
            .map(|(i, c)| CredentialView::from_credential(i, c))
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.credentials.len()
    }
}

fn dedup_tokens<I, S>(tokens: I) -> Vec<Credential>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen: HashSet<Arc<str>> = HashSet::new();
    let mut out = Vec::new();
    for t in tokens {
        let t = t.as_ref().trim();
        if t.is_empty() {
            continue;
        }
        let token: Arc<str> = Arc::from(t);
        if seen.insert(token.clone()) {
            out.push(Credential::new(token));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    async fn pool_of(tokens: &[&str]) -> CredentialPool {
        let pool = CredentialPool::new();
        pool.load(tokens.iter().copied()).await;
        pool
    }

    #[tokio::test]
    async fn acquire_visits_every_active_credential_once_per_cycle() {
        let pool = pool_of(&["a", "b", "c", "d"]).await;
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(pool.acquire().await.expect("active").token.to_string());
        }
        assert_eq!(seen, vec!["a", "b", "c", "d"]);
        assert_eq!(&*pool.acquire().await.expect("active").token, "a");
    }

    #[tokio::test]
    async fn failed_credential_is_skipped_while_others_are_active() {
        let pool = pool_of(&["A", "B"]).await;
        assert!(pool.mark_failed("A").await);
        for _ in 0..3 {
            assert_eq!(&*pool.acquire().await.expect("B active").token, "B");
        }
    }

    #[tokio::test]
    async fn sole_failed_credential_exhausts_pool() {
        let pool = pool_of(&["only"]).await;
        pool.mark_failed("only").await;
        assert!(matches!(
            pool.acquire().await,
            Err(GatewayError::PoolExhausted)
        ));
    }

    #[tokio::test]
    async fn empty_pool_is_exhausted() {
        let pool = CredentialPool::new();
        assert!(matches!(
            pool.acquire().await,
            Err(GatewayError::PoolExhausted)
        ));
        pool.load(["x"]).await;
        pool.clear().await;
        assert!(matches!(
            pool.acquire().await,
            Err(GatewayError::PoolExhausted)
        ));
        assert_eq!(pool.snapshot().await.total, 0);
    }

    #[tokio::test]
    async fn recovered_credential_is_eligible_again() {
        let pool = pool_of(&["A", "B"]).await;
        pool.mark_failed("A").await;
        assert!(pool.mark_recovered("A").await);

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(pool.acquire().await.expect("active").token.to_string());
        }
        seen.sort();
        assert_eq!(seen, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn transitions_are_idempotent() {
        let pool = pool_of(&["A"]).await;
        assert!(pool.mark_failed("A").await);
        let first_failure = pool.entries().await[0].last_failure_at;
        assert!(!pool.mark_failed("A").await);
        assert_eq!(pool.entries().await[0].last_failure_at, first_failure);

        assert!(pool.mark_recovered("A").await);
        assert!(!pool.mark_recovered("A").await);
        assert!(!pool.mark_failed("unknown").await);
    }

    #[tokio::test]
    async fn load_trims_dedups_and_resets_cursor() {
        let pool = pool_of(&["a", "b", "c"]).await;
        pool.acquire().await.expect("active");
        pool.acquire().await.expect("active");
        pool.mark_failed("a").await;

        let n = pool.load([" b ", "a", "", "b", "c", "a"]).await;
        assert_eq!(n, 3);
        let snap = pool.snapshot().await;
        assert_eq!((snap.total, snap.active, snap.failed), (3, 3, 0));
        // 游标归零：从新列表第一个开始
        assert_eq!(&*pool.acquire().await.expect("active").token, "b");
    }

    #[tokio::test]
    async fn snapshot_counts_health_and_acquisitions() {
        let pool = pool_of(&["a", "b", "c"]).await;
        pool.mark_failed("b").await;
        pool.acquire().await.expect("active");
        pool.acquire().await.expect("active");
        let snap = pool.snapshot().await;
        assert_eq!(
            snap,
            PoolSnapshot {
                total: 3,
                active: 2,
                failed: 1,
                acquired_total: 2
            }
        );
        assert_eq!(pool.failed_tokens().await, vec![Arc::<str>::from("b")]);
    }

    #[tokio::test]
    async fn entries_mask_tokens() {
        let pool = pool_of(&["eyJhbGciOiJIUzI1NiJ9.secret-part.tail"]).await;
        let entries = pool.entries().await;
        assert_eq!(entries[0].token, "eyJhbG...tail");
        assert_eq!(entries[0].status, CredentialStatus::Active);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_stay_round_robin() {
        let pool = Arc::new(pool_of(&["a", "b", "c", "d", "e"]).await);
        let mut handles = Vec::new();
        for _ in 0..50 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.acquire().await.expect("active").token.to_string()
            }));
        }
        let mut counts: HashMap<String, usize> = HashMap::new();
        for h in handles {
            *counts.entry(h.await.expect("join")).or_default() += 1;
        }
        assert_eq!(counts.len(), 5);
        assert!(counts.values().all(|&n| n == 10));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn reload_during_acquires_never_mixes_sets() {
        let pool = Arc::new(pool_of(&["old1", "old2"]).await);
        let reloader = {
            let pool = pool.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    if i % 2 == 0 {
                        pool.load(["new1", "new2", "new3"]).await;
                    } else {
                        pool.load(["old1", "old2"]).await;
                    }
                }
            })
        };
        let mut handles = Vec::new();
        for _ in 0..100 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.acquire().await }));
        }
        for h in handles {
            let lease = h.await.expect("join").expect("pool never empty");
            assert!(["old1", "old2", "new1", "new2", "new3"].contains(&&*lease.token));
        }
        reloader.await.expect("join");
    }
}
