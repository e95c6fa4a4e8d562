//! The token pool and lease manager: the single serialization point for
//! token accounting and the lease table.
//!
//! The pool lock is a `tokio::sync::Mutex`, not a `std::sync::Mutex` — the
//! `try_acquire` retry loop needs to `.await` a sleep between attempts
//! without holding the lock across the await point, which an async mutex
//! permits and a sync one does not. This mirrors
//! `network/session.rs::SessionManager`'s `Arc<RwLock<HashMap<...>>>`
//! shape, generalized from sessions to leases and from read/write access to
//! a single serialized owner.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::budget::{self, ThrottleLevel, TokenBudgetConfig};
use crate::classifier::{self, ClassificationInput, ClassifierConfig};
use crate::memory_probe::MemoryProbe;

/// `acquire` never holds a lease open past this without a release.
pub const LEASE_TTL: Duration = Duration::from_secs(30 * 60);
const LONG_RUNNING_WARNING: Duration = Duration::from_secs(10 * 60);

/// An in-flight tool invocation holding tokens.
#[derive(Debug, Clone)]
pub struct Lease {
    pub lease_id: String,
    pub tool: String,
    pub tokens: u32,
    pub acquired_at: Instant,
    pub expires_at: Instant,
    pub commit_ratio_at_acquire: f64,
    pub warning_logged: bool,
}

#[derive(Debug, Clone)]
pub enum AcquireOutcome {
    Granted {
        lease_id: String,
        granted_tokens: u32,
        recommended_parallelism: u32,
        commit_ratio: f64,
    },
    Denied {
        reason: String,
        recommended_parallelism: u32,
        commit_ratio: f64,
    },
}

#[derive(Debug, Clone)]
pub struct ReleaseOutcome {
    pub acknowledged: bool,
    pub classification: Option<classifier::Classification>,
    pub message: Option<String>,
    pub should_retry: bool,
    pub retry_with_tokens: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LeaseSummary {
    pub lease_id: String,
    pub tool: String,
    pub tokens: u32,
    pub duration_seconds: u64,
    pub expires_in_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct PoolStatus {
    pub total_tokens: u32,
    pub available_tokens: u32,
    pub active_leases: u32,
    pub expired_leases: u64,
    pub commit_ratio: f64,
    pub commit_charge_bytes: u64,
    pub commit_limit_bytes: u64,
    pub available_memory_bytes: u64,
    pub recommended_parallelism: u32,
    pub throttle_level: ThrottleLevel,
    pub recent_leases: Vec<LeaseSummary>,
}

/// Lifetime counters, independent of current pool state — grounded in
/// `token_pool.rs`'s atomic usage counters on `TokenPool`.
#[derive(Debug, Clone, Default)]
pub struct PoolMetrics {
    pub total_granted: u64,
    pub total_denied: u64,
    pub total_released: u64,
    pub total_expired: u64,
}

struct PoolState {
    leases: HashMap<String, Lease>,
    total_tokens: u32,
    available_tokens: u32,
    metrics: PoolMetrics,
}

/// Serializes access to the token count and lease table; the only mutator
/// of either.
pub struct TokenPool {
    state: Mutex<PoolState>,
    probe: Arc<MemoryProbe>,
    budget_config: TokenBudgetConfig,
    classifier_config: ClassifierConfig,
}

impl TokenPool {
    pub fn new(
        probe: Arc<MemoryProbe>,
        budget_config: TokenBudgetConfig,
        classifier_config: ClassifierConfig,
    ) -> Self {
        let snapshot = probe.sample();
        let initial_budget = budget::compute(&snapshot, &budget_config);
        Self {
            state: Mutex::new(PoolState {
                leases: HashMap::new(),
                total_tokens: initial_budget.total_tokens,
                available_tokens: initial_budget.total_tokens,
                metrics: PoolMetrics::default(),
            }),
            probe,
            budget_config,
            classifier_config,
        }
    }

    fn new_lease_id(leases: &HashMap<String, Lease>) -> String {
        loop {
            let id: String = (0..12)
                .map(|_| {
                    let n: u8 = rand::thread_rng().gen_range(0..16);
                    std::char::from_digit(n as u32, 16).unwrap()
                })
                .collect();
            if !leases.contains_key(&id) {
                return id;
            }
        }
    }

    /// Recomputes the budget in place and reconciles `available_tokens` per
    /// the spec's reconciliation rule: `max(0, new_total - in_use)`.
    /// Outstanding leases always retain their grant; a shrinking budget
    /// reduces future admission, it never revokes what's already out.
    fn reconcile(state: &mut PoolState, new_total: u32) {
        let in_use = state.total_tokens.saturating_sub(state.available_tokens);
        state.total_tokens = new_total;
        state.available_tokens = new_total.saturating_sub(in_use);
    }

    /// Grants or denies a lease request, retrying with throttle-dependent
    /// backoff until `timeout` elapses. See spec §4.C for the algorithm;
    /// the lock is released before every sleep, never held across await.
    pub async fn try_acquire(
        &self,
        tool: &str,
        requested_tokens: u32,
        timeout: Duration,
    ) -> AcquireOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            let snapshot = self.probe.sample();
            let budget = budget::compute(&snapshot, &self.budget_config);

            let mut state = self.state.lock().await;
            Self::reconcile(&mut state, budget.total_tokens);

            if budget.throttle_level == ThrottleLevel::HardStop {
                state.metrics.total_denied += 1;
                return AcquireOutcome::Denied {
                    reason: format!(
                        "hard stop: commit ratio {:.1}% at or above threshold; recommended parallelism {}",
                        snapshot.commit_ratio * 100.0,
                        budget.recommended_parallelism
                    ),
                    recommended_parallelism: budget.recommended_parallelism,
                    commit_ratio: snapshot.commit_ratio,
                };
            }

            let granted = requested_tokens.min(state.available_tokens);
            if granted > 0 || requested_tokens == 0 {
                let lease_id = Self::new_lease_id(&state.leases);
                let now = Instant::now();
                state.leases.insert(
                    lease_id.clone(),
                    Lease {
                        lease_id: lease_id.clone(),
                        tool: tool.to_string(),
                        tokens: granted,
                        acquired_at: now,
                        expires_at: now + LEASE_TTL,
                        commit_ratio_at_acquire: snapshot.commit_ratio,
                        warning_logged: false,
                    },
                );
                state.available_tokens -= granted;
                state.metrics.total_granted += 1;
                return AcquireOutcome::Granted {
                    lease_id,
                    granted_tokens: granted,
                    recommended_parallelism: budget.recommended_parallelism,
                    commit_ratio: snapshot.commit_ratio,
                };
            }

            drop(state);

            if Instant::now() >= deadline {
                let mut state = self.state.lock().await;
                state.metrics.total_denied += 1;
                return AcquireOutcome::Denied {
                    reason: "timeout waiting for tokens".to_string(),
                    recommended_parallelism: budget.recommended_parallelism,
                    commit_ratio: snapshot.commit_ratio,
                };
            }

            tokio::time::sleep(Duration::from_millis(budget.throttle_level.retry_delay_ms().max(1)))
                .await;
        }
    }

    /// Releases a lease, returns its tokens, and classifies the outcome.
    pub async fn release(
        &self,
        lease_id: &str,
        peak_working_set_bytes: u64,
        peak_commit_bytes: u64,
        exit_code: i32,
        duration: Duration,
        stderr_had_diagnostics: bool,
    ) -> ReleaseOutcome {
        let mut state = self.state.lock().await;
        let Some(lease) = state.leases.remove(lease_id) else {
            return ReleaseOutcome {
                acknowledged: false,
                classification: None,
                message: None,
                should_retry: false,
                retry_with_tokens: None,
            };
        };
        state.available_tokens = (state.available_tokens + lease.tokens).min(state.total_tokens);
        state.metrics.total_released += 1;
        drop(state);

        let snapshot = self.probe.sample();
        let budget = budget::compute(&snapshot, &self.budget_config);
        let peak_process_commit_gb = peak_commit_bytes as f64 / (1024.0 * 1024.0 * 1024.0);
        let peak_ratio = lease.commit_ratio_at_acquire.max(snapshot.commit_ratio);

        let input = ClassificationInput {
            exit_code,
            duration_ms: duration.as_millis() as u64,
            commit_ratio_at_exit: snapshot.commit_ratio,
            peak_commit_ratio_during_execution: peak_ratio,
            peak_process_commit_gb,
            stderr_had_diagnostics,
            commit_charge_bytes: snapshot.commit_charge,
            commit_limit_bytes: snapshot.commit_limit,
            recommended_parallelism: budget.recommended_parallelism,
        };
        let result = classifier::classify(&input, &self.classifier_config);
        let _ = peak_working_set_bytes; // retained for the wire record, not scored today

        let retry_with_tokens = result
            .should_retry
            .then(|| (lease.tokens / 2).max(1));

        ReleaseOutcome {
            acknowledged: true,
            classification: Some(result.classification),
            message: result.message,
            should_retry: result.should_retry,
            retry_with_tokens,
        }
    }

    pub async fn heartbeat(&self, lease_id: &str) -> bool {
        let state = self.state.lock().await;
        state.leases.contains_key(lease_id)
    }

    pub async fn status(&self) -> PoolStatus {
        let snapshot = self.probe.sample();
        let budget = budget::compute(&snapshot, &self.budget_config);
        let state = self.state.lock().await;

        let now = Instant::now();
        let mut recent_leases: Vec<LeaseSummary> = state
            .leases
            .values()
            .map(|lease| LeaseSummary {
                lease_id: lease.lease_id.clone(),
                tool: lease.tool.clone(),
                tokens: lease.tokens,
                duration_seconds: now.saturating_duration_since(lease.acquired_at).as_secs(),
                expires_in_seconds: lease.expires_at.saturating_duration_since(now).as_secs(),
            })
            .collect();
        recent_leases.sort_by_key(|l| std::cmp::Reverse(l.duration_seconds));
        recent_leases.truncate(10);

        PoolStatus {
            total_tokens: state.total_tokens,
            available_tokens: state.available_tokens,
            active_leases: state.leases.len() as u32,
            expired_leases: state.metrics.total_expired,
            commit_ratio: snapshot.commit_ratio,
            commit_charge_bytes: snapshot.commit_charge,
            commit_limit_bytes: snapshot.commit_limit,
            available_memory_bytes: snapshot.available_physical,
            recommended_parallelism: budget.recommended_parallelism,
            throttle_level: budget.throttle_level,
            recent_leases,
        }
    }

    pub async fn metrics(&self) -> PoolMetrics {
        self.state.lock().await.metrics.clone()
    }

    /// Periodic maintenance: refreshes the budget and sweeps the lease
    /// table for long-running warnings and TTL reclamation. Called every
    /// 500ms by the governor's maintenance task, decoupled from request
    /// traffic.
    pub async fn run_maintenance(&self) {
        let snapshot = self.probe.sample();
        let budget = budget::compute(&snapshot, &self.budget_config);
        let now = Instant::now();

        let mut state = self.state.lock().await;
        Self::reconcile(&mut state, budget.total_tokens);

        let mut expired_ids = Vec::new();
        for lease in state.leases.values_mut() {
            if now.saturating_duration_since(lease.acquired_at) >= LONG_RUNNING_WARNING
                && !lease.warning_logged
            {
                warn!(
                    lease_id = %lease.lease_id,
                    tool = %lease.tool,
                    elapsed_secs = now.saturating_duration_since(lease.acquired_at).as_secs(),
                    "lease has been held for over 10 minutes"
                );
                lease.warning_logged = true;
            }
            if now >= lease.expires_at {
                expired_ids.push(lease.lease_id.clone());
            }
        }

        for id in expired_ids {
            if let Some(lease) = state.leases.remove(&id) {
                state.available_tokens = (state.available_tokens + lease.tokens).min(state.total_tokens);
                state.metrics.total_expired += 1;
                info!(lease_id = %lease.lease_id, tool = %lease.tool, "lease expired and was reclaimed");
            }
        }
        debug!(
            total_tokens = state.total_tokens,
            available_tokens = state.available_tokens,
            active_leases = state.leases.len(),
            "maintenance sweep complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> TokenPool {
        TokenPool::new(
            Arc::new(MemoryProbe::new()),
            TokenBudgetConfig::default(),
            ClassifierConfig::default(),
        )
    }

    #[tokio::test]
    async fn acquire_then_release_conserves_tokens() {
        let pool = pool();
        let before = pool.status().await;

        let outcome = pool.try_acquire("cl", 1, Duration::from_millis(10)).await;
        let lease_id = match outcome {
            AcquireOutcome::Granted { lease_id, .. } => lease_id,
            AcquireOutcome::Denied { reason, .. } => panic!("unexpected denial: {reason}"),
        };

        let mid = pool.status().await;
        assert_eq!(mid.available_tokens, before.available_tokens - 1);

        let release = pool
            .release(&lease_id, 0, 0, 0, Duration::from_secs(1), true)
            .await;
        assert!(release.acknowledged);

        let after = pool.status().await;
        assert_eq!(after.available_tokens, before.available_tokens);
    }

    #[tokio::test]
    async fn release_of_unknown_lease_is_not_acknowledged() {
        let pool = pool();
        let release = pool
            .release("does-not-exist", 0, 0, 0, Duration::from_secs(1), true)
            .await;
        assert!(!release.acknowledged);
        assert!(release.classification.is_none());
    }

    #[tokio::test]
    async fn heartbeat_reports_liveness() {
        let pool = pool();
        let outcome = pool.try_acquire("link", 1, Duration::from_millis(10)).await;
        let lease_id = match outcome {
            AcquireOutcome::Granted { lease_id, .. } => lease_id,
            AcquireOutcome::Denied { reason, .. } => panic!("unexpected denial: {reason}"),
        };
        assert!(pool.heartbeat(&lease_id).await);
        assert!(!pool.heartbeat("nonexistent").await);
    }

    #[tokio::test]
    async fn zero_token_request_is_granted_even_with_no_available_tokens() {
        let pool = pool();
        // Drain the pool.
        let total = pool.status().await.total_tokens;
        for _ in 0..total {
            let outcome = pool.try_acquire("cl", 1, Duration::from_millis(10)).await;
            assert!(matches!(outcome, AcquireOutcome::Granted { .. }));
        }
        let outcome = pool.try_acquire("cl", 0, Duration::from_millis(10)).await;
        assert!(matches!(outcome, AcquireOutcome::Granted { granted_tokens: 0, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_is_reclaimed_after_ttl() {
        let pool = pool();
        let outcome = pool.try_acquire("cl", 1, Duration::from_millis(10)).await;
        assert!(matches!(outcome, AcquireOutcome::Granted { .. }));

        let before = pool.status().await;
        assert_eq!(before.active_leases, 1);

        tokio::time::advance(LEASE_TTL + Duration::from_secs(1)).await;
        pool.run_maintenance().await;

        let after = pool.status().await;
        assert_eq!(after.active_leases, 0);
        assert_eq!(after.expired_leases, 1);
        assert_eq!(after.available_tokens, after.total_tokens);
    }

    #[tokio::test]
    async fn metrics_track_grants_and_releases() {
        let pool = pool();
        let outcome = pool.try_acquire("cl", 1, Duration::from_millis(10)).await;
        let lease_id = match outcome {
            AcquireOutcome::Granted { lease_id, .. } => lease_id,
            AcquireOutcome::Denied { reason, .. } => panic!("unexpected denial: {reason}"),
        };
        pool.release(&lease_id, 0, 0, 0, Duration::from_secs(1), true)
            .await;
        let metrics = pool.metrics().await;
        assert_eq!(metrics.total_granted, 1);
        assert_eq!(metrics.total_released, 1);
    }
}
