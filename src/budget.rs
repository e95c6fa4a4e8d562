//! The token budget engine: a pure function from a memory snapshot and a
//! config to an integer token capacity and a discrete throttle level.
//!
//! Modeled on the pure, clock-free state-machine style of the reference
//! supervisor's `record_failure`/`compute_max_active` functions: no side
//! effects, no I/O, no internal clock — every input the function needs is a
//! parameter.

use serde::{Deserialize, Serialize};

use crate::memory_probe::MemorySnapshot;
use crate::validation::is_strictly_increasing;

/// Configuration knobs for the token budget engine.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenBudgetConfig {
    /// Committed-memory headroom (GiB) one token represents.
    pub gb_per_token: f64,
    /// Commit headroom (GiB) never offered as tokens.
    pub safety_reserve_gb: f64,
    pub min_tokens: u32,
    pub max_tokens: u32,
    pub caution_ratio: f64,
    pub soft_stop_ratio: f64,
    pub hard_stop_ratio: f64,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            gb_per_token: 2.0,
            safety_reserve_gb: 8.0,
            min_tokens: 1,
            max_tokens: 32,
            caution_ratio: 0.80,
            soft_stop_ratio: 0.88,
            hard_stop_ratio: 0.92,
        }
    }
}

impl TokenBudgetConfig {
    /// Rejects non-monotone thresholds and inverted clamps. Called once at
    /// startup; a governor never runs with an invalid config.
    pub fn validate(&self) -> Result<(), String> {
        is_strictly_increasing(self.caution_ratio, self.soft_stop_ratio, self.hard_stop_ratio)
            .map_err(|_| {
                format!(
                    "throttle ratios must satisfy caution_ratio ({}) < soft_stop_ratio ({}) < hard_stop_ratio ({})",
                    self.caution_ratio, self.soft_stop_ratio, self.hard_stop_ratio
                )
            })?;
        if self.min_tokens > self.max_tokens {
            return Err(format!(
                "min_tokens ({}) must be <= max_tokens ({})",
                self.min_tokens, self.max_tokens
            ));
        }
        if self.gb_per_token <= 0.0 {
            return Err("gb_per_token must be positive".to_string());
        }
        if self.safety_reserve_gb < 0.0 {
            return Err("safety_reserve_gb must not be negative".to_string());
        }
        Ok(())
    }
}

/// Discrete admission-control band derived from commit ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThrottleLevel {
    Normal,
    Caution,
    SoftStop,
    HardStop,
}

impl ThrottleLevel {
    /// The acquire-loop retry delay (milliseconds) associated with this
    /// band, per §4.C: SoftStop backs off hardest, Normal barely at all.
    pub fn retry_delay_ms(self) -> u64 {
        match self {
            ThrottleLevel::Normal => 100,
            ThrottleLevel::Caution => 200,
            ThrottleLevel::SoftStop => 500,
            ThrottleLevel::HardStop => 0,
        }
    }
}

/// The budget derived from a `(MemorySnapshot, TokenBudgetConfig)` pair.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBudget {
    pub total_tokens: u32,
    pub throttle_level: ThrottleLevel,
    pub recommended_parallelism: u32,
    pub available_commit_gb: f64,
}

const BYTES_PER_GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Pure: `compute(snapshot, config)` always returns the same `TokenBudget`
/// for the same inputs, regardless of call order or wall-clock time.
pub fn compute(snapshot: &MemorySnapshot, config: &TokenBudgetConfig) -> TokenBudget {
    let available_commit_gb = if snapshot.commit_limit >= snapshot.commit_charge {
        (snapshot.commit_limit - snapshot.commit_charge) as f64 / BYTES_PER_GIB
    } else {
        0.0
    };

    let usable = (available_commit_gb - config.safety_reserve_gb).max(0.0);

    let total_tokens = ((usable / config.gb_per_token).floor() as i64)
        .clamp(config.min_tokens as i64, config.max_tokens as i64) as u32;

    let throttle_level = if snapshot.commit_ratio >= config.hard_stop_ratio {
        ThrottleLevel::HardStop
    } else if snapshot.commit_ratio >= config.soft_stop_ratio {
        ThrottleLevel::SoftStop
    } else if snapshot.commit_ratio >= config.caution_ratio {
        ThrottleLevel::Caution
    } else {
        ThrottleLevel::Normal
    };

    let recommended_parallelism = ((usable / 3.0).floor() as i64).max(1) as u32;

    TokenBudget {
        total_tokens,
        throttle_level,
        recommended_parallelism,
        available_commit_gb,
    }
}
