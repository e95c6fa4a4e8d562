//! The failure classifier: a pure function that turns exit-time evidence
//! into a classification and, for the OOM-shaped bands, a human-facing
//! diagnostic message.

use serde::{Deserialize, Serialize};

/// Weights and band cutoffs. The spec's own design notes flag these as
/// empirical; they are configuration, not constants baked into the scoring
/// function.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub weight_commit_ratio_hard: f64,
    pub weight_commit_ratio_soft: f64,
    pub weight_peak_commit_ratio: f64,
    pub weight_peak_process_commit: f64,
    pub weight_silent_stderr: f64,
    pub weight_fast_and_heavy: f64,
    pub likely_oom_threshold: f64,
    pub likely_paging_death_threshold: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            weight_commit_ratio_hard: 0.40,
            weight_commit_ratio_soft: 0.25,
            weight_peak_commit_ratio: 0.30,
            weight_peak_process_commit: 0.20,
            weight_silent_stderr: 0.20,
            weight_fast_and_heavy: 0.15,
            likely_oom_threshold: 0.60,
            likely_paging_death_threshold: 0.40,
        }
    }
}

/// Evidence collected by the shim across a single tool invocation, fed to
/// `classify` on release.
#[derive(Debug, Clone, Copy)]
pub struct ClassificationInput {
    pub exit_code: i32,
    pub duration_ms: u64,
    pub commit_ratio_at_exit: f64,
    pub peak_commit_ratio_during_execution: f64,
    pub peak_process_commit_gb: f64,
    pub stderr_had_diagnostics: bool,
    pub commit_charge_bytes: u64,
    pub commit_limit_bytes: u64,
    pub recommended_parallelism: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Success,
    NormalCompileError,
    LikelyOOM,
    LikelyPagingDeath,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ClassificationResult {
    pub classification: Classification,
    pub should_retry: bool,
    pub message: Option<String>,
    pub oom_evidence: f64,
}

/// Pure: scores `oom_evidence` from the evidence, then bands it into a
/// classification. Holding all inputs but one constant, increasing
/// `commit_ratio_at_exit` or flipping `stderr_had_diagnostics` from true to
/// false never decreases the score (see the `classifier_monotonicity` test).
pub fn classify(input: &ClassificationInput, config: &ClassifierConfig) -> ClassificationResult {
    if input.exit_code == 0 {
        return ClassificationResult {
            classification: Classification::Success,
            should_retry: false,
            message: None,
            oom_evidence: 0.0,
        };
    }

    let mut oom_evidence = 0.0;
    let mut reasons = Vec::new();

    if input.commit_ratio_at_exit >= 0.92 {
        oom_evidence += config.weight_commit_ratio_hard;
        reasons.push(format!(
            "commit ratio at exit {:.1}% >= 92%",
            input.commit_ratio_at_exit * 100.0
        ));
    } else if input.commit_ratio_at_exit >= 0.88 {
        oom_evidence += config.weight_commit_ratio_soft;
        reasons.push(format!(
            "commit ratio at exit {:.1}% >= 88%",
            input.commit_ratio_at_exit * 100.0
        ));
    }

    if input.peak_commit_ratio_during_execution >= 0.95 {
        oom_evidence += config.weight_peak_commit_ratio;
        reasons.push(format!(
            "peak commit ratio during execution {:.1}% >= 95%",
            input.peak_commit_ratio_during_execution * 100.0
        ));
    }

    if input.peak_process_commit_gb >= 2.5 {
        oom_evidence += config.weight_peak_process_commit;
        reasons.push(format!(
            "peak process commit {:.2} GB >= 2.5 GB",
            input.peak_process_commit_gb
        ));
    }

    if !input.stderr_had_diagnostics {
        oom_evidence += config.weight_silent_stderr;
        reasons.push("tool exited nonzero with no stderr diagnostics".to_string());
    }

    if input.duration_ms < 5000 && input.peak_process_commit_gb >= 1.5 {
        oom_evidence += config.weight_fast_and_heavy;
        reasons.push(format!(
            "fast failure ({} ms) with high process commit ({:.2} GB)",
            input.duration_ms, input.peak_process_commit_gb
        ));
    }

    let (classification, should_retry) = if oom_evidence >= config.likely_oom_threshold {
        (Classification::LikelyOOM, true)
    } else if oom_evidence >= config.likely_paging_death_threshold {
        (Classification::LikelyPagingDeath, true)
    } else if input.stderr_had_diagnostics {
        (Classification::NormalCompileError, false)
    } else {
        (Classification::Unknown, false)
    };

    let message = match classification {
        Classification::LikelyOOM | Classification::LikelyPagingDeath => {
            Some(format_diagnostic(input, &reasons, classification))
        }
        Classification::Unknown => Some(
            "unable to determine cause of failure; no memory-pressure or stderr evidence present"
                .to_string(),
        ),
        _ => None,
    };

    ClassificationResult {
        classification,
        should_retry,
        message,
        oom_evidence,
    }
}

fn format_diagnostic(
    input: &ClassificationInput,
    reasons: &[String],
    classification: Classification,
) -> String {
    let label = match classification {
        Classification::LikelyOOM => "likely out-of-memory",
        Classification::LikelyPagingDeath => "likely paging death",
        _ => "failure",
    };
    format!(
        "build-governor: {label} (exit code {}). commit ratio {:.1}% ({} / {} bytes), peak process commit {:.2} GB. \
         reasons: {}. consider reducing parallelism: CMAKE_BUILD_PARALLEL_LEVEL={p}, /m:{p}, -j {p}.",
        input.exit_code,
        input.commit_ratio_at_exit * 100.0,
        input.commit_charge_bytes,
        input.commit_limit_bytes,
        input.peak_process_commit_gb,
        reasons.join("; "),
        p = input.recommended_parallelism,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn baseline() -> ClassificationInput {
        ClassificationInput {
            exit_code: 1,
            duration_ms: 10_000,
            commit_ratio_at_exit: 0.50,
            peak_commit_ratio_during_execution: 0.50,
            peak_process_commit_gb: 0.5,
            stderr_had_diagnostics: true,
            commit_charge_bytes: 24 * 1024 * 1024 * 1024,
            commit_limit_bytes: 48 * 1024 * 1024 * 1024,
            recommended_parallelism: 8,
        }
    }

    #[test]
    fn zero_exit_code_short_circuits_to_success() {
        let mut input = baseline();
        input.exit_code = 0;
        input.commit_ratio_at_exit = 0.99; // would otherwise score heavily
        let result = classify(&input, &ClassifierConfig::default());
        assert_eq!(result.classification, Classification::Success);
        assert!(!result.should_retry);
        assert!(result.message.is_none());
    }

    #[test]
    fn ordinary_compile_error_with_diagnostics() {
        let input = baseline();
        let result = classify(&input, &ClassifierConfig::default());
        assert_eq!(result.classification, Classification::NormalCompileError);
        assert!(!result.should_retry);
        assert!(result.message.is_none());
    }

    #[test]
    fn high_pressure_silent_failure_is_likely_oom() {
        let mut input = baseline();
        input.commit_ratio_at_exit = 0.93;
        input.peak_commit_ratio_during_execution = 0.96;
        input.peak_process_commit_gb = 3.1;
        input.stderr_had_diagnostics = false;
        input.duration_ms = 4200;
        let result = classify(&input, &ClassifierConfig::default());
        assert_eq!(result.classification, Classification::LikelyOOM);
        assert!(result.should_retry);
        let message = result.message.expect("oom diagnostic present");
        assert!(message.contains("93.0%"));
        assert!(message.contains("3.10 GB"));
        assert!(message.contains("-j 8"));
    }

    #[test]
    fn moderate_pressure_is_likely_paging_death() {
        let mut input = baseline();
        input.commit_ratio_at_exit = 0.89;
        input.stderr_had_diagnostics = false;
        let result = classify(&input, &ClassifierConfig::default());
        assert_eq!(result.classification, Classification::LikelyPagingDeath);
        assert!(result.should_retry);
    }

    #[test]
    fn no_evidence_and_no_diagnostics_is_unknown() {
        let mut input = baseline();
        input.stderr_had_diagnostics = false;
        let result = classify(&input, &ClassifierConfig::default());
        assert_eq!(result.classification, Classification::Unknown);
        assert!(result.message.is_some());
    }

    #[test]
    fn classifier_monotonicity_on_commit_ratio() {
        let config = ClassifierConfig::default();
        let mut low = baseline();
        low.commit_ratio_at_exit = 0.50;
        let mut high = baseline();
        high.commit_ratio_at_exit = 0.95;
        let low_score = classify(&low, &config).oom_evidence;
        let high_score = classify(&high, &config).oom_evidence;
        assert!(high_score >= low_score);
    }

    #[test]
    fn classifier_monotonicity_on_stderr_flag() {
        let config = ClassifierConfig::default();
        let mut with_diagnostics = baseline();
        with_diagnostics.stderr_had_diagnostics = true;
        let mut without_diagnostics = baseline();
        without_diagnostics.stderr_had_diagnostics = false;
        let a = classify(&with_diagnostics, &config).oom_evidence;
        let b = classify(&without_diagnostics, &config).oom_evidence;
        assert!(b >= a);
    }
}
