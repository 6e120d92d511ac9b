//! Quality gate evaluation.
//!
//! Pure decision logic: `(stage, metrics, thresholds) -> verdict`. Metrics are
//! produced by external tools (linters, coverage, mutation testing, scanners,
//! the merge executor) and handed in as an opaque map; nothing here performs
//! I/O.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// GateStage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStage {
    /// Guards `in_review -> in_tests`.
    CodeQuality,
    /// Guards `in_tests -> in_docs`.
    TestQuality,
    /// Guards `in_docs -> done`.
    SecurityMerge,
}

impl fmt::Display for GateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GateStage::CodeQuality => "code_quality",
            GateStage::TestQuality => "test_quality",
            GateStage::SecurityMerge => "security_merge",
        };
        f.write_str(label)
    }
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Metric keys understood by the built-in predicates.
pub mod metric_keys {
    pub const LINT_ERRORS: &str = "lint_errors";
    pub const TYPE_ERRORS: &str = "type_errors";
    pub const MAX_COMPLEXITY: &str = "max_complexity";
    pub const COVERAGE_PERCENT: &str = "coverage_percent";
    pub const MUTATION_SCORE: &str = "mutation_score";
    pub const AC_SATISFIED_PERCENT: &str = "ac_satisfied_percent";
    pub const SAST_HIGH_FINDINGS: &str = "sast_high_findings";
    pub const CRITICAL_CVE_COUNT: &str = "critical_cve_count";
    pub const HIGH_CVE_COUNT: &str = "high_cve_count";
    pub const MEDIUM_CVE_COUNT: &str = "medium_cve_count";
    pub const SECRET_COUNT: &str = "secret_count";
    pub const MERGE_SUCCEEDED: &str = "merge_succeeded";
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Flag(bool),
    Number(f64),
}

impl MetricValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            MetricValue::Flag(true) => 1.0,
            MetricValue::Flag(false) => 0.0,
            MetricValue::Number(n) => *n,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        MetricValue::Number(v)
    }
}

impl From<u32> for MetricValue {
    fn from(v: u32) -> Self {
        MetricValue::Number(f64::from(v))
    }
}

impl From<bool> for MetricValue {
    fn from(v: bool) -> Self {
        MetricValue::Flag(v)
    }
}

/// Metrics reported for one gate call, keyed by metric name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, MetricValue>);

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<MetricValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<MetricValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).map(MetricValue::as_f64)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Thresholds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateThresholds {
    pub coverage_min: f64,
    pub mutation_min: f64,
    /// Complexity above this is reported as a warning, not a failure.
    pub complexity_flag: f64,
    pub complexity_max: f64,
    pub ac_satisfied_min: f64,
    pub sast_high_max: f64,
    pub critical_cve_max: f64,
    pub high_cve_max: f64,
    pub medium_cve_max: f64,
    pub secret_max: f64,
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            coverage_min: 80.0,
            mutation_min: 80.0,
            complexity_flag: 10.0,
            complexity_max: 15.0,
            ac_satisfied_min: 100.0,
            sast_high_max: 0.0,
            critical_cve_max: 0.0,
            high_cve_max: 0.0,
            medium_cve_max: 5.0,
            secret_max: 0.0,
        }
    }
}

// ---------------------------------------------------------------------------
// Predicates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Bound {
    AtLeast(f64),
    AtMost(f64),
    IsTrue,
}

/// A named check over one metric.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Predicate {
    pub metric: &'static str,
    pub bound: Bound,
}

impl Predicate {
    const fn at_least(metric: &'static str, min: f64) -> Self {
        Self { metric, bound: Bound::AtLeast(min) }
    }

    const fn at_most(metric: &'static str, max: f64) -> Self {
        Self { metric, bound: Bound::AtMost(max) }
    }

    /// `None` when the predicate holds, otherwise the failure reason.
    pub fn check(&self, metrics: &Metrics) -> Option<String> {
        let Some(value) = metrics.get(self.metric) else {
            return Some(format!("{} not reported", self.metric));
        };
        if !value.is_finite() {
            return Some(format!("{} is not a number ({})", self.metric, value));
        }
        match self.bound {
            Bound::AtLeast(min) if value < min => {
                Some(format!("{} {} below threshold {}", self.metric, value, min))
            }
            Bound::AtMost(max) if value > max => {
                Some(format!("{} {} exceeds maximum {}", self.metric, value, max))
            }
            Bound::IsTrue if value < 1.0 => Some(format!("{} is false", self.metric)),
            _ => None,
        }
    }
}

/// The ordered predicate list for a stage.
pub fn predicates(stage: GateStage, t: &GateThresholds) -> Vec<Predicate> {
    use metric_keys::*;
    match stage {
        GateStage::CodeQuality => vec![
            Predicate::at_most(LINT_ERRORS, 0.0),
            Predicate::at_most(TYPE_ERRORS, 0.0),
            Predicate::at_most(MAX_COMPLEXITY, t.complexity_max),
        ],
        GateStage::TestQuality => vec![
            Predicate::at_least(COVERAGE_PERCENT, t.coverage_min),
            Predicate::at_least(MUTATION_SCORE, t.mutation_min),
            Predicate::at_least(AC_SATISFIED_PERCENT, t.ac_satisfied_min),
        ],
        GateStage::SecurityMerge => vec![
            Predicate::at_most(SAST_HIGH_FINDINGS, t.sast_high_max),
            Predicate::at_most(CRITICAL_CVE_COUNT, t.critical_cve_max),
            Predicate::at_most(HIGH_CVE_COUNT, t.high_cve_max),
            Predicate::at_most(MEDIUM_CVE_COUNT, t.medium_cve_max),
            Predicate::at_most(SECRET_COUNT, t.secret_max),
            Predicate {
                metric: MERGE_SUCCEEDED,
                bound: Bound::IsTrue,
            },
        ],
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateVerdict {
    pub stage: GateStage,
    pub passed: bool,
    /// One entry per failing predicate, in predicate order.
    pub reasons: Vec<String>,
    pub warnings: Vec<String>,
}

impl GateVerdict {
    pub fn pass(stage: GateStage) -> Self {
        Self {
            stage,
            passed: true,
            reasons: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn fail(stage: GateStage, reasons: Vec<String>) -> Self {
        Self {
            stage,
            passed: false,
            reasons,
            warnings: Vec::new(),
        }
    }

    /// All reasons joined, used as the task's failure reason.
    pub fn summary(&self) -> String {
        format!("{} gate failed: {}", self.stage, self.reasons.join("; "))
    }
}

/// Evaluate every predicate of `stage` and accumulate all failures.
pub fn evaluate(stage: GateStage, metrics: &Metrics, thresholds: &GateThresholds) -> GateVerdict {
    let reasons: Vec<String> = predicates(stage, thresholds)
        .iter()
        .filter_map(|p| p.check(metrics))
        .collect();

    let mut warnings = Vec::new();
    if stage == GateStage::CodeQuality {
        if let Some(c) = metrics.get(metric_keys::MAX_COMPLEXITY) {
            if c > thresholds.complexity_flag && c <= thresholds.complexity_max {
                warnings.push(format!(
                    "{} {} above flag {}",
                    metric_keys::MAX_COMPLEXITY,
                    c,
                    thresholds.complexity_flag
                ));
            }
        }
    }

    tracing::debug!(
        stage = %stage,
        failed = reasons.len(),
        warnings = warnings.len(),
        "gate evaluated"
    );

    GateVerdict {
        stage,
        passed: reasons.is_empty(),
        reasons,
        warnings,
    }
}

#[cfg(test)]
mod tests {
    use super::metric_keys::*;
    use super::*;

    fn passing_tests() -> Metrics {
        Metrics::new()
            .with(COVERAGE_PERCENT, 91.0)
            .with(MUTATION_SCORE, 85.0)
            .with(AC_SATISFIED_PERCENT, 100.0)
    }

    #[test]
    fn coverage_shortfall_names_value_and_threshold() {
        let metrics = passing_tests().with(COVERAGE_PERCENT, 65.0);
        let v = evaluate(GateStage::TestQuality, &metrics, &GateThresholds::default());
        assert!(!v.passed);
        assert_eq!(v.reasons.len(), 1);
        assert!(v.reasons[0].contains("65"));
        assert!(v.reasons[0].contains("80"));
    }

    #[test]
    fn non_finite_metrics_fail_either_bound() {
        let t = GateThresholds::default();
        let tests = passing_tests().with(COVERAGE_PERCENT, f64::NAN);
        let v = evaluate(GateStage::TestQuality, &tests, &t);
        assert!(!v.passed);
        assert_eq!(v.reasons, vec!["coverage_percent is not a number (NaN)".to_string()]);

        let code = Metrics::new()
            .with(LINT_ERRORS, f64::NAN)
            .with(TYPE_ERRORS, 0u32)
            .with(MAX_COMPLEXITY, f64::INFINITY);
        let v = evaluate(GateStage::CodeQuality, &code, &t);
        assert_eq!(v.reasons.len(), 2);
        assert!(v.reasons.iter().all(|r| r.contains("is not a number")));
    }

    #[test]
    fn every_failing_predicate_is_reported() {
        let metrics = Metrics::new()
            .with(COVERAGE_PERCENT, 50.0)
            .with(MUTATION_SCORE, 40.0)
            .with(AC_SATISFIED_PERCENT, 75.0);
        let v = evaluate(GateStage::TestQuality, &metrics, &GateThresholds::default());
        assert_eq!(v.reasons.len(), 3);
        assert!(v.reasons[0].starts_with(COVERAGE_PERCENT));
        assert!(v.reasons[1].starts_with(MUTATION_SCORE));
        assert!(v.reasons[2].starts_with(AC_SATISFIED_PERCENT));
    }

    #[test]
    fn missing_metric_fails_with_reason() {
        let metrics = Metrics::new().with(LINT_ERRORS, 0u32).with(TYPE_ERRORS, 0u32);
        let v = evaluate(GateStage::CodeQuality, &metrics, &GateThresholds::default());
        assert!(!v.passed);
        assert_eq!(v.reasons, vec!["max_complexity not reported".to_string()]);
    }

    #[test]
    fn complexity_between_flag_and_max_warns_but_passes() {
        let metrics = Metrics::new()
            .with(LINT_ERRORS, 0u32)
            .with(TYPE_ERRORS, 0u32)
            .with(MAX_COMPLEXITY, 12u32);
        let v = evaluate(GateStage::CodeQuality, &metrics, &GateThresholds::default());
        assert!(v.passed);
        assert_eq!(v.warnings.len(), 1);
    }

    #[test]
    fn security_gate_requires_successful_merge() {
        let metrics = Metrics::new()
            .with(SAST_HIGH_FINDINGS, 0u32)
            .with(CRITICAL_CVE_COUNT, 0u32)
            .with(HIGH_CVE_COUNT, 0u32)
            .with(MEDIUM_CVE_COUNT, 2u32)
            .with(SECRET_COUNT, 0u32)
            .with(MERGE_SUCCEEDED, false);
        let v = evaluate(GateStage::SecurityMerge, &metrics, &GateThresholds::default());
        assert!(!v.passed);
        assert_eq!(v.reasons, vec!["merge_succeeded is false".to_string()]);

        let merged = metrics.with(MERGE_SUCCEEDED, true);
        assert!(evaluate(GateStage::SecurityMerge, &merged, &GateThresholds::default()).passed);
    }

    #[test]
    fn critical_cve_is_zero_tolerance() {
        let metrics = Metrics::new()
            .with(SAST_HIGH_FINDINGS, 0u32)
            .with(CRITICAL_CVE_COUNT, 1u32)
            .with(HIGH_CVE_COUNT, 0u32)
            .with(MEDIUM_CVE_COUNT, 0u32)
            .with(SECRET_COUNT, 0u32)
            .with(MERGE_SUCCEEDED, true);
        let v = evaluate(GateStage::SecurityMerge, &metrics, &GateThresholds::default());
        assert_eq!(v.reasons, vec!["critical_cve_count 1 exceeds maximum 0".to_string()]);
    }

    #[test]
    fn metrics_deserialize_from_tool_json() {
        let m: Metrics =
            serde_json::from_str(r#"{"coverage_percent": 82.5, "merge_succeeded": true}"#).unwrap();
        assert_eq!(m.get(COVERAGE_PERCENT), Some(82.5));
        assert_eq!(m.get(MERGE_SUCCEEDED), Some(1.0));
    }
}
