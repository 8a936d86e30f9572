//! Scope-wise runtime bookkeeping and its display.

use std::collections::BTreeMap;
use std::io::{self, Write};

use ft_core::Phase;
use ft_runtime::scope_depth;
use serde::Serialize;

use crate::config::EstimateMode;

/// One of the four scope transitions the tracker reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    PreForward,
    PreBackward,
    PostForward,
    PostBackward,
}

/// Qualified scope names in the order each transition fired.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrderLogs {
    pub pre_forward: Vec<String>,
    pub pre_backward: Vec<String>,
    pub post_forward: Vec<String>,
    pub post_backward: Vec<String>,
}

impl OrderLogs {
    pub fn record(&mut self, transition: Transition, scope: &str) {
        let log = match transition {
            Transition::PreForward => &mut self.pre_forward,
            Transition::PreBackward => &mut self.pre_backward,
            Transition::PostForward => &mut self.post_forward,
            Transition::PostBackward => &mut self.post_backward,
        };
        log.push(scope.to_string());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScopeRecord {
    pub scope: String,
    pub forward_ms: f64,
    pub backward_ms: f64,
}

impl ScopeRecord {
    fn new(scope: &str) -> Self {
        Self {
            scope: scope.to_string(),
            forward_ms: 0.0,
            backward_ms: 0.0,
        }
    }
}

/// Per-scope accumulators, kept in order of first attribution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeRuntimes {
    records: Vec<ScopeRecord>,
    index: BTreeMap<String, usize>,
}

impl ScopeRuntimes {
    pub fn add(&mut self, scope: &str, phase: Phase, elapsed_ms: f64) {
        let slot = match self.index.get(scope) {
            Some(&slot) => slot,
            None => {
                self.records.push(ScopeRecord::new(scope));
                let slot = self.records.len() - 1;
                self.index.insert(scope.to_string(), slot);
                slot
            }
        };
        if let Some(record) = self.records.get_mut(slot) {
            match phase {
                Phase::Forward => record.forward_ms += elapsed_ms,
                Phase::Backward => record.backward_ms += elapsed_ms,
            }
        }
    }

    #[must_use]
    pub fn get(&self, scope: &str) -> Option<&ScopeRecord> {
        self.index.get(scope).and_then(|&slot| self.records.get(slot))
    }

    #[must_use]
    pub fn records(&self) -> &[ScopeRecord] {
        &self.records
    }

    #[must_use]
    pub fn into_records(self) -> Vec<ScopeRecord> {
        self.records
    }
}

/// Frozen results of one activation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EstimateReport {
    pub mode: EstimateMode,
    pub total_ms: f64,
    pub order: OrderLogs,
    pub scopes: Vec<ScopeRecord>,
    /// Operation kinds that fell back to symbolic execution, process-wide.
    pub unsupported: Vec<String>,
}

impl EstimateReport {
    #[must_use]
    pub fn scope(&self, name: &str) -> Option<&ScopeRecord> {
        self.scopes.iter().find(|record| record.scope == name)
    }

    fn stat_lines(&self, depth: usize) -> Vec<String> {
        let shallow = |scope: &&String| scope_depth(scope) <= depth;
        let mut lines = vec!["Pre-Forward Execution Order:".to_string()];
        lines.extend(self.order.pre_forward.iter().filter(shallow).cloned());
        lines.push("Pre-Backward Execution Order:".to_string());
        lines.extend(self.order.pre_backward.iter().filter(shallow).cloned());
        lines.extend(
            self.scopes
                .iter()
                .filter(|record| scope_depth(&record.scope) <= depth)
                .map(|record| {
                    format!(
                        "{} fw: {:.3}ms bw: {:.3}ms",
                        record.scope, record.forward_ms, record.backward_ms
                    )
                }),
        );
        lines
    }

    /// Execution orders and per-scope runtimes of scopes at most `depth` deep.
    pub fn write_scope_stats(&self, out: &mut dyn Write, depth: usize) -> io::Result<()> {
        for line in self.stat_lines(depth) {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }

    #[must_use]
    pub fn scope_stats(&self, depth: usize) -> String {
        let mut text = self.stat_lines(depth).join("\n");
        text.push('\n');
        text
    }

    pub fn display_scope_stats(&self, depth: usize) -> io::Result<()> {
        let stdout = io::stdout();
        self.write_scope_stats(&mut stdout.lock(), depth)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use ft_core::Phase;

    use super::{EstimateReport, OrderLogs, ScopeRuntimes, Transition};
    use crate::config::EstimateMode;

    fn sample() -> EstimateReport {
        let mut order = OrderLogs::default();
        for scope in ["model", "model.fc1", "model.fc1.inner"] {
            order.record(Transition::PreForward, scope);
        }
        order.record(Transition::PreBackward, "model");
        order.record(Transition::PostForward, "model");

        let mut runtimes = ScopeRuntimes::default();
        runtimes.add("Global", Phase::Forward, 1.5);
        runtimes.add("model", Phase::Forward, 1.0);
        runtimes.add("model.fc1", Phase::Forward, 0.25);
        runtimes.add("model.fc1.inner", Phase::Forward, 0.25);
        runtimes.add("Global", Phase::Backward, 2.0);
        runtimes.add("model", Phase::Backward, 2.0);
        EstimateReport {
            mode: EstimateMode::CostModel,
            total_ms: 3.5,
            order,
            scopes: runtimes.into_records(),
            unsupported: Vec::new(),
        }
    }

    #[test]
    fn runtimes_accumulate_per_phase_in_first_seen_order() {
        let mut runtimes = ScopeRuntimes::default();
        runtimes.add("b", Phase::Forward, 1.0);
        runtimes.add("a", Phase::Backward, 2.0);
        runtimes.add("b", Phase::Backward, 0.5);
        runtimes.add("b", Phase::Forward, 1.0);
        let scopes = runtimes
            .records()
            .iter()
            .map(|record| record.scope.as_str())
            .collect::<Vec<_>>();
        assert_eq!(scopes, vec!["b", "a"]);
        let b = runtimes.get("b").expect("b");
        assert_eq!((b.forward_ms, b.backward_ms), (2.0, 0.5));
        assert!(runtimes.get("c").is_none());
    }

    #[test]
    fn stats_are_truncated_to_depth() {
        let text = sample().scope_stats(2);
        let expected = "\
Pre-Forward Execution Order:
model
model.fc1
Pre-Backward Execution Order:
model
Global fw: 1.500ms bw: 2.000ms
model fw: 1.000ms bw: 2.000ms
model.fc1 fw: 0.250ms bw: 0.000ms
";
        assert_eq!(text, expected);
    }

    #[test]
    fn writer_output_matches_string_form() {
        let report = sample();
        let mut buffer = Vec::new();
        report.write_scope_stats(&mut buffer, 1).expect("write");
        assert_eq!(String::from_utf8(buffer).expect("utf8"), report.scope_stats(1));
    }

    #[test]
    fn json_export_names_the_mode() {
        let json = sample().to_json().expect("json");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse");
        assert_eq!(value["mode"], "operator-level-cost-model");
        assert_eq!(value["scopes"][0]["scope"], "Global");
        assert_eq!(value["order"]["post_forward"][0], "model");
    }
}
