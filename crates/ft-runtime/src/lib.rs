#![forbid(unsafe_code)]

use std::fmt;

use ft_core::{ExecutionMode, Phase};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Dispatch,
    Estimate,
    Fallback,
    Scope,
    Policy,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EvidenceEntry {
    pub ts_unix_ms: u128,
    pub kind: EvidenceKind,
    pub summary: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EvidenceLedger {
    entries: Vec<EvidenceEntry>,
}

impl EvidenceLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, kind: EvidenceKind, summary: impl Into<String>) {
        self.entries.push(EvidenceEntry {
            ts_unix_ms: now_unix_ms(),
            kind,
            summary: summary.into(),
        });
    }

    #[must_use]
    pub fn entries(&self) -> &[EvidenceEntry] {
        &self.entries
    }

    pub fn entries_of(&self, kind: EvidenceKind) -> impl Iterator<Item = &EvidenceEntry> {
        self.entries.iter().filter(move |entry| entry.kind == kind)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One JSON object per line.
    pub fn to_jsonl(&self) -> Result<String, serde_json::Error> {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeContext {
    mode: ExecutionMode,
    ledger: EvidenceLedger,
}

impl RuntimeContext {
    #[must_use]
    pub fn new(mode: ExecutionMode) -> Self {
        let mut ledger = EvidenceLedger::new();
        ledger.record(
            EvidenceKind::Policy,
            format!("mode initialized to {mode:?}"),
        );
        Self { mode, ledger }
    }

    #[must_use]
    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ExecutionMode) {
        self.mode = mode;
        self.ledger
            .record(EvidenceKind::Policy, format!("mode switched to {mode:?}"));
    }

    #[must_use]
    pub fn ledger(&self) -> &EvidenceLedger {
        &self.ledger
    }

    pub fn ledger_mut(&mut self) -> &mut EvidenceLedger {
        &mut self.ledger
    }
}

/// Callback fired with a scope's qualified name.
pub type ScopeHook = Box<dyn FnMut(&str)>;

/// The four scope-transition callbacks.
pub struct ScopeHooks {
    pub pre_forward: ScopeHook,
    pub pre_backward: ScopeHook,
    pub post_forward: ScopeHook,
    pub post_backward: ScopeHook,
}

impl fmt::Debug for ScopeHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeHooks").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeError {
    HooksAlreadyRegistered,
    NoOpenScope { phase: Phase },
    InvalidName { name: String },
}

impl fmt::Display for ScopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HooksAlreadyRegistered => write!(f, "scope hooks are already registered"),
            Self::NoOpenScope { phase } => {
                write!(f, "no open {phase:?} scope to exit")
            }
            Self::InvalidName { name } => write!(f, "invalid scope name '{name}'"),
        }
    }
}

impl std::error::Error for ScopeError {}

/// Hierarchical scope tracker. The root scope is always open.
#[derive(Debug)]
pub struct ScopeTracker {
    open: Vec<String>,
    phase: Phase,
    hooks: Option<ScopeHooks>,
}

impl Default for ScopeTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ScopeTracker {
    pub const ROOT: &'static str = "Global";

    #[must_use]
    pub fn new() -> Self {
        Self {
            open: vec![Self::ROOT.to_string()],
            phase: Phase::Forward,
            hooks: None,
        }
    }

    /// Qualified names of every open scope, root first.
    #[must_use]
    pub fn parents(&self) -> &[String] {
        &self.open
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn is_backward(&self) -> bool {
        self.phase == Phase::Backward
    }

    /// Open `name` under the innermost open scope and return its qualified name.
    pub fn enter(&mut self, name: &str, phase: Phase) -> Result<String, ScopeError> {
        if name.is_empty() || name.contains('.') {
            return Err(ScopeError::InvalidName {
                name: name.to_string(),
            });
        }
        let qualified = match self.open.last() {
            Some(parent) if self.open.len() > 1 => format!("{parent}.{name}"),
            _ => name.to_string(),
        };
        self.phase = phase;
        self.open.push(qualified.clone());
        if let Some(hooks) = self.hooks.as_mut() {
            match phase {
                Phase::Forward => (hooks.pre_forward)(&qualified),
                Phase::Backward => (hooks.pre_backward)(&qualified),
            }
        }
        Ok(qualified)
    }

    /// Close the innermost scope.
    pub fn exit(&mut self, phase: Phase) -> Result<String, ScopeError> {
        if self.open.len() <= 1 {
            return Err(ScopeError::NoOpenScope { phase });
        }
        let Some(qualified) = self.open.pop() else {
            return Err(ScopeError::NoOpenScope { phase });
        };
        self.phase = phase;
        if let Some(hooks) = self.hooks.as_mut() {
            match phase {
                Phase::Forward => (hooks.post_forward)(&qualified),
                Phase::Backward => (hooks.post_backward)(&qualified),
            }
        }
        Ok(qualified)
    }

    pub fn register_hooks(&mut self, hooks: ScopeHooks) -> Result<(), ScopeError> {
        if self.hooks.is_some() {
            return Err(ScopeError::HooksAlreadyRegistered);
        }
        self.hooks = Some(hooks);
        Ok(())
    }

    pub fn clear_hooks(&mut self) -> Option<ScopeHooks> {
        self.hooks.take()
    }

    #[must_use]
    pub fn has_hooks(&self) -> bool {
        self.hooks.is_some()
    }
}

/// Nesting depth of a qualified scope name.
#[must_use]
pub fn scope_depth(qualified: &str) -> usize {
    qualified.matches('.').count() + 1
}

fn now_unix_ms() -> u128 {
    let now = std::time::SystemTime::now();
    now.duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use ft_core::{ExecutionMode, Phase};
    use proptest::prelude::*;

    use super::{
        EvidenceKind, RuntimeContext, ScopeError, ScopeHooks, ScopeTracker, scope_depth,
    };

    fn recording_hooks(log: &Rc<RefCell<Vec<String>>>) -> ScopeHooks {
        let hook = |tag: &'static str| {
            let log = Rc::clone(log);
            Box::new(move |name: &str| log.borrow_mut().push(format!("{tag}:{name}")))
                as Box<dyn FnMut(&str)>
        };
        ScopeHooks {
            pre_forward: hook("pre_fw"),
            pre_backward: hook("pre_bw"),
            post_forward: hook("post_fw"),
            post_backward: hook("post_bw"),
        }
    }

    #[test]
    fn ledger_records_policy_and_custom_events() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Real);
        ctx.ledger_mut()
            .record(EvidenceKind::Dispatch, "dispatch decision");

        assert_eq!(ctx.ledger().len(), 2);
        assert_eq!(ctx.ledger().entries()[1].kind, EvidenceKind::Dispatch);
        assert_eq!(ctx.ledger().entries_of(EvidenceKind::Policy).count(), 1);
    }

    #[test]
    fn mode_switch_records_event() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Real);
        ctx.set_mode(ExecutionMode::Symbolic);

        assert_eq!(ctx.mode(), ExecutionMode::Symbolic);
        assert_eq!(ctx.ledger().len(), 2);
    }

    #[test]
    fn ledger_exports_one_json_object_per_line() {
        let mut ctx = RuntimeContext::new(ExecutionMode::Real);
        ctx.ledger_mut().record(EvidenceKind::Fallback, "mm: aliasing");
        let jsonl = ctx.ledger().to_jsonl().expect("jsonl");
        let lines = jsonl.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let last: serde_json::Value = serde_json::from_str(lines[1]).expect("json line");
        assert_eq!(last["kind"], "fallback");
        assert_eq!(last["summary"], "mm: aliasing");
    }

    #[test]
    fn root_scope_is_always_open() {
        let mut tracker = ScopeTracker::new();
        assert_eq!(tracker.parents(), &["Global".to_string()]);
        let err = tracker.exit(Phase::Forward).expect_err("root cannot close");
        assert_eq!(err, ScopeError::NoOpenScope { phase: Phase::Forward });
    }

    #[test]
    fn nested_scopes_are_qualified_by_their_parents() {
        let mut tracker = ScopeTracker::new();
        assert_eq!(tracker.enter("model", Phase::Forward).expect("model"), "model");
        assert_eq!(
            tracker.enter("fc1", Phase::Forward).expect("fc1"),
            "model.fc1"
        );
        assert_eq!(
            tracker.parents(),
            &["Global".to_string(), "model".to_string(), "model.fc1".to_string()]
        );
        assert_eq!(tracker.exit(Phase::Forward).expect("exit"), "model.fc1");
        assert_eq!(tracker.parents().len(), 2);
    }

    #[test]
    fn hooks_fire_per_phase_and_register_once() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let mut tracker = ScopeTracker::new();
        tracker
            .register_hooks(recording_hooks(&log))
            .expect("register");
        assert_eq!(
            tracker.register_hooks(recording_hooks(&log)).expect_err("twice"),
            ScopeError::HooksAlreadyRegistered
        );

        tracker.enter("layer", Phase::Forward).expect("enter");
        tracker.exit(Phase::Forward).expect("exit");
        tracker.enter("layer", Phase::Backward).expect("enter bw");
        assert!(tracker.is_backward());
        tracker.exit(Phase::Backward).expect("exit bw");

        assert!(tracker.clear_hooks().is_some());
        tracker.enter("after", Phase::Forward).expect("unhooked");

        assert_eq!(
            log.borrow().as_slice(),
            &["pre_fw:layer", "post_fw:layer", "pre_bw:layer", "post_bw:layer"]
        );
    }

    #[test]
    fn dotted_names_are_rejected() {
        let mut tracker = ScopeTracker::new();
        assert!(matches!(
            tracker.enter("a.b", Phase::Forward),
            Err(ScopeError::InvalidName { .. })
        ));
    }

    proptest! {
        #[test]
        fn prop_depth_matches_nesting(names in prop::collection::vec("[a-z]{1,6}", 1..6)) {
            let mut tracker = ScopeTracker::new();
            let mut last = String::new();
            for name in &names {
                last = tracker.enter(name, Phase::Forward).expect("enter");
            }
            prop_assert_eq!(scope_depth(&last), names.len());
            prop_assert_eq!(tracker.parents().len(), names.len() + 1);
        }
    }
}
