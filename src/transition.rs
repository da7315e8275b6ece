//! Transition tables: the directed graph of legal state changes.
//!
//! Every finite-state-machine-typed variable in the system validates its
//! assignments against a [`TransitionTable`]. Multiple machine instances of the
//! same logical type share one table; the table itself is immutable once built.
//!
//! State names stay data-driven (the store can declare machine types at
//! runtime), but the standard run lifecycle states used by the orchestration
//! layer are exported as constants so that handler selection is an explicit
//! `match` rather than name-based dispatch.

use crate::error::{RcError, RcResult};
use once_cell::sync::Lazy;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Sentinel state every machine starts in, preceding the first real state.
pub const INITIAL: &str = "Initial";
/// Participants are stopped (or have never started).
pub const NOT_READY: &str = "NotReady";
/// Participants are being started and have not yet all reported in.
pub const READYING: &str = "Readying";
/// Every active participant has reported ready.
pub const READY: &str = "Ready";

/// A validated directed graph of state name -> set of legal next states.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionTable {
    edges: BTreeMap<String, BTreeSet<String>>,
}

impl TransitionTable {
    /// Builds a table from `(from, [to...])` pairs.
    ///
    /// Fails with [`RcError::UnknownState`] if any target state is not itself
    /// declared as a source, so the graph is closed over its own domain.
    pub fn new<S: AsRef<str>>(pairs: &[(S, &[S])]) -> RcResult<Self> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (from, _) in pairs {
            edges.entry(from.as_ref().to_string()).or_default();
        }
        for (from, targets) in pairs {
            for to in targets.iter() {
                if !edges.contains_key(to.as_ref()) {
                    return Err(RcError::UnknownState(to.as_ref().to_string()));
                }
                if let Some(set) = edges.get_mut(from.as_ref()) {
                    set.insert(to.as_ref().to_string());
                }
            }
        }
        Ok(Self { edges })
    }

    /// True if `state` is in the table's domain.
    pub fn contains(&self, state: &str) -> bool {
        self.edges.contains_key(state)
    }

    /// True if `from -> to` is a declared edge.
    pub fn is_legal(&self, from: &str, to: &str) -> bool {
        self.edges.get(from).is_some_and(|set| set.contains(to))
    }

    /// Legal next states from `state`, alphabetically ordered.
    pub fn allowed_from(&self, state: &str) -> Vec<String> {
        self.edges
            .get(state)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Comma-joined legal next states, as used in FAIL replies.
    pub fn allowed_from_joined(&self, state: &str) -> String {
        self.allowed_from(state).join(",")
    }

    /// All declared state names, alphabetically ordered.
    pub fn states(&self) -> Vec<String> {
        self.edges.keys().cloned().collect()
    }

    /// Validates a requested transition, returning the canonical error on
    /// failure so callers report identical diagnostics everywhere.
    pub fn check(&self, from: &str, to: &str) -> RcResult<()> {
        if !self.contains(to) {
            return Err(RcError::UnknownState(to.to_string()));
        }
        if !self.is_legal(from, to) {
            return Err(RcError::IllegalTransition {
                from: from.to_string(),
                to: to.to_string(),
                allowed: self.allowed_from_joined(from),
            });
        }
        Ok(())
    }
}

static RUN_STATE_TABLE: Lazy<Arc<TransitionTable>> = Lazy::new(|| {
    #[allow(clippy::expect_used)] // static table, malformed only by programming error
    Arc::new(
        TransitionTable::new(&[
            (INITIAL, &[NOT_READY][..]),
            (NOT_READY, &[READYING][..]),
            (READYING, &[READY][..]),
            (READY, &[NOT_READY][..]),
        ])
        .expect("standard run-state table is well formed"),
    )
});

/// The standard run lifecycle table shared by the global state and every
/// per-program state variable.
pub fn run_state_table() -> Arc<TransitionTable> {
    Arc::clone(&RUN_STATE_TABLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_table_edges() {
        let t = run_state_table();
        assert!(t.is_legal(INITIAL, NOT_READY));
        assert!(t.is_legal(NOT_READY, READYING));
        assert!(t.is_legal(READYING, READY));
        assert!(t.is_legal(READY, NOT_READY));
        assert!(!t.is_legal(READYING, NOT_READY));
        assert!(!t.is_legal(INITIAL, READY));
    }

    #[test]
    fn test_undeclared_target_rejected() {
        let result = TransitionTable::new(&[("A", &["B"][..])]);
        assert!(matches!(result, Err(RcError::UnknownState(s)) if s == "B"));
    }

    #[test]
    fn test_check_reports_allowed_list() {
        let t = run_state_table();
        let err = t.check(NOT_READY, READY).unwrap_err();
        match err {
            RcError::IllegalTransition { allowed, .. } => assert_eq!(allowed, "Readying"),
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_allowed_from_is_sorted() {
        let t = TransitionTable::new(&[
            ("Hub", &["Zeta", "Alpha", "Hub"][..]),
            ("Zeta", &["Hub"][..]),
            ("Alpha", &[][..]),
        ])
        .unwrap();
        assert_eq!(t.allowed_from("Hub"), vec!["Alpha", "Hub", "Zeta"]);
        assert_eq!(t.allowed_from_joined("Hub"), "Alpha,Hub,Zeta");
    }

    #[test]
    fn test_unknown_state_has_no_successors() {
        let t = run_state_table();
        assert!(t.allowed_from("Bogus").is_empty());
        assert!(matches!(
            t.check(READY, "Bogus"),
            Err(RcError::UnknownState(_))
        ));
    }
}
