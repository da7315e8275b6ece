//! Store adapter: the hierarchical, typed, shared-variable namespace.
//!
//! The engine treats the store as an external collaborator reached through the
//! [`Store`] trait: a tree of directories holding typed variables, with a
//! change feed that every consumer drains sequentially. The store's own
//! persistence and indexing machinery stays behind the trait.
//!
//! [`MemoryStore`] is the in-process implementation used by tests and by the
//! default wiring of the binaries, in the same way the hardware layer keeps a
//! faithful in-memory stand-in behind its adapter trait.
//!
//! # Change feed wire format
//!
//! Events serialize to colon-separated lines and parse back losslessly:
//!
//! ```text
//! <parentPath>:MKDIR:<childName>
//! <parentPath>:RMDIR:<childName>
//! <path>:ASSIGN:<newValue>
//! <path>:NEWVAR:<type>|<initialValue>
//! <typeName>:TYPE:<enum|statemachine>
//! ```
//!
//! Paths never contain colons, so each keyword is located at its first
//! occurrence; the value side may contain anything (including colons).

use crate::error::{RcError, RcResult};
use crate::transition::TransitionTable;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Kind tag carried by a `TYPE` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    /// Enumerated value type.
    Enum,
    /// Validated finite-state-machine type.
    StateMachine,
}

impl fmt::Display for TypeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeKind::Enum => write!(f, "enum"),
            TypeKind::StateMachine => write!(f, "statemachine"),
        }
    }
}

/// One entry of the store change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A child directory appeared under `parent`.
    Mkdir {
        /// Directory the child was created in.
        parent: String,
        /// Name of the new child directory.
        child: String,
    },
    /// A child directory (and its subtree) disappeared.
    Rmdir {
        /// Directory the child was removed from.
        parent: String,
        /// Name of the removed child directory.
        child: String,
    },
    /// A variable received a new value.
    Assign {
        /// Full path of the variable.
        path: String,
        /// The value just assigned.
        value: String,
    },
    /// A variable was created.
    NewVar {
        /// Full path of the variable.
        path: String,
        /// Type name of the variable.
        type_name: String,
        /// Initial value.
        initial: String,
    },
    /// A value type was declared.
    NewType {
        /// Name of the declared type.
        name: String,
        /// Enumeration or state machine.
        kind: TypeKind,
    },
}

impl fmt::Display for StoreEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreEvent::Mkdir { parent, child } => write!(f, "{parent}:MKDIR:{child}"),
            StoreEvent::Rmdir { parent, child } => write!(f, "{parent}:RMDIR:{child}"),
            StoreEvent::Assign { path, value } => write!(f, "{path}:ASSIGN:{value}"),
            StoreEvent::NewVar {
                path,
                type_name,
                initial,
            } => write!(f, "{path}:NEWVAR:{type_name}|{initial}"),
            StoreEvent::NewType { name, kind } => write!(f, "{name}:TYPE:{kind}"),
        }
    }
}

impl FromStr for StoreEvent {
    type Err = RcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some((parent, child)) = s.split_once(":MKDIR:") {
            return Ok(StoreEvent::Mkdir {
                parent: parent.to_string(),
                child: child.to_string(),
            });
        }
        if let Some((parent, child)) = s.split_once(":RMDIR:") {
            return Ok(StoreEvent::Rmdir {
                parent: parent.to_string(),
                child: child.to_string(),
            });
        }
        if let Some((path, value)) = s.split_once(":ASSIGN:") {
            return Ok(StoreEvent::Assign {
                path: path.to_string(),
                value: value.to_string(),
            });
        }
        if let Some((path, rest)) = s.split_once(":NEWVAR:") {
            let (type_name, initial) = rest
                .split_once('|')
                .ok_or_else(|| RcError::Malformed(s.to_string()))?;
            return Ok(StoreEvent::NewVar {
                path: path.to_string(),
                type_name: type_name.to_string(),
                initial: initial.to_string(),
            });
        }
        if let Some((name, kind)) = s.split_once(":TYPE:") {
            let kind = match kind {
                "enum" => TypeKind::Enum,
                "statemachine" => TypeKind::StateMachine,
                _ => return Err(RcError::Malformed(s.to_string())),
            };
            return Ok(StoreEvent::NewType {
                name: name.to_string(),
                kind,
            });
        }
        Err(RcError::Malformed(s.to_string()))
    }
}

/// Hierarchical typed variable store with a change feed.
///
/// All operations are synchronous; the feed is drained through the receiver
/// handed out by [`Store::subscribe`]. Consumers must process the feed
/// sequentially: roster-diff classification downstream is order-sensitive.
pub trait Store: Send + Sync {
    /// Creates directory `child` under existing directory `parent`.
    fn mkdir(&self, parent: &str, child: &str) -> RcResult<()>;

    /// Removes directory `child` of `parent` together with its subtree.
    fn rmdir(&self, parent: &str, child: &str) -> RcResult<()>;

    /// Declares an enumerated value type.
    fn declare_enum(&self, type_name: &str, values: &[&str]) -> RcResult<()>;

    /// Declares a finite-state-machine type validated by `table`.
    fn declare_machine(&self, type_name: &str, table: Arc<TransitionTable>) -> RcResult<()>;

    /// Creates a variable of a built-in (`string`, `integer`, `bool`) or
    /// previously declared type, with an initial value.
    fn declare_var(&self, path: &str, type_name: &str, initial: &str) -> RcResult<()>;

    /// Assigns a value, validating against the variable's type. For machine
    /// types the assignment must be a legal transition from the current value.
    fn set(&self, path: &str, value: &str) -> RcResult<()>;

    /// Supervision override: assigns a machine variable any state in its
    /// table's domain, skipping the edge check. Other types behave as `set`.
    fn force_set(&self, path: &str, value: &str) -> RcResult<()>;

    /// Reads the current value of a variable.
    fn get(&self, path: &str) -> RcResult<String>;

    /// Lists child directory names of `path`, alphabetically.
    fn ls(&self, path: &str) -> RcResult<Vec<String>>;

    /// True if a directory or variable exists at `path`.
    fn exists(&self, path: &str) -> bool;

    /// Opens a new change-feed subscription. Events created after this call
    /// are delivered in store emission order.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent>;
}

#[derive(Debug, Clone)]
enum VarType {
    Text,
    Integer,
    Bool,
    Enum {
        name: String,
        values: Vec<String>,
    },
    Machine {
        name: String,
        table: Arc<TransitionTable>,
    },
}

impl VarType {
    fn name(&self) -> &str {
        match self {
            VarType::Text => "string",
            VarType::Integer => "integer",
            VarType::Bool => "bool",
            VarType::Enum { name, .. } => name,
            VarType::Machine { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    Dir,
    Var { vtype: VarType, value: String },
}

#[derive(Default)]
struct Inner {
    nodes: BTreeMap<String, Node>,
    types: BTreeMap<String, VarType>,
    subscribers: Vec<mpsc::UnboundedSender<StoreEvent>>,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

fn join(parent: &str, child: &str) -> String {
    if parent == "/" {
        format!("/{child}")
    } else {
        format!("{parent}/{child}")
    }
}

impl MemoryStore {
    /// Creates an empty store containing only the root directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn publish(&mut self, event: StoreEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn dir_exists(&self, path: &str) -> bool {
        path == "/" || matches!(self.nodes.get(path), Some(Node::Dir))
    }

    fn resolve_type(&self, type_name: &str) -> RcResult<VarType> {
        match type_name {
            "string" => Ok(VarType::Text),
            "integer" => Ok(VarType::Integer),
            "bool" => Ok(VarType::Bool),
            other => self
                .types
                .get(other)
                .cloned()
                .ok_or_else(|| RcError::InvalidValue(format!("unknown type '{other}'"))),
        }
    }

    fn validate(&self, path: &str, vtype: &VarType, current: &str, value: &str, forced: bool) -> RcResult<()> {
        match vtype {
            VarType::Text => Ok(()),
            VarType::Integer => value.parse::<i64>().map(|_| ()).map_err(|_| {
                RcError::TypeMismatch {
                    path: path.to_string(),
                    detail: format!("'{value}' is not an integer"),
                }
            }),
            VarType::Bool => match value {
                "true" | "false" => Ok(()),
                _ => Err(RcError::TypeMismatch {
                    path: path.to_string(),
                    detail: format!("'{value}' is not a bool"),
                }),
            },
            VarType::Enum { values, .. } => {
                if values.iter().any(|v| v == value) {
                    Ok(())
                } else {
                    Err(RcError::TypeMismatch {
                        path: path.to_string(),
                        detail: format!("'{value}' is not an enum member"),
                    })
                }
            }
            VarType::Machine { table, .. } => {
                if forced {
                    if table.contains(value) {
                        Ok(())
                    } else {
                        Err(RcError::UnknownState(value.to_string()))
                    }
                } else {
                    table.check(current, value)
                }
            }
        }
    }

    fn assign(&mut self, path: &str, value: &str, forced: bool) -> RcResult<()> {
        let (vtype, current) = match self.nodes.get(path) {
            Some(Node::Var { vtype, value }) => (vtype.clone(), value.clone()),
            Some(Node::Dir) => return Err(RcError::NoSuchPath(path.to_string())),
            None => return Err(RcError::NoSuchPath(path.to_string())),
        };
        self.validate(path, &vtype, &current, value, forced)?;
        if let Some(Node::Var { value: stored, .. }) = self.nodes.get_mut(path) {
            *stored = value.to_string();
        }
        self.publish(StoreEvent::Assign {
            path: path.to_string(),
            value: value.to_string(),
        });
        Ok(())
    }
}

impl Store for MemoryStore {
    fn mkdir(&self, parent: &str, child: &str) -> RcResult<()> {
        let mut inner = self.lock();
        if !inner.dir_exists(parent) {
            return Err(RcError::NoSuchPath(parent.to_string()));
        }
        let path = join(parent, child);
        if inner.nodes.contains_key(&path) {
            return Err(RcError::InvalidValue(format!("'{path}' already exists")));
        }
        inner.nodes.insert(path, Node::Dir);
        inner.publish(StoreEvent::Mkdir {
            parent: parent.to_string(),
            child: child.to_string(),
        });
        Ok(())
    }

    fn rmdir(&self, parent: &str, child: &str) -> RcResult<()> {
        let mut inner = self.lock();
        let path = join(parent, child);
        match inner.nodes.get(&path) {
            Some(Node::Dir) => {}
            Some(Node::Var { .. }) => return Err(RcError::NotADirectory(path)),
            None => return Err(RcError::NoSuchPath(path)),
        }
        let prefix = format!("{path}/");
        inner
            .nodes
            .retain(|p, _| p != &path && !p.starts_with(&prefix));
        inner.publish(StoreEvent::Rmdir {
            parent: parent.to_string(),
            child: child.to_string(),
        });
        Ok(())
    }

    fn declare_enum(&self, type_name: &str, values: &[&str]) -> RcResult<()> {
        if values.is_empty() {
            return Err(RcError::InvalidValue(format!(
                "enum '{type_name}' needs at least one value"
            )));
        }
        let mut inner = self.lock();
        if inner.types.contains_key(type_name) {
            return Err(RcError::InvalidValue(format!(
                "type '{type_name}' already declared"
            )));
        }
        inner.types.insert(
            type_name.to_string(),
            VarType::Enum {
                name: type_name.to_string(),
                values: values.iter().map(|v| v.to_string()).collect(),
            },
        );
        inner.publish(StoreEvent::NewType {
            name: type_name.to_string(),
            kind: TypeKind::Enum,
        });
        Ok(())
    }

    fn declare_machine(&self, type_name: &str, table: Arc<TransitionTable>) -> RcResult<()> {
        let mut inner = self.lock();
        if inner.types.contains_key(type_name) {
            return Err(RcError::InvalidValue(format!(
                "type '{type_name}' already declared"
            )));
        }
        inner.types.insert(
            type_name.to_string(),
            VarType::Machine {
                name: type_name.to_string(),
                table,
            },
        );
        inner.publish(StoreEvent::NewType {
            name: type_name.to_string(),
            kind: TypeKind::StateMachine,
        });
        Ok(())
    }

    fn declare_var(&self, path: &str, type_name: &str, initial: &str) -> RcResult<()> {
        let mut inner = self.lock();
        let parent = path.rsplit_once('/').map(|(p, _)| p).unwrap_or("");
        let parent = if parent.is_empty() { "/" } else { parent };
        if !inner.dir_exists(parent) {
            return Err(RcError::NoSuchPath(parent.to_string()));
        }
        if inner.nodes.contains_key(path) {
            return Err(RcError::InvalidValue(format!("'{path}' already exists")));
        }
        let vtype = inner.resolve_type(type_name)?;
        // Initial values only need to be in the type's domain; machines may
        // start from any declared state, typically the sentinel.
        match &vtype {
            VarType::Machine { table, .. } => {
                if !table.contains(initial) {
                    return Err(RcError::UnknownState(initial.to_string()));
                }
            }
            other => inner.validate(path, other, "", initial, false)?,
        }
        let type_label = vtype.name().to_string();
        inner.nodes.insert(
            path.to_string(),
            Node::Var {
                vtype,
                value: initial.to_string(),
            },
        );
        inner.publish(StoreEvent::NewVar {
            path: path.to_string(),
            type_name: type_label,
            initial: initial.to_string(),
        });
        Ok(())
    }

    fn set(&self, path: &str, value: &str) -> RcResult<()> {
        self.lock().assign(path, value, false)
    }

    fn force_set(&self, path: &str, value: &str) -> RcResult<()> {
        self.lock().assign(path, value, true)
    }

    fn get(&self, path: &str) -> RcResult<String> {
        match self.lock().nodes.get(path) {
            Some(Node::Var { value, .. }) => Ok(value.clone()),
            _ => Err(RcError::NoSuchPath(path.to_string())),
        }
    }

    fn ls(&self, path: &str) -> RcResult<Vec<String>> {
        let inner = self.lock();
        if !inner.dir_exists(path) {
            return Err(RcError::NoSuchPath(path.to_string()));
        }
        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{path}/")
        };
        let mut children = Vec::new();
        for (p, node) in inner.nodes.range(prefix.clone()..) {
            if !p.starts_with(&prefix) {
                break;
            }
            let rest = &p[prefix.len()..];
            if !rest.contains('/') {
                if let Node::Dir = node {
                    children.push(rest.to_string());
                }
            }
        }
        Ok(children)
    }

    fn exists(&self, path: &str) -> bool {
        let inner = self.lock();
        inner.dir_exists(path) || inner.nodes.contains_key(path)
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<StoreEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().subscribers.push(tx);
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transition::{run_state_table, INITIAL, NOT_READY};

    #[test]
    fn test_event_wire_round_trip() {
        let cases = [
            StoreEvent::Mkdir {
                parent: "/RunState".into(),
                child: "det".into(),
            },
            StoreEvent::Rmdir {
                parent: "/RunState".into(),
                child: "det".into(),
            },
            StoreEvent::Assign {
                path: "/RunState/Title".into(),
                value: "beam: 12 GeV".into(),
            },
            StoreEvent::NewVar {
                path: "/RunState/RunNumber".into(),
                type_name: "integer".into(),
                initial: "0".into(),
            },
            StoreEvent::NewType {
                name: "RunStateMachine".into(),
                kind: TypeKind::StateMachine,
            },
        ];
        for event in cases {
            let wire = event.to_string();
            let parsed: StoreEvent = wire.parse().unwrap();
            assert_eq!(parsed, event, "round trip failed for {wire}");
        }
    }

    #[test]
    fn test_assign_value_may_contain_colons() {
        let wire = "/RunState/Title:ASSIGN:run 5: cosmics";
        let parsed: StoreEvent = wire.parse().unwrap();
        assert_eq!(
            parsed,
            StoreEvent::Assign {
                path: "/RunState/Title".into(),
                value: "run 5: cosmics".into(),
            }
        );
    }

    #[test]
    fn test_malformed_event_rejected() {
        assert!("just text".parse::<StoreEvent>().is_err());
        assert!("/x:NEWVAR:no-separator".parse::<StoreEvent>().is_err());
        assert!("T:TYPE:widget".parse::<StoreEvent>().is_err());
    }

    #[test]
    fn test_mkdir_rmdir_and_ls() {
        let store = MemoryStore::new();
        store.mkdir("/", "RunState").unwrap();
        store.mkdir("/RunState", "det").unwrap();
        store.mkdir("/RunState", "alpha").unwrap();
        assert_eq!(store.ls("/RunState").unwrap(), vec!["alpha", "det"]);
        store.rmdir("/RunState", "det").unwrap();
        assert_eq!(store.ls("/RunState").unwrap(), vec!["alpha"]);
        assert!(store.mkdir("/Missing", "x").is_err());
    }

    #[test]
    fn test_machine_variable_validates_transitions() {
        let store = MemoryStore::new();
        store.mkdir("/", "RunState").unwrap();
        store
            .declare_machine("RunStateMachine", run_state_table())
            .unwrap();
        store
            .declare_var("/RunState/State", "RunStateMachine", INITIAL)
            .unwrap();

        // Legal edge.
        store.set("/RunState/State", NOT_READY).unwrap();
        // Illegal edge leaves the value unchanged.
        assert!(store.set("/RunState/State", "Ready").is_err());
        assert_eq!(store.get("/RunState/State").unwrap(), NOT_READY);
        // Forced assignment only checks the domain.
        store.force_set("/RunState/State", "Ready").unwrap();
        assert_eq!(store.get("/RunState/State").unwrap(), "Ready");
        assert!(store.force_set("/RunState/State", "Bogus").is_err());
    }

    #[test]
    fn test_enum_variable_validates_value_set() {
        let store = MemoryStore::new();
        store.mkdir("/", "RunState").unwrap();
        store.declare_enum("Mode", &["cosmics", "beam"]).unwrap();
        store
            .declare_var("/RunState/Mode", "Mode", "cosmics")
            .unwrap();

        // Out-of-set assignment fails and leaves the value unchanged.
        assert!(store.set("/RunState/Mode", "calib").is_err());
        assert_eq!(store.get("/RunState/Mode").unwrap(), "cosmics");
        store.set("/RunState/Mode", "beam").unwrap();
        assert_eq!(store.get("/RunState/Mode").unwrap(), "beam");

        // Redeclaration and empty value sets are rejected.
        assert!(store.declare_enum("Mode", &["x"]).is_err());
        assert!(store.declare_enum("Empty", &[]).is_err());
    }

    #[test]
    fn test_typed_scalars() {
        let store = MemoryStore::new();
        store.mkdir("/", "RunState").unwrap();
        store
            .declare_var("/RunState/RunNumber", "integer", "0")
            .unwrap();
        store
            .declare_var("/RunState/Recording", "bool", "false")
            .unwrap();
        assert!(store.set("/RunState/RunNumber", "twelve").is_err());
        store.set("/RunState/RunNumber", "12").unwrap();
        assert!(store.set("/RunState/Recording", "yes").is_err());
        store.set("/RunState/Recording", "true").unwrap();
    }

    #[test]
    fn test_feed_order_and_contents() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.mkdir("/", "RunState").unwrap();
        store
            .declare_var("/RunState/Title", "string", "")
            .unwrap();
        store.set("/RunState/Title", "cosmics").unwrap();

        assert!(matches!(rx.try_recv().unwrap(), StoreEvent::Mkdir { .. }));
        assert!(matches!(rx.try_recv().unwrap(), StoreEvent::NewVar { .. }));
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent::Assign {
                path: "/RunState/Title".into(),
                value: "cosmics".into(),
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
