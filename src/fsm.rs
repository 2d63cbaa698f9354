//! The flat, indexed finite state machine produced by the compiler.
//!
//! States are addressed by index and linked with *relative* offsets so that
//! `chain` (fragment concatenation) never has to renumber anything: shifting
//! a fragment's start index leaves every relative offset inside it valid.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The operation a single FSM state performs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum NodeKind {
    /// No-op; used as block markers and loop/branch join points.
    Pass,
    /// Runs `inspect` but performs no other work; the lowered form of the
    /// primitive `empty` combinator.
    Empty,
    /// Invokes a remote action.
    Action { name: String, is_async: bool },
    /// Evaluates inline function source against the visible variable
    /// environment.
    Function { code: String },
    /// Pushes a stack frame. `declarations: None` is a mask frame;
    /// `Some(map)` is a let frame.
    Let { declarations: Option<Value> },
    /// Pops the top stack frame.
    Exit,
    /// Installs a catch frame pointing `catch` states ahead.
    Try { catch: i64 },
    /// Branches on `params.value`: `then` states ahead if truthy, `else`
    /// states ahead otherwise.
    Choice { then: i64, else_: i64 },
}

/// One state in the compiled machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FsmNode {
    pub kind: NodeKind,
    /// Relative offset to the default successor; `None` means terminal.
    pub next: Option<i64>,
    /// Debug label carried over from the AST's `path`.
    pub path: Option<String>,
}

impl FsmNode {
    pub fn new(kind: NodeKind) -> Self {
        FsmNode { kind, next: Some(1), path: None }
    }

    pub fn terminal(kind: NodeKind) -> Self {
        FsmNode { kind, next: None, path: None }
    }

    pub fn with_path(mut self, path: Option<String>) -> Self {
        self.path = path;
        self
    }

    pub fn with_next(mut self, next: Option<i64>) -> Self {
        self.next = next;
        self
    }
}

/// A compiled, immutable finite state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Fsm {
    pub states: Vec<FsmNode>,
}

impl Fsm {
    pub fn new(states: Vec<FsmNode>) -> Self {
        Fsm { states }
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&FsmNode> {
        self.states.get(index)
    }

    /// Every relative offset (`next`, `then`/`else_`, `catch`) lands within
    /// `[0, len)` when added to its own state's index, and every `try`'s
    /// catch target is reachable.
    pub fn is_well_formed(&self) -> bool {
        let len = self.states.len() as i64;
        let in_range = |idx: usize, offset: i64| -> bool {
            let target = idx as i64 + offset;
            target >= 0 && target < len
        };
        for (idx, node) in self.states.iter().enumerate() {
            if let Some(next) = node.next {
                if !in_range(idx, next) {
                    return false;
                }
            }
            match &node.kind {
                NodeKind::Choice { then, else_ } => {
                    if !in_range(idx, *then) || !in_range(idx, *else_) {
                        return false;
                    }
                },
                NodeKind::Try { catch } => {
                    if !in_range(idx, *catch) {
                        return false;
                    }
                },
                _ => {},
            }
        }
        true
    }
}
