//! Composition compiler and conductor.
//!
//! Four cooperating stages, leaves first: a combinator registry and
//! builder, a lowerer that rewrites enhanced combinators onto a small
//! primitive set, a compiler that linearises the lowered tree into a flat
//! finite state machine, and a conductor that executes that machine one
//! state at a time over a parameter object and a runtime stack,
//! suspending for remote actions and resuming from a host-supplied
//! continuation.

pub mod ast;
pub mod combinator;
pub mod compile;
pub mod conductor;
pub mod error;
pub mod eval;
pub mod fsm;
pub mod host;
pub mod loader;
pub mod lower;
pub mod plugin;

pub use ast::{Arg, Composition};
pub use combinator::{Builder, CombinatorDescriptor, CombinatorRegistry};
pub use compile::compile;
pub use conductor::{conduct, ActionInvoker, Frame};
pub use error::{BuildError, CompileError, ConductError, EvalError, LowerError};
pub use fsm::{Fsm, FsmNode, NodeKind};
pub use host::{ContinuationState, Outcome, Resume};
pub use lower::{label, lower, LowerTarget, Version};
pub use plugin::{FinishFn, Plugin, PluginTable};
