//! Plugin interface: the surface by which a host process can extend the
//! combinator set without recompiling this crate.
//!
//! A plugin contributes three things, each merged read-only into the
//! pipeline before any composition is built: new combinator descriptors,
//! lowering rewrites for combinators it introduces, and extra compiler
//! rules for any of those that are themselves primitive. A plugin never
//! gets a handle to a compiled [`Fsm`] and cannot mutate one after the
//! fact — the conductor's state machine is closed once `compile` returns.

use serde_json::Value;

use crate::ast::Composition;
use crate::combinator::CombinatorDescriptor;
use crate::error::{CompileError, LowerError};
use crate::fsm::FsmNode;

/// A named lowering rewrite: takes the matched node and returns its
/// replacement, same contract as the canonical rewrites in
/// [`crate::lower`].
pub type RewriteFn = fn(&Composition) -> Result<Composition, LowerError>;

/// A named compilation rule for a plugin-introduced primitive.
pub type CompileFn = fn(&Composition) -> Result<Vec<FsmNode>, CompileError>;

/// A hook run on the final `params` just before a composition returns a
/// terminal outcome.
pub type FinishFn = fn(&Value) -> Value;

/// Everything a plugin contributes to the pipeline.
pub trait Plugin: Send + Sync {
    /// Additional combinator descriptors. Names already present in the
    /// registry are never overridden (see
    /// [`crate::combinator::CombinatorRegistry::merge`]).
    fn combinators(&self) -> Vec<CombinatorDescriptor> {
        Vec::new()
    }

    /// Lowering rewrites for the enhanced combinators this plugin
    /// introduces, keyed by combinator name.
    fn rewrites(&self) -> Vec<(&'static str, RewriteFn)> {
        Vec::new()
    }

    /// Compilation rules for the primitive combinators this plugin
    /// introduces, keyed by combinator name.
    fn compilers(&self) -> Vec<(&'static str, CompileFn)> {
        Vec::new()
    }

    /// An optional hook run on `params` just before a composition
    /// terminates, e.g. for a plugin that wants to strip or annotate the
    /// final result.
    fn finish(&self) -> Option<FinishFn> {
        None
    }
}

/// A table of plugin-contributed rewrites, compile rules, and finish
/// hooks, consulted by the lowerer, compiler, and conductor after their
/// own built-in dispatch misses.
#[derive(Default)]
pub struct PluginTable {
    rewrites: Vec<(&'static str, RewriteFn)>,
    compilers: Vec<(&'static str, CompileFn)>,
    finishers: Vec<FinishFn>,
}

impl PluginTable {
    pub fn register(&mut self, plugin: &dyn Plugin) {
        self.rewrites.extend(plugin.rewrites());
        self.compilers.extend(plugin.compilers());
        if let Some(f) = plugin.finish() {
            self.finishers.push(f);
        }
    }

    pub fn rewrite_for(&self, kind: &str) -> Option<RewriteFn> {
        self.rewrites.iter().find(|(name, _)| *name == kind).map(|(_, f)| *f)
    }

    pub fn compiler_for(&self, kind: &str) -> Option<CompileFn> {
        self.compilers.iter().find(|(name, _)| *name == kind).map(|(_, f)| *f)
    }

    /// Runs every registered finish hook over `params` in registration
    /// order, just before a terminal outcome is returned.
    pub fn run_finishers(&self, params: &Value) -> Value {
        let mut current = params.clone();
        for f in &self.finishers {
            current = f(&current);
        }
        current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::combinator::CombinatorDescriptor;

    struct DoubleActionPlugin;

    fn rewrite_double(node: &Composition) -> Result<Composition, LowerError> {
        let action = node.child_composition("action").cloned().ok_or_else(|| LowerError::invalid_rewrite("double_action", "missing `action`"))?;
        Ok(Composition::new("sequence").with_components(vec![action.clone(), action]))
    }

    impl Plugin for DoubleActionPlugin {
        fn combinators(&self) -> Vec<CombinatorDescriptor> {
            vec![CombinatorDescriptor { name: "double_action", variadic: false, args: vec![], since: Some("0.1.0") }]
        }

        fn rewrites(&self) -> Vec<(&'static str, RewriteFn)> {
            vec![("double_action", rewrite_double as RewriteFn)]
        }
    }

    #[test]
    fn plugin_table_looks_up_registered_rewrite() {
        let mut table = PluginTable::default();
        table.register(&DoubleActionPlugin);
        assert!(table.rewrite_for("double_action").is_some());
        assert!(table.rewrite_for("unregistered").is_none());
    }
}
