//! Compiles a lowered, labeled AST into a flat [`Fsm`] using relative
//! jumps, so fragments can be concatenated with plain list concatenation.

use serde_json::Value;

use crate::ast::{Arg, Composition};
use crate::error::CompileError;
use crate::fsm::{Fsm, FsmNode, NodeKind};

/// Concatenates two FSM fragments: the last state of `front` is rewired to
/// fall through into the first state of `back`.
fn chain(mut front: Vec<FsmNode>, back: Vec<FsmNode>) -> Vec<FsmNode> {
    if let Some(last) = front.last_mut() {
        last.next = Some(1);
    }
    front.extend(back);
    front
}

/// Compiles `root` into a complete, well-formed machine. The final state's
/// fallthrough is always forced terminal, since nothing follows the root.
pub fn compile(root: &Composition) -> Result<Fsm, CompileError> {
    let mut states = compile_node(root)?;
    if let Some(last) = states.last_mut() {
        last.next = None;
    }
    let fsm = Fsm::new(states);
    if !fsm.is_well_formed() {
        return Err(CompileError::Internal("compiled fsm has an out-of-range jump".to_string()));
    }
    Ok(fsm)
}

fn child<'a>(node: &'a Composition, slot: &str) -> Result<&'a Composition, CompileError> {
    node.child_composition(slot).ok_or_else(|| CompileError::missing_slot(node.kind.clone(), slot))
}

fn compile_node(node: &Composition) -> Result<Vec<FsmNode>, CompileError> {
    let path = node.path.clone();
    match node.kind.as_str() {
        "sequence" => compile_sequence(node.components_or_empty(), path),
        "action" => compile_action(node, path),
        "function" => compile_function(node, path),
        "let" => compile_scope(node.arg("declarations").and_then(Arg::as_object).map(|m| Value::Object(m.clone())), node.components_or_empty(), path),
        "mask" => compile_scope(None, node.components_or_empty(), path),
        "try" => compile_try(child(node, "body")?, child(node, "handler")?, path),
        "finally" => compile_finally(child(node, "body")?, child(node, "finalizer")?, path),
        "if_nosave" => {
            let test = child(node, "test")?;
            let consequent = child(node, "consequent")?;
            let alternate = node.child_composition("alternate").cloned().unwrap_or_else(Composition::empty);
            compile_if_nosave(test, consequent, &alternate, path)
        },
        "while_nosave" => compile_while_nosave(child(node, "test")?, child(node, "body")?, path),
        "dowhile_nosave" => compile_dowhile_nosave(child(node, "body")?, child(node, "test")?, path),
        other => Err(CompileError::NotPrimitive(other.to_string())),
    }
}

fn compile_sequence(children: &[Composition], path: Option<String>) -> Result<Vec<FsmNode>, CompileError> {
    let mut out = vec![FsmNode::new(NodeKind::Pass).with_path(path)];
    for c in children {
        out = chain(out, compile_node(c)?);
    }
    Ok(out)
}

fn compile_action(node: &Composition, path: Option<String>) -> Result<Vec<FsmNode>, CompileError> {
    let name = node.arg("name").and_then(Arg::as_str).ok_or_else(|| CompileError::missing_slot("action", "name"))?.to_string();
    let is_async = node.arg("options").and_then(Arg::as_object).and_then(|m| m.get("async")).and_then(Value::as_bool).unwrap_or(false);
    Ok(vec![FsmNode::new(NodeKind::Action { name, is_async }).with_path(path)])
}

fn compile_function(node: &Composition, path: Option<String>) -> Result<Vec<FsmNode>, CompileError> {
    let code = node
        .arg("function")
        .and_then(Arg::as_object)
        .and_then(|m| m.get("exec"))
        .and_then(|v| v.get("code"))
        .and_then(Value::as_str)
        .ok_or_else(|| CompileError::missing_slot("function", "function.exec.code"))?
        .to_string();
    Ok(vec![FsmNode::new(NodeKind::Function { code }).with_path(path)])
}

fn compile_scope(declarations: Option<Value>, children: &[Composition], path: Option<String>) -> Result<Vec<FsmNode>, CompileError> {
    let mut out = vec![FsmNode::new(NodeKind::Let { declarations }).with_path(path)];
    for c in children {
        out = chain(out, compile_node(c)?);
    }
    out = chain(out, vec![FsmNode::new(NodeKind::Exit)]);
    Ok(out)
}

fn compile_try(body: &Composition, handler: &Composition, path: Option<String>) -> Result<Vec<FsmNode>, CompileError> {
    let mut out = vec![FsmNode::new(NodeKind::Try { catch: 0 }).with_path(path)];
    out = chain(out, compile_node(body)?);
    out = chain(out, vec![FsmNode::new(NodeKind::Exit)]);
    let exit_idx = out.len() - 1;
    let handler_start = out.len();
    out.extend(compile_node(handler)?);
    let join_idx = out.len();
    out.push(FsmNode::new(NodeKind::Pass));
    out[0].kind = NodeKind::Try { catch: handler_start as i64 };
    out[exit_idx].next = Some(join_idx as i64 - exit_idx as i64);
    Ok(out)
}

fn compile_finally(body: &Composition, finalizer: &Composition, path: Option<String>) -> Result<Vec<FsmNode>, CompileError> {
    let mut out = vec![FsmNode::new(NodeKind::Try { catch: 0 }).with_path(path)];
    out = chain(out, compile_node(body)?);
    out = chain(out, vec![FsmNode::new(NodeKind::Exit)]);
    let finalizer_start = out.len();
    out = chain(out, compile_node(finalizer)?);
    out[0].kind = NodeKind::Try { catch: finalizer_start as i64 };
    Ok(out)
}

fn compile_if_nosave(test: &Composition, consequent: &Composition, alternate: &Composition, path: Option<String>) -> Result<Vec<FsmNode>, CompileError> {
    let mut out = vec![FsmNode::new(NodeKind::Pass).with_path(path)];
    out = chain(out, compile_node(test)?);
    let consequent_states = compile_node(consequent)?;
    let alternate_states = compile_node(alternate)?;
    let else_offset = consequent_states.len() as i64 + 1;
    out.push(FsmNode::new(NodeKind::Choice { then: 1, else_: else_offset }));
    let consequent_start = out.len();
    out.extend(consequent_states);
    let consequent_last_idx = out.len() - 1;
    out.extend(alternate_states);
    let join_idx = out.len();
    out.push(FsmNode::new(NodeKind::Pass));
    out[consequent_last_idx].next = Some(join_idx as i64 - consequent_last_idx as i64);
    let _ = consequent_start;
    Ok(out)
}

fn compile_while_nosave(test: &Composition, body: &Composition, path: Option<String>) -> Result<Vec<FsmNode>, CompileError> {
    let mut out = vec![FsmNode::new(NodeKind::Pass).with_path(path)];
    let test_start = out.len();
    out = chain(out, compile_node(test)?);
    let choice_idx = out.len();
    let body_states = compile_node(body)?;
    let body_start = choice_idx + 1;
    let trailing_idx = body_start + body_states.len();
    let else_offset = trailing_idx as i64 - choice_idx as i64;
    out.push(FsmNode::new(NodeKind::Choice { then: 1, else_: else_offset }));
    out.extend(body_states);
    let body_last_idx = trailing_idx - 1;
    out[body_last_idx].next = Some(test_start as i64 - body_last_idx as i64);
    out.push(FsmNode::new(NodeKind::Pass));
    Ok(out)
}

fn compile_dowhile_nosave(body: &Composition, test: &Composition, path: Option<String>) -> Result<Vec<FsmNode>, CompileError> {
    let mut out = vec![FsmNode::new(NodeKind::Pass).with_path(path)];
    let body_start = out.len();
    out = chain(out, compile_node(body)?);
    out = chain(out, compile_node(test)?);
    let choice_idx = out.len();
    let then_offset = body_start as i64 - choice_idx as i64;
    out.push(FsmNode::new(NodeKind::Choice { then: then_offset, else_: 1 }));
    out.push(FsmNode::new(NodeKind::Pass));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(name: &str) -> Composition {
        Composition::new("action").with_arg("name", Arg::String(name.to_string()))
    }

    #[test]
    fn sequence_compiles_well_formed() {
        let tree = Composition::new("sequence").with_components(vec![action("/_/a"), action("/_/b")]);
        let fsm = compile(&tree).unwrap();
        assert!(fsm.is_well_formed());
    }

    #[test]
    fn try_catch_is_well_formed_and_reachable() {
        let tree = Composition::new("try").with_arg("body", action("/_/a")).with_arg("handler", action("/_/h"));
        let fsm = compile(&tree).unwrap();
        assert!(fsm.is_well_formed());
        let catch = fsm.states.iter().find_map(|s| if let NodeKind::Try { catch } = s.kind { Some(catch) } else { None }).unwrap();
        assert!(catch > 0 && (catch as usize) < fsm.len());
    }

    #[test]
    fn if_nosave_well_formed() {
        let tree = Composition::new("if_nosave").with_arg("test", action("/_/t")).with_arg("consequent", action("/_/c")).with_arg("alternate", action("/_/a"));
        let fsm = compile(&tree).unwrap();
        assert!(fsm.is_well_formed());
    }

    #[test]
    fn while_nosave_well_formed() {
        let tree = Composition::new("while_nosave").with_arg("test", action("/_/t")).with_arg("body", action("/_/b"));
        let fsm = compile(&tree).unwrap();
        assert!(fsm.is_well_formed());
    }

    #[test]
    fn dowhile_nosave_well_formed() {
        let tree = Composition::new("dowhile_nosave").with_arg("body", action("/_/b")).with_arg("test", action("/_/t"));
        let fsm = compile(&tree).unwrap();
        assert!(fsm.is_well_formed());
    }

    #[test]
    fn let_balances_with_exit() {
        let mut decls = serde_json::Map::new();
        decls.insert("x".to_string(), serde_json::json!(1));
        let tree = Composition::new("let").with_arg("declarations", Arg::Object(decls)).with_components(vec![action("/_/a")]);
        let fsm = compile(&tree).unwrap();
        assert!(matches!(fsm.states.first().unwrap().kind, NodeKind::Let { .. }));
        assert!(matches!(fsm.states.last().unwrap().kind, NodeKind::Exit));
        assert!(fsm.is_well_formed());
    }
}
