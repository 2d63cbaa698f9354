//! Action name grammar and the host-facing conductor contract.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::conductor::Frame;
use crate::error::ConductError;

/// A fully-qualified action name is always rendered `/ns/pkg/action` or
/// `/ns/action`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionNameError(pub String);

impl fmt::Display for ActionNameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ActionNameError {}

/// Parses and normalizes an action name per the qualified/unqualified
/// grammar, returning the canonical `/ns[/pkg]/action` form.
pub fn parse_action_name(name: &str) -> Result<String, ActionNameError> {
    if name.starts_with('/') {
        let rest = &name[1..];
        let segments: Vec<&str> = rest.split('/').collect();
        if segments.len() != 2 && segments.len() != 3 {
            return Err(ActionNameError(format!("qualified action name `{name}` must have 2 or 3 segments after the leading `/`")));
        }
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(ActionNameError(format!("action name `{name}` has an empty segment")));
        }
        Ok(format!("/{}", segments.join("/")))
    } else {
        let segments: Vec<&str> = name.split('/').collect();
        if segments.len() != 1 && segments.len() != 2 {
            return Err(ActionNameError(format!("unqualified action name `{name}` must have 1 or 2 segments")));
        }
        if segments.iter().any(|s| s.trim().is_empty()) {
            return Err(ActionNameError(format!("action name `{name}` has an empty segment")));
        }
        Ok(format!("/_/{}", segments.join("/")))
    }
}

/// The serialized continuation a suspended conductor invocation hands back
/// to the host so it can be resumed later via `$resume`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resume {
    pub state: Option<usize>,
    pub stack: Vec<Frame>,
}

/// The host↔conductor contract: either the composition has terminated, or it
/// needs the host to invoke an action and resume the conductor with the
/// result spliced into `params`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Outcome {
    /// Terminal success.
    Done { params: Value },
    /// Terminal failure; `code` is set only for protocol/invariant-class
    /// errors, never for ordinary in-composition errors.
    Error { error: Value, #[serde(skip_serializing_if = "Option::is_none")] code: Option<u16> },
    /// Suspended on a synchronous action invocation.
    Continuation { action: String, params: Value, state: ContinuationState },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContinuationState {
    #[serde(rename = "$resume")]
    pub resume: Resume,
}

impl Outcome {
    /// Maps a conductor-level failure to the host-facing shape: protocol
    /// errors (malformed resume input) get a 400, everything else (a
    /// violated runtime invariant) gets a 500. Ordinary in-composition
    /// errors never reach here — they're materialized into `params` and
    /// handled by the FSM's own try/catch machinery, terminating as
    /// `Outcome::Done` or a `params.error`-bearing `Outcome::Error` with no
    /// code.
    pub fn from_conduct_error(err: ConductError) -> Self {
        let code = if err.is_protocol() { 400 } else { 500 };
        Outcome::Error { error: Value::String(err.to_string()), code: Some(code) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unqualified_single_segment() {
        assert_eq!(parse_action_name("foo").unwrap(), "/_/foo");
    }

    #[test]
    fn unqualified_two_segments() {
        assert_eq!(parse_action_name("pkg/foo").unwrap(), "/_/pkg/foo");
    }

    #[test]
    fn qualified_two_segments() {
        assert_eq!(parse_action_name("/ns/foo").unwrap(), "/ns/foo");
    }

    #[test]
    fn qualified_three_segments() {
        assert_eq!(parse_action_name("/ns/pkg/foo").unwrap(), "/ns/pkg/foo");
    }

    #[test]
    fn qualified_one_segment_invalid() {
        assert!(parse_action_name("/foo").is_err());
    }

    #[test]
    fn unqualified_four_segments_invalid() {
        assert!(parse_action_name("a/b/c/d").is_err());
    }

    #[test]
    fn empty_segment_invalid() {
        assert!(parse_action_name("/ns//foo").is_err());
        assert!(parse_action_name("pkg/").is_err());
    }

    #[test]
    fn malformed_resume_maps_to_400() {
        let outcome = Outcome::from_conduct_error(ConductError::MalformedResume("bad".to_string()));
        assert_eq!(outcome, Outcome::Error { error: Value::String(ConductError::MalformedResume("bad".to_string()).to_string()), code: Some(400) });
    }

    #[test]
    fn empty_stack_pop_maps_to_500() {
        let outcome = Outcome::from_conduct_error(ConductError::EmptyStackPop);
        match outcome {
            Outcome::Error { code, .. } => assert_eq!(code, Some(500)),
            other => panic!("expected error, got {other:?}"),
        }
    }
}
