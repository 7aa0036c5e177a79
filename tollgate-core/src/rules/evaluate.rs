//! Rule evaluation.
//!
//! Rulesets are layered purely by argument order: the lists are treated as
//! one concatenation and scanned from the end, so the last matching rule wins
//! and a list passed later always outranks one passed earlier.

use serde_json::{Map, Value};

use super::rule::{Action, PermissionRule, Ruleset, IMPLICIT_ASK};

/// Tools that share the single `edit` permission.
pub const EDIT_TOOLS: &[&str] = &["edit", "write", "patch", "multiedit"];

/// Map a tool name onto the permission it is governed by.
pub fn effective_permission(tool: &str) -> &str {
    if EDIT_TOOLS.contains(&tool) {
        "edit"
    } else {
        tool
    }
}

/// Find the rule governing `permission` on `target`.
///
/// Returns the implicit `Ask` rule when nothing matches.
///
/// # Example
///
/// ```rust
/// use tollgate_core::rules::{evaluate, Action, Ruleset};
///
/// let base = Ruleset::from_entries([("*", "*", Action::Allow)]).unwrap();
/// let mode = Ruleset::from_entries([("read", "*.env", Action::Ask)]).unwrap();
///
/// assert_eq!(evaluate("read", "x.py", &[&base, &mode]).action(), Action::Allow);
/// assert_eq!(evaluate("read", "secrets.env", &[&base, &mode]).action(), Action::Ask);
/// ```
pub fn evaluate<'a>(permission: &str, target: &str, rulesets: &[&'a Ruleset]) -> &'a PermissionRule {
    evaluate_with_args(permission, target, None, rulesets)
}

/// Like [`evaluate`], also checking rules that carry an argument condition.
pub fn evaluate_with_args<'a>(
    permission: &str,
    target: &str,
    arguments: Option<&Map<String, Value>>,
    rulesets: &[&'a Ruleset],
) -> &'a PermissionRule {
    rulesets
        .iter()
        .rev()
        .flat_map(|set| set.iter().rev())
        .find(|rule| rule.matches(permission, target, arguments))
        .unwrap_or(&IMPLICIT_ASK)
}

/// Tools that are unconditionally denied and can be hidden up front.
///
/// A tool is disabled only when the last rule matching its effective
/// permission targets `*` with [`Action::Deny`].
pub fn get_disabled_tools<S: AsRef<str>>(tools: &[S], ruleset: &Ruleset) -> Vec<String> {
    tools
        .iter()
        .map(AsRef::as_ref)
        .filter(|tool| {
            let permission = effective_permission(tool);
            ruleset
                .iter()
                .rev()
                .find(|rule| rule.matches_permission(permission))
                .is_some_and(|rule| rule.pattern() == "*" && rule.action() == Action::Deny)
        })
        .map(str::to_string)
        .collect()
}
