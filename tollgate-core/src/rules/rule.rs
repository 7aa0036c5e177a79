//! Permission rule types.
//!
//! A rule pairs a permission glob and a target glob with an [`Action`].
//! Patterns are compiled once when the rule is constructed, so evaluation
//! never re-parses a glob.

use glob::Pattern;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Outcome a rule assigns to a matching permission/target pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Proceed without asking.
    Allow,
    /// Refuse immediately.
    Deny,
    /// Suspend and wait for a human decision.
    Ask,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Allow => write!(f, "allow"),
            Action::Deny => write!(f, "deny"),
            Action::Ask => write!(f, "ask"),
        }
    }
}

impl FromStr for Action {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "allow" => Ok(Action::Allow),
            "deny" => Ok(Action::Deny),
            "ask" => Ok(Action::Ask),
            other => Err(RuleError::UnknownAction(other.to_string())),
        }
    }
}

/// Errors raised while constructing rules.
#[derive(Debug, thiserror::Error)]
pub enum RuleError {
    /// A permission, target or argument glob failed to compile.
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// The offending pattern text.
        pattern: String,
        /// Underlying glob error.
        #[source]
        source: glob::PatternError,
    },

    /// An argument matcher was not in `key:pattern` form.
    #[error("Invalid argument matcher '{0}': expected 'key:pattern'")]
    InvalidArgument(String),

    /// Action text was not one of allow/deny/ask.
    #[error("Unknown action '{0}'")]
    UnknownAction(String),

    /// Mode text was not one of build/plan/explore.
    #[error("Unknown mode '{0}'")]
    UnknownMode(String),
}

/// A compiled glob.
///
/// `*` matches any run of characters (including `/`), `?` matches exactly one.
/// Patterns without metacharacters compare literally.
#[derive(Debug, Clone)]
pub(crate) enum Glob {
    Any,
    Literal(String),
    Compiled { raw: String, compiled: Pattern },
}

impl Glob {
    pub(crate) fn new(raw: &str) -> Result<Self, RuleError> {
        if raw == "*" {
            return Ok(Glob::Any);
        }
        if !raw.contains(['*', '?', '[']) {
            return Ok(Glob::Literal(raw.to_string()));
        }
        let compiled = Pattern::new(raw).map_err(|source| RuleError::InvalidPattern {
            pattern: raw.to_string(),
            source,
        })?;
        Ok(Glob::Compiled {
            raw: raw.to_string(),
            compiled,
        })
    }

    pub(crate) fn matches(&self, candidate: &str) -> bool {
        match self {
            Glob::Any => true,
            Glob::Literal(s) => s == candidate,
            Glob::Compiled { compiled, .. } => compiled.matches(candidate),
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        match self {
            Glob::Any => "*",
            Glob::Literal(s) => s,
            Glob::Compiled { raw, .. } => raw,
        }
    }
}

/// Structured-argument condition in `key:pattern` form.
#[derive(Debug, Clone)]
pub(crate) struct ArgumentMatcher {
    raw: String,
    key: String,
    pattern: Glob,
}

impl ArgumentMatcher {
    fn parse(raw: &str) -> Result<Self, RuleError> {
        let (key, pattern) = raw
            .split_once(':')
            .ok_or_else(|| RuleError::InvalidArgument(raw.to_string()))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(RuleError::InvalidArgument(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            key: key.to_string(),
            pattern: Glob::new(pattern)?,
        })
    }

    /// No arguments at all satisfies the matcher; a missing key does not.
    fn matches(&self, arguments: Option<&Map<String, Value>>) -> bool {
        let Some(arguments) = arguments else {
            return true;
        };
        match arguments.get(&self.key) {
            None => false,
            Some(Value::String(s)) => self.pattern.matches(s),
            Some(other) => self.pattern.matches(&other.to_string()),
        }
    }
}

/// A single permission rule.
///
/// Immutable once constructed. Within a [`Ruleset`], later rules take
/// precedence over earlier ones.
///
/// # Example
///
/// ```rust
/// use tollgate_core::rules::{Action, PermissionRule};
///
/// let rule = PermissionRule::new("read", "*.env", Action::Ask).unwrap();
/// assert!(rule.matches("read", "secrets.env", None));
/// assert!(!rule.matches("read", "main.rs", None));
///
/// let scoped = PermissionRule::new("bash", "*", Action::Allow)
///     .unwrap()
///     .with_argument("cwd:/workspace/*")
///     .unwrap();
/// assert_eq!(scoped.argument(), Some("cwd:/workspace/*"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RuleSpec", into = "RuleSpec")]
pub struct PermissionRule {
    permission: Glob,
    pattern: Glob,
    action: Action,
    scope: Option<String>,
    argument: Option<ArgumentMatcher>,
}

/// Rule whose action applies when nothing else matches.
pub(crate) static IMPLICIT_ASK: PermissionRule = PermissionRule {
    permission: Glob::Any,
    pattern: Glob::Any,
    action: Action::Ask,
    scope: None,
    argument: None,
};

impl PermissionRule {
    /// Create a rule, compiling both globs.
    pub fn new(permission: &str, pattern: &str, action: Action) -> Result<Self, RuleError> {
        Ok(Self {
            permission: Glob::new(permission)?,
            pattern: Glob::new(pattern)?,
            action,
            scope: None,
            argument: None,
        })
    }

    /// Attach a free-form scope tag.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Attach a structured-argument condition in `key:pattern` form.
    pub fn with_argument(mut self, matcher: &str) -> Result<Self, RuleError> {
        self.argument = Some(ArgumentMatcher::parse(matcher)?);
        Ok(self)
    }

    /// Permission glob as written.
    pub fn permission(&self) -> &str {
        self.permission.as_str()
    }

    /// Target glob as written.
    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    /// The rule's action.
    pub fn action(&self) -> Action {
        self.action
    }

    /// Optional scope tag.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    /// Argument matcher as written, if any.
    pub fn argument(&self) -> Option<&str> {
        self.argument.as_ref().map(|a| a.raw.as_str())
    }

    /// Check whether this rule applies to a permission/target pair.
    pub fn matches(
        &self,
        permission: &str,
        target: &str,
        arguments: Option<&Map<String, Value>>,
    ) -> bool {
        self.permission.matches(permission)
            && self.pattern.matches(target)
            && self
                .argument
                .as_ref()
                .map_or(true, |matcher| matcher.matches(arguments))
    }

    /// Check only the permission glob.
    pub(crate) fn matches_permission(&self, permission: &str) -> bool {
        self.permission.matches(permission)
    }
}

impl PartialEq for PermissionRule {
    fn eq(&self, other: &Self) -> bool {
        self.permission() == other.permission()
            && self.pattern() == other.pattern()
            && self.action == other.action
            && self.scope == other.scope
            && self.argument() == other.argument()
    }
}

impl Eq for PermissionRule {}

impl fmt::Display for PermissionRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} -> {}", self.permission(), self.pattern(), self.action)?;
        if let Some(arg) = self.argument() {
            write!(f, " [{}]", arg)?;
        }
        Ok(())
    }
}

/// Serialized form of a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleSpec {
    permission: String,
    pattern: String,
    action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    argument: Option<String>,
}

impl TryFrom<RuleSpec> for PermissionRule {
    type Error = RuleError;

    fn try_from(spec: RuleSpec) -> Result<Self, Self::Error> {
        let mut rule = PermissionRule::new(&spec.permission, &spec.pattern, spec.action)?;
        rule.scope = spec.scope;
        if let Some(arg) = spec.argument {
            rule = rule.with_argument(&arg)?;
        }
        Ok(rule)
    }
}

impl From<PermissionRule> for RuleSpec {
    fn from(rule: PermissionRule) -> Self {
        Self {
            permission: rule.permission().to_string(),
            pattern: rule.pattern().to_string(),
            action: rule.action,
            argument: rule.argument().map(str::to_string),
            scope: rule.scope,
        }
    }
}

/// An ordered list of rules. Later entries outrank earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ruleset(Vec<PermissionRule>);

impl Ruleset {
    /// Create an empty ruleset.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Build a ruleset from `(permission, pattern, action)` entries.
    pub fn from_entries<I, P, T>(entries: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = (P, T, Action)>,
        P: AsRef<str>,
        T: AsRef<str>,
    {
        entries
            .into_iter()
            .map(|(p, t, a)| PermissionRule::new(p.as_ref(), t.as_ref(), a))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    /// Built-in rules. Entries are static and known to compile.
    pub(crate) fn canned(entries: &[(&str, &str, Action)]) -> Self {
        entries
            .iter()
            .filter_map(|(p, t, a)| match PermissionRule::new(p, t, *a) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    log::error!("Skipping invalid built-in rule: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Default base layer: allow everything except a few sensitive actions.
    pub fn default_base() -> Self {
        Self::canned(&[
            ("*", "*", Action::Allow),
            ("doom_loop", "*", Action::Ask),
            ("external_directory", "*", Action::Ask),
            ("read", "*.env", Action::Ask),
            ("read", "*.env.*", Action::Ask),
            ("read", "*.env.example", Action::Allow),
        ])
    }

    /// Append a rule; it outranks everything already present.
    pub fn push(&mut self, rule: PermissionRule) {
        self.0.push(rule);
    }

    /// Iterate rules in precedence order (lowest first).
    pub fn iter(&self) -> std::slice::Iter<'_, PermissionRule> {
        self.0.iter()
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when there are no rules.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the rules as a slice.
    pub fn rules(&self) -> &[PermissionRule] {
        &self.0
    }
}

impl From<Vec<PermissionRule>> for Ruleset {
    fn from(rules: Vec<PermissionRule>) -> Self {
        Self(rules)
    }
}

impl FromIterator<PermissionRule> for Ruleset {
    fn from_iter<I: IntoIterator<Item = PermissionRule>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Extend<PermissionRule> for Ruleset {
    fn extend<I: IntoIterator<Item = PermissionRule>>(&mut self, iter: I) {
        self.0.extend(iter);
    }
}

impl<'a> IntoIterator for &'a Ruleset {
    type Item = &'a PermissionRule;
    type IntoIter = std::slice::Iter<'a, PermissionRule>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
