//! Agent modes and their canned rule layers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::rule::{Action, RuleError, Ruleset};

/// Operating mode of an agent. Each mode installs its own rule layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Full access; the mode layer is empty.
    #[default]
    Build,
    /// Read-only planning.
    Plan,
    /// Read-only, non-interactive sub-agent. Never triggers an ask.
    Explore,
}

/// Permissions that reach a human.
pub const INTERACTION_PERMISSIONS: &[&str] = &["clarification", "decision", "env_var", "question"];

impl Mode {
    /// The rule layer this mode installs.
    pub fn ruleset(&self) -> Ruleset {
        match self {
            Mode::Build => Ruleset::new(),
            Mode::Plan => Ruleset::canned(&[
                ("edit", "*", Action::Deny),
                ("bash", "*", Action::Ask),
            ]),
            Mode::Explore => {
                let mut rules = Ruleset::canned(&[
                    ("edit", "*", Action::Deny),
                    ("bash", "*", Action::Deny),
                    ("plan_edit", "*", Action::Deny),
                    ("plan_exit", "*", Action::Deny),
                    ("doom_loop", "*", Action::Deny),
                    ("external_directory", "*", Action::Deny),
                    ("read", "*.env", Action::Deny),
                    ("read", "*.env.*", Action::Deny),
                    ("read", "*.env.example", Action::Allow),
                ]);
                let interactions: Vec<_> = INTERACTION_PERMISSIONS
                    .iter()
                    .map(|p| (*p, "*", Action::Deny))
                    .collect();
                rules.extend(Ruleset::canned(&interactions).rules().iter().cloned());
                rules
            }
        }
    }

    /// Mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Build => "build",
            Mode::Plan => "plan",
            Mode::Explore => "explore",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = RuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "build" => Ok(Mode::Build),
            "plan" => Ok(Mode::Plan),
            "explore" => Ok(Mode::Explore),
            other => Err(RuleError::UnknownMode(other.to_string())),
        }
    }
}
