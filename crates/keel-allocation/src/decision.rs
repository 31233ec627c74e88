//! Placement decisions.
//!
//! Every decider answers with a [`Decision`], never an error: `No` and
//! `Throttle` are ordinary outcomes an operator can inspect. Decisions are
//! serializable so the explain API can hand them out as structured data.

use serde::{Deserialize, Serialize};

/// The verdict of a decision, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionKind {
    /// The placement is allowed.
    Yes,
    /// The placement is allowed but must wait; retried next pass.
    Throttle,
    /// The placement is forbidden.
    No,
}

/// A single decider's verdict, or the combination of several.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Decision {
    /// One decider's verdict.
    Single {
        /// The verdict.
        kind: DecisionKind,
        /// Stable tag of the decider that produced it.
        decider: Option<String>,
        /// Human-readable rationale.
        explanation: Option<String>,
    },
    /// Verdicts from several deciders; the aggregate kind is the worst child.
    Multi {
        /// Child decisions in decider registration order.
        decisions: Vec<Decision>,
    },
}

impl Decision {
    /// An unconditional yes with no rationale.
    pub const YES: Decision = Decision::Single { kind: DecisionKind::Yes, decider: None, explanation: None };
    /// An unconditional throttle with no rationale.
    pub const THROTTLE: Decision =
        Decision::Single { kind: DecisionKind::Throttle, decider: None, explanation: None };
    /// An unconditional no with no rationale.
    pub const NO: Decision = Decision::Single { kind: DecisionKind::No, decider: None, explanation: None };

    /// A yes from a named decider.
    #[must_use]
    pub fn yes(decider: &'static str, explanation: impl Into<String>) -> Self {
        Self::Single {
            kind: DecisionKind::Yes,
            decider: Some(decider.to_string()),
            explanation: Some(explanation.into()),
        }
    }

    /// A throttle from a named decider.
    #[must_use]
    pub fn throttle(decider: &'static str, explanation: impl Into<String>) -> Self {
        Self::Single {
            kind: DecisionKind::Throttle,
            decider: Some(decider.to_string()),
            explanation: Some(explanation.into()),
        }
    }

    /// A no from a named decider.
    #[must_use]
    pub fn no(decider: &'static str, explanation: impl Into<String>) -> Self {
        Self::Single {
            kind: DecisionKind::No,
            decider: Some(decider.to_string()),
            explanation: Some(explanation.into()),
        }
    }

    /// The aggregate verdict.
    #[must_use]
    pub fn kind(&self) -> DecisionKind {
        match self {
            Self::Single { kind, .. } => *kind,
            Self::Multi { decisions } => decisions
                .iter()
                .map(Decision::kind)
                .max()
                .unwrap_or(DecisionKind::Yes),
        }
    }

    /// True if the verdict is yes.
    #[must_use]
    pub fn is_yes(&self) -> bool {
        self.kind() == DecisionKind::Yes
    }

    /// True if the verdict is throttle.
    #[must_use]
    pub fn is_throttle(&self) -> bool {
        self.kind() == DecisionKind::Throttle
    }

    /// True if the verdict is no.
    #[must_use]
    pub fn is_no(&self) -> bool {
        self.kind() == DecisionKind::No
    }

    /// The rationale of the decisive (worst) verdict, if recorded.
    #[must_use]
    pub fn explanation(&self) -> Option<&str> {
        match self {
            Self::Single { explanation, .. } => explanation.as_deref(),
            Self::Multi { decisions } => {
                let worst = self.kind();
                decisions
                    .iter()
                    .find(|d| d.kind() == worst)
                    .and_then(Decision::explanation)
            }
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Single { kind, decider, explanation } => {
                write!(f, "{kind:?}")?;
                if let Some(decider) = decider {
                    write!(f, "({decider})")?;
                }
                if let Some(explanation) = explanation {
                    write!(f, ": {explanation}")?;
                }
                Ok(())
            }
            Self::Multi { decisions } => {
                write!(f, "{:?}[", self.kind())?;
                for (i, d) in decisions.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{d}")?;
                }
                write!(f, "]")
            }
        }
    }
}
