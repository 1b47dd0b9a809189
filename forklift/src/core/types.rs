//! Shared deterministic types for forklift core logic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A git author/committer identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <{}>", self.name, self.email)
    }
}

/// Fetch URLs of the two remotes a fork needs, captured before stripping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteUrls {
    pub origin: String,
    pub upstream: String,
}

/// Classification of a workspace after the sandbox exits.
///
/// Exactly one verdict is produced per completed sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// The agent left a stuck marker and needs a human.
    Stuck,
    /// Upstream is fully reachable from the local main branch.
    Verified,
    /// The agent exited without integrating upstream.
    Unverified,
}

/// Combine the two verifier observations into a verdict.
///
/// The stuck marker takes precedence over history state.
pub fn classify_verdict(stuck_marker_present: bool, upstream_integrated: bool) -> Verdict {
    if stuck_marker_present {
        Verdict::Stuck
    } else if upstream_integrated {
        Verdict::Verified
    } else {
        Verdict::Unverified
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stuck_marker_wins_over_integration() {
        assert_eq!(classify_verdict(true, true), Verdict::Stuck);
        assert_eq!(classify_verdict(true, false), Verdict::Stuck);
    }

    #[test]
    fn integration_decides_without_marker() {
        assert_eq!(classify_verdict(false, true), Verdict::Verified);
        assert_eq!(classify_verdict(false, false), Verdict::Unverified);
    }

    #[test]
    fn identity_displays_as_git_author() {
        let id = Identity::new("Ada Lovelace", "ada@example.com");
        assert_eq!(id.to_string(), "Ada Lovelace <ada@example.com>");
    }
}
