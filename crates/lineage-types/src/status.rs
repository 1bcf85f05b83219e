use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Lifecycle status of an execution line.
///
/// ```text
/// ACTIVE   -> PAUSED, COMPLETED, FAILED, ARCHIVED
/// PAUSED   -> ACTIVE, COMPLETED, FAILED, ARCHIVED
/// COMPLETED, FAILED, ARCHIVED, MERGED -> (terminal)
/// ```
///
/// Branch lines may additionally move from `Active` or `Paused` to `Merged`,
/// but only through a merge commit; see [`LineStatus::can_merge`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Archived,
    Merged,
}

impl LineStatus {
    pub const ALL: [LineStatus; 6] = [
        Self::Active,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Archived,
        Self::Merged,
    ];

    /// Returns `true` if no further transitions are possible.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Archived | Self::Merged
        )
    }

    /// Whether a line in this status may be forked.
    pub fn is_forkable(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    /// Whether a line in this status may receive a merge.
    pub fn accepts_merge(&self) -> bool {
        matches!(self, Self::Active | Self::Paused)
    }

    /// Whether an ordinary status transition `self -> next` is legal.
    ///
    /// `Merged` is never reachable through this path.
    pub fn can_transition_to(&self, next: LineStatus) -> bool {
        use LineStatus::*;
        matches!(
            (self, next),
            (Active, Paused | Completed | Failed | Archived)
                | (Paused, Active | Completed | Failed | Archived)
        )
    }

    /// Whether a line in this status may be marked `Merged` by a merge commit.
    pub fn can_merge(&self, is_branch: bool) -> bool {
        is_branch && matches!(self, Self::Active | Self::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Archived => "archived",
            Self::Merged => "merged",
        }
    }
}

impl fmt::Display for LineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LineStatus {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == lowered)
            .ok_or_else(|| TypeError::UnknownStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LineStatus::*;

    #[test]
    fn active_and_paused_are_open() {
        for status in [Active, Paused] {
            assert!(!status.is_terminal());
            assert!(status.is_forkable());
            assert!(status.accepts_merge());
        }
    }

    #[test]
    fn terminal_statuses_have_no_exits() {
        for from in [Completed, Failed, Archived, Merged] {
            assert!(from.is_terminal());
            assert!(!from.is_forkable());
            for to in LineStatus::ALL {
                assert!(!from.can_transition_to(to), "{from} -> {to}");
            }
            assert!(!from.can_merge(true));
        }
    }

    #[test]
    fn legal_transitions() {
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Paused.can_transition_to(Archived));
        assert!(Active.can_transition_to(Failed));
    }

    #[test]
    fn self_transitions_and_merged_rejected() {
        assert!(!Active.can_transition_to(Active));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Active.can_transition_to(Merged));
        assert!(!Paused.can_transition_to(Merged));
    }

    #[test]
    fn merged_only_for_branches() {
        assert!(Active.can_merge(true));
        assert!(Paused.can_merge(true));
        assert!(!Active.can_merge(false));
    }

    #[test]
    fn parse_and_display() {
        for status in LineStatus::ALL {
            assert_eq!(status.to_string().parse::<LineStatus>().unwrap(), status);
        }
        assert_eq!("ACTIVE".parse::<LineStatus>().unwrap(), Active);
        assert!("running".parse::<LineStatus>().is_err());
        assert_eq!(serde_json::to_string(&Merged).unwrap(), "\"merged\"");
    }

    proptest::proptest! {
        #[test]
        fn walks_stop_at_first_terminal(steps in proptest::collection::vec(0usize..6, 0..24)) {
            let mut current = Active;
            let mut terminal_seen = false;
            for step in steps {
                let next = LineStatus::ALL[step];
                if current.can_transition_to(next) {
                    proptest::prop_assert!(!terminal_seen);
                    proptest::prop_assert_ne!(next, Merged);
                    current = next;
                }
                terminal_seen |= current.is_terminal();
            }
        }
    }
}
