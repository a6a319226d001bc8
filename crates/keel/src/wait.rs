//! Wait-option selection for potentially blocking operations.

use std::fmt;

/// How long an operation may suspend the calling thread.
///
/// `Ticks(0)` is equivalent to [`WaitOption::NoWait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOption {
    /// Return immediately with `WouldBlock`/`NoEvents` if unavailable.
    NoWait,
    /// Suspend for at most this many kernel ticks, then `Timeout`.
    Ticks(u32),
    /// Suspend until the object delivers, is deleted, or the wait is aborted.
    Forever,
}

impl WaitOption {
    /// Whether this option permits suspending the caller at all.
    pub(crate) fn blocks(self) -> bool {
        !matches!(self, WaitOption::NoWait | WaitOption::Ticks(0))
    }
}

impl fmt::Display for WaitOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitOption::NoWait => f.write_str("NoWait"),
            WaitOption::Ticks(n) => write!(f, "Ticks({n})"),
            WaitOption::Forever => f.write_str("Forever"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_ticks_is_no_wait() {
        assert!(!WaitOption::NoWait.blocks());
        assert!(!WaitOption::Ticks(0).blocks());
        assert!(WaitOption::Ticks(1).blocks());
        assert!(WaitOption::Forever.blocks());
    }

    #[test]
    fn display_matches_log_lines() {
        assert_eq!(WaitOption::NoWait.to_string(), "NoWait");
        assert_eq!(WaitOption::Ticks(25).to_string(), "Ticks(25)");
        assert_eq!(WaitOption::Forever.to_string(), "Forever");
    }
}
