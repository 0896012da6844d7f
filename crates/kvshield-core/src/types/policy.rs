//! Store failure policy

/// What to do when the key-value store itself fails.
///
/// Chosen explicitly at each integration point; components never pick one
/// silently on the caller's behalf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePolicy {
    /// Degrade and continue: log the store error and bypass the store
    FailOpen,
    /// Reject: propagate the store error to the caller
    FailClosed,
}

impl FailurePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailurePolicy::FailOpen => "fail_open",
            FailurePolicy::FailClosed => "fail_closed",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, FailurePolicy::FailOpen)
    }
}
