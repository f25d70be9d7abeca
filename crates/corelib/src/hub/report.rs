//! Results of aggregate hub operations.

use std::fmt;

use crate::error::Error;

/// A message taken from one connection by an aggregate `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerMessage {
    /// Name of the connection it came from.
    pub peer: String,
    pub data: String,
}

/// One connection's failure during a fan-out write.
#[derive(Debug)]
pub struct WriteFailure {
    pub peer: String,
    pub error: Error,
}

impl fmt::Display for WriteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.peer, self.error)
    }
}

/// Outcome of a fan-out write.
///
/// Both lists are in registration order. A failure on one connection never
/// prevents delivery to the others.
#[derive(Debug, Default)]
pub struct WriteReport {
    pub delivered: Vec<String>,
    pub failures: Vec<WriteFailure>,
}

impl WriteReport {
    /// True if every targeted connection accepted the frame.
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Number of connections the write was attempted on.
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failures.len()
    }

    pub fn failed_peers(&self) -> impl Iterator<Item = &str> {
        self.failures.iter().map(|failure| failure.peer.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_report_is_complete() {
        let report = WriteReport::default();
        assert!(report.is_complete());
        assert_eq!(report.attempted(), 0);
    }

    #[test]
    fn failures_are_attributed() {
        let report = WriteReport {
            delivered: vec!["a".into()],
            failures: vec![WriteFailure {
                peer: "b".into(),
                error: Error::FrameTooLarge { size: 9, max: 8 },
            }],
        };
        assert!(!report.is_complete());
        assert_eq!(report.attempted(), 2);
        assert_eq!(report.failed_peers().collect::<Vec<_>>(), ["b"]);
        assert!(report.failures[0].to_string().starts_with("b: frame too large"));
    }
}
