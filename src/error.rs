//! Error types for flightrec.
//!
//! Failures in this crate are deliberately quiet: the tracking machinery
//! must never take down the process it is instrumenting. Most operations
//! therefore report through predicates and return values, and the types
//! here cover the two places where a caller genuinely needs a reason:
//! opening a persistent arena and taking a snapshot.

use core::fmt;

/// Error opening or mapping a persistent arena.
#[derive(Debug)]
pub enum ArenaError {
    /// The backing file could not be created, sized, or mapped.
    Io(std::io::Error),
    /// The requested arena size cannot be addressed by 32-bit references.
    TooLarge {
        /// The size that was requested.
        size: usize,
    },
    /// An existing region carried an unrecognized or inconsistent header.
    Corrupt,
}

impl fmt::Display for ArenaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "arena backing i/o error: {err}"),
            Self::TooLarge { size } => {
                write!(f, "arena size {size} exceeds 32-bit reference range")
            }
            Self::Corrupt => write!(f, "arena header is corrupt or from a foreign format"),
        }
    }
}

impl std::error::Error for ArenaError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ArenaError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Error taking a snapshot of a tracker region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    /// The region failed header validation, before or after the copy.
    /// Either it was never initialized, it was zeroed by a recycling
    /// registry, or the writer died mid-update.
    InvalidRegion,
    /// The writer kept mutating the stack through every retry attempt.
    /// The caller may simply try again later.
    Inconsistent,
}

impl fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRegion => write!(f, "tracker region is not valid"),
            Self::Inconsistent => {
                write!(f, "stack changed on every snapshot attempt")
            }
        }
    }
}

impl std::error::Error for SnapshotError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_error_display() {
        let err = ArenaError::TooLarge { size: 1 << 40 };
        assert!(err.to_string().contains("32-bit"));
        assert!(ArenaError::Corrupt.to_string().contains("corrupt"));
    }

    #[test]
    fn arena_error_io_source() {
        let err = ArenaError::from(std::io::Error::other("boom"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn snapshot_error_display() {
        assert!(SnapshotError::InvalidRegion.to_string().contains("not valid"));
        assert!(SnapshotError::Inconsistent.to_string().contains("attempt"));
    }
}
