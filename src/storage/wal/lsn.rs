use serde::{Deserialize, Serialize};
use std::fmt;

/// Log Sequence Number: the segment a record lives in and the byte offset of
/// the record within that segment. Ordered lexicographically, so append order
/// and LSN order coincide.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Lsn {
    segment: u64,
    position: u64,
}

impl Lsn {
    /// Precedes every real record.
    pub const NULL: Lsn = Lsn {
        segment: 0,
        position: 0,
    };

    pub const fn new(segment: u64, position: u64) -> Self {
        Self { segment, position }
    }

    pub fn segment(&self) -> u64 {
        self.segment
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn is_null(&self) -> bool {
        *self == Lsn::NULL
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({}:{})", self.segment, self.position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordering() {
        assert!(Lsn::NULL < Lsn::new(1, 0));
        assert!(Lsn::new(1, 900) < Lsn::new(2, 24));
        assert!(Lsn::new(2, 24) < Lsn::new(2, 25));
        assert_eq!(Lsn::default(), Lsn::NULL);
        assert!(Lsn::NULL.is_null());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Lsn::new(3, 128)), "LSN(3:128)");
    }
}
