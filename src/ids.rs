//! Identifiers used throughout the consensus engine: view numbers,
//! pre-prepare sequence numbers, the 3PC key pair, and instance ids.
//!
//! Modeled on the teacher's `ordering::SeqNo`, split into two distinct
//! types (`ViewNo`, `PpSeqNo`) since the spec never conflates them.

use std::cmp::Ordering;
use std::fmt;

#[cfg(feature = "serialize_serde")]
use serde::{Deserialize, Serialize};

macro_rules! seqno_type {
    ($name:ident) => {
        #[derive(Debug, Copy, Clone, Ord, Eq, PartialEq, Hash)]
        #[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
        pub struct $name(u64);

        impl $name {
            pub const ZERO: $name = $name(0);

            #[inline]
            pub fn next(self) -> $name {
                $name(self.0.wrapping_add(1))
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(n: u64) -> $name {
                $name(n)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(n: $name) -> u64 {
                n.0
            }
        }

        impl PartialOrd for $name {
            fn partial_cmp(&self, other: &$name) -> Option<Ordering> {
                Some(self.0.cmp(&other.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

seqno_type!(ViewNo);
seqno_type!(PpSeqNo);

impl PpSeqNo {
    /// `PpSeqNo` is 1-indexed per the data model (`PpSeqNo ∈ ℕ₁`); this
    /// is the first legal value in any watermark window.
    pub const FIRST: PpSeqNo = PpSeqNo(1);
}

/// The `(ViewNo, PpSeqNo)` pair that uniquely identifies a 3PC round.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct ThreePcKey(pub ViewNo, pub PpSeqNo);

impl ThreePcKey {
    pub fn new(view_no: ViewNo, pp_seq_no: PpSeqNo) -> Self {
        Self(view_no, pp_seq_no)
    }

    pub fn view_no(&self) -> ViewNo {
        self.0
    }

    pub fn pp_seq_no(&self) -> PpSeqNo {
        self.1
    }
}

impl fmt::Display for ThreePcKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.0, self.1)
    }
}

/// The id of a protocol instance within `[0, R)`, where `R = f + 1`.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
#[repr(transparent)]
pub struct InstId(u32);

impl InstId {
    /// Instance 0 is always the master.
    pub const MASTER: InstId = InstId(0);

    pub fn is_master(self) -> bool {
        self.0 == 0
    }
}

impl From<u32> for InstId {
    #[inline]
    fn from(id: u32) -> InstId {
        InstId(id)
    }
}

impl From<InstId> for u32 {
    #[inline]
    fn from(id: InstId) -> u32 {
        id.0
    }
}

impl From<InstId> for usize {
    #[inline]
    fn from(id: InstId) -> usize {
        id.0 as usize
    }
}

impl fmt::Display for InstId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inst#{}", self.0)
    }
}

/// An opaque validator identifier.
#[derive(Debug, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
#[cfg_attr(feature = "serialize_serde", derive(Serialize, Deserialize))]
pub struct NodeName(pub String);

impl fmt::Display for NodeName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeName {
    fn from(s: &str) -> Self {
        NodeName(s.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn view_no_ordering() {
        let a = ViewNo::from(1);
        let b = ViewNo::from(2);
        assert!(a < b);
        assert_eq!(a.next(), b);
    }

    #[test]
    fn three_pc_key_orders_by_view_then_seq() {
        let a = ThreePcKey::new(ViewNo::from(0), PpSeqNo::from(5));
        let b = ThreePcKey::new(ViewNo::from(1), PpSeqNo::from(1));
        assert!(a < b);
    }

    #[test]
    fn inst_id_master_is_zero() {
        assert!(InstId::from(0).is_master());
        assert!(!InstId::from(1).is_master());
    }
}
