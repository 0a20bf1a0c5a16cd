//! Transport masks: which physical media an advertisement or session may use.

use std::fmt;
use std::ops::{BitAnd, BitOr};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct TransportMask(u16);

impl TransportMask {
    pub const NONE: TransportMask = TransportMask(0);
    /// In-process / same-node delivery.
    pub const LOCAL: TransportMask = TransportMask(0x0001);
    pub const BLUETOOTH: TransportMask = TransportMask(0x0002);
    pub const TCP: TransportMask = TransportMask(0x0004);
    /// Wi-Fi Direct group sockets.
    pub const WFD: TransportMask = TransportMask(0x0080);
    pub const UDP: TransportMask = TransportMask(0x0100);
    /// Every remote transport.
    pub const ANY: TransportMask = TransportMask(0xffff & !0x0001);

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn from_bits(bits: u16) -> Self {
        TransportMask(bits)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn intersects(self, other: TransportMask) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn contains(self, other: TransportMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn without(self, other: TransportMask) -> TransportMask {
        TransportMask(self.0 & !other.0)
    }
}

impl BitOr for TransportMask {
    type Output = TransportMask;
    fn bitor(self, rhs: Self) -> Self {
        TransportMask(self.0 | rhs.0)
    }
}

impl BitAnd for TransportMask {
    type Output = TransportMask;
    fn bitand(self, rhs: Self) -> Self {
        TransportMask(self.0 & rhs.0)
    }
}

impl fmt::Display for TransportMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}
