//! Abstract readiness event masks shared by the monitor and the platform wait code.

use std::fmt::{Debug, Formatter};
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Bitset over the readiness conditions a socket can be watched for.
///
/// Each monitored socket carries two masks: the *desired* mask (what its owner
/// wants watched) and the *fired* mask (what the last wait call reported). A
/// socket whose desired mask drops to zero is removed from the monitored set
/// entirely rather than kept with empty interest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct EventMask(u8);

impl EventMask {
    pub const NONE: EventMask = EventMask(0);
    pub const READABLE: EventMask = EventMask(0b0000_0001);
    pub const WRITABLE: EventMask = EventMask(0b0000_0010);
    pub const ERROR: EventMask = EventMask(0b0000_0100);
    pub const HANG_UP: EventMask = EventMask(0b0000_1000);
    pub const INVALID: EventMask = EventMask(0b0001_0000);
    /// Conditions that force full deregistration of a handle when they fire.
    pub const EXCEPTION: EventMask = EventMask(0b0001_1100);

    pub fn from_flags(read: bool, write: bool, exception: bool) -> EventMask {
        let mut mask = EventMask::NONE;
        if read {
            mask |= EventMask::READABLE;
        }
        if write {
            mask |= EventMask::WRITABLE;
        }
        if exception {
            mask |= EventMask::EXCEPTION;
        }
        mask
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, other: EventMask) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn intersects(self, other: EventMask) -> bool {
        self.0 & other.0 != 0
    }

    /// Returns this mask with every bit of `other` cleared.
    #[inline]
    pub fn without(self, other: EventMask) -> EventMask {
        EventMask(self.0 & !other.0)
    }
}

impl BitOr for EventMask {
    type Output = EventMask;

    fn bitor(self, other: EventMask) -> EventMask {
        EventMask(self.0 | other.0)
    }
}

impl BitOrAssign for EventMask {
    fn bitor_assign(&mut self, other: EventMask) {
        self.0 |= other.0;
    }
}

impl BitAnd for EventMask {
    type Output = EventMask;

    fn bitand(self, other: EventMask) -> EventMask {
        EventMask(self.0 & other.0)
    }
}

impl Debug for EventMask {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        let mut flag = |enabled: bool, name: &str, f: &mut Formatter<'_>| -> std::fmt::Result {
            if enabled {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
            Ok(())
        };
        if self.is_empty() {
            return f.write_str("NONE");
        }
        flag(self.contains(EventMask::READABLE), "READABLE", f)?;
        flag(self.contains(EventMask::WRITABLE), "WRITABLE", f)?;
        flag(self.contains(EventMask::ERROR), "ERROR", f)?;
        flag(self.contains(EventMask::HANG_UP), "HANG_UP", f)?;
        flag(self.contains(EventMask::INVALID), "INVALID", f)?;
        Ok(())
    }
}
