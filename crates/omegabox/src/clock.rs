//! Wall-clock arithmetic on normalized `(sec, nsec)` pairs.
//!
//! Deadlines are computed against `CLOCK_REALTIME` with explicit carry and
//! borrow so the arithmetic stays exact over the full range; adds saturate
//! so "no wall limit" cannot wrap.

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// A normalized timespec: `0 <= nsec < 1_000_000_000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: i64,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

    /// Current `CLOCK_REALTIME` time.
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: ts points at a writable timespec.
        unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) };
        Timespec {
            sec: ts.tv_sec,
            nsec: ts.tv_nsec,
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        Timespec {
            sec: (ms / 1000) as i64,
            nsec: (ms % 1000) as i64 * 1_000_000,
        }
    }

    /// `self + other` with explicit nanosecond carry; seconds saturate.
    pub fn add(self, other: Timespec) -> Timespec {
        let mut nsec = self.nsec + other.nsec;
        let mut carry = 0;
        if nsec >= NANOS_PER_SEC {
            nsec -= NANOS_PER_SEC;
            carry = 1;
        }
        Timespec {
            sec: self.sec.saturating_add(other.sec).saturating_add(carry),
            nsec,
        }
    }

    /// `self - other` with explicit nanosecond borrow.
    pub fn sub(self, other: Timespec) -> Timespec {
        let mut nsec = self.nsec - other.nsec;
        let mut borrow = 0;
        if nsec < 0 {
            nsec += NANOS_PER_SEC;
            borrow = 1;
        }
        Timespec {
            sec: self.sec - other.sec - borrow,
            nsec,
        }
    }

    pub fn cmp_to(self, other: Timespec) -> std::cmp::Ordering {
        (self.sec, self.nsec).cmp(&(other.sec, other.nsec))
    }

    pub fn is_negative(self) -> bool {
        self.sec < 0
    }

    /// Total microseconds; clamps negative values to zero.
    pub fn as_micros(self) -> i64 {
        if self.is_negative() {
            return 0;
        }
        (self.sec.saturating_mul(NANOS_PER_SEC).saturating_add(self.nsec)) / 1000
    }

    pub fn to_libc(self) -> libc::timespec {
        libc::timespec {
            tv_sec: self.sec,
            tv_nsec: self.nsec,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use super::*;

    #[test]
    fn add_carries_nanoseconds() {
        let a = Timespec {
            sec: 1,
            nsec: 900_000_000,
        };
        let b = Timespec {
            sec: 0,
            nsec: 200_000_000,
        };
        assert_eq!(
            a.add(b),
            Timespec {
                sec: 2,
                nsec: 100_000_000
            }
        );
    }

    #[test]
    fn sub_borrows_nanoseconds() {
        let a = Timespec {
            sec: 2,
            nsec: 100_000_000,
        };
        let b = Timespec {
            sec: 0,
            nsec: 200_000_000,
        };
        assert_eq!(
            a.sub(b),
            Timespec {
                sec: 1,
                nsec: 900_000_000
            }
        );
    }

    #[test]
    fn sub_can_go_negative() {
        let a = Timespec { sec: 1, nsec: 0 };
        let b = Timespec { sec: 2, nsec: 0 };
        assert!(a.sub(b).is_negative());
    }

    #[test]
    fn add_saturates() {
        let a = Timespec {
            sec: i64::MAX,
            nsec: 0,
        };
        let b = Timespec { sec: 10, nsec: 1 };
        assert_eq!(a.add(b).sec, i64::MAX);
    }

    #[test]
    fn ordering() {
        let early = Timespec { sec: 5, nsec: 1 };
        let late = Timespec { sec: 5, nsec: 2 };
        assert_eq!(early.cmp_to(late), Ordering::Less);
        assert_eq!(late.cmp_to(early), Ordering::Greater);
        assert_eq!(early.cmp_to(early), Ordering::Equal);
    }

    #[test]
    fn from_millis() {
        assert_eq!(
            Timespec::from_millis(1500),
            Timespec {
                sec: 1,
                nsec: 500_000_000
            }
        );
    }

    #[test]
    fn micros_of_elapsed_interval() {
        let elapsed = Timespec {
            sec: 2,
            nsec: 345_678_000,
        };
        assert_eq!(elapsed.as_micros(), 2_345_678);
        assert_eq!(Timespec { sec: -1, nsec: 0 }.as_micros(), 0);
    }

    #[test]
    fn now_is_plausible() {
        // After 2001 in epoch seconds.
        assert!(Timespec::now().sec > 1_000_000_000);
    }
}
