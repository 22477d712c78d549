//! Wall-clock time exchange with peers. Each time source carries an
//! accuracy rank; a node only adopts a sender's clock when the sender's
//! rank beats its own, and the adopted rank is derated to the matching
//! "learned over UDP" rung.

/// Source-accuracy ranks, low to high.
pub mod rank {
    pub const NONE: u8 = 0;
    /// Learned from a peer's broadcast.
    pub const UDP: u8 = 16;
    /// Learned over UDP from a peer with seconds-grade time.
    pub const UDP_SEC: u8 = 24;
    /// Seconds-grade local source.
    pub const SEC: u8 = 32;
    /// Learned over UDP from an NTP-grade peer.
    pub const UDP_NTP: u8 = 100;
    /// Local NTP.
    pub const NTP: u8 = 200;
}

/// Ranks above this are NTP-grade.
pub const NTP_GRADE_MIN: u8 = 99;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WallTime {
    pub sec: u32,
    pub ms: u16,
}

impl WallTime {
    pub fn total_ms(&self) -> u64 {
        self.sec as u64 * 1000 + self.ms as u64
    }

    pub fn from_total_ms(total: u64) -> Self {
        Self {
            sec: (total / 1000) as u32,
            ms: (total % 1000) as u16,
        }
    }

    pub fn add_ms(&self, delta: u32) -> Self {
        Self::from_total_ms(self.total_ms() + delta as u64)
    }

    pub fn ms_difference(&self, other: &WallTime) -> u32 {
        self.total_ms().abs_diff(other.total_ms()) as u32
    }

    pub fn is_later(&self, other: &WallTime) -> bool {
        self.total_ms() > other.total_ms()
    }
}

/// The wall-clock service this layer syncs against. The real firmware
/// clock lives elsewhere; the sync layer reads it, and sets it when a
/// better-ranked sender shows up.
pub trait TimeService {
    fn source_rank(&self) -> u8;
    fn now(&self) -> WallTime;
    /// Adopt `t` (already adjusted for network delay) with the accuracy
    /// rank of its source.
    fn set(&mut self, t: WallTime, rank: u8);
}

/// Derate a sender's rank to the rung representing "that grade of time,
/// learned over UDP".
pub fn derate(sender_rank: u8) -> u8 {
    if sender_rank > NTP_GRADE_MIN {
        rank::UDP_NTP
    } else if sender_rank >= rank::SEC {
        rank::UDP_SEC
    } else {
        rank::UDP
    }
}

/// System-clock backed implementation used by the daemon.
#[derive(Debug, Default)]
pub struct SystemClock {
    rank: u8,
    offset_ms: i64,
}

impl SystemClock {
    fn system_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

impl TimeService for SystemClock {
    fn source_rank(&self) -> u8 {
        self.rank
    }

    fn now(&self) -> WallTime {
        WallTime::from_total_ms((Self::system_ms() as i64 + self.offset_ms).max(0) as u64)
    }

    fn set(&mut self, t: WallTime, rank: u8) {
        self.offset_ms = t.total_ms() as i64 - Self::system_ms() as i64;
        self.rank = rank;
    }
}
