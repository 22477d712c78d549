//! Realtime output ownership. A single slot tracks which sender currently
//! drives the pixels; ownership is last-writer-wins with a timeout, checked
//! once per tick. "Lock" here is a data flag, not a mutex — the wire
//! protocols have no sender coordination and none is attempted.

use std::net::IpAddr;

use tracing::{debug, info};

use crate::device::{DeviceState, PixelOutput};

/// Lock durations that never expire (the wire formats' sentinel values).
pub const NEVER_EXPIRE_MS: [u32; 2] = [255_001, 65_000];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RealtimeMode {
    #[default]
    Inactive,
    /// Locked programmatically, without a driving stream.
    Generic,
    /// Indexed realtime formats on the sync socket.
    Udp,
    /// Raw RGB triplets on the dedicated socket.
    Hyperion,
    /// TPM2.NET frame data.
    Tpm2Net,
}

/// Manual override of remote realtime data, used to preview local changes
/// while a stream is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrideMode {
    #[default]
    None,
    /// Suppress until the current lock expires.
    Once,
    Always,
}

#[derive(Debug)]
pub struct RealtimeState {
    pub mode: RealtimeMode,
    /// Address of the current owner, cleared on release.
    pub source: Option<IpAddr>,
    pub override_mode: OverrideMode,
    expires_at_ms: u64,
    default_timeout_ms: u32,
    force_max_brightness: bool,
}

impl RealtimeState {
    pub fn new(default_timeout_ms: u32, force_max_brightness: bool) -> Self {
        Self {
            mode: RealtimeMode::Inactive,
            source: None,
            override_mode: OverrideMode::None,
            expires_at_ms: 0,
            default_timeout_ms,
            force_max_brightness,
        }
    }

    pub fn active(&self) -> bool {
        self.mode != RealtimeMode::Inactive
    }

    pub fn overridden(&self) -> bool {
        self.override_mode != OverrideMode::None
    }

    pub fn default_timeout_ms(&self) -> u32 {
        self.default_timeout_ms
    }

    /// Acquire (or refresh) the realtime lock. On the inactive→active
    /// transition the pixel buffer is zeroed for a clean slate, unless an
    /// override is in force. A dark strip is raised to the last user
    /// brightness so the stream is actually visible.
    pub fn lock(
        &mut self,
        now_ms: u64,
        duration_ms: u32,
        mode: RealtimeMode,
        state: &DeviceState,
        strip: &mut dyn PixelOutput,
    ) {
        if !self.active() && !self.overridden() {
            for i in 0..strip.len() {
                strip.set_pixel(i, 0, 0, 0, 0);
            }
        }

        self.expires_at_ms = if NEVER_EXPIRE_MS.contains(&duration_ms) {
            u64::MAX
        } else {
            now_ms + duration_ms as u64
        };

        if state.brightness == 0 && !self.active() {
            strip.set_brightness(state.brightness_last);
        }

        if self.mode == RealtimeMode::Inactive {
            debug!(?mode, duration_ms, "realtime lock acquired");
        }
        self.mode = mode;

        if self.force_max_brightness && !self.overridden() {
            strip.set_brightness(255);
        }
        if mode == RealtimeMode::Generic {
            strip.show();
        }
    }

    /// Drop the lock and restore the user-set brightness. An `Once`
    /// override has served its purpose and decays here.
    pub fn unlock(&mut self, state: &DeviceState, strip: &mut dyn PixelOutput) {
        if self.override_mode == OverrideMode::Once {
            self.override_mode = OverrideMode::None;
        }
        strip.set_brightness(state.brightness);
        self.mode = RealtimeMode::Inactive;
        self.source = None;
        info!("realtime lock released");
    }

    /// Called once per tick: release an expired lock.
    pub fn check_expiry(
        &mut self,
        now_ms: u64,
        state: &DeviceState,
        strip: &mut dyn PixelOutput,
    ) -> bool {
        if self.active() && now_ms > self.expires_at_ms {
            self.unlock(state, strip);
            return true;
        }
        false
    }
}

/// Realtime pixel writes go through this mapper: a configurable index
/// offset, silent clipping past the strip, and gamma correction unless
/// disabled.
#[derive(Debug)]
pub struct PixelMapper {
    offset: i32,
    gamma: Option<Box<[u8; 256]>>,
}

impl PixelMapper {
    pub fn new(offset: i16, gamma_correction: bool) -> Self {
        Self {
            offset: offset as i32,
            gamma: gamma_correction.then(gamma_table),
        }
    }

    pub fn set(&self, strip: &mut dyn PixelOutput, index: u16, color: [u8; 4]) {
        let pix = index as i32 + self.offset;
        if pix < 0 || pix as usize >= strip.len() {
            return;
        }
        let [r, g, b, w] = match &self.gamma {
            Some(t) => [
                t[color[0] as usize],
                t[color[1] as usize],
                t[color[2] as usize],
                t[color[3] as usize],
            ],
            None => color,
        };
        strip.set_pixel(pix as usize, r, g, b, w);
    }
}

/// Standard gamma 2.8 lookup table.
fn gamma_table() -> Box<[u8; 256]> {
    let mut table = Box::new([0u8; 256]);
    for (i, v) in table.iter_mut().enumerate() {
        *v = (255.0 * (i as f64 / 255.0).powf(2.8)).round() as u8;
    }
    table
}
