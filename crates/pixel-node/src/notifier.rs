//! Outbound sync notifications. Every notify serializes the full device
//! state fresh; nothing is retained between packets except the send time
//! (which feeds the receive-side rate limit) and the pending second
//! notification.

use pixel_protocol::sync::{CallMode, SegmentSync, SyncPacket};

use crate::device::DeviceState;
use crate::receiver::SyncOptions;
use crate::time::TimeService;

/// Delay before the optional second copy of a notification goes out.
pub const SECOND_NOTIFY_DELAY_MS: u64 = 250;

#[derive(Debug, Default)]
pub struct NotifyState {
    last_sent_ms: Option<u64>,
    last_call_mode: u8,
    second_pending: bool,
}

impl NotifyState {
    /// Whether a notification for this call mode goes out at all, per the
    /// per-mode send flags. Inbound notifications and effect recalculation
    /// never re-notify, which keeps broadcast loops impossible.
    pub fn should_send(opts: &SyncOptions, mode: CallMode) -> bool {
        if opts.groups == 0 {
            return false;
        }
        match mode {
            CallMode::Init => false,
            CallMode::DirectChange | CallMode::Nightlight | CallMode::PresetCycle => {
                opts.send_on_change
            }
            CallMode::Button | CallMode::ButtonPreset => opts.send_on_button,
            CallMode::Hue => opts.send_on_hue,
            CallMode::Alexa => opts.send_on_alexa,
            CallMode::Notification | CallMode::Effect => false,
        }
    }

    pub fn mark_sent(&mut self, now_ms: u64, call_mode: u8, follow_up: bool, notify_twice: bool) {
        self.last_sent_ms = Some(now_ms);
        self.last_call_mode = call_mode;
        self.second_pending = !follow_up && notify_twice;
    }

    /// Call mode of the pending second notification, once its delay has
    /// elapsed. Cleared by the `mark_sent` of the follow-up itself.
    pub fn follow_up_due(&self, now_ms: u64) -> Option<u8> {
        if !self.second_pending {
            return None;
        }
        match self.last_sent_ms {
            Some(sent) if now_ms.saturating_sub(sent) >= SECOND_NOTIFY_DELAY_MS => {
                Some(self.last_call_mode)
            }
            _ => None,
        }
    }

    /// True within one second of our own last outbound notification;
    /// inbound sync packets in that window are cross-talk from the
    /// broadcast storm we started and get dropped.
    pub fn recently_sent(&self, now_ms: u64) -> bool {
        matches!(self.last_sent_ms, Some(sent) if now_ms.saturating_sub(sent) < 1000)
    }
}

/// Serialize the current device state as a sync packet.
pub fn build_packet(
    state: &DeviceState,
    opts: &SyncOptions,
    time: &dyn TimeService,
    call_mode: u8,
    follow_up: bool,
    now_ms: u64,
) -> SyncPacket {
    let wall = time.now();
    SyncPacket {
        call_mode,
        brightness: state.brightness,
        colors: state.colors,
        nightlight_active: state.nightlight_active,
        nightlight_delay_mins: state.nightlight_delay_mins,
        effect_mode: state.effect_mode,
        effect_speed: state.effect_speed,
        effect_intensity: state.effect_intensity,
        transition_delay_ms: state.transition_delay_ms,
        palette: state.palette,
        follow_up,
        timebase_ms: (now_ms as u32).wrapping_add(state.timebase_ms),
        time_source_rank: time.source_rank(),
        unix_sec: wall.sec,
        unix_ms: wall.ms,
        groups: opts.groups,
        cct_kind: if opts.cct_enabled { 0 } else { 255 },
        cct: state.cct,
        segments: state
            .segments
            .iter()
            .enumerate()
            .map(|(id, seg)| SegmentSync {
                id: id as u8,
                start: seg.start,
                stop: seg.stop,
                grouping: seg.grouping,
                spacing: seg.spacing,
                offset: seg.offset,
                options: seg.options,
                opacity: seg.opacity,
                mode: seg.mode,
                speed: seg.speed,
                intensity: seg.intensity,
                palette: seg.palette,
                colors: seg.colors,
                cct: seg.cct,
            })
            .collect(),
    }
}
