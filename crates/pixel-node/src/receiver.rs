//! Inbound datagram dispatch. The sync layer is connectionless and
//! tick-driven: the runtime polls each socket once per tick and hands any
//! datagram here, where the leading byte decides which decoder runs. A
//! bad datagram is dropped and the next tick polls again; nothing here is
//! fatal.

use std::net::{IpAddr, SocketAddr};

use pixel_protocol::packets::{
    realtime_pixels, NodeAnnounce, PacketKind, RealtimeFormat, Tpm2Data, TPM2_ACK,
    TPM2_REPLY_PORT,
};
use pixel_protocol::sync::{DecodeError, Rgbw, SyncUpdate};
use pixel_protocol::{ddp::SequenceCounter, PRESUMED_NETWORK_DELAY_MS, UDP_IN_MAXSIZE};
use tracing::{debug, trace};

use crate::device::{ApiIngest, DeviceState, PixelOutput};
use crate::nodes::NodeRegistry;
use crate::notifier::NotifyState;
use crate::realtime::{PixelMapper, RealtimeMode, RealtimeState};
use crate::time::{derate, TimeService, WallTime, NTP_GRADE_MIN};
use crate::tpm2::Tpm2Assembler;

/// Which socket a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketOrigin {
    /// The main sync socket.
    Primary,
    /// The supplementary info socket (announcements live here).
    Info,
    /// The dedicated raw-RGB socket; its traffic is never classified.
    RawRgb,
}

/// A datagram the dispatcher wants sent in response (TPM2.NET poll acks).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub to: SocketAddr,
    pub payload: Vec<u8>,
}

/// Runtime sync options, flattened from the config file.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Sync groups this node sends to (bitmask; 0 disables sending).
    pub groups: u8,
    /// Sync groups this node accepts (bitmask).
    pub receive_groups: u8,
    pub receive_notifications: bool,
    pub receive_brightness: bool,
    pub receive_color: bool,
    pub receive_effects: bool,
    pub receive_segment_options: bool,
    pub receive_segment_bounds: bool,
    /// Accept realtime pixel streams at all.
    pub receive_direct: bool,
    pub node_list_enabled: bool,
    pub send_on_change: bool,
    pub send_on_button: bool,
    pub send_on_hue: bool,
    pub send_on_alexa: bool,
    pub notify_twice: bool,
    pub realtime_timeout_ms: u32,
    pub force_max_brightness: bool,
    pub gamma_correction: bool,
    pub realtime_offset: i16,
    /// Whether this build drives a CCT-capable bus.
    pub cct_enabled: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            groups: 0x01,
            receive_groups: 0x01,
            receive_notifications: true,
            receive_brightness: true,
            receive_color: true,
            receive_effects: true,
            receive_segment_options: false,
            receive_segment_bounds: false,
            receive_direct: true,
            node_list_enabled: true,
            send_on_change: true,
            send_on_button: true,
            send_on_hue: true,
            send_on_alexa: true,
            notify_twice: false,
            realtime_timeout_ms: 2500,
            force_max_brightness: false,
            gamma_correction: true,
            realtime_offset: 0,
            cct_enabled: false,
        }
    }
}

/// Mutable handles to the device collaborators, passed into every
/// operation rather than held globally.
pub struct DeviceCtx<'a> {
    pub state: &'a mut DeviceState,
    pub strip: &'a mut dyn PixelOutput,
    pub time: &'a mut dyn TimeService,
    pub api: &'a mut dyn ApiIngest,
}

/// The whole sync layer's state: one owned context object, no process
/// globals.
pub struct SyncState {
    pub opts: SyncOptions,
    pub local_ip: IpAddr,
    pub realtime: RealtimeState,
    pub mapper: PixelMapper,
    pub tpm2: Tpm2Assembler,
    pub nodes: NodeRegistry,
    pub notify: NotifyState,
    pub ddp_seq: SequenceCounter,
}

impl SyncState {
    pub fn new(opts: SyncOptions, local_ip: IpAddr) -> Self {
        let realtime = RealtimeState::new(opts.realtime_timeout_ms, opts.force_max_brightness);
        let mapper = PixelMapper::new(opts.realtime_offset, opts.gamma_correction);
        Self {
            opts,
            local_ip,
            realtime,
            mapper,
            tpm2: Tpm2Assembler::default(),
            nodes: NodeRegistry::default(),
            notify: NotifyState::default(),
            ddp_seq: SequenceCounter::new(),
        }
    }

    /// Once-per-tick housekeeping: release an expired realtime lock.
    pub fn tick(&mut self, now_ms: u64, dev: &mut DeviceCtx) {
        self.realtime
            .check_expiry(now_ms, dev.state, &mut *dev.strip);
    }

    /// Dispatch one inbound datagram. Returns a reply the runtime should
    /// send, if any. Every failure path is a silent (at most debug-logged)
    /// drop.
    pub fn handle_datagram(
        &mut self,
        origin: SocketOrigin,
        src: SocketAddr,
        data: &[u8],
        now_ms: u64,
        dev: &mut DeviceCtx,
    ) -> Option<Reply> {
        if data.is_empty() || data.len() > UDP_IN_MAXSIZE {
            trace!(len = data.len(), "datagram outside accepted size, dropped");
            return None;
        }

        if origin == SocketOrigin::RawRgb {
            self.handle_raw_rgb(src, data, now_ms, dev);
            return None;
        }

        // Never decode our own broadcasts; only the primary socket sees
        // them reflected.
        if origin == SocketOrigin::Primary && src.ip() == self.local_ip {
            trace!("self-originated broadcast dropped");
            return None;
        }

        match PacketKind::of(data) {
            PacketKind::SyncNotify => self.handle_sync(src, data, now_ms, dev),
            PacketKind::NodeAnnounce => self.handle_announce(origin, src, data),
            PacketKind::Tpm2Poll => {
                if self.opts.receive_direct {
                    return Some(Reply {
                        to: SocketAddr::new(src.ip(), TPM2_REPLY_PORT),
                        payload: vec![TPM2_ACK],
                    });
                }
            }
            PacketKind::Tpm2Data => self.handle_tpm2_data(src, data, now_ms, dev),
            PacketKind::Realtime(format) => {
                self.handle_realtime(format, src, data, now_ms, dev);
            }
            PacketKind::TextApi => {
                let request = String::from_utf8_lossy(data);
                debug!(from = %src, "text API request over sync socket");
                dev.api.handle_text(&request);
            }
            PacketKind::JsonApi => match serde_json::from_slice::<serde_json::Value>(data) {
                Ok(value) if value.is_object() => dev.api.handle_json(value),
                Ok(_) | Err(_) => {
                    debug!(from = %src, "unparseable JSON over sync socket ignored");
                }
            },
            PacketKind::Unknown => {
                trace!(first = data[0], "unrecognized leading byte, dropped");
            }
        }
        None
    }

    fn handle_raw_rgb(&mut self, src: SocketAddr, data: &[u8], now_ms: u64, dev: &mut DeviceCtx) {
        if !self.opts.receive_direct || data.len() < 3 {
            return;
        }
        self.realtime.source = Some(src.ip());
        self.realtime.lock(
            now_ms,
            self.realtime.default_timeout_ms(),
            RealtimeMode::Hyperion,
            dev.state,
            &mut *dev.strip,
        );
        if self.realtime.overridden() {
            return;
        }
        for (id, rgb) in data.chunks_exact(3).enumerate() {
            if id >= dev.strip.len() {
                break;
            }
            self.mapper
                .set(&mut *dev.strip, id as u16, [rgb[0], rgb[1], rgb[2], 0]);
        }
        dev.strip.show();
    }

    fn handle_announce(&mut self, origin: SocketOrigin, src: SocketAddr, data: &[u8]) {
        if origin != SocketOrigin::Info || !self.opts.node_list_enabled {
            return;
        }
        if src.ip() == self.local_ip {
            return;
        }
        if let Some(announce) = NodeAnnounce::deserialize(data) {
            self.nodes.upsert(&announce);
        }
    }

    fn handle_tpm2_data(&mut self, src: SocketAddr, data: &[u8], now_ms: u64, dev: &mut DeviceCtx) {
        if !self.opts.receive_direct {
            return;
        }
        self.realtime.source = Some(src.ip());
        self.realtime.lock(
            now_ms,
            self.realtime.default_timeout_ms(),
            RealtimeMode::Tpm2Net,
            dev.state,
            &mut *dev.strip,
        );
        if self.realtime.overridden() {
            return;
        }
        let Some(frame) = Tpm2Data::parse(data) else {
            return;
        };
        if self.tpm2.ingest(&frame, &self.mapper, &mut *dev.strip) {
            dev.strip.show();
        }
    }

    fn handle_realtime(
        &mut self,
        format: RealtimeFormat,
        src: SocketAddr,
        data: &[u8],
        now_ms: u64,
        dev: &mut DeviceCtx,
    ) {
        if !self.opts.receive_direct || data.len() < 2 {
            return;
        }
        self.realtime.source = Some(src.ip());

        // Second byte requests the lock duration in seconds; zero releases
        // the lock instead.
        if data[1] == 0 {
            self.realtime.unlock(dev.state, &mut *dev.strip);
            return;
        }
        self.realtime.lock(
            now_ms,
            data[1] as u32 * 1000 + 1,
            RealtimeMode::Udp,
            dev.state,
            &mut *dev.strip,
        );
        if self.realtime.overridden() {
            return;
        }

        for (index, color) in realtime_pixels(format, data) {
            self.mapper.set(&mut *dev.strip, index, color);
        }
        dev.strip.show();
    }

    fn handle_sync(&mut self, src: SocketAddr, data: &[u8], now_ms: u64, dev: &mut DeviceCtx) {
        if !self.opts.receive_notifications || self.realtime.active() {
            return;
        }
        // Cross-talk guard: ignore notifications arriving right after our
        // own went out.
        if self.notify.recently_sent(now_ms) {
            debug!(from = %src, "sync packet within own notify window, dropped");
            return;
        }

        let update = match SyncUpdate::decode(data) {
            Ok(update) => update,
            Err(DecodeError::UnsupportedVersion(version)) => {
                trace!(version, "custom-version sync packet ignored");
                return;
            }
            Err(err) => {
                debug!(from = %src, %err, "sync packet rejected");
                return;
            }
        };

        // Senders too old to carry a group mask count as group 1.
        let sender_groups = update.groups.unwrap_or(0x01);
        if self.opts.receive_groups & sender_groups == 0 {
            trace!(sender_groups, "sync packet outside receive groups");
            return;
        }

        self.apply_sync(&update, now_ms, dev);
        debug!(from = %src, version = update.version, "sync notification applied");
    }

    fn apply_sync(&mut self, up: &SyncUpdate, now_ms: u64, dev: &mut DeviceCtx) {
        let opts = &self.opts;
        let state = &mut *dev.state;
        let some_sel = opts.receive_brightness || opts.receive_color || opts.receive_effects;
        let apply_colors = opts.receive_color || !some_sel;
        let apply_effects = opts.receive_effects || !some_sel;
        let full_segments = up.version >= 11 && opts.receive_segment_options;

        if apply_colors && !full_segments {
            state.colors[0] = Rgbw::new(
                up.primary_rgb[0],
                up.primary_rgb[1],
                up.primary_rgb[2],
                up.white.unwrap_or(0),
            );
            if let Some(secondary) = up.secondary {
                state.colors[1] = secondary;
            }
            if let Some(tertiary) = up.tertiary {
                state.colors[2] = tertiary;
                if let Some(cct) = up.cct.and_then(|c| c.resolve()) {
                    state.cct = cct;
                }
            }
        }

        if up.version >= 11 && (opts.receive_segment_options || opts.receive_segment_bounds) {
            if let Some(segments) = &up.segments {
                for seg in segments {
                    let id = seg.id as usize;
                    // A sender with more segments than us: skip the extras.
                    let Some(local) = state.segments.get_mut(id) else {
                        continue;
                    };
                    if !opts.receive_segment_options {
                        local.start = seg.start;
                        local.stop = seg.stop;
                        local.offset = seg.offset;
                        continue;
                    }
                    local.options = seg.options;
                    local.opacity = seg.opacity;
                    if apply_effects {
                        local.mode = seg.mode;
                        local.speed = seg.speed;
                        local.intensity = seg.intensity;
                        local.palette = seg.palette;
                    }
                    if apply_colors {
                        local.colors = seg.colors;
                        local.cct = seg.cct;
                    }
                    local.grouping = seg.grouping;
                    local.spacing = seg.spacing;
                    if opts.receive_segment_bounds {
                        local.start = seg.start;
                        local.stop = seg.stop;
                        local.offset = seg.offset;
                    }
                }
            }
        }

        // Simple effect sync applies to every selected segment when full
        // per-segment sync is not in play.
        if apply_effects && !full_segments {
            if up.effect_mode < state.mode_count {
                state.effect_mode = up.effect_mode;
            }
            state.effect_speed = up.effect_speed;
            if let Some(intensity) = up.effect_intensity {
                state.effect_intensity = intensity;
            }
            if let Some(palette) = up.palette {
                if palette < state.palette_count {
                    state.palette = palette;
                }
            }
            for seg in state.segments.iter_mut() {
                if !seg.is_active() || !seg.is_selected() {
                    continue;
                }
                seg.mode = state.effect_mode;
                seg.speed = state.effect_speed;
                if let Some(intensity) = up.effect_intensity {
                    seg.intensity = intensity;
                }
                if let Some(palette) = up.palette {
                    if palette < state.palette_count {
                        seg.palette = palette;
                    }
                }
            }
        }

        let mut timebase_updated = false;
        if apply_effects {
            if let Some(timebase) = up.timebase_ms {
                state.timebase_ms = timebase
                    .wrapping_add(PRESUMED_NETWORK_DELAY_MS)
                    .wrapping_sub(now_ms as u32);
                timebase_updated = true;
            }
        }

        // Adopt the sender's wall clock only if it is more accurate than
        // ours; when both sides have NTP-grade time, refine the effect
        // timebase from the actual clock difference instead of the
        // presumed delay.
        if let Some(remote) = up.time {
            let remote_time = WallTime {
                sec: remote.sec,
                ms: remote.ms,
            };
            if remote.source_rank > dev.time.source_rank() {
                dev.time.set(
                    remote_time.add_ms(PRESUMED_NETWORK_DELAY_MS),
                    derate(remote.source_rank),
                );
            } else if timebase_updated && dev.time.source_rank() > NTP_GRADE_MIN {
                let local_time = dev.time.now();
                let diff = remote_time.ms_difference(&local_time);
                state.timebase_ms = state.timebase_ms.wrapping_sub(PRESUMED_NETWORK_DELAY_MS);
                if remote_time.is_later(&local_time) {
                    state.timebase_ms = state.timebase_ms.wrapping_add(diff);
                } else {
                    state.timebase_ms = state.timebase_ms.wrapping_sub(diff);
                }
            }
        }

        if let Some(transition) = up.transition_delay_ms {
            state.transition_delay_ms = transition;
        }

        state.nightlight_active = up.nightlight_active;
        if up.nightlight_active {
            state.nightlight_delay_mins = up.nightlight_delay_mins;
        }

        if opts.receive_brightness || !some_sel {
            state.brightness = up.brightness;
            if up.brightness > 0 {
                state.brightness_last = up.brightness;
            }
        }

        dev.strip.set_brightness(state.brightness);
        dev.strip.show();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemoryStrip, SEG_OPTION_ON, SEG_OPTION_SELECTED};
    use crate::realtime::OverrideMode;
    use crate::time::rank;
    use pixel_protocol::sync::{CallMode, SegmentSync, SyncPacket, SYNC_VERSION};
    use std::net::Ipv4Addr;

    const LOCAL: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));

    fn peer(last: u8) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last)), 21324)
    }

    struct MockClock {
        rank: u8,
        now: WallTime,
        set_to: Option<(WallTime, u8)>,
    }

    impl MockClock {
        fn new(rank: u8) -> Self {
            Self {
                rank,
                now: WallTime {
                    sec: 1_000_000,
                    ms: 0,
                },
                set_to: None,
            }
        }
    }

    impl TimeService for MockClock {
        fn source_rank(&self) -> u8 {
            self.rank
        }
        fn now(&self) -> WallTime {
            self.now
        }
        fn set(&mut self, t: WallTime, rank: u8) {
            self.set_to = Some((t, rank));
            self.now = t;
            self.rank = rank;
        }
    }

    #[derive(Default)]
    struct RecordingApi {
        texts: Vec<String>,
        jsons: Vec<serde_json::Value>,
    }

    impl ApiIngest for RecordingApi {
        fn handle_text(&mut self, request: &str) {
            self.texts.push(request.to_string());
        }
        fn handle_json(&mut self, state: serde_json::Value) {
            self.jsons.push(state);
        }
    }

    struct Fixture {
        sync: SyncState,
        state: DeviceState,
        strip: MemoryStrip,
        clock: MockClock,
        api: RecordingApi,
    }

    impl Fixture {
        fn new(opts: SyncOptions) -> Self {
            Self {
                sync: SyncState::new(opts, LOCAL),
                state: DeviceState::default(),
                strip: MemoryStrip::new(6),
                clock: MockClock::new(rank::NONE),
                api: RecordingApi::default(),
            }
        }

        fn feed(
            &mut self,
            origin: SocketOrigin,
            src: SocketAddr,
            data: &[u8],
            now_ms: u64,
        ) -> Option<Reply> {
            let mut dev = DeviceCtx {
                state: &mut self.state,
                strip: &mut self.strip,
                time: &mut self.clock,
                api: &mut self.api,
            };
            self.sync.handle_datagram(origin, src, data, now_ms, &mut dev)
        }
    }

    fn plain_opts() -> SyncOptions {
        SyncOptions {
            gamma_correction: false,
            ..SyncOptions::default()
        }
    }

    fn sync_wire(brightness: u8, version: u8) -> Vec<u8> {
        SyncPacket {
            call_mode: CallMode::DirectChange as u8,
            brightness,
            colors: [
                Rgbw::new(1, 2, 3, 4),
                Rgbw::new(5, 6, 7, 8),
                Rgbw::new(9, 10, 11, 12),
            ],
            effect_mode: 12,
            effect_speed: 99,
            effect_intensity: 44,
            palette: 3,
            transition_delay_ms: 420,
            groups: 0x01,
            cct_kind: 0,
            cct: 40,
            ..SyncPacket::default()
        }
        .encode_with_version(version)
    }

    #[test]
    fn sync_packet_applies_state_and_refreshes() {
        let mut fx = Fixture::new(plain_opts());
        fx.feed(SocketOrigin::Primary, peer(2), &sync_wire(200, SYNC_VERSION), 5000);

        assert_eq!(fx.state.brightness, 200);
        assert_eq!(fx.state.colors[0], Rgbw::new(1, 2, 3, 4));
        assert_eq!(fx.state.colors[1], Rgbw::new(5, 6, 7, 8));
        assert_eq!(fx.state.colors[2], Rgbw::new(9, 10, 11, 12));
        assert_eq!(fx.state.cct, 40);
        assert_eq!(fx.state.effect_mode, 12);
        assert_eq!(fx.state.transition_delay_ms, 420);
        assert_eq!(fx.strip.brightness(), 200);
        assert_eq!(fx.strip.shows(), 1);
    }

    #[test]
    fn version_zero_applies_only_base_fields() {
        let mut fx = Fixture::new(plain_opts());
        let before = fx.state.clone();
        fx.feed(SocketOrigin::Primary, peer(2), &sync_wire(77, 0), 5000);

        assert_eq!(fx.state.brightness, 77);
        // White channel not defined at version 0.
        assert_eq!(fx.state.colors[0], Rgbw::new(1, 2, 3, 0));
        // Secondary/tertiary colors, CCT and transition keep prior values.
        assert_eq!(fx.state.colors[1], before.colors[1]);
        assert_eq!(fx.state.colors[2], before.colors[2]);
        assert_eq!(fx.state.cct, before.cct);
        assert_eq!(fx.state.transition_delay_ms, before.transition_delay_ms);
    }

    #[test]
    fn self_originated_broadcast_is_never_applied() {
        let mut fx = Fixture::new(plain_opts());
        let before = fx.state.clone();
        fx.feed(
            SocketOrigin::Primary,
            SocketAddr::new(LOCAL, 21324),
            &sync_wire(200, SYNC_VERSION),
            5000,
        );
        assert_eq!(fx.state, before);
        assert_eq!(fx.strip.shows(), 0);

        // The check does not apply to the supplementary socket.
        fx.feed(
            SocketOrigin::Info,
            SocketAddr::new(LOCAL, 21324),
            &sync_wire(200, SYNC_VERSION),
            5000,
        );
        assert_eq!(fx.state.brightness, 200);
    }

    #[test]
    fn sync_within_own_notify_window_is_dropped() {
        let mut fx = Fixture::new(plain_opts());
        fx.sync.notify.mark_sent(5000, 1, false, false);

        fx.feed(SocketOrigin::Primary, peer(2), &sync_wire(200, SYNC_VERSION), 5400);
        assert_ne!(fx.state.brightness, 200);

        fx.feed(SocketOrigin::Primary, peer(2), &sync_wire(200, SYNC_VERSION), 6100);
        assert_eq!(fx.state.brightness, 200);
    }

    #[test]
    fn sync_ignored_while_realtime_owner_active() {
        let mut fx = Fixture::new(plain_opts());
        fx.feed(SocketOrigin::Primary, peer(9), &[2, 5, 10, 20, 30], 1000);
        assert!(fx.sync.realtime.active());

        fx.feed(SocketOrigin::Primary, peer(2), &sync_wire(200, SYNC_VERSION), 1100);
        assert_ne!(fx.state.brightness, 200);
    }

    #[test]
    fn group_mismatch_drops_before_any_mutation() {
        let mut fx = Fixture::new(SyncOptions {
            receive_groups: 0x02,
            ..plain_opts()
        });
        let before = fx.state.clone();
        // Sender is in group 1 only.
        fx.feed(SocketOrigin::Primary, peer(2), &sync_wire(200, SYNC_VERSION), 5000);
        assert_eq!(fx.state, before);

        // Legacy packets (no group byte) count as group 1.
        fx.feed(SocketOrigin::Primary, peer(2), &sync_wire(200, 8), 5000);
        assert_eq!(fx.state, before);
    }

    #[test]
    fn custom_version_is_ignored_silently() {
        let mut fx = Fixture::new(plain_opts());
        let before = fx.state.clone();
        let mut wire = sync_wire(200, SYNC_VERSION);
        wire[11] = 231;
        fx.feed(SocketOrigin::Primary, peer(2), &wire, 5000);
        assert_eq!(fx.state, before);
    }

    #[test]
    fn segment_sync_applies_bounds_and_options() {
        let mut fx = Fixture::new(SyncOptions {
            receive_segment_options: true,
            receive_segment_bounds: true,
            ..plain_opts()
        });
        let mut packet = SyncPacket {
            groups: 0x01,
            ..SyncPacket::default()
        };
        packet.segments = vec![SegmentSync {
            id: 0,
            start: 10,
            stop: 50,
            grouping: 2,
            spacing: 1,
            offset: 4,
            options: SEG_OPTION_SELECTED | SEG_OPTION_ON,
            opacity: 99,
            mode: 8,
            speed: 61,
            intensity: 62,
            palette: 9,
            colors: [Rgbw::new(1, 1, 1, 1); 3],
            cct: 33,
        }];
        fx.feed(SocketOrigin::Primary, peer(2), &packet.encode(), 5000);

        let seg = &fx.state.segments[0];
        assert_eq!((seg.start, seg.stop, seg.offset), (10, 50, 4));
        assert_eq!((seg.grouping, seg.spacing), (2, 1));
        assert_eq!(seg.opacity, 99);
        assert_eq!((seg.mode, seg.speed, seg.intensity, seg.palette), (8, 61, 62, 9));
        assert_eq!(seg.cct, 33);
    }

    #[test]
    fn last_writer_wins_between_realtime_senders() {
        let mut fx = Fixture::new(plain_opts());
        // WARLS from sender A with a long timeout.
        fx.feed(SocketOrigin::Primary, peer(8), &[1, 255, 0, 10, 10, 10], 1000);
        assert_eq!(fx.sync.realtime.source, Some(peer(8).ip()));

        // DRGB from sender B pre-empts immediately.
        fx.feed(SocketOrigin::Primary, peer(9), &[2, 5, 20, 20, 20], 1001);
        assert_eq!(fx.sync.realtime.source, Some(peer(9).ip()));
        assert!(fx.sync.realtime.active());
    }

    #[test]
    fn zero_duration_releases_the_lock() {
        let mut fx = Fixture::new(plain_opts());
        fx.feed(SocketOrigin::Primary, peer(8), &[2, 5, 1, 1, 1], 1000);
        assert!(fx.sync.realtime.active());

        fx.feed(SocketOrigin::Primary, peer(8), &[2, 0], 1500);
        assert!(!fx.sync.realtime.active());
        assert_eq!(fx.sync.realtime.source, None);
    }

    #[test]
    fn warls_writes_land_at_their_indices() {
        let mut fx = Fixture::new(plain_opts());
        fx.feed(
            SocketOrigin::Primary,
            peer(8),
            &[1, 2, /*idx*/ 4, 10, 20, 30, /*idx*/ 0, 40, 50, 60],
            1000,
        );
        assert_eq!(fx.strip.pixel(4), [10, 20, 30, 0]);
        assert_eq!(fx.strip.pixel(0), [40, 50, 60, 0]);
        assert_eq!(fx.strip.shows(), 1);
        assert_eq!(fx.sync.realtime.mode, RealtimeMode::Udp);
    }

    #[test]
    fn raw_rgb_stream_writes_sequentially() {
        let mut fx = Fixture::new(plain_opts());
        fx.feed(SocketOrigin::RawRgb, peer(3), &[10, 20, 30, 40, 50, 60], 1000);

        assert_eq!(fx.sync.realtime.mode, RealtimeMode::Hyperion);
        assert_eq!(fx.strip.pixel(0), [10, 20, 30, 0]);
        assert_eq!(fx.strip.pixel(1), [40, 50, 60, 0]);
        assert_eq!(fx.strip.shows(), 1);
    }

    #[test]
    fn raw_rgb_requires_receive_direct() {
        let mut fx = Fixture::new(SyncOptions {
            receive_direct: false,
            ..plain_opts()
        });
        fx.feed(SocketOrigin::RawRgb, peer(3), &[10, 20, 30], 1000);
        assert!(!fx.sync.realtime.active());
        assert_eq!(fx.strip.shows(), 0);
    }

    #[test]
    fn override_suppresses_pixel_application() {
        let mut fx = Fixture::new(plain_opts());
        fx.sync.realtime.override_mode = OverrideMode::Once;
        fx.feed(SocketOrigin::Primary, peer(8), &[2, 5, 10, 20, 30], 1000);
        // Lock is taken but no pixels were written or shown.
        assert!(fx.sync.realtime.active());
        assert_eq!(fx.strip.pixel(0), [0, 0, 0, 0]);
        assert_eq!(fx.strip.shows(), 0);
    }

    #[test]
    fn tpm2_poll_is_acked_without_state_change() {
        let mut fx = Fixture::new(plain_opts());
        let before = fx.state.clone();
        let reply = fx
            .feed(SocketOrigin::Primary, peer(4), &[0x9C, 0xAA], 1000)
            .expect("poll reply");
        assert_eq!(reply.to, SocketAddr::new(peer(4).ip(), TPM2_REPLY_PORT));
        assert_eq!(reply.payload, vec![TPM2_ACK]);
        assert_eq!(fx.state, before);
        assert!(!fx.sync.realtime.active());
    }

    #[test]
    fn tpm2_frame_reassembles_and_flushes_once() {
        let mut fx = Fixture::new(plain_opts());
        let wire = |n: u8, payload: &[u8]| {
            let mut buf = vec![0x9C, 0xDA, 0x00, 0x06, n, 3];
            buf.extend_from_slice(payload);
            buf
        };
        fx.feed(SocketOrigin::Primary, peer(4), &wire(1, &[1, 1, 1, 2, 2, 2]), 1000);
        fx.feed(SocketOrigin::Primary, peer(4), &wire(2, &[3, 3, 3, 4, 4, 4]), 1001);
        assert_eq!(fx.strip.shows(), 0);
        fx.feed(SocketOrigin::Primary, peer(4), &wire(3, &[5, 5, 5, 6, 6, 6]), 1002);

        assert_eq!(fx.strip.shows(), 1);
        assert_eq!(fx.sync.realtime.mode, RealtimeMode::Tpm2Net);
        for (i, v) in (1u8..=6).enumerate() {
            assert_eq!(fx.strip.pixel(i), [v, v, v, 0], "pixel {i}");
        }
    }

    #[test]
    fn announcements_register_only_from_info_socket() {
        let mut fx = Fixture::new(plain_opts());
        let announce = NodeAnnounce {
            ip: [10, 0, 0, 7],
            name: "porch".to_string(),
            node_type: 32,
            unit_id: 7,
            build: 1,
        };
        let mut buf = Vec::new();
        announce.serialize(&mut buf);

        fx.feed(SocketOrigin::Primary, peer(7), &buf, 1000);
        assert!(fx.sync.nodes.get(7).is_none());

        fx.feed(SocketOrigin::Info, peer(7), &buf, 1000);
        assert!(fx.sync.nodes.get(7).is_some());
    }

    #[test]
    fn text_and_json_api_requests_are_forwarded() {
        let mut fx = Fixture::new(plain_opts());
        fx.feed(SocketOrigin::Primary, peer(2), b"T=2&A=128", 1000);
        assert_eq!(fx.api.texts, vec!["T=2&A=128".to_string()]);

        fx.feed(SocketOrigin::Primary, peer(2), b"{\"on\":true}", 1000);
        assert_eq!(fx.api.jsons.len(), 1);

        // Malformed JSON and non-object roots are silent no-ops.
        fx.feed(SocketOrigin::Primary, peer(2), b"{\"on\":", 1000);
        fx.feed(SocketOrigin::Primary, peer(2), b"{}", 1000);
        assert_eq!(fx.api.jsons.len(), 2);
        fx.feed(SocketOrigin::Primary, peer(2), b"[1,2]", 1000);
        assert_eq!(fx.api.jsons.len(), 2);
    }

    #[test]
    fn unknown_and_oversized_datagrams_are_dropped() {
        let mut fx = Fixture::new(plain_opts());
        let before = fx.state.clone();
        fx.feed(SocketOrigin::Primary, peer(2), &[0xFE, 1, 2, 3], 1000);
        fx.feed(SocketOrigin::Primary, peer(2), &[], 1000);
        let huge = vec![0u8; UDP_IN_MAXSIZE + 1];
        fx.feed(SocketOrigin::Primary, peer(2), &huge, 1000);
        assert_eq!(fx.state, before);
        assert_eq!(fx.strip.shows(), 0);
    }

    #[test]
    fn senders_clock_adopted_only_when_better() {
        let mut fx = Fixture::new(plain_opts());
        fx.clock.rank = rank::NTP;
        let mut packet = SyncPacket {
            groups: 0x01,
            time_source_rank: rank::SEC,
            unix_sec: 5000,
            unix_ms: 0,
            ..SyncPacket::default()
        };
        fx.feed(SocketOrigin::Primary, peer(2), &packet.encode_with_version(8), 1000);
        assert!(fx.clock.set_to.is_none());

        fx.clock.rank = rank::NONE;
        packet.time_source_rank = rank::NTP;
        packet.unix_sec = 6000;
        fx.feed(SocketOrigin::Primary, peer(2), &packet.encode_with_version(8), 1000);
        let (t, r) = fx.clock.set_to.expect("clock adopted");
        assert_eq!(r, rank::UDP_NTP);
        assert_eq!(t.total_ms(), 6_000_000 + PRESUMED_NETWORK_DELAY_MS as u64);
    }

    #[test]
    fn expired_lock_releases_via_tick() {
        let mut fx = Fixture::new(plain_opts());
        fx.feed(SocketOrigin::Primary, peer(8), &[2, 2, 1, 1, 1], 1000);
        assert!(fx.sync.realtime.active());

        let mut dev = DeviceCtx {
            state: &mut fx.state,
            strip: &mut fx.strip,
            time: &mut fx.clock,
            api: &mut fx.api,
        };
        fx.sync.tick(2000, &mut dev);
        assert!(fx.sync.realtime.active());
        fx.sync.tick(3002, &mut dev);
        assert!(!fx.sync.realtime.active());
    }
}
