//! Versioned full-state sync packet codec.
//!
//! The sync packet carries the complete visual state of a controller:
//! brightness, colors, effect parameters, timing, sync groups, CCT, and a
//! variable-length per-segment table. The compatibility-version byte at
//! offset 11 governs which fields a receiver may interpret; fields
//! introduced at version `v` are read only from packets declaring a
//! version >= `v`. Multi-byte numeric fields are big-endian.

use thiserror::Error;

/// Fixed header length of the sync packet (everything before the segment table).
pub const SYNC_HEADER_LEN: usize = 41;
/// Wire size of one segment record.
pub const SEGMENT_RECORD_LEN: usize = 28;
/// Shortest parseable sync packet (base fields + version byte).
pub const SYNC_BASE_LEN: usize = 12;
/// Compatibility version emitted by this implementation.
pub const SYNC_VERSION: u8 = 11;
/// Versions at or above this are reserved for custom senders and never
/// interpreted beyond the header.
pub const CUSTOM_VERSION_MIN: u8 = 200;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("packet truncated: need {need} bytes for version {version}, got {got}")]
    Truncated { need: usize, got: usize, version: u8 },
    #[error("compatibility version {0} is reserved for custom senders")]
    UnsupportedVersion(u8),
}

/// Why a notification was sent. Encoded verbatim at offset 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CallMode {
    Init = 0,
    DirectChange = 1,
    Button = 2,
    Notification = 3,
    Nightlight = 4,
    Effect = 6,
    Hue = 7,
    PresetCycle = 8,
    Alexa = 10,
    ButtonPreset = 12,
}

impl CallMode {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Init),
            1 => Some(Self::DirectChange),
            2 => Some(Self::Button),
            3 => Some(Self::Notification),
            4 => Some(Self::Nightlight),
            6 => Some(Self::Effect),
            7 => Some(Self::Hue),
            8 => Some(Self::PresetCycle),
            10 => Some(Self::Alexa),
            12 => Some(Self::ButtonPreset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rgbw {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub w: u8,
}

impl Rgbw {
    pub const fn new(r: u8, g: u8, b: u8, w: u8) -> Self {
        Self { r, g, b, w }
    }
}

/// One segment record of the sync packet's segment table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SegmentSync {
    pub id: u8,
    pub start: u16,
    pub stop: u16,
    pub grouping: u8,
    pub spacing: u8,
    pub offset: u16,
    /// Low four bits only: selected, reversed, on, mirrored.
    pub options: u8,
    pub opacity: u8,
    pub mode: u8,
    pub speed: u8,
    pub intensity: u8,
    pub palette: u8,
    pub colors: [Rgbw; 3],
    pub cct: u8,
}

impl SegmentSync {
    fn write(&self, rec: &mut [u8]) {
        rec[0] = self.id;
        rec[1..3].copy_from_slice(&self.start.to_be_bytes());
        rec[3..5].copy_from_slice(&self.stop.to_be_bytes());
        rec[5] = self.grouping;
        rec[6] = self.spacing;
        rec[7..9].copy_from_slice(&self.offset.to_be_bytes());
        rec[9] = self.options & 0x0F;
        rec[10] = self.opacity;
        rec[11] = self.mode;
        rec[12] = self.speed;
        rec[13] = self.intensity;
        rec[14] = self.palette;
        for (i, col) in self.colors.iter().enumerate() {
            let ofs = 15 + i * 4;
            rec[ofs] = col.r;
            rec[ofs + 1] = col.g;
            rec[ofs + 2] = col.b;
            rec[ofs + 3] = col.w;
        }
        rec[27] = self.cct;
    }

    fn read(rec: &[u8]) -> Self {
        let mut colors = [Rgbw::default(); 3];
        for (i, col) in colors.iter_mut().enumerate() {
            let ofs = 15 + i * 4;
            *col = Rgbw::new(rec[ofs], rec[ofs + 1], rec[ofs + 2], rec[ofs + 3]);
        }
        Self {
            id: rec[0],
            start: u16::from_be_bytes([rec[1], rec[2]]),
            stop: u16::from_be_bytes([rec[3], rec[4]]),
            grouping: rec[5],
            spacing: rec[6],
            offset: u16::from_be_bytes([rec[7], rec[8]]),
            options: rec[9] & 0x0F,
            opacity: rec[10],
            mode: rec[11],
            speed: rec[12],
            intensity: rec[13],
            palette: rec[14],
            colors,
            cct: rec[27],
        }
    }
}

/// Field groups unlocked as the compatibility version advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldTier {
    White,
    SecondaryColor,
    EffectIntensity,
    TransitionDelay,
    Palette,
    Timebase,
    TertiaryColor,
    SystemTime,
    SyncGroups,
    Cct,
    Segments,
}

/// Ordered compatibility table: `(min_version, required_len, tier)`.
/// A packet declaring version `v` must be at least as long as the largest
/// `required_len` among tiers with `min_version <= v`, and a decoder reads
/// exactly those tiers. This is the entire version contract in one place.
const FIELD_TIERS: &[(u8, usize, FieldTier)] = &[
    (1, 12, FieldTier::White),
    (2, 16, FieldTier::SecondaryColor),
    (3, 17, FieldTier::EffectIntensity),
    (4, 19, FieldTier::TransitionDelay),
    (5, 20, FieldTier::Palette),
    (6, 29, FieldTier::Timebase),
    (7, 24, FieldTier::TertiaryColor),
    (8, 36, FieldTier::SystemTime),
    (9, 37, FieldTier::SyncGroups),
    (10, 39, FieldTier::Cct),
    (11, SYNC_HEADER_LEN, FieldTier::Segments),
];

/// Packet length a given compatibility version requires (excluding the
/// segment table, which is self-describing).
pub fn required_len(version: u8) -> usize {
    FIELD_TIERS
        .iter()
        .filter(|(min, _, _)| version >= *min)
        .map(|(_, len, _)| *len)
        .max()
        .unwrap_or(SYNC_BASE_LEN)
        .max(SYNC_BASE_LEN)
}

/// Full outbound state snapshot, serialized fresh on every notify.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncPacket {
    pub call_mode: u8,
    pub brightness: u8,
    /// Primary, secondary, tertiary color of the main segment.
    pub colors: [Rgbw; 3],
    pub nightlight_active: bool,
    pub nightlight_delay_mins: u8,
    pub effect_mode: u8,
    pub effect_speed: u8,
    pub effect_intensity: u8,
    pub transition_delay_ms: u16,
    pub palette: u8,
    pub follow_up: bool,
    pub timebase_ms: u32,
    pub time_source_rank: u8,
    pub unix_sec: u32,
    pub unix_ms: u16,
    pub groups: u8,
    /// 0: `cct` is a raw 0-255 value, 255: no valid CCT, 1-254: Kelvin MSB.
    pub cct_kind: u8,
    pub cct: u8,
    pub segments: Vec<SegmentSync>,
}

impl SyncPacket {
    /// Serialize at the current compatibility version.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_version(SYNC_VERSION)
    }

    /// Serialize as an older compatibility version. The output carries
    /// exactly the fields that version defines and nothing past its
    /// required length. Panics if `version` exceeds [`SYNC_VERSION`].
    pub fn encode_with_version(&self, version: u8) -> Vec<u8> {
        assert!(version <= SYNC_VERSION, "unknown compatibility version {version}");

        let mut len = required_len(version);
        if version >= 11 {
            len += self.segments.len() * SEGMENT_RECORD_LEN;
        }
        let mut buf = vec![0u8; len];

        buf[0] = 0; // sync notifier packet type
        buf[1] = self.call_mode;
        buf[2] = self.brightness;
        buf[3] = self.colors[0].r;
        buf[4] = self.colors[0].g;
        buf[5] = self.colors[0].b;
        buf[6] = self.nightlight_active as u8;
        buf[7] = self.nightlight_delay_mins;
        buf[8] = self.effect_mode;
        buf[9] = self.effect_speed;
        buf[11] = version;

        for &(min, _, tier) in FIELD_TIERS {
            if version < min {
                continue;
            }
            match tier {
                FieldTier::White => buf[10] = self.colors[0].w,
                FieldTier::SecondaryColor => {
                    buf[12] = self.colors[1].r;
                    buf[13] = self.colors[1].g;
                    buf[14] = self.colors[1].b;
                    buf[15] = self.colors[1].w;
                }
                FieldTier::EffectIntensity => buf[16] = self.effect_intensity,
                FieldTier::TransitionDelay => {
                    buf[17..19].copy_from_slice(&self.transition_delay_ms.to_be_bytes());
                }
                FieldTier::Palette => buf[19] = self.palette,
                FieldTier::Timebase => {
                    buf[24] = self.follow_up as u8;
                    buf[25..29].copy_from_slice(&self.timebase_ms.to_be_bytes());
                }
                FieldTier::TertiaryColor => {
                    buf[20] = self.colors[2].r;
                    buf[21] = self.colors[2].g;
                    buf[22] = self.colors[2].b;
                    buf[23] = self.colors[2].w;
                }
                FieldTier::SystemTime => {
                    buf[29] = self.time_source_rank;
                    buf[30..34].copy_from_slice(&self.unix_sec.to_be_bytes());
                    buf[34..36].copy_from_slice(&self.unix_ms.to_be_bytes());
                }
                FieldTier::SyncGroups => buf[36] = self.groups,
                FieldTier::Cct => {
                    buf[37] = self.cct_kind;
                    buf[38] = self.cct;
                }
                FieldTier::Segments => {
                    buf[39] = self.segments.len() as u8;
                    buf[40] = SEGMENT_RECORD_LEN as u8;
                    for (i, seg) in self.segments.iter().enumerate() {
                        let ofs = SYNC_HEADER_LEN + i * SEGMENT_RECORD_LEN;
                        seg.write(&mut buf[ofs..ofs + SEGMENT_RECORD_LEN]);
                    }
                }
            }
        }

        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSyncFields {
    pub source_rank: u8,
    pub sec: u32,
    pub ms: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CctSync {
    /// 0: `value` is a raw 0-255 value, 255: invalid, 1-254: Kelvin MSB.
    pub kind: u8,
    pub value: u8,
}

impl CctSync {
    /// Resolve to a 0-255 CCT value, converting from Kelvin when the kind
    /// byte carries the Kelvin MSB. Returns `None` when marked invalid.
    pub fn resolve(&self) -> Option<u8> {
        match self.kind {
            0 => Some(self.value),
            255 => None,
            msb => {
                let kelvin = ((msb as u16) << 8) | self.value as u16;
                Some((kelvin.saturating_sub(1900) >> 5) as u8)
            }
        }
    }
}

/// A decoded inbound sync packet. Field groups the sender's version does
/// not define are `None`; the receiver keeps its prior values for those.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SyncUpdate {
    pub version: u8,
    pub call_mode: u8,
    pub brightness: u8,
    pub primary_rgb: [u8; 3],
    pub nightlight_active: bool,
    pub nightlight_delay_mins: u8,
    pub effect_mode: u8,
    pub effect_speed: u8,
    pub white: Option<u8>,
    pub secondary: Option<Rgbw>,
    pub effect_intensity: Option<u8>,
    pub transition_delay_ms: Option<u16>,
    pub palette: Option<u8>,
    pub follow_up: Option<bool>,
    pub timebase_ms: Option<u32>,
    pub tertiary: Option<Rgbw>,
    pub time: Option<TimeSyncFields>,
    pub groups: Option<u8>,
    pub cct: Option<CctSync>,
    pub segments: Option<Vec<SegmentSync>>,
}

impl SyncUpdate {
    /// Decode a sync packet. The caller has already routed on the leading
    /// byte; this reads the version byte and then exactly the field tiers
    /// that version unlocks, verifying the packet is long enough for each.
    /// No bytes past the declared tiers are touched.
    pub fn decode(data: &[u8]) -> Result<SyncUpdate, DecodeError> {
        if data.len() < SYNC_BASE_LEN {
            return Err(DecodeError::Truncated {
                need: SYNC_BASE_LEN,
                got: data.len(),
                version: 0,
            });
        }

        let version = data[11];
        if version >= CUSTOM_VERSION_MIN {
            return Err(DecodeError::UnsupportedVersion(version));
        }

        let mut up = SyncUpdate {
            version,
            call_mode: data[1],
            brightness: data[2],
            primary_rgb: [data[3], data[4], data[5]],
            nightlight_active: data[6] != 0,
            nightlight_delay_mins: data[7],
            effect_mode: data[8],
            effect_speed: data[9],
            ..SyncUpdate::default()
        };

        for &(min, need, tier) in FIELD_TIERS {
            if version < min {
                continue;
            }
            if data.len() < need {
                return Err(DecodeError::Truncated {
                    need,
                    got: data.len(),
                    version,
                });
            }
            match tier {
                FieldTier::White => up.white = Some(data[10]),
                FieldTier::SecondaryColor => {
                    up.secondary = Some(Rgbw::new(data[12], data[13], data[14], data[15]));
                }
                FieldTier::EffectIntensity => up.effect_intensity = Some(data[16]),
                FieldTier::TransitionDelay => {
                    up.transition_delay_ms = Some(u16::from_be_bytes([data[17], data[18]]));
                }
                FieldTier::Palette => up.palette = Some(data[19]),
                FieldTier::Timebase => {
                    up.follow_up = Some(data[24] != 0);
                    up.timebase_ms =
                        Some(u32::from_be_bytes([data[25], data[26], data[27], data[28]]));
                }
                FieldTier::TertiaryColor => {
                    up.tertiary = Some(Rgbw::new(data[20], data[21], data[22], data[23]));
                }
                FieldTier::SystemTime => {
                    up.time = Some(TimeSyncFields {
                        source_rank: data[29],
                        sec: u32::from_be_bytes([data[30], data[31], data[32], data[33]]),
                        ms: u16::from_be_bytes([data[34], data[35]]),
                    });
                }
                FieldTier::SyncGroups => up.groups = Some(data[36]),
                FieldTier::Cct => {
                    up.cct = Some(CctSync {
                        kind: data[37],
                        value: data[38],
                    });
                }
                FieldTier::Segments => {
                    up.segments = Some(Self::read_segments(data));
                }
            }
        }

        Ok(up)
    }

    /// Parse the self-describing segment table: only records physically
    /// present in the packet are read, and records shorter than the known
    /// layout are skipped entirely.
    fn read_segments(data: &[u8]) -> Vec<SegmentSync> {
        let declared = data[39] as usize;
        let stride = data[40] as usize;
        if stride < SEGMENT_RECORD_LEN {
            return Vec::new();
        }
        let mut segs = Vec::new();
        for i in 0..declared {
            let ofs = SYNC_HEADER_LEN + i * stride;
            if ofs + stride > data.len() {
                break;
            }
            segs.push(SegmentSync::read(&data[ofs..ofs + SEGMENT_RECORD_LEN]));
        }
        segs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> SyncPacket {
        SyncPacket {
            call_mode: CallMode::DirectChange as u8,
            brightness: 128,
            colors: [
                Rgbw::new(255, 160, 0, 40),
                Rgbw::new(0, 0, 255, 0),
                Rgbw::new(10, 20, 30, 40),
            ],
            nightlight_active: true,
            nightlight_delay_mins: 60,
            effect_mode: 42,
            effect_speed: 200,
            effect_intensity: 90,
            transition_delay_ms: 700,
            palette: 5,
            follow_up: false,
            timebase_ms: 0xDEAD_BEEF,
            time_source_rank: 32,
            unix_sec: 1_700_000_000,
            unix_ms: 512,
            groups: 0x03,
            cct_kind: 0,
            cct: 127,
            segments: vec![
                SegmentSync {
                    id: 0,
                    start: 0,
                    stop: 150,
                    grouping: 1,
                    spacing: 0,
                    offset: 0,
                    options: 0b0101,
                    opacity: 255,
                    mode: 42,
                    speed: 200,
                    intensity: 90,
                    palette: 5,
                    colors: [
                        Rgbw::new(255, 160, 0, 40),
                        Rgbw::new(0, 0, 255, 0),
                        Rgbw::new(10, 20, 30, 40),
                    ],
                    cct: 127,
                },
                SegmentSync {
                    id: 1,
                    start: 150,
                    stop: 300,
                    grouping: 2,
                    spacing: 1,
                    offset: 10,
                    options: 0b0011,
                    opacity: 128,
                    mode: 7,
                    speed: 100,
                    intensity: 255,
                    palette: 11,
                    colors: [Rgbw::default(); 3],
                    cct: 255,
                },
            ],
        }
    }

    #[test]
    fn current_version_roundtrip() {
        let packet = sample_packet();
        let wire = packet.encode();
        assert_eq!(wire.len(), SYNC_HEADER_LEN + 2 * SEGMENT_RECORD_LEN);

        let up = SyncUpdate::decode(&wire).unwrap();
        assert_eq!(up.version, SYNC_VERSION);
        assert_eq!(up.brightness, 128);
        assert_eq!(up.primary_rgb, [255, 160, 0]);
        assert_eq!(up.white, Some(40));
        assert_eq!(up.secondary, Some(Rgbw::new(0, 0, 255, 0)));
        assert_eq!(up.tertiary, Some(Rgbw::new(10, 20, 30, 40)));
        assert_eq!(up.effect_intensity, Some(90));
        assert_eq!(up.transition_delay_ms, Some(700));
        assert_eq!(up.palette, Some(5));
        assert_eq!(up.timebase_ms, Some(0xDEAD_BEEF));
        assert_eq!(up.groups, Some(0x03));
        let time = up.time.unwrap();
        assert_eq!(time.source_rank, 32);
        assert_eq!(time.sec, 1_700_000_000);
        assert_eq!(time.ms, 512);
        assert_eq!(up.cct.unwrap().resolve(), Some(127));
        let segs = up.segments.unwrap();
        assert_eq!(segs, packet.segments);
    }

    #[test]
    fn every_version_roundtrips_its_own_fields() {
        let packet = sample_packet();
        for version in 0..=SYNC_VERSION {
            let wire = packet.encode_with_version(version);
            let up = SyncUpdate::decode(&wire)
                .unwrap_or_else(|e| panic!("version {version}: {e}"));
            assert_eq!(up.version, version);
            assert_eq!(up.brightness, 128);
            assert_eq!(up.white.is_some(), version >= 1);
            assert_eq!(up.secondary.is_some(), version >= 2);
            assert_eq!(up.effect_intensity.is_some(), version >= 3);
            assert_eq!(up.transition_delay_ms.is_some(), version >= 4);
            assert_eq!(up.palette.is_some(), version >= 5);
            assert_eq!(up.timebase_ms.is_some(), version >= 6);
            assert_eq!(up.tertiary.is_some(), version >= 7);
            assert_eq!(up.time.is_some(), version >= 8);
            assert_eq!(up.groups.is_some(), version >= 9);
            assert_eq!(up.cct.is_some(), version >= 10);
            assert_eq!(up.segments.is_some(), version >= 11);
        }
    }

    #[test]
    fn encoded_length_matches_version_table() {
        let mut packet = sample_packet();
        packet.segments.clear();
        for (version, expect) in [
            (0u8, 12usize),
            (1, 12),
            (2, 16),
            (3, 17),
            (4, 19),
            (5, 20),
            (6, 29),
            (7, 29),
            (8, 36),
            (9, 37),
            (10, 39),
            (11, 41),
        ] {
            assert_eq!(packet.encode_with_version(version).len(), expect, "v{version}");
        }
    }

    #[test]
    fn version_zero_exposes_only_base_fields() {
        let wire = sample_packet().encode_with_version(0);
        let up = SyncUpdate::decode(&wire).unwrap();
        assert_eq!(up.brightness, 128);
        assert_eq!(up.primary_rgb, [255, 160, 0]);
        assert!(up.white.is_none());
        assert!(up.secondary.is_none());
        assert!(up.tertiary.is_none());
        assert!(up.time.is_none());
        assert!(up.timebase_ms.is_none());
        assert!(up.segments.is_none());
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let wire = sample_packet().encode();
        // Shorter than the base header.
        assert!(matches!(
            SyncUpdate::decode(&wire[..8]),
            Err(DecodeError::Truncated { .. })
        ));
        // Declares v11 but ends inside the fixed header.
        assert!(matches!(
            SyncUpdate::decode(&wire[..30]),
            Err(DecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn custom_versions_are_rejected() {
        let mut wire = sample_packet().encode();
        wire[11] = 200;
        assert_eq!(
            SyncUpdate::decode(&wire),
            Err(DecodeError::UnsupportedVersion(200))
        );
        wire[11] = 255;
        assert_eq!(
            SyncUpdate::decode(&wire),
            Err(DecodeError::UnsupportedVersion(255))
        );
    }

    #[test]
    fn segment_table_shorter_than_declared_parses_partially() {
        let packet = sample_packet();
        let wire = packet.encode();
        // Chop off the second segment record; the count byte still says 2.
        let cut = &wire[..SYNC_HEADER_LEN + SEGMENT_RECORD_LEN];
        let up = SyncUpdate::decode(cut).unwrap();
        let segs = up.segments.unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0], packet.segments[0]);
    }

    #[test]
    fn unknown_smaller_segment_record_is_skipped() {
        let mut wire = sample_packet().encode();
        wire[40] = 10; // record size below the known layout
        let up = SyncUpdate::decode(&wire).unwrap();
        assert_eq!(up.segments, Some(Vec::new()));
    }

    #[test]
    fn oversized_segment_stride_skips_unknown_trailer() {
        // A future sender with 30-byte records: known 28 bytes parse, the
        // extra trailer bytes are stepped over.
        let packet = sample_packet();
        let mut wire = packet.encode_with_version(10);
        wire[11] = 11;
        wire.resize(SYNC_HEADER_LEN, 0);
        wire[39] = 2;
        wire[40] = 30;
        for seg in &packet.segments {
            let mut rec = [0u8; 30];
            seg.write(&mut rec[..SEGMENT_RECORD_LEN]);
            wire.extend_from_slice(&rec);
        }
        let up = SyncUpdate::decode(&wire).unwrap();
        assert_eq!(up.segments.unwrap(), packet.segments);
    }

    #[test]
    fn cct_kelvin_conversion() {
        assert_eq!(CctSync { kind: 0, value: 200 }.resolve(), Some(200));
        assert_eq!(CctSync { kind: 255, value: 200 }.resolve(), None);
        // 0x0AF0 = 2800 K -> (2800 - 1900) >> 5 = 28
        assert_eq!(CctSync { kind: 0x0A, value: 0xF0 }.resolve(), Some(28));
    }

    #[test]
    fn call_mode_byte_mapping() {
        assert_eq!(CallMode::from_u8(1), Some(CallMode::DirectChange));
        assert_eq!(CallMode::from_u8(12), Some(CallMode::ButtonPreset));
        assert_eq!(CallMode::from_u8(99), None);
    }
}
