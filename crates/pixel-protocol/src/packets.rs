//! Leading-byte packet identification and the smaller wire formats that
//! share the sync sockets: node announcements, TPM2.NET framing, and the
//! indexed realtime pixel formats.

// -- Leading bytes for packet identification --

/// Sync notifier packets start with a zero byte.
pub const SYNC_PACKET_TYPE: u8 = 0x00;
/// Node announcements start with `0xFF 0x01` on the info socket.
pub const ANNOUNCE_MAGIC: [u8; 2] = [0xFF, 0x01];
/// TPM2.NET frame marker.
pub const TPM2_FRAME_MARKER: u8 = 0x9C;
/// TPM2.NET sub-type: poll request, answered with [`TPM2_ACK`].
pub const TPM2_TYPE_POLL: u8 = 0xAA;
/// TPM2.NET sub-type: frame data.
pub const TPM2_TYPE_DATA: u8 = 0xDA;
/// Single-byte acknowledgement to a TPM2.NET poll.
pub const TPM2_ACK: u8 = 0xAC;
/// Fixed port TPM2.NET poll replies are sent to.
pub const TPM2_REPLY_PORT: u16 = 65442;

// -- Node type tags carried in announcements --

pub const NODE_TYPE_UNDEFINED: u8 = 0;
pub const NODE_TYPE_CONTROLLER: u8 = 32;

/// Indexed realtime pixel formats, keyed by the packet's first byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RealtimeFormat {
    /// Per-pixel (index, r, g, b) tuples.
    Warls = 1,
    /// Sequential r, g, b triplets from pixel 0.
    Drgb = 2,
    /// Sequential r, g, b, w quads from pixel 0.
    Drgbw = 3,
    /// 16-bit start index, then sequential r, g, b triplets.
    Dnrgb = 4,
    /// 16-bit start index, then sequential r, g, b, w quads.
    Dnrgbw = 5,
}

impl RealtimeFormat {
    pub fn from_byte(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Warls),
            2 => Some(Self::Drgb),
            3 => Some(Self::Drgbw),
            4 => Some(Self::Dnrgb),
            5 => Some(Self::Dnrgbw),
            _ => None,
        }
    }
}

/// What a datagram is, judged from its leading byte(s). Socket-specific
/// gating (which kinds are honored on which socket) is the dispatcher's
/// business; this is purely the byte-pattern table with an explicit
/// `Unknown` fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    SyncNotify,
    NodeAnnounce,
    Tpm2Poll,
    Tpm2Data,
    Realtime(RealtimeFormat),
    TextApi,
    JsonApi,
    Unknown,
}

impl PacketKind {
    pub fn of(data: &[u8]) -> PacketKind {
        let Some(&first) = data.first() else {
            return PacketKind::Unknown;
        };
        match first {
            SYNC_PACKET_TYPE => PacketKind::SyncNotify,
            0xFF if data.get(1) == Some(&ANNOUNCE_MAGIC[1]) => PacketKind::NodeAnnounce,
            TPM2_FRAME_MARKER => match data.get(1) {
                Some(&TPM2_TYPE_POLL) => PacketKind::Tpm2Poll,
                Some(&TPM2_TYPE_DATA) => PacketKind::Tpm2Data,
                _ => PacketKind::Unknown,
            },
            1..=5 => PacketKind::Realtime(RealtimeFormat::from_byte(first).unwrap()),
            b'A'..=b'Z' => PacketKind::TextApi,
            b'{' => PacketKind::JsonApi,
            _ => PacketKind::Unknown,
        }
    }
}

// -- Node announcement --

/// Announcement broadcast on the info socket so peers can maintain their
/// node lists. 44 bytes on the wire; the trailing build number is optional
/// for older senders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAnnounce {
    pub ip: [u8; 4],
    pub name: String,
    pub node_type: u8,
    pub unit_id: u8,
    pub build: u32,
}

impl NodeAnnounce {
    /// Announcements below this length are dropped.
    pub const MIN_LEN: usize = 40;
    /// Full length including the build number.
    pub const LEN: usize = 44;

    pub fn serialize(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&ANNOUNCE_MAGIC);
        buf.extend_from_slice(&self.ip);

        let mut name = [0u8; 32];
        let bytes = self.name.as_bytes();
        let n = bytes.len().min(32);
        name[..n].copy_from_slice(&bytes[..n]);
        buf.extend_from_slice(&name);

        buf.push(self.node_type);
        buf.push(self.unit_id);
        // Build number is little-endian on the wire, unlike the sync codec.
        buf.extend_from_slice(&self.build.to_le_bytes());
    }

    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < Self::MIN_LEN {
            return None;
        }
        if data[0..2] != ANNOUNCE_MAGIC {
            return None;
        }

        let name = String::from_utf8_lossy(&data[6..38])
            .trim_end_matches('\0')
            .trim()
            .to_string();

        let build = if data.len() >= Self::LEN {
            u32::from_le_bytes([data[40], data[41], data[42], data[43]])
        } else {
            0
        };

        Some(Self {
            ip: [data[2], data[3], data[4], data[5]],
            name,
            node_type: data[38],
            unit_id: data[39],
            build,
        })
    }
}

// -- TPM2.NET frame data --

/// One TPM2.NET data packet. A logical frame may span several of these;
/// `packet_num` is 1-based and `frame_size` declares the per-packet payload
/// size used for positional pixel indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2Data<'a> {
    pub frame_size: u16,
    pub packet_num: u8,
    pub num_packets: u8,
    pub payload: &'a [u8],
}

impl<'a> Tpm2Data<'a> {
    pub const HEADER_SIZE: usize = 6;

    pub fn parse(data: &'a [u8]) -> Option<Self> {
        if data.len() < Self::HEADER_SIZE {
            return None;
        }
        if data[0] != TPM2_FRAME_MARKER || data[1] != TPM2_TYPE_DATA {
            return None;
        }

        let frame_size = u16::from_be_bytes([data[2], data[3]]);
        let end = (Self::HEADER_SIZE + frame_size as usize).min(data.len());

        Some(Self {
            frame_size,
            packet_num: data[4],
            num_packets: data[5],
            payload: &data[Self::HEADER_SIZE..end],
        })
    }
}

// -- Indexed realtime payload iteration --

/// Iterate the pixels of an indexed realtime packet as
/// `(pixel index, [r, g, b, w])`. Trailing partial tuples are ignored.
pub fn realtime_pixels(format: RealtimeFormat, packet: &[u8]) -> RealtimePixels<'_> {
    use RealtimeFormat::*;

    let (pos, next_index) = match format {
        Warls | Drgb | Drgbw => (2, 0),
        Dnrgb | Dnrgbw => {
            let start = if packet.len() >= 4 {
                u16::from_be_bytes([packet[2], packet[3]])
            } else {
                0
            };
            (4, start)
        }
    };

    RealtimePixels {
        data: packet,
        pos,
        next_index,
        indexed: format == Warls,
        rgbw: matches!(format, Drgbw | Dnrgbw),
    }
}

pub struct RealtimePixels<'a> {
    data: &'a [u8],
    pos: usize,
    next_index: u16,
    indexed: bool,
    rgbw: bool,
}

impl Iterator for RealtimePixels<'_> {
    type Item = (u16, [u8; 4]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.indexed {
            let tuple = self.data.get(self.pos..self.pos + 4)?;
            self.pos += 4;
            return Some((tuple[0] as u16, [tuple[1], tuple[2], tuple[3], 0]));
        }

        let step = if self.rgbw { 4 } else { 3 };
        let tuple = self.data.get(self.pos..self.pos + step)?;
        self.pos += step;
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        let w = if self.rgbw { tuple[3] } else { 0 };
        Some((index, [tuple[0], tuple[1], tuple[2], w]))
    }
}
