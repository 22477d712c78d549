//! The device model and the seams to the rest of the firmware: the pixel
//! strip, and the opaque text/JSON state API. The sync layer only mutates
//! these through the traits here, so tests can observe every write.

use pixel_protocol::sync::Rgbw;
use tracing::debug;

// Segment option bits (low nibble of the wire byte).
pub const SEG_OPTION_SELECTED: u8 = 0x01;
pub const SEG_OPTION_REVERSED: u8 = 0x02;
pub const SEG_OPTION_ON: u8 = 0x04;
pub const SEG_OPTION_MIRRORED: u8 = 0x08;

/// A contiguous addressable sub-range of the output with its own effect
/// and color settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub start: u16,
    pub stop: u16,
    pub grouping: u8,
    pub spacing: u8,
    pub offset: u16,
    pub options: u8,
    pub opacity: u8,
    pub mode: u8,
    pub speed: u8,
    pub intensity: u8,
    pub palette: u8,
    pub colors: [Rgbw; 3],
    pub cct: u8,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            start: 0,
            stop: 0,
            grouping: 1,
            spacing: 0,
            offset: 0,
            options: SEG_OPTION_SELECTED | SEG_OPTION_ON,
            opacity: 255,
            mode: 0,
            speed: 128,
            intensity: 128,
            palette: 0,
            colors: [Rgbw::default(); 3],
            cct: 127,
        }
    }
}

impl Segment {
    pub fn is_active(&self) -> bool {
        self.stop > self.start
    }

    pub fn is_selected(&self) -> bool {
        self.options & SEG_OPTION_SELECTED != 0
    }
}

/// Live visual state of this controller. Mutated only from the tick path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub brightness: u8,
    /// Last nonzero user brightness, restored when a realtime lock raises
    /// a dark strip.
    pub brightness_last: u8,
    /// Primary, secondary, tertiary color of the main segment.
    pub colors: [Rgbw; 3],
    pub cct: u8,
    pub effect_mode: u8,
    pub effect_speed: u8,
    pub effect_intensity: u8,
    pub palette: u8,
    pub transition_delay_ms: u16,
    pub nightlight_active: bool,
    pub nightlight_delay_mins: u8,
    /// Offset added to the millisecond clock for effect phase sync.
    pub timebase_ms: u32,
    pub segments: Vec<Segment>,
    pub mode_count: u8,
    pub palette_count: u8,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            brightness: 128,
            brightness_last: 128,
            colors: [Rgbw::new(255, 160, 0, 0), Rgbw::default(), Rgbw::default()],
            cct: 127,
            effect_mode: 0,
            effect_speed: 128,
            effect_intensity: 128,
            palette: 0,
            transition_delay_ms: 700,
            nightlight_active: false,
            nightlight_delay_mins: 60,
            timebase_ms: 0,
            segments: vec![Segment {
                stop: 300,
                ..Segment::default()
            }],
            mode_count: 187,
            palette_count: 71,
        }
    }
}

/// The physical pixel strip. Writes are raw; clipping and gamma happen in
/// the realtime pixel mapper before this trait is reached.
pub trait PixelOutput {
    fn len(&self) -> usize;
    fn set_pixel(&mut self, index: usize, r: u8, g: u8, b: u8, w: u8);
    /// Latch the buffer to the LEDs.
    fn show(&mut self);
    fn set_brightness(&mut self, brightness: u8);
}

/// Opaque handlers for API requests arriving over the sync socket.
pub trait ApiIngest {
    fn handle_text(&mut self, request: &str);
    fn handle_json(&mut self, state: serde_json::Value);
}

/// In-memory strip backing the daemon (and the tests): pixel writes land
/// in a plain buffer the render loop reads after the tick.
#[derive(Debug)]
pub struct MemoryStrip {
    pixels: Vec<[u8; 4]>,
    brightness: u8,
    shows: u64,
}

impl MemoryStrip {
    pub fn new(length: usize) -> Self {
        Self {
            pixels: vec![[0; 4]; length],
            brightness: 255,
            shows: 0,
        }
    }

    pub fn pixel(&self, index: usize) -> [u8; 4] {
        self.pixels[index]
    }

    pub fn brightness(&self) -> u8 {
        self.brightness
    }

    /// Number of show() calls so far.
    pub fn shows(&self) -> u64 {
        self.shows
    }

    /// Flat RGB(W) view for the outbound stream encoder.
    pub fn channel_bytes(&self, rgbw: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.pixels.len() * if rgbw { 4 } else { 3 });
        for px in &self.pixels {
            out.extend_from_slice(&px[..if rgbw { 4 } else { 3 }]);
        }
        out
    }
}

impl PixelOutput for MemoryStrip {
    fn len(&self) -> usize {
        self.pixels.len()
    }

    fn set_pixel(&mut self, index: usize, r: u8, g: u8, b: u8, w: u8) {
        if let Some(px) = self.pixels.get_mut(index) {
            *px = [r, g, b, w];
        }
    }

    fn show(&mut self) {
        self.shows += 1;
    }

    fn set_brightness(&mut self, brightness: u8) {
        self.brightness = brightness;
    }
}

/// Default API sink: the real state handlers live elsewhere in the
/// firmware; the daemon surfaces what arrived and flags that device state
/// may have changed, which is what arms an outbound notification.
#[derive(Debug, Default)]
pub struct LoggingApi {
    changed: bool,
}

impl LoggingApi {
    pub fn take_changed(&mut self) -> bool {
        std::mem::take(&mut self.changed)
    }
}

impl ApiIngest for LoggingApi {
    fn handle_text(&mut self, request: &str) {
        debug!(request, "text API request via sync socket");
        self.changed = true;
    }

    fn handle_json(&mut self, state: serde_json::Value) {
        debug!(%state, "JSON state update via sync socket");
        self.changed = true;
    }
}
