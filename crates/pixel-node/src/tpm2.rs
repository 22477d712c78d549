//! TPM2.NET frame reassembly. A logical frame may span several datagrams;
//! pixels are written positionally from each packet's number, so packets
//! arriving out of order still land in the right place (there is no
//! reordering buffer — the wire format assumes a single consumer).

use pixel_protocol::packets::Tpm2Data;
use tracing::trace;

use crate::device::PixelOutput;
use crate::realtime::PixelMapper;

#[derive(Debug, Default)]
pub struct Tpm2Assembler {
    /// Packets received for the frame in progress.
    received: u16,
    /// Per-packet payload size, captured from the frame's first packet.
    frame_size: u16,
}

impl Tpm2Assembler {
    /// Feed one data packet; writes its pixels into the strip. Returns
    /// true when the frame is complete and a display flush is due; the
    /// counter resets for the next frame.
    pub fn ingest(
        &mut self,
        data: &Tpm2Data,
        mapper: &PixelMapper,
        strip: &mut dyn PixelOutput,
    ) -> bool {
        self.received += 1;
        if self.received == 1 {
            self.frame_size = data.frame_size;
        }

        let mut id = (self.frame_size as u32 / 3) * data.packet_num.saturating_sub(1) as u32;
        for rgb in data.payload.chunks_exact(3) {
            if id as usize >= strip.len() {
                break;
            }
            mapper.set(strip, id as u16, [rgb[0], rgb[1], rgb[2], 0]);
            id += 1;
        }

        trace!(
            packet = data.packet_num,
            of = data.num_packets,
            received = self.received,
            "TPM2.NET data packet applied"
        );

        if self.received >= data.num_packets as u16 {
            self.received = 0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryStrip;
    use pixel_protocol::packets::{TPM2_FRAME_MARKER, TPM2_TYPE_DATA};

    fn packet(frame_size: u16, packet_num: u8, num_packets: u8, payload: &[u8]) -> Vec<u8> {
        let mut buf = vec![TPM2_FRAME_MARKER, TPM2_TYPE_DATA];
        buf.extend_from_slice(&frame_size.to_be_bytes());
        buf.push(packet_num);
        buf.push(num_packets);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn three_packet_frame_flushes_once_and_spans_contiguously() {
        let mut asm = Tpm2Assembler::default();
        let mapper = PixelMapper::new(0, false);
        let mut strip = MemoryStrip::new(6);

        // 6 pixels split as 2 per packet, 6 bytes payload each.
        let payloads: [Vec<u8>; 3] = [
            vec![1, 1, 1, 2, 2, 2],
            vec![3, 3, 3, 4, 4, 4],
            vec![5, 5, 5, 6, 6, 6],
        ];

        let mut flushes = 0;
        for (i, payload) in payloads.iter().enumerate() {
            let wire = packet(6, i as u8 + 1, 3, payload);
            let data = Tpm2Data::parse(&wire).unwrap();
            if asm.ingest(&data, &mapper, &mut strip) {
                strip.show();
                flushes += 1;
            }
        }

        assert_eq!(flushes, 1);
        assert_eq!(strip.shows(), 1);
        for (i, expect) in (1u8..=6).enumerate() {
            assert_eq!(strip.pixel(i), [expect, expect, expect, 0], "pixel {i}");
        }
    }

    #[test]
    fn counter_resets_for_the_next_frame() {
        let mut asm = Tpm2Assembler::default();
        let mapper = PixelMapper::new(0, false);
        let mut strip = MemoryStrip::new(2);

        let wire = packet(6, 1, 1, &[9, 9, 9, 8, 8, 8]);
        let data = Tpm2Data::parse(&wire).unwrap();
        assert!(asm.ingest(&data, &mapper, &mut strip));
        // A fresh frame with a different size re-captures it.
        let wire = packet(3, 1, 1, &[7, 7, 7]);
        let data = Tpm2Data::parse(&wire).unwrap();
        assert!(asm.ingest(&data, &mapper, &mut strip));
        assert_eq!(strip.pixel(0), [7, 7, 7, 0]);
    }

    #[test]
    fn writes_past_the_strip_are_dropped() {
        let mut asm = Tpm2Assembler::default();
        let mapper = PixelMapper::new(0, false);
        let mut strip = MemoryStrip::new(1);

        let wire = packet(6, 1, 1, &[1, 1, 1, 2, 2, 2]);
        let data = Tpm2Data::parse(&wire).unwrap();
        asm.ingest(&data, &mapper, &mut strip);
        assert_eq!(strip.pixel(0), [1, 1, 1, 0]);
    }

    #[test]
    fn out_of_order_packets_land_positionally() {
        let mut asm = Tpm2Assembler::default();
        let mapper = PixelMapper::new(0, false);
        let mut strip = MemoryStrip::new(4);

        // Packet 2 of 2 arrives first; its pixels still land at index 2.
        let wire = packet(6, 2, 2, &[5, 5, 5, 6, 6, 6]);
        let data = Tpm2Data::parse(&wire).unwrap();
        assert!(!asm.ingest(&data, &mapper, &mut strip));
        assert_eq!(strip.pixel(2), [5, 5, 5, 0]);

        let wire = packet(6, 1, 2, &[1, 1, 1, 2, 2, 2]);
        let data = Tpm2Data::parse(&wire).unwrap();
        assert!(asm.ingest(&data, &mapper, &mut strip));
        assert_eq!(strip.pixel(0), [1, 1, 1, 0]);
    }
}
