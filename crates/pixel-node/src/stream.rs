//! Outbound realtime streaming: push the current pixel buffer to another
//! display over the network. Invoked by the render path on demand; one
//! call emits a whole frame, so the shared sequence counter never
//! interleaves between frames.

use std::net::{IpAddr, SocketAddr};

use anyhow::Context;
use pixel_protocol::ddp::{self, SequenceCounter, DDP_DEFAULT_PORT};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

/// Outbound stream protocols. E1.31 and Art-Net are accepted so callers
/// can select them ahead of support, but currently transmit nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamProtocol {
    Ddp,
    E131,
    ArtNet,
}

impl StreamProtocol {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "ddp" => Some(Self::Ddp),
            "e131" | "e1.31" => Some(Self::E131),
            "artnet" | "art-net" => Some(Self::ArtNet),
            _ => None,
        }
    }
}

/// Send one frame of `pixel_count` pixels to `client`. A chunk that fails
/// to send aborts the rest of the frame; the caller may at most log the
/// error — there is no retry.
pub async fn realtime_broadcast(
    protocol: StreamProtocol,
    seq: &mut SequenceCounter,
    socket: &UdpSocket,
    client: IpAddr,
    pixel_count: usize,
    buffer: &[u8],
    brightness: u8,
    rgbw_source: bool,
) -> anyhow::Result<()> {
    match protocol {
        StreamProtocol::Ddp => {
            let chunks = ddp::encode_frame(seq, pixel_count, buffer, brightness, rgbw_source);
            let dest = SocketAddr::new(client, DDP_DEFAULT_PORT);
            let total = chunks.len();
            for (i, chunk) in chunks.into_iter().enumerate() {
                socket.send_to(&chunk, dest).await.with_context(|| {
                    format!("DDP chunk {}/{} to {} failed", i + 1, total, dest)
                })?;
            }
            debug!(%dest, chunks = total, pixels = pixel_count, "DDP frame sent");
            Ok(())
        }
        StreamProtocol::E131 | StreamProtocol::ArtNet => {
            warn!(?protocol, "stream protocol not implemented, frame skipped");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_names_parse() {
        assert_eq!(StreamProtocol::from_name("ddp"), Some(StreamProtocol::Ddp));
        assert_eq!(StreamProtocol::from_name("DDP"), Some(StreamProtocol::Ddp));
        assert_eq!(StreamProtocol::from_name("e1.31"), Some(StreamProtocol::E131));
        assert_eq!(
            StreamProtocol::from_name("art-net"),
            Some(StreamProtocol::ArtNet)
        );
        assert_eq!(StreamProtocol::from_name("sacn"), None);
    }
}
