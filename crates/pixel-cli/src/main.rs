/// Pixelnet test-traffic generator.
///
/// Drives a controller from the sender side of every wire format it
/// understands: sync notifications at any compatibility version, indexed
/// realtime frames, TPM2.NET multi-packet frames, node announcements, and
/// DDP streams.
///
/// Usage:
///   pixel-cli notify --brightness 200 --color ff8800
///   pixel-cli realtime --format drgb --color 00ff40 --count 60
///   pixel-cli tpm2 --pixels 90 --packets 3 --color 2040ff
///   pixel-cli announce --name "bench rig" --unit 42
///   pixel-cli ddp --target 10.0.0.23 --pixels 500 --color ffffff

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use pixel_protocol::ddp::{self, SequenceCounter, DDP_DEFAULT_PORT};
use pixel_protocol::packets::{
    NodeAnnounce, RealtimeFormat, NODE_TYPE_CONTROLLER, TPM2_FRAME_MARKER, TPM2_TYPE_DATA,
    TPM2_TYPE_POLL,
};
use pixel_protocol::sync::{Rgbw, SyncPacket, SYNC_VERSION};
use pixel_protocol::{DEFAULT_INFO_PORT, DEFAULT_SYNC_PORT};

#[derive(Parser, Debug)]
#[command(name = "pixel-cli", about = "Pixelnet sync test-traffic generator")]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Destination address (port defaults per command)
    #[arg(short, long, default_value = "255.255.255.255", global = true)]
    target: String,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Broadcast a sync notification
    Notify {
        /// Compatibility version to emit (0..=11)
        #[arg(long, default_value_t = SYNC_VERSION)]
        version: u8,
        #[arg(short, long, default_value_t = 128)]
        brightness: u8,
        /// Primary color as RRGGBB hex
        #[arg(short, long, default_value = "ff8800")]
        color: String,
        /// Sync group bitmask
        #[arg(short, long, default_value_t = 1)]
        groups: u8,
    },
    /// Send indexed realtime pixel frames
    Realtime {
        /// warls | drgb | drgbw | dnrgb | dnrgbw
        #[arg(short, long, default_value = "drgb")]
        format: String,
        #[arg(short, long, default_value = "00ff40")]
        color: String,
        /// Pixels per frame
        #[arg(short = 'n', long, default_value_t = 60)]
        count: u16,
        /// Start index (dnrgb/dnrgbw only)
        #[arg(long, default_value_t = 0)]
        start: u16,
        /// Lock duration in seconds; 0 releases the lock
        #[arg(short, long, default_value_t = 2)]
        seconds: u8,
        /// Frames to send
        #[arg(long, default_value_t = 1)]
        frames: u32,
        /// Frame rate when sending more than one frame
        #[arg(long, default_value_t = 30)]
        fps: u64,
    },
    /// Send a TPM2.NET frame split across packets, or a poll
    Tpm2 {
        #[arg(short, long, default_value_t = 90)]
        pixels: u16,
        #[arg(long, default_value_t = 3)]
        packets: u8,
        #[arg(short, long, default_value = "2040ff")]
        color: String,
        /// Send a poll request instead of frame data
        #[arg(long)]
        poll: bool,
    },
    /// Broadcast a node announcement
    Announce {
        #[arg(short, long, default_value = "pixel-cli")]
        name: String,
        #[arg(short, long, default_value_t = 250)]
        unit: u8,
        #[arg(long, default_value_t = 0)]
        build: u32,
    },
    /// Stream a solid color to a DDP receiver
    Ddp {
        #[arg(short, long, default_value_t = 500)]
        pixels: u16,
        #[arg(short, long, default_value = "ffffff")]
        color: String,
        #[arg(short, long, default_value_t = 255)]
        brightness: u8,
        #[arg(long, default_value_t = 1)]
        frames: u32,
        #[arg(long, default_value_t = 30)]
        fps: u64,
    },
}

fn create_sender() -> anyhow::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

fn parse_color(hex: &str) -> anyhow::Result<[u8; 3]> {
    let hex = hex.trim_start_matches('#');
    if hex.len() != 6 {
        bail!("color must be RRGGBB hex, got {hex:?}");
    }
    let value = u32::from_str_radix(hex, 16).context("invalid hex color")?;
    Ok([(value >> 16) as u8, (value >> 8) as u8, value as u8])
}

fn dest(target: &str, default_port: u16) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let ip: IpAddr = target.parse().context("invalid target address")?;
    Ok(SocketAddr::new(ip, default_port))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let socket = UdpSocket::from_std(create_sender()?)?;

    match args.command {
        Command::Notify {
            version,
            brightness,
            color,
            groups,
        } => {
            if version > SYNC_VERSION {
                bail!("compatibility version {version} not supported (max {SYNC_VERSION})");
            }
            let [r, g, b] = parse_color(&color)?;
            let packet = SyncPacket {
                call_mode: 1, // direct change
                brightness,
                colors: [Rgbw::new(r, g, b, 0), Rgbw::default(), Rgbw::default()],
                groups,
                cct_kind: 255,
                ..SyncPacket::default()
            };
            let wire = packet.encode_with_version(version);
            let to = dest(&args.target, DEFAULT_SYNC_PORT)?;
            socket.send_to(&wire, to).await?;
            println!("sent v{version} sync notification ({} bytes) to {to}", wire.len());
        }

        Command::Realtime {
            format,
            color,
            count,
            start,
            seconds,
            frames,
            fps,
        } => {
            let format = match format.to_ascii_lowercase().as_str() {
                "warls" => RealtimeFormat::Warls,
                "drgb" => RealtimeFormat::Drgb,
                "drgbw" => RealtimeFormat::Drgbw,
                "dnrgb" => RealtimeFormat::Dnrgb,
                "dnrgbw" => RealtimeFormat::Dnrgbw,
                other => bail!("unknown realtime format {other:?}"),
            };
            let [r, g, b] = parse_color(&color)?;

            let mut wire = vec![format as u8, seconds];
            match format {
                RealtimeFormat::Warls => {
                    // Indexed tuples; one byte of index caps this at 256 pixels.
                    for i in 0..count.min(256) {
                        wire.extend_from_slice(&[i as u8, r, g, b]);
                    }
                }
                RealtimeFormat::Drgb => {
                    for _ in 0..count {
                        wire.extend_from_slice(&[r, g, b]);
                    }
                }
                RealtimeFormat::Drgbw => {
                    for _ in 0..count {
                        wire.extend_from_slice(&[r, g, b, 0]);
                    }
                }
                RealtimeFormat::Dnrgb | RealtimeFormat::Dnrgbw => {
                    wire.extend_from_slice(&start.to_be_bytes());
                    let rgbw = format == RealtimeFormat::Dnrgbw;
                    for _ in 0..count {
                        wire.extend_from_slice(&[r, g, b]);
                        if rgbw {
                            wire.push(0);
                        }
                    }
                }
            }

            let to = dest(&args.target, DEFAULT_SYNC_PORT)?;
            let mut ticker = tokio::time::interval(Duration::from_millis(1000 / fps.max(1)));
            for _ in 0..frames {
                ticker.tick().await;
                socket.send_to(&wire, to).await?;
            }
            println!(
                "sent {frames} {:?} frame(s), {count} pixels, lock {seconds}s, to {to}",
                format
            );
        }

        Command::Tpm2 { pixels, packets, color, poll } => {
            let to = dest(&args.target, DEFAULT_SYNC_PORT)?;
            if poll {
                socket.send_to(&[TPM2_FRAME_MARKER, TPM2_TYPE_POLL], to).await?;
                println!("sent TPM2.NET poll to {to}");
                return Ok(());
            }

            let [r, g, b] = parse_color(&color)?;
            let packets = packets.max(1);
            let per_packet = (pixels as usize).div_ceil(packets as usize);
            let frame_size = (per_packet * 3) as u16;

            for n in 1..=packets {
                let mut wire = vec![TPM2_FRAME_MARKER, TPM2_TYPE_DATA];
                wire.extend_from_slice(&frame_size.to_be_bytes());
                wire.push(n);
                wire.push(packets);
                for _ in 0..per_packet {
                    wire.extend_from_slice(&[r, g, b]);
                }
                socket.send_to(&wire, to).await?;
            }
            println!("sent TPM2.NET frame: {pixels} pixels over {packets} packet(s) to {to}");
        }

        Command::Announce { name, unit, build } => {
            let announce = NodeAnnounce {
                ip: [0, 0, 0, unit],
                name,
                node_type: NODE_TYPE_CONTROLLER,
                unit_id: unit,
                build,
            };
            let mut wire = Vec::with_capacity(NodeAnnounce::LEN);
            announce.serialize(&mut wire);
            let to = dest(&args.target, DEFAULT_INFO_PORT)?;
            socket.send_to(&wire, to).await?;
            println!("sent announcement for unit {unit} to {to}");
        }

        Command::Ddp {
            pixels,
            color,
            brightness,
            frames,
            fps,
        } => {
            let [r, g, b] = parse_color(&color)?;
            let mut buffer = Vec::with_capacity(pixels as usize * 3);
            for _ in 0..pixels {
                buffer.extend_from_slice(&[r, g, b]);
            }

            let to = dest(&args.target, DDP_DEFAULT_PORT)?;
            let mut seq = SequenceCounter::new();
            let mut ticker = tokio::time::interval(Duration::from_millis(1000 / fps.max(1)));
            let mut sent_chunks = 0usize;
            for _ in 0..frames {
                ticker.tick().await;
                let chunks =
                    ddp::encode_frame(&mut seq, pixels as usize, &buffer, brightness, false);
                for chunk in chunks {
                    socket.send_to(&chunk, to).await?;
                    sent_chunks += 1;
                }
            }
            println!("sent {frames} DDP frame(s), {sent_chunks} chunk(s), to {to}");
        }
    }

    Ok(())
}
