mod device;
mod nodes;
mod notifier;
mod realtime;
mod receiver;
mod stream;
mod time;
mod tpm2;

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::Parser;
use serde::Deserialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use pixel_protocol::packets::{NodeAnnounce, NODE_TYPE_CONTROLLER};
use pixel_protocol::sync::CallMode;
use pixel_protocol::{DEFAULT_INFO_PORT, DEFAULT_RGB_PORT, DEFAULT_SYNC_PORT};

use crate::device::{DeviceState, LoggingApi, MemoryStrip, PixelOutput};
use crate::notifier::NotifyState;
use crate::receiver::{DeviceCtx, Reply, SocketOrigin, SyncOptions, SyncState};
use crate::stream::StreamProtocol;
use crate::time::SystemClock;

/// Firmware build tag carried in node announcements.
const BUILD: u32 = 2_508_070;

#[derive(Parser, Debug)]
#[command(name = "pixel-node", about = "Pixelnet controller sync daemon")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/node.toml")]
    config: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct NodeConfig {
    #[serde(default)]
    pub node: NodeSection,
    #[serde(default)]
    pub network: NetworkSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub realtime: RealtimeSection,
    #[serde(default)]
    pub nodes: NodesSection,
    #[serde(default)]
    pub strip: StripSection,
    #[serde(default)]
    pub stream: StreamSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeSection {
    #[serde(default = "default_name")]
    pub name: String,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            name: default_name(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_sync_port")]
    pub sync_port: u16,
    #[serde(default = "default_info_port")]
    pub info_port: u16,
    #[serde(default = "default_rgb_port")]
    pub rgb_port: u16,
    #[serde(default = "default_true")]
    pub rgb_enabled: bool,
    #[serde(default = "default_broadcast")]
    pub broadcast: String,
    /// Our own address, for discarding reflected broadcasts. Detected when
    /// empty.
    #[serde(default)]
    pub local_ip: String,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            sync_port: default_sync_port(),
            info_port: default_info_port(),
            rgb_port: default_rgb_port(),
            rgb_enabled: true,
            broadcast: default_broadcast(),
            local_ip: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_group")]
    pub groups: u8,
    #[serde(default = "default_group")]
    pub receive_groups: u8,
    #[serde(default = "default_true")]
    pub receive_notifications: bool,
    #[serde(default = "default_true")]
    pub receive_brightness: bool,
    #[serde(default = "default_true")]
    pub receive_color: bool,
    #[serde(default = "default_true")]
    pub receive_effects: bool,
    #[serde(default)]
    pub receive_segment_options: bool,
    #[serde(default)]
    pub receive_segment_bounds: bool,
    #[serde(default = "default_true")]
    pub send_on_change: bool,
    #[serde(default = "default_true")]
    pub send_on_button: bool,
    #[serde(default = "default_true")]
    pub send_on_hue: bool,
    #[serde(default = "default_true")]
    pub send_on_alexa: bool,
    #[serde(default)]
    pub notify_twice: bool,
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            groups: 1,
            receive_groups: 1,
            receive_notifications: true,
            receive_brightness: true,
            receive_color: true,
            receive_effects: true,
            receive_segment_options: false,
            receive_segment_bounds: false,
            send_on_change: true,
            send_on_button: true,
            send_on_hue: true,
            send_on_alexa: true,
            notify_twice: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_realtime_timeout")]
    pub timeout_ms: u32,
    #[serde(default)]
    pub force_max_brightness: bool,
    #[serde(default = "default_true")]
    pub gamma_correction: bool,
    #[serde(default)]
    pub offset: i16,
}

impl Default for RealtimeSection {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout_ms: default_realtime_timeout(),
            force_max_brightness: false,
            gamma_correction: true,
            offset: 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodesSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_announce_interval")]
    pub announce_interval_s: u64,
    #[serde(default = "default_age_interval")]
    pub age_interval_s: u64,
}

impl Default for NodesSection {
    fn default() -> Self {
        Self {
            enabled: true,
            announce_interval_s: default_announce_interval(),
            age_interval_s: default_age_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StripSection {
    #[serde(default = "default_strip_length")]
    pub length: usize,
    #[serde(default)]
    pub rgbw: bool,
    #[serde(default)]
    pub cct: bool,
}

impl Default for StripSection {
    fn default() -> Self {
        Self {
            length: default_strip_length(),
            rgbw: false,
            cct: false,
        }
    }
}

/// Forward the locally rendered buffer to another display.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub target: String,
    #[serde(default = "default_stream_protocol")]
    pub protocol: String,
    #[serde(default = "default_stream_fps")]
    pub fps: u64,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            enabled: false,
            target: String::new(),
            protocol: default_stream_protocol(),
            fps: default_stream_fps(),
        }
    }
}

// Default value functions
fn default_name() -> String { "Pixel Node".to_string() }
fn default_bind() -> String { "0.0.0.0".to_string() }
fn default_sync_port() -> u16 { DEFAULT_SYNC_PORT }
fn default_info_port() -> u16 { DEFAULT_INFO_PORT }
fn default_rgb_port() -> u16 { DEFAULT_RGB_PORT }
fn default_broadcast() -> String { "255.255.255.255".to_string() }
fn default_group() -> u8 { 1 }
fn default_true() -> bool { true }
fn default_realtime_timeout() -> u32 { 2500 }
fn default_announce_interval() -> u64 { 20 }
fn default_age_interval() -> u64 { 30 }
fn default_strip_length() -> usize { 300 }
fn default_stream_protocol() -> String { "ddp".to_string() }
fn default_stream_fps() -> u64 { 30 }

impl NodeConfig {
    fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            groups: self.sync.groups,
            receive_groups: self.sync.receive_groups,
            receive_notifications: self.sync.receive_notifications,
            receive_brightness: self.sync.receive_brightness,
            receive_color: self.sync.receive_color,
            receive_effects: self.sync.receive_effects,
            receive_segment_options: self.sync.receive_segment_options,
            receive_segment_bounds: self.sync.receive_segment_bounds,
            receive_direct: self.realtime.enabled,
            node_list_enabled: self.nodes.enabled,
            send_on_change: self.sync.send_on_change,
            send_on_button: self.sync.send_on_button,
            send_on_hue: self.sync.send_on_hue,
            send_on_alexa: self.sync.send_on_alexa,
            notify_twice: self.sync.notify_twice,
            realtime_timeout_ms: self.realtime.timeout_ms,
            force_max_brightness: self.realtime.force_max_brightness,
            gamma_correction: self.realtime.gamma_correction,
            realtime_offset: self.realtime.offset,
            cct_enabled: self.strip.cct,
        }
    }
}

/// Create a non-blocking UDP socket with address reuse and broadcast
/// permission, ready for the tokio reactor.
fn create_broadcast_socket(bind: Ipv4Addr, port: u16) -> std::io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    let addr = SocketAddrV4::new(bind, port);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Best-effort local address discovery: route a dummy datagram socket at a
/// public address and read back the chosen source address. Nothing is sent.
fn detect_local_ip() -> Ipv4Addr {
    let probe = || -> std::io::Result<Ipv4Addr> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("1.1.1.1:80")?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) => Ok(ip),
            IpAddr::V6(_) => Ok(Ipv4Addr::UNSPECIFIED),
        }
    };
    probe().unwrap_or(Ipv4Addr::UNSPECIFIED)
}

/// Poll one datagram without blocking; WouldBlock means the socket is idle
/// this tick.
fn poll_datagram(socket: &UdpSocket, buf: &mut [u8]) -> Option<(usize, SocketAddr)> {
    match socket.try_recv_from(buf) {
        Ok(received) => Some(received),
        Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => None,
        Err(e) => {
            warn!("socket receive error: {}", e);
            None
        }
    }
}

struct Runtime {
    config: NodeConfig,
    sync: SyncState,
    state: DeviceState,
    strip: MemoryStrip,
    clock: SystemClock,
    api: LoggingApi,
    sync_socket: UdpSocket,
    info_socket: UdpSocket,
    rgb_socket: Option<UdpSocket>,
    notify_dest: SocketAddr,
    announce_dest: SocketAddr,
    local_ip: Ipv4Addr,
    epoch: Instant,
}

impl Runtime {
    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Broadcast the full device state, subject to call-mode gating.
    async fn notify(&mut self, mode: CallMode, follow_up: bool) {
        if !follow_up && !NotifyState::should_send(&self.sync.opts, mode) {
            return;
        }
        let now_ms = self.now_ms();
        let packet = notifier::build_packet(
            &self.state,
            &self.sync.opts,
            &self.clock,
            mode as u8,
            follow_up,
            now_ms,
        );
        match self.sync_socket.send_to(&packet.encode(), self.notify_dest).await {
            Ok(_) => {
                self.sync
                    .notify
                    .mark_sent(now_ms, mode as u8, follow_up, self.sync.opts.notify_twice);
                debug!(?mode, follow_up, "sync notification sent");
            }
            Err(e) => error!("failed to send sync notification: {}", e),
        }
    }

    async fn announce(&mut self) {
        let announce = NodeAnnounce {
            ip: self.local_ip.octets(),
            name: self.config.node.name.clone(),
            node_type: NODE_TYPE_CONTROLLER,
            unit_id: self.local_ip.octets()[3],
            build: BUILD,
        };
        let mut buf = Vec::with_capacity(NodeAnnounce::LEN);
        announce.serialize(&mut buf);
        if let Err(e) = self.info_socket.send_to(&buf, self.announce_dest).await {
            error!("failed to send node announcement: {}", e);
        }
    }

    async fn send_reply(&self, reply: Reply) {
        if let Err(e) = self.sync_socket.send_to(&reply.payload, reply.to).await {
            warn!(to = %reply.to, "failed to send reply: {}", e);
        }
    }

    /// One dispatcher pass: housekeeping, then at most one datagram from
    /// the primary socket, else one from the info socket, else one from
    /// the raw-RGB socket.
    async fn tick(&mut self) {
        let now_ms = self.now_ms();

        {
            let mut dev = DeviceCtx {
                state: &mut self.state,
                strip: &mut self.strip,
                time: &mut self.clock,
                api: &mut self.api,
            };
            self.sync.tick(now_ms, &mut dev);
        }

        if let Some(mode_byte) = self.sync.notify.follow_up_due(now_ms) {
            let mode = CallMode::from_u8(mode_byte).unwrap_or(CallMode::Notification);
            self.notify(mode, true).await;
        }

        let mut buf = [0u8; 2048];
        let received = if let Some((len, src)) = poll_datagram(&self.sync_socket, &mut buf) {
            Some((SocketOrigin::Primary, len, src))
        } else if let Some((len, src)) = poll_datagram(&self.info_socket, &mut buf) {
            Some((SocketOrigin::Info, len, src))
        } else if let Some(socket) = &self.rgb_socket {
            poll_datagram(socket, &mut buf).map(|(len, src)| (SocketOrigin::RawRgb, len, src))
        } else {
            None
        };

        let Some((origin, len, src)) = received else {
            return;
        };

        let reply = {
            let mut dev = DeviceCtx {
                state: &mut self.state,
                strip: &mut self.strip,
                time: &mut self.clock,
                api: &mut self.api,
            };
            self.sync
                .handle_datagram(origin, src, &buf[..len], now_ms, &mut dev)
        };
        if let Some(reply) = reply {
            self.send_reply(reply).await;
        }

        // An API request may have changed device state; tell the peers.
        if self.api.take_changed() {
            self.notify(CallMode::DirectChange, false).await;
        }
    }

    /// Forward the current buffer to the configured stream target.
    async fn stream_frame(&mut self, protocol: StreamProtocol, target: IpAddr) {
        let buffer = self.strip.channel_bytes(self.config.strip.rgbw);
        if let Err(e) = stream::realtime_broadcast(
            protocol,
            &mut self.sync.ddp_seq,
            &self.sync_socket,
            target,
            self.strip.len(),
            &buffer,
            self.state.brightness,
            self.config.strip.rgbw,
        )
        .await
        {
            warn!("stream frame aborted: {:#}", e);
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config: NodeConfig = if args.config.exists() {
        let raw = tokio::fs::read_to_string(&args.config).await.map_err(|e| {
            error!("failed to read config file {:?}: {}", args.config, e);
            e
        })?;
        toml::from_str(&raw).map_err(|e| {
            error!("failed to parse config: {}", e);
            e
        })?
    } else {
        info!(path = ?args.config, "config file not found, using defaults");
        NodeConfig::default()
    };

    let bind: Ipv4Addr = config.network.bind.parse()?;
    let local_ip: Ipv4Addr = if config.network.local_ip.is_empty() {
        detect_local_ip()
    } else {
        config.network.local_ip.parse()?
    };

    let sync_socket = UdpSocket::from_std(create_broadcast_socket(bind, config.network.sync_port)?)?;
    let info_socket = UdpSocket::from_std(create_broadcast_socket(bind, config.network.info_port)?)?;
    let rgb_socket = if config.network.rgb_enabled {
        Some(UdpSocket::from_std(create_broadcast_socket(
            bind,
            config.network.rgb_port,
        )?)?)
    } else {
        None
    };

    let broadcast: Ipv4Addr = config.network.broadcast.parse()?;
    let notify_dest = SocketAddr::new(IpAddr::V4(broadcast), config.network.sync_port);
    let announce_dest = SocketAddr::new(IpAddr::V4(broadcast), config.network.info_port);

    info!(
        name = %config.node.name,
        %local_ip,
        sync_port = config.network.sync_port,
        info_port = config.network.info_port,
        rgb = config.network.rgb_enabled,
        "pixel-node starting"
    );

    let stream_target = if config.stream.enabled {
        let protocol = StreamProtocol::from_name(&config.stream.protocol)
            .ok_or_else(|| anyhow::anyhow!("unknown stream protocol {}", config.stream.protocol))?;
        let target: IpAddr = config.stream.target.parse()?;
        info!(?protocol, %target, fps = config.stream.fps, "stream forwarding enabled");
        Some((protocol, target))
    } else {
        None
    };

    let mut runtime = Runtime {
        sync: SyncState::new(config.sync_options(), IpAddr::V4(local_ip)),
        state: DeviceState::default(),
        strip: MemoryStrip::new(config.strip.length),
        clock: SystemClock::default(),
        api: LoggingApi::default(),
        sync_socket,
        info_socket,
        rgb_socket,
        notify_dest,
        announce_dest,
        local_ip,
        epoch: Instant::now(),
        config,
    };

    let mut tick = tokio::time::interval(Duration::from_millis(2));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut announce_timer = tokio::time::interval(Duration::from_secs(
        runtime.config.nodes.announce_interval_s.max(1),
    ));
    let mut age_timer = tokio::time::interval(Duration::from_secs(
        runtime.config.nodes.age_interval_s.max(1),
    ));
    let mut stream_timer = tokio::time::interval(Duration::from_millis(
        1000 / runtime.config.stream.fps.max(1),
    ));

    loop {
        tokio::select! {
            _ = tick.tick() => {
                runtime.tick().await;
            }
            _ = announce_timer.tick() => {
                if runtime.config.nodes.enabled {
                    runtime.announce().await;
                }
            }
            _ = age_timer.tick() => {
                runtime.sync.nodes.tick();
            }
            _ = stream_timer.tick(), if stream_target.is_some() => {
                let (protocol, target) = stream_target.unwrap();
                runtime.stream_frame(protocol, target).await;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    Ok(())
}
