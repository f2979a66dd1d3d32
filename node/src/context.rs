//! # Application Context
//!
//! Everything the running node needs, built once at startup and passed by
//! reference: network mode, health tracker, delivery stats, and the
//! transport selected for that mode.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::watch;
use tracing::{info, warn};

use relaynet_transport::chat::{user_id_for, HttpBackend, SledRoomStore};
use relaynet_transport::config::{
    ChatConfig, DatagramConfig, HealthConfig, MixedConfig, NetworkMode,
};
use relaynet_transport::health::Prober;
use relaynet_transport::{
    ChatTransport, DatagramTransport, HealthTracker, InboundMessage, MixedTransport,
    PeerAddress, Transport, TransportStats,
};

use crate::cli::{ChatArgs, PeerSpec, RunArgs};

pub struct AppContext {
    pub address: PeerAddress,
    /// Mode after the mobile override.
    pub mode: NetworkMode,
    pub mobile: bool,
    pub health: Arc<HealthTracker>,
    pub stats: Arc<TransportStats>,
    /// The transport the mode selected. Upper layers only see this one.
    pub transport: Arc<dyn Transport>,
    pub datagram: Option<Arc<DatagramTransport>>,
    pub chat: Option<Arc<ChatTransport>>,
    shutdown: watch::Sender<bool>,
}

impl AppContext {
    /// Binds sockets and opens the room store as `args` ask.
    pub async fn from_args(args: &RunArgs) -> Result<Self> {
        let mode = args.mode.effective(args.mobile);
        if mode != args.mode {
            info!(requested = %args.mode, effective = %mode, "mobile device, forcing mode");
        }

        let health = Arc::new(HealthTracker::new(HealthConfig {
            probe_interval: (args.probe_interval_secs > 0)
                .then(|| Duration::from_secs(args.probe_interval_secs)),
            ..HealthConfig::default()
        }));
        let stats = Arc::new(TransportStats::new());

        let datagram = match mode {
            NetworkMode::ChatOnly => None,
            NetworkMode::NoNetwork | NetworkMode::UdpOnly | NetworkMode::Mixed => {
                let ip = if mode == NetworkMode::NoNetwork {
                    IpAddr::V4(Ipv4Addr::LOCALHOST)
                } else {
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
                };
                let config = DatagramConfig {
                    max_attempts: args.max_attempts.max(1),
                    ..DatagramConfig::default()
                };
                let transport = DatagramTransport::bind(
                    args.address,
                    SocketAddr::new(ip, args.listen_port),
                    config,
                    Arc::clone(&health),
                    Arc::clone(&stats),
                )
                .await
                .with_context(|| format!("failed to bind UDP port {}", args.listen_port))?;
                Some(Arc::new(transport))
            }
        };

        let chat = match mode {
            NetworkMode::ChatOnly | NetworkMode::Mixed => Some(open_chat(
                args.address,
                &args.chat,
                Arc::clone(&health),
                Arc::clone(&stats),
            )?),
            NetworkMode::NoNetwork | NetworkMode::UdpOnly => None,
        };

        let ctx = Self::assemble(
            args.address,
            args.mode,
            args.mobile,
            health,
            stats,
            datagram,
            chat,
        )?;
        ctx.register_peers(&args.peers);
        Ok(ctx)
    }

    /// Wires already-built paths into a context. Fails when `mode` needs a
    /// path that was not supplied.
    pub fn assemble(
        address: PeerAddress,
        mode: NetworkMode,
        mobile: bool,
        health: Arc<HealthTracker>,
        stats: Arc<TransportStats>,
        datagram: Option<Arc<DatagramTransport>>,
        chat: Option<Arc<ChatTransport>>,
    ) -> Result<Self> {
        let mode = mode.effective(mobile);
        let transport: Arc<dyn Transport> = match (mode, &datagram, &chat) {
            (NetworkMode::Mixed, Some(d), Some(c)) => MixedTransport::new(
                Arc::clone(d),
                Arc::clone(c),
                Arc::clone(&health),
                Arc::clone(&stats),
                MixedConfig::default(),
            ),
            (NetworkMode::ChatOnly, _, Some(c)) => Arc::clone(c) as Arc<dyn Transport>,
            (NetworkMode::UdpOnly | NetworkMode::NoNetwork, Some(d), _) => {
                Arc::clone(d) as Arc<dyn Transport>
            }
            _ => bail!("network mode {mode} is missing a required transport"),
        };

        transport.set_handler(Arc::new(|m: InboundMessage| {
            info!(
                id = %m.id,
                sender = %m.sender,
                via = %m.via,
                len = m.payload.len(),
                "message received"
            );
        }));

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            address,
            mode,
            mobile,
            health,
            stats,
            transport,
            datagram,
            chat,
            shutdown,
        })
    }

    /// Makes configured peers known to discovery and the health tracker.
    pub fn register_peers(&self, peers: &[PeerSpec]) {
        for peer in peers {
            self.health.register_peer(peer.address, None);
            match &self.datagram {
                Some(datagram) => datagram.discovery().insert(peer.address, peer.endpoint),
                None => warn!(peer = %peer.address, "no datagram path, endpoint ignored"),
            }
        }
    }

    /// Starts the selected transport and, if configured, the health prober.
    pub fn start(&self) -> Result<()> {
        Arc::clone(&self.transport)
            .start()
            .context("failed to start transport")?;

        if let (Some(datagram), Some(interval)) =
            (&self.datagram, self.health.config().probe_interval)
        {
            let prober = Prober::new(Arc::clone(datagram), interval);
            tokio::spawn(prober.run(self.shutdown.subscribe()));
        }

        info!(
            address = %self.address,
            mode = %self.mode,
            mobile = self.mobile,
            "node started"
        );
        Ok(())
    }

    /// Stops every worker. In-flight sends resolve with a shutdown error.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
        self.transport.stop();
        info!(address = %self.address, "node stopped");
    }

    /// Messages the datagram path is still waiting on.
    pub fn in_flight(&self) -> usize {
        self.datagram.as_ref().map_or(0, |d| d.in_flight())
    }
}

fn open_chat(
    address: PeerAddress,
    args: &ChatArgs,
    health: Arc<HealthTracker>,
    stats: Arc<TransportStats>,
) -> Result<Arc<ChatTransport>> {
    let homeserver = args
        .homeserver
        .as_deref()
        .context("--homeserver is required for the chat path")?;
    let server_name = args
        .server_name
        .as_deref()
        .context("--server-name is required for the chat path")?;
    let token = args
        .access_token
        .as_deref()
        .context("--access-token is required for the chat path")?;

    let store = SledRoomStore::open(&args.store_dir)
        .with_context(|| format!("failed to open room store at {}", args.store_dir.display()))?;
    let backend = HttpBackend::new(homeserver, user_id_for(&address, server_name), token)
        .context("invalid homeserver configuration")?;

    info!(homeserver, server_name, store = %args.store_dir.display(), "chat path configured");
    Ok(ChatTransport::new(
        address,
        Arc::new(backend),
        Arc::new(store),
        ChatConfig::new(server_name),
        health,
        stats,
    ))
}
