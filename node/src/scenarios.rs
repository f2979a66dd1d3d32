//! # Built-in Scenarios
//!
//! Self-contained end-to-end checks run by `relaynet-node scenario`. Each
//! one stands up two nodes on an in-memory datagram network and an
//! in-memory homeserver, drives traffic through their [`AppContext`]s, and
//! fails with a description of the first broken expectation.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, ensure, Context, Result};
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::info;

use relaynet_transport::chat::{user_id_for, MemoryHomeserver, MemoryRoomStore};
use relaynet_transport::clock::ManualClock;
use relaynet_transport::config::{ChatConfig, DatagramConfig, HealthConfig, NetworkMode};
use relaynet_transport::datagram::MemoryNetwork;
use relaynet_transport::{
    ChatTransport, DatagramTransport, HealthTracker, InboundMessage, Message, PeerAddress,
    TokenBucket, TransportKind, TransportStats,
};

use crate::cli::ScenarioArgs;
use crate::context::AppContext;

pub type ScenarioFn = fn() -> BoxFuture<'static, Result<()>>;

/// Every registered scenario, in run order.
pub static SCENARIOS: &[(&str, ScenarioFn)] = &[
    ("datagram_roundtrip", || datagram_roundtrip().boxed()),
    ("duplicate_suppression", || duplicate_suppression().boxed()),
    ("chat_roundtrip", || chat_roundtrip().boxed()),
    ("datagram_failover_to_chat", || datagram_failover_to_chat().boxed()),
    ("rate_limit_burst", || rate_limit_burst().boxed()),
];

/// Ceiling for a single scenario.
const SCENARIO_TIMEOUT: Duration = Duration::from_secs(60);

const SERVER: &str = "hs.scenario";

pub fn lookup(name: &str) -> Option<ScenarioFn> {
    SCENARIOS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, f)| *f)
}

/// Entry point for the `scenario` subcommand.
pub async fn run(args: &ScenarioArgs) -> Result<()> {
    if args.list {
        for (name, _) in SCENARIOS {
            println!("{name}");
        }
        return Ok(());
    }

    let selected: Vec<(&str, ScenarioFn)> = if args.all {
        SCENARIOS.to_vec()
    } else if let Some(name) = &args.name {
        match lookup(name) {
            Some(f) => vec![(name.as_str(), f)],
            None => bail!(
                "unknown scenario {name:?}; available: {}",
                SCENARIOS
                    .iter()
                    .map(|(n, _)| *n)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    } else {
        bail!("pass --all, --name <NAME> or --list");
    };

    let mut failed = 0usize;
    for (name, scenario) in &selected {
        match run_one(scenario).await {
            Ok(()) => println!("ok      {name}"),
            Err(e) => {
                failed += 1;
                println!("FAILED  {name}: {e:#}");
            }
        }
    }
    ensure!(failed == 0, "{failed} of {} scenarios failed", selected.len());
    Ok(())
}

async fn run_one(scenario: &ScenarioFn) -> Result<()> {
    tokio::time::timeout(SCENARIO_TIMEOUT, scenario())
        .await
        .context("scenario timed out")?
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Inbox(Arc<Mutex<Vec<InboundMessage>>>);

impl Inbox {
    fn len(&self) -> usize {
        self.0.lock().len()
    }

    fn first(&self) -> Option<InboundMessage> {
        self.0.lock().first().cloned()
    }
}

struct Side {
    ctx: AppContext,
    inbox: Inbox,
}

impl Side {
    fn datagram(&self) -> Result<&Arc<DatagramTransport>> {
        self.ctx.datagram.as_ref().context("no datagram path")
    }

    fn chat(&self) -> Result<&Arc<ChatTransport>> {
        self.ctx.chat.as_ref().context("no chat path")
    }
}

struct Rig {
    net: Arc<MemoryNetwork>,
    a: Side,
    b: Side,
}

impl Rig {
    fn new(mode: NetworkMode, datagram: DatagramConfig) -> Result<Self> {
        let net = MemoryNetwork::new();
        let hs = MemoryHomeserver::new(SERVER);
        let a = side(1, mode, &net, &hs, datagram.clone())?;
        let b = side(2, mode, &net, &hs, datagram)?;

        if let (Some(da), Some(db)) = (&a.ctx.datagram, &b.ctx.datagram) {
            da.discovery().insert(b.ctx.address, db.local_endpoint()?);
            db.discovery().insert(a.ctx.address, da.local_endpoint()?);
        }
        a.ctx.start()?;
        b.ctx.start()?;
        Ok(Self { net, a, b })
    }

    /// Waits until both chat sync loops have finished their baseline
    /// round. Nothing sent before that would ever be dispatched.
    async fn chat_baseline(&self) -> Result<()> {
        let (ca, cb) = (self.a.chat()?, self.b.chat()?);
        wait_for("baseline sync", || {
            !ca.sync_loop().since().is_empty() && !cb.sync_loop().since().is_empty()
        })
        .await
    }
}

impl Drop for Rig {
    fn drop(&mut self) {
        self.a.ctx.stop();
        self.b.ctx.stop();
    }
}

fn side(
    who: u8,
    mode: NetworkMode,
    net: &Arc<MemoryNetwork>,
    hs: &Arc<MemoryHomeserver>,
    datagram_config: DatagramConfig,
) -> Result<Side> {
    let address = PeerAddress([who; 20]);
    // Probing stays off so only scenario traffic moves path health.
    let health = Arc::new(HealthTracker::new(HealthConfig {
        probe_interval: None,
        ..HealthConfig::default()
    }));
    let stats = Arc::new(TransportStats::new());
    let datagram = Arc::new(DatagramTransport::new(
        address,
        net.bind(),
        datagram_config,
        Arc::clone(&health),
        Arc::clone(&stats),
    ));
    let mut chat_config = ChatConfig::new(SERVER);
    chat_config.long_poll_timeout = Duration::from_secs(1);
    let chat = ChatTransport::new(
        address,
        hs.login(user_id_for(&address, SERVER)),
        Arc::new(MemoryRoomStore::new()),
        chat_config,
        Arc::clone(&health),
        Arc::clone(&stats),
    );

    let ctx = AppContext::assemble(
        address,
        mode,
        false,
        health,
        stats,
        Some(datagram),
        Some(chat),
    )?;
    let inbox = Inbox::default();
    let sink = Arc::clone(&inbox.0);
    ctx.transport
        .set_handler(Arc::new(move |m: InboundMessage| sink.lock().push(m)));
    Ok(Side { ctx, inbox })
}

/// Polls `check` every 10ms for up to ten seconds.
async fn wait_for(what: &str, mut check: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

async fn datagram_roundtrip() -> Result<()> {
    let rig = Rig::new(NetworkMode::UdpOnly, DatagramConfig::default())?;
    let id = rig
        .a
        .ctx
        .transport
        .send_payload(rig.b.ctx.address, Bytes::from_static(b"channel update"))
        .await?;

    wait_for("delivery", || rig.b.inbox.len() == 1).await?;
    let got = rig.b.inbox.first().context("inbox empty")?;
    ensure!(got.id == id, "received {} instead of {id}", got.id);
    ensure!(got.via == TransportKind::Datagram, "arrived via {}", got.via);
    ensure!(rig.a.ctx.stats.snapshot().delivered == 1, "delivery not recorded");
    info!(%id, "datagram roundtrip complete");
    Ok(())
}

async fn duplicate_suppression() -> Result<()> {
    let rig = Rig::new(NetworkMode::UdpOnly, DatagramConfig::default())?;
    rig.net.set_duplicate(true);

    let message = Message::new(rig.b.ctx.address, vec![0x42; 48]);
    for _ in 0..3 {
        rig.a.ctx.transport.send(message.clone()).await?;
    }
    wait_for("duplicates", || rig.b.ctx.stats.snapshot().duplicates >= 1).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    ensure!(
        rig.b.inbox.len() == 1,
        "upper layer saw {} copies",
        rig.b.inbox.len()
    );
    Ok(())
}

async fn chat_roundtrip() -> Result<()> {
    let rig = Rig::new(NetworkMode::ChatOnly, DatagramConfig::default())?;
    rig.chat_baseline().await?;

    // No room exists yet: the first send creates it and waits for b.
    let id = rig
        .a
        .ctx
        .transport
        .send_payload(rig.b.ctx.address, Bytes::from_static(b"secret reveal"))
        .await?;
    wait_for("chat delivery", || rig.b.inbox.len() == 1).await?;
    let got = rig.b.inbox.first().context("inbox empty")?;
    ensure!(got.id == id, "received {} instead of {id}", got.id);
    ensure!(got.via == TransportKind::Chat, "arrived via {}", got.via);
    let room = rig.a.chat()?.room_for(&rig.b.ctx.address).unwrap_or_default();
    info!(%id, %room, "chat roundtrip complete");
    Ok(())
}

async fn datagram_failover_to_chat() -> Result<()> {
    let rig = Rig::new(
        NetworkMode::Mixed,
        DatagramConfig {
            max_attempts: 3,
            retry_interval: Duration::from_millis(200),
            ..DatagramConfig::default()
        },
    )?;
    rig.chat_baseline().await?;
    rig.net
        .set_link_down(rig.b.datagram()?.local_endpoint()?, true);

    let id = rig
        .a
        .ctx
        .transport
        .send_payload(rig.b.ctx.address, Bytes::from_static(b"balance proof"))
        .await?;
    ensure!(
        rig.a.ctx.stats.snapshot().fallbacks == 1,
        "expected one fallback, stats: {:?}",
        rig.a.ctx.stats.snapshot()
    );

    wait_for("fallback delivery", || rig.b.inbox.len() == 1).await?;
    let got = rig.b.inbox.first().context("inbox empty")?;
    ensure!(got.id == id, "received {} instead of {id}", got.id);
    ensure!(got.via == TransportKind::Chat, "arrived via {}", got.via);
    Ok(())
}

async fn rate_limit_burst() -> Result<()> {
    let clock = Arc::new(ManualClock::new());
    let bucket = TokenBucket::with_clock(10.0, 1.0, clock.clone());

    for i in 0..10 {
        ensure!(bucket.consume(1.0), "burst consume {i} refused");
    }
    ensure!(!bucket.consume(1.0), "eleventh consume admitted");
    clock.advance(Duration::from_secs(1));
    ensure!(bucket.consume(1.0), "refill did not admit one token");
    ensure!(!bucket.consume(1.0), "refill admitted more than one token");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_names_are_unique() {
        let mut names: Vec<&str> = SCENARIOS.iter().map(|(n, _)| *n).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), SCENARIOS.len());
        assert!(lookup("chat_roundtrip").is_some());
        assert!(lookup("nope").is_none());
    }

    #[tokio::test]
    async fn rate_limit_scenario_passes() {
        rate_limit_burst().await.unwrap();
    }

    #[tokio::test]
    async fn datagram_roundtrip_scenario_passes() {
        datagram_roundtrip().await.unwrap();
    }

    #[tokio::test]
    async fn failover_scenario_passes() {
        datagram_failover_to_chat().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_name_is_rejected() {
        let args = ScenarioArgs {
            all: false,
            name: Some("nope".into()),
            list: false,
        };
        let err = run(&args).await.unwrap_err();
        assert!(err.to_string().contains("available"));
    }
}
