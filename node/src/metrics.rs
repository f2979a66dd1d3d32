//! # Prometheus Metrics
//!
//! Mirrors the transport's delivery counters and the health tracker's peer
//! view into a dedicated [`prometheus::Registry`], refreshed on every
//! scrape. Served next to a JSON peer listing:
//!
//! | Route      | Body                                   |
//! |------------|----------------------------------------|
//! | `/metrics` | Prometheus text exposition format      |
//! | `/peers`   | JSON array of peers and path statuses  |

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use relaynet_transport::{NodeStatus, Peer, StatsSnapshot, TransportKind};

use crate::context::AppContext;

#[derive(Clone)]
pub struct NodeMetrics {
    registry: Registry,
    pub messages_sent_total: IntCounter,
    pub messages_delivered_total: IntCounter,
    pub messages_failed_total: IntCounter,
    pub fallbacks_total: IntCounter,
    pub messages_received_total: IntCounter,
    pub duplicates_total: IntCounter,
    pub malformed_total: IntCounter,
    pub sync_rounds_total: IntCounter,
    pub sync_failures_total: IntCounter,
    pub peers_known: IntGauge,
    pub peers_connected: IntGauge,
    /// Datagram messages awaiting acknowledgement.
    pub in_flight: IntGauge,
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::new(name, help)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntGauge> {
    let g = IntGauge::new(name, help)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

/// Counters only move forward, so the mirror adds the difference.
fn mirror(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

impl NodeMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("relaynet".into()), None)?;
        Ok(Self {
            messages_sent_total: counter(
                &registry,
                "messages_sent_total",
                "Physical transmissions: datagrams sent and chat events published",
            )?,
            messages_delivered_total: counter(
                &registry,
                "messages_delivered_total",
                "Messages confirmed delivered",
            )?,
            messages_failed_total: counter(
                &registry,
                "messages_failed_total",
                "Messages reported failed to the caller",
            )?,
            fallbacks_total: counter(
                &registry,
                "fallbacks_total",
                "Datagram failures retried over the chat path",
            )?,
            messages_received_total: counter(
                &registry,
                "messages_received_total",
                "Inbound messages handed to the upper layer",
            )?,
            duplicates_total: counter(
                &registry,
                "duplicates_total",
                "Inbound retransmissions suppressed by dedup",
            )?,
            malformed_total: counter(
                &registry,
                "malformed_total",
                "Inbound datagrams or events that failed to decode",
            )?,
            sync_rounds_total: counter(
                &registry,
                "sync_rounds_total",
                "Completed homeserver sync rounds",
            )?,
            sync_failures_total: counter(
                &registry,
                "sync_failures_total",
                "Failed homeserver sync requests",
            )?,
            peers_known: gauge(&registry, "peers_known", "Peers the health tracker knows")?,
            peers_connected: gauge(
                &registry,
                "peers_connected",
                "Peers reachable over at least one path",
            )?,
            in_flight: gauge(
                &registry,
                "datagram_in_flight",
                "Datagram messages awaiting acknowledgement",
            )?,
            registry,
        })
    }

    /// Copies a stats snapshot and the peer view into the registry.
    pub fn observe(&self, stats: &StatsSnapshot, known: usize, connected: usize, in_flight: usize) {
        mirror(&self.messages_sent_total, stats.sent);
        mirror(&self.messages_delivered_total, stats.delivered);
        mirror(&self.messages_failed_total, stats.failed);
        mirror(&self.fallbacks_total, stats.fallbacks);
        mirror(&self.messages_received_total, stats.received);
        mirror(&self.duplicates_total, stats.duplicates);
        mirror(&self.malformed_total, stats.malformed);
        mirror(&self.sync_rounds_total, stats.sync_rounds);
        mirror(&self.sync_failures_total, stats.sync_failures);
        self.peers_known.set(known as i64);
        self.peers_connected.set(connected as i64);
        self.in_flight.set(in_flight as i64);
    }

    /// Encodes all registered metrics into the Prometheus text exposition format.
    pub fn encode(&self) -> prometheus::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct MetricsState {
    pub ctx: Arc<AppContext>,
    pub metrics: Arc<NodeMetrics>,
}

/// One entry of the `/peers` listing.
#[derive(Debug, Serialize)]
pub struct PeerView {
    pub address: String,
    pub status: NodeStatus,
    pub preferred: TransportKind,
    pub datagram: NodeStatus,
    pub chat: NodeStatus,
    pub last_seen: Option<DateTime<Utc>>,
}

impl From<Peer> for PeerView {
    fn from(peer: Peer) -> Self {
        Self {
            address: peer.address.to_hex(),
            status: peer.status,
            preferred: peer.preferred,
            datagram: peer.datagram,
            chat: peer.chat,
            last_seen: peer.last_seen,
        }
    }
}

pub fn router(state: MetricsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/peers", get(peers_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Renders `/metrics` in Prometheus text format. HTTP 500 if encoding fails.
async fn metrics_handler(State(state): State<MetricsState>) -> impl IntoResponse {
    let ctx = &state.ctx;
    state.metrics.observe(
        &ctx.stats.snapshot(),
        ctx.health.peers().len(),
        ctx.health.connected_count(),
        ctx.in_flight(),
    );
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}

async fn peers_handler(State(state): State<MetricsState>) -> Json<Vec<PeerView>> {
    let mut peers: Vec<PeerView> = state
        .ctx
        .health
        .peers()
        .into_iter()
        .map(PeerView::from)
        .collect();
    peers.sort_by(|a, b| a.address.cmp(&b.address));
    Json(peers)
}
