// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # relaynet: Mixed-Transport Messaging Layer
//!
//! A payment-channel node lives or dies by whether its transfer requests,
//! secret reveals and balance proofs reach the peer they are meant for.
//! This crate gets protocol messages to a specific peer address over
//! whichever path currently works.
//!
//! ## Architecture
//!
//! ```text
//!                       +------------------+
//!   upper layer ------> |  MixedTransport  | ------> MessageHandler
//!                       +--+------------+--+
//!                          |            |
//!           +--------------v---+    +---v-------------+
//!           | DatagramTransport|    |  ChatTransport  |
//!           | (UDP + retries)  |    | (room timeline) |
//!           +---+---------+----+    +-------+---------+
//!               |         |                 |
//!         TokenBucket  RetryQueue    SyncLoop + DefaultSyncer
//!                                           |
//!                     HealthTracker <-------+-- presence, delivery outcomes
//! ```
//!
//! - **ratelimit**: token bucket gating outbound datagrams.
//! - **datagram**: connectionless delivery with ack, bounded retry and dedup.
//! - **chat**: incremental sync engine, room store, and the transport that
//!   carries messages as room timeline events.
//! - **health**: per-peer reachability derived from probes and outcomes.
//! - **mixed**: picks a path per destination and fails over.
//! - **config**: constants and per-transport settings.
//!
//! ## Delivery Contract
//!
//! The upper layer sees two outcomes per message: delivered, or delivery
//! failed. Retries and path switching stay inside. Deduplication is best
//! effort over a bounded window, so consumers must be idempotent.

pub mod chat;
pub mod clock;
pub mod config;
pub mod datagram;
pub mod dedup;
pub mod error;
pub mod health;
pub mod message;
pub mod mixed;
pub mod ratelimit;
pub mod stats;
pub mod transport;

pub use chat::{ChatTransport, DefaultSyncer, SyncLoop, SyncState, Syncer};
pub use datagram::DatagramTransport;
pub use error::TransportError;
pub use health::{HealthTracker, NodeStatus, Peer};
pub use message::{InboundMessage, Message, MessageHandler, MessageId, PeerAddress};
pub use mixed::MixedTransport;
pub use ratelimit::TokenBucket;
pub use stats::{StatsSnapshot, TransportStats};
pub use transport::{Transport, TransportKind};
