#![allow(clippy::doc_markdown)]

//! campx-core - claim arbitration and durable expiry for the campx
//! marketplace.
//!
//! This crate holds the part of the marketplace with real contention:
//! owners advertise claimable resources (ride seats, lost-and-found posts),
//! other members submit competing claims, and exactly one outcome is
//! committed per resource, either by the owner or by the clock.
//!
//! # Architecture
//!
//! ```text
//!   caller (HTTP layer, excluded)
//!        │
//!        ▼
//! ┌───────────────────────────────┐      ┌──────────────────────┐
//! │       ArbitrationEngine       │─────▶│ NotificationGateway  │
//! │  authz gate → state machine   │ post │  (fire-and-forget)   │
//! │  per-resource ResourceLocks   │commit└──────────────────────┘
//! └──────────────┬────────────────┘
//!                │ snapshot / conditional commit
//!                ▼
//! ┌───────────────────────────────┐      ┌──────────────────────┐
//! │  MarketStore (SQLite)         │◀─────│   ExpiryScheduler    │
//! │  market_resources             │ due  │  recurring sweep     │
//! │  market_claims                │ scan └──────────┬───────────┘
//! └───────────────────────────────┘                 │
//! ┌───────────────────────────────┐                 │
//! │  TicketStore (SQLite)         │◀────────────────┘
//! │  verification_tickets         │  delete expired
//! └───────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`model`]: resources, claims, payloads, and their state machines
//! - [`store`]: store contract, `SQLite` implementation, lazy open listing
//! - [`arbitration`]: the engine, the authorization gate, and per-resource
//!   locking
//! - [`expiry`]: the deadline sweep
//! - [`ticket`]: single-use verification tickets (OTP flows)
//! - [`notify`]: outbound domain events
//! - [`config`]: TOML configuration
//! - [`clock`]: injectable time source
//! - [`error`]: the caller-facing error taxonomy

pub mod arbitration;
pub mod clock;
pub mod config;
pub mod error;
pub mod expiry;
pub mod model;
pub mod notify;
pub mod store;
pub mod ticket;

pub use arbitration::{Actor, ActorRole, ArbitrationEngine, Decision};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MarketConfig;
pub use error::{ErrorKind, MarketError};
pub use expiry::{ExpiryScheduler, SweepReport};
pub use notify::{ChannelNotifier, MarketEvent, NotificationGateway, TracingNotifier};
pub use ticket::{TicketPurpose, TicketService};
