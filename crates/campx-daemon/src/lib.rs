#![allow(clippy::doc_markdown)]

//! campx-daemon - background host for the campx marketplace core.
//!
//! The daemon owns the long-lived pieces that must keep running whether or
//! not any request is in flight: it opens the durable store, wires the
//! arbitration engine and ticket service over it, and drives the expiry
//! sweep on a fixed interval until a shutdown signal arrives.
//!
//! # Modules
//!
//! - [`services`]: store opening and service wiring from a [`MarketConfig`]
//! - [`state`]: shutdown flag and sweep counters shared across tasks
//! - [`sweeper`]: the recurring expiry loop
//!
//! [`MarketConfig`]: campx_core::MarketConfig

pub mod services;
pub mod state;
pub mod sweeper;
