//! Bridge core: keeps a Discord channel and a Rust+ team chat in sync.
//!
//! ## Module Structure
//!
//! - `local`: the capability of posting notifications to a local channel
//! - `dedup`: bounded record of seen inbound message ids
//! - `connection`: session lifecycle and reconnect backoff (`ConnectionManager`)
//! - `delivery`: push/poll ingestion with runtime switching
//! - `router`: formatting, truncation and dedup in both directions
//! - `state`: per-bridge orchestration (`BridgeState`)
//! - `registry`: all bridges plus the administrative operations

pub mod connection;
pub mod dedup;
pub mod delivery;
pub mod local;
pub mod registry;
pub mod router;
pub mod state;

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex};

use crate::common::SessionStatus;
use crate::remote::RemoteSession;

pub use local::LocalChannel;
pub use registry::{BridgeContext, BridgeRegistry};

/// The live session of a bridge, if connected.
pub type SessionSlot = Arc<Mutex<Option<Arc<dyn RemoteSession>>>>;

/// Publisher of a bridge's session status.
pub type StatusTx = Arc<watch::Sender<SessionStatus>>;

pub(crate) fn touch_activity(status: &watch::Sender<SessionStatus>) {
    status.send_modify(|s| s.last_activity = Some(Utc::now()));
}
