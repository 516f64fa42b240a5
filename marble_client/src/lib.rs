//! `marble_client`
//!
//! Client-side synchronization core:
//! - Transport session over a WebSocket (queueing, heartbeat, reconnect)
//! - Durable session-token storage for resume
//! - Snapshot reconciliation into smoothly rendered entity state
//! - Frame clock decoupling render rate from network cadence

pub mod interp;
pub mod reconcile;
pub mod session;
pub mod token;

pub use interp::FrameClock;
pub use reconcile::{EntityId, ReconcileSummary, Reconciler, Replicated, TrackedEntity};
pub use session::{Session, SessionStatus};
pub use token::TokenStore;
