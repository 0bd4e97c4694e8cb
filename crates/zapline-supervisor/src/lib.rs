//! Lifecycle supervision for per-bot WhatsApp worker processes.
//!
//! Each bot gets at most one live worker, reachable over a small HTTP control
//! API on a port derived from its id. A monitor loop per instance polls that
//! API and mirrors status and QR code into the bot store.

pub mod config;
pub mod control_client;
pub mod port_alloc;
pub mod reconciler;
pub mod store;
pub mod supervisor;
pub mod worker;

pub use config::SupervisorConfig;
pub use control_client::{ControlClient, ControlError, WorkerStatus};
pub use port_alloc::PortAllocator;
pub use store::{BotRecord, BotStore};
pub use supervisor::{BotConfig, Supervisor, SupervisorError};
pub use worker::{ExitInfo, StopPath};
