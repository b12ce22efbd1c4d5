//! Daemon runtime for dropline.
//!
//! Glues the folder watcher to the batch pipeline: builds per-client watch
//! entries, admits stable files into an ingestion queue, runs each one to a
//! terminal outcome (archived or quarantined) and records that outcome in a
//! durable intake ledger so restarts never reprocess a file.

pub mod clients;
pub mod ledger;
pub mod outcome;
pub mod queue;
pub mod runner;

pub use clients::{ClientWatch, build_client_watches};
pub use ledger::{IntakeLedger, IntakeRecord};
pub use outcome::TerminalOutcome;
pub use queue::{IngestReceiver, IngestSender, ingestion_queue};
pub use runner::{DaemonHandle, DaemonRunner, DaemonStats};
