//! Export pipeline for feature flag evaluation events.
//!
//! # Overview
//!
//! Every flag evaluation may produce an event (which user saw which flag, with which value) that
//! has to reach zero or more destinations: files, object storage, message queues, webhooks. The
//! pipeline does this without slowing down flag evaluation and without one slow destination
//! blocking another.
//!
//! [`EventLog`] is an append-only, offset-addressed log of events shared by all destinations. Each
//! destination owns a named consumer (read cursor) in the log; entries are dropped by a background
//! compaction thread once every consumer has moved past them.
//!
//! [`DeliveryTask`] drives one destination: it fetches the pending events of its consumer, hands
//! them to an [`Exporter`], and acknowledges them. Flushes happen inline when an event is added
//! (immediately for non-bulk exporters, when `max_buffered_events` are pending for bulk exporters)
//! and on a timer every `flush_interval`.
//!
//! [`Manager`] ties it together: it owns the event log and one delivery task per destination, and
//! exposes [`Manager::add_event`], [`Manager::start_daemon`], and [`Manager::close`].
//!
//! Events are generic: anything implementing [`ExportableEvent`] can go through the pipeline.
//! [`FeatureEvent`] and [`TrackingEvent`] are provided.
//!
//! # Delivery guarantees
//!
//! Delivery is best-effort. Each destination sees events in the order they were added. A failed
//! export is logged and the batch is dropped; it is never retried. Flushes of the same destination
//! are serialized, so a destination never receives the same batch twice.
//!
//! The log is in memory: events pending on shutdown are flushed by [`Manager::close`], events
//! pending on a crash are lost. A stalled destination keeps its pending events in memory until its
//! next flush completes, as entries are only dropped once the slowest destination has passed them.
//!
//! # Logging
//!
//! The crate uses the [`log`](https://docs.rs/log/latest/log/) crate, under the `flagpipe` target.
//! Export failures are logged at `error` level, successful exports at `info`.

#![warn(rustdoc::missing_crate_level_docs)]

pub mod config;
pub mod delivery;
pub mod event;
pub mod event_log;
pub mod exporter;
pub mod template;

mod error;
mod log_exporter;
mod manager;

pub use config::{DeliverySettings, ManagerConfig};
pub use delivery::{DeliveryStats, DeliveryTask, DeliveryTaskConfig, FlushOutcome};
pub use error::{Error, Result};
pub use event::{ExportableEvent, FeatureEvent, TrackingEvent};
pub use event_log::{Event, EventLog, PendingBatch, INITIAL_OFFSET};
pub use exporter::{ExportError, Exporter};
pub use log_exporter::LogExporter;
pub use manager::Manager;
pub use template::Template;
