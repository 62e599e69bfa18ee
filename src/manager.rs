//! The pipeline entry point: one event log shared by one delivery task per destination.
use std::{
    sync::{Arc, Mutex, RwLock},
    thread::JoinHandle,
};

use crate::{
    config::ManagerConfig,
    delivery::{DeliveryStats, DeliveryTask, DeliveryTaskConfig},
    event::ExportableEvent,
    event_log::EventLog,
    Error, Result,
};

/// Distributes events to every configured destination.
///
/// The manager owns the shared [`EventLog`] and one [`DeliveryTask`] per destination. Events are
/// appended with [`Manager::add_event`]; each destination then receives them on its own schedule.
///
/// # Examples
///
/// ```
/// # use std::time::Duration;
/// # use flagpipe::{DeliveryTaskConfig, FeatureEvent, LogExporter, Manager, ManagerConfig};
/// let manager: Manager<FeatureEvent> = Manager::new(
///     vec![DeliveryTaskConfig::new(LogExporter::new())],
///     ManagerConfig::default(),
/// )
/// .unwrap();
/// manager.start_daemon().unwrap();
///
/// manager.add_event(FeatureEvent::new("user-1", false, "my-flag", true, "enabled"));
///
/// manager.close().unwrap();
/// ```
pub struct Manager<T> {
    event_log: Arc<EventLog<T>>,
    tasks: Vec<Arc<DeliveryTask<T>>>,
    /// `None` until [`Manager::start_daemon`] is called.
    daemon: Mutex<Option<Vec<JoinHandle<()>>>>,
    /// Set by [`Manager::close`]. Held for reading while an event is appended, so no event can
    /// land in the log after the final flushes.
    closed: RwLock<bool>,
}

impl<T: ExportableEvent + Clone + Send + Sync + 'static> Manager<T> {
    /// Create a manager for `destinations`, registering one event log consumer per destination.
    ///
    /// Timer flushes only happen after [`Manager::start_daemon`] is called.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the compaction thread failed to start.
    pub fn new(
        destinations: Vec<DeliveryTaskConfig<T>>,
        config: ManagerConfig,
    ) -> Result<Manager<T>> {
        let event_log = Arc::new(EventLog::new(config.compaction_interval));

        let tasks = destinations
            .into_iter()
            .enumerate()
            .map(|(index, destination)| {
                let name = destination
                    .name
                    .clone()
                    .unwrap_or_else(|| destination.exporter.name().to_owned());
                let consumer = format!("{index}-{name}");
                DeliveryTask::new(destination, consumer, event_log.clone()).map(Arc::new)
            })
            .collect::<Result<Vec<_>>>()?;

        event_log.start()?;

        Ok(Manager {
            event_log,
            tasks,
            daemon: Mutex::new(None),
            closed: RwLock::new(false),
        })
    }

    /// Record `event` and flush the destinations that need it.
    ///
    /// Non-bulk destinations export the event on the calling thread. Bulk destinations export on
    /// the calling thread only when their buffer is full.
    pub fn add_event(&self, event: T) {
        {
            let closed = self
                .closed
                .read()
                .expect("thread holding closed lock should not panic");
            if *closed {
                log::debug!(target: "flagpipe",
                            key = event.key();
                            "dropping event added after close");
                return;
            }
            if self.tasks.is_empty() {
                return;
            }

            self.event_log.add(event);
        }

        for task in &self.tasks {
            if let Err(err) = task.on_event_added() {
                // Should not happen: consumers are registered when tasks are created.
                log::error!(target: "flagpipe",
                            destination = task.name();
                            "error while getting pending event count: {err}");
            }
        }
    }

    /// Start the timer loop of every destination, each on its own thread.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if the daemon is already running.
    /// - [`Error::Closed`] if the manager has been closed.
    /// - [`Error::Io`] if a thread failed to spawn. Already started loops keep running until
    ///   [`Manager::close`].
    pub fn start_daemon(&self) -> Result<()> {
        let mut daemon = self
            .daemon
            .lock()
            .expect("thread holding daemon lock should not panic");
        if *self
            .closed
            .read()
            .expect("thread holding closed lock should not panic")
        {
            return Err(Error::Closed);
        }
        if daemon.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let handles = daemon.insert(Vec::with_capacity(self.tasks.len()));
        for (index, task) in self.tasks.iter().enumerate() {
            let task = Arc::clone(task);
            let handle = std::thread::Builder::new()
                .name(format!("flagpipe-delivery-{index}"))
                .spawn(move || {
                    if let Err(err) = task.run() {
                        log::warn!(target: "flagpipe",
                                   destination = task.name();
                                   "delivery loop not started: {err}");
                    }
                })?;
            handles.push(handle);
        }
        Ok(())
    }

    /// Stop every destination, flushing what they have pending, then stop event log compaction.
    ///
    /// Waits for flushes in progress. Calling `close` more than once does nothing.
    ///
    /// # Errors
    ///
    /// - [`Error::DeliveryThreadPanicked`] if a delivery thread has panicked. Other destinations
    ///   are still stopped and flushed.
    /// - [`Error::CompactionThreadPanicked`] if the compaction thread has panicked.
    pub fn close(&self) -> Result<()> {
        {
            let mut closed = self
                .closed
                .write()
                .expect("thread holding closed lock should not panic");
            if *closed {
                return Ok(());
            }
            *closed = true;
        }

        for task in &self.tasks {
            if let Err(err) = task.stop() {
                log::error!(target: "flagpipe",
                            destination = task.name();
                            "error while flushing events on close: {err}");
            }
        }

        let handles = self
            .daemon
            .lock()
            .expect("thread holding daemon lock should not panic")
            .take()
            .unwrap_or_default();
        let mut result = Ok(());
        for handle in handles {
            if handle.join().is_err() {
                result = Err(Error::DeliveryThreadPanicked);
            }
        }

        result.and(self.event_log.stop())
    }

    /// Number of events waiting to be delivered to `destination`.
    ///
    /// `destination` is either a consumer id (`"{index}-{name}"`, see
    /// [`DeliveryTask::consumer`]) or a destination name. A name shared by several destinations
    /// resolves to the first of them.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownConsumer`] if there is no such destination.
    pub fn pending_count(&self, destination: &str) -> Result<i64> {
        self.tasks
            .iter()
            .find(|task| task.consumer() == destination)
            .or_else(|| self.tasks.iter().find(|task| task.name() == destination))
            .ok_or_else(|| Error::UnknownConsumer(destination.to_owned()))?
            .pending_count()
    }

    /// Number of events retained in the shared event log.
    pub fn total_count(&self) -> i64 {
        self.event_log.total_count()
    }

    /// Delivery counters of every destination, in configuration order.
    pub fn stats(&self) -> Vec<(String, DeliveryStats)> {
        self.tasks
            .iter()
            .map(|task| (task.name().to_owned(), task.stats()))
            .collect()
    }

    /// Delivery tasks, in configuration order.
    pub fn delivery_tasks(&self) -> impl Iterator<Item = &DeliveryTask<T>> {
        self.tasks.iter().map(|task| &**task)
    }

    /// Compact the event log now instead of waiting for the next compaction cycle.
    pub fn compact(&self) -> usize {
        self.event_log.compact()
    }
}
