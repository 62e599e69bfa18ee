//! Delivery of events from the shared [`EventLog`] to a single destination.
//!
//! A [`DeliveryTask`] owns one consumer of the event log and flushes its pending events to an
//! [`Exporter`] on two independent paths:
//!
//! - *inline*, right after an event is added: immediately for non-bulk exporters, or once the
//!   number of pending events reaches `max_buffered_events` for bulk exporters;
//! - on a *timer*, every `flush_interval`, regardless of the number of pending events.
//!
//! Flushes of the same task are serialized, so a destination never receives the same batch twice.
//! A failed export is logged and the batch is dropped; the consumer offset still advances.
use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::{Receiver, RecvTimeoutError, SyncSender},
        Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError,
    },
    time::Duration,
};

use crate::{
    config::{DeliverySettings, DEFAULT_FLUSH_INTERVAL, DEFAULT_MAX_BUFFERED_EVENTS},
    event_log::EventLog,
    exporter::{ExportError, Exporter},
    Error, Result,
};

/// Configuration of a destination.
pub struct DeliveryTaskConfig<T> {
    pub exporter: Arc<dyn Exporter<T>>,
    /// Interval between two timer flushes. Zero means [`DEFAULT_FLUSH_INTERVAL`].
    pub flush_interval: Duration,
    /// Number of pending events that triggers an inline flush of a bulk exporter. Zero means
    /// [`DEFAULT_MAX_BUFFERED_EVENTS`].
    pub max_buffered_events: i64,
    /// Name of the destination in logs. Defaults to [`Exporter::name`].
    pub name: Option<String>,
}

impl<T> DeliveryTaskConfig<T> {
    pub const DEFAULT_FLUSH_INTERVAL: Duration = DEFAULT_FLUSH_INTERVAL;
    pub const DEFAULT_MAX_BUFFERED_EVENTS: i64 = DEFAULT_MAX_BUFFERED_EVENTS;

    /// Create a configuration for `exporter` with default batching settings.
    pub fn new(exporter: impl Exporter<T> + 'static) -> DeliveryTaskConfig<T> {
        DeliveryTaskConfig {
            exporter: Arc::new(exporter),
            flush_interval: Self::DEFAULT_FLUSH_INTERVAL,
            max_buffered_events: Self::DEFAULT_MAX_BUFFERED_EVENTS,
            name: None,
        }
    }

    /// Create a configuration for `exporter` from deserialized settings.
    pub fn from_settings(
        exporter: impl Exporter<T> + 'static,
        settings: DeliverySettings,
    ) -> DeliveryTaskConfig<T> {
        DeliveryTaskConfig {
            exporter: Arc::new(exporter),
            flush_interval: settings.flush_interval,
            max_buffered_events: settings.max_buffered_events,
            name: settings.name,
        }
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> DeliveryTaskConfig<T> {
        self.flush_interval = interval;
        self
    }

    pub fn with_max_buffered_events(mut self, max: i64) -> DeliveryTaskConfig<T> {
        self.max_buffered_events = max;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> DeliveryTaskConfig<T> {
        self.name = Some(name.into());
        self
    }
}

/// What a flush did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Nothing was pending.
    Empty,
    /// Another flush of the same task was in progress.
    Skipped,
    /// The given number of events was exported.
    Delivered(usize),
    /// The exporter failed. The given number of events was dropped.
    Failed(usize),
}

/// Counters describing what a delivery task has done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    /// Number of non-empty flushes, successful or not.
    pub flushes: u64,
    pub exported_events: u64,
    pub failed_flushes: u64,
    /// Events dropped because their export failed.
    pub dropped_events: u64,
}

#[derive(Default)]
struct AtomicStats {
    flushes: AtomicU64,
    exported_events: AtomicU64,
    failed_flushes: AtomicU64,
    dropped_events: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Idle,
    Running,
    Stopped,
}

/// Sets the loop state to `Stopped` when the timer loop exits, including by panic.
struct LoopGuard<'a>(&'a (Mutex<LoopState>, Condvar));

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        let (state, condvar) = self.0;
        *state.lock().unwrap_or_else(PoisonError::into_inner) = LoopState::Stopped;
        condvar.notify_all();
    }
}

/// Delivery of the shared event log to one destination.
pub struct DeliveryTask<T> {
    name: String,
    consumer: String,
    exporter: Arc<dyn Exporter<T>>,
    bulk: bool,
    flush_interval: Duration,
    max_buffered_events: i64,
    event_log: Arc<EventLog<T>>,

    /// Held for the whole fetch/export/acknowledge sequence. Guards no data.
    flush_lock: Mutex<()>,

    /// Used to send a stop command to the timer loop.
    stop_sender: SyncSender<()>,
    stop_receiver: Mutex<Option<Receiver<()>>>,
    loop_state: (Mutex<LoopState>, Condvar),

    stats: AtomicStats,
}

impl<T: Clone> DeliveryTask<T> {
    /// Create a task and register `consumer` in `event_log`.
    ///
    /// # Errors
    ///
    /// Fails if `consumer` cannot be registered: see [`EventLog::add_consumer`].
    pub fn new(
        config: DeliveryTaskConfig<T>,
        consumer: impl Into<String>,
        event_log: Arc<EventLog<T>>,
    ) -> Result<DeliveryTask<T>> {
        let consumer = consumer.into();
        event_log.add_consumer(consumer.as_str())?;

        let flush_interval = if config.flush_interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            config.flush_interval
        };
        let max_buffered_events = if config.max_buffered_events <= 0 {
            DEFAULT_MAX_BUFFERED_EVENTS
        } else {
            config.max_buffered_events
        };
        let name = config
            .name
            .unwrap_or_else(|| config.exporter.name().to_owned());

        // Buffer size of 1 is enough: we only ever send a stop command, and a full buffer means
        // another thread has already sent one.
        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);

        Ok(DeliveryTask {
            name,
            consumer,
            bulk: config.exporter.is_bulk(),
            exporter: config.exporter,
            flush_interval,
            max_buffered_events,
            event_log,
            flush_lock: Mutex::new(()),
            stop_sender,
            stop_receiver: Mutex::new(Some(stop_receiver)),
            loop_state: (Mutex::new(LoopState::Idle), Condvar::new()),
            stats: AtomicStats::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the consumer owned by this task in the event log.
    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn is_bulk(&self) -> bool {
        self.bulk
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn max_buffered_events(&self) -> i64 {
        self.max_buffered_events
    }

    /// Number of events waiting to be delivered to this destination.
    pub fn pending_count(&self) -> Result<i64> {
        self.event_log.pending_count(&self.consumer)
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            flushes: self.stats.flushes.load(Ordering::Relaxed),
            exported_events: self.stats.exported_events.load(Ordering::Relaxed),
            failed_flushes: self.stats.failed_flushes.load(Ordering::Relaxed),
            dropped_events: self.stats.dropped_events.load(Ordering::Relaxed),
        }
    }

    /// Inline trigger, called after an event has been added to the log.
    ///
    /// Non-bulk destinations are flushed right away, waiting for a flush already in progress.
    /// Bulk destinations are flushed once `max_buffered_events` are pending, unless a flush is
    /// already in progress, in which case the events are left for the next trigger.
    pub fn on_event_added(&self) -> Result<FlushOutcome> {
        if !self.bulk {
            return self.flush();
        }
        if self.pending_count()? >= self.max_buffered_events {
            return self.try_flush();
        }
        Ok(FlushOutcome::Empty)
    }

    /// Flush every pending event to the destination, waiting for a flush in progress to finish.
    ///
    /// Export failures are logged and reported as [`FlushOutcome::Failed`]; only event log errors
    /// are returned as `Err`.
    pub fn flush(&self) -> Result<FlushOutcome> {
        let _guard = lock_flush(&self.flush_lock);
        self.flush_locked()
    }

    /// Same as [`DeliveryTask::flush`] but returns [`FlushOutcome::Skipped`] instead of waiting
    /// if a flush is in progress.
    pub fn try_flush(&self) -> Result<FlushOutcome> {
        let _guard = match self.flush_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(FlushOutcome::Skipped),
        };
        self.flush_locked()
    }

    fn flush_locked(&self) -> Result<FlushOutcome> {
        let batch = self.event_log.fetch_pending(&self.consumer)?;
        if batch.is_empty() {
            return Ok(FlushOutcome::Empty);
        }
        let count = batch.events.len();

        let result = catch_unwind(AssertUnwindSafe(|| self.exporter.export(&batch.events)))
            .unwrap_or_else(|_| Err(ExportError::from("exporter panicked")));

        // The batch is acknowledged even if the export failed: events are never retried.
        self.event_log
            .acknowledge(&self.consumer, batch.new_offset)?;
        self.stats.flushes.fetch_add(1, Ordering::Relaxed);

        match result {
            Ok(()) => {
                self.stats
                    .exported_events
                    .fetch_add(count as u64, Ordering::Relaxed);
                log::info!(target: "flagpipe",
                           destination = self.name.as_str(),
                           count;
                           "exported {count} events");
                Ok(FlushOutcome::Delivered(count))
            }
            Err(err) => {
                self.stats.failed_flushes.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .dropped_events
                    .fetch_add(count as u64, Ordering::Relaxed);
                log::error!(target: "flagpipe",
                            destination = self.name.as_str(),
                            count;
                            "{}", Error::from(err));
                Ok(FlushOutcome::Failed(count))
            }
        }
    }

    /// Run the timer loop, flushing every `flush_interval` until [`DeliveryTask::stop`] is called.
    /// Blocks the calling thread.
    ///
    /// Returns immediately if the task has already been stopped.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if the loop is running on another thread.
    pub fn run(&self) -> Result<()> {
        let receiver = {
            let (state, _) = &self.loop_state;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                LoopState::Running => return Err(Error::AlreadyStarted),
                LoopState::Stopped => return Ok(()),
                LoopState::Idle => {}
            }
            let receiver = self
                .stop_receiver
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            let Some(receiver) = receiver else {
                return Err(Error::AlreadyStarted);
            };
            *state = LoopState::Running;
            receiver
        };
        let _guard = LoopGuard(&self.loop_state);

        log::debug!(target: "flagpipe", destination = self.name.as_str(); "delivery loop started");
        loop {
            match receiver.recv_timeout(self.flush_interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(err) = self.flush() {
                        log::error!(target: "flagpipe",
                                    destination = self.name.as_str();
                                    "error while flushing events: {err}");
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    log::debug!(target: "flagpipe",
                                destination = self.name.as_str();
                                "delivery loop received stop command");
                    return Ok(());
                }
            }
        }
    }

    /// Stop the timer loop, wait for it to exit, then flush the remaining events.
    ///
    /// A flush in progress is allowed to complete; no timer flush happens once this returns.
    /// Calling `stop` again only flushes.
    pub fn stop(&self) -> Result<FlushOutcome> {
        // Error means that the buffer is full (a stop command is already pending) or that the loop
        // has exited. Both can be ignored.
        let _ = self.stop_sender.try_send(());

        {
            let (state, condvar) = &self.loop_state;
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state == LoopState::Idle {
                *state = LoopState::Stopped;
            }
            let _state = condvar
                .wait_while(state, |state| *state == LoopState::Running)
                .unwrap_or_else(PoisonError::into_inner);
        }

        self.flush()
    }
}

fn lock_flush(lock: &Mutex<()>) -> MutexGuard<'_, ()> {
    // The lock guards no data, so a panic while holding it leaves nothing inconsistent.
    lock.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;

    #[derive(Default)]
    struct RecordingExporter {
        bulk: bool,
        fail: bool,
        batches: Mutex<Vec<Vec<u32>>>,
    }

    impl Exporter<u32> for RecordingExporter {
        fn export(&self, events: &[u32]) -> std::result::Result<(), ExportError> {
            self.batches.lock().unwrap().push(events.to_vec());
            if self.fail {
                return Err("random err".into());
            }
            Ok(())
        }

        fn is_bulk(&self) -> bool {
            self.bulk
        }

        fn name(&self) -> &str {
            "recording"
        }
    }

    struct PanickingExporter;

    impl Exporter<u32> for PanickingExporter {
        fn export(&self, _events: &[u32]) -> std::result::Result<(), ExportError> {
            panic!("destination exploded");
        }

        fn is_bulk(&self) -> bool {
            true
        }
    }

    fn task(
        exporter: Arc<RecordingExporter>,
        max_buffered_events: i64,
    ) -> (DeliveryTask<u32>, Arc<EventLog<u32>>) {
        let event_log = Arc::new(EventLog::new(Duration::from_secs(3600)));
        let config = DeliveryTaskConfig {
            exporter,
            flush_interval: Duration::from_secs(3600),
            max_buffered_events,
            name: None,
        };
        let task = DeliveryTask::new(config, "consumer", event_log.clone()).unwrap();
        (task, event_log)
    }

    #[test]
    fn zero_settings_use_defaults() {
        let exporter = Arc::new(RecordingExporter::default());
        let (task, _) = task(exporter, 0);
        assert_eq!(
            task.max_buffered_events(),
            DeliveryTaskConfig::<u32>::DEFAULT_MAX_BUFFERED_EVENTS
        );
        assert_eq!(task.flush_interval(), Duration::from_secs(3600));
        assert_eq!(task.name(), "recording");
    }

    #[test]
    fn registers_its_consumer() {
        let exporter = Arc::new(RecordingExporter::default());
        let (task, event_log) = task(exporter, 10);
        assert_eq!(task.consumer(), "consumer");
        assert_eq!(event_log.pending_count("consumer").unwrap(), 0);
    }

    #[test]
    fn non_bulk_flushes_every_event() {
        let exporter = Arc::new(RecordingExporter::default());
        let (task, event_log) = task(exporter.clone(), 10);

        for i in 0..3 {
            event_log.add(i);
            assert_eq!(task.on_event_added().unwrap(), FlushOutcome::Delivered(1));
        }
        assert_eq!(*exporter.batches.lock().unwrap(), vec![vec![0], vec![1], vec![2]]);
    }

    #[test]
    fn bulk_flushes_when_buffer_is_full() {
        let exporter = Arc::new(RecordingExporter {
            bulk: true,
            ..Default::default()
        });
        let (task, event_log) = task(exporter.clone(), 3);

        event_log.add(1);
        assert_eq!(task.on_event_added().unwrap(), FlushOutcome::Empty);
        event_log.add(2);
        assert_eq!(task.on_event_added().unwrap(), FlushOutcome::Empty);
        event_log.add(3);
        assert_eq!(task.on_event_added().unwrap(), FlushOutcome::Delivered(3));
        assert_eq!(task.pending_count().unwrap(), 0);
        assert_eq!(*exporter.batches.lock().unwrap(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn failed_export_still_advances_offset() {
        let _ = env_logger::builder().is_test(true).try_init();

        let exporter = Arc::new(RecordingExporter {
            bulk: true,
            fail: true,
            ..Default::default()
        });
        let (task, event_log) = task(exporter.clone(), 100);

        event_log.add(1);
        event_log.add(2);
        assert_eq!(task.flush().unwrap(), FlushOutcome::Failed(2));
        assert_eq!(task.pending_count().unwrap(), 0);
        assert_eq!(task.flush().unwrap(), FlushOutcome::Empty);
        assert_eq!(
            task.stats(),
            DeliveryStats {
                flushes: 1,
                exported_events: 0,
                failed_flushes: 1,
                dropped_events: 2,
            }
        );
    }

    #[test]
    fn panicking_exporter_is_reported_as_failure() {
        let event_log = Arc::new(EventLog::new(Duration::from_secs(3600)));
        let task = DeliveryTask::new(
            DeliveryTaskConfig::new(PanickingExporter),
            "consumer",
            event_log.clone(),
        )
        .unwrap();

        event_log.add(1);
        assert_eq!(task.flush().unwrap(), FlushOutcome::Failed(1));
        assert_eq!(task.pending_count().unwrap(), 0);
    }

    #[test]
    fn try_flush_skips_while_flush_in_progress() {
        let exporter = Arc::new(RecordingExporter {
            bulk: true,
            ..Default::default()
        });
        let (task, event_log) = task(exporter.clone(), 1);
        event_log.add(1);

        let guard = lock_flush(&task.flush_lock);
        assert_eq!(task.try_flush().unwrap(), FlushOutcome::Skipped);
        assert_eq!(task.on_event_added().unwrap(), FlushOutcome::Skipped);
        drop(guard);

        assert_eq!(task.try_flush().unwrap(), FlushOutcome::Delivered(1));
        assert!(exporter.batches.lock().unwrap().len() == 1);
    }

    #[test]
    fn timer_loop_flushes_and_stop_flushes_the_rest() {
        let _ = env_logger::builder().is_test(true).try_init();

        let exporter = Arc::new(RecordingExporter {
            bulk: true,
            ..Default::default()
        });
        let event_log = Arc::new(EventLog::new(Duration::from_secs(3600)));
        let task = Arc::new(
            DeliveryTask::new(
                DeliveryTaskConfig::new(exporter.clone())
                    .with_flush_interval(Duration::from_millis(10)),
                "consumer",
                event_log.clone(),
            )
            .unwrap(),
        );

        let handle = {
            let task = task.clone();
            std::thread::spawn(move || task.run())
        };

        event_log.add(1);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(*exporter.batches.lock().unwrap(), vec![vec![1]]);

        assert!(matches!(task.run(), Err(Error::AlreadyStarted)));

        event_log.add(2);
        // May race with a timer flush: either way the event is delivered exactly once.
        task.stop().unwrap();
        handle.join().unwrap().unwrap();

        let delivered: Vec<u32> = exporter.batches.lock().unwrap().concat();
        assert_eq!(delivered, vec![1, 2]);
    }

    #[test]
    fn stop_before_run_prevents_the_loop() {
        let exporter = Arc::new(RecordingExporter::default());
        let (task, event_log) = task(exporter.clone(), 10);
        event_log.add(1);

        assert_eq!(task.stop().unwrap(), FlushOutcome::Delivered(1));
        assert!(task.run().is_ok());
        assert_eq!(task.stop().unwrap(), FlushOutcome::Empty);
    }
}
