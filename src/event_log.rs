//! A shared, multi-consumer, offset-addressed log of events.
//!
//! [`EventLog`] stores events once for every destination of the pipeline. Each destination is a
//! named *consumer* with its own read cursor (offset). Consumers fetch what they haven't seen yet
//! and explicitly acknowledge it once delivered. A background compaction thread periodically drops
//! entries that every consumer has moved past, so the slowest consumer determines how much is
//! retained.
//!
//! The log has a two-phase lifecycle: consumers are registered while *configuring*, then
//! [`EventLog::start`] seals registration and launches compaction.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        mpsc::{RecvTimeoutError, SyncSender},
        Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
    },
    thread::JoinHandle,
    time::Duration,
};

use crate::{Error, Result};

/// Offset of a log that hasn't received any event yet. The first event gets `INITIAL_OFFSET + 1`.
pub const INITIAL_OFFSET: i64 = 0;

/// An entry of the log.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    pub offset: i64,
    pub payload: T,
}

/// Events a consumer has not acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingBatch<T> {
    pub events: Vec<T>,
    /// Consumer offset at the time of the fetch.
    pub previous_offset: i64,
    /// Last offset of the log at the time of the fetch. Acknowledge this offset once the batch has
    /// been handled.
    pub new_offset: i64,
}

impl<T> PendingBatch<T> {
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

struct LogState<T> {
    entries: VecDeque<Event<T>>,
    last_offset: i64,
    /// Consumer name -> last acknowledged offset.
    consumers: HashMap<String, i64>,
    started: bool,
}

impl<T> LogState<T> {
    fn consumer_offset(&self, consumer: &str) -> Result<i64> {
        self.consumers
            .get(consumer)
            .copied()
            .ok_or_else(|| Error::UnknownConsumer(consumer.to_owned()))
    }
}

struct CompactionThread {
    join_handle: JoinHandle<()>,
    stop_sender: SyncSender<()>,
}

/// In-memory event log shared by all delivery tasks of a pipeline.
///
/// All bookkeeping is guarded by a single reader/writer lock. The lock is never held while doing
/// I/O: exporting fetched events happens outside of it.
pub struct EventLog<T> {
    state: RwLock<LogState<T>>,
    compaction_interval: Duration,
    compaction: Mutex<Option<CompactionThread>>,
}

impl<T> EventLog<T> {
    /// Create an empty log in the configuring phase.
    pub fn new(compaction_interval: Duration) -> EventLog<T> {
        EventLog {
            state: RwLock::new(LogState {
                entries: VecDeque::new(),
                last_offset: INITIAL_OFFSET,
                consumers: HashMap::new(),
                started: false,
            }),
            compaction_interval,
            compaction: Mutex::new(None),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, LogState<T>> {
        // Err() is possible only if the lock is poisoned (writer panicked while holding the lock),
        // which should never happen as no user code runs under it.
        self.state
            .read()
            .expect("thread holding event log lock should not panic")
    }

    fn write(&self) -> RwLockWriteGuard<'_, LogState<T>> {
        self.state
            .write()
            .expect("thread holding event log lock should not panic")
    }

    /// Register a new consumer at the current last offset. It will only see events added from now
    /// on.
    ///
    /// # Errors
    ///
    /// - [`Error::RegistrationClosed`] if the log has been started.
    /// - [`Error::DuplicateConsumer`] if `consumer` is already registered.
    pub fn add_consumer(&self, consumer: impl Into<String>) -> Result<()> {
        let consumer = consumer.into();
        let mut state = self.write();
        if state.started {
            return Err(Error::RegistrationClosed(consumer));
        }
        if state.consumers.contains_key(&consumer) {
            return Err(Error::DuplicateConsumer(consumer));
        }
        let offset = state.last_offset;
        log::debug!(target: "flagpipe",
                    consumer = consumer.as_str(),
                    offset;
                    "registered consumer");
        state.consumers.insert(consumer, offset);
        Ok(())
    }

    /// Append `payload` and return its offset.
    pub fn add(&self, payload: T) -> i64 {
        let mut state = self.write();
        state.last_offset += 1;
        let offset = state.last_offset;
        state.entries.push_back(Event { offset, payload });
        offset
    }

    /// Number of events `consumer` has not acknowledged yet.
    pub fn pending_count(&self, consumer: &str) -> Result<i64> {
        let state = self.read();
        let offset = state.consumer_offset(consumer)?;
        Ok(state.last_offset - offset)
    }

    /// Number of entries currently retained by the log.
    pub fn total_count(&self) -> i64 {
        self.read().entries.len() as i64
    }

    /// Offset assigned to the most recent event.
    pub fn last_offset(&self) -> i64 {
        self.read().last_offset
    }

    /// Last offset acknowledged by `consumer`.
    pub fn consumer_offset(&self, consumer: &str) -> Result<i64> {
        self.read().consumer_offset(consumer)
    }

    /// Move `consumer` to `offset`.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidOffset`] if `offset` is greater than the last offset of the log (or below
    ///   [`INITIAL_OFFSET`]). The consumer is left untouched.
    /// - [`Error::UnknownConsumer`] if `consumer` was never registered.
    pub fn acknowledge(&self, consumer: &str, offset: i64) -> Result<()> {
        let mut state = self.write();
        if offset > state.last_offset || offset < INITIAL_OFFSET {
            return Err(Error::InvalidOffset {
                offset,
                last_offset: state.last_offset,
            });
        }
        let current = state
            .consumers
            .get_mut(consumer)
            .ok_or_else(|| Error::UnknownConsumer(consumer.to_owned()))?;
        *current = offset;
        Ok(())
    }

    /// Drop every entry that all consumers have acknowledged. Returns the number of dropped
    /// entries.
    ///
    /// This is a no-op if there are no consumers or if one of them hasn't acknowledged anything.
    pub fn compact(&self) -> usize {
        let mut state = self.write();
        let Some(min_offset) = state.consumers.values().copied().min() else {
            return 0;
        };
        if min_offset <= INITIAL_OFFSET {
            return 0;
        }

        let retain_from = state.entries.partition_point(|event| event.offset <= min_offset);
        state.entries.drain(..retain_from);

        if retain_from > 0 {
            log::debug!(target: "flagpipe",
                        dropped = retain_from,
                        retained = state.entries.len();
                        "compacted event log");
        }
        retain_from
    }

    /// Stop the compaction thread and wait for it to exit. Does nothing if compaction is not
    /// running.
    ///
    /// # Errors
    ///
    /// - [`Error::CompactionThreadPanicked`] if the compaction thread has panicked.
    pub fn stop(&self) -> Result<()> {
        let thread = self
            .compaction
            .lock()
            .expect("thread holding compaction lock should not panic")
            .take();
        let Some(thread) = thread else {
            return Ok(());
        };

        // Error means that the thread has already exited. Nothing to do in that case.
        let _ = thread.stop_sender.try_send(());
        thread
            .join_handle
            .join()
            .map_err(|_| Error::CompactionThreadPanicked)?;
        log::debug!(target: "flagpipe", "compaction thread stopped");
        Ok(())
    }
}

impl<T: Clone> EventLog<T> {
    /// Return every event `consumer` has not acknowledged yet, in offset order.
    ///
    /// Fetching doesn't move the consumer: repeated fetches without an [acknowledge] return the
    /// same events.
    ///
    /// [acknowledge]: EventLog::acknowledge
    pub fn fetch_pending(&self, consumer: &str) -> Result<PendingBatch<T>> {
        let state = self.read();
        let previous_offset = state.consumer_offset(consumer)?;
        let first = state
            .entries
            .partition_point(|event| event.offset <= previous_offset);
        let events = state
            .entries
            .range(first..)
            .map(|event| event.payload.clone())
            .collect();

        Ok(PendingBatch {
            events,
            previous_offset,
            new_offset: state.last_offset,
        })
    }
}

impl<T: Send + Sync + 'static> EventLog<T> {
    /// Seal consumer registration and start the periodic compaction thread.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyStarted`] if the log has already been started.
    /// - [`Error::Io`] if the compaction thread failed to spawn.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.start_with(std::thread::Builder::new().name("flagpipe-compaction".to_owned()))
    }

    fn start_with(self: &Arc<Self>, builder: std::thread::Builder) -> Result<()> {
        {
            let mut state = self.write();
            if state.started {
                return Err(Error::AlreadyStarted);
            }
            state.started = true;
        }

        let (stop_sender, stop_receiver) = std::sync::mpsc::sync_channel::<()>(1);
        let event_log = Arc::downgrade(self);
        let interval = self.compaction_interval;

        let spawned = builder.spawn(move || loop {
            match stop_receiver.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(event_log) = Weak::upgrade(&event_log) else {
                        // The log has been dropped.
                        return;
                    };
                    event_log.compact();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    log::debug!(target: "flagpipe", "compaction thread received stop command");
                    return;
                }
            }
        });
        let join_handle = match spawned {
            Ok(join_handle) => join_handle,
            Err(err) => {
                // Registration stays open until a compaction thread is running.
                self.write().started = false;
                return Err(err.into());
            }
        };

        *self
            .compaction
            .lock()
            .expect("thread holding compaction lock should not panic") = Some(CompactionThread {
            join_handle,
            stop_sender,
        });
        Ok(())
    }
}
