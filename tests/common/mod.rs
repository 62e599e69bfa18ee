#![allow(dead_code)]

use std::sync::{Condvar, Mutex};

use flagpipe::{ExportError, Exporter, FeatureEvent};

pub fn feature_event(user_key: &str) -> FeatureEvent {
    FeatureEvent::new(user_key, true, "random-key", "YO", "defaultVar")
}

pub fn feature_events(count: usize) -> Vec<FeatureEvent> {
    (0..count)
        .map(|i| feature_event(&format!("user-{i}")))
        .collect()
}

/// Records every export call. Can fail a number of times and can be paused to simulate a hung
/// destination.
pub struct MockExporter {
    name: String,
    bulk: bool,
    expected_errors: usize,
    batches: Mutex<Vec<Vec<FeatureEvent>>>,
    errors: Mutex<usize>,
    paused: (Mutex<bool>, Condvar),
    in_export: (Mutex<bool>, Condvar),
}

impl MockExporter {
    pub fn new(name: &str, bulk: bool) -> MockExporter {
        MockExporter {
            name: name.to_owned(),
            bulk,
            expected_errors: 0,
            batches: Mutex::new(Vec::new()),
            errors: Mutex::new(0),
            paused: (Mutex::new(false), Condvar::new()),
            in_export: (Mutex::new(false), Condvar::new()),
        }
    }

    /// Fail the first `count` exports with "random err".
    pub fn failing(mut self, count: usize) -> MockExporter {
        self.expected_errors = count;
        self
    }

    /// Make exports block until [`MockExporter::resume`] is called.
    pub fn pause(&self) {
        *self.paused.0.lock().unwrap() = true;
    }

    pub fn resume(&self) {
        *self.paused.0.lock().unwrap() = false;
        self.paused.1.notify_all();
    }

    /// Block until an export call is waiting on the pause.
    pub fn wait_until_blocked(&self) {
        let (lock, condvar) = &self.in_export;
        let _blocked = condvar
            .wait_while(lock.lock().unwrap(), |blocked| !*blocked)
            .unwrap();
    }

    pub fn batches(&self) -> Vec<Vec<FeatureEvent>> {
        self.batches.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches().iter().map(Vec::len).collect()
    }

    pub fn exported_events(&self) -> Vec<FeatureEvent> {
        self.batches().concat()
    }
}

impl Exporter<FeatureEvent> for MockExporter {
    fn export(&self, events: &[FeatureEvent]) -> Result<(), ExportError> {
        {
            let (lock, condvar) = &self.paused;
            let mut paused = lock.lock().unwrap();
            if *paused {
                *self.in_export.0.lock().unwrap() = true;
                self.in_export.1.notify_all();
                paused = condvar.wait_while(paused, |paused| *paused).unwrap();
            }
            drop(paused);
        }

        self.batches.lock().unwrap().push(events.to_vec());

        let mut errors = self.errors.lock().unwrap();
        if *errors < self.expected_errors {
            *errors += 1;
            return Err("random err".into());
        }
        Ok(())
    }

    fn is_bulk(&self) -> bool {
        self.bulk
    }

    fn name(&self) -> &str {
        &self.name
    }
}
