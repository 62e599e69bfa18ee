//! The contract implemented by destinations.
use std::sync::Arc;

/// Error type returned by destinations. Any error can be returned; the pipeline only logs it.
pub type ExportError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A destination for exported events (file, object storage, queue, webhook, ...).
///
/// # Examples
///
/// ```
/// # use flagpipe::{Exporter, ExportError, FeatureEvent};
/// struct StdoutExporter;
///
/// impl Exporter<FeatureEvent> for StdoutExporter {
///     fn export(&self, events: &[FeatureEvent]) -> Result<(), ExportError> {
///         for event in events {
///             println!("{} saw {}", event.user_key, event.key);
///         }
///         Ok(())
///     }
///
///     fn is_bulk(&self) -> bool {
///         true
///     }
/// }
/// ```
pub trait Exporter<T>: Send + Sync {
    /// Send `events` to the destination.
    ///
    /// # Errors
    ///
    /// A returned error is logged by the pipeline and the batch is dropped: it is neither retried
    /// nor requeued.
    ///
    /// # Notes
    ///
    /// For non-bulk exporters, this method is called on the thread that added the event, so it
    /// should return quickly.
    fn export(&self, events: &[T]) -> Result<(), ExportError>;

    /// Returns `true` if the destination prefers receiving events in batches, `false` if events
    /// should be sent as soon as they are produced.
    fn is_bulk(&self) -> bool;

    /// Name used to identify the destination in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }
}

impl<T, E: Exporter<T> + ?Sized> Exporter<T> for Arc<E> {
    fn export(&self, events: &[T]) -> Result<(), ExportError> {
        (**self).export(events)
    }

    fn is_bulk(&self) -> bool {
        (**self).is_bulk()
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
