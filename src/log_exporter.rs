//! A destination writing events to the `log` facade.
use crate::{
    event::ExportableEvent,
    exporter::{ExportError, Exporter},
    template::{Template, DEFAULT_LOG_TEMPLATE},
    Result,
};

/// An [`Exporter`] writing one `info` log record per event, under the `flagpipe::events` target.
///
/// Events are formatted with a [`Template`], by default [`DEFAULT_LOG_TEMPLATE`]. The exporter is
/// not bulk: events are logged as soon as they are added.
#[derive(Debug, Clone)]
pub struct LogExporter {
    template: Template,
}

impl LogExporter {
    /// Create a log exporter using the default format.
    pub fn new() -> LogExporter {
        LogExporter {
            template: Template::parse(DEFAULT_LOG_TEMPLATE)
                .expect("default log template should be valid"),
        }
    }

    /// Create a log exporter using `format`. Falls back to the default format if `format` is empty
    /// or invalid.
    pub fn with_format(format: &str) -> Result<LogExporter> {
        Ok(LogExporter {
            template: Template::parse_or_default(format, DEFAULT_LOG_TEMPLATE)?,
        })
    }

    /// Format `event` the way it would be logged.
    pub fn render<T: ExportableEvent>(&self, event: &T) -> Result<String> {
        self.template.render(event, event.creation_date())
    }
}

impl Default for LogExporter {
    fn default() -> LogExporter {
        LogExporter::new()
    }
}

impl<T: ExportableEvent> Exporter<T> for LogExporter {
    fn export(&self, events: &[T]) -> std::result::Result<(), ExportError> {
        for event in events {
            let line = self.render(event)?;
            log::info!(target: "flagpipe::events", "{line}");
        }
        Ok(())
    }

    fn is_bulk(&self) -> bool {
        false
    }

    fn name(&self) -> &str {
        "log"
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::FeatureEvent;

    fn event() -> FeatureEvent {
        FeatureEvent {
            creation_date: 1617970547,
            ..FeatureEvent::new("ABCD", true, "random-key", json!("YO"), "Default")
        }
    }

    #[test]
    fn default_format() {
        assert_eq!(
            LogExporter::new().render(&event()).unwrap(),
            r#"[2021-04-09T12:15:47Z] user="ABCD", flag="random-key", value="YO""#
        );
    }

    #[test]
    fn custom_format() {
        let exporter =
            LogExporter::with_format(r#"key="{{ .Key}}" [{{ .FormattedDate}}]"#).unwrap();
        assert_eq!(
            exporter.render(&event()).unwrap(),
            r#"key="random-key" [2021-04-09T12:15:47Z]"#
        );
    }

    #[test]
    fn invalid_format_falls_back_to_default() {
        let exporter = LogExporter::with_format(r#"key="{{ .Key}" [{{ .FormattedDate}}]"#).unwrap();
        assert_eq!(
            exporter.render(&event()).unwrap(),
            LogExporter::new().render(&event()).unwrap()
        );
    }

    #[test]
    fn exports_without_error() {
        let exporter = LogExporter::new();
        assert!(!Exporter::<FeatureEvent>::is_bulk(&exporter));
        assert!(Exporter::<FeatureEvent>::export(&exporter, &[event(), event()]).is_ok());
    }
}
