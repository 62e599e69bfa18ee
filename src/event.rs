//! Events produced by flag evaluation and tracking calls that need to be exported to the
//! configured destinations.
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{template::Template, Result};

/// Static information attached to feature events by the provider that generated them.
pub type EventMetadata = Map<String, Value>;

/// Capabilities an event needs for the export pipeline and its destinations.
///
/// Serialization to JSON and CSV is derived from the [`Serialize`] implementation, so most
/// implementors only need to provide the three accessors.
pub trait ExportableEvent: Serialize {
    /// Key of the evaluation context (user) that generated the event.
    fn user_key(&self) -> &str;

    /// Key of the flag (or tracked entity) the event is about.
    fn key(&self) -> &str;

    /// Unix timestamp, in seconds, of the event creation.
    fn creation_date(&self) -> i64;

    /// Render the event as a single CSV line using `template`.
    fn format_in_csv(&self, template: &Template) -> Result<Vec<u8>> {
        Ok(template.render(self, self.creation_date())?.into_bytes())
    }

    /// Render the event as a JSON object followed by a newline.
    fn format_in_json(&self) -> Result<Vec<u8>> {
        let mut line = serde_json::to_vec(self)?;
        line.push(b'\n');
        Ok(line)
    }
}

fn context_kind(anonymous: bool) -> &'static str {
    if anonymous {
        "anonymousUser"
    } else {
        "user"
    }
}

/// A flag evaluation: which user saw which flag, with which value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureEvent {
    /// Always `"feature"`.
    pub kind: String,
    /// `"anonymousUser"` for anonymous evaluation contexts, `"user"` otherwise.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context_kind: String,
    pub user_key: String,
    /// Unix timestamp in seconds.
    pub creation_date: i64,
    /// Key of the evaluated flag.
    pub key: String,
    pub variation: String,
    /// Value returned by the evaluation.
    pub value: Value,
    /// Set when the evaluation failed and the caller default was returned.
    pub default: bool,
    #[serde(default)]
    pub version: String,
    /// Where the evaluation happened, e.g. `SERVER` or `PROVIDER_CACHE`.
    #[serde(default)]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<EventMetadata>,
}

impl FeatureEvent {
    /// Create an event for an evaluation happening now.
    pub fn new(
        user_key: impl Into<String>,
        anonymous: bool,
        flag_key: impl Into<String>,
        value: impl Into<Value>,
        variation: impl Into<String>,
    ) -> FeatureEvent {
        FeatureEvent {
            kind: "feature".to_owned(),
            context_kind: context_kind(anonymous).to_owned(),
            user_key: user_key.into(),
            creation_date: chrono::Utc::now().timestamp(),
            key: flag_key.into(),
            variation: variation.into(),
            value: value.into(),
            default: false,
            version: String::new(),
            source: "SERVER".to_owned(),
            metadata: None,
        }
    }

    /// Mark the evaluation as failed (default value returned).
    pub fn with_default(mut self, default: bool) -> FeatureEvent {
        self.default = default;
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> FeatureEvent {
        self.version = version.into();
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> FeatureEvent {
        self.source = source.into();
        self
    }

    /// Attach exporter metadata. Empty metadata is dropped.
    pub fn with_metadata(mut self, metadata: EventMetadata) -> FeatureEvent {
        self.metadata = (!metadata.is_empty()).then_some(metadata);
        self
    }
}

impl ExportableEvent for FeatureEvent {
    fn user_key(&self) -> &str {
        &self.user_key
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn creation_date(&self) -> i64 {
        self.creation_date
    }
}

/// A custom tracking call made by the application for a given evaluation context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackingEvent {
    /// Always `"tracking"`.
    pub kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context_kind: String,
    pub user_key: String,
    pub creation_date: i64,
    /// Name of the tracked event.
    pub key: String,
    #[serde(default)]
    pub evaluation_context: Map<String, Value>,
    #[serde(default, rename = "trackingEventDetails")]
    pub tracking_details: Map<String, Value>,
}

impl TrackingEvent {
    pub fn new(
        user_key: impl Into<String>,
        anonymous: bool,
        key: impl Into<String>,
    ) -> TrackingEvent {
        TrackingEvent {
            kind: "tracking".to_owned(),
            context_kind: context_kind(anonymous).to_owned(),
            user_key: user_key.into(),
            creation_date: chrono::Utc::now().timestamp(),
            key: key.into(),
            evaluation_context: Map::new(),
            tracking_details: Map::new(),
        }
    }

    pub fn with_evaluation_context(mut self, context: Map<String, Value>) -> TrackingEvent {
        self.evaluation_context = context;
        self
    }

    pub fn with_details(mut self, details: Map<String, Value>) -> TrackingEvent {
        self.tracking_details = details;
        self
    }
}

impl ExportableEvent for TrackingEvent {
    fn user_key(&self) -> &str {
        &self.user_key
    }

    fn key(&self) -> &str {
        &self.key
    }

    fn creation_date(&self) -> i64 {
        self.creation_date
    }
}
