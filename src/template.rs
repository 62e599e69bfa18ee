//! Line templates used to render exportable events as CSV or log lines.
//!
//! Templates use the `{{ .FieldName}}` placeholder syntax, where `FieldName` is the PascalCase name
//! of a serialized event field (`UserKey` for the `userKey` field). The synthetic field
//! `FormattedDate` renders the event creation date in RFC 3339.
use std::sync::OnceLock;

use chrono::{DateTime, SecondsFormat};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::{Error, Result};

/// Default template for CSV lines.
pub const DEFAULT_CSV_TEMPLATE: &str = "{{ .Kind}};{{ .ContextKind}};{{ .UserKey}};{{ .CreationDate}};{{ .Key}};{{ .Variation}};{{ .Value}};{{ .Default}};{{ .Source}}\n";

/// Default template used by [`LogExporter`](crate::log_exporter::LogExporter).
pub const DEFAULT_LOG_TEMPLATE: &str =
    "[{{ .FormattedDate}}] user=\"{{ .UserKey}}\", flag=\"{{ .Key}}\", value=\"{{ .Value}}\"";

const FORMATTED_DATE: &str = "FormattedDate";

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*\.([A-Za-z][A-Za-z0-9_]*)\s*\}\}")
            .expect("placeholder regex should be valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// Serialized (camelCase) name of the field to substitute.
    Field(String),
    FormattedDate,
}

/// A parsed line template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    segments: Vec<Segment>,
}

impl Template {
    /// Parse `source` into a template.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Template`] if `source` contains an unterminated or malformed placeholder.
    pub fn parse(source: &str) -> Result<Template> {
        let mut segments = Vec::new();
        let mut last_end = 0;

        for captures in placeholder_regex().captures_iter(source) {
            let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
                continue;
            };
            push_literal(&mut segments, &source[last_end..whole.start()])?;
            segments.push(match name.as_str() {
                FORMATTED_DATE => Segment::FormattedDate,
                name => Segment::Field(serialized_name(name)),
            });
            last_end = whole.end();
        }
        push_literal(&mut segments, &source[last_end..])?;

        Ok(Template {
            source: source.to_owned(),
            segments,
        })
    }

    /// Parse `custom`, falling back to `default` when `custom` is empty or invalid.
    pub fn parse_or_default(custom: &str, default: &str) -> Result<Template> {
        if custom.is_empty() {
            return Template::parse(default);
        }
        Template::parse(custom).or_else(|err| {
            log::warn!(target: "flagpipe", template = custom; "{err}, using default template");
            Template::parse(default)
        })
    }

    /// Default CSV template.
    pub fn default_csv() -> Template {
        Template::parse(DEFAULT_CSV_TEMPLATE).expect("default CSV template should be valid")
    }

    /// The text this template was parsed from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Render `event` with this template. `creation_date` is the unix timestamp (in seconds)
    /// used for `FormattedDate`.
    pub fn render<E: Serialize + ?Sized>(&self, event: &E, creation_date: i64) -> Result<String> {
        let fields = serde_json::to_value(event)?;
        let mut out = String::with_capacity(self.source.len() * 2);

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::FormattedDate => out.push_str(&format_date(creation_date)),
                Segment::Field(name) => {
                    if let Some(value) = fields.get(name) {
                        push_value(&mut out, value);
                    }
                }
            }
        }

        Ok(out)
    }
}

fn push_literal(segments: &mut Vec<Segment>, text: &str) -> Result<()> {
    if text.contains("{{") || text.contains("}}") {
        return Err(Error::Template(format!("malformed placeholder in {text:?}")));
    }
    if !text.is_empty() {
        segments.push(Segment::Literal(text.to_owned()));
    }
    Ok(())
}

/// `UserKey` -> `userKey`
fn serialized_name(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn push_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => {}
        Value::String(s) => out.push_str(s),
        other => out.push_str(&other.to_string()),
    }
}

fn format_date(creation_date: i64) -> String {
    DateTime::from_timestamp(creation_date, 0)
        .map(|date| date.to_rfc3339_opts(SecondsFormat::Secs, true))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn renders_fields_by_pascal_case_name() {
        let template = Template::parse("{{ .Key}}|{{.UserKey}}|{{ .Value }}").unwrap();
        let event = json!({"key": "my-flag", "userKey": "ABCD", "value": {"a": 1}});

        assert_eq!(
            template.render(&event, 0).unwrap(),
            r#"my-flag|ABCD|{"a":1}"#
        );
    }

    #[test]
    fn missing_and_null_fields_render_empty() {
        let template = Template::parse("[{{ .Source}}][{{ .Version}}]").unwrap();
        let event = json!({"version": null});

        assert_eq!(template.render(&event, 0).unwrap(), "[][]");
    }

    #[test]
    fn formatted_date_is_rfc3339() {
        let template = Template::parse("{{ .FormattedDate}}").unwrap();

        assert_eq!(
            template.render(&json!({}), 1617970547).unwrap(),
            "2021-04-09T12:15:47Z"
        );
    }

    #[test]
    fn malformed_placeholder_is_rejected() {
        let err = Template::parse("key=\"{{ .Key}\" [{{ .FormattedDate}}]").unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn falls_back_to_default_template() {
        let template = Template::parse_or_default("{{ .Key}", "{{ .Key}}").unwrap();
        assert_eq!(template.source(), "{{ .Key}}");

        let template = Template::parse_or_default("", DEFAULT_CSV_TEMPLATE).unwrap();
        assert_eq!(template, Template::default_csv());
    }
}
