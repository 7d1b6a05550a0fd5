use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
pub const DATE_FORMAT: &str = "%Y-%m-%d";
pub const TIME_FORMAT: &str = "%H:%M:%S";

lazy_static::lazy_static! {
    static ref INTEGER_RE: Regex = Regex::new(r"^[+-]?\d+([eE][+]?\d+)?$").unwrap_or_else(|e| panic!("integer regex: {e}"));
    static ref DECIMAL_RE: Regex =
        Regex::new(r"^[-+]?[0-9]*\.?[0-9]+([eE][-+]?[0-9]+)?$").unwrap_or_else(|e| panic!("decimal regex: {e}"));
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldType {
    Integer,
    Decimal,
    Datetime,
    Date,
    Time,
    Text,
    Wysiwyg,
    Selection,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::Integer => "INTEGER",
            FieldType::Decimal => "DECIMAL",
            FieldType::Datetime => "DATETIME",
            FieldType::Date => "DATE",
            FieldType::Time => "TIME",
            FieldType::Text => "TEXT",
            FieldType::Wysiwyg => "WYSIWYG",
            FieldType::Selection => "SELECTION",
        }
    }

    /// Types whose values are stored as `{"value": <string|null>}`.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldType::Wysiwyg)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = MetadataValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTEGER" => Ok(FieldType::Integer),
            "DECIMAL" => Ok(FieldType::Decimal),
            "DATETIME" => Ok(FieldType::Datetime),
            "DATE" => Ok(FieldType::Date),
            "TIME" => Ok(FieldType::Time),
            "TEXT" => Ok(FieldType::Text),
            "WYSIWYG" => Ok(FieldType::Wysiwyg),
            "SELECTION" => Ok(FieldType::Selection),
            other => Err(MetadataValueError::UnknownFieldType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataValueError {
    #[error("Unknown field type '{0}'.")]
    UnknownFieldType(String),
    #[error("Value '{value}' for key '{key}' is not a valid {expected}.")]
    InvalidFormat { key: String, value: String, expected: &'static str },
    #[error("Value for key '{key}' must be a string.")]
    NotAString { key: String },
    #[error("Value for key '{key}' must be an object.")]
    NotAnObject { key: String },
    #[error("Selection for key '{key}' has no options configured.")]
    MissingOptions { key: String },
    #[error("Value '{value}' for key '{key}' is not one of the available options.")]
    NotAnOption { key: String, value: String },
}

/// Empty or whitespace-only strings count as no value.
pub fn normalize(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        other => Some(other.clone()),
    }
}

fn as_text(key: &str, value: &Value) -> Result<String, MetadataValueError> {
    match value {
        Value::String(s) => Ok(s.trim().to_string()),
        Value::Number(n) => Ok(n.to_string()),
        _ => Err(MetadataValueError::NotAString { key: key.to_string() }),
    }
}

/// Checks `value` against `field_type`. `None` is always valid.
pub fn validate(key: &str, field_type: FieldType, value: Option<&Value>, config: &Value) -> Result<(), MetadataValueError> {
    let Some(value) = value else { return Ok(()) };
    let invalid = |text: &str, expected: &'static str| MetadataValueError::InvalidFormat {
        key: key.to_string(),
        value: text.to_string(),
        expected,
    };
    match field_type {
        FieldType::Wysiwyg => {
            if value.is_object() {
                Ok(())
            } else {
                Err(MetadataValueError::NotAnObject { key: key.to_string() })
            }
        }
        FieldType::Integer => {
            let text = as_text(key, value)?;
            if INTEGER_RE.is_match(&text) { Ok(()) } else { Err(invalid(&text, "integer")) }
        }
        FieldType::Decimal => {
            let text = as_text(key, value)?;
            if DECIMAL_RE.is_match(&text) { Ok(()) } else { Err(invalid(&text, "decimal")) }
        }
        FieldType::Datetime => {
            let text = as_text(key, value)?;
            NaiveDateTime::parse_from_str(&text, DATETIME_FORMAT).map(|_| ()).map_err(|_| invalid(&text, "datetime"))
        }
        FieldType::Date => {
            let text = as_text(key, value)?;
            NaiveDate::parse_from_str(&text, DATE_FORMAT).map(|_| ()).map_err(|_| invalid(&text, "date"))
        }
        FieldType::Time => {
            let text = as_text(key, value)?;
            NaiveTime::parse_from_str(&text, TIME_FORMAT).map(|_| ()).map_err(|_| invalid(&text, "time"))
        }
        FieldType::Text => as_text(key, value).map(|_| ()),
        FieldType::Selection => {
            let text = as_text(key, value)?;
            let options = config
                .get("options")
                .and_then(Value::as_array)
                .ok_or_else(|| MetadataValueError::MissingOptions { key: key.to_string() })?;
            let matches = options.iter().any(|opt| match opt {
                Value::String(s) => s == &text,
                other => other.to_string() == text,
            });
            if matches {
                Ok(())
            } else {
                Err(MetadataValueError::NotAnOption { key: key.to_string(), value: text })
            }
        }
    }
}

/// Converts a validated value into its stored JSON structure.
pub fn to_storage(field_type: FieldType, value: Option<&Value>) -> Value {
    if field_type.is_scalar() {
        let text = value.and_then(|v| match v {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });
        json!({ "value": text })
    } else {
        value.cloned().unwrap_or(Value::Null)
    }
}

/// Inverse of [`to_storage`]: the value as clients see it.
pub fn from_storage(field_type: FieldType, stored: Option<&Value>) -> Value {
    match stored {
        None => Value::Null,
        Some(stored) if field_type.is_scalar() => stored.get("value").cloned().unwrap_or(Value::Null),
        Some(stored) => stored.clone(),
    }
}

/// Whether a value, as returned by [`from_storage`], counts as filled in for completeness checks.
pub fn has_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(ft: FieldType, v: Value) -> Result<(), MetadataValueError> {
        validate("key", ft, normalize(&v).as_ref(), &json!({}))
    }

    #[test]
    fn integers_and_decimals() {
        assert!(check(FieldType::Integer, json!("42")).is_ok());
        assert!(check(FieldType::Integer, json!("-7")).is_ok());
        assert!(check(FieldType::Integer, json!("1e5")).is_ok());
        assert!(check(FieldType::Integer, json!(12)).is_ok());
        assert!(check(FieldType::Integer, json!("4.2")).is_err());
        assert!(check(FieldType::Decimal, json!("4.2")).is_ok());
        assert!(check(FieldType::Decimal, json!(".5e-3")).is_ok());
        assert!(check(FieldType::Decimal, json!("abc")).is_err());
    }

    #[test]
    fn dates_and_times() {
        assert!(check(FieldType::Datetime, json!("2024-02-29 13:45:00")).is_ok());
        assert!(check(FieldType::Datetime, json!("2024-02-29T13:45:00")).is_err());
        assert!(check(FieldType::Date, json!("2023-02-29")).is_err());
        assert!(check(FieldType::Date, json!("2024-02-29")).is_ok());
        assert!(check(FieldType::Time, json!("23:59:59")).is_ok());
        assert!(check(FieldType::Time, json!("24:00:00")).is_err());
    }

    #[test]
    fn selection_requires_configured_option() {
        let config = json!({ "options": ["red", "green"] });
        assert!(validate("color", FieldType::Selection, Some(&json!("red")), &config).is_ok());
        let err = validate("color", FieldType::Selection, Some(&json!("blue")), &config).unwrap_err();
        assert!(err.to_string().contains("color"));
        assert!(matches!(
            validate("color", FieldType::Selection, Some(&json!("red")), &json!({})),
            Err(MetadataValueError::MissingOptions { .. })
        ));
    }

    #[test]
    fn wysiwyg_needs_object() {
        assert!(check(FieldType::Wysiwyg, json!({"ops": []})).is_ok());
        assert!(check(FieldType::Wysiwyg, json!("<p>hi</p>")).is_err());
    }

    #[test]
    fn blank_values_are_null() {
        assert!(check(FieldType::Integer, json!("   ")).is_ok());
        assert_eq!(to_storage(FieldType::Text, normalize(&json!("  ")).as_ref()), json!({ "value": null }));
        assert_eq!(to_storage(FieldType::Text, Some(&json!(" a "))), json!({ "value": "a" }));
        assert_eq!(to_storage(FieldType::Wysiwyg, Some(&json!({"a": 1}))), json!({"a": 1}));
    }

    #[test]
    fn storage_round_trip_and_presence() {
        let stored = to_storage(FieldType::Integer, Some(&json!("5")));
        assert_eq!(from_storage(FieldType::Integer, Some(&stored)), json!("5"));
        assert!(has_value(&from_storage(FieldType::Integer, Some(&stored))));
        assert!(!has_value(&from_storage(FieldType::Text, Some(&json!({ "value": null })))));
        assert!(!has_value(&from_storage(FieldType::Text, Some(&json!({ "value": "  " })))));
        assert!(!has_value(&from_storage(FieldType::Wysiwyg, Some(&json!({})))));
        assert!(!has_value(&from_storage(FieldType::Text, None)));
        assert!(!has_value(&json!([])));
    }

    #[test]
    fn field_type_parsing() {
        assert_eq!("selection".parse::<FieldType>().unwrap(), FieldType::Selection);
        assert!("BLOB".parse::<FieldType>().is_err());
        assert_eq!(serde_json::to_value(FieldType::Wysiwyg).unwrap(), json!("WYSIWYG"));
    }
}
