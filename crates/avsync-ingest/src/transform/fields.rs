//! Typed access to raw source records
//!
//! Source payloads are loosely typed JSON: numbers arrive as strings, flags as
//! `0`/`1`, empty strings mean "absent". Every accessor normalises those
//! variations and reports a [`RecordError::Validation`] naming the field when a
//! value is present but unusable.

use crate::error::RecordError;
use crate::lookup::LookupCache;
use crate::stage::Stage;
use crate::types::TargetId;
use avsync_common::time::{format_canonical, parse_date, parse_timestamp};
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

pub struct Fields<'a> {
    raw: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    pub fn new(raw: &'a Value) -> Result<Self, RecordError> {
        raw.as_object()
            .map(|raw| Self { raw })
            .ok_or_else(|| RecordError::validation("$", "expected a JSON object"))
    }

    fn value(&self, field: &str) -> Option<&'a Value> {
        match self.raw.get(field) {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(value) => Some(value),
        }
    }

    /// Trimmed text; numbers and booleans are rendered as text.
    pub fn text(&self, field: &str) -> Option<String> {
        match self.value(field)? {
            Value::String(s) => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn required_text(&self, field: &str) -> Result<String, RecordError> {
        self.text(field)
            .ok_or_else(|| RecordError::validation(field, "missing required value"))
    }

    pub fn upper(&self, field: &str) -> Option<String> {
        self.text(field).map(|s| s.to_uppercase())
    }

    pub fn flag(&self, field: &str) -> Result<Option<bool>, RecordError> {
        let Some(value) = self.value(field) else {
            return Ok(None);
        };
        match value {
            Value::Bool(b) => Ok(Some(*b)),
            Value::Number(n) if n.as_i64() == Some(0) => Ok(Some(false)),
            Value::Number(n) if n.as_i64() == Some(1) => Ok(Some(true)),
            Value::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Ok(Some(true)),
                "false" | "0" | "no" => Ok(Some(false)),
                other => Err(RecordError::validation(field, format!("not a boolean: '{other}'"))),
            },
            other => Err(RecordError::validation(field, format!("not a boolean: {other}"))),
        }
    }

    pub fn integer(&self, field: &str) -> Result<Option<i64>, RecordError> {
        let Some(value) = self.value(field) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };
        parsed
            .map(Some)
            .ok_or_else(|| RecordError::validation(field, format!("not an integer: {value}")))
    }

    pub fn timestamp(&self, field: &str) -> Result<Option<DateTime<Utc>>, RecordError> {
        let Some(text) = self.text(field) else {
            return Ok(None);
        };
        parse_timestamp(&text)
            .map(Some)
            .map_err(|err| RecordError::validation(field, err.to_string()))
    }

    pub fn required_timestamp(&self, field: &str) -> Result<DateTime<Utc>, RecordError> {
        self.timestamp(field)?
            .ok_or_else(|| RecordError::validation(field, "missing required timestamp"))
    }

    pub fn date(&self, field: &str) -> Result<Option<NaiveDate>, RecordError> {
        let Some(text) = self.text(field) else {
            return Ok(None);
        };
        parse_date(&text)
            .map(Some)
            .map_err(|err| RecordError::validation(field, err.to_string()))
    }

    pub fn array(&self, field: &str) -> &'a [Value] {
        match self.raw.get(field) {
            Some(Value::Array(items)) => items.as_slice(),
            _ => &[],
        }
    }

    /// Natural key from the stage's key fields, joined with `|`.
    pub fn natural_key(&self, key_fields: &[&str]) -> Result<String, RecordError> {
        let parts = key_fields
            .iter()
            .map(|field| self.required_text(field))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join("|"))
    }

    /// Resolve a reference that must be present.
    pub fn reference(
        &self,
        field: &str,
        target: Stage,
        lookups: &LookupCache,
    ) -> Result<TargetId, RecordError> {
        let key = self.required_text(field)?;
        lookups.resolve(target, &key)
    }

    /// Resolve a reference if the field carries one.
    pub fn optional_reference(
        &self,
        field: &str,
        target: Stage,
        lookups: &LookupCache,
    ) -> Result<Option<TargetId>, RecordError> {
        self.text(field)
            .map(|key| lookups.resolve(target, &key))
            .transpose()
    }
}

/// Builder for the normalised JSON object of a canonical record
#[derive(Default)]
pub struct Record {
    data: Map<String, Value>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.data.insert(key.to_string(), value.into());
        self
    }

    /// Absent values are stored as JSON null so the shape stays stable.
    pub fn set_opt<T: Into<Value>>(self, key: &str, value: Option<T>) -> Self {
        let value = value.map_or(Value::Null, Into::into);
        self.set(key, value)
    }

    pub fn set_time(self, key: &str, value: Option<DateTime<Utc>>) -> Self {
        self.set_opt(key, value.as_ref().map(format_canonical))
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.data
    }
}
