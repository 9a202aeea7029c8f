//! # Typed Attribute Records
//!
//! Device models describe their attributes and action arguments as named,
//! typed fields. Instead of injecting properties dynamically at runtime,
//! a [`Schema`] is built once from the device model and produces [`Record`]s
//! whose setters validate type and format, returning `Result` rather than
//! panicking.
//!
//! A populated record converts into a DATA payload for the message builder
//! via [`Record::into_data`].

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{ValidationError, ValidationResult};
use crate::message::Payload;

// =============================================================================
// Field Types & Values
// =============================================================================

/// The declared type of a device-model field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Integer,
    Number,
    Text,
    Boolean,
    DateTime,
    Uri,
}

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::Integer => "INTEGER",
            FieldType::Number => "NUMBER",
            FieldType::Text => "STRING",
            FieldType::Boolean => "BOOLEAN",
            FieldType::DateTime => "DATETIME",
            FieldType::Uri => "URI",
        }
    }
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Integer(i64),
    Number(f64),
    Text(String),
    Boolean(bool),
    DateTime(DateTime<Utc>),
    Uri(String),
}

impl FieldValue {
    fn type_name(&self) -> &'static str {
        match self {
            FieldValue::Integer(_) => "INTEGER",
            FieldValue::Number(_) => "NUMBER",
            FieldValue::Text(_) => "STRING",
            FieldValue::Boolean(_) => "BOOLEAN",
            FieldValue::DateTime(_) => "DATETIME",
            FieldValue::Uri(_) => "URI",
        }
    }

    fn matches(&self, field_type: FieldType) -> bool {
        matches!(
            (self, field_type),
            (FieldValue::Integer(_), FieldType::Integer)
                | (FieldValue::Number(_), FieldType::Number)
                // Integers widen into NUMBER fields.
                | (FieldValue::Integer(_), FieldType::Number)
                | (FieldValue::Text(_), FieldType::Text)
                | (FieldValue::Boolean(_), FieldType::Boolean)
                | (FieldValue::DateTime(_), FieldType::DateTime)
                | (FieldValue::Uri(_), FieldType::Uri)
        )
    }

    fn into_json(self) -> Value {
        match self {
            FieldValue::Integer(v) => Value::from(v),
            FieldValue::Number(v) => Value::from(v),
            FieldValue::Text(v) => Value::String(v),
            FieldValue::Boolean(v) => Value::Bool(v),
            FieldValue::DateTime(v) => Value::String(v.to_rfc3339()),
            FieldValue::Uri(v) => Value::String(v),
        }
    }
}

// =============================================================================
// Schema
// =============================================================================

/// A single field declaration.
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    /// Optional fields may be left unset in a complete record.
    pub optional: bool,
}

impl FieldSpec {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            field_type,
            optional: false,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        FieldSpec {
            name: name.into(),
            field_type,
            optional: true,
        }
    }
}

/// Field declarations for one device-model attribute set or action.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    pub fn new(specs: impl IntoIterator<Item = FieldSpec>) -> Self {
        Schema {
            fields: specs
                .into_iter()
                .map(|spec| (spec.name.clone(), spec))
                .collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    /// Creates an empty record bound to this schema.
    pub fn record(&self) -> Record {
        Record {
            schema: self.clone(),
            values: BTreeMap::new(),
        }
    }
}

// =============================================================================
// Record
// =============================================================================

/// A partially or fully populated set of field values validated against a
/// [`Schema`].
#[derive(Debug, Clone)]
pub struct Record {
    schema: Schema,
    values: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Sets a field after validating the value against the schema.
    pub fn set(&mut self, name: &str, value: FieldValue) -> ValidationResult<()> {
        let spec = self
            .schema
            .field(name)
            .ok_or_else(|| ValidationError::UnknownField { field: name.into() })?;

        if !value.matches(spec.field_type) {
            return Err(ValidationError::TypeMismatch {
                field: name.into(),
                expected: spec.field_type.name(),
                actual: value.type_name(),
            });
        }

        if let FieldValue::Uri(uri) = &value {
            url::Url::parse(uri).map_err(|e| ValidationError::InvalidFormat {
                field: name.into(),
                reason: e.to_string(),
            })?;
        }

        self.values.insert(name.to_string(), value);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.values.get(name)
    }

    /// Verifies every non-optional field has been set.
    pub fn validate_complete(&self) -> ValidationResult<()> {
        for (name, spec) in &self.schema.fields {
            if !spec.optional && !self.values.contains_key(name) {
                return Err(ValidationError::Required { field: name.clone() });
            }
        }
        Ok(())
    }

    /// Converts the record into a DATA payload with the given format URN.
    /// Fails if a required field is missing.
    pub fn into_data(self, format: impl Into<String>) -> ValidationResult<Payload> {
        self.validate_complete()?;

        let data: Map<String, Value> = self
            .values
            .into_iter()
            .map(|(name, value)| (name, value.into_json()))
            .collect();

        Ok(Payload::Data {
            format: format.into(),
            data,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn thermometer_schema() -> Schema {
        Schema::new([
            FieldSpec::required("temperature", FieldType::Number),
            FieldSpec::required("unit", FieldType::Text),
            FieldSpec::optional("calibrated_at", FieldType::DateTime),
            FieldSpec::optional("datasheet", FieldType::Uri),
        ])
    }

    #[test]
    fn test_typed_set_and_get() {
        let mut record = thermometer_schema().record();
        record.set("temperature", FieldValue::Number(21.5)).unwrap();
        record.set("unit", FieldValue::Text("celsius".into())).unwrap();

        assert_eq!(record.get("temperature"), Some(&FieldValue::Number(21.5)));
    }

    #[test]
    fn test_integer_widens_into_number() {
        let mut record = thermometer_schema().record();
        record.set("temperature", FieldValue::Integer(21)).unwrap();
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let mut record = thermometer_schema().record();
        let err = record
            .set("temperature", FieldValue::Text("hot".into()))
            .unwrap_err();
        assert_eq!(
            err,
            ValidationError::TypeMismatch {
                field: "temperature".into(),
                expected: "NUMBER",
                actual: "STRING",
            }
        );
    }

    #[test]
    fn test_unknown_field_rejected() {
        let mut record = thermometer_schema().record();
        assert!(matches!(
            record.set("pressure", FieldValue::Number(1.0)),
            Err(ValidationError::UnknownField { .. })
        ));
    }

    #[test]
    fn test_uri_format_validated() {
        let mut record = thermometer_schema().record();
        assert!(record
            .set("datasheet", FieldValue::Uri("https://example.com/ds.pdf".into()))
            .is_ok());
        assert!(matches!(
            record.set("datasheet", FieldValue::Uri("not a uri".into())),
            Err(ValidationError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn test_into_data_requires_completeness() {
        let mut record = thermometer_schema().record();
        record.set("temperature", FieldValue::Number(20.0)).unwrap();

        // "unit" missing.
        assert!(matches!(
            record.clone().into_data("urn:cloudlink:format:thermometer"),
            Err(ValidationError::Required { .. })
        ));

        record.set("unit", FieldValue::Text("celsius".into())).unwrap();
        let payload = record.into_data("urn:cloudlink:format:thermometer").unwrap();
        match payload {
            Payload::Data { format, data } => {
                assert_eq!(format, "urn:cloudlink:format:thermometer");
                assert_eq!(data.get("unit"), Some(&Value::String("celsius".into())));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
