//! Fixed-arity records built at the sanitizer boundary

use kgload_common::FileKind;
use serde_json::{Map, Number, Value};

use crate::sanitize::{sanitize_row, RowOutcome, SanitizeOptions};
use crate::schema::{FieldType, TableSchema};

/// One sanitized source row.
///
/// Always holds exactly `schema.width()` fields; fields are addressed by
/// column name, never by raw position.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    schema: &'static TableSchema,
    row: u64,
    fields: Box<[String]>,
}

impl Record {
    /// Sanitize a raw row against `schema`
    pub fn from_raw<S: AsRef<str>>(
        schema: &'static TableSchema,
        row: u64,
        raw_fields: &[S],
        options: &SanitizeOptions,
    ) -> (Self, RowOutcome) {
        let (fields, outcome) = sanitize_row(raw_fields, schema.width(), options);
        let record = Record {
            schema,
            row,
            fields: fields.into_boxed_slice(),
        };
        (record, outcome)
    }

    pub fn kind(&self) -> FileKind {
        self.schema.kind
    }

    /// 1-based line number in the source file
    pub fn row(&self) -> u64 {
        self.row
    }

    pub fn schema(&self) -> &'static TableSchema {
        self.schema
    }

    pub fn get(&self, column: &str) -> Option<&str> {
        self.schema
            .index_of(column)
            .and_then(|i| self.fields.get(i))
            .map(String::as_str)
    }

    pub fn key(&self) -> &str {
        self.fields
            .get(self.schema.key_index())
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Typed parameter map for one `UNWIND` row.
    ///
    /// Empty fields become `null` so `SET n += row` leaves no empty-string
    /// properties behind; numeric columns are sent as JSON numbers.
    pub fn to_params(&self) -> Map<String, Value> {
        self.schema
            .columns
            .iter()
            .zip(self.fields.iter())
            .map(|(column, value)| (column.name.to_string(), typed_value(column.ty, value)))
            .collect()
    }
}

fn typed_value(ty: FieldType, value: &str) -> Value {
    if value.is_empty() {
        return Value::Null;
    }
    match ty {
        FieldType::Integer => value
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(value.to_string())),
        FieldType::Decimal => value
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string())),
        FieldType::Identifier | FieldType::Text | FieldType::Category => {
            Value::String(value.to_string())
        },
    }
}
