//! TOML payload codec with size ceilings and pluggable validators.
//!
//! Inbound payloads are decoded into a [`toml::Table`] and run through every
//! registered validator. Validators are independent: each one is invoked
//! even if an earlier one failed or panicked, and every failure is kept as
//! a plain string.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;

use thiserror::Error;
use toml::{Table, Value};
use tracing::{debug, warn};

/// Default ceiling for in-memory payloads (1 MiB).
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Default ceiling for payload files (10 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("payload too large: {size} bytes (max: {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("invalid TOML syntax: {0}")]
    Syntax(#[from] toml::de::Error),

    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("validation failed: {}", .0.join("; "))]
    Invalid(Vec<String>),

    #[error("cannot read payload file {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

/// A validator inspects a decoded table and reports every problem it finds.
pub type Validator = Box<dyn Fn(&Table) -> Result<(), Vec<String>> + Send + Sync>;

/// Where a payload came from.
#[derive(Debug, Clone)]
pub enum PayloadSource {
    File(PathBuf),
    Text(String),
    Table(Table),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    File,
    Text,
    Table,
}

/// A parsed payload plus its provenance and validation outcome.
#[derive(Debug, Clone)]
pub struct ParsedPayload {
    pub data: Table,
    pub kind: SourceKind,
    pub source_info: String,
    pub validation_errors: Vec<String>,
}

impl ParsedPayload {
    pub fn is_valid(&self) -> bool {
        self.validation_errors.is_empty()
    }
}

/// Size limits applied before any parsing happens.
#[derive(Debug, Clone, Copy)]
pub struct CodecLimits {
    pub max_payload_bytes: usize,
    pub max_file_bytes: u64,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

/// TOML codec. Cheap to share behind an `Arc`; validators are registered
/// up front with [`TomlCodec::with_validator`].
pub struct TomlCodec {
    limits: CodecLimits,
    validators: Vec<Validator>,
}

impl std::fmt::Debug for TomlCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TomlCodec")
            .field("limits", &self.limits)
            .field("validators", &self.validators.len())
            .finish()
    }
}

impl Default for TomlCodec {
    fn default() -> Self {
        Self::new(CodecLimits::default())
    }
}

impl TomlCodec {
    pub fn new(limits: CodecLimits) -> Self {
        Self {
            limits,
            validators: Vec::new(),
        }
    }

    pub fn with_validator<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Table) -> Result<(), Vec<String>> + Send + Sync + 'static,
    {
        self.add_validator(validator);
        self
    }

    pub fn add_validator<F>(&mut self, validator: F)
    where
        F: Fn(&Table) -> Result<(), Vec<String>> + Send + Sync + 'static,
    {
        self.validators.push(Box::new(validator));
    }

    pub fn limits(&self) -> CodecLimits {
        self.limits
    }

    /// Decode raw message bytes. Oversized input is rejected before parsing;
    /// any validator failure turns into [`CodecError::Invalid`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Table, CodecError> {
        if bytes.len() > self.limits.max_payload_bytes {
            return Err(CodecError::TooLarge {
                size: bytes.len() as u64,
                max: self.limits.max_payload_bytes as u64,
            });
        }
        let text = std::str::from_utf8(bytes)?;
        let data: Table = toml::from_str(text)?;
        self.validate(&data).map_err(CodecError::Invalid)?;
        Ok(data)
    }

    /// Serialize a table for publishing.
    pub fn encode(&self, data: &Table) -> Result<Vec<u8>, CodecError> {
        Ok(toml::to_string(data)?.into_bytes())
    }

    /// Run every registered validator and aggregate their failures.
    pub fn validate(&self, data: &Table) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        for validator in &self.validators {
            match catch_unwind(AssertUnwindSafe(|| validator(data))) {
                Ok(Ok(())) => {}
                Ok(Err(found)) => errors.extend(found),
                Err(panic) => errors.push(format!("validator panicked: {}", panic_message(&*panic))),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parse a payload from a file, a TOML string, or an existing table.
    ///
    /// Validation failures do not make this fail; they are reported on the
    /// returned [`ParsedPayload`].
    pub fn parse(&self, source: PayloadSource) -> Result<ParsedPayload, CodecError> {
        let (data, kind, source_info): (Table, SourceKind, String) = match source {
            PayloadSource::Table(table) => (table, SourceKind::Table, "table".to_string()),
            PayloadSource::Text(text) => {
                if text.len() > self.limits.max_payload_bytes {
                    return Err(CodecError::TooLarge {
                        size: text.len() as u64,
                        max: self.limits.max_payload_bytes as u64,
                    });
                }
                let info = format!("string content ({} characters)", text.chars().count());
                (toml::from_str(&text)?, SourceKind::Text, info)
            }
            PayloadSource::File(path) => {
                let text = self.read_file(&path)?;
                let info = path.display().to_string();
                (toml::from_str(&text)?, SourceKind::File, info)
            }
        };

        let validation_errors = match self.validate(&data) {
            Ok(()) => Vec::new(),
            Err(errors) => {
                warn!(source = %source_info, ?errors, "payload validation failed");
                errors
            }
        };
        debug!(source = %source_info, "parsed payload");

        Ok(ParsedPayload {
            data,
            kind,
            source_info,
            validation_errors,
        })
    }

    fn read_file(&self, path: &std::path::Path) -> Result<String, CodecError> {
        let file_err = |reason: String| CodecError::File {
            path: path.to_path_buf(),
            reason,
        };

        let meta = std::fs::metadata(path).map_err(|e| file_err(e.to_string()))?;
        if !meta.is_file() {
            return Err(file_err("not a regular file".to_string()));
        }
        if meta.len() > self.limits.max_file_bytes {
            return Err(CodecError::TooLarge {
                size: meta.len(),
                max: self.limits.max_file_bytes,
            });
        }
        std::fs::read_to_string(path).map_err(|e| file_err(e.to_string()))
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

// ---------------------------------------------------------------------------
// Built-in validators
// ---------------------------------------------------------------------------

/// The kind of a TOML value, for [`field_types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    String,
    Integer,
    Float,
    Boolean,
    Datetime,
    Array,
    Table,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::String(_) => ValueKind::String,
            Value::Integer(_) => ValueKind::Integer,
            Value::Float(_) => ValueKind::Float,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Datetime(_) => ValueKind::Datetime,
            Value::Array(_) => ValueKind::Array,
            Value::Table(_) => ValueKind::Table,
        }
    }
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Float => "float",
            ValueKind::Boolean => "boolean",
            ValueKind::Datetime => "datetime",
            ValueKind::Array => "array",
            ValueKind::Table => "table",
        };
        write!(f, "{s}")
    }
}

/// Validator requiring every named top-level field to be present.
pub fn required_fields(
    fields: &[&str],
) -> impl Fn(&Table) -> Result<(), Vec<String>> + Send + Sync + 'static {
    let fields: Vec<String> = fields.iter().map(|f| f.to_string()).collect();
    move |data: &Table| {
        let errors: Vec<String> = fields
            .iter()
            .filter(|field| !data.contains_key(field.as_str()))
            .map(|field| format!("required field missing: {field}"))
            .collect();
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Validator checking the kind of each named field, when present.
pub fn field_types(
    expected: &[(&str, ValueKind)],
) -> impl Fn(&Table) -> Result<(), Vec<String>> + Send + Sync + 'static {
    let expected: Vec<(String, ValueKind)> = expected
        .iter()
        .map(|(name, kind)| (name.to_string(), *kind))
        .collect();
    move |data: &Table| {
        let errors: Vec<String> = expected
            .iter()
            .filter_map(|(name, kind)| {
                let actual = ValueKind::of(data.get(name)?);
                (actual != *kind)
                    .then(|| format!("field '{name}' should be {kind}, got {actual}"))
            })
            .collect();
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}
