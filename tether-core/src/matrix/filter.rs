use serde_json::{json, Map, Value};

use crate::matrix::{
    error::MatrixError,
    settings::{SettingKey, SettingsStore},
};

/// The sync filter as the client holds it.
///
/// Until it has been registered with the homeserver the filter is the
/// literal JSON definition; afterwards it is the server-assigned id. Both go
/// into the `filter` query parameter as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncFilter {
    Definition(String),
    Id(String),
}

impl SyncFilter {
    /// Interpret a stored value: anything starting with `{` is a definition.
    pub fn from_stored(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.starts_with('{') {
            Self::Definition(value)
        } else {
            Self::Id(value)
        }
    }

    /// Load from settings, falling back to [`default_filter`].
    pub fn load(store: &dyn SettingsStore) -> Self {
        match store.load(SettingKey::SyncFilter) {
            Some(v) if !v.trim().is_empty() => Self::from_stored(v),
            _ => Self::Definition(default_filter().to_string()),
        }
    }

    pub fn is_registered(&self) -> bool {
        matches!(self, Self::Id(_))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Definition(s) | Self::Id(s) => s,
        }
    }

    /// The definition as a JSON object, ready to upload.
    pub fn definition(&self) -> Result<Option<Map<String, Value>>, MatrixError> {
        match self {
            Self::Id(_) => Ok(None),
            Self::Definition(raw) => parse_definition(raw).map(Some),
        }
    }
}

/// Parse a literal filter definition; it must be a JSON object.
pub fn parse_definition(raw: &str) -> Result<Map<String, Value>, MatrixError> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(obj)) => Ok(obj),
        _ => Err(MatrixError::InvalidFilter),
    }
}

/// Include left rooms; drop presence and all account data.
pub fn default_filter() -> Value {
    json!({
        "room": {
            "include_leave": true,
            "account_data": { "not_types": ["*"] },
        },
        "account_data": { "not_types": ["*"] },
        "presence": { "not_types": ["*"] },
    })
}
