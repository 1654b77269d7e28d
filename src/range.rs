//! Key-range query model.
//!
//! Keys travel as base64 text in the backend's JSON gateway and are decoded to
//! raw bytes here before any range arithmetic happens. The raw request body is
//! never re-encoded: the frontend forwards exactly what it received.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{
    de::{self, IgnoredAny},
    Deserialize, Deserializer, Serialize,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeError {
    #[error("Invalid request body: {0}")]
    InvalidJson(String),

    #[error("Field '{0}' is not valid base64")]
    InvalidBase64(&'static str),

    #[error("empty key not permitted")]
    EmptyKey,

    #[error("Malformed range: range_end must be greater than key")]
    MalformedRange,

    #[error("Only watch create requests are supported")]
    UnsupportedWatchRequest,
}

/// Accepted as the enum name (`"DESCEND"`) or its numeric value (`2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    None,
    Ascend,
    Descend,
}

impl<'de> Deserialize<'de> for SortOrder {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match enum_index(deserializer, &["NONE", "ASCEND", "DESCEND"])? {
            0 => SortOrder::None,
            1 => SortOrder::Ascend,
            _ => SortOrder::Descend,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortTarget {
    #[default]
    Key,
    Version,
    Create,
    Mod,
    Value,
}

impl<'de> Deserialize<'de> for SortTarget {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(
            match enum_index(deserializer, &["KEY", "VERSION", "CREATE", "MOD", "VALUE"])? {
                0 => SortTarget::Key,
                1 => SortTarget::Version,
                2 => SortTarget::Create,
                3 => SortTarget::Mod,
                _ => SortTarget::Value,
            },
        )
    }
}

/// A decoded range (or watch) request.
///
/// `range_end` empty means a point read of `key`; otherwise the query covers
/// the half-open interval `[key, range_end)`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RangeQuery {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    pub limit: i64,
    pub sort_order: SortOrder,
    pub sort_target: SortTarget,
    pub keys_only: bool,
    pub count_only: bool,
    pub revision: Option<i64>,
    pub min_mod_revision: Option<i64>,
    pub max_mod_revision: Option<i64>,
    pub min_create_revision: Option<i64>,
    pub max_create_revision: Option<i64>,
}

impl RangeQuery {
    /// Point read of a single key.
    pub fn point(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    /// Query over `[key, range_end)`.
    pub fn interval(key: impl Into<Vec<u8>>, range_end: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            range_end: range_end.into(),
            ..Default::default()
        }
    }

    /// Query for every key starting with `prefix`.
    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let key = prefix.into();
        let range_end = prefix_range_end(&key);
        Self::interval(key, range_end)
    }

    pub fn is_point_read(&self) -> bool {
        self.range_end.is_empty()
    }

    /// Decode and validate a range request body.
    pub fn decode(body: &[u8]) -> Result<Self, RangeError> {
        let wire: RangeRequestBody =
            serde_json::from_slice(body).map_err(|e| RangeError::InvalidJson(e.to_string()))?;
        let query = wire.into_query()?;
        query.validate()?;
        Ok(query)
    }

    /// Decode and validate a watch request body. Only `create_request`
    /// bodies name a key range; anything else is rejected.
    pub fn decode_watch(body: &[u8]) -> Result<Self, RangeError> {
        let wire: WatchRequestBody =
            serde_json::from_slice(body).map_err(|e| RangeError::InvalidJson(e.to_string()))?;
        if wire.cancel_request.is_some() || wire.progress_request.is_some() {
            return Err(RangeError::UnsupportedWatchRequest);
        }
        let create = wire
            .create_request
            .ok_or(RangeError::UnsupportedWatchRequest)?;
        let query = Self {
            key: decode_b64(&create.key, "key")?,
            range_end: decode_b64(create.range_end.as_deref().unwrap_or_default(), "range_end")?,
            revision: create.start_revision,
            ..Default::default()
        };
        query.validate()?;
        Ok(query)
    }

    pub fn validate(&self) -> Result<(), RangeError> {
        if self.key.is_empty() {
            return Err(RangeError::EmptyKey);
        }
        if !self.range_end.is_empty() && self.range_end <= self.key {
            return Err(RangeError::MalformedRange);
        }
        Ok(())
    }
}

/// Smallest byte string greater than every string starting with `prefix`.
///
/// Increments the last byte that is not `0xFF` after dropping trailing `0xFF`
/// bytes. Returns an empty vector, meaning unbounded, when `prefix` is empty
/// or made only of `0xFF` bytes.
pub fn prefix_range_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xFF {
            end.push(last + 1);
            return end;
        }
    }
    end
}

pub fn encode_key(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

pub fn decode_key(text: &str) -> Option<Vec<u8>> {
    STANDARD.decode(text).ok()
}

fn decode_b64(text: &str, field: &'static str) -> Result<Vec<u8>, RangeError> {
    decode_key(text).ok_or(RangeError::InvalidBase64(field))
}

// The gateway accepts both the proto field name and its lowerCamelCase JSON
// name, so every field carries the camelCase alias: sending both spellings is
// a duplicate field, and any field not listed here rejects the body. Nothing
// the backend would read can escape authorisation.

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RangeRequestBody {
    #[serde(default)]
    key: String,
    #[serde(default, alias = "rangeEnd")]
    range_end: Option<String>,
    #[serde(default, deserialize_with = "opt_i64")]
    limit: Option<i64>,
    #[serde(default, alias = "sortOrder")]
    sort_order: Option<SortOrder>,
    #[serde(default, alias = "sortTarget")]
    sort_target: Option<SortTarget>,
    #[serde(default, rename = "serializable")]
    _serializable: Option<bool>,
    #[serde(default, alias = "keysOnly")]
    keys_only: Option<bool>,
    #[serde(default, alias = "countOnly")]
    count_only: Option<bool>,
    #[serde(default, deserialize_with = "opt_i64")]
    revision: Option<i64>,
    #[serde(default, alias = "minModRevision", deserialize_with = "opt_i64")]
    min_mod_revision: Option<i64>,
    #[serde(default, alias = "maxModRevision", deserialize_with = "opt_i64")]
    max_mod_revision: Option<i64>,
    #[serde(default, alias = "minCreateRevision", deserialize_with = "opt_i64")]
    min_create_revision: Option<i64>,
    #[serde(default, alias = "maxCreateRevision", deserialize_with = "opt_i64")]
    max_create_revision: Option<i64>,
}

impl RangeRequestBody {
    fn into_query(self) -> Result<RangeQuery, RangeError> {
        Ok(RangeQuery {
            key: decode_b64(&self.key, "key")?,
            range_end: decode_b64(self.range_end.as_deref().unwrap_or_default(), "range_end")?,
            limit: self.limit.unwrap_or(0),
            sort_order: self.sort_order.unwrap_or_default(),
            sort_target: self.sort_target.unwrap_or_default(),
            keys_only: self.keys_only.unwrap_or(false),
            count_only: self.count_only.unwrap_or(false),
            revision: self.revision,
            min_mod_revision: self.min_mod_revision,
            max_mod_revision: self.max_mod_revision,
            min_create_revision: self.min_create_revision,
            max_create_revision: self.max_create_revision,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WatchRequestBody {
    #[serde(default, alias = "createRequest")]
    create_request: Option<WatchCreateBody>,
    #[serde(default, alias = "cancelRequest")]
    cancel_request: Option<IgnoredAny>,
    #[serde(default, alias = "progressRequest")]
    progress_request: Option<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WatchCreateBody {
    #[serde(default)]
    key: String,
    #[serde(default, alias = "rangeEnd")]
    range_end: Option<String>,
    #[serde(default, alias = "startRevision", deserialize_with = "opt_i64")]
    start_revision: Option<i64>,
    #[serde(default, rename = "progress_notify", alias = "progressNotify")]
    _progress_notify: Option<bool>,
    #[serde(default, rename = "filters")]
    _filters: Option<Vec<IgnoredAny>>,
    #[serde(default, rename = "prev_kv", alias = "prevKv")]
    _prev_kv: Option<bool>,
    #[serde(default, rename = "watch_id", alias = "watchId")]
    _watch_id: Option<IgnoredAny>,
    #[serde(default, rename = "fragment")]
    _fragment: Option<bool>,
}

/// The backend's JSON gateway writes 64-bit integers as strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrString {
    Number(i64),
    String(String),
}

fn opt_i64<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<NumberOrString>::deserialize(deserializer)? {
        None => Ok(None),
        Some(NumberOrString::Number(n)) => Ok(Some(n)),
        Some(NumberOrString::String(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("invalid integer '{}'", s))),
    }
}

/// Position of an enum value given by name or by number.
fn enum_index<'de, D>(deserializer: D, names: &'static [&'static str]) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let index = match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => usize::try_from(n).ok().filter(|i| *i < names.len()),
        NumberOrString::String(s) => names.iter().position(|name| *name == s),
    };
    index.ok_or_else(|| de::Error::custom(format!("expected one of {:?}", names)))
}
