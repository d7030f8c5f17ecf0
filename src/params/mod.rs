//! Turning untyped request maps into typed, fully defaulted descriptors
//!
//! Every descriptor is validated in the same order, stopping at the first
//! failure:
//!
//! 1. the input itself must be a map,
//! 2. every required field must be present, non-null and of the right type,
//! 3. every required string must be non-empty,
//! 4. enumerated and structured fields (target directory, parts, url,
//!    method, interval) must hold an accepted value.
//!
//! Optional fields fall back to their defaults when absent or null.

mod cancel;
mod fetch;
mod send;
mod upload;

pub use cancel::CancelRequest;
pub use fetch::{FetchRequest, ManagerSettings, TargetDirectory};
pub use send::SendRequest;
pub use upload::{FilePayload, Part, PartPayload, UploadRequest};

use http::Method;
use serde_json::{Map, Value};
use std::time::Duration;
use url::Url;

use crate::{Error, Result};

/// MIME type used when none is supplied
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

pub(crate) const PARAMETER_TASK_ID: &str = "taskId";
pub(crate) const PARAMETER_URL: &str = "url";
pub(crate) const PARAMETER_METHOD: &str = "method";
pub(crate) const PARAMETER_HEADERS: &str = "headers";
pub(crate) const PARAMETER_PROGRESS_INTERVAL: &str = "progressIntervalMilliseconds";
pub(crate) const PARAMETER_RETURN_RESPONSE: &str = "returnResponse";
pub(crate) const PARAMETER_MIME_TYPE: &str = "mimeType";
pub(crate) const PARAMETER_ABSOLUTE_FILE_PATH: &str = "absoluteFilePath";

/// Fields shared by every transfer descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Common {
    /// Correlation key for progress and cancellation
    pub task_id: String,
    /// Absolute request URL
    pub url: Url,
    /// HTTP verb
    pub method: Method,
    /// String-valued request headers in declaration order
    pub headers: Vec<(String, String)>,
    /// Throttle window for progress events
    pub progress_interval: Duration,
}

impl Common {
    /// Finish the shared fields once the required strings are known to be present and non-empty
    pub(crate) fn build(
        fields: &Fields<'_>,
        task_id: &str,
        url: &str,
        default_method: Method,
        default_interval_ms: u64,
    ) -> Result<Self> {
        Ok(Self {
            task_id: task_id.to_string(),
            url: parse_url(url)?,
            method: parse_method(fields.optional_str(PARAMETER_METHOD)?, default_method)?,
            headers: fields.headers()?,
            progress_interval: fields.progress_interval(default_interval_ms)?,
        })
    }
}

/// Read-only view over the raw input map
pub(crate) struct Fields<'a> {
    map: &'a Map<String, Value>,
}

impl<'a> Fields<'a> {
    /// Step one: the input must be a map
    pub(crate) fn root(raw: &'a Value) -> Result<Self> {
        match raw {
            Value::Object(map) => Ok(Self { map }),
            Value::Null => Err(Error::no_key("parameters")),
            _ => Err(Error::missing("parameters", "map")),
        }
    }

    pub(crate) fn from_map(map: &'a Map<String, Value>) -> Self {
        Self { map }
    }

    /// Present and non-null, or `None`
    pub(crate) fn get(&self, name: &str) -> Option<&'a Value> {
        self.map.get(name).filter(|v| !v.is_null())
    }

    pub(crate) fn required(&self, name: &str) -> Result<&'a Value> {
        self.get(name).ok_or_else(|| Error::no_key(name))
    }

    pub(crate) fn required_str(&self, name: &str) -> Result<&'a str> {
        self.required(name)?
            .as_str()
            .ok_or_else(|| Error::missing(name, "String"))
    }

    pub(crate) fn optional_str(&self, name: &str) -> Result<Option<&'a str>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(other) => Err(Error::invalid(name, other.to_string())),
        }
    }

    pub(crate) fn optional_bool(&self, name: &str) -> Result<Option<bool>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(Error::invalid(name, other.to_string())),
        }
    }

    pub(crate) fn optional_map(&self, name: &str) -> Result<Option<Fields<'a>>> {
        match self.get(name) {
            None => Ok(None),
            Some(Value::Object(map)) => Ok(Some(Fields::from_map(map))),
            Some(other) => Err(Error::invalid(name, other.to_string())),
        }
    }

    /// Only entries whose value is exactly a string survive
    pub(crate) fn headers(&self) -> Result<Vec<(String, String)>> {
        let Some(headers) = self.optional_map(PARAMETER_HEADERS)? else {
            return Ok(Vec::new());
        };

        Ok(headers
            .map
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
            .collect())
    }

    pub(crate) fn progress_interval(&self, default_ms: u64) -> Result<Duration> {
        let Some(value) = self.get(PARAMETER_PROGRESS_INTERVAL) else {
            return Ok(Duration::from_millis(default_ms));
        };

        let millis = value.as_u64().or_else(|| {
            value
                .as_f64()
                .filter(|f| *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        });

        millis
            .map(Duration::from_millis)
            .ok_or_else(|| Error::invalid(PARAMETER_PROGRESS_INTERVAL, value.to_string()))
    }
}

pub(crate) fn non_empty(name: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::empty(name));
    }
    Ok(())
}

pub(crate) fn parse_url(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|_| Error::invalid(PARAMETER_URL, raw))
}

pub(crate) fn parse_method(raw: Option<&str>, default: Method) -> Result<Method> {
    match raw {
        None => Ok(default),
        Some(raw) => Method::from_bytes(raw.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::invalid(PARAMETER_METHOD, raw)),
    }
}

/// Accepts both `/path` and `file:///path`
pub(crate) fn strip_file_scheme(raw: &str) -> &str {
    raw.strip_prefix("file://").unwrap_or(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_root_must_be_a_map() {
        assert_eq!(Fields::root(&Value::Null).err(), Some(Error::no_key("parameters")));
        assert_eq!(
            Fields::root(&json!([1, 2])).err(),
            Some(Error::missing("parameters", "map"))
        );
    }

    #[test]
    fn test_missing_and_null_are_the_same() {
        let raw = json!({"url": null});
        let fields = Fields::root(&raw).unwrap();

        assert_eq!(fields.required_str("url").err(), Some(Error::no_key("url")));
        assert_eq!(fields.required_str("taskId").err(), Some(Error::no_key("taskId")));
    }

    #[test]
    fn test_wrong_type_is_missing_parameter() {
        let raw = json!({"url": 5});
        let fields = Fields::root(&raw).unwrap();
        assert_eq!(fields.required_str("url").err(), Some(Error::missing("url", "String")));
    }

    #[test]
    fn test_header_filtering() {
        let raw = json!({"headers": {"a": "x", "b": 5, "c": null}});
        let fields = Fields::root(&raw).unwrap();
        assert_eq!(fields.headers().unwrap(), vec![("a".to_string(), "x".to_string())]);
    }

    #[test]
    fn test_progress_interval() {
        let fields_of = |v: Value| json!({ "progressIntervalMilliseconds": v });

        let raw = fields_of(json!(250));
        assert_eq!(
            Fields::root(&raw).unwrap().progress_interval(500).unwrap(),
            Duration::from_millis(250)
        );

        let raw = fields_of(json!(100.0));
        assert_eq!(
            Fields::root(&raw).unwrap().progress_interval(500).unwrap(),
            Duration::from_millis(100)
        );

        let raw = json!({});
        assert_eq!(
            Fields::root(&raw).unwrap().progress_interval(500).unwrap(),
            Duration::from_millis(500)
        );

        let raw = fields_of(json!(-1));
        assert!(matches!(
            Fields::root(&raw).unwrap().progress_interval(500),
            Err(Error::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_method_parsing() {
        assert_eq!(parse_method(None, Method::GET).unwrap(), Method::GET);
        assert_eq!(parse_method(Some("put"), Method::GET).unwrap(), Method::PUT);
        assert_eq!(
            parse_method(Some("BAD VERB"), Method::GET).err(),
            Some(Error::invalid("method", "BAD VERB"))
        );
    }

    #[test]
    fn test_url_must_be_absolute() {
        assert!(parse_url("https://example.com/x").is_ok());
        assert_eq!(parse_url("/relative").err(), Some(Error::invalid("url", "/relative")));
    }
}
