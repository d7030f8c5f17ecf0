use http::Method;
use serde_json::Value;

use super::{
    Common, DEFAULT_MIME_TYPE, Fields, PARAMETER_MIME_TYPE, PARAMETER_TASK_ID, PARAMETER_URL,
    non_empty,
};
use crate::{Error, Result};

const PARAMETER_FILENAME: &str = "filename";
const PARAMETER_TARGET: &str = "target";
const PARAMETER_USE_DOWNLOAD_MANAGER: &str = "useDownloadManager";
const PARAMETER_DOWNLOAD_MANAGER: &str = "downloadManager";
const PARAMETER_ANDROID_SETTINGS: &str = "android";
const PARAMETER_IOS_SETTINGS: &str = "ios";
const PARAMETER_TITLE: &str = "title";
const PARAMETER_DESCRIPTION: &str = "description";
const PARAMETER_ENABLE_NOTIFICATIONS: &str = "enableNotifications";

/// Sandbox directory a fetched blob lands in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TargetDirectory {
    /// Purgeable cache storage
    #[default]
    Cache,
    /// Persistent app data storage
    Data,
}

impl TargetDirectory {
    /// Case-insensitive parse of `cache` / `data`
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_ascii_lowercase().as_str() {
            "cache" => Some(TargetDirectory::Cache),
            "data" => Some(TargetDirectory::Data),
            _ => None,
        }
    }
}

/// Options handed to the OS download manager
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Notification title
    pub title: Option<String>,
    /// Notification description
    pub description: Option<String>,
    /// Whether the manager shows a notification
    pub notifications_enabled: bool,
}

/// Validated download descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    /// Shared transfer fields
    pub common: Common,
    /// File name inside the target directory
    pub filename: String,
    /// Target sandbox directory
    pub target: TargetDirectory,
    /// Delegate to the OS download manager
    pub use_download_manager: bool,
    /// OS download manager options
    pub manager: ManagerSettings,
    /// MIME type advertised to the download manager
    pub mime_type: String,
}

impl FetchRequest {
    /// Validate a raw fetch map
    pub fn from_value(raw: &Value, default_interval_ms: u64) -> Result<Self> {
        let fields = Fields::root(raw)?;

        let task_id = fields.required_str(PARAMETER_TASK_ID)?;
        let url = fields.required_str(PARAMETER_URL)?;
        let filename = fields.required_str(PARAMETER_FILENAME)?;

        non_empty(PARAMETER_TASK_ID, task_id)?;
        non_empty(PARAMETER_URL, url)?;
        non_empty(PARAMETER_FILENAME, filename)?;

        let target = match setting(&fields, PARAMETER_TARGET) {
            None => TargetDirectory::default(),
            Some(Value::String(raw)) => TargetDirectory::parse(raw)
                .ok_or_else(|| Error::invalid(PARAMETER_TARGET, raw.as_str()))?,
            Some(other) => return Err(Error::invalid(PARAMETER_TARGET, other.to_string())),
        };

        let use_download_manager = match setting(&fields, PARAMETER_USE_DOWNLOAD_MANAGER) {
            None => false,
            Some(Value::Bool(b)) => *b,
            Some(other) => {
                return Err(Error::invalid(
                    PARAMETER_USE_DOWNLOAD_MANAGER,
                    other.to_string(),
                ));
            }
        };

        let manager = match setting(&fields, PARAMETER_DOWNLOAD_MANAGER) {
            None => ManagerSettings::default(),
            Some(Value::Object(map)) => {
                let settings = Fields::from_map(map);
                ManagerSettings {
                    title: settings.optional_str(PARAMETER_TITLE)?.map(str::to_string),
                    description: settings
                        .optional_str(PARAMETER_DESCRIPTION)?
                        .map(str::to_string),
                    notifications_enabled: settings
                        .optional_bool(PARAMETER_ENABLE_NOTIFICATIONS)?
                        .unwrap_or(false),
                }
            }
            Some(other) => {
                return Err(Error::invalid(PARAMETER_DOWNLOAD_MANAGER, other.to_string()));
            }
        };

        let common = Common::build(&fields, task_id, url, Method::GET, default_interval_ms)?;

        if filename.contains(['/', '\\']) || filename == "." || filename == ".." {
            return Err(Error::invalid(PARAMETER_FILENAME, filename));
        }

        let mime_type = fields
            .optional_str(PARAMETER_MIME_TYPE)?
            .filter(|m| !m.is_empty())
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();

        Ok(Self {
            common,
            filename: filename.to_string(),
            target,
            use_download_manager,
            manager,
            mime_type,
        })
    }
}

/// Settings may sit at the top level or inside the per-platform maps
fn setting<'a>(fields: &Fields<'a>, name: &str) -> Option<&'a Value> {
    fields.get(name).or_else(|| {
        [PARAMETER_ANDROID_SETTINGS, PARAMETER_IOS_SETTINGS]
            .iter()
            .filter_map(|platform| fields.get(platform).and_then(Value::as_object))
            .find_map(|map| map.get(name).filter(|v| !v.is_null()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn valid() -> Value {
        json!({
            "taskId": "task-1",
            "url": "https://example.com/file.bin",
            "filename": "file.bin",
        })
    }

    #[test]
    fn test_defaults() {
        let request = FetchRequest::from_value(&valid(), 500).unwrap();

        assert_eq!(request.common.task_id, "task-1");
        assert_eq!(request.common.method, Method::GET);
        assert_eq!(request.common.progress_interval, Duration::from_millis(500));
        assert_eq!(request.target, TargetDirectory::Cache);
        assert!(!request.use_download_manager);
        assert_eq!(request.mime_type, DEFAULT_MIME_TYPE);
    }

    #[test]
    fn test_each_required_field() {
        for name in ["taskId", "url", "filename"] {
            let mut raw = valid();
            raw.as_object_mut().unwrap().remove(name);
            assert_eq!(
                FetchRequest::from_value(&raw, 500).err(),
                Some(Error::no_key(name)),
                "removing {}",
                name
            );

            let mut raw = valid();
            raw[name] = json!("");
            assert_eq!(
                FetchRequest::from_value(&raw, 500).err(),
                Some(Error::empty(name)),
                "emptying {}",
                name
            );
        }
    }

    #[test]
    fn test_presence_is_checked_before_emptiness() {
        let raw = json!({"taskId": "", "url": "https://example.com"});
        assert_eq!(
            FetchRequest::from_value(&raw, 500).err(),
            Some(Error::no_key("filename"))
        );
    }

    #[test]
    fn test_target_is_case_insensitive() {
        for (raw_target, expected) in [
            ("cache", TargetDirectory::Cache),
            ("CACHE", TargetDirectory::Cache),
            ("data", TargetDirectory::Data),
            ("Data", TargetDirectory::Data),
        ] {
            let mut raw = valid();
            raw["target"] = json!(raw_target);
            assert_eq!(FetchRequest::from_value(&raw, 500).unwrap().target, expected);
        }
    }

    #[test]
    fn test_bogus_target_carries_raw_value() {
        let mut raw = valid();
        raw["target"] = json!("bogus");
        assert_eq!(
            FetchRequest::from_value(&raw, 500).err(),
            Some(Error::InvalidValue {
                name: "target".to_string(),
                received: "bogus".to_string(),
            })
        );
    }

    #[test]
    fn test_platform_settings() {
        let mut raw = valid();
        raw["android"] = json!({
            "target": "data",
            "useDownloadManager": true,
            "downloadManager": {"title": "Song", "enableNotifications": true},
        });

        let request = FetchRequest::from_value(&raw, 500).unwrap();
        assert_eq!(request.target, TargetDirectory::Data);
        assert!(request.use_download_manager);
        assert_eq!(request.manager.title.as_deref(), Some("Song"));
        assert!(request.manager.description.is_none());
        assert!(request.manager.notifications_enabled);

        let mut raw = valid();
        raw["ios"] = json!({"target": "DATA"});
        assert_eq!(FetchRequest::from_value(&raw, 500).unwrap().target, TargetDirectory::Data);
    }

    #[test]
    fn test_filename_stays_in_sandbox() {
        for bad in ["../escape", "a/b", "..", "a\\b"] {
            let mut raw = valid();
            raw["filename"] = json!(bad);
            assert_eq!(
                FetchRequest::from_value(&raw, 500).err(),
                Some(Error::invalid("filename", bad))
            );
        }
    }

    #[test]
    fn test_headers_are_filtered() {
        let mut raw = valid();
        raw["headers"] = json!({"a": "x", "b": 5, "c": null});
        let request = FetchRequest::from_value(&raw, 500).unwrap();
        assert_eq!(request.common.headers, vec![("a".to_string(), "x".to_string())]);
    }
}
