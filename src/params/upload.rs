use http::Method;
use serde_json::{Map, Value};
use std::path::PathBuf;

use super::{
    Common, Fields, PARAMETER_ABSOLUTE_FILE_PATH, PARAMETER_MIME_TYPE, PARAMETER_RETURN_RESPONSE,
    PARAMETER_TASK_ID, PARAMETER_URL, non_empty, strip_file_scheme,
};
use crate::{Error, Result};

const PARAMETER_PARTS: &str = "parts";
const PARAMETER_PART_NAME: &str = "name";
const PARAMETER_PART_TYPE: &str = "type";
const PARAMETER_PART_PAYLOAD: &str = "payload";
const PARAMETER_FILENAME: &str = "filename";

/// File part contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    /// Local file to stream
    pub absolute_file_path: PathBuf,
    /// File name advertised in `Content-Disposition`
    pub filename: String,
    /// MIME type of the part
    pub mime_type: String,
}

/// Contents of a single multipart part
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartPayload {
    /// A file streamed from disk
    File(FilePayload),
    /// An inline text value
    String(String),
}

/// A named multipart part
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Form field name
    pub name: String,
    /// Part contents
    pub payload: PartPayload,
}

/// Validated multipart upload descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    /// Shared transfer fields
    pub common: Common,
    /// Parts in declaration order
    pub parts: Vec<Part>,
    /// Keep the response body instead of discarding it
    pub return_response: bool,
}

impl UploadRequest {
    /// Validate a raw upload map
    pub fn from_value(raw: &Value, default_interval_ms: u64) -> Result<Self> {
        let fields = Fields::root(raw)?;

        let task_id = fields.required_str(PARAMETER_TASK_ID)?;
        let url = fields.required_str(PARAMETER_URL)?;
        let raw_parts = fields.required(PARAMETER_PARTS)?;

        non_empty(PARAMETER_TASK_ID, task_id)?;
        non_empty(PARAMETER_URL, url)?;

        let parts = parse_parts(raw_parts)?;
        let common = Common::build(&fields, task_id, url, Method::POST, default_interval_ms)?;
        let return_response = fields
            .optional_bool(PARAMETER_RETURN_RESPONSE)?
            .unwrap_or(false);

        Ok(Self {
            common,
            parts,
            return_response,
        })
    }
}

/// Parts arrive either as an ordered map `{name: {type, payload}}` or as `[{name, type, payload}]`
fn parse_parts(raw: &Value) -> Result<Vec<Part>> {
    let parts = match raw {
        Value::Object(map) => map
            .iter()
            .map(|(name, part)| parse_part(name, part))
            .collect::<Result<Vec<_>>>()?,
        Value::Array(entries) => entries
            .iter()
            .map(|entry| {
                let map = entry
                    .as_object()
                    .ok_or_else(|| Error::invalid(PARAMETER_PARTS, entry.to_string()))?;
                let fields = Fields::from_map(map);
                let name = fields.required_str(PARAMETER_PART_NAME)?;
                non_empty(PARAMETER_PART_NAME, name)?;
                parse_part_fields(name, &fields)
            })
            .collect::<Result<Vec<_>>>()?,
        _ => return Err(Error::missing(PARAMETER_PARTS, "map")),
    };

    if parts.is_empty() {
        return Err(Error::empty(PARAMETER_PARTS));
    }

    Ok(parts)
}

fn parse_part(name: &str, part: &Value) -> Result<Part> {
    let map: &Map<String, Value> = part
        .as_object()
        .ok_or_else(|| Error::invalid(format!("{}.{}", PARAMETER_PARTS, name), part.to_string()))?;
    parse_part_fields(name, &Fields::from_map(map))
}

fn parse_part_fields(name: &str, fields: &Fields<'_>) -> Result<Part> {
    let type_name = format!("{}.{}", name, PARAMETER_PART_TYPE);
    let payload_name = format!("{}.{}", name, PARAMETER_PART_PAYLOAD);

    let kind = fields
        .get(PARAMETER_PART_TYPE)
        .ok_or_else(|| Error::no_key(&type_name))?
        .as_str()
        .ok_or_else(|| Error::missing(&type_name, "String"))?;

    let payload = match kind.to_ascii_lowercase().as_str() {
        "file" => {
            let payload = fields
                .get(PARAMETER_PART_PAYLOAD)
                .ok_or_else(|| Error::no_key(&payload_name))?
                .as_object()
                .map(Fields::from_map)
                .ok_or_else(|| Error::missing(&payload_name, "map"))?;
            PartPayload::File(parse_file_payload(name, &payload)?)
        }
        "string" => {
            let value = fields
                .get(PARAMETER_PART_PAYLOAD)
                .ok_or_else(|| Error::no_key(&payload_name))?;
            PartPayload::String(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        }
        "" => return Err(Error::empty(type_name)),
        _ => return Err(Error::invalid(type_name, kind)),
    };

    Ok(Part {
        name: name.to_string(),
        payload,
    })
}

fn parse_file_payload(name: &str, payload: &Fields<'_>) -> Result<FilePayload> {
    let path_name = format!("{}.{}", name, PARAMETER_ABSOLUTE_FILE_PATH);
    let mime_name = format!("{}.{}", name, PARAMETER_MIME_TYPE);

    let path = payload
        .get(PARAMETER_ABSOLUTE_FILE_PATH)
        .ok_or_else(|| Error::no_key(&path_name))?
        .as_str()
        .ok_or_else(|| Error::missing(&path_name, "String"))?;
    let mime_type = payload
        .get(PARAMETER_MIME_TYPE)
        .ok_or_else(|| Error::no_key(&mime_name))?
        .as_str()
        .ok_or_else(|| Error::missing(&mime_name, "String"))?;

    non_empty(&path_name, path)?;
    non_empty(&mime_name, mime_type)?;

    let absolute_file_path = PathBuf::from(strip_file_scheme(path));
    let filename = match payload.optional_str(PARAMETER_FILENAME)? {
        Some(filename) if !filename.is_empty() => filename.to_string(),
        _ => absolute_file_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string()),
    };

    Ok(FilePayload {
        absolute_file_path,
        filename,
        mime_type: mime_type.to_string(),
    })
}
