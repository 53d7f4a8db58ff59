//! Configuration data types and associated functions and methods

use crate::error::PadoccError;
use crate::filehandlers::JsonMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::path::Path;
use std::str::FromStr;
use strum_macros::Display;
use validator::{Validate, ValidationError};

/// Default project version.
pub const DEFAULT_VERSION: &str = "1.0";

/// Cloud format of a project's output artifact
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
pub enum CloudFormat {
    /// Kerchunk reference file or store
    #[strum(serialize = "kerchunk")]
    Kerchunk,
    /// Rechunked zarr store
    #[strum(serialize = "zarr")]
    Zarr,
    /// CFA aggregation file
    #[strum(serialize = "CFA")]
    Cfa,
}

impl CloudFormat {
    /// File types allowed for this format, the first being the default.
    pub fn permitted_file_types(self) -> &'static [FileType] {
        match self {
            CloudFormat::Kerchunk => &[FileType::Json, FileType::Parq],
            CloudFormat::Zarr | CloudFormat::Cfa => &[],
        }
    }

    /// Default file type for this format.
    pub fn default_file_type(self) -> Option<FileType> {
        self.permitted_file_types().first().copied()
    }
}

impl FromStr for CloudFormat {
    type Err = PadoccError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "kerchunk" => Ok(CloudFormat::Kerchunk),
            "zarr" => Ok(CloudFormat::Zarr),
            "cfa" => Ok(CloudFormat::Cfa),
            _ => Err(PadoccError::InvalidConfig(format!(
                "unknown cloud format {}",
                s
            ))),
        }
    }
}

/// File type of a kerchunk artifact
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum FileType {
    /// Single JSON reference file
    Json,
    /// Parquet-shaped reference store
    Parq,
}

impl FromStr for FileType {
    type Err = PadoccError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(FileType::Json),
            "parq" | "parquet" => Ok(FileType::Parq),
            _ => Err(PadoccError::InvalidConfig(format!("unknown file type {}", s))),
        }
    }
}

macro_rules! string_serde {
    ($type:ty) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let value = String::deserialize(deserializer)?;
                value.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_serde!(CloudFormat);
string_serde!(FileType);

/// Output format pinned by a later phase
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize, Validate)]
#[validate(schema(function = "validate_override"))]
pub struct Override {
    /// Pinned cloud format
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cloud_type: Option<CloudFormat>,
    /// Pinned file type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_type: Option<FileType>,
}

/// Validate a file type against its cloud format
fn validate_override(value: &Override) -> Result<(), ValidationError> {
    if let (Some(cloud_type), Some(file_type)) = (value.cloud_type, value.file_type) {
        if !cloud_type.permitted_file_types().contains(&file_type) {
            let mut error = ValidationError::new("file type not permitted for cloud format");
            error.add_param("cloud_type".into(), &cloud_type.to_string());
            error.add_param("file_type".into(), &file_type.to_string());
            return Err(error);
        }
    }
    Ok(())
}

/// Validate a project code
fn validate_proj_code(proj_code: &str) -> Result<(), ValidationError> {
    if proj_code.contains('/') || proj_code.contains(',') || proj_code.trim() != proj_code {
        return Err(ValidationError::new(
            "project code must not contain '/', ',' or surrounding whitespace",
        ));
    }
    Ok(())
}

/// Validate a `major.minor` version
fn validate_version(version: &str) -> Result<(), ValidationError> {
    match parse_version(version) {
        Some(_) => Ok(()),
        None => Err(ValidationError::new("version must be of the form major.minor")),
    }
}

/// Split a `major.minor` version.
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn default_version() -> String {
    DEFAULT_VERSION.to_string()
}

/// Per-project input configuration, stored as `base-cfg.json`
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
pub struct BaseConfig {
    /// Project code
    #[validate(
        length(min = 1, message = "proj_code must not be empty"),
        custom = "validate_proj_code"
    )]
    pub proj_code: String,
    /// Glob pattern or path to a text listing of input files
    #[validate(length(min = 1, message = "pattern must not be empty"))]
    pub pattern: String,
    /// Global attributes added at compute time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updates: Option<JsonMap>,
    /// Global attributes removed at compute time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub removals: Option<Vec<String>>,
    /// Project version
    #[serde(default = "default_version")]
    #[validate(custom = "validate_version")]
    pub version_no: String,
    /// Output format pinned by a later phase
    #[serde(default, rename = "override")]
    #[validate]
    pub override_: Override,
}

impl BaseConfig {
    /// Return a new BaseConfig with default version and no overrides.
    pub fn new(proj_code: &str, pattern: &str) -> Self {
        BaseConfig {
            proj_code: proj_code.to_string(),
            pattern: pattern.to_string(),
            updates: None,
            removals: None,
            version_no: default_version(),
            override_: Override::default(),
        }
    }
}

/// A row of a group's `datasets.csv` manifest
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize, Validate)]
pub struct DatasetRow {
    #[validate(
        length(min = 1, message = "proj_code must not be empty"),
        custom = "validate_proj_code"
    )]
    pub proj_code: String,
    #[validate(length(min = 1, message = "pattern must not be empty"))]
    pub pattern: String,
    /// Inline JSON or a path to a JSON file
    pub updates: Option<String>,
    /// Inline JSON or a path to a JSON file
    pub removals: Option<String>,
}

impl DatasetRow {
    /// Parse a manifest row, validating it.
    pub fn from_row(row: &[String]) -> Result<Self, PadoccError> {
        let field = |i: usize| {
            row.get(i)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let dataset = DatasetRow {
            proj_code: field(0).unwrap_or_default(),
            pattern: field(1).unwrap_or_default(),
            updates: field(2),
            removals: field(3),
        };
        dataset.validate()?;
        Ok(dataset)
    }

    /// Manifest row of this dataset.
    pub fn to_row(&self) -> Vec<String> {
        vec![
            self.proj_code.clone(),
            self.pattern.clone(),
            self.updates.clone().unwrap_or_default(),
            self.removals.clone().unwrap_or_default(),
        ]
    }

    /// Base configuration for this dataset, resolving updates and removals.
    pub fn base_config(&self) -> Result<BaseConfig, PadoccError> {
        let mut config = BaseConfig::new(&self.proj_code, &self.pattern);
        if let Some(updates) = &self.updates {
            config.updates = match load_json_or_path(updates)? {
                Value::Object(map) => Some(map),
                _ => {
                    return Err(PadoccError::InvalidConfig(format!(
                        "updates for {} must be a JSON object",
                        self.proj_code
                    )))
                }
            };
        }
        if let Some(removals) = &self.removals {
            config.removals = Some(match load_json_or_path(removals)? {
                Value::Array(items) => items
                    .into_iter()
                    .filter_map(|v| v.as_str().map(String::from))
                    .collect(),
                Value::Object(map) => map.into_iter().map(|(k, _)| k).collect(),
                Value::String(key) => vec![key],
                _ => {
                    return Err(PadoccError::InvalidConfig(format!(
                        "removals for {} must be a list of keys",
                        self.proj_code
                    )))
                }
            });
        }
        config.validate()?;
        Ok(config)
    }
}

/// Parse inline JSON, or read it from a file path.
pub fn load_json_or_path(value: &str) -> Result<Value, PadoccError> {
    let trimmed = value.trim();
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(serde_json::from_str(trimmed)?);
    }
    let path = Path::new(trimmed);
    if path.is_file() {
        return Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?);
    }
    Err(PadoccError::InvalidConfig(format!(
        "{} is neither JSON nor a readable file",
        value
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use serde_test::{assert_tokens, Token};

    #[test]
    fn cloud_format_names() {
        assert_eq!("CFA", CloudFormat::Cfa.to_string());
        assert_eq!(CloudFormat::Cfa, "cfa".parse().unwrap());
        assert_tokens(&CloudFormat::Kerchunk, &[Token::Str("kerchunk")]);
        assert_tokens(&FileType::Parq, &[Token::Str("parq")]);
        assert_eq!(FileType::Json, "JSON".parse().unwrap());
        assert!("netcdf".parse::<CloudFormat>().is_err());
    }

    #[test]
    fn type_map() {
        assert_eq!(Some(FileType::Json), CloudFormat::Kerchunk.default_file_type());
        assert_eq!(None, CloudFormat::Zarr.default_file_type());
        let invalid = Override {
            cloud_type: Some(CloudFormat::Zarr),
            file_type: Some(FileType::Json),
        };
        assert!(invalid.validate().is_err());
        let valid = Override {
            cloud_type: Some(CloudFormat::Kerchunk),
            file_type: Some(FileType::Parq),
        };
        assert!(valid.validate().is_ok());
    }

    #[test]
    fn base_config_defaults() {
        let config: BaseConfig =
            serde_json::from_value(json!({"proj_code": "p1", "pattern": "/data/*.nc"})).unwrap();
        assert_eq!("1.0", config.version_no);
        assert!(config.validate().is_ok());
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(json!({}), value["override"]);
        assert!(value.get("updates").is_none());
    }

    #[test]
    fn base_config_invalid() {
        let mut config = BaseConfig::new("a/b", "/data/*.nc");
        assert!(config.validate().is_err());
        config.proj_code = "ab".into();
        config.version_no = "one".into();
        assert!(config.validate().is_err());
        config.version_no = "2.3".into();
        assert!(config.validate().is_ok());
        assert_eq!(Some((2, 3)), parse_version(&config.version_no));
    }

    #[test]
    fn dataset_rows() {
        let row: Vec<String> = vec!["a".into(), "/data/a/*.nc".into(), "".into(), "".into()];
        let dataset = DatasetRow::from_row(&row).unwrap();
        assert_eq!(None, dataset.updates);
        assert_eq!(row, dataset.to_row());
        assert!(DatasetRow::from_row(&["".to_string()]).is_err());
    }

    #[test]
    fn dataset_updates_inline_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let removals = dir.path().join("removals.json");
        std::fs::write(&removals, r#"["history"]"#).unwrap();
        let dataset = DatasetRow {
            proj_code: "a".into(),
            pattern: "/data/*.nc".into(),
            updates: Some(r#"{"title": "new"}"#.into()),
            removals: Some(removals.to_string_lossy().into_owned()),
        };
        let config = dataset.base_config().unwrap();
        assert_eq!(json!("new"), config.updates.unwrap()["title"]);
        assert_eq!(Some(vec!["history".to_string()]), config.removals);
        assert!(load_json_or_path("/no/such.json").is_err());
    }
}
