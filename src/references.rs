//! Kerchunk reference sets.
//!
//! A reference set maps zarr keys to either inline content or byte ranges of source files.
//! The same model is used for single-file translations, combined products, the parquet-shaped
//! reference store, and as a view over a rechunked zarr store.

use crate::array::Order;
use crate::error::PadoccError;
use crate::filehandlers::JsonMap;
use crate::types::DType;

use serde::de::{self, Deserializer};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Record size of the parquet-shaped reference store.
pub const RECORD_SIZE: usize = 167;

/// Name of the store-level metadata file of the parquet-shaped store.
const ZMETADATA: &str = ".zmetadata";

/// Value of a single reference.
#[derive(Clone, Debug, PartialEq)]
pub enum RefValue {
    /// Inline content, either JSON text or `base64:` encoded bytes
    Inline(String),
    /// Byte range of a source file
    Range { url: String, offset: u64, length: u64 },
    /// Whole source file
    Whole(String),
}

impl RefValue {
    /// Inline content as text, if this reference is inline.
    pub fn as_inline(&self) -> Option<&str> {
        match self {
            RefValue::Inline(text) => Some(text),
            _ => None,
        }
    }
}

impl Serialize for RefValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RefValue::Inline(text) => serializer.serialize_str(text),
            RefValue::Range {
                url,
                offset,
                length,
            } => {
                let mut seq = serializer.serialize_seq(Some(3))?;
                seq.serialize_element(url)?;
                seq.serialize_element(offset)?;
                seq.serialize_element(length)?;
                seq.end()
            }
            RefValue::Whole(url) => {
                let mut seq = serializer.serialize_seq(Some(1))?;
                seq.serialize_element(url)?;
                seq.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for RefValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(text) => Ok(RefValue::Inline(text)),
            // Metadata written as nested JSON rather than text.
            Value::Object(map) => Ok(RefValue::Inline(Value::Object(map).to_string())),
            Value::Array(items) => match items.as_slice() {
                [Value::String(url)] => Ok(RefValue::Whole(url.clone())),
                [Value::String(url), offset, length] => {
                    let offset = offset
                        .as_u64()
                        .ok_or_else(|| de::Error::custom("reference offset is not an integer"))?;
                    let length = length
                        .as_u64()
                        .ok_or_else(|| de::Error::custom("reference length is not an integer"))?;
                    Ok(RefValue::Range {
                        url: url.clone(),
                        offset,
                        length,
                    })
                }
                _ => Err(de::Error::custom("references must have 1 or 3 elements")),
            },
            other => Err(de::Error::custom(format!("invalid reference {}", other))),
        }
    }
}

/// Contents of a `.zarray` entry.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ZArray {
    pub chunks: Vec<usize>,
    pub compressor: Option<Value>,
    pub dtype: DType,
    pub fill_value: Value,
    pub filters: Option<Vec<Value>>,
    #[serde(default)]
    pub order: Order,
    pub shape: Vec<usize>,
    pub zarr_format: u32,
}

impl ZArray {
    /// Number of chunks along each dimension.
    pub fn grid(&self) -> Vec<usize> {
        self.shape
            .iter()
            .zip(&self.chunks)
            .map(|(s, c)| if *c == 0 { 0 } else { (s + c - 1) / c })
            .collect()
    }

    /// Number of elements in one chunk.
    pub fn chunk_len(&self) -> usize {
        self.chunks.iter().product()
    }
}

/// Chunk key for a chunk index, e.g. `tas/0.1.0`.
pub fn chunk_key(var: &str, index: &[usize]) -> String {
    if index.is_empty() {
        return format!("{}/0", var);
    }
    let index: Vec<String> = index.iter().map(|i| i.to_string()).collect();
    format!("{}/{}", var, index.join("."))
}

/// Parse the chunk index of a chunk key relative to its variable.
pub fn parse_chunk_index(suffix: &str) -> Option<Vec<usize>> {
    suffix.split('.').map(|i| i.parse().ok()).collect()
}

/// A set of kerchunk references.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RefSet {
    pub version: Option<u32>,
    pub refs: BTreeMap<String, RefValue>,
}

impl Serialize for RefSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Versioned<'a> {
            version: u32,
            refs: &'a BTreeMap<String, RefValue>,
        }
        Versioned {
            version: self.version.unwrap_or(1),
            refs: &self.refs,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for RefSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let mut map = JsonMap::deserialize(deserializer)?;
        let version = map
            .get("version")
            .and_then(Value::as_u64)
            .map(|v| v as u32);
        // Version 0 references are a bare key map.
        let refs = match (version, map.remove("refs")) {
            (Some(_), Some(refs)) => refs,
            (_, refs) => {
                if let Some(refs) = refs {
                    map.insert("refs".to_string(), refs);
                }
                Value::Object(map)
            }
        };
        let refs = BTreeMap::<String, RefValue>::deserialize(refs).map_err(de::Error::custom)?;
        Ok(RefSet { version, refs })
    }
}

impl RefSet {
    pub fn new() -> Self {
        RefSet {
            version: Some(1),
            refs: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    fn inline_json(&self, key: &str) -> Result<Option<Value>, PadoccError> {
        match self.refs.get(key) {
            None => Ok(None),
            Some(RefValue::Inline(text)) => Ok(Some(serde_json::from_str(text)?)),
            Some(_) => Err(PadoccError::KerchunkDecode {
                reason: format!("metadata key {} is not inline", key),
            }),
        }
    }

    fn set_inline_json<T: Serialize>(&mut self, key: &str, value: &T) -> Result<(), PadoccError> {
        self.refs.insert(
            key.to_string(),
            RefValue::Inline(serde_json::to_string(value)?),
        );
        Ok(())
    }

    /// Names of all variables, i.e. keys with a `.zarray` entry.
    pub fn variables(&self) -> Vec<String> {
        self.refs
            .keys()
            .filter_map(|k| k.strip_suffix("/.zarray"))
            .map(String::from)
            .collect()
    }

    /// The `.zarray` of a variable.
    pub fn zarray(&self, var: &str) -> Result<Option<ZArray>, PadoccError> {
        match self.inline_json(&format!("{}/.zarray", var))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// The `.zarray` of every variable.
    pub fn zarrays(&self) -> Result<BTreeMap<String, ZArray>, PadoccError> {
        let mut zarrays = BTreeMap::new();
        for var in self.variables() {
            if let Some(zarray) = self.zarray(&var)? {
                zarrays.insert(var, zarray);
            }
        }
        Ok(zarrays)
    }

    pub fn set_zarray(&mut self, var: &str, zarray: &ZArray) -> Result<(), PadoccError> {
        self.set_inline_json(&format!("{}/.zarray", var), zarray)
    }

    fn attrs_key(var: Option<&str>) -> String {
        match var {
            Some(var) => format!("{}/.zattrs", var),
            None => ".zattrs".to_string(),
        }
    }

    /// Attributes of a variable, or the global attributes when `var` is `None`.
    ///
    /// Missing attributes load as an empty map.
    pub fn zattrs(&self, var: Option<&str>) -> Result<JsonMap, PadoccError> {
        match self.inline_json(&Self::attrs_key(var))? {
            Some(Value::Object(map)) => Ok(map),
            Some(_) => Err(PadoccError::KerchunkDecode {
                reason: format!("{} is not a map", Self::attrs_key(var)),
            }),
            None => Ok(JsonMap::new()),
        }
    }

    pub fn set_zattrs(&mut self, var: Option<&str>, attrs: &JsonMap) -> Result<(), PadoccError> {
        self.set_inline_json(&Self::attrs_key(var), attrs)
    }

    /// Dimension names of a variable from its `_ARRAY_DIMENSIONS` attribute.
    ///
    /// Variables without the attribute get `phony_dim_<n>` names.
    pub fn dims_of(&self, var: &str) -> Result<Vec<String>, PadoccError> {
        let ndim = self.zarray(var)?.map(|z| z.shape.len()).unwrap_or_default();
        let attrs = self.zattrs(Some(var))?;
        match attrs.get("_ARRAY_DIMENSIONS") {
            Some(Value::Array(dims)) if dims.len() == ndim => Ok(dims
                .iter()
                .map(|d| d.as_str().map(String::from).unwrap_or_else(|| d.to_string()))
                .collect()),
            _ => Ok((0..ndim).map(|i| format!("phony_dim_{}", i)).collect()),
        }
    }

    /// Chunk references of a variable keyed by chunk index.
    pub fn chunks_of(&self, var: &str) -> Vec<(Vec<usize>, &RefValue)> {
        let prefix = format!("{}/", var);
        self.refs
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .filter_map(|(k, v)| {
                let suffix = &k[prefix.len()..];
                if suffix.contains('/') {
                    return None;
                }
                parse_chunk_index(suffix).map(|index| (index, v))
            })
            .collect()
    }

    /// Every key belonging to a variable, metadata included.
    pub fn keys_of(&self, var: &str) -> Vec<String> {
        let prefix = format!("{}/", var);
        self.refs
            .keys()
            .filter(|k| k.starts_with(&prefix) && !k[prefix.len()..].contains('/'))
            .cloned()
            .collect()
    }

    /// Total referenced bytes and number of byte-range chunks.
    ///
    /// Only keys containing a digit (chunk keys) are counted.
    pub fn chunk_summary(&self) -> (u64, usize) {
        self.refs
            .iter()
            .filter(|(k, _)| k.chars().any(|c| c.is_ascii_digit()))
            .fold((0, 0), |(bytes, count), (_, v)| match v {
                RefValue::Range { length, .. } => (bytes + length, count + 1),
                _ => (bytes, count + 1),
            })
    }
}

#[derive(Deserialize, Serialize)]
struct Record {
    key: String,
    value: RefValue,
}

#[derive(Deserialize, Serialize)]
struct ZMetadata {
    metadata: JsonMap,
    record_size: usize,
}

fn is_metadata_key(key: &str) -> bool {
    key.rsplit('/')
        .next()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}

/// Write a reference set as a parquet-shaped store directory.
///
/// Metadata keys go to `.zmetadata`; chunk references are grouped per variable into
/// `<var>/refs.<n>.json` files of at most `record_size` records.
///
/// # Arguments
///
/// * `path`: Store directory, replaced if present
/// * `refs`: References to write
/// * `record_size`: Maximum records per file
pub fn write_parquet_store(
    path: &Path,
    refs: &RefSet,
    record_size: usize,
) -> Result<(), PadoccError> {
    if path.exists() {
        fs::remove_dir_all(path)?;
    }
    fs::create_dir_all(path)?;
    let mut metadata = JsonMap::new();
    let mut records: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for (key, value) in &refs.refs {
        if is_metadata_key(key) {
            let parsed = match value {
                RefValue::Inline(text) => serde_json::from_str(text)?,
                other => serde_json::to_value(other)?,
            };
            metadata.insert(key.clone(), parsed);
        } else {
            let var = key.rsplit_once('/').map(|(v, _)| v).unwrap_or_default();
            records.entry(var.to_string()).or_default().push(Record {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    let zmetadata = ZMetadata {
        metadata,
        record_size,
    };
    fs::write(path.join(ZMETADATA), serde_json::to_string(&zmetadata)?)?;
    for (var, var_records) in records {
        let dir = path.join(&var);
        fs::create_dir_all(&dir)?;
        for (n, batch) in var_records.chunks(record_size.max(1)).enumerate() {
            fs::write(
                dir.join(format!("refs.{}.json", n)),
                serde_json::to_string(batch)?,
            )?;
        }
    }
    Ok(())
}

/// Read a parquet-shaped store directory back into a reference set.
pub fn read_parquet_store(path: &Path) -> Result<RefSet, PadoccError> {
    let zmetadata: ZMetadata = match fs::read_to_string(path.join(ZMETADATA)) {
        Ok(content) => serde_json::from_str(&content)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(PadoccError::MissingKerchunk)
        }
        Err(err) => return Err(err.into()),
    };
    let mut refs = RefSet::new();
    for (key, value) in zmetadata.metadata {
        refs.refs.insert(key, RefValue::Inline(value.to_string()));
    }
    let pattern = path.join("**").join("refs.*.json");
    for entry in glob::glob(&pattern.to_string_lossy())? {
        let records: Vec<Record> = serde_json::from_str(&fs::read_to_string(entry?)?)?;
        for record in records {
            refs.refs.insert(record.key, record.value);
        }
    }
    Ok(refs)
}

/// Describe a zarr v2 store directory as a reference set.
///
/// Metadata files become inline references and chunk files whole-file references.
pub fn refs_from_zarr_store(path: &Path) -> Result<RefSet, PadoccError> {
    if !path.is_dir() {
        return Err(PadoccError::MissingKerchunk);
    }
    let mut refs = RefSet::new();
    let pattern = path.join("**").join("*");
    let hidden = glob::MatchOptions {
        require_literal_leading_dot: false,
        ..Default::default()
    };
    for entry in glob::glob_with(&pattern.to_string_lossy(), hidden)? {
        let entry = entry?;
        if !entry.is_file() {
            continue;
        }
        let key = match entry.strip_prefix(path) {
            Ok(rel) => rel.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"),
            Err(_) => continue,
        };
        if is_metadata_key(&key) {
            refs.refs
                .insert(key, RefValue::Inline(fs::read_to_string(&entry)?));
        } else {
            refs.refs
                .insert(key, RefValue::Whole(entry.to_string_lossy().into_owned()));
        }
    }
    Ok(refs)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::test_utils;
    use serde_json::json;
    use serde_test::{assert_tokens, Token};

    #[test]
    fn ref_value_tokens() {
        assert_tokens(&RefValue::Inline("abc".into()), &[Token::Str("abc")]);
        assert_tokens(
            &RefValue::Range {
                url: "/a.nc".into(),
                offset: 4,
                length: 8,
            },
            &[
                Token::Seq { len: Some(3) },
                Token::Str("/a.nc"),
                Token::U64(4),
                Token::U64(8),
                Token::SeqEnd,
            ],
        );
        assert_tokens(
            &RefValue::Whole("/a.nc".into()),
            &[Token::Seq { len: Some(1) }, Token::Str("/a.nc"), Token::SeqEnd],
        );
    }

    #[test]
    fn ref_value_invalid() {
        assert!(serde_json::from_value::<RefValue>(json!(["/a.nc", 1])).is_err());
        assert!(serde_json::from_value::<RefValue>(json!(["/a.nc", "x", 1])).is_err());
        assert!(serde_json::from_value::<RefValue>(json!(5)).is_err());
    }

    #[test]
    fn version_zero_refs() {
        let refs: RefSet = serde_json::from_value(json!({
            ".zgroup": "{\"zarr_format\": 2}",
            "x/0": ["/a.nc", 0, 8],
        }))
        .unwrap();
        assert_eq!(None, refs.version);
        assert_eq!(2, refs.refs.len());
        let value = serde_json::to_value(&refs).unwrap();
        assert_eq!(json!(1), value["version"]);
    }

    #[test]
    fn metadata_accessors() {
        let refs = test_utils::synthetic_refs("/data/a.nc", &[0.0, 1.0], 2);
        assert_eq!(vec!["lat".to_string(), "tas".to_string(), "time".to_string()], refs.variables());
        let zarray = refs.zarray("tas").unwrap().unwrap();
        assert_eq!(vec![2, 3], zarray.shape);
        assert_eq!(vec![1, 2], zarray.grid());
        assert_eq!(
            vec!["time".to_string(), "lat".to_string()],
            refs.dims_of("tas").unwrap()
        );
        assert_eq!(2, refs.chunks_of("tas").len());
        assert!(refs.keys_of("tas").contains(&"tas/.zattrs".to_string()));
        assert_eq!("x", refs.zattrs(None).unwrap()["title"]);
        assert!(refs.zarray("missing").unwrap().is_none());
    }

    #[test]
    fn chunk_summary_counts_digit_keys() {
        let mut refs = RefSet::new();
        refs.refs.insert(".zgroup".into(), RefValue::Inline("{}".into()));
        refs.refs.insert(
            "a/0.0".into(),
            RefValue::Range {
                url: "/x".into(),
                offset: 0,
                length: 100,
            },
        );
        refs.refs.insert(
            "a/1.0".into(),
            RefValue::Range {
                url: "/x".into(),
                offset: 100,
                length: 50,
            },
        );
        assert_eq!((150, 2), refs.chunk_summary());
    }

    #[test]
    fn chunk_keys() {
        assert_eq!("tas/0.1", chunk_key("tas", &[0, 1]));
        assert_eq!("t/0", chunk_key("t", &[]));
        assert_eq!(Some(vec![3, 0]), parse_chunk_index("3.0"));
        assert_eq!(None, parse_chunk_index(".zarray"));
    }

    #[test]
    fn parquet_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let refs = test_utils::synthetic_refs("/data/a.nc", &[0.0, 1.0], 2);
        let store = dir.path().join("kp1.0a.parq");
        write_parquet_store(&store, &refs, 1).unwrap();
        assert!(store.join(".zmetadata").exists());
        assert!(store.join("tas/refs.1.json").exists());
        let back = read_parquet_store(&store).unwrap();
        assert_eq!(refs.variables(), back.variables());
        assert_eq!(refs.zarray("tas").unwrap(), back.zarray("tas").unwrap());
        assert_eq!(refs.chunks_of("tas"), back.chunks_of("tas"));
        assert!(matches!(
            read_parquet_store(&dir.path().join("none")),
            Err(PadoccError::MissingKerchunk)
        ));
    }
}
