//! Compressed safetensors containers.
//!
//! Both the feature store and model checkpoints use the same on-disk layout:
//!
//! ```text
//! gzip( u64-LE header length │ JSON header │ raw little-endian tensor bytes )
//! ```
//!
//! The JSON header maps entry names to `{dtype, shape, data_offsets}` and may
//! carry a `__metadata__` string map. Hierarchy is expressed with `/` in entry
//! names (`spectral/delta_power`). Readers also accept uncompressed files, so
//! `raw.safetensors` written by other tools loads unchanged.
use anyhow::{bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use ndarray::{Array, Array2, Array3, ArrayD, Dimension, IxDyn};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::Path;

use crate::error::FeatureStoreError;

/// gzip level used for every container written by this crate.
pub const COMPRESSION_LEVEL: u32 = 6;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const METADATA_KEY: &str = "__metadata__";

// ── Writer ────────────────────────────────────────────────────────────────────

/// Builder for a safetensors container holding F32, I32 and U8 entries.
///
/// ```rust,no_run
/// use eeg2dream::io::StWriter;
/// use ndarray::Array2;
/// use std::path::Path;
///
/// let mut w = StWriter::new();
/// w.add_array("spectral/alpha_power", &Array2::<f32>::zeros((4, 19)));
/// w.set_metadata("sfreq", "100");
/// w.write(Path::new("/tmp/out.safetensors.gz")).unwrap();
/// ```
#[derive(Debug, Default)]
pub struct StWriter {
    entries: Vec<(String, Vec<u8>, &'static str, Vec<usize>)>,
    metadata: BTreeMap<String, String>,
}

impl StWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_f32(&mut self, name: &str, data: &[f32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "F32", shape.to_vec()));
    }

    /// Add an f32 array of any rank in logical (row-major) order.
    pub fn add_array<D: Dimension>(&mut self, name: &str, arr: &Array<f32, D>) {
        let data: Vec<f32> = arr.iter().copied().collect();
        self.add_f32(name, &data, arr.shape());
    }

    pub fn add_i32(&mut self, name: &str, data: &[i32], shape: &[usize]) {
        let bytes: Vec<u8> = data.iter().flat_map(|v| v.to_le_bytes()).collect();
        self.entries.push((name.to_string(), bytes, "I32", shape.to_vec()));
    }

    /// Raw byte entry (used for newline-joined channel names).
    pub fn add_bytes(&mut self, name: &str, data: &[u8]) {
        self.entries.push((name.to_string(), data.to_vec(), "U8", vec![data.len()]));
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    /// Number of entries added so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialise to uncompressed safetensors bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut header_map = serde_json::Map::new();
        if !self.metadata.is_empty() {
            header_map.insert(METADATA_KEY.into(), serde_json::to_value(&self.metadata)?);
        }
        let mut offset: usize = 0;
        for (name, data, dtype, shape) in &self.entries {
            header_map.insert(name.clone(), serde_json::json!({
                "dtype": dtype,
                "shape": shape,
                "data_offsets": [offset, offset + data.len()],
            }));
            offset += data.len();
        }
        let hdr_bytes = serde_json::to_vec(&header_map)?;
        let pad = (8 - hdr_bytes.len() % 8) % 8;

        let mut out = Vec::with_capacity(8 + hdr_bytes.len() + pad + offset);
        out.extend_from_slice(&((hdr_bytes.len() + pad) as u64).to_le_bytes());
        out.extend_from_slice(&hdr_bytes);
        out.extend(std::iter::repeat(b' ').take(pad));
        for (_, data, _, _) in &self.entries {
            out.extend_from_slice(data);
        }
        Ok(out)
    }

    /// Write a gzip-compressed container to `path`, creating parent dirs.
    pub fn write(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let bytes = self.to_bytes()?;
        let f = std::fs::File::create(path)
            .with_context(|| format!("creating {}", path.display()))?;
        let mut enc = GzEncoder::new(f, Compression::new(COMPRESSION_LEVEL));
        enc.write_all(&bytes)?;
        enc.finish()?.flush()?;
        Ok(())
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct EntryInfo {
    dtype: String,
    shape: Vec<usize>,
    start: usize,
    end: usize,
}

/// A fully-read safetensors container.
///
/// The file handle is closed as soon as [`StFile::open`] returns; all entries
/// are decoded from the in-memory buffer.
#[derive(Debug, Clone)]
pub struct StFile {
    label: String,
    bytes: Vec<u8>,
    data_start: usize,
    entries: HashMap<String, EntryInfo>,
    metadata: HashMap<String, String>,
}

impl StFile {
    /// Read a container from disk, transparently inflating gzip.
    pub fn open(path: &Path) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::from_bytes(raw, &label)
    }

    /// Parse a container from memory (compressed or not).
    pub fn from_bytes(raw: Vec<u8>, label: &str) -> Result<Self> {
        let bytes = if raw.starts_with(&GZIP_MAGIC) {
            let mut out = Vec::new();
            GzDecoder::new(raw.as_slice())
                .read_to_end(&mut out)
                .with_context(|| format!("inflating {label}"))?;
            out
        } else {
            raw
        };

        if bytes.len() < 8 {
            bail!("{label}: safetensors file too small ({} bytes)", bytes.len());
        }
        let n = u64::from_le_bytes(bytes[..8].try_into()?) as usize;
        if n > bytes.len() - 8 {
            bail!("{label}: header length {n} exceeds file size {}", bytes.len());
        }
        let header: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&bytes[8..8 + n])
                .with_context(|| format!("{label}: failed to parse safetensors header"))?;
        let data_start = 8 + n;
        let data_len = bytes.len() - data_start;

        let mut entries = HashMap::new();
        let mut metadata = HashMap::new();
        for (key, val) in header {
            if key == METADATA_KEY {
                if let Some(obj) = val.as_object() {
                    for (k, v) in obj {
                        if let Some(s) = v.as_str() {
                            metadata.insert(k.clone(), s.to_string());
                        }
                    }
                }
                continue;
            }
            let info = parse_entry(&key, &val)
                .with_context(|| format!("{label}: malformed header entry '{key}'"))?;
            if info.end > data_len || info.start > info.end {
                bail!("{label}: entry '{key}' offsets out of range");
            }
            entries.insert(key, info);
        }

        Ok(Self { label: label.to_string(), bytes, data_start, entries, metadata })
    }

    /// File name this container was read from.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Entry names in sorted order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    fn entry(&self, key: &str) -> Result<&EntryInfo> {
        self.entries.get(key).ok_or_else(|| {
            FeatureStoreError::MissingEntry { key: key.to_string(), file: self.label.clone() }
                .into()
        })
    }

    pub fn shape(&self, key: &str) -> Result<Vec<usize>> {
        Ok(self.entry(key)?.shape.clone())
    }

    /// Raw payload bytes of an entry.
    pub fn bytes(&self, key: &str) -> Result<&[u8]> {
        let e = self.entry(key)?;
        Ok(&self.bytes[self.data_start + e.start..self.data_start + e.end])
    }

    /// Decode a numeric entry as f32 (F64/I32/I64 are cast).
    pub fn f32_tensor(&self, key: &str) -> Result<ArrayD<f32>> {
        let e = self.entry(key)?;
        let raw = self.bytes(key)?;
        let vals: Vec<f32> = match e.dtype.as_str() {
            "F32" => raw.chunks_exact(4)
                .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                .collect(),
            "F64" => raw.chunks_exact(8)
                .map(|b| f64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
                .collect(),
            "I32" => raw.chunks_exact(4)
                .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]) as f32)
                .collect(),
            "I64" => raw.chunks_exact(8)
                .map(|b| i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]) as f32)
                .collect(),
            other => {
                return Err(FeatureStoreError::UnsupportedDtype {
                    key: key.to_string(),
                    dtype: other.to_string(),
                }
                .into())
            }
        };
        Array::from_shape_vec(IxDyn(&e.shape), vals)
            .with_context(|| format!("{}: entry '{key}' size does not match shape", self.label))
    }

    pub fn f32_array2(&self, key: &str) -> Result<Array2<f32>> {
        let t = self.f32_tensor(key)?;
        let shape = t.shape().to_vec();
        t.into_dimensionality().map_err(|_| {
            FeatureStoreError::ShapeMismatch { key: key.to_string(), got: shape, expected: "rank 2".into() }
                .into()
        })
    }

    pub fn f32_array3(&self, key: &str) -> Result<Array3<f32>> {
        let t = self.f32_tensor(key)?;
        let shape = t.shape().to_vec();
        t.into_dimensionality().map_err(|_| {
            FeatureStoreError::ShapeMismatch { key: key.to_string(), got: shape, expected: "rank 3".into() }
                .into()
        })
    }
}

fn parse_entry(_key: &str, val: &serde_json::Value) -> Result<EntryInfo> {
    let dtype = val["dtype"].as_str().context("missing dtype")?.to_string();
    let shape = val["shape"]
        .as_array()
        .context("missing shape")?
        .iter()
        .map(|v| v.as_u64().map(|x| x as usize).context("non-integer shape"))
        .collect::<Result<Vec<usize>>>()?;
    let offsets = val["data_offsets"].as_array().context("missing data_offsets")?;
    if offsets.len() != 2 {
        bail!("data_offsets must have two elements");
    }
    let start = offsets[0].as_u64().context("bad start offset")? as usize;
    let end = offsets[1].as_u64().context("bad end offset")? as usize;
    Ok(EntryInfo { dtype, shape, start, end })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    #[test]
    fn compressed_container_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/out.safetensors.gz");
        let arr = Array3::from_shape_fn((2, 3, 4), |(a, b, c)| (a * 100 + b * 10 + c) as f32);

        let mut w = StWriter::new();
        w.add_array("raw_signals", &arr);
        w.add_i32("count", &[7], &[1]);
        w.set_metadata("sfreq", "100");
        w.write(&path).unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..2], &GZIP_MAGIC);

        let f = StFile::open(&path).unwrap();
        assert_eq!(f.keys(), vec!["count", "raw_signals"]);
        assert_eq!(f.f32_array3("raw_signals").unwrap(), arr);
        assert_eq!(f.f32_tensor("count").unwrap()[[0]], 7.0);
        assert_eq!(f.metadata("sfreq"), Some("100"));
    }

    #[test]
    fn plain_container_is_accepted() {
        let mut w = StWriter::new();
        w.add_f32("x", &[1.0, 2.0], &[2]);
        let f = StFile::from_bytes(w.to_bytes().unwrap(), "mem").unwrap();
        assert_eq!(f.f32_tensor("x").unwrap().as_slice().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn missing_entry_is_typed() {
        let w = StWriter::new();
        let f = StFile::from_bytes(w.to_bytes().unwrap(), "empty.st").unwrap();
        let err = f.f32_tensor("raw_signals").unwrap_err();
        assert_eq!(
            err.downcast_ref::<FeatureStoreError>(),
            Some(&FeatureStoreError::MissingEntry { key: "raw_signals".into(), file: "empty.st".into() })
        );
    }

    #[test]
    fn rank_mismatch_reported() {
        let mut w = StWriter::new();
        w.add_f32("x", &[1.0, 2.0], &[2]);
        let f = StFile::from_bytes(w.to_bytes().unwrap(), "mem").unwrap();
        let err = f.f32_array3("x").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<FeatureStoreError>(),
            Some(FeatureStoreError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(StFile::from_bytes(vec![1, 2, 3], "junk").is_err());
        assert!(StFile::from_bytes(vec![0xff; 64], "junk").is_err());
    }
}
