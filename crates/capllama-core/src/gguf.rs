//! GGUF header scraping for `modelInfo` and strict model path resolution.
//!
//! Layout (v2/v3, little endian): magic `GGUF`, u32 version, u64 tensor
//! count, u64 kv count, kv pairs, then tensor infos. Only the header and the
//! tensor infos are read; tensor data is never touched.

use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::errors::{PluginError, Result};

pub const GGUF_MAGIC: &[u8; 4] = b"GGUF";

// Guards against corrupt headers allocating unbounded memory.
const MAX_STRING_BYTES: u64 = 16 * 1024 * 1024;
const MAX_TENSOR_DIMS: u32 = 8;
/// Longer arrays (token tables, merges) are summarized instead of inlined.
const MAX_INLINE_ARRAY: u64 = 64;

const T_U8: u32 = 0;
const T_I8: u32 = 1;
const T_U16: u32 = 2;
const T_I16: u32 = 3;
const T_U32: u32 = 4;
const T_I32: u32 = 5;
const T_F32: u32 = 6;
const T_BOOL: u32 = 7;
const T_STRING: u32 = 8;
const T_ARRAY: u32 = 9;
const T_U64: u32 = 10;
const T_I64: u32 = 11;
const T_F64: u32 = 12;

#[derive(Debug, Clone, PartialEq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
    pub metadata: Map<String, Value>,
    /// Sum over tensors of the product of their dimensions.
    pub n_params: u64,
}

impl GgufHeader {
    pub fn architecture(&self) -> Option<&str> {
        self.metadata.get("general.architecture").and_then(Value::as_str)
    }

    /// `<arch>.embedding_length` when the architecture declares it.
    pub fn n_embd(&self) -> Option<u32> {
        let key = format!("{}.embedding_length", self.architecture()?);
        pick_u32(&self.metadata, &[key.as_str()])
    }
}

/// Result of `modelInfo`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelInfo {
    pub path: String,
    pub size: u64,
    pub desc: String,
    pub version: u32,
    pub tensor_count: u64,
    pub kv_count: u64,
    #[serde(rename = "nEmbd")]
    pub n_embd: u32,
    #[serde(rename = "nParams")]
    pub n_params: u64,
    pub metadata: Map<String, Value>,
}

fn corrupt(what: &str, e: io::Error) -> PluginError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        PluginError::failed(format!("truncated GGUF header while reading {what}"))
    } else {
        PluginError::failed(format!("failed to read GGUF {what}: {e}"))
    }
}

struct Reader<R> {
    inner: R,
}

impl<R: Read> Reader<R> {
    fn bytes<const N: usize>(&mut self, what: &str) -> Result<[u8; N]> {
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf).map_err(|e| corrupt(what, e))?;
        Ok(buf)
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.bytes(what)?))
    }

    fn u64(&mut self, what: &str) -> Result<u64> {
        Ok(u64::from_le_bytes(self.bytes(what)?))
    }

    fn skip(&mut self, n: u64, what: &str) -> Result<()> {
        let copied = io::copy(&mut self.inner.by_ref().take(n), &mut io::sink()).map_err(|e| corrupt(what, e))?;
        if copied != n {
            return Err(corrupt(what, io::ErrorKind::UnexpectedEof.into()));
        }
        Ok(())
    }

    fn string(&mut self, what: &str) -> Result<String> {
        let len = self.u64(what)?;
        if len > MAX_STRING_BYTES {
            return Err(PluginError::failed(format!("GGUF {what} length {len} is implausible")));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).map_err(|e| corrupt(what, e))?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn scalar(&mut self, ty: u32, key: &str) -> Result<Value> {
        let v = match ty {
            T_U8 => Value::from(u8::from_le_bytes(self.bytes(key)?)),
            T_I8 => Value::from(i8::from_le_bytes(self.bytes(key)?)),
            T_U16 => Value::from(u16::from_le_bytes(self.bytes(key)?)),
            T_I16 => Value::from(i16::from_le_bytes(self.bytes(key)?)),
            T_U32 => Value::from(self.u32(key)?),
            T_I32 => Value::from(i32::from_le_bytes(self.bytes(key)?)),
            T_F32 => float(f32::from_le_bytes(self.bytes(key)?) as f64),
            T_BOOL => Value::Bool(self.bytes::<1>(key)?[0] != 0),
            T_STRING => Value::String(self.string(key)?),
            T_U64 => Value::from(self.u64(key)?),
            T_I64 => Value::from(i64::from_le_bytes(self.bytes(key)?)),
            T_F64 => float(f64::from_le_bytes(self.bytes(key)?)),
            other => return Err(PluginError::failed(format!("unknown GGUF value type {other} for {key}"))),
        };
        Ok(v)
    }

    fn value(&mut self, ty: u32, key: &str) -> Result<Value> {
        if ty != T_ARRAY {
            return self.scalar(ty, key);
        }
        let elem = self.u32(key)?;
        let len = self.u64(key)?;
        if elem == T_ARRAY {
            return Err(PluginError::failed(format!("nested GGUF arrays are not supported ({key})")));
        }
        if len > MAX_INLINE_ARRAY {
            self.skip_array(elem, len, key)?;
            return Ok(Value::String(format!("[{len} items]")));
        }
        let mut out = Vec::with_capacity(len as usize);
        for _ in 0..len {
            out.push(self.scalar(elem, key)?);
        }
        Ok(Value::Array(out))
    }

    fn skip_array(&mut self, elem: u32, len: u64, key: &str) -> Result<()> {
        let width = match elem {
            T_U8 | T_I8 | T_BOOL => 1,
            T_U16 | T_I16 => 2,
            T_U32 | T_I32 | T_F32 => 4,
            T_U64 | T_I64 | T_F64 => 8,
            T_STRING => {
                for _ in 0..len {
                    let n = self.u64(key)?;
                    self.skip(n, key)?;
                }
                return Ok(());
            }
            other => return Err(PluginError::failed(format!("unknown GGUF value type {other} for {key}"))),
        };
        let total = len
            .checked_mul(width)
            .ok_or_else(|| PluginError::failed(format!("GGUF array {key} is implausibly large")))?;
        self.skip(total, key)
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

/// Parses magic, counts, key/values and tensor infos from `r`.
pub fn read_header<R: Read>(r: R) -> Result<GgufHeader> {
    let mut r = Reader { inner: r };
    let magic: [u8; 4] = r.bytes("magic")?;
    if &magic != GGUF_MAGIC {
        return Err(PluginError::invalid(format!(
            "invalid GGUF magic {:?}",
            String::from_utf8_lossy(&magic)
        )));
    }
    let version = r.u32("version")?;
    if !(2..=3).contains(&version) {
        return Err(PluginError::invalid(format!("unsupported GGUF version {version}")));
    }
    let tensor_count = r.u64("tensor count")?;
    let kv_count = r.u64("kv count")?;

    let mut metadata = Map::new();
    for _ in 0..kv_count {
        let key = r.string("kv key")?;
        let ty = r.u32(&key)?;
        let value = r.value(ty, &key)?;
        metadata.insert(key, value);
    }

    let mut n_params: u64 = 0;
    for _ in 0..tensor_count {
        let name = r.string("tensor name")?;
        let n_dims = r.u32(&name)?;
        if n_dims > MAX_TENSOR_DIMS {
            return Err(PluginError::failed(format!("tensor {name} has {n_dims} dims")));
        }
        let mut elems: u64 = 1;
        for _ in 0..n_dims {
            elems = elems.saturating_mul(r.u64(&name)?);
        }
        let _ggml_type = r.u32(&name)?;
        let _offset = r.u64(&name)?;
        n_params = n_params.saturating_add(elems);
    }

    Ok(GgufHeader {
        version,
        tensor_count,
        kv_count,
        metadata,
        n_params,
    })
}

fn has_magic(path: &Path) -> bool {
    let mut magic = [0u8; 4];
    File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map(|_| &magic == GGUF_MAGIC)
        .unwrap_or(false)
}

/// `path` itself, then each search dir joined with its file name.
pub fn candidate_paths(path: &str, search_dirs: &[PathBuf]) -> Vec<PathBuf> {
    let given = PathBuf::from(path);
    let mut out = Vec::new();
    if !path.is_empty() {
        out.push(given.clone());
    }
    if let Some(name) = given.file_name() {
        for dir in search_dirs {
            let p = dir.join(name);
            if !out.contains(&p) {
                out.push(p);
            }
        }
    }
    out
}

/// First candidate that is a file of at least `min_bytes` starting with the GGUF magic.
pub fn resolve_model_path(path: &str, search_dirs: &[PathBuf], min_bytes: u64) -> Result<PathBuf> {
    let mut rejected = Vec::new();
    for candidate in candidate_paths(path, search_dirs) {
        let Ok(meta) = candidate.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        if meta.len() < min_bytes {
            tracing::debug!(path = %candidate.display(), size = meta.len(), "model candidate too small");
            rejected.push(format!("{} is smaller than {min_bytes} bytes", candidate.display()));
            continue;
        }
        if !has_magic(&candidate) {
            tracing::debug!(path = %candidate.display(), "model candidate is not GGUF");
            rejected.push(format!("{} is not a GGUF file", candidate.display()));
            continue;
        }
        return Ok(candidate);
    }
    if rejected.is_empty() {
        Err(PluginError::ModelNotFound(path.to_string()))
    } else {
        Err(PluginError::invalid(rejected.join("; ")))
    }
}

/// Resolves and parses a model; keys listed in `skip` are left out of `metadata`.
pub fn model_info(path: &str, skip: &[String], search_dirs: &[PathBuf], min_bytes: u64) -> Result<ModelInfo> {
    let resolved = resolve_model_path(path, search_dirs, min_bytes)?;
    let file = File::open(&resolved)?;
    let size = file.metadata()?.len();
    let mut header = read_header(BufReader::new(file))?;

    let n_embd = header.n_embd().unwrap_or(0);
    header.metadata.retain(|k, _| !skip.iter().any(|s| s == k));

    Ok(ModelInfo {
        path: resolved.to_string_lossy().into_owned(),
        size,
        desc: format!("GGUF Model (v{})", header.version),
        version: header.version,
        tensor_count: header.tensor_count,
        kv_count: header.kv_count,
        n_embd,
        n_params: header.n_params,
        metadata: header.metadata,
    })
}

/// First key that parses as u32; numeric strings count.
fn pick_u32(map: &Map<String, Value>, keys: &[&str]) -> Option<u32> {
    for k in keys {
        match map.get(*k) {
            Some(Value::Number(n)) => {
                if let Some(v) = n.as_u64().and_then(|v| u32::try_from(v).ok()) {
                    return Some(v);
                }
            }
            Some(Value::String(s)) => {
                if let Ok(v) = s.trim().parse::<u32>() {
                    return Some(v);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    /// Minimal GGUF writer for fixtures.
    pub(crate) struct GgufBuilder {
        kvs: Vec<u8>,
        kv_count: u64,
        tensors: Vec<u8>,
        tensor_count: u64,
        version: u32,
    }

    impl GgufBuilder {
        pub(crate) fn new() -> Self {
            Self {
                kvs: Vec::new(),
                kv_count: 0,
                tensors: Vec::new(),
                tensor_count: 0,
                version: 3,
            }
        }

        fn push_str(buf: &mut Vec<u8>, s: &str) {
            buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
            buf.extend_from_slice(s.as_bytes());
        }

        pub(crate) fn kv_str(mut self, k: &str, v: &str) -> Self {
            Self::push_str(&mut self.kvs, k);
            self.kvs.extend_from_slice(&T_STRING.to_le_bytes());
            Self::push_str(&mut self.kvs, v);
            self.kv_count += 1;
            self
        }

        pub(crate) fn kv_u32(mut self, k: &str, v: u32) -> Self {
            Self::push_str(&mut self.kvs, k);
            self.kvs.extend_from_slice(&T_U32.to_le_bytes());
            self.kvs.extend_from_slice(&v.to_le_bytes());
            self.kv_count += 1;
            self
        }

        pub(crate) fn kv_str_array(mut self, k: &str, items: &[&str]) -> Self {
            Self::push_str(&mut self.kvs, k);
            self.kvs.extend_from_slice(&T_ARRAY.to_le_bytes());
            self.kvs.extend_from_slice(&T_STRING.to_le_bytes());
            self.kvs.extend_from_slice(&(items.len() as u64).to_le_bytes());
            for it in items {
                Self::push_str(&mut self.kvs, it);
            }
            self.kv_count += 1;
            self
        }

        pub(crate) fn tensor(mut self, name: &str, dims: &[u64]) -> Self {
            Self::push_str(&mut self.tensors, name);
            self.tensors.extend_from_slice(&(dims.len() as u32).to_le_bytes());
            for d in dims {
                self.tensors.extend_from_slice(&d.to_le_bytes());
            }
            self.tensors.extend_from_slice(&0u32.to_le_bytes());
            self.tensors.extend_from_slice(&0u64.to_le_bytes());
            self.tensor_count += 1;
            self
        }

        pub(crate) fn build(&self) -> Vec<u8> {
            let mut out = GGUF_MAGIC.to_vec();
            out.extend_from_slice(&self.version.to_le_bytes());
            out.extend_from_slice(&self.tensor_count.to_le_bytes());
            out.extend_from_slice(&self.kv_count.to_le_bytes());
            out.extend_from_slice(&self.kvs);
            out.extend_from_slice(&self.tensors);
            out
        }

        /// Builds and pads the file to `min_len` bytes.
        pub(crate) fn write_to(&self, path: &Path, min_len: usize) {
            let mut bytes = self.build();
            if bytes.len() < min_len {
                bytes.resize(min_len, 0);
            }
            std::fs::write(path, bytes).unwrap();
        }
    }

    fn sample() -> GgufBuilder {
        GgufBuilder::new()
            .kv_str("general.architecture", "llama")
            .kv_str("general.name", "Tiny")
            .kv_u32("llama.embedding_length", 64)
            .kv_str_array("tokenizer.ggml.tokens", &["a", "b"])
            .tensor("tok_embd", &[64, 10])
            .tensor("out", &[64])
    }

    #[test]
    fn parses_kvs_and_tensor_infos() {
        let h = read_header(Cursor::new(sample().build())).unwrap();
        assert_eq!(h.version, 3);
        assert_eq!(h.kv_count, 4);
        assert_eq!(h.tensor_count, 2);
        assert_eq!(h.n_params, 64 * 10 + 64);
        assert_eq!(h.n_embd(), Some(64));
        assert_eq!(h.metadata["tokenizer.ggml.tokens"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn long_arrays_are_summarized() {
        let items: Vec<String> = (0..100).map(|i| i.to_string()).collect();
        let refs: Vec<&str> = items.iter().map(String::as_str).collect();
        let bytes = GgufBuilder::new().kv_str_array("merges", &refs).kv_u32("after", 7).build();
        let h = read_header(Cursor::new(bytes)).unwrap();
        assert_eq!(h.metadata["merges"], Value::String("[100 items]".into()));
        assert_eq!(h.metadata["after"], serde_json::json!(7));
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let err = read_header(Cursor::new(b"GGML\x03\0\0\0".to_vec())).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");

        let mut bytes = sample().build();
        bytes.truncate(30);
        let err = read_header(Cursor::new(bytes)).unwrap_err();
        assert!(err.to_string().contains("truncated"), "{err}");
    }

    #[test]
    fn model_info_honors_skip_and_min_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiny.gguf");
        sample().write_to(&path, 4096);
        let p = path.to_str().unwrap();

        let info = model_info(p, &["general.name".to_string()], &[], 1024).unwrap();
        assert_eq!(info.desc, "GGUF Model (v3)");
        assert_eq!(info.n_embd, 64);
        assert_eq!(info.size, 4096);
        assert!(!info.metadata.contains_key("general.name"));
        assert!(info.metadata.contains_key("general.architecture"));

        let err = model_info(p, &[], &[], 1024 * 1024).unwrap_err();
        assert_eq!(err.code(), "INVALID_PARAMETERS");
    }

    #[test]
    fn resolves_through_search_dirs() {
        let dir = tempfile::tempdir().unwrap();
        sample().write_to(&dir.path().join("m.gguf"), 64);
        let found = resolve_model_path("/nowhere/m.gguf", &[dir.path().to_path_buf()], 16).unwrap();
        assert_eq!(found, dir.path().join("m.gguf"));

        let err = resolve_model_path("/nowhere/x.gguf", &[dir.path().to_path_buf()], 16).unwrap_err();
        assert!(matches!(err, PluginError::ModelNotFound(_)));

        std::fs::write(dir.path().join("fake.gguf"), vec![b'x'; 64]).unwrap();
        let err = resolve_model_path("fake.gguf", &[dir.path().to_path_buf()], 16).unwrap_err();
        assert!(err.to_string().contains("not a GGUF file"));
    }
}
