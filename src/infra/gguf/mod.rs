//! GGUF header reader and a metadata-only writer.
//!
//! Only the header and the metadata key/value table are parsed. Tensor data
//! stays in the mapped file and is never touched here.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::path::Path;

pub const GGUF_MAGIC: u32 = 0x46554747;
pub const GGUF_VERSION: u32 = 3;

const TYPE_U8: u32 = 0;
const TYPE_I8: u32 = 1;
const TYPE_U16: u32 = 2;
const TYPE_I16: u32 = 3;
const TYPE_U32: u32 = 4;
const TYPE_I32: u32 = 5;
const TYPE_F32: u32 = 6;
const TYPE_BOOL: u32 = 7;
const TYPE_STRING: u32 = 8;
const TYPE_ARRAY: u32 = 9;
const TYPE_U64: u32 = 10;
const TYPE_I64: u32 = 11;
const TYPE_F64: u32 = 12;

#[derive(Debug, thiserror::Error)]
pub enum GgufError {
    #[error("not a GGUF file (magic {0:08x})")]
    BadMagic(u32),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("unknown metadata value type {0}")]
    UnknownValueType(u32),

    #[error("array elements cannot themselves be arrays")]
    NestedArray,

    #[error("{what} of {len} exceeds the remaining {remaining} bytes")]
    TooLarge {
        what: &'static str,
        len: u64,
        remaining: u64,
    },

    #[error("truncated GGUF header: {0}")]
    Truncated(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Uint(u64),
    Int(i64),
    Float(f64),
    Bool(bool),
    String(String),
    Array(Vec<MetadataValue>),
}

impl MetadataValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Self::Uint(v) => Some(*v),
            Self::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::Float(v) => Some(*v as f32),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GgufMetadata {
    kv: HashMap<String, MetadataValue>,
}

impl GgufMetadata {
    pub fn get(&self, key: &str) -> Option<&MetadataValue> {
        self.kv.get(key)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(MetadataValue::as_str)
    }

    pub fn uint(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(MetadataValue::as_u64)
    }

    pub fn strings(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(MetadataValue::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn floats(&self, key: &str) -> Vec<f32> {
        match self.get(key) {
            Some(MetadataValue::Array(items)) => {
                items.iter().filter_map(MetadataValue::as_f32).collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.kv.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kv.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata: GgufMetadata,
    /// Bytes consumed by the header and metadata table.
    pub header_len: u64,
}

impl GgufHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self, GgufError> {
        let mut reader = Cursor::new(bytes);

        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != GGUF_MAGIC {
            return Err(GgufError::BadMagic(magic));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if !(2..=GGUF_VERSION).contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        let tensor_count = reader.read_u64::<LittleEndian>()?;
        let kv_count = reader.read_u64::<LittleEndian>()?;
        check_len(&reader, "metadata count", kv_count)?;

        let mut kv = HashMap::with_capacity(kv_count as usize);
        for _ in 0..kv_count {
            let key = read_string(&mut reader)?;
            let value_type = reader.read_u32::<LittleEndian>()?;
            let value = read_value(&mut reader, value_type)?;
            kv.insert(key, value);
        }

        Ok(Self {
            version,
            tensor_count,
            metadata: GgufMetadata { kv },
            header_len: reader.position(),
        })
    }

    pub fn architecture(&self) -> &str {
        self.metadata
            .string("general.architecture")
            .unwrap_or("llama")
    }

    pub fn model_name(&self) -> Option<&str> {
        self.metadata.string("general.name")
    }

    fn arch_uint(&self, suffix: &str) -> Option<u64> {
        self.metadata
            .uint(&format!("{}.{}", self.architecture(), suffix))
    }

    /// Trained context length, if declared.
    pub fn context_length(&self) -> Option<u64> {
        self.arch_uint("context_length")
    }

    pub fn block_count(&self) -> u64 {
        self.arch_uint("block_count").unwrap_or(0)
    }

    pub fn embedding_length(&self) -> u64 {
        self.arch_uint("embedding_length").unwrap_or(0)
    }

    pub fn head_count(&self) -> u64 {
        self.arch_uint("attention.head_count").unwrap_or(0)
    }

    pub fn head_count_kv(&self) -> u64 {
        self.arch_uint("attention.head_count_kv")
            .unwrap_or_else(|| self.head_count())
    }

    /// `<arch>.vocab_size`, which most files omit.
    pub fn declared_vocab_size(&self) -> Option<u64> {
        self.arch_uint("vocab_size")
    }
}

fn remaining(reader: &Cursor<&[u8]>) -> u64 {
    (reader.get_ref().len() as u64).saturating_sub(reader.position())
}

/// Rejects lengths that could not possibly fit in the rest of the file,
/// before anything is allocated for them.
fn check_len(reader: &Cursor<&[u8]>, what: &'static str, len: u64) -> Result<(), GgufError> {
    let remaining = remaining(reader);
    if len > remaining {
        return Err(GgufError::TooLarge {
            what,
            len,
            remaining,
        });
    }
    Ok(())
}

fn read_string(reader: &mut Cursor<&[u8]>) -> Result<String, GgufError> {
    let len = reader.read_u64::<LittleEndian>()?;
    check_len(reader, "string", len)?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn read_value(reader: &mut Cursor<&[u8]>, value_type: u32) -> Result<MetadataValue, GgufError> {
    let value = match value_type {
        TYPE_U8 => MetadataValue::Uint(u64::from(reader.read_u8()?)),
        TYPE_I8 => MetadataValue::Int(i64::from(reader.read_i8()?)),
        TYPE_U16 => MetadataValue::Uint(u64::from(reader.read_u16::<LittleEndian>()?)),
        TYPE_I16 => MetadataValue::Int(i64::from(reader.read_i16::<LittleEndian>()?)),
        TYPE_U32 => MetadataValue::Uint(u64::from(reader.read_u32::<LittleEndian>()?)),
        TYPE_I32 => MetadataValue::Int(i64::from(reader.read_i32::<LittleEndian>()?)),
        TYPE_F32 => MetadataValue::Float(f64::from(reader.read_f32::<LittleEndian>()?)),
        TYPE_BOOL => MetadataValue::Bool(reader.read_u8()? != 0),
        TYPE_STRING => MetadataValue::String(read_string(reader)?),
        TYPE_ARRAY => {
            let element_type = reader.read_u32::<LittleEndian>()?;
            if element_type == TYPE_ARRAY {
                return Err(GgufError::NestedArray);
            }
            let len = reader.read_u64::<LittleEndian>()?;
            check_len(reader, "array", len)?;
            let mut items = Vec::with_capacity(len as usize);
            for _ in 0..len {
                items.push(read_value(reader, element_type)?);
            }
            MetadataValue::Array(items)
        }
        TYPE_U64 => MetadataValue::Uint(reader.read_u64::<LittleEndian>()?),
        TYPE_I64 => MetadataValue::Int(reader.read_i64::<LittleEndian>()?),
        TYPE_F64 => MetadataValue::Float(reader.read_f64::<LittleEndian>()?),
        other => return Err(GgufError::UnknownValueType(other)),
    };
    Ok(value)
}

/// Writes GGUF v3 files that carry metadata and no tensors.
///
/// ```no_run
/// use neuroix::infra::GgufWriter;
///
/// GgufWriter::new()
///     .architecture("llama")
///     .vocabulary(&["<unk>", "<s>", "</s>", "▁Hello"], None)
///     .write_to("tiny.gguf")
///     .unwrap();
/// ```
#[derive(Debug, Clone, Default)]
pub struct GgufWriter {
    kv: Vec<(String, MetadataValue)>,
}

impl GgufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: MetadataValue) -> Self {
        let key = key.into();
        self.kv.retain(|(k, _)| *k != key);
        self.kv.push((key, value));
        self
    }

    pub fn architecture(self, arch: &str) -> Self {
        self.set("general.architecture", MetadataValue::String(arch.to_string()))
    }

    pub fn name(self, name: &str) -> Self {
        self.set("general.name", MetadataValue::String(name.to_string()))
    }

    pub fn uint(self, key: impl Into<String>, value: u64) -> Self {
        self.set(key, MetadataValue::Uint(value))
    }

    /// Sets `tokenizer.ggml.tokens` and `tokenizer.ggml.scores`.
    pub fn vocabulary(self, tokens: &[&str], scores: Option<&[f32]>) -> Self {
        let tokens = tokens
            .iter()
            .map(|t| MetadataValue::String(t.to_string()))
            .collect();
        let writer = self.set("tokenizer.ggml.tokens", MetadataValue::Array(tokens));
        match scores {
            Some(scores) => writer.set(
                "tokenizer.ggml.scores",
                MetadataValue::Array(
                    scores
                        .iter()
                        .map(|s| MetadataValue::Float(f64::from(*s)))
                        .collect(),
                ),
            ),
            None => writer,
        }
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(GGUF_MAGIC)?;
        writer.write_u32::<LittleEndian>(GGUF_VERSION)?;
        writer.write_u64::<LittleEndian>(0)?;
        writer.write_u64::<LittleEndian>(self.kv.len() as u64)?;

        for (key, value) in &self.kv {
            write_string(writer, key)?;
            writer.write_u32::<LittleEndian>(value_type(value))?;
            write_value(writer, value)?;
        }
        Ok(())
    }

    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = io::BufWriter::new(std::fs::File::create(path)?);
        self.write(&mut file)?;
        file.flush()
    }
}

fn value_type(value: &MetadataValue) -> u32 {
    match value {
        MetadataValue::Uint(v) if *v <= u64::from(u32::MAX) => TYPE_U32,
        MetadataValue::Uint(_) => TYPE_U64,
        MetadataValue::Int(v) if i32::try_from(*v).is_ok() => TYPE_I32,
        MetadataValue::Int(_) => TYPE_I64,
        MetadataValue::Float(_) => TYPE_F32,
        MetadataValue::Bool(_) => TYPE_BOOL,
        MetadataValue::String(_) => TYPE_STRING,
        MetadataValue::Array(_) => TYPE_ARRAY,
    }
}

fn write_string<W: Write>(writer: &mut W, s: &str) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(s.len() as u64)?;
    writer.write_all(s.as_bytes())
}

fn write_value<W: Write>(writer: &mut W, value: &MetadataValue) -> io::Result<()> {
    write_value_as(writer, value, value_type(value))
}

fn write_value_as<W: Write>(writer: &mut W, value: &MetadataValue, ty: u32) -> io::Result<()> {
    match value {
        MetadataValue::Uint(v) if ty == TYPE_U32 => writer.write_u32::<LittleEndian>(*v as u32),
        MetadataValue::Uint(v) => writer.write_u64::<LittleEndian>(*v),
        MetadataValue::Int(v) if ty == TYPE_I32 => writer.write_i32::<LittleEndian>(*v as i32),
        MetadataValue::Int(v) => writer.write_i64::<LittleEndian>(*v),
        MetadataValue::Float(v) => writer.write_f32::<LittleEndian>(*v as f32),
        MetadataValue::Bool(v) => writer.write_u8(u8::from(*v)),
        MetadataValue::String(s) => write_string(writer, s),
        MetadataValue::Array(items) => {
            // Arrays are homogeneous; the widest element decides the type.
            let element_type = items
                .iter()
                .map(value_type)
                .max_by_key(|t| match *t {
                    TYPE_U64 | TYPE_I64 => 1,
                    _ => 0,
                })
                .unwrap_or(TYPE_U32);
            writer.write_u32::<LittleEndian>(element_type)?;
            writer.write_u64::<LittleEndian>(items.len() as u64)?;
            for item in items {
                write_value_as(writer, item, element_type)?;
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_bytes(writer: &GgufWriter) -> Vec<u8> {
        let mut bytes = Vec::new();
        writer.write(&mut bytes).unwrap();
        bytes
    }

    #[test]
    fn test_reads_what_writer_wrote() {
        let writer = GgufWriter::new()
            .architecture("llama")
            .name("tiny")
            .uint("llama.context_length", 2048)
            .uint("llama.block_count", 22)
            .uint("llama.embedding_length", 2048)
            .uint("llama.attention.head_count", 32)
            .uint("llama.attention.head_count_kv", 4)
            .vocabulary(&["<unk>", "<s>", "</s>"], Some(&[0.0, 0.0, 0.0]));
        let bytes = header_bytes(&writer);
        let header = GgufHeader::parse(&bytes).unwrap();

        assert_eq!(header.version, GGUF_VERSION);
        assert_eq!(header.tensor_count, 0);
        assert_eq!(header.header_len, bytes.len() as u64);
        assert_eq!(header.architecture(), "llama");
        assert_eq!(header.model_name(), Some("tiny"));
        assert_eq!(header.context_length(), Some(2048));
        assert_eq!(header.block_count(), 22);
        assert_eq!(header.head_count_kv(), 4);
        assert_eq!(
            header.metadata.strings("tokenizer.ggml.tokens"),
            vec!["<unk>", "<s>", "</s>"]
        );
        assert_eq!(header.metadata.floats("tokenizer.ggml.scores").len(), 3);
    }

    #[test]
    fn test_head_count_kv_defaults_to_head_count() {
        let writer = GgufWriter::new()
            .architecture("phi2")
            .uint("phi2.attention.head_count", 32);
        let header = GgufHeader::parse(&header_bytes(&writer)).unwrap();
        assert_eq!(header.head_count_kv(), 32);
        assert_eq!(header.context_length(), None);
    }

    #[test]
    fn test_bad_magic() {
        let err = GgufHeader::parse(b"GGML\x03\x00\x00\x00").unwrap_err();
        assert!(matches!(err, GgufError::BadMagic(_)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = header_bytes(&GgufWriter::new());
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        let err = GgufHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, GgufError::UnsupportedVersion(1)));
    }

    #[test]
    fn test_truncated_table() {
        let bytes = header_bytes(&GgufWriter::new().name("cut off here"));
        let err = GgufHeader::parse(&bytes[..bytes.len() - 4]).unwrap_err();
        assert!(matches!(err, GgufError::TooLarge { .. } | GgufError::Truncated(_)));
    }

    #[test]
    fn test_absurd_array_length_rejected_before_allocation() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(GGUF_MAGIC).unwrap();
        bytes.write_u32::<LittleEndian>(3).unwrap();
        bytes.write_u64::<LittleEndian>(0).unwrap();
        bytes.write_u64::<LittleEndian>(1).unwrap();
        write_string(&mut bytes, "tokenizer.ggml.tokens").unwrap();
        bytes.write_u32::<LittleEndian>(TYPE_ARRAY).unwrap();
        bytes.write_u32::<LittleEndian>(TYPE_STRING).unwrap();
        bytes.write_u64::<LittleEndian>(u64::MAX).unwrap();

        let err = GgufHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, GgufError::TooLarge { what: "array", .. }));
    }

    #[test]
    fn test_nested_arrays_rejected() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(GGUF_MAGIC).unwrap();
        bytes.write_u32::<LittleEndian>(3).unwrap();
        bytes.write_u64::<LittleEndian>(0).unwrap();
        bytes.write_u64::<LittleEndian>(1).unwrap();
        write_string(&mut bytes, "deep").unwrap();
        bytes.write_u32::<LittleEndian>(TYPE_ARRAY).unwrap();
        for _ in 0..500_000 {
            bytes.write_u32::<LittleEndian>(TYPE_ARRAY).unwrap();
            bytes.write_u64::<LittleEndian>(1).unwrap();
        }

        let err = GgufHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, GgufError::NestedArray));
    }

    #[test]
    fn test_unknown_value_type() {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(GGUF_MAGIC).unwrap();
        bytes.write_u32::<LittleEndian>(3).unwrap();
        bytes.write_u64::<LittleEndian>(0).unwrap();
        bytes.write_u64::<LittleEndian>(1).unwrap();
        write_string(&mut bytes, "weird").unwrap();
        bytes.write_u32::<LittleEndian>(99).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap();

        let err = GgufHeader::parse(&bytes).unwrap_err();
        assert!(matches!(err, GgufError::UnknownValueType(99)));
    }

    #[test]
    fn test_set_replaces_existing_key() {
        let writer = GgufWriter::new().name("a").name("b");
        let header = GgufHeader::parse(&header_bytes(&writer)).unwrap();
        assert_eq!(header.metadata.len(), 1);
        assert_eq!(header.model_name(), Some("b"));
    }
}
