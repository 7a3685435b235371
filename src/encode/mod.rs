//! Columnar chunk encoding
//!
//! Consumes buffered rows plus column-type metadata and produces one flat,
//! immutable chunk image: header with item count, per-column metadata,
//! null bitmaps, fixed-width value arrays and a variable-length side
//! table for string columns. The chunk store treats the image as an
//! opaque byte blob of known length; [`ChunkImage`] is the reader used
//! by scans.

use serde::{Deserialize, Serialize};

use crate::{GpuStoreError, Result};

/// Image magic, first four bytes of every chunk
const CHUNK_MAGIC: u32 = 0x4753_4331; // "GSC1"

/// Bytes per serialized column-meta entry
const COLMETA_LEN: usize = 24;

/// Header bytes before the column-meta array
const HEADER_LEN: usize = 16;

// ============================================================================
// Schema
// ============================================================================

/// Supported column types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Int32,
    Int64,
    Float64,
    Utf8,
}

impl ColumnType {
    /// Fixed value width in bytes; strings store (offset, len) pairs
    fn width(self) -> usize {
        match self {
            ColumnType::Int32 => 4,
            ColumnType::Int64 | ColumnType::Float64 => 8,
            ColumnType::Utf8 => 8,
        }
    }

    fn tag(self) -> u8 {
        match self {
            ColumnType::Int32 => 1,
            ColumnType::Int64 => 2,
            ColumnType::Float64 => 3,
            ColumnType::Utf8 => 4,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ColumnType::Int32),
            2 => Some(ColumnType::Int64),
            3 => Some(ColumnType::Float64),
            4 => Some(ColumnType::Utf8),
            _ => None,
        }
    }
}

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: ColumnType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, ty: ColumnType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// A single cell value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int32(i32),
    Int64(i64),
    Float64(f64),
    Utf8(String),
}

impl Value {
    fn matches(&self, ty: ColumnType) -> bool {
        matches!(
            (self, ty),
            (Value::Null, _)
                | (Value::Int32(_), ColumnType::Int32)
                | (Value::Int64(_), ColumnType::Int64)
                | (Value::Float64(_), ColumnType::Float64)
                | (Value::Utf8(_), ColumnType::Utf8)
        )
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn align8(n: usize) -> usize {
    (n + 7) & !7
}

fn bitmap_len(nitems: usize) -> usize {
    (nitems + 7) / 8
}

struct EncodedColumn {
    ty: ColumnType,
    nullmap: Option<Vec<u8>>,
    values: Vec<u8>,
    extra: Vec<u8>,
}

fn encode_column(def: &ColumnDef, rows: &[Vec<Value>], col: usize) -> Result<EncodedColumn> {
    let nitems = rows.len();
    let mut nullmap = vec![0u8; bitmap_len(nitems)];
    let mut has_nulls = false;
    let mut values = Vec::with_capacity(nitems * def.ty.width());
    let mut extra: Vec<u8> = Vec::new();

    for (i, row) in rows.iter().enumerate() {
        let value = row.get(col).unwrap_or(&Value::Null);
        if !value.matches(def.ty) {
            return Err(GpuStoreError::Unsupported(format!(
                "value {:?} does not fit column \"{}\" ({:?})",
                value, def.name, def.ty
            )));
        }
        match value {
            Value::Null => {
                has_nulls = true;
                nullmap[i / 8] |= 1 << (i % 8);
                values.extend_from_slice(&vec![0u8; def.ty.width()]);
            }
            Value::Int32(v) => values.extend_from_slice(&v.to_le_bytes()),
            Value::Int64(v) => values.extend_from_slice(&v.to_le_bytes()),
            Value::Float64(v) => values.extend_from_slice(&v.to_le_bytes()),
            Value::Utf8(s) => {
                let off = extra.len() as u32;
                let len = s.len() as u32;
                extra.extend_from_slice(s.as_bytes());
                values.extend_from_slice(&off.to_le_bytes());
                values.extend_from_slice(&len.to_le_bytes());
            }
        }
    }

    Ok(EncodedColumn {
        ty: def.ty,
        nullmap: if has_nulls { Some(nullmap) } else { None },
        values,
        extra,
    })
}

/// Encode buffered rows into one flat chunk image
///
/// Rows shorter than the schema are padded with nulls; a value of the
/// wrong type for its column is an error.
pub fn encode_chunk(schema: &[ColumnDef], rows: &[Vec<Value>]) -> Result<Vec<u8>> {
    let ncols = schema.len();
    let columns: Vec<EncodedColumn> = schema
        .iter()
        .enumerate()
        .map(|(col, def)| encode_column(def, rows, col))
        .collect::<Result<_>>()?;

    let meta_end = HEADER_LEN + ncols * COLMETA_LEN;
    let mut image = vec![0u8; align8(meta_end)];
    image[0..4].copy_from_slice(&CHUNK_MAGIC.to_le_bytes());
    image[4..8].copy_from_slice(&(rows.len() as u32).to_le_bytes());
    image[8..12].copy_from_slice(&(ncols as u32).to_le_bytes());

    for (i, enc) in columns.iter().enumerate() {
        let mut nullmap_off = 0u32;
        if let Some(map) = &enc.nullmap {
            nullmap_off = image.len() as u32;
            image.extend_from_slice(map);
            image.resize(align8(image.len()), 0);
        }
        let values_off = image.len() as u32;
        image.extend_from_slice(&enc.values);
        image.resize(align8(image.len()), 0);

        let mut extra_off = 0u32;
        if !enc.extra.is_empty() {
            extra_off = image.len() as u32;
            image.extend_from_slice(&enc.extra);
            image.resize(align8(image.len()), 0);
        }

        let meta = HEADER_LEN + i * COLMETA_LEN;
        image[meta] = enc.ty.tag();
        image[meta + 1] = enc.nullmap.is_some() as u8;
        image[meta + 4..meta + 8].copy_from_slice(&nullmap_off.to_le_bytes());
        image[meta + 8..meta + 12].copy_from_slice(&values_off.to_le_bytes());
        image[meta + 12..meta + 16].copy_from_slice(&(enc.values.len() as u32).to_le_bytes());
        image[meta + 16..meta + 20].copy_from_slice(&extra_off.to_le_bytes());
        image[meta + 20..meta + 24].copy_from_slice(&(enc.extra.len() as u32).to_le_bytes());
    }

    Ok(image)
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct ColMeta {
    ty: ColumnType,
    has_nulls: bool,
    nullmap_off: usize,
    values_off: usize,
    values_len: usize,
    extra_off: usize,
    extra_len: usize,
}

/// Read-side view over an encoded chunk image
pub struct ChunkImage<'a> {
    bytes: &'a [u8],
    nitems: usize,
    cols: Vec<ColMeta>,
}

fn read_u32(bytes: &[u8], off: usize) -> Result<u32> {
    bytes
        .get(off..off + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| GpuStoreError::ConsistencyViolation("truncated chunk image".into()))
}

fn read_u64(bytes: &[u8], off: usize) -> Result<u64> {
    let lo = read_u32(bytes, off)? as u64;
    let hi = read_u32(bytes, off + 4)? as u64;
    Ok(lo | (hi << 32))
}

impl<'a> ChunkImage<'a> {
    /// Parse and validate an image header
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        if read_u32(bytes, 0)? != CHUNK_MAGIC {
            return Err(GpuStoreError::ConsistencyViolation(
                "bad chunk image magic".into(),
            ));
        }
        let nitems = read_u32(bytes, 4)? as usize;
        let ncols = read_u32(bytes, 8)? as usize;

        let mut cols = Vec::with_capacity(ncols);
        for i in 0..ncols {
            let meta = HEADER_LEN + i * COLMETA_LEN;
            let tag = *bytes.get(meta).ok_or_else(|| {
                GpuStoreError::ConsistencyViolation("truncated chunk image".into())
            })?;
            let ty = ColumnType::from_tag(tag).ok_or_else(|| {
                GpuStoreError::ConsistencyViolation(format!("unknown column type tag {}", tag))
            })?;
            let has_nulls = bytes.get(meta + 1).copied().ok_or_else(|| {
                GpuStoreError::ConsistencyViolation("truncated chunk image".into())
            })? != 0;
            let col = ColMeta {
                ty,
                has_nulls,
                nullmap_off: read_u32(bytes, meta + 4)? as usize,
                values_off: read_u32(bytes, meta + 8)? as usize,
                values_len: read_u32(bytes, meta + 12)? as usize,
                extra_off: read_u32(bytes, meta + 16)? as usize,
                extra_len: read_u32(bytes, meta + 20)? as usize,
            };
            if col.values_off + col.values_len > bytes.len()
                || col.extra_off + col.extra_len > bytes.len()
                || col.values_len < nitems * ty.width()
                || (col.has_nulls && col.nullmap_off + bitmap_len(nitems) > bytes.len())
            {
                return Err(GpuStoreError::ConsistencyViolation(
                    "chunk column region out of bounds".into(),
                ));
            }
            cols.push(col);
        }
        Ok(Self {
            bytes,
            nitems,
            cols,
        })
    }

    /// Number of rows in the chunk
    pub fn nitems(&self) -> usize {
        self.nitems
    }

    /// Number of columns
    pub fn ncols(&self) -> usize {
        self.cols.len()
    }

    /// Fetch one cell; `Value::Null` for stored nulls
    pub fn get(&self, col: usize, row: usize) -> Result<Value> {
        let meta = self.cols.get(col).ok_or_else(|| {
            GpuStoreError::NotFound(format!("column {} of {}", col, self.cols.len()))
        })?;
        if row >= self.nitems {
            return Err(GpuStoreError::NotFound(format!(
                "row {} of {}",
                row, self.nitems
            )));
        }
        if meta.has_nulls {
            let byte = self.bytes[meta.nullmap_off + row / 8];
            if byte & (1 << (row % 8)) != 0 {
                return Ok(Value::Null);
            }
        }
        let off = meta.values_off + row * meta.ty.width();
        Ok(match meta.ty {
            ColumnType::Int32 => Value::Int32(read_u32(self.bytes, off)? as i32),
            ColumnType::Int64 => Value::Int64(read_u64(self.bytes, off)? as i64),
            ColumnType::Float64 => Value::Float64(f64::from_bits(read_u64(self.bytes, off)?)),
            ColumnType::Utf8 => {
                let voff = read_u32(self.bytes, off)? as usize;
                let vlen = read_u32(self.bytes, off + 4)? as usize;
                let start = meta.extra_off + voff;
                let raw = self.bytes.get(start..start + vlen).ok_or_else(|| {
                    GpuStoreError::ConsistencyViolation("string cell out of bounds".into())
                })?;
                Value::Utf8(String::from_utf8_lossy(raw).into_owned())
            }
        })
    }

    /// Materialize every row
    pub fn to_rows(&self) -> Result<Vec<Vec<Value>>> {
        let mut rows = Vec::with_capacity(self.nitems);
        for row in 0..self.nitems {
            let mut out = Vec::with_capacity(self.cols.len());
            for col in 0..self.cols.len() {
                out.push(self.get(col, row)?);
            }
            rows.push(out);
        }
        Ok(rows)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Vec<ColumnDef> {
        vec![
            ColumnDef::new("id", ColumnType::Int64),
            ColumnDef::new("score", ColumnType::Float64),
            ColumnDef::new("name", ColumnType::Utf8),
        ]
    }

    #[test]
    fn test_encode_decode_mixed_types() {
        let rows = vec![
            vec![
                Value::Int64(1),
                Value::Float64(0.5),
                Value::Utf8("alice".into()),
            ],
            vec![Value::Int64(2), Value::Null, Value::Utf8("bob".into())],
            vec![Value::Int64(3), Value::Float64(-2.0), Value::Null],
        ];
        let image = encode_chunk(&schema(), &rows).unwrap();
        let chunk = ChunkImage::parse(&image).unwrap();

        assert_eq!(chunk.nitems(), 3);
        assert_eq!(chunk.ncols(), 3);
        assert_eq!(chunk.to_rows().unwrap(), rows);
    }

    #[test]
    fn test_empty_chunk() {
        let image = encode_chunk(&schema(), &[]).unwrap();
        let chunk = ChunkImage::parse(&image).unwrap();
        assert_eq!(chunk.nitems(), 0);
        assert!(chunk.to_rows().unwrap().is_empty());
    }

    #[test]
    fn test_type_mismatch_rejected() {
        let rows = vec![vec![
            Value::Utf8("oops".into()),
            Value::Float64(1.0),
            Value::Utf8("x".into()),
        ]];
        assert!(encode_chunk(&schema(), &rows).is_err());
    }

    #[test]
    fn test_short_rows_padded_with_nulls() {
        let rows = vec![vec![Value::Int64(42)]];
        let image = encode_chunk(&schema(), &rows).unwrap();
        let chunk = ChunkImage::parse(&image).unwrap();
        assert_eq!(chunk.get(1, 0).unwrap(), Value::Null);
        assert_eq!(chunk.get(2, 0).unwrap(), Value::Null);
    }

    #[test]
    fn test_parse_from_mapped_file() {
        use std::io::Write;

        let rows = vec![vec![
            Value::Int64(7),
            Value::Float64(1.25),
            Value::Utf8("mapped".into()),
        ]];
        let image = encode_chunk(&schema(), &rows).unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();
        file.flush().unwrap();

        // Images parse straight out of a mapped file, no copy needed
        let map = unsafe { memmap2::Mmap::map(file.as_file()).unwrap() };
        let chunk = ChunkImage::parse(&map).unwrap();
        assert_eq!(chunk.to_rows().unwrap(), rows);
    }

    #[test]
    fn test_corrupt_image_rejected() {
        assert!(ChunkImage::parse(&[0u8; 4]).is_err());
        let mut image = encode_chunk(&schema(), &[]).unwrap();
        image[0] ^= 0xff;
        assert!(ChunkImage::parse(&image).is_err());
    }
}
