use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Result, TabulaError};
use crate::store::{Schema, Value};

pub const SEGMENT_MAGIC: u32 = 0x54534547; // TSEG
pub const SEGMENT_VERSION: u32 = 1;
pub const SEGMENT_FOOTER_MAGIC: u32 = 0x54534654; // TSFT

const TAG_NULL: u8 = 0;
const TAG_TEXT: u8 = 1;
const TAG_INTEGER: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_BOOLEAN: u8 = 4;
const TAG_TIMESTAMP: u8 = 5;

fn put_uvarint(out: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        out.push(v as u8 | 0x80);
        v >>= 7;
    }
    out.push(v as u8);
}

fn put_ivarint(out: &mut Vec<u8>, v: i64) {
    // zigzag keeps small negatives short
    put_uvarint(out, ((v << 1) ^ (v >> 63)) as u64);
}

/// Bounds-checked reader over the row area of a mapped segment.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(buf: &'a [u8], pos: usize) -> Self {
        Self { buf, pos }
    }

    fn byte(&mut self) -> Result<u8> {
        let b = self.buf.get(self.pos).copied().ok_or_else(|| {
            TabulaError::SegmentFormat("unexpected end of segment data".to_string())
        })?;
        self.pos += 1;
        Ok(b)
    }

    fn uvarint(&mut self) -> Result<u64> {
        let mut v = 0u64;
        let mut shift = 0u32;
        loop {
            let b = self.byte()?;
            if shift >= 64 {
                return Err(TabulaError::SegmentFormat("varint overflow".to_string()));
            }
            v |= u64::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                return Ok(v);
            }
            shift += 7;
        }
    }

    fn ivarint(&mut self) -> Result<i64> {
        let z = self.uvarint()?;
        Ok((z >> 1) as i64 ^ -((z & 1) as i64))
    }

    fn f64_le(&mut self) -> Result<f64> {
        let end = self.pos + 8;
        let slice = self.buf.get(self.pos..end).ok_or_else(|| {
            TabulaError::SegmentFormat("truncated float value".to_string())
        })?;
        let mut b = [0u8; 8];
        b.copy_from_slice(slice);
        self.pos = end;
        Ok(f64::from_bits(u64::from_le_bytes(b)))
    }

    fn text(&mut self) -> Result<String> {
        let len = self.uvarint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.buf.len())
            .ok_or_else(|| {
                TabulaError::SegmentFormat("text value out of range".to_string())
            })?;
        let s = std::str::from_utf8(&self.buf[self.pos..end])
            .map_err(|_| TabulaError::SegmentFormat("non-utf8 text value".to_string()))?
            .to_string();
        self.pos = end;
        Ok(s)
    }
}

fn encode_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Text(s) => {
            out.push(TAG_TEXT);
            put_uvarint(out, s.len() as u64);
            out.extend_from_slice(s.as_bytes());
        }
        Value::Integer(i) => {
            out.push(TAG_INTEGER);
            put_ivarint(out, *i);
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_bits().to_le_bytes());
        }
        Value::Boolean(b) => {
            out.push(TAG_BOOLEAN);
            out.push(u8::from(*b));
        }
        Value::Timestamp(ms) => {
            out.push(TAG_TIMESTAMP);
            put_ivarint(out, *ms);
        }
    }
}

fn decode_value(cur: &mut Cursor<'_>) -> Result<Value> {
    match cur.byte()? {
        TAG_NULL => Ok(Value::Null),
        TAG_TEXT => Ok(Value::Text(cur.text()?)),
        TAG_INTEGER => Ok(Value::Integer(cur.ivarint()?)),
        TAG_FLOAT => Ok(Value::Float(cur.f64_le()?)),
        TAG_BOOLEAN => Ok(Value::Boolean(cur.byte()? != 0)),
        TAG_TIMESTAMP => Ok(Value::Timestamp(cur.ivarint()?)),
        other => Err(TabulaError::SegmentFormat(format!(
            "unknown value tag {other}"
        ))),
    }
}

/// Write a complete segment file. The file is staged as `.tmp` and renamed
/// into place so a crash can never leave a partially visible segment.
///
/// Layout: magic | format version | schema json (len-prefixed) | row count |
/// rows | crc32 of everything before the footer | footer magic.
pub fn write_segment(path: impl AsRef<Path>, schema: &Schema, rows: &[Vec<Value>]) -> Result<u64> {
    let path = path.as_ref();
    let schema_json = serde_json::to_vec(schema)?;

    let mut body = Vec::with_capacity(4096);
    body.extend_from_slice(&SEGMENT_MAGIC.to_le_bytes());
    body.extend_from_slice(&SEGMENT_VERSION.to_le_bytes());
    body.extend_from_slice(&(schema_json.len() as u32).to_le_bytes());
    body.extend_from_slice(&schema_json);
    body.extend_from_slice(&(rows.len() as u64).to_le_bytes());

    for row in rows {
        if row.len() != schema.len() {
            return Err(TabulaError::SegmentFormat(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                schema.len()
            )));
        }
        for value in row {
            encode_value(value, &mut body);
        }
    }

    let crc = crc32fast::hash(&body);

    let tmp = path.with_extension("seg.tmp");
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(&body)?;
        f.write_all(&crc.to_le_bytes())?;
        f.write_all(&SEGMENT_FOOTER_MAGIC.to_le_bytes())?;
        f.sync_data()?;
    }
    std::fs::rename(&tmp, path)?;

    Ok(body.len() as u64 + 8)
}

/// Read-only view over one immutable segment. The mmap never outlives the
/// reader, and the file is verified (magic + crc) before any row access.
#[derive(Debug)]
pub struct SegmentReader {
    pub path: PathBuf,
    mmap: Mmap,
    pub schema: Schema,
    pub row_count: u64,
    rows_offset: usize,
}

impl SegmentReader {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < 12 + 8 + 8 {
            return Err(TabulaError::SegmentFormat("segment too short".to_string()));
        }

        let mut b4 = [0u8; 4];
        b4.copy_from_slice(&mmap[0..4]);
        if u32::from_le_bytes(b4) != SEGMENT_MAGIC {
            return Err(TabulaError::SegmentFormat("bad segment magic".to_string()));
        }
        b4.copy_from_slice(&mmap[4..8]);
        if u32::from_le_bytes(b4) != SEGMENT_VERSION {
            return Err(TabulaError::SegmentFormat(
                "unsupported segment version".to_string(),
            ));
        }

        let footer_start = mmap.len() - 8;
        b4.copy_from_slice(&mmap[footer_start + 4..footer_start + 8]);
        if u32::from_le_bytes(b4) != SEGMENT_FOOTER_MAGIC {
            return Err(TabulaError::SegmentFormat(
                "footer magic mismatch".to_string(),
            ));
        }
        b4.copy_from_slice(&mmap[footer_start..footer_start + 4]);
        let stored_crc = u32::from_le_bytes(b4);
        if crc32fast::hash(&mmap[..footer_start]) != stored_crc {
            return Err(TabulaError::SegmentFormat("segment crc mismatch".to_string()));
        }

        b4.copy_from_slice(&mmap[8..12]);
        let schema_len = u32::from_le_bytes(b4) as usize;
        if 12 + schema_len + 8 > footer_start {
            return Err(TabulaError::SegmentFormat(
                "schema block out of range".to_string(),
            ));
        }
        let schema: Schema = serde_json::from_slice(&mmap[12..12 + schema_len])?;

        let mut b8 = [0u8; 8];
        b8.copy_from_slice(&mmap[12 + schema_len..12 + schema_len + 8]);
        let row_count = u64::from_le_bytes(b8);
        let rows_offset = 12 + schema_len + 8;

        Ok(Self {
            path,
            mmap,
            schema,
            row_count,
            rows_offset,
        })
    }

    /// Decode up to `limit` rows (all rows if `None`).
    pub fn read_rows(&self, limit: Option<usize>) -> Result<Vec<Vec<Value>>> {
        let want = limit.unwrap_or(self.row_count as usize).min(self.row_count as usize);
        let body_end = self.mmap.len() - 8;
        let mut cur = Cursor::new(&self.mmap[..body_end], self.rows_offset);
        let mut rows = Vec::with_capacity(want);

        for _ in 0..want {
            let mut row = Vec::with_capacity(self.schema.len());
            for _ in 0..self.schema.len() {
                row.push(decode_value(&mut cur)?);
            }
            rows.push(row);
        }
        Ok(rows)
    }
}
