use crate::codec::{align_up, alignment_of};
use crate::endian::Endianness;
use crate::error::{Error, ErrorKind, Result};
use crate::value::Value;

/// Appends [`Value`]s to a byte buffer, padding for alignment as it goes.
///
/// Alignment is always measured from the start of the buffer passed to
/// [`Encoder::new`], which must be the start of the enclosing message — the
/// protocol aligns relative to message offset 0, not relative to the start
/// of the body.
pub struct Encoder<'a> {
    buf: &'a mut Vec<u8>,
    endian: Endianness,
}

impl<'a> Encoder<'a> {
    pub fn new(buf: &'a mut Vec<u8>, endian: Endianness) -> Self {
        Self { buf, endian }
    }

    fn pos(&self) -> usize {
        self.buf.len()
    }

    fn pad_to(&mut self, alignment: usize) {
        let target = align_up(self.pos(), alignment);
        self.buf.resize(target, 0);
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn write_u16(&mut self, v: u16) {
        let bytes = match self.endian {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        };
        self.write_bytes(&bytes);
    }

    fn write_u32(&mut self, v: u32) {
        let bytes = match self.endian {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        };
        self.write_bytes(&bytes);
    }

    fn write_u64(&mut self, v: u64) {
        let bytes = match self.endian {
            Endianness::Little => v.to_le_bytes(),
            Endianness::Big => v.to_be_bytes(),
        };
        self.write_bytes(&bytes);
    }

    /// Write a length-prefixed UTF-8 string body (used by both `s` and `o`:
    /// a `u32` byte length followed by the bytes and a NUL terminator).
    fn write_string_body(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.write_bytes(s.as_bytes());
        self.buf.push(0);
    }

    /// Encode a single value, including its own alignment padding.
    pub fn encode_value(&mut self, value: &Value) -> Result<()> {
        self.pad_to(alignment_of(value));

        match value {
            Value::Byte(b) => self.buf.push(*b),
            Value::Bool(b) => self.write_u32(if *b { 1 } else { 0 }),
            Value::I16(v) => self.write_u16(*v as u16),
            Value::U16(v) => self.write_u16(*v),
            Value::I32(v) => self.write_u32(*v as u32),
            Value::U32(v) => self.write_u32(*v),
            Value::I64(v) => self.write_u64(*v as u64),
            Value::U64(v) => self.write_u64(*v),
            Value::F64(v) => self.write_u64(v.to_bits()),
            Value::Str(s) => self.write_string_body(s),
            Value::ObjectPath(p) => self.write_string_body(p.as_str()),
            Value::Signature(sig) => {
                let bytes = sig.as_bytes();
                if bytes.len() > u8::MAX as usize {
                    return Err(Error::new(ErrorKind::SignatureUnsupported));
                }
                self.buf.push(bytes.len() as u8);
                self.write_bytes(bytes);
                self.buf.push(0);
            }
            Value::Array { items, .. } => self.encode_array(items)?,
            Value::Struct(items) => {
                for item in items {
                    self.encode_value(item)?;
                }
            }
            Value::Dict { entries, .. } => self.encode_dict(entries)?,
            Value::Variant(variant) => {
                self.encode_value(&Value::Signature(variant.signature.clone()))?;
                self.encode_value(&variant.value)?;
            }
        }

        Ok(())
    }

    fn encode_array(&mut self, items: &[Value]) -> Result<()> {
        // Reserve the length prefix, then patch it once the element bytes
        // (not counting the alignment padding before the first element)
        // are known.
        let len_pos = self.pos();
        self.write_u32(0);

        if let Some(first) = items.first() {
            self.pad_to(alignment_of(first));
        }

        let body_start = self.pos();
        for item in items {
            self.encode_value(item)?;
        }
        let body_len = (self.pos() - body_start) as u32;
        let patch = match self.endian {
            Endianness::Little => body_len.to_le_bytes(),
            Endianness::Big => body_len.to_be_bytes(),
        };
        self.buf[len_pos..len_pos + 4].copy_from_slice(&patch);

        Ok(())
    }

    fn encode_dict(&mut self, entries: &[(Value, Value)]) -> Result<()> {
        let len_pos = self.pos();
        self.write_u32(0);

        // A dict-entry has struct alignment (8) even though the array
        // itself has `a` alignment (4).
        if !entries.is_empty() {
            self.pad_to(8);
        }

        let body_start = self.pos();
        for (key, val) in entries {
            self.pad_to(8);
            self.encode_value(key)?;
            self.encode_value(val)?;
        }
        let body_len = (self.pos() - body_start) as u32;
        let patch = match self.endian {
            Endianness::Little => body_len.to_le_bytes(),
            Endianness::Big => body_len.to_be_bytes(),
        };
        self.buf[len_pos..len_pos + 4].copy_from_slice(&patch);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::ToValue;

    #[test]
    fn encodes_u32_aligned() {
        let mut buf = vec![0u8; 1];
        let mut enc = Encoder::new(&mut buf, Endianness::Little);
        enc.encode_value(&7u32.to_value()).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0, 7, 0, 0, 0]);
    }

    #[test]
    fn encodes_string_with_length_prefix_and_nul() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf, Endianness::Little);
        enc.encode_value(&"hi".to_value()).unwrap();
        assert_eq!(buf, vec![2, 0, 0, 0, b'h', b'i', 0]);
    }

    #[test]
    fn encodes_empty_array_with_zero_length() {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf, Endianness::Little);
        let empty: Vec<u32> = Vec::new();
        enc.encode_value(&empty.to_value()).unwrap();
        assert_eq!(buf, vec![0, 0, 0, 0]);
    }

    #[test]
    fn array_of_u64_pads_before_first_element() {
        let mut buf = vec![0u8; 1];
        let mut enc = Encoder::new(&mut buf, Endianness::Little);
        let items = vec![1u64, 2u64];
        enc.encode_value(&items.to_value()).unwrap();
        // pos 1 pads to 4 for the array's own alignment, then a 4-byte
        // length field lands exactly on the 8-byte boundary the first
        // u64 element needs, so no further padding is inserted.
        assert_eq!(buf.len(), 4 + 4 + 8 + 8);
    }
}
