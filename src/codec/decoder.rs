use crate::codec::align_up;
use crate::endian::Endianness;
use crate::error::{Error, ErrorKind, Result};
use crate::object_path::ObjectPath;
use crate::signature::{Signature, Type};
use crate::value::{Value, Variant};

/// Decodes [`Value`]s out of a byte buffer, mirroring [`Encoder`](super::Encoder).
///
/// Like the encoder, positions are measured from the start of the buffer
/// passed to [`Decoder::new`], which must be the start of the enclosing
/// message.
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    endian: Endianness,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8], pos: usize, endian: Endianness) -> Self {
        Self { data, pos, endian }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn align_to(&mut self, alignment: usize) -> Result<()> {
        let target = align_up(self.pos, alignment);
        if target > self.data.len() {
            return Err(Error::new(ErrorKind::BufferOverrun));
        }
        if self.data[self.pos..target].iter().any(|&b| b != 0) {
            return Err(Error::new(ErrorKind::InvalidSignature(
                "non-zero alignment padding",
            )));
        }
        self.pos = target;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&e| e <= self.data.len())
            .ok_or_else(|| Error::new(ErrorKind::BufferOverrun))?;
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let bytes: [u8; 2] = self.take(2)?.try_into().unwrap();
        Ok(match self.endian {
            Endianness::Little => u16::from_le_bytes(bytes),
            Endianness::Big => u16::from_be_bytes(bytes),
        })
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(match self.endian {
            Endianness::Little => u32::from_le_bytes(bytes),
            Endianness::Big => u32::from_be_bytes(bytes),
        })
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(match self.endian {
            Endianness::Little => u64::from_le_bytes(bytes),
            Endianness::Big => u64::from_be_bytes(bytes),
        })
    }

    fn read_string_body(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?.to_vec();
        let nul = self.take(1)?;
        if nul != [0] {
            return Err(Error::new(ErrorKind::NotNullTerminated));
        }
        Ok(String::from_utf8(bytes).map_err(|e| e.utf8_error())?)
    }

    fn read_signature(&mut self) -> Result<Signature> {
        let len = self.take(1)?[0] as usize;
        let bytes = self.take(len)?.to_vec();
        let nul = self.take(1)?;
        if nul != [0] {
            return Err(Error::new(ErrorKind::NotNullTerminated));
        }
        Signature::new(String::from_utf8(bytes).map_err(|e| e.utf8_error())?)
    }

    /// Decode one complete value whose type is described by `sig` starting
    /// at `*sig_pos`, advancing `*sig_pos` past it.
    pub fn decode_value(&mut self, sig: &[u8], sig_pos: &mut usize) -> Result<Value> {
        self.decode_at_depth(sig, sig_pos, 0)
    }

    fn decode_at_depth(&mut self, sig: &[u8], sig_pos: &mut usize, depth: usize) -> Result<Value> {
        if depth > crate::signature::MAX_DEPTH {
            return Err(Error::new(ErrorKind::SignatureTooDeep));
        }

        let Some(&code) = sig.get(*sig_pos) else {
            return Err(Error::new(ErrorKind::SignatureOverrun));
        };
        let Some(ty) = Type::from_code(code) else {
            return Err(Error::new(ErrorKind::UnknownTypeCode(code)));
        };
        *sig_pos += 1;

        Ok(match ty {
            Type::Byte => {
                self.align_to(1)?;
                Value::Byte(self.take(1)?[0])
            }
            Type::Boolean => {
                self.align_to(4)?;
                let v = self.read_u32()?;
                Value::Bool(v != 0)
            }
            Type::Int16 => {
                self.align_to(2)?;
                Value::I16(self.read_u16()? as i16)
            }
            Type::Uint16 => {
                self.align_to(2)?;
                Value::U16(self.read_u16()?)
            }
            Type::Int32 => {
                self.align_to(4)?;
                Value::I32(self.read_u32()? as i32)
            }
            Type::Uint32 => {
                self.align_to(4)?;
                Value::U32(self.read_u32()?)
            }
            Type::Int64 => {
                self.align_to(8)?;
                Value::I64(self.read_u64()? as i64)
            }
            Type::Uint64 => {
                self.align_to(8)?;
                Value::U64(self.read_u64()?)
            }
            Type::Double => {
                self.align_to(8)?;
                Value::F64(f64::from_bits(self.read_u64()?))
            }
            Type::String => {
                self.align_to(4)?;
                Value::Str(self.read_string_body()?)
            }
            Type::ObjectPath => {
                self.align_to(4)?;
                Value::ObjectPath(ObjectPath::new(self.read_string_body()?)?)
            }
            Type::Signature => Value::Signature(self.read_signature()?),
            Type::Variant => {
                let inner_sig = self.read_signature()?;
                let mut inner_pos = 0;
                let value = self.decode_at_depth(inner_sig.as_bytes(), &mut inner_pos, depth + 1)?;
                Value::Variant(Variant {
                    signature: inner_sig,
                    value: Box::new(value),
                })
            }
            Type::Array => self.decode_array(sig, sig_pos, depth)?,
            Type::StructOpen => self.decode_struct(sig, sig_pos, depth)?,
            Type::StructClose | Type::DictOpen | Type::DictClose => {
                return Err(Error::new(ErrorKind::ExpectedDictEntry));
            }
        })
    }

    fn decode_array(&mut self, sig: &[u8], sig_pos: &mut usize, depth: usize) -> Result<Value> {
        self.align_to(4)?;
        let byte_len = self.read_u32()? as usize;

        if sig.get(*sig_pos) == Some(&b'{') {
            *sig_pos += 1;
            let key_start = *sig_pos;
            crate::signature::advance_type(sig, sig_pos)?;
            let key_signature = Signature::from_validated(&sig[key_start..*sig_pos]);

            let value_start = *sig_pos;
            crate::signature::advance_type(sig, sig_pos)?;
            let value_signature = Signature::from_validated(&sig[value_start..*sig_pos]);

            if sig.get(*sig_pos) != Some(&b'}') {
                return Err(Error::new(ErrorKind::ExpectedDictEntry));
            }
            *sig_pos += 1;

            self.align_to(8)?;
            let body_end = self.pos + byte_len;
            let mut entries = Vec::new();
            while self.pos < body_end {
                self.align_to(8)?;
                let mut kp = 0;
                let key = self.decode_at_depth(key_signature.as_bytes(), &mut kp, depth + 1)?;
                let mut vp = 0;
                let val = self.decode_at_depth(value_signature.as_bytes(), &mut vp, depth + 1)?;
                entries.push((key, val));
            }
            if self.pos != body_end {
                return Err(Error::new(ErrorKind::BufferOverrun));
            }

            Ok(Value::Dict {
                key_signature,
                value_signature,
                entries,
            })
        } else {
            let elem_start = *sig_pos;
            crate::signature::advance_type(sig, sig_pos)?;
            let element_signature = Signature::from_validated(&sig[elem_start..*sig_pos]);

            let elem_alignment = Type::from_code(sig[elem_start])
                .and_then(Type::basic_alignment)
                .unwrap_or(match sig[elem_start] {
                    b'a' => 4,
                    b'(' => 8,
                    _ => 1,
                });
            self.align_to(elem_alignment)?;

            let body_end = self.pos + byte_len;
            let mut items = Vec::new();
            while self.pos < body_end {
                let mut ep = elem_start;
                items.push(self.decode_at_depth(sig, &mut ep, depth + 1)?);
            }
            if self.pos != body_end {
                return Err(Error::new(ErrorKind::BufferOverrun));
            }

            Ok(Value::Array {
                element_signature,
                items,
            })
        }
    }

    fn decode_struct(&mut self, sig: &[u8], sig_pos: &mut usize, depth: usize) -> Result<Value> {
        self.align_to(8)?;
        let mut items = Vec::new();
        while sig.get(*sig_pos) != Some(&b')') {
            if *sig_pos >= sig.len() {
                return Err(Error::new(ErrorKind::SignatureOverrun));
            }
            items.push(self.decode_at_depth(sig, sig_pos, depth + 1)?);
        }
        *sig_pos += 1;
        Ok(Value::Struct(items))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Encoder;
    use crate::value::ToValue;

    fn round_trip(value: Value) -> Value {
        let mut buf = Vec::new();
        let mut enc = Encoder::new(&mut buf, Endianness::Little);
        enc.encode_value(&value).unwrap();
        let sig = value.signature();
        let mut dec = Decoder::new(&buf, 0, Endianness::Little);
        let mut sig_pos = 0;
        dec.decode_value(sig.as_bytes(), &mut sig_pos).unwrap()
    }

    #[test]
    fn round_trips_u32() {
        assert_eq!(round_trip(7u32.to_value()), Value::U32(7));
    }

    #[test]
    fn round_trips_string() {
        assert_eq!(round_trip("hello".to_value()), Value::Str("hello".into()));
    }

    #[test]
    fn round_trips_array_of_i32() {
        let v = vec![1i32, 2, 3].to_value();
        assert_eq!(round_trip(v.clone()), v);
    }

    #[test]
    fn round_trips_struct() {
        let v = (1u8, "hi".to_string()).to_value();
        assert_eq!(round_trip(v.clone()), v);
    }

    #[test]
    fn round_trips_variant() {
        let v = Value::Variant(Variant::new(Value::Str("inner".into())));
        assert_eq!(round_trip(v.clone()), v);
    }

    #[test]
    fn round_trips_empty_array() {
        let empty: Vec<u32> = Vec::new();
        let v = empty.to_value();
        assert_eq!(round_trip(v.clone()), v);
    }

    #[test]
    fn rejects_non_zero_padding() {
        // u32 at offset 1 requires 3 bytes of zero padding first.
        let mut buf = vec![1u8, 0, 0, 0, 7, 0, 0, 0];
        buf[1] = 0xff;
        let mut dec = Decoder::new(&buf, 1, Endianness::Little);
        let sig = Signature::new("u").unwrap();
        let mut sig_pos = 0;
        assert!(dec.decode_value(sig.as_bytes(), &mut sig_pos).is_err());
    }
}
