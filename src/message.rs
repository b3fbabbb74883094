//! Message framing: spec §4.C. A message on the wire is a fixed 16-byte
//! header (endianness, type, flags, protocol version, body length, serial)
//! immediately followed by the header-fields array `a(yv)`, padded to an
//! 8-byte boundary, followed by the body.
//!
//! The trick this module leans on: the header-fields array's `u32` length
//! prefix sits at byte offset 12, right after the fixed part. Decoding the
//! header fields is therefore just one more array decode with the data
//! cursor positioned at 12 — no special case needed.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::codec::{Decoder, Encoder};
use crate::endian::Endianness;
use crate::error::{Error, ErrorKind, Result};
use crate::object_path::ObjectPath;
use crate::signature::Signature;
use crate::value::{Value, Variant};

pub const PROTOCOL_VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    MethodCall,
    MethodReturn,
    Error,
    Signal,
}

impl MessageType {
    fn code(self) -> u8 {
        match self {
            MessageType::MethodCall => 1,
            MessageType::MethodReturn => 2,
            MessageType::Error => 3,
            MessageType::Signal => 4,
        }
    }

    fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            1 => MessageType::MethodCall,
            2 => MessageType::MethodReturn,
            3 => MessageType::Error,
            4 => MessageType::Signal,
            other => return Err(Error::new(ErrorKind::UnknownTypeCode(other))),
        })
    }
}

/// A minimal bitflags-style macro, since this crate does not depend on the
/// `bitflags` crate. Mirrors the `const`-based flag sets `tokio-dbus`
/// hand-writes for its own `Flags` type.
macro_rules! bitflags_like {
    (
        $(#[$meta:meta])*
        pub struct $name:ident($inner:ty);
        $(pub const $variant:ident: $t:ident = $t2:ident($value:expr);)*
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name($inner);

        impl $name {
            $(pub const $variant: $name = $name($value);)*

            pub fn bits(self) -> $inner {
                self.0
            }

            pub fn from_bits(bits: $inner) -> Self {
                Self(bits)
            }

            pub fn contains(self, other: Self) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = Self;

            fn bitor(self, rhs: Self) -> Self {
                Self(self.0 | rhs.0)
            }
        }
    };
}

bitflags_like! {
    /// Message flags, spec §4.C.
    pub struct Flags(u8);
    pub const EMPTY: Flags = Flags(0);
    pub const NO_REPLY_EXPECTED: Flags = Flags(0x1);
    pub const NO_AUTO_START: Flags = Flags(0x2);
    pub const ALLOW_INTERACTIVE_AUTHORIZATION: Flags = Flags(0x4);
}

/// Header field codes, per spec §4.C / the D-Bus specification.
mod field_code {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_SERIAL: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
}

/// Allocates monotonically increasing, never-zero serial numbers for
/// outgoing messages. Shared by a [`crate::connection::Connection`]; kept
/// standalone here so [`Message`] construction does not need a connection
/// handle.
#[derive(Debug, Default)]
pub struct SerialAllocator {
    next: AtomicU32,
}

impl SerialAllocator {
    pub fn new() -> Self {
        // Start at 1: serial 0 is reserved to mean "unset".
        Self {
            next: AtomicU32::new(1),
        }
    }

    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.next.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
            // Wrapped past u32::MAX back to 0; skip it.
        }
    }
}

/// A D-Bus message, decoded into host types with a dynamic [`Value`] body.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub message_type: MessageType,
    pub flags: Flags,
    pub serial: u32,
    pub path: Option<ObjectPath>,
    pub interface: Option<String>,
    pub member: Option<String>,
    pub error_name: Option<String>,
    pub reply_serial: Option<u32>,
    pub destination: Option<String>,
    pub sender: Option<String>,
    pub signature: Signature,
    pub body: Vec<Value>,
}

impl Message {
    fn base(message_type: MessageType, serial: u32) -> Self {
        Self {
            message_type,
            flags: Flags::EMPTY,
            serial,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            destination: None,
            sender: None,
            signature: Signature::empty(),
            body: Vec::new(),
        }
    }

    pub fn method_call(path: ObjectPath, member: impl Into<String>, serial: u32) -> Self {
        let mut m = Self::base(MessageType::MethodCall, serial);
        m.path = Some(path);
        m.member = Some(member.into());
        m
    }

    pub fn method_return(reply_to: &Message, serial: u32) -> Result<Self> {
        if reply_to.message_type != MessageType::MethodCall {
            return Err(Error::new(ErrorKind::Programming(
                "method_return requires a MethodCall to reply to",
            )));
        }
        let mut m = Self::base(MessageType::MethodReturn, serial);
        m.reply_serial = Some(reply_to.serial);
        m.destination = reply_to.sender.clone();
        Ok(m)
    }

    pub fn error(reply_to: &Message, error_name: impl Into<String>, serial: u32) -> Result<Self> {
        if reply_to.message_type != MessageType::MethodCall {
            return Err(Error::new(ErrorKind::Programming(
                "error requires a MethodCall to reply to",
            )));
        }
        let mut m = Self::base(MessageType::Error, serial);
        m.reply_serial = Some(reply_to.serial);
        m.error_name = Some(error_name.into());
        m.destination = reply_to.sender.clone();
        Ok(m)
    }

    pub fn signal(path: ObjectPath, interface: impl Into<String>, member: impl Into<String>, serial: u32) -> Self {
        let mut m = Self::base(MessageType::Signal, serial);
        m.path = Some(path);
        m.interface = Some(interface.into());
        m.member = Some(member.into());
        m
    }

    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_body(mut self, body: Vec<Value>) -> Self {
        self.signature = body
            .iter()
            .fold(Signature::empty(), |mut sig, v| {
                sig.push_signature(&v.signature());
                sig
            });
        self.body = body;
        self
    }

    /// Validate the required headers for this message's type, per spec
    /// §4.C edge cases (`MissingPath`, `MissingMember`, ...).
    pub fn validate(&self) -> Result<()> {
        if self.serial == 0 {
            return Err(Error::new(ErrorKind::ZeroSerial));
        }
        match self.message_type {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return Err(Error::new(ErrorKind::MissingPath));
                }
                if self.member.is_none() {
                    return Err(Error::new(ErrorKind::MissingMember));
                }
            }
            MessageType::Signal => {
                if self.path.is_none() {
                    return Err(Error::new(ErrorKind::MissingPath));
                }
                if self.interface.is_none() {
                    return Err(Error::new(ErrorKind::MissingInterface));
                }
                if self.member.is_none() {
                    return Err(Error::new(ErrorKind::MissingMember));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_serial.is_none() {
                    return Err(Error::new(ErrorKind::MissingReplySerial));
                }
            }
            MessageType::Error => {
                if self.reply_serial.is_none() {
                    return Err(Error::new(ErrorKind::MissingReplySerial));
                }
                if self.error_name.is_none() {
                    return Err(Error::new(ErrorKind::MissingErrorName));
                }
            }
        }
        Ok(())
    }

    /// Encode this message to the wire, in native endianness.
    pub fn encode(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let endian = Endianness::native();
        let mut buf = Vec::with_capacity(64);

        // Fixed part, except for the body-length field which is patched in
        // after the body is encoded below.
        buf.push(endian.code());
        buf.push(self.message_type.code());
        buf.push(self.flags.bits());
        buf.push(PROTOCOL_VERSION);
        buf.extend_from_slice(&[0, 0, 0, 0]); // body length placeholder
        {
            let mut enc = Encoder::new(&mut buf, endian);
            enc.encode_value(&Value::U32(self.serial))?;
        }
        debug_assert_eq!(buf.len(), 12);

        let header_fields = self.header_fields();
        {
            let mut enc = Encoder::new(&mut buf, endian);
            enc.encode_value(&header_fields)?;
        }

        // Pad the header (fixed part + fields array) to an 8-byte boundary
        // before the body starts.
        let pad = crate::codec::align_up(buf.len(), 8) - buf.len();
        buf.extend(std::iter::repeat(0).take(pad));

        let body_start = buf.len();
        {
            let mut enc = Encoder::new(&mut buf, endian);
            for value in &self.body {
                enc.encode_value(value)?;
            }
        }
        let body_len = (buf.len() - body_start) as u32;

        let patch = match endian {
            Endianness::Little => body_len.to_le_bytes(),
            Endianness::Big => body_len.to_be_bytes(),
        };
        buf[4..8].copy_from_slice(&patch);

        Ok(buf)
    }

    fn header_fields(&self) -> Value {
        let mut items = Vec::new();

        let mut push = |code: u8, value: Value| {
            items.push(Value::Struct(vec![Value::Byte(code), Value::Variant(Variant::new(value))]));
        };

        if let Some(path) = &self.path {
            push(field_code::PATH, Value::ObjectPath(path.clone()));
        }
        if let Some(interface) = &self.interface {
            push(field_code::INTERFACE, Value::Str(interface.clone()));
        }
        if let Some(member) = &self.member {
            push(field_code::MEMBER, Value::Str(member.clone()));
        }
        if let Some(error_name) = &self.error_name {
            push(field_code::ERROR_NAME, Value::Str(error_name.clone()));
        }
        if let Some(reply_serial) = self.reply_serial {
            push(field_code::REPLY_SERIAL, Value::U32(reply_serial));
        }
        if let Some(destination) = &self.destination {
            push(field_code::DESTINATION, Value::Str(destination.clone()));
        }
        if let Some(sender) = &self.sender {
            push(field_code::SENDER, Value::Str(sender.clone()));
        }
        if !self.signature.is_empty() {
            push(field_code::SIGNATURE, Value::Signature(self.signature.clone()));
        }

        Value::Array {
            element_signature: Signature::new("(yv)").unwrap(),
            items,
        }
    }

    /// Decode the 16-byte fixed header, returning the endianness, message
    /// type, flags, and the body length needed to know how many more bytes
    /// to read from the transport.
    pub fn decode_fixed_header(bytes: &[u8; 16]) -> Result<FixedHeader> {
        let endian = Endianness::from_code(bytes[0])?;
        let message_type = MessageType::from_code(bytes[1])?;
        let flags = Flags::from_bits(bytes[2]);
        let _protocol_version = bytes[3];

        let read_u32 = |b: &[u8]| -> u32 {
            match endian {
                Endianness::Little => u32::from_le_bytes(b.try_into().unwrap()),
                Endianness::Big => u32::from_be_bytes(b.try_into().unwrap()),
            }
        };

        let body_length = read_u32(&bytes[4..8]);
        let serial = read_u32(&bytes[8..12]);
        let fields_array_len = read_u32(&bytes[12..16]);

        Ok(FixedHeader {
            endian,
            message_type,
            flags,
            body_length,
            serial,
            fields_array_len,
        })
    }

    /// Decode a complete message given the 16-byte fixed header already
    /// read via [`Message::decode_fixed_header`] and the remainder of the
    /// frame (header fields, padding, and body) concatenated after it.
    pub fn decode(fixed: &FixedHeader, fixed_bytes: &[u8; 16], rest: &[u8]) -> Result<Message> {
        let mut full = Vec::with_capacity(16 + rest.len());
        full.extend_from_slice(fixed_bytes);
        full.extend_from_slice(rest);

        let mut dec = Decoder::new(&full, 12, fixed.endian);
        let fields_sig = Signature::new("a(yv)").unwrap();
        let mut sig_pos = 0;
        let fields = dec.decode_value(fields_sig.as_bytes(), &mut sig_pos)?;

        let mut message = Self::base(fixed.message_type, fixed.serial);
        message.flags = fixed.flags;

        let Value::Array { items, .. } = fields else {
            return Err(Error::new(ErrorKind::InvalidSignature(
                "header fields was not an array",
            )));
        };

        for item in items {
            let Value::Struct(pair) = item else {
                return Err(Error::new(ErrorKind::ExpectedDictEntry));
            };
            let [Value::Byte(code), Value::Variant(variant)] = <[Value; 2]>::try_from(pair)
                .map_err(|_| Error::new(ErrorKind::ExpectedDictEntry))?
            else {
                return Err(Error::new(ErrorKind::ExpectedDictEntry));
            };

            match code {
                field_code::PATH => {
                    if let Value::ObjectPath(p) = *variant.value {
                        message.path = Some(p);
                    }
                }
                field_code::INTERFACE => {
                    if let Value::Str(s) = *variant.value {
                        message.interface = Some(s);
                    }
                }
                field_code::MEMBER => {
                    if let Value::Str(s) = *variant.value {
                        message.member = Some(s);
                    }
                }
                field_code::ERROR_NAME => {
                    if let Value::Str(s) = *variant.value {
                        message.error_name = Some(s);
                    }
                }
                field_code::REPLY_SERIAL => {
                    if let Value::U32(s) = *variant.value {
                        message.reply_serial = Some(s);
                    }
                }
                field_code::DESTINATION => {
                    if let Value::Str(s) = *variant.value {
                        message.destination = Some(s);
                    }
                }
                field_code::SENDER => {
                    if let Value::Str(s) = *variant.value {
                        message.sender = Some(s);
                    }
                }
                field_code::SIGNATURE => {
                    if let Value::Signature(s) = *variant.value {
                        message.signature = s;
                    }
                }
                _ => {}
            }
        }

        let header_len = crate::codec::align_up(dec.position(), 8);
        let body_start = header_len;
        let body_end = body_start + fixed.body_length as usize;
        if body_end > full.len() {
            return Err(Error::new(ErrorKind::BufferOverrun));
        }

        let mut body_dec = Decoder::new(&full, body_start, fixed.endian);
        let mut body = Vec::new();
        let sig_bytes = message.signature.as_bytes().to_vec();
        let mut bp = 0;
        while bp < sig_bytes.len() {
            body.push(body_dec.decode_value(&sig_bytes, &mut bp)?);
        }
        if body_dec.position() != body_end {
            return Err(Error::new(ErrorKind::BufferOverrun));
        }
        message.body = body;

        message.validate()?;
        Ok(message)
    }
}

/// The fixed 16-byte header, decoded enough to know how many further bytes
/// to read off the transport before the rest of the message can be parsed.
#[derive(Debug, Clone, Copy)]
pub struct FixedHeader {
    pub endian: Endianness,
    pub message_type: MessageType,
    pub flags: Flags,
    pub body_length: u32,
    pub serial: u32,
    pub fields_array_len: u32,
}

impl FixedHeader {
    /// Total number of additional bytes to read after the 16-byte fixed
    /// header: the header-fields array, its padding to an 8-byte boundary,
    /// and the body.
    pub fn remaining_len(&self) -> usize {
        let fields_end = 16 + self.fields_array_len as usize;
        let padded = crate::codec::align_up(fields_end, 8);
        (padded - 16) + self.body_length as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_decode_method_call() {
        let path = ObjectPath::new("/org/freedesktop/DBus").unwrap();
        let msg = Message::method_call(path, "Hello", 1)
            .with_destination("org.freedesktop.DBus")
            .with_body(vec![Value::Str("hi".into())]);

        let encoded = msg.encode().unwrap();
        let fixed_bytes: [u8; 16] = encoded[..16].try_into().unwrap();
        let fixed = Message::decode_fixed_header(&fixed_bytes).unwrap();
        assert_eq!(fixed.remaining_len(), encoded.len() - 16);

        let decoded = Message::decode(&fixed, &fixed_bytes, &encoded[16..]).unwrap();
        assert_eq!(decoded.member.as_deref(), Some("Hello"));
        assert_eq!(decoded.destination.as_deref(), Some("org.freedesktop.DBus"));
        assert_eq!(decoded.body, vec![Value::Str("hi".into())]);
    }

    #[test]
    fn method_call_missing_member_fails_validation() {
        let path = ObjectPath::new("/a").unwrap();
        let mut msg = Message::method_call(path, "X", 1);
        msg.member = None;
        assert!(msg.validate().is_err());
    }

    #[test]
    fn zero_serial_rejected() {
        let path = ObjectPath::new("/a").unwrap();
        let msg = Message::method_call(path, "X", 0);
        assert!(matches!(msg.validate(), Err(e) if matches!(e.kind(), ErrorKind::ZeroSerial)));
    }

    #[test]
    fn serial_allocator_skips_zero_on_wrap() {
        let alloc = SerialAllocator::new();
        alloc.next.store(u32::MAX, Ordering::Relaxed);
        let first = alloc.next_serial();
        assert_eq!(first, u32::MAX);
        let second = alloc.next_serial();
        assert_eq!(second, 1);
    }
}
