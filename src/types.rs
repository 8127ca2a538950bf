//! IPFIX abstract data types and their wire codec.
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011#section-6>
//! - <https://datatracker.ietf.org/doc/html/rfc5610>
//!
//! Each abstract data type knows its natural wire length, which reduced
//! lengths it may be encoded at, and how to move a single [`FieldValue`]
//! to or from a buffer at a given offset and width. Multi-byte quantities
//! are big-endian throughout.

use crate::value::FieldValue;

use serde::Serialize;

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Sentinel length for variable-length information elements.
pub const VARLEN: u16 = 65535;

/// Errors raised by the type system: unsupported reduced-length requests,
/// values outside a type's domain, unknown type names, and buffer overruns
/// during single-value codec operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum IpfixTypeError {
    /// No type is registered under this name.
    UnknownType(String),
    /// Reduced-length encoding is not defined for this type at this width.
    NoReducedLength { name: &'static str, length: u16 },
    /// The value cannot be represented by this type at this width.
    ValueOutOfRange { name: &'static str, length: u16 },
    /// The native value kind does not match the type.
    WrongValueKind {
        name: &'static str,
        expected: &'static str,
    },
    /// The buffer is too small for the requested operation.
    BufferTooSmall { needed: usize, available: usize },
}

impl std::fmt::Display for IpfixTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpfixTypeError::UnknownType(name) => {
                write!(f, "no such IPFIX type {:?}", name)
            }
            IpfixTypeError::NoReducedLength { name, length } => {
                write!(
                    f,
                    "reduced length encoding not supported <{}>[{}]",
                    name, length
                )
            }
            IpfixTypeError::ValueOutOfRange { name, length } => {
                write!(f, "value out of range for <{}>[{}]", name, length)
            }
            IpfixTypeError::WrongValueKind { name, expected } => {
                write!(f, "<{}> expects a {} value", name, expected)
            }
            IpfixTypeError::BufferTooSmall { needed, available } => {
                write!(
                    f,
                    "buffer too small ({} bytes needed, {} available)",
                    needed, available
                )
            }
        }
    }
}

impl std::error::Error for IpfixTypeError {}

/// The closed set of IPFIX abstract data types.
///
/// Two kinds share this interface: *packed* types with a fixed natural
/// length and a bounded set of reduced-length variants, and *octet array*
/// types (`octetArray`, `string`) whose natural length is [`VARLEN`] and
/// which specialize to any concrete length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum IpfixType {
    OctetArray,
    Unsigned8,
    Unsigned16,
    Unsigned32,
    Unsigned64,
    Signed8,
    Signed16,
    Signed32,
    Signed64,
    Float32,
    Float64,
    Boolean,
    MacAddress,
    String,
    DateTimeSeconds,
    DateTimeMilliseconds,
    DateTimeMicroseconds,
    DateTimeNanoseconds,
    Ipv4Address,
    Ipv6Address,
}

/// All types, in registry order.
const ALL_TYPES: [IpfixType; 20] = [
    IpfixType::OctetArray,
    IpfixType::Unsigned8,
    IpfixType::Unsigned16,
    IpfixType::Unsigned32,
    IpfixType::Unsigned64,
    IpfixType::Signed8,
    IpfixType::Signed16,
    IpfixType::Signed32,
    IpfixType::Signed64,
    IpfixType::Float32,
    IpfixType::Float64,
    IpfixType::Boolean,
    IpfixType::MacAddress,
    IpfixType::String,
    IpfixType::DateTimeSeconds,
    IpfixType::DateTimeMilliseconds,
    IpfixType::DateTimeMicroseconds,
    IpfixType::DateTimeNanoseconds,
    IpfixType::Ipv4Address,
    IpfixType::Ipv6Address,
];

impl IpfixType {
    /// Looks up a type by its IANA registry name.
    pub fn for_name(name: &str) -> Result<IpfixType, IpfixTypeError> {
        ALL_TYPES
            .iter()
            .copied()
            .find(|t| t.name() == name)
            .ok_or_else(|| IpfixTypeError::UnknownType(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        match self {
            IpfixType::OctetArray => "octetArray",
            IpfixType::Unsigned8 => "unsigned8",
            IpfixType::Unsigned16 => "unsigned16",
            IpfixType::Unsigned32 => "unsigned32",
            IpfixType::Unsigned64 => "unsigned64",
            IpfixType::Signed8 => "signed8",
            IpfixType::Signed16 => "signed16",
            IpfixType::Signed32 => "signed32",
            IpfixType::Signed64 => "signed64",
            IpfixType::Float32 => "float32",
            IpfixType::Float64 => "float64",
            IpfixType::Boolean => "boolean",
            IpfixType::MacAddress => "macAddress",
            IpfixType::String => "string",
            IpfixType::DateTimeSeconds => "dateTimeSeconds",
            IpfixType::DateTimeMilliseconds => "dateTimeMilliseconds",
            IpfixType::DateTimeMicroseconds => "dateTimeMicroseconds",
            IpfixType::DateTimeNanoseconds => "dateTimeNanoseconds",
            IpfixType::Ipv4Address => "ipv4Address",
            IpfixType::Ipv6Address => "ipv6Address",
        }
    }

    /// Wire length of the type at its natural width; [`VARLEN`] for the
    /// octet array kinds.
    pub fn natural_length(&self) -> u16 {
        match self {
            IpfixType::OctetArray | IpfixType::String => VARLEN,
            IpfixType::Unsigned8 | IpfixType::Signed8 | IpfixType::Boolean => 1,
            IpfixType::Unsigned16 | IpfixType::Signed16 => 2,
            IpfixType::Unsigned32
            | IpfixType::Signed32
            | IpfixType::Float32
            | IpfixType::DateTimeSeconds
            | IpfixType::Ipv4Address => 4,
            IpfixType::MacAddress => 6,
            IpfixType::Unsigned64
            | IpfixType::Signed64
            | IpfixType::Float64
            | IpfixType::DateTimeMilliseconds
            | IpfixType::DateTimeMicroseconds
            | IpfixType::DateTimeNanoseconds => 8,
            IpfixType::Ipv6Address => 16,
        }
    }

    /// True for the kinds whose natural length is [`VARLEN`].
    pub fn is_varlen(&self) -> bool {
        self.natural_length() == VARLEN
    }

    /// Validates a specialization of this type to the given wire width.
    ///
    /// A width of 0 or the natural length is always accepted. Octet array
    /// kinds accept any fixed width. Packed numeric kinds accept only the
    /// widths in the reduced-length table (unsigned and signed chains down
    /// to one byte, `float64` to `float32`); everything else is an error.
    pub fn for_length(&self, length: u16) -> Result<IpfixType, IpfixTypeError> {
        if length == 0 || length == self.natural_length() || self.is_varlen() {
            return Ok(*self);
        }
        if rle_permitted(*self, length) {
            Ok(*self)
        } else {
            Err(IpfixTypeError::NoReducedLength {
                name: self.name(),
                length,
            })
        }
    }

    /// Wire length a value of this type will occupy when encoded at a
    /// variable-length position. Fixed-width types report their natural
    /// length.
    pub fn wire_length_of(&self, val: &FieldValue) -> Result<usize, IpfixTypeError> {
        match self {
            IpfixType::OctetArray => match val {
                FieldValue::Octets(b) => Ok(b.len()),
                _ => Err(self.wrong_kind("octet array")),
            },
            IpfixType::String => match val {
                FieldValue::String(s) => Ok(s.len()),
                _ => Err(self.wrong_kind("string")),
            },
            _ => Ok(usize::from(self.natural_length())),
        }
    }

    /// Encodes one value at `offset`, writing exactly `length` bytes
    /// (or the value's own length for varlen positions). Returns the
    /// offset of the first byte after the encoded value.
    pub fn encode_one(
        &self,
        val: &FieldValue,
        buf: &mut [u8],
        offset: usize,
        length: u16,
    ) -> Result<usize, IpfixTypeError> {
        match self {
            IpfixType::OctetArray => match val {
                FieldValue::Octets(b) => self.put_octets(b, buf, offset, length),
                _ => Err(self.wrong_kind("octet array")),
            },
            IpfixType::String => match val {
                FieldValue::String(s) => self.put_octets(s.as_bytes(), buf, offset, length),
                _ => Err(self.wrong_kind("string")),
            },
            IpfixType::Unsigned8
            | IpfixType::Unsigned16
            | IpfixType::Unsigned32
            | IpfixType::Unsigned64 => match val {
                FieldValue::Unsigned(v) => self.put_unsigned(*v, buf, offset, length),
                _ => Err(self.wrong_kind("unsigned integer")),
            },
            IpfixType::Signed8
            | IpfixType::Signed16
            | IpfixType::Signed32
            | IpfixType::Signed64 => match val {
                FieldValue::Signed(v) => self.put_signed(*v, buf, offset, length),
                _ => Err(self.wrong_kind("signed integer")),
            },
            IpfixType::Float32 | IpfixType::Float64 => match val {
                FieldValue::Float(v) => {
                    self.check_width(length)?;
                    if length == 4 {
                        let out = get_mut(buf, offset, 4)?;
                        out.copy_from_slice(&(*v as f32).to_be_bytes());
                        Ok(offset + 4)
                    } else {
                        let out = get_mut(buf, offset, 8)?;
                        out.copy_from_slice(&v.to_be_bytes());
                        Ok(offset + 8)
                    }
                }
                _ => Err(self.wrong_kind("float")),
            },
            IpfixType::Boolean => match val {
                FieldValue::Boolean(v) => {
                    self.check_natural(length)?;
                    let out = get_mut(buf, offset, 1)?;
                    // SMI TruthValue: 1 is true, 2 is false
                    out[0] = if *v { 1 } else { 2 };
                    Ok(offset + 1)
                }
                _ => Err(self.wrong_kind("boolean")),
            },
            IpfixType::MacAddress => match val {
                FieldValue::MacAddress(mac) => {
                    self.check_natural(length)?;
                    let out = get_mut(buf, offset, 6)?;
                    out.copy_from_slice(mac);
                    Ok(offset + 6)
                }
                _ => Err(self.wrong_kind("MAC address")),
            },
            IpfixType::DateTimeSeconds => match val {
                FieldValue::DateTime(t) => {
                    self.check_natural(length)?;
                    let secs = self.epoch_secs(t)?;
                    let out = get_mut(buf, offset, 4)?;
                    out.copy_from_slice(&secs.to_be_bytes());
                    Ok(offset + 4)
                }
                _ => Err(self.wrong_kind("timestamp")),
            },
            IpfixType::DateTimeMilliseconds => match val {
                FieldValue::DateTime(t) => {
                    self.check_natural(length)?;
                    let dur = t
                        .duration_since(UNIX_EPOCH)
                        .map_err(|_| self.out_of_range(length))?;
                    let msecs = u64::try_from(dur.as_millis())
                        .map_err(|_| self.out_of_range(length))?;
                    let out = get_mut(buf, offset, 8)?;
                    out.copy_from_slice(&msecs.to_be_bytes());
                    Ok(offset + 8)
                }
                _ => Err(self.wrong_kind("timestamp")),
            },
            IpfixType::DateTimeMicroseconds | IpfixType::DateTimeNanoseconds => match val {
                FieldValue::DateTime(t) => {
                    self.check_natural(length)?;
                    let secs = self.epoch_secs(t)?;
                    let dur = t
                        .duration_since(UNIX_EPOCH)
                        .map_err(|_| self.out_of_range(length))?;
                    // NTP short format: seconds, then fraction of 2^32
                    let frac = (u64::from(dur.subsec_nanos()) << 32) / 1_000_000_000;
                    let ntp = (u64::from(secs) << 32) | frac;
                    let out = get_mut(buf, offset, 8)?;
                    out.copy_from_slice(&ntp.to_be_bytes());
                    Ok(offset + 8)
                }
                _ => Err(self.wrong_kind("timestamp")),
            },
            IpfixType::Ipv4Address => match val {
                FieldValue::Ip4Addr(ip) => {
                    self.check_natural(length)?;
                    let out = get_mut(buf, offset, 4)?;
                    out.copy_from_slice(&ip.octets());
                    Ok(offset + 4)
                }
                _ => Err(self.wrong_kind("IPv4 address")),
            },
            IpfixType::Ipv6Address => match val {
                FieldValue::Ip6Addr(ip) => {
                    self.check_natural(length)?;
                    let out = get_mut(buf, offset, 16)?;
                    out.copy_from_slice(&ip.octets());
                    Ok(offset + 16)
                }
                _ => Err(self.wrong_kind("IPv6 address")),
            },
        }
    }

    /// Decodes one value of `length` bytes at `offset`. For packed types a
    /// `length` shorter than the natural length selects the reduced-length
    /// wire form.
    pub fn decode_one(
        &self,
        buf: &[u8],
        offset: usize,
        length: u16,
    ) -> Result<FieldValue, IpfixTypeError> {
        match self {
            IpfixType::OctetArray => {
                let b = get(buf, offset, usize::from(length))?;
                Ok(FieldValue::Octets(b.to_vec()))
            }
            IpfixType::String => {
                let b = get(buf, offset, usize::from(length))?;
                Ok(FieldValue::String(String::from_utf8_lossy(b).to_string()))
            }
            IpfixType::Unsigned8
            | IpfixType::Unsigned16
            | IpfixType::Unsigned32
            | IpfixType::Unsigned64 => {
                self.check_width(length)?;
                let b = get(buf, offset, usize::from(length))?;
                let mut v: u64 = 0;
                for &byte in b {
                    v = (v << 8) | u64::from(byte);
                }
                Ok(FieldValue::Unsigned(v))
            }
            IpfixType::Signed8 | IpfixType::Signed16 | IpfixType::Signed32
            | IpfixType::Signed64 => {
                self.check_width(length)?;
                let b = get(buf, offset, usize::from(length))?;
                let mut v: i64 = i64::from(b[0] as i8);
                for &byte in &b[1..] {
                    v = (v << 8) | i64::from(byte);
                }
                Ok(FieldValue::Signed(v))
            }
            IpfixType::Float32 | IpfixType::Float64 => match length {
                4 => {
                    self.check_width(length)?;
                    let b = get(buf, offset, 4)?;
                    let raw: [u8; 4] = b.try_into().map_err(|_| self.out_of_range(length))?;
                    Ok(FieldValue::Float(f64::from(f32::from_be_bytes(raw))))
                }
                8 => {
                    self.check_width(length)?;
                    let b = get(buf, offset, 8)?;
                    let raw: [u8; 8] = b.try_into().map_err(|_| self.out_of_range(length))?;
                    Ok(FieldValue::Float(f64::from_be_bytes(raw)))
                }
                _ => Err(self.no_rle(length)),
            },
            IpfixType::Boolean => {
                self.check_natural(length)?;
                let b = get(buf, offset, 1)?;
                Ok(FieldValue::Boolean(b[0] == 1))
            }
            IpfixType::MacAddress => {
                self.check_natural(length)?;
                let b = get(buf, offset, 6)?;
                let mac: [u8; 6] = b.try_into().map_err(|_| self.out_of_range(length))?;
                Ok(FieldValue::MacAddress(mac))
            }
            IpfixType::DateTimeSeconds => {
                self.check_natural(length)?;
                let secs = read_u32(buf, offset)?;
                Ok(FieldValue::DateTime(
                    UNIX_EPOCH + Duration::from_secs(u64::from(secs)),
                ))
            }
            IpfixType::DateTimeMilliseconds => {
                self.check_natural(length)?;
                let msecs = read_u64(buf, offset)?;
                Ok(FieldValue::DateTime(
                    UNIX_EPOCH + Duration::from_millis(msecs),
                ))
            }
            IpfixType::DateTimeMicroseconds | IpfixType::DateTimeNanoseconds => {
                self.check_natural(length)?;
                let ntp = read_u64(buf, offset)?;
                let secs = ntp >> 32;
                let nanos = ((ntp & 0xffff_ffff) * 1_000_000_000) >> 32;
                Ok(FieldValue::DateTime(
                    UNIX_EPOCH + Duration::new(secs, nanos as u32),
                ))
            }
            IpfixType::Ipv4Address => {
                self.check_natural(length)?;
                let b = get(buf, offset, 4)?;
                let raw: [u8; 4] = b.try_into().map_err(|_| self.out_of_range(length))?;
                Ok(FieldValue::Ip4Addr(Ipv4Addr::from(raw)))
            }
            IpfixType::Ipv6Address => {
                self.check_natural(length)?;
                let b = get(buf, offset, 16)?;
                let raw: [u8; 16] = b.try_into().map_err(|_| self.out_of_range(length))?;
                Ok(FieldValue::Ip6Addr(Ipv6Addr::from(raw)))
            }
        }
    }

    fn put_octets(
        &self,
        bytes: &[u8],
        buf: &mut [u8],
        offset: usize,
        length: u16,
    ) -> Result<usize, IpfixTypeError> {
        let wire = if length == VARLEN {
            bytes.len()
        } else {
            usize::from(length)
        };
        if bytes.len() > wire {
            return Err(self.out_of_range(length));
        }
        let out = get_mut(buf, offset, wire)?;
        out[..bytes.len()].copy_from_slice(bytes);
        // fixed-width fields are zero padded on the right
        out[bytes.len()..].fill(0);
        Ok(offset + wire)
    }

    fn put_unsigned(
        &self,
        v: u64,
        buf: &mut [u8],
        offset: usize,
        length: u16,
    ) -> Result<usize, IpfixTypeError> {
        self.check_width(length)?;
        let w = usize::from(length);
        if w < 8 && v >= 1u64 << (8 * w) {
            return Err(self.out_of_range(length));
        }
        let bytes = v.to_be_bytes();
        let out = get_mut(buf, offset, w)?;
        out.copy_from_slice(&bytes[8 - w..]);
        Ok(offset + w)
    }

    fn put_signed(
        &self,
        v: i64,
        buf: &mut [u8],
        offset: usize,
        length: u16,
    ) -> Result<usize, IpfixTypeError> {
        self.check_width(length)?;
        let w = usize::from(length);
        if w < 8 {
            let bound = 1i64 << (8 * w - 1);
            if v < -bound || v >= bound {
                return Err(self.out_of_range(length));
            }
        }
        let bytes = v.to_be_bytes();
        let out = get_mut(buf, offset, w)?;
        out.copy_from_slice(&bytes[8 - w..]);
        Ok(offset + w)
    }

    /// Width check for packed kinds: natural length or a permitted
    /// reduced length.
    fn check_width(&self, length: u16) -> Result<(), IpfixTypeError> {
        if length == self.natural_length() || rle_permitted(*self, length) {
            Ok(())
        } else {
            Err(self.no_rle(length))
        }
    }

    fn check_natural(&self, length: u16) -> Result<(), IpfixTypeError> {
        if length == self.natural_length() {
            Ok(())
        } else {
            Err(self.no_rle(length))
        }
    }

    fn epoch_secs(&self, t: &SystemTime) -> Result<u32, IpfixTypeError> {
        let dur = t
            .duration_since(UNIX_EPOCH)
            .map_err(|_| self.out_of_range(self.natural_length()))?;
        u32::try_from(dur.as_secs()).map_err(|_| self.out_of_range(self.natural_length()))
    }

    fn no_rle(&self, length: u16) -> IpfixTypeError {
        IpfixTypeError::NoReducedLength {
            name: self.name(),
            length,
        }
    }

    fn out_of_range(&self, length: u16) -> IpfixTypeError {
        IpfixTypeError::ValueOutOfRange {
            name: self.name(),
            length,
        }
    }

    fn wrong_kind(&self, expected: &'static str) -> IpfixTypeError {
        IpfixTypeError::WrongValueKind {
            name: self.name(),
            expected,
        }
    }
}

impl std::fmt::Display for IpfixType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}>", self.name())
    }
}

/// The reduced-length table of RFC 7011 §6.2: unsigned and signed integers
/// narrow along their chains, `float64` narrows to `float32`. Nothing else
/// narrows.
fn rle_permitted(kind: IpfixType, length: u16) -> bool {
    matches!(
        (kind, length),
        (IpfixType::Unsigned16, 1)
            | (IpfixType::Unsigned32, 1 | 2)
            | (IpfixType::Unsigned64, 1 | 2 | 4)
            | (IpfixType::Signed16, 1)
            | (IpfixType::Signed32, 1 | 2)
            | (IpfixType::Signed64, 1 | 2 | 4)
            | (IpfixType::Float64, 4)
    )
}

/// Decodes an IPFIX varlen length prefix at `offset`, returning the length
/// and the offset just past the prefix. One byte below 255; the escape
/// value 255 means the real length follows as a 16-bit quantity.
pub fn decode_varlen(buf: &[u8], offset: usize) -> Result<(usize, usize), IpfixTypeError> {
    let b = get(buf, offset, 1)?;
    if b[0] != 255 {
        Ok((usize::from(b[0]), offset + 1))
    } else {
        let len = read_u16(buf, offset + 1)?;
        Ok((usize::from(len), offset + 3))
    }
}

/// Encodes an IPFIX varlen length prefix at `offset`; inverse of
/// [`decode_varlen`].
pub fn encode_varlen(
    buf: &mut [u8],
    offset: usize,
    length: usize,
) -> Result<usize, IpfixTypeError> {
    if length >= 255 {
        let wire = u16::try_from(length).map_err(|_| IpfixTypeError::ValueOutOfRange {
            name: "varlen",
            length: VARLEN,
        })?;
        let out = get_mut(buf, offset, 3)?;
        out[0] = 255;
        out[1..3].copy_from_slice(&wire.to_be_bytes());
        Ok(offset + 3)
    } else {
        let out = get_mut(buf, offset, 1)?;
        out[0] = length as u8;
        Ok(offset + 1)
    }
}

fn get(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], IpfixTypeError> {
    buf.get(offset..offset + len)
        .ok_or(IpfixTypeError::BufferTooSmall {
            needed: offset + len,
            available: buf.len(),
        })
}

fn get_mut(buf: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], IpfixTypeError> {
    let available = buf.len();
    buf.get_mut(offset..offset + len)
        .ok_or(IpfixTypeError::BufferTooSmall {
            needed: offset + len,
            available,
        })
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> Result<u16, IpfixTypeError> {
    let b = get(buf, offset, 2)?;
    Ok(u16::from_be_bytes([b[0], b[1]]))
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Result<u32, IpfixTypeError> {
    let b = get(buf, offset, 4)?;
    Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

pub(crate) fn read_u64(buf: &[u8], offset: usize) -> Result<u64, IpfixTypeError> {
    let b = get(buf, offset, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(b);
    Ok(u64::from_be_bytes(raw))
}

pub(crate) fn write_u16(
    buf: &mut [u8],
    offset: usize,
    v: u16,
) -> Result<usize, IpfixTypeError> {
    let out = get_mut(buf, offset, 2)?;
    out.copy_from_slice(&v.to_be_bytes());
    Ok(offset + 2)
}

pub(crate) fn write_u32(
    buf: &mut [u8],
    offset: usize,
    v: u32,
) -> Result<usize, IpfixTypeError> {
    let out = get_mut(buf, offset, 4)?;
    out.copy_from_slice(&v.to_be_bytes());
    Ok(offset + 4)
}

#[cfg(test)]
mod type_tests {
    use super::*;

    #[test]
    fn it_roundtrips_unsigned_at_natural_width() {
        let mut buf = [0u8; 16];
        let end = IpfixType::Unsigned32
            .encode_one(&FieldValue::Unsigned(42), &mut buf, 0, 4)
            .unwrap();
        assert_eq!(end, 4);
        assert_eq!(&buf[..4], &[0, 0, 0, 42]);
        assert_eq!(
            IpfixType::Unsigned32.decode_one(&buf, 0, 4).unwrap(),
            FieldValue::Unsigned(42)
        );
    }

    #[test]
    fn it_reduces_unsigned64_to_four_bytes() {
        let mut buf = [0u8; 16];
        let end = IpfixType::Unsigned64
            .encode_one(&FieldValue::Unsigned(42), &mut buf, 0, 4)
            .unwrap();
        assert_eq!(end, 4);
        assert_eq!(
            IpfixType::Unsigned64.decode_one(&buf, 0, 4).unwrap(),
            FieldValue::Unsigned(42)
        );
    }

    #[test]
    fn it_rejects_out_of_range_reduced_values() {
        let mut buf = [0u8; 16];
        let err = IpfixType::Unsigned64
            .encode_one(&FieldValue::Unsigned(1 << 32), &mut buf, 0, 4)
            .unwrap_err();
        assert!(matches!(err, IpfixTypeError::ValueOutOfRange { .. }));
    }

    #[test]
    fn it_rejects_rle_outside_the_table() {
        assert!(IpfixType::Unsigned64.for_length(3).is_err());
        assert!(IpfixType::Ipv4Address.for_length(2).is_err());
        assert!(IpfixType::DateTimeSeconds.for_length(2).is_err());
        assert!(IpfixType::Float64.for_length(4).is_ok());
        assert!(IpfixType::Unsigned16.for_length(1).is_ok());
    }

    #[test]
    fn it_sign_extends_reduced_signed_values() {
        let mut buf = [0u8; 16];
        IpfixType::Signed32
            .encode_one(&FieldValue::Signed(-2), &mut buf, 0, 2)
            .unwrap();
        assert_eq!(&buf[..2], &[0xff, 0xfe]);
        assert_eq!(
            IpfixType::Signed32.decode_one(&buf, 0, 2).unwrap(),
            FieldValue::Signed(-2)
        );
    }

    #[test]
    fn it_encodes_smi_booleans() {
        let mut buf = [0u8; 2];
        IpfixType::Boolean
            .encode_one(&FieldValue::Boolean(true), &mut buf, 0, 1)
            .unwrap();
        IpfixType::Boolean
            .encode_one(&FieldValue::Boolean(false), &mut buf, 1, 1)
            .unwrap();
        assert_eq!(buf, [1, 2]);
        assert_eq!(
            IpfixType::Boolean.decode_one(&buf, 0, 1).unwrap(),
            FieldValue::Boolean(true)
        );
        assert_eq!(
            IpfixType::Boolean.decode_one(&buf, 1, 1).unwrap(),
            FieldValue::Boolean(false)
        );
    }

    #[test]
    fn it_encodes_utf8_strings() {
        let mut buf = [0u8; 16];
        let end = IpfixType::String
            .encode_one(
                &FieldValue::String("Grüezi".to_string()),
                &mut buf,
                0,
                VARLEN,
            )
            .unwrap();
        assert_eq!(end, 7);
        assert_eq!(&buf[..7], &[71, 114, 195, 188, 101, 122, 105]);
        assert_eq!(
            IpfixType::String.decode_one(&buf, 0, 7).unwrap(),
            FieldValue::String("Grüezi".to_string())
        );
    }

    #[test]
    fn it_truncates_seconds_and_milliseconds() {
        let mut buf = [0u8; 16];
        let t = UNIX_EPOCH + Duration::new(1_371_823_203, 456_789_000);

        IpfixType::DateTimeSeconds
            .encode_one(&FieldValue::DateTime(t), &mut buf, 0, 4)
            .unwrap();
        assert_eq!(&buf[..4], &[81, 196, 92, 99]);
        assert_eq!(
            IpfixType::DateTimeSeconds.decode_one(&buf, 0, 4).unwrap(),
            FieldValue::DateTime(UNIX_EPOCH + Duration::from_secs(1_371_823_203))
        );

        IpfixType::DateTimeMilliseconds
            .encode_one(&FieldValue::DateTime(t), &mut buf, 0, 8)
            .unwrap();
        assert_eq!(
            IpfixType::DateTimeMilliseconds
                .decode_one(&buf, 0, 8)
                .unwrap(),
            FieldValue::DateTime(UNIX_EPOCH + Duration::from_millis(1_371_823_203_456))
        );
    }

    #[test]
    fn it_roundtrips_ntp_timestamps_within_one_fraction_unit() {
        let mut buf = [0u8; 16];
        let t = UNIX_EPOCH + Duration::new(1_371_823_203, 456_789_000);
        IpfixType::DateTimeMicroseconds
            .encode_one(&FieldValue::DateTime(t), &mut buf, 0, 8)
            .unwrap();
        let FieldValue::DateTime(back) = IpfixType::DateTimeMicroseconds
            .decode_one(&buf, 0, 8)
            .unwrap()
        else {
            panic!("expected a timestamp");
        };
        let delta = t
            .duration_since(back)
            .unwrap_or_else(|e| e.duration());
        assert!(delta < Duration::from_nanos(2));
    }

    #[test]
    fn it_frames_varlen_lengths() {
        let mut buf = [0u8; 8];

        let end = encode_varlen(&mut buf, 0, 14).unwrap();
        assert_eq!(end, 1);
        assert_eq!(buf[0], 14);
        assert_eq!(decode_varlen(&buf, 0).unwrap(), (14, 1));

        let end = encode_varlen(&mut buf, 0, 300).unwrap();
        assert_eq!(end, 3);
        assert_eq!(&buf[..3], &[255, 1, 44]);
        assert_eq!(decode_varlen(&buf, 0).unwrap(), (300, 3));

        // 255 itself needs the escape form
        let end = encode_varlen(&mut buf, 0, 255).unwrap();
        assert_eq!(end, 3);
        assert_eq!(buf[0], 255);
    }

    #[test]
    fn it_looks_up_types_by_name() {
        assert_eq!(
            IpfixType::for_name("unsigned64").unwrap(),
            IpfixType::Unsigned64
        );
        assert_eq!(
            IpfixType::for_name("dateTimeMilliseconds").unwrap(),
            IpfixType::DateTimeMilliseconds
        );
        assert!(IpfixType::for_name("no-such-type").is_err());
    }
}
