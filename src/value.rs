//! Native representations of decoded field values.

use serde::Serialize;

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::SystemTime;

/// Holds one decoded value together with its native representation.
///
/// The mapping from IPFIX abstract data types to variants follows the
/// type table in [`crate::types::IpfixType`]: all unsigned widths decode
/// to `Unsigned`, all signed widths to `Signed`, both float widths to
/// `Float`, and all four timestamp types to `DateTime`.
#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Octets(Vec<u8>),
    Unsigned(u64),
    Signed(i64),
    Float(f64),
    Boolean(bool),
    MacAddress([u8; 6]),
    String(String),
    DateTime(SystemTime),
    Ip4Addr(Ipv4Addr),
    Ip6Addr(Ipv6Addr),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValueError {
    InvalidDataType,
}

impl std::fmt::Display for FieldValueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldValueError::InvalidDataType => {
                write!(f, "field value has a different data type")
            }
        }
    }
}

impl std::error::Error for FieldValueError {}

impl FieldValue {
    /// Name of the native kind held by this value, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            FieldValue::Octets(_) => "octets",
            FieldValue::Unsigned(_) => "unsigned",
            FieldValue::Signed(_) => "signed",
            FieldValue::Float(_) => "float",
            FieldValue::Boolean(_) => "boolean",
            FieldValue::MacAddress(_) => "macAddress",
            FieldValue::String(_) => "string",
            FieldValue::DateTime(_) => "dateTime",
            FieldValue::Ip4Addr(_) => "ip4Addr",
            FieldValue::Ip6Addr(_) => "ip6Addr",
        }
    }
}

macro_rules! impl_try_from {
    ($($t:ty => $v:ident),* $(,)?) => {
        $(
            impl TryFrom<&FieldValue> for $t {
                type Error = FieldValueError;

                fn try_from(val: &FieldValue) -> Result<Self, Self::Error> {
                    match val {
                        FieldValue::$v(i) => Ok(i.clone()),
                        _ => Err(FieldValueError::InvalidDataType),
                    }
                }
            }

            impl From<$t> for FieldValue {
                fn from(val: $t) -> Self {
                    FieldValue::$v(val)
                }
            }
        )*
    };
}

impl_try_from!(
    u64 => Unsigned,
    i64 => Signed,
    f64 => Float,
    bool => Boolean,
    [u8; 6] => MacAddress,
    String => String,
    SystemTime => DateTime,
    Ipv4Addr => Ip4Addr,
    Ipv6Addr => Ip6Addr,
    Vec<u8> => Octets,
);

impl From<&str> for FieldValue {
    fn from(val: &str) -> Self {
        FieldValue::String(val.to_string())
    }
}

impl TryFrom<&FieldValue> for IpAddr {
    type Error = FieldValueError;

    fn try_from(value: &FieldValue) -> Result<Self, Self::Error> {
        match value {
            FieldValue::Ip4Addr(ip) => Ok(IpAddr::V4(*ip)),
            FieldValue::Ip6Addr(ip) => Ok(IpAddr::V6(*ip)),
            _ => Err(FieldValueError::InvalidDataType),
        }
    }
}

#[cfg(test)]
mod value_tests {
    use super::*;

    #[test]
    fn it_converts_field_values_to_native_types() {
        let v = FieldValue::Unsigned(27);
        let n: u64 = (&v).try_into().unwrap();
        assert_eq!(n, 27);

        let v = FieldValue::Ip4Addr(Ipv4Addr::new(10, 1, 2, 3));
        let ip: IpAddr = (&v).try_into().unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(10, 1, 2, 3)));

        let v = FieldValue::String("eth0".to_string());
        let s: String = (&v).try_into().unwrap();
        assert_eq!(s, "eth0");

        let v = FieldValue::Boolean(true);
        assert!(<i64 as TryFrom<&FieldValue>>::try_from(&v).is_err());
    }

    #[test]
    fn it_builds_field_values_from_native_types() {
        assert_eq!(FieldValue::from(42u64), FieldValue::Unsigned(42));
        assert_eq!(
            FieldValue::from("lo"),
            FieldValue::String("lo".to_string())
        );
    }
}
