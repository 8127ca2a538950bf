#![doc = include_str!("../README.md")]

pub mod ie;
pub mod message;
pub mod reader;
pub mod template;
mod tests;
pub mod types;
pub mod v9pdu;
pub mod value;
pub mod writer;

pub use ie::{InfoModel, InformationElement, InformationElementList, SpecError};
pub use message::{DecodedRecord, MessageBuffer};
pub use reader::MessageStreamReader;
pub use template::{DecodeError, EncodeError, PackingPlan, Template};
pub use types::{IpfixType, IpfixTypeError, VARLEN};
pub use v9pdu::{PduBuffer, PduReader};
pub use value::FieldValue;
pub use writer::MessageStreamWriter;
