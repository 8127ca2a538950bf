//! Message-stream reading: drives a [`MessageBuffer`] over any `Read`
//! source, yielding records across message boundaries until end of
//! stream.

use crate::message::{MessageBuffer, SetEntry};
use crate::template::DecodeError;
use crate::value::FieldValue;
use crate::ie::{InfoModel, InformationElement, InformationElementList, default_model};

use std::collections::{BTreeMap, VecDeque};
use std::io::Read;
use std::sync::Arc;

/// Reads IPFIX messages from a stream one at a time and iterates over
/// their records. Templates learned in earlier messages of the stream
/// apply to later ones.
pub struct MessageStreamReader<R: Read> {
    stream: R,
    msg: MessageBuffer,
    msgcount: u64,
}

impl<R: Read> MessageStreamReader<R> {
    pub fn new(stream: R) -> Self {
        Self::with_model(stream, default_model())
    }

    pub fn with_model(stream: R, model: InfoModel) -> Self {
        MessageStreamReader {
            stream,
            msg: MessageBuffer::with_model(model),
            msgcount: 0,
        }
    }

    /// The underlying buffer, holding the most recently read message.
    pub fn buffer(&mut self) -> &mut MessageBuffer {
        &mut self.msg
    }

    /// Messages successfully deframed so far.
    pub fn message_count(&self) -> u64 {
        self.msgcount
    }

    /// Set index of the current message.
    pub fn setlist(&self) -> &[SetEntry] {
        self.msg.setlist()
    }

    /// Reads the next message into the buffer; `Ok(false)` on a clean end
    /// of stream.
    pub fn next_message(&mut self) -> Result<bool, DecodeError> {
        match self.msg.read_message(&mut self.stream) {
            Ok(()) => {
                self.msgcount += 1;
                Ok(true)
            }
            Err(DecodeError::EndOfStream) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Iterates over all records in the stream as maps from IE name to
    /// value.
    pub fn namedict_iterator(&mut self) -> StreamRecords<'_, R, BTreeMap<String, FieldValue>> {
        StreamRecords {
            reader: self,
            shape: Shape::ByName,
            pending: VecDeque::new(),
            err: None,
            done: false,
        }
    }

    /// Iterates over all records in the stream as maps from IE identity
    /// to value.
    pub fn iedict_iterator(
        &mut self,
    ) -> StreamRecords<'_, R, BTreeMap<Arc<InformationElement>, FieldValue>> {
        StreamRecords {
            reader: self,
            shape: Shape::ByIe,
            pending: VecDeque::new(),
            err: None,
            done: false,
        }
    }

    /// Iterates over all records in the stream whose template contains
    /// every IE in `ielist`, as tuples in `ielist` order.
    pub fn tuple_iterator(
        &mut self,
        ielist: &InformationElementList,
    ) -> StreamRecords<'_, R, Vec<FieldValue>> {
        StreamRecords {
            reader: self,
            shape: Shape::Tuple(ielist.clone()),
            pending: VecDeque::new(),
            err: None,
            done: false,
        }
    }
}

enum Shape {
    ByName,
    ByIe,
    Tuple(InformationElementList),
}

trait FromMessage: Sized {
    fn drain(
        msg: &mut MessageBuffer,
        shape: &Shape,
        out: &mut VecDeque<Self>,
    ) -> Option<DecodeError>;
}

impl FromMessage for BTreeMap<String, FieldValue> {
    fn drain(
        msg: &mut MessageBuffer,
        _shape: &Shape,
        out: &mut VecDeque<Self>,
    ) -> Option<DecodeError> {
        for rec in msg.namedict_iterator() {
            match rec {
                Ok(rec) => out.push_back(rec),
                Err(e) => return Some(e),
            }
        }
        None
    }
}

impl FromMessage for BTreeMap<Arc<InformationElement>, FieldValue> {
    fn drain(
        msg: &mut MessageBuffer,
        _shape: &Shape,
        out: &mut VecDeque<Self>,
    ) -> Option<DecodeError> {
        for rec in msg.iedict_iterator() {
            match rec {
                Ok(rec) => out.push_back(rec),
                Err(e) => return Some(e),
            }
        }
        None
    }
}

impl FromMessage for Vec<FieldValue> {
    fn drain(
        msg: &mut MessageBuffer,
        shape: &Shape,
        out: &mut VecDeque<Self>,
    ) -> Option<DecodeError> {
        let Shape::Tuple(ielist) = shape else {
            return None;
        };
        for rec in msg.tuple_iterator(ielist) {
            match rec {
                Ok(rec) => out.push_back(rec),
                Err(e) => return Some(e),
            }
        }
        None
    }
}

/// Iterator over the records of every message remaining in the stream.
/// Messages are deframed lazily; records already decoded from a message
/// are yielded before any error that message produced.
pub struct StreamRecords<'a, R: Read, T> {
    reader: &'a mut MessageStreamReader<R>,
    shape: Shape,
    pending: VecDeque<T>,
    err: Option<DecodeError>,
    done: bool,
}

impl<R: Read, T: FromMessage> Iterator for StreamRecords<'_, R, T> {
    type Item = Result<T, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(rec) = self.pending.pop_front() {
                return Some(Ok(rec));
            }
            if let Some(e) = self.err.take() {
                self.done = true;
                return Some(Err(e));
            }
            if self.done {
                return None;
            }
            match self.reader.next_message() {
                Ok(true) => {
                    self.err = T::drain(&mut self.reader.msg, &self.shape, &mut self.pending);
                }
                Ok(false) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
