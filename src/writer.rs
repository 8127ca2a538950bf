//! Message-stream writing: drives a [`MessageBuffer`] over any `Write`
//! sink, flushing and retrying once whenever an export overflows the
//! message MTU.

use crate::ie::{InfoModel, InformationElement, InformationElementList, default_model};
use crate::message::MessageBuffer;
use crate::template::{EncodeError, Template};
use crate::value::FieldValue;

use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;

/// Writes a record stream as a sequence of MTU-bounded IPFIX messages.
///
/// The writer owns a [`MessageBuffer`] and a sink. Each export helper
/// catches [`EncodeError::EndOfMessage`] exactly once: the current
/// message is flushed, a new one is begun in the same domain, the set is
/// re-ensured, and the export retried. Anything else propagates.
pub struct MessageStreamWriter<W: Write> {
    stream: W,
    msg: MessageBuffer,
    curtid: u16,
    msgcount: u64,
}

impl<W: Write> MessageStreamWriter<W> {
    pub fn new(stream: W) -> Self {
        Self::with_model(stream, default_model())
    }

    pub fn with_model(stream: W, model: InfoModel) -> Self {
        MessageStreamWriter {
            stream,
            msg: MessageBuffer::with_model(model),
            curtid: 0,
            msgcount: 0,
        }
    }

    /// Sets the per-message MTU; see [`MessageBuffer::set_mtu`].
    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), EncodeError> {
        self.msg.set_mtu(mtu)
    }

    /// The underlying message buffer.
    pub fn buffer(&mut self) -> &mut MessageBuffer {
        &mut self.msg
    }

    /// Messages flushed to the sink so far.
    pub fn message_count(&self) -> u64 {
        self.msgcount
    }

    /// Begins exporting in an observation domain, flushing any message in
    /// progress first.
    pub fn set_domain(&mut self, odid: u32) -> Result<(), EncodeError> {
        if self.msg.export_needs_flush() {
            self.msg.write_message(&mut self.stream)?;
            self.msgcount += 1;
        }
        self.curtid = 0;
        self.msg.begin_export(odid)
    }

    /// Stores a template for later export; it is written to the wire when
    /// its data set is first ensured.
    pub fn add_template(&mut self, tmpl: Template) -> Result<(), EncodeError> {
        self.msg.add_template(tmpl, false)
    }

    /// Selects the template whose records subsequent exports carry.
    pub fn set_export_template(&mut self, tid: u16) -> Result<(), EncodeError> {
        self.curtid = tid;
        self.retry_after_flush(|msg| msg.export_ensure_set(tid))
    }

    /// Exports one record of ordered values.
    pub fn export_record(&mut self, vals: &[FieldValue]) -> Result<(), EncodeError> {
        let tid = self.ensure_template()?;
        self.retry_after_flush(|msg| msg.export_ensure_set(tid))?;
        self.retry_after_flush(|msg| msg.export_record(vals))
    }

    /// Exports one record keyed by IE name.
    pub fn export_namedict(
        &mut self,
        rec: &BTreeMap<String, FieldValue>,
    ) -> Result<(), EncodeError> {
        let tid = self.ensure_template()?;
        self.retry_after_flush(|msg| msg.export_ensure_set(tid))?;
        self.retry_after_flush(|msg| msg.export_namedict(rec))
    }

    /// Exports one record keyed by IE identity.
    pub fn export_iedict(
        &mut self,
        rec: &BTreeMap<Arc<InformationElement>, FieldValue>,
    ) -> Result<(), EncodeError> {
        let tid = self.ensure_template()?;
        self.retry_after_flush(|msg| msg.export_ensure_set(tid))?;
        self.retry_after_flush(|msg| msg.export_iedict(rec))
    }

    /// Exports one projected tuple over `ielist`.
    pub fn export_tuple(
        &mut self,
        vals: &[FieldValue],
        ielist: &InformationElementList,
    ) -> Result<(), EncodeError> {
        let tid = self.ensure_template()?;
        self.retry_after_flush(|msg| msg.export_ensure_set(tid))?;
        self.retry_after_flush(|msg| msg.export_tuple(vals, ielist))
    }

    /// Flushes the current message. Unless `final_flush` is set, a new
    /// message is begun in the same domain with the same current set, so
    /// exporting can continue seamlessly.
    pub fn flush(&mut self, final_flush: bool) -> Result<(), EncodeError> {
        let setid = self.msg.current_set_id();
        let odid = self.msg.odid();
        self.msg.write_message(&mut self.stream)?;
        self.msgcount += 1;
        if !final_flush {
            self.msg.begin_export(odid)?;
            if setid != 0 {
                self.msg.export_ensure_set(setid)?;
            }
        }
        Ok(())
    }

    fn ensure_template(&self) -> Result<u16, EncodeError> {
        if self.curtid == 0 {
            Err(EncodeError::NoDataSet)
        } else {
            Ok(self.curtid)
        }
    }

    fn retry_after_flush<T>(
        &mut self,
        op: impl Fn(&mut MessageBuffer) -> Result<T, EncodeError>,
    ) -> Result<T, EncodeError> {
        match op(&mut self.msg) {
            Err(EncodeError::EndOfMessage) => {
                self.flush(false)?;
                op(&mut self.msg)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod writer_tests {
    use super::*;
    use crate::ie::InfoModel;
    use crate::reader::MessageStreamReader;

    fn iana_model() -> InfoModel {
        let model = InfoModel::new();
        model.use_iana_default().unwrap();
        model
    }

    #[test]
    fn it_splits_a_record_stream_across_messages() {
        let model = iana_model();
        let ies = model
            .spec_list(["sourceIPv4Address", "packetDeltaCount"])
            .unwrap();
        let tmpl = Template::from_ies(256, ies).unwrap();

        let mut sink = Vec::new();
        let mut writer = MessageStreamWriter::with_model(&mut sink, model.clone());
        // room for the template set plus a handful of 12-byte records
        writer.set_mtu(100).unwrap();
        writer.set_domain(1).unwrap();
        writer.add_template(tmpl).unwrap();
        writer.set_export_template(256).unwrap();
        for i in 0..20u32 {
            writer
                .export_record(&[
                    FieldValue::Ip4Addr(std::net::Ipv4Addr::from(0x0a00_0000 + i)),
                    FieldValue::Unsigned(u64::from(i)),
                ])
                .unwrap();
        }
        writer.flush(true).unwrap();
        assert!(writer.message_count() > 1);
        drop(writer);

        let mut reader = MessageStreamReader::with_model(sink.as_slice(), model);
        let records: Result<Vec<_>, _> = reader.namedict_iterator().collect();
        let records = records.unwrap();
        assert_eq!(records.len(), 20);
        assert_eq!(records[19]["packetDeltaCount"], FieldValue::Unsigned(19));
        // every record counted exactly once on the receive side
        assert_eq!(reader.buffer().next_sequence(1, 0), 20);
    }

    #[test]
    fn it_requires_a_template_selection() {
        let model = iana_model();
        let mut sink = Vec::new();
        let mut writer = MessageStreamWriter::with_model(&mut sink, model);
        writer.set_domain(1).unwrap();
        assert_eq!(
            writer.export_record(&[FieldValue::Unsigned(1)]),
            Err(EncodeError::NoDataSet)
        );
    }
}
