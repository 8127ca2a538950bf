//! NetFlow v9 PDU framing.
//!
//! References:
//! - <https://www.ietf.org/rfc/rfc3954.txt>
//! - <https://www.cisco.com/en/US/technologies/tk648/tk362/technologies_white_paper09186a00800a3db9.html>
//!
//! NetFlow v9 is the immediate ancestor of IPFIX and shares its
//! template-driven shape with different framing: a 20-byte PDU header
//! with a record count, template sets at id 0 and options template sets
//! at id 1, and no message length field. The record count in the header
//! drives sequence accounting, and on a stream the start of the next PDU
//! is recognized by a set id equal to the version number 9.
//!
//! Templates and the record codec are shared with the IPFIX side; only
//! the framing differs.

use crate::ie::{InfoModel, InformationElementList, default_model};
use crate::message::{BufferStats, DecodedRecord, SET_HDR_LEN, SetEntry, read_full};
use crate::template::{DecodeError, MIN_DATA_SET_ID, PackingPlan, Template};
use crate::types;
use crate::value::FieldValue;

use lru::LruCache;
use nom_derive::{Nom, Parse};
use serde::Serialize;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// NetFlow v9 version number.
pub const V9_VERSION: u16 = 9;
/// Set id carrying v9 template records.
pub const V9_TEMPLATE_SET_ID: u16 = 0;
/// Set id carrying v9 options template records.
pub const V9_OPTIONS_SET_ID: u16 = 1;
/// PDU header size in octets.
pub const PDU_HDR_LEN: usize = 20;

const BUF_LEN: usize = 65536;
const PLAN_CACHE_SIZE: usize = 32;

/// NetFlow v9 PDU header.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct PduHeader {
    /// For version 9, this value is 9.
    pub version: u16,
    /// Number of records (template and data) contained within this PDU.
    pub count: u16,
    /// Time in milliseconds since the exporting device was first booted.
    pub sys_up_time: u32,
    /// Seconds since the UNIX epoch at export time.
    pub unix_secs: u32,
    /// Incremental sequence counter of all export packets sent by the
    /// exporting device.
    pub sequence_number: u32,
    /// Identifier of the exporting observation point; plays the role the
    /// observation domain id has in IPFIX.
    pub source_id: u32,
}

/// A buffer for decoding NetFlow v9 PDUs from a datagram or stream.
///
/// Load one PDU with [`from_bytes`](PduBuffer::from_bytes) (or through a
/// [`PduReader`]), then walk it with the record iterators. Templates are
/// stored per `(source id, template id)` and persist across PDUs; the
/// receive sequence counter advances by each PDU's declared record count.
pub struct PduBuffer {
    mbuf: Vec<u8>,
    length: usize,
    reccount: u16,
    sequence: u32,
    export_epoch: Option<u32>,
    sysuptime_ms: u32,
    odid: u32,
    stream: u32,
    model: InfoModel,
    templates: HashMap<(u32, u16), Arc<Template>>,
    accepted: HashSet<(u32, u16)>,
    sequences: HashMap<(u32, u32), u32>,
    setlist: Vec<SetEntry>,
    plan_cache: LruCache<(u32, u16, Vec<(u32, u16)>), Arc<PackingPlan>>,
    last_tuple_key: Option<Vec<(u32, u16)>>,
    stats: BufferStats,
}

impl Default for PduBuffer {
    fn default() -> Self {
        Self::with_model(default_model())
    }
}

impl std::fmt::Debug for PduBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PduBuffer")
            .field("source_id", &self.odid)
            .field("length", &self.length)
            .field("templates", &self.templates.len())
            .finish()
    }
}

impl PduBuffer {
    /// Creates a buffer using the process-wide default information model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer resolving IEs through an explicit model.
    pub fn with_model(model: InfoModel) -> Self {
        PduBuffer {
            mbuf: vec![0; BUF_LEN],
            length: 0,
            reccount: 0,
            sequence: 0,
            export_epoch: None,
            sysuptime_ms: 0,
            odid: 0,
            stream: 0,
            model,
            templates: HashMap::new(),
            accepted: HashSet::new(),
            sequences: HashMap::new(),
            setlist: Vec::new(),
            plan_cache: LruCache::new(
                NonZeroUsize::new(PLAN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
            last_tuple_key: None,
            stats: BufferStats::default(),
        }
    }

    /// Source id of the current PDU.
    pub fn source_id(&self) -> u32 {
        self.odid
    }

    /// Record count declared by the current PDU header.
    pub fn record_count(&self) -> u16 {
        self.reccount
    }

    /// Sequence number carried by the current PDU header.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// Next sequence value for a `(source, stream)` pair, advanced by the
    /// declared record count of each PDU read.
    pub fn next_sequence(&self, source_id: u32, stream: u32) -> u32 {
        self.sequences
            .get(&(source_id, stream))
            .copied()
            .unwrap_or(0)
    }

    /// Export time from the current PDU header.
    pub fn get_export_time(&self) -> Option<SystemTime> {
        self.export_epoch
            .map(|e| UNIX_EPOCH + Duration::from_secs(u64::from(e)))
    }

    /// Boot time of the exporting device, derived from export time and
    /// uptime; the base for the PDU's relative timestamps.
    pub fn basetime(&self) -> Option<SystemTime> {
        let export = self.get_export_time()?;
        export.checked_sub(Duration::from_millis(u64::from(self.sysuptime_ms)))
    }

    /// Looks up a template stored under the current source id.
    pub fn template(&self, tid: u16) -> Option<Arc<Template>> {
        self.templates.get(&(self.odid, tid)).cloned()
    }

    /// Loads one complete PDU from a byte slice. Since v9 carries no PDU
    /// length field, the slice is taken to hold exactly one PDU; trailing
    /// bytes shorter than a set header are ignored as padding.
    pub fn from_bytes(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        if bytes.len() < PDU_HDR_LEN {
            return Err(DecodeError::ShortRead {
                expected: PDU_HDR_LEN,
                got: bytes.len(),
            });
        }
        if bytes.len() > BUF_LEN {
            return Err(DecodeError::SetTooLong {
                offset: 0,
                setlen: bytes.len(),
                msglen: BUF_LEN,
            });
        }
        let (_, header) = PduHeader::parse(bytes).map_err(|_| DecodeError::ShortRead {
            expected: PDU_HDR_LEN,
            got: bytes.len(),
        })?;
        self.begin_pdu(header)?;
        self.mbuf[..bytes.len()].copy_from_slice(bytes);
        self.length = bytes.len();

        let mut offset = PDU_HDR_LEN;
        while self.length - offset >= SET_HDR_LEN {
            let setid = types::read_u16(&self.mbuf, offset)?;
            let setlen = usize::from(types::read_u16(&self.mbuf, offset + 2)?);
            if setlen < SET_HDR_LEN {
                return Err(DecodeError::BadSetLength { offset, setlen });
            }
            if offset + setlen > self.length {
                return Err(DecodeError::SetTooLong {
                    offset,
                    setlen,
                    msglen: self.length,
                });
            }
            self.setlist.push(SetEntry {
                offset,
                setid,
                setlen,
            });
            offset += setlen;
        }
        Ok(())
    }

    /// Resets per-PDU state from a header, keeping learned templates and
    /// advancing the sequence counter by the declared record count.
    fn begin_pdu(&mut self, header: PduHeader) -> Result<(), DecodeError> {
        if header.version != V9_VERSION {
            return Err(DecodeError::BadVersion(header.version));
        }
        self.reccount = header.count;
        self.sysuptime_ms = header.sys_up_time;
        self.export_epoch = Some(header.unix_secs);
        self.sequence = header.sequence_number;
        self.odid = header.source_id;
        self.length = PDU_HDR_LEN;
        self.setlist.clear();
        let counter = self.sequences.entry((self.odid, self.stream)).or_insert(0);
        *counter = counter.wrapping_add(u32::from(header.count));
        self.stats.messages += 1;
        Ok(())
    }

    /// Low-level record iteration over the current PDU.
    pub fn record_iterator<'a, F>(&'a mut self, accept: F) -> PduRecordIterator<'a>
    where
        F: FnMut(&Template) -> bool + 'a,
    {
        PduRecordIterator {
            buf: self,
            accept: Box::new(accept),
            projection: None,
            set_idx: 0,
            cursor: 0,
            setend: 0,
            active: None,
            failed: false,
        }
    }

    /// Iterates over every record as a map from IE name to value.
    pub fn namedict_iterator(&mut self) -> PduNamedictIterator<'_> {
        PduNamedictIterator {
            inner: self.record_iterator(|_| true),
        }
    }

    /// Iterates over records whose template contains every IE in
    /// `ielist`, yielding tuples in `ielist` order.
    pub fn tuple_iterator<'a>(
        &'a mut self,
        ielist: &InformationElementList,
    ) -> PduTupleIterator<'a> {
        let key = ielist.key();
        if self.last_tuple_key.as_ref() != Some(&key) {
            self.recache_accepted(ielist);
            self.last_tuple_key = Some(key);
        }
        let wanted = ielist.clone();
        PduTupleIterator {
            inner: PduRecordIterator {
                buf: self,
                accept: Box::new(move |tmpl: &Template| {
                    wanted.iter().all(|ie| tmpl.ies().contains(ie))
                }),
                projection: Some(ielist.clone()),
                set_idx: 0,
                cursor: 0,
                setend: 0,
                active: None,
                failed: false,
            },
        }
    }

    fn recache_accepted(&mut self, ielist: &InformationElementList) {
        let odid = self.odid;
        for ((d, tid), tmpl) in &self.templates {
            if *d != odid {
                continue;
            }
            if ielist.iter().all(|ie| tmpl.ies().contains(ie)) {
                self.accepted.insert((*d, *tid));
            } else {
                self.accepted.remove(&(*d, *tid));
            }
        }
    }

    fn learn_template(&mut self, tmpl: Template, accept: &mut impl FnMut(&Template) -> bool) {
        let tid = tmpl.tid();
        let key = (self.odid, tid);
        if tmpl.is_withdrawal() {
            if self.templates.remove(&key).is_some() {
                self.accepted.remove(&key);
                self.plan_cache.clear();
            }
            return;
        }
        self.stats.templates_read += 1;
        if accept(&tmpl) {
            log::debug!(
                "accepted v9 template {} from source {}: {} fields",
                tid,
                self.odid,
                tmpl.count()
            );
            self.accepted.insert(key);
        } else {
            self.accepted.remove(&key);
        }
        if self.templates.insert(key, Arc::new(tmpl)).is_some() {
            self.plan_cache.clear();
        }
    }

    fn plan_for(
        &mut self,
        tmpl: &Arc<Template>,
        ielist: &InformationElementList,
    ) -> Result<Arc<PackingPlan>, DecodeError> {
        let key = (self.odid, tmpl.tid(), ielist.key());
        if let Some(plan) = self.plan_cache.get(&key) {
            return Ok(plan.clone());
        }
        let plan = Arc::new(tmpl.tuple_plan(ielist)?);
        self.plan_cache.put(key, plan.clone());
        Ok(plan)
    }
}

/// Decodes one v9 template record. The data template header is
/// `tid, field count`; the options template header carries scope and
/// option lengths in *bytes*, four per field spec. v9 field specs have no
/// enterprise bit.
pub fn decode_v9_template_from(
    model: &InfoModel,
    setid: u16,
    buf: &[u8],
    offset: usize,
) -> Result<(Template, usize), DecodeError> {
    let mut cursor = offset;
    let (tid, count, scopecount) = match setid {
        V9_TEMPLATE_SET_ID => {
            let tid = types::read_u16(buf, cursor)?;
            let count = types::read_u16(buf, cursor + 2)?;
            cursor += 4;
            (tid, count, 0)
        }
        V9_OPTIONS_SET_ID => {
            let tid = types::read_u16(buf, cursor)?;
            let scope_len = types::read_u16(buf, cursor + 2)?;
            let option_len = types::read_u16(buf, cursor + 4)?;
            cursor += 6;
            let scopecount = scope_len / 4;
            (tid, scopecount + option_len / 4, scopecount)
        }
        other => return Err(DecodeError::BadTemplateSet(other)),
    };

    if count > 0 && tid < MIN_DATA_SET_ID {
        return Err(DecodeError::BadTemplateId(tid));
    }

    let mut tmpl = Template::new(tid).map_err(|_| DecodeError::BadTemplateId(tid))?;
    for _ in 0..count {
        let num = types::read_u16(buf, cursor)?;
        let length = types::read_u16(buf, cursor + 2)?;
        cursor += 4;
        tmpl.append(model.for_template_entry(0, num, length)?);
    }
    tmpl.set_scope_count(usize::from(scopecount));
    tmpl.finalize();
    Ok((tmpl, cursor))
}

/// Iterator over the records of the current PDU. Unlike the IPFIX side,
/// yielding records does not advance the sequence counter; v9 sequence
/// accounting is driven by the header's record count.
pub struct PduRecordIterator<'a> {
    buf: &'a mut PduBuffer,
    accept: Box<dyn FnMut(&Template) -> bool + 'a>,
    projection: Option<InformationElementList>,
    set_idx: usize,
    cursor: usize,
    setend: usize,
    active: Option<(Arc<Template>, Option<Arc<PackingPlan>>)>,
    failed: bool,
}

impl Iterator for PduRecordIterator<'_> {
    type Item = Result<DecodedRecord, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        loop {
            if let Some((tmpl, plan)) = self.active.clone() {
                if tmpl.min_length() > 0 && self.cursor + tmpl.min_length() <= self.setend {
                    let bounded = &self.buf.mbuf[..self.setend];
                    let result = match &plan {
                        Some(plan) => tmpl.decode_with_plan(plan, bounded, self.cursor),
                        None => tmpl.decode_from(bounded, self.cursor),
                    };
                    match result {
                        Ok((values, next)) => {
                            self.cursor = next;
                            self.buf.stats.records_read += 1;
                            return Some(Ok(DecodedRecord {
                                template: tmpl,
                                values,
                            }));
                        }
                        Err(e) => {
                            self.failed = true;
                            return Some(Err(e));
                        }
                    }
                }
                self.active = None;
            }

            if self.set_idx >= self.buf.setlist.len() {
                return None;
            }
            let entry = self.buf.setlist[self.set_idx];
            self.set_idx += 1;
            let mut cursor = entry.offset + SET_HDR_LEN;
            let setend = entry.offset + entry.setlen;

            match entry.setid {
                V9_TEMPLATE_SET_ID | V9_OPTIONS_SET_ID => {
                    while setend - cursor >= 4 {
                        match decode_v9_template_from(
                            &self.buf.model,
                            entry.setid,
                            &self.buf.mbuf[..setend],
                            cursor,
                        ) {
                            Ok((tmpl, next)) => {
                                cursor = next;
                                self.buf.learn_template(tmpl, &mut self.accept);
                            }
                            Err(e) => {
                                self.failed = true;
                                return Some(Err(e));
                            }
                        }
                    }
                }
                id if id < MIN_DATA_SET_ID => {
                    log::warn!(
                        "skipping reserved v9 set id {} at offset {}",
                        id,
                        entry.offset
                    );
                    self.buf.stats.sets_skipped += 1;
                }
                id => {
                    let key = (self.buf.odid, id);
                    if self.buf.accepted.contains(&key) {
                        let Some(tmpl) = self.buf.templates.get(&key).cloned() else {
                            self.buf.stats.missing_templates += 1;
                            continue;
                        };
                        let plan = match &self.projection {
                            Some(ielist) => match self.buf.plan_for(&tmpl, ielist) {
                                Ok(plan) => Some(plan),
                                Err(e) => {
                                    self.failed = true;
                                    return Some(Err(e));
                                }
                            },
                            None => None,
                        };
                        self.cursor = cursor;
                        self.setend = setend;
                        self.active = Some((tmpl, plan));
                    } else if self.buf.templates.contains_key(&key) {
                        self.buf.stats.sets_skipped += 1;
                    } else {
                        self.buf.stats.missing_templates += 1;
                        log::warn!(
                            "skipping v9 data set {}: no template from source {}",
                            id,
                            self.buf.odid
                        );
                    }
                }
            }
        }
    }
}

/// Yields v9 records as maps from IE name to value.
pub struct PduNamedictIterator<'a> {
    inner: PduRecordIterator<'a>,
}

impl Iterator for PduNamedictIterator<'_> {
    type Item = Result<BTreeMap<String, FieldValue>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rec = self.inner.next()?;
        Some(rec.map(|rec| {
            rec.template
                .ies()
                .iter()
                .map(|ie| ie.name.clone())
                .zip(rec.values)
                .collect()
        }))
    }
}

/// Yields v9 records as tuples in projection order.
pub struct PduTupleIterator<'a> {
    inner: PduRecordIterator<'a>,
}

impl Iterator for PduTupleIterator<'_> {
    type Item = Result<Vec<FieldValue>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rec = self.inner.next()?;
        Some(rec.map(|rec| rec.values))
    }
}

/// Streaming v9 reader.
///
/// v9 PDUs carry no length field, so on a stream the only way to find a
/// PDU boundary is the convention that a set id equal to the version
/// number 9 is actually the first half of the next PDU header. The reader
/// keeps one pending set header of lookahead and hands complete PDUs to
/// its internal [`PduBuffer`].
pub struct PduReader<R: Read> {
    stream: R,
    pending: Option<[u8; SET_HDR_LEN]>,
    buf: PduBuffer,
}

impl<R: Read> PduReader<R> {
    pub fn new(stream: R) -> Self {
        Self::with_model(stream, default_model())
    }

    pub fn with_model(stream: R, model: InfoModel) -> Self {
        PduReader {
            stream,
            pending: None,
            buf: PduBuffer::with_model(model),
        }
    }

    /// The buffer holding the most recently read PDU; iterate its records
    /// after each successful [`read_pdu`](PduReader::read_pdu).
    pub fn buffer(&mut self) -> &mut PduBuffer {
        &mut self.buf
    }

    /// Reads the next PDU from the stream into the buffer. Returns
    /// `Ok(false)` on a clean end of stream.
    pub fn read_pdu(&mut self) -> Result<bool, DecodeError> {
        let first = match self.pending.take() {
            Some(first) => first,
            None => {
                let mut first = [0u8; SET_HDR_LEN];
                let got = read_full(&mut self.stream, &mut first)?;
                if got == 0 {
                    return Ok(false);
                }
                if got < SET_HDR_LEN {
                    return Err(DecodeError::ShortRead {
                        expected: SET_HDR_LEN,
                        got,
                    });
                }
                first
            }
        };

        let lead = u16::from_be_bytes([first[0], first[1]]);
        if lead != V9_VERSION {
            return Err(DecodeError::BadVersion(lead));
        }

        // the 4 bytes already read are the front of the PDU header
        let mut hdr = [0u8; PDU_HDR_LEN];
        hdr[..SET_HDR_LEN].copy_from_slice(&first);
        let got = read_full(&mut self.stream, &mut hdr[SET_HDR_LEN..])?;
        if got < PDU_HDR_LEN - SET_HDR_LEN {
            return Err(DecodeError::ShortRead {
                expected: PDU_HDR_LEN - SET_HDR_LEN,
                got,
            });
        }
        let (_, header) = PduHeader::parse(&hdr[..]).map_err(|_| DecodeError::ShortRead {
            expected: PDU_HDR_LEN,
            got: PDU_HDR_LEN,
        })?;
        self.buf.begin_pdu(header)?;
        self.buf.mbuf[..PDU_HDR_LEN].copy_from_slice(&hdr);

        // collect sets until end of stream or the next PDU header
        loop {
            let mut sethdr = [0u8; SET_HDR_LEN];
            let got = read_full(&mut self.stream, &mut sethdr)?;
            if got == 0 {
                break;
            }
            if got < SET_HDR_LEN {
                return Err(DecodeError::ShortRead {
                    expected: SET_HDR_LEN,
                    got,
                });
            }
            let setid = u16::from_be_bytes([sethdr[0], sethdr[1]]);
            if setid == V9_VERSION {
                self.pending = Some(sethdr);
                break;
            }
            let setlen = usize::from(u16::from_be_bytes([sethdr[2], sethdr[3]]));
            if setlen < SET_HDR_LEN {
                return Err(DecodeError::BadSetLength {
                    offset: self.buf.length,
                    setlen,
                });
            }
            let offset = self.buf.length;
            if offset + setlen > BUF_LEN {
                return Err(DecodeError::SetTooLong {
                    offset,
                    setlen,
                    msglen: BUF_LEN,
                });
            }
            self.buf.mbuf[offset..offset + SET_HDR_LEN].copy_from_slice(&sethdr);
            let body = &mut self.buf.mbuf[offset + SET_HDR_LEN..offset + setlen];
            let got = read_full(&mut self.stream, body)?;
            if got < setlen - SET_HDR_LEN {
                return Err(DecodeError::ShortRead {
                    expected: setlen - SET_HDR_LEN,
                    got,
                });
            }
            self.buf.setlist.push(SetEntry {
                offset,
                setid,
                setlen,
            });
            self.buf.length = offset + setlen;
        }
        Ok(true)
    }
}

#[cfg(test)]
mod v9_tests {
    use super::*;
    use crate::ie::InfoModel;

    fn iana_model() -> InfoModel {
        let model = InfoModel::new();
        model.use_iana_default().unwrap();
        model
    }

    /// One PDU: template 256 over sourceIPv4Address[4], packetDeltaCount[4],
    /// then a data set with two records.
    fn sample_pdu(count: u16, sequence: u32) -> Vec<u8> {
        let mut pdu = Vec::new();
        pdu.extend_from_slice(&V9_VERSION.to_be_bytes());
        pdu.extend_from_slice(&count.to_be_bytes());
        pdu.extend_from_slice(&3_600_000u32.to_be_bytes()); // uptime 1h
        pdu.extend_from_slice(&1_371_823_203u32.to_be_bytes());
        pdu.extend_from_slice(&sequence.to_be_bytes());
        pdu.extend_from_slice(&17u32.to_be_bytes()); // source id

        // template set
        pdu.extend_from_slice(&V9_TEMPLATE_SET_ID.to_be_bytes());
        pdu.extend_from_slice(&16u16.to_be_bytes());
        pdu.extend_from_slice(&256u16.to_be_bytes());
        pdu.extend_from_slice(&2u16.to_be_bytes());
        pdu.extend_from_slice(&8u16.to_be_bytes()); // sourceIPv4Address
        pdu.extend_from_slice(&4u16.to_be_bytes());
        pdu.extend_from_slice(&2u16.to_be_bytes()); // packetDeltaCount
        pdu.extend_from_slice(&4u16.to_be_bytes());

        // data set, two 8-byte records
        pdu.extend_from_slice(&256u16.to_be_bytes());
        pdu.extend_from_slice(&20u16.to_be_bytes());
        pdu.extend_from_slice(&[10, 0, 0, 1]);
        pdu.extend_from_slice(&100u32.to_be_bytes());
        pdu.extend_from_slice(&[10, 0, 0, 2]);
        pdu.extend_from_slice(&200u32.to_be_bytes());
        pdu
    }

    #[test]
    fn it_decodes_a_v9_pdu() {
        let model = iana_model();
        let mut buf = PduBuffer::with_model(model);
        buf.from_bytes(&sample_pdu(3, 0)).unwrap();
        assert_eq!(buf.source_id(), 17);
        assert_eq!(buf.record_count(), 3);

        let records: Result<Vec<_>, _> = buf.namedict_iterator().collect();
        let records = records.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["packetDeltaCount"], FieldValue::Unsigned(100));
        assert_eq!(
            records[1]["sourceIPv4Address"],
            FieldValue::Ip4Addr("10.0.0.2".parse().unwrap())
        );
        // sequence advances by the declared record count
        assert_eq!(buf.next_sequence(17, 0), 3);
    }

    #[test]
    fn it_derives_basetime_from_uptime() {
        let model = iana_model();
        let mut buf = PduBuffer::with_model(model);
        buf.from_bytes(&sample_pdu(0, 0)).unwrap();
        let base = buf.basetime().unwrap();
        assert_eq!(
            base,
            UNIX_EPOCH + Duration::from_secs(1_371_823_203) - Duration::from_millis(3_600_000)
        );
    }

    #[test]
    fn it_rejects_wrong_versions() {
        let model = iana_model();
        let mut buf = PduBuffer::with_model(model);
        let mut pdu = sample_pdu(0, 0);
        pdu[1] = 5;
        assert_eq!(buf.from_bytes(&pdu), Err(DecodeError::BadVersion(5)));
    }

    #[test]
    fn it_streams_across_pdu_boundaries() {
        let model = iana_model();
        let mut stream = Vec::new();
        stream.extend_from_slice(&sample_pdu(3, 0));
        stream.extend_from_slice(&sample_pdu(2, 3));

        let mut reader = PduReader::with_model(stream.as_slice(), model);
        let mut total = 0;
        while reader.read_pdu().unwrap() {
            let records: Result<Vec<_>, _> = reader.buffer().namedict_iterator().collect();
            total += records.unwrap().len();
        }
        assert_eq!(total, 4);
        assert_eq!(reader.buffer().next_sequence(17, 0), 5);
    }

    #[test]
    fn it_projects_v9_tuples() {
        let model = iana_model();
        let mut buf = PduBuffer::with_model(model.clone());
        buf.from_bytes(&sample_pdu(3, 0)).unwrap();
        let proj = model.spec_list(["packetDeltaCount"]).unwrap();
        let tuples: Result<Vec<_>, _> = buf.tuple_iterator(&proj).collect();
        assert_eq!(
            tuples.unwrap(),
            vec![
                vec![FieldValue::Unsigned(100)],
                vec![FieldValue::Unsigned(200)]
            ]
        );
    }
}
