//! The IPFIX message buffer: framing, template propagation, record
//! iteration, and MTU-bounded export.
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011#section-3>
//!
//! A [`MessageBuffer`] owns a 64 KiB region and moves between two modes.
//! *Reading*: [`from_bytes`](MessageBuffer::from_bytes) or
//! [`read_message`](MessageBuffer::read_message) deframe one complete
//! message and build the set index, after which the record iterators walk
//! sets in wire order, learning templates as they appear. *Writing*:
//! [`begin_export`](MessageBuffer::begin_export) opens a message, sets are
//! managed through [`export_ensure_set`](MessageBuffer::export_ensure_set),
//! and records are appended until an export would overflow the MTU, which
//! raises the non-fatal [`EncodeError::EndOfMessage`] signal.
//!
//! Templates are stored per `(observation domain, template id)` and
//! survive both mode switches and reuse of the buffer; they are removed
//! only by explicit withdrawal. Sequence counters are kept per
//! `(observation domain, stream)` and advance by one for every record
//! yielded or exported.

use crate::ie::{InfoModel, InformationElement, InformationElementList, default_model};
use crate::template::{
    self, DecodeError, EncodeError, MIN_DATA_SET_ID, OPTIONS_TEMPLATE_SET_ID, PackingPlan,
    TEMPLATE_SET_ID, Template,
};
use crate::types;
use crate::value::FieldValue;

use lru::LruCache;
use nom_derive::{Nom, Parse};
use serde::Serialize;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// IPFIX protocol version, fixed at 10.
pub const IPFIX_VERSION: u16 = 10;
/// Message header size in octets.
pub const MSG_HDR_LEN: usize = 16;
/// Set header size in octets.
pub const SET_HDR_LEN: usize = 4;
/// Default (and maximum) MTU: the message length field is 16 bits.
pub const DEFAULT_MTU: usize = 65535;

const BUF_LEN: usize = 65536;
const PLAN_CACHE_SIZE: usize = 32;

/// IPFIX message header.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Nom)]
pub struct MessageHeader {
    /// Version of the flow record format exported in this message;
    /// 0x000a for IPFIX.
    pub version: u16,
    /// Total length of the message in octets, message header and sets
    /// included.
    pub length: u16,
    /// Incremental sequence counter modulo 2^32 of all data records sent
    /// on this stream from the current observation domain. Template
    /// records do not increase the sequence number.
    pub sequence_number: u32,
    /// Seconds since the UNIX epoch at which the message leaves the
    /// exporter.
    pub export_time: u32,
    /// Identifier of the observation domain, locally unique to the
    /// exporting process.
    pub observation_domain_id: u32,
}

/// One entry of the parsed set index: where a set starts, its id, and its
/// declared length (header included).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SetEntry {
    pub offset: usize,
    pub setid: u16,
    pub setlen: usize,
}

/// Counters over the life of a buffer, mirroring what was read, skipped,
/// and exported.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferStats {
    /// Messages successfully deframed.
    pub messages: u64,
    /// Template records learned from the wire.
    pub templates_read: u64,
    /// Records yielded by iterators.
    pub records_read: u64,
    /// Records accounted for in sets whose template was rejected.
    pub records_skipped: u64,
    /// Reserved-id sets skipped with a warning.
    pub sets_skipped: u64,
    /// Data sets dropped because no template was known.
    pub missing_templates: u64,
}

/// A record decoded by [`RecordIterator`]: the template it was decoded
/// with and its values (template order, or projection order when the
/// iterator carries a projection).
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub template: Arc<Template>,
    pub values: Vec<FieldValue>,
}

impl Serialize for DecodedRecord {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("DecodedRecord", 2)?;
        s.serialize_field("template", self.template.as_ref())?;
        s.serialize_field("values", &self.values)?;
        s.end()
    }
}

/// The message buffer. See the [module docs](self) for the lifecycle.
pub struct MessageBuffer {
    mbuf: Vec<u8>,
    length: usize,
    sequence: u32,
    export_epoch: Option<u32>,
    odid: u32,
    stream: u32,
    mtu: usize,
    model: InfoModel,
    templates: HashMap<(u32, u16), Arc<Template>>,
    sequences: HashMap<(u32, u32), u32>,
    accepted: HashSet<(u32, u16)>,
    pending_export: HashSet<u16>,
    setlist: Vec<SetEntry>,
    cursetid: u16,
    cursetoff: usize,
    exporting: bool,
    plan_cache: LruCache<(u32, u16, Vec<(u32, u16)>), Arc<PackingPlan>>,
    last_tuple_key: Option<Vec<(u32, u16)>>,
    stats: BufferStats,
}

impl Default for MessageBuffer {
    fn default() -> Self {
        Self::with_model(default_model())
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("odid", &self.odid)
            .field("length", &self.length)
            .field("mtu", &self.mtu)
            .field("templates", &self.templates.len())
            .field("exporting", &self.exporting)
            .finish()
    }
}

impl MessageBuffer {
    /// Creates a buffer using the process-wide default information model.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer resolving IEs through an explicit model.
    pub fn with_model(model: InfoModel) -> Self {
        MessageBuffer {
            mbuf: vec![0; BUF_LEN],
            length: 0,
            sequence: 0,
            export_epoch: None,
            odid: 0,
            stream: 0,
            mtu: DEFAULT_MTU,
            model,
            templates: HashMap::new(),
            sequences: HashMap::new(),
            accepted: HashSet::new(),
            pending_export: HashSet::new(),
            setlist: Vec::new(),
            cursetid: 0,
            cursetoff: 0,
            exporting: false,
            plan_cache: LruCache::new(
                NonZeroUsize::new(PLAN_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
            last_tuple_key: None,
            stats: BufferStats::default(),
        }
    }

    pub fn model(&self) -> &InfoModel {
        &self.model
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// Sets the export MTU. Legal values span one message header up to
    /// the wire format's 16-bit limit.
    pub fn set_mtu(&mut self, mtu: usize) -> Result<(), EncodeError> {
        if mtu < MSG_HDR_LEN || mtu > DEFAULT_MTU {
            return Err(EncodeError::BadMtu { mtu });
        }
        self.mtu = mtu;
        Ok(())
    }

    /// Observation domain of the current message.
    pub fn odid(&self) -> u32 {
        self.odid
    }

    /// Sequence number carried by the current message header.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn stream(&self) -> u32 {
        self.stream
    }

    pub fn set_stream(&mut self, stream: u32) {
        self.stream = stream;
    }

    /// Current logical message length in octets.
    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn stats(&self) -> BufferStats {
        self.stats
    }

    /// The set index of the last deframed message.
    pub fn setlist(&self) -> &[SetEntry] {
        &self.setlist
    }

    /// Next sequence value for a `(domain, stream)` pair.
    pub fn next_sequence(&self, odid: u32, stream: u32) -> u32 {
        self.sequences.get(&(odid, stream)).copied().unwrap_or(0)
    }

    /// Export time of the current message, if set or read.
    pub fn get_export_time(&self) -> Option<SystemTime> {
        self.export_epoch
            .map(|e| UNIX_EPOCH + Duration::from_secs(u64::from(e)))
    }

    /// Sets the export time stamped into the header on flush. Without an
    /// explicit time, wall clock at flush time is used.
    pub fn set_export_time(&mut self, t: SystemTime) -> Result<(), EncodeError> {
        let secs = t
            .duration_since(UNIX_EPOCH)
            .ok()
            .and_then(|d| u32::try_from(d.as_secs()).ok())
            .ok_or(EncodeError::Type(
                crate::types::IpfixTypeError::ValueOutOfRange {
                    name: "dateTimeSeconds",
                    length: 4,
                },
            ))?;
        self.export_epoch = Some(secs);
        Ok(())
    }

    /// Looks up a template stored under the current observation domain.
    pub fn template(&self, tid: u16) -> Option<Arc<Template>> {
        self.templates.get(&(self.odid, tid)).cloned()
    }

    /// Ids of all templates stored under the current observation domain.
    pub fn active_template_ids(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self
            .templates
            .keys()
            .filter(|(odid, _)| *odid == self.odid)
            .map(|(_, tid)| *tid)
            .collect();
        ids.sort_unstable();
        ids
    }

    // ------------------------------------------------------------------
    // reading

    /// Loads one complete message from a byte slice, parsing the header
    /// and building the set index. Bytes past the declared message length
    /// are ignored.
    pub fn from_bytes(&mut self, bytes: &[u8]) -> Result<(), DecodeError> {
        let header = parse_header(bytes)?;
        let msglen = usize::from(header.length);
        if bytes.len() < msglen {
            return Err(DecodeError::ShortRead {
                expected: msglen,
                got: bytes.len(),
            });
        }
        self.mbuf[..msglen].copy_from_slice(&bytes[..msglen]);
        self.apply_header(header);
        self.scan_setlist()
    }

    /// Reads one complete message from a stream. A stream that ends
    /// cleanly before a header yields [`DecodeError::EndOfStream`]; a
    /// stream that ends inside a message is a short read.
    pub fn read_message(&mut self, stream: &mut impl Read) -> Result<(), DecodeError> {
        let mut hdr = [0u8; MSG_HDR_LEN];
        let got = read_full(stream, &mut hdr)?;
        if got == 0 {
            return Err(DecodeError::EndOfStream);
        }
        if got < MSG_HDR_LEN {
            return Err(DecodeError::ShortRead {
                expected: MSG_HDR_LEN,
                got,
            });
        }
        let header = parse_header(&hdr)?;
        let msglen = usize::from(header.length);
        self.mbuf[..MSG_HDR_LEN].copy_from_slice(&hdr);
        let got = read_full(stream, &mut self.mbuf[MSG_HDR_LEN..msglen])?;
        if got < msglen - MSG_HDR_LEN {
            return Err(DecodeError::ShortRead {
                expected: msglen - MSG_HDR_LEN,
                got,
            });
        }
        self.apply_header(header);
        self.scan_setlist()
    }

    fn apply_header(&mut self, header: MessageHeader) {
        self.length = usize::from(header.length);
        self.sequence = header.sequence_number;
        self.export_epoch = Some(header.export_time);
        self.odid = header.observation_domain_id;
    }

    /// Scans the message body into the set index. Entering the deframed
    /// state discards any in-progress export.
    fn scan_setlist(&mut self) -> Result<(), DecodeError> {
        self.setlist.clear();
        self.exporting = false;
        self.cursetid = 0;
        let mut offset = MSG_HDR_LEN;
        while offset < self.length {
            if self.length - offset < SET_HDR_LEN {
                return Err(DecodeError::BadSetLength {
                    offset,
                    setlen: self.length - offset,
                });
            }
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
        self.stats.messages += 1;
        Ok(())
    }

    /// Low-level record iteration: walks sets in wire order, learning
    /// templates from sets 2 and 3 and yielding ordered records from data
    /// sets whose template passed `accept`.
    pub fn record_iterator<'a, F>(&'a mut self, accept: F) -> RecordIterator<'a>
    where
        F: FnMut(&Template) -> bool + 'a,
    {
        RecordIterator {
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
    pub fn namedict_iterator(&mut self) -> NamedictIterator<'_> {
        NamedictIterator {
            inner: self.record_iterator(accept_all),
        }
    }

    /// Iterates over every record as a map from IE identity to value.
    pub fn iedict_iterator(&mut self) -> IedictIterator<'_> {
        IedictIterator {
            inner: self.record_iterator(accept_all),
        }
    }

    /// Iterates over records whose template contains every IE in
    /// `ielist`, yielding tuples in `ielist` order. The accepted-template
    /// set is reused while consecutive calls pass the same projection and
    /// recomputed when it changes.
    pub fn tuple_iterator<'a>(
        &'a mut self,
        ielist: &InformationElementList,
    ) -> TupleIterator<'a> {
        let key = ielist.key();
        if self.last_tuple_key.as_ref() != Some(&key) {
            self.recache_accepted(ielist);
            self.last_tuple_key = Some(key);
        }
        let wanted = ielist.clone();
        TupleIterator {
            inner: RecordIterator {
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
            if tid < MIN_DATA_SET_ID {
                log::warn!("ignoring all-template withdrawal for set id {}", tid);
            } else if self.templates.remove(&key).is_some() {
                self.accepted.remove(&key);
                self.pending_export.remove(&tid);
                self.plan_cache.clear();
                log::debug!("withdrew template {} in domain {}", tid, self.odid);
            }
            return;
        }
        self.stats.templates_read += 1;
        if accept(&tmpl) {
            log::debug!(
                "accepted template {} in domain {}: {} IEs, minlen {}",
                tid,
                self.odid,
                tmpl.count(),
                tmpl.min_length()
            );
            self.accepted.insert(key);
        } else {
            log::debug!("rejected template {} in domain {}", tid, self.odid);
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

    fn increment_sequence(&mut self, inc: u32) {
        let counter = self.sequences.entry((self.odid, self.stream)).or_insert(0);
        *counter = counter.wrapping_add(inc);
    }

    // ------------------------------------------------------------------
    // writing

    /// Begins a new message for the given observation domain: resets the
    /// write cursor past the header, clears set state, and seeds the
    /// header sequence number from the per-`(domain, stream)` counter.
    /// The template store is preserved.
    pub fn begin_export(&mut self, odid: u32) -> Result<(), EncodeError> {
        if self.mtu < MSG_HDR_LEN {
            return Err(EncodeError::MtuTooSmall { mtu: self.mtu });
        }
        self.odid = odid;
        self.length = MSG_HDR_LEN;
        self.mbuf[..MSG_HDR_LEN].fill(0);
        self.cursetid = 0;
        self.cursetoff = 0;
        self.setlist.clear();
        self.exporting = true;
        self.sequence = *self.sequences.entry((odid, self.stream)).or_insert(0);
        Ok(())
    }

    /// True when an export holds sets or records that have not been
    /// flushed yet.
    pub fn export_needs_flush(&self) -> bool {
        self.exporting && self.length > MSG_HDR_LEN
    }

    /// Set id of the currently open export set, 0 if none.
    pub fn current_set_id(&self) -> u16 {
        self.cursetid
    }

    /// Stores a template under `(current domain, template id)`. With
    /// `export`, the template record is written to the message
    /// immediately; without, it is exported implicitly when a data set
    /// for it is first ensured.
    pub fn add_template(&mut self, tmpl: Template, export: bool) -> Result<(), EncodeError> {
        let tid = tmpl.tid();
        if tid < MIN_DATA_SET_ID {
            return Err(EncodeError::BadTemplateId(tid));
        }
        if self.templates.insert((self.odid, tid), Arc::new(tmpl)).is_some() {
            self.plan_cache.clear();
        }
        if export {
            self.export_template(tid)?;
        } else {
            self.pending_export.insert(tid);
        }
        Ok(())
    }

    /// Removes a template from the store. During an export a withdrawal
    /// record (field count 0) is emitted so collectors drop it too.
    pub fn delete_template(&mut self, tid: u16) -> Result<(), EncodeError> {
        let key = (self.odid, tid);
        let native = match self.templates.get(&key) {
            Some(tmpl) => tmpl.native_set_id(),
            None => return Err(EncodeError::UnknownTemplate { tid }),
        };
        self.templates.remove(&key);
        self.accepted.remove(&key);
        self.pending_export.remove(&tid);
        self.plan_cache.clear();
        if self.exporting {
            self.export_ensure_set(native)?;
            if self.length + 4 > self.mtu {
                return Err(EncodeError::EndOfMessage);
            }
            types::write_u16(&mut self.mbuf, self.length, tid)?;
            types::write_u16(&mut self.mbuf, self.length + 2, 0)?;
            self.length += 4;
        }
        Ok(())
    }

    /// Writes the template record for `tid` into the message, ensuring
    /// its native set (2 or 3) first. Overflow raises
    /// [`EncodeError::EndOfMessage`].
    pub fn export_template(&mut self, tid: u16) -> Result<(), EncodeError> {
        if !self.exporting {
            return Err(EncodeError::NotExporting);
        }
        let tmpl = self
            .templates
            .get(&(self.odid, tid))
            .cloned()
            .ok_or(EncodeError::UnknownTemplate { tid })?;
        self.export_ensure_set(tmpl.native_set_id())?;
        if self.length + tmpl.enc_length() > self.mtu {
            return Err(EncodeError::EndOfMessage);
        }
        let next = tmpl.encode_template_to(&mut self.mbuf, self.length, tmpl.native_set_id())?;
        self.length = next;
        self.pending_export.remove(&tid);
        Ok(())
    }

    /// Makes `setid` the current set, closing the previous set if any.
    /// Data set ids require a stored template (templates still pending
    /// export are written first); the new set header plus one minimum
    /// record must fit within the MTU or `EndOfMessage` is raised and no
    /// set is opened.
    pub fn export_ensure_set(&mut self, setid: u16) -> Result<(), EncodeError> {
        if !self.exporting {
            return Err(EncodeError::NotExporting);
        }
        if self.cursetid == setid {
            return Ok(());
        }
        if setid >= MIN_DATA_SET_ID && self.pending_export.contains(&setid) {
            self.export_template(setid)?;
        }
        self.close_set();
        let minlen = match setid {
            TEMPLATE_SET_ID | OPTIONS_TEMPLATE_SET_ID => 0,
            id if id >= MIN_DATA_SET_ID => self
                .templates
                .get(&(self.odid, id))
                .ok_or(EncodeError::UnknownTemplate { tid: id })?
                .min_length(),
            other => return Err(EncodeError::BadSetId(other)),
        };
        if self.length + SET_HDR_LEN + minlen > self.mtu {
            return Err(EncodeError::EndOfMessage);
        }
        types::write_u16(&mut self.mbuf, self.length, setid)?;
        types::write_u16(&mut self.mbuf, self.length + 2, 0)?;
        self.cursetoff = self.length;
        self.cursetid = setid;
        self.length += SET_HDR_LEN;
        Ok(())
    }

    fn close_set(&mut self) {
        if self.cursetid != 0 {
            let setlen = (self.length - self.cursetoff) as u16;
            self.mbuf[self.cursetoff + 2..self.cursetoff + 4]
                .copy_from_slice(&setlen.to_be_bytes());
            self.cursetid = 0;
        }
    }

    /// Appends one record of ordered values to the current data set. On
    /// overflow the message length is restored and
    /// [`EncodeError::EndOfMessage`] raised, leaving no partial record.
    pub fn export_record(&mut self, vals: &[FieldValue]) -> Result<(), EncodeError> {
        self.export_encoded(|tmpl, buf, offset| tmpl.encode_to(vals, buf, offset))
    }

    /// Appends one record given as a map keyed by IE name.
    pub fn export_namedict(
        &mut self,
        rec: &BTreeMap<String, FieldValue>,
    ) -> Result<(), EncodeError> {
        self.export_encoded(|tmpl, buf, offset| tmpl.encode_namedict_to(rec, buf, offset))
    }

    /// Appends one record given as a map keyed by IE identity.
    pub fn export_iedict(
        &mut self,
        rec: &BTreeMap<Arc<InformationElement>, FieldValue>,
    ) -> Result<(), EncodeError> {
        self.export_encoded(|tmpl, buf, offset| tmpl.encode_iedict_to(rec, buf, offset))
    }

    /// Appends one record given as a tuple over `ielist`; template IEs
    /// outside the projection are zero-filled.
    pub fn export_tuple(
        &mut self,
        vals: &[FieldValue],
        ielist: &InformationElementList,
    ) -> Result<(), EncodeError> {
        if !self.exporting {
            return Err(EncodeError::NotExporting);
        }
        if self.cursetid < MIN_DATA_SET_ID {
            return Err(EncodeError::NoDataSet);
        }
        let tmpl = self
            .templates
            .get(&(self.odid, self.cursetid))
            .cloned()
            .ok_or(EncodeError::UnknownTemplate {
                tid: self.cursetid,
            })?;
        let plan = self
            .plan_for(&tmpl, ielist)
            .map_err(|_| EncodeError::BadProjection)?;
        self.export_encoded(|tmpl, buf, offset| {
            tmpl.encode_tuple_to(vals, &plan, buf, offset)
        })
    }

    fn export_encoded<F>(&mut self, encode: F) -> Result<(), EncodeError>
    where
        F: FnOnce(&Template, &mut [u8], usize) -> Result<usize, EncodeError>,
    {
        if !self.exporting {
            return Err(EncodeError::NotExporting);
        }
        if self.cursetid < MIN_DATA_SET_ID {
            return Err(EncodeError::NoDataSet);
        }
        let tmpl = self
            .templates
            .get(&(self.odid, self.cursetid))
            .cloned()
            .ok_or(EncodeError::UnknownTemplate {
                tid: self.cursetid,
            })?;
        let savelen = self.length;
        // the encode slice is capped at the MTU, so overflow surfaces as
        // a buffer-full failure and the snapshot is restored
        match encode(&tmpl, &mut self.mbuf[..self.mtu], savelen) {
            Ok(next) => {
                self.length = next;
                self.increment_sequence(1);
                Ok(())
            }
            Err(EncodeError::BufferFull) => {
                self.length = savelen;
                Err(EncodeError::EndOfMessage)
            }
            Err(e) => {
                self.length = savelen;
                Err(e)
            }
        }
    }

    /// Closes the current set, stamps the message header (stamping wall
    /// clock export time if none was set), and returns the message bytes.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, EncodeError> {
        self.close_set();
        let epoch = match self.export_epoch {
            Some(epoch) => epoch,
            None => {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0);
                self.export_epoch = Some(now);
                now
            }
        };
        types::write_u16(&mut self.mbuf, 0, IPFIX_VERSION)?;
        types::write_u16(&mut self.mbuf, 2, self.length as u16)?;
        types::write_u32(&mut self.mbuf, 4, self.sequence)?;
        types::write_u32(&mut self.mbuf, 8, epoch)?;
        types::write_u32(&mut self.mbuf, 12, self.odid)?;
        Ok(self.mbuf[..self.length].to_vec())
    }

    /// Flushes the message to a stream; see [`MessageBuffer::to_bytes`].
    pub fn write_message(&mut self, stream: &mut impl Write) -> Result<(), EncodeError> {
        let bytes = self.to_bytes()?;
        stream.write_all(&bytes)?;
        Ok(())
    }
}

fn accept_all(_tmpl: &Template) -> bool {
    true
}

fn parse_header(bytes: &[u8]) -> Result<MessageHeader, DecodeError> {
    let (_, header) = MessageHeader::parse(bytes).map_err(|_| DecodeError::ShortRead {
        expected: MSG_HDR_LEN,
        got: bytes.len(),
    })?;
    if header.version != IPFIX_VERSION {
        return Err(DecodeError::BadVersion(header.version));
    }
    if usize::from(header.length) < MSG_HDR_LEN + SET_HDR_LEN {
        return Err(DecodeError::BadMessageLength(header.length));
    }
    Ok(header)
}

pub(crate) fn read_full(stream: &mut impl Read, buf: &mut [u8]) -> Result<usize, DecodeError> {
    let mut n = 0;
    while n < buf.len() {
        match stream.read(&mut buf[n..]) {
            Ok(0) => break,
            Ok(m) => n += m,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(n)
}

/// Iterator over the records of the deframed message, yielding
/// [`DecodedRecord`]s. Borrows the buffer mutably: templates are learned
/// and sequence counters advance as iteration proceeds.
pub struct RecordIterator<'a> {
    buf: &'a mut MessageBuffer,
    accept: Box<dyn FnMut(&Template) -> bool + 'a>,
    projection: Option<InformationElementList>,
    set_idx: usize,
    cursor: usize,
    setend: usize,
    active: Option<(Arc<Template>, Option<Arc<PackingPlan>>)>,
    failed: bool,
}

impl Iterator for RecordIterator<'_> {
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
                            self.buf.increment_sequence(1);
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
                TEMPLATE_SET_ID | OPTIONS_TEMPLATE_SET_ID => {
                    while setend - cursor >= 4 {
                        match template::decode_template_from(
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
                    log::warn!("skipping reserved set id {} at offset {}", id, entry.offset);
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
                    } else if let Some(tmpl) = self.buf.templates.get(&key).cloned() {
                        // template known but rejected: records still count
                        // toward the expected sequence
                        let mut c = cursor;
                        while tmpl.min_length() > 0 && c + tmpl.min_length() <= setend {
                            match tmpl.skip_record(&self.buf.mbuf[..setend], c) {
                                Ok(next) => {
                                    c = next;
                                    self.buf.increment_sequence(1);
                                    self.buf.stats.records_skipped += 1;
                                }
                                Err(_) => break,
                            }
                        }
                    } else {
                        self.buf.stats.missing_templates += 1;
                        log::warn!(
                            "skipping data set {}: no template in domain {}",
                            id,
                            self.buf.odid
                        );
                    }
                }
            }
        }
    }
}

/// Yields records as maps from IE name to value.
pub struct NamedictIterator<'a> {
    inner: RecordIterator<'a>,
}

impl Iterator for NamedictIterator<'_> {
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

/// Yields records as maps from IE identity to value.
pub struct IedictIterator<'a> {
    inner: RecordIterator<'a>,
}

impl Iterator for IedictIterator<'_> {
    type Item = Result<BTreeMap<Arc<InformationElement>, FieldValue>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rec = self.inner.next()?;
        Some(rec.map(|rec| rec.template.ies().iter().cloned().zip(rec.values).collect()))
    }
}

/// Yields records as tuples of values in projection order.
pub struct TupleIterator<'a> {
    inner: RecordIterator<'a>,
}

impl Iterator for TupleIterator<'_> {
    type Item = Result<Vec<FieldValue>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let rec = self.inner.next()?;
        Some(rec.map(|rec| rec.values))
    }
}

#[cfg(test)]
mod message_tests {
    use super::*;
    use crate::ie::InfoModel;

    fn iana_model() -> InfoModel {
        let model = InfoModel::new();
        model.use_iana_default().unwrap();
        model
    }

    fn flow_template(model: &InfoModel, tid: u16) -> Template {
        let ies = model
            .spec_list(["sourceIPv4Address", "packetDeltaCount"])
            .unwrap();
        Template::from_ies(tid, ies).unwrap()
    }

    #[test]
    fn it_requires_a_template_before_a_data_set() {
        let model = iana_model();
        let mut msg = MessageBuffer::with_model(model);
        msg.begin_export(1).unwrap();
        assert_eq!(
            msg.export_ensure_set(256),
            Err(EncodeError::UnknownTemplate { tid: 256 })
        );
        assert_eq!(msg.export_ensure_set(17), Err(EncodeError::BadSetId(17)));
    }

    #[test]
    fn it_rejects_exports_without_begin() {
        let model = iana_model();
        let mut msg = MessageBuffer::with_model(model.clone());
        assert_eq!(
            msg.export_template(256),
            Err(EncodeError::NotExporting)
        );
        msg.begin_export(1).unwrap();
        assert_eq!(
            msg.export_record(&[FieldValue::Unsigned(1)]),
            Err(EncodeError::NoDataSet)
        );
    }

    #[test]
    fn it_exports_pending_templates_on_ensure() {
        let model = iana_model();
        let mut msg = MessageBuffer::with_model(model.clone());
        msg.begin_export(1).unwrap();
        msg.add_template(flow_template(&model, 256), false).unwrap();
        // nothing written yet
        assert_eq!(msg.len(), MSG_HDR_LEN);
        msg.export_ensure_set(256).unwrap();
        // template set (4 + 12) then the data set header
        assert_eq!(msg.len(), MSG_HDR_LEN + 4 + 12 + 4);
        assert_eq!(msg.current_set_id(), 256);
    }

    #[test]
    fn it_restores_length_on_end_of_message() {
        let model = iana_model();
        let mut msg = MessageBuffer::with_model(model.clone());
        msg.set_mtu(48).unwrap();
        msg.begin_export(1).unwrap();
        msg.add_template(flow_template(&model, 256), true).unwrap();
        msg.export_ensure_set(256).unwrap();

        let rec = [
            FieldValue::Ip4Addr("10.0.0.1".parse().unwrap()),
            FieldValue::Unsigned(1),
        ];
        // 16 header + 16 template set + 4 set header + one 12-byte record
        // fills the MTU exactly
        msg.export_record(&rec).unwrap();
        assert_eq!(msg.len(), 48);
        let before = msg.len();
        assert_eq!(msg.export_record(&rec), Err(EncodeError::EndOfMessage));
        assert_eq!(msg.len(), before);
    }

    #[test]
    fn it_emits_withdrawals_on_delete() {
        let model = iana_model();
        let mut msg = MessageBuffer::with_model(model.clone());
        msg.begin_export(1).unwrap();
        msg.add_template(flow_template(&model, 256), true).unwrap();
        msg.delete_template(256).unwrap();
        let bytes = msg.to_bytes().unwrap();

        let mut rx = MessageBuffer::with_model(model);
        rx.from_bytes(&bytes).unwrap();
        let records: Vec<_> = rx.namedict_iterator().collect();
        assert!(records.is_empty());
        // the withdrawal removed the freshly learned template
        assert!(rx.template(256).is_none());
    }

    #[test]
    fn it_reports_decode_errors_for_malformed_headers() {
        let model = iana_model();
        let mut msg = MessageBuffer::with_model(model);
        assert!(matches!(
            msg.from_bytes(&[0u8; 8]),
            Err(DecodeError::ShortRead { .. })
        ));

        let mut bytes = vec![0u8; 24];
        bytes[1] = 1; // version 1
        bytes[3] = 24;
        assert_eq!(msg.from_bytes(&bytes), Err(DecodeError::BadVersion(1)));
    }
}
