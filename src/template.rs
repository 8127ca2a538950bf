//! Templates, packing plans, and the record codec.
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011#section-3.4>
//!
//! A template is an ordered list of Information Elements with an ID in
//! `[256, 65535]`. Templates drive both directions of the record codec:
//! the fixed-length prefix of a record is moved through a compiled
//! [`PackingPlan`], and the variable-length tail is walked element by
//! element. Records can be handled as ordered values, name-keyed maps,
//! IE-keyed maps, or projected tuples over a subset of elements.

use crate::ie::{InfoModel, InformationElement, InformationElementList};
use crate::types::{self, IpfixType, IpfixTypeError, VARLEN};
use crate::value::FieldValue;

use serde::ser::SerializeSeq;
use serde::{Serialize, Serializer};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Set id carrying data template records.
pub const TEMPLATE_SET_ID: u16 = 2;
/// Set id carrying options template records.
pub const OPTIONS_TEMPLATE_SET_ID: u16 = 3;
/// Lowest set id usable for data sets; template ids live in the same space.
pub const MIN_DATA_SET_ID: u16 = 256;

/// Malformed wire data. Fatal for the current message; the buffer must be
/// re-fed before reuse.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum DecodeError {
    /// Clean end of stream before a message header.
    EndOfStream,
    /// The stream ended inside a message.
    ShortRead { expected: usize, got: usize },
    /// Message version field was not the expected protocol version.
    BadVersion(u16),
    /// Message length field below the legal minimum.
    BadMessageLength(u16),
    /// A set's declared length runs past the end of the message.
    SetTooLong {
        offset: usize,
        setlen: usize,
        msglen: usize,
    },
    /// A set header declares a length smaller than the header itself.
    BadSetLength { offset: usize, setlen: usize },
    /// Template records may only appear in the template set ids.
    BadTemplateSet(u16),
    /// A template record declared a reserved template id.
    BadTemplateId(u16),
    /// An options template declared more scope fields than fields.
    BadScopeCount { tid: u16, scopecount: u16, count: u16 },
    /// A tuple projection names an IE the template does not contain.
    BadProjection,
    /// Record decode was attempted against a template that was never
    /// finalized.
    NotFinalized,
    /// A value failed to decode.
    Type(IpfixTypeError),
    /// The underlying stream failed.
    Io(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::EndOfStream => write!(f, "end of stream"),
            DecodeError::ShortRead { expected, got } => {
                write!(f, "short read ({} bytes, expected {})", got, expected)
            }
            DecodeError::BadVersion(v) => {
                write!(f, "illegal or unsupported version {}", v)
            }
            DecodeError::BadMessageLength(l) => write!(f, "illegal message length {}", l),
            DecodeError::SetTooLong {
                offset,
                setlen,
                msglen,
            } => write!(
                f,
                "set at offset {} too long for message ({} > {} remaining)",
                offset, setlen, msglen
            ),
            DecodeError::BadSetLength { offset, setlen } => {
                write!(f, "illegal set length {} at offset {}", setlen, offset)
            }
            DecodeError::BadTemplateSet(id) => write!(f, "bad template set id {}", id),
            DecodeError::BadTemplateId(tid) => write!(f, "illegal template id {}", tid),
            DecodeError::BadScopeCount {
                tid,
                scopecount,
                count,
            } => write!(
                f,
                "options template {} declares {} scope fields of {}",
                tid, scopecount, count
            ),
            DecodeError::BadProjection => {
                write!(f, "projection contains an IE not present in the template")
            }
            DecodeError::NotFinalized => write!(f, "template was not finalized"),
            DecodeError::Type(e) => write!(f, "{}", e),
            DecodeError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<IpfixTypeError> for DecodeError {
    fn from(e: IpfixTypeError) -> Self {
        DecodeError::Type(e)
    }
}

impl From<std::io::Error> for DecodeError {
    fn from(e: std::io::Error) -> Self {
        DecodeError::Io(e.to_string())
    }
}

/// Structural violations on the export path, plus the non-fatal
/// [`EndOfMessage`](EncodeError::EndOfMessage) overflow signal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum EncodeError {
    /// The export would overflow the MTU. Not an error in the usual
    /// sense: flush the message, begin a new export, ensure the same set,
    /// and retry.
    EndOfMessage,
    /// The MTU cannot hold even a message header.
    MtuTooSmall { mtu: usize },
    /// MTU above the wire format's 16-bit message length.
    BadMtu { mtu: usize },
    /// Template ids below 256 are reserved.
    BadTemplateId(u16),
    /// Template records can only be written to set ids 2 and 3.
    BadSetId(u16),
    /// An options template needs at least one scope field.
    EmptyScope,
    /// No template is stored under this id in the current domain.
    UnknownTemplate { tid: u16 },
    /// Export operation before `begin_export`.
    NotExporting,
    /// Record export without an open data set.
    NoDataSet,
    /// A tuple export projects an IE the current template does not
    /// contain.
    BadProjection,
    /// A keyed record is missing a value for a template IE.
    MissingValue { name: String },
    /// The record's value count does not match the template.
    WrongValueCount { expected: usize, got: usize },
    /// Internal buffer exhausted; surfaces as `EndOfMessage` from the
    /// message buffer's export helpers.
    BufferFull,
    /// A value failed to encode.
    Type(IpfixTypeError),
    /// The underlying stream failed.
    Io(String),
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EncodeError::EndOfMessage => write!(f, "end of message"),
            EncodeError::MtuTooSmall { mtu } => {
                write!(f, "MTU {} too small for a message header", mtu)
            }
            EncodeError::BadMtu { mtu } => write!(f, "illegal MTU {}", mtu),
            EncodeError::BadTemplateId(tid) => write!(f, "illegal template id {}", tid),
            EncodeError::BadSetId(id) => write!(f, "bad set id {}", id),
            EncodeError::EmptyScope => {
                write!(f, "options template requires at least one scope field")
            }
            EncodeError::UnknownTemplate { tid } => {
                write!(f, "no template {} in current domain", tid)
            }
            EncodeError::NotExporting => write!(f, "no export in progress"),
            EncodeError::NoDataSet => write!(f, "no data set open"),
            EncodeError::BadProjection => {
                write!(f, "projection contains an IE not present in the template")
            }
            EncodeError::MissingValue { name } => {
                write!(f, "record is missing a value for {}", name)
            }
            EncodeError::WrongValueCount { expected, got } => {
                write!(f, "record has {} values, template has {}", got, expected)
            }
            EncodeError::BufferFull => write!(f, "message buffer full"),
            EncodeError::Type(e) => write!(f, "{}", e),
            EncodeError::Io(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for EncodeError {}

impl From<IpfixTypeError> for EncodeError {
    fn from(e: IpfixTypeError) -> Self {
        match e {
            IpfixTypeError::BufferTooSmall { .. } => EncodeError::BufferFull,
            other => EncodeError::Type(other),
        }
    }
}

impl From<std::io::Error> for EncodeError {
    fn from(e: std::io::Error) -> Self {
        EncodeError::Io(e.to_string())
    }
}

/// A compiled strategy for the fixed-length prefix of a template under a
/// given projection: a run of decode/skip steps plus the mapping from
/// template order to projection order. Plans are compiled once per
/// `(template, projection)` and cached by the message buffer.
#[derive(Debug, Clone)]
pub struct PackingPlan {
    steps: Vec<PlanStep>,
    fixed_size: usize,
    /// Selected template indices, ascending.
    indices: Vec<usize>,
    /// `slots[k]` is the output position of the k-th selected index.
    slots: Vec<usize>,
    /// Number of values a record carries under this plan.
    width: usize,
}

#[derive(Debug, Clone)]
enum PlanStep {
    Field { ietype: IpfixType, length: u16 },
    Skip(usize),
}

impl PackingPlan {
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn fixed_size(&self) -> usize {
        self.fixed_size
    }

    fn selects(&self, k: usize, index: usize) -> bool {
        self.indices.get(k) == Some(&index)
    }
}

/// An ordered list of IPFIX Information Elements with an ID.
///
/// Derived properties are maintained on [`append`](Template::append):
/// `minlength` (minimum encoded record size, one byte per varlen IE),
/// `enclength` (wire size of the template record itself), and
/// `varlenslice` (index of the first varlen IE).
/// [`finalize`](Template::finalize) compiles the default packing plan and
/// must be called after the last append; the `from_ies` constructors do
/// so automatically.
#[derive(Debug, Clone, Serialize)]
pub struct Template {
    tid: u16,
    ies: InformationElementList,
    scopecount: usize,
    minlength: usize,
    fields_enclength: usize,
    varlenslice: Option<usize>,
    #[serde(skip)]
    packplan: Option<PackingPlan>,
}

impl Serialize for InformationElementList {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.len()))?;
        for ie in self {
            seq.serialize_element(ie.as_ref())?;
        }
        seq.end()
    }
}

impl Template {
    /// Creates an empty data template. Ids below 256 are reserved.
    pub fn new(tid: u16) -> Result<Template, EncodeError> {
        if tid < MIN_DATA_SET_ID {
            return Err(EncodeError::BadTemplateId(tid));
        }
        Ok(Template::new_unchecked(tid))
    }

    fn new_unchecked(tid: u16) -> Template {
        Template {
            tid,
            ies: InformationElementList::new(),
            scopecount: 0,
            minlength: 0,
            fields_enclength: 0,
            varlenslice: None,
            packplan: None,
        }
    }

    /// Builds and finalizes a data template from an ordered IE list.
    pub fn from_ies(tid: u16, ies: InformationElementList) -> Result<Template, EncodeError> {
        let mut tmpl = Template::new(tid)?;
        for ie in &ies {
            tmpl.append(ie.clone());
        }
        tmpl.finalize();
        Ok(tmpl)
    }

    /// Builds and finalizes an options template; scope IEs come first in
    /// record order.
    pub fn options_from_ies(
        tid: u16,
        scope_ies: InformationElementList,
        option_ies: InformationElementList,
    ) -> Result<Template, EncodeError> {
        if scope_ies.is_empty() {
            return Err(EncodeError::EmptyScope);
        }
        let mut tmpl = Template::new(tid)?;
        tmpl.scopecount = scope_ies.len();
        for ie in scope_ies.iter().chain(option_ies.iter()) {
            tmpl.append(ie.clone());
        }
        tmpl.finalize();
        Ok(tmpl)
    }

    /// Appends an IE, updating the derived length properties. Invalidates
    /// the packing plan until the next [`finalize`](Template::finalize).
    pub fn append(&mut self, ie: Arc<InformationElement>) {
        if ie.is_varlen() {
            self.minlength += 1;
            if self.varlenslice.is_none() {
                self.varlenslice = Some(self.ies.len());
            }
        } else {
            self.minlength += usize::from(ie.length);
        }
        self.fields_enclength += 4;
        if ie.pen != 0 {
            self.fields_enclength += 4;
        }
        self.ies.push(ie);
        self.packplan = None;
    }

    /// Compiles the default packing plan over the full fixed prefix.
    pub fn finalize(&mut self) {
        let selected: Vec<(usize, usize)> = (0..self.count()).map(|i| (i, i)).collect();
        self.packplan = Some(self.compile_plan(&selected));
    }

    pub fn tid(&self) -> u16 {
        self.tid
    }

    pub fn ies(&self) -> &InformationElementList {
        &self.ies
    }

    pub fn count(&self) -> usize {
        self.ies.len()
    }

    pub fn scope_count(&self) -> usize {
        self.scopecount
    }

    pub(crate) fn set_scope_count(&mut self, scopecount: usize) {
        self.scopecount = scopecount;
    }

    /// Minimum encoded record size: fixed lengths plus one byte per
    /// varlen IE.
    pub fn min_length(&self) -> usize {
        self.minlength
    }

    /// Wire length of the template record itself, header included.
    pub fn enc_length(&self) -> usize {
        let header = if self.scopecount > 0 { 6 } else { 4 };
        header + self.fields_enclength
    }

    /// Index of the first varlen IE, if any; everything before it forms
    /// the packable fixed prefix.
    pub fn varlen_slice(&self) -> Option<usize> {
        self.varlenslice
    }

    /// Number of leading IEs covered by the packing plan.
    pub fn fixlen_count(&self) -> usize {
        self.varlenslice.unwrap_or_else(|| self.count())
    }

    /// A template record with no fields withdraws its template id.
    pub fn is_withdrawal(&self) -> bool {
        self.ies.is_empty()
    }

    /// The set id this template's records are written to: 2 for data
    /// templates, 3 for options templates.
    pub fn native_set_id(&self) -> u16 {
        if self.scopecount > 0 {
            OPTIONS_TEMPLATE_SET_ID
        } else {
            TEMPLATE_SET_ID
        }
    }

    fn compile_plan(&self, selected: &[(usize, usize)]) -> PackingPlan {
        let mut selected = selected.to_vec();
        selected.sort_by_key(|&(index, _)| index);

        let mut steps = Vec::new();
        let mut fixed_size = 0usize;
        let mut k = 0;
        for i in 0..self.fixlen_count() {
            let length = self.ies[i].length;
            fixed_size += usize::from(length);
            if selected.get(k).map(|&(index, _)| index) == Some(i) {
                steps.push(PlanStep::Field {
                    ietype: self.ies[i].ietype,
                    length,
                });
                k += 1;
            } else if let Some(PlanStep::Skip(n)) = steps.last_mut() {
                *n += usize::from(length);
            } else {
                steps.push(PlanStep::Skip(usize::from(length)));
            }
        }

        PackingPlan {
            steps,
            fixed_size,
            indices: selected.iter().map(|&(index, _)| index).collect(),
            slots: selected.iter().map(|&(_, slot)| slot).collect(),
            width: selected.len(),
        }
    }

    /// Compiles a plan that reads only the IEs in `ielist`, returning
    /// values in `ielist` order. Fails if any projected IE is absent from
    /// the template.
    pub fn tuple_plan(&self, ielist: &InformationElementList) -> Result<PackingPlan, DecodeError> {
        let mut selected = Vec::with_capacity(ielist.len());
        for (slot, ie) in ielist.iter().enumerate() {
            let index = self
                .ies
                .index_of(ie)
                .ok_or(DecodeError::BadProjection)?;
            selected.push((index, slot));
        }
        Ok(self.compile_plan(&selected))
    }

    fn default_plan(&self) -> Result<&PackingPlan, DecodeError> {
        self.packplan.as_ref().ok_or(DecodeError::NotFinalized)
    }

    /// Decodes one record at `offset` into values in template order.
    /// Returns the values and the offset of the next record.
    pub fn decode_from(
        &self,
        buf: &[u8],
        offset: usize,
    ) -> Result<(Vec<FieldValue>, usize), DecodeError> {
        let plan = self.default_plan()?;
        self.decode_with_plan(plan, buf, offset)
    }

    /// Decodes one record using a compiled plan; values come back in the
    /// plan's projection order.
    pub fn decode_with_plan(
        &self,
        plan: &PackingPlan,
        buf: &[u8],
        offset: usize,
    ) -> Result<(Vec<FieldValue>, usize), DecodeError> {
        let mut collected: Vec<(usize, FieldValue)> = Vec::with_capacity(plan.width);
        let mut cursor = offset;
        let mut k = 0;

        for step in &plan.steps {
            match step {
                PlanStep::Field { ietype, length } => {
                    let val = ietype.decode_one(buf, cursor, *length)?;
                    collected.push((plan.slots[k], val));
                    k += 1;
                    cursor += usize::from(*length);
                }
                PlanStep::Skip(n) => cursor += n,
            }
        }

        if let Some(vs) = self.varlenslice {
            for i in vs..self.count() {
                let ie = &self.ies[i];
                let length = if ie.is_varlen() {
                    let (length, next) = types::decode_varlen(buf, cursor)?;
                    cursor = next;
                    length
                } else {
                    usize::from(ie.length)
                };
                if plan.selects(k, i) {
                    let val = ie.ietype.decode_one(buf, cursor, length as u16)?;
                    collected.push((plan.slots[k], val));
                    k += 1;
                }
                cursor += length;
            }
        }

        collected.sort_by_key(|&(slot, _)| slot);
        Ok((collected.into_iter().map(|(_, v)| v).collect(), cursor))
    }

    /// Decodes one record into a map keyed by IE name.
    pub fn decode_namedict_from(
        &self,
        buf: &[u8],
        offset: usize,
    ) -> Result<(BTreeMap<String, FieldValue>, usize), DecodeError> {
        let (vals, offset) = self.decode_from(buf, offset)?;
        let rec = self
            .ies
            .iter()
            .map(|ie| ie.name.clone())
            .zip(vals)
            .collect();
        Ok((rec, offset))
    }

    /// Decodes one record into a map keyed by IE identity.
    pub fn decode_iedict_from(
        &self,
        buf: &[u8],
        offset: usize,
    ) -> Result<(BTreeMap<Arc<InformationElement>, FieldValue>, usize), DecodeError> {
        let (vals, offset) = self.decode_from(buf, offset)?;
        let rec = self.ies.iter().cloned().zip(vals).collect();
        Ok((rec, offset))
    }

    /// Advances over one record without decoding values; used to account
    /// for records in sets the caller is not interested in.
    pub fn skip_record(&self, buf: &[u8], offset: usize) -> Result<usize, DecodeError> {
        let mut cursor = offset;
        match self.varlenslice {
            None => Ok(cursor + self.minlength),
            Some(vs) => {
                for i in 0..vs {
                    cursor += usize::from(self.ies[i].length);
                }
                for i in vs..self.count() {
                    let ie = &self.ies[i];
                    let length = if ie.is_varlen() {
                        let (length, next) = types::decode_varlen(buf, cursor)?;
                        cursor = next;
                        length
                    } else {
                        usize::from(ie.length)
                    };
                    cursor += length;
                }
                Ok(cursor)
            }
        }
    }

    /// Encodes one record of values in template order at `offset`,
    /// returning the offset of the first free byte.
    pub fn encode_to(
        &self,
        vals: &[FieldValue],
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize, EncodeError> {
        let refs: Vec<&FieldValue> = vals.iter().collect();
        self.encode_refs(&refs, buf, offset)
    }

    fn encode_refs(
        &self,
        vals: &[&FieldValue],
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize, EncodeError> {
        if vals.len() != self.count() {
            return Err(EncodeError::WrongValueCount {
                expected: self.count(),
                got: vals.len(),
            });
        }
        let mut cursor = offset;
        let fix = self.fixlen_count();
        for i in 0..fix {
            let ie = &self.ies[i];
            cursor = ie.ietype.encode_one(vals[i], buf, cursor, ie.length)?;
        }
        for i in fix..self.count() {
            let ie = &self.ies[i];
            if ie.is_varlen() {
                let wire = ie.ietype.wire_length_of(vals[i])?;
                cursor = types::encode_varlen(buf, cursor, wire)?;
                cursor = ie.ietype.encode_one(vals[i], buf, cursor, VARLEN)?;
            } else {
                cursor = ie.ietype.encode_one(vals[i], buf, cursor, ie.length)?;
            }
        }
        Ok(cursor)
    }

    /// Encodes one record from a map keyed by IE name.
    pub fn encode_namedict_to(
        &self,
        rec: &BTreeMap<String, FieldValue>,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize, EncodeError> {
        let mut refs = Vec::with_capacity(self.count());
        for ie in &self.ies {
            let val = rec.get(&ie.name).ok_or_else(|| EncodeError::MissingValue {
                name: ie.name.clone(),
            })?;
            refs.push(val);
        }
        self.encode_refs(&refs, buf, offset)
    }

    /// Encodes one record from a map keyed by IE identity.
    pub fn encode_iedict_to(
        &self,
        rec: &BTreeMap<Arc<InformationElement>, FieldValue>,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize, EncodeError> {
        let mut refs = Vec::with_capacity(self.count());
        for ie in &self.ies {
            let val = rec.get(ie).ok_or_else(|| EncodeError::MissingValue {
                name: ie.name.clone(),
            })?;
            refs.push(val);
        }
        self.encode_refs(&refs, buf, offset)
    }

    /// Encodes a projected tuple of values (in plan order). Template IEs
    /// outside the projection are zero-filled, or written as zero-length
    /// values when varlen.
    pub fn encode_tuple_to(
        &self,
        vals: &[FieldValue],
        plan: &PackingPlan,
        buf: &mut [u8],
        offset: usize,
    ) -> Result<usize, EncodeError> {
        if vals.len() != plan.width {
            return Err(EncodeError::WrongValueCount {
                expected: plan.width,
                got: vals.len(),
            });
        }
        let mut cursor = offset;
        let mut k = 0;
        for step in &plan.steps {
            match step {
                PlanStep::Field { ietype, length } => {
                    cursor = ietype.encode_one(&vals[plan.slots[k]], buf, cursor, *length)?;
                    k += 1;
                }
                PlanStep::Skip(n) => cursor = zero_fill(buf, cursor, *n)?,
            }
        }
        if let Some(vs) = self.varlenslice {
            for i in vs..self.count() {
                let ie = &self.ies[i];
                if plan.selects(k, i) {
                    let val = &vals[plan.slots[k]];
                    if ie.is_varlen() {
                        let wire = ie.ietype.wire_length_of(val)?;
                        cursor = types::encode_varlen(buf, cursor, wire)?;
                        cursor = ie.ietype.encode_one(val, buf, cursor, VARLEN)?;
                    } else {
                        cursor = ie.ietype.encode_one(val, buf, cursor, ie.length)?;
                    }
                    k += 1;
                } else if ie.is_varlen() {
                    cursor = types::encode_varlen(buf, cursor, 0)?;
                } else {
                    cursor = zero_fill(buf, cursor, usize::from(ie.length))?;
                }
            }
        }
        Ok(cursor)
    }

    /// Writes this template as a template record into a set of the given
    /// id (2 for data templates, 3 for options templates). Enterprise IEs
    /// are written with the high bit of the element id set, followed by
    /// the enterprise number.
    pub fn encode_template_to(
        &self,
        buf: &mut [u8],
        offset: usize,
        setid: u16,
    ) -> Result<usize, EncodeError> {
        let mut cursor = offset;
        match setid {
            TEMPLATE_SET_ID => {
                cursor = types::write_u16(buf, cursor, self.tid)?;
                cursor = types::write_u16(buf, cursor, self.count() as u16)?;
            }
            OPTIONS_TEMPLATE_SET_ID => {
                cursor = types::write_u16(buf, cursor, self.tid)?;
                cursor = types::write_u16(buf, cursor, self.count() as u16)?;
                cursor = types::write_u16(buf, cursor, self.scopecount as u16)?;
            }
            other => return Err(EncodeError::BadSetId(other)),
        }
        for ie in &self.ies {
            if ie.pen != 0 {
                cursor = types::write_u16(buf, cursor, ie.num | 0x8000)?;
                cursor = types::write_u16(buf, cursor, ie.length)?;
                cursor = types::write_u32(buf, cursor, ie.pen)?;
            } else {
                cursor = types::write_u16(buf, cursor, ie.num)?;
                cursor = types::write_u16(buf, cursor, ie.length)?;
            }
        }
        Ok(cursor)
    }
}

fn zero_fill(buf: &mut [u8], cursor: usize, n: usize) -> Result<usize, EncodeError> {
    let region = buf
        .get_mut(cursor..cursor + n)
        .ok_or(EncodeError::BufferFull)?;
    region.fill(0);
    Ok(cursor + n)
}

/// Decodes one template record at `offset` from a set with the given id,
/// resolving (and auto-registering) IEs through `model`. A field count of
/// 0 yields a withdrawal marker.
pub fn decode_template_from(
    model: &InfoModel,
    setid: u16,
    buf: &[u8],
    offset: usize,
) -> Result<(Template, usize), DecodeError> {
    let mut cursor = offset;
    let (tid, count, scopecount) = match setid {
        TEMPLATE_SET_ID => {
            let tid = types::read_u16(buf, cursor)?;
            let count = types::read_u16(buf, cursor + 2)?;
            cursor += 4;
            (tid, count, 0)
        }
        OPTIONS_TEMPLATE_SET_ID => {
            let tid = types::read_u16(buf, cursor)?;
            let count = types::read_u16(buf, cursor + 2)?;
            let scopecount = types::read_u16(buf, cursor + 4)?;
            cursor += 6;
            (tid, count, scopecount)
        }
        other => return Err(DecodeError::BadTemplateSet(other)),
    };

    if count > 0 && tid < MIN_DATA_SET_ID {
        return Err(DecodeError::BadTemplateId(tid));
    }
    if scopecount > count {
        return Err(DecodeError::BadScopeCount {
            tid,
            scopecount,
            count,
        });
    }

    let mut tmpl = Template::new_unchecked(tid);
    tmpl.scopecount = usize::from(scopecount);
    for _ in 0..count {
        let mut num = types::read_u16(buf, cursor)?;
        let length = types::read_u16(buf, cursor + 2)?;
        cursor += 4;
        let pen = if num & 0x8000 != 0 {
            num &= 0x7fff;
            let pen = types::read_u32(buf, cursor)?;
            cursor += 4;
            pen
        } else {
            0
        };
        tmpl.append(model.for_template_entry(pen, num, length)?);
    }
    tmpl.finalize();
    Ok((tmpl, cursor))
}

#[cfg(test)]
mod template_tests {
    use super::*;
    use crate::ie::InfoModel;

    fn iana_model() -> InfoModel {
        let model = InfoModel::new();
        model.use_iana_default().unwrap();
        model
    }

    fn flow_template(model: &InfoModel) -> Template {
        let ies = model
            .spec_list(["sourceIPv4Address", "packetDeltaCount"])
            .unwrap();
        Template::from_ies(256, ies).unwrap()
    }

    #[test]
    fn it_tracks_derived_lengths_on_append() {
        let model = iana_model();
        let ies = model
            .spec_list([
                "flowStartMilliseconds",
                "interfaceName",
                "packetDeltaCount",
            ])
            .unwrap();
        let tmpl = Template::from_ies(258, ies).unwrap();

        // 8 fixed + 1 varlen byte + 8 fixed
        assert_eq!(tmpl.min_length(), 17);
        assert_eq!(tmpl.varlen_slice(), Some(1));
        assert_eq!(tmpl.fixlen_count(), 1);
        // 4-byte header plus three 4-byte field specs
        assert_eq!(tmpl.enc_length(), 16);
        assert_eq!(tmpl.native_set_id(), TEMPLATE_SET_ID);
    }

    #[test]
    fn it_rejects_reserved_template_ids() {
        assert!(matches!(
            Template::new(255),
            Err(EncodeError::BadTemplateId(255))
        ));
        assert!(Template::new(256).is_ok());
    }

    #[test]
    fn it_roundtrips_records_in_all_three_shapes() {
        let model = iana_model();
        let tmpl = flow_template(&model);
        let vals = vec![
            FieldValue::Ip4Addr("10.1.2.3".parse().unwrap()),
            FieldValue::Unsigned(27),
        ];
        let mut buf = [0u8; 64];

        let end = tmpl.encode_to(&vals, &mut buf, 0).unwrap();
        assert_eq!(end, 12);
        let (back, next) = tmpl.decode_from(&buf, 0).unwrap();
        assert_eq!(next, 12);
        assert_eq!(back, vals);

        let (named, _) = tmpl.decode_namedict_from(&buf, 0).unwrap();
        assert_eq!(named["sourceIPv4Address"], vals[0]);
        let end = tmpl.encode_namedict_to(&named, &mut buf, 12).unwrap();
        assert_eq!(end, 24);
        assert_eq!(buf[..12], buf[12..24]);

        let (keyed, _) = tmpl.decode_iedict_from(&buf, 0).unwrap();
        let end = tmpl.encode_iedict_to(&keyed, &mut buf, 24).unwrap();
        assert_eq!(end, 36);
        assert_eq!(buf[..12], buf[24..36]);
    }

    #[test]
    fn it_roundtrips_varlen_records() {
        let model = iana_model();
        let ies = model
            .spec_list(["interfaceName", "packetDeltaCount"])
            .unwrap();
        let tmpl = Template::from_ies(257, ies).unwrap();
        let vals = vec![
            FieldValue::String("Grüezi, Y'all".to_string()),
            FieldValue::Unsigned(9000),
        ];
        let mut buf = [0u8; 64];
        let end = tmpl.encode_to(&vals, &mut buf, 0).unwrap();
        // 1 length byte + 14 UTF-8 bytes + 8
        assert_eq!(end, 23);
        assert_eq!(buf[0], 14);
        let (back, next) = tmpl.decode_from(&buf, 0).unwrap();
        assert_eq!(next, end);
        assert_eq!(back, vals);
    }

    #[test]
    fn it_projects_tuples_in_projection_order() {
        let model = iana_model();
        let tmpl = flow_template(&model);
        let vals = vec![
            FieldValue::Ip4Addr("192.0.2.1".parse().unwrap()),
            FieldValue::Unsigned(512),
        ];
        let mut buf = [0u8; 64];
        tmpl.encode_to(&vals, &mut buf, 0).unwrap();

        // reversed projection: counts first, address second
        let proj = model
            .spec_list(["packetDeltaCount", "sourceIPv4Address"])
            .unwrap();
        let plan = tmpl.tuple_plan(&proj).unwrap();
        let (tuple, _) = tmpl.decode_with_plan(&plan, &buf, 0).unwrap();
        assert_eq!(tuple, vec![vals[1].clone(), vals[0].clone()]);

        // single-IE projection skips the address at the packing level
        let proj = model.spec_list(["packetDeltaCount"]).unwrap();
        let plan = tmpl.tuple_plan(&proj).unwrap();
        assert_eq!(plan.width(), 1);
        let (tuple, next) = tmpl.decode_with_plan(&plan, &buf, 0).unwrap();
        assert_eq!(next, 12);
        assert_eq!(tuple, vec![FieldValue::Unsigned(512)]);
    }

    #[test]
    fn it_rejects_projections_outside_the_template() {
        let model = iana_model();
        let tmpl = flow_template(&model);
        let proj = model.spec_list(["octetDeltaCount"]).unwrap();
        assert!(matches!(
            tmpl.tuple_plan(&proj),
            Err(DecodeError::BadProjection)
        ));
    }

    #[test]
    fn it_roundtrips_template_records_with_enterprise_ies() {
        let model = iana_model();
        model
            .for_spec("vendorBytes(9999/7)<unsigned32>[4]")
            .unwrap();
        let ies = model
            .spec_list(["sourceIPv4Address", "vendorBytes"])
            .unwrap();
        let tmpl = Template::from_ies(300, ies).unwrap();
        assert_eq!(tmpl.enc_length(), 4 + 4 + 8);

        let mut buf = [0u8; 64];
        let end = tmpl
            .encode_template_to(&mut buf, 0, TEMPLATE_SET_ID)
            .unwrap();
        assert_eq!(end, tmpl.enc_length());
        // enterprise bit set on the second field spec
        assert_eq!(&buf[8..10], &[0x80, 0x07]);
        assert_eq!(&buf[12..16], &9999u32.to_be_bytes());

        let (back, next) = decode_template_from(&model, TEMPLATE_SET_ID, &buf, 0).unwrap();
        assert_eq!(next, end);
        assert_eq!(back.tid(), 300);
        assert_eq!(back.count(), 2);
        assert_eq!(back.ies()[1].pen, 9999);
        assert_eq!(back.ies()[1].num, 7);
    }

    #[test]
    fn it_decodes_withdrawals() {
        let model = iana_model();
        let mut buf = [0u8; 8];
        types::write_u16(&mut buf, 0, 300).unwrap();
        types::write_u16(&mut buf, 2, 0).unwrap();
        let (tmpl, next) = decode_template_from(&model, TEMPLATE_SET_ID, &buf, 0).unwrap();
        assert_eq!(next, 4);
        assert!(tmpl.is_withdrawal());
        assert_eq!(tmpl.tid(), 300);
    }

    #[test]
    fn it_reduces_lengths_inside_records() {
        let model = iana_model();
        let ies = model.spec_list(["octetDeltaCount[4]"]).unwrap();
        let tmpl = Template::from_ies(257, ies).unwrap();
        assert_eq!(tmpl.min_length(), 4);

        let mut buf = [0u8; 16];
        let end = tmpl
            .encode_to(&[FieldValue::Unsigned(42)], &mut buf, 0)
            .unwrap();
        assert_eq!(end, 4);
        let (back, _) = tmpl.decode_from(&buf, 0).unwrap();
        assert_eq!(back, vec![FieldValue::Unsigned(42)]);

        // four-byte field cannot carry a value needing eight
        assert!(
            tmpl.encode_to(&[FieldValue::Unsigned(1 << 32)], &mut buf, 0)
                .is_err()
        );
    }
}
