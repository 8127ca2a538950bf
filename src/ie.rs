//! Information Elements and the catalog that resolves them.
//!
//! References:
//! - <https://datatracker.ietf.org/doc/html/rfc7011#section-3.2>
//! - <https://www.iana.org/assignments/ipfix/ipfix.xhtml>
//! - <https://datatracker.ietf.org/doc/html/rfc5103>
//!
//! An Information Element (IE) is a typed field identified by its private
//! enterprise number and element number; `(pen, num)` alone defines
//! identity and ordering. IEs are resolved through an [`InfoModel`]
//! catalog, populated from textual *iespec* lines of the form
//!
//! ```text
//! name(pen/num)<type>[length]
//! ```
//!
//! where each part is optional but at least one must be present. The
//! bundled IANA registry and RFC 5103 reverse-direction files can be
//! loaded with [`InfoModel::use_iana_default`] and
//! [`InfoModel::use_5103_default`].

use crate::types::{IpfixType, IpfixTypeError, VARLEN};

use nom::IResult;
use nom::bytes::complete::{is_not, take_while1};
use nom::character::complete::{char, digit1};
use nom::combinator::{map_res, opt};
use nom::sequence::{delimited, pair, terminated};
use serde::{Serialize, Serializer};

use std::cmp::Ordering;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};

/// Errors raised while parsing iespec text or resolving IEs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    /// The spec contained none of name, numbers, type, or length.
    Unrecognized(String),
    /// The spec names an unregistered IE and carries no type to create it.
    NeedType(String),
    /// The named type does not exist or rejects the requested length.
    Type(IpfixTypeError),
    /// A spec file could not be read.
    Io(String),
    /// Error at a specific line of a spec file.
    AtLine { line: usize, inner: Box<SpecError> },
}

impl std::fmt::Display for SpecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecError::Unrecognized(spec) => write!(f, "unrecognized IE spec {:?}", spec),
            SpecError::NeedType(spec) => {
                write!(f, "cannot create new IE without a type: {:?}", spec)
            }
            SpecError::Type(e) => write!(f, "{}", e),
            SpecError::Io(e) => write!(f, "cannot read spec file: {}", e),
            SpecError::AtLine { line, inner } => write!(f, "line {}: {}", line, inner),
        }
    }
}

impl std::error::Error for SpecError {}

impl From<IpfixTypeError> for SpecError {
    fn from(e: IpfixTypeError) -> Self {
        SpecError::Type(e)
    }
}

/// An IPFIX Information Element: a name, a private enterprise number
/// (0 for IANA-registered IEs), an element number, a type, and a length.
///
/// Equality, ordering, and hashing consider `(pen, num)` only, so an IE
/// respecialized to a reduced length compares equal to its parent. The
/// `length` may be a fixed byte count or [`VARLEN`].
#[derive(Debug, Clone)]
pub struct InformationElement {
    pub name: String,
    pub pen: u32,
    pub num: u16,
    pub ietype: IpfixType,
    pub length: u16,
}

impl InformationElement {
    /// Creates an IE, deriving the synthetic `_ipfix_<pen>_<num>` name when
    /// none is given and the type's natural length when `length` is 0.
    /// Fails if the type cannot be encoded at the requested length.
    pub fn new(
        name: Option<&str>,
        pen: u32,
        num: u16,
        ietype: IpfixType,
        length: u16,
    ) -> Result<Self, IpfixTypeError> {
        let ietype = ietype.for_length(length)?;
        let length = if length == 0 {
            ietype.natural_length()
        } else {
            length
        };
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("_ipfix_{}_{}", pen, num),
        };
        Ok(InformationElement {
            name,
            pen,
            num,
            ietype,
            length,
        })
    }

    /// Returns this IE specialized to encode at `length` bytes. A length
    /// of 0 or the current length returns the IE unchanged; identity is
    /// preserved across specializations.
    pub fn for_length(
        self: Arc<Self>,
        length: u16,
    ) -> Result<Arc<InformationElement>, IpfixTypeError> {
        if length == 0 || length == self.length {
            Ok(self)
        } else {
            Ok(Arc::new(InformationElement::new(
                Some(&self.name),
                self.pen,
                self.num,
                self.ietype,
                length,
            )?))
        }
    }

    pub fn is_varlen(&self) -> bool {
        self.length == VARLEN
    }
}

impl PartialEq for InformationElement {
    fn eq(&self, other: &Self) -> bool {
        (self.pen, self.num) == (other.pen, other.num)
    }
}

impl Eq for InformationElement {}

impl PartialOrd for InformationElement {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for InformationElement {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.pen, self.num).cmp(&(other.pen, other.num))
    }
}

impl Hash for InformationElement {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.pen, self.num).hash(state);
    }
}

impl std::fmt::Display for InformationElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}/{}){}[{}]",
            self.name, self.pen, self.num, self.ietype, self.length
        )
    }
}

impl Serialize for InformationElement {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// An ordered list of IEs, as used for templates and tuple projections.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InformationElementList {
    inner: Vec<Arc<InformationElement>>,
}

impl InformationElementList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, ie: Arc<InformationElement>) {
        self.inner.push(ie);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<InformationElement>> {
        self.inner.iter()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<InformationElement>> {
        self.inner.get(index)
    }

    /// Position of an IE in the list, by `(pen, num)` identity.
    pub fn index_of(&self, ie: &InformationElement) -> Option<usize> {
        self.inner.iter().position(|x| x.as_ref() == ie)
    }

    pub fn contains(&self, ie: &InformationElement) -> bool {
        self.index_of(ie).is_some()
    }

    /// Identity key used by packing-plan caches.
    pub fn key(&self) -> Vec<(u32, u16)> {
        self.inner.iter().map(|ie| (ie.pen, ie.num)).collect()
    }
}

impl std::ops::Index<usize> for InformationElementList {
    type Output = Arc<InformationElement>;

    fn index(&self, index: usize) -> &Self::Output {
        &self.inner[index]
    }
}

impl FromIterator<Arc<InformationElement>> for InformationElementList {
    fn from_iter<T: IntoIterator<Item = Arc<InformationElement>>>(iter: T) -> Self {
        InformationElementList {
            inner: iter.into_iter().collect(),
        }
    }
}

impl<'a> IntoIterator for &'a InformationElementList {
    type Item = &'a Arc<InformationElement>;
    type IntoIter = std::slice::Iter<'a, Arc<InformationElement>>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}

impl std::fmt::Display for InformationElementList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, ie) in self.inner.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", ie)?;
        }
        Ok(())
    }
}

/// One parsed iespec line, before resolution against a catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RawSpec {
    name: Option<String>,
    pen: u32,
    num: u16,
    typename: Option<String>,
    length: u16,
}

fn number<T: FromStr>(i: &str) -> IResult<&str, T> {
    map_res(digit1, str::parse)(i)
}

fn name_part(i: &str) -> IResult<&str, &str> {
    take_while1(|c: char| !c.is_whitespace() && c != '[' && c != '<' && c != '(')(i)
}

fn pen_num_part(i: &str) -> IResult<&str, (Option<u32>, u16)> {
    delimited(
        char('('),
        pair(opt(terminated(number::<u32>, char('/'))), number::<u16>),
        char(')'),
    )(i)
}

fn type_part(i: &str) -> IResult<&str, &str> {
    delimited(char('<'), is_not(">"), char('>'))(i)
}

fn length_part(i: &str) -> IResult<&str, u16> {
    delimited(char('['), number::<u16>, char(']'))(i)
}

/// Parses an iespec into its name, pen, number, type name, and length
/// parts. Absent numeric parts parse as 0; trailing text is ignored.
fn parse_spec(spec: &str) -> Result<RawSpec, SpecError> {
    let i = spec.trim();
    let (i, name) = opt(name_part)(i).map_err(|_: nom::Err<nom::error::Error<&str>>| {
        SpecError::Unrecognized(spec.to_string())
    })?;
    let (i, pen_num) = opt(pen_num_part)(i)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| SpecError::Unrecognized(spec.to_string()))?;
    let (i, typename) = opt(type_part)(i)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| SpecError::Unrecognized(spec.to_string()))?;
    let (_, length) = opt(length_part)(i)
        .map_err(|_: nom::Err<nom::error::Error<&str>>| SpecError::Unrecognized(spec.to_string()))?;

    let (pen, num) = match pen_num {
        Some((pen, num)) => (pen.unwrap_or(0), num),
        None => (0, 0),
    };
    let raw = RawSpec {
        name: name.map(str::to_string),
        pen,
        num,
        typename: typename.map(str::to_string),
        length: length.unwrap_or(0),
    };
    if raw.name.is_none()
        && raw.pen == 0
        && raw.num == 0
        && raw.typename.is_none()
        && raw.length == 0
    {
        return Err(SpecError::Unrecognized(spec.to_string()));
    }
    Ok(raw)
}

/// Applies the RFC 5103 reverse-direction transform to an iespec: the name
/// gains a `reverse` prefix, IANA IEs move to enterprise 29305, and
/// enterprise IEs get bit 0x4000 set on their element number.
pub fn reverse_spec(spec: &str) -> Result<String, SpecError> {
    let raw = parse_spec(spec)?;
    let name = raw
        .name
        .ok_or_else(|| SpecError::Unrecognized(spec.to_string()))?;
    let typename = raw
        .typename
        .ok_or_else(|| SpecError::NeedType(spec.to_string()))?;
    let mut chars = name.chars();
    let revname = match chars.next() {
        Some(first) => format!("reverse{}{}", first.to_uppercase(), chars.as_str()),
        None => return Err(SpecError::Unrecognized(spec.to_string())),
    };
    let (pen, num) = if raw.pen != 0 {
        (raw.pen, raw.num | 0x4000)
    } else {
        (29305, raw.num)
    };
    Ok(format!(
        "{}({}/{})<{}>[{}]",
        revname, pen, num, typename, raw.length
    ))
}

#[derive(Default)]
struct Indexes {
    by_name: HashMap<String, Arc<InformationElement>>,
    by_num: HashMap<(u32, u16), Arc<InformationElement>>,
}

/// A catalog of Information Elements with two indices: by name and by
/// `(pen, num)`.
///
/// The model is a cheaply clonable handle; clones share the same indices.
/// Registration is idempotent on identity: registering an IE whose
/// `(pen, num)` already exists returns the existing entry unchanged.
/// Buffers take a model at construction; the module-level free functions
/// operate on the process-wide [`default_model`].
#[derive(Clone, Default)]
pub struct InfoModel {
    inner: Arc<Mutex<Indexes>>,
}

impl InfoModel {
    /// Creates an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Indexes> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn register(&self, ie: InformationElement) -> Arc<InformationElement> {
        let mut idx = self.lock();
        if let Some(existing) = idx.by_num.get(&(ie.pen, ie.num)) {
            return existing.clone();
        }
        let ie = Arc::new(ie);
        if let Some(shadowed) = idx.by_name.insert(ie.name.clone(), ie.clone()) {
            log::debug!("IE name {:?} re-bound from {} to {}", ie.name, shadowed, ie);
        }
        idx.by_num.insert((ie.pen, ie.num), ie.clone());
        ie
    }

    /// Resolves an iespec against the catalog.
    ///
    /// A bare registered name or a known `(pen, num)` returns the existing
    /// IE, specialized to the spec's length if one is given. Otherwise the
    /// spec must carry a type, and a new IE is registered from all of its
    /// parts.
    pub fn for_spec(&self, spec: &str) -> Result<Arc<InformationElement>, SpecError> {
        let raw = parse_spec(spec)?;

        if let Some(name) = &raw.name {
            if raw.pen == 0 && raw.num == 0 {
                if let Some(ie) = self.lock().by_name.get(name.as_str()).cloned() {
                    return Ok(ie.for_length(raw.length)?);
                }
            }
        }

        if raw.num != 0 {
            if let Some(ie) = self.lock().by_num.get(&(raw.pen, raw.num)).cloned() {
                return Ok(ie.for_length(raw.length)?);
            }
        }

        let typename = raw
            .typename
            .as_deref()
            .ok_or_else(|| SpecError::NeedType(spec.to_string()))?;
        let ietype = IpfixType::for_name(typename)?;
        let ie = InformationElement::new(raw.name.as_deref(), raw.pen, raw.num, ietype, raw.length)?;
        Ok(self.register(ie))
    }

    /// Resolves the IE for a decoded template field. Unknown `(pen, num)`
    /// pairs synthesize an octet array IE of the given length, so their
    /// raw bytes survive into decoded records.
    pub fn for_template_entry(
        &self,
        pen: u32,
        num: u16,
        length: u16,
    ) -> Result<Arc<InformationElement>, IpfixTypeError> {
        if let Some(ie) = self.lock().by_num.get(&(pen, num)).cloned() {
            return ie.for_length(length);
        }
        let ie = InformationElement::new(None, pen, num, IpfixType::OctetArray, length)?;
        Ok(self.register(ie))
    }

    /// Resolves an ordered list of iespecs.
    pub fn spec_list<I, S>(&self, specs: I) -> Result<InformationElementList, SpecError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        specs
            .into_iter()
            .map(|spec| self.for_spec(spec.as_ref()))
            .collect()
    }

    /// Registers every non-blank line of `text` as an iespec.
    pub fn use_specs(&self, text: &str) -> Result<(), SpecError> {
        for (n, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            self.for_spec(line).map_err(|e| SpecError::AtLine {
                line: n + 1,
                inner: Box::new(e),
            })?;
        }
        Ok(())
    }

    /// Loads an iespec file from disk.
    pub fn use_specfile(&self, path: impl AsRef<Path>) -> Result<(), SpecError> {
        let text =
            std::fs::read_to_string(path).map_err(|e| SpecError::Io(e.to_string()))?;
        self.use_specs(&text)
    }

    /// Loads the bundled IANA IPFIX registry.
    pub fn use_iana_default(&self) -> Result<(), SpecError> {
        self.use_specs(include_str!("../specs/iana.iespec"))
    }

    /// Loads the bundled RFC 5103 reverse-direction IEs.
    pub fn use_5103_default(&self) -> Result<(), SpecError> {
        self.use_specs(include_str!("../specs/rfc5103.iespec"))
    }

    /// Removes every registered IE.
    pub fn clear(&self) {
        let mut idx = self.lock();
        idx.by_name.clear();
        idx.by_num.clear();
    }

    /// Number of registered IEs.
    pub fn len(&self) -> usize {
        self.lock().by_num.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().by_num.is_empty()
    }
}

impl std::fmt::Debug for InfoModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoModel")
            .field("entries", &self.len())
            .finish()
    }
}

static DEFAULT_MODEL: LazyLock<InfoModel> = LazyLock::new(InfoModel::new);

/// The process-wide default catalog. The same handle is returned on every
/// call; buffers constructed with `new()` share it.
pub fn default_model() -> InfoModel {
    DEFAULT_MODEL.clone()
}

/// [`InfoModel::for_spec`] on the default catalog.
pub fn for_spec(spec: &str) -> Result<Arc<InformationElement>, SpecError> {
    default_model().for_spec(spec)
}

/// [`InfoModel::for_template_entry`] on the default catalog.
pub fn for_template_entry(
    pen: u32,
    num: u16,
    length: u16,
) -> Result<Arc<InformationElement>, IpfixTypeError> {
    default_model().for_template_entry(pen, num, length)
}

/// [`InfoModel::spec_list`] on the default catalog.
pub fn spec_list<I, S>(specs: I) -> Result<InformationElementList, SpecError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    default_model().spec_list(specs)
}

/// Loads the bundled IANA registry into the default catalog.
pub fn use_iana_default() -> Result<(), SpecError> {
    default_model().use_iana_default()
}

/// Loads the bundled RFC 5103 reverse IEs into the default catalog.
pub fn use_5103_default() -> Result<(), SpecError> {
    default_model().use_5103_default()
}

/// Loads an iespec file into the default catalog.
pub fn use_specfile(path: impl AsRef<Path>) -> Result<(), SpecError> {
    default_model().use_specfile(path)
}

/// Clears the default catalog.
pub fn clear_infomodel() {
    default_model().clear()
}
