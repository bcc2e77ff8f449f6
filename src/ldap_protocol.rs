// LDAP v3 message model with BER encoding/decoding.
// Operations the proxy inspects are decoded structurally; everything else is
// carried as a raw protocol op and re-emitted byte-for-byte.

use anyhow::{Context, Result, bail};

/// OID for the StartTLS extended operation (RFC 4511).
pub const START_TLS_OID: &str = "1.3.6.1.4.1.1466.20037";

// LDAP message structure
#[derive(Debug, Clone, PartialEq)]
pub struct LdapMessage {
    pub message_id: i32,
    pub protocol_op: ProtocolOp,
    /// Raw bytes of everything following the protocol op inside the message
    /// SEQUENCE (the optional controls element). Kept verbatim so unknown
    /// controls survive re-encoding untouched.
    pub controls: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolOp {
    BindRequest(BindRequest),
    BindResponse(LdapResult),
    SearchRequest(SearchRequest),
    SearchResultEntry(SearchResultEntry),
    SearchResultReference(Vec<String>),
    SearchResultDone(LdapResult),
    ExtendedRequest(ExtendedRequest),
    UnbindRequest,
    /// AbandonRequest: [APPLICATION 16] MessageID - no response per RFC 4511
    AbandonRequest(i32),
    /// Any operation the proxy does not model. Forwarded unchanged.
    Raw { tag: u8, body: Vec<u8> },
}

impl ProtocolOp {
    /// Short operation name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolOp::BindRequest(_) => "BIND",
            ProtocolOp::BindResponse(_) => "BIND-RESP",
            ProtocolOp::SearchRequest(_) => "SEARCH",
            ProtocolOp::SearchResultEntry(_) => "SEARCH-ENTRY",
            ProtocolOp::SearchResultReference(_) => "SEARCH-REF",
            ProtocolOp::SearchResultDone(_) => "SEARCH-DONE",
            ProtocolOp::ExtendedRequest(_) => "EXTENDED",
            ProtocolOp::UnbindRequest => "UNBIND",
            ProtocolOp::AbandonRequest(_) => "ABANDON",
            ProtocolOp::Raw { .. } => "RAW",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BindRequest {
    pub version: i32,
    pub name: String,
    pub authentication: BindAuthentication,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BindAuthentication {
    Simple(String),
    Sasl { mechanism: String, credentials: Vec<u8> },
}

/// LDAPResult body shared by BindResponse and SearchResultDone. Trailing
/// elements (referral, serverSaslCreds) are kept as raw bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct LdapResult {
    pub result_code: i32,
    pub matched_dn: String,
    pub diagnostic_message: String,
    pub extra: Vec<u8>,
}

/// LDAP Search filter (RFC 4511 Filter CHOICE).
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    EqualityMatch { attribute: String, value: Vec<u8> },
    Substrings {
        attribute: String,
        substrings: Vec<SubstringFilterItem>,
    },
    GreaterOrEqual { attribute: String, value: Vec<u8> },
    LessOrEqual { attribute: String, value: Vec<u8> },
    Present(String),
    ApproxMatch { attribute: String, value: Vec<u8> },
    ExtensibleMatch {
        matching_rule: Option<String>,
        typ: Option<String>,
        match_value: Vec<u8>,
        dn_attributes: bool,
    },
    /// Unparsed filter; stored as (tag, raw content) and re-emitted verbatim.
    Raw(u8, Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubstringFilterItem {
    Initial(Vec<u8>),
    Any(Vec<u8>),
    Final(Vec<u8>),
}

impl Filter {
    /// Display form for logs (e.g. "(cn=foo)", "(&(a=b)(c=d))").
    pub fn to_ldap_string(&self) -> String {
        match self {
            Filter::And(fs) => format!("(&{})", fs.iter().map(Filter::to_ldap_string).collect::<String>()),
            Filter::Or(fs) => format!("(|{})", fs.iter().map(Filter::to_ldap_string).collect::<String>()),
            Filter::Not(f) => format!("(!{})", f.to_ldap_string()),
            Filter::EqualityMatch { attribute, value } => {
                format!("({}={})", attribute, String::from_utf8_lossy(value))
            }
            Filter::Present(attr) => format!("({}=*)", attr),
            Filter::Substrings { attribute, substrings } => {
                let mut s = attribute.clone();
                s.push('=');
                for item in substrings {
                    match item {
                        SubstringFilterItem::Initial(b) => s.push_str(&String::from_utf8_lossy(b)),
                        SubstringFilterItem::Any(b) => {
                            s.push('*');
                            s.push_str(&String::from_utf8_lossy(b));
                        }
                        SubstringFilterItem::Final(b) => {
                            s.push('*');
                            s.push_str(&String::from_utf8_lossy(b));
                        }
                    }
                }
                format!("({})", s)
            }
            Filter::GreaterOrEqual { attribute, value } => {
                format!("({}>={})", attribute, String::from_utf8_lossy(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                format!("({}<={})", attribute, String::from_utf8_lossy(value))
            }
            Filter::ApproxMatch { attribute, value } => {
                format!("({}~={})", attribute, String::from_utf8_lossy(value))
            }
            Filter::ExtensibleMatch { matching_rule, match_value, .. } => {
                let v = String::from_utf8_lossy(match_value);
                match matching_rule {
                    Some(mr) => format!("(:{}:={})", mr, v),
                    None => format!("(:={})", v),
                }
            }
            Filter::Raw(tag, _) => format!("(?raw tag=0x{:02X})", tag),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base_object: String,
    pub scope: SearchScope,
    pub deref_aliases: i32,
    pub size_limit: i32,
    pub time_limit: i32,
    pub types_only: bool,
    pub filter: Filter,
    pub attributes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    BaseObject = 0,
    SingleLevel = 1,
    WholeSubtree = 2,
}

impl TryFrom<u8> for SearchScope {
    type Error = anyhow::Error;
    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(SearchScope::BaseObject),
            1 => Ok(SearchScope::SingleLevel),
            2 => Ok(SearchScope::WholeSubtree),
            _ => bail!("Invalid search scope: {}", value),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchResultEntry {
    pub object_name: String,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExtendedRequest {
    pub request_name: String,
    pub request_value: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attribute {
    pub attr_type: String,
    pub attr_values: Vec<Vec<u8>>,
}

/// Non-copying BER element reader: a slice and an offset. Borrowed element
/// bodies keep the input's lifetime, so nested elements parse without
/// intermediate buffers.
pub(crate) struct BerReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BerReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Unread tail of the input.
    fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Consume the next n bytes.
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            bail!(
                "input ends {} bytes short of a complete element",
                n - self.remaining()
            );
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_tag(&mut self) -> Result<u8> {
        self.byte()
    }

    /// Definite-form length: a single octet below 0x80, or a count of
    /// following length octets. LDAP never uses the indefinite form.
    fn read_length(&mut self) -> Result<usize> {
        let head = self.byte()?;
        if head < 0x80 {
            return Ok(head as usize);
        }
        let count = (head & 0x7F) as usize;
        if count == 0 {
            bail!("indefinite length has no place in LDAP");
        }
        if count > 4 {
            bail!("length field spans {} octets", count);
        }
        let mut total = 0usize;
        for &b in self.take(count)? {
            total = total << 8 | b as usize;
        }
        Ok(total)
    }

    /// Length-prefixed body of the element whose tag was just consumed.
    fn read_body(&mut self) -> Result<&'a [u8]> {
        let len = self.read_length()?;
        self.take(len)
    }

    /// One full element: tag plus body.
    fn read_tlv(&mut self) -> Result<(u8, &'a [u8])> {
        let tag = self.byte()?;
        let body = self.read_body()?;
        Ok((tag, body))
    }

    /// Body of an element that must carry the given universal tag number.
    fn body_of(&mut self, universal: u8, what: &str) -> Result<&'a [u8]> {
        let tag = self.byte()?;
        if (tag & 0x1F) != universal {
            bail!("{} expected, found tag {:#04x}", what, tag);
        }
        self.read_body()
    }

    fn read_integer(&mut self) -> Result<i32> {
        let body = self.body_of(0x02, "INTEGER")?;
        if body.is_empty() || body.len() > 4 {
            bail!("INTEGER body of {} bytes", body.len());
        }
        Ok(int_from_be_bytes(body))
    }

    fn read_enumerated(&mut self) -> Result<i32> {
        let body = self.body_of(0x0A, "ENUMERATED")?;
        if body.is_empty() || body.len() > 4 {
            bail!("ENUMERATED body of {} bytes", body.len());
        }
        Ok(int_from_be_bytes(body))
    }

    fn read_boolean(&mut self) -> Result<bool> {
        let body = self.body_of(0x01, "BOOLEAN")?;
        match body {
            [b] => Ok(*b != 0),
            _ => bail!("BOOLEAN body of {} bytes", body.len()),
        }
    }

    /// String value. Context-specific tags are tolerated because clients
    /// wrap DNs and passwords under [n] IMPLICIT freely.
    fn read_octet_string(&mut self) -> Result<Vec<u8>> {
        let tag = self.byte()?;
        let stringish = (tag & 0x1F) == 0x04 || (tag & 0xC0) == 0x80;
        if !stringish {
            bail!("OCTET STRING expected, found tag {:#04x}", tag);
        }
        Ok(self.read_body()?.to_vec())
    }

    fn read_string(&mut self) -> Result<String> {
        String::from_utf8(self.read_octet_string()?).context("string value is not UTF-8")
    }

    /// SEQUENCE header: consumes tag and length, leaves the body unread.
    fn read_sequence(&mut self) -> Result<usize> {
        let tag = self.byte()?;
        if (tag & 0x1F) != 0x10 {
            bail!("SEQUENCE expected, found tag {:#04x}", tag);
        }
        self.read_length()
    }
}

/// Big-endian two's complement bytes to i32. Callers guarantee 1..=4 bytes.
/// The bytes are placed in the most significant positions and shifted back
/// down arithmetically, which sign-extends short encodings for free.
fn int_from_be_bytes(buf: &[u8]) -> i32 {
    let mut word = [0u8; 4];
    word[..buf.len()].copy_from_slice(buf);
    i32::from_be_bytes(word) >> (32 - 8 * buf.len())
}

/// Big-endian octets of a long-form length: the 4-byte buffer and the index
/// of its first significant byte.
fn length_octets(length: usize) -> ([u8; 4], usize) {
    let be = (length as u32).to_be_bytes();
    let first = be.iter().position(|&b| b != 0).unwrap_or(3);
    (be, first)
}

/// Minimal big-endian two's complement content bytes for an i32.
fn int_content_bytes(value: i32) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    while start < 3 {
        let cur = bytes[start];
        let next = bytes[start + 1];
        // A leading 0x00 (or 0xFF for negatives) is redundant while the sign
        // bit of the following byte agrees.
        if (cur == 0x00 && (next & 0x80) == 0) || (cur == 0xFF && (next & 0x80) != 0) {
            start += 1;
        } else {
            break;
        }
    }
    bytes[start..].to_vec()
}

// BER encoding utilities
pub struct BerWriter {
    buffer: Vec<u8>,
}

impl BerWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
        }
    }

    pub fn write_tag(&mut self, tag: u8) {
        self.buffer.push(tag);
    }

    fn write_length(&mut self, length: usize) {
        if length < 0x80 {
            self.buffer.push(length as u8);
        } else {
            let (be, first) = length_octets(length);
            self.buffer.push(0x80 | (4 - first) as u8);
            self.buffer.extend_from_slice(&be[first..]);
        }
    }

    pub fn write_integer(&mut self, value: i32) {
        self.write_tagged_int(0x02, value);
    }

    pub fn write_enumerated(&mut self, value: i32) {
        self.write_tagged_int(0x0A, value);
    }

    fn write_tagged_int(&mut self, tag: u8, value: i32) {
        self.write_tag(tag);
        let content = int_content_bytes(value);
        self.write_length(content.len());
        self.buffer.extend_from_slice(&content);
    }

    pub fn write_octet_string(&mut self, data: &[u8]) {
        self.write_tagged_bytes(0x04, data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_octet_string(s.as_bytes());
    }

    /// Write an arbitrary tag with the given content bytes.
    pub fn write_tagged_bytes(&mut self, tag: u8, data: &[u8]) {
        self.write_tag(tag);
        self.write_length(data.len());
        self.buffer.extend_from_slice(data);
    }

    fn write_boolean(&mut self, value: bool) {
        self.write_tag(0x01);
        self.write_length(1);
        self.buffer.push(if value { 0xFF } else { 0x00 });
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Push a one-byte length stand-in and return its offset; patch_length
    /// fills in the real value once the element body has been written.
    pub fn reserve_length(&mut self) -> usize {
        let at = self.buffer.len();
        self.buffer.push(0);
        at
    }

    /// Back-patch the length at pos for content written after the
    /// placeholder. Supports short and long form.
    pub fn patch_length(&mut self, pos: usize) {
        let body_len = self.buffer.len() - pos - 1;
        if body_len < 0x80 {
            self.buffer[pos] = body_len as u8;
        } else {
            let (be, first) = length_octets(body_len);
            self.buffer[pos] = 0x80 | (4 - first) as u8;
            // The placeholder reserved a single byte; the long form needs
            // room for its length octets as well.
            self.buffer
                .splice(pos + 1..pos + 1, be[first..].iter().copied());
        }
    }

    pub fn start_sequence(&mut self) -> usize {
        self.write_tag(0x30);
        self.reserve_length()
    }

    pub fn end_sequence(&mut self, length_pos: usize) {
        self.patch_length(length_pos);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buffer
    }
}

// LDAP protocol tag constants
pub const LDAP_TAG_BIND_REQUEST: u8 = 0x60;
pub const LDAP_TAG_BIND_RESPONSE: u8 = 0x61;
pub const LDAP_TAG_UNBIND_REQUEST: u8 = 0x42;
pub const LDAP_TAG_SEARCH_REQUEST: u8 = 0x63;
pub const LDAP_TAG_SEARCH_RESULT_ENTRY: u8 = 0x64;
pub const LDAP_TAG_SEARCH_RESULT_DONE: u8 = 0x65;
pub const LDAP_TAG_SEARCH_RESULT_REF: u8 = 0x73;
pub const LDAP_TAG_ABANDON_REQUEST: u8 = 0x50;
pub const LDAP_TAG_EXTENDED_REQUEST: u8 = 0x77;

/// Parse only the message header (SEQUENCE, messageID, protocolOp tag).
pub fn parse_ldap_message_header(data: &[u8]) -> Result<(i32, u8)> {
    let mut reader = BerReader::new(data);
    let _seq_len = reader.read_sequence()?;
    let message_id = reader.read_integer()?;
    let tag = reader.read_tag()?;
    Ok((message_id, tag))
}

pub fn parse_ldap_message(data: &[u8]) -> Result<LdapMessage> {
    let mut reader = BerReader::new(data);

    // LDAPMessage ::= SEQUENCE { messageID, protocolOp, controls [0] OPTIONAL }
    let _seq_len = reader.read_sequence()?;

    let message_id = reader.read_integer()?;

    let (tag, content) = reader.read_tlv()?;
    let protocol_op = match tag {
        LDAP_TAG_BIND_REQUEST => ProtocolOp::BindRequest(parse_bind_request(content)?),
        LDAP_TAG_BIND_RESPONSE => ProtocolOp::BindResponse(parse_ldap_result(content)?),
        LDAP_TAG_UNBIND_REQUEST => ProtocolOp::UnbindRequest,
        LDAP_TAG_SEARCH_REQUEST => ProtocolOp::SearchRequest(parse_search_request(content)?),
        LDAP_TAG_SEARCH_RESULT_ENTRY => ProtocolOp::SearchResultEntry(parse_search_result_entry(content)?),
        LDAP_TAG_SEARCH_RESULT_REF => ProtocolOp::SearchResultReference(parse_search_result_reference(content)?),
        LDAP_TAG_SEARCH_RESULT_DONE => ProtocolOp::SearchResultDone(parse_ldap_result(content)?),
        LDAP_TAG_EXTENDED_REQUEST => ProtocolOp::ExtendedRequest(parse_extended_request(content)?),
        LDAP_TAG_ABANDON_REQUEST => {
            if content.is_empty() || content.len() > 4 {
                bail!("AbandonRequest message ID length out of range: {}", content.len());
            }
            ProtocolOp::AbandonRequest(int_from_be_bytes(content))
        }
        _ => ProtocolOp::Raw { tag, body: content.to_vec() },
    };

    // Everything after the protocol op (if anything) is the optional controls
    // element; kept raw, but the TLV framing must be coherent.
    let controls = if reader.remaining() > 0 {
        let rest = reader.rest();
        let (ctl_tag, _ctl_body) = reader.read_tlv()?;
        if ctl_tag != 0xA0 {
            bail!("Expected controls [0] after protocol op, got tag: 0x{:02X}", ctl_tag);
        }
        if reader.remaining() > 0 {
            bail!("Trailing bytes after controls element");
        }
        Some(rest.to_vec())
    } else {
        None
    };

    Ok(LdapMessage {
        message_id,
        protocol_op,
        controls,
    })
}

fn parse_bind_request(content: &[u8]) -> Result<BindRequest> {
    let mut reader = BerReader::new(content);
    let version = reader.read_integer()?;
    let name = reader.read_string()?;

    // RFC 4511 simple auth is [0] IMPLICIT OCTET STRING (0x80), but clients
    // send various tags. Anything that is not SASL (0xA3) is treated as a
    // simple bind password.
    let (auth_tag, auth_value) = reader.read_tlv()?;
    let authentication = if auth_tag == 0xA3 {
        let mut sasl = BerReader::new(auth_value);
        let (_mech_tag, mech) = sasl.read_tlv()?;
        let mechanism = String::from_utf8(mech.to_vec()).context("Invalid SASL mechanism")?;
        let credentials = if sasl.remaining() > 0 {
            let (_cred_tag, creds) = sasl.read_tlv()?;
            creds.to_vec()
        } else {
            Vec::new()
        };
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        }
    } else {
        BindAuthentication::Simple(
            String::from_utf8(auth_value.to_vec()).context("Invalid bind password encoding")?,
        )
    };

    Ok(BindRequest {
        version,
        name,
        authentication,
    })
}

fn parse_ldap_result(content: &[u8]) -> Result<LdapResult> {
    let mut reader = BerReader::new(content);
    let result_code = reader.read_enumerated()?;
    let matched_dn = reader.read_string()?;
    let diagnostic_message = reader.read_string()?;
    let extra = reader.rest().to_vec();
    Ok(LdapResult {
        result_code,
        matched_dn,
        diagnostic_message,
        extra,
    })
}

fn parse_search_request(content: &[u8]) -> Result<SearchRequest> {
    let mut reader = BerReader::new(content);
    let base_object = reader.read_string()?;
    let scope = SearchScope::try_from(reader.read_enumerated()? as u8)?;
    let deref_aliases = reader.read_enumerated()?;
    let size_limit = reader.read_integer()?;
    let time_limit = reader.read_integer()?;
    let types_only = reader.read_boolean()?;

    let filter = parse_filter(&mut reader)?;

    let (attrs_tag, attrs_content) = reader.read_tlv()?;
    if (attrs_tag & 0x1F) != 0x10 {
        bail!("Expected attribute list SEQUENCE, got: 0x{:02X}", attrs_tag);
    }
    let mut attrs = BerReader::new(attrs_content);
    let mut attributes = Vec::new();
    while attrs.remaining() > 0 {
        attributes.push(attrs.read_string()?);
    }

    Ok(SearchRequest {
        base_object,
        scope,
        deref_aliases,
        size_limit,
        time_limit,
        types_only,
        filter,
        attributes,
    })
}

/// RFC 4511 Filter CHOICE: [0]=and, [1]=or, [2]=not, [3]=equalityMatch,
/// [4]=substrings, [5]=greaterOrEqual, [6]=lessOrEqual, [7]=present,
/// [8]=approxMatch, [9]=extensibleMatch. Tags are IMPLICIT, so the content
/// of e.g. equalityMatch is the AttributeValueAssertion fields directly.
fn parse_filter(reader: &mut BerReader) -> Result<Filter> {
    let (tag, content) = reader.read_tlv()?;
    Ok(parse_filter_content(tag, content))
}

fn parse_filter_content(tag: u8, content: &[u8]) -> Filter {
    match try_parse_filter_content(tag, content) {
        Ok(f) => f,
        // Unknown or unparseable filter forms pass through untouched.
        Err(_) => Filter::Raw(tag, content.to_vec()),
    }
}

fn try_parse_filter_content(tag: u8, content: &[u8]) -> Result<Filter> {
    let mut sub = BerReader::new(content);
    match tag {
        0xA0 => {
            let mut filters = Vec::new();
            while sub.remaining() > 0 {
                filters.push(parse_filter(&mut sub)?);
            }
            Ok(Filter::And(filters))
        }
        0xA1 => {
            let mut filters = Vec::new();
            while sub.remaining() > 0 {
                filters.push(parse_filter(&mut sub)?);
            }
            Ok(Filter::Or(filters))
        }
        0xA2 => {
            let f = parse_filter(&mut sub)?;
            Ok(Filter::Not(Box::new(f)))
        }
        0xA3 => {
            let (attribute, value) = parse_ava(&mut sub)?;
            Ok(Filter::EqualityMatch { attribute, value })
        }
        0xA4 => {
            let attribute = sub.read_string()?;
            let (subs_tag, subs_content) = sub.read_tlv()?;
            if (subs_tag & 0x1F) != 0x10 {
                bail!("Expected substrings SEQUENCE, got: 0x{:02X}", subs_tag);
            }
            let mut items = BerReader::new(subs_content);
            let mut substrings = Vec::new();
            while items.remaining() > 0 {
                let (t, val) = items.read_tlv()?;
                let item = match t {
                    0x80 => SubstringFilterItem::Initial(val.to_vec()),
                    0x81 => SubstringFilterItem::Any(val.to_vec()),
                    0x82 => SubstringFilterItem::Final(val.to_vec()),
                    _ => bail!("Unexpected substring item tag: 0x{:02X}", t),
                };
                substrings.push(item);
            }
            Ok(Filter::Substrings { attribute, substrings })
        }
        0xA5 => {
            let (attribute, value) = parse_ava(&mut sub)?;
            Ok(Filter::GreaterOrEqual { attribute, value })
        }
        0xA6 => {
            let (attribute, value) = parse_ava(&mut sub)?;
            Ok(Filter::LessOrEqual { attribute, value })
        }
        0x87 => {
            // present [7] IMPLICIT AttributeDescription: content is the raw
            // attribute name.
            Ok(Filter::Present(
                String::from_utf8(content.to_vec()).context("Invalid present filter attribute")?,
            ))
        }
        0xA8 => {
            let (attribute, value) = parse_ava(&mut sub)?;
            Ok(Filter::ApproxMatch { attribute, value })
        }
        0xA9 => {
            // extensibleMatch [9] MatchingRuleAssertion:
            //   matchingRule [1], type [2], matchValue [3], dnAttributes [4]
            let mut matching_rule = None;
            let mut typ = None;
            let mut match_value = Vec::new();
            let mut dn_attributes = false;
            while sub.remaining() > 0 {
                let (t, v) = sub.read_tlv()?;
                match t {
                    0x81 => {
                        matching_rule =
                            Some(String::from_utf8(v.to_vec()).context("Invalid matching rule")?)
                    }
                    0x82 => typ = Some(String::from_utf8(v.to_vec()).context("Invalid match type")?),
                    0x83 => match_value = v.to_vec(),
                    0x84 => dn_attributes = !v.is_empty() && v[0] != 0,
                    _ => bail!("Unexpected extensibleMatch element tag: 0x{:02X}", t),
                }
            }
            Ok(Filter::ExtensibleMatch {
                matching_rule,
                typ,
                match_value,
                dn_attributes,
            })
        }
        _ => bail!("Unknown filter tag: 0x{:02X}", tag),
    }
}

/// AttributeValueAssertion fields: attributeDesc, assertionValue.
fn parse_ava(reader: &mut BerReader) -> Result<(String, Vec<u8>)> {
    let attribute = reader.read_string()?;
    let value = reader.read_octet_string()?;
    Ok((attribute, value))
}

fn parse_search_result_entry(content: &[u8]) -> Result<SearchResultEntry> {
    let mut reader = BerReader::new(content);
    let object_name = reader.read_string()?;
    let (attrs_tag, attrs_content) = reader.read_tlv()?;
    if (attrs_tag & 0x1F) != 0x10 {
        bail!("Expected PartialAttributeList SEQUENCE, got: 0x{:02X}", attrs_tag);
    }
    let mut attrs = BerReader::new(attrs_content);
    let mut attributes = Vec::new();
    while attrs.remaining() > 0 {
        attributes.push(parse_attribute(&mut attrs)?);
    }
    Ok(SearchResultEntry {
        object_name,
        attributes,
    })
}

fn parse_search_result_reference(content: &[u8]) -> Result<Vec<String>> {
    let mut reader = BerReader::new(content);
    let mut uris = Vec::new();
    while reader.remaining() > 0 {
        uris.push(reader.read_string()?);
    }
    Ok(uris)
}

fn parse_extended_request(content: &[u8]) -> Result<ExtendedRequest> {
    let mut reader = BerReader::new(content);
    // requestName [0] IMPLICIT LDAPOID (0x80); tolerate a plain OCTET STRING.
    let (name_tag, name) = reader.read_tlv()?;
    if name_tag != 0x80 && (name_tag & 0x1F) != 0x04 {
        bail!("Expected extended request name [0], got tag: 0x{:02X}", name_tag);
    }
    let request_name = String::from_utf8(name.to_vec()).context("Invalid extended request name")?;
    let request_value = if reader.remaining() > 0 {
        let (_value_tag, value) = reader.read_tlv()?;
        Some(value.to_vec())
    } else {
        None
    };
    Ok(ExtendedRequest {
        request_name,
        request_value,
    })
}

fn parse_attribute(reader: &mut BerReader) -> Result<Attribute> {
    // PartialAttribute ::= SEQUENCE { type, vals SET OF value }
    let (seq_tag, seq_content) = reader.read_tlv()?;
    if (seq_tag & 0x1F) != 0x10 {
        bail!("Expected PartialAttribute SEQUENCE, got: 0x{:02X}", seq_tag);
    }
    let mut sub = BerReader::new(seq_content);
    let attr_type = sub.read_string()?;
    let (vals_tag, vals_content) = sub.read_tlv()?;
    // SET per RFC; some servers emit SEQUENCE.
    if (vals_tag & 0x1F) != 0x11 && (vals_tag & 0x1F) != 0x10 {
        bail!("Expected attribute value SET, got: 0x{:02X}", vals_tag);
    }
    let mut vals = BerReader::new(vals_content);
    let mut attr_values = Vec::new();
    while vals.remaining() > 0 {
        attr_values.push(vals.read_octet_string()?);
    }
    Ok(Attribute {
        attr_type,
        attr_values,
    })
}

pub fn encode_ldap_message(message: &LdapMessage) -> Result<Vec<u8>> {
    let mut writer = BerWriter::new();
    let seq_start = writer.start_sequence();

    writer.write_integer(message.message_id);

    match &message.protocol_op {
        ProtocolOp::BindRequest(req) => encode_bind_request(&mut writer, req),
        ProtocolOp::BindResponse(res) => encode_ldap_result(&mut writer, LDAP_TAG_BIND_RESPONSE, res),
        ProtocolOp::SearchRequest(req) => encode_search_request(&mut writer, req),
        ProtocolOp::SearchResultEntry(entry) => encode_search_result_entry(&mut writer, entry),
        ProtocolOp::SearchResultReference(uris) => {
            writer.write_tag(LDAP_TAG_SEARCH_RESULT_REF);
            let len_pos = writer.reserve_length();
            for uri in uris {
                writer.write_string(uri);
            }
            writer.patch_length(len_pos);
        }
        ProtocolOp::SearchResultDone(res) => encode_ldap_result(&mut writer, LDAP_TAG_SEARCH_RESULT_DONE, res),
        ProtocolOp::ExtendedRequest(req) => {
            writer.write_tag(LDAP_TAG_EXTENDED_REQUEST);
            let len_pos = writer.reserve_length();
            writer.write_tagged_bytes(0x80, req.request_name.as_bytes());
            if let Some(ref value) = req.request_value {
                writer.write_tagged_bytes(0x81, value);
            }
            writer.patch_length(len_pos);
        }
        ProtocolOp::UnbindRequest => {
            writer.write_tag(LDAP_TAG_UNBIND_REQUEST);
            writer.write_length(0);
        }
        ProtocolOp::AbandonRequest(id) => {
            // [APPLICATION 16] IMPLICIT MessageID: integer content directly.
            writer.write_tagged_bytes(LDAP_TAG_ABANDON_REQUEST, &int_content_bytes(*id));
        }
        ProtocolOp::Raw { tag, body } => {
            writer.write_tagged_bytes(*tag, body);
        }
    }

    if let Some(ref controls) = message.controls {
        writer.write_raw(controls);
    }

    writer.end_sequence(seq_start);
    Ok(writer.into_vec())
}

fn encode_bind_request(writer: &mut BerWriter, req: &BindRequest) {
    writer.write_tag(LDAP_TAG_BIND_REQUEST);
    let len_pos = writer.reserve_length();
    writer.write_integer(req.version);
    writer.write_string(&req.name);
    match &req.authentication {
        BindAuthentication::Simple(password) => {
            writer.write_tagged_bytes(0x80, password.as_bytes());
        }
        BindAuthentication::Sasl {
            mechanism,
            credentials,
        } => {
            writer.write_tag(0xA3);
            let sasl_pos = writer.reserve_length();
            writer.write_string(mechanism);
            if !credentials.is_empty() {
                writer.write_octet_string(credentials);
            }
            writer.patch_length(sasl_pos);
        }
    }
    writer.patch_length(len_pos);
}

fn encode_ldap_result(writer: &mut BerWriter, tag: u8, res: &LdapResult) {
    writer.write_tag(tag);
    let len_pos = writer.reserve_length();
    writer.write_enumerated(res.result_code);
    writer.write_string(&res.matched_dn);
    writer.write_string(&res.diagnostic_message);
    writer.write_raw(&res.extra);
    writer.patch_length(len_pos);
}

fn encode_search_request(writer: &mut BerWriter, req: &SearchRequest) {
    writer.write_tag(LDAP_TAG_SEARCH_REQUEST);
    let len_pos = writer.reserve_length();
    encode_search_request_body(writer, req);
    writer.patch_length(len_pos);
}

fn encode_search_request_body(writer: &mut BerWriter, req: &SearchRequest) {
    writer.write_string(&req.base_object);
    writer.write_enumerated(req.scope as i32);
    writer.write_enumerated(req.deref_aliases);
    writer.write_integer(req.size_limit);
    writer.write_integer(req.time_limit);
    writer.write_boolean(req.types_only);
    encode_filter(writer, &req.filter);
    let attrs_pos = writer.start_sequence();
    for attr in &req.attributes {
        writer.write_string(attr);
    }
    writer.end_sequence(attrs_pos);
}

/// Canonical serialization of a search request payload: the full
/// [APPLICATION 3] TLV as this encoder emits it. Message ID and controls are
/// not part of the payload, so semantically identical requests collide.
pub fn search_request_fingerprint(req: &SearchRequest) -> Vec<u8> {
    let mut writer = BerWriter::new();
    encode_search_request(&mut writer, req);
    writer.into_vec()
}

fn encode_filter(writer: &mut BerWriter, filter: &Filter) {
    match filter {
        Filter::And(fs) => {
            writer.write_tag(0xA0);
            let pos = writer.reserve_length();
            for f in fs {
                encode_filter(writer, f);
            }
            writer.patch_length(pos);
        }
        Filter::Or(fs) => {
            writer.write_tag(0xA1);
            let pos = writer.reserve_length();
            for f in fs {
                encode_filter(writer, f);
            }
            writer.patch_length(pos);
        }
        Filter::Not(f) => {
            writer.write_tag(0xA2);
            let pos = writer.reserve_length();
            encode_filter(writer, f);
            writer.patch_length(pos);
        }
        Filter::EqualityMatch { attribute, value } => encode_ava(writer, 0xA3, attribute, value),
        Filter::Substrings { attribute, substrings } => {
            writer.write_tag(0xA4);
            let pos = writer.reserve_length();
            writer.write_string(attribute);
            let subs_pos = writer.start_sequence();
            for item in substrings {
                match item {
                    SubstringFilterItem::Initial(b) => writer.write_tagged_bytes(0x80, b),
                    SubstringFilterItem::Any(b) => writer.write_tagged_bytes(0x81, b),
                    SubstringFilterItem::Final(b) => writer.write_tagged_bytes(0x82, b),
                }
            }
            writer.end_sequence(subs_pos);
            writer.patch_length(pos);
        }
        Filter::GreaterOrEqual { attribute, value } => encode_ava(writer, 0xA5, attribute, value),
        Filter::LessOrEqual { attribute, value } => encode_ava(writer, 0xA6, attribute, value),
        Filter::Present(attribute) => {
            writer.write_tagged_bytes(0x87, attribute.as_bytes());
        }
        Filter::ApproxMatch { attribute, value } => encode_ava(writer, 0xA8, attribute, value),
        Filter::ExtensibleMatch {
            matching_rule,
            typ,
            match_value,
            dn_attributes,
        } => {
            writer.write_tag(0xA9);
            let pos = writer.reserve_length();
            if let Some(mr) = matching_rule {
                writer.write_tagged_bytes(0x81, mr.as_bytes());
            }
            if let Some(t) = typ {
                writer.write_tagged_bytes(0x82, t.as_bytes());
            }
            writer.write_tagged_bytes(0x83, match_value);
            if *dn_attributes {
                writer.write_tagged_bytes(0x84, &[0xFF]);
            }
            writer.patch_length(pos);
        }
        Filter::Raw(tag, body) => {
            writer.write_tagged_bytes(*tag, body);
        }
    }
}

fn encode_ava(writer: &mut BerWriter, tag: u8, attribute: &str, value: &[u8]) {
    writer.write_tag(tag);
    let pos = writer.reserve_length();
    writer.write_string(attribute);
    writer.write_octet_string(value);
    writer.patch_length(pos);
}

fn encode_search_result_entry(writer: &mut BerWriter, entry: &SearchResultEntry) {
    writer.write_tag(LDAP_TAG_SEARCH_RESULT_ENTRY);
    let len_pos = writer.reserve_length();
    writer.write_string(&entry.object_name);
    let attrs_start = writer.start_sequence();
    for attr in &entry.attributes {
        encode_attribute(writer, attr);
    }
    writer.end_sequence(attrs_start);
    writer.patch_length(len_pos);
}

fn encode_attribute(writer: &mut BerWriter, attr: &Attribute) {
    let seq_start = writer.start_sequence();
    writer.write_string(&attr.attr_type);

    // vals is a SET OF per RFC 4511.
    writer.write_tag(0x31);
    let vals_pos = writer.reserve_length();
    for value in &attr.attr_values {
        writer.write_octet_string(value);
    }
    writer.patch_length(vals_pos);

    writer.end_sequence(seq_start);
}
