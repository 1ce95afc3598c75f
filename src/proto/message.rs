//! Message header, type-field layout, and whole-message codec.

use bytes::{BufMut, Bytes, BytesMut};

use super::{
    CodecError, Element, FAMILY_ANP, HEADER_LEN, PROTO_MAJOR, PROTO_MINOR, ROLE_CMD, ROLE_EVT,
    ROLE_RES,
};

const NAMESPACE_MASK: u32 = 0x03FF_FFFF;

/// The 32-bit type field: family in bits 28..32, role in bits 26..28,
/// namespace in bits 0..26.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgType(u32);

impl MsgType {
    pub fn from_raw(raw: u32) -> Self {
        MsgType(raw)
    }

    pub fn command(namespace: u32) -> Self {
        Self::compose(ROLE_CMD, namespace)
    }

    pub fn response(namespace: u32) -> Self {
        Self::compose(ROLE_RES, namespace)
    }

    pub fn event(namespace: u32) -> Self {
        Self::compose(ROLE_EVT, namespace)
    }

    fn compose(role: u32, namespace: u32) -> Self {
        MsgType((FAMILY_ANP << 28) | (role << 26) | (namespace & NAMESPACE_MASK))
    }

    pub fn raw(self) -> u32 {
        self.0
    }

    pub fn family(self) -> u32 {
        (self.0 >> 28) & 0xF
    }

    pub fn role(self) -> u32 {
        (self.0 >> 26) & 0x3
    }

    pub fn namespace(self) -> u32 {
        self.0 & NAMESPACE_MASK
    }

    pub fn is_cmd(self) -> bool {
        self.role() == ROLE_CMD
    }

    pub fn is_res(self) -> bool {
        self.role() == ROLE_RES
    }

    pub fn is_evt(self) -> bool {
        self.role() == ROLE_EVT
    }
}

/// Parsed fixed-size header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub major: u32,
    pub minor: u32,
    pub ty: MsgType,
    pub id: u64,
    pub payload_size: u32,
}

impl Header {
    /// Parse exactly [`HEADER_LEN`] bytes.
    pub fn parse(bytes: &[u8]) -> Result<Header, CodecError> {
        if bytes.len() != HEADER_LEN {
            return Err(CodecError::MalformedHeader {
                reason: format!("expected {HEADER_LEN} bytes, got {}", bytes.len()),
            });
        }
        let u32_at = |off: usize| {
            u32::from_be_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
        };
        let mut id_raw = [0u8; 8];
        id_raw.copy_from_slice(&bytes[12..20]);
        Ok(Header {
            major: u32_at(0),
            minor: u32_at(4),
            ty: MsgType::from_raw(u32_at(8)),
            id: u64::from_be_bytes(id_raw),
            payload_size: u32_at(20),
        })
    }

    fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32(self.major);
        buf.put_u32(self.minor);
        buf.put_u32(self.ty.raw());
        buf.put_u64(self.id);
        buf.put_u32(self.payload_size);
    }
}

/// A complete ANP message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Msg {
    pub major: u32,
    pub minor: u32,
    pub ty: MsgType,
    pub id: u64,
    pub elements: Vec<Element>,
}

impl Msg {
    /// New message with the current protocol version and a transient id of 0.
    pub fn new(ty: MsgType) -> Self {
        Msg {
            major: PROTO_MAJOR,
            minor: PROTO_MINOR,
            ty,
            id: 0,
            elements: Vec::new(),
        }
    }

    pub fn with_u32(mut self, value: u32) -> Self {
        self.elements.push(Element::U32(value));
        self
    }

    pub fn with_u64(mut self, value: u64) -> Self {
        self.elements.push(Element::U64(value));
        self
    }

    pub fn with_str(mut self, text: &str) -> Self {
        self.elements.push(Element::str_from(text));
        self
    }

    pub fn with_bin(mut self, bytes: Vec<u8>) -> Self {
        self.elements.push(Element::Bin(bytes));
        self
    }

    pub fn push(&mut self, element: Element) {
        self.elements.push(element);
    }

    pub(crate) fn from_parts(header: Header, elements: Vec<Element>) -> Self {
        Msg {
            major: header.major,
            minor: header.minor,
            ty: header.ty,
            id: header.id,
            elements,
        }
    }

    /// Sum of the wire sizes of all elements.
    pub fn payload_size(&self) -> usize {
        self.elements.iter().map(Element::wire_size).sum()
    }

    /// Encode the message, optionally with its header.
    ///
    /// Fails only when the payload size does not fit the header's u32 field;
    /// the 100 MiB receive cap is the transport's concern.
    pub fn encode(&self, include_header: bool) -> Result<Bytes, CodecError> {
        let payload_size = self.payload_size();
        let payload_size_u32 =
            u32::try_from(payload_size).map_err(|_| CodecError::MalformedPayload {
                reason: format!("payload size {payload_size} exceeds u32"),
            })?;
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload_size);
        if include_header {
            let header = Header {
                major: self.major,
                minor: self.minor,
                ty: self.ty,
                id: self.id,
                payload_size: payload_size_u32,
            };
            header.encode_into(&mut buf);
        }
        for element in &self.elements {
            element.encode_into(&mut buf);
        }
        Ok(buf.freeze())
    }

    /// Parse a full header-plus-payload buffer.
    pub fn parse(bytes: &[u8]) -> Result<Msg, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::MalformedHeader {
                reason: format!("expected {HEADER_LEN} bytes, got {}", bytes.len()),
            });
        }
        let header = Header::parse(&bytes[..HEADER_LEN])?;
        let payload = &bytes[HEADER_LEN..];
        if payload.len() != header.payload_size as usize {
            return Err(CodecError::MalformedPayload {
                reason: format!(
                    "header claims {} payload bytes, got {}",
                    header.payload_size,
                    payload.len()
                ),
            });
        }
        Ok(Msg::from_parts(header, parse_payload(payload)?))
    }
}

/// Parse a payload buffer into its elements. Reads to the end of the buffer;
/// truncation mid-element is an error.
pub fn parse_payload(mut bytes: &[u8]) -> Result<Vec<Element>, CodecError> {
    let mut elements = Vec::new();
    while !bytes.is_empty() {
        elements.push(Element::decode(&mut bytes)?);
    }
    Ok(elements)
}
