//! Tagged payload elements.

use bytes::{BufMut, BytesMut};

use super::CodecError;

/// Wire tag of a payload element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementTag {
    U32,
    U64,
    Str,
    Bin,
}

impl ElementTag {
    pub fn wire_value(self) -> u8 {
        match self {
            ElementTag::U32 => 1,
            ElementTag::U64 => 2,
            ElementTag::Str => 3,
            ElementTag::Bin => 4,
        }
    }

    fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(ElementTag::U32),
            2 => Some(ElementTag::U64),
            3 => Some(ElementTag::Str),
            4 => Some(ElementTag::Bin),
            _ => None,
        }
    }
}

/// A single payload element.
///
/// Strings are historical Latin-1 text carried as raw bytes; the codec
/// preserves them exactly and never applies Unicode normalization. Empty
/// strings and byte strings substitute for null.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Element {
    U32(u32),
    U64(u64),
    Str(Vec<u8>),
    Bin(Vec<u8>),
}

impl Element {
    /// String element from UTF-8 text. Callers holding Latin-1 bytes should
    /// construct `Element::Str` directly.
    pub fn str_from(text: &str) -> Self {
        Element::Str(text.as_bytes().to_vec())
    }

    pub fn tag(&self) -> ElementTag {
        match self {
            Element::U32(_) => ElementTag::U32,
            Element::U64(_) => ElementTag::U64,
            Element::Str(_) => ElementTag::Str,
            Element::Bin(_) => ElementTag::Bin,
        }
    }

    /// Encoded size in bytes, tag included.
    pub fn wire_size(&self) -> usize {
        match self {
            Element::U32(_) => 5,
            Element::U64(_) => 9,
            Element::Str(b) | Element::Bin(b) => 5 + b.len(),
        }
    }

    pub fn as_u32(&self) -> Result<u32, CodecError> {
        match self {
            Element::U32(v) => Ok(*v),
            other => Err(mismatch(ElementTag::U32, other)),
        }
    }

    pub fn as_u64(&self) -> Result<u64, CodecError> {
        match self {
            Element::U64(v) => Ok(*v),
            other => Err(mismatch(ElementTag::U64, other)),
        }
    }

    pub fn as_str(&self) -> Result<&[u8], CodecError> {
        match self {
            Element::Str(b) => Ok(b),
            other => Err(mismatch(ElementTag::Str, other)),
        }
    }

    pub fn as_bin(&self) -> Result<&[u8], CodecError> {
        match self {
            Element::Bin(b) => Ok(b),
            other => Err(mismatch(ElementTag::Bin, other)),
        }
    }

    pub(crate) fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag().wire_value());
        match self {
            Element::U32(v) => buf.put_u32(*v),
            Element::U64(v) => buf.put_u64(*v),
            Element::Str(b) | Element::Bin(b) => {
                buf.put_u32(b.len() as u32);
                buf.put_slice(b);
            }
        }
    }

    /// Decode one element from the front of `input`, advancing it.
    pub(crate) fn decode(input: &mut &[u8]) -> Result<Element, CodecError> {
        let tag_byte = take(input, 1)?[0];
        let tag = ElementTag::from_wire(tag_byte).ok_or_else(|| CodecError::MalformedPayload {
            reason: format!("unknown element tag {tag_byte}"),
        })?;
        match tag {
            ElementTag::U32 => Ok(Element::U32(read_u32(input)?)),
            ElementTag::U64 => Ok(Element::U64(read_u64(input)?)),
            ElementTag::Str => Ok(Element::Str(read_bytes(input)?)),
            ElementTag::Bin => Ok(Element::Bin(read_bytes(input)?)),
        }
    }
}

fn mismatch(requested: ElementTag, actual: &Element) -> CodecError {
    CodecError::TypeMismatch {
        requested,
        actual: actual.tag(),
    }
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> Result<&'a [u8], CodecError> {
    if input.len() < n {
        return Err(CodecError::MalformedPayload {
            reason: format!("truncated element: need {n} bytes, have {}", input.len()),
        });
    }
    let (head, rest) = input.split_at(n);
    *input = rest;
    Ok(head)
}

fn read_u32(input: &mut &[u8]) -> Result<u32, CodecError> {
    let bytes = take(input, 4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn read_u64(input: &mut &[u8]) -> Result<u64, CodecError> {
    let bytes = take(input, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(bytes);
    Ok(u64::from_be_bytes(raw))
}

fn read_bytes(input: &mut &[u8]) -> Result<Vec<u8>, CodecError> {
    let len = read_u32(input)? as usize;
    Ok(take(input, len)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_sizes() {
        assert_eq!(Element::U32(7).wire_size(), 5);
        assert_eq!(Element::U64(7).wire_size(), 9);
        assert_eq!(Element::Str(b"abc".to_vec()).wire_size(), 8);
        assert_eq!(Element::Bin(Vec::new()).wire_size(), 5);
    }

    #[test]
    fn accessor_mismatch_reports_both_tags() {
        let err = Element::U64(1).as_u32().unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                requested: ElementTag::U32,
                actual: ElementTag::U64,
            }
        );
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut input: &[u8] = &[9, 0, 0, 0, 0];
        let err = Element::decode(&mut input).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload { .. }));
    }

    #[test]
    fn decode_rejects_truncated_string() {
        // Claims 10 bytes of text, provides 2.
        let mut input: &[u8] = &[3, 0, 0, 0, 10, b'h', b'i'];
        let err = Element::decode(&mut input).unwrap_err();
        assert!(matches!(err, CodecError::MalformedPayload { .. }));
    }

    #[test]
    fn latin1_bytes_survive_unchanged() {
        let raw = vec![0x68, 0xE9, 0x6C, 0x6C, 0x6F];
        let el = Element::Str(raw.clone());
        let mut buf = BytesMut::new();
        el.encode_into(&mut buf);
        let mut input: &[u8] = &buf;
        let decoded = Element::decode(&mut input).unwrap();
        assert_eq!(decoded.as_str().unwrap(), raw.as_slice());
    }
}
