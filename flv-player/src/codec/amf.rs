//! AMF0 decoding for FLV script data tags

use bytes::Buf;

use crate::errors::CodecError;

const MAX_DEPTH: usize = 32;

const NUMBER: u8 = 0x00;
const BOOLEAN: u8 = 0x01;
const STRING: u8 = 0x02;
const OBJECT: u8 = 0x03;
const NULL: u8 = 0x05;
const UNDEFINED: u8 = 0x06;
const ECMA_ARRAY: u8 = 0x08;
const OBJECT_END: u8 = 0x09;
const STRICT_ARRAY: u8 = 0x0A;
const DATE: u8 = 0x0B;
const LONG_STRING: u8 = 0x0C;

#[derive(Debug, Clone, PartialEq)]
pub enum AmfValue {
    Number(f64),
    Boolean(bool),
    String(String),
    Object(Vec<(String, AmfValue)>),
    Null,
    Undefined,
    EcmaArray(Vec<(String, AmfValue)>),
    StrictArray(Vec<AmfValue>),
    /// Milliseconds since the epoch
    Date(f64),
}

impl AmfValue {
    /// Property lookup on objects and ECMA arrays
    pub fn get(&self, key: &str) -> Option<&AmfValue> {
        match self {
            AmfValue::Object(props) | AmfValue::EcmaArray(props) => {
                props.iter().find(|(k, _)| k == key).map(|(_, v)| v)
            }
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AmfValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[AmfValue]> {
        match self {
            AmfValue::StrictArray(items) => Some(items),
            _ => None,
        }
    }

    /// Numbers of a strict array; `None` if any element is not a number
    pub fn as_numbers(&self) -> Option<Vec<f64>> {
        self.as_array()?.iter().map(AmfValue::as_f64).collect()
    }
}

/// Decode a script tag body: the event name followed by its value
pub fn decode_script_data(mut data: &[u8]) -> Result<(String, AmfValue), CodecError> {
    let name = match read_value(&mut data, 0)? {
        AmfValue::String(name) => name,
        other => {
            return Err(CodecError::Amf {
                reason: format!("script data name is not a string: {:?}", other),
            })
        }
    };
    let value = read_value(&mut data, 0)?;
    Ok((name, value))
}

fn need(buf: &[u8], n: usize, what: &str) -> Result<(), CodecError> {
    if buf.remaining() < n {
        return Err(CodecError::Amf {
            reason: format!("truncated {} ({} of {} bytes)", what, buf.remaining(), n),
        });
    }
    Ok(())
}

fn read_utf8(buf: &mut &[u8], len: usize) -> Result<String, CodecError> {
    need(buf, len, "string")?;
    let text = String::from_utf8_lossy(&buf[..len]).into_owned();
    buf.advance(len);
    Ok(text)
}

fn read_short_string(buf: &mut &[u8]) -> Result<String, CodecError> {
    need(buf, 2, "string length")?;
    let len = buf.get_u16() as usize;
    read_utf8(buf, len)
}

fn read_properties(buf: &mut &[u8], depth: usize) -> Result<Vec<(String, AmfValue)>, CodecError> {
    let mut props = Vec::new();
    loop {
        // Some muxers drop the end marker at the very end of the tag
        if buf.remaining() == 0 {
            return Ok(props);
        }
        let key = read_short_string(buf)?;
        if key.is_empty() && buf.first() == Some(&OBJECT_END) {
            buf.advance(1);
            return Ok(props);
        }
        let value = read_value(buf, depth + 1)?;
        props.push((key, value));
    }
}

fn read_value(buf: &mut &[u8], depth: usize) -> Result<AmfValue, CodecError> {
    if depth > MAX_DEPTH {
        return Err(CodecError::Amf {
            reason: "nesting too deep".to_string(),
        });
    }

    need(buf, 1, "type marker")?;
    let marker = buf.get_u8();
    let value = match marker {
        NUMBER => {
            need(buf, 8, "number")?;
            AmfValue::Number(buf.get_f64())
        }
        BOOLEAN => {
            need(buf, 1, "boolean")?;
            AmfValue::Boolean(buf.get_u8() != 0)
        }
        STRING => AmfValue::String(read_short_string(buf)?),
        OBJECT => AmfValue::Object(read_properties(buf, depth)?),
        NULL => AmfValue::Null,
        UNDEFINED => AmfValue::Undefined,
        ECMA_ARRAY => {
            // The count is a hint only; the end marker terminates the array
            need(buf, 4, "array count")?;
            buf.advance(4);
            AmfValue::EcmaArray(read_properties(buf, depth)?)
        }
        STRICT_ARRAY => {
            need(buf, 4, "array length")?;
            let len = buf.get_u32() as usize;
            let mut items = Vec::with_capacity(len.min(buf.remaining()));
            for _ in 0..len {
                items.push(read_value(buf, depth + 1)?);
            }
            AmfValue::StrictArray(items)
        }
        DATE => {
            need(buf, 10, "date")?;
            let millis = buf.get_f64();
            buf.advance(2); // timezone, unused
            AmfValue::Date(millis)
        }
        LONG_STRING => {
            need(buf, 4, "long string length")?;
            let len = buf.get_u32() as usize;
            AmfValue::String(read_utf8(buf, len)?)
        }
        other => {
            return Err(CodecError::Amf {
                reason: format!("unsupported AMF0 type 0x{:02x}", other),
            })
        }
    };
    Ok(value)
}

#[cfg(test)]
pub(crate) mod encode {
    //! Minimal AMF0 writer for building test fixtures

    use bytes::BufMut;

    pub fn string(out: &mut Vec<u8>, s: &str) {
        out.put_u8(super::STRING);
        key(out, s);
    }

    pub fn key(out: &mut Vec<u8>, s: &str) {
        out.put_u16(s.len() as u16);
        out.put_slice(s.as_bytes());
    }

    pub fn number(out: &mut Vec<u8>, n: f64) {
        out.put_u8(super::NUMBER);
        out.put_f64(n);
    }

    pub fn boolean(out: &mut Vec<u8>, b: bool) {
        out.put_u8(super::BOOLEAN);
        out.put_u8(b as u8);
    }

    pub fn numbers(out: &mut Vec<u8>, values: &[f64]) {
        out.put_u8(super::STRICT_ARRAY);
        out.put_u32(values.len() as u32);
        for v in values {
            number(out, *v);
        }
    }

    pub fn object_start(out: &mut Vec<u8>) {
        out.put_u8(super::OBJECT);
    }

    pub fn ecma_start(out: &mut Vec<u8>, count: u32) {
        out.put_u8(super::ECMA_ARRAY);
        out.put_u32(count);
    }

    pub fn object_end(out: &mut Vec<u8>) {
        out.put_slice(&[0, 0, super::OBJECT_END]);
    }
}

#[cfg(test)]
mod tests {
    use super::encode::*;
    use super::*;

    fn on_metadata_body() -> Vec<u8> {
        let mut out = Vec::new();
        string(&mut out, "onMetaData");
        ecma_start(&mut out, 3);
        key(&mut out, "duration");
        number(&mut out, 12.5);
        key(&mut out, "hasVideo");
        boolean(&mut out, true);
        key(&mut out, "keyframes");
        object_start(&mut out);
        key(&mut out, "times");
        numbers(&mut out, &[0.0, 2.0, 4.0]);
        key(&mut out, "filepositions");
        numbers(&mut out, &[13.0, 900.0, 1800.0]);
        object_end(&mut out);
        object_end(&mut out);
        out
    }

    #[test]
    fn test_decode_on_metadata() {
        let (name, value) = decode_script_data(&on_metadata_body()).unwrap();
        assert_eq!(name, "onMetaData");
        assert_eq!(value.get("duration").and_then(AmfValue::as_f64), Some(12.5));
        assert_eq!(value.get("hasVideo"), Some(&AmfValue::Boolean(true)));

        let keyframes = value.get("keyframes").unwrap();
        assert_eq!(keyframes.get("times").unwrap().as_numbers(), Some(vec![0.0, 2.0, 4.0]));
        assert_eq!(
            keyframes.get("filepositions").unwrap().as_numbers(),
            Some(vec![13.0, 900.0, 1800.0])
        );
    }

    #[test]
    fn test_missing_end_marker_is_tolerated() {
        let mut body = Vec::new();
        string(&mut body, "onMetaData");
        ecma_start(&mut body, 1);
        key(&mut body, "duration");
        number(&mut body, 3.0);

        let (_, value) = decode_script_data(&body).unwrap();
        assert_eq!(value.get("duration").and_then(AmfValue::as_f64), Some(3.0));
    }

    #[test]
    fn test_truncated_number_is_an_error() {
        let mut body = Vec::new();
        string(&mut body, "onMetaData");
        body.extend_from_slice(&[NUMBER, 0x40, 0x09]);
        assert!(matches!(decode_script_data(&body), Err(CodecError::Amf { .. })));
    }

    #[test]
    fn test_non_string_name_is_an_error() {
        let mut body = Vec::new();
        number(&mut body, 1.0);
        assert!(decode_script_data(&body).is_err());
    }

    #[test]
    fn test_unknown_marker_is_an_error() {
        let body = [STRING, 0, 1, b'x', 0x11];
        let err = decode_script_data(&body).unwrap_err();
        assert!(err.to_string().contains("0x11"));
    }

    #[test]
    fn test_null_and_long_string() {
        let mut body = vec![LONG_STRING, 0, 0, 0, 2, b'o', b'k'];
        body.push(NULL);
        let (name, value) = decode_script_data(&body).unwrap();
        assert_eq!(name, "ok");
        assert_eq!(value, AmfValue::Null);
    }
}
