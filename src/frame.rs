// https://redis.io/docs/reference/protocol-spec

use std::fmt;

use bytes::Buf;
use bytes::Bytes;
use std::io::Cursor;
use thiserror::Error as ThisError;

static CRLF: &[u8; 2] = b"\r\n";

#[derive(Debug, ThisError)]
pub enum ParseError {
    #[error("not enough data is available to parse an entire reply")]
    Incomplete,
    #[error("invalid reply type tag: {0:#04x}")]
    InvalidTag(u8),
    #[error("{0}")]
    Malformed(String),
}

impl From<ParseError> for crate::Error {
    fn from(err: ParseError) -> crate::Error {
        crate::Error::Protocol(err.to_string())
    }
}

/// A single decoded RESP2 reply.
///
/// `Null` stands in for both the nil bulk string (`$-1`) and the nil array
/// (`*-1`); once decoded the two are indistinguishable.
#[derive(Clone, Debug, PartialEq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Reply>),
}

// Replies are framed by a one-byte type tag; the five RESP2 tags are the
// only legal ones on a reply stream. An `-ERR` reply is data at this layer,
// not a decode failure.
impl Reply {
    pub fn parse(src: &mut Cursor<&[u8]>) -> Result<Self, ParseError> {
        let tag = get_byte(src)?;

        match tag {
            b'+' => {
                let bytes = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes)?;
                Ok(Reply::Status(string))
            }
            b'-' => {
                let bytes = get_line(src)?.to_vec();
                let string = String::from_utf8(bytes)?;
                Ok(Reply::Error(string))
            }
            b':' => {
                let integer = get_decimal(src)?;
                Ok(Reply::Integer(integer))
            }
            // $<length>\r\n<data>\r\n
            b'$' => {
                let length = get_decimal(src)?;

                if length == -1 {
                    return Ok(Reply::Null);
                }
                if length < 0 {
                    return Err(ParseError::Malformed(format!(
                        "invalid bulk string length {}",
                        length
                    )));
                }

                let data = get_exact(src, length as usize)?;
                let data = Bytes::from(data.to_vec());
                expect_crlf(src)?;

                Ok(Reply::Bulk(data))
            }
            // *<number-of-elements>\r\n<element-1>...<element-n>
            b'*' => {
                let length = get_decimal(src)?;

                if length == -1 {
                    return Ok(Reply::Null);
                }
                if length < 0 {
                    return Err(ParseError::Malformed(format!(
                        "invalid array length {}",
                        length
                    )));
                }

                let mut replies = Vec::with_capacity(length as usize);
                for _ in 0..length {
                    replies.push(Self::parse(src)?);
                }

                Ok(Reply::Array(replies))
            }
            tag => Err(ParseError::InvalidTag(tag)),
        }
    }

    /// Re-emit the wire form of this reply. Mirrors `parse`; `Null` is
    /// written as a nil bulk string.
    pub fn serialize(&self) -> Vec<u8> {
        match self {
            Reply::Status(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(b'+');
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Reply::Error(s) => {
                let mut bytes = Vec::with_capacity(1 + s.len() + CRLF.len());
                bytes.push(b'-');
                bytes.extend_from_slice(s.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Reply::Integer(i) => {
                let digits = i.to_string();
                let mut bytes = Vec::with_capacity(1 + digits.len() + CRLF.len());
                bytes.push(b':');
                bytes.extend_from_slice(digits.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Reply::Bulk(data) => {
                let length = data.len().to_string();
                let mut bytes =
                    Vec::with_capacity(1 + length.len() + CRLF.len() + data.len() + CRLF.len());
                bytes.push(b'$');
                bytes.extend_from_slice(length.as_bytes());
                bytes.extend_from_slice(CRLF);
                bytes.extend_from_slice(data);
                bytes.extend_from_slice(CRLF);
                bytes
            }
            Reply::Null => b"$-1\r\n".to_vec(),
            Reply::Array(items) => {
                let length = items.len().to_string();
                let mut bytes = Vec::with_capacity(1 + length.len() + CRLF.len());
                bytes.push(b'*');
                bytes.extend_from_slice(length.as_bytes());
                bytes.extend_from_slice(CRLF);
                for item in items {
                    bytes.extend(item.serialize());
                }
                bytes
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Null)
    }

    pub fn as_status(&self) -> Option<&str> {
        match self {
            Reply::Status(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Reply::Bulk(data) => Some(data),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Reply::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Reply]> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Reply>> {
        match self {
            Reply::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Split a flat array of alternating keys and values into ordered pairs.
    ///
    /// `HGETALL`, `CONFIG GET` and the `XINFO` family all reply with this
    /// shape. Keys must be bulk or status strings; order is preserved.
    pub fn into_pairs(self) -> Result<Vec<(Bytes, Reply)>, crate::Error> {
        let items = match self {
            Reply::Array(items) => items,
            Reply::Null => return Ok(Vec::new()),
            other => {
                return Err(crate::Error::Protocol(format!(
                    "expected array of key/value pairs, got {}",
                    other
                )))
            }
        };

        if items.len() % 2 != 0 {
            return Err(crate::Error::Protocol(format!(
                "key/value array has odd length {}",
                items.len()
            )));
        }

        let mut pairs = Vec::with_capacity(items.len() / 2);
        let mut iter = items.into_iter();
        while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
            let key = match key {
                Reply::Bulk(data) => data,
                Reply::Status(s) => Bytes::from(s),
                other => {
                    return Err(crate::Error::Protocol(format!(
                        "expected string key in key/value array, got {}",
                        other
                    )))
                }
            };
            pairs.push((key, value));
        }

        Ok(pairs)
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "+{}", s),
            Reply::Error(s) => write!(f, "-{}", s),
            Reply::Integer(i) => write!(f, ":{}", i),
            Reply::Bulk(data) => write!(f, "${}", String::from_utf8_lossy(data)),
            Reply::Null => write!(f, "$-1"),
            Reply::Array(items) => {
                write!(f, "*{}", items.len())?;
                for item in items {
                    write!(f, " {}", item)?;
                }
                Ok(())
            }
        }
    }
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    let end = src.get_ref().len();

    let line_end = src.get_ref()[start..end]
        .windows(2)
        .position(|window| window == CRLF)
        .ok_or(ParseError::Incomplete)
        .map(|index| start + index)?;

    src.set_position((line_end + CRLF.len()) as u64);

    Ok(&src.get_ref()[start..line_end])
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, ParseError> {
    let line = get_line(src)?;
    let digits = std::str::from_utf8(line)
        .map_err(|_| ParseError::Malformed("non-UTF-8 integer".to_string()))?;

    digits
        .parse::<i64>()
        .map_err(|_| ParseError::Malformed(format!("invalid integer {:?}", digits)))
}

fn get_exact<'a>(src: &mut Cursor<&'a [u8]>, n: usize) -> Result<&'a [u8], ParseError> {
    let start = src.position() as usize;
    if start + n > src.get_ref().len() {
        return Err(ParseError::Incomplete);
    }
    src.set_position((start + n) as u64);
    Ok(&src.get_ref()[start..start + n])
}

fn expect_crlf(src: &mut Cursor<&[u8]>) -> Result<(), ParseError> {
    let terminator = get_exact(src, 2)?;
    if terminator != CRLF {
        return Err(ParseError::Malformed(
            "bulk string not terminated by CRLF".to_string(),
        ));
    }
    Ok(())
}

fn get_byte(src: &mut Cursor<&[u8]>) -> Result<u8, ParseError> {
    if !src.has_remaining() {
        return Err(ParseError::Incomplete);
    }
    Ok(src.get_u8())
}

impl From<std::string::FromUtf8Error> for ParseError {
    fn from(_src: std::string::FromUtf8Error) -> ParseError {
        ParseError::Malformed("invalid UTF-8 in reply".to_string())
    }
}
