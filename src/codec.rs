use bytes::{Buf, BytesMut};
use std::convert::TryInto;
use std::io::Cursor;
use tokio_util::codec::Decoder;

use crate::frame::{ParseError, Reply};
use crate::Error;

/// Turns a buffered byte stream into whole `Reply` frames. A partial frame
/// leaves the buffer untouched and yields `None` until more data arrives.
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let mut cursor = Cursor::new(&src[..]);
        let reply = match Reply::parse(&mut cursor) {
            Ok(reply) => reply,
            Err(ParseError::Incomplete) => return Ok(None), // Not enough data to parse a reply.
            Err(err) => return Err(err.into()),
        };

        let position: usize = cursor
            .position()
            .try_into()
            .map_err(|_| Error::Protocol("reply larger than addressable memory".to_string()))?;

        // Remove the parsed reply from the buffer.
        src.advance(position);

        Ok(Some(reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn decode_whole_reply() {
        let mut codec = ReplyCodec;
        let mut buf = BytesMut::from(&b"$3\r\nbar\r\n"[..]);

        let reply = codec.decode(&mut buf).unwrap();

        assert_eq!(reply, Some(Reply::Bulk(Bytes::from("bar"))));
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_partial_reply_keeps_buffer() {
        let mut codec = ReplyCodec;
        let mut buf = BytesMut::from(&b"$3\r\nba"[..]);

        let reply = codec.decode(&mut buf).unwrap();

        assert_eq!(reply, None);
        assert_eq!(&buf[..], b"$3\r\nba");
    }

    #[test]
    fn decode_consumes_one_reply_at_a_time() {
        let mut codec = ReplyCodec;
        let mut buf = BytesMut::from(&b"+OK\r\n:7\r\n"[..]);

        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Reply::Status("OK".to_string()))
        );
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Reply::Integer(7)));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn decode_malformed_reply_is_an_error() {
        let mut codec = ReplyCodec;
        let mut buf = BytesMut::from(&b"?5\r\n"[..]);

        assert!(matches!(codec.decode(&mut buf), Err(Error::Protocol(_))));
    }
}
