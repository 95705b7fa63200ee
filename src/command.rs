use bytes::{BufMut, Bytes, BytesMut};

/// Commands the server accepts while a connection is in subscriber mode.
static PUBSUB_ALLOWED: &[&str] = &[
    "SUBSCRIBE",
    "UNSUBSCRIBE",
    "PSUBSCRIBE",
    "PUNSUBSCRIBE",
    "PING",
    "QUIT",
];

/// An outbound command: an ordered list of byte-string tokens, the first of
/// which is the command name. Token bytes are written to the wire verbatim;
/// case is preserved as submitted.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    tokens: Vec<Bytes>,
}

impl Command {
    pub fn new(name: impl ToArg) -> Command {
        Command {
            tokens: vec![name.to_arg()],
        }
    }

    pub fn arg(mut self, arg: impl ToArg) -> Command {
        self.tokens.push(arg.to_arg());
        self
    }

    pub fn args<A: ToArg>(mut self, args: impl IntoIterator<Item = A>) -> Command {
        self.tokens.extend(args.into_iter().map(|a| a.to_arg()));
        self
    }

    pub fn tokens(&self) -> &[Bytes] {
        &self.tokens
    }

    /// The command name, uppercased. Used for admission checks only; the
    /// wire carries the name as submitted.
    pub fn name(&self) -> String {
        self.tokens
            .first()
            .map(|name| String::from_utf8_lossy(name).to_ascii_uppercase())
            .unwrap_or_default()
    }

    pub(crate) fn is_pubsub_allowed(&self) -> bool {
        let name = self.name();
        PUBSUB_ALLOWED.contains(&name.as_str())
    }

    pub(crate) fn is_subscription(&self) -> bool {
        matches!(
            self.name().as_str(),
            "SUBSCRIBE" | "PSUBSCRIBE" | "UNSUBSCRIBE" | "PUNSUBSCRIBE"
        )
    }

    /// Write the inline multi-bulk request form:
    /// `*<N>\r\n$<len0>\r\n<tok0>\r\n...$<lenN-1>\r\n<tokN-1>\r\n`.
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(b'*');
        buf.put_slice(self.tokens.len().to_string().as_bytes());
        buf.put_slice(b"\r\n");

        for token in &self.tokens {
            buf.put_u8(b'$');
            buf.put_slice(token.len().to_string().as_bytes());
            buf.put_slice(b"\r\n");
            buf.put_slice(token);
            buf.put_slice(b"\r\n");
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.write_to(&mut buf);
        buf.freeze()
    }
}

/// Conversion of argument values into wire tokens. Byte slices are the base
/// case; everything string-like funnels through them, numbers become their
/// ASCII decimal form, and references delegate to whatever they point at.
pub trait ToArg {
    fn to_arg(&self) -> Bytes;
}

impl ToArg for [u8] {
    fn to_arg(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl ToArg for str {
    fn to_arg(&self) -> Bytes {
        self.as_bytes().to_arg()
    }
}

impl ToArg for Bytes {
    fn to_arg(&self) -> Bytes {
        self.clone()
    }
}

impl ToArg for Vec<u8> {
    fn to_arg(&self) -> Bytes {
        self.as_slice().to_arg()
    }
}

impl ToArg for String {
    fn to_arg(&self) -> Bytes {
        self.as_str().to_arg()
    }
}

impl<T: ToArg + ?Sized> ToArg for &T {
    fn to_arg(&self) -> Bytes {
        (**self).to_arg()
    }
}

macro_rules! to_arg_via_decimal {
    ($($t:ty),*) => {
        $(
            impl ToArg for $t {
                fn to_arg(&self) -> Bytes {
                    Bytes::from(self.to_string())
                }
            }
        )*
    };
}

to_arg_via_decimal!(i8, i16, i32, i64, u8, u16, u32, u64, usize, f32, f64);
