use crate::errors::KvError;

/// Result alias used throughout the crate.
pub type KvResult<T> = Result<T, KvError>;

/// Boxed future alias used for trait-object-friendly async methods.
pub type KvFuture<'a, T> = futures::future::BoxFuture<'a, KvResult<T>>;

/// Internal low-level value enum.
///
/// Responses from the server are parsed into this type by the transport
/// before they reach any of the code in this crate. The wire format itself
/// is not handled here.
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Value {
    /// A nil response from the server.
    Nil,
    /// An integer response.
    Int(i64),
    /// An arbitrary binary data response.
    Data(Vec<u8>),
    /// A nested response of more values.
    Bulk(Vec<Value>),
    /// A status response, such as the `PONG` reply to a ping.
    Status(String),
    /// The server confirmed the command without returning data.
    Okay,
}

impl Value {
    /// Returns true for the literal `PONG` status reply.
    pub fn is_pong(&self) -> bool {
        matches!(self, Value::Status(status) if status == "PONG")
    }
}

/// Tells the transport how replies for a command should be decoded.
///
/// The actual decoding happens in the transport; commands only carry the
/// tag. Probe commands (`AUTH`, `PING`) use [`Codec::Utf8`].
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum Codec {
    /// Keep payloads as raw bytes.
    #[default]
    Raw,
    /// Decode payloads as UTF-8 strings.
    Utf8,
}
