use std::collections::HashMap;

use bytes::Bytes;

/// Arbitrary header value carried alongside a payload.
pub type HeaderValue = serde_json::Value;

/// Header name to value mapping. Ordering carries no meaning.
pub type Headers = HashMap<String, HeaderValue>;

/// The two payload representations that may cross the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bytes(Bytes),
    Text(String),
}

impl Payload {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => text.as_bytes(),
        }
    }

    /// Raw content of the payload; text is encoded as UTF-8.
    #[must_use]
    pub fn into_bytes(self) -> Bytes {
        match self {
            Self::Bytes(bytes) => bytes,
            Self::Text(text) => Bytes::from(text),
        }
    }
}

impl From<Bytes> for Payload {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&'static [u8]> for Payload {
    fn from(value: &'static [u8]) -> Self {
        Self::Bytes(Bytes::from_static(value))
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

/// A payload plus its headers, as received from the guest.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    payload: Payload,
    headers: Headers,
}

impl Message {
    #[must_use]
    pub const fn new(payload: Payload, headers: Headers) -> Self {
        Self { payload, headers }
    }

    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    #[must_use]
    pub const fn headers(&self) -> &Headers {
        &self.headers
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&HeaderValue> {
        self.headers.get(name)
    }

    /// Header value when it is a string.
    #[must_use]
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(HeaderValue::as_str)
    }

    #[must_use]
    pub fn into_parts(self) -> (Payload, Headers) {
        (self.payload, self.headers)
    }
}
