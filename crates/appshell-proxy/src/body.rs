//! Single-use response bodies

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream};
use std::fmt;
use std::pin::Pin;

use crate::error::ProxyError;

/// Type alias for a boxed stream of bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProxyError>> + Send>>;

/// A response body that can be read exactly once.
///
/// `Body` is deliberately not `Clone`. Handing a response to the caller and
/// also persisting it requires [`Body::duplicate`], which consumes the body
/// and gives back a replacement plus an owned snapshot of the bytes.
pub struct Body {
    inner: Inner,
}

enum Inner {
    Full(Bytes),
    Stream(ByteStream),
}

impl Body {
    pub fn empty() -> Self {
        Self {
            inner: Inner::Full(Bytes::new()),
        }
    }

    pub fn from_stream(stream: ByteStream) -> Self {
        Self {
            inner: Inner::Stream(stream),
        }
    }

    /// Read the whole body into memory
    pub async fn collect(self) -> Result<Bytes, ProxyError> {
        match self.inner {
            Inner::Full(bytes) => Ok(bytes),
            Inner::Stream(mut stream) => {
                let mut buf = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buf.extend_from_slice(&chunk?);
                }
                Ok(buf.freeze())
            }
        }
    }

    /// Consume the body, returning one body for the caller and a snapshot
    /// of the same bytes for a second consumer
    pub async fn duplicate(self) -> Result<(Body, Bytes), ProxyError> {
        let bytes = self.collect().await?;
        Ok((Body::from(bytes.clone()), bytes))
    }

    pub fn into_stream(self) -> ByteStream {
        match self.inner {
            Inner::Full(bytes) if bytes.is_empty() => Box::pin(stream::empty()),
            Inner::Full(bytes) => Box::pin(stream::once(async move { Ok(bytes) })),
            Inner::Stream(stream) => stream,
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self {
            inner: Inner::Full(bytes),
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Bytes::from(s).into()
    }
}

impl From<&'static str> for Body {
    fn from(s: &'static str) -> Self {
        Bytes::from_static(s.as_bytes()).into()
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            Inner::Full(bytes) => f.debug_tuple("Body::Full").field(&bytes.len()).finish(),
            Inner::Stream(_) => f.write_str("Body::Stream"),
        }
    }
}
