//! Byte stream handed between transports and handlers

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte pipe a transport can produce
pub trait StreamIo: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> StreamIo for T {}

/// Connection as seen by handlers; they never name the socket type.
pub type Stream = Box<dyn StreamIo + Unpin + Send>;

pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: StreamIo + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}
