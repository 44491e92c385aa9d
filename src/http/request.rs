//! Request construction.
//!
//! The request is built exactly once per run and shared by every peer as a
//! cheaply-cloned `Bytes`. Extra header lines from the configuration are
//! appended verbatim, in order, with no validation; the operator asked for
//! them literally.

use crate::config::Endpoint;
use bytes::{BufMut, Bytes, BytesMut};

/// Builds the GET request sent on every cycle.
pub fn build_request(endpoint: &Endpoint, headers: &[String]) -> Bytes {
    let mut buf = BytesMut::with_capacity(256 + headers.iter().map(|h| h.len() + 2).sum::<usize>());
    buf.put_slice(b"GET ");
    buf.put_slice(endpoint.path.as_bytes());
    buf.put_slice(b" HTTP/1.1\r\nHost: ");
    buf.put_slice(endpoint.host.as_bytes());
    buf.put_slice(b"\r\n");
    for header in headers {
        buf.put_slice(header.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
    buf.freeze()
}
