//! Minimal HTTP/1.1 Surface
//!
//! Just enough HTTP for a load engine: building one request buffer up front
//! ([`request`]) and counting complete responses out of a raw read buffer
//! ([`response`]). There is no header map, no status handling, no body
//! delivery: responses are framed, counted and thrown away.

pub mod request;
pub mod response;

pub use request::build_request;
pub use response::{scan_responses, ParseError, Scan, TransferMode};
