//! HTTP/1.1 request parsing and response assembly.

pub mod request;
pub mod response;

pub use request::{ParseError, Request};
pub use response::{Body, Response};
