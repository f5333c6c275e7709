//! Minimal HTTP/1.1 wire codec: request/response heads, materialized bodies,
//! and downstream response serialization.

mod body;
mod line;
mod request;
mod response;

pub(crate) use body::{BodyPlan, read_body};
pub(crate) use line::{read_line_with_timeout, trim_line};
pub(crate) use request::{RequestHead, read_request_head};
pub(crate) use response::{ResponseHead, read_response_head, write_error, write_response};
