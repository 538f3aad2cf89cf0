//! Wire types exchanged over the request and response channels.
//!
//! ## Module Structure
//!
//! - `correlation_id` - CorrelationId type linking a request to its response
//! - `request` - Request envelope published on the request channel
//! - `response` - Response envelope consumed from the response channel

mod correlation_id;
mod request;
mod response;

pub use correlation_id::CorrelationId;
pub use request::{Request, RequestOptions};
pub use response::{Broadcast, Response};
