pub mod forwarder;
pub mod response;

pub use forwarder::Forwarder;
pub use response::{error_reply, validate_reply};
