//! # parley-shared
//!
//! Types shared by the store and the server: identities, the JSON wire
//! protocol, the stored message models and the content filter.

pub mod constants;
pub mod error;
pub mod filter;
pub mod protocol;
pub mod types;

pub use error::ChatError;
pub use filter::ContentFilter;
pub use protocol::{BroadcastMessage, ClientEvent, MessageStatus, PrivateMessage, ServerEvent};
pub use types::{local_timestamp, ConnectionId, MessageId, Username};
