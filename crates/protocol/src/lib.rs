//! # termhub Protocol Library
//!
//! Wire types shared by the termhub daemon and its clients.
//!
//! ## Overview
//!
//! - **Records**: [`SessionInfo`] and [`HistoryRecord`], the shapes the daemon
//!   exposes for live sessions and for its durable history
//! - **Observer messages**: [`ClientMessage`] (inbound) and [`ServerEvent`]
//!   (outbound), JSON objects tagged by `kind`
//! - **Notifications**: [`NotificationRequest`], posted by external hooks to
//!   report a status change for a working directory
//! - **Codec**: text-frame decoding that tells malformed frames apart from
//!   unknown message kinds
//!
//! ## Example Usage
//!
//! ```rust
//! use termhub_protocol::{decode_client_message, ClientMessage, Inbound};
//!
//! let inbound = decode_client_message(r#"{"kind":"input","sessionId":"s1","data":"ls\r"}"#).unwrap();
//! assert_eq!(
//!     inbound,
//!     Inbound::Message(ClientMessage::Input {
//!         session_id: "s1".to_string(),
//!         data: "ls\r".to_string(),
//!     })
//! );
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: Protocol message definitions
//! - [`codec`]: JSON text framing
//! - [`error`]: Error types

pub mod codec;
pub mod error;
pub mod messages;

pub use codec::{decode_client_message, encode_server_event, Inbound, CLIENT_MESSAGE_KINDS};
pub use error::{ProtocolError, Result};
pub use messages::{
    ClientMessage, HistoryRecord, NotificationRequest, NotifyType, ServerEvent, SessionId,
    SessionInfo, SessionStatus,
};
