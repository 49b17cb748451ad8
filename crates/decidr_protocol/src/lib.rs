#![forbid(unsafe_code)]

pub mod events;

pub use events::{
	ClientEvent, DecodeError, GroupTarget, HistoryQuery, InboundFrame, MessagePage, SendMessagePayload, ServerEvent,
	WireAttachment, WireMessage, WireReply, WireReplyUser, WireUser, decode_client_event, encode_server_event,
};

/// Websocket close codes used by the gateway. Every other teardown path
/// simply drops the socket.
pub mod close {
	/// Sent when an inbound frame is not valid JSON.
	pub const PROTOCOL_ERROR: u16 = 1002;
}
