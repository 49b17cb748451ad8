#![forbid(unsafe_code)]

use chrono::{TimeZone, Utc};
use decidr_domain::{ErrorCode, MessageType};
use decidr_protocol::{
	ClientEvent, DecodeError, InboundFrame, ServerEvent, WireMessage, WireReply, WireReplyUser, WireUser,
	decode_client_event, encode_server_event,
};

#[test]
fn decodes_join_group_with_bare_string_payload() {
	let frame = decode_client_event(r#"{"event":"join_group","data":"g1"}"#).expect("decode");
	match frame {
		InboundFrame::Event(ClientEvent::JoinGroup(group)) => assert_eq!(group, "g1"),
		other => panic!("unexpected frame: {other:?}"),
	}
}

#[test]
fn decodes_send_message_with_defaults() {
	let frame = decode_client_event(r#"{"event":"send_message","data":{"groupId":"g1","content":"hi"}}"#).expect("decode");
	match frame {
		InboundFrame::Event(ClientEvent::SendMessage(msg)) => {
			assert_eq!(msg.group_id, "g1");
			assert_eq!(msg.content, "hi");
			assert_eq!(msg.kind, MessageType::Text);
			assert!(msg.reply_to_id.is_none());
		}
		other => panic!("unexpected frame: {other:?}"),
	}
}

#[test]
fn decodes_send_message_with_reply_and_type() {
	let frame = decode_client_event(
		r#"{"event":"send_message","data":{"groupId":"g1","content":"re:","type":"IMAGE","replyToId":"m42"}}"#,
	)
	.expect("decode");
	match frame {
		InboundFrame::Event(ClientEvent::SendMessage(msg)) => {
			assert_eq!(msg.kind, MessageType::Image);
			assert_eq!(msg.reply_to_id.as_deref(), Some("m42"));
		}
		other => panic!("unexpected frame: {other:?}"),
	}
}

#[test]
fn decodes_history_query_with_cursor() {
	let frame = decode_client_event(
		r#"{"event":"get_group_messages","data":{"groupId":"g1","limit":50,"cursor":"m071"}}"#,
	)
	.expect("decode");
	match frame {
		InboundFrame::Event(ClientEvent::GetGroupMessages(q)) => {
			assert_eq!(q.limit, Some(50));
			assert_eq!(q.cursor.as_deref(), Some("m071"));
		}
		other => panic!("unexpected frame: {other:?}"),
	}
}

#[test]
fn unknown_event_is_surfaced_not_an_error() {
	let frame = decode_client_event(r#"{"event":"send_reaction","data":{"emoji":"x"}}"#).expect("decode");
	match frame {
		InboundFrame::Unknown(name) => assert_eq!(name, "send_reaction"),
		other => panic!("unexpected frame: {other:?}"),
	}
}

#[test]
fn malformed_json_is_a_close_worthy_error() {
	let err = decode_client_event("not json at all").unwrap_err();
	assert!(matches!(err, DecodeError::Malformed(_)), "got: {err:?}");

	let err = decode_client_event(r#"["event","join_group"]"#).unwrap_err();
	assert!(matches!(err, DecodeError::Malformed(_)), "got: {err:?}");
}

#[test]
fn known_event_with_bad_payload_is_a_payload_error() {
	let err = decode_client_event(r#"{"event":"send_message","data":{"content":42}}"#).unwrap_err();
	match err {
		DecodeError::Payload { event, .. } => assert_eq!(event, "send_message"),
		other => panic!("unexpected error: {other:?}"),
	}
}

#[test]
fn server_events_use_camel_case_keys() {
	let ev = ServerEvent::UserJoinedGroup {
		user_id: "alice".into(),
		user_name: "Alice Johnson".into(),
		group_id: "g1".into(),
		member_count: 3,
	};
	let json = encode_server_event(&ev).expect("encode");
	let value: serde_json::Value = serde_json::from_str(&json).unwrap();

	assert_eq!(value["event"], "user_joined_group");
	assert_eq!(value["data"]["userId"], "alice");
	assert_eq!(value["data"]["userName"], "Alice Johnson");
	assert_eq!(value["data"]["memberCount"], 3);
}

#[test]
fn error_event_carries_code_string() {
	let ev = ServerEvent::Error {
		message: "not a member of this group".into(),
		code: ErrorCode::Forbidden,
	};
	let json = encode_server_event(&ev).expect("encode");
	let value: serde_json::Value = serde_json::from_str(&json).unwrap();
	assert_eq!(value["event"], "error");
	assert_eq!(value["data"]["code"], "FORBIDDEN");
}

#[test]
fn hydrated_message_roundtrip() {
	let created_at = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
	let ev = ServerEvent::MessageReceived(WireMessage {
		id: "01J0".into(),
		content: "hi".into(),
		kind: MessageType::Text,
		sender_id: "alice".into(),
		group_id: "g1".into(),
		reply_to_id: Some("01H9".into()),
		created_at,
		user: WireUser {
			id: "alice".into(),
			name: "Alice Johnson".into(),
			email: "alice@example.com".into(),
			image: None,
		},
		reply_to: Some(WireReply {
			id: "01H9".into(),
			content: "earlier".into(),
			user: WireReplyUser {
				id: "bob".into(),
				name: "Bob".into(),
			},
		}),
		attachments: Vec::new(),
	});

	let json = encode_server_event(&ev).expect("encode");
	let value: serde_json::Value = serde_json::from_str(&json).unwrap();
	assert_eq!(value["data"]["senderId"], "alice");
	assert_eq!(value["data"]["type"], "TEXT");
	assert_eq!(value["data"]["replyTo"]["user"]["name"], "Bob");
	// ISO 8601 timestamp on the wire.
	assert!(value["data"]["createdAt"].as_str().unwrap().starts_with("2025-06-01T12:00:00"));
	// Empty attachment lists are omitted.
	assert!(value["data"].get("attachments").is_none());

	let back: ServerEvent = serde_json::from_str(&json).unwrap();
	assert_eq!(back, ev);
}
