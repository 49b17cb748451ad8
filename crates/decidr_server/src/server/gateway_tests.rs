#![forbid(unsafe_code)]

use std::time::Duration;

use decidr_domain::{ErrorCode, MessageType};
use decidr_protocol::{ClientEvent, GroupTarget, SendMessagePayload, ServerEvent};

use crate::server::auth::{TOKEN_KIND_REFRESH, TokenSigner, TokenVerifier};
use crate::server::gateway::{CommandRateLimiter, GatewaySettings};
use crate::server::testutil::{
	TEST_PRIVATE_KEY_PEM, TEST_PUBLIC_KEY_PEM, dispatcher_for, drain, gid, recv, seeded_core, uid,
};

fn send_event(group_id: &str, content: &str) -> ClientEvent {
	ClientEvent::SendMessage(SendMessagePayload {
		group_id: group_id.to_string(),
		content: content.to_string(),
		kind: MessageType::Text,
		reply_to_id: None,
	})
}

#[tokio::test]
async fn single_session_join_send_leave() {
	let core = seeded_core().await;
	let (alice, mut alice_rx) = dispatcher_for(&core, "alice").await;

	alice.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	match recv(&mut alice_rx).await {
		ServerEvent::JoinedGroupSuccess {
			group_id,
			member_count,
		} => {
			assert_eq!(group_id, "g1");
			assert_eq!(member_count, 1);
		}
		other => panic!("expected joined_group_success, got {other:?}"),
	}

	alice.dispatch(send_event("g1", "hi")).await;
	match recv(&mut alice_rx).await {
		ServerEvent::MessageReceived(message) => {
			assert_eq!(message.content, "hi");
			assert_eq!(message.sender_id, "alice");
			assert_eq!(message.user.name, "Alice Johnson");
		}
		other => panic!("expected message_received, got {other:?}"),
	}

	alice.dispatch(ClientEvent::LeaveGroup("g1".to_string())).await;
	match recv(&mut alice_rx).await {
		ServerEvent::LeftGroupSuccess {
			group_id,
			member_count,
		} => {
			assert_eq!(group_id, "g1");
			assert_eq!(member_count, 0);
		}
		other => panic!("expected left_group_success, got {other:?}"),
	}

	assert!(drain(&mut alice_rx).is_empty());
}

#[tokio::test]
async fn non_member_join_gets_a_forbidden_error_and_no_broadcasts() {
	let core = seeded_core().await;
	let (carol, mut carol_rx) = dispatcher_for(&core, "carol").await;

	carol.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	match recv(&mut carol_rx).await {
		ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
		other => panic!("expected error, got {other:?}"),
	}

	// A failed join leaves the client unjoined: a later room broadcast must
	// not reach it.
	let (alice, mut alice_rx) = dispatcher_for(&core, "alice").await;
	alice.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	let _ = drain(&mut alice_rx);
	alice.dispatch(send_event("g1", "members only")).await;

	assert!(drain(&mut carol_rx).is_empty());
}

#[tokio::test]
async fn unauthorized_send_reports_forbidden_without_fanout() {
	let core = seeded_core().await;
	let (bob, mut bob_rx) = dispatcher_for(&core, "bob").await;
	bob.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	let _ = drain(&mut bob_rx);

	let (carol, mut carol_rx) = dispatcher_for(&core, "carol").await;
	carol.dispatch(send_event("g1", "sneak")).await;

	match recv(&mut carol_rx).await {
		ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
		other => panic!("expected error, got {other:?}"),
	}
	assert!(drain(&mut bob_rx).is_empty());
}

#[tokio::test]
async fn multi_session_edges_as_seen_by_an_observer() {
	let core = seeded_core().await;

	let (bob, mut bob_rx) = dispatcher_for(&core, "bob").await;
	bob.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	let _ = drain(&mut bob_rx);

	// Alice opens S1: Bob sees one user_joined_group.
	let (mut alice_s1, mut alice_s1_rx) = dispatcher_for(&core, "alice").await;
	alice_s1.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	match recv(&mut bob_rx).await {
		ServerEvent::UserJoinedGroup { user_id, .. } => assert_eq!(user_id, "alice"),
		other => panic!("expected user_joined_group, got {other:?}"),
	}

	// Alice opens S2: no new edge.
	let (mut alice_s2, mut alice_s2_rx) = dispatcher_for(&core, "alice").await;
	alice_s2.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	assert!(drain(&mut bob_rx).is_empty());

	// S1 disconnects: still no edge.
	alice_s1.disconnect_sweep().await;
	assert!(drain(&mut bob_rx).is_empty());

	// Sweeping S1 again must not double-notify anything.
	alice_s1.disconnect_sweep().await;
	assert!(drain(&mut bob_rx).is_empty());

	// S2 disconnects: the last-leave edge fires.
	alice_s2.disconnect_sweep().await;
	match recv(&mut bob_rx).await {
		ServerEvent::UserLeftGroup { user_id, .. } => assert_eq!(user_id, "alice"),
		other => panic!("expected user_left_group, got {other:?}"),
	}

	let _ = drain(&mut alice_s1_rx);
	let _ = drain(&mut alice_s2_rx);
}

#[tokio::test]
async fn typing_start_and_stop_reach_only_the_others() {
	let core = seeded_core().await;

	let (alice, mut alice_rx) = dispatcher_for(&core, "alice").await;
	let (bob, mut bob_rx) = dispatcher_for(&core, "bob").await;
	alice.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	bob.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	let _ = drain(&mut alice_rx);
	let _ = drain(&mut bob_rx);

	alice
		.dispatch(ClientEvent::TypingStart(GroupTarget {
			group_id: "g1".to_string(),
		}))
		.await;
	match recv(&mut bob_rx).await {
		ServerEvent::UserTyping {
			user_id, user_name, ..
		} => {
			assert_eq!(user_id, "alice");
			assert_eq!(user_name, "Alice Johnson");
		}
		other => panic!("expected user_typing, got {other:?}"),
	}
	assert!(drain(&mut alice_rx).is_empty());
	assert!(core.presence.is_typing(&gid("g1"), &uid("alice")).await);

	alice
		.dispatch(ClientEvent::TypingStop(GroupTarget {
			group_id: "g1".to_string(),
		}))
		.await;
	match recv(&mut bob_rx).await {
		ServerEvent::UserStoppedTyping { user_id, .. } => assert_eq!(user_id, "alice"),
		other => panic!("expected user_stopped_typing, got {other:?}"),
	}
	assert!(!core.presence.is_typing(&gid("g1"), &uid("alice")).await);
}

#[tokio::test]
async fn typing_requires_membership_and_a_joined_session() {
	let core = seeded_core().await;

	// Member, but not joined.
	let (bob, mut bob_rx) = dispatcher_for(&core, "bob").await;
	bob.dispatch(ClientEvent::TypingStart(GroupTarget {
		group_id: "g1".to_string(),
	}))
	.await;
	match recv(&mut bob_rx).await {
		ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
		other => panic!("expected error, got {other:?}"),
	}

	// Not a member at all.
	let (carol, mut carol_rx) = dispatcher_for(&core, "carol").await;
	carol
		.dispatch(ClientEvent::TypingStart(GroupTarget {
			group_id: "g1".to_string(),
		}))
		.await;
	match recv(&mut carol_rx).await {
		ServerEvent::Error { code, .. } => assert_eq!(code, ErrorCode::Forbidden),
		other => panic!("expected error, got {other:?}"),
	}
}

#[tokio::test]
async fn disconnect_sweep_clears_ghost_typing_indicators() {
	let core = seeded_core().await;

	let (mut alice, mut alice_rx) = dispatcher_for(&core, "alice").await;
	let (bob, mut bob_rx) = dispatcher_for(&core, "bob").await;
	alice.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	bob.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	let _ = drain(&mut alice_rx);
	let _ = drain(&mut bob_rx);

	alice
		.dispatch(ClientEvent::TypingStart(GroupTarget {
			group_id: "g1".to_string(),
		}))
		.await;
	let _ = drain(&mut bob_rx);

	alice.disconnect_sweep().await;

	let bob_events = drain(&mut bob_rx);
	assert!(
		bob_events
			.iter()
			.any(|e| matches!(e, ServerEvent::UserStoppedTyping { user_id, .. } if user_id == "alice")),
		"expected a user_stopped_typing for alice, got {bob_events:?}"
	);
	assert!(
		bob_events
			.iter()
			.any(|e| matches!(e, ServerEvent::UserLeftGroup { user_id, .. } if user_id == "alice")),
		"expected a user_left_group for alice, got {bob_events:?}"
	);
	assert!(!core.presence.is_typing(&gid("g1"), &uid("alice")).await);
	assert_eq!(core.presence.socket_count(&uid("alice")).await, 0);
}

#[tokio::test]
async fn room_info_lists_distinct_online_users() {
	let core = seeded_core().await;

	let (alice, mut alice_rx) = dispatcher_for(&core, "alice").await;
	let (bob, mut bob_rx) = dispatcher_for(&core, "bob").await;
	alice.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	bob.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	let _ = drain(&mut alice_rx);
	let _ = drain(&mut bob_rx);

	alice
		.dispatch(ClientEvent::GetRoomInfo(GroupTarget {
			group_id: "g1".to_string(),
		}))
		.await;

	match recv(&mut alice_rx).await {
		ServerEvent::RoomMembersUpdate {
			group_id,
			online_members,
			member_count,
		} => {
			assert_eq!(group_id, "g1");
			assert_eq!(online_members, vec!["alice".to_string(), "bob".to_string()]);
			assert_eq!(member_count, 2);
		}
		other => panic!("expected room_members_update, got {other:?}"),
	}
}

#[tokio::test]
async fn history_is_served_over_the_socket() {
	let core = seeded_core().await;

	let (alice, mut alice_rx) = dispatcher_for(&core, "alice").await;
	alice.dispatch(ClientEvent::JoinGroup("g1".to_string())).await;
	let _ = drain(&mut alice_rx);
	alice.dispatch(send_event("g1", "one")).await;
	alice.dispatch(send_event("g1", "two")).await;
	let _ = drain(&mut alice_rx);

	alice
		.dispatch(ClientEvent::GetGroupMessages(decidr_protocol::HistoryQuery {
			group_id: "g1".to_string(),
			limit: None,
			cursor: None,
		}))
		.await;

	match recv(&mut alice_rx).await {
		ServerEvent::GroupMessages(page) => {
			assert_eq!(page.messages.len(), 2);
			assert_eq!(page.messages[0].content, "one");
			assert_eq!(page.messages[1].content, "two");
			assert!(!page.has_next_page);
		}
		other => panic!("expected group_messages, got {other:?}"),
	}
}

#[test]
fn rate_limiter_throttles_only_the_gated_events() {
	let settings = GatewaySettings {
		rate_limit_per_conn_burst: 2,
		rate_limit_per_conn_per_minute: 60,
		..GatewaySettings::default()
	};
	let mut limiter = CommandRateLimiter::new(&settings);

	assert!(limiter.allow(&send_event("g1", "1")));
	assert!(limiter.allow(&send_event("g1", "2")));
	assert!(!limiter.allow(&send_event("g1", "3")), "burst of 2 exhausted");

	// Ungated events pass regardless.
	assert!(limiter.allow(&ClientEvent::GetRoomInfo(GroupTarget {
		group_id: "g1".to_string(),
	})));
}

#[test]
fn rate_limiter_disabled_when_unconfigured() {
	let mut limiter = CommandRateLimiter::new(&GatewaySettings::default());
	for i in 0..100 {
		assert!(limiter.allow(&send_event("g1", &i.to_string())));
	}
}

#[test]
fn access_tokens_verify_and_refresh_tokens_are_rejected() {
	let signer = TokenSigner::from_private_key_pem(TEST_PRIVATE_KEY_PEM.as_bytes()).unwrap();
	let verifier = TokenVerifier::from_public_key_pem(TEST_PUBLIC_KEY_PEM.as_bytes()).unwrap();

	let access = signer
		.issue_access(&uid("alice"), "alice@example.com", Duration::from_secs(600))
		.unwrap();
	let authed = verifier.verify_access(&access).unwrap();
	assert_eq!(authed.user_id, uid("alice"));
	assert_eq!(authed.email, "alice@example.com");

	// Refresh tokens are rejected at the same door.
	let refresh = signer
		.issue(&uid("alice"), "alice@example.com", TOKEN_KIND_REFRESH, Duration::from_secs(600))
		.unwrap();
	assert!(verifier.verify_access(&refresh).is_err());

	// Tampered and empty tokens fail.
	let mut tampered = access.clone();
	tampered.push('x');
	assert!(verifier.verify_access(&tampered).is_err());
	assert!(verifier.verify_access("").is_err());
}
