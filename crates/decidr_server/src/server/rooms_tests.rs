#![forbid(unsafe_code)]

use std::time::Duration;

use decidr_protocol::ServerEvent;
use tokio::time::timeout;

use crate::server::presence::PresenceCache;
use crate::server::rooms::RoomManager;
use crate::server::testutil::{drain, gid, recv, session};

fn manager() -> RoomManager {
	RoomManager::new(PresenceCache::in_memory())
}

#[tokio::test]
async fn join_reports_live_session_count() {
	let rooms = manager();
	let g1 = gid("g1");

	let (alice_s1, _alice_rx, _) = session("alice", 8);
	let outcome = rooms.join(&g1, alice_s1, "Alice Johnson").await;
	assert_eq!(outcome.member_count, 1);
	assert!(outcome.first_join);

	let (bob_s1, _bob_rx, _) = session("bob", 8);
	let outcome = rooms.join(&g1, bob_s1, "Bob Stone").await;
	assert_eq!(outcome.member_count, 2);
	assert!(outcome.first_join);
}

#[tokio::test]
async fn first_join_is_broadcast_once_and_never_to_the_joiner() {
	let rooms = manager();
	let g1 = gid("g1");

	let (bob_s1, mut bob_rx, _) = session("bob", 8);
	rooms.join(&g1, bob_s1, "Bob Stone").await;

	// Alice's first session: Bob hears exactly one user_joined_group.
	let (alice_s1, mut alice_rx, _) = session("alice", 8);
	let s1_id = alice_s1.session_id;
	rooms.join(&g1, alice_s1, "Alice Johnson").await;

	match recv(&mut bob_rx).await {
		ServerEvent::UserJoinedGroup {
			user_id, user_name, ..
		} => {
			assert_eq!(user_id, "alice");
			assert_eq!(user_name, "Alice Johnson");
		}
		other => panic!("expected user_joined_group, got {other:?}"),
	}

	// The joiner never hears their own join.
	assert!(drain(&mut alice_rx).is_empty());

	// Alice's second session: no new edge for Bob.
	let (alice_s2, mut alice_rx2, _) = session("alice", 8);
	let s2_id = alice_s2.session_id;
	let outcome = rooms.join(&g1, alice_s2, "Alice Johnson").await;
	assert!(!outcome.first_join);
	assert!(drain(&mut bob_rx).is_empty());

	// First session leaves: still no edge.
	let outcome = rooms.leave(&g1, &s1_id, &alice_rx_user(), "Alice Johnson").await;
	assert!(outcome.was_joined);
	assert!(!outcome.last_leave);
	assert!(drain(&mut bob_rx).is_empty());

	// Second session leaves: the last-leave edge fires exactly once.
	let outcome = rooms.leave(&g1, &s2_id, &alice_rx_user(), "Alice Johnson").await;
	assert!(outcome.last_leave);
	match recv(&mut bob_rx).await {
		ServerEvent::UserLeftGroup { user_id, .. } => assert_eq!(user_id, "alice"),
		other => panic!("expected user_left_group, got {other:?}"),
	}

	// Repeating the leave is a no-op: no double notification.
	let outcome = rooms.leave(&g1, &s2_id, &alice_rx_user(), "Alice Johnson").await;
	assert!(!outcome.was_joined);
	assert!(!outcome.last_leave);
	assert!(drain(&mut bob_rx).is_empty());
	let _ = drain(&mut alice_rx2);
}

fn alice_rx_user() -> decidr_domain::UserId {
	decidr_domain::UserId::new("alice").unwrap()
}

#[tokio::test]
async fn broadcast_respects_exclusion_and_reaches_everyone_else() {
	let rooms = manager();
	let g1 = gid("g1");

	let (alice_s1, mut alice_rx, _) = session("alice", 8);
	let alice_id = alice_s1.session_id;
	let (bob_s1, mut bob_rx, _) = session("bob", 8);
	let (carol_s1, mut carol_rx, _) = session("carol", 8);

	rooms.join(&g1, alice_s1, "Alice Johnson").await;
	rooms.join(&g1, bob_s1, "Bob Stone").await;
	rooms.join(&g1, carol_s1, "Carol Reyes").await;
	let _ = drain(&mut alice_rx);
	let _ = drain(&mut bob_rx);
	let _ = drain(&mut carol_rx);

	rooms
		.broadcast(
			&g1,
			ServerEvent::UserStoppedTyping {
				user_id: "alice".to_string(),
				group_id: "g1".to_string(),
			},
			Some(&alice_id),
		)
		.await;

	assert!(drain(&mut alice_rx).is_empty());
	assert_eq!(drain(&mut bob_rx).len(), 1);
	assert_eq!(drain(&mut carol_rx).len(), 1);
}

#[tokio::test]
async fn full_send_queue_kills_only_the_slow_session() {
	let rooms = manager();
	let g1 = gid("g1");

	// Bob's queue holds a single event and nothing drains it.
	let (bob_s1, _bob_rx, bob_kill) = session("bob", 1);
	let bob_id = bob_s1.session_id;
	let (alice_s1, mut alice_rx, _) = session("alice", 8);

	rooms.join(&g1, bob_s1, "Bob Stone").await;
	rooms.join(&g1, alice_s1, "Alice Johnson").await;

	let event = ServerEvent::UserStoppedTyping {
		user_id: "carol".to_string(),
		group_id: "g1".to_string(),
	};
	rooms.broadcast(&g1, event.clone(), None).await;
	// Bob's join notification already filled his queue of one, so this
	// overflowed and scheduled his disconnect.
	rooms.broadcast(&g1, event.clone(), None).await;

	timeout(Duration::from_millis(250), bob_kill.notified())
		.await
		.expect("expected the overflowing session to be killed");

	// Bob is out of the registry; Alice still receives.
	assert!(!rooms.is_joined(&g1, &bob_id).await);
	rooms.broadcast(&g1, event, None).await;
	assert!(!drain(&mut alice_rx).is_empty());
}

#[tokio::test]
async fn leave_reports_count_after_removal() {
	let rooms = manager();
	let g1 = gid("g1");

	let (alice_s1, _rx, _) = session("alice", 8);
	let alice_id = alice_s1.session_id;
	rooms.join(&g1, alice_s1, "Alice Johnson").await;

	let outcome = rooms.leave(&g1, &alice_id, &alice_rx_user(), "Alice Johnson").await;
	assert!(outcome.was_joined);
	assert_eq!(outcome.member_count, 0);
	assert!(!rooms.is_joined(&g1, &alice_id).await);
}

#[tokio::test]
async fn online_users_reads_the_cache() {
	let rooms = manager();
	let g1 = gid("g1");

	let (alice_s1, _rx_a, _) = session("alice", 8);
	let alice_id = alice_s1.session_id;
	let (bob_s1, _rx_b, _) = session("bob", 8);
	rooms.join(&g1, alice_s1, "Alice Johnson").await;
	rooms.join(&g1, bob_s1, "Bob Stone").await;

	let users = rooms.online_users(&g1).await;
	let names: Vec<String> = users.iter().map(|u| u.to_string()).collect();
	assert_eq!(names, vec!["alice", "bob"]);

	assert_eq!(rooms.groups_of_session(&alice_id).await, vec![g1.clone()]);
}

#[tokio::test]
async fn registry_stays_authoritative_when_the_cache_is_down() {
	use std::sync::Arc;

	use crate::server::presence::PresenceTtls;
	use crate::server::testutil::FailingBackend;

	let degraded = PresenceCache::new(Arc::new(FailingBackend), PresenceTtls::default());
	let rooms = RoomManager::new(degraded);
	let g1 = gid("g1");

	let (alice_s1, mut alice_rx, _) = session("alice", 8);
	let (bob_s1, mut bob_rx, _) = session("bob", 8);
	rooms.join(&g1, alice_s1, "Alice Johnson").await;
	rooms.join(&g1, bob_s1, "Bob Stone").await;

	// No edges can be computed, so no presence notifications fire...
	assert!(drain(&mut alice_rx).is_empty());
	assert!(drain(&mut bob_rx).is_empty());

	// ...but fan-out still works off the in-process registry.
	rooms
		.broadcast(
			&g1,
			ServerEvent::UserStoppedTyping {
				user_id: "alice".to_string(),
				group_id: "g1".to_string(),
			},
			None,
		)
		.await;
	assert_eq!(drain(&mut alice_rx).len(), 1);
	assert_eq!(drain(&mut bob_rx).len(), 1);

	// Room info falls back to the registry view.
	let users = rooms.online_users(&g1).await;
	let names: Vec<String> = users.iter().map(|u| u.to_string()).collect();
	assert_eq!(names, vec!["alice", "bob"]);
}
