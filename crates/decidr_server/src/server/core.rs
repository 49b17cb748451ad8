#![forbid(unsafe_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use decidr_store::ChatStore;

use crate::server::auth::{AuthOracle, TokenVerifier};
use crate::server::gateway::GatewaySettings;
use crate::server::messages::MessagePipeline;
use crate::server::presence::PresenceCache;
use crate::server::rooms::RoomManager;

/// Readiness flag served by `/readyz`.
#[derive(Clone, Default)]
pub struct HealthState {
	ready: Arc<AtomicBool>,
}

impl HealthState {
	pub fn new() -> Self {
		Self {
			ready: Arc::new(AtomicBool::new(false)),
		}
	}

	pub fn mark_ready(&self) {
		self.ready.store(true, Ordering::Relaxed);
	}

	pub fn is_ready(&self) -> bool {
		self.ready.load(Ordering::Relaxed)
	}
}

/// Everything the gateway and the REST veneer share.
#[derive(Clone)]
pub struct ChatCore {
	pub store: Arc<dyn ChatStore>,
	pub oracle: AuthOracle,
	pub presence: PresenceCache,
	pub rooms: RoomManager,
	pub pipeline: MessagePipeline,
	pub verifier: Arc<TokenVerifier>,
	pub settings: GatewaySettings,
	pub health: HealthState,
}

impl ChatCore {
	pub fn new(
		store: Arc<dyn ChatStore>,
		presence: PresenceCache,
		verifier: Arc<TokenVerifier>,
		settings: GatewaySettings,
	) -> Self {
		let oracle = AuthOracle::new(Arc::clone(&store));
		let rooms = RoomManager::new(presence.clone());
		let pipeline = MessagePipeline::new(Arc::clone(&store), oracle.clone(), rooms.clone(), presence.clone());

		Self {
			store,
			oracle,
			presence,
			rooms,
			pipeline,
			verifier,
			settings,
			health: HealthState::new(),
		}
	}
}
