use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Pending ACME HTTP-01 tokens and their key authorizations. Written by the
/// ACME provider, read by the challenge responder; entries live for exactly
/// one order.
#[derive(Clone, Default)]
pub struct ChallengeStore {
	inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn add(&self, token: String, key_authorization: String) {
		self.inner.write().insert(token, key_authorization);
	}

	pub fn get(&self, token: &str) -> Option<String> {
		self.inner.read().get(token).cloned()
	}

	pub fn remove(&self, token: &str) {
		self.inner.write().remove(token);
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn add_get_remove() {
		let store = ChallengeStore::new();
		assert_eq!(store.get("tok"), None);
		store.add("tok".to_string(), "tok.abc123".to_string());
		assert_eq!(store.get("tok").as_deref(), Some("tok.abc123"));
		store.remove("tok");
		assert_eq!(store.get("tok"), None);
		// Remove of an absent token is a no-op.
		store.remove("tok");
	}
}
