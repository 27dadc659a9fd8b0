//! Subscription token issuance.
//!
//! Each service owns at most one token. Issuance goes through the
//! `DashMap` entry for the service id, so two racing callers serialize on
//! the same shard and the loser reads back the winner's token.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;
use vpn_types::{ServiceId, SubscriptionToken};

/// Random bytes behind every token (256 bits).
pub const TOKEN_BYTES: usize = 32;

/// A fresh URL-safe opaque token string.
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Client identifier derived from a token, used both in rendered stanzas and
/// in client links so the two always agree.
pub fn client_id(token: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, token.as_bytes())
}

#[derive(Debug, Default)]
pub struct TokenIssuer {
    by_service: DashMap<ServiceId, SubscriptionToken>,
    by_token: DashMap<String, ServiceId>,
    last_id: AtomicU64,
}

impl TokenIssuer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_tokens(tokens: impl IntoIterator<Item = SubscriptionToken>) -> Self {
        let issuer = Self::new();
        for token in tokens {
            issuer.last_id.fetch_max(token.id, Ordering::SeqCst);
            issuer.by_token.insert(token.token.clone(), token.service_id);
            issuer.by_service.insert(token.service_id, token);
        }
        issuer
    }

    pub fn get(&self, service_id: ServiceId) -> Option<SubscriptionToken> {
        self.by_service.get(&service_id).map(|entry| entry.value().clone())
    }

    pub fn service_for(&self, token: &str) -> Option<ServiceId> {
        self.by_token.get(token).map(|entry| *entry.value())
    }

    /// Existing token for the service, or a newly issued one. The flag is
    /// true only for the caller that actually created it.
    pub fn ensure(&self, service_id: ServiceId) -> (SubscriptionToken, bool) {
        match self.by_service.entry(service_id) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let token = self.reserve_unique(service_id);
                let issued = SubscriptionToken {
                    id: self.last_id.fetch_add(1, Ordering::SeqCst) + 1,
                    token,
                    service_id,
                    created_at: Utc::now(),
                };
                entry.insert(issued.clone());
                (issued, true)
            }
        }
    }

    fn reserve_unique(&self, service_id: ServiceId) -> String {
        loop {
            let candidate = generate_token();
            if let Entry::Vacant(slot) = self.by_token.entry(candidate.clone()) {
                slot.insert(service_id);
                return candidate;
            }
        }
    }

    /// Withdraw a token that was issued but never persisted. A slot that
    /// already holds a different token is left alone.
    pub fn discard(&self, token: &SubscriptionToken) {
        let removed = self
            .by_service
            .remove_if(&token.service_id, |_, held| held.token == token.token);
        if removed.is_some() {
            self.by_token.remove(&token.token);
        }
    }

    /// All tokens ordered by id.
    pub fn all(&self) -> Vec<SubscriptionToken> {
        let mut tokens: Vec<SubscriptionToken> =
            self.by_service.iter().map(|entry| entry.value().clone()).collect();
        tokens.sort_by_key(|token| token.id);
        tokens
    }

    pub fn len(&self) -> usize {
        self.by_service.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_service.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_generated_tokens_are_url_safe() {
        let token = generate_token();
        assert_eq!(token.len(), 43);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_ensure_is_idempotent() {
        let issuer = TokenIssuer::new();
        let (first, created) = issuer.ensure(7);
        assert!(created);

        let (second, created_again) = issuer.ensure(7);
        assert!(!created_again);
        assert_eq!(first, second);
        assert_eq!(issuer.service_for(&first.token), Some(7));
    }

    #[test]
    fn test_tokens_are_distinct_across_services() {
        let issuer = TokenIssuer::new();
        let tokens: HashSet<String> = (1..=50).map(|id| issuer.ensure(id).0.token).collect();
        assert_eq!(tokens.len(), 50);

        let ids: Vec<u64> = issuer.all().iter().map(|t| t.id).collect();
        assert_eq!(ids, (1..=50).collect::<Vec<_>>());
    }

    #[test]
    fn test_concurrent_ensure_yields_one_token() {
        let issuer = Arc::new(TokenIssuer::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let issuer = Arc::clone(&issuer);
                std::thread::spawn(move || issuer.ensure(42))
            })
            .collect();

        let results: Vec<(SubscriptionToken, bool)> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        assert!(results.iter().all(|(token, _)| token == &results[0].0));
        assert_eq!(issuer.len(), 1);
    }

    #[test]
    fn test_restored_issuer_continues_ids() {
        let original = TokenIssuer::new();
        original.ensure(1);
        original.ensure(2);

        let restored = TokenIssuer::from_tokens(original.all());
        assert_eq!(restored.get(1), original.get(1));
        let (third, _) = restored.ensure(3);
        assert_eq!(third.id, 3);
    }

    #[test]
    fn test_discard_only_removes_matching_token() {
        let issuer = TokenIssuer::new();
        let (issued, _) = issuer.ensure(5);

        let mut stale = issued.clone();
        stale.token = "someone-else".to_string();
        issuer.discard(&stale);
        assert_eq!(issuer.get(5), Some(issued.clone()));

        issuer.discard(&issued);
        assert!(issuer.get(5).is_none());
        assert!(issuer.service_for(&issued.token).is_none());
    }

    #[test]
    fn test_client_id_is_stable() {
        assert_eq!(client_id("abc"), client_id("abc"));
        assert_ne!(client_id("abc"), client_id("abd"));
    }
}
