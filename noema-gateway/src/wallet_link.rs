//! Magic-amount wallet-linking flow (§6 `/wallets/initiate`, `/wallets/status/{id}`):
//! bootstraps an API key from a signed on-chain deposit of a random wei amount, without
//! ever requiring a signature over application data.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::RngCore;

const REQUEST_TTL: Duration = Duration::from_secs(15 * 60);
const API_KEY_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LinkStatus {
    Pending,
    Completed,
    AlreadyClaimed,
    Expired,
}

struct LinkRequest {
    magic_amount_wei: u64,
    deposit_to_address: String,
    created_at: Instant,
    /// `Some` once a matching deposit was observed and an API key minted; cleared (but the
    /// request stays `Completed`) once retrieved or after the cache window lapses.
    api_key: Option<String>,
    api_key_retrieved: bool,
    claimed_at: Option<Instant>,
}

/// Tracks in-flight wallet-link requests. Ephemeral and process-local: a request that
/// outlives the process is simply re-issued by the client (§5 "in-memory caches... explicit
/// invalidation hooks").
#[derive(Default)]
pub struct WalletLinkRegistry {
    requests: Mutex<HashMap<String, LinkRequest>>,
}

pub struct Initiated {
    pub request_id: String,
    pub magic_amount_wei: u64,
    pub deposit_to_address: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl WalletLinkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws a random 6-byte wei amount unique across currently-active requests.
    pub fn initiate(&self, deposit_to_address: impl Into<String>) -> Initiated {
        let deposit_to_address = deposit_to_address.into();
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.retain(|_, r| r.created_at.elapsed() < REQUEST_TTL);

        let mut rng = rand::thread_rng();
        let magic_amount_wei = loop {
            let mut buf = [0u8; 6];
            rng.fill_bytes(&mut buf);
            let mut padded = [0u8; 8];
            padded[2..].copy_from_slice(&buf);
            let candidate = u64::from_be_bytes(padded);
            if !requests.values().any(|r| r.magic_amount_wei == candidate) {
                break candidate;
            }
        };

        let request_id = uuid_like();
        let created_at = Instant::now();
        requests.insert(
            request_id.clone(),
            LinkRequest { magic_amount_wei, deposit_to_address: deposit_to_address.clone(), created_at, api_key: None, api_key_retrieved: false, claimed_at: None },
        );

        Initiated {
            request_id,
            magic_amount_wei,
            deposit_to_address,
            expires_at: chrono::Utc::now() + chrono::Duration::from_std(REQUEST_TTL).unwrap(),
        }
    }

    /// Called once the deposit oracle observes a matching on-chain transfer; mints the
    /// caller-supplied API key onto the request.
    pub fn complete(&self, request_id: &str, api_key: String) {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(r) = requests.get_mut(request_id) {
            r.api_key = Some(api_key);
        }
    }

    /// Returns the request's status and, the first time it is observed `Completed`, the
    /// one-time API key. `ALREADY_CLAIMED` fires on every call after the first retrieval
    /// (or once the 5-min cache window has lapsed without a retrieval).
    pub fn status(&self, request_id: &str) -> Option<(LinkStatus, Option<String>)> {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let request = requests.get_mut(request_id)?;

        if request.created_at.elapsed() >= REQUEST_TTL && request.api_key.is_none() {
            return Some((LinkStatus::Expired, None));
        }

        match (&request.api_key, request.api_key_retrieved, request.claimed_at) {
            (Some(_), true, Some(claimed_at)) if claimed_at.elapsed() < API_KEY_CACHE_TTL => {
                Some((LinkStatus::AlreadyClaimed, None))
            }
            (Some(_), true, _) => Some((LinkStatus::AlreadyClaimed, None)),
            (Some(key), false, _) => {
                let key = key.clone();
                request.api_key_retrieved = true;
                request.claimed_at = Some(Instant::now());
                Some((LinkStatus::Completed, Some(key)))
            }
            (None, _, _) => Some((LinkStatus::Pending, None)),
        }
    }
}

fn uuid_like() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_is_pending_until_completed() {
        let registry = WalletLinkRegistry::new();
        let initiated = registry.initiate("0xdeposit");
        let (status, key) = registry.status(&initiated.request_id).unwrap();
        assert_eq!(status, LinkStatus::Pending);
        assert!(key.is_none());
    }

    #[test]
    fn api_key_is_retrievable_exactly_once() {
        let registry = WalletLinkRegistry::new();
        let initiated = registry.initiate("0xdeposit");
        registry.complete(&initiated.request_id, "nm_live_secret".to_string());

        let (status, key) = registry.status(&initiated.request_id).unwrap();
        assert_eq!(status, LinkStatus::Completed);
        assert_eq!(key.as_deref(), Some("nm_live_secret"));

        let (status, key) = registry.status(&initiated.request_id).unwrap();
        assert_eq!(status, LinkStatus::AlreadyClaimed);
        assert!(key.is_none());
    }

    #[test]
    fn unknown_request_id_returns_none() {
        let registry = WalletLinkRegistry::new();
        assert!(registry.status("does-not-exist").is_none());
    }
}
