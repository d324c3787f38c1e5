//! Control-plane request authentication.
//!
//! Three proofs are accepted, checked in order: a query token, a bearer token, and an
//! HMAC-SHA256 signature over the request with a single-use nonce.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Mutex;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_TS: &str = "x-guardian-ts";
pub const HEADER_NONCE: &str = "x-guardian-nonce";
pub const HEADER_SIGNATURE: &str = "x-guardian-signature";

const SIGNATURE_PREFIX: &str = "sha256=";
/// Timestamps below this are read as seconds since epoch, at or above as milliseconds.
const MILLIS_THRESHOLD: f64 = 1e12;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Query,
    Bearer,
    Hmac,
    Rejected(String),
}

impl AuthOutcome {
    pub fn mode(&self) -> Option<&'static str> {
        match self {
            AuthOutcome::Query => Some("query"),
            AuthOutcome::Bearer => Some("bearer"),
            AuthOutcome::Hmac => Some("hmac"),
            AuthOutcome::Rejected(_) => None,
        }
    }
}

/// The parts of an inbound request the authenticator looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query_token: Option<&'a str>,
    pub authorization: Option<&'a str>,
    pub timestamp: Option<&'a str>,
    pub nonce: Option<&'a str>,
    pub signature: Option<&'a str>,
    pub body: &'a [u8],
}

/// Accepted nonces and their expiry (epoch ms). In memory only.
#[derive(Debug, Default)]
pub struct NonceStore {
    expirations: HashMap<String, i64>,
}

impl NonceStore {
    pub fn purge_expired(&mut self, now_ms: i64) {
        self.expirations.retain(|_, exp| *exp > now_ms);
    }

    pub fn is_live(&self, nonce: &str, now_ms: i64) -> bool {
        self.expirations.get(nonce).is_some_and(|exp| *exp > now_ms)
    }

    pub fn remember(&mut self, nonce: &str, expires_at_ms: i64) {
        self.expirations.insert(nonce.to_string(), expires_at_ms);
    }

    pub fn len(&self) -> usize {
        self.expirations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.expirations.is_empty()
    }
}

#[derive(Debug)]
pub struct Authenticator {
    secret: String,
    max_skew_ms: u64,
    nonce_ttl_ms: u64,
    nonces: Mutex<NonceStore>,
}

fn secure_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

/// Canonical signed message: `METHOD\nPATH\nTIMESTAMP\nNONCE\nBODY`.
fn signing_payload(method: &str, path: &str, timestamp: &str, nonce: &str, body: &[u8]) -> Vec<u8> {
    let mut msg = format!("{method}\n{path}\n{timestamp}\n{nonce}\n").into_bytes();
    msg.extend_from_slice(body);
    msg
}

fn mac_bytes(secret: &str, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| anyhow::anyhow!("hmac key: {e}"))?;
    mac.update(payload);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Hex-encoded HMAC-SHA256 signature for a request, as clients send it.
pub fn sign(secret: &str, method: &str, path: &str, timestamp: &str, nonce: &str, body: &[u8]) -> anyhow::Result<String> {
    let payload = signing_payload(method, path, timestamp, nonce, body);
    Ok(hex::encode(mac_bytes(secret, &payload)?))
}

/// Timestamp as epoch ms, accepting either seconds or milliseconds.
fn parse_timestamp_ms(raw: &str) -> Option<i64> {
    let v: f64 = raw.trim().parse().ok()?;
    if !v.is_finite() || v < 0.0 {
        return None;
    }
    let ms = if v < MILLIS_THRESHOLD { v * 1000.0 } else { v };
    Some(ms.round() as i64)
}

impl Authenticator {
    pub fn new(secret: impl Into<String>, max_skew_ms: u64, nonce_ttl_ms: u64) -> Self {
        Self {
            secret: secret.into(),
            max_skew_ms,
            nonce_ttl_ms,
            nonces: Mutex::new(NonceStore::default()),
        }
    }

    pub fn secret(&self) -> &str {
        &self.secret
    }

    pub fn nonce_count(&self) -> usize {
        self.nonces.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn verify(&self, req: &AuthRequest<'_>, now_ms: i64) -> AuthOutcome {
        if let Some(t) = req.query_token {
            if secure_eq(t, &self.secret) {
                return AuthOutcome::Query;
            }
        }

        if let Some(h) = req.authorization {
            let h = h.trim();
            let token = h
                .strip_prefix("Bearer ")
                .or_else(|| h.strip_prefix("bearer "))
                .map(str::trim);
            if let Some(token) = token {
                if secure_eq(token, &self.secret) {
                    return AuthOutcome::Bearer;
                }
            }
        }

        match (req.timestamp, req.nonce, req.signature) {
            (None, None, None) => {
                if req.query_token.is_some() || req.authorization.is_some() {
                    AuthOutcome::Rejected("invalid token".to_string())
                } else {
                    AuthOutcome::Rejected("missing credentials".to_string())
                }
            }
            (Some(ts), Some(nonce), Some(sig)) => self.verify_signed(req, ts, nonce, sig, now_ms),
            _ => AuthOutcome::Rejected(format!(
                "signed requests need {HEADER_TS}, {HEADER_NONCE} and {HEADER_SIGNATURE}"
            )),
        }
    }

    fn verify_signed(&self, req: &AuthRequest<'_>, ts: &str, nonce: &str, sig: &str, now_ms: i64) -> AuthOutcome {
        let mut nonces = self.nonces.lock().unwrap_or_else(|p| p.into_inner());
        nonces.purge_expired(now_ms);

        let Some(ts_ms) = parse_timestamp_ms(ts) else {
            return AuthOutcome::Rejected("invalid timestamp".to_string());
        };
        if now_ms.abs_diff(ts_ms) > self.max_skew_ms {
            return AuthOutcome::Rejected("timestamp outside allowed clock skew".to_string());
        }

        let nonce = nonce.trim();
        if nonce.is_empty() {
            return AuthOutcome::Rejected("empty nonce".to_string());
        }
        if nonces.is_live(nonce, now_ms) {
            return AuthOutcome::Rejected("nonce already used".to_string());
        }

        let sig = sig.trim();
        let sig = sig.strip_prefix(SIGNATURE_PREFIX).unwrap_or(sig);
        let Ok(provided) = hex::decode(sig) else {
            return AuthOutcome::Rejected("malformed signature".to_string());
        };
        let payload = signing_payload(req.method, req.path, ts.trim(), nonce, req.body);
        let expected = match mac_bytes(&self.secret, &payload) {
            Ok(m) => m,
            Err(_) => return AuthOutcome::Rejected("signature check failed".to_string()),
        };
        if provided.len() != expected.len() {
            return AuthOutcome::Rejected("signature length mismatch".to_string());
        }
        if !bool::from(provided.ct_eq(&expected)) {
            return AuthOutcome::Rejected("invalid signature".to_string());
        }

        nonces.remember(nonce, now_ms.saturating_add(self.nonce_ttl_ms as i64));
        AuthOutcome::Hmac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";
    const NOW: i64 = 1_700_000_000_000;

    fn auth() -> Authenticator {
        Authenticator::new(SECRET, 300_000, 600_000)
    }

    fn signed<'a>(ts: &'a str, nonce: &'a str, sig: &'a str, body: &'a [u8]) -> AuthRequest<'a> {
        AuthRequest {
            method: "POST",
            path: "/restart",
            timestamp: Some(ts),
            nonce: Some(nonce),
            signature: Some(sig),
            body,
            ..Default::default()
        }
    }

    #[test]
    fn bearer_matches_only_the_secret() {
        let a = auth();
        let good = format!("Bearer {SECRET}");
        let req = AuthRequest { authorization: Some(&good), ..Default::default() };
        assert_eq!(a.verify(&req, NOW), AuthOutcome::Bearer);

        for bad in ["Bearer nope", "Bearer ", "Basic abc", SECRET] {
            let req = AuthRequest { authorization: Some(bad), ..Default::default() };
            assert!(matches!(a.verify(&req, NOW), AuthOutcome::Rejected(_)), "{bad}");
        }
    }

    #[test]
    fn query_token_wins_regardless_of_headers() {
        let a = auth();
        let req = AuthRequest {
            query_token: Some(SECRET),
            authorization: Some("Bearer wrong"),
            timestamp: Some("garbage"),
            ..Default::default()
        };
        assert_eq!(a.verify(&req, NOW), AuthOutcome::Query);
        assert_eq!(AuthOutcome::Query.mode(), Some("query"));
    }

    #[test]
    fn signed_request_accepted_once_then_replay_rejected() {
        let a = auth();
        let ts = NOW.to_string();
        let sig = sign(SECRET, "POST", "/restart", &ts, "n-1", b"{}").unwrap();
        assert_eq!(a.verify(&signed(&ts, "n-1", &sig, b"{}"), NOW), AuthOutcome::Hmac);

        // Same nonce, later timestamp, correctly signed: still a replay.
        let ts2 = (NOW + 5_000).to_string();
        let sig2 = sign(SECRET, "POST", "/restart", &ts2, "n-1", b"{}").unwrap();
        assert_eq!(
            a.verify(&signed(&ts2, "n-1", &sig2, b"{}"), NOW + 5_000),
            AuthOutcome::Rejected("nonce already used".to_string())
        );
    }

    #[test]
    fn seconds_timestamps_and_prefixed_signatures_work() {
        let a = auth();
        let ts = (NOW / 1000).to_string();
        let sig = format!("sha256={}", sign(SECRET, "POST", "/restart", &ts, "n-2", b"").unwrap());
        assert_eq!(a.verify(&signed(&ts, "n-2", &sig, b""), NOW), AuthOutcome::Hmac);
    }

    #[test]
    fn skewed_timestamp_rejected() {
        let a = auth();
        let ts = (NOW - 301_000).to_string();
        let sig = sign(SECRET, "POST", "/restart", &ts, "n-3", b"").unwrap();
        let out = a.verify(&signed(&ts, "n-3", &sig, b""), NOW);
        assert_eq!(out, AuthOutcome::Rejected("timestamp outside allowed clock skew".to_string()));
        assert_eq!(a.nonce_count(), 0);
    }

    #[test]
    fn tampered_body_and_short_signature_rejected() {
        let a = auth();
        let ts = NOW.to_string();
        let sig = sign(SECRET, "POST", "/restart", &ts, "n-4", b"a").unwrap();
        let out = a.verify(&signed(&ts, "n-4", &sig, b"b"), NOW);
        assert_eq!(out, AuthOutcome::Rejected("invalid signature".to_string()));

        let out = a.verify(&signed(&ts, "n-4", &sig[..20], b"a"), NOW);
        assert_eq!(out, AuthOutcome::Rejected("signature length mismatch".to_string()));

        let out = a.verify(&signed(&ts, "n-4", "zz-not-hex", b"a"), NOW);
        assert_eq!(out, AuthOutcome::Rejected("malformed signature".to_string()));

        // Failed attempts never burn the nonce.
        assert_eq!(a.verify(&signed(&ts, "n-4", &sig, b"a"), NOW), AuthOutcome::Hmac);
    }

    #[test]
    fn expired_nonces_are_purged_and_reusable() {
        let a = Authenticator::new(SECRET, 10_000_000, 1_000);
        let ts = NOW.to_string();
        let sig = sign(SECRET, "POST", "/restart", &ts, "n-5", b"").unwrap();
        assert_eq!(a.verify(&signed(&ts, "n-5", &sig, b""), NOW), AuthOutcome::Hmac);
        assert_eq!(a.nonce_count(), 1);
        assert_eq!(a.verify(&signed(&ts, "n-5", &sig, b""), NOW + 2_000), AuthOutcome::Hmac);
        assert_eq!(a.nonce_count(), 1);
    }

    #[test]
    fn partial_signature_headers_rejected() {
        let a = auth();
        let req = AuthRequest { timestamp: Some("1"), nonce: Some("x"), ..Default::default() };
        assert!(matches!(a.verify(&req, NOW), AuthOutcome::Rejected(_)));
        let out = a.verify(&AuthRequest::default(), NOW);
        assert_eq!(out, AuthOutcome::Rejected("missing credentials".to_string()));
    }

    #[test]
    fn rejection_reasons_never_contain_the_secret() {
        let a = auth();
        let half = &SECRET[..16];
        let req = AuthRequest { query_token: Some(half), ..Default::default() };
        match a.verify(&req, NOW) {
            AuthOutcome::Rejected(reason) => assert!(!reason.contains(half)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
