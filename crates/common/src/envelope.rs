//! Authenticated-encryption framing for all discovery traffic
//!
//! Every control message travels as AES-256-GCM ciphertext under the derived
//! gossip key, wrapped in a small JSON envelope of base64 fields. Opening a
//! message enforces, in order: nonce shape, GCM authentication, protocol
//! version, freshness, and structural validity.

use crate::types::{GoodbyeMessage, PeerAnnouncement, PROTOCOL_VERSION};
use crate::{Error, Result};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// GCM nonce size fixed by protocol.
pub const NONCE_LEN: usize = 12;

/// Announcements older (or newer) than this are replays or clock skew.
pub const MAX_MESSAGE_AGE_SECS: i64 = 5 * 60;

/// GOODBYE gets a tighter window; a replayed GOODBYE evicts a live peer.
pub const MAX_GOODBYE_AGE_SECS: i64 = 60;

#[derive(Serialize, Deserialize)]
struct Envelope {
    nonce: String,
    ciphertext: String,
}

/// Seal arbitrary plaintext under the gossip key with a fresh random nonce.
pub fn seal_bytes(plaintext: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
        .map_err(|_| Error::Internal("encryption failed".to_string()))?;

    let b64 = base64::engine::general_purpose::STANDARD;
    let envelope = Envelope {
        nonce: b64.encode(nonce_bytes),
        ciphertext: b64.encode(ciphertext),
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Open an envelope: nonce check, then GCM authentication.
pub fn open_bytes(data: &[u8], key: &[u8; 32]) -> Result<Vec<u8>> {
    // A datagram that is not even envelope JSON is indistinguishable from
    // one sealed under a different key.
    let envelope: Envelope = serde_json::from_slice(data).map_err(|_| Error::DecryptFailed)?;

    let b64 = base64::engine::general_purpose::STANDARD;
    let nonce = b64
        .decode(&envelope.nonce)
        .map_err(|_| Error::DecryptFailed)?;
    if nonce.len() != NONCE_LEN {
        return Err(Error::InvalidNonce(nonce.len()));
    }
    let ciphertext = b64
        .decode(&envelope.ciphertext)
        .map_err(|_| Error::DecryptFailed)?;

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| Error::DecryptFailed)
}

/// Seal an announcement, stamping the protocol version and current time.
pub fn seal_announcement(announcement: &PeerAnnouncement, key: &[u8; 32]) -> Result<Vec<u8>> {
    let mut msg = announcement.clone();
    msg.protocol = PROTOCOL_VERSION;
    msg.timestamp = chrono::Utc::now().timestamp();
    seal_bytes(&serde_json::to_vec(&msg)?, key)
}

/// Open and fully validate an announcement.
pub fn open_announcement(data: &[u8], key: &[u8; 32]) -> Result<PeerAnnouncement> {
    open_announcement_at(data, key, chrono::Utc::now().timestamp())
}

/// As [`open_announcement`], with the clock injected.
pub fn open_announcement_at(data: &[u8], key: &[u8; 32], now: i64) -> Result<PeerAnnouncement> {
    let plaintext = open_bytes(data, key)?;
    let announcement: PeerAnnouncement = serde_json::from_slice(&plaintext)
        .map_err(|e| Error::InvalidAnnouncement(format!("malformed payload: {e}")))?;
    check_announcement_at(&announcement, now)?;
    Ok(announcement)
}

/// Protocol, freshness, and structural checks shared by every receive path.
pub fn check_announcement_at(announcement: &PeerAnnouncement, now: i64) -> Result<()> {
    if announcement.protocol != PROTOCOL_VERSION {
        return Err(Error::ProtocolMismatch(announcement.protocol));
    }
    let age = (now - announcement.timestamp).abs();
    if age > MAX_MESSAGE_AGE_SECS {
        return Err(Error::StaleMessage { age_secs: age });
    }
    announcement.validate()
}

/// Seal a GOODBYE, stamping the protocol version and current time.
pub fn seal_goodbye(goodbye: &GoodbyeMessage, key: &[u8; 32]) -> Result<Vec<u8>> {
    let mut msg = goodbye.clone();
    msg.protocol = PROTOCOL_VERSION;
    msg.timestamp = chrono::Utc::now().timestamp();
    seal_bytes(&serde_json::to_vec(&msg)?, key)
}

/// Open and fully validate a GOODBYE.
pub fn open_goodbye(data: &[u8], key: &[u8; 32]) -> Result<GoodbyeMessage> {
    open_goodbye_at(data, key, chrono::Utc::now().timestamp())
}

/// As [`open_goodbye`], with the clock injected.
pub fn open_goodbye_at(data: &[u8], key: &[u8; 32], now: i64) -> Result<GoodbyeMessage> {
    let plaintext = open_bytes(data, key)?;
    let goodbye: GoodbyeMessage = serde_json::from_slice(&plaintext)
        .map_err(|e| Error::InvalidAnnouncement(format!("malformed payload: {e}")))?;
    check_goodbye_at(&goodbye, now)?;
    Ok(goodbye)
}

/// GOODBYE checks: protocol, the 60-second replay gate, then structure.
pub fn check_goodbye_at(goodbye: &GoodbyeMessage, now: i64) -> Result<()> {
    if goodbye.protocol != PROTOCOL_VERSION {
        return Err(Error::ProtocolMismatch(goodbye.protocol));
    }
    let age = (now - goodbye.timestamp).abs();
    if age > MAX_GOODBYE_AGE_SECS {
        return Err(Error::StaleMessage { age_secs: age });
    }
    goodbye.validate()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        crate::keys::derive("test-secret-123").unwrap().gossip_key
    }

    fn sample_announcement() -> PeerAnnouncement {
        PeerAnnouncement {
            protocol: PROTOCOL_VERSION,
            wg_pubkey: base64::engine::general_purpose::STANDARD.encode([9u8; 32]),
            mesh_ip: "10.42.0.7".parse().unwrap(),
            wg_endpoint: Some("198.51.100.4:51820".to_string()),
            routable_networks: vec!["172.16.0.0/24".to_string()],
            known_peers: Vec::new(),
            hostname: "node-b".to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_round_trip() {
        let key = test_key();
        let ann = sample_announcement();
        let sealed = seal_announcement(&ann, &key).unwrap();
        let opened = open_announcement(&sealed, &key).unwrap();
        assert_eq!(opened.wg_pubkey, ann.wg_pubkey);
        assert_eq!(opened.mesh_ip, ann.mesh_ip);
        assert_eq!(opened.routable_networks, ann.routable_networks);
        assert_eq!(opened.protocol, PROTOCOL_VERSION);
    }

    #[test]
    fn test_wrong_key_fails() {
        let sealed = seal_announcement(&sample_announcement(), &test_key()).unwrap();
        let other = crate::keys::derive("another-secret").unwrap().gossip_key;
        assert!(matches!(
            open_announcement(&sealed, &other),
            Err(Error::DecryptFailed)
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = test_key();
        let sealed = seal_announcement(&sample_announcement(), &key).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&sealed).unwrap();
        let ct = envelope["ciphertext"].as_str().unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD.decode(ct).unwrap();
        raw[0] ^= 0x01;
        envelope["ciphertext"] =
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(raw));
        let tampered = serde_json::to_vec(&envelope).unwrap();
        assert!(matches!(
            open_announcement(&tampered, &key),
            Err(Error::DecryptFailed)
        ));
    }

    #[test]
    fn test_tampered_nonce_fails() {
        let key = test_key();
        let sealed = seal_announcement(&sample_announcement(), &key).unwrap();
        let mut envelope: serde_json::Value = serde_json::from_slice(&sealed).unwrap();
        let nonce = envelope["nonce"].as_str().unwrap();
        let mut raw = base64::engine::general_purpose::STANDARD.decode(nonce).unwrap();
        raw[5] ^= 0x80;
        envelope["nonce"] =
            serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(raw));
        let tampered = serde_json::to_vec(&envelope).unwrap();
        assert!(matches!(
            open_announcement(&tampered, &key),
            Err(Error::DecryptFailed)
        ));
    }

    #[test]
    fn test_short_nonce_rejected() {
        let key = test_key();
        let envelope = serde_json::json!({
            "nonce": base64::engine::general_purpose::STANDARD.encode([0u8; 8]),
            "ciphertext": base64::engine::general_purpose::STANDARD.encode([0u8; 32]),
        });
        let data = serde_json::to_vec(&envelope).unwrap();
        assert!(matches!(
            open_announcement(&data, &key),
            Err(Error::InvalidNonce(8))
        ));
    }

    #[test]
    fn test_stale_announcement_rejected() {
        // Sealed now, opened six minutes later.
        let key = test_key();
        let sealed = seal_announcement(&sample_announcement(), &key).unwrap();
        let later = chrono::Utc::now().timestamp() + 6 * 60;
        assert!(matches!(
            open_announcement_at(&sealed, &key, later),
            Err(Error::StaleMessage { .. })
        ));
    }

    #[test]
    fn test_protocol_mismatch_rejected() {
        let key = test_key();
        let mut ann = sample_announcement();
        ann.protocol = 2;
        ann.timestamp = chrono::Utc::now().timestamp();
        let sealed = seal_bytes(&serde_json::to_vec(&ann).unwrap(), &key).unwrap();
        assert!(matches!(
            open_announcement(&sealed, &key),
            Err(Error::ProtocolMismatch(2))
        ));
    }

    #[test]
    fn test_invalid_announcement_rejected() {
        let key = test_key();
        let mut ann = sample_announcement();
        ann.wg_pubkey = "not-a-key".to_string();
        ann.timestamp = chrono::Utc::now().timestamp();
        let sealed = seal_bytes(&serde_json::to_vec(&ann).unwrap(), &key).unwrap();
        assert!(matches!(
            open_announcement(&sealed, &key),
            Err(Error::InvalidAnnouncement(_))
        ));
    }

    #[test]
    fn test_goodbye_round_trip_and_replay_gate() {
        let key = test_key();
        let goodbye = GoodbyeMessage {
            protocol: PROTOCOL_VERSION,
            wg_pubkey: base64::engine::general_purpose::STANDARD.encode([3u8; 32]),
            timestamp: 0,
        };
        let sealed = seal_goodbye(&goodbye, &key).unwrap();
        let opened = open_goodbye(&sealed, &key).unwrap();
        assert_eq!(opened.wg_pubkey, goodbye.wg_pubkey);

        // Within the announcement window but past the GOODBYE gate.
        let later = chrono::Utc::now().timestamp() + 90;
        assert!(matches!(
            open_goodbye_at(&sealed, &key, later),
            Err(Error::StaleMessage { .. })
        ));
    }
}
