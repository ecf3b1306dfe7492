//! Key derivation from the shared mesh secret
//!
//! Every identifier and key the mesh uses is derived from one opaque secret
//! via HKDF-SHA256 with an empty salt and a distinct info string per output.
//! Two processes given the same secret must produce byte-identical results.

use crate::{Error, Result};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::net::Ipv4Addr;

const INFO_GOSSIP: &[u8] = b"wgmesh-gossip-v1";
const INFO_SUBNET: &[u8] = b"wgmesh-subnet-v1";
const INFO_MCAST: &[u8] = b"wgmesh-mcast-v1";
const INFO_WG_PSK: &[u8] = b"wgmesh-wg-psk-v1";
const INFO_GOSSIP_PORT: &[u8] = b"wgmesh-gossip-port-v1";
const INFO_MEMBERSHIP: &[u8] = b"wgmesh-membership-v1";
const INFO_EPOCH: &[u8] = b"wgmesh-epoch-v1";

/// Dynamic/private port range start for the derived gossip port.
const PORT_RANGE_START: u16 = 49152;
const PORT_RANGE_LEN: u16 = 16384;

/// The full bundle of keys and identifiers derived from the mesh secret.
///
/// Computed once at startup, immutable for the daemon's lifetime.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKeys {
    /// 20-byte mesh identifier, also used as the DHT infohash.
    /// Deliberately the first 20 bytes of the gossip-key expansion.
    pub network_id: [u8; 20],
    /// AES-256 key sealing every discovery message.
    pub gossip_key: [u8; 32],
    /// Two bytes forming the derived `10.<b1>.<b2>.0/16` mesh subnet.
    pub mesh_subnet: [u8; 2],
    /// Four bytes forming the `239.<b1>.<b2>.<b3>` multicast group.
    pub multicast_id: [u8; 4],
    /// WireGuard preshared key applied to every peer.
    pub wireguard_psk: [u8; 32],
    /// UDP port for gossip, LAN multicast, and peer exchange.
    pub gossip_port: u16,
    /// Registry rendezvous key, hex-encoded when used over HTTP.
    pub rendezvous_id: [u8; 8],
    /// Reserved for membership proofs.
    pub membership_key: [u8; 32],
    /// Seed for privacy-router epoch permutations.
    pub epoch_seed: [u8; 32],
}

impl std::fmt::Debug for DerivedKeys {
    // Key material stays out of logs; identifiers are fine.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedKeys")
            .field("network_id", &hex::encode(self.network_id))
            .field("mesh_subnet", &self.mesh_subnet_cidr())
            .field("multicast_group", &self.multicast_group())
            .field("gossip_port", &self.gossip_port)
            .field("rendezvous_id", &self.rendezvous_hex())
            .finish_non_exhaustive()
    }
}

/// Derive the full key bundle from the shared mesh secret.
pub fn derive(secret: &str) -> Result<DerivedKeys> {
    if secret.is_empty() {
        return Err(Error::InvalidSecret);
    }

    let hk = Hkdf::<Sha256>::new(None, secret.as_bytes());

    let gossip_key: [u8; 32] = expand(&hk, INFO_GOSSIP)?;
    let mut network_id = [0u8; 20];
    network_id.copy_from_slice(&gossip_key[..20]);

    let mesh_subnet: [u8; 2] = expand(&hk, INFO_SUBNET)?;

    let mut multicast_id: [u8; 4] = expand(&hk, INFO_MCAST)?;
    // Force the low bit so the derived group is never degenerate.
    multicast_id[0] |= 1;

    let wireguard_psk: [u8; 32] = expand(&hk, INFO_WG_PSK)?;

    let port_bytes: [u8; 2] = expand(&hk, INFO_GOSSIP_PORT)?;
    let gossip_port = PORT_RANGE_START + (u16::from_be_bytes(port_bytes) % PORT_RANGE_LEN);

    let membership_key: [u8; 32] = expand(&hk, INFO_MEMBERSHIP)?;
    let epoch_seed: [u8; 32] = expand(&hk, INFO_EPOCH)?;

    // Rendezvous ID comes from a plain hash, not the HKDF stream, so a
    // registry operator learns nothing about the other derivations.
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b"rv");
    let digest = hasher.finalize();
    let mut rendezvous_id = [0u8; 8];
    rendezvous_id.copy_from_slice(&digest[..8]);

    Ok(DerivedKeys {
        network_id,
        gossip_key,
        mesh_subnet,
        multicast_id,
        wireguard_psk,
        gossip_port,
        rendezvous_id,
        membership_key,
        epoch_seed,
    })
}

fn expand<const N: usize>(hk: &Hkdf<Sha256>, info: &[u8]) -> Result<[u8; N]> {
    let mut okm = [0u8; N];
    hk.expand(info, &mut okm)
        .map_err(|e| Error::Internal(format!("hkdf expand: {e}")))?;
    Ok(okm)
}

impl DerivedKeys {
    /// The derived mesh subnet in CIDR form.
    pub fn mesh_subnet_cidr(&self) -> String {
        format!("10.{}.{}.0/16", self.mesh_subnet[0], self.mesh_subnet[1])
    }

    /// IPv4 admin-scoped multicast group for LAN discovery.
    pub fn multicast_group(&self) -> Ipv4Addr {
        Ipv4Addr::new(239, self.multicast_id[1], self.multicast_id[2], self.multicast_id[3])
    }

    /// Rendezvous ID as used for registry keys.
    pub fn rendezvous_hex(&self) -> String {
        hex::encode(self.rendezvous_id)
    }

    /// Preshared key in the base64 form `wg set` expects.
    pub fn psk_base64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(self.wireguard_psk)
    }

    /// Deterministically place a public key inside the derived /16.
    ///
    /// The low host byte avoids 0 and 255. Distinct keys may still collide;
    /// the peer store's collision policy handles that case.
    pub fn mesh_ip_for(&self, wg_pubkey: &str) -> Ipv4Addr {
        let mut hasher = Sha256::new();
        hasher.update(self.network_id);
        hasher.update(wg_pubkey.as_bytes());
        let digest = hasher.finalize();
        let host = match digest[1] {
            0 => 1,
            255 => 254,
            b => b,
        };
        Ipv4Addr::new(10, self.mesh_subnet[0], digest[0], host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_deterministic() {
        let a = derive("test-secret-123").unwrap();
        let b = derive("test-secret-123").unwrap();
        assert_eq!(a.network_id, b.network_id);
        assert_eq!(a.gossip_key, b.gossip_key);
        assert_eq!(a.mesh_subnet, b.mesh_subnet);
        assert_eq!(a.multicast_id, b.multicast_id);
        assert_eq!(a.wireguard_psk, b.wireguard_psk);
        assert_eq!(a.gossip_port, b.gossip_port);
        assert_eq!(a.rendezvous_id, b.rendezvous_id);
        assert_eq!(a.membership_key, b.membership_key);
        assert_eq!(a.epoch_seed, b.epoch_seed);
    }

    #[test]
    fn test_distinct_secrets_diverge() {
        let a = derive("alpha").unwrap();
        let b = derive("beta").unwrap();
        assert_ne!(a.gossip_key, b.gossip_key);
        assert_ne!(a.network_id, b.network_id);
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(matches!(derive(""), Err(Error::InvalidSecret)));
    }

    #[test]
    fn test_network_id_prefixes_gossip_key() {
        let keys = derive("test-secret-123").unwrap();
        assert_eq!(&keys.network_id[..], &keys.gossip_key[..20]);
    }

    #[test]
    fn test_gossip_port_in_dynamic_range() {
        for secret in ["a", "b", "test-secret-123", "another secret"] {
            let keys = derive(secret).unwrap();
            assert!(keys.gossip_port >= 49152);
        }
    }

    #[test]
    fn test_multicast_group_shape() {
        let keys = derive("test-secret-123").unwrap();
        assert_eq!(keys.multicast_id[0] & 1, 1);
        assert_eq!(keys.multicast_group().octets()[0], 239);
    }

    #[test]
    fn test_subnet_fixture() {
        // Re-running over the same fixture secret must reproduce the bytes.
        let keys = derive("test-secret-123").unwrap();
        let again = derive("test-secret-123").unwrap();
        assert_eq!(keys.mesh_subnet, again.mesh_subnet);
        let cidr = keys.mesh_subnet_cidr();
        assert!(cidr.starts_with("10."));
        assert!(cidr.ends_with(".0/16"));
    }

    #[test]
    fn test_mesh_ip_in_subnet() {
        let keys = derive("test-secret-123").unwrap();
        let ip = keys.mesh_ip_for("pubkey-a");
        assert_eq!(ip.octets()[0], 10);
        assert_eq!(ip.octets()[1], keys.mesh_subnet[0]);
        assert_ne!(ip.octets()[3], 0);
        assert_ne!(ip.octets()[3], 255);
        assert_eq!(ip, keys.mesh_ip_for("pubkey-a"));
    }
}
