//! Keypair codecs shared with the parent process.
//!
//! Keys cross the RPC channel in the libp2p protobuf encoding; the sidecar
//! never persists them itself.

use libp2p::identity::{DecodingError, Keypair, PublicKey};

/// Generates a fresh Ed25519 keypair from the process CSPRNG.
pub fn generate_keypair() -> Keypair {
    Keypair::generate_ed25519()
}

/// Encodes a private key in the libp2p protobuf framing.
pub fn marshal_private_key(keypair: &Keypair) -> Result<Vec<u8>, DecodingError> {
    keypair.to_protobuf_encoding()
}

/// Encodes a public key in the libp2p protobuf framing.
pub fn marshal_public_key(public: &PublicKey) -> Vec<u8> {
    public.encode_protobuf()
}

/// Decodes a protobuf-framed private key.
pub fn unmarshal_private_key(bytes: &[u8]) -> Result<Keypair, DecodingError> {
    Keypair::from_protobuf_encoding(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::PeerId;

    #[test]
    fn keypair_round_trips_through_protobuf() {
        let keypair = generate_keypair();
        let bytes = marshal_private_key(&keypair).expect("marshal");
        let reloaded = unmarshal_private_key(&bytes).expect("unmarshal");
        assert_eq!(
            PeerId::from(keypair.public()),
            PeerId::from(reloaded.public())
        );
    }

    #[test]
    fn distinct_keypairs_have_distinct_peer_ids() {
        let a = generate_keypair();
        let b = generate_keypair();
        assert_ne!(PeerId::from(a.public()), PeerId::from(b.public()));
    }

    #[test]
    fn rejects_garbage_private_key() {
        assert!(unmarshal_private_key(b"not a protobuf key").is_err());
    }
}
