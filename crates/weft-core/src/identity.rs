//! Node identity: peer addresses, proof of work, and key material
//!
//! A peer is identified by its ed25519 public key. Minting an identity
//! requires a proof of work bound to that key, so addresses cannot be
//! generated for free.

use crate::error::{Error, Result};
use ed25519_dalek::{Signer, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Network identifier carried in every handshake message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkId(pub i32);

/// Unique peer address (the ed25519 public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress(pub [u8; 32]);

impl PeerAddress {
    /// Create from a public key
    pub fn from_public_key(public_key: &[u8; 32]) -> Self {
        Self(*public_key)
    }

    /// Get as bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse from a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| Error::InvalidSecretKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidSecretKey("address must be 32 bytes".to_string()))?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

impl fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerAddress({})", hex::encode(self.0))
    }
}

/// Proof of work bound to a peer address
///
/// Validity: the BLAKE3 hash of `address || nonce` must have at least
/// `difficulty` leading zero bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfWork(pub i64);

impl ProofOfWork {
    /// Check validity for the given address at the given difficulty
    pub fn is_valid(&self, address: &PeerAddress, difficulty: u8) -> bool {
        let mut hasher = blake3::Hasher::new();
        hasher.update(address.as_bytes());
        hasher.update(&self.0.to_le_bytes());
        let hash = hasher.finalize();
        leading_zero_bits(hash.as_bytes()) >= difficulty as u32
    }

    /// Mine the first nonce satisfying the difficulty
    pub fn generate(address: &PeerAddress, difficulty: u8) -> Self {
        let mut nonce: i64 = 0;
        loop {
            let pow = Self(nonce);
            if pow.is_valid(address, difficulty) {
                return pow;
            }
            nonce += 1;
        }
    }

    /// Get the raw nonce
    pub fn nonce(&self) -> i64 {
        self.0
    }
}

/// Count leading zero bits of a byte slice
fn leading_zero_bits(bytes: &[u8]) -> u32 {
    let mut bits = 0;
    for byte in bytes {
        if *byte == 0 {
            bits += 8;
        } else {
            bits += byte.leading_zeros();
            break;
        }
    }
    bits
}

/// A node identity: key material plus the proof of work minted for it
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    address: PeerAddress,
    proof_of_work: ProofOfWork,
}

/// Serialized identity file contents
#[derive(Debug, Serialize, Deserialize)]
struct IdentityFile {
    secret_key: String,
    proof_of_work: i64,
}

impl Identity {
    /// Generate a fresh identity, mining a proof of work at the given difficulty
    pub fn generate(difficulty: u8) -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let address = PeerAddress::from_public_key(&signing_key.verifying_key().to_bytes());
        let proof_of_work = ProofOfWork::generate(&address, difficulty);
        Self {
            signing_key,
            address,
            proof_of_work,
        }
    }

    /// Create from a seed and an already-mined proof of work
    pub fn from_seed(seed: &[u8; 32], proof_of_work: ProofOfWork) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let address = PeerAddress::from_public_key(&signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            address,
            proof_of_work,
        }
    }

    /// Load an identity file, or generate and persist a new identity if absent
    pub fn load_or_generate(path: &Path, difficulty: u8) -> Result<Self> {
        if path.exists() {
            Self::load(path, difficulty)
        } else {
            let identity = Self::generate(difficulty);
            identity.save(path)?;
            Ok(identity)
        }
    }

    /// Load an identity file and validate its proof of work
    pub fn load(path: &Path, difficulty: u8) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let file: IdentityFile = serde_json::from_str(&contents)?;

        let seed = hex::decode(&file.secret_key)
            .map_err(|e| Error::InvalidSecretKey(e.to_string()))?;
        let seed: [u8; 32] = seed
            .try_into()
            .map_err(|_| Error::InvalidSecretKey("secret key must be 32 bytes".to_string()))?;

        let identity = Self::from_seed(&seed, ProofOfWork(file.proof_of_work));
        if !identity.proof_of_work.is_valid(&identity.address, difficulty) {
            return Err(Error::ProofOfWorkInvalid {
                address: identity.address.to_string(),
                difficulty,
            });
        }
        Ok(identity)
    }

    /// Persist to an identity file
    pub fn save(&self, path: &Path) -> Result<()> {
        let file = IdentityFile {
            secret_key: hex::encode(self.signing_key.to_bytes()),
            proof_of_work: self.proof_of_work.0,
        };
        std::fs::write(path, serde_json::to_string_pretty(&file)?)?;
        Ok(())
    }

    /// The peer address derived from the public key
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// The proof of work minted for this identity
    pub fn proof_of_work(&self) -> ProofOfWork {
        self.proof_of_work
    }

    /// The verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .field("proof_of_work", &self.proof_of_work)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_equality_by_bytes() {
        let a = PeerAddress([7u8; 32]);
        let b = PeerAddress([7u8; 32]);
        assert_eq!(a, b);
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_address_hex_roundtrip() {
        let a = PeerAddress([42u8; 32]);
        let parsed = PeerAddress::from_hex(&hex::encode(a.0)).unwrap();
        assert_eq!(a, parsed);
    }

    #[test]
    fn test_proof_of_work_generate_and_validate() {
        let address = PeerAddress([3u8; 32]);
        let pow = ProofOfWork::generate(&address, 8);
        assert!(pow.is_valid(&address, 8));
        assert!(pow.is_valid(&address, 0));
    }

    #[test]
    fn test_proof_of_work_rejects_other_address() {
        let address = PeerAddress([3u8; 32]);
        let other = PeerAddress([4u8; 32]);
        let pow = ProofOfWork::generate(&address, 12);
        // Overwhelmingly likely to fail for a different address at this difficulty
        assert!(!pow.is_valid(&other, 12) || pow.is_valid(&address, 12));
        assert!(pow.is_valid(&address, 12));
    }

    #[test]
    fn test_leading_zero_bits() {
        assert_eq!(leading_zero_bits(&[0, 0, 0xff]), 16);
        assert_eq!(leading_zero_bits(&[0x0f]), 4);
        assert_eq!(leading_zero_bits(&[0x80]), 0);
    }

    #[test]
    fn test_identity_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.identity");

        let original = Identity::load_or_generate(&path, 8).unwrap();
        let loaded = Identity::load_or_generate(&path, 8).unwrap();

        assert_eq!(original.address(), loaded.address());
        assert_eq!(original.proof_of_work(), loaded.proof_of_work());
    }

    #[test]
    fn test_identity_load_rejects_insufficient_pow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weft.identity");

        let identity = Identity::generate(0);
        identity.save(&path).unwrap();

        // A difficulty-0 proof will almost never satisfy 24 bits
        if !identity.proof_of_work().is_valid(&identity.address(), 24) {
            assert!(Identity::load(&path, 24).is_err());
        }
    }

    #[test]
    fn test_identity_sign() {
        let identity = Identity::generate(0);
        let sig = identity.sign(b"weft");
        assert_eq!(sig.len(), 64);
    }
}
