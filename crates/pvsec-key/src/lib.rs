//! Ed25519 key pairs for the Secure PVAccess certificate plane
//!
//! A `KeyPair` holds the signing half used by certificate authorities and
//! certificate requesters.  Only the public half (SPKI DER) ever travels in a
//! certificate creation request; the private half stays with its owner.

pub mod error;

use std::{fs, path::Path};

use ed25519_dalek::{
    pkcs8::{DecodePrivateKey, EncodePrivateKey, EncodePublicKey},
    Signature, Signer, SigningKey, VerifyingKey,
};
use sha1::{Digest, Sha1};

pub use error::{KeyError, Result};

/// An Ed25519 signing key pair
pub struct KeyPair {
    signing: SigningKey,
}

impl KeyPair {
    /// Generate a new key pair from a random seed
    pub fn generate() -> Result<Self> {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed).map_err(|e| KeyError::EntropyError(e.to_string()))?;
        Ok(Self::from_seed(&seed))
    }

    /// Create a key pair from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(seed),
        }
    }

    /// Import from a PKCS#8 PEM private key
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
        let signing = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| KeyError::ImportError(format!("Failed to parse PKCS#8 PEM: {e}")))?;
        Ok(Self { signing })
    }

    /// Import from PKCS#8 DER bytes
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let signing = SigningKey::from_pkcs8_der(der)
            .map_err(|e| KeyError::ImportError(format!("Failed to parse PKCS#8 DER: {e}")))?;
        Ok(Self { signing })
    }

    /// Export the private key as PKCS#8 PEM
    pub fn to_pkcs8_pem(&self) -> Result<String> {
        let pem = self
            .signing
            .to_pkcs8_pem(pkcs8::LineEnding::LF)
            .map_err(|e| KeyError::ExportError(format!("Failed to encode PKCS#8 PEM: {e}")))?;
        Ok(pem.to_string())
    }

    /// The public verifying key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }

    /// Raw 32-byte public key
    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// The public half as SubjectPublicKeyInfo DER.
    ///
    /// This is the representation that travels in certificate creation
    /// requests and from which the Subject Key Identifier is derived.
    pub fn spki_der(&self) -> Result<Vec<u8>> {
        let doc = self
            .signing
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| KeyError::ExportError(format!("Failed to encode SPKI: {e}")))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Subject Key Identifier: SHA-1 over the SPKI DER (RFC 5280 method 1)
    pub fn subject_key_id(&self) -> Result<[u8; 20]> {
        Ok(ski_from_spki(&self.spki_der()?))
    }

    /// Sign a message, returning the 64-byte Ed25519 signature
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }

    /// Verify a signature made by this key pair
    pub fn verify(&self, message: &[u8], signature: &[u8; 64]) -> bool {
        verify(&self.public_key_bytes(), message, signature)
    }

    /// Hex id of the key: first 8 hex chars of the SKI
    pub fn key_id_hex(&self) -> Result<String> {
        let ski = self.subject_key_id()?;
        Ok(hex::encode(&ski[..4]))
    }

    /// Save the private key to a PKCS#8 PEM file
    pub fn save_pkcs8_pem_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let pem = self.to_pkcs8_pem()?;
        fs::write(path, pem).map_err(KeyError::IoError)
    }

    /// Load a private key from a PKCS#8 PEM file
    pub fn load_pkcs8_pem_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let pem = fs::read_to_string(path).map_err(KeyError::IoError)?;
        Self::from_pkcs8_pem(&pem)
    }
}

/// Verify an Ed25519 signature against a raw 32-byte public key
pub fn verify(public_key: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    vk.verify_strict(message, &Signature::from_bytes(signature))
        .is_ok()
}

/// Subject Key Identifier of an arbitrary SPKI DER blob
pub fn ski_from_spki(spki_der: &[u8]) -> [u8; 20] {
    let mut sha1 = Sha1::new();
    sha1.update(spki_der);
    sha1.finalize().into()
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_generate_and_sign() {
        let key = KeyPair::generate().unwrap();
        let message = b"certificate status claims";
        let sig = key.sign(message);
        assert!(key.verify(message, &sig));
        assert!(!key.verify(b"different message", &sig));
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let seed = [7u8; 32];
        let a = KeyPair::from_seed(&seed);
        let b = KeyPair::from_seed(&seed);
        assert_eq!(a.public_key_bytes(), b.public_key_bytes());
        assert_eq!(a.sign(b"x"), b.sign(b"x"));
    }

    #[test]
    fn test_pkcs8_pem_roundtrip() {
        let key = KeyPair::generate().unwrap();
        let pem = key.to_pkcs8_pem().unwrap();
        let restored = KeyPair::from_pkcs8_pem(&pem).unwrap();
        assert_eq!(key.public_key_bytes(), restored.public_key_bytes());
    }

    #[test]
    fn test_pem_file_operations() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.pem");

        let key = KeyPair::generate().unwrap();
        key.save_pkcs8_pem_file(&path).unwrap();
        let loaded = KeyPair::load_pkcs8_pem_file(&path).unwrap();
        assert_eq!(key.public_key_bytes(), loaded.public_key_bytes());
    }

    #[test]
    fn test_ski_is_stable() {
        let key = KeyPair::from_seed(&[1u8; 32]);
        let ski1 = key.subject_key_id().unwrap();
        let ski2 = ski_from_spki(&key.spki_der().unwrap());
        assert_eq!(ski1, ski2);
        assert_eq!(key.key_id_hex().unwrap().len(), 8);
    }

    #[test]
    fn test_cross_key_verify_fails() {
        let a = KeyPair::generate().unwrap();
        let b = KeyPair::generate().unwrap();
        let sig = a.sign(b"msg");
        assert!(!verify(&b.public_key_bytes(), b"msg", &sig));
    }
}
