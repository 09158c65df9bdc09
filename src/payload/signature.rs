//! Metadata/payload signature verification.
//!
//! `update_engine`'s real wire format signs with RSA PKCS#1 v1.5 over a
//! SHA-256 digest; the `rsa` crate (used for the same purpose in
//! `aptos-labs-aptos-core/types`) gives us that scheme directly rather than
//! hand-rolling PKCS#1 padding.

use rsa::pkcs8::DecodePublicKey;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256};

pub struct PublicKeyVerifier {
    key: RsaPublicKey,
}

impl PublicKeyVerifier {
    pub fn from_public_key_pem(pem: &str) -> anyhow::Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem)?;
        Ok(Self { key })
    }

    pub fn from_public_key(key: RsaPublicKey) -> Self {
        Self { key }
    }

    /// Verifies `signature` over SHA-256(`message`).
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let digest = Sha256::digest(message);
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .is_ok()
    }

    /// Verifies `signature` over an already-computed SHA-256 digest.
    pub fn verify_digest(&self, digest: &[u8], signature: &[u8]) -> bool {
        self.key
            .verify(Pkcs1v15Sign::new::<Sha256>(), digest, signature)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::EncodePublicKey;
    use rsa::{Pkcs1v15Sign, RsaPrivateKey};

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let priv_key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pub_key = RsaPublicKey::from(&priv_key);
        (priv_key, pub_key)
    }

    #[test]
    fn verifies_genuine_signature() {
        let (priv_key, pub_key) = keypair();
        let pem = pub_key.to_public_key_pem(Default::default()).unwrap();
        let verifier = PublicKeyVerifier::from_public_key_pem(&pem).unwrap();

        let message = b"payload metadata bytes";
        let digest = Sha256::digest(message);
        let sig = priv_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();

        assert!(verifier.verify(message, &sig));
    }

    #[test]
    fn rejects_tampered_message() {
        let (priv_key, pub_key) = keypair();
        let verifier = PublicKeyVerifier::from_public_key(pub_key);

        let digest = Sha256::digest(b"original");
        let sig = priv_key
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .unwrap();

        assert!(!verifier.verify(b"tampered", &sig));
    }
}
