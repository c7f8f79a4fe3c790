use crate::error::CustodyError;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

/// AES-GCM nonce length in bytes (96 bits)
const NONCE_LEN: usize = 12;

/// Encrypts and decrypts the private keys of engine-controlled addresses.
///
/// Stored form is `hex(nonce || ciphertext)`. Plaintext keys are only produced
/// by `decrypt`, wrapped in `Zeroizing` so they are wiped once the signing
/// call that needed them returns.
pub struct KeyVault {
    cipher: Aes256Gcm,
}

impl KeyVault {
    pub fn new(key: &[u8]) -> Result<Self, CustodyError> {
        let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CustodyError::InvalidVaultKey)?;
        Ok(Self { cipher })
    }

    /// Derives the vault key as SHA-256 of the configured passphrase
    pub fn from_passphrase(passphrase: &str) -> Result<Self, CustodyError> {
        let digest = Zeroizing::new(Sha256::digest(passphrase.as_bytes()).to_vec());
        Self::new(&digest)
    }

    pub fn encrypt(&self, secret: &str) -> Result<String, CustodyError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret.as_bytes())
            .map_err(|_| CustodyError::EncryptionFailed)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    pub fn decrypt(&self, sealed: &str) -> Result<Zeroizing<String>, CustodyError> {
        let bytes = hex::decode(sealed.trim())
            .map_err(|e| CustodyError::Malformed(format!("invalid hex: {}", e)))?;

        if bytes.len() <= NONCE_LEN {
            return Err(CustodyError::Malformed(format!(
                "expected more than {} bytes, got {}",
                NONCE_LEN,
                bytes.len()
            )));
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = Zeroizing::new(
            self.cipher
                .decrypt(Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CustodyError::DecryptionFailed)?,
        );

        let secret = std::str::from_utf8(&plaintext)
            .map_err(|_| CustodyError::Malformed("secret is not utf-8".to_string()))?;
        Ok(Zeroizing::new(secret.to_string()))
    }
}
