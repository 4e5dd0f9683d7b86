//! Symmetric encryption for credentials at rest.
//!
//! Ciphertexts are `hex(nonce || aes-256-gcm(plaintext))` with a fresh random
//! nonce per call, so encrypting the same secret twice yields different
//! output. Errors never carry plaintext.
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use std::fmt;
use thiserror::Error;

const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VaultError {
    #[error("invalid vault key: {0}")]
    InvalidKey(&'static str),
    #[error("encryption failed")]
    Encrypt,
    #[error("ciphertext is not valid hex")]
    MalformedHex,
    #[error("ciphertext is too short to contain a nonce")]
    Truncated,
    #[error("decryption failed: ciphertext was tampered with or the key is wrong")]
    Authentication,
    #[error("decrypted value is not valid UTF-8")]
    Utf8,
}

#[derive(Clone)]
pub struct Vault {
    cipher: Aes256Gcm,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault").finish_non_exhaustive()
    }
}

impl Vault {
    pub fn from_hex_key(key_hex: &str) -> Result<Self, VaultError> {
        let key_bytes =
            hex::decode(key_hex.trim()).map_err(|_| VaultError::InvalidKey("not hex"))?;
        if key_bytes.len() != KEY_SIZE {
            return Err(VaultError::InvalidKey("must be 32 bytes (256 bits) long"));
        }
        let cipher = Aes256Gcm::new(key_bytes.as_slice().into());
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plain_text: &str) -> Result<String, VaultError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plain_text.as_bytes())
            .map_err(|_| VaultError::Encrypt)?;

        let mut out = nonce.to_vec();
        out.extend_from_slice(&ciphertext);
        Ok(hex::encode(out))
    }

    pub fn decrypt(&self, cipher_hex: &str) -> Result<String, VaultError> {
        let data = hex::decode(cipher_hex.trim()).map_err(|_| VaultError::MalformedHex)?;
        if data.len() < NONCE_SIZE {
            return Err(VaultError::Truncated);
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let plain = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::Authentication)?;
        String::from_utf8(plain).map_err(|_| VaultError::Utf8)
    }

    /// Decrypt an optional stored value. Failures are reported to the caller,
    /// which decides whether to proceed without the credential.
    pub fn decrypt_opt(&self, cipher_hex: Option<&str>) -> Result<Option<String>, VaultError> {
        match cipher_hex.map(str::trim).filter(|s| !s.is_empty()) {
            Some(c) => self.decrypt(c).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f";
    const OTHER_KEY: &str = "f1e1d1c1b1a191817161514131211101f0e0d0c0b0a090807060504030201000";

    #[test]
    fn round_trip_various_secrets() {
        let vault = Vault::from_hex_key(KEY).unwrap();
        for secret in [
            "",
            "sk-abc123",
            "with spaces and symbols !@#$%^&*()",
            "多字节字符 🔑",
            &"x".repeat(4096),
        ] {
            let enc = vault.encrypt(secret).unwrap();
            assert_ne!(enc, secret);
            assert_eq!(vault.decrypt(&enc).unwrap(), secret);
        }
    }

    #[test]
    fn fresh_nonce_per_call() {
        let vault = Vault::from_hex_key(KEY).unwrap();
        let a = vault.encrypt("same").unwrap();
        let b = vault.encrypt("same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let vault = Vault::from_hex_key(KEY).unwrap();
        let enc = vault.encrypt("sk-secret").unwrap();
        let mut bytes = hex::decode(&enc).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = hex::encode(bytes);
        assert_eq!(vault.decrypt(&tampered), Err(VaultError::Authentication));
    }

    #[test]
    fn wrong_key_is_rejected() {
        let enc = Vault::from_hex_key(KEY).unwrap().encrypt("secret").unwrap();
        let other = Vault::from_hex_key(OTHER_KEY).unwrap();
        assert_eq!(other.decrypt(&enc), Err(VaultError::Authentication));
    }

    #[test]
    fn malformed_inputs() {
        let vault = Vault::from_hex_key(KEY).unwrap();
        assert_eq!(vault.decrypt("zz-not-hex"), Err(VaultError::MalformedHex));
        assert_eq!(vault.decrypt("00ff"), Err(VaultError::Truncated));
        assert!(matches!(
            Vault::from_hex_key("1234"),
            Err(VaultError::InvalidKey(_))
        ));
        assert!(matches!(
            Vault::from_hex_key("not-a-hex-key"),
            Err(VaultError::InvalidKey(_))
        ));
    }

    #[test]
    fn errors_do_not_echo_secret() {
        let vault = Vault::from_hex_key(KEY).unwrap();
        let enc = vault.encrypt("sk-very-secret").unwrap();
        let other = Vault::from_hex_key(OTHER_KEY).unwrap();
        let err = other.decrypt(&enc).unwrap_err().to_string();
        assert!(!err.contains("sk-very-secret"));
    }

    #[test]
    fn decrypt_opt_skips_blank_values() {
        let vault = Vault::from_hex_key(KEY).unwrap();
        assert_eq!(vault.decrypt_opt(None).unwrap(), None);
        assert_eq!(vault.decrypt_opt(Some("  ")).unwrap(), None);
        let enc = vault.encrypt("v").unwrap();
        assert_eq!(vault.decrypt_opt(Some(&enc)).unwrap().as_deref(), Some("v"));
    }
}
