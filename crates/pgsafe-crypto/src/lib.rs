//! pgsafe-crypto: encryption at rest for backup artifacts
//!
//! Container format (one per artifact):
//! ```text
//! [16 bytes: random nonce][N bytes: AES-256-CTR ciphertext][32 bytes: HMAC-SHA256 tag]
//! tag = HMAC-SHA256(auth_key, nonce || ciphertext)
//! ```
//!
//! Key hierarchy:
//! ```text
//! Key material (base64 or raw text, >= 32 bytes)
//!   └── Cipher Key = SHA-256(material)
//!       └── Auth Key = SHA-256(cipher_key || "hmac")
//! ```
//!
//! Encrypt-then-MAC: the tag covers ciphertext, so tampering is detected
//! before any decrypted byte is kept.

pub mod container;
pub mod error;
pub mod keys;

pub use container::{decrypt_file, encrypt_file};
pub use error::{CryptoError, CryptoResult};
pub use keys::{derive_keys, AuthKey, CipherKey, DerivedKeys};

/// Size of each derived key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of the AES-CTR nonce (one AES block)
pub const NONCE_SIZE: usize = 16;

/// Size of an HMAC-SHA256 authentication tag
pub const TAG_SIZE: usize = 32;

/// Minimum resolved key material length in bytes
pub const MIN_KEY_MATERIAL: usize = 32;

/// Streaming buffer size for encrypt/decrypt
pub const BUFFER_SIZE: usize = 64 * 1024;
