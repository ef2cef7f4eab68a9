//! Key derivation: operator key material → cipher key + authentication key

use base64::{engine::general_purpose::STANDARD, Engine as _};
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::{KEY_SIZE, MIN_KEY_MATERIAL};

/// Domain-separation suffix appended to the cipher key before hashing
const AUTH_KEY_DOMAIN: &[u8] = b"hmac";

macro_rules! secret_key {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

secret_key!(
    /// 256-bit AES-CTR key. Zeroized on drop.
    CipherKey
);

secret_key!(
    /// 256-bit HMAC-SHA256 key. Zeroized on drop.
    AuthKey
);

/// The pair of keys both codec directions need.
#[derive(Debug, Clone)]
pub struct DerivedKeys {
    pub cipher: CipherKey,
    pub auth: AuthKey,
}

/// Derive the cipher and authentication keys from operator key material.
///
/// The material is base64-decoded when possible; if decoding fails or yields
/// nothing, the raw UTF-8 bytes are used instead. Either way at least
/// [`MIN_KEY_MATERIAL`] bytes are required.
pub fn derive_keys(material: &SecretString) -> CryptoResult<DerivedKeys> {
    let text = material.expose_secret();
    if text.is_empty() {
        return Err(CryptoError::MissingKeyMaterial);
    }

    let mut resolved = match STANDARD.decode(text) {
        Ok(decoded) if !decoded.is_empty() => decoded,
        _ => text.as_bytes().to_vec(),
    };

    if resolved.len() < MIN_KEY_MATERIAL {
        let len = resolved.len();
        resolved.zeroize();
        return Err(CryptoError::InsufficientKeyMaterial {
            len,
            min: MIN_KEY_MATERIAL,
        });
    }

    let cipher: [u8; KEY_SIZE] = Sha256::digest(&resolved).into();
    resolved.zeroize();

    let auth: [u8; KEY_SIZE] = Sha256::new()
        .chain_update(cipher)
        .chain_update(AUTH_KEY_DOMAIN)
        .finalize()
        .into();

    Ok(DerivedKeys {
        cipher: CipherKey::from_bytes(cipher),
        auth: AuthKey::from_bytes(auth),
    })
}
