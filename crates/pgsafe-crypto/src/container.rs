//! Streaming file encryption/decryption
//!
//! Encrypted container format (binary):
//! ```text
//! [16 bytes: random nonce][N bytes: ciphertext][32 bytes: HMAC-SHA256 tag]
//! ```
//!
//! The ciphertext length is derived from the file size, not from markers.
//! Both directions stream through a fixed buffer, so memory use does not
//! depend on artifact size.

use aes::Aes256;
use ctr::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::error::{CryptoError, CryptoResult};
use crate::keys::DerivedKeys;
use crate::{BUFFER_SIZE, NONCE_SIZE, TAG_SIZE};

type Aes256Ctr = ctr::Ctr128BE<Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Encrypt `source` into a new container at `destination`.
///
/// A fresh random nonce is generated on every call. The destination is
/// created or truncated and synced before returning; on failure it is removed.
/// The source is left untouched.
pub fn encrypt_file(source: &Path, destination: &Path, keys: &DerivedKeys) -> CryptoResult<()> {
    let result = encrypt_inner(source, destination, keys);
    if result.is_err() {
        discard(destination);
    }
    result
}

/// Decrypt the container at `source` into `destination`, verifying its tag.
///
/// Fails with [`CryptoError::ContainerTooShort`] before creating the
/// destination if the source cannot hold a nonce and a tag. On any failure,
/// including [`CryptoError::AuthenticationFailed`], the partially written
/// destination is removed.
pub fn decrypt_file(source: &Path, destination: &Path, keys: &DerivedKeys) -> CryptoResult<()> {
    let input = File::open(source).map_err(|e| CryptoError::io("opening", source, e))?;
    let len = input
        .metadata()
        .map_err(|e| CryptoError::io("reading metadata of", source, e))?
        .len();
    let min = (NONCE_SIZE + TAG_SIZE) as u64;
    if len < min {
        return Err(CryptoError::ContainerTooShort { len, min });
    }

    let result = decrypt_inner(input, len, source, destination, keys);
    if result.is_err() {
        discard(destination);
    }
    result
}

fn encrypt_inner(source: &Path, destination: &Path, keys: &DerivedKeys) -> CryptoResult<()> {
    let mut input = BufReader::new(
        File::open(source).map_err(|e| CryptoError::io("opening", source, e))?,
    );
    let output = File::create(destination).map_err(|e| CryptoError::io("creating", destination, e))?;
    let mut writer = BufWriter::new(output);

    let mut nonce = [0u8; NONCE_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let mut cipher = Aes256Ctr::new(keys.cipher.as_bytes().into(), &nonce.into());
    let mut mac = new_mac(keys);
    mac.update(&nonce);

    writer
        .write_all(&nonce)
        .map_err(|e| CryptoError::io("writing nonce to", destination, e))?;

    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = read_some(&mut input, &mut buf).map_err(|e| CryptoError::io("reading", source, e))?;
        if n == 0 {
            break;
        }
        let chunk = &mut buf[..n];
        cipher.apply_keystream(chunk);
        mac.update(chunk);
        writer
            .write_all(chunk)
            .map_err(|e| CryptoError::io("writing ciphertext to", destination, e))?;
        total += n as u64;
    }

    let tag = mac.finalize().into_bytes();
    writer
        .write_all(&tag)
        .map_err(|e| CryptoError::io("writing tag to", destination, e))?;

    let output = writer
        .into_inner()
        .map_err(|e| CryptoError::io("flushing", destination, e.into_error()))?;
    output
        .sync_all()
        .map_err(|e| CryptoError::io("syncing", destination, e))?;

    tracing::debug!(
        source = %source.display(),
        destination = %destination.display(),
        plaintext_bytes = total,
        "encrypted"
    );
    Ok(())
}

fn decrypt_inner(
    input: File,
    len: u64,
    source: &Path,
    destination: &Path,
    keys: &DerivedKeys,
) -> CryptoResult<()> {
    let mut input = BufReader::new(input);
    let output = File::create(destination).map_err(|e| CryptoError::io("creating", destination, e))?;
    let mut writer = BufWriter::new(output);

    let mut nonce = [0u8; NONCE_SIZE];
    input
        .read_exact(&mut nonce)
        .map_err(|e| CryptoError::io("reading nonce from", source, e))?;

    let mut cipher = Aes256Ctr::new(keys.cipher.as_bytes().into(), &nonce.into());
    let mut mac = new_mac(keys);
    mac.update(&nonce);

    let cipher_len = len - (NONCE_SIZE + TAG_SIZE) as u64;
    let mut body = (&mut input).take(cipher_len);
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut remaining = cipher_len;
    while remaining > 0 {
        let n = read_some(&mut body, &mut buf).map_err(|e| CryptoError::io("reading", source, e))?;
        if n == 0 {
            return Err(CryptoError::io(
                "reading",
                source,
                std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "container shorter than its reported size",
                ),
            ));
        }
        let chunk = &mut buf[..n];
        // MAC covers ciphertext as read, before decryption
        mac.update(chunk);
        cipher.apply_keystream(chunk);
        writer
            .write_all(chunk)
            .map_err(|e| CryptoError::io("writing plaintext to", destination, e))?;
        remaining -= n as u64;
    }

    let mut tag = [0u8; TAG_SIZE];
    input
        .read_exact(&mut tag)
        .map_err(|e| CryptoError::io("reading tag from", source, e))?;

    // verify_slice compares in constant time
    mac.verify_slice(&tag)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    let output = writer
        .into_inner()
        .map_err(|e| CryptoError::io("flushing", destination, e.into_error()))?;
    output
        .sync_all()
        .map_err(|e| CryptoError::io("syncing", destination, e))?;

    tracing::debug!(
        source = %source.display(),
        destination = %destination.display(),
        ciphertext_bytes = cipher_len,
        "decrypted and verified"
    );
    Ok(())
}

fn new_mac(keys: &DerivedKeys) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(keys.auth.as_bytes()).expect("HMAC accepts any key size")
}

/// `read` that retries on `Interrupted`
fn read_some<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

fn discard(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), "failed to remove partial output: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::derive_keys;
    use secrecy::SecretString;
    use tempfile::TempDir;

    fn keys(material: &str) -> DerivedKeys {
        derive_keys(&SecretString::from(material.to_string())).unwrap()
    }

    fn test_keys() -> DerivedKeys {
        keys("correct horse battery staple, but longer than 32 bytes")
    }

    fn roundtrip(plaintext: &[u8]) -> Vec<u8> {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("plain");
        let enc = tmp.path().join("plain.enc");
        let dec = tmp.path().join("plain.out");
        std::fs::write(&src, plaintext).unwrap();

        let k = test_keys();
        encrypt_file(&src, &enc, &k).unwrap();
        decrypt_file(&enc, &dec, &k).unwrap();
        std::fs::read(&dec).unwrap()
    }

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let plaintext = b"PGDMP custom-format dump bytes";
        assert_eq!(roundtrip(plaintext), plaintext);
    }

    #[test]
    fn test_encrypt_decrypt_empty() {
        assert_eq!(roundtrip(b""), b"");
    }

    #[test]
    fn test_roundtrip_spans_many_buffers() {
        let plaintext: Vec<u8> = (0..(BUFFER_SIZE * 3 + 17))
            .map(|i| (i.wrapping_mul(31) ^ (i >> 5)) as u8)
            .collect();
        assert_eq!(roundtrip(&plaintext), plaintext);
    }

    #[test]
    fn test_container_size() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("plain");
        let enc = tmp.path().join("plain.enc");
        std::fs::write(&src, vec![7u8; 1000]).unwrap();

        encrypt_file(&src, &enc, &test_keys()).unwrap();

        // nonce (16) + plaintext (1000) + tag (32) = 1048
        assert_eq!(std::fs::metadata(&enc).unwrap().len(), 16 + 1000 + 32);
        assert!(src.exists(), "source must be kept");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("plain");
        std::fs::write(&src, b"same input").unwrap();
        let k = test_keys();

        let a = tmp.path().join("a.enc");
        let b = tmp.path().join("b.enc");
        encrypt_file(&src, &a, &k).unwrap();
        encrypt_file(&src, &b, &k).unwrap();

        let a = std::fs::read(a).unwrap();
        let b = std::fs::read(b).unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_container_too_short() {
        let tmp = TempDir::new().unwrap();
        let enc = tmp.path().join("short.enc");
        let dec = tmp.path().join("short.out");
        std::fs::write(&enc, vec![0u8; NONCE_SIZE + TAG_SIZE - 1]).unwrap();

        let err = decrypt_file(&enc, &dec, &test_keys()).unwrap_err();
        assert!(matches!(
            err,
            CryptoError::ContainerTooShort { len: 47, min: 48 }
        ));
        assert!(!dec.exists());
    }

    #[test]
    fn test_wrong_key_fails_and_discards_output() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("plain");
        let enc = tmp.path().join("plain.enc");
        let dec = tmp.path().join("plain.out");
        std::fs::write(&src, b"secret dump").unwrap();

        encrypt_file(&src, &enc, &test_keys()).unwrap();
        let other = keys("a completely different key, also long enough");
        let err = decrypt_file(&enc, &dec, &other).unwrap_err();

        assert!(matches!(err, CryptoError::AuthenticationFailed));
        assert!(!dec.exists(), "no plaintext may survive a failed check");
    }

    #[test]
    fn test_tampered_tag_fails() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("plain");
        let enc = tmp.path().join("plain.enc");
        let dec = tmp.path().join("plain.out");
        std::fs::write(&src, b"secret dump").unwrap();
        encrypt_file(&src, &enc, &test_keys()).unwrap();

        let mut bytes = std::fs::read(&enc).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        std::fs::write(&enc, bytes).unwrap();

        assert!(matches!(
            decrypt_file(&enc, &dec, &test_keys()),
            Err(CryptoError::AuthenticationFailed)
        ));
        assert!(!dec.exists());
    }

    #[test]
    fn test_missing_source_is_io_error() {
        let tmp = TempDir::new().unwrap();
        let err = encrypt_file(
            &tmp.path().join("missing"),
            &tmp.path().join("out.enc"),
            &test_keys(),
        )
        .unwrap_err();
        assert!(matches!(err, CryptoError::Io { .. }));
        assert!(!tmp.path().join("out.enc").exists());
    }
}
