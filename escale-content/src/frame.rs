//! The payload frame format.
//!
//! ```text
//! magic(4) ∥ version(1) ∥ flags(1) ∥ nonce(24) ∥ plaintext-length(8 BE) ∥ body
//! ```
//!
//! Flag bit 0: body was gzip-compressed before encryption.
//! Flag bit 1: body is XChaCha20-Poly1305 ciphertext (tag included).
//!
//! The declared plaintext length is verified after unframing, and the
//! AEAD tag covers the whole body, so any altered byte surfaces as an
//! error rather than as silent corruption. Empty files frame to an
//! explicit zero-length body; a missing payload is never an empty file.

use std::io::{Read, Write};

use escale_types::Digest;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::ContentError;
use crate::keys::ContentKey;

/// Frame magic bytes.
pub const MAGIC: [u8; 4] = *b"ESCL";

/// Current frame format version.
pub const FORMAT_VERSION: u8 = 1;

/// XChaCha20-Poly1305 nonce size (192 bits).
pub const NONCE_SIZE: usize = 24;

/// Maximum plaintext size accepted for framing (1 GiB).
pub const MAX_PLAINTEXT_SIZE: usize = 1024 * 1024 * 1024;

const FLAG_COMPRESSED: u8 = 0b0000_0001;
const FLAG_ENCRYPTED: u8 = 0b0000_0010;

const HEADER_LEN: usize = 4 + 1 + 1 + NONCE_SIZE + 8;

/// The plaintext content digest recorded in placeholders.
pub fn digest(plaintext: &[u8]) -> Digest {
    Digest::from_bytes(*blake3::hash(plaintext).as_bytes())
}

/// Frame a plaintext for the relay.
///
/// Compression, if requested, is applied before encryption. With no key
/// the body is stored in the clear and integrity relies on the digest
/// check against the placeholder.
pub fn frame(
    plaintext: &[u8],
    key: Option<&ContentKey>,
    compress: bool,
) -> Result<Vec<u8>, ContentError> {
    if plaintext.len() > MAX_PLAINTEXT_SIZE {
        return Err(ContentError::TooLarge(plaintext.len()));
    }

    let mut flags = 0u8;
    let mut body = if compress {
        flags |= FLAG_COMPRESSED;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(plaintext)
            .and_then(|_| encoder.finish())
            .map_err(|e| ContentError::Compression(e.to_string()))?
    } else {
        plaintext.to_vec()
    };

    let mut nonce = [0u8; NONCE_SIZE];
    if let Some(key) = key {
        flags |= FLAG_ENCRYPTED;
        let (ciphertext, fresh_nonce) = key.encrypt(&body)?;
        body = ciphertext;
        nonce = fresh_nonce;
    }

    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(&MAGIC);
    out.push(FORMAT_VERSION);
    out.push(flags);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&(plaintext.len() as u64).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Unframe a relay blob back to its plaintext.
///
/// Verifies magic, version, the AEAD tag and the declared plaintext
/// length. A configured key is mandatory for encrypted frames and
/// forbidden to be bypassed: a plain frame received while a passphrase
/// is configured is rejected rather than trusted.
pub fn unframe(bytes: &[u8], key: Option<&ContentKey>) -> Result<Vec<u8>, ContentError> {
    if bytes.len() < HEADER_LEN {
        return Err(ContentError::BadFrame(format!(
            "truncated frame: {} bytes",
            bytes.len()
        )));
    }
    if bytes[..4] != MAGIC {
        return Err(ContentError::BadFrame("bad magic".into()));
    }
    let version = bytes[4];
    if version != FORMAT_VERSION {
        return Err(ContentError::UnsupportedVersion(version));
    }
    let flags = bytes[5];
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&bytes[6..6 + NONCE_SIZE]);
    let declared = u64::from_be_bytes(
        bytes[6 + NONCE_SIZE..HEADER_LEN]
            .try_into()
            .expect("fixed-width slice"),
    );
    let body = &bytes[HEADER_LEN..];

    let encrypted = flags & FLAG_ENCRYPTED != 0;
    let body = match (encrypted, key) {
        (true, Some(key)) => key.decrypt(body, &nonce)?,
        (true, None) => return Err(ContentError::MissingKey),
        (false, None) => body.to_vec(),
        (false, Some(_)) => return Err(ContentError::UnencryptedPayload),
    };

    let plaintext = if flags & FLAG_COMPRESSED != 0 {
        let mut decoder = GzDecoder::new(&body[..]);
        let mut out = Vec::with_capacity(declared.min(MAX_PLAINTEXT_SIZE as u64) as usize);
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ContentError::Compression(e.to_string()))?;
        out
    } else {
        body
    };

    if plaintext.len() as u64 != declared {
        return Err(ContentError::LengthMismatch {
            declared,
            actual: plaintext.len() as u64,
        });
    }
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::RepoSecret;

    fn key() -> ContentKey {
        ContentKey::derive(&RepoSecret::from_raw([0x11; 32]))
    }

    #[test]
    fn plain_roundtrip() {
        let framed = frame(b"hello", None, false).unwrap();
        assert_eq!(unframe(&framed, None).unwrap(), b"hello");
    }

    #[test]
    fn encrypted_roundtrip() {
        let key = key();
        let framed = frame(b"hello", Some(&key), false).unwrap();
        assert_eq!(unframe(&framed, Some(&key)).unwrap(), b"hello");
    }

    #[test]
    fn compressed_encrypted_roundtrip() {
        let key = key();
        let plaintext = vec![0x61u8; 64 * 1024];
        let framed = frame(&plaintext, Some(&key), true).unwrap();
        // Compressible data should shrink despite the AEAD tag.
        assert!(framed.len() < plaintext.len());
        assert_eq!(unframe(&framed, Some(&key)).unwrap(), plaintext);
    }

    #[test]
    fn digest_is_over_plaintext() {
        let key = key();
        let plain = frame(b"same content", None, false).unwrap();
        let packed = frame(b"same content", Some(&key), true).unwrap();
        assert_ne!(plain, packed);
        // Framing choices never change the recorded digest.
        assert_eq!(digest(b"same content"), digest(b"same content"));
    }

    #[test]
    fn empty_file_is_explicit() {
        let key = key();
        let framed = frame(b"", Some(&key), false).unwrap();
        assert!(framed.len() >= HEADER_LEN);
        assert_eq!(unframe(&framed, Some(&key)).unwrap(), b"");
    }

    #[test]
    fn any_flipped_byte_fails_encrypted_unframe() {
        let key = key();
        let framed = frame(b"bytes under test", Some(&key), false).unwrap();
        for offset in 0..framed.len() {
            let mut tampered = framed.clone();
            tampered[offset] ^= 0x01;
            assert!(
                unframe(&tampered, Some(&key)).is_err(),
                "flipping byte {offset} must not go unnoticed"
            );
        }
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let framed = frame(b"hello", None, false).unwrap();
        assert!(matches!(
            unframe(&framed[..HEADER_LEN - 1], None),
            Err(ContentError::BadFrame(_))
        ));
    }

    #[test]
    fn bad_magic_and_version_are_rejected() {
        let mut framed = frame(b"hello", None, false).unwrap();
        framed[0] = b'X';
        assert!(matches!(
            unframe(&framed, None),
            Err(ContentError::BadFrame(_))
        ));

        let mut framed = frame(b"hello", None, false).unwrap();
        framed[4] = 99;
        assert!(matches!(
            unframe(&framed, None),
            Err(ContentError::UnsupportedVersion(99))
        ));
    }

    #[test]
    fn key_mismatch_with_frame_flags_is_rejected() {
        let key = key();
        let encrypted = frame(b"x", Some(&key), false).unwrap();
        assert!(matches!(
            unframe(&encrypted, None),
            Err(ContentError::MissingKey)
        ));

        let plain = frame(b"x", None, false).unwrap();
        assert!(matches!(
            unframe(&plain, Some(&key)),
            Err(ContentError::UnencryptedPayload)
        ));
    }

    #[test]
    fn declared_length_is_verified_for_plain_frames() {
        let mut framed = frame(b"hello", None, false).unwrap();
        // Tamper with the declared length; plain frames have no MAC, so
        // the length check is what catches it.
        let len_offset = HEADER_LEN - 8;
        framed[len_offset..HEADER_LEN].copy_from_slice(&4u64.to_be_bytes());
        assert!(matches!(
            unframe(&framed, None),
            Err(ContentError::LengthMismatch {
                declared: 4,
                actual: 5
            })
        ));
    }
}
