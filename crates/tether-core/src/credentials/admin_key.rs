//! Admin key wire format
//!
//! An admin key is `<instance name>|<hex>` where the hex part is
//! `version (1 byte) || nonce (12 bytes) || AES-128-GCM-SIV ciphertext + tag`.
//! The AEAD key is derived from the instance secret with a counter-mode
//! HMAC-SHA256 KDF, and the associated data is the version byte. The
//! plaintext is a tiny protobuf-compatible message:
//!
//! | field | meaning            | encoding                  |
//! |-------|--------------------|---------------------------|
//! | 2     | issue time (secs)  | varint                    |
//! | 3     | member id          | varint                    |
//! | 5     | read-only          | varint `1`, only if true  |
//!
//! The backend verifies keys with the same scheme, so every byte here has
//! to match it exactly.

use std::time::{SystemTime, UNIX_EPOCH};

use aes_gcm_siv::aead::{Aead, KeyInit, Payload};
use aes_gcm_siv::{Aes128GcmSiv, Nonce};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::Sha256;

use crate::error::CredentialError;

/// Current admin key format version; also the AEAD associated data
pub const ADMIN_KEY_VERSION: u8 = 1;

/// Length of an instance secret in bytes
pub const SECRET_LEN: usize = 32;

/// Member id used for locally generated keys
pub const DEFAULT_MEMBER_ID: u64 = 0;

const KDF_LABEL: &[u8] = b"admin key";
const KEY_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

const FIELD_ISSUED_S: u64 = 2;
const FIELD_MEMBER_ID: u64 = 3;
const FIELD_IS_READ_ONLY: u64 = 5;
const WIRE_VARINT: u64 = 0;

type HmacSha256 = Hmac<Sha256>;

/// Decoded contents of an admin key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdminKeyClaims {
    /// Unix time the key was issued
    pub issued_s: u64,
    /// Member the key acts on behalf of
    pub member_id: u64,
    /// Whether the key only grants read access
    pub is_read_only: bool,
}

/// Generate a fresh 32-byte instance secret
pub fn generate_secret() -> [u8; SECRET_LEN] {
    let mut secret = [0u8; SECRET_LEN];
    rand::thread_rng().fill(&mut secret);
    secret
}

/// Issue an admin key for `instance_name`, signed with `secret`
pub fn issue_admin_key(
    instance_name: &str,
    secret: &[u8],
    member_id: u64,
    is_read_only: bool,
) -> Result<String, CredentialError> {
    let issued_s = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let mut nonce = [0u8; NONCE_LEN];
    rand::thread_rng().fill(&mut nonce);

    let claims = AdminKeyClaims {
        issued_s,
        member_id,
        is_read_only,
    };
    encrypt_admin_key(instance_name, secret, &claims, &nonce)
}

/// Decrypt an admin key with the instance secret it was issued under
pub fn decrypt_admin_key(
    admin_key: &str,
    secret: &[u8],
) -> Result<(String, AdminKeyClaims), CredentialError> {
    check_secret_len(secret)?;

    let (instance_name, encoded) = admin_key
        .rsplit_once('|')
        .ok_or_else(|| CredentialError::MalformedToken("missing '|' separator".to_string()))?;
    let bytes = hex::decode(encoded)
        .map_err(|e| CredentialError::MalformedToken(format!("invalid hex: {}", e)))?;

    if bytes.len() < 1 + NONCE_LEN + TAG_LEN {
        return Err(CredentialError::MalformedToken(format!(
            "{} bytes is too short",
            bytes.len()
        )));
    }

    let version = bytes[0];
    if version != ADMIN_KEY_VERSION {
        return Err(CredentialError::UnsupportedVersion(version));
    }
    let nonce = &bytes[1..1 + NONCE_LEN];
    let ciphertext = &bytes[1 + NONCE_LEN..];

    let cipher = cipher_for(secret)?;
    let plaintext = cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad: &[version],
            },
        )
        .map_err(|_| CredentialError::Encryption)?;

    Ok((instance_name.to_string(), decode_claims(&plaintext)?))
}

fn encrypt_admin_key(
    instance_name: &str,
    secret: &[u8],
    claims: &AdminKeyClaims,
    nonce: &[u8; NONCE_LEN],
) -> Result<String, CredentialError> {
    check_secret_len(secret)?;

    let cipher = cipher_for(secret)?;
    let plaintext = encode_claims(claims);
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: &plaintext,
                aad: &[ADMIN_KEY_VERSION],
            },
        )
        .map_err(|_| CredentialError::Encryption)?;

    let mut blob = Vec::with_capacity(1 + NONCE_LEN + ciphertext.len());
    blob.push(ADMIN_KEY_VERSION);
    blob.extend_from_slice(nonce);
    blob.extend_from_slice(&ciphertext);

    Ok(format!("{}|{}", instance_name, hex::encode(blob)))
}

fn check_secret_len(secret: &[u8]) -> Result<(), CredentialError> {
    if secret.len() != SECRET_LEN {
        return Err(CredentialError::InvalidSecretLength(secret.len()));
    }
    Ok(())
}

fn cipher_for(secret: &[u8]) -> Result<Aes128GcmSiv, CredentialError> {
    let key = derive_key(secret, KDF_LABEL, KEY_LEN)?;
    Aes128GcmSiv::new_from_slice(&key).map_err(|_| CredentialError::Encryption)
}

/// Counter-mode HMAC-SHA256 KDF
///
/// Block `i` (from 1) is `HMAC(secret, BE32(i) || label)`. Unlike SP 800-108
/// no separator or output length is mixed in.
fn derive_key(secret: &[u8], label: &[u8], len: usize) -> Result<Vec<u8>, CredentialError> {
    let mut out = Vec::with_capacity(len + 32);
    let mut counter: u32 = 1;
    while out.len() < len {
        let mut mac = <HmacSha256 as Mac>::new_from_slice(secret)
            .map_err(|_| CredentialError::Encryption)?;
        mac.update(&counter.to_be_bytes());
        mac.update(label);
        out.extend_from_slice(&mac.finalize().into_bytes());
        counter += 1;
    }
    out.truncate(len);
    Ok(out)
}

fn encode_claims(claims: &AdminKeyClaims) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    encode_varint((FIELD_ISSUED_S << 3) | WIRE_VARINT, &mut buf);
    encode_varint(claims.issued_s, &mut buf);
    encode_varint((FIELD_MEMBER_ID << 3) | WIRE_VARINT, &mut buf);
    encode_varint(claims.member_id, &mut buf);
    if claims.is_read_only {
        encode_varint((FIELD_IS_READ_ONLY << 3) | WIRE_VARINT, &mut buf);
        encode_varint(1, &mut buf);
    }
    buf
}

fn decode_claims(mut buf: &[u8]) -> Result<AdminKeyClaims, CredentialError> {
    let mut claims = AdminKeyClaims {
        issued_s: 0,
        member_id: 0,
        is_read_only: false,
    };

    while !buf.is_empty() {
        let tag = decode_varint(&mut buf)?;
        if tag & 0x7 != WIRE_VARINT {
            return Err(CredentialError::MalformedToken(format!(
                "unexpected wire type {}",
                tag & 0x7
            )));
        }
        let value = decode_varint(&mut buf)?;
        match tag >> 3 {
            FIELD_ISSUED_S => claims.issued_s = value,
            FIELD_MEMBER_ID => claims.member_id = value,
            FIELD_IS_READ_ONLY => claims.is_read_only = value != 0,
            _ => {}
        }
    }

    Ok(claims)
}

/// Append `value` as a little-endian base-128 varint
fn encode_varint(mut value: u64, buf: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

fn decode_varint(buf: &mut &[u8]) -> Result<u64, CredentialError> {
    let bytes = *buf;
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i >= 10 {
            break;
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            *buf = &bytes[i + 1..];
            return Ok(value);
        }
    }
    Err(CredentialError::MalformedToken("truncated varint".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_secret() -> Vec<u8> {
        (0u8..32).collect()
    }

    #[test]
    fn test_varint_encoding() {
        let cases: [(u64, &[u8]); 4] = [
            (0, &[0x00]),
            (127, &[0x7f]),
            (128, &[0x80, 0x01]),
            (300, &[0xac, 0x02]),
        ];
        for (value, expected) in cases {
            let mut buf = Vec::new();
            encode_varint(value, &mut buf);
            assert_eq!(buf, expected, "encoding {}", value);

            let mut slice = buf.as_slice();
            assert_eq!(decode_varint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_truncated_varint() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(matches!(
            decode_varint(&mut slice),
            Err(CredentialError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_kdf_known_answer() {
        let key = derive_key(&fixed_secret(), KDF_LABEL, 16).unwrap();
        assert_eq!(hex::encode(key), "ce918d08f04afa58eadfa56cf8eedc2a");
    }

    #[test]
    fn test_kdf_spans_multiple_blocks() {
        let key = derive_key(&fixed_secret(), KDF_LABEL, 40).unwrap();
        assert_eq!(
            hex::encode(key),
            "ce918d08f04afa58eadfa56cf8eedc2a8d97e66c2fa0aa5c8db072ee95dedf46c9ce31037a0f5f9b"
        );
    }

    #[test]
    fn test_claims_encoding() {
        let claims = AdminKeyClaims {
            issued_s: 1_700_000_000,
            member_id: 7,
            is_read_only: true,
        };
        assert_eq!(hex::encode(encode_claims(&claims)), "1080e2cfaa0618072801");

        let writable = AdminKeyClaims {
            is_read_only: false,
            ..claims
        };
        assert_eq!(hex::encode(encode_claims(&writable)), "1080e2cfaa061807");
    }

    #[test]
    fn test_admin_key_known_answer() {
        let claims = AdminKeyClaims {
            issued_s: 1_700_000_000,
            member_id: 7,
            is_read_only: true,
        };
        let nonce: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];
        let key = encrypt_admin_key("local", &fixed_secret(), &claims, &nonce).unwrap();
        assert_eq!(
            key,
            "local|01000102030405060708090a0b39e46138804d5e17474c22a3f55767cf2b9140d1f0be16b0dad7"
        );
    }

    #[test]
    fn test_issue_and_decrypt_round_trip() {
        let secret = generate_secret();
        let before = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let key = issue_admin_key("anonymous-dev", &secret, 42, true).unwrap();
        let after = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();

        assert!(key.starts_with("anonymous-dev|01"));

        let (name, claims) = decrypt_admin_key(&key, &secret).unwrap();
        assert_eq!(name, "anonymous-dev");
        assert_eq!(claims.member_id, 42);
        assert!(claims.is_read_only);
        assert!(claims.issued_s >= before && claims.issued_s <= after);
    }

    #[test]
    fn test_wrong_secret_fails_to_decrypt() {
        let key = issue_admin_key("local", &generate_secret(), 0, false).unwrap();
        let result = decrypt_admin_key(&key, &generate_secret());
        assert!(matches!(result, Err(CredentialError::Encryption)));
    }

    #[test]
    fn test_tampered_version_is_rejected() {
        let secret = generate_secret();
        let key = issue_admin_key("local", &secret, 0, false).unwrap();
        let tampered = key.replacen("|01", "|02", 1);
        assert!(matches!(
            decrypt_admin_key(&tampered, &secret),
            Err(CredentialError::UnsupportedVersion(2))
        ));
    }

    #[test]
    fn test_invalid_secret_length() {
        let result = issue_admin_key("local", &[0u8; 16], 0, false);
        assert!(matches!(result, Err(CredentialError::InvalidSecretLength(16))));
    }

    #[test]
    fn test_malformed_keys() {
        let secret = generate_secret();
        assert!(matches!(
            decrypt_admin_key("no-separator", &secret),
            Err(CredentialError::MalformedToken(_))
        ));
        assert!(matches!(
            decrypt_admin_key("local|zz", &secret),
            Err(CredentialError::MalformedToken(_))
        ));
        assert!(matches!(
            decrypt_admin_key("local|0100", &secret),
            Err(CredentialError::MalformedToken(_))
        ));
    }

    #[test]
    fn test_nonces_differ_between_keys() {
        let secret = generate_secret();
        let a = issue_admin_key("local", &secret, 0, false).unwrap();
        let b = issue_admin_key("local", &secret, 0, false).unwrap();
        assert_ne!(a, b);
    }
}
