// src/bundle/signer.rs

//! Manifest signing with age-format Ed25519 keys.
//!
//! The secret key is an age-style bech32 string (`AGE-SECRET-KEY-1...`)
//! whose 32-byte payload seeds the Ed25519 keypair. The public key travels
//! independently as base64; when both are configured they must agree.
//! Verification is strict: bad base64, wrong lengths, an untrusted embedded
//! key, or a failed Ed25519 check all fail the whole bundle import.

use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;

const ENV_AGE_SECRET_KEY: &str = "AGE_SECRET_KEY";
const ENV_AGE_PUBLIC_KEY: &str = "AGE_PUBLIC_KEY";

/// Human-readable part of age secret keys (the bech32 prefix).
const AGE_SECRET_HRP: &str = "age-secret-key-";

/// Signs and verifies manifest payloads.
pub struct Signer {
    signing: Option<SigningKey>,
    verifying: Option<VerifyingKey>,
}

impl Signer {
    /// Build a signer from `AGE_SECRET_KEY` / `AGE_PUBLIC_KEY`.
    ///
    /// At least one must be set. A secret key alone can sign and verify; a
    /// public key alone can only verify.
    pub fn from_env() -> Result<Self> {
        let secret = std::env::var(ENV_AGE_SECRET_KEY).unwrap_or_default();
        let public = std::env::var(ENV_AGE_PUBLIC_KEY).unwrap_or_default();
        let secret = secret.trim();
        let public = public.trim();
        if secret.is_empty() && public.is_empty() {
            return Err(Error::Validation(format!(
                "{ENV_AGE_SECRET_KEY} or {ENV_AGE_PUBLIC_KEY} must be set"
            )));
        }
        Self::from_keys(
            (!secret.is_empty()).then_some(secret),
            (!public.is_empty()).then_some(public),
        )
    }

    pub fn from_keys(secret: Option<&str>, public_b64: Option<&str>) -> Result<Self> {
        let signing = match secret {
            Some(secret) => {
                let seed = decode_age_secret_key(secret)?;
                Some(SigningKey::from_bytes(&seed))
            }
            None => None,
        };

        let mut verifying = signing.as_ref().map(|key| key.verifying_key());

        if let Some(public_b64) = public_b64 {
            let decoded = BASE64
                .decode(public_b64)
                .map_err(|e| Error::Validation(format!("decode {ENV_AGE_PUBLIC_KEY}: {e}")))?;
            let bytes: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
                Error::Validation(format!(
                    "{ENV_AGE_PUBLIC_KEY} must decode to 32 bytes, got {}",
                    decoded.len()
                ))
            })?;
            let key = VerifyingKey::from_bytes(&bytes)
                .map_err(|e| Error::Validation(format!("invalid public key: {e}")))?;

            match verifying {
                Some(derived) if derived != key => {
                    return Err(Error::Validation(format!(
                        "{ENV_AGE_PUBLIC_KEY} does not match {ENV_AGE_SECRET_KEY}"
                    )));
                }
                _ => verifying = Some(key),
            }
        }

        Ok(Self { signing, verifying })
    }

    /// Base64 Ed25519 signature over the payload.
    pub fn sign(&self, payload: &[u8]) -> Result<String> {
        let key = self
            .signing
            .as_ref()
            .ok_or_else(|| Error::Validation("signer configured without secret key".to_string()))?;
        Ok(BASE64.encode(key.sign(payload).to_bytes()))
    }

    /// Verify a base64 signature against the payload.
    ///
    /// `manifest_public_key` is the key embedded in the manifest; when this
    /// signer also carries a locally trusted key the two must match.
    pub fn verify(
        &self,
        payload: &[u8],
        signature_b64: &str,
        manifest_public_key: &str,
    ) -> Result<()> {
        let sig_bytes = BASE64
            .decode(signature_b64.trim())
            .map_err(|e| Error::Integrity(format!("decode signature: {e}")))?;
        let sig_bytes: [u8; 64] = sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::Integrity(format!("invalid signature length {}", sig_bytes.len())))?;
        let signature = Signature::from_bytes(&sig_bytes);

        let mut key = self.verifying;
        if !manifest_public_key.is_empty() {
            let decoded = BASE64
                .decode(manifest_public_key)
                .map_err(|e| Error::Integrity(format!("decode manifest public key: {e}")))?;
            let bytes: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
                Error::Integrity(format!(
                    "manifest public key must be 32 bytes, got {}",
                    decoded.len()
                ))
            })?;
            let embedded = VerifyingKey::from_bytes(&bytes)
                .map_err(|e| Error::Integrity(format!("invalid manifest public key: {e}")))?;
            if let Some(trusted) = key {
                if trusted != embedded {
                    return Err(Error::Integrity(
                        "manifest signed by unexpected key".to_string(),
                    ));
                }
            }
            key = Some(embedded);
        }

        let key = key.ok_or_else(|| {
            Error::Integrity("no public key available for verification".to_string())
        })?;
        key.verify(payload, &signature)
            .map_err(|_| Error::Integrity("signature verification failed".to_string()))
    }

    pub fn public_key_base64(&self) -> String {
        self.verifying
            .map(|key| BASE64.encode(key.as_bytes()))
            .unwrap_or_default()
    }
}

/// Generate a fresh keypair: the age-format secret string and the base64
/// Ed25519 public key derived from its seed.
pub fn generate_key() -> (String, String) {
    let mut seed = [0u8; 32];
    OsRng.fill_bytes(&mut seed);
    let secret = encode_age_secret_key(&seed);
    let public = BASE64.encode(SigningKey::from_bytes(&seed).verifying_key().as_bytes());
    (secret, public)
}

fn decode_age_secret_key(raw: &str) -> Result<[u8; 32]> {
    let (hrp, payload) = bech32_decode(raw)?;
    if !hrp.eq_ignore_ascii_case(AGE_SECRET_HRP) {
        return Err(Error::Validation(format!("unexpected key prefix {hrp:?}")));
    }
    let seed = convert_bits(&payload, 5, 8, false)?;
    seed.as_slice()
        .try_into()
        .map_err(|_| Error::Validation(format!("unexpected seed length {}", seed.len())))
}

fn encode_age_secret_key(seed: &[u8; 32]) -> String {
    let data = convert_bits(seed, 8, 5, true).expect("padding conversion cannot fail");
    bech32_encode(AGE_SECRET_HRP, &data).to_uppercase()
}

// ---- bech32 (BIP-173) ----

const CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const GENERATOR: [u32; 5] = [0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3];

fn polymod(values: impl IntoIterator<Item = u8>) -> u32 {
    let mut chk: u32 = 1;
    for v in values {
        let top = (chk >> 25) as u8;
        chk = ((chk & 0x1ff_ffff) << 5) ^ u32::from(v);
        for (i, gen) in GENERATOR.iter().enumerate() {
            if (top >> i) & 1 == 1 {
                chk ^= gen;
            }
        }
    }
    chk
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    hrp.bytes()
        .map(|b| b >> 5)
        .chain(std::iter::once(0))
        .chain(hrp.bytes().map(|b| b & 31))
        .collect()
}

fn bech32_encode(hrp: &str, data: &[u8]) -> String {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0; 6]);
    let pm = polymod(values) ^ 1;

    let mut out = String::with_capacity(hrp.len() + 1 + data.len() + 6);
    out.push_str(hrp);
    out.push('1');
    for &d in data {
        out.push(CHARSET[d as usize] as char);
    }
    for i in 0..6 {
        let idx = ((pm >> (5 * (5 - i))) & 31) as usize;
        out.push(CHARSET[idx] as char);
    }
    out
}

fn bech32_decode(raw: &str) -> Result<(String, Vec<u8>)> {
    let has_lower = raw.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = raw.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(Error::Validation("mixed-case bech32 string".to_string()));
    }
    let lowered = raw.to_lowercase();

    let sep = lowered
        .rfind('1')
        .ok_or_else(|| Error::Validation("missing bech32 separator".to_string()))?;
    let (hrp, rest) = (&lowered[..sep], &lowered[sep + 1..]);
    if hrp.is_empty() || rest.len() < 6 {
        return Err(Error::Validation("malformed bech32 string".to_string()));
    }

    let mut data = Vec::with_capacity(rest.len());
    for c in rest.bytes() {
        let idx = CHARSET
            .iter()
            .position(|&x| x == c)
            .ok_or_else(|| Error::Validation(format!("invalid bech32 character {:?}", c as char)))?;
        data.push(idx as u8);
    }

    let mut values = hrp_expand(hrp);
    values.extend_from_slice(&data);
    if polymod(values) != 1 {
        return Err(Error::Validation("bech32 checksum mismatch".to_string()));
    }

    data.truncate(data.len() - 6);
    Ok((hrp.to_string(), data))
}

fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Result<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let maxv: u32 = (1 << to) - 1;
    let mut out = Vec::new();

    for &value in data {
        if u32::from(value) >> from != 0 {
            return Err(Error::Validation("invalid data range in bech32".to_string()));
        }
        acc = (acc << from) | u32::from(value);
        bits += from;
        while bits >= to {
            bits -= to;
            out.push(((acc >> bits) & maxv) as u8);
        }
    }

    if pad {
        if bits > 0 {
            out.push(((acc << (to - bits)) & maxv) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & maxv) != 0 {
        return Err(Error::Validation("invalid padding in bech32".to_string()));
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bech32_round_trip() {
        let seed = [7u8; 32];
        let encoded = encode_age_secret_key(&seed);
        assert!(encoded.starts_with("AGE-SECRET-KEY-1"));
        assert_eq!(decode_age_secret_key(&encoded).unwrap(), seed);
        // Case-insensitive decode
        assert_eq!(decode_age_secret_key(&encoded.to_lowercase()).unwrap(), seed);
    }

    #[test]
    fn bech32_rejects_corruption() {
        let (secret, _) = generate_key();
        let mut corrupted = secret.into_bytes();
        let last = corrupted.len() - 1;
        corrupted[last] = if corrupted[last] == b'Q' { b'P' } else { b'Q' };
        let corrupted = String::from_utf8(corrupted).unwrap();
        assert!(decode_age_secret_key(&corrupted).is_err());
    }

    #[test]
    fn rejects_wrong_prefix() {
        let data = convert_bits(&[1u8; 32], 8, 5, true).unwrap();
        let other = bech32_encode("age1something-", &data);
        assert!(decode_age_secret_key(&other).is_err());
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let (secret, public) = generate_key();
        let signer = Signer::from_keys(Some(&secret), None).unwrap();
        assert_eq!(signer.public_key_base64(), public);

        let payload = b"manifest payload";
        let signature = signer.sign(payload).unwrap();
        signer.verify(payload, &signature, &public).unwrap();

        // Verify-only configuration accepts the same signature
        let verifier = Signer::from_keys(None, Some(&public)).unwrap();
        verifier.verify(payload, &signature, &public).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_payload_and_signature() {
        let (secret, public) = generate_key();
        let signer = Signer::from_keys(Some(&secret), None).unwrap();
        let signature = signer.sign(b"payload").unwrap();

        assert!(matches!(
            signer.verify(b"tampered", &signature, &public),
            Err(Error::Integrity(_))
        ));
        assert!(matches!(
            signer.verify(b"payload", "bm90LWEtc2ln", &public),
            Err(Error::Integrity(_))
        ));
    }

    #[test]
    fn verify_rejects_untrusted_embedded_key() {
        let (secret, _) = generate_key();
        let (_, other_public) = generate_key();
        let signer = Signer::from_keys(Some(&secret), None).unwrap();
        let signature = signer.sign(b"payload").unwrap();

        let err = signer.verify(b"payload", &signature, &other_public).unwrap_err();
        assert!(matches!(err, Error::Integrity(_)));
    }

    #[test]
    fn mismatched_configured_keys_fail_initialization() {
        let (secret, _) = generate_key();
        let (_, other_public) = generate_key();
        assert!(matches!(
            Signer::from_keys(Some(&secret), Some(&other_public)),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn signing_without_secret_key_fails() {
        let (_, public) = generate_key();
        let verifier = Signer::from_keys(None, Some(&public)).unwrap();
        assert!(matches!(verifier.sign(b"x"), Err(Error::Validation(_))));
    }
}
