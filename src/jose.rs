//! JOSE signing layer: owns the account's ECDSA P-256 key pair, and knows how
//! to produce a flattened JWS serialization (RFC 7515 §7.2.2) plus a JWK
//! thumbprint (RFC 7638). Deliberately self-contained - no third-party JOSE
//! crate is used, since the one subtlety (raw r||s ES256 signatures rather
//! than DER) is small enough to own outright and is exactly the kind of
//! detail a borrowed library tends to get wrong for ACME's purposes.

use openssl::bn::BigNum;
use openssl::ec::{EcGroup, EcKey};
use openssl::ecdsa::EcdsaSig;
use openssl::hash::{hash, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::Private;
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::util::b64;

/// A single fixed-width (32 byte) encoded EC coordinate.
fn coordinate_b64(n: &BigNum) -> Result<String> {
    let mut padded = vec![0u8; 32];
    let bytes = n.to_vec();
    let start = 32 - bytes.len();
    padded[start..].copy_from_slice(&bytes);
    Ok(b64(&padded))
}

pub fn p256_group() -> Result<EcGroup> {
    Ok(EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?)
}

/// Generates a fresh ECDSA P-256 key pair - used both for the long-lived
/// account key and for the per-order certificate key.
pub fn generate_p256_key() -> Result<EcKey<Private>> {
    let group = p256_group()?;
    Ok(EcKey::generate(&group)?)
}

/// The public-key JWK `{kty:"EC", crv:"P-256", x, y}`.
#[derive(Debug, Clone, Serialize)]
pub struct Jwk {
    pub kty: &'static str,
    pub crv: &'static str,
    pub x: String,
    pub y: String,
}

pub fn jwk(key: &EcKey<Private>) -> Result<Jwk> {
    let group = p256_group()?;
    let mut ctx = openssl::bn::BigNumContext::new()?;
    let mut x = BigNum::new()?;
    let mut y = BigNum::new()?;
    key.public_key()
        .affine_coordinates_gfp(&group, &mut x, &mut y, &mut ctx)?;

    Ok(Jwk {
        kty: "EC",
        crv: "P-256",
        x: coordinate_b64(&x)?,
        y: coordinate_b64(&y)?,
    })
}

/// RFC 7638 thumbprint: SHA-256 over the canonical JSON
/// `{"crv":"P-256","kty":"EC","x":"...","y":"..."}`, keys in exactly that
/// lexicographic order, no whitespace. Computed directly from the string
/// rather than through `serde_json`'s map ordering, so the key order is
/// guaranteed regardless of how the JWK itself was produced.
pub fn thumbprint(jwk: &Jwk) -> Result<[u8; 32]> {
    let canonical = format!(
        r#"{{"crv":"{}","kty":"{}","x":"{}","y":"{}"}}"#,
        jwk.crv, jwk.kty, jwk.x, jwk.y
    );
    let digest = hash(MessageDigest::sha256(), canonical.as_bytes())?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Flattened JWS serialization, as sent to the ACME server.
#[derive(Debug, Serialize)]
pub struct FlattenedJws {
    pub protected: String,
    pub payload: String,
    pub signature: String,
}

/// Signs `payload` (or, if `None`, produces the empty-string POST-as-GET
/// payload) under `protected_header` with the given key, producing a
/// flattened JWS.
pub fn sign(
    key: &EcKey<Private>,
    protected_header: &Value,
    payload: Option<&Value>,
) -> Result<FlattenedJws> {
    let header_json = serde_json::to_vec(protected_header)?;
    let header_b64 = b64(&header_json);

    let payload_b64 = match payload {
        Some(value) => b64(&serde_json::to_vec(value)?),
        None => String::new(),
    };

    let signing_input = format!("{}.{}", header_b64, payload_b64);
    let digest = hash(MessageDigest::sha256(), signing_input.as_bytes())?;

    let sig = EcdsaSig::sign(&digest, key)?;
    let mut raw = Vec::with_capacity(64);
    raw.extend(pad32(sig.r())?);
    raw.extend(pad32(sig.s())?);

    Ok(FlattenedJws {
        protected: header_b64,
        payload: payload_b64,
        signature: b64(&raw),
    })
}

fn pad32(n: &openssl::bn::BigNumRef) -> Result<Vec<u8>> {
    let mut padded = vec![0u8; 32];
    let bytes = n.to_vec();
    let start = 32 - bytes.len();
    padded[start..].copy_from_slice(&bytes);
    Ok(padded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn thumbprint_is_stable_regardless_of_field_construction_order() {
        let key = generate_p256_key().unwrap();
        let jwk_a = jwk(&key).unwrap();

        // Build an equivalent JWK by hand, field order reversed, and confirm
        // the thumbprint function still produces the canonical ordering.
        let jwk_b = Jwk {
            kty: jwk_a.kty,
            crv: jwk_a.crv,
            x: jwk_a.x.clone(),
            y: jwk_a.y.clone(),
        };

        assert_eq!(thumbprint(&jwk_a).unwrap(), thumbprint(&jwk_b).unwrap());
    }

    #[test]
    fn signature_is_64_raw_bytes_and_verifies() {
        let key = generate_p256_key().unwrap();
        let header = json!({"alg": "ES256", "nonce": "abc", "url": "https://example.test/x"});
        let payload = json!({"hello": "world"});

        let jws = sign(&key, &header, Some(&payload)).unwrap();
        let raw_sig = base64::decode_config(&jws.signature, base64::URL_SAFE_NO_PAD).unwrap();
        assert_eq!(raw_sig.len(), 64);

        let signing_input = format!("{}.{}", jws.protected, jws.payload);
        let digest = hash(MessageDigest::sha256(), signing_input.as_bytes()).unwrap();

        let r = BigNum::from_slice(&raw_sig[..32]).unwrap();
        let s = BigNum::from_slice(&raw_sig[32..]).unwrap();
        let ecdsa_sig = EcdsaSig::from_private_components(r, s).unwrap();

        let public_only = EcKey::from_public_key(&p256_group().unwrap(), key.public_key()).unwrap();
        assert!(ecdsa_sig.verify(&digest, &public_only).unwrap());
    }

    #[test]
    fn post_as_get_encodes_empty_payload() {
        let key = generate_p256_key().unwrap();
        let header = json!({"alg": "ES256", "nonce": "abc", "url": "https://example.test/x"});
        let jws = sign(&key, &header, None).unwrap();
        assert_eq!(jws.payload, "");
    }
}
