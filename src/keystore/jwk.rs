//! Hand-written JSON-Web-Key export/import, in the same "helper serde
//! submodule" style as the teacher's `crypto/keys.rs::mod hex_bytes`. There
//! is no ecosystem crate for this shape that works identically on wasm32
//! and native, so the struct and its base64url helpers are small and
//! self-contained.

use crate::error::{Error, Result};
use rsa::{BigUint, RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};

mod b64url {
    use rsa::BigUint;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &BigUint, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, value.to_bytes_be());
        serializer.serialize_str(&encoded)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<BigUint, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, s)
            .map_err(serde::de::Error::custom)?;
        Ok(BigUint::from_bytes_be(&bytes))
    }

    pub mod opt {
        use super::*;

        pub fn serialize<S: Serializer>(value: &Option<BigUint>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
            match value {
                Some(v) => super::serialize(v, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Option<BigUint>, D::Error> {
            let s: Option<String> = Option::deserialize(deserializer)?;
            s.map(|s| {
                let bytes = base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, s)
                    .map_err(serde::de::Error::custom)?;
                Ok(BigUint::from_bytes_be(&bytes))
            })
            .transpose()
        }
    }
}

/// A JSON Web Key, RSA family. Private fields are only populated when
/// exporting a private key (`privateKeyString`); the identity string and
/// known-hosts table only ever carry the public fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Jwk {
    pub kty: String,
    #[serde(with = "b64url")]
    pub n: BigUint,
    #[serde(with = "b64url")]
    pub e: BigUint,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64url::opt")]
    pub d: Option<BigUint>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64url::opt")]
    pub p: Option<BigUint>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64url::opt")]
    pub q: Option<BigUint>,
}

impl Jwk {
    pub fn from_public_key(key: &RsaPublicKey) -> Jwk {
        Jwk { kty: "RSA".to_string(), n: key.n().clone(), e: key.e().clone(), d: None, p: None, q: None }
    }

    pub fn from_private_key(key: &RsaPrivateKey) -> Jwk {
        let primes = key.primes();
        Jwk {
            kty: "RSA".to_string(),
            n: key.n().clone(),
            e: key.e().clone(),
            d: Some(key.d().clone()),
            p: primes.first().cloned(),
            q: primes.get(1).cloned(),
        }
    }

    pub fn to_public_key(&self) -> Result<RsaPublicKey> {
        RsaPublicKey::new(self.n.clone(), self.e.clone())
            .map_err(|err| Error::Other(format!("invalid JWK public key: {err}")))
    }

    pub fn to_private_key(&self) -> Result<RsaPrivateKey> {
        let d = self.d.clone().ok_or_else(|| Error::Other("JWK is missing private exponent d".into()))?;
        let p = self.p.clone().ok_or_else(|| Error::Other("JWK is missing prime p".into()))?;
        let q = self.q.clone().ok_or_else(|| Error::Other("JWK is missing prime q".into()))?;
        let mut key = RsaPrivateKey::from_components(self.n.clone(), self.e.clone(), d, vec![p, q])
            .map_err(|err| Error::Other(format!("invalid JWK private key: {err}")))?;
        key.precompute().map_err(|err| Error::Other(format!("key precompute failed: {err}")))?;
        Ok(key)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Jwk serialization cannot fail")
    }

    pub fn from_json(s: &str) -> Result<Jwk> {
        serde_json::from_str(s).map_err(|err| Error::Other(format!("invalid JWK json: {err}")))
    }
}
