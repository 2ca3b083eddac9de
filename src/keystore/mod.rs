//! # Keystore and identity
//!
//! Each peer holds a 2048-bit RSA keypair used only for PSS signing
//! (SPEC_FULL.md §4.8) — there is no encryption beyond the DTLS-SRTP the
//! transport already provides. The keypair is generated once, persisted to
//! [`crate::storage`] as JWK strings, and re-loaded on every later session.
//!
//! An identity string is `barename|publicKeyString`: the thing a peer
//! announces over signaling so others can bind the name to the key before
//! trusting it (see [`known_hosts`]).
//!
//! The private key is zeroized on drop, and the serialized private JWK
//! never lives in an un-zeroized `String` between `Storage` and the key
//! material itself.

mod jwk;
pub mod known_hosts;

pub use jwk::Jwk;
pub use known_hosts::barename;

use crate::error::{Error, Result};
use crate::storage::{keys, Storage};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pss::{Signature, SigningKey, VerifyingKey};
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use std::rc::Rc;
use zeroize::{Zeroize, Zeroizing};

const KEY_BITS: usize = 2048;
const CHALLENGE_LEN: usize = 32;

/// A peer's own signing identity. Does not implement `Clone`: there is
/// exactly one of these per client, held behind an `Rc`.
pub struct Keystore {
    private_key: RsaPrivateKey,
    public_key_string: String,
}

impl Drop for Keystore {
    fn drop(&mut self) {
        self.private_key.zeroize();
    }
}

impl Keystore {
    /// Generates a fresh keypair, persists it, and returns the keystore.
    /// Overwrites whatever keypair was previously stored.
    pub fn generate(storage: &dyn Storage) -> Result<Rc<Keystore>> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, KEY_BITS).map_err(|err| Error::Other(format!("key generation failed: {err}")))?;
        let keystore = Keystore::from_private_key(private_key);
        keystore.persist(storage)?;
        Ok(Rc::new(keystore))
    }

    /// Loads the persisted keypair, generating one if `force` is set or
    /// none exists yet.
    pub fn load(storage: &dyn Storage, force: bool) -> Result<Rc<Keystore>> {
        if !force {
            if let Some(raw) = storage.get(keys::PRIVATE_KEY_STRING) {
                let raw = Zeroizing::new(raw);
                let jwk = Jwk::from_json(&raw)?;
                let private_key = jwk.to_private_key()?;
                return Ok(Rc::new(Keystore::from_private_key(private_key)));
            }
        }
        Keystore::generate(storage)
    }

    fn from_private_key(private_key: RsaPrivateKey) -> Keystore {
        let public_key_string = Jwk::from_public_key(&private_key.to_public_key()).to_json();
        Keystore { private_key, public_key_string }
    }

    fn persist(&self, storage: &dyn Storage) -> Result<()> {
        let private_json = Zeroizing::new(Jwk::from_private_key(&self.private_key).to_json());
        storage.set(keys::PRIVATE_KEY_STRING, &private_json)?;
        storage.set(keys::PUBLIC_KEY_STRING, &self.public_key_string)
    }

    pub fn public_key_string(&self) -> &str {
        &self.public_key_string
    }

    /// `barename|publicKeyString`, the string a peer announces so others
    /// can bind it in their known-hosts table.
    pub fn identity_string(&self, bare_name: &str) -> String {
        format!("{bare_name}|{}", self.public_key_string)
    }

    /// Signs `challenge`, returning the raw signature rendered with the
    /// same latin-1 byte-per-char encoding as the challenge itself.
    pub fn sign(&self, challenge: &str) -> Result<String> {
        let signing_key = SigningKey::<Sha256>::new(self.private_key.clone());
        let signature = signing_key.sign_with_rng(&mut OsRng, challenge.as_bytes());
        Ok(bytes_to_latin1(signature.to_bytes().as_ref()))
    }

    /// Verifies a signature against a counterpart's public-key string
    /// (a JWK JSON document, as produced by [`public_key_string`]).
    pub fn verify(public_key_string: &str, signature: &str, challenge: &str) -> Result<bool> {
        let public_key: RsaPublicKey = Jwk::from_json(public_key_string)?.to_public_key()?;
        let signature_bytes = latin1_to_bytes(signature)
            .ok_or_else(|| Error::Other("signature is not a valid latin-1 string".into()))?;
        let signature = Signature::try_from(signature_bytes.as_slice())
            .map_err(|err| Error::Other(format!("malformed signature: {err}")))?;
        let verifying_key = VerifyingKey::<Sha256>::new(public_key);
        Ok(verifying_key.verify(challenge.as_bytes(), &signature).is_ok())
    }
}

/// A fresh 32-byte challenge, rendered as a 32-character latin-1 string
/// (one char per byte) so it travels as plain JSON text.
pub fn generate_challenge() -> String {
    let mut bytes = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes_to_latin1(&bytes)
}

fn bytes_to_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

fn latin1_to_bytes(s: &str) -> Option<Vec<u8>> {
    s.chars().map(|c| u8::try_from(c as u32).ok()).collect()
}
