//! Proof of possession
//!
//! A BIP-340 Schnorr signature by a factor key over a trust-anchor issued
//! challenge. The challenge is single-use: the trust anchor binds it to one
//! conflicting recovery and refuses it once spent or expired.
//!
//! ```text
//! msg = SHA256("trikey/proof-of-possession/v1" || challenge)
//! sig = schnorr_sign(factor_key, msg)
//! ```

use crate::factor::PhysicalFactor;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{schnorr, Message, Secp256k1};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use bitcoin::secp256k1::{Keypair, XOnlyPublicKey};

const PROOF_TAG: &[u8] = b"trikey/proof-of-possession/v1";

/// Errors from proof handling
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProofError {
    #[error("Invalid challenge: {0}")]
    InvalidChallenge(String),

    #[error("Proof was signed for a different challenge")]
    ChallengeMismatch,

    #[error("Proof was signed by an unexpected key")]
    KeyMismatch,

    #[error("Proof is for the {actual} factor, expected {expected}")]
    WrongFactor {
        expected: PhysicalFactor,
        actual: PhysicalFactor,
    },

    #[error("Signature verification failed")]
    BadSignature,

    #[error("Invalid secret key")]
    InvalidSecretKey,
}

/// Build a factor keypair from raw secret key bytes.
pub fn keypair_from_secret_bytes(bytes: &[u8; 32]) -> Result<Keypair, ProofError> {
    let secp = Secp256k1::new();
    Keypair::from_seckey_slice(&secp, bytes).map_err(|_| ProofError::InvalidSecretKey)
}

/// A 32-byte challenge issued by the trust anchor
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Challenge([u8; 32]);

impl Challenge {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Random challenge (32 bytes from CSPRNG)
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, ProofError> {
        let bytes = hex::decode(s).map_err(|e| ProofError::InvalidChallenge(e.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ProofError::InvalidChallenge("challenge must be 32 bytes".into()))?;
        Ok(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn signing_message(&self) -> Message {
        let mut preimage = Vec::with_capacity(PROOF_TAG.len() + 32);
        preimage.extend_from_slice(PROOF_TAG);
        preimage.extend_from_slice(&self.0);
        Message::from_digest(sha256::Hash::hash(&preimage).to_byte_array())
    }
}

impl fmt::Display for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Challenge({})", hex::encode(self.0))
    }
}

impl Serialize for Challenge {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Challenge {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Challenge::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Evidence that the holder of `factor` signed `challenge`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofOfPossession {
    pub factor: PhysicalFactor,
    pub challenge: Challenge,
    pub public_key: XOnlyPublicKey,
    pub signature: schnorr::Signature,
}

impl ProofOfPossession {
    /// Sign `challenge` with a factor key.
    pub fn sign(keypair: &Keypair, factor: PhysicalFactor, challenge: Challenge) -> Self {
        let secp = Secp256k1::new();
        let mut aux = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut aux);
        let signature =
            secp.sign_schnorr_with_aux_rand(&challenge.signing_message(), keypair, &aux);
        Self {
            factor,
            challenge,
            public_key: keypair.x_only_public_key().0,
            signature,
        }
    }

    /// Check the proof answers `expected_challenge` and was signed by
    /// `expected_key`.
    pub fn verify(
        &self,
        expected_key: &XOnlyPublicKey,
        expected_challenge: &Challenge,
    ) -> Result<(), ProofError> {
        if &self.challenge != expected_challenge {
            return Err(ProofError::ChallengeMismatch);
        }
        if &self.public_key != expected_key {
            return Err(ProofError::KeyMismatch);
        }
        let secp = Secp256k1::verification_only();
        secp.verify_schnorr(
            &self.signature,
            &self.challenge.signing_message(),
            &self.public_key,
        )
        .map_err(|_| ProofError::BadSignature)
    }

    /// Check the proof comes from the expected factor.
    pub fn ensure_factor(&self, expected: PhysicalFactor) -> Result<(), ProofError> {
        if self.factor != expected {
            return Err(ProofError::WrongFactor {
                expected,
                actual: self.factor,
            });
        }
        Ok(())
    }
}
