//! BLS12-381 finalizer keys and signatures (min-pk variant).
//!
//! Public keys are 48-byte compressed G1 points, signatures are 96-byte
//! compressed G2 points. Both are stored as plain byte arrays so they can be
//! hashed, ordered and encoded; they are decompressed on use.

use blst::min_pk::{
    AggregatePublicKey, AggregateSignature, PublicKey as BlstPublicKey, SecretKey,
    Signature as BlstSignature,
};
use blst::BLST_ERROR;
use rand::RngCore;
use sbor::prelude::BasicSbor;
use std::fmt;
use thiserror::Error;

/// Hash-to-curve domain separation tag (proof-of-possession scheme).
pub const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Errors from BLS operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid public key encoding")]
    InvalidPublicKey,
    #[error("invalid signature encoding")]
    InvalidSignature,
    #[error("nothing to aggregate")]
    EmptyAggregate,
    #[error("aggregation failed: {0}")]
    Aggregation(String),
}

/// Compressed BLS public key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct PublicKey(pub [u8; 48]);

/// Compressed BLS signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash, BasicSbor)]
#[sbor(transparent)]
pub struct Signature(pub [u8; 96]);

impl PublicKey {
    fn to_blst(self) -> Result<BlstPublicKey, CryptoError> {
        BlstPublicKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Verify a single signature over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &Signature) -> bool {
        let (Ok(pk), Ok(sig)) = (self.to_blst(), signature.to_blst()) else {
            return false;
        };
        sig.verify(true, msg, BLS_DST, &[], &pk, true) == BLST_ERROR::BLST_SUCCESS
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PK({})", &self.to_hex()[..12])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PUB_BLS_{}", &self.to_hex()[..16])
    }
}

impl Signature {
    /// A placeholder signature (not a valid curve point).
    pub const fn zero() -> Self {
        Signature([0u8; 96])
    }

    fn to_blst(self) -> Result<BlstSignature, CryptoError> {
        BlstSignature::from_bytes(&self.0).map_err(|_| CryptoError::InvalidSignature)
    }

    /// Aggregate signatures into one.
    pub fn aggregate(signatures: &[Signature]) -> Result<Signature, CryptoError> {
        if signatures.is_empty() {
            return Err(CryptoError::EmptyAggregate);
        }
        let parsed = signatures
            .iter()
            .map(|s| s.to_blst())
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&BlstSignature> = parsed.iter().collect();
        let agg = AggregateSignature::aggregate(&refs, true)
            .map_err(|e| CryptoError::Aggregation(format!("{e:?}")))?;
        Ok(Signature(agg.to_signature().compress()))
    }

    /// Verify an aggregate signature where each group of signers signed one message.
    ///
    /// Public keys within a group are aggregated first; the groups' messages
    /// must be distinct.
    pub fn verify_aggregate(&self, groups: &[(&[PublicKey], &[u8])]) -> bool {
        let Ok(sig) = self.to_blst() else {
            return false;
        };
        let mut group_keys = Vec::with_capacity(groups.len());
        let mut messages: Vec<&[u8]> = Vec::with_capacity(groups.len());
        for (keys, msg) in groups {
            if keys.is_empty() {
                continue;
            }
            let Ok(parsed) = keys.iter().map(|k| k.to_blst()).collect::<Result<Vec<_>, _>>()
            else {
                return false;
            };
            let refs: Vec<&BlstPublicKey> = parsed.iter().collect();
            let Ok(agg) = AggregatePublicKey::aggregate(&refs, true) else {
                return false;
            };
            group_keys.push(agg.to_public_key());
            messages.push(msg);
        }
        match group_keys.len() {
            0 => false,
            1 => {
                sig.verify(true, messages[0], BLS_DST, &[], &group_keys[0], false)
                    == BLST_ERROR::BLST_SUCCESS
            }
            _ => {
                let pk_refs: Vec<&BlstPublicKey> = group_keys.iter().collect();
                sig.aggregate_verify(true, &messages, BLS_DST, &pk_refs, false)
                    == BLST_ERROR::BLST_SUCCESS
            }
        }
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sig({})", &hex::encode(&self.0[..6]))
    }
}

/// A finalizer signing key.
#[derive(Clone)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    /// Derive a key pair deterministically from 32 bytes of key material.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let secret = match SecretKey::key_gen(seed, &[]) {
            Ok(sk) => sk,
            // key_gen only rejects input key material shorter than 32 bytes.
            Err(e) => unreachable!("32-byte ikm rejected by key_gen: {e:?}"),
        };
        let public = PublicKey(secret.sk_to_pk().compress());
        Self { secret, public }
    }

    /// Generate a fresh random key pair.
    pub fn generate() -> Self {
        let mut seed = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut seed);
        Self::from_seed(&seed)
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    pub fn sign(&self, msg: &[u8]) -> Signature {
        Signature(self.secret.sign(msg, BLS_DST, &[]).compress())
    }

    /// Raw secret key bytes, for writing key files.
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Load a key pair from raw secret key bytes.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let secret = SecretKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
        let public = PublicKey(secret.sk_to_pk().compress());
        Ok(Self { secret, public })
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let key = KeyPair::from_seed(&[7u8; 32]);
        let sig = key.sign(b"block");
        assert!(key.public_key().verify(b"block", &sig));
        assert!(!key.public_key().verify(b"other", &sig));
    }

    #[test]
    fn test_from_seed_is_deterministic() {
        let a = KeyPair::from_seed(&[1u8; 32]);
        let b = KeyPair::from_seed(&[1u8; 32]);
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), KeyPair::from_seed(&[2u8; 32]).public_key());
    }

    #[test]
    fn test_aggregate_same_message() {
        let keys: Vec<KeyPair> = (0..3u8).map(|i| KeyPair::from_seed(&[i + 1; 32])).collect();
        let sigs: Vec<Signature> = keys.iter().map(|k| k.sign(b"digest")).collect();
        let agg = Signature::aggregate(&sigs).unwrap();
        let pks: Vec<PublicKey> = keys.iter().map(|k| k.public_key()).collect();

        assert!(agg.verify_aggregate(&[(&pks, b"digest")]));
        assert!(!agg.verify_aggregate(&[(&pks[..2], b"digest")]));
    }

    #[test]
    fn test_aggregate_two_messages() {
        let keys: Vec<KeyPair> = (0..4u8).map(|i| KeyPair::from_seed(&[i + 9; 32])).collect();
        let strong: Vec<PublicKey> = keys[..3].iter().map(|k| k.public_key()).collect();
        let weak: Vec<PublicKey> = keys[3..].iter().map(|k| k.public_key()).collect();

        let mut sigs: Vec<Signature> = keys[..3].iter().map(|k| k.sign(b"strong")).collect();
        sigs.push(keys[3].sign(b"weak"));
        let agg = Signature::aggregate(&sigs).unwrap();

        assert!(agg.verify_aggregate(&[(&strong, b"strong"), (&weak, b"weak")]));
        assert!(!agg.verify_aggregate(&[(&strong, b"strong"), (&weak, b"strong2")]));
    }

    #[test]
    fn test_zero_signature_never_verifies() {
        let key = KeyPair::from_seed(&[3u8; 32]);
        assert!(!key.public_key().verify(b"x", &Signature::zero()));
        assert_eq!(Signature::aggregate(&[]), Err(CryptoError::EmptyAggregate));
    }

    #[test]
    fn test_secret_bytes_roundtrip() {
        let key = KeyPair::from_seed(&[5u8; 32]);
        let restored = KeyPair::from_secret_bytes(&key.secret_bytes()).unwrap();
        assert_eq!(restored.public_key(), key.public_key());
    }
}
