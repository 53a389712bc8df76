//! Sealing Scheme
//!
//! The pluggable primitive behind [`SealedValue`](super::SealedValue) and the
//! proof engine. Swapping in a homomorphic or threshold backend means
//! implementing [`SealingScheme`]; nothing in the ledger changes.
//!
//! # EnclaveScheme
//!
//! Models a trusted-execution boundary:
//! - **Encryption**: ChaCha20-Poly1305, fresh random nonce per seal (the
//!   blinding factor), `tag || binding` as associated data
//! - **Attestation**: Ed25519 signature by the enclave key over a proof
//!   statement. Anyone holding the verifying key can check it.
//! - **Homomorphic ops**: evaluated inside the boundary and re-sealed, so
//!   callers only ever see ciphertexts

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use super::{keccak, Binding, SealedBlob, SealedError, TypeTag, NONCE_LEN};

/// Sealed-computation primitive consumed by the ledger
pub trait SealingScheme: Send + Sync {
    /// Encrypt `plaintext` under `binding`
    fn seal(&self, tag: TypeTag, plaintext: u64, binding: Binding) -> Result<SealedBlob, SealedError>;

    /// Decrypt inside the scheme boundary. Authorization is the caller's job.
    fn unseal(&self, blob: &SealedBlob) -> Result<u64, SealedError>;

    /// Sign a proof statement
    fn attest(&self, statement: &[u8]) -> Vec<u8>;

    /// Check a statement signature produced by `attest`
    fn verify_attestation(&self, statement: &[u8], attestation: &[u8]) -> bool;

    /// Sealed `a + b`, re-bound to `binding`
    fn add(&self, a: &SealedBlob, b: &SealedBlob, binding: Binding) -> Result<SealedBlob, SealedError> {
        ensure_same_tag(a, b)?;
        let sum = self
            .unseal(a)?
            .checked_add(self.unseal(b)?)
            .ok_or(SealedError::Overflow)?;
        self.seal(a.tag, sum, binding)
    }

    /// Sealed `a - b`, re-bound to `binding`
    fn sub(&self, a: &SealedBlob, b: &SealedBlob, binding: Binding) -> Result<SealedBlob, SealedError> {
        ensure_same_tag(a, b)?;
        let diff = self
            .unseal(a)?
            .checked_sub(self.unseal(b)?)
            .ok_or(SealedError::Overflow)?;
        self.seal(a.tag, diff, binding)
    }

    /// `a <= b` without exposing either operand
    fn le(&self, a: &SealedBlob, b: &SealedBlob) -> Result<bool, SealedError> {
        ensure_same_tag(a, b)?;
        Ok(self.unseal(a)? <= self.unseal(b)?)
    }
}

fn ensure_same_tag(a: &SealedBlob, b: &SealedBlob) -> Result<(), SealedError> {
    if a.tag != b.tag {
        return Err(SealedError::TagMismatch {
            expected: a.tag,
            found: b.tag,
        });
    }
    Ok(())
}

fn associated_data(tag: TypeTag, binding: &Binding) -> Vec<u8> {
    let mut aad = Vec::with_capacity(1 + 32);
    aad.push(tag.to_u8());
    aad.extend_from_slice(binding.as_bytes());
    aad
}

/// Verify an attestation with only the enclave's public key
pub fn verify_attestation_with(key: &VerifyingKey, statement: &[u8], attestation: &[u8]) -> bool {
    match Signature::from_slice(attestation) {
        Ok(signature) => key.verify(statement, &signature).is_ok(),
        Err(_) => false,
    }
}

/// Trusted-execution sealing scheme
pub struct EnclaveScheme {
    cipher: ChaCha20Poly1305,
    signing_key: SigningKey,
}

impl EnclaveScheme {
    /// Fresh enclave keys from the OS RNG
    pub fn generate() -> Self {
        let mut seed = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut seed[..]);
        Self::from_seed(&seed)
    }

    /// Deterministic keys from a 32-byte seed (restarts against durable storage)
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let encryption_key = Zeroizing::new(keccak(&[b"stealth-yield/enclave/encryption", seed]));
        let signing_seed = Zeroizing::new(keccak(&[b"stealth-yield/enclave/attestation", seed]));

        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(&encryption_key[..])),
            signing_key: SigningKey::from_bytes(&signing_seed),
        }
    }

    /// Parse a hex seed (`SEALING_KEY`), with or without `0x`
    pub fn from_hex_seed(seed_hex: &str) -> Result<Self, SealedError> {
        let raw = hex::decode(seed_hex.trim_start_matches("0x"))
            .map_err(|e| SealedError::Backend(format!("invalid sealing key hex: {e}")))?;
        let seed: Zeroizing<[u8; 32]> = Zeroizing::new(
            raw.as_slice()
                .try_into()
                .map_err(|_| SealedError::Backend(format!("sealing key must be 32 bytes, got {}", raw.len())))?,
        );
        Ok(Self::from_seed(&seed))
    }

    /// Public key third parties use to check proofs
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }
}

impl std::fmt::Debug for EnclaveScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnclaveScheme")
            .field("verifying_key", &hex::encode(self.verifying_key().as_bytes()))
            .finish_non_exhaustive()
    }
}

impl SealingScheme for EnclaveScheme {
    fn seal(&self, tag: TypeTag, plaintext: u64, binding: Binding) -> Result<SealedBlob, SealedError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let aad = associated_data(tag, &binding);
        let ciphertext = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext.to_le_bytes(),
                    aad: &aad,
                },
            )
            .map_err(|e| SealedError::Backend(format!("encryption failed: {e}")))?;

        Ok(SealedBlob {
            tag,
            binding,
            nonce,
            ciphertext,
        })
    }

    fn unseal(&self, blob: &SealedBlob) -> Result<u64, SealedError> {
        let aad = associated_data(blob.tag, &blob.binding);
        let plaintext = self
            .cipher
            .decrypt(
                Nonce::from_slice(&blob.nonce),
                Payload {
                    msg: &blob.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| SealedError::Malformed("ciphertext authentication failed".to_string()))?;

        let bytes: [u8; 8] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| SealedError::Malformed(format!("plaintext length {}", plaintext.len())))?;
        Ok(u64::from_le_bytes(bytes))
    }

    fn attest(&self, statement: &[u8]) -> Vec<u8> {
        self.signing_key.sign(statement).to_bytes().to_vec()
    }

    fn verify_attestation(&self, statement: &[u8], attestation: &[u8]) -> bool {
        verify_attestation_with(&self.verifying_key(), statement, attestation)
    }
}
