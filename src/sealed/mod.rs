//! Sealed Values
//!
//! A `SealedValue<T>` is an encrypted scalar plus the content identifier that
//! proofs and events refer to. The plaintext is only reachable after an
//! authorized `reveal`, which caches it on the value for good.
//!
//! # Binding
//!
//! Every sealed value is bound to a [`Binding`] (the hashed identity of the
//! participant it belongs to). The binding is authenticated by the cipher, so
//! a value cannot be re-attributed to another owner without breaking it.
//!
//! # Blob Layout
//!
//! ```text
//! ┌──────┬──────────────┬────────────┬─────────────────────┐
//! │ tag  │ binding (32) │ nonce (12) │ ciphertext (8 + 16) │
//! └──────┴──────────────┴────────────┴─────────────────────┘
//! ```

mod scheme;

pub use scheme::{verify_attestation_with, EnclaveScheme, SealingScheme};

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize, Serializer};
use sha3::{Digest, Keccak256};
use thiserror::Error;

use crate::types::OwnerId;

/// Nonce length for ChaCha20-Poly1305 (12 bytes)
pub const NONCE_LEN: usize = 12;

const BINDING_LEN: usize = 32;

/// Sealed value errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SealedError {
    #[error("sealed value has not been revealed")]
    NotRevealed,

    #[error("caller is not authorized to reveal this value")]
    Unauthorized,

    #[error("value was already revealed with a different result")]
    AlreadyRevealed,

    #[error("type tag mismatch: expected {expected:?}, found {found:?}")]
    TagMismatch { expected: TypeTag, found: TypeTag },

    #[error("arithmetic on sealed values out of range")]
    Overflow,

    #[error("malformed sealed value: {0}")]
    Malformed(String),

    #[error("sealing backend failure: {0}")]
    Backend(String),
}

// ============================================================================
// Plaintext types
// ============================================================================

/// Plaintext type tag carried by every sealed value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    Amount,
    Rate,
    Duration,
    Count,
}

impl TypeTag {
    pub fn to_u8(self) -> u8 {
        match self {
            TypeTag::Amount => 0,
            TypeTag::Rate => 1,
            TypeTag::Duration => 2,
            TypeTag::Count => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(TypeTag::Amount),
            1 => Some(TypeTag::Rate),
            2 => Some(TypeTag::Duration),
            3 => Some(TypeTag::Count),
            _ => None,
        }
    }
}

/// A scalar that can be sealed.
///
/// All plaintexts travel through the scheme as `u64`.
pub trait Plaintext: Copy + Eq + fmt::Debug + Send + Sync + 'static {
    const TAG: TypeTag;

    fn to_raw(self) -> u64;

    fn from_raw(raw: u64) -> Result<Self, SealedError>;
}

/// Amount in the smallest settlement unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(pub u64);

/// Yield rate in basis points
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rate(pub u32);

/// Lock duration in seconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Duration(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Count(pub u64);

impl Plaintext for Amount {
    const TAG: TypeTag = TypeTag::Amount;

    fn to_raw(self) -> u64 {
        self.0
    }

    fn from_raw(raw: u64) -> Result<Self, SealedError> {
        Ok(Amount(raw))
    }
}

impl Plaintext for Rate {
    const TAG: TypeTag = TypeTag::Rate;

    fn to_raw(self) -> u64 {
        u64::from(self.0)
    }

    fn from_raw(raw: u64) -> Result<Self, SealedError> {
        u32::try_from(raw)
            .map(Rate)
            .map_err(|_| SealedError::Malformed(format!("rate {} exceeds u32", raw)))
    }
}

impl Plaintext for Duration {
    const TAG: TypeTag = TypeTag::Duration;

    fn to_raw(self) -> u64 {
        self.0
    }

    fn from_raw(raw: u64) -> Result<Self, SealedError> {
        Ok(Duration(raw))
    }
}

impl Plaintext for Count {
    const TAG: TypeTag = TypeTag::Count;

    fn to_raw(self) -> u64 {
        self.0
    }

    fn from_raw(raw: u64) -> Result<Self, SealedError> {
        Ok(Count(raw))
    }
}

// ============================================================================
// Binding / ContentId
// ============================================================================

/// Identity a sealed value belongs to (Keccak256 of the participant id)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Binding([u8; BINDING_LEN]);

impl Binding {
    /// Binding for a participant (position owner or pool manager)
    pub fn owner(owner: &OwnerId) -> Self {
        Self(keccak(&[b"stealth-yield/binding/owner", owner.as_str().as_bytes()]))
    }

    /// Binding for ledger-wide aggregates
    pub fn ledger() -> Self {
        Self(keccak(&[b"stealth-yield/binding/ledger"]))
    }

    pub fn as_bytes(&self) -> &[u8; BINDING_LEN] {
        &self.0
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Binding({}…)", hex::encode(&self.0[..4]))
    }
}

/// Content-derived identifier of a sealed value.
///
/// Keccak256 over the whole blob. Because the nonce is fresh per seal, two
/// seals of the same plaintext never share an identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId([u8; 32]);

impl ContentId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentId({}…)", hex::encode(&self.0[..6]))
    }
}

impl fmt::Display for ContentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for ContentId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

pub(crate) fn keccak(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

// ============================================================================
// SealedBlob
// ============================================================================

/// Raw output of a [`SealingScheme`]
#[derive(Clone, PartialEq, Eq)]
pub struct SealedBlob {
    pub tag: TypeTag,
    pub binding: Binding,
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl SealedBlob {
    pub fn content_id(&self) -> ContentId {
        ContentId(keccak(&[
            b"stealth-yield/content",
            &[self.tag.to_u8()],
            self.binding.as_bytes(),
            &self.nonce,
            &self.ciphertext,
        ]))
    }

    /// Persisted encoding (see module docs)
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(1 + BINDING_LEN + NONCE_LEN + self.ciphertext.len());
        bytes.push(self.tag.to_u8());
        bytes.extend_from_slice(self.binding.as_bytes());
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, SealedError> {
        let header = 1 + BINDING_LEN + NONCE_LEN;
        if bytes.len() <= header {
            return Err(SealedError::Malformed(format!(
                "blob too short: {} bytes",
                bytes.len()
            )));
        }

        let tag = TypeTag::from_u8(bytes[0])
            .ok_or_else(|| SealedError::Malformed(format!("unknown type tag {}", bytes[0])))?;

        let mut binding = [0u8; BINDING_LEN];
        binding.copy_from_slice(&bytes[1..1 + BINDING_LEN]);

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[1 + BINDING_LEN..header]);

        Ok(Self {
            tag,
            binding: Binding(binding),
            nonce,
            ciphertext: bytes[header..].to_vec(),
        })
    }
}

impl fmt::Debug for SealedBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealedBlob")
            .field("tag", &self.tag)
            .field("content_id", &self.content_id())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// RevealGrant
// ============================================================================

/// Proof of ownership handed to `reveal`.
///
/// Only the ledger mints grants, after it has matched the caller against the
/// stored owner.
#[derive(Debug, Clone)]
pub struct RevealGrant {
    binding: Binding,
}

impl RevealGrant {
    pub(crate) fn for_owner(owner: &OwnerId) -> Self {
        Self {
            binding: Binding::owner(owner),
        }
    }

    pub(crate) fn for_binding(binding: Binding) -> Self {
        Self { binding }
    }

    pub fn binding(&self) -> Binding {
        self.binding
    }
}

// ============================================================================
// SealedValue
// ============================================================================

/// An encrypted scalar of plaintext type `T`
#[derive(Clone)]
pub struct SealedValue<T: Plaintext> {
    blob: SealedBlob,
    content_id: ContentId,
    /// reveal 이후에만 Some
    revealed: Option<T>,
    _marker: PhantomData<T>,
}

impl<T: Plaintext> SealedValue<T> {
    /// Seal `plaintext` for `binding`.
    ///
    /// Fails only if the scheme backend itself fails.
    pub fn seal(
        scheme: &dyn SealingScheme,
        plaintext: T,
        binding: Binding,
    ) -> Result<Self, SealedError> {
        let blob = scheme.seal(T::TAG, plaintext.to_raw(), binding)?;
        Self::from_blob(blob)
    }

    /// Wrap a blob read back from storage or produced by a homomorphic op
    pub fn from_blob(blob: SealedBlob) -> Result<Self, SealedError> {
        if blob.tag != T::TAG {
            return Err(SealedError::TagMismatch {
                expected: T::TAG,
                found: blob.tag,
            });
        }
        let content_id = blob.content_id();
        Ok(Self {
            blob,
            content_id,
            revealed: None,
            _marker: PhantomData,
        })
    }

    pub fn content_id(&self) -> ContentId {
        self.content_id
    }

    pub fn tag(&self) -> TypeTag {
        T::TAG
    }

    pub fn binding(&self) -> Binding {
        self.blob.binding
    }

    pub fn blob(&self) -> &SealedBlob {
        &self.blob
    }

    pub fn is_revealed(&self) -> bool {
        self.revealed.is_some()
    }

    /// Cached plaintext; `NotRevealed` until a successful `reveal`
    pub fn plaintext(&self) -> Result<T, SealedError> {
        self.revealed.ok_or(SealedError::NotRevealed)
    }

    /// Open the value for the holder of `grant` and cache the plaintext.
    ///
    /// Repeated calls are idempotent as long as the scheme keeps returning
    /// the cached result.
    pub fn reveal(
        &mut self,
        scheme: &dyn SealingScheme,
        grant: &RevealGrant,
    ) -> Result<T, SealedError> {
        if grant.binding() != self.blob.binding {
            return Err(SealedError::Unauthorized);
        }

        let value = T::from_raw(scheme.unseal(&self.blob)?)?;

        match self.revealed {
            Some(cached) if cached != value => Err(SealedError::AlreadyRevealed),
            Some(cached) => Ok(cached),
            None => {
                self.revealed = Some(value);
                Ok(value)
            }
        }
    }
}

impl<T: Plaintext> fmt::Debug for SealedValue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 평문은 로그에 남기지 않음
        f.debug_struct("SealedValue")
            .field("tag", &T::TAG)
            .field("content_id", &self.content_id)
            .field("revealed", &self.revealed.is_some())
            .finish()
    }
}
