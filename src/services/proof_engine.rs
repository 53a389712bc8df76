//! Proof Engine
//!
//! Seals plaintext inputs and produces constraint proofs over sealed values.
//!
//! # Proof Statement
//!
//! ```text
//! statement = Keccak256(
//!     "stealth-yield/proof" ‖ constraint ‖ bound_to ‖ counterpart ‖ status
//! )
//! payload   = attest(statement)
//! ```
//!
//! `bound_to` is the content id of the sealed value the proof speaks about.
//! Since every seal gets a fresh nonce, a proof for value X can never verify
//! against value Y, even when both hold the same plaintext.
//!
//! # Constraints
//!
//! | Constraint         | Type     | Predicate                        |
//! |--------------------|----------|----------------------------------|
//! | `PositiveAmount`   | Amount   | `x > 0`                          |
//! | `RateInRange`      | Rate     | `1 <= x <= 10000`                |
//! | `DurationInRange`  | Duration | `1 <= x <= max_duration_secs`    |
//! | `PositiveCapacity` | Amount   | `x > 0`                          |
//! | `WithinCapacity`   | Amount   | `utilization <= capacity`        |

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::sealed::{
    keccak, Amount, Binding, ContentId, Plaintext, RevealGrant, SealedError, SealedValue,
    SealingScheme, TypeTag,
};
use crate::types::MAX_RATE_BPS;

/// Proof engine errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProofError {
    #[error("unsupported constraint: {0}")]
    UnsupportedConstraint(String),

    #[error(transparent)]
    Sealed(#[from] SealedError),
}

/// Business constraint a sealed value can be proven against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constraint {
    PositiveAmount,
    RateInRange,
    DurationInRange,
    PositiveCapacity,
    WithinCapacity,
}

impl Constraint {
    pub fn id(&self) -> &'static str {
        match self {
            Constraint::PositiveAmount => "PositiveAmount",
            Constraint::RateInRange => "RateInRange",
            Constraint::DurationInRange => "DurationInRange",
            Constraint::PositiveCapacity => "PositiveCapacity",
            Constraint::WithinCapacity => "WithinCapacity",
        }
    }

    fn code(&self) -> u8 {
        match self {
            Constraint::PositiveAmount => 1,
            Constraint::RateInRange => 2,
            Constraint::DurationInRange => 3,
            Constraint::PositiveCapacity => 4,
            Constraint::WithinCapacity => 5,
        }
    }

    /// Plaintext type the constraint is defined on
    pub fn applies_to(&self) -> TypeTag {
        match self {
            Constraint::PositiveAmount | Constraint::PositiveCapacity | Constraint::WithinCapacity => {
                TypeTag::Amount
            }
            Constraint::RateInRange => TypeTag::Rate,
            Constraint::DurationInRange => TypeTag::Duration,
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Constraint {
    type Err = ProofError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PositiveAmount" => Ok(Constraint::PositiveAmount),
            "RateInRange" => Ok(Constraint::RateInRange),
            "DurationInRange" => Ok(Constraint::DurationInRange),
            "PositiveCapacity" => Ok(Constraint::PositiveCapacity),
            "WithinCapacity" => Ok(Constraint::WithinCapacity),
            other => Err(ProofError::UnsupportedConstraint(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProofStatus {
    Pending,
    Valid,
    Invalid,
}

impl ProofStatus {
    fn to_u8(self) -> u8 {
        match self {
            ProofStatus::Pending => 0,
            ProofStatus::Valid => 1,
            ProofStatus::Invalid => 2,
        }
    }
}

fn serialize_hex<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
}

/// Attested statement that a sealed value satisfies (or fails) a constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConstraintProof {
    pub constraint: Constraint,
    /// 증명이 묶인 sealed value의 content id
    pub bound_to: ContentId,
    /// 두 피연산자 제약(WithinCapacity)의 상대 값
    pub counterpart: Option<ContentId>,
    pub status: ProofStatus,
    #[serde(serialize_with = "serialize_hex")]
    pub payload: Vec<u8>,
}

impl ConstraintProof {
    /// Proof that has not been evaluated yet. Never verifies.
    pub fn pending(constraint: Constraint, bound_to: ContentId) -> Self {
        Self {
            constraint,
            bound_to,
            counterpart: None,
            status: ProofStatus::Pending,
            payload: Vec::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.status == ProofStatus::Valid
    }

    fn statement(
        constraint: Constraint,
        bound_to: &ContentId,
        counterpart: Option<&ContentId>,
        status: ProofStatus,
    ) -> [u8; 32] {
        let zero = [0u8; 32];
        keccak(&[
            b"stealth-yield/proof",
            &[constraint.code()],
            bound_to.as_bytes(),
            counterpart.map(|c| c.as_bytes()).unwrap_or(&zero),
            &[status.to_u8()],
        ])
    }
}

/// Seals inputs, proves constraints, runs sealed arithmetic
pub struct ProofEngine {
    scheme: Arc<dyn SealingScheme>,
    max_duration_secs: u64,
}

impl ProofEngine {
    pub fn new(scheme: Arc<dyn SealingScheme>, max_duration_secs: u64) -> Self {
        Self {
            scheme,
            max_duration_secs,
        }
    }

    pub fn scheme(&self) -> &dyn SealingScheme {
        self.scheme.as_ref()
    }

    pub fn max_duration_secs(&self) -> u64 {
        self.max_duration_secs
    }

    pub fn seal<T: Plaintext>(&self, plaintext: T, binding: Binding) -> Result<SealedValue<T>, ProofError> {
        Ok(SealedValue::seal(self.scheme(), plaintext, binding)?)
    }

    /// Seal `plaintext` and prove `constraint` while the plaintext is still in hand
    pub fn seal_and_prove<T: Plaintext>(
        &self,
        plaintext: T,
        binding: Binding,
        constraint: Constraint,
    ) -> Result<(SealedValue<T>, ConstraintProof), ProofError> {
        let holds = self.evaluate(constraint, T::TAG, plaintext.to_raw())?;
        let value = self.seal(plaintext, binding)?;
        let proof = self.attest(constraint, value.content_id(), None, holds);
        Ok((value, proof))
    }

    /// Prove `constraint` for an already sealed value.
    ///
    /// Evaluation happens inside the scheme boundary; the caller never sees
    /// the plaintext.
    pub fn prove<T: Plaintext>(
        &self,
        value: &SealedValue<T>,
        constraint: Constraint,
    ) -> Result<ConstraintProof, ProofError> {
        if constraint == Constraint::WithinCapacity {
            return Err(ProofError::UnsupportedConstraint(
                "WithinCapacity needs two operands, use prove_within_capacity".to_string(),
            ));
        }
        let raw = self.scheme.unseal(value.blob())?;
        let holds = self.evaluate(constraint, T::TAG, raw)?;
        Ok(self.attest(constraint, value.content_id(), None, holds))
    }

    /// `true` iff `proof` is a valid attestation bound to exactly `value`.
    ///
    /// Binding mismatches (replays) are an ordinary `false`.
    pub fn verify<T: Plaintext>(&self, proof: &ConstraintProof, value: &SealedValue<T>) -> bool {
        if proof.bound_to != value.content_id() || !proof.is_valid() {
            return false;
        }
        if proof.constraint.applies_to() != T::TAG {
            return false;
        }
        let statement = ConstraintProof::statement(
            proof.constraint,
            &proof.bound_to,
            proof.counterpart.as_ref(),
            proof.status,
        );
        self.scheme.verify_attestation(&statement, &proof.payload)
    }

    /// Prove `utilization <= capacity` without revealing either operand
    pub fn prove_within_capacity(
        &self,
        utilization: &SealedValue<Amount>,
        capacity: &SealedValue<Amount>,
    ) -> Result<ConstraintProof, ProofError> {
        let holds = self.scheme.le(utilization.blob(), capacity.blob())?;
        Ok(self.attest(
            Constraint::WithinCapacity,
            utilization.content_id(),
            Some(capacity.content_id()),
            holds,
        ))
    }

    pub fn verify_within_capacity(
        &self,
        proof: &ConstraintProof,
        utilization: &SealedValue<Amount>,
        capacity: &SealedValue<Amount>,
    ) -> bool {
        proof.constraint == Constraint::WithinCapacity
            && proof.counterpart == Some(capacity.content_id())
            && self.verify(proof, utilization)
    }

    pub fn add(
        &self,
        a: &SealedValue<Amount>,
        b: &SealedValue<Amount>,
        binding: Binding,
    ) -> Result<SealedValue<Amount>, ProofError> {
        let blob = self.scheme.add(a.blob(), b.blob(), binding)?;
        Ok(SealedValue::from_blob(blob)?)
    }

    pub fn sub(
        &self,
        a: &SealedValue<Amount>,
        b: &SealedValue<Amount>,
        binding: Binding,
    ) -> Result<SealedValue<Amount>, ProofError> {
        let blob = self.scheme.sub(a.blob(), b.blob(), binding)?;
        Ok(SealedValue::from_blob(blob)?)
    }

    /// Homomorphic sum; the result is sealed for `binding`
    pub fn sum<'a, I>(&self, values: I, binding: Binding) -> Result<SealedValue<Amount>, ProofError>
    where
        I: IntoIterator<Item = &'a SealedValue<Amount>>,
    {
        let mut total = self.seal(Amount(0), binding)?;
        for value in values {
            total = self.add(&total, value, binding)?;
        }
        Ok(total)
    }

    /// Open `value` for the grant holder
    pub fn reveal<T: Plaintext>(
        &self,
        value: &mut SealedValue<T>,
        grant: &RevealGrant,
    ) -> Result<T, SealedError> {
        value.reveal(self.scheme(), grant)
    }

    fn evaluate(&self, constraint: Constraint, tag: TypeTag, raw: u64) -> Result<bool, ProofError> {
        if constraint.applies_to() != tag {
            return Err(ProofError::UnsupportedConstraint(format!(
                "{} is not defined on {:?}",
                constraint, tag
            )));
        }
        Ok(match constraint {
            Constraint::PositiveAmount | Constraint::PositiveCapacity => raw > 0,
            Constraint::RateInRange => (1..=u64::from(MAX_RATE_BPS)).contains(&raw),
            Constraint::DurationInRange => (1..=self.max_duration_secs).contains(&raw),
            Constraint::WithinCapacity => {
                return Err(ProofError::UnsupportedConstraint(
                    "WithinCapacity needs two operands".to_string(),
                ))
            }
        })
    }

    fn attest(
        &self,
        constraint: Constraint,
        bound_to: ContentId,
        counterpart: Option<ContentId>,
        holds: bool,
    ) -> ConstraintProof {
        let status = if holds {
            ProofStatus::Valid
        } else {
            ProofStatus::Invalid
        };
        let statement = ConstraintProof::statement(constraint, &bound_to, counterpart.as_ref(), status);
        ConstraintProof {
            constraint,
            bound_to,
            counterpart,
            status,
            payload: self.scheme.attest(&statement),
        }
    }
}

impl fmt::Debug for ProofEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProofEngine")
            .field("max_duration_secs", &self.max_duration_secs)
            .finish_non_exhaustive()
    }
}
