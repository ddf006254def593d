//! Signed, append-only audit trail.
//!
//! Every mutation produces one [`AuditEntry`]. The entry's canonical form is
//! the JSON of every field except the seal (object keys sorted), and the seal
//! is an HMAC-SHA256 over those bytes. When signing fails the entry is still
//! stored, sealed with a plain SHA-256 content hash, and the failure is logged
//! as critical under the `audit` target. Operations never fail because of it.
//!
//! Entries are chained: each one carries the content hash of its predecessor,
//! so removing or rewriting an entry breaks the chain even when the signature
//! of every surviving entry still checks out.

use crate::types::{ActorContext, AuditEntryId};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use benefits_runtime::metrics::names;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Errors from the audit store and recorder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuditError {
    /// No entry with that id
    #[error("audit entry {0} not found")]
    EntryNotFound(AuditEntryId),

    /// An entry with that id already exists
    #[error("audit entry {0} already exists")]
    DuplicateEntry(AuditEntryId),

    /// The canonical form could not be produced
    #[error("audit serialization failed: {0}")]
    Serialization(String),

    /// The store rejected the write
    #[error("audit storage failed: {0}")]
    Storage(String),
}

/// Errors from signing; always recovered by the recorder.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SigningError {
    /// No signing key configured
    #[error("no signing key configured")]
    MissingKey,

    /// The key was rejected by the MAC
    #[error("invalid signing key: {0}")]
    InvalidKey(String),

    /// The signer is unavailable
    #[error("signer unavailable: {0}")]
    Unavailable(String),
}

/// Before/after value of one field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    /// Value before the mutation (`null` when absent)
    pub before: Value,
    /// Value after the mutation (`null` when removed)
    pub after: Value,
}

/// How an entry is sealed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditSeal {
    /// HMAC-SHA256 over the canonical form, base64
    Signed {
        /// Key the signature was made with
        key_id: String,
        /// Base64 signature
        signature: String,
    },
    /// Fallback SHA-256 content hash, base64
    Unsigned {
        /// Base64 content hash
        content_hash: String,
    },
}

impl AuditSeal {
    /// True for [`AuditSeal::Signed`].
    #[must_use]
    pub const fn is_signed(&self) -> bool {
        matches!(self, Self::Signed { .. })
    }
}

/// One immutable audit record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Identity
    pub id: AuditEntryId,
    /// Position in the global chain, starting at 1
    pub sequence: u64,
    /// Subject entity type, e.g. `"benefit_request"`
    pub subject_type: String,
    /// Subject entity id
    pub subject_id: String,
    /// Action name, e.g. `"submit"`
    pub action: String,
    /// Full actor context
    pub actor: ActorContext,
    /// Field-level diff
    pub changes: BTreeMap<String, FieldChange>,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
    /// Content hash of the previous entry; `None` for the first entry
    pub previous_hash: Option<String>,
    /// Signature or fallback hash
    pub seal: AuditSeal,
}

#[derive(Serialize)]
struct CanonicalEntry<'a> {
    id: &'a AuditEntryId,
    sequence: u64,
    subject_type: &'a str,
    subject_id: &'a str,
    action: &'a str,
    actor: &'a ActorContext,
    changes: &'a BTreeMap<String, FieldChange>,
    recorded_at: &'a DateTime<Utc>,
    previous_hash: &'a Option<String>,
}

impl AuditEntry {
    /// Canonical byte form: JSON with sorted keys, seal excluded.
    ///
    /// # Errors
    ///
    /// [`AuditError::Serialization`] if a field cannot be encoded.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, AuditError> {
        let canonical = CanonicalEntry {
            id: &self.id,
            sequence: self.sequence,
            subject_type: &self.subject_type,
            subject_id: &self.subject_id,
            action: &self.action,
            actor: &self.actor,
            changes: &self.changes,
            recorded_at: &self.recorded_at,
            previous_hash: &self.previous_hash,
        };
        // Round-trip through Value so nested maps come out key-sorted.
        let value = serde_json::to_value(canonical).map_err(|e| AuditError::Serialization(e.to_string()))?;
        serde_json::to_vec(&value).map_err(|e| AuditError::Serialization(e.to_string()))
    }

    /// Base64 SHA-256 of the canonical form.
    ///
    /// # Errors
    ///
    /// [`AuditError::Serialization`] if a field cannot be encoded.
    pub fn content_hash(&self) -> Result<String, AuditError> {
        Ok(content_hash(&self.canonical_bytes()?))
    }
}

fn content_hash(bytes: &[u8]) -> String {
    STANDARD.encode(Sha256::digest(bytes))
}

/// What a caller wants recorded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditDraft {
    /// Subject entity type
    pub subject_type: String,
    /// Subject entity id
    pub subject_id: String,
    /// Action name
    pub action: String,
    /// Actor context
    pub actor: ActorContext,
    /// Field-level diff
    pub changes: BTreeMap<String, FieldChange>,
    /// Time of the mutation
    pub recorded_at: DateTime<Utc>,
}

impl AuditDraft {
    /// Draft without changes.
    #[must_use]
    pub fn new(
        subject_type: impl Into<String>,
        subject_id: impl ToString,
        action: impl Into<String>,
        actor: ActorContext,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subject_type: subject_type.into(),
            subject_id: subject_id.to_string(),
            action: action.into(),
            actor,
            changes: BTreeMap::new(),
            recorded_at,
        }
    }

    /// Add one field change.
    #[must_use]
    pub fn with_change(mut self, field: impl Into<String>, before: Value, after: Value) -> Self {
        self.changes.insert(field.into(), FieldChange { before, after });
        self
    }

    /// Replace the whole diff.
    #[must_use]
    pub fn with_changes(mut self, changes: BTreeMap<String, FieldChange>) -> Self {
        self.changes = changes;
        self
    }
}

/// Produces and checks signatures over canonical bytes.
pub trait AuditSigner: Send + Sync {
    /// Identifier stored with each signature.
    fn key_id(&self) -> &str;

    /// Sign `bytes`, returning a base64 signature.
    ///
    /// # Errors
    ///
    /// Any [`SigningError`]; the recorder falls back to a content hash.
    fn sign(&self, bytes: &[u8]) -> Result<String, SigningError>;

    /// Check a base64 signature over `bytes`.
    ///
    /// # Errors
    ///
    /// Any [`SigningError`] that prevents the check from running.
    fn verify(&self, bytes: &[u8], signature: &str) -> Result<bool, SigningError>;
}

/// HMAC-SHA256 signer.
pub struct HmacAuditSigner {
    key_id: String,
    key: Vec<u8>,
}

impl HmacAuditSigner {
    /// Signer over a raw key. An empty key makes every signature fail.
    #[must_use]
    pub fn new(key_id: impl Into<String>, key: impl Into<Vec<u8>>) -> Self {
        Self {
            key_id: key_id.into(),
            key: key.into(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, SigningError> {
        if self.key.is_empty() {
            return Err(SigningError::MissingKey);
        }
        HmacSha256::new_from_slice(&self.key).map_err(|e| SigningError::InvalidKey(e.to_string()))
    }
}

impl std::fmt::Debug for HmacAuditSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacAuditSigner")
            .field("key_id", &self.key_id)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl AuditSigner for HmacAuditSigner {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn sign(&self, bytes: &[u8]) -> Result<String, SigningError> {
        let mut mac = self.mac()?;
        mac.update(bytes);
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn verify(&self, bytes: &[u8], signature: &str) -> Result<bool, SigningError> {
        let Ok(raw) = STANDARD.decode(signature) else {
            return Ok(false);
        };
        let mut mac = self.mac()?;
        mac.update(bytes);
        Ok(mac.verify_slice(&raw).is_ok())
    }
}

/// Append-only audit storage. There is no update or delete.
pub trait AuditStore: Send + Sync {
    /// Persist a new entry.
    ///
    /// # Errors
    ///
    /// [`AuditError::DuplicateEntry`] or [`AuditError::Storage`].
    fn append(&self, entry: AuditEntry) -> Result<(), AuditError>;

    /// Look up one entry.
    fn get(&self, id: AuditEntryId) -> Option<AuditEntry>;

    /// Entries of one subject, oldest first.
    fn for_subject(&self, subject_type: &str, subject_id: &str) -> Vec<AuditEntry>;

    /// Every entry in chain order.
    fn all(&self) -> Vec<AuditEntry>;
}

/// Audit store kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryAuditLog {
    entries: RwLock<Vec<AuditEntry>>,
}

impl InMemoryAuditLog {
    /// Empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// True when nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditStore for InMemoryAuditLog {
    fn append(&self, entry: AuditEntry) -> Result<(), AuditError> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if entries.iter().any(|existing| existing.id == entry.id) {
            return Err(AuditError::DuplicateEntry(entry.id));
        }
        entries.push(entry);
        Ok(())
    }

    fn get(&self, id: AuditEntryId) -> Option<AuditEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    fn for_subject(&self, subject_type: &str, subject_id: &str) -> Vec<AuditEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.subject_type == subject_type && entry.subject_id == subject_id)
            .cloned()
            .collect()
    }

    fn all(&self) -> Vec<AuditEntry> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Result of [`AuditRecorder::verify`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VerificationOutcome {
    /// Signature matches the stored bytes
    Valid,
    /// Signature or content hash does not match
    Invalid,
    /// Recorded in degraded mode; the fallback hash matches
    Unsigned,
}

/// Result of [`AuditRecorder::verify_chain`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChainVerification {
    /// Every link checks out
    Intact {
        /// Entries checked
        entries: usize,
    },
    /// First entry whose link does not match its predecessor
    Broken {
        /// Offending entry
        entry_id: AuditEntryId,
        /// Its sequence number
        sequence: u64,
    },
}

#[derive(Debug, Default)]
struct ChainHead {
    sequence: u64,
    last_hash: Option<String>,
}

/// Builds, seals and stores audit entries.
///
/// Appends are serialized through a short critical section that hands out
/// chain positions; nothing else is held while it is locked.
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    signer: Arc<dyn AuditSigner>,
    head: Mutex<ChainHead>,
}

impl AuditRecorder {
    /// Recorder continuing the chain already present in `store`.
    ///
    /// # Errors
    ///
    /// [`AuditError::Serialization`] if the last stored entry cannot be hashed.
    pub fn new(store: Arc<dyn AuditStore>, signer: Arc<dyn AuditSigner>) -> Result<Self, AuditError> {
        let head = match store.all().last() {
            Some(last) => ChainHead {
                sequence: last.sequence,
                last_hash: Some(last.content_hash()?),
            },
            None => ChainHead::default(),
        };
        Ok(Self {
            store,
            signer,
            head: Mutex::new(head),
        })
    }

    /// Seal and persist a draft.
    ///
    /// Signing failures are recovered with the fallback hash; only storage
    /// and serialization failures are returned.
    ///
    /// # Errors
    ///
    /// [`AuditError::Serialization`] or whatever the store returns.
    pub fn record(&self, draft: AuditDraft) -> Result<AuditEntry, AuditError> {
        let mut head = self.head.lock().unwrap_or_else(PoisonError::into_inner);

        let mut entry = AuditEntry {
            id: AuditEntryId::new(),
            sequence: head.sequence + 1,
            subject_type: draft.subject_type,
            subject_id: draft.subject_id,
            action: draft.action,
            actor: draft.actor,
            changes: draft.changes,
            recorded_at: draft.recorded_at,
            previous_hash: head.last_hash.clone(),
            seal: AuditSeal::Unsigned {
                content_hash: String::new(),
            },
        };
        let bytes = entry.canonical_bytes()?;
        let hash = content_hash(&bytes);

        entry.seal = match self.signer.sign(&bytes) {
            Ok(signature) => AuditSeal::Signed {
                key_id: self.signer.key_id().to_string(),
                signature,
            },
            Err(error) => {
                tracing::error!(
                    target: "audit",
                    severity = "critical",
                    entry_id = %entry.id,
                    subject_id = %entry.subject_id,
                    action = %entry.action,
                    %error,
                    "SignatureFailure: audit entry stored with fallback content hash"
                );
                metrics::counter!(names::AUDIT_SIGNATURE_FAILURES).increment(1);
                AuditSeal::Unsigned {
                    content_hash: hash.clone(),
                }
            },
        };

        self.store.append(entry.clone())?;
        head.sequence = entry.sequence;
        head.last_hash = Some(hash);

        let seal = if entry.seal.is_signed() { "signed" } else { "unsigned" };
        metrics::counter!(names::AUDIT_ENTRIES_RECORDED, "seal" => seal).increment(1);
        tracing::debug!(
            target: "audit",
            entry_id = %entry.id,
            sequence = entry.sequence,
            action = %entry.action,
            seal,
            "Audit entry recorded"
        );
        Ok(entry)
    }

    /// Check one entry against its seal.
    ///
    /// # Errors
    ///
    /// [`AuditError::EntryNotFound`] for unknown ids.
    pub fn verify(&self, id: AuditEntryId) -> Result<VerificationOutcome, AuditError> {
        let entry = self.store.get(id).ok_or(AuditError::EntryNotFound(id))?;
        let bytes = entry.canonical_bytes()?;

        let outcome = match &entry.seal {
            AuditSeal::Signed { key_id, signature } => {
                if key_id != self.signer.key_id() {
                    tracing::warn!(target: "audit", entry_id = %id, %key_id, "Entry signed with an unknown key");
                    VerificationOutcome::Invalid
                } else {
                    match self.signer.verify(&bytes, signature) {
                        Ok(true) => VerificationOutcome::Valid,
                        Ok(false) => VerificationOutcome::Invalid,
                        Err(error) => {
                            tracing::warn!(target: "audit", entry_id = %id, %error, "Signature check could not run");
                            VerificationOutcome::Invalid
                        },
                    }
                }
            },
            AuditSeal::Unsigned { content_hash: stored } => {
                if *stored == content_hash(&bytes) {
                    VerificationOutcome::Unsigned
                } else {
                    VerificationOutcome::Invalid
                }
            },
        };

        if outcome == VerificationOutcome::Invalid {
            tracing::warn!(target: "audit", entry_id = %id, "Audit entry failed verification");
        }
        Ok(outcome)
    }

    /// Walk the whole chain and report the first broken link.
    ///
    /// # Errors
    ///
    /// [`AuditError::Serialization`] if an entry cannot be hashed.
    pub fn verify_chain(&self) -> Result<ChainVerification, AuditError> {
        let entries = self.store.all();
        let mut previous: Option<String> = None;
        for (index, entry) in entries.iter().enumerate() {
            let expected_sequence = index as u64 + 1;
            if entry.sequence != expected_sequence || entry.previous_hash != previous {
                return Ok(ChainVerification::Broken {
                    entry_id: entry.id,
                    sequence: entry.sequence,
                });
            }
            previous = Some(entry.content_hash()?);
        }
        Ok(ChainVerification::Intact {
            entries: entries.len(),
        })
    }

    /// Entries of one subject, oldest first.
    #[must_use]
    pub fn trail(&self, subject_type: &str, subject_id: &str) -> Vec<AuditEntry> {
        self.store.for_subject(subject_type, subject_id)
    }
}

impl std::fmt::Debug for AuditRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditRecorder")
            .field("key_id", &self.signer.key_id())
            .finish_non_exhaustive()
    }
}
