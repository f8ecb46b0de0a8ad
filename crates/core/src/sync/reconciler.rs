//! Identifier reconciliation between local ids and remote-assigned ids.
//!
//! An identifier that fails format validation is treated identically to a
//! missing identifier. That bias is deliberate: a duplicate create is
//! recoverable, updating or deleting the wrong remote row is not.

use log::debug;
use serde_json::Value;

use crate::errors::{Error, Result};
use crate::model::{foreign_keys, EntityKind, EntityRecord, IdFormat, JsonMap, NewRecord, RemoteKind};
use crate::store::LocalStore;
use crate::sync::queue::SyncOperation;

/// Format-specific identifier validation.
///
/// `UuidV4` is the strict 8-4-4-4-12 form: version nibble `4`, variant
/// nibble in `{8, 9, a, b}`. Anything else counts as absent.
pub fn is_valid_id(candidate: &str, format: IdFormat) -> bool {
    match format {
        IdFormat::Opaque => !candidate.trim().is_empty(),
        IdFormat::UuidV4 => is_uuid_v4(candidate),
    }
}

fn is_uuid_v4(input: &str) -> bool {
    let bytes = input.as_bytes();
    if bytes.len() != 36 {
        return false;
    }

    let is_hex = |b: u8| b.is_ascii_hexdigit();
    let is_variant = |b: u8| matches!(b, b'8' | b'9' | b'a' | b'b' | b'A' | b'B');

    for (idx, byte) in bytes.iter().enumerate() {
        match idx {
            8 | 13 | 18 | 23 => {
                if *byte != b'-' {
                    return false;
                }
            }
            14 => {
                if *byte != b'4' {
                    return false;
                }
            }
            19 => {
                if !is_variant(*byte) {
                    return false;
                }
            }
            _ => {
                if !is_hex(*byte) {
                    return false;
                }
            }
        }
    }
    true
}

/// The stored remote id for `remote`, if present and validly formatted.
pub fn resolve_remote_id(record: &EntityRecord, remote: RemoteKind) -> Option<&str> {
    record
        .stored_remote_id(remote)
        .filter(|id| is_valid_id(id, remote.id_format()))
}

/// Persist a remote-assigned id onto a local record.
///
/// Idempotent: re-setting the same value is a no-op. A different value for
/// a record that already holds a valid id is rejected; a remote id, once
/// assigned by a given remote, is never reassigned.
pub fn record_remote_id(
    store: &dyn LocalStore,
    kind: EntityKind,
    local_id: i64,
    remote: RemoteKind,
    remote_id: &str,
) -> Result<()> {
    let record = store
        .get(kind, local_id)?
        .ok_or_else(|| Error::sync(format!("no local {:?} record {}", kind, local_id)))?;

    match resolve_remote_id(&record, remote) {
        Some(existing) if existing == remote_id => Ok(()),
        Some(existing) => Err(Error::sync(format!(
            "refusing to remap {:?} {} from {} to {}",
            kind, local_id, existing, remote_id
        ))),
        None => store.set_remote_id(kind, local_id, remote, remote_id),
    }
}

/// How a queued mutation must be dispatched against a given remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteOpPlan {
    /// No valid remote id: the mutation is a create, never an update.
    Create,
    /// Valid remote id known: update scoped to it. A replayed create whose
    /// record has since gained an id degrades here (at-most-once delivery).
    Update(String),
    Delete(String),
    /// Deleting something never synced is vacuously successful.
    SkipDelete,
}

pub fn plan_remote_op(
    record: &EntityRecord,
    op: SyncOperation,
    remote: RemoteKind,
) -> RemoteOpPlan {
    match (resolve_remote_id(record, remote), op) {
        (None, SyncOperation::Create | SyncOperation::Update) => RemoteOpPlan::Create,
        (Some(id), SyncOperation::Create | SyncOperation::Update) => {
            RemoteOpPlan::Update(id.to_string())
        }
        (Some(id), SyncOperation::Delete) => RemoteOpPlan::Delete(id.to_string()),
        (None, SyncOperation::Delete) => RemoteOpPlan::SkipDelete,
    }
}

/// Push-side foreign-key translation result.
#[derive(Debug, Clone, PartialEq)]
pub struct PushTranslation {
    /// Fields ready for the remote: foreign keys hold remote ids; fields
    /// whose reference could not be resolved are absent entirely.
    pub fields: JsonMap,
    /// Foreign-key fields omitted because the referenced record has no
    /// remote id yet. The caller schedules a repair pass for these.
    pub omitted: Vec<&'static str>,
}

/// Replace local-id foreign keys with the referenced records' remote ids.
///
/// An unresolvable reference never blocks the push of the current record:
/// the field is dropped (the remote treats a missing reference as unset,
/// never as zero) and reported in `omitted`.
pub fn translate_fks_for_push(
    store: &dyn LocalStore,
    kind: EntityKind,
    fields: &JsonMap,
    remote: RemoteKind,
) -> Result<PushTranslation> {
    let mut out = fields.clone();
    let mut omitted = Vec::new();

    for (field, target) in foreign_keys(kind) {
        let Some(value) = out.get(*field) else {
            continue;
        };
        let Some(local_ref) = value.as_i64() else {
            // Null or already-unset reference: send nothing.
            out.remove(*field);
            continue;
        };

        let resolved = store
            .get(*target, local_ref)?
            .as_ref()
            .and_then(|rec| resolve_remote_id(rec, remote).map(str::to_string));

        match resolved {
            Some(remote_ref) => {
                out.insert((*field).to_string(), Value::String(remote_ref));
            }
            None => {
                debug!(
                    "omitting {}.{} -> {:?} {}: referenced record has no remote id yet",
                    kind.table_name(),
                    field,
                    target,
                    local_ref
                );
                out.remove(*field);
                omitted.push(*field);
            }
        }
    }

    Ok(PushTranslation {
        fields: out,
        omitted,
    })
}

/// Replace remote-id foreign keys with local ids, creating a local shadow
/// record first when no local record carries that remote id yet.
pub fn translate_fks_for_pull(
    store: &dyn LocalStore,
    kind: EntityKind,
    mut fields: JsonMap,
    remote: RemoteKind,
) -> Result<JsonMap> {
    for (field, target) in foreign_keys(kind) {
        let Some(value) = fields.get(*field) else {
            continue;
        };
        let Some(remote_ref) = value.as_str().map(str::to_string) else {
            continue;
        };

        let local_id = match store.find_by_remote_id(*target, remote, &remote_ref)? {
            Some(existing) => existing.local_id,
            None => {
                debug!(
                    "creating shadow {:?} record for unknown remote id {}",
                    target, remote_ref
                );
                let mut shadow = NewRecord::default();
                match remote {
                    RemoteKind::Primary => shadow.remote_id = Some(remote_ref),
                    RemoteKind::Secondary => shadow.secondary_id = Some(remote_ref),
                }
                store.insert(*target, shadow)?
            }
        };

        fields.insert((*field).to_string(), Value::from(local_id));
    }

    Ok(fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(remote_id: Option<&str>, secondary_id: Option<&str>) -> EntityRecord {
        EntityRecord {
            local_id: 1,
            remote_id: remote_id.map(str::to_string),
            secondary_id: secondary_id.map(str::to_string),
            fields: JsonMap::new(),
        }
    }

    #[test]
    fn invalid_ids_resolve_to_none_for_secondary() {
        for candidate in [
            "12345",
            "",
            "not-a-uuid",
            // well-formed v1 UUID: wrong version nibble
            "550e8400-e29b-11d4-a716-446655440000",
        ] {
            let rec = record(None, Some(candidate));
            assert_eq!(
                resolve_remote_id(&rec, RemoteKind::Secondary),
                None,
                "{:?} must resolve to None",
                candidate
            );
        }
    }

    #[test]
    fn valid_v4_uuid_resolves_to_itself() {
        let rec = record(None, Some("550e8400-e29b-41d4-a716-446655440000"));
        assert_eq!(
            resolve_remote_id(&rec, RemoteKind::Secondary),
            Some("550e8400-e29b-41d4-a716-446655440000")
        );
    }

    #[test]
    fn generated_v4_uuids_always_validate() {
        for _ in 0..64 {
            let id = uuid::Uuid::new_v4().to_string();
            assert!(is_valid_id(&id, IdFormat::UuidV4), "{} must validate", id);
        }
    }

    #[test]
    fn primary_ids_only_need_to_be_non_empty() {
        assert!(is_valid_id("64f1c0ffee", IdFormat::Opaque));
        assert!(!is_valid_id("", IdFormat::Opaque));
        assert!(!is_valid_id("   ", IdFormat::Opaque));
    }

    #[test]
    fn update_without_remote_id_is_planned_as_create() {
        let rec = record(None, None);
        assert_eq!(
            plan_remote_op(&rec, SyncOperation::Update, RemoteKind::Primary),
            RemoteOpPlan::Create
        );
    }

    #[test]
    fn update_with_remote_id_is_scoped_to_it() {
        let rec = record(Some("abc123"), None);
        assert_eq!(
            plan_remote_op(&rec, SyncOperation::Update, RemoteKind::Primary),
            RemoteOpPlan::Update("abc123".to_string())
        );
    }

    #[test]
    fn delete_without_remote_id_is_skipped() {
        let rec = record(None, None);
        assert_eq!(
            plan_remote_op(&rec, SyncOperation::Delete, RemoteKind::Primary),
            RemoteOpPlan::SkipDelete
        );
    }

    #[test]
    fn replayed_create_with_known_id_degrades_to_update() {
        let rec = record(Some("abc123"), None);
        assert_eq!(
            plan_remote_op(&rec, SyncOperation::Create, RemoteKind::Primary),
            RemoteOpPlan::Update("abc123".to_string())
        );
    }
}
