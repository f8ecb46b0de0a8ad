//! Entity model and per-kind schema tables.
//!
//! Every entity kind shares the same record shape: an integer local id
//! assigned by the local store, optional remote identifiers (one per
//! backend), and a JSON object of camelCase business fields. Foreign keys
//! are stored locally as local ids and translated at the sync boundary.

use serde::{Deserialize, Serialize};

/// JSON object type used for entity business fields and remote payloads.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// The remote backends a record can be mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteKind {
    /// REST API backend; ids are opaque non-empty strings.
    Primary,
    /// Row-based backup store; ids must be UUID v4.
    Secondary,
}

/// Identifier format accepted by a remote backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdFormat {
    Opaque,
    UuidV4,
}

impl RemoteKind {
    pub fn id_format(&self) -> IdFormat {
        match self {
            RemoteKind::Primary => IdFormat::Opaque,
            RemoteKind::Secondary => IdFormat::UuidV4,
        }
    }
}

/// Entity kinds that participate in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Client,
    List,
    Saving,
    Goal,
    Debt,
    Expense,
    Income,
    Invoice,
    Todo,
    SavingsTransaction,
}

impl EntityKind {
    /// All kinds in pull dependency order: kinds referenced by foreign keys
    /// come before the kinds that reference them.
    pub const ALL: [EntityKind; 10] = [
        EntityKind::Client,
        EntityKind::List,
        EntityKind::Saving,
        EntityKind::Goal,
        EntityKind::Debt,
        EntityKind::Expense,
        EntityKind::Income,
        EntityKind::Invoice,
        EntityKind::Todo,
        EntityKind::SavingsTransaction,
    ];

    /// Resource path segment on the primary REST API (`/api/<path>`).
    pub fn api_path(&self) -> &'static str {
        match self {
            EntityKind::Client => "clients",
            EntityKind::List => "lists",
            EntityKind::Saving => "savings",
            EntityKind::Goal => "goals",
            EntityKind::Debt => "debts",
            EntityKind::Expense => "expenses",
            EntityKind::Income => "income",
            EntityKind::Invoice => "invoices",
            EntityKind::Todo => "todos",
            EntityKind::SavingsTransaction => "savings-transactions",
        }
    }

    /// Local table name and secondary-store row table name.
    pub fn table_name(&self) -> &'static str {
        match self {
            EntityKind::Client => "clients",
            EntityKind::List => "lists",
            EntityKind::Saving => "savings",
            EntityKind::Goal => "goals",
            EntityKind::Debt => "debts",
            EntityKind::Expense => "expenses",
            EntityKind::Income => "income",
            EntityKind::Invoice => "invoices",
            EntityKind::Todo => "todos",
            EntityKind::SavingsTransaction => "savings_transactions",
        }
    }

    /// Key used for this kind in dataset exports and migration counts.
    pub fn export_key(&self) -> &'static str {
        self.table_name()
    }
}

/// Foreign-key fields of a kind: `(local field name, referenced kind)`.
///
/// Values under these fields are local ids in the local store; the
/// reconciler swaps them for remote ids on push and back on pull.
pub fn foreign_keys(kind: EntityKind) -> &'static [(&'static str, EntityKind)] {
    match kind {
        EntityKind::Income => &[("clientId", EntityKind::Client)],
        EntityKind::Invoice => &[("clientId", EntityKind::Client)],
        EntityKind::Todo => &[("listId", EntityKind::List)],
        EntityKind::SavingsTransaction => &[("savingsId", EntityKind::Saving)],
        _ => &[],
    }
}

/// Columns the secondary store accepts per kind, in its snake_case naming.
///
/// Local fields without a column here are dropped before the write; local
/// records routinely carry bookkeeping fields with no remote equivalent.
pub fn secondary_allow_list(kind: EntityKind) -> &'static [&'static str] {
    match kind {
        EntityKind::Client => &["name", "email", "phone", "company", "notes"],
        EntityKind::List => &["name"],
        EntityKind::Saving => &["name", "balance", "currency"],
        EntityKind::Goal => &[
            "title",
            "target_amount",
            "current_amount",
            "currency",
            "deadline",
        ],
        EntityKind::Debt => &[
            "creditor",
            "amount",
            "currency",
            "due_date",
            "interest_rate",
            "notes",
        ],
        EntityKind::Expense => &[
            "amount",
            "currency",
            "date",
            "category",
            "vendor",
            "description",
        ],
        EntityKind::Income => &[
            "client_id",
            "amount",
            "currency",
            "date",
            "category",
            "description",
        ],
        EntityKind::Invoice => &[
            "client_id",
            "number",
            "amount",
            "currency",
            "issue_date",
            "due_date",
            "status",
        ],
        EntityKind::Todo => &["list_id", "title", "done", "due_date"],
        EntityKind::SavingsTransaction => &["savings_id", "amount", "date", "note"],
    }
}

/// Convert a camelCase local field name to the secondary store's snake_case.
pub fn camel_to_snake(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for ch in name.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// A stored entity record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    /// Local identifier, unique within the kind, never reused.
    pub local_id: i64,
    /// Id assigned by the primary REST API, absent until first synced there.
    pub remote_id: Option<String>,
    /// Id assigned by the secondary row store, absent until first synced there.
    pub secondary_id: Option<String>,
    /// Business fields, camelCase; foreign keys hold local ids.
    pub fields: JsonMap,
}

impl EntityRecord {
    pub fn stored_remote_id(&self, remote: RemoteKind) -> Option<&str> {
        match remote {
            RemoteKind::Primary => self.remote_id.as_deref(),
            RemoteKind::Secondary => self.secondary_id.as_deref(),
        }
    }
}

/// A record to insert into the local store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRecord {
    /// Explicit local id to insert under; `None` means autoassign. Used by
    /// pull replacement to keep ids stable for records matched by remote id.
    pub local_id: Option<i64>,
    pub remote_id: Option<String>,
    pub secondary_id: Option<String>,
    pub fields: JsonMap,
}

impl NewRecord {
    pub fn with_fields(fields: JsonMap) -> Self {
        Self {
            fields,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_kind_serialization_matches_backend_contract() {
        let actual = EntityKind::ALL
            .iter()
            .map(|kind| serde_json::to_string(kind).expect("serialize entity kind"))
            .collect::<Vec<_>>();

        let expected = vec![
            "\"client\"",
            "\"list\"",
            "\"saving\"",
            "\"goal\"",
            "\"debt\"",
            "\"expense\"",
            "\"income\"",
            "\"invoice\"",
            "\"todo\"",
            "\"savings_transaction\"",
        ];

        assert_eq!(actual, expected);
    }

    #[test]
    fn pull_order_puts_referenced_kinds_first() {
        let position = |kind: EntityKind| {
            EntityKind::ALL
                .iter()
                .position(|k| *k == kind)
                .expect("kind in ALL")
        };

        for kind in EntityKind::ALL {
            for (_, target) in foreign_keys(kind) {
                assert!(
                    position(*target) < position(kind),
                    "{:?} must be pulled before {:?}",
                    target,
                    kind
                );
            }
        }
    }

    #[test]
    fn allow_lists_cover_foreign_keys_in_snake_case() {
        for kind in EntityKind::ALL {
            let allowed = secondary_allow_list(kind);
            for (field, _) in foreign_keys(kind) {
                let snake = camel_to_snake(field);
                assert!(
                    allowed.contains(&snake.as_str()),
                    "allow-list for {:?} is missing {}",
                    kind,
                    snake
                );
            }
        }
    }

    #[test]
    fn camel_to_snake_handles_plain_and_mixed_names() {
        assert_eq!(camel_to_snake("amount"), "amount");
        assert_eq!(camel_to_snake("clientId"), "client_id");
        assert_eq!(camel_to_snake("issueDate"), "issue_date");
    }
}
