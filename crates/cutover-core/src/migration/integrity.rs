//! Integrity checks between loaded definitions and the ledger.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use super::ledger::LedgerEntry;
use super::store::MigrationStore;

/// One integrity problem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntegrityIssue {
    /// Two loaded migrations share a version.
    DuplicateVersion {
        /// The shared version.
        version: i64,
        /// Ids of every migration using it.
        ids: Vec<String>,
    },
    /// A migration depends on a version that is not loaded.
    MissingDependency {
        /// The dependent migration.
        id: String,
        /// The missing version.
        dependency: i64,
    },
    /// A migration was edited after it was applied.
    ChecksumMismatch {
        /// Migration id.
        id: String,
        /// Checksum in the ledger.
        recorded: String,
        /// Checksum of the loaded definition.
        current: String,
    },
    /// The ledger records a migration that is no longer defined.
    UnknownAppliedMigration {
        /// Migration id from the ledger.
        id: String,
        /// Its version.
        version: i64,
    },
    /// A definition failed to load.
    LoadFailure {
        /// File or id that failed.
        source: String,
        /// Why.
        reason: String,
    },
}

impl IntegrityIssue {
    /// Short machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            IntegrityIssue::DuplicateVersion { .. } => "duplicate_version",
            IntegrityIssue::MissingDependency { .. } => "missing_dependency",
            IntegrityIssue::ChecksumMismatch { .. } => "checksum_mismatch",
            IntegrityIssue::UnknownAppliedMigration { .. } => "unknown_applied_migration",
            IntegrityIssue::LoadFailure { .. } => "load_failure",
        }
    }
}

impl std::fmt::Display for IntegrityIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IntegrityIssue::DuplicateVersion { version, ids } => {
                write!(f, "version {} is defined by {}", version, ids.join(", "))
            }
            IntegrityIssue::MissingDependency { id, dependency } => {
                write!(f, "migration {} depends on v{}, which is not defined", id, dependency)
            }
            IntegrityIssue::ChecksumMismatch { id, recorded, current } => write!(
                f,
                "migration {} changed after it was applied (recorded {}, now {})",
                id,
                short(recorded),
                short(current)
            ),
            IntegrityIssue::UnknownAppliedMigration { id, version } => {
                write!(f, "applied migration {} (v{}) is no longer defined", id, version)
            }
            IntegrityIssue::LoadFailure { source, reason } => {
                write!(f, "failed to load {}: {}", source, reason)
            }
        }
    }
}

fn short(checksum: &str) -> &str {
    checksum.get(..12).unwrap_or(checksum)
}

/// Compare the loaded definitions with an environment's ledger.
///
/// Returns every issue found, in a stable order: load failures, duplicate
/// versions, missing dependencies, then ledger problems by version.
pub fn check(store: &MigrationStore, ledger: &[LedgerEntry]) -> Vec<IntegrityIssue> {
    let mut issues: Vec<IntegrityIssue> = store
        .load_failures()
        .iter()
        .map(|f| IntegrityIssue::LoadFailure {
            source: f.source.clone(),
            reason: f.reason.clone(),
        })
        .collect();

    let mut by_version: BTreeMap<i64, Vec<String>> = BTreeMap::new();
    for m in store.all_migrations() {
        by_version.entry(m.version).or_default().push(m.id.clone());
    }
    for (version, ids) in by_version {
        if ids.len() > 1 {
            issues.push(IntegrityIssue::DuplicateVersion { version, ids });
        }
    }

    let defined: BTreeSet<i64> = store.versions();
    for m in store.all_migrations() {
        for dep in &m.dependencies {
            if !defined.contains(dep) {
                issues.push(IntegrityIssue::MissingDependency {
                    id: m.id.clone(),
                    dependency: *dep,
                });
            }
        }
    }

    for entry in ledger {
        match store.by_id(&entry.migration_id) {
            Some(migration) => {
                let current = migration.checksum();
                if current != entry.checksum {
                    issues.push(IntegrityIssue::ChecksumMismatch {
                        id: entry.migration_id.clone(),
                        recorded: entry.checksum.clone(),
                        current,
                    });
                }
            }
            None => issues.push(IntegrityIssue::UnknownAppliedMigration {
                id: entry.migration_id.clone(),
                version: entry.version,
            }),
        }
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::definition::Migration;

    fn migration(version: i64) -> Migration {
        Migration::new(
            format!("{:04}_m", version),
            version,
            "m",
            format!("CREATE TABLE t{} (id INTEGER);", version),
        )
    }

    #[test]
    fn test_clean_store_has_no_issues() {
        let store = MigrationStore::from_definitions(vec![migration(1), migration(2).depends_on(1)]);
        let ledger = vec![LedgerEntry::for_migration(&migration(1), 3, "t")];
        assert!(check(&store, &ledger).is_empty());
    }

    #[test]
    fn test_checksum_drift() {
        let applied = migration(1);
        let ledger = vec![LedgerEntry::for_migration(&applied, 3, "t")];

        let edited = migration(1).with_description("now with more words");
        let store = MigrationStore::from_definitions(vec![edited]);

        let issues = check(&store, &ledger);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind(), "checksum_mismatch");
        assert!(matches!(&issues[0], IntegrityIssue::ChecksumMismatch { id, .. } if id == "0001_m"));
    }

    #[test]
    fn test_structural_issues() {
        let mut twin = migration(2);
        twin.id = "0002_twin".to_string();
        let store = MigrationStore::from_definitions(vec![
            migration(2),
            twin,
            migration(4).depends_on(3),
        ]);
        let ledger = vec![LedgerEntry::for_migration(&migration(9), 0, "t")];

        let kinds: Vec<&str> = check(&store, &ledger).iter().map(|i| i.kind()).collect();
        assert_eq!(
            kinds,
            vec!["duplicate_version", "missing_dependency", "unknown_applied_migration"]
        );
    }

    #[test]
    fn test_load_failures_are_reported() {
        let store = MigrationStore::from_definitions(vec![Migration::new("", 1, "x", "SELECT 1")]);
        let issues = check(&store, &[]);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].kind(), "load_failure");
        assert!(issues[0].to_string().starts_with("failed to load"));
    }
}
