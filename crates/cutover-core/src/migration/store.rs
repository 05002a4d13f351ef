//! Migration definition store.
//!
//! Definitions come from an explicit list registered in code or from a
//! directory of JSON files, one migration per file. A definition that fails
//! to parse or validate is skipped and recorded as a [`LoadFailure`]; the
//! rest of the load carries on.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::definition::Migration;
use super::error::MigrationError;

/// File extension for migration files.
pub const MIGRATION_FILE_EXTENSION: &str = "json";

/// A definition that could not be loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadFailure {
    /// File path, or the migration id for code-registered definitions.
    pub source: String,
    /// Why it was skipped.
    pub reason: String,
}

/// Loaded migration definitions, indexed by id.
#[derive(Debug, Default)]
pub struct MigrationStore {
    /// Definitions sorted by version (stable for equal versions).
    migrations: Vec<Migration>,
    by_id: HashMap<String, usize>,
    failures: Vec<LoadFailure>,
}

impl MigrationStore {
    /// Build a store from definitions registered in code.
    pub fn from_definitions(definitions: impl IntoIterator<Item = Migration>) -> Self {
        let mut store = Self::default();
        for migration in definitions {
            let source = migration.id.clone();
            store.register(migration, source);
        }
        store.reindex();
        store
    }

    /// Load every `*.json` migration file in `dir`, in file-name order.
    ///
    /// Only an unreadable directory is an error; bad files are skipped.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, MigrationError> {
        let dir = dir.as_ref();
        let mut store = Self::default();

        for path in migration_files(dir)? {
            let source = path.display().to_string();
            let parsed = std::fs::read_to_string(&path)
                .map_err(MigrationError::from)
                .and_then(|text| serde_json::from_str::<Migration>(&text).map_err(MigrationError::from));

            match parsed {
                Ok(migration) => store.register(migration, source),
                Err(e) => store.fail(source, e.to_string()),
            }
        }

        store.reindex();
        info!(
            dir = %dir.display(),
            loaded = store.migrations.len(),
            failed = store.failures.len(),
            "migrations loaded"
        );
        Ok(store)
    }

    /// All loaded migrations, lowest version first.
    pub fn all_migrations(&self) -> &[Migration] {
        &self.migrations
    }

    /// Look up a migration by id.
    pub fn by_id(&self, id: &str) -> Option<&Migration> {
        self.by_id.get(id).map(|&idx| &self.migrations[idx])
    }

    /// Look up a migration by version (first match if versions collide).
    pub fn by_version(&self, version: i64) -> Option<&Migration> {
        self.migrations.iter().find(|m| m.version == version)
    }

    /// Definitions that were skipped during load.
    pub fn load_failures(&self) -> &[LoadFailure] {
        &self.failures
    }

    /// Every loaded version.
    pub fn versions(&self) -> BTreeSet<i64> {
        self.migrations.iter().map(|m| m.version).collect()
    }

    /// Highest loaded version, or 0.
    pub fn max_version(&self) -> i64 {
        self.migrations.iter().map(|m| m.version).max().unwrap_or(0)
    }

    /// Number of loaded migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Check if no migrations were loaded.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    fn register(&mut self, migration: Migration, source: String) {
        if let Err(e) = migration.validate() {
            self.fail(source, e.to_string());
            return;
        }
        if self.migrations.iter().any(|m| m.id == migration.id) {
            let err = MigrationError::DuplicateId { id: migration.id };
            self.fail(source, err.to_string());
            return;
        }
        debug!(id = %migration.id, version = migration.version, "registered migration");
        self.migrations.push(migration);
    }

    fn fail(&mut self, source: String, reason: String) {
        warn!(source = %source, reason = %reason, "skipping migration");
        self.failures.push(LoadFailure { source, reason });
    }

    fn reindex(&mut self) {
        self.migrations.sort_by_key(|m| m.version);
        self.by_id = self
            .migrations
            .iter()
            .enumerate()
            .map(|(idx, m)| (m.id.clone(), idx))
            .collect();
    }
}

/// Write a new migration template into `dir`.
///
/// The version is one above the highest version found among the existing
/// files. Returns the path of the new file.
pub fn scaffold(dir: impl AsRef<Path>, name: &str) -> Result<PathBuf, MigrationError> {
    let dir = dir.as_ref();
    let slug = slugify(name);
    if slug.is_empty() {
        return Err(MigrationError::InvalidDefinition {
            id: String::new(),
            reason: format!("cannot derive a migration id from name {:?}", name),
        });
    }

    std::fs::create_dir_all(dir)?;
    let version = MigrationStore::load_dir(dir)?.max_version().max(highest_file_version(dir)?) + 1;
    let id = format!("{:04}_{}", version, slug);

    let template = Migration::new(
        id.clone(),
        version,
        name.trim(),
        format!("-- forward SQL for {}\nCREATE TABLE IF NOT EXISTS {} (id INTEGER PRIMARY KEY);\n", id, slug),
    )
    .with_description(format!("Describe what {} changes.", name.trim()))
    .with_rollback(format!("DROP TABLE IF EXISTS {};\n", slug));

    let path = dir.join(format!("{}.{}", id, MIGRATION_FILE_EXTENSION));
    if path.exists() {
        return Err(MigrationError::DuplicateId { id });
    }
    std::fs::write(&path, serde_json::to_string_pretty(&template)?)?;
    info!(path = %path.display(), version, "created migration template");
    Ok(path)
}

fn migration_files(dir: &Path) -> Result<Vec<PathBuf>, MigrationError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(MIGRATION_FILE_EXTENSION)
        {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Highest numeric prefix among migration file names, including files that
/// failed to load, so a new template never reuses their version.
fn highest_file_version(dir: &Path) -> Result<i64, MigrationError> {
    let highest = migration_files(dir)?
        .iter()
        .filter_map(|p| p.file_stem()?.to_str()?.split('_').next()?.parse::<i64>().ok())
        .max()
        .unwrap_or(0);
    Ok(highest)
}

fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars() {
        if c.is_ascii_alphanumeric() {
            slug.push(c.to_ascii_lowercase());
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    slug.trim_end_matches('_').to_string()
}
