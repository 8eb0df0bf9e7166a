//! Migration file discovery and checksums.

use std::collections::HashMap;
use std::path::Path;

use ring::digest;
use tracing::{debug, warn};

use super::MigrationFile;
use crate::error::{DbError, DbResult};
use crate::sql::hex;

/// Numeric id from a `NNN_description.sql` filename.
///
/// Returns `None` when the part before the first `_` is not a number.
pub fn parse_id(filename: &str) -> Option<u32> {
    let stem = filename.strip_suffix(".sql")?;
    let (prefix, _) = stem.split_once('_')?;
    if prefix.is_empty() || !prefix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    prefix.parse().ok()
}

/// Lowercase hex SHA-256 of `content`.
pub fn checksum(content: &str) -> String {
    hex(digest::digest(&digest::SHA256, content.as_bytes()).as_ref())
}

/// Read all migration files in `dir`, sorted by numeric id.
///
/// A missing directory yields no files.  Files that are not `.sql` are
/// ignored; `.sql` files without a numeric prefix are skipped with a
/// warning.  Two files sharing an id are a [`DbError::Discovery`] error.
pub async fn discover(dir: &Path) -> DbResult<Vec<MigrationFile>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(dir = %dir.display(), "migrations directory does not exist");
            return Ok(Vec::new());
        }
        Err(e) => {
            return Err(DbError::Discovery(format!(
                "cannot read {}: {e}",
                dir.display()
            )));
        }
    };

    let mut files = Vec::new();
    let mut seen: HashMap<u32, String> = HashMap::new();

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let Some(filename) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        if !filename.ends_with(".sql") {
            continue;
        }
        let Some(id) = parse_id(&filename) else {
            warn!(file = %filename, "skipping migration file without a numeric prefix");
            continue;
        };
        if let Some(previous) = seen.insert(id, filename.clone()) {
            return Err(DbError::Discovery(format!(
                "duplicate migration id {id}: {previous} and {filename}"
            )));
        }

        let content = tokio::fs::read_to_string(entry.path()).await.map_err(|e| {
            DbError::Discovery(format!("cannot read {filename}: {e}"))
        })?;
        files.push(MigrationFile {
            id,
            checksum: checksum(&content),
            filename,
            content,
        });
    }

    files.sort_by_key(|f| f.id);
    debug!(dir = %dir.display(), count = files.len(), "discovered migration files");
    Ok(files)
}
