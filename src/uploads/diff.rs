//! Comparison of two versions.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::{find_file, get_version_for_viewer, Version, VersionFile};
use crate::error::{AppError, AppResult};
use crate::metadata;
use crate::types::{parse_uuid_param, ContentType};
use crate::users::User;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetadataChange {
    pub key: String,
    pub old: Option<Value>,
    pub new: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct Pair<T> {
    pub old: T,
    pub new: T,
}

#[derive(Debug, Serialize)]
pub struct VersionDiff {
    pub metadata: Vec<MetadataChange>,
    pub version_file: Option<Pair<Option<VersionFile>>>,
    pub version: Pair<Version>,
}

/// Keys whose values differ between `old` and `new`, sorted by key.
pub fn metadata_changes(old: &BTreeMap<String, Value>, new: &BTreeMap<String, Value>) -> Vec<MetadataChange> {
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    keys.into_iter()
        .filter_map(|key| {
            let (before, after) = (old.get(key), new.get(key));
            (before != after).then(|| MetadataChange { key: key.clone(), old: before.cloned(), new: after.cloned() })
        })
        .collect()
}

/// Diffs the version `id` against the one named by `compare`. The older of the two is "old".
pub async fn diff(db: &SqlitePool, user: &User, id: Uuid, compare: Option<&str>) -> AppResult<VersionDiff> {
    let compare = compare
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .ok_or_else(|| AppError::validation("compare", "You must provide an uploads version to compare to."))?;
    let compare_id = parse_uuid_param(compare, "compare")?;

    let (version, _) = get_version_for_viewer(db, user, id).await?;
    let (other, _) = get_version_for_viewer(db, user, compare_id)
        .await
        .map_err(|_| AppError::NotFound("An uploads version with this primary key does not exist.".to_string()))?;

    let (older, newer) = if (other.creation_date, other.id) < (version.creation_date, version.id) {
        (other, version)
    } else {
        (version, other)
    };

    let old_values = metadata::values_for(db, ContentType::UploadsVersion, older.id).await?;
    let new_values = metadata::values_for(db, ContentType::UploadsVersion, newer.id).await?;

    let version_file = if older.version_file_id == newer.version_file_id {
        None
    } else {
        Some(Pair {
            old: load_file(db, older.version_file_id).await?,
            new: load_file(db, newer.version_file_id).await?,
        })
    };

    Ok(VersionDiff {
        metadata: metadata_changes(&old_values, &new_values),
        version_file,
        version: Pair { old: older, new: newer },
    })
}

async fn load_file(db: &SqlitePool, id: Option<Uuid>) -> AppResult<Option<VersionFile>> {
    match id {
        Some(id) => find_file(db, id).await,
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn only_differing_keys_are_reported() {
        let old: BTreeMap<String, Value> =
            [("a".to_string(), json!("1")), ("b".to_string(), json!("same")), ("gone".to_string(), json!("x"))].into();
        let new: BTreeMap<String, Value> =
            [("a".to_string(), json!("2")), ("b".to_string(), json!("same")), ("added".to_string(), json!("y"))].into();

        let changes = metadata_changes(&old, &new);
        let keys: Vec<&str> = changes.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "added", "gone"]);
        assert_eq!(changes[1].old, None);
        assert_eq!(changes[2].new, None);
    }
}
