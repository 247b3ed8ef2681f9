//! Forward-only schema migrations, executed once at boot before any other
//! subsystem starts. Migration failure is fatal (exit code 1).

use serde_json::Value;

use crate::error::StoreError;

const SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

/// Current schema version. Bump when adding a migration.
pub const CURRENT_VERSION: u32 = 2;

type Migration = fn(&sled::Tree, &sled::Db) -> Result<(), StoreError>;

/// Ordered list of migrations. Index `i` transitions from version `i` to
/// `i + 1`; `MIGRATIONS[0]` is a no-op marking the initial schema.
const MIGRATIONS: &[Migration] = &[migration_0_initial, migration_1_add_control_mode];

/// Run every migration the current on-disk version hasn't seen yet.
pub fn run(db: &sled::Db) -> Result<(), StoreError> {
    let meta = db
        .open_tree("meta")
        .map_err(|e| StoreError::MigrationFailed {
            version: 0,
            reason: e.to_string(),
        })?;

    let current = read_version(&meta)?;

    for (version, migration) in MIGRATIONS.iter().enumerate() {
        let version = version as u32;
        if version < current {
            continue;
        }
        migration(&meta, db).map_err(|e| StoreError::MigrationFailed {
            version,
            reason: e.to_string(),
        })?;
        write_version(&meta, version + 1)?;
    }

    db.flush().map_err(|e| StoreError::MigrationFailed {
        version: CURRENT_VERSION,
        reason: e.to_string(),
    })?;
    Ok(())
}

fn read_version(meta: &sled::Tree) -> Result<u32, StoreError> {
    match meta
        .get(SCHEMA_VERSION_KEY)
        .map_err(|e| StoreError::MigrationFailed {
            version: 0,
            reason: e.to_string(),
        })? {
        Some(bytes) => {
            let arr: [u8; 4] = bytes.as_ref().try_into().map_err(|_| StoreError::MigrationFailed {
                version: 0,
                reason: "corrupt schema_version value".into(),
            })?;
            Ok(u32::from_le_bytes(arr))
        }
        None => Ok(0),
    }
}

fn write_version(meta: &sled::Tree, version: u32) -> Result<(), StoreError> {
    meta.insert(SCHEMA_VERSION_KEY, &version.to_le_bytes())
        .map_err(|e| StoreError::MigrationFailed {
            version,
            reason: e.to_string(),
        })?;
    Ok(())
}

/// Version 0 -> 1: establishes the `meta`, `current_stage`, `readings`,
/// `actions`, `alerts`, and `compliance_records` trees. No data to move.
fn migration_0_initial(_meta: &sled::Tree, db: &sled::Db) -> Result<(), StoreError> {
    for tree in ["current_stage", "readings", "actions", "alerts", "compliance_records"] {
        db.open_tree(tree)
            .map_err(|e| StoreError::MigrationFailed {
                version: 0,
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

/// Version 1 -> 2: adds `control_mode` to the persisted `current_stage`
/// row. Rows written before this migration don't carry the field; backfill
/// it from the still-persisted `mode` using the same derivation the
/// arbiter uses at runtime (FULL/SEMI -> AUTOMATIC, MANUAL -> MANUAL).
fn migration_1_add_control_mode(_meta: &sled::Tree, db: &sled::Db) -> Result<(), StoreError> {
    let tree = db
        .open_tree("current_stage")
        .map_err(|e| StoreError::MigrationFailed {
            version: 1,
            reason: e.to_string(),
        })?;

    let Some(bytes) = tree.get(b"current").map_err(|e| StoreError::MigrationFailed {
        version: 1,
        reason: e.to_string(),
    })?
    else {
        return Ok(());
    };

    let mut value: Value =
        serde_json::from_slice(&bytes).map_err(|e| StoreError::MigrationFailed {
            version: 1,
            reason: e.to_string(),
        })?;

    if value.get("control_mode").is_some() {
        return Ok(());
    }

    let derived = match value.get("mode").and_then(Value::as_str) {
        Some("Manual") => "Manual",
        _ => "Automatic",
    };
    if let Some(obj) = value.as_object_mut() {
        obj.insert("control_mode".into(), Value::String(derived.into()));
    }

    let rewritten = serde_json::to_vec(&value).map_err(|e| StoreError::MigrationFailed {
        version: 1,
        reason: e.to_string(),
    })?;
    tree.insert(b"current", rewritten)
        .map_err(|e| StoreError::MigrationFailed {
            version: 1,
            reason: e.to_string(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_db_lands_on_current_version() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        run(&db).unwrap();
        let meta = db.open_tree("meta").unwrap();
        assert_eq!(read_version(&meta).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn migrations_are_idempotent() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        run(&db).unwrap();
        run(&db).unwrap();
        let meta = db.open_tree("meta").unwrap();
        assert_eq!(read_version(&meta).unwrap(), CURRENT_VERSION);
    }

    #[test]
    fn legacy_row_without_control_mode_gets_backfilled() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let tree = db.open_tree("current_stage").unwrap();
        let legacy = serde_json::json!({ "mode": "Manual", "species": "Oyster" });
        tree.insert(b"current", serde_json::to_vec(&legacy).unwrap())
            .unwrap();

        run(&db).unwrap();

        let raw = tree.get(b"current").unwrap().unwrap();
        let value: Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["control_mode"], "Manual");
    }
}
