use crate::backend::{get_json, put_json, Backend};
use crate::error::{Result, SyncError};
use crate::schema::{keys, SCHEMA_VERSION};
use tracing::info;

/// Stamp a fresh store with the current layout version, or check that an
/// existing store was written with a version this build understands.
pub fn ensure_schema(backend: &dyn Backend) -> Result<u8> {
    match get_json::<u8>(backend, keys::SCHEMA_VERSION)? {
        None => {
            put_json(backend, keys::SCHEMA_VERSION, &SCHEMA_VERSION)?;
            info!("Initialized store at schema version {}", SCHEMA_VERSION);
            Ok(SCHEMA_VERSION)
        }
        Some(version) if version == SCHEMA_VERSION => Ok(version),
        Some(version) if version > SCHEMA_VERSION => Err(SyncError::Schema(format!(
            "Store schema version {} is newer than supported version {}",
            version, SCHEMA_VERSION
        ))),
        Some(version) => migrate(backend, version),
    }
}

/// Step an older store forward one version at a time
fn migrate(backend: &dyn Backend, from: u8) -> Result<u8> {
    let mut version = from;
    while version < SCHEMA_VERSION {
        match version {
            // Version 0 stores predate the version stamp; the layout is the same
            0 => version = 1,
            other => {
                return Err(SyncError::Schema(format!(
                    "No migration from schema version {}",
                    other
                )))
            }
        }
        put_json(backend, keys::SCHEMA_VERSION, &version)?;
        info!("Migrated store to schema version {}", version);
    }
    Ok(version)
}
