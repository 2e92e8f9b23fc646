//! Per-dataset advisory lock so two builds of one dataset cannot race.

use cdl_core::SqlIdent;
use sha2::{Digest, Sha256};
use sqlx::{PgConnection, Row};
use tracing::{debug, warn};

/// Stable 64-bit key for `pg_try_advisory_lock`, independent of server hashing.
pub fn advisory_lock_key(dataset: &SqlIdent) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(b"cdl-build:");
    hasher.update(dataset.as_str().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes)
}

/// Session-level lock held for the lifetime of one build connection.
///
/// Closing the connection releases it as well, so a crashed build never leaves
/// the dataset locked.
#[derive(Debug)]
pub struct BuildLock {
    key: i64,
    dataset: SqlIdent,
    held: bool,
}

impl BuildLock {
    /// `Ok(None)` means another session is already building this dataset.
    pub async fn try_acquire(
        conn: &mut PgConnection,
        dataset: &SqlIdent,
    ) -> Result<Option<Self>, sqlx::Error> {
        let key = advisory_lock_key(dataset);
        let row = sqlx::query("SELECT pg_try_advisory_lock($1) AS acquired")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        let acquired: bool = row.try_get("acquired")?;
        if !acquired {
            return Ok(None);
        }
        debug!(%dataset, key, "acquired build lock");
        Ok(Some(Self {
            key,
            dataset: dataset.clone(),
            held: true,
        }))
    }

    pub async fn release(mut self, conn: &mut PgConnection) -> Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .execute(&mut *conn)
            .await?;
        self.held = false;
        Ok(())
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        if self.held {
            warn!(dataset = %self.dataset, "build lock not released explicitly; it is freed when the connection closes");
        }
    }
}
