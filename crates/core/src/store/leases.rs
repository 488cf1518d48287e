//! Advisory lease operations.
//!
//! A lease grants one holder exclusive permission to run an indexing pass
//! for a named source, across processes. Acquisition is a single
//! check-and-set inside an IMMEDIATE transaction so two callers can never
//! both observe "no lease" and both insert. Expiry is advisory: nothing
//! fires at the deadline, the row simply becomes reclaimable.

use super::connection::SqliteStore;
use super::parse_timestamp;
use crate::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_rusqlite::params;
use tokio_rusqlite::rusqlite;
use tokio_rusqlite::rusqlite::TransactionBehavior;
use uuid::Uuid;

/// A held lease row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub name: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Outcome of an acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseGrant {
    /// The caller now holds the lease under this token.
    Granted { holder: String },
    /// Another holder's unexpired lease exists.
    Held { remaining: Duration },
}

impl SqliteStore {
    /// Try to acquire the named lease for `ttl`.
    ///
    /// Atomic check-and-set: an unexpired row under a different holder
    /// yields `Held` with its remaining time-to-live; a missing or expired
    /// row is (re)created for the caller under a fresh holder token.
    pub async fn acquire_lease(&self, name: &str, ttl: Duration) -> Result<LeaseGrant, Error> {
        let name = name.to_string();
        let holder = Uuid::new_v4().to_string();
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|e| Error::InvalidInput(format!("lease ttl out of range: {e}")))?;
        let expires = now + ttl;

        self.conn
            .call(move |conn| -> Result<LeaseGrant, Error> {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

                let existing = match tx.query_row(
                    "SELECT holder, expires_at FROM leases WHERE name = ?1",
                    params![name],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                ) {
                    Ok(row) => Some(row),
                    Err(rusqlite::Error::QueryReturnedNoRows) => None,
                    Err(e) => return Err(e.into()),
                };

                if let Some((_, expires_raw)) = existing {
                    // An unreadable expiry counts as expired.
                    let held_until = parse_timestamp(1, &expires_raw).unwrap_or(now);
                    if held_until > now {
                        let remaining = (held_until - now).to_std().unwrap_or_default();
                        tx.commit()?;
                        return Ok(LeaseGrant::Held { remaining });
                    }
                }

                tx.execute(
                    "INSERT OR REPLACE INTO leases (name, holder, acquired_at, expires_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![name, holder, now.to_rfc3339(), expires.to_rfc3339()],
                )?;
                tx.commit()?;
                Ok(LeaseGrant::Granted { holder })
            })
            .await
            .map_err(Error::from)
    }

    /// Read the current lease row for a name, expired or not.
    ///
    /// Inspection helper for operators and tests; acquisition never goes
    /// through this read.
    pub async fn get_lease(&self, name: &str) -> Result<Option<Lease>, Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| -> Result<Option<Lease>, Error> {
                let result = conn.query_row(
                    "SELECT name, holder, acquired_at, expires_at FROM leases WHERE name = ?1",
                    params![name],
                    |row| {
                        Ok(Lease {
                            name: row.get(0)?,
                            holder: row.get(1)?,
                            acquired_at: parse_timestamp(2, &row.get::<_, String>(2)?)?,
                            expires_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
                        })
                    },
                );
                match result {
                    Ok(lease) => Ok(Some(lease)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e.into()),
                }
            })
            .await
            .map_err(Error::from)
    }

    /// Release the named lease if `holder` still owns it.
    ///
    /// Returns false without side effects on a holder mismatch, so a caller
    /// can never release a lease it does not currently hold.
    pub async fn release_lease(&self, name: &str, holder: &str) -> Result<bool, Error> {
        let name = name.to_string();
        let holder = holder.to_string();
        self.conn
            .call(move |conn| -> Result<bool, Error> {
                let deleted =
                    conn.execute("DELETE FROM leases WHERE name = ?1 AND holder = ?2", params![name, holder])?;
                Ok(deleted > 0)
            })
            .await
            .map_err(Error::from)
    }

    /// Delete every expired lease. Idempotent; safe from any process.
    ///
    /// Returns the number of deleted entries.
    pub async fn reap_expired_leases(&self) -> Result<u64, Error> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| -> Result<u64, Error> {
                let count = conn.execute("DELETE FROM leases WHERE expires_at <= ?1", params![now])?;
                Ok(count as u64)
            })
            .await
            .map_err(Error::from)
    }
}
