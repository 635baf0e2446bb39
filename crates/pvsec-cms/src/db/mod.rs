//! Durable certificate ledger
//!
//! One SQLite table holds every issued certificate and its lifecycle state.
//! The CMS process is the single writer; the connection sits behind a mutex
//! and every multi-statement operation runs in one transaction.  The state
//! machine is enforced here: `set_status` only applies when the current
//! status is in the caller's allowed set.

use std::{path::Path, sync::Mutex, sync::MutexGuard};

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use pvsec_pki::{now_utc, CertStatus, CertSubject};

use crate::error::{CmsError, Result};

const SQL_CREATE_DB: &str = "CREATE TABLE IF NOT EXISTS certs(
     serial INTEGER,
     skid TEXT,
     CN TEXT,
     O TEXT,
     OU TEXT,
     C TEXT,
     not_before INTEGER,
     not_after INTEGER,
     status INTEGER,
     status_date INTEGER
)";

const SQL_CREATE_CERT: &str = "INSERT INTO certs (
     serial, skid, CN, O, OU, C, not_before, not_after, status, status_date
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

const SQL_DUPS_SUBJECT: &str = "SELECT COUNT(*)
FROM certs
WHERE CN = ?1
  AND O = ?2
  AND OU = ?3
  AND C = ?4";

const SQL_DUPS_SUBJECT_KEY_IDENTIFIER: &str = "SELECT COUNT(*)
FROM certs
WHERE skid = ?1";

const SQL_CERT_STATUS: &str = "SELECT status, status_date
FROM certs
WHERE serial = ?1";

const SQL_CERT_RECORD: &str = "SELECT serial, skid, CN, O, OU, C, not_before, not_after, \
                               status, status_date
FROM certs
WHERE serial = ?1";

const SQL_CERT_TO_VALID: &str = "SELECT serial
FROM certs
WHERE status = ?1
  AND not_before <= ?2
  AND not_after > ?2";

const SQL_CERT_TO_EXPIRED: &str = "SELECT serial
FROM certs
WHERE status IN (?1, ?2, ?3)
  AND not_after <= ?4";

/// One row of the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertRecord {
    pub serial: u64,
    pub skid: String,
    pub subject: CertSubject,
    pub not_before: i64,
    pub not_after: i64,
    pub status: CertStatus,
    pub status_date: i64,
}

/// What an issuance collided with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateKind {
    Subject,
    SubjectKeyId,
}

/// The certificate database
pub struct CertDb {
    conn: Mutex<Connection>,
}

impl CertDb {
    /// Open (creating if needed) the ledger at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::init(Connection::open(path)?)
    }

    /// In-memory ledger for tests
    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(SQL_CREATE_DB, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Check a prospective issuance against existing subjects and keys
    pub fn check_duplicate(
        &self,
        subject: &CertSubject,
        skid: &str,
    ) -> Result<Option<DuplicateKind>> {
        let conn = self.conn();
        let by_subject: i64 = conn.query_row(
            SQL_DUPS_SUBJECT,
            params![
                subject.common_name,
                subject.organization,
                subject.organization_unit,
                subject.country
            ],
            |row| row.get(0),
        )?;
        if by_subject > 0 {
            return Ok(Some(DuplicateKind::Subject));
        }
        let by_skid: i64 =
            conn.query_row(SQL_DUPS_SUBJECT_KEY_IDENTIFIER, params![skid], |row| {
                row.get(0)
            })?;
        if by_skid > 0 {
            return Ok(Some(DuplicateKind::SubjectKeyId));
        }
        Ok(None)
    }

    /// Insert a new certificate record.  The duplicate checks and the insert
    /// run in one transaction.
    pub fn insert(&self, record: &CertRecord) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let by_subject: i64 = tx.query_row(
            SQL_DUPS_SUBJECT,
            params![
                record.subject.common_name,
                record.subject.organization,
                record.subject.organization_unit,
                record.subject.country
            ],
            |row| row.get(0),
        )?;
        if by_subject > 0 {
            return Err(CmsError::DuplicateSubject);
        }
        let by_skid: i64 = tx.query_row(
            SQL_DUPS_SUBJECT_KEY_IDENTIFIER,
            params![record.skid],
            |row| row.get(0),
        )?;
        if by_skid > 0 {
            return Err(CmsError::DuplicateKey);
        }

        tx.execute(
            SQL_CREATE_CERT,
            params![
                record.serial as i64,
                record.skid,
                record.subject.common_name,
                record.subject.organization,
                record.subject.organization_unit,
                record.subject.country,
                record.not_before,
                record.not_after,
                i64::from(record.status.index()),
                record.status_date,
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Current status and when it last changed
    pub fn get_status(&self, serial: u64) -> Result<(CertStatus, i64)> {
        let row: Option<(i64, i64)> = self
            .conn()
            .query_row(SQL_CERT_STATUS, params![serial as i64], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .optional()?;
        let (status, status_date) = row.ok_or(CmsError::NotFound(serial))?;
        Ok((status_from_i64(status)?, status_date))
    }

    /// Full record for one serial
    pub fn get_record(&self, serial: u64) -> Result<CertRecord> {
        let record = self
            .conn()
            .query_row(SQL_CERT_RECORD, params![serial as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                    row.get::<_, i64>(7)?,
                    row.get::<_, i64>(8)?,
                    row.get::<_, i64>(9)?,
                ))
            })
            .optional()?
            .ok_or(CmsError::NotFound(serial))?;

        Ok(CertRecord {
            serial: record.0 as u64,
            skid: record.1,
            subject: CertSubject {
                common_name: record.2,
                organization: record.3,
                organization_unit: record.4,
                country: record.5,
            },
            not_before: record.6,
            not_after: record.7,
            status: status_from_i64(record.8)?,
            status_date: record.9,
        })
    }

    /// Atomically move a certificate to `new_status`, but only when its
    /// current status is one of `allowed_prior`.  This is where the state
    /// machine is enforced, not merely in memory.
    pub fn set_status(
        &self,
        serial: u64,
        new_status: CertStatus,
        allowed_prior: &[CertStatus],
    ) -> Result<()> {
        let placeholders = (0..allowed_prior.len())
            .map(|i| format!("?{}", i + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE certs SET status = ?1, status_date = ?2 \
             WHERE serial = ?3 AND status IN ({placeholders})"
        );

        let mut values: Vec<i64> = vec![
            i64::from(new_status.index()),
            now_utc(),
            serial as i64,
        ];
        values.extend(allowed_prior.iter().map(|s| i64::from(s.index())));

        let changed = self.conn().execute(&sql, params_from_iter(values))?;
        if changed > 0 {
            return Ok(());
        }

        // Distinguish a missing row from an illegal transition
        let (current, _) = self.get_status(serial)?;
        Err(CmsError::IllegalTransition {
            serial,
            from: current,
            to: new_status,
        })
    }

    /// Serials whose validity window has opened while they sat in PENDING
    pub fn sweep_due_valid(&self, now: i64) -> Result<Vec<u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(SQL_CERT_TO_VALID)?;
        let serials = stmt
            .query_map(params![i64::from(CertStatus::Pending.index()), now], |row| {
                row.get::<_, i64>(0)
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(serials.into_iter().map(|s| s as u64).collect())
    }

    /// Serials whose validity window has closed
    pub fn sweep_due_expired(&self, now: i64) -> Result<Vec<u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(SQL_CERT_TO_EXPIRED)?;
        let serials = stmt
            .query_map(
                params![
                    i64::from(CertStatus::PendingApproval.index()),
                    i64::from(CertStatus::Pending.index()),
                    i64::from(CertStatus::Valid.index()),
                    now
                ],
                |row| row.get::<_, i64>(0),
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(serials.into_iter().map(|s| s as u64).collect())
    }

    /// Every serial in the ledger, for startup republication
    pub fn all_serials(&self) -> Result<Vec<u64>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT serial FROM certs")?;
        let serials = stmt
            .query_map([], |row| row.get::<_, i64>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(serials.into_iter().map(|s| s as u64).collect())
    }
}

fn status_from_i64(value: i64) -> Result<CertStatus> {
    let index = u16::try_from(value)
        .map_err(|_| CmsError::MalformedRequest(format!("corrupt status value {value}")))?;
    Ok(CertStatus::from_index(index)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(serial: u64, cn: &str, status: CertStatus) -> CertRecord {
        let now = now_utc();
        CertRecord {
            serial,
            skid: format!("skid-{serial}"),
            subject: CertSubject {
                common_name: cn.to_string(),
                organization: "ornl.gov".to_string(),
                organization_unit: String::new(),
                country: "US".to_string(),
            },
            not_before: now - 10,
            not_after: now + 3600,
            status,
            status_date: now,
        }
    }

    #[test]
    fn test_insert_and_get_status() {
        let db = CertDb::open_in_memory().unwrap();
        db.insert(&record(1, "alice", CertStatus::Valid)).unwrap();
        let (status, _) = db.get_status(1).unwrap();
        assert_eq!(status, CertStatus::Valid);
        assert!(matches!(db.get_status(2), Err(CmsError::NotFound(2))));
    }

    #[test]
    fn test_duplicate_subject_rejected() {
        let db = CertDb::open_in_memory().unwrap();
        db.insert(&record(1, "alice", CertStatus::Valid)).unwrap();

        let mut dup = record(2, "alice", CertStatus::Valid);
        dup.skid = "different".to_string();
        assert!(matches!(db.insert(&dup), Err(CmsError::DuplicateSubject)));

        // No second row was written
        assert_eq!(db.all_serials().unwrap(), vec![1]);
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let db = CertDb::open_in_memory().unwrap();
        db.insert(&record(1, "alice", CertStatus::Valid)).unwrap();

        let mut dup = record(2, "bob", CertStatus::Valid);
        dup.skid = "skid-1".to_string();
        assert!(matches!(db.insert(&dup), Err(CmsError::DuplicateKey)));
    }

    #[test]
    fn test_check_duplicate() {
        let db = CertDb::open_in_memory().unwrap();
        let rec = record(1, "alice", CertStatus::Valid);
        db.insert(&rec).unwrap();

        assert_eq!(
            db.check_duplicate(&rec.subject, "other").unwrap(),
            Some(DuplicateKind::Subject)
        );
        let other_subject = CertSubject::new("bob");
        assert_eq!(
            db.check_duplicate(&other_subject, "skid-1").unwrap(),
            Some(DuplicateKind::SubjectKeyId)
        );
        assert_eq!(db.check_duplicate(&other_subject, "other").unwrap(), None);
    }

    #[test]
    fn test_set_status_enforces_allowed_prior() {
        let db = CertDb::open_in_memory().unwrap();
        db.insert(&record(1, "alice", CertStatus::Valid)).unwrap();

        db.set_status(
            1,
            CertStatus::Revoked,
            &[
                CertStatus::PendingApproval,
                CertStatus::Pending,
                CertStatus::Valid,
            ],
        )
        .unwrap();
        let (status, _) = db.get_status(1).unwrap();
        assert_eq!(status, CertStatus::Revoked);

        // Second application fails and leaves the row untouched
        let err = db
            .set_status(
                1,
                CertStatus::Revoked,
                &[
                    CertStatus::PendingApproval,
                    CertStatus::Pending,
                    CertStatus::Valid,
                ],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            CmsError::IllegalTransition {
                serial: 1,
                from: CertStatus::Revoked,
                to: CertStatus::Revoked,
            }
        ));
        let (status, _) = db.get_status(1).unwrap();
        assert_eq!(status, CertStatus::Revoked);
    }

    #[test]
    fn test_set_status_missing_row() {
        let db = CertDb::open_in_memory().unwrap();
        assert!(matches!(
            db.set_status(9, CertStatus::Valid, &[CertStatus::Pending]),
            Err(CmsError::NotFound(9))
        ));
    }

    #[test]
    fn test_sweep_queries() {
        let db = CertDb::open_in_memory().unwrap();
        let now = now_utc();

        // Pending and inside its window: becomes valid
        db.insert(&record(1, "alice", CertStatus::Pending)).unwrap();
        // Valid but already past not_after: expires
        let mut expired = record(2, "bob", CertStatus::Valid);
        expired.not_after = now - 1;
        db.insert(&expired).unwrap();
        // Pending and not yet inside its window: untouched
        let mut future = record(3, "carol", CertStatus::Pending);
        future.not_before = now + 1000;
        db.insert(&future).unwrap();

        assert_eq!(db.sweep_due_valid(now).unwrap(), vec![1]);
        assert_eq!(db.sweep_due_expired(now).unwrap(), vec![2]);
    }

    #[test]
    fn test_get_record_roundtrip() {
        let db = CertDb::open_in_memory().unwrap();
        let rec = record(5, "dave", CertStatus::PendingApproval);
        db.insert(&rec).unwrap();
        assert_eq!(db.get_record(5).unwrap(), rec);
    }
}
