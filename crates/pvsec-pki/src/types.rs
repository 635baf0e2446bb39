//! Status enums, status values and certificate identity
//!
//! The two status enums are closed sets carried on the wire as small indices
//! with a parallel string form.  `CertificateStatus` is the in-memory value
//! published on a status PV; the signed token bytes are optional so the same
//! struct serves both the publishing side and verified parses.

use serde::{Deserialize, Serialize};
use time::{
    format_description::FormatItem, macros::format_description, OffsetDateTime, PrimitiveDateTime,
};

use crate::error::{PkiError, Result};

/// Root of every certificate status PV name
pub const CERT_STATUS_ROOT: &str = "CERT:STATUS";
/// Root of every revocation RPC PV name
pub const CERT_REVOKE_ROOT: &str = "CERT:REVOKE";
/// Wildcard the CMS listens on for status requests
pub const CERT_STATUS_WILDCARD: &str = "CERT:STATUS:????????:*";

/// Date format used for all published status date strings
const CERT_TIME_FORMAT: &[FormatItem<'static>] = format_description!(
    "[weekday repr:short] [month repr:short] [day] [hour]:[minute]:[second] [year] UTC"
);

/// Lifecycle state of an issued certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertStatus {
    Unknown,
    PendingApproval,
    Pending,
    Valid,
    Expired,
    Revoked,
}

impl CertStatus {
    /// Wire enum choices, in index order
    pub const CHOICES: [&'static str; 6] = [
        "UNKNOWN",
        "PENDING_APPROVAL",
        "PENDING",
        "VALID",
        "EXPIRED",
        "REVOKED",
    ];

    pub fn index(self) -> u16 {
        match self {
            CertStatus::Unknown => 0,
            CertStatus::PendingApproval => 1,
            CertStatus::Pending => 2,
            CertStatus::Valid => 3,
            CertStatus::Expired => 4,
            CertStatus::Revoked => 5,
        }
    }

    pub fn from_index(index: u16) -> Result<Self> {
        Ok(match index {
            0 => CertStatus::Unknown,
            1 => CertStatus::PendingApproval,
            2 => CertStatus::Pending,
            3 => CertStatus::Valid,
            4 => CertStatus::Expired,
            5 => CertStatus::Revoked,
            other => {
                return Err(PkiError::MalformedToken(format!(
                    "unknown certificate status index {other}"
                )))
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        Self::CHOICES[self.index() as usize]
    }

    /// OCSP status implied by this lifecycle state
    pub fn ocsp_status(self) -> OcspStatus {
        match self {
            CertStatus::Valid => OcspStatus::Good,
            CertStatus::Revoked => OcspStatus::Revoked,
            _ => OcspStatus::Unknown,
        }
    }
}

/// OCSP-equivalent status carried inside the signed token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OcspStatus {
    Good,
    Revoked,
    Unknown,
}

impl OcspStatus {
    /// Wire enum choices, in index order
    pub const CHOICES: [&'static str; 3] = [
        "OCSP_CERTSTATUS_GOOD",
        "OCSP_CERTSTATUS_REVOKED",
        "OCSP_CERTSTATUS_UNKNOWN",
    ];

    pub fn index(self) -> u16 {
        match self {
            OcspStatus::Good => 0,
            OcspStatus::Revoked => 1,
            OcspStatus::Unknown => 2,
        }
    }

    pub fn from_index(index: u16) -> Result<Self> {
        Ok(match index {
            0 => OcspStatus::Good,
            1 => OcspStatus::Revoked,
            2 => OcspStatus::Unknown,
            other => {
                return Err(PkiError::MalformedToken(format!(
                    "unknown OCSP status index {other}"
                )))
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        Self::CHOICES[self.index() as usize]
    }
}

/// Current unix time, UTC
pub fn now_utc() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Format a unix timestamp as `Www Mmm DD HH:MM:SS YYYY UTC`
pub fn format_cert_time(t: i64) -> Result<String> {
    let dt = OffsetDateTime::from_unix_timestamp(t)
        .map_err(|e| PkiError::MalformedToken(format!("invalid timestamp {t}: {e}")))?;
    dt.format(&CERT_TIME_FORMAT)
        .map_err(|e| PkiError::MalformedToken(format!("failed to format date: {e}")))
}

/// Parse a `Www Mmm DD HH:MM:SS YYYY UTC` string back to a unix timestamp
pub fn parse_cert_time(s: &str) -> Result<i64> {
    let dt = PrimitiveDateTime::parse(s, &CERT_TIME_FORMAT)
        .map_err(|e| PkiError::MalformedToken(format!("failed to parse date {s:?}: {e}")))?;
    Ok(dt.assume_utc().unix_timestamp())
}

/// Identity of an issued certificate: `<issuer_id>:<serial>`
///
/// `issuer_id` is the 8 lowercase hex char prefix of the issuer's Subject Key
/// Identifier; the serial appears zero-padded to 16 hex digits in PV names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CertId {
    pub issuer_id: String,
    pub serial: u64,
}

impl CertId {
    pub fn new(issuer_id: impl Into<String>, serial: u64) -> Self {
        Self {
            issuer_id: issuer_id.into(),
            serial,
        }
    }

    /// `CERT:STATUS:<issuer_id>:<serial16hex>`
    pub fn status_pv(&self) -> String {
        format!("{}:{}:{:016x}", CERT_STATUS_ROOT, self.issuer_id, self.serial)
    }

    /// `CERT:REVOKE:<issuer_id>:<serial>`
    pub fn revoke_pv(&self) -> String {
        format!("{}:{}:{}", CERT_REVOKE_ROOT, self.issuer_id, self.serial)
    }

    /// Parse a revoke PV name (`CERT:REVOKE:<issuer_id>:<serial>`, serial in
    /// decimal) back into a certificate id
    pub fn from_revoke_pv(pv_name: &str) -> Result<Self> {
        let rest = pv_name
            .strip_prefix(CERT_REVOKE_ROOT)
            .and_then(|s| s.strip_prefix(':'))
            .ok_or_else(|| {
                PkiError::PvNameError(format!("not a revoke PV name: {pv_name:?}"))
            })?;
        let (issuer_id, serial_dec) = rest
            .split_once(':')
            .ok_or_else(|| PkiError::PvNameError(format!("missing serial in {pv_name:?}")))?;
        if issuer_id.len() != 8 || !issuer_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PkiError::PvNameError(format!(
                "bad issuer id {issuer_id:?} in {pv_name:?}"
            )));
        }
        let serial = serial_dec
            .parse::<u64>()
            .map_err(|e| PkiError::PvNameError(format!("bad serial in {pv_name:?}: {e}")))?;
        Ok(Self::new(issuer_id, serial))
    }

    /// Parse a status PV name back into a certificate id
    pub fn from_status_pv(pv_name: &str) -> Result<Self> {
        let rest = pv_name
            .strip_prefix(CERT_STATUS_ROOT)
            .and_then(|s| s.strip_prefix(':'))
            .ok_or_else(|| {
                PkiError::PvNameError(format!("not a status PV name: {pv_name:?}"))
            })?;
        let (issuer_id, serial_hex) = rest
            .split_once(':')
            .ok_or_else(|| PkiError::PvNameError(format!("missing serial in {pv_name:?}")))?;
        if issuer_id.len() != 8 || !issuer_id.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(PkiError::PvNameError(format!(
                "bad issuer id {issuer_id:?} in {pv_name:?}"
            )));
        }
        let serial = u64::from_str_radix(serial_hex, 16)
            .map_err(|e| PkiError::PvNameError(format!("bad serial in {pv_name:?}: {e}")))?;
        Ok(Self::new(issuer_id, serial))
    }
}

impl std::fmt::Display for CertId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.issuer_id, self.serial)
    }
}

/// A certificate's published status value.
///
/// `ocsp_bytes` carries the signed token when one was produced; a verified
/// parse of that token yields the same struct with the bytes dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateStatus {
    pub pva_status: CertStatus,
    pub ocsp_status: OcspStatus,
    pub status_date: i64,
    pub valid_until: i64,
    pub revocation_date: Option<i64>,
    pub ocsp_bytes: Option<Vec<u8>>,
}

impl CertificateStatus {
    /// A status for the given lifecycle state with its implied OCSP status
    pub fn new(
        pva_status: CertStatus,
        status_date: i64,
        valid_until: i64,
        revocation_date: Option<i64>,
    ) -> Self {
        Self {
            pva_status,
            ocsp_status: pva_status.ocsp_status(),
            status_date,
            valid_until,
            revocation_date,
            ocsp_bytes: None,
        }
    }

    /// The degraded status published when no signed token can be produced
    pub fn unknown() -> Self {
        Self {
            pva_status: CertStatus::Unknown,
            ocsp_status: OcspStatus::Unknown,
            status_date: 0,
            valid_until: 0,
            revocation_date: None,
            ocsp_bytes: None,
        }
    }

    /// A status is fresh while its validity window has not passed
    pub fn is_fresh(&self, now: i64) -> bool {
        now < self.valid_until
    }

    /// Fresh and OCSP-good
    pub fn is_good(&self, now: i64) -> bool {
        self.is_fresh(now) && self.ocsp_status == OcspStatus::Good
    }

    /// The invariant pairing of the two status enums
    pub fn self_consistent(&self) -> bool {
        match self.ocsp_status {
            OcspStatus::Good => self.pva_status == CertStatus::Valid,
            OcspStatus::Revoked => self.pva_status == CertStatus::Revoked,
            OcspStatus::Unknown => {
                self.pva_status != CertStatus::Valid && self.pva_status != CertStatus::Revoked
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_pv_name_padding() {
        let id = CertId::new("deadbeef", 0x2ff);
        assert_eq!(id.status_pv(), "CERT:STATUS:deadbeef:00000000000002ff");
        assert_eq!(id.revoke_pv(), "CERT:REVOKE:deadbeef:767");
    }

    #[test]
    fn test_revoke_pv_roundtrip() {
        let id = CertId::new("deadbeef", 767);
        let parsed = CertId::from_revoke_pv(&id.revoke_pv()).unwrap();
        assert_eq!(parsed, id);
        assert!(CertId::from_revoke_pv("CERT:STATUS:deadbeef:767").is_err());
    }

    #[test]
    fn test_status_pv_roundtrip() {
        let id = CertId::new("0a1b2c3d", u64::MAX >> 1);
        let parsed = CertId::from_status_pv(&id.status_pv()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_status_pv_rejects_garbage() {
        assert!(CertId::from_status_pv("CERT:REVOKE:deadbeef:1").is_err());
        assert!(CertId::from_status_pv("CERT:STATUS:xyz:1").is_err());
        assert!(CertId::from_status_pv("CERT:STATUS:deadbeef").is_err());
        assert!(CertId::from_status_pv("CERT:STATUS:deadbeef:nothex").is_err());
    }

    #[test]
    fn test_cert_time_roundtrip() {
        let t = 1700000000;
        let s = format_cert_time(t).unwrap();
        assert!(s.ends_with("UTC"));
        assert_eq!(parse_cert_time(&s).unwrap(), t);
    }

    #[test]
    fn test_enum_indices_match_choices() {
        for i in 0..6u16 {
            let st = CertStatus::from_index(i).unwrap();
            assert_eq!(st.index(), i);
            assert_eq!(st.as_str(), CertStatus::CHOICES[i as usize]);
        }
        for i in 0..3u16 {
            let st = OcspStatus::from_index(i).unwrap();
            assert_eq!(st.index(), i);
        }
        assert!(CertStatus::from_index(6).is_err());
        assert!(OcspStatus::from_index(3).is_err());
    }

    #[test]
    fn test_ocsp_mapping_invariants() {
        assert_eq!(CertStatus::Valid.ocsp_status(), OcspStatus::Good);
        assert_eq!(CertStatus::Revoked.ocsp_status(), OcspStatus::Revoked);
        for st in [
            CertStatus::Unknown,
            CertStatus::PendingApproval,
            CertStatus::Pending,
            CertStatus::Expired,
        ] {
            assert_eq!(st.ocsp_status(), OcspStatus::Unknown);
        }
    }

    #[test]
    fn test_freshness_and_goodness() {
        let now = now_utc();
        let good = CertificateStatus::new(CertStatus::Valid, now, now + 60, None);
        assert!(good.is_fresh(now));
        assert!(good.is_good(now));
        assert!(!good.is_good(now + 61));

        let revoked = CertificateStatus::new(CertStatus::Revoked, now, now + 60, Some(now));
        assert!(revoked.is_fresh(now));
        assert!(!revoked.is_good(now));
        assert!(revoked.self_consistent());

        assert!(CertificateStatus::unknown().self_consistent());
        assert!(!CertificateStatus::unknown().is_good(now));
    }
}
