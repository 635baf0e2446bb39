//! The structured status value published on every status PV
//!
//! The wire value mirrors the signed token: enum indices plus their string
//! forms, formatted date strings, and the raw token bytes.  A subscriber
//! never trusts the plain fields on their own; `verify_wire_status` accepts a
//! value only when the signed token verifies and certifies the same content.

use serde::{Deserialize, Serialize};

use crate::{
    cert::Certificate,
    error::PkiError,
    status::codec,
    types::{format_cert_time, CertStatus, CertificateStatus, OcspStatus},
    Result,
};

/// Wire shape of one status publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusWireValue {
    pub status: u16,
    pub state: String,
    pub serial: u64,
    pub ocsp_status: u16,
    pub ocsp_state: String,
    pub ocsp_status_date: String,
    pub ocsp_certified_until: String,
    pub ocsp_revocation_date: String,
    pub ocsp_response: Vec<u8>,
}

/// Build the wire value for a status publication
pub fn to_wire(serial: u64, status: &CertificateStatus) -> Result<StatusWireValue> {
    let (status_date, certified_until, revocation_date) = if status.ocsp_bytes.is_some() {
        (
            format_cert_time(status.status_date)?,
            format_cert_time(status.valid_until)?,
            match status.revocation_date {
                Some(t) => format_cert_time(t)?,
                None => String::new(),
            },
        )
    } else {
        // Degraded publication: no certified dates to show
        (String::new(), String::new(), String::new())
    };

    Ok(StatusWireValue {
        status: status.pva_status.index(),
        state: status.pva_status.as_str().to_string(),
        serial,
        ocsp_status: status.ocsp_status.index(),
        ocsp_state: status.ocsp_status.as_str().to_string(),
        ocsp_status_date: status_date,
        ocsp_certified_until: certified_until,
        ocsp_revocation_date: revocation_date,
        ocsp_response: status.ocsp_bytes.clone().unwrap_or_default(),
    })
}

/// Verify a received wire value and convert it to a certified status.
///
/// A value without token bytes degrades to `UNKNOWN` regardless of what its
/// plain fields claim.  A value with bytes must verify, must certify the same
/// serial, statuses and dates as the plain fields, and must satisfy the
/// pva/ocsp pairing invariants.
pub fn verify_wire_status(
    value: &StatusWireValue,
    trust_anchors: &[Certificate],
    allow_self_signed_anchor: bool,
) -> Result<CertificateStatus> {
    let pva_status = CertStatus::from_index(value.status)?;

    if value.ocsp_response.is_empty() {
        tracing::debug!(
            serial = value.serial,
            state = %value.state,
            "status value carries no signed token, treating as UNKNOWN"
        );
        return Ok(CertificateStatus::unknown());
    }

    let parsed =
        codec::decode_and_verify(&value.ocsp_response, trust_anchors, allow_self_signed_anchor)?;

    if parsed.serial != value.serial {
        return Err(PkiError::MalformedToken(format!(
            "token certifies serial {} but value claims {}",
            parsed.serial, value.serial
        )));
    }
    if parsed.ocsp_status != OcspStatus::from_index(value.ocsp_status)? {
        return Err(PkiError::MalformedToken(
            "OCSP status does not match certified status".to_string(),
        ));
    }

    let status = CertificateStatus {
        pva_status,
        ocsp_status: parsed.ocsp_status,
        status_date: parsed.status_date,
        valid_until: parsed.valid_until,
        revocation_date: parsed.revocation_date,
        ocsp_bytes: Some(value.ocsp_response.clone()),
    };

    if !status.self_consistent() {
        return Err(PkiError::MalformedToken(
            "certificate status does not match certified OCSP status".to_string(),
        ));
    }

    // The human-readable dates must be the certified ones
    if value.ocsp_status_date != format_cert_time(parsed.status_date)?
        || value.ocsp_certified_until != format_cert_time(parsed.valid_until)?
    {
        return Err(PkiError::MalformedToken(
            "status dates do not match certified dates".to_string(),
        ));
    }
    if let Some(revoked_at) = parsed.revocation_date {
        if value.ocsp_revocation_date != format_cert_time(revoked_at)? {
            return Err(PkiError::MalformedToken(
                "revocation date does not match certified date".to_string(),
            ));
        }
    }

    Ok(status)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pvsec_key::KeyPair;

    use super::*;
    use crate::{
        cert::{factory::build_self_signed_ca, CertSubject},
        status::codec::CertStatusFactory,
        types::now_utc,
    };

    fn factory() -> (Certificate, CertStatusFactory) {
        let key = Arc::new(KeyPair::generate().unwrap());
        let now = now_utc();
        let cert = build_self_signed_ca(
            CertSubject::new("EPICS Root CA"),
            &key,
            now - 10,
            now + 3600,
        )
        .unwrap();
        let factory = CertStatusFactory::new(cert.clone(), key, vec![], 30).unwrap();
        (cert, factory)
    }

    #[test]
    fn test_wire_roundtrip_verifies() {
        let (anchor, factory) = factory();
        let status = factory.create_status(9, CertStatus::Valid, None).unwrap();
        let wire = to_wire(9, &status).unwrap();

        assert_eq!(wire.state, "VALID");
        assert_eq!(wire.ocsp_state, "OCSP_CERTSTATUS_GOOD");
        assert!(wire.ocsp_revocation_date.is_empty());

        let verified = verify_wire_status(&wire, &[anchor], false).unwrap();
        assert_eq!(verified, status);
    }

    #[test]
    fn test_revoked_wire_value() {
        let (anchor, factory) = factory();
        let status = factory
            .create_status(10, CertStatus::Revoked, Some(now_utc()))
            .unwrap();
        let wire = to_wire(10, &status).unwrap();
        assert!(!wire.ocsp_revocation_date.is_empty());

        let verified = verify_wire_status(&wire, &[anchor], false).unwrap();
        assert_eq!(verified.ocsp_status, OcspStatus::Revoked);
        assert!(!verified.is_good(now_utc()));
    }

    #[test]
    fn test_empty_token_degrades_to_unknown() {
        let wire = StatusWireValue {
            status: CertStatus::Valid.index(),
            state: "VALID".to_string(),
            serial: 3,
            ocsp_status: OcspStatus::Good.index(),
            ocsp_state: "OCSP_CERTSTATUS_GOOD".to_string(),
            ocsp_status_date: String::new(),
            ocsp_certified_until: String::new(),
            ocsp_revocation_date: String::new(),
            ocsp_response: vec![],
        };
        let status = verify_wire_status(&wire, &[], true).unwrap();
        assert_eq!(status, CertificateStatus::unknown());
        assert!(!status.is_good(now_utc()));
    }

    #[test]
    fn test_mismatched_plain_fields_rejected() {
        let (anchor, factory) = factory();
        let status = factory.create_status(11, CertStatus::Valid, None).unwrap();
        let mut wire = to_wire(11, &status).unwrap();

        // Lie about the serial
        wire.serial = 12;
        assert!(verify_wire_status(&wire, &[anchor.clone()], false).is_err());

        // Lie about the lifecycle state
        let mut wire = to_wire(11, &status).unwrap();
        wire.status = CertStatus::Revoked.index();
        wire.state = "REVOKED".to_string();
        assert!(verify_wire_status(&wire, &[anchor.clone()], false).is_err());

        // Lie about the dates
        let mut wire = to_wire(11, &status).unwrap();
        wire.ocsp_certified_until = format_cert_time(now_utc() + 86400).unwrap();
        assert!(verify_wire_status(&wire, &[anchor], false).is_err());
    }

    #[test]
    fn test_corrupted_token_rejected() {
        let (anchor, factory) = factory();
        let status = factory.create_status(12, CertStatus::Valid, None).unwrap();
        let mut wire = to_wire(12, &status).unwrap();

        let mid = wire.ocsp_response.len() / 2;
        wire.ocsp_response[mid] ^= 0x01;
        let err = verify_wire_status(&wire, &[anchor], false).unwrap_err();
        assert!(matches!(
            err,
            PkiError::MalformedToken(_) | PkiError::UnverifiedSigner(_)
        ));
    }
}
