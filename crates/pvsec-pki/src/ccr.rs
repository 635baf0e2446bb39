//! Certificate creation requests
//!
//! The CCR is the transient wire object submitted to the CMS CREATE
//! endpoint.  Only the public half of the requester's key pair travels in it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
    cert::CertSubject,
    cert::factory::CertUsage,
    error::PkiError,
    Result,
};

/// Authentication method names understood by the CREATE admission control
pub const AUTH_TYPE_X509: &str = "x509";
pub const AUTH_TYPE_BASIC: &str = "basic";

/// The identity a transport attaches to an authenticated peer.
///
/// For TLS-authenticated peers `method` is `"x509"` and `name` carries the
/// certificate CN; authentication backends fill the same shape from their own
/// sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCredentials {
    pub method: String,
    pub name: String,
    pub organization: String,
}

impl PeerCredentials {
    pub fn x509(name: impl Into<String>, organization: impl Into<String>) -> Self {
        Self {
            method: AUTH_TYPE_X509.to_string(),
            name: name.into(),
            organization: organization.into(),
        }
    }
}

/// Certificate Creation Request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertCreationRequest {
    pub name: String,
    pub country: String,
    pub organization: String,
    pub organization_unit: String,
    /// Validity start, unix seconds UTC
    pub not_before: i64,
    /// Validity end, unix seconds UTC
    pub not_after: i64,
    /// Requested role: client, server, gateway or ca
    pub usage: String,
    /// Requester public key, SubjectPublicKeyInfo DER
    pub pub_key: Vec<u8>,
    /// Authentication method that produced the request
    pub auth_type: String,
    /// Method-specific verification material
    #[serde(default)]
    pub verifier: HashMap<String, String>,
}

impl CertCreationRequest {
    /// Check structural validity.  Every failure maps to the stable
    /// `MalformedRequest` code on the RPC surface.
    pub fn validate(&self) -> Result<CertUsage> {
        if self.name.is_empty() {
            return Err(PkiError::MalformedRequest("name must not be empty".into()));
        }
        if self.pub_key.is_empty() {
            return Err(PkiError::MalformedRequest("pub_key must not be empty".into()));
        }
        if self.not_before > self.not_after {
            return Err(PkiError::MalformedRequest(
                "not_before must not be after not_after".into(),
            ));
        }
        if self.auth_type.is_empty() {
            return Err(PkiError::MalformedRequest("auth_type must not be empty".into()));
        }
        CertUsage::parse(&self.usage)
    }

    /// Subject 4-tuple recorded for the certificate
    pub fn subject(&self) -> CertSubject {
        CertSubject {
            common_name: self.name.clone(),
            organization: self.organization.clone(),
            organization_unit: self.organization_unit.clone(),
            country: self.country.clone(),
        }
    }

    /// Subject Key Identifier of the requested key
    pub fn subject_key_id(&self) -> [u8; 20] {
        pvsec_key::ski_from_spki(&self.pub_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvsec_key::KeyPair;

    fn request() -> CertCreationRequest {
        let key = KeyPair::generate().unwrap();
        CertCreationRequest {
            name: "alice".to_string(),
            country: "US".to_string(),
            organization: "ornl.gov".to_string(),
            organization_unit: String::new(),
            not_before: 1_700_000_000,
            not_after: 1_700_003_600,
            usage: "client".to_string(),
            pub_key: key.spki_der().unwrap(),
            auth_type: AUTH_TYPE_X509.to_string(),
            verifier: HashMap::new(),
        }
    }

    #[test]
    fn test_valid_request() {
        assert_eq!(request().validate().unwrap(), CertUsage::Client);
    }

    #[test]
    fn test_rejects_empty_name() {
        let mut ccr = request();
        ccr.name.clear();
        assert!(matches!(
            ccr.validate(),
            Err(PkiError::MalformedRequest(_))
        ));
    }

    #[test]
    fn test_rejects_inverted_validity() {
        let mut ccr = request();
        ccr.not_before = ccr.not_after + 1;
        assert!(ccr.validate().is_err());
    }

    #[test]
    fn test_rejects_unknown_usage() {
        let mut ccr = request();
        ccr.usage = "superuser".to_string();
        assert!(ccr.validate().is_err());
    }

    #[test]
    fn test_skid_tracks_key() {
        let ccr = request();
        assert_eq!(
            ccr.subject_key_id(),
            pvsec_key::ski_from_spki(&ccr.pub_key)
        );
    }
}
