//! X.509 certificate handling
//!
//! Wraps the DER-level certificate with the operations the certificate plane
//! needs: subject access, Subject Key Identifier and issuer-id derivation,
//! the two custom status extensions, and the key-usage pre-flight gate used
//! during TLS context setup.

pub mod factory;

use std::str::FromStr;

use der::{
    asn1::{ObjectIdentifier, PrintableStringRef, SetOfVec, Utf8StringRef},
    Decode, Encode,
};
use serde::{Deserialize, Serialize};
use x509_cert::{
    attr::AttributeTypeAndValue,
    certificate::Certificate as X509CertificateInner,
    ext::{
        pkix::{BasicConstraints, ExtendedKeyUsage},
        Extension,
    },
    name::{Name, RdnSequence, RelativeDistinguishedName},
};

use crate::{
    error::PkiError,
    types::{CertId, CERT_STATUS_ROOT},
    Result,
};

/// Custom extension: UTF-8 status PV name of this certificate
pub const STATUS_PV_EXT_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.37427.1.1");
/// Custom extension: one-byte boolean, status subscription required
pub const STATUS_SUBSCRIPTION_EXT_OID: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.3.6.1.4.1.37427.1.2");

/// The subject 4-tuple recorded for every issued certificate.
///
/// Empty strings stand for absent attributes; the duplicate check in the
/// store compares all four fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertSubject {
    pub common_name: String,
    pub organization: String,
    pub organization_unit: String,
    pub country: String,
}

impl CertSubject {
    pub fn new(common_name: impl Into<String>) -> Self {
        Self {
            common_name: common_name.into(),
            organization: String::new(),
            organization_unit: String::new(),
            country: String::new(),
        }
    }
}

/// An X.509 certificate
#[derive(Debug, Clone)]
pub struct Certificate {
    inner: X509CertificateInner,
}

impl Certificate {
    /// Parse from PEM
    pub fn from_pem(pem: &str) -> Result<Self> {
        let der = pem::parse(pem)
            .map_err(|e| PkiError::CertError(format!("Failed to parse PEM: {e}")))?;
        if der.tag() != "CERTIFICATE" {
            return Err(PkiError::CertError(
                "Invalid PEM tag, expected CERTIFICATE".to_string(),
            ));
        }
        Self::from_der(der.contents())
    }

    /// Parse from DER
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let inner = X509CertificateInner::from_der(der)
            .map_err(|e| PkiError::CertError(format!("Failed to parse DER: {e}")))?;
        Ok(Self { inner })
    }

    /// Encode to PEM
    pub fn to_pem(&self) -> Result<String> {
        let der = self.to_der()?;
        Ok(pem::encode(&pem::Pem::new("CERTIFICATE", der)))
    }

    /// Encode to DER
    pub fn to_der(&self) -> Result<Vec<u8>> {
        self.inner
            .to_der()
            .map_err(|e| PkiError::CertError(format!("Failed to encode DER: {e}")))
    }

    pub(crate) fn from_inner(inner: X509CertificateInner) -> Self {
        Self { inner }
    }

    pub(crate) fn inner(&self) -> &X509CertificateInner {
        &self.inner
    }

    /// Subject 4-tuple
    pub fn subject(&self) -> Result<CertSubject> {
        parse_dn(&self.inner.tbs_certificate.subject)
    }

    /// Issuer 4-tuple
    pub fn issuer(&self) -> Result<CertSubject> {
        parse_dn(&self.inner.tbs_certificate.issuer)
    }

    /// Serial number as u64 (the low 8 bytes of the DER integer)
    pub fn serial(&self) -> u64 {
        let bytes = self.inner.tbs_certificate.serial_number.as_bytes();
        let tail = if bytes.len() > 8 {
            &bytes[bytes.len() - 8..]
        } else {
            bytes
        };
        tail.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
    }

    /// Validity start, unix seconds
    pub fn not_before(&self) -> i64 {
        time_to_unix(&self.inner.tbs_certificate.validity.not_before)
    }

    /// Validity end, unix seconds
    pub fn not_after(&self) -> i64 {
        time_to_unix(&self.inner.tbs_certificate.validity.not_after)
    }

    /// Whether the validity window covers the given time
    pub fn is_valid_at(&self, t: i64) -> bool {
        self.not_before() <= t && t <= self.not_after()
    }

    /// SubjectPublicKeyInfo DER
    pub fn spki_der(&self) -> Result<Vec<u8>> {
        self.inner
            .tbs_certificate
            .subject_public_key_info
            .to_der()
            .map_err(|e| PkiError::CertError(format!("Failed to encode SPKI: {e}")))
    }

    /// Raw Ed25519 public key bytes
    pub fn public_key_bytes(&self) -> Result<[u8; 32]> {
        let spki = &self.inner.tbs_certificate.subject_public_key_info;
        if spki.algorithm.oid != const_oid::db::rfc8410::ID_ED_25519 {
            return Err(PkiError::CertError("Not an Ed25519 public key".to_string()));
        }
        let key_bytes = spki.subject_public_key.raw_bytes();
        key_bytes
            .try_into()
            .map_err(|_| PkiError::CertError(format!("Invalid key length {}", key_bytes.len())))
    }

    /// Look up an extension by OID
    pub fn extension(&self, oid: &ObjectIdentifier) -> Option<&Extension> {
        self.inner
            .tbs_certificate
            .extensions
            .as_ref()
            .and_then(|exts| exts.iter().find(|e| &e.extn_id == oid))
    }

    /// Subject Key Identifier from the extension, or computed from the SPKI
    /// when the extension is absent
    pub fn subject_key_id(&self) -> Result<Vec<u8>> {
        if let Some(ext) = self.extension(&const_oid::db::rfc5280::ID_CE_SUBJECT_KEY_IDENTIFIER) {
            return Ok(ext.extn_value.as_bytes().to_vec());
        }
        Ok(pvsec_key::ski_from_spki(&self.spki_der()?).to_vec())
    }

    /// Issuer-id namespace this certificate defines when acting as issuer:
    /// first 8 lowercase hex chars of its Subject Key Identifier extension
    pub fn issuer_id(&self) -> Result<String> {
        issuer_id_from(self)
    }

    /// The status PV name embedded in the custom extension
    pub fn status_pv_name(&self) -> Result<String> {
        let ext = self.extension(&STATUS_PV_EXT_OID).ok_or_else(|| {
            PkiError::MissingExtension("status PV name extension not present".to_string())
        })?;
        let name = String::from_utf8(ext.extn_value.as_bytes().to_vec())
            .map_err(|e| PkiError::CertError(format!("status PV extension not UTF-8: {e}")))?;
        if !name.starts_with(CERT_STATUS_ROOT) {
            return Err(PkiError::CertError(format!(
                "status PV extension carries unexpected name {name:?}"
            )));
        }
        Ok(name)
    }

    /// Whether the peer must subscribe to this certificate's status PV
    pub fn status_subscription_required(&self) -> bool {
        self.extension(&STATUS_SUBSCRIPTION_EXT_OID)
            .map(|ext| ext.extn_value.as_bytes().first() == Some(&0xff))
            .unwrap_or(false)
    }

    /// Whether any status monitoring extension is present at all
    pub fn has_status_extension(&self) -> bool {
        self.extension(&STATUS_PV_EXT_OID).is_some()
    }

    /// The certificate id derived from the embedded status PV name
    pub fn cert_id(&self) -> Result<CertId> {
        CertId::from_status_pv(&self.status_pv_name()?)
    }

    /// BasicConstraints CA flag
    pub fn is_ca(&self) -> bool {
        self.extension(&const_oid::db::rfc5280::ID_CE_BASIC_CONSTRAINTS)
            .and_then(|ext| BasicConstraints::from_der(ext.extn_value.as_bytes()).ok())
            .map(|bc| bc.ca)
            .unwrap_or(false)
    }

    fn has_eku(&self, purpose: &ObjectIdentifier) -> bool {
        self.extension(&const_oid::db::rfc5280::ID_CE_EXT_KEY_USAGE)
            .and_then(|ext| ExtendedKeyUsage::from_der(ext.extn_value.as_bytes()).ok())
            .map(|eku| eku.0.iter().any(|oid| oid == purpose))
            .unwrap_or(false)
    }

    /// Pre-flight gate run during TLS context setup.
    ///
    /// Rejects a CA certificate presented as an end entity, and requires the
    /// extended key usage bit matching the intended role.
    pub fn key_usage_ok(&self, expecting_client_role: bool) -> Result<()> {
        if self.is_ca() {
            return Err(PkiError::KeyUsageMismatch(
                "found CA certificate when end entity expected".to_string(),
            ));
        }
        let (purpose, role) = if expecting_client_role {
            (const_oid::db::rfc5280::ID_KP_CLIENT_AUTH, "client")
        } else {
            (const_oid::db::rfc5280::ID_KP_SERVER_AUTH, "server")
        };
        if !self.has_eku(&purpose) {
            return Err(PkiError::KeyUsageMismatch(format!(
                "extended key usage does not permit use as a Secure PVAccess {role}"
            )));
        }
        Ok(())
    }

    /// Whether issuer and subject DNs are identical
    pub fn is_self_signed(&self) -> bool {
        self.inner.tbs_certificate.subject == self.inner.tbs_certificate.issuer
    }

    /// Verify this certificate's signature against the issuer's public key
    pub fn verify_signed_by(&self, issuer: &Certificate) -> Result<()> {
        let tbs_der = self
            .inner
            .tbs_certificate
            .to_der()
            .map_err(|e| PkiError::CertError(format!("Failed to encode TBS: {e}")))?;
        let signature: [u8; 64] = self
            .inner
            .signature
            .raw_bytes()
            .try_into()
            .map_err(|_| PkiError::CertError("Invalid Ed25519 signature length".to_string()))?;
        if pvsec_key::verify(&issuer.public_key_bytes()?, &tbs_der, &signature) {
            Ok(())
        } else {
            Err(PkiError::CertError(
                "Certificate signature verification failed".to_string(),
            ))
        }
    }

    /// Verify a self-signed certificate against its own key
    pub fn verify_self_signed(&self) -> Result<()> {
        self.verify_signed_by(self)
    }
}

/// First 8 lowercase hex chars of the certificate's Subject Key Identifier
/// extension.  The extension must be present.
pub fn issuer_id_from(cert: &Certificate) -> Result<String> {
    let ext = cert
        .extension(&const_oid::db::rfc5280::ID_CE_SUBJECT_KEY_IDENTIFIER)
        .ok_or(PkiError::MissingSki)?;
    let ski = ext.extn_value.as_bytes();
    if ski.len() < 4 {
        return Err(PkiError::MissingSki);
    }
    Ok(hex::encode(&ski[..4]))
}

fn time_to_unix(t: &x509_cert::time::Time) -> i64 {
    match t {
        x509_cert::time::Time::UtcTime(t) => t.to_unix_duration().as_secs() as i64,
        x509_cert::time::Time::GeneralTime(t) => t.to_unix_duration().as_secs() as i64,
    }
}

fn attr_string(value: &der::Any) -> Option<String> {
    if let Ok(s) = Utf8StringRef::try_from(value) {
        return Some(s.as_str().to_string());
    }
    if let Ok(s) = PrintableStringRef::try_from(value) {
        return Some(s.as_str().to_string());
    }
    None
}

/// Parse a distinguished name into the subject 4-tuple
pub(crate) fn parse_dn(name: &Name) -> Result<CertSubject> {
    let cn_oid = ObjectIdentifier::from_str("2.5.4.3").expect("valid OID");
    let o_oid = ObjectIdentifier::from_str("2.5.4.10").expect("valid OID");
    let ou_oid = ObjectIdentifier::from_str("2.5.4.11").expect("valid OID");
    let c_oid = ObjectIdentifier::from_str("2.5.4.6").expect("valid OID");

    let mut subject = CertSubject::new("");
    for rdn in name.0.iter() {
        for attr in rdn.0.iter() {
            let Some(value) = attr_string(&attr.value) else {
                continue;
            };
            if attr.oid == cn_oid {
                subject.common_name = value;
            } else if attr.oid == o_oid {
                subject.organization = value;
            } else if attr.oid == ou_oid {
                subject.organization_unit = value;
            } else if attr.oid == c_oid {
                subject.country = value;
            }
        }
    }

    if subject.common_name.is_empty() {
        return Err(PkiError::CertError(
            "Distinguished name missing required CN".to_string(),
        ));
    }
    Ok(subject)
}

/// Build a distinguished name from the subject 4-tuple
pub(crate) fn build_dn(subject: &CertSubject) -> Result<Name> {
    if subject.common_name.is_empty() {
        return Err(PkiError::MalformedRequest(
            "Common Name (CN) is required".to_string(),
        ));
    }

    let mut rdns = Vec::new();
    let mut push = |oid: &str, value: &str| -> Result<()> {
        if value.is_empty() {
            return Ok(());
        }
        let oid = ObjectIdentifier::from_str(oid)
            .map_err(|e| PkiError::CertError(format!("Invalid OID: {e}")))?;
        let value = Utf8StringRef::new(value)
            .map_err(|e| PkiError::CertError(format!("Invalid DN value: {e}")))?;
        let mut set = SetOfVec::new();
        set.insert(AttributeTypeAndValue {
            oid,
            value: der::Any::from(value),
        })
        .map_err(|e| PkiError::CertError(format!("Failed to build RDN: {e}")))?;
        rdns.push(RelativeDistinguishedName(set));
        Ok(())
    };

    push("2.5.4.3", &subject.common_name)?;
    push("2.5.4.10", &subject.organization)?;
    push("2.5.4.11", &subject.organization_unit)?;
    push("2.5.4.6", &subject.country)?;

    Ok(Name::from(RdnSequence::from(rdns)))
}
