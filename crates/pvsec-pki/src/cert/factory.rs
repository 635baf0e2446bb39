//! Certificate factory
//!
//! Turns a validated creation request into a signed X.509 certificate.  End
//! entity certificates carry the two custom status extensions so relying
//! parties can locate and monitor the certificate's status PV; the CA
//! bootstrap path produces the self-signed trust anchor.

use std::time::{Duration, UNIX_EPOCH};

use der::{
    asn1::{ObjectIdentifier, OctetString},
    Decode, Encode,
};
use pkcs8::spki::{AlgorithmIdentifierOwned, SubjectPublicKeyInfoOwned};
use pvsec_key::KeyPair;
use x509_cert::{
    certificate::{Certificate as X509CertificateInner, TbsCertificate, Version},
    ext::{
        pkix::{AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, KeyUsages},
        Extension, Extensions,
    },
    serial_number::SerialNumber,
    time::{Time, Validity},
};

use super::{build_dn, CertSubject, Certificate, STATUS_PV_EXT_OID, STATUS_SUBSCRIPTION_EXT_OID};
use crate::{
    error::PkiError,
    types::CertId,
    Result,
};

/// Intended role of a requested certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertUsage {
    Client,
    Server,
    Gateway,
    Ca,
}

impl CertUsage {
    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "client" => CertUsage::Client,
            "server" => CertUsage::Server,
            "gateway" => CertUsage::Gateway,
            "ca" => CertUsage::Ca,
            other => {
                return Err(PkiError::MalformedRequest(format!(
                    "unknown certificate usage {other:?}"
                )))
            }
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CertUsage::Client => "client",
            CertUsage::Server => "server",
            CertUsage::Gateway => "gateway",
            CertUsage::Ca => "ca",
        }
    }
}

/// Builder for one signed certificate
pub struct CertFactory<'a> {
    pub serial: u64,
    pub subject: CertSubject,
    pub spki_der: Vec<u8>,
    pub not_before: i64,
    pub not_after: i64,
    pub usage: CertUsage,
    pub subscription_required: bool,
    issuer: Option<Issuer<'a>>,
}

struct Issuer<'a> {
    cert: &'a Certificate,
    key: &'a KeyPair,
    chain: &'a [Certificate],
}

impl<'a> CertFactory<'a> {
    pub fn new(
        serial: u64,
        subject: CertSubject,
        spki_der: Vec<u8>,
        not_before: i64,
        not_after: i64,
        usage: CertUsage,
        subscription_required: bool,
    ) -> Self {
        Self {
            serial,
            subject,
            spki_der,
            not_before,
            not_after,
            usage,
            subscription_required,
            issuer: None,
        }
    }

    /// Set the signing authority.  Required for end-entity builds.
    pub fn with_issuer(
        mut self,
        cert: &'a Certificate,
        key: &'a KeyPair,
        chain: &'a [Certificate],
    ) -> Self {
        self.issuer = Some(Issuer { cert, key, chain });
        self
    }

    /// Build an end-entity certificate and return it with its issuer chain
    /// (issuer certificate first).
    pub fn build_end_entity(&self) -> Result<(Certificate, Vec<Certificate>)> {
        let issuer = self.issuer.as_ref().ok_or_else(|| {
            PkiError::CertError("end entity certificate requires an issuer".to_string())
        })?;
        if self.usage == CertUsage::Ca {
            return Err(PkiError::CertError(
                "CA usage not permitted for end entity certificates".to_string(),
            ));
        }
        if self.not_before > self.not_after {
            return Err(PkiError::MalformedRequest(
                "not_before must not be after not_after".to_string(),
            ));
        }

        let issuer_id = issuer.cert.issuer_id()?;
        let status_pv = CertId::new(issuer_id, self.serial).status_pv();
        let issuer_ski = issuer.cert.subject_key_id()?;

        let cert = self.build_signed(
            issuer.cert.inner().tbs_certificate.subject.clone(),
            issuer.key,
            Some(issuer_ski),
            Some(status_pv),
        )?;

        let mut chain = Vec::with_capacity(issuer.chain.len() + 1);
        chain.push(issuer.cert.clone());
        chain.extend(issuer.chain.iter().cloned());
        Ok((cert, chain))
    }

    fn build_signed(
        &self,
        issuer_name: x509_cert::name::Name,
        signing_key: &KeyPair,
        issuer_ski: Option<Vec<u8>>,
        status_pv: Option<String>,
    ) -> Result<Certificate> {
        let serial_number = SerialNumber::new(&serial_der_bytes(self.serial))
            .map_err(|e| PkiError::CertError(format!("Failed to create serial number: {e}")))?;

        let subject_name = build_dn(&self.subject)?;
        let public_key_info = SubjectPublicKeyInfoOwned::from_der(&self.spki_der)
            .map_err(|e| PkiError::MalformedRequest(format!("Failed to parse SPKI: {e}")))?;
        if public_key_info.algorithm.oid != const_oid::db::rfc8410::ID_ED_25519 {
            return Err(PkiError::MalformedRequest(
                "Only Ed25519 public keys are supported".to_string(),
            ));
        }

        let validity = Validity {
            not_before: unix_to_time(self.not_before)?,
            not_after: unix_to_time(self.not_after)?,
        };

        let mut extensions = Vec::new();

        // 1. Basic constraints
        let basic_constraints = BasicConstraints {
            ca: self.usage == CertUsage::Ca,
            path_len_constraint: None,
        };
        extensions.push(encode_extension(
            const_oid::db::rfc5280::ID_CE_BASIC_CONSTRAINTS,
            true,
            &basic_constraints
                .to_der()
                .map_err(|e| PkiError::CertError(format!("Failed to encode constraints: {e}")))?,
        )?);

        // 2. Key usage derived from the requested role
        let mut flags: der::flagset::FlagSet<KeyUsages> = KeyUsages::DigitalSignature.into();
        match self.usage {
            CertUsage::Client => {}
            CertUsage::Server | CertUsage::Gateway => {
                flags = flags | KeyUsages::KeyEncipherment;
            }
            CertUsage::Ca => {
                flags = flags | KeyUsages::KeyCertSign | KeyUsages::CRLSign;
            }
        }
        extensions.push(encode_extension(
            const_oid::db::rfc5280::ID_CE_KEY_USAGE,
            true,
            &KeyUsage(flags)
                .to_der()
                .map_err(|e| PkiError::CertError(format!("Failed to encode key usage: {e}")))?,
        )?);

        // 3. Extended key usage (end entity roles only)
        let eku_oids = match self.usage {
            CertUsage::Client => vec![const_oid::db::rfc5280::ID_KP_CLIENT_AUTH],
            CertUsage::Server => vec![const_oid::db::rfc5280::ID_KP_SERVER_AUTH],
            CertUsage::Gateway => vec![
                const_oid::db::rfc5280::ID_KP_CLIENT_AUTH,
                const_oid::db::rfc5280::ID_KP_SERVER_AUTH,
            ],
            CertUsage::Ca => vec![],
        };
        if !eku_oids.is_empty() {
            extensions.push(encode_extension(
                const_oid::db::rfc5280::ID_CE_EXT_KEY_USAGE,
                false,
                &ExtendedKeyUsage(eku_oids)
                    .to_der()
                    .map_err(|e| PkiError::CertError(format!("Failed to encode EKU: {e}")))?,
            )?);
        }

        // 4. Subject key identifier, SHA-1 over the SPKI DER
        let ski = pvsec_key::ski_from_spki(&self.spki_der).to_vec();
        extensions.push(encode_extension(
            const_oid::db::rfc5280::ID_CE_SUBJECT_KEY_IDENTIFIER,
            false,
            &ski,
        )?);

        // 5. Authority key identifier (own SKI when self-signed)
        let aki_ski = issuer_ski.unwrap_or_else(|| ski.clone());
        let aki = AuthorityKeyIdentifier {
            key_identifier: Some(OctetString::new(aki_ski).map_err(|e| {
                PkiError::CertError(format!("Failed to create AKI identifier: {e}"))
            })?),
            authority_cert_issuer: None,
            authority_cert_serial_number: None,
        };
        extensions.push(encode_extension(
            const_oid::db::rfc5280::ID_CE_AUTHORITY_KEY_IDENTIFIER,
            false,
            &aki.to_der()
                .map_err(|e| PkiError::CertError(format!("Failed to encode AKI: {e}")))?,
        )?);

        // 6. Status PV name and subscription flag
        if let Some(pv_name) = status_pv {
            extensions.push(encode_extension(
                STATUS_PV_EXT_OID,
                false,
                pv_name.as_bytes(),
            )?);
            extensions.push(encode_extension(
                STATUS_SUBSCRIPTION_EXT_OID,
                false,
                &[if self.subscription_required { 0xff } else { 0x00 }],
            )?);
        }

        let tbs_certificate = TbsCertificate {
            version: Version::V3,
            serial_number,
            signature: AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc8410::ID_ED_25519,
                parameters: None,
            },
            issuer: issuer_name,
            validity,
            subject: subject_name,
            subject_public_key_info: public_key_info,
            issuer_unique_id: None,
            subject_unique_id: None,
            extensions: Some(Extensions::from(extensions)),
        };

        let tbs_der = tbs_certificate
            .to_der()
            .map_err(|e| PkiError::CertError(format!("Failed to encode TbsCertificate: {e}")))?;
        let signature_bytes = signing_key.sign(&tbs_der);

        let certificate = X509CertificateInner {
            tbs_certificate,
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: const_oid::db::rfc8410::ID_ED_25519,
                parameters: None,
            },
            signature: der::asn1::BitString::from_bytes(&signature_bytes)
                .map_err(|e| PkiError::CertError(format!("Failed to wrap signature: {e}")))?,
        };

        Ok(Certificate::from_inner(certificate))
    }
}

/// Create the self-signed CA certificate used during CMS bootstrap
pub fn build_self_signed_ca(
    subject: CertSubject,
    key: &KeyPair,
    not_before: i64,
    not_after: i64,
) -> Result<Certificate> {
    let factory = CertFactory::new(
        generate_serial()?,
        subject.clone(),
        key.spki_der()?,
        not_before,
        not_after,
        CertUsage::Ca,
        false,
    );
    let issuer_name = build_dn(&subject)?;
    factory.build_signed(issuer_name, key, None, None)
}

/// Random serial number, unique per issuer.
///
/// Kept within the positive i64 range so the persistence layer stores it
/// without transformation.
pub fn generate_serial() -> Result<u64> {
    let mut bytes = [0u8; 8];
    getrandom::fill(&mut bytes)
        .map_err(|e| PkiError::CertError(format!("Failed to generate serial: {e}")))?;
    Ok(u64::from_be_bytes(bytes) >> 1)
}

/// PEM string containing the certificate followed by its issuer chain
pub fn cert_and_chain_to_pem(cert: &Certificate, chain: &[Certificate]) -> Result<String> {
    let mut out = cert.to_pem()?;
    for link in chain {
        out.push_str(&link.to_pem()?);
    }
    Ok(out)
}

/// Minimal big-endian encoding of a serial, padded so the DER INTEGER stays
/// non-negative
fn serial_der_bytes(serial: u64) -> Vec<u8> {
    let bytes = serial.to_be_bytes();
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(7);
    let mut out = Vec::with_capacity(9);
    if bytes[start] & 0x80 != 0 {
        out.push(0x00);
    }
    out.extend_from_slice(&bytes[start..]);
    out
}

fn encode_extension(extn_id: ObjectIdentifier, critical: bool, value: &[u8]) -> Result<Extension> {
    Ok(Extension {
        extn_id,
        critical,
        extn_value: OctetString::new(value.to_vec())
            .map_err(|e| PkiError::CertError(format!("Failed to wrap extension value: {e}")))?,
    })
}

fn unix_to_time(t: i64) -> Result<Time> {
    let st = if t >= 0 {
        UNIX_EPOCH + Duration::from_secs(t as u64)
    } else {
        return Err(PkiError::MalformedRequest(format!(
            "timestamp {t} before epoch"
        )));
    };
    Time::try_from(st).map_err(|e| PkiError::CertError(format!("Failed to encode time: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_utc;

    fn test_ca() -> (KeyPair, Certificate) {
        let key = KeyPair::generate().unwrap();
        let subject = CertSubject {
            common_name: "EPICS Root CA".to_string(),
            organization: "ca.epics.org".to_string(),
            organization_unit: "EPICS Certificate Authority".to_string(),
            country: "US".to_string(),
        };
        let now = now_utc();
        let cert = build_self_signed_ca(subject, &key, now, now + 3600 * 24 * 365).unwrap();
        (key, cert)
    }

    fn end_entity(
        ca_key: &KeyPair,
        ca_cert: &Certificate,
        serial: u64,
        usage: CertUsage,
    ) -> (KeyPair, Certificate, Vec<Certificate>) {
        let key = KeyPair::generate().unwrap();
        let now = now_utc();
        let factory = CertFactory::new(
            serial,
            CertSubject::new("alice"),
            key.spki_der().unwrap(),
            now,
            now + 3600,
            usage,
            true,
        )
        .with_issuer(ca_cert, ca_key, &[]);
        let (cert, chain) = factory.build_end_entity().unwrap();
        (key, cert, chain)
    }

    #[test]
    fn test_self_signed_ca() {
        let (_key, cert) = test_ca();
        assert!(cert.is_ca());
        assert!(cert.is_self_signed());
        cert.verify_self_signed().unwrap();
        assert!(!cert.has_status_extension());
        assert_eq!(cert.issuer_id().unwrap().len(), 8);
    }

    #[test]
    fn test_end_entity_status_pv_invariant() {
        let (ca_key, ca_cert) = test_ca();
        let serial = generate_serial().unwrap();
        let (_key, cert, chain) = end_entity(&ca_key, &ca_cert, serial, CertUsage::Client);

        let expected = format!(
            "CERT:STATUS:{}:{:016x}",
            ca_cert.issuer_id().unwrap(),
            serial
        );
        assert_eq!(cert.status_pv_name().unwrap(), expected);
        assert!(cert.status_subscription_required());
        assert_eq!(cert.serial(), serial);
        assert_eq!(chain.len(), 1);
        cert.verify_signed_by(&ca_cert).unwrap();
    }

    #[test]
    fn test_key_usage_gate() {
        let (ca_key, ca_cert) = test_ca();
        let (_k, client, _) = end_entity(&ca_key, &ca_cert, 1, CertUsage::Client);
        let (_k, server, _) = end_entity(&ca_key, &ca_cert, 2, CertUsage::Server);
        let (_k, gateway, _) = end_entity(&ca_key, &ca_cert, 3, CertUsage::Gateway);

        client.key_usage_ok(true).unwrap();
        assert!(client.key_usage_ok(false).is_err());
        server.key_usage_ok(false).unwrap();
        assert!(server.key_usage_ok(true).is_err());
        gateway.key_usage_ok(true).unwrap();
        gateway.key_usage_ok(false).unwrap();

        // CA cert presented as end entity is always rejected
        assert!(matches!(
            ca_cert.key_usage_ok(true),
            Err(PkiError::KeyUsageMismatch(_))
        ));
    }

    #[test]
    fn test_end_entity_requires_issuer() {
        let key = KeyPair::generate().unwrap();
        let now = now_utc();
        let factory = CertFactory::new(
            1,
            CertSubject::new("orphan"),
            key.spki_der().unwrap(),
            now,
            now + 10,
            CertUsage::Client,
            false,
        );
        assert!(factory.build_end_entity().is_err());
    }

    #[test]
    fn test_validity_window_ordering() {
        let (ca_key, ca_cert) = test_ca();
        let key = KeyPair::generate().unwrap();
        let now = now_utc();
        let factory = CertFactory::new(
            1,
            CertSubject::new("backwards"),
            key.spki_der().unwrap(),
            now + 100,
            now,
            CertUsage::Client,
            false,
        )
        .with_issuer(&ca_cert, &ca_key, &[]);
        assert!(factory.build_end_entity().is_err());
    }

    #[test]
    fn test_serial_der_bytes() {
        assert_eq!(serial_der_bytes(0), vec![0x00]);
        assert_eq!(serial_der_bytes(1), vec![0x01]);
        assert_eq!(serial_der_bytes(0x80), vec![0x00, 0x80]);
        assert_eq!(serial_der_bytes(0x1ff), vec![0x01, 0xff]);
    }

    #[test]
    fn test_small_and_large_serials_roundtrip() {
        let (ca_key, ca_cert) = test_ca();
        for serial in [1u64, 0x80, 0xffff, u64::MAX >> 1] {
            let (_k, cert, _) = end_entity(&ca_key, &ca_cert, serial, CertUsage::Client);
            assert_eq!(cert.serial(), serial);
        }
    }

    #[test]
    fn test_pem_roundtrip_with_chain() {
        let (ca_key, ca_cert) = test_ca();
        let (_k, cert, chain) = end_entity(&ca_key, &ca_cert, 42, CertUsage::Server);
        let pem = cert_and_chain_to_pem(&cert, &chain).unwrap();
        assert_eq!(pem.matches("BEGIN CERTIFICATE").count(), 2);
        let reparsed = Certificate::from_pem(&pem).unwrap();
        assert_eq!(reparsed.to_der().unwrap(), cert.to_der().unwrap());
    }
}
