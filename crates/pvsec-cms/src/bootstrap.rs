//! CMS bootstrap
//!
//! On first start the CMS establishes its own trust material: a self-signed
//! root CA and a server certificate for the service itself.  Both live in
//! PEM keychain containers (private key first, then the certificate and its
//! chain) so any agent that can read the container can load key, certificate
//! and chain in one step.

use std::{fs, path::Path, sync::Arc};

use pvsec_key::KeyPair;
use pvsec_pki::{
    build_self_signed_ca, now_utc, CertCreationRequest, CertSubject, Certificate,
};

use crate::{
    error::{CmsError, Result},
    service::Cms,
    settings::Settings,
};

/// Ten years, the default lifetime of a bootstrapped root certificate
const CA_VALIDITY_SECS: i64 = 10 * 365 * 24 * 3600;
/// One year for the CMS's own server certificate
const CMS_CERT_VALIDITY_SECS: i64 = 365 * 24 * 3600;

/// A loaded keychain container: private key, certificate, issuer chain
pub struct Keychain {
    pub key: Arc<KeyPair>,
    pub cert: Certificate,
    pub chain: Vec<Certificate>,
}

/// Load a PEM keychain container
pub fn load_keychain<P: AsRef<Path>>(path: P) -> Result<Keychain> {
    let text = fs::read_to_string(&path)?;
    let blocks = pem::parse_many(&text).map_err(|e| {
        CmsError::MalformedRequest(format!(
            "keychain {} is not valid PEM: {e}",
            path.as_ref().display()
        ))
    })?;

    let mut key = None;
    let mut certs = Vec::new();
    for block in blocks {
        match block.tag() {
            "PRIVATE KEY" => {
                key = Some(KeyPair::from_pkcs8_der(block.contents())?);
            }
            "CERTIFICATE" => {
                certs.push(Certificate::from_der(block.contents())?);
            }
            other => {
                tracing::debug!(tag = other, "ignoring PEM block in keychain");
            }
        }
    }

    let key = key.ok_or_else(|| {
        CmsError::MalformedRequest(format!(
            "keychain {} has no private key",
            path.as_ref().display()
        ))
    })?;
    if certs.is_empty() {
        return Err(CmsError::MalformedRequest(format!(
            "keychain {} has no certificate",
            path.as_ref().display()
        )));
    }
    let cert = certs.remove(0);
    Ok(Keychain {
        key: Arc::new(key),
        cert,
        chain: certs,
    })
}

/// Write a PEM keychain container
pub fn save_keychain<P: AsRef<Path>>(
    path: P,
    key: &KeyPair,
    cert: &Certificate,
    chain: &[Certificate],
) -> Result<()> {
    let mut out = key.to_pkcs8_pem()?;
    out.push_str(&cert.to_pem()?);
    for link in chain {
        out.push_str(&link.to_pem()?);
    }
    fs::write(path, out)?;
    Ok(())
}

/// Load the CA keychain, creating a fresh self-signed root when none exists
pub fn get_or_create_ca(settings: &Settings) -> Result<Keychain> {
    let path = Path::new(&settings.ca_keychain);
    if path.exists() {
        let keychain = load_keychain(path)?;
        tracing::info!(
            issuer_id = %keychain.cert.issuer_id()?,
            "loaded CA keychain"
        );
        return Ok(keychain);
    }

    let key = KeyPair::generate()?;
    let subject = CertSubject {
        common_name: settings.ca_name.clone(),
        organization: settings.ca_organization.clone(),
        organization_unit: settings.ca_organizational_unit.clone(),
        country: settings.ca_country.clone(),
    };
    let now = now_utc();
    let cert = build_self_signed_ca(subject, &key, now, now + CA_VALIDITY_SECS)?;
    save_keychain(path, &key, &cert, &[])?;
    tracing::info!(
        cn = %settings.ca_name,
        issuer_id = %cert.issuer_id()?,
        "created new root CA"
    );
    Ok(Keychain {
        key: Arc::new(key),
        cert,
        chain: Vec::new(),
    })
}

/// Make sure the CMS has its own server certificate, issuing one through the
/// normal CREATE path when the keychain is missing.
pub fn ensure_cms_certificate(settings: &Settings, cms: &Cms) -> Result<Keychain> {
    let path = Path::new(&settings.cms_keychain);
    if path.exists() {
        let keychain = load_keychain(path)?;
        tracing::info!("loaded CMS server keychain");
        return Ok(keychain);
    }

    let key = KeyPair::generate()?;
    let now = now_utc();
    let ccr = CertCreationRequest {
        name: settings.cms_name.clone(),
        country: settings.cms_country.clone(),
        organization: settings.cms_organization.clone(),
        organization_unit: settings.cms_organizational_unit.clone(),
        not_before: now,
        not_after: now + CMS_CERT_VALIDITY_SECS,
        usage: "server".to_string(),
        pub_key: key.spki_der()?,
        auth_type: "local".to_string(),
        verifier: Default::default(),
    };
    let response = cms.on_create(&ccr, None)?;

    // The response PEM carries the new certificate followed by the chain
    let blocks = pem::parse_many(&response.pem)
        .map_err(|e| CmsError::MalformedRequest(format!("bad issuance PEM: {e}")))?;
    let mut certs = blocks
        .iter()
        .filter(|b| b.tag() == "CERTIFICATE")
        .map(|b| Certificate::from_der(b.contents()))
        .collect::<pvsec_pki::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(CmsError::MalformedRequest(
            "issuance returned no certificate".to_string(),
        ));
    }
    let cert = certs.remove(0);

    save_keychain(path, &key, &cert, &certs)?;
    tracing::info!(cert_id = %response.cert_id, "created CMS server certificate");
    Ok(Keychain {
        key: Arc::new(key),
        cert,
        chain: certs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_keychain_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.keychain.pem");

        let key = KeyPair::generate().unwrap();
        let now = now_utc();
        let cert = build_self_signed_ca(
            CertSubject::new("EPICS Root CA"),
            &key,
            now,
            now + 3600,
        )
        .unwrap();

        save_keychain(&path, &key, &cert, &[]).unwrap();
        let loaded = load_keychain(&path).unwrap();
        assert_eq!(loaded.key.public_key_bytes(), key.public_key_bytes());
        assert_eq!(loaded.cert.to_der().unwrap(), cert.to_der().unwrap());
        assert!(loaded.chain.is_empty());
    }

    #[test]
    fn test_get_or_create_ca_is_stable() {
        let dir = tempdir().unwrap();
        let mut settings = Settings::default();
        settings.ca_keychain = dir
            .path()
            .join("ca.keychain.pem")
            .to_string_lossy()
            .into_owned();

        let first = get_or_create_ca(&settings).unwrap();
        let second = get_or_create_ca(&settings).unwrap();
        assert_eq!(
            first.cert.to_der().unwrap(),
            second.cert.to_der().unwrap()
        );
    }

    #[test]
    fn test_load_keychain_requires_key_and_cert() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.pem");

        let key = KeyPair::generate().unwrap();
        fs::write(&path, key.to_pkcs8_pem().unwrap()).unwrap();
        assert!(load_keychain(&path).is_err());
    }
}
