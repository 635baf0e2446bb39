//! Signed status token codec
//!
//! A status token is a self-contained proof a relying party can verify
//! offline: the claims tuple, an Ed25519 signature over the exact claim
//! bytes, and the signer's certificate chain.  The freshness window travels
//! inside the signed claims, so caches downstream can be arbitrarily lazy
//! without weakening the revocation contract.

use std::sync::Arc;

use pvsec_key::KeyPair;
use serde::{Deserialize, Serialize};

use crate::{
    cert::Certificate,
    error::PkiError,
    types::{now_utc, CertStatus, CertificateStatus, OcspStatus},
    Result,
};

/// Seconds of slack tolerated when checking the validity window
const WINDOW_SLACK_SECS: i64 = 5;

/// The signed claims tuple.  Field order is fixed; the signature covers the
/// serialized bytes of exactly this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    issuer_id: String,
    serial: u64,
    ocsp_status: u16,
    status_date: i64,
    valid_until: i64,
    revocation_date: Option<i64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TokenEnvelope {
    claims: TokenClaims,
    /// hex-encoded Ed25519 signature over the claim bytes
    signature: String,
    /// signer chain as PEM, leaf (the signing issuer) first
    signer_chain: Vec<String>,
}

/// A verified parse of a status token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedStatus {
    pub issuer_id: String,
    pub serial: u64,
    pub ocsp_status: OcspStatus,
    pub status_date: i64,
    pub valid_until: i64,
    pub revocation_date: Option<i64>,
}

/// Produce a signed status token
pub fn encode(
    issuer_id: &str,
    serial: u64,
    ocsp_status: OcspStatus,
    status_date: i64,
    valid_until: i64,
    revocation_date: Option<i64>,
    issuer_key: &KeyPair,
    issuer_cert: &Certificate,
    issuer_chain: &[Certificate],
) -> Result<Vec<u8>> {
    let claims = TokenClaims {
        issuer_id: issuer_id.to_string(),
        serial,
        ocsp_status: ocsp_status.index(),
        status_date,
        valid_until,
        revocation_date,
    };
    let claim_bytes = serde_json::to_vec(&claims)?;
    let signature = issuer_key.sign(&claim_bytes);

    let mut signer_chain = Vec::with_capacity(issuer_chain.len() + 1);
    signer_chain.push(issuer_cert.to_pem()?);
    for link in issuer_chain {
        signer_chain.push(link.to_pem()?);
    }

    let envelope = TokenEnvelope {
        claims,
        signature: hex::encode(signature),
        signer_chain,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse and verify a status token against the given trust anchors.
///
/// Fails `MalformedToken` on structural problems, `UnverifiedSigner` when the
/// embedded signer cannot be chained to an anchor, and `ExpiredWindow` when
/// the validity window (with 5 s slack) does not cover the current time.
pub fn decode_and_verify(
    bytes: &[u8],
    trust_anchors: &[Certificate],
    allow_self_signed_anchor: bool,
) -> Result<ParsedStatus> {
    let envelope: TokenEnvelope = serde_json::from_slice(bytes)
        .map_err(|e| PkiError::MalformedToken(format!("bad envelope: {e}")))?;

    let claim_bytes = serde_json::to_vec(&envelope.claims)?;
    let signature: [u8; 64] = hex::decode(&envelope.signature)
        .map_err(|e| PkiError::MalformedToken(format!("bad signature encoding: {e}")))?
        .try_into()
        .map_err(|_| PkiError::MalformedToken("bad signature length".to_string()))?;

    if envelope.signer_chain.is_empty() {
        return Err(PkiError::MalformedToken("no signer chain".to_string()));
    }
    let chain = envelope
        .signer_chain
        .iter()
        .map(|pem| Certificate::from_pem(pem))
        .collect::<Result<Vec<_>>>()
        .map_err(|e| PkiError::MalformedToken(format!("bad signer chain: {e}")))?;

    // Signature by the embedded signer
    let signer = &chain[0];
    let signer_key = signer
        .public_key_bytes()
        .map_err(|e| PkiError::MalformedToken(format!("bad signer key: {e}")))?;
    if !pvsec_key::verify(&signer_key, &claim_bytes, &signature) {
        return Err(PkiError::UnverifiedSigner(
            "token signature does not verify against embedded signer".to_string(),
        ));
    }

    verify_chain_to_anchor(&chain, trust_anchors, allow_self_signed_anchor)?;

    let ocsp_status = OcspStatus::from_index(envelope.claims.ocsp_status)?;
    if ocsp_status == OcspStatus::Revoked && envelope.claims.revocation_date.is_none() {
        return Err(PkiError::MalformedToken(
            "revocation time not set when status is REVOKED".to_string(),
        ));
    }

    let now = now_utc();
    if envelope.claims.status_date > now + WINDOW_SLACK_SECS {
        return Err(PkiError::ExpiredWindow(
            "token status date lies in the future".to_string(),
        ));
    }
    if now > envelope.claims.valid_until + WINDOW_SLACK_SECS {
        return Err(PkiError::ExpiredWindow(
            "token validity window has passed".to_string(),
        ));
    }

    Ok(ParsedStatus {
        issuer_id: envelope.claims.issuer_id,
        serial: envelope.claims.serial,
        ocsp_status,
        status_date: envelope.claims.status_date,
        valid_until: envelope.claims.valid_until,
        revocation_date: envelope.claims.revocation_date,
    })
}

fn verify_chain_to_anchor(
    chain: &[Certificate],
    trust_anchors: &[Certificate],
    allow_self_signed_anchor: bool,
) -> Result<()> {
    // Each link must be signed by the next
    for pair in chain.windows(2) {
        pair[0].verify_signed_by(&pair[1]).map_err(|e| {
            PkiError::UnverifiedSigner(format!("broken signer chain: {e}"))
        })?;
    }

    let Some(terminal) = chain.last() else {
        return Err(PkiError::MalformedToken("no signer chain".to_string()));
    };
    let terminal_der = terminal.to_der()?;

    // Terminal is itself an anchor, or signed by one
    for anchor in trust_anchors {
        if anchor.to_der()? == terminal_der {
            return Ok(());
        }
        if terminal.verify_signed_by(anchor).is_ok() {
            return Ok(());
        }
    }

    if allow_self_signed_anchor
        && terminal.is_self_signed()
        && terminal.verify_self_signed().is_ok()
    {
        return Ok(());
    }

    Err(PkiError::UnverifiedSigner(
        "signer chain does not reach a trust anchor".to_string(),
    ))
}

/// Signing-side helper owned by the CMS: stamps fresh status values and signs
/// them with the issuer key.
pub struct CertStatusFactory {
    issuer_cert: Certificate,
    issuer_key: Arc<KeyPair>,
    issuer_chain: Vec<Certificate>,
    issuer_id: String,
    validity_mins: u32,
}

impl CertStatusFactory {
    pub fn new(
        issuer_cert: Certificate,
        issuer_key: Arc<KeyPair>,
        issuer_chain: Vec<Certificate>,
        validity_mins: u32,
    ) -> Result<Self> {
        let issuer_id = issuer_cert.issuer_id()?;
        Ok(Self {
            issuer_cert,
            issuer_key,
            issuer_chain,
            issuer_id,
            validity_mins,
        })
    }

    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    pub fn issuer_cert(&self) -> &Certificate {
        &self.issuer_cert
    }

    /// Build a signed status for one certificate as of now
    pub fn create_status(
        &self,
        serial: u64,
        pva_status: CertStatus,
        revocation_date: Option<i64>,
    ) -> Result<CertificateStatus> {
        let now = now_utc();
        let valid_until = now + i64::from(self.validity_mins) * 60;
        let revocation_date = if pva_status == CertStatus::Revoked {
            Some(revocation_date.unwrap_or(now))
        } else {
            None
        };

        let mut status = CertificateStatus::new(pva_status, now, valid_until, revocation_date);
        status.ocsp_bytes = Some(encode(
            &self.issuer_id,
            serial,
            status.ocsp_status,
            status.status_date,
            status.valid_until,
            status.revocation_date,
            &self.issuer_key,
            &self.issuer_cert,
            &self.issuer_chain,
        )?);
        Ok(status)
    }
}
