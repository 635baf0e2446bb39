//! The certificate management service
//!
//! `Cms` ties the factory, the ledger and the status plane together.  The
//! order of effects is load-bearing everywhere here: state is committed to
//! the ledger before any status publication, so a crash between commit and
//! publish is recovered by the startup republication pass.

use std::sync::Arc;

use pvsec_key::KeyPair;
use pvsec_pki::{
    cert_and_chain_to_pem, generate_serial, now_utc, to_wire,
    pv::{StatusAuthority, StatusHub},
    CertCreationRequest, CertFactory, CertId, CertStatus, CertStatusFactory, CertUsage,
    Certificate, CertificateStatus, PeerCredentials, PkiError, StatusWireValue, AUTH_TYPE_BASIC,
    AUTH_TYPE_X509,
};

use crate::{
    acl::AccessControl,
    db::{CertDb, CertRecord, DuplicateKind},
    error::{CmsError, Result},
    settings::Settings,
};

/// Admin state changes accepted on the revocation surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertAction {
    Approve,
    Deny,
    Revoke,
}

impl CertAction {
    /// Parse the desired-state argument of the revocation RPC
    pub fn parse(state: &str) -> Result<Self> {
        Ok(match state {
            "APPROVED" => CertAction::Approve,
            "DENIED" => CertAction::Deny,
            "REVOKED" => CertAction::Revoke,
            other => {
                return Err(CmsError::MalformedRequest(format!(
                    "unknown desired state {other:?}"
                )))
            }
        })
    }
}

/// Reply to a successful CREATE
#[derive(Debug, Clone)]
pub struct CreateResponse {
    pub cert_id: String,
    pub serial: u64,
    pub status_pv: String,
    /// The new certificate followed by the issuer chain, PEM
    pub pem: String,
}

/// The network-visible certificate authority
pub struct Cms {
    settings: Settings,
    db: CertDb,
    ca_cert: Certificate,
    ca_key: Arc<KeyPair>,
    ca_chain: Vec<Certificate>,
    issuer_id: String,
    status_factory: CertStatusFactory,
    hub: Arc<StatusHub>,
    acl: AccessControl,
}

impl Cms {
    /// Assemble the service and register it as the GET authority on the hub
    pub fn new(
        settings: Settings,
        db: CertDb,
        ca_cert: Certificate,
        ca_key: Arc<KeyPair>,
        ca_chain: Vec<Certificate>,
        hub: Arc<StatusHub>,
        acl: AccessControl,
    ) -> Result<Arc<Self>> {
        let issuer_id = ca_cert.issuer_id()?;
        let status_factory = CertStatusFactory::new(
            ca_cert.clone(),
            ca_key.clone(),
            ca_chain.clone(),
            settings.cert_status_validity_mins,
        )?;

        let cms = Arc::new(Self {
            settings,
            db,
            ca_cert,
            ca_key,
            ca_chain,
            issuer_id,
            status_factory,
            hub,
            acl,
        });

        let authority: Arc<dyn StatusAuthority> = cms.clone();
        cms.hub.set_authority(Arc::downgrade(&authority));
        tracing::info!(issuer_id = %cms.issuer_id, "certificate management service ready");
        Ok(cms)
    }

    pub fn issuer_id(&self) -> &str {
        &self.issuer_id
    }

    pub fn ca_cert(&self) -> &Certificate {
        &self.ca_cert
    }

    pub fn hub(&self) -> &Arc<StatusHub> {
        &self.hub
    }

    pub fn db(&self) -> &CertDb {
        &self.db
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// The effective sweep period (configured, capped at 30 s)
    pub fn sweep_period(&self) -> std::time::Duration {
        self.settings.sweep_period()
    }

    /// CREATE: validate, admit, mint, persist, publish.
    ///
    /// The ledger insert happens before the status publication; the response
    /// PEM carries the new certificate and the full issuer chain.
    pub fn on_create(
        &self,
        ccr: &CertCreationRequest,
        peer: Option<&PeerCredentials>,
    ) -> Result<CreateResponse> {
        let usage = ccr
            .validate()
            .map_err(|e| CmsError::MalformedRequest(e.to_string()))?;
        if usage == CertUsage::Ca {
            return Err(CmsError::MalformedRequest(
                "CA certificates are not issued via CREATE".to_string(),
            ));
        }

        let initial_status = self.admission(ccr, usage, peer)?;

        let skid = hex::encode(ccr.subject_key_id());
        match self.db.check_duplicate(&ccr.subject(), &skid)? {
            Some(DuplicateKind::Subject) => return Err(CmsError::DuplicateSubject),
            Some(DuplicateKind::SubjectKeyId) => return Err(CmsError::DuplicateKey),
            None => {}
        }

        let serial = generate_serial()?;
        let factory = CertFactory::new(
            serial,
            ccr.subject(),
            ccr.pub_key.clone(),
            ccr.not_before,
            ccr.not_after,
            usage,
            self.settings.cert_status_subscription,
        )
        .with_issuer(&self.ca_cert, &self.ca_key, &self.ca_chain);
        let (cert, chain) = factory.build_end_entity()?;

        let record = CertRecord {
            serial,
            skid,
            subject: ccr.subject(),
            not_before: ccr.not_before,
            not_after: ccr.not_after,
            status: initial_status,
            status_date: now_utc(),
        };
        self.db.insert(&record)?;

        let cert_id = CertId::new(self.issuer_id.clone(), serial);
        tracing::info!(
            cert_id = %cert_id,
            cn = %record.subject.common_name,
            status = initial_status.as_str(),
            "issued certificate"
        );

        if let Err(e) = self.post_status(serial) {
            tracing::warn!(serial, error = %e, "status publication after issuance failed");
        }

        Ok(CreateResponse {
            status_pv: cert_id.status_pv(),
            cert_id: cert_id.to_string(),
            serial,
            pem: cert_and_chain_to_pem(&cert, &chain)?,
        })
    }

    /// Admission control for CREATE: the auth type selects the verifier and
    /// the initial lifecycle state.
    fn admission(
        &self,
        ccr: &CertCreationRequest,
        usage: CertUsage,
        peer: Option<&PeerCredentials>,
    ) -> Result<CertStatus> {
        match ccr.auth_type.as_str() {
            AUTH_TYPE_BASIC => {
                if self.require_approval(usage) {
                    Ok(CertStatus::PendingApproval)
                } else {
                    self.window_status(ccr)
                }
            }
            AUTH_TYPE_X509 => {
                // Renewal: the caller proves ownership by presenting a
                // not-yet-expired certificate for the same subject
                let peer = peer.ok_or_else(|| {
                    CmsError::Unauthorized(
                        "x509 renewal requires a TLS-authenticated peer".to_string(),
                    )
                })?;
                if peer.method != AUTH_TYPE_X509 {
                    return Err(CmsError::Unauthorized(format!(
                        "renewal peer authenticated via {:?}, not x509",
                        peer.method
                    )));
                }
                if peer.name != ccr.name || peer.organization != ccr.organization {
                    return Err(CmsError::Unauthorized(
                        "renewal subject does not match the caller's certificate".to_string(),
                    ));
                }
                self.window_status(ccr)
            }
            // Other auth backends (jwt, krb, ldap) arrive pre-verified
            _ => self.window_status(ccr),
        }
    }

    fn require_approval(&self, usage: CertUsage) -> bool {
        match usage {
            CertUsage::Client => self.settings.cert_client_require_approval,
            CertUsage::Server => self.settings.cert_server_require_approval,
            CertUsage::Gateway => self.settings.cert_gateway_require_approval,
            CertUsage::Ca => true,
        }
    }

    /// Pre-approved initial state from the requested validity window
    fn window_status(&self, ccr: &CertCreationRequest) -> Result<CertStatus> {
        let now = now_utc();
        if now < ccr.not_before {
            Ok(CertStatus::Pending)
        } else if now > ccr.not_after {
            Err(CmsError::MalformedRequest(
                "requested validity window already passed".to_string(),
            ))
        } else {
            Ok(CertStatus::Valid)
        }
    }

    /// STATUS GET: look up the ledger and sign a fresh status on demand
    pub fn on_get_status(&self, pv_name: &str) -> Result<StatusWireValue> {
        let cert_id = CertId::from_status_pv(pv_name)
            .map_err(|e| CmsError::MalformedRequest(e.to_string()))?;
        if cert_id.issuer_id != self.issuer_id {
            return Err(CmsError::NotFound(cert_id.serial));
        }
        let (status, status_date) = self.db.get_status(cert_id.serial)?;
        Ok(self.signed_wire(cert_id.serial, status, status_date))
    }

    /// Admin state change: ACL first, then the transition check in the
    /// ledger.  On success the new status is published to all monitors.
    pub fn on_revoke(
        &self,
        cert_id: &CertId,
        action: CertAction,
        peer: Option<&PeerCredentials>,
    ) -> Result<StatusWireValue> {
        self.acl.authorize(peer)?;

        if cert_id.issuer_id != self.issuer_id {
            return Err(CmsError::NotFound(cert_id.serial));
        }
        let serial = cert_id.serial;

        match action {
            CertAction::Revoke => {
                self.db.set_status(
                    serial,
                    CertStatus::Revoked,
                    &[
                        CertStatus::PendingApproval,
                        CertStatus::Pending,
                        CertStatus::Valid,
                    ],
                )?;
            }
            CertAction::Deny => {
                self.db.set_status(
                    serial,
                    CertStatus::Revoked,
                    &[CertStatus::PendingApproval],
                )?;
            }
            CertAction::Approve => {
                let record = self.db.get_record(serial)?;
                let now = now_utc();
                let target = if now < record.not_before {
                    CertStatus::Pending
                } else if now > record.not_after {
                    CertStatus::Expired
                } else {
                    CertStatus::Valid
                };
                self.db
                    .set_status(serial, target, &[CertStatus::PendingApproval])?;
            }
        }

        let peer_name = peer.map(|p| p.name.as_str()).unwrap_or("");
        tracing::info!(cert_id = %cert_id, ?action, admin = peer_name, "applied state change");
        self.post_status(serial)
    }

    /// Sign and publish the current ledger status of one certificate
    pub fn post_status(&self, serial: u64) -> Result<StatusWireValue> {
        let (status, status_date) = self.db.get_status(serial)?;
        let wire = self.signed_wire(serial, status, status_date);
        let pv_name = CertId::new(self.issuer_id.clone(), serial).status_pv();
        self.hub.post(&pv_name, wire.clone());
        Ok(wire)
    }

    /// Build the signed wire value; degrade to UNKNOWN with empty token
    /// bytes when the signer is unavailable, keeping the ledger untouched.
    fn signed_wire(&self, serial: u64, status: CertStatus, status_date: i64) -> StatusWireValue {
        let revocation_date =
            (status == CertStatus::Revoked).then_some(status_date);
        let signed = self
            .status_factory
            .create_status(serial, status, revocation_date)
            .and_then(|st| to_wire(serial, &st));
        match signed {
            Ok(wire) => wire,
            Err(e) => {
                tracing::warn!(serial, error = %e, "status signing failed, posting degraded value");
                let unknown = CertificateStatus::unknown();
                StatusWireValue {
                    status: unknown.pva_status.index(),
                    state: unknown.pva_status.as_str().to_string(),
                    serial,
                    ocsp_status: unknown.ocsp_status.index(),
                    ocsp_state: unknown.ocsp_status.as_str().to_string(),
                    ocsp_status_date: String::new(),
                    ocsp_certified_until: String::new(),
                    ocsp_revocation_date: String::new(),
                    ocsp_response: vec![],
                }
            }
        }
    }

    /// Startup recovery: republish the current status of every certificate
    /// so monitors converge even after a crash between commit and publish
    pub fn republish_all(&self) {
        let serials = match self.db.all_serials() {
            Ok(serials) => serials,
            Err(e) => {
                tracing::error!(error = %e, "cannot enumerate certificates for republication");
                return;
            }
        };
        for serial in serials {
            if let Err(e) = self.post_status(serial) {
                tracing::warn!(serial, error = %e, "republication failed");
            }
        }
    }

    /// One lifecycle sweep round: open validity windows and expire closed
    /// ones, publishing every transition.  Returns the number of changes.
    pub fn sweep_once(&self) -> Result<usize> {
        let now = now_utc();
        let mut changed = 0;

        for serial in self.db.sweep_due_valid(now)? {
            match self
                .db
                .set_status(serial, CertStatus::Valid, &[CertStatus::Pending])
            {
                Ok(()) => {
                    tracing::info!(serial, "certificate became valid");
                    changed += 1;
                    if let Err(e) = self.post_status(serial) {
                        tracing::warn!(serial, error = %e, "publication failed");
                    }
                }
                Err(CmsError::IllegalTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        for serial in self.db.sweep_due_expired(now)? {
            match self.db.set_status(
                serial,
                CertStatus::Expired,
                &[
                    CertStatus::PendingApproval,
                    CertStatus::Pending,
                    CertStatus::Valid,
                ],
            ) {
                Ok(()) => {
                    tracing::info!(serial, "certificate expired");
                    changed += 1;
                    if let Err(e) = self.post_status(serial) {
                        tracing::warn!(serial, error = %e, "publication failed");
                    }
                }
                Err(CmsError::IllegalTransition { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        Ok(changed)
    }
}

impl StatusAuthority for Cms {
    fn on_get(&self, pv_name: &str) -> pvsec_pki::Result<StatusWireValue> {
        self.on_get_status(pv_name)
            .map_err(|e| PkiError::Timeout(format!("status unavailable: {e}")))
    }
}
