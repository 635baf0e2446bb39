//! TLS-side status gating
//!
//! `CertStatusExData` is the per-TLS-context sidecar: it owns the peer status
//! cache and the live subscriptions, and implements the verify decision the
//! TLS library's callback delegates to.  The context owns the sidecar; the
//! subscription workers hold weak handles back, so tearing the context down
//! evicts every cache entry and cancels every subscription.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, Weak},
};

use crate::{
    cert::Certificate,
    pv::{lock, StatusSource},
    status::{
        manager::{CertStatusManager, STATUS_FETCH_TIMEOUT},
        wire::verify_wire_status,
    },
    types::{now_utc, CertificateStatus},
    Result,
};

/// ALPN protocol identifier negotiated by secure PVA peers
pub const PVA_ALPN: &[u8] = b"pva/1";

/// Minimum TLS protocol version; lower versions are refused at context
/// creation by the TLS glue
pub const TLS_MIN_VERSION: &str = "1.3";

/// Path of the TLS secret log requested via SSLKEYLOGFILE (debug only)
pub fn keylog_file_path() -> Option<std::path::PathBuf> {
    std::env::var_os("SSLKEYLOGFILE").map(std::path::PathBuf::from)
}

/// How the TLS library classified a failed chain verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainVerifyError {
    /// Self-signed certificate in or at the head of the chain
    SelfSigned,
    /// Any other verification failure
    Other(String),
}

/// Fired when a monitored peer's goodness changes
pub type ChangeCallback = Box<dyn Fn(bool) + Send + Sync>;

struct PeerEntry {
    status: Option<Arc<CertificateStatus>>,
    manager: Option<Arc<CertStatusManager>>,
}

/// Per-TLS-context extension data
pub struct CertStatusExData {
    status_check_enabled: bool,
    allow_self_signed: bool,
    trust_anchors: Vec<Certificate>,
    source: Arc<dyn StatusSource>,
    peer_statuses: Mutex<HashMap<u64, PeerEntry>>,
    /// This context's own certificate, when it has one
    own_cert: Mutex<Option<Certificate>>,
}

impl CertStatusExData {
    pub fn new(
        source: Arc<dyn StatusSource>,
        trust_anchors: Vec<Certificate>,
        status_check_enabled: bool,
        allow_self_signed: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            status_check_enabled,
            allow_self_signed,
            trust_anchors,
            source,
            peer_statuses: Mutex::new(HashMap::new()),
            own_cert: Mutex::new(None),
        })
    }

    pub fn set_own_cert(&self, cert: Certificate) {
        *lock(&self.own_cert) = Some(cert);
    }

    pub fn own_cert(&self) -> Option<Certificate> {
        lock(&self.own_cert).clone()
    }

    pub fn status_check_enabled(&self) -> bool {
        self.status_check_enabled
    }

    /// Cached status for a peer serial
    pub fn cached_peer_status(&self, serial: u64) -> Option<Arc<CertificateStatus>> {
        lock(&self.peer_statuses)
            .get(&serial)
            .and_then(|e| e.status.clone())
    }

    /// Store a verified status for a peer serial
    pub fn set_cached_peer_status(
        &self,
        serial: u64,
        status: CertificateStatus,
    ) -> Arc<CertificateStatus> {
        let status = Arc::new(status);
        let mut peers = lock(&self.peer_statuses);
        let entry = peers.entry(serial).or_insert_with(|| PeerEntry {
            status: None,
            manager: None,
        });
        entry.status = Some(status.clone());
        status
    }

    /// Subscribe to a peer certificate's status if not already monitoring.
    ///
    /// `on_change` fires only when goodness flips, and always with the cache
    /// lock released.
    pub fn subscribe_to_cert_status(
        self: &Arc<Self>,
        cert: &Certificate,
        on_change: ChangeCallback,
    ) -> Result<()> {
        let serial = cert.serial();
        {
            let peers = lock(&self.peer_statuses);
            if peers.get(&serial).map(|e| e.manager.is_some()) == Some(true) {
                return Ok(());
            }
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let manager = CertStatusManager::subscribe(
            cert,
            self.source.clone(),
            self.trust_anchors.clone(),
            self.allow_self_signed,
            Box::new(move |result| {
                let Some(ex_data) = weak.upgrade() else { return };
                let (was_good, is_good) = {
                    let mut peers = lock(&ex_data.peer_statuses);
                    let entry = peers.entry(serial).or_insert_with(|| PeerEntry {
                        status: None,
                        manager: None,
                    });
                    let now = now_utc();
                    let was_good = entry
                        .status
                        .as_ref()
                        .map(|s| s.is_good(now))
                        .unwrap_or(false);
                    match result {
                        Ok(status) => {
                            entry.status = Some(Arc::new(status.clone()));
                            (was_good, status.is_good(now))
                        }
                        Err(_) => {
                            // An unusable newest token clears the cache so
                            // the next handshake must revalidate
                            entry.status = None;
                            (was_good, false)
                        }
                    }
                };
                if was_good != is_good {
                    on_change(is_good);
                }
            }),
        )?;

        let mut peers = lock(&self.peer_statuses);
        let entry = peers.entry(serial).or_insert_with(|| PeerEntry {
            status: None,
            manager: None,
        });
        entry.manager = Some(manager);
        Ok(())
    }

    /// The verify decision delegated from the TLS library's callback.
    ///
    /// `chain_error` classifies the underlying failure when `preverify_ok`
    /// is false.
    pub fn tls_verify(
        self: &Arc<Self>,
        preverify_ok: bool,
        chain_error: Option<&ChainVerifyError>,
        cert: &Certificate,
    ) -> bool {
        if !preverify_ok {
            // Accept a self-signed chain only when local policy permits
            let accepted = self.allow_self_signed
                && matches!(chain_error, Some(ChainVerifyError::SelfSigned));
            if !accepted {
                tracing::error!(
                    error = ?chain_error,
                    "unable to verify peer certificate"
                );
            }
            return accepted;
        }

        // Chain verification passed; check whether revocation monitoring is
        // required at all
        if !cert.has_status_extension() || !self.status_check_enabled {
            return true;
        }

        let serial = cert.serial();
        let now = now_utc();
        if let Some(status) = self.cached_peer_status(serial) {
            if status.is_fresh(now) {
                return status.is_good(now);
            }
        }

        // Absent or stale: keep a subscription running and do one blocking
        // fetch so the handshake decision is based on current status
        if let Err(e) = self.subscribe_to_cert_status(cert, Box::new(|_| {})) {
            tracing::warn!(error = %e, "peer status subscription failed");
        }
        match self.fetch_peer_status(cert) {
            Ok(status) => status.is_good(now_utc()),
            Err(e) => {
                tracing::warn!(
                    serial,
                    error = %e,
                    "unable to verify peer revocation status"
                );
                false
            }
        }
    }

    fn fetch_peer_status(&self, cert: &Certificate) -> Result<Arc<CertificateStatus>> {
        let pv_name = cert.status_pv_name()?;
        let value = self.source.get(&pv_name, STATUS_FETCH_TIMEOUT)?;
        let status = verify_wire_status(&value, &self.trust_anchors, self.allow_self_signed)?;
        Ok(self.set_cached_peer_status(cert.serial(), status))
    }

    /// Cancel all subscriptions and drop the cache.  Runs on context teardown.
    pub fn evict_all(&self) {
        let mut peers = lock(&self.peer_statuses);
        for entry in peers.values() {
            if let Some(manager) = &entry.manager {
                manager.unsubscribe();
            }
        }
        peers.clear();
    }
}

impl Drop for CertStatusExData {
    fn drop(&mut self) {
        self.evict_all();
    }
}

/// Outcome of preparing the server's OCSP staple for a handshake
#[derive(Debug, PartialEq, Eq)]
pub enum StapleOutcome {
    /// Status changed; these bytes were copied into the staple slot
    Stapled(Vec<u8>),
    /// Same status as the previous handshake
    Unchanged,
    /// No signed status available to staple
    Unavailable,
}

/// Per-context staple slot for the server's own status token
pub struct StapleSlot {
    cached: Mutex<Option<Vec<u8>>>,
}

impl StapleSlot {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    /// Called from the server-side handshake hook with the server's current
    /// status; copies the token into the slot when it changed.
    pub fn prepare(&self, current: Option<&CertificateStatus>) -> StapleOutcome {
        let Some(bytes) = current.and_then(|s| s.ocsp_bytes.as_ref()) else {
            tracing::warn!("no server status to staple");
            return StapleOutcome::Unavailable;
        };

        let mut cached = lock(&self.cached);
        if cached.as_deref() == Some(bytes.as_slice()) {
            return StapleOutcome::Unchanged;
        }
        *cached = Some(bytes.clone());
        tracing::info!("server status stapled");
        StapleOutcome::Stapled(bytes.clone())
    }
}

impl Default for StapleSlot {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pvsec_key::KeyPair;

    use super::*;
    use crate::{
        cert::{
            factory::{build_self_signed_ca, CertFactory, CertUsage},
            CertSubject,
        },
        pv::StatusHub,
        status::{codec::CertStatusFactory, wire::to_wire},
        types::CertStatus,
    };

    struct Fixture {
        hub: Arc<StatusHub>,
        anchor: Certificate,
        status_factory: CertStatusFactory,
        cert: Certificate,
        plain_cert: Certificate,
    }

    fn fixture() -> Fixture {
        let ca_key = Arc::new(KeyPair::generate().unwrap());
        let now = now_utc();
        let anchor = build_self_signed_ca(
            CertSubject::new("EPICS Root CA"),
            &ca_key,
            now - 10,
            now + 3600,
        )
        .unwrap();

        let ee_key = KeyPair::generate().unwrap();
        let (cert, _) = CertFactory::new(
            777,
            CertSubject::new("alice"),
            ee_key.spki_der().unwrap(),
            now - 1,
            now + 3600,
            CertUsage::Client,
            true,
        )
        .with_issuer(&anchor, &ca_key, &[])
        .build_end_entity()
        .unwrap();

        let status_factory =
            CertStatusFactory::new(anchor.clone(), ca_key, vec![], 30).unwrap();

        Fixture {
            hub: StatusHub::new(),
            plain_cert: anchor.clone(),
            anchor,
            status_factory,
            cert,
        }
    }

    fn ex_data(fx: &Fixture) -> Arc<CertStatusExData> {
        CertStatusExData::new(fx.hub.clone(), vec![fx.anchor.clone()], true, false)
    }

    fn post(fx: &Fixture, state: CertStatus) {
        let status = fx.status_factory.create_status(777, state, None).unwrap();
        let wire = to_wire(777, &status).unwrap();
        fx.hub.post(&fx.cert.status_pv_name().unwrap(), wire);
    }

    #[test]
    fn test_verify_passes_unmonitored_cert_through() {
        let fx = fixture();
        let ex = ex_data(&fx);
        // The CA certificate carries no status extension
        assert!(ex.tls_verify(true, None, &fx.plain_cert));
    }

    #[test]
    fn test_verify_accepts_good_and_rejects_revoked() {
        let fx = fixture();
        let ex = ex_data(&fx);

        post(&fx, CertStatus::Valid);
        assert!(ex.tls_verify(true, None, &fx.cert));
        // Second handshake hits the fresh cache
        assert!(ex.tls_verify(true, None, &fx.cert));

        post(&fx, CertStatus::Revoked);
        // The cached GOOD status is still fresh, but a new fetch after the
        // cache is cleared must observe the revocation
        ex.evict_all();
        assert!(!ex.tls_verify(true, None, &fx.cert));
    }

    #[test]
    fn test_verify_rejects_when_status_unavailable() {
        let fx = fixture();
        let ex = ex_data(&fx);
        // Nothing posted and no authority: the blocking fetch fails
        assert!(!ex.tls_verify(true, None, &fx.cert));
    }

    #[test]
    fn test_verify_failed_chain_policy() {
        let fx = fixture();

        let strict = CertStatusExData::new(fx.hub.clone(), vec![fx.anchor.clone()], true, false);
        assert!(!strict.tls_verify(false, Some(&ChainVerifyError::SelfSigned), &fx.cert));

        let relaxed = CertStatusExData::new(fx.hub.clone(), vec![fx.anchor.clone()], true, true);
        assert!(relaxed.tls_verify(false, Some(&ChainVerifyError::SelfSigned), &fx.cert));
        assert!(!relaxed.tls_verify(
            false,
            Some(&ChainVerifyError::Other("expired".to_string())),
            &fx.cert
        ));
    }

    #[test]
    fn test_on_change_fires_only_on_goodness_flips() {
        let fx = fixture();
        let ex = ex_data(&fx);
        let flips = Arc::new(AtomicUsize::new(0));

        let flips_in_cb = flips.clone();
        let ex_in_cb = Arc::downgrade(&ex);
        ex.subscribe_to_cert_status(
            &fx.cert,
            Box::new(move |_is_good| {
                flips_in_cb.fetch_add(1, Ordering::SeqCst);
                // The cache lock must be free while the callback runs
                if let Some(ex) = ex_in_cb.upgrade() {
                    let _ = ex.cached_peer_status(777);
                }
            }),
        )
        .unwrap();

        post(&fx, CertStatus::Valid);
        post(&fx, CertStatus::Valid);
        post(&fx, CertStatus::Revoked);

        std::thread::sleep(Duration::from_millis(800));
        // good (flip 1), good again (no flip), revoked (flip 2)
        assert_eq!(flips.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_corrupt_monitor_update_forces_revalidation() {
        let fx = fixture();
        let ex = ex_data(&fx);

        post(&fx, CertStatus::Valid);
        assert!(ex.tls_verify(true, None, &fx.cert));

        // A corrupted token arrives on the subscription.  The cached good
        // status must not outlive it.
        let status = fx
            .status_factory
            .create_status(777, CertStatus::Valid, None)
            .unwrap();
        let mut wire = to_wire(777, &status).unwrap();
        let mid = wire.ocsp_response.len() / 2;
        wire.ocsp_response[mid] ^= 0x01;
        fx.hub.post(&fx.cert.status_pv_name().unwrap(), wire);

        std::thread::sleep(Duration::from_millis(800));
        assert!(ex.cached_peer_status(777).is_none());

        // The refetch sees the same corrupt token and the handshake fails
        assert!(!ex.tls_verify(true, None, &fx.cert));
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let fx = fixture();
        let ex = ex_data(&fx);
        ex.subscribe_to_cert_status(&fx.cert, Box::new(|_| {})).unwrap();
        ex.subscribe_to_cert_status(&fx.cert, Box::new(|_| {})).unwrap();
    }

    #[test]
    fn test_staple_slot_copies_on_change_only() {
        let fx = fixture();
        let slot = StapleSlot::new();

        assert_eq!(slot.prepare(None), StapleOutcome::Unavailable);

        let status = fx
            .status_factory
            .create_status(777, CertStatus::Valid, None)
            .unwrap();
        match slot.prepare(Some(&status)) {
            StapleOutcome::Stapled(bytes) => {
                assert_eq!(Some(bytes), status.ocsp_bytes);
            }
            other => panic!("expected staple, got {other:?}"),
        }
        assert_eq!(slot.prepare(Some(&status)), StapleOutcome::Unchanged);

        let newer = fx
            .status_factory
            .create_status(777, CertStatus::Revoked, None)
            .unwrap();
        assert!(matches!(
            slot.prepare(Some(&newer)),
            StapleOutcome::Stapled(_)
        ));
    }
}
