//! Client-side certificate status monitoring
//!
//! A `CertStatusManager` owns one subscription to a peer certificate's
//! status PV.  Updates are verified against the signed token before they are
//! cached or reported; unverifiable updates are dropped.  The worker holds
//! only a weak handle to its manager, so an unsubscribed or dropped manager
//! ends the subscription within one callback cycle.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use crate::{
    cert::Certificate,
    error::PkiError,
    pv::{lock, StatusSource},
    status::wire::verify_wire_status,
    types::{now_utc, CertificateStatus},
    Result,
};

/// How long a first status fetch may block the caller
pub const STATUS_FETCH_TIMEOUT: Duration = Duration::from_secs(3);

/// Poll interval of the subscription worker and of `wait_for_status`
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Called for every status update: a verified status, or the error that made
/// the newest update unusable.  An error invalidates whatever was cached
/// before it, so callers re-validate rather than trust a stale success.
pub type StatusCallback = Box<dyn Fn(&Result<CertificateStatus>) + Send + Sync>;

/// Manages one certificate status subscription
pub struct CertStatusManager {
    pv_name: String,
    serial: u64,
    source: Arc<dyn StatusSource>,
    trust_anchors: Vec<Certificate>,
    allow_self_signed: bool,
    status: Mutex<Option<CertificateStatus>>,
    stopped: AtomicBool,
}

impl CertStatusManager {
    /// Subscribe to status updates for the given certificate.
    ///
    /// The source must run over a non-TLS transport; subscribing through a
    /// monitored TLS connection would make verification depend on itself.
    /// The callback fires only for verified updates.
    pub fn subscribe(
        cert: &Certificate,
        source: Arc<dyn StatusSource>,
        trust_anchors: Vec<Certificate>,
        allow_self_signed: bool,
        callback: StatusCallback,
    ) -> Result<Arc<Self>> {
        let pv_name = cert.status_pv_name()?;
        tracing::debug!(pv = %pv_name, "starting status subscription");

        let subscription = source.monitor(&pv_name).map_err(|e| {
            PkiError::SubscriptionFailed(format!("error subscribing to {pv_name}: {e}"))
        })?;

        let manager = Arc::new(Self {
            pv_name,
            serial: cert.serial(),
            source,
            trust_anchors,
            allow_self_signed,
            status: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let weak: Weak<Self> = Arc::downgrade(&manager);
        std::thread::Builder::new()
            .name("cert-status-monitor".to_string())
            .spawn(move || loop {
                match subscription.recv_timeout(POLL_INTERVAL) {
                    Ok(value) => {
                        // The manager may be gone by the time a value lands;
                        // in that case the subscription dies here.
                        let Some(manager) = weak.upgrade() else { break };
                        if manager.stopped.load(Ordering::Acquire) {
                            break;
                        }
                        let result = verify_wire_status(
                            &value,
                            &manager.trust_anchors,
                            manager.allow_self_signed,
                        );
                        match &result {
                            Ok(status) => {
                                tracing::debug!(
                                    pv = %manager.pv_name,
                                    state = status.pva_status.as_str(),
                                    "status subscription received"
                                );
                                *lock(&manager.status) = Some(status.clone());
                            }
                            Err(e) => {
                                // The newest token is unusable; a previously
                                // cached success must not outlive it
                                tracing::warn!(
                                    pv = %manager.pv_name,
                                    error = %e,
                                    "unverifiable status update invalidates cached status"
                                );
                                *lock(&manager.status) = None;
                            }
                        }
                        callback(&result);
                    }
                    Err(PkiError::Timeout(_)) => {
                        let Some(manager) = weak.upgrade() else { break };
                        if manager.stopped.load(Ordering::Acquire) {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            })
            .map_err(|e| PkiError::SubscriptionFailed(format!("worker spawn failed: {e}")))?;

        Ok(manager)
    }

    /// The status PV this manager watches
    pub fn pv_name(&self) -> &str {
        &self.pv_name
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Last verified status, if any
    pub fn status(&self) -> Option<CertificateStatus> {
        lock(&self.status).clone()
    }

    /// Current status: the cached value while fresh, otherwise a blocking GET
    /// with the standard fetch deadline.
    pub fn get_status(&self) -> Result<CertificateStatus> {
        let now = now_utc();
        if let Some(status) = self.status() {
            if status.is_fresh(now) {
                return Ok(status);
            }
        }

        let value = self.source.get(&self.pv_name, STATUS_FETCH_TIMEOUT)?;
        let status = verify_wire_status(&value, &self.trust_anchors, self.allow_self_signed)?;
        *lock(&self.status) = Some(status.clone());
        Ok(status)
    }

    /// Wait for the subscription to deliver a fresh status, up to `timeout`
    pub fn wait_for_status(&self, timeout: Duration) -> Result<CertificateStatus> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.status() {
                if status.is_fresh(now_utc()) {
                    return Ok(status);
                }
            }
            if Instant::now() >= deadline {
                return Err(PkiError::Timeout(format!(
                    "no status for {} within deadline",
                    self.pv_name
                )));
            }
            std::thread::sleep(POLL_INTERVAL.min(Duration::from_millis(100)));
        }
    }

    /// End the subscription.  Idempotent, and safe to race against an
    /// in-flight callback: the worker either completes its current delivery
    /// against the old state or exits on the stop flag.
    pub fn unsubscribe(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}

impl Drop for CertStatusManager {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::Release);
    }
}
