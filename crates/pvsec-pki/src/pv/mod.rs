//! The PV surface consumed by the certificate plane
//!
//! The wire protocol engine is an external collaborator; the certificate
//! plane only needs GET and MONITOR on status PVs.  `StatusSource` is the
//! client-side view of that surface.  `StatusHub` is the in-process
//! implementation used inside the CMS process and by tests; a deployment
//! wires the same traits to the real messaging client on a non-TLS
//! transport.

use std::{
    collections::HashMap,
    sync::{mpsc, Arc, Mutex, Weak},
    time::Duration,
};

use crate::{error::PkiError, status::wire::StatusWireValue, Result};

/// Client view of the status PV surface
pub trait StatusSource: Send + Sync {
    /// Blocking GET with a deadline
    fn get(&self, pv_name: &str, timeout: Duration) -> Result<StatusWireValue>;

    /// Open a MONITOR on the PV.  At least one value is delivered within the
    /// subscription SLA; intermediate values may coalesce.
    fn monitor(&self, pv_name: &str) -> Result<StatusSubscription>;
}

/// Server-side answerer for GET requests on status PVs
pub trait StatusAuthority: Send + Sync {
    fn on_get(&self, pv_name: &str) -> Result<StatusWireValue>;
}

/// A live MONITOR subscription
pub struct StatusSubscription {
    rx: mpsc::Receiver<StatusWireValue>,
}

impl StatusSubscription {
    /// Wait up to `timeout` for the next value
    pub fn recv_timeout(&self, timeout: Duration) -> Result<StatusWireValue> {
        match self.rx.recv_timeout(timeout) {
            Ok(v) => Ok(v),
            Err(mpsc::RecvTimeoutError::Timeout) => Err(PkiError::Timeout(
                "no status value within deadline".to_string(),
            )),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(PkiError::SubscriptionFailed(
                "status publisher went away".to_string(),
            )),
        }
    }

    /// Drain the next value if one is already queued
    pub fn try_recv(&self) -> Option<StatusWireValue> {
        self.rx.try_recv().ok()
    }
}

struct Topic {
    last: Option<StatusWireValue>,
    subscribers: Vec<mpsc::Sender<StatusWireValue>>,
}

/// In-process status PV fan-out.
///
/// The CMS posts every lifecycle transition here; GETs are answered by the
/// registered authority so status tokens are signed on demand.
pub struct StatusHub {
    topics: Mutex<HashMap<String, Topic>>,
    authority: Mutex<Option<Weak<dyn StatusAuthority>>>,
}

impl StatusHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            authority: Mutex::new(None),
        })
    }

    /// Register the GET authority (the CMS service)
    pub fn set_authority(&self, authority: Weak<dyn StatusAuthority>) {
        *lock(&self.authority) = Some(authority);
    }

    /// Publish a value: every current monitor observes it
    pub fn post(&self, pv_name: &str, value: StatusWireValue) {
        let mut topics = lock(&self.topics);
        let topic = topics.entry(pv_name.to_string()).or_insert_with(|| Topic {
            last: None,
            subscribers: Vec::new(),
        });
        topic.last = Some(value.clone());
        topic.subscribers.retain(|tx| tx.send(value.clone()).is_ok());
    }

    /// The most recently posted value, if any
    pub fn last(&self, pv_name: &str) -> Option<StatusWireValue> {
        lock(&self.topics).get(pv_name).and_then(|t| t.last.clone())
    }

    fn authority(&self) -> Option<Arc<dyn StatusAuthority>> {
        lock(&self.authority).as_ref().and_then(Weak::upgrade)
    }
}

impl StatusSource for StatusHub {
    fn get(&self, pv_name: &str, _timeout: Duration) -> Result<StatusWireValue> {
        if let Some(authority) = self.authority() {
            return authority.on_get(pv_name);
        }
        self.last(pv_name).ok_or_else(|| {
            PkiError::Timeout(format!("no responder for {pv_name}"))
        })
    }

    fn monitor(&self, pv_name: &str) -> Result<StatusSubscription> {
        let (tx, rx) = mpsc::channel();

        // Seed with the current value so every subscriber observes at least
        // one value shortly after subscribing
        let seed = self.last(pv_name).or_else(|| {
            self.authority()
                .and_then(|authority| authority.on_get(pv_name).ok())
        });
        if let Some(value) = seed {
            let _ = tx.send(value);
        }

        let mut topics = lock(&self.topics);
        let topic = topics.entry(pv_name.to_string()).or_insert_with(|| Topic {
            last: None,
            subscribers: Vec::new(),
        });
        topic.subscribers.push(tx);
        Ok(StatusSubscription { rx })
    }
}

/// Lock a mutex, recovering the inner value if a panicking holder poisoned it
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CertStatus;

    fn value(serial: u64, status: CertStatus) -> StatusWireValue {
        StatusWireValue {
            status: status.index(),
            state: status.as_str().to_string(),
            serial,
            ocsp_status: status.ocsp_status().index(),
            ocsp_state: status.ocsp_status().as_str().to_string(),
            ocsp_status_date: String::new(),
            ocsp_certified_until: String::new(),
            ocsp_revocation_date: String::new(),
            ocsp_response: vec![],
        }
    }

    #[test]
    fn test_monitor_receives_posts_in_order() {
        let hub = StatusHub::new();
        let sub = hub.monitor("CERT:STATUS:aabbccdd:0000000000000001").unwrap();

        hub.post(
            "CERT:STATUS:aabbccdd:0000000000000001",
            value(1, CertStatus::Pending),
        );
        hub.post(
            "CERT:STATUS:aabbccdd:0000000000000001",
            value(1, CertStatus::Valid),
        );

        let first = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        let second = sub.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(first.status, CertStatus::Pending.index());
        assert_eq!(second.status, CertStatus::Valid.index());
    }

    #[test]
    fn test_monitor_seeded_with_last_value() {
        let hub = StatusHub::new();
        hub.post("pv", value(2, CertStatus::Valid));

        let sub = hub.monitor("pv").unwrap();
        let seeded = sub.recv_timeout(Duration::from_millis(100)).unwrap();
        assert_eq!(seeded.serial, 2);
    }

    #[test]
    fn test_get_without_responder_times_out() {
        let hub = StatusHub::new();
        let err = hub.get("pv", Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, PkiError::Timeout(_)));
    }

    #[test]
    fn test_get_prefers_authority() {
        struct FixedAuthority;
        impl StatusAuthority for FixedAuthority {
            fn on_get(&self, _pv_name: &str) -> Result<StatusWireValue> {
                Ok(value(42, CertStatus::Valid))
            }
        }

        let hub = StatusHub::new();
        let authority: Arc<dyn StatusAuthority> = Arc::new(FixedAuthority);
        hub.set_authority(Arc::downgrade(&authority));

        let got = hub.get("pv", Duration::from_millis(10)).unwrap();
        assert_eq!(got.serial, 42);

        // Dropping the authority falls back to the posted value
        drop(authority);
        hub.post("pv", value(7, CertStatus::Expired));
        let got = hub.get("pv", Duration::from_millis(10)).unwrap();
        assert_eq!(got.serial, 7);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let hub = StatusHub::new();
        let sub = hub.monitor("pv").unwrap();
        drop(sub);
        hub.post("pv", value(1, CertStatus::Valid));
        assert!(hub.last("pv").is_some());
    }
}
