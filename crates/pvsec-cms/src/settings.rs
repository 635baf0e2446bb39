//! CMS configuration
//!
//! Settings come from an optional TOML file merged with `PVSEC_`-prefixed
//! environment variables; everything has a usable default so a bare CMS can
//! bootstrap itself in the current directory.

use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

/// Hard upper bound on the lifecycle sweep period
const SWEEP_PERIOD_MAX_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Minutes a signed status response stays valid before clients must
    /// re-request
    #[serde(default = "d_status_validity_mins")]
    pub cert_status_validity_mins: u32,

    /// Require admin approval for client certificates requested with basic
    /// credentials
    #[serde(default = "d_true")]
    pub cert_client_require_approval: bool,

    /// Require admin approval for server certificates requested with basic
    /// credentials
    #[serde(default = "d_true")]
    pub cert_server_require_approval: bool,

    /// Require admin approval for gateway certificates requested with basic
    /// credentials
    #[serde(default = "d_true")]
    pub cert_gateway_require_approval: bool,

    /// Embed the status-PV and subscription-required extensions in issued
    /// certificates
    #[serde(default = "d_true")]
    pub cert_status_subscription: bool,

    /// Certificate database file
    #[serde(default = "d_db_filename")]
    pub db_filename: String,

    /// Access control file naming the admin group members
    #[serde(default = "d_acf_filename")]
    pub acf_filename: String,

    /// Lifecycle sweep period in seconds (clamped to 30)
    #[serde(default = "d_sweep_secs")]
    pub status_sweep_secs: u64,

    /// CA subject used when bootstrapping a fresh root certificate
    #[serde(default = "d_ca_name")]
    pub ca_name: String,
    #[serde(default = "d_ca_organization")]
    pub ca_organization: String,
    #[serde(default = "d_ca_organizational_unit")]
    pub ca_organizational_unit: String,
    #[serde(default)]
    pub ca_country: String,

    /// CA keychain container (private key + certificate + chain, PEM)
    #[serde(default = "d_ca_keychain")]
    pub ca_keychain: String,

    /// Subject of the CMS's own server certificate
    #[serde(default = "d_cms_name")]
    pub cms_name: String,
    #[serde(default = "d_cms_organization")]
    pub cms_organization: String,
    #[serde(default = "d_cms_organizational_unit")]
    pub cms_organizational_unit: String,
    #[serde(default)]
    pub cms_country: String,

    /// CMS server keychain container
    #[serde(default = "d_cms_keychain")]
    pub cms_keychain: String,

    /// Admin keychain used by the management tool
    #[serde(default = "d_admin_keychain")]
    pub admin_keychain: String,
}

fn d_status_validity_mins() -> u32 {
    30
}
fn d_true() -> bool {
    true
}
fn d_db_filename() -> String {
    "certs.db".to_string()
}
fn d_acf_filename() -> String {
    "pvsec.acf".to_string()
}
fn d_sweep_secs() -> u64 {
    SWEEP_PERIOD_MAX_SECS
}
fn d_ca_name() -> String {
    "EPICS Root CA".to_string()
}
fn d_ca_organization() -> String {
    "ca.epics.org".to_string()
}
fn d_ca_organizational_unit() -> String {
    "EPICS Certificate Authority".to_string()
}
fn d_ca_keychain() -> String {
    "ca.keychain.pem".to_string()
}
fn d_cms_name() -> String {
    "PVACMS Service".to_string()
}
fn d_cms_organization() -> String {
    "ca.epics.org".to_string()
}
fn d_cms_organizational_unit() -> String {
    "EPICS PVA Certificate Management Service".to_string()
}
fn d_cms_keychain() -> String {
    "server.keychain.pem".to_string()
}
fn d_admin_keychain() -> String {
    "admin.keychain.pem".to_string()
}

impl Settings {
    /// Load settings from an optional TOML file plus `PVSEC_*` environment
    /// overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let cfg = builder
            .add_source(config::Environment::with_prefix("PVSEC"))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }

    /// The effective sweep period, never above the 30 s ceiling
    pub fn sweep_period(&self) -> Duration {
        Duration::from_secs(self.status_sweep_secs.clamp(1, SWEEP_PERIOD_MAX_SECS))
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings::load(None).expect("defaults always deserialize")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.cert_status_validity_mins, 30);
        assert!(s.cert_client_require_approval);
        assert_eq!(s.db_filename, "certs.db");
        assert_eq!(s.ca_name, "EPICS Root CA");
        assert_eq!(s.sweep_period(), Duration::from_secs(30));
    }

    #[test]
    fn test_sweep_period_is_clamped() {
        let mut s = Settings::default();
        s.status_sweep_secs = 300;
        assert_eq!(s.sweep_period(), Duration::from_secs(30));
        s.status_sweep_secs = 0;
        assert_eq!(s.sweep_period(), Duration::from_secs(1));
        s.status_sweep_secs = 5;
        assert_eq!(s.sweep_period(), Duration::from_secs(5));
    }
}
