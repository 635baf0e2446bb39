//! Admin access control
//!
//! The access control file names the user group whose members may approve,
//! deny and revoke certificates.  Membership alone is not enough: the caller
//! must also have authenticated with an X.509 certificate, so a peer that
//! arrived over an unauthenticated transport can never administer the CMS.
//!
//! Only the UAG blocks are read here; rule blocks in the same file configure
//! the messaging layer's own access control and are ignored.

use std::{collections::HashMap, collections::HashSet, fs, path::Path};

use pvsec_pki::{PeerCredentials, AUTH_TYPE_X509};

use crate::error::{CmsError, Result};

/// Group whose members administer the CMS
pub const ADMIN_GROUP: &str = "ADMINS";

/// Parsed access control configuration
pub struct AccessControl {
    groups: HashMap<String, HashSet<String>>,
}

impl AccessControl {
    /// Parse an access control file.
    ///
    /// Recognized syntax, one or more blocks of:
    /// ```text
    /// UAG(ADMINS) {
    ///     "admin",
    ///     "admin@yourdomain.com"
    /// }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(Self::parse(&text))
    }

    /// Build directly from an admin name list (bootstrap and tests)
    pub fn from_admins<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut groups = HashMap::new();
        groups.insert(
            ADMIN_GROUP.to_string(),
            admins.into_iter().map(Into::into).collect(),
        );
        Self { groups }
    }

    /// An access control that authorizes nobody
    pub fn deny_all() -> Self {
        Self {
            groups: HashMap::new(),
        }
    }

    fn parse(text: &str) -> Self {
        let mut groups: HashMap<String, HashSet<String>> = HashMap::new();
        let mut rest = text;
        while let Some(start) = rest.find("UAG(") {
            rest = &rest[start + 4..];
            let Some(close) = rest.find(')') else { break };
            let group = rest[..close].trim().to_string();
            rest = &rest[close + 1..];

            let Some(open_brace) = rest.find('{') else { break };
            let Some(close_brace) = rest[open_brace..].find('}') else {
                break;
            };
            let body = &rest[open_brace + 1..open_brace + close_brace];
            let members = groups.entry(group).or_default();
            for part in body.split(',') {
                let name = part.trim().trim_matches('"').trim();
                if !name.is_empty() {
                    members.insert(name.to_string());
                }
            }
            rest = &rest[open_brace + close_brace + 1..];
        }
        Self { groups }
    }

    fn is_admin(&self, name: &str) -> bool {
        self.groups
            .get(ADMIN_GROUP)
            .map(|members| members.contains(name))
            .unwrap_or(false)
    }

    /// Gate for state-changing operations: the peer must be TLS-authenticated
    /// and its CN listed in the admin group.
    pub fn authorize(&self, peer: Option<&PeerCredentials>) -> Result<()> {
        let peer = peer.ok_or_else(|| {
            CmsError::Unauthorized("operation requires an authenticated peer".to_string())
        })?;
        if peer.method != AUTH_TYPE_X509 {
            return Err(CmsError::Unauthorized(format!(
                "method {:?} may not administer certificates",
                peer.method
            )));
        }
        if !self.is_admin(&peer.name) {
            return Err(CmsError::Unauthorized(format!(
                "{:?} is not in the {ADMIN_GROUP} group",
                peer.name
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ACF: &str = r#"
UAG(ADMINS) {
    "admin",
    "admin@yourdomain.com"
}

ASG(SPECIAL) {
    RULE(0,READ)
    RULE(1,WRITE) {
        UAG(ADMINS)
        METHOD("x509")
    }
}
"#;

    #[test]
    fn test_parse_uag_block() {
        let acl = AccessControl::parse(ACF);
        assert!(acl.is_admin("admin"));
        assert!(acl.is_admin("admin@yourdomain.com"));
        assert!(!acl.is_admin("mallory"));
    }

    #[test]
    fn test_authorize_requires_x509_method() {
        let acl = AccessControl::from_admins(["admin"]);

        let tls_admin = PeerCredentials::x509("admin", "site");
        acl.authorize(Some(&tls_admin)).unwrap();

        let basic_admin = PeerCredentials {
            method: "basic".to_string(),
            name: "admin".to_string(),
            organization: String::new(),
        };
        assert!(matches!(
            acl.authorize(Some(&basic_admin)),
            Err(CmsError::Unauthorized(_))
        ));

        let tls_outsider = PeerCredentials::x509("mallory", "site");
        assert!(acl.authorize(Some(&tls_outsider)).is_err());
        assert!(acl.authorize(None).is_err());
    }

    #[test]
    fn test_deny_all() {
        let acl = AccessControl::deny_all();
        let admin = PeerCredentials::x509("admin", "site");
        assert!(acl.authorize(Some(&admin)).is_err());
    }
}
