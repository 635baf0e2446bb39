//! Certificate management service for Secure PVAccess
//!
//! The durable authority of the certificate plane: it mints end-entity
//! certificates, keeps their lifecycle in a transactional ledger, signs
//! status tokens on demand and broadcasts every state change on the status
//! PVs.

pub mod acl;
pub mod bootstrap;
pub mod db;
pub mod error;
pub mod logging;
pub mod service;
pub mod settings;
pub mod sweep;

pub use acl::AccessControl;
pub use bootstrap::{ensure_cms_certificate, get_or_create_ca, load_keychain, Keychain};
pub use db::{CertDb, CertRecord, DuplicateKind};
pub use error::{CmsError, Result};
pub use service::{CertAction, Cms, CreateResponse};
pub use settings::Settings;
