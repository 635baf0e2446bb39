//! Certificate plane of a secure PVAccess runtime
//!
//! This crate holds the pieces shared by the certificate management service
//! and every relying party: the X.509 certificate factory with the custom
//! status extensions, the signed status token codec, the published status
//! value, and the peer status manager that gates TLS verify decisions on
//! fresh, verified revocation status.

pub mod ccr;
pub mod cert;
pub mod error;
pub mod pv;
pub mod status;
pub mod tls;
pub mod types;

pub use ccr::{CertCreationRequest, PeerCredentials, AUTH_TYPE_BASIC, AUTH_TYPE_X509};
pub use cert::{
    factory::{build_self_signed_ca, cert_and_chain_to_pem, generate_serial, CertFactory, CertUsage},
    issuer_id_from, CertSubject, Certificate,
};
pub use error::{PkiError, Result};
pub use status::{
    decode_and_verify, encode, to_wire, verify_wire_status, CertStatusFactory, CertStatusManager,
    ParsedStatus, StatusWireValue,
};
pub use types::{
    format_cert_time, now_utc, parse_cert_time, CertId, CertStatus, CertificateStatus, OcspStatus,
    CERT_REVOKE_ROOT, CERT_STATUS_ROOT, CERT_STATUS_WILDCARD,
};
