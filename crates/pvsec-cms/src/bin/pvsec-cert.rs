//! Certificate management tool
//!
//! Reads a certificate id from a keychain file or takes one on the command
//! line, then gets the certificate's current status or applies an admin
//! state change (approve, deny, revoke) using the operator's admin identity.

use std::{fs, path::PathBuf, process::exit};

use clap::Parser;

use pvsec_cms::{
    acl::AccessControl,
    bootstrap,
    db::CertDb,
    error::CmsError,
    logging,
    service::{CertAction, Cms},
    settings::Settings,
};
use pvsec_pki::{pv::StatusHub, CertId, Certificate, PeerCredentials, PkiError};

const EXIT_OK: i32 = 0;
const EXIT_OPTION_ERROR: i32 = 1;
const EXIT_INCOMPATIBLE_OPTIONS: i32 = 2;
const EXIT_CERT_FILE_ERROR: i32 = 3;
const EXIT_CMS_TIMEOUT: i32 = 4;
const EXIT_INTERRUPTED: i32 = 5;
const EXIT_OTHER: i32 = 6;

/// Certificate management utility for Secure PVAccess
#[derive(Parser)]
#[command(name = "pvsec-cert")]
struct Cli {
    /// Certificate file to act on (PEM; the embedded status PV names the
    /// certificate)
    #[arg(short = 'f', long)]
    file: Option<PathBuf>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Approve a certificate awaiting administrator approval
    #[arg(long)]
    approve: bool,

    /// Deny a certificate awaiting administrator approval
    #[arg(long)]
    deny: bool,

    /// Revoke a certificate
    #[arg(long)]
    revoke: bool,

    /// Target certificate id as issuer:serial (serial in decimal)
    cert_id: Option<String>,
}

fn main() {
    logging::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            exit(EXIT_OPTION_ERROR);
        }
    };

    let actions = [cli.approve, cli.deny, cli.revoke]
        .iter()
        .filter(|set| **set)
        .count();
    if actions > 1 {
        eprintln!("choose at most one of --approve, --deny, --revoke");
        exit(EXIT_INCOMPATIBLE_OPTIONS);
    }
    if cli.file.is_some() && cli.cert_id.is_some() {
        eprintln!("give either a certificate file or a certificate id, not both");
        exit(EXIT_INCOMPATIBLE_OPTIONS);
    }
    if cli.file.is_none() && cli.cert_id.is_none() {
        eprintln!("a certificate file (-f) or certificate id is required");
        exit(EXIT_OPTION_ERROR);
    }

    match run(cli) {
        Ok(()) => exit(EXIT_OK),
        Err(e) => {
            eprintln!("{e}");
            exit(exit_code(&e));
        }
    }
}

fn exit_code(e: &CmsError) -> i32 {
    match e {
        CmsError::Pki(PkiError::Timeout(_)) => EXIT_CMS_TIMEOUT,
        CmsError::IoError(io) if io.kind() == std::io::ErrorKind::Interrupted => EXIT_INTERRUPTED,
        CmsError::IoError(_)
        | CmsError::KeyError(_)
        | CmsError::Pki(PkiError::CertError(_))
        | CmsError::Pki(PkiError::MissingExtension(_))
        | CmsError::Pki(PkiError::MissingSki) => EXIT_CERT_FILE_ERROR,
        CmsError::MalformedRequest(_) | CmsError::ConfigError(_) => EXIT_OPTION_ERROR,
        _ => EXIT_OTHER,
    }
}

fn run(cli: Cli) -> Result<(), CmsError> {
    let settings = Settings::load(cli.config.as_deref())?;

    let target = target_cert_id(&cli)?;

    let db = CertDb::open(&settings.db_filename)?;
    let ca = bootstrap::load_keychain(&settings.ca_keychain)?;
    let acl = AccessControl::from_file(&settings.acf_filename)
        .unwrap_or_else(|_| AccessControl::deny_all());
    let hub = StatusHub::new();
    let cms = Cms::new(
        settings.clone(),
        db,
        ca.cert.clone(),
        ca.key.clone(),
        ca.chain.clone(),
        hub,
        acl,
    )?;

    let action = if cli.approve {
        Some(CertAction::Approve)
    } else if cli.deny {
        Some(CertAction::Deny)
    } else if cli.revoke {
        Some(CertAction::Revoke)
    } else {
        None
    };

    let wire = match action {
        None => cms.on_get_status(&target.status_pv())?,
        Some(action) => {
            let admin = bootstrap::load_keychain(&settings.admin_keychain)?;
            let subject = admin.cert.subject()?;
            let peer = PeerCredentials::x509(subject.common_name, subject.organization);
            cms.on_revoke(&target, action, Some(&peer))?
        }
    };

    println!("Certificate ID: {target}");
    println!("Status:         {}", wire.state);
    println!("OCSP status:    {}", wire.ocsp_state);
    if !wire.ocsp_status_date.is_empty() {
        println!("Status date:    {}", wire.ocsp_status_date);
    }
    if !wire.ocsp_certified_until.is_empty() {
        println!("Valid until:    {}", wire.ocsp_certified_until);
    }
    if !wire.ocsp_revocation_date.is_empty() {
        println!("Revoked:        {}", wire.ocsp_revocation_date);
    }
    Ok(())
}

fn target_cert_id(cli: &Cli) -> Result<CertId, CmsError> {
    if let Some(file) = &cli.file {
        let text = fs::read_to_string(file)?;
        let block = pem::parse_many(&text)
            .map_err(|e| CmsError::Pki(PkiError::CertError(format!("bad PEM file: {e}"))))?
            .into_iter()
            .find(|b| b.tag() == "CERTIFICATE")
            .ok_or_else(|| {
                CmsError::Pki(PkiError::CertError("no certificate in file".to_string()))
            })?;
        let cert = Certificate::from_der(block.contents())?;
        return Ok(cert.cert_id()?);
    }

    let raw = cli.cert_id.as_deref().unwrap_or_default();
    let (issuer_id, serial) = raw.split_once(':').ok_or_else(|| {
        CmsError::MalformedRequest(format!("certificate id {raw:?} is not issuer:serial"))
    })?;
    let serial = serial.parse::<u64>().map_err(|e| {
        CmsError::MalformedRequest(format!("bad serial in certificate id {raw:?}: {e}"))
    })?;
    Ok(CertId::new(issuer_id, serial))
}
