use std::sync::Arc;

use tokio::sync::watch;

use pvsec_cms::{
    acl::AccessControl, bootstrap, db::CertDb, error::Result, logging, service::Cms,
    settings::Settings, sweep,
};
use pvsec_pki::pv::StatusHub;

#[tokio::main]
async fn main() {
    logging::init();
    if let Err(e) = run().await {
        tracing::error!(error = %e, "CMS failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config_path = std::env::var("PVSEC_CONFIG").ok();
    let settings = Settings::load(config_path.as_deref())?;

    let db = CertDb::open(&settings.db_filename)?;
    let ca = bootstrap::get_or_create_ca(&settings)?;

    let acl = match AccessControl::from_file(&settings.acf_filename) {
        Ok(acl) => acl,
        Err(e) => {
            tracing::warn!(
                file = %settings.acf_filename,
                error = %e,
                "no usable access control file, admin operations disabled"
            );
            AccessControl::deny_all()
        }
    };

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

    bootstrap::ensure_cms_certificate(&settings, &cms)?;

    // Recover any publication lost between a commit and a crash
    cms.republish_all();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweep_task = tokio::spawn(sweep::run(Arc::clone(&cms), shutdown_rx));

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);
    let _ = sweep_task.await;
    Ok(())
}
