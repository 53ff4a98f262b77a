//! Process-wide rustls setup.

use crate::error::{HarnessError, Result};

/// Installs aws-lc-rs as the process-level rustls crypto provider unless
/// one is already set. kube and aws-sdk-s3 enable different rustls
/// backends, so rustls cannot pick one on its own and every TLS client
/// build would panic.
pub fn install_crypto_provider() -> Result<()> {
    if rustls::crypto::CryptoProvider::get_default().is_some() {
        return Ok(());
    }
    // A concurrent caller may win the race; only a missing provider is an error.
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(HarnessError::Config(
            "failed to install the rustls crypto provider".into(),
        ));
    }
    Ok(())
}
