use std::sync::OnceLock;
use std::time::Duration;

use tracing::debug;

pub fn install_rustls_provider() {
    static PROVIDER_INSTALLED: OnceLock<()> = OnceLock::new();
    PROVIDER_INSTALLED.get_or_init(|| {
        if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
            // Can happen if another crate installed it first.
            debug!(existing_provider = ?e, "rustls CryptoProvider already installed");
        }
    });
}

/// Build the shared `reqwest::Client` for upstream APIs.
pub fn build_api_client(request_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    install_rustls_provider();

    let mut builder = reqwest::Client::builder()
        .user_agent(concat!("vod-archiver/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(Duration::from_secs(10));
    if request_timeout > Duration::ZERO {
        builder = builder.timeout(request_timeout);
    }
    builder.build()
}
