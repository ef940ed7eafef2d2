use std::sync::OnceLock;

/// rustls 0.23 needs a process-level CryptoProvider picked once.
///
/// When a dependency tree enables both providers (`ring` and `aws-lc-rs`),
/// rustls cannot infer a default and panics on the first TLS config build, so
/// we install `ring` explicitly before any connection attempt.
pub fn install_rustls_crypto_provider() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        // Err(...) here just means another part of the process won the race.
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}
