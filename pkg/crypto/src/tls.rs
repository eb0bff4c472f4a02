//! rustls setup shared by every TLS listener and dialer in the cluster.

/// Installs the `ring` crypto provider as the process default. rustls 0.22+
/// no longer picks one implicitly when more than one provider feature is
/// compiled in, so this must run once before any `rustls::ClientConfig` or
/// `ServerConfig` is built.
pub fn install_default_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
