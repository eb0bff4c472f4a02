pub mod ca;
pub mod error;
pub mod secrets;
pub mod tls;

pub use ca::{format_not_after, needs_rotation_at, CertificateAuthority, IssuedCert, SubjectClass};
pub use error::CryptoError;
pub use secrets::SecretsEngine;
pub use tls::install_default_crypto_provider;

pub use rcgen::SanType;
