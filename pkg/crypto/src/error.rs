#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::RcgenError),

    #[error("rsa key generation failed: {0}")]
    RsaKeygen(rsa::errors::Error),

    #[error("pkcs8 encoding failed: {0}")]
    Pkcs8(rsa::pkcs8::Error),

    #[error("secret encryption failed")]
    Encrypt,

    #[error("secret decryption failed, wrong key or corrupt ciphertext")]
    Decrypt,

    #[error("ciphertext shorter than nonce frame")]
    Truncated,
}
