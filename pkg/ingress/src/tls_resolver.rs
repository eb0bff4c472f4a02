//! SNI certificate lookup backed by the current routing table snapshot.

use std::sync::Arc;

use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

use crate::route::RoutingCell;

pub struct SniCertResolver {
    table: Arc<RoutingCell>,
}

impl SniCertResolver {
    pub fn new(table: Arc<RoutingCell>) -> Self {
        SniCertResolver { table }
    }
}

impl ResolvesServerCert for SniCertResolver {
    fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        let host = client_hello.server_name()?;
        let table = self.table.load();
        let (cert_pem, key_der) = table.cert_pems.get(host)?;
        load_certified_key(cert_pem, key_der)
    }
}

fn load_certified_key(cert_pem: &str, key_der: &[u8]) -> Option<Arc<CertifiedKey>> {
    let mut cert_reader = cert_pem.as_bytes();
    let certs: Vec<rustls::Certificate> =
        rustls_pemfile::certs(&mut cert_reader).ok()?.into_iter().map(rustls::Certificate).collect();
    if certs.is_empty() {
        return None;
    }
    let key = rustls::PrivateKey(key_der.to_vec());
    let signing_key = rustls::sign::any_supported_type(&key).ok()?;
    Some(Arc::new(CertifiedKey::new(certs, signing_key)))
}
