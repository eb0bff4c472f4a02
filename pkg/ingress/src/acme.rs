//! HTTP-01 ACME issuance for ingresses with `auto_tls=true`. Orders for a
//! given host serialize on a per-host mutex so a flurry of routing-table
//! rebuilds never races two orders for the same host.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt, NewAccount, NewOrder, OrderStatus,
};
use tracing::{info, warn};

use crate::error::IngressError;

const RENEWAL_WINDOW_DAYS: i64 = 30;

/// Tokens currently awaiting HTTP-01 validation, served from
/// `/.well-known/acme-challenge/<token>` independent of the routing table.
#[derive(Default, Clone)]
pub struct ChallengeStore {
    inner: Arc<Mutex<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub fn insert(&self, token: String, key_authorization: String) {
        self.inner.lock().unwrap().insert(token, key_authorization);
    }

    pub fn remove(&self, token: &str) {
        self.inner.lock().unwrap().remove(token);
    }

    pub fn get(&self, token: &str) -> Option<String> {
        self.inner.lock().unwrap().get(token).cloned()
    }
}

pub struct AcmeClient {
    account: Account,
    challenges: ChallengeStore,
    host_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl AcmeClient {
    /// The challenge store this client publishes HTTP-01 key authorizations
    /// into; the ingress HTTP listener must serve from this same instance.
    pub fn challenges(&self) -> ChallengeStore {
        self.challenges.clone()
    }
}

pub struct IssuedCertificate {
    pub cert_pem: String,
    pub key_der: Vec<u8>,
    pub not_after: DateTime<Utc>,
}

impl AcmeClient {
    pub async fn new(contact_email: &str, challenges: ChallengeStore) -> Result<Self, IngressError> {
        let contact = format!("mailto:{contact_email}");
        let (account, _credentials) = Account::create(
            &NewAccount { contact: &[&contact], terms_of_service_agreed: true, only_return_existing: false },
            LetsEncrypt::Production.url(),
            None,
        )
        .await
        .map_err(|e| IngressError::Acme(e.to_string()))?;

        Ok(AcmeClient { account, challenges, host_locks: Mutex::new(HashMap::new()) })
    }

    fn lock_for(&self, host: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.host_locks.lock().unwrap().entry(host.to_string()).or_insert_with(Default::default).clone()
    }

    /// Issues a cert for `host` via HTTP-01, serving the challenge response
    /// from the challenge store the ingress HTTP listener consults.
    pub async fn issue(&self, host: &str) -> Result<IssuedCertificate, IngressError> {
        let lock = self.lock_for(host);
        let _guard = lock.lock().await;

        let identifier = Identifier::Dns(host.to_string());
        let mut order = self
            .account
            .new_order(&NewOrder { identifiers: &[identifier] })
            .await
            .map_err(|e| IngressError::Acme(e.to_string()))?;

        let authorizations = order.authorizations().await.map_err(|e| IngressError::Acme(e.to_string()))?;
        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| IngressError::Acme("no http-01 challenge offered".into()))?;
            let key_auth = order.key_authorization(challenge);
            self.challenges.insert(challenge.token.clone(), key_auth.as_str().to_string());
            order.set_challenge_ready(&challenge.url).await.map_err(|e| IngressError::Acme(e.to_string()))?;
        }

        let status = poll_until_ready(&mut order).await?;
        if status != OrderStatus::Ready {
            return Err(IngressError::Acme(format!("order for {host} never became ready: {status:?}")));
        }

        let private_key_der = order.finalize().await.map_err(|e| IngressError::Acme(e.to_string()))?;
        let cert_pem = loop {
            match order.certificate().await.map_err(|e| IngressError::Acme(e.to_string()))? {
                Some(cert) => break cert,
                None => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        };

        for authz in &authorizations {
            if let Some(challenge) = authz.challenges.iter().find(|c| c.r#type == ChallengeType::Http01) {
                self.challenges.remove(&challenge.token);
            }
        }

        info!(host, "issued certificate via acme http-01");
        Ok(IssuedCertificate { cert_pem, key_der: private_key_der, not_after: Utc::now() + chrono::Duration::days(90) })
    }
}

async fn poll_until_ready(order: &mut instant_acme::Order) -> Result<OrderStatus, IngressError> {
    for _ in 0..20 {
        let state = order.refresh().await.map_err(|e| IngressError::Acme(e.to_string()))?;
        match state.status {
            OrderStatus::Ready | OrderStatus::Valid | OrderStatus::Invalid => return Ok(state.status),
            _ => tokio::time::sleep(Duration::from_secs(2)).await,
        }
    }
    warn!("acme order polling exhausted retries");
    Ok(OrderStatus::Pending)
}

pub fn needs_renewal(not_after: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    not_after - now < chrono::Duration::days(RENEWAL_WINDOW_DAYS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cert_within_window_needs_renewal() {
        let now = Utc::now();
        assert!(needs_renewal(now + chrono::Duration::days(10), now));
        assert!(!needs_renewal(now + chrono::Duration::days(60), now));
    }
}
