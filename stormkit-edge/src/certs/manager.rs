//! On-demand certificate issuance.
//!
//! The TLS listener asks [`CertManager::obtain`] for a certificate during
//! the handshake. The decision function gates which hostnames may trigger
//! issuance; issuance itself runs under a cluster-wide storage lock so
//! replicas never double-issue. HTTP-01 answers are served from the
//! challenge token map; the managed wildcard domain uses DNS-01 through
//! the platform DNS provider.

use super::dns::{DnsProvider, DnsRecord};
use super::store::{CertStorage, StorageError};
use crate::admin::AdminStore;
use crate::hosts::{HostResolver, Resolution, normalize_host};
use dashmap::DashMap;
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
    RetryPolicy,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

const ACCOUNT_KEY: &str = "account/credentials.json";
const CERTS_DIR: &str = "certificates";

/// Certificates are renewed when fewer days than this remain.
const RENEW_BEFORE_DAYS: i64 = 30;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("certificate denied: {0}")]
    Denied(String),

    #[error("ACME account not registered")]
    NotRegistered,

    #[error("challenge failed: {0}")]
    ChallengeFailed(String),

    #[error("order not ready: {0}")]
    OrderNotReady(String),

    #[error("no usable challenge offered")]
    NoChallenge,

    #[error("invalid domain: {0}")]
    InvalidDomain(String),

    #[error("dns provider required for dns-01 issuance")]
    NoDnsProvider,

    #[error("ACME error: {0}")]
    Acme(#[from] instant_acme::Error),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// PEM certificate chain + private key, as served to the TLS stack.
#[derive(Debug, Clone)]
pub struct CertPair {
    pub cert_pem: String,
    pub key_pem: String,
}

impl CertPair {
    /// Days until the leaf certificate expires; negative once expired,
    /// zero when the chain cannot be parsed.
    pub fn days_until_expiry(&self) -> i64 {
        let Some(expires_at) = parse_cert_expiry(&self.cert_pem) else {
            return 0;
        };
        (expires_at - OffsetDateTime::now_utc()).whole_days()
    }
}

/// token → key authorization, consulted by the HTTP-01 handler.
pub type ChallengeTokens = Arc<RwLock<HashMap<String, String>>>;

#[derive(Debug, Clone)]
pub struct CertManagerConfig {
    pub staging: bool,
    pub email: Option<String>,
    /// Root of the managed dev domain; hosts under it share a wildcard
    /// certificate issued via DNS-01.
    pub managed_wildcard: Option<String>,
    /// Ceiling for ACME order polling.
    pub timeout: Duration,
}

impl Default for CertManagerConfig {
    fn default() -> Self {
        Self {
            staging: false,
            email: None,
            managed_wildcard: None,
            timeout: Duration::from_secs(300),
        }
    }
}

impl CertManagerConfig {
    pub fn directory_url(&self) -> String {
        if self.staging {
            "https://acme-staging-v02.api.letsencrypt.org/directory".to_string()
        } else {
            "https://acme-v02.api.letsencrypt.org/directory".to_string()
        }
    }
}

pub struct CertManager {
    config: CertManagerConfig,
    storage: Arc<CertStorage>,
    admin: Arc<AdminStore>,
    resolver: Arc<HostResolver>,
    dns: Option<DnsProvider>,
    challenge_tokens: ChallengeTokens,
    account: tokio::sync::RwLock<Option<Account>>,
    /// Hot in-memory cache, host → pair.
    cached: DashMap<String, Arc<CertPair>>,
}

impl CertManager {
    pub fn new(
        config: CertManagerConfig,
        storage: Arc<CertStorage>,
        admin: Arc<AdminStore>,
        resolver: Arc<HostResolver>,
        dns: Option<DnsProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            storage,
            admin,
            resolver,
            dns,
            challenge_tokens: Arc::new(RwLock::new(HashMap::new())),
            account: tokio::sync::RwLock::new(None),
            cached: DashMap::new(),
        })
    }

    pub fn challenge_tokens(&self) -> ChallengeTokens {
        self.challenge_tokens.clone()
    }

    /// Key authorization for an HTTP-01 token, if we issued it.
    pub fn challenge_response(&self, token: &str) -> Option<String> {
        self.challenge_tokens.read().get(token).cloned()
    }

    /// Load the ACME account from shared storage or create a new one.
    pub async fn init(&self) -> Result<(), CertError> {
        match self.storage.load(ACCOUNT_KEY).await {
            Ok(raw) => {
                let credentials: instant_acme::AccountCredentials = serde_json::from_slice(&raw)
                    .map_err(|e| CertError::ChallengeFailed(format!("invalid credentials: {e}")))?;
                let account = Account::builder()?.from_credentials(credentials).await?;
                tracing::info!("loaded existing ACME account");
                *self.account.write().await = Some(account);
                return Ok(());
            }
            Err(StorageError::NotExist) => {}
            Err(e) => return Err(e.into()),
        }

        let contact = self.config.email.as_ref().map(|e| format!("mailto:{e}"));
        let contact_refs: Vec<&str> = contact.as_ref().map(|c| vec![c.as_str()]).unwrap_or_default();

        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };
        let (account, credentials) = Account::builder()?
            .create(&new_account, self.config.directory_url(), None)
            .await?;

        let serialized = serde_json::to_vec(&credentials)
            .map_err(|e| CertError::ChallengeFailed(format!("cannot serialize credentials: {e}")))?;
        self.storage.store(ACCOUNT_KEY, &serialized).await?;

        tracing::info!(staging = self.config.staging, "created new ACME account");
        *self.account.write().await = Some(account);
        Ok(())
    }

    /// Decide whether a hostname may obtain a certificate.
    ///
    /// Allowed: configured proxy rules, internal endpoints, tenant apps
    /// with a deployment and no custom certificate. Denied: localhost,
    /// literal IPs, unknown hosts, custom-certificate hosts and apps
    /// without a deployment.
    pub async fn decide(&self, host_name: &str) -> Result<(), CertError> {
        let host = normalize_host(host_name);
        let admin = self.admin.config();

        if admin.proxy_rules.contains_key(&host) {
            return Ok(());
        }

        if host == "localhost" {
            return Err(CertError::Denied(
                "localhost is not a valid host name".to_string(),
            ));
        }

        if host.parse::<std::net::IpAddr>().is_ok() {
            return Err(CertError::InvalidDomain(host));
        }

        match self.resolver.resolve(&host).await {
            Resolution::Proxy(_) | Resolution::Internal(_) => Ok(()),
            Resolution::Tenant(tenant) => {
                if tenant.config.has_custom_certificate() {
                    return Err(CertError::Denied(
                        "custom certificate provided - aborting automatic process".to_string(),
                    ));
                }
                if tenant.config.deployment_id.is_zero() {
                    return Err(CertError::Denied("deployment not found".to_string()));
                }
                tracing::debug!(host, "certificate issuance allowed");
                Ok(())
            }
            Resolution::NotFound => Err(CertError::Denied(format!(
                "domain {host} is not allowed for requesting a certificate"
            ))),
        }
    }

    /// Certificate for a handshake. Serves from the hot cache, then the
    /// tenant's custom certificate, then shared storage; issues on demand
    /// under the cluster-wide lock as a last resort.
    pub async fn obtain(&self, host_name: &str) -> Result<Arc<CertPair>, CertError> {
        let host = normalize_host(host_name);
        let subject = self.certificate_subject(&host);

        if let Some(cached) = self.cached.get(&subject) {
            if cached.days_until_expiry() > 0 {
                return Ok(cached.clone());
            }
        }

        // Custom certificates short-circuit issuance entirely.
        if let Some(config) = self.resolver.config_for(&host).await {
            if config.has_custom_certificate() {
                let pair = Arc::new(CertPair {
                    cert_pem: config.cert_value.clone(),
                    key_pem: config.cert_key.clone(),
                });
                self.cached.insert(subject, pair.clone());
                return Ok(pair);
            }
        }

        if let Some(pair) = self.load_stored(&subject).await? {
            if pair.days_until_expiry() > 0 {
                let pair = Arc::new(pair);
                self.cached.insert(subject, pair.clone());
                return Ok(pair);
            }
        }

        let use_dns = subject.starts_with("*.");
        if !use_dns {
            // The platform owns the managed wildcard; tenants must pass
            // the decision function.
            self.decide(&host).await?;
        }

        let lock_name = format!("issue-{subject}");
        self.storage.lock(&lock_name).await?;

        let issued = async {
            // Another replica may have issued while we waited.
            if let Some(pair) = self.load_stored(&subject).await? {
                if pair.days_until_expiry() > RENEW_BEFORE_DAYS {
                    return Ok(pair);
                }
            }

            let pair = self.issue(&subject, use_dns).await?;
            self.store_pair(&subject, &pair).await?;
            Ok::<_, CertError>(pair)
        }
        .await;

        self.storage.unlock(&lock_name).await?;

        let pair = Arc::new(issued?);
        self.cached.insert(subject, pair.clone());
        Ok(pair)
    }

    /// The certificate subject serving a host: itself, or the managed
    /// wildcard when the host sits under the managed dev domain.
    fn certificate_subject(&self, host: &str) -> String {
        if let Some(root) = &self.config.managed_wildcard {
            if host == root || host.ends_with(&format!(".{root}")) {
                return format!("*.{root}");
            }
        }
        host.to_string()
    }

    async fn load_stored(&self, subject: &str) -> Result<Option<CertPair>, CertError> {
        let base = format!("{CERTS_DIR}/{}", storage_name(subject));
        let cert = match self.storage.load(&format!("{base}/fullchain.pem")).await {
            Ok(raw) => raw,
            Err(StorageError::NotExist) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let key = match self.storage.load(&format!("{base}/privkey.pem")).await {
            Ok(raw) => raw,
            Err(StorageError::NotExist) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(Some(CertPair {
            cert_pem: String::from_utf8_lossy(&cert).to_string(),
            key_pem: String::from_utf8_lossy(&key).to_string(),
        }))
    }

    async fn store_pair(&self, subject: &str, pair: &CertPair) -> Result<(), CertError> {
        let base = format!("{CERTS_DIR}/{}", storage_name(subject));
        self.storage
            .store(&format!("{base}/fullchain.pem"), pair.cert_pem.as_bytes())
            .await?;
        self.storage
            .store(&format!("{base}/privkey.pem"), pair.key_pem.as_bytes())
            .await?;
        Ok(())
    }

    async fn issue(&self, domain: &str, use_dns: bool) -> Result<CertPair, CertError> {
        if domain.is_empty() || domain.contains('/') || domain.starts_with('.') {
            return Err(CertError::InvalidDomain(domain.to_string()));
        }

        let account = {
            let guard = self.account.read().await;
            guard.clone().ok_or(CertError::NotRegistered)?
        };

        tracing::info!(domain, use_dns, "requesting certificate via ACME");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let new_order = NewOrder::new(&identifiers);
        let mut order = account.new_order(&new_order).await?;

        let mut dns_cleanup: Vec<DnsRecord> = Vec::new();

        let mut authorizations = order.authorizations();
        while let Some(auth_result) = authorizations.next().await {
            let mut auth = auth_result?;

            match auth.status {
                AuthorizationStatus::Pending => {
                    if use_dns {
                        let mut challenge = auth
                            .challenge(ChallengeType::Dns01)
                            .ok_or(CertError::NoChallenge)?;
                        let value = challenge.key_authorization().dns_value();

                        let zone = domain.trim_start_matches("*.");
                        let record = DnsRecord::txt("_acme-challenge", &value);
                        let dns = self.dns.as_ref().ok_or(CertError::NoDnsProvider)?;
                        dns.append_records(zone, vec![record.clone()])
                            .await
                            .map_err(|e| CertError::ChallengeFailed(e.to_string()))?;
                        dns_cleanup.push(record);

                        challenge.set_ready().await?;
                    } else {
                        let mut challenge = auth
                            .challenge(ChallengeType::Http01)
                            .ok_or(CertError::NoChallenge)?;
                        let key_auth = challenge.key_authorization();
                        let token = challenge.token.clone();

                        self.challenge_tokens
                            .write()
                            .insert(token.clone(), key_auth.as_str().to_string());

                        tracing::info!(
                            domain,
                            "HTTP-01 challenge ready at /.well-known/acme-challenge/{token}"
                        );
                        challenge.set_ready().await?;
                    }
                }
                AuthorizationStatus::Valid => {
                    tracing::debug!(domain, "authorization already valid");
                }
                status => {
                    self.cleanup_challenges(domain, &dns_cleanup).await;
                    return Err(CertError::ChallengeFailed(format!(
                        "unexpected authorization status: {status:?}"
                    )));
                }
            }
        }
        drop(authorizations);

        let retry_policy = RetryPolicy::new().timeout(self.config.timeout);
        let order_status = order.poll_ready(&retry_policy).await?;

        let finalize_result = match order_status {
            OrderStatus::Ready => {
                let private_key_pem = order.finalize().await?;
                let cert_chain = order.poll_certificate(&retry_policy).await?;
                Ok(CertPair {
                    cert_pem: cert_chain,
                    key_pem: private_key_pem,
                })
            }
            OrderStatus::Invalid => Err(CertError::ChallengeFailed(
                "order became invalid".to_string(),
            )),
            status => Err(CertError::OrderNotReady(format!("{status:?}"))),
        };

        self.cleanup_challenges(domain, &dns_cleanup).await;

        let pair = finalize_result?;
        tracing::info!(
            domain,
            expires_in_days = pair.days_until_expiry(),
            "certificate issued successfully"
        );
        Ok(pair)
    }

    async fn cleanup_challenges(&self, domain: &str, dns_records: &[DnsRecord]) {
        self.challenge_tokens.write().clear();

        if !dns_records.is_empty() {
            if let Some(dns) = &self.dns {
                let zone = domain.trim_start_matches("*.");
                if let Err(e) = dns.delete_records(zone, dns_records.to_vec()).await {
                    tracing::warn!(domain, "cannot remove dns challenge records: {e}");
                }
            }
        }
    }

    /// Renew every stored certificate close to expiry. Returns how many
    /// renewals were attempted.
    pub async fn check_renewals(&self) -> usize {
        let subjects = match self.storage.list(CERTS_DIR, false).await {
            Ok(dirs) => dirs,
            Err(e) => {
                tracing::error!("cannot list stored certificates: {e}");
                return 0;
            }
        };

        let mut attempted = 0;
        for dir in subjects {
            let Some(name) = dir.strip_prefix(&format!("{CERTS_DIR}/")) else {
                continue;
            };
            let subject = display_name(name);

            let pair = match self.load_stored(&subject).await {
                Ok(Some(pair)) => pair,
                _ => continue,
            };

            if pair.days_until_expiry() >= RENEW_BEFORE_DAYS {
                continue;
            }

            tracing::info!(
                subject,
                days = pair.days_until_expiry(),
                "certificate needs renewal"
            );
            attempted += 1;

            let use_dns = subject.starts_with("*.");
            match self.issue(&subject, use_dns).await {
                Ok(renewed) => {
                    if let Err(e) = self.store_pair(&subject, &renewed).await {
                        tracing::error!(subject, "cannot store renewed certificate: {e}");
                        continue;
                    }
                    self.cached.insert(subject.clone(), Arc::new(renewed));
                }
                Err(e) => tracing::error!(subject, "certificate renewal failed: {e}"),
            }
        }

        attempted
    }
}

/// Storage-safe directory name for a subject (`*.x` → `wildcard_.x`).
fn storage_name(subject: &str) -> String {
    subject.replace("*.", "wildcard_.")
}

fn display_name(storage: &str) -> String {
    storage.replace("wildcard_.", "*.")
}

/// Not-after timestamp of the first certificate in a PEM chain.
fn parse_cert_expiry(pem_data: &str) -> Option<OffsetDateTime> {
    use x509_parser::prelude::*;

    for pem in Pem::iter_from_buffer(pem_data.as_bytes()).flatten() {
        if pem.label == "CERTIFICATE" {
            if let Ok((_, cert)) = parse_x509_certificate(&pem.contents) {
                let timestamp = cert.validity().not_after.timestamp();
                return OffsetDateTime::from_unix_timestamp(timestamp).ok();
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::{AdminConfig, ProxyRule};
    use crate::hosts::ConfigSource;
    use stormkit_core::{AppConfig, DeploymentId};
    use stormkit_storage::Kv;

    fn self_signed(host: &str) -> CertPair {
        let key = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        CertPair {
            cert_pem: key.cert.pem(),
            key_pem: key.signing_key.serialize_pem(),
        }
    }

    fn manager_with(
        tenants: Vec<(&str, AppConfig)>,
        proxy_hosts: Vec<&str>,
        managed_wildcard: Option<&str>,
    ) -> Arc<CertManager> {
        let proxy_rules: HashMap<String, ProxyRule> = proxy_hosts
            .into_iter()
            .map(|h| (h.to_string(), ProxyRule::default()))
            .collect();
        let admin = AdminStore::new(move || AdminConfig {
            proxy_rules: proxy_rules.clone(),
            ..Default::default()
        });

        let map: HashMap<String, AppConfig> = tenants
            .into_iter()
            .map(|(h, c)| (h.to_string(), c))
            .collect();
        let resolver = HostResolver::new(admin.clone(), ConfigSource::Static(map));

        CertManager::new(
            CertManagerConfig {
                managed_wildcard: managed_wildcard.map(String::from),
                ..Default::default()
            },
            Arc::new(CertStorage::new(Kv::in_memory())),
            admin,
            resolver,
            None,
        )
    }

    fn deployed_config() -> AppConfig {
        AppConfig {
            deployment_id: DeploymentId(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_decide_allows_deployed_tenant() {
        let manager = manager_with(vec![("www.tenant.org", deployed_config())], vec![], None);
        assert!(manager.decide("www.tenant.org").await.is_ok());
    }

    #[tokio::test]
    async fn test_decide_allows_proxy_rule_host() {
        let manager = manager_with(vec![], vec!["proxied.example.org"], None);
        assert!(manager.decide("proxied.example.org").await.is_ok());
    }

    #[tokio::test]
    async fn test_decide_denies_localhost_and_ips() {
        let manager = manager_with(vec![], vec![], None);
        assert!(matches!(
            manager.decide("localhost").await,
            Err(CertError::Denied(_))
        ));
        assert!(matches!(
            manager.decide("203.0.113.4").await,
            Err(CertError::InvalidDomain(_))
        ));
    }

    #[tokio::test]
    async fn test_decide_denies_unknown_host() {
        let manager = manager_with(vec![], vec![], None);
        assert!(matches!(
            manager.decide("unknown.example.org").await,
            Err(CertError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn test_decide_denies_custom_certificate() {
        let mut config = deployed_config();
        config.cert_key = "KEY".to_string();
        config.cert_value = "CERT".to_string();

        let manager = manager_with(vec![("www.tenant.org", config)], vec![], None);
        assert!(matches!(
            manager.decide("www.tenant.org").await,
            Err(CertError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn test_decide_denies_missing_deployment() {
        let manager = manager_with(vec![("www.tenant.org", AppConfig::default())], vec![], None);
        assert!(matches!(
            manager.decide("www.tenant.org").await,
            Err(CertError::Denied(_))
        ));
    }

    #[tokio::test]
    async fn test_obtain_serves_custom_certificate() {
        let pair = self_signed("www.tenant.org");
        let mut config = deployed_config();
        config.cert_value = pair.cert_pem.clone();
        config.cert_key = pair.key_pem.clone();

        let manager = manager_with(vec![("www.tenant.org", config)], vec![], None);
        let served = manager.obtain("www.tenant.org").await.unwrap();
        assert_eq!(served.cert_pem, pair.cert_pem);
    }

    #[tokio::test]
    async fn test_obtain_serves_stored_certificate() {
        let manager = manager_with(vec![("www.tenant.org", deployed_config())], vec![], None);
        let pair = self_signed("www.tenant.org");
        manager.store_pair("www.tenant.org", &pair).await.unwrap();

        let served = manager.obtain("www.tenant.org").await.unwrap();
        assert_eq!(served.cert_pem, pair.cert_pem);

        // Second call hits the hot cache.
        let again = manager.obtain("www.tenant.org").await.unwrap();
        assert!(Arc::ptr_eq(&served, &again));
    }

    #[tokio::test]
    async fn test_managed_wildcard_subject_mapping() {
        let manager = manager_with(vec![], vec![], Some("dev.stormkit.example"));
        assert_eq!(
            manager.certificate_subject("app--1.dev.stormkit.example"),
            "*.dev.stormkit.example"
        );
        assert_eq!(
            manager.certificate_subject("www.other.org"),
            "www.other.org"
        );
    }

    #[tokio::test]
    async fn test_wildcard_hosts_share_stored_certificate() {
        let manager = manager_with(vec![], vec![], Some("dev.stormkit.example"));
        let pair = self_signed("*.dev.stormkit.example");
        manager
            .store_pair("*.dev.stormkit.example", &pair)
            .await
            .unwrap();

        let a = manager.obtain("app--1.dev.stormkit.example").await.unwrap();
        let b = manager.obtain("app--2.dev.stormkit.example").await.unwrap();
        assert_eq!(a.cert_pem, pair.cert_pem);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_days_until_expiry_for_fresh_self_signed() {
        let pair = self_signed("x.example.org");
        assert!(pair.days_until_expiry() > 0);
    }

    #[test]
    fn test_storage_name_round_trip() {
        assert_eq!(storage_name("*.dev.example"), "wildcard_.dev.example");
        assert_eq!(display_name("wildcard_.dev.example"), "*.dev.example");
        assert_eq!(storage_name("plain.example"), "plain.example");
    }
}
