//! The ACME protocol state machine: directory -> account -> order ->
//! authorization -> challenge -> finalize -> certificate -> (revoke). This is
//! the one place that knows the order operations happen in; every other
//! module is a leaf it calls into.

use std::thread;
use std::time::Duration;

use log::{info, warn};
use openssl::ec::EcKey;
use openssl::pkey::Private;
use openssl::x509::X509;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::challenge::{self, Challenge, ChallengeType};
use crate::dns::DnsResponder;
use crate::error::{Error, Result};
use crate::http_responder::HttpResponder;
use crate::jose;
use crate::transport::{Auth, Endpoints, Transport, TransportConfig};
use crate::util::{b64, build_csr, ecdsa_private_key_pem, split_pem_chain};

const DEFAULT_MAX_AUTH_POLLS: u32 = 10;
const DEFAULT_MAX_ORDER_POLLS: u32 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct Identifier {
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub value: String,
}

impl Identifier {
    pub fn dns(domain: impl Into<String>) -> Self {
        Identifier {
            type_: "dns",
            value: domain.into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Ready,
    Processing,
    Valid,
    Invalid,
}

impl OrderStatus {
    fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Ready => "ready",
            OrderStatus::Processing => "processing",
            OrderStatus::Valid => "valid",
            OrderStatus::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Deserialize)]
struct OrderDto {
    status: OrderStatus,
    #[serde(default)]
    authorizations: Vec<String>,
    finalize: String,
    #[serde(default)]
    certificate: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Order {
    pub url: String,
    pub status: OrderStatus,
    pub domains: Vec<String>,
    pub authorization_urls: Vec<String>,
    pub finalize_url: String,
    pub certificate_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthorizationStatus {
    Pending,
    Valid,
    Invalid,
    Deactivated,
    Expired,
    Revoked,
}

impl AuthorizationStatus {
    fn as_str(&self) -> &'static str {
        match self {
            AuthorizationStatus::Pending => "pending",
            AuthorizationStatus::Valid => "valid",
            AuthorizationStatus::Invalid => "invalid",
            AuthorizationStatus::Deactivated => "deactivated",
            AuthorizationStatus::Expired => "expired",
            AuthorizationStatus::Revoked => "revoked",
        }
    }
}

#[derive(Debug, Deserialize)]
struct IdentifierDto {
    value: String,
}

#[derive(Debug, Deserialize)]
struct AuthorizationDto {
    status: AuthorizationStatus,
    identifier: IdentifierDto,
    challenges: Vec<Challenge>,
}

pub struct Authorization {
    pub url: String,
    pub domain: String,
    pub challenges: Vec<Challenge>,
}

/// Where the issued certificate chain and its key end up - the core hands
/// this back to the CLI, which is the one that writes files.
pub struct IssuedCertificate {
    pub pem_chain: String,
    pub certificate_key: EcKey<Private>,
}

pub struct AcmeClientConfig {
    pub challenge_mode: ChallengeType,
    pub domains: Vec<String>,
    pub transport: TransportConfig,
}

/// Drives the full protocol lifecycle for one order. Owns the account key,
/// the nonce/endpoint state (via `Transport`), and the current order; holds
/// non-owning references to the two responders.
pub struct AcmeClient {
    transport: Transport,
    account_key: EcKey<Private>,
    account_url: Option<String>,
    endpoints: Option<Endpoints>,
    challenge_mode: ChallengeType,
    domains: Vec<String>,
}

impl AcmeClient {
    pub fn new(config: &AcmeClientConfig) -> Result<Self> {
        if config.domains.is_empty() {
            return Err(Error::Config("at least one --domain is required".into()));
        }

        Ok(AcmeClient {
            transport: Transport::new(&config.transport)?,
            account_key: jose::generate_p256_key()?,
            account_url: None,
            endpoints: None,
            challenge_mode: config.challenge_mode,
            domains: config.domains.clone(),
        })
    }

    fn endpoints(&self) -> Result<&Endpoints> {
        self.endpoints
            .as_ref()
            .ok_or(Error::State("directory has not been fetched yet"))
    }

    fn account_url(&self) -> Result<&str> {
        self.account_url
            .as_deref()
            .ok_or(Error::State("account has not been created yet"))
    }

    pub fn fetch_directory(&mut self, url: &str) -> Result<()> {
        info!("fetching directory from {}", url);
        self.endpoints = Some(self.transport.fetch_directory(url)?);
        Ok(())
    }

    pub fn create_account(&mut self) -> Result<()> {
        let new_account_url = self.endpoints()?.new_account.clone();
        let new_nonce_url = self.endpoints()?.new_nonce.clone();

        info!("creating account at {}", new_account_url);
        let response = self.transport.signed_post(
            &new_nonce_url,
            &new_account_url,
            &self.account_key,
            Auth::Jwk(&self.account_key),
            Some(&json!({ "termsOfServiceAgreed": true })),
            &[],
        )?;

        if response.status != 201 {
            return Err(Error::UnexpectedStatus {
                url: new_account_url,
                status: response.status,
                body: String::from_utf8_lossy(&response.body).to_string(),
            });
        }

        self.account_url = Some(
            response
                .location
                .ok_or_else(|| Error::MissingHeader(new_account_url, "Location"))?,
        );
        Ok(())
    }

    pub fn create_order(&self, domains: &[String]) -> Result<Order> {
        let new_order_url = self.endpoints()?.new_order.clone();
        let new_nonce_url = self.endpoints()?.new_nonce.clone();
        let account_url = self.account_url()?.to_string();

        let identifiers: Vec<Identifier> = domains.iter().cloned().map(Identifier::dns).collect();
        info!("creating order for {:?}", domains);

        let response = self.transport.signed_post(
            &new_nonce_url,
            &new_order_url,
            &self.account_key,
            Auth::Kid(&account_url),
            Some(&json!({ "identifiers": identifiers })),
            &[],
        )?;

        if response.status != 201 {
            return Err(Error::UnexpectedStatus {
                url: new_order_url,
                status: response.status,
                body: String::from_utf8_lossy(&response.body).to_string(),
            });
        }

        let order_url = response
            .location
            .clone()
            .ok_or_else(|| Error::MissingHeader(new_order_url.clone(), "Location"))?;
        let dto: OrderDto = response.json()?;

        Ok(Order {
            url: order_url,
            status: dto.status,
            domains: domains.to_vec(),
            authorization_urls: dto.authorizations,
            finalize_url: dto.finalize,
            certificate_url: dto.certificate,
        })
    }

    pub fn get_authorization(&self, authorization_url: &str) -> Result<Authorization> {
        let new_nonce_url = self.endpoints()?.new_nonce.clone();
        let account_url = self.account_url()?.to_string();

        let response = self.transport.signed_post(
            &new_nonce_url,
            authorization_url,
            &self.account_key,
            Auth::Kid(&account_url),
            None,
            &[],
        )?;

        let dto: AuthorizationDto = response.json()?;
        Ok(Authorization {
            url: authorization_url.to_string(),
            domain: dto.identifier.value,
            challenges: dto.challenges,
        })
    }

    pub fn respond_to_challenge(&self, challenge: &Challenge) -> Result<()> {
        let new_nonce_url = self.endpoints()?.new_nonce.clone();
        let account_url = self.account_url()?.to_string();

        self.transport.signed_post(
            &new_nonce_url,
            &challenge.url,
            &self.account_key,
            Auth::Kid(&account_url),
            Some(&json!({})),
            &[],
        )?;
        Ok(())
    }

    /// Polls `authorization_url` until it reaches `valid`, honouring
    /// `Retry-After` between attempts, up to `max_polls` iterations.
    pub fn poll_authorization(&self, authorization_url: &str, max_polls: u32) -> Result<()> {
        let new_nonce_url = self.endpoints()?.new_nonce.clone();
        let account_url = self.account_url()?.to_string();

        let mut last_status = String::new();
        for attempt in 0..max_polls {
            let response = self.transport.signed_post(
                &new_nonce_url,
                authorization_url,
                &self.account_key,
                Auth::Kid(&account_url),
                None,
                &[],
            )?;

            let wait = response.retry_after.unwrap_or(Duration::from_secs(1));
            let dto: AuthorizationDto = response.json()?;
            last_status = dto.status.as_str().to_string();

            match dto.status {
                AuthorizationStatus::Valid => return Ok(()),
                AuthorizationStatus::Invalid
                | AuthorizationStatus::Deactivated
                | AuthorizationStatus::Expired
                | AuthorizationStatus::Revoked => {
                    return Err(Error::AuthorizationFailed {
                        domain: dto.identifier.value,
                        status: last_status,
                    });
                }
                AuthorizationStatus::Pending => {
                    if attempt + 1 < max_polls {
                        thread::sleep(wait);
                    }
                }
            }
        }

        Err(Error::PollingExhausted {
            what: "authorization",
            attempts: max_polls,
            last_status,
        })
    }

    /// Drives authorization + challenge fulfillment for every authorization
    /// in `order`, using the given responders for provisioning.
    pub fn fulfil_authorizations(
        &self,
        order: &Order,
        dns_responder: &DnsResponder,
        http_responder: &HttpResponder,
    ) -> Result<()> {
        for authorization_url in &order.authorization_urls {
            let authorization = self.get_authorization(authorization_url)?;
            let challenge = challenge::find_challenge(&authorization.challenges, self.challenge_mode)?;

            info!(
                "fulfilling {} challenge for {}",
                self.challenge_mode.wire_name(),
                authorization.domain
            );

            let tripwire = match self.challenge_mode {
                ChallengeType::Dns01 => challenge::provision_dns01(
                    dns_responder,
                    &authorization.domain,
                    &challenge.token,
                    &self.account_key,
                )?,
                ChallengeType::Http01 => challenge::provision_http01(
                    http_responder,
                    &challenge.token,
                    &self.account_key,
                )?,
            };

            self.respond_to_challenge(challenge)?;

            if !tripwire.wait(Duration::from_secs(30)) {
                warn!(
                    "timed out waiting for the CA to probe the {} challenge for {}; polling anyway",
                    self.challenge_mode.wire_name(),
                    authorization.domain
                );
            }

            let poll_result = self.poll_authorization(authorization_url, DEFAULT_MAX_AUTH_POLLS);

            match self.challenge_mode {
                ChallengeType::Dns01 => {
                    challenge::deprovision_dns01(dns_responder, &authorization.domain)?;
                }
                ChallengeType::Http01 => {
                    challenge::deprovision_http01(http_responder, &challenge.token)?;
                }
            }

            poll_result?;
        }

        Ok(())
    }

    pub fn finalize_order(&self, order: &Order, certificate_key: &EcKey<Private>) -> Result<Order> {
        let new_nonce_url = self.endpoints()?.new_nonce.clone();
        let account_url = self.account_url()?.to_string();

        let csr = build_csr(certificate_key, &order.domains)?;
        let csr_b64 = b64(&csr.to_der()?);

        info!("finalizing order for {:?}", order.domains);
        let response = self.transport.signed_post(
            &new_nonce_url,
            &order.finalize_url,
            &self.account_key,
            Auth::Kid(&account_url),
            Some(&json!({ "csr": csr_b64 })),
            &[],
        )?;

        let dto: OrderDto = response.json()?;
        Ok(Order {
            url: order.url.clone(),
            status: dto.status,
            domains: order.domains.clone(),
            authorization_urls: order.authorization_urls.clone(),
            finalize_url: order.finalize_url.clone(),
            certificate_url: dto.certificate,
        })
    }

    /// Polls the order URL until it reaches `valid` (recording the
    /// certificate URL) or exhausts `max_polls`. `processing` keeps polling;
    /// anything else non-valid is a hard failure.
    pub fn poll_order(&self, order: &Order, max_polls: u32) -> Result<Order> {
        let new_nonce_url = self.endpoints()?.new_nonce.clone();
        let account_url = self.account_url()?.to_string();

        let mut last_status = String::new();
        for attempt in 0..max_polls {
            let response = self.transport.signed_post(
                &new_nonce_url,
                &order.url,
                &self.account_key,
                Auth::Kid(&account_url),
                None,
                &[],
            )?;

            let dto: OrderDto = response.json()?;
            last_status = dto.status.as_str().to_string();

            match dto.status {
                OrderStatus::Valid => {
                    return Ok(Order {
                        url: order.url.clone(),
                        status: OrderStatus::Valid,
                        domains: order.domains.clone(),
                        authorization_urls: order.authorization_urls.clone(),
                        finalize_url: order.finalize_url.clone(),
                        certificate_url: dto.certificate,
                    })
                }
                OrderStatus::Processing => {
                    if attempt + 1 < max_polls {
                        thread::sleep(Duration::from_secs(1));
                    }
                }
                _ => {
                    return Err(Error::PollingExhausted {
                        what: "order",
                        attempts: attempt + 1,
                        last_status,
                    })
                }
            }
        }

        Err(Error::PollingExhausted {
            what: "order",
            attempts: max_polls,
            last_status,
        })
    }

    pub fn get_certificate(&self, certificate_url: &str) -> Result<String> {
        let new_nonce_url = self.endpoints()?.new_nonce.clone();
        let account_url = self.account_url()?.to_string();

        let response = self.transport.signed_post(
            &new_nonce_url,
            certificate_url,
            &self.account_key,
            Auth::Kid(&account_url),
            None,
            &[("Accept", "application/pem-certificate-chain")],
        )?;

        Ok(String::from_utf8_lossy(&response.body).to_string())
    }

    pub fn revoke_certificate(&self, pem_chain: &str) -> Result<()> {
        let revoke_url = self.endpoints()?.revoke_cert.clone();
        let new_nonce_url = self.endpoints()?.new_nonce.clone();
        let account_url = self.account_url()?.to_string();

        let first_pem = split_pem_chain(pem_chain)
            .into_iter()
            .next()
            .ok_or(Error::NoCertificateInChain)?;
        let cert = X509::from_pem(first_pem.as_bytes())?;
        let der_b64 = b64(&cert.to_der()?);

        info!("revoking certificate");
        self.transport.signed_post(
            &new_nonce_url,
            &revoke_url,
            &self.account_key,
            Auth::Kid(&account_url),
            Some(&json!({ "certificate": der_b64 })),
            &[],
        )?;
        Ok(())
    }

    /// Runs the full lifecycle: directory through certificate retrieval
    /// (and, if requested, revocation). Returns the issued chain and the key
    /// that signed its CSR so the caller can persist both.
    pub fn run(
        &mut self,
        directory_url: &str,
        dns_responder: &DnsResponder,
        http_responder: &HttpResponder,
        revoke: bool,
    ) -> Result<IssuedCertificate> {
        self.fetch_directory(directory_url)?;
        self.create_account()?;

        let domains = self.domains.clone();
        let order = self.create_order(&domains)?;
        self.fulfil_authorizations(&order, dns_responder, http_responder)?;

        let certificate_key = jose::generate_p256_key()?;
        let order = self.finalize_order(&order, &certificate_key)?;
        let order = self.poll_order(&order, DEFAULT_MAX_ORDER_POLLS)?;

        let certificate_url = order
            .certificate_url
            .ok_or(Error::State("order reached valid without a certificate URL"))?;
        let pem_chain = self.get_certificate(&certificate_url)?;

        if revoke {
            self.revoke_certificate(&pem_chain)?;
        }

        Ok(IssuedCertificate {
            pem_chain,
            certificate_key,
        })
    }
}

/// Convenience used by the `key.pem` artifact writer in the CLI.
pub fn certificate_key_pem(key: &EcKey<Private>) -> Result<String> {
    ecdsa_private_key_pem(key)
}
