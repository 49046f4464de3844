//! HTTPS transport: owns the `reqwest` client, the single-slot nonce cache,
//! and the signed-request pipeline every ACME call goes through. Retrying is
//! deliberately minimal - the state machine owns retry policy - except for
//! `badNonce`, which is transparent here because the nonce cache is this
//! module's responsibility, not the caller's.

use std::sync::Mutex;
use std::time::Duration;

use openssl::ec::EcKey;
use openssl::pkey::Private;
use reqwest::blocking::{Client, ClientBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, ProblemDocument, Result};
use crate::jose;

/// Configuration accepted at `Transport` construction time.
#[derive(Debug, Clone, Default)]
pub struct TransportConfig {
    /// PEM file whose certificates are added to the trusted root set -
    /// needed to talk to a test CA like Pebble that isn't publicly trusted.
    pub root_ca_file: Option<String>,
    /// If set, requests are routed through this proxy and certificate
    /// verification is disabled. Development only.
    pub proxy: Option<String>,
}

/// The directory's set of endpoint URLs, as returned by a GET to the
/// directory URL.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Endpoints {
    #[serde(rename = "newNonce")]
    pub new_nonce: String,
    #[serde(rename = "newAccount")]
    pub new_account: String,
    #[serde(rename = "newOrder")]
    pub new_order: String,
    #[serde(rename = "revokeCert")]
    pub revoke_cert: String,
    #[serde(rename = "keyChange")]
    pub key_change: String,
}

pub struct Transport {
    client: Client,
    nonce: Mutex<Option<String>>,
}

/// What a signed request contributes to the protected header beyond
/// `alg`/`nonce`/`url`: either the account's public key (account creation) or
/// the account URL (every other request).
pub enum Auth<'a> {
    Jwk(&'a EcKey<Private>),
    Kid(&'a str),
}

/// A successful response the caller still has to interpret: status, the
/// headers it cares about, and the raw body.
pub struct SignedResponse {
    pub status: u16,
    pub location: Option<String>,
    pub retry_after: Option<Duration>,
    pub body: Vec<u8>,
}

impl SignedResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

impl Transport {
    pub fn new(config: &TransportConfig) -> Result<Self> {
        let mut builder = ClientBuilder::new();

        if let Some(path) = &config.root_ca_file {
            let pem = std::fs::read(path)
                .map_err(|e| Error::Config(format!("failed to read root CA file {}: {}", path, e)))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| Error::Config(format!("invalid root CA PEM in {}: {}", path, e)))?;
            builder = builder.add_root_certificate(cert);
        }

        if let Some(proxy_url) = &config.proxy {
            let proxy = reqwest::Proxy::all(proxy_url)
                .map_err(|e| Error::Config(format!("invalid proxy URL {}: {}", proxy_url, e)))?;
            builder = builder.proxy(proxy).danger_accept_invalid_certs(true);
        }

        let client = builder.build()?;

        Ok(Transport {
            client,
            nonce: Mutex::new(None),
        })
    }

    /// GETs the directory document and decodes it into its endpoint URLs.
    pub fn fetch_directory(&self, url: &str) -> Result<Endpoints> {
        let response = self.client.get(url).send()?;
        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::UnexpectedStatus {
                url: url.to_string(),
                status,
                body: response.text().unwrap_or_default(),
            });
        }
        Ok(response.json()?)
    }

    /// HEADs the `newNonce` endpoint and stashes the `Replay-Nonce` header.
    pub fn new_nonce_fetch(&self, new_nonce_url: &str) -> Result<()> {
        let response = self
            .client
            .head(new_nonce_url)
            .header("Cache-Control", "no-store")
            .send()?;

        let status = response.status().as_u16();
        if status != 200 {
            return Err(Error::UnexpectedStatus {
                url: new_nonce_url.to_string(),
                status,
                body: response.text().unwrap_or_default(),
            });
        }

        let nonce = response
            .headers()
            .get("replay-nonce")
            .ok_or_else(|| Error::MissingNonce(new_nonce_url.to_string()))?
            .to_str()?
            .to_owned();

        *self.nonce.lock().unwrap() = Some(nonce);
        Ok(())
    }

    fn take_nonce(&self, new_nonce_url: &str) -> Result<String> {
        let cached = self.nonce.lock().unwrap().take();
        match cached {
            Some(nonce) => Ok(nonce),
            None => {
                self.new_nonce_fetch(new_nonce_url)?;
                self.nonce
                    .lock()
                    .unwrap()
                    .take()
                    .ok_or_else(|| Error::MissingNonce(new_nonce_url.to_string()))
            }
        }
    }

    /// The single-flight signed request pipeline described in the design
    /// document: consume a nonce, build the protected header, sign, POST,
    /// cache the next nonce. `new_nonce_url` is needed so the pipeline can
    /// replenish the cache itself without the caller threading `Endpoints`
    /// through every call site.
    pub fn signed_post(
        &self,
        new_nonce_url: &str,
        url: &str,
        key: &EcKey<Private>,
        auth: Auth<'_>,
        payload: Option<&Value>,
        extra_headers: &[(&str, &str)],
    ) -> Result<SignedResponse> {
        match self.signed_post_once(new_nonce_url, url, key, &auth, payload, extra_headers) {
            Err(Error::Problem(problem)) if problem.is_bad_nonce() => {
                *self.nonce.lock().unwrap() = None;
                self.signed_post_once(new_nonce_url, url, key, &auth, payload, extra_headers)
            }
            other => other,
        }
    }

    fn signed_post_once(
        &self,
        new_nonce_url: &str,
        url: &str,
        key: &EcKey<Private>,
        auth: &Auth<'_>,
        payload: Option<&Value>,
        extra_headers: &[(&str, &str)],
    ) -> Result<SignedResponse> {
        let nonce = self.take_nonce(new_nonce_url)?;

        let mut header = serde_json::json!({
            "alg": "ES256",
            "nonce": nonce,
            "url": url,
        });
        let header_obj = header.as_object_mut().expect("object literal above");
        match auth {
            Auth::Jwk(account_key) => {
                header_obj.insert("jwk".to_string(), serde_json::to_value(jose::jwk(account_key)?)?);
            }
            Auth::Kid(account_url) => {
                header_obj.insert("kid".to_string(), Value::String(account_url.to_string()));
            }
        }

        let jws = jose::sign(key, &header, payload)?;

        let mut request = self
            .client
            .post(url)
            .header("Content-Type", "application/jose+json")
            .json(&serde_json::json!({
                "protected": jws.protected,
                "payload": jws.payload,
                "signature": jws.signature,
            }));

        for (name, value) in extra_headers {
            request = request.header(*name, *value);
        }

        let response = request.send()?;
        self.remember_nonce(&response);

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get("location")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let retry_after = Some(Self::retry_after_or_default(response.headers()));
        let body = response.bytes()?.to_vec();

        if !(200..300).contains(&status) {
            if content_type.contains("application/problem+json") {
                if let Ok(problem) = serde_json::from_slice::<ProblemDocument>(&body) {
                    return Err(Error::Problem(problem));
                }
            }
            return Err(Error::UnexpectedStatus {
                url: url.to_string(),
                status,
                body: String::from_utf8_lossy(&body).to_string(),
            });
        }

        Ok(SignedResponse {
            status,
            location,
            retry_after,
            body,
        })
    }

    fn remember_nonce(&self, response: &Response) {
        if let Some(value) = response.headers().get("replay-nonce") {
            if let Ok(nonce) = value.to_str() {
                *self.nonce.lock().unwrap() = Some(nonce.to_string());
            }
        }
    }

    /// Timeout budget applied to polling loops that wait out a server
    /// `Retry-After`, clamped to at least one second per the design notes.
    pub fn retry_after_or_default(response_headers: &reqwest::header::HeaderMap) -> Duration {
        let seconds = response_headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(1)
            .max(1);
        Duration::from_secs(seconds)
    }
}
