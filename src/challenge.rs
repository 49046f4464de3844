//! Challenge fulfillment: turns a (domain, token) pair into the provisioning
//! side-effect a given challenge type needs, computed from the account key's
//! thumbprint per RFC 8555 §8.1.

use openssl::ec::EcKey;
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::Private;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http_responder::HttpResponder;
use crate::jose;
use crate::store::Tripwire;
use crate::util::b64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    Dns01,
    Http01,
}

impl ChallengeType {
    pub fn wire_name(self) -> &'static str {
        match self {
            ChallengeType::Dns01 => "dns-01",
            ChallengeType::Http01 => "http-01",
        }
    }
}

/// The subset of a challenge object the client acts on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(rename = "type")]
    pub type_: String,
    pub url: String,
    pub token: String,
}

impl Challenge {
    pub fn matches(&self, wanted: ChallengeType) -> bool {
        self.type_ == wanted.wire_name()
    }
}

/// `token + "." + base64url(thumbprint)` - the value that both proves key
/// possession and is what dns-01 additionally hashes before publishing.
pub fn key_authorization(token: &str, account_key: &EcKey<Private>) -> Result<String> {
    let jwk = jose::jwk(account_key)?;
    let thumb = jose::thumbprint(&jwk)?;
    Ok(format!("{}.{}", token, b64(&thumb)))
}

/// The DNS TXT record name `dns-01` is served under: strips a leading
/// wildcard label per RFC 8555 §7.4 before prefixing `_acme-challenge.`.
pub fn dns01_record_name(domain: &str) -> String {
    let base = domain.strip_prefix("*.").unwrap_or(domain);
    format!("_acme-challenge.{}.", base)
}

/// Provisions the `dns-01` TXT record for `domain` on `responder`, returning
/// a tripwire that fires on the CA's first TXT probe.
pub fn provision_dns01(
    responder: &crate::dns::DnsResponder,
    domain: &str,
    token: &str,
    account_key: &EcKey<Private>,
) -> Result<Tripwire> {
    let key_auth = key_authorization(token, account_key)?;
    let digest = hash(MessageDigest::sha256(), key_auth.as_bytes())?;
    let value = b64(&digest);
    responder.add_txt_record(dns01_record_name(domain), value)
}

pub fn deprovision_dns01(responder: &crate::dns::DnsResponder, domain: &str) -> Result<()> {
    responder.del_txt_record(dns01_record_name(domain))
}

/// Provisions the `http-01` key authorization for `token` on `responder`,
/// returning a tripwire that fires on the CA's first GET.
pub fn provision_http01(
    responder: &HttpResponder,
    token: &str,
    account_key: &EcKey<Private>,
) -> Result<Tripwire> {
    let key_auth = key_authorization(token, account_key)?;
    responder.add_challenge_path(token.to_string(), key_auth)
}

pub fn deprovision_http01(responder: &HttpResponder, token: &str) -> Result<()> {
    responder.del_challenge_path(token.to_string())
}

pub fn find_challenge(challenges: &[Challenge], wanted: ChallengeType) -> Result<&Challenge> {
    challenges
        .iter()
        .find(|c| c.matches(wanted))
        .ok_or(Error::NoMatchingChallenge(wanted.wire_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jose::generate_p256_key;

    #[test]
    fn wildcard_domain_strips_label_before_acme_challenge_prefix() {
        assert_eq!(
            dns01_record_name("*.example.com"),
            "_acme-challenge.example.com."
        );
        assert_eq!(
            dns01_record_name("b.example"),
            "_acme-challenge.b.example."
        );
    }

    #[test]
    fn key_authorization_has_token_dot_thumbprint_shape() {
        let key = generate_p256_key().unwrap();
        let ka = key_authorization("tok123", &key).unwrap();
        let mut parts = ka.splitn(2, '.');
        assert_eq!(parts.next().unwrap(), "tok123");
        assert!(!parts.next().unwrap().is_empty());
    }
}
