use thiserror::Error;

use openssl::error::ErrorStack;
use reqwest::header::ToStrError;

/// One enum for every failure mode the core can produce. Configuration,
/// transport, protocol, state and polling errors are kept as distinct variants
/// rather than opaque strings so the CLI can match on them and pick an exit
/// path instead of just printing a message.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{0}")]
    Problem(ProblemDocument),

    #[error("unexpected status {status} from {url}: {body}")]
    UnexpectedStatus {
        url: String,
        status: u16,
        body: String,
    },

    #[error("response from {0} was missing the Replay-Nonce header")]
    MissingNonce(String),

    #[error("response from {0} was missing the {1} header")]
    MissingHeader(String, &'static str),

    #[error("state error: {0}")]
    State(&'static str),

    #[error("{what} did not reach the expected status after {attempts} polls (last status: {last_status})")]
    PollingExhausted {
        what: &'static str,
        attempts: u32,
        last_status: String,
    },

    #[error("authorization for {domain} failed validation (status: {status})")]
    AuthorizationFailed { domain: String, status: String },

    #[error("no {0} challenge offered for this authorization")]
    NoMatchingChallenge(&'static str),

    #[error("no CERTIFICATE block found in the returned PEM chain")]
    NoCertificateInChain,

    #[error("error while de/encoding json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("error in openssl: {0}")]
    Crypto(#[from] ErrorStack),

    #[error("error reading header value: {0}")]
    HeaderValue(#[from] ToStrError),

    #[error("the key-value store worker has shut down")]
    StoreClosed,

    #[error("DNS wire format error: {0}")]
    DnsProto(#[from] trust_dns_proto::error::ProtoError),
}

impl From<reqwest::Error> for Error {
    fn from(source: reqwest::Error) -> Self {
        Error::Transport {
            url: source
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            source,
        }
    }
}

/// RFC 7807 problem document, as returned by ACME error responses. The `type`
/// URN is mapped to the human-readable description from RFC 8555 §6.7.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProblemDocument {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub detail: String,
    #[serde(default)]
    pub status: Option<u16>,
}

impl ProblemDocument {
    pub fn is_bad_nonce(&self) -> bool {
        self.type_ == "urn:ietf:params:acme:error:badNonce"
    }

    pub fn description(&self) -> &'static str {
        match self.type_.as_str() {
            "urn:ietf:params:acme:error:accountDoesNotExist" => "the account does not exist",
            "urn:ietf:params:acme:error:alreadyRevoked" => {
                "the certificate has already been revoked"
            }
            "urn:ietf:params:acme:error:badCSR" => "the CSR is unacceptable",
            "urn:ietf:params:acme:error:badNonce" => {
                "the client sent an unacceptable anti-replay nonce"
            }
            "urn:ietf:params:acme:error:badPublicKey" => "the server does not support this public key",
            "urn:ietf:params:acme:error:badRevocationReason" => {
                "the revocation reason provided is not allowed"
            }
            "urn:ietf:params:acme:error:badSignatureAlgorithm" => {
                "the signing algorithm is not supported"
            }
            "urn:ietf:params:acme:error:caa" => {
                "CAA records forbid the CA from issuing the requested certificate"
            }
            "urn:ietf:params:acme:error:compound" => {
                "specific error conditions are listed in the \"subproblems\" array"
            }
            "urn:ietf:params:acme:error:connection" => {
                "the server could not connect to the validation target"
            }
            "urn:ietf:params:acme:error:dns" => "there was a problem with a DNS query",
            "urn:ietf:params:acme:error:externalAccountRequired" => {
                "the request must include a value for the externalAccountBinding field"
            }
            "urn:ietf:params:acme:error:incorrectResponse" => {
                "the response received didn't match the challenge's requirements"
            }
            "urn:ietf:params:acme:error:invalidContact" => "the contact URL for the account is invalid",
            "urn:ietf:params:acme:error:malformed" => "the request message was malformed",
            "urn:ietf:params:acme:error:orderNotReady" => {
                "the request attempted to finalize an order that is not ready to be finalized"
            }
            "urn:ietf:params:acme:error:rateLimited" => "the request exceeds a rate limit",
            "urn:ietf:params:acme:error:rejectedIdentifier" => {
                "the server will not issue certificates for the identifier"
            }
            "urn:ietf:params:acme:error:serverInternal" => "the server experienced an internal error",
            "urn:ietf:params:acme:error:tls" => "the server experienced a TLS error during validation",
            "urn:ietf:params:acme:error:unauthorized" => "the client lacks sufficient authorization",
            "urn:ietf:params:acme:error:unsupportedContact" => {
                "a contact URL used an unsupported protocol scheme"
            }
            "urn:ietf:params:acme:error:unsupportedIdentifier" => {
                "an identifier is of an unsupported type"
            }
            "urn:ietf:params:acme:error:userActionRequired" => {
                "visit the instance URL and take the actions specified there"
            }
            _ => "unrecognized ACME problem type",
        }
    }
}

impl std::fmt::Display for ProblemDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.description(), self.type_, self.detail)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
