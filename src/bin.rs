use std::net::Ipv4Addr;
use std::process::ExitCode;

use acme::challenge::ChallengeType;
use acme::client::{AcmeClient, AcmeClientConfig};
use acme::dns::DnsResponder;
use acme::http_responder::HttpResponder;
use acme::transport::TransportConfig;
use clap::{ArgEnum, Parser};
use flexi_logger::Logger;
use log::{error, info};

const DNS_RESPONDER_PORT: u16 = 10053;
const HTTP_RESPONDER_PORT: u16 = 5002;

#[derive(ArgEnum, Debug, Clone, Copy)]
enum ChallengeModeArg {
    Dns01,
    Http01,
}

impl From<ChallengeModeArg> for ChallengeType {
    fn from(mode: ChallengeModeArg) -> Self {
        match mode {
            ChallengeModeArg::Dns01 => ChallengeType::Dns01,
            ChallengeModeArg::Http01 => ChallengeType::Http01,
        }
    }
}

/// An acme client (RFC8555) written in Rust.
#[derive(Parser, Debug)]
#[clap(version = "0.1.0", author = "Siddhant Ray <siddhant.r98@gmail.com>")]
struct Args {
    /// Which challenge type to fulfil: dns01 or http01.
    #[clap(arg_enum)]
    challenge: ChallengeModeArg,
    /// The ACME server's directory URL.
    #[clap(long = "dir")]
    directory_url: String,
    /// The IPv4 address every DNS A query is answered with.
    #[clap(long)]
    record: Ipv4Addr,
    /// A domain to request a certificate for; may be repeated for a SAN certificate.
    #[clap(long, required = true)]
    domain: Vec<String>,
    /// Revoke the certificate immediately after it is issued.
    #[clap(long)]
    revoke: bool,
    /// Route requests through this proxy and disable certificate verification (development only).
    #[clap(long)]
    proxy: Option<String>,
    /// PEM file whose certificates are trusted in addition to the system roots.
    #[clap(long = "root-ca")]
    root_ca: Option<String>,
    /// Enables debug output.
    #[clap(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();

    let log_spec = if args.verbose { "debug" } else { "info" };
    Logger::with_str(log_spec)
        .log_target(flexi_logger::LogTarget::StdOut)
        .start()
        .unwrap_or_else(|e| panic!("Logger initialization failed with {}", e));

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> acme::error::Result<()> {
    let dns_responder = DnsResponder::start(DNS_RESPONDER_PORT, args.record)?;
    let http_responder = HttpResponder::start(HTTP_RESPONDER_PORT)?;

    let config = AcmeClientConfig {
        challenge_mode: args.challenge.into(),
        domains: args.domain,
        transport: TransportConfig {
            root_ca_file: args.root_ca,
            proxy: args.proxy,
        },
    };

    let mut client = AcmeClient::new(&config)?;
    let issued = client.run(
        &args.directory_url,
        &dns_responder,
        &http_responder,
        args.revoke,
    )?;

    std::fs::write("cert.pem", &issued.pem_chain)?;
    std::fs::write(
        "key.pem",
        acme::client::certificate_key_pem(&issued.certificate_key)?,
    )?;

    info!("certificate written to cert.pem, key written to key.pem");
    Ok(())
}
