//! Certificate generation tool
//!
//! Produces a throwaway CA plus a server certificate signed by it. The CA
//! certificate goes to relays (`client.ca_cert`); the server pair stays on
//! the server.

use anyhow::Result;
use clap::Parser;
use rcgen::{Certificate, CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
use std::path::PathBuf;
use std::time::Duration;

/// Generate TLS certificates for the tunnel server
#[derive(Parser, Debug)]
#[command(name = "mailpipe-gen-certs")]
#[command(about = "Generate a CA and server certificate")]
#[command(version = mailpipe::VERSION)]
struct Args {
    /// Hostname for the certificate
    #[arg(short = 'n', long, default_value = "mail.example.com")]
    hostname: String,

    /// Output directory
    #[arg(short, long, default_value = ".")]
    output: PathBuf,

    /// Validity in days
    #[arg(short, long, default_value = "365")]
    days: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!("Generating TLS certificates for: {}", args.hostname);
    std::fs::create_dir_all(&args.output)?;

    let alg = &rcgen::PKCS_ECDSA_P256_SHA256;

    let ca_key = KeyPair::generate(alg)?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new());
    ca_params.alg = alg;
    ca_params.key_pair = Some(ca_key);
    ca_params.distinguished_name = DistinguishedName::new();
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, "mailpipe");
    ca_params.distinguished_name.push(DnType::CommonName, "mailpipe CA");
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![
        rcgen::KeyUsagePurpose::KeyCertSign,
        rcgen::KeyUsagePurpose::CrlSign,
    ];
    let ca_cert = Certificate::from_params(ca_params)?;

    let server_key = KeyPair::generate(alg)?;
    let mut server_params = CertificateParams::new(vec![args.hostname.clone()]);
    server_params.alg = alg;
    server_params.key_pair = Some(server_key);
    server_params.distinguished_name = DistinguishedName::new();
    server_params
        .distinguished_name
        .push(DnType::OrganizationName, "mailpipe");
    server_params
        .distinguished_name
        .push(DnType::CommonName, &args.hostname);
    server_params.subject_alt_names = vec![SanType::DnsName(args.hostname.parse()?)];
    server_params.not_before = time::OffsetDateTime::now_utc();
    server_params.not_after =
        server_params.not_before + Duration::from_secs(args.days * 24 * 60 * 60);
    server_params.key_usages = vec![
        rcgen::KeyUsagePurpose::DigitalSignature,
        rcgen::KeyUsagePurpose::KeyEncipherment,
    ];
    server_params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
    let server_cert = Certificate::from_params(server_params)?;

    let ca_cert_path = args.output.join("ca.crt");
    let server_cert_path = args.output.join("server.crt");
    let server_key_path = args.output.join("server.key");

    std::fs::write(&ca_cert_path, ca_cert.serialize_pem()?)?;
    std::fs::write(&server_cert_path, server_cert.serialize_pem_with_signer(&ca_cert)?)?;
    std::fs::write(&server_key_path, server_cert.serialize_private_key_pem())?;

    println!();
    println!("Generated:");
    println!("  CA certificate:     {}", ca_cert_path.display());
    println!("  Server certificate: {}", server_cert_path.display());
    println!("  Server key:         {}", server_key_path.display());
    println!();
    println!("Copy ca.crt to relays as client.ca_cert; server.crt and");
    println!("server.key stay on the server.");

    Ok(())
}
