//! Certificate Authority (CA) generation for the interception relay
//!
//! Each process creates one ephemeral root and one leaf for the intercepted
//! hostname. Nothing is persisted here; the root is only exported as PEM so the
//! trust store adapter can reference it by path.

use crate::error::{Error, Result};
use pem::{EncodeConfig, LineEnding, Pem};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_ECDSA_P256_SHA256,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::net::IpAddr;
use time::{Duration, OffsetDateTime};

/// Organization and common name of the generated root
pub const CA_COMMON_NAME: &str = "Generic Inc.";
/// Backdating of `not_before` to tolerate clock skew (30 seconds)
const NOT_BEFORE_OFFSET: i64 = 30;
/// Certificate lifetime in seconds (1 hour)
const TTL_SECS: i64 = 60 * 60;
/// Serial numbers are drawn from `[0, 2^128)`
const SERIAL_LEN: usize = 16;

/// Generate a self-signed root certificate and its private key.
pub fn generate_root() -> Result<(CertificateDer<'static>, KeyPair)> {
  let (mut params, key_pair) = template()?;
  params.distinguished_name = ca_name();
  params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
  // keyCertSign is required for verifiers to accept the root as an issuer
  params.key_usages.push(KeyUsagePurpose::KeyCertSign);

  let cert = params
    .self_signed(&key_pair)
    .map_err(|e| Error::cert_generation("create root certificate", e))?;
  Ok((cert.der().clone(), key_pair))
}

/// Generate a leaf certificate for `hostname` signed by the given root.
///
/// `root_der` is parsed to recover the issuer name, so the leaf's issuer always
/// matches the root's subject.
pub fn generate_leaf(
  root_der: &CertificateDer<'_>,
  root_key: &KeyPair,
  hostname: &str,
) -> Result<(CertificateDer<'static>, KeyPair)> {
  let issuer = Issuer::from_ca_cert_der(root_der, root_key)
    .map_err(|e| Error::cert_generation("parse root certificate", e))?;

  let (mut params, key_pair) = template()?;
  let mut dn = DistinguishedName::new();
  dn.push(DnType::OrganizationName, CA_COMMON_NAME);
  dn.push(DnType::CommonName, hostname);
  params.distinguished_name = dn;
  params.is_ca = IsCa::ExplicitNoCa;
  params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
  params.subject_alt_names = vec![subject_alt_name(hostname)?];

  let cert = params
    .signed_by(&key_pair, &issuer)
    .map_err(|e| Error::cert_generation("create leaf certificate", e))?;
  Ok((cert.der().clone(), key_pair))
}

/// Common template: fresh P-256 key, random serial, `[now - 30s, now + 1h]`.
fn template() -> Result<(CertificateParams, KeyPair)> {
  let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
    .map_err(|e| Error::cert_generation("generate private key", e))?;

  let mut params = CertificateParams::default();
  params.serial_number = Some(random_serial(&mut OsRng)?);
  let now = OffsetDateTime::now_utc();
  params.not_before = now - Duration::seconds(NOT_BEFORE_OFFSET);
  params.not_after = now + Duration::seconds(TTL_SECS);
  params.key_usages = vec![
    KeyUsagePurpose::DigitalSignature,
    KeyUsagePurpose::KeyEncipherment,
  ];
  Ok((params, key_pair))
}

fn random_serial<R: RngCore>(rng: &mut R) -> Result<SerialNumber> {
  let mut serial = [0u8; SERIAL_LEN];
  rng
    .try_fill_bytes(&mut serial)
    .map_err(|e| Error::cert_generation("draw serial number", e))?;
  Ok(SerialNumber::from_slice(&serial))
}

fn ca_name() -> DistinguishedName {
  let mut dn = DistinguishedName::new();
  dn.push(DnType::OrganizationName, CA_COMMON_NAME);
  dn.push(DnType::CommonName, CA_COMMON_NAME);
  dn
}

fn subject_alt_name(hostname: &str) -> Result<SanType> {
  if let Ok(ip) = hostname.parse::<IpAddr>() {
    return Ok(SanType::IpAddress(ip));
  }
  let invalid = || {
    let error = Error::InvalidServerName(hostname.to_string());
    tracing::error!("{}", error);
    error
  };
  // rcgen only checks for IA5 characters, so validate the DNS syntax here
  ServerName::try_from(hostname).map_err(|_| invalid())?;
  let dns_name = hostname.try_into().map_err(|_| invalid())?;
  Ok(SanType::DnsName(dns_name))
}

/// Leaf certificate and key issued for the intercepted hostname
pub struct LeafCertificate {
  /// Certificate in DER format
  pub cert_der: CertificateDer<'static>,
  /// PKCS#8 private key
  pub key_der: PrivateKeyDer<'static>,
}

impl LeafCertificate {
  /// Chain presented to clients: `[leaf, root]`.
  pub fn chain(&self, root: &CertificateDer<'static>) -> Vec<CertificateDer<'static>> {
    vec![self.cert_der.clone(), root.clone()]
  }
}

/// Ephemeral root held in memory for the lifetime of the process
pub struct CertificateAuthority {
  root_der: CertificateDer<'static>,
  root_key: KeyPair,
}

impl CertificateAuthority {
  /// Generate a new root.
  pub fn generate() -> Result<Self> {
    let (root_der, root_key) = generate_root()?;
    tracing::debug!("generated ephemeral root certificate");
    Ok(Self { root_der, root_key })
  }

  /// Issue a leaf certificate for `hostname` signed by this root.
  pub fn issue(&self, hostname: &str) -> Result<LeafCertificate> {
    let (cert_der, key_pair) = generate_leaf(&self.root_der, &self.root_key, hostname)?;
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    tracing::debug!("issued leaf certificate for {}", hostname);
    Ok(LeafCertificate { cert_der, key_der })
  }

  /// Root certificate in DER format
  pub fn root_der(&self) -> &CertificateDer<'static> {
    &self.root_der
  }

  /// Root certificate in PEM format
  pub fn root_pem(&self) -> String {
    der_to_pem(&self.root_der)
  }
}

/// Encode a DER certificate as a PEM `CERTIFICATE` block.
pub fn der_to_pem(der: &CertificateDer<'_>) -> String {
  let block = Pem::new("CERTIFICATE", der.to_vec());
  pem::encode_config(&block, EncodeConfig::new().set_line_ending(LineEnding::LF))
}
