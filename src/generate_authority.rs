//! Certificate Authority Generation Module
//!
//! Generates the self-signed authority that signs every leaf certificate for
//! one base domain.
//!
//! # Hierarchy Position
//! ```text
//! Domain CA (self-signed, CN=example.org) ← This module
//!   └── Leaf certificate (CN=files.example.org, signed by the CA)
//! ```
//!
//! # Certificate Properties
//! - **Self-signed**: Issuer and subject are the same
//! - **Subject**: `O=<organization>, CN=<base domain>`
//! - **Key Usage**: keyCertSign, cRLSign (critical)
//! - **Basic Constraints**: CA=true, pathlen=0 (critical), so it may only sign leaves
//! - **Subject Key Identifier**: hash of the public key
//! - **Default Key Size**: RSA 2048-bit
//! - **Default Validity**: 5 years
//! - **Version**: X.509v3 with extensions

use anyhow::{anyhow, Result};
use openssl::asn1::Asn1Integer;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::X509;

use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectKeyIdentifier};

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const RSA_KEY_SIZE_DEFAULT: u32 = 2048;
const AUTHORITY_PATH_LENGTH: u32 = 0;

// ================= Domain Authority Builder =================

/// Builder for the RSA key pair and self-signed certificate of a domain CA
///
/// # Required Fields
/// - `base_domain` - becomes the CN, e.g. `example.org`
/// - `organization` - platform organization name
/// - `serial` - from the shared clock-based counter
///
/// # Examples
/// ```rust,no_run
/// # use certkeeper::generate_authority::AuthorityBuilder;
/// # use certkeeper::serial::SerialCounter;
/// # fn example() -> anyhow::Result<()> {
/// let serials = SerialCounter::new();
/// let (ca_key, ca_cert) = AuthorityBuilder::new("example.org")
///     .organization("Certkeeper Servers")
///     .serial(serials.next_asn1()?)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct AuthorityBuilder {
    base_domain: String,
    organization: String,
    key_bits: u32,
    validity_days: u32,
    serial: Option<Asn1Integer>,
}

impl AuthorityBuilder {
    pub fn new(base_domain: impl Into<String>) -> Self {
        Self {
            base_domain: base_domain.into(),
            organization: String::new(),
            key_bits: RSA_KEY_SIZE_DEFAULT,
            validity_days: 5 * 365,
            serial: None,
        }
    }

    /// Set the organization (O) for the certificate
    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization = org.into();
        self
    }

    pub fn key_bits(mut self, bits: u32) -> Self {
        self.key_bits = bits;
        self
    }

    /// Set validity period in days
    pub fn validity_days(mut self, days: u32) -> Self {
        self.validity_days = days;
        self
    }

    pub fn serial(mut self, serial: Asn1Integer) -> Self {
        self.serial = Some(serial);
        self
    }

    /// Build the RSA key pair and self-signed CA certificate
    ///
    /// # Errors
    /// Returns error if:
    /// - The base domain or organization is empty
    /// - No serial number was supplied
    /// - RSA key generation fails
    /// - X.509 extension creation or signing fails
    pub fn build(self) -> Result<(PKey<Private>, X509)> {
        if self.base_domain.is_empty() {
            return Err(anyhow!("Base domain must not be empty"));
        }
        if self.organization.is_empty() {
            return Err(anyhow!("Organization must not be empty"));
        }
        let serial = self
            .serial
            .ok_or_else(|| anyhow!("Serial number must be set"))?;

        // Generate RSA key pair
        let rsa = openssl::rsa::Rsa::generate(self.key_bits)
            .map_err(|e| anyhow!("Failed to generate RSA keypair: {}", e))?;

        let private_key =
            PKey::from_rsa(rsa).map_err(|e| anyhow!("Failed to create private key: {}", e))?;

        // Build X509 certificate
        let mut builder =
            X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;

        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| anyhow!("Failed to set version: {}", e))?;

        builder
            .set_serial_number(&serial)
            .map_err(|e| anyhow!("Failed to set serial number: {}", e))?;

        // Build subject/issuer name
        let mut name_builder = openssl::x509::X509Name::builder()
            .map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        name_builder
            .append_entry_by_nid(openssl::nid::Nid::ORGANIZATIONNAME, &self.organization)
            .map_err(|e| anyhow!("Failed to set organization: {}", e))?;
        name_builder
            .append_entry_by_nid(openssl::nid::Nid::COMMONNAME, &self.base_domain)
            .map_err(|e| anyhow!("Failed to set CN: {}", e))?;
        let name = name_builder.build();

        builder
            .set_subject_name(&name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;

        builder
            .set_issuer_name(&name)
            .map_err(|e| anyhow!("Failed to set issuer: {}", e))?;

        let not_before = openssl::asn1::Asn1Time::days_from_now(0)
            .map_err(|e| anyhow!("Failed to create not_before: {}", e))?;
        builder
            .set_not_before(&not_before)
            .map_err(|e| anyhow!("Failed to set not_before: {}", e))?;

        let not_after = openssl::asn1::Asn1Time::days_from_now(self.validity_days)
            .map_err(|e| anyhow!("Failed to create not_after: {}", e))?;
        builder
            .set_not_after(&not_after)
            .map_err(|e| anyhow!("Failed to set not_after: {}", e))?;

        builder
            .set_pubkey(&private_key)
            .map_err(|e| anyhow!("Failed to set public key: {}", e))?;

        let mut bc = BasicConstraints::new();
        bc.critical().ca();
        bc.pathlen(AUTHORITY_PATH_LENGTH);
        let extension = bc
            .build()
            .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
        builder
            .append_extension(extension)
            .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

        let mut ku = KeyUsage::new();
        ku.critical();
        ku.key_cert_sign();
        ku.crl_sign();
        let ku_extension = ku
            .build()
            .map_err(|e| anyhow!("Failed to build KeyUsage: {}", e))?;
        builder
            .append_extension(ku_extension)
            .map_err(|e| anyhow!("Failed to add KeyUsage: {}", e))?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(None, None))
            .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
        builder
            .append_extension(ski)
            .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;

        builder
            .sign(&private_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;
        let x509 = builder.build();
        Ok((private_key, x509))
    }
}
