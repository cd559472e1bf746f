//! Leaf Certificate Generation Module
//!
//! Issues end-entity TLS certificates for a hostname, signed by the domain CA
//! returned from [`crate::authority_manager::AuthorityManager`].
//!
//! # Certificate Properties
//! - **Subject**: optional C, ST, L, CN, emailAddress (only the non-empty ones) plus a fixed O
//! - **Issuer**: the CA's subject
//! - **Basic Constraints**: CA=false (critical)
//! - **Subject Alternative Name**: `DNS:<hostname>`
//! - **Key**: RSA or DSA of the requested length
//! - **Default Validity**: 2 years
//! - **Signature**: SHA-256 by the CA key

use anyhow::{anyhow, Result};
use openssl::asn1::Asn1Integer;
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    AuthorityKeyIdentifier, BasicConstraints, SubjectAlternativeName, SubjectKeyIdentifier,
};
use openssl::x509::{X509Ref, X509};
use serde::{Deserialize, Serialize};

use crate::records::KeyType;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2

/// Optional subject entries supplied by the administrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectFields {
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub locality: String,
    #[serde(default)]
    pub common_name: String,
    #[serde(default)]
    pub email: String,
}

impl SubjectFields {
    pub fn common_name(cn: impl Into<String>) -> Self {
        Self {
            common_name: cn.into(),
            ..Self::default()
        }
    }

    fn entries(&self) -> [(Nid, &str); 5] {
        [
            (Nid::COUNTRYNAME, self.country.as_str()),
            (Nid::STATEORPROVINCENAME, self.state.as_str()),
            (Nid::LOCALITYNAME, self.locality.as_str()),
            (Nid::COMMONNAME, self.common_name.as_str()),
            (Nid::PKCS9_EMAILADDRESS, self.email.as_str()),
        ]
    }
}

// ================= Leaf Key Pair Builder =================

/// Builder for a key pair and leaf certificate signed by a domain CA
///
/// # Examples
/// ```rust,no_run
/// # use certkeeper::generate_leaf::{LeafBuilder, SubjectFields};
/// # use certkeeper::records::KeyType;
/// # use openssl::pkey::{PKey, Private};
/// # use openssl::x509::X509;
/// # fn example(ca_key: PKey<Private>, ca_cert: X509, serial: openssl::asn1::Asn1Integer) -> anyhow::Result<()> {
/// let (key, cert) = LeafBuilder::new(&ca_key, &ca_cert)
///     .subject(SubjectFields::common_name("files.example.org"))
///     .organization("Certkeeper Servers")
///     .hostname("files.example.org")
///     .key(KeyType::Rsa, 2048)
///     .serial(serial)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct LeafBuilder<'a> {
    signing_key: &'a PKey<Private>,
    signing_cert: &'a X509,
    subject: SubjectFields,
    organization: String,
    hostname: String,
    key_type: KeyType,
    key_bits: u32,
    validity_days: u32,
    serial: Option<Asn1Integer>,
}

impl<'a> LeafBuilder<'a> {
    /// # Arguments
    /// * `ca_key` - CA private key used for signing
    /// * `ca_cert` - CA certificate providing the issuer name
    pub fn new(ca_key: &'a PKey<Private>, ca_cert: &'a X509) -> Self {
        Self {
            signing_key: ca_key,
            signing_cert: ca_cert,
            subject: SubjectFields::default(),
            organization: String::new(),
            hostname: String::new(),
            key_type: KeyType::Rsa,
            key_bits: 2048,
            validity_days: 2 * 365,
            serial: None,
        }
    }

    pub fn subject(mut self, subject: SubjectFields) -> Self {
        self.subject = subject;
        self
    }

    /// Set the organization (O) for the certificate
    pub fn organization(mut self, org: impl Into<String>) -> Self {
        self.organization = org.into();
        self
    }

    /// Hostname placed in the subjectAltName extension
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn key(mut self, key_type: KeyType, bits: u32) -> Self {
        self.key_type = key_type;
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

    fn generate_key(&self) -> Result<PKey<Private>> {
        match self.key_type {
            KeyType::Rsa => {
                let rsa = openssl::rsa::Rsa::generate(self.key_bits)
                    .map_err(|e| anyhow!("Failed to generate RSA keypair: {}", e))?;
                PKey::from_rsa(rsa).map_err(|e| anyhow!("Failed to create private key: {}", e))
            }
            KeyType::Dsa => {
                let dsa = openssl::dsa::Dsa::generate(self.key_bits)
                    .map_err(|e| anyhow!("Failed to generate DSA keypair: {}", e))?;
                PKey::from_dsa(dsa).map_err(|e| anyhow!("Failed to create private key: {}", e))
            }
            other => Err(anyhow!("Key type {} cannot be generated", other)),
        }
    }

    /// Build the key pair and CA-signed leaf certificate
    ///
    /// # Errors
    /// Returns error if:
    /// - The key type is neither RSA nor DSA
    /// - No serial number or hostname was supplied
    /// - Key generation, extension creation or signing fails
    pub fn build(self) -> Result<(PKey<Private>, X509)> {
        let serial = self
            .serial
            .as_ref()
            .ok_or_else(|| anyhow!("Serial number must be set"))?;
        if self.hostname.is_empty() {
            return Err(anyhow!("Hostname must not be empty"));
        }

        let private_key = self.generate_key()?;
        let ca_cert: &X509Ref = self.signing_cert;

        let mut builder =
            X509::builder().map_err(|e| anyhow!("Failed to create X509 builder: {}", e))?;

        builder
            .set_version(X509_VERSION_3)
            .map_err(|e| anyhow!("Failed to set version: {}", e))?;
        builder
            .set_serial_number(serial)
            .map_err(|e| anyhow!("Failed to set serial number: {}", e))?;

        let mut name_builder = openssl::x509::X509Name::builder()
            .map_err(|e| anyhow!("Failed to create name builder: {}", e))?;
        for (nid, value) in self.subject.entries() {
            if value.is_empty() {
                continue;
            }
            name_builder
                .append_entry_by_nid(nid, value)
                .map_err(|e| anyhow!("Failed to set {}: {}", nid.short_name().unwrap_or("?"), e))?;
        }
        name_builder
            .append_entry_by_nid(Nid::ORGANIZATIONNAME, &self.organization)
            .map_err(|e| anyhow!("Failed to set organization: {}", e))?;
        let subject_name = name_builder.build();

        builder
            .set_subject_name(&subject_name)
            .map_err(|e| anyhow!("Failed to set subject: {}", e))?;

        // Issuer is the CA's subject
        builder
            .set_issuer_name(self.signing_cert.subject_name())
            .map_err(|e| anyhow!("Failed to set issuer from CA: {}", e))?;

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

        // CA=false
        let mut bc = BasicConstraints::new();
        bc.critical();
        let extension = bc
            .build()
            .map_err(|e| anyhow!("Failed to build BasicConstraints: {}", e))?;
        builder
            .append_extension(extension)
            .map_err(|e| anyhow!("Failed to add BasicConstraints: {}", e))?;

        let san = SubjectAlternativeName::new()
            .dns(&self.hostname)
            .build(&builder.x509v3_context(Some(ca_cert), None))
            .map_err(|e| anyhow!("Failed to build SubjectAlternativeName: {}", e))?;
        builder
            .append_extension(san)
            .map_err(|e| anyhow!("Failed to add SubjectAlternativeName: {}", e))?;

        let ski = SubjectKeyIdentifier::new()
            .build(&builder.x509v3_context(Some(ca_cert), None))
            .map_err(|e| anyhow!("Failed to build SubjectKeyIdentifier: {}", e))?;
        builder
            .append_extension(ski)
            .map_err(|e| anyhow!("Failed to add SubjectKeyIdentifier: {}", e))?;

        let aki = AuthorityKeyIdentifier::new()
            .keyid(false)
            .build(&builder.x509v3_context(Some(ca_cert), None))
            .map_err(|e| anyhow!("Failed to build AuthorityKeyIdentifier: {}", e))?;
        builder
            .append_extension(aki)
            .map_err(|e| anyhow!("Failed to add AuthorityKeyIdentifier: {}", e))?;

        // Sign with the CA's private key
        builder
            .sign(self.signing_key, MessageDigest::sha256())
            .map_err(|e| anyhow!("Failed to sign certificate: {}", e))?;

        Ok((private_key, builder.build()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generate_authority::AuthorityBuilder;
    use crate::inspect::subject_common_name;
    use crate::serial::SerialCounter;
    use openssl::pkey::Id;

    fn authority(serials: &SerialCounter) -> (PKey<Private>, X509) {
        AuthorityBuilder::new("example.org")
            .organization("Test Servers")
            .key_bits(1024)
            .serial(serials.next_asn1().unwrap())
            .build()
            .unwrap()
    }

    #[test]
    fn test_signed_by_authority() {
        let serials = SerialCounter::new();
        let (ca_key, ca_cert) = authority(&serials);

        let (key, cert) = LeafBuilder::new(&ca_key, &ca_cert)
            .subject(SubjectFields::common_name("files.example.org"))
            .organization("Test Servers")
            .hostname("files.example.org")
            .key(KeyType::Rsa, 1024)
            .serial(serials.next_asn1().unwrap())
            .build()
            .unwrap();

        assert!(cert.verify(&ca_key).unwrap());
        assert_eq!(
            cert.issuer_name().to_der().unwrap(),
            ca_cert.subject_name().to_der().unwrap()
        );
        assert_eq!(subject_common_name(&cert), "files.example.org");
        assert!(cert.public_key().unwrap().public_eq(&key));
        let sans: Vec<String> = cert
            .subject_alt_names()
            .unwrap()
            .iter()
            .filter_map(|n| n.dnsname().map(str::to_string))
            .collect();
        assert_eq!(sans, vec!["files.example.org".to_string()]);
    }

    #[test]
    fn test_empty_subject_fields_are_omitted() {
        let serials = SerialCounter::new();
        let (ca_key, ca_cert) = authority(&serials);

        let (_, cert) = LeafBuilder::new(&ca_key, &ca_cert)
            .subject(SubjectFields {
                country: "US".to_string(),
                ..SubjectFields::default()
            })
            .organization("Test Servers")
            .hostname("mail.example.org")
            .key(KeyType::Rsa, 1024)
            .serial(serials.next_asn1().unwrap())
            .build()
            .unwrap();

        let nids: Vec<Nid> = cert
            .subject_name()
            .entries()
            .map(|e| e.object().nid())
            .collect();
        assert_eq!(nids, vec![Nid::COUNTRYNAME, Nid::ORGANIZATIONNAME]);
        assert_eq!(subject_common_name(&cert), "");
    }

    #[test]
    fn test_dsa_key() {
        let serials = SerialCounter::new();
        let (ca_key, ca_cert) = authority(&serials);

        let (key, cert) = LeafBuilder::new(&ca_key, &ca_cert)
            .organization("Test Servers")
            .hostname("dav.example.org")
            .key(KeyType::Dsa, 1024)
            .serial(serials.next_asn1().unwrap())
            .build()
            .unwrap();

        assert_eq!(key.id(), Id::DSA);
        assert_eq!(key.bits(), 1024);
        assert!(cert.verify(&ca_key).unwrap());
    }

    #[test]
    fn test_ec_generation_rejected() {
        let serials = SerialCounter::new();
        let (ca_key, ca_cert) = authority(&serials);

        let result = LeafBuilder::new(&ca_key, &ca_cert)
            .organization("Test Servers")
            .hostname("x.example.org")
            .key(KeyType::Ec, 256)
            .serial(serials.next_asn1().unwrap())
            .build();
        assert!(result.is_err());
    }
}
