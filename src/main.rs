//! Certkeeper - certificate inventory console
//!
//! Opens the material directories named in the configuration file (first
//! argument, default `config.toml`) and offers an interactive menu for
//! inspecting certificates and domain authorities.
//!
//! # Example Usage
//!
//! ```bash
//! cargo build --release
//! ./target/release/certkeeper /etc/certkeeper/config.toml
//! ```
//!
//! The menu provides:
//! 1. Listing certificates with their assignments
//! 2. Listing domain certificate authorities
//! 3. Rescanning the material directories

use anyhow::{Context, Result};
use std::io::{self, Write};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use certkeeper::configs::AppConfig;
use certkeeper::consumers::{Consumers, TomlConfigStore};
use certkeeper::records::{AuthorityFilter, CertificateFilter};
use certkeeper::storage::Namespace;
use certkeeper::Certkeeper;

const DEFAULT_CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = AppConfig::from_file(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    println!("=== Certkeeper ===\n");
    let settings = Arc::new(
        TomlConfigStore::open(&config.settings_path).with_context(|| {
            format!(
                "Failed to open settings store {}",
                config.settings_path.display()
            )
        })?,
    );
    let keeper = Certkeeper::from_config(&config, Consumers::standalone(settings))
        .context("Failed to open material store")?;
    println!(
        "✓ Material store opened at {}",
        keeper.store.directories().cert_dir.display()
    );

    loop {
        println!("\n=== Certkeeper Menu ===");
        println!("1. List Certificates");
        println!("2. List Certificate Authorities");
        println!("3. Rescan Material Directories");
        println!("4. Exit");
        print!("\nSelect an option: ");
        io::stdout().flush()?;

        let mut choice = String::new();
        if io::stdin().read_line(&mut choice)? == 0 {
            break;
        }

        match choice.trim() {
            "1" => list_certificates(&keeper)?,
            "2" => list_authorities(&keeper)?,
            "3" => rescan(&keeper)?,
            "4" => {
                println!("\nExiting Certkeeper...");
                break;
            }
            _ => println!("Invalid option. Please select 1-4."),
        }
    }

    Ok(())
}

fn list_certificates(keeper: &Certkeeper) -> Result<()> {
    println!("\n=== Certificates ===");
    let certs = keeper.certificates.list(&CertificateFilter::all())?;
    if certs.is_empty() {
        println!("No certificates found.");
        return Ok(());
    }
    for cert in &certs {
        println!("{}", serde_json::to_string_pretty(cert)?);
    }
    println!("\n{} certificate(s)", certs.len());
    Ok(())
}

fn list_authorities(keeper: &Certkeeper) -> Result<()> {
    println!("\n=== Certificate Authorities ===");
    let authorities = keeper.authorities.list(&AuthorityFilter::all())?;
    if authorities.is_empty() {
        println!("No certificate authorities found.");
        return Ok(());
    }
    for ca in &authorities {
        println!("{}  expires {}  {}", ca.name, ca.expiry, ca.cert_path.display());
    }
    Ok(())
}

fn rescan(keeper: &Certkeeper) -> Result<()> {
    keeper.store.invalidate(Namespace::Certificates);
    keeper.store.invalidate(Namespace::Authorities);
    let certs = keeper.certificates.list(&CertificateFilter::all())?;
    let authorities = keeper.authorities.list(&AuthorityFilter::all())?;
    println!(
        "✓ Rescanned: {} certificate(s), {} authorit{}",
        certs.len(),
        authorities.len(),
        if authorities.len() == 1 { "y" } else { "ies" }
    );
    Ok(())
}
