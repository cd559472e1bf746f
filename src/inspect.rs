//! Reading fields back out of parsed X509 material.

use chrono::{DateTime, Utc};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::nid::Nid;
use openssl::x509::X509Ref;

use crate::error::{CertError, Result};

/// First CN entry of the subject, or an empty string when there is none.
pub fn subject_common_name(cert: &X509Ref) -> String {
    cert.subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .and_then(|entry| entry.data().as_utf8().ok())
        .map(|cn| cn.to_string())
        .unwrap_or_default()
}

pub fn expiry(cert: &X509Ref) -> Result<DateTime<Utc>> {
    to_utc(cert.not_after())
}

pub fn to_utc(time: &Asn1TimeRef) -> Result<DateTime<Utc>> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    let secs = i64::from(diff.days) * 86_400 + i64::from(diff.secs);
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or_else(|| CertError::Generation {
        name: time.to_string(),
        reason: format!("timestamp {} out of range", secs),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_utc_matches_unix() {
        let t = Asn1Time::from_unix(1_700_000_000).unwrap();
        assert_eq!(to_utc(&t).unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_days_from_now() {
        let t = Asn1Time::days_from_now(730).unwrap();
        let expected = Utc::now() + chrono::Duration::days(730);
        let delta = (to_utc(&t).unwrap() - expected).num_seconds().abs();
        assert!(delta < 60);
    }
}
