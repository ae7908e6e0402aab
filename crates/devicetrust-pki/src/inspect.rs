//! Certificate inspection and signature verification

use serde::Serialize;
use ::time::OffsetDateTime;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::*;

use crate::{parse_pem, PkiError, Result};

/// Summary of a certificate's subject, serial and validity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateInfo {
    /// When the certificate becomes valid (Unix timestamp)
    pub not_before: i64,
    /// When the certificate expires (Unix timestamp)
    pub not_after: i64,
    /// Subject common name
    pub common_name: String,
    /// Subject organizational unit, if present
    pub organizational_unit: Option<String>,
    /// Issuer common name
    pub issuer_common_name: String,
    /// Serial number as uppercase hex without leading zeros
    pub serial_hex: String,
    /// DNS subject alternative names
    pub dns_names: Vec<String>,
    /// Whether basicConstraints marks this as a CA
    pub is_ca: bool,
}

impl CertificateInfo {
    /// Parse certificate info from PEM-encoded certificate
    pub fn from_pem(pem_data: &str) -> Result<Self> {
        let der = parse_pem(pem_data)?;
        Self::from_der(&der)
    }

    /// Parse certificate info from DER-encoded certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;

        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        let issuer_common_name = cert
            .issuer()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .unwrap_or("")
            .to_string();
        let organizational_unit = cert
            .subject()
            .iter_organizational_unit()
            .next()
            .and_then(|ou| ou.as_str().ok())
            .map(str::to_string);

        let dns_names = match cert.subject_alternative_name() {
            Ok(Some(san)) => san
                .value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect(),
            Ok(None) => Vec::new(),
            Err(e) => {
                return Err(PkiError::ParseError(format!(
                    "bad subjectAltName extension: {}",
                    e
                )))
            }
        };

        let is_ca = cert
            .basic_constraints()
            .ok()
            .flatten()
            .map(|bc| bc.value.ca)
            .unwrap_or(false);

        Ok(Self {
            not_before: cert.validity().not_before.timestamp(),
            not_after: cert.validity().not_after.timestamp(),
            common_name,
            organizational_unit,
            issuer_common_name,
            serial_hex: serial_hex(cert.raw_serial()),
            dns_names,
            is_ca,
        })
    }

    /// Serial number as an integer, if it fits in 64 bits
    pub fn serial_number(&self) -> Option<u64> {
        u64::from_str_radix(&self.serial_hex, 16).ok()
    }

    /// Total lifetime of the certificate in seconds
    pub fn lifetime_secs(&self) -> i64 {
        self.not_after - self.not_before
    }

    /// Seconds remaining until certificate expires
    pub fn remaining_secs(&self) -> i64 {
        self.not_after - OffsetDateTime::now_utc().unix_timestamp()
    }

    /// Check if certificate has expired
    pub fn is_expired(&self) -> bool {
        self.remaining_secs() <= 0
    }
}

fn serial_hex(raw: &[u8]) -> String {
    let significant: Vec<u8> = raw.iter().copied().skip_while(|b| *b == 0).collect();
    if significant.is_empty() {
        return "0".to_string();
    }
    let mut hex: String = significant.iter().map(|b| format!("{:02X}", b)).collect();
    if hex.starts_with('0') {
        hex.remove(0);
    }
    hex
}

/// Check that `cert_pem` carries a valid signature from `issuer_pem`'s key
///
/// Returns `Ok(false)` when the signature does not verify, and an error only
/// when either certificate fails to parse.
pub fn verify_signed_by(cert_pem: &str, issuer_pem: &str) -> Result<bool> {
    let cert_der = parse_pem(cert_pem)?;
    let issuer_der = parse_pem(issuer_pem)?;

    let (_, cert) = X509Certificate::from_der(&cert_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse certificate: {}", e)))?;
    let (_, issuer) = X509Certificate::from_der(&issuer_der)
        .map_err(|e| PkiError::ParseError(format!("failed to parse issuer: {}", e)))?;

    Ok(cert.verify_signature(Some(issuer.public_key())).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicetrust_common::config::CaSettings;

    use crate::CaIdentity;

    #[test]
    fn serial_hex_strips_leading_zeros() {
        assert_eq!(serial_hex(&[0, 0, 0, 1]), "1");
        assert_eq!(serial_hex(&[0x00, 0x9a, 0x01]), "9A01");
        assert_eq!(serial_hex(&[0x0f, 0xff]), "FFF");
        assert_eq!(serial_hex(&[0]), "0");
    }

    #[test]
    fn oversized_serial_has_no_integer_form() {
        let info = CertificateInfo {
            not_before: 0,
            not_after: 1,
            common_name: String::new(),
            organizational_unit: None,
            issuer_common_name: String::new(),
            serial_hex: "0102030405060708090A".to_string(),
            dns_names: Vec::new(),
            is_ca: false,
        };
        assert_eq!(info.serial_number(), None);
        assert!(info.is_expired());
    }

    #[test]
    fn ca_info_reports_ca_and_ten_year_lifetime() {
        let ca = CaIdentity::self_signed(&CaSettings::default()).unwrap();
        let info = CertificateInfo::from_pem(ca.ca_certificate_pem()).unwrap();

        assert!(info.is_ca);
        assert_eq!(info.common_name, "Makerspace Device CA");
        assert_eq!(info.issuer_common_name, "Makerspace Device CA");
        assert!(info.dns_names.is_empty());
        assert!(!info.is_expired());
        assert!(info.remaining_secs() > 9 * 365 * 86_400);
    }

    #[test]
    fn self_signed_ca_verifies_against_itself() {
        let ca = CaIdentity::self_signed(&CaSettings::default()).unwrap();
        assert!(verify_signed_by(ca.ca_certificate_pem(), ca.ca_certificate_pem()).unwrap());
    }

    #[test]
    fn garbage_is_a_parse_error() {
        assert!(matches!(
            CertificateInfo::from_pem("not a certificate"),
            Err(PkiError::ParseError(_))
        ));
        assert!(verify_signed_by("nope", "nope").is_err());
    }
}
