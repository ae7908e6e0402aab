//! Device certificate issuance
//!
//! Every device certificate is a client-auth leaf whose CN is the broker
//! authentication name and whose single DNS SAN is the raw device id. The
//! private key is generated here and returned to the caller; nothing is
//! retained.

use std::sync::Arc;

use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    IsCa, KeyUsagePurpose, SanType, SerialNumber,
};
use time::format_description::well_known::Rfc3339;
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use devicetrust_common::config::{IssuanceSettings, MAX_VALIDITY_DAYS};
use devicetrust_common::naming;
use devicetrust_common::validation::{validate_authentication_name, validate_device_id};

use crate::ca::{generate_key_pair, now_utc_seconds, KeyMaterialStore};
use crate::{CaIdentity, PkiError, Result};

/// A freshly issued device certificate and its key pair
///
/// Never mutated after issuance. The private key is redacted from `Debug`.
#[derive(Clone)]
pub struct DeviceCertificate {
    device_id: String,
    authentication_name: String,
    serial_number: u64,
    certificate_pem: String,
    private_key_pem: String,
    public_key_pem: String,
    not_before: OffsetDateTime,
    not_after: OffsetDateTime,
    validity_days: u32,
}

impl std::fmt::Debug for DeviceCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCertificate")
            .field("device_id", &self.device_id)
            .field("authentication_name", &self.authentication_name)
            .field("serial_number", &self.serial_number)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

impl DeviceCertificate {
    /// Device id the certificate was issued for (the DNS SAN)
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Subject CN, equal to the broker authentication name
    pub fn authentication_name(&self) -> &str {
        &self.authentication_name
    }

    /// Serial number, unique per CA identity
    pub fn serial_number(&self) -> u64 {
        self.serial_number
    }

    /// Serial number as uppercase hex, as shown by certificate viewers
    pub fn serial_hex(&self) -> String {
        format!("{:X}", self.serial_number)
    }

    /// Leaf certificate PEM
    pub fn certificate_pem(&self) -> &str {
        &self.certificate_pem
    }

    /// PKCS#8 private key PEM
    pub fn private_key_pem(&self) -> &str {
        &self.private_key_pem
    }

    /// SubjectPublicKeyInfo PEM
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// Start of validity
    pub fn not_before(&self) -> OffsetDateTime {
        self.not_before
    }

    /// End of validity, `not_before + validity_days`
    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    /// Validity window in days
    pub fn validity_days(&self) -> u32 {
        self.validity_days
    }

    /// `not_before` as RFC 3339
    pub fn not_before_rfc3339(&self) -> String {
        rfc3339(self.not_before)
    }

    /// `not_after` as RFC 3339
    pub fn not_after_rfc3339(&self) -> String {
        rfc3339(self.not_after)
    }
}

fn rfc3339(at: OffsetDateTime) -> String {
    at.format(&Rfc3339)
        .unwrap_or_else(|_| at.unix_timestamp().to_string())
}

/// Signs device certificates with the resident CA identity
#[derive(Debug, Clone)]
pub struct CertificateIssuer {
    store: Arc<KeyMaterialStore>,
    subject: IssuanceSettings,
}

impl CertificateIssuer {
    /// Create an issuer over a key material store
    ///
    /// The store may still be empty; issuance then fails with
    /// [`PkiError::CaNotInitialized`].
    pub fn new(store: Arc<KeyMaterialStore>, subject: IssuanceSettings) -> Self {
        Self { store, subject }
    }

    /// Default validity for device certificates
    pub fn default_validity_days(&self) -> u32 {
        self.subject.validity_days
    }

    /// The key material store this issuer signs from
    pub fn store(&self) -> &Arc<KeyMaterialStore> {
        &self.store
    }

    /// Issue a certificate for `device_id`
    ///
    /// The CN is `authentication_name` if given, `{device_id}-authnID`
    /// otherwise. CPU-bound; call from a blocking context when latency
    /// matters.
    pub fn issue_device_certificate(
        &self,
        device_id: &str,
        authentication_name: Option<&str>,
        validity_days: u32,
    ) -> Result<DeviceCertificate> {
        let identity = self.store.identity()?;
        issue(&identity, &self.subject, device_id, authentication_name, validity_days)
    }
}

/// Issue a device certificate from an explicit CA identity
pub fn issue(
    identity: &CaIdentity,
    subject: &IssuanceSettings,
    device_id: &str,
    authentication_name: Option<&str>,
    validity_days: u32,
) -> Result<DeviceCertificate> {
    validate_device_id(device_id).map_err(|e| PkiError::InvalidSubject(e.to_string()))?;
    if let Some(name) = authentication_name {
        validate_authentication_name(name).map_err(|e| PkiError::InvalidSubject(e.to_string()))?;
    }
    if validity_days == 0 || validity_days > MAX_VALIDITY_DAYS {
        return Err(PkiError::InvalidSubject(format!(
            "validity must be between 1 and {} days, got {}",
            MAX_VALIDITY_DAYS, validity_days
        )));
    }

    let authentication_name = naming::authentication_name(device_id, authentication_name);

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, authentication_name.as_str());
    dn.push(DnType::CountryName, subject.country.as_str());
    dn.push(DnType::StateOrProvinceName, subject.state.as_str());
    dn.push(DnType::LocalityName, subject.locality.as_str());
    dn.push(DnType::OrganizationName, subject.organization.as_str());
    dn.push(
        DnType::OrganizationalUnitName,
        subject.organizational_unit.as_str(),
    );
    params.distinguished_name = dn;

    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
        KeyUsagePurpose::DataEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
    params.use_authority_key_identifier_extension = true;

    let san = Ia5String::try_from(device_id.to_string()).map_err(|e| {
        PkiError::InvalidSubject(format!("invalid DNS name '{}': {}", device_id, e))
    })?;
    params.subject_alt_names = vec![SanType::DnsName(san)];

    let not_before = now_utc_seconds();
    let not_after = not_before + Duration::days(i64::from(validity_days));
    params.not_before = not_before;
    params.not_after = not_after;

    let device_key = generate_key_pair(identity.key_algorithm())?;

    let (serial_number, cert) = identity.sign_with_next_serial(|serial, issuer| {
        params.serial_number = Some(SerialNumber::from_slice(&serial.to_be_bytes()));
        let cert = params.signed_by(&device_key, issuer).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to sign device certificate: {}",
                e
            ))
        })?;
        Ok((serial, cert))
    })?;

    debug!(
        device_id = %device_id,
        serial = serial_number,
        "Signed device certificate"
    );
    info!(
        device_id = %device_id,
        authentication_name = %authentication_name,
        validity_days = validity_days,
        "Issued device certificate"
    );

    Ok(DeviceCertificate {
        device_id: device_id.to_string(),
        authentication_name,
        serial_number,
        certificate_pem: cert.pem(),
        private_key_pem: device_key.serialize_pem(),
        public_key_pem: device_key.public_key_pem(),
        not_before,
        not_after,
        validity_days,
    })
}
