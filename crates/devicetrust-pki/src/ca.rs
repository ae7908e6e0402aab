//! CA identity and the process-wide key material store
//!
//! A [`CaIdentity`] is either a freshly generated self-signed root or an
//! issuing CA loaded from secret material together with its ancestors. The
//! private key never leaves this module except as a signing capability.
//!
//! The serial counter is the only mutable state. It is guarded by a mutex
//! that is held for the whole sign operation, so serial allocation and
//! signing form one step.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SerialNumber,
    SignatureAlgorithm,
};
use ::time::{Duration, OffsetDateTime};
use tracing::{debug, info};
use x509_parser::prelude::*;

use devicetrust_common::config::{CaMode, CaSettings, KeyAlgorithm};

use crate::{parse_certificate_bundle, parse_pem, PkiError, Result};

/// Serial number of a generated self-signed CA certificate
pub const CA_SERIAL: u64 = 1;

/// Validity of a generated self-signed CA certificate (10 years)
pub const CA_VALIDITY_DAYS: i64 = 3650;

/// Current time truncated to whole seconds
///
/// X.509 times carry second precision; truncating up front keeps the values
/// we report identical to what ends up in the certificate.
pub(crate) fn now_utc_seconds() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now - Duration::nanoseconds(i64::from(now.nanosecond()))
}

/// rcgen signature algorithm for a configured key algorithm
pub(crate) fn signature_algorithm(algorithm: KeyAlgorithm) -> &'static SignatureAlgorithm {
    match algorithm {
        KeyAlgorithm::EcdsaP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
        KeyAlgorithm::EcdsaP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
    }
}

/// Generate a key pair for the configured algorithm
pub(crate) fn generate_key_pair(algorithm: KeyAlgorithm) -> Result<KeyPair> {
    KeyPair::generate_for(signature_algorithm(algorithm))
        .map_err(|e| PkiError::KeyGenerationFailed(e.to_string()))
}

/// The certificate authority that signs device certificates
pub struct CaIdentity {
    mode: CaMode,
    /// PEM certificates, root first; the last entry is the issuing certificate
    chain: Vec<String>,
    issuer: Issuer<'static, KeyPair>,
    key_algorithm: KeyAlgorithm,
    /// Last serial handed out
    serial: Mutex<u64>,
}

impl std::fmt::Debug for CaIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaIdentity")
            .field("mode", &self.mode)
            .field("chain_len", &self.chain.len())
            .field("key_algorithm", &self.key_algorithm)
            .field("serial", &*self.serial.lock())
            .finish_non_exhaustive()
    }
}

impl CaIdentity {
    /// Generate a new self-signed root CA from the configured subject
    pub fn self_signed(settings: &CaSettings) -> Result<Self> {
        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(
            DnType::CommonName,
            DnValue::Utf8String(settings.common_name.clone()),
        );
        dn.push(DnType::CountryName, settings.country.as_str());
        dn.push(DnType::StateOrProvinceName, settings.state.as_str());
        dn.push(DnType::LocalityName, settings.locality.as_str());
        dn.push(DnType::OrganizationName, settings.organization.as_str());
        dn.push(
            DnType::OrganizationalUnitName,
            settings.organizational_unit.as_str(),
        );
        params.distinguished_name = dn;

        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::CodeSigning,
            ExtendedKeyUsagePurpose::EmailProtection,
            ExtendedKeyUsagePurpose::TimeStamping,
        ];
        params.serial_number = Some(SerialNumber::from_slice(&CA_SERIAL.to_be_bytes()));

        let not_before = now_utc_seconds();
        params.not_before = not_before;
        params.not_after = not_before + Duration::days(CA_VALIDITY_DAYS);

        let key_pair = generate_key_pair(settings.key_algorithm)?;
        let cert = params.self_signed(&key_pair).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!("failed to create CA cert: {}", e))
        })?;
        let cert_pem = cert.pem();

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        info!(
            common_name = %settings.common_name,
            key_algorithm = ?settings.key_algorithm,
            "Generated self-signed CA"
        );

        Ok(Self {
            mode: CaMode::SelfSigned,
            chain: vec![cert_pem],
            issuer,
            key_algorithm: settings.key_algorithm,
            serial: Mutex::new(CA_SERIAL),
        })
    }

    /// Load an issuing CA from PEM material
    ///
    /// `ancestors_pem` holds the issuer of `cert_pem` first, then its issuer,
    /// up to the root. Each link must be signed by the next one.
    pub fn intermediate(
        cert_pem: &str,
        key_pem: &str,
        ancestors_pem: &str,
        key_algorithm: KeyAlgorithm,
    ) -> Result<Self> {
        let key_pair = KeyPair::from_pem(key_pem)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA key: {}", e)))?;

        let cert_der = parse_pem(cert_pem)?;
        let (_, cert) = X509Certificate::from_der(&cert_der)
            .map_err(|e| PkiError::ParseError(format!("failed to parse CA cert: {}", e)))?;

        if cert.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
            return Err(PkiError::KeyMismatch);
        }

        let is_ca = cert
            .basic_constraints()
            .map_err(|e| PkiError::ParseError(format!("bad basicConstraints: {}", e)))?
            .map(|ext| ext.value.ca)
            .unwrap_or(false);
        if !is_ca {
            return Err(PkiError::InvalidCaCertificate(
                "basicConstraints does not mark the certificate as a CA".to_string(),
            ));
        }
        if !cert.validity().is_valid() {
            return Err(PkiError::InvalidCaCertificate(
                "certificate is outside its validity period".to_string(),
            ));
        }

        let ancestors = parse_certificate_bundle(ancestors_pem)?;
        verify_chain_links(&cert, &ancestors)?;

        let mut chain: Vec<String> = ancestors.into_iter().rev().map(|(pem, _)| pem).collect();
        let cert_pem = ::pem::encode(&::pem::Pem::new("CERTIFICATE", cert_der.clone()));
        chain.push(cert_pem.clone());

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| PkiError::ParseError(format!("failed to create issuer: {}", e)))?;

        let subject = cert.subject().to_string();
        let serial_base = serial_base_above(cert.raw_serial());
        info!(
            subject = %subject,
            chain_len = chain.len(),
            serial_base = serial_base,
            "Loaded intermediate CA"
        );

        Ok(Self {
            mode: CaMode::Intermediate,
            chain,
            issuer,
            key_algorithm,
            serial: Mutex::new(serial_base),
        })
    }

    /// Build the identity described by the CA settings
    pub fn from_settings(settings: &CaSettings) -> Result<Self> {
        match settings.mode {
            CaMode::SelfSigned => Self::self_signed(settings),
            CaMode::Intermediate => {
                let cert = required_secret(settings.cert.as_ref(), "ca.cert")?;
                let key = required_secret(settings.key.as_ref(), "ca.key")?;
                let chain = required_secret(settings.chain.as_ref(), "ca.chain")?;
                Self::intermediate(&cert, &key, &chain, settings.key_algorithm)
            }
        }
    }

    /// How this identity was obtained
    pub fn mode(&self) -> CaMode {
        self.mode
    }

    /// Algorithm used for device key pairs
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    /// Chain head: the root-most certificate, used as the device trust anchor
    pub fn ca_certificate_pem(&self) -> &str {
        // chain always holds at least the issuing certificate
        &self.chain[0]
    }

    /// The certificate that signs device certificates
    pub fn issuing_certificate_pem(&self) -> &str {
        &self.chain[self.chain.len() - 1]
    }

    /// Every certificate of the chain, root first
    pub fn chain(&self) -> &[String] {
        &self.chain
    }

    /// The chain as one PEM bundle, root first
    pub fn chain_pem(&self) -> String {
        self.chain.concat()
    }

    /// Last serial number handed out
    pub fn current_serial(&self) -> u64 {
        *self.serial.lock()
    }

    /// Allocate the next serial and sign with it while holding the counter
    ///
    /// Serials that were allocated for a failed signing are not reused.
    pub(crate) fn sign_with_next_serial<T>(
        &self,
        sign: impl FnOnce(u64, &Issuer<'static, KeyPair>) -> Result<T>,
    ) -> Result<T> {
        let mut serial = self.serial.lock();
        *serial = serial
            .checked_add(1)
            .ok_or_else(|| PkiError::CertificateGenerationFailed("serial space exhausted".into()))?;
        let allocated = *serial;
        debug!(serial = allocated, "Allocated certificate serial");
        sign(allocated, &self.issuer)
    }
}

fn required_secret(
    source: Option<&devicetrust_common::config::SecretSource>,
    field: &str,
) -> Result<String> {
    let source = source.ok_or_else(|| {
        devicetrust_common::Error::config(format!("intermediate CA mode requires {}", field))
    })?;
    Ok(source.resolve()?)
}

/// Check that `cert` chains through `ancestors` (nearest issuer first)
fn verify_chain_links(cert: &X509Certificate<'_>, ancestors: &[(String, Vec<u8>)]) -> Result<()> {
    let mut parsed = Vec::with_capacity(ancestors.len());
    for (index, (_, der)) in ancestors.iter().enumerate() {
        let (_, ancestor) = X509Certificate::from_der(der).map_err(|e| {
            PkiError::InvalidChain(format!("certificate {} does not parse: {}", index, e))
        })?;
        parsed.push(ancestor);
    }

    let mut child = cert;
    for (index, parent) in parsed.iter().enumerate() {
        if child.issuer().as_raw() != parent.subject().as_raw() {
            return Err(PkiError::InvalidChain(format!(
                "certificate {} ({}) did not issue {}",
                index,
                parent.subject(),
                child.subject()
            )));
        }
        child
            .verify_signature(Some(parent.public_key()))
            .map_err(|e| {
                PkiError::InvalidChain(format!(
                    "signature on {} does not verify against {}: {}",
                    child.subject(),
                    parent.subject(),
                    e
                ))
            })?;
        child = parent;
    }
    Ok(())
}

/// Starting serial for a loaded CA
///
/// Leaf serials start above both the clock seed and the issuing
/// certificate's own serial. A serial wider than 64 bits (typical for
/// externally issued CAs with 16-20 byte random serials) cannot be exceeded
/// by a `u64`; leaves then count from the clock seed alone, which is still
/// unique under this issuer.
fn serial_base_above(ca_serial: &[u8]) -> u64 {
    let clock = time_seeded_serial_base();
    match serial_to_u64(ca_serial) {
        Some(serial) => clock.max(serial),
        None => clock,
    }
}

/// Big-endian serial bytes as a `u64`, if they fit
fn serial_to_u64(raw: &[u8]) -> Option<u64> {
    let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    let digits = &raw[start..];
    if digits.len() > 8 {
        return None;
    }
    Some(digits.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
}

/// Clock-derived serial seed
///
/// A loaded CA outlives the process, so counting from 1 again after a
/// restart would reissue serials. Seeding from the clock keeps later runs
/// above earlier ones unless more than a thousand certificates were issued
/// per millisecond of downtime.
fn time_seeded_serial_base() -> u64 {
    let millis = OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000;
    u64::try_from(millis).unwrap_or(0).saturating_mul(1000)
}

/// Holds the single CA identity of the process
///
/// Constructed empty, initialized once at startup, then shared read-only.
#[derive(Debug, Default)]
pub struct KeyMaterialStore {
    identity: OnceLock<Arc<CaIdentity>>,
    init_lock: Mutex<()>,
}

impl KeyMaterialStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the CA identity from settings and make it resident
    ///
    /// Fails with [`PkiError::AlreadyInitialized`] on a second call.
    pub fn initialize(&self, settings: &CaSettings) -> Result<Arc<CaIdentity>> {
        let _guard = self.init_lock.lock();
        if self.identity.get().is_some() {
            return Err(PkiError::AlreadyInitialized);
        }
        let identity = CaIdentity::from_settings(settings)?;
        self.install_locked(identity)
    }

    /// Make an already-built identity resident
    pub fn install(&self, identity: CaIdentity) -> Result<Arc<CaIdentity>> {
        let _guard = self.init_lock.lock();
        self.install_locked(identity)
    }

    fn install_locked(&self, identity: CaIdentity) -> Result<Arc<CaIdentity>> {
        let identity = Arc::new(identity);
        self.identity
            .set(identity.clone())
            .map_err(|_| PkiError::AlreadyInitialized)?;
        Ok(identity)
    }

    /// The resident identity
    pub fn identity(&self) -> Result<Arc<CaIdentity>> {
        self.identity.get().cloned().ok_or(PkiError::CaNotInitialized)
    }

    /// Whether `initialize` has completed
    pub fn is_initialized(&self) -> bool {
        self.identity.get().is_some()
    }
}
