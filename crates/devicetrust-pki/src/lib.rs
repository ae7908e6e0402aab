//! Certificate authority and device certificate issuance
//!
//! This crate owns the CA key material and signs device certificates. It
//! performs no network I/O; the only side effect of issuance is advancing the
//! CA's serial counter.
//!
//! # Security Model
//!
//! - The CA key pair lives in memory only and is never serialized to callers
//! - Device key pairs are generated per issuance and handed to the caller once
//! - Device certificates are client-auth leaves with `cA = false`
//! - The subject CN of a device certificate is the broker authentication name
//!
//! # Public API
//!
//! - [`ca::KeyMaterialStore`], [`ca::CaIdentity`]: CA initialization and state
//! - [`issuer::CertificateIssuer`], [`issuer::DeviceCertificate`]: leaf issuance
//! - [`inspect::CertificateInfo`], [`inspect::verify_signed_by`]: inspection

#![deny(missing_docs)]

pub mod ca;
pub mod inspect;
pub mod issuer;

pub use ca::{CaIdentity, KeyMaterialStore};
pub use inspect::{verify_signed_by, CertificateInfo};
pub use issuer::{CertificateIssuer, DeviceCertificate};

use thiserror::Error;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// CA not initialized
    #[error("CA not initialized")]
    CaNotInitialized,

    /// CA initialized more than once
    #[error("CA already initialized")]
    AlreadyInitialized,

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("certificate parsing error: {0}")]
    ParseError(String),

    /// Private key does not belong to the CA certificate
    #[error("CA private key does not match the CA certificate public key")]
    KeyMismatch,

    /// Loaded certificate cannot act as an issuing CA
    #[error("invalid CA certificate: {0}")]
    InvalidCaCertificate(String),

    /// Ancestor chain does not link up to the issuing certificate
    #[error("invalid CA chain: {0}")]
    InvalidChain(String),

    /// Device subject or validity rejected before signing
    #[error("invalid device subject: {0}")]
    InvalidSubject(String),

    /// Secret material or settings could not be loaded
    #[error(transparent)]
    Config(#[from] devicetrust_common::Error),
}

impl PkiError {
    /// Whether this error means the CA is unusable for issuance
    ///
    /// These indicate a startup defect and must never be retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, PkiError::InvalidSubject(_))
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes of the first block
pub fn parse_pem(pem_data: &str) -> std::result::Result<Vec<u8>, PkiError> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

/// Parse every `CERTIFICATE` block in a PEM bundle, in file order
///
/// Returns each certificate re-encoded as canonical PEM alongside its DER.
pub fn parse_certificate_bundle(
    pem_data: &str,
) -> std::result::Result<Vec<(String, Vec<u8>)>, PkiError> {
    let blocks = ::pem::parse_many(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM bundle: {}", e)))?;

    let certs: Vec<(String, Vec<u8>)> = blocks
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| (::pem::encode(&block), block.contents().to_vec()))
        .collect();

    if certs.is_empty() {
        return Err(PkiError::ParseError(
            "no CERTIFICATE blocks found in PEM bundle".to_string(),
        ));
    }
    Ok(certs)
}
