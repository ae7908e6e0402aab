//! Inspect command

use std::fs;
use std::path::PathBuf;

use clap::Args;
use serde::Serialize;

use devicetrust_pki::{verify_signed_by, CertificateInfo};

use crate::commands::render_json;
use crate::Result;

/// Summarize a PEM certificate
#[derive(Args, Debug)]
pub struct InspectArgs {
    /// Certificate file (PEM); only the first certificate is read
    pub path: PathBuf,

    /// Check the certificate's signature against this CA certificate (PEM)
    #[arg(long)]
    pub ca: Option<PathBuf>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Inspection {
    #[serde(flatten)]
    info: CertificateInfo,
    expired: bool,
    remaining_secs: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    signed_by_ca: Option<bool>,
}

pub fn run(args: InspectArgs) -> Result<String> {
    let pem = fs::read_to_string(&args.path)?;
    let info = CertificateInfo::from_pem(&pem)?;

    let signed_by_ca = match &args.ca {
        Some(ca_path) => {
            let ca = fs::read_to_string(ca_path)?;
            Some(verify_signed_by(&pem, &ca)?)
        }
        None => None,
    };

    render_json(&Inspection {
        expired: info.is_expired(),
        remaining_secs: info.remaining_secs(),
        info,
        signed_by_ca,
    })
}
