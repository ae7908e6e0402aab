//! CA certificate command

use clap::Args;

use crate::{App, Result};

/// Print the CA certificate
#[derive(Args, Debug)]
pub struct CaCertArgs {
    /// Print the full chain, root first, instead of only the root
    #[arg(long)]
    pub chain: bool,
}

pub fn run(app: &App, args: CaCertArgs) -> Result<String> {
    let pem = if args.chain {
        app.coordinator().ca_chain()?
    } else {
        app.coordinator().ca_certificate()?
    };
    Ok(pem.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use devicetrust_common::config::Settings;

    #[test]
    fn prints_root_certificate() {
        let app = App::build(Settings::default(), true).unwrap();
        let pem = run(&app, CaCertArgs { chain: false }).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(pem.ends_with("-----END CERTIFICATE-----"));
    }
}
