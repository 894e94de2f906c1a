//! HTTP client construction for webhook delivery.

use std::fs;

use anyhow::{Context, Result, bail};
use tracing::warn;

use crate::config::TransportConfig;

/// Product identifier sent on every webhook request.
pub const USER_AGENT: &str = concat!("inventory-gateway/", env!("CARGO_PKG_VERSION"));

/// Build the shared reqwest client from transport settings.
///
/// Applies the request timeout, optional mutual TLS (client certificate,
/// key, custom CA) and the explicit insecure-skip-verify escape hatch.
pub fn build_client(config: &TransportConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .timeout(config.timeout)
        .user_agent(USER_AGENT);

    match (&config.tls_cert_path, &config.tls_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let mut pem = fs::read(cert_path)
                .with_context(|| format!("failed to read client certificate {cert_path}"))?;
            pem.extend(
                fs::read(key_path)
                    .with_context(|| format!("failed to read client key {key_path}"))?,
            );
            let identity = reqwest::Identity::from_pem(&pem)
                .context("failed to parse client certificate/key PEM")?;
            builder = builder.identity(identity);
        }
        (None, None) => {}
        _ => bail!("mutual TLS requires both a certificate and a key path"),
    }

    if let Some(ca_path) = &config.tls_ca_path {
        let pem =
            fs::read(ca_path).with_context(|| format!("failed to read CA bundle {ca_path}"))?;
        let ca = reqwest::Certificate::from_pem(&pem).context("failed to parse CA bundle PEM")?;
        builder = builder.add_root_certificate(ca);
    }

    if config.insecure_skip_verify {
        warn!(
            "TLS server certificate verification is DISABLED for webhook delivery; \
             never run this way in production"
        );
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().context("failed to build HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_default_transport_builds() {
        let client = build_client(&TransportConfig::default());
        assert!(client.is_ok());
    }

    #[test]
    fn test_cert_without_key_is_rejected() {
        let config = TransportConfig {
            tls_cert_path: Some("/tmp/client.pem".to_string()),
            ..Default::default()
        };
        let err = build_client(&config).unwrap_err();
        assert!(err.to_string().contains("certificate and a key"));
    }

    #[test]
    fn test_timeout_is_applied() {
        let config = TransportConfig {
            timeout: Duration::from_millis(250),
            ..Default::default()
        };
        assert!(build_client(&config).is_ok());
    }

    #[test]
    fn test_user_agent_names_product() {
        assert!(USER_AGENT.starts_with("inventory-gateway/"));
    }
}
