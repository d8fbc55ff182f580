//! Directory server addressing and TLS setup.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rustls::{Certificate, ClientConfig, RootCertStore, ServerName};
use std::sync::Arc;
use std::time::Duration;
use url::{Host, Url};
use x509_parser::pem::Pem;

use dirsync_connector::error::{ConnectorError, ConnectorResult};

use crate::config::LdapRequest;

const LDAP_PORT: u16 = 389;
const LDAPS_PORT: u16 = 636;

/// Parsed directory server location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapTarget {
    secure: bool,
    host: String,
    port: u16,
}

impl LdapTarget {
    /// Parse `ldap://host[:port]`, `ldaps://host[:port]` or a bare `host[:port]`.
    ///
    /// IPv6 literals must be bracketed when a port is given.
    pub fn parse(base_url: &str) -> ConnectorResult<Self> {
        let trimmed = base_url.trim();
        let with_scheme = if trimmed.contains("://") {
            trimmed.to_string()
        } else {
            format!("ldap://{trimmed}")
        };

        let url = Url::parse(&with_scheme).map_err(|e| {
            ConnectorError::invalid_configuration(format!("invalid base_url '{base_url}': {e}"))
        })?;

        let secure = match url.scheme() {
            "ldap" => false,
            "ldaps" => true,
            other => {
                return Err(ConnectorError::invalid_configuration(format!(
                    "unsupported scheme '{other}' in base_url"
                )))
            }
        };

        let host = match url.host() {
            Some(Host::Domain(domain)) if !domain.is_empty() => domain.to_string(),
            Some(Host::Ipv4(addr)) => addr.to_string(),
            Some(Host::Ipv6(addr)) => addr.to_string(),
            _ => {
                return Err(ConnectorError::invalid_configuration(format!(
                    "base_url '{base_url}' has no host"
                )))
            }
        };

        let port = url
            .port()
            .unwrap_or(if secure { LDAPS_PORT } else { LDAP_PORT });

        Ok(Self { secure, host, port })
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Host without brackets; used as the TLS server name.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn scheme(&self) -> &'static str {
        if self.secure {
            "ldaps"
        } else {
            "ldap"
        }
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Connection URL.
    pub fn url(&self) -> String {
        format!("{}://{}", self.scheme(), self.address())
    }

    /// TLS server name derived from the host.
    pub fn server_name(&self) -> ConnectorResult<ServerName> {
        ServerName::try_from(self.host.as_str()).map_err(|e| {
            ConnectorError::invalid_configuration(format!(
                "'{}' is not a valid TLS server name: {e}",
                self.host
            ))
        })
    }
}

/// Build a TLS client config trusting the certificates in a base64 PEM chain.
pub fn tls_config_from_chain(chain: &str) -> ConnectorResult<Arc<ClientConfig>> {
    let pem_bytes = BASE64.decode(chain.trim()).map_err(|e| {
        ConnectorError::invalid_configuration(format!("certificate chain is not valid base64: {e}"))
    })?;

    let mut roots = RootCertStore::empty();
    for pem in Pem::iter_from_buffer(&pem_bytes) {
        let pem = pem.map_err(|e| {
            ConnectorError::invalid_configuration(format!("certificate chain is not valid PEM: {e}"))
        })?;
        if pem.label != "CERTIFICATE" {
            continue;
        }
        pem.parse_x509().map_err(|e| {
            ConnectorError::invalid_configuration(format!("invalid certificate in chain: {e}"))
        })?;
        roots.add(&Certificate(pem.contents.clone())).map_err(|e| {
            ConnectorError::invalid_configuration(format!("certificate cannot be trusted: {e}"))
        })?;
    }

    if roots.is_empty() {
        return Err(ConnectorError::invalid_configuration(
            "certificate chain contains no certificates",
        ));
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Everything needed to open and bind one directory connection.
#[derive(Clone)]
pub struct DialTarget {
    /// `ldap3` derives the TLS server name from the host of this URL.
    pub url: String,
    /// Custom trust roots; `None` uses the platform defaults.
    pub tls_config: Option<Arc<ClientConfig>>,
    pub bind_dn: String,
    pub bind_password: String,
    pub connect_timeout: Duration,
    session_address: String,
}

impl std::fmt::Debug for DialTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialTarget")
            .field("url", &self.url)
            .field("custom_roots", &self.tls_config.is_some())
            .field("bind_dn", &self.bind_dn)
            .field("bind_password", &"***REDACTED***")
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl DialTarget {
    /// Resolve the dial target of a request.
    pub fn from_request(request: &LdapRequest, connect_timeout: Duration) -> ConnectorResult<Self> {
        let target = LdapTarget::parse(&request.base_url)?;

        let tls_config = match (&request.connection_params.certificate_chain, target.is_secure()) {
            (Some(chain), true) if !chain.trim().is_empty() => Some(tls_config_from_chain(chain)?),
            _ => None,
        };
        if target.is_secure() {
            target.server_name()?;
        }

        let (bind_dn, bind_password) = request.auth.bind_credentials();

        Ok(Self {
            url: target.url(),
            tls_config,
            bind_dn: bind_dn.to_string(),
            bind_password: bind_password.to_string(),
            connect_timeout,
            session_address: format!("{}://{}@{}", target.scheme(), bind_dn, target.address()),
        })
    }

    /// Address part of session cache keys; distinct per bind identity.
    pub fn session_address(&self) -> &str {
        &self.session_address
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_CA: &str = "-----BEGIN CERTIFICATE-----
MIIBizCCATGgAwIBAgIUO3JvYE3l93t5RnDk1uGO1v+Z//IwCgYIKoZIzj0EAwIw
GjEYMBYGA1UEAwwPZGMxLmV4YW1wbGUuY29tMCAXDTI2MTAxOTAyMTA0MFoYDzIx
MjYwOTI1MDIxMDQwWjAaMRgwFgYDVQQDDA9kYzEuZXhhbXBsZS5jb20wWTATBgcq
hkjOPQIBBggqhkjOPQMBBwNCAATFxuDqm6cFaLoMDoyRYyqZzQakRiN6Xl2gBvgu
OJUqb9y6chT1uWuXIcDro7WdXj8icxTX8R3ZR7ib323hfXdmo1MwUTAdBgNVHQ4E
FgQU3n8OsN5So/aj7lgBy9cp+9wI/OUwHwYDVR0jBBgwFoAU3n8OsN5So/aj7lgB
y9cp+9wI/OUwDwYDVR0TAQH/BAUwAwEB/zAKBggqhkjOPQQDAgNIADBFAiEAq855
StWNy03e4ifNB39TWkENH3ztk9OCIBgPw+3Qq98CIEMjHZ0O2Z1ARBdCbiXevXbV
Gc+n1kN2JU+B25gifc2n
-----END CERTIFICATE-----
";

    #[test]
    fn test_parse_ldap_url_defaults() {
        let target = LdapTarget::parse("ldap://dc1.example.com").unwrap();
        assert!(!target.is_secure());
        assert_eq!(target.port(), 389);
        assert_eq!(target.url(), "ldap://dc1.example.com:389");

        let target = LdapTarget::parse("ldaps://dc1.example.com").unwrap();
        assert!(target.is_secure());
        assert_eq!(target.port(), 636);
    }

    #[test]
    fn test_parse_bare_host_with_port() {
        let target = LdapTarget::parse("dc1.example.com:3268").unwrap();
        assert!(!target.is_secure());
        assert_eq!(target.address(), "dc1.example.com:3268");
    }

    #[test]
    fn test_parse_ipv6_literal() {
        let target = LdapTarget::parse("ldaps://[2001:db8::10]:3269").unwrap();
        assert_eq!(target.host(), "2001:db8::10");
        assert_eq!(target.port(), 3269);
        assert_eq!(target.address(), "[2001:db8::10]:3269");
        assert_eq!(target.url(), "ldaps://[2001:db8::10]:3269");
        assert!(target.server_name().is_ok());
    }

    #[test]
    fn test_parse_rejects_other_schemes() {
        assert!(LdapTarget::parse("https://dc1.example.com").is_err());
        assert!(LdapTarget::parse("ldap://").is_err());
    }

    #[test]
    fn test_tls_config_from_chain() {
        let chain = BASE64.encode(TEST_CA);
        assert!(tls_config_from_chain(&chain).is_ok());
    }

    #[test]
    fn test_tls_config_rejects_bad_chain() {
        assert!(tls_config_from_chain("***").is_err());
        assert!(tls_config_from_chain(&BASE64.encode("no certificates here")).is_err());
    }
}
