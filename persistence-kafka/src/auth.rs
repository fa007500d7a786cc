use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rdkafka::ClientConfig;

use crate::config::AuthConfig;
use crate::error::ConfigurationError;

/// Looks up a secret by name. The config only ever carries names, the
/// values come from here.
pub trait SecretResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<String>;
}

/// Resolves secrets from the process environment.
pub struct EnvResolver;

impl SecretResolver for EnvResolver {
    fn resolve(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl SecretResolver for HashMap<String, String> {
    fn resolve(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    ScramSha512,
    ScramSha256,
    Plain,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::Plain => "PLAIN",
        }
    }
}

impl FromStr for SaslMechanism {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_ref() {
            "SCRAM-SHA-512" => Ok(SaslMechanism::ScramSha512),
            "SCRAM-SHA-256" => Ok(SaslMechanism::ScramSha256),
            "PLAIN" => Ok(SaslMechanism::Plain),
            _ => Err(ConfigurationError::UnsupportedMechanism(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

/// Decoded broker credentials, built once at startup and applied to every
/// client configuration.
#[derive(Clone)]
pub struct AuthContext {
    username: String,
    password: String,
    ca_pem: String,
    mechanism: SaslMechanism,
    min_tls_version: TlsVersion,
}

impl AuthContext {
    /// Returns `None` when auth is disabled.
    pub fn from_config(
        config: &AuthConfig,
        resolver: &dyn SecretResolver,
    ) -> Result<Option<Self>, ConfigurationError> {
        if !config.enable_auth {
            return Ok(None);
        }

        let mechanism = config.mechanism.parse()?;
        let ca_pem = decode_ca_certificate(&config.certificate_env, resolver)?;
        let password = decode_text(
            &config.password_env,
            &require(&config.password_env, resolver)?,
        )?;
        let username = require(&config.username_env, resolver)?;

        Ok(Some(Self {
            username,
            password,
            ca_pem,
            mechanism,
            min_tls_version: TlsVersion::V1_2,
        }))
    }

    /// Populates TLS and SASL settings. Only the configured CA is trusted and
    /// both certificate and hostname verification stay on.
    pub fn apply(&self, client_config: &mut ClientConfig) {
        client_config
            .set("security.protocol", "sasl_ssl")
            .set("ssl.ca.pem", &self.ca_pem)
            .set("enable.ssl.certificate.verification", "true")
            .set("ssl.endpoint.identification.algorithm", "https")
            .set("sasl.mechanism", self.mechanism.as_str())
            .set("sasl.username", &self.username)
            .set("sasl.password", &self.password);
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn mechanism(&self) -> SaslMechanism {
        self.mechanism
    }

    pub fn min_tls_version(&self) -> TlsVersion {
        self.min_tls_version
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthContext")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("mechanism", &self.mechanism)
            .field("min_tls_version", &self.min_tls_version)
            .finish_non_exhaustive()
    }
}

fn require(name: &str, resolver: &dyn SecretResolver) -> Result<String, ConfigurationError> {
    match resolver.resolve(name) {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ConfigurationError::MissingEnvVar {
            name: name.to_owned(),
        }),
    }
}

fn decode_text(name: &str, encoded: &str) -> Result<String, ConfigurationError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|source| ConfigurationError::InvalidBase64 {
            name: name.to_owned(),
            source,
        })?;

    String::from_utf8(bytes).map_err(|_| ConfigurationError::InvalidUtf8 {
        name: name.to_owned(),
    })
}

fn decode_ca_certificate(
    name: &str,
    resolver: &dyn SecretResolver,
) -> Result<String, ConfigurationError> {
    let pem = decode_text(name, &require(name, resolver)?)?;

    let invalid = |reason: String| ConfigurationError::InvalidCertificate {
        name: name.to_owned(),
        reason,
    };
    let certificates = rustls_pemfile::certs(&mut pem.as_bytes())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid(e.to_string()))?;
    if certificates.is_empty() {
        return Err(invalid("no PEM certificate found".to_owned()));
    }

    Ok(pem)
}
