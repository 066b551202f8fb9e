//! Startup flags and validated configuration.
//!
//! Flags keep the dotted names the gateway deployments already reference;
//! parsing turns them into a validated [`Config`] before anything starts
//! serving.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::matcher::{Matcher, MatcherError, MatcherOp};

static VALID_PACKAGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[_A-Za-z]\w*(\.[_A-Za-z]\w*)*$").expect("static regex"));
static VALID_RULE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[_A-Za-z]\w*$").expect("static regex"));

/// Log line format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-oriented key=value lines.
    Logfmt,
    /// One JSON object per line.
    Json,
}

/// Log filtering level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    /// Errors only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational and above.
    Info,
    /// Everything.
    Debug,
}

impl LogLevel {
    /// The level as a tracing filter directive.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
        }
    }
}

/// Command-line flags.
#[derive(Debug, Parser)]
#[command(name = "warden", version, about)]
pub struct Flags {
    /// A name identifying this instance in logs.
    #[arg(long = "debug.name", default_value = "warden")]
    pub name: String,

    /// The log filtering level.
    #[arg(long = "log.level", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// The log format to use.
    #[arg(long = "log.format", value_enum, default_value = "logfmt")]
    pub log_format: LogFormat,

    /// The address on which the public server listens.
    #[arg(long = "web.listen", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// The address on which the internal server listens.
    #[arg(long = "web.internal.listen", default_value = "0.0.0.0:8081")]
    pub listen_internal: SocketAddr,

    /// The URL against which to run healthchecks.
    #[arg(long = "web.healthchecks.url", default_value = "http://localhost:8080")]
    pub healthchecks_url: String,

    /// File containing the TLS certificate for the public server. Leave blank
    /// to disable TLS.
    #[arg(long = "tls.server.cert-file")]
    pub tls_cert_file: Option<PathBuf>,

    /// File containing the TLS private key matching the public certificate.
    #[arg(long = "tls.server.key-file")]
    pub tls_key_file: Option<PathBuf>,

    /// File containing the TLS certificate for the internal server. Leave
    /// blank to disable TLS.
    #[arg(long = "tls.internal.server.cert-file")]
    pub tls_internal_cert_file: Option<PathBuf>,

    /// File containing the TLS private key matching the internal certificate.
    #[arg(long = "tls.internal.server.key-file")]
    pub tls_internal_key_file: Option<PathBuf>,

    /// A path to the kubeconfig used to reach the cluster API. Defaults to
    /// in-cluster or ambient configuration.
    #[arg(long = "openshift.kubeconfig")]
    pub kubeconfig: Option<PathBuf>,

    /// A mapping from tenant to resource API group,
    /// e.g. `application=loki.grafana.com`. Repeatable.
    #[arg(long = "openshift.mappings")]
    pub mappings: Vec<String>,

    /// Use SelfSubjectAccessReview instead of SubjectAccessReview.
    #[arg(long = "opa.ssar")]
    pub ssar: bool,

    /// The name of the OPA package this endpoint implements.
    #[arg(long = "opa.package", default_value = "")]
    pub package: String,

    /// The name of the OPA rule for which to provide a result.
    #[arg(long = "opa.rule", default_value = "allow")]
    pub rule: String,

    /// The label key(s) of the matcher returned to the requesting client.
    /// Comma-separated when an operator is configured.
    #[arg(long = "opa.matcher", default_value = "")]
    pub matcher: String,

    /// The logical operation combining several matcher keys: `and` or `or`.
    #[arg(long = "opa.matcher-op")]
    pub matcher_op: Option<String>,

    /// Tenants for which the label matcher should not be set.
    /// Comma-separated.
    #[arg(long = "opa.skip-tenants", default_value = "")]
    pub skip_tenants: String,

    /// Groups treated as admins, causing the matcher to be omitted.
    /// Comma-separated.
    #[arg(long = "opa.admin-groups", default_value = "")]
    pub admin_groups: String,

    /// Memcached server addresses (`host:port`). When absent, decisions are
    /// cached in memory. Repeatable.
    #[arg(long = "memcached")]
    pub memcached: Vec<String>,

    /// Time after which cached decisions expire, in seconds.
    #[arg(long = "memcached.expire", default_value_t = 60)]
    pub cache_expire: u32,

    /// The interval at which to update the memcached DNS, in seconds; 0
    /// disables updates.
    #[arg(long = "memcached.interval", default_value_t = 10)]
    pub cache_interval: u32,

    /// Debug bearer token used for integration tests.
    #[arg(long = "debug.token", hide = true)]
    pub debug_token: Option<String>,
}

/// Errors raised while validating the flags.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The OPA package name does not look like a package path.
    #[error("invalid OPA package name: {0}")]
    InvalidPackage(String),

    /// The OPA rule name does not look like an identifier.
    #[error("invalid OPA rule name: {0}")]
    InvalidRule(String),

    /// No tenant mappings were configured.
    #[error("missing tenant mappings")]
    MissingMappings,

    /// A mapping was not of the form `tenant=apiGroup`.
    #[error("invalid mapping: {0:?}")]
    InvalidMapping(String),

    /// The matcher operator was not `and`/`or`.
    #[error(transparent)]
    Matcher(#[from] MatcherError),
}

/// Cache backend selection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheBackend {
    /// In-process TTL cache.
    InMemory {
        /// Entry lifetime in seconds.
        expire: u32,
    },
    /// Remote memcached servers.
    Memcached {
        /// `host:port` addresses.
        servers: Vec<String>,
        /// Entry lifetime in seconds.
        expire: u32,
        /// DNS refresh interval in seconds; 0 disables refresh.
        interval: u32,
    },
}

/// TLS material for one listener.
#[derive(Clone, Debug)]
pub struct TlsMaterial {
    /// PEM certificate chain.
    pub cert_file: PathBuf,
    /// PEM private key.
    pub key_file: PathBuf,
}

/// Validated runtime configuration.
#[derive(Debug)]
pub struct Config {
    /// Name added to log lines.
    pub name: String,
    /// Log filtering level.
    pub log_level: LogLevel,
    /// Log format.
    pub log_format: LogFormat,
    /// Public listen address.
    pub listen: SocketAddr,
    /// Internal listen address.
    pub listen_internal: SocketAddr,
    /// URL probed by the internal readiness check.
    pub healthchecks_url: String,
    /// TLS material for the public server, if any.
    pub tls: Option<TlsMaterial>,
    /// TLS material for the internal server, if any.
    pub tls_internal: Option<TlsMaterial>,
    /// Kubeconfig path override.
    pub kubeconfig: Option<PathBuf>,
    /// Tenant to API-group mapping.
    pub mappings: HashMap<String, String>,
    /// Review with the token's own identity instead of the forwarded subject.
    pub ssar: bool,
    /// OPA package name.
    pub package: String,
    /// OPA rule name.
    pub rule: String,
    /// Configured matcher.
    pub matcher: Matcher,
    /// Selected cache backend.
    pub cache: CacheBackend,
    /// Substitute bearer token for requests without the forwarded header.
    pub debug_token: Option<String>,
}

impl Config {
    /// Validate the parsed flags into a runtime configuration.
    pub fn from_flags(flags: Flags) -> Result<Self, ConfigError> {
        if !flags.package.is_empty() && !VALID_PACKAGE.is_match(&flags.package) {
            return Err(ConfigError::InvalidPackage(flags.package));
        }

        if !flags.rule.is_empty() && !VALID_RULE.is_match(&flags.rule) {
            return Err(ConfigError::InvalidRule(flags.rule));
        }

        if flags.mappings.is_empty() {
            return Err(ConfigError::MissingMappings);
        }

        let mut mappings = HashMap::with_capacity(flags.mappings.len());
        for mapping in &flags.mappings {
            let Some((tenant, api_group)) = mapping.split_once('=') else {
                return Err(ConfigError::InvalidMapping(mapping.clone()));
            };
            if tenant.is_empty() || api_group.is_empty() || api_group.contains('=') {
                return Err(ConfigError::InvalidMapping(mapping.clone()));
            }
            mappings.insert(tenant.to_string(), api_group.to_string());
        }

        let op = flags
            .matcher_op
            .as_deref()
            .filter(|raw| !raw.is_empty())
            .map(str::parse::<MatcherOp>)
            .transpose()?;
        let matcher =
            Matcher::from_config(&flags.matcher, op, &flags.skip_tenants, &flags.admin_groups)?;

        let cache = if flags.memcached.is_empty() {
            CacheBackend::InMemory {
                expire: flags.cache_expire,
            }
        } else {
            CacheBackend::Memcached {
                servers: flags.memcached,
                expire: flags.cache_expire,
                interval: flags.cache_interval,
            }
        };

        let tls = tls_material(flags.tls_cert_file, flags.tls_key_file);
        let tls_internal = tls_material(flags.tls_internal_cert_file, flags.tls_internal_key_file);

        Ok(Self {
            name: flags.name,
            log_level: flags.log_level,
            log_format: flags.log_format,
            listen: flags.listen,
            listen_internal: flags.listen_internal,
            healthchecks_url: flags.healthchecks_url,
            tls,
            tls_internal,
            kubeconfig: flags.kubeconfig,
            mappings,
            ssar: flags.ssar,
            package: flags.package,
            rule: flags.rule,
            matcher,
            cache,
            debug_token: flags.debug_token,
        })
    }
}

fn tls_material(cert_file: Option<PathBuf>, key_file: Option<PathBuf>) -> Option<TlsMaterial> {
    match (cert_file, key_file) {
        (Some(cert_file), Some(key_file)) => Some(TlsMaterial {
            cert_file,
            key_file,
        }),
        _ => None,
    }
}
