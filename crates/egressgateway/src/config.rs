//! Configuration loading: a YAML file plus environment overrides. The
//! resulting [`Config`] is validated by compiling the allowlists before the
//! proxy starts serving.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, fs};

use egress_core::prelude::*;

use crate::policy::PolicyEngine;
use crate::{Config, ProxyMode};

pub fn load(path: Option<&Path>) -> anyhow::Result<Config> {
	let mut cfg: Config = match path {
		Some(p) => {
			let contents =
				fs::read_to_string(p).with_context(|| format!("reading config {}", p.display()))?;
			serde_yaml::from_str(&contents).with_context(|| format!("parsing config {}", p.display()))?
		},
		None => Config::default(),
	};

	if let Some(host) = parse::<String>("EGRESS_HOST")? {
		cfg.server.host = host;
	}
	if let Some(port) = parse::<u16>("EGRESS_PORT")? {
		cfg.server.port = port;
	}
	if let Some(mode) = parse::<String>("EGRESS_MODE")? {
		cfg.server.mode = match mode.as_str() {
			"tunnel" => ProxyMode::Tunnel,
			"mitm" => ProxyMode::Mitm,
			other => anyhow::bail!("invalid EGRESS_MODE {other:?} (expected tunnel or mitm)"),
		};
	}
	if let Some(file) = parse::<PathBuf>("EGRESS_AUDIT_FILE")? {
		cfg.audit.file = Some(file);
	}
	if let Some(cert) = parse::<PathBuf>("EGRESS_CA_CERT")? {
		cfg.server.tls.ca_cert_path = Some(cert);
	}
	if let Some(key) = parse::<PathBuf>("EGRESS_CA_KEY")? {
		cfg.server.tls.ca_key_path = Some(key);
	}
	if let Some(timeout) = parse_duration("EGRESS_CONNECT_TIMEOUT")? {
		cfg.server.connector.connect_timeout = timeout;
	}
	if let Some(timeout) = parse_duration("EGRESS_RESPONSE_TIMEOUT")? {
		cfg.server.timeouts.response_timeout = timeout;
	}
	if let Some(timeout) = parse_duration("EGRESS_IDLE_TIMEOUT")? {
		cfg.server.timeouts.idle_timeout = timeout;
	}

	validate(&cfg)?;
	Ok(cfg)
}

/// Compiles every allowlist so bad rules fail startup, not first traffic.
fn validate(cfg: &Config) -> anyhow::Result<()> {
	PolicyEngine::compile(&cfg.allowlist).context("allowlist")?;
	for tenant in &cfg.tenancy.tenants {
		PolicyEngine::compile(&tenant.allowlist)
			.with_context(|| format!("tenant {} allowlist", tenant.id))?;
	}
	if cfg.audit.sampling_rate < 0.0 || cfg.audit.sampling_rate > 1.0 {
		anyhow::bail!(
			"audit.samplingRate must be within [0, 1], got {}",
			cfg.audit.sampling_rate
		);
	}
	Ok(())
}

fn parse<T: FromStr>(var: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(var) {
		Ok(val) => val
			.parse::<T>()
			.map(Some)
			.map_err(|e| anyhow::anyhow!("invalid env var {}={} ({})", var, val, e.to_string())),
		Err(_) => Ok(None),
	}
}

fn parse_duration(var: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(var)?
		.map(|raw| {
			duration_str::parse(&raw).map_err(|e| anyhow::anyhow!("invalid env var {var}={raw} ({e})"))
		})
		.transpose()
}

#[cfg(test)]
mod tests {
	use std::io::Write;

	use super::*;

	const SAMPLE: &str = r#"
server:
  host: 0.0.0.0
  port: 3128
  mode: mitm
  proxyAgent: egressgateway-test
  limits:
    maxRequestBodySize: 1000000
  timeouts:
    responseTimeout: 30s
    idleTimeout: 2m
  tls:
    autoGenerateCa: true
    prewarmDomains: [api.example.com]
allowlist:
  mode: strict
  defaultAction: deny
  rules:
    - id: api
      domain: api.example.com
      paths: ["/public/**"]
      methods: [GET, POST]
      rateLimit:
        requestsPerMinute: 120
    - id: wild
      domain: "**.example.org"
      enabled: false
audit:
  level: headers
  samplingRate: 0.5
"#;

	#[test]
	fn parses_full_yaml_surface() {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(SAMPLE.as_bytes()).unwrap();
		let cfg = load(Some(f.path())).unwrap();
		assert_eq!(cfg.server.port, 3128);
		assert_eq!(cfg.server.mode, ProxyMode::Mitm);
		assert_eq!(cfg.server.limits.max_request_body_size, 1_000_000);
		assert_eq!(cfg.server.timeouts.response_timeout, Duration::from_secs(30));
		assert_eq!(cfg.server.timeouts.idle_timeout, Duration::from_secs(120));
		assert_eq!(cfg.server.tls.prewarm_domains, vec!["api.example.com"]);
		assert_eq!(cfg.allowlist.rules.len(), 2);
		assert!(!cfg.allowlist.rules[1].enabled);
		assert_eq!(
			cfg.allowlist.rules[0].rate_limit.unwrap().requests_per_minute,
			120
		);
		assert_eq!(cfg.audit.sampling_rate, 0.5);
	}

	#[test]
	fn missing_file_is_an_error() {
		assert!(load(Some(Path::new("/nonexistent/egress.yaml"))).is_err());
	}

	#[test]
	fn invalid_rules_fail_validation() {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(
			br#"
allowlist:
  rules:
    - id: "bad id with spaces"
      domain: example.com
"#,
		)
		.unwrap();
		assert!(load(Some(f.path())).is_err());
	}

	#[test]
	fn unknown_fields_are_rejected() {
		let mut f = tempfile::NamedTempFile::new().unwrap();
		f.write_all(b"server:\n  hostt: typo\n").unwrap();
		assert!(load(Some(f.path())).is_err());
	}

	#[test]
	fn defaults_without_file() {
		let cfg = load(None).unwrap();
		assert_eq!(cfg.server.port, 8080);
		assert_eq!(cfg.server.host, "127.0.0.1");
	}
}
