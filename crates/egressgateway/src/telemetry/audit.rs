//! The audit pipeline: one structured NDJSON record per decision or error.
//!
//! Records pass through sampling, a status filter, header redaction, and
//! optional body scrubbing before being fanned out to the configured sinks.
//! Sink failures are logged and swallowed; auditing never fails a request.

use std::collections::BTreeMap;
use std::io::Write as _;
use std::net::IpAddr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use egress_core::prelude::*;
use http::HeaderMap;
use parking_lot::Mutex;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::policy::DenialReason;

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditLevel {
	None,
	#[default]
	Minimal,
	Headers,
	Full,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
	Allowed,
	Denied,
	RateLimited,
	CircuitOpen,
	Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditRecord {
	/// Correlation id (UUIDv4).
	pub id: Uuid,
	pub timestamp: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tenant: Option<Strng>,
	pub handler: &'static str,
	pub host: Strng,
	pub port: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub path: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub method: Option<String>,
	pub source_ip: IpAddr,
	pub decision: Decision,
	pub reason: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub denial: Option<DenialReason>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rule_id: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub status: Option<u16>,
	pub duration_ms: u64,
	pub bytes_sent: u64,
	pub bytes_received: u64,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub grpc_service: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub grpc_method: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub trace_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub span_id: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub headers: Option<BTreeMap<String, String>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub body: Option<String>,
}

impl AuditRecord {
	pub fn new(handler: &'static str, host: Strng, port: u16, source_ip: IpAddr) -> AuditRecord {
		AuditRecord {
			id: Uuid::new_v4(),
			timestamp: Utc::now(),
			tenant: None,
			handler,
			host,
			port,
			path: None,
			method: None,
			source_ip,
			decision: Decision::Error,
			reason: strng::EMPTY,
			denial: None,
			rule_id: None,
			status: None,
			duration_ms: 0,
			bytes_sent: 0,
			bytes_received: 0,
			grpc_service: None,
			grpc_method: None,
			trace_id: None,
			span_id: None,
			headers: None,
			body: None,
		}
	}

	/// Captures trace/span ids from an incoming `traceparent` header.
	pub fn with_trace(mut self, headers: &HeaderMap) -> AuditRecord {
		if let Some((trace_id, span_id)) = parse_traceparent(headers) {
			self.trace_id = Some(trace_id);
			self.span_id = Some(span_id);
		}
		self
	}
}

fn parse_traceparent(headers: &HeaderMap) -> Option<(String, String)> {
	let tp = headers.get("traceparent")?.to_str().ok()?;
	let mut parts = tp.split('-');
	let _version = parts.next()?;
	let trace_id = parts.next()?;
	let span_id = parts.next()?;
	if trace_id.len() != 32 || span_id.len() != 16 {
		return None;
	}
	Some((trace_id.to_string(), span_id.to_string()))
}

/// Where finished records go. Implementations must not block for long and
/// must never panic; the auditor swallows their errors.
pub trait AuditSink: Send + Sync {
	fn write(&self, line: &str) -> anyhow::Result<()>;
	fn name(&self) -> &'static str;
}

pub struct StdoutSink;

impl AuditSink for StdoutSink {
	fn write(&self, line: &str) -> anyhow::Result<()> {
		let mut out = std::io::stdout().lock();
		out.write_all(line.as_bytes())?;
		out.write_all(b"\n")?;
		Ok(())
	}

	fn name(&self) -> &'static str {
		"stdout"
	}
}

/// Append-only NDJSON file sink.
pub struct FileSink {
	file: Mutex<std::fs::File>,
}

impl FileSink {
	pub fn open(path: &PathBuf) -> anyhow::Result<FileSink> {
		let file = std::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(path)
			.with_context(|| format!("opening audit log {}", path.display()))?;
		Ok(FileSink {
			file: Mutex::new(file),
		})
	}
}

impl AuditSink for FileSink {
	fn write(&self, line: &str) -> anyhow::Result<()> {
		let mut f = self.file.lock();
		f.write_all(line.as_bytes())?;
		f.write_all(b"\n")?;
		Ok(())
	}

	fn name(&self) -> &'static str {
		"file"
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
#[serde(default)]
pub struct AuditConfig {
	pub level: AuditLevel,
	/// Keep this fraction of records; the rest are dropped at the envelope.
	pub sampling_rate: f64,
	/// When non-empty, only records with one of these statuses are kept.
	pub status_allowlist: Vec<u16>,
	/// Extra header names to redact, beyond the built-in sensitive set.
	pub redact_headers: Vec<String>,
	/// Body scrubbing patterns (opt-in, applied at `full` level).
	pub scrub_patterns: Vec<String>,
	pub scrub_replacement: String,
	pub file: Option<PathBuf>,
	pub stdout: bool,
}

impl Default for AuditConfig {
	fn default() -> Self {
		AuditConfig {
			level: AuditLevel::Minimal,
			sampling_rate: 1.0,
			status_allowlist: Vec::new(),
			redact_headers: Vec::new(),
			scrub_patterns: Vec::new(),
			scrub_replacement: "[REDACTED]".to_string(),
			file: None,
			stdout: true,
		}
	}
}

const SENSITIVE_SUBSTRINGS: &[&str] = &["auth", "token", "key", "secret", "password", "credential"];

pub struct Auditor {
	sinks: Vec<Arc<dyn AuditSink>>,
	level: AuditLevel,
	sampling_rate: f64,
	status_allowlist: Vec<u16>,
	redact_exact: Vec<String>,
	scrubbers: Vec<Regex>,
	scrub_replacement: String,
}

impl Debug for Auditor {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Auditor")
			.field("sinks", &self.sinks.len())
			.field("level", &self.level)
			.finish()
	}
}

impl Auditor {
	pub fn new(cfg: &AuditConfig) -> anyhow::Result<Auditor> {
		let mut sinks: Vec<Arc<dyn AuditSink>> = Vec::new();
		if cfg.stdout {
			sinks.push(Arc::new(StdoutSink));
		}
		if let Some(path) = &cfg.file {
			sinks.push(Arc::new(FileSink::open(path)?));
		}
		let scrubbers = cfg
			.scrub_patterns
			.iter()
			.map(|p| Regex::new(p).with_context(|| format!("invalid scrub pattern {p:?}")))
			.collect::<anyhow::Result<Vec<_>>>()?;
		Ok(Auditor {
			sinks,
			level: cfg.level,
			sampling_rate: cfg.sampling_rate.clamp(0.0, 1.0),
			status_allowlist: cfg.status_allowlist.clone(),
			redact_exact: cfg
				.redact_headers
				.iter()
				.map(|h| h.to_ascii_lowercase())
				.collect(),
			scrubbers,
			scrub_replacement: cfg.scrub_replacement.clone(),
		})
	}

	/// For tests: an auditor with explicit sinks.
	pub fn with_sinks(cfg: &AuditConfig, sinks: Vec<Arc<dyn AuditSink>>) -> Auditor {
		let mut a = Auditor::new(&AuditConfig {
			file: None,
			stdout: false,
			..cfg.clone()
		})
		.expect("no file sink to fail");
		a.sinks = sinks;
		a
	}

	fn header_is_sensitive(&self, name: &str) -> bool {
		let lower = name.to_ascii_lowercase();
		self.redact_exact.iter().any(|h| *h == lower)
			|| SENSITIVE_SUBSTRINGS.iter().any(|s| lower.contains(s))
	}

	/// Renders headers per the configured level, redacting sensitive values.
	pub fn capture_headers(&self, headers: &HeaderMap) -> Option<BTreeMap<String, String>> {
		if !matches!(self.level, AuditLevel::Headers | AuditLevel::Full) {
			return None;
		}
		let mut out = BTreeMap::new();
		for (name, value) in headers {
			let rendered = if self.header_is_sensitive(name.as_str()) {
				"[REDACTED]".to_string()
			} else {
				String::from_utf8_lossy(value.as_bytes()).to_string()
			};
			out.insert(name.as_str().to_string(), rendered);
		}
		Some(out)
	}

	/// Truncates and scrubs a body sample, at `full` level only.
	pub fn capture_body(&self, body: &[u8]) -> Option<String> {
		if self.level != AuditLevel::Full {
			return None;
		}
		const MAX_BODY_SAMPLE: usize = 2048;
		let sample = &body[..body.len().min(MAX_BODY_SAMPLE)];
		let mut text = String::from_utf8_lossy(sample).to_string();
		for re in &self.scrubbers {
			text = re.replace_all(&text, self.scrub_replacement.as_str()).to_string();
		}
		Some(text)
	}

	/// Writes the record through sampling and filtering. Never errors.
	pub fn emit(&self, record: AuditRecord) {
		if self.level == AuditLevel::None {
			return;
		}
		if self.sampling_rate < 1.0 && rand::rng().random::<f64>() >= self.sampling_rate {
			return;
		}
		if !self.status_allowlist.is_empty() {
			let Some(status) = record.status else { return };
			if !self.status_allowlist.contains(&status) {
				return;
			}
		}
		let line = match serde_json::to_string(&record) {
			Ok(l) => l,
			Err(e) => {
				warn!("failed to serialize audit record: {e}");
				return;
			},
		};
		for sink in &self.sinks {
			if let Err(e) = sink.write(&line) {
				warn!(sink = sink.name(), "audit sink write failed: {e}");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	struct MemSink(Mutex<Vec<String>>);

	impl AuditSink for MemSink {
		fn write(&self, line: &str) -> anyhow::Result<()> {
			self.0.lock().push(line.to_string());
			Ok(())
		}

		fn name(&self) -> &'static str {
			"mem"
		}
	}

	struct FailSink;

	impl AuditSink for FailSink {
		fn write(&self, _line: &str) -> anyhow::Result<()> {
			anyhow::bail!("sink unavailable")
		}

		fn name(&self) -> &'static str {
			"fail"
		}
	}

	fn record(decision: Decision) -> AuditRecord {
		let mut r = AuditRecord::new("forward", strng::new("api.example.com"), 443, "10.0.0.1".parse().unwrap());
		r.decision = decision;
		r.reason = strng::new("matched rule r1");
		r
	}

	fn auditor_with(cfg: AuditConfig) -> (Auditor, Arc<MemSink>) {
		let sink = Arc::new(MemSink(Mutex::new(Vec::new())));
		let a = Auditor::with_sinks(&cfg, vec![sink.clone()]);
		(a, sink)
	}

	#[test]
	fn records_are_ndjson() {
		let (a, sink) = auditor_with(AuditConfig::default());
		a.emit(record(Decision::Allowed));
		let lines = sink.0.lock();
		assert_eq!(lines.len(), 1);
		let v: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
		assert_eq!(v["decision"], "allowed");
		assert_eq!(v["host"], "api.example.com");
		assert!(v["id"].as_str().unwrap().len() == 36);
		assert!(v["timestamp"].as_str().unwrap().contains('T'));
	}

	#[test]
	fn level_none_suppresses() {
		let (a, sink) = auditor_with(AuditConfig {
			level: AuditLevel::None,
			..Default::default()
		});
		a.emit(record(Decision::Denied));
		assert!(sink.0.lock().is_empty());
	}

	#[test]
	fn sampling_zero_drops_everything() {
		let (a, sink) = auditor_with(AuditConfig {
			sampling_rate: 0.0,
			..Default::default()
		});
		for _ in 0..50 {
			a.emit(record(Decision::Allowed));
		}
		assert!(sink.0.lock().is_empty());
	}

	#[test]
	fn status_allowlist_filters() {
		let (a, sink) = auditor_with(AuditConfig {
			status_allowlist: vec![403],
			..Default::default()
		});
		let mut allowed = record(Decision::Allowed);
		allowed.status = Some(200);
		a.emit(allowed);
		let mut denied = record(Decision::Denied);
		denied.status = Some(403);
		a.emit(denied);
		let lines = sink.0.lock();
		assert_eq!(lines.len(), 1);
		assert!(lines[0].contains("denied"));
	}

	#[test]
	fn sensitive_headers_redacted() {
		let (a, _) = auditor_with(AuditConfig {
			level: AuditLevel::Headers,
			redact_headers: vec!["x-custom-private".to_string()],
			..Default::default()
		});
		let mut headers = HeaderMap::new();
		headers.insert("authorization", "Bearer abc".parse().unwrap());
		headers.insert("x-api-key", "k".parse().unwrap());
		headers.insert("x-custom-private", "v".parse().unwrap());
		headers.insert("accept", "*/*".parse().unwrap());
		let captured = a.capture_headers(&headers).unwrap();
		assert_eq!(captured["authorization"], "[REDACTED]");
		assert_eq!(captured["x-api-key"], "[REDACTED]");
		assert_eq!(captured["x-custom-private"], "[REDACTED]");
		assert_eq!(captured["accept"], "*/*");
	}

	#[test]
	fn headers_not_captured_at_minimal() {
		let (a, _) = auditor_with(AuditConfig::default());
		let mut headers = HeaderMap::new();
		headers.insert("accept", "*/*".parse().unwrap());
		assert!(a.capture_headers(&headers).is_none());
	}

	#[test]
	fn body_scrubbing() {
		let (a, _) = auditor_with(AuditConfig {
			level: AuditLevel::Full,
			scrub_patterns: vec![r"\d{3}-\d{2}-\d{4}".to_string()],
			scrub_replacement: "[SSN]".to_string(),
			..Default::default()
		});
		let body = a.capture_body(b"ssn=123-45-6789 ok").unwrap();
		assert_eq!(body, "ssn=[SSN] ok");
	}

	#[test]
	fn sink_failures_do_not_propagate() {
		let sink = Arc::new(MemSink(Mutex::new(Vec::new())));
		let a = Auditor::with_sinks(
			&AuditConfig::default(),
			vec![Arc::new(FailSink), sink.clone()],
		);
		a.emit(record(Decision::Denied));
		// The failing sink is skipped; the healthy one still receives the record.
		assert_eq!(sink.0.lock().len(), 1);
	}

	#[test]
	fn traceparent_extraction() {
		let mut headers = HeaderMap::new();
		headers.insert(
			"traceparent",
			"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
				.parse()
				.unwrap(),
		);
		let r = record(Decision::Allowed).with_trace(&headers);
		assert_eq!(r.trace_id.unwrap(), "0af7651916cd43dd8448eb211c80319c");
		assert_eq!(r.span_id.unwrap(), "b7ad6b7169203331");
	}
}
