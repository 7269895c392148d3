use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DecisionLabels {
	pub verdict: Verdict,
	pub handler: Handler,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum Verdict {
	allowed,
	denied,
	rate_limited,
	circuit_open,
	error,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
#[allow(non_camel_case_types)]
pub enum Handler {
	tunnel,
	mitm,
	forward,
	grpc,
	grpc_web,
	websocket,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReasonLabels {
	pub reason: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TransitionLabels {
	pub from: String,
	pub to: String,
}

/// The counters the request path increments. The scrape endpoint is an
/// external concern; the core only feeds the registry.
#[derive(Debug)]
pub struct Metrics {
	pub downstream_connections: Counter,
	pub connections_rejected: Counter,
	pub active_connections: Gauge,
	pub decisions: Family<DecisionLabels, Counter>,
	pub denials: Family<ReasonLabels, Counter>,
	pub circuit_transitions: Family<TransitionLabels, Counter>,
	pub certificates_minted: Counter,
	pub bytes_sent: Counter,
	pub bytes_received: Counter,
	pub internal_errors: Counter,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Metrics {
		let downstream_connections = Counter::default();
		registry.register(
			"downstream_connections",
			"Client connections accepted",
			downstream_connections.clone(),
		);
		let connections_rejected = Counter::default();
		registry.register(
			"connections_rejected",
			"Client connections rejected at admission",
			connections_rejected.clone(),
		);
		let active_connections = Gauge::default();
		registry.register(
			"active_connections",
			"Client connections currently open",
			active_connections.clone(),
		);
		let decisions = Family::<DecisionLabels, Counter>::default();
		registry.register(
			"policy_decisions",
			"Policy verdicts by outcome and handler",
			decisions.clone(),
		);
		let denials = Family::<ReasonLabels, Counter>::default();
		registry.register(
			"policy_denials",
			"Denials by reason code",
			denials.clone(),
		);
		let circuit_transitions = Family::<TransitionLabels, Counter>::default();
		registry.register(
			"circuit_transitions",
			"Circuit breaker state transitions",
			circuit_transitions.clone(),
		);
		let certificates_minted = Counter::default();
		registry.register(
			"certificates_minted",
			"Leaf certificates minted for interception",
			certificates_minted.clone(),
		);
		let bytes_sent = Counter::default();
		registry.register(
			"upstream_bytes_sent",
			"Bytes forwarded client to upstream",
			bytes_sent.clone(),
		);
		let bytes_received = Counter::default();
		registry.register(
			"upstream_bytes_received",
			"Bytes forwarded upstream to client",
			bytes_received.clone(),
		);
		let internal_errors = Counter::default();
		registry.register(
			"internal_errors",
			"Unexpected faults that did not crash the process",
			internal_errors.clone(),
		);
		Metrics {
			downstream_connections,
			connections_rejected,
			active_connections,
			decisions,
			denials,
			circuit_transitions,
			certificates_minted,
			bytes_sent,
			bytes_received,
			internal_errors,
		}
	}

	/// A metrics instance not backed by any registry, for tests.
	pub fn unregistered() -> Metrics {
		Metrics::new(&mut Registry::default())
	}
}
