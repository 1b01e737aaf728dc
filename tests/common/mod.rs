//! Shared fixtures for integration tests.
#![allow(dead_code)]

use statefeed::{
    CheckServiceNode, HealthCheck, HealthStatus, Node, NodeService, Payload, Subject, Topic,
};

/// Install a test-friendly tracing subscriber once per test binary.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

pub fn redis_subject() -> Subject {
    Subject::new(Topic::ServiceHealth, "redis")
}

/// A service instance on `node` with the given port.
pub fn instance(node: &str, service: &str, id: &str, port: u32) -> Payload {
    Payload::ServiceHealth(CheckServiceNode {
        node: Node {
            name: node.to_string(),
            address: "3.4.5.6".to_string(),
            datacenter: "dc1".to_string(),
        },
        service: NodeService {
            id: id.to_string(),
            service: service.to_string(),
            address: "3.4.5.6".to_string(),
            port,
            tags: vec![],
        },
        checks: vec![HealthCheck {
            check_id: format!("service:{}", id),
            status: HealthStatus::Passing,
        }],
    })
}

/// The canary instance whose port counts the updates written to it.
pub fn canary(port: u32) -> Payload {
    instance("node1", "redis", "redis-canary", port)
}

pub fn canary_port(payload: &Payload) -> Option<u32> {
    match payload {
        Payload::ServiceHealth(csn) if csn.service.id == "redis-canary" => Some(csn.service.port),
        _ => None,
    }
}
