#![allow(dead_code)]

use std::sync::Arc;

use sasl_core::testing::TestEngine;
use sasl_core::{HandshakeSession, Result, ServiceConfig, SessionConfig};

/// Route `tracing` output to the test harness, once per test binary.
pub fn logs() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn engine() -> Arc<TestEngine> {
    Arc::new(TestEngine::new().with_user("user", "pass").with_user("bob", "hunter2"))
}

pub fn service() -> ServiceConfig {
    ServiceConfig::new("imap", "mail.example.tld")
}

pub fn client(config: SessionConfig) -> HandshakeSession {
    HandshakeSession::initiator(engine(), service(), config).unwrap()
}

pub fn server(config: SessionConfig) -> HandshakeSession {
    HandshakeSession::acceptor(engine(), service(), config).unwrap()
}

pub fn credentials(username: &str, password: &str) -> SessionConfig {
    SessionConfig::new()
        .with_username(username)
        .with_credential(password)
}

/// Run the exchange in memory until both sides are done, returning the
/// selected mechanism.
pub fn handshake(client: &mut HandshakeSession, server: &mut HandshakeSession) -> Result<String> {
    logs();
    let offered = server.mechanisms();
    let start = client.start(&offered)?;
    let mut client_done = start.complete;
    let mut reply = server.accept(&start.mechanism, Some(&start.response))?;

    loop {
        if reply.complete && client_done {
            return Ok(start.mechanism);
        }
        if client_done {
            reply = server.step(&[])?;
            continue;
        }
        let next = client.step(&reply.response)?;
        client_done = next.complete;
        if !reply.complete {
            reply = server.step(&next.response)?;
        }
    }
}

/// Completed client and server sessions over `mechanism`.
pub fn completed(mechanism: &str, client_config: SessionConfig) -> (HandshakeSession, HandshakeSession) {
    let mut cl = client(client_config.with_mechanisms([mechanism]));
    let mut srv = server(SessionConfig::new());
    handshake(&mut cl, &mut srv).unwrap();
    (cl, srv)
}
