//! Deterministic engine and callback for tests.
//!
//! `TESTPLAIN` behaves like PLAIN: one message `authzid\0authcid\0password`,
//! no security layer. `TESTSEAL` takes two round trips and negotiates a toy
//! security layer with per-direction sequence numbers and a checksum, which
//! is enough to exercise framing, reordering and corruption paths. None of
//! this is cryptographically meaningful.
//!
//! TESTSEAL exchange, each side announcing the largest plaintext it accepts
//! as a trailing big endian `u32`:
//!
//! ```text
//! C: username max_buffer
//! S: nonce max_buffer
//! C: proof
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{Secret, SessionConfig};
use crate::engine::*;
use crate::interaction::{Answers, InteractionCallback, InteractionKind, InteractionRequest};

pub const TESTPLAIN: &str = "TESTPLAIN";
pub const TESTSEAL: &str = "TESTSEAL";
pub const TESTSEAL_SSF: u32 = 56;

#[derive(Default)]
pub struct TestEngine {
    users: HashMap<String, String>,
    initializations: AtomicUsize,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Account known to the acceptor side.
    pub fn with_user(mut self, username: &str, password: &str) -> Self {
        self.users.insert(username.to_string(), password.to_string());
        self
    }

    pub fn initializations(&self) -> usize {
        self.initializations.load(Ordering::SeqCst)
    }
}

impl AuthenticationEngine for TestEngine {
    fn name(&self) -> &str {
        "test"
    }

    fn initialize(&self) -> EngineResult<()> {
        self.initializations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn mechanisms(&self) -> Vec<MechanismInfo> {
        vec![
            MechanismInfo::new(TESTSEAL)
                .with_username()
                .with_credential()
                .with_max_ssf(TESTSEAL_SSF),
            MechanismInfo::new(TESTPLAIN)
                .with_username()
                .with_credential()
                .with_proxy(),
        ]
    }

    fn new_context(
        &self,
        mechanism: &str,
        params: ContextParams<'_>,
    ) -> EngineResult<Option<Box<dyn MechanismContext>>> {
        let max_buffer = params.config.max_buffer_size;
        let ctx: Box<dyn MechanismContext> = match (mechanism, params.role) {
            (TESTPLAIN, Role::Initiator) => Box::new(PlainClient {
                config: params.config.clone(),
                identity: None,
            }),
            (TESTPLAIN, Role::Acceptor) => Box::new(PlainServer {
                users: self.users.clone(),
                identity: None,
            }),
            (TESTSEAL, Role::Initiator) => Box::new(SealClient {
                config: params.config.clone(),
                max_buffer,
                peer_buffer: 0,
                state: SealState::Init,
            }),
            (TESTSEAL, Role::Acceptor) => Box::new(SealServer {
                users: self.users.clone(),
                max_buffer,
                peer_buffer: 0,
                state: SealState::Init,
            }),
            _ => return Ok(None),
        };
        Ok(Some(ctx))
    }
}

/// Username and password from the configuration, or from the answers the
/// callback gave. Missing values are turned into prompts.
fn client_credentials(
    config: &SessionConfig,
    answers: &Answers,
) -> Result<(String, Secret), Vec<InteractionRequest>> {
    let username = config
        .username
        .clone()
        .or_else(|| answers.get_str(InteractionKind::AuthName).map(str::to_string));
    let password = config
        .credential
        .clone()
        .or_else(|| answers.get(InteractionKind::Password).cloned());

    match (username, password) {
        (Some(u), Some(p)) => Ok((u, p)),
        (u, p) => {
            let mut prompts = vec![];
            if u.is_none() {
                prompts.push(InteractionRequest::new(
                    InteractionKind::AuthName,
                    "Authentication name",
                ));
            }
            if p.is_none() {
                prompts.push(InteractionRequest::new(InteractionKind::Password, "Password"));
            }
            Err(prompts)
        }
    }
}

struct PlainClient {
    config: SessionConfig,
    identity: Option<String>,
}

impl MechanismContext for PlainClient {
    fn start(&mut self, _input: Option<&[u8]>, answers: &Answers) -> EngineResult<Status> {
        let (username, password) = match client_credentials(&self.config, answers) {
            Ok(v) => v,
            Err(prompts) => return Ok(Status::Interact(prompts)),
        };
        let authzid = self
            .config
            .authorization_identity
            .clone()
            .unwrap_or_else(|| username.clone());

        let mut out = Vec::new();
        out.extend_from_slice(authzid.as_bytes());
        out.push(0);
        out.extend_from_slice(username.as_bytes());
        out.push(0);
        out.extend_from_slice(password.expose());

        self.identity = Some(authzid);
        Ok(Status::Complete(out))
    }

    fn step(&mut self, _input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        Err(EngineError::Protocol("TESTPLAIN has a single message".into()))
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        let identity = self
            .identity
            .clone()
            .ok_or_else(|| EngineError::Protocol("not complete".into()))?;
        Ok(Outcome {
            ssf: 0,
            max_buffer: 0,
            authorized_identity: identity,
        })
    }
}

struct PlainServer {
    users: HashMap<String, String>,
    identity: Option<String>,
}

impl PlainServer {
    fn verify(&mut self, data: &[u8]) -> EngineResult<Status> {
        let parts: Vec<&[u8]> = data.split(|c| *c == 0).collect();
        let (authz, user, pass) = match parts.as_slice() {
            [authz, user, pass] => (*authz, *user, *pass),
            _ => return Err(EngineError::Protocol("malformed TESTPLAIN message".into())),
        };
        let user = String::from_utf8_lossy(user).to_string();
        if !authz.is_empty() && authz != user.as_bytes() {
            return Err(EngineError::Aborted("impersonation is not supported".into()));
        }
        match self.users.get(&user) {
            Some(expected) if expected.as_bytes() == pass => {
                self.identity = Some(user);
                Ok(Status::Complete(vec![]))
            }
            _ => Err(EngineError::BadCredential(format!("login failed for {}", user))),
        }
    }
}

impl MechanismContext for PlainServer {
    fn start(&mut self, input: Option<&[u8]>, _answers: &Answers) -> EngineResult<Status> {
        match input {
            Some(data) => self.verify(data),
            None => Ok(Status::Continue(vec![])),
        }
    }

    fn step(&mut self, input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        if self.identity.is_some() {
            return Err(EngineError::Protocol("already complete".into()));
        }
        self.verify(input)
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        let identity = self
            .identity
            .clone()
            .ok_or_else(|| EngineError::Protocol("not complete".into()))?;
        Ok(Outcome {
            ssf: 0,
            max_buffer: 0,
            authorized_identity: identity,
        })
    }
}

enum SealState {
    Init,
    WaitChallenge { username: String, password: Secret },
    WaitUsername,
    WaitProof { username: String, challenge: Vec<u8> },
    Done { username: String, key: Vec<u8> },
}

fn fnv1a(parts: &[&[u8]]) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for part in parts {
        for b in part.iter() {
            hash ^= *b as u32;
            hash = hash.wrapping_mul(0x01000193);
        }
    }
    hash
}

fn challenge_for(username: &str) -> Vec<u8> {
    format!("nonce:{:08x}", fnv1a(&[username.as_bytes()])).into_bytes()
}

fn derive_key(password: &[u8], challenge: &[u8]) -> Vec<u8> {
    let mut key = fnv1a(&[password, challenge]).to_be_bytes().to_vec();
    key.extend_from_slice(&fnv1a(&[challenge, password]).to_be_bytes());
    key
}

fn proof(password: &[u8], challenge: &[u8]) -> Vec<u8> {
    fnv1a(&[challenge, b":", password]).to_be_bytes().to_vec()
}

fn with_buffer(mut message: Vec<u8>, max_buffer: u32) -> Vec<u8> {
    message.extend_from_slice(&max_buffer.to_be_bytes());
    message
}

fn split_buffer(message: &[u8]) -> EngineResult<(&[u8], u32)> {
    if message.len() < 4 {
        return Err(EngineError::Protocol("missing buffer size".into()));
    }
    let (head, size) = message.split_at(message.len() - 4);
    Ok((head, u32::from_be_bytes([size[0], size[1], size[2], size[3]])))
}

fn done_layer(state: &SealState) -> Option<(Box<dyn LayerEncoder>, Box<dyn LayerDecoder>)> {
    match state {
        SealState::Done { key, .. } => {
            let encoder = SealEncoder::new(key).ok()?;
            let decoder = SealDecoder::new(key).ok()?;
            Some((Box::new(encoder), Box::new(decoder)))
        }
        _ => None,
    }
}

/// `peer_buffer` is what the other side announced during the exchange.
fn done_outcome(state: &SealState, peer_buffer: u32) -> EngineResult<Outcome> {
    match state {
        SealState::Done { username, .. } => Ok(Outcome {
            ssf: TESTSEAL_SSF,
            max_buffer: peer_buffer,
            authorized_identity: username.clone(),
        }),
        _ => Err(EngineError::Protocol("not complete".into())),
    }
}

struct SealClient {
    config: SessionConfig,
    max_buffer: u32,
    peer_buffer: u32,
    state: SealState,
}

impl MechanismContext for SealClient {
    fn start(&mut self, _input: Option<&[u8]>, answers: &Answers) -> EngineResult<Status> {
        let (username, password) = match client_credentials(&self.config, answers) {
            Ok(v) => v,
            Err(prompts) => return Ok(Status::Interact(prompts)),
        };
        let first = with_buffer(username.clone().into_bytes(), self.max_buffer);
        self.state = SealState::WaitChallenge { username, password };
        Ok(Status::Continue(first))
    }

    fn step(&mut self, input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        match std::mem::replace(&mut self.state, SealState::Init) {
            SealState::WaitChallenge { username, password } => {
                let (nonce, peer_buffer) = split_buffer(input)?;
                self.peer_buffer = peer_buffer;
                let response = proof(password.expose(), nonce);
                let key = derive_key(password.expose(), nonce);
                self.state = SealState::Done { username, key };
                Ok(Status::Complete(response))
            }
            _ => Err(EngineError::Protocol("unexpected challenge".into())),
        }
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        done_outcome(&self.state, self.peer_buffer)
    }

    fn security_layer(&mut self) -> Option<(Box<dyn LayerEncoder>, Box<dyn LayerDecoder>)> {
        done_layer(&self.state)
    }
}

struct SealServer {
    users: HashMap<String, String>,
    max_buffer: u32,
    peer_buffer: u32,
    state: SealState,
}

impl SealServer {
    fn challenge(&mut self, first: &[u8]) -> EngineResult<Status> {
        let (username, peer_buffer) = split_buffer(first)?;
        self.peer_buffer = peer_buffer;
        let username = String::from_utf8_lossy(username).to_string();
        if !self.users.contains_key(&username) {
            return Err(EngineError::BadCredential(format!("unknown user {}", username)));
        }
        let challenge = challenge_for(&username);
        self.state = SealState::WaitProof {
            username,
            challenge: challenge.clone(),
        };
        Ok(Status::Continue(with_buffer(challenge, self.max_buffer)))
    }
}

impl MechanismContext for SealServer {
    fn start(&mut self, input: Option<&[u8]>, _answers: &Answers) -> EngineResult<Status> {
        match input {
            Some(first) => self.challenge(first),
            None => {
                self.state = SealState::WaitUsername;
                Ok(Status::Continue(vec![]))
            }
        }
    }

    fn step(&mut self, input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        match std::mem::replace(&mut self.state, SealState::Init) {
            SealState::WaitUsername => self.challenge(input),
            SealState::WaitProof {
                username,
                challenge,
            } => {
                let password = self.users.get(&username).cloned().unwrap_or_default();
                if proof(password.as_bytes(), &challenge) != input {
                    return Err(EngineError::BadCredential(format!(
                        "login failed for {}",
                        username
                    )));
                }
                let key = derive_key(password.as_bytes(), &challenge);
                self.state = SealState::Done { username, key };
                Ok(Status::Complete(vec![]))
            }
            _ => Err(EngineError::Protocol("unexpected response".into())),
        }
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        done_outcome(&self.state, self.peer_buffer)
    }

    fn security_layer(&mut self) -> Option<(Box<dyn LayerEncoder>, Box<dyn LayerDecoder>)> {
        done_layer(&self.state)
    }
}

const SEAL_OVERHEAD: usize = 8;

fn check_key(key: &[u8]) -> EngineResult<()> {
    if key.is_empty() {
        return Err(EngineError::Unavailable("empty sealing key".into()));
    }
    Ok(())
}

fn mask(data: &[u8], key: &[u8], seq: u32) -> Vec<u8> {
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[(i + seq as usize) % key.len()])
        .collect()
}

/// Frame layout: sequence number, masked payload, checksum of both.
pub struct SealEncoder {
    key: Vec<u8>,
    seq: u32,
}

impl SealEncoder {
    pub fn new(key: &[u8]) -> EngineResult<Self> {
        check_key(key)?;
        Ok(Self {
            key: key.to_vec(),
            seq: 0,
        })
    }
}

impl LayerEncoder for SealEncoder {
    fn seal(&mut self, plaintext: &[u8]) -> EngineResult<Vec<u8>> {
        let seq = self.seq.to_be_bytes();
        let mut out = Vec::with_capacity(plaintext.len() + SEAL_OVERHEAD);
        out.extend_from_slice(&seq);
        out.extend_from_slice(&mask(plaintext, &self.key, self.seq));
        out.extend_from_slice(&fnv1a(&[&seq, plaintext, &self.key]).to_be_bytes());
        self.seq = self.seq.wrapping_add(1);
        Ok(out)
    }
}

pub struct SealDecoder {
    key: Vec<u8>,
    expected_seq: u32,
}

impl SealDecoder {
    pub fn new(key: &[u8]) -> EngineResult<Self> {
        check_key(key)?;
        Ok(Self {
            key: key.to_vec(),
            expected_seq: 0,
        })
    }
}

impl LayerDecoder for SealDecoder {
    fn open(&mut self, ciphertext: &[u8]) -> EngineResult<Vec<u8>> {
        if ciphertext.len() < SEAL_OVERHEAD {
            return Err(EngineError::Protocol("frame too short".into()));
        }
        let (seq, rest) = ciphertext.split_at(4);
        let (masked, sum) = rest.split_at(rest.len() - 4);

        let seq_num = u32::from_be_bytes([seq[0], seq[1], seq[2], seq[3]]);
        if seq_num != self.expected_seq {
            return Err(EngineError::Integrity(format!(
                "out of sequence frame {}, expected {}",
                seq_num, self.expected_seq
            )));
        }

        let plaintext = mask(masked, &self.key, seq_num);
        if &fnv1a(&[seq, &plaintext, &self.key]).to_be_bytes()[..] != sum {
            return Err(EngineError::Integrity("checksum mismatch".into()));
        }
        self.expected_seq = self.expected_seq.wrapping_add(1);
        Ok(plaintext)
    }

    fn overhead(&self) -> usize {
        SEAL_OVERHEAD
    }
}

/// Answers prompts from a fixed table and remembers what was asked.
#[derive(Default, Clone)]
pub struct TableCallback {
    table: HashMap<InteractionKind, String>,
    asked: Arc<Mutex<Vec<InteractionKind>>>,
}

impl TableCallback {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, kind: InteractionKind, value: &str) -> Self {
        self.table.insert(kind, value.to_string());
        self
    }

    /// Prompts received so far, shared with every clone of this callback.
    pub fn asked(&self) -> Vec<InteractionKind> {
        self.asked
            .lock()
            .map(|asked| asked.clone())
            .unwrap_or_default()
    }
}

impl InteractionCallback for TableCallback {
    fn resolve(&mut self, request: &InteractionRequest) -> Option<Secret> {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(request.kind);
        }
        self.table.get(&request.kind).map(|v| Secret::from(v.as_str()))
    }
}
