use std::fmt;
use std::sync::Arc;

use crate::codec::SecurityLayer;
use crate::config::{ServiceConfig, SessionConfig};
use crate::engine::*;
use crate::error::{Error, Result};
use crate::interaction::{Answers, InteractionCallback, InteractionRequest};

/// An engine re-prompting more often than this is considered stuck.
const MAX_INTERACTION_ROUNDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    New,
    Negotiating,
    Completed,
    /// Terminal, carries the diagnostic of the failure.
    Failed(String),
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => f.write_str("New"),
            Self::Negotiating => f.write_str("Negotiating"),
            Self::Completed => f.write_str("Completed"),
            Self::Failed(_) => f.write_str("Failed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    pub mechanism: String,
    /// First payload to send to the peer.
    pub response: Vec<u8>,
    pub complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub response: Vec<u8>,
    pub complete: bool,
}

/// One authentication exchange, as initiator (client) or acceptor (server).
///
/// ```text
/// New -[start/accept]-> Negotiating -[step, incomplete]-> Negotiating
///                                   -[step, complete]---> Completed
/// any of the above can end in Failed; Completed and Failed are terminal
/// ```
///
/// Calls must be sequential: a session is driven by a single conversation.
/// Dropping the session, or calling `dispose` any number of times, releases
/// the engine context and wipes collected secrets.
pub struct HandshakeSession {
    role: Role,
    state: State,
    engine: Arc<dyn AuthenticationEngine>,
    service: ServiceConfig,
    config: SessionConfig,
    callback: Option<Box<dyn InteractionCallback>>,
    context: Option<Box<dyn MechanismContext>>,
    mechanism: Option<String>,
    answers: Answers,
    layer: Option<SecurityLayer>,
    disposed: bool,
}

impl fmt::Debug for HandshakeSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandshakeSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("engine", &self.engine.name())
            .field("service", &self.service)
            .field("mechanism", &self.mechanism)
            .field("interactive", &self.callback.is_some())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl HandshakeSession {
    pub fn initiator(
        engine: Arc<dyn AuthenticationEngine>,
        service: ServiceConfig,
        config: SessionConfig,
    ) -> Result<Self> {
        Self::new(Role::Initiator, engine, service, config)
    }

    pub fn acceptor(
        engine: Arc<dyn AuthenticationEngine>,
        service: ServiceConfig,
        config: SessionConfig,
    ) -> Result<Self> {
        Self::new(Role::Acceptor, engine, service, config)
    }

    fn new(
        role: Role,
        engine: Arc<dyn AuthenticationEngine>,
        service: ServiceConfig,
        config: SessionConfig,
    ) -> Result<Self> {
        let config = config.normalize()?;
        tracing::debug!(
            role=%role,
            engine=%engine.name(),
            service=%service.service,
            host=%service.hostname,
            "New authentication session"
        );
        Ok(Self {
            role,
            state: State::New,
            engine,
            service,
            config,
            callback: None,
            context: None,
            mechanism: None,
            answers: Answers::new(),
            layer: None,
            disposed: false,
        })
    }

    pub fn with_callback(mut self, callback: impl InteractionCallback + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn set_callback(&mut self, callback: Box<dyn InteractionCallback>) {
        self.callback = Some(callback);
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        !self.disposed && self.state == State::Completed
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn service(&self) -> &ServiceConfig {
        &self.service
    }

    /// Selected mechanism, set once by `start` or `accept` and never changed.
    pub fn mechanism(&self) -> Option<&str> {
        self.mechanism.as_deref()
    }

    // ---- negotiation ----

    /// Pick the first usable mechanism from `candidates` and produce the
    /// initial response. Initiator only, exactly once.
    pub fn start<S: AsRef<str>>(&mut self, candidates: &[S]) -> Result<StartOutcome> {
        self.guard("start", Some(Role::Initiator), &State::New)?;

        let candidates: Vec<&str> = candidates.iter().map(AsRef::as_ref).collect();
        let (info, context) = match self.select(&candidates) {
            Ok(v) => v,
            Err(e) => return Err(self.fail(e)),
        };
        tracing::debug!(mechanism=%info.name, "Mechanism selected");
        self.mechanism = Some(info.name.clone());
        self.context = Some(context);

        let status = self.run(|ctx, answers| ctx.start(None, answers));
        let outcome = self.advance(status)?;
        Ok(StartOutcome {
            mechanism: info.name,
            response: outcome.response,
            complete: outcome.complete,
        })
    }

    /// Same as `start` with the mechanisms given as a comma or space separated list.
    pub fn start_list(&mut self, mechanisms: &str) -> Result<StartOutcome> {
        let candidates: Vec<&str> = mechanisms
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|m| !m.is_empty())
            .collect();
        self.start(&candidates)
    }

    /// Begin the exchange the peer asked for. Acceptor only, exactly once.
    pub fn accept(
        &mut self,
        mechanism: &str,
        initial_response: Option<&[u8]>,
    ) -> Result<StepOutcome> {
        self.guard("accept", Some(Role::Acceptor), &State::New)?;

        let (info, context) = match self.select(&[mechanism]) {
            Ok(v) => v,
            Err(e) => return Err(self.fail(e)),
        };
        tracing::debug!(mechanism=%info.name, "Mechanism requested by peer");
        self.mechanism = Some(info.name);
        self.context = Some(context);

        let status = self.run(|ctx, answers| ctx.start(initial_response, answers));
        self.advance(status)
    }

    /// Feed the peer's last payload, get the next one to send.
    pub fn step(&mut self, challenge: &[u8]) -> Result<StepOutcome> {
        self.guard("step", None, &State::Negotiating)?;
        let status = self.run(|ctx, answers| ctx.step(challenge, answers));
        self.advance(status)
    }

    // ---- completed session ----

    /// Strength of the negotiated security layer, 0 means none.
    pub fn ssf(&self) -> Result<u32> {
        self.completed("ssf").map(SecurityLayer::ssf)
    }

    /// Largest plaintext sent in a single frame.
    pub fn max_buffer(&self) -> Result<usize> {
        self.completed("max_buffer").map(SecurityLayer::max_buffer)
    }

    pub fn authorized_identity(&self) -> Result<&str> {
        self.completed("authorized_identity")
            .map(SecurityLayer::authorized_identity)
    }

    pub fn encode(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.completed("encode")?.encode(plaintext)
    }

    pub fn decode(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.completed("decode")?.decode(ciphertext)
    }

    /// Shared handle on the negotiated layer, used by the stream adapters.
    pub fn security_layer(&self) -> Result<SecurityLayer> {
        self.completed("security_layer")
            .map(Clone::clone)
            .map_err(|_| Error::HandshakeNotComplete)
    }

    // ---- listing ----

    /// Mechanisms this session could use, in preference order.
    ///
    /// The configured mechanism list, when present, decides the order;
    /// otherwise the engine's order is kept.
    pub fn mechanisms(&self) -> Vec<String> {
        let available: Vec<MechanismInfo> = self
            .engine
            .mechanisms()
            .into_iter()
            .filter(|m| self.usable(m).is_ok())
            .collect();

        if self.config.mechanisms.is_empty() {
            return available.into_iter().map(|m| m.name).collect();
        }

        self.config
            .mechanisms
            .iter()
            .filter_map(|wanted| {
                available
                    .iter()
                    .find(|m| m.name.eq_ignore_ascii_case(wanted))
                    .map(|m| m.name.clone())
            })
            .collect()
    }

    /// Comma separated mechanism list, for advertisement to initiators.
    pub fn list_mechanisms(&self) -> Result<String> {
        if self.disposed {
            return Err(self.invalid("list_mechanisms"));
        }
        if let State::Failed(reason) = &self.state {
            return Err(Error::SessionFailed(reason.clone()));
        }
        Ok(self.mechanisms().join(","))
    }

    // ---- teardown ----

    /// Release the engine context and wipe secrets. Safe to call repeatedly
    /// and in any state; every later operation fails.
    ///
    /// Security layers already handed out keep working until dropped.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;
        self.context = None;
        self.callback = None;
        self.answers.clear();
        self.config.credential = None;
        self.layer = None;
        tracing::debug!(role=%self.role, state=%self.state, "Session disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    // ---- internals ----

    fn invalid(&self, operation: &'static str) -> Error {
        let state = if self.disposed {
            "Disposed".to_string()
        } else {
            format!("{} ({})", self.state, self.role)
        };
        Error::InvalidSessionState { operation, state }
    }

    /// Checks role and state without touching the session.
    fn guard(&self, operation: &'static str, role: Option<Role>, expected: &State) -> Result<()> {
        if self.disposed {
            return Err(self.invalid(operation));
        }
        if let State::Failed(reason) = &self.state {
            return Err(Error::SessionFailed(reason.clone()));
        }
        if role.map_or(false, |r| r != self.role) || &self.state != expected {
            return Err(self.invalid(operation));
        }
        Ok(())
    }

    fn completed(&self, operation: &'static str) -> Result<&SecurityLayer> {
        if self.disposed {
            return Err(self.invalid(operation));
        }
        match (&self.state, &self.layer) {
            (State::Completed, Some(layer)) => Ok(layer),
            (State::Failed(reason), _) => Err(Error::SessionFailed(reason.clone())),
            _ => Err(self.invalid(operation)),
        }
    }

    fn params(&self) -> ContextParams<'_> {
        ContextParams {
            role: self.role,
            service: &self.service,
            config: &self.config,
        }
    }

    /// Why `info` cannot be used with this configuration, if it cannot.
    fn usable(&self, info: &MechanismInfo) -> std::result::Result<(), &'static str> {
        let conf = &self.config;
        let interactive = self.callback.is_some();

        if self.role == Role::Initiator {
            if info.needs_username && conf.username.is_none() && !interactive {
                return Err("no username configured");
            }
            if info.needs_credential && conf.credential.is_none() && !interactive {
                return Err("no credential configured");
            }
            if conf.wants_proxy() && !info.supports_proxy {
                return Err("cannot carry an authorization identity");
            }
        }
        if !self.engine.supports(&info.name, self.role) {
            return Err("not available in this role");
        }
        if info.needs_external && conf.external_identity.is_none() {
            return Err("no external identity");
        }
        if info.max_ssf.saturating_add(conf.external_ssf) < conf.min_ssf {
            return Err("security layer too weak");
        }
        if !conf.mechanisms.is_empty()
            && !conf
                .mechanisms
                .iter()
                .any(|m| m.eq_ignore_ascii_case(&info.name))
        {
            return Err("disabled by configuration");
        }
        Ok(())
    }

    fn select(&self, candidates: &[&str]) -> Result<(MechanismInfo, Box<dyn MechanismContext>)> {
        let available = self.engine.mechanisms();

        for candidate in candidates.iter().map(|c| c.trim()) {
            let info = match available
                .iter()
                .find(|m| m.name.eq_ignore_ascii_case(candidate))
            {
                Some(info) => info,
                None => {
                    tracing::debug!(mechanism=%candidate, "Mechanism not provided by engine");
                    continue;
                }
            };

            if let Err(reason) = self.usable(info) {
                tracing::warn!(mechanism=%info.name, reason=%reason, "Skipping mechanism");
                continue;
            }

            match self.engine.new_context(&info.name, self.params()) {
                Ok(Some(context)) => return Ok((info.clone(), context)),
                Ok(None) => {
                    tracing::debug!(mechanism=%info.name, "Engine has no context for this role")
                }
                Err(e) => tracing::warn!(mechanism=%info.name, err=%e, "Engine refused mechanism"),
            }
        }

        Err(Error::MechanismNegotiationFailed(format!(
            "none of [{}] is usable",
            candidates.join(",")
        )))
    }

    /// Call the engine, answering its prompts until it produces a payload.
    fn run<F>(&mut self, mut call: F) -> Result<Status>
    where
        F: FnMut(&mut dyn MechanismContext, &Answers) -> EngineResult<Status>,
    {
        let context = match self.context.as_mut() {
            Some(context) => context,
            None => {
                return Err(Error::InvalidSessionState {
                    operation: "run",
                    state: "no mechanism context".into(),
                })
            }
        };

        for _ in 0..MAX_INTERACTION_ROUNDS {
            let requests = match call(context.as_mut(), &self.answers) {
                Ok(Status::Interact(requests)) => requests,
                Ok(status) => return Ok(status),
                Err(e) => return Err(Error::SessionFailed(e.to_string())),
            };
            for request in requests.iter() {
                resolve(self.callback.as_deref_mut(), &mut self.answers, request)?;
            }
        }

        Err(Error::InteractionUnresolved(
            "engine kept prompting after every answer".into(),
        ))
    }

    fn advance(&mut self, status: Result<Status>) -> Result<StepOutcome> {
        let outcome = match status {
            Ok(Status::Continue(response)) => {
                self.state = State::Negotiating;
                Ok(StepOutcome {
                    response,
                    complete: false,
                })
            }
            Ok(Status::Complete(response)) => self.complete().map(|()| StepOutcome {
                response,
                complete: true,
            }),
            Ok(Status::Interact(_)) => Err(Error::InteractionUnresolved(
                "prompt left unanswered".into(),
            )),
            Err(e) => Err(e),
        };

        match outcome {
            Ok(outcome) => {
                tracing::debug!(state=%self.state, complete=outcome.complete, "Made progress");
                Ok(outcome)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn complete(&mut self) -> Result<()> {
        let context = match self.context.as_mut() {
            Some(context) => context,
            None => return Err(Error::SessionFailed("no mechanism context".into())),
        };
        let outcome = context
            .outcome()
            .map_err(|e| Error::SessionFailed(e.to_string()))?;

        let conf = &self.config;
        if outcome.ssf > conf.max_ssf {
            return Err(Error::SessionFailed(format!(
                "negotiated ssf {} is above the maximum {}",
                outcome.ssf, conf.max_ssf
            )));
        }
        if outcome.ssf.saturating_add(conf.external_ssf) < conf.min_ssf {
            return Err(Error::SessionFailed(format!(
                "negotiated ssf {} (external {}) is below the minimum {}",
                outcome.ssf, conf.external_ssf, conf.min_ssf
            )));
        }

        let halves = if outcome.ssf > 0 {
            match context.security_layer() {
                Some(halves) => Some(halves),
                None => {
                    return Err(Error::SessionFailed(
                        "engine negotiated a security layer but provides no codec".into(),
                    ))
                }
            }
        } else {
            None
        };

        let max_buffer = match outcome.max_buffer {
            0 => conf.max_buffer_size,
            peer => peer.min(conf.max_buffer_size),
        };
        let mechanism = self.mechanism.clone().unwrap_or_default();

        tracing::info!(
            mechanism=%mechanism,
            ssf=outcome.ssf,
            identity=%outcome.authorized_identity,
            "Authentication succeeded"
        );
        self.layer = Some(SecurityLayer::new(
            mechanism,
            outcome.ssf,
            max_buffer as usize,
            outcome.authorized_identity,
            halves,
        ));
        self.state = State::Completed;
        self.context = None;
        self.answers.clear();
        Ok(())
    }

    /// Move to `Failed` and hand the error back.
    fn fail(&mut self, err: Error) -> Error {
        let reason = match &err {
            Error::SessionFailed(diagnostic) => diagnostic.clone(),
            other => other.to_string(),
        };
        tracing::warn!(role=%self.role, mechanism=?self.mechanism, err=%err, "Authentication failed");
        self.state = State::Failed(reason);
        self.context = None;
        self.answers.clear();
        err
    }
}

impl Drop for HandshakeSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn resolve(
    callback: Option<&mut (dyn InteractionCallback + 'static)>,
    answers: &mut Answers,
    request: &InteractionRequest,
) -> Result<()> {
    if answers.contains(request.kind) {
        return Err(Error::InteractionUnresolved(format!(
            "{} prompt raised again after being answered",
            request.kind
        )));
    }

    let callback = callback.ok_or_else(|| {
        Error::InteractionUnresolved(format!(
            "no callback to answer {} prompt '{}'",
            request.kind, request.prompt
        ))
    })?;

    match callback.resolve(request) {
        Some(value) => {
            tracing::debug!(kind=%request.kind, "Interaction resolved");
            answers.insert(request.kind, value);
            Ok(())
        }
        None => Err(Error::InteractionUnresolved(format!(
            "{} prompt '{}' has no answer",
            request.kind, request.prompt
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interaction::InteractionKind;
    use crate::testing::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> ServiceConfig {
        ServiceConfig::new("imap", "mail.example.tld")
    }

    fn client(config: SessionConfig) -> HandshakeSession {
        HandshakeSession::initiator(Arc::new(TestEngine::new()), service(), config).unwrap()
    }

    #[test]
    fn test_step_before_start_does_not_mutate() {
        let mut cl = client(SessionConfig::new().with_username("user").with_credential("pass"));
        match cl.step(b"challenge") {
            Err(Error::InvalidSessionState { operation, .. }) => assert_eq!(operation, "step"),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(cl.state(), &State::New);
        assert_eq!(cl.mechanism(), None);

        // still usable afterwards
        let res = cl.start(&[TESTPLAIN]).unwrap();
        assert!(res.complete);
    }

    #[test]
    fn test_plain_scenario() {
        let mut cl = client(SessionConfig::new().with_username("user").with_credential("pass"));
        let res = cl.start(&["TESTPLAIN"]).unwrap();
        assert_eq!(res.mechanism, "TESTPLAIN");
        assert_eq!(res.response, b"user\0user\0pass");
        assert!(res.complete);
        assert_eq!(cl.state(), &State::Completed);
        assert_eq!(cl.ssf().unwrap(), 0);
        assert_eq!(cl.authorized_identity().unwrap(), "user");
    }

    #[test]
    fn test_start_twice_is_invalid() {
        let mut cl = client(SessionConfig::new().with_username("user").with_credential("pass"));
        cl.start(&[TESTSEAL]).unwrap();
        assert!(matches!(
            cl.start(&[TESTSEAL]),
            Err(Error::InvalidSessionState { .. })
        ));
        assert_eq!(cl.mechanism(), Some(TESTSEAL));
    }

    #[test]
    fn test_missing_password_skips_mechanism() {
        let mut cl = client(SessionConfig::new().with_username("user"));
        assert!(matches!(
            cl.start(&[TESTPLAIN, TESTSEAL]),
            Err(Error::MechanismNegotiationFailed(_))
        ));
        assert!(matches!(cl.state(), State::Failed(_)));
        assert!(matches!(cl.step(b""), Err(Error::SessionFailed(_))));
    }

    #[test]
    fn test_unknown_mechanisms_are_skipped_in_order() {
        let mut cl = client(SessionConfig::new().with_username("user").with_credential("pass"));
        let res = cl.start(&["GSSAPI", "testplain", TESTSEAL]).unwrap();
        assert_eq!(res.mechanism, TESTPLAIN);
    }

    #[test]
    fn test_proxy_skips_mechanisms_without_authzid() {
        let mut cl = client(
            SessionConfig::new()
                .with_username("user")
                .with_authorization_identity("admin")
                .with_credential("pass"),
        );
        let res = cl.start(&[TESTSEAL, TESTPLAIN]).unwrap();
        assert_eq!(res.mechanism, TESTPLAIN);
        assert_eq!(res.response, b"admin\0user\0pass");
    }

    #[test]
    fn test_min_ssf_skips_weak_mechanisms() {
        let mut cl = client(
            SessionConfig::new()
                .with_username("user")
                .with_credential("pass")
                .with_ssf_range(1, 256),
        );
        let res = cl.start(&[TESTPLAIN, TESTSEAL]).unwrap();
        assert_eq!(res.mechanism, TESTSEAL);
    }

    #[test]
    fn test_interaction_fills_missing_password() {
        let callback = TableCallback::new().with(crate::interaction::InteractionKind::Password, "pass");
        let mut cl = client(SessionConfig::new().with_username("user")).with_callback(callback.clone());
        let res = cl.start(&[TESTPLAIN]).unwrap();
        assert_eq!(res.response, b"user\0user\0pass");
        assert_eq!(
            callback.asked(),
            vec![crate::interaction::InteractionKind::Password]
        );
    }

    #[test]
    fn test_unresolved_interaction_fails_session() {
        let mut cl = client(SessionConfig::new().with_username("user")).with_callback(TableCallback::new());
        assert!(matches!(
            cl.start(&[TESTPLAIN]),
            Err(Error::InteractionUnresolved(_))
        ));
        assert!(matches!(cl.state(), State::Failed(_)));
    }

    #[test]
    fn test_step_after_completion_is_invalid() {
        let mut cl = client(SessionConfig::new().with_username("user").with_credential("pass"));
        cl.start(&[TESTPLAIN]).unwrap();
        assert!(matches!(
            cl.step(b""),
            Err(Error::InvalidSessionState { .. })
        ));
        assert_eq!(cl.state(), &State::Completed);
    }

    #[test]
    fn test_properties_before_completion() {
        let mut cl = client(SessionConfig::new().with_username("user").with_credential("pass"));
        assert!(matches!(cl.ssf(), Err(Error::InvalidSessionState { .. })));
        assert!(matches!(
            cl.authorized_identity(),
            Err(Error::InvalidSessionState { .. })
        ));
        assert!(matches!(cl.encode(b"x"), Err(Error::InvalidSessionState { .. })));
        assert!(matches!(
            cl.security_layer(),
            Err(Error::HandshakeNotComplete)
        ));

        cl.start(&[TESTSEAL]).unwrap();
        assert!(matches!(cl.ssf(), Err(Error::InvalidSessionState { .. })));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let mut never_started = client(SessionConfig::new());
        never_started.dispose();
        never_started.dispose();
        assert!(never_started.is_disposed());

        let mut cl = client(SessionConfig::new().with_username("user").with_credential("pass"));
        cl.start(&[TESTSEAL]).unwrap();
        cl.dispose();
        cl.dispose();
        assert!(matches!(cl.step(b""), Err(Error::InvalidSessionState { .. })));
        assert!(matches!(
            cl.security_layer(),
            Err(Error::HandshakeNotComplete)
        ));
        drop(cl);
    }

    #[test]
    fn test_acceptor_listing_follows_configuration() {
        let srv = HandshakeSession::acceptor(
            Arc::new(TestEngine::new()),
            service(),
            SessionConfig::new(),
        )
        .unwrap();
        assert_eq!(srv.list_mechanisms().unwrap(), "TESTSEAL,TESTPLAIN");

        let srv = HandshakeSession::acceptor(
            Arc::new(TestEngine::new()),
            service(),
            SessionConfig::new().with_mechanisms(["testplain", "TESTSEAL", "CRAM-MD5"]),
        )
        .unwrap();
        assert_eq!(srv.list_mechanisms().unwrap(), "TESTPLAIN,TESTSEAL");
    }

    #[test]
    fn test_role_is_enforced() {
        let mut srv = HandshakeSession::acceptor(
            Arc::new(TestEngine::new()),
            service(),
            SessionConfig::new(),
        )
        .unwrap();
        assert!(matches!(
            srv.start(&[TESTPLAIN]),
            Err(Error::InvalidSessionState { .. })
        ));
        assert_eq!(srv.state(), &State::New);

        let mut cl = client(SessionConfig::new());
        assert!(matches!(
            cl.accept(TESTPLAIN, None),
            Err(Error::InvalidSessionState { .. })
        ));
    }

    /// Initiator that must ask the user for a one-time code when the
    /// acceptor's challenge arrives.
    struct CodeEngine {
        prompting: Prompting,
        calls: Arc<AtomicUsize>,
    }

    #[derive(Clone, Copy)]
    enum Prompting {
        UntilAnswered,
        Always,
        Empty,
    }

    impl CodeEngine {
        fn session(prompting: Prompting) -> (HandshakeSession, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let engine = CodeEngine {
                prompting,
                calls: calls.clone(),
            };
            let session =
                HandshakeSession::initiator(Arc::new(engine), service(), SessionConfig::new())
                    .unwrap();
            (session, calls)
        }
    }

    impl AuthenticationEngine for CodeEngine {
        fn name(&self) -> &str {
            "code"
        }

        fn mechanisms(&self) -> Vec<MechanismInfo> {
            vec![MechanismInfo::new("CODE")]
        }

        fn new_context(
            &self,
            _mechanism: &str,
            _params: ContextParams<'_>,
        ) -> EngineResult<Option<Box<dyn MechanismContext>>> {
            Ok(Some(Box::new(CodeContext {
                prompting: self.prompting,
                calls: self.calls.clone(),
            })))
        }
    }

    struct CodeContext {
        prompting: Prompting,
        calls: Arc<AtomicUsize>,
    }

    impl MechanismContext for CodeContext {
        fn start(&mut self, _input: Option<&[u8]>, _answers: &Answers) -> EngineResult<Status> {
            Ok(Status::Continue(vec![]))
        }

        fn step(&mut self, input: &[u8], answers: &Answers) -> EngineResult<Status> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let prompt = InteractionRequest::new(
                InteractionKind::EchoPrompt,
                format!("Code for {}", String::from_utf8_lossy(input)),
            );
            match (self.prompting, answers.get_str(InteractionKind::EchoPrompt)) {
                (Prompting::UntilAnswered, Some(code)) => Ok(Status::Complete(code.into())),
                (Prompting::Empty, _) => Ok(Status::Interact(vec![])),
                _ => Ok(Status::Interact(vec![prompt])),
            }
        }

        fn outcome(&self) -> EngineResult<Outcome> {
            Ok(Outcome {
                ssf: 0,
                max_buffer: 0,
                authorized_identity: "user".into(),
            })
        }
    }

    #[test]
    fn test_step_resolves_prompts() {
        let callback = TableCallback::new().with(InteractionKind::EchoPrompt, "123456");
        let (cl, calls) = CodeEngine::session(Prompting::UntilAnswered);
        let mut cl = cl.with_callback(callback.clone());

        assert!(!cl.start(&["CODE"]).unwrap().complete);
        let res = cl.step(b"challenge").unwrap();
        assert_eq!(res.response, b"123456");
        assert!(res.complete);
        assert_eq!(callback.asked(), vec![InteractionKind::EchoPrompt]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cl.authorized_identity().unwrap(), "user");
    }

    #[test]
    fn test_unresolved_step_prompt_fails_session() {
        let (mut cl, _) = CodeEngine::session(Prompting::UntilAnswered);
        cl.start(&["CODE"]).unwrap();
        assert!(matches!(
            cl.step(b"challenge"),
            Err(Error::InteractionUnresolved(_))
        ));
        assert!(matches!(cl.state(), State::Failed(_)));
        assert!(matches!(cl.step(b"challenge"), Err(Error::SessionFailed(_))));
    }

    #[test]
    fn test_prompt_raised_again_is_unresolved() {
        let callback = TableCallback::new().with(InteractionKind::EchoPrompt, "123456");
        let (cl, calls) = CodeEngine::session(Prompting::Always);
        let mut cl = cl.with_callback(callback.clone());
        cl.start(&["CODE"]).unwrap();

        match cl.step(b"challenge") {
            Err(Error::InteractionUnresolved(reason)) => assert!(reason.contains("raised again")),
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(callback.asked(), vec![InteractionKind::EchoPrompt]);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(matches!(cl.state(), State::Failed(_)));
    }

    #[test]
    fn test_interaction_rounds_are_bounded() {
        let (mut cl, calls) = CodeEngine::session(Prompting::Empty);
        cl.start(&["CODE"]).unwrap();
        assert!(matches!(
            cl.step(b"challenge"),
            Err(Error::InteractionUnresolved(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), MAX_INTERACTION_ROUNDS);
        assert!(matches!(cl.state(), State::Failed(_)));
    }
}
