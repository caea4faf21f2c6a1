use sasl_core::config::SessionConfig;
use sasl_core::engine::*;
use sasl_core::interaction::Answers;

use super::plain::identity;

pub const ANONYMOUS_IDENTITY: &str = "anonymous";

/// Trace information is at most 255 characters.
const MAX_TRACE_CHARS: usize = 255;

pub struct AnonymousClient {
    trace: String,
    done: bool,
}

impl AnonymousClient {
    /// The username, if any, is sent as trace information.
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            trace: config.username.clone().unwrap_or_default(),
            done: false,
        }
    }
}

impl MechanismContext for AnonymousClient {
    fn start(&mut self, _input: Option<&[u8]>, _answers: &Answers) -> EngineResult<Status> {
        if self.trace.chars().count() > MAX_TRACE_CHARS {
            return Err(EngineError::Aborted("trace information is too long".into()));
        }
        self.done = true;
        Ok(Status::Complete(self.trace.clone().into_bytes()))
    }

    fn step(&mut self, _input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        Err(EngineError::Protocol("ANONYMOUS has a single message".into()))
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        identity(&self.done.then(|| ANONYMOUS_IDENTITY.to_string()))
    }
}

#[derive(Default)]
pub struct AnonymousServer {
    identity: Option<String>,
}

impl AnonymousServer {
    fn finish(&mut self, trace: &[u8]) -> EngineResult<Status> {
        let trace = match std::str::from_utf8(trace) {
            Ok(t) if t.chars().count() <= MAX_TRACE_CHARS => t,
            _ => return Err(EngineError::Protocol("invalid ANONYMOUS trace".into())),
        };
        tracing::info!(trace=%trace, "anonymous login");
        self.identity = Some(ANONYMOUS_IDENTITY.to_string());
        Ok(Status::Complete(vec![]))
    }
}

impl MechanismContext for AnonymousServer {
    fn start(&mut self, input: Option<&[u8]>, _answers: &Answers) -> EngineResult<Status> {
        match input {
            Some(trace) => self.finish(trace),
            None => Ok(Status::Continue(vec![])),
        }
    }

    fn step(&mut self, input: &[u8], _answers: &Answers) -> EngineResult<Status> {
        if self.identity.is_some() {
            return Err(EngineError::Protocol("ANONYMOUS is already complete".into()));
        }
        self.finish(input)
    }

    fn outcome(&self) -> EngineResult<Outcome> {
        identity(&self.identity)
    }
}
