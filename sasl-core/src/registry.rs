use std::sync::{Arc, Mutex, OnceLock, RwLock};

use crate::config::{ServiceConfig, SessionConfig};
use crate::engine::AuthenticationEngine;
use crate::error::{Error, Result};
use crate::session::HandshakeSession;

/// Set of available authentication engines.
///
/// Engines must be initialized once before any session is created.
/// `initialize` may be called any number of times from any thread: each
/// engine is set up once, and a failed call only retries the engines that
/// are not ready yet. Engines registered afterwards are initialized when
/// they are registered.
#[derive(Default)]
pub struct Registry {
    engines: RwLock<Vec<Entry>>,
    initialized: Mutex<bool>,
}

struct Entry {
    engine: Arc<dyn AuthenticationEngine>,
    ready: bool,
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Process wide registry.
pub fn global() -> &'static Registry {
    GLOBAL.get_or_init(Registry::new)
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `engine`, replacing any engine with the same name.
    pub fn register(&self, engine: Arc<dyn AuthenticationEngine>) -> Result<()> {
        let initialized = self.initialized.lock().unwrap_or_else(|p| p.into_inner());
        if *initialized {
            init_engine(engine.as_ref())?;
        }

        let mut engines = self.engines.write().unwrap_or_else(|p| p.into_inner());
        engines.retain(|e| e.engine.name() != engine.name());
        tracing::debug!(engine=%engine.name(), "Engine registered");
        engines.push(Entry {
            engine,
            ready: *initialized,
        });
        Ok(())
    }

    pub fn initialize(&self) -> Result<()> {
        let mut initialized = self.initialized.lock().unwrap_or_else(|p| p.into_inner());
        if *initialized {
            return Ok(());
        }

        let mut engines = self.engines.write().unwrap_or_else(|p| p.into_inner());
        for entry in engines.iter_mut().filter(|e| !e.ready) {
            init_engine(entry.engine.as_ref())?;
            entry.ready = true;
        }
        *initialized = true;
        tracing::info!(engines = engines.len(), "Authentication engines initialized");
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        *self.initialized.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn engine(&self, name: &str) -> Option<Arc<dyn AuthenticationEngine>> {
        self.engines
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|e| e.engine.name().eq_ignore_ascii_case(name))
            .map(|e| e.engine.clone())
    }

    pub fn engine_names(&self) -> Vec<String> {
        self.engines
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|e| e.engine.name().to_string())
            .collect()
    }

    pub fn initiator(
        &self,
        engine: &str,
        service: ServiceConfig,
        config: SessionConfig,
    ) -> Result<HandshakeSession> {
        HandshakeSession::initiator(self.ready_engine(engine)?, service, config)
    }

    pub fn acceptor(
        &self,
        engine: &str,
        service: ServiceConfig,
        config: SessionConfig,
    ) -> Result<HandshakeSession> {
        HandshakeSession::acceptor(self.ready_engine(engine)?, service, config)
    }

    fn ready_engine(&self, name: &str) -> Result<Arc<dyn AuthenticationEngine>> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        self.engine(name)
            .ok_or_else(|| Error::Config(format!("unknown authentication engine {}", name)))
    }
}

fn init_engine(engine: &dyn AuthenticationEngine) -> Result<()> {
    engine.initialize().map_err(|e| {
        tracing::error!(engine=%engine.name(), err=%e, "Engine initialization failed");
        Error::Config(format!("engine {} failed to initialize: {}", engine.name(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ContextParams, EngineError, EngineResult, MechanismContext, MechanismInfo};
    use crate::testing::TestEngine;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails its first initialization.
    #[derive(Default)]
    struct FlakyEngine {
        attempts: AtomicUsize,
    }

    impl AuthenticationEngine for FlakyEngine {
        fn name(&self) -> &str {
            "flaky"
        }

        fn initialize(&self) -> EngineResult<()> {
            match self.attempts.fetch_add(1, Ordering::SeqCst) {
                0 => Err(EngineError::Unavailable("backend not reachable".into())),
                _ => Ok(()),
            }
        }

        fn mechanisms(&self) -> Vec<MechanismInfo> {
            vec![]
        }

        fn new_context(
            &self,
            _mechanism: &str,
            _params: ContextParams<'_>,
        ) -> EngineResult<Option<Box<dyn MechanismContext>>> {
            Ok(None)
        }
    }

    #[test]
    fn test_sessions_need_initialization() {
        let registry = Registry::new();
        registry.register(Arc::new(TestEngine::new())).unwrap();
        assert!(matches!(
            registry.initiator("test", ServiceConfig::new("imap", "localhost"), SessionConfig::new()),
            Err(Error::NotInitialized)
        ));

        registry.initialize().unwrap();
        registry
            .initiator("test", ServiceConfig::new("imap", "localhost"), SessionConfig::new())
            .unwrap();
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let engine = Arc::new(TestEngine::new());
        let registry = Registry::new();
        registry.register(engine.clone()).unwrap();

        std::thread::scope(|s| {
            let handles: Vec<_> = (0..4).map(|_| s.spawn(|| registry.initialize())).collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }
        });
        registry.initialize().unwrap();
        assert_eq!(engine.initializations(), 1);
    }

    #[test]
    fn test_late_registration_is_initialized() {
        let registry = Registry::new();
        registry.initialize().unwrap();
        let engine = Arc::new(TestEngine::new());
        registry.register(engine.clone()).unwrap();
        assert_eq!(engine.initializations(), 1);
        assert_eq!(registry.engine_names(), vec!["test".to_string()]);
    }

    #[test]
    fn test_unknown_engine() {
        let registry = Registry::new();
        registry.initialize().unwrap();
        assert!(matches!(
            registry.acceptor("nope", ServiceConfig::new("imap", "localhost"), SessionConfig::new()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_failed_initialize_retries_only_pending_engines() {
        let stable = Arc::new(TestEngine::new());
        let flaky = Arc::new(FlakyEngine::default());
        let registry = Registry::new();
        registry.register(stable.clone()).unwrap();
        registry.register(flaky.clone()).unwrap();

        assert!(matches!(registry.initialize(), Err(Error::Config(_))));
        assert!(!registry.is_initialized());

        registry.initialize().unwrap();
        assert!(registry.is_initialized());
        assert_eq!(stable.initializations(), 1);
        assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_global_registry() {
        assert!(std::ptr::eq(global(), global()));
        global().register(Arc::new(TestEngine::new())).unwrap();
        global().initialize().unwrap();
        global()
            .acceptor("test", ServiceConfig::new("imap", "localhost"), SessionConfig::new())
            .unwrap();
    }
}
