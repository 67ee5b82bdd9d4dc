use crate::config::Settings;
use crate::dispatch::QueueDispatcher;
use crate::error::Error;
use crate::message::MessageRegistry;

use ::config::Config;
use std::sync::Arc;
use tracing::instrument;

/// Shared runtime for a group of nodes.
///
/// Owns the [`QueueDispatcher`] that drains every connection's outbound
/// queue, the [`MessageRegistry`] used to encode and decode messages, and
/// the [`Settings`]. Nodes are created from an engine and keep it alive;
/// cloning is cheap and shares the same dispatcher.
///
/// # Example
///
/// ```no_run
/// use relaymq::{Engine, MessageRegistry, Publisher};
///
/// let config = config::Config::default();
/// let registry = MessageRegistry::new();
/// let engine = Engine::new(&config, &registry)?;
/// let publisher = Publisher::new(&engine);
/// publisher.bind("inproc://quotes")?;
/// # Ok::<(), relaymq::Error>(())
/// ```
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    dispatcher: QueueDispatcher,
    registry: MessageRegistry,
    settings: Settings,
}

impl Engine {
    /// Creates an engine from the un-namespaced keys of `config`.
    pub fn new(config: &Config, registry: &MessageRegistry) -> Result<Self, Error> {
        Self::new_named(config, registry, "")
    }

    /// Creates an engine with configuration namespacing (see [`Settings`]).
    ///
    /// Fails with [`Error::Config`] if a key is present but malformed.
    pub fn new_named(config: &Config, registry: &MessageRegistry, name: &str) -> Result<Self, Error> {
        Self::with_settings(Settings::from_config_named(config, name)?, registry)
    }

    /// Creates an engine from explicit settings.
    #[instrument(skip(registry))]
    pub fn with_settings(settings: Settings, registry: &MessageRegistry) -> Result<Self, Error> {
        let dispatcher = QueueDispatcher::new(settings.dispatcher_workers, settings.max_batch_size)?;
        Ok(Self {
            inner: Arc::new(EngineInner {
                dispatcher,
                registry: registry.clone(),
                settings,
            }),
        })
    }

    pub fn dispatcher(&self) -> &QueueDispatcher {
        &self.inner.dispatcher
    }

    pub fn registry(&self) -> &MessageRegistry {
        &self.inner.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("dispatcher", &self.inner.dispatcher)
            .field("settings", &self.inner.settings)
            .finish()
    }
}
