//! Channel registry
//!
//! Owns the list of registered technologies and the list of live channels.
//! Both live behind one `parking_lot` mutex that is never held across an
//! `.await`. Channel lookups scan under that lock and try-lock the candidate;
//! on contention they release everything, back off and retry a bounded number
//! of times.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::autoservice::AutoserviceSlot;
use crate::cdr::{Cdr, CdrSink};
use crate::channel::{Channel, ChannelIdent, LockedChannel, SoftHangup};
use crate::config::ChannelCoreConfig;
use crate::devicestate::device_name;
use crate::error::{ChannelError, Result};
use crate::events::{ChannelEvent, EventBus};
use crate::prompt::{NullPromptPlayer, PromptPlayer};
use crate::tech::ChannelTech;
use crate::translate::TranslatorRegistry;

/// Collaborators shared by every channel of a registry
pub struct ChannelServices {
    pub config: ChannelCoreConfig,
    pub translators: Arc<TranslatorRegistry>,
    events: EventBus,
    cdr_sink: Option<Arc<dyn CdrSink>>,
    prompts: Arc<dyn PromptPlayer>,
    /// Channels in autoservice, by uniqueid
    pub(crate) autoservice: DashMap<String, AutoserviceSlot>,
    registry: Weak<ChannelRegistry>,
}

impl ChannelServices {
    /// Publish an event to registry subscribers
    pub fn emit(&self, event: ChannelEvent) {
        self.events.publish(event);
    }

    /// Announce that the device behind `channel_name` may have changed state
    pub fn device_state_changed(&self, channel_name: &str) {
        let device = device_name(channel_name);
        debug!("Device state of {} may have changed", device);
        self.emit(ChannelEvent::DeviceStateChange { device });
    }

    pub fn cdr_sink(&self) -> Option<&dyn CdrSink> {
        self.cdr_sink.as_deref()
    }

    pub fn prompts(&self) -> &Arc<dyn PromptPlayer> {
        &self.prompts
    }

    pub fn registry(&self) -> Option<Arc<ChannelRegistry>> {
        self.registry.upgrade()
    }

    pub(crate) async fn free_channel(&self, chan: &Arc<Channel>) {
        match self.registry() {
            Some(registry) => registry.channel_free(chan).await,
            None => {
                let mut c = chan.lock().await;
                let name = c.name();
                c.release_resources();
                drop(c);
                self.device_state_changed(&name);
            }
        }
    }
}

impl std::fmt::Debug for ChannelServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelServices")
            .field("config", &self.config)
            .field("cdr_sink", &self.cdr_sink.is_some())
            .finish()
    }
}

#[derive(Default)]
struct RegistryState {
    /// Newest registration first
    backends: Vec<Arc<dyn ChannelTech>>,
    /// Newest channel first
    channels: Vec<Arc<Channel>>,
}

/// The channel registry
pub struct ChannelRegistry {
    state: Mutex<RegistryState>,
    shutting_down: AtomicBool,
    uniqueint: AtomicU64,
    services: Arc<ChannelServices>,
}

/// Builder for [`ChannelRegistry`]
#[derive(Default)]
pub struct ChannelRegistryBuilder {
    config: ChannelCoreConfig,
    translators: Option<Arc<TranslatorRegistry>>,
    cdr_sink: Option<Arc<dyn CdrSink>>,
    prompts: Option<Arc<dyn PromptPlayer>>,
}

impl ChannelRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: ChannelCoreConfig) -> Self {
        self.config = config;
        self
    }

    pub fn translators(mut self, translators: Arc<TranslatorRegistry>) -> Self {
        self.translators = Some(translators);
        self
    }

    pub fn cdr_sink(mut self, sink: Arc<dyn CdrSink>) -> Self {
        self.cdr_sink = Some(sink);
        self
    }

    pub fn prompt_player(mut self, prompts: Arc<dyn PromptPlayer>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    pub fn build(self) -> Result<Arc<ChannelRegistry>> {
        self.config.validate()?;
        let events = EventBus::new(self.config.events.capacity);
        let translators = self.translators.unwrap_or_default();
        let prompts = self
            .prompts
            .unwrap_or_else(|| Arc::new(NullPromptPlayer) as Arc<dyn PromptPlayer>);
        let config = self.config;
        let cdr_sink = self.cdr_sink;
        Ok(Arc::new_cyclic(|weak| ChannelRegistry {
            state: Mutex::new(RegistryState::default()),
            shutting_down: AtomicBool::new(false),
            uniqueint: AtomicU64::new(0),
            services: Arc::new(ChannelServices {
                config,
                translators,
                events,
                cdr_sink,
                prompts,
                autoservice: DashMap::new(),
                registry: weak.clone(),
            }),
        }))
    }
}

fn same_tech(a: &Arc<dyn ChannelTech>, b: &Arc<dyn ChannelTech>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl ChannelRegistry {
    pub fn builder() -> ChannelRegistryBuilder {
        ChannelRegistryBuilder::new()
    }

    /// Registry with the given configuration and default collaborators
    pub fn new(config: ChannelCoreConfig) -> Result<Arc<Self>> {
        Self::builder().config(config).build()
    }

    pub fn services(&self) -> &Arc<ChannelServices> {
        &self.services
    }

    pub fn config(&self) -> &ChannelCoreConfig {
        &self.services.config
    }

    pub fn translators(&self) -> &Arc<TranslatorRegistry> {
        &self.services.translators
    }

    /// Receive channel events
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.services.events.subscribe()
    }

    /// Register a technology. Type names are unique, ignoring case.
    pub fn register_technology(&self, tech: Arc<dyn ChannelTech>) -> Result<()> {
        let mut state = self.state.lock();
        if state
            .backends
            .iter()
            .any(|b| b.type_name().eq_ignore_ascii_case(tech.type_name()))
        {
            warn!("Already have a handler for type '{}'", tech.type_name());
            return Err(ChannelError::DuplicateTechnology {
                name: tech.type_name().to_string(),
            });
        }
        info!("Registered channel type '{}' ({})", tech.type_name(), tech.description());
        state.backends.insert(0, tech);
        Ok(())
    }

    /// Unregister a technology by identity. Channels still using it get an
    /// APPUNLOAD soft hangup.
    pub async fn unregister_technology(&self, tech: &Arc<dyn ChannelTech>) {
        debug!("Unregistering channel type '{}'", tech.type_name());
        let channels = {
            let mut state = self.state.lock();
            let before = state.backends.len();
            state.backends.retain(|b| !same_tech(b, tech));
            if state.backends.len() == before {
                return;
            }
            state.channels.clone()
        };
        info!("Unregistered channel type '{}'", tech.type_name());
        for chan in channels {
            let mut c = chan.lock().await;
            if same_tech(&c.tech, tech) {
                c.softhangup_nolock(SoftHangup::APPUNLOAD);
                drop(c);
                chan.interrupt_blocker();
            }
        }
    }

    /// Find a technology by type name, ignoring case
    pub fn lookup_technology(&self, name: &str) -> Option<Arc<dyn ChannelTech>> {
        let state = self.state.lock();
        state
            .backends
            .iter()
            .find(|b| b.type_name().eq_ignore_ascii_case(name))
            .cloned()
    }

    /// Registered technologies, newest first
    pub fn channel_types(&self) -> Vec<Arc<dyn ChannelTech>> {
        self.state.lock().backends.clone()
    }

    fn next_uniqueid(&self) -> String {
        let n = self.uniqueint.fetch_add(1, Ordering::Relaxed);
        let epoch = chrono::Utc::now().timestamp();
        let pid = std::process::id();
        match self.services.config.system_name.as_deref() {
            Some(system) if !system.is_empty() => format!("{}-{}.{}.{}", system, epoch, pid, n),
            _ => format!("{}.{}.{}", epoch, pid, n),
        }
    }

    /// Allocate a channel driven by `tech` and link it into the registry.
    /// Refused while the registry is shutting down.
    pub async fn channel_alloc(&self, tech: Arc<dyn ChannelTech>, name: impl Into<String>) -> Result<Arc<Channel>> {
        if self.shutting_down() {
            info!("Channel allocation failed: Refusing due to active shutdown");
            return Err(ChannelError::ShuttingDown);
        }
        let chan = Channel::new(name.into(), self.next_uniqueid(), tech, self.services.clone());
        if self.services.config.cdr.enabled {
            let mut c = chan.lock().await;
            let mut cdr = Cdr::new();
            cdr.init(&c);
            c.cdr = Some(cdr);
        }
        self.state.lock().channels.insert(0, chan.clone());
        debug!("Allocated channel {} ({})", chan.name(), chan.uniqueid());
        Ok(chan)
    }

    /// Unlink a hung up channel and release what it owns
    pub async fn channel_free(&self, chan: &Arc<Channel>) {
        let found = {
            let mut state = self.state.lock();
            match state.channels.iter().position(|c| Channel::same(c, chan)) {
                Some(pos) => {
                    state.channels.remove(pos);
                    true
                }
                None => false,
            }
        };
        if !found {
            warn!("Unable to find channel in list to free. Assuming it has already been done.");
        }

        // Wait out anyone still inside an operation on this channel
        let mut c = chan.lock().await;
        let name = c.name();
        c.release_resources();
        drop(c);
        chan.set_bridge(None);

        self.services.device_state_changed(&name);
    }

    /// Scan for the first channel after `prev` matching `matches` and return
    /// it locked. Gives up with a warning after the configured retries.
    async fn channel_find_locked<F>(&self, prev: Option<&Arc<Channel>>, what: &str, matches: F) -> Option<LockedChannel>
    where
        F: Fn(&ChannelIdent) -> bool,
    {
        let lookup = &self.services.config.lookup;
        for _ in 0..lookup.max_retries {
            let attempt = {
                let state = self.state.lock();
                let start = match prev {
                    Some(p) => match state.channels.iter().position(|c| Channel::same(c, p)) {
                        Some(pos) => pos + 1,
                        None => return None,
                    },
                    None => 0,
                };
                match state.channels[start..].iter().find(|c| matches(&c.ident())) {
                    None => return None,
                    Some(candidate) => candidate.try_lock(),
                }
            };
            match attempt {
                Some(locked) => return Some(locked),
                None => tokio::time::sleep(lookup.backoff()).await,
            }
        }
        warn!("Avoided deadlock looking up '{}', {} retries!", what, lookup.max_retries);
        None
    }

    /// Step through every channel, each returned locked
    pub async fn walk_channels(&self, prev: Option<&Arc<Channel>>) -> Option<LockedChannel> {
        self.channel_find_locked(prev, "walk", |_| true).await
    }

    pub async fn find_by_name(&self, name: &str) -> Option<LockedChannel> {
        self.channel_find_locked(None, name, |id| id.name.eq_ignore_ascii_case(name))
            .await
    }

    pub async fn find_by_name_prefix(&self, prefix: &str) -> Option<LockedChannel> {
        self.walk_channel_by_name_prefix(None, prefix).await
    }

    pub async fn walk_channel_by_name_prefix(&self, prev: Option<&Arc<Channel>>, prefix: &str) -> Option<LockedChannel> {
        self.channel_find_locked(prev, prefix, |id| {
            id.name
                .get(..prefix.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
        })
        .await
    }

    /// Channel positioned at `exten@context`, including macro positions
    pub async fn find_by_exten(&self, exten: &str, context: &str) -> Option<LockedChannel> {
        let what = format!("{}@{}", exten, context);
        self.channel_find_locked(None, &what, |id| {
            let context_match = id.context.eq_ignore_ascii_case(context)
                || id
                    .macro_context
                    .as_deref()
                    .is_some_and(|c| c.eq_ignore_ascii_case(context));
            let exten_match = id.exten.eq_ignore_ascii_case(exten)
                || id
                    .macro_exten
                    .as_deref()
                    .is_some_and(|e| e.eq_ignore_ascii_case(exten));
            context_match && exten_match
        })
        .await
    }

    /// Snapshot of every live channel, newest first
    pub fn channels(&self) -> Vec<Arc<Channel>> {
        self.state.lock().channels.clone()
    }

    pub fn active_channels(&self) -> usize {
        self.state.lock().channels.len()
    }

    /// Refuse new channels. With `hangup_all` every live channel gets a
    /// SHUTDOWN soft hangup.
    pub async fn begin_shutdown(&self, hangup_all: bool) {
        self.shutting_down.store(true, Ordering::Release);
        if hangup_all {
            for chan in self.channels() {
                chan.softhangup(SoftHangup::SHUTDOWN).await;
            }
        }
    }

    pub fn cancel_shutdown(&self) {
        self.shutting_down.store(false, Ordering::Release);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ChannelRegistry")
            .field("backends", &state.backends.len())
            .field("channels", &state.channels.len())
            .field("shutting_down", &self.shutting_down())
            .finish()
    }
}
