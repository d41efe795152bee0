//! Common test helpers for channel-core integration tests
//!
//! [`MockTech`] is an in-memory channel technology. Every frame the core
//! hands to the driver is recorded in the channel's [`MockPvt`], so tests can
//! check exactly what reached the device.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rvoip_channel_core::bridge::{BridgeFlags, BridgeOutcome, BridgeResult};
use rvoip_channel_core::channel::{Channel, ChannelInner, HangupCause};
use rvoip_channel_core::config::ChannelCoreConfig;
use rvoip_channel_core::devicestate::DeviceState;
use rvoip_channel_core::error::{ChannelError, Result};
use rvoip_channel_core::events::ChannelEvent;
use rvoip_channel_core::format::Format;
use rvoip_channel_core::frame::{ControlType, Frame};
use rvoip_channel_core::prompt::PromptPlayer;
use rvoip_channel_core::registry::ChannelRegistry;
use rvoip_channel_core::tech::{ChannelTech, TechFeatures, TechProperties};
use rvoip_channel_core::translate::{Translator, TranslatorInstance, TranslatorRegistry};
use tokio::sync::broadcast;

/// Driver-private data of a mock channel
pub struct MockPvt {
    pub written: Arc<Mutex<Vec<Frame>>>,
}

/// In-memory channel technology
pub struct MockTech {
    type_name: String,
    caps: Format,
    native_bridge: Option<&'static str>,
    properties: TechProperties,
    counter: AtomicUsize,
    pub hangups: AtomicUsize,
    pub native_bridges: AtomicUsize,
    pub fixups: AtomicUsize,
    /// Make `fixup` fail, as a driver that cannot adopt a masqueraded call
    pub fail_fixup: AtomicBool,
}

impl MockTech {
    pub fn new(type_name: &str, caps: Format) -> Arc<Self> {
        Arc::new(Self::build(type_name, caps, None))
    }

    /// A mock whose channels bridge natively with each other
    pub fn native(type_name: &str, caps: Format, bridge_id: &'static str) -> Arc<Self> {
        Arc::new(Self::build(type_name, caps, Some(bridge_id)))
    }

    /// A mock with the given media timing behaviour
    pub fn with_properties(type_name: &str, caps: Format, properties: TechProperties) -> Arc<Self> {
        let mut tech = Self::build(type_name, caps, None);
        tech.properties = properties;
        Arc::new(tech)
    }

    fn build(type_name: &str, caps: Format, native_bridge: Option<&'static str>) -> Self {
        Self {
            type_name: type_name.to_string(),
            caps,
            native_bridge,
            properties: TechProperties::default(),
            counter: AtomicUsize::new(0),
            hangups: AtomicUsize::new(0),
            native_bridges: AtomicUsize::new(0),
            fixups: AtomicUsize::new(0),
            fail_fixup: AtomicBool::new(false),
        }
    }

    /// Attach private data and set formats on a freshly allocated channel
    pub async fn setup(&self, chan: &Arc<Channel>) -> Arc<Mutex<Vec<Frame>>> {
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut c = chan.lock().await;
        c.set_tech_pvt(Some(Box::new(MockPvt {
            written: written.clone(),
        })));
        c.nativeformats = self.caps;
        c.set_read_format(self.caps).unwrap();
        c.set_write_format(self.caps).unwrap();
        written
    }

    fn record(chan: &ChannelInner, frame: Frame) {
        if let Some(pvt) = chan.tech_pvt_ref::<MockPvt>() {
            pvt.written.lock().push(frame);
        }
    }
}

#[async_trait]
impl ChannelTech for MockTech {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn description(&self) -> &str {
        "Mock channel driver"
    }

    fn capabilities(&self) -> Format {
        self.caps
    }

    fn features(&self) -> TechFeatures {
        TechFeatures {
            devicestate: true,
            indications: true,
            transfer: false,
            send_digit: true,
            send_html: false,
        }
    }

    fn properties(&self) -> TechProperties {
        self.properties
    }

    fn native_bridge_id(&self) -> Option<&'static str> {
        self.native_bridge
    }

    async fn requester(
        &self,
        registry: &ChannelRegistry,
        _format: Format,
        data: &str,
    ) -> std::result::Result<Arc<Channel>, HangupCause> {
        if data == "unavailable" {
            return Err(HangupCause::UserBusy);
        }
        let tech = registry
            .lookup_technology(&self.type_name)
            .ok_or(HangupCause::ChanNotImplemented)?;
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let chan = registry
            .channel_alloc(tech, format!("{}/{}-{:04}", self.type_name, data, n))
            .await
            .map_err(|_| HangupCause::SwitchCongestion)?;
        self.setup(&chan).await;
        Ok(chan)
    }

    async fn devicestate(&self, data: &str) -> Result<DeviceState> {
        Ok(if data == "busy" {
            DeviceState::Busy
        } else {
            DeviceState::Unknown
        })
    }

    async fn call(&self, chan: &mut ChannelInner, dest: &str, _timeout: Option<Duration>) -> Result<()> {
        match dest {
            "busy" => chan.queue_control(ControlType::Busy)?,
            "congested" => chan.queue_control(ControlType::Congestion)?,
            "noanswer" => chan.queue_control(ControlType::Ringing)?,
            _ => {
                chan.queue_control(ControlType::Ringing)?;
                chan.queue_control(ControlType::Answer)?;
            }
        }
        Ok(())
    }

    async fn answer(&self, _chan: &mut ChannelInner) -> Result<()> {
        Ok(())
    }

    async fn hangup(&self, chan: &mut ChannelInner) -> Result<()> {
        self.hangups.fetch_add(1, Ordering::Relaxed);
        chan.tech_pvt = None;
        Ok(())
    }

    async fn read(&self, _chan: &mut ChannelInner) -> Option<Frame> {
        Some(Frame::null())
    }

    async fn write(&self, chan: &mut ChannelInner, frame: &Frame) -> Result<()> {
        Self::record(chan, frame.clone());
        Ok(())
    }

    async fn write_video(&self, chan: &mut ChannelInner, frame: &Frame) -> Result<()> {
        Self::record(chan, frame.clone());
        Ok(())
    }

    async fn indicate(&self, chan: &mut ChannelInner, condition: ControlType) -> Result<()> {
        Self::record(chan, Frame::control(condition));
        Ok(())
    }

    async fn send_digit(&self, chan: &mut ChannelInner, digit: char) -> Result<()> {
        Self::record(chan, Frame::dtmf(digit));
        Ok(())
    }

    async fn send_text(&self, chan: &mut ChannelInner, text: &str) -> Result<()> {
        Self::record(chan, Frame::text(text));
        Ok(())
    }

    async fn fixup(&self, _old: &Arc<Channel>, _new: &Arc<Channel>, _inner: &mut ChannelInner) -> Result<()> {
        self.fixups.fetch_add(1, Ordering::Relaxed);
        if self.fail_fixup.load(Ordering::Relaxed) {
            return Err(ChannelError::technology("fixup", "cannot adopt channel"));
        }
        Ok(())
    }

    async fn bridge(
        &self,
        _c0: &Arc<Channel>,
        _c1: &Arc<Channel>,
        _flags: BridgeFlags,
        _timeout: Option<Duration>,
    ) -> Result<BridgeOutcome> {
        self.native_bridges.fetch_add(1, Ordering::Relaxed);
        Ok(BridgeOutcome::new(BridgeResult::Complete))
    }
}

/// A mock channel with its record of driver writes
pub struct MockLeg {
    pub chan: Arc<Channel>,
    pub written: Arc<Mutex<Vec<Frame>>>,
}

impl MockLeg {
    pub fn written(&self) -> Vec<Frame> {
        self.written.lock().clone()
    }

    pub fn written_dtmf(&self) -> String {
        self.written
            .lock()
            .iter()
            .filter_map(|f| match f.kind {
                rvoip_channel_core::frame::FrameKind::Dtmf(d) => Some(d),
                _ => None,
            })
            .collect()
    }
}

/// Allocate a channel on `tech` and prepare it like a driver would
pub async fn mock_leg(registry: &ChannelRegistry, tech: &Arc<MockTech>, name: &str) -> MockLeg {
    let chan = registry.channel_alloc(tech.clone(), name).await.unwrap();
    let written = tech.setup(&chan).await;
    MockLeg { chan, written }
}

/// Registry with default configuration and the given translators
pub fn test_registry_with(translators: Arc<TranslatorRegistry>) -> Arc<ChannelRegistry> {
    ChannelRegistry::builder()
        .config(ChannelCoreConfig::default())
        .translators(translators)
        .build()
        .unwrap()
}

pub fn test_registry() -> Arc<ChannelRegistry> {
    test_registry_with(Arc::new(TranslatorRegistry::new()))
}

/// Registry with the given configuration
pub fn test_registry_config(config: ChannelCoreConfig) -> Arc<ChannelRegistry> {
    ChannelRegistry::builder().config(config).build().unwrap()
}

/// Registry that plays prompts through `prompts`
pub fn test_registry_prompts(prompts: Arc<RecordingPrompts>) -> Arc<ChannelRegistry> {
    ChannelRegistry::builder()
        .config(ChannelCoreConfig::default())
        .prompt_player(prompts)
        .build()
        .unwrap()
}

/// Prompt player that records `(channel, prompt)` pairs instead of playing
#[derive(Default)]
pub struct RecordingPrompts {
    played: Mutex<Vec<(String, String)>>,
}

impl RecordingPrompts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn played(&self) -> Vec<(String, String)> {
        self.played.lock().clone()
    }

    /// Prompts heard by one channel, in order
    pub fn heard_by(&self, channel: &str) -> Vec<String> {
        self.played
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl PromptPlayer for RecordingPrompts {
    async fn stream_and_wait(&self, chan: &Arc<Channel>, sound: &str) -> Result<()> {
        self.played.lock().push((chan.name(), sound.to_string()));
        Ok(())
    }

    async fn say_number(&self, chan: &Arc<Channel>, number: i64) -> Result<()> {
        self.played.lock().push((chan.name(), format!("number:{}", number)));
        Ok(())
    }
}

/// Translator that relabels the payload as another format
pub struct Relabel {
    name: String,
    src: Format,
    dst: Format,
}

struct RelabelInstance(Format);

impl TranslatorInstance for RelabelInstance {
    fn translate(&mut self, frame: &Frame) -> Option<Frame> {
        Some(Frame::voice(self.0, Bytes::copy_from_slice(&frame.data)).with_samples(frame.samples))
    }
}

impl Translator for Relabel {
    fn name(&self) -> &str {
        &self.name
    }

    fn src_format(&self) -> Format {
        self.src
    }

    fn dst_format(&self) -> Format {
        self.dst
    }

    fn new_instance(&self) -> Box<dyn TranslatorInstance> {
        Box::new(RelabelInstance(self.dst))
    }
}

/// Translators between ulaw, alaw and signed linear
pub fn g711_translators() -> Arc<TranslatorRegistry> {
    let reg = TranslatorRegistry::new();
    for (src, dst) in [
        (Format::ULAW, Format::SLINEAR),
        (Format::SLINEAR, Format::ULAW),
        (Format::ALAW, Format::SLINEAR),
        (Format::SLINEAR, Format::ALAW),
    ] {
        reg.register(Arc::new(Relabel {
            name: format!("{}to{}", src.name(), dst.name()),
            src,
            dst,
        }))
        .unwrap();
    }
    Arc::new(reg)
}

/// 20 ms of silence in `format`
pub fn voice(format: Format) -> Frame {
    Frame::voice(format, vec![0u8; 160])
}

/// Everything published since the last drain
pub fn drain_events(rx: &mut broadcast::Receiver<ChannelEvent>) -> Vec<ChannelEvent> {
    let mut events = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        events.push(ev);
    }
    events
}
