//! Channels
//!
//! A [`Channel`] is a stable handle on one call leg. Everything that can change
//! during a call, including the technology driver and its private data,
//! lives in the [`ChannelInner`] behind the handle's mutex. Masquerade swaps
//! the contents of two inners, so an `Arc<Channel>` held by application code
//! stays valid and observes the new identity.
//!
//! Lock order: the registry lock is never held while a channel lock is
//! awaited. Code that needs two channel locks (masquerade) takes the second
//! with try-lock and backs off.

mod cause;
mod formats;
mod io;
mod ops;
mod queue;

use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify, OwnedMutexGuard};
use tokio::time::Instant;

use crate::cdr::Cdr;
use crate::descriptor::{Descriptor, ALERT_FD, MAX_FDS, TIMING_FD};
use crate::format::Format;
use crate::frame::Frame;
use crate::generator::Generator;
use crate::monitor::ChannelMonitor;
use crate::registry::ChannelServices;
use crate::spy::Spy;
use crate::tech::ChannelTech;
use crate::translate::TranslatorPath;

pub use cause::{cause2str, HangupCause};
pub use formats::channel_make_compatible;
pub use ops::{get_group, print_group};

/// High bit of the frame counters: dump every frame read or written
pub const DEBUGCHAN_FLAG: u32 = 0x8000_0000;

/// Increment a frame counter without touching the debug bit
pub(crate) fn framecount_inc(count: u32) -> u32 {
    (count & DEBUGCHAN_FLAG) | ((count.wrapping_add(1)) & !DEBUGCHAN_FLAG)
}

/// Declare a set of bit flags
macro_rules! flag_set {
    ($(#[$meta:meta])* $name:ident { $($(#[$fmeta:meta])* $flag:ident = $value:expr,)* }) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
        pub struct $name(u32);

        impl $name {
            $($(#[$fmeta])* pub const $flag: $name = $name($value);)*

            pub const fn empty() -> Self {
                $name(0)
            }

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn is_empty(self) -> bool {
                self.0 == 0
            }

            pub const fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }

            pub const fn intersects(self, other: $name) -> bool {
                (self.0 & other.0) != 0
            }

            pub fn insert(&mut self, other: $name) {
                self.0 |= other.0;
            }

            pub fn remove(&mut self, other: $name) {
                self.0 &= !other.0;
            }

            pub fn set(&mut self, other: $name, on: bool) {
                if on {
                    self.insert(other)
                } else {
                    self.remove(other)
                }
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl ::std::fmt::Debug for $name {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                let mut names = Vec::new();
                $(if self.contains($name::$flag) && $value != 0 {
                    names.push(stringify!($flag));
                })*
                write!(f, "{}({})", stringify!($name), names.join("|"))
            }
        }
    };
}

flag_set! {
    /// Pending hangup causes. Any bit set means the channel is converging toward hangup.
    SoftHangup {
        /// Device-level failure or remote hangup
        DEV = 0x01,
        ASYNCGOTO = 0x02,
        SHUTDOWN = 0x04,
        /// Absolute hangup deadline reached
        TIMEOUT = 0x08,
        APPUNLOAD = 0x10,
        EXPLICIT = 0x20,
        /// Detach from the current bridge without hanging up
        UNBRIDGE = 0x40,
    }
}

flag_set! {
    /// Channel behaviour flags
    ChannelFlags {
        /// Buffer incoming DTMF instead of returning it
        DEFER_DTMF = 0x01,
        /// Writes interrupt an active generator
        WRITE_INT = 0x02,
        /// Identity has been masqueraded away
        ZOMBIE = 0x08,
        /// Exception pending on one of the descriptors
        EXCEPTION = 0x10,
        /// Outbound leg; ANSWER control frames are accepted
        OUTGOING = 0x80,
        /// In a native bridge
        NBRIDGE = 0x100,
        IN_AUTOSERVICE = 0x200,
    }
}

/// Channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChannelState {
    /// Channel is down and available
    #[default]
    Down,
    /// Reserved but not in use
    Reserved,
    OffHook,
    /// Digits have been dialled
    Dialing,
    /// Line is ringing
    Ring,
    /// Remote end is ringing
    Ringing,
    Up,
    Busy,
}

impl ChannelState {
    pub fn name(self) -> &'static str {
        match self {
            ChannelState::Down => "Down",
            ChannelState::Reserved => "Rsrvd",
            ChannelState::OffHook => "OffHook",
            ChannelState::Dialing => "Dialing",
            ChannelState::Ring => "Ring",
            ChannelState::Ringing => "Ringing",
            ChannelState::Up => "Up",
            ChannelState::Busy => "Busy",
        }
    }
}

/// Printable name of a channel state
pub fn state2str(state: ChannelState) -> &'static str {
    state.name()
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Caller identity
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerId {
    pub num: Option<String>,
    pub name: Option<String>,
    /// Automatic number identification
    pub ani: Option<String>,
    /// Redirected dialled number
    pub rdnis: Option<String>,
    /// Dialled number
    pub dnid: Option<String>,
    /// Presentation indicator
    pub pres: u8,
}

/// Lookup keys of a channel. Shared with the handle so registry scans can
/// match without taking the channel lock.
#[derive(Debug, Clone, Default)]
pub struct ChannelIdent {
    pub name: String,
    pub context: String,
    pub exten: String,
    pub macro_context: Option<String>,
    pub macro_exten: Option<String>,
}

static NEXT_PVT_GENERATION: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_pvt_generation() -> u64 {
    NEXT_PVT_GENERATION.fetch_add(1, Ordering::Relaxed)
}

/// Mutable state of a channel, only reachable through the channel lock
pub struct ChannelInner {
    pub(crate) ident: Arc<RwLock<ChannelIdent>>,
    pub(crate) uniqueid: String,

    /// Technology driver
    pub tech: Arc<dyn ChannelTech>,
    /// Driver-private data, released by the driver's hangup
    pub tech_pvt: Option<Box<dyn Any + Send>>,
    pub(crate) pvt_generation: u64,

    pub nativeformats: Format,
    pub(crate) readformat: Format,
    pub(crate) writeformat: Format,
    pub(crate) rawreadformat: Format,
    pub(crate) rawwriteformat: Format,
    pub(crate) readtrans: Option<TranslatorPath>,
    pub(crate) writetrans: Option<TranslatorPath>,

    pub(crate) readq: VecDeque<Frame>,
    pub(crate) alert: Arc<Descriptor>,
    pub(crate) fds: [Option<Arc<Descriptor>>; MAX_FDS],
    pub(crate) timing: Option<Arc<Descriptor>>,
    /// Slot of the descriptor that woke the last wait
    pub fdno: Option<usize>,

    pub(crate) state: ChannelState,
    pub(crate) softhangup: SoftHangup,
    pub(crate) flags: ChannelFlags,
    pub(crate) whentohangup: Option<Instant>,
    pub hangupcause: HangupCause,

    pub cid: CallerId,
    pub language: String,
    pub priority: i32,
    pub accountcode: String,
    pub musicclass: String,
    /// Current application and its argument
    pub appl: Option<String>,
    pub data: Option<String>,
    pub callgroup: u64,
    pub pickupgroup: u64,
    pub(crate) vars: Vec<(String, String)>,

    pub(crate) masq: Option<Arc<Channel>>,
    pub(crate) masqr: Option<Weak<Channel>>,

    pub(crate) spies: Vec<Spy>,
    pub monitor: Option<ChannelMonitor>,
    pub(crate) insmpl: i64,
    pub(crate) outsmpl: i64,

    pub(crate) generator: Option<Box<dyn Generator>>,
    pub(crate) dtmfq: String,
    pub(crate) fin: u32,
    pub(crate) fout: u32,

    pub cdr: Option<Cdr>,
    pub(crate) services: Arc<ChannelServices>,
}

impl ChannelInner {
    pub(crate) fn new(
        name: String,
        uniqueid: String,
        tech: Arc<dyn ChannelTech>,
        services: Arc<ChannelServices>,
        ident: Arc<RwLock<ChannelIdent>>,
    ) -> Self {
        let config = &services.config;
        {
            let mut id = ident.write();
            id.name = name;
            id.context = config.default_context.clone();
            id.exten = config.default_exten.clone();
        }
        let alert = Descriptor::shared();
        let mut fds: [Option<Arc<Descriptor>>; MAX_FDS] = Default::default();
        fds[ALERT_FD] = Some(alert.clone());
        Self {
            ident,
            uniqueid,
            tech,
            tech_pvt: None,
            pvt_generation: next_pvt_generation(),
            nativeformats: Format::NONE,
            readformat: Format::NONE,
            writeformat: Format::NONE,
            rawreadformat: Format::NONE,
            rawwriteformat: Format::NONE,
            readtrans: None,
            writetrans: None,
            readq: VecDeque::new(),
            alert,
            fds,
            timing: None,
            fdno: None,
            state: ChannelState::Down,
            softhangup: SoftHangup::empty(),
            flags: ChannelFlags::empty(),
            whentohangup: None,
            hangupcause: HangupCause::NormalClearing,
            cid: CallerId::default(),
            language: config.default_language.clone(),
            priority: config.default_priority,
            accountcode: String::new(),
            musicclass: String::new(),
            appl: None,
            data: None,
            callgroup: 0,
            pickupgroup: 0,
            vars: Vec::new(),
            masq: None,
            masqr: None,
            spies: Vec::new(),
            monitor: None,
            insmpl: 0,
            outsmpl: 0,
            generator: None,
            dtmfq: String::new(),
            fin: 0,
            fout: 0,
            cdr: None,
            services,
        }
    }

    pub fn name(&self) -> String {
        self.ident.read().name.clone()
    }

    pub fn uniqueid(&self) -> &str {
        &self.uniqueid
    }

    pub fn context(&self) -> String {
        self.ident.read().context.clone()
    }

    pub fn set_context(&mut self, context: impl Into<String>) {
        self.ident.write().context = context.into();
    }

    pub fn exten(&self) -> String {
        self.ident.read().exten.clone()
    }

    pub fn set_exten(&mut self, exten: impl Into<String>) {
        self.ident.write().exten = exten.into();
    }

    /// Set or clear the macro position used by extension lookups
    pub fn set_macro(&mut self, context: Option<String>, exten: Option<String>) {
        let mut id = self.ident.write();
        id.macro_context = context;
        id.macro_exten = exten;
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn softhangup_flags(&self) -> SoftHangup {
        self.softhangup
    }

    pub fn flags(&self) -> ChannelFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: ChannelFlags, on: bool) {
        self.flags.set(flag, on);
    }

    pub fn is_zombie(&self) -> bool {
        self.flags.contains(ChannelFlags::ZOMBIE)
    }

    pub fn readformat(&self) -> Format {
        self.readformat
    }

    pub fn writeformat(&self) -> Format {
        self.writeformat
    }

    pub fn rawreadformat(&self) -> Format {
        self.rawreadformat
    }

    pub fn rawwriteformat(&self) -> Format {
        self.rawwriteformat
    }

    /// Id of the current read translation path
    pub fn readtrans_id(&self) -> Option<u64> {
        self.readtrans.as_ref().map(|t| t.id())
    }

    pub fn writetrans_id(&self) -> Option<u64> {
        self.writetrans.as_ref().map(|t| t.id())
    }

    /// Number of frames waiting in the read queue
    pub fn queue_len(&self) -> usize {
        self.readq.len()
    }

    /// Snapshot of the read queue
    pub fn queued_frames(&self) -> Vec<Frame> {
        self.readq.iter().cloned().collect()
    }

    pub fn alert(&self) -> &Arc<Descriptor> {
        &self.alert
    }

    /// Install a device descriptor in one of the technology slots
    pub fn set_fd(&mut self, slot: usize, fd: Option<Arc<Descriptor>>) {
        if slot < TIMING_FD {
            self.fds[slot] = fd;
        } else {
            tracing::warn!("Refusing to set reserved descriptor slot {} on {}", slot, self.name());
        }
    }

    pub fn fd(&self, slot: usize) -> Option<&Arc<Descriptor>> {
        self.fds.get(slot).and_then(|f| f.as_ref())
    }

    /// Install a periodic timing source. While one is present, generators are
    /// paced by its ticks instead of by reads.
    pub fn set_timing_source(&mut self, timing: Option<Arc<Descriptor>>) {
        self.fds[TIMING_FD] = timing.clone();
        self.timing = timing;
    }

    pub fn has_generator(&self) -> bool {
        self.generator.is_some()
    }

    pub fn whentohangup(&self) -> Option<Instant> {
        self.whentohangup
    }

    pub fn has_masquerade_pending(&self) -> bool {
        self.masq.is_some()
    }

    pub fn is_masquerade_target(&self) -> bool {
        self.masqr.is_some()
    }

    pub fn spy_count(&self) -> usize {
        self.spies.len()
    }

    /// Channel variables in insertion order
    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    /// Deferred DTMF digits not yet returned
    pub fn deferred_digits(&self) -> &str {
        &self.dtmfq
    }

    /// Frames read and written, without the debug bit
    pub fn frame_counts(&self) -> (u32, u32) {
        (self.fin & !DEBUGCHAN_FLAG, self.fout & !DEBUGCHAN_FLAG)
    }

    /// Replace the driver-private data; the bridge treats this as a new identity
    pub fn set_tech_pvt(&mut self, pvt: Option<Box<dyn Any + Send>>) {
        self.tech_pvt = pvt;
        self.pvt_generation = next_pvt_generation();
    }

    pub fn tech_pvt_ref<T: 'static>(&self) -> Option<&T> {
        self.tech_pvt.as_ref().and_then(|p| p.downcast_ref::<T>())
    }

    pub fn tech_pvt_mut<T: 'static>(&mut self) -> Option<&mut T> {
        self.tech_pvt.as_mut().and_then(|p| p.downcast_mut::<T>())
    }

    pub fn services(&self) -> &Arc<ChannelServices> {
        &self.services
    }
}

impl fmt::Debug for ChannelInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelInner")
            .field("name", &self.name())
            .field("uniqueid", &self.uniqueid)
            .field("tech", &self.tech.type_name())
            .field("state", &self.state)
            .field("softhangup", &self.softhangup)
            .field("flags", &self.flags)
            .field("nativeformats", &self.nativeformats)
            .field("readq", &self.readq.len())
            .finish()
    }
}

/// Stable handle on a call leg
pub struct Channel {
    inner: Arc<Mutex<ChannelInner>>,
    ident: Arc<RwLock<ChannelIdent>>,
    uniqueid: String,
    /// Set while a task is parked in a wait on this channel
    blocking: AtomicBool,
    interrupt: Notify,
    /// Peer in the current bridge; advisory only
    bridge: parking_lot::Mutex<Option<Weak<Channel>>>,
}

impl Channel {
    pub(crate) fn new(
        name: String,
        uniqueid: String,
        tech: Arc<dyn ChannelTech>,
        services: Arc<ChannelServices>,
    ) -> Arc<Self> {
        let ident = Arc::new(RwLock::new(ChannelIdent::default()));
        let inner = ChannelInner::new(name, uniqueid.clone(), tech, services, ident.clone());
        Arc::new(Self {
            inner: Arc::new(Mutex::new(inner)),
            ident,
            uniqueid,
            blocking: AtomicBool::new(false),
            interrupt: Notify::new(),
            bridge: parking_lot::Mutex::new(None),
        })
    }

    /// Current name. May change at any time through rename or masquerade.
    pub fn name(&self) -> String {
        self.ident.read().name.clone()
    }

    pub fn uniqueid(&self) -> &str {
        &self.uniqueid
    }

    pub(crate) fn ident(&self) -> ChannelIdent {
        self.ident.read().clone()
    }

    /// Lock the channel
    pub async fn lock(self: &Arc<Self>) -> LockedChannel {
        let guard = self.inner.clone().lock_owned().await;
        LockedChannel {
            chan: self.clone(),
            guard,
        }
    }

    /// Lock the channel if nobody else holds it
    pub fn try_lock(self: &Arc<Self>) -> Option<LockedChannel> {
        let guard = self.inner.clone().try_lock_owned().ok()?;
        Some(LockedChannel {
            chan: self.clone(),
            guard,
        })
    }

    /// Channel this one is bridged to, if any
    pub fn bridged_channel(&self) -> Option<Arc<Channel>> {
        self.bridge.lock().as_ref().and_then(|w| w.upgrade())
    }

    pub fn is_bridged(&self) -> bool {
        self.bridged_channel().is_some()
    }

    pub(crate) fn set_bridge(&self, peer: Option<&Arc<Channel>>) {
        *self.bridge.lock() = peer.map(Arc::downgrade);
    }

    /// True while a task is blocked waiting on this channel
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    pub(crate) fn set_blocking(&self, on: bool) -> bool {
        self.blocking.swap(on, Ordering::AcqRel)
    }

    pub(crate) fn interrupted(&self) -> tokio::sync::futures::Notified<'_> {
        self.interrupt.notified()
    }

    /// Wake a task blocked on this channel. The wait returns as if it timed out.
    pub fn interrupt_blocker(&self) {
        if self.is_blocking() {
            tracing::debug!("Interrupting blocked waiter on {}", self.name());
            self.interrupt.notify_one();
        }
    }

    /// Same underlying handle
    pub fn same(a: &Arc<Channel>, b: &Arc<Channel>) -> bool {
        Arc::ptr_eq(a, b)
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name())
            .field("uniqueid", &self.uniqueid)
            .finish()
    }
}

/// A channel together with its held lock
pub struct LockedChannel {
    chan: Arc<Channel>,
    guard: OwnedMutexGuard<ChannelInner>,
}

impl LockedChannel {
    pub fn channel(&self) -> &Arc<Channel> {
        &self.chan
    }

    /// Release the lock, keeping the handle
    pub fn unlock(self) -> Arc<Channel> {
        self.chan
    }
}

impl Deref for LockedChannel {
    type Target = ChannelInner;

    fn deref(&self) -> &ChannelInner {
        &self.guard
    }
}

impl DerefMut for LockedChannel {
    fn deref_mut(&mut self) -> &mut ChannelInner {
        &mut self.guard
    }
}

impl fmt::Debug for LockedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LockedChannel").field(&*self.guard).finish()
    }
}
