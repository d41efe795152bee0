//! Waiting on channels and descriptors
//!
//! The only place the core blocks on I/O. Every channel's descriptor slots
//! and any extra descriptors form one wait set. The wait is clamped to the
//! earliest absolute hangup deadline among the channels, and after it returns
//! readiness is scanned level-triggered, the way poll reports it.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::future::select_all;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelFlags, SoftHangup};
use crate::descriptor::{Descriptor, MAX_FDS};
use crate::error::{ChannelError, Result};
use crate::masquerade::do_masquerade;

/// What a wait observed
#[derive(Debug, Default)]
pub struct WaitResult {
    /// Channel with something to read, or whose hangup deadline passed
    pub winner: Option<Arc<Channel>>,
    /// Index into the extra descriptors of the one that fired. Takes priority
    /// over a channel winner, which is cleared.
    pub fd: Option<usize>,
    /// The extra descriptor fired with its exception condition
    pub exception: bool,
    /// Woken by `interrupt_blocker`
    pub interrupted: bool,
}

/// Outcome of waiting on a single channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStatus {
    /// Something is ready to read
    Ready { remaining: Option<Duration> },
    /// Woken early with nothing ready; the caller may simply wait again
    Interrupted { remaining: Option<Duration> },
    TimedOut,
}

/// Clears the blocking flag of every waited channel, including on cancellation
struct BlockingGuard<'a> {
    chans: &'a [Arc<Channel>],
}

impl<'a> BlockingGuard<'a> {
    fn new(chans: &'a [Arc<Channel>]) -> Self {
        for chan in chans {
            if chan.set_blocking(true) {
                warn!("Blocking on '{}', already blocked by another task", chan.name());
            }
        }
        Self { chans }
    }
}

impl Drop for BlockingGuard<'_> {
    fn drop(&mut self) {
        for chan in self.chans {
            chan.set_blocking(false);
        }
    }
}

type WaitFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Wait on `chans` and the extra descriptors `fds`.
///
/// `timeout` of `None` waits without limit. On return it holds the time left
/// of the budget, so repeated calls in a loop converge to zero.
pub async fn waitfor_nandfds(
    chans: &[Arc<Channel>],
    fds: &[Arc<Descriptor>],
    timeout: &mut Option<Duration>,
) -> Result<WaitResult> {
    let start = Instant::now();

    let mut descriptors = Vec::new();
    let mut whentohangup: Option<Instant> = None;
    for chan in chans {
        let mut c = chan.lock().await;
        if c.masq.is_some() {
            c = do_masquerade(c).await.map_err(|e| {
                warn!("Masquerade failed");
                e
            })?;
        }
        if let Some(deadline) = c.whentohangup {
            whentohangup = Some(whentohangup.map_or(deadline, |w| w.min(deadline)));
        }
        descriptors.extend(c.fds.iter().flatten().cloned());
    }
    descriptors.extend(fds.iter().cloned());

    let mut deadline = timeout.map(|t| start + t);
    if let Some(hangup_at) = whentohangup {
        if deadline.map_or(true, |d| hangup_at < d) {
            deadline = Some(hangup_at);
        }
    }

    let mut interrupted = false;
    {
        let _blocking = BlockingGuard::new(chans);
        let mut waits: Vec<WaitFuture<'_>> = descriptors
            .iter()
            .map(|d| Box::pin(d.readable()) as WaitFuture<'_>)
            .collect();
        let interrupt_at = waits.len();
        waits.extend(chans.iter().map(|c| Box::pin(c.interrupted()) as WaitFuture<'_>));

        if waits.is_empty() {
            if let Some(d) = deadline {
                tokio::time::sleep_until(d).await;
            }
        } else {
            let any = select_all(waits);
            let fired = match deadline {
                Some(d) => tokio::time::timeout_at(d, any).await.ok(),
                None => Some(any.await),
            };
            if let Some((_, index, _)) = fired {
                interrupted = index >= interrupt_at;
            }
        }
    }

    let now = Instant::now();
    let mut result = WaitResult {
        interrupted,
        ..WaitResult::default()
    };
    for chan in chans {
        let mut c = chan.lock().await;
        if c.whentohangup.is_some_and(|w| now >= w) {
            c.softhangup.insert(SoftHangup::TIMEOUT);
            if result.winner.is_none() {
                result.winner = Some(chan.clone());
            }
        }
        for slot in 0..MAX_FDS {
            let Some(fd) = c.fds[slot].clone() else {
                continue;
            };
            if fd.is_ready() {
                c.flags.set(ChannelFlags::EXCEPTION, fd.has_exception());
                c.fdno = Some(slot);
                result.winner = Some(chan.clone());
            }
        }
    }
    for (index, fd) in fds.iter().enumerate() {
        if fd.is_ready() {
            result.fd = Some(index);
            result.exception = fd.has_exception();
            result.winner = None;
        }
    }
    if result.interrupted && (result.winner.is_some() || result.fd.is_some()) {
        result.interrupted = false;
    }
    if result.interrupted {
        debug!("Wait interrupted");
    }

    *timeout = timeout.map(|t| t.saturating_sub(start.elapsed()));
    Ok(result)
}

/// Wait on several channels, returning the one ready to read
pub async fn waitfor_n(chans: &[Arc<Channel>], timeout: &mut Option<Duration>) -> Result<Option<Arc<Channel>>> {
    Ok(waitfor_nandfds(chans, &[], timeout).await?.winner)
}

/// Wait on extra descriptors only, returning the index of the one that fired
pub async fn waitfor_fd(fds: &[Arc<Descriptor>], timeout: &mut Option<Duration>) -> Result<Option<usize>> {
    Ok(waitfor_nandfds(&[], fds, timeout).await?.fd)
}

/// Wait on one channel
pub async fn waitfor(chan: &Arc<Channel>, timeout: Option<Duration>) -> Result<WaitStatus> {
    let mut remaining = timeout;
    let result = waitfor_nandfds(std::slice::from_ref(chan), &[], &mut remaining).await?;
    Ok(if result.winner.is_some() {
        WaitStatus::Ready { remaining }
    } else if remaining.map_or(true, |r| !r.is_zero()) {
        WaitStatus::Interrupted { remaining }
    } else {
        WaitStatus::TimedOut
    })
}

impl WaitStatus {
    /// Time left, `None` when waiting without limit or timed out
    pub fn remaining(self) -> Option<Duration> {
        match self {
            WaitStatus::Ready { remaining } | WaitStatus::Interrupted { remaining } => remaining,
            WaitStatus::TimedOut => None,
        }
    }

    pub fn is_timeout(self) -> bool {
        self == WaitStatus::TimedOut
    }
}

/// Sleep on a channel while `cond` holds, reading and discarding frames so
/// the queue does not back up. Fails if the channel hangs up.
pub async fn safe_sleep_conditional<F>(chan: &Arc<Channel>, duration: Duration, mut cond: F) -> Result<()>
where
    F: FnMut() -> bool + Send,
{
    let mut remaining = Some(duration);
    while remaining.is_some_and(|r| !r.is_zero()) {
        if !cond() {
            return Ok(());
        }
        match waitfor(chan, remaining).await? {
            WaitStatus::TimedOut => break,
            WaitStatus::Interrupted { remaining: r } => remaining = r,
            WaitStatus::Ready { remaining: r } => {
                remaining = r;
                if chan.read().await.is_none() {
                    return Err(ChannelError::hung_up(chan.name()));
                }
            }
        }
    }
    Ok(())
}

/// Sleep on a channel, discarding frames
pub async fn safe_sleep(chan: &Arc<Channel>, duration: Duration) -> Result<()> {
    safe_sleep_conditional(chan, duration, || true).await
}
