//! DTMF collection

use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::error::{ChannelError, Result};
use crate::frame::FrameKind;
use crate::waitfor::{waitfor, WaitStatus};

/// Result of [`readstring`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadString {
    /// An ender was pressed or the maximum length was reached
    Complete(String),
    /// The inter-digit (or first digit) timeout expired
    Timeout(String),
}

impl ReadString {
    pub fn digits(&self) -> &str {
        match self {
            ReadString::Complete(s) | ReadString::Timeout(s) => s,
        }
    }
}

async fn ensure_up(chan: &Arc<Channel>) -> Result<()> {
    let mut c = chan.lock().await;
    if c.is_zombie() || c.check_hangup() {
        return Err(ChannelError::hung_up(c.name()));
    }
    Ok(())
}

/// Wait up to `timeout` for a digit. `Ok(None)` on timeout; an error when
/// the channel hangs up.
pub async fn waitfordigit(chan: &Arc<Channel>, timeout: Option<Duration>) -> Result<Option<char>> {
    ensure_up(chan).await?;
    let mut remaining = timeout;
    while remaining.map_or(true, |r| !r.is_zero()) {
        match waitfor(chan, remaining).await? {
            WaitStatus::TimedOut => return Ok(None),
            WaitStatus::Interrupted { remaining: r } => remaining = r,
            WaitStatus::Ready { remaining: r } => {
                remaining = r;
                match chan.read().await {
                    None => return Err(ChannelError::hung_up(chan.name())),
                    Some(f) => {
                        if let FrameKind::Dtmf(digit) = f.kind {
                            return Ok(Some(digit));
                        }
                    }
                }
            }
        }
    }
    Ok(None)
}

/// Collect up to `len` digits. The first digit may take `first_timeout`,
/// each later one `timeout`. A digit in `enders` ends collection and is not
/// included.
pub async fn readstring(
    chan: &Arc<Channel>,
    len: usize,
    timeout: Option<Duration>,
    first_timeout: Option<Duration>,
    enders: &str,
) -> Result<ReadString> {
    ensure_up(chan).await?;
    if len == 0 {
        return Err(ChannelError::invalid("readstring needs a non-zero length"));
    }
    let mut digits = String::new();
    let mut to = first_timeout;
    loop {
        let Some(digit) = waitfordigit(chan, to).await? else {
            return Ok(ReadString::Timeout(digits));
        };
        if enders.contains(digit) {
            return Ok(ReadString::Complete(digits));
        }
        digits.push(digit);
        if digits.len() >= len {
            return Ok(ReadString::Complete(digits));
        }
        to = timeout;
    }
}
