//! Autoservice: keep reading a channel nobody else is reading
//!
//! While one leg of a bridge hears a prompt, the other leg still receives
//! media. A background task reads and discards its frames so the read queue
//! never backs up. A hangup seen meanwhile is put back on the queue for the
//! owner when service stops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::channel::{Channel, ChannelFlags};
use crate::descriptor::Descriptor;
use crate::error::{ChannelError, Result};
use crate::frame::Frame;
use crate::waitfor::waitfor_nandfds;

const SERVICE_POLL: Duration = Duration::from_millis(500);

/// One serviced channel. Nested starts share the task.
pub(crate) struct AutoserviceSlot {
    use_count: usize,
    stop: Arc<Descriptor>,
    hungup: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

async fn autoservice_run(chan: Arc<Channel>, stop: Arc<Descriptor>, hungup: Arc<AtomicBool>) {
    let stops = [stop];
    loop {
        let mut timeout = Some(SERVICE_POLL);
        let res = match waitfor_nandfds(std::slice::from_ref(&chan), &stops, &mut timeout).await {
            Ok(res) => res,
            Err(e) => {
                warn!("Autoservice wait failed on {}: {}", chan.name(), e);
                break;
            }
        };
        if res.fd.is_some() {
            break;
        }
        if res.winner.is_some() && chan.read().await.is_none() {
            debug!("Autoservice saw hangup on {}", chan.name());
            hungup.store(true, Ordering::Release);
            break;
        }
    }
}

/// Start servicing `chan` in the background
pub async fn autoservice_start(chan: &Arc<Channel>) -> Result<()> {
    let services = chan.lock().await.services.clone();
    match services.autoservice.entry(chan.uniqueid().to_string()) {
        Entry::Occupied(mut slot) => {
            slot.get_mut().use_count += 1;
            return Ok(());
        }
        Entry::Vacant(vacant) => {
            let stop = Descriptor::shared();
            let hungup = Arc::new(AtomicBool::new(false));
            let task = tokio::spawn(autoservice_run(chan.clone(), stop.clone(), hungup.clone()));
            vacant.insert(AutoserviceSlot {
                use_count: 1,
                stop,
                hungup,
                task: Some(task),
            });
        }
    }
    chan.lock().await.set_flag(ChannelFlags::IN_AUTOSERVICE, true);
    debug!("Started autoservice on {}", chan.name());
    Ok(())
}

/// Stop servicing `chan`. Fails if the channel hung up in the meantime.
pub async fn autoservice_stop(chan: &Arc<Channel>) -> Result<()> {
    let services = chan.lock().await.services.clone();
    let slot = match services.autoservice.entry(chan.uniqueid().to_string()) {
        Entry::Occupied(mut slot) => {
            slot.get_mut().use_count -= 1;
            if slot.get().use_count > 0 {
                return Ok(());
            }
            slot.remove()
        }
        Entry::Vacant(_) => {
            return Err(ChannelError::invalid(format!("{} is not in autoservice", chan.name())));
        }
    };

    slot.stop.signal();
    if let Some(task) = slot.task {
        if let Err(e) = task.await {
            warn!("Autoservice task for {} ended abnormally: {}", chan.name(), e);
        }
    }
    while chan.is_blocking() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    let mut c = chan.lock().await;
    c.set_flag(ChannelFlags::IN_AUTOSERVICE, false);
    if slot.hungup.load(Ordering::Acquire) {
        let _ = c.queue_frame(Frame::hangup());
    }
    debug!("Stopped autoservice on {}", c.name());
    if c.softhangup_flags().is_empty() {
        Ok(())
    } else {
        Err(ChannelError::hung_up(c.name()))
    }
}
