//! Call detail records
//!
//! The core only keeps the record current at the lifecycle points it owns
//! (allocation, answer, hangup); persisting it is the job of a [`CdrSink`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::{CallerId, ChannelInner, ChannelState, HangupCause};

/// Final outcome of a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Disposition {
    #[default]
    NoAnswer,
    Busy,
    Failed,
    Answered,
}

impl Disposition {
    pub fn name(self) -> &'static str {
        match self {
            Disposition::NoAnswer => "NO ANSWER",
            Disposition::Busy => "BUSY",
            Disposition::Failed => "FAILED",
            Disposition::Answered => "ANSWERED",
        }
    }
}

/// One call detail record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cdr {
    /// Caller id as `"name" <num>`
    pub clid: String,
    pub src: String,
    pub dst: String,
    pub dcontext: String,
    pub channel: String,
    pub dstchannel: String,
    pub lastapp: String,
    pub lastdata: String,
    pub start: Option<DateTime<Utc>>,
    pub answer: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Seconds from start to end
    pub duration: i64,
    /// Seconds from answer to end
    pub billsec: i64,
    pub disposition: Disposition,
    pub accountcode: String,
    pub uniqueid: String,
    pub userfield: String,
    #[serde(skip)]
    posted: bool,
}

/// Receives finished records
pub trait CdrSink: Send + Sync {
    fn post(&self, cdr: &Cdr);
}

fn format_clid(cid: &CallerId) -> String {
    match (&cid.name, &cid.num) {
        (Some(name), Some(num)) => format!("\"{}\" <{}>", name, num),
        (Some(name), None) => name.clone(),
        (None, Some(num)) => num.clone(),
        (None, None) => String::new(),
    }
}

impl Cdr {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the record from the channel it belongs to and start the clock
    pub fn init(&mut self, chan: &ChannelInner) {
        self.channel = chan.name();
        self.uniqueid = chan.uniqueid().to_string();
        self.dst = chan.exten();
        self.dcontext = chan.context();
        self.accountcode = chan.accountcode.clone();
        self.setcid(&chan.cid);
        self.disposition = if chan.state() == ChannelState::Up {
            Disposition::Answered
        } else {
            Disposition::NoAnswer
        };
        self.start = Some(Utc::now());
    }

    /// Record the answer time; only the first answer counts
    pub fn answer(&mut self) {
        if self.answer.is_none() {
            self.answer = Some(Utc::now());
            self.disposition = Disposition::Answered;
        }
    }

    /// Record the end time and compute durations
    pub fn end(&mut self) {
        if self.end.is_some() {
            return;
        }
        let now = Utc::now();
        self.end = Some(now);
        if let Some(start) = self.start {
            self.duration = (now - start).num_seconds();
        }
        if let Some(answer) = self.answer {
            self.billsec = (now - answer).num_seconds();
        }
    }

    pub fn setcid(&mut self, cid: &CallerId) {
        self.clid = format_clid(cid);
        self.src = cid.ani.clone().or_else(|| cid.num.clone()).unwrap_or_default();
    }

    pub fn setaccount(&mut self, account: &str) {
        self.accountcode = account.to_string();
    }

    pub fn setapp(&mut self, app: &str, data: &str) {
        self.lastapp = app.to_string();
        self.lastdata = data.to_string();
    }

    /// Derive the disposition from a hangup cause when the call never answered
    pub fn set_disposition(&mut self, cause: HangupCause) {
        if self.answer.is_some() {
            return;
        }
        self.disposition = match cause {
            HangupCause::UserBusy => Disposition::Busy,
            HangupCause::NoAnswer | HangupCause::NoUserResponse | HangupCause::NormalClearing => {
                Disposition::NoAnswer
            }
            _ => Disposition::Failed,
        };
    }

    pub fn is_posted(&self) -> bool {
        self.posted
    }

    /// Hand the finished record to the sink. Unanswered records are only
    /// posted when `post_unanswered` is set.
    pub fn detach(mut self, sink: Option<&dyn CdrSink>, post_unanswered: bool) {
        self.end();
        if self.posted {
            return;
        }
        if self.answer.is_none() && !post_unanswered {
            tracing::debug!("Not posting unanswered CDR for {}", self.channel);
            return;
        }
        self.posted = true;
        if let Some(sink) = sink {
            sink.post(&self);
        }
    }
}
