use std::fmt::Write as _;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use xb_registry::Registry;
use xb_strings::DynStr;

pub type CdrResult<T> = Result<T, CdrError>;

#[derive(Error, Debug)]
pub enum CdrError {
    #[error("unknown AMA flag: {0}")]
    BadAmaFlags(String),

    #[error("cause not handled: {0}")]
    BadCause(i32),
}

/// Billing disposition; mutators only ever raise it (Failed is terminal).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Disposition {
    NoAnswer,
    Busy,
    Answered,
    Failed,
}

impl Disposition {
    pub fn as_str(self) -> &'static str {
        match self {
            Disposition::NoAnswer => "NO ANSWER",
            Disposition::Busy => "BUSY",
            Disposition::Answered => "ANSWERED",
            Disposition::Failed => "FAILED",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AmaFlags {
    Omit,
    Billing,
    Documentation,
}

impl AmaFlags {
    pub fn parse(s: &str) -> CdrResult<AmaFlags> {
        match s {
            "omit" => Ok(AmaFlags::Omit),
            "billing" => Ok(AmaFlags::Billing),
            "documentation" => Ok(AmaFlags::Documentation),
            other => Err(CdrError::BadAmaFlags(other.to_owned())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AmaFlags::Omit => "OMIT",
            AmaFlags::Billing => "BILLING",
            AmaFlags::Documentation => "DOCUMENTATION",
        }
    }
}

impl Default for AmaFlags {
    fn default() -> Self {
        AmaFlags::Documentation
    }
}

/// The channel fields a CDR is initialised and updated from. The core builds
/// one under the channel lock and hands it over, keeping this crate free of
/// channel internals.
#[derive(Clone, Debug, Default)]
pub struct CallSnapshot {
    pub channel: String,
    pub uniqueid: String,
    pub cid_num: Option<String>,
    pub cid_name: Option<String>,
    pub cid_ani: Option<String>,
    pub context: String,
    pub exten: String,
    pub accountcode: String,
    pub amaflags: Option<AmaFlags>,
    pub answered: bool,
}

impl CallSnapshot {
    /// `"Name" <num>` caller id string, ANI preferred for the number.
    fn clid(&self) -> String {
        let num = self.cid_ani.as_deref().or(self.cid_num.as_deref());
        match (self.cid_name.as_deref(), num) {
            (Some(name), Some(num)) => format!("\"{name}\" <{num}>"),
            (Some(name), None) => name.to_owned(),
            (None, Some(num)) => num.to_owned(),
            (None, None) => String::new(),
        }
    }

    fn src(&self) -> String {
        self.cid_ani
            .as_deref()
            .or(self.cid_num.as_deref())
            .unwrap_or("")
            .to_owned()
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct CdrData {
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
    pub duration: i64,
    pub billsec: i64,
    pub disposition: Option<Disposition>,
    pub amaflags: AmaFlags,
    pub accountcode: String,
    pub uniqueid: String,
    pub userfield: String,
    pub posted: bool,
    pub locked: bool,
}

/// Flags for [`Cdr::reset`]. The default does not re-post; call sites that
/// want the bill-and-restart behavior set `post`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ResetFlags {
    /// End, duplicate and detach the record before resetting.
    pub post: bool,
    /// Keep the record's variables instead of flushing them.
    pub keep_vars: bool,
    /// Reset even records frozen by LOCKED.
    pub force: bool,
}

/// One call detail record. `next` chains the records of transferred or
/// forked legs; every mutator applies to the whole chain.
pub struct Cdr {
    data: Mutex<CdrData>,
    next: Mutex<Option<Arc<Cdr>>>,
    vars: Registry<str>,
}

impl Default for Cdr {
    fn default() -> Self {
        Self::new()
    }
}

impl Cdr {
    pub fn new() -> Self {
        Cdr {
            data: Mutex::new(CdrData::default()),
            next: Mutex::new(None),
            vars: Registry::new("cdr-vars"),
        }
    }

    /// Fresh record initialised from a channel snapshot.
    pub fn from_snapshot(snap: &CallSnapshot) -> Arc<Cdr> {
        let cdr = Cdr::new();
        {
            let mut d = cdr.data.lock();
            d.channel = snap.channel.clone();
            d.clid = snap.clid();
            d.src = snap.src();
            d.dcontext = snap.context.clone();
            d.dst = snap.exten.clone();
            d.uniqueid = snap.uniqueid.clone();
            d.accountcode = snap.accountcode.clone();
            d.amaflags = snap.amaflags.unwrap_or_default();
            d.disposition = Some(if snap.answered {
                Disposition::Answered
            } else {
                Disposition::NoAnswer
            });
        }
        Arc::new(cdr)
    }

    fn for_chain(&self, mut f: impl FnMut(&Cdr)) {
        f(self);
        let mut cur = self.next.lock().clone();
        while let Some(c) = cur {
            f(&c);
            cur = c.next.lock().clone();
        }
    }

    fn chan_label(d: &CdrData) -> String {
        if d.channel.is_empty() {
            "<unknown>".to_owned()
        } else {
            d.channel.clone()
        }
    }

    fn warn_if_posted(d: &CdrData) {
        if d.posted {
            warn!(chan = %Self::chan_label(d), "CDR already posted");
        }
    }

    /// Append a record to the end of this record's leg chain.
    pub fn append(&self, newcdr: Arc<Cdr>) {
        let mut slot = self.next.lock();
        match &*slot {
            Some(next) => next.append(newcdr),
            None => *slot = Some(newcdr),
        }
    }

    pub fn next_leg(&self) -> Option<Arc<Cdr>> {
        self.next.lock().clone()
    }

    /// Deep copy of this record only (not the chain), vars included.
    pub fn dup(&self) -> Arc<Cdr> {
        let copy = Cdr::new();
        *copy.data.lock() = self.data.lock().clone();
        self.vars.iterate_ordered(|name, value| {
            copy.vars.replace(name, Some(Arc::clone(value)));
            false
        });
        Arc::new(copy)
    }

    // --- lifecycle -------------------------------------------------------

    pub fn start(&self) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            if d.locked {
                return;
            }
            Self::warn_if_posted(&d);
            if d.start.is_some() {
                warn!(chan = %Self::chan_label(&d), "CDR already started");
            } else {
                d.start = Some(Utc::now());
            }
        });
    }

    /// Answer is honored even on LOCKED records.
    pub fn answer(&self) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            Self::warn_if_posted(&d);
            if d.disposition.is_none() || d.disposition < Some(Disposition::Answered) {
                d.disposition = Some(Disposition::Answered);
            }
            if d.answer.is_none() {
                d.answer = Some(Utc::now());
            }
        });
    }

    pub fn busy(&self) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            if d.locked {
                return;
            }
            Self::warn_if_posted(&d);
            if d.disposition.is_none() || d.disposition < Some(Disposition::Busy) {
                d.disposition = Some(Disposition::Busy);
            }
        });
    }

    pub fn failed(&self) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            Self::warn_if_posted(&d);
            if !d.locked {
                d.disposition = Some(Disposition::Failed);
            }
        });
    }

    /// Map a hangup cause onto the disposition.
    pub fn disposition(&self, cause: i32) -> CdrResult<()> {
        match cause {
            causes::BUSY => {
                self.busy();
                Ok(())
            }
            causes::FAILURE | causes::CONGESTION => {
                self.failed();
                Ok(())
            }
            causes::NORMAL => Ok(()),
            other => Err(CdrError::BadCause(other)),
        }
    }

    /// End is honored even on LOCKED records; computes duration and billsec.
    pub fn end(&self) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            Self::warn_if_posted(&d);
            if d.start.is_none() {
                warn!(chan = %Self::chan_label(&d), "CDR has not started");
            }
            if d.end.is_none() {
                d.end = Some(Utc::now());
            }
            let end = d.end.unwrap_or_else(Utc::now);
            d.duration = d
                .start
                .map(|s| (end - s).num_seconds())
                .unwrap_or(0)
                .max(0);
            match d.answer {
                Some(a) => d.billsec = (end - a).num_seconds().max(0),
                None => {
                    d.billsec = 0;
                    debug!(chan = %Self::chan_label(&d), "CDR not answered, billsec => 0");
                }
            }
        });
    }

    // --- field setters ---------------------------------------------------

    pub fn set_app(&self, app: &str, data: &str) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            if d.locked {
                return;
            }
            Self::warn_if_posted(&d);
            d.lastapp = app.to_owned();
            d.lastdata = data.to_owned();
        });
    }

    /// Caller id is honored even on LOCKED records, like end and answer.
    pub fn set_cid(&self, snap: &CallSnapshot) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            d.clid = snap.clid();
            d.src = snap.src();
        });
    }

    pub fn set_destchan(&self, chan: &str) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            Self::warn_if_posted(&d);
            if !d.locked {
                d.dstchannel = chan.to_owned();
            }
        });
    }

    pub fn set_account(&self, account: &str) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            if !d.locked {
                d.accountcode = account.to_owned();
            }
        });
    }

    pub fn set_amaflags(&self, flags: AmaFlags) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            if !d.locked {
                d.amaflags = flags;
            }
        });
    }

    pub fn set_userfield(&self, userfield: &str) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            if !d.locked {
                d.userfield = userfield.to_owned();
            }
        });
    }

    pub fn append_userfield(&self, userfield: &str) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            if !d.locked {
                d.userfield.push_str(userfield);
            }
        });
    }

    /// Refresh the dialplan position fields from the channel.
    pub fn update(&self, snap: &CallSnapshot) {
        self.for_chain(|cdr| {
            let mut d = cdr.data.lock();
            if d.locked {
                return;
            }
            d.clid = snap.clid();
            d.src = snap.src();
            d.dst = snap.exten.clone();
            d.dcontext = snap.context.clone();
        });
    }

    pub fn lock_record(&self) {
        self.data.lock().locked = true;
    }

    pub fn unlock_record(&self) {
        self.data.lock().locked = false;
    }

    pub fn is_locked(&self) -> bool {
        self.data.lock().locked
    }

    pub fn is_posted(&self) -> bool {
        self.data.lock().posted
    }

    pub(crate) fn mark_posted(&self) {
        let mut d = self.data.lock();
        Self::warn_if_posted(&d);
        if d.end.is_none() {
            warn!(chan = %Self::chan_label(&d), "CDR lacks end");
        }
        if d.start.is_none() {
            warn!(chan = %Self::chan_label(&d), "CDR lacks start");
        }
        d.posted = true;
    }

    /// Reset to the just-allocated state. With `flags.post` the record is
    /// ended, duplicated and the duplicate handed back for detaching first.
    pub fn reset(&self, flags: ResetFlags) -> Option<Arc<Cdr>> {
        let mut repost = None;
        {
            let d = self.data.lock();
            if d.locked && !flags.force {
                return None;
            }
        }
        if flags.post {
            self.end();
            let dup = self.dup();
            dup.mark_posted();
            self.data.lock().posted = true;
            repost = Some(dup);
        }
        if !flags.keep_vars {
            self.vars.flush();
        }
        {
            let mut d = self.data.lock();
            d.posted = false;
            d.locked = false;
            d.start = None;
            d.answer = None;
            d.end = None;
            d.duration = 0;
            d.billsec = 0;
            d.disposition = Some(Disposition::NoAnswer);
        }
        self.start();
        repost
    }

    // --- variables -------------------------------------------------------

    pub fn set_var(&self, name: &str, value: Option<&str>) {
        self.for_chain(|cdr| {
            cdr.vars.replace(name, value.map(Arc::from));
        });
    }

    pub fn get_var(&self, name: &str) -> Option<Arc<str>> {
        self.vars.find(name)
    }

    pub fn serialize_variables(&self, out: &mut DynStr, delim: char, sep: char) {
        self.vars.iterate_ordered(|name, value| {
            let _ = write!(out, "{name}{delim}{value}{sep}");
            false
        });
    }

    // --- accessors for rendering/back-ends -------------------------------

    pub fn snapshot(&self) -> CdrView {
        let d = self.data.lock();
        CdrView {
            clid: d.clid.clone(),
            src: d.src.clone(),
            dst: d.dst.clone(),
            dcontext: d.dcontext.clone(),
            channel: d.channel.clone(),
            dstchannel: d.dstchannel.clone(),
            lastapp: d.lastapp.clone(),
            lastdata: d.lastdata.clone(),
            start: d.start,
            answer: d.answer,
            end: d.end,
            duration: d.duration,
            billsec: d.billsec,
            disposition: d.disposition.unwrap_or(Disposition::NoAnswer),
            amaflags: d.amaflags,
            accountcode: d.accountcode.clone(),
            uniqueid: d.uniqueid.clone(),
            userfield: d.userfield.clone(),
        }
    }
}

/// Immutable copy of a record's fields for back-ends and rendering.
#[derive(Clone, Debug)]
pub struct CdrView {
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
    pub duration: i64,
    pub billsec: i64,
    pub disposition: Disposition,
    pub amaflags: AmaFlags,
    pub accountcode: String,
    pub uniqueid: String,
    pub userfield: String,
}

impl CdrView {
    /// `YYYY-MM-DD HH:MM:SS`, empty when unset.
    pub fn format_time(t: Option<DateTime<Utc>>) -> String {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default()
    }
}

/// Hangup causes the disposition mapper understands.
pub mod causes {
    pub const NORMAL: i32 = 16;
    pub const BUSY: i32 = 17;
    pub const FAILURE: i32 = 38;
    pub const CONGESTION: i32 = 34;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap() -> CallSnapshot {
        CallSnapshot {
            channel: "Test/1".into(),
            uniqueid: "uid-1".into(),
            cid_num: Some("100".into()),
            cid_name: Some("Alice".into()),
            context: "default".into(),
            exten: "s".into(),
            ..Default::default()
        }
    }

    #[test]
    fn init_populates_identity_fields() {
        let cdr = Cdr::from_snapshot(&snap());
        let v = cdr.snapshot();
        assert_eq!(v.channel, "Test/1");
        assert_eq!(v.clid, "\"Alice\" <100>");
        assert_eq!(v.src, "100");
        assert_eq!(v.dcontext, "default");
        assert_eq!(v.dst, "s");
        assert_eq!(v.disposition, Disposition::NoAnswer);
    }

    #[test]
    fn end_without_answer_has_zero_billsec() {
        let cdr = Cdr::from_snapshot(&snap());
        cdr.start();
        cdr.end();
        let v = cdr.snapshot();
        assert!(v.start.is_some());
        assert!(v.end.is_some());
        assert_eq!(v.billsec, 0);
        assert!(v.duration >= 0);
        assert!(v.end >= v.answer.or(v.start));
    }

    #[test]
    fn answer_raises_disposition_once() {
        let cdr = Cdr::from_snapshot(&snap());
        cdr.start();
        cdr.busy();
        assert_eq!(cdr.snapshot().disposition, Disposition::Busy);
        cdr.answer();
        assert_eq!(cdr.snapshot().disposition, Disposition::Answered);
        // busy cannot lower it again
        cdr.busy();
        assert_eq!(cdr.snapshot().disposition, Disposition::Answered);
    }

    #[test]
    fn locked_freezes_mutators_except_end_answer_setcid() {
        let cdr = Cdr::from_snapshot(&snap());
        cdr.start();
        cdr.lock_record();

        cdr.set_app("Dial", "whatever");
        cdr.set_destchan("Test/2");
        cdr.set_userfield("nope");
        let v = cdr.snapshot();
        assert_eq!(v.lastapp, "");
        assert_eq!(v.dstchannel, "");
        assert_eq!(v.userfield, "");

        // setcid stays live on a locked record.
        let mut late = snap();
        late.cid_name = Some("Bob".into());
        late.cid_num = Some("200".into());
        cdr.set_cid(&late);
        let v = cdr.snapshot();
        assert_eq!(v.clid, "\"Bob\" <200>");
        assert_eq!(v.src, "200");

        cdr.answer();
        cdr.end();
        let v = cdr.snapshot();
        assert_eq!(v.disposition, Disposition::Answered);
        assert!(v.end.is_some());
    }

    #[test]
    fn mutators_apply_to_whole_chain() {
        let a = Cdr::from_snapshot(&snap());
        let mut leg = snap();
        leg.channel = "Test/2".into();
        let b = Cdr::from_snapshot(&leg);
        a.append(Arc::clone(&b));

        a.set_app("Bridge", "arg");
        assert_eq!(b.snapshot().lastapp, "Bridge");
    }

    #[test]
    fn reset_default_does_not_repost() {
        let cdr = Cdr::from_snapshot(&snap());
        cdr.start();
        cdr.answer();
        cdr.set_var("k", Some("v"));

        let repost = cdr.reset(ResetFlags::default());
        assert!(repost.is_none());
        let v = cdr.snapshot();
        assert_eq!(v.disposition, Disposition::NoAnswer);
        assert!(v.answer.is_none());
        assert!(v.start.is_some(), "reset restarts the record");
        assert!(cdr.get_var("k").is_none(), "vars flushed by default");
    }

    #[test]
    fn reset_with_post_hands_back_duplicate() {
        let cdr = Cdr::from_snapshot(&snap());
        cdr.start();
        cdr.answer();

        let dup = cdr
            .reset(ResetFlags {
                post: true,
                keep_vars: true,
                force: false,
            })
            .expect("posting reset returns the duplicate");
        assert!(dup.is_posted());
        assert!(dup.snapshot().end.is_some());
        assert!(!cdr.is_posted(), "original restarts unposted");
    }

    #[test]
    fn userfield_append() {
        let cdr = Cdr::from_snapshot(&snap());
        cdr.set_userfield("abc");
        cdr.append_userfield("def");
        assert_eq!(cdr.snapshot().userfield, "abcdef");
    }

    #[test]
    fn amaflags_parse() {
        assert_eq!(AmaFlags::parse("billing").unwrap(), AmaFlags::Billing);
        assert!(AmaFlags::parse("bogus").is_err());
    }
}
