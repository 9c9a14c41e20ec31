//! Builtin dialplan applications.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{info, warn};

use xb_core::{AppReturn, Application, Channel, ChannelState, Core};
use xb_frame::ControlOp;

use crate::engine::DialplanEngine;
use crate::interp::goto_parsed;

pub(crate) fn register(core: &Arc<Core>, engine: &Arc<DialplanEngine>) {
    let weak = Arc::downgrade(engine);
    let apps: Vec<Arc<dyn Application>> = vec![
        Arc::new(Answer),
        Arc::new(Busy),
        Arc::new(Congestion),
        Arc::new(Goto {
            engine: weak.clone(),
        }),
        Arc::new(GotoIf {
            engine: weak.clone(),
        }),
        Arc::new(Hangup),
        Arc::new(NoOp),
        Arc::new(Progress),
        Arc::new(Ringing),
        Arc::new(SetVar),
        Arc::new(SetGlobalVar { engine: weak }),
        Arc::new(Wait),
    ];
    for app in apps {
        let name = app.name().to_owned();
        core.apps.add(&name, app);
    }
}

struct Answer;

#[async_trait]
impl Application for Answer {
    fn name(&self) -> &str {
        "Answer"
    }
    fn synopsis(&self) -> &str {
        "Answer a channel if ringing"
    }
    async fn exec(&self, chan: &Arc<Channel>, _args: &[String]) -> AppReturn {
        match chan.answer().await {
            Ok(()) => AppReturn::Ok,
            Err(_) => AppReturn::Failure,
        }
    }
}

/// Shared shape of Busy and Congestion: indicate, park until the caller
/// gives up (or the optional timeout elapses), then unwind.
async fn indicate_and_wait(chan: &Arc<Channel>, op: ControlOp, args: &[String]) -> AppReturn {
    let _ = chan.indicate(op).await;
    chan.set_state(ChannelState::Busy);
    let secs: u64 = args
        .first()
        .and_then(|a| a.parse().ok())
        .unwrap_or(3600);
    let _ = chan.safe_sleep(secs * 1000).await;
    AppReturn::Failure
}

struct Busy;

#[async_trait]
impl Application for Busy {
    fn name(&self) -> &str {
        "Busy"
    }
    fn synopsis(&self) -> &str {
        "Indicate the Busy condition"
    }
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        indicate_and_wait(chan, ControlOp::Busy, args).await
    }
}

struct Congestion;

#[async_trait]
impl Application for Congestion {
    fn name(&self) -> &str {
        "Congestion"
    }
    fn synopsis(&self) -> &str {
        "Indicate the Congestion condition"
    }
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        indicate_and_wait(chan, ControlOp::Congestion, args).await
    }
}

struct Goto {
    engine: Weak<DialplanEngine>,
}

#[async_trait]
impl Application for Goto {
    fn name(&self) -> &str {
        "Goto"
    }
    fn synopsis(&self) -> &str {
        "Jump to a particular priority, extension, or context"
    }
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        let Some(engine) = self.engine.upgrade() else {
            return AppReturn::Failure;
        };
        let (context, exten, priority) = match args {
            [p] => (None, None, p.as_str()),
            [e, p] => (None, Some(e.as_str()), p.as_str()),
            [c, e, p, ..] => (Some(c.as_str()), Some(e.as_str()), p.as_str()),
            [] => {
                warn!("Goto requires an argument ([[context,]extension,]priority)");
                return AppReturn::Failure;
            }
        };
        match goto_parsed(&engine, chan, context, exten, priority, false) {
            Ok(()) => AppReturn::Ok,
            Err(_) => AppReturn::Failure,
        }
    }
}

struct GotoIf {
    engine: Weak<DialplanEngine>,
}

#[async_trait]
impl Application for GotoIf {
    fn name(&self) -> &str {
        "GotoIf"
    }
    fn synopsis(&self) -> &str {
        "Conditional goto"
    }
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        let Some(engine) = self.engine.upgrade() else {
            return AppReturn::Failure;
        };
        // The branches may themselves contain commas; reassemble the raw
        // argument before parsing cond?true:false.
        let raw = args.join(",");
        let Some((cond, branches)) = raw.split_once('?') else {
            warn!("GotoIf requires an argument (condition?label1[:label2])");
            return AppReturn::Failure;
        };
        let (when_true, when_false) = match branches.split_once(':') {
            Some((t, f)) => (t, Some(f)),
            None => (branches, None),
        };
        let target = if check_condition(cond) {
            Some(when_true)
        } else {
            when_false
        };
        let Some(target) = target.filter(|t| !t.is_empty()) else {
            return AppReturn::Ok;
        };
        let parts: Vec<&str> = target.split(',').collect();
        let (context, exten, priority) = match parts.as_slice() {
            [p] => (None, None, *p),
            [e, p] => (None, Some(*e), *p),
            [c, e, p, ..] => (Some(*c), Some(*e), *p),
            [] => return AppReturn::Ok,
        };
        match goto_parsed(&engine, chan, context, exten, priority, false) {
            Ok(()) => AppReturn::Ok,
            Err(_) => AppReturn::Failure,
        }
    }
}

/// Numbers are true when non-zero; non-empty strings are true.
fn check_condition(condition: &str) -> bool {
    let c = condition.trim();
    if c.is_empty() {
        return false;
    }
    match c.parse::<i64>() {
        Ok(n) => n != 0,
        Err(_) => true,
    }
}

struct Hangup;

#[async_trait]
impl Application for Hangup {
    fn name(&self) -> &str {
        "Hangup"
    }
    fn synopsis(&self) -> &str {
        "Unconditional hangup"
    }
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        if let Some(cause) = args.first().and_then(|a| a.parse().ok()) {
            chan.set_hangupcause(cause);
        }
        AppReturn::Failure
    }
}

struct NoOp;

#[async_trait]
impl Application for NoOp {
    fn name(&self) -> &str {
        "NoOp"
    }
    fn synopsis(&self) -> &str {
        "No operation"
    }
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        info!(chan = %chan.name(), "NoOp: {}", args.join(","));
        AppReturn::Ok
    }
}

struct Progress;

#[async_trait]
impl Application for Progress {
    fn name(&self) -> &str {
        "Progress"
    }
    fn synopsis(&self) -> &str {
        "Indicate progress"
    }
    async fn exec(&self, chan: &Arc<Channel>, _args: &[String]) -> AppReturn {
        match chan.indicate(ControlOp::Progress).await {
            Ok(()) => AppReturn::Ok,
            Err(_) => AppReturn::Failure,
        }
    }
}

struct Ringing;

#[async_trait]
impl Application for Ringing {
    fn name(&self) -> &str {
        "Ringing"
    }
    fn synopsis(&self) -> &str {
        "Indicate ringing tone"
    }
    async fn exec(&self, chan: &Arc<Channel>, _args: &[String]) -> AppReturn {
        match chan.indicate(ControlOp::Ringing).await {
            Ok(()) => AppReturn::Ok,
            Err(_) => AppReturn::Failure,
        }
    }
}

struct SetVar;

#[async_trait]
impl Application for SetVar {
    fn name(&self) -> &str {
        "Set"
    }
    fn synopsis(&self) -> &str {
        "Set channel variable(s)"
    }
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        if args.is_empty() {
            warn!("Set requires an argument (name=value)");
            return AppReturn::Failure;
        }
        for pair in args {
            match pair.split_once('=') {
                Some((name, value)) => chan.set_var(name.trim(), Some(value)),
                None => {
                    warn!(arg = %pair, "Set ignoring argument without '='");
                }
            }
        }
        AppReturn::Ok
    }
}

struct SetGlobalVar {
    engine: Weak<DialplanEngine>,
}

#[async_trait]
impl Application for SetGlobalVar {
    fn name(&self) -> &str {
        "SetGlobalVar"
    }
    fn synopsis(&self) -> &str {
        "Set a global variable"
    }
    async fn exec(&self, _chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        let Some(engine) = self.engine.upgrade() else {
            return AppReturn::Failure;
        };
        let Some(pair) = args.first() else {
            warn!("SetGlobalVar requires an argument (name=value)");
            return AppReturn::Failure;
        };
        match pair.split_once('=') {
            Some((name, value)) => {
                engine.set_global(name.trim(), Some(value));
                AppReturn::Ok
            }
            None => {
                warn!(arg = %pair, "SetGlobalVar requires name=value");
                AppReturn::Failure
            }
        }
    }
}

struct Wait;

#[async_trait]
impl Application for Wait {
    fn name(&self) -> &str {
        "Wait"
    }
    fn synopsis(&self) -> &str {
        "Wait for some time"
    }
    async fn exec(&self, chan: &Arc<Channel>, args: &[String]) -> AppReturn {
        let secs: f64 = args.first().and_then(|a| a.parse().ok()).unwrap_or(0.0);
        if secs > 0.0 {
            if chan.safe_sleep((secs * 1000.0) as u64).await.is_err() {
                return AppReturn::Failure;
            }
        }
        AppReturn::Ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn condition_truthiness() {
        assert!(check_condition("1"));
        assert!(check_condition("-5"));
        assert!(!check_condition("0"));
        assert!(!check_condition(""));
        assert!(check_condition("yes"));
    }
}
