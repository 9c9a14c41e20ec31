//! The per-channel dialplan interpreter.
//!
//! One task per call. The loop executes priorities while they exist, then
//! collects further digits under the response/digit timeouts, falling back
//! to the `i` (invalid), `t` (timeout), `T` (absolute timeout) and `h`
//! (hangup) special extensions as the original contract prescribes.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use xb_core::{softhangup, AppReturn, Channel, ChannelState};
use xb_frame::ControlOp;

use crate::engine::DialplanEngine;
use crate::error::{PbxError, PbxResult};

/// Reposition the dialplan cursor. Inside an interpreter loop the priority
/// compensates for the auto-increment.
pub fn explicit_goto(
    chan: &Arc<Channel>,
    context: Option<&str>,
    exten: Option<&str>,
    priority: Option<i32>,
) {
    let priority = priority.map(|p| if chan.in_autoloop() { p - 1 } else { p });
    chan.set_position(context, exten, priority);
}

/// Parse and apply a goto where `priority` may be absolute, `+n`/`-n`
/// relative, or a label.
pub fn goto_parsed(
    engine: &Arc<DialplanEngine>,
    chan: &Arc<Channel>,
    context: Option<&str>,
    exten: Option<&str>,
    priority: &str,
    async_goto: bool,
) -> PbxResult<()> {
    let cur = chan.snapshot();
    let context = match context {
        Some(c) if !c.is_empty() => c.to_owned(),
        _ => cur.context.clone(),
    };
    let exten = match exten {
        Some(e) if !e.is_empty() => e.to_owned(),
        _ => cur.exten.clone(),
    };

    let priority = priority.trim();
    let npriority = if let Some(rest) = priority.strip_prefix('+') {
        cur.priority + rest.parse::<i32>().unwrap_or(0)
    } else if let Some(rest) = priority.strip_prefix('-') {
        cur.priority - rest.parse::<i32>().unwrap_or(0)
    } else if priority.chars().all(|c| c.is_ascii_digit()) && !priority.is_empty() {
        priority.parse::<i32>().unwrap_or(1)
    } else {
        let cid = chan.caller_id().num;
        engine
            .find_label_extension(Some(chan), &context, &exten, priority, cid.as_deref())
            .ok_or_else(|| PbxError::NoLabel {
                context: context.clone(),
                exten: exten.clone(),
                label: priority.to_owned(),
            })?
    };

    if async_goto {
        async_goto_to(engine, chan, &context, &exten, npriority);
        Ok(())
    } else {
        explicit_goto(chan, Some(&context), Some(&exten), Some(npriority));
        Ok(())
    }
}

/// Reposition a channel from outside its interpreter. A channel currently
/// in the PBX observes the ASYNCGOTO soft-hangup bit at its next safe
/// point; one that is not gets a fresh interpreter started at the target.
pub fn async_goto_to(
    engine: &Arc<DialplanEngine>,
    chan: &Arc<Channel>,
    context: &str,
    exten: &str,
    priority: i32,
) {
    if chan.pbx_active() {
        explicit_goto(chan, Some(context), Some(exten), Some(priority));
        chan.softhangup(softhangup::ASYNCGOTO);
    } else {
        chan.set_position(Some(context), Some(exten), Some(priority));
        pbx_start(Arc::clone(engine), Arc::clone(chan));
    }
}

/// Spawn the interpreter task for one call.
pub fn pbx_start(engine: Arc<DialplanEngine>, chan: Arc<Channel>) -> JoinHandle<()> {
    tokio::spawn(async move {
        pbx_run(engine, chan).await;
    })
}

fn is_escape_digit(c: char) -> bool {
    c.is_ascii_digit() || ('A'..='F').contains(&c) || c == '*' || c == '#'
}

/// Run the dialplan for `chan` until the call unwinds.
pub async fn pbx_run(engine: Arc<DialplanEngine>, chan: Arc<Channel>) {
    let core = engine.core().clone();
    chan.set_pbx_active(true);
    let autoloop_was = chan.set_autoloop(true);

    let cdr = chan.ensure_cdr();
    let cid_owned = chan.caller_id().num;
    let cid = cid_owned.as_deref();

    // Start by trying whatever the channel is set to, then `s`, then
    // context `default`.
    {
        let snap = chan.snapshot();
        if !engine.exists_extension(Some(&chan), &snap.context, &snap.exten, snap.priority, cid) {
            debug!(
                chan = %chan.name(),
                context = %snap.context,
                exten = %snap.exten,
                "start point does not exist, falling back to 's'"
            );
            chan.set_position(None, Some("s"), None);
            if !engine.exists_extension(Some(&chan), &snap.context, "s", snap.priority, cid) {
                debug!(chan = %chan.name(), "still no match, falling back to context 'default'");
                chan.set_position(Some(&core.options.default_context), Some("s"), None);
            }
            chan.set_position(None, None, Some(1));
        }
    }
    if cdr.snapshot().start.is_none() {
        cdr.start();
    }

    let mut keepalive = false;

    'call: loop {
        let mut collected = String::new();
        let mut got_digit = false;

        // Execute the priority chain.
        loop {
            let snap = chan.snapshot();
            if !engine.exists_extension(Some(&chan), &snap.context, &snap.exten, snap.priority, cid)
            {
                break;
            }
            let res = engine
                .exec_extension(&chan, &snap.context, &snap.exten, snap.priority, cid)
                .await;
            match res {
                AppReturn::Ok => {}
                AppReturn::Digit(d) if is_escape_digit(d) => {
                    debug!(chan = %chan.name(), digit = %d, "digit escape from extension");
                    collected.clear();
                    collected.push(d);
                    got_digit = true;
                }
                AppReturn::Digit(_) => {}
                AppReturn::KeepAlive => {
                    debug!(
                        chan = %chan.name(),
                        context = %snap.context,
                        exten = %snap.exten,
                        "extension exited KEEPALIVE"
                    );
                    keepalive = true;
                    break 'call;
                }
                AppReturn::Failure => {
                    if chan.softhangup_bits() == softhangup::ASYNCGOTO {
                        chan.clear_softhangup(softhangup::ASYNCGOTO);
                    } else if chan.softhangup_bits() == softhangup::TIMEOUT {
                        // Fall through to the T handling below.
                    } else {
                        cdr.update(&chan.call_snapshot());
                        break 'call;
                    }
                }
            }
            if got_digit {
                break;
            }

            if chan.softhangup_bits() == softhangup::TIMEOUT
                && engine.exists_extension(Some(&chan), &chan.context(), "T", 1, cid)
            {
                chan.set_position(None, Some("T"), Some(0));
                // Reset the absolute timeout to avoid an infinite loop.
                chan.set_whentohangup(0);
                chan.clear_softhangup(softhangup::TIMEOUT);
            } else if chan.is_softhangup() {
                debug!(chan = %chan.name(), "returned normally even though call was hung up");
                break 'call;
            }
            chan.set_position(None, None, Some(chan.priority() + 1));
        }

        // Nothing left to execute at this position.
        let context = chan.context();
        if !engine.exists_extension(Some(&chan), &context, &chan.exten(), 1, cid) {
            // The current extension is not valid any more.
            if engine.exists_extension(Some(&chan), &context, "i", 1, cid) {
                info!(chan = %chan.name(), exten = %chan.exten(), "sent into invalid extension");
                chan.set_var("INVALID_EXTEN", Some(&chan.exten()));
                chan.set_position(None, Some("i"), Some(1));
            } else {
                warn!(
                    chan = %chan.name(),
                    exten = %chan.exten(),
                    context = %context,
                    "invalid extension, but no invalid handler"
                );
                break 'call;
            }
        } else if chan.softhangup_bits() == softhangup::TIMEOUT {
            // The T extension is next up.
            chan.clear_softhangup(softhangup::TIMEOUT);
        } else {
            let mut waittime_secs = 0u64;
            if got_digit {
                waittime_secs = engine
                    .digit_timeout_secs
                    .load(std::sync::atomic::Ordering::SeqCst);
            } else if !engine.autofallthrough() {
                waittime_secs = engine
                    .response_timeout_secs
                    .load(std::sync::atomic::Ordering::SeqCst);
            }

            if waittime_secs > 0 {
                // Keep reading digits until no extension could match.
                while engine.matchmore_extension(Some(&chan), &chan.context(), &collected, 1, cid)
                {
                    match chan.waitfor_digit(waittime_secs * 1000).await {
                        Err(_) => break 'call,
                        Ok(maybe) => {
                            if chan.softhangup_bits() == softhangup::ASYNCGOTO {
                                chan.clear_softhangup(softhangup::ASYNCGOTO);
                                continue;
                            }
                            match maybe {
                                None => break,
                                Some(d) => {
                                    collected.push(d);
                                    waittime_secs = engine
                                        .digit_timeout_secs
                                        .load(std::sync::atomic::Ordering::SeqCst);
                                }
                            }
                        }
                    }
                }
                if engine.exists_extension(Some(&chan), &chan.context(), &collected, 1, cid) {
                    chan.set_position(None, Some(&collected), Some(1));
                } else if !collected.is_empty() {
                    if engine.exists_extension(Some(&chan), &chan.context(), "i", 1, cid) {
                        info!(chan = %chan.name(), exten = %collected, "invalid extension");
                        chan.set_var("INVALID_EXTEN", Some(&collected));
                        chan.set_position(None, Some("i"), Some(1));
                    } else {
                        warn!(chan = %chan.name(), exten = %collected, "invalid extension and no 'i' rule");
                        break 'call;
                    }
                } else if engine.exists_extension(Some(&chan), &chan.context(), "t", 1, cid) {
                    debug!(chan = %chan.name(), "timeout, jumping to 't'");
                    chan.set_position(None, Some("t"), Some(1));
                } else {
                    warn!(chan = %chan.name(), context = %chan.context(), "timeout but no 't' rule");
                    break 'call;
                }
                cdr.update(&chan.call_snapshot());
            } else {
                // Autofallthrough: report call progress and stop.
                let status = chan.get_var("DIALSTATUS");
                debug!(
                    chan = %chan.name(),
                    status = status.as_deref().unwrap_or("UNKNOWN"),
                    "auto fallthrough"
                );
                if status.as_deref() == Some("BUSY") {
                    let _ = chan.indicate(ControlOp::Busy).await;
                } else {
                    let _ = chan.indicate(ControlOp::Congestion).await;
                }
                if chan.state() != ChannelState::Up {
                    chan.set_state(ChannelState::Busy);
                }
                let _ = chan
                    .safe_sleep(
                        engine
                            .congestion_sleep_ms
                            .load(std::sync::atomic::Ordering::SeqCst),
                    )
                    .await;
                break 'call;
            }
        }
    }

    // Hangup cleanup: run the h chain once unless KEEPALIVE asked us to
    // leave the channel up.
    if !keepalive {
        let context = chan.context();
        if engine.exists_extension(Some(&chan), &context, "h", 1, cid) {
            if core.options.end_cdr_before_h {
                cdr.end();
            }
            chan.set_position(None, Some("h"), Some(1));
            loop {
                let snap = chan.snapshot();
                if !engine.exists_extension(
                    Some(&chan),
                    &snap.context,
                    &snap.exten,
                    snap.priority,
                    cid,
                ) {
                    break;
                }
                let res = engine
                    .exec_extension(&chan, &snap.context, &snap.exten, snap.priority, cid)
                    .await;
                if res != AppReturn::Ok {
                    debug!(chan = %chan.name(), "h extension exited non-zero");
                    break;
                }
                chan.set_position(None, None, Some(chan.priority() + 1));
            }
        }
    }

    chan.set_autoloop(autoloop_was);
    chan.set_pbx_active(false);

    if !keepalive {
        if let Err(e) = chan.hangup().await {
            warn!(chan = %chan.name(), error = %e, "hangup failed");
        }
    }
}
