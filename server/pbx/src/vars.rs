//! Variable retrieval.
//!
//! Lookup order for a channel: synthetic channel variables (dispatched by
//! the canonical hash, then name equality), the channel's own store,
//! builtin globals (EPOCH/DATETIME/TIMESTAMP), then the process-global
//! store. Synthetic names deliberately shadow user variables of the same
//! name. A `NAME:off[:len]` suffix slices the resolved value.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use chrono::Local;

use xb_core::Channel;
use xb_registry::{hash_str, Registry};
use xb_strings::slice_str;

use crate::engine::DialplanEngine;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Synthetic {
    CallerId,
    CallerIdNum,
    CallerIdName,
    CallerAni,
    CallingPres,
    CallingAni2,
    CallingTon,
    CallingTns,
    Dnid,
    Rdnis,
    Hint,
    HintName,
    Exten,
    Context,
    Priority,
    Channel,
    UniqueId,
    HangupCause,
    AccountCode,
    Language,
    SystemName,
}

const SYNTHETICS: &[(&str, Synthetic)] = &[
    ("CALLERID", Synthetic::CallerId),
    ("CALLERIDNUM", Synthetic::CallerIdNum),
    ("CALLERIDNAME", Synthetic::CallerIdName),
    ("CALLERANI", Synthetic::CallerAni),
    ("CALLINGPRES", Synthetic::CallingPres),
    ("CALLINGANI2", Synthetic::CallingAni2),
    ("CALLINGTON", Synthetic::CallingTon),
    ("CALLINGTNS", Synthetic::CallingTns),
    ("DNID", Synthetic::Dnid),
    ("RDNIS", Synthetic::Rdnis),
    ("HINT", Synthetic::Hint),
    ("HINTNAME", Synthetic::HintName),
    ("EXTEN", Synthetic::Exten),
    ("CONTEXT", Synthetic::Context),
    ("PRIORITY", Synthetic::Priority),
    ("CHANNEL", Synthetic::Channel),
    ("UNIQUEID", Synthetic::UniqueId),
    ("HANGUPCAUSE", Synthetic::HangupCause),
    ("ACCOUNTCODE", Synthetic::AccountCode),
    ("LANGUAGE", Synthetic::Language),
    ("SYSTEMNAME", Synthetic::SystemName),
];

fn synthetic_table() -> &'static HashMap<u32, (&'static str, Synthetic)> {
    static TABLE: OnceLock<HashMap<u32, (&'static str, Synthetic)>> = OnceLock::new();
    TABLE.get_or_init(|| {
        SYNTHETICS
            .iter()
            .map(|(name, s)| (hash_str(name), (*name, *s)))
            .collect()
    })
}

/// Resolve `varname` for `chan` (or `var_reg` when channel-less).
pub fn retrieve_variable(
    engine: &DialplanEngine,
    chan: Option<&Arc<Channel>>,
    var_reg: Option<&Registry<str>>,
    varname: &str,
) -> Option<String> {
    // Slicing modifier: resolve the base name, then cut.
    if let Some((base, spec)) = varname.split_once(':') {
        let value = retrieve_variable(engine, chan, var_reg, base)?;
        let (offset, length) = match spec.split_once(':') {
            Some((o, l)) => (
                o.trim().parse::<i64>().unwrap_or(0),
                Some(l.trim().parse::<i64>().unwrap_or(0)),
            ),
            None => (spec.trim().parse::<i64>().unwrap_or(0), None),
        };
        return Some(slice_str(&value, offset, length));
    }

    let hash = hash_str(varname);
    if let Some(chan) = chan {
        if let Some((name, synth)) = synthetic_table().get(&hash) {
            if *name == varname {
                return synthetic_value(engine, chan, *synth);
            }
        }
        if let Some(v) = chan.get_var(varname) {
            return Some(v.to_string());
        }
    } else if let Some(reg) = var_reg {
        if let Some(v) = reg.find(varname) {
            return Some(v.to_string());
        }
    }

    match varname {
        "EPOCH" => return Some(Local::now().timestamp().to_string()),
        "DATETIME" => {
            return Some(Local::now().format("%d%m%Y-%H:%M:%S").to_string());
        }
        "TIMESTAMP" => {
            return Some(Local::now().format("%Y%m%d-%H%M%S").to_string());
        }
        _ => {}
    }

    engine.get_global(varname).map(|v| v.to_string())
}

fn synthetic_value(
    engine: &DialplanEngine,
    chan: &Arc<Channel>,
    synth: Synthetic,
) -> Option<String> {
    let snap = chan.snapshot();
    match synth {
        Synthetic::CallerId => match (&snap.cid.name, &snap.cid.num) {
            (Some(name), Some(num)) => Some(format!("\"{name}\" <{num}>")),
            (Some(name), None) => Some(name.clone()),
            (None, Some(num)) => Some(num.clone()),
            (None, None) => None,
        },
        Synthetic::CallerIdNum => snap.cid.num.clone(),
        Synthetic::CallerIdName => snap.cid.name.clone(),
        Synthetic::CallerAni => snap.cid.ani.clone(),
        Synthetic::CallingPres => Some(snap.cid.pres.to_string()),
        Synthetic::CallingAni2 => Some(snap.cid.ani2.to_string()),
        Synthetic::CallingTon => Some(snap.cid.ton.to_string()),
        Synthetic::CallingTns => Some(snap.cid.tns.to_string()),
        Synthetic::Dnid => snap.cid.dnid.clone(),
        Synthetic::Rdnis => snap.cid.rdnis.clone(),
        Synthetic::Hint => engine.hints.get_hint(&snap.context, &snap.exten),
        Synthetic::HintName => engine
            .hints
            .get_hint(&snap.context, &snap.exten)
            .map(|devices| devices.split('&').next().unwrap_or("").trim().to_owned()),
        Synthetic::Exten => Some(snap.exten),
        Synthetic::Context => Some(snap.context),
        Synthetic::Priority => Some(snap.priority.to_string()),
        Synthetic::Channel => Some(snap.name),
        Synthetic::UniqueId => Some(chan.uniqueid().to_owned()),
        Synthetic::HangupCause => Some(snap.hangupcause.to_string()),
        Synthetic::AccountCode => Some(snap.accountcode),
        Synthetic::Language => Some(snap.language),
        Synthetic::SystemName => Some(engine.core().options.system_name.clone()),
    }
}
