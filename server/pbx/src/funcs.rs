//! Dialplan functions: `${NAME(args)}` callables.

use std::sync::Arc;

use tracing::warn;

use xb_core::{CallerId, Channel};
use xb_strings::DynStr;

use crate::engine::DialplanEngine;

pub trait DialplanFunction: Send + Sync {
    fn name(&self) -> &str;

    fn synopsis(&self) -> &str {
        ""
    }

    /// Evaluate into `out`.
    fn read(&self, chan: Option<&Arc<Channel>>, args: &str, out: &mut DynStr);

    /// Assign; functions that are read-only ignore writes.
    fn write(&self, chan: Option<&Arc<Channel>>, args: &str, value: &str) {
        let _ = (chan, args, value);
    }
}

pub(crate) fn register_builtins(engine: &Arc<DialplanEngine>) {
    engine.funcs.add("CALLERID", Arc::new(CallerIdFunc));
}

/// Gets or sets Caller*ID data on the channel: `CALLERID(all|name|num|ani|
/// dnid|rdnis)`.
struct CallerIdFunc;

impl DialplanFunction for CallerIdFunc {
    fn name(&self) -> &str {
        "CALLERID"
    }

    fn synopsis(&self) -> &str {
        "Gets or sets Caller*ID data on the channel"
    }

    fn read(&self, chan: Option<&Arc<Channel>>, args: &str, out: &mut DynStr) {
        let Some(chan) = chan else { return };
        let cid = chan.caller_id();
        let field = args.trim().to_ascii_lowercase();
        let value = match field.as_str() {
            "all" => Some(format!(
                "\"{}\" <{}>",
                cid.name.as_deref().unwrap_or(""),
                cid.num.as_deref().unwrap_or("")
            )),
            "name" => cid.name,
            "num" | "number" => cid.num,
            "ani" => cid.ani,
            "dnid" => cid.dnid,
            "rdnis" => cid.rdnis,
            _ => {
                warn!(field = %args, "unknown callerid data type");
                None
            }
        };
        if let Some(v) = value {
            out.append(&v);
        }
    }

    fn write(&self, chan: Option<&Arc<Channel>>, args: &str, value: &str) {
        let Some(chan) = chan else { return };
        let mut cid = chan.caller_id();
        let field = args.trim().to_ascii_lowercase();
        match field.as_str() {
            "all" => {
                let (name, num) = split_callerid(value);
                cid.name = name;
                cid.num = num.clone();
                cid.ani = num;
            }
            "name" => cid.name = non_empty(value),
            "num" | "number" => cid.num = non_empty(value),
            "ani" => cid.ani = non_empty(value),
            "dnid" => cid.dnid = non_empty(value),
            "rdnis" => cid.rdnis = non_empty(value),
            _ => {
                warn!(field = %args, "unknown callerid data type");
                return;
            }
        }
        set_callerid(chan, cid);
    }
}

fn set_callerid(chan: &Arc<Channel>, cid: CallerId) {
    chan.set_caller_id(cid);
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}

/// Split `"Name" <num>` (or `Name <num>`, or a bare number).
fn split_callerid(value: &str) -> (Option<String>, Option<String>) {
    let value = value.trim();
    if let (Some(lt), Some(gt)) = (value.rfind('<'), value.rfind('>')) {
        if lt < gt {
            let num = value[lt + 1..gt].trim();
            let name = value[..lt].trim().trim_matches('"').trim();
            return (non_empty(name), non_empty(num));
        }
    }
    if value.chars().all(|c| c.is_ascii_digit() || c == '+') {
        (None, non_empty(value))
    } else {
        (non_empty(value.trim_matches('"')), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callerid_split_variants() {
        assert_eq!(
            split_callerid("\"Alice\" <100>"),
            (Some("Alice".into()), Some("100".into()))
        );
        assert_eq!(split_callerid("100"), (None, Some("100".into())));
        assert_eq!(split_callerid("Alice"), (Some("Alice".into()), None));
    }
}
