//! `${...}` / `$[...]` substitution.
//!
//! The template is copied into the output accumulator; variable references,
//! function calls (with optional `:off:len` slices) and expressions are
//! resolved in place. Nested tokens substitute inner-first, bounded by
//! [`crate::MAX_SUBST_DEPTH`].

use std::sync::Arc;

use tracing::warn;

use xb_core::Channel;
use xb_registry::Registry;
use xb_strings::{slice_str, DynStr};

use crate::engine::DialplanEngine;
use crate::expr::eval_expr;
use crate::vars::retrieve_variable;
use crate::MAX_SUBST_DEPTH;

/// Substitute `template` into `out`. Truncation latches on `out`; check it
/// once after composing.
pub fn substitute(
    engine: &DialplanEngine,
    chan: Option<&Arc<Channel>>,
    var_reg: Option<&Registry<str>>,
    template: &str,
    out: &mut DynStr,
    depth: usize,
) {
    if depth > MAX_SUBST_DEPTH {
        warn!("substitution depth limit reached");
        return;
    }

    let bytes = template.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let Some(dollar) = template[i..].find('$').map(|p| p + i) else {
            out.append(&template[i..]);
            break;
        };
        let next = bytes.get(dollar + 1).copied();
        match next {
            Some(b'{') => {
                out.append(&template[i..dollar]);
                let Some((inner, after)) = delimited(template, dollar + 2, b'{', b'}') else {
                    warn!("error in extension logic (missing '}}')");
                    out.append(&template[dollar..]);
                    break;
                };
                expand_variable(engine, chan, var_reg, inner, out, depth);
                i = after;
            }
            Some(b'[') => {
                out.append(&template[i..dollar]);
                let Some((inner, after)) = delimited(template, dollar + 2, b'[', b']') else {
                    warn!("error in extension logic (missing ']')");
                    out.append(&template[dollar..]);
                    break;
                };
                let expanded = resubstitute_if_needed(engine, chan, var_reg, inner, depth);
                out.append(&eval_expr(&expanded));
                i = after;
            }
            _ => {
                // Lone '$' is literal.
                out.append(&template[i..=dollar]);
                i = dollar + 1;
            }
        }
    }
}

/// Find the matching close delimiter for the token opened just before
/// `start`, honoring nesting of both `${}` and `$[]`. Returns the inner
/// text and the index after the closer.
fn delimited(s: &str, start: usize, open: u8, close: u8) -> Option<(&str, usize)> {
    let bytes = s.as_bytes();
    let mut depth = 1i32;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        if b == open {
            depth += 1;
        } else if b == close {
            depth -= 1;
            if depth == 0 {
                return Some((&s[start..i], i + 1));
            }
        }
        i += 1;
    }
    None
}

fn resubstitute_if_needed(
    engine: &DialplanEngine,
    chan: Option<&Arc<Channel>>,
    var_reg: Option<&Registry<str>>,
    inner: &str,
    depth: usize,
) -> String {
    if inner.contains("${") || inner.contains("$[") {
        let mut ds = DynStr::with_limit(4096);
        substitute(engine, chan, var_reg, inner, &mut ds, depth + 1);
        ds.steal()
    } else {
        inner.to_owned()
    }
}

/// Expand one `${...}` body: plain variable, sliced variable, or function
/// call with optional result slice.
fn expand_variable(
    engine: &DialplanEngine,
    chan: Option<&Arc<Channel>>,
    var_reg: Option<&Registry<str>>,
    body: &str,
    out: &mut DynStr,
    depth: usize,
) {
    let body = resubstitute_if_needed(engine, chan, var_reg, body, depth);

    // Function call: NAME(ARGS) with an optional :off[:len] after the
    // closing paren.
    if let Some(open) = body.find('(') {
        if let Some(close) = body.rfind(')') {
            if close > open {
                let name = &body[..open];
                let args = &body[open + 1..close];
                let slice_spec = body[close + 1..].strip_prefix(':');

                let Some(func) = engine.funcs.find(name) else {
                    warn!(function = %name, "no such dialplan function");
                    return;
                };
                let mut result = DynStr::with_limit(4096);
                func.read(chan, args, &mut result);
                let result = result.steal();

                match slice_spec {
                    Some(spec) => {
                        let (offset, length) = parse_slice(spec);
                        out.append(&slice_str(&result, offset, length));
                    }
                    None => out.append(&result),
                }
                return;
            }
        }
    }

    if let Some(value) = retrieve_variable(engine, chan, var_reg, &body) {
        out.append(&value);
    }
}

fn parse_slice(spec: &str) -> (i64, Option<i64>) {
    match spec.split_once(':') {
        Some((o, l)) => (
            o.trim().parse().unwrap_or(0),
            Some(l.trim().parse().unwrap_or(0)),
        ),
        None => (spec.trim().parse().unwrap_or(0), None),
    }
}
