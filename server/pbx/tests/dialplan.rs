//! Dialplan lookup, substitution and matching behavior.

use std::sync::Arc;

use xb_core::tech_null::NullTech;
use xb_core::{ChannelTech, Core, CoreOptions};
use xb_pbx::{substitute, ContextSet, DialplanEngine, EngineOptions};
use xb_strings::DynStr;

async fn setup() -> (Arc<Core>, Arc<NullTech>, Arc<DialplanEngine>) {
    let core = Core::start(CoreOptions::default());
    let tech = NullTech::new();
    core.techs
        .add("Null", Arc::clone(&tech) as Arc<dyn ChannelTech>);
    let engine = DialplanEngine::new(
        &core,
        EngineOptions {
            congestion_sleep_ms: 10,
            ..EngineOptions::default()
        },
    );
    (core, tech, engine)
}

fn subst_to_string(engine: &DialplanEngine, template: &str) -> String {
    let mut out = DynStr::with_limit(4096);
    substitute(engine, None, None, template, &mut out, 0);
    out.steal()
}

#[tokio::test]
async fn global_variable_roundtrip() {
    let (_core, _tech, engine) = setup().await;

    engine.set_global("FAVORITE", Some("blue"));
    assert_eq!(engine.get_global("FAVORITE").as_deref(), Some("blue"));

    engine.set_global("FAVORITE", None);
    assert!(engine.get_global("FAVORITE").is_none());
}

#[tokio::test]
async fn substitution_with_slicing() {
    let (_core, _tech, engine) = setup().await;
    engine.set_global("PREFIX", Some("+44"));
    engine.set_global("NUMBER", Some("01234567"));

    // Offset skips from the start, length bounds the take: 1:3 over
    // "01234567" keeps "123".
    assert_eq!(
        subst_to_string(&engine, "${PREFIX}${NUMBER:1:3}X"),
        "+44123X"
    );
    assert_eq!(subst_to_string(&engine, "${NUMBER:2:3}"), "234");
    assert_eq!(subst_to_string(&engine, "${NUMBER:-3}"), "567");
    assert_eq!(subst_to_string(&engine, "${MISSING}"), "");
    // A lone dollar is literal.
    assert_eq!(subst_to_string(&engine, "a$b"), "a$b");
}

#[tokio::test]
async fn substitution_of_expressions_and_nesting() {
    let (_core, _tech, engine) = setup().await;
    engine.set_global("N", Some("4"));
    engine.set_global("VAR4", Some("deep"));

    assert_eq!(subst_to_string(&engine, "$[2 + 2]"), "4");
    assert_eq!(subst_to_string(&engine, "$[${N} * 3]"), "12");
    assert_eq!(subst_to_string(&engine, "${VAR${N}}"), "deep");
}

#[tokio::test]
async fn pure_substitution_is_idempotent() {
    let (_core, _tech, engine) = setup().await;
    engine.set_global("A", Some("alpha"));
    engine.set_global("B", Some("beta-42"));

    let template = "x ${A} y ${B} z $[1 + 1]";
    let once = subst_to_string(&engine, template);
    let twice = subst_to_string(&engine, &once);
    assert_eq!(once, twice);
}

#[tokio::test]
async fn substitution_truncation_latches() {
    let (_core, _tech, engine) = setup().await;
    engine.set_global("WORD", Some("calling"));

    // Exactly fitting output succeeds.
    let mut exact = DynStr::with_limit(7);
    substitute(&engine, None, None, "${WORD}", &mut exact, 0);
    assert_eq!(exact.as_str(), "calling");
    assert!(!exact.error());

    // One byte short truncates and latches.
    let mut short = DynStr::with_limit(6);
    substitute(&engine, None, None, "${WORD}", &mut short, 0);
    assert_eq!(short.as_str(), "callin");
    assert!(short.error());
}

#[tokio::test]
async fn exact_match_beats_stretchable() {
    let (core, tech, engine) = setup().await;

    let mut set = ContextSet::new();
    let ctx = set.context("P", "test");
    ctx.add_extension(false, "_5XXX", 1, None, None, "Set", "WINNER=exact", "test")
        .unwrap();
    ctx.add_extension(false, "_5X.", 1, None, None, "Set", "WINNER=stretch", "test")
        .unwrap();
    engine.merge_contexts_and_delete(set, "test");

    // "5123" matches _5XXX exactly; exact beats stretchable.
    let chan = tech.new_channel(&core, "s3a").unwrap();
    engine.exec_extension(&chan, "P", "5123", 1, None).await;
    assert_eq!(chan.get_var("WINNER").as_deref(), Some("exact"));
    chan.hangup().await.unwrap();

    // "51234" only matches _5X. (stretchable).
    let chan = tech.new_channel(&core, "s3b").unwrap();
    engine.exec_extension(&chan, "P", "51234", 1, None).await;
    assert_eq!(chan.get_var("WINNER").as_deref(), Some("stretch"));
    chan.hangup().await.unwrap();
}

#[tokio::test]
async fn includes_resolve_depth_first_with_cycles_tolerated() {
    let (core, tech, engine) = setup().await;

    let mut set = ContextSet::new();
    let a = set.context("ctx-a", "test");
    a.add_include("ctx-b", None, "test").unwrap();
    let b = set.context("ctx-b", "test");
    // Cycle back to a; the walker's stack breaks the loop.
    b.add_include("ctx-a", None, "test").unwrap();
    b.add_extension(false, "42", 1, None, None, "Set", "HIT=b", "test")
        .unwrap();
    engine.merge_contexts_and_delete(set, "test");

    assert!(engine.exists_extension(None, "ctx-a", "42", 1, None));

    let chan = tech.new_channel(&core, "inc").unwrap();
    engine.exec_extension(&chan, "ctx-a", "42", 1, None).await;
    assert_eq!(chan.get_var("HIT").as_deref(), Some("b"));
    chan.hangup().await.unwrap();
}

#[tokio::test]
async fn caller_id_extensions_beat_plain_only_with_matching_cid() {
    let (core, tech, engine) = setup().await;

    let mut set = ContextSet::new();
    let ctx = set.context("cid", "test");
    ctx.add_extension(false, "100", 1, None, None, "Set", "WHO=any", "test")
        .unwrap();
    ctx.add_extension(false, "100", 1, None, Some("555"), "Set", "WHO=vip", "test")
        .unwrap();
    engine.merge_contexts_and_delete(set, "test");

    // With a non-matching caller id only the plain entry is considered.
    let chan = tech.new_channel(&core, "cid1").unwrap();
    engine.exec_extension(&chan, "cid", "100", 1, Some("123")).await;
    assert_eq!(chan.get_var("WHO").as_deref(), Some("any"));
    chan.hangup().await.unwrap();
}

#[tokio::test]
async fn merge_replaces_prior_registrar_contexts() {
    let (_core, _tech, engine) = setup().await;

    let mut first = ContextSet::new();
    first
        .context("old-ctx", "pbx-config")
        .add_extension(false, "1", 1, None, None, "NoOp", "", "pbx-config")
        .unwrap();
    engine.merge_contexts_and_delete(first, "pbx-config");
    assert!(engine.context_find("old-ctx").is_some());

    let mut second = ContextSet::new();
    second
        .context("new-ctx", "pbx-config")
        .add_extension(false, "2", 1, None, None, "NoOp", "", "pbx-config")
        .unwrap();
    engine.merge_contexts_and_delete(second, "pbx-config");

    assert!(engine.context_find("old-ctx").is_none(), "old registrar contexts gone");
    assert!(engine.context_find("new-ctx").is_some());
}

#[tokio::test]
async fn canmatch_and_matchmore_distinguish_prefixes() {
    let (_core, _tech, engine) = setup().await;

    let mut set = ContextSet::new();
    let ctx = set.context("digits", "test");
    ctx.add_extension(false, "12345", 1, None, None, "NoOp", "", "test")
        .unwrap();
    engine.merge_contexts_and_delete(set, "test");

    assert!(!engine.exists_extension(None, "digits", "123", 1, None));
    assert!(engine.canmatch_extension(None, "digits", "123", 1, None));
    assert!(engine.matchmore_extension(None, "digits", "123", 1, None));
    assert!(engine.exists_extension(None, "digits", "12345", 1, None));
    assert!(!engine.matchmore_extension(None, "digits", "12345", 1, None));
}

#[tokio::test]
async fn labels_resolve_to_priorities() {
    let (_core, _tech, engine) = setup().await;

    let mut set = ContextSet::new();
    let ctx = set.context("lbl", "test");
    ctx.add_extension(false, "s", 1, None, None, "NoOp", "", "test")
        .unwrap();
    ctx.add_extension(false, "s", 5, Some("restart"), None, "NoOp", "", "test")
        .unwrap();
    engine.merge_contexts_and_delete(set, "test");

    assert_eq!(
        engine.find_label_extension(None, "lbl", "s", "restart", None),
        Some(5)
    );
    assert_eq!(engine.find_label_extension(None, "lbl", "s", "nope", None), None);
}

#[tokio::test]
async fn dialplan_rendering_counts() {
    let (_core, _tech, engine) = setup().await;

    let mut set = ContextSet::new();
    let ctx = set.context("render", "test");
    ctx.add_extension(false, "s", 1, None, None, "NoOp", "hello", "test")
        .unwrap();
    ctx.add_extension(false, "s", 2, None, None, "Hangup", "", "test")
        .unwrap();
    engine.merge_contexts_and_delete(set, "test");

    let mut out = DynStr::new();
    engine.render_dialplan(&mut out, Some("render"), None);
    let text = out.steal();
    assert!(text.contains("[ Context 'render' created by 'test' ]"));
    assert!(text.contains("NoOp(hello)"));
    assert!(text.contains("-= 1 extensions (1 contexts) =-"));
}
