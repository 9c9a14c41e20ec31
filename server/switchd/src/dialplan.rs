//! Dialplan description file.
//!
//! The daemon takes an already structured description (JSON); parsing an
//! extensions.conf lives in a front-end, not here. A malformed file keeps
//! the previous dialplan in force.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use serde::Deserialize;
use tracing::{info, warn};

use xb_pbx::{ContextSet, DialplanEngine, TimeSpec};

pub const REGISTRAR: &str = "pbx-config";

#[derive(Debug, Deserialize)]
pub struct DialplanFile {
    #[serde(default)]
    pub globals: Vec<GlobalDef>,
    pub contexts: Vec<ContextDef>,
}

#[derive(Debug, Deserialize)]
pub struct GlobalDef {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Deserialize)]
pub struct ContextDef {
    pub name: String,
    #[serde(default)]
    pub extensions: Vec<ExtensionDef>,
    #[serde(default)]
    pub includes: Vec<IncludeDef>,
    #[serde(default)]
    pub ignorepats: Vec<String>,
    #[serde(default)]
    pub switches: Vec<SwitchDef>,
}

#[derive(Debug, Deserialize)]
pub struct ExtensionDef {
    pub exten: String,
    pub priority: i32,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub cid: Option<String>,
    pub app: String,
    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Deserialize)]
pub struct IncludeDef {
    pub context: String,
    /// `times|dow|dom|month` gate.
    #[serde(default)]
    pub timing: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SwitchDef {
    pub name: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub eval: bool,
}

/// Load `path` and swap it in. On any error the running dialplan stays.
pub async fn load_into(engine: &Arc<DialplanEngine>, path: &Path) -> Result<()> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file: DialplanFile =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;

    let mut set = ContextSet::new();
    for def in &file.contexts {
        let ctx = set.context(&def.name, REGISTRAR);
        for e in &def.extensions {
            if let Err(err) = ctx.add_extension(
                true,
                &e.exten,
                e.priority,
                e.label.as_deref(),
                e.cid.as_deref(),
                &e.app,
                &e.data,
                REGISTRAR,
            ) {
                warn!(context = %def.name, exten = %e.exten, error = %err, "skipping extension");
            }
        }
        for inc in &def.includes {
            let timing = inc.timing.as_deref().map(TimeSpec::parse);
            if let Err(err) = ctx.add_include(&inc.context, timing, REGISTRAR) {
                warn!(context = %def.name, include = %inc.context, error = %err, "skipping include");
            }
        }
        for pat in &def.ignorepats {
            ctx.add_ignorepat(pat, REGISTRAR);
        }
        for sw in &def.switches {
            ctx.add_switch(&sw.name, &sw.data, sw.eval, REGISTRAR);
        }
    }

    for g in &file.globals {
        engine.set_global(&g.name, Some(&g.value));
    }
    let contexts = set.len();
    engine.merge_contexts_and_delete(set, REGISTRAR);
    info!(path = %path.display(), contexts, "dialplan loaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use xb_core::{Core, CoreOptions};
    use xb_pbx::EngineOptions;

    #[tokio::test]
    async fn loads_contexts_and_globals() {
        let core = Core::start(CoreOptions::default());
        let engine = DialplanEngine::new(&core, EngineOptions::default());

        let mut tmp = tempfile_path("xb-dialplan-ok");
        let json = r#"{
            "globals": [{"name": "RINGTIME", "value": "20"}],
            "contexts": [{
                "name": "default",
                "extensions": [
                    {"exten": "s", "priority": 1, "app": "NoOp", "data": "hello"},
                    {"exten": "s", "priority": 2, "app": "Hangup"}
                ],
                "includes": [{"context": "extra"}]
            }]
        }"#;
        write!(tmp.file, "{json}").unwrap();

        load_into(&engine, &tmp.path).await.unwrap();
        assert!(engine.context_find("default").is_some());
        assert_eq!(engine.get_global("RINGTIME").as_deref(), Some("20"));
        assert!(engine.exists_extension(None, "default", "s", 2, None));
    }

    #[tokio::test]
    async fn malformed_file_keeps_previous_dialplan() {
        let core = Core::start(CoreOptions::default());
        let engine = DialplanEngine::new(&core, EngineOptions::default());

        let mut good = tempfile_path("xb-dialplan-good");
        write!(
            good.file,
            r#"{{"contexts": [{{"name": "keepme", "extensions": [
                {{"exten": "s", "priority": 1, "app": "NoOp"}}]}}]}}"#
        )
        .unwrap();
        load_into(&engine, &good.path).await.unwrap();

        let mut bad = tempfile_path("xb-dialplan-bad");
        write!(bad.file, "{{not json").unwrap();
        assert!(load_into(&engine, &bad.path).await.is_err());
        assert!(
            engine.context_find("keepme").is_some(),
            "previous dialplan still in force"
        );
    }

    struct TempFile {
        path: std::path::PathBuf,
        file: std::fs::File,
    }

    impl Drop for TempFile {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn tempfile_path(stem: &str) -> TempFile {
        let path = std::env::temp_dir().join(format!("{stem}-{}.json", std::process::id()));
        let file = std::fs::File::create(&path).unwrap();
        TempFile { path, file }
    }
}
