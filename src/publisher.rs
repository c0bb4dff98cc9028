use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::fabric::Fabric;
use crate::model::{Entanglement, EntanglementKind, EntanglementStatus};
use crate::telemetry::{self, SharedSink, TelemetryEvent, TelemetryKind};

/// One exported symbol extracted from a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Symbol {
    pub name: String,
    pub kind: EntanglementKind,
    pub signature: String,
    pub package: String,
}

/// Source-parsing capability. Implementations extract the exported surface
/// of a file; they never execute user code.
pub trait SymbolParser: Send + Sync {
    fn exported_symbols(&self, path: &Path) -> Result<Vec<Symbol>>;
}

// ---------------------------------------------------------------------------
// Rust source scanner
// ---------------------------------------------------------------------------

/// Line-oriented scanner over `.rs` sources. Extracts `pub` items: structs,
/// enums, and type aliases as types, traits as interfaces, free functions,
/// and `pub fn` items inside `impl` blocks as methods. Trait-body items and
/// non-Rust files contribute nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustSymbolParser;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Block {
    None,
    Impl,
    Trait,
}

impl SymbolParser for RustSymbolParser {
    fn exported_symbols(&self, path: &Path) -> Result<Vec<Symbol>> {
        if path.extension().and_then(|e| e.to_str()) != Some("rs") {
            return Ok(vec![]);
        }
        let source = std::fs::read_to_string(path)?;
        Ok(scan_source(&source, &module_name(path)))
    }
}

/// Module name for the package qualifier: the file stem, or the parent
/// directory for `mod.rs` / `lib.rs`.
fn module_name(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    if matches!(stem, "mod" | "lib")
        && let Some(parent) = path.parent().and_then(|p| p.file_name()).and_then(|p| p.to_str())
    {
        return parent.to_string();
    }
    stem.to_string()
}

fn scan_source(source: &str, package: &str) -> Vec<Symbol> {
    let mut symbols = Vec::new();
    let mut depth: i32 = 0;
    let mut block = Block::None;

    for line in source.lines() {
        let trimmed = line.trim();

        if depth == 0 {
            if trimmed.starts_with("impl ") || trimmed == "impl" {
                block = Block::Impl;
            } else if trimmed.starts_with("pub trait ") || trimmed.starts_with("trait ") {
                block = Block::Trait;
                if let Some(symbol) = top_level_symbol(trimmed, package) {
                    symbols.push(symbol);
                }
            } else if let Some(symbol) = top_level_symbol(trimmed, package) {
                symbols.push(symbol);
            }
        } else if depth == 1
            && block == Block::Impl
            && let Some(name) = declared_name(trimmed, "pub fn ")
        {
            symbols.push(Symbol {
                name,
                kind: EntanglementKind::Method,
                signature: signature_of(trimmed),
                package: package.to_string(),
            });
        }

        for c in line.chars() {
            match c {
                '{' => depth += 1,
                '}' => depth -= 1,
                _ => {}
            }
        }
        if depth <= 0 {
            depth = 0;
            if !trimmed.is_empty() && trimmed.contains('}') {
                block = Block::None;
            }
        }
    }
    symbols
}

fn top_level_symbol(line: &str, package: &str) -> Option<Symbol> {
    let kinds: [(&str, EntanglementKind); 5] = [
        ("pub fn ", EntanglementKind::Function),
        ("pub struct ", EntanglementKind::Type),
        ("pub enum ", EntanglementKind::Type),
        ("pub trait ", EntanglementKind::Interface),
        ("pub type ", EntanglementKind::Type),
    ];
    for (prefix, kind) in kinds {
        if let Some(name) = declared_name(line, prefix) {
            return Some(Symbol {
                name,
                kind,
                signature: signature_of(line),
                package: package.to_string(),
            });
        }
    }
    None
}

/// Extract the identifier following a declaration prefix.
fn declared_name(line: &str, prefix: &str) -> Option<String> {
    let rest = line.strip_prefix(prefix)?;
    let name: String = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect();
    if name.is_empty() { None } else { Some(name) }
}

/// Best-effort textual signature: the declaration line without its body
/// opener or trailing punctuation.
fn signature_of(line: &str) -> String {
    line.trim()
        .trim_end_matches('{')
        .trim_end_matches(';')
        .trim()
        .to_string()
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Post-success artifact extraction: claims the modified files, then
/// publishes one file-level entanglement per path and one symbol-level
/// entanglement per exported symbol, in a single batch.
pub struct Publisher {
    fabric: Arc<Fabric>,
    parser: Arc<dyn SymbolParser>,
    telemetry: SharedSink,
}

impl Publisher {
    pub fn new(fabric: Arc<Fabric>, parser: Arc<dyn SymbolParser>, telemetry: SharedSink) -> Self {
        Self {
            fabric,
            parser,
            telemetry,
        }
    }

    /// Publish a completed task's artifacts. `modified` paths are relative
    /// to `workdir`. A file that fails to parse contributes only its
    /// file-level entanglement.
    pub fn publish(&self, task_id: &str, modified: &[String], workdir: &Path) -> Result<Vec<i64>> {
        let mut batch = Vec::new();

        for path in modified {
            self.fabric.claim(path, task_id)?;
            telemetry::emit(
                &self.telemetry,
                TelemetryEvent::new(TelemetryKind::ClaimAcquired)
                    .with_task(task_id)
                    .with_detail(path.clone()),
            );

            batch.push(
                Entanglement::new(task_id, EntanglementKind::File, path.clone(), "", "")
                    .with_file_path(path.clone())
                    .with_status(EntanglementStatus::Fulfilled),
            );

            match self.parser.exported_symbols(&workdir.join(path)) {
                Ok(symbols) => {
                    for symbol in symbols {
                        batch.push(
                            Entanglement::new(
                                task_id,
                                symbol.kind,
                                symbol.name,
                                symbol.signature,
                                symbol.package,
                            )
                            .with_file_path(path.clone())
                            .with_status(EntanglementStatus::Fulfilled),
                        );
                    }
                }
                Err(err) => {
                    telemetry::emit(
                        &self.telemetry,
                        TelemetryEvent::new(TelemetryKind::EntanglementPosted)
                            .with_task(task_id)
                            .with_detail(format!("{path}: parse skipped ({})", err.code())),
                    );
                }
            }
        }

        let ids = self.fabric.publish_batch(&batch)?;
        telemetry::emit(
            &self.telemetry,
            TelemetryEvent::new(TelemetryKind::EntanglementPosted)
                .with_task(task_id)
                .with_detail(format!("{} entanglement(s)", ids.len())),
        );
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::MemorySink;
    use tempfile::tempdir;

    // -----------------------------------------------------------------------
    // Source scanning
    // -----------------------------------------------------------------------

    const SAMPLE: &str = r#"
use std::collections::HashMap;

pub struct Store {
    items: HashMap<String, String>,
}

pub enum Mode {
    Fast,
    Safe,
}

pub trait Backend {
    fn get(&self, key: &str) -> Option<String>;
}

pub type Key = String;

pub fn open(path: &str) -> Store {
    Store { items: HashMap::new() }
}

fn private_helper() {}

impl Store {
    pub fn get(&self, key: &str) -> Option<&String> {
        self.items.get(key)
    }

    fn internal(&self) {}
}
"#;

    #[test]
    fn scan_extracts_exported_items() {
        let symbols = scan_source(SAMPLE, "store");
        let names: Vec<(&str, EntanglementKind)> = symbols
            .iter()
            .map(|s| (s.name.as_str(), s.kind))
            .collect();
        assert_eq!(
            names,
            vec![
                ("Store", EntanglementKind::Type),
                ("Mode", EntanglementKind::Type),
                ("Backend", EntanglementKind::Interface),
                ("Key", EntanglementKind::Type),
                ("open", EntanglementKind::Function),
                ("get", EntanglementKind::Method),
            ]
        );
    }

    #[test]
    fn scan_skips_private_and_trait_body_items() {
        let symbols = scan_source(SAMPLE, "store");
        assert!(symbols.iter().all(|s| s.name != "private_helper"));
        assert!(symbols.iter().all(|s| s.name != "internal"));
        // The trait's own `fn get` is part of the interface, not a symbol.
        let gets: Vec<&Symbol> = symbols.iter().filter(|s| s.name == "get").collect();
        assert_eq!(gets.len(), 1);
        assert_eq!(gets[0].kind, EntanglementKind::Method);
    }

    #[test]
    fn scan_signatures_strip_bodies() {
        let symbols = scan_source(SAMPLE, "store");
        let open = symbols.iter().find(|s| s.name == "open").unwrap();
        assert_eq!(open.signature, "pub fn open(path: &str) -> Store");
        let key = symbols.iter().find(|s| s.name == "Key").unwrap();
        assert_eq!(key.signature, "pub type Key = String");
    }

    #[test]
    fn module_name_uses_stem_or_parent() {
        assert_eq!(module_name(Path::new("src/store.rs")), "store");
        assert_eq!(module_name(Path::new("src/fabric/mod.rs")), "fabric");
        assert_eq!(module_name(Path::new("crates/core/src/lib.rs")), "src");
    }

    #[test]
    fn parser_ignores_non_rust_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("notes.md");
        std::fs::write(&path, "pub fn not_code() {}").unwrap();
        assert!(RustSymbolParser.exported_symbols(&path).unwrap().is_empty());
    }

    #[test]
    fn parser_errors_on_unreadable_file() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("gone.rs");
        assert!(RustSymbolParser.exported_symbols(&missing).is_err());
    }

    // -----------------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------------

    fn setup(workdir: &Path) -> (Arc<Fabric>, Publisher, Arc<MemorySink>) {
        std::fs::write(
            workdir.join("store.rs"),
            "pub struct Store {}\n\npub fn open() -> Store {\n    Store {}\n}\n",
        )
        .unwrap();
        std::fs::write(workdir.join("README.md"), "docs").unwrap();

        let fabric = Arc::new(Fabric::open_memory().unwrap());
        let sink = Arc::new(MemorySink::new());
        let publisher = Publisher::new(
            Arc::clone(&fabric),
            Arc::new(RustSymbolParser),
            Some(sink.clone()),
        );
        (fabric, publisher, sink)
    }

    #[test]
    fn publish_claims_and_batches_artifacts() {
        let dir = tempdir().unwrap();
        let (fabric, publisher, _) = setup(dir.path());

        let ids = publisher
            .publish(
                "t1",
                &["store.rs".to_string(), "README.md".to_string()],
                dir.path(),
            )
            .unwrap();

        // Two file-level plus two symbols from store.rs.
        assert_eq!(ids.len(), 4);
        assert_eq!(fabric.owner("store.rs").unwrap().as_deref(), Some("t1"));
        assert_eq!(fabric.owner("README.md").unwrap().as_deref(), Some("t1"));

        let all = fabric.all_entanglements().unwrap();
        let files: Vec<&Entanglement> = all
            .iter()
            .filter(|e| e.kind == EntanglementKind::File)
            .collect();
        assert_eq!(files.len(), 2);
        assert!(all.iter().all(|e| e.status == EntanglementStatus::Fulfilled));
        assert!(all.iter().any(|e| e.name == "Store" && e.kind == EntanglementKind::Type));
        assert!(all.iter().any(|e| e.name == "open" && e.kind == EntanglementKind::Function));
    }

    #[test]
    fn publish_is_idempotent_over_reruns() {
        let dir = tempdir().unwrap();
        let (fabric, publisher, _) = setup(dir.path());

        let first = publisher
            .publish("t1", &["store.rs".to_string()], dir.path())
            .unwrap();
        let second = publisher
            .publish("t1", &["store.rs".to_string()], dir.path())
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(fabric.all_entanglements().unwrap().len(), first.len());
    }

    #[test]
    fn unparseable_file_keeps_file_level_artifact() {
        let dir = tempdir().unwrap();
        let (fabric, publisher, _) = setup(dir.path());

        // Listed as modified but deleted before publish: the read fails,
        // the file-level entanglement still lands.
        let ids = publisher
            .publish("t1", &["ghost.rs".to_string()], dir.path())
            .unwrap();
        assert_eq!(ids.len(), 1);
        let all = fabric.all_entanglements().unwrap();
        assert_eq!(all[0].kind, EntanglementKind::File);
        assert_eq!(all[0].name, "ghost.rs");
    }

    #[test]
    fn publish_fails_on_foreign_claim() {
        let dir = tempdir().unwrap();
        let (fabric, publisher, _) = setup(dir.path());
        fabric.claim("store.rs", "other").unwrap();

        let err = publisher
            .publish("t1", &["store.rs".to_string()], dir.path())
            .unwrap_err();
        assert_eq!(err.code(), "already_claimed");
    }

    #[test]
    fn publish_emits_claim_and_entanglement_events() {
        let dir = tempdir().unwrap();
        let (_, publisher, sink) = setup(dir.path());

        publisher
            .publish("t1", &["store.rs".to_string()], dir.path())
            .unwrap();

        let kinds = sink.kinds();
        assert!(kinds.contains(&TelemetryKind::ClaimAcquired));
        assert!(kinds.contains(&TelemetryKind::EntanglementPosted));
    }
}
