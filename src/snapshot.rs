use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::fabric::Fabric;
use crate::model::{Discovery, Entanglement, MemoryEntry, TaskState};

/// Point-in-time read view over the fabric. Individual queries during
/// construction are independent; the snapshot guarantees per-row
/// correctness, not a cross-row transaction boundary. Immutable once built,
/// cheap to clone and share.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub entanglements: Vec<Entanglement>,
    pub claims: BTreeMap<String, String>,
    pub states: BTreeMap<String, TaskState>,
    pub completed: Vec<String>,
    pub in_progress: Vec<String>,
    pub blocked: Vec<String>,
    pub discoveries: Vec<Discovery>,
    pub memory: Vec<MemoryEntry>,
    pub cycles: BTreeMap<String, (u32, u32)>,
}

impl Snapshot {
    /// Build a snapshot from the fabric with an injected clock. Pass a
    /// pinned `now` in tests for deterministic rendering.
    pub fn from_fabric(fabric: &Fabric, now: DateTime<Utc>) -> Result<Self> {
        let states = fabric.all_states()?;
        let mut completed = Vec::new();
        let mut in_progress = Vec::new();
        let mut blocked = Vec::new();
        for (id, state) in &states {
            match state {
                TaskState::Done => completed.push(id.clone()),
                TaskState::Running | TaskState::Scanning => in_progress.push(id.clone()),
                TaskState::Blocked => blocked.push(id.clone()),
                _ => {}
            }
        }

        Ok(Self {
            taken_at: now,
            entanglements: fabric.all_entanglements()?,
            claims: fabric.all_claims()?,
            states,
            completed,
            in_progress,
            blocked,
            discoveries: fabric.unresolved_discoveries()?,
            memory: fabric.all_memory()?,
            cycles: BTreeMap::new(),
        })
    }

    /// Attach per-task phase cycle counters (current, max) for claim
    /// enrichment. Scheduler-owned data; the fabric does not store it.
    pub fn set_cycles(&mut self, cycles: BTreeMap<String, (u32, u32)>) {
        self.cycles = cycles;
    }

    /// Render the snapshot as text for human or LLM consumption.
    /// Deterministic for a fixed `taken_at`.
    pub fn render(&self) -> String {
        let mut out = String::new();

        let _ = writeln!(out, "=== Shared state snapshot ===");
        let _ = writeln!(
            out,
            "Tasks: {} completed, {} in progress, {} blocked | {} entanglements | {} claims | {} open discoveries",
            self.completed.len(),
            self.in_progress.len(),
            self.blocked.len(),
            self.entanglements.len(),
            self.claims.len(),
            self.discoveries.len(),
        );

        self.render_entanglements(&mut out);
        self.render_claims(&mut out);
        self.render_discoveries(&mut out);
        self.render_memory(&mut out);
        out
    }

    fn render_entanglements(&self, out: &mut String) {
        if self.entanglements.is_empty() {
            return;
        }
        let _ = writeln!(out, "\nPublished interfaces:");

        let mut by_package: BTreeMap<&str, Vec<&Entanglement>> = BTreeMap::new();
        for e in &self.entanglements {
            by_package.entry(e.package.as_str()).or_default().push(e);
        }
        for (package, group) in by_package {
            let mut producers: Vec<&str> = group
                .iter()
                .map(|e| e.producer_task_id.as_str())
                .collect();
            producers.sort();
            producers.dedup();

            let label = if package.is_empty() { "(none)" } else { package };
            let _ = writeln!(
                out,
                "  package {label} (producers: {}):",
                producers.join(", ")
            );
            for e in group {
                let _ = write!(out, "    - {} {} [{}]", e.kind, e.name, e.status);
                if !e.signature.is_empty() {
                    let _ = write!(out, " {}", e.signature);
                }
                let _ = writeln!(out);
            }
        }
    }

    fn render_claims(&self, out: &mut String) {
        if self.claims.is_empty() {
            return;
        }
        let _ = writeln!(out, "\nFile claims:");
        for (path, owner) in &self.claims {
            let _ = write!(out, "  - {path} -> {owner}");
            let state = self.states.get(owner);
            let cycle = self.cycles.get(owner);
            match (state, cycle) {
                (Some(state), Some((current, max))) => {
                    let _ = write!(out, " ({state}, cycle {current}/{max})");
                }
                (Some(state), None) => {
                    let _ = write!(out, " ({state})");
                }
                (None, Some((current, max))) => {
                    let _ = write!(out, " (cycle {current}/{max})");
                }
                (None, None) => {}
            }
            let _ = writeln!(out);
        }
    }

    fn render_discoveries(&self, out: &mut String) {
        if self.discoveries.is_empty() {
            return;
        }
        let _ = writeln!(out, "\nOpen discoveries:");
        for d in &self.discoveries {
            let scope = match &d.affected_task_id {
                Some(affected) => format!(" for {affected}"),
                None => String::new(),
            };
            let _ = writeln!(
                out,
                "  - #{} [{}] from {}{}: {} ({})",
                d.id,
                d.kind,
                d.source_task_id,
                scope,
                d.detail,
                relative_age(self.taken_at, d.created_at),
            );
        }
    }

    fn render_memory(&self, out: &mut String) {
        if self.memory.is_empty() {
            return;
        }
        let _ = writeln!(out, "\nWorking memory:");

        let mut by_kind: BTreeMap<&str, Vec<&MemoryEntry>> = BTreeMap::new();
        for entry in &self.memory {
            by_kind.entry(entry.kind.as_str()).or_default().push(entry);
        }
        for kind in memory_kind_order(by_kind.keys().copied()) {
            let Some(entries) = by_kind.get(kind.as_str()) else {
                continue;
            };
            let _ = writeln!(out, "  {kind}:");
            for entry in entries {
                let _ = writeln!(out, "    - [{}] {}", entry.task_id, entry.content);
            }
        }
    }
}

/// Canonical memory-kind ordering: decisions, failures, notes, reviewer
/// feedback, then any extra kinds alphabetically.
fn memory_kind_order<'a>(present: impl Iterator<Item = &'a str>) -> Vec<String> {
    const CANONICAL: [&str; 4] = ["decision", "failure", "note", "reviewer_feedback"];
    let mut extras: Vec<&str> = present
        .filter(|k| !CANONICAL.contains(k))
        .collect();
    extras.sort();
    CANONICAL
        .iter()
        .copied()
        .chain(extras)
        .map(str::to_string)
        .collect()
}

/// Relative-time label for discovery ages. Future timestamps clamp to
/// "just now".
pub fn relative_age(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let secs = now.signed_duration_since(then).num_seconds();
    if secs < 60 {
        "just now".to_string()
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else if secs < 86_400 {
        format!("{}h ago", secs / 3600)
    } else {
        format!("{}d ago", secs / 86_400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{
        DiscoveryKind, EntanglementKind, EntanglementStatus, MemoryKind,
    };
    use chrono::Duration;

    fn pinned_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn seeded_fabric() -> Fabric {
        let fabric = Fabric::open_memory().unwrap();
        fabric.set_state("a", TaskState::Done).unwrap();
        fabric.set_state("b", TaskState::Running).unwrap();
        fabric.set_state("c", TaskState::Blocked).unwrap();
        fabric.set_state("d", TaskState::Scanning).unwrap();
        fabric
            .publish(
                &Entanglement::new("a", EntanglementKind::Interface, "Store", "trait Store", "db")
                    .with_status(EntanglementStatus::Fulfilled),
            )
            .unwrap();
        fabric
            .publish(&Entanglement::new(
                "b",
                EntanglementKind::Function,
                "connect",
                "fn connect()",
                "db",
            ))
            .unwrap();
        fabric
            .publish(&Entanglement::new(
                "a",
                EntanglementKind::Type,
                "Config",
                "struct Config",
                "conf",
            ))
            .unwrap();
        fabric.claim("src/store.rs", "b").unwrap();
        fabric
            .post_discovery(&Discovery::new(
                "c",
                DiscoveryKind::MissingDependency,
                "needs the Store interface",
            ))
            .unwrap();
        fabric
            .add_memory(&MemoryEntry::new("b", MemoryKind::Decision, "wal journaling"))
            .unwrap();
        fabric
            .add_memory(&MemoryEntry::new("b", MemoryKind::Note, "touch store only"))
            .unwrap();
        fabric
    }

    // -----------------------------------------------------------------------
    // Bucketing
    // -----------------------------------------------------------------------

    #[test]
    fn buckets_split_by_state() {
        let fabric = seeded_fabric();
        let snapshot = Snapshot::from_fabric(&fabric, pinned_now()).unwrap();
        assert_eq!(snapshot.completed, vec!["a"]);
        assert_eq!(snapshot.in_progress, vec!["b", "d"]);
        assert_eq!(snapshot.blocked, vec!["c"]);
    }

    #[test]
    fn scanning_counts_as_in_progress() {
        let fabric = Fabric::open_memory().unwrap();
        fabric.set_state("x", TaskState::Scanning).unwrap();
        let snapshot = Snapshot::from_fabric(&fabric, pinned_now()).unwrap();
        assert_eq!(snapshot.in_progress, vec!["x"]);
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    #[test]
    fn render_is_deterministic_with_pinned_now() {
        let fabric = seeded_fabric();
        let mut first = Snapshot::from_fabric(&fabric, pinned_now()).unwrap();
        let mut second = Snapshot::from_fabric(&fabric, pinned_now()).unwrap();
        let cycles: BTreeMap<String, (u32, u32)> = [("b".to_string(), (1, 3))].into();
        first.set_cycles(cycles.clone());
        second.set_cycles(cycles);
        assert_eq!(first.render(), second.render());
    }

    #[test]
    fn render_header_counts_buckets() {
        let fabric = seeded_fabric();
        let text = Snapshot::from_fabric(&fabric, pinned_now()).unwrap().render();
        assert!(text.contains("1 completed, 2 in progress, 1 blocked"));
        assert!(text.contains("3 entanglements"));
        assert!(text.contains("1 claims"));
        assert!(text.contains("1 open discoveries"));
    }

    #[test]
    fn render_groups_entanglements_by_package() {
        let fabric = seeded_fabric();
        let text = Snapshot::from_fabric(&fabric, pinned_now()).unwrap().render();
        let conf = text.find("package conf (producers: a):").unwrap();
        let db = text.find("package db (producers: a, b):").unwrap();
        // BTreeMap grouping puts conf before db.
        assert!(conf < db);
        assert!(text.contains("- interface Store [fulfilled] trait Store"));
        assert!(text.contains("- function connect [pending] fn connect()"));
    }

    #[test]
    fn render_enriches_claims_with_state_and_cycle() {
        let fabric = seeded_fabric();
        let mut snapshot = Snapshot::from_fabric(&fabric, pinned_now()).unwrap();
        snapshot.set_cycles([("b".to_string(), (2, 3))].into());
        let text = snapshot.render();
        assert!(text.contains("- src/store.rs -> b (running, cycle 2/3)"));
    }

    #[test]
    fn render_claim_without_cycle_shows_state_only() {
        let fabric = seeded_fabric();
        let text = Snapshot::from_fabric(&fabric, pinned_now()).unwrap().render();
        assert!(text.contains("- src/store.rs -> b (running)"));
    }

    #[test]
    fn render_memory_in_canonical_order() {
        let fabric = seeded_fabric();
        fabric
            .add_memory(&MemoryEntry::new("b", MemoryKind::Failure, "test broke"))
            .unwrap();
        let text = Snapshot::from_fabric(&fabric, pinned_now()).unwrap().render();
        let decision = text.find("decision:").unwrap();
        let failure = text.find("failure:").unwrap();
        let note = text.find("note:").unwrap();
        assert!(decision < failure);
        assert!(failure < note);
    }

    #[test]
    fn render_extra_memory_kinds_come_last() {
        let fabric = seeded_fabric();
        fabric
            .add_memory(&MemoryEntry {
                task_id: "b".into(),
                kind: "aside".into(),
                content: "free-form".into(),
                created_at: Utc::now(),
            })
            .unwrap();
        let text = Snapshot::from_fabric(&fabric, pinned_now()).unwrap().render();
        let note = text.find("note:").unwrap();
        let aside = text.find("aside:").unwrap();
        assert!(note < aside);
    }

    // -----------------------------------------------------------------------
    // Relative ages
    // -----------------------------------------------------------------------

    #[test]
    fn relative_age_buckets() {
        let now = pinned_now();
        assert_eq!(relative_age(now, now - Duration::seconds(5)), "just now");
        assert_eq!(relative_age(now, now - Duration::seconds(59)), "just now");
        assert_eq!(relative_age(now, now - Duration::seconds(60)), "1m ago");
        assert_eq!(relative_age(now, now - Duration::minutes(59)), "59m ago");
        assert_eq!(relative_age(now, now - Duration::hours(2)), "2h ago");
        assert_eq!(relative_age(now, now - Duration::hours(23)), "23h ago");
        assert_eq!(relative_age(now, now - Duration::days(3)), "3d ago");
    }

    #[test]
    fn relative_age_clamps_future_timestamps() {
        let now = pinned_now();
        assert_eq!(relative_age(now, now + Duration::hours(5)), "just now");
    }

    #[test]
    fn discovery_age_appears_in_render() {
        let fabric = seeded_fabric();
        // Backdate the discovery by two minutes.
        fabric.with_conn(|conn| {
            conn.execute(
                "UPDATE discoveries SET created_at = ?1",
                [(pinned_now() - Duration::minutes(2)).to_rfc3339()],
            )
            .unwrap();
        });
        let text = Snapshot::from_fabric(&fabric, pinned_now()).unwrap().render();
        assert!(text.contains("(2m ago)"));
        assert!(text.contains("[missing_dependency] from c: needs the Store interface"));
    }
}
