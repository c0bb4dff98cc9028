use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tycho::cancel::CancellationToken;
use tycho::fabric::Fabric;
use tycho::filter::{self, Check, FilterChain};
use tycho::model::{EntanglementKind, TaskSpec};
use tycho::poll::{PollResult, Poller};
use tycho::scheduler::{
    ChainFactory, ReviewVerdict, Reviewer, Scheduler, WorkerDispatcher, WorkerReport,
};
use tycho::snapshot::Snapshot;

struct AlwaysProceed;

impl Poller for AlwaysProceed {
    fn poll(&self, _task_id: &str, _snapshot: &Snapshot) -> PollResult {
        PollResult::proceed("gate open")
    }
}

struct CountingReviewer {
    seen: AtomicUsize,
}

impl Reviewer for CountingReviewer {
    fn review(&self, _task_id: &str, _report: &WorkerReport) -> ReviewVerdict {
        self.seen.fetch_add(1, Ordering::SeqCst);
        ReviewVerdict::Approved
    }
}

struct SourceWriter {
    workdir: PathBuf,
    inputs: std::sync::Mutex<Vec<String>>,
}

impl WorkerDispatcher for SourceWriter {
    fn run(&self, _task: &TaskSpec, input: &str, _token: &CancellationToken) -> WorkerReport {
        self.inputs.lock().unwrap().push(input.to_string());
        std::fs::write(
            self.workdir.join("api.rs"),
            "pub struct Api {}\n\npub fn serve() {}\n",
        )
        .unwrap();
        WorkerReport {
            output: "wrote api.rs".into(),
            modified_files: vec!["api.rs".into()],
            workdir: self.workdir.clone(),
        }
    }
}

#[test]
fn filter_bounce_skips_reviewer_then_publishes_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let fabric = Arc::new(Fabric::from_dir(dir.path()).unwrap());
    let workdir = dir.path().join("work");
    std::fs::create_dir_all(&workdir).unwrap();

    let dispatcher = Arc::new(SourceWriter {
        workdir,
        inputs: std::sync::Mutex::new(Vec::new()),
    });
    let reviewer = Arc::new(CountingReviewer {
        seen: AtomicUsize::new(0),
    });

    // The build check fails exactly once with a concrete compiler error.
    let remaining_failures = Arc::new(AtomicUsize::new(1));
    let chain: ChainFactory = {
        let remaining = Arc::clone(&remaining_failures);
        Box::new(move |_, _| {
            let remaining = Arc::clone(&remaining);
            FilterChain::new(vec![Check::new("build", move |_, _| {
                if remaining
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    ("undefined: Foo".into(), false)
                } else {
                    ("compiled".into(), true)
                }
            })])
        })
    };

    let mut task = TaskSpec::new("a", 0);
    task.body = "implement the api".into();

    let mut scheduler = Scheduler::builder(Arc::clone(&fabric), vec![task])
        .poller(AlwaysProceed)
        .dispatcher(Arc::clone(&dispatcher) as Arc<dyn WorkerDispatcher>)
        .reviewer(Arc::clone(&reviewer) as Arc<dyn Reviewer>)
        .chain_factory(chain)
        .tick(Duration::from_millis(10))
        .build()
        .unwrap();

    let report = scheduler.run_epoch().unwrap();
    assert_eq!(report.done, vec!["a"]);

    // Cycle one bounced: its failing output became cycle two's input and
    // the reviewer never saw it.
    let inputs = dispatcher.inputs.lock().unwrap().clone();
    assert_eq!(inputs.len(), 2);
    assert!(!inputs[0].contains("undefined: Foo"));
    assert!(inputs[1].contains("undefined: Foo"));
    assert_eq!(reviewer.seen.load(Ordering::SeqCst), 1);

    // The bounce left a failure note in working memory.
    let memory = fabric.memory_for("a").unwrap();
    assert!(
        memory
            .iter()
            .any(|m| m.kind == "failure" && m.content.contains("undefined: Foo"))
    );

    // The passing cycle published file and symbol artifacts.
    let ents = fabric.entanglements_for("a").unwrap();
    assert!(
        ents.iter()
            .any(|e| e.kind == EntanglementKind::File && e.name == "api.rs")
    );
    assert!(
        ents.iter()
            .any(|e| e.kind == EntanglementKind::Type && e.name == "Api")
    );
    assert!(
        ents.iter()
            .any(|e| e.kind == EntanglementKind::Function && e.name == "serve")
    );
    // Claims were released once the task finished.
    assert!(fabric.all_claims().unwrap().is_empty());
}

#[test]
fn claims_check_blocks_work_on_foreign_files() {
    let dir = tempfile::tempdir().unwrap();
    let fabric = Arc::new(Fabric::from_dir(dir.path()).unwrap());
    let workdir = dir.path().join("work");
    std::fs::create_dir_all(&workdir).unwrap();

    // Another task owns the file this worker insists on modifying.
    fabric.claim("api.rs", "other").unwrap();

    let dispatcher = Arc::new(SourceWriter {
        workdir,
        inputs: std::sync::Mutex::new(Vec::new()),
    });
    let reviewer = Arc::new(CountingReviewer {
        seen: AtomicUsize::new(0),
    });
    let chain: ChainFactory = {
        let fabric = Arc::clone(&fabric);
        Box::new(move |task_id: &str, modified: &[String]| {
            FilterChain::new(vec![filter::claims_check(
                Arc::clone(&fabric),
                task_id,
                modified,
            )])
        })
    };

    let mut scheduler = Scheduler::builder(Arc::clone(&fabric), vec![TaskSpec::new("a", 0)])
        .poller(AlwaysProceed)
        .dispatcher(Arc::clone(&dispatcher) as Arc<dyn WorkerDispatcher>)
        .reviewer(Arc::clone(&reviewer) as Arc<dyn Reviewer>)
        .chain_factory(chain)
        .max_cycles(2)
        .tick(Duration::from_millis(10))
        .build()
        .unwrap();

    let report = scheduler.run_epoch().unwrap();
    // The ownership violation never clears, so the cycle budget runs out.
    assert_eq!(report.failed, vec!["a"]);
    assert_eq!(reviewer.seen.load(Ordering::SeqCst), 0);

    // The violation text reached the worker as feedback.
    let inputs = dispatcher.inputs.lock().unwrap().clone();
    assert_eq!(inputs.len(), 2);
    assert!(inputs[1].contains("api.rs is owned by other"));

    // The foreign claim is untouched.
    assert_eq!(fabric.owner("api.rs").unwrap().as_deref(), Some("other"));
}
