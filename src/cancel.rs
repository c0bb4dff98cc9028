use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Cooperative cancellation flag. Cloning shares the same flags; `child`
/// derives a token that observes the parent's cancellation but cannot
/// cancel the parent. Checked between scheduler steps and inside filter
/// checks.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    // Ancestor flags first, own flag last. `cancel` sets only the own
    // flag; `is_cancelled` observes the whole chain.
    chain: Vec<Arc<AtomicBool>>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            chain: vec![Arc::new(AtomicBool::new(false))],
        }
    }

    /// Signal cancellation to this token and every derived child.
    pub fn cancel(&self) {
        self.chain
            .last()
            .expect("token always holds its own flag")
            .store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.chain.iter().any(|flag| flag.load(Ordering::SeqCst))
    }

    /// Derive a child token: cancelled when it or any ancestor is.
    pub fn child(&self) -> Self {
        let mut chain = self.chain.clone();
        chain.push(Arc::new(AtomicBool::new(false)));
        Self { chain }
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}
