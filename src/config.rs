use crate::raw::INITIAL_CAPACITY;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static NCPU_INITIALIZER: Once = Once::new();
static NCPU: AtomicUsize = AtomicUsize::new(0);

fn num_cpus() -> usize {
    NCPU_INITIALIZER.call_once(|| NCPU.store(num_cpus::get(), Ordering::Relaxed));
    NCPU.load(Ordering::Relaxed)
}

/// Number of exponential busy-spin rounds used on multi-core machines before yielding.
const DEFAULT_SPIN_LIMIT: u32 = 6;

/// How a thread waits for another thread to finish a step it depends on.
///
/// The store spins in a few places: while a deleted neighbour is being unlinked, while an
/// appended entry is being published, and while a layout change waits for in-flight writes to
/// drain. Those waits are short in practice but have no upper bound: a writer that is descheduled
/// in the middle of a write holds up the layout change that waits for it. Waiting threads first
/// busy-spin with an exponentially growing number of [`std::hint::spin_loop`] hints for
/// `spin_limit` rounds, and then yield their time slice on every further round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpinPolicy {
    spin_limit: u32,
}

impl SpinPolicy {
    /// Busy-spin for `spin_limit` rounds before yielding. Values above 16 are clamped.
    pub fn new(spin_limit: u32) -> Self {
        Self {
            spin_limit: spin_limit.min(16),
        }
    }

    /// Yield on every round without busy-spinning.
    pub fn yielding() -> Self {
        Self { spin_limit: 0 }
    }

    /// The number of busy-spin rounds before yielding.
    pub fn spin_limit(&self) -> u32 {
        self.spin_limit
    }

    pub(crate) fn spinner(&self) -> Spinner {
        Spinner {
            step: 0,
            limit: self.spin_limit,
        }
    }
}

impl Default for SpinPolicy {
    /// Spinning is pointless when the thread we wait for cannot run at the same time.
    fn default() -> Self {
        if num_cpus() > 1 {
            Self::new(DEFAULT_SPIN_LIMIT)
        } else {
            Self::yielding()
        }
    }
}

/// The state of one wait loop.
#[derive(Debug)]
pub(crate) struct Spinner {
    step: u32,
    limit: u32,
}

impl Spinner {
    pub(crate) fn spin(&mut self) {
        if self.step < self.limit {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
            self.step += 1;
        } else {
            std::thread::yield_now();
        }
    }
}

/// A hook invoked between the entries of a long traversal.
///
/// Hosts use it to reach a safepoint or to honour an interrupt. It must be cheap and may be called
/// arbitrarily often.
pub type Checkpoint = Arc<dyn Fn() + Send + Sync>;

/// Construction-time settings for a [`HashStore`](crate::HashStore).
///
/// ```
/// use seqhash::{Config, HashStore, SpinPolicy};
///
/// let config = Config::new()
///     .initial_capacity(64)
///     .spin_policy(SpinPolicy::yielding());
/// let store: HashStore<u32, u32> = HashStore::with_config(config);
/// assert_eq!(store.capacity(), 128);
/// ```
#[derive(Clone)]
pub struct Config {
    pub(crate) initial_capacity: usize,
    pub(crate) spin: SpinPolicy,
    pub(crate) checkpoint: Option<Checkpoint>,
}

impl Config {
    /// The default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the first bucket array so that `entries` entries fit without growing.
    pub fn initial_capacity(mut self, entries: usize) -> Self {
        self.initial_capacity = entries;
        self
    }

    /// Use `spin` for every wait loop of the store and of its layout lock.
    pub fn spin_policy(mut self, spin: SpinPolicy) -> Self {
        self.spin = spin;
        self
    }

    /// Invoke `checkpoint` after every entry an ordered traversal visits.
    pub fn checkpoint<F>(mut self, checkpoint: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.checkpoint = Some(Arc::new(checkpoint));
        self
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            initial_capacity: INITIAL_CAPACITY * 3 / 4,
            spin: SpinPolicy::default(),
            checkpoint: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("initial_capacity", &self.initial_capacity)
            .field("spin", &self.spin)
            .field("checkpoint", &self.checkpoint.is_some())
            .finish()
    }
}
