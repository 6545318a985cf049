//! Provider abstractions for time, task spawning and randomness.
//!
//! Every component is generic over a [`Providers`] bundle instead of calling
//! tokio directly, so the wiring code reads the same whichever runtime hosts
//! it:
//!
//! ```text
//! struct PersistentPort<P: Providers>
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use ctxbridge::{Providers, TokioProviders};
//!
//! let providers = TokioProviders::new();
//! let stamp = providers.time().unix_millis();
//! ```

use async_trait::async_trait;
use rand::distr::{Alphanumeric, Distribution, StandardUniform, uniform::SampleUniform};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::future::Future;
use std::ops::Range;
use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::Instrument;

/// Provider trait for time operations.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Elapsed time since the provider was created.
    fn now(&self) -> Duration;

    /// Wall-clock milliseconds since the Unix epoch, used for envelope timestamps.
    fn unix_millis(&self) -> u64;
}

/// Provider for spawning local tasks on the current thread.
pub trait TaskProvider: Clone {
    /// Spawn a named task that runs on the current thread.
    ///
    /// Must be called from within a `LocalSet`.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;
}

/// Provider trait for random number generation.
///
/// Identifiers (hop ids, transaction ids, stream ids, fingerprints) are drawn
/// from here, so a seeded provider makes them reproducible.
pub trait RandomProvider: Clone {
    /// Generate a random value of type T.
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>;

    /// Generate a random value within `range`, exclusive of the upper bound.
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd;

    /// Random alphanumeric identifier of `len` characters.
    fn random_id(&self, len: usize) -> String;
}

/// Bundle of provider types for a runtime environment.
pub trait Providers: Clone + 'static {
    /// Time provider type for sleeps and timestamps.
    type Time: TimeProvider + Clone + 'static;

    /// Task provider type for spawning local tasks.
    type Task: TaskProvider + Clone + 'static;

    /// Random provider type for identifiers.
    type Random: RandomProvider + Clone + 'static;

    /// Get the time provider instance.
    fn time(&self) -> &Self::Time;

    /// Get the task provider instance.
    fn task(&self) -> &Self::Task;

    /// Get the random provider instance.
    fn random(&self) -> &Self::Random;
}

/// Real time provider using Tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    start_time: tokio::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn unix_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// Task provider backed by `tokio::task::spawn_local`.
#[derive(Debug, Clone, Default)]
pub struct TokioTaskProvider;

impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        let span = tracing::debug_span!("task", task = %name);
        tokio::task::spawn_local(future.instrument(span))
    }
}

/// Random provider over a standard RNG shared by its clones.
///
/// [`TokioRandomProvider::new`] seeds from the operating system;
/// [`TokioRandomProvider::seeded`] replays the same sequence for a given seed.
#[derive(Debug, Clone)]
pub struct TokioRandomProvider {
    rng: Rc<RefCell<StdRng>>,
}

impl TokioRandomProvider {
    /// Create a provider seeded from the operating system.
    pub fn new() -> Self {
        Self {
            rng: Rc::new(RefCell::new(StdRng::from_os_rng())),
        }
    }

    /// Create a deterministic provider.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Rc::new(RefCell::new(StdRng::seed_from_u64(seed))),
        }
    }
}

impl Default for TokioRandomProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomProvider for TokioRandomProvider {
    fn random<T>(&self) -> T
    where
        StandardUniform: Distribution<T>,
    {
        self.rng.borrow_mut().random()
    }

    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd,
    {
        self.rng.borrow_mut().random_range(range)
    }

    fn random_id(&self, len: usize) -> String {
        let mut rng = self.rng.borrow_mut();
        (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
    }
}

/// Production providers using the Tokio runtime.
#[derive(Debug, Clone, Default)]
pub struct TokioProviders {
    time: TokioTimeProvider,
    task: TokioTaskProvider,
    random: TokioRandomProvider,
}

impl TokioProviders {
    /// Create a new production provider bundle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider bundle whose identifiers replay for the same `seed`.
    pub fn seeded(seed: u64) -> Self {
        Self {
            random: TokioRandomProvider::seeded(seed),
            ..Self::default()
        }
    }
}

impl Providers for TokioProviders {
    type Time = TokioTimeProvider;
    type Task = TokioTaskProvider;
    type Random = TokioRandomProvider;

    fn time(&self) -> &Self::Time {
        &self.time
    }

    fn task(&self) -> &Self::Task {
        &self.task
    }

    fn random(&self) -> &Self::Random {
        &self.random
    }
}
