//! Single-flight shared resource with background refresh.
//!
//! [`SharingProvider`] owns one expensive resource (for the connector: a
//! channel plus negotiated capabilities) and hands clones of it to any number
//! of concurrent callers.
//!
//! # States
//!
//! ```text
//!            current()                  factory ok
//!   Empty ─────────────► Creating ───────────────────► Ready
//!     ▲                     │  ▲                        │
//!     │      factory err    │  │ current() / tick       │ reset(input)
//!     └─────────────────────┘  └──────── Invalidated ◄──┘
//! ```
//!
//! - **Reads**: a `Ready` value is served from an [`ArcSwapOption`] without taking the state lock.
//! - **Single flight**: at most one creation runs at a time. Every caller arriving while it runs
//!   awaits the same [`Shared`] future, and the creation itself runs on a spawned task, so
//!   dropping a caller never aborts it.
//! - **Last reset wins**: [`reset`](SharingProvider::reset) records the new input and bumps a
//!   generation counter. A creation that finishes for an older generation is discarded and the
//!   factory re-runs with the newest input before any waiter is released.
//! - **Background refresh**: every period, a `Ready` resource is re-created with the refresh input
//!   while readers keep using the current one.

use std::{
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::{Mutex, RwLock};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ConnectError, ConnectionSnafu, Result};

/// Produces a fresh resource for an input.
///
/// Implemented for any `Fn(I) -> BoxFuture<'static, Result<O>>` closure.
pub trait ResourceFactory<I, O>: Send + Sync + 'static {
    /// Starts creating a resource for `input`.
    fn create(&self, input: I) -> BoxFuture<'static, Result<O>>;
}

impl<I, O, F> ResourceFactory<I, O> for F
where
    F: Fn(I) -> BoxFuture<'static, Result<O>> + Send + Sync + 'static,
{
    fn create(&self, input: I) -> BoxFuture<'static, Result<O>> {
        self(input)
    }
}

/// Callback invoked after each successful resource replacement.
///
/// The hook runs on the creation task after the new resource is published and
/// before the callers waiting on that creation are released, so it must return
/// quickly. Readers arriving after publication already see the new resource.
pub type RefreshHook<O> = Arc<dyn Fn(&O) + Send + Sync>;

/// Observable lifecycle state of a [`SharingProvider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderState {
    /// No resource and nothing running.
    Empty,
    /// No usable resource; a creation is running.
    Creating,
    /// A resource is available. A background refresh may be running.
    Ready,
    /// A reset discarded the resource; the next access or tick re-creates it.
    Invalidated,
    /// The provider has been disposed.
    Disposed,
}

type Creation<O> = Shared<BoxFuture<'static, Result<Arc<O>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Empty,
    Ready,
    Invalidated,
}

struct State<I, O> {
    phase: Phase,
    input: I,
    generation: u64,
    inflight: Option<Creation<O>>,
    refreshed_at: Option<Instant>,
    disposed: bool,
}

struct Inner<I, O> {
    /// Written only while `state` is locked.
    ready: ArcSwapOption<O>,
    state: Mutex<State<I, O>>,
    factory: Box<dyn ResourceFactory<I, O>>,
    refresh_input: I,
    on_refresh: RwLock<Option<RefreshHook<O>>>,
    shutdown: CancellationToken,
    creations: AtomicU64,
    refresh_running: AtomicBool,
}

enum Access<O> {
    Ready(Arc<O>),
    Pending(Creation<O>),
}

/// Shares one lazily created resource between concurrent callers.
///
/// Cloning is cheap; all clones share state, the in-flight creation, and the
/// background refresh task.
pub struct SharingProvider<I, O> {
    inner: Arc<Inner<I, O>>,
}

impl<I, O> Clone for SharingProvider<I, O> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<I, O> SharingProvider<I, O>
where
    I: Clone + fmt::Display + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Creates an empty provider.
    ///
    /// - `initial_input`: passed to the factory on first access
    /// - `refresh_input`: passed on background refresh and on the first access after a failure
    #[must_use]
    pub fn new<F>(factory: F, initial_input: I, refresh_input: I) -> Self
    where
        F: ResourceFactory<I, O>,
    {
        Self::with_refresh_hook(factory, initial_input, refresh_input, None)
    }

    /// Creates an empty provider that calls `on_refresh` after every replacement.
    ///
    /// A panicking hook is caught and logged; it never affects provider state.
    #[must_use]
    pub fn with_refresh_hook<F>(
        factory: F,
        initial_input: I,
        refresh_input: I,
        on_refresh: Option<RefreshHook<O>>,
    ) -> Self
    where
        F: ResourceFactory<I, O>,
    {
        Self {
            inner: Arc::new(Inner {
                ready: ArcSwapOption::empty(),
                state: Mutex::new(State {
                    phase: Phase::Empty,
                    input: initial_input,
                    generation: 0,
                    inflight: None,
                    refreshed_at: None,
                    disposed: false,
                }),
                factory: Box::new(factory),
                refresh_input,
                on_refresh: RwLock::new(on_refresh),
                shutdown: CancellationToken::new(),
                creations: AtomicU64::new(0),
                refresh_running: AtomicBool::new(false),
            }),
        }
    }

    /// Installs or clears the refresh hook.
    ///
    /// The hook is shared by every clone of this provider. It applies from the
    /// next replacement on; a creation already past publication keeps the old
    /// one.
    pub fn set_refresh_hook(&self, hook: Option<RefreshHook<O>>) {
        *self.inner.on_refresh.write() = hook;
    }

    /// Returns the current resource, creating it if necessary.
    ///
    /// A `Ready` resource is returned without touching the factory or the
    /// state lock. Otherwise the caller joins the in-flight creation, starting
    /// one if none is running.
    ///
    /// # Errors
    ///
    /// Returns the creation's error (shared by every waiter), or
    /// [`ConnectError::Shutdown`] once disposed.
    pub async fn current(&self) -> Result<Arc<O>> {
        if let Some(value) = self.inner.ready.load_full() {
            return Ok(value);
        }

        match self.access()? {
            Access::Ready(value) => Ok(value),
            Access::Pending(creation) => creation.await,
        }
    }

    /// Like [`current`](Self::current), but gives up when `token` is cancelled.
    ///
    /// Cancellation only ends this caller's wait; the shared creation keeps
    /// running for everyone else.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Cancelled`] if `token` fires first.
    pub async fn current_cancellable(&self, token: &CancellationToken) -> Result<Arc<O>> {
        if token.is_cancelled() {
            return Err(ConnectError::Cancelled);
        }
        if let Some(value) = self.inner.ready.load_full() {
            return Ok(value);
        }

        match self.access()? {
            Access::Ready(value) => Ok(value),
            Access::Pending(creation) => {
                tokio::select! {
                    biased;
                    () = token.cancelled() => Err(ConnectError::Cancelled),
                    result = creation => result,
                }
            },
        }
    }

    /// Records `input` and invalidates the current resource.
    ///
    /// The next access or refresh tick re-runs the factory with `input`. A
    /// creation already running is not cancelled; its result is discarded on
    /// completion and the factory re-runs with the newest input.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectError::Shutdown`] once disposed.
    pub fn reset(&self, input: I) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(ConnectError::Shutdown);
        }

        debug!(input = %input, generation = state.generation + 1, "Resetting shared resource");
        state.input = input;
        state.generation += 1;
        state.phase = Phase::Invalidated;
        self.inner.ready.store(None);
        Ok(())
    }

    /// Resets with `input` and waits for the resulting resource.
    ///
    /// # Errors
    ///
    /// See [`reset`](Self::reset) and [`current`](Self::current).
    pub async fn reset_and_wait(&self, input: I) -> Result<Arc<O>> {
        self.reset(input)?;
        self.current().await
    }

    /// Performs one background refresh step and waits for it.
    ///
    /// - `Ready` with nothing in flight: re-creates with the refresh input; readers keep the
    ///   current resource until the new one replaces it.
    /// - `Invalidated` with nothing in flight: starts the pending re-creation.
    /// - Otherwise: nothing to do.
    ///
    /// # Errors
    ///
    /// Returns the creation error if the refresh was started and failed. A
    /// failed refresh keeps the existing `Ready` resource.
    pub async fn refresh(&self) -> Result<()> {
        let creation = {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return Err(ConnectError::Shutdown);
            }
            if state.inflight.is_some() {
                return Ok(());
            }

            match state.phase {
                Phase::Empty => return Ok(()),
                Phase::Ready => {
                    state.input = self.inner.refresh_input.clone();
                    state.generation += 1;
                    debug!(generation = state.generation, "Refreshing shared resource");
                },
                Phase::Invalidated => {
                    debug!(generation = state.generation, "Refresh tick starting invalidated re-creation");
                },
            }
            Inner::start_creation(&self.inner, &mut state)
        };

        creation.await.map(|_| ())
    }

    /// Spawns the periodic refresh task.
    ///
    /// The first tick fires one `period` after the call. Idempotent; the task
    /// stops on [`dispose`](Self::dispose) or when the last provider clone is
    /// dropped.
    pub fn start_background_refresh(&self, period: Duration) {
        if self.inner.refresh_running.swap(true, Ordering::SeqCst) {
            debug!("Background refresh already running");
            return;
        }

        let weak: Weak<Inner<I, O>> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            debug!(period_ms = period.as_millis() as u64, "Starting background refresh");

            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        let provider = SharingProvider { inner };
                        if let Err(e) = provider.refresh().await {
                            warn!(error = %e, "Background refresh failed");
                        }
                    }
                }
            }

            debug!("Background refresh stopped");
        });
    }

    /// Disposes the provider.
    ///
    /// Cancels the in-flight creation and the refresh task and drops the
    /// resource. Waiters receive [`ConnectError::Shutdown`]. Returns `true` on
    /// the first call and `false` afterwards.
    pub fn dispose(&self) -> bool {
        {
            let mut state = self.inner.state.lock();
            if state.disposed {
                return false;
            }
            state.disposed = true;
            state.phase = Phase::Empty;
            state.inflight = None;
            self.inner.ready.store(None);
        }

        self.inner.shutdown.cancel();
        info!("Shared resource provider disposed");
        true
    }

    /// Returns the observable lifecycle state.
    #[must_use]
    pub fn state(&self) -> ProviderState {
        let state = self.inner.state.lock();
        if state.disposed {
            return ProviderState::Disposed;
        }
        match state.phase {
            Phase::Ready => ProviderState::Ready,
            _ if state.inflight.is_some() => ProviderState::Creating,
            Phase::Invalidated => ProviderState::Invalidated,
            Phase::Empty => ProviderState::Empty,
        }
    }

    /// Returns the input the next creation will use.
    #[must_use]
    pub fn last_input(&self) -> I {
        self.inner.state.lock().input.clone()
    }

    /// Returns when the current resource was published.
    #[must_use]
    pub fn last_refreshed(&self) -> Option<Instant> {
        self.inner.state.lock().refreshed_at
    }

    /// Returns how many times the factory has been invoked.
    #[must_use]
    pub fn creations(&self) -> u64 {
        self.inner.creations.load(Ordering::SeqCst)
    }

    fn access(&self) -> Result<Access<O>> {
        let mut state = self.inner.state.lock();
        if state.disposed {
            return Err(ConnectError::Shutdown);
        }
        // A creation may have published between the lock-free read and here.
        if let Some(value) = self.inner.ready.load_full() {
            return Ok(Access::Ready(value));
        }
        Ok(Access::Pending(Inner::start_creation(&self.inner, &mut state)))
    }
}

impl<I, O> Inner<I, O>
where
    I: Clone + fmt::Display + Send + Sync + 'static,
    O: Send + Sync + 'static,
{
    /// Joins the in-flight creation or spawns a new one. Caller holds the lock.
    fn start_creation(inner: &Arc<Self>, state: &mut State<I, O>) -> Creation<O> {
        if let Some(creation) = &state.inflight {
            return creation.clone();
        }

        let driver = tokio::spawn(Self::drive(Arc::clone(inner)));
        let creation = async move {
            match driver.await {
                Ok(result) => result,
                Err(e) => ConnectionSnafu { message: format!("resource creation task failed: {e}") }
                    .fail(),
            }
        }
        .boxed()
        .shared();

        state.inflight = Some(creation.clone());
        creation
    }

    /// Runs the factory until a result for the current generation is published.
    async fn drive(inner: Arc<Self>) -> Result<Arc<O>> {
        loop {
            let (input, generation) = {
                let state = inner.state.lock();
                if state.disposed {
                    return Err(ConnectError::Shutdown);
                }
                (state.input.clone(), state.generation)
            };

            inner.creations.fetch_add(1, Ordering::SeqCst);
            debug!(input = %input, generation, "Creating shared resource");

            let outcome = tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => return Err(ConnectError::Shutdown),
                outcome = AssertUnwindSafe(inner.factory.create(input)).catch_unwind() => {
                    outcome.unwrap_or_else(|_| {
                        ConnectionSnafu { message: "resource factory panicked" }.fail()
                    })
                }
            };

            let published = {
                let mut state = inner.state.lock();
                if state.disposed {
                    return Err(ConnectError::Shutdown);
                }
                if state.generation != generation {
                    debug!(
                        generation,
                        current = state.generation,
                        "Discarding resource created for superseded input"
                    );
                    continue;
                }

                state.inflight = None;
                match outcome {
                    Ok(value) => {
                        let value = Arc::new(value);
                        state.phase = Phase::Ready;
                        state.refreshed_at = Some(Instant::now());
                        inner.ready.store(Some(Arc::clone(&value)));
                        value
                    },
                    Err(e) => {
                        // Keep a Ready resource after a failed background refresh.
                        if state.phase != Phase::Ready {
                            state.phase = Phase::Empty;
                        }
                        state.input = inner.refresh_input.clone();
                        warn!(error = %e, generation, "Shared resource creation failed");
                        return Err(e);
                    },
                }
            };

            let hook = inner.on_refresh.read().clone();
            if let Some(hook) = hook {
                if std::panic::catch_unwind(AssertUnwindSafe(|| hook(&*published))).is_err() {
                    warn!("Refresh hook panicked; provider state unaffected");
                }
            }

            info!(generation, "Shared resource replaced");
            return Ok(published);
        }
    }
}

impl<I, O> Drop for Inner<I, O> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl<I, O> fmt::Debug for SharingProvider<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SharingProvider")
            .field("phase", &state.phase)
            .field("generation", &state.generation)
            .field("inflight", &state.inflight.is_some())
            .field("disposed", &state.disposed)
            .finish_non_exhaustive()
    }
}
