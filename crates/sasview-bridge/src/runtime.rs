//! Runtime lifecycle and the serialized query pipeline.
//!
//! A [`RuntimeHandle`] owns the single embedded interpreter of the process.
//! The interpreter has no notion of concurrent sessions and binds host files
//! at one fixed mount point, so every operation runs inside one critical
//! section guarded by a FIFO lock:
//!
//! ```text
//! Idle → Mounting → Mounted → Evaluating → Materializing → Releasing → Unmounting → Idle
//!            └──────────────── any failure ──→ Failed → Unmounting → Idle
//! ```
//!
//! Interpreter calls block, so the critical section runs on tokio's blocking
//! pool while the caller awaits it. The query timeout covers both the wait
//! for the lock and the evaluation. An evaluation cannot be cancelled: when
//! it overruns, the handle abandons its session to the blocking thread and
//! swaps in a fresh one, and the next caller boots a new interpreter there.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex, OwnedMutexGuard};

use crate::config::{BridgeConfig, LockMode};
use crate::error::{BridgeError, Result};
use crate::interpreter::{Interpreter, InterpreterFactory};
use crate::mount::MountBinding;
use crate::query::{self, DatasetQuery, Selector};
use crate::serialize::{self, DatasetShape, Record, ResultKind};

/// Lifecycle state of the embedded interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeState {
    /// Not booted yet, or the last initialization failed
    Uninitialized,
    /// Booting and provisioning packages
    Initializing,
    /// Accepting queries
    Ready,
    /// Torn down
    Destroyed,
}

/// Phase of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryPhase {
    /// No query in flight
    Idle,
    /// Binding the dataset directory
    Mounting,
    /// Directory bound
    Mounted,
    /// Interpreter evaluating the extraction expression
    Evaluating,
    /// Copying the result to the host and decoding it
    Materializing,
    /// Releasing the interpreter-side result
    Releasing,
    /// Removing the directory binding
    Unmounting,
    /// A step failed; unmounting follows
    Failed,
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QueryPhase::Idle => "idle",
            QueryPhase::Mounting => "mounting",
            QueryPhase::Mounted => "mounted",
            QueryPhase::Evaluating => "evaluating",
            QueryPhase::Materializing => "materializing",
            QueryPhase::Releasing => "releasing",
            QueryPhase::Unmounting => "unmounting",
            QueryPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Everything guarded by the query lock.
struct Session {
    generation: u64,
    interpreter: Option<Box<dyn Interpreter>>,
    provisioned: BTreeSet<String>,
    /// The interpreter may still hold state from an unfinished query.
    stale: bool,
}

impl Session {
    fn new(generation: u64, stale: bool) -> Self {
        Self {
            generation,
            interpreter: None,
            provisioned: BTreeSet::new(),
            stale,
        }
    }

    fn shutdown(&mut self) {
        if let Some(mut interpreter) = self.interpreter.take() {
            interpreter.shutdown();
        }
        self.provisioned.clear();
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.shutdown();
    }
}

type SharedSession = Arc<Mutex<Session>>;

/// Handle to the process-wide embedded interpreter.
///
/// Cloning is cheap; clones share the same interpreter, lock and state.
#[derive(Clone)]
pub struct RuntimeHandle {
    config: Arc<BridgeConfig>,
    factory: Arc<InterpreterFactory>,
    session: Arc<watch::Sender<SharedSession>>,
    generation: Arc<AtomicU64>,
    state: Arc<watch::Sender<RuntimeState>>,
}

impl fmt::Debug for RuntimeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeHandle")
            .field("state", &self.state())
            .field("mount_point", &self.config.mount_point)
            .finish_non_exhaustive()
    }
}

impl RuntimeHandle {
    /// Create an uninitialized handle that boots interpreters with `factory`.
    pub fn new(config: BridgeConfig, factory: InterpreterFactory) -> Self {
        let (state, _) = watch::channel(RuntimeState::Uninitialized);
        let (session, _) = watch::channel(Arc::new(Mutex::new(Session::new(0, false))));
        Self {
            config: Arc::new(config),
            factory: Arc::new(factory),
            session: Arc::new(session),
            generation: Arc::new(AtomicU64::new(0)),
            state: Arc::new(state),
        }
    }

    /// Create a handle backed by the wasmtime interpreter configured in `config.wasm`.
    #[cfg(feature = "wasm")]
    pub fn wasm(config: BridgeConfig) -> Self {
        Self::new(config, Box::new(crate::wasm::boot_interpreter))
    }

    /// Bridge configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RuntimeState {
        *self.state.borrow()
    }

    /// Watch lifecycle state changes.
    pub fn subscribe(&self) -> watch::Receiver<RuntimeState> {
        self.state.subscribe()
    }

    /// Packages provisioned into the current interpreter.
    pub async fn provisioned_packages(&self) -> Vec<String> {
        let session = self.current().lock_owned().await;
        session.provisioned.iter().cloned().collect()
    }

    /// Boot the interpreter and provision packages.
    ///
    /// A no-op when already `Ready`. Concurrent callers queue on the query
    /// lock, so only the first one provisions. On failure the state returns
    /// to `Uninitialized` and the call can be retried.
    pub async fn initialize(&self) -> Result<()> {
        let mut session = self.current().lock_owned().await;
        if self.state() == RuntimeState::Ready && !session.stale && session.interpreter.is_some() {
            tracing::debug!("runtime already initialized");
            return Ok(());
        }

        let this = self.clone();
        tokio::task::spawn_blocking(move || this.boot(&mut session))
            .await
            .map_err(worker_failed)?
    }

    /// Destroy the interpreter. Safe to call in any state.
    ///
    /// Waits for an in-flight query at most as long as the query timeout;
    /// past that the busy session is abandoned.
    pub async fn teardown(&self) {
        let current = self.current();
        let mut session = match self.config.query_timeout() {
            Some(limit) => match tokio::time::timeout(limit, current.clone().lock_owned()).await {
                Ok(session) => session,
                Err(_) => {
                    tracing::warn!(?limit, "query still running at teardown; abandoning it");
                    self.abandon(&current);
                    self.current().lock_owned().await
                }
            },
            None => current.lock_owned().await,
        };
        session.shutdown();
        session.stale = false;
        self.state.send_replace(RuntimeState::Destroyed);
        tracing::info!("runtime torn down");
    }

    /// Read records from a SAS7BDAT or XPT file.
    ///
    /// `rows` and `cols` are `"all"` or selection expressions passed verbatim
    /// to the interpreter (e.g. `"1:10"`, `"c(\"USUBJID\", \"AGE\")"`).
    pub async fn read_dataset(
        &self,
        path: impl AsRef<Path>,
        rows: &str,
        cols: &str,
    ) -> Result<Vec<Record>> {
        let query = Self::build_query(path.as_ref(), rows, cols)?;
        self.read_table(query, self.config.lock_mode).await
    }

    /// Like [`read_dataset`](Self::read_dataset), but fails with
    /// [`BridgeError::Busy`] instead of queuing when a query is in flight.
    pub async fn try_read_dataset(
        &self,
        path: impl AsRef<Path>,
        rows: &str,
        cols: &str,
    ) -> Result<Vec<Record>> {
        let query = Self::build_query(path.as_ref(), rows, cols)?;
        self.read_table(query, LockMode::FailFast).await
    }

    /// Row and column counts of a dataset, without transferring its contents.
    pub async fn read_dataset_shape(&self, path: impl AsRef<Path>) -> Result<DatasetShape> {
        let query = DatasetQuery::new(path.as_ref())?;
        self.with_session(self.config.lock_mode, move |interpreter, mount_point, stale| {
            run_query(interpreter, &query, ResultKind::Shape, mount_point, stale, serialize::to_shape)
        })
        .await
    }

    /// Read the shape, then read at most `max_rows` rows with all columns.
    pub async fn read_dataset_limited(
        &self,
        path: impl AsRef<Path>,
        max_rows: u64,
    ) -> Result<Vec<Record>> {
        let path = path.as_ref();
        let shape = self.read_dataset_shape(path).await?;
        let limit = shape.rows.min(max_rows);
        if limit == 0 {
            return Ok(Vec::new());
        }
        tracing::debug!(rows = shape.rows, cols = shape.cols, limit, "bounded read");
        let query = DatasetQuery::new(path)?.rows(Selector::Expr(format!("1:{}", limit)));
        self.read_table(query, self.config.lock_mode).await
    }

    async fn read_table(&self, query: DatasetQuery, mode: LockMode) -> Result<Vec<Record>> {
        self.with_session(mode, move |interpreter, mount_point, stale| {
            run_query(interpreter, &query, ResultKind::Records, mount_point, stale, serialize::to_records)
        })
        .await
    }

    fn build_query(path: &Path, rows: &str, cols: &str) -> Result<DatasetQuery> {
        Ok(DatasetQuery::new(path)?
            .rows(Selector::parse(rows)?)
            .cols(Selector::parse(cols)?))
    }

    /// Run `job` with exclusive access to the ready interpreter.
    ///
    /// The query timeout bounds the lock wait and the job together.
    async fn with_session<T, F>(&self, mode: LockMode, job: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn Interpreter, &str, &mut bool) -> Result<T> + Send + 'static,
    {
        let limit = self.config.query_timeout();
        let deadline = limit.map(|limit| tokio::time::Instant::now() + limit);
        let shared = self.current();

        let session = match mode {
            LockMode::Queue => {
                let lock = shared.clone().lock_owned();
                match deadline {
                    Some(deadline) => tokio::time::timeout_at(deadline, lock)
                        .await
                        .map_err(|_| timed_out(limit))?,
                    None => lock.await,
                }
            }
            LockMode::FailFast => shared
                .clone()
                .try_lock_owned()
                .map_err(|_| BridgeError::Busy)?,
        };

        let task = tokio::task::spawn_blocking({
            let this = self.clone();
            move || this.run_locked(session, job)
        });

        match deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, task).await {
                Ok(joined) => joined.map_err(worker_failed)?,
                Err(_) => {
                    self.abandon(&shared);
                    Err(timed_out(limit))
                }
            },
            None => task.await.map_err(worker_failed)?,
        }
    }

    /// Body of the critical section. Runs on the blocking pool.
    fn run_locked<T, F>(&self, mut session: OwnedMutexGuard<Session>, job: F) -> Result<T>
    where
        F: FnOnce(&mut dyn Interpreter, &str, &mut bool) -> Result<T>,
    {
        // A leftover `Initializing` means the boot that set it was abandoned.
        let live = matches!(self.state(), RuntimeState::Ready | RuntimeState::Initializing);
        if session.stale && live {
            tracing::warn!("runtime left inconsistent by an earlier query; rebuilding interpreter");
            self.boot(&mut session)?;
        }
        let state = self.state();
        let Session {
            interpreter, stale, ..
        } = &mut *session;
        match interpreter.as_deref_mut() {
            Some(interpreter) if state == RuntimeState::Ready => {
                job(interpreter, &self.config.mount_point, stale)
            }
            _ => Err(BridgeError::NotReady(state)),
        }
    }

    fn current(&self) -> SharedSession {
        self.session.borrow().clone()
    }

    /// Leave `wedged` to whoever still holds it and make a fresh session
    /// current. The fresh session boots on first use.
    fn abandon(&self, wedged: &SharedSession) {
        let replaced = self.session.send_if_modified(|current| {
            if !Arc::ptr_eq(current, wedged) {
                return false;
            }
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            *current = Arc::new(Mutex::new(Session::new(generation, true)));
            true
        });
        if replaced {
            tracing::warn!("interpreter abandoned to an overrunning query; next caller rebuilds it");
        }
    }

    /// Publish a lifecycle transition made by `session`, unless it has been abandoned.
    fn publish(&self, session: &Session, state: RuntimeState) {
        if session.generation == self.generation.load(Ordering::Acquire) {
            self.state.send_replace(state);
        }
    }

    /// Boot a fresh interpreter into `session`. Runs on the blocking pool with the lock held.
    fn boot(&self, session: &mut Session) -> Result<()> {
        session.shutdown();
        self.publish(session, RuntimeState::Initializing);
        tracing::info!(
            repository = %self.config.repository_url,
            packages = ?self.config.packages,
            "initializing interpreter"
        );
        let started = Instant::now();

        match self.provision() {
            Ok(interpreter) => {
                session.interpreter = Some(interpreter);
                session.provisioned = self.config.packages.iter().cloned().collect();
                session.stale = false;
                self.publish(session, RuntimeState::Ready);
                tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "interpreter ready");
                Ok(())
            }
            Err(e) => {
                self.publish(session, RuntimeState::Uninitialized);
                tracing::error!("interpreter initialization failed: {}", e);
                Err(match e {
                    err @ BridgeError::RuntimeInit(_) => err,
                    other => BridgeError::RuntimeInit(other.to_string()),
                })
            }
        }
    }

    fn provision(&self) -> Result<Box<dyn Interpreter>> {
        let mut interpreter = (self.factory)(&self.config)?;
        let provisioned = interpreter
            .install_packages(&self.config.packages, &self.config.repository_url)
            .and_then(|()| interpreter.mkdir(&self.config.mount_point));
        if let Err(e) = provisioned {
            interpreter.shutdown();
            return Err(e);
        }
        Ok(interpreter)
    }
}

/// One pass through the query state machine. The mount is released on every path.
fn run_query<T>(
    interpreter: &mut dyn Interpreter,
    query: &DatasetQuery,
    kind: ResultKind,
    mount_point: &str,
    stale: &mut bool,
    decode: fn(&[u8]) -> Result<T>,
) -> Result<T> {
    let started = Instant::now();
    let path = query.path().to_path_buf();

    tracing::debug!(path = %path.display(), "phase: {}", QueryPhase::Mounting);
    let mut binding = MountBinding::acquire(interpreter, query.host_dir(), mount_point)
        .map_err(|e| e.at(QueryPhase::Mounting))?;
    tracing::debug!("phase: {}", QueryPhase::Mounted);

    let vpath = binding.virtual_path(&query.file_name());
    let value = match kind {
        ResultKind::Records => query::read_table(binding.interpreter(), query, &vpath),
        ResultKind::Shape => query::read_shape(binding.interpreter(), query, &vpath),
    };
    let outcome = value
        .and_then(|value| value.materialize())
        .and_then(|bytes| decode(&bytes).map_err(|e| e.at(QueryPhase::Materializing)));

    if let Err(e) = &outcome {
        tracing::debug!(path = %path.display(), "phase: {} ({})", QueryPhase::Failed, e);
    }
    tracing::debug!("phase: {}", QueryPhase::Unmounting);
    if !binding.release() {
        // The bind may still be in place; rebuild before the next query.
        *stale = true;
    }
    tracing::debug!(
        path = %path.display(),
        elapsed_us = started.elapsed().as_micros() as u64,
        "phase: {}",
        QueryPhase::Idle
    );
    outcome
}

fn timed_out(limit: Option<Duration>) -> BridgeError {
    let limit = limit.unwrap_or_default();
    tracing::warn!(?limit, "query timed out");
    BridgeError::Timeout(limit)
}

fn worker_failed(e: tokio::task::JoinError) -> BridgeError {
    BridgeError::Interpreter(format!("interpreter worker failed: {}", e))
}
