//! The execution service: job registry, call dispatch and teardown.
//!
//! `initialize` opens a transport through the configured factory, performs
//! the handshake under the init timeout and registers the job. Calls go
//! through the permission gate, then per-origin admission, then the job's
//! RPC client under a deadline. A call that misses its deadline terminates
//! the whole job, so every later call to it fails fast with `Terminated`.

use crate::admission::AdmissionQueue;
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::events::{BrokerEvent, TerminationReason};
use crate::gate::{AllowAll, PermissionGate};
use crate::handler::{HostRequestHandler, MethodNotFound};
use crate::job::{Job, JobInfo, JobStatus};
use crate::rpc::RpcClient;
use crate::stream::HandshakeStream;
use crate::transport::{TransportConfig, TransportFactory};
use corral_proto::{HOST_STREAM, PLUGIN_STREAM, RpcKind, RpcMessage, UNHANDLED_ERROR_METHOD};
use corral_types::{JobId, Origin};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Method used by [`ExecutionService::ping`].
pub const PING_METHOD: &str = "ping";

/// Live jobs plus a bounded memory of terminated ids.
struct Registry {
    jobs: HashMap<JobId, Arc<Job>>,
    tombstones: VecDeque<JobId>,
    tombstone_set: HashSet<JobId>,
    tombstone_capacity: usize,
}

impl Registry {
    fn new(tombstone_capacity: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            tombstones: VecDeque::new(),
            tombstone_set: HashSet::new(),
            tombstone_capacity,
        }
    }

    fn remember(&mut self, job_id: JobId) {
        if self.tombstone_capacity == 0 || !self.tombstone_set.insert(job_id) {
            return;
        }
        self.tombstones.push_back(job_id);
        while self.tombstones.len() > self.tombstone_capacity {
            if let Some(oldest) = self.tombstones.pop_front() {
                self.tombstone_set.remove(&oldest);
            }
        }
    }

    fn forget(&mut self, job_id: JobId) {
        if self.tombstone_set.remove(&job_id) {
            self.tombstones.retain(|id| *id != job_id);
        }
    }

    fn lookup(&self, job_id: JobId) -> BrokerResult<Arc<Job>> {
        match self.jobs.get(&job_id) {
            Some(job) => Ok(Arc::clone(job)),
            None if self.tombstone_set.contains(&job_id) => Err(BrokerError::Terminated(job_id)),
            None => Err(BrokerError::JobNotFound(job_id)),
        }
    }
}

struct Inner {
    config: BrokerConfig,
    factory: Arc<dyn TransportFactory>,
    gate: Arc<dyn PermissionGate>,
    handler: Arc<dyn HostRequestHandler>,
    queue: Arc<AdmissionQueue>,
    registry: Mutex<Registry>,
    events: broadcast::Sender<BrokerEvent>,
}

/// Configures an [`ExecutionService`].
pub struct ExecutionServiceBuilder {
    config: BrokerConfig,
    factory: Arc<dyn TransportFactory>,
    gate: Arc<dyn PermissionGate>,
    handler: Arc<dyn HostRequestHandler>,
}

impl ExecutionServiceBuilder {
    pub fn config(mut self, config: BrokerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn gate(mut self, gate: impl PermissionGate + 'static) -> Self {
        self.gate = Arc::new(gate);
        self
    }

    pub fn handler(mut self, handler: impl HostRequestHandler + 'static) -> Self {
        self.handler = Arc::new(handler);
        self
    }

    /// Validates the config and builds the service.
    pub fn build(self) -> BrokerResult<ExecutionService> {
        self.config.validate()?;
        let (events, _) = broadcast::channel(self.config.event_capacity);
        let inner = Inner {
            queue: Arc::new(AdmissionQueue::new(self.config.max_per_origin)),
            registry: Mutex::new(Registry::new(self.config.tombstone_capacity)),
            config: self.config,
            factory: self.factory,
            gate: self.gate,
            handler: self.handler,
            events,
        };
        Ok(ExecutionService {
            inner: Arc::new(inner),
        })
    }
}

/// Cheaply cloneable handle to the broker.
#[derive(Clone)]
pub struct ExecutionService {
    inner: Arc<Inner>,
}

impl ExecutionService {
    /// Starts a builder with default config, an allow-all gate and a handler
    /// that rejects plugin-initiated requests.
    pub fn builder(factory: impl TransportFactory + 'static) -> ExecutionServiceBuilder {
        ExecutionServiceBuilder {
            config: BrokerConfig::default(),
            factory: Arc::new(factory),
            gate: Arc::new(AllowAll),
            handler: Arc::new(MethodNotFound),
        }
    }

    /// Builds a service with `config` and otherwise default collaborators.
    pub fn new(config: BrokerConfig, factory: impl TransportFactory + 'static) -> BrokerResult<Self> {
        Self::builder(factory).config(config).build()
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    // ================================================================
    // Lifecycle
    // ================================================================

    /// Creates job `job_id` and waits for its handshake.
    ///
    /// On `HandshakeTimeout`, or `TransportFailure` when the job goes away
    /// mid-handshake, the transport is released and nothing stays
    /// registered. Dropping the returned future before it resolves does the
    /// same in the background.
    pub async fn initialize(&self, job_id: JobId, config: &TransportConfig) -> BrokerResult<()> {
        if crate::lock(&self.inner.registry).jobs.contains_key(&job_id) {
            return Err(BrokerError::JobAlreadyExists(job_id));
        }

        let opened = self.inner.factory.open(job_id, config).await?;
        let transport = opened.transport;
        let stream = match HandshakeStream::new(HOST_STREAM, PLUGIN_STREAM, Arc::clone(&transport)) {
            Ok(stream) => Arc::new(stream),
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    warn!(job_id = %job_id, error = %close_err, "failed to close transport");
                }
                return Err(e);
            }
        };
        let rpc = Arc::new(RpcClient::new(job_id, stream));
        let job = Arc::new(Job::new(job_id, transport, rpc));
        job.advance(JobStatus::Initializing);

        let registered = {
            let mut registry = crate::lock(&self.inner.registry);
            if registry.jobs.contains_key(&job_id) {
                false
            } else {
                registry.forget(job_id);
                registry.jobs.insert(job_id, Arc::clone(&job));
                true
            }
        };
        if !registered {
            job.release().await?;
            return Err(BrokerError::JobAlreadyExists(job_id));
        }

        let task = tokio::spawn(receive_loop(
            Arc::downgrade(&self.inner),
            Arc::clone(&job),
            opened.inbound,
        ));
        job.set_receive_task(task);
        info!(job_id = %job_id, kind = %job.kind(), "job initializing");

        let mut guard = InitGuard {
            inner: Arc::clone(&self.inner),
            job_id,
            armed: true,
        };
        let init_timeout = self.inner.config.init_timeout();
        let outcome = tokio::time::timeout(init_timeout, async {
            tokio::select! {
                () = job.stream().wait_established() => true,
                () = job.wait_terminal() => false,
            }
        })
        .await;
        guard.armed = false;

        match outcome {
            Ok(true) => {}
            Ok(false) => {
                return Err(BrokerError::TransportFailure(format!(
                    "job {job_id} closed during handshake"
                )));
            }
            Err(_) => {
                warn!(job_id = %job_id, timeout_ms = self.inner.config.init_timeout_ms, "handshake timed out");
                let teardown = self
                    .inner
                    .spawn_terminate(job_id, TerminationReason::HandshakeTimeout);
                await_teardown(job_id, teardown).await;
                return Err(BrokerError::HandshakeTimeout {
                    job_id,
                    timeout_ms: self.inner.config.init_timeout_ms,
                });
            }
        }

        if !job.advance(JobStatus::Ready) {
            // Torn down while the handshake was completing.
            return Err(BrokerError::TransportFailure(format!(
                "job {job_id} closed during handshake"
            )));
        }
        info!(job_id = %job_id, "job ready");
        self.inner.emit(BrokerEvent::JobReady {
            job_id,
            kind: job.kind(),
        });
        Ok(())
    }

    /// Terminates `job_id`. Idempotent; unknown ids are a no-op.
    ///
    /// Pending calls on the job fail with `Terminated`. The transport is
    /// released exactly once.
    pub async fn terminate(&self, job_id: JobId) -> BrokerResult<()> {
        self.inner
            .spawn_terminate(job_id, TerminationReason::Requested)
            .await
            .map_err(|e| BrokerError::TransportFailure(format!("termination task failed: {e}")))?
    }

    /// Terminates every live job. Returns the first teardown error, if any.
    pub async fn terminate_all(&self) -> BrokerResult<()> {
        let ids: Vec<JobId> = crate::lock(&self.inner.registry).jobs.keys().copied().collect();
        let tasks: Vec<_> = ids
            .into_iter()
            .map(|id| self.inner.spawn_terminate(id, TerminationReason::Shutdown))
            .collect();

        let mut first_error = None;
        for task in tasks {
            let result = task
                .await
                .map_err(|e| BrokerError::TransportFailure(format!("termination task failed: {e}")))
                .and_then(|r| r);
            if let Err(e) = result {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ================================================================
    // Calls
    // ================================================================

    /// Calls `method` on job `job_id` on behalf of `origin`.
    ///
    /// Checks run in order: permission gate, admission, job lookup, status.
    /// `deadline` defaults to the configured call timeout. On `CallTimeout`
    /// the job has been terminated by the time this returns.
    pub async fn execute_in_job(
        &self,
        origin: &Origin,
        job_id: JobId,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> BrokerResult<Value> {
        if !self.inner.gate.is_allowed(origin, method) {
            debug!(origin = %origin, method, "call rejected by permission gate");
            return Err(BrokerError::Unauthorized {
                origin: origin.clone(),
                method: method.to_string(),
            });
        }
        let _permit = self.inner.queue.acquire(origin)?;
        self.call(job_id, method, params, deadline).await
    }

    /// Sends a notification to job `job_id` on behalf of `origin`.
    pub fn notify(&self, origin: &Origin, job_id: JobId, method: &str, params: Value) -> BrokerResult<()> {
        if !self.inner.gate.is_allowed(origin, method) {
            return Err(BrokerError::Unauthorized {
                origin: origin.clone(),
                method: method.to_string(),
            });
        }
        let job = self.ready_job(job_id)?;
        job.rpc().notify(method, params)
    }

    /// Health check: calls `ping` on the job under the default deadline.
    pub async fn ping(&self, job_id: JobId) -> BrokerResult<Value> {
        self.call(job_id, PING_METHOD, Value::Null, None).await
    }

    async fn call(
        &self,
        job_id: JobId,
        method: &str,
        params: Value,
        deadline: Option<Duration>,
    ) -> BrokerResult<Value> {
        let job = self.ready_job(job_id)?;
        let deadline = deadline.unwrap_or_else(|| self.inner.config.call_timeout());

        match job.rpc().send_request(method, params, deadline).await {
            Err(err @ BrokerError::CallTimeout { .. }) => {
                warn!(job_id = %job_id, method, "call timed out, terminating job");
                let teardown = self
                    .inner
                    .spawn_terminate(job_id, TerminationReason::CallTimeout);
                await_teardown(job_id, teardown).await;
                Err(err)
            }
            other => other,
        }
    }

    fn ready_job(&self, job_id: JobId) -> BrokerResult<Arc<Job>> {
        let job = crate::lock(&self.inner.registry).lookup(job_id)?;
        match job.status() {
            JobStatus::Ready => Ok(job),
            status if status.is_terminal() => Err(BrokerError::Terminated(job_id)),
            status => Err(BrokerError::NotReady { job_id, status }),
        }
    }

    // ================================================================
    // Introspection
    // ================================================================

    /// Status of a live job, or `Terminated` for a remembered one.
    pub fn job_status(&self, job_id: JobId) -> Option<JobStatus> {
        match crate::lock(&self.inner.registry).lookup(job_id) {
            Ok(job) => Some(job.status()),
            Err(BrokerError::Terminated(_)) => Some(JobStatus::Terminated),
            Err(_) => None,
        }
    }

    pub fn job_info(&self, job_id: JobId) -> Option<JobInfo> {
        crate::lock(&self.inner.registry)
            .jobs
            .get(&job_id)
            .map(|job| job.info())
    }

    /// Snapshots of all live jobs, oldest first.
    pub fn jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = crate::lock(&self.inner.registry)
            .jobs
            .values()
            .map(|job| job.info())
            .collect();
        jobs.sort_by_key(|info| info.id);
        jobs
    }

    pub fn job_count(&self) -> usize {
        crate::lock(&self.inner.registry).jobs.len()
    }

    /// Calls currently admitted for `origin`.
    pub fn in_flight(&self, origin: &Origin) -> usize {
        self.inner.queue.get(origin)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.inner.events.subscribe()
    }
}

impl Inner {
    fn emit(&self, event: BrokerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Runs teardown on its own task so it completes even if the caller is dropped.
    fn spawn_terminate(
        self: &Arc<Self>,
        job_id: JobId,
        reason: TerminationReason,
    ) -> JoinHandle<BrokerResult<()>> {
        let inner = Arc::clone(self);
        tokio::spawn(async move { inner.terminate_job(job_id, reason).await })
    }

    async fn terminate_job(&self, job_id: JobId, reason: TerminationReason) -> BrokerResult<()> {
        let job = {
            let mut registry = crate::lock(&self.registry);
            let Some(job) = registry.jobs.remove(&job_id) else {
                return Ok(());
            };
            // A job that never became ready leaves no trace, whatever ended it.
            let never_ready = job.status() < JobStatus::Ready;
            if !reason.is_init_failure() && !never_ready {
                registry.remember(job_id);
            }
            job
        };

        job.advance(JobStatus::Terminating);
        job.rpc().cancel_all(|| BrokerError::Terminated(job_id));
        let released = job.release().await;
        if let Err(e) = &released {
            warn!(job_id = %job_id, error = %e, "transport release failed");
        }
        job.advance(JobStatus::Terminated);

        info!(job_id = %job_id, reason = %reason, "job terminated");
        self.emit(BrokerEvent::JobTerminated {
            job_id,
            reason,
            release_error: released.as_ref().err().map(ToString::to_string),
        });
        released
    }

    fn dispatch_inbound(self: &Arc<Self>, job: &Arc<Job>, message: RpcMessage) {
        let job_id = job.id();
        match message.kind() {
            RpcKind::Notification => {
                let method = message.method.unwrap_or_default();
                let params = message.params.unwrap_or(Value::Null);
                if method == UNHANDLED_ERROR_METHOD {
                    let description = params
                        .get("message")
                        .and_then(Value::as_str)
                        .map_or_else(|| params.to_string(), str::to_string);
                    warn!(job_id = %job_id, error = %description, "plugin reported unhandled error");
                    self.emit(BrokerEvent::UnhandledError {
                        job_id,
                        error: params,
                    });
                    drop(self.spawn_terminate(
                        job_id,
                        TerminationReason::UnhandledError {
                            message: description,
                        },
                    ));
                } else {
                    self.emit(BrokerEvent::Notification {
                        job_id,
                        method,
                        params,
                    });
                }
            }
            RpcKind::Request => {
                self.emit(BrokerEvent::OutboundRequest {
                    job_id,
                    request: message.clone(),
                });
                let inner = Arc::clone(self);
                let job = Arc::clone(job);
                tokio::spawn(async move { inner.answer(job, message).await });
            }
            RpcKind::Response | RpcKind::Invalid => {}
        }
    }

    async fn answer(&self, job: Arc<Job>, request: RpcMessage) {
        let job_id = job.id();
        let (Some(id), Some(method)) = (request.id, request.method) else {
            return;
        };
        let params = request.params.unwrap_or(Value::Null);
        debug!(job_id = %job_id, %id, method = %method, "handling plugin request");

        let outcome = self.handler.handle(job_id, &method, params).await;
        let response = match &outcome {
            Ok(result) => RpcMessage::success(id.clone(), result.clone()),
            Err(error) => RpcMessage::failure(id.clone(), error.clone()),
        };
        if let Err(e) = job.rpc().respond(id, outcome) {
            warn!(job_id = %job_id, error = %e, "failed to answer plugin request");
            return;
        }
        self.emit(BrokerEvent::OutboundResponse { job_id, response });
    }
}

/// Waits for a teardown whose outcome the caller cannot return.
///
/// Release failures are already logged and carried on `JobTerminated`.
async fn await_teardown(job_id: JobId, teardown: JoinHandle<BrokerResult<()>>) {
    match teardown.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(job_id = %job_id, error = %e, "teardown finished with release error"),
        Err(e) => warn!(job_id = %job_id, error = %e, "termination task failed"),
    }
}

/// Tears down a half-initialized job if `initialize` is dropped mid-handshake.
struct InitGuard {
    inner: Arc<Inner>,
    job_id: JobId,
    armed: bool,
}

impl Drop for InitGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if tokio::runtime::Handle::try_current().is_ok() {
            debug!(job_id = %self.job_id, "initialize abandoned");
            drop(self.inner.spawn_terminate(self.job_id, TerminationReason::InitCancelled));
        }
    }
}

async fn receive_loop(inner: Weak<Inner>, job: Arc<Job>, mut inbound: mpsc::UnboundedReceiver<Value>) {
    let job_id = job.id();
    while let Some(raw) = inbound.recv().await {
        let Some(payload) = job.stream().receive(raw) else {
            continue;
        };
        let Some(message) = job.rpc().handle_payload(payload) else {
            continue;
        };
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner.dispatch_inbound(&job, message);
    }

    debug!(job_id = %job_id, "transport inbound closed");
    if let Some(inner) = inner.upgrade() {
        // Own task: termination aborts this one.
        drop(inner.spawn_terminate(job_id, TerminationReason::TransportClosed));
    }
}
