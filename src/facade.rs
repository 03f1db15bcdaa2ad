//! Persistence Facade: translates bus requests into sync controller calls.
//!
//! [`PersistenceFacade::handle`] answers one request synchronously.
//! [`PersistenceFacade::spawn`] moves handling onto a dispatcher thread so
//! blocking file I/O never runs on the thread that delivers requests;
//! responses go to a [`ResponseSink`].

use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::controller::SyncController;
use crate::error::{PersistenceError, Result};
use crate::model::{AggregateRecord, EditTime, RunRecord};
use crate::store::{RemoteSession, StorageComponent};

/// Requests accepted from the message bus.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceRequest {
    StoreRun(RunRecord),
    DeleteRun(RunRecord),
    LoadRuns,
    StoreAggregate(AggregateRecord),
    DeleteAggregate,
    LoadAggregate,
    /// Run a pass now (subject to deduplication)
    Sync,
}

/// Results published back to the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum PersistenceResponse {
    /// A run or aggregate was written locally with this edit time
    Stored(EditTime),
    Deleted,
    /// Runs sorted newest first
    RunsLoaded(Vec<RunRecord>),
    AggregateLoaded(AggregateRecord),
    SyncRequested,
}

/// Receives the outcome of requests handled on the dispatcher thread.
pub trait ResponseSink: Send + Sync {
    fn publish(&self, request: &PersistenceRequest, response: Result<PersistenceResponse>);
}

impl<F> ResponseSink for F
where
    F: Fn(&PersistenceRequest, Result<PersistenceResponse>) + Send + Sync,
{
    fn publish(&self, request: &PersistenceRequest, response: Result<PersistenceResponse>) {
        self(request, response)
    }
}

/// Request/response front of the sync controller.
pub struct PersistenceFacade<L, R>
where
    L: StorageComponent + 'static,
    R: StorageComponent + RemoteSession + 'static,
{
    controller: SyncController<L, R>,
}

impl<L, R> PersistenceFacade<L, R>
where
    L: StorageComponent + 'static,
    R: StorageComponent + RemoteSession + 'static,
{
    pub fn new(controller: SyncController<L, R>) -> Self {
        Self { controller }
    }

    pub fn controller(&self) -> &SyncController<L, R> {
        &self.controller
    }

    /// Handle one request against local data. Synchronization health never
    /// affects the answer.
    pub fn handle(&self, request: &PersistenceRequest) -> Result<PersistenceResponse> {
        debug!("[Facade] Handling {}", request_name(request));
        match request {
            PersistenceRequest::StoreRun(record) => self
                .controller
                .save_run(record)
                .map(PersistenceResponse::Stored),
            PersistenceRequest::DeleteRun(record) => self
                .controller
                .delete_run(record)
                .map(|_| PersistenceResponse::Deleted),
            PersistenceRequest::LoadRuns => self
                .controller
                .load_runs()
                .map(PersistenceResponse::RunsLoaded),
            PersistenceRequest::StoreAggregate(record) => self
                .controller
                .save_aggregate(record)
                .map(PersistenceResponse::Stored),
            PersistenceRequest::DeleteAggregate => self
                .controller
                .delete_aggregate()
                .map(|_| PersistenceResponse::Deleted),
            PersistenceRequest::LoadAggregate => self
                .controller
                .load_aggregate()
                .map(PersistenceResponse::AggregateLoaded),
            PersistenceRequest::Sync => {
                self.controller.request_sync();
                Ok(PersistenceResponse::SyncRequested)
            }
        }
    }

    /// Start a dispatcher thread that handles requests in arrival order and
    /// publishes each result to `sink`.
    pub fn spawn(self, sink: Arc<dyn ResponseSink>) -> Result<FacadeHandle> {
        let (sender, receiver) = mpsc::channel::<PersistenceRequest>();
        let worker = thread::Builder::new()
            .name("runsync-facade".to_string())
            .spawn(move || {
                for request in receiver {
                    let response = self.handle(&request);
                    if let Err(e) = &response {
                        warn!("[Facade] {} failed: {}", request_name(&request), e);
                    }
                    sink.publish(&request, response);
                }
                info!("[Facade] Dispatcher stopped");
            })
            .map_err(|e| {
                PersistenceError::unavailable(format!("Failed to spawn dispatcher: {}", e))
            })?;

        Ok(FacadeHandle {
            sender: Some(sender),
            worker: Some(worker),
        })
    }
}

fn request_name(request: &PersistenceRequest) -> &'static str {
    match request {
        PersistenceRequest::StoreRun(_) => "StoreRun",
        PersistenceRequest::DeleteRun(_) => "DeleteRun",
        PersistenceRequest::LoadRuns => "LoadRuns",
        PersistenceRequest::StoreAggregate(_) => "StoreAggregate",
        PersistenceRequest::DeleteAggregate => "DeleteAggregate",
        PersistenceRequest::LoadAggregate => "LoadAggregate",
        PersistenceRequest::Sync => "Sync",
    }
}

/// Sending side of a running dispatcher. Dropping it drains queued requests
/// and stops the dispatcher (and the controller it owns).
pub struct FacadeHandle {
    sender: Option<mpsc::Sender<PersistenceRequest>>,
    worker: Option<JoinHandle<()>>,
}

impl FacadeHandle {
    /// Queue a request. Fails only if the dispatcher has stopped.
    pub fn submit(&self, request: PersistenceRequest) -> Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| PersistenceError::unavailable("Dispatcher stopped"))?
            .send(request)
            .map_err(|_| PersistenceError::unavailable("Dispatcher stopped"))
    }
}

impl Drop for FacadeHandle {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("[Facade] Dispatcher panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RunId, RunTelemetry, UserToken};
    use crate::session::SharedToken;
    use crate::store::MemoryStore;
    use std::sync::Mutex;
    use std::time::Duration;

    fn facade() -> (PersistenceFacade<MemoryStore, MemoryStore>, MemoryStore) {
        let token = UserToken::new("tester");
        let local = MemoryStore::new(token.clone());
        let controller = SyncController::new(
            local.clone(),
            MemoryStore::remote(token.clone()),
            Arc::new(SharedToken::new(token)),
            Duration::from_millis(10),
        )
        .unwrap();
        (PersistenceFacade::new(controller), local)
    }

    fn run(id: i64) -> RunRecord {
        RunRecord::new(RunId(id), RunTelemetry::default())
    }

    #[test]
    fn test_load_runs_is_newest_first() {
        let (facade, _) = facade();
        for id in [1000, 3000, 2000] {
            facade.handle(&PersistenceRequest::StoreRun(run(id))).unwrap();
        }

        match facade.handle(&PersistenceRequest::LoadRuns).unwrap() {
            PersistenceResponse::RunsLoaded(runs) => {
                let ids: Vec<i64> = runs.iter().map(|r| r.id.0).collect();
                assert_eq!(ids, vec![3000, 2000, 1000]);
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_load_aggregate_defaults_to_zeroed() {
        let (facade, _) = facade();
        assert_eq!(
            facade.handle(&PersistenceRequest::LoadAggregate).unwrap(),
            PersistenceResponse::AggregateLoaded(AggregateRecord::default())
        );
    }

    #[test]
    fn test_delete_run_hides_record() {
        let (facade, local) = facade();
        facade.handle(&PersistenceRequest::StoreRun(run(5))).unwrap();
        assert_eq!(
            facade.handle(&PersistenceRequest::DeleteRun(run(5))).unwrap(),
            PersistenceResponse::Deleted
        );

        assert!(!local.snapshot().runs.contains_key(&RunId(5)));
        assert_eq!(
            facade.handle(&PersistenceRequest::LoadRuns).unwrap(),
            PersistenceResponse::RunsLoaded(Vec::new())
        );
    }

    #[test]
    fn test_dispatcher_publishes_in_order() {
        let (facade, _) = facade();
        let seen: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let sink = move |request: &PersistenceRequest, response: Result<PersistenceResponse>| {
            assert!(response.is_ok());
            sink_seen.lock().unwrap().push(request_name(request));
        };

        {
            let handle = facade.spawn(Arc::new(sink)).unwrap();
            handle.submit(PersistenceRequest::StoreRun(run(1))).unwrap();
            handle.submit(PersistenceRequest::LoadRuns).unwrap();
            handle.submit(PersistenceRequest::Sync).unwrap();
        }

        assert_eq!(*seen.lock().unwrap(), vec!["StoreRun", "LoadRuns", "Sync"]);
    }

    #[test]
    fn test_local_failure_is_returned() {
        let (facade, local) = facade();
        local.set_fail_writes(true);
        assert!(matches!(
            facade.handle(&PersistenceRequest::StoreAggregate(AggregateRecord::default())),
            Err(PersistenceError::LocalWriteFailed { .. })
        ));
    }
}
