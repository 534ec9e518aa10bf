use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::catalog::Catalog;
use crate::error::{DispatchError, ValidationError};
use crate::llm::Dispatcher;
use crate::models::{ModelId, ModelResult, ModelStatus, RunParameters, RunSettings};
use crate::{telemetry, validation};

/**
 * \brief Aggregate state of the current run.
 *
 * Statuses and results are keyed by model; every ordered view is rebuilt
 * from catalog order since settlements arrive in completion order.
 */
#[derive(Debug, Clone)]
pub struct RunState {
    run_id: u64,
    catalog: Arc<Catalog>,
    settings: Option<RunSettings>,
    statuses: HashMap<ModelId, ModelStatus>,
    results: HashMap<ModelId, ModelResult>,
    headline_error: Option<String>,
}

impl RunState {
    fn idle(catalog: Arc<Catalog>) -> Self {
        let statuses = catalog
            .ids()
            .map(|id| (id.clone(), ModelStatus::Idle))
            .collect();
        Self {
            run_id: 0,
            catalog,
            settings: None,
            statuses,
            results: HashMap::new(),
            headline_error: None,
        }
    }

    fn begin(run_id: u64, catalog: Arc<Catalog>, settings: RunSettings) -> Self {
        let statuses = catalog
            .ids()
            .map(|id| (id.clone(), ModelStatus::Loading))
            .collect();
        Self {
            run_id,
            catalog,
            settings: Some(settings),
            statuses,
            results: HashMap::new(),
            headline_error: None,
        }
    }

    /**
     * \brief Applies one settlement. Returns false when nothing changed:
     * the settlement belongs to a superseded run, or the model already settled.
     */
    fn settle(&mut self, run_id: u64, model: &ModelId, outcome: Result<ModelResult, String>) -> bool {
        if self.run_id != run_id {
            return false;
        }
        let Some(status) = self.statuses.get_mut(model) else {
            return false;
        };
        if *status != ModelStatus::Loading {
            return false;
        }
        match outcome {
            Ok(result) => {
                self.results.insert(model.clone(), result);
                *status = ModelStatus::Complete;
            }
            Err(message) => {
                if self.headline_error.is_none() {
                    self.headline_error = Some(format!("Error with {}: {}", model, message));
                }
                *status = ModelStatus::Error { error: message };
            }
        }
        true
    }

    /** \brief 0 until the first run starts. */
    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn settings(&self) -> Option<&RunSettings> {
        self.settings.as_ref()
    }

    pub fn headline_error(&self) -> Option<&str> {
        self.headline_error.as_deref()
    }

    pub fn status(&self, model: &ModelId) -> Option<&ModelStatus> {
        self.statuses.get(model)
    }

    /** \brief Statuses in catalog order. */
    pub fn statuses(&self) -> Vec<(&ModelId, &ModelStatus)> {
        self.catalog
            .ids()
            .filter_map(|id| self.statuses.get(id).map(|s| (id, s)))
            .collect()
    }

    pub fn result(&self, model: &ModelId) -> Option<&ModelResult> {
        self.results.get(model)
    }

    /** \brief Accumulated results sorted by catalog position. */
    pub fn results(&self) -> Vec<&ModelResult> {
        let mut results: Vec<&ModelResult> = self.results.values().collect();
        results.sort_by_key(|r| self.catalog.sort_key(&r.model_id));
        results
    }

    pub fn pending(&self) -> usize {
        self.statuses
            .values()
            .filter(|s| **s == ModelStatus::Loading)
            .count()
    }

    /** \brief True once a run has started and every model reached a terminal status. */
    pub fn is_settled(&self) -> bool {
        self.settings.is_some() && self.statuses.values().all(ModelStatus::is_terminal)
    }
}

/**
 * \brief Fans a prompt out to every catalog model and tracks each dispatch independently.
 *
 * State is republished through a watch channel after every individual
 * settlement. Starting a new run cancels the tasks of the previous one and
 * any late settlement from it is dropped.
 */
pub struct RunCoordinator {
    dispatcher: Arc<dyn Dispatcher>,
    catalog: Arc<Catalog>,
    fallback_credential: Option<String>,
    dispatch_timeout: Option<Duration>,
    state: Arc<watch::Sender<RunState>>,
    in_flight: Mutex<InFlight>,
}

/**
 * \brief Latest run id and its cancellation token. Allocating an id, swapping
 * the token and publishing the reset state all happen under this lock.
 */
#[derive(Default)]
struct InFlight {
    last_run_id: u64,
    token: Option<CancellationToken>,
}

impl RunCoordinator {
    pub fn new(dispatcher: Arc<dyn Dispatcher>, catalog: Catalog) -> Self {
        let catalog = Arc::new(catalog);
        let (state, _) = watch::channel(RunState::idle(catalog.clone()));
        Self {
            dispatcher,
            catalog,
            fallback_credential: None,
            dispatch_timeout: None,
            state: Arc::new(state),
            in_flight: Mutex::new(InFlight::default()),
        }
    }

    /** \brief Credential used when a run is started with a blank one. */
    pub fn with_fallback_credential(mut self, credential: Option<String>) -> Self {
        self.fallback_credential = credential.filter(|c| !c.trim().is_empty());
        self
    }

    /** \brief Without a timeout a silent model stays `loading` indefinitely. */
    pub fn with_dispatch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn snapshot(&self) -> RunState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<RunState> {
        self.state.subscribe()
    }

    /**
     * \brief Validates the parameters, resets the run state and dispatches every model.
     *
     * Must be called from within a tokio runtime. On a validation error the
     * previous run is left as it was apart from its headline error.
     */
    pub fn start(&self, params: RunParameters) -> Result<u64, ValidationError> {
        let credential = match validation::validate(&params, self.fallback_credential.as_deref()) {
            Ok(credential) => credential,
            Err(err) => {
                telemetry::log_error("coordinator.validate", &err.to_string());
                let message = err.to_string();
                self.state
                    .send_modify(|state| state.headline_error = Some(message));
                return Err(err);
            }
        };

        let settings = params.settings();
        let (run_id, token) = {
            let mut in_flight = self.lock_in_flight();
            in_flight.last_run_id += 1;
            let run_id = in_flight.last_run_id;
            let token = CancellationToken::new();
            if let Some(previous) = in_flight.token.replace(token.clone()) {
                previous.cancel();
            }
            self.state
                .send_replace(RunState::begin(run_id, self.catalog.clone(), settings.clone()));
            (run_id, token)
        };
        telemetry::log_event(
            "coordinator.run",
            &format!(
                "run={} start models={} prompt_len={} temperature={} max_tokens={}",
                run_id,
                self.catalog.len(),
                settings.prompt.len(),
                settings.temperature,
                settings.max_tokens
            ),
        );

        let settings = Arc::new(settings);
        let credential: Arc<str> = credential.into();
        for model in self.catalog.ids() {
            let task = DispatchTask {
                run_id,
                model: model.clone(),
                settings: settings.clone(),
                credential: credential.clone(),
                dispatcher: self.dispatcher.clone(),
                state: self.state.clone(),
                timeout: self.dispatch_timeout,
                token: token.clone(),
            };
            tokio::spawn(task.run());
        }
        Ok(run_id)
    }

    /**
     * \brief Resolves with the state once the current run has fully settled.
     *
     * Never resolves if no run has been started.
     */
    pub async fn wait_settled(&self) -> RunState {
        let mut rx = self.state.subscribe();
        let settled = match rx.wait_for(RunState::is_settled).await {
            Ok(state) => Some(state.clone()),
            Err(_) => None,
        };
        settled.unwrap_or_else(|| self.snapshot())
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, InFlight> {
        match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct DispatchTask {
    run_id: u64,
    model: ModelId,
    settings: Arc<RunSettings>,
    credential: Arc<str>,
    dispatcher: Arc<dyn Dispatcher>,
    state: Arc<watch::Sender<RunState>>,
    timeout: Option<Duration>,
    token: CancellationToken,
}

impl DispatchTask {
    async fn run(self) {
        let outcome = tokio::select! {
            biased;
            _ = self.token.cancelled() => {
                telemetry::log_event(
                    "coordinator.dispatch",
                    &format!("run={} model={} superseded", self.run_id, self.model),
                );
                return;
            }
            outcome = self.dispatch() => outcome,
        };

        match &outcome {
            Ok(result) => telemetry::log_event(
                "coordinator.dispatch",
                &format!(
                    "run={} model={} complete elapsed_ms={} tokens={}",
                    self.run_id, self.model, result.elapsed_millis, result.token_usage.total
                ),
            ),
            Err(err) => telemetry::log_error(
                "coordinator.dispatch",
                &format!("run={} model={} error: {}", self.run_id, self.model, err),
            ),
        }

        let outcome = outcome.map_err(|e| e.to_string());
        let applied = self
            .state
            .send_if_modified(|state| state.settle(self.run_id, &self.model, outcome));
        if !applied {
            telemetry::log_event(
                "coordinator.dispatch",
                &format!("run={} model={} stale settlement dropped", self.run_id, self.model),
            );
        }
    }

    async fn dispatch(&self) -> Result<ModelResult, DispatchError> {
        let fut = self
            .dispatcher
            .dispatch(&self.model, &self.settings, &self.credential);
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(DispatchError::Timeout(limit))),
            None => fut.await,
        }
    }
}
