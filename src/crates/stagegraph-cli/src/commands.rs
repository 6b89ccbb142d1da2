//! Command implementations behind the `stagegraph` binary

use stagegraph_checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore};
use stagegraph_content::{
    build_workflow, load_order, mock, Collaborators, OrderFields, StageContext,
};
use stagegraph_core::{Engine, Scheduler, TracingRecorder, WorkflowSnapshot};
use std::path::Path;
use std::sync::Arc;
use tokio::fs;
use tracing::info;

use crate::config::{AppConfig, CheckpointBackend};
use crate::error::{CliError, Result};

pub type OrderSnapshot = WorkflowSnapshot<OrderFields>;

/// The configured engine with its checkpoint store
pub struct App {
    config: AppConfig,
    engine: Arc<Engine<OrderFields>>,
}

impl App {
    /// App over the offline collaborators
    pub async fn offline(config: AppConfig) -> Result<Self> {
        Self::with_collaborators(config, mock::offline_collaborators()).await
    }

    pub async fn with_collaborators(config: AppConfig, collaborators: Collaborators) -> Result<Self> {
        let store: Arc<dyn CheckpointStore> = match config.checkpoint.backend {
            CheckpointBackend::Memory => Arc::new(InMemoryCheckpointStore::new()),
            CheckpointBackend::File => {
                Arc::new(FileCheckpointStore::open(config.checkpoint.path.clone()).await?)
            }
        };

        let collaborators = collaborators.with_policies(config.collaborators.policies());
        let ctx = StageContext::new(collaborators, config.content.clone());
        let engine = Engine::new(build_workflow(ctx)?, store)
            .with_config(&config.engine_config())?
            .with_recorder(Arc::new(TracingRecorder));

        Ok(Self {
            config,
            engine: Arc::new(engine),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn engine(&self) -> &Arc<Engine<OrderFields>> {
        &self.engine
    }

    /// Run an order file; the workflow id defaults to the order id
    pub async fn run(&self, order_path: &Path, id: Option<String>) -> Result<OrderSnapshot> {
        let order = load_order(order_path).await?;
        let workflow_id = id.unwrap_or_else(|| order.order_id.clone());
        let fields = OrderFields::from_order(&order, self.config.content.words_per_page);
        info!(workflow_id = %workflow_id, order = %order_path.display(), "Running order");
        Ok(self.engine.run(&workflow_id, fields).await?)
    }

    pub async fn resume(&self, workflow_id: &str) -> Result<OrderSnapshot> {
        Ok(self.engine.resume(workflow_id).await?)
    }

    pub async fn status(&self, workflow_id: &str) -> Result<OrderSnapshot> {
        self.engine
            .inspect(workflow_id)
            .await?
            .ok_or_else(|| CliError::NotFound(workflow_id.to_string()))
    }

    pub async fn clear(&self, workflow_id: &str) -> Result<()> {
        if self.engine.inspect(workflow_id).await?.is_none() {
            return Err(CliError::NotFound(workflow_id.to_string()));
        }
        Ok(self.engine.clear(workflow_id).await?)
    }

    /// Workflow outline with the effective loop ceilings
    pub fn graph(&self) -> String {
        self.engine.workflow().describe()
    }

    /// Run (or resume) every `*.json` order in `dir` through the scheduler
    pub async fn batch(&self, dir: &Path) -> Result<Vec<(String, Result<OrderSnapshot>)>> {
        let mut paths = Vec::new();
        let mut entries = fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(false, |ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut jobs = Vec::new();
        let mut rejected = Vec::new();
        for path in paths {
            match load_order(&path).await {
                Ok(order) => {
                    let fields = OrderFields::from_order(&order, self.config.content.words_per_page);
                    jobs.push((order.order_id, fields));
                }
                Err(e) => rejected.push((path.display().to_string(), Err(CliError::from(e)))),
            }
        }
        info!(orders = jobs.len(), rejected = rejected.len(), dir = %dir.display(), "Running batch");

        let scheduler = Scheduler::from_config(self.engine.clone(), &self.config.engine);
        let mut results: Vec<(String, Result<OrderSnapshot>)> = scheduler
            .run_batch(jobs)
            .await
            .into_iter()
            .map(|(id, outcome)| (id, outcome.map_err(CliError::from)))
            .collect();
        results.extend(rejected);
        Ok(results)
    }
}

/// Short report of a finished or checkpointed workflow
pub fn render_summary(snapshot: &OrderSnapshot) -> String {
    let mut out = format!(
        "workflow: {}\nphase: {:?}\nstatus: {}\nsteps: {}\n",
        snapshot.workflow_id, snapshot.phase, snapshot.status, snapshot.steps
    );
    if let Some(error) = &snapshot.error {
        out.push_str(&format!("error: {}\n", error));
    }
    let fields = &snapshot.fields;
    out.push_str(&format!(
        "words: {} (target {})\nsources: {}\n",
        fields.word_count,
        fields.target_word_count,
        fields.sources_found.len()
    ));
    let loops: Vec<String> = snapshot
        .attempts
        .iter()
        .filter(|(_, n)| *n > 0)
        .map(|(key, n)| format!("{}={}", key, n))
        .collect();
    if !loops.is_empty() {
        out.push_str(&format!("attempts: {}\n", loops.join(", ")));
    }
    out
}

/// Summary followed by the audit log
pub fn render_status(snapshot: &OrderSnapshot) -> String {
    let mut out = render_summary(snapshot);
    out.push_str("audit:\n");
    for line in &snapshot.audit_log {
        out.push_str(&format!("  {}\n", line));
    }
    out
}
