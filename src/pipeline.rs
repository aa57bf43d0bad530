//! Generic job driver.
//!
//! A job runs as an ordered list of [`Stage`]s over one typed context. A stage
//! reports an expected fatal condition through [`ContextCore::fail`]; errors and
//! panics escaping a stage are caught here and recorded the same way. Once the
//! context has failed the remaining stages are skipped, but the trailing
//! end-job step always runs and persists the final job state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::ResolvedConfig;
use crate::domain::{JobId, JobKind, JobState};
use crate::error::KiraError;
use crate::records::{Job, RecordStore};

/// State shared by every job kind's context.
#[derive(Debug, Clone)]
pub struct ContextCore {
    pub job: Job,
    failure_reason: Option<String>,
    warnings: Vec<String>,
}

impl ContextCore {
    pub fn new(job: Job) -> Self {
        Self {
            job,
            failure_reason: None,
            warnings: Vec::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    /// Marks the job as failed. The first reason wins.
    pub fn fail(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        if self.failure_reason.is_none() {
            self.failure_reason = Some(reason);
        } else {
            debug!(job_id = %self.job.id, reason = %reason, "ignoring secondary failure reason");
        }
    }

    pub fn failed(&self) -> bool {
        self.failure_reason.is_some()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn warn(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

pub trait JobContext {
    fn core(&self) -> &ContextCore;
    fn core_mut(&mut self) -> &mut ContextCore;

    /// Where the job's product ended up, if it produced one.
    fn output_location(&self) -> Option<String> {
        None
    }
}

pub type StageFn<P> = fn(&P, &mut <P as Pipeline>::Context) -> Result<(), KiraError>;

pub struct Stage<P: Pipeline> {
    pub name: &'static str,
    pub run: StageFn<P>,
}

impl<P: Pipeline> Stage<P> {
    pub fn new(name: &'static str, run: StageFn<P>) -> Self {
        Self { name, run }
    }
}

/// One implementation per job kind.
pub trait Pipeline: Sized {
    type Context: JobContext;

    fn kind(&self) -> JobKind;

    /// Builds the job's context from its freshly started record.
    fn prepare(&self, job: Job) -> Result<Self::Context, KiraError>;

    fn stages(&self) -> Vec<Stage<Self>>;

    /// Runs inside the mandatory end-job step, whether or not the job failed.
    fn end_job(&self, _context: &mut Self::Context) -> Result<(), KiraError> {
        Ok(())
    }
}

/// What an external notifier needs to know about a finished job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobOutcome {
    pub job_id: JobId,
    pub kind: JobKind,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub output_location: Option<String>,
    pub warnings: Vec<String>,
}

pub struct PipelineExecutor<'a, S: RecordStore> {
    store: &'a S,
    config: &'a ResolvedConfig,
}

impl<'a, S: RecordStore> PipelineExecutor<'a, S> {
    pub fn new(store: &'a S, config: &'a ResolvedConfig) -> Self {
        Self { store, config }
    }

    pub fn run<P: Pipeline>(&self, job_id: JobId, pipeline: &P) -> Result<JobOutcome, KiraError> {
        let mut job = self.store.job(job_id)?;
        if job.kind != pipeline.kind() {
            return Err(KiraError::JobKindMismatch {
                job_id: job_id.get(),
                expected: pipeline.kind().to_string(),
                actual: job.kind.to_string(),
            });
        }
        if job.state.is_terminal() {
            return Err(KiraError::JobTerminal {
                job_id: job_id.get(),
                state: job.state.to_string(),
            });
        }

        job.start(Utc::now());
        self.store.save_job(&job)?;
        info!(job_id = %job_id, kind = %job.kind, retry_count = job.retry_count, "job started");

        let mut context = match pipeline.prepare(job.clone()) {
            Ok(context) => context,
            Err(err) => {
                error!(job_id = %job_id, error = %err, "job preparation failed");
                let reason = err.to_string();
                job.finish(Some(&reason), self.config.failure_reason_max_len, Utc::now());
                self.store.save_job(&job)?;
                return Ok(JobOutcome {
                    job_id,
                    kind: job.kind,
                    success: false,
                    failure_reason: job.failure_reason.clone(),
                    output_location: None,
                    warnings: Vec::new(),
                });
            }
        };

        for stage in pipeline.stages() {
            if context.core().failed() {
                debug!(job_id = %job_id, stage = stage.name, "skipping stage after failure");
                continue;
            }
            debug!(job_id = %job_id, stage = stage.name, "running stage");
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (stage.run)(pipeline, &mut context)));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(job_id = %job_id, stage = stage.name, error = %err, "stage failed");
                    context.core_mut().fail(err.to_string());
                }
                Err(payload) => {
                    let err = KiraError::StagePanicked {
                        stage: stage.name.to_string(),
                        message: panic_message(payload.as_ref()),
                    };
                    error!(job_id = %job_id, stage = stage.name, error = %err, "stage panicked");
                    context.core_mut().fail(err.to_string());
                }
            }
        }

        self.end_job(pipeline, context)
    }

    fn end_job<P: Pipeline>(
        &self,
        pipeline: &P,
        mut context: P::Context,
    ) -> Result<JobOutcome, KiraError> {
        let hook = panic::catch_unwind(AssertUnwindSafe(|| pipeline.end_job(&mut context)));
        match hook {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(job_id = %context.core().job_id(), error = %err, "end job hook failed");
                context.core_mut().fail(err.to_string());
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(job_id = %context.core().job_id(), message = %message, "end job hook panicked");
                context.core_mut().fail(KiraError::StagePanicked {
                    stage: "end_job".to_string(),
                    message,
                }
                .to_string());
            }
        }

        let output_location = context.output_location();
        let core = context.core_mut();
        let reason = core.failure_reason().map(str::to_string);
        core.job
            .finish(reason.as_deref(), self.config.failure_reason_max_len, Utc::now());
        self.store.save_job(&core.job)?;

        let success = core.job.state == JobState::Succeeded;
        if success {
            info!(job_id = %core.job.id, warnings = core.warnings().len(), "job succeeded");
        } else {
            warn!(
                job_id = %core.job.id,
                reason = core.job.failure_reason.as_deref().unwrap_or_default(),
                "job failed"
            );
        }

        Ok(JobOutcome {
            job_id: core.job.id,
            kind: core.job.kind,
            success,
            failure_reason: core.job.failure_reason.clone(),
            output_location: if success { output_location } else { None },
            warnings: core.warnings().to_vec(),
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        return (*message).to_string();
    }
    if let Some(message) = payload.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
