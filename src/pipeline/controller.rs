//! Pipeline Controller
//!
//! Runs one request through retrieval, generation, validation, execution and
//! summarization. Only the single regeneration edge retries; summarization
//! failures degrade the answer; everything else ends the request.
//!
//! Cancellation is a `CancellationToken`. It is checked before each stage
//! and raced against every stage in flight.

use crate::config::{GatewayConfig, RetrievalFallback};
use crate::error::{GatewayError, Result};
use crate::execution::{AnalyticalEngine, ExecutionResult, ExecutionStage};
use crate::generation::{CandidateQuery, GenerationGuidance, SqlGenerator};
use crate::llm::TextModel;
use crate::metadata::{MetadataSnapshot, MetadataStore};
use crate::pipeline::envelope::{error_kind, error_reason, PipelineFailure, PipelineRequest, PipelineResponse};
use crate::pipeline::state::{PipelineState, Stage, StateTrace};
use crate::schema_rag::{Embedder, RetrievalContext, RetrievalStage, VectorIndex};
use crate::summarization::{summarize_rows, Answer, SummarizationStage, TableView};
use crate::validation::ValidationStage;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Generation invocations allowed per request, retries included.
pub const MAX_GENERATIONS: usize = 2;

/// External capabilities the controller drives.
#[derive(Clone)]
pub struct PipelineDeps {
    pub metadata: Arc<MetadataStore>,
    pub embedder: Arc<dyn Embedder>,
    pub index: Arc<dyn VectorIndex>,
    pub generator: Arc<dyn SqlGenerator>,
    pub engine: Arc<dyn AnalyticalEngine>,
    pub summarizer: Arc<dyn TextModel>,
}

pub struct PipelineController {
    metadata: Arc<MetadataStore>,
    retrieval: RetrievalStage,
    generator: Arc<dyn SqlGenerator>,
    validation: ValidationStage,
    execution: ExecutionStage,
    summarization: SummarizationStage,
    fallback: RetrievalFallback,
    allow_regeneration: bool,
    retrieval_timeout: Duration,
    generation_timeout: Duration,
}

/// Per-request bookkeeping.
struct Run {
    request_id: Uuid,
    started: Instant,
    trace: StateTrace,
    warnings: Vec<String>,
    sql_shown: Option<String>,
    fixes_applied: Vec<String>,
}

impl Run {
    fn new(request_id: Uuid) -> Self {
        Self {
            request_id,
            started: Instant::now(),
            trace: StateTrace::new(),
            warnings: Vec::new(),
            sql_shown: None,
            fixes_applied: Vec::new(),
        }
    }

    fn enter(&mut self, state: PipelineState) {
        if !self.trace.advance(state.clone()) {
            error!(
                "[{}] Illegal transition {:?} -> {:?}",
                self.request_id,
                self.trace.current(),
                state
            );
        }
    }

    fn fail(mut self, stage: Stage, kind: &str, reason: String) -> PipelineFailure {
        warn!("[{}] {} failed: {}", self.request_id, stage, reason);
        self.enter(PipelineState::Failed {
            stage,
            reason: reason.clone(),
        });
        PipelineFailure {
            request_id: self.request_id,
            stage,
            kind: kind.to_string(),
            reason,
            sql_shown: self.sql_shown,
            fixes_applied: self.fixes_applied,
            generation_attempts: self.trace.generations(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            trace: self.trace.into_states(),
        }
    }

    fn fail_with(self, stage: Stage, err: &GatewayError) -> PipelineFailure {
        self.fail(stage, error_kind(err), error_reason(err))
    }

    /// Stop forwarding when the caller has cancelled.
    fn checkpoint(self, next: Stage, cancel: &CancellationToken) -> std::result::Result<Self, PipelineFailure> {
        if cancel.is_cancelled() {
            info!("[{}] Cancelled before {}", self.request_id, next);
            return Err(self.fail(next, "cancelled", "request cancelled".to_string()));
        }
        Ok(self)
    }
}

async fn with_timeout<T, F>(stage: Stage, limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout {
            stage,
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

/// Race a stage against the caller's token. A cancelled stage is dropped
/// where it stands.
async fn cancellable<T, F>(stage: Stage, cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GatewayError::Cancelled { stage }),
        result = fut => result,
    }
}

impl PipelineController {
    pub fn new(config: &GatewayConfig, deps: PipelineDeps) -> Self {
        Self {
            metadata: deps.metadata,
            retrieval: RetrievalStage::new(deps.embedder, deps.index, config.retrieval.top_k),
            generator: deps.generator,
            validation: ValidationStage::new(config.validation.rename_threshold),
            execution: ExecutionStage::new(deps.engine, config.execution.row_ceiling, config.execution.timeout()),
            summarization: SummarizationStage::new(
                deps.summarizer,
                config.llm.max_tokens,
                config.timeouts.summarization(),
            ),
            fallback: config.retrieval.fallback,
            allow_regeneration: config.validation.allow_regeneration,
            retrieval_timeout: config.timeouts.retrieval(),
            generation_timeout: config.timeouts.generation(),
        }
    }

    pub fn metadata(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    pub fn engine(&self) -> &Arc<dyn AnalyticalEngine> {
        self.execution.engine()
    }

    /// Answer a natural-language question.
    pub async fn run(
        &self,
        request: &PipelineRequest,
        cancel: &CancellationToken,
    ) -> std::result::Result<PipelineResponse, PipelineFailure> {
        let mut run = Run::new(request.request_id);
        let question = request.question.trim();
        info!("[{}] Received question: {}", run.request_id, question);

        if question.is_empty() {
            return Err(run.fail(Stage::Retrieval, "invalid_request", "question must not be empty".to_string()));
        }

        // One snapshot for the whole request.
        let snapshot = self.metadata.get_snapshot();

        run = run.checkpoint(Stage::Retrieval, cancel)?;
        run.enter(PipelineState::Retrieving);
        let context = match cancellable(
            Stage::Retrieval,
            cancel,
            with_timeout(
                Stage::Retrieval,
                self.retrieval_timeout,
                self.retrieval.retrieve(question, &snapshot),
            ),
        )
        .await
        {
            Ok(context) => context,
            Err(e @ GatewayError::Cancelled { .. }) => return Err(run.fail_with(Stage::Retrieval, &e)),
            Err(e) => match self.fallback {
                RetrievalFallback::Degraded => {
                    warn!("[{}] Retrieval unavailable, continuing degraded: {}", run.request_id, e);
                    run.warnings
                        .push(format!("schema retrieval unavailable ({}); answered without schema context", error_reason(&e)));
                    RetrievalContext::degraded(question, snapshot.version())
                }
                RetrievalFallback::Fail => {
                    let err = match e {
                        GatewayError::Timeout { .. } => e,
                        other => GatewayError::RetrievalUnavailable(error_reason(&other)),
                    };
                    return Err(run.fail_with(Stage::Retrieval, &err));
                }
            },
        };
        info!(
            "[{}] Retrieved {} hits across {} tables",
            run.request_id,
            context.hits.len(),
            context.grouped_tables.len()
        );

        let mut guidance = GenerationGuidance::normal();
        let accepted = loop {
            run = run.checkpoint(Stage::Generation, cancel)?;
            run.enter(PipelineState::Generating);
            let attempt = run.trace.generations();

            let candidate = match cancellable(
                Stage::Generation,
                cancel,
                with_timeout(
                    Stage::Generation,
                    self.generation_timeout,
                    self.generator.generate(question, &context, &guidance),
                ),
            )
            .await
            {
                Ok(candidate) => candidate,
                Err(e @ GatewayError::Cancelled { .. }) => return Err(run.fail_with(Stage::Generation, &e)),
                Err(e) if attempt < MAX_GENERATIONS => {
                    warn!("[{}] Generation attempt {} failed, retrying strict: {}", run.request_id, attempt, e);
                    guidance = match guidance.feedback.take() {
                        Some(feedback) => GenerationGuidance::strict().with_feedback(feedback),
                        None => GenerationGuidance::strict(),
                    };
                    continue;
                }
                Err(e) => {
                    let err = match e {
                        GatewayError::Timeout { .. } | GatewayError::GenerationFailed(_) => e,
                        other => GatewayError::GenerationFailed(error_reason(&other)),
                    };
                    return Err(run.fail_with(Stage::Generation, &err));
                }
            };
            info!("[{}] Candidate SQL (attempt {}): {}", run.request_id, attempt, candidate.raw_text);

            run = run.checkpoint(Stage::Validation, cancel)?;
            run.enter(PipelineState::Validating);
            let outcome = self.validation.validate(&candidate, &snapshot);
            if outcome.is_valid() {
                run.fixes_applied = outcome.report.fixes_applied;
                break outcome.query;
            }

            let Some(rejection) = outcome.rejection else {
                return Err(run.fail(Stage::Validation, "validation_rejected", "rejected".to_string()));
            };
            run.sql_shown = Some(candidate.raw_text.clone());
            run.fixes_applied = outcome.report.fixes_applied;

            let may_regenerate =
                self.allow_regeneration && rejection.kind.is_regenerable() && attempt < MAX_GENERATIONS;
            if !may_regenerate {
                return Err(run.fail_with(Stage::Validation, &GatewayError::ValidationRejected(rejection)));
            }
            info!("[{}] Regenerating after rejection: {}", run.request_id, rejection.reason);
            guidance = GenerationGuidance::normal().with_feedback(self.validation.feedback(&rejection, &candidate, &snapshot));
        };

        self.finish(run, question, accepted, &snapshot, cancel, true).await
    }

    /// Run caller-supplied SQL through validation and execution. No model is
    /// involved; the answer carries only the plain summary.
    pub async fn run_sql(
        &self,
        request_id: Uuid,
        sql: &str,
        cancel: &CancellationToken,
    ) -> std::result::Result<PipelineResponse, PipelineFailure> {
        let mut run = Run::new(request_id);
        run.sql_shown = Some(sql.to_string());
        info!("[{}] Received SQL: {}", request_id, sql);
        let snapshot = self.metadata.get_snapshot();

        let candidate = CandidateQuery::from_sql(sql);

        run = run.checkpoint(Stage::Validation, cancel)?;
        run.enter(PipelineState::Validating);
        let outcome = self.validation.validate(&candidate, &snapshot);
        run.fixes_applied = outcome.report.fixes_applied.clone();
        if let Some(rejection) = outcome.rejection {
            return Err(run.fail_with(Stage::Validation, &GatewayError::ValidationRejected(rejection)));
        }

        self.finish(run, sql, outcome.query, &snapshot, cancel, false).await
    }

    async fn finish(
        &self,
        mut run: Run,
        question: &str,
        query: CandidateQuery,
        snapshot: &MetadataSnapshot,
        cancel: &CancellationToken,
        narrate: bool,
    ) -> std::result::Result<PipelineResponse, PipelineFailure> {
        run.sql_shown = Some(query.raw_text.clone());
        run = run.checkpoint(Stage::Execution, cancel)?;
        run.enter(PipelineState::Executing);
        let (sql_shown, result) = match cancellable(Stage::Execution, cancel, self.execution.execute(&query.raw_text)).await {
            Ok(executed) => executed,
            Err(e) => return Err(run.fail_with(Stage::Execution, &e)),
        };
        run.sql_shown = Some(sql_shown.clone());
        if result.truncated {
            run.warnings.push(format!(
                "result truncated to {} rows",
                self.execution.row_ceiling()
            ));
        }

        run = run.checkpoint(Stage::Summarization, cancel)?;
        run.enter(PipelineState::Summarizing);
        let answer = if narrate {
            let summarized = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                answer = self.summarization.summarize(question, &sql_shown, &result) => Some(answer),
            };
            match summarized {
                Some(answer) => answer,
                None => {
                    return Err(run.fail_with(
                        Stage::Summarization,
                        &GatewayError::Cancelled {
                            stage: Stage::Summarization,
                        },
                    ))
                }
            }
        } else {
            plain_answer(&result)
        };
        if let Some(reason) = &answer.degraded {
            run.warnings.push(format!("summarization degraded: {}", reason));
        }
        run.enter(PipelineState::Completed);

        let elapsed_ms = run.started.elapsed().as_millis() as u64;
        info!(
            "[{}] Completed: {} rows, {} fixes, {} warnings in {}ms",
            run.request_id,
            result.row_count,
            run.fixes_applied.len(),
            run.warnings.len(),
            elapsed_ms
        );
        let generation_attempts = run.trace.generations();
        Ok(PipelineResponse {
            request_id: run.request_id,
            question: question.to_string(),
            sql_shown,
            answer_text: answer.text().to_string(),
            explanation: answer.explanation,
            summary: answer.summary,
            columns: answer.table.columns,
            rows: answer.table.rows,
            markdown: answer.table.markdown,
            row_count: result.row_count,
            truncated: result.truncated,
            fixes_applied: run.fixes_applied,
            warnings: run.warnings,
            generation_attempts,
            snapshot_version: snapshot.version(),
            elapsed_ms,
            trace: run.trace.into_states(),
        })
    }
}

fn plain_answer(result: &ExecutionResult) -> Answer {
    Answer {
        explanation: None,
        table: TableView::from_result(result),
        summary: summarize_rows(result),
        degraded: None,
    }
}
