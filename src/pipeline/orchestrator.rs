//! Query pipeline orchestrator.
//!
//! The end-to-end state machine: relevancy and schema retrieval run
//! concurrently, relevancy is always consulted first, analysis produces a
//! verdict, destructive statements pause for confirmation, failed
//! executions go through the healer, schema-mutating statements trigger a
//! graph refresh, and memory persistence runs in the background after the
//! stream has ended. Events stream to the caller in order as they happen.

use crate::agents::{
    AnalysisAgent, AnalysisVerdict, FollowUpAgent, HealerAgent, RelevancyAgent,
    ResponseFormatterAgent,
};
use crate::config::{Config, SHORT_MEMORY_LENGTH};
use crate::embedding::EmbeddingProvider;
use crate::error::{Result, Text2SqlError};
use crate::graph::{get_db_description, GraphClient, GraphParams};
use crate::llm::ChatCompletion;
use crate::loader::{DatabaseType, LoaderRegistry, Row, SqlLoader};
use crate::memory::{MemoryStore, TurnRecord};
use crate::pipeline::cancel::CancelToken;
use crate::pipeline::destructive::{self, GateDecision};
use crate::pipeline::events::{EventKind, PipelineEvent};
use crate::pipeline::history::ConversationHistory;
use crate::pipeline::refresh::refresh_schema;
use crate::pipeline::supervisor::TaskSupervisor;
use crate::schema_rag::descriptions::DescriptionGenerator;
use crate::schema_rag::{SchemaRetriever, TableDescriptor};
use crate::sql_sanitizer;
use crate::util::sanitize_query;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 32;

/// One chat turn arriving from the caller: the question history, prior
/// results, and optional free-text instructions.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub chat: Vec<String>,
    pub result: Option<Vec<String>>,
    pub instructions: Option<String>,
}

/// Confirmation reply for a previously proposed destructive statement.
#[derive(Debug, Clone, Default)]
pub struct ConfirmRequest {
    pub sql_query: String,
    pub confirmation: String,
    pub chat: Vec<String>,
}

/// Ordered event stream handed back to the transport layer.
pub type EventStream = mpsc::Receiver<PipelineEvent>;

#[derive(Clone)]
struct EventSink {
    tx: mpsc::Sender<PipelineEvent>,
}

impl EventSink {
    async fn send(&self, event: PipelineEvent) {
        // A dropped receiver means the client went away; the pipeline
        // finishes quietly.
        let _ = self.tx.send(event).await;
    }
}

#[derive(Clone)]
pub struct QueryPipeline {
    config: Config,
    graph: Arc<dyn GraphClient>,
    llm: Arc<dyn ChatCompletion>,
    embedder: Arc<dyn EmbeddingProvider>,
    loaders: LoaderRegistry,
    memory: Arc<dyn MemoryStore>,
    supervisor: Arc<TaskSupervisor>,
}

impl QueryPipeline {
    pub fn new(
        config: Config,
        graph: Arc<dyn GraphClient>,
        llm: Arc<dyn ChatCompletion>,
        embedder: Arc<dyn EmbeddingProvider>,
        loaders: LoaderRegistry,
        memory: Arc<dyn MemoryStore>,
    ) -> Self {
        Self {
            config,
            graph,
            llm,
            embedder,
            loaders,
            memory,
            supervisor: Arc::new(TaskSupervisor::new()),
        }
    }

    /// Background-task supervisor for this pipeline. Tests join it to
    /// await memory persistence deterministically.
    pub fn supervisor(&self) -> Arc<TaskSupervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Run one query turn. Validates the request, then streams events as
    /// the pipeline advances. The last event carries `final_response=true`
    /// unless the run pauses for destructive confirmation.
    pub fn run(&self, graph_id: &str, request: ChatRequest) -> Result<EventStream> {
        if request.chat.is_empty() {
            return Err(Text2SqlError::InvalidArgument("Empty chat history".to_string()));
        }

        let mut history =
            ConversationHistory::new(request.chat, request.result.unwrap_or_default());
        history.truncate(SHORT_MEMORY_LENGTH);

        let question = history.current_question().unwrap_or_default();
        info!("User Query: {}", sanitize_query(question));

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let sink = EventSink { tx };
        let pipeline = self.clone();
        let graph_id = graph_id.to_string();
        let instructions = request.instructions;
        let request_id = Uuid::new_v4();

        tokio::spawn(
            async move {
                pipeline
                    .run_stream(&graph_id, history, instructions, sink)
                    .await;
            }
            .instrument(info_span!("query_pipeline", request_id = %request_id)),
        );

        Ok(rx)
    }

    async fn run_stream(
        &self,
        graph_id: &str,
        history: ConversationHistory,
        instructions: Option<String>,
        sink: EventSink,
    ) {
        let overall_start = Instant::now();
        let question = history.current_question().unwrap_or_default().to_string();
        info!(
            "Starting query processing pipeline for query: {}",
            sanitize_query(&question)
        );

        sink.send(PipelineEvent::reasoning(
            "Step 1: Analyzing user query and generating SQL...",
        ))
        .await;

        let (db_description, db_url) = match get_db_description(self.graph.as_ref(), graph_id).await
        {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to read database description: {}", e);
                sink.send(PipelineEvent::error_terminal(e.user_message())).await;
                return;
            }
        };

        let Some((db_type, loader)) = self.loaders.loader_for_url(&db_url) else {
            info!(
                "Query processing failed (no loader) - Total time: {:.2} seconds",
                overall_start.elapsed().as_secs_f64()
            );
            sink.send(PipelineEvent::error_terminal("Unable to determine database type"))
                .await;
            return;
        };

        // Relevancy and retrieval start together; relevancy is always
        // consulted first, retrieval results are held pending (or
        // cancelled) until it lands.
        let cancel = CancelToken::new();
        let retrieval_handle = {
            let retriever = SchemaRetriever::new(
                Arc::clone(&self.graph),
                Arc::clone(&self.embedder),
                DescriptionGenerator::new(Arc::clone(&self.llm)),
            );
            let graph_id = graph_id.to_string();
            let history = history.clone();
            let db_description = db_description.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                retriever.find(&graph_id, &history, &db_description, &token).await
            })
        };

        let relevancy_handle = {
            let mut agent = RelevancyAgent::new(Arc::clone(&self.llm), &history);
            let question = question.clone();
            let db_description = db_description.clone();
            tokio::spawn(async move { agent.classify(&question, &db_description).await })
        };

        info!("Starting relevancy check and graph analysis concurrently");

        let relevancy = match relevancy_handle.await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                error!("Relevancy classification failed: {}", e);
                cancel.cancel();
                let _ = retrieval_handle.await;
                sink.send(PipelineEvent::error_terminal(e.user_message())).await;
                return;
            }
            Err(e) => {
                error!("Relevancy task panicked: {}", e);
                cancel.cancel();
                let _ = retrieval_handle.await;
                sink.send(PipelineEvent::error_terminal("Internal server error")).await;
                return;
            }
        };

        if !relevancy.is_on_topic() {
            // Cancel the retrieval task and wait for it to acknowledge; no
            // orphaned graph work may outlive the turn.
            cancel.cancel();
            match retrieval_handle.await {
                Ok(Err(Text2SqlError::Cancelled(_))) | Ok(Ok(_)) => {
                    info!("Find task cancelled due to off-topic query")
                }
                Ok(Err(e)) => warn!("Retrieval failed during off-topic cancellation: {}", e),
                Err(e) => warn!("Retrieval task join error: {}", e),
            }

            info!("SQL Fail reason: {}", sanitize_query(&relevancy.reason));
            sink.send(PipelineEvent::terminal(EventKind::FollowupQuestions {
                message: format!("Off topic question: {}", relevancy.reason),
                missing_information: String::new(),
                ambiguities: String::new(),
            }))
            .await;
            info!(
                "Query processing completed (off-topic) - Total time: {:.2} seconds",
                overall_start.elapsed().as_secs_f64()
            );
            return;
        }

        let schema = match retrieval_handle.await {
            Ok(Ok(schema)) => schema,
            Ok(Err(e)) => {
                error!("Schema retrieval failed: {}", e);
                sink.send(PipelineEvent::error_terminal(e.user_message())).await;
                return;
            }
            Err(e) => {
                error!("Retrieval task panicked: {}", e);
                sink.send(PipelineEvent::error_terminal("Internal server error")).await;
                return;
            }
        };

        info!(
            "Calling analysis agent with query: {}",
            sanitize_query(&question)
        );

        // Best-effort memory recall; a missing memory backend never stops
        // the turn.
        let memory_context = match self.memory.search_memories(&question).await {
            Ok(context) => context,
            Err(e) => {
                warn!("Memory search failed: {}", e);
                String::new()
            }
        };

        info!("Starting SQL generation with analysis agent");
        let mut analysis_agent = AnalysisAgent::new(Arc::clone(&self.llm), &history);
        let mut verdict = match analysis_agent
            .analyze(
                &question,
                &schema,
                &db_description,
                instructions.as_deref(),
                Some(&memory_context).filter(|c| !c.is_empty()).map(|c| c.as_str()),
                Some(db_type),
            )
            .await
        {
            Ok(verdict) => verdict,
            Err(e) => {
                error!("Analysis failed: {}", e);
                sink.send(PipelineEvent::error_terminal(e.user_message())).await;
                return;
            }
        };

        info!("Generated SQL query: {}", sanitize_query(&verdict.sql_query));
        sink.send(PipelineEvent::step(EventKind::SqlQuery {
            data: verdict.sql_query.clone(),
            conf: verdict.confidence,
            miss: verdict.missing_information.clone(),
            amb: verdict.ambiguities.clone(),
            exp: verdict.explanation.clone(),
            is_valid: verdict.is_sql_translatable,
        }))
        .await;

        if verdict.is_sql_translatable {
            self.execute_branch(
                graph_id,
                &question,
                &history,
                &mut verdict,
                &schema,
                db_type,
                loader,
                &db_url,
                &db_description,
                &sink,
                overall_start,
            )
            .await;
        } else {
            // Not translatable: help the user supply what is missing.
            let follow_up_agent = FollowUpAgent::new(Arc::clone(&self.llm));
            let follow_up = follow_up_agent
                .generate(&question, &verdict)
                .await
                .unwrap_or_default();

            sink.send(PipelineEvent::terminal(EventKind::FollowupQuestions {
                message: follow_up.clone(),
                missing_information: verdict.missing_information.clone(),
                ambiguities: verdict.ambiguities.clone(),
            }))
            .await;

            info!(
                "Query processing completed (non-translatable SQL) - Total time: {:.2} seconds",
                overall_start.elapsed().as_secs_f64()
            );

            self.schedule_memory_tasks(
                &question,
                &verdict.sql_query,
                &follow_up,
                Some("Missing information".to_string()),
                &history,
            );
        }
    }

    /// The translatable branch: gate, execute, heal, refresh, format.
    #[allow(clippy::too_many_arguments)]
    async fn execute_branch(
        &self,
        graph_id: &str,
        question: &str,
        history: &ConversationHistory,
        verdict: &mut AnalysisVerdict,
        schema: &[TableDescriptor],
        db_type: DatabaseType,
        loader: Arc<dyn SqlLoader>,
        db_url: &str,
        db_description: &str,
        sink: &EventSink,
        overall_start: Instant,
    ) {
        // Auto-quote table names with special characters before anything
        // else touches the statement.
        let known_tables: HashSet<String> = schema.iter().map(|t| t.name.clone()).collect();
        let (sanitized_sql, was_modified) = sql_sanitizer::auto_quote_identifiers(
            &verdict.sql_query,
            &known_tables,
            sql_sanitizer::quote_char(db_type),
        );
        if was_modified {
            info!("SQL query auto-sanitized: quoted table names with special characters");
            verdict.sql_query = sanitized_sql;
        }

        let sql_query = verdict.sql_query.clone();

        match destructive::evaluate(&sql_query, self.config.is_demo_graph(graph_id)) {
            GateDecision::RequireConfirmation { operation_type } => {
                sink.send(PipelineEvent::step(EventKind::DestructiveConfirmation {
                    message: destructive::confirmation_message(&sql_query, &operation_type),
                    sql_query: sql_query.clone(),
                    operation_type,
                }))
                .await;
                info!(
                    "Query processing halted for confirmation - Total time: {:.2} seconds",
                    overall_start.elapsed().as_secs_f64()
                );
                // Stop here and wait for a separate confirmation call; no
                // terminal event is emitted.
                return;
            }
            GateDecision::Deny { reason } => {
                sink.send(PipelineEvent::error_terminal(reason.clone())).await;
                self.schedule_memory_tasks(question, &sql_query, "", Some(reason), history);
                return;
            }
            GateDecision::Execute => {}
        }

        sink.send(PipelineEvent::reasoning("Step 2: Executing SQL query")).await;

        let (is_schema_modifying, operation_type) = loader.is_schema_modifying_query(&sql_query);

        let rows = match loader.execute_sql_query(&sql_query, db_url).await {
            Ok(rows) => rows,
            Err(exec_error) => {
                match self
                    .heal_and_execute(
                        question,
                        verdict,
                        db_type,
                        Arc::clone(&loader),
                        db_url,
                        db_description,
                        &exec_error,
                        sink,
                    )
                    .await
                {
                    Some(rows) => rows,
                    None => {
                        // Exhausted: surface the original pre-healing error.
                        error!("Error executing SQL query: {}", exec_error);
                        info!(
                            "Query processing failed during execution - Total time: {:.2} seconds",
                            overall_start.elapsed().as_secs_f64()
                        );
                        sink.send(PipelineEvent::error_terminal("Error executing SQL query"))
                            .await;
                        self.schedule_memory_tasks(
                            question,
                            &verdict.sql_query,
                            "",
                            Some(exec_error.to_string()),
                            history,
                        );
                        return;
                    }
                }
            }
        };

        if !rows.is_empty() {
            sink.send(PipelineEvent::step(EventKind::QueryResult { data: rows.clone() }))
                .await;
        }

        if is_schema_modifying {
            sink.send(PipelineEvent::reasoning(
                "Step 3: Schema change detected - refreshing graph...",
            ))
            .await;
            let refresh_event =
                refresh_schema(loader.as_ref(), graph_id, db_url, &operation_type).await;
            sink.send(PipelineEvent::step(refresh_event)).await;
        }

        let step_num = if is_schema_modifying { "4" } else { "3" };
        sink.send(PipelineEvent::reasoning(format!(
            "Step {}: Generating user-friendly response",
            step_num
        )))
        .await;

        let formatter = ResponseFormatterAgent::new(Arc::clone(&self.llm));
        let answer = match formatter
            .format_response(question, &verdict.sql_query, &rows, db_description)
            .await
        {
            Ok(answer) => answer,
            Err(e) => {
                error!("Response formatting failed: {}", e);
                sink.send(PipelineEvent::error_terminal(e.user_message())).await;
                self.schedule_memory_tasks(
                    question,
                    &verdict.sql_query,
                    "",
                    Some(e.to_string()),
                    history,
                );
                return;
            }
        };

        sink.send(PipelineEvent::terminal(EventKind::AiResponse { message: answer.clone() }))
            .await;

        info!(
            "Query processing completed successfully - Total time: {:.2} seconds",
            overall_start.elapsed().as_secs_f64()
        );

        self.schedule_memory_tasks(question, &verdict.sql_query, &answer, None, history);
    }

    /// Bounded healing loop. Returns the healed rows on success; `None`
    /// when attempts are exhausted (the caller surfaces the original
    /// error). On success the verdict's SQL is replaced with the healed
    /// statement before anything downstream sees it.
    #[allow(clippy::too_many_arguments)]
    async fn heal_and_execute(
        &self,
        question: &str,
        verdict: &mut AnalysisVerdict,
        db_type: DatabaseType,
        loader: Arc<dyn SqlLoader>,
        db_url: &str,
        db_description: &str,
        exec_error: &Text2SqlError,
        sink: &EventSink,
    ) -> Option<Vec<Row>> {
        sink.send(PipelineEvent::reasoning(
            "Step 2a: SQL execution failed, attempting to heal query...",
        ))
        .await;

        let healer = HealerAgent::new(Arc::clone(&self.llm));
        let mut session = healer.start_session(
            &verdict.sql_query,
            &exec_error.to_string(),
            self.config.max_healing_attempts,
        );

        while session.can_attempt() {
            let fix = match healer
                .propose_fix(&mut session, db_description, question, db_type)
                .await
            {
                Ok(Some(fix)) => fix,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Healing aborted, LLM unavailable: {}", e);
                    break;
                }
            };

            sink.send(PipelineEvent::step(EventKind::HealingAttempt {
                message: format!(
                    "Query was automatically fixed. Changes made: {}",
                    fix.changes_made.join(", ")
                ),
                original_error: session.original_error().to_string(),
                healed_sql: fix.sql_query.clone(),
            }))
            .await;

            match loader.execute_sql_query(&fix.sql_query, db_url).await {
                Ok(rows) => {
                    sink.send(PipelineEvent::step(EventKind::HealingSuccess {
                        message: "✅ Healed query executed successfully".to_string(),
                    }))
                    .await;
                    // The healed statement is what gets surfaced and
                    // persisted from here on.
                    verdict.sql_query = fix.sql_query;
                    return Some(rows);
                }
                Err(healed_error) => {
                    error!("Healed query also failed: {}", healed_error);
                    session.record_execution_failure(&healed_error.to_string(), db_type);
                }
            }
        }

        None
    }

    /// Handle the confirmation reply for a destructive statement. Events in
    /// this flow carry no `final_response` flag.
    pub fn run_confirmation(&self, graph_id: &str, request: ConfirmRequest) -> Result<EventStream> {
        if request.sql_query.trim().is_empty() {
            return Err(Text2SqlError::InvalidArgument("No SQL query provided".to_string()));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let sink = EventSink { tx };
        let pipeline = self.clone();
        let graph_id = graph_id.to_string();

        tokio::spawn(async move {
            pipeline.run_confirmation_stream(&graph_id, request, sink).await;
        });

        Ok(rx)
    }

    async fn run_confirmation_stream(
        &self,
        graph_id: &str,
        request: ConfirmRequest,
        sink: EventSink,
    ) {
        if !destructive::is_confirmed(&request.confirmation) {
            sink.send(PipelineEvent::unflagged(EventKind::OperationCancelled {
                message: "Operation cancelled. The destructive SQL query was not executed."
                    .to_string(),
            }))
            .await;
            return;
        }

        let sql_query = request.sql_query.clone();
        let question = request
            .chat
            .last()
            .cloned()
            .unwrap_or_else(|| "Destructive operation confirmation".to_string());

        // Demo graphs reject destructive SQL even after an explicit
        // CONFIRM; the gate is not bypassable through this entry point.
        if self.config.is_demo_graph(graph_id)
            && destructive::classify_destructive(&sql_query).is_some()
        {
            sink.send(PipelineEvent::unflagged(EventKind::Error {
                message: "Destructive operation not allowed on demo graphs".to_string(),
            }))
            .await;
            return;
        }

        let (db_description, db_url) = match get_db_description(self.graph.as_ref(), graph_id).await
        {
            Ok(pair) => pair,
            Err(e) => {
                error!("Failed to read database description: {}", e);
                sink.send(PipelineEvent::unflagged(EventKind::Error {
                    message: e.user_message(),
                }))
                .await;
                return;
            }
        };

        let Some((db_type, loader)) = self.loaders.loader_for_url(&db_url) else {
            sink.send(PipelineEvent::unflagged(EventKind::Error {
                message: "Unable to determine database type".to_string(),
            }))
            .await;
            return;
        };

        sink.send(PipelineEvent::unflagged(EventKind::ReasoningStep {
            message: "Step 2: Executing confirmed SQL query".to_string(),
        }))
        .await;

        // Known tables for identifier quoting; failures degrade to none.
        let known_tables: HashSet<String> = match self
            .graph
            .query(graph_id, "MATCH (t:Table) RETURN t.name", &GraphParams::new())
            .await
        {
            Ok(rows) => rows
                .iter()
                .filter_map(|row| row.first().and_then(|v| v.as_str()).map(|s| s.to_string()))
                .collect(),
            Err(e) => {
                warn!("Could not list tables for identifier quoting: {}", e);
                HashSet::new()
            }
        };

        let (sql_query, was_modified) = sql_sanitizer::auto_quote_identifiers(
            &sql_query,
            &known_tables,
            sql_sanitizer::quote_char(db_type),
        );
        if was_modified {
            info!("Confirmed SQL query auto-sanitized");
        }

        let (is_schema_modifying, operation_type) = loader.is_schema_modifying_query(&sql_query);

        let rows = match loader.execute_sql_query(&sql_query, &db_url).await {
            Ok(rows) => rows,
            Err(e) => {
                error!("Error executing confirmed SQL query: {}", e);
                self.schedule_query_memory(&question, &sql_query, Some(e.to_string()));
                sink.send(PipelineEvent::unflagged(EventKind::Error {
                    message: "Error executing query".to_string(),
                }))
                .await;
                return;
            }
        };

        sink.send(PipelineEvent::unflagged(EventKind::QueryResult { data: rows.clone() }))
            .await;

        if is_schema_modifying {
            sink.send(PipelineEvent::unflagged(EventKind::ReasoningStep {
                message: "Step 3: Schema change detected - refreshing graph...".to_string(),
            }))
            .await;
            let refresh_event =
                refresh_schema(loader.as_ref(), graph_id, &db_url, &operation_type).await;
            sink.send(PipelineEvent::unflagged(refresh_event)).await;
        }

        let step_num = if is_schema_modifying { "4" } else { "3" };
        sink.send(PipelineEvent::unflagged(EventKind::ReasoningStep {
            message: format!("Step {}: Generating user-friendly response", step_num),
        }))
        .await;

        let formatter = ResponseFormatterAgent::new(Arc::clone(&self.llm));
        match formatter
            .format_response(&question, &sql_query, &rows, &db_description)
            .await
        {
            Ok(answer) => {
                sink.send(PipelineEvent::unflagged(EventKind::AiResponse { message: answer }))
                    .await;
                self.schedule_query_memory(&question, &sql_query, None);
            }
            Err(e) => {
                error!("Response formatting failed: {}", e);
                self.schedule_query_memory(&question, &sql_query, Some(e.to_string()));
                sink.send(PipelineEvent::unflagged(EventKind::Error {
                    message: "Error executing query".to_string(),
                }))
                .await;
            }
        }
    }

    /// Manually rebuild the schema graph from the live database. Demo
    /// graphs cannot be refreshed.
    pub async fn refresh_database_schema(
        &self,
        user_id: &str,
        graph_id: &str,
    ) -> Result<EventStream> {
        if self.config.is_demo_graph(graph_id) {
            return Err(Text2SqlError::InvalidArgument(
                "Demo graphs cannot be refreshed".to_string(),
            ));
        }

        let (_, db_url) = get_db_description(self.graph.as_ref(), graph_id).await?;
        if DatabaseType::from_url(&db_url).is_none() {
            return Err(Text2SqlError::Internal(
                "No database URL found for this graph".to_string(),
            ));
        }

        self.load_database(&db_url, user_id).await
    }

    /// Connect to a database URL and stream schema-load progress. Events in
    /// this flow carry no `final_response` flag.
    pub async fn load_database(&self, url: &str, user_id: &str) -> Result<EventStream> {
        if url.trim().is_empty() {
            return Err(Text2SqlError::InvalidArgument("Invalid URL format".to_string()));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let sink = EventSink { tx };
        let pipeline = self.clone();
        let url = url.to_string();
        let user_id = user_id.to_string();

        tokio::spawn(async move {
            pipeline.run_load_stream(&url, &user_id, sink).await;
        });

        Ok(rx)
    }

    async fn run_load_stream(&self, url: &str, user_id: &str, sink: EventSink) {
        let overall_start = Instant::now();
        let mut steps_counter = 1;

        sink.send(PipelineEvent::unflagged(EventKind::ReasoningStep {
            message: format!("Step {}: Starting database connection", steps_counter),
        }))
        .await;

        let Some((db_type, loader)) = self.loaders.loader_for_url(url) else {
            sink.send(PipelineEvent::unflagged(EventKind::Error {
                message: "Invalid database URL format".to_string(),
            }))
            .await;
            return;
        };

        steps_counter += 1;
        sink.send(PipelineEvent::unflagged(EventKind::ReasoningStep {
            message: format!(
                "Step {}: Detected database type: {}. Attempting to load schema...",
                steps_counter,
                db_type.as_str()
            ),
        }))
        .await;

        let mut progress = match loader.load(user_id, url).await {
            Ok(progress) => progress,
            Err(e) => {
                error!("Error while loading database schema: {}", e);
                sink.send(PipelineEvent::unflagged(EventKind::Error {
                    message: "Error connecting to database".to_string(),
                }))
                .await;
                return;
            }
        };

        let mut load_succeeded = false;
        while let Some((success, message)) = progress.recv().await {
            if success {
                load_succeeded = true;
                steps_counter += 1;
                sink.send(PipelineEvent::unflagged(EventKind::ReasoningStep {
                    message: format!("Step {}: {}", steps_counter, message),
                }))
                .await;
            } else {
                load_succeeded = false;
                // Higher-level error only; internals go to the log.
                error!("Database loader failed: {}", message);
                break;
            }
        }

        if load_succeeded {
            sink.send(PipelineEvent::unflagged(EventKind::FinalResult {
                success: true,
                message: "Database connected and schema loaded successfully".to_string(),
            }))
            .await;
        } else {
            sink.send(PipelineEvent::unflagged(EventKind::Error {
                message: "Failed to load database schema".to_string(),
            }))
            .await;
        }

        info!(
            "Database load attempt finished in {:.2} seconds",
            overall_start.elapsed().as_secs_f64()
        );
    }

    /// Schedule the three post-response background jobs: query-outcome
    /// memory, conversation summary, and periodic cleanup. None of them is
    /// awaited by the stream, and none of their failures surface.
    fn schedule_memory_tasks(
        &self,
        question: &str,
        sql_query: &str,
        answer: &str,
        execution_error: Option<String>,
        history: &ConversationHistory,
    ) {
        self.schedule_query_memory(question, sql_query, execution_error.clone());

        let turn = TurnRecord::new(
            question.to_string(),
            sql_query.to_string(),
            answer.to_string(),
            execution_error,
        );
        let memory = Arc::clone(&self.memory);
        let history = history.clone();
        self.supervisor.spawn("save-conversation-summary", async move {
            memory.add_new_memory(&turn, &history).await.map(|_| ())
        });

        let memory = Arc::clone(&self.memory);
        self.supervisor.spawn("memory-cleanup", async move { memory.clean_memory().await });
    }

    fn schedule_query_memory(&self, question: &str, sql_query: &str, error: Option<String>) {
        let memory = Arc::clone(&self.memory);
        let question = question.to_string();
        let sql_query = sql_query.to_string();
        self.supervisor.spawn("save-query-memory", async move {
            memory
                .save_query_memory(&question, &sql_query, error.is_none(), error.as_deref())
                .await
                .map(|_| ())
        });
    }
}
