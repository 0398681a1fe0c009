use crate::config::GenerationConfig;
use crate::error::GenerationError;
use crate::generation::{GenerationTurn, ModelEvent, ToolCall, TurnMessage};
use crate::models::{
    estimate_tokens, AskRequest, GenerationMetrics, GenerationResponse, RetrievalNotice,
};
use crate::prompt::{build_turn, map_citations};
use crate::retrieval::Retriever;
use crate::tools::ToolRegistry;
use crate::traits::GenerationBackend;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

const EVENT_BUFFER: usize = 64;

/// Lifecycle of one `ask` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Pending,
    Retrieving,
    Generating,
    Streaming,
    Complete,
    Failed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        use RequestState::*;
        match (self, next) {
            (from, Failed) => !from.is_terminal(),
            (Pending, Retrieving)
            | (Retrieving, Generating)
            | (Generating, Streaming)
            | (Generating, Complete)
            | (Streaming, Complete) => true,
            _ => false,
        }
    }
}

/// Why a request ended in `Failed`, in a form fit to show to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Retrieval { details: String },
    Backend { backend: String, details: String },
    RateLimited { details: String },
    Network { details: String },
    Timeout { after_ms: u64 },
    ToolExecution { tool: String, details: String },
    ToolRoundTripsExceeded { rounds: usize },
    Cancelled,
}

impl FailureReason {
    pub fn message(&self) -> String {
        match self {
            Self::Retrieval { details } => {
                format!("Searching the documents failed: {details}")
            }
            Self::Backend { backend, details } => {
                format!("The {backend} model returned an error: {details}")
            }
            Self::RateLimited { .. } => {
                "The model service is rate limiting requests. Try again shortly.".to_string()
            }
            Self::Network { details } => {
                format!("The model service could not be reached: {details}")
            }
            Self::Timeout { after_ms } => {
                format!("The model did not respond within {after_ms} ms.")
            }
            Self::ToolExecution { tool, details } => {
                format!("The {tool} tool kept failing: {details}")
            }
            Self::ToolRoundTripsExceeded { rounds } => {
                format!("The model requested tools more than {rounds} times without answering.")
            }
            Self::Cancelled => "The request was cancelled.".to_string(),
        }
    }
}

impl From<&GenerationError> for FailureReason {
    fn from(error: &GenerationError) -> Self {
        match error {
            GenerationError::Backend { backend, details } => Self::Backend {
                backend: backend.clone(),
                details: details.clone(),
            },
            GenerationError::RateLimited(details) => Self::RateLimited {
                details: details.clone(),
            },
            GenerationError::Network(details) => Self::Network {
                details: details.clone(),
            },
            GenerationError::Timeout(after_ms) => Self::Timeout {
                after_ms: *after_ms,
            },
            GenerationError::ToolExecution { tool, details } => Self::ToolExecution {
                tool: tool.clone(),
                details: details.clone(),
            },
            GenerationError::ToolRoundTripsExceeded(rounds) => {
                Self::ToolRoundTripsExceeded { rounds: *rounds }
            }
            GenerationError::Retrieval(error) => Self::Retrieval {
                details: error.to_string(),
            },
            GenerationError::Cancelled => Self::Cancelled,
            GenerationError::Url(error) => Self::Backend {
                backend: "configuration".to_string(),
                details: error.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone)]
pub enum AnswerEvent {
    State(RequestState),
    Retrieved {
        hits: usize,
        notice: Option<RetrievalNotice>,
    },
    Delta(String),
    ToolInvoked {
        name: String,
        succeeded: bool,
    },
    Completed(Box<GenerationResponse>),
    Failed(FailureReason),
}

/// Stops a running request. Text already delivered stays delivered.
#[derive(Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Ordered events of one request, always ending in `Completed` or `Failed`.
/// Dropping the stream cancels the request.
pub struct AnswerStream {
    query_id: String,
    events: mpsc::Receiver<AnswerEvent>,
    cancel: CancelHandle,
}

impl AnswerStream {
    pub fn query_id(&self) -> &str {
        &self.query_id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Drains the stream, discarding increments, and returns the final outcome.
    pub async fn into_response(mut self) -> Result<GenerationResponse, FailureReason> {
        while let Some(event) = self.events.recv().await {
            match event {
                AnswerEvent::Completed(response) => return Ok(*response),
                AnswerEvent::Failed(reason) => return Err(reason),
                _ => {}
            }
        }
        Err(FailureReason::Cancelled)
    }
}

impl Stream for AnswerStream {
    type Item = AnswerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turns questions into grounded, cited answers: retrieval, prompt assembly,
/// streamed generation with a bounded tool loop, and citation mapping.
#[derive(Clone)]
pub struct RagEngine {
    retriever: Arc<Retriever>,
    backend: Arc<dyn GenerationBackend>,
    tools: ToolRegistry,
    config: GenerationConfig,
}

impl RagEngine {
    pub fn new(
        retriever: Arc<Retriever>,
        backend: Arc<dyn GenerationBackend>,
        tools: ToolRegistry,
        config: GenerationConfig,
    ) -> Self {
        Self {
            retriever,
            backend,
            tools,
            config,
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Starts the request on the runtime and returns its event stream at once.
    pub fn ask(&self, request: AskRequest) -> AnswerStream {
        let query_id = Uuid::new_v4().to_string();
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let run = RequestRun {
            engine: self.clone(),
            query_id: query_id.clone(),
            state: RequestState::Pending,
            events: events_tx,
            cancel: cancel_rx,
            retries_left: 1,
            attempts: 0,
        };
        let span = info_span!("ask", query_id = %query_id, backend = %self.backend.name());
        tokio::spawn(run.execute(request).instrument(span));

        AnswerStream {
            query_id,
            events: events_rx,
            cancel: CancelHandle(Arc::new(cancel_tx)),
        }
    }

    pub async fn answer(&self, request: AskRequest) -> Result<GenerationResponse, FailureReason> {
        self.ask(request).into_response().await
    }
}

enum RoundOutcome {
    Finished,
    ToolCalls { calls: Vec<ToolCall>, text: String },
}

struct RequestRun {
    engine: RagEngine,
    query_id: String,
    state: RequestState,
    events: mpsc::Sender<AnswerEvent>,
    cancel: watch::Receiver<bool>,
    retries_left: u32,
    attempts: u32,
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow_and_update() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Runs `work` unless the request is cancelled first.
async fn unless_cancelled<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    work: F,
) -> Result<F::Output, GenerationError> {
    tokio::select! {
        biased;
        _ = cancelled(cancel) => Err(GenerationError::Cancelled),
        output = work => Ok(output),
    }
}

impl RequestRun {
    async fn execute(mut self, request: AskRequest) {
        let started = Instant::now();
        match self.drive(&request, started).await {
            Ok(response) => {
                info!(
                    answer_chars = response.metrics.answer_chars,
                    citations = response.citations.len(),
                    grounded = response.grounded,
                    tool_calls = response.metrics.tool_calls,
                    attempts = response.metrics.attempts,
                    total_ms = response.metrics.total_ms,
                    "answer complete"
                );
                self.state = RequestState::Complete;
                let _ = self.events.send(AnswerEvent::State(RequestState::Complete)).await;
                let _ = self.events.send(AnswerEvent::Completed(Box::new(response))).await;
            }
            Err(error) => {
                warn!(error = %error, state = ?self.state, "request failed");
                let reason = FailureReason::from(&error);
                if self.state.can_transition_to(RequestState::Failed) {
                    self.state = RequestState::Failed;
                    let _ = self.events.send(AnswerEvent::State(RequestState::Failed)).await;
                }
                let _ = self.events.send(AnswerEvent::Failed(reason)).await;
            }
        }
    }

    async fn emit(&self, event: AnswerEvent) -> Result<(), GenerationError> {
        self.events
            .send(event)
            .await
            .map_err(|_| GenerationError::Cancelled)
    }

    async fn transition(&mut self, next: RequestState) -> Result<(), GenerationError> {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {next:?}",
            self.state
        );
        self.state = next;
        self.emit(AnswerEvent::State(next)).await
    }

    async fn drive(
        &mut self,
        request: &AskRequest,
        started: Instant,
    ) -> Result<GenerationResponse, GenerationError> {
        let engine = self.engine.clone();
        let config = &engine.config;

        self.transition(RequestState::Retrieving).await?;
        let retrieval = unless_cancelled(
            &mut self.cancel,
            engine.retriever.retrieve(
                &request.query,
                request.top_k,
                request.max_context_chars,
                Some(&request.filters),
            ),
        )
        .await??;
        let retrieval_ms = started.elapsed().as_millis() as u64;
        if retrieval.notice == Some(RetrievalNotice::EmptyCorpus) {
            warn!("no documents indexed, generating without grounding");
        }
        self.emit(AnswerEvent::Retrieved {
            hits: retrieval.hits.len(),
            notice: retrieval.notice,
        })
        .await?;

        self.transition(RequestState::Generating).await?;
        let generation_started = Instant::now();
        let tools = if config.tools_enabled && engine.backend.supports_tools() {
            engine.tools.schemas()
        } else {
            Vec::new()
        };
        let mut turn = build_turn(
            &request.query,
            &retrieval.hits,
            tools,
            config.temperature,
            config.max_output_tokens,
        );
        let prompt_chars = turn.system.chars().count()
            + turn
                .messages
                .iter()
                .map(|message| match message {
                    TurnMessage::User(text) => text.chars().count(),
                    _ => 0,
                })
                .sum::<usize>();

        let mut answer = String::new();
        let mut rounds = 0usize;
        let mut tool_calls = 0usize;
        let mut last_tool_error: Option<(String, String)> = None;

        loop {
            let outcome = self.generate_round(&engine, &turn, &mut answer).await?;
            let RoundOutcome::ToolCalls { calls, text } = outcome else {
                break;
            };

            if rounds == config.max_tool_rounds {
                return Err(match last_tool_error {
                    Some((tool, details)) => GenerationError::ToolExecution { tool, details },
                    None => GenerationError::ToolRoundTripsExceeded(config.max_tool_rounds),
                });
            }
            rounds += 1;

            if !text.is_empty() {
                turn.messages.push(TurnMessage::Model(text));
            }
            last_tool_error = None;
            for call in calls {
                tool_calls += 1;
                let result = engine.tools.invoke(&call);
                let succeeded = result.is_ok();
                let (content, is_error) = match result {
                    Ok(output) => (output, false),
                    Err(error) => {
                        warn!(tool = %call.name, error = %error, "tool call failed");
                        last_tool_error = Some((call.name.clone(), error.to_string()));
                        (error.to_string(), true)
                    }
                };
                info!(tool = %call.name, round = rounds, succeeded, "tool invoked");
                self.emit(AnswerEvent::ToolInvoked {
                    name: call.name.clone(),
                    succeeded,
                })
                .await?;
                let name = call.name.clone();
                turn.messages.push(TurnMessage::ToolCall(call));
                turn.messages.push(TurnMessage::ToolResult {
                    name,
                    content,
                    is_error,
                });
            }
        }

        let citations = map_citations(&answer, &retrieval.hits);
        let context_chars = retrieval.context_chars();
        let metrics = GenerationMetrics {
            retrieval_ms,
            generation_ms: generation_started.elapsed().as_millis() as u64,
            total_ms: started.elapsed().as_millis() as u64,
            prompt_chars,
            context_chars,
            answer_chars: answer.chars().count(),
            estimated_prompt_tokens: prompt_chars.div_ceil(4),
            estimated_answer_tokens: estimate_tokens(&answer),
            tool_calls,
            attempts: self.attempts,
        };

        Ok(GenerationResponse {
            query_id: self.query_id.clone(),
            query: request.query.clone(),
            answer,
            grounded: !retrieval.hits.is_empty(),
            context: retrieval.hits,
            citations,
            backend: engine.backend.name().to_string(),
            metrics,
        })
    }

    /// One model call, retried once on a transient failure as long as nothing
    /// from the failed attempt reached the caller.
    async fn generate_round(
        &mut self,
        engine: &RagEngine,
        turn: &GenerationTurn,
        answer: &mut String,
    ) -> Result<RoundOutcome, GenerationError> {
        loop {
            self.attempts += 1;
            let mut delivered = false;
            match self.stream_once(engine, turn, answer, &mut delivered).await {
                Err(error) if error.is_transient() && !delivered && self.retries_left > 0 => {
                    self.retries_left -= 1;
                    let backoff = engine.config.retry_backoff;
                    warn!(
                        error = %error,
                        backoff_ms = backoff.as_millis() as u64,
                        "transient generation failure, retrying"
                    );
                    unless_cancelled(&mut self.cancel, tokio::time::sleep(backoff)).await?;
                }
                outcome => return outcome,
            }
        }
    }

    async fn stream_once(
        &mut self,
        engine: &RagEngine,
        turn: &GenerationTurn,
        answer: &mut String,
        delivered: &mut bool,
    ) -> Result<RoundOutcome, GenerationError> {
        let timeout = engine.config.timeout;
        let timeout_ms = timeout.as_millis() as u64;

        let mut stream = unless_cancelled(
            &mut self.cancel,
            tokio::time::timeout(timeout, engine.backend.generate_stream(turn)),
        )
        .await?
        .map_err(|_| GenerationError::Timeout(timeout_ms))??;

        let mut calls = Vec::new();
        let mut text = String::new();
        loop {
            let next = unless_cancelled(&mut self.cancel, tokio::time::timeout(timeout, stream.next()))
                .await?
                .map_err(|_| GenerationError::Timeout(timeout_ms))?;
            let Some(event) = next else {
                break;
            };
            match event? {
                ModelEvent::Text(delta) => {
                    if self.state == RequestState::Generating {
                        self.transition(RequestState::Streaming).await?;
                    }
                    *delivered = true;
                    answer.push_str(&delta);
                    text.push_str(&delta);
                    self.emit(AnswerEvent::Delta(delta)).await?;
                }
                ModelEvent::ToolCall(call) => calls.push(call),
            }
        }

        if calls.is_empty() {
            Ok(RoundOutcome::Finished)
        } else {
            Ok(RoundOutcome::ToolCalls { calls, text })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetrievalConfig;
    use crate::embeddings::{CharacterNgramEmbedder, Embedder};
    use crate::generation::ModelEventStream;
    use crate::models::{ChunkPayload, FormatTag, IndexEntry};
    use crate::stores::LocalCollection;
    use crate::traits::VectorIndex;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    enum Step {
        Events(Vec<ModelEvent>),
        Fail(fn() -> GenerationError),
        Slow(Vec<ModelEvent>, Duration),
        Hang,
    }

    struct ScriptedBackend {
        steps: Mutex<VecDeque<Step>>,
        turns: Mutex<Vec<GenerationTurn>>,
    }

    impl ScriptedBackend {
        fn new(steps: Vec<Step>) -> Arc<Self> {
            Arc::new(Self {
                steps: Mutex::new(steps.into()),
                turns: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> usize {
            self.turns.lock().len()
        }
    }

    #[async_trait]
    impl GenerationBackend for ScriptedBackend {
        fn name(&self) -> &str {
            "scripted"
        }

        fn supports_tools(&self) -> bool {
            true
        }

        async fn generate_stream(
            &self,
            turn: &GenerationTurn,
        ) -> Result<ModelEventStream, GenerationError> {
            self.turns.lock().push(turn.clone());
            let step = self
                .steps
                .lock()
                .pop_front()
                .unwrap_or_else(|| Step::Events(vec![ModelEvent::Text("done".to_string())]));
            match step {
                Step::Events(events) => Ok(futures::stream::iter(events.into_iter().map(Ok)).boxed()),
                Step::Fail(make) => Err(make()),
                Step::Slow(events, pause) => Ok(futures::stream::iter(events)
                    .then(move |event| async move {
                        tokio::time::sleep(pause).await;
                        Ok(event)
                    })
                    .boxed()),
                Step::Hang => Ok(futures::stream::pending().boxed()),
            }
        }
    }

    fn text(value: &str) -> ModelEvent {
        ModelEvent::Text(value.to_string())
    }

    fn tool_call(name: &str, arguments: serde_json::Value) -> ModelEvent {
        ModelEvent::ToolCall(ToolCall {
            name: name.to_string(),
            arguments,
        })
    }

    fn config() -> GenerationConfig {
        GenerationConfig {
            timeout: Duration::from_millis(200),
            retry_backoff: Duration::from_millis(1),
            ..GenerationConfig::default()
        }
    }

    async fn engine(backend: Arc<ScriptedBackend>, config: GenerationConfig) -> (TempDir, RagEngine) {
        let dir = tempdir().unwrap();
        let embedder = CharacterNgramEmbedder::new(64);
        let index = LocalCollection::open(dir.path(), "docs", 64).await.unwrap();
        let text = "Revenue grew 23% to $125.7 million.";
        index
            .upsert(IndexEntry {
                id: "chunk-0".to_string(),
                vector: embedder.embed(text).await.unwrap(),
                payload: ChunkPayload {
                    document_id: "doc-1".to_string(),
                    source_path: "/docs/report.txt".to_string(),
                    title: "report.txt".to_string(),
                    format: FormatTag::PlainText,
                    text: text.to_string(),
                    locator: None,
                    chunk_index: 0,
                },
            })
            .await
            .unwrap();

        let index: Arc<dyn VectorIndex> = Arc::new(index);
        let retriever = Retriever::new(Arc::new(embedder), index, RetrievalConfig::default());
        let engine = RagEngine::new(Arc::new(retriever), backend, ToolRegistry::builtin(), config);
        (dir, engine)
    }

    fn request() -> AskRequest {
        AskRequest::new("What was the revenue growth?", 5, 2000)
    }

    async fn run(engine: &RagEngine) -> Vec<AnswerEvent> {
        engine.ask(request()).collect().await
    }

    fn states(events: &[AnswerEvent]) -> Vec<RequestState> {
        events
            .iter()
            .filter_map(|event| match event {
                AnswerEvent::State(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    fn failure(events: &[AnswerEvent]) -> Option<&FailureReason> {
        events.iter().find_map(|event| match event {
            AnswerEvent::Failed(reason) => Some(reason),
            _ => None,
        })
    }

    #[test]
    fn failed_is_reachable_from_every_live_state() {
        use RequestState::*;
        for state in [Pending, Retrieving, Generating, Streaming] {
            assert!(state.can_transition_to(Failed));
        }
        assert!(!Complete.can_transition_to(Failed));
        assert!(!Streaming.can_transition_to(Retrieving));
    }

    #[tokio::test]
    async fn successful_request_walks_the_state_machine() {
        let backend = ScriptedBackend::new(vec![Step::Events(vec![
            text("Revenue grew 23% "),
            text("[S1]."),
        ])]);
        let (_dir, engine) = engine(backend, config()).await;

        let events = run(&engine).await;
        assert_eq!(
            states(&events),
            vec![
                RequestState::Retrieving,
                RequestState::Generating,
                RequestState::Streaming,
                RequestState::Complete
            ]
        );
        let deltas = events
            .iter()
            .filter(|event| matches!(event, AnswerEvent::Delta(_)))
            .count();
        assert_eq!(deltas, 2);

        let Some(AnswerEvent::Completed(response)) = events.last() else {
            panic!("last event must be the completed response");
        };
        assert_eq!(response.answer, "Revenue grew 23% [S1].");
        assert_eq!(response.citations.len(), 1);
        assert_eq!(response.citations[0].document_id, "doc-1");
        assert!(response.citations[0].explicit);
        assert!(response.grounded);
        assert_eq!(response.metrics.attempts, 1);
    }

    #[tokio::test]
    async fn one_transient_failure_is_retried() {
        let backend = ScriptedBackend::new(vec![
            Step::Fail(|| GenerationError::Network("connection reset".to_string())),
            Step::Events(vec![text("Revenue grew 23% [S1].")]),
        ]);
        let (_dir, engine) = engine(backend.clone(), config()).await;

        let response = engine.answer(request()).await.unwrap();
        assert_eq!(response.metrics.attempts, 2);
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn second_transient_failure_fails_the_request() {
        let backend = ScriptedBackend::new(vec![
            Step::Fail(|| GenerationError::RateLimited("slow down".to_string())),
            Step::Fail(|| GenerationError::RateLimited("slow down".to_string())),
        ]);
        let (_dir, engine) = engine(backend.clone(), config()).await;

        let events = run(&engine).await;
        assert!(matches!(failure(&events), Some(FailureReason::RateLimited { .. })));
        assert_eq!(states(&events).last(), Some(&RequestState::Failed));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let backend = ScriptedBackend::new(vec![Step::Fail(|| GenerationError::Backend {
            backend: "scripted".to_string(),
            details: "invalid request".to_string(),
        })]);
        let (_dir, engine) = engine(backend.clone(), config()).await;

        let reason = engine.answer(request()).await.unwrap_err();
        assert!(matches!(reason, FailureReason::Backend { .. }));
        assert!(reason.message().contains("invalid request"));
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn tool_results_are_fed_back_into_the_turn() {
        let backend = ScriptedBackend::new(vec![
            Step::Events(vec![tool_call("calculator", json!({ "expression": "125.7 * 2" }))]),
            Step::Events(vec![text("Twice the revenue is 251.4 [S1].")]),
        ]);
        let (_dir, engine) = engine(backend.clone(), config()).await;

        let events = run(&engine).await;
        assert!(events.iter().any(|event| matches!(
            event,
            AnswerEvent::ToolInvoked { name, succeeded: true } if name == "calculator"
        )));
        let Some(AnswerEvent::Completed(response)) = events.last() else {
            panic!("request should complete");
        };
        assert_eq!(response.metrics.tool_calls, 1);

        let turns = backend.turns.lock();
        assert_eq!(turns.len(), 2);
        let (name, content, is_error) = turns[1].tool_results().next().unwrap();
        assert_eq!((name, content, is_error), ("calculator", "Result: 251.4", false));
    }

    #[tokio::test]
    async fn tool_errors_go_back_to_the_model() {
        let backend = ScriptedBackend::new(vec![
            Step::Events(vec![tool_call("calculator", json!({ "expression": "1 / 0" }))]),
            Step::Events(vec![text("The ratio is undefined.")]),
        ]);
        let (_dir, engine) = engine(backend.clone(), config()).await;

        let response = engine.answer(request()).await.unwrap();
        assert_eq!(response.answer, "The ratio is undefined.");
        let turns = backend.turns.lock();
        let (_, content, is_error) = turns[1].tool_results().next().unwrap();
        assert!(is_error);
        assert!(content.contains("division by zero"));
    }

    #[tokio::test]
    async fn endless_tool_calls_hit_the_round_trip_bound() {
        let arguments = json!({ "text": "a b", "analysis_type": "word_count" });
        let steps = (0..5)
            .map(|_| Step::Events(vec![tool_call("text_analyzer", arguments.clone())]))
            .collect();
        let backend = ScriptedBackend::new(steps);
        let (_dir, engine) = engine(backend.clone(), config()).await;

        let reason = engine.answer(request()).await.unwrap_err();
        assert_eq!(reason, FailureReason::ToolRoundTripsExceeded { rounds: 3 });
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test]
    async fn recurring_tool_errors_fail_with_the_tool_error() {
        let steps = (0..5)
            .map(|_| Step::Events(vec![tool_call("calculator", json!({}))]))
            .collect();
        let backend = ScriptedBackend::new(steps);
        let (_dir, engine) = engine(backend, config()).await;

        let reason = engine.answer(request()).await.unwrap_err();
        assert!(matches!(reason, FailureReason::ToolExecution { tool, .. } if tool == "calculator"));
    }

    #[tokio::test]
    async fn silent_backend_times_out() {
        let backend = ScriptedBackend::new(vec![Step::Hang, Step::Hang]);
        let (_dir, engine) = engine(
            backend,
            GenerationConfig {
                timeout: Duration::from_millis(30),
                ..config()
            },
        )
        .await;

        let reason = engine.answer(request()).await.unwrap_err();
        assert_eq!(reason, FailureReason::Timeout { after_ms: 30 });
    }

    #[tokio::test]
    async fn cancellation_stops_further_increments() {
        let backend = ScriptedBackend::new(vec![Step::Slow(
            (0..20).map(|n| text(&format!("part {n} "))).collect(),
            Duration::from_millis(20),
        )]);
        let (_dir, engine) = engine(backend, config()).await;

        let mut stream = engine.ask(request());
        let mut deltas_after_cancel = 0;
        let mut cancelled = false;
        let mut outcome = None;
        while let Some(event) = stream.next().await {
            match event {
                AnswerEvent::Delta(_) if !cancelled => {
                    stream.cancel();
                    cancelled = true;
                }
                AnswerEvent::Delta(_) => deltas_after_cancel += 1,
                AnswerEvent::Failed(reason) => outcome = Some(reason),
                _ => {}
            }
        }
        assert_eq!(outcome, Some(FailureReason::Cancelled));
        assert_eq!(deltas_after_cancel, 0);
    }

    #[tokio::test]
    async fn every_request_gets_its_own_query_id() {
        let backend = ScriptedBackend::new(Vec::new());
        let (_dir, engine) = engine(backend, config()).await;
        let first = engine.ask(request());
        let second = engine.ask(request());
        assert_ne!(first.query_id(), second.query_id());
        let response = first.into_response().await.unwrap();
        assert!(Uuid::parse_str(&response.query_id).is_ok());
    }
}
