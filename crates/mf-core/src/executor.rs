//! # Query Executor
//!
//! Runs one query end to end: parse and validate the model, compile the
//! pipeline, open a cursor, settle the value schema (declared or
//! inferred from a buffered prefix), then parse every document into
//! frames. [`query_data`] runs all queries of a request in parallel.
//!
//! Cancellation is observed on connect, on every cursor advance and
//! between buffered documents. The store is closed on every exit path.

use crate::error::QueryError;
use crate::frame::{Field, Frame};
use crate::model::QueryModel;
use crate::panic_guard;
use crate::parser::ResultParser;
use crate::request::{DataQuery, DataResponse, QueryDataRequest, QueryDataResponse};
use crate::schema::SchemaInferenceState;
use crate::settings::DataSourceSettings;
use crate::store::{ConnectError, Connector, DocumentCursor, DocumentStore, StoreError};
use bson::{Bson, Document};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

// =============================================================================
// Options
// =============================================================================

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Upper bound on queries of one request running at once.
    pub max_parallel_queries: usize,
    /// Per-query deadline. Expiry cancels the query.
    pub query_timeout: Option<Duration>,
    /// Used when a request carries no datasource settings.
    pub default_settings: Option<DataSourceSettings>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            max_parallel_queries: 8,
            query_timeout: None,
            default_settings: None,
        }
    }
}

// =============================================================================
// Cursor
// =============================================================================

/// A cursor with a replay buffer in front of it. Documents pulled for
/// schema inference are buffered and handed out again before the live
/// cursor is advanced.
struct BufferedCursor<'a> {
    cursor: Box<dyn DocumentCursor>,
    buffer: VecDeque<Document>,
    /// Documents pulled from the live cursor.
    pulled: usize,
    /// Documents handed out by `next`.
    yielded: usize,
    cancel: &'a CancellationToken,
}

impl<'a> BufferedCursor<'a> {
    fn new(cursor: Box<dyn DocumentCursor>, cancel: &'a CancellationToken) -> Self {
        Self {
            cursor,
            buffer: VecDeque::new(),
            pulled: 0,
            yielded: 0,
            cancel,
        }
    }

    /// Advance the live cursor and decode the document it lands on.
    async fn pull(&mut self) -> Result<Option<Document>, QueryError> {
        let index = self.pulled;
        let advanced = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(QueryError::Cancelled),
            advanced = self.cursor.advance() => advanced,
        };
        if !advanced.map_err(|source| QueryError::Fetch { index, source })? {
            return Ok(None);
        }

        let cursor = &self.cursor;
        let doc = match panic_guard::catch(|| cursor.current()) {
            Ok(decoded) => decoded.map_err(|source| QueryError::Decode { index, source })?,
            Err(caught) => {
                tracing::error!(
                    backtrace = %caught.backtrace,
                    "Panic while decoding document number {}: {}",
                    index,
                    caught.message
                );
                return Err(QueryError::Decode {
                    index,
                    source: StoreError::new(format!("panicked: {}", caught.message)),
                });
            }
        };
        self.pulled += 1;
        Ok(Some(doc))
    }

    /// The next document with its zero-based position in the result stream.
    async fn next(&mut self) -> Result<Option<(usize, Document)>, QueryError> {
        if self.cancel.is_cancelled() {
            return Err(QueryError::Cancelled);
        }
        let doc = match self.buffer.pop_front() {
            Some(doc) => doc,
            None => match self.pull().await? {
                Some(doc) => doc,
                None => return Ok(None),
            },
        };
        let index = self.yielded;
        self.yielded += 1;
        Ok(Some((index, doc)))
    }

    /// Buffer up to `depth` documents, feeding each to the inference state.
    async fn infer(
        &mut self,
        depth: usize,
        state: &mut SchemaInferenceState,
    ) -> Result<(), QueryError> {
        while self.buffer.len() < depth {
            let doc = match self.pull().await {
                Ok(Some(doc)) => doc,
                Ok(None) => break,
                Err(QueryError::Cancelled) => return Err(QueryError::Cancelled),
                Err(err) => return Err(QueryError::InferenceCursor(Box::new(err))),
            };
            state.update_doc(&doc)?;
            self.buffer.push_back(doc);
        }
        Ok(())
    }
}

// =============================================================================
// Single Query
// =============================================================================

/// Run one query against the store the settings describe.
pub async fn execute_query(
    connector: &dyn Connector,
    settings: &DataSourceSettings,
    query: &DataQuery,
    cancel: &CancellationToken,
) -> DataResponse {
    match run_query(connector, settings, query, cancel).await {
        Ok(frames) => DataResponse::frames(frames),
        Err(err) => {
            tracing::warn!(ref_id = %query.ref_id, "Query failed: {}", err);
            DataResponse::error(err)
        }
    }
}

async fn run_query(
    connector: &dyn Connector,
    settings: &DataSourceSettings,
    query: &DataQuery,
    cancel: &CancellationToken,
) -> Result<Vec<Frame>, QueryError> {
    let model: QueryModel =
        serde_json::from_value(query.model_json()).map_err(QueryError::InvalidQueryJson)?;
    tracing::debug!(?model, "Parsed query model");
    model.validate().map_err(QueryError::InvalidQuery)?;

    let pipeline = model
        .pipeline(&query.time_range.from, &query.time_range.to)
        .map_err(QueryError::Pipeline)?;
    tracing::debug!(pipeline = %pipeline_json(&pipeline), "Effective pipeline");

    let declared = if model.schema_inference {
        None
    } else {
        Some(model.fields().map_err(QueryError::InvalidQuery)?)
    };

    let connect = panic_guard::catch_future(connector.connect(settings));
    let store = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(QueryError::Cancelled),
        store = connect => store.map_err(|caught| panicked("connecting to mongo", caught))??,
    };
    let run = run_with_store(store.as_ref(), &model, pipeline, declared, cancel);
    let result = panic_guard::catch_future(run)
        .await
        .unwrap_or_else(|caught| Err(panicked("running query", caught)));
    store.close().await;
    result
}

fn panicked(context: &'static str, caught: panic_guard::CaughtPanic) -> QueryError {
    tracing::error!(
        backtrace = %caught.backtrace,
        "Panic while {}: {}",
        context,
        caught.message
    );
    QueryError::Internal {
        context,
        message: format!("panicked: {}", caught.message),
    }
}

async fn run_with_store(
    store: &dyn DocumentStore,
    model: &QueryModel,
    pipeline: Vec<Document>,
    declared: Option<Vec<Field>>,
    cancel: &CancellationToken,
) -> Result<Vec<Frame>, QueryError> {
    tracing::info!(
        database = %model.database,
        collection = %model.collection,
        "Querying MongoDB"
    );
    let cursor = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(QueryError::Cancelled),
        cursor = store.aggregate(&model.database, &model.collection, pipeline) => {
            cursor.map_err(QueryError::Aggregate)?
        }
    };
    let mut cursor = BufferedCursor::new(cursor, cancel);

    let fields = match declared {
        Some(fields) => fields,
        None => {
            let depth = model.inference_depth();
            let ignored = model.inference_ignored();
            let mut state = SchemaInferenceState::new(ignored.clone());
            cursor.infer(depth, &mut state).await?;
            let fields = state.finish();
            tracing::debug!(
                requested = depth,
                buffered = cursor.buffer.len(),
                ?ignored,
                ?fields,
                "Inferred schema"
            );
            fields
        }
    };

    let resolved = model.resolve(fields).map_err(QueryError::Resolve)?;
    tracing::debug!(?resolved, "Resolved query model");

    let mut parser = ResultParser::new(resolved);
    let mut processed = 0usize;
    while let Some((index, doc)) = cursor.next().await? {
        if let Err(source) = parser.parse_document(&doc) {
            return Err(QueryError::Document {
                index,
                document: Bson::Document(doc).into_relaxed_extjson().to_string(),
                source,
            });
        }
        processed += 1;
    }
    tracing::info!("Processed {} documents", processed);
    Ok(parser.into_frames())
}

fn pipeline_json(pipeline: &[Document]) -> String {
    let stages = pipeline.iter().cloned().map(Bson::Document).collect();
    Bson::Array(stages).into_relaxed_extjson().to_string()
}

// =============================================================================
// Request
// =============================================================================

/// The query tasks of one request. If the request is abandoned before all
/// of them are joined, the rest are cancelled and detached rather than
/// aborted, so each still closes its store.
struct QueryTasks {
    join_set: JoinSet<(String, DataResponse)>,
    cancel: CancellationToken,
}

impl Drop for QueryTasks {
    fn drop(&mut self) {
        if !self.join_set.is_empty() {
            tracing::debug!(
                pending = self.join_set.len(),
                "Request abandoned, cancelling remaining queries"
            );
            self.cancel.cancel();
            self.join_set.detach_all();
        }
    }
}

/// Run every query of a request, each on its own task, and collect the
/// responses by refId. One query failing never affects another.
pub async fn query_data(
    connector: Arc<dyn Connector>,
    request: QueryDataRequest,
    options: &QueryOptions,
    cancel: &CancellationToken,
) -> QueryDataResponse {
    let settings = match request.settings() {
        Some(parsed) => parsed.map_err(ConnectError::from),
        None => Ok(options.default_settings.clone().unwrap_or_default()),
    };
    let mut response = QueryDataResponse::default();
    let settings = match settings {
        Ok(settings) => Arc::new(settings),
        Err(err) => {
            tracing::error!("Unusable datasource settings: {}", err);
            for query in request.queries {
                response
                    .results
                    .insert(query.ref_id, DataResponse::error(err.clone().into()));
            }
            return response;
        }
    };

    let semaphore = Arc::new(Semaphore::new(options.max_parallel_queries.max(1)));
    let mut tasks = QueryTasks {
        join_set: JoinSet::new(),
        cancel: cancel.child_token(),
    };
    let ref_ids: Vec<String> = request.queries.iter().map(|q| q.ref_id.clone()).collect();

    for query in request.queries {
        let connector = Arc::clone(&connector);
        let settings = Arc::clone(&settings);
        let semaphore = Arc::clone(&semaphore);
        let cancel = tasks.cancel.child_token();
        let timeout = options.query_timeout;

        tasks.join_set.spawn(async move {
            let ref_id = query.ref_id.clone();
            let _permit = match semaphore.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return (ref_id, DataResponse::error(QueryError::Cancelled));
                }
            };
            let run = execute_query(connector.as_ref(), &settings, &query, &cancel);
            tokio::pin!(run);

            let Some(timeout) = timeout else {
                let response = run.await;
                return (ref_id, response);
            };
            match tokio::time::timeout(timeout, &mut run).await {
                Ok(response) => (ref_id, response),
                Err(_) => {
                    cancel.cancel();
                    let mut response = run.await;
                    if matches!(response.result, Err(QueryError::Cancelled)) {
                        response = DataResponse::error(QueryError::TimedOut(timeout));
                    }
                    (ref_id, response)
                }
            }
        });
    }

    while let Some(result) = tasks.join_set.join_next().await {
        match result {
            Ok((ref_id, data)) => {
                response.results.insert(ref_id, data);
            }
            Err(join_error) => {
                tracing::error!("Query task join error: {}", join_error);
            }
        }
    }

    for ref_id in ref_ids {
        response.results.entry(ref_id).or_insert_with(|| {
            DataResponse::error(QueryError::Internal {
                context: "running query",
                message: "query task did not complete".to_string(),
            })
        });
    }
    response
}
