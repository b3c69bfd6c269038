//! Turns decoded request envelopes into executor calls.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_bytes::ByteBuf;
use sqlgate_db::{ExecutionError, Executor, ResourceObserver};

use crate::requests::{
    CreateFtsRequest, DescribeResponse, FtsSearchRequest, IndexesResponse, InsightRequest,
    InsightResponse, JsonTextRequest, MessageResponse, QueryRequest, ResourceRequest,
    ResourceResponse, ResourcesResponse, RowsResponse, SchemaRequest, TableRequest, TablesResponse, WriteResponse,
};
use crate::wire::{
    DecodedRequest, RequestEnvelope, ResponseEnvelope, WireCodec, decode_payload, encode_payload,
    extract_payload,
};

/// Entries served regardless of the advertised tool list.
const RESOURCE_ENTRIES: [&str; 2] = ["list_resources", "read_resource"];

#[derive(Debug)]
pub struct ExecError {
    pub status: &'static str,
    pub message: String,
}

impl From<ExecutionError> for ExecError {
    fn from(err: ExecutionError) -> Self {
        Self {
            status: err.status(),
            message: err.to_string(),
        }
    }
}

fn invalid_input(message: String) -> ExecError {
    ExecError {
        status: "InvalidInput",
        message,
    }
}

fn internal_error(message: String) -> ExecError {
    ExecError {
        status: "InternalError",
        message,
    }
}

thread_local! {
    static UPDATED: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
}

/// Records resource URIs changed by the request running on the current
/// thread. The executor calls observers synchronously, so each worker thread
/// only ever sees its own request's updates.
pub struct RequestObserver;

impl ResourceObserver for RequestObserver {
    fn resource_updated(&self, uri: &str) {
        UPDATED.with(|updated| updated.borrow_mut().push(uri.to_string()));
    }
}

fn take_updates() -> Vec<String> {
    UPDATED.with(|updated| std::mem::take(&mut *updated.borrow_mut()))
}

pub struct Dispatcher {
    executor: Arc<Executor>,
    entries: HashSet<String>,
}

impl Dispatcher {
    /// Notifications are only produced when `executor` carries a
    /// [`RequestObserver`].
    pub fn new(executor: Arc<Executor>) -> Self {
        let mut entries: HashSet<String> = executor
            .tools()
            .iter()
            .map(|tool| tool.name.to_string())
            .collect();
        entries.extend(RESOURCE_ENTRIES.iter().map(|entry| entry.to_string()));
        Self { executor, entries }
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    /// Handles one request. The response comes first, followed by the
    /// notifications for resources this request changed.
    pub fn handle(&self, request: DecodedRequest, queue_depth: usize) -> Vec<(WireCodec, ResponseEnvelope)> {
        let wire = request.wire;
        take_updates();
        let mut out = vec![(wire, self.handle_request(request, queue_depth))];
        for uri in take_updates() {
            match ResponseEnvelope::resource_updated(&uri, wire.payload_codec()) {
                Ok(note) => out.push((wire, note)),
                Err(err) => tracing::error!(uri = %uri, error = %err, "failed to encode notification"),
            }
        }
        out
    }

    fn handle_request(&self, request: DecodedRequest, queue_depth: usize) -> ResponseEnvelope {
        let envelope = request.envelope;
        let request_id = envelope.request_id;
        let exec_start = Instant::now();
        let queue_ms = exec_start
            .duration_since(request.queued_at)
            .as_millis()
            .min(u128::from(u64::MAX)) as u64;
        let pool = self.executor.pool();
        let mut metrics = HashMap::new();
        metrics.insert("queue_ms".to_string(), queue_ms);
        metrics.insert("queue_depth".to_string(), queue_depth as u64);
        metrics.insert("pool_in_flight".to_string(), pool.in_flight() as u64);
        metrics.insert("pool_idle".to_string(), pool.idle_count() as u64);
        metrics.insert(
            "payload_bytes".to_string(),
            envelope.payload.as_ref().map(|p| p.len()).unwrap_or(0) as u64,
        );

        let mut response = ResponseEnvelope {
            request_id,
            status: "Ok".to_string(),
            codec: "raw".to_string(),
            payload: None,
            metrics: None,
            error: None,
            entry: Some(envelope.entry.clone()),
        };
        if !envelope.entry.starts_with("__") && !self.entries.contains(&envelope.entry) {
            response.status = "InvalidInput".to_string();
            response.error = Some(format!("Unknown entry '{}'", envelope.entry));
            response.metrics = Some(metrics);
            return response;
        }

        let timeout = (envelope.timeout_ms > 0)
            .then(|| Duration::from_millis(u64::from(envelope.timeout_ms)));
        tracing::debug!(request_id, entry = %envelope.entry, "dispatching request");
        let result = self.execute_entry(&envelope, request.wire);
        let elapsed = exec_start.elapsed();
        metrics.insert(
            "exec_ms".to_string(),
            elapsed.as_millis().min(u128::from(u64::MAX)) as u64,
        );
        response.metrics = Some(metrics);

        if timeout.is_some_and(|limit| elapsed > limit) {
            tracing::warn!(request_id, entry = %envelope.entry, ?elapsed, "request exceeded its timeout");
            response.status = "Timeout".to_string();
            response.error = Some("Request timed out".to_string());
            return response;
        }
        match result {
            Ok((codec, payload)) => {
                response.codec = codec;
                response.payload = Some(ByteBuf::from(payload));
            }
            Err(err) => {
                tracing::debug!(request_id, status = err.status, error = %err.message, "request failed");
                response.status = err.status.to_string();
                response.error = Some(err.message);
            }
        }
        response
    }

    fn execute_entry(
        &self,
        envelope: &RequestEnvelope,
        wire: WireCodec,
    ) -> Result<(String, Vec<u8>), ExecError> {
        let payload = extract_payload(envelope).map_err(invalid_input)?;
        let codec_in = envelope.codec.as_str();
        let codec_out = match codec_in {
            "json" | "msgpack" => codec_in,
            _ => wire.payload_codec(),
        };
        let executor = &self.executor;

        match envelope.entry.as_str() {
            "__ping__" => Ok(("raw".to_string(), Vec::new())),
            "__tools__" => respond(&executor.tools(), codec_out),
            "read_query" => {
                let req: QueryRequest = decode_body(&payload, codec_in)?;
                let rows = executor.read(&req.query, &req.params)?;
                respond(&RowsResponse { rows }, codec_out)
            }
            "write_query" => {
                let req: QueryRequest = decode_body(&payload, codec_in)?;
                let result = executor.write(&req.query, &req.params)?;
                respond(&WriteResponse::from(result), codec_out)
            }
            "create_table" => {
                let req: SchemaRequest = decode_body(&payload, codec_in)?;
                executor.create_schema(&req.query)?;
                respond(&MessageResponse::new("Table created successfully"), codec_out)
            }
            "list_tables" => {
                let tables = executor.list_tables()?;
                respond(&TablesResponse { tables }, codec_out)
            }
            "describe_table" => {
                let req: TableRequest = decode_body(&payload, codec_in)?;
                let columns = executor.describe_table(&req.table_name)?;
                respond(
                    &DescribeResponse {
                        table_name: req.table_name,
                        columns,
                    },
                    codec_out,
                )
            }
            "append_insight" => {
                let req: InsightRequest = decode_body(&payload, codec_in)?;
                let insight_count = executor.append_insight(&req.insight)?;
                respond(
                    &InsightResponse {
                        message: "Insight added to memo".to_string(),
                        insight_count,
                    },
                    codec_out,
                )
            }
            "vacuum_database" => {
                executor.vacuum()?;
                respond(&MessageResponse::new("Database vacuumed successfully"), codec_out)
            }
            "analyze_database" => {
                executor.analyze()?;
                respond(&MessageResponse::new("Database statistics updated"), codec_out)
            }
            "integrity_check" => respond(&executor.integrity_check()?, codec_out),
            "database_stats" => respond(&executor.database_stats()?, codec_out),
            "index_usage_stats" => {
                let indexes = executor.index_usage_stats()?;
                respond(&IndexesResponse { indexes }, codec_out)
            }
            "create_fts_table" => {
                let req: CreateFtsRequest = decode_body(&payload, codec_in)?;
                let created = executor.create_search_index(
                    &req.table_name,
                    &req.columns,
                    req.content_table.as_deref(),
                    req.tokenizer.as_deref(),
                )?;
                respond(&created, codec_out)
            }
            "rebuild_fts_index" => {
                let req: TableRequest = decode_body(&payload, codec_in)?;
                executor.rebuild_search_index(&req.table_name)?;
                respond(
                    &MessageResponse::new(format!("FTS5 index rebuilt for {}", req.table_name)),
                    codec_out,
                )
            }
            "fts_search" => {
                let req: FtsSearchRequest = decode_body(&payload, codec_in)?;
                let results =
                    executor.search(&req.table_name, &req.query, req.limit, req.snippet_length)?;
                respond(&results, codec_out)
            }
            "validate_json" => {
                let req: JsonTextRequest = decode_body(&payload, codec_in)?;
                respond(&executor.validate_json(&req.json_str), codec_out)
            }
            "test_jsonb_conversion" => {
                let req: JsonTextRequest = decode_body(&payload, codec_in)?;
                respond(&executor.test_jsonb_conversion(&req.json_str)?, codec_out)
            }
            "list_resources" => respond(
                &ResourcesResponse {
                    resources: executor.resources(),
                },
                codec_out,
            ),
            "read_resource" => {
                let req: ResourceRequest = decode_body(&payload, codec_in)?;
                let text = executor.read_resource(&req.uri)?;
                let mime_type = executor
                    .resources()
                    .into_iter()
                    .find(|resource| resource.uri == req.uri)
                    .map_or("application/octet-stream", |resource| resource.mime_type);
                respond(
                    &ResourceResponse {
                        uri: req.uri,
                        mime_type: mime_type.to_string(),
                        text,
                    },
                    codec_out,
                )
            }
            other => Err(invalid_input(format!("Unknown entry '{other}'"))),
        }
    }
}

fn decode_body<T: for<'de> serde::Deserialize<'de>>(
    payload: &[u8],
    codec: &str,
) -> Result<T, ExecError> {
    decode_payload(payload, codec).map_err(invalid_input)
}

fn respond<T: Serialize>(value: &T, codec: &str) -> Result<(String, Vec<u8>), ExecError> {
    let encoded = encode_payload(value, codec).map_err(internal_error)?;
    Ok((codec.to_string(), encoded))
}
