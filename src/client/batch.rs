use crate::client::{PoolClient, SendOptions};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// One entry of a batch send.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchItem {
    pub host: String,
    pub port: u16,
    pub payload: String,
    #[serde(default)]
    pub vehicle_id: String,
    #[serde(default)]
    pub options: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub duration_ms: f64,
    pub batch_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct BatchOutcome {
    /// Per-entry results, in input order.
    pub results: Vec<Value>,
    pub summary: BatchSummary,
}

impl PoolClient {
    /// Send a batch of frames with bounded concurrency.
    ///
    /// Results keep the input order; entries that fail before reaching the
    /// daemon (validation, open circuit, IPC trouble) become synthetic
    /// `success: false` results so the summary always covers every item.
    pub async fn send_batch(&self, items: Vec<BatchItem>, concurrency: usize) -> BatchOutcome {
        let batch_id = Uuid::new_v4();
        let total = items.len();
        let started = Instant::now();

        debug!(batch_id = %batch_id, total, concurrency, "Dispatching batch");

        let results: Vec<Value> = stream::iter(items.into_iter().map(|item| {
            let client = &*self;
            async move {
                let endpoint = format!("{}:{}", item.host, item.port);
                let item_started = Instant::now();
                let options = SendOptions::from_value(item.options.as_ref());

                match client
                    .send_gps(
                        &item.host,
                        item.port,
                        &item.payload,
                        &item.vehicle_id,
                        options,
                    )
                    .await
                {
                    Ok(mut response) => {
                        if let Some(obj) = response.as_object_mut() {
                            obj.insert("endpoint".to_string(), json!(endpoint));
                        }
                        response
                    }
                    Err(e) => json!({
                        "success": false,
                        "error": e.to_string(),
                        "endpoint": endpoint,
                        "vehicle_id": item.vehicle_id,
                        "duration_ms": item_started.elapsed().as_secs_f64() * 1000.0,
                    }),
                }
            }
        }))
        .buffered(concurrency.max(1))
        .collect()
        .await;

        let successful = results
            .iter()
            .filter(|r| r.get("success").and_then(Value::as_bool).unwrap_or(false))
            .count();

        let summary = BatchSummary {
            total,
            successful,
            failed: total - successful,
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            batch_id,
        };

        debug!(
            batch_id = %batch_id,
            successful = summary.successful,
            failed = summary.failed,
            "Batch complete"
        );

        BatchOutcome { results, summary }
    }
}
