//! Test utilities for sift-core
//!
//! A mock OpenAI-compatible server for HTTP-level tests of the LLM and
//! embedding clients. Chat completions are answered by merchant keyword, the
//! same way `MockLlmClient` answers.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Json, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::llm::keyword_category;
use crate::similarity::HashingEmbedder;

const EMBEDDING_DIMENSIONS: usize = 8;

#[derive(Default)]
struct ServerState {
    failing: bool,
    requests: AtomicUsize,
    last_authorization: Mutex<Option<String>>,
}

/// Mock OpenAI-compatible server for testing
pub struct MockLlmServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockLlmServer {
    /// Start the mock server on an available port
    pub async fn start() -> Self {
        Self::spawn(ServerState::default()).await
    }

    /// Start a server whose chat endpoint always answers 500
    pub async fn start_failing() -> Self {
        Self::spawn(ServerState {
            failing: true,
            ..ServerState::default()
        })
        .await
    }

    async fn spawn(state: ServerState) -> Self {
        let state = Arc::new(state);
        let app = Router::new()
            .route("/v1/models", get(handle_models))
            .route("/v1/chat/completions", post(handle_chat))
            .route("/v1/embeddings", post(handle_embeddings))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Get the base URL for this mock server
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Chat completion requests received so far
    pub fn requests(&self) -> usize {
        self.state.requests.load(Ordering::SeqCst)
    }

    /// Authorization header of the most recent chat request
    pub fn last_authorization(&self) -> Option<String> {
        self.state.last_authorization.lock().unwrap().clone()
    }

    /// Stop the mock server
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for MockLlmServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Deserialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingRequest {
    input: Vec<String>,
}

/// Health check endpoint
async fn handle_models() -> Json<Value> {
    Json(json!({ "object": "list", "data": [{ "id": "gpt-4o-mini", "object": "model" }] }))
}

async fn handle_chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<Value>, (StatusCode, String)> {
    state.requests.fetch_add(1, Ordering::SeqCst);
    *state.last_authorization.lock().unwrap() = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if state.failing {
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "mock failure".to_string()));
    }

    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .unwrap_or_default();

    Ok(Json(json!({
        "model": request.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": categorize_prompt(prompt) },
            "finish_reason": "stop",
        }],
        "usage": { "prompt_tokens": 321, "completion_tokens": 42, "total_tokens": 363 },
    })))
}

async fn handle_embeddings(Json(request): Json<EmbeddingRequest>) -> Json<Value> {
    let embedder = HashingEmbedder::new(EMBEDDING_DIMENSIONS);
    let data: Vec<Value> = request
        .input
        .iter()
        .enumerate()
        .map(|(index, text)| json!({ "object": "embedding", "index": index, "embedding": embedder.vector(text) }))
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

/// Answer every "- id: ..." line of a categorization prompt
fn categorize_prompt(prompt: &str) -> String {
    let entries: Vec<Value> = prompt
        .lines()
        .filter_map(|line| line.strip_prefix("- id: "))
        .map(|line| {
            let mut fields = line.split(" | ");
            let id = fields.next().unwrap_or_default().trim();
            let text: Vec<&str> = fields
                .filter_map(|f| f.strip_prefix("merchant: ").or_else(|| f.strip_prefix("description: ")))
                .collect();
            let category = keyword_category(&text.join(" "));
            json!({
                "transaction_id": id,
                "category_name": category,
                "confidence": 0.9,
                "rationale": format!("merchant looks like {}", category),
            })
        })
        .collect();
    Value::Array(entries).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categorize_prompt_reads_transaction_lines() {
        let prompt = "Available categories (id: name):\n- 1: Groceries\n\nTransactions:\n\
                      - id: abc | date: 2024-01-01 | amount: -5.00 | merchant: WHOLE FOODS | description: -\n";
        let entries: Vec<Value> = serde_json::from_str(&categorize_prompt(prompt)).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["transaction_id"], "abc");
        assert_eq!(entries[0]["category_name"], "Groceries");
    }
}
