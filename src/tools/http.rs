use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::GeneticsProviderConfig;

use super::ToolProvider;

/// Genetics database provider reached with JSON-RPC `tools/call` requests
/// over plain HTTP.
pub struct HttpProvider {
    cfg: GeneticsProviderConfig,
    http: reqwest::Client,
}

impl HttpProvider {
    pub fn new(cfg: GeneticsProviderConfig, http: reqwest::Client) -> Self {
        Self { cfg, http }
    }
}

fn gene_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z][A-Z0-9]+\b").expect("static regex"))
}

/// Maps the single `query` the assistant supplies onto each downstream
/// tool's parameter shape. Credible-set lookups take a gene symbol, which is
/// extracted from free text when present.
pub(crate) fn downstream_args(tool: &str, query: &str) -> Value {
    match tool {
        "query_credible_sets" => {
            let identifier = gene_re()
                .find(query)
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| query.trim().to_string());
            json!({
                "query_type": "gene",
                "identifier": identifier,
                "format_output": "summary",
                "max_results": 50,
            })
        }
        "identify_phenotype_ids" => json!({ "biological_concept": query }),
        "search_phenotypes_by_description" => json!({ "description": query }),
        // get_api_info and health_check take no arguments
        _ => json!({}),
    }
}

#[async_trait]
impl ToolProvider for HttpProvider {
    fn name(&self) -> &str {
        "finngen"
    }

    fn timeout_secs(&self) -> u64 {
        self.cfg.timeout_secs
    }

    async fn call(&self, tool: &str, args: Value) -> anyhow::Result<Value> {
        let query = args.get("query").and_then(|v| v.as_str()).unwrap_or_default();
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "tools/call",
            "params": { "name": tool, "arguments": downstream_args(tool, query) },
        });

        debug!(url = %self.cfg.url, tool, "calling genetics API");
        let response = self.http.post(&self.cfg.url).json(&request).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("genetics API returned {}", response.status());
        }
        let value: Value = response.json().await?;
        if let Some(error) = value.get("error") {
            anyhow::bail!("genetics API error: {error}");
        }
        Ok(value.get("result").cloned().unwrap_or(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credible_sets_extracts_gene_symbol() {
        let args = downstream_args("query_credible_sets", "tell me about ACTA2 in lung disease");
        assert_eq!(args["identifier"], "ACTA2");
        assert_eq!(args["query_type"], "gene");
        assert_eq!(args["max_results"], 50);
    }

    #[test]
    fn credible_sets_falls_back_to_whole_query() {
        let args = downstream_args("query_credible_sets", "smooth muscle markers");
        assert_eq!(args["identifier"], "smooth muscle markers");
    }

    #[test]
    fn per_tool_parameter_names() {
        assert_eq!(downstream_args("identify_phenotype_ids", "inflammation")["biological_concept"], "inflammation");
        assert_eq!(
            downstream_args("search_phenotypes_by_description", "heart disease")["description"],
            "heart disease"
        );
        assert_eq!(downstream_args("get_api_info", "ignored"), json!({}));
        assert_eq!(downstream_args("health_check", ""), json!({}));
    }

    #[tokio::test]
    async fn call_round_trips_against_a_local_server() {
        use axum::{Json, Router, routing::post};

        async fn rpc(Json(body): Json<Value>) -> Json<Value> {
            assert_eq!(body["method"], "tools/call");
            Json(json!({
                "jsonrpc": "2.0",
                "id": body["id"],
                "result": { "content": format!("handled {}", body["params"]["name"].as_str().unwrap_or("?")) },
            }))
        }

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, Router::new().route("/", post(rpc))).await.unwrap();
        });

        let provider = HttpProvider::new(
            GeneticsProviderConfig { url: format!("http://{addr}/"), timeout_secs: 10 },
            reqwest::Client::new(),
        );
        let result = provider.call("health_check", json!({"query": ""})).await.unwrap();
        assert_eq!(result["content"], "handled health_check");
    }

    #[tokio::test]
    async fn rpc_error_response_is_an_error() {
        use axum::{Json, Router, routing::post};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let app = Router::new().route(
                "/",
                post(|| async { Json(json!({"jsonrpc": "2.0", "id": 1, "error": {"message": "bad tool"}})) }),
            );
            axum::serve(listener, app).await.unwrap();
        });

        let provider = HttpProvider::new(
            GeneticsProviderConfig { url: format!("http://{addr}/"), timeout_secs: 10 },
            reqwest::Client::new(),
        );
        let err = provider.call("query_credible_sets", json!({"query": "IL7"})).await.unwrap_err();
        assert!(err.to_string().contains("bad tool"));
    }
}
