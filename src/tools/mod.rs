use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::warn;

use crate::config::ChatConfig;

pub mod format;
pub mod http;
pub mod stdio;

pub use format::format_tool_text;

#[derive(Debug, Clone, Serialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
}

impl ParamSpec {
    pub fn string(description: &str) -> Self {
        Self { kind: "string".into(), description: description.into() }
    }
}

/// A callable tool as advertised to the completion API. Names are namespaced
/// `provider:tool`; `remote_name` is what the owning provider knows it as.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub parameters: BTreeMap<String, ParamSpec>,
    pub provider: String,
    pub remote_name: String,
    pub placeholder: String,
}

impl ToolDescriptor {
    pub fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": self.parameters,
            "required": ["query"],
        })
    }
}

/// The completion API rejects `:` in tool names; adapted names use `_`.
pub fn api_tool_name(name: &str) -> String {
    name.replace(':', "_")
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    fn name(&self) -> &str;
    fn timeout_secs(&self) -> u64 {
        60
    }
    async fn call(&self, tool: &str, args: Value) -> anyhow::Result<Value>;
}

#[derive(Default)]
pub struct ToolRegistry {
    descriptors: Vec<ToolDescriptor>,
    providers: HashMap<String, Arc<dyn ToolProvider>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only providers that are actually configured contribute tools, so the
    /// live set varies with provider availability.
    pub fn from_config(cfg: &ChatConfig, client: &reqwest::Client) -> Self {
        let mut registry = Self::new();
        if let Some(sc) = &cfg.search_provider {
            registry.register(Arc::new(stdio::StdioProvider::new(sc.clone())), search_descriptors());
        }
        if let Some(gc) = &cfg.genetics_provider {
            registry.register(
                Arc::new(http::HttpProvider::new(gc.clone(), client.clone())),
                genetics_descriptors(),
            );
        }
        registry
    }

    pub fn register(&mut self, provider: Arc<dyn ToolProvider>, descriptors: Vec<ToolDescriptor>) {
        self.providers.insert(provider.name().to_string(), provider);
        self.descriptors.extend(descriptors);
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.iter().find(|d| d.name == name)
    }

    /// Reverses `api_tool_name` by comparing adapted registry names.
    pub fn resolve_api_name(&self, api_name: &str) -> Option<&ToolDescriptor> {
        self.descriptors.iter().find(|d| api_tool_name(&d.name) == api_name)
    }

    pub fn provider(&self, name: &str) -> Option<Arc<dyn ToolProvider>> {
        self.providers.get(name).cloned()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

pub struct ToolDispatcher {
    registry: ToolRegistry,
}

impl ToolDispatcher {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    /// Tool list in the completion API's wire shape; empty when no provider
    /// is configured.
    pub fn api_tools(&self) -> Vec<Value> {
        self.registry
            .descriptors()
            .iter()
            .map(|d| {
                json!({
                    "name": api_tool_name(&d.name),
                    "description": d.description,
                    "input_schema": d.input_schema(),
                })
            })
            .collect()
    }

    /// Resolves a tool by registry name and calls its provider. Unknown tools
    /// are a hard error; provider failures come back as readable text so the
    /// stream can surface them without aborting.
    pub async fn invoke(&self, name: &str, args: &Value) -> Result<String, ToolError> {
        let desc = self
            .registry
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;
        metrics::counter!("chat_tool_calls_total", "tool" => desc.name.clone()).increment(1);

        // The model occasionally calls tools with missing or empty arguments.
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .unwrap_or_else(|| {
                warn!(tool = %desc.name, "tool called without a query, substituting placeholder");
                desc.placeholder.clone()
            });

        let Some(provider) = self.registry.provider(&desc.provider) else {
            return Ok(format!("Tool {} is not available right now.", desc.name));
        };
        let call = provider.call(&desc.remote_name, json!({ "query": query }));
        let result = match tokio::time::timeout(Duration::from_secs(provider.timeout_secs()), call).await {
            Err(_) => {
                warn!(tool = %desc.name, "tool call timed out");
                return Ok(format!("Tool {} timed out.", desc.name));
            }
            Ok(Err(e)) => {
                warn!(tool = %desc.name, error = %e, "tool call failed");
                return Ok(format!("Tool {} failed: {e}", desc.name));
            }
            Ok(Ok(value)) => value,
        };
        Ok(format_tool_text(&normalize_result(&result)))
    }

    /// Entry point for tool names as the completion API emits them.
    pub async fn invoke_api_name(&self, api_name: &str, args: &Value) -> Result<(String, String), ToolError> {
        let name = self
            .registry
            .resolve_api_name(api_name)
            .map(|d| d.name.clone())
            .ok_or_else(|| ToolError::UnknownTool(api_name.to_string()))?;
        let text = self.invoke(&name, args).await?;
        Ok((name, text))
    }
}

/// Providers returning a `content` field get that field's string form; MCP
/// style `content` block lists are joined; anything else is pretty-printed.
pub fn normalize_result(value: &Value) -> String {
    if let Some(content) = value.get("content") {
        match content {
            Value::String(s) => return s.clone(),
            Value::Array(items) if !items.is_empty() => {
                return items
                    .iter()
                    .map(|item| {
                        item.get("text")
                            .and_then(|t| t.as_str())
                            .map(ToString::to_string)
                            .unwrap_or_else(|| item.to_string())
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
            }
            _ => {}
        }
    }
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}

pub fn search_descriptors() -> Vec<ToolDescriptor> {
    vec![ToolDescriptor {
        name: "perplexity-ask:perplexity_ask".into(),
        description: "Search the web using Perplexity AI to get current information and research. \
            Use this when you need current information, recent papers, or want to verify facts."
            .into(),
        parameters: BTreeMap::from([(
            "query".to_string(),
            ParamSpec::string("The search query to find information about. Be specific and include relevant keywords."),
        )]),
        provider: "perplexity-ask".into(),
        remote_name: "perplexity_ask".into(),
        placeholder: "Please provide a search query".into(),
    }]
}

pub fn genetics_descriptors() -> Vec<ToolDescriptor> {
    let query_param = |desc: &str| BTreeMap::from([("query".to_string(), ParamSpec::string(desc))]);
    vec![
        ToolDescriptor {
            name: "finngen:query_credible_sets".into(),
            description: "Query the FinnGen Credible Sets API for genetic association data. Can search \
                by gene name, phenotype, or genomic region to find genetic variants and their disease associations."
                .into(),
            parameters: query_param("Gene name (e.g., 'IL7', 'ACTA2') or search query for genetic associations."),
            provider: "finngen".into(),
            remote_name: "query_credible_sets".into(),
            placeholder: "Please provide a gene name or search query".into(),
        },
        ToolDescriptor {
            name: "finngen:get_api_info".into(),
            description: "Get information about the FinnGen Credible Sets API endpoints and usage documentation.".into(),
            parameters: query_param("Optional query for specific API information (can be empty)."),
            provider: "finngen".into(),
            remote_name: "get_api_info".into(),
            placeholder: String::new(),
        },
        ToolDescriptor {
            name: "finngen:health_check".into(),
            description: "Check if the FinnGen Credible Sets API is accessible and working properly.".into(),
            parameters: query_param("Optional query for health check (can be empty)."),
            provider: "finngen".into(),
            remote_name: "health_check".into(),
            placeholder: String::new(),
        },
        ToolDescriptor {
            name: "finngen:identify_phenotype_ids".into(),
            description: "Identify phenotype IDs in the FinnGen database for any biological concept. Use \
                this to find relevant phenotypes based on genes, functions, processes, or disease mechanisms."
                .into(),
            parameters: query_param("Biological concept description (e.g., 'cholesterol metabolism', 'inflammation', 'PCSK9')."),
            provider: "finngen".into(),
            remote_name: "identify_phenotype_ids".into(),
            placeholder: "Please provide a biological concept".into(),
        },
        ToolDescriptor {
            name: "finngen:search_phenotypes_by_description".into(),
            description: "Search for phenotypes in the FinnGen database using natural language descriptions \
                of medical conditions, symptoms, or biological processes."
                .into(),
            parameters: query_param("Natural language description of a phenotype, condition, or symptom."),
            provider: "finngen".into(),
            remote_name: "search_phenotypes_by_description".into(),
            placeholder: "Please provide a phenotype description".into(),
        },
    ]
}
