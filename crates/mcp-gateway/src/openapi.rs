//! OpenAPI assembly for the direct-tool-call facade.
//!
//! One POST operation per discovered tool, with the tool's input schema as
//! the request body. Assembled documents are cached briefly so dashboard
//! polling doesn't re-walk the tool cache.

use std::sync::Arc;

use moka::future::Cache;
use serde_json::{Map, Value, json};

use crate::config::timeouts;
use crate::toolcache::{ToolCache, ToolDescriptor};

/// Builds and caches OpenAPI documents from the current tool cache snapshot.
pub struct OpenApiBuilder {
    tools: Arc<ToolCache>,
    cache: Cache<String, Value>,
}

impl OpenApiBuilder {
    #[must_use]
    pub fn new(tools: Arc<ToolCache>) -> Self {
        let cache = Cache::builder()
            .max_capacity(64)
            .time_to_live(timeouts::OPENAPI_CACHE_TTL)
            .build();
        Self { tools, cache }
    }

    /// Spec covering a single backend's tools.
    pub async fn spec_for_backend(&self, backend: &str) -> Value {
        let key = format!("backend:{backend}");
        let tools = &self.tools;
        let backend = backend.to_string();
        self.cache
            .get_with(key, async move {
                let descriptors = tools.tools_for_backend(&backend).await;
                assemble_spec(&format!("{backend} tools"), &descriptors)
            })
            .await
    }

    /// Spec covering every discovered tool across the fleet.
    pub async fn merged_spec(&self) -> Value {
        let tools = &self.tools;
        self.cache
            .get_with("merged".to_string(), async move {
                let mut descriptors: Vec<ToolDescriptor> =
                    tools.all_tools().await.into_values().flatten().collect();
                descriptors.sort_by(|a, b| a.name.cmp(&b.name));
                assemble_spec("MCP gateway tools", &descriptors)
            })
            .await
    }

    /// Drop cached documents (used by reload).
    pub fn invalidate_all(&self) {
        self.cache.invalidate_all();
    }
}

impl std::fmt::Debug for OpenApiBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenApiBuilder").finish()
    }
}

/// Assemble an OpenAPI 3.1 document with one POST path per tool.
#[must_use]
pub fn assemble_spec(title: &str, tools: &[ToolDescriptor]) -> Value {
    let mut paths = Map::new();
    for tool in tools {
        paths.insert(
            format!("/{}", tool.name),
            json!({
                "post": {
                    "operationId": tool.name,
                    "summary": tool.description,
                    "requestBody": {
                        "required": true,
                        "content": {
                            "application/json": {
                                "schema": tool.input_schema,
                            }
                        }
                    },
                    "responses": {
                        "200": {
                            "description": "Post-processed tool result",
                            "content": {"application/json": {}}
                        }
                    }
                }
            }),
        );
    }

    json!({
        "openapi": "3.1.0",
        "info": {
            "title": title,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "paths": Value::Object(paths),
    })
}
