//! Weighted routing across several endpoints

use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::{debug, warn};

use super::{CompletionRequest, CompletionResponse, LlmClient, LlmError, OpenAIClient};
use crate::config::LlmConfig;

/// One routable endpoint
pub struct Route {
    pub name: String,
    pub weight: u32,
    pub client: Arc<dyn LlmClient>,
}

/// Spreads requests over endpoints by relative weight
///
/// Each call picks a first endpoint at random in proportion to its weight.
/// If that endpoint fails with a retryable error the remaining endpoints are
/// tried, again in weighted random order, before the error is returned.
pub struct LlmRouter {
    routes: Vec<Route>,
}

impl LlmRouter {
    pub fn new(routes: Vec<Route>) -> Result<Self, LlmError> {
        debug!(routes = routes.len(), "LlmRouter::new: called");
        if routes.iter().all(|r| r.weight == 0) {
            return Err(LlmError::NoEndpoints);
        }
        Ok(Self { routes })
    }

    /// Build one OpenAI-compatible client per configured endpoint
    pub fn from_config(config: &LlmConfig) -> Result<Self, LlmError> {
        debug!(endpoints = config.endpoints.len(), "LlmRouter::from_config: called");
        let routes = config
            .endpoints
            .iter()
            .map(|endpoint| {
                Ok(Route {
                    name: endpoint.name.clone(),
                    weight: endpoint.weight,
                    client: Arc::new(OpenAIClient::from_endpoint(endpoint, config)?) as Arc<dyn LlmClient>,
                })
            })
            .collect::<Result<Vec<_>, LlmError>>()?;
        Self::new(routes)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Route indices in weighted random order, zero-weight routes excluded
    fn attempt_order(&self, rng: &mut impl Rng) -> Vec<usize> {
        let mut remaining: Vec<usize> = (0..self.routes.len()).filter(|&i| self.routes[i].weight > 0).collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let total: u64 = remaining.iter().map(|&i| u64::from(self.routes[i].weight)).sum();
            let mut pick = rng.random_range(0..total);
            let mut chosen = remaining.len() - 1;
            for (pos, &i) in remaining.iter().enumerate() {
                let weight = u64::from(self.routes[i].weight);
                if pick < weight {
                    chosen = pos;
                    break;
                }
                pick -= weight;
            }
            order.push(remaining.remove(chosen));
        }
        order
    }
}

#[async_trait]
impl LlmClient for LlmRouter {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let order = self.attempt_order(&mut rand::rng());
        debug!(?order, "LlmRouter::complete: called");

        let mut last_error = LlmError::NoEndpoints;
        for i in order {
            let route = &self.routes[i];
            match route.client.complete(request.clone()).await {
                Ok(mut response) => {
                    if response.endpoint.is_none() {
                        response.endpoint = Some(route.name.clone());
                    }
                    debug!(endpoint = %route.name, tokens = response.usage.total(), "LlmRouter::complete: success");
                    return Ok(response);
                }
                Err(e) if e.is_retryable() => {
                    warn!(endpoint = %route.name, error = %e, "LLM endpoint failed, trying next");
                    last_error = e;
                }
                Err(e) => {
                    warn!(endpoint = %route.name, error = %e, "LLM endpoint failed");
                    return Err(e);
                }
            }
        }
        Err(last_error)
    }
}
