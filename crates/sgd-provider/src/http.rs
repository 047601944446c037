//! Real HTTP transport for [`crate::ProviderClient`]: a JSON POST per model
//! call, in the shape OpenRouter-compatible chat/image endpoints expose.

use std::collections::HashMap;
use std::sync::Arc;

use crate::{InvokeFn, ProviderResponse, ProviderTask};

#[derive(Debug, Clone)]
pub struct ModelEndpoint {
    pub url: String,
    pub request_template: serde_json::Value,
}

/// Build an [`InvokeFn`] that POSTs `request_template` (with `"model"` set
/// to the routed model name) to the endpoint registered for that model,
/// authenticated with `api_key` as a bearer token.
pub fn openrouter_style_invoke(
    client: reqwest::Client,
    api_key: String,
    endpoints: HashMap<String, ModelEndpoint>,
) -> InvokeFn {
    let endpoints = Arc::new(endpoints);
    Arc::new(move |model: String, _task: ProviderTask, payload: serde_json::Value| {
        let client = client.clone();
        let api_key = api_key.clone();
        let endpoints = endpoints.clone();
        Box::pin(async move {
            let endpoint = endpoints
                .get(&model)
                .ok_or_else(|| format!("no endpoint configured for model {model}"))?;

            let mut body = endpoint.request_template.clone();
            if let (Some(obj), Some(payload_obj)) = (body.as_object_mut(), payload.as_object()) {
                for (key, value) in payload_obj {
                    obj.insert(key.clone(), value.clone());
                }
            }
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".to_string(), serde_json::Value::String(model.clone()));
            }

            let response = client
                .post(&endpoint.url)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| e.to_string())?;

            if !response.status().is_success() {
                return Err(format!("provider returned status {}", response.status()));
            }

            let parsed: ProviderResponse = response.json().await.map_err(|e| e.to_string())?;
            Ok(parsed)
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn endpoint(url: String) -> HashMap<String, ModelEndpoint> {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            "stub-model".to_string(),
            ModelEndpoint {
                url,
                request_template: serde_json::json!({"messages": [{"role": "user", "content": "hi"}]}),
            },
        );
        endpoints
    }

    #[tokio::test]
    async fn posts_merged_body_with_bearer_auth_and_parses_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "cost_usd": 0.02,
                "usage": {"prompt_tokens": 3, "completion_tokens": 7},
                "body": {"choices": []},
            })))
            .mount(&server)
            .await;

        let invoke = openrouter_style_invoke(
            reqwest::Client::new(),
            "test-key".to_string(),
            endpoint(format!("{}/v1/chat/completions", server.uri())),
        );

        let result = invoke("stub-model".to_string(), ProviderTask::Planner, serde_json::json!({"temperature": 0.2}))
            .await
            .unwrap();

        assert_eq!(result.cost_usd, Some(0.02));
        assert_eq!(result.usage.prompt_tokens, 3);
    }

    #[tokio::test]
    async fn unknown_model_fails_without_any_request() {
        let server = MockServer::start().await;
        let invoke = openrouter_style_invoke(reqwest::Client::new(), "test-key".to_string(), endpoint(server.uri()));

        let error = invoke("nonexistent-model".to_string(), ProviderTask::Critic, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(error.contains("no endpoint configured"));
    }

    #[tokio::test]
    async fn non_success_status_is_surfaced_as_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let invoke = openrouter_style_invoke(
            reqwest::Client::new(),
            "test-key".to_string(),
            endpoint(format!("{}/v1/chat/completions", server.uri())),
        );

        let error = invoke("stub-model".to_string(), ProviderTask::Image, serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(error.contains("503"));
    }
}
