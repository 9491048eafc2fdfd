use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, warn};

use chatflow_core::error::ChatflowError;
use chatflow_core::flow::{HttpRequestProps, OutputKey};
use chatflow_core::traits::{HttpRequest, HttpResponse};
use chatflow_core::types::Value;

use super::{call_with_retries, NodeContext, NodeResult};

pub(super) async fn call(ctx: &mut NodeContext<'_>, props: &HttpRequestProps, envelope: bool) -> NodeResult {
    let request = build_request(ctx, props, envelope);
    let url = request.url.clone();
    let http = ctx.services.http.clone();
    let started = Instant::now();

    let result = call_with_retries(&url, props.retries, request.timeout, || {
        let http = http.clone();
        let request = request.clone();
        async move {
            let target = request.url.clone();
            let response = http.send(request).await?;
            if response.is_success() {
                Ok(response)
            } else {
                Err(ChatflowError::Integration {
                    target,
                    message: format!("HTTP {}", response.status),
                })
            }
        }
    })
    .await;

    ctx.integration_called(&url, result.is_ok(), started);
    match result {
        Ok(response) => {
            debug!(node_id = %ctx.node.id, url = %url, status = response.status, "HTTP node succeeded");
            bind_response(ctx, props, &response);
            NodeResult::Next(OutputKey::Default)
        }
        Err(e) => NodeResult::failed(e),
    }
}

fn build_request(ctx: &NodeContext<'_>, props: &HttpRequestProps, envelope: bool) -> HttpRequest {
    let headers: BTreeMap<String, String> = props
        .headers
        .iter()
        .map(|(k, v)| (k.clone(), ctx.render(v)))
        .collect();
    let body = match &props.body {
        Some(template) => Some(ctx.render(template)),
        None if envelope && props.method.has_body() => Some(context_envelope(ctx).to_string()),
        None => None,
    };
    HttpRequest {
        method: props.method,
        url: ctx.render(&props.url),
        headers,
        body,
        auth: props.auth.clone(),
        signing_secret: props.signing_secret.clone(),
        timeout: ctx.timeout(props.timeout_secs),
    }
}

/// Default webhook payload: who is talking, where, and what the run knows.
fn context_envelope(ctx: &NodeContext<'_>) -> serde_json::Value {
    let state = &*ctx.state;
    let variables: serde_json::Map<String, serde_json::Value> = state
        .variables
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    serde_json::json!({
        "event": "flow.webhook",
        "flow": { "id": state.flow_id.0, "version": state.flow_version },
        "node": ctx.node.id,
        "contact": { "id": state.contact_id.0, "channel": state.channel_id },
        "message": ctx.message_body(),
        "variables": variables,
    })
}

/// Store the response into the configured variable. A missing path binds an
/// empty string and is logged; it does not fail the node.
fn bind_response(ctx: &mut NodeContext<'_>, props: &HttpRequestProps, response: &HttpResponse) {
    let Some(variable) = &props.response_variable else {
        return;
    };
    let value = match &props.response_path {
        None => Value::String(response.body.clone()),
        Some(path) => match response.json().as_ref().and_then(|json| extract_path(json, path)) {
            Some(found) => Value::from_json(found),
            None => {
                warn!(node_id = %ctx.node.id, path = %path, "Response path not found");
                Value::String(String::new())
            }
        },
    };
    ctx.state.set_var(variable.clone(), value);
}

/// Walk a dot path such as `data.items.0.name` through objects and arrays.
pub fn extract_path<'a>(json: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(json, |current, segment| match current {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}
