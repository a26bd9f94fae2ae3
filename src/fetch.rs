//! `fetch` capability handed to bundles, restricted to an origin allowlist.
//!
//! - Only URLs whose origin is listed can be fetched
//! - Redirects are followed by hand, never leaving the original origin
//! - Requests share the job's deadline

use anyhow::anyhow;
use deno_core::error::AnyError;
use deno_core::{op2, OpState};
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::{Duration, Instant};
use url::Url;

/// Redirect hops followed before giving up.
const MAX_REDIRECTS: usize = 5;

/// Which origins the bundle may reach, and until when.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Allowed origins (e.g., "https://api.example.com")
    /// An origin is scheme + host + port
    pub allowed_origins: Vec<String>,
    pub deadline: Option<Instant>,
}

impl FetchPolicy {
    pub fn new(allowed_origins: Vec<String>, deadline: Option<Instant>) -> Self {
        Self {
            allowed_origins,
            deadline,
        }
    }

    pub fn is_origin_allowed(&self, url: &Url) -> bool {
        let origin = url.origin().ascii_serialization();
        self.allowed_origins.iter().any(|allowed| origin == *allowed)
    }

    fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }
}

/// Request info passed from JS
#[derive(Debug, Deserialize)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    #[serde(default)]
    pub body: Option<String>,
}

/// Response info returned to JS
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchResponse {
    pub ok: bool,
    pub status: u16,
    pub status_text: String,
    pub headers: HashMap<String, String>,
    pub url: String,
    pub body: String,
}

#[op2(async)]
#[serde]
pub async fn op_fetch(
    state: Rc<RefCell<OpState>>,
    #[serde] request: FetchRequest,
) -> Result<FetchResponse, AnyError> {
    let policy = state.borrow().borrow::<FetchPolicy>().clone();
    fetch(request, &policy).await
}

fn parse_method(method: Option<&str>) -> Result<Method, AnyError> {
    Ok(match method.unwrap_or("GET").to_uppercase().as_str() {
        "GET" => Method::GET,
        "POST" => Method::POST,
        "PUT" => Method::PUT,
        "DELETE" => Method::DELETE,
        "PATCH" => Method::PATCH,
        "HEAD" => Method::HEAD,
        "OPTIONS" => Method::OPTIONS,
        other => return Err(anyhow!("Unsupported HTTP method: {}", other)),
    })
}

async fn fetch(request: FetchRequest, policy: &FetchPolicy) -> Result<FetchResponse, AnyError> {
    if policy.allowed_origins.is_empty() {
        return Err(anyhow!("Fetch is disabled for this render"));
    }

    let start = Url::parse(&request.url).map_err(|e| anyhow!("Invalid URL '{}': {}", request.url, e))?;
    if !policy.is_origin_allowed(&start) {
        return Err(anyhow!(
            "Fetch blocked: origin '{}' is not in the allowlist",
            start.origin().ascii_serialization()
        ));
    }

    let mut builder = Client::builder().redirect(reqwest::redirect::Policy::none());
    if let Some(remaining) = policy.remaining() {
        if remaining.is_zero() {
            return Err(anyhow!("Fetch aborted: render deadline passed"));
        }
        builder = builder.timeout(remaining);
    }
    let client = builder
        .build()
        .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

    let mut url = start.clone();
    let mut method = parse_method(request.method.as_deref())?;
    let mut body = request.body;

    for _ in 0..=MAX_REDIRECTS {
        let mut req = client.request(method.clone(), url.clone());
        if let Some(headers) = &request.headers {
            for (key, value) in headers {
                req = req.header(key, value);
            }
        }
        if let Some(body) = body.clone() {
            req = req.body(body);
        }

        let response = req.send().await.map_err(|e| anyhow!("Fetch failed: {}", e))?;
        let status = response.status();

        if status.is_redirection() {
            if let Some(location) = response.headers().get("location") {
                let location = location
                    .to_str()
                    .map_err(|_| anyhow!("Invalid redirect location"))?;
                let next = url
                    .join(location)
                    .map_err(|e| anyhow!("Invalid redirect URL: {}", e))?;
                if next.origin() != start.origin() {
                    return Err(anyhow!(
                        "Fetch blocked: redirect to different origin '{}' (original: '{}')",
                        next.origin().ascii_serialization(),
                        start.origin().ascii_serialization()
                    ));
                }
                url = next;
                // Redirects become body-less GETs
                method = Method::GET;
                body = None;
                continue;
            }
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
            .collect();
        let final_url = response.url().to_string();
        let text = response
            .text()
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        return Ok(FetchResponse {
            ok: status.is_success(),
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or("Unknown").to_string(),
            headers,
            url: final_url,
            body: text,
        });
    }

    Err(anyhow!("Fetch failed: more than {} redirects", MAX_REDIRECTS))
}
