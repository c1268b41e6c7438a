//! Scripted HTTP transport for unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::api::{ApiRequest, ApiResponse, HttpTransport};

enum Scripted {
    Response(ApiResponse),
    NetworkError(String),
}

/// Replays queued responses per URL and records every request it sees.
/// A URL with an empty queue fails like an unreachable host.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Scripted>>>,
    requests: Mutex<Vec<ApiRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, url: &str, status: u16, body: &str) {
        self.push(url, Scripted::Response(ApiResponse::new(status, body)));
    }

    pub fn fail(&self, url: &str, message: &str) {
        self.push(url, Scripted::NetworkError(message.to_string()));
    }

    fn push(&self, url: &str, scripted: Scripted) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(scripted);
    }

    pub fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, url: &str) -> Vec<ApiRequest> {
        self.requests().into_iter().filter(|r| r.url == url).collect()
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse> {
        self.requests.lock().unwrap().push(request.clone());
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&request.url)
            .and_then(|queue| queue.pop_front());
        match next {
            Some(Scripted::Response(response)) => Ok(response),
            Some(Scripted::NetworkError(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("no scripted response for {}", request.url)),
        }
    }
}
