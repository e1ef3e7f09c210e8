//! Scripted step executor for tests

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{EngineError, Result};
use crate::executor::{StepContext, StepExecutor, StepRequest};

/// How the scripted executor answers a node
#[derive(Debug, Clone)]
pub enum Reply {
    /// Return the rendered text unchanged
    Echo,
    Value(String),
    Fail(String),
    /// Never finish
    Hang,
    /// Echo after a delay
    Delay(u64),
}

/// Answers each node according to a script, recording every request
#[derive(Default)]
pub struct ScriptedExecutor {
    replies: Mutex<HashMap<String, Reply>>,
    requests: Mutex<Vec<StepRequest>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, node_id: &str, reply: Reply) -> Self {
        self.replies.lock().unwrap().insert(node_id.to_string(), reply);
        self
    }

    pub fn value(self, node_id: &str, value: &str) -> Self {
        self.with(node_id, Reply::Value(value.to_string()))
    }

    pub fn requests(&self) -> Vec<StepRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Rendered texts sent for one node, in call order
    pub fn texts_for(&self, node_id: &str) -> Vec<String> {
        self.requests()
            .into_iter()
            .filter(|r| r.node_id == node_id)
            .map(|r| r.text)
            .collect()
    }

    pub fn calls_to(&self, node_id: &str) -> usize {
        self.texts_for(node_id).len()
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, request: StepRequest, context: StepContext) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .get(&request.node_id)
            .cloned()
            .unwrap_or(Reply::Echo);

        context.progress("started");
        match reply {
            Reply::Echo => Ok(request.text),
            Reply::Value(value) => Ok(value),
            Reply::Fail(message) => Err(EngineError::failed(message)),
            Reply::Hang => std::future::pending::<Result<String>>().await,
            Reply::Delay(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(request.text)
            }
        }
    }
}
