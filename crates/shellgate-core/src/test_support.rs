//! Test doubles shared across the crate's unit tests.

#![allow(clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::CoreError;
use crate::session::ShellBackend;

/// Scripted backend: responses are queued per command and consumed in
/// order. A command with no queued response answers `null`, which the
/// models treat as an empty list.
pub(crate) struct StubBackend {
    responses: Mutex<HashMap<String, VecDeque<Result<Value, String>>>>,
    calls: Mutex<Vec<String>>,
}

impl StubBackend {
    pub(crate) fn new() -> Self {
        Self {
            responses: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn push_ok(&self, command: &str, value: Value) {
        self.responses
            .lock()
            .unwrap()
            .entry(command.to_owned())
            .or_default()
            .push_back(Ok(value));
    }

    pub(crate) fn push_err(&self, command: &str, message: &str) {
        self.responses
            .lock()
            .unwrap()
            .entry(command.to_owned())
            .or_default()
            .push_back(Err(message.to_owned()));
    }

    /// Commands called so far, in call order.
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ShellBackend for StubBackend {
    fn call(&self, command: &str, _args: Value) -> BoxFuture<'_, Result<Value, CoreError>> {
        self.calls.lock().unwrap().push(command.to_owned());
        let next = self
            .responses
            .lock()
            .unwrap()
            .get_mut(command)
            .and_then(VecDeque::pop_front);

        Box::pin(async move {
            match next {
                Some(Ok(value)) => Ok(value),
                Some(Err(message)) => Err(CoreError::Api(shellgate_api::Error::Backend {
                    message,
                })),
                None => Ok(Value::Null),
            }
        })
    }
}
