//! The unit of in-flight work: one (possibly batched) JSON-RPC request, the
//! responses collected for it, and the error trail across retries.
//!
//! A context owns every intermediate allocation of its request. Dropping it
//! releases them all, on every exit path.

use serde_json::{json, Value};

use veritas_types::envelope::RpcResponse;
use veritas_types::errors::{ClientError, ErrorCode};

#[derive(Debug, Clone)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn to_json(&self) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": self.id,
            "method": self.method,
            "params": self.params,
        })
    }
}

#[derive(Debug)]
pub struct RequestContext {
    pub requests: Vec<RpcRequest>,
    /// Parallel to `requests`; filled as responses verify.
    pub responses: Vec<Option<RpcResponse>>,
    /// Registry slots used in the most recent round.
    pub nodes: Vec<usize>,
    /// Aggregated failure trail; cleared when a round ultimately succeeds.
    pub error: Option<String>,
    pub attempt: u8,
}

impl RequestContext {
    pub fn single(method: &str, params: Value) -> Result<Self, ClientError> {
        Self::batch(vec![(method.to_owned(), params)])
    }

    pub fn batch(calls: Vec<(String, Value)>) -> Result<Self, ClientError> {
        if calls.is_empty() {
            return Err(ClientError::invalid("empty request batch"));
        }
        let requests: Vec<RpcRequest> = calls
            .into_iter()
            .enumerate()
            .map(|(index, (method, params))| {
                let params = if params.is_null() { json!([]) } else { params };
                RpcRequest { id: index as u64 + 1, method, params }
            })
            .collect();
        for request in &requests {
            if !request.params.is_array() {
                return Err(ClientError::invalid(format!(
                    "params of {} must be an array",
                    request.method
                )));
            }
        }
        let responses = vec![None; requests.len()];
        Ok(Self { requests, responses, nodes: Vec::new(), error: None, attempt: 0 })
    }

    /// The JSON-RPC payload sent to every selected node: a single object, or
    /// an array for a batch.
    pub fn body(&self) -> String {
        if self.requests.len() == 1 {
            self.requests[0].to_json().to_string()
        } else {
            Value::Array(self.requests.iter().map(RpcRequest::to_json).collect()).to_string()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.responses.iter().all(Option::is_some)
    }

    /// Positions that still lack a verified response.
    pub fn missing(&self) -> Vec<usize> {
        self.responses
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.is_none().then_some(index))
            .collect()
    }

    pub fn record_error(&mut self, message: impl AsRef<str>) {
        match &mut self.error {
            Some(trail) => {
                trail.push(':');
                trail.push_str(message.as_ref());
            }
            None => self.error = Some(message.as_ref().to_owned()),
        }
    }

    /// The single result the caller asked for: the first response's result,
    /// or the error the node (or the send loop) produced.
    pub fn result(&self) -> Result<&Value, ClientError> {
        let response = self.responses[0].as_ref().ok_or_else(|| {
            ClientError::unknown(
                self.error.clone().unwrap_or_else(|| "no result and also no error".into()),
            )
        })?;
        if let Some(result) = &response.result {
            return Ok(result);
        }
        if let Some(error) = response.error_text() {
            return Err(ClientError::new(ErrorCode::Rpc, error));
        }
        Err(ClientError::new(ErrorCode::RpcNoResult, "no result and also no error"))
    }
}
