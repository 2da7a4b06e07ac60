//! The send loop: node selection, dispatch, verification, blacklisting and
//! retry.
//!
//! Verifiers are pure; everything that mutates the registry — response-time
//! accounting, blacklisting, the node-list refresh — happens here, under the
//! registry write lock.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde_json::{json, Value};

use veritas_types::envelope::RpcResponse;
use veritas_types::errors::{ClientError, ErrorCode};
use veritas_types::utils::hex_encode;
use veritas_verify::nodelist::{parse_node_list, result_contract};
use veritas_verify::{verify_response, VerifyCtx};

use crate::cache;
use crate::context::RequestContext;
use crate::registry;
use crate::transport::TransportRequest;
use crate::Client;

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Why a node is being excluded; decides the blacklist window.
enum Offense {
    /// Timeout, connection failure, malformed body: short exclusion.
    Transport,
    /// Failed proof or lying response: long exclusion.
    Trust,
}

impl Client {
    /// Drives a context to completion: ensure the node list, then rounds of
    /// select → dispatch → verify until every request has a verified
    /// response or the retry budget is spent. Exhaustion leaves the error
    /// trail on the context.
    pub(crate) async fn execute(&self, ctx: &mut RequestContext) -> Result<(), ClientError> {
        self.ensure_node_list().await?;
        self.run(ctx).await
    }

    pub(crate) async fn run(&self, ctx: &mut RequestContext) -> Result<(), ClientError> {
        let rounds = self.config.retry_budget.max(1);
        while ctx.attempt < rounds && !ctx.is_complete() {
            ctx.attempt += 1;
            let slots = {
                let mut chain = self.chain.write();
                registry::pick_nodes(
                    &mut chain,
                    &self.config,
                    now_ms(),
                    &mut rand::thread_rng(),
                )?
            };
            log::debug!(
                "round {} for {}: asking {} node(s)",
                ctx.attempt,
                ctx.requests[0].method,
                slots.len()
            );
            ctx.nodes = slots.clone();

            let body = ctx.body();
            let requests: Vec<TransportRequest> = {
                let chain = self.chain.read();
                slots
                    .iter()
                    .map(|slot| TransportRequest {
                        url: chain.nodes[*slot].url.clone(),
                        body: body.clone(),
                    })
                    .collect()
            };
            let outcomes =
                self.transport.send(requests, u64::from(self.config.timeout_ms)).await;

            for (slot, outcome) in slots.iter().zip(outcomes) {
                let response = match outcome {
                    Ok(response) => response,
                    Err(err) => {
                        self.punish(*slot, Offense::Transport);
                        ctx.record_error(err.to_string());
                        continue;
                    }
                };
                self.track_response_time(*slot, response.elapsed_ms);
                if response.status != 200 {
                    self.punish(*slot, Offense::Transport);
                    ctx.record_error(format!("node answered with status {}", response.status));
                    continue;
                }
                match self.check_response(ctx, &response.body) {
                    Ok(responses) => {
                        for (index, response) in responses.into_iter().enumerate() {
                            ctx.responses[index] = Some(response);
                        }
                        ctx.error = None;
                        return Ok(());
                    }
                    Err(err) => {
                        self.punish(*slot, Offense::Trust);
                        ctx.record_error(err.to_string());
                    }
                }
            }
        }
        if !ctx.is_complete() && ctx.error.is_none() {
            ctx.record_error("no node delivered a verifiable response");
        }
        Ok(())
    }

    /// Parses one node's body and verifies every sub-response against its
    /// proof envelope. All requests must verify for the node's answer to be
    /// accepted.
    fn check_response(
        &self,
        ctx: &RequestContext,
        body: &str,
    ) -> Result<Vec<RpcResponse>, ClientError> {
        let parsed: Value = serde_json::from_str(body)
            .map_err(|err| ClientError::new(ErrorCode::BadData, format!("invalid JSON: {err}")))?;
        let entries: Vec<Value> = match parsed {
            Value::Array(entries) => entries,
            single => vec![single],
        };

        let mut ordered: Vec<Option<RpcResponse>> = vec![None; ctx.requests.len()];
        for entry in entries {
            let response: RpcResponse = serde_json::from_value(entry).map_err(|err| {
                ClientError::new(ErrorCode::BadData, format!("invalid response shape: {err}"))
            })?;
            let id = response.id.as_u64().unwrap_or(0);
            let position = ctx
                .requests
                .iter()
                .position(|request| request.id == id)
                .ok_or_else(|| {
                    ClientError::new(ErrorCode::BadData, format!("unknown response id {id}"))
                })?;
            ordered[position] = Some(response);
        }

        let chain = self.chain.read();
        let node_addresses: Vec<_> =
            chain.nodes.iter().map(|node| node.address).collect();
        let mut verified = Vec::with_capacity(ctx.requests.len());
        for (request, slot) in ctx.requests.iter().zip(ordered) {
            let response = slot.ok_or_else(|| {
                ClientError::new(
                    ErrorCode::RpcNoResult,
                    format!("no response for request id {}", request.id),
                )
            })?;
            let null_result = Value::Null;
            let verify_ctx = VerifyCtx {
                method: &request.method,
                params: &request.params,
                result: response.result.as_ref().unwrap_or(&null_result),
                proof: response.proof.as_ref(),
                spec: &chain.spec,
                chain_id: chain.chain_id,
                node_addresses: &node_addresses,
                registry_contract: chain.contract,
                signature_count: self.config.signature_count,
                verification: self.config.verification,
            };
            verify_response(&verify_ctx)
                .map_err(|err| ClientError::unknown(err.to_string()))?;
            verified.push(response);
        }
        Ok(verified)
    }

    fn punish(&self, slot: usize, offense: Offense) {
        let window = match offense {
            Offense::Transport => self.config.blacklist_transport_ms,
            Offense::Trust => self.config.blacklist_trust_ms,
        };
        let mut chain = self.chain.write();
        if let Some(weight) = chain.weights.get_mut(slot) {
            weight.blacklisted_until_ms = now_ms() + window;
            log::debug!(
                "blacklisting node {} for {window} ms",
                chain.nodes[slot].url
            );
        }
    }

    fn track_response_time(&self, slot: usize, elapsed_ms: u64) {
        let mut chain = self.chain.write();
        if let Some(weight) = chain.weights.get_mut(slot) {
            weight.track_response(elapsed_ms);
        }
    }

    /// Makes the chain ready for selection: load the cached list if there is
    /// one, refresh over the network when the list is marked stale.
    pub(crate) async fn ensure_node_list(&self) -> Result<(), ClientError> {
        let (has_nodes, needs_update) = {
            let chain = self.chain.read();
            (!chain.nodes.is_empty(), chain.needs_update)
        };
        if has_nodes && !needs_update {
            return Ok(());
        }

        if let Some(storage) = &self.storage {
            if let Some(blob) = storage.get(&cache::cache_key(self.config.chain_id)) {
                match cache::decode_node_list(&blob) {
                    Ok(cached) if !cached.nodes.is_empty() => {
                        let mut chain = self.chain.write();
                        chain.contract = cached.contract;
                        chain.nodes = cached.nodes;
                        chain.weights = cached.weights;
                        chain.last_block = cached.last_block;
                        chain.needs_update = false;
                        log::debug!("loaded {} nodes from cache", chain.nodes.len());
                        return Ok(());
                    }
                    Ok(_) => {}
                    Err(err) => log::warn!("dropping cached nodelist: {err}"),
                }
            }
        }

        if !has_nodes {
            return Err(ClientError::new(
                ErrorCode::NotFound,
                "no nodes known for this chain; configure boot nodes or a cache",
            ));
        }
        self.update_node_list().await
    }

    /// Fetches a fresh node list through a verified `in3_nodeList` request
    /// and installs it, persisting to the cache when one is attached.
    pub async fn update_node_list(&self) -> Result<(), ClientError> {
        log::debug!("updating the nodelist");
        let mut seed = [0u8; 32];
        rand::thread_rng().fill(&mut seed);
        let params = json!([self.config.node_limit, hex_encode(seed), []]);

        {
            // A stale flag must not re-trigger the refresh from within.
            self.chain.write().needs_update = false;
        }
        let mut ctx = RequestContext::single("in3_nodeList", params)?;
        self.run(&mut ctx).await?;
        let result = ctx
            .result()
            .map_err(|err| ClientError::new(ErrorCode::Rpc, format!("error updating node_list: {}", err.message)))?;

        let (nodes, last_block) = parse_node_list(result)
            .map_err(|err| ClientError::new(ErrorCode::BadData, err.to_string()))?;
        let contract = result_contract(result)
            .map_err(|err| ClientError::new(ErrorCode::BadData, err.to_string()))?;
        for node in &nodes {
            url::Url::parse(&node.url).map_err(|err| {
                ClientError::new(
                    ErrorCode::BadData,
                    format!("node {} has an invalid url: {err}", node.index),
                )
            })?;
        }

        {
            let mut chain = self.chain.write();
            chain.contract = contract;
            chain.install_nodes(nodes, last_block);
            if let Some(storage) = &self.storage {
                storage.set(&cache::cache_key(chain.chain_id), cache::encode_node_list(&chain));
            }
            log::debug!("installed {} nodes at block {last_block}", chain.nodes.len());
        }
        Ok(())
    }
}
