//! A stateless, trust-minimized JSON-RPC client.
//!
//! Every request is sent to a weighted random subset of registry nodes and
//! each response is cryptographically verified against its proof envelope
//! before the caller sees it. Nodes that fail verification are blacklisted
//! and the request retried elsewhere.
//!
//! ```no_run
//! # async fn example() -> Result<(), veritas_types::errors::ClientError> {
//! use std::sync::Arc;
//! use veritas_client::{Client, HttpTransport};
//! use veritas_types::config::ClientConfig;
//!
//! let client = Client::new(ClientConfig::default(), Arc::new(HttpTransport::new()));
//! let number = client.block_number().await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cache;
pub mod context;
pub mod filter;
pub mod registry;
pub mod send;
pub mod signer;
pub mod transport;

use std::sync::Arc;

use ethers::types::{H160, H256, Signature};
use ethers::utils::keccak256;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};

use veritas_types::chainspec::ChainSpec;
use veritas_types::config::ClientConfig;
use veritas_types::errors::{ClientError, ErrorCode};
use veritas_types::nodes::{Chain, NodeEntry};
use veritas_types::utils::{self, hex_encode};

use crate::cache::Storage;
use crate::context::RequestContext;
use crate::filter::{FilterKind, FilterRegistry};
use crate::signer::Signer;
use crate::transport::Transport;

pub use crate::cache::MemStorage;
pub use crate::transport::HttpTransport;

pub struct Client {
    pub(crate) config: ClientConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) storage: Option<Arc<dyn Storage>>,
    pub(crate) signer: Option<Arc<dyn Signer>>,
    /// Active chain state. Reads are free during selection and
    /// verification; every write (refresh, weights, blacklists) takes the
    /// exclusive side, giving sequential-per-chain semantics.
    pub(crate) chain: RwLock<Chain>,
    pub(crate) filters: Mutex<FilterRegistry>,
}

impl Client {
    pub fn new(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        let chain = Chain::new(config.chain_id, H160::zero(), ChainSpec::mainnet());
        Self {
            config,
            transport,
            storage: None,
            signer: None,
            chain: RwLock::new(chain),
            filters: Mutex::new(FilterRegistry::new()),
        }
    }

    /// Attaches a persistent cache; the node list is loaded from it lazily
    /// before the first request.
    pub fn with_storage(mut self, storage: Arc<dyn Storage>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Replaces the chain spec (consensus + EIP transitions).
    pub fn with_chain_spec(self, spec: ChainSpec) -> Self {
        self.chain.write().spec = spec;
        self
    }

    /// Installs a trusted boot node list and the registry contract it was
    /// taken from. Without boot nodes (or a cached list) no request can be
    /// dispatched.
    pub fn with_nodes(self, contract: H160, nodes: Vec<NodeEntry>) -> Self {
        {
            let mut chain = self.chain.write();
            chain.contract = contract;
            chain.install_nodes(nodes, 0);
        }
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Snapshot of the registry state, for diagnostics and tests.
    pub fn chain_snapshot(&self) -> Chain {
        self.chain.read().clone()
    }

    /// Executes one JSON-RPC call and returns the verified result value.
    pub async fn rpc(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        let ctx = self.rpc_ctx(method, params).await?;
        ctx.result().cloned()
    }

    /// Executes a batch; the whole tuple is sent to every selected node and
    /// each sub-response verified. Results come back in request order.
    pub async fn rpc_batch(
        &self,
        calls: Vec<(String, Value)>,
    ) -> Result<Vec<Result<Value, ClientError>>, ClientError> {
        let mut ctx = RequestContext::batch(calls)?;
        self.execute(&mut ctx).await?;
        Ok((0..ctx.requests.len())
            .map(|index| match &ctx.responses[index] {
                Some(response) => match &response.result {
                    Some(result) => Ok(result.clone()),
                    None => Err(ClientError::new(
                        ErrorCode::Rpc,
                        response.error_text().unwrap_or_else(|| "no result".into()),
                    )),
                },
                None => Err(ClientError::unknown(
                    ctx.error.clone().unwrap_or_else(|| "no response".into()),
                )),
            })
            .collect())
    }

    /// Executes one call and hands back the whole context, for callers that
    /// need the raw verified response tree (proof envelope included).
    pub async fn rpc_ctx(
        &self,
        method: &str,
        params: Value,
    ) -> Result<RequestContext, ClientError> {
        // Methods answered locally never reach a node.
        if let Some(response) = self.pre_handle(method, &params).await? {
            let mut ctx = RequestContext::single(method, params)?;
            ctx.responses[0] = Some(serde_json::from_value(json!({
                "id": 1, "jsonrpc": "2.0", "result": response
            }))
            .map_err(|err| ClientError::unknown(err.to_string()))?);
            return Ok(ctx);
        }

        let (method, params) = if method == "eth_sendTransaction" {
            ("eth_sendRawTransaction", self.sign_transaction(&params).await?)
        } else {
            (method, params)
        };

        let mut ctx = RequestContext::single(method, params)?;
        self.execute(&mut ctx).await?;
        Ok(ctx)
    }

    /// Boxed form of [`Self::rpc`] for the locally handled methods that
    /// re-enter the client (filters, transaction assembly).
    fn rpc_boxed<'a>(
        &'a self,
        method: &'a str,
        params: Value,
    ) -> BoxFuture<'a, Result<Value, ClientError>> {
        Box::pin(self.rpc(method, params))
    }

    /// Local interception of methods that must not be forwarded: the filter
    /// API is served from the local registry.
    async fn pre_handle(
        &self,
        method: &str,
        params: &Value,
    ) -> Result<Option<Value>, ClientError> {
        match method {
            "eth_newFilter" => {
                let options = params
                    .get(0)
                    .cloned()
                    .ok_or_else(|| ClientError::invalid("filter options missing"))?;
                filter::validate_options(&options)?;
                let head = self.current_block_number().await?;
                let id = self.filters.lock().add(FilterKind::Event(options), head);
                Ok(Some(json!(format!("0x{id:x}"))))
            }
            "eth_newBlockFilter" => {
                let head = self.current_block_number().await?;
                let id = self.filters.lock().add(FilterKind::Block, head);
                Ok(Some(json!(format!("0x{id:x}"))))
            }
            "eth_newPendingTransactionFilter" => Err(ClientError::unsupported(
                "pending transaction filters are not supported",
            )),
            "eth_uninstallFilter" => {
                let id = filter_id_param(params)?;
                Ok(Some(json!(self.filters.lock().remove(id))))
            }
            "eth_getFilterChanges" => {
                let id = filter_id_param(params)?;
                Ok(Some(self.filter_changes(id).await?))
            }
            _ => Ok(None),
        }
    }

    /// Replays a filter: logs since the last poll for event filters, header
    /// hashes for block filters.
    async fn filter_changes(&self, id: u64) -> Result<Value, ClientError> {
        let filter = self
            .filters
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| ClientError::invalid(format!("no filter with id {id}")))?;
        let head = self.current_block_number().await?;

        let changes = match &filter.kind {
            FilterKind::PendingTx => {
                return Err(ClientError::unsupported("pending filters are not supported"))
            }
            FilterKind::Event(options) => {
                if head <= filter.last_block {
                    json!([])
                } else {
                    let mut window = options.clone();
                    window["fromBlock"] = json!(format!("0x{:x}", filter.last_block + 1));
                    window["toBlock"] = json!(format!("0x{head:x}"));
                    self.rpc_boxed("eth_getLogs", json!([window])).await?
                }
            }
            FilterKind::Block => {
                let mut hashes = Vec::new();
                for number in filter.last_block + 1..=head {
                    let block = self
                        .rpc_boxed(
                            "eth_getBlockByNumber",
                            json!([format!("0x{number:x}"), false]),
                        )
                        .await?;
                    let hash = block
                        .get("hash")
                        .and_then(Value::as_str)
                        .ok_or_else(|| ClientError::unknown("block without hash"))?;
                    hashes.push(json!(hash));
                }
                Value::Array(hashes)
            }
        };

        if let Some(entry) = self.filters.lock().get_mut(id) {
            entry.last_block = head;
        }
        Ok(changes)
    }

    async fn current_block_number(&self) -> Result<u64, ClientError> {
        let result = self.rpc_boxed("eth_blockNumber", json!([])).await?;
        let text = result
            .as_str()
            .ok_or_else(|| ClientError::unknown("blockNumber must be a quantity"))?;
        utils::parse_quantity_u64(text)
            .map_err(|err| ClientError::new(ErrorCode::BadData, err.to_string()))
    }

    /// Builds and signs a legacy transaction locally, returning the params
    /// for the `eth_sendRawTransaction` that replaces the request. Missing
    /// nonce and gas price are fetched through verified sub-requests.
    async fn sign_transaction(&self, params: &Value) -> Result<Value, ClientError> {
        let signer = self
            .signer
            .clone()
            .ok_or_else(|| ClientError::invalid("no signer set"))?;
        let tx = params
            .get(0)
            .and_then(Value::as_object)
            .ok_or_else(|| ClientError::invalid("invalid params, expected object"))?;

        let from = match tx.get("from").and_then(Value::as_str) {
            Some(from) => utils::parse_h160(from)
                .map_err(|err| ClientError::invalid(err.to_string()))?,
            None => signer.address(),
        };
        if from != signer.address() {
            return Err(ClientError::invalid("the signer cannot sign for this address"));
        }

        let nonce = match tx.get("nonce").and_then(Value::as_str) {
            Some(nonce) => quantity(nonce)?,
            None => {
                let result = self
                    .rpc_boxed("eth_getTransactionCount", json!([hex_encode(from), "latest"]))
                    .await?;
                quantity_value(&result)?
            }
        };
        let gas_price = match tx.get("gasPrice").and_then(Value::as_str) {
            Some(price) => quantity(price)?,
            None => {
                let result = self.rpc_boxed("eth_gasPrice", json!([])).await?;
                quantity_value(&result)?
            }
        };
        let gas = match tx.get("gas").and_then(Value::as_str) {
            Some(gas) => quantity(gas)?,
            None => ethers::types::U256::from(90_000u64),
        };
        let value = match tx.get("value").and_then(Value::as_str) {
            Some(value) => quantity(value)?,
            None => ethers::types::U256::zero(),
        };
        let data = match tx.get("data").or_else(|| tx.get("input")).and_then(Value::as_str) {
            Some(data) => utils::hex_decode(data)
                .map_err(|err| ClientError::invalid(err.to_string()))?,
            None => Vec::new(),
        };
        let to = tx
            .get("to")
            .and_then(Value::as_str)
            .map(utils::parse_h160)
            .transpose()
            .map_err(|err| ClientError::invalid(err.to_string()))?;

        let chain_id = self.config.chain_id;
        let digest = H256(keccak256(encode_legacy_tx(
            nonce, gas_price, gas, to, value, &data, None, chain_id,
        )));
        let signature = signer
            .sign(digest)
            .map_err(|err| ClientError::unknown(err.to_string()))?;
        // EIP-155 recovery value.
        let recovery = signature.v.saturating_sub(27);
        let v = chain_id * 2 + 35 + recovery;
        let raw = encode_legacy_tx(
            nonce,
            gas_price,
            gas,
            to,
            value,
            &data,
            Some((v, signature)),
            chain_id,
        );
        Ok(json!([hex_encode(raw)]))
    }
}

/// RLP of a legacy transaction. Unsigned form carries `[chain_id, 0, 0]` as
/// the EIP-155 signing placeholder; signed form the actual `[v, r, s]`.
fn encode_legacy_tx(
    nonce: ethers::types::U256,
    gas_price: ethers::types::U256,
    gas: ethers::types::U256,
    to: Option<H160>,
    value: ethers::types::U256,
    data: &[u8],
    signature: Option<(u64, Signature)>,
    chain_id: u64,
) -> Vec<u8> {
    let mut stream = rlp::RlpStream::new_list(9);
    stream.append(&utils::u256_min_be(nonce));
    stream.append(&utils::u256_min_be(gas_price));
    stream.append(&utils::u256_min_be(gas));
    match to {
        Some(to) => stream.append(&to.as_bytes().to_vec()),
        None => stream.append_empty_data(),
    };
    stream.append(&utils::u256_min_be(value));
    stream.append(&data.to_vec());
    match signature {
        Some((v, signature)) => {
            stream.append(&utils::u64_min_be(v));
            stream.append(&utils::u256_min_be(signature.r));
            stream.append(&utils::u256_min_be(signature.s));
        }
        None => {
            stream.append(&utils::u64_min_be(chain_id));
            stream.append_empty_data();
            stream.append_empty_data();
        }
    }
    stream.out().to_vec()
}

fn filter_id_param(params: &Value) -> Result<u64, ClientError> {
    let id = params
        .get(0)
        .ok_or_else(|| ClientError::invalid("expected filter-id parameter"))?;
    match id {
        Value::String(text) => utils::parse_quantity_u64(text)
            .map_err(|err| ClientError::invalid(err.to_string())),
        Value::Number(number) => number
            .as_u64()
            .ok_or_else(|| ClientError::invalid("filter-id must be a positive integer")),
        _ => Err(ClientError::invalid("expected filter-id as integer or hex")),
    }
}

fn quantity(text: &str) -> Result<ethers::types::U256, ClientError> {
    utils::parse_quantity_u256(text).map_err(|err| ClientError::invalid(err.to_string()))
}

fn quantity_value(value: &Value) -> Result<ethers::types::U256, ClientError> {
    let text = value
        .as_str()
        .ok_or_else(|| ClientError::new(ErrorCode::BadData, "expected a hex quantity"))?;
    quantity(text)
}
