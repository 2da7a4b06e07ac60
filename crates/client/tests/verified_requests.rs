//! End-to-end tests of the send loop against a scripted transport: a tiny
//! in-memory "network" serves proofed responses, and the client must accept
//! honest ones, reject forged ones and blacklist the nodes that sent them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use eth_trie::{EthTrie, MemoryDB, Trie};
use ethers::types::{H160, H256, U256};
use ethers::utils::keccak256;
use parking_lot::Mutex;
use rlp::RlpStream;
use serde_json::{json, Value};

use veritas_client::transport::{
    Transport, TransportError, TransportRequest, TransportResponse,
};
use veritas_client::{Client, MemStorage};
use veritas_client::api::BlockTag;
use veritas_client::cache::{self, Storage};
use veritas_types::config::{ClientConfig, Verification};
use veritas_types::constants::{EMPTY_CODE_HASH, EMPTY_STORAGE_ROOT};
use veritas_types::nodes::NodeEntry;
use veritas_types::utils::hex_encode;

// -- a miniature chain the mock nodes serve ------------------------------

const EMPTY_TRIE_ROOT_BYTE: u8 = 0x80;

fn empty_trie_root() -> H256 {
    H256(keccak256([EMPTY_TRIE_ROOT_BYTE]))
}

/// RLP of a 15-field PoW-style header with the given roots.
fn build_header(number: u64, state_root: H256) -> Vec<u8> {
    let mut stream = RlpStream::new_list(15);
    let h256 = |stream: &mut RlpStream, value: H256| {
        stream.append(&value.as_bytes().to_vec());
    };
    h256(&mut stream, H256::from_low_u64_be(number.wrapping_sub(1))); // parent
    h256(&mut stream, H256(keccak256(rlp::encode_list::<Vec<u8>, _>(&Vec::<Vec<u8>>::new())))); // uncles
    stream.append(&H160::from_low_u64_be(0xc0).as_bytes().to_vec()); // author
    h256(&mut stream, state_root);
    h256(&mut stream, empty_trie_root()); // tx root
    h256(&mut stream, empty_trie_root()); // receipts root
    stream.append(&vec![0u8; 256]); // bloom
    stream.append(&vec![0x01u8]); // difficulty
    stream.append(&veritas_types::utils::u64_min_be(number));
    stream.append(&vec![0x7a, 0x12, 0x00]); // gas limit 8_000_000
    stream.append_empty_data(); // gas used
    stream.append(&vec![0x55u8, 0xba, 0x42, 0x24]); // timestamp
    stream.append_empty_data(); // extra
    h256(&mut stream, H256::zero()); // mix
    stream.append(&vec![0u8; 8]); // nonce
    stream.out().to_vec()
}

/// One account the scripted state holds, plus its proof material.
#[derive(Clone)]
struct WorldAccount {
    address: H160,
    nonce: U256,
    balance: U256,
    code: Option<Vec<u8>>,
    storage: Vec<(U256, U256)>,
}

/// Builds the state trie for a set of accounts and returns
/// (state_root, per-address account proofs, per-address storage data).
struct World {
    state_root: H256,
    account_proofs: HashMap<H160, Vec<String>>,
    storage_roots: HashMap<H160, H256>,
    storage_proofs: HashMap<H160, Vec<Value>>,
    accounts: Vec<WorldAccount>,
}

fn build_world(accounts: Vec<WorldAccount>) -> World {
    let mut storage_roots = HashMap::new();
    let mut storage_proofs: HashMap<H160, Vec<Value>> = HashMap::new();

    for account in &accounts {
        let memdb = Arc::new(MemoryDB::new(true));
        let mut storage_trie = EthTrie::new(memdb);
        for (slot, value) in &account.storage {
            if value.is_zero() {
                continue;
            }
            let mut slot_bytes = [0u8; 32];
            slot.to_big_endian(&mut slot_bytes);
            let mut stream = RlpStream::new();
            stream.append(&veritas_types::utils::u256_min_be(*value));
            storage_trie.insert(&keccak256(slot_bytes), &stream.out()).unwrap();
        }
        let root = if account.storage.iter().any(|(_, value)| !value.is_zero()) {
            H256(storage_trie.root_hash().unwrap().0)
        } else {
            EMPTY_STORAGE_ROOT
        };
        storage_roots.insert(account.address, root);

        let mut proofs = Vec::new();
        for (slot, value) in &account.storage {
            let mut slot_bytes = [0u8; 32];
            slot.to_big_endian(&mut slot_bytes);
            let proof: Vec<String> = if root == EMPTY_STORAGE_ROOT {
                Vec::new()
            } else {
                storage_trie
                    .get_proof(&keccak256(slot_bytes))
                    .unwrap()
                    .into_iter()
                    .map(hex_encode)
                    .collect()
            };
            proofs.push(json!({
                "key": format!("0x{slot:x}"),
                "value": format!("0x{value:x}"),
                "proof": proof,
            }));
        }
        storage_proofs.insert(account.address, proofs);
    }

    let memdb = Arc::new(MemoryDB::new(true));
    let mut state_trie = EthTrie::new(memdb);
    for account in &accounts {
        let code_hash = account
            .code
            .as_ref()
            .map(|code| H256(keccak256(code)))
            .unwrap_or(EMPTY_CODE_HASH);
        let mut stream = RlpStream::new_list(4);
        stream.append(&veritas_types::utils::u256_min_be(account.nonce));
        stream.append(&veritas_types::utils::u256_min_be(account.balance));
        stream.append(&storage_roots[&account.address].as_bytes().to_vec());
        stream.append(&code_hash.as_bytes().to_vec());
        state_trie.insert(&keccak256(account.address.as_bytes()), &stream.out()).unwrap();
    }
    let state_root = H256(state_trie.root_hash().unwrap().0);

    let mut account_proofs = HashMap::new();
    for account in &accounts {
        let proof = state_trie
            .get_proof(&keccak256(account.address.as_bytes()))
            .unwrap()
            .into_iter()
            .map(hex_encode)
            .collect();
        account_proofs.insert(account.address, proof);
    }
    World { state_root, account_proofs, storage_roots, storage_proofs, accounts }
}

impl World {
    /// Proof of non-existence for an address outside the world.
    fn absent_account_proof(&self, address: H160) -> Vec<String> {
        let memdb = Arc::new(MemoryDB::new(true));
        let mut state_trie = EthTrie::new(memdb);
        for account in &self.accounts {
            let code_hash = account
                .code
                .as_ref()
                .map(|code| H256(keccak256(code)))
                .unwrap_or(EMPTY_CODE_HASH);
            let mut stream = RlpStream::new_list(4);
            stream.append(&veritas_types::utils::u256_min_be(account.nonce));
            stream.append(&veritas_types::utils::u256_min_be(account.balance));
            stream.append(&self.storage_roots[&account.address].as_bytes().to_vec());
            stream.append(&code_hash.as_bytes().to_vec());
            state_trie
                .insert(&keccak256(account.address.as_bytes()), &stream.out())
                .unwrap();
        }
        state_trie.root_hash().unwrap();
        state_trie
            .get_proof(&keccak256(address.as_bytes()))
            .unwrap()
            .into_iter()
            .map(hex_encode)
            .collect()
    }

    fn envelope_account(&self, address: H160, code: bool) -> Value {
        let account = self
            .accounts
            .iter()
            .find(|account| account.address == address);
        match account {
            Some(account) => {
                let code_hash = account
                    .code
                    .as_ref()
                    .map(|code| H256(keccak256(code)))
                    .unwrap_or(EMPTY_CODE_HASH);
                let mut entry = json!({
                    "address": hex_encode(address),
                    "nonce": format!("0x{:x}", account.nonce),
                    "balance": format!("0x{:x}", account.balance),
                    "codeHash": hex_encode(code_hash),
                    "storageHash": hex_encode(self.storage_roots[&address]),
                    "accountProof": self.account_proofs[&address],
                    "storageProof": self.storage_proofs[&address],
                });
                if code {
                    if let Some(bytes) = &account.code {
                        entry["code"] = json!(hex_encode(bytes));
                    }
                }
                entry
            }
            None => json!({
                "address": hex_encode(address),
                "nonce": "0x0",
                "balance": "0x0",
                "codeHash": hex_encode(EMPTY_CODE_HASH),
                "storageHash": hex_encode(EMPTY_STORAGE_ROOT),
                "accountProof": self.absent_account_proof(address),
                "storageProof": [],
            }),
        }
    }
}

// -- the scripted transport ----------------------------------------------

type Handler = dyn Fn(&str, &Value, &Value) -> Result<Value, String> + Send + Sync;

/// Serves every node URL from one handler: `(url, method, params) -> result
/// value or {result, in3}`.
struct ScriptedTransport {
    handler: Box<Handler>,
}

impl ScriptedTransport {
    fn new(
        handler: impl Fn(&str, &Value, &Value) -> Result<Value, String> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self { handler: Box::new(handler) })
    }

    /// Builds the JSON-RPC response for one request object. The handler
    /// returns either a bare result or a full `{result, in3}` object.
    fn answer(&self, url: &str, request: &Value) -> Result<Value, TransportError> {
        let answer = (self.handler)(url, &request["method"], &request["params"])
            .map_err(TransportError::Failed)?;
        let mut body = json!({"id": request["id"], "jsonrpc": "2.0"});
        match answer {
            Value::Object(fields) if fields.contains_key("result") => {
                for (key, value) in fields {
                    body[key] = value;
                }
            }
            bare => body["result"] = bare,
        }
        Ok(body)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(
        &self,
        requests: Vec<TransportRequest>,
        _timeout_ms: u64,
    ) -> Vec<Result<TransportResponse, TransportError>> {
        requests
            .iter()
            .map(|request| {
                let parsed: Value = serde_json::from_str(&request.body)
                    .map_err(|err| TransportError::Failed(err.to_string()))?;
                let body = match &parsed {
                    Value::Array(entries) => {
                        let mut answers = Vec::with_capacity(entries.len());
                        for entry in entries {
                            answers.push(self.answer(request.url.as_str(), entry)?);
                        }
                        Value::Array(answers).to_string()
                    }
                    single => self.answer(request.url.as_str(), single)?.to_string(),
                };
                Ok(TransportResponse { status: 200, body, elapsed_ms: 5 })
            })
            .collect()
    }
}

fn boot_nodes(count: usize) -> Vec<NodeEntry> {
    (0..count)
        .map(|index| NodeEntry {
            index: index as u32,
            url: format!("https://node{index}.example"),
            address: H160::from_low_u64_be(0xa000 + index as u64),
            deposit: 1_000,
            props: 0xffff,
            capacity: 1,
        })
        .collect()
}

fn test_config() -> ClientConfig {
    ClientConfig {
        chain_id: 1,
        request_count: 1,
        signature_count: 0,
        retry_budget: 2,
        ..Default::default()
    }
}

// -- scenarios ------------------------------------------------------------

/// An empty account's balance verifies through an exclusion proof.
#[tokio::test]
async fn balance_of_empty_account_is_proven_absent() {
    let _ = env_logger::builder().is_test(true).try_init();
    let world = build_world(vec![WorldAccount {
        address: H160::from_low_u64_be(0xaaaa),
        nonce: U256::one(),
        balance: U256::from(5u64),
        code: None,
        storage: vec![],
    }]);
    let header = build_header(1, world.state_root);
    let subject = H160::zero();

    let world = Arc::new(world);
    let served = Arc::clone(&world);
    let header_hex = hex_encode(&header);
    let transport = ScriptedTransport::new(move |_, method, _| match method.as_str() {
        Some("eth_getBalance") => Ok(json!({
            "result": "0x0",
            "in3": {
                "block": header_hex,
                "accounts": [served.envelope_account(H160::zero(), false)],
            }
        })),
        other => Err(format!("unexpected method {other:?}")),
    });

    let client = Client::new(test_config(), transport)
        .with_nodes(H160::from_low_u64_be(0x1234), boot_nodes(2));
    let balance = client.get_balance(subject, BlockTag::Number(1)).await.unwrap();
    assert_eq!(balance, U256::zero());
}

/// A fabricated balance must be rejected and the node blacklisted; the
/// second node answers honestly and wins the retry.
#[tokio::test]
async fn lying_node_is_blacklisted_and_retried() {
    let world = Arc::new(build_world(vec![WorldAccount {
        address: H160::from_low_u64_be(0xaaaa),
        nonce: U256::one(),
        balance: U256::from(1_000_000u64),
        code: None,
        storage: vec![],
    }]));
    let header_hex = hex_encode(build_header(1, world.state_root));
    let subject = H160::from_low_u64_be(0xaaaa);

    let served = Arc::clone(&world);
    let transport = ScriptedTransport::new(move |url, method, _| {
        assert_eq!(method.as_str(), Some("eth_getBalance"));
        let mut account = served.envelope_account(subject, false);
        if url.contains("node0") {
            // node0 claims a different balance; the proof cannot cover it.
            account["balance"] = json!("0x1");
            Ok(json!({
                "result": "0x1",
                "in3": {"block": header_hex, "accounts": [account]}
            }))
        } else {
            Ok(json!({
                "result": "0xf4240",
                "in3": {"block": header_hex, "accounts": [account]}
            }))
        }
    });

    // Three nodes keep the lone blacklist below the liveness threshold.
    let config = ClientConfig { request_count: 3, ..test_config() };
    let client =
        Client::new(config, transport).with_nodes(H160::from_low_u64_be(0x1234), boot_nodes(3));

    let before = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let balance = client.get_balance(subject, BlockTag::Number(1)).await.unwrap();
    assert_eq!(balance, U256::from(1_000_000u64));

    let chain = client.chain_snapshot();
    assert!(
        chain.weights[0].blacklisted_until_ms > before,
        "the lying node must be blacklisted"
    );
    assert_eq!(chain.weights[1].blacklisted_until_ms, 0);

    // Selection within the blacklist window must skip node0.
    let ctx = client.rpc_ctx("eth_getBalance", json!([hex_encode(subject), "0x1"])).await.unwrap();
    assert_eq!(ctx.nodes, vec![1, 2]);
}

/// eth_call with FULL verification: the EVM replays an ERC20-style
/// balanceOf against proven code and storage and must reproduce the
/// server's output.
#[tokio::test]
async fn full_verification_replays_eth_call() {
    let token = H160::from_low_u64_be(0x70ce);
    let holder = H160::from_low_u64_be(0xb0b);

    // Mapping slot for `balances[holder]` with the mapping at slot 0.
    let mut preimage = [0u8; 64];
    preimage[12..32].copy_from_slice(holder.as_bytes());
    let slot = U256::from_big_endian(&keccak256(preimage));

    // CALLDATALOAD(4); MSTORE(0); MSTORE(32, 0); KECCAK(0, 64); SLOAD;
    // MSTORE(0); RETURN(0, 32)
    let code = vec![
        0x60, 0x04, 0x35, 0x60, 0x00, 0x52, 0x60, 0x00, 0x60, 0x20, 0x52, 0x60, 0x40, 0x60,
        0x00, 0x20, 0x54, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3,
    ];

    let world = Arc::new(build_world(vec![WorldAccount {
        address: token,
        nonce: U256::one(),
        balance: U256::zero(),
        code: Some(code),
        storage: vec![(slot, U256::from(0x04d2u64))],
    }]));
    let header_hex = hex_encode(build_header(1, world.state_root));

    let expected_output = format!("0x{:064x}", 0x04d2u64);
    let served = Arc::clone(&world);
    let output_for_node = expected_output.clone();
    let transport = ScriptedTransport::new(move |_, method, _| {
        assert_eq!(method.as_str(), Some("eth_call"));
        Ok(json!({
            "result": output_for_node,
            "in3": {
                "block": header_hex,
                "accounts": [served.envelope_account(token, true)],
            }
        }))
    });

    let config = ClientConfig { verification: Verification::Full, ..test_config() };
    let client =
        Client::new(config, transport).with_nodes(H160::from_low_u64_be(0x1234), boot_nodes(1));

    let balance = client
        .call(token, "balanceOf(address):(uint256)", &[json!(hex_encode(holder))], BlockTag::Number(1))
        .await
        .unwrap();
    assert_eq!(balance, json!("0x4d2"));
}

/// The same call with a forged output must fail verification everywhere.
#[tokio::test]
async fn forged_call_output_is_rejected() {
    let token = H160::from_low_u64_be(0x70ce);
    let code = vec![0x60, 0x2a, 0x60, 0x00, 0x52, 0x60, 0x20, 0x60, 0x00, 0xf3]; // returns 42

    let world = Arc::new(build_world(vec![WorldAccount {
        address: token,
        nonce: U256::one(),
        balance: U256::zero(),
        code: Some(code),
        storage: vec![],
    }]));
    let header_hex = hex_encode(build_header(1, world.state_root));

    let served = Arc::clone(&world);
    let transport = ScriptedTransport::new(move |_, _, _| {
        Ok(json!({
            // claims 43 while the code provably returns 42
            "result": format!("0x{:064x}", 43),
            "in3": {
                "block": header_hex,
                "accounts": [served.envelope_account(token, true)],
            }
        }))
    });

    let config = ClientConfig { verification: Verification::Full, ..test_config() };
    let client =
        Client::new(config, transport).with_nodes(H160::from_low_u64_be(0x1234), boot_nodes(1));

    let err = client
        .rpc("eth_call", json!([{"to": hex_encode(token), "data": "0x"}, "0x1"]))
        .await
        .unwrap_err();
    assert!(err.message.contains("does not match"), "got: {}", err.message);
}

/// Block filter: two new blocks yield both hashes in order, a third poll
/// with no new blocks yields nothing.
#[tokio::test]
async fn block_filter_collects_hashes_in_order() {
    let world = build_world(vec![]);
    let state_root = world.state_root;
    let head = Arc::new(Mutex::new(1u64));

    let served_head = Arc::clone(&head);
    let transport = ScriptedTransport::new(move |_, method, params| {
        match method.as_str() {
            Some("eth_blockNumber") => Ok(json!(format!("0x{:x}", *served_head.lock()))),
            Some("eth_getBlockByNumber") => {
                let number = u64::from_str_radix(
                    params[0].as_str().unwrap().trim_start_matches("0x"),
                    16,
                )
                .unwrap();
                let header = build_header(number, state_root);
                let hash = hex_encode(keccak256(&header));
                Ok(json!({
                    "result": {
                        "hash": hash,
                        "number": format!("0x{number:x}"),
                        "transactions": [],
                    },
                    "in3": {"block": hex_encode(&header)}
                }))
            }
            other => Err(format!("unexpected method {other:?}")),
        }
    });

    let client = Client::new(test_config(), transport)
        .with_nodes(H160::from_low_u64_be(0x1234), boot_nodes(1));

    let filter_id = client.new_block_filter().await.unwrap();
    assert_eq!(filter_id, 1);

    *head.lock() = 3;
    let changes = client.get_filter_changes(filter_id).await.unwrap();
    let hashes: Vec<&str> =
        changes.as_array().unwrap().iter().map(|hash| hash.as_str().unwrap()).collect();
    assert_eq!(hashes.len(), 2);
    assert_eq!(hashes[0], hex_encode(keccak256(build_header(2, state_root))));
    assert_eq!(hashes[1], hex_encode(keccak256(build_header(3, state_root))));

    // No new blocks: the next poll is empty.
    let changes = client.get_filter_changes(filter_id).await.unwrap();
    assert_eq!(changes, json!([]));

    assert!(client.uninstall_filter(filter_id).await.unwrap());
    assert!(!client.uninstall_filter(filter_id).await.unwrap());
}

/// The node list is loaded from an attached cache before the first request.
#[tokio::test]
async fn node_list_boots_from_cache() {
    let storage = Arc::new(MemStorage::new());
    {
        // Prime the cache the way a previous run would have.
        let mut chain = veritas_types::nodes::Chain::new(
            1,
            H160::from_low_u64_be(0x1234),
            veritas_types::chainspec::ChainSpec::mainnet(),
        );
        chain.install_nodes(boot_nodes(1), 7);
        storage.set(&cache::cache_key(1), cache::encode_node_list(&chain));
    }

    let transport = ScriptedTransport::new(|_, method, _| match method.as_str() {
        Some("eth_blockNumber") => Ok(json!("0x2a")),
        other => Err(format!("unexpected method {other:?}")),
    });
    // No boot nodes configured: only the cache can provide the registry.
    let client = Client::new(test_config(), transport).with_storage(storage);
    assert_eq!(client.block_number().await.unwrap(), 42);
    let chain = client.chain_snapshot();
    assert_eq!(chain.nodes.len(), 1);
    assert_eq!(chain.last_block, 7);
}

/// A batch is sent as one payload and each entry verified independently.
#[tokio::test]
async fn batches_verify_per_entry() {
    let transport = ScriptedTransport::new(|_, method, _| match method.as_str() {
        Some("eth_blockNumber") => Ok(json!("0x10")),
        Some("eth_gasPrice") => Ok(json!("0x3b9aca00")),
        other => Err(format!("unexpected method {other:?}")),
    });
    let client = Client::new(test_config(), transport)
        .with_nodes(H160::from_low_u64_be(0x1234), boot_nodes(1));

    let results = client
        .rpc_batch(vec![
            ("eth_blockNumber".into(), json!([])),
            ("eth_gasPrice".into(), json!([])),
        ])
        .await
        .unwrap();
    assert_eq!(results[0].as_ref().unwrap(), &json!("0x10"));
    assert_eq!(results[1].as_ref().unwrap(), &json!("0x3b9aca00"));
}
