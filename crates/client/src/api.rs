//! Typed convenience wrappers over [`Client::rpc`].

use std::time::Duration;

use ethers::types::{H160, H256, U256};
use serde_json::{json, Value};

use veritas_abi::CallBuilder;
use veritas_types::errors::{ClientError, ErrorCode};
use veritas_types::utils::{self, hex_encode};

use crate::Client;

/// Block selector for state queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockTag {
    #[default]
    Latest,
    Number(u64),
}

impl BlockTag {
    fn to_param(self) -> Value {
        match self {
            BlockTag::Latest => json!("latest"),
            BlockTag::Number(number) => json!(format!("0x{number:x}")),
        }
    }
}

impl Client {
    /// Current head height.
    pub async fn block_number(&self) -> Result<u64, ClientError> {
        let result = self.rpc("eth_blockNumber", json!([])).await?;
        parse_u64(&result)
    }

    pub async fn gas_price(&self) -> Result<U256, ClientError> {
        let result = self.rpc("eth_gasPrice", json!([])).await?;
        parse_u256(&result)
    }

    /// Verified block, as the JSON object the node returned.
    pub async fn get_block_by_number(
        &self,
        block: BlockTag,
        include_tx: bool,
    ) -> Result<Value, ClientError> {
        self.rpc("eth_getBlockByNumber", json!([block.to_param(), include_tx])).await
    }

    pub async fn get_balance(
        &self,
        address: H160,
        block: BlockTag,
    ) -> Result<U256, ClientError> {
        let result = self
            .rpc("eth_getBalance", json!([hex_encode(address), block.to_param()]))
            .await?;
        parse_u256(&result)
    }

    pub async fn get_transaction_count(
        &self,
        address: H160,
        block: BlockTag,
    ) -> Result<U256, ClientError> {
        let result = self
            .rpc(
                "eth_getTransactionCount",
                json!([hex_encode(address), block.to_param()]),
            )
            .await?;
        parse_u256(&result)
    }

    pub async fn get_code(&self, address: H160, block: BlockTag) -> Result<Vec<u8>, ClientError> {
        let result =
            self.rpc("eth_getCode", json!([hex_encode(address), block.to_param()])).await?;
        let text = result
            .as_str()
            .ok_or_else(|| ClientError::new(ErrorCode::BadData, "code must be hex data"))?;
        utils::hex_decode(text).map_err(|err| ClientError::new(ErrorCode::BadData, err.to_string()))
    }

    pub async fn get_storage_at(
        &self,
        address: H160,
        slot: H256,
        block: BlockTag,
    ) -> Result<H256, ClientError> {
        let result = self
            .rpc(
                "eth_getStorageAt",
                json!([hex_encode(address), hex_encode(slot), block.to_param()]),
            )
            .await?;
        let text = result
            .as_str()
            .ok_or_else(|| ClientError::new(ErrorCode::BadData, "storage must be hex data"))?;
        utils::parse_h256(text).map_err(|err| ClientError::new(ErrorCode::BadData, err.to_string()))
    }

    pub async fn get_logs(&self, options: Value) -> Result<Value, ClientError> {
        crate::filter::validate_options(&options)?;
        self.rpc("eth_getLogs", json!([options])).await
    }

    /// Verified `eth_call` through the typed ABI builder:
    ///
    /// ```no_run
    /// # use ethers::types::H160;
    /// # use serde_json::json;
    /// # async fn example(client: veritas_client::Client, token: H160, holder: H160)
    /// # -> Result<(), veritas_types::errors::ClientError> {
    /// let balance = client
    ///     .call(token, "balanceOf(address):(uint256)", &[json!(format!("{holder:?}"))],
    ///           Default::default())
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn call(
        &self,
        contract: H160,
        signature: &str,
        args: &[Value],
        block: BlockTag,
    ) -> Result<Value, ClientError> {
        let mut builder = CallBuilder::new(signature)
            .map_err(|err| ClientError::invalid(err.to_string()))?;
        for arg in args {
            builder = builder.arg(arg.clone());
        }
        let data = builder.build().map_err(|err| ClientError::invalid(err.to_string()))?;

        let result = self
            .rpc(
                "eth_call",
                json!([
                    {"to": hex_encode(contract), "data": hex_encode(data)},
                    block.to_param()
                ]),
            )
            .await?;
        let text = result
            .as_str()
            .ok_or_else(|| ClientError::new(ErrorCode::BadData, "call result must be hex"))?;
        let bytes = utils::hex_decode(text)
            .map_err(|err| ClientError::new(ErrorCode::BadData, err.to_string()))?;
        builder.decode(&bytes).map_err(|err| ClientError::new(ErrorCode::BadData, err.to_string()))
    }

    /// Polls for a transaction receipt until the transaction is mined.
    pub async fn wait_for_receipt(&self, tx_hash: H256) -> Result<Value, ClientError> {
        const ATTEMPTS: u32 = 20;
        const POLL_INTERVAL: Duration = Duration::from_secs(2);
        for _ in 0..ATTEMPTS {
            let receipt = self
                .rpc("eth_getTransactionReceipt", json!([hex_encode(tx_hash)]))
                .await?;
            if !receipt.is_null() {
                return Ok(receipt);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Err(ClientError::new(
            ErrorCode::NotFound,
            format!("transaction {} was not mined in time", hex_encode(tx_hash)),
        ))
    }

    // -- filter API -----------------------------------------------------

    pub async fn new_filter(&self, options: Value) -> Result<u64, ClientError> {
        let result = self.rpc("eth_newFilter", json!([options])).await?;
        parse_u64(&result)
    }

    pub async fn new_block_filter(&self) -> Result<u64, ClientError> {
        let result = self.rpc("eth_newBlockFilter", json!([])).await?;
        parse_u64(&result)
    }

    pub async fn uninstall_filter(&self, id: u64) -> Result<bool, ClientError> {
        let result = self
            .rpc("eth_uninstallFilter", json!([format!("0x{id:x}")]))
            .await?;
        result
            .as_bool()
            .ok_or_else(|| ClientError::new(ErrorCode::BadData, "expected a boolean"))
    }

    pub async fn get_filter_changes(&self, id: u64) -> Result<Value, ClientError> {
        self.rpc("eth_getFilterChanges", json!([format!("0x{id:x}")])).await
    }
}

fn parse_u64(value: &Value) -> Result<u64, ClientError> {
    let text = value
        .as_str()
        .ok_or_else(|| ClientError::new(ErrorCode::BadData, "expected a hex quantity"))?;
    utils::parse_quantity_u64(text)
        .map_err(|err| ClientError::new(ErrorCode::BadData, err.to_string()))
}

fn parse_u256(value: &Value) -> Result<U256, ClientError> {
    let text = value
        .as_str()
        .ok_or_else(|| ClientError::new(ErrorCode::BadData, "expected a hex quantity"))?;
    utils::parse_quantity_u256(text)
        .map_err(|err| ClientError::new(ErrorCode::BadData, err.to_string()))
}
