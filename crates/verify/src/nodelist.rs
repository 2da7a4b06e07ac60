//! `in3_nodeList` verification: the registry response is proven as an
//! account (and storage) proof against the registry contract, then parsed
//! into [`NodeEntry`] values for the client to install.

use ethers::types::H160;
use serde_json::Value;

use veritas_types::nodes::NodeEntry;
use veritas_types::utils::{self, parse_quantity_u64};

use crate::account::verify_envelope_accounts;
use crate::{rejected, VerifyCtx, VerifyError};

pub fn verify(ctx: &VerifyCtx) -> Result<(), VerifyError> {
    let contract = result_contract(ctx.result)?;
    if ctx.registry_contract != H160::zero() && contract != ctx.registry_contract {
        return Err(rejected("the nodelist was signed for a different registry contract"));
    }

    let header = ctx.verify_envelope_header(None)?;
    verify_envelope_accounts(ctx, &header, contract)?;

    // The structural parse doubles as validation of every node entry.
    let (_, last_block) = parse_node_list(ctx.result)?;
    if last_block > header.number {
        return Err(rejected("the nodelist lastBlock is ahead of the proven header"));
    }
    Ok(())
}

pub fn result_contract(result: &Value) -> Result<H160, VerifyError> {
    let contract = result
        .get("contract")
        .and_then(Value::as_str)
        .ok_or_else(|| rejected("no registry contract in the nodelist"))?;
    Ok(utils::parse_h160(contract)?)
}

/// Parses the verified node-list result into registry entries plus the block
/// height the list was assembled at.
pub fn parse_node_list(result: &Value) -> Result<(Vec<NodeEntry>, u64), VerifyError> {
    let nodes = result
        .get("nodes")
        .and_then(Value::as_array)
        .ok_or_else(|| rejected("no nodes in the result"))?;
    let last_block = result
        .get("lastBlockNumber")
        .and_then(Value::as_str)
        .map(parse_quantity_u64)
        .transpose()?
        .ok_or_else(|| rejected("lastBlockNumber is missing"))?;

    let mut entries = Vec::with_capacity(nodes.len());
    for (position, node) in nodes.iter().enumerate() {
        let url = node
            .get("url")
            .and_then(Value::as_str)
            .ok_or_else(|| rejected("missing url in nodelist"))?;
        let address = node
            .get("address")
            .and_then(Value::as_str)
            .ok_or_else(|| rejected("missing address in nodelist"))?;
        let entry = NodeEntry {
            index: node
                .get("index")
                .and_then(Value::as_str)
                .map(parse_quantity_u64)
                .transpose()?
                .unwrap_or(position as u64) as u32,
            url: url.to_owned(),
            address: utils::parse_h160(address)?,
            deposit: node
                .get("deposit")
                .and_then(Value::as_str)
                .map(parse_quantity_u64)
                .transpose()?
                .unwrap_or(0),
            props: node
                .get("props")
                .and_then(Value::as_str)
                .map(parse_quantity_u64)
                .transpose()?
                .unwrap_or(0xffff),
            capacity: node
                .get("capacity")
                .and_then(Value::as_str)
                .map(parse_quantity_u64)
                .transpose()?
                .unwrap_or(1) as u32,
        };
        entries.push(entry);
    }
    Ok((entries, last_block))
}
