//! Server-free filters.
//!
//! Filters are inert data: the registry only stores what was asked for and
//! how far it has been replayed. The client drives them by issuing ordinary
//! verified requests (`eth_getLogs`, `eth_getBlockByNumber`) on
//! `getFilterChanges`. Ids are never reused; removal leaves a tombstone.

use serde_json::Value;

use veritas_types::errors::ClientError;
use veritas_types::utils;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterKind {
    /// Log filter with its validated options object.
    Event(Value),
    Block,
    PendingTx,
}

#[derive(Debug, Clone)]
pub struct Filter {
    pub id: u64,
    pub kind: FilterKind,
    /// Highest block already replayed to the caller.
    pub last_block: u64,
}

#[derive(Debug, Default)]
pub struct FilterRegistry {
    slots: Vec<Option<Filter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a filter and returns its id. Id 0 is reserved as invalid;
    /// slot `id - 1` holds the filter.
    pub fn add(&mut self, kind: FilterKind, last_block: u64) -> u64 {
        let id = self.slots.len() as u64 + 1;
        self.slots.push(Some(Filter { id, kind, last_block }));
        id
    }

    pub fn get(&self, id: u64) -> Option<&Filter> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize - 1)?.as_ref()
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Filter> {
        if id == 0 {
            return None;
        }
        self.slots.get_mut(id as usize - 1)?.as_mut()
    }

    /// Uninstalls a filter; the slot becomes a tombstone so ids stay unique
    /// for the lifetime of the client.
    pub fn remove(&mut self, id: u64) -> bool {
        if id == 0 {
            return false;
        }
        match self.slots.get_mut(id as usize - 1) {
            Some(slot @ Some(_)) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }
}

/// Validates `eth_newFilter` options: address shape, topic shape and the
/// blockHash/range exclusivity rule.
pub fn validate_options(options: &Value) -> Result<(), ClientError> {
    let object = options
        .as_object()
        .ok_or_else(|| ClientError::invalid("filter options must be an object"))?;

    match object.get("address") {
        None | Some(Value::Null) => {}
        Some(Value::String(address)) => validate_address(address)?,
        Some(Value::Array(addresses)) => {
            for address in addresses {
                let address = address
                    .as_str()
                    .ok_or_else(|| ClientError::invalid("address entries must be strings"))?;
                validate_address(address)?;
            }
        }
        Some(_) => return Err(ClientError::invalid("address must be a string or array")),
    }

    match object.get("topics") {
        None | Some(Value::Null) => {}
        Some(Value::Array(topics)) => {
            if topics.len() > 4 {
                return Err(ClientError::invalid("at most 4 topics are allowed"));
            }
            for topic in topics {
                match topic {
                    Value::Null => {}
                    Value::String(entry) => validate_topic(entry)?,
                    Value::Array(any_of) => {
                        for entry in any_of {
                            let entry = entry.as_str().ok_or_else(|| {
                                ClientError::invalid("topic alternatives must be strings")
                            })?;
                            validate_topic(entry)?;
                        }
                    }
                    _ => {
                        return Err(ClientError::invalid(
                            "topics must be null, a hash or an array of hashes",
                        ))
                    }
                }
            }
        }
        Some(_) => return Err(ClientError::invalid("topics must be an array")),
    }

    let has_range =
        object.contains_key("fromBlock") || object.contains_key("toBlock");
    if object.get("blockHash").filter(|v| !v.is_null()).is_some() && has_range {
        return Err(ClientError::invalid(
            "blockHash cannot be combined with fromBlock/toBlock",
        ));
    }
    Ok(())
}

fn validate_address(address: &str) -> Result<(), ClientError> {
    utils::parse_h160(address)
        .map(|_| ())
        .map_err(|_| ClientError::invalid(format!("invalid filter address {address}")))
}

fn validate_topic(topic: &str) -> Result<(), ClientError> {
    let bytes = utils::hex_decode(topic)
        .map_err(|_| ClientError::invalid(format!("invalid topic {topic}")))?;
    if bytes.len() != 32 {
        return Err(ClientError::invalid(format!("topic {topic} is not 32 bytes")));
    }
    Ok(())
}
