//! Node selection: weight-proportional sampling over the eligible registry
//! entries, with the blacklist-liveness override.
//!
//! Selection reads the chain; the only write it may perform is the one-shot
//! clearing of all blacklists when half the registry (or more) is excluded —
//! without that override a burst of failures could starve the client
//! entirely.

use rand::Rng;

use veritas_types::config::ClientConfig;
use veritas_types::constants::DEFAULT_RESPONSE_TIME_MS;
use veritas_types::errors::{ClientError, ErrorCode};
use veritas_types::nodes::Chain;

/// One eligible node with its prefix-sum position.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    slot: usize,
    cumulative: f32,
    weight: f32,
}

/// Effective selection weight: configured weight, scaled by capacity and by
/// how fast the node has been answering.
fn effective_weight(chain: &Chain, slot: usize) -> f32 {
    let node = &chain.nodes[slot];
    let weight = &chain.weights[slot];
    weight.weight
        * node.capacity as f32
        * (DEFAULT_RESPONSE_TIME_MS as f32 / weight.avg_response_time_ms() as f32)
}

fn eligible(chain: &Chain, min_deposit: u64, now_ms: u64) -> (Vec<Candidate>, f32) {
    let mut candidates = Vec::with_capacity(chain.nodes.len());
    let mut total = 0.0f32;
    for slot in 0..chain.nodes.len() {
        if chain.nodes[slot].deposit < min_deposit {
            continue;
        }
        if chain.weights[slot].is_blacklisted(now_ms) {
            continue;
        }
        let weight = effective_weight(chain, slot);
        candidates.push(Candidate { slot, cumulative: total, weight });
        total += weight;
    }
    (candidates, total)
}

/// Picks up to `request_count` distinct nodes by weight-proportional
/// sampling. Returns the selected registry slots.
pub fn pick_nodes(
    chain: &mut Chain,
    config: &ClientConfig,
    now_ms: u64,
    rng: &mut impl Rng,
) -> Result<Vec<usize>, ClientError> {
    if chain.nodes.is_empty() {
        return Err(ClientError::new(ErrorCode::NotFound, "the node registry is empty"));
    }

    // Liveness override: with half the registry blacklisted, clear all marks
    // once and proceed.
    if chain.blacklisted_count(now_ms) * 2 >= chain.nodes.len() {
        log::warn!(
            "{} of {} nodes blacklisted, clearing all blacklists",
            chain.blacklisted_count(now_ms),
            chain.nodes.len()
        );
        chain.clear_blacklists();
    }

    let (candidates, total_weight) = eligible(chain, config.min_deposit, now_ms);
    if candidates.is_empty() {
        return Err(ClientError::new(
            ErrorCode::NotFound,
            "no nodes found that match the criteria",
        ));
    }

    let wanted = usize::from(config.request_count).max(1);
    if candidates.len() <= wanted {
        return Ok(candidates.iter().map(|candidate| candidate.slot).collect());
    }

    let mut selected: Vec<usize> = Vec::with_capacity(wanted);
    // Bounded sampling: duplicates are rejected, so cap the draws.
    for _ in 0..wanted * 10 {
        if selected.len() == wanted {
            break;
        }
        let roll = rng.gen::<f32>() * total_weight;
        let position = candidates
            .partition_point(|candidate| candidate.cumulative <= roll)
            .saturating_sub(1);
        let candidate = candidates[position];
        if !selected.contains(&candidate.slot) {
            selected.push(candidate.slot);
        }
    }
    Ok(selected)
}
