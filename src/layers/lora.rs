// SPDX-License-Identifier: MIT OR Apache-2.0

//! Low-rank adaptation wrapper.
//!
//! [`wrap_linear`] turns a linear node `W` into `Sum(W, Lora(down, up))`,
//! computing `W x + scale * up(down(x))`. The [`Lora`](ContainerKind::Lora)
//! container marks its leaves as already adapted: structural searches
//! performed by other adapters prune it.

use candle_nn::VarBuilder;
use candle_nn::init::Init;

use super::linear;
use crate::error::{AdapterError, Result};
use crate::graph::{ContainerKind, Graph, LinearParams, Node, NodeId};

/// Replace `target` (a live linear node) with `Sum(target, Lora(down, up))`.
///
/// `down` maps `in_features -> rank`; `up` maps `rank -> out_features` and
/// starts at zero, so a freshly wrapped layer computes exactly what it did
/// before. Returns the id of the `Lora` container.
///
/// # Errors
///
/// Returns [`AdapterError::Structure`] if `target` is not a linear node or
/// is not attached to the live graph, and [`AdapterError::Model`] if
/// weight loading fails.
#[allow(clippy::needless_pass_by_value)] // VarBuilder is candle's pass-by-value convention
pub fn wrap_linear(
    graph: &mut Graph,
    target: NodeId,
    rank: usize,
    scale: f64,
    vb: VarBuilder<'_>,
) -> Result<NodeId> {
    let (in_features, out_features) = match graph.node(target)? {
        Node::Linear(params) => (params.in_features()?, params.out_features()?),
        other => {
            return Err(AdapterError::Structure(format!(
                "LoRA target {target} is a {}, not a Linear",
                other.type_name()
            )));
        }
    };
    let parent = graph.parent_of(target).ok_or_else(|| {
        AdapterError::Structure(format!("LoRA target {target} is not attached"))
    })?;

    let down = linear(graph, in_features, rank, false, vb.pp("down"))?;
    let up_weight = vb
        .pp("up")
        .get_with_hints((out_features, rank), "weight", Init::Const(0.0))?;
    let up = graph.add(Node::Linear(LinearParams::new(up_weight, None)));

    let lora = graph.container(ContainerKind::Lora { scale }, vec![down, up])?;
    let sum = graph.container(ContainerKind::Sum, vec![target, lora])?;
    graph.replace_child(parent, target, sum)?;
    tracing::debug!(linear = %target, rank, scale, "wrapped linear with LoRA");
    Ok(lora)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
