/*
 * Released under the terms of the Apache 2.0 license with LLVM
 * exception. See `LICENSE` for details.
 */

//! Fast postorder computation.

use crate::{Block, RegAllocError};
use alloc::vec;
use alloc::vec::Vec;
use smallvec::{smallvec, SmallVec};

/// Blocks reachable from `entry` in postorder. Fails if a successor
/// names a block that does not exist.
pub fn calculate<'a, SuccFn: Fn(Block) -> &'a [Block]>(
    num_blocks: usize,
    entry: Block,
    succ_blocks: SuccFn,
) -> Result<Vec<Block>, RegAllocError> {
    // State: visited-block map, and explicit DFS stack.
    struct State<'a> {
        block: Block,
        succs: core::slice::Iter<'a, Block>,
    }

    let mut visited = vec![false; num_blocks];
    let mut stack: SmallVec<[State; 64]> = smallvec![];
    let mut out = Vec::with_capacity(num_blocks);

    let entry_visit = visited
        .get_mut(entry.index())
        .ok_or(RegAllocError::BB(entry))?;
    *entry_visit = true;
    stack.push(State {
        block: entry,
        succs: succ_blocks(entry).iter(),
    });

    while let Some(state) = stack.last_mut() {
        // Perform one action: push to new succ, skip an already-visited succ, or pop.
        if let Some(&succ) = state.succs.next() {
            let succ_visit = visited
                .get_mut(succ.index())
                .ok_or(RegAllocError::BB(state.block))?;
            if !*succ_visit {
                *succ_visit = true;
                stack.push(State {
                    block: succ,
                    succs: succ_blocks(succ).iter(),
                });
            }
        } else {
            out.push(state.block);
            stack.pop();
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diamond_postorder() {
        let succs: Vec<Vec<Block>> = vec![
            vec![Block::new(1), Block::new(2)],
            vec![Block::new(3)],
            vec![Block::new(3)],
            vec![],
            vec![],
        ];
        let order = calculate(5, Block::new(0), |b| succs[b.index()].as_slice()).unwrap();
        assert_eq!(
            order,
            vec![Block::new(3), Block::new(1), Block::new(2), Block::new(0)]
        );
    }

    #[test]
    fn dangling_successor_is_an_error() {
        let succs: Vec<Vec<Block>> = vec![vec![Block::new(7)]];
        assert!(matches!(
            calculate(1, Block::new(0), |b| succs[b.index()].as_slice()),
            Err(RegAllocError::BB(b)) if b == Block::new(0)
        ));
    }
}
