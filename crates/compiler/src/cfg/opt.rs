//! Peephole optimizations over the CFG
//!
//! Each pass rebuilds the CFG from the current TAC, transforms it, runs
//! unreachable-code elimination, re-flattens with `make_tac`, and refreshes
//! the context's procedure indexing. With `--fenable-opt` the driver runs
//! one round of dead-copy removal, both jump-threading passes, and block
//! coalescing, in that order.

use super::{Cfg, share};
use crate::lower::Context;
use crate::tac::{Instr, Opcode, Temp, is_ordinary, is_param};
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// The named optimization passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Optimization {
    /// Remove `copy` instructions whose result is dead.
    DeadCopyRemoval,
    /// Bypass blocks that consist of a single unconditional jump.
    JtSeqUncond,
    /// Turn a conditional jump into an unconditional one when the target
    /// block re-tests the same condition on the same value.
    JtCondToUncond,
    /// Fuse single-successor/single-predecessor block pairs.
    Coalesce,
    /// Intra-block copy propagation.
    CopyPropagation,
    /// Unreachable-code elimination alone.
    Uce,
}

/// Apply one pass: CFG up, transform, UCE, flatten back down, re-index.
pub fn optimize(opt: Optimization, ctx: &mut Context, instr: Vec<Instr>) -> Vec<Instr> {
    let mut cfg = Cfg::build(ctx, &instr);
    match opt {
        Optimization::DeadCopyRemoval => eliminate_dead_copies(&mut cfg),
        Optimization::JtSeqUncond => jt_seq_uncond(&mut cfg),
        Optimization::JtCondToUncond => jt_cond_to_uncond(&mut cfg),
        Optimization::Coalesce => coalesce(&mut cfg),
        Optimization::CopyPropagation => copy_propagation(&mut cfg),
        Optimization::Uce => {}
    }
    cfg.uce();
    let out = cfg.make_tac(ctx);
    ctx.process(&out);
    debug!(pass = ?opt, instructions = out.len(), "optimization pass done");
    out
}

/// The round applied under `--fenable-opt`.
pub fn run_pipeline(ctx: &mut Context, mut instr: Vec<Instr>) -> Vec<Instr> {
    for pass in [
        Optimization::DeadCopyRemoval,
        Optimization::JtSeqUncond,
        Optimization::JtCondToUncond,
        Optimization::Coalesce,
    ] {
        instr = optimize(pass, ctx, instr);
    }
    instr
}

/// If block A's only jump is an unconditional `jmp` to B and B has no other
/// predecessor, fuse B into A. Iterates to fixpoint; UCE drops the emptied
/// blocks.
fn coalesce(cfg: &mut Cfg) {
    loop {
        cfg.uce();

        let mut in_deg: HashMap<Temp, usize> = HashMap::new();
        for edges in cfg.graph.values() {
            for (target, _) in edges {
                *in_deg.entry(target.clone()).or_default() += 1;
            }
        }

        let mut merge: Option<(usize, usize)> = None;
        for (index, block) in cfg.blocks.iter().enumerate() {
            let edges = &cfg.graph[&block.label];
            if edges.len() != 1 {
                continue;
            }
            let (child_label, via) = &edges[0];
            if via.borrow().opcode != Opcode::Jmp {
                continue;
            }
            if in_deg.get(child_label) != Some(&1) {
                continue;
            }
            let Some(child_index) = cfg.block_index(child_label) else {
                continue;
            };
            if cfg.blocks[child_index].start || child_index == index {
                continue;
            }
            merge = Some((index, child_index));
            break;
        }

        let Some((index, child_index)) = merge else {
            break;
        };

        let child_label = cfg.blocks[child_index].label.clone();
        // drop A's trailing jmp and B's leading label, splice B in
        let mut child_instr = cfg.blocks[child_index].instr.clone();
        child_instr.remove(0);
        cfg.blocks[index].instr.pop();
        cfg.blocks[index].instr.extend(child_instr);

        let child_edges = cfg.graph.get(&child_label).cloned().unwrap_or_default();
        let label = cfg.blocks[index].label.clone();
        cfg.graph.insert(label, child_edges);
        cfg.graph.insert(child_label, Vec::new());
    }
}

/// Retarget jumps that travel through blocks holding nothing but a jump.
/// The whole chain of trivial blocks is followed at once; a cyclic chain
/// (an empty infinite loop in the source) is left alone.
fn jt_seq_uncond(cfg: &mut Cfg) {
    loop {
        cfg.uce();

        let mut changed = false;
        let labels: Vec<Temp> = cfg.blocks.iter().map(|b| b.label.clone()).collect();
        for label in labels {
            let edge_count = cfg.graph.get(&label).map_or(0, |e| e.len());
            for edge_index in 0..edge_count {
                let child_label = cfg.graph[&label][edge_index].0.clone();

                let mut target = child_label.clone();
                let mut seen = HashSet::from([child_label.clone()]);
                let mut cyclic = false;
                loop {
                    let Some(index) = cfg.block_index(&target) else {
                        break;
                    };
                    let block = &cfg.blocks[index];
                    if block.start || block.instr.len() != 2 {
                        break;
                    }
                    if cfg.graph.get(&target).map_or(0, |e| e.len()) != 1 {
                        break;
                    }
                    let Some(next) = block.instr[1].borrow().jmp_target().cloned() else {
                        break;
                    };
                    if !seen.insert(next.clone()) {
                        cyclic = true;
                        break;
                    }
                    target = next;
                }

                if !cyclic && target != child_label {
                    let edges = cfg.graph.get_mut(&label).unwrap();
                    edges[edge_index].1.borrow_mut().set_branch_target(target.clone());
                    edges[edge_index].0 = target;
                    changed = true;
                }
            }
        }

        if !changed {
            break;
        }
    }
}

/// Entering block B through `jc t` means the condition already held; if B
/// re-tests the same condition on the same copy-chain root, its branch is
/// statically taken: rewrite it to `jmp` and truncate the block there.
fn jt_cond_to_uncond(cfg: &mut Cfg) {
    loop {
        cfg.uce();

        let mut rewrite: Option<(usize, usize, Temp)> = None;
        'outer: for block in &cfg.blocks {
            for (child_label, via_instr) in &cfg.graph[&block.label] {
                let via = via_instr.borrow();
                if !via.opcode.is_cond_jump() {
                    continue;
                }
                let Some(via_root) = cfg.original_temp.get(&via.args[0]) else {
                    continue;
                };
                let Some(child_index) = cfg.block_index(child_label) else {
                    continue;
                };
                let child = &cfg.blocks[child_index];

                for (i, shared) in child.instr.iter().enumerate() {
                    // a conditional self-loop finds its own entry jump; that
                    // is not a re-test
                    if std::rc::Rc::ptr_eq(shared, via_instr) {
                        continue;
                    }
                    let tac = shared.borrow();
                    if tac.opcode != via.opcode {
                        continue;
                    }
                    if cfg.original_temp.get(&tac.args[0]) != Some(via_root) {
                        continue;
                    }
                    let target = tac.result.clone().expect("conditional jump has a target");
                    rewrite = Some((child_index, i, target));
                    break 'outer;
                }
            }
        }

        let Some((child_index, i, target)) = rewrite else {
            break;
        };

        let child = &mut cfg.blocks[child_index];
        child.instr[i] = share(Instr::jmp(target));
        child.instr.truncate(i + 1);

        // rebuild this block's edges from what is left of it
        let edges: Vec<_> = child
            .jumps()
            .into_iter()
            .filter_map(|j| {
                let target = j.borrow().branch_target().cloned();
                target.map(|t| (t, j.clone()))
            })
            .collect();
        cfg.graph.insert(child.label.clone(), edges);
    }
}

/// Intra-block copy propagation.
///
/// Forward: after `copy t_dst <- t_src`, replace `t_dst` with `t_src` in
/// argument positions until either side is redefined. Copies from parameter
/// temporaries and the flagged static-link save are left alone; self-copies
/// left behind are deleted.
///
/// Backward (narrow): when the instruction directly above the copy defines
/// `t_src` and `t_src` is dead after the copy, the two are unambiguously
/// linkable: the definition is renamed to `t_dst` and the copy deleted.
fn copy_propagation(cfg: &mut Cfg) {
    for block in &mut cfg.blocks {
        let count = block.instr.len();
        for i in 0..count {
            let (dst, src) = {
                let tac = block.instr[i].borrow();
                if tac.opcode != Opcode::Copy || tac.args.len() != 1 {
                    continue;
                }
                let Some(result) = &tac.result else { continue };
                if !is_ordinary(result) || is_param(&tac.args[0]) {
                    continue;
                }
                (result.clone(), tac.args[0].clone())
            };

            for j in i + 1..count {
                let mut tac = block.instr[j].borrow_mut();
                for arg in &mut tac.args {
                    if *arg == dst {
                        *arg = src.clone();
                    }
                }
                if tac.result.as_ref() == Some(&dst) || tac.result.as_ref() == Some(&src) {
                    break;
                }
            }
        }

        block.instr.retain(|shared| {
            let tac = shared.borrow();
            !(tac.opcode == Opcode::Copy
                && tac.args.len() == 1
                && tac.result.as_ref() == Some(&tac.args[0]))
        });
    }

    // liveness justifies the backward links; escaped temporaries are held
    // live by it, so cross-procedure reads are never rewired
    cfg.build_liveness();
    for index in 0..cfg.blocks.len() {
        let count = cfg.blocks[index].instr.len();
        for i in (1..count).rev() {
            let linkable = {
                let block = &cfg.blocks[index];
                let copy = block.instr[i].borrow();
                let prev = block.instr[i - 1].borrow();
                copy.opcode == Opcode::Copy
                    && copy.args.len() == 1
                    && copy.result.as_ref().is_some_and(|r| is_ordinary(r))
                    && is_ordinary(&copy.args[0])
                    && prev.result.as_ref() == Some(&copy.args[0])
                    && !prev.opcode.is_jump()
                    && prev.opcode != Opcode::Label
                    && prev.opcode != Opcode::Param
                    && !(prev.opcode == Opcode::Copy && prev.args.len() == 2)
                    && !block.live_out(i).contains(&copy.args[0])
            };
            if linkable {
                let block = &mut cfg.blocks[index];
                let dst = block.instr[i].borrow().result.clone();
                block.instr[i - 1].borrow_mut().result = dst;
                block.instr.remove(i);
            }
        }
    }
}

/// Remove `copy` instructions whose result is not live afterwards. The
/// flagged static-link save, stores to globals, and copies of captured
/// temporaries are kept; liveness is recomputed after each sweep.
fn eliminate_dead_copies(cfg: &mut Cfg) {
    loop {
        cfg.build_liveness();

        let mut changed = false;
        for block in &mut cfg.blocks {
            let mut keep = Vec::with_capacity(block.instr.len());
            for (i, shared) in block.instr.iter().enumerate() {
                let tac = shared.borrow();
                let dead = tac.opcode == Opcode::Copy
                    && tac.args.len() == 1
                    && tac
                        .result
                        .as_ref()
                        .is_some_and(|r| is_ordinary(r) && !block.live_out(i).contains(r));
                drop(tac);
                if dead {
                    changed = true;
                } else {
                    keep.push(shared.clone());
                }
            }
            block.instr = keep;
        }

        if !changed {
            break;
        }
    }
}
