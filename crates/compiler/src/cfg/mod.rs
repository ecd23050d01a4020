//! Control-flow graph construction over the flat TAC sequence
//!
//! Each procedure's instruction range is split into basic blocks at labels;
//! fall-through is made explicit with an inserted `jmp`, so blocks stay
//! correct under any reordering. The successor graph maps a block label to
//! `(target label, jump instruction)` edges; the instruction handle is
//! shared with the block, which lets the jump-threading passes retarget a
//! branch through the edge it travels.

pub mod block;
pub mod opt;

pub use block::{BasicBlock, SharedInstr, TempSet, share};

use crate::lower::Context;
use crate::tac::{Instr, Opcode, Temp, is_ordinary};
use std::collections::{HashMap, HashSet};

/// Label of a block, used as the graph's node key.
pub type Label = Temp;

#[derive(Default)]
pub struct Cfg {
    pub blocks: Vec<BasicBlock>,
    /// Successor edges: block label -> (target label, via-instruction).
    pub graph: HashMap<Label, Vec<(Label, SharedInstr)>>,
    /// Value roots: `original_temp[t]` names the value a temporary holds,
    /// following copy chains, literal constants, and ALU results. Only
    /// single-definition temporaries participate, so equal roots mean equal
    /// runtime values; the conditional jump threading pass relies on this
    /// to equate the operands of repeated tests.
    pub original_temp: HashMap<Temp, Temp>,
    /// Temporaries referenced outside their defining procedure (captured
    /// variables). They are always treated as live.
    pub escaped: HashSet<Temp>,
}

impl Cfg {
    /// Build the CFG for every procedure indexed by `ctx.procs`.
    pub fn build(ctx: &Context, instr: &[Instr]) -> Self {
        let mut cfg = Cfg::default();
        cfg.make_blocks(ctx, instr);
        cfg.make_graph();
        cfg.find_escaped(ctx, instr);
        cfg
    }

    fn make_blocks(&mut self, ctx: &Context, instr: &[Instr]) {
        for &(start, finish) in &ctx.procs {
            let mut i = start + 1;
            debug_assert_eq!(instr[i].opcode, Opcode::Label);

            while i <= finish {
                let mut block_instr: Vec<SharedInstr> = Vec::new();
                if i == start + 1 {
                    block_instr.push(share(instr[start].clone()));
                }

                let mut j = i + 1;
                while j <= finish && instr[j].opcode != Opcode::Label {
                    j += 1;
                }
                for tac in &instr[i..j] {
                    block_instr.push(share(tac.clone()));
                }

                // make fall-through explicit
                let last = block_instr.last().unwrap().borrow().opcode;
                if last != Opcode::Jmp && last != Opcode::Ret {
                    debug_assert!(j <= finish, "procedure falls off its final block");
                    block_instr.push(share(Instr::jmp(instr[j].args[0].clone())));
                }

                let is_start = i == start + 1;
                self.blocks.push(BasicBlock::new(block_instr, is_start));
                i = j;
            }

        }
        self.build_value_roots(instr);
    }

    /// Assign a value root to every single-definition temporary. Constants
    /// root at their literal, copies inherit their source's root, ALU
    /// results root at `op(root, root)`, and anything else roots at itself.
    /// Temporaries defined more than once (variable cells under assignment,
    /// boolean joins) get no root and never participate in value equations.
    fn build_value_roots(&mut self, instr: &[Instr]) {
        let mut def_count: HashMap<Temp, usize> = HashMap::new();
        for tac in instr {
            if tac.opcode == Opcode::Label || tac.opcode.is_jump() || tac.opcode == Opcode::Param {
                continue;
            }
            if let Some(result) = &tac.result {
                *def_count.entry(result.clone()).or_default() += 1;
            }
        }

        let single = |t: &Temp| def_count.get(t) == Some(&1);

        for tac in instr {
            if tac.opcode == Opcode::Label || tac.opcode.is_jump() || tac.opcode == Opcode::Param {
                continue;
            }
            let Some(result) = &tac.result else { continue };
            if !single(result) {
                continue;
            }
            let root = match tac.opcode {
                Opcode::Const => Some(tac.args[0].clone()),
                Opcode::Copy if tac.args.len() == 1 => {
                    self.original_temp.get(&tac.args[0]).cloned()
                }
                Opcode::Add
                | Opcode::Sub
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Mul
                | Opcode::Div
                | Opcode::Mod
                | Opcode::Shl
                | Opcode::Shr => {
                    let lhs = self.original_temp.get(&tac.args[0]);
                    let rhs = self.original_temp.get(&tac.args[1]);
                    match (lhs, rhs) {
                        (Some(l), Some(r)) => {
                            Some(format!("{}({},{})", tac.opcode.as_str(), l, r))
                        }
                        _ => None,
                    }
                }
                _ => Some(result.clone()),
            };
            if let Some(root) = root {
                self.original_temp.insert(result.clone(), root);
            }
        }
    }

    fn make_graph(&mut self) {
        self.graph.clear();
        for block in &self.blocks {
            let edges = self.graph.entry(block.label.clone()).or_default();
            for jump in block.jumps() {
                let target = jump.borrow().branch_target().cloned();
                if let Some(target) = target {
                    edges.push((target, jump.clone()));
                }
            }
        }
    }

    fn find_escaped(&mut self, ctx: &Context, instr: &[Instr]) {
        let mut def_proc: HashMap<Temp, usize> = HashMap::new();
        for (proc_index, &(start, finish)) in ctx.procs.iter().enumerate() {
            for tac in &instr[start + 1..=finish] {
                if let Some(result) = &tac.result
                    && is_ordinary(result)
                {
                    def_proc.entry(result.clone()).or_insert(proc_index);
                }
            }
        }
        for (proc_index, &(start, finish)) in ctx.procs.iter().enumerate() {
            for tac in &instr[start + 1..=finish] {
                for operand in tac.args.iter().chain(tac.result.iter()) {
                    if is_ordinary(operand)
                        && def_proc.get(operand).is_some_and(|&p| p != proc_index)
                    {
                        self.escaped.insert(operand.clone());
                    }
                }
            }
        }
    }

    /// Re-flatten the blocks to a TAC sequence, globals first.
    pub fn make_tac(&self, ctx: &Context) -> Vec<Instr> {
        let mut instr: Vec<Instr> = ctx.globals.clone();
        for block in &self.blocks {
            for shared in &block.instr {
                instr.push(shared.borrow().clone());
            }
        }
        instr
    }

    pub fn block_index(&self, label: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.label == label)
    }

    fn dfs(&self, label: &str, visited: &mut HashSet<Label>) {
        visited.insert(label.to_string());
        if let Some(edges) = self.graph.get(label) {
            for (target, _) in edges.clone() {
                if !visited.contains(&target) {
                    self.dfs(&target, visited);
                }
            }
        }
    }

    /// Unreachable-code elimination: DFS from every procedure's starting
    /// block, drop blocks never reached.
    pub fn uce(&mut self) {
        let mut visited = HashSet::new();
        for block in &self.blocks {
            if block.start {
                self.dfs(&block.label.clone(), &mut visited);
            }
        }
        self.blocks.retain(|b| visited.contains(&b.label));
        self.graph.retain(|label, _| visited.contains(label));
    }

    /// Block-level liveness to fixpoint, then per-instruction sets.
    pub fn build_liveness(&mut self) {
        let labels: Vec<Label> = self.blocks.iter().map(|b| b.label.clone()).collect();
        let mut def_block: HashMap<Label, TempSet> = HashMap::new();
        let mut use_block: HashMap<Label, TempSet> = HashMap::new();

        for block in &mut self.blocks {
            let label = block.label.clone();
            let mut def = TempSet::new();
            let mut uses = TempSet::new();
            block.build_def_use(&mut def, &mut uses);
            def_block.insert(label.clone(), def);
            use_block.insert(label, uses);
        }

        let mut live_in: HashMap<Label, TempSet> = HashMap::new();
        let mut live_out: HashMap<Label, TempSet> = HashMap::new();

        let mut changed = true;
        while changed {
            changed = false;
            for label in labels.iter().rev() {
                let mut out = TempSet::new();
                if let Some(edges) = self.graph.get(label) {
                    for (succ, _) in edges {
                        if let Some(succ_in) = live_in.get(succ) {
                            out.extend(succ_in.iter().cloned());
                        }
                    }
                }
                // captured temporaries stay live across the whole procedure
                out.extend(self.escaped.iter().cloned());

                let mut input: TempSet = use_block[label].clone();
                input.extend(out.difference(&def_block[label]).cloned());

                if live_in.get(label) != Some(&input) || live_out.get(label) != Some(&out) {
                    changed = true;
                }
                live_in.insert(label.clone(), input);
                live_out.insert(label.clone(), out);
            }
        }

        for block in &mut self.blocks {
            let out = live_out[&block.label].clone();
            block.build_liveness(&out);
        }
    }
}
