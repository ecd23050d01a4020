//! Basic blocks
//!
//! A block is a leading label, straight-line code, and a terminator (`jmp`
//! or `ret`; embedded conditional jumps may branch out mid-block). Blocks
//! hold their instructions behind `Rc<RefCell<...>>` so the successor graph
//! can alias the jump instructions: retargeting a jump through an edge
//! rewrites the block's instruction in place.

use crate::tac::{Instr, Opcode, Temp, is_ordinary};
use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

/// Instruction handle shared between a block and the successor edges that
/// point through it.
pub type SharedInstr = Rc<RefCell<Instr>>;

pub fn share(instr: Instr) -> SharedInstr {
    Rc::new(RefCell::new(instr))
}

/// Liveness sets, one per instruction.
pub type TempSet = HashSet<Temp>;

#[derive(Debug, Default)]
pub struct BasicBlock {
    pub instr: Vec<SharedInstr>,
    /// The block's leading label.
    pub label: Temp,
    /// Whether this is a procedure's starting block (carries the `proc`
    /// sentinel as its first instruction).
    pub start: bool,
    def: Vec<TempSet>,
    uses: Vec<TempSet>,
    live_in: Vec<TempSet>,
    live_out: Vec<TempSet>,
}

impl BasicBlock {
    pub fn new(instr: Vec<SharedInstr>, start: bool) -> Self {
        let label_pos = usize::from(start);
        let leading = instr[label_pos].borrow();
        debug_assert_eq!(leading.opcode, Opcode::Label);
        let label = leading.args[0].clone();
        drop(leading);

        BasicBlock {
            instr,
            label,
            start,
            def: Vec::new(),
            uses: Vec::new(),
            live_in: Vec::new(),
            live_out: Vec::new(),
        }
    }

    /// Handles of every jump instruction in the block, in order.
    pub fn jumps(&self) -> Vec<SharedInstr> {
        self.instr
            .iter()
            .filter(|i| i.borrow().opcode.is_jump())
            .cloned()
            .collect()
    }

    /// Per-instruction def/use sets, and their union over the block. Only
    /// ordinary `%<digits>` temporaries participate: parameters are always
    /// live on entry and labels are not values.
    pub fn build_def_use(&mut self, def_block: &mut TempSet, use_block: &mut TempSet) {
        let count = self.instr.len();
        self.def = vec![TempSet::new(); count];
        self.uses = vec![TempSet::new(); count];

        for (i, shared) in self.instr.iter().enumerate() {
            let tac = shared.borrow();
            if tac.opcode == Opcode::Label || tac.opcode == Opcode::Proc {
                continue;
            }

            for arg in &tac.args {
                if is_ordinary(arg) {
                    self.uses[i].insert(arg.clone());
                }
            }
            if let Some(result) = &tac.result
                && is_ordinary(result)
                && !tac.opcode.is_jump()
                && tac.opcode != Opcode::Param
            {
                self.def[i].insert(result.clone());
            }

            def_block.extend(self.def[i].iter().cloned());
            use_block.extend(self.uses[i].iter().cloned());
        }
    }

    /// Per-instruction liveness from the block's live-out set, walking
    /// backward. `build_def_use` must have run first.
    pub fn build_liveness(&mut self, live_out_block: &TempSet) {
        let count = self.instr.len();
        self.live_in = vec![TempSet::new(); count];
        self.live_out = vec![TempSet::new(); count];

        let mut live = live_out_block.clone();
        for i in (0..count).rev() {
            self.live_out[i] = live.clone();
            let mut live_in: TempSet = self.uses[i].clone();
            live_in.extend(live.difference(&self.def[i]).cloned());
            self.live_in[i] = live_in.clone();
            live = live_in;
        }
    }

    pub fn live_out(&self, index: usize) -> &TempSet {
        &self.live_out[index]
    }
}
