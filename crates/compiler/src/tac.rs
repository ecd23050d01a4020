//! Three-address code, the compiler's single intermediate representation
//!
//! Instructions are `(opcode, args, result)` triples whose operands are
//! textual handles. The one-character prefix identifies the operand class:
//!
//! - `%<digits>`  ordinary temporary, uniquely numbered
//! - `%p<digits>` parameter temporary, numbered per procedure from 0
//! - `%.L<digits>` label
//! - `@<name>`    global variable
//! - `#<digits>`  global-function handle (a top-level procedure used as a
//!   value)
//!
//! Prefixes are preserved by every transformation; the optimizer never
//! renames an operand into a different class.

use crate::ast::BinOp;
use serde::ser::{SerializeSeq, SerializeStruct};
use serde_json::{Value, json};

/// A textual operand handle.
pub type Temp = String;

pub fn is_label(temp: &str) -> bool {
    temp.starts_with("%.")
}

pub fn is_param(temp: &str) -> bool {
    temp.starts_with("%p")
}

/// An ordinary `%<digits>` temporary: `%` prefix, not a label, not a param.
pub fn is_ordinary(temp: &str) -> bool {
    temp.starts_with('%') && !is_label(temp) && !is_param(temp)
}

pub fn is_global(temp: &str) -> bool {
    temp.starts_with('@')
}

pub fn is_global_function(temp: &str) -> bool {
    temp.starts_with('#')
}

/// The closed opcode vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Label,
    Const,
    Copy,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    Neg,
    Not,
    Jmp,
    Jz,
    Jnz,
    Jl,
    Jle,
    Jg,
    Jge,
    Param,
    Call,
    Ret,
    Proc,
    GetFp,
}

impl Opcode {
    pub fn as_str(self) -> &'static str {
        match self {
            Opcode::Label => "label",
            Opcode::Const => "const",
            Opcode::Copy => "copy",
            Opcode::Add => "add",
            Opcode::Sub => "sub",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Xor => "xor",
            Opcode::Mul => "mul",
            Opcode::Div => "div",
            Opcode::Mod => "mod",
            Opcode::Shl => "shl",
            Opcode::Shr => "shr",
            Opcode::Neg => "neg",
            Opcode::Not => "not",
            Opcode::Jmp => "jmp",
            Opcode::Jz => "jz",
            Opcode::Jnz => "jnz",
            Opcode::Jl => "jl",
            Opcode::Jle => "jle",
            Opcode::Jg => "jg",
            Opcode::Jge => "jge",
            Opcode::Param => "param",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Proc => "proc",
            Opcode::GetFp => "get_fp",
        }
    }

    /// Conditional jumps: compare the operand with 0 and branch.
    pub fn is_cond_jump(self) -> bool {
        matches!(
            self,
            Opcode::Jz | Opcode::Jnz | Opcode::Jl | Opcode::Jle | Opcode::Jg | Opcode::Jge
        )
    }

    pub fn is_jump(self) -> bool {
        self == Opcode::Jmp || self.is_cond_jump()
    }

    /// Condition code for a comparison operator: the branch taken when
    /// `lhs - rhs` satisfies the comparison.
    pub fn cond_for(op: BinOp) -> Option<Opcode> {
        let opcode = match op {
            BinOp::Eq => Opcode::Jz,
            BinOp::Ne => Opcode::Jnz,
            BinOp::Lt => Opcode::Jl,
            BinOp::Le => Opcode::Jle,
            BinOp::Gt => Opcode::Jg,
            BinOp::Ge => Opcode::Jge,
            _ => return None,
        };
        Some(opcode)
    }

    /// ALU opcode for an arithmetic/bitwise operator.
    pub fn alu_for(op: BinOp) -> Option<Opcode> {
        let opcode = match op {
            BinOp::Add => Opcode::Add,
            BinOp::Sub => Opcode::Sub,
            BinOp::Mul => Opcode::Mul,
            BinOp::Div => Opcode::Div,
            BinOp::Rem => Opcode::Mod,
            BinOp::BitAnd => Opcode::And,
            BinOp::BitOr => Opcode::Or,
            BinOp::BitXor => Opcode::Xor,
            BinOp::Shl => Opcode::Shl,
            BinOp::Shr => Opcode::Shr,
            _ => return None,
        };
        Some(opcode)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One TAC instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instr {
    pub opcode: Opcode,
    pub args: Vec<Temp>,
    pub result: Option<Temp>,
}

impl Instr {
    pub fn new(opcode: Opcode, args: Vec<Temp>, result: Option<Temp>) -> Self {
        Instr {
            opcode,
            args,
            result,
        }
    }

    pub fn label(label: impl Into<Temp>) -> Self {
        Instr::new(Opcode::Label, vec![label.into()], None)
    }

    pub fn jmp(target: impl Into<Temp>) -> Self {
        Instr::new(Opcode::Jmp, vec![], Some(target.into()))
    }

    /// Target of a `jmp`, accepted in either the argument or result slot.
    pub fn jmp_target(&self) -> Option<&Temp> {
        if self.opcode != Opcode::Jmp {
            return None;
        }
        self.result.as_ref().or_else(|| self.args.first())
    }

    pub fn set_jmp_target(&mut self, target: Temp) {
        debug_assert_eq!(self.opcode, Opcode::Jmp);
        if self.result.is_some() {
            self.result = Some(target);
        } else if !self.args.is_empty() {
            self.args[0] = target;
        } else {
            self.result = Some(target);
        }
    }

    /// Branch target of this instruction, if it is any kind of jump.
    pub fn branch_target(&self) -> Option<&Temp> {
        if self.opcode.is_cond_jump() {
            self.result.as_ref()
        } else {
            self.jmp_target()
        }
    }

    /// Retarget a jump, conditional or not.
    pub fn set_branch_target(&mut self, target: Temp) {
        if self.opcode.is_cond_jump() {
            self.result = Some(target);
        } else {
            self.set_jmp_target(target);
        }
    }

    /// JSON form: `{"opcode": ..., "args": [...], "result": ... | null}`
    /// with integer literal args as JSON numbers.
    pub fn to_json(&self) -> Value {
        json!(self)
    }
}

impl serde::Serialize for Instr {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        // Args are heterogeneous on the wire: anything that parses as a
        // 64-bit integer dumps as a number, the rest as strings.
        struct Args<'a>(&'a [Temp]);

        impl serde::Serialize for Args<'_> {
            fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                let mut seq = serializer.serialize_seq(Some(self.0.len()))?;
                for arg in self.0 {
                    match arg.parse::<i64>() {
                        Ok(n) => seq.serialize_element(&n)?,
                        Err(_) => seq.serialize_element(arg)?,
                    }
                }
                seq.end()
            }
        }

        let mut state = serializer.serialize_struct("Instr", 3)?;
        state.serialize_field("opcode", self.opcode.as_str())?;
        state.serialize_field("args", &Args(&self.args))?;
        state.serialize_field("result", &self.result)?;
        state.end()
    }
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.opcode, self.args.join(", "))?;
        if let Some(result) = &self.result {
            write!(f, " -> {}", result)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_temp_classes_are_disjoint() {
        assert!(is_ordinary("%7"));
        assert!(!is_ordinary("%p0"));
        assert!(!is_ordinary("%.L3"));
        assert!(is_param("%p0"));
        assert!(is_label("%.L3"));
        assert!(is_global("@counter"));
        assert!(is_global_function("#2"));
    }

    #[test]
    fn test_jmp_target_in_either_slot() {
        let by_result = Instr::jmp("%.L1");
        assert_eq!(by_result.jmp_target().map(String::as_str), Some("%.L1"));

        let by_arg = Instr::new(Opcode::Jmp, vec!["%.L2".into()], None);
        assert_eq!(by_arg.jmp_target().map(String::as_str), Some("%.L2"));
    }

    #[test]
    fn test_branch_target_for_cond_jump() {
        let instr = Instr::new(Opcode::Jz, vec!["%3".into()], Some("%.L5".into()));
        assert_eq!(instr.branch_target().map(String::as_str), Some("%.L5"));
    }

    #[test]
    fn test_json_numeric_args() {
        let instr = Instr::new(Opcode::Const, vec!["42".into()], Some("%0".into()));
        let value = instr.to_json();
        assert_eq!(value["opcode"], "const");
        assert_eq!(value["args"][0], 42);
        assert_eq!(value["result"], "%0");
    }

    #[test]
    fn test_json_negative_literal_is_number() {
        let instr = Instr::new(Opcode::Const, vec!["-5".into()], Some("%0".into()));
        assert_eq!(instr.to_json()["args"][0], -5);
    }

    #[test]
    fn test_json_null_result() {
        let instr = Instr::new(Opcode::Ret, vec![], None);
        assert!(instr.to_json()["result"].is_null());
    }

    #[test]
    fn test_json_symbolic_arg_stays_string() {
        let instr = Instr::new(Opcode::Copy, vec!["%1".into()], Some("%2".into()));
        assert_eq!(instr.to_json()["args"][0], "%1");
    }

    #[test]
    fn test_cond_for_covers_all_comparisons() {
        assert_eq!(Opcode::cond_for(BinOp::Eq), Some(Opcode::Jz));
        assert_eq!(Opcode::cond_for(BinOp::Ne), Some(Opcode::Jnz));
        assert_eq!(Opcode::cond_for(BinOp::Lt), Some(Opcode::Jl));
        assert_eq!(Opcode::cond_for(BinOp::Le), Some(Opcode::Jle));
        assert_eq!(Opcode::cond_for(BinOp::Gt), Some(Opcode::Jg));
        assert_eq!(Opcode::cond_for(BinOp::Ge), Some(Opcode::Jge));
        assert_eq!(Opcode::cond_for(BinOp::Add), None);
    }
}
