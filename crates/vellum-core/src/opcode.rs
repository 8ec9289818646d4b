//! The opcode catalogue (§4.E, §4.H table): one byte per instruction,
//! short/long pairs for anything indexing the constant pool, and a fixed
//! operand width per opcode except `Closure`.

use std::fmt;

/// Every instruction the VM understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Constant = 0,
    ConstantLong,
    Nil,
    True,
    False,
    Pop,
    GetLocal,
    GetLocalLong,
    SetLocal,
    SetLocalLong,
    GetGlobal,
    GetGlobalLong,
    SetGlobal,
    SetGlobalLong,
    DefineGlobal,
    DefineGlobalLong,
    GetUpvalue,
    SetUpvalue,
    CloseUpvalue,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Closure,
    Class,
    Method,
    Inherit,
    GetProperty,
    SetProperty,
    Invoke,
    GetSuper,
    SuperInvoke,
    Return,
}

impl OpCode {
    /// Decodes a raw byte, if it names a valid opcode.
    #[must_use]
    pub fn from_u8(byte: u8) -> Option<OpCode> {
        // Safety-free manual table: keep in exact declaration order above.
        const TABLE: &[OpCode] = &[
            OpCode::Constant,
            OpCode::ConstantLong,
            OpCode::Nil,
            OpCode::True,
            OpCode::False,
            OpCode::Pop,
            OpCode::GetLocal,
            OpCode::GetLocalLong,
            OpCode::SetLocal,
            OpCode::SetLocalLong,
            OpCode::GetGlobal,
            OpCode::GetGlobalLong,
            OpCode::SetGlobal,
            OpCode::SetGlobalLong,
            OpCode::DefineGlobal,
            OpCode::DefineGlobalLong,
            OpCode::GetUpvalue,
            OpCode::SetUpvalue,
            OpCode::CloseUpvalue,
            OpCode::Equal,
            OpCode::Greater,
            OpCode::Less,
            OpCode::Add,
            OpCode::Subtract,
            OpCode::Multiply,
            OpCode::Divide,
            OpCode::Not,
            OpCode::Negate,
            OpCode::Print,
            OpCode::Jump,
            OpCode::JumpIfFalse,
            OpCode::Loop,
            OpCode::Call,
            OpCode::Closure,
            OpCode::Class,
            OpCode::Method,
            OpCode::Inherit,
            OpCode::GetProperty,
            OpCode::SetProperty,
            OpCode::Invoke,
            OpCode::GetSuper,
            OpCode::SuperInvoke,
            OpCode::Return,
        ];
        TABLE.get(byte as usize).copied()
    }

    /// Human mnemonic, used by the disassembler and trace-execution dumps.
    #[must_use]
    pub const fn mnemonic(self) -> &'static str {
        match self {
            OpCode::Constant => "CONSTANT",
            OpCode::ConstantLong => "CONSTANT_LONG",
            OpCode::Nil => "NIL",
            OpCode::True => "TRUE",
            OpCode::False => "FALSE",
            OpCode::Pop => "POP",
            OpCode::GetLocal => "GET_LOCAL",
            OpCode::GetLocalLong => "GET_LOCAL_LONG",
            OpCode::SetLocal => "SET_LOCAL",
            OpCode::SetLocalLong => "SET_LOCAL_LONG",
            OpCode::GetGlobal => "GET_GLOBAL",
            OpCode::GetGlobalLong => "GET_GLOBAL_LONG",
            OpCode::SetGlobal => "SET_GLOBAL",
            OpCode::SetGlobalLong => "SET_GLOBAL_LONG",
            OpCode::DefineGlobal => "DEFINE_GLOBAL",
            OpCode::DefineGlobalLong => "DEFINE_GLOBAL_LONG",
            OpCode::GetUpvalue => "GET_UPVALUE",
            OpCode::SetUpvalue => "SET_UPVALUE",
            OpCode::CloseUpvalue => "CLOSE_UPVALUE",
            OpCode::Equal => "EQUAL",
            OpCode::Greater => "GREATER",
            OpCode::Less => "LESS",
            OpCode::Add => "ADD",
            OpCode::Subtract => "SUBTRACT",
            OpCode::Multiply => "MULTIPLY",
            OpCode::Divide => "DIVIDE",
            OpCode::Not => "NOT",
            OpCode::Negate => "NEGATE",
            OpCode::Print => "PRINT",
            OpCode::Jump => "JUMP",
            OpCode::JumpIfFalse => "JUMP_IF_FALSE",
            OpCode::Loop => "LOOP",
            OpCode::Call => "CALL",
            OpCode::Closure => "CLOSURE",
            OpCode::Class => "CLASS",
            OpCode::Method => "METHOD",
            OpCode::Inherit => "INHERIT",
            OpCode::GetProperty => "GET_PROPERTY",
            OpCode::SetProperty => "SET_PROPERTY",
            OpCode::Invoke => "INVOKE",
            OpCode::GetSuper => "GET_SUPER",
            OpCode::SuperInvoke => "SUPER_INVOKE",
            OpCode::Return => "RETURN",
        }
    }

    /// Number of operand bytes following the opcode byte itself. `Closure`
    /// returns its fixed 1-byte function-constant operand only; its
    /// trailing per-upvalue descriptor bytes are sized at decode time from
    /// the referenced function's upvalue count, not from this table.
    #[must_use]
    pub const fn operand_len(self) -> usize {
        match self {
            OpCode::Nil
            | OpCode::True
            | OpCode::False
            | OpCode::Pop
            | OpCode::CloseUpvalue
            | OpCode::Equal
            | OpCode::Greater
            | OpCode::Less
            | OpCode::Add
            | OpCode::Subtract
            | OpCode::Multiply
            | OpCode::Divide
            | OpCode::Not
            | OpCode::Negate
            | OpCode::Print
            | OpCode::Inherit
            | OpCode::Return => 0,
            OpCode::Constant
            | OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetGlobal
            | OpCode::SetGlobal
            | OpCode::DefineGlobal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call
            | OpCode::Closure
            | OpCode::Class
            | OpCode::Method
            | OpCode::GetProperty
            | OpCode::SetProperty
            | OpCode::GetSuper => 1,
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => 2,
            OpCode::ConstantLong
            | OpCode::GetLocalLong
            | OpCode::SetLocalLong
            | OpCode::GetGlobalLong
            | OpCode::SetGlobalLong
            | OpCode::DefineGlobalLong => 3,
            OpCode::Invoke | OpCode::SuperInvoke => 2, // name const idx (1) + argc (1)
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_through_byte() {
        for op in [OpCode::Constant, OpCode::Return, OpCode::SuperInvoke] {
            assert_eq!(OpCode::from_u8(op as u8), Some(op));
        }
    }

    #[test]
    fn mnemonics_are_stable() {
        assert_eq!(OpCode::Add.mnemonic(), "ADD");
        assert_eq!(OpCode::Return.to_string(), "RETURN");
    }
}
