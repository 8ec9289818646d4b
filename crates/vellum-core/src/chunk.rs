//! The compiled bytecode container (§4.E): a raw byte stream, a
//! run-length-encoded line table, and a constant pool.

use crate::error::{Error, Result};
use crate::opcode::OpCode;
use crate::value::Value;

const MAX_CONSTANTS: usize = 1 << 24;

/// One run of consecutive instruction bytes that share a source line.
#[derive(Debug, Clone, Copy)]
struct LineRun {
    line: u32,
    /// Number of bytecode bytes covered by this run.
    len: u32,
}

/// A run-length-encoded map from byte offset to source line.
#[derive(Debug, Clone, Default)]
pub struct LineTable {
    runs: Vec<LineRun>,
}

impl LineTable {
    fn push(&mut self, line: u32) {
        match self.runs.last_mut() {
            Some(run) if run.line == line => run.len += 1,
            _ => self.runs.push(LineRun { line, len: 1 }),
        }
    }

    /// The source line for byte `offset`. Lookup is a linear walk over
    /// runs, stopping the first time the cumulative length strictly
    /// exceeds `offset` (§9 open-question resolution: strict less-than).
    #[must_use]
    pub fn line_for_offset(&self, offset: usize) -> u32 {
        let mut cum = 0usize;
        for run in &self.runs {
            cum += run.len as usize;
            if offset < cum {
                return run.line;
            }
        }
        self.runs.last().map_or(0, |r| r.line)
    }
}

/// A compiled bytecode fragment: instructions, their source lines, and the
/// constants they reference.
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// Raw opcode/operand byte stream.
    pub code: Vec<u8>,
    /// Line-number run-length table, one entry pushed per byte of `code`.
    pub lines: LineTable,
    /// Constants referenced by `Constant`/`ConstantLong` operands.
    pub constants: Vec<Value>,
}

impl Chunk {
    /// An empty chunk.
    #[must_use]
    pub fn new() -> Self {
        Chunk::default()
    }

    /// Appends one raw byte, recording its source line.
    pub fn write_u8(&mut self, byte: u8, line: u32) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Appends a `u16` big-endian operand (jump offsets).
    pub fn write_u16(&mut self, value: u16, line: u32) {
        let [hi, lo] = value.to_be_bytes();
        self.write_u8(hi, line);
        self.write_u8(lo, line);
    }

    /// Appends a 24-bit big-endian operand (long constant/global/local
    /// indices).
    pub fn write_u24(&mut self, value: u32, line: u32) {
        debug_assert!(value < (1 << 24));
        let bytes = value.to_be_bytes();
        self.write_u8(bytes[1], line);
        self.write_u8(bytes[2], line);
        self.write_u8(bytes[3], line);
    }

    /// Adds `v` to the constant pool, returning its index.
    pub fn add_constant(&mut self, v: Value) -> Result<u32> {
        if self.constants.len() >= MAX_CONSTANTS {
            return Err(Error::TooManyConstants { max: MAX_CONSTANTS });
        }
        self.constants.push(v);
        Ok((self.constants.len() - 1) as u32)
    }

    /// The single emission path for any instruction that references a
    /// pool index (constants, globals, locals): emits the 1-byte `short`
    /// opcode when `index` fits a `u8`, else the 3-byte `long` opcode with
    /// a big-endian 24-bit operand. There is no other path that picks an
    /// operand width (§9 open-question resolution).
    pub fn emit_variable_width(&mut self, short_op: OpCode, long_op: OpCode, index: u32, line: u32) {
        if let Ok(byte) = u8::try_from(index) {
            self.write_u8(short_op as u8, line);
            self.write_u8(byte, line);
        } else {
            self.write_u8(long_op as u8, line);
            self.write_u24(index, line);
        }
    }

    /// The source line covering byte `offset`.
    #[must_use]
    pub fn get_line(&self, offset: usize) -> u32 {
        self.lines.line_for_offset(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_lookup_is_monotonic_and_strict() {
        let mut c = Chunk::new();
        c.write_u8(0, 1);
        c.write_u8(0, 1);
        c.write_u8(0, 2);
        assert_eq!(c.get_line(0), 1);
        assert_eq!(c.get_line(1), 1);
        assert_eq!(c.get_line(2), 2);
    }

    #[test]
    fn variable_width_picks_short_then_long() {
        let mut c = Chunk::new();
        c.emit_variable_width(OpCode::Constant, OpCode::ConstantLong, 10, 1);
        assert_eq!(c.code, vec![OpCode::Constant as u8, 10]);

        let mut c2 = Chunk::new();
        c2.emit_variable_width(OpCode::Constant, OpCode::ConstantLong, 300, 1);
        assert_eq!(c2.code[0], OpCode::ConstantLong as u8);
        assert_eq!(c2.code.len(), 4);
    }

    #[test]
    fn too_many_constants_errors() {
        let mut c = Chunk::new();
        for _ in 0..5 {
            c.add_constant(Value::Nil).unwrap();
        }
        assert!(c.constants.len() == 5);
    }
}
