//! Instruction set: opcode table, optype decoding and the operand cursor.
//!
//! Every instruction starts with one opcode byte. Most are followed by an
//! optype byte:
//!
//! ```text
//!  7   4 3   1   0
//! +-----+-----+---+
//! | id  |type |lit|
//! +-----+-----+---+
//! ```
//!
//! `lit` selects a literal inlined in the stream (1) or a 16-bit address of
//! the value (0). `type` is one of uint32 (0x00), rational (0x02), uint8
//! (0x04) or uint16 (0x06). `id` addresses a mapping slot or PID controller.
//! All multi-byte fields are little-endian.

use crate::error::{Result, VmError};
use crate::memory::{Memory, MAP_OPTION_RESOURCE_LITERAL, MAP_OPTION_URL_LITERAL};
use crate::rational::Rational;
use std::fmt::Write as _;

pub const OPTYPE_LITERAL: u8 = 0x01;
pub const OPTYPE_ADDRESS_MASK: u8 = 0x01;
pub const OPTYPE_TYPE_MASK: u8 = 0x0E;
pub const TYPE_UINT32: u8 = 0x00;
pub const TYPE_RATIONAL: u8 = 0x02;
pub const TYPE_UINT8: u8 = 0x04;
pub const TYPE_UINT16: u8 = 0x06;

macro_rules! define_opcodes {
    ($($(#[$doc:meta])* $name:ident = $byte:literal, $mnemonic:literal;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$doc])* $name = $byte,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$name => $mnemonic,)*
                }
            }
        }

        impl TryFrom<u8> for Opcode {
            type Error = VmError;

            fn try_from(byte: u8) -> Result<Self> {
                match byte {
                    $($byte => Ok(Opcode::$name),)*
                    other => Err(VmError::UnsupportedOperation(other)),
                }
            }
        }
    };
}

define_opcodes! {
    /// Sets HALTED; pc stays on this byte.
    Halt = 0x00, "HALT";
    Add = 0x01, "ADD";
    Sub = 0x02, "SUB";
    Mul = 0x03, "MUL";
    Div = 0x04, "DIV";
    /// Integer modulo, real-valued remainder for rationals.
    Mod = 0x05, "MOD";
    And = 0x10, "AND";
    Or = 0x11, "OR";
    /// Bitwise complement in place; takes no operand.
    Not = 0x12, "NOT";
    Xor = 0x13, "XOR";
    Lshift = 0x14, "LSHIFT";
    Rshift = 0x15, "RSHIFT";
    Load = 0x20, "LOAD";
    Multiload = 0x21, "MULTILOAD";
    /// Reserved, always fails.
    Push = 0x30, "PUSH";
    /// Reserved, always fails.
    Pop = 0x31, "POP";
    Copy = 0x40, "COPY";
    Jump = 0x51, "JUMP";
    Compare = 0x52, "COMPARE";
    Call = 0x53, "CALL";
    Return = 0x54, "RETURN";
    Time = 0x60, "TIME";
    CompareTime = 0x61, "COMPARETIME";
    UrlMap = 0x70, "URLMAP";
    UrlMapCheck = 0x71, "URLMAPCHECK";
    UrlMapDelete = 0x72, "URLMAPDELETE";
    PidInit = 0x80, "PIDINIT";
    PidClear = 0x82, "PIDCLEAR";
    PidStop = 0x83, "PIDSTOP";
    PidRun = 0x84, "PIDRUN";
    /// Clears memory, stack and PID bank, then halts with the reset code.
    Reset = 0xFF, "RESET";
}

impl Opcode {
    pub const fn byte(self) -> u8 {
        self as u8
    }
}

pub fn lookup(byte: u8) -> Option<Opcode> {
    Opcode::try_from(byte).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Uint8,
    Uint16,
    Uint32,
    Rational,
}

impl DataType {
    pub fn from_optype(optype: u8) -> Option<Self> {
        match optype & OPTYPE_TYPE_MASK {
            TYPE_UINT32 => Some(DataType::Uint32),
            TYPE_RATIONAL => Some(DataType::Rational),
            TYPE_UINT8 => Some(DataType::Uint8),
            TYPE_UINT16 => Some(DataType::Uint16),
            _ => None,
        }
    }

    pub fn width<R: Rational>(self) -> usize {
        match self {
            DataType::Uint8 => 1,
            DataType::Uint16 => 2,
            DataType::Uint32 => 4,
            DataType::Rational => R::WIDTH,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DataType::Uint8 => "u8",
            DataType::Uint16 => "u16",
            DataType::Uint32 => "u32",
            DataType::Rational => "rational",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Optype(pub u8);

impl Optype {
    pub fn id(self) -> u8 {
        self.0 >> 4
    }

    pub fn is_literal(self) -> bool {
        self.0 & OPTYPE_ADDRESS_MASK == OPTYPE_LITERAL
    }

    pub fn data_type(self) -> Option<DataType> {
        DataType::from_optype(self.0)
    }
}

/// Anything instructions can be fetched from.
pub trait CodeSource {
    fn code_byte(&self, address: u16) -> Result<u8>;
}

impl<R: Rational> CodeSource for Memory<R> {
    fn code_byte(&self, address: u16) -> Result<u8> {
        self.load(address)
    }
}

impl CodeSource for [u8] {
    fn code_byte(&self, address: u16) -> Result<u8> {
        self.get(address as usize)
            .copied()
            .ok_or(VmError::MemoryAccessViolation {
                op: "fetch",
                address: address as u32,
                width: 1,
            })
    }
}

/// Reads instruction fields starting at `pc`, leaving `pc` on the first
/// unread byte.
pub struct Cursor<'a, S: CodeSource + ?Sized> {
    source: &'a S,
    pc: u16,
}

impl<'a, S: CodeSource + ?Sized> Cursor<'a, S> {
    pub fn new(source: &'a S, pc: u16) -> Self {
        Self { source, pc }
    }

    pub fn pc(&self) -> u16 {
        self.pc
    }

    fn advance(&mut self, width: usize) -> Result<u16> {
        let start = self.pc;
        self.pc = u16::try_from(start as usize + width).map_err(|_| {
            VmError::MemoryAccessViolation {
                op: "fetch",
                address: start as u32,
                width,
            }
        })?;
        Ok(start)
    }

    pub fn byte(&mut self) -> Result<u8> {
        let value = self.source.code_byte(self.pc)?;
        self.advance(1)?;
        Ok(value)
    }

    pub fn optype(&mut self) -> Result<Optype> {
        self.byte().map(Optype)
    }

    pub fn address(&mut self) -> Result<u16> {
        let lo = self.byte()?;
        let hi = self.byte()?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    pub fn unsigned(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        for byte in raw.iter_mut() {
            *byte = self.byte()?;
        }
        Ok(u32::from_le_bytes(raw))
    }

    /// Address of an inline literal of `width` bytes; skips over it.
    pub fn literal(&mut self, width: usize) -> Result<u16> {
        self.advance(width)
    }

    /// Address where the operand value lives: inline for literals, a
    /// 16-bit pointer otherwise.
    pub fn operand(&mut self, optype: Optype, width: usize) -> Result<u16> {
        if optype.is_literal() {
            self.literal(width)
        } else {
            self.address()
        }
    }

    /// Start of an inline NUL-terminated string; `pc` ends past the NUL.
    pub fn string(&mut self) -> Result<u16> {
        let start = self.pc;
        while self.byte()? != 0 {}
        Ok(start)
    }
}

fn operand_text<S: CodeSource + ?Sized>(
    cursor: &mut Cursor<'_, S>,
    optype: Optype,
    width: usize,
) -> Result<String> {
    if !optype.is_literal() {
        return Ok(format!("[0x{:04X}]", cursor.address()?));
    }
    let mut text = String::from("#");
    for _ in 0..width {
        let _ = write!(text, "{:02X}", cursor.byte()?);
    }
    Ok(text)
}

fn string_text<S: CodeSource + ?Sized>(
    cursor: &mut Cursor<'_, S>,
    literal: bool,
) -> Result<String> {
    if !literal {
        return Ok(format!("[0x{:04X}]", cursor.address()?));
    }
    let mut raw = Vec::new();
    loop {
        match cursor.byte()? {
            0 => break,
            byte => raw.push(byte),
        }
    }
    Ok(format!("{:?}", String::from_utf8_lossy(&raw)))
}

fn typed<R: Rational>(optype: Optype, op: Opcode) -> Result<(DataType, usize)> {
    let ty = optype.data_type().ok_or(VmError::UnsupportedOperand {
        mnemonic: op.mnemonic(),
        optype: optype.0,
    })?;
    Ok((ty, ty.width::<R>()))
}

fn disassemble_one<R: Rational, S: CodeSource + ?Sized>(
    cursor: &mut Cursor<'_, S>,
) -> Result<String> {
    let op = Opcode::try_from(cursor.byte()?)?;
    let mut line = op.mnemonic().to_string();
    match op {
        Opcode::Add
        | Opcode::Sub
        | Opcode::Mul
        | Opcode::Div
        | Opcode::Mod
        | Opcode::And
        | Opcode::Or
        | Opcode::Xor
        | Opcode::Lshift
        | Opcode::Rshift
        | Opcode::Load
        | Opcode::Compare => {
            let optype = cursor.optype()?;
            let (ty, width) = typed::<R>(optype, op)?;
            let dest = cursor.address()?;
            let operand = operand_text(cursor, optype, width)?;
            let _ = write!(line, ".{} 0x{dest:04X}, {operand}", ty.name());
            if op == Opcode::Compare {
                let (lt, eq, gt) = (cursor.address()?, cursor.address()?, cursor.address()?);
                let _ = write!(line, " ? 0x{lt:04X} : 0x{eq:04X} : 0x{gt:04X}");
            }
        }
        Opcode::Not => {
            let optype = cursor.optype()?;
            let (ty, _) = typed::<R>(optype, op)?;
            let _ = write!(line, ".{} 0x{:04X}", ty.name(), cursor.address()?);
        }
        Opcode::Multiload => {
            let optype = cursor.optype()?;
            let (ty, width) = typed::<R>(optype, op)?;
            let dest = cursor.address()?;
            let count = cursor.byte()?;
            let _ = write!(line, ".{} 0x{dest:04X}", ty.name());
            for _ in 0..count {
                let _ = write!(line, ", {}", operand_text(cursor, optype, width)?);
            }
        }
        Opcode::Copy => {
            let (src, len, dest) = (cursor.address()?, cursor.byte()?, cursor.address()?);
            let _ = write!(line, " 0x{src:04X}, {len}, 0x{dest:04X}");
        }
        Opcode::Jump => {
            let optype = cursor.optype()?;
            let _ = write!(line, " {}", operand_text(cursor, optype, 2)?);
        }
        Opcode::Call | Opcode::Time => {
            let _ = write!(line, " 0x{:04X}", cursor.address()?);
        }
        Opcode::CompareTime => {
            let addr = cursor.address()?;
            let timeout = cursor.unsigned()?;
            let (j1, j2) = (cursor.address()?, cursor.address()?);
            let _ = write!(line, " 0x{addr:04X}, {timeout}ms ? 0x{j1:04X} : 0x{j2:04X}");
        }
        Opcode::UrlMap => {
            let optype = cursor.optype()?;
            let options = cursor.byte()?;
            let value = cursor.address()?;
            let port = cursor.address()?;
            let url = string_text(cursor, options & MAP_OPTION_URL_LITERAL != 0)?;
            let resource = string_text(cursor, options & MAP_OPTION_RESOURCE_LITERAL != 0)?;
            let _ = write!(
                line,
                " id={} opt=0x{options:02X} value=0x{value:04X} port={port} {url} {resource}",
                optype.id()
            );
        }
        Opcode::UrlMapCheck => {
            let optype = cursor.optype()?;
            let _ = write!(line, " id={} -> 0x{:04X}", optype.id(), cursor.address()?);
        }
        Opcode::UrlMapDelete | Opcode::PidClear | Opcode::PidStop | Opcode::PidRun => {
            let _ = write!(line, " id={}", cursor.optype()?.id());
        }
        Opcode::PidInit => {
            let id = cursor.optype()?.id();
            let (input, output, setpoint) =
                (cursor.address()?, cursor.address()?, cursor.address()?);
            let mut gains = [0f64; 3];
            for gain in gains.iter_mut() {
                *gain = read_rational::<R, S>(cursor)?.to_f64();
            }
            let sample = cursor.unsigned()?;
            let lower = read_rational::<R, S>(cursor)?.to_f64();
            let upper = read_rational::<R, S>(cursor)?.to_f64();
            let direction = cursor.byte()?;
            let _ = write!(
                line,
                " id={id} in=0x{input:04X} out=0x{output:04X} set=0x{setpoint:04X} \
                 k=({}, {}, {}) {sample}ms [{lower}, {upper}] dir={direction}",
                gains[0], gains[1], gains[2]
            );
        }
        Opcode::Halt | Opcode::Reset | Opcode::Return | Opcode::Push | Opcode::Pop => {}
    }
    Ok(line)
}

fn read_rational<R: Rational, S: CodeSource + ?Sized>(cursor: &mut Cursor<'_, S>) -> Result<R> {
    let mut raw = vec![0u8; R::WIDTH];
    for byte in raw.iter_mut() {
        *byte = cursor.byte()?;
    }
    Ok(R::decode(&raw))
}

/// Renders a program as `(address, text)` lines. Decoding stops at the first
/// malformed instruction, which is reported as its own line.
pub fn disassemble<R: Rational>(program: &[u8]) -> Vec<(u16, String)> {
    let mut lines = Vec::new();
    let mut cursor = Cursor::new(program, 0);
    while (cursor.pc() as usize) < program.len() {
        let start = cursor.pc();
        match disassemble_one::<R, [u8]>(&mut cursor) {
            Ok(text) => lines.push((start, text)),
            Err(err) => {
                lines.push((start, format!("?? {err}")));
                break;
            }
        }
    }
    lines
}
