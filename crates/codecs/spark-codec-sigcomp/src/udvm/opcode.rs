//! UDVM 指令集。

use crate::error::FailureReason;

/// RFC 3320 定义的 36 条指令。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Opcode {
    DecompressionFailure = 0,
    And = 1,
    Or = 2,
    Not = 3,
    Lshift = 4,
    Rshift = 5,
    Add = 6,
    Subtract = 7,
    Multiply = 8,
    Divide = 9,
    Remainder = 10,
    SortAscending = 11,
    SortDescending = 12,
    Sha1 = 13,
    Load = 14,
    Multiload = 15,
    Push = 16,
    Pop = 17,
    Copy = 18,
    CopyLiteral = 19,
    CopyOffset = 20,
    Memset = 21,
    Jump = 22,
    Compare = 23,
    Call = 24,
    Return = 25,
    Switch = 26,
    Crc = 27,
    InputBytes = 28,
    InputBits = 29,
    InputHuffman = 30,
    StateAccess = 31,
    StateCreate = 32,
    StateFree = 33,
    Output = 34,
    EndMessage = 35,
}

const ALL: [Opcode; 36] = [
    Opcode::DecompressionFailure,
    Opcode::And,
    Opcode::Or,
    Opcode::Not,
    Opcode::Lshift,
    Opcode::Rshift,
    Opcode::Add,
    Opcode::Subtract,
    Opcode::Multiply,
    Opcode::Divide,
    Opcode::Remainder,
    Opcode::SortAscending,
    Opcode::SortDescending,
    Opcode::Sha1,
    Opcode::Load,
    Opcode::Multiload,
    Opcode::Push,
    Opcode::Pop,
    Opcode::Copy,
    Opcode::CopyLiteral,
    Opcode::CopyOffset,
    Opcode::Memset,
    Opcode::Jump,
    Opcode::Compare,
    Opcode::Call,
    Opcode::Return,
    Opcode::Switch,
    Opcode::Crc,
    Opcode::InputBytes,
    Opcode::InputBits,
    Opcode::InputHuffman,
    Opcode::StateAccess,
    Opcode::StateCreate,
    Opcode::StateFree,
    Opcode::Output,
    Opcode::EndMessage,
];

impl TryFrom<u8> for Opcode {
    type Error = FailureReason;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        ALL.get(usize::from(value))
            .copied()
            .ok_or(FailureReason::IllegalInstruction)
    }
}

impl Opcode {
    /// RFC 中的指令助记符。
    pub(crate) const fn mnemonic(self) -> &'static str {
        match self {
            Self::DecompressionFailure => "DECOMPRESSION-FAILURE",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Not => "NOT",
            Self::Lshift => "LSHIFT",
            Self::Rshift => "RSHIFT",
            Self::Add => "ADD",
            Self::Subtract => "SUBTRACT",
            Self::Multiply => "MULTIPLY",
            Self::Divide => "DIVIDE",
            Self::Remainder => "REMAINDER",
            Self::SortAscending => "SORT-ASCENDING",
            Self::SortDescending => "SORT-DESCENDING",
            Self::Sha1 => "SHA-1",
            Self::Load => "LOAD",
            Self::Multiload => "MULTILOAD",
            Self::Push => "PUSH",
            Self::Pop => "POP",
            Self::Copy => "COPY",
            Self::CopyLiteral => "COPY-LITERAL",
            Self::CopyOffset => "COPY-OFFSET",
            Self::Memset => "MEMSET",
            Self::Jump => "JUMP",
            Self::Compare => "COMPARE",
            Self::Call => "CALL",
            Self::Return => "RETURN",
            Self::Switch => "SWITCH",
            Self::Crc => "CRC",
            Self::InputBytes => "INPUT-BYTES",
            Self::InputBits => "INPUT-BITS",
            Self::InputHuffman => "INPUT-HUFFMAN",
            Self::StateAccess => "STATE-ACCESS",
            Self::StateCreate => "STATE-CREATE",
            Self::StateFree => "STATE-FREE",
            Self::Output => "OUTPUT",
            Self::EndMessage => "END-MESSAGE",
        }
    }
}
