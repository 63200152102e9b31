//! 操作数解码。
//!
//! 四种变长编码：literal（`#`）、reference（`$`）、multitype（`%`）、address（`@`）。
//! 解码游标为 `usize`，越过 65535 的读取自然落入越界检查。

use crate::error::FailureReason;

use super::Step;
use super::memory::UdvmMemory;

/// 操作数游标。
#[derive(Clone, Copy, Debug)]
pub(crate) struct Cursor {
    pos: usize,
}

impl Cursor {
    /// 定位到 `pc` 处指令的第一个操作数。
    pub(crate) fn after_opcode(pc: u16) -> Self {
        Self {
            pos: usize::from(pc) + 1,
        }
    }

    /// 当前位置对应的下一条指令地址。
    pub(crate) fn next_pc(self) -> u16 {
        (self.pos & 0xffff) as u16
    }

    /// 尚未解码的下一个字节的位置。
    pub(crate) fn position(self) -> usize {
        self.pos
    }

    fn byte(&mut self, memory: &UdvmMemory) -> Step<u8> {
        let value = memory.read_u8(self.pos)?;
        self.pos += 1;
        Ok(value)
    }

    fn word(&mut self, memory: &UdvmMemory) -> Step<u16> {
        let hi = self.byte(memory)?;
        let lo = self.byte(memory)?;
        Ok(u16::from_be_bytes([hi, lo]))
    }

    /// literal：`0nnnnnnn`、`10nnnnnn nnnnnnnn`、`11000000` + 16 位。
    pub(crate) fn literal(&mut self, memory: &UdvmMemory) -> Step<u16> {
        let first = self.byte(memory)?;
        match first {
            0x00..=0x7f => Ok(u16::from(first)),
            0x80..=0xbf => {
                let lo = self.byte(memory)?;
                Ok(u16::from_be_bytes([first & 0x3f, lo]))
            }
            0xc0 => self.word(memory),
            _ => Err(FailureReason::IllegalOperand),
        }
    }

    /// reference：返回被引用的内存地址。
    pub(crate) fn reference(&mut self, memory: &UdvmMemory) -> Step<u16> {
        let first = self.byte(memory)?;
        match first {
            0x00..=0x7f => Ok(u16::from(first) * 2),
            0x80..=0xbf => {
                let lo = self.byte(memory)?;
                Ok(u16::from_be_bytes([first & 0x3f, lo]) * 2)
            }
            0xc0 => self.word(memory),
            _ => Err(FailureReason::IllegalOperand),
        }
    }

    /// multitype：立即数、常量或经内存间接的 16 位值。
    pub(crate) fn multitype(&mut self, memory: &UdvmMemory) -> Step<u16> {
        let first = self.byte(memory)?;
        match first {
            0x00..=0x3f => Ok(u16::from(first)),
            0x40..=0x7f => memory.read_u16(u16::from(first & 0x3f) * 2),
            0x80 => self.word(memory),
            0x81 => {
                let addr = self.word(memory)?;
                memory.read_u16(addr)
            }
            0x86 => Ok(64),
            0x87 => Ok(128),
            0x88..=0x8f => Ok(1 << (first - 0x88 + 8)),
            0x90..=0x9f => {
                let lo = self.byte(memory)?;
                Ok(u16::from_be_bytes([first & 0x0f, lo]) + 61440)
            }
            0xa0..=0xbf => {
                let lo = self.byte(memory)?;
                Ok(u16::from_be_bytes([first & 0x1f, lo]))
            }
            0xc0..=0xdf => {
                let lo = self.byte(memory)?;
                memory.read_u16(u16::from_be_bytes([first & 0x1f, lo]))
            }
            0xe0..=0xff => Ok(u16::from(first - 0xe0) + 65504),
            _ => Err(FailureReason::IllegalOperand),
        }
    }

    /// address：multitype 值作为相对 `instruction_pc` 的位移，按 16 位回绕。
    pub(crate) fn address(&mut self, memory: &UdvmMemory, instruction_pc: u16) -> Step<u16> {
        Ok(instruction_pc.wrapping_add(self.multitype(memory)?))
    }
}
