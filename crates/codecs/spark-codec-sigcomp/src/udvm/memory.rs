//! UDVM 私有内存视图。
//!
//! 所有指令都只通过这里的检查型访问读写内存，越界一律转为 [`FailureReason::MemoryAccess`]。

use crate::error::FailureReason;

use super::Step;

/// `byte_copy_left` 寄存器地址。
pub(crate) const BYTE_COPY_LEFT: u16 = 64;
/// `byte_copy_right` 寄存器地址。
pub(crate) const BYTE_COPY_RIGHT: u16 = 66;
/// `input_bit_order` 寄存器地址。
pub(crate) const INPUT_BIT_ORDER: u16 = 68;
/// `stack_location` 寄存器地址。
pub(crate) const STACK_LOCATION: u16 = 70;

/// 头部字段：内存大小、每比特周期、版本、部分标识长度、状态长度。
const HEADER_MEMORY_SIZE: u16 = 0;
const HEADER_CYCLES_PER_BIT: u16 = 2;
const HEADER_VERSION: u16 = 4;
const HEADER_PARTIAL_ID_LENGTH: u16 = 6;
const HEADER_STATE_LENGTH: u16 = 8;

#[derive(Debug)]
pub(crate) struct UdvmMemory {
    bytes: Vec<u8>,
}

impl UdvmMemory {
    /// 分配清零的内存，`size` 不超过 65536。
    pub(crate) fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.bytes.len()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn read_u8(&self, addr: usize) -> Step<u8> {
        self.bytes
            .get(addr)
            .copied()
            .ok_or(FailureReason::MemoryAccess)
    }

    pub(crate) fn write_u8(&mut self, addr: usize, value: u8) -> Step<()> {
        let slot = self
            .bytes
            .get_mut(addr)
            .ok_or(FailureReason::MemoryAccess)?;
        *slot = value;
        Ok(())
    }

    /// 读取大端 16 位字。
    pub(crate) fn read_u16(&self, addr: u16) -> Step<u16> {
        let raw = self.slice(usize::from(addr), 2)?;
        Ok(u16::from_be_bytes([raw[0], raw[1]]))
    }

    /// 写入大端 16 位字。
    pub(crate) fn write_u16(&mut self, addr: u16, value: u16) -> Step<()> {
        self.slice_mut(usize::from(addr), 2)?
            .copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    /// 线性区间的只读视图。
    pub(crate) fn slice(&self, addr: usize, len: usize) -> Step<&[u8]> {
        let end = addr.checked_add(len).ok_or(FailureReason::MemoryAccess)?;
        self.bytes.get(addr..end).ok_or(FailureReason::MemoryAccess)
    }

    /// 线性区间的可写视图。
    pub(crate) fn slice_mut(&mut self, addr: usize, len: usize) -> Step<&mut [u8]> {
        let end = addr.checked_add(len).ok_or(FailureReason::MemoryAccess)?;
        self.bytes
            .get_mut(addr..end)
            .ok_or(FailureReason::MemoryAccess)
    }

    /// 写入固定头部。
    pub(crate) fn write_header(
        &mut self,
        cycles_per_bit: u16,
        version: u16,
        partial_id_length: u16,
        state_length: u16,
    ) -> Step<()> {
        // 65536 字节的内存按 0 编码。
        let encoded_size = (self.size() & 0xffff) as u16;
        self.write_u16(HEADER_MEMORY_SIZE, encoded_size)?;
        self.write_u16(HEADER_CYCLES_PER_BIT, cycles_per_bit)?;
        self.write_u16(HEADER_VERSION, version)?;
        self.write_u16(HEADER_PARTIAL_ID_LENGTH, partial_id_length)?;
        self.write_u16(HEADER_STATE_LENGTH, state_length)
    }
}
