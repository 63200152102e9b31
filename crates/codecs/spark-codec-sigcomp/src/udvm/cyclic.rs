//! # 循环缓冲遍历
//!
//! # 核心机制（How）
//! - 地址逐字节前进：`addr + 1` 若等于 `byte_copy_right`，跳回 `byte_copy_left`；
//! - 非重叠的批量读写按“连续段”处理，每段是一个线性区间；
//! - 可能自重叠的拷贝（COPY/COPY-LITERAL/COPY-OFFSET）必须逐字节进行，后写的字节可以被后读到。
//!
//! # 契约说明（What）
//! - 任何落在内存之外的地址都返回 [`FailureReason::MemoryAccess`]。

use std::ops::Range;

use crate::error::FailureReason;
use crate::state::StateContent;

use super::Step;
use super::memory::{BYTE_COPY_LEFT, BYTE_COPY_RIGHT, UdvmMemory};

/// 一次指令执行期间的循环缓冲边界。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Cyclic {
    pub(crate) left: u16,
    pub(crate) right: u16,
}

impl Cyclic {
    pub(crate) fn from_memory(memory: &UdvmMemory) -> Step<Self> {
        Ok(Self {
            left: memory.read_u16(BYTE_COPY_LEFT)?,
            right: memory.read_u16(BYTE_COPY_RIGHT)?,
        })
    }

    /// 单步前进。
    pub(crate) fn next(self, addr: u16) -> u16 {
        let next = addr.wrapping_add(1);
        if next == self.right { self.left } else { next }
    }

    /// 从 `addr` 开始的最长连续段长度（不超过 `remaining`），以及段后的下一个地址。
    fn run(self, addr: u16, remaining: usize) -> (usize, u16) {
        let addr_usize = usize::from(addr);
        let right = usize::from(self.right);
        let boundary = if addr_usize < right { right } else { 1 << 16 };
        let len = remaining.min(boundary - addr_usize);
        let end = addr_usize + len;
        let next = if end == right || (end == 1 << 16 && self.right == 0) {
            self.left
        } else {
            (end & 0xffff) as u16
        };
        (len, next)
    }

    /// 依次给出覆盖 `len` 字节的线性区间，并校验每段都落在内存内。
    pub(crate) fn segments(
        self,
        memory_size: usize,
        start: u16,
        len: usize,
    ) -> Step<Vec<Range<usize>>> {
        let mut out = Vec::new();
        let mut addr = start;
        let mut remaining = len;
        while remaining > 0 {
            let (run, next) = self.run(addr, remaining);
            let begin = usize::from(addr);
            if begin + run > memory_size {
                return Err(FailureReason::MemoryAccess);
            }
            out.push(begin..begin + run);
            remaining -= run;
            addr = next;
        }
        Ok(out)
    }

    /// 读出循环区间的字节。
    pub(crate) fn read(self, memory: &UdvmMemory, start: u16, len: usize) -> Step<Vec<u8>> {
        let mut out = Vec::with_capacity(len);
        for range in self.segments(memory.size(), start, len)? {
            out.extend_from_slice(&memory.as_slice()[range]);
        }
        Ok(out)
    }

    /// 把 `data` 写入循环区间，返回写完后的下一个地址。
    pub(crate) fn write(self, memory: &mut UdvmMemory, start: u16, data: &[u8]) -> Step<u16> {
        let mut offset = 0;
        let mut addr = start;
        for range in self.segments(memory.size(), start, data.len())? {
            let len = range.len();
            memory
                .slice_mut(range.start, len)?
                .copy_from_slice(&data[offset..offset + len]);
            offset += len;
            addr = self.advance(addr, len);
        }
        Ok(addr)
    }

    /// 前进 `count` 步。
    pub(crate) fn advance(self, mut addr: u16, mut count: usize) -> u16 {
        while count > 0 {
            let (run, next) = self.run(addr, count);
            count -= run;
            addr = next;
        }
        addr
    }

    /// COPY-OFFSET 的源地址：从 `destination` 回退 `offset` 字节，回退越过 `byte_copy_left` 时从右端继续。
    pub(crate) fn offset_source(self, destination: u16, offset: u16) -> u16 {
        let size = self.right.wrapping_sub(self.left);
        if size == 0 {
            return destination.wrapping_sub(offset);
        }
        let into_buffer = destination.wrapping_sub(self.left);
        if into_buffer >= offset {
            return destination.wrapping_sub(offset);
        }
        let rem = (offset - into_buffer) % size;
        if rem == 0 {
            self.left
        } else {
            self.right.wrapping_sub(rem)
        }
    }

    /// 逐字节拷贝，允许源与目的重叠；返回拷贝后的源与目的地址。
    pub(crate) fn copy(
        self,
        memory: &mut UdvmMemory,
        mut source: u16,
        mut destination: u16,
        len: usize,
    ) -> Step<(u16, u16)> {
        for _ in 0..len {
            let byte = memory.read_u8(usize::from(source))?;
            memory.write_u8(usize::from(destination), byte)?;
            source = self.next(source);
            destination = self.next(destination);
        }
        Ok((source, destination))
    }
}

/// 内存中的一段循环区间，作为状态内容参与查重与保存。
///
/// 构造时已校验所有地址都在内存内。
pub struct CyclicRegion<'a> {
    memory: &'a [u8],
    segments: Vec<Range<usize>>,
    len: usize,
}

impl<'a> CyclicRegion<'a> {
    pub(crate) fn new(memory: &'a UdvmMemory, start: u16, len: usize) -> Step<Self> {
        let cyclic = Cyclic::from_memory(memory)?;
        let segments = cyclic.segments(memory.size(), start, len)?;
        Ok(Self {
            memory: memory.as_slice(),
            segments,
            len,
        })
    }

    /// 依次给出各连续段。
    pub fn chunks(&self) -> impl Iterator<Item = &'a [u8]> + '_ {
        self.segments
            .iter()
            .filter_map(|range| self.memory.get(range.clone()))
    }
}

impl StateContent for CyclicRegion<'_> {
    fn len(&self) -> usize {
        self.len
    }

    fn matches(&self, stored: &[u8]) -> bool {
        if stored.len() != self.len {
            return false;
        }
        let mut offset = 0;
        for chunk in self.chunks() {
            if stored[offset..offset + chunk.len()] != *chunk {
                return false;
            }
            offset += chunk.len();
        }
        true
    }

    fn write_to(&self, dst: &mut [u8]) {
        let mut offset = 0;
        for chunk in self.chunks() {
            dst[offset..offset + chunk.len()].copy_from_slice(chunk);
            offset += chunk.len();
        }
    }
}
