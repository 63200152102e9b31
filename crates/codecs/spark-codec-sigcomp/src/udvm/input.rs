//! UDVM 输入流：字节读取与按位读取共享同一游标。
//!
//! - 位缓冲为 32 位，已缓冲的位左对齐；
//! - P 位（`input_bit_order & 1`）为 1 时每个输入字节先做位翻转，即按 LSB 优先取位；
//! - P 位变化时丢弃缓冲中残留的位；
//! - 字节读取前总是丢弃残留位。

use bytes::Bytes;

#[derive(Debug)]
pub(crate) struct InputStream {
    data: Bytes,
    pos: usize,
    bits: u32,
    bit_count: u32,
    lsb_first: bool,
}

impl InputStream {
    pub(crate) fn new(data: Bytes) -> Self {
        Self {
            data,
            pos: 0,
            bits: 0,
            bit_count: 0,
            lsb_first: false,
        }
    }

    /// 剩余未消费的整字节数。
    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// 读取 `len` 个整字节；不足时返回 `None` 且不消费。
    pub(crate) fn take_bytes(&mut self, len: usize) -> Option<Bytes> {
        self.bits = 0;
        self.bit_count = 0;
        if self.remaining() < len {
            return None;
        }
        let out = self.data.slice(self.pos..self.pos + len);
        self.pos += len;
        Some(out)
    }

    /// 读取 `count`（≤ 16）位，按 MSB 优先拼成整数。
    ///
    /// 输入不足时返回 `None`，游标与位缓冲保持不变。
    pub(crate) fn take_bits(&mut self, count: u32, lsb_first: bool) -> Option<u16> {
        let buffered = if lsb_first == self.lsb_first {
            self.bit_count as usize
        } else {
            0
        };
        if buffered + 8 * self.remaining() < count as usize {
            return None;
        }
        if lsb_first != self.lsb_first {
            self.lsb_first = lsb_first;
            self.bits = 0;
            self.bit_count = 0;
        }
        if count == 0 {
            return Some(0);
        }
        while self.bit_count < count {
            let byte = *self.data.get(self.pos)?;
            self.pos += 1;
            let byte = if self.lsb_first {
                byte.reverse_bits()
            } else {
                byte
            };
            self.bits |= u32::from(byte) << (24 - self.bit_count);
            self.bit_count += 8;
        }
        let value = (self.bits >> (32 - count)) as u16;
        self.bits <<= count;
        self.bit_count -= count;
        Some(value)
    }
}

/// 把 `count` 位的值按位翻转。
pub(crate) fn reverse_bits(value: u16, count: u32) -> u16 {
    if count == 0 {
        0
    } else {
        value.reverse_bits() >> (16 - count)
    }
}
