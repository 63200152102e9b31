//! # 三级缓冲池
//!
//! # 模块角色（Why）
//! - 状态数据与算法上下文都从小、中、大三级定长缓冲中租借，总内存在构造时即可估算；
//! - 释放的缓冲回到所属级别的空闲链表，热路径上避免反复向分配器申请。
//!
//! # 核心机制（How）
//! - “预留”与“取缓冲”分离：`reserve` 只占用名额，真正写入数据时才 `take`；
//! - 归还时 `BytesMut` 被清空后压回空闲链表，容量不足的缓冲直接丢弃。
//!
//! # 设计权衡（Trade-offs）
//! - 大小选择为“第一个放得下且仍有名额的级别”，小级别满时允许借用更大的级别，换取更少的失败。

use bytes::BytesMut;

use crate::error::{Result, SigCompError};
use crate::pool::ResourceUsage;

#[derive(Debug)]
struct Tier {
    size: usize,
    capacity: usize,
    in_use: usize,
    max_used: usize,
    free: Vec<BytesMut>,
}

/// 三级缓冲集合，放在状态存储的管理器锁之下。
#[derive(Debug)]
pub(crate) struct TierSet {
    tiers: Vec<Tier>,
}

impl TierSet {
    pub(crate) fn new(layout: [(usize, usize); 3]) -> Self {
        Self {
            tiers: layout
                .iter()
                .map(|&(size, capacity)| Tier {
                    size,
                    capacity,
                    in_use: 0,
                    max_used: 0,
                    free: Vec::new(),
                })
                .collect(),
        }
    }

    /// 为 `size` 字节预留一个名额，返回级别下标。
    pub(crate) fn reserve(&mut self, size: usize) -> Result<usize> {
        let largest = self.tiers.last().map_or(0, |tier| tier.size);
        if size > largest {
            return Err(SigCompError::bad_param("state larger than largest buffer tier"));
        }
        let (index, tier) = self
            .tiers
            .iter_mut()
            .enumerate()
            .find(|(_, tier)| tier.size >= size && tier.in_use < tier.capacity)
            .ok_or(SigCompError::out_of_resources("state-buffers"))?;
        tier.in_use += 1;
        tier.max_used = tier.max_used.max(tier.in_use);
        Ok(index)
    }

    /// 取出已预留级别的一块空缓冲。
    pub(crate) fn take(&mut self, index: usize) -> BytesMut {
        let tier = &mut self.tiers[index];
        tier.free
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(tier.size))
    }

    /// 归还名额，可选地连同缓冲一起归还。
    pub(crate) fn release(&mut self, index: usize, buffer: Option<BytesMut>) {
        let tier = &mut self.tiers[index];
        tier.in_use = tier.in_use.saturating_sub(1);
        if let Some(mut buffer) = buffer {
            if buffer.capacity() >= tier.size {
                buffer.clear();
                tier.free.push(buffer);
            }
        }
    }

    pub(crate) fn usage(&self) -> [ResourceUsage; 3] {
        let mut out = [ResourceUsage::default(); 3];
        for (slot, tier) in out.iter_mut().zip(&self.tiers) {
            *slot = ResourceUsage {
                allocated: tier.capacity,
                in_use: tier.in_use,
                max_used: tier.max_used,
            };
        }
        out
    }
}
