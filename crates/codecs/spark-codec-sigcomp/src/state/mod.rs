//! # 状态存储
//!
//! # 模块角色（Why）
//! - 按 20 字节摘要寻址的字节缓冲仓库，被所有压缩舱与 UDVM 共享；
//! - 相同内容只存一份，以引用计数 `used_by` 管理生命周期。
//!
//! # 核心机制（How）
//! - 状态结构放在定长 [`SlotArena`] 中，数据缓冲来自三级 [`tier`] 池；
//! - 哈希索引以摘要前 6 字节为键，每个前缀至多一个条目；
//! - 保存分两步：[`StateStore::create`] 先预留缓冲名额得到 [`StateDraft`]，[`StateStore::save`] 在
//!   锁内完成查重与插入。重复或冲突时草稿直接作废，索引中永远不会出现写了一半的条目。
//!
//! # 契约说明（What）
//! - 优先级 `65535` 为永久状态（字典、算法字节码），引用计数归零也不会释放；
//! - 内容比较通过 [`StateContent`] 抽象，默认逐字节比较，UDVM 提供感知循环缓冲的实现。
//!
//! # 设计权衡（Trade-offs）
//! - 单把管理器锁覆盖池分配与索引变更，临界区内只做拷贝与比较，不回调外部代码。

pub(crate) mod tier;

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{MAX_ALGORITHMS, MAX_DICTIONARIES, SigCompConfig};
use crate::digest::{INDEX_KEY_LEN, MIN_PARTIAL_ID_LEN, STATE_ID_LEN, StateId};
use crate::error::{Result, SigCompError};
use crate::pool::{ResourceUsage, SlotArena, SlotKey};

use self::tier::TierSet;

/// 永久状态的保留优先级。
pub const PERMANENT_PRIORITY: u16 = 65535;

/// 状态在存储中的句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StateKey(SlotKey);

/// 保存结果：新插入，或命中已有的同内容状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SaveOutcome {
    /// 新状态，引用计数为 1。
    Inserted(StateKey),
    /// 已有同摘要同内容的状态，其引用计数已加一。
    Duplicate(StateKey),
}

impl SaveOutcome {
    /// 无论是否重复，返回最终生效的状态句柄。
    pub fn key(self) -> StateKey {
        match self {
            Self::Inserted(key) | Self::Duplicate(key) => key,
        }
    }

    /// 是否命中重复。
    pub fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// 待保存状态的内容来源。
///
/// - **意图 (Why)**：UDVM 中的状态数据可能跨越循环缓冲边界，比较与拷贝都需要感知回绕；
/// - **契约 (What)**：`len` 固定；`matches` 与 `write_to` 必须对同一逻辑字节序列给出一致结果。
pub trait StateContent {
    /// 内容长度。
    fn len(&self) -> usize;

    /// 内容为空时返回 `true`。
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 与已存储的数据比较是否相同。
    fn matches(&self, stored: &[u8]) -> bool;

    /// 把内容写入长度恰为 `len()` 的目标切片。
    fn write_to(&self, dst: &mut [u8]);
}

impl StateContent for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn matches(&self, stored: &[u8]) -> bool {
        self == stored
    }

    fn write_to(&self, dst: &mut [u8]) {
        dst.copy_from_slice(self);
    }
}

/// 状态的元数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StateMeta {
    /// 完整摘要。
    pub id: StateId,
    /// 关联的字节码装载地址。
    pub address: u16,
    /// 关联的字节码入口。
    pub instruction: u16,
    /// 查找所需的最小部分标识长度。
    pub minimum_access_length: u16,
    /// 保留优先级。
    pub retention_priority: u16,
}

/// 状态的只读快照，数据以 `Bytes` 共享。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StateSnapshot {
    /// 完整摘要。
    pub id: StateId,
    /// 状态数据。
    pub data: Bytes,
    /// 关联的字节码装载地址。
    pub address: u16,
    /// 关联的字节码入口。
    pub instruction: u16,
    /// 查找所需的最小部分标识长度。
    pub minimum_access_length: u16,
    /// 保留优先级。
    pub retention_priority: u16,
}

#[derive(Debug)]
struct StateEntry {
    meta: StateMeta,
    data: Bytes,
    used_by: u32,
    tier: Option<usize>,
}

impl StateEntry {
    fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            id: self.meta.id,
            data: self.data.clone(),
            address: self.meta.address,
            instruction: self.meta.instruction,
            minimum_access_length: self.meta.minimum_access_length,
            retention_priority: self.meta.retention_priority,
        }
    }
}

#[derive(Debug)]
struct StoreInner {
    tiers: TierSet,
    states: SlotArena<StateEntry>,
    index: HashMap<[u8; INDEX_KEY_LEN], StateKey>,
    index_max_used: usize,
}

impl StoreInner {
    fn reclaim(&mut self, entry: StateEntry) {
        if let Some(tier) = entry.tier {
            let buffer = entry.data.try_into_mut().ok();
            self.tiers.release(tier, buffer);
        }
    }
}

/// 存储各池的资源使用快照。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreResources {
    /// 小、中、大三级缓冲。
    pub tiers: [ResourceUsage; 3],
    /// 状态结构。
    pub states: ResourceUsage,
    /// 哈希索引条目。
    pub index: ResourceUsage,
}

/// 按摘要寻址的状态存储，克隆后共享同一份数据。
#[derive(Clone, Debug)]
pub struct StateStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl StateStore {
    /// 按配置的三级缓冲布局创建存储。
    pub fn new(config: &SigCompConfig) -> Self {
        let layout = config.tiers();
        let capacity =
            layout.iter().map(|(_, amount)| amount).sum::<usize>() + MAX_DICTIONARIES + MAX_ALGORITHMS;
        Self {
            inner: Arc::new(Mutex::new(StoreInner {
                tiers: TierSet::new(layout),
                states: SlotArena::new("state-structs", capacity),
                index: HashMap::new(),
                index_max_used: 0,
            })),
        }
    }

    /// 为 `size` 字节的新状态预留缓冲。
    ///
    /// 超过最大级别返回 [`SigCompError::BadParam`]，所有可用级别已满返回 [`SigCompError::OutOfResources`]。
    pub fn create(&self, size: usize) -> Result<StateDraft> {
        let tier = self.inner.lock().tiers.reserve(size)?;
        Ok(StateDraft {
            store: self.clone(),
            tier: Some(tier),
            size,
        })
    }

    /// 保存草稿。
    ///
    /// - 摘要全零：[`SigCompError::BadParam`]；
    /// - 前缀命中且摘要与内容都相同：引用计数加一，返回 [`SaveOutcome::Duplicate`]，草稿作废；
    /// - 前缀命中但摘要或内容不同：[`SigCompError::Collision`]，草稿作废；
    /// - 未命中：写入数据并插入索引，引用计数为 1。
    pub fn save<C>(&self, mut draft: StateDraft, meta: StateMeta, content: &C) -> Result<SaveOutcome>
    where
        C: StateContent + ?Sized,
    {
        if meta.id.is_zero() {
            return Err(SigCompError::bad_param("zero state identifier"));
        }
        if content.len() != draft.size {
            return Err(SigCompError::bad_param("content length differs from reserved size"));
        }
        let mut inner = self.inner.lock();
        let tier = draft.tier.take();
        if let Some(outcome) = Self::probe(&mut inner, &meta, content) {
            if let Some(tier) = tier {
                inner.tiers.release(tier, None);
            }
            return outcome;
        }
        if inner.states.len() >= inner.states.capacity() {
            if let Some(tier) = tier {
                inner.tiers.release(tier, None);
            }
            return Err(SigCompError::out_of_resources("state-structs"));
        }
        let data = match tier {
            Some(tier) => {
                let mut buffer = inner.tiers.take(tier);
                buffer.resize(draft.size, 0);
                content.write_to(&mut buffer);
                buffer.freeze()
            }
            None => {
                let mut buffer = BytesMut::zeroed(draft.size);
                content.write_to(&mut buffer);
                buffer.freeze()
            }
        };
        Self::insert_locked(&mut inner, meta, data, tier).map(SaveOutcome::Inserted)
    }

    /// 保存不占用分级缓冲的永久状态（字典、算法字节码）。
    pub fn save_permanent(&self, meta: StateMeta, data: Bytes) -> Result<SaveOutcome> {
        if meta.id.is_zero() {
            return Err(SigCompError::bad_param("zero state identifier"));
        }
        let meta = StateMeta {
            retention_priority: PERMANENT_PRIORITY,
            ..meta
        };
        let mut inner = self.inner.lock();
        if let Some(outcome) = Self::probe(&mut inner, &meta, &data[..]) {
            return outcome;
        }
        Self::insert_locked(&mut inner, meta, data, None).map(SaveOutcome::Inserted)
    }

    fn probe<C>(
        inner: &mut StoreInner,
        meta: &StateMeta,
        content: &C,
    ) -> Option<Result<SaveOutcome>>
    where
        C: StateContent + ?Sized,
    {
        let key = *inner.index.get(&meta.id.index_key())?;
        let Some(entry) = inner.states.get_mut(key.0) else {
            return Some(Err(SigCompError::Collision));
        };
        if entry.meta.id == meta.id && content.matches(&entry.data) {
            entry.used_by += 1;
            debug!(id = %meta.id, used_by = entry.used_by, "duplicate state");
            Some(Ok(SaveOutcome::Duplicate(key)))
        } else {
            Some(Err(SigCompError::Collision))
        }
    }

    fn insert_locked(
        inner: &mut StoreInner,
        meta: StateMeta,
        data: Bytes,
        tier: Option<usize>,
    ) -> Result<StateKey> {
        let length = data.len();
        let entry = StateEntry {
            meta,
            data,
            used_by: 1,
            tier,
        };
        let key = match inner.states.insert(entry) {
            Ok(slot) => StateKey(slot),
            Err(err) => {
                if let Some(tier) = tier {
                    inner.tiers.release(tier, None);
                }
                return Err(err);
            }
        };
        inner.index.insert(meta.id.index_key(), key);
        inner.index_max_used = inner.index_max_used.max(inner.index.len());
        debug!(id = %meta.id, length, priority = meta.retention_priority, "state saved");
        Ok(key)
    }

    /// 释放一次引用。
    ///
    /// 计数归零且非永久状态时，移出索引（`hashed` 为真时）并归还缓冲与结构。
    pub fn delete(&self, key: StateKey, hashed: bool) {
        let mut inner = self.inner.lock();
        let Some(entry) = inner.states.get_mut(key.0) else {
            return;
        };
        entry.used_by = entry.used_by.saturating_sub(1);
        if entry.used_by > 0 || entry.meta.retention_priority == PERMANENT_PRIORITY {
            return;
        }
        let index_key = entry.meta.id.index_key();
        if hashed && inner.index.get(&index_key) == Some(&key) {
            inner.index.remove(&index_key);
        }
        if let Some(entry) = inner.states.remove(key.0) {
            debug!(id = %entry.meta.id, "state freed");
            inner.reclaim(entry);
        }
    }

    /// 按部分标识查找状态句柄。
    ///
    /// `partial` 长度必须在 6..=20；除非 `ignore_min_access`，长度还必须不小于状态的最小访问长度。
    pub fn get(&self, partial: &[u8], ignore_min_access: bool) -> Result<StateKey> {
        let inner = self.inner.lock();
        Self::find_locked(&inner, partial, ignore_min_access).map(|(key, _)| key)
    }

    /// 按部分标识查找并返回快照。
    pub fn lookup(&self, partial: &[u8], ignore_min_access: bool) -> Result<StateSnapshot> {
        let inner = self.inner.lock();
        Self::find_locked(&inner, partial, ignore_min_access).map(|(_, entry)| entry.snapshot())
    }

    fn find_locked<'a>(
        inner: &'a StoreInner,
        partial: &[u8],
        ignore_min_access: bool,
    ) -> Result<(StateKey, &'a StateEntry)> {
        if !(MIN_PARTIAL_ID_LEN..=STATE_ID_LEN).contains(&partial.len()) {
            return Err(SigCompError::bad_param("partial state id length outside 6..=20"));
        }
        let mut index_key = [0u8; INDEX_KEY_LEN];
        index_key.copy_from_slice(&partial[..INDEX_KEY_LEN]);
        let key = *inner.index.get(&index_key).ok_or(SigCompError::NotFound)?;
        let entry = inner.states.get(key.0).ok_or(SigCompError::NotFound)?;
        let prefix_matches = entry.meta.id.as_bytes()[..partial.len()] == *partial;
        let long_enough = partial.len() >= usize::from(entry.meta.minimum_access_length);
        if prefix_matches && (long_enough || ignore_min_access) {
            Ok((key, entry))
        } else {
            Err(SigCompError::NotFound)
        }
    }

    /// 按句柄读取快照。
    pub fn snapshot(&self, key: StateKey) -> Option<StateSnapshot> {
        self.inner.lock().states.get(key.0).map(StateEntry::snapshot)
    }

    /// 当前引用计数，句柄失效时为 `None`。
    pub fn used_by(&self, key: StateKey) -> Option<u32> {
        self.inner.lock().states.get(key.0).map(|entry| entry.used_by)
    }

    /// 从分级池租借清零的算法上下文缓冲。
    pub fn alloc_context(&self, size: usize) -> Result<ContextBuffer> {
        let mut inner = self.inner.lock();
        let tier = inner.tiers.reserve(size)?;
        let mut buffer = inner.tiers.take(tier);
        buffer.resize(size, 0);
        Ok(ContextBuffer {
            store: self.clone(),
            tier,
            buffer: Some(buffer),
        })
    }

    /// 资源使用快照。
    pub fn resources(&self) -> StoreResources {
        let inner = self.inner.lock();
        StoreResources {
            tiers: inner.tiers.usage(),
            states: inner.states.usage(),
            index: ResourceUsage {
                allocated: inner.states.capacity(),
                in_use: inner.index.len(),
                max_used: inner.index_max_used,
            },
        }
    }
}

/// 尚未保存的状态：持有一个缓冲名额，作废时自动归还。
#[derive(Debug)]
pub struct StateDraft {
    store: StateStore,
    tier: Option<usize>,
    size: usize,
}

impl StateDraft {
    /// 预留的字节数。
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for StateDraft {
    fn drop(&mut self) {
        if let Some(tier) = self.tier.take() {
            self.store.inner.lock().tiers.release(tier, None);
        }
    }
}

/// 算法上下文缓冲，释放时归还所属级别。
#[derive(Debug)]
pub struct ContextBuffer {
    store: StateStore,
    tier: usize,
    buffer: Option<BytesMut>,
}

impl ContextBuffer {
    /// 只读视图。
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_deref().unwrap_or_default()
    }

    /// 可写视图。
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for ContextBuffer {
    fn drop(&mut self) {
        let buffer = self.buffer.take();
        self.store.inner.lock().tiers.release(self.tier, buffer);
    }
}
