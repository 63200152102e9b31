//! # 压缩舱
//!
//! # 模块角色（Why）
//! - 压缩舱是“一个对端”在本端的全部记忆：该对端创建的状态、双方的能力参数、反馈与算法上下文；
//! - 状态内存按压缩舱计费，单个对端无法挤占其它对端的预算。
//!
//! # 核心机制（How）
//! - 每个状态计费 `长度 + 64` 字节；预算不足或成员数达到上限时，按“优先级、创建顺序”淘汰最旧的低优先级状态；
//! - 管理器用定长槽位池托管 `Arc<Mutex<Compartment>>`：查找时短暂持有管理器锁克隆 `Arc`，
//!   释放后再锁压缩舱本身，慢操作不会阻塞其它压缩舱；
//! - 锁顺序固定为“压缩舱锁先于存储锁”，存储从不回调压缩舱。
//!
//! # 契约说明（What）
//! - 句柄带代际号，压缩舱关闭后旧句柄一律得到 [`SigCompError::Destructed`]；
//! - 压缩舱内的重复保存只更新保留优先级，不重复计费；
//! - 成员列表清空时创建计数器归零。

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::algorithm::RegisteredAlgorithm;
use crate::config::SigCompConfig;
use crate::digest::{MIN_PARTIAL_ID_LEN, STATE_ID_LEN, StateId};
use crate::error::{Result, SigCompError};
use crate::pool::{ResourceUsage, SlotArena, SlotKey};
use crate::state::{
    ContextBuffer, PERMANENT_PRIORITY, SaveOutcome, StateContent, StateKey, StateMeta, StateStore,
};
use crate::udvm::{
    CyclicRegion, FinalizeTarget, REMOTE_STATE_IDS_CAPACITY, SIGCOMP_VERSION, SaveAdmission,
};

/// 每个状态在预算中的固定开销。
const STATE_OVERHEAD: usize = 64;

/// 反馈项的最大长度。
const MAX_FEEDBACK_ITEM: usize = 127;

/// 压缩舱句柄。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CompartmentHandle(SlotKey);

impl CompartmentHandle {
    /// 槽位下标，仅用于日志与观测。
    pub fn index(self) -> usize {
        self.0.index()
    }
}

/// 一端的 SigComp 能力参数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Capabilities {
    /// 每比特周期数。
    pub cycles_per_bit: u16,
    /// 解压内存大小。
    pub decompression_memory_size: usize,
    /// 状态内存大小，0 表示无状态。
    pub state_memory_size: usize,
    /// SigComp 版本。
    pub version: u8,
}

impl Capabilities {
    /// 尚未收到对端参数时假定的取值。
    pub const PEER_DEFAULT: Self = Self {
        cycles_per_bit: 16,
        decompression_memory_size: 8192,
        state_memory_size: 0,
        version: 1,
    };

    /// 本端能力。
    pub fn local(config: &SigCompConfig) -> Self {
        Self {
            cycles_per_bit: config.cycles_per_bit,
            decompression_memory_size: config.decompression_memory_size,
            state_memory_size: config.state_memory_size,
            version: SIGCOMP_VERSION as u8,
        }
    }

    /// 解码 `cpb(2) | dms(3) | sms(3)` 打包字节。
    ///
    /// - `dms` 编码 0（即 1024 字节）不合法，按 2048 处理并告警；
    /// - `sms` 编码 0 表示无状态；
    /// - 版本 0 按 1 处理。
    pub fn decode(packed: u8, version: u8) -> Self {
        let cycles_per_bit = 16u16 << ((packed & 0xc0) >> 6);
        let mut decompression_memory_size = 1024usize << ((packed & 0x38) >> 3);
        if decompression_memory_size <= 1024 {
            warn!(packed, "peer announced invalid decompression memory size, assuming 2048");
            decompression_memory_size = 2048;
        }
        let state_memory_size = match 1024usize << (packed & 0x07) {
            1024 => 0,
            sms => sms,
        };
        Self {
            cycles_per_bit,
            decompression_memory_size,
            state_memory_size,
            version: version.max(1),
        }
    }

    /// 编码为打包字节，各字段向下取整到可表示的值。
    pub fn encode(&self) -> u8 {
        let cpb = (usize::from(self.cycles_per_bit.max(16)) / 16).ilog2().min(3) as u8;
        let dms = (self.decompression_memory_size.max(2048) / 1024).ilog2().min(7) as u8;
        let sms = if self.state_memory_size < 2048 {
            0
        } else {
            (self.state_memory_size / 1024).ilog2().min(7) as u8
        };
        (cpb << 6) | (dms << 3) | sms
    }
}

#[derive(Clone, Copy, Debug)]
struct Membership {
    key: StateKey,
    id: StateId,
    length: usize,
    priority: u16,
    counter: u32,
}

impl Membership {
    /// 淘汰键，越小越先淘汰；永久优先级视为最低。
    fn eviction_key(&self) -> u64 {
        let priority = if self.priority == PERMANENT_PRIORITY {
            0
        } else {
            u64::from(self.priority)
        };
        (priority << 32) | u64::from(self.counter)
    }
}

/// 一个对端的压缩舱。
pub(crate) struct Compartment {
    handle: Option<CompartmentHandle>,
    alive: bool,
    pub(crate) algorithm: Arc<RegisteredAlgorithm>,
    pub(crate) context: Option<ContextBuffer>,
    members: Vec<Membership>,
    counter: u32,
    state_memory_size: usize,
    available_state_memory: usize,
    max_states: usize,
    pub(crate) local: Capabilities,
    pub(crate) remote: Capabilities,
    pub(crate) remote_capabilities_changed: bool,
    pub(crate) keep_remote_states: bool,
    pub(crate) send_bytecode: bool,
    pub(crate) send_local_capabilities: bool,
    pub(crate) send_local_state_ids: bool,
    pub(crate) requested_feedback: Vec<u8>,
    pub(crate) returned_feedback: Vec<u8>,
    pub(crate) remote_state_ids: Vec<u8>,
    pub(crate) incoming_messages: u64,
    pub(crate) last_incoming_message: Option<Instant>,
}

impl std::fmt::Debug for Compartment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Compartment")
            .field("handle", &self.handle)
            .field("alive", &self.alive)
            .field("algorithm", &self.algorithm.descriptor.name)
            .field("states", &self.members.len())
            .field("available_state_memory", &self.available_state_memory)
            .finish_non_exhaustive()
    }
}

impl Compartment {
    fn new(
        algorithm: Arc<RegisteredAlgorithm>,
        context: Option<ContextBuffer>,
        local: Capabilities,
        max_states: usize,
    ) -> Self {
        Self {
            handle: None,
            alive: true,
            algorithm,
            context,
            members: Vec::new(),
            counter: 0,
            state_memory_size: local.state_memory_size,
            available_state_memory: local.state_memory_size,
            max_states,
            local,
            remote: Capabilities::PEER_DEFAULT,
            remote_capabilities_changed: false,
            keep_remote_states: true,
            send_bytecode: true,
            send_local_capabilities: true,
            send_local_state_ids: false,
            requested_feedback: Vec::new(),
            returned_feedback: Vec::new(),
            remote_state_ids: Vec::new(),
            incoming_messages: 0,
            last_incoming_message: None,
        }
    }

    /// 当前持有的状态数。
    pub(crate) fn state_count(&self) -> usize {
        self.members.len()
    }

    /// 剩余的状态内存预算。
    pub(crate) fn available_state_memory(&self) -> usize {
        self.available_state_memory
    }

    /// 持有的状态标识，按创建顺序排列。
    pub(crate) fn state_ids(&self) -> Vec<StateId> {
        self.members.iter().map(|member| member.id).collect()
    }

    /// 把状态纳入压缩舱，必要时先淘汰旧状态。
    pub(crate) fn add_state<C>(
        &mut self,
        store: &StateStore,
        meta: StateMeta,
        content: &C,
    ) -> Result<SaveOutcome>
    where
        C: StateContent + ?Sized,
    {
        let access = usize::from(meta.minimum_access_length);
        if !(MIN_PARTIAL_ID_LEN..=STATE_ID_LEN).contains(&access) {
            return Err(SigCompError::bad_param("minimum access length outside 6..=20"));
        }
        if let Some(member) = self.members.iter_mut().find(|member| member.id == meta.id) {
            let same = store
                .snapshot(member.key)
                .is_some_and(|stored| content.matches(&stored.data));
            if !same {
                return Err(SigCompError::Collision);
            }
            member.priority = meta.retention_priority;
            debug!(id = %meta.id, priority = meta.retention_priority, "state priority refreshed");
            return Ok(SaveOutcome::Duplicate(member.key));
        }
        let cost = content.len() + STATE_OVERHEAD;
        if cost > self.state_memory_size {
            return Err(SigCompError::bad_param("state exceeds compartment state memory"));
        }
        let draft = store.create(content.len())?;
        while self.available_state_memory < cost || self.members.len() >= self.max_states {
            self.evict_lowest(store)?;
        }
        let outcome = store.save(draft, meta, content)?;
        self.counter = self.counter.wrapping_add(1);
        self.members.push(Membership {
            key: outcome.key(),
            id: meta.id,
            length: content.len(),
            priority: meta.retention_priority,
            counter: self.counter,
        });
        self.available_state_memory -= cost;
        Ok(outcome)
    }

    fn evict_lowest(&mut self, store: &StateStore) -> Result<()> {
        let index = self
            .members
            .iter()
            .enumerate()
            .min_by_key(|(_, member)| member.eviction_key())
            .map(|(index, _)| index)
            .ok_or(SigCompError::out_of_resources("compartment-state-memory"))?;
        let evicted = self.remove_member(store, index);
        debug!(id = %evicted.id, priority = evicted.priority, "state evicted");
        Ok(())
    }

    fn remove_member(&mut self, store: &StateStore, index: usize) -> Membership {
        let member = self.members.remove(index);
        self.available_state_memory += member.length + STATE_OVERHEAD;
        store.delete(member.key, true);
        if self.members.is_empty() {
            self.counter = 0;
        }
        member
    }

    /// 按部分标识移除本压缩舱的成员状态。
    pub(crate) fn remove_state(&mut self, store: &StateStore, partial_id: &[u8]) -> Result<()> {
        let key = store.get(partial_id, true)?;
        let index = self
            .members
            .iter()
            .position(|member| member.key == key)
            .ok_or(SigCompError::NotFound)?;
        let removed = self.remove_member(store, index);
        debug!(id = %removed.id, "state freed by peer");
        Ok(())
    }

    /// 应用对端返回的能力参数。
    ///
    /// 打包字节为 0 时只更新版本号。
    pub(crate) fn update_peer_capabilities(&mut self, packed: u8, version: u8) {
        let mut next = self.remote;
        if packed != 0 {
            next = Capabilities::decode(packed, version);
        }
        next.version = version.max(1);
        if next != self.remote {
            debug!(?next, "peer capabilities changed");
            self.remote = next;
            self.remote_capabilities_changed = true;
        }
    }

    /// 保存对端请求的反馈；`item` 为 `None` 时清空。
    pub(crate) fn forward_requested_feedback(
        &mut self,
        keep_remote_states: bool,
        send_local_ids: bool,
        item: Option<&[u8]>,
    ) -> Result<()> {
        if item.is_some_and(|item| item.len() > MAX_FEEDBACK_ITEM) {
            return Err(SigCompError::bad_param("feedback item longer than 127 bytes"));
        }
        self.keep_remote_states = keep_remote_states;
        self.send_local_state_ids = send_local_ids;
        self.requested_feedback.clear();
        if let Some(item) = item {
            self.requested_feedback.extend_from_slice(item);
        }
        Ok(())
    }

    /// 保存对端在报头中回显的反馈。
    pub(crate) fn forward_returned_feedback(&mut self, item: &[u8]) -> Result<()> {
        if item.len() > MAX_FEEDBACK_ITEM {
            return Err(SigCompError::bad_param("feedback item longer than 127 bytes"));
        }
        self.returned_feedback.clear();
        self.returned_feedback.extend_from_slice(item);
        Ok(())
    }

    fn destruct(&mut self, store: &StateStore) {
        self.alive = false;
        for member in self.members.drain(..) {
            store.delete(member.key, true);
        }
        self.counter = 0;
        self.available_state_memory = self.state_memory_size;
        if let (Some(handle), Some(context)) = (self.handle, self.context.as_mut()) {
            self.algorithm
                .plugin
                .on_compartment_destructed(handle, context.as_mut_slice());
        }
        self.context = None;
    }
}

/// 解压完成后把 UDVM 的延迟请求提交到压缩舱。
pub(crate) struct CompartmentSession<'a> {
    pub(crate) compartment: &'a mut Compartment,
    pub(crate) store: &'a StateStore,
}

impl FinalizeTarget for CompartmentSession<'_> {
    fn local_state_memory_size(&self) -> usize {
        self.compartment.state_memory_size
    }

    fn update_peer_capabilities(&mut self, packed: u8, version: u8) -> usize {
        self.compartment.update_peer_capabilities(packed, version);
        REMOTE_STATE_IDS_CAPACITY
    }

    fn set_remote_state_ids(&mut self, ids: &[u8]) {
        self.compartment.remote_state_ids.clear();
        self.compartment.remote_state_ids.extend_from_slice(ids);
    }

    fn forward_requested_feedback(
        &mut self,
        keep_remote_states: bool,
        send_local_ids: bool,
        item: Option<&[u8]>,
    ) -> Result<()> {
        self.compartment
            .forward_requested_feedback(keep_remote_states, send_local_ids, item)
    }

    fn save_state(
        &mut self,
        admission: SaveAdmission,
        content: &CyclicRegion<'_>,
    ) -> Result<SaveOutcome> {
        let meta = StateMeta {
            id: admission.id,
            address: admission.address,
            instruction: admission.instruction,
            minimum_access_length: admission.minimum_access_length,
            retention_priority: admission.retention_priority,
        };
        self.compartment.add_state(self.store, meta, content)
    }

    fn remove_state(&mut self, partial_id: &[u8]) -> Result<()> {
        self.compartment.remove_state(self.store, partial_id)
    }
}

/// 压缩舱管理器。
#[derive(Debug)]
pub(crate) struct CompartmentManager {
    slots: Mutex<SlotArena<Arc<Mutex<Compartment>>>>,
    store: StateStore,
    local: Capabilities,
    max_states: usize,
}

impl CompartmentManager {
    pub(crate) fn new(config: &SigCompConfig, store: StateStore) -> Self {
        Self {
            slots: Mutex::new(SlotArena::new(
                "compartments",
                config.max_open_compartments,
            )),
            store,
            local: Capabilities::local(config),
            max_states: config.max_states_per_compartment,
        }
    }

    /// 以给定算法创建压缩舱。
    pub(crate) fn create(&self, algorithm: Arc<RegisteredAlgorithm>) -> Result<CompartmentHandle> {
        let context = match algorithm.descriptor.context_size {
            0 => None,
            size => Some(self.store.alloc_context(size)?),
        };
        let entity = Arc::new(Mutex::new(Compartment::new(
            algorithm,
            context,
            self.local,
            self.max_states,
        )));
        let key = self.slots.lock().insert(entity.clone())?;
        let handle = CompartmentHandle(key);
        let mut compartment = entity.lock();
        compartment.handle = Some(handle);
        let plugin = compartment.algorithm.plugin.clone();
        if let Some(context) = compartment.context.as_mut() {
            plugin.on_compartment_created(handle, context.as_mut_slice());
        }
        debug!(
            index = handle.index(),
            algorithm = %compartment.algorithm.descriptor.name,
            "compartment created"
        );
        Ok(handle)
    }

    fn entity(&self, handle: CompartmentHandle) -> Result<Arc<Mutex<Compartment>>> {
        self.slots
            .lock()
            .get(handle.0)
            .cloned()
            .ok_or(SigCompError::Destructed)
    }

    /// 锁定压缩舱并执行 `f`。
    pub(crate) fn with<R>(
        &self,
        handle: CompartmentHandle,
        f: impl FnOnce(&mut Compartment, &StateStore) -> R,
    ) -> Result<R> {
        let entity = self.entity(handle)?;
        let mut compartment = entity.lock();
        if !compartment.alive {
            return Err(SigCompError::Destructed);
        }
        Ok(f(&mut compartment, &self.store))
    }

    /// 关闭压缩舱：释放成员状态、通知算法并归还槽位。
    pub(crate) fn close(&self, handle: CompartmentHandle) -> Result<()> {
        let entity = self
            .slots
            .lock()
            .remove(handle.0)
            .ok_or(SigCompError::Destructed)?;
        let mut compartment = entity.lock();
        compartment.destruct(&self.store);
        debug!(index = handle.index(), "compartment closed");
        Ok(())
    }

    /// 关闭全部压缩舱。
    pub(crate) fn close_all(&self) {
        let entities = self.slots.lock().drain();
        for entity in entities {
            entity.lock().destruct(&self.store);
        }
    }

    pub(crate) fn usage(&self) -> ResourceUsage {
        self.slots.lock().usage()
    }
}
