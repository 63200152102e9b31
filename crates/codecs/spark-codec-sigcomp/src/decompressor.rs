//! # 解压调度器
//!
//! # 模块角色（Why）
//! - 解压时还不知道报文属于哪个压缩舱（需要上层完成认证），因此 UDVM 的状态请求只能先挂起；
//! - 调度器负责“解析报头 → 构造 UDVM → 执行 → 必要时挂起”，并回收过期未声明的挂起实例。
//!
//! # 核心机制（How）
//! - 挂起实例放在定长槽位池中，[`UdvmId`] 低 10 位是槽位下标，高位是单调计数，标识永不为 0；
//! - 过期队列按挂起顺序排列，每次解压前从队首回收超时实例；
//! - 初始周期预算为 `(8 × 报头字节数 + 1000) × cpb`，输入指令按消费比特追加。
//!
//! # 契约说明（What）
//! - 无状态请求也无回显反馈的报文直接返回 `UdvmId(0)`，不占用槽位；
//! - 面向报文的传输要求解压内存大于报文长度，UDVM 内存为二者之差，上限 65536；
//! - 面向流的传输使用一半的解压内存。

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::{MAX_UDVM_MEMORY, SigCompConfig};
use crate::error::{Result, SigCompError};
use crate::framing::{self, HeaderBody};
use crate::pool::{ResourceUsage, SlotArena, SlotKey};
use crate::state::StateStore;
use crate::udvm::{Completion, Udvm, UdvmSetup};

/// 挂起 UDVM 标识中槽位下标所占的位。
const SLOT_BITS: u32 = 10;
const SLOT_MASK: u32 = (1 << SLOT_BITS) - 1;

/// 报文经由的传输方式。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Transport {
    /// 面向报文，例如 UDP。
    #[default]
    Message,
    /// 面向流，例如 TCP。
    Stream,
}

/// 挂起 UDVM 的标识，0 表示无需声明。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct UdvmId(u32);

impl UdvmId {
    /// 无需声明的空标识。
    pub const NONE: Self = Self(0);

    /// 以原始值构造。
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// 原始值。
    pub const fn get(self) -> u32 {
        self.0
    }

    /// 是否为空标识。
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    fn slot(self) -> usize {
        (self.0 & SLOT_MASK) as usize
    }
}

impl fmt::Display for UdvmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// 解压结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecompressedMessage {
    /// 明文。
    pub data: Bytes,
    /// 非零时需要调用方声明压缩舱。
    pub udvm_id: UdvmId,
}

/// 等待压缩舱声明的 UDVM。
#[derive(Debug)]
pub(crate) struct PendingMachine {
    pub(crate) id: UdvmId,
    pub(crate) udvm: Udvm,
    pub(crate) returned_feedback: Option<Bytes>,
}

#[derive(Debug)]
struct PendingSet {
    slots: SlotArena<PendingMachine>,
    expiry: VecDeque<(SlotKey, Instant)>,
    counter: u32,
}

impl PendingSet {
    fn next_id(&mut self, slot: usize) -> UdvmId {
        loop {
            self.counter = self.counter.wrapping_add(1);
            let raw = (self.counter << SLOT_BITS) | (slot as u32 & SLOT_MASK);
            if raw != 0 {
                return UdvmId(raw);
            }
        }
    }

    fn reap(&mut self, now: Instant) {
        while let Some(&(key, expires_at)) = self.expiry.front() {
            if expires_at > now {
                break;
            }
            self.expiry.pop_front();
            if let Some(machine) = self.slots.remove(key) {
                warn!(udvm_id = %machine.id, "pending udvm expired before compartment declaration");
            }
        }
    }
}

/// 解压调度器。
#[derive(Debug)]
pub(crate) struct DecompressionDispatcher {
    pending: Mutex<PendingSet>,
    timeout: Duration,
    decompression_memory_size: usize,
    cycles_per_bit: u16,
}

impl DecompressionDispatcher {
    pub(crate) fn new(config: &SigCompConfig) -> Self {
        Self {
            pending: Mutex::new(PendingSet {
                slots: SlotArena::new("udvm-slots", config.max_pending_machines()),
                expiry: VecDeque::new(),
                counter: 0,
            }),
            timeout: config.pending_timeout(),
            decompression_memory_size: config.decompression_memory_size,
            cycles_per_bit: config.cycles_per_bit,
        }
    }

    fn usable_memory(&self, message_len: usize, transport: Transport) -> Result<usize> {
        let dms = self.decompression_memory_size;
        let size = match transport {
            Transport::Stream => dms / 2,
            Transport::Message => {
                if dms <= message_len {
                    return Err(SigCompError::InsufficientBuffer);
                }
                dms - message_len
            }
        };
        Ok(size.min(MAX_UDVM_MEMORY))
    }

    /// 解压一条完整报文（面向流的传输需先去除转义）。
    pub(crate) fn decompress(
        &self,
        message: Bytes,
        transport: Transport,
        store: &StateStore,
        now: Instant,
    ) -> Result<DecompressedMessage> {
        {
            let mut pending = self.pending.lock();
            pending.reap(now);
            if pending.slots.len() >= pending.slots.capacity() {
                return Err(SigCompError::out_of_resources("udvm-slots"));
            }
        }
        let parsed = framing::parse(&message)?;
        let memory_size = self.usable_memory(message.len(), transport)?;
        let setup = UdvmSetup {
            memory_size,
            cycles_per_bit: self.cycles_per_bit,
            output_capacity: memory_size,
            input: parsed.input,
        };
        let mut udvm = match &parsed.body {
            HeaderBody::Bytecode { code, destination } => Udvm::from_code(setup, code, *destination)?,
            HeaderBody::StateId(partial) => Udvm::from_state(setup, partial, store)?,
        };
        let cycles = (8 * parsed.header_len as u64 + 1000) * u64::from(self.cycles_per_bit);
        let completion = udvm.run(cycles, store)?;
        let data = udvm.take_output();
        debug!(
            input = message.len(),
            output = data.len(),
            cycles = udvm.total_cycles(),
            instructions = udvm.instructions(),
            "message decompressed"
        );
        if completion == Completion::Finished && parsed.returned_feedback.is_none() {
            return Ok(DecompressedMessage {
                data,
                udvm_id: UdvmId::NONE,
            });
        }
        let udvm_id = self.suspend(udvm, parsed.returned_feedback, now)?;
        Ok(DecompressedMessage { data, udvm_id })
    }

    fn suspend(&self, udvm: Udvm, returned_feedback: Option<Bytes>, now: Instant) -> Result<UdvmId> {
        let expires_at = now + self.timeout;
        let mut pending = self.pending.lock();
        let placeholder = PendingMachine {
            id: UdvmId::NONE,
            udvm,
            returned_feedback,
        };
        let key = pending.slots.insert(placeholder)?;
        let id = pending.next_id(key.index());
        if let Some(machine) = pending.slots.get_mut(key) {
            machine.id = id;
        }
        pending.expiry.push_back((key, expires_at));
        debug!(udvm_id = %id, "udvm suspended awaiting compartment");
        Ok(id)
    }

    /// 取走挂起的 UDVM；`UdvmId(0)` 返回 `None`，已过期的实例视为不存在。
    pub(crate) fn take(&self, id: UdvmId, now: Instant) -> Result<Option<PendingMachine>> {
        if id.is_none() {
            return Ok(None);
        }
        let mut pending = self.pending.lock();
        pending.reap(now);
        if id.slot() >= pending.slots.capacity() {
            return Err(SigCompError::bad_param("udvm id outside slot range"));
        }
        let key = match pending.slots.get_by_index(id.slot()) {
            Some((key, machine)) if machine.id == id => key,
            _ => return Err(SigCompError::NotFound),
        };
        pending.expiry.retain(|(queued, _)| *queued != key);
        Ok(pending.slots.remove(key))
    }

    pub(crate) fn usage(&self) -> ResourceUsage {
        self.pending.lock().slots.usage()
    }
}
