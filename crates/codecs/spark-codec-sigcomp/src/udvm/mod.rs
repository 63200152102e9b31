//! # UDVM 字节码解释器
//!
//! # 模块角色（Why）
//! - 每条 SigComp 报文携带（或引用）自己的解压字节码，UDVM 在一块私有、有界的内存上执行它；
//! - 解释器不接触压缩舱与状态存储的写路径：状态创建、释放与反馈都登记为延迟请求，
//!   等调用方确认压缩舱后由 [`Udvm::finalize`] 统一提交。
//!
//! # 核心机制（How）
//! - 内存访问全部经过 `memory` 子模块的检查型视图；
//! - 块操作全部走 `cyclic` 子模块的循环缓冲遍历；
//! - 周期预算：每条指令 1 个周期加上指令相关的额外开销，输入指令按消费的比特追加预算。
//!
//! # 契约说明（What）
//! - [`Udvm::run`] 只有两种成功结果：[`Completion::Finished`] 与 [`Completion::Waiting`]；
//!   预算耗尽时即使已执行 END-MESSAGE 也按 [`FailureReason::CyclesExceeded`] 失败；
//! - 任何失败都会立即终止执行并生成 [`Postmortem`]。
//!
//! # 设计权衡（Trade-offs）
//! - 一台 UDVM 只被一个线程持有，内部不加锁。

mod cyclic;
mod exec;
mod finalize;
mod input;
mod memory;
mod opcode;
mod operand;
mod request;

pub use cyclic::CyclicRegion;
pub use finalize::{FinalizeTarget, REMOTE_STATE_IDS_CAPACITY, SaveAdmission};
pub use request::{FreeRequest, SaveRequest};

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::error::{FailureReason, Postmortem, SigCompError};
use crate::state::StateStore;

use self::input::InputStream;
use self::memory::UdvmMemory;
use self::request::DeferredRequests;

/// 解释器内部的单步结果。
pub(crate) type Step<T> = Result<T, FailureReason>;

/// 写入内存头部的 SigComp 版本号。
pub const SIGCOMP_VERSION: u16 = 1;

/// 构造 UDVM 所需的运行参数。
#[derive(Clone, Debug)]
pub struct UdvmSetup {
    /// 可用内存大小，不超过 65536。
    pub memory_size: usize,
    /// 每比特周期数。
    pub cycles_per_bit: u16,
    /// 输出缓冲容量。
    pub output_capacity: usize,
    /// 报文中的输入区。
    pub input: Bytes,
}

/// 成功结束时的两种结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// 执行了 END-MESSAGE，无需压缩舱参与。
    Finished,
    /// 执行了 END-MESSAGE，且有待提交的状态请求或反馈。
    Waiting,
}

/// 一次解压尝试对应的虚拟机实例。
#[derive(Debug)]
pub struct Udvm {
    memory: UdvmMemory,
    pc: u16,
    input: InputStream,
    output: BytesMut,
    output_capacity: usize,
    cycles_per_bit: u64,
    total_cycles: u64,
    target_cycles: u64,
    instructions: u64,
    completion: Option<Completion>,
    requests: DeferredRequests,
    requested_feedback_location: u16,
    returned_parameters_location: u16,
}

impl Udvm {
    fn with_setup(setup: UdvmSetup) -> Self {
        Self {
            memory: UdvmMemory::new(setup.memory_size.min(crate::config::MAX_UDVM_MEMORY)),
            pc: 0,
            input: InputStream::new(setup.input),
            output: BytesMut::with_capacity(setup.output_capacity),
            output_capacity: setup.output_capacity,
            cycles_per_bit: u64::from(setup.cycles_per_bit),
            total_cycles: 0,
            target_cycles: 0,
            instructions: 0,
            completion: None,
            requests: DeferredRequests::default(),
            requested_feedback_location: 0,
            returned_parameters_location: 0,
        }
    }

    /// 以报文上传的字节码初始化：字节码装载到 `destination`，从该地址开始执行。
    pub fn from_code(
        setup: UdvmSetup,
        code: &[u8],
        destination: u16,
    ) -> Result<Self, SigCompError> {
        let mut udvm = Self::with_setup(setup);
        let cycles_per_bit = udvm.cycles_per_bit as u16;
        udvm.load(cycles_per_bit, 0, code, destination)
            .map_err(SigCompError::decompression)?;
        udvm.pc = destination;
        debug!(length = code.len(), destination, "udvm loaded from bytecode");
        Ok(udvm)
    }

    /// 以已保存的状态初始化：状态数据装载到其关联地址，从其关联指令开始执行。
    pub fn from_state(
        setup: UdvmSetup,
        partial_id: &[u8],
        store: &StateStore,
    ) -> Result<Self, SigCompError> {
        let state = store
            .lookup(partial_id, false)
            .map_err(|_| SigCompError::decompression(FailureReason::StateAccess))?;
        let mut udvm = Self::with_setup(setup);
        let cycles_per_bit = udvm.cycles_per_bit as u16;
        udvm.load(
            cycles_per_bit,
            partial_id.len() as u16,
            &state.data,
            state.address,
        )
        .map_err(SigCompError::decompression)?;
        udvm.pc = state.instruction;
        debug!(id = %state.id, length = state.data.len(), "udvm loaded from state");
        Ok(udvm)
    }

    fn load(
        &mut self,
        cycles_per_bit: u16,
        partial_id_length: u16,
        data: &[u8],
        destination: u16,
    ) -> Step<()> {
        let state_length = if partial_id_length == 0 {
            0
        } else {
            data.len() as u16
        };
        self.memory
            .write_header(cycles_per_bit, SIGCOMP_VERSION, partial_id_length, state_length)?;
        self.memory
            .slice_mut(usize::from(destination), data.len())?
            .copy_from_slice(data);
        Ok(())
    }

    /// 在 `cycles` 的预算内执行，直到 END-MESSAGE、失败或预算耗尽。
    pub fn run(&mut self, cycles: u64, store: &StateStore) -> Result<Completion, Postmortem> {
        self.target_cycles = self.total_cycles + cycles;
        while self.total_cycles < self.target_cycles && self.completion.is_none() {
            if let Err(reason) = self.step(store) {
                debug!(%reason, pc = self.pc, "udvm failed");
                return Err(self.postmortem(reason));
            }
            self.total_cycles += 1;
            self.instructions += 1;
        }
        match self.completion {
            Some(completion) if self.total_cycles <= self.target_cycles => Ok(completion),
            _ => {
                warn!(
                    pc = self.pc,
                    total_cycles = self.total_cycles,
                    target_cycles = self.target_cycles,
                    "udvm cycles exhausted"
                );
                Err(self.postmortem(FailureReason::CyclesExceeded))
            }
        }
    }

    fn postmortem(&self, reason: FailureReason) -> Postmortem {
        Postmortem {
            reason,
            program_counter: self.pc,
            total_cycles: self.total_cycles,
            total_instructions: self.instructions,
            last_opcode: self.memory.read_u8(usize::from(self.pc)).unwrap_or(0xff),
        }
    }

    /// 目前为止写出的解压数据。
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    /// 取走解压数据。
    pub fn take_output(&mut self) -> Bytes {
        self.output.split().freeze()
    }

    /// 执行结果，尚未结束时为 `None`。
    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    /// 已消耗的周期数。
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }

    /// 已执行的指令数。
    pub fn instructions(&self) -> u64 {
        self.instructions
    }
}

#[cfg(test)]
mod tests;
