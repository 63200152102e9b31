//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为 SigComp 引擎的全部公开操作提供单一错误域 [`SigCompError`]，调用方据此区分
//!   “对端报文有问题”“本地资源耗尽”“并发竞态”“真实的数据损坏”四类情况；
//! - UDVM 失败时附带 [`Postmortem`] 现场快照，便于离线复盘字节码行为。
//!
//! ## 设计要求（What）
//! - 所有错误类型实现 `thiserror::Error`，可直接 `?` 传播；
//! - “重复状态”不是错误，而是 [`crate::state::SaveOutcome::Duplicate`] 这一成功分支；
//! - [`SigCompError::Destructed`] 与 [`SigCompError::Collision`] 必须保持可区分：前者是预期竞态，后者意味着摘要冲突。
//!
//! ## 扩展建议（How）
//! - 新增失败原因时优先扩展 [`FailureReason`]，保持 [`SigCompError`] 的分支稳定。

use std::fmt;

use thiserror::Error;

/// 引擎范围内统一使用的 `Result` 别名。
pub type Result<T, E = SigCompError> = core::result::Result<T, E>;

/// SigComp 引擎错误域。
///
/// # 教案式说明
/// - **意图 (Why)**：把协议格式错误、资源耗尽、逻辑冲突三类问题收敛为稳定的枚举，调用方可按分支制定重试策略。
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可跨线程传递；
///   - 来自网络输入的失败一律落入 [`SigCompError::Decompression`]，不会污染共享状态；
///   - 资源类错误不做内部排队或退避，由调用方自行决定是否稍后重试。
/// - **设计权衡 (Trade-offs)**：上下文字段使用 `&'static str`，避免在热路径上分配字符串。
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SigCompError {
    /// 参数不合法。
    ///
    /// - **意图 (Why)**：在入口处拒绝越界的部分标识长度、全零摘要、超大状态等输入。
    /// - **契约 (What)**：`reason` 为稳定的英文短语，适合直接写入日志。
    #[error("bad parameter: {reason}")]
    BadParam {
        /// 触发拒绝的原因。
        reason: &'static str,
    },

    /// 定长池耗尽。
    ///
    /// - **意图 (Why)**：所有集合都有上限，网络输入不能让它们无界增长。
    /// - **契约 (What)**：`resource` 指明耗尽的池，例如 `"udvm-slots"`。
    /// - **风险 (Trade-offs)**：频繁出现说明配置偏小或存在泄漏，需要结合 [`crate::engine::EngineResources`] 排查。
    #[error("out of resources: {resource}")]
    OutOfResources {
        /// 耗尽的资源名称。
        resource: &'static str,
    },

    /// 查找未命中：状态标识、挂起 UDVM 标识或算法名称不存在。
    #[error("not found")]
    NotFound,

    /// 摘要相同但内容不同。
    ///
    /// - **意图 (Why)**：状态按内容寻址，冲突意味着数据损坏或恶意构造，绝不能静默覆盖。
    #[error("state digest collision with different content")]
    Collision,

    /// 句柄指向的实体已被并发释放。
    ///
    /// - **意图 (Why)**：代际校验把“释放后使用”转化为可预期的错误。
    /// - **契约 (What)**：属于正常竞态，调用方丢弃句柄即可。
    #[error("entity has been destructed")]
    Destructed,

    /// 缓冲区不足，例如报文大于可用的解压内存。
    #[error("insufficient buffer")]
    InsufficientBuffer,

    /// 解压失败。
    ///
    /// - **契约 (What)**：`reason` 为失败原因码；若 UDVM 已开始执行，`postmortem` 记录失败现场。
    #[error("decompression failed: {reason}")]
    Decompression {
        /// 失败原因码。
        reason: FailureReason,
        /// UDVM 执行现场，报头解析阶段失败时为 `None`。
        postmortem: Option<Postmortem>,
    },

    /// 压缩算法插件返回的错误。
    #[error("compression algorithm `{name}` failed: {message}")]
    Algorithm {
        /// 算法名称。
        name: String,
        /// 插件给出的描述。
        message: String,
    },
}

impl SigCompError {
    /// 构造 [`SigCompError::BadParam`]。
    pub fn bad_param(reason: &'static str) -> Self {
        Self::BadParam { reason }
    }

    /// 构造 [`SigCompError::OutOfResources`]。
    pub fn out_of_resources(resource: &'static str) -> Self {
        Self::OutOfResources { resource }
    }

    /// 构造不携带现场的解压失败。
    pub fn decompression(reason: FailureReason) -> Self {
        Self::Decompression {
            reason,
            postmortem: None,
        }
    }

    /// 若为解压失败，返回其原因码。
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            Self::Decompression { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}

impl From<Postmortem> for SigCompError {
    fn from(postmortem: Postmortem) -> Self {
        Self::Decompression {
            reason: postmortem.reason,
            postmortem: Some(postmortem),
        }
    }
}

/// 解压失败原因码。
///
/// 取值与 RFC 3320 附录中的失败分类一一对应，`Display` 输出大写蛇形名称，便于与对端日志对照。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureReason {
    /// 字节码主动执行 DECOMPRESSION-FAILURE，或无法归类的失败。
    Unknown,
    /// 内存访问越界。
    MemoryAccess,
    /// 输入流格式异常。
    Input,
    /// 运行所需资源不足。
    Resources,
    /// 除零。
    ZeroDivision,
    /// 周期预算耗尽。
    CyclesExceeded,
    /// 操作数不合法。
    IllegalOperand,
    /// 未定义的操作码。
    IllegalInstruction,
    /// 空栈弹出。
    StackUnderflow,
    /// Huffman 分组全部不匹配。
    HuffmanMatch,
    /// Huffman 累计位数超过 16。
    HuffmanBits,
    /// 状态请求不合法或超出数量上限。
    State,
    /// 状态访问未命中。
    StateAccess,
    /// 报文格式错误。
    MessageFormat,
}

impl FailureReason {
    /// 稳定的大写名称。
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::MemoryAccess => "MEMORY_ACCESS",
            Self::Input => "INPUT",
            Self::Resources => "RESOURCES",
            Self::ZeroDivision => "ZERO_DIVISION",
            Self::CyclesExceeded => "CYCLES_EXCEEDED",
            Self::IllegalOperand => "ILLEGAL_OPERAND",
            Self::IllegalInstruction => "ILLEGAL_INSTRUCTION",
            Self::StackUnderflow => "STACK_UNDERFLOW",
            Self::HuffmanMatch => "HUFFMAN_MATCH",
            Self::HuffmanBits => "HUFFMAN_BITS",
            Self::State => "STATE",
            Self::StateAccess => "STATE_ACCESS",
            Self::MessageFormat => "MESSAGE_FORMAT",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UDVM 失败现场。
///
/// # 契约说明（What）
/// - `program_counter` 为失败指令的地址；
/// - `last_opcode` 为该地址上的字节，地址越界时为 `0xFF`；
/// - 计数均为失败发生时的累计值。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Postmortem {
    /// 失败原因码。
    pub reason: FailureReason,
    /// 失败指令地址。
    pub program_counter: u16,
    /// 已消耗的周期数。
    pub total_cycles: u64,
    /// 已执行的指令数。
    pub total_instructions: u64,
    /// 失败指令的操作码。
    pub last_opcode: u8,
}

impl fmt::Display for Postmortem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at pc={} opcode={} cycles={} instructions={}",
            self.reason,
            self.program_counter,
            self.last_opcode,
            self.total_cycles,
            self.total_instructions
        )
    }
}
