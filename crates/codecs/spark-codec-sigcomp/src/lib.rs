#![warn(missing_docs)]

//! # spark-codec-sigcomp
//!
//! ## 教案目的（Why）
//! - **定位**：实现 SigComp（RFC 3320）信令压缩的解压/压缩核心，为 SIP 信令在窄带链路上的传输提供压缩能力。
//! - **架构角色**：位于 SIP 编解码与传输之间；对上交付解压后的明文消息，对下消费带 `0xF8` 前缀的 SigComp 报文。
//! - **设计策略**：解压端完全由报文携带的 UDVM 字节码驱动，本 crate 只负责“安全地执行”与“托管状态”，
//!   压缩算法以插件形式注入。
//!
//! ## 交互契约（What）
//! - [`SigCompEngine`] 是唯一的显式上下文：构造时注入 [`SigCompConfig`] 与可选 [`Clock`]，之后所有操作都经由它完成；
//! - 解压流程：[`SigCompEngine::decompress_message`] 返回明文与 [`UdvmId`]，若 `UdvmId` 非零，
//!   调用方需在超时前通过 [`SigCompEngine::declare_compartment`] 告知该报文所属的压缩舱；
//! - 压缩流程：[`SigCompEngine::compress_message`] 把压缩舱与管理器的参数打包为 [`CompressionInfo`]，
//!   交给注册的 [`CompressionAlgorithm`]。
//!
//! ## 实现策略（How）
//! - `udvm`：字节码解释器，所有内存访问都经过单一的边界检查视图，所有块拷贝都走循环缓冲遍历；
//! - `state`：按摘要寻址、三级缓冲池托管的状态存储；
//! - `compartment`：每个对端一个压缩舱，维护状态预算、能力协商与反馈；
//! - `decompressor`/`compressor`：两个调度器，分别串起解压与压缩的完整链路。
//!
//! ## 风险提示（Trade-offs）
//! - 所有锁均为 `parking_lot::Mutex`，调用是同步阻塞的；UDVM 的执行时长只受周期预算约束。
//! - 资源上限全部来自 [`SigCompConfig`]，网络输入无法让任何集合无界增长。

/// 压缩算法插件契约与注册表。
pub mod algorithm;
/// 压缩舱：每个对端的状态预算、能力与反馈。
pub mod compartment;
/// 压缩调度器。
pub mod compressor;
/// 引擎配置（支持 TOML 加载）。
pub mod config;
/// FCS16 校验（供 CRC 指令使用）。
pub mod crc;
/// 解压调度器与挂起的 UDVM 管理。
pub mod decompressor;
/// SHA-1 摘要与状态标识。
pub mod digest;
/// 对外门面 [`SigCompEngine`]。
pub mod engine;
/// 错误分类与解压失败的现场报告。
pub mod error;
/// SigComp 报文头的解析、生成与流式转义。
pub mod framing;
/// 带代际校验的定长槽位池。
pub mod pool;
/// 按摘要寻址的状态存储。
pub mod state;
/// 可注入的单调时钟。
pub mod time;
/// UDVM 字节码解释器。
pub mod udvm;

pub use algorithm::{AlgorithmDescriptor, AlgorithmError, CompressionAlgorithm, Dictionary};
pub use compartment::{Capabilities, CompartmentHandle};
pub use compressor::{CompressedMessage, CompressionInfo, CompressionRequest};
pub use config::SigCompConfig;
pub use decompressor::{DecompressedMessage, Transport, UdvmId};
pub use digest::StateId;
pub use engine::{Declaration, EngineResources, SigCompEngine};
pub use error::{FailureReason, Postmortem, Result, SigCompError};
pub use framing::HeaderBody;
pub use state::{StateContent, StateSnapshot};
pub use time::{Clock, ManualClock, SystemClock};
