//! # 引擎门面
//!
//! # 模块角色（Why）
//! - 把状态存储、压缩舱管理器、两个调度器与算法注册表收敛为一个显式上下文，
//!   调用方不再需要关心组件之间的锁顺序；
//! - 一个进程可以持有多个互不干扰的引擎。
//!
//! # 核心机制（How）
//! - 锁顺序：注册表锁只在取出算法或标识列表时短暂持有；压缩舱锁先于存储锁；
//!   挂起集合的锁从不与压缩舱锁同时持有；
//! - 解压分两步：[`SigCompEngine::decompress_message`] 只执行字节码，
//!   [`SigCompEngine::declare_compartment`] 才把状态写入压缩舱；
//! - 销毁时先关闭全部压缩舱，再通知算法结束。
//!
//! # 契约说明（What）
//! - 所有方法都是 `&self`，引擎本身 `Send + Sync`；
//! - 声明失败时 [`Declaration::New`] 新建的压缩舱会被回滚。

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::algorithm::{AlgorithmDescriptor, AlgorithmRegistry, CompressionAlgorithm, Dictionary};
use crate::compartment::{Capabilities, CompartmentHandle, CompartmentManager, CompartmentSession};
use crate::compressor::{self, CompressedMessage, CompressionInfo};
use crate::config::SigCompConfig;
use crate::decompressor::{DecompressedMessage, DecompressionDispatcher, PendingMachine, Transport, UdvmId};
use crate::digest::{self, STATE_ID_LEN, StateId};
use crate::error::Result;
use crate::framing::{self, HeaderBody};
use crate::pool::ResourceUsage;
use crate::state::{StateSnapshot, StateStore, StoreResources};
use crate::time::{Clock, SystemClock};

/// 挂起 UDVM 的归属声明。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Declaration {
    /// 为该对端新建压缩舱，可指定算法名称，缺省使用默认算法。
    New(Option<String>),
    /// 归入已有压缩舱。
    Existing(CompartmentHandle),
    /// 对端未通过认证：丢弃状态请求。
    Unauthorized,
}

/// 引擎的资源使用快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineResources {
    /// 状态存储：三级缓冲、状态结构与索引。
    pub store: StoreResources,
    /// 压缩舱槽位。
    pub compartments: ResourceUsage,
    /// 挂起 UDVM 槽位。
    pub pending_machines: ResourceUsage,
    /// 已注册算法。
    pub algorithms: ResourceUsage,
    /// 已注册字典。
    pub dictionaries: ResourceUsage,
}

/// SigComp 引擎。
///
/// # 教案式说明
/// - **意图 (Why)**：为 SIP 传输层提供“收一条解一条、发一条压一条”的同步接口；
/// - **契约 (What)**：
///   - 构造时校验配置，非法配置返回 [`crate::SigCompError::BadParam`]；
///   - 解压得到非零 [`UdvmId`] 时，调用方必须在超时前调用 [`SigCompEngine::declare_compartment`]，
///     否则状态请求被丢弃；
/// - **风险 (Trade-offs)**：算法插件在压缩舱锁内执行，慢插件会阻塞同一压缩舱。
pub struct SigCompEngine {
    config: SigCompConfig,
    clock: Arc<dyn Clock>,
    store: StateStore,
    compartments: CompartmentManager,
    decompressor: DecompressionDispatcher,
    registry: Mutex<AlgorithmRegistry>,
}

impl std::fmt::Debug for SigCompEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigCompEngine")
            .field("config", &self.config)
            .field("compartments", &self.compartments)
            .field("decompressor", &self.decompressor)
            .finish_non_exhaustive()
    }
}

impl SigCompEngine {
    /// 以系统时钟构造。
    pub fn new(config: SigCompConfig) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }

    /// 以注入的时钟构造，测试中配合 [`crate::ManualClock`] 推进时间。
    pub fn with_clock(config: SigCompConfig, clock: impl Clock) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;
        let store = StateStore::new(&config);
        let engine = Self {
            compartments: CompartmentManager::new(&config, store.clone()),
            decompressor: DecompressionDispatcher::new(&config),
            registry: Mutex::new(AlgorithmRegistry::default()),
            clock: Arc::new(clock),
            store,
            config,
        };
        info!(
            compartments = engine.config.max_open_compartments,
            pending = engine.config.max_pending_machines(),
            dms = engine.config.decompression_memory_size,
            sms = engine.config.state_memory_size,
            "sigcomp engine started"
        );
        Ok(engine)
    }

    /// 生效中的配置（已钳制）。
    pub fn config(&self) -> &SigCompConfig {
        &self.config
    }

    /// 注册压缩算法，返回其字节码状态的标识。
    pub fn add_algorithm(
        &self,
        descriptor: AlgorithmDescriptor,
        plugin: Arc<dyn CompressionAlgorithm>,
    ) -> Result<StateId> {
        self.registry
            .lock()
            .add_algorithm(&self.store, descriptor, plugin)
    }

    /// 注册静态字典，返回其状态标识。
    pub fn add_dictionary(&self, dictionary: Dictionary) -> Result<StateId> {
        self.registry.lock().add_dictionary(&self.store, &dictionary)
    }

    /// 默认算法（第一个注册的算法）的描述。
    pub fn default_algorithm(&self) -> Option<AlgorithmDescriptor> {
        self.registry
            .lock()
            .select(None)
            .ok()
            .map(|entry| entry.descriptor.clone())
    }

    /// 按名称查找已注册算法的描述。
    pub fn find_algorithm(&self, name: &str) -> Option<AlgorithmDescriptor> {
        self.registry
            .lock()
            .find(name)
            .map(|entry| entry.descriptor.clone())
    }

    /// 以指定算法（缺省为默认算法）新建压缩舱。
    pub fn create_compartment(&self, algorithm: Option<&str>) -> Result<CompartmentHandle> {
        let algorithm = self.registry.lock().select(algorithm)?;
        self.compartments.create(algorithm)
    }

    /// 关闭压缩舱并释放其全部状态。
    pub fn close_compartment(&self, handle: CompartmentHandle) -> Result<()> {
        self.compartments.close(handle)
    }

    /// 解压一条完整报文。
    ///
    /// 面向流的传输应先用 [`framing::stream_to_message`] 去除转义。
    pub fn decompress_message(&self, message: &[u8], transport: Transport) -> Result<DecompressedMessage> {
        let result = self.decompressor.decompress(
            Bytes::copy_from_slice(message),
            transport,
            &self.store,
            self.clock.now(),
        );
        if let Err(err) = &result {
            debug!(%err, length = message.len(), "decompression rejected");
        }
        result
    }

    /// 声明挂起 UDVM 所属的压缩舱并提交其状态请求。
    ///
    /// 返回最终使用的压缩舱；`UdvmId(0)` 或 [`Declaration::Unauthorized`] 时返回 `None`。
    pub fn declare_compartment(
        &self,
        udvm_id: UdvmId,
        declaration: Declaration,
    ) -> Result<Option<CompartmentHandle>> {
        if udvm_id.is_none() {
            return Ok(None);
        }
        match declaration {
            Declaration::New(algorithm) => {
                let handle = self.create_compartment(algorithm.as_deref())?;
                match self.commit(udvm_id, Some(handle)) {
                    Ok(()) => Ok(Some(handle)),
                    Err(err) => {
                        if let Err(close) = self.compartments.close(handle) {
                            warn!(%close, "rollback of new compartment failed");
                        }
                        Err(err)
                    }
                }
            }
            Declaration::Existing(handle) => {
                self.compartments.with(handle, |_, _| ())?;
                self.commit(udvm_id, Some(handle))?;
                Ok(Some(handle))
            }
            Declaration::Unauthorized => {
                self.commit(udvm_id, None)?;
                Ok(None)
            }
        }
    }

    fn commit(&self, udvm_id: UdvmId, handle: Option<CompartmentHandle>) -> Result<()> {
        let now = self.clock.now();
        let Some(machine) = self.decompressor.take(udvm_id, now)? else {
            return Ok(());
        };
        let Some(handle) = handle else {
            debug!(%udvm_id, "pending udvm discarded for unauthorized peer");
            return Ok(());
        };
        let local_state_ids = self.local_state_ids();
        let static_dic = self.config.static_dic_3485_mandatory;
        self.compartments.with(handle, |compartment, store| {
            let PendingMachine {
                mut udvm,
                returned_feedback,
                ..
            } = machine;
            compartment.incoming_messages += 1;
            compartment.last_incoming_message = Some(now);
            udvm.finalize(&mut CompartmentSession {
                compartment: &mut *compartment,
                store,
            });
            if let Some(item) = returned_feedback {
                if let Err(err) = compartment.forward_returned_feedback(&item) {
                    warn!(%err, "returned feedback dropped");
                }
            }
            let info = CompressionInfo::collect(compartment, local_state_ids, static_dic);
            compartment.algorithm.plugin.on_peer_message(handle, &info);
            debug!(%udvm_id, index = handle.index(), "udvm committed to compartment");
        })
    }

    /// 压缩一条明文。
    ///
    /// 未给出压缩舱时以 `algorithm` 新建一个，结果中返回其句柄。
    pub fn compress_message(
        &self,
        compartment: Option<CompartmentHandle>,
        algorithm: Option<&str>,
        plain: &[u8],
        transport: Transport,
    ) -> Result<CompressedMessage> {
        let handle = match compartment {
            Some(handle) => handle,
            None => self.create_compartment(algorithm)?,
        };
        let local_state_ids = self.local_state_ids();
        let static_dic = self.config.static_dic_3485_mandatory;
        let data = self.compartments.with(handle, |compartment, _| {
            compressor::compress(
                compartment,
                handle,
                local_state_ids,
                static_dic,
                plain,
                transport,
            )
        })??;
        Ok(CompressedMessage {
            compartment: handle,
            data,
        })
    }

    /// 为发往该压缩舱对端的报文生成报头，附带待回显的请求反馈。
    pub fn generate_header(&self, handle: CompartmentHandle, body: &HeaderBody) -> Result<BytesMut> {
        self.compartments.with(handle, |compartment, _| {
            let mut dst = BytesMut::new();
            framing::encode_header(&compartment.requested_feedback, body, &mut dst)?;
            Ok(dst)
        })?
    }

    /// 要求下一条压缩报文重新上传字节码。
    pub fn clear_bytecode_flag(&self, handle: CompartmentHandle) -> Result<()> {
        self.compartments
            .with(handle, |compartment, _| compartment.send_bytecode = true)
    }

    /// 压缩舱当前持有的状态数。
    pub fn compartment_state_count(&self, handle: CompartmentHandle) -> Result<usize> {
        self.compartments
            .with(handle, |compartment, _| compartment.state_count())
    }

    /// 压缩舱持有的状态标识，按创建顺序排列。
    pub fn compartment_state_ids(&self, handle: CompartmentHandle) -> Result<Vec<StateId>> {
        self.compartments
            .with(handle, |compartment, _| compartment.state_ids())
    }

    /// 压缩舱剩余的状态内存预算。
    pub fn compartment_available_memory(&self, handle: CompartmentHandle) -> Result<usize> {
        self.compartments
            .with(handle, |compartment, _| compartment.available_state_memory())
    }

    /// 对端最近通告的能力。
    pub fn remote_capabilities(&self, handle: CompartmentHandle) -> Result<Capabilities> {
        self.compartments
            .with(handle, |compartment, _| compartment.remote)
    }

    /// 当前交给压缩算法的参数快照。
    pub fn compression_info(&self, handle: CompartmentHandle) -> Result<CompressionInfo> {
        let local_state_ids = self.local_state_ids();
        let static_dic = self.config.static_dic_3485_mandatory;
        self.compartments.with(handle, |compartment, _| {
            CompressionInfo::collect(compartment, local_state_ids, static_dic)
        })
    }

    /// 按部分标识读取状态，忽略最小访问长度。
    pub fn get_state(&self, partial_id: &[u8]) -> Result<StateSnapshot> {
        self.store.lookup(partial_id, true)
    }

    /// 本端可供对端引用的状态标识列表。
    pub fn local_state_ids(&self) -> Bytes {
        self.registry.lock().local_state_ids()
    }

    /// 计算 SHA-1 摘要。
    pub fn sha1(data: &[u8]) -> [u8; STATE_ID_LEN] {
        digest::compute_sha1(data)
    }

    /// 资源使用快照。
    pub fn resources(&self) -> EngineResources {
        let registry = self.registry.lock();
        EngineResources {
            store: self.store.resources(),
            compartments: self.compartments.usage(),
            pending_machines: self.decompressor.usage(),
            algorithms: registry.algorithm_usage(),
            dictionaries: registry.dictionary_usage(),
        }
    }

    /// 引擎时钟的当前时间。
    pub fn now(&self) -> Instant {
        self.clock.now()
    }
}

impl Drop for SigCompEngine {
    fn drop(&mut self) {
        self.compartments.close_all();
        self.registry.lock().end_all();
        debug!("sigcomp engine stopped");
    }
}
