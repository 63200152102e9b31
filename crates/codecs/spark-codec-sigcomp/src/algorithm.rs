//! # 压缩算法插件与注册表
//!
//! # 模块角色（Why）
//! - SigComp 只规定解压端的虚拟机，压缩算法由部署方自行选择；引擎以插件形式接入算法；
//! - 每个算法都附带一段解压字节码，注册时作为永久状态写入存储，对端可以只引用其标识而不重复上传。
//!
//! # 核心机制（How）
//! - [`CompressionAlgorithm`] 只有 `compress` 是必需的，其余生命周期钩子均有空实现；
//! - 注册表按名称去重，容量固定为 [`MAX_ALGORITHMS`]；字典容量固定为 [`MAX_DICTIONARIES`]；
//! - 每注册一个字典，就把 `[长度][标识前缀]` 追加到本端状态标识列表，压缩时通告给对端。
//!
//! # 契约说明（What）
//! - 第一个注册的算法为默认算法；
//! - 钩子在持有压缩舱锁时被调用，插件不得回调引擎，否则会死锁。

use std::error::Error as StdError;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info};

use crate::compartment::CompartmentHandle;
use crate::compressor::{CompressionInfo, CompressionRequest};
use crate::config::{MAX_ALGORITHMS, MAX_DICTIONARIES};
use crate::digest::{MIN_PARTIAL_ID_LEN, STATE_ID_LEN, StateId};
use crate::error::{Result, SigCompError};
use crate::pool::ResourceUsage;
use crate::state::{PERMANENT_PRIORITY, StateMeta, StateStore};

/// 插件返回的错误类型，统一装箱后由引擎包装为 [`SigCompError::Algorithm`]。
pub type AlgorithmError = Box<dyn StdError + Send + Sync + 'static>;

/// 算法字节码状态的最小访问长度。
const BYTECODE_MINIMUM_ACCESS_LENGTH: u16 = 6;

/// 本端状态标识列表的条目上限。
const LOCAL_ID_ENTRIES: usize = MAX_DICTIONARIES;

/// 压缩算法插件契约。
///
/// # 教案式说明
/// - **意图 (Why)**：把“如何压缩”与“如何管理压缩舱”分离，插件只关心数据变换；
/// - **契约 (What)**：
///   - `compress` 必须返回一条完整的 SigComp 报文（含报头），失败时返回任意错误描述；
///   - 生命周期钩子全部可选，默认什么也不做；
///   - 实现必须是 `Send + Sync`，同一实例会被多个压缩舱共享；
/// - **风险 (Trade-offs)**：钩子在压缩舱锁内执行，耗时操作会阻塞同一压缩舱的其它调用。
pub trait CompressionAlgorithm: Send + Sync + 'static {
    /// 压缩一条明文消息。
    fn compress(&self, request: &mut CompressionRequest<'_>) -> core::result::Result<Bytes, AlgorithmError>;

    /// 注册成功后调用一次。
    fn on_algorithm_initialized(&self, _descriptor: &AlgorithmDescriptor) {}

    /// 引擎销毁时调用一次。
    fn on_algorithm_ended(&self, _descriptor: &AlgorithmDescriptor) {}

    /// 压缩舱创建后调用，`context` 为该压缩舱独占的上下文缓冲。
    fn on_compartment_created(&self, _compartment: CompartmentHandle, _context: &mut [u8]) {}

    /// 压缩舱销毁前调用。
    fn on_compartment_destructed(&self, _compartment: CompartmentHandle, _context: &mut [u8]) {}

    /// 收到对端报文并完成压缩舱声明后调用。
    fn on_peer_message(&self, _compartment: CompartmentHandle, _info: &CompressionInfo) {}
}

/// 算法的静态描述。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AlgorithmDescriptor {
    /// 唯一名称。
    pub name: String,
    /// 每个压缩舱的上下文缓冲大小，0 表示不需要。
    pub context_size: usize,
    /// 对端执行的解压字节码。
    pub decompression_bytecode: Bytes,
    /// 字节码装载地址。
    pub bytecode_address: u16,
    /// 字节码入口指令地址。
    pub bytecode_instruction: u16,
    /// 字节码运行所需的每比特周期数。
    pub cycles_per_bit: u16,
    /// 字节码运行所需的解压内存。
    pub decompression_memory_size: usize,
    /// 字节码运行所需的状态内存。
    pub state_memory_size: usize,
    /// 字节码依赖的 SigComp 版本。
    pub version: u8,
}

impl AlgorithmDescriptor {
    /// 以名称与字节码构造描述，其余参数取 RFC 3320 的最小值。
    pub fn new(name: impl Into<String>, decompression_bytecode: Bytes) -> Self {
        Self {
            name: name.into(),
            context_size: 0,
            decompression_bytecode,
            bytecode_address: 128,
            bytecode_instruction: 128,
            cycles_per_bit: 16,
            decompression_memory_size: 8192,
            state_memory_size: 2048,
            version: 1,
        }
    }

    /// 字节码状态的标识。
    pub fn bytecode_state_id(&self) -> StateId {
        StateId::for_state(
            &self.decompression_bytecode,
            self.bytecode_address,
            self.bytecode_instruction,
            BYTECODE_MINIMUM_ACCESS_LENGTH,
        )
    }
}

/// 作为永久状态加载的静态字典。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dictionary {
    /// 字典内容。
    pub data: Bytes,
    /// 最小访问长度，注册时钳制到 6..=20。
    pub minimum_access_length: u16,
}

impl Dictionary {
    /// 以默认最小访问长度 6 构造。
    pub fn new(data: Bytes) -> Self {
        Self {
            data,
            minimum_access_length: MIN_PARTIAL_ID_LEN as u16,
        }
    }

    fn clamped_access_length(&self) -> u16 {
        self.minimum_access_length
            .clamp(MIN_PARTIAL_ID_LEN as u16, STATE_ID_LEN as u16)
    }
}

/// 注册表中的一项算法。
pub(crate) struct RegisteredAlgorithm {
    pub(crate) descriptor: AlgorithmDescriptor,
    pub(crate) plugin: Arc<dyn CompressionAlgorithm>,
    pub(crate) bytecode_state: StateId,
}

impl std::fmt::Debug for RegisteredAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredAlgorithm")
            .field("name", &self.descriptor.name)
            .field("bytecode_state", &self.bytecode_state)
            .finish()
    }
}

/// 算法与字典的注册表，由引擎放在锁后。
#[derive(Debug, Default)]
pub(crate) struct AlgorithmRegistry {
    algorithms: Vec<Arc<RegisteredAlgorithm>>,
    dictionaries: Vec<StateId>,
    local_state_ids: Vec<u8>,
    local_id_entries: usize,
}

impl AlgorithmRegistry {
    /// 注册算法；同名重复注册直接返回已有的字节码标识。
    pub(crate) fn add_algorithm(
        &mut self,
        store: &StateStore,
        descriptor: AlgorithmDescriptor,
        plugin: Arc<dyn CompressionAlgorithm>,
    ) -> Result<StateId> {
        if descriptor.name.is_empty() {
            return Err(SigCompError::bad_param("empty algorithm name"));
        }
        if let Some(existing) = self.find(&descriptor.name) {
            debug!(name = %descriptor.name, "algorithm already registered");
            return Ok(existing.bytecode_state);
        }
        if self.algorithms.len() >= MAX_ALGORITHMS {
            return Err(SigCompError::out_of_resources("algorithms"));
        }
        if descriptor.decompression_bytecode.is_empty() {
            return Err(SigCompError::bad_param("empty decompression bytecode"));
        }
        let id = descriptor.bytecode_state_id();
        store.save_permanent(
            StateMeta {
                id,
                address: descriptor.bytecode_address,
                instruction: descriptor.bytecode_instruction,
                minimum_access_length: BYTECODE_MINIMUM_ACCESS_LENGTH,
                retention_priority: PERMANENT_PRIORITY,
            },
            descriptor.decompression_bytecode.clone(),
        )?;
        plugin.on_algorithm_initialized(&descriptor);
        info!(name = %descriptor.name, bytecode = %id, "compression algorithm registered");
        self.algorithms.push(Arc::new(RegisteredAlgorithm {
            descriptor,
            plugin,
            bytecode_state: id,
        }));
        Ok(id)
    }

    /// 注册静态字典，返回其状态标识。
    pub(crate) fn add_dictionary(
        &mut self,
        store: &StateStore,
        dictionary: &Dictionary,
    ) -> Result<StateId> {
        if dictionary.data.is_empty() || dictionary.data.len() > usize::from(u16::MAX) {
            return Err(SigCompError::bad_param("dictionary length outside 1..=65535"));
        }
        if self.dictionaries.len() >= MAX_DICTIONARIES {
            return Err(SigCompError::out_of_resources("dictionaries"));
        }
        let access = dictionary.clamped_access_length();
        let id = StateId::for_state(&dictionary.data, 0, 0, access);
        store.save_permanent(
            StateMeta {
                id,
                address: 0,
                instruction: 0,
                minimum_access_length: access,
                retention_priority: PERMANENT_PRIORITY,
            },
            dictionary.data.clone(),
        )?;
        self.dictionaries.push(id);
        if self.local_id_entries < LOCAL_ID_ENTRIES {
            let prefix = usize::from(access);
            self.local_state_ids.push(access as u8);
            self.local_state_ids
                .extend_from_slice(&id.as_bytes()[..prefix]);
            self.local_id_entries += 1;
        }
        info!(id = %id, length = dictionary.data.len(), "static dictionary registered");
        Ok(id)
    }

    /// 按名称查找。
    pub(crate) fn find(&self, name: &str) -> Option<Arc<RegisteredAlgorithm>> {
        self.algorithms
            .iter()
            .find(|entry| entry.descriptor.name == name)
            .cloned()
    }

    /// 按名称选择算法，未指定名称时使用第一个注册的算法。
    pub(crate) fn select(&self, name: Option<&str>) -> Result<Arc<RegisteredAlgorithm>> {
        match name {
            Some(name) => self.find(name).ok_or(SigCompError::NotFound),
            None => self.algorithms.first().cloned().ok_or(SigCompError::NotFound),
        }
    }

    /// 本端状态标识列表（`[长度][标识前缀]` 序列）。
    pub(crate) fn local_state_ids(&self) -> Bytes {
        Bytes::copy_from_slice(&self.local_state_ids)
    }

    pub(crate) fn algorithm_usage(&self) -> ResourceUsage {
        ResourceUsage {
            allocated: MAX_ALGORITHMS,
            in_use: self.algorithms.len(),
            max_used: self.algorithms.len(),
        }
    }

    pub(crate) fn dictionary_usage(&self) -> ResourceUsage {
        ResourceUsage {
            allocated: MAX_DICTIONARIES,
            in_use: self.dictionaries.len(),
            max_used: self.dictionaries.len(),
        }
    }

    /// 通知所有算法引擎即将销毁。
    pub(crate) fn end_all(&mut self) {
        for entry in self.algorithms.drain(..) {
            entry.plugin.on_algorithm_ended(&entry.descriptor);
            debug!(name = %entry.descriptor.name, "compression algorithm ended");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::SigCompConfig;

    #[derive(Default)]
    struct CountingAlgorithm {
        initialized: AtomicUsize,
        ended: AtomicUsize,
    }

    impl CompressionAlgorithm for CountingAlgorithm {
        fn compress(
            &self,
            request: &mut CompressionRequest<'_>,
        ) -> core::result::Result<Bytes, AlgorithmError> {
            Ok(Bytes::copy_from_slice(request.plain))
        }

        fn on_algorithm_initialized(&self, _descriptor: &AlgorithmDescriptor) {
            self.initialized.fetch_add(1, Ordering::SeqCst);
        }

        fn on_algorithm_ended(&self, _descriptor: &AlgorithmDescriptor) {
            self.ended.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn descriptor(name: &str) -> AlgorithmDescriptor {
        AlgorithmDescriptor::new(name, Bytes::from_static(&[0x23, 0x00, 0x00]))
    }

    #[test]
    fn registration_is_idempotent_by_name() {
        let store = StateStore::new(&SigCompConfig::default());
        let plugin = Arc::new(CountingAlgorithm::default());
        let mut registry = AlgorithmRegistry::default();
        let first = registry
            .add_algorithm(&store, descriptor("deflate"), plugin.clone())
            .expect("首次注册");
        let second = registry
            .add_algorithm(&store, descriptor("deflate"), plugin.clone())
            .expect("重复注册");
        assert_eq!(first, second);
        assert_eq!(plugin.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(registry.algorithm_usage().in_use, 1);

        let state = store.lookup(&first.as_bytes()[..6], false).expect("字节码状态");
        assert_eq!(state.address, 128);
        assert_eq!(state.retention_priority, PERMANENT_PRIORITY);

        registry.end_all();
        assert_eq!(plugin.ended.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn default_algorithm_is_first_registered() {
        let store = StateStore::new(&SigCompConfig::default());
        let mut registry = AlgorithmRegistry::default();
        assert_eq!(registry.select(None).err(), Some(SigCompError::NotFound));
        for name in ["a", "b"] {
            registry
                .add_algorithm(&store, descriptor(name), Arc::new(CountingAlgorithm::default()))
                .expect("注册");
        }
        assert_eq!(registry.select(None).expect("默认").descriptor.name, "a");
        assert_eq!(registry.select(Some("b")).expect("按名").descriptor.name, "b");
        assert_eq!(registry.select(Some("c")).err(), Some(SigCompError::NotFound));
    }

    #[test]
    fn algorithm_capacity_is_bounded() {
        let store = StateStore::new(&SigCompConfig::default());
        let mut registry = AlgorithmRegistry::default();
        for index in 0..MAX_ALGORITHMS {
            let code = Bytes::from(vec![0x23, index as u8]);
            registry
                .add_algorithm(
                    &store,
                    AlgorithmDescriptor::new(format!("alg-{index}"), code),
                    Arc::new(CountingAlgorithm::default()),
                )
                .expect("注册");
        }
        let overflow = registry.add_algorithm(
            &store,
            descriptor("overflow"),
            Arc::new(CountingAlgorithm::default()),
        );
        assert_eq!(
            overflow.err(),
            Some(SigCompError::out_of_resources("algorithms"))
        );
    }

    #[test]
    fn dictionary_appends_local_id_and_clamps_access() {
        let store = StateStore::new(&SigCompConfig::default());
        let mut registry = AlgorithmRegistry::default();
        let dictionary = Dictionary {
            data: Bytes::from_static(b"REGISTER sip: SIP/2.0 INVITE"),
            minimum_access_length: 40,
        };
        let id = registry
            .add_dictionary(&store, &dictionary)
            .expect("字典");
        assert_eq!(id, StateId::for_state(&dictionary.data, 0, 0, 20));

        let ids = registry.local_state_ids();
        assert_eq!(ids.len(), 21);
        assert_eq!(ids[0], 20);
        assert_eq!(&ids[1..], &id.as_bytes()[..]);

        assert!(store.lookup(&id.as_bytes()[..6], false).is_err());
        assert!(store.lookup(&id.as_bytes()[..], false).is_ok());
    }

    #[test]
    fn dictionary_capacity_is_bounded() {
        let store = StateStore::new(&SigCompConfig::default());
        let mut registry = AlgorithmRegistry::default();
        for index in 0..MAX_DICTIONARIES {
            registry
                .add_dictionary(&store, &Dictionary::new(Bytes::from(vec![index as u8; 16])))
                .expect("字典");
        }
        let overflow = registry.add_dictionary(&store, &Dictionary::new(Bytes::from_static(b"x")));
        assert_eq!(
            overflow.err(),
            Some(SigCompError::out_of_resources("dictionaries"))
        );
    }
}
