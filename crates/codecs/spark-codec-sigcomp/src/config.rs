//! # 引擎配置
//!
//! ## 模块角色（Why）
//! - 集中声明所有池容量与协议参数，使“网络输入无法让集合无界增长”这一约束可以在一处审计；
//! - 支持从 TOML 文本加载，缺省字段回落到 RFC 3320 的最低要求。
//!
//! ## 契约说明（What）
//! - [`SigCompConfig::normalized`] 把越界字段钳制到合法区间，永不失败；
//! - [`SigCompConfig::validate`] 只拒绝无法钳制修复的组合（缓冲分级大小非单调）；
//! - 引擎构造时先 `normalized` 再 `validate`。

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::error::SigCompError;

/// UDVM 可寻址内存上限。
pub const MAX_UDVM_MEMORY: usize = 65536;
/// 挂起 UDVM 的数量上限，受限于 10 位槽位编号。
pub const MAX_PENDING_MACHINES: usize = 1024;
/// 可注册的压缩算法数量上限。
pub const MAX_ALGORITHMS: usize = 10;
/// 可注册的字典数量上限。
pub const MAX_DICTIONARIES: usize = 3;

/// 配置加载失败。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// TOML 文本无法解析。
    #[error("failed to parse sigcomp config: {0}")]
    Parse(#[from] toml::de::Error),
    /// 解析成功但字段组合非法。
    #[error(transparent)]
    Invalid(#[from] SigCompError),
}

/// SigComp 引擎配置。
///
/// # 教案式说明
/// - **意图 (Why)**：把“每个压缩舱多少状态”“同时挂起多少 UDVM”等上限显式化。
/// - **契约 (What)**：所有字段都有默认值；`*_pool_amount` 表示“每个压缩舱”的份额，
///   实际池容量为份额乘以 `max_open_compartments + max_temp_compartments`。
/// - **设计权衡 (Trade-offs)**：池在构造时一次性定容，运行期不支持热调整。
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SigCompConfig {
    /// 同时打开的压缩舱上限。
    pub max_open_compartments: usize,
    /// 临时压缩舱上限，也参与挂起 UDVM 数量的计算。
    pub max_temp_compartments: usize,
    /// 单个压缩舱可持有的状态数上限。
    pub max_states_per_compartment: usize,
    /// 挂起 UDVM 等待压缩舱声明的时长（毫秒）。
    pub temp_compartment_timeout_ms: u64,
    /// 是否要求对端提供 RFC 3485 静态字典。
    pub static_dic_3485_mandatory: bool,
    /// 本端解压内存大小（DMS）。
    pub decompression_memory_size: usize,
    /// 本端每个压缩舱的状态内存（SMS）。
    pub state_memory_size: usize,
    /// 本端每比特周期数（CPB）。
    pub cycles_per_bit: u16,
    /// 小号缓冲大小。
    pub small_buffer_size: usize,
    /// 中号缓冲大小。
    pub medium_buffer_size: usize,
    /// 大号缓冲大小。
    pub large_buffer_size: usize,
    /// 每个压缩舱的小号缓冲份额。
    pub small_pool_amount: usize,
    /// 每个压缩舱的中号缓冲份额。
    pub medium_pool_amount: usize,
    /// 每个压缩舱的大号缓冲份额。
    pub large_pool_amount: usize,
}

impl Default for SigCompConfig {
    fn default() -> Self {
        Self {
            max_open_compartments: 10,
            max_temp_compartments: 10,
            max_states_per_compartment: 16,
            temp_compartment_timeout_ms: 5000,
            static_dic_3485_mandatory: true,
            decompression_memory_size: 8192,
            state_memory_size: 2048,
            cycles_per_bit: 16,
            small_buffer_size: 64,
            medium_buffer_size: 512,
            large_buffer_size: 8192,
            small_pool_amount: 8,
            medium_pool_amount: 2,
            large_pool_amount: 1,
        }
    }
}

impl SigCompConfig {
    /// 从 TOML 文本加载配置，随后钳制并校验。
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let parsed: Self = toml::from_str(raw)?;
        let config = parsed.normalized();
        config.validate()?;
        Ok(config)
    }

    /// 返回钳制到合法区间后的副本。
    pub fn normalized(&self) -> Self {
        Self {
            max_open_compartments: self.max_open_compartments.max(1),
            max_temp_compartments: self.max_temp_compartments.max(1),
            max_states_per_compartment: self.max_states_per_compartment.clamp(1, 512),
            temp_compartment_timeout_ms: self.temp_compartment_timeout_ms.max(10),
            static_dic_3485_mandatory: self.static_dic_3485_mandatory,
            decompression_memory_size: self.decompression_memory_size.max(2048),
            state_memory_size: self.state_memory_size,
            cycles_per_bit: self.cycles_per_bit.max(16),
            small_buffer_size: self.small_buffer_size.max(8),
            medium_buffer_size: self.medium_buffer_size.max(8),
            large_buffer_size: self.large_buffer_size.max(8),
            small_pool_amount: self.small_pool_amount.max(1),
            medium_pool_amount: self.medium_pool_amount.max(1),
            large_pool_amount: self.large_pool_amount.max(1),
        }
    }

    /// 校验无法钳制修复的约束。
    pub fn validate(&self) -> Result<(), SigCompError> {
        if self.small_buffer_size > self.medium_buffer_size
            || self.medium_buffer_size > self.large_buffer_size
        {
            return Err(SigCompError::bad_param(
                "buffer tier sizes must be non-decreasing",
            ));
        }
        Ok(())
    }

    /// 参与池容量计算的压缩舱总数。
    pub fn compartment_budget(&self) -> usize {
        self.max_open_compartments + self.max_temp_compartments
    }

    /// 同时挂起的 UDVM 上限。
    pub fn max_pending_machines(&self) -> usize {
        self.compartment_budget().min(MAX_PENDING_MACHINES)
    }

    /// 挂起超时，按四舍五入折算为整秒，至少 1 秒。
    pub fn pending_timeout(&self) -> Duration {
        let secs = (self.temp_compartment_timeout_ms + 500) / 1000;
        Duration::from_secs(secs.max(1))
    }

    /// 三级缓冲的 `(大小, 容量)`，按从小到大排列。
    pub fn tiers(&self) -> [(usize, usize); 3] {
        let budget = self.compartment_budget();
        [
            (self.small_buffer_size, self.small_pool_amount * budget),
            (self.medium_buffer_size, self.medium_pool_amount * budget),
            (self.large_buffer_size, self.large_pool_amount * budget),
        ]
    }
}
