//! SHA-1 摘要与状态标识。
//!
//! ## 设计动机（Why）
//! - 状态按内容寻址，标识是 `(长度, 地址, 指令, 最小访问长度, 数据)` 的 SHA-1；
//! - 集中编码顺序，确保解压端保存状态与算法插件预先计算的标识完全一致。

use std::fmt;

use sha1::{Digest, Sha1};

/// 状态标识的字节数。
pub const STATE_ID_LEN: usize = 20;
/// 部分标识的最小长度。
pub const MIN_PARTIAL_ID_LEN: usize = 6;
/// 哈希索引使用的前缀宽度。
pub const INDEX_KEY_LEN: usize = 6;

/// 20 字节状态标识。
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StateId([u8; STATE_ID_LEN]);

impl StateId {
    /// 由原始字节构造。
    pub const fn from_bytes(bytes: [u8; STATE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// 原始字节。
    pub fn as_bytes(&self) -> &[u8; STATE_ID_LEN] {
        &self.0
    }

    /// 是否为全零标识（保存时被拒绝）。
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// 哈希索引键：前 6 字节。
    pub fn index_key(&self) -> [u8; INDEX_KEY_LEN] {
        let mut key = [0u8; INDEX_KEY_LEN];
        key.copy_from_slice(&self.0[..INDEX_KEY_LEN]);
        key
    }

    /// 计算状态标识。
    ///
    /// 字节序：长度、地址、指令、最小访问长度各为大端 16 位，随后是数据本身。
    pub fn for_state(
        data: &[u8],
        address: u16,
        instruction: u16,
        minimum_access_length: u16,
    ) -> Self {
        let mut builder =
            StateDigest::new(data.len() as u16, address, instruction, minimum_access_length);
        builder.update(data);
        builder.finish()
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateId({self})")
    }
}

/// 增量计算状态标识，供循环缓冲分段喂入数据。
pub struct StateDigest {
    hasher: Sha1,
}

impl StateDigest {
    /// 写入 8 字节头部后返回构造器。
    pub fn new(length: u16, address: u16, instruction: u16, minimum_access_length: u16) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(length.to_be_bytes());
        hasher.update(address.to_be_bytes());
        hasher.update(instruction.to_be_bytes());
        hasher.update(minimum_access_length.to_be_bytes());
        Self { hasher }
    }

    /// 追加一段数据。
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
    }

    /// 输出标识。
    pub fn finish(self) -> StateId {
        StateId(self.hasher.finalize().into())
    }
}

/// 对任意字节计算 SHA-1。
pub fn compute_sha1(data: &[u8]) -> [u8; STATE_ID_LEN] {
    Sha1::digest(data).into()
}
