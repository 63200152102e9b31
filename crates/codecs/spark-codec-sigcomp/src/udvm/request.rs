//! 延迟执行的状态请求。
//!
//! STATE-CREATE、STATE-FREE 与 END-MESSAGE 只登记请求，直到压缩舱确认后由 `finalize` 统一执行。
//! 两类请求各自最多 4 个，超限即为 [`FailureReason::State`]。

use crate::digest::{MIN_PARTIAL_ID_LEN, STATE_ID_LEN};
use crate::error::FailureReason;
use crate::state::PERMANENT_PRIORITY;

use super::Step;

/// 每类请求的数量上限。
pub(crate) const MAX_REQUESTS: usize = 4;

/// 状态保存请求，字段取自 STATE-CREATE 或 END-MESSAGE 的操作数。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveRequest {
    /// 状态长度。
    pub length: u16,
    /// 状态数据在 UDVM 内存中的起始地址。
    pub address: u16,
    /// 关联的字节码入口。
    pub instruction: u16,
    /// 最小访问长度。
    pub minimum_access_length: u16,
    /// 保留优先级。
    pub retention_priority: u16,
}

impl SaveRequest {
    /// 最小访问长度与优先级是否允许创建状态。
    pub(crate) fn is_admissible(&self) -> bool {
        (MIN_PARTIAL_ID_LEN..=STATE_ID_LEN).contains(&usize::from(self.minimum_access_length))
            && self.retention_priority != PERMANENT_PRIORITY
    }
}

/// 状态释放请求：部分标识仍位于 UDVM 内存中。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreeRequest {
    /// 部分标识起始地址。
    pub partial_id_start: u16,
    /// 部分标识长度。
    pub partial_id_length: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum DeferredRequest {
    Save(SaveRequest),
    Free(FreeRequest),
}

/// 按登记顺序保存的请求列表。
#[derive(Debug, Default)]
pub(crate) struct DeferredRequests {
    items: Vec<DeferredRequest>,
    saves: usize,
    frees: usize,
}

impl DeferredRequests {
    pub(crate) fn push_save(&mut self, request: SaveRequest) -> Step<()> {
        if !request.is_admissible() || self.saves >= MAX_REQUESTS {
            return Err(FailureReason::State);
        }
        self.saves += 1;
        self.items.push(DeferredRequest::Save(request));
        Ok(())
    }

    pub(crate) fn push_free(&mut self, request: FreeRequest) -> Step<()> {
        let length = usize::from(request.partial_id_length);
        if !(MIN_PARTIAL_ID_LEN..=STATE_ID_LEN).contains(&length) || self.frees >= MAX_REQUESTS {
            return Err(FailureReason::State);
        }
        self.frees += 1;
        self.items.push(DeferredRequest::Free(request));
        Ok(())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<DeferredRequest> {
        self.saves = 0;
        self.frees = 0;
        std::mem::take(&mut self.items)
    }
}
