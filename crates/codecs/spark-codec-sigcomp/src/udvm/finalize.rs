//! # 提交延迟效果
//!
//! # 契约说明（What）
//! - 顺序固定：先转交对端返回的参数，再转交对端请求的反馈，最后按登记顺序执行状态请求；
//! - 单个状态请求失败只记录日志并跳过，不影响其余请求；
//! - 解释器只依赖 [`FinalizeTarget`]，不知道压缩舱的具体实现与锁。

use tracing::{debug, warn};

use crate::digest::{MIN_PARTIAL_ID_LEN, STATE_ID_LEN, StateDigest, StateId};
use crate::error::Result;
use crate::state::SaveOutcome;

use super::Udvm;
use super::cyclic::{Cyclic, CyclicRegion};
use super::request::{DeferredRequest, FreeRequest, SaveRequest};

/// 对端状态标识列表的容量（字节）。
pub const REMOTE_STATE_IDS_CAPACITY: usize = 512;

/// 每个状态在状态内存预算中的固定开销。
const STATE_OVERHEAD: usize = 64;

/// requested feedback 字节中的 I 位、S 位与 Q 位。
const FEEDBACK_I: u8 = 0x1;
const FEEDBACK_S: u8 = 0x2;
const FEEDBACK_Q: u8 = 0x4;

/// 准备写入压缩舱的状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SaveAdmission {
    /// 状态标识。
    pub id: StateId,
    /// 状态长度（可能已按本端状态内存截短）。
    pub length: usize,
    /// 关联的字节码装载地址。
    pub address: u16,
    /// 关联的字节码入口。
    pub instruction: u16,
    /// 最小访问长度。
    pub minimum_access_length: u16,
    /// 保留优先级。
    pub retention_priority: u16,
}

/// `finalize` 的提交目标，通常是已加锁的压缩舱。
pub trait FinalizeTarget {
    /// 本端为每个压缩舱提供的状态内存。
    fn local_state_memory_size(&self) -> usize;

    /// 更新对端能力；返回对端状态标识列表的可用容量。
    fn update_peer_capabilities(&mut self, packed: u8, version: u8) -> usize;

    /// 替换对端已持有的状态标识列表（`[长度][标识]` 序列）。
    fn set_remote_state_ids(&mut self, ids: &[u8]);

    /// 转交对端请求的反馈：是否保留对端状态、是否需要重新发送本端标识列表、待回显的反馈项。
    fn forward_requested_feedback(
        &mut self,
        keep_remote_states: bool,
        send_local_ids: bool,
        item: Option<&[u8]>,
    ) -> Result<()>;

    /// 保存一个状态。
    fn save_state(
        &mut self,
        admission: SaveAdmission,
        content: &CyclicRegion<'_>,
    ) -> Result<SaveOutcome>;

    /// 按部分标识释放一个状态。
    fn remove_state(&mut self, partial_id: &[u8]) -> Result<()>;
}

impl Udvm {
    /// 把返回参数、请求反馈与延迟状态请求提交给 `target`。
    pub fn finalize(&mut self, target: &mut dyn FinalizeTarget) {
        if self.returned_parameters_location != 0 {
            self.forward_returned_parameters(target);
        }
        if self.requested_feedback_location != 0 {
            self.forward_requested_feedback(target);
        }
        for request in self.requests.take() {
            match request {
                DeferredRequest::Save(save) => self.commit_save(save, target),
                DeferredRequest::Free(free) => self.commit_free(free, target),
            }
        }
    }

    fn forward_returned_parameters(&self, target: &mut dyn FinalizeTarget) {
        let location = usize::from(self.returned_parameters_location);
        let (Ok(packed), Ok(version)) = (
            self.memory.read_u8(location),
            self.memory.read_u8(location + 1),
        ) else {
            return;
        };
        let capacity = target.update_peer_capabilities(packed, version);
        let start = location + 2;
        let mut end = start;
        loop {
            let Ok(length) = self.memory.read_u8(end) else {
                return;
            };
            let length = usize::from(length);
            if !(MIN_PARTIAL_ID_LEN..=STATE_ID_LEN).contains(&length) {
                break;
            }
            let next = end + 1 + length;
            if next > self.memory.size() {
                return;
            }
            if next - start > capacity {
                break;
            }
            end = next;
        }
        if let Ok(ids) = self.memory.slice(start, end - start) {
            target.set_remote_state_ids(ids);
        }
    }

    fn forward_requested_feedback(&self, target: &mut dyn FinalizeTarget) {
        let location = usize::from(self.requested_feedback_location);
        let Ok(flags) = self.memory.read_u8(location) else {
            return;
        };
        let keep_remote_states = flags & FEEDBACK_S == 0;
        let send_local_ids = flags & FEEDBACK_I == 0;
        let item = if flags & FEEDBACK_Q != 0 {
            let Ok(first) = self.memory.read_u8(location + 1) else {
                return;
            };
            let item = if first <= 0x7f {
                self.memory.slice(location + 1, 1)
            } else {
                self.memory
                    .slice(location + 2, usize::from(first & 0x7f))
            };
            match item {
                Ok(item) => Some(item),
                Err(_) => return,
            }
        } else {
            None
        };
        if let Err(err) = target.forward_requested_feedback(keep_remote_states, send_local_ids, item)
        {
            warn!(%err, "requested feedback rejected");
        }
    }

    fn commit_save(&self, request: SaveRequest, target: &mut dyn FinalizeTarget) {
        let sms = target.local_state_memory_size();
        let mut length = usize::from(request.length);
        if length + STATE_OVERHEAD > sms {
            if sms < STATE_OVERHEAD {
                debug!(sms, "state memory too small, save skipped");
                return;
            }
            length = sms - STATE_OVERHEAD;
        }
        let region = match CyclicRegion::new(&self.memory, request.address, length) {
            Ok(region) => region,
            Err(reason) => {
                warn!(%reason, address = request.address, length, "state save skipped");
                return;
            }
        };
        let mut digest = StateDigest::new(
            length as u16,
            request.address,
            request.instruction,
            request.minimum_access_length,
        );
        for chunk in region.chunks() {
            digest.update(chunk);
        }
        let admission = SaveAdmission {
            id: digest.finish(),
            length,
            address: request.address,
            instruction: request.instruction,
            minimum_access_length: request.minimum_access_length,
            retention_priority: request.retention_priority,
        };
        match target.save_state(admission, &region) {
            Ok(outcome) => debug!(id = %admission.id, duplicate = outcome.is_duplicate(), "state committed"),
            Err(err) => warn!(%err, id = %admission.id, "state save failed"),
        }
    }

    fn commit_free(&self, request: FreeRequest, target: &mut dyn FinalizeTarget) {
        let partial_id = Cyclic::from_memory(&self.memory).and_then(|cyclic| {
            cyclic.read(
                &self.memory,
                request.partial_id_start,
                usize::from(request.partial_id_length),
            )
        });
        match partial_id {
            Ok(partial_id) => {
                if let Err(err) = target.remove_state(&partial_id) {
                    warn!(%err, "state free failed");
                }
            }
            Err(reason) => warn!(%reason, "state free skipped"),
        }
    }
}
