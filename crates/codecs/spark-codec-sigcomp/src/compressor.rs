//! # 压缩调度器
//!
//! # 模块角色（Why）
//! - 压缩算法需要知道对端的能力、对端已持有的状态与待回显的反馈，但不应直接接触压缩舱的锁与预算；
//! - 调度器把这些参数打包为一份只读的 [`CompressionInfo`]，调用插件后再回写一次性标志。
//!
//! # 契约说明（What）
//! - 插件失败时压缩舱不做任何修改；
//! - 成功后清除 `send_bytecode`、对端能力变化标志与待回显的反馈；
//! - 报文最低两位为 0 表示携带了字节码，若本次并未要求发送字节码则记录告警。

use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::algorithm::AlgorithmDescriptor;
use crate::compartment::{Capabilities, Compartment, CompartmentHandle};
use crate::decompressor::Transport;
use crate::error::{Result, SigCompError};

/// 交给压缩算法的只读参数。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressionInfo {
    /// 需要在报头中回显给对端的反馈项。
    pub returned_feedback_item: Bytes,
    /// 是否需要重置算法上下文并重新发送字节码。
    pub reset_context: bool,
    /// 是否要求对端具备 RFC 3485 静态字典。
    pub static_dic_3485_mandatory: bool,
    /// 对端能力。
    pub remote: Capabilities,
    /// 自上次压缩以来对端能力是否变化。
    pub remote_capabilities_changed: bool,
    /// 对端已持有的状态标识（`[长度][标识]` 序列）。
    pub remote_state_ids: Bytes,
    /// 本端能力。
    pub local: Capabilities,
    /// 本端可供对端引用的状态标识（`[长度][标识前缀]` 序列）。
    pub local_state_ids: Bytes,
    /// 是否应在报文中通告本端能力。
    pub send_local_capabilities: bool,
    /// 是否应在报文中通告本端状态标识。
    pub send_local_state_ids: bool,
    /// 对端是否允许保留它之前创建的状态。
    pub keep_remote_states: bool,
    /// 本压缩舱已处理的对端报文数。
    pub incoming_messages: u64,
    /// 最近一次收到对端报文的时间。
    pub last_incoming_message: Option<Instant>,
}

impl CompressionInfo {
    pub(crate) fn collect(
        compartment: &Compartment,
        local_state_ids: Bytes,
        static_dic_3485_mandatory: bool,
    ) -> Self {
        Self {
            returned_feedback_item: Bytes::copy_from_slice(&compartment.returned_feedback),
            reset_context: compartment.send_bytecode,
            static_dic_3485_mandatory,
            remote: compartment.remote,
            remote_capabilities_changed: compartment.remote_capabilities_changed,
            remote_state_ids: Bytes::copy_from_slice(&compartment.remote_state_ids),
            local: compartment.local,
            local_state_ids,
            send_local_capabilities: compartment.send_local_capabilities,
            send_local_state_ids: compartment.send_local_state_ids,
            keep_remote_states: compartment.keep_remote_states,
            incoming_messages: compartment.incoming_messages,
            last_incoming_message: compartment.last_incoming_message,
        }
    }
}

/// 一次压缩调用的输入。
pub struct CompressionRequest<'a> {
    /// 目标压缩舱。
    pub compartment: CompartmentHandle,
    /// 算法描述。
    pub descriptor: &'a AlgorithmDescriptor,
    /// 打包后的参数。
    pub info: &'a CompressionInfo,
    /// 待压缩的明文。
    pub plain: &'a [u8],
    /// 报文将经由的传输方式。
    pub transport: Transport,
    /// 压缩舱独占的算法上下文，算法未声明上下文时为空切片。
    pub context: &'a mut [u8],
}

/// 一次压缩的结果。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressedMessage {
    /// 报文所属的压缩舱。
    pub compartment: CompartmentHandle,
    /// 完整的 SigComp 报文。
    pub data: Bytes,
}

/// 在已加锁的压缩舱上执行一次压缩。
pub(crate) fn compress(
    compartment: &mut Compartment,
    handle: CompartmentHandle,
    local_state_ids: Bytes,
    static_dic_3485_mandatory: bool,
    plain: &[u8],
    transport: Transport,
) -> Result<Bytes> {
    let info = CompressionInfo::collect(compartment, local_state_ids, static_dic_3485_mandatory);
    let algorithm = compartment.algorithm.clone();
    let mut empty = [0u8; 0];
    let context = match compartment.context.as_mut() {
        Some(buffer) => buffer.as_mut_slice(),
        None => &mut empty[..],
    };
    let mut request = CompressionRequest {
        compartment: handle,
        descriptor: &algorithm.descriptor,
        info: &info,
        plain,
        transport,
        context,
    };
    let output = algorithm
        .plugin
        .compress(&mut request)
        .map_err(|err| SigCompError::Algorithm {
            name: algorithm.descriptor.name.clone(),
            message: err.to_string(),
        })?;
    let carries_bytecode = output.first().is_some_and(|first| first & 0x03 == 0);
    if carries_bytecode && !compartment.send_bytecode {
        warn!(
            index = handle.index(),
            algorithm = %algorithm.descriptor.name,
            "bytecode uploaded although peer already holds it"
        );
    }
    compartment.returned_feedback.clear();
    compartment.send_bytecode = false;
    compartment.remote_capabilities_changed = false;
    debug!(
        index = handle.index(),
        plain = plain.len(),
        compressed = output.len(),
        "message compressed"
    );
    Ok(output)
}
