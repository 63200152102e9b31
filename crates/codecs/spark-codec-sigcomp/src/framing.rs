//! # SigComp 报头与流式转义
//!
//! # 模块角色（Why）
//! - 报头告诉解压端“从哪里拿字节码”：要么随报文上传，要么引用一个已保存的状态；
//! - 面向流的传输没有报文边界，需要用 `0xFF` 转义来标记报文结束。
//!
//! # 核心机制（How）
//! - 首字节 `11111 T LL`：`T` 表示携带回显反馈，`LL` 非零时后跟 `3 + 3 * LL` 字节的部分状态标识；
//! - `LL` 为零时后跟 12 位字节码长度与 4 位目的地址编码，目的地址为 `(编码 + 1) * 64`；
//! - 流式转义：`0xFF n`（`n <= 0x7F`）表示一个 `0xFF` 之后紧跟 `n` 个原样字节，`0xFF 0xFF` 表示报文结束。
//!
//! # 契约说明（What）
//! - 任何格式错误都报告为 [`FailureReason::MessageFormat`]；
//! - 生成报头时参数越界报告 [`SigCompError::BadParam`]。

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FailureReason, Result, SigCompError};

/// SigComp 报文首字节的固定前缀。
pub const SIGCOMP_PREFIX: u8 = 0xf8;

const T_BIT: u8 = 0x04;
const LEN_MASK: u8 = 0x03;
const MAX_BYTECODE_LEN: usize = 0x0fff;
const MAX_FEEDBACK_ITEM: usize = 0x7f;
const ESCAPE: u8 = 0xff;
const MAX_ESCAPED_RUN: usize = 0x7f;

/// 报头中字节码的来源。
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HeaderBody {
    /// 随报文上传的字节码及其装载地址。
    Bytecode {
        /// 字节码。
        code: Bytes,
        /// 装载地址，必须是 64 的倍数且位于 128..=1024。
        destination: u16,
    },
    /// 引用已保存状态的部分标识（6、9 或 12 字节）。
    StateId(Bytes),
}

/// 解析后的报文。
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct ParsedMessage {
    pub(crate) returned_feedback: Option<Bytes>,
    pub(crate) body: HeaderBody,
    pub(crate) input: Bytes,
    pub(crate) header_len: usize,
}

/// 判断首字节是否为 SigComp 报文。
pub fn is_sigcomp(message: &[u8]) -> bool {
    message.first().is_some_and(|first| first & SIGCOMP_PREFIX == SIGCOMP_PREFIX)
}

fn malformed() -> SigCompError {
    SigCompError::decompression(FailureReason::MessageFormat)
}

struct Cursor<'a> {
    message: &'a Bytes,
    pos: usize,
}

impl Cursor<'_> {
    fn byte(&mut self) -> Result<u8> {
        let byte = *self.message.get(self.pos).ok_or_else(malformed)?;
        self.pos += 1;
        Ok(byte)
    }

    fn take(&mut self, len: usize) -> Result<Bytes> {
        let end = self.pos.checked_add(len).ok_or_else(malformed)?;
        if end > self.message.len() {
            return Err(malformed());
        }
        let bytes = self.message.slice(self.pos..end);
        self.pos = end;
        Ok(bytes)
    }
}

/// 解析报头，输入区与原报文共享内存。
pub(crate) fn parse(message: &Bytes) -> Result<ParsedMessage> {
    let mut cursor = Cursor { message, pos: 0 };
    let first = cursor.byte()?;
    if first & SIGCOMP_PREFIX != SIGCOMP_PREFIX {
        return Err(malformed());
    }
    let returned_feedback = if first & T_BIT != 0 {
        let lead = cursor.byte()?;
        if usize::from(lead) <= MAX_FEEDBACK_ITEM {
            Some(Bytes::copy_from_slice(&[lead]))
        } else {
            Some(cursor.take(usize::from(lead & 0x7f))?)
        }
    } else {
        None
    };
    let body = match first & LEN_MASK {
        0 => {
            let high = cursor.byte()?;
            let low = cursor.byte()?;
            let code_len = (usize::from(high) << 4) | usize::from(low >> 4);
            let nibble = low & 0x0f;
            if nibble == 0 || code_len == 0 {
                return Err(malformed());
            }
            HeaderBody::Bytecode {
                code: cursor.take(code_len)?,
                destination: (u16::from(nibble) + 1) * 64,
            }
        }
        len => HeaderBody::StateId(cursor.take(3 + 3 * usize::from(len))?),
    };
    let header_len = cursor.pos;
    Ok(ParsedMessage {
        returned_feedback,
        body,
        input: message.slice(header_len..),
        header_len,
    })
}

/// 写出报头（不含压缩数据）。
///
/// `requested_feedback` 为空时不设置 `T` 位。
pub fn encode_header(requested_feedback: &[u8], body: &HeaderBody, dst: &mut BytesMut) -> Result<()> {
    if requested_feedback.len() > MAX_FEEDBACK_ITEM {
        return Err(SigCompError::bad_param("feedback item longer than 127 bytes"));
    }
    let mut first = SIGCOMP_PREFIX;
    if !requested_feedback.is_empty() {
        first |= T_BIT;
    }
    match body {
        HeaderBody::StateId(partial) => {
            let len = match partial.len() {
                6 => 1,
                9 => 2,
                12 => 3,
                _ => return Err(SigCompError::bad_param("partial state id must be 6, 9 or 12 bytes")),
            };
            dst.put_u8(first | len);
            put_feedback(requested_feedback, dst);
            dst.put_slice(partial);
        }
        HeaderBody::Bytecode { code, destination } => {
            if code.is_empty() || code.len() > MAX_BYTECODE_LEN {
                return Err(SigCompError::bad_param("bytecode length outside 1..=4095"));
            }
            if destination % 64 != 0 || !(128..=1024).contains(destination) {
                return Err(SigCompError::bad_param(
                    "destination must be a multiple of 64 within 128..=1024",
                ));
            }
            let nibble = (destination / 64 - 1) as u8;
            dst.put_u8(first);
            put_feedback(requested_feedback, dst);
            dst.put_u8((code.len() >> 4) as u8);
            dst.put_u8((((code.len() & 0x0f) as u8) << 4) | nibble);
            dst.put_slice(code);
        }
    }
    Ok(())
}

fn put_feedback(item: &[u8], dst: &mut BytesMut) {
    match item {
        [] => {}
        [single] if usize::from(*single) <= MAX_FEEDBACK_ITEM => dst.put_u8(*single),
        _ => {
            dst.put_u8(0x80 | item.len() as u8);
            dst.put_slice(item);
        }
    }
}

/// 从流中取出第一条报文并去除转义，返回报文与消耗的字节数。
pub fn stream_to_message(stream: &[u8]) -> Result<(Bytes, usize)> {
    let mut out = BytesMut::with_capacity(stream.len());
    let mut pos = 0;
    while pos < stream.len() {
        let byte = stream[pos];
        if byte != ESCAPE {
            out.put_u8(byte);
            pos += 1;
            continue;
        }
        let count = *stream.get(pos + 1).ok_or_else(malformed)?;
        if count == ESCAPE {
            return Ok((out.freeze(), pos + 2));
        }
        let count = usize::from(count);
        if count > MAX_ESCAPED_RUN {
            return Err(malformed());
        }
        let run = stream.get(pos + 2..pos + 2 + count).ok_or_else(malformed)?;
        out.put_u8(ESCAPE);
        out.put_slice(run);
        pos += 2 + count;
    }
    Err(malformed())
}

/// 转义报文并追加结束标记。
pub fn message_to_stream(message: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(message.len() + 4);
    let mut pos = 0;
    while pos < message.len() {
        let byte = message[pos];
        pos += 1;
        if byte != ESCAPE {
            out.put_u8(byte);
            continue;
        }
        let count = (message.len() - pos).min(MAX_ESCAPED_RUN);
        out.put_u8(ESCAPE);
        out.put_u8(count as u8);
        out.put_slice(&message[pos..pos + count]);
        pos += count;
    }
    out.put_u8(ESCAPE);
    out.put_u8(ESCAPE);
    out.freeze()
}
