//! 集成测试共享的夹具：最小 UDVM 汇编器、报文拼装与回显算法插件。
//!
//! - 汇编器固定把字节码装载在 128，操作数编码与 RFC 3320 一致；
//! - [`EchoAlgorithm`] 生成的字节码把输入区逐字节原样输出，用于压缩、解压闭环测试。

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::{Bytes, BytesMut};
use spark_codec_sigcomp::algorithm::AlgorithmError;
use spark_codec_sigcomp::framing::encode_header;
use spark_codec_sigcomp::{
    AlgorithmDescriptor, CompartmentHandle, CompressionAlgorithm, CompressionInfo,
    CompressionRequest, HeaderBody, ManualClock, SigCompConfig, SigCompEngine,
};

pub const AND: u8 = 1;
pub const OR: u8 = 2;
pub const LOAD: u8 = 14;
pub const MULTILOAD: u8 = 15;
pub const COPY: u8 = 18;
pub const COPY_LITERAL: u8 = 19;
pub const MEMSET: u8 = 21;
pub const JUMP: u8 = 22;
pub const INPUT_BYTES: u8 = 28;
pub const STATE_ACCESS: u8 = 31;
pub const STATE_FREE: u8 = 33;
pub const OUTPUT: u8 = 34;
pub const END_MESSAGE: u8 = 35;

/// 字节码装载地址。
pub const BASE: u16 = 128;

#[derive(Default)]
pub struct Asm {
    pub code: Vec<u8>,
}

pub struct Fixup {
    at: usize,
    instr: u16,
}

impl Asm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn here(&self) -> u16 {
        BASE + self.code.len() as u16
    }

    pub fn op(&mut self, opcode: u8) -> u16 {
        let at = self.here();
        self.code.push(opcode);
        at
    }

    pub fn mt(&mut self, value: u16) -> &mut Self {
        if value < 64 {
            self.code.push(value as u8);
        } else {
            self.code.push(0x80);
            self.code.extend_from_slice(&value.to_be_bytes());
        }
        self
    }

    pub fn lit(&mut self, value: u16) -> &mut Self {
        if value < 128 {
            self.code.push(value as u8);
        } else {
            self.code.push(0xc0);
            self.code.extend_from_slice(&value.to_be_bytes());
        }
        self
    }

    pub fn reference(&mut self, addr: u16) -> &mut Self {
        if addr % 2 == 0 && addr / 2 < 128 {
            self.code.push((addr / 2) as u8);
        } else {
            self.code.push(0xc0);
            self.code.extend_from_slice(&addr.to_be_bytes());
        }
        self
    }

    pub fn to(&mut self, instr: u16, target: u16) -> &mut Self {
        self.code.push(0x80);
        self.code
            .extend_from_slice(&target.wrapping_sub(instr).to_be_bytes());
        self
    }

    pub fn forward(&mut self, instr: u16) -> Fixup {
        let at = self.code.len();
        self.code.extend_from_slice(&[0x80, 0, 0]);
        Fixup { at, instr }
    }

    pub fn bind(&mut self, fixup: Fixup) {
        let delta = self.here().wrapping_sub(fixup.instr);
        self.code[fixup.at + 1..fixup.at + 3].copy_from_slice(&delta.to_be_bytes());
    }

    pub fn load(&mut self, addr: u16, value: u16) {
        self.op(LOAD);
        self.mt(addr).mt(value);
    }

    /// 把若干 16 位字写入 `addr` 起始的内存。
    pub fn words(&mut self, addr: u16, words: &[u16]) {
        self.op(MULTILOAD);
        self.mt(addr).lit(words.len() as u16);
        for word in words {
            self.mt(*word);
        }
    }

    /// 把字节串写入 `addr`（奇数长度补 0）。
    pub fn bytes(&mut self, addr: u16, data: &[u8]) {
        let words: Vec<u16> = data
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair.get(1).copied().unwrap_or(0)]))
            .collect();
        self.words(addr, &words);
    }

    pub fn output(&mut self, start: u16, length: u16) {
        self.op(OUTPUT);
        self.mt(start).mt(length);
    }

    pub fn end(&mut self) {
        self.end_with(0, 0, [0; 5]);
    }

    /// END-MESSAGE：请求反馈位置、返回参数位置，以及
    /// `[长度, 地址, 指令, 最小访问长度, 保留优先级]`。
    pub fn end_with(&mut self, feedback: u16, returned: u16, save: [u16; 5]) {
        self.op(END_MESSAGE);
        self.mt(feedback).mt(returned);
        for operand in save {
            self.mt(operand);
        }
    }

    pub fn header_body(&self) -> HeaderBody {
        HeaderBody::Bytecode {
            code: Bytes::from(self.code.clone()),
            destination: BASE,
        }
    }

    /// 拼装成携带字节码的完整报文。
    pub fn message(&self, input: &[u8]) -> Vec<u8> {
        message(&[], &self.header_body(), input)
    }
}

/// 拼装报文：报头加输入区。
pub fn message(feedback: &[u8], body: &HeaderBody, input: &[u8]) -> Vec<u8> {
    let mut dst = BytesMut::new();
    encode_header(feedback, body, &mut dst).expect("生成报头");
    dst.extend_from_slice(input);
    dst.to_vec()
}

/// 回显字节码：逐字节读取输入区并原样输出，输入耗尽后结束。
pub fn echo_bytecode() -> Bytes {
    let mut asm = Asm::new();
    let top = asm.op(INPUT_BYTES);
    asm.mt(1).mt(300);
    let done = asm.forward(top);
    asm.output(300, 1);
    let jump = asm.op(JUMP);
    asm.to(jump, top);
    asm.bind(done);
    asm.end();
    Bytes::from(asm.code)
}

/// 回显算法：首条报文上传字节码，之后以 6 字节部分标识引用字节码状态。
#[derive(Default)]
pub struct EchoAlgorithm {
    pub initialized: AtomicUsize,
    pub ended: AtomicUsize,
    pub created: AtomicUsize,
    pub destructed: AtomicUsize,
    pub peer_messages: AtomicUsize,
    pub last_info: parking_lot::Mutex<Option<CompressionInfo>>,
}

impl EchoAlgorithm {
    pub const NAME: &'static str = "echo";

    pub fn descriptor() -> AlgorithmDescriptor {
        AlgorithmDescriptor {
            context_size: 16,
            ..AlgorithmDescriptor::new(Self::NAME, echo_bytecode())
        }
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl CompressionAlgorithm for EchoAlgorithm {
    fn compress(
        &self,
        request: &mut CompressionRequest<'_>,
    ) -> Result<Bytes, AlgorithmError> {
        request.context[0] = request.context[0].wrapping_add(1);
        *self.last_info.lock() = Some(request.info.clone());
        let body = if request.info.reset_context {
            HeaderBody::Bytecode {
                code: request.descriptor.decompression_bytecode.clone(),
                destination: request.descriptor.bytecode_address,
            }
        } else {
            let id = request.descriptor.bytecode_state_id();
            HeaderBody::StateId(Bytes::copy_from_slice(&id.as_bytes()[..6]))
        };
        let mut dst = BytesMut::new();
        encode_header(&request.info.returned_feedback_item, &body, &mut dst)?;
        dst.extend_from_slice(request.plain);
        Ok(dst.freeze())
    }

    fn on_algorithm_initialized(&self, _descriptor: &AlgorithmDescriptor) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
    }

    fn on_algorithm_ended(&self, _descriptor: &AlgorithmDescriptor) {
        self.ended.fetch_add(1, Ordering::SeqCst);
    }

    fn on_compartment_created(&self, _compartment: CompartmentHandle, context: &mut [u8]) {
        assert!(context.iter().all(|byte| *byte == 0));
        self.created.fetch_add(1, Ordering::SeqCst);
    }

    fn on_compartment_destructed(&self, _compartment: CompartmentHandle, _context: &mut [u8]) {
        self.destructed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_peer_message(&self, _compartment: CompartmentHandle, info: &CompressionInfo) {
        *self.last_info.lock() = Some(info.clone());
        self.peer_messages.fetch_add(1, Ordering::SeqCst);
    }
}

/// 以虚拟时钟构造引擎并注册回显算法。
pub fn engine_with(config: SigCompConfig) -> (SigCompEngine, ManualClock, Arc<EchoAlgorithm>) {
    let clock = ManualClock::new();
    let engine = SigCompEngine::with_clock(config, clock.clone()).expect("构造引擎");
    let plugin = Arc::new(EchoAlgorithm::default());
    engine
        .add_algorithm(EchoAlgorithm::descriptor(), plugin.clone())
        .expect("注册回显算法");
    (engine, clock, plugin)
}

pub fn engine() -> (SigCompEngine, ManualClock, Arc<EchoAlgorithm>) {
    engine_with(SigCompConfig::default())
}
