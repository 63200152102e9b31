use bytes::Bytes;

use super::*;
use crate::config::SigCompConfig;
use crate::crc::{FCS16_INIT, fcs16};
use crate::digest::{StateId, compute_sha1};
use crate::error::Result;
use crate::state::{SaveOutcome, StateMeta};

const LOAD: u8 = 14;
const MULTILOAD: u8 = 15;
const ADD: u8 = 6;
const SUBTRACT: u8 = 7;
const MULTIPLY: u8 = 8;
const DIVIDE: u8 = 9;
const LSHIFT: u8 = 4;
const SORT_ASCENDING: u8 = 11;
const SHA1: u8 = 13;
const PUSH: u8 = 16;
const POP: u8 = 17;
const COPY_LITERAL: u8 = 19;
const COPY_OFFSET: u8 = 20;
const MEMSET: u8 = 21;
const JUMP: u8 = 22;
const COMPARE: u8 = 23;
const CALL: u8 = 24;
const RETURN: u8 = 25;
const SWITCH: u8 = 26;
const CRC: u8 = 27;
const INPUT_BYTES: u8 = 28;
const INPUT_BITS: u8 = 29;
const INPUT_HUFFMAN: u8 = 30;
const STATE_ACCESS: u8 = 31;
const STATE_CREATE: u8 = 32;
const STATE_FREE: u8 = 33;
const OUTPUT: u8 = 34;
const END_MESSAGE: u8 = 35;

/// 测试用的最小汇编器，字节码固定装载在 128。
struct Asm {
    code: Vec<u8>,
}

struct Fixup {
    at: usize,
    instr: u16,
}

impl Asm {
    const BASE: u16 = 128;

    fn new() -> Self {
        Self { code: Vec::new() }
    }

    fn here(&self) -> u16 {
        Self::BASE + self.code.len() as u16
    }

    fn op(&mut self, opcode: u8) -> u16 {
        let at = self.here();
        self.code.push(opcode);
        at
    }

    fn mt(&mut self, value: u16) -> &mut Self {
        if value < 64 {
            self.code.push(value as u8);
        } else {
            self.code.push(0x80);
            self.code.extend_from_slice(&value.to_be_bytes());
        }
        self
    }

    /// multitype 间接寻址：`01nnnnnn` 读取 `memory[2N]`。
    fn mem(&mut self, addr: u16) -> &mut Self {
        assert!(addr % 2 == 0 && addr / 2 < 64);
        self.code.push(0x40 | (addr / 2) as u8);
        self
    }

    fn lit(&mut self, value: u16) -> &mut Self {
        if value < 128 {
            self.code.push(value as u8);
        } else {
            self.code.push(0xc0);
            self.code.extend_from_slice(&value.to_be_bytes());
        }
        self
    }

    fn reference(&mut self, addr: u16) -> &mut Self {
        if addr % 2 == 0 && addr / 2 < 128 {
            self.code.push((addr / 2) as u8);
        } else {
            self.code.push(0xc0);
            self.code.extend_from_slice(&addr.to_be_bytes());
        }
        self
    }

    fn to(&mut self, instr: u16, target: u16) -> &mut Self {
        self.code.push(0x80);
        self.code
            .extend_from_slice(&target.wrapping_sub(instr).to_be_bytes());
        self
    }

    fn forward(&mut self, instr: u16) -> Fixup {
        let at = self.code.len();
        self.code.extend_from_slice(&[0x80, 0, 0]);
        Fixup { at, instr }
    }

    fn bind(&mut self, fixup: Fixup) {
        let delta = self.here().wrapping_sub(fixup.instr);
        self.code[fixup.at + 1..fixup.at + 3].copy_from_slice(&delta.to_be_bytes());
    }

    fn load(&mut self, addr: u16, value: u16) {
        self.op(LOAD);
        self.mt(addr).mt(value);
    }

    fn output(&mut self, start: u16, length: u16) {
        self.op(OUTPUT);
        self.mt(start).mt(length);
    }

    fn end(&mut self) {
        self.op(END_MESSAGE);
        for _ in 0..7 {
            self.mt(0);
        }
    }

    fn fail(&mut self) {
        self.op(0);
    }
}

fn store() -> StateStore {
    StateStore::new(&SigCompConfig::default())
}

fn setup(input: &[u8]) -> UdvmSetup {
    UdvmSetup {
        memory_size: 4096,
        cycles_per_bit: 16,
        output_capacity: 4096,
        input: Bytes::copy_from_slice(input),
    }
}

fn run_with(asm: &Asm, input: &[u8], cycles: u64) -> (Udvm, std::result::Result<Completion, Postmortem>) {
    let store = store();
    let mut udvm = Udvm::from_code(setup(input), &asm.code, Asm::BASE).expect("装载字节码");
    let result = udvm.run(cycles, &store);
    (udvm, result)
}

fn run(asm: &Asm) -> (Udvm, std::result::Result<Completion, Postmortem>) {
    run_with(asm, &[], 10_000)
}

fn finished_output(asm: &Asm) -> Vec<u8> {
    let (udvm, result) = run(asm);
    assert_eq!(result, Ok(Completion::Finished));
    udvm.output().to_vec()
}

#[test]
fn header_is_initialised() {
    let mut asm = Asm::new();
    asm.output(0, 10);
    asm.end();
    assert_eq!(finished_output(&asm), vec![0x10, 0x00, 0, 16, 0, 1, 0, 0, 0, 0]);
}

#[test]
fn load_output_end_finishes_with_bytes() {
    let mut asm = Asm::new();
    asm.load(32, 0x4142);
    asm.output(32, 2);
    asm.end();
    assert_eq!(finished_output(&asm), b"AB");
}

#[test]
fn arithmetic_wraps_at_sixteen_bits() {
    let mut asm = Asm::new();
    asm.load(32, 6);
    asm.op(ADD);
    asm.reference(32).mt(4);
    asm.op(MULTIPLY);
    asm.reference(32).mt(3);
    asm.op(LSHIFT);
    asm.reference(32).mt(1);
    asm.op(SUBTRACT);
    asm.reference(32).mt(70);
    asm.output(32, 2);
    asm.end();
    assert_eq!(finished_output(&asm), vec![0xff, 0xf6]);
}

#[test]
fn division_by_zero_reports_postmortem() {
    let mut asm = Asm::new();
    asm.load(32, 10);
    let divide_at = asm.op(DIVIDE);
    asm.reference(32).mt(0);
    asm.end();
    let (_, result) = run(&asm);
    let postmortem = result.expect_err("除零必须失败");
    assert_eq!(postmortem.reason, FailureReason::ZeroDivision);
    assert_eq!(postmortem.program_counter, divide_at);
    assert_eq!(postmortem.last_opcode, DIVIDE);
    assert_eq!(postmortem.total_instructions, 1);
}

#[test]
fn illegal_opcode_fails() {
    let mut asm = Asm::new();
    asm.op(36);
    let (_, result) = run(&asm);
    assert_eq!(
        result.expect_err("未定义指令").reason,
        FailureReason::IllegalInstruction
    );
}

#[test]
fn call_return_and_stack() {
    let mut asm = Asm::new();
    asm.load(70, 500);
    asm.op(PUSH);
    asm.mt(0x41);
    let call_at = asm.op(CALL);
    let sub = asm.forward(call_at);
    asm.op(POP);
    asm.mt(32);
    asm.output(32, 4);
    asm.end();
    asm.bind(sub);
    asm.load(34, 0x4243);
    asm.op(RETURN);
    assert_eq!(finished_output(&asm), vec![0, 0x41, 0x42, 0x43]);
}

#[test]
fn pop_on_empty_stack_underflows() {
    let mut asm = Asm::new();
    asm.load(70, 500);
    asm.op(POP);
    asm.mt(32);
    asm.end();
    let (_, result) = run(&asm);
    assert_eq!(
        result.expect_err("空栈弹出").reason,
        FailureReason::StackUnderflow
    );
}

#[test]
fn compare_selects_branch() {
    let mut asm = Asm::new();
    asm.load(32, 5);
    let at = asm.op(COMPARE);
    asm.mem(32).mt(7);
    let less = asm.forward(at);
    let equal = asm.forward(at);
    let greater = asm.forward(at);
    asm.bind(equal);
    asm.bind(greater);
    asm.fail();
    asm.bind(less);
    asm.end();
    assert!(finished_output(&asm).is_empty());
}

#[test]
fn switch_jumps_by_index_and_rejects_out_of_range() {
    let build = |selector: u16| {
        let mut asm = Asm::new();
        asm.load(32, selector);
        let at = asm.op(SWITCH);
        asm.lit(2).mem(32);
        let first = asm.forward(at);
        let second = asm.forward(at);
        asm.bind(first);
        asm.fail();
        asm.bind(second);
        asm.end();
        asm
    };
    assert!(finished_output(&build(1)).is_empty());
    let (_, result) = run(&build(5));
    assert_eq!(
        result.expect_err("越界选择").reason,
        FailureReason::IllegalOperand
    );
}

#[test]
fn copy_literal_wraps_inside_cyclic_buffer() {
    let mut asm = Asm::new();
    asm.load(64, 300);
    asm.load(66, 304);
    asm.load(400, 0x5758);
    asm.load(402, 0x595a);
    asm.load(32, 302);
    asm.op(COPY_LITERAL);
    asm.mt(400).mt(4).reference(32);
    asm.output(300, 4);
    asm.output(32, 2);
    asm.end();
    assert_eq!(finished_output(&asm), vec![b'Y', b'Z', b'W', b'X', 0x01, 0x2e]);
}

#[test]
fn copy_offset_repeats_overlapping_pattern() {
    let mut asm = Asm::new();
    asm.load(200, 0x6162);
    asm.load(32, 202);
    asm.op(COPY_OFFSET);
    asm.mt(2).mt(6).reference(32);
    asm.output(200, 8);
    asm.output(32, 2);
    asm.end();
    assert_eq!(finished_output(&asm), b"abababab\x00\xd0");
}

#[test]
fn memset_steps_by_offset() {
    let mut asm = Asm::new();
    asm.op(MEMSET);
    asm.mt(200).mt(5).mt(1).mt(2);
    asm.output(200, 5);
    asm.end();
    assert_eq!(finished_output(&asm), vec![1, 3, 5, 7, 9]);
}

#[test]
fn sort_permutes_all_lists_by_first() {
    let mut asm = Asm::new();
    asm.op(MULTILOAD);
    asm.mt(300).lit(6).mt(3).mt(1).mt(2).mt(30).mt(10).mt(20);
    asm.op(SORT_ASCENDING);
    asm.mt(300).mt(2).mt(3);
    asm.output(300, 12);
    asm.end();
    assert_eq!(
        finished_output(&asm),
        vec![0, 1, 0, 2, 0, 3, 0, 10, 0, 20, 0, 30]
    );
}

#[test]
fn multiload_over_itself_is_rejected() {
    let mut asm = Asm::new();
    asm.op(MULTILOAD);
    asm.mt(Asm::BASE).lit(1).mt(5);
    asm.end();
    let (_, result) = run(&asm);
    assert_eq!(
        result.expect_err("覆盖自身").reason,
        FailureReason::MemoryAccess
    );
}

#[test]
fn sha1_writes_digest() {
    let mut asm = Asm::new();
    asm.load(200, 0x6162);
    asm.load(202, 0x6300);
    asm.op(SHA1);
    asm.mt(200).mt(3).mt(300);
    asm.output(300, 20);
    asm.end();
    assert_eq!(finished_output(&asm), compute_sha1(b"abc").to_vec());
}

#[test]
fn crc_match_falls_through() {
    let crc = fcs16(FCS16_INIT, b"12");
    let build = |value: u16| {
        let mut asm = Asm::new();
        asm.load(200, 0x3132);
        let at = asm.op(CRC);
        asm.mt(value).mt(200).mt(2);
        let bad = asm.forward(at);
        asm.end();
        asm.bind(bad);
        asm.fail();
        asm
    };
    assert!(finished_output(&build(crc)).is_empty());
    let (_, result) = run(&build(crc ^ 1));
    assert_eq!(result.expect_err("校验失败").reason, FailureReason::Unknown);
}

#[test]
fn input_bytes_copies_and_grants_cycles() {
    let mut asm = Asm::new();
    let at = asm.op(INPUT_BYTES);
    asm.mt(5).mt(200);
    let short = asm.forward(at);
    asm.output(200, 5);
    asm.end();
    asm.bind(short);
    asm.fail();
    let (udvm, result) = run_with(&asm, b"hello", 4);
    assert_eq!(result, Ok(Completion::Finished));
    assert_eq!(udvm.output(), b"hello");

    let (_, result) = run_with(&asm, b"hi", 100);
    assert_eq!(result.expect_err("输入不足").reason, FailureReason::Unknown);
}

#[test]
fn input_bits_honours_bit_order() {
    let mut asm = Asm::new();
    let first = asm.op(INPUT_BITS);
    asm.mt(4).mt(32);
    let fail_a = asm.forward(first);
    let second = asm.op(INPUT_BITS);
    asm.mt(4).mt(34);
    let fail_b = asm.forward(second);
    asm.load(68, 4);
    let third = asm.op(INPUT_BITS);
    asm.mt(3).mt(36);
    let fail_c = asm.forward(third);
    let fourth = asm.op(INPUT_BITS);
    asm.mt(16).mt(38);
    let underflow = asm.forward(fourth);
    asm.fail();
    asm.bind(underflow);
    asm.output(32, 6);
    asm.end();
    asm.bind(fail_a);
    asm.bind(fail_b);
    asm.bind(fail_c);
    asm.fail();
    let (udvm, result) = run_with(&asm, &[0xa5, 0x80], 200);
    assert_eq!(result, Ok(Completion::Finished));
    assert_eq!(udvm.output(), &[0, 0xa, 0, 5, 0, 1]);
}

#[test]
fn input_huffman_accumulates_until_bounds_match() {
    let mut asm = Asm::new();
    let at = asm.op(INPUT_HUFFMAN);
    asm.mt(32);
    let short = asm.forward(at);
    asm.lit(2);
    asm.mt(1).mt(0).mt(0).mt(u16::from(b'a'));
    asm.mt(1).mt(2).mt(2).mt(u16::from(b'b'));
    asm.output(33, 1);
    asm.end();
    asm.bind(short);
    asm.fail();
    let (udvm, result) = run_with(&asm, &[0b1000_0000], 200);
    assert_eq!(result, Ok(Completion::Finished));
    assert_eq!(udvm.output(), b"b");

    let (_, result) = run_with(&asm, &[0b1100_0000], 200);
    assert_eq!(
        result.expect_err("无匹配分组").reason,
        FailureReason::HuffmanMatch
    );
}

#[test]
fn input_bits_underflow_leaves_input_for_shorter_read() {
    let mut asm = Asm::new();
    let wide = asm.op(INPUT_BITS);
    asm.mt(12).mt(32);
    let retry = asm.forward(wide);
    asm.fail();
    asm.bind(retry);
    let narrow = asm.op(INPUT_BITS);
    asm.mt(8).mt(34);
    let short = asm.forward(narrow);
    asm.output(34, 2);
    asm.end();
    asm.bind(short);
    asm.fail();
    let (udvm, result) = run_with(&asm, &[0xab], 200);
    assert_eq!(result, Ok(Completion::Finished));
    assert_eq!(udvm.output(), &[0, 0xab]);
}

#[test]
fn input_huffman_underflow_jumps_before_later_groups() {
    let mut asm = Asm::new();
    let at = asm.op(INPUT_HUFFMAN);
    asm.mt(32);
    let short = asm.forward(at);
    asm.lit(2);
    asm.mt(4).mt(0).mt(15).mt(0x100);
    asm.code.push(0x82);
    asm.mt(0).mt(0).mt(0);
    asm.fail();
    asm.bind(short);
    asm.load(34, 0x4f4b);
    asm.output(34, 2);
    asm.end();
    let (udvm, result) = run_with(&asm, &[], 200);
    assert_eq!(result, Ok(Completion::Finished));
    assert_eq!(udvm.output(), b"OK");
}

#[test]
fn input_huffman_skips_groups_after_match() {
    let mut asm = Asm::new();
    let at = asm.op(INPUT_HUFFMAN);
    asm.mt(32);
    let short = asm.forward(at);
    asm.lit(3);
    asm.mt(2).mt(0).mt(3).mt(u16::from(b'w'));
    asm.mt(2).mt(16).mt(31).mt(u16::from(b'x'));
    asm.mt(13).mt(0).mt(0).mt(0);
    asm.output(33, 1);
    asm.end();
    asm.bind(short);
    asm.fail();
    let (udvm, result) = run_with(&asm, &[0b1000_0000], 200);
    assert_eq!(result, Ok(Completion::Finished));
    assert_eq!(udvm.output(), b"y");
}

#[test]
fn endless_loop_exhausts_cycles() {
    let mut asm = Asm::new();
    let at = asm.op(JUMP);
    asm.to(at, at);
    let (udvm, result) = run_with(&asm, &[], 50);
    let postmortem = result.expect_err("死循环必须失败");
    assert_eq!(postmortem.reason, FailureReason::CyclesExceeded);
    assert_eq!(udvm.total_cycles(), 50);
}

#[test]
fn end_message_cost_can_exceed_budget() {
    let mut asm = Asm::new();
    asm.op(END_MESSAGE);
    asm.mt(0).mt(0).mt(200).mt(300).mt(0).mt(6).mt(1);
    let (_, result) = run_with(&asm, &[], 10);
    assert_eq!(
        result.expect_err("超出预算").reason,
        FailureReason::CyclesExceeded
    );
}

#[test]
fn state_access_copies_stored_state() {
    let store = store();
    let data = Bytes::from_static(b"dictionary!!");
    let id = StateId::for_state(&data, 300, 0, 6);
    store
        .save_permanent(
            StateMeta {
                id,
                address: 300,
                instruction: 0,
                minimum_access_length: 6,
                retention_priority: 0,
            },
            data.clone(),
        )
        .expect("保存字典");
    let bytes = id.as_bytes();
    let mut asm = Asm::new();
    asm.op(MULTILOAD);
    asm.mt(200).lit(3);
    for pair in bytes[..6].chunks(2) {
        asm.mt(u16::from_be_bytes([pair[0], pair[1]]));
    }
    asm.op(STATE_ACCESS);
    asm.mt(200).mt(6).mt(0).mt(0).mt(0).mt(0);
    asm.output(300, data.len() as u16);
    asm.end();
    let mut udvm = Udvm::from_code(setup(&[]), &asm.code, Asm::BASE).expect("装载");
    assert_eq!(udvm.run(10_000, &store), Ok(Completion::Finished));
    assert_eq!(udvm.output(), &data[..]);

    let mut udvm = Udvm::from_code(setup(&[]), &asm.code, Asm::BASE).expect("装载");
    assert_eq!(
        udvm.run(10_000, &StateStore::new(&SigCompConfig::default()))
            .expect_err("状态不存在")
            .reason,
        FailureReason::StateAccess
    );
}

#[test]
fn from_state_runs_stored_bytecode_and_honours_min_access() {
    let store = store();
    let mut asm = Asm::new();
    asm.load(32, 0x4f4b);
    asm.output(32, 2);
    asm.end();
    let code = Bytes::from(asm.code.clone());
    let id = StateId::for_state(&code, Asm::BASE, Asm::BASE, 12);
    store
        .save_permanent(
            StateMeta {
                id,
                address: Asm::BASE,
                instruction: Asm::BASE,
                minimum_access_length: 12,
                retention_priority: 0,
            },
            code,
        )
        .expect("保存字节码状态");

    let err = Udvm::from_state(setup(&[]), &id.as_bytes()[..6], &store)
        .expect_err("6 字节不足最小访问长度");
    assert_eq!(err.failure_reason(), Some(FailureReason::StateAccess));

    let mut udvm =
        Udvm::from_state(setup(&[]), &id.as_bytes()[..12], &store).expect("12 字节可访问");
    assert_eq!(udvm.run(10_000, &store), Ok(Completion::Finished));
    assert_eq!(udvm.output(), b"OK");
}

#[test]
fn code_larger_than_memory_fails_to_load() {
    let err = Udvm::from_code(
        UdvmSetup {
            memory_size: 256,
            ..setup(&[])
        },
        &[0u8; 200],
        128,
    )
    .expect_err("越界装载");
    assert_eq!(err.failure_reason(), Some(FailureReason::MemoryAccess));
}

/// 记录提交内容的目标，保存动作落到真实的状态存储上。
struct RecordingTarget {
    store: StateStore,
    sms: usize,
    capabilities: Vec<(u8, u8)>,
    remote_ids: Vec<u8>,
    feedback: Option<(bool, bool, Option<Vec<u8>>)>,
    saved: Vec<(SaveAdmission, Vec<u8>)>,
    freed: Vec<Vec<u8>>,
}

impl RecordingTarget {
    fn new(sms: usize) -> Self {
        Self {
            store: store(),
            sms,
            capabilities: Vec::new(),
            remote_ids: Vec::new(),
            feedback: None,
            saved: Vec::new(),
            freed: Vec::new(),
        }
    }
}

impl FinalizeTarget for RecordingTarget {
    fn local_state_memory_size(&self) -> usize {
        self.sms
    }

    fn update_peer_capabilities(&mut self, packed: u8, version: u8) -> usize {
        self.capabilities.push((packed, version));
        REMOTE_STATE_IDS_CAPACITY
    }

    fn set_remote_state_ids(&mut self, ids: &[u8]) {
        self.remote_ids = ids.to_vec();
    }

    fn forward_requested_feedback(
        &mut self,
        keep_remote_states: bool,
        send_local_ids: bool,
        item: Option<&[u8]>,
    ) -> Result<()> {
        self.feedback = Some((keep_remote_states, send_local_ids, item.map(<[u8]>::to_vec)));
        Ok(())
    }

    fn save_state(
        &mut self,
        admission: SaveAdmission,
        content: &CyclicRegion<'_>,
    ) -> Result<SaveOutcome> {
        let mut data = vec![0u8; admission.length];
        crate::state::StateContent::write_to(content, &mut data);
        self.saved.push((admission, data));
        let draft = self.store.create(admission.length)?;
        self.store.save(
            draft,
            StateMeta {
                id: admission.id,
                address: admission.address,
                instruction: admission.instruction,
                minimum_access_length: admission.minimum_access_length,
                retention_priority: admission.retention_priority,
            },
            content,
        )
    }

    fn remove_state(&mut self, partial_id: &[u8]) -> Result<()> {
        self.freed.push(partial_id.to_vec());
        Ok(())
    }
}

#[test]
fn end_message_save_waits_and_finalizes_with_digest() {
    let mut asm = Asm::new();
    asm.load(200, 0x7374);
    asm.load(202, 0x6174);
    asm.op(END_MESSAGE);
    asm.mt(0).mt(0).mt(4).mt(200).mt(0).mt(6).mt(1);
    let (mut udvm, result) = run(&asm);
    assert_eq!(result, Ok(Completion::Waiting));
    let mut target = RecordingTarget::new(2048);
    udvm.finalize(&mut target);
    assert_eq!(target.saved.len(), 1);
    let (admission, data) = &target.saved[0];
    assert_eq!(data, b"stat");
    assert_eq!(admission.id, StateId::for_state(b"stat", 200, 0, 6));
    assert!(target.store.get(&admission.id.as_bytes()[..6], false).is_ok());
}

#[test]
fn save_is_clamped_to_local_state_memory() {
    let mut asm = Asm::new();
    asm.op(STATE_CREATE);
    asm.mt(100).mt(200).mt(0).mt(6).mt(1);
    asm.end();
    let (mut udvm, result) = run(&asm);
    assert_eq!(result, Ok(Completion::Waiting));
    let mut target = RecordingTarget::new(64 + 10);
    udvm.finalize(&mut target);
    assert_eq!(target.saved[0].0.length, 10);

    let (mut udvm, _) = run(&asm);
    let mut tiny = RecordingTarget::new(32);
    udvm.finalize(&mut tiny);
    assert!(tiny.saved.is_empty());
}

#[test]
fn state_free_reads_partial_id_at_finalize() {
    let mut asm = Asm::new();
    asm.op(MULTILOAD);
    asm.mt(300).lit(3).mt(0x0102).mt(0x0304).mt(0x0506);
    asm.op(STATE_FREE);
    asm.mt(300).mt(6);
    asm.end();
    let (mut udvm, result) = run(&asm);
    assert_eq!(result, Ok(Completion::Waiting));
    let mut target = RecordingTarget::new(2048);
    udvm.finalize(&mut target);
    assert_eq!(target.freed, vec![vec![1, 2, 3, 4, 5, 6]]);
}

#[test]
fn returned_parameters_and_requested_feedback_are_forwarded() {
    let mut asm = Asm::new();
    // 返回参数：能力字节 0x4a、版本 1，随后一个 6 字节标识，最后以 0 结束。
    asm.op(MULTILOAD);
    asm.mt(400)
        .lit(5)
        .mt(0x4a01)
        .mt(0x06aa)
        .mt(0xbbcc)
        .mt(0xddee)
        .mt(0xff00);
    // 请求反馈：Q|S，反馈项为单字节 0x05。
    asm.load(450, 0x0605);
    asm.op(END_MESSAGE);
    asm.mt(450).mt(400).mt(0).mt(0).mt(0).mt(0).mt(0);
    let (mut udvm, result) = run(&asm);
    assert_eq!(result, Ok(Completion::Waiting));
    let mut target = RecordingTarget::new(2048);
    udvm.finalize(&mut target);
    assert_eq!(target.capabilities, vec![(0x4a, 0x01)]);
    assert_eq!(target.remote_ids, vec![6, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
    assert_eq!(target.feedback, Some((false, true, Some(vec![5]))));
}

#[test]
fn output_beyond_capacity_fails() {
    let mut asm = Asm::new();
    asm.output(0, 64);
    asm.end();
    let store = store();
    let mut udvm = Udvm::from_code(
        UdvmSetup {
            output_capacity: 16,
            ..setup(&[])
        },
        &asm.code,
        Asm::BASE,
    )
    .expect("装载");
    assert_eq!(
        udvm.run(10_000, &store).expect_err("输出溢出").reason,
        FailureReason::Resources
    );
}
