//! 指令执行。
//!
//! 每个处理函数先解码全部操作数，再修改内存与寄存器。非跳转类指令执行完后 `pc` 指向下一条指令。

use tracing::trace;

use crate::crc::{FCS16_INIT, fcs16};
use crate::digest::{MIN_PARTIAL_ID_LEN, STATE_ID_LEN, compute_sha1};
use crate::error::FailureReason;
use crate::state::StateStore;

use super::cyclic::Cyclic;
use super::input::reverse_bits;
use super::memory::{INPUT_BIT_ORDER, STACK_LOCATION};
use super::opcode::Opcode;
use super::operand::Cursor;
use super::request::{FreeRequest, SaveRequest};
use super::{Completion, Step, Udvm};

/// `input_bit_order` 中的 P 位：输入字节按 LSB 优先取位。
const BIT_ORDER_P: u16 = 0x1;
/// H 位：Huffman 码值按 LSB 优先解释。
const BIT_ORDER_H: u16 = 0x2;
/// F 位：INPUT-BITS 结果按 LSB 优先解释。
const BIT_ORDER_F: u16 = 0x4;

impl Udvm {
    pub(super) fn step(&mut self, store: &StateStore) -> Step<()> {
        let pc = self.pc;
        let opcode = Opcode::try_from(self.memory.read_u8(usize::from(pc))?)?;
        trace!(pc, opcode = opcode.mnemonic(), "udvm step");
        let ops = Cursor::after_opcode(pc);
        match opcode {
            Opcode::DecompressionFailure => Err(FailureReason::Unknown),
            Opcode::And
            | Opcode::Or
            | Opcode::Not
            | Opcode::Lshift
            | Opcode::Rshift
            | Opcode::Add
            | Opcode::Subtract
            | Opcode::Multiply
            | Opcode::Divide
            | Opcode::Remainder => self.arithmetic(opcode, ops),
            Opcode::SortAscending => self.sort(false, ops),
            Opcode::SortDescending => self.sort(true, ops),
            Opcode::Sha1 => self.sha1(ops),
            Opcode::Load => self.load_value(ops),
            Opcode::Multiload => self.multiload(ops),
            Opcode::Push => self.push_instr(ops),
            Opcode::Pop => self.pop_instr(ops),
            Opcode::Copy => self.copy(ops),
            Opcode::CopyLiteral => self.copy_literal(ops),
            Opcode::CopyOffset => self.copy_offset(ops),
            Opcode::Memset => self.memset(ops),
            Opcode::Jump => self.jump(ops),
            Opcode::Compare => self.compare(ops),
            Opcode::Call => self.call(ops),
            Opcode::Return => self.return_instr(),
            Opcode::Switch => self.switch(ops),
            Opcode::Crc => self.crc(ops),
            Opcode::InputBytes => self.input_bytes(ops),
            Opcode::InputBits => self.input_bits(ops),
            Opcode::InputHuffman => self.input_huffman(ops),
            Opcode::StateAccess => self.state_access(ops, store),
            Opcode::StateCreate => self.state_create(ops),
            Opcode::StateFree => self.state_free(ops),
            Opcode::Output => self.output_instr(ops),
            Opcode::EndMessage => self.end_message(ops),
        }
    }

    fn arithmetic(&mut self, opcode: Opcode, mut ops: Cursor) -> Step<()> {
        let target = ops.reference(&self.memory)?;
        let operand = if opcode == Opcode::Not {
            0
        } else {
            ops.multitype(&self.memory)?
        };
        let value = self.memory.read_u16(target)?;
        let result = match opcode {
            Opcode::And => value & operand,
            Opcode::Or => value | operand,
            Opcode::Not => !value,
            Opcode::Lshift => value.checked_shl(u32::from(operand)).unwrap_or(0),
            Opcode::Rshift => value.checked_shr(u32::from(operand)).unwrap_or(0),
            Opcode::Add => value.wrapping_add(operand),
            Opcode::Subtract => value.wrapping_sub(operand),
            Opcode::Multiply => value.wrapping_mul(operand),
            Opcode::Divide => value
                .checked_div(operand)
                .ok_or(FailureReason::ZeroDivision)?,
            Opcode::Remainder => value
                .checked_rem(operand)
                .ok_or(FailureReason::ZeroDivision)?,
            _ => return Err(FailureReason::IllegalInstruction),
        };
        self.memory.write_u16(target, result)?;
        self.pc = ops.next_pc();
        Ok(())
    }

    /// 按第一个列表稳定排序，其余列表施加同一置换。
    fn sort(&mut self, descending: bool, mut ops: Cursor) -> Step<()> {
        let start = usize::from(ops.multitype(&self.memory)?);
        let lists = usize::from(ops.multitype(&self.memory)?);
        let length = usize::from(ops.multitype(&self.memory)?);
        let bytes = 2 * lists * length;
        let original = self.memory.slice(start, bytes)?.to_vec();
        if lists > 0 && length > 1 {
            let word = |list: usize, i: usize| {
                let at = 2 * (list * length + i);
                u16::from_be_bytes([original[at], original[at + 1]])
            };
            let mut order: Vec<usize> = (0..length).collect();
            if descending {
                order.sort_by(|a, b| word(0, *b).cmp(&word(0, *a)));
            } else {
                order.sort_by_key(|i| word(0, *i));
            }
            let region = self.memory.slice_mut(start, bytes)?;
            for list in 0..lists {
                for (dst, src) in order.iter().enumerate() {
                    let at = 2 * (list * length + dst);
                    region[at..at + 2].copy_from_slice(&word(list, *src).to_be_bytes());
                }
            }
        }
        let log2 = if length <= 1 {
            0
        } else {
            (usize::BITS - (length - 1).leading_zeros()) as usize
        };
        self.total_cycles += (length * (log2 + lists)) as u64;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn sha1(&mut self, mut ops: Cursor) -> Step<()> {
        let position = ops.multitype(&self.memory)?;
        let length = usize::from(ops.multitype(&self.memory)?);
        let destination = ops.multitype(&self.memory)?;
        let cyclic = Cyclic::from_memory(&self.memory)?;
        let data = cyclic.read(&self.memory, position, length)?;
        cyclic.write(&mut self.memory, destination, &compute_sha1(&data))?;
        self.total_cycles += length as u64;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn load_value(&mut self, mut ops: Cursor) -> Step<()> {
        let address = ops.multitype(&self.memory)?;
        let value = ops.multitype(&self.memory)?;
        self.memory.write_u16(address, value)?;
        self.pc = ops.next_pc();
        Ok(())
    }

    /// 逐个解码并写入；写入区间覆盖到本指令自身时失败。
    fn multiload(&mut self, mut ops: Cursor) -> Step<()> {
        let address = ops.multitype(&self.memory)?;
        let count = ops.literal(&self.memory)?;
        let mut current = address;
        for _ in 0..count {
            let value = ops.multitype(&self.memory)?;
            self.memory.write_u16(current, value)?;
            current = current.wrapping_add(2);
        }
        if count > 0 {
            let write_start = usize::from(address);
            let write_end = write_start + 2 * usize::from(count) - 1;
            let instr_start = usize::from(self.pc);
            let instr_end = ops.position() - 1;
            if write_start <= instr_end && instr_start <= write_end {
                return Err(FailureReason::MemoryAccess);
            }
        }
        self.total_cycles += u64::from(count);
        self.pc = ops.next_pc();
        Ok(())
    }

    fn push(&mut self, value: u16) -> Step<()> {
        let location = self.memory.read_u16(STACK_LOCATION)?;
        let fill = self.memory.read_u16(location)?;
        let slot = location.wrapping_add(fill.wrapping_mul(2)).wrapping_add(2);
        self.memory.write_u16(slot, value)?;
        self.memory.write_u16(location, fill.wrapping_add(1))
    }

    fn pop(&mut self) -> Step<u16> {
        let location = self.memory.read_u16(STACK_LOCATION)?;
        let fill = self.memory.read_u16(location)?;
        if fill == 0 {
            return Err(FailureReason::StackUnderflow);
        }
        let fill = fill - 1;
        let slot = location.wrapping_add(fill.wrapping_mul(2)).wrapping_add(2);
        let value = self.memory.read_u16(slot)?;
        self.memory.write_u16(location, fill)?;
        Ok(value)
    }

    fn push_instr(&mut self, mut ops: Cursor) -> Step<()> {
        let value = ops.multitype(&self.memory)?;
        self.push(value)?;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn pop_instr(&mut self, mut ops: Cursor) -> Step<()> {
        let address = ops.multitype(&self.memory)?;
        let value = self.pop()?;
        self.memory.write_u16(address, value)?;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn copy(&mut self, mut ops: Cursor) -> Step<()> {
        let position = ops.multitype(&self.memory)?;
        let length = usize::from(ops.multitype(&self.memory)?);
        let destination = ops.multitype(&self.memory)?;
        let cyclic = Cyclic::from_memory(&self.memory)?;
        cyclic.copy(&mut self.memory, position, destination, length)?;
        self.total_cycles += length as u64;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn copy_literal(&mut self, mut ops: Cursor) -> Step<()> {
        let position = ops.multitype(&self.memory)?;
        let length = usize::from(ops.multitype(&self.memory)?);
        let destination_ref = ops.reference(&self.memory)?;
        let destination = self.memory.read_u16(destination_ref)?;
        let cyclic = Cyclic::from_memory(&self.memory)?;
        let (_, destination) = cyclic.copy(&mut self.memory, position, destination, length)?;
        self.memory.write_u16(destination_ref, destination)?;
        self.total_cycles += length as u64;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn copy_offset(&mut self, mut ops: Cursor) -> Step<()> {
        let offset = ops.multitype(&self.memory)?;
        let length = usize::from(ops.multitype(&self.memory)?);
        let destination_ref = ops.reference(&self.memory)?;
        let destination = self.memory.read_u16(destination_ref)?;
        let cyclic = Cyclic::from_memory(&self.memory)?;
        let source = cyclic.offset_source(destination, offset);
        let (_, destination) = cyclic.copy(&mut self.memory, source, destination, length)?;
        self.memory.write_u16(destination_ref, destination)?;
        self.total_cycles += length as u64;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn memset(&mut self, mut ops: Cursor) -> Step<()> {
        let address = ops.multitype(&self.memory)?;
        let length = usize::from(ops.multitype(&self.memory)?);
        let start_value = ops.multitype(&self.memory)?;
        let offset = ops.multitype(&self.memory)?;
        let mut value = (start_value & 0xff) as u8;
        let step = (offset & 0xff) as u8;
        let data: Vec<u8> = (0..length)
            .map(|_| {
                let current = value;
                value = value.wrapping_add(step);
                current
            })
            .collect();
        let cyclic = Cyclic::from_memory(&self.memory)?;
        cyclic.write(&mut self.memory, address, &data)?;
        self.total_cycles += length as u64;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn jump(&mut self, mut ops: Cursor) -> Step<()> {
        self.pc = ops.address(&self.memory, self.pc)?;
        Ok(())
    }

    fn compare(&mut self, mut ops: Cursor) -> Step<()> {
        let pc = self.pc;
        let left = ops.multitype(&self.memory)?;
        let right = ops.multitype(&self.memory)?;
        let less = ops.address(&self.memory, pc)?;
        let equal = ops.address(&self.memory, pc)?;
        let greater = ops.address(&self.memory, pc)?;
        self.pc = match left.cmp(&right) {
            std::cmp::Ordering::Less => less,
            std::cmp::Ordering::Equal => equal,
            std::cmp::Ordering::Greater => greater,
        };
        Ok(())
    }

    fn call(&mut self, mut ops: Cursor) -> Step<()> {
        let target = ops.address(&self.memory, self.pc)?;
        self.push(ops.next_pc())?;
        self.pc = target;
        Ok(())
    }

    fn return_instr(&mut self) -> Step<()> {
        self.pc = self.pop()?;
        Ok(())
    }

    fn switch(&mut self, mut ops: Cursor) -> Step<()> {
        let pc = self.pc;
        let count = ops.literal(&self.memory)?;
        let selector = ops.multitype(&self.memory)?;
        let mut chosen = None;
        for index in 0..count {
            let address = ops.address(&self.memory, pc)?;
            if index == selector {
                chosen = Some(address);
            }
        }
        self.total_cycles += u64::from(count);
        self.pc = chosen.ok_or(FailureReason::IllegalOperand)?;
        Ok(())
    }

    fn crc(&mut self, mut ops: Cursor) -> Step<()> {
        let pc = self.pc;
        let value = ops.multitype(&self.memory)?;
        let position = ops.multitype(&self.memory)?;
        let length = usize::from(ops.multitype(&self.memory)?);
        let mismatch = ops.address(&self.memory, pc)?;
        let cyclic = Cyclic::from_memory(&self.memory)?;
        let data = cyclic.read(&self.memory, position, length)?;
        let crc = fcs16(FCS16_INIT, &data);
        self.total_cycles += length as u64;
        self.pc = if crc == value { ops.next_pc() } else { mismatch };
        Ok(())
    }

    fn input_bytes(&mut self, mut ops: Cursor) -> Step<()> {
        let pc = self.pc;
        let length = usize::from(ops.multitype(&self.memory)?);
        let destination = ops.multitype(&self.memory)?;
        let underflow = ops.address(&self.memory, pc)?;
        let Some(bytes) = self.input.take_bytes(length) else {
            self.total_cycles += length as u64;
            self.pc = underflow;
            return Ok(());
        };
        if length > 0 {
            let cyclic = Cyclic::from_memory(&self.memory)?;
            cyclic.write(&mut self.memory, destination, &bytes)?;
            self.total_cycles += length as u64;
            self.target_cycles += 8 * length as u64 * self.cycles_per_bit;
        }
        self.pc = ops.next_pc();
        Ok(())
    }

    fn input_bits(&mut self, mut ops: Cursor) -> Step<()> {
        let pc = self.pc;
        let length = ops.multitype(&self.memory)?;
        let destination = ops.multitype(&self.memory)?;
        let underflow = ops.address(&self.memory, pc)?;
        if length == 0 {
            self.pc = ops.next_pc();
            return Ok(());
        }
        if length > 16 {
            return Err(FailureReason::IllegalOperand);
        }
        let order = self.memory.read_u16(INPUT_BIT_ORDER)?;
        let count = u32::from(length);
        let Some(value) = self.input.take_bits(count, order & BIT_ORDER_P != 0) else {
            self.pc = underflow;
            return Ok(());
        };
        let value = if order & BIT_ORDER_F != 0 {
            reverse_bits(value, count)
        } else {
            value
        };
        self.memory.write_u16(destination, value)?;
        self.target_cycles += u64::from(length) * self.cycles_per_bit;
        self.pc = ops.next_pc();
        Ok(())
    }

    /// 逐组解码：每组先取位再比较区间，匹配后只跳过剩余各组的操作数。
    fn input_huffman(&mut self, mut ops: Cursor) -> Step<()> {
        let pc = self.pc;
        let destination = ops.multitype(&self.memory)?;
        let underflow = ops.address(&self.memory, pc)?;
        let count = ops.literal(&self.memory)?;
        self.total_cycles += u64::from(count);
        let order = self.memory.read_u16(INPUT_BIT_ORDER)?;
        let lsb_first = order & BIT_ORDER_P != 0;
        let reversed = order & BIT_ORDER_H != 0;
        let mut code: u32 = 0;
        let mut total_bits: u32 = 0;
        for group in 0..count {
            let bits = ops.multitype(&self.memory)?;
            let lower = ops.multitype(&self.memory)?;
            let upper = ops.multitype(&self.memory)?;
            let uncompressed = ops.multitype(&self.memory)?;
            if bits != 0 {
                let bits = u32::from(bits);
                total_bits += bits;
                if total_bits > 16 {
                    return Err(FailureReason::HuffmanBits);
                }
                let Some(value) = self.input.take_bits(bits, lsb_first) else {
                    self.pc = underflow;
                    return Ok(());
                };
                let value = if reversed {
                    reverse_bits(value, bits)
                } else {
                    value
                };
                self.target_cycles += u64::from(bits) * self.cycles_per_bit;
                code = (code << bits) + u32::from(value);
            }
            if u32::from(lower) <= code && code <= u32::from(upper) {
                let decoded = (code as u16).wrapping_add(uncompressed).wrapping_sub(lower);
                self.memory.write_u16(destination, decoded)?;
                for _ in group + 1..count {
                    for _ in 0..4 {
                        ops.multitype(&self.memory)?;
                    }
                }
                self.pc = ops.next_pc();
                return Ok(());
            }
        }
        Err(FailureReason::HuffmanMatch)
    }

    fn state_access(&mut self, mut ops: Cursor, store: &StateStore) -> Step<()> {
        let partial_start = usize::from(ops.multitype(&self.memory)?);
        let partial_length = usize::from(ops.multitype(&self.memory)?);
        let state_begin = usize::from(ops.multitype(&self.memory)?);
        let state_length = ops.multitype(&self.memory)?;
        let state_address = ops.multitype(&self.memory)?;
        let state_instruction = ops.multitype(&self.memory)?;
        if !(MIN_PARTIAL_ID_LEN..=STATE_ID_LEN).contains(&partial_length) {
            return Err(FailureReason::IllegalOperand);
        }
        let partial_id = self.memory.slice(partial_start, partial_length)?;
        let state = store
            .lookup(partial_id, false)
            .map_err(|_| FailureReason::StateAccess)?;
        let length = if state_length == 0 {
            state.data.len()
        } else {
            usize::from(state_length)
        };
        let address = if state_address == 0 {
            state.address
        } else {
            state_address
        };
        let instruction = if state_instruction == 0 {
            state.instruction
        } else {
            state_instruction
        };
        if state_begin + length > state.data.len() || (state_begin != 0 && length == 0) {
            return Err(FailureReason::IllegalOperand);
        }
        let cyclic = Cyclic::from_memory(&self.memory)?;
        cyclic.write(
            &mut self.memory,
            address,
            &state.data[state_begin..state_begin + length],
        )?;
        self.total_cycles += length as u64;
        self.pc = if instruction != 0 {
            instruction
        } else {
            ops.next_pc()
        };
        Ok(())
    }

    fn state_create(&mut self, mut ops: Cursor) -> Step<()> {
        let request = SaveRequest {
            length: ops.multitype(&self.memory)?,
            address: ops.multitype(&self.memory)?,
            instruction: ops.multitype(&self.memory)?,
            minimum_access_length: ops.multitype(&self.memory)?,
            retention_priority: ops.multitype(&self.memory)?,
        };
        self.requests.push_save(request)?;
        self.total_cycles += u64::from(request.length);
        self.pc = ops.next_pc();
        Ok(())
    }

    fn state_free(&mut self, mut ops: Cursor) -> Step<()> {
        let request = FreeRequest {
            partial_id_start: ops.multitype(&self.memory)?,
            partial_id_length: ops.multitype(&self.memory)?,
        };
        self.requests.push_free(request)?;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn output_instr(&mut self, mut ops: Cursor) -> Step<()> {
        let start = ops.multitype(&self.memory)?;
        let length = usize::from(ops.multitype(&self.memory)?);
        if self.output.len() + length > self.output_capacity {
            return Err(FailureReason::Resources);
        }
        let cyclic = Cyclic::from_memory(&self.memory)?;
        let data = cyclic.read(&self.memory, start, length)?;
        self.output.extend_from_slice(&data);
        self.total_cycles += length as u64;
        self.pc = ops.next_pc();
        Ok(())
    }

    fn end_message(&mut self, mut ops: Cursor) -> Step<()> {
        let requested_feedback_location = ops.multitype(&self.memory)?;
        let returned_parameters_location = ops.multitype(&self.memory)?;
        let request = SaveRequest {
            length: ops.multitype(&self.memory)?,
            address: ops.multitype(&self.memory)?,
            instruction: ops.multitype(&self.memory)?,
            minimum_access_length: ops.multitype(&self.memory)?,
            retention_priority: ops.multitype(&self.memory)?,
        };
        if request.length != 0 && request.is_admissible() {
            self.requests.push_save(request)?;
        }
        self.requested_feedback_location = requested_feedback_location;
        self.returned_parameters_location = returned_parameters_location;
        self.total_cycles += u64::from(request.length);
        let waiting = requested_feedback_location != 0
            || returned_parameters_location != 0
            || !self.requests.is_empty();
        self.completion = Some(if waiting {
            Completion::Waiting
        } else {
            Completion::Finished
        });
        self.pc = ops.next_pc();
        Ok(())
    }
}
