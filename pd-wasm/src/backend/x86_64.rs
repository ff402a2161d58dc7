//! x86-64 lowering.
//!
//! Register plan for generated bodies:
//! - `rbx` holds the [`CallFrame`](crate::exec::CallFrame) pointer,
//! - `r12` holds the base of the function's slot array,
//! - `rax`, `rcx`, `rdx` and `xmm0` are scratch.
//!
//! Slot `i` lives at `[r12 + i * 8]`: parameters and declared locals come
//! first, the operand stack follows. Stack heights are tracked while
//! lowering, so every operand has a fixed slot and nothing is pushed on the
//! machine stack besides the prologue's saved registers.

use std::sync::Arc;

use super::{CodeRequirements, LoweredFunction, MachineBackend, STATUS_TRAP};
use crate::bridge;
use crate::debug_info::SourceMap;
use crate::error::{CompileError, CompileResult};
use crate::exec::{self, Trampoline};
use crate::ir::{
    BlockType, CallTarget, FloatBinary, FunctionIr, HostFunc, IntBinary, IntCompare, LoadOp,
    MemArg, Op, StoreOp,
};
use crate::layout;
use crate::trap::TrapCode;

mod asm;

use asm::{
    Cond, R12, RAX, RBP, RBX, RCX, RDX, XMM0, call_rax, cmovcc, cmp_imm8, cmp_rr,
    emit_jcc_rel32, emit_jmp_rel32, lea, lea_rip, load, mov_imm32, mov_imm64, mov_rr, op_mem,
    op_reg, patch_rel32, pop, push, ret, setcc_eax, store, store_imm32, test_rr, xor_rr,
};

#[cfg(target_os = "windows")]
const ARG_REGS: [u8; 4] = [asm::RCX, asm::RDX, asm::R8, asm::R9];
#[cfg(not(target_os = "windows"))]
const ARG_REGS: [u8; 4] = [asm::RDI, asm::RSI, asm::RDX, asm::RCX];

const FRAME: u8 = RBX;
const SLOTS: u8 = R12;
const SLOT_BYTES: usize = layout::SLOT_SIZE;

pub struct X86_64Backend;

impl MachineBackend for X86_64Backend {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn lower(&self, function: &FunctionIr) -> CompileResult<LoweredFunction> {
        Lowering::new(function).run()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ControlKind {
    Function,
    Block,
    Loop,
    If,
}

#[derive(Debug)]
struct Control {
    kind: ControlKind,
    /// Operand height below the block's parameters.
    height: usize,
    params: usize,
    results: usize,
    loop_start: usize,
    /// Forward branches to the end of the block.
    exits: Vec<usize>,
    /// `jz` over the then-arm of an `if`; consumed by `else` or `end`.
    else_jump: Option<usize>,
    /// Opened while unreachable; nothing inside is emitted.
    dead: bool,
}

impl Control {
    fn new(kind: ControlKind, height: usize, block: BlockType) -> Self {
        Self {
            kind,
            height,
            params: block.params as usize,
            results: block.results as usize,
            loop_start: 0,
            exits: Vec::new(),
            else_jump: None,
            dead: false,
        }
    }

    fn dead(kind: ControlKind, height: usize) -> Self {
        Self {
            dead: true,
            ..Self::new(kind, height, BlockType::EMPTY)
        }
    }
}

struct TrapSite {
    jump: usize,
    site: usize,
    code: TrapCode,
}

enum HelperArg {
    Imm(u32),
    HostSlot(usize),
}

struct Lowering<'f> {
    function: &'f FunctionIr,
    code: Vec<u8>,
    control: Vec<Control>,
    height: usize,
    max_height: usize,
    reachable: bool,
    locals: usize,
    source_offset: u64,
    source_map: SourceMap,
    traps: Vec<TrapSite>,
    epilogue_jumps: Vec<usize>,
    epilogue: Option<usize>,
    host_imports: Vec<HostFunc>,
    host_slot_refs: Vec<(usize, usize)>,
    requirements: CodeRequirements,
}

impl<'f> Lowering<'f> {
    fn new(function: &'f FunctionIr) -> Self {
        Self {
            function,
            code: Vec::new(),
            control: Vec::new(),
            height: 0,
            max_height: 0,
            reachable: true,
            locals: function.local_count(),
            source_offset: function.body.first().map_or(0, |instr| instr.source_offset),
            source_map: SourceMap::new(),
            traps: Vec::new(),
            epilogue_jumps: Vec::new(),
            epilogue: None,
            host_imports: Vec::new(),
            host_slot_refs: Vec::new(),
            requirements: CodeRequirements::default(),
        }
    }

    fn run(mut self) -> CompileResult<LoweredFunction> {
        let function = self.function;
        self.emit_prologue();
        self.control.push(Control::new(
            ControlKind::Function,
            0,
            BlockType::results(function.definition.results().len() as u32),
        ));

        for instr in &function.body {
            self.source_offset = instr.source_offset;
            if self.epilogue.is_some() {
                return Err(self.malformed("instructions after the function's final end"));
            }
            self.lower_instr(&instr.op)?;
        }
        let Some(epilogue) = self.epilogue else {
            return Err(self.malformed("body is missing its final end"));
        };

        for site in std::mem::take(&mut self.traps) {
            let stub = self.code.len();
            patch_rel32(&mut self.code, site.jump, stub)?;
            store_imm32(
                &mut self.code,
                FRAME,
                layout::CALL_FRAME_TRAP_CODE_OFFSET as i32,
                site.code.raw(),
            );
            let pc = lea_rip(&mut self.code, RAX);
            patch_rel32(&mut self.code, pc, site.site)?;
            store(&mut self.code, true, FRAME, layout::CALL_FRAME_EXIT_PC_OFFSET as i32, RAX);
            mov_imm32(&mut self.code, RAX, STATUS_TRAP);
            let jump = emit_jmp_rel32(&mut self.code);
            patch_rel32(&mut self.code, jump, epilogue)?;
        }

        while self.code.len() % 8 != 0 {
            self.code.push(0xCC);
        }
        let data_offset = self.code.len();
        let mut slot_offsets = Vec::with_capacity(self.host_imports.len());
        for import in &self.host_imports {
            slot_offsets.push(self.code.len());
            let slot = bridge::bind(import.callable());
            self.code.extend_from_slice(slot.as_bytes());
        }
        for (disp, index) in std::mem::take(&mut self.host_slot_refs) {
            patch_rel32(&mut self.code, disp, slot_offsets[index])?;
        }

        let frame_slots = (self.locals + self.max_height).max(function.definition.results().len());
        self.slot_disp(frame_slots)?;

        Ok(LoweredFunction {
            bytes: self.code,
            data_offset,
            frame_slots,
            source_map: self.source_map,
            host_imports: self.host_imports,
            requirements: self.requirements,
        })
    }

    fn malformed(&self, reason: impl Into<String>) -> CompileError {
        CompileError::Malformed {
            function: self.function.name().to_string(),
            source_offset: self.source_offset,
            reason: reason.into(),
        }
    }

    fn unsupported(&self, construct: &'static str) -> CompileError {
        CompileError::Unsupported {
            function: self.function.name().to_string(),
            source_offset: self.source_offset,
            construct,
        }
    }

    fn slot_disp(&self, slot: usize) -> CompileResult<i32> {
        slot.checked_mul(SLOT_BYTES)
            .and_then(|bytes| i32::try_from(bytes).ok())
            .ok_or_else(|| CompileError::FrameTooLarge {
                function: self.function.name().to_string(),
                slots: slot,
            })
    }

    /// Displacement of operand-stack entry `index` (0 is the bottom).
    fn stack_disp(&self, index: usize) -> CompileResult<i32> {
        self.slot_disp(self.locals + index)
    }

    fn local_disp(&self, index: u32) -> CompileResult<i32> {
        let index = index as usize;
        if index >= self.locals {
            return Err(self.malformed(format!(
                "local {index} out of range ({} locals)",
                self.locals
            )));
        }
        self.slot_disp(index)
    }

    fn require(&self, count: usize) -> CompileResult<()> {
        let floor = self.control.last().map_or(0, |frame| frame.height);
        if self.height < floor + count {
            return Err(self.malformed(format!(
                "operand stack underflow: need {count}, have {}",
                self.height - floor
            )));
        }
        Ok(())
    }

    /// Pops `count` operands and returns the index of the lowest popped one.
    fn pop_operands(&mut self, count: usize) -> CompileResult<usize> {
        self.require(count)?;
        self.height -= count;
        Ok(self.height)
    }

    /// Pushes one operand and returns its displacement.
    fn push_operand(&mut self) -> CompileResult<i32> {
        self.height += 1;
        self.max_height = self.max_height.max(self.height);
        self.stack_disp(self.height - 1)
    }

    fn top_disp(&self) -> CompileResult<i32> {
        self.require(1)?;
        self.stack_disp(self.height - 1)
    }

    fn emit_prologue(&mut self) {
        let code = &mut self.code;
        push(code, RBP);
        mov_rr(code, true, RBP, asm::RSP);
        push(code, RBX);
        push(code, R12);
        #[cfg(target_os = "windows")]
        {
            push(code, asm::RSI);
            push(code, asm::RDI);
            code.extend_from_slice(&[0x48, 0x83, 0xEC, 0x20]); // sub rsp, 32
        }
        mov_rr(code, true, FRAME, ARG_REGS[0]);
        mov_rr(code, true, SLOTS, ARG_REGS[1]);
    }

    fn emit_epilogue(&mut self) {
        let code = &mut self.code;
        #[cfg(target_os = "windows")]
        {
            code.extend_from_slice(&[0x48, 0x83, 0xC4, 0x20]); // add rsp, 32
            pop(code, asm::RDI);
            pop(code, asm::RSI);
        }
        pop(code, R12);
        pop(code, RBX);
        pop(code, RBP);
        ret(code);
    }

    /// Routes the `jcc` whose rel32 sits at `jump` to a stub raising `code`.
    fn trap_on(&mut self, jump: usize, code: TrapCode) {
        self.traps.push(TrapSite {
            jump,
            site: jump - 2,
            code,
        });
    }

    fn lower_instr(&mut self, op: &Op) -> CompileResult<()> {
        if !self.reachable {
            return self.lower_unreachable(op);
        }
        self.source_map
            .mark(self.code.len() as u64, self.source_offset);

        match op {
            Op::Unreachable => {
                let jump = emit_jmp_rel32(&mut self.code);
                self.traps.push(TrapSite {
                    jump,
                    site: jump - 1,
                    code: TrapCode::Unreachable,
                });
                self.reachable = false;
            }
            Op::Nop => {}
            Op::Block(block) => {
                self.require(block.params as usize)?;
                let height = self.height - block.params as usize;
                self.control
                    .push(Control::new(ControlKind::Block, height, *block));
            }
            Op::Loop(block) => {
                self.require(block.params as usize)?;
                let height = self.height - block.params as usize;
                let mut frame = Control::new(ControlKind::Loop, height, *block);
                frame.loop_start = self.code.len();
                self.control.push(frame);
            }
            Op::If(block) => {
                if block.params > 0 {
                    return Err(self.unsupported("if with block parameters"));
                }
                let cond = self.pop_operands(1)?;
                let disp = self.stack_disp(cond)?;
                load(&mut self.code, false, RAX, SLOTS, disp);
                test_rr(&mut self.code, false, RAX, RAX);
                let jump = emit_jcc_rel32(&mut self.code, Cond::Equal);
                let mut frame = Control::new(ControlKind::If, self.height, *block);
                frame.else_jump = Some(jump);
                self.control.push(frame);
            }
            Op::Else => self.lower_else()?,
            Op::End => self.lower_end()?,
            Op::Br(depth) => {
                self.lower_branch(*depth)?;
                self.reachable = false;
            }
            Op::BrIf(depth) => {
                let cond = self.pop_operands(1)?;
                let disp = self.stack_disp(cond)?;
                load(&mut self.code, false, RAX, SLOTS, disp);
                test_rr(&mut self.code, false, RAX, RAX);
                let skip = emit_jcc_rel32(&mut self.code, Cond::Equal);
                self.lower_branch(*depth)?;
                let here = self.code.len();
                patch_rel32(&mut self.code, skip, here)?;
            }
            Op::Return => {
                self.lower_branch(self.control.len() as u32 - 1)?;
                self.reachable = false;
            }
            Op::Call(target) => self.lower_call(target)?,
            Op::ReturnCall(_) => return Err(self.unsupported("return_call")),
            Op::Drop => {
                self.pop_operands(1)?;
            }
            Op::Select => {
                let base = self.pop_operands(3)?;
                let first = self.stack_disp(base)?;
                let second = self.stack_disp(base + 1)?;
                let cond = self.stack_disp(base + 2)?;
                let code = &mut self.code;
                load(code, false, RAX, SLOTS, cond);
                load(code, true, RCX, SLOTS, first);
                load(code, true, RDX, SLOTS, second);
                test_rr(code, false, RAX, RAX);
                cmovcc(code, true, Cond::Equal, RCX, RDX);
                store(code, true, SLOTS, first, RCX);
                self.push_operand()?;
            }
            Op::LocalGet(index) => {
                let local = self.local_disp(*index)?;
                let top = self.push_operand()?;
                load(&mut self.code, true, RAX, SLOTS, local);
                store(&mut self.code, true, SLOTS, top, RAX);
            }
            Op::LocalSet(index) => {
                let local = self.local_disp(*index)?;
                let value = self.pop_operands(1)?;
                let value = self.stack_disp(value)?;
                load(&mut self.code, true, RAX, SLOTS, value);
                store(&mut self.code, true, SLOTS, local, RAX);
            }
            Op::LocalTee(index) => {
                let local = self.local_disp(*index)?;
                let top = self.top_disp()?;
                load(&mut self.code, true, RAX, SLOTS, top);
                store(&mut self.code, true, SLOTS, local, RAX);
            }
            Op::GlobalGet(index) => {
                let value = self.global_disp(*index)?;
                let top = self.push_operand()?;
                let code = &mut self.code;
                load(code, true, RAX, FRAME, layout::CALL_FRAME_GLOBALS_OFFSET as i32);
                load(code, true, RAX, RAX, value);
                store(code, true, SLOTS, top, RAX);
            }
            Op::GlobalSet(index) => {
                let value = self.global_disp(*index)?;
                let top = self.pop_operands(1)?;
                let top = self.stack_disp(top)?;
                let code = &mut self.code;
                load(code, true, RCX, SLOTS, top);
                load(code, true, RAX, FRAME, layout::CALL_FRAME_GLOBALS_OFFSET as i32);
                store(code, true, RAX, value, RCX);
            }
            Op::Load(kind, memarg) => self.lower_load(*kind, *memarg)?,
            Op::Store(kind, memarg) => self.lower_store(*kind, *memarg)?,
            Op::MemorySize => {
                let top = self.push_operand()?;
                let code = &mut self.code;
                load(code, true, RDX, FRAME, layout::CALL_FRAME_MEMORY_OFFSET as i32);
                load(code, true, RAX, RDX, layout::MEMORY_INSTANCE_LEN_OFFSET as i32);
                op_reg(code, None, true, &[0xC1], 5, RAX); // shr rax, 16
                code.push(16);
                store(code, true, SLOTS, top, RAX);
            }
            Op::MemoryGrow => {
                self.require(1)?;
                let stack = self.height - 1;
                let helper: Trampoline = exec::memory_grow_trampoline;
                self.emit_call_out(helper, HelperArg::Imm(0), stack, 0)?;
            }
            Op::TableGet(table) => self.lower_table_get(*table)?,
            Op::TableSize(table) => {
                let len = self.table_field_disp(*table, layout::TABLE_INSTANCE_LEN_OFFSET)?;
                let top = self.push_operand()?;
                let code = &mut self.code;
                load(code, true, RDX, FRAME, layout::CALL_FRAME_TABLES_OFFSET as i32);
                load(code, true, RAX, RDX, len);
                store(code, true, SLOTS, top, RAX);
            }
            Op::I32Const(value) => {
                let top = self.push_operand()?;
                mov_imm32(&mut self.code, RAX, *value as u32);
                store(&mut self.code, true, SLOTS, top, RAX);
            }
            Op::I64Const(value) => {
                let top = self.push_operand()?;
                mov_imm64(&mut self.code, RAX, *value as u64);
                store(&mut self.code, true, SLOTS, top, RAX);
            }
            Op::F32Const(value) => {
                let top = self.push_operand()?;
                mov_imm32(&mut self.code, RAX, value.to_bits());
                store(&mut self.code, true, SLOTS, top, RAX);
            }
            Op::F64Const(value) => {
                let top = self.push_operand()?;
                mov_imm64(&mut self.code, RAX, value.to_bits());
                store(&mut self.code, true, SLOTS, top, RAX);
            }
            Op::V128Const(_) => return Err(self.unsupported("v128.const")),
            Op::I32Eqz => self.lower_eqz(false)?,
            Op::I64Eqz => self.lower_eqz(true)?,
            Op::I32Compare(cmp) => self.lower_compare(false, *cmp)?,
            Op::I64Compare(cmp) => self.lower_compare(true, *cmp)?,
            Op::I32Binary(bin) => self.lower_int_binary(false, *bin)?,
            Op::I64Binary(bin) => self.lower_int_binary(true, *bin)?,
            Op::F32Binary(bin) => self.lower_float_binary(false, *bin)?,
            Op::F64Binary(bin) => self.lower_float_binary(true, *bin)?,
            Op::I32WrapI64 | Op::I64ExtendI32U => {
                let top = self.top_disp()?;
                load(&mut self.code, false, RAX, SLOTS, top);
                store(&mut self.code, true, SLOTS, top, RAX);
            }
            Op::I64ExtendI32S => {
                let top = self.top_disp()?;
                op_mem(&mut self.code, None, true, &[0x63], RAX, SLOTS, top); // movsxd
                store(&mut self.code, true, SLOTS, top, RAX);
            }
        }
        Ok(())
    }

    fn lower_unreachable(&mut self, op: &Op) -> CompileResult<()> {
        match op {
            Op::Block(_) => self.control.push(Control::dead(ControlKind::Block, self.height)),
            Op::Loop(_) => self.control.push(Control::dead(ControlKind::Loop, self.height)),
            Op::If(_) => self.control.push(Control::dead(ControlKind::If, self.height)),
            Op::Else => {
                if !self.current_frame()?.dead {
                    self.lower_else()?;
                }
            }
            Op::End => {
                if self.current_frame()?.dead {
                    self.control.pop();
                } else {
                    self.lower_end()?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn current_frame(&self) -> CompileResult<&Control> {
        self.control
            .last()
            .ok_or_else(|| self.malformed("no open block"))
    }

    fn lower_else(&mut self) -> CompileResult<()> {
        let frame = self.current_frame()?;
        if frame.kind != ControlKind::If || frame.else_jump.is_none() {
            return Err(self.malformed("else without a matching if"));
        }
        let expected = frame.height + frame.results;
        if self.reachable {
            if self.height != expected {
                return Err(self.malformed(format!(
                    "if arm leaves {} values, expected {}",
                    self.height - frame.height,
                    frame.results
                )));
            }
            let jump = emit_jmp_rel32(&mut self.code);
            if let Some(frame) = self.control.last_mut() {
                frame.exits.push(jump);
            }
        }
        let here = self.code.len();
        let Some(frame) = self.control.last_mut() else {
            return Err(self.malformed("no open block"));
        };
        let height = frame.height + frame.params;
        if let Some(jump) = frame.else_jump.take() {
            patch_rel32(&mut self.code, jump, here)?;
        }
        self.height = height;
        self.reachable = true;
        Ok(())
    }

    fn lower_end(&mut self) -> CompileResult<()> {
        let Some(frame) = self.control.pop() else {
            return Err(self.malformed("end without an open block"));
        };
        if self.reachable && self.height != frame.height + frame.results {
            return Err(self.malformed(format!(
                "block leaves {} values, expected {}",
                self.height.saturating_sub(frame.height),
                frame.results
            )));
        }
        if frame.kind == ControlKind::If && frame.else_jump.is_some() && frame.params != frame.results
        {
            return Err(self.malformed("if without else must not change the stack"));
        }

        if frame.kind == ControlKind::Function {
            if self.reachable {
                self.copy_operands(self.locals + self.height - frame.results, 0, frame.results)?;
            }
            let ret_label = self.code.len();
            for jump in &frame.exits {
                patch_rel32(&mut self.code, *jump, ret_label)?;
            }
            xor_rr(&mut self.code, false, RAX, RAX);
            let epilogue = self.code.len();
            self.emit_epilogue();
            for jump in std::mem::take(&mut self.epilogue_jumps) {
                patch_rel32(&mut self.code, jump, epilogue)?;
            }
            self.epilogue = Some(epilogue);
            self.height = frame.results;
            return Ok(());
        }

        let here = self.code.len();
        if let Some(jump) = frame.else_jump {
            patch_rel32(&mut self.code, jump, here)?;
        }
        for jump in &frame.exits {
            patch_rel32(&mut self.code, *jump, here)?;
        }
        self.height = frame.height + frame.results;
        self.reachable = true;
        Ok(())
    }

    fn copy_operands(&mut self, from: usize, to: usize, count: usize) -> CompileResult<()> {
        if from == to {
            return Ok(());
        }
        for k in 0..count {
            let src = self.slot_disp(from + k)?;
            let dst = self.slot_disp(to + k)?;
            load(&mut self.code, true, RAX, SLOTS, src);
            store(&mut self.code, true, SLOTS, dst, RAX);
        }
        Ok(())
    }

    /// Moves the branch operands into place and jumps to the label `depth`
    /// levels out. The height is left unchanged for the fall-through path.
    fn lower_branch(&mut self, depth: u32) -> CompileResult<()> {
        let index = self
            .control
            .len()
            .checked_sub(1 + depth as usize)
            .ok_or_else(|| self.malformed(format!("branch depth {depth} out of range")))?;
        let target = &self.control[index];
        let (arity, dest) = match target.kind {
            ControlKind::Loop => (target.params, self.locals + target.height),
            ControlKind::Function => (target.results, 0),
            ControlKind::Block | ControlKind::If => (target.results, self.locals + target.height),
        };
        let loop_start = (target.kind == ControlKind::Loop).then_some(target.loop_start);
        self.require(arity)?;
        self.copy_operands(self.locals + self.height - arity, dest, arity)?;
        let jump = emit_jmp_rel32(&mut self.code);
        match loop_start {
            Some(start) => patch_rel32(&mut self.code, jump, start)?,
            None => self.control[index].exits.push(jump),
        }
        Ok(())
    }

    fn lower_call(&mut self, target: &CallTarget) -> CompileResult<()> {
        let definition = target.definition();
        let params = definition.params().len();
        let results = definition.results().len();
        let base = self.pop_operands(params)?;
        // Reserve the callee's result slots before emitting the call-out.
        self.height = base + params.max(results);
        self.max_height = self.max_height.max(self.height);
        self.stack_disp(self.height.saturating_sub(1))?;

        match target {
            CallTarget::Function(definition) => {
                let helper: Trampoline = exec::call_function_trampoline;
                self.emit_call_out(helper, HelperArg::Imm(definition.index()), base, 0)?;
            }
            CallTarget::Host(host) => {
                let import = match self.host_imports.iter().position(|seen| seen.same_import(host)) {
                    Some(import) => import,
                    None => {
                        self.host_imports.push(host.clone());
                        self.host_imports.len() - 1
                    }
                };
                let definition = Arc::as_ptr(host.definition()) as u64;
                let helper: Trampoline = exec::call_host_trampoline;
                self.emit_call_out(helper, HelperArg::HostSlot(import), base, definition)?;
            }
        }
        self.height = base + results;
        Ok(())
    }

    /// Calls `helper(frame, arg1, &slots[stack], arg3)` and leaves through
    /// the epilogue when it reports a non-zero status.
    fn emit_call_out(
        &mut self,
        helper: Trampoline,
        arg1: HelperArg,
        stack: usize,
        arg3: u64,
    ) -> CompileResult<()> {
        let stack = self.stack_disp(stack)?;
        let code = &mut self.code;
        lea_rip(code, RAX);
        store(code, true, FRAME, layout::CALL_FRAME_EXIT_PC_OFFSET as i32, RAX);
        mov_rr(code, true, ARG_REGS[0], FRAME);
        match arg1 {
            HelperArg::Imm(value) => mov_imm32(code, ARG_REGS[1], value),
            HelperArg::HostSlot(import) => {
                let disp = lea_rip(code, ARG_REGS[1]);
                self.host_slot_refs.push((disp, import));
            }
        }
        lea(code, ARG_REGS[2], SLOTS, stack);
        mov_imm64(code, ARG_REGS[3], arg3);
        mov_imm64(code, RAX, helper as usize as u64);
        call_rax(code);
        test_rr(code, false, RAX, RAX);
        let jump = emit_jcc_rel32(code, Cond::NotEqual);
        self.epilogue_jumps.push(jump);
        Ok(())
    }

    fn global_disp(&mut self, index: u32) -> CompileResult<i32> {
        let disp = layout::global_value_displacement(index)
            .ok_or_else(|| self.malformed(format!("global {index} is out of addressable range")))?;
        self.requirements.globals = self.requirements.globals.max(index + 1);
        Ok(disp)
    }

    fn table_field_disp(&mut self, table: u32, field: usize) -> CompileResult<i32> {
        let disp = layout::table_displacement(table)
            .and_then(|record| record.checked_add(field as i32))
            .ok_or_else(|| self.malformed(format!("table {table} is out of addressable range")))?;
        self.requirements.tables = self.requirements.tables.max(table + 1);
        Ok(disp)
    }

    /// Leaves `rax` pointing one past the accessed bytes, trapping when
    /// `addr + offset + width` exceeds the memory length.
    fn emit_bounds_check(&mut self, addr: i32, memarg: MemArg, width: u32) -> CompileResult<()> {
        let end = u64::from(memarg.offset) + u64::from(width);
        let code = &mut self.code;
        load(code, false, RAX, SLOTS, addr);
        if let Ok(end) = i32::try_from(end) {
            op_reg(code, None, true, &[0x81], 0, RAX); // add rax, imm32
            code.extend_from_slice(&end.to_le_bytes());
        } else {
            mov_imm64(code, RCX, end);
            op_reg(code, None, true, &[0x01], RCX, RAX); // add rax, rcx
        }
        load(code, true, RDX, FRAME, layout::CALL_FRAME_MEMORY_OFFSET as i32);
        op_mem(code, None, true, &[0x3B], RAX, RDX, layout::MEMORY_INSTANCE_LEN_OFFSET as i32);
        let jump = emit_jcc_rel32(code, Cond::Above);
        op_mem(code, None, true, &[0x03], RAX, RDX, layout::MEMORY_INSTANCE_BASE_OFFSET as i32);
        self.trap_on(jump, TrapCode::MemoryOutOfBounds);
        Ok(())
    }

    fn lower_load(&mut self, kind: LoadOp, memarg: MemArg) -> CompileResult<()> {
        let top = self.top_disp()?;
        let width = kind.width();
        self.emit_bounds_check(top, memarg, width)?;
        let at = -(width as i32);
        let code = &mut self.code;
        match kind {
            LoadOp::I32 | LoadOp::F32 | LoadOp::I64Load32U => load(code, false, RAX, RAX, at),
            LoadOp::I64 | LoadOp::F64 => load(code, true, RAX, RAX, at),
            LoadOp::I32Load8S => op_mem(code, None, false, &[0x0F, 0xBE], RAX, RAX, at),
            LoadOp::I32Load8U => op_mem(code, None, false, &[0x0F, 0xB6], RAX, RAX, at),
            LoadOp::I32Load16S => op_mem(code, None, false, &[0x0F, 0xBF], RAX, RAX, at),
            LoadOp::I32Load16U => op_mem(code, None, false, &[0x0F, 0xB7], RAX, RAX, at),
            LoadOp::I64Load32S => op_mem(code, None, true, &[0x63], RAX, RAX, at),
        }
        store(code, true, SLOTS, top, RAX);
        Ok(())
    }

    fn lower_store(&mut self, kind: StoreOp, memarg: MemArg) -> CompileResult<()> {
        let base = self.pop_operands(2)?;
        let addr = self.stack_disp(base)?;
        let value = self.stack_disp(base + 1)?;
        let width = kind.width();
        self.emit_bounds_check(addr, memarg, width)?;
        let at = -(width as i32);
        let code = &mut self.code;
        let wide = matches!(kind, StoreOp::I64 | StoreOp::F64);
        load(code, wide, RCX, SLOTS, value);
        match kind {
            StoreOp::I32 | StoreOp::F32 | StoreOp::I64Store32 => store(code, false, RAX, at, RCX),
            StoreOp::I64 | StoreOp::F64 => store(code, true, RAX, at, RCX),
            StoreOp::I32Store16 => op_mem(code, Some(0x66), false, &[0x89], RCX, RAX, at),
            StoreOp::I32Store8 => op_mem(code, None, false, &[0x88], RCX, RAX, at),
        }
        Ok(())
    }

    fn lower_table_get(&mut self, table: u32) -> CompileResult<()> {
        let len = self.table_field_disp(table, layout::TABLE_INSTANCE_LEN_OFFSET)?;
        let base = self.table_field_disp(table, layout::TABLE_INSTANCE_BASE_OFFSET)?;
        let top = self.top_disp()?;
        let code = &mut self.code;
        load(code, false, RAX, SLOTS, top);
        load(code, true, RDX, FRAME, layout::CALL_FRAME_TABLES_OFFSET as i32);
        op_mem(code, None, true, &[0x3B], RAX, RDX, len);
        let jump = emit_jcc_rel32(code, Cond::AboveEqual);
        load(code, true, RDX, RDX, base);
        code.extend_from_slice(&[0x48, 0x8B, 0x04, 0xC2]); // mov rax, [rdx + rax*8]
        store(code, true, SLOTS, top, RAX);
        self.trap_on(jump, TrapCode::TableOutOfBounds);
        Ok(())
    }

    fn lower_eqz(&mut self, wide: bool) -> CompileResult<()> {
        let top = self.top_disp()?;
        let code = &mut self.code;
        load(code, wide, RAX, SLOTS, top);
        test_rr(code, wide, RAX, RAX);
        setcc_eax(code, Cond::Equal);
        store(code, true, SLOTS, top, RAX);
        Ok(())
    }

    fn lower_compare(&mut self, wide: bool, cmp: IntCompare) -> CompileResult<()> {
        let base = self.pop_operands(2)?;
        let lhs = self.stack_disp(base)?;
        let rhs = self.stack_disp(base + 1)?;
        let cond = match cmp {
            IntCompare::Eq => Cond::Equal,
            IntCompare::Ne => Cond::NotEqual,
            IntCompare::LtS => Cond::Less,
            IntCompare::LtU => Cond::Below,
            IntCompare::GtS => Cond::Greater,
            IntCompare::GtU => Cond::Above,
            IntCompare::LeS => Cond::LessEqual,
            IntCompare::LeU => Cond::BelowEqual,
            IntCompare::GeS => Cond::GreaterEqual,
            IntCompare::GeU => Cond::AboveEqual,
        };
        let code = &mut self.code;
        load(code, wide, RAX, SLOTS, lhs);
        op_mem(code, None, wide, &[0x3B], RAX, SLOTS, rhs); // cmp rax, [rhs]
        setcc_eax(code, cond);
        store(code, true, SLOTS, lhs, RAX);
        self.push_operand()?;
        Ok(())
    }

    fn lower_int_binary(&mut self, wide: bool, bin: IntBinary) -> CompileResult<()> {
        let base = self.pop_operands(2)?;
        let lhs = self.stack_disp(base)?;
        let rhs = self.stack_disp(base + 1)?;
        let simple: Option<&[u8]> = match bin {
            IntBinary::Add => Some(&[0x03]),
            IntBinary::Sub => Some(&[0x2B]),
            IntBinary::Mul => Some(&[0x0F, 0xAF]),
            IntBinary::And => Some(&[0x23]),
            IntBinary::Or => Some(&[0x0B]),
            IntBinary::Xor => Some(&[0x33]),
            _ => None,
        };
        let shift = match bin {
            IntBinary::Shl => Some(4),
            IntBinary::ShrS => Some(7),
            IntBinary::ShrU => Some(5),
            IntBinary::Rotl => Some(0),
            IntBinary::Rotr => Some(1),
            _ => None,
        };

        if let Some(opcode) = simple {
            load(&mut self.code, wide, RAX, SLOTS, lhs);
            op_mem(&mut self.code, None, wide, opcode, RAX, SLOTS, rhs);
        } else if let Some(digit) = shift {
            // The hardware masks the count to the operand width, as wasm does.
            load(&mut self.code, wide, RAX, SLOTS, lhs);
            load(&mut self.code, false, RCX, SLOTS, rhs);
            op_reg(&mut self.code, None, wide, &[0xD3], digit, RAX);
        } else {
            self.emit_division(wide, bin, lhs, rhs)?;
        }
        store(&mut self.code, true, SLOTS, lhs, RAX);
        self.push_operand()?;
        Ok(())
    }

    fn emit_division(&mut self, wide: bool, bin: IntBinary, lhs: i32, rhs: i32) -> CompileResult<()> {
        let signed = matches!(bin, IntBinary::DivS | IntBinary::RemS);
        let remainder = matches!(bin, IntBinary::RemS | IntBinary::RemU);

        load(&mut self.code, wide, RAX, SLOTS, lhs);
        load(&mut self.code, wide, RCX, SLOTS, rhs);
        test_rr(&mut self.code, wide, RCX, RCX);
        let zero = emit_jcc_rel32(&mut self.code, Cond::Equal);
        self.trap_on(zero, TrapCode::IntegerDivideByZero);

        let mut done = None;
        if signed {
            cmp_imm8(&mut self.code, wide, RCX, -1);
            let not_minus_one = emit_jcc_rel32(&mut self.code, Cond::NotEqual);
            if remainder {
                // MIN % -1 would fault in idiv; the result is 0.
                xor_rr(&mut self.code, false, RAX, RAX);
                done = Some(emit_jmp_rel32(&mut self.code));
            } else {
                if wide {
                    mov_imm64(&mut self.code, RDX, i64::MIN as u64);
                    cmp_rr(&mut self.code, true, RAX, RDX);
                } else {
                    self.code.push(0x3D); // cmp eax, imm32
                    self.code.extend_from_slice(&(i32::MIN as u32).to_le_bytes());
                }
                let overflow = emit_jcc_rel32(&mut self.code, Cond::Equal);
                self.trap_on(overflow, TrapCode::IntegerOverflow);
            }
            let here = self.code.len();
            patch_rel32(&mut self.code, not_minus_one, here)?;
            if wide {
                self.code.extend_from_slice(&[0x48, 0x99]); // cqo
            } else {
                self.code.push(0x99); // cdq
            }
            op_reg(&mut self.code, None, wide, &[0xF7], 7, RCX); // idiv rcx
        } else {
            xor_rr(&mut self.code, false, RDX, RDX);
            op_reg(&mut self.code, None, wide, &[0xF7], 6, RCX); // div rcx
        }
        if remainder {
            mov_rr(&mut self.code, wide, RAX, RDX);
        }
        if let Some(done) = done {
            let here = self.code.len();
            patch_rel32(&mut self.code, done, here)?;
        }
        Ok(())
    }

    fn lower_float_binary(&mut self, double: bool, bin: FloatBinary) -> CompileResult<()> {
        let base = self.pop_operands(2)?;
        let lhs = self.stack_disp(base)?;
        let rhs = self.stack_disp(base + 1)?;
        let prefix = if double { 0xF2 } else { 0xF3 };
        let opcode = match bin {
            FloatBinary::Add => 0x58,
            FloatBinary::Sub => 0x5C,
            FloatBinary::Mul => 0x59,
            FloatBinary::Div => 0x5E,
        };
        let code = &mut self.code;
        op_mem(code, Some(prefix), false, &[0x0F, 0x10], XMM0, SLOTS, lhs); // movs[sd] xmm0, [lhs]
        op_mem(code, Some(prefix), false, &[0x0F, opcode], XMM0, SLOTS, rhs);
        // movq rax, xmm0 / movd eax, xmm0; the latter zero-extends into the slot.
        op_reg(code, Some(0x66), double, &[0x0F, 0x7E], XMM0, RAX);
        store(code, true, SLOTS, lhs, RAX);
        self.push_operand()?;
        Ok(())
    }
}
