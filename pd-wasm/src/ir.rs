//! Validated intermediate representation consumed by machine backends.
//!
//! Bodies are structured stack code: every instruction carries the byte
//! offset of the bytecode it was lowered from, and every call target is
//! already resolved to a definition (and, for host calls, a callable).

use std::fmt;
use std::sync::Arc;

use crate::abi::ValueType;
use crate::bridge::HostFunction;
use crate::debug_info::FunctionDefinition;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockType {
    pub params: u32,
    pub results: u32,
}

impl BlockType {
    pub const EMPTY: BlockType = BlockType {
        params: 0,
        results: 0,
    };

    pub fn results(results: u32) -> Self {
        Self { params: 0, results }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemArg {
    pub offset: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadOp {
    I32,
    I64,
    F32,
    F64,
    I32Load8S,
    I32Load8U,
    I32Load16S,
    I32Load16U,
    I64Load32S,
    I64Load32U,
}

impl LoadOp {
    pub fn width(self) -> u32 {
        match self {
            LoadOp::I64 | LoadOp::F64 => 8,
            LoadOp::I32 | LoadOp::F32 | LoadOp::I64Load32S | LoadOp::I64Load32U => 4,
            LoadOp::I32Load16S | LoadOp::I32Load16U => 2,
            LoadOp::I32Load8S | LoadOp::I32Load8U => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    I32,
    I64,
    F32,
    F64,
    I32Store8,
    I32Store16,
    I64Store32,
}

impl StoreOp {
    pub fn width(self) -> u32 {
        match self {
            StoreOp::I64 | StoreOp::F64 => 8,
            StoreOp::I32 | StoreOp::F32 | StoreOp::I64Store32 => 4,
            StoreOp::I32Store16 => 2,
            StoreOp::I32Store8 => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntCompare {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntBinary {
    Add,
    Sub,
    Mul,
    DivS,
    DivU,
    RemS,
    RemU,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
    Rotl,
    Rotr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FloatBinary {
    Add,
    Sub,
    Mul,
    Div,
}

/// A host callable paired with the signature the linker resolved it against.
#[derive(Clone)]
pub struct HostFunc {
    definition: Arc<FunctionDefinition>,
    callable: Arc<dyn HostFunction>,
}

impl HostFunc {
    pub fn new(definition: FunctionDefinition, callable: Arc<dyn HostFunction>) -> Self {
        Self {
            definition: Arc::new(definition),
            callable,
        }
    }

    pub fn definition(&self) -> &Arc<FunctionDefinition> {
        &self.definition
    }

    pub fn callable(&self) -> &Arc<dyn HostFunction> {
        &self.callable
    }

    /// Two handles are the same import when they share definition and callable.
    pub fn same_import(&self, other: &HostFunc) -> bool {
        Arc::ptr_eq(&self.definition, &other.definition)
            && std::ptr::addr_eq(Arc::as_ptr(&self.callable), Arc::as_ptr(&other.callable))
    }
}

impl fmt::Debug for HostFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostFunc")
            .field("definition", &self.definition)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug)]
pub enum CallTarget {
    Function(Arc<FunctionDefinition>),
    Host(HostFunc),
}

impl CallTarget {
    pub fn definition(&self) -> &FunctionDefinition {
        match self {
            CallTarget::Function(definition) => definition,
            CallTarget::Host(host) => host.definition(),
        }
    }
}

#[derive(Clone, Debug)]
pub enum Op {
    Unreachable,
    Nop,
    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    Return,
    Call(CallTarget),
    ReturnCall(CallTarget),
    Drop,
    Select,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),
    GlobalSet(u32),
    Load(LoadOp, MemArg),
    Store(StoreOp, MemArg),
    MemorySize,
    MemoryGrow,
    TableGet(u32),
    TableSize(u32),
    I32Const(i32),
    I64Const(i64),
    F32Const(f32),
    F64Const(f64),
    V128Const(u128),
    I32Eqz,
    I64Eqz,
    I32Compare(IntCompare),
    I64Compare(IntCompare),
    I32Binary(IntBinary),
    I64Binary(IntBinary),
    F32Binary(FloatBinary),
    F64Binary(FloatBinary),
    I32WrapI64,
    I64ExtendI32S,
    I64ExtendI32U,
}

impl Op {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Op::Unreachable => "unreachable",
            Op::Nop => "nop",
            Op::Block(_) => "block",
            Op::Loop(_) => "loop",
            Op::If(_) => "if",
            Op::Else => "else",
            Op::End => "end",
            Op::Br(_) => "br",
            Op::BrIf(_) => "br_if",
            Op::Return => "return",
            Op::Call(_) => "call",
            Op::ReturnCall(_) => "return_call",
            Op::Drop => "drop",
            Op::Select => "select",
            Op::LocalGet(_) => "local.get",
            Op::LocalSet(_) => "local.set",
            Op::LocalTee(_) => "local.tee",
            Op::GlobalGet(_) => "global.get",
            Op::GlobalSet(_) => "global.set",
            Op::Load(..) => "load",
            Op::Store(..) => "store",
            Op::MemorySize => "memory.size",
            Op::MemoryGrow => "memory.grow",
            Op::TableGet(_) => "table.get",
            Op::TableSize(_) => "table.size",
            Op::I32Const(_) => "i32.const",
            Op::I64Const(_) => "i64.const",
            Op::F32Const(_) => "f32.const",
            Op::F64Const(_) => "f64.const",
            Op::V128Const(_) => "v128.const",
            Op::I32Eqz => "i32.eqz",
            Op::I64Eqz => "i64.eqz",
            Op::I32Compare(_) => "i32.compare",
            Op::I64Compare(_) => "i64.compare",
            Op::I32Binary(_) => "i32.binary",
            Op::I64Binary(_) => "i64.binary",
            Op::F32Binary(_) => "f32.binary",
            Op::F64Binary(_) => "f64.binary",
            Op::I32WrapI64 => "i32.wrap_i64",
            Op::I64ExtendI32S => "i64.extend_i32_s",
            Op::I64ExtendI32U => "i64.extend_i32_u",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Instr {
    pub op: Op,
    pub source_offset: u64,
}

#[derive(Clone, Debug)]
pub struct FunctionIr {
    pub definition: Arc<FunctionDefinition>,
    /// Declared locals beyond the parameters.
    pub locals: Vec<ValueType>,
    pub body: Vec<Instr>,
}

impl FunctionIr {
    pub fn name(&self) -> &str {
        self.definition.debug_name()
    }

    pub fn local_count(&self) -> usize {
        self.definition.params().len() + self.locals.len()
    }
}

#[derive(Clone, Debug, Default)]
pub struct ModuleIr {
    pub functions: Vec<FunctionIr>,
}

impl ModuleIr {
    pub fn new(functions: Vec<FunctionIr>) -> Self {
        Self { functions }
    }
}

/// Builds a [`FunctionIr`], stamping each instruction with a source offset.
///
/// Offsets advance by one per instruction from `start_offset` unless set
/// explicitly with [`FunctionBuilder::at`].
pub struct FunctionBuilder {
    definition: Arc<FunctionDefinition>,
    locals: Vec<ValueType>,
    body: Vec<Instr>,
    next_offset: u64,
}

impl FunctionBuilder {
    pub fn new(definition: Arc<FunctionDefinition>) -> Self {
        Self {
            definition,
            locals: Vec::new(),
            body: Vec::new(),
            next_offset: 0,
        }
    }

    pub fn start_offset(mut self, offset: u64) -> Self {
        self.next_offset = offset;
        self
    }

    pub fn local(&mut self, ty: ValueType) -> u32 {
        self.locals.push(ty);
        (self.definition.params().len() + self.locals.len() - 1) as u32
    }

    /// Sets the source offset of the next instruction.
    pub fn at(&mut self, offset: u64) -> &mut Self {
        self.next_offset = offset;
        self
    }

    pub fn position(&self) -> u64 {
        self.next_offset
    }

    pub fn op(&mut self, op: Op) -> &mut Self {
        self.body.push(Instr {
            op,
            source_offset: self.next_offset,
        });
        self.next_offset += 1;
        self
    }

    pub fn local_get(&mut self, index: u32) -> &mut Self {
        self.op(Op::LocalGet(index))
    }

    pub fn local_set(&mut self, index: u32) -> &mut Self {
        self.op(Op::LocalSet(index))
    }

    pub fn i32_const(&mut self, value: i32) -> &mut Self {
        self.op(Op::I32Const(value))
    }

    pub fn i64_const(&mut self, value: i64) -> &mut Self {
        self.op(Op::I64Const(value))
    }

    pub fn call(&mut self, definition: &Arc<FunctionDefinition>) -> &mut Self {
        self.op(Op::Call(CallTarget::Function(definition.clone())))
    }

    pub fn call_host(&mut self, host: &HostFunc) -> &mut Self {
        self.op(Op::Call(CallTarget::Host(host.clone())))
    }

    pub fn end(&mut self) -> &mut Self {
        self.op(Op::End)
    }

    pub fn finish(self) -> FunctionIr {
        FunctionIr {
            definition: self.definition,
            locals: self.locals,
            body: self.body,
        }
    }
}
