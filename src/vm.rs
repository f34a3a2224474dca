// File: src/vm.rs
//
// Virtual machine for executing Lox bytecode.
// Stack-based, with call frames, closures over upvalues, an interned
// string table, and a precise mark-sweep garbage collector. The VM owns
// the heap and all root sets, so a collection can run during both
// compilation and execution.

use std::io::{self, Write};
use std::time::Instant;

use once_cell::sync::Lazy;

use crate::bytecode::{Chunk, OpCode};
use crate::compiler;
use crate::debug;
use crate::errors::{LoxError, RuntimeError, TraceFrame};
use crate::heap::{Heap, ObjRef};
use crate::object::{
    hash_string, ClosureObj, FunctionObj, NativeFn, NativeObj, ObjKind, StringObj, UpvalueObj,
    UpvalueState,
};
use crate::table::Table;
use crate::value::Value;

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

/// The heap grows to this multiple of the live size after each cycle.
const GC_HEAP_GROW_FACTOR: usize = 2;

/// Process start, as observed by the first VM. Backs the `clock` native.
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

fn clock_native(_args: &[Value]) -> Value {
    Value::Number(START_TIME.elapsed().as_secs_f64())
}

/// One activation record: the running closure, its instruction pointer,
/// and the stack slot where its window begins (slot 0 is the callee).
struct CallFrame {
    closure: ObjRef,
    ip: usize,
    slots: usize,
}

pub struct Vm {
    pub heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    /// String intern table. Entries are weak: the GC removes unmarked
    /// keys between marking and sweeping.
    strings: Table,
    /// Head of the open-upvalue list, sorted by decreasing stack slot.
    open_upvalues: Option<ObjRef>,
    stdout: Box<dyn Write>,
    trace: bool,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Build a VM whose `print` output goes to the given sink.
    pub fn with_output(stdout: Box<dyn Write>) -> Self {
        Lazy::force(&START_TIME);
        let mut vm = Vm {
            heap: Heap::new(),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            globals: Table::new(),
            strings: Table::new(),
            open_upvalues: None,
            stdout,
            trace: std::env::var("LOX_TRACE_EXECUTION").is_ok(),
        };
        vm.define_native("clock", clock_native);
        vm
    }

    /// Force a collection on every allocation. The interpreter must
    /// behave identically with this on.
    pub fn set_stress_gc(&mut self, stress: bool) {
        self.heap.stress = stress;
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Compile and run a source string.
    pub fn interpret(&mut self, source: &str) -> Result<(), LoxError> {
        let function = compiler::compile(self, source).map_err(LoxError::Compile)?;

        // The bare function stays on the stack while its closure is
        // allocated, keeping it reachable across a possible collection.
        self.push(Value::Obj(function));
        let upvalue_count = self.heap.function(function).upvalue_count;
        let closure = self.allocate(ObjKind::Closure(ClosureObj {
            function,
            upvalues: Vec::with_capacity(upvalue_count),
        }));
        self.pop();
        self.push(Value::Obj(closure));
        self.call(closure, 0)?;
        self.run()
    }

    // Allocation. Every object goes through here so the collector can
    // run right before the heap grows.

    pub fn allocate(&mut self, kind: ObjKind) -> ObjRef {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
        self.heap.allocate(kind)
    }

    pub fn new_function(&mut self) -> ObjRef {
        self.allocate(ObjKind::Function(FunctionObj {
            arity: 0,
            upvalue_count: 0,
            chunk: Chunk::new(),
            name: None,
        }))
    }

    /// Return the canonical string for these bytes, allocating and
    /// registering it if no live string matches.
    pub fn intern(&mut self, chars: &str) -> ObjRef {
        let hash = hash_string(chars);
        if let Some(existing) = self.strings.find_string(&self.heap, chars, hash) {
            return existing;
        }
        let string = self.allocate(ObjKind::String(StringObj {
            chars: chars.into(),
            hash,
        }));
        self.strings.set(string, hash, Value::Nil);
        string
    }

    fn define_native(&mut self, name: &str, function: NativeFn) {
        let name = self.intern(name);
        // Both objects ride the stack across the allocations so neither
        // can be collected before the globals table holds them.
        self.push(Value::Obj(name));
        let native = self.allocate(ObjKind::Native(NativeObj { function }));
        self.push(Value::Obj(native));
        let hash = self.heap.string(name).hash;
        self.globals.set(name, hash, Value::Obj(native));
        self.pop();
        self.pop();
    }

    // Garbage collection driver. Marks every root the VM knows about,
    // lets the heap trace and sweep, then re-arms the pacing threshold.

    pub fn collect_garbage(&mut self) {
        let before = self.heap.bytes_allocated;
        if self.heap.log {
            eprintln!("[gc] begin cycle");
        }

        for i in 0..self.stack.len() {
            let value = self.stack[i];
            self.heap.mark_value(value);
        }
        for i in 0..self.frames.len() {
            let closure = self.frames[i].closure;
            self.heap.mark_object(closure);
        }
        let mut upvalue = self.open_upvalues;
        while let Some(r) = upvalue {
            self.heap.mark_object(r);
            upvalue = self.heap.upvalue(r).next_open;
        }
        for (key, value) in self.globals.iter() {
            self.heap.mark_object(key);
            self.heap.mark_value(value);
        }
        self.heap.mark_compiler_roots();

        self.heap.trace_references();
        // Intern entries are weak references: drop the keys that did not
        // survive marking, before the sweep would free them.
        self.strings.remove_white(&self.heap);
        let freed = self.heap.sweep();

        self.heap.next_gc = self.heap.bytes_allocated * GC_HEAP_GROW_FACTOR;
        if self.heap.log {
            eprintln!(
                "[gc] end cycle: collected {} bytes (from {} to {}), next at {}",
                freed, before, self.heap.bytes_allocated, self.heap.next_gc
            );
        }
    }

    // Stack primitives.

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    fn reset_stack(&mut self) {
        self.stack.clear();
        self.frames.clear();
        self.open_upvalues = None;
    }

    // Instruction stream access, relative to the current frame.

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().expect("call frame");
        let ip = frame.ip;
        frame.ip += 1;
        let closure = frame.closure;
        let function = self.heap.closure(closure).function;
        self.heap.function(function).chunk.code[ip]
    }

    fn read_short(&mut self) -> u16 {
        let hi = self.read_byte();
        let lo = self.read_byte();
        u16::from_be_bytes([hi, lo])
    }

    fn read_constant(&mut self) -> Value {
        let index = self.read_byte() as usize;
        let frame = self.frames.last().expect("call frame");
        let function = self.heap.closure(frame.closure).function;
        self.heap.function(function).chunk.constants[index]
    }

    fn read_string(&mut self) -> ObjRef {
        match self.read_constant() {
            Value::Obj(r) if self.heap.is_string(r) => r,
            _ => panic!("constant operand is not a string"),
        }
    }

    fn frame_ip_add(&mut self, offset: usize) {
        self.frames.last_mut().expect("call frame").ip += offset;
    }

    fn frame_ip_sub(&mut self, offset: usize) {
        self.frames.last_mut().expect("call frame").ip -= offset;
    }

    // Errors.

    /// Build a runtime error with a stack trace, innermost frame first,
    /// then reset the stack so the VM is reusable.
    fn runtime_error(&mut self, message: &str) -> LoxError {
        let mut trace = Vec::new();
        for frame in self.frames.iter().rev() {
            let function = self.heap.closure(frame.closure).function;
            let function = self.heap.function(function);
            let instruction = frame.ip.saturating_sub(1);
            let line = function.chunk.lines.get(instruction).copied().unwrap_or(0);
            let name = function.name.map(|n| self.heap.string(n).chars.to_string());
            trace.push(TraceFrame { line, function: name });
        }
        self.reset_stack();
        LoxError::Runtime(RuntimeError {
            message: message.to_string(),
            trace,
        })
    }

    // Calls.

    fn call_value(&mut self, callee: Value, arg_count: usize) -> Result<(), LoxError> {
        if let Value::Obj(r) = callee {
            if self.heap.is_closure(r) {
                return self.call(r, arg_count);
            }
            if let Some(native) = self.heap.native_fn(r) {
                // Natives bypass the frame machinery entirely.
                let start = self.stack.len() - arg_count;
                let result = native(&self.stack[start..]);
                self.stack.truncate(start - 1);
                self.push(result);
                return Ok(());
            }
        }
        Err(self.runtime_error("Can only call functions and classes."))
    }

    fn call(&mut self, closure: ObjRef, arg_count: usize) -> Result<(), LoxError> {
        let function = self.heap.closure(closure).function;
        let arity = self.heap.function(function).arity;
        if arg_count != arity {
            let message = format!("Expected {} arguments but got {}.", arity, arg_count);
            return Err(self.runtime_error(&message));
        }
        if self.frames.len() == FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            slots: self.stack.len() - arg_count - 1,
        });
        Ok(())
    }

    // Upvalues.

    /// Reuse the open upvalue for `slot` if one exists, otherwise create
    /// one and splice it into the sorted open list.
    fn capture_upvalue(&mut self, slot: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut cursor = self.open_upvalues;
        while let Some(r) = cursor {
            match self.heap.upvalue(r).state {
                UpvalueState::Open(s) if s > slot => {
                    prev = Some(r);
                    cursor = self.heap.upvalue(r).next_open;
                }
                _ => break,
            }
        }
        if let Some(r) = cursor {
            if matches!(self.heap.upvalue(r).state, UpvalueState::Open(s) if s == slot) {
                return r;
            }
        }

        let created = self.allocate(ObjKind::Upvalue(UpvalueObj {
            state: UpvalueState::Open(slot),
            next_open: cursor,
        }));
        match prev {
            Some(p) => self.heap.upvalue_mut(p).next_open = Some(created),
            None => self.open_upvalues = Some(created),
        }
        created
    }

    /// Close every open upvalue at or above `last`: copy the stack value
    /// into the upvalue and unlink it from the open list.
    fn close_upvalues(&mut self, last: usize) {
        while let Some(r) = self.open_upvalues {
            let UpvalueState::Open(slot) = self.heap.upvalue(r).state else {
                panic!("closed upvalue on the open list");
            };
            if slot < last {
                break;
            }
            let value = self.stack[slot];
            let next = self.heap.upvalue(r).next_open;
            let upvalue = self.heap.upvalue_mut(r);
            upvalue.state = UpvalueState::Closed(value);
            upvalue.next_open = None;
            self.open_upvalues = next;
        }
    }

    // Binary operators on numbers. ADD is special-cased in the loop for
    // string concatenation.

    fn numeric_binary(&mut self, op: OpCode) -> Result<(), LoxError> {
        let (Value::Number(b), Value::Number(a)) = (self.peek(0), self.peek(1)) else {
            return Err(self.runtime_error("Operands must be numbers."));
        };
        self.pop();
        self.pop();
        let result = match op {
            OpCode::Greater => Value::Bool(a > b),
            OpCode::Less => Value::Bool(a < b),
            OpCode::Subtract => Value::Number(a - b),
            OpCode::Multiply => Value::Number(a * b),
            OpCode::Divide => Value::Number(a / b),
            _ => unreachable!("not a numeric binary opcode"),
        };
        self.push(result);
        Ok(())
    }

    fn concatenate(&mut self) {
        // Both operands stay on the stack until the result is interned,
        // so the allocation below cannot collect them.
        let Value::Obj(b) = self.peek(0) else {
            panic!("concatenate on non-string")
        };
        let Value::Obj(a) = self.peek(1) else {
            panic!("concatenate on non-string")
        };
        let mut chars = String::with_capacity(
            self.heap.string(a).chars.len() + self.heap.string(b).chars.len(),
        );
        chars.push_str(&self.heap.string(a).chars);
        chars.push_str(&self.heap.string(b).chars);
        let result = self.intern(&chars);
        self.pop();
        self.pop();
        self.push(Value::Obj(result));
    }

    // The dispatch loop.

    fn run(&mut self) -> Result<(), LoxError> {
        loop {
            if self.trace {
                self.trace_instruction();
            }
            let op = OpCode::from_byte(self.read_byte()).expect("valid opcode");
            match op {
                OpCode::Constant => {
                    let constant = self.read_constant();
                    self.push(constant);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("call frame").slots;
                    let value = self.stack[base + slot];
                    self.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.read_byte() as usize;
                    let base = self.frames.last().expect("call frame").slots;
                    // Assignment is an expression; the value stays put.
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    match self.globals.get(name, hash) {
                        Some(value) => self.push(value),
                        None => {
                            let message = format!(
                                "Undefined variable '{}'.",
                                self.heap.string(name).chars
                            );
                            return Err(self.runtime_error(&message));
                        }
                    }
                }
                OpCode::DefineGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    self.globals.set(name, hash, value);
                    self.pop();
                }
                OpCode::SetGlobal => {
                    let name = self.read_string();
                    let hash = self.heap.string(name).hash;
                    let value = self.peek(0);
                    if self.globals.set(name, hash, value) {
                        // Assignment must not create a global; undo the
                        // insertion before reporting.
                        self.globals.delete(name, hash);
                        let message = format!(
                            "Undefined variable '{}'.",
                            self.heap.string(name).chars
                        );
                        return Err(self.runtime_error(&message));
                    }
                }
                OpCode::GetUpvalue => {
                    let index = self.read_byte() as usize;
                    let frame = self.frames.last().expect("call frame");
                    let upvalue = self.heap.closure(frame.closure).upvalues[index];
                    let value = match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot],
                        UpvalueState::Closed(value) => value,
                    };
                    self.push(value);
                }
                OpCode::SetUpvalue => {
                    let index = self.read_byte() as usize;
                    let frame = self.frames.last().expect("call frame");
                    let upvalue = self.heap.closure(frame.closure).upvalues[index];
                    let value = self.peek(0);
                    match self.heap.upvalue(upvalue).state {
                        UpvalueState::Open(slot) => self.stack[slot] = value,
                        UpvalueState::Closed(_) => {
                            self.heap.upvalue_mut(upvalue).state = UpvalueState::Closed(value);
                        }
                    }
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater
                | OpCode::Less
                | OpCode::Subtract
                | OpCode::Multiply
                | OpCode::Divide => {
                    self.numeric_binary(op)?;
                }
                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    match (a, b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.pop();
                            self.pop();
                            self.push(Value::Number(a + b));
                        }
                        (Value::Obj(a), Value::Obj(b))
                            if self.heap.is_string(a) && self.heap.is_string(b) =>
                        {
                            self.concatenate();
                        }
                        _ => {
                            return Err(self.runtime_error(
                                "Operands must be two numbers or two strings.",
                            ));
                        }
                    }
                }
                OpCode::Not => {
                    let value = self.pop();
                    self.push(Value::Bool(value.is_falsey()));
                }
                OpCode::Negate => {
                    let Value::Number(n) = self.peek(0) else {
                        return Err(self.runtime_error("Operand must be a number."));
                    };
                    self.pop();
                    self.push(Value::Number(-n));
                }
                OpCode::Print => {
                    let value = self.pop();
                    let text = value.display(&self.heap);
                    let _ = writeln!(self.stdout, "{}", text);
                }
                OpCode::Jump => {
                    let offset = self.read_short() as usize;
                    self.frame_ip_add(offset);
                }
                OpCode::JumpIfFalse => {
                    let offset = self.read_short() as usize;
                    // The condition is left on the stack; the compiled
                    // code pops it on both paths.
                    if self.peek(0).is_falsey() {
                        self.frame_ip_add(offset);
                    }
                }
                OpCode::Loop => {
                    let offset = self.read_short() as usize;
                    self.frame_ip_sub(offset);
                }
                OpCode::Call => {
                    let arg_count = self.read_byte() as usize;
                    let callee = self.peek(arg_count);
                    self.call_value(callee, arg_count)?;
                }
                OpCode::Closure => {
                    let Value::Obj(function) = self.read_constant() else {
                        panic!("closure operand is not a function")
                    };
                    let upvalue_count = self.heap.function(function).upvalue_count;
                    let closure = self.allocate(ObjKind::Closure(ClosureObj {
                        function,
                        upvalues: Vec::with_capacity(upvalue_count),
                    }));
                    // On the stack before the captures below allocate.
                    self.push(Value::Obj(closure));
                    for _ in 0..upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        let captured = if is_local {
                            let base = self.frames.last().expect("call frame").slots;
                            self.capture_upvalue(base + index)
                        } else {
                            let frame = self.frames.last().expect("call frame");
                            self.heap.closure(frame.closure).upvalues[index]
                        };
                        self.heap.closure_mut(closure).upvalues.push(captured);
                    }
                }
                OpCode::CloseUpvalue => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                OpCode::Return => {
                    let result = self.pop();
                    let slots = self.frames.last().expect("call frame").slots;
                    self.close_upvalues(slots);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        // The script closure itself.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(slots);
                    self.push(result);
                }
            }
        }
    }

    fn trace_instruction(&self) {
        let mut line = String::from("          ");
        for value in &self.stack {
            line.push_str(&format!("[ {} ]", value.display(&self.heap)));
        }
        eprintln!("{}", line);
        let frame = self.frames.last().expect("call frame");
        let function = self.heap.closure(frame.closure).function;
        let chunk = &self.heap.function(function).chunk;
        let (text, _) = debug::disassemble_instruction(&self.heap, chunk, frame.ip);
        eprintln!("{}", text);
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}
