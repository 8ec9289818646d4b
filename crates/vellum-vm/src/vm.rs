//! The stack-based bytecode interpreter (§4.H): calling convention, upvalue
//! capture/close, class/method dispatch, and the GC trigger point.

use std::fmt::Write as _;
use std::io::Write as IoWrite;

use vellum_core::table::hash_bytes;
use vellum_core::{Chunk, Heap, Obj, ObjKind, ObjRef, OpCode, Table, Value};
use vellum_core::heap::UpvalueLoc;

use crate::error::VmError;
use crate::frame::CallFrame;
use crate::natives;

/// Caps recursion depth; a script-triggered overflow surfaces as a normal
/// runtime error rather than exhausting the host stack.
const MAX_FRAMES: usize = 1024;

/// Runtime knobs the CLI exposes as flags/env vars (§0 ambient config).
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Print each executed instruction and the value stack before it runs.
    pub trace_execution: bool,
    /// Force a collection before every allocation (`--stress-gc`).
    pub stress_gc: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig { trace_execution: false, stress_gc: false }
    }
}

/// Owns the heap, value stack, call frames, and global table for one
/// program run.
pub struct Vm {
    heap: Heap,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: Table,
    open_upvalues: Vec<ObjRef>,
    init_string: ObjRef,
    init_hash: u64,
    config: VmConfig,
}

impl Vm {
    /// A fresh VM with the standard native functions already defined.
    #[must_use]
    pub fn new(config: VmConfig) -> Self {
        let mut heap = Heap::new();
        heap.stress_gc = config.stress_gc;
        let init_string = heap.intern("init");
        let init_hash = hash_bytes(heap.string_bytes(init_string));

        let mut vm = Vm {
            heap,
            stack: Vec::new(),
            frames: Vec::new(),
            globals: Table::new(),
            open_upvalues: Vec::new(),
            init_string,
            init_hash,
            config,
        };
        vm.define_native("clock", 0, natives::clock);
        vm.define_native("sqrt", 1, natives::sqrt);
        vm
    }

    /// Direct access to the heap, so a compiler can allocate objects (string
    /// constants, the top-level function) into the same arena this VM runs
    /// against.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Read-only heap access, for inspecting compiled output (e.g. `--dump`)
    /// without needing a second mutable borrow.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    fn define_native(&mut self, name: &'static str, arity: u8, function: vellum_core::heap::NativeFn) {
        let name_ref = self.heap.intern(name);
        let hash = hash_bytes(name.as_bytes());
        let native_ref = self.heap.alloc(Obj::Native { name, arity, function });
        self.globals.set(name_ref, hash, Value::Obj(native_ref));
    }

    /// Runs a compiled top-level script function to completion.
    pub fn run(&mut self, script: ObjRef, out: &mut dyn IoWrite) -> Result<(), VmError> {
        let closure = self.heap.alloc(Obj::Closure { function: script, upvalues: Vec::new() });
        self.stack.push(Value::Obj(closure));
        self.frames.push(CallFrame { closure, ip: 0, base: 0 });

        loop {
            if self.config.trace_execution {
                self.trace_instruction();
            }
            self.maybe_collect();

            let byte = self.read_u8();
            let Some(op) = OpCode::from_u8(byte) else {
                return Err(self.runtime_error(format!("invalid opcode byte {byte:#04x}")));
            };

            match op {
                OpCode::Constant => {
                    let idx = u32::from(self.read_u8());
                    let v = self.read_constant(idx);
                    self.push(v);
                }
                OpCode::ConstantLong => {
                    let idx = self.read_u24();
                    let v = self.read_constant(idx);
                    self.push(v);
                }
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.pop();
                }
                OpCode::GetLocal => {
                    let slot = usize::from(self.read_u8());
                    let base = self.frames.last().unwrap().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::GetLocalLong => {
                    let slot = self.read_u24() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = usize::from(self.read_u8());
                    let base = self.frames.last().unwrap().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::SetLocalLong => {
                    let slot = self.read_u24() as usize;
                    let base = self.frames.last().unwrap().base;
                    self.stack[base + slot] = self.peek(0);
                }
                OpCode::GetGlobal => {
                    let idx = u32::from(self.read_u8());
                    self.get_global(idx)?;
                }
                OpCode::GetGlobalLong => {
                    let idx = self.read_u24();
                    self.get_global(idx)?;
                }
                OpCode::SetGlobal => {
                    let idx = u32::from(self.read_u8());
                    self.set_global(idx)?;
                }
                OpCode::SetGlobalLong => {
                    let idx = self.read_u24();
                    self.set_global(idx)?;
                }
                OpCode::DefineGlobal => {
                    let idx = u32::from(self.read_u8());
                    self.define_global(idx);
                }
                OpCode::DefineGlobalLong => {
                    let idx = self.read_u24();
                    self.define_global(idx);
                }
                OpCode::GetUpvalue => {
                    let idx = self.read_u8();
                    let v = self.read_upvalue(idx);
                    self.push(v);
                }
                OpCode::SetUpvalue => {
                    let idx = self.read_u8();
                    let v = self.peek(0);
                    self.write_upvalue(idx, v);
                }
                OpCode::CloseUpvalue => {
                    let top = self.stack.len() - 1;
                    self.close_upvalues(top);
                    self.pop();
                }
                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                OpCode::Greater => self.binary_cmp(|a, b| a > b)?,
                OpCode::Less => self.binary_cmp(|a, b| a < b)?,
                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_numeric(|a, b| a - b)?,
                OpCode::Multiply => self.binary_numeric(|a, b| a * b)?,
                OpCode::Divide => self.binary_numeric(|a, b| a / b)?,
                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(!v.is_truthy()));
                }
                OpCode::Negate => {
                    let v = self.peek(0);
                    match v.as_number() {
                        Some(n) => {
                            self.pop();
                            self.push(Value::Number(-n));
                        }
                        None => return Err(self.runtime_error("Operand must be a number.".to_string())),
                    }
                }
                OpCode::Print => {
                    let v = self.pop();
                    let text = self.stringify(v);
                    let _ = writeln!(out, "{text}");
                }
                OpCode::Jump => {
                    let offset = usize::from(self.read_u16());
                    self.frames.last_mut().unwrap().ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = usize::from(self.read_u16());
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = usize::from(self.read_u16());
                    self.frames.last_mut().unwrap().ip -= offset;
                }
                OpCode::Call => {
                    let argc = usize::from(self.read_u8());
                    let callee = self.peek(argc);
                    self.call_value(callee, argc)?;
                }
                OpCode::Closure => self.closure_op(),
                OpCode::Class => {
                    let idx = u32::from(self.read_u8());
                    let Value::Obj(name_ref) = self.read_constant(idx) else {
                        unreachable!("Class operand must name an interned string constant")
                    };
                    let class = self.heap.alloc(Obj::Class { name: name_ref, methods: Table::new() });
                    self.push(Value::Obj(class));
                }
                OpCode::Method => {
                    let idx = u32::from(self.read_u8());
                    let Value::Obj(name_ref) = self.read_constant(idx) else {
                        unreachable!("Method operand must name an interned string constant")
                    };
                    self.define_method(name_ref);
                }
                OpCode::Inherit => self.inherit()?,
                OpCode::GetProperty => self.get_property()?,
                OpCode::SetProperty => self.set_property()?,
                OpCode::Invoke => {
                    let idx = u32::from(self.read_u8());
                    let argc = usize::from(self.read_u8());
                    let Value::Obj(name_ref) = self.read_constant(idx) else {
                        unreachable!("Invoke operand must name an interned string constant")
                    };
                    self.invoke(name_ref, argc)?;
                }
                OpCode::GetSuper => {
                    let idx = u32::from(self.read_u8());
                    let Value::Obj(name_ref) = self.read_constant(idx) else {
                        unreachable!("GetSuper operand must name an interned string constant")
                    };
                    let Value::Obj(super_ref) = self.pop() else {
                        unreachable!("compiler always pushes the superclass before GetSuper")
                    };
                    let hash = hash_bytes(self.heap.string_bytes(name_ref));
                    let bound = self.bind_method(super_ref, name_ref, hash)?;
                    self.pop();
                    self.push(bound);
                }
                OpCode::SuperInvoke => {
                    let idx = u32::from(self.read_u8());
                    let argc = usize::from(self.read_u8());
                    let Value::Obj(name_ref) = self.read_constant(idx) else {
                        unreachable!("SuperInvoke operand must name an interned string constant")
                    };
                    let Value::Obj(super_ref) = self.pop() else {
                        unreachable!("compiler always pushes the superclass before SuperInvoke")
                    };
                    let hash = hash_bytes(self.heap.string_bytes(name_ref));
                    self.invoke_from_class(super_ref, name_ref, hash, argc)?;
                }
                OpCode::Return => {
                    let result = self.pop();
                    let base = self.frames.last().unwrap().base;
                    self.close_upvalues(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(base);
                    self.push(result);
                }
            }
        }
    }

    // ---------- bytecode reading ----------

    fn chunk_for(heap: &Heap, closure: ObjRef) -> &Chunk {
        match heap.get(closure) {
            Obj::Closure { function, .. } => match heap.get(*function) {
                Obj::Function { chunk, .. } => chunk,
                _ => unreachable!("closure's function slot holds a non-Function"),
            },
            _ => unreachable!("frame.closure is not a Closure"),
        }
    }

    fn current_closure(&self) -> ObjRef {
        self.frames.last().unwrap().closure
    }

    fn read_u8(&mut self) -> u8 {
        let closure = self.current_closure();
        let idx = self.frames.len() - 1;
        let ip = self.frames[idx].ip;
        let byte = Self::chunk_for(&self.heap, closure).code[ip];
        self.frames[idx].ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let hi = self.read_u8();
        let lo = self.read_u8();
        u16::from_be_bytes([hi, lo])
    }

    fn read_u24(&mut self) -> u32 {
        let a = self.read_u8();
        let b = self.read_u8();
        let c = self.read_u8();
        u32::from_be_bytes([0, a, b, c])
    }

    fn read_constant(&self, idx: u32) -> Value {
        let closure = self.current_closure();
        Self::chunk_for(&self.heap, closure).constants[idx as usize]
    }

    // ---------- stack ----------

    fn push(&mut self, v: Value) {
        self.stack.push(v);
    }

    /// Bytecode emitted by this crate's own compiler always balances
    /// push/pop, so an empty stack here signals a VM or compiler defect,
    /// not user input.
    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow: unbalanced bytecode")
    }

    fn peek(&self, distance: usize) -> Value {
        self.stack[self.stack.len() - 1 - distance]
    }

    // ---------- globals ----------

    fn get_global(&mut self, idx: u32) -> Result<(), VmError> {
        let Value::Obj(name_ref) = self.read_constant(idx) else {
            unreachable!("global operand must name an interned string constant")
        };
        let hash = hash_bytes(self.heap.string_bytes(name_ref));
        match self.globals.get(name_ref, hash) {
            Some(v) => {
                self.push(v);
                Ok(())
            }
            None => {
                let name = self.string_contents(name_ref);
                Err(self.runtime_error(format!("Undefined variable '{name}'.")))
            }
        }
    }

    fn set_global(&mut self, idx: u32) -> Result<(), VmError> {
        let Value::Obj(name_ref) = self.read_constant(idx) else {
            unreachable!("global operand must name an interned string constant")
        };
        let hash = hash_bytes(self.heap.string_bytes(name_ref));
        let value = self.peek(0);
        let was_new = self.globals.set(name_ref, hash, value);
        if was_new {
            self.globals.delete(name_ref, hash);
            let name = self.string_contents(name_ref);
            return Err(self.runtime_error(format!("Undefined variable '{name}'.")));
        }
        Ok(())
    }

    fn define_global(&mut self, idx: u32) {
        let Value::Obj(name_ref) = self.read_constant(idx) else {
            unreachable!("global operand must name an interned string constant")
        };
        let hash = hash_bytes(self.heap.string_bytes(name_ref));
        let value = self.pop();
        // Redefinition silently overwrites (§9 open-question resolution).
        self.globals.set(name_ref, hash, value);
    }

    // ---------- upvalues ----------

    fn read_upvalue(&self, idx: u8) -> Value {
        let closure = self.current_closure();
        let up_ref = match self.heap.get(closure) {
            Obj::Closure { upvalues, .. } => upvalues[idx as usize],
            _ => unreachable!(),
        };
        match self.heap.get(up_ref) {
            Obj::Upvalue { loc: UpvalueLoc::Stack(s), .. } => self.stack[*s],
            Obj::Upvalue { loc: UpvalueLoc::Closed, closed } => *closed,
            _ => unreachable!(),
        }
    }

    fn write_upvalue(&mut self, idx: u8, value: Value) {
        let closure = self.current_closure();
        let up_ref = match self.heap.get(closure) {
            Obj::Closure { upvalues, .. } => upvalues[idx as usize],
            _ => unreachable!(),
        };
        let slot = match self.heap.get(up_ref) {
            Obj::Upvalue { loc: UpvalueLoc::Stack(s), .. } => Some(*s),
            _ => None,
        };
        match slot {
            Some(s) => self.stack[s] = value,
            None => {
                if let Obj::Upvalue { closed, .. } = self.heap.get_mut(up_ref) {
                    *closed = value;
                }
            }
        }
    }

    fn capture_upvalue(&mut self, stack_slot: usize) -> ObjRef {
        for &up in &self.open_upvalues {
            if let Obj::Upvalue { loc: UpvalueLoc::Stack(s), .. } = self.heap.get(up) {
                if *s == stack_slot {
                    return up;
                }
            }
        }
        let up = self.heap.alloc(Obj::Upvalue { loc: UpvalueLoc::Stack(stack_slot), closed: Value::Nil });
        self.open_upvalues.push(up);
        up
    }

    fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let up = self.open_upvalues[i];
            let slot = match self.heap.get(up) {
                Obj::Upvalue { loc: UpvalueLoc::Stack(s), .. } => Some(*s),
                _ => None,
            };
            match slot {
                Some(s) if s >= from => {
                    let value = self.stack[s];
                    if let Obj::Upvalue { loc, closed } = self.heap.get_mut(up) {
                        *loc = UpvalueLoc::Closed;
                        *closed = value;
                    }
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    fn closure_op(&mut self) {
        let idx = u32::from(self.read_u8());
        let Value::Obj(func_ref) = self.read_constant(idx) else {
            unreachable!("Closure operand must name a Function constant")
        };
        let upvalue_count = match self.heap.get(func_ref) {
            Obj::Function { upvalue_count, .. } => *upvalue_count,
            _ => unreachable!(),
        };
        let enclosing = self.current_closure();
        let mut upvalues = Vec::with_capacity(upvalue_count as usize);
        for _ in 0..upvalue_count {
            let is_local = self.read_u8() != 0;
            let index = self.read_u8();
            if is_local {
                let base = self.frames.last().unwrap().base;
                upvalues.push(self.capture_upvalue(base + index as usize));
            } else {
                let up_ref = match self.heap.get(enclosing) {
                    Obj::Closure { upvalues, .. } => upvalues[index as usize],
                    _ => unreachable!(),
                };
                upvalues.push(up_ref);
            }
        }
        let closure = self.heap.alloc(Obj::Closure { function: func_ref, upvalues });
        self.push(Value::Obj(closure));
    }

    // ---------- arithmetic ----------

    fn binary_numeric(&mut self, op: impl Fn(f64, f64) -> f64) -> Result<(), VmError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Number(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.".to_string())),
        }
    }

    fn binary_cmp(&mut self, op: impl Fn(f64, f64) -> bool) -> Result<(), VmError> {
        let b = self.pop();
        let a = self.pop();
        match (a.as_number(), b.as_number()) {
            (Some(x), Some(y)) => {
                self.push(Value::Bool(op(x, y)));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be numbers.".to_string())),
        }
    }

    fn add(&mut self) -> Result<(), VmError> {
        let b = self.pop();
        let a = self.pop();
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.push(Value::Number(x + y));
                Ok(())
            }
            (Value::Obj(ra), Value::Obj(rb)) if self.is_string(ra) && self.is_string(rb) => {
                let mut combined = self.string_contents(ra);
                combined.push_str(&self.string_contents(rb));
                let r = self.heap.intern(&combined);
                self.push(Value::Obj(r));
                Ok(())
            }
            _ => Err(self.runtime_error("Operands must be two numbers or two strings.".to_string())),
        }
    }

    fn is_string(&self, r: ObjRef) -> bool {
        matches!(self.heap.get(r), Obj::String { .. })
    }

    fn string_contents(&self, r: ObjRef) -> String {
        String::from_utf8_lossy(self.heap.string_bytes(r)).into_owned()
    }

    // ---------- calls ----------

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), VmError> {
        let Value::Obj(r) = callee else {
            return Err(self.runtime_error("Can only call functions and classes.".to_string()));
        };
        match self.heap.get(r).kind() {
            ObjKind::Closure => self.call_closure(r, argc),
            ObjKind::Native => self.call_native(r, argc),
            ObjKind::Class => self.call_class(r, argc),
            ObjKind::BoundMethod => {
                let (receiver, method) = match self.heap.get(r) {
                    Obj::BoundMethod { receiver, method } => (*receiver, *method),
                    _ => unreachable!(),
                };
                let args_start = self.stack.len() - argc - 1;
                self.stack[args_start] = receiver;
                self.call_closure(method, argc)
            }
            _ => Err(self.runtime_error("Can only call functions and classes.".to_string())),
        }
    }

    fn call_closure(&mut self, closure_ref: ObjRef, argc: usize) -> Result<(), VmError> {
        let function_ref = match self.heap.get(closure_ref) {
            Obj::Closure { function, .. } => *function,
            _ => unreachable!("call_closure given a non-Closure"),
        };
        let arity = match self.heap.get(function_ref) {
            Obj::Function { arity, .. } => *arity,
            _ => unreachable!(),
        };
        if argc != arity as usize {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error("Stack overflow.".to_string()));
        }
        let base = self.stack.len() - argc - 1;
        self.frames.push(CallFrame { closure: closure_ref, ip: 0, base });
        Ok(())
    }

    fn call_native(&mut self, native_ref: ObjRef, argc: usize) -> Result<(), VmError> {
        let (function, arity) = match self.heap.get(native_ref) {
            Obj::Native { function, arity, .. } => (*function, *arity),
            _ => unreachable!(),
        };
        if argc != arity as usize {
            return Err(self.runtime_error(format!("Expected {arity} arguments but got {argc}.")));
        }
        let args_start = self.stack.len() - argc;
        let args: Vec<Value> = self.stack[args_start..].to_vec();
        match function(&args) {
            Ok(result) => {
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Err(message) => Err(self.runtime_error(message)),
        }
    }

    fn call_class(&mut self, class_ref: ObjRef, argc: usize) -> Result<(), VmError> {
        let instance = self.heap.alloc(Obj::Instance { class: class_ref, fields: Table::new() });
        let args_start = self.stack.len() - argc - 1;
        self.stack[args_start] = Value::Obj(instance);

        let init = match self.heap.get(class_ref) {
            Obj::Class { methods, .. } => methods.get(self.init_string, self.init_hash),
            _ => unreachable!(),
        };
        match init {
            Some(Value::Obj(init_ref)) => self.call_closure(init_ref, argc),
            Some(_) => unreachable!("a method table value is always a Closure"),
            None => {
                if argc != 0 {
                    return Err(self.runtime_error(format!("Expected 0 arguments but got {argc}.")));
                }
                Ok(())
            }
        }
    }

    // ---------- classes, instances, methods ----------

    fn bind_method(&mut self, class_ref: ObjRef, name_ref: ObjRef, name_hash: u64) -> Result<Value, VmError> {
        let method_val = match self.heap.get(class_ref) {
            Obj::Class { methods, .. } => methods.get(name_ref, name_hash),
            _ => unreachable!(),
        };
        match method_val {
            Some(Value::Obj(method_ref)) => {
                let receiver = self.peek(0);
                let bound = self.heap.alloc(Obj::BoundMethod { receiver, method: method_ref });
                Ok(Value::Obj(bound))
            }
            _ => {
                let name = self.string_contents(name_ref);
                Err(self.runtime_error(format!("Undefined property '{name}'.")))
            }
        }
    }

    fn define_method(&mut self, name_ref: ObjRef) {
        let method_val = self.peek(0);
        let Value::Obj(class_ref) = self.peek(1) else {
            unreachable!("a class is always beneath its methods during class body compilation")
        };
        let hash = hash_bytes(self.heap.string_bytes(name_ref));
        if let Obj::Class { methods, .. } = self.heap.get_mut(class_ref) {
            methods.set(name_ref, hash, method_val);
        }
        self.pop();
    }

    fn inherit(&mut self) -> Result<(), VmError> {
        let Value::Obj(super_ref) = self.peek(1) else {
            return Err(self.runtime_error("Superclass must be a class.".to_string()));
        };
        if !matches!(self.heap.get(super_ref), Obj::Class { .. }) {
            return Err(self.runtime_error("Superclass must be a class.".to_string()));
        }
        let Value::Obj(sub_ref) = self.peek(0) else {
            unreachable!("compiler always pushes the subclass before Inherit")
        };

        let entries: Vec<(ObjRef, u64, Value)> = match self.heap.get(super_ref) {
            Obj::Class { methods, .. } => {
                methods.iter().map(|(k, v)| (k, hash_bytes(self.heap.string_bytes(k)), v)).collect()
            }
            _ => unreachable!(),
        };
        if let Obj::Class { methods, .. } = self.heap.get_mut(sub_ref) {
            for (k, hash, v) in entries {
                methods.set(k, hash, v);
            }
        }
        self.pop();
        Ok(())
    }

    fn get_property(&mut self) -> Result<(), VmError> {
        let idx = u32::from(self.read_u8());
        let Value::Obj(name_ref) = self.read_constant(idx) else {
            unreachable!("GetProperty operand must name an interned string constant")
        };
        let Value::Obj(inst_ref) = self.peek(0) else {
            return Err(self.runtime_error("Only instances have properties.".to_string()));
        };
        if !matches!(self.heap.get(inst_ref), Obj::Instance { .. }) {
            return Err(self.runtime_error("Only instances have properties.".to_string()));
        }
        let hash = hash_bytes(self.heap.string_bytes(name_ref));
        let field = match self.heap.get(inst_ref) {
            Obj::Instance { fields, .. } => fields.get(name_ref, hash),
            _ => unreachable!(),
        };
        match field {
            Some(v) => {
                self.pop();
                self.push(v);
            }
            None => {
                let class_ref = match self.heap.get(inst_ref) {
                    Obj::Instance { class, .. } => *class,
                    _ => unreachable!(),
                };
                let bound = self.bind_method(class_ref, name_ref, hash)?;
                self.pop();
                self.push(bound);
            }
        }
        Ok(())
    }

    fn set_property(&mut self) -> Result<(), VmError> {
        let idx = u32::from(self.read_u8());
        let Value::Obj(name_ref) = self.read_constant(idx) else {
            unreachable!("SetProperty operand must name an interned string constant")
        };
        let value = self.peek(0);
        let Value::Obj(inst_ref) = self.peek(1) else {
            return Err(self.runtime_error("Only instances have fields.".to_string()));
        };
        if !matches!(self.heap.get(inst_ref), Obj::Instance { .. }) {
            return Err(self.runtime_error("Only instances have fields.".to_string()));
        }
        let hash = hash_bytes(self.heap.string_bytes(name_ref));
        if let Obj::Instance { fields, .. } = self.heap.get_mut(inst_ref) {
            fields.set(name_ref, hash, value);
        }
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }

    fn invoke(&mut self, name_ref: ObjRef, argc: usize) -> Result<(), VmError> {
        let Value::Obj(inst_ref) = self.peek(argc) else {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        };
        if !matches!(self.heap.get(inst_ref), Obj::Instance { .. }) {
            return Err(self.runtime_error("Only instances have methods.".to_string()));
        }
        let hash = hash_bytes(self.heap.string_bytes(name_ref));
        let field = match self.heap.get(inst_ref) {
            Obj::Instance { fields, .. } => fields.get(name_ref, hash),
            _ => unreachable!(),
        };
        if let Some(v) = field {
            let args_start = self.stack.len() - argc - 1;
            self.stack[args_start] = v;
            return self.call_value(v, argc);
        }
        let class_ref = match self.heap.get(inst_ref) {
            Obj::Instance { class, .. } => *class,
            _ => unreachable!(),
        };
        self.invoke_from_class(class_ref, name_ref, hash, argc)
    }

    fn invoke_from_class(&mut self, class_ref: ObjRef, name_ref: ObjRef, name_hash: u64, argc: usize) -> Result<(), VmError> {
        let method_val = match self.heap.get(class_ref) {
            Obj::Class { methods, .. } => methods.get(name_ref, name_hash),
            _ => unreachable!(),
        };
        match method_val {
            Some(Value::Obj(method_ref)) => self.call_closure(method_ref, argc),
            _ => {
                let name = self.string_contents(name_ref);
                Err(self.runtime_error(format!("Undefined property '{name}'.")))
            }
        }
    }

    // ---------- printing & tracing ----------

    /// Renders a value the way `print` surfaces it: strings print their raw
    /// content (no quotes), objects print a `<...>` placeholder naming their
    /// kind, matching the original implementation's `printValue`.
    fn stringify(&self, v: Value) -> String {
        match v {
            Value::Obj(r) => match self.heap.get(r) {
                Obj::String { .. } => self.string_contents(r),
                Obj::Function { name: Some(n), .. } => format!("<fn {}>", self.string_contents(*n)),
                Obj::Function { name: None, .. } => "<script>".to_string(),
                Obj::Closure { function, .. } => match self.heap.get(*function) {
                    Obj::Function { name: Some(n), .. } => format!("<fn {}>", self.string_contents(*n)),
                    _ => "<script>".to_string(),
                },
                Obj::Class { name, .. } => self.string_contents(*name),
                Obj::Instance { class, .. } => {
                    let class_name = match self.heap.get(*class) {
                        Obj::Class { name, .. } => self.string_contents(*name),
                        _ => unreachable!(),
                    };
                    format!("{class_name} instance")
                }
                Obj::BoundMethod { method, .. } => match self.heap.get(*method) {
                    Obj::Closure { function, .. } => match self.heap.get(*function) {
                        Obj::Function { name: Some(n), .. } => format!("<fn {}>", self.string_contents(*n)),
                        _ => "<script>".to_string(),
                    },
                    _ => unreachable!(),
                },
                Obj::Native { .. } => "<native fn>".to_string(),
                Obj::Upvalue { .. } => "<upvalue>".to_string(),
            },
            other => other.to_string(),
        }
    }

    #[cfg(feature = "trace-execution")]
    fn trace_instruction(&self) {
        let mut stack_dump = String::new();
        for v in &self.stack {
            let _ = write!(stack_dump, "[ {} ]", self.stringify(*v));
        }
        tracing::trace!("          {stack_dump}");

        let frame = self.frames.last().unwrap();
        let chunk = Self::chunk_for(&self.heap, frame.closure);
        let mut dump = String::new();
        vellum_core::disasm::disassemble_instruction(chunk, &self.heap, frame.ip, None, &mut dump);
        tracing::trace!("{}", dump.trim_end());
    }

    #[cfg(not(feature = "trace-execution"))]
    fn trace_instruction(&self) {}

    // ---------- garbage collection ----------

    fn maybe_collect(&mut self) {
        if self.heap.should_collect() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        let stack = &self.stack;
        let frames = &self.frames;
        let globals = &self.globals;
        let open_upvalues = &self.open_upvalues;
        let init_string = self.init_string;
        self.heap.collect(&mut |mark| {
            for v in stack {
                if let Value::Obj(r) = v {
                    mark(*r);
                }
            }
            for frame in frames {
                mark(frame.closure);
            }
            for (k, v) in globals.iter() {
                mark(k);
                if let Value::Obj(r) = v {
                    mark(r);
                }
            }
            for &u in open_upvalues {
                mark(u);
            }
            mark(init_string);
        });
    }

    // ---------- error construction ----------

    fn current_line(&self) -> u32 {
        let frame = self.frames.last().unwrap();
        Self::chunk_for(&self.heap, frame.closure).get_line(frame.ip.saturating_sub(1))
    }

    fn function_name(heap: &Heap, closure_ref: ObjRef) -> String {
        let function_ref = match heap.get(closure_ref) {
            Obj::Closure { function, .. } => *function,
            _ => unreachable!(),
        };
        match heap.get(function_ref) {
            Obj::Function { name: Some(n), .. } => {
                format!("{}()", String::from_utf8_lossy(heap.string_bytes(*n)))
            }
            Obj::Function { name: None, .. } => "script".to_string(),
            _ => unreachable!(),
        }
    }

    fn runtime_error(&mut self, message: String) -> VmError {
        let line = self.current_line();
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let frame_line = Self::chunk_for(&self.heap, frame.closure).get_line(frame.ip.saturating_sub(1));
                format!("[line {frame_line}] in {}", Self::function_name(&self.heap, frame.closure))
            })
            .collect();
        self.stack.clear();
        self.frames.clear();
        VmError { line, message, trace }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use vellum_compiler::compile;

    use super::*;

    fn run_source(src: &str) -> String {
        let mut vm = Vm::new(VmConfig::default());
        let script = compile(src, vm.heap_mut()).expect("should compile");
        let mut out = Vec::new();
        vm.run(script, &mut out).expect("should run without a runtime error");
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn prints_arithmetic_result() {
        assert_eq!(run_source("print 1 + 2 * 3;"), "7\n");
    }

    #[test]
    fn string_concatenation() {
        assert_eq!(run_source(r#"print "a" + "b";"#), "ab\n");
    }

    #[test]
    fn closures_capture_and_mutate_upvalues() {
        let src = r"
            fun counter() {
                var i = 0;
                fun inc() {
                    i = i + 1;
                    return i;
                }
                return inc;
            }
            var c = counter();
            print c();
            print c();
            print c();
        ";
        assert_eq!(run_source(src), "1\n2\n3\n");
    }

    #[test]
    fn classes_methods_and_this() {
        let src = r#"
            class Counter {
                init() {
                    this.count = 0;
                }
                increment() {
                    this.count = this.count + 1;
                    return this.count;
                }
            }
            var c = Counter();
            print c.increment();
            print c.increment();
        "#;
        assert_eq!(run_source(src), "1\n2\n");
    }

    #[test]
    fn inheritance_and_super_calls() {
        let src = r#"
            class Animal {
                speak() {
                    return "...";
                }
            }
            class Dog < Animal {
                speak() {
                    return "Woof, " + super.speak();
                }
            }
            print Dog().speak();
        "#;
        assert_eq!(run_source(src), "Woof, ...\n");
    }

    #[test]
    fn undefined_global_is_a_runtime_error() {
        let mut vm = Vm::new(VmConfig::default());
        let script = compile("print undefined_thing;", vm.heap_mut()).unwrap();
        let mut out = Vec::new();
        let err = vm.run(script, &mut out).unwrap_err();
        assert!(err.message.contains("Undefined variable"));
    }

    #[test]
    fn type_error_on_non_numeric_negate() {
        let mut vm = Vm::new(VmConfig::default());
        let script = compile(r#"-"nope";"#, vm.heap_mut()).unwrap();
        let mut out = Vec::new();
        let err = vm.run(script, &mut out).unwrap_err();
        assert!(err.message.contains("Operand must be a number"));
    }
}
