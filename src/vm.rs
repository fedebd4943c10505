use std::cell::RefCell;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;
use std::time::Instant;

use crate::chunk::Chunk;
use crate::compiler;
use crate::dis;
use crate::error::{InterpretError, Source};
use crate::object::{Heap, MapObj, NativeFn, NativeObj, Obj};
use crate::opcode::OpCode;
use crate::table::Table;
use crate::value::{ObjRef, Value};

pub const FRAMES_MAX: usize = 64;
pub const STACK_MAX: usize = FRAMES_MAX * 256;

struct Frame {
    fun: ObjRef,
    ip: usize,
    base: usize,
}

// Aborts the current dispatch: stores the ip so the trace can anchor the
// failing instruction, then unwinds with the formatted message.
macro_rules! fail {
    ($vm:ident, $ip:expr, $($fmt:tt)+) => {{
        $vm.store_ip($ip);
        return Err($vm.runtime_error(format!($($fmt)+)));
    }};
}

macro_rules! arith {
    ($vm:ident, $ip:ident, $op:tt) => {{
        let b = $vm.peek(0);
        let a = $vm.peek(1);
        let Some((x, y)) = coerce_pair(a, b) else {
            fail!($vm, $ip, "Operands must be two numbers/booleans.")
        };
        $vm.pop();
        $vm.pop();
        $vm.push(Value::Number(x $op y));
    }};
}

macro_rules! compare {
    ($vm:ident, $ip:ident, $op:tt) => {{
        let b = $vm.peek(0);
        let a = $vm.peek(1);
        let Some((x, y)) = coerce_pair(a, b) else {
            fail!($vm, $ip, "Operands must be two numbers/booleans.")
        };
        $vm.pop();
        $vm.pop();
        $vm.push(Value::Bool(x $op y));
    }};
}

// Booleans coerce to 0/1 under the numeric operators; anything else refuses.
fn coerce_pair(a: Value, b: Value) -> Option<(f64, f64)> {
    fn as_number(v: Value) -> Option<f64> {
        match v {
            Value::Number(n) => Some(n),
            Value::Bool(b) => Some(b as u8 as f64),
            _ => None,
        }
    }
    Some((as_number(a)?, as_number(b)?))
}

pub struct Vm {
    heap: Rc<RefCell<Heap>>,
    globals: Rc<RefCell<Table>>,
    stack: Vec<Value>,
    frames: Vec<Frame>,
    out: Rc<RefCell<dyn Write>>,
    started: Instant,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Rc::new(RefCell::new(io::stdout())))
    }

    /// Builds a VM whose `print` statements write into `out` instead of
    /// stdout. Embedders and tests capture program output this way.
    pub fn with_output(out: Rc<RefCell<dyn Write>>) -> Self {
        let mut vm = Self {
            heap: Rc::new(RefCell::new(Heap::new())),
            globals: Rc::new(RefCell::new(Table::new())),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            out,
            started: Instant::now(),
        };
        vm.define_native("clock", native_clock);
        vm
    }

    /// A child VM sharing this one's heap, interned strings and globals,
    /// with its own value and frame stacks. Useful for cooperative
    /// sub-invocations; sharing is not synchronized, so callers serialize.
    pub fn fork(&self) -> Self {
        Self {
            heap: Rc::clone(&self.heap),
            globals: Rc::clone(&self.globals),
            stack: Vec::with_capacity(STACK_MAX),
            frames: Vec::with_capacity(FRAMES_MAX),
            out: Rc::clone(&self.out),
            started: self.started,
        }
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> Value {
        match self.stack.pop() {
            Some(v) => v,
            None => unreachable!("value stack underflow"),
        }
    }

    fn peek(&self, dist: usize) -> Value {
        self.stack[self.stack.len() - 1 - dist]
    }

    pub fn set_global(&mut self, name: &str, value: Value) {
        let (r, hash) = {
            let mut heap = self.heap.borrow_mut();
            let r = heap.intern(name);
            (r, heap.str_of(r).hash)
        };
        self.globals.borrow_mut().set(r, hash, value);
    }

    fn define_native(&mut self, name: &str, fun: NativeFn) {
        let r = self
            .heap
            .borrow_mut()
            .alloc(Obj::Native(NativeObj { name: name.to_string(), fun }));
        self.set_global(name, Value::Obj(r));
    }

    /// Compiles `source` and runs it as a zero-argument script call.
    pub fn interpret(&mut self, source: &Rc<Source>) -> Result<(), InterpretError> {
        let script = {
            let mut heap = self.heap.borrow_mut();
            compiler::compile(source, &mut heap)?
        };

        if log::log_enabled!(log::Level::Debug) {
            let heap = self.heap.borrow();
            if let Obj::Fun(f) = &heap[script] {
                log::debug!("\n{}", dis::disassemble(&heap, &f.chunk, &source.fname));
            }
        }

        self.push(Value::Obj(script));
        if let Err(msg) = self.call_value(Value::Obj(script), 0) {
            return Err(self.runtime_error(msg));
        }
        self.execute()
    }

    /// Loads a file, compiles and runs it. An unreadable file is reported
    /// on stderr and counts as a compile failure.
    pub fn dofile(&mut self, path: impl AsRef<Path>) -> Result<(), InterpretError> {
        let path = path.as_ref();
        let source = match Source::from_path(path) {
            Ok(s) => Rc::new(s),
            Err(e) => {
                eprintln!("Could not read \"{}\": {}.", path.display(), e);
                return Err(InterpretError::Compile);
            }
        };
        self.interpret(&source)
    }

    pub fn repl(&mut self) {
        let mut line = String::new();
        loop {
            print!("> ");
            let _ = io::stdout().flush();
            line.clear();
            match io::stdin().read_line(&mut line) {
                Ok(0) => {
                    println!();
                    break;
                }
                Ok(_) => {}
                Err(_) => break,
            }
            if line.trim().is_empty() {
                continue;
            }
            let source = Rc::new(Source::new("<repl>", line.as_str()));
            if let Err(e @ InterpretError::Runtime { .. }) = self.interpret(&source) {
                eprintln!("{}", e);
            }
        }
    }

    fn store_ip(&mut self, ip: usize) {
        if let Some(frame) = self.frames.last_mut() {
            frame.ip = ip;
        }
    }

    fn load_frame(&self) -> (Rc<Chunk>, usize, usize) {
        let frame = self.frames.last().unwrap();
        let chunk = {
            let heap = self.heap.borrow();
            match &heap[frame.fun] {
                Obj::Fun(f) => Rc::clone(&f.chunk),
                _ => unreachable!("frame holds a non-function"),
            }
        };
        (chunk, frame.ip, frame.base)
    }

    fn name_constant(&self, chunk: &Chunk, idx: usize) -> (ObjRef, u32) {
        match chunk.constants[idx] {
            Value::Obj(r) => (r, self.heap.borrow().str_of(r).hash),
            _ => unreachable!("name constant is not a string"),
        }
    }

    /// Builds the trace, most recent frame first, and resets both stacks.
    #[cold]
    fn runtime_error(&mut self, msg: String) -> InterpretError {
        let mut trace = format!("Error: {}", msg);
        {
            let heap = self.heap.borrow();
            for frame in self.frames.iter().rev() {
                let Obj::Fun(f) = &heap[frame.fun] else { continue };
                // The ip sits just past the failing instruction.
                let offset = frame.ip.saturating_sub(1);
                let _ = write!(
                    trace,
                    "\n[{}:{}:{}] in ",
                    f.chunk.source.fname,
                    f.chunk.line_at(offset),
                    f.chunk.column_at(offset)
                );
                match f.name {
                    Some(n) => {
                        let _ = write!(trace, "{}()", heap.str_of(n).text);
                    }
                    None => trace.push_str("script"),
                }
            }
        }
        self.stack.clear();
        self.frames.clear();
        InterpretError::Runtime { trace }
    }

    fn call_value(&mut self, callee: Value, argc: usize) -> Result<(), String> {
        enum Callee {
            Fun(u8),
            Native(NativeFn),
            Bad,
        }

        let kind = match callee {
            Value::Obj(r) => {
                let heap = self.heap.borrow();
                match &heap[r] {
                    Obj::Fun(f) => Callee::Fun(f.arity),
                    Obj::Native(n) => Callee::Native(n.fun),
                    _ => Callee::Bad,
                }
            }
            _ => Callee::Bad,
        };

        match kind {
            Callee::Fun(arity) => {
                if argc != arity as usize {
                    return Err(format!("Expected {} arguments but got {}.", arity, argc));
                }
                if self.frames.len() == FRAMES_MAX {
                    return Err("Stack overflow.".to_string());
                }
                let Value::Obj(r) = callee else { unreachable!() };
                // Slot 0 is the callee itself; arguments follow it.
                let base = self.stack.len() - argc - 1;
                self.frames.push(Frame { fun: r, ip: 0, base });
                Ok(())
            }
            Callee::Native(fun) => {
                let args_start = self.stack.len() - argc;
                let args: Vec<Value> = self.stack[args_start..].to_vec();
                let result = fun(self, &args)?;
                self.stack.truncate(args_start - 1);
                self.push(result);
                Ok(())
            }
            Callee::Bad => Err("Can only call functions and classes.".to_string()),
        }
    }

    fn execute(&mut self) -> Result<(), InterpretError> {
        let (mut chunk, mut ip, mut base) = self.load_frame();

        loop {
            if log::log_enabled!(log::Level::Trace) {
                let heap = self.heap.borrow();
                let (text, _) = dis::instruction(&heap, &chunk, ip);
                log::trace!("{}", text);
            }

            let byte = chunk.code[ip];
            ip += 1;
            let Some(op) = OpCode::from_u8(byte) else {
                fail!(self, ip, "Bad opcode, got {}!", byte)
            };

            match op {
                OpCode::Nil => self.push(Value::Nil),
                OpCode::True => self.push(Value::Bool(true)),
                OpCode::False => self.push(Value::Bool(false)),

                OpCode::Constant => {
                    let idx = chunk.code[ip] as usize;
                    ip += 1;
                    self.push(chunk.constants[idx]);
                }
                OpCode::ConstantLong => {
                    let idx = chunk.read_u16(ip) as usize;
                    ip += 2;
                    self.push(chunk.constants[idx]);
                }

                OpCode::Pop => {
                    self.pop();
                }

                OpCode::Print => {
                    let count = chunk.code[ip] as usize;
                    ip += 1;
                    {
                        let heap = self.heap.borrow();
                        let mut out = self.out.borrow_mut();
                        for i in (0..count).rev() {
                            let _ = write!(out, "{}", heap.value_to_string(self.peek(i)));
                            if i > 0 {
                                let _ = write!(out, "\t");
                            }
                        }
                        let _ = writeln!(out);
                    }
                    let len = self.stack.len();
                    self.stack.truncate(len - count);
                }

                OpCode::DefineGlobal | OpCode::DefineGlobalLong => {
                    let idx = if op == OpCode::DefineGlobal {
                        let v = chunk.code[ip] as usize;
                        ip += 1;
                        v
                    } else {
                        let v = chunk.read_u16(ip) as usize;
                        ip += 2;
                        v
                    };
                    let (name, hash) = self.name_constant(&chunk, idx);
                    let value = self.peek(0);
                    self.globals.borrow_mut().set(name, hash, value);
                    self.pop();
                }

                OpCode::GetGlobal | OpCode::GetGlobalLong => {
                    let idx = if op == OpCode::GetGlobal {
                        let v = chunk.code[ip] as usize;
                        ip += 1;
                        v
                    } else {
                        let v = chunk.read_u16(ip) as usize;
                        ip += 2;
                        v
                    };
                    let (name, hash) = self.name_constant(&chunk, idx);
                    let value = self.globals.borrow().get(name, hash);
                    match value {
                        Some(v) => self.push(v),
                        None => {
                            let text = self.heap.borrow().str_of(name).text.clone();
                            fail!(self, ip, "Undefined variable '{}'.", text)
                        }
                    }
                }

                OpCode::SetGlobal | OpCode::SetGlobalLong => {
                    let idx = if op == OpCode::SetGlobal {
                        let v = chunk.code[ip] as usize;
                        ip += 1;
                        v
                    } else {
                        let v = chunk.read_u16(ip) as usize;
                        ip += 2;
                        v
                    };
                    let (name, hash) = self.name_constant(&chunk, idx);
                    // Assignment is an expression: the value stays on the stack.
                    if !self.globals.borrow().contains(name, hash) {
                        let text = self.heap.borrow().str_of(name).text.clone();
                        fail!(self, ip, "Undefined variable '{}'.", text)
                    }
                    let value = self.peek(0);
                    self.globals.borrow_mut().set(name, hash, value);
                }

                OpCode::GetLocal => {
                    let slot = chunk.code[ip] as usize;
                    ip += 1;
                    self.push(self.stack[base + slot]);
                }
                OpCode::SetLocal => {
                    let slot = chunk.code[ip] as usize;
                    ip += 1;
                    self.stack[base + slot] = self.peek(0);
                }

                OpCode::Jump => {
                    let offset = chunk.read_u16(ip) as usize;
                    ip += 2;
                    ip += offset;
                }
                OpCode::JumpIfFalse => {
                    let offset = chunk.read_u16(ip) as usize;
                    ip += 2;
                    if self.peek(0).is_falsey() {
                        ip += offset;
                    }
                }
                OpCode::Loop => {
                    let offset = chunk.read_u16(ip) as usize;
                    ip += 2;
                    ip -= offset;
                }

                OpCode::Call => {
                    let argc = chunk.code[ip] as usize;
                    ip += 1;
                    self.store_ip(ip);
                    if let Err(msg) = self.call_value(self.peek(argc), argc) {
                        return Err(self.runtime_error(msg));
                    }
                    (chunk, ip, base) = self.load_frame();
                }

                OpCode::Return => {
                    let result = self.pop();
                    let finished = self.frames.pop().unwrap();
                    if self.frames.is_empty() {
                        // Pop the script itself and halt.
                        self.pop();
                        return Ok(());
                    }
                    self.stack.truncate(finished.base);
                    self.push(result);
                    (chunk, ip, base) = self.load_frame();
                }

                OpCode::Not => {
                    let v = self.pop();
                    self.push(Value::Bool(v.is_falsey()));
                }

                OpCode::Negate => match self.peek(0) {
                    Value::Number(n) => {
                        self.pop();
                        self.push(Value::Number(-n));
                    }
                    // Integer negation first, so false lands on +0.0.
                    Value::Bool(b) => {
                        self.pop();
                        self.push(Value::Number(-(b as i32) as f64));
                    }
                    _ => fail!(self, ip, "Operands must be a number/boolean."),
                },

                OpCode::Equal => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }

                OpCode::Less => compare!(self, ip, <),
                OpCode::LessEqual => compare!(self, ip, <=),

                OpCode::Add => {
                    let b = self.peek(0);
                    let a = self.peek(1);
                    if let (Value::Obj(x), Value::Obj(y)) = (a, b) {
                        let joined: Option<String> = {
                            let heap = self.heap.borrow();
                            match (&heap[x], &heap[y]) {
                                (Obj::Str(s1), Obj::Str(s2)) => {
                                    Some(format!("{}{}", s1.text, s2.text))
                                }
                                _ => None,
                            }
                        };
                        let Some(joined) = joined else {
                            fail!(self, ip, "Operands must be two numbers/booleans/strings.")
                        };
                        let r = self.heap.borrow_mut().intern_owned(joined);
                        self.pop();
                        self.pop();
                        self.push(Value::Obj(r));
                    } else if let Some((x, y)) = coerce_pair(a, b) {
                        self.pop();
                        self.pop();
                        self.push(Value::Number(x + y));
                    } else {
                        fail!(self, ip, "Operands must be two numbers/booleans/strings.")
                    }
                }
                OpCode::Sub => arith!(self, ip, -),
                OpCode::Mul => arith!(self, ip, *),
                OpCode::Div => arith!(self, ip, /),

                OpCode::BuildMap => {
                    let count = chunk.code[ip] as usize;
                    ip += 1;
                    let mut map = MapObj::new();
                    let top = self.stack.len();
                    // Key i binds the element at stack depth i, so key 0
                    // names the top of the pushed run.
                    for i in 0..count {
                        map.hash.set((i as f64).to_bits(), self.stack[top - 1 - i]);
                    }
                    self.stack.truncate(top - count);
                    let r = self.heap.borrow_mut().alloc(Obj::Map(map));
                    self.push(Value::Obj(r));
                }

                OpCode::GetField => {
                    let idx = chunk.code[ip] as usize;
                    ip += 1;
                    let (name, hash) = self.name_constant(&chunk, idx);
                    let recv = self.peek(0);
                    let looked: Option<Value> = {
                        let heap = self.heap.borrow();
                        match recv {
                            Value::Obj(r) => match &heap[r] {
                                // Absent fields read as nil.
                                Obj::Map(m) => Some(m.table.get(name, hash).unwrap_or(Value::Nil)),
                                _ => None,
                            },
                            _ => None,
                        }
                    };
                    match looked {
                        Some(v) => {
                            self.pop();
                            self.push(v);
                        }
                        None => fail!(self, ip, "Operands must be a map."),
                    }
                }

                OpCode::SetField => {
                    let idx = chunk.code[ip] as usize;
                    ip += 1;
                    let (name, hash) = self.name_constant(&chunk, idx);
                    let value = self.peek(0);
                    let recv = self.peek(1);
                    let stored = {
                        let mut heap = self.heap.borrow_mut();
                        match recv {
                            Value::Obj(r) => match &mut heap[r] {
                                Obj::Map(m) => {
                                    m.table.set(name, hash, value);
                                    true
                                }
                                _ => false,
                            },
                            _ => false,
                        }
                    };
                    if !stored {
                        fail!(self, ip, "Operands must be a map.")
                    }
                    self.pop();
                    self.pop();
                    self.push(value);
                }

                OpCode::GetIndex => {
                    let key = self.peek(0);
                    let recv = self.peek(1);
                    let looked: Result<Value, &'static str> = {
                        let heap = self.heap.borrow();
                        let map = match recv {
                            Value::Obj(r) => match &heap[r] {
                                Obj::Map(m) => Some(m),
                                _ => None,
                            },
                            _ => None,
                        };
                        match map {
                            None => Err("Operands must be a map."),
                            Some(m) => match key {
                                Value::Number(n) => {
                                    Ok(m.hash.get(n.to_bits()).unwrap_or(Value::Nil))
                                }
                                Value::Obj(k) => match &heap[k] {
                                    Obj::Str(s) => {
                                        Ok(m.table.get(k, s.hash).unwrap_or(Value::Nil))
                                    }
                                    _ => Err("Operands must be a number or string."),
                                },
                                _ => Err("Operands must be a number or string."),
                            },
                        }
                    };
                    match looked {
                        Ok(v) => {
                            self.pop();
                            self.pop();
                            self.push(v);
                        }
                        Err(msg) => fail!(self, ip, "{}", msg),
                    }
                }

                OpCode::SetIndex => {
                    let value = self.peek(0);
                    let key = self.peek(1);
                    let recv = self.peek(2);
                    let stored: Result<(), &'static str> = {
                        let mut heap = self.heap.borrow_mut();
                        let is_map = matches!(
                            recv,
                            Value::Obj(r) if matches!(&heap[r], Obj::Map(_))
                        );
                        if !is_map {
                            Err("Operands must be a map.")
                        } else {
                            let Value::Obj(r) = recv else { unreachable!() };
                            match key {
                                Value::Number(n) => {
                                    if let Obj::Map(m) = &mut heap[r] {
                                        m.hash.set(n.to_bits(), value);
                                    }
                                    Ok(())
                                }
                                Value::Obj(k) => {
                                    let hash = match &heap[k] {
                                        Obj::Str(s) => Some(s.hash),
                                        _ => None,
                                    };
                                    match hash {
                                        Some(h) => {
                                            if let Obj::Map(m) = &mut heap[r] {
                                                m.table.set(k, h, value);
                                            }
                                            Ok(())
                                        }
                                        None => Err("Operands must be a number or string."),
                                    }
                                }
                                _ => Err("Operands must be a number or string."),
                            }
                        }
                    };
                    match stored {
                        Ok(()) => {
                            self.pop();
                            self.pop();
                            self.pop();
                            self.push(value);
                        }
                        Err(msg) => fail!(self, ip, "{}", msg),
                    }
                }
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

fn native_clock(vm: &mut Vm, _args: &[Value]) -> Result<Value, String> {
    Ok(Value::Number(vm.started.elapsed().as_secs_f64()))
}
