//! Compiler that converts expression trees to generator bytecode
//!
//! Emits the instruction shapes CPython 2.6 produces for generator
//! expressions and lambda bodies, so that decompiler inputs can be built
//! from source text. Names bound by loop targets or lambda parameters are
//! fast locals; a local read by nested code becomes a cell, and the nested
//! code reads it through its free variables.

use super::error::{ErrorKind, ParseError, ParseResult};
use super::lexer::{Position, Span};
use super::peephole;
use crate::artifact::{CodeArtifact, OUTER_ITERABLE_SLOT};
use crate::ast::{
    AssignTarget, BinaryKind, BoolKind, CompareOp, GenExprInner, Keyword, Lambda, Literal, Node,
    UnaryKind,
};
use crate::constant_pool::{Constant, ConstantPool};
use crate::opcodes::{Opcode, OperandKind};
use log::debug;
use std::collections::BTreeSet;

const GENEXPR_NAME: &str = "<genexpr>";
const LAMBDA_NAME: &str = "<lambda>";

/// Per-kind limit of the packed CALL_FUNCTION argument
const MAX_CALL_ARGUMENTS: usize = 255;

/// Compiler configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Apply the post-assembly rewrites of the target compiler: jump
    /// threading, `not` folding, `None` loading and constant tuples
    pub peephole: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions { peephole: true }
    }
}

impl CompileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_peephole(mut self, peephole: bool) -> Self {
        self.peephole = peephole;
        self
    }
}

/// Compiler that translates expression trees to code artifacts
#[derive(Debug, Clone, Default)]
pub struct Compiler {
    options: CompileOptions,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: CompileOptions) -> Self {
        Compiler { options }
    }

    /// Compile an expression tree
    ///
    /// A generator expression becomes its `<genexpr>` code object, whose
    /// first loop iterates the `.0` argument; the first clause's iterable
    /// belongs to the caller and is not compiled. Any other expression
    /// becomes the body of an argument-less `<lambda>`.
    pub fn compile(&self, node: &Node) -> ParseResult<CodeArtifact> {
        let artifact = match node {
            Node::GenExprInner(inner) => {
                CodeUnit::compile_generator(inner, &BTreeSet::new(), &self.options)?
            }
            body => CodeUnit::compile_lambda(body, &self.options)?,
        };
        debug!(
            "compiled {}: {} bytes, {} constants, {} names",
            artifact.name,
            artifact.code.len(),
            artifact.constants.len(),
            artifact.names.len()
        );
        Ok(artifact)
    }
}

fn compile_error(kind: ErrorKind, message: impl Into<String>) -> Box<ParseError> {
    ParseError::with_kind(kind, message, Span::single(Position::start())).boxed()
}

// ===== Scope Analysis =====

/// How a name is loaded and stored in one code object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    Fast(u32),
    /// Index into cells followed by frees
    Deref(u32),
    Global,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum ScopeKind {
    /// Argument-less top-level body; every free name is global
    #[default]
    Body,
    /// Slot 0 holds the outer iterable
    Generator,
    Lambda,
}

/// Name resolution for one code object
#[derive(Debug, Default)]
struct Scope {
    /// Fast locals in slot order
    varnames: Vec<String>,
    /// Sorted
    cells: Vec<String>,
    /// Sorted
    frees: Vec<String>,
    /// Bound here or in an enclosing generator expression or lambda
    visible: BTreeSet<String>,
    kind: ScopeKind,
    arg_count: u32,
    flags: u32,
}

impl Scope {
    fn generator(inner: &GenExprInner, enclosing: &BTreeSet<String>) -> Self {
        let bound = bound_names(inner);
        let uses = NameUse::of_generator(inner);

        let cells: Vec<String> = uses
            .captures
            .iter()
            .filter(|name| bound.contains(*name))
            .cloned()
            .collect();
        let frees: Vec<String> = uses
            .reads
            .iter()
            .filter(|name| !bound.contains(*name) && enclosing.contains(*name))
            .cloned()
            .collect();

        let mut varnames = vec![OUTER_ITERABLE_SLOT.to_string()];
        varnames.extend(bound.into_iter().filter(|name| !cells.contains(name)));

        let mut visible = enclosing.clone();
        visible.extend(varnames.iter().skip(1).cloned());
        visible.extend(cells.iter().cloned());

        Scope {
            varnames,
            cells,
            frees,
            visible,
            kind: ScopeKind::Generator,
            arg_count: 1,
            flags: 0,
        }
    }

    /// Parameters stay in `varnames` even when captured; their loads then
    /// go through the cell
    fn lambda(lambda: &Lambda, enclosing: &BTreeSet<String>) -> Self {
        let params: Vec<String> = lambda.params().cloned().collect();
        let uses = NameUse::of_lambda(lambda);

        let cells: Vec<String> = uses
            .captures
            .iter()
            .filter(|name| params.contains(*name))
            .cloned()
            .collect();
        let frees: Vec<String> = uses
            .reads
            .iter()
            .filter(|name| !params.contains(*name) && enclosing.contains(*name))
            .cloned()
            .collect();

        let mut visible = enclosing.clone();
        visible.extend(params.iter().cloned());

        Scope {
            arg_count: lambda.args.len() as u32,
            flags: lambda.flags(),
            varnames: params,
            cells,
            frees,
            visible,
            kind: ScopeKind::Lambda,
        }
    }

    fn resolve(&self, name: &str) -> Binding {
        if let Some(index) = self.cells.iter().position(|cell| cell == name) {
            return Binding::Deref(index as u32);
        }
        if let Some(index) = self.frees.iter().position(|free| free == name) {
            return Binding::Deref((self.cells.len() + index) as u32);
        }
        let slot = match self.kind {
            ScopeKind::Body => None,
            // Slot 0 is the argument, never a user name
            ScopeKind::Generator => self
                .varnames
                .iter()
                .skip(1)
                .position(|local| local == name)
                .map(|index| index + 1),
            ScopeKind::Lambda => self.varnames.iter().position(|local| local == name),
        };
        match slot {
            Some(index) => Binding::Fast(index as u32),
            None => Binding::Global,
        }
    }
}

/// Names bound by a generator's loop targets, in binding order
fn bound_names(inner: &GenExprInner) -> Vec<String> {
    fn collect(target: &AssignTarget, out: &mut Vec<String>) {
        match target {
            AssignTarget::Name(name) => {
                if !out.contains(name) {
                    out.push(name.clone());
                }
            }
            AssignTarget::Tuple(items) => {
                for item in items {
                    collect(item, out);
                }
            }
            AssignTarget::Attribute { .. } | AssignTarget::Subscript { .. } => {}
        }
    }

    let mut out = Vec::new();
    for clause in &inner.clauses {
        collect(&clause.target, &mut out);
    }
    out
}

/// Names read within one scope
#[derive(Debug, Default)]
struct NameUse {
    /// Everything read here, including what nested generators need from
    /// outside themselves
    reads: BTreeSet<String>,
    /// What nested generators need from outside themselves
    captures: BTreeSet<String>,
}

impl NameUse {
    /// Reads of a generator's own scope; its first iterable belongs to the
    /// caller
    fn of_generator(inner: &GenExprInner) -> Self {
        let mut uses = NameUse::default();
        uses.visit(&inner.expr);
        for (index, clause) in inner.clauses.iter().enumerate() {
            uses.visit_target(&clause.target);
            if index > 0 {
                uses.visit(&clause.iter);
            }
            for cond in &clause.ifs {
                uses.visit(cond);
            }
        }
        uses
    }

    /// Names a generator reads without binding them
    fn unresolved(inner: &GenExprInner) -> BTreeSet<String> {
        let bound = bound_names(inner);
        let mut reads = Self::of_generator(inner).reads;
        reads.retain(|name| !bound.contains(name));
        reads
    }

    fn of_lambda(lambda: &Lambda) -> Self {
        let mut uses = NameUse::default();
        uses.visit(&lambda.body);
        uses
    }

    /// Names a lambda body reads besides its parameters
    fn unresolved_lambda(lambda: &Lambda) -> BTreeSet<String> {
        let mut reads = Self::of_lambda(lambda).reads;
        reads.retain(|name| !lambda.params().any(|param| param == name));
        reads
    }

    fn visit_target(&mut self, target: &AssignTarget) {
        match target {
            AssignTarget::Name(_) => {}
            AssignTarget::Tuple(items) => {
                for item in items {
                    self.visit_target(item);
                }
            }
            AssignTarget::Attribute { target, .. } => self.visit(target),
            AssignTarget::Subscript { target, index } => {
                self.visit(target);
                self.visit(index);
            }
        }
    }

    fn visit(&mut self, node: &Node) {
        match node {
            Node::OuterIterable | Node::Const(_) => {}
            Node::Name(name) => {
                self.reads.insert(name.clone());
            }
            Node::UnaryOp { operand, .. } => self.visit(operand),
            Node::BinOp { left, right, .. } => {
                self.visit(left);
                self.visit(right);
            }
            Node::BoolOp { operands, .. }
            | Node::CompareChain { operands, .. }
            | Node::Tuple(operands)
            | Node::List(operands) => {
                for operand in operands {
                    self.visit(operand);
                }
            }
            Node::Call {
                func,
                args,
                keywords,
                star_args,
                kwargs,
            } => {
                self.visit(func);
                for arg in args {
                    self.visit(arg);
                }
                for keyword in keywords {
                    self.visit(&keyword.value);
                }
                for extra in [star_args, kwargs].into_iter().flatten() {
                    self.visit(extra);
                }
            }
            Node::Attribute { target, .. } => self.visit(target),
            Node::Subscript { target, index } => {
                self.visit(target);
                self.visit(index);
            }
            Node::Slice { lower, upper, step } => {
                for bound in [lower, upper, step].into_iter().flatten() {
                    self.visit(bound);
                }
            }
            Node::Dict(pairs) => {
                for (key, value) in pairs {
                    self.visit(key);
                    self.visit(value);
                }
            }
            Node::IfExp { test, body, orelse } => {
                self.visit(test);
                self.visit(body);
                self.visit(orelse);
            }
            Node::Lambda(child) => {
                let needed = Self::unresolved_lambda(child);
                self.captures.extend(needed.iter().cloned());
                self.reads.extend(needed);
            }
            Node::GenExprInner(child) => {
                let needed = Self::unresolved(child);
                self.captures.extend(needed.iter().cloned());
                self.reads.extend(needed);
                if let Some(first) = child.clauses.first() {
                    self.visit(&first.iter);
                }
            }
        }
    }
}

// ===== Code Units =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Label(usize);

#[derive(Debug, Clone, Copy)]
enum Arg {
    None,
    Value(u32),
    Jump(Label),
}

/// Instruction awaiting assembly
#[derive(Debug, Clone, Copy)]
struct Pending {
    opcode: Opcode,
    arg: Arg,
}

impl Pending {
    fn size(&self) -> usize {
        match self.arg {
            Arg::None => 1,
            Arg::Value(value) if value > 0xFFFF => 6,
            Arg::Value(_) | Arg::Jump(_) => 3,
        }
    }
}

/// One code object under construction
struct CodeUnit<'c> {
    name: &'static str,
    scope: Scope,
    options: &'c CompileOptions,
    instructions: Vec<Pending>,
    /// Label to the index of the instruction it precedes
    labels: Vec<Option<usize>>,
    constants: ConstantPool,
    names: Vec<String>,
}

impl<'c> CodeUnit<'c> {
    fn new(name: &'static str, scope: Scope, options: &'c CompileOptions) -> Self {
        CodeUnit {
            name,
            scope,
            options,
            instructions: Vec::new(),
            labels: Vec::new(),
            constants: ConstantPool::new(),
            names: Vec::new(),
        }
    }

    fn compile_generator(
        inner: &GenExprInner,
        enclosing: &BTreeSet<String>,
        options: &'c CompileOptions,
    ) -> ParseResult<CodeArtifact> {
        if inner.clauses.is_empty() {
            return Err(compile_error(
                ErrorKind::InvalidExpression,
                "generator expression without a 'for' clause",
            ));
        }
        let mut unit = CodeUnit::new(GENEXPR_NAME, Scope::generator(inner, enclosing), options);
        unit.compile_loop(inner, 0)?;
        unit.emit_const(Constant::None);
        unit.emit(Opcode::ReturnValue);
        unit.finish()
    }

    fn compile_lambda(body: &Node, options: &'c CompileOptions) -> ParseResult<CodeArtifact> {
        Self::compile_body(body, Scope::default(), options)
    }

    fn compile_function(
        lambda: &Lambda,
        enclosing: &BTreeSet<String>,
        options: &'c CompileOptions,
    ) -> ParseResult<CodeArtifact> {
        Self::compile_body(&lambda.body, Scope::lambda(lambda, enclosing), options)
    }

    fn compile_body(
        body: &Node,
        scope: Scope,
        options: &'c CompileOptions,
    ) -> ParseResult<CodeArtifact> {
        let mut unit = CodeUnit::new(LAMBDA_NAME, scope, options);
        // None first, so the body can never be taken for a docstring
        unit.constants.add(Constant::None);
        unit.compile_expr(body)?;
        unit.emit(Opcode::ReturnValue);
        unit.finish()
    }

    fn finish(self) -> ParseResult<CodeArtifact> {
        let code = self.assemble()?;
        let mut artifact = CodeArtifact {
            name: self.name.to_string(),
            code,
            constants: self.constants,
            names: self.names,
            varnames: match self.scope.kind {
                ScopeKind::Body => Vec::new(),
                ScopeKind::Generator | ScopeKind::Lambda => self.scope.varnames,
            },
            cell_vars: self.scope.cells,
            free_vars: self.scope.frees,
            arg_count: self.scope.arg_count,
            flags: self.scope.flags,
        };
        if self.options.peephole {
            peephole::optimize(&mut artifact);
        }
        Ok(artifact)
    }

    // ===== Constant Pool Management =====

    /// Add a constant to the pool (or return its index if already present)
    fn add_or_get_constant(&mut self, constant: Constant) -> u32 {
        match self.constants.position(&constant) {
            Some(index) => index,
            None => self.constants.add(constant),
        }
    }

    fn name_index(&mut self, name: &str) -> u32 {
        match self.names.iter().position(|existing| existing == name) {
            Some(index) => index as u32,
            None => {
                self.names.push(name.to_string());
                (self.names.len() - 1) as u32
            }
        }
    }

    // ===== Bytecode Emission =====

    fn emit(&mut self, opcode: Opcode) {
        self.instructions.push(Pending {
            opcode,
            arg: Arg::None,
        });
    }

    fn emit_arg(&mut self, opcode: Opcode, arg: u32) {
        self.instructions.push(Pending {
            opcode,
            arg: Arg::Value(arg),
        });
    }

    fn emit_jump(&mut self, opcode: Opcode, label: Label) {
        self.instructions.push(Pending {
            opcode,
            arg: Arg::Jump(label),
        });
    }

    fn emit_count(&mut self, opcode: Opcode, count: usize) -> ParseResult<()> {
        let count = u32::try_from(count).map_err(|_| {
            compile_error(ErrorKind::Other, format!("too many operands for {}", opcode))
        })?;
        self.emit_arg(opcode, count);
        Ok(())
    }

    fn emit_const(&mut self, constant: Constant) {
        let index = self.add_or_get_constant(constant);
        self.emit_arg(Opcode::LoadConst, index);
    }

    fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the next emitted instruction
    fn place(&mut self, label: Label) {
        if let Some(slot) = self.labels.get_mut(label.0) {
            *slot = Some(self.instructions.len());
        }
    }

    fn assemble(&self) -> ParseResult<Vec<u8>> {
        let mut offsets = Vec::with_capacity(self.instructions.len() + 1);
        let mut offset = 0;
        for instr in &self.instructions {
            offsets.push(offset);
            offset += instr.size();
        }
        offsets.push(offset);

        let mut code = Vec::with_capacity(offset);
        for (index, instr) in self.instructions.iter().enumerate() {
            let arg = match instr.arg {
                Arg::None => {
                    code.push(instr.opcode as u8);
                    continue;
                }
                Arg::Value(value) => value,
                Arg::Jump(label) => self.jump_arg(instr.opcode, label, &offsets, index)?,
            };

            if arg > 0xFFFF {
                code.push(Opcode::ExtendedArg as u8);
                code.extend_from_slice(&((arg >> 16) as u16).to_le_bytes());
            }
            code.push(instr.opcode as u8);
            code.extend_from_slice(&(arg as u16).to_le_bytes());
        }
        Ok(code)
    }

    fn jump_arg(
        &self,
        opcode: Opcode,
        label: Label,
        offsets: &[usize],
        index: usize,
    ) -> ParseResult<u32> {
        let target = self
            .labels
            .get(label.0)
            .copied()
            .flatten()
            .and_then(|at| offsets.get(at).copied())
            .ok_or_else(|| {
                compile_error(ErrorKind::Other, format!("unplaced jump label for {}", opcode))
            })?;
        let arg = match opcode.operand_kind() {
            OperandKind::JumpAbsolute => target,
            _ => {
                let next = offsets[index] + 3;
                target.checked_sub(next).ok_or_else(|| {
                    compile_error(
                        ErrorKind::Other,
                        format!("backward relative jump from {} at {}", opcode, offsets[index]),
                    )
                })?
            }
        };
        if arg > 0xFFFF {
            return Err(compile_error(
                ErrorKind::Other,
                "expression too large: jump distance exceeds 16 bits",
            ));
        }
        Ok(arg as u32)
    }

    // ===== Generator Loops =====

    /// One `for` clause and everything nested inside it
    fn compile_loop(&mut self, inner: &GenExprInner, index: usize) -> ParseResult<()> {
        let Some(clause) = inner.clauses.get(index) else {
            return Ok(());
        };
        let start = self.new_label();
        let anchor = self.new_label();
        let end = self.new_label();
        let if_cleanup = self.new_label();

        self.emit_jump(Opcode::SetupLoop, end);
        if index == 0 {
            self.emit_arg(Opcode::LoadFast, 0);
        } else {
            self.compile_expr(&clause.iter)?;
            self.emit(Opcode::GetIter);
        }

        self.place(start);
        self.emit_jump(Opcode::ForIter, anchor);
        self.store_target(&clause.target)?;

        for cond in &clause.ifs {
            self.compile_expr(cond)?;
            self.emit_jump(Opcode::JumpIfFalse, if_cleanup);
            self.emit(Opcode::PopTop);
        }

        if index + 1 < inner.clauses.len() {
            self.compile_loop(inner, index + 1)?;
        } else {
            self.compile_expr(&inner.expr)?;
            self.emit(Opcode::YieldValue);
            self.emit(Opcode::PopTop);
        }

        // Each filter leaves its failed condition to pop at the cleanup
        for i in 0..clause.ifs.len() {
            let skip = self.new_label();
            self.emit_jump(Opcode::JumpForward, skip);
            if i == 0 {
                self.place(if_cleanup);
            }
            self.emit(Opcode::PopTop);
            self.place(skip);
        }

        self.emit_jump(Opcode::JumpAbsolute, start);
        self.place(anchor);
        self.emit(Opcode::PopBlock);
        self.place(end);
        Ok(())
    }

    fn store_target(&mut self, target: &AssignTarget) -> ParseResult<()> {
        match target {
            AssignTarget::Name(name) => match self.scope.resolve(name) {
                Binding::Fast(slot) => self.emit_arg(Opcode::StoreFast, slot),
                Binding::Deref(slot) => self.emit_arg(Opcode::StoreDeref, slot),
                Binding::Global => {
                    return Err(compile_error(
                        ErrorKind::InvalidTarget,
                        format!("loop variable '{}' is not bound in this scope", name),
                    ));
                }
            },
            AssignTarget::Tuple(items) => {
                self.emit_count(Opcode::UnpackSequence, items.len())?;
                for item in items {
                    self.store_target(item)?;
                }
            }
            AssignTarget::Attribute { target, name } => {
                self.compile_expr(target)?;
                let index = self.name_index(name);
                self.emit_arg(Opcode::StoreAttr, index);
            }
            AssignTarget::Subscript { target, index } => {
                self.compile_expr(target)?;
                match index {
                    Node::Slice {
                        lower,
                        upper,
                        step: None,
                    } => {
                        let form = self.compile_simple_slice(lower, upper)?;
                        self.emit(match form {
                            0 => Opcode::StoreSlice0,
                            1 => Opcode::StoreSlice1,
                            2 => Opcode::StoreSlice2,
                            _ => Opcode::StoreSlice3,
                        });
                    }
                    index => {
                        self.compile_expr(index)?;
                        self.emit(Opcode::StoreSubscr);
                    }
                }
            }
        }
        Ok(())
    }

    // ===== Expression Compilation =====

    fn compile_expr(&mut self, node: &Node) -> ParseResult<()> {
        match node {
            Node::OuterIterable => {
                if self.scope.kind != ScopeKind::Generator {
                    return Err(compile_error(
                        ErrorKind::InvalidExpression,
                        "outer iterable outside a generator expression",
                    ));
                }
                self.emit_arg(Opcode::LoadFast, 0);
            }

            Node::Name(name) => self.load_name(name),

            Node::Const(literal) => self.emit_const(literal_constant(literal)),

            Node::UnaryOp { op, operand } => {
                self.compile_expr(operand)?;
                self.emit(match op {
                    UnaryKind::Not => Opcode::UnaryNot,
                    UnaryKind::Invert => Opcode::UnaryInvert,
                    UnaryKind::Plus => Opcode::UnaryPositive,
                    UnaryKind::Minus => Opcode::UnaryNegative,
                    UnaryKind::Backquote => Opcode::UnaryConvert,
                });
            }

            Node::BinOp { op, left, right } => {
                self.compile_expr(left)?;
                self.compile_expr(right)?;
                self.emit(binary_opcode(*op));
            }

            Node::BoolOp { op, operands } => {
                let end = self.new_label();
                let jump = match op {
                    BoolKind::And => Opcode::JumpIfFalse,
                    BoolKind::Or => Opcode::JumpIfTrue,
                };
                if let Some((last, init)) = operands.split_last() {
                    for operand in init {
                        self.compile_expr(operand)?;
                        self.emit_jump(jump, end);
                        self.emit(Opcode::PopTop);
                    }
                    self.compile_expr(last)?;
                }
                self.place(end);
            }

            Node::CompareChain { operands, ops } => self.compile_compare(operands, ops)?,

            Node::Call {
                func,
                args,
                keywords,
                star_args,
                kwargs,
            } => self.compile_call(func, args, keywords, star_args, kwargs)?,

            Node::Attribute { target, name } => {
                self.compile_expr(target)?;
                let index = self.name_index(name);
                self.emit_arg(Opcode::LoadAttr, index);
            }

            Node::Subscript { target, index } => {
                self.compile_expr(target)?;
                match index.as_ref() {
                    Node::Slice {
                        lower,
                        upper,
                        step: None,
                    } => {
                        let form = self.compile_simple_slice(lower, upper)?;
                        self.emit(match form {
                            0 => Opcode::Slice0,
                            1 => Opcode::Slice1,
                            2 => Opcode::Slice2,
                            _ => Opcode::Slice3,
                        });
                    }
                    index => {
                        self.compile_expr(index)?;
                        self.emit(Opcode::BinarySubscr);
                    }
                }
            }

            // Extended slice object; simple slices are handled by Subscript
            Node::Slice { lower, upper, step } => {
                for bound in [lower, upper] {
                    match bound {
                        Some(bound) => self.compile_expr(bound)?,
                        None => self.emit_const(Constant::None),
                    }
                }
                let count = match step {
                    Some(step) => {
                        self.compile_expr(step)?;
                        3
                    }
                    None => 2,
                };
                self.emit_arg(Opcode::BuildSlice, count);
            }

            Node::Tuple(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit_count(Opcode::BuildTuple, items.len())?;
            }

            Node::List(items) => {
                for item in items {
                    self.compile_expr(item)?;
                }
                self.emit_count(Opcode::BuildList, items.len())?;
            }

            Node::Dict(pairs) => {
                self.emit_count(Opcode::BuildMap, pairs.len().min(0xFFFF))?;
                for (key, value) in pairs {
                    self.compile_expr(value)?;
                    self.compile_expr(key)?;
                    self.emit(Opcode::StoreMap);
                }
            }

            Node::IfExp { test, body, orelse } => {
                let orelse_label = self.new_label();
                let end = self.new_label();
                self.compile_expr(test)?;
                self.emit_jump(Opcode::JumpIfFalse, orelse_label);
                self.emit(Opcode::PopTop);
                self.compile_expr(body)?;
                self.emit_jump(Opcode::JumpForward, end);
                self.place(orelse_label);
                self.emit(Opcode::PopTop);
                self.compile_expr(orelse)?;
                self.place(end);
            }

            Node::Lambda(lambda) => {
                let code = Self::compile_function(lambda, &self.scope.visible, self.options)?;
                self.emit_function(code)?;
            }

            Node::GenExprInner(child) => self.compile_nested_generator(child)?,
        }
        Ok(())
    }

    fn load_name(&mut self, name: &str) {
        match self.scope.resolve(name) {
            Binding::Fast(slot) => self.emit_arg(Opcode::LoadFast, slot),
            Binding::Deref(slot) => self.emit_arg(Opcode::LoadDeref, slot),
            Binding::Global => {
                let index = self.name_index(name);
                self.emit_arg(Opcode::LoadGlobal, index);
            }
        }
    }

    /// Push the present bounds of `x[lower:upper]`; returns the SLICE form
    fn compile_simple_slice(
        &mut self,
        lower: &Option<Box<Node>>,
        upper: &Option<Box<Node>>,
    ) -> ParseResult<u8> {
        let mut form = 0;
        if let Some(lower) = lower {
            self.compile_expr(lower)?;
            form += 1;
        }
        if let Some(upper) = upper {
            self.compile_expr(upper)?;
            form += 2;
        }
        Ok(form)
    }

    /// `a < b < c` duplicates each middle operand and bails out to a
    /// cleanup that drops it once a link fails
    fn compile_compare(&mut self, operands: &[Node], ops: &[CompareOp]) -> ParseResult<()> {
        if operands.len() != ops.len() + 1 || ops.is_empty() {
            return Err(compile_error(
                ErrorKind::InvalidExpression,
                format!(
                    "comparison with {} operands and {} operators",
                    operands.len(),
                    ops.len()
                ),
            ));
        }

        self.compile_expr(&operands[0])?;
        if ops.len() == 1 {
            self.compile_expr(&operands[1])?;
            self.emit_arg(Opcode::CompareOp, u32::from(ops[0].index()));
            return Ok(());
        }

        let cleanup = self.new_label();
        let end = self.new_label();
        let last = ops.len() - 1;
        for (i, op) in ops[..last].iter().enumerate() {
            self.compile_expr(&operands[i + 1])?;
            self.emit(Opcode::DupTop);
            self.emit(Opcode::RotThree);
            self.emit_arg(Opcode::CompareOp, u32::from(op.index()));
            self.emit_jump(Opcode::JumpIfFalse, cleanup);
            self.emit(Opcode::PopTop);
        }
        self.compile_expr(&operands[last + 1])?;
        self.emit_arg(Opcode::CompareOp, u32::from(ops[last].index()));
        self.emit_jump(Opcode::JumpForward, end);
        self.place(cleanup);
        self.emit(Opcode::RotTwo);
        self.emit(Opcode::PopTop);
        self.place(end);
        Ok(())
    }

    fn compile_call(
        &mut self,
        func: &Node,
        args: &[Node],
        keywords: &[Keyword],
        star_args: &Option<Box<Node>>,
        kwargs: &Option<Box<Node>>,
    ) -> ParseResult<()> {
        if args.len() > MAX_CALL_ARGUMENTS || keywords.len() > MAX_CALL_ARGUMENTS {
            return Err(compile_error(
                ErrorKind::Other,
                format!("more than {} arguments", MAX_CALL_ARGUMENTS),
            ));
        }

        self.compile_expr(func)?;
        for arg in args {
            self.compile_expr(arg)?;
        }
        for keyword in keywords {
            self.emit_const(Constant::Str(keyword.name.clone()));
            self.compile_expr(&keyword.value)?;
        }
        if let Some(star_args) = star_args {
            self.compile_expr(star_args)?;
        }
        if let Some(kwargs) = kwargs {
            self.compile_expr(kwargs)?;
        }

        let opcode = match (star_args.is_some(), kwargs.is_some()) {
            (false, false) => Opcode::CallFunction,
            (true, false) => Opcode::CallFunctionVar,
            (false, true) => Opcode::CallFunctionKw,
            (true, true) => Opcode::CallFunctionVarKw,
        };
        self.emit_arg(opcode, ((keywords.len() as u32) << 8) | args.len() as u32);
        Ok(())
    }

    /// Build the nested code object, call it with its first iterable
    fn compile_nested_generator(&mut self, child: &GenExprInner) -> ParseResult<()> {
        let Some(first) = child.clauses.first() else {
            return Err(compile_error(
                ErrorKind::InvalidExpression,
                "generator expression without a 'for' clause",
            ));
        };
        let code = Self::compile_generator(child, &self.scope.visible, self.options)?;
        self.emit_function(code)?;

        self.compile_expr(&first.iter)?;
        self.emit(Opcode::GetIter);
        self.emit_arg(Opcode::CallFunction, 1);
        Ok(())
    }

    /// Push a function built from `code`, closing over its free variables
    fn emit_function(&mut self, code: CodeArtifact) -> ParseResult<()> {
        if code.free_vars.is_empty() {
            let index = self.constants.add(Constant::Code(Box::new(code)));
            self.emit_arg(Opcode::LoadConst, index);
            self.emit_arg(Opcode::MakeFunction, 0);
            return Ok(());
        }

        for name in &code.free_vars {
            match self.scope.resolve(name) {
                Binding::Deref(slot) => self.emit_arg(Opcode::LoadClosure, slot),
                _ => {
                    return Err(compile_error(
                        ErrorKind::Other,
                        format!("captured variable '{}' has no cell", name),
                    ));
                }
            }
        }
        self.emit_count(Opcode::BuildTuple, code.free_vars.len())?;
        let index = self.constants.add(Constant::Code(Box::new(code)));
        self.emit_arg(Opcode::LoadConst, index);
        self.emit_arg(Opcode::MakeClosure, 0);
        Ok(())
    }
}

fn literal_constant(literal: &Literal) -> Constant {
    match literal {
        Literal::None => Constant::None,
        Literal::Bool(value) => Constant::Bool(*value),
        Literal::Int(value) => Constant::Int(*value),
        Literal::Float(value) => Constant::Float(*value),
        Literal::Str(value) => Constant::Str(value.clone()),
    }
}

fn binary_opcode(op: BinaryKind) -> Opcode {
    match op {
        BinaryKind::Add => Opcode::BinaryAdd,
        BinaryKind::Sub => Opcode::BinarySubtract,
        BinaryKind::Mul => Opcode::BinaryMultiply,
        BinaryKind::Div => Opcode::BinaryDivide,
        BinaryKind::FloorDiv => Opcode::BinaryFloorDivide,
        BinaryKind::Mod => Opcode::BinaryModulo,
        BinaryKind::Power => Opcode::BinaryPower,
        BinaryKind::LShift => Opcode::BinaryLshift,
        BinaryKind::RShift => Opcode::BinaryRshift,
        BinaryKind::BitAnd => Opcode::BinaryAnd,
        BinaryKind::BitOr => Opcode::BinaryOr,
        BinaryKind::BitXor => Opcode::BinaryXor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::parser::parse;

    fn compile_source(source: &str) -> CodeArtifact {
        Compiler::new().compile(&parse(source).unwrap()).unwrap()
    }

    fn compile_raw(source: &str) -> CodeArtifact {
        Compiler::with_options(CompileOptions::new().with_peephole(false))
            .compile(&parse(source).unwrap())
            .unwrap()
    }

    fn opcodes(artifact: &CodeArtifact) -> Vec<Opcode> {
        decode(artifact)
            .unwrap()
            .into_iter()
            .map(|instr| instr.opcode)
            .collect()
    }

    // ===== Generator Layout Tests =====

    #[test]
    fn test_bytecode_single_loop() {
        let artifact = compile_source("(a for b in X)");
        assert_eq!(artifact.name, "<genexpr>");
        assert_eq!(
            artifact.code,
            vec![
                120, 18, 0, // SETUP_LOOP to 21
                124, 0, 0, // LOAD_FAST .0
                93, 11, 0, // FOR_ITER to 20
                125, 1, 0, // STORE_FAST b
                116, 0, 0, // LOAD_GLOBAL a
                86, // YIELD_VALUE
                1,  // POP_TOP
                113, 6, 0, // JUMP_ABSOLUTE 6
                87, // POP_BLOCK
                100, 0, 0, // LOAD_CONST None
                83, // RETURN_VALUE
            ]
        );
        assert_eq!(artifact.varnames, vec![".0", "b"]);
        assert_eq!(artifact.names, vec!["a"]);
        assert_eq!(artifact.constants.len(), 1);
    }

    #[test]
    fn test_bytecode_filter_before_and_after_peephole() {
        let raw = compile_raw("(a for b in X if f)");
        assert_eq!(
            raw.code,
            vec![
                120, 29, 0, // SETUP_LOOP to 32
                124, 0, 0, // LOAD_FAST .0
                93, 22, 0, // FOR_ITER to 31
                125, 1, 0, // STORE_FAST b
                116, 0, 0, // LOAD_GLOBAL f
                111, 9, 0, // JUMP_IF_FALSE to 27
                1,  // POP_TOP
                116, 1, 0, // LOAD_GLOBAL a
                86, // YIELD_VALUE
                1,  // POP_TOP
                110, 1, 0, // JUMP_FORWARD to 28
                1,  // POP_TOP
                113, 6, 0, // JUMP_ABSOLUTE 6
                87, // POP_BLOCK
                100, 0, 0, // LOAD_CONST None
                83, // RETURN_VALUE
            ]
        );

        // The forward jump onto the loop-back jump is threaded
        let optimized = compile_source("(a for b in X if f)");
        assert_eq!(&optimized.code[24..27], &[113, 6, 0]);
        assert_eq!(optimized.code.len(), raw.code.len());
    }

    #[test]
    fn test_tuple_target_unpacks() {
        let artifact = compile_source("(a for a, (b, c) in X)");
        let ops = opcodes(&artifact);
        assert_eq!(
            &ops[3..7],
            &[
                Opcode::UnpackSequence,
                Opcode::StoreFast,
                Opcode::UnpackSequence,
                Opcode::StoreFast,
            ]
        );
        assert_eq!(artifact.varnames, vec![".0", "a", "b", "c"]);
    }

    #[test]
    fn test_attribute_target() {
        let artifact = compile_source("(a for d.e in X)");
        let ops = opcodes(&artifact);
        assert_eq!(
            &ops[3..6],
            &[Opcode::LoadGlobal, Opcode::StoreAttr, Opcode::LoadGlobal]
        );
    }

    #[test]
    fn test_second_loop_iterates_expression() {
        let artifact = compile_source("(a for b in X for c in b.items)");
        let ops = opcodes(&artifact);
        assert!(ops.windows(3).any(|w| w
            == [Opcode::LoadAttr, Opcode::GetIter, Opcode::ForIter]));
        assert_eq!(ops.iter().filter(|op| **op == Opcode::SetupLoop).count(), 2);
    }

    // ===== Expression Compilation Tests =====

    #[test]
    fn test_compile_lambda_body() {
        let artifact = compile_source("a + 1");
        assert_eq!(artifact.name, "<lambda>");
        assert!(artifact.varnames.is_empty());
        assert_eq!(
            opcodes(&artifact),
            vec![
                Opcode::LoadGlobal,
                Opcode::LoadConst,
                Opcode::BinaryAdd,
                Opcode::ReturnValue
            ]
        );
        assert_eq!(artifact.constants.get(0).unwrap(), &Constant::None);
        assert_eq!(artifact.constants.get(1).unwrap(), &Constant::Int(1));
    }

    #[test]
    fn test_compile_chained_comparison() {
        let artifact = compile_source("a < b < c");
        assert_eq!(
            opcodes(&artifact),
            vec![
                Opcode::LoadGlobal,
                Opcode::LoadGlobal,
                Opcode::DupTop,
                Opcode::RotThree,
                Opcode::CompareOp,
                Opcode::JumpIfFalse,
                Opcode::PopTop,
                Opcode::LoadGlobal,
                Opcode::CompareOp,
                Opcode::JumpForward,
                Opcode::RotTwo,
                Opcode::PopTop,
                Opcode::ReturnValue,
            ]
        );
    }

    #[test]
    fn test_compile_bool_op_jumps_to_end() {
        let artifact = compile_source("a and b or c");
        let instructions = decode(&artifact).unwrap();
        let ops: Vec<Opcode> = instructions.iter().map(|i| i.opcode).collect();
        assert_eq!(
            ops,
            vec![
                Opcode::LoadGlobal,
                Opcode::JumpIfFalse,
                Opcode::PopTop,
                Opcode::LoadGlobal,
                Opcode::JumpIfTrue,
                Opcode::PopTop,
                Opcode::LoadGlobal,
                Opcode::ReturnValue,
            ]
        );
        // A false `a` lands on the `or` test, which leaves it for `c`
        let raw = compile_raw("a and b or c");
        let raw_instructions = decode(&raw).unwrap();
        assert_eq!(raw_instructions[1].jump_target(), Some(raw_instructions[4].offset));
        assert_eq!(instructions[1].jump_target(), Some(instructions[5].offset));
    }

    #[test]
    fn test_compile_conditional_expression() {
        let artifact = compile_source("a if b else c");
        assert_eq!(
            artifact.code,
            vec![
                116, 0, 0, // LOAD_GLOBAL b
                111, 7, 0, // JUMP_IF_FALSE to 13
                1,  // POP_TOP
                116, 1, 0, // LOAD_GLOBAL a
                110, 4, 0, // JUMP_FORWARD to 17
                1,  // POP_TOP
                116, 2, 0, // LOAD_GLOBAL c
                83, // RETURN_VALUE
            ]
        );
    }

    #[test]
    fn test_conditional_body_operands_thread_to_the_end() {
        // `x` failing skips straight past the else branch
        let artifact = compile_source("x and y if c else d");
        let instructions = decode(&artifact).unwrap();
        let end = instructions.last().unwrap().offset;
        let x_jump = &instructions[4];
        assert_eq!(x_jump.opcode, Opcode::JumpIfFalse);
        assert_eq!(x_jump.jump_target(), Some(end));
    }

    #[test]
    fn test_compile_call_with_keywords_and_varargs() {
        let artifact = compile_source("f(a, b=1, *c, **d)");
        let instructions = decode(&artifact).unwrap();
        let call = &instructions[instructions.len() - 2];
        assert_eq!(call.opcode, Opcode::CallFunctionVarKw);
        assert_eq!(call.arg, Some((1 << 8) | 1));
        assert!(artifact.constants.position(&Constant::Str("b".to_string())).is_some());
    }

    #[test]
    fn test_compile_dict_stores_value_then_key() {
        let artifact = compile_source("{'a': x}");
        assert_eq!(
            opcodes(&artifact),
            vec![
                Opcode::BuildMap,
                Opcode::LoadGlobal,
                Opcode::LoadConst,
                Opcode::StoreMap,
                Opcode::ReturnValue
            ]
        );
    }

    #[test]
    fn test_compile_slices() {
        assert!(opcodes(&compile_source("a[1:2]")).contains(&Opcode::Slice3));
        assert!(opcodes(&compile_source("a[:2]")).contains(&Opcode::Slice2));
        assert!(opcodes(&compile_source("a[1:]")).contains(&Opcode::Slice1));
        assert!(opcodes(&compile_source("a[:]")).contains(&Opcode::Slice0));

        let extended = opcodes(&compile_source("a[1:2:3]"));
        assert!(extended.contains(&Opcode::BuildSlice));
        assert!(extended.contains(&Opcode::BinarySubscr));

        let multi = opcodes(&compile_source("a[1:2, 3:4]"));
        assert_eq!(multi.iter().filter(|op| **op == Opcode::BuildSlice).count(), 2);
        assert!(multi.contains(&Opcode::BuildTuple));
    }

    #[test]
    fn test_negative_literal_is_one_constant() {
        let artifact = compile_source("-5");
        assert_eq!(opcodes(&artifact), vec![Opcode::LoadConst, Opcode::ReturnValue]);
        assert!(artifact.constants.position(&Constant::Int(-5)).is_some());
    }

    // ===== Peephole Tests =====

    #[test]
    fn test_none_name_becomes_constant() {
        let raw = compile_raw("None");
        assert_eq!(opcodes(&raw)[0], Opcode::LoadGlobal);

        let optimized = compile_source("None");
        assert_eq!(optimized.code, vec![100, 0, 0, 83]);
        assert_eq!(optimized.names, vec!["None"]);
    }

    #[test]
    fn test_constant_tuple_folded() {
        let artifact = compile_source("(1, 2)");
        assert_eq!(opcodes(&artifact), vec![Opcode::LoadConst, Opcode::ReturnValue]);
        assert!(artifact
            .constants
            .position(&Constant::Tuple(vec![Constant::Int(1), Constant::Int(2)]))
            .is_some());

        let raw = compile_raw("(1, 2)");
        assert_eq!(
            opcodes(&raw),
            vec![
                Opcode::LoadConst,
                Opcode::LoadConst,
                Opcode::BuildTuple,
                Opcode::ReturnValue
            ]
        );
    }

    #[test]
    fn test_not_filter_folds_into_jump_if_true() {
        let artifact = compile_source("(a for b in X if not f)");
        let ops = opcodes(&artifact);
        assert!(ops.contains(&Opcode::JumpIfTrue));
        assert!(!ops.contains(&Opcode::UnaryNot));
        assert!(!ops.contains(&Opcode::Nop));

        let raw = opcodes(&compile_raw("(a for b in X if not f)"));
        assert!(raw.contains(&Opcode::UnaryNot));
    }

    // ===== Closure Tests =====

    #[test]
    fn test_nested_generator_without_capture() {
        let artifact = compile_source("(sum(c for c in b.items) for b in X)");
        let ops = opcodes(&artifact);
        assert!(ops.contains(&Opcode::MakeFunction));
        assert!(!ops.contains(&Opcode::MakeClosure));
        assert!(artifact.cell_vars.is_empty());

        let nested = artifact.constants.iter().find_map(Constant::as_code).unwrap();
        assert_eq!(nested.name, "<genexpr>");
        assert!(nested.free_vars.is_empty());
    }

    #[test]
    fn test_nested_generator_captures_loop_variable() {
        let artifact = compile_source("(x for x in X if any(y == x for y in Y))");
        assert_eq!(artifact.cell_vars, vec!["x"]);
        assert_eq!(artifact.varnames, vec![".0"]);

        let ops = opcodes(&artifact);
        assert!(ops.contains(&Opcode::StoreDeref));
        assert!(ops.windows(4).any(|w| w
            == [
                Opcode::LoadClosure,
                Opcode::BuildTuple,
                Opcode::LoadConst,
                Opcode::MakeClosure
            ]));

        let nested = artifact.constants.iter().find_map(Constant::as_code).unwrap();
        assert_eq!(nested.free_vars, vec!["x"]);
        assert_eq!(nested.varnames, vec![".0", "y"]);
        assert!(opcodes(nested).contains(&Opcode::LoadDeref));
    }

    #[test]
    fn test_capture_passes_through_intermediate_generator() {
        let artifact =
            compile_source("(x for x in X if any(1 for y in Y if any(z == x for z in Z)))");
        let middle = artifact.constants.iter().find_map(Constant::as_code).unwrap();
        assert_eq!(middle.free_vars, vec!["x"]);
        assert!(middle.cell_vars.is_empty());
        let innermost = middle.constants.iter().find_map(Constant::as_code).unwrap();
        assert_eq!(innermost.free_vars, vec!["x"]);
    }

    #[test]
    fn test_lambda_closes_over_loop_variable() {
        let artifact = compile_source("(s for s in S if s.any(lambda m: m.v > s.v))");
        assert_eq!(artifact.cell_vars, vec!["s"]);
        assert!(opcodes(&artifact).contains(&Opcode::MakeClosure));

        let lambda = artifact.constants.iter().find_map(Constant::as_code).unwrap();
        assert_eq!(lambda.name, "<lambda>");
        assert_eq!(lambda.varnames, vec!["m"]);
        assert_eq!(lambda.free_vars, vec!["s"]);
        assert_eq!(lambda.arg_count, 1);
        assert_eq!(lambda.flags, 0);
        let ops = opcodes(lambda);
        assert_eq!(ops[0], Opcode::LoadFast);
        assert!(ops.contains(&Opcode::LoadDeref));
    }

    #[test]
    fn test_lambda_parameter_captured_by_generator() {
        let artifact = compile_source("lambda x, *r: any(y == x for y in r)");
        assert!(opcodes(&artifact).contains(&Opcode::MakeFunction));

        let lambda = artifact.constants.iter().find_map(Constant::as_code).unwrap();
        assert_eq!(lambda.varnames, vec!["x", "r"]);
        assert_eq!(lambda.cell_vars, vec!["x"]);
        assert!(lambda.free_vars.is_empty());
        assert_eq!(lambda.flags, crate::artifact::CO_VARARGS);

        let ops = opcodes(lambda);
        assert!(ops.contains(&Opcode::LoadClosure));
        assert!(ops.contains(&Opcode::LoadFast));
    }

    // ===== Error Tests =====

    #[test]
    fn test_outer_iterable_in_lambda_rejected() {
        let error = Compiler::new().compile(&Node::OuterIterable).unwrap_err();
        assert_eq!(error.kind, ErrorKind::InvalidExpression);
    }

    #[test]
    fn test_generator_without_clauses_rejected() {
        let node = Node::GenExprInner(Box::new(GenExprInner {
            expr: Node::name("a"),
            clauses: vec![],
        }));
        assert!(Compiler::new().compile(&node).is_err());
    }

    #[test]
    fn test_compilation_is_deterministic() {
        let source = "(x.a for x in X if x.b < 3 or x.c in (1, 2))";
        assert_eq!(compile_source(source), compile_source(source));
    }
}
