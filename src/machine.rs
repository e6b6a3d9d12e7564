//! Symbolic stack machine
//!
//! Replays a decoded instruction stream over a stack of AST fragments
//! instead of runtime values. Short-circuit clauses, loops and pending
//! unpacks live on the same stack as plain expressions, so every opcode
//! sees exactly the operand layout the real interpreter would.

use crate::artifact::{CodeArtifact, OUTER_ITERABLE_SLOT};
use crate::ast::{AssignTarget, BinaryKind, BoolKind, Keyword, Lambda, Literal, Node, UnaryKind};
use crate::boolean::{JumpRole, JumpRoles, OpenClause, PendingChain, PendingIfExp};
use crate::cfg::{ControlFlowGraph, EdgeKind};
use crate::constant_pool::Constant;
use crate::decoder::{Instruction, Operand, decode};
use crate::error::{DecompileError, DecompileResult};
use crate::loops::{OpenLoop, PendingUnpack, close_loops, store_target};
use crate::opcodes::{CompareOp, Opcode};
use crate::options::{DecompileOptions, NoneLiteral};
use log::{debug, trace, warn};
use std::collections::{BTreeSet, HashMap};

const LIST_COMPREHENSION_HINT: &str =
    "list comprehensions are not supported; use a generator expression";

/// Outcome of a successful decompilation
#[derive(Debug, Clone, PartialEq)]
pub struct Decompiled {
    /// `GenExprInner` for generator code, a bare expression for function
    /// bodies
    pub root: Node,
    /// Names the code reads but never binds, nested generator expressions
    /// included; `.0` is never listed
    pub external_names: BTreeSet<String>,
}

impl Decompiled {
    /// The generator expression, when the code was generator code
    pub fn genexpr(&self) -> Option<&crate::ast::GenExprInner> {
        match &self.root {
            Node::GenExprInner(inner) => Some(inner),
            _ => None,
        }
    }
}

/// One entry of the symbolic operand stack
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Slot<'a> {
    Expr(Node),
    /// Open `and`/`or` clause, or a filter condition awaiting its loop
    Clause(OpenClause),
    Loop(OpenLoop),
    Unpack(PendingUnpack),
    IfExp(PendingIfExp),
    /// Nested code object waiting for `MAKE_FUNCTION`
    Code(&'a CodeArtifact),
}

impl Slot<'_> {
    pub(crate) fn describe(&self) -> &'static str {
        match self {
            Slot::Expr(_) => "an expression",
            Slot::Clause(_) => "an open boolean clause",
            Slot::Loop(_) => "an open loop",
            Slot::Unpack(_) => "a pending unpack",
            Slot::IfExp(_) => "an open conditional expression",
            Slot::Code(_) => "a code object",
        }
    }
}

/// Decompile one code object; `depth` counts enclosing generator
/// expressions
pub(crate) fn decompile_code(
    artifact: &CodeArtifact,
    options: &DecompileOptions,
    depth: usize,
) -> DecompileResult<Decompiled> {
    let instructions = decode(artifact)?;
    check_whitelist(&instructions)?;
    let cfg = ControlFlowGraph::build(&instructions)?;
    debug!(
        "decompiling {} at depth {}: {} instructions, {} blocks",
        artifact.name,
        depth,
        instructions.len(),
        cfg.block_count()
    );
    let roles = JumpRoles::analyze(&cfg);

    Machine {
        artifact,
        cfg: &cfg,
        roles: &roles,
        options,
        depth,
        stack: Vec::with_capacity(16),
        pending: HashMap::new(),
        chains: HashMap::new(),
        loaded: BTreeSet::new(),
        assigned: BTreeSet::new(),
        nested_names: BTreeSet::new(),
    }
    .run()
}

/// Reject anything generator expressions never compile to before
/// executing a single instruction
fn check_whitelist(instructions: &[Instruction]) -> DecompileResult<()> {
    for instr in instructions {
        match instr.opcode {
            Opcode::ListAppend => {
                return Err(DecompileError::unsupported_with_hint(
                    instr.offset,
                    instr.opcode,
                    LIST_COMPREHENSION_HINT,
                ));
            }
            // Hidden list-comprehension accumulator
            Opcode::StoreFast if instr.name().is_some_and(|name| name.starts_with("_[")) => {
                return Err(DecompileError::unsupported_with_hint(
                    instr.offset,
                    instr.opcode,
                    LIST_COMPREHENSION_HINT,
                ));
            }
            op if is_whitelisted(op) => {}
            op => return Err(DecompileError::unsupported(instr.offset, op)),
        }
    }
    Ok(())
}

fn is_whitelisted(op: Opcode) -> bool {
    use Opcode::*;
    matches!(
        op,
        PopTop
            | RotTwo
            | RotThree
            | DupTop
            | Nop
            | UnaryPositive
            | UnaryNegative
            | UnaryNot
            | UnaryConvert
            | UnaryInvert
            | BinaryPower
            | BinaryMultiply
            | BinaryDivide
            | BinaryModulo
            | BinaryAdd
            | BinarySubtract
            | BinarySubscr
            | BinaryFloorDivide
            | BinaryTrueDivide
            | Slice0
            | Slice1
            | Slice2
            | Slice3
            | StoreMap
            | StoreSubscr
            | BinaryLshift
            | BinaryRshift
            | BinaryAnd
            | BinaryXor
            | BinaryOr
            | GetIter
            | ReturnValue
            | YieldValue
            | PopBlock
            | StoreName
            | UnpackSequence
            | ForIter
            | StoreAttr
            | LoadConst
            | LoadName
            | BuildTuple
            | BuildList
            | BuildMap
            | LoadAttr
            | Opcode::CompareOp
            | JumpForward
            | JumpIfFalse
            | JumpIfTrue
            | JumpAbsolute
            | LoadGlobal
            | SetupLoop
            | LoadFast
            | StoreFast
            | CallFunction
            | MakeFunction
            | BuildSlice
            | MakeClosure
            | LoadClosure
            | LoadDeref
            | StoreDeref
            | CallFunctionVar
            | CallFunctionKw
            | CallFunctionVarKw
    )
}

/// Instructions allowed after the terminal yield or return
fn is_cleanup(op: Opcode) -> bool {
    matches!(
        op,
        Opcode::PopTop
            | Opcode::Nop
            | Opcode::JumpForward
            | Opcode::JumpAbsolute
            | Opcode::PopBlock
            | Opcode::LoadConst
            | Opcode::ReturnValue
    )
}

#[inline]
fn stack_error(instr: &Instruction, reason: impl Into<String>) -> DecompileError {
    DecompileError::stack(instr.offset, instr.opcode, reason)
}

#[inline]
fn int_arg(instr: &Instruction) -> DecompileResult<u32> {
    instr
        .arg
        .ok_or_else(|| stack_error(instr, "missing operand"))
}

#[inline]
fn operand_name(instr: &Instruction) -> DecompileResult<String> {
    instr
        .name()
        .map(str::to_string)
        .ok_or_else(|| stack_error(instr, "missing name operand"))
}

struct Machine<'a> {
    artifact: &'a CodeArtifact,
    cfg: &'a ControlFlowGraph<'a>,
    roles: &'a JumpRoles,
    options: &'a DecompileOptions,
    depth: usize,

    stack: Vec<Slot<'a>>,
    /// Merge offset -> stack index of the clause that folds there
    pending: HashMap<usize, usize>,
    /// Cleanup offset -> chained comparison collecting links
    chains: HashMap<usize, PendingChain>,

    loaded: BTreeSet<String>,
    assigned: BTreeSet<String>,
    nested_names: BTreeSet<String>,
}

impl<'a> Machine<'a> {
    fn run(mut self) -> DecompileResult<Decompiled> {
        let instructions = self.cfg.instructions();
        let mut in_chain_cleanup = false;
        let mut after_branch = false;

        for (index, instr) in instructions.iter().enumerate() {
            if self.cfg.is_block_start(instr.offset) {
                in_chain_cleanup = self.roles.is_chain_cleanup(instr.offset);
                if !in_chain_cleanup {
                    self.complete_conditionals(instr.offset, instr)?;
                    self.reduce(instr.offset, instr)?;
                }
            }
            if in_chain_cleanup {
                // A threaded `then` exit can follow in the same block
                if matches!(instr.opcode, Opcode::RotTwo | Opcode::PopTop) {
                    continue;
                }
                in_chain_cleanup = false;
            }

            trace!(
                "{:>4} {:<20} depth={}",
                instr.offset,
                instr.opcode,
                self.stack.len()
            );

            if let Some(root) = self.step(instr, after_branch)? {
                check_tail(&instructions[index + 1..])?;
                return self.finish(root, instr);
            }
            after_branch = instr.opcode.is_conditional_jump();
        }

        let (offset, opcode) = instructions
            .last()
            .map(|instr| (instr.offset, instr.opcode))
            .unwrap_or((0, Opcode::StopCode));
        Err(DecompileError::stack(
            offset,
            opcode,
            "code ends without YIELD_VALUE or RETURN_VALUE",
        ))
    }

    /// Execute one instruction; returns the root once the terminal
    /// instruction has run
    fn step(&mut self, instr: &Instruction, after_branch: bool) -> DecompileResult<Option<Node>> {
        match instr.opcode {
            // ===== No-ops =====
            Opcode::Nop | Opcode::SetupLoop | Opcode::GetIter | Opcode::PopBlock => {}

            // ===== Stack shuffles =====
            Opcode::PopTop => {
                // Conditional jumps already consumed their operand
                if !after_branch && !self.entered_by_branch(instr.offset) {
                    return Err(stack_error(instr, "POP_TOP outside a conditional branch"));
                }
            }
            Opcode::DupTop => {
                let top = match self.stack.last() {
                    Some(Slot::Expr(node)) => node.clone(),
                    Some(other) => {
                        return Err(stack_error(
                            instr,
                            format!("cannot duplicate {}", other.describe()),
                        ));
                    }
                    None => return Err(stack_error(instr, "stack underflow")),
                };
                self.stack.push(Slot::Expr(top));
            }
            Opcode::RotTwo => {
                let len = self.require(instr, 2)?;
                self.stack.swap(len - 1, len - 2);
            }
            Opcode::RotThree => {
                let len = self.require(instr, 3)?;
                if let Some(top) = self.stack.pop() {
                    self.stack.insert(len - 3, top);
                }
            }

            // ===== Loads =====
            Opcode::LoadConst => self.load_const(instr)?,
            Opcode::LoadFast if instr.name() == Some(OUTER_ITERABLE_SLOT) => {
                self.stack.push(Slot::Expr(Node::OuterIterable));
            }
            Opcode::LoadFast | Opcode::LoadGlobal | Opcode::LoadName | Opcode::LoadDeref => {
                let name = operand_name(instr)?;
                self.loaded.insert(name.clone());
                self.stack.push(Slot::Expr(Node::Name(name)));
            }
            Opcode::LoadClosure => {
                let name = operand_name(instr)?;
                self.stack.push(Slot::Expr(Node::Name(name)));
            }
            Opcode::LoadAttr => {
                let name = operand_name(instr)?;
                let target = self.pop_expr(instr)?;
                self.stack.push(Slot::Expr(Node::attribute(target, name)));
            }

            // ===== Operators =====
            Opcode::UnaryPositive => self.unary(instr, UnaryKind::Plus)?,
            Opcode::UnaryNegative => self.unary(instr, UnaryKind::Minus)?,
            Opcode::UnaryNot => self.unary(instr, UnaryKind::Not)?,
            Opcode::UnaryConvert => self.unary(instr, UnaryKind::Backquote)?,
            Opcode::UnaryInvert => self.unary(instr, UnaryKind::Invert)?,

            Opcode::BinaryPower => self.binary(instr, BinaryKind::Power)?,
            Opcode::BinaryMultiply => self.binary(instr, BinaryKind::Mul)?,
            Opcode::BinaryDivide | Opcode::BinaryTrueDivide => {
                self.binary(instr, BinaryKind::Div)?
            }
            Opcode::BinaryFloorDivide => self.binary(instr, BinaryKind::FloorDiv)?,
            Opcode::BinaryModulo => self.binary(instr, BinaryKind::Mod)?,
            Opcode::BinaryAdd => self.binary(instr, BinaryKind::Add)?,
            Opcode::BinarySubtract => self.binary(instr, BinaryKind::Sub)?,
            Opcode::BinaryLshift => self.binary(instr, BinaryKind::LShift)?,
            Opcode::BinaryRshift => self.binary(instr, BinaryKind::RShift)?,
            Opcode::BinaryAnd => self.binary(instr, BinaryKind::BitAnd)?,
            Opcode::BinaryXor => self.binary(instr, BinaryKind::BitXor)?,
            Opcode::BinaryOr => self.binary(instr, BinaryKind::BitOr)?,

            Opcode::CompareOp => {
                let op = match instr.operand {
                    Operand::Compare(op) => op,
                    _ => return Err(stack_error(instr, "missing comparison operand")),
                };
                if op == CompareOp::ExceptionMatch {
                    return Err(DecompileError::unsupported_with_hint(
                        instr.offset,
                        instr.opcode,
                        "exception matching",
                    ));
                }
                let right = self.pop_expr(instr)?;
                let left = self.pop_expr(instr)?;
                self.stack.push(Slot::Expr(Node::compare(left, op, right)));
            }

            // ===== Subscripts and slices =====
            Opcode::BinarySubscr => {
                let index = self.pop_expr(instr)?;
                let target = self.pop_expr(instr)?;
                self.stack.push(Slot::Expr(Node::subscript(target, index)));
            }
            Opcode::Slice0 | Opcode::Slice1 | Opcode::Slice2 | Opcode::Slice3 => {
                let op = instr.opcode;
                let upper = if matches!(op, Opcode::Slice2 | Opcode::Slice3) {
                    Some(Box::new(self.pop_expr(instr)?))
                } else {
                    None
                };
                let lower = if matches!(op, Opcode::Slice1 | Opcode::Slice3) {
                    Some(Box::new(self.pop_expr(instr)?))
                } else {
                    None
                };
                let target = self.pop_expr(instr)?;
                let slice = Node::Slice {
                    lower,
                    upper,
                    step: None,
                };
                self.stack.push(Slot::Expr(Node::subscript(target, slice)));
            }
            Opcode::BuildSlice => {
                let count = int_arg(instr)?;
                if count != 2 && count != 3 {
                    return Err(stack_error(instr, format!("BUILD_SLICE of {} items", count)));
                }
                let step = if count == 3 {
                    self.slice_bound(instr)?
                } else {
                    None
                };
                let upper = self.slice_bound(instr)?;
                let lower = self.slice_bound(instr)?;
                self.stack
                    .push(Slot::Expr(Node::Slice { lower, upper, step }));
            }

            // ===== Displays =====
            Opcode::BuildTuple => {
                let items = self.pop_exprs(int_arg(instr)? as usize, instr)?;
                self.stack.push(Slot::Expr(Node::Tuple(items)));
            }
            Opcode::BuildList => {
                let items = self.pop_exprs(int_arg(instr)? as usize, instr)?;
                self.stack.push(Slot::Expr(Node::List(items)));
            }
            Opcode::BuildMap => self.stack.push(Slot::Expr(Node::Dict(Vec::new()))),
            Opcode::StoreMap => {
                let key = self.pop_expr(instr)?;
                let value = self.pop_expr(instr)?;
                match self.stack.last_mut() {
                    Some(Slot::Expr(Node::Dict(pairs))) => pairs.push((key, value)),
                    _ => return Err(stack_error(instr, "STORE_MAP without a dict below")),
                }
            }

            // ===== Calls =====
            Opcode::CallFunction
            | Opcode::CallFunctionVar
            | Opcode::CallFunctionKw
            | Opcode::CallFunctionVarKw => self.call(instr)?,
            Opcode::MakeFunction | Opcode::MakeClosure => self.make_function(instr)?,

            // ===== Loops and loop variables =====
            Opcode::ForIter => {
                let iter = self.pop_expr(instr)?;
                self.stack
                    .push(Slot::Loop(OpenLoop::new(instr.offset, iter)));
            }
            Opcode::StoreFast | Opcode::StoreName | Opcode::StoreDeref => {
                let name = operand_name(instr)?;
                self.assigned.insert(name.clone());
                self.store(instr, AssignTarget::Name(name))?;
            }
            Opcode::StoreAttr => {
                let name = operand_name(instr)?;
                let target = self.pop_expr(instr)?;
                self.store(instr, AssignTarget::Attribute { target, name })?;
            }
            Opcode::StoreSubscr => {
                let index = self.pop_expr(instr)?;
                let target = self.pop_expr(instr)?;
                self.store(instr, AssignTarget::Subscript { target, index })?;
            }
            Opcode::UnpackSequence => {
                let count = int_arg(instr)? as usize;
                match self.stack.last() {
                    Some(Slot::Unpack(_)) => {}
                    Some(Slot::Loop(open)) if open.target.is_none() => {}
                    _ => {
                        return Err(stack_error(
                            instr,
                            "UNPACK_SEQUENCE outside a loop target",
                        ));
                    }
                }
                if count == 0 {
                    self.store(instr, AssignTarget::Tuple(Vec::new()))?;
                } else {
                    self.stack.push(Slot::Unpack(PendingUnpack::new(count)));
                }
            }

            // ===== Branches =====
            Opcode::JumpIfFalse | Opcode::JumpIfTrue => self.branch(instr)?,
            Opcode::JumpForward | Opcode::JumpAbsolute => {
                if let Some(cleanup) = self.roles.chain_exit(instr.offset) {
                    self.chain_exit(instr, cleanup)?;
                } else if let Some(end) = self.roles.then_exit(instr.offset) {
                    self.then_exit(instr, end)?;
                } else {
                    return Err(DecompileError::unsupported_with_hint(
                        instr.offset,
                        instr.opcode,
                        "jump outside a conditional expression",
                    ));
                }
            }

            // ===== Terminals =====
            Opcode::YieldValue => {
                let elt = self.pop_expr(instr)?;
                self.check_no_pending(instr)?;
                let inner =
                    close_loops(&mut self.stack, elt).map_err(|reason| stack_error(instr, reason))?;
                return Ok(Some(Node::GenExprInner(Box::new(inner))));
            }
            Opcode::ReturnValue => {
                let root = self.pop_expr(instr)?;
                self.check_no_pending(instr)?;
                if let Some(slot) = self.stack.last() {
                    return Err(stack_error(
                        instr,
                        format!("{} left on the stack at return", slot.describe()),
                    ));
                }
                return Ok(Some(root));
            }

            op => return Err(DecompileError::unsupported(instr.offset, op)),
        }
        Ok(None)
    }

    fn finish(self, root: Node, instr: &Instruction) -> DecompileResult<Decompiled> {
        if !self.chains.is_empty() {
            return Err(stack_error(instr, "chained comparison never reached its exit"));
        }
        let Machine {
            loaded,
            assigned,
            nested_names,
            ..
        } = self;
        let external_names = loaded
            .into_iter()
            .chain(nested_names)
            .filter(|name| !assigned.contains(name))
            .collect();
        Ok(Decompiled {
            root,
            external_names,
        })
    }

    // ===== Stack helpers =====

    /// Ensure at least `count` slots; returns the current depth
    fn require(&self, instr: &Instruction, count: usize) -> DecompileResult<usize> {
        let len = self.stack.len();
        if len < count {
            return Err(stack_error(
                instr,
                format!("stack underflow: need {}, have {}", count, len),
            ));
        }
        Ok(len)
    }

    fn pop_slot(&mut self, instr: &Instruction) -> DecompileResult<Slot<'a>> {
        self.stack
            .pop()
            .ok_or_else(|| stack_error(instr, "stack underflow"))
    }

    fn pop_expr(&mut self, instr: &Instruction) -> DecompileResult<Node> {
        match self.pop_slot(instr)? {
            Slot::Expr(node) => Ok(node),
            other => Err(stack_error(
                instr,
                format!("expected an expression, found {}", other.describe()),
            )),
        }
    }

    /// Pop `count` expressions, returned bottom-most first
    fn pop_exprs(&mut self, count: usize, instr: &Instruction) -> DecompileResult<Vec<Node>> {
        self.require(instr, count)?;
        let mut items = Vec::with_capacity(count);
        for _ in 0..count {
            items.push(self.pop_expr(instr)?);
        }
        items.reverse();
        Ok(items)
    }

    fn unary(&mut self, instr: &Instruction, op: UnaryKind) -> DecompileResult<()> {
        let operand = self.pop_expr(instr)?;
        self.stack.push(Slot::Expr(Node::unary(op, operand)));
        Ok(())
    }

    fn binary(&mut self, instr: &Instruction, op: BinaryKind) -> DecompileResult<()> {
        let right = self.pop_expr(instr)?;
        let left = self.pop_expr(instr)?;
        self.stack.push(Slot::Expr(Node::binary(op, left, right)));
        Ok(())
    }

    fn store(&mut self, instr: &Instruction, target: AssignTarget) -> DecompileResult<()> {
        store_target(&mut self.stack, target).map_err(|reason| stack_error(instr, reason))
    }

    /// Slice bounds spelled as a `None` constant are absent
    fn slice_bound(&mut self, instr: &Instruction) -> DecompileResult<Option<Box<Node>>> {
        let node = self.pop_expr(instr)?;
        let absent = match &node {
            Node::Const(Literal::None) => true,
            Node::Name(name) => self.options.none_literal == NoneLiteral::Name && name == "None",
            _ => false,
        };
        Ok(if absent { None } else { Some(Box::new(node)) })
    }

    /// Is the block at `offset` the taken side of a conditional jump?
    fn entered_by_branch(&self, offset: usize) -> bool {
        self.cfg.incoming(offset).iter().any(|edge| {
            edge.kind == EdgeKind::ForwardConditional
                && self
                    .cfg
                    .instruction_at(edge.source)
                    .is_some_and(|source| source.opcode.is_conditional_jump())
        })
    }

    // ===== Constants =====

    fn load_const(&mut self, instr: &Instruction) -> DecompileResult<()> {
        let index = match instr.operand {
            Operand::Const(index) => index,
            _ => return Err(stack_error(instr, "missing constant operand")),
        };
        let artifact: &'a CodeArtifact = self.artifact;
        let constant = artifact
            .constants
            .get(index)
            .map_err(|reason| stack_error(instr, reason))?;
        let slot = match constant {
            Constant::Code(code) => Slot::Code(&**code),
            other => Slot::Expr(self.constant_node(other, instr)?),
        };
        self.stack.push(slot);
        Ok(())
    }

    fn constant_node(&self, constant: &Constant, instr: &Instruction) -> DecompileResult<Node> {
        Ok(match constant {
            Constant::None => match self.options.none_literal {
                NoneLiteral::Constant => Node::Const(Literal::None),
                NoneLiteral::Name => Node::name("None"),
            },
            Constant::Bool(value) => Node::Const(Literal::Bool(*value)),
            Constant::Int(value) => Node::Const(Literal::Int(*value)),
            Constant::Float(value) => Node::Const(Literal::Float(*value)),
            Constant::Str(value) => Node::Const(Literal::Str(value.clone())),
            Constant::Tuple(items) => {
                if !self.options.expand_constant_tuples {
                    warn!(
                        "constant tuple at offset {} left unexpanded: expansion is disabled",
                        instr.offset
                    );
                    return Err(DecompileError::unsupported_with_hint(
                        instr.offset,
                        instr.opcode,
                        "constant tuple expansion is disabled",
                    ));
                }
                Node::Tuple(
                    items
                        .iter()
                        .map(|item| self.constant_node(item, instr))
                        .collect::<DecompileResult<Vec<_>>>()?,
                )
            }
            Constant::Code(_) => {
                return Err(stack_error(instr, "code object nested in a constant tuple"));
            }
        })
    }

    // ===== Calls =====

    fn call(&mut self, instr: &Instruction) -> DecompileResult<()> {
        let argc = int_arg(instr)?;
        let positional = (argc & 0xff) as usize;
        let keyword_count = ((argc >> 8) & 0xff) as usize;
        let op = instr.opcode;

        let kwargs = if matches!(op, Opcode::CallFunctionKw | Opcode::CallFunctionVarKw) {
            Some(Box::new(self.pop_expr(instr)?))
        } else {
            None
        };
        let star_args = if matches!(op, Opcode::CallFunctionVar | Opcode::CallFunctionVarKw) {
            Some(Box::new(self.pop_expr(instr)?))
        } else {
            None
        };

        let mut keywords = Vec::with_capacity(keyword_count);
        for _ in 0..keyword_count {
            let value = self.pop_expr(instr)?;
            let name = match self.pop_expr(instr)? {
                Node::Const(Literal::Str(name)) => name,
                other => {
                    return Err(stack_error(
                        instr,
                        format!("keyword name must be a string constant, found {}", other),
                    ));
                }
            };
            keywords.push(Keyword { name, value });
        }
        keywords.reverse();

        let mut args = self.pop_exprs(positional, instr)?;
        let func = self.pop_expr(instr)?;

        let plain = keywords.is_empty() && star_args.is_none() && kwargs.is_none();
        let node = match func {
            // Calling a freshly built generator expression binds its
            // outer iterable
            Node::GenExprInner(inner) if plain && args.len() == 1 && inner.has_outer_iterable() => {
                match args.pop() {
                    Some(collection) => {
                        Node::GenExprInner(Box::new((*inner).with_outer_iterable(collection)))
                    }
                    None => return Err(stack_error(instr, "missing generator argument")),
                }
            }
            func => Node::Call {
                func: Box::new(func),
                args,
                keywords,
                star_args,
                kwargs,
            },
        };
        self.stack.push(Slot::Expr(node));
        Ok(())
    }

    fn make_function(&mut self, instr: &Instruction) -> DecompileResult<()> {
        if int_arg(instr)? != 0 {
            return Err(DecompileError::unsupported_with_hint(
                instr.offset,
                instr.opcode,
                "default arguments",
            ));
        }
        let code = match self.pop_slot(instr)? {
            Slot::Code(code) => code,
            other => {
                return Err(stack_error(
                    instr,
                    format!("expected a code object, found {}", other.describe()),
                ));
            }
        };
        if instr.opcode == Opcode::MakeClosure {
            match self.pop_expr(instr)? {
                Node::Tuple(_) => {}
                other => {
                    return Err(stack_error(
                        instr,
                        format!("closure cells must be a tuple, found {}", other),
                    ));
                }
            }
        }

        if self.depth + 1 > self.options.max_nesting_depth {
            warn!(
                "nesting depth limit {} reached at offset {} in {}",
                self.options.max_nesting_depth, instr.offset, self.artifact.name
            );
            return Err(DecompileError::unsupported_with_hint(
                instr.offset,
                instr.opcode,
                "functions nested too deeply",
            ));
        }

        let nested = decompile_code(code, self.options, self.depth + 1)?;
        // A lambda may return a bound generator expression but never loop itself
        let unbound_loop = matches!(
            &nested.root,
            Node::GenExprInner(inner) if inner.has_outer_iterable()
        );
        let node = match (code.is_generator(), unbound_loop, nested.root) {
            (true, true, root) => {
                self.nested_names.extend(nested.external_names);
                root
            }
            (true, false, _) | (false, true, _) => {
                return Err(DecompileError::unsupported_with_hint(
                    instr.offset,
                    instr.opcode,
                    "function that is neither a generator expression nor a lambda",
                ));
            }
            (false, false, body) => {
                let params = code.parameters().ok_or_else(|| {
                    stack_error(
                        instr,
                        format!("{} has fewer local slots than parameters", code.name),
                    )
                })?;
                let lambda = Lambda {
                    args: params.args,
                    varargs: params.varargs,
                    kwargs: params.kwargs,
                    body,
                };
                self.nested_names.extend(
                    nested
                        .external_names
                        .into_iter()
                        .filter(|name| !lambda.params().any(|param| param == name)),
                );
                Node::Lambda(Box::new(lambda))
            }
        };
        self.stack.push(Slot::Expr(node));
        Ok(())
    }

    // ===== Boolean structure =====

    fn branch(&mut self, instr: &Instruction) -> DecompileResult<()> {
        let role = self
            .roles
            .role(instr.offset)
            .ok_or_else(|| stack_error(instr, "conditional jump without a role"))?;

        match role {
            JumpRole::ChainLink { cleanup } => self.chain_link(instr, cleanup),
            JumpRole::Filter { for_iter, negate } => {
                self.reduce(instr.next_offset(), instr)?;
                let mut cond = self.pop_expr(instr)?;
                if negate {
                    cond = Node::not(cond);
                }
                let innermost = self.stack.iter().rev().find_map(|slot| match slot {
                    Slot::Loop(open) => Some(open),
                    _ => None,
                });
                match innermost {
                    Some(open) if open.for_iter == for_iter && open.target.is_some() => {}
                    _ => {
                        return Err(stack_error(
                            instr,
                            format!("filter of loop {} outside its innermost loop", for_iter),
                        ));
                    }
                }
                self.stack
                    .push(Slot::Clause(OpenClause::new(BoolKind::And, cond)));
                Ok(())
            }
            JumpRole::ShortCircuit { kind, merge } => {
                self.reduce(instr.next_offset(), instr)?;
                let cond = self.pop_expr(instr)?;
                let index = self.stack.len();
                self.stack.push(Slot::Clause(OpenClause::new(kind, cond)));
                // Operands sharing a merge point fold into the outermost
                // clause there
                self.pending.entry(merge).or_insert(index);
                trace!("open {:?} clause #{} merging at {}", kind, index, merge);
                Ok(())
            }
            JumpRole::IfTest {
                negate,
                orelse,
                end,
            } => {
                // `and` operands of the test are threaded onto the else
                // branch, `or` operands land just past this jump
                self.reduce(instr.next_offset(), instr)?;
                self.reduce(orelse, instr)?;
                let mut test = self.pop_expr(instr)?;
                if negate {
                    test = Node::not(test);
                }
                trace!("open conditional expression meeting at {}", end);
                self.stack.push(Slot::IfExp(PendingIfExp::new(test, end)));
                Ok(())
            }
        }
    }

    /// Fold the clause that merges at `merge` with everything above it
    fn reduce(&mut self, merge: usize, instr: &Instruction) -> DecompileResult<()> {
        let Some(index) = self.pending.remove(&merge) else {
            return Ok(());
        };
        trace!(
            "reduce clause #{} at {} over depth {}",
            index,
            merge,
            self.stack.len()
        );
        if !matches!(self.stack.get(index), Some(Slot::Clause(_))) {
            return Err(stack_error(
                instr,
                format!("merge point {} without an open clause", merge),
            ));
        }
        let node = self.collapse(index, instr)?;
        self.stack.push(Slot::Expr(node));
        Ok(())
    }

    /// Fold every slot from `base` up into one expression
    ///
    /// Each clause absorbs the value above it and a conditional expression
    /// in its else branch takes it as `orelse`. Clauses opened at or above
    /// `base` stop waiting for their merge points: a jump threaded past the
    /// fold still names a later offset that no longer closes anything.
    fn collapse(&mut self, base: usize, instr: &Instruction) -> DecompileResult<Node> {
        let mut held: Option<Node> = None;
        while self.stack.len() > base {
            let slot = self.pop_slot(instr)?;
            held = Some(match (slot, held) {
                (Slot::Expr(node), None) => node,
                (Slot::Expr(_), Some(_)) => {
                    return Err(stack_error(
                        instr,
                        "short-circuit operand without an open clause",
                    ));
                }
                (Slot::Clause(mut clause), held) => {
                    if let Some(operand) = held {
                        clause.absorb(operand);
                    }
                    clause.finish()
                }
                (Slot::IfExp(pending), Some(orelse)) if pending.in_else() => pending
                    .finish(orelse)
                    .map_err(|reason| stack_error(instr, reason))?,
                (other, _) => {
                    return Err(stack_error(
                        instr,
                        format!("{} inside a boolean clause", other.describe()),
                    ));
                }
            });
        }
        self.pending.retain(|_, open| *open < base);
        held.ok_or_else(|| stack_error(instr, "nothing to fold"))
    }

    /// Close the `then` branch of the innermost conditional expression
    fn then_exit(&mut self, instr: &Instruction, end: usize) -> DecompileResult<()> {
        let index = self
            .stack
            .iter()
            .rposition(|slot| matches!(slot, Slot::IfExp(pending) if !pending.in_else()))
            .ok_or_else(|| stack_error(instr, "then branch outside a conditional expression"))?;
        let body = self.collapse(index + 1, instr)?;
        match self.stack.last_mut() {
            Some(Slot::IfExp(pending)) if pending.end == end => pending
                .close_body(body)
                .map_err(|reason| stack_error(instr, reason)),
            _ => Err(stack_error(
                instr,
                format!("then branch meeting at {} closes another expression", end),
            )),
        }
    }

    /// Fold the conditional expressions whose branches meet at `offset`,
    /// innermost first
    fn complete_conditionals(&mut self, offset: usize, instr: &Instruction) -> DecompileResult<()> {
        while let Some(index) = self
            .stack
            .iter()
            .rposition(|slot| matches!(slot, Slot::IfExp(_)))
        {
            let meets_here = matches!(
                self.stack.get(index),
                Some(Slot::IfExp(pending)) if pending.in_else() && pending.end == offset
            );
            if !meets_here {
                break;
            }
            let node = self.collapse(index, instr)?;
            self.stack.push(Slot::Expr(node));
        }
        Ok(())
    }

    fn check_no_pending(&self, instr: &Instruction) -> DecompileResult<()> {
        match self.pending.keys().min() {
            Some(merge) => Err(stack_error(
                instr,
                format!("boolean clause merging at {} never closed", merge),
            )),
            None => Ok(()),
        }
    }

    fn chain_link(&mut self, instr: &Instruction, cleanup: usize) -> DecompileResult<()> {
        let compare = self.pop_expr(instr)?;
        let depth = self.stack.len();
        let result = match self.chains.get_mut(&cleanup) {
            Some(chain) => chain.link(compare, depth),
            None => PendingChain::start(compare, depth).map(|chain| {
                self.chains.insert(cleanup, chain);
            }),
        };
        result.map_err(|reason| stack_error(instr, reason))
    }

    fn chain_exit(&mut self, instr: &Instruction, cleanup: usize) -> DecompileResult<()> {
        let chain = self
            .chains
            .remove(&cleanup)
            .ok_or_else(|| stack_error(instr, "chain exit without an open chained comparison"))?;
        let compare = self.pop_expr(instr)?;
        let node = chain
            .exit(compare, self.stack.len())
            .map_err(|reason| stack_error(instr, reason))?;
        self.stack.push(Slot::Expr(node));
        Ok(())
    }
}

/// Only loop bookkeeping and the implicit `return None` may follow the
/// terminal instruction
fn check_tail(tail: &[Instruction]) -> DecompileResult<()> {
    match tail.iter().find(|instr| !is_cleanup(instr.opcode)) {
        Some(instr) => Err(DecompileError::unsupported_with_hint(
            instr.offset,
            instr.opcode,
            "code continues past the yielded element",
        )),
        None => Ok(()),
    }
}
