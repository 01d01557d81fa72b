use indexmap::IndexMap;
use miette::Diagnostic;
use thiserror::Error;

use memorax_dsl::ast::{self, InitValue, Program, Spanned};

use crate::automaton::{Automaton, StateId};
use crate::lang::{Cond, CondOperand, Instr, Nml, RExpr};

#[derive(Debug, Error, Diagnostic)]
pub enum MachineError {
    #[error("Unknown label '{name}'")]
    #[diagnostic(code(memorax::machine::unknown_label))]
    UnknownLabel {
        name: String,
        #[label("no statement carries this label")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Duplicate label '{name}'")]
    #[diagnostic(code(memorax::machine::duplicate_label))]
    DuplicateLabel {
        name: String,
        #[label("already defined in this process")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Unknown memory location '{name}'")]
    #[diagnostic(code(memorax::machine::unknown_location))]
    UnknownLocation {
        name: String,
        #[label("not declared as global or local data")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Unknown register '${name}'")]
    #[diagnostic(code(memorax::machine::unknown_register))]
    UnknownRegister {
        name: String,
        #[label("not declared in this process")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Forbidden tuple names {found} control states, but the program has {expected} processes")]
    #[diagnostic(code(memorax::machine::forbidden_arity))]
    ForbiddenArity { expected: usize, found: usize },

    #[error("Abstraction predicates must be nullary: registers are not allowed")]
    #[diagnostic(code(memorax::machine::register_in_predicate))]
    RegisterInPredicate,

    #[error("assume conditions range over registers only")]
    #[diagnostic(code(memorax::machine::assume_over_memory))]
    AssumeOverMemory,

    #[error("Statement not allowed inside a locked block")]
    #[diagnostic(code(memorax::machine::unsupported_in_locked))]
    UnsupportedInLocked {
        #[label("only reads, writes, register statements and assumes may be locked")]
        span: miette::SourceSpan,
        #[source_code]
        src: miette::NamedSource<String>,
    },

    #[error("Register '${name}' needs a finite domain for register-free form")]
    #[diagnostic(
        code(memorax::machine::unbounded_register),
        help("declare the register as `$r = v : [lo:hi]`")
    )]
    UnboundedRegister { name: String },

    #[error("{0}")]
    #[diagnostic(code(memorax::machine::multiple))]
    Multiple(#[from] MachineErrors),
}

/// Wrapper for collecting multiple build errors.
///
/// Compilation recovers from per-statement problems (duplicate labels,
/// unknown jump targets, unresolved names) and reports everything found
/// in one program together instead of failing on the first.
#[derive(Debug, Error)]
#[error("{}", format_machine_errors(.errors))]
pub struct MachineErrors {
    pub errors: Vec<MachineError>,
}

fn format_machine_errors(errors: &[MachineError]) -> String {
    if errors.len() == 1 {
        return errors[0].to_string();
    }
    let mut s = format!("{} build errors:\n", errors.len());
    for (i, e) in errors.iter().enumerate() {
        s.push_str(&format!("  {}. {}\n", i + 1, e));
    }
    s
}

/// Declared variable or register: name, initial value, optional domain.
#[derive(Debug, Clone, PartialEq)]
pub struct VarInfo {
    pub name: String,
    pub init: InitValue,
    pub domain: Option<(i64, i64)>,
}

impl From<&ast::VarDecl> for VarInfo {
    fn from(decl: &ast::VarDecl) -> Self {
        VarInfo {
            name: decl.name.clone(),
            init: decl.init,
            domain: decl.domain,
        }
    }
}

/// A process-attributed transition, as recorded in witness traces.
#[derive(Debug, Clone, PartialEq)]
pub struct PTransition {
    pub pid: usize,
    pub source: StateId,
    pub instr: Instr,
    pub target: StateId,
}

impl std::fmt::Display for PTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "P{}: q{} --[{}]--> q{}",
            self.pid, self.source, self.instr, self.target
        )
    }
}

/// A compiled program: one automaton per process plus the variable
/// tables, forbidden control tuples and declared predicates.
#[derive(Debug, Clone)]
pub struct Machine {
    pub gvars: Vec<VarInfo>,
    pub lvars: Vec<Vec<VarInfo>>,
    pub regs: Vec<Vec<VarInfo>>,
    pub automata: Vec<Automaton>,
    /// Expanded forbidden PC tuples (one state per process).
    pub forbidden: Vec<Vec<StateId>>,
    /// Nullary predicates over memory cells, for the pb abstraction.
    pub predicates: Vec<Cond>,
    pretty_nml: IndexMap<Nml, String>,
    pretty_reg: IndexMap<(usize, usize), String>,
}

impl Machine {
    pub fn proc_count(&self) -> usize {
        self.automata.len()
    }

    pub fn pretty_string_nml(&self, nml: Nml) -> String {
        self.pretty_nml
            .get(&nml)
            .cloned()
            .unwrap_or_else(|| nml.to_string())
    }

    pub fn pretty_string_reg(&self, pid: usize, reg: usize) -> String {
        self.pretty_reg
            .get(&(pid, reg))
            .cloned()
            .unwrap_or_else(|| format!("$r{reg}"))
    }

    pub fn pretty_string_transition(&self, t: &PTransition) -> String {
        format!(
            "P{}: {} --[{}]--> {}",
            t.pid,
            self.automata[t.pid].state_name(t.source),
            self.pretty_string_instr(t.pid, &t.instr),
            self.automata[t.pid].state_name(t.target)
        )
    }

    pub fn pretty_string_instr(&self, pid: usize, instr: &Instr) -> String {
        match instr {
            Instr::ReadAssert { nml, expr } => {
                format!("read: {} = {}", self.pretty_string_nml(*nml), expr)
            }
            Instr::ReadAssign { reg, nml } => format!(
                "read: {} := {}",
                self.pretty_string_reg(pid, *reg),
                self.pretty_string_nml(*nml)
            ),
            Instr::Write { nml, expr } => {
                format!("write: {} := {}", self.pretty_string_nml(*nml), expr)
            }
            Instr::RegAssign { reg, expr } => {
                format!("{} := {}", self.pretty_string_reg(pid, *reg), expr)
            }
            Instr::SyncRead { body } => match body.as_ref() {
                Instr::ReadAssert { nml, expr } => {
                    format!("syncrd: {} = {}", self.pretty_string_nml(*nml), expr)
                }
                Instr::ReadAssign { reg, nml } => format!(
                    "syncrd: {} := {}",
                    self.pretty_string_reg(pid, *reg),
                    self.pretty_string_nml(*nml)
                ),
                other => format!("syncrd: {}", self.pretty_string_instr(pid, other)),
            },
            Instr::Update { writer, nmls } => {
                let names: Vec<String> = nmls.iter().map(|n| self.pretty_string_nml(*n)).collect();
                format!("update(P{writer}, {{{}}})", names.join(", "))
            }
            Instr::Locked { body, store_only } => {
                let inner: Vec<String> = body
                    .iter()
                    .map(|i| self.pretty_string_instr(pid, i))
                    .collect();
                let kw = if *store_only { "slocked" } else { "locked" };
                format!("{kw} {{ {} }}", inner.join("; "))
            }
            other => other.to_string(),
        }
    }

    /// The declared initial value of a memory cell.
    pub fn init_value(&self, nml: Nml) -> InitValue {
        match nml {
            Nml::Global(i) => self.gvars[i].init,
            Nml::Local { owner, var } => self.lvars[owner][var].init,
        }
    }

    /// The declared finite domain of a memory cell, if any.
    pub fn domain(&self, nml: Nml) -> Option<(i64, i64)> {
        match nml {
            Nml::Global(i) => self.gvars[i].domain,
            Nml::Local { owner, var } => self.lvars[owner][var].domain,
        }
    }

    /// All memory cells, globals first, then each process's locals.
    pub fn all_nmls(&self) -> Vec<Nml> {
        let mut out: Vec<Nml> = (0..self.gvars.len()).map(Nml::Global).collect();
        for (owner, locals) in self.lvars.iter().enumerate() {
            out.extend((0..locals.len()).map(|var| Nml::Local { owner, var }));
        }
        out
    }

    /// Compile a parsed program.
    pub fn from_ast(
        program: &Program,
        source: &str,
        filename: &str,
    ) -> Result<Machine, MachineError> {
        let ctx = SrcCtx { source, filename };
        let globals: IndexMap<String, usize> = program
            .globals
            .iter()
            .enumerate()
            .map(|(i, v)| (v.name.clone(), i))
            .collect();

        let mut errors: Vec<MachineError> = Vec::new();
        let mut automata = Vec::new();
        let mut lvars = Vec::new();
        let mut regs = Vec::new();
        for (pid, proc) in program.processes.iter().enumerate() {
            let resolver = Resolver {
                pid,
                globals: &globals,
                locals: proc
                    .locals
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (v.name.clone(), i))
                    .collect(),
                regs: proc
                    .registers
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (v.name.clone(), i))
                    .collect(),
                ctx: &ctx,
            };
            let mut builder = Builder {
                aut: Automaton::default(),
                gotos: Vec::new(),
                resolver: &resolver,
                errors: Vec::new(),
            };
            builder.compile_body(&proc.body);
            let (aut, errs) = builder.finish();
            errors.extend(errs);
            automata.push(aut);
            lvars.push(proc.locals.iter().map(VarInfo::from).collect());
            regs.push(proc.registers.iter().map(VarInfo::from).collect());
        }

        let forbidden = expand_forbidden(program, &automata, &ctx, &mut errors);

        let mut predicates = Vec::new();
        for pred in &program.predicates {
            match resolve_predicate(&pred.node, pred.span, &globals, &ctx) {
                Ok(cond) => predicates.push(cond),
                Err(e) => errors.push(e),
            }
        }

        if !errors.is_empty() {
            return Err(if errors.len() == 1 {
                errors.swap_remove(0)
            } else {
                MachineError::Multiple(MachineErrors { errors })
            });
        }

        let mut pretty_nml = IndexMap::new();
        for (i, v) in program.globals.iter().enumerate() {
            pretty_nml.insert(Nml::Global(i), v.name.clone());
        }
        for (pid, proc) in program.processes.iter().enumerate() {
            for (i, v) in proc.locals.iter().enumerate() {
                pretty_nml.insert(
                    Nml::Local { owner: pid, var: i },
                    format!("{}[P{pid}]", v.name),
                );
            }
        }
        let mut pretty_reg = IndexMap::new();
        for (pid, proc) in program.processes.iter().enumerate() {
            for (i, v) in proc.registers.iter().enumerate() {
                pretty_reg.insert((pid, i), format!("${}", v.name));
            }
        }

        Ok(Machine {
            gvars: program.globals.iter().map(VarInfo::from).collect(),
            lvars,
            regs,
            automata,
            forbidden,
            predicates,
            pretty_nml,
            pretty_reg,
        })
    }

    /// Register-free form: concretize register state into control state.
    ///
    /// Every register needs a finite domain. Register statements become
    /// nops or read-asserts over concrete values; the register tables of
    /// the result are empty.
    pub fn remove_registers(&self) -> Result<Machine, MachineError> {
        let mut out = self.clone();
        let mut forbidden_maps: Vec<Vec<Vec<StateId>>> = Vec::new();
        for pid in 0..self.proc_count() {
            let (aut, state_map) = rff_process(self, pid)?;
            forbidden_maps.push(state_map);
            out.automata[pid] = aut;
            out.regs[pid] = Vec::new();
        }
        let mut forbidden = Vec::new();
        for tuple in &self.forbidden {
            let mut expanded: Vec<Vec<StateId>> = vec![Vec::new()];
            for (pid, &old_state) in tuple.iter().enumerate() {
                let images = &forbidden_maps[pid][old_state];
                expanded = expanded
                    .into_iter()
                    .flat_map(|prefix| {
                        images.iter().map(move |s| {
                            let mut t = prefix.clone();
                            t.push(*s);
                            t
                        })
                    })
                    .collect();
            }
            forbidden.extend(expanded);
        }
        forbidden.sort();
        forbidden.dedup();
        out.forbidden = forbidden;
        Ok(out)
    }

    /// Shorten nop-only detours left behind by compilation or by
    /// register-free form. States are retargeted, never renumbered, so
    /// forbidden tuples stay valid.
    pub fn remove_superfluous_nops(&self) -> Machine {
        let mut out = self.clone();
        for (pid, aut) in out.automata.iter_mut().enumerate() {
            let forbidden_states: std::collections::HashSet<StateId> = self
                .forbidden
                .iter()
                .map(|tuple| tuple[pid])
                .collect();
            let skip_target = |aut: &Automaton, mut state: StateId| -> StateId {
                let mut seen = std::collections::HashSet::new();
                loop {
                    if forbidden_states.contains(&state) || !seen.insert(state) {
                        return state;
                    }
                    let outgoing = &aut.states[state].fwd_transitions;
                    if outgoing.len() != 1 {
                        return state;
                    }
                    let t = &aut.transitions[outgoing[0]];
                    if t.instr != Instr::Nop || t.target == state {
                        return state;
                    }
                    state = t.target;
                }
            };
            let retargets: Vec<(usize, StateId)> = aut
                .transitions
                .iter()
                .enumerate()
                .map(|(i, t)| (i, skip_target(aut, t.target)))
                .collect();
            for (i, target) in retargets {
                aut.transitions[i].target = target;
            }
        }
        out
    }
}

struct SrcCtx<'a> {
    source: &'a str,
    filename: &'a str,
}

impl SrcCtx<'_> {
    fn named_source(&self) -> miette::NamedSource<String> {
        miette::NamedSource::new(self.filename, self.source.to_owned())
    }

    fn span(&self, span: ast::Span) -> miette::SourceSpan {
        (span.start, span.end.saturating_sub(span.start)).into()
    }
}

struct Resolver<'a> {
    pid: usize,
    globals: &'a IndexMap<String, usize>,
    locals: IndexMap<String, usize>,
    regs: IndexMap<String, usize>,
    ctx: &'a SrcCtx<'a>,
}

impl Resolver<'_> {
    fn resolve_loc(&self, name: &Spanned<String>) -> Result<Nml, MachineError> {
        if let Some(var) = self.locals.get(&name.node) {
            return Ok(Nml::Local {
                owner: self.pid,
                var: *var,
            });
        }
        if let Some(i) = self.globals.get(&name.node) {
            return Ok(Nml::Global(*i));
        }
        Err(MachineError::UnknownLocation {
            name: name.node.clone(),
            span: self.ctx.span(name.span),
            src: self.ctx.named_source(),
        })
    }

    fn resolve_reg(&self, name: &Spanned<String>) -> Result<usize, MachineError> {
        self.regs
            .get(&name.node)
            .copied()
            .ok_or_else(|| MachineError::UnknownRegister {
                name: name.node.clone(),
                span: self.ctx.span(name.span),
                src: self.ctx.named_source(),
            })
    }

    fn resolve_reg_by_name(&self, name: &str, span: ast::Span) -> Result<usize, MachineError> {
        self.regs
            .get(name)
            .copied()
            .ok_or_else(|| MachineError::UnknownRegister {
                name: name.to_owned(),
                span: self.ctx.span(span),
                src: self.ctx.named_source(),
            })
    }

    fn resolve_expr(&self, expr: &ast::Expr, span: ast::Span) -> Result<RExpr, MachineError> {
        match expr {
            ast::Expr::Int(n) => Ok(RExpr::Int(*n)),
            ast::Expr::Reg(name) => Ok(RExpr::Reg(self.resolve_reg_by_name(name, span)?)),
            ast::Expr::BinOp(lhs, op, rhs) => Ok(RExpr::BinOp(
                Box::new(self.resolve_expr(lhs, span)?),
                *op,
                Box::new(self.resolve_expr(rhs, span)?),
            )),
        }
    }

    fn resolve_cond(&self, cond: &ast::BExpr, span: ast::Span) -> Result<Cond, MachineError> {
        match cond {
            ast::BExpr::True => Ok(Cond::True),
            ast::BExpr::False => Ok(Cond::False),
            ast::BExpr::And(lhs, rhs) => Ok(Cond::And(
                Box::new(self.resolve_cond(lhs, span)?),
                Box::new(self.resolve_cond(rhs, span)?),
            )),
            ast::BExpr::Cmp { lhs, op, rhs } => Ok(Cond::Cmp {
                lhs: self.resolve_operand(lhs, span)?,
                op: *op,
                rhs: self.resolve_operand(rhs, span)?,
            }),
        }
    }

    fn resolve_operand(
        &self,
        op: &ast::Operand,
        span: ast::Span,
    ) -> Result<CondOperand, MachineError> {
        match op {
            ast::Operand::Int(n) => Ok(CondOperand::Int(*n)),
            ast::Operand::Reg(name) => Ok(CondOperand::Reg(self.resolve_reg_by_name(name, span)?)),
            ast::Operand::Loc(name) => {
                let spanned = Spanned::new(name.clone(), span);
                Ok(CondOperand::Cell(self.resolve_loc(&spanned)?))
            }
        }
    }
}

struct Builder<'a> {
    aut: Automaton,
    gotos: Vec<(StateId, Spanned<String>)>,
    resolver: &'a Resolver<'a>,
    /// Compilation recovers per statement; everything found lands here.
    errors: Vec<MachineError>,
}

impl Builder<'_> {
    fn compile_body(&mut self, body: &[ast::LabeledStmt]) {
        let entry = self.aut.add_state();
        let exit = self.aut.add_state();
        self.compile_seq(body, entry, exit);
    }

    fn compile_seq(&mut self, body: &[ast::LabeledStmt], entry: StateId, exit: StateId) {
        if body.is_empty() {
            self.aut.add_transition(entry, Instr::Nop, exit);
            return;
        }
        let mut cur = entry;
        for (i, ls) in body.iter().enumerate() {
            let next = if i + 1 == body.len() {
                exit
            } else {
                self.aut.add_state()
            };
            for label in &ls.labels {
                if self.aut.labels.contains_key(&label.node) {
                    self.errors.push(MachineError::DuplicateLabel {
                        name: label.node.clone(),
                        span: self.resolver.ctx.span(label.span),
                        src: self.resolver.ctx.named_source(),
                    });
                } else {
                    self.aut.labels.insert(label.node.clone(), cur);
                }
            }
            self.compile_stmt(&ls.stmt, cur, next);
            cur = next;
        }
    }

    fn compile_stmt(&mut self, stmt: &Spanned<ast::Stmt>, cur: StateId, next: StateId) {
        let span = stmt.span;
        match &stmt.node {
            ast::Stmt::Goto { label } => {
                self.gotos.push((cur, label.clone()));
            }
            ast::Stmt::Either { branches } => {
                for branch in branches {
                    self.compile_seq(branch, cur, next);
                }
            }
            other => match self.compile_simple(other, span) {
                Ok(instr) => {
                    self.aut.add_transition(cur, instr, next);
                }
                Err(e) => {
                    // Keep the control-flow shape so later statements
                    // still resolve.
                    self.errors.push(e);
                    self.aut.add_transition(cur, Instr::Nop, next);
                }
            },
        }
    }

    fn compile_simple(&self, stmt: &ast::Stmt, span: ast::Span) -> Result<Instr, MachineError> {
        let r = self.resolver;
        match stmt {
            ast::Stmt::Nop => Ok(Instr::Nop),
            ast::Stmt::Fence => Ok(Instr::Fence),
            ast::Stmt::ReadAssert { loc, expr } => Ok(Instr::ReadAssert {
                nml: r.resolve_loc(loc)?,
                expr: r.resolve_expr(expr, span)?,
            }),
            ast::Stmt::ReadAssign { reg, loc } => Ok(Instr::ReadAssign {
                reg: r.resolve_reg(reg)?,
                nml: r.resolve_loc(loc)?,
            }),
            ast::Stmt::Write { loc, expr } => Ok(Instr::Write {
                nml: r.resolve_loc(loc)?,
                expr: r.resolve_expr(expr, span)?,
            }),
            ast::Stmt::RegAssign { reg, expr } => Ok(Instr::RegAssign {
                reg: r.resolve_reg(reg)?,
                expr: r.resolve_expr(expr, span)?,
            }),
            ast::Stmt::Assume { cond } => {
                let cond = r.resolve_cond(cond, span)?;
                let over_memory = cond.atoms().iter().any(|a| match a {
                    Cond::Cmp { lhs, rhs, .. } => {
                        matches!(lhs, CondOperand::Cell(_)) || matches!(rhs, CondOperand::Cell(_))
                    }
                    _ => false,
                });
                if over_memory {
                    return Err(MachineError::AssumeOverMemory);
                }
                Ok(Instr::Assume { cond })
            }
            ast::Stmt::SyncRead { body } => Ok(Instr::SyncRead {
                body: Box::new(self.compile_simple(body, span)?),
            }),
            ast::Stmt::Locked { body, store_only } => {
                let mut instrs = Vec::new();
                for inner in body {
                    match &inner.node {
                        ast::Stmt::Goto { .. }
                        | ast::Stmt::Either { .. }
                        | ast::Stmt::Locked { .. }
                        | ast::Stmt::SyncRead { .. }
                        | ast::Stmt::Fence => {
                            return Err(MachineError::UnsupportedInLocked {
                                span: r.ctx.span(inner.span),
                                src: r.ctx.named_source(),
                            })
                        }
                        simple => instrs.push(self.compile_simple(simple, inner.span)?),
                    }
                }
                Ok(Instr::Locked {
                    body: instrs,
                    store_only: *store_only,
                })
            }
            ast::Stmt::Goto { .. } | ast::Stmt::Either { .. } => unreachable!("handled by caller"),
        }
    }

    fn finish(mut self) -> (Automaton, Vec<MachineError>) {
        for (source, label) in std::mem::take(&mut self.gotos) {
            match self.aut.find_label(&label.node) {
                Some(target) => {
                    self.aut.add_transition(source, Instr::Nop, target);
                }
                None => self.errors.push(MachineError::UnknownLabel {
                    name: label.node.clone(),
                    span: self.resolver.ctx.span(label.span),
                    src: self.resolver.ctx.named_source(),
                }),
            }
        }
        (self.aut, self.errors)
    }
}

/// Expand the forbidden tuples; malformed tuples are recorded and
/// skipped so the remaining ones still resolve.
fn expand_forbidden(
    program: &Program,
    automata: &[Automaton],
    ctx: &SrcCtx<'_>,
    errors: &mut Vec<MachineError>,
) -> Vec<Vec<StateId>> {
    let mut forbidden = Vec::new();
    'tuples: for tuple in &program.forbidden {
        if tuple.labels.len() != automata.len() {
            errors.push(MachineError::ForbiddenArity {
                expected: automata.len(),
                found: tuple.labels.len(),
            });
            continue;
        }
        let mut expanded: Vec<Vec<StateId>> = vec![Vec::new()];
        for (pid, label) in tuple.labels.iter().enumerate() {
            let states: Vec<StateId> = if label.node == "*" {
                (0..automata[pid].states.len()).collect()
            } else {
                match automata[pid].find_label(&label.node) {
                    Some(state) => vec![state],
                    None => {
                        errors.push(MachineError::UnknownLabel {
                            name: label.node.clone(),
                            span: ctx.span(label.span),
                            src: ctx.named_source(),
                        });
                        continue 'tuples;
                    }
                }
            };
            expanded = expanded
                .into_iter()
                .flat_map(|prefix| {
                    states.iter().map(move |s| {
                        let mut t = prefix.clone();
                        t.push(*s);
                        t
                    })
                })
                .collect();
        }
        forbidden.extend(expanded);
    }
    forbidden.sort();
    forbidden.dedup();
    forbidden
}

fn resolve_predicate(
    bexpr: &ast::BExpr,
    span: ast::Span,
    globals: &IndexMap<String, usize>,
    ctx: &SrcCtx<'_>,
) -> Result<Cond, MachineError> {
    match bexpr {
        ast::BExpr::True => Ok(Cond::True),
        ast::BExpr::False => Ok(Cond::False),
        ast::BExpr::And(lhs, rhs) => Ok(Cond::And(
            Box::new(resolve_predicate(lhs, span, globals, ctx)?),
            Box::new(resolve_predicate(rhs, span, globals, ctx)?),
        )),
        ast::BExpr::Cmp { lhs, op, rhs } => {
            let resolve = |operand: &ast::Operand| -> Result<CondOperand, MachineError> {
                match operand {
                    ast::Operand::Int(n) => Ok(CondOperand::Int(*n)),
                    ast::Operand::Reg(_) => Err(MachineError::RegisterInPredicate),
                    ast::Operand::Loc(name) => globals
                        .get(name)
                        .map(|i| CondOperand::Cell(Nml::Global(*i)))
                        .ok_or_else(|| MachineError::UnknownLocation {
                            name: name.clone(),
                            span: ctx.span(span),
                            src: ctx.named_source(),
                        }),
                }
            };
            Ok(Cond::Cmp {
                lhs: resolve(lhs)?,
                op: *op,
                rhs: resolve(rhs)?,
            })
        }
    }
}

/// Product construction for one process: control state × register
/// valuation. Returns the new automaton and, per old state, the list of
/// corresponding new states.
fn rff_process(
    machine: &Machine,
    pid: usize,
) -> Result<(Automaton, Vec<Vec<StateId>>), MachineError> {
    let regs = &machine.regs[pid];
    let old = &machine.automata[pid];
    if regs.is_empty() {
        return Ok((
            old.clone(),
            (0..old.states.len()).map(|s| vec![s]).collect(),
        ));
    }
    let mut domains = Vec::new();
    for reg in regs {
        let (lo, hi) = reg
            .domain
            .ok_or_else(|| MachineError::UnboundedRegister {
                name: reg.name.clone(),
            })?;
        domains.push((lo, hi));
    }
    let mut valuations: Vec<Vec<i64>> = vec![Vec::new()];
    for (lo, hi) in &domains {
        valuations = valuations
            .into_iter()
            .flat_map(|prefix| {
                (*lo..=*hi).map(move |v| {
                    let mut t = prefix.clone();
                    t.push(v);
                    t
                })
            })
            .collect();
    }
    let nvals = valuations.len();

    let mut aut = Automaton::default();
    let entry = aut.add_state();
    debug_assert_eq!(entry, 0);
    for _ in 0..old.states.len() * nvals {
        aut.add_state();
    }
    let new_state = |state: StateId, val: usize| -> StateId { 1 + state * nvals + val };

    // Initial register valuations fan out from the fresh entry state.
    for (vi, val) in valuations.iter().enumerate() {
        let matches_init = regs.iter().zip(val).all(|(reg, v)| match reg.init {
            InitValue::Wild => true,
            InitValue::Int(n) => n == *v,
        });
        if matches_init {
            aut.add_transition(entry, Instr::Nop, new_state(0, vi));
        }
    }

    let val_index: std::collections::HashMap<Vec<i64>, usize> = valuations
        .iter()
        .enumerate()
        .map(|(i, v)| (v.clone(), i))
        .collect();
    let in_domain =
        |val: &[i64]| -> bool { val.iter().zip(&domains).all(|(v, (lo, hi))| v >= lo && v <= hi) };

    for t in &old.transitions {
        for (vi, val) in valuations.iter().enumerate() {
            for (instr, val2) in concretize(&t.instr, val, &domains) {
                if !in_domain(&val2) {
                    continue;
                }
                let target = new_state(t.target, val_index[&val2]);
                aut.add_transition(new_state(t.source, vi), instr, target);
            }
        }
    }

    for (name, state) in &old.labels {
        aut.labels.insert(name.clone(), new_state(*state, 0));
    }

    let mut state_map: Vec<Vec<StateId>> = Vec::new();
    for s in 0..old.states.len() {
        let mut images: Vec<StateId> = (0..nvals).map(|vi| new_state(s, vi)).collect();
        if s == 0 {
            images.push(entry);
        }
        state_map.push(images);
    }
    Ok((aut, state_map))
}

/// Specialize one instruction to a concrete register valuation,
/// returning the possible (instruction, successor valuation) pairs.
fn concretize(instr: &Instr, val: &[i64], domains: &[(i64, i64)]) -> Vec<(Instr, Vec<i64>)> {
    match instr {
        Instr::Nop | Instr::Fence => vec![(instr.clone(), val.to_vec())],
        Instr::Update { .. } | Instr::Fetch { .. } | Instr::Wrllc { .. } | Instr::Evict { .. } => {
            vec![(instr.clone(), val.to_vec())]
        }
        Instr::RegAssign { reg, expr } => {
            let mut val2 = val.to_vec();
            val2[*reg] = expr.eval(val);
            vec![(Instr::Nop, val2)]
        }
        Instr::Assume { cond } => {
            if cond.eval(val, &|_| 0) {
                vec![(Instr::Nop, val.to_vec())]
            } else {
                Vec::new()
            }
        }
        Instr::ReadAssert { nml, expr } => vec![(
            Instr::ReadAssert {
                nml: *nml,
                expr: RExpr::Int(expr.eval(val)),
            },
            val.to_vec(),
        )],
        Instr::ReadAssign { reg, nml } => {
            let (lo, hi) = domains[*reg];
            (lo..=hi)
                .map(|v| {
                    let mut val2 = val.to_vec();
                    val2[*reg] = v;
                    (
                        Instr::ReadAssert {
                            nml: *nml,
                            expr: RExpr::Int(v),
                        },
                        val2,
                    )
                })
                .collect()
        }
        Instr::Write { nml, expr } => vec![(
            Instr::Write {
                nml: *nml,
                expr: RExpr::Int(expr.eval(val)),
            },
            val.to_vec(),
        )],
        Instr::SyncRead { body } => concretize(body, val, domains)
            .into_iter()
            .map(|(instr, v)| {
                (
                    Instr::SyncRead {
                        body: Box::new(instr),
                    },
                    v,
                )
            })
            .collect(),
        Instr::Locked { body, store_only } => {
            let mut variants: Vec<(Vec<Instr>, Vec<i64>)> = vec![(Vec::new(), val.to_vec())];
            for inner in body {
                let mut next = Vec::new();
                for (instrs, v) in &variants {
                    for (instr2, v2) in concretize(inner, v, domains) {
                        let mut instrs2 = instrs.clone();
                        // Register bookkeeping dissolved into control
                        // state; drop the nops inside the atomic block.
                        if instr2 != Instr::Nop {
                            instrs2.push(instr2);
                        }
                        next.push((instrs2, v2));
                    }
                }
                variants = next;
            }
            variants
                .into_iter()
                .map(|(instrs, v)| {
                    (
                        Instr::Locked {
                            body: instrs,
                            store_only: *store_only,
                        },
                        v,
                    )
                })
                .collect()
        }
    }
}
