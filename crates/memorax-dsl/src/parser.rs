// ParseError carries diagnostic spans and source fragments; boxing would
// lose the labeled-snippet rendering and complicate call sites.
#![allow(clippy::result_large_err)]

use pest::Parser;
use pest_derive::Parser;
use std::cell::RefCell;
use std::collections::HashSet;

use crate::ast::*;
use crate::errors::{ParseError, ParseErrors};

#[derive(Parser)]
#[grammar = "grammar.pest"]
struct RmmParser;

type Pair<'a> = pest::iterators::Pair<'a, Rule>;

fn span_from(pair: &Pair<'_>) -> Span {
    let s = pair.as_span();
    Span::new(s.start(), s.end())
}

/// Extract the next child from a pest iterator, returning a descriptive
/// error instead of panicking. Used throughout the post-parse AST-building
/// phase where the grammar guarantees structure but we prefer graceful
/// errors.
fn next_child<'a>(
    iter: &mut pest::iterators::Pairs<'a, Rule>,
    context: &str,
) -> Result<Pair<'a>, ParseError> {
    iter.next().ok_or_else(|| ParseError::MissingSection {
        section: format!("expected child in {context}"),
    })
}

/// Parse a `.rmm` source file into an AST [`Program`].
///
/// Semantic problems found while building the AST from a valid parse
/// tree (duplicate declarations, malformed literals, empty domains) are
/// recoverable: they are all collected and reported together.
///
/// # Parameters
/// - `source`: UTF-8 program source text.
/// - `filename`: Logical filename used in diagnostics.
pub fn parse(source: &str, filename: &str) -> Result<Program, ParseError> {
    let pairs = RmmParser::parse(Rule::program, source).map_err(|e| {
        let (start, end) = match e.location {
            pest::error::InputLocation::Pos(p) => (p, p + 1),
            pest::error::InputLocation::Span((s, e)) => (s, e),
        };
        ParseError::syntax(format!("{e}"), Span::new(start, end), source, filename)
    })?;

    let program_pair = pairs
        .into_iter()
        .next()
        .ok_or_else(|| ParseError::MissingSection {
            section: "program".into(),
        })?;

    let ctx = Ctx {
        errors: RefCell::new(Vec::new()),
    };
    let mut forbidden = Vec::new();
    let mut predicates = Vec::new();
    let mut globals: Vec<VarDecl> = Vec::new();
    let mut processes = Vec::new();

    for pair in program_pair.into_inner() {
        match pair.as_rule() {
            Rule::forbidden_clause => {
                for tuple in pair.into_inner() {
                    forbidden.push(parse_pc_tuple(tuple));
                }
            }
            Rule::predicates_clause => {
                for bexpr in pair.into_inner() {
                    let span = span_from(&bexpr);
                    predicates.push(Spanned::new(parse_bexpr(bexpr, &ctx)?, span));
                }
            }
            Rule::data_clause => {
                globals.extend(parse_data_clause(pair, &ctx)?);
            }
            Rule::process_decl => {
                processes.push(parse_process(pair, &ctx)?);
            }
            Rule::EOI => {}
            other => {
                return Err(ParseError::MissingSection {
                    section: format!("unexpected rule {other:?} at top level"),
                })
            }
        }
    }

    record_duplicates(globals.iter().map(|v| (&v.name, v.span)), &ctx);
    if processes.is_empty() {
        return Err(ParseError::MissingSection {
            section: "process".into(),
        });
    }

    let mut errors = ctx.errors.into_inner();
    if !errors.is_empty() {
        let err = if errors.len() == 1 {
            errors.swap_remove(0)
        } else {
            ParseError::MultipleErrors(ParseErrors { errors })
        };
        return Err(err.with_source_context(source, filename));
    }
    Ok(Program {
        forbidden,
        predicates,
        globals,
        processes,
    })
}

/// Shared state of the AST-building phase. Recoverable semantic errors
/// are recorded here with raw byte offsets; `parse` enriches them with
/// source context before reporting.
struct Ctx {
    errors: RefCell<Vec<ParseError>>,
}

impl Ctx {
    fn record(&self, err: ParseError) {
        self.errors.borrow_mut().push(err);
    }

    fn bare_source() -> miette::NamedSource<String> {
        miette::NamedSource::new("", String::new())
    }
}

fn record_duplicates<'a>(names: impl Iterator<Item = (&'a String, Span)>, ctx: &Ctx) {
    let mut seen = HashSet::new();
    for (name, span) in names {
        if !seen.insert(name.clone()) {
            ctx.record(ParseError::Duplicate {
                name: name.clone(),
                span: (span.start, span.end - span.start).into(),
                src: Ctx::bare_source(),
            });
        }
    }
}

fn parse_pc_tuple(pair: Pair<'_>) -> ForbiddenTuple {
    let labels = pair
        .into_inner()
        .map(|label| {
            let span = span_from(&label);
            Spanned::new(label.as_str().to_owned(), span)
        })
        .collect();
    ForbiddenTuple { labels }
}

fn parse_data_clause(pair: Pair<'_>, ctx: &Ctx) -> Result<Vec<VarDecl>, ParseError> {
    pair.into_inner().map(|decl| parse_decl(decl, ctx)).collect()
}

/// Shared shape of `var_decl` and `reg_decl`: name, initial value,
/// optional domain.
fn parse_decl(pair: Pair<'_>, ctx: &Ctx) -> Result<VarDecl, ParseError> {
    let span = span_from(&pair);
    let mut inner = pair.into_inner();
    let name_pair = next_child(&mut inner, "declaration")?;
    let name = match name_pair.as_rule() {
        Rule::reg => name_pair.as_str().trim_start_matches('$').to_owned(),
        _ => name_pair.as_str().to_owned(),
    };
    let init_pair = next_child(&mut inner, "declaration")?;
    let init_inner = init_pair
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::MissingSection {
            section: "initial value".into(),
        })?;
    let init = match init_inner.as_rule() {
        Rule::wild => InitValue::Wild,
        _ => InitValue::Int(parse_integer(&init_inner, ctx)),
    };
    let domain = match inner.next() {
        None => None,
        Some(dom) => {
            let dom_span = span_from(&dom);
            let mut bounds = dom.into_inner();
            let lo = parse_integer(&next_child(&mut bounds, "domain")?, ctx);
            let hi = parse_integer(&next_child(&mut bounds, "domain")?, ctx);
            if lo > hi {
                // Recoverable: record and carry on without a domain.
                ctx.record(ParseError::EmptyDomain {
                    lo,
                    hi,
                    span: (dom_span.start, dom_span.end - dom_span.start).into(),
                    src: Ctx::bare_source(),
                });
                None
            } else {
                Some((lo, hi))
            }
        }
    };
    Ok(VarDecl {
        name,
        init,
        domain,
        span,
    })
}

/// Recoverable: a malformed literal is recorded and read as zero so the
/// rest of the program can still be checked.
fn parse_integer(pair: &Pair<'_>, ctx: &Ctx) -> i64 {
    pair.as_str().parse::<i64>().unwrap_or_else(|_| {
        ctx.record(ParseError::InvalidInteger {
            literal: pair.as_str().to_owned(),
            span: (span_from(pair).start, pair.as_str().len()).into(),
            src: Ctx::bare_source(),
        });
        0
    })
}

fn parse_process(pair: Pair<'_>, ctx: &Ctx) -> Result<ProcessDecl, ParseError> {
    let mut locals = Vec::new();
    let mut registers = Vec::new();
    let mut body = Vec::new();
    for section in pair.into_inner() {
        match section.as_rule() {
            Rule::data_clause => locals = parse_data_clause(section, ctx)?,
            Rule::registers_clause => {
                registers = section
                    .into_inner()
                    .map(|decl| parse_decl(decl, ctx))
                    .collect::<Result<_, _>>()?;
            }
            Rule::stmt_seq => body = parse_stmt_seq(section, ctx)?,
            other => {
                return Err(ParseError::MissingSection {
                    section: format!("unexpected rule {other:?} in process"),
                })
            }
        }
    }
    record_duplicates(locals.iter().map(|v| (&v.name, v.span)), ctx);
    record_duplicates(registers.iter().map(|v| (&v.name, v.span)), ctx);
    Ok(ProcessDecl {
        locals,
        registers,
        body,
    })
}

fn parse_stmt_seq(pair: Pair<'_>, ctx: &Ctx) -> Result<Vec<LabeledStmt>, ParseError> {
    pair.into_inner()
        .map(|labeled| parse_labeled_stmt(labeled, ctx))
        .collect()
}

fn parse_labeled_stmt(pair: Pair<'_>, ctx: &Ctx) -> Result<LabeledStmt, ParseError> {
    let mut labels = Vec::new();
    let mut stmt = None;
    for part in pair.into_inner() {
        match part.as_rule() {
            Rule::label_def => {
                let ident = part
                    .into_inner()
                    .next()
                    .ok_or_else(|| ParseError::MissingSection {
                        section: "label".into(),
                    })?;
                let span = span_from(&ident);
                labels.push(Spanned::new(ident.as_str().to_owned(), span));
            }
            Rule::stmt => {
                let span = span_from(&part);
                stmt = Some(Spanned::new(parse_stmt(part, ctx)?, span));
            }
            other => {
                return Err(ParseError::MissingSection {
                    section: format!("unexpected rule {other:?} in statement"),
                })
            }
        }
    }
    let stmt = stmt.ok_or_else(|| ParseError::MissingSection {
        section: "statement".into(),
    })?;
    Ok(LabeledStmt { labels, stmt })
}

fn parse_stmt(pair: Pair<'_>, ctx: &Ctx) -> Result<Stmt, ParseError> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::MissingSection {
            section: "statement".into(),
        })?;
    match inner.as_rule() {
        Rule::nop_stmt => Ok(Stmt::Nop),
        Rule::fence_stmt => Ok(Stmt::Fence),
        Rule::read_assign => {
            let mut parts = inner.into_inner();
            let reg = spanned_reg(&next_child(&mut parts, "read")?);
            let loc = spanned_ident(&next_child(&mut parts, "read")?);
            Ok(Stmt::ReadAssign { reg, loc })
        }
        Rule::read_assert => {
            let mut parts = inner.into_inner();
            let loc = spanned_ident(&next_child(&mut parts, "read")?);
            let expr = parse_expr(next_child(&mut parts, "read")?, ctx)?;
            Ok(Stmt::ReadAssert { loc, expr })
        }
        Rule::syncrd_stmt => {
            let read = inner
                .into_inner()
                .next()
                .ok_or_else(|| ParseError::MissingSection {
                    section: "synchronized read".into(),
                })?;
            let body = match read.as_rule() {
                Rule::syncrd_assign => {
                    let mut parts = read.into_inner();
                    let reg = spanned_reg(&next_child(&mut parts, "syncrd")?);
                    let loc = spanned_ident(&next_child(&mut parts, "syncrd")?);
                    Stmt::ReadAssign { reg, loc }
                }
                _ => {
                    let mut parts = read.into_inner();
                    let loc = spanned_ident(&next_child(&mut parts, "syncrd")?);
                    let expr = parse_expr(next_child(&mut parts, "syncrd")?, ctx)?;
                    Stmt::ReadAssert { loc, expr }
                }
            };
            Ok(Stmt::SyncRead {
                body: Box::new(body),
            })
        }
        Rule::write_stmt => parse_write(inner, ctx),
        Rule::locked_stmt => {
            let body_pair = inner
                .into_inner()
                .next()
                .ok_or_else(|| ParseError::MissingSection {
                    section: "locked body".into(),
                })?;
            let body = match body_pair.as_rule() {
                Rule::write_stmt => {
                    let span = span_from(&body_pair);
                    vec![Spanned::new(parse_write(body_pair, ctx)?, span)]
                }
                _ => body_pair
                    .into_inner()
                    .map(|s| {
                        let span = span_from(&s);
                        parse_stmt(s, ctx).map(|stmt| Spanned::new(stmt, span))
                    })
                    .collect::<Result<_, _>>()?,
            };
            Ok(Stmt::Locked {
                body,
                store_only: false,
            })
        }
        Rule::slocked_stmt => {
            let write = inner
                .into_inner()
                .next()
                .ok_or_else(|| ParseError::MissingSection {
                    section: "slocked write".into(),
                })?;
            let span = span_from(&write);
            Ok(Stmt::Locked {
                body: vec![Spanned::new(parse_write(write, ctx)?, span)],
                store_only: true,
            })
        }
        Rule::assume_stmt => {
            let cond = inner
                .into_inner()
                .next()
                .ok_or_else(|| ParseError::MissingSection {
                    section: "assume condition".into(),
                })?;
            Ok(Stmt::Assume {
                cond: parse_bexpr(cond, ctx)?,
            })
        }
        Rule::goto_stmt => {
            let label = inner
                .into_inner()
                .next()
                .ok_or_else(|| ParseError::MissingSection {
                    section: "goto target".into(),
                })?;
            Ok(Stmt::Goto {
                label: spanned_ident(&label),
            })
        }
        Rule::either_stmt => {
            let branches = inner
                .into_inner()
                .map(|seq| parse_stmt_seq(seq, ctx))
                .collect::<Result<_, _>>()?;
            Ok(Stmt::Either { branches })
        }
        Rule::reg_assign => {
            let mut parts = inner.into_inner();
            let reg = spanned_reg(&next_child(&mut parts, "assignment")?);
            let expr = parse_expr(next_child(&mut parts, "assignment")?, ctx)?;
            Ok(Stmt::RegAssign { reg, expr })
        }
        other => Err(ParseError::MissingSection {
            section: format!("unexpected statement rule {other:?}"),
        }),
    }
}

fn parse_write(pair: Pair<'_>, ctx: &Ctx) -> Result<Stmt, ParseError> {
    let mut parts = pair.into_inner();
    let loc = spanned_ident(&next_child(&mut parts, "write")?);
    let expr = parse_expr(next_child(&mut parts, "write")?, ctx)?;
    Ok(Stmt::Write { loc, expr })
}

fn spanned_ident(pair: &Pair<'_>) -> Spanned<String> {
    Spanned::new(pair.as_str().to_owned(), span_from(pair))
}

fn spanned_reg(pair: &Pair<'_>) -> Spanned<String> {
    Spanned::new(
        pair.as_str().trim_start_matches('$').to_owned(),
        span_from(pair),
    )
}

fn parse_expr(pair: Pair<'_>, ctx: &Ctx) -> Result<Expr, ParseError> {
    let mut inner = pair.into_inner();
    let mut acc = parse_term(next_child(&mut inner, "expression")?, ctx)?;
    while let Some(op) = inner.next() {
        let rhs = parse_term(next_child(&mut inner, "expression")?, ctx)?;
        let op = match op.as_str() {
            "+" => ArithOp::Add,
            _ => ArithOp::Sub,
        };
        acc = Expr::BinOp(Box::new(acc), op, Box::new(rhs));
    }
    Ok(acc)
}

fn parse_term(pair: Pair<'_>, ctx: &Ctx) -> Result<Expr, ParseError> {
    let mut inner = pair.into_inner();
    let mut acc = parse_factor(next_child(&mut inner, "term")?, ctx)?;
    while let Some(op) = inner.next() {
        debug_assert_eq!(op.as_rule(), Rule::mul_op);
        let rhs = parse_factor(next_child(&mut inner, "term")?, ctx)?;
        acc = Expr::BinOp(Box::new(acc), ArithOp::Mul, Box::new(rhs));
    }
    Ok(acc)
}

fn parse_factor(pair: Pair<'_>, ctx: &Ctx) -> Result<Expr, ParseError> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::MissingSection {
            section: "factor".into(),
        })?;
    match inner.as_rule() {
        Rule::integer => Ok(Expr::Int(parse_integer(&inner, ctx))),
        Rule::reg => Ok(Expr::Reg(inner.as_str().trim_start_matches('$').to_owned())),
        Rule::expr => parse_expr(inner, ctx),
        other => Err(ParseError::MissingSection {
            section: format!("unexpected factor rule {other:?}"),
        }),
    }
}

fn parse_bexpr(pair: Pair<'_>, ctx: &Ctx) -> Result<BExpr, ParseError> {
    let mut inner = pair.into_inner();
    let mut acc = parse_bterm(next_child(&mut inner, "condition")?, ctx)?;
    for rhs in inner {
        let rhs = parse_bterm(rhs, ctx)?;
        acc = BExpr::And(Box::new(acc), Box::new(rhs));
    }
    Ok(acc)
}

fn parse_bterm(pair: Pair<'_>, ctx: &Ctx) -> Result<BExpr, ParseError> {
    let inner = pair
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::MissingSection {
            section: "condition".into(),
        })?;
    match inner.as_rule() {
        Rule::btrue => Ok(BExpr::True),
        Rule::bfalse => Ok(BExpr::False),
        Rule::bexpr => parse_bexpr(inner, ctx),
        Rule::comparison => {
            let mut parts = inner.into_inner();
            let lhs = parse_operand(&next_child(&mut parts, "comparison")?, ctx)?;
            let op = match next_child(&mut parts, "comparison")?.as_str() {
                "=" => CmpOp::Eq,
                "!=" => CmpOp::Ne,
                "<" => CmpOp::Lt,
                "<=" => CmpOp::Le,
                ">" => CmpOp::Gt,
                _ => CmpOp::Ge,
            };
            let rhs = parse_operand(&next_child(&mut parts, "comparison")?, ctx)?;
            Ok(BExpr::Cmp { lhs, op, rhs })
        }
        other => Err(ParseError::MissingSection {
            section: format!("unexpected condition rule {other:?}"),
        }),
    }
}

fn parse_operand(pair: &Pair<'_>, ctx: &Ctx) -> Result<Operand, ParseError> {
    let inner = pair
        .clone()
        .into_inner()
        .next()
        .ok_or_else(|| ParseError::MissingSection {
            section: "operand".into(),
        })?;
    match inner.as_rule() {
        Rule::integer => Ok(Operand::Int(parse_integer(&inner, ctx))),
        Rule::reg => Ok(Operand::Reg(
            inner.as_str().trim_start_matches('$').to_owned(),
        )),
        _ => Ok(Operand::Loc(inner.as_str().to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEKKER: &str = r#"
forbidden CS CS

data
  x = 0 : [0:1]
  y = 0 : [0:1]

process
text
  L0: write: x := 1;
  L1: read: y = 0;
  CS: nop;
  goto L0

process
text
  M0: write: y := 1;
  M1: read: x = 0;
  CS: nop;
  goto M0
"#;

    #[test]
    fn parse_dekker() {
        let program = parse(DEKKER, "dekker.rmm").expect("parse failed");
        assert_eq!(program.forbidden.len(), 1);
        assert_eq!(program.forbidden[0].labels.len(), 2);
        assert_eq!(program.globals.len(), 2);
        assert_eq!(program.processes.len(), 2);
        assert_eq!(program.processes[0].body.len(), 4);
        assert_eq!(program.processes[0].body[0].labels[0].node, "L0");
    }

    #[test]
    fn parse_registers_and_arith() {
        let src = r#"
forbidden END

data
  x = *

process
registers
  $r = 0 : [0:3]
text
  $r := $r + 1;
  write: x := $r;
  END: nop
"#;
        let program = parse(src, "t.rmm").expect("parse failed");
        let p = &program.processes[0];
        assert_eq!(p.registers.len(), 1);
        assert!(matches!(
            p.body[0].stmt.node,
            Stmt::RegAssign { ref reg, .. } if reg.node == "r"
        ));
        assert!(matches!(program.globals[0].init, InitValue::Wild));
    }

    #[test]
    fn parse_locked_and_either() {
        let src = r#"
forbidden BAD *

data
  m = 0

process
text
  A: locked { read: m = 0; write: m := 1 };
  either {
    BAD: nop
  or
    goto A
  }

process
text
  locked write: m := 0;
  fence;
  nop
"#;
        let program = parse(src, "t.rmm").expect("parse failed");
        assert_eq!(program.forbidden[0].labels[1].node, "*");
        let p0 = &program.processes[0];
        match &p0.body[0].stmt.node {
            Stmt::Locked { body, store_only } => {
                assert_eq!(body.len(), 2);
                assert!(!store_only);
            }
            other => panic!("expected locked block, got {other:?}"),
        }
        match &p0.body[1].stmt.node {
            Stmt::Either { branches } => assert_eq!(branches.len(), 2),
            other => panic!("expected either, got {other:?}"),
        }
    }

    #[test]
    fn parse_predicates_clause() {
        let src = r#"
forbidden END

predicates
  x = 1 ; y = 0

data
  x = 0
  y = 0

process
text
  END: nop
"#;
        let program = parse(src, "t.rmm").expect("parse failed");
        assert_eq!(program.predicates.len(), 2);
    }

    #[test]
    fn duplicate_global_is_rejected() {
        let src = "forbidden A\ndata\n x = 0\n x = 1\nprocess\ntext\n A: nop";
        let err = parse(src, "t.rmm").unwrap_err();
        assert!(matches!(err, ParseError::Duplicate { .. }));
    }

    #[test]
    fn semantic_errors_are_collected_together() {
        // One duplicate global, one duplicate register and an empty
        // domain: all three are reported in a single pass.
        let src = "forbidden A\ndata\n x = 0\n x = 1 : [3:1]\nprocess\nregisters\n $r = 0\n $r = 1\ntext\n A: nop";
        let err = parse(src, "t.rmm").unwrap_err();
        match err {
            ParseError::MultipleErrors(errs) => {
                assert_eq!(errs.errors.len(), 3, "collected: {errs:?}");
                let msg = errs.to_string();
                assert!(msg.starts_with("3 parse errors:"), "message: {msg}");
                assert!(msg.contains("Duplicate declaration: x"));
                assert!(msg.contains("Duplicate declaration: r"));
                assert!(msg.contains("Empty domain [3:1]"));
            }
            other => panic!("expected MultipleErrors, got {other:?}"),
        }
    }

    #[test]
    fn parse_syncrd_read() {
        let src = "forbidden A\ndata\n x = 0\nprocess\nregisters\n $r = 0\ntext\n A: syncrd: x = 1;\n syncrd: $r := x";
        let program = parse(src, "t.rmm").expect("parse failed");
        let body = &program.processes[0].body;
        match &body[0].stmt.node {
            Stmt::SyncRead { body } => {
                assert!(matches!(**body, Stmt::ReadAssert { ref loc, .. } if loc.node == "x"));
            }
            other => panic!("expected syncrd assert, got {other:?}"),
        }
        match &body[1].stmt.node {
            Stmt::SyncRead { body } => {
                assert!(matches!(**body, Stmt::ReadAssign { ref reg, .. } if reg.node == "r"));
            }
            other => panic!("expected syncrd assign, got {other:?}"),
        }
    }

    #[test]
    fn syntax_error_carries_position() {
        let err = parse("forbidden", "t.rmm").unwrap_err();
        assert!(matches!(err, ParseError::Syntax { .. }));
    }

    #[test]
    fn empty_domain_is_rejected() {
        let src = "forbidden A\ndata\n x = 0 : [2:1]\nprocess\ntext\n A: nop";
        let err = parse(src, "t.rmm").unwrap_err();
        assert!(matches!(err, ParseError::EmptyDomain { lo: 2, hi: 1, .. }));
    }
}
