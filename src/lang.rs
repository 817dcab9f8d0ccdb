//! Surface-to-canonical transformations
//!
//! Home for free-variable analysis, closure conversion and everything else
//! that runs between the parser and the code generator. Each pass takes a
//! tree and produces a new tree; nothing here mutates in place.
//!
//! The passes run in this order:
//!
//! 1. [`annotate`] rewrites `(lambda args body)` into
//!    `(lambda args (fv…) body)` where `fv…` are the identifiers the body
//!    captures from the enclosing scope.
//! 2. [`strings`] replaces every string literal with a `(string-ref sN)`
//!    reference and collects `sN ↦ (string-init "…")` constants.
//! 3. [`lift`] replaces every annotated lambda with `(closure fN fv…)` and
//!    collects `fN ↦ (code args (fv…) body)` blocks, innermost first.
//! 4. [`defuns`] peels `(defun name args body)` forms off the top level
//!    into the exports table.
//!
//! [`preprocess`] chains the passes and packages the result into the
//! canonical [`Program`] record.

use crate::core::{Error, Expr, Program};
use std::collections::HashSet;

/// Names the compiler gives meaning to.
///
/// References to these are never captured as free variables, and the
/// emitter dispatches on them before looking at the environment.
pub const BUILTINS: [&str; 25] = [
    "progn",
    "let",
    "if",
    "labels",
    "code",
    "labelcall",
    "funcall",
    "closure",
    "lambda",
    "defun",
    "string-ref",
    "string-init",
    "add1",
    "+",
    "-",
    "zero?",
    "null?",
    "cons",
    "car",
    "cdr",
    "make-vector",
    "vector-ref",
    "vector-set!",
    "integer->char",
    "char->integer",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name)
}

/// Annotate every lambda in the tree with its free variables
///
/// `(lambda (x) (f x 1))` becomes `(lambda (x) (f) (f x 1))`. The set is
/// computed over the raw body before nested lambdas are rewritten, so an
/// outer lambda also captures whatever its inner lambdas leave free after
/// removing only the outer parameters.
pub fn annotate(e: &Expr) -> Result<Expr, Error> {
    let Some(elems) = e.elems() else {
        return Ok(e.clone());
    };

    if elems.is_empty() {
        return Ok(e.clone());
    }

    if elems[0].is_ident("lambda") {
        let [_, args, body] = elems else {
            return Err(Error::Malformed(format!(
                "lambda form must have parameters and a body: `{}`",
                e
            )));
        };

        let params = params_of(args)?;
        let free = free_variables(body, &params);
        let body = annotate(body)?;

        return Ok(Expr::List(vec![
            Expr::ident("lambda"),
            args.clone(),
            Expr::list(free.into_iter().map(Expr::ident).collect()),
            body,
        ]));
    }

    let elems = elems.iter().map(annotate).collect::<Result<Vec<_>, _>>()?;
    Ok(Expr::List(elems))
}

/// Identifiers used in `e` that are neither parameters nor builtins
///
/// First occurrence order, deduplicated. Callers that care about the
/// contents and not the order should compare as sets.
pub fn free_variables(e: &Expr, params: &HashSet<&str>) -> Vec<String> {
    fn gather(e: &Expr, params: &HashSet<&str>, seen: &mut HashSet<String>, free: &mut Vec<String>) {
        match e {
            Expr::Ident(v) => {
                if is_builtin(v) || params.contains(v.as_str()) || seen.contains(v) {
                    return;
                }
                seen.insert(v.clone());
                free.push(v.clone());
            }
            Expr::List(elems) => {
                for elem in elems {
                    gather(elem, params, seen, free);
                }
            }
            _ => {}
        }
    }

    let mut seen = HashSet::new();
    let mut free = Vec::new();
    gather(e, params, &mut seen, &mut free);
    free
}

fn params_of(args: &Expr) -> Result<HashSet<&str>, Error> {
    let elems = args
        .elems()
        .ok_or_else(|| Error::Malformed(format!("lambda parameters must be a list: `{}`", args)))?;

    elems
        .iter()
        .map(|p| {
            p.as_ident().ok_or_else(|| {
                Error::Malformed(format!("lambda parameter is not an identifier: `{}`", p))
            })
        })
        .collect()
}

/// Replace string literals with references into the constants table
///
/// The counter is shared across the whole translation unit, so every
/// occurrence gets a unique label even when the text repeats.
pub fn strings(e: &Expr, counter: &mut usize, constants: &mut Vec<(String, Expr)>) -> Expr {
    match e {
        Expr::Str(s) => {
            let label = format!("s{}", *counter);
            *counter += 1;

            constants.push((
                label.clone(),
                Expr::List(vec![Expr::ident("string-init"), Expr::Str(s.clone())]),
            ));

            Expr::List(vec![Expr::ident("string-ref"), Expr::ident(label)])
        }
        Expr::List(elems) => {
            Expr::List(elems.iter().map(|e| strings(e, counter, constants)).collect())
        }
        _ => e.clone(),
    }
}

/// Lift annotated lambdas into named code blocks
///
/// `(lambda (x) () body)` becomes `(closure f0)` with
/// `f0 ↦ (code (x) () body)` added to the labels table. Bodies are lifted
/// before their enclosing lambda, so inner lambdas get the lower numbers.
pub fn lift(
    e: &Expr,
    counter: &mut usize,
    labels: &mut Vec<(String, Expr)>,
) -> Result<Expr, Error> {
    let Some(elems) = e.elems() else {
        return Ok(e.clone());
    };

    if elems.is_empty() {
        return Ok(e.clone());
    }

    if elems[0].is_ident("lambda") {
        let [_, args, free, body] = elems else {
            return Err(Error::Malformed(format!("lambda form is missing its free variables: `{}`", e)));
        };

        let freevars = free.elems().ok_or_else(|| {
            Error::Malformed(format!("lambda free variables must be a list: `{}`", free))
        })?;

        let body = lift(body, counter, labels)?;

        let label = format!("f{}", *counter);
        *counter += 1;

        let mut closure = vec![Expr::ident("closure"), Expr::ident(label.clone())];
        closure.extend(freevars.iter().cloned());

        labels.push((
            label,
            Expr::List(vec![Expr::ident("code"), args.clone(), free.clone(), body]),
        ));

        return Ok(Expr::List(closure));
    }

    let elems =
        elems.iter().map(|e| lift(e, counter, labels)).collect::<Result<Vec<_>, _>>()?;
    Ok(Expr::List(elems))
}

/// Extract `(defun name args body)` forms into the exports table
///
/// The residual sequence keeps the remaining forms in source order.
pub fn defuns(forms: Vec<Expr>, exports: &mut Vec<(String, Expr)>) -> Result<Vec<Expr>, Error> {
    let mut residual = Vec::new();

    for form in forms {
        match form.elems() {
            Some([head, rest @ ..]) if head.is_ident("defun") => {
                let [name, args, body] = rest else {
                    return Err(Error::Malformed(format!(
                        "defun form must have a name, parameters and a body: `{}`",
                        form
                    )));
                };

                let name = name.as_ident().ok_or_else(|| {
                    Error::Malformed(format!("defun name is not an identifier: `{}`", name))
                })?;

                if args.elems().is_none() {
                    return Err(Error::Malformed(format!(
                        "defun parameters must be a list: `{}`",
                        args
                    )));
                }

                exports.push((
                    name.to_string(),
                    Expr::List(vec![
                        Expr::ident("code"),
                        args.clone(),
                        Expr::Nil,
                        body.clone(),
                    ]),
                ));
            }
            _ => residual.push(form),
        }
    }

    Ok(residual)
}

/// Run the whole preprocessor over a parsed translation unit
pub fn preprocess(forms: Vec<Expr>, name: &str) -> Result<Program, Error> {
    let forms = forms.iter().map(annotate).collect::<Result<Vec<_>, _>>()?;

    let mut constants = Vec::new();
    let mut counter = 0;
    let forms: Vec<Expr> =
        forms.iter().map(|e| strings(e, &mut counter, &mut constants)).collect();

    let mut labels = Vec::new();
    let mut counter = 0;
    let forms = forms
        .iter()
        .map(|e| lift(e, &mut counter, &mut labels))
        .collect::<Result<Vec<_>, _>>()?;

    let mut exports = Vec::new();
    let body = defuns(forms, &mut exports)?;

    Ok(Program { name: name.to_string(), exports, constants, labels, body })
}
