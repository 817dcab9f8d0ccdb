//! Core types shared by most of the program
use colored::Colorize;
use std::fmt;

/// S-expression tree produced by the parser and consumed by every later
/// stage.
///
/// The parser knows nothing about special forms; `(let (x 1) x)` is just a
/// four element list here. The preprocessor and the emitter give shape to
/// lists by looking at their heads.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Expr {
    // The empty list `()`
    Nil,
    Bool(bool),
    // 30b number with a 2b tag
    Int(i32),
    Ident(String),
    Str(String),
    List(Vec<Expr>),
}

impl Expr {
    pub fn ident<S: Into<String>>(name: S) -> Self {
        Expr::Ident(name.into())
    }

    pub fn string<S: Into<String>>(s: S) -> Self {
        Expr::Str(s.into())
    }

    /// Build a list, collapsing the empty case to `Nil`
    pub fn list(elems: Vec<Expr>) -> Self {
        if elems.is_empty() {
            Expr::Nil
        } else {
            Expr::List(elems)
        }
    }

    /// Both `Nil` and an empty `List` denote the empty form; either is
    /// accepted wherever a list is expected.
    pub fn elems(&self) -> Option<&[Expr]> {
        match self {
            Expr::Nil => Some(&[]),
            Expr::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn is_ident(&self, name: &str) -> bool {
        matches!(self, Expr::Ident(s) if s == name)
    }

    pub fn as_ident(&self) -> Option<&str> {
        match self {
            Expr::Ident(s) => Some(s),
            _ => None,
        }
    }
}

impl From<i32> for Expr {
    fn from(i: i32) -> Self {
        Expr::Int(i)
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Bool(b)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Nil => write!(f, "()"),
            Expr::Bool(t) => write!(f, "{}", if *t { "#t" } else { "#f" }),
            Expr::Int(n) => write!(f, "{}", n),
            Expr::Ident(i) => write!(f, "{}", i),
            Expr::Str(s) => write!(f, "\"{}\"", s),
            Expr::List(l) => {
                write!(f, "(")?;
                let mut l = l.iter().peekable();
                while let Some(elem) = l.next() {
                    if l.peek().is_some() {
                        write!(f, "{} ", elem)?;
                    } else {
                        write!(f, "{}", elem)?;
                    }
                }
                write!(f, ")")
            }
        }
    }
}

/// Canonical top-level record consumed by the emitter
///
/// The preprocessor packages a whole translation unit into one of these:
/// `(<name> (<exports>) (<constants>) (<labels>) <body>…)`. The collections
/// keep insertion order so repeated compilations emit identical assembly.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Program {
    /// Entry symbol, derived from the input file stem
    pub name: String,
    /// User defined top level functions, `name ↦ (code args () body)`
    pub exports: Vec<(String, Expr)>,
    /// Data section constants, `sN ↦ (string-init "…")`
    pub constants: Vec<(String, Expr)>,
    /// Lifted lambda bodies, `fN ↦ (code args (fv…) body)`
    pub labels: Vec<(String, Expr)>,
    /// Residual expressions evaluated on entry
    pub body: Vec<Expr>,
}

impl Program {
    /// Render the program as the canonical S-expression record
    pub fn to_expr(&self) -> Expr {
        let pairs = |table: &[(String, Expr)]| {
            Expr::list(
                table
                    .iter()
                    .map(|(k, v)| Expr::List(vec![Expr::ident(k.clone()), v.clone()]))
                    .collect(),
            )
        };

        let mut record = vec![
            Expr::ident(self.name.clone()),
            pairs(&self.exports),
            pairs(&self.constants),
            pairs(&self.labels),
        ];
        record.extend(self.body.iter().cloned());

        Expr::List(record)
    }

    /// Read a canonical record back into a program; used by `--no-preprocess`
    pub fn from_expr(e: &Expr) -> Result<Self, Error> {
        let elems = e
            .elems()
            .ok_or_else(|| Error::Malformed(format!("program record is not a list: `{}`", e)))?;

        let [name, exports, constants, labels, body @ ..] = elems else {
            return Err(Error::Malformed(format!(
                "program record must have a name and 3 tables: `{}`",
                e
            )));
        };

        let name = name.as_ident().ok_or_else(|| {
            Error::Malformed(format!("program name is not an identifier: `{}`", name))
        })?;

        let table = |e: &Expr| -> Result<Vec<(String, Expr)>, Error> {
            let pairs = e
                .elems()
                .ok_or_else(|| Error::Malformed(format!("table is not a list: `{}`", e)))?;

            pairs
                .iter()
                .map(|pair| match pair.elems() {
                    Some([Expr::Ident(k), v]) => Ok((k.clone(), v.clone())),
                    _ => Err(Error::Malformed(format!("bad table entry: `{}`", pair))),
                })
                .collect()
        };

        Ok(Program {
            name: name.to_string(),
            exports: table(exports)?,
            constants: table(constants)?,
            labels: table(labels)?,
            body: body.to_vec(),
        })
    }
}

/// Control behavior and external interaction of the program.
pub struct Config {
    /// Path to the input source
    pub input: String,
    /// Path of the generated asm file
    pub output: String,
    /// Treat the input as an already canonical program record
    pub no_preprocess: bool,
}

/// Custom error type for all of lispc
#[derive(Debug)]
pub enum Error {
    /// Errors returned by nom, rendered to a message
    Parser(String),
    /// Wrong arity or shape of a known form
    Malformed(String),
    /// Identifier with no environment entry and no matching label
    Unbound(String),
    /// List head that is neither a builtin, a bound variable, nor a label
    Unsupported(String),
    /// Integer literal outside the 30-bit signed range
    Overflow(i32),
    /// Unexpected errors within the compiler
    Internal { message: String, e: Option<std::io::Error> },
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Internal { message: String::from(""), e: Some(error) }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Parser(e) => {
                writeln!(f, "{}\n", "Failed to parse program".red().bold())?;
                writeln!(f, "{}", e)
            }
            Self::Malformed(e) => {
                writeln!(f, "{}\n", "Malformed form".red().bold())?;
                writeln!(f, "{}", e)
            }
            Self::Unbound(name) => {
                writeln!(f, "{}\n", "Unbound variable".red().bold())?;
                writeln!(f, "`{}` is not defined", name)
            }
            Self::Unsupported(e) => {
                writeln!(f, "{}\n", "Unsupported operation".red().bold())?;
                writeln!(f, "{}", e)
            }
            Self::Overflow(n) => {
                writeln!(f, "{}\n", "Integer overflow".red().bold())?;
                writeln!(f, "`{}` does not fit in a 30-bit fixnum", n)
            }
            Self::Internal { message, e } => {
                writeln!(f, "{}\n", "Something went wrong!".red().bold())?;
                writeln!(f, "{}", message)?;
                writeln!(f, "{:?}", e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_list_collapses_to_nil() {
        assert_eq!(Expr::list(vec![]), Expr::Nil);
        assert_eq!(Expr::Nil.elems(), Some(&[][..]));
        assert_eq!(Expr::Int(1).elems(), None);
    }

    #[test]
    fn display() {
        let e = Expr::List(vec![Expr::ident("+"), 1.into(), Expr::List(vec![Expr::ident("f")])]);
        assert_eq!(e.to_string(), "(+ 1 (f))");
        assert_eq!(Expr::string("hi").to_string(), "\"hi\"");
    }

    #[test]
    fn program_round_trip() {
        let p = Program {
            name: "fact".to_string(),
            exports: vec![],
            constants: vec![(
                "s0".to_string(),
                Expr::List(vec![Expr::ident("string-init"), Expr::string("hi")]),
            )],
            labels: vec![(
                "f0".to_string(),
                Expr::List(vec![
                    Expr::ident("code"),
                    Expr::List(vec![Expr::ident("x")]),
                    Expr::Nil,
                    Expr::ident("x"),
                ]),
            )],
            body: vec![42.into()],
        };

        assert_eq!(Program::from_expr(&p.to_expr()).unwrap(), p);
    }

    #[test]
    fn program_record_shape_errors() {
        assert!(Program::from_expr(&Expr::Int(1)).is_err());
        assert!(Program::from_expr(&Expr::List(vec![Expr::ident("p")])).is_err());
    }
}
