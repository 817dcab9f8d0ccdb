//! An S-expression parser in nom
//!
//! The grammar is deliberately dumb: a program is a sequence of expressions,
//! and an expression is an integer, a boolean, a string, an identifier or a
//! parenthesized list of expressions. Special forms like `let` and `lambda`
//! are plain lists here; the preprocessor and the emitter recognize them by
//! shape.
//!
//! ```BNF
//! <program> → <expr>+
//! <expr>    → <integer> | <boolean> | <string> | <identifier>
//!           | '(' <expr>* ')'
//! ```
//!
//! Identifiers are any run of characters that isn't whitespace, a paren or a
//! double quote, as long as it doesn't start with a digit; that covers names
//! like `vector-set!`, `integer->char` and the operators `+` and `-`.
use crate::core::{Error, Expr};
use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while},
    character::complete::{char, digit1, multispace0 as space0, one_of, satisfy},
    combinator::{all_consuming, map, map_res, opt, recognize, value},
    multi::{many0, many1},
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};

fn program(i: &str) -> IResult<&str, Vec<Expr>> {
    terminated(many1(expr), space0)(i)
}

fn expr(i: &str) -> IResult<&str, Expr> {
    preceded(space0, alt((boolean, number, string, list, identifier)))(i)
}

fn list(i: &str) -> IResult<&str, Expr> {
    map(
        delimited(char('('), many0(expr), preceded(space0, char(')'))),
        Expr::list,
    )(i)
}

fn boolean(i: &str) -> IResult<&str, Expr> {
    map(alt((value(true, tag("#t")), value(false, tag("#f")))), Expr::Bool)(i)
}

fn number(i: &str) -> IResult<&str, Expr> {
    map_res(recognize(pair(opt(one_of("+-")), digit1)), |s: &str| {
        s.parse::<i32>().map(Expr::Int)
    })(i)
}

fn string(i: &str) -> IResult<&str, Expr> {
    map(delimited(char('"'), opt(is_not("\"")), char('"')), |s: Option<&str>| {
        Expr::string(s.unwrap_or(""))
    })(i)
}

fn identifier(i: &str) -> IResult<&str, Expr> {
    map(
        recognize(pair(
            satisfy(|c| is_symbol_char(c) && !c.is_ascii_digit()),
            take_while(is_symbol_char),
        )),
        Expr::ident,
    )(i)
}

fn is_symbol_char(c: char) -> bool {
    !c.is_whitespace() && c != '(' && c != ')' && c != '"'
}

/// Parse a whole translation unit
pub fn parse(i: &str) -> Result<Vec<Expr>, Error> {
    match all_consuming(program)(i) {
        Ok((_, forms)) => Ok(forms),
        Err(e) => Err(Error::Parser(format!("{:?}", e))),
    }
}

/// Parse a single expression for testing, return or panic
#[cfg(test)]
pub fn parse1(i: &str) -> Expr {
    match expr(i) {
        Ok((_rest, e)) => e,
        Err(e) => panic!("Failed to parse `{}`: {:?}", i, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    // OK consumes all of the input and succeeds
    fn ok<T>(t: T) -> IResult<&'static str, T> {
        Ok(("", t))
    }

    // Partial consumes some of the input and succeeds
    fn partial<'a, T>(rest: &'a str, t: T) -> IResult<&'a str, T> {
        Ok((rest, t))
    }

    #[test]
    fn atoms() {
        assert_eq!(ok(Expr::Int(42)), expr("42"));
        assert_eq!(ok(Expr::Int(-42)), expr("-42"));
        assert_eq!(ok(Expr::Int(42)), expr("+42"));
        assert_eq!(ok(Expr::Bool(true)), expr("#t"));
        assert_eq!(ok(Expr::Bool(false)), expr("#f"));
        assert_eq!(ok(Expr::Nil), expr("()"));
        assert_eq!(ok(Expr::string("hello world")), expr("\"hello world\""));
        assert_eq!(ok(Expr::string("")), expr("\"\""));
    }

    #[test]
    fn identifiers() {
        assert_eq!(ok(Expr::ident("x")), expr("x"));
        assert_eq!(ok(Expr::ident("+")), expr("+"));
        assert_eq!(ok(Expr::ident("-")), expr("-"));
        assert_eq!(ok(Expr::ident("zero?")), expr("zero?"));
        assert_eq!(ok(Expr::ident("vector-set!")), expr("vector-set!"));
        assert_eq!(ok(Expr::ident("integer->char")), expr("integer->char"));

        // identifiers split at delimiters and spaces
        assert_eq!(partial(" b", Expr::ident("a")), expr("a b"));
        assert_eq!(partial(")", Expr::ident("a")), expr("a)"));
    }

    #[test]
    fn lists() {
        assert_eq!(
            ok(Expr::List(vec![Expr::ident("+"), 1.into(), 2.into()])),
            expr("(+ 1 2)")
        );

        assert_eq!(
            ok(Expr::List(vec![
                Expr::ident("add1"),
                Expr::List(vec![Expr::ident("add1"), 42.into()]),
            ])),
            expr("(add1 (add1 42))")
        );

        // whitespace in between is thrown away
        assert_eq!(expr("(   +   1 )"), expr("(+ 1)"));
        assert_eq!(expr("(let\n  (x 1)\n  x)"), expr("(let (x 1) x)"));
    }

    #[test]
    fn nested_empty_lists() {
        assert_eq!(
            ok(Expr::List(vec![Expr::ident("null?"), Expr::Nil])),
            expr("(null? ())")
        );
    }

    #[test]
    fn programs() {
        assert_eq!(
            parse("(defun id (x) x) (id 42)").unwrap(),
            vec![
                Expr::List(vec![
                    Expr::ident("defun"),
                    Expr::ident("id"),
                    Expr::List(vec![Expr::ident("x")]),
                    Expr::ident("x"),
                ]),
                Expr::List(vec![Expr::ident("id"), 42.into()]),
            ]
        );

        assert!(parse("").is_err());
        assert!(parse("(+ 1").is_err());
        assert!(parse("(+ 1 2))").is_err());
    }
}
