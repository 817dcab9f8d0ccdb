//! Primitive operators lowered inline by the compiler
//!
//! These are the operations the emitter compiles to a fixed instruction
//! sequence instead of a call. Binary arithmetic runs directly on the
//! tag-shifted representation; the fixnum shift is chosen so `addl`/`subl`
//! of two encoded values is already the encoded result.
use crate::{
    compiler::{emit::eval, state::State},
    core::{Error, Expr},
    immediate,
    x86::{self, Ins, Reference, Register::*, ASM, WORDSIZE},
};

/// Look up a primitive by name and emit it
///
/// Returns `None` for names this table doesn't know, so the caller can keep
/// dispatching.
pub fn call(s: &mut State, name: &str, args: &[Expr]) -> Option<Result<ASM, Error>> {
    match name {
        "add1" => Some(add1(s, args)),
        "+" => Some(plus(s, args)),
        "-" => Some(minus(s, args)),
        "zero?" => Some(zerop(s, args)),
        "null?" => Some(nullp(s, args)),
        "integer->char" => Some(integer_to_char(s, args)),
        "char->integer" => Some(char_to_integer(s, args)),
        "cons" => Some(cons(s, args)),
        "car" => Some(car(s, args)),
        "cdr" => Some(cdr(s, args)),
        "make-vector" => Some(make_vector(s, args)),
        "vector-ref" => Some(vector_ref(s, args)),
        "vector-set!" => Some(vector_set(s, args)),
        _ => None,
    }
}

fn arity(name: &str, expected: usize, args: &[Expr]) -> Error {
    Error::Malformed(format!("{} takes {} argument(s), got {}", name, expected, args.len()))
}

// Unary primitives

/// Increment by 1, folded into a single add of the encoded value
fn add1(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [x] = args else { return Err(arity("add1", 1, args)) };

    Ok(eval(s, x)? + x86::add(EAX.into(), immediate::n(1).into()))
}

/// Materialize the zero flag as an encoded boolean
//
// `sete` writes the low byte only, so the accumulator is zeroed first; the
// shift and or turn 0/1 into the boolean encoding.
fn boolify() -> ASM {
    ASM::from(x86::mov(EAX.into(), 0.into()))
        + Ins::from("sete %al")
        + x86::sal(EAX.into(), 7)
        + x86::or(EAX.into(), Reference::Hex(immediate::BOOL_TAG))
}

fn zerop(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [x] = args else { return Err(arity("zero?", 1, args)) };

    Ok(eval(s, x)? + x86::cmp(EAX.into(), 0.into()) + boolify())
}

fn nullp(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [x] = args else { return Err(arity("null?", 1, args)) };

    Ok(eval(s, x)? + x86::cmp(EAX.into(), Reference::Hex(immediate::NIL)) + boolify())
}

/// A character is a fixnum shifted 6 further with the char tag in the gap
fn integer_to_char(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [x] = args else { return Err(arity("integer->char", 1, args)) };

    Ok(eval(s, x)?
        + x86::sal(EAX.into(), immediate::CHAR_SHIFT - immediate::FIXNUM_SHIFT)
        + x86::or(EAX.into(), Reference::Hex(immediate::CHAR_TAG)))
}

fn char_to_integer(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [x] = args else { return Err(arity("char->integer", 1, args)) };

    Ok(eval(s, x)? + x86::sar(EAX.into(), immediate::CHAR_SHIFT - immediate::FIXNUM_SHIFT))
}

// Binary primitives

fn plus(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [x, y] = args else { return Err(arity("+", 2, args)) };

    let mut asm = eval(s, y)?;
    let slot = s.alloc();
    asm += x86::save(EAX.into(), slot);
    asm += eval(s, x)?;
    s.dealloc(1);
    asm += x86::add(EAX.into(), (ESP + s.si).into());

    Ok(asm)
}

/// Subtract `y` from `x`
//
// The subtrahend is evaluated and pushed first, then the minuend; swapping
// the order flips the sign.
fn minus(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [x, y] = args else { return Err(arity("-", 2, args)) };

    let mut asm = eval(s, y)?;
    let slot = s.alloc();
    asm += x86::save(EAX.into(), slot);
    asm += eval(s, x)?;
    s.dealloc(1);
    asm += x86::sub(EAX.into(), (ESP + s.si).into());

    Ok(asm)
}

// Allocation primitives

/// Allocate a pair on the heap
///
/// Car at the allocation pointer, cdr one word up; the result is the pointer
/// with the pair tag, and the pointer advances a full object (8 bytes).
fn cons(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [x, y] = args else { return Err(arity("cons", 2, args)) };

    Ok(eval(s, x)?
        + x86::mov((ESI + 0).into(), EAX.into())
        + eval(s, y)?
        + x86::mov((ESI + WORDSIZE).into(), EAX.into())
        + x86::mov(EAX.into(), ESI.into())
        + x86::or(EAX.into(), immediate::PAIR_TAG.into())
        + x86::add(ESI.into(), (2 * WORDSIZE).into()))
}

/// First half of a pair
//
// Subtracting the tag from the pointer gets the real address back.
fn car(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [pair] = args else { return Err(arity("car", 1, args)) };

    Ok(eval(s, pair)? + x86::mov(EAX.into(), (EAX + -immediate::PAIR_TAG).into()))
}

/// Second half of a pair, one word past the car
fn cdr(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [pair] = args else { return Err(arity("cdr", 1, args)) };

    Ok(eval(s, pair)? + x86::mov(EAX.into(), (EAX + (WORDSIZE - immediate::PAIR_TAG)).into()))
}

/// Allocate a vector with the encoded length in its header word
fn make_vector(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [len] = args else { return Err(arity("make-vector", 1, args)) };

    Ok(eval(s, len)?
        + x86::mov((ESI + 0).into(), EAX.into())
        // the encoded length doubles as the payload size in bytes
        + x86::mov(EBX.into(), EAX.into())
        + x86::mov(EAX.into(), ESI.into())
        + x86::or(EAX.into(), immediate::VECTOR_TAG.into())
        + x86::add(EBX.into(), 11.into())
        + x86::and(EBX.into(), (-8).into())
        + x86::add(ESI.into(), EBX.into()))
}

fn vector_ref(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [vector, idx] = args else { return Err(arity("vector-ref", 2, args)) };

    let mut asm = eval(s, vector)?;
    let vector_slot = s.alloc();
    asm += x86::save(EAX.into(), vector_slot);

    asm += eval(s, idx)?;
    asm += x86::add(EAX.into(), 1.into());
    asm += x86::mov(EBX.into(), (ESP + vector_slot).into());
    asm += x86::add(EAX.into(), EBX.into());
    asm += x86::mov(EAX.into(), (EAX + 0).into());

    Ok(asm)
}

fn vector_set(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
    let [vector, idx, obj] = args else { return Err(arity("vector-set!", 3, args)) };

    let mut asm = eval(s, vector)?;
    let vector_slot = s.alloc();
    asm += x86::save(EAX.into(), vector_slot);

    asm += eval(s, idx)?;
    let idx_slot = s.alloc();
    asm += x86::save(EAX.into(), idx_slot);

    asm += eval(s, obj)?;

    // compute the destination slot and store through it
    asm += x86::mov(EBX.into(), (ESP + idx_slot).into());
    asm += x86::add(EBX.into(), 1.into());
    asm += x86::add(EBX.into(), (ESP + vector_slot).into());
    asm += x86::mov((EBX + 0).into(), EAX.into());

    // the vector itself is the result
    asm += x86::mov(EAX.into(), (ESP + vector_slot).into());

    Ok(asm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse1;
    use pretty_assertions::assert_eq;

    fn compile1(prog: &str) -> Vec<String> {
        let mut s: State = Default::default();
        let asm = eval(&mut s, &parse1(prog)).unwrap();
        asm.to_string().lines().map(|l| l.trim().to_string()).collect()
    }

    #[test]
    fn add1() {
        assert_eq!(compile1("(add1 42)"), ["movl $168, %eax", "addl $4, %eax"]);
    }

    #[test]
    fn plus() {
        // the right operand is evaluated first and parked on the stack
        assert_eq!(
            compile1("(+ 13 87)"),
            [
                "movl $348, %eax",
                "movl %eax, -4(%esp)",
                "movl $52, %eax",
                "addl -4(%esp), %eax",
            ]
        );
    }

    #[test]
    fn minus() {
        // the subtrahend goes to the stack, the minuend stays in %eax
        assert_eq!(
            compile1("(- 10 3)"),
            [
                "movl $12, %eax",
                "movl %eax, -4(%esp)",
                "movl $40, %eax",
                "subl -4(%esp), %eax",
            ]
        );
    }

    #[test]
    fn zerop() {
        assert_eq!(
            compile1("(zero? 41)"),
            [
                "movl $164, %eax",
                "cmpl $0, %eax",
                "movl $0, %eax",
                "sete %al",
                "sall $7, %eax",
                "orl $0x1f, %eax",
            ]
        );
    }

    #[test]
    fn nullp() {
        assert_eq!(
            compile1("(null? ())"),
            [
                "movl $0x2f, %eax",
                "cmpl $0x2f, %eax",
                "movl $0, %eax",
                "sete %al",
                "sall $7, %eax",
                "orl $0x1f, %eax",
            ]
        );
    }

    #[test]
    fn chars() {
        assert_eq!(
            compile1("(integer->char 65)"),
            ["movl $260, %eax", "sall $6, %eax", "orl $0xf, %eax"]
        );
        assert_eq!(compile1("(char->integer (integer->char 65))")[3..], ["sarl $6, %eax"]);
    }

    #[test]
    fn pairs() {
        assert_eq!(
            compile1("(cons 1 2)"),
            [
                "movl $4, %eax",
                "movl %eax, 0(%esi)",
                "movl $8, %eax",
                "movl %eax, 4(%esi)",
                "movl %esi, %eax",
                "orl $1, %eax",
                "addl $8, %esi",
            ]
        );

        assert_eq!(
            compile1("(car (cons 1 2))").last().unwrap(),
            "movl -1(%eax), %eax"
        );
        assert_eq!(
            compile1("(cdr (cons 1 2))").last().unwrap(),
            "movl 3(%eax), %eax"
        );
    }

    #[test]
    fn vectors() {
        assert_eq!(
            compile1("(make-vector 2)"),
            [
                "movl $8, %eax",
                "movl %eax, 0(%esi)",
                "movl %eax, %ebx",
                "movl %esi, %eax",
                "orl $2, %eax",
                "addl $11, %ebx",
                "andl $-8, %ebx",
                "addl %ebx, %esi",
            ]
        );

        assert_eq!(
            compile1("(vector-ref (make-vector 2) 0)")[8..],
            [
                "movl %eax, -4(%esp)",
                "movl $0, %eax",
                "addl $1, %eax",
                "movl -4(%esp), %ebx",
                "addl %ebx, %eax",
                "movl 0(%eax), %eax",
            ]
        );
    }

    #[test]
    fn arity_is_checked() {
        let mut s: State = Default::default();

        for prog in ["(add1)", "(+ 1)", "(cons 1)", "(vector-set! v 1)"] {
            assert!(
                matches!(eval(&mut s, &parse1(prog)), Err(Error::Malformed(_))),
                "expected a malformed form error for `{}`",
                prog
            );
        }
    }
}
