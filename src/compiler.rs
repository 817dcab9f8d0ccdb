//! Entry point for the lispc code generator

/// State for the code generator
pub mod state {
    use crate::x86::WORDSIZE;
    use std::collections::HashMap;

    /// Region a bound variable lives in at run time
    ///
    /// Stack slots hang off `%esp` at negative offsets, closure slots off the
    /// closure register `%edi`, heap slots off the allocation pointer `%esi`.
    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub enum Region {
        Stack,
        Closure,
        Heap,
    }

    #[derive(Debug, PartialEq, Eq, Clone, Copy)]
    pub struct Location {
        pub region: Region,
        pub offset: i32,
    }

    /// State for the code generator; easier to bundle it all into a struct
    /// than pass several arguments in.
    ///
    /// The stack index `si` points to the current available empty slot, in
    /// bytes below `%esp`. Use and then decrement the index to add a new
    /// variable. Defaults to `-word size`.
    ///
    /// `li` is the label index, a counter used to mint unique jump targets.
    ///
    /// The environment is a flat map scoped to a single code block; a `code`
    /// form clears it on exit, and a `let` only restores `si`.
    pub struct State {
        pub si: i32,
        li: u32,
        env: HashMap<String, Location>,
    }

    impl Default for State {
        fn default() -> Self {
            State { si: -WORDSIZE, li: 0, env: HashMap::new() }
        }
    }

    impl State {
        pub fn get(&self, name: &str) -> Option<Location> {
            self.env.get(name).copied()
        }

        pub fn bound(&self, name: &str) -> bool {
            self.env.contains_key(name)
        }

        pub fn set(&mut self, name: String, loc: Location) {
            self.env.insert(name, loc);
        }

        pub fn clear_env(&mut self) {
            self.env.clear();
        }

        /// Allocate a word on the stack & return the existing empty slot
        ///
        /// Since the stack index points to existing free memory, it is useful
        /// to be able to use it and decrement in one go.
        pub fn alloc(&mut self) -> i32 {
            let current = self.si;
            self.si -= WORDSIZE;
            current
        }

        /// Explicitly free `n` words of stack
        pub fn dealloc(&mut self, count: i32) {
            self.si += count * WORDSIZE;
        }

        /// Mint a unique label for jump targets
        pub fn gen_label(&mut self) -> String {
            let n = self.li;
            self.li += 1;
            format!("L{}", n)
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn stack_index() {
            let mut s: State = Default::default();
            assert_eq!(s.si, -4);

            assert_eq!(s.alloc(), -4);
            assert_eq!(s.alloc(), -8);
            assert_eq!(s.si, -12);

            s.dealloc(2);
            assert_eq!(s.si, -4);
        }

        #[test]
        fn labels_never_repeat() {
            let mut s: State = Default::default();
            assert_eq!(s.gen_label(), "L0");
            assert_eq!(s.gen_label(), "L1");
            assert_eq!(s.gen_label(), "L2");
        }

        #[test]
        fn env() {
            let mut s: State = Default::default();
            let loc = Location { region: Region::Stack, offset: -4 };

            s.set("x".to_string(), loc);
            assert_eq!(s.get("x"), Some(loc));
            assert!(s.bound("x"));

            s.clear_env();
            assert_eq!(s.get("x"), None);
        }
    }
}

/// Emit assembly for the canonical program form.
///
/// This module implements the bulk of the compiler and is a good place to
/// start reading code. Everything here works an expression at a time into an
/// [`crate::x86::ASM`] block; [`program`] stitches the blocks into the final
/// section layout.
pub mod emit {
    use crate::{
        compiler::state::{Location, Region, State},
        core::{Error, Expr, Program},
        immediate, lang, primitives,
        x86::{self, Ins, Reference, Register::*, ASM, WORDSIZE},
    };

    /// Emit a whole translation unit
    ///
    /// Layout: the data section with the string constants, the text section
    /// preamble with one `.global` per entry point, the exported functions,
    /// the lifted lambda bodies, and finally the entry itself. The runtime
    /// calls the entry with the heap base in `%eax`; the prelude moves it
    /// into the allocation pointer before the body runs.
    pub fn program(prog: &Program) -> Result<String, Error> {
        let mut s: State = Default::default();
        let mut asm = ASM::default();

        asm += Ins::from(".data");
        asm += Ins::from(".align 8");
        for (label, init) in &prog.constants {
            asm += x86::label(label);
            asm += constant(init)?;
        }

        asm += Ins::from(".text");
        asm += Ins::from(".p2align 2");
        asm += x86::globl(&prog.name);
        for (name, _) in &prog.exports {
            asm += x86::globl(name);
        }

        for (name, code) in &prog.exports {
            asm += x86::label(name);
            asm += eval(&mut s, code)?;
        }

        for (label, code) in &prog.labels {
            asm += x86::label(label);
            asm += eval(&mut s, code)?;
        }

        asm += x86::label(&prog.name);
        asm += x86::mov(ESI.into(), EAX.into());
        for e in &prog.body {
            asm += eval(&mut s, e)?;
        }
        asm += x86::ret();

        Ok(asm.to_string())
    }

    /// Data section body for one constant
    fn constant(init: &Expr) -> Result<ASM, Error> {
        match init.elems() {
            Some([head, Expr::Str(data)]) if head.is_ident("string-init") => {
                Ok(ASM::from(Ins(format!(".long {}", data.len())))
                    + Ins(format!(".ascii \"{}\"", data)))
            }
            _ => Err(Error::Malformed(format!("unknown constant initializer: `{}`", init))),
        }
    }

    /// Evaluate an expression into `%eax`
    pub fn eval(s: &mut State, e: &Expr) -> Result<ASM, Error> {
        match e {
            Expr::Int(n) => {
                Ok(ASM::from(x86::mov(EAX.into(), immediate::fixnum(*n)?.into())))
            }

            Expr::Bool(b) => {
                Ok(ASM::from(x86::mov(EAX.into(), Reference::Hex(immediate::boolean(*b)))))
            }

            Expr::Nil => Ok(ASM::from(x86::mov(EAX.into(), Reference::Hex(immediate::NIL)))),

            Expr::Str(data) => Err(Error::Unsupported(format!(
                "string literal `\"{}\"` survived to the emitter; run the preprocessor",
                data
            ))),

            Expr::Ident(name) => match s.get(name) {
                Some(loc) => Ok(ASM::from(load(loc))),
                None => Err(Error::Unbound(name.clone())),
            },

            Expr::List(elems) => {
                let Some((head, args)) = elems.split_first() else {
                    return Ok(ASM::from(x86::mov(EAX.into(), Reference::Hex(immediate::NIL))));
                };

                match head {
                    Expr::Ident(name) if lang::is_builtin(name) => builtin(s, name, args, e),
                    // a bound head is a closure value; call it indirectly
                    Expr::Ident(name) if s.bound(name) => funcall(s, head, args),
                    // anything else by that name must be a top level label
                    Expr::Ident(name) => labelcall(s, name, args),
                    Expr::List(_) | Expr::Nil => funcall(s, head, args),
                    _ => Err(Error::Unsupported(format!("cannot call `{}`", head))),
                }
            }
        }
    }

    /// Load a variable from its region into the accumulator
    fn load(loc: Location) -> Ins {
        let base = match loc.region {
            Region::Stack => ESP,
            Region::Closure => EDI,
            Region::Heap => ESI,
        };
        x86::mov(EAX.into(), (base + loc.offset).into())
    }

    /// Dispatch a list whose head is a builtin name
    fn builtin(s: &mut State, name: &str, args: &[Expr], form: &Expr) -> Result<ASM, Error> {
        match name {
            "progn" => progn(s, args),
            "let" => vars(s, args, form),
            "if" => cond(s, args, form),
            "labels" => labels(s, args, form),
            "code" => code(s, args, form),
            "labelcall" => match args.split_first() {
                Some((Expr::Ident(l), args)) => labelcall(s, l, args),
                _ => Err(Error::Malformed(format!("labelcall needs a label: `{}`", form))),
            },
            "funcall" => match args.split_first() {
                Some((f, args)) => funcall(s, f, args),
                None => Err(Error::Malformed(format!("funcall needs a function: `{}`", form))),
            },
            "closure" => closure(s, args, form),
            "string-ref" => match args {
                [Expr::Ident(label)] => {
                    Ok(ASM::from(x86::mov(EAX.into(), Reference::Label(label.clone()))))
                }
                _ => Err(Error::Malformed(format!("string-ref needs a label: `{}`", form))),
            },
            "lambda" => Err(Error::Unsupported(
                "lambda survived to the emitter; run the preprocessor".to_string(),
            )),
            "defun" => Err(Error::Unsupported(
                "defun is only valid at the top level; run the preprocessor".to_string(),
            )),
            "string-init" => Err(Error::Unsupported(
                "string-init is only valid inside the constants table".to_string(),
            )),
            _ => primitives::call(s, name, args)
                .unwrap_or_else(|| Err(Error::Unsupported(format!("unknown builtin `{}`", name)))),
        }
    }

    /// Emit code for a sequence; the last expression is the result
    fn progn(s: &mut State, args: &[Expr]) -> Result<ASM, Error> {
        let mut asm = ASM::default();
        for e in args {
            asm += eval(s, e)?;
        }
        Ok(asm)
    }

    /// Emit code for a let expression
    ///
    /// `(let (x e₁) (y e₂) … body)`. Each initializer is evaluated and pushed
    /// and the name bound to the slot it was pushed into. All the space
    /// allocated for the bindings is free again at the end of the body, so
    /// `si` is simply restored on exit.
    fn vars(s: &mut State, args: &[Expr], form: &Expr) -> Result<ASM, Error> {
        let [bindings @ .., body] = args else {
            return Err(Error::Malformed(format!("let form needs bindings and a body: `{}`", form)));
        };

        if bindings.is_empty() {
            return Err(Error::Malformed(format!("let form needs bindings and a body: `{}`", form)));
        }

        let si = s.si;
        let mut asm = ASM::default();

        for binding in bindings {
            match binding.elems() {
                Some([Expr::Ident(name), init]) => {
                    asm += eval(s, init)?;
                    let slot = s.alloc();
                    asm += x86::save(EAX.into(), slot);
                    s.set(name.clone(), Location { region: Region::Stack, offset: slot });
                }
                _ => {
                    return Err(Error::Malformed(format!(
                        "let binding must be a (name value) pair: `{}`",
                        binding
                    )))
                }
            }
        }

        asm += eval(s, body)?;
        s.si = si;

        Ok(asm)
    }

    /// Emit code for a conditional expression
    ///
    /// Anything that is not the encoded `#f` takes the consequent branch.
    fn cond(s: &mut State, args: &[Expr], form: &Expr) -> Result<ASM, Error> {
        let [test, conseq, alt] = args else {
            return Err(Error::Malformed(format!("if form needs a test and 2 branches: `{}`", form)));
        };

        let alt_label = s.gen_label();
        let exit_label = s.gen_label();

        Ok(eval(s, test)?
            + x86::cmp(EAX.into(), Reference::Hex(immediate::FALSE))
            + x86::je(&alt_label)
            + eval(s, conseq)?
            + x86::jmp(&exit_label)
            + x86::label(&alt_label)
            + eval(s, alt)?
            + x86::label(&exit_label))
    }

    /// Emit code for a labels form
    ///
    /// The body is compiled at the current cursor followed by a bare `ret`,
    /// and the label definitions follow it. The canonical pipeline produces
    /// top level tables instead; this form matters for inputs that already
    /// contain them.
    fn labels(s: &mut State, args: &[Expr], form: &Expr) -> Result<ASM, Error> {
        let [lvars, body] = args else {
            return Err(Error::Malformed(format!("labels form needs bindings and a body: `{}`", form)));
        };

        let lvars = lvars
            .elems()
            .ok_or_else(|| Error::Malformed(format!("labels bindings must be a list: `{}`", form)))?;

        let mut asm = eval(s, body)?;
        asm += x86::ret();

        for lvar in lvars {
            match lvar.elems() {
                Some([Expr::Ident(name), lbody]) => {
                    asm += x86::label(name);
                    asm += eval(s, lbody)?;
                }
                _ => {
                    return Err(Error::Malformed(format!(
                        "labels binding must be a (name body) pair: `{}`",
                        lvar
                    )))
                }
            }
        }

        Ok(asm)
    }

    /// Emit the body of a function
    ///
    /// `(code (arg…) (fv…) body)`. Arguments live in the caller's frame just
    /// below the return address; free variables live in the closure object
    /// `%edi` points at. Both the environment and the stack index are
    /// per-block, so they reset when the body is done.
    fn code(s: &mut State, args: &[Expr], form: &Expr) -> Result<ASM, Error> {
        let [arglist, freevars, body] = args else {
            return Err(Error::Malformed(format!(
                "code form needs parameters, free variables and a body: `{}`",
                form
            )));
        };

        let arglist = idents_of(arglist, form)?;
        let freevars = idents_of(freevars, form)?;

        for (i, arg) in arglist.iter().enumerate() {
            let offset = -WORDSIZE * (i as i32 + 1);
            s.set(arg.to_string(), Location { region: Region::Stack, offset });
        }

        // point just past the arguments
        s.si = -WORDSIZE * (arglist.len() as i32 + 1);

        for (i, fv) in freevars.iter().enumerate() {
            let offset = -WORDSIZE * (i as i32 + 1);
            s.set(fv.to_string(), Location { region: Region::Closure, offset });
        }

        let mut asm = eval(s, body)?;
        asm += x86::ret();

        s.clear_env();
        s.si = -WORDSIZE;

        Ok(asm)
    }

    fn idents_of<'a>(e: &'a Expr, form: &Expr) -> Result<Vec<&'a str>, Error> {
        let elems = e
            .elems()
            .ok_or_else(|| Error::Malformed(format!("expected a list of identifiers: `{}`", form)))?;

        elems
            .iter()
            .map(|e| {
                e.as_ident().ok_or_else(|| {
                    Error::Malformed(format!("expected an identifier, got `{}` in `{}`", e, form))
                })
            })
            .collect()
    }

    /// Emit a direct call to a known label
    ///
    /// One slot is left for the return address, the arguments are evaluated
    /// and pushed in order, and `%esp` is dropped to the caller's live frame
    /// edge around the call so the callee can't clobber locals.
    pub fn labelcall(s: &mut State, label: &str, args: &[Expr]) -> Result<ASM, Error> {
        let sp_slot = s.si + WORDSIZE;
        let si_before = s.si;

        // skip one slot for the return address
        s.si -= WORDSIZE;

        let mut asm = ASM::default();
        for arg in args {
            asm += eval(s, arg)?;
            let slot = s.alloc();
            asm += x86::save(EAX.into(), slot);
        }

        // call pushes the return address, so adjust %esp around it
        asm += x86::add(ESP.into(), sp_slot.into());
        asm += x86::call(label);
        asm += x86::add(ESP.into(), (-sp_slot).into());

        s.si = si_before;
        Ok(asm)
    }

    /// Emit an indirect call through a closure object
    ///
    /// Two slots are reserved: one for the return address and one to save the
    /// caller's closure register. The callee's closure pointer comes out of
    /// evaluating `f`, has its tag stripped, and its first word is the code
    /// address to call.
    pub fn funcall(s: &mut State, f: &Expr, args: &[Expr]) -> Result<ASM, Error> {
        let sp_slot = s.si;
        let si_before = s.si;

        // skip two slots for the return address and the closure pointer
        s.si -= 2 * WORDSIZE;

        let mut asm = ASM::default();
        for arg in args {
            asm += eval(s, arg)?;
            let slot = s.alloc();
            asm += x86::save(EAX.into(), slot);
        }

        asm += x86::save(EDI.into(), si_before);

        asm += eval(s, f)?;
        asm += x86::mov(EDI.into(), EAX.into());
        asm += x86::and(EDI.into(), (-8).into());

        asm += x86::mov(EBX.into(), (EDI + 0).into());
        asm += x86::add(ESP.into(), sp_slot.into());
        asm += x86::call_star(EBX);
        asm += x86::add(ESP.into(), (-sp_slot).into());

        s.si = si_before;
        Ok(asm)
    }

    /// Emit code to allocate a closure object
    ///
    /// The first word is the code address, the captured values follow, and
    /// the result is the heap pointer with the closure tag. The allocation
    /// pointer advances by the payload size plus a header word, rounded up to
    /// the 8-byte object boundary.
    fn closure(s: &mut State, args: &[Expr], form: &Expr) -> Result<ASM, Error> {
        let [label, freevars @ ..] = args else {
            return Err(Error::Malformed(format!("closure form needs a label: `{}`", form)));
        };

        let label = label
            .as_ident()
            .ok_or_else(|| Error::Malformed(format!("closure label must be an identifier: `{}`", form)))?;

        let mut asm =
            ASM::from(x86::mov((ESI + 0).into(), Reference::Label(label.to_string())));

        for (i, fv) in freevars.iter().enumerate() {
            if fv.as_ident().is_none() {
                return Err(Error::Malformed(format!(
                    "closure free variable must be an identifier: `{}`",
                    fv
                )));
            }

            asm += eval(s, fv)?;
            asm += x86::mov((ESI + WORDSIZE * (i as i32 + 1)).into(), EAX.into());
        }

        let payload = WORDSIZE * freevars.len() as i32;

        asm += x86::mov(EBX.into(), payload.into());
        asm += x86::mov(EAX.into(), ESI.into());
        asm += x86::or(EAX.into(), immediate::CLOSURE_TAG.into());
        // align to the next object boundary and advance the alloc pointer
        asm += x86::add(EBX.into(), 11.into());
        asm += x86::and(EBX.into(), (-8).into());
        asm += x86::add(ESI.into(), EBX.into());

        Ok(asm)
    }

}
