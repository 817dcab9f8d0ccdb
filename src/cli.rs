//! Command line interface for lispc

use crate::{
    compiler::emit,
    core::{Config, Error, Program},
    lang, parser,
};

use std::{fs, path::Path};

#[derive(Copy, Clone)]
pub enum Action {
    /// Stop after preprocessing and print the canonical form
    Preprocess,
    /// Compile all the way to assembly
    Compile,
}

pub fn run(config: &Config, action: Action) -> Result<(), Error> {
    let source = fs::read_to_string(&config.input).map_err(|e| Error::Internal {
        message: format!("Failed to read {}", &config.input),
        e: Some(e),
    })?;

    let name = stem(&config.input);

    match action {
        Action::Preprocess => {
            let forms = parser::parse(&source)?;
            let prog = lang::preprocess(forms, &name)?;
            println!("{}", prog.to_expr());
            Ok(())
        }
        Action::Compile => {
            let asm = compile(&source, &name, config.no_preprocess)?;

            fs::write(&config.output, asm).map_err(|e| Error::Internal {
                message: format!("Failed to write {}", &config.output),
                e: Some(e),
            })
        }
    }
}

/// Compile a source text into assembly
///
/// With `no_preprocess` the input must already be a single canonical program
/// record; otherwise the full pipeline runs.
pub fn compile(source: &str, name: &str, no_preprocess: bool) -> Result<String, Error> {
    let forms = parser::parse(source)?;

    let prog = if no_preprocess {
        match forms.as_slice() {
            [e] => Program::from_expr(e)?,
            _ => {
                return Err(Error::Malformed(
                    "a canonical program must be a single record".to_string(),
                ))
            }
        }
    } else {
        lang::preprocess(forms, name)?
    };

    emit::program(&prog)
}

/// Entry symbol for an input path: the file stem
pub fn stem(path: &str) -> String {
    Path::new(path)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| String::from("program"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stems() {
        assert_eq!(stem("fact.lisp"), "fact");
        assert_eq!(stem("demos/fact.lisp"), "fact");
        assert_eq!(stem("fact"), "fact");
    }

    #[test]
    fn compile_rejects_multiple_canonical_records() {
        assert!(compile("1 2", "t", true).is_err());
        assert!(compile("(t () () () 1)", "t", true).is_ok());
    }
}
