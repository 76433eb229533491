//! The VM's typed error surface, plus the CLI-facing presentation helpers
//! armake2 used (`prepend_error`, colored top-level printing) adapted to
//! wrap a typed enum instead of `std::io::Error`.

use colored::*;
use thiserror::Error;

use crate::expr::ExprError;
use crate::parser::ParseError;
use crate::reader::ReaderError;

/// Every error the VM, resolver or cache can raise. Corresponds to the
/// error kinds of spec.md §7; `UnsupportedInstruction` has no runtime
/// variant because `Instruction`'s match in `ExecutionVM::_execute` is
/// exhaustive and checked at compile time.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("{message} ({file}:{line})")]
    UserDefined {
        message: String,
        file: String,
        line: u32,
    },

    #[error(
        "macro \"{name}\" is already declared (first declared at {first_file}:{first_line}, \
         redeclared at {second_file}:{second_line})"
    )]
    MacroAlreadyDeclared {
        name: String,
        first_file: String,
        first_line: u32,
        second_file: String,
        second_line: u32,
    },

    #[error("{source} ({file}:{line})")]
    ExpressionEvaluation {
        #[source]
        source: ExprError,
        file: String,
        line: u32,
    },

    #[error("{source} ({file}:{line})")]
    SourceInclusion {
        #[source]
        source: ReaderError,
        file: String,
        line: u32,
    },

    #[error("maximum execution depth ({max}) reached ({file}:{line})")]
    MaxExecutionDepthReached { file: String, line: u32, max: u32 },

    #[error("GIT sources are not supported: {reference}")]
    UnsupportedScheme { reference: String },

    #[error("invalid exclusion pattern \"{pattern}\": {source}")]
    InvalidExclusionPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// CLI-facing presentation helper, in the spirit of armake2's
/// `ErrorExt::print_error`: prints a colored `error: ...` line to stderr.
pub trait ErrorExt<T> {
    fn print_error(self) -> Option<T>;
}

impl<T> ErrorExt<T> for Result<T, VmError> {
    fn print_error(self) -> Option<T> {
        match self {
            Ok(t) => Some(t),
            Err(e) => {
                eprintln!("{}: {}", "error".red().bold(), e);
                None
            }
        }
    }
}
