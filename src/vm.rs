//! The tree-walking interpreter (spec.md §4.1): the core of the crate.

use crate::context::{Context, FILE_KEY, INLINE_KEY, PATH_KEY};
use crate::error::VmError;
use crate::expr::{ExpressionEvaluator, MacroCall};
use crate::instruction::Instruction;
use crate::macro_table::{MacroDef, MacroTable};
use crate::parser::Parser;
use crate::resolver::{EngineConfig, IncludeResolver};
use crate::value::Value;

/// Maximum number of nested `_execute` frames (conditional branches, macro
/// bodies, and included files each open a new frame).
pub const MAX_EXECUTION_DEPTH: u32 = 256;

/// Interprets an instruction tree under a scoped context, driving macro
/// expansion and include resolution.
///
/// Recursion depth is threaded as a plain `u32` parameter through
/// `_execute` rather than held as a guarded `&mut self` field: a
/// Drop-based guard borrowing `self.depth` would stay alive across the
/// very recursive `self._execute` calls it is meant to bound, which the
/// borrow checker rejects. Passing depth by value gets the same
/// exception-safety for free — each frame's count simply falls out of
/// scope on return, success or error.
pub struct ExecutionVM {
    evaluator: Box<dyn ExpressionEvaluator>,
    parser: Box<dyn Parser>,
    resolver: IncludeResolver,
    file: String,
    config: EngineConfig,
    globals: Context,
    macros: MacroTable,
}

impl ExecutionVM {
    pub fn new(
        evaluator: Box<dyn ExpressionEvaluator>,
        parser: Box<dyn Parser>,
        resolver: IncludeResolver,
        file: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        ExecutionVM {
            evaluator,
            parser,
            resolver,
            file: file.into(),
            config,
            globals: Context::new(),
            macros: MacroTable::new(),
        }
    }

    /// Parses `source`, interprets it, and returns the concatenated
    /// output. Resets globals, the macro table, and depth first.
    pub fn execute(&mut self, source: &str, context: Option<Context>) -> Result<String, VmError> {
        self.globals = Context::new();
        self.macros.clear();

        self.parser.set_file(self.file.clone());
        let tree = self.parser.parse(source)?;

        let base = Context::from_path(&self.file);
        let initial = match context {
            Some(caller) => Context::merge(&[&base, &self.globals, &caller]),
            None => Context::merge(&[&base, &self.globals]),
        };

        let mut buffer: Vec<String> = Vec::new();
        let mut last_output_file: Option<String> = None;
        self._execute(&tree, &initial, 0, &mut buffer, &mut last_output_file)?;
        Ok(buffer.concat())
    }

    fn _execute(
        &mut self,
        instructions: &[Instruction],
        local_context: &Context,
        depth: u32,
        buffer: &mut Vec<String>,
        last_output_file: &mut Option<String>,
    ) -> Result<(), VmError> {
        if depth >= self.config.max_execution_depth {
            let context = Context::merge(&[local_context, &self.globals]);
            return Err(VmError::MaxExecutionDepthReached {
                file: context.file(),
                line: context.line(),
                max: self.config.max_execution_depth,
            });
        }

        for instr in instructions {
            let mut context = Context::merge(&[local_context, &self.globals]);
            if !context.is_inline() {
                context.set_line(instr.line());
            }

            match instr {
                Instruction::Set { variable, value, .. } => {
                    let v = self
                        .evaluator
                        .evaluate(value, &context)
                        .map_err(|e| self.wrap_expr_error(e, &context))?;
                    self.globals.insert(variable.clone(), v);
                }

                Instruction::Output { value, computed, .. } => {
                    if *computed {
                        self.append(buffer, last_output_file, &context, value.clone());
                    } else {
                        let call = self
                            .evaluator
                            .parse_macro_call(value, &context, &self.macros)
                            .map_err(|e| self.wrap_expr_error(e, &context))?;
                        match call {
                            Some(call) => {
                                let mut sub_buffer = Vec::new();
                                let mut sub_last_file = None;
                                self.invoke_macro(
                                    &call,
                                    &context,
                                    true,
                                    depth,
                                    &mut sub_buffer,
                                    &mut sub_last_file,
                                )?;
                                trim_trailing_newline(&mut sub_buffer);
                                buffer.extend(sub_buffer);
                            }
                            None => {
                                let v = self
                                    .evaluator
                                    .evaluate(value, &context)
                                    .map_err(|e| self.wrap_expr_error(e, &context))?;
                                self.append(buffer, last_output_file, &context, v.to_string());
                            }
                        }
                    }
                }

                Instruction::Include { value, .. } => {
                    let call = self
                        .evaluator
                        .parse_macro_call(value, &context, &self.macros)
                        .map_err(|e| self.wrap_expr_error(e, &context))?;
                    match call {
                        Some(call) => {
                            let inline = context.is_inline();
                            self.invoke_macro(
                                &call,
                                &context,
                                inline,
                                depth,
                                buffer,
                                last_output_file,
                            )?;
                        }
                        None => {
                            let reference = self
                                .evaluator
                                .evaluate(value, &context)
                                .map_err(|e| self.wrap_expr_error(e, &context))?
                                .to_string();

                            let bytes = self.resolver.resolve(&reference).map_err(|e| {
                                match e {
                                    crate::reader::ReaderError::GitUnsupported { reference } => {
                                        VmError::UnsupportedScheme { reference }
                                    }
                                    other => VmError::SourceInclusion {
                                        source: other,
                                        file: context.file(),
                                        line: context.line(),
                                    },
                                }
                            })?;
                            let body = String::from_utf8_lossy(&bytes).into_owned();

                            self.parser.set_file(reference.clone());
                            let nested_tree = self.parser.parse(&body)?;

                            let mut nested_context = context.clone();
                            if !context.is_inline() {
                                let located = Context::from_path(&reference);
                                if let Some(f) = located.get(FILE_KEY) {
                                    nested_context.insert(FILE_KEY, f.clone());
                                }
                                if let Some(p) = located.get(PATH_KEY) {
                                    nested_context.insert(PATH_KEY, p.clone());
                                }
                            }

                            self._execute(
                                &nested_tree,
                                &nested_context,
                                depth + 1,
                                buffer,
                                last_output_file,
                            )?;
                        }
                    }
                }

                Instruction::Conditional {
                    test,
                    consequent,
                    elseifs,
                    alternate,
                    ..
                } => {
                    let test_value = self
                        .evaluator
                        .evaluate(test, &context)
                        .map_err(|e| self.wrap_expr_error(e, &context))?;
                    if test_value.truthy() {
                        self._execute(consequent, local_context, depth + 1, buffer, last_output_file)?;
                    } else {
                        let mut matched = false;
                        for branch in elseifs {
                            let branch_value = self
                                .evaluator
                                .evaluate(&branch.test, &context)
                                .map_err(|e| self.wrap_expr_error(e, &context))?;
                            if branch_value.truthy() {
                                self._execute(
                                    &branch.consequent,
                                    local_context,
                                    depth + 1,
                                    buffer,
                                    last_output_file,
                                )?;
                                matched = true;
                                break;
                            }
                        }
                        if !matched {
                            if let Some(alt) = alternate {
                                self._execute(alt, local_context, depth + 1, buffer, last_output_file)?;
                            }
                        }
                    }
                }

                Instruction::Macro { declaration, body, .. } => {
                    let decl = self
                        .evaluator
                        .parse_macro_declaration(declaration)
                        .map_err(|e| self.wrap_expr_error(e, &context))?;
                    if let Some(existing) = self.macros.get(&decl.name) {
                        return Err(VmError::MacroAlreadyDeclared {
                            name: decl.name,
                            first_file: existing.file.clone(),
                            first_line: existing.line,
                            second_file: context.file(),
                            second_line: context.line(),
                        });
                    }
                    self.macros.declare(
                        decl.name,
                        MacroDef {
                            args: decl.args,
                            body: body.clone(),
                            file: context.file(),
                            path: context.path(),
                            line: context.line(),
                        },
                    );
                }

                Instruction::Error { value, .. } => {
                    let message = self
                        .evaluator
                        .evaluate(value, &context)
                        .map_err(|e| self.wrap_expr_error(e, &context))?;
                    return Err(VmError::UserDefined {
                        message: message.to_string(),
                        file: context.file(),
                        line: context.line(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Binds `call`'s arguments positionally against the declared macro's
    /// formals (spec.md §4.1 "Macro invocation details") and executes its
    /// body as a new frame.
    fn invoke_macro(
        &mut self,
        call: &MacroCall,
        caller_context: &Context,
        inline: bool,
        depth: u32,
        buffer: &mut Vec<String>,
        last_output_file: &mut Option<String>,
    ) -> Result<(), VmError> {
        let def = self
            .macros
            .get(&call.name)
            .expect("macro recognized by parse_macro_call must be declared")
            .clone();

        let mut macro_local = Context::new();
        for (name, value) in def.args.iter().zip(call.args.iter()) {
            macro_local.insert(name.clone(), value.clone());
        }
        if inline {
            macro_local.insert(INLINE_KEY, Value::Bool(true));
        }
        if !caller_context.is_inline() {
            macro_local.insert(FILE_KEY, Value::String(def.file.clone()));
            macro_local.insert(PATH_KEY, Value::String(def.path.clone()));
        }

        let merged = Context::merge(&[caller_context, &macro_local]);
        self._execute(&def.body, &merged, depth + 1, buffer, last_output_file)
    }

    fn append(
        &self,
        buffer: &mut Vec<String>,
        last_output_file: &mut Option<String>,
        context: &Context,
        text: String,
    ) {
        if self.config.generate_line_control && !context.is_inline() {
            let file = context.file();
            if last_output_file.as_deref() != Some(file.as_str()) {
                let escaped = file.replace('"', "\\\"");
                buffer.push(format!("#line {} \"{}\"\n", context.line(), escaped));
                *last_output_file = Some(file);
            }
        }
        buffer.push(text);
    }

    fn wrap_expr_error(&self, source: crate::expr::ExprError, context: &Context) -> VmError {
        VmError::ExpressionEvaluation {
            source,
            file: context.file(),
            line: context.line(),
        }
    }
}

/// Strips exactly one trailing `\r\n` or `\n` from a macro's expanded
/// sub-buffer (spec.md §4.1, §8 "trailing newline" boundary behavior).
fn trim_trailing_newline(chunks: &mut [String]) {
    if let Some(last) = chunks.last_mut() {
        if last.ends_with("\r\n") {
            last.truncate(last.len() - 2);
        } else if last.ends_with('\n') {
            last.truncate(last.len() - 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exclusion::ExclusionMatcher;
    use crate::expr::DefaultEvaluator;
    use crate::parser::DirectiveParser;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn vm(file: &str, cache_dir: PathBuf) -> ExecutionVM {
        let config = EngineConfig {
            cache_dir,
            ..EngineConfig::default()
        };
        let resolver = IncludeResolver::new(&config, ExclusionMatcher::empty());
        ExecutionVM::new(
            Box::new(DefaultEvaluator::new()),
            Box::new(DirectiveParser::new()),
            resolver,
            file,
            config,
        )
    }

    #[test]
    fn plain_text_passes_through() {
        let dir = tempdir().unwrap();
        let mut vm = vm("main.txt", dir.path().join("cache"));
        let out = vm.execute("hello world\n", None).unwrap();
        assert_eq!(out, "hello world\n");
    }

    #[test]
    fn set_and_interpolate_variable() {
        let dir = tempdir().unwrap();
        let mut vm = vm("main.txt", dir.path().join("cache"));
        let out = vm
            .execute("@set name = \"world\"\nhello {{ name }}\n", None)
            .unwrap();
        assert_eq!(out, "hello world\n");
    }

    #[test]
    fn conditional_picks_first_truthy_branch() {
        let dir = tempdir().unwrap();
        let mut vm = vm("main.txt", dir.path().join("cache"));
        let src = "@if false\nA\n@elseif true\nB\n@else\nC\n@endif\n";
        let out = vm.execute(src, None).unwrap();
        assert_eq!(out, "B\n");
    }

    #[test]
    fn macro_declaration_and_invocation() {
        let dir = tempdir().unwrap();
        let mut vm = vm("main.txt", dir.path().join("cache"));
        let src = "@macro GREET(name)\nhi {{ name }}\n@endmacro\n{{ GREET(\"world\") }}";
        let out = vm.execute(src, None).unwrap();
        assert_eq!(out, "hi world");
    }

    #[test]
    fn macro_expansion_trims_one_trailing_newline() {
        let dir = tempdir().unwrap();
        let mut vm = vm("main.txt", dir.path().join("cache"));
        let src = "@macro GREET()\nhi\n\n@endmacro\nbefore{{ GREET() }}after";
        let out = vm.execute(src, None).unwrap();
        assert_eq!(out, "beforehi\nafter");
    }

    #[test]
    fn global_wins_over_macro_argument_of_the_same_name() {
        let dir = tempdir().unwrap();
        let mut vm = vm("main.txt", dir.path().join("cache"));
        let src =
            "@set x = \"global\"\n@macro M(x)\n{{ x }}\n@endmacro\n{{ M(\"arg\") }}";
        let out = vm.execute(src, None).unwrap();
        assert_eq!(out, "global");
    }

    #[test]
    fn redeclaring_a_macro_is_an_error() {
        let dir = tempdir().unwrap();
        let mut vm = vm("main.txt", dir.path().join("cache"));
        let src = "@macro A()\nx\n@endmacro\n@macro A()\ny\n@endmacro\n";
        let err = vm.execute(src, None).unwrap_err();
        assert!(matches!(err, VmError::MacroAlreadyDeclared { .. }));
    }

    #[test]
    fn error_directive_raises_user_defined_error() {
        let dir = tempdir().unwrap();
        let mut vm = vm("main.txt", dir.path().join("cache"));
        let err = vm.execute("@error \"boom\"\n", None).unwrap_err();
        match err {
            VmError::UserDefined { message, file, line } => {
                assert_eq!(message, "boom");
                assert_eq!(file, "main.txt");
                assert_eq!(line, 1);
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn include_reads_and_interprets_local_file() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("frag.txt"), "included\n").unwrap();
        let config = EngineConfig {
            cache_dir: dir.path().join("cache"),
            include_dirs: vec![dir.path().to_path_buf()],
            ..EngineConfig::default()
        };
        let resolver = IncludeResolver::new(&config, ExclusionMatcher::empty());
        let mut vm = ExecutionVM::new(
            Box::new(DefaultEvaluator::new()),
            Box::new(DirectiveParser::new()),
            resolver,
            "main.txt",
            config,
        );
        let out = vm.execute("@include \"frag.txt\"\n", None).unwrap();
        assert_eq!(out, "included\n");
    }

    #[test]
    fn self_recursive_include_hits_depth_bound() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("loop.txt"), "@include \"loop.txt\"\n").unwrap();
        let config = EngineConfig {
            cache_dir: dir.path().join("cache"),
            include_dirs: vec![dir.path().to_path_buf()],
            ..EngineConfig::default()
        };
        let resolver = IncludeResolver::new(&config, ExclusionMatcher::empty());
        let mut vm = ExecutionVM::new(
            Box::new(DefaultEvaluator::new()),
            Box::new(DirectiveParser::new()),
            resolver,
            "loop.txt",
            config,
        );
        let err = vm.execute("@include \"loop.txt\"\n", None).unwrap_err();
        assert!(matches!(err, VmError::MaxExecutionDepthReached { .. }));
    }

    #[test]
    fn line_control_emitted_once_per_file_change() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("frag.txt"), "b\n").unwrap();
        let config = EngineConfig {
            cache_dir: dir.path().join("cache"),
            include_dirs: vec![dir.path().to_path_buf()],
            generate_line_control: true,
            ..EngineConfig::default()
        };
        let resolver = IncludeResolver::new(&config, ExclusionMatcher::empty());
        let mut vm = ExecutionVM::new(
            Box::new(DefaultEvaluator::new()),
            Box::new(DirectiveParser::new()),
            resolver,
            "main.txt",
            config,
        );
        let out = vm.execute("a\n@include \"frag.txt\"\n", None).unwrap();
        assert!(out.contains("#line 1 \"main.txt\"\n"));
        assert!(out.contains("#line 1 \"frag.txt\"\n"));
    }
}
