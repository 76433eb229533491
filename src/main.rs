use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use clap::Parser as ClapParser;

use assemblage::{
    Context, DefaultEvaluator, DirectiveParser, EngineConfig, ErrorExt, ExclusionMatcher,
    ExecutionVM, IncludeResolver, Value,
};

/// A directive-driven template execution engine: assembles source text from
/// local and remote fragments under a small macro/conditional language.
#[derive(Debug, ClapParser)]
#[command(name = "assemblage", version)]
struct Cli {
    /// Source file to process. Reads stdin when omitted.
    source: Option<PathBuf>,

    /// Write output here instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Folder to search for includes (repeatable). Defaults to the CWD.
    #[arg(short = 'i', long = "include")]
    include_dirs: Vec<PathBuf>,

    /// Directory to store cached remote includes in.
    #[arg(long, default_value = ".assemblage-cache")]
    cache_dir: PathBuf,

    /// Disable the include cache entirely.
    #[arg(long)]
    no_cache: bool,

    /// Exclusion manifest: one regex pattern per line, `#` comments.
    #[arg(long)]
    exclude: Option<PathBuf>,

    /// Emit `#line` directives into the output.
    #[arg(long)]
    line_control: bool,

    /// Define a variable as NAME=VALUE (repeatable).
    #[arg(short = 'D', long = "define")]
    defines: Vec<String>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let source_text = match read_source(cli.source.as_deref()) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let exclusions = match load_exclusions(cli.exclude.as_deref()) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let include_dirs = if cli.include_dirs.is_empty() {
        vec![PathBuf::from(".")]
    } else {
        cli.include_dirs
    };

    let config = EngineConfig {
        use_cache: !cli.no_cache,
        cache_dir: cli.cache_dir,
        generate_line_control: cli.line_control,
        include_dirs,
        ..EngineConfig::default()
    };

    let file = cli
        .source
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<stdin>".to_string());

    let resolver = IncludeResolver::new(&config, exclusions);
    let mut vm = ExecutionVM::new(
        Box::new(DefaultEvaluator::new()),
        Box::new(DirectiveParser::new()),
        resolver,
        file,
        config,
    );

    let initial_context = match build_defines(&cli.defines) {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(1);
        }
    };

    let result = vm
        .execute(&source_text, Some(initial_context))
        .print_error();

    match result {
        Some(output) => {
            if let Err(e) = write_output(cli.output.as_deref(), &output) {
                eprintln!("error: {}", e);
                std::process::exit(1);
            }
        }
        None => std::process::exit(1),
    }
}

fn read_source(source: Option<&std::path::Path>) -> io::Result<String> {
    match source {
        Some(path) => fs::read_to_string(path),
        None => {
            let mut buffer = String::new();
            io::stdin().read_to_string(&mut buffer)?;
            Ok(buffer)
        }
    }
}

fn write_output(target: Option<&std::path::Path>, text: &str) -> io::Result<()> {
    match target {
        Some(path) => fs::write(path, text),
        None => io::stdout().write_all(text.as_bytes()),
    }
}

fn load_exclusions(manifest: Option<&std::path::Path>) -> io::Result<ExclusionMatcher> {
    match manifest {
        Some(path) => {
            let text = fs::read_to_string(path)?;
            ExclusionMatcher::from_manifest(&text)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
        }
        None => Ok(ExclusionMatcher::empty()),
    }
}

fn build_defines(defines: &[String]) -> Result<Context, String> {
    let mut ctx = Context::new();
    for define in defines {
        let (name, value) = define
            .split_once('=')
            .ok_or_else(|| format!("invalid --define \"{}\", expected NAME=VALUE", define))?;
        ctx.insert(name.to_string(), Value::String(value.to_string()));
    }
    Ok(ctx)
}
