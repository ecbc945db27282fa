use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use linkql::output;
use linkql::{CompileOptions, MemoryBackend, QueryCompiler};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "linkql")]
#[command(about = "Compile cross-index queries into search backend documents")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile a query and print the backend documents
    Compile {
        #[command(flatten)]
        target: Target,

        /// Also print the final AST
        #[arg(long)]
        dump: bool,
    },
    /// Compile a query and run it against the fixture
    Search {
        #[command(flatten)]
        target: Target,
    },
    /// Print the optimized AST before joins are executed
    Dump {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args)]
struct Target {
    /// JSON fixture with index mappings and documents
    #[arg(short, long)]
    fixture: PathBuf,

    /// Index the query is issued against
    #[arg(short, long, default_value = "main")]
    index: String,

    /// Compile options file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Query text
    #[arg(trailing_var_arg = true, required = true)]
    query: Vec<String>,
}

impl Target {
    fn query(&self) -> String {
        self.query.join(" ")
    }

    fn options(&self) -> Result<CompileOptions> {
        match &self.config {
            Some(path) => CompileOptions::load(path),
            None => CompileOptions::load_default(),
        }
    }

    fn backend(&self) -> Result<MemoryBackend> {
        MemoryBackend::load(&self.fixture)
    }
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("LINKQL_LOG").or_else(|_| EnvFilter::try_new("warn"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { target, dump } => {
            let backend = target.backend()?;
            let compiler = QueryCompiler::with_options(&backend, target.options()?);
            let compiled = compiler
                .compile(&target.query(), &target.index)
                .context("Compilation failed")?;
            output::print_compiled(&compiled, !target.no_color)?;
            if dump {
                println!();
                output::print_dump(&compiled.dump(), !target.no_color)?;
            }
        }
        Commands::Search { target } => {
            let backend = target.backend()?;
            let compiler = QueryCompiler::with_options(&backend, target.options()?);
            let compiled = compiler
                .compile(&target.query(), &target.index)
                .context("Compilation failed")?;
            let keys = backend
                .primary_keys(&compiled.search_index, &compiled.query)
                .context("Search failed")?;
            output::print_keys(&compiled.search_index, &keys, !target.no_color)?;
        }
        Commands::Dump { target } => {
            let backend = target.backend()?;
            let compiler = QueryCompiler::with_options(&backend, target.options()?);
            let ast = compiler
                .optimize(&target.query(), &target.index)
                .context("Optimization failed")?;
            output::print_dump(&ast.dump(), !target.no_color)?;
        }
    }

    Ok(())
}
