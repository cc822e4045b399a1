//! akh-gate CLI: load policies, run queries against host fixtures, compile
//! data filters.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use miette::{IntoDiagnostic, Result};

use akh_gate::codec::from_json;
use akh_gate::config::EngineConfig;
use akh_gate::engine::Engine;
use akh_gate::events::Bindings;
use akh_gate::filter::{ResultEvent, Types};
use akh_gate::host::{FixtureHost, drive};
use akh_gate::kb::Source;
use akh_gate::message::Message;
use akh_gate::query::Query;
use akh_gate::term::Term;

#[derive(Parser)]
#[command(name = "akh-gate", version, about = "Authorization policy engine")]
struct Cli {
    /// Engine configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load policy files and report warnings.
    Check {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },

    /// Run inline `?=` queries, then an optional query.
    Query {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Query to run after the inline queries, e.g. 'allow(alice, "read", doc1)'.
        #[arg(long, short)]
        query: Option<String>,

        /// JSON fixture of host objects answering external calls.
        #[arg(long)]
        facts: Option<PathBuf>,

        /// Print evaluation trace.
        #[arg(long)]
        trace: bool,
    },

    /// Evaluate a query with one variable left partial and compile the
    /// results into a data filter.
    Filter {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        #[arg(long, short)]
        query: String,

        /// JSON types map: class -> field -> type.
        #[arg(long)]
        types: PathBuf,

        /// Class of the filtered variable.
        #[arg(long)]
        class: String,

        /// Variable left partial.
        #[arg(long, default_value = "resource")]
        var: String,

        #[arg(long)]
        facts: Option<PathBuf>,

        /// Emit the denormalized filter instead of a fetch plan.
        #[arg(long)]
        legacy: bool,
    },
}

fn main() -> Result<()> {
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(3)
                .build(),
        )
    }))
    .ok(); // Ignore error if hook already set (e.g., in tests)

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    }
    .with_env_overrides()?;
    let engine = Engine::new(config)?;

    match cli.command {
        Commands::Check { files } => {
            load(&engine, &files)?;
            drain(std::iter::from_fn(|| engine.next_message()));
            println!("{} rules loaded from {} files", engine.rules().len(), files.len());
        }

        Commands::Query {
            files,
            query,
            facts,
            trace,
        } => {
            let mut host = fixture(&engine, facts.as_deref())?;
            load(&engine, &files)?;
            drain(std::iter::from_fn(|| engine.next_message()));

            let mut failed = 0;
            while let Some(mut inline) = engine.next_inline_query(trace) {
                let term = inline.term().to_string();
                let solutions = run(&mut inline, &mut host)?;
                if solutions.is_empty() {
                    eprintln!("inline query failed: {term}");
                    failed += 1;
                }
            }
            if failed > 0 {
                miette::bail!("{failed} inline queries failed");
            }

            if let Some(src) = query {
                let mut q = engine.new_query(&src, trace)?;
                let solutions = run(&mut q, &mut host)?;
                if solutions.is_empty() {
                    println!("false");
                }
                for bindings in &solutions {
                    println!("{}", describe(bindings));
                }
            }
        }

        Commands::Filter {
            files,
            query,
            types,
            class,
            var,
            facts,
            legacy,
        } => {
            let mut host = fixture(&engine, facts.as_deref())?;
            load(&engine, &files)?;
            drain(std::iter::from_fn(|| engine.next_message()));

            let types: Types = from_json("types", &std::fs::read_to_string(&types).into_diagnostic()?)?;
            let mut q = engine.new_query(&query, false)?;
            q.bind(&var, Term::partial_of(&class))?;
            let results: Vec<ResultEvent> = run(&mut q, &mut host)?
                .into_iter()
                .map(|bindings| ResultEvent { bindings })
                .collect();
            tracing::info!(results = results.len(), class = %class, "partial evaluation finished");

            if legacy {
                print!("{}", engine.build_data_filter(&types, &results, &var, &class)?);
            } else {
                let plan = engine.build_filter_plan(&types, &results, &var, &class)?;
                println!("{}", serde_json::to_string_pretty(&plan).into_diagnostic()?);
            }
        }
    }

    Ok(())
}

fn load(engine: &Engine, files: &[PathBuf]) -> Result<()> {
    let sources = files
        .iter()
        .map(|path| {
            let src = std::fs::read_to_string(path).into_diagnostic()?;
            Ok(Source::named(src, path.display().to_string()))
        })
        .collect::<Result<Vec<_>>>()?;
    engine.load(&sources)?;
    Ok(())
}

fn fixture(engine: &Engine, path: Option<&Path>) -> Result<FixtureHost> {
    Ok(match path {
        Some(path) => FixtureHost::load(path, engine)?,
        None => FixtureHost::default(),
    })
}

fn run(query: &mut Query, host: &mut FixtureHost) -> Result<Vec<Bindings>> {
    let solutions = drive(query, host, &mut |message| eprintln!("{message}"));
    drain(std::iter::from_fn(|| query.next_message()));
    Ok(solutions?)
}

fn drain(messages: impl Iterator<Item = Message>) {
    for message in messages {
        eprintln!("{message}");
    }
}

fn describe(bindings: &Bindings) -> String {
    if bindings.is_empty() {
        return "true".to_string();
    }
    bindings
        .iter()
        .map(|(name, value)| format!("{name} = {value}"))
        .collect::<Vec<_>>()
        .join(", ")
}
