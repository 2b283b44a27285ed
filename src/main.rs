//! Inspect and validate microscope model files.
//!
//! Usage:
//! `instrument-model [--config FILE] [--set Comp.prop=value]... check <model.yaml>`
//! `instrument-model order <model.yaml> [--layers]`
//! `instrument-model affects <model.yaml> <component>`

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use instrument_model::{logging, PropertyOverride, ResolveError, Resolver, ResolverConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "instrument-model")]
#[command(about = "Validate microscope models and show their instantiation order")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Resolver configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override a property before loading, e.g. "Light.power=0.5"
    #[arg(long = "set", global = true)]
    overrides: Vec<PropertyOverride>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Report every problem of a model
    Check {
        /// Model file
        model: PathBuf,
    },

    /// Print the order in which components are created
    Order {
        /// Model file
        model: PathBuf,

        /// Group components that can be created concurrently
        #[arg(long)]
        layers: bool,
    },

    /// Show what a component affects and what affects it
    Affects {
        /// Model file
        model: PathBuf,

        /// Component name
        component: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            match e.downcast_ref::<ResolveError>() {
                Some(ResolveError::Invalid(errors)) => eprintln!("{}", errors),
                _ => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => ResolverConfig::load_from(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => ResolverConfig::load()?,
    };

    let level = if cli.verbose { "debug" } else { config.log_level.as_str() };
    logging::init(level);

    let resolver = Resolver::new(config).with_overrides(cli.overrides);

    match cli.command {
        Commands::Check { model } => {
            let plan = resolver.plan_path(&model)?;
            println!(
                "{}: {} components, {} edges, {} affect relations - OK",
                model.display(),
                plan.store.len(),
                plan.graph.edge_count(),
                plan.affects.len()
            );
        }
        Commands::Order { model, layers } => {
            let plan = resolver.plan_path(&model)?;
            if layers {
                for (i, layer) in plan.layers.iter().enumerate() {
                    println!("{}: {}", i, layer.join(", "));
                }
            } else {
                for name in &plan.order {
                    match plan.store.get(name).and_then(|d| d.owner.as_deref()) {
                        Some(owner) if plan.store.child_handle(name).is_some() => {
                            println!("{} (built by {})", name, owner)
                        }
                        _ => println!("{}", name),
                    }
                }
            }
        }
        Commands::Affects { model, component } => {
            let plan = resolver.plan_path(&model)?;
            if !plan.store.contains(&component) {
                anyhow::bail!("Unknown component '{}'", component);
            }
            let affects = plan.affects.affects(&component);
            let affected_by = plan.affects.affected_by(&component);
            println!("{} affects:", component);
            for name in &affects {
                println!("  {}", name);
            }
            println!("{} is affected by:", component);
            for name in &affected_by {
                println!("  {}", name);
            }
        }
    }

    Ok(())
}
