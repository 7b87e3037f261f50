use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{info, warn};

pub mod autoscaling;
pub mod cloudformation;
pub mod config;
pub mod ec2;
pub mod ecs;
pub mod elbv2;
pub mod patterns;
pub mod stack;
pub mod stacks;
pub mod template;
pub mod writer;

use crate::cloudformation::{Deployment, StackClient};
use crate::config::ConfigEntry;

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),

    #[error(transparent)]
    Stack(#[from] stack::Error),

    #[error(transparent)]
    CloudFormation(#[from] cloudformation::Error),

    #[error(transparent)]
    Writer(#[from] writer::Error),

    #[error("Unable to serialize the template: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Stack {0} is not configured")]
    UnknownStack(String),
}

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Stacks config, ./stacks.yaml when present, built-in stacks otherwise
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List configured stacks
    List,

    /// Synthesize templates and write them to their configured locations
    Synth {
        #[arg(short, long)]
        stack: Option<String>,

        /// Also print the templates
        #[arg(long)]
        print: bool,
    },

    /// Check templates with CloudFormation
    Validate {
        #[arg(short, long)]
        stack: Option<String>,
    },

    /// Create or update stacks
    Deploy {
        #[arg(short, long)]
        stack: Option<String>,

        /// Return once CloudFormation accepted the change
        #[arg(long)]
        no_wait: bool,
    },

    /// Delete stacks
    Destroy {
        #[arg(short, long)]
        stack: Option<String>,

        #[arg(long)]
        no_wait: bool,
    },

    /// Fetch outputs of deployed stacks
    Outputs {
        #[arg(short, long)]
        stack: Option<String>,
    },
}

fn load_config(path: Option<&Path>) -> Result<config::Config, Error> {
    if let Some(path) = path {
        return Ok(config::parse(path)?);
    }

    let default_path = Path::new(config::DEFAULT_PATH);
    if default_path.exists() {
        return Ok(config::parse(default_path)?);
    }

    warn!(
        "{} not found, using the built-in stacks",
        config::DEFAULT_PATH
    );
    Ok(config::default_config())
}

/// All stacks, or the one asked for
fn select(config: config::Config, stack: Option<&str>) -> Result<Vec<ConfigEntry>, Error> {
    match stack {
        None => Ok(config),
        Some(name) => {
            let selected: Vec<ConfigEntry> = config
                .into_iter()
                .filter(|entry| entry.name() == name)
                .collect();

            if selected.is_empty() {
                return Err(Error::UnknownStack(name.to_string()));
            }

            Ok(selected)
        }
    }
}

/// Build the template and keep a copy on disk
fn synth(entry: &ConfigEntry) -> Result<template::Template, Error> {
    let template = stacks::build(entry.name(), &entry.stack)?;
    writer::write_template(&entry.template.location, &template)?;

    info!(
        "{}: {} resources written to {}",
        entry.name(),
        template.resources.len(),
        entry.template.location.display()
    );
    Ok(template)
}

async fn run(cli: Cli) -> Result<(), Error> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::List => {
            for entry in config.iter() {
                println!(
                    "{}\t{}\t{}",
                    entry.name(),
                    entry.stack.name(),
                    entry.template.location.display()
                );
            }
        }

        Command::Synth { stack, print } => {
            for entry in select(config, stack.as_deref())? {
                let template = synth(&entry)?;

                if print {
                    println!(
                        "{}",
                        writer::render_template(&entry.template.location, &template)?
                    );
                }
            }
        }

        Command::Validate { stack } => {
            for entry in select(config, stack.as_deref())? {
                let template = stacks::build(entry.name(), &entry.stack)?;
                let client = StackClient::new(&entry).await?;
                client.validate(&serde_json::to_string(&template)?).await?;
                println!("{}: valid", entry.name());
            }
        }

        Command::Deploy { stack, no_wait } => {
            for entry in select(config, stack.as_deref())? {
                let template = synth(&entry)?;
                let client = StackClient::new(&entry).await?;

                match client.deploy(&serde_json::to_string(&template)?).await? {
                    Deployment::Unchanged => {
                        println!("{}: no changes", entry.name());
                        continue;
                    }
                    Deployment::Created(id) | Deployment::Updated(id) => {
                        info!("{}: deploying {}", entry.name(), id)
                    }
                }

                if no_wait {
                    continue;
                }

                let status = client
                    .wait(&["CREATE_COMPLETE", "UPDATE_COMPLETE"])
                    .await?;
                println!("{}: {}", entry.name(), status);
            }
        }

        Command::Destroy { stack, no_wait } => {
            for entry in select(config, stack.as_deref())? {
                let client = StackClient::new(&entry).await?;
                client.destroy().await?;

                if no_wait {
                    continue;
                }

                let status = client.wait(&["DELETE_COMPLETE"]).await?;
                println!("{}: {}", entry.name(), status);
            }
        }

        Command::Outputs { stack } => {
            let entries = select(config, stack.as_deref())?;

            let fetched = futures::future::try_join_all(entries.iter().map(|entry| async move {
                let client = StackClient::new(entry).await?;
                let outputs = client.get_outputs().await?;
                Ok::<_, cloudformation::Error>((entry, outputs))
            }))
            .await?;

            for (entry, outputs) in fetched {
                match &entry.outputs {
                    Some(file) => {
                        writer::write_outputs(&file.location, &outputs)?;
                        info!(
                            "{}: outputs written to {}",
                            entry.name(),
                            file.location.display()
                        );
                    }
                    None => {
                        for output in outputs.iter() {
                            println!(
                                "{}.{} = {}",
                                entry.name(),
                                output.output_key().unwrap_or_default(),
                                output.output_value().unwrap_or_default()
                            );
                        }
                    }
                }
            }
        }
    }

    return Ok(());
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    if let Err(error) = run(cli).await {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }
}
