//! ASI Agent - Entry Point
//!
//! Subcommands:
//! - run: experiment loop over task ids
//! - induce-actions / induce-workflows: one induction attempt
//! - check-steps: per-step replay checks of a result directory
//! - describe / compile: action space projections

use anyhow::{bail, Result};
use asi_agent::llm::{LlmClient, LlmThoughtSummarizer};
use asi_agent::pipeline::{parse_task_ids, shuffle_task_ids, Experiment, Pipeline};
use asi_agent::results::{template_result_dirs, ResultDir};
use asi_agent::skills::replay::{check_run, clean_and_store};
use asi_agent::skills::{ActionRegistry, CustomActionSet, DemoMode, Interpreter};
use asi_agent::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "asi-agent", version, about = "Skill induction for web agents")]
struct Cli {
    /// TOML config file (environment variables still override)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log to stderr as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an experiment loop
    Run {
        #[arg(long, value_enum)]
        experiment: Experiment,
        #[arg(long)]
        website: String,
        /// Ranges such as "12-18,30-30"
        #[arg(long)]
        task_ids: String,
        /// Shuffle the task order with this seed
        #[arg(long)]
        shuffle_seed: Option<u64>,
    },
    /// Induce actions from successful runs
    InduceActions {
        #[arg(long)]
        website: String,
        #[arg(long, num_args = 1..)]
        result_id_list: Vec<String>,
        /// Use every usable run of this intent template
        #[arg(long)]
        template_id: Option<i64>,
    },
    /// Induce workflows from successful runs
    InduceWorkflows {
        #[arg(long)]
        website: String,
        /// Result ids such as "110_2_0"
        #[arg(long, num_args = 1.., required = true)]
        result_id_list: Vec<String>,
    },
    /// Print per-step validity, state change and induced-action checks
    CheckSteps {
        #[arg(long)]
        result_dir: PathBuf,
        #[arg(long, num_args = 0..)]
        action_names: Vec<String>,
        /// Also write cleaned_steps.json
        #[arg(long)]
        clean_and_store: bool,
    },
    /// Print the action space description
    Describe {
        #[arg(long, num_args = 1.., default_values_t = vec!["webarena".to_string()])]
        subsets: Vec<String>,
        #[arg(long)]
        long_description: bool,
        #[arg(long)]
        examples: bool,
        /// Allow several actions per step (`--multiaction false` for one)
        #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
        multiaction: bool,
    },
    /// Compile one action response into a program
    Compile {
        #[arg(long, num_args = 1.., default_values_t = vec!["webarena".to_string()])]
        subsets: Vec<String>,
        #[arg(long, value_enum)]
        demo_mode: Option<DemoMode>,
        /// Model output holding the action in a code fence
        text: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if cli.json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = match cli.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    match cli.command {
        Command::Run {
            experiment,
            website,
            task_ids,
            shuffle_seed,
        } => {
            let mut ids = parse_task_ids(&task_ids)?;
            if let Some(seed) = shuffle_seed {
                shuffle_task_ids(&mut ids, seed);
            }
            info!("ASI Agent v{}", env!("CARGO_PKG_VERSION"));
            Pipeline::new(config, website).run(experiment, &ids).await?;
        }
        Command::InduceActions {
            website,
            result_id_list,
            template_id,
        } => {
            let pipeline = Pipeline::new(config, website);
            let dirs = match template_id {
                Some(id) => template_result_dirs(&pipeline.config().results_dir, &pipeline.config().config_dir, id)?,
                None => pipeline.result_dirs(&result_id_list),
            };
            let ids: Vec<String> = dirs.iter().filter_map(ResultDir::task_id).collect();
            if ids.is_empty() {
                bail!("No result directories to induce from");
            }
            let outcome = pipeline.induce_actions(&dirs, &ids).await?;
            println!("{:?}", outcome);
        }
        Command::InduceWorkflows {
            website,
            result_id_list,
        } => {
            let pipeline = Pipeline::new(config, website);
            let dirs = pipeline.result_dirs(&result_id_list);
            let added = pipeline.induce_workflows(&dirs).await?;
            println!("Added {} workflows", added);
        }
        Command::CheckSteps {
            result_dir,
            action_names,
            clean_and_store: store_cleaned,
        } => {
            let dir = ResultDir::new(result_dir);
            let (checks, verdict) = check_run(&dir, &action_names)?;
            let total = checks.valid.len() + 1;
            println!("Valid Steps ({}/{}): {:?}", checks.valid_count(), total, checks.valid);
            println!("State Change ({}/{}): {:?}", checks.state_change_count(), total, checks.state_change);
            println!("Action Induced ({}/{}): {:?}", checks.induced_count(), total, checks.induced);
            if store_cleaned {
                let summarizer = LlmThoughtSummarizer::new(LlmClient::from_config(&config));
                let cleaned = clean_and_store(&dir, &summarizer).await?;
                info!(steps = cleaned.len(), "Stored cleaned steps");
            }
            println!("{}", if verdict.overall_pass { "True" } else { "False" });
        }
        Command::Describe {
            subsets,
            long_description,
            examples,
            multiaction,
        } => {
            let registry = ActionRegistry::builder()
                .subsets(subsets)
                .actions_dir(config.actions_dir.clone())
                .build()?;
            let action_set = CustomActionSet::new(registry).with_multiaction(multiaction);
            println!("{}", action_set.describe(long_description, examples));
        }
        Command::Compile {
            subsets,
            demo_mode,
            text,
        } => {
            let registry = ActionRegistry::builder()
                .subsets(subsets)
                .actions_dir(config.actions_dir.clone())
                .build()?;
            let action_set = CustomActionSet::new(registry).with_demo_mode(demo_mode);
            let compiled = action_set.compile(&text)?;
            let calls = Interpreter::new(action_set.registry()).expand(&compiled.script)?;
            println!("{}", compiled.program);
            for call in calls {
                info!(call = %call.to_source(), "Primitive call");
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe_multiaction_default() {
        let cli = Cli::try_parse_from(["asi-agent", "describe"]).unwrap();
        assert!(matches!(cli.command, Command::Describe { multiaction: true, .. }));

        let cli = Cli::try_parse_from(["asi-agent", "describe", "--multiaction", "false"]).unwrap();
        assert!(matches!(cli.command, Command::Describe { multiaction: false, .. }));
    }
}
