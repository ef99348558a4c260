use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use log::info;
use quant_backtest::{
    commands::{
        backtest::{self, BacktestOptions},
        experiments, export_market_data, import_market_data, label, labels, rerun,
    },
    config::parse_date_arg,
    context::AppContext,
    models::{DateRange, LabelFilters, LabelParams, RuleKind},
};
use std::env;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "quant-backtest")]
#[command(about = "Label-driven equity backtests with reproducible experiment records")]
struct Cli {
    /// Price snapshot to read instead of the stored price bars
    #[arg(long = "data-file", value_name = "PATH", global = true)]
    data_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy)]
struct RangeArgs {
    /// First session, YYYY-MM-DD
    #[arg(long, value_parser = parse_start)]
    start: NaiveDate,
    /// Last session, YYYY-MM-DD
    #[arg(long, value_parser = parse_end)]
    end: NaiveDate,
}

impl RangeArgs {
    fn date_range(self) -> Result<DateRange> {
        Ok(DateRange::new(self.start, self.end)?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Rank the universe by a rule and store the top-K per session as a label
    Label {
        /// largest_gain, largest_drop, market_cap_gain, market_cap_drop, highest_volume or highest_turnover
        rule: RuleKind,
        #[command(flatten)]
        range: RangeArgs,
        #[arg(long, default_value_t = 20)]
        top_k: usize,
        /// Label name (defaults to <rule>_top<k>)
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        min_market_cap: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        min_change_pct: Option<f64>,
        #[arg(long, allow_hyphen_values = true)]
        max_change_pct: Option<f64>,
        #[arg(long)]
        min_volume: Option<i64>,
    },
    /// List, inspect or delete stored labels
    Labels {
        #[command(subcommand)]
        action: LabelAction,
    },
    /// Backtest a strategy config (JSON) against a stored label
    Backtest {
        /// Strategy config file
        #[arg(long, value_name = "PATH")]
        config: PathBuf,
        /// Label to trade
        #[arg(long)]
        label: String,
        #[command(flatten)]
        range: RangeArgs,
        /// Compute the label with this rule first
        #[arg(long)]
        rule: Option<RuleKind>,
        /// Store the result as an experiment
        #[arg(long)]
        save: bool,
        /// Write the full result as JSON
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Inspect or delete saved experiments
    Experiments {
        #[command(subcommand)]
        action: ExperimentAction,
    },
    /// Re-run a saved experiment and compare its result hash
    Rerun {
        experiment_id: String,
        /// Record the new result when the hash differs
        #[arg(long)]
        accept: bool,
    },
    /// Export stored price bars as a snapshot file
    ExportMarketData {
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        #[arg(long, value_parser = parse_start)]
        start: Option<NaiveDate>,
        #[arg(long, value_parser = parse_end)]
        end: Option<NaiveDate>,
    },
    /// Load a snapshot file into the price bar table
    ImportMarketData {
        #[arg(value_name = "PATH")]
        input: PathBuf,
    },
}

#[derive(Subcommand)]
enum ExperimentAction {
    List {
        /// Include soft-deleted experiments
        #[arg(long)]
        all: bool,
    },
    Show {
        experiment_id: String,
    },
    Delete {
        experiment_id: String,
    },
}

#[derive(Subcommand)]
enum LabelAction {
    List,
    Show {
        name: String,
        #[arg(long, value_parser = parse_start)]
        start: Option<NaiveDate>,
        #[arg(long, value_parser = parse_end)]
        end: Option<NaiveDate>,
    },
    Delete {
        name: String,
    },
    /// Ranking rules a label can be computed with
    Rules,
}

fn optional_range(start: Option<NaiveDate>, end: Option<NaiveDate>) -> Result<Option<DateRange>> {
    match (start, end) {
        (Some(start), Some(end)) => Ok(Some(DateRange::new(start, end)?)),
        (None, None) => Ok(None),
        _ => Err(anyhow!("--start and --end must be given together")),
    }
}

fn parse_start(raw: &str) -> Result<NaiveDate> {
    parse_date_arg("start", raw)
}

fn parse_end(raw: &str) -> Result<NaiveDate> {
    parse_date_arg("end", raw)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let Cli { data_file, command } = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let app_context = AppContext::initialize(env::var("DATABASE_URL").ok()).await?;

    info!("Starting quant-backtest. Backtest results are not a forecast of live performance.");

    let data_file = data_file.as_deref();
    match command {
        Commands::Label {
            rule,
            range,
            top_k,
            name,
            min_market_cap,
            min_change_pct,
            max_change_pct,
            min_volume,
        } => {
            let params = LabelParams {
                top_k,
                label_name: name,
                filters: LabelFilters {
                    min_market_cap,
                    min_change_pct,
                    max_change_pct,
                    min_volume,
                },
            };
            label::run(&app_context, data_file, rule, range.date_range()?, params).await?;
        }
        Commands::Labels { action } => match action {
            LabelAction::List => labels::list(&app_context).await?,
            LabelAction::Show { name, start, end } => {
                labels::show(&app_context, &name, optional_range(start, end)?).await?
            }
            LabelAction::Delete { name } => labels::delete(&app_context, &name).await?,
            LabelAction::Rules => labels::rules(),
        },
        Commands::Backtest {
            config,
            label,
            range,
            rule,
            save,
            output,
        } => {
            backtest::run(
                &app_context,
                BacktestOptions {
                    data_file,
                    config_path: &config,
                    label_name: &label,
                    date_range: range.date_range()?,
                    label_rule: rule,
                    save_experiment: save,
                    output: output.as_deref(),
                },
            )
            .await?;
        }
        Commands::Experiments { action } => match action {
            ExperimentAction::List { all } => experiments::list(&app_context, all).await?,
            ExperimentAction::Show { experiment_id } => {
                experiments::show(&app_context, &experiment_id).await?
            }
            ExperimentAction::Delete { experiment_id } => {
                experiments::delete(&app_context, &experiment_id).await?
            }
        },
        Commands::Rerun {
            experiment_id,
            accept,
        } => {
            rerun::run(&app_context, data_file, &experiment_id, accept).await?;
        }
        Commands::ExportMarketData { output, start, end } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE));
            export_market_data::run(&app_context, &output_path, optional_range(start, end)?)
                .await?;
        }
        Commands::ImportMarketData { input } => {
            import_market_data::run(&app_context, &input).await?;
        }
    }

    Ok(())
}
