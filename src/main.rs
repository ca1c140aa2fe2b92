use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use uegw::config::GatewayConfig;
use uegw::recipe::{execute, Recipe, RecipeExecutorOptions};

#[derive(Parser)]
#[command(name = "uegw", version, about = "Gateway in front of the editor's tool surface")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway, accepting caller connections and forwarding to the editor.
    Serve,
    /// Print the execution order of a recipe without running it.
    #[command(name = "recipe-plan")]
    RecipePlan {
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Execute a recipe against a running gateway's dispatch pipeline.
    #[command(name = "recipe-run")]
    RecipeRun {
        file: PathBuf,
        #[arg(long)]
        name: Option<String>,
        #[arg(long, default_value = "dev")]
        role: String,
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        continue_on_error: bool,
        #[arg(long)]
        parallelism: Option<usize>,
        #[arg(long)]
        default_timeout_sec: Option<u64>,
        /// YAML or JSON document of `NAME: value` vars, applied between the
        /// recipe's own `vars` and `--var` overrides.
        #[arg(long)]
        vars_file: Option<PathBuf>,
        #[arg(long, value_parser = parse_var)]
        var: Vec<(String, String)>,
    },
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s}"))
}

/// Loads a `--vars-file`: a YAML or JSON mapping of `NAME: value`.
fn load_vars_file(path: &Path) -> anyhow::Result<HashMap<String, String>> {
    let raw = std::fs::read_to_string(path)?;
    let parsed: HashMap<String, String> = serde_yml::from_str(&raw)?;
    Ok(parsed)
}

fn init_tracing(format: uegw::config::LogFormat) {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        uegw::config::LogFormat::Json => subscriber.json().init(),
        uegw::config::LogFormat::Pretty => subscriber.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env()?;
    init_tracing(config.log_format);

    let cli = Cli::parse();
    match cli.command {
        Command::Serve => {
            uegw::server::serve(config).await?;
        }
        Command::RecipePlan { file, name } => {
            let recipe = Recipe::load(&file, name.as_deref())?;
            for step in uegw::recipe::plan(&recipe)? {
                println!("{step}");
            }
        }
        Command::RecipeRun {
            file,
            name,
            role,
            dry_run,
            continue_on_error,
            parallelism,
            default_timeout_sec,
            vars_file,
            var,
        } => {
            let recipe = Recipe::load(&file, name.as_deref())?;
            let dispatcher = Arc::new(uegw::server::build_dispatcher(&config)?);
            let file_vars = match vars_file {
                Some(path) => load_vars_file(&path)?,
                None => Default::default(),
            };
            let cli_vars = var.into_iter().collect();
            let opts = RecipeExecutorOptions {
                parallelism: parallelism.unwrap_or(config.recipe_parallelism),
                default_timeout_sec: default_timeout_sec.unwrap_or(60),
                continue_on_error,
                dry_run,
                role,
                file_vars,
                cli_vars,
                recipe_dir: file.parent().map(PathBuf::from).unwrap_or_else(|| PathBuf::from(".")),
            };
            let summary = execute(&recipe, dispatcher, opts).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            if !summary.ok {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
