use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use pipeline_bootstrap::aws::{AwsContext, CloudFormationClient, IamClient, SsmClient};
use pipeline_bootstrap::bootstrap::{self, Target};
use pipeline_bootstrap::config::{self, Config, Field, Resolver};
use pipeline_bootstrap::parameters::RemoteStore;
use pipeline_bootstrap::plan::{self, Plan};
use pipeline_bootstrap::writer;

#[derive(Parser)]
#[command(
    name = "pipeline-bootstrap",
    about = "Set up GitHub OIDC trust, SSM parameters and a multi-account promotion pipeline",
    version,
    propagate_version = true
)]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true, env = "PIPELINE_BOOTSTRAP_CONFIG")]
    config: Option<PathBuf>,

    /// Context override as key=value, e.g. -c githubBranch=main (repeatable)
    #[arg(short = 'c', long = "context", global = true, value_parser = config::parse_context_pair)]
    context: Vec<(String, String)>,

    /// Fill fields no local source provides from the SSM parameter store
    #[arg(long, global = true)]
    from_parameter_store: bool,

    /// AWS profile for the pipeline account
    #[arg(long, global = true, env = "AWS_PROFILE")]
    profile: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve configuration and print the plan without calling AWS
    Plan {
        /// Write the plan here instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Create or update the OIDC trust, the parameters and the exports
    Setup {
        /// Write the exported values as JSON
        #[arg(long)]
        outputs: Option<PathBuf>,
    },

    /// Show the CDK bootstrap status of every account
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Setup { .. } | Commands::Status => tracing::Level::INFO,
        Commands::Plan { .. } => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_filter(default_level))
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let result = match &cli.command {
        Commands::Plan { out } => run_plan(&cli, out.as_ref()).await,
        Commands::Setup { outputs } => run_setup(&cli, outputs.as_ref()).await,
        Commands::Status => run_status(&cli).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn resolve(cli: &Cli, require_token: bool) -> anyhow::Result<Config> {
    let mut resolver = Resolver::new()
        .environment(unicode_env())
        .context(cli.context.clone())
        .require_token(require_token);
    if let Some(path) = &cli.config {
        resolver = resolver.file(config::parse(path)?);
    }

    if !cli.from_parameter_store {
        let config = resolver.resolve().await?;
        return Ok(config);
    }

    // The store lives in the configured region, not whatever the profile defaults to.
    let region = resolver.local_value(Field::Region)?;
    let ssm = SsmClient::new(&AwsContext::new(region, cli.profile.clone())).await;
    let remote = RemoteStore(&ssm);

    let config = resolver.remote(&remote).resolve().await?;
    return Ok(config);
}

// Variables that are not valid Unicode cannot name a field; skip them.
fn unicode_env() -> Vec<(String, String)> {
    std::env::vars_os()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect()
}

fn log_filter(default_level: tracing::Level) -> EnvFilter {
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_some() {
        return EnvFilter::from_default_env();
    }
    return EnvFilter::default().add_directive(default_level.into());
}

async fn run_plan(cli: &Cli, out: Option<&PathBuf>) -> anyhow::Result<()> {
    let config = resolve(cli, false).await?;
    let plan = Plan::build(&config)?;

    match out {
        Some(path) => writer::write_json(path, &plan)?,
        None => print!("{}", writer::to_json(&plan)?),
    }

    return Ok(());
}

async fn run_setup(cli: &Cli, outputs: Option<&PathBuf>) -> anyhow::Result<()> {
    let config = resolve(cli, true).await?;
    let plan = Plan::build(&config)?;

    let context = AwsContext::new(
        Some(config.accounts.region.clone()),
        cli.profile.clone(),
    );
    let identity = IamClient::new(&context).await;
    let parameter_store = SsmClient::new(&context).await;
    let cloudformation = CloudFormationClient::new(&context).await;

    let report = plan::apply(&plan, &identity, &parameter_store, &cloudformation)
        .await
        .with_context(|| format!("setup of {} failed", plan.pipeline.name))?;

    if let Some(path) = outputs {
        writer::write_json(path, &report.exports.to_map())?;
    }

    println!("OIDC provider  {}", report.trust.provider_arn());
    println!("Role           {}", report.trust.role_arn());
    println!("Parameters     {}", report.parameters.len());
    for export in report.exports.iter() {
        println!("Export         {} = {}", export.name, export.value);
    }

    return Ok(());
}

async fn run_status(cli: &Cli) -> anyhow::Result<()> {
    let config = resolve(cli, false).await?;

    let mut targets = Vec::new();
    for (label, account) in config.accounts.labelled() {
        let profile = config
            .profile_for(label)
            .map(str::to_string)
            .or_else(|| cli.profile.clone());
        let context = AwsContext::new(Some(config.accounts.region.clone()), profile);
        targets.push(Target {
            label: label.to_string(),
            account: account.clone(),
            api: CloudFormationClient::new(&context).await,
        });
    }

    let statuses = bootstrap::probe_all(&targets).await?;
    for status in statuses {
        println!("{:<10} {}  {}", status.label, status.account, status.state);
    }

    return Ok(());
}
