use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use lofi_core::{
    model::save_checkpoint, AppConfig, ArchitectureConfig, EffectParameters, LofiNet, Mood,
    Session,
};
use tracing_subscriber::EnvFilter;

fn main() -> lofi_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };

    match cli.command {
        Commands::Generate {
            input,
            output,
            params,
            model,
        } => run_generate(config, &input, &output, &params, &model),
        Commands::Analyze {
            input,
            output,
            model,
        } => run_analyze(config, &input, output.as_deref(), &model),
        Commands::InitModel { arch, output, seed } => run_init_model(&arch, &output, seed),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

fn run_generate(
    mut config: AppConfig,
    input: &Path,
    output: &Path,
    params: &ParamArgs,
    model: &ModelArgs,
) -> lofi_core::Result<()> {
    model.apply(&mut config);
    let session = Session::load(&config)?;
    let report = session.generate(input, output, params.resolve()?)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    session.close();
    Ok(())
}

fn run_analyze(
    mut config: AppConfig,
    input: &Path,
    output: Option<&Path>,
    model: &ModelArgs,
) -> lofi_core::Result<()> {
    model.apply(&mut config);
    let session = Session::load(&config)?;
    let report = session.analyze(input)?;
    let json = serde_json::to_string_pretty(&report)?;
    match output {
        Some(path) => {
            std::fs::write(path, &json)?;
            tracing::info!(path = %path.display(), "analysis written");
        }
        None => println!("{json}"),
    }
    session.close();
    Ok(())
}

fn run_init_model(arch: &Path, output: &Path, seed: u64) -> lofi_core::Result<()> {
    let mut config = ArchitectureConfig::load(arch)?;
    let net = LofiNet::new_seeded(config.model_architecture.clone(), seed)?;
    save_checkpoint(&net, output)?;
    config.num_parameters = net.num_parameters();
    config.save(arch)?;
    tracing::info!(
        checkpoint = %output.display(),
        parameters = config.num_parameters,
        seed,
        "initialised model"
    );
    Ok(())
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Turns audio into lofi", long_about = None)]
struct Cli {
    /// JSON configuration file; defaults apply when omitted.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Transform an audio file and write the lofi rendition.
    Generate {
        /// Source WAV file.
        input: PathBuf,
        /// Destination WAV file.
        output: PathBuf,
        #[command(flatten)]
        params: ParamArgs,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Print the features of an audio file and the parameters they imply.
    Analyze {
        input: PathBuf,
        /// Write the JSON report here instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Write a freshly initialised checkpoint for an architecture config.
    InitModel {
        /// Architecture config; its parameter count is updated in place.
        #[arg(long)]
        arch: PathBuf,
        /// Checkpoint to create.
        #[arg(short, long)]
        output: PathBuf,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Args, Debug)]
struct ParamArgs {
    /// Effect parameters JSON file. Takes precedence over the flags below.
    #[arg(long)]
    params: Option<PathBuf>,
    #[arg(long)]
    chill: Option<f32>,
    #[arg(long)]
    beat: Option<f32>,
    #[arg(long)]
    vintage: Option<f32>,
    /// relaxed, focus or sleep.
    #[arg(long)]
    mood: Option<String>,
}

impl ParamArgs {
    /// `None` lets the session analyse the input instead.
    fn resolve(&self) -> lofi_core::Result<Option<EffectParameters>> {
        if let Some(path) = &self.params {
            return EffectParameters::load(path).map(Some);
        }
        if self.chill.is_none() && self.beat.is_none() && self.vintage.is_none() && self.mood.is_none()
        {
            return Ok(None);
        }
        let defaults = EffectParameters::default();
        let mood = match &self.mood {
            Some(label) => label.parse::<Mood>()?,
            None => defaults.mood(),
        };
        Ok(Some(EffectParameters::new(
            self.chill.unwrap_or(defaults.chill_level()),
            self.beat.unwrap_or(defaults.beat_intensity()),
            self.vintage.unwrap_or(defaults.vintage_effect()),
            mood,
        )))
    }
}

#[derive(Args, Debug)]
struct ModelArgs {
    /// Model checkpoint.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Architecture config paired with the checkpoint.
    #[arg(long)]
    arch: Option<PathBuf>,
    /// Render through the neural model instead of the effect chain.
    #[arg(long)]
    neural: bool,
}

impl ModelArgs {
    fn apply(&self, config: &mut AppConfig) {
        if let Some(model) = &self.model {
            config.model.checkpoint = Some(model.clone());
        }
        if let Some(arch) = &self.arch {
            config.model.architecture = Some(arch.clone());
        }
        if self.neural {
            config.model.use_neural_model = true;
        }
    }
}
