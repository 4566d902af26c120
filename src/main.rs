use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

use gadget_image::config::AppConfig;
use gadget_image::error::{EXIT_FAILURE, Error};
use gadget_image::pipeline::{BuildOptions, ImageSource, Pipeline, Step, StepContext, StopAt};
use gadget_image::prepare::Validation;
use gadget_image::size::ImageSizeSpec;

const EXIT_CODES: &str = "\
Exit codes:
  0  success
  1  other failure
  2  command-line usage error (including a malformed --image-size)
  3  gadget.yaml validation failure
  4  layout resolution failure
  5  external tool failure
  6  --resume without a usable checkpoint";

#[derive(Parser)]
#[command(name = "gadget-image")]
#[command(about = "Build bootable disk images from a gadget description", long_about = None)]
#[command(after_help = EXIT_CODES)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build from a model assertion via `snap prepare-image`
    Snap {
        /// Model assertion file
        #[arg(
            value_name = "MODEL",
            required_unless_present = "resume",
            conflicts_with = "resume"
        )]
        model: Option<PathBuf>,

        /// Snap channel to build from
        #[arg(short, long)]
        channel: Option<String>,

        /// Extra snap to include (repeatable)
        #[arg(long = "snap", value_name = "SNAP")]
        snaps: Vec<String>,

        /// cloud-init user data to seed the image with
        #[arg(long, value_name = "FILE")]
        cloud_init: Option<PathBuf>,

        /// Disable console-conf on the resulting image
        #[arg(long, conflicts_with = "resume")]
        disable_console_conf: bool,

        /// Hint that the image is meant to boot in a device factory
        #[arg(long, conflicts_with = "resume")]
        factory_image: bool,

        /// Enforce or ignore validation-set assertions (enforce, ignore)
        #[arg(long, value_name = "MODE", conflicts_with = "resume")]
        validation: Option<Validation>,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// Build from an already unpacked gadget tree
    Tree {
        /// Directory holding meta/gadget.yaml
        #[arg(
            value_name = "GADGET_TREE",
            required_unless_present = "resume",
            conflicts_with = "resume"
        )]
        gadget_tree: Option<PathBuf>,

        #[command(flatten)]
        build: BuildArgs,
    },

    /// List the build steps in order
    Steps,

    /// Generate configuration file (.gadget-image.toml) in current directory
    Genconfig {
        /// Force overwrite existing configuration file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Args)]
struct BuildArgs {
    /// Persistent working directory (required for --until, --thru, --resume)
    #[arg(short, long, value_name = "DIR")]
    workdir: Option<PathBuf>,

    /// Stop before this step (name or 1-based number)
    #[arg(
        short,
        long,
        value_name = "STEP",
        requires = "workdir",
        conflicts_with_all = ["thru", "resume"]
    )]
    until: Option<Step>,

    /// Stop after this step (name or 1-based number)
    #[arg(
        short,
        long,
        value_name = "STEP",
        requires = "workdir",
        conflicts_with = "resume"
    )]
    thru: Option<Step>,

    /// Continue from the checkpoint in the working directory
    #[arg(short, long, requires = "workdir")]
    resume: bool,

    /// Image size: SIZE, or comma separated VOLUME:SIZE entries
    #[arg(short, long, value_name = "SIZE-SPEC", conflicts_with = "resume")]
    image_size: Option<ImageSizeSpec>,

    /// Directory the finished images are written to
    #[arg(short = 'O', long, value_name = "DIR", conflicts_with = "resume")]
    output_dir: Option<PathBuf>,

    /// Write the absolute paths of the finished images to FILE
    #[arg(long, value_name = "FILE", conflicts_with = "resume")]
    image_file_list: Option<PathBuf>,
}

impl BuildArgs {
    fn stop(&self) -> Option<StopAt> {
        self.until
            .map(StopAt::Until)
            .or(self.thru.map(StopAt::Thru))
    }
}

fn init_logger(debug: bool) {
    // Default info level, display file line number and time
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.format(|buf, record| {
        use std::io::Write;
        let level_style = buf.default_level_style(record.level());
        writeln!(
            buf,
            "[{} {level_style}{}{level_style:#} {}:{}] {level_style}{}{level_style:#}",
            chrono::Local::now().format("%H:%M:%S"),
            record.level(),
            record.target(),
            record.line().unwrap_or(0),
            record.args()
        )
    });
    if debug {
        builder.filter_level(log::LevelFilter::Debug);
    }
    builder.init();
}

fn load_config() -> AppConfig {
    match AppConfig::discover(Path::new(".")) {
        Ok(Some((path, cfg))) => {
            let abs_path = std::fs::canonicalize(&path).unwrap_or(path);
            info!("Using configuration file: {}", abs_path.display());
            cfg
        }
        Ok(None) => AppConfig::default(),
        Err(e) => {
            error!("Failed to load configuration file: {:#}, using defaults", e);
            AppConfig::default()
        }
    }
}

fn progress_bar() -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(Step::ALL.len() as u64);
    if let Ok(style) = ProgressStyle::with_template("{spinner:.green} [{bar:30.cyan/blue}] {pos}/{len} {msg}") {
        pb.set_style(style.progress_chars("=>-"));
    }
    pb
}

fn build(source: Option<ImageSource>, args: BuildArgs, config: &AppConfig) -> Result<()> {
    let pipeline = Pipeline::new(StepContext {
        tools: config.tools(),
    })
    .with_progress(progress_bar());

    let outcome = if args.resume {
        let workdir = args
            .workdir
            .as_deref()
            .context("--resume requires --workdir")?;
        pipeline.resume(workdir, None)?
    } else {
        let source = source.context("no image source given")?;
        let defaults = config.build();

        let mut options = BuildOptions::new(source);
        options.image_size = match args.image_size.clone() {
            Some(spec) => Some(spec),
            None => defaults
                .image_size
                .as_deref()
                .map(|text| text.parse::<ImageSizeSpec>().map_err(Error::from))
                .transpose()?,
        };
        options.output_dir = args.output_dir.clone().or(defaults.output_dir);
        options.image_file_list = args.image_file_list.clone();
        pipeline.start(options, args.workdir.as_deref(), args.stop())?
    };

    if outcome.finished {
        for path in &outcome.state.outputs {
            info!("Image ready: {}", path.display());
        }
    } else if let Some(step) = outcome.state.last_completed {
        info!(
            "Stopped after step {} ({step}); continue with --resume --workdir {}",
            step.ordinal(),
            outcome.state.workdir.display()
        );
    } else {
        info!(
            "Stopped before the first step; continue with --resume --workdir {}",
            outcome.state.workdir.display()
        );
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Snap {
            model,
            channel,
            snaps,
            cloud_init,
            disable_console_conf,
            factory_image,
            validation,
            build: args,
        } => {
            let config = load_config();
            let source = model.map(|model| ImageSource::Model {
                model,
                channel: channel.or(config.build().channel),
                snaps,
                cloud_init,
                disable_console_conf,
                factory_image,
                validation,
            });
            build(source, args, &config)
        }

        Commands::Tree {
            gadget_tree,
            build: args,
        } => {
            let config = load_config();
            build(gadget_tree.map(ImageSource::GadgetTree), args, &config)
        }

        Commands::Steps => {
            for step in Step::ALL {
                println!("{:>2}  {:<22} {}", step.ordinal(), step.name(), step.description());
            }
            Ok(())
        }

        Commands::Genconfig { force } => {
            AppConfig::generate_config_file(Path::new("."), force)?;
            Ok(())
        }
    }
}

fn main() {
    let cli = Cli::parse();
    init_logger(cli.debug);

    if let Err(e) = run(cli) {
        error!("Error: {:#}", e);
        let code = e
            .downcast_ref::<Error>()
            .map_or(EXIT_FAILURE, Error::exit_code);
        std::process::exit(code);
    }
}
