// Skywatch command line

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use skywatch_lib::config::{default_config_path, Config};
use skywatch_lib::session::{self, RunOptions};
use skywatch_lib::{gstreamer_init, replay};

#[derive(Parser, Debug)]
#[command(author, version, about = "Record an RTSP camera whenever something moves")]
struct Cli {
    /// Config file (TOML). Missing files fall back to defaults.
    #[arg(long, env = "SKYWATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Watch the stream and record motion (default)
    Run(RunArgs),
    /// Run detection over a directory of numbered frames
    Replay(ReplayArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// RTSP url of the camera
    #[arg(long, env = "SKYWATCH_URL")]
    url: Option<String>,

    #[arg(long)]
    camera_id: Option<String>,

    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Pre-roll length in nanoseconds
    #[arg(long)]
    buffer_ns: Option<u64>,

    #[arg(long)]
    area_threshold: Option<f32>,

    #[arg(long)]
    iou_threshold: Option<f32>,

    #[arg(long)]
    min_hits: Option<u32>,

    #[arg(long)]
    max_age: Option<u32>,

    #[arg(long)]
    start_threshold: Option<usize>,

    #[arg(long)]
    stop_threshold: Option<usize>,

    #[arg(long)]
    cooldown_secs: Option<f64>,

    /// Do not write preview images
    #[arg(long)]
    no_previews: bool,

    /// Toggle recording with Enter on stdin
    #[arg(long)]
    manual_trigger: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(url) = &self.url {
            config.source_url = url.clone();
        }
        if let Some(id) = &self.camera_id {
            config.camera_id = id.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(v) = self.buffer_ns {
            config.recording_buffer_ns = v;
        }
        if let Some(v) = self.area_threshold {
            config.area_threshold = v;
        }
        if let Some(v) = self.iou_threshold {
            config.iou_threshold = v;
        }
        if let Some(v) = self.min_hits {
            config.tracker_min_hits = v;
        }
        if let Some(v) = self.max_age {
            config.tracker_max_age = v;
        }
        if let Some(v) = self.start_threshold {
            config.start_recording_threshold = v;
        }
        if let Some(v) = self.stop_threshold {
            config.stop_recording_threshold = v;
        }
        if let Some(v) = self.cooldown_secs {
            config.min_cooldown_secs = v;
        }
        if self.no_previews {
            config.save_previews = false;
        }
    }
}

#[derive(Args, Debug)]
struct ReplayArgs {
    /// Directory of numbered frames
    #[arg(long)]
    frames: PathBuf,

    /// Where annotated frames are written
    #[arg(long)]
    out: PathBuf,
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config_path = cli.config.unwrap_or_else(default_config_path);
    let mut config = Config::load_or_default(&config_path);

    match cli.command.unwrap_or_else(|| Command::Run(RunArgs::default())) {
        Command::Run(args) => {
            args.apply(&mut config);
            config.validate().context("invalid configuration")?;
            gstreamer_init::init_gstreamer()?;
            session::run(
                &config,
                RunOptions {
                    manual_trigger: args.manual_trigger,
                },
            )?;
        }
        Command::Replay(args) => {
            replay::replay_directory(&config, &args.frames, &args.out)?;
        }
    }
    Ok(())
}
