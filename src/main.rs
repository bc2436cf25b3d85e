use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use screenrec::commands::recording;
use screenrec::recorder::state::{RecordingMetadata, Requirement, SourceOptions};
use screenrec::{ProcessSupervisor, RecordingOptions, Settings};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "screenrec")]
#[command(
    about = "Record screen, microphone and webcam, then produce finished videos",
    long_about = None
)]
struct Cli {
    /// Directory holding the session state (default: $XDG_RUNTIME_DIR/screenrec)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start recording in the background
    Start(CaptureArgs),

    /// Record in the foreground until Ctrl-C, then process
    Record(CaptureArgs),

    /// Stop the recording and process it
    Stop {
        /// Only ask the instance that owns the recording to stop it
        #[arg(long)]
        signal_only: bool,
    },

    /// Show whether a recording is in progress
    Status {
        /// Print the status as JSON
        #[arg(long)]
        json: bool,
    },

    /// Process the partial captures of a crashed recording
    Recover,

    /// Forget a crashed recording, keeping its files
    Discard,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    Screen,
    Audio,
    Webcam,
}

#[derive(Args)]
struct CaptureArgs {
    /// Do not capture the screen
    #[arg(long)]
    no_screen: bool,

    /// Do not capture microphone audio
    #[arg(long)]
    no_audio: bool,

    /// Capture the webcam
    #[arg(short, long)]
    webcam: bool,

    /// Fail the start if this source cannot be captured
    #[arg(long, value_enum)]
    require: Vec<Source>,

    /// Monitor to capture (backend specific, e.g. ":0.0")
    #[arg(short, long, default_value = "")]
    monitor: String,

    /// Also produce a 1080x1920 composite of webcam and screen
    #[arg(long)]
    vertical: bool,

    /// Root folder for recordings
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Title used to name the output folder
    #[arg(long)]
    title: Option<String>,

    /// Topic used to name the output folder when no title is given
    #[arg(long)]
    topic: Option<String>,

    #[arg(long)]
    presenter: Option<String>,

    /// Discard a crashed recording instead of refusing to start
    #[arg(long)]
    discard_stale: bool,
}

impl CaptureArgs {
    fn source(&self, source: Source, enabled: bool) -> SourceOptions {
        SourceOptions {
            enabled,
            requirement: if self.require.contains(&source) {
                Requirement::Required
            } else {
                Requirement::Optional
            },
            device: None,
        }
    }

    fn into_options(self) -> RecordingOptions {
        RecordingOptions {
            screen: self.source(Source::Screen, !self.no_screen),
            audio: self.source(Source::Audio, !self.no_audio),
            webcam: self.source(Source::Webcam, self.webcam || self.vertical),
            monitor_id: self.monitor,
            vertical: self.vertical,
            output_root: self.output,
            metadata: RecordingMetadata {
                title: self.title,
                topic: self.topic,
                presenter: self.presenter,
            },
            discard_stale: self.discard_stale,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    screenrec::init_tracing();

    let mut settings = Settings::from_env();
    if let Some(dir) = cli.state_dir {
        settings.state_dir = dir;
    }
    let supervisor = Arc::new(ProcessSupervisor::with_system(settings));

    match cli.command {
        Commands::Start(args) => {
            recording::start(&supervisor, &args.into_options()).await?;
        }
        Commands::Record(args) => {
            recording::record(&supervisor, &args.into_options()).await?;
        }
        Commands::Stop { signal_only } => {
            recording::stop(&supervisor, signal_only).await?;
        }
        Commands::Status { json } => {
            recording::status(&supervisor, json)?;
        }
        Commands::Recover => {
            recording::recover(&supervisor).await?;
        }
        Commands::Discard => {
            recording::discard(&supervisor).await?;
        }
    }

    Ok(())
}
