// phonepatch -- radio to telephony bridge daemon.
//
// Usage:
//   phonepatch -c /etc/phonepatch/vhf.toml run
//   phonepatch -c /etc/phonepatch/vhf.toml outcall 5551234
//   phonepatch dtmf generate 123# > keys.raw
//   phonepatch dtmf decode < keys.raw
//   phonepatch -c /etc/phonepatch/vhf.toml radio ptt on
//   phonepatch -c /etc/phonepatch/vhf.toml radio carrier
//   phonepatch -c /etc/phonepatch/vhf.toml radio serve
//   phonepatch ctcss 1Z

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use phonepatch::config::secs;
use phonepatch::lifecycle::{self, PidFile};
use phonepatch::session::OutcallOutcome;
use phonepatch::{Config, ControlPlane, SessionController, Station};
use phonepatch_core::dtmf::symbols_to_string;
use phonepatch_core::{
    lookup_frequency, DtmfDecoder, DtmfGenerator, PcmFormat, RadioControl,
    DEFAULT_CARRIER_TIMEOUT,
};
use phonepatch_transport::RadioPort;

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Bridge a two-way radio to a telephone line.
#[derive(Parser)]
#[command(name = "phonepatch", version, about)]
struct Cli {
    /// Configuration file.
    #[arg(short, long, default_value = "/etc/phonepatch/phonepatch.toml")]
    config: PathBuf,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Log warnings and errors only.
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon.
    Run,

    /// Place one outcall as if `number` had been dialed on the radio.
    Outcall { number: String },

    /// DTMF tone tools working on raw PCM in the configured format.
    Dtmf {
        #[command(subcommand)]
        action: DtmfAction,
    },

    /// Drive the radio control interface directly.
    Radio {
        #[command(subcommand)]
        action: RadioAction,
    },

    /// Print the frequency of a CTCSS tone code.
    Ctcss { code: String },
}

#[derive(Subcommand)]
enum DtmfAction {
    /// Write the tones for `keys` to stdout.
    Generate {
        keys: String,
        /// Seconds per tone.
        #[arg(long, default_value_t = 0.1)]
        tone: f64,
        /// Seconds of silence between tones.
        #[arg(long, default_value_t = 0.05)]
        gap: f64,
        /// Amplitude, 0.0 to 1.0.
        #[arg(long, default_value_t = 0.5)]
        gain: f32,
    },

    /// Read PCM from stdin and print the decoded keys.
    Decode,
}

#[derive(Subcommand)]
enum RadioAction {
    /// Key or unkey the transmitter.
    Ptt { state: PttState },

    /// Print the carrier detect state.
    Carrier,

    /// Answer `set ptt on|off` and `get carrier` requests on stdin/stdout.
    Serve,
}

#[derive(Clone, Copy, ValueEnum)]
enum PttState {
    On,
    Off,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    match cli.command {
        Command::Run => run_daemon(&cli.config, None).await,
        Command::Outcall { number } => run_daemon(&cli.config, Some(number)).await,
        Command::Dtmf { action } => dtmf(&cli.config, action).await,
        Command::Radio { action } => radio(&cli.config, action).await,
        Command::Ctcss { code } => {
            match lookup_frequency(&code).with_context(|| format!("tone {code:?}"))? {
                Some(hz) => println!("{hz:.1}"),
                None => println!("off"),
            }
            Ok(())
        }
    }
}

fn init_logging(verbose: bool, quiet: bool) {
    let default = match (verbose, quiet) {
        (true, _) => "debug",
        (_, true) => "warn",
        _ => "info",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_config(path: &Path) -> Result<Arc<Config>> {
    let config = Config::load(path).with_context(|| format!("loading {}", path.display()))?;
    Ok(Arc::new(config))
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

async fn run_daemon(config_path: &Path, outcall: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let run_dir = &config.station.run_dir;
    std::fs::create_dir_all(run_dir)
        .with_context(|| format!("creating {}", run_dir.display()))?;
    let _pidfile = PidFile::create(&lifecycle::pidfile_path(&config))?;

    let cancel = CancellationToken::new();
    let signals = lifecycle::spawn_signal_handler(cancel.clone())?;

    let station = Station::open(config.clone())
        .await
        .context("opening radio interface")?;
    let controller = SessionController::new(station, cancel.clone());

    let plane = ControlPlane::bind(&lifecycle::control_path(&config), controller.clone())
        .context("binding control socket")?;
    let serving = tokio::spawn({
        let cancel = cancel.clone();
        async move { plane.serve(&cancel).await }
    });
    info!(station = %config.station.name, "phonepatch started");

    let result = match outcall {
        None => controller.run().await,
        Some(number) => match controller.test_outcall(&number).await {
            Ok(outcome) => {
                match outcome {
                    OutcallOutcome::Connected => info!(%number, "Test outcall connected"),
                    OutcallOutcome::Handled => info!(%number, "Test outcall finished"),
                }
                Ok(())
            }
            Err(e) => Err(e),
        },
    };

    cancel.cancel();
    match serving.await {
        Ok(Err(e)) => error!(error = %e, "Control socket failed"),
        Err(e) => error!(error = %e, "Control socket task panicked"),
        Ok(Ok(())) => {}
    }
    signals.abort();
    if let Err(e) = controller.shutdown().await {
        error!(error = %e, "Radio close failed");
    }
    info!("phonepatch stopped");
    result.map_err(Into::into)
}

// ---------------------------------------------------------------------------
// DTMF tools
// ---------------------------------------------------------------------------

/// The configuration for the offline tools: the file if it loads, the
/// defaults (telephony format) otherwise.
fn tool_config(config_path: &Path) -> Config {
    Config::load(config_path).unwrap_or_default()
}

async fn dtmf(config_path: &Path, action: DtmfAction) -> Result<()> {
    let config = tool_config(config_path);
    let format = config.pcm_format().unwrap_or_else(|_| PcmFormat::telephony());
    let buffer_size = config.station.buffer_size;
    match action {
        DtmfAction::Generate {
            keys,
            tone,
            gap,
            gain,
        } => {
            let tone = secs(tone);
            if tone.is_zero() {
                bail!("tone length must be positive");
            }
            let generator = DtmfGenerator::new(format, buffer_size);
            let buffers = generator
                .encode_str(&keys, tone, secs(gap), gain.clamp(0.0, 1.0))
                .with_context(|| format!("keys {keys:?}"))?;
            let mut stdout = tokio::io::stdout();
            for buf in buffers {
                stdout.write_all(&buf).await?;
            }
            stdout.flush().await?;
        }
        DtmfAction::Decode => {
            let mut decoder = DtmfDecoder::new(format, config.dtmf.sensitivity)?;
            let mut stdin = tokio::io::stdin();
            let mut buf = vec![0u8; buffer_size];
            let mut heard = Vec::new();
            loop {
                let n = stdin.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                heard.extend(decoder.decode(&buf[..n]));
            }
            println!("{}", symbols_to_string(&heard));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Radio tools
// ---------------------------------------------------------------------------

async fn radio(config_path: &Path, action: RadioAction) -> Result<()> {
    let config = load_config(config_path)?;
    let mut port = RadioPort::open(&config.radio.spec())
        .await
        .context("opening radio interface")?;
    info!(kind = port.kind(), "Radio interface open");

    let result = match action {
        RadioAction::Ptt { state } => {
            let on = matches!(state, PttState::On);
            port.set_ptt(on).await.map(|()| {
                println!("ptt {}", if on { "on" } else { "off" });
            })
        }
        RadioAction::Carrier => port
            .get_carrier(DEFAULT_CARRIER_TIMEOUT)
            .await
            .map(|carrier| println!("carrier {}", u8::from(carrier))),
        RadioAction::Serve => {
            let input = BufReader::new(tokio::io::stdin());
            phonepatch_transport::serve(&mut port, input, tokio::io::stdout()).await
        }
    };
    port.close().await.context("closing radio interface")?;
    result.context("radio command failed")
}
