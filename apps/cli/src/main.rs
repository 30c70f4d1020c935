use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use mdfu_core::events::{MdfuEvent, MdfuObserver};
use mdfu_core::image::FileImageReader;
use mdfu_core::protocol::constants::PROTOCOL_VERSION;
use mdfu_core::session::MdfuSession;
use mdfu_core::tools::{ToolConfig, ToolKind, build_transport, tools_help};
use tracing::error;

/// Number of attempts for every MDFU command exchange.
const SEND_RETRIES: u32 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "mdfu",
    author,
    version,
    about = "Microchip Device Firmware Update host tool",
    long_about = "Drives an embedded MDFU client through a complete firmware update \
                  over serial, network, SPI or I2C."
)]
struct Cli {
    /// Logging verbosity/severity level
    #[arg(
        short = 'v',
        long = "verbose",
        global = true,
        value_enum,
        default_value_t = Verbosity::Info
    )]
    verbose: Verbosity,

    /// Print release details and exit
    #[arg(short = 'R', long = "release-info")]
    release_info: bool,

    #[command(subcommand)]
    action: Option<Action>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Verbosity {
    Error,
    Warning,
    Info,
    Debug,
}

impl Verbosity {
    fn level(self) -> tracing::Level {
        match self {
            Verbosity::Error => tracing::Level::ERROR,
            Verbosity::Warning => tracing::Level::WARN,
            Verbosity::Info => tracing::Level::INFO,
            Verbosity::Debug => tracing::Level::DEBUG,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Action {
    /// Perform a firmware update
    Update {
        /// Firmware update image file
        #[arg(long)]
        image: PathBuf,
        #[command(flatten)]
        tool: ToolArgs,
    },
    /// Get MDFU client information
    ClientInfo {
        #[command(flatten)]
        tool: ToolArgs,
    },
    /// Get help on tool specific parameters
    ToolsHelp,
    /// Ask the client to switch operating mode
    ChangeMode {
        #[command(flatten)]
        tool: ToolArgs,
    },
    /// Read the firmware image back from the client
    Dump {
        /// Output file for the dumped image
        #[arg(long)]
        image: PathBuf,
        #[command(flatten)]
        tool: ToolArgs,
    },
}

#[derive(Args, Debug, Clone)]
struct ToolArgs {
    /// Tool to connect with: serial, network, spidev, i2cdev
    #[arg(long)]
    tool: String,

    /// TOML file with tool parameters; explicit flags override it
    #[arg(short = 'c', long = "config-file")]
    config_file: Option<PathBuf>,

    /// Serial port, e.g. /dev/ttyACM0 (serial tool)
    #[arg(long)]
    port: Option<String>,

    /// Serial baud rate, e.g. 115200 (serial tool)
    #[arg(long)]
    baudrate: Option<u32>,

    /// Tunnel host, e.g. 127.0.0.1 (network tool)
    #[arg(long)]
    host: Option<String>,

    /// Tunnel TCP port, e.g. 5559 (network tool)
    #[arg(long)]
    tcp_port: Option<u16>,

    /// Device node, e.g. /dev/spidev0.0 or /dev/i2c-0 (spidev/i2cdev tools)
    #[arg(long)]
    dev: Option<String>,

    /// SPI clock speed in Hz, e.g. 1000000 (spidev tool)
    #[arg(long)]
    clk_speed: Option<u32>,

    /// SPI mode, one of [0, 1, 2, 3] (spidev tool)
    #[arg(long)]
    mode: Option<u8>,

    /// I2C client address (i2cdev tool)
    #[arg(long)]
    address: Option<u16>,
}

impl ToolArgs {
    /// Resolve the tool choice and its parameters, merging an optional
    /// config file under the explicit flags.
    fn resolve(&self) -> Result<(ToolKind, ToolConfig)> {
        let kind = ToolKind::from_str(&self.tool)?;
        let flags = ToolConfig {
            port: self.port.clone(),
            baudrate: self.baudrate,
            host: self.host.clone(),
            tcp_port: self.tcp_port,
            dev: self.dev.clone(),
            clk_speed: self.clk_speed,
            mode: self.mode,
            address: self.address,
        };
        let config = match &self.config_file {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {} failed", path.display()))?;
                let file: ToolConfig = toml::from_str(&text)
                    .with_context(|| format!("parsing config file {} failed", path.display()))?;
                file.merged_with(&flags)
            }
            None => flags,
        };
        Ok((kind, config))
    }

    fn open_session(&self, observer: Arc<CliObserver>) -> Result<MdfuSession<CliObserver>> {
        let (kind, config) = self.resolve()?;
        let transport = build_transport(kind, &config)?;
        let mut session = MdfuSession::with_observer(transport, SEND_RETRIES, observer);
        session.open().context("connecting to tool failed")?;
        Ok(session)
    }
}

/// Observer that renders session progress on stderr.
struct CliObserver {
    verbose: bool,
    total: Option<u64>,
}

impl MdfuObserver for CliObserver {
    fn on_event(&self, event: &MdfuEvent) {
        match event {
            MdfuEvent::Phase { phase } => {
                if self.verbose {
                    eprintln!("→ {phase}");
                }
            }
            MdfuEvent::Progress { sent } => match self.total {
                Some(total) if total > 0 => {
                    let pct = (sent * 100) / total;
                    eprint!("\r[{pct:>3}%] {sent} of {total} bytes");
                    if *sent >= total {
                        eprintln!();
                    }
                }
                _ => eprint!("\r{sent} bytes transferred"),
            },
            MdfuEvent::Complete => {
                eprintln!("✓ Update complete");
            }
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(cli.verbose.level().into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    if cli.release_info {
        println!("mdfu version: {}", env!("CARGO_PKG_VERSION"));
        println!("MDFU protocol version: {PROTOCOL_VERSION}");
        return;
    }

    let Some(action) = cli.action else {
        Cli::command().print_help().ok();
        std::process::exit(1);
    };

    if let Err(e) = run(action, cli.verbose) {
        error!("{e:#}");
        eprintln!("✗ FAILED: {e:#}");
        std::process::exit(1);
    }
}

fn run(action: Action, verbosity: Verbosity) -> Result<()> {
    let verbose = verbosity == Verbosity::Debug;
    match action {
        Action::Update { image, tool } => {
            let mut reader = FileImageReader::open(&image)
                .with_context(|| format!("opening image file {} failed", image.display()))?;
            let observer = Arc::new(CliObserver {
                verbose,
                total: reader.len().ok(),
            });
            let mut session = tool.open_session(observer)?;
            let result = session
                .run_update(&mut reader)
                .context("firmware update failed");
            // The session releases the link before the image source closes.
            let closed = session.close();
            drop(reader);
            result?;
            closed?;
            println!("Firmware update completed successfully");
            Ok(())
        }
        Action::ClientInfo { tool } => {
            let observer = Arc::new(CliObserver {
                verbose,
                total: None,
            });
            let mut session = tool.open_session(observer)?;
            let result = session
                .get_client_info()
                .context("failed to get client info");
            let closed = session.close();
            let info = result?;
            closed?;
            print!("{info}");
            Ok(())
        }
        Action::ToolsHelp => {
            print!("{}", tools_help());
            Ok(())
        }
        Action::ChangeMode { tool } => {
            let observer = Arc::new(CliObserver {
                verbose,
                total: None,
            });
            let mut session = tool.open_session(observer)?;
            let result = session.run_change_mode().context("change mode failed");
            let closed = session.close();
            result?;
            closed?;
            println!("Mode change completed successfully");
            Ok(())
        }
        Action::Dump { .. } => {
            bail!(
                "image dump is not supported: MDFU protocol version {PROTOCOL_VERSION} \
                 defines no image read-back command"
            )
        }
    }
}
