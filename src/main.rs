use crate::config::{
    DEFAULT_QUEUE_CAPACITY, ExitPolicy, ReceiverConfig, SrtUri, StartupError, app_name,
    app_version,
};
use crate::identity::StreamIdentity;
use crate::pipeline::Supervisor;
use crate::transport::{ConnectionDescriptor, SrtSource};
use clap::{Arg, ArgAction, Command, value_parser};
use log::{info, warn};
use std::ffi::OsString;
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub mod config;
pub mod decoder;
pub mod identity;
pub mod pipeline;
pub mod transport;

/// Exit code for help, usage and startup failures.
const STARTUP_FAILURE: i32 = -1;

fn cli() -> Command {
    Command::new(app_name())
        .version(app_version())
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .override_usage(format!("{} [OPTIONS] <URI>", app_name()))
        .disable_help_flag(true)
        .disable_version_flag(true)
        .arg(
            Arg::new("uri")
                .value_name("URI")
                .help("SRT endpoint, e.g. srt://127.0.0.1:7001"),
        )
        .arg(
            Arg::new("user")
                .short('u')
                .long("user")
                .value_name("NAME")
                .help("Authorization Name"),
        )
        .arg(
            Arg::new("resource")
                .short('r')
                .long("resource")
                .value_name("NAME")
                .help("Resource Name"),
        )
        .arg(
            Arg::new("help")
                .short('h')
                .long("help")
                .action(ArgAction::SetTrue)
                .help("Show Help"),
        )
        .arg(
            Arg::new("exit-on-error")
                .long("exit-on-error")
                .action(ArgAction::SetTrue)
                .help("Exit with status 1 when the stream ends on an error"),
        )
        .arg(
            Arg::new("queue-size")
                .long("queue-size")
                .value_name("PACKETS")
                .value_parser(value_parser!(usize))
                .help("Depth of the queue at the head of every branch"),
        )
        .arg(
            Arg::new("connect-timeout")
                .long("connect-timeout")
                .value_name("SECS")
                .value_parser(value_parser!(u64))
                .help("Give up if the SRT connection is not up after this many seconds"),
        )
        .arg(
            Arg::new("video-output")
                .long("video-output")
                .value_name("FILE")
                .value_parser(value_parser!(PathBuf))
                .help("Write decoded YUV420p frames to FILE"),
        )
}

#[derive(Debug)]
enum CliOutcome {
    Run(ReceiverConfig),
    Help(String),
}

fn parse_args<I, T>(args: I) -> Result<CliOutcome, StartupError>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let mut command = cli();
    let matches = command
        .try_get_matches_from_mut(args)
        .map_err(|e| StartupError::Usage(e.to_string().trim_end().to_string()))?;

    let uri = match matches.get_one::<String>("uri") {
        Some(uri) if !matches.get_flag("help") => uri,
        _ => return Ok(CliOutcome::Help(command.render_help().to_string())),
    };

    let identity = StreamIdentity::new(
        matches.get_one::<String>("user").cloned(),
        matches.get_one::<String>("resource").cloned(),
    );
    let mut config = ReceiverConfig::new(SrtUri::parse(uri)?, identity);

    if matches.get_flag("exit-on-error") {
        config.exit_policy = ExitPolicy::Distinguish;
    }
    config.queue_capacity = match matches.get_one::<usize>("queue-size") {
        Some(0) => return Err(StartupError::Usage("--queue-size must be at least 1".into())),
        Some(size) => *size,
        None => DEFAULT_QUEUE_CAPACITY,
    };
    config.connect_timeout = matches
        .get_one::<u64>("connect-timeout")
        .map(|secs| Duration::from_secs(*secs));
    config.video_output = matches.get_one::<PathBuf>("video-output").cloned();

    Ok(CliOutcome::Run(config))
}

async fn run(config: ReceiverConfig) -> i32 {
    info!(
        "{} {}: receiving {} as {}",
        app_name(),
        app_version(),
        config.uri,
        config.identity
    );

    let exit_policy = config.exit_policy;
    let source = SrtSource::new(ConnectionDescriptor::from_config(&config));
    let supervisor = Supervisor::new(config);

    // Ctrl-C ends the run through the normal teardown path
    let interrupt = supervisor.interrupt_handle();
    if let Err(e) = ctrlc::set_handler(move || interrupt.cancel()) {
        warn!("Cannot install Ctrl-C handler: {}", e);
    }

    let report = supervisor.run(Box::new(source)).await;
    if !report.unmapped.is_empty() {
        info!("Unmapped payload types dropped: {:?}", report.unmapped);
    }

    exit_policy.exit_code(&report.termination)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match parse_args(std::env::args_os()) {
        Ok(CliOutcome::Run(config)) => config,
        Ok(CliOutcome::Help(text)) => {
            eprintln!("{}", text);
            process::exit(STARTUP_FAILURE);
        }
        Err(e) => {
            eprintln!("{}", e);
            process::exit(STARTUP_FAILURE);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to start async runtime: {}", e);
            process::exit(STARTUP_FAILURE);
        }
    };

    let code = runtime.block_on(run(config));
    process::exit(code);
}
