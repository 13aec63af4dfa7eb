//! pymol-remote - launch PyMOL behind a JSON-RPC server, or talk to one.
//!
//! `pymol-remote serve` starts PyMOL as a child process and serves its
//! commands; the other subcommands are thin clients over
//! [`pymol_remote::Session`].

mod host;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use host::PipeInterpreter;
use pymol_remote::{
    start_server, CallArgs, ConnectionCache, EnvVars, GetStateRequest, RpcConfig, ServerConfig,
    Session, SessionOptions, SetStateRequest, StateBlob, StateFormat,
};
use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "pymol-remote")]
#[command(about = "Drive a PyMOL session over JSON-RPC")]
#[command(disable_help_subcommand = true)]
struct Cli {
    /// Enable debug logging (overrides PYMOL_RPC_LOG_LEVEL)
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start PyMOL with an RPC server attached
    Serve(ServeArgs),
    /// Check that a server is alive
    Ping(ClientArgs),
    /// Call a command on the server
    Call {
        #[command(flatten)]
        client: ClientArgs,
        /// Command name
        method: String,
        /// Positional arguments; each is parsed as JSON, falling back to a string
        args: Vec<String>,
        /// Keyword argument as key=value (value parsed like positional ones)
        #[arg(long = "kw", value_name = "KEY=VALUE")]
        kwargs: Vec<String>,
    },
    /// List commands, or show help for one
    Help {
        #[command(flatten)]
        client: ClientArgs,
        command: Option<String>,
    },
    /// Fuzzy-find a command name
    Find {
        #[command(flatten)]
        client: ClientArgs,
        query: String,
    },
    /// Save the session state and write it to a file or stdout
    GetState {
        #[command(flatten)]
        client: ClientArgs,
        #[arg(long, default_value = "(all)")]
        selection: String,
        #[arg(long, default_value_t = -1, allow_hyphen_values = true)]
        state: i64,
        #[arg(long, default_value = "pdb")]
        format: StateFormat,
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Load a file into the session
    SetState {
        #[command(flatten)]
        client: ClientArgs,
        file: PathBuf,
        #[arg(long, default_value = "")]
        object: String,
        #[arg(long, default_value_t = 0)]
        state: i64,
        /// Format of FILE, any extension PyMOL loads (defaults to FILE's extension)
        #[arg(long)]
        format: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Host to bind to (0.0.0.0 accepts other machines)
    #[arg(long, env = EnvVars::HOST, default_value = RpcConfig::DEFAULT_HOST)]
    host: String,

    /// First port to try
    #[arg(short, long, env = EnvVars::PORT, default_value_t = RpcConfig::DEFAULT_PORT)]
    port: u16,

    /// Number of consecutive ports to try
    #[arg(long, env = EnvVars::N_PORTS_TO_TRY, default_value_t = RpcConfig::DEFAULT_N_PORTS_TO_TRY)]
    n_ports_to_try: u16,

    /// PyMOL executable
    #[arg(long, default_value = "pymol")]
    pymol: String,

    /// Directory for state-transfer temp files
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    /// Extra arguments passed to PyMOL (after `--`)
    #[arg(last = true)]
    host_args: Vec<String>,
}

#[derive(Args, Debug)]
struct ClientArgs {
    /// Server host
    #[arg(long, env = EnvVars::HOST, default_value = RpcConfig::DEFAULT_HOST)]
    host: String,

    /// Server port
    #[arg(short, long, env = EnvVars::PORT, default_value_t = RpcConfig::DEFAULT_PORT)]
    port: u16,

    /// Connect timeout in seconds
    #[arg(long, default_value_t = 5.0)]
    timeout: f64,
}

impl ClientArgs {
    async fn connect(&self, cache: &ConnectionCache) -> Result<Session> {
        let timeout = Duration::try_from_secs_f64(self.timeout)
            .with_context(|| format!("invalid timeout {}", self.timeout))?;
        let options = SessionOptions::new(self.host.clone(), self.port).timeout(timeout);
        Ok(Session::connect(cache, options).await?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let cache = ConnectionCache::new();
    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Ping(client) => {
            let session = client.connect(&cache).await?;
            println!("{session} is alive");
            Ok(())
        }
        Commands::Call {
            client,
            method,
            args,
            kwargs,
        } => {
            let session = client.connect(&cache).await?;
            let call_args = parse_call_args(&args, &kwargs)?;
            let result = session.invoke(&method, call_args).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Commands::Help { client, command } => {
            let session = client.connect(&cache).await?;
            println!("{}", session.help(command.as_deref()).await?);
            Ok(())
        }
        Commands::Find { client, query } => {
            let session = client.connect(&cache).await?;
            for name in session.find_command(&query).await? {
                println!("{name}");
            }
            Ok(())
        }
        Commands::GetState {
            client,
            selection,
            state,
            format,
            output,
        } => {
            let session = client.connect(&cache).await?;
            let request = GetStateRequest {
                selection,
                state,
                format,
            };
            let blob = session.get_state(&request).await?;
            match output {
                Some(path) => std::fs::write(&path, blob.as_bytes())
                    .with_context(|| format!("writing {}", path.display()))?,
                None => std::io::stdout().write_all(blob.as_bytes())?,
            }
            Ok(())
        }
        Commands::SetState {
            client,
            file,
            object,
            state,
            format,
        } => {
            let format = match format {
                Some(format) => format,
                None => format_from_extension(&file)?,
            };
            let bytes =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let blob = match format.parse::<StateFormat>() {
                Ok(known) => StateBlob::from_bytes(bytes, known)?,
                Err(_) => StateBlob::Binary(bytes),
            };

            let session = client.connect(&cache).await?;
            let request = SetStateRequest {
                object,
                state,
                format,
            };
            session.set_state(&blob, &request).await?;
            info!("Loaded {} ({} bytes)", file.display(), blob.len());
            Ok(())
        }
    }
}

fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_env(EnvVars::LOG_LEVEL).unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout carries RPC_PORT and command output.
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

async fn serve(args: ServeArgs) -> Result<()> {
    let (interpreter, mut child) = PipeInterpreter::spawn(&args.pymol, &args.host_args)?;

    let config = ServerConfig {
        host: args.host,
        port: args.port,
        n_ports_to_try: args.n_ports_to_try,
        temp_dir: args.temp_dir,
    };
    let handle = match start_server(config, Box::new(interpreter)).await {
        Ok(handle) => handle,
        Err(e) => {
            let _ = child.kill();
            return Err(e).context("starting the RPC server");
        }
    };

    // Read by scripts that launch the server
    println!("RPC_PORT={}", handle.port());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("Shutdown signal received, stopping PyMOL");
                let _ = child.kill();
                let _ = child.wait();
                return Ok(());
            }
            _ = tokio::time::sleep(Duration::from_millis(250)) => {
                if let Some(status) = child.try_wait()? {
                    info!("PyMOL exited ({}), shutting down", status);
                    return Ok(());
                }
            }
        }
    }
}

/// Build call arguments from CLI strings.
fn parse_call_args(args: &[String], kwargs: &[String]) -> Result<CallArgs> {
    let mut call_args = CallArgs::new();
    for arg in args {
        call_args = call_args.arg(parse_value(arg));
    }
    for kwarg in kwargs {
        let Some((key, value)) = kwarg.split_once('=') else {
            bail!("keyword argument `{kwarg}` is not of the form KEY=VALUE");
        };
        call_args = call_args.kwarg(key, parse_value(value));
    }
    Ok(call_args)
}

/// JSON when it parses, a plain string otherwise.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Lowercased extension of `path`; `.pdb.gz` style double extensions are kept whole.
fn format_from_extension(path: &std::path::Path) -> Result<String> {
    let Some(extension) = path.extension().and_then(|e| e.to_str()) else {
        bail!("cannot tell the format of {}; pass --format", path.display());
    };
    let extension = extension.to_lowercase();
    let inner = path
        .file_stem()
        .and_then(|stem| std::path::Path::new(stem).extension())
        .and_then(|e| e.to_str())
        .map(str::to_lowercase);
    Ok(match inner {
        Some(inner) if extension == "gz" => format!("{inner}.{extension}"),
        _ => extension,
    })
}
