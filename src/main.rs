// weft: a CNI meta-plugin. Reserves a floating ip for the pod, provisions
// the host bridge/vlan devices and composes the actual network setup out
// of downstream CNI plugins.

mod cni;
mod ipam;
mod net;

use std::io::Read;
use std::process::ExitCode;

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use cni::CmdArgs;

const CNI_VERSION: &str = "0.2.0";

/// The CNI envelope, handed over by the container runtime through the
/// environment.
#[derive(Parser, Debug)]
#[command(version, about = "Floating-ip allocator and multi-CNI delegation engine")]
struct Envelope {
    /// ADD or DEL
    #[arg(long, env = "CNI_COMMAND", value_parser = parse_command)]
    command: Command,

    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    container_id: String,

    /// Path to the pod's network namespace
    #[arg(long, env = "CNI_NETNS", default_value = "")]
    netns: String,

    #[arg(long, env = "CNI_IFNAME", default_value = "eth0")]
    ifname: String,

    /// Key-value pairs separated by semicolons
    #[arg(long, env = "CNI_ARGS", default_value = "")]
    args: String,

    /// Colon-separated plugin search path
    #[arg(long, env = "CNI_PATH", default_value = "")]
    path: String,
}

#[derive(Clone, Debug)]
enum Command {
    Add,
    Del,
}

fn parse_command(s: &str) -> Result<Command, String> {
    match s {
        "ADD" => Ok(Command::Add),
        "DEL" => Ok(Command::Del),
        _ => Err(format!("command {} not supported", s)),
    }
}

fn main() -> ExitCode {
    let _guard = setup_logging();
    let envelope = Envelope::parse();

    // Namespace entry and netlink socket state are scoped to the calling
    // OS thread; a current-thread runtime keeps the whole request on this
    // one thread.
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => return emit_error(cni::CniError::Io(e)),
    };

    let mut stdin = Vec::new();
    if let Err(e) = std::io::stdin().read_to_end(&mut stdin) {
        return emit_error(cni::CniError::Io(e));
    }

    let cmd = CmdArgs {
        container_id: envelope.container_id,
        netns: envelope.netns,
        ifname: envelope.ifname,
        args: envelope.args,
        path: envelope.path,
    };

    let outcome = match envelope.command {
        Command::Add => runtime.block_on(cni::add(&cmd, &stdin)).map(Some),
        Command::Del => runtime.block_on(cni::del(&cmd, &stdin)).map(|()| None),
    };

    match outcome {
        Ok(Some(result)) => match serde_json::to_string(&result) {
            Ok(out) => {
                println!("{}", out);
                ExitCode::SUCCESS
            }
            Err(e) => emit_error(e.into()),
        },
        Ok(None) => ExitCode::SUCCESS,
        Err(e) => emit_error(e),
    }
}

/// Per the CNI contract: result JSON on stdout on success, error JSON on
/// stderr with a non-zero exit otherwise. Never both.
fn emit_error(e: cni::CniError) -> ExitCode {
    tracing::error!("{}", e);
    let response = e.into_response(CNI_VERSION);
    match serde_json::to_string(&response) {
        Ok(out) => eprintln!("{}", out),
        Err(_) => eprintln!("{}", response.details),
    }
    ExitCode::FAILURE
}

/// Log to a rolling file: stdout belongs to the result JSON.
fn setup_logging() -> Option<WorkerGuard> {
    let dir = std::env::var("WEFT_LOG_DIR").unwrap_or_else(|_| "/var/log/weft".to_string());
    if std::fs::create_dir_all(&dir).is_err() {
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(dir, "cni.log");
    let (nonblocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(nonblocking))
        .init();
    Some(guard)
}
