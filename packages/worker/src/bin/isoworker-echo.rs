//! A stand-in runtime for exercising the worker protocol.
//!
//! Invoked with the same arguments a real runtime receives; only the last
//! three matter: `<ws://host:port> script <name>`. Supported scripts:
//!
//! - `echo`: post every message back
//! - `ping`: answer `"ping"` with `"pong"` on transferred ports, and hand
//!   out such a port on `{"type":"request_port"}`
//! - `loop`: never finish, even after the connection closes
//! - `idle`: never connect and never finish
//! - `exit:<code>`: exit immediately with `<code>`

use std::process::ExitCode;

use isoworker_structure::{MessageEvent, Side, Value};
use isoworker_transport::{connect, Multiplexer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Behavior {
    Echo,
    Ping,
    Loop,
    Idle,
    Exit(i32),
}

impl Behavior {
    fn parse(kind: &str, name: &str) -> Option<Self> {
        if kind != "script" {
            return None;
        }
        match name {
            "echo" => Some(Behavior::Echo),
            "ping" => Some(Behavior::Ping),
            "loop" => Some(Behavior::Loop),
            "idle" => Some(Behavior::Idle),
            other => other
                .strip_prefix("exit:")
                .and_then(|code| code.parse().ok())
                .map(Behavior::Exit),
        }
    }
}

fn message_type(event: &MessageEvent) -> Option<String> {
    event
        .data
        .get("type")
        .and_then(|kind| kind.as_str().map(str::to_string))
}

fn install_echo(mux: &Multiplexer) {
    let reply = mux.clone();
    mux.on_message(move |event| {
        if let Err(error) = reply.post_message(None, event.data.clone(), vec![]) {
            warn!(%error, "failed to echo message");
        }
    });
}

fn answer_pings(port: &isoworker_structure::MessagePort) {
    let reply = port.clone();
    port.on_message(move |event| {
        if event.data.as_str() == Some("ping") {
            if let Err(error) = reply.post_message("pong".into(), vec![]) {
                warn!(%error, "failed to answer ping");
            }
        }
    });
}

fn install_ping(mux: &Multiplexer) {
    let handle = mux.clone();
    mux.on_message(move |event| match message_type(event).as_deref() {
        Some("port") => {
            if let Some(Value::Port(port)) = event.data.get("port") {
                answer_pings(&port);
            }
        }
        Some("request_port") => {
            let channel = handle.channel();
            answer_pings(&channel.port1);
            let data = Value::object([
                ("type", Value::from("port")),
                ("port", Value::from(channel.port2.clone())),
            ]);
            if let Err(error) = handle.post_message(None, data, vec![channel.port2.into()]) {
                warn!(%error, "failed to send port");
            }
        }
        _ => {}
    });
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    let [url, kind, name] = match args.as_slice() {
        [.., url, kind, name] if args.len() >= 4 => [url, kind, name],
        _ => {
            error!("usage: isoworker-echo [flags...] <bootstrap> <url> script <name>");
            return ExitCode::from(2);
        }
    };
    let Some(behavior) = Behavior::parse(kind, name) else {
        error!(kind = %kind, name = %name, "unsupported script");
        return ExitCode::from(2);
    };

    let mux = Multiplexer::new(Side::Guest);
    match behavior {
        Behavior::Echo => install_echo(&mux),
        Behavior::Ping => install_ping(&mux),
        Behavior::Loop => {
            std::thread::spawn(|| loop {
                std::hint::spin_loop();
            });
        }
        Behavior::Idle => {
            info!("idling without connecting");
            std::future::pending::<()>().await;
        }
        Behavior::Exit(code) => std::process::exit(code),
    }

    info!(%url, ?behavior, "connecting");
    if let Err(error) = connect(url, mux, CancellationToken::new()).await {
        error!(%error, "connection failed");
        if behavior != Behavior::Loop {
            return ExitCode::FAILURE;
        }
    }

    if behavior == Behavior::Loop {
        std::future::pending::<()>().await;
    }
    ExitCode::SUCCESS
}
