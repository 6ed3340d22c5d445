//! Runtime command line construction.
//!
//! The runtime is invoked as
//!
//! ```text
//! <runtime> run <flags...> <bootstrap> ws://<host>:<port> script <source>
//! <runtime> run <flags...> <bootstrap> ws://<host>:<port> import <url>
//! ```

use std::net::SocketAddr;

use url::Url;

use crate::options::{Grant, Permissions, WorkerOptions};

/// The code a worker runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// Source text evaluated directly.
    Inline(String),
    /// A module imported by URL.
    Import(Url),
}

impl Script {
    pub fn inline(source: impl Into<String>) -> Self {
        Script::Inline(source.into())
    }

    fn kind(&self) -> &'static str {
        match self {
            Script::Inline(_) => "script",
            Script::Import(_) => "import",
        }
    }

    fn payload(&self) -> String {
        match self {
            Script::Inline(source) => source.clone(),
            Script::Import(url) => url.to_string(),
        }
    }
}

/// The connect address handed to the runtime.
pub fn connect_url(address: SocketAddr) -> String {
    format!("ws://{}", address)
}

/// Full argument list for the runtime, excluding the program itself.
pub fn runtime_args(options: &WorkerOptions, address: SocketAddr, script: &Script) -> Vec<String> {
    let mut args = vec!["run".to_string()];

    args.extend(options.reload.to_flag("reload"));
    if options.unstable {
        args.push("--unstable".to_string());
    }
    if !options.v8_flags.is_empty() {
        args.push(format!("--v8-flags={}", options.v8_flags.join(",")));
    }
    if let Some(path) = &options.import_map {
        args.push(format!("--import-map={}", path));
    }
    if let Some(path) = &options.lock_file {
        args.push(format!("--lock={}", path));
    }
    if options.cached_only {
        args.push("--cached-only".to_string());
    }
    if options.no_check {
        args.push("--no-check".to_string());
    }
    args.extend(
        options
            .unsafely_ignore_certificate_errors
            .to_flag("unsafely-ignore-certificate-errors"),
    );
    if let Some(location) = &options.location {
        args.push(format!("--location={}", location));
    }
    args.extend(options.extra_flags.iter().cloned());
    permission_flags(&options.permissions, address, &mut args);

    args.push(options.bootstrap_script.clone());
    args.push(connect_url(address));
    args.push(script.kind().to_string());
    args.push(script.payload());
    args
}

fn permission_flags(permissions: &Permissions, address: SocketAddr, args: &mut Vec<String>) {
    if permissions.allow_all {
        args.push("--allow-all".to_string());
    }

    // The runtime must always be able to reach the worker's socket.
    let net = match &permissions.allow_net {
        Grant::Flag(true) => Grant::Flag(true),
        Grant::Flag(false) => Grant::List(vec![address.to_string()]),
        Grant::List(hosts) => Grant::List(
            std::iter::once(address.to_string())
                .chain(hosts.iter().cloned())
                .collect(),
        ),
    };
    args.extend(net.to_flag("allow-net"));

    args.extend(permissions.allow_read.to_flag("allow-read"));
    args.extend(permissions.allow_write.to_flag("allow-write"));
    args.extend(permissions.allow_env.to_flag("allow-env"));
    args.extend(permissions.allow_run.to_flag("allow-run"));
    if permissions.allow_hrtime {
        args.push("--allow-hrtime".to_string());
    }

    args.extend(permissions.deny_net.to_flag("deny-net"));
    args.extend(permissions.deny_read.to_flag("deny-read"));
    args.extend(permissions.deny_write.to_flag("deny-write"));
    args.extend(permissions.deny_env.to_flag("deny-env"));
    args.extend(permissions.deny_run.to_flag("deny-run"));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4567".parse().unwrap()
    }

    #[test]
    fn minimal_invocation() {
        let args = runtime_args(&WorkerOptions::default(), addr(), &Script::inline("1 + 1"));
        assert_eq!(
            args,
            vec![
                "run",
                "--allow-net=127.0.0.1:4567",
                "bootstrap.ts",
                "ws://127.0.0.1:4567",
                "script",
                "1 + 1",
            ]
        );
    }

    #[test]
    fn import_script() {
        let url = Url::parse("https://example.com/mod.ts").unwrap();
        let args = runtime_args(&WorkerOptions::default(), addr(), &Script::Import(url));
        assert_eq!(
            &args[args.len() - 2..],
            &["import", "https://example.com/mod.ts"]
        );
    }

    #[test]
    fn net_list_keeps_loopback_first() {
        let options = WorkerOptions::default().with_permissions(Permissions {
            allow_net: ["example.com"].into_iter().collect(),
            ..Permissions::default()
        });
        let args = runtime_args(&options, addr(), &Script::inline(""));
        assert!(args.contains(&"--allow-net=127.0.0.1:4567,example.com".to_string()));
    }

    #[test]
    fn unrestricted_net() {
        let options = WorkerOptions::default().with_permissions(Permissions {
            allow_net: Grant::Flag(true),
            ..Permissions::default()
        });
        let args = runtime_args(&options, addr(), &Script::inline(""));
        assert!(args.contains(&"--allow-net".to_string()));
    }

    #[test]
    fn every_flag_in_order() {
        let options = WorkerOptions {
            runtime_executable: "deno".into(),
            bootstrap_script: "boot.ts".into(),
            reload: Grant::Flag(true),
            unstable: true,
            v8_flags: vec!["--max-old-space-size=64".into(), "--expose-gc".into()],
            import_map: Some("map.json".into()),
            lock_file: Some("lock.json".into()),
            cached_only: true,
            no_check: true,
            unsafely_ignore_certificate_errors: ["localhost"].into_iter().collect(),
            location: Some("https://example.com/".into()),
            extra_flags: vec!["--quiet".into()],
            permissions: Permissions {
                allow_all: true,
                allow_read: Grant::Flag(true),
                allow_write: ["/tmp"].into_iter().collect(),
                allow_env: Grant::Flag(true),
                allow_run: ["git"].into_iter().collect(),
                allow_hrtime: true,
                deny_net: ["evil.com"].into_iter().collect(),
                deny_read: Grant::Flag(true),
                deny_write: Grant::Flag(true),
                deny_env: ["SECRET"].into_iter().collect(),
                deny_run: Grant::Flag(true),
                ..Permissions::default()
            },
            ..WorkerOptions::default()
        };

        let args = runtime_args(&options, addr(), &Script::inline("code"));
        assert_eq!(
            args,
            vec![
                "run",
                "--reload",
                "--unstable",
                "--v8-flags=--max-old-space-size=64,--expose-gc",
                "--import-map=map.json",
                "--lock=lock.json",
                "--cached-only",
                "--no-check",
                "--unsafely-ignore-certificate-errors=localhost",
                "--location=https://example.com/",
                "--quiet",
                "--allow-all",
                "--allow-net=127.0.0.1:4567",
                "--allow-read",
                "--allow-write=/tmp",
                "--allow-env",
                "--allow-run=git",
                "--allow-hrtime",
                "--deny-net=evil.com",
                "--deny-read",
                "--deny-write",
                "--deny-env=SECRET",
                "--deny-run",
                "boot.ts",
                "ws://127.0.0.1:4567",
                "script",
                "code",
            ]
        );
    }
}
