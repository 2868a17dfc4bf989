use crate::pm::app::{AppSpec, CommandSet};
use crate::pm::cli::{self, CommandArgs, OutputFormat};
use crate::pm::rpc::{self, Request};
use clap::Parser;
use std::path::PathBuf;
use std::{env, fmt};

pub const SOCK_ENV: &str = "PIPECTL_SOCK";

#[derive(Debug, Parser)]
#[command(name = "pipectl", version, about = "pipemaster control client")]
pub struct PipectlArgs {
    /// Unix socket path to the pipemaster daemon
    #[arg(short = 's', long = "sock")]
    pub sock: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<cli::Cmd>,
}

fn resolve_sock(args: &PipectlArgs) -> anyhow::Result<PathBuf> {
    if let Some(sock) = args.sock.clone() {
        return Ok(sock);
    }
    if let Ok(v) = env::var(SOCK_ENV) {
        let t = v.trim();
        if !t.is_empty() {
            return Ok(PathBuf::from(t));
        }
    }

    anyhow::bail!("{}", MissingSockHelp);
}

struct MissingSockHelp;

impl fmt::Display for MissingSockHelp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "no pipemaster socket specified")?;
        writeln!(f)?;
        writeln!(f, "pipectl does not read the pipemaster config file.")?;
        writeln!(f, "Provide the daemon unix socket path via one of:")?;
        writeln!(f, "  - pipectl --sock /path/to/pipemaster.sock <command>")?;
        writeln!(f, "  - export {SOCK_ENV}=/path/to/pipemaster.sock")?;
        writeln!(f)?;
        writeln!(f, "Examples:")?;
        writeln!(f, "  pipectl --sock /tmp/pipemaster.sock list")?;
        writeln!(f, "  {SOCK_ENV}=/tmp/pipemaster.sock pipectl restart web --reset")?;
        Ok(())
    }
}

/// Overlay the flags that were given onto `base`.
fn merge_commands(base: CommandSet, args: CommandArgs) -> CommandSet {
    CommandSet {
        init: args.init.unwrap_or(base.init),
        build: args.build.unwrap_or(base.build),
        test: args.test.unwrap_or(base.test),
        start: args.start.unwrap_or(base.start),
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = PipectlArgs::parse();
    let sock = resolve_sock(&args)?;

    let cmd = args.cmd.unwrap_or(cli::Cmd::List {
        format: OutputFormat::Text,
    });

    match cmd {
        cli::Cmd::Create {
            id,
            path,
            commands,
            plugins,
            restart,
        } => {
            let spec = AppSpec {
                id: id.clone(),
                path,
                commands: merge_commands(CommandSet::default(), commands),
                enabled_plugins: plugins,
            };
            let resp = rpc::client_call(&sock, Request::Create { spec })?;
            cli::print_message(&resp);
            if restart {
                let resp = rpc::client_call(
                    &sock,
                    Request::Restart {
                        id,
                        hard_reset: true,
                        command_reset: true,
                    },
                )?;
                cli::print_message(&resp);
            }
            Ok(())
        }
        cli::Cmd::Update { id, commands } => {
            let current = rpc::client_call(&sock, Request::Get { id: id.clone() })?;
            let base = current
                .apps
                .into_iter()
                .next()
                .map(|a| a.commands)
                .unwrap_or_default();
            let resp = rpc::client_call(
                &sock,
                Request::Update {
                    id,
                    commands: merge_commands(base, commands),
                },
            )?;
            cli::print_message(&resp);
            Ok(())
        }
        cli::Cmd::Delete { id } => {
            let resp = rpc::client_call(&sock, Request::Delete { id })?;
            cli::print_message(&resp);
            Ok(())
        }
        cli::Cmd::Get { id, format } => {
            let resp = rpc::client_call(&sock, Request::Get { id })?;
            cli::print_response(&resp, format)
        }
        cli::Cmd::List { format } => {
            let resp = rpc::client_call(&sock, Request::List)?;
            cli::print_response(&resp, format)
        }
        cli::Cmd::Restart { id, hard, reset } => {
            let resp = rpc::client_call(
                &sock,
                Request::Restart {
                    id,
                    hard_reset: hard,
                    command_reset: reset,
                },
            )?;
            cli::print_message(&resp);
            Ok(())
        }
        cli::Cmd::Kill { id, include_init } => {
            let resp = rpc::client_call(&sock, Request::Kill { id, include_init })?;
            cli::print_message(&resp);
            Ok(())
        }
        cli::Cmd::Network { id, format } => {
            let resp = rpc::client_call(&sock, Request::Network { id })?;
            cli::print_response(&resp, format)
        }
        cli::Cmd::Events { id, n, format } => {
            let resp = rpc::client_call(&sock, Request::Events { id, n })?;
            cli::print_response(&resp, format)
        }
        cli::Cmd::Version => {
            let resp = rpc::client_call(&sock, Request::Version)?;
            cli::print_message(&resp);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_unset_commands() {
        let base = CommandSet {
            init: "redis-server".to_string(),
            build: "make".to_string(),
            test: String::new(),
            start: "./serve".to_string(),
        };
        let merged = merge_commands(
            base,
            CommandArgs {
                build: Some(String::new()),
                start: Some("./serve --debug".to_string()),
                ..CommandArgs::default()
            },
        );
        assert_eq!(merged.init, "redis-server");
        assert_eq!(merged.build, "");
        assert_eq!(merged.start, "./serve --debug");
    }

    #[test]
    fn explicit_sock_wins() {
        let args = PipectlArgs::try_parse_from(["pipectl", "--sock", "/run/pm.sock", "list"]).unwrap();
        assert_eq!(resolve_sock(&args).unwrap(), PathBuf::from("/run/pm.sock"));
    }
}
