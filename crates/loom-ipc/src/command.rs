//! Command vocabulary.
//!
//! Three message families share the wire:
//! - [`Hello`]: the first frame on every connection to the controller
//! - [`ControlCommand`]: operator requests sent by `loomctl` to the controller
//! - [`DaemonCommand`]: requests the controller sends to one daemon

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::IpcError;

/// Tokens are whitespace separated, so a filter path ends at its first
/// whitespace character.
const PATH_WITH_WHITESPACE: &str = "file names may not contain whitespace";

/// Take the path token, which must be the last one on the line.
fn parse_path<'a>(
    tokens: &mut impl Iterator<Item = &'a str>,
    usage: &'static str,
) -> Result<PathBuf, IpcError> {
    let path = tokens.next().ok_or(IpcError::Format(usage))?;
    if tokens.next().is_some() {
        return Err(IpcError::Format(PATH_WITH_WHITESPACE));
    }
    Ok(PathBuf::from(path))
}

fn parse_num<T: FromStr>(token: &str) -> Result<T, IpcError> {
    token
        .parse()
        .map_err(|_| IpcError::InvalidNumber(token.to_string()))
}

/// Connection handshake: who is on the other end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hello {
    Daemon { pid: u32 },
    Ctl,
}

impl FromStr for Hello {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        if tokens.next() != Some("iam") {
            return Err(IpcError::Format("iam <loom_daemon <pid> | loom_ctl>"));
        }
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some("loom_daemon"), Some(pid), None) => Ok(Hello::Daemon {
                pid: parse_num(pid)?,
            }),
            (Some("loom_ctl"), None, None) => Ok(Hello::Ctl),
            _ => Err(IpcError::Format("iam <loom_daemon <pid> | loom_ctl>")),
        }
    }
}

impl fmt::Display for Hello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Hello::Daemon { pid } => write!(f, "iam loom_daemon {}", pid),
            Hello::Ctl => write!(f, "iam loom_ctl"),
        }
    }
}

/// Operator request, `loomctl` → controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Install the filter file at `path` in every process.
    Add { path: PathBuf },
    /// Remove filter `id` from every process.
    Del { id: u32 },
    /// List installed filters, or forward `ls` to the daemon of `pid`.
    Ls { pid: Option<u32> },
    /// List connected daemons.
    Ps,
}

impl FromStr for ControlCommand {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let cmd = tokens.next().ok_or(IpcError::Empty)?;
        let parsed = match cmd {
            "add" => ControlCommand::Add {
                path: parse_path(&mut tokens, "add <file name>")?,
            },
            "del" => {
                let id = tokens.next().ok_or(IpcError::Format("del <filter ID>"))?;
                ControlCommand::Del { id: parse_num(id)? }
            }
            "ls" => ControlCommand::Ls {
                pid: tokens.next().map(parse_num).transpose()?,
            },
            "ps" => ControlCommand::Ps,
            other => return Err(IpcError::UnknownCommand(other.to_string())),
        };
        if tokens.next().is_some() {
            return Err(IpcError::Format("trailing arguments"));
        }
        Ok(parsed)
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::Add { path } => write!(f, "add {}", path.display()),
            ControlCommand::Del { id } => write!(f, "del {}", id),
            ControlCommand::Ls { pid: Some(pid) } => write!(f, "ls {}", pid),
            ControlCommand::Ls { pid: None } => write!(f, "ls"),
            ControlCommand::Ps => write!(f, "ps"),
        }
    }
}

/// Request from the controller to a single daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonCommand {
    Add { id: u32, path: PathBuf },
    Del { id: u32 },
    Ls,
}

impl FromStr for DaemonCommand {
    type Err = IpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let cmd = tokens.next().ok_or(IpcError::Empty)?;
        let parsed = match cmd {
            "add" => {
                const USAGE: &str = "add <filter ID> <file name>";
                let id = tokens.next().ok_or(IpcError::Format(USAGE))?;
                DaemonCommand::Add {
                    id: parse_num(id)?,
                    path: parse_path(&mut tokens, USAGE)?,
                }
            }
            "del" => {
                let id = tokens.next().ok_or(IpcError::Format("del <filter ID>"))?;
                DaemonCommand::Del { id: parse_num(id)? }
            }
            "ls" => DaemonCommand::Ls,
            other => return Err(IpcError::UnknownCommand(other.to_string())),
        };
        if tokens.next().is_some() {
            return Err(IpcError::Format("trailing arguments"));
        }
        Ok(parsed)
    }
}

impl fmt::Display for DaemonCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonCommand::Add { id, path } => write!(f, "add {} {}", id, path.display()),
            DaemonCommand::Del { id } => write!(f, "del {}", id),
            DaemonCommand::Ls => write!(f, "ls"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello() {
        assert_eq!(
            "iam loom_daemon 4242".parse::<Hello>().unwrap(),
            Hello::Daemon { pid: 4242 }
        );
        assert_eq!("iam loom_ctl".parse::<Hello>().unwrap(), Hello::Ctl);
        assert_eq!(Hello::Daemon { pid: 7 }.to_string(), "iam loom_daemon 7");

        assert!("iam loom_daemon".parse::<Hello>().is_err());
        assert!("iam someone_else".parse::<Hello>().is_err());
        assert!("hello".parse::<Hello>().is_err());
        assert!(matches!(
            "iam loom_daemon abc".parse::<Hello>(),
            Err(IpcError::InvalidNumber(_))
        ));
    }

    #[test]
    fn test_control_commands() {
        assert_eq!(
            "add /tmp/a.filter".parse::<ControlCommand>().unwrap(),
            ControlCommand::Add {
                path: PathBuf::from("/tmp/a.filter")
            }
        );
        assert_eq!(
            "del 12".parse::<ControlCommand>().unwrap(),
            ControlCommand::Del { id: 12 }
        );
        assert_eq!(
            "ls".parse::<ControlCommand>().unwrap(),
            ControlCommand::Ls { pid: None }
        );
        assert_eq!(
            "ls 99".parse::<ControlCommand>().unwrap(),
            ControlCommand::Ls { pid: Some(99) }
        );
        assert_eq!("ps".parse::<ControlCommand>().unwrap(), ControlCommand::Ps);
    }

    #[test]
    fn test_control_command_errors() {
        assert!(matches!("".parse::<ControlCommand>(), Err(IpcError::Empty)));
        assert!(matches!(
            "add".parse::<ControlCommand>(),
            Err(IpcError::Format(_))
        ));
        assert!(matches!(
            "del x".parse::<ControlCommand>(),
            Err(IpcError::InvalidNumber(_))
        ));
        assert!(matches!(
            "del -1".parse::<ControlCommand>(),
            Err(IpcError::InvalidNumber(_))
        ));
        assert!(matches!(
            "frobnicate".parse::<ControlCommand>(),
            Err(IpcError::UnknownCommand(_))
        ));
        assert!(matches!(
            "ps now".parse::<ControlCommand>(),
            Err(IpcError::Format(_))
        ));
    }

    #[test]
    fn test_daemon_commands() {
        let add = DaemonCommand::Add {
            id: 3,
            path: PathBuf::from("/f/x.filter"),
        };
        assert_eq!(add.to_string(), "add 3 /f/x.filter");
        assert_eq!("add 3 /f/x.filter".parse::<DaemonCommand>().unwrap(), add);
        assert_eq!(
            "del 3".parse::<DaemonCommand>().unwrap(),
            DaemonCommand::Del { id: 3 }
        );
        assert_eq!("ls".parse::<DaemonCommand>().unwrap(), DaemonCommand::Ls);

        let err = "add 3".parse::<DaemonCommand>().unwrap_err();
        assert_eq!(err.to_string(), "format error: add <filter ID> <file name>");
    }

    #[test]
    fn test_path_with_whitespace_is_named() {
        let err = "add 3 /f/my filter".parse::<DaemonCommand>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "format error: file names may not contain whitespace"
        );
        let err = "add /f/my filter".parse::<ControlCommand>().unwrap_err();
        assert_eq!(
            err.to_string(),
            "format error: file names may not contain whitespace"
        );
        let err = "del 3 4".parse::<DaemonCommand>().unwrap_err();
        assert_eq!(err.to_string(), "format error: trailing arguments");
    }
}
