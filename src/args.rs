use core::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: burrow -role host|client [options]\n",
        "\n",
        "Options:\n",
        "  -role <host|client>  Which side of the tunnel this process runs\n",
        "  -port <1-65535>      Host: TCP service port to expose\n",
        "                       Client: local port for the virtual service\n",
        "  -wsPort <1-65535>    Host only: signaling server port (default: ephemeral)\n",
        "  -wsListen            Host only: accept signaling from all interfaces\n",
        "  -wsUrl <url>         Client only: signaling URL printed by the host\n",
        "  -debug               Enable debug logging\n",
        "  -h, --help           Print this help menu\n",
        "  -V, --version        Print version information",
    )
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsRequest {
    Help,
    Version,
    Run(StartupArguments),
}

#[derive(Debug, PartialEq, Eq)]
pub struct StartupArguments {
    pub role: StartupRole,
    pub debug: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum StartupRole {
    Host(HostConfig),
    Client(ClientConfig),
}

#[derive(Debug, PartialEq, Eq)]
pub struct HostConfig {
    pub target_port: u16,
    /// 0 selects an ephemeral port.
    pub ws_port: u16,
    pub ws_listen: bool,
}

impl HostConfig {
    /// The address the signaling server binds to.
    pub fn ws_bind_addr(&self) -> SocketAddr {
        let ip = match self.ws_listen {
            true => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            false => IpAddr::V4(Ipv4Addr::LOCALHOST),
        };
        SocketAddr::new(ip, self.ws_port)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ClientConfig {
    pub local_port: u16,
    pub ws_url: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    MissingRole,
    RoleError(RoleErrorType),
    PortError(PortErrorType),
    MissingPort,
    UrlError(UrlErrorType),
    MissingUrl,
    HostFoundClientArgument(String),
    ClientFoundHostArgument(String),
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::MissingRole => write!(f, "A role must be specified with -role host or -role client"),
            Self::RoleError(role_error) => role_error.fmt(f),
            Self::PortError(port_error) => port_error.fmt(f),
            Self::MissingPort => write!(f, "A port must be specified with -port"),
            Self::UrlError(url_error) => url_error.fmt(f),
            Self::MissingUrl => write!(f, "When running on client mode, a signaling URL must be specified with -wsUrl"),
            Self::HostFoundClientArgument(arg) => {
                write!(f, "Previous arguments indicated host mode, but {arg} is a client-only argument")
            }
            Self::ClientFoundHostArgument(arg) => {
                write!(f, "Previous arguments indicated client mode, but {arg} is a host-only argument")
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RoleErrorType {
    UnexpectedEnd(String),
    InvalidValue(String, String),
}

impl fmt::Display for RoleErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd(arg) => write!(f, "Expected 'host' or 'client' after {arg}"),
            Self::InvalidValue(arg, value) => write!(f, "Invalid role after {arg}: {value} (must be 'host' or 'client')"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum PortErrorType {
    UnexpectedEnd(String),
    InvalidValue(String, String),
}

impl fmt::Display for PortErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd(arg) => write!(f, "Expected port number after {arg}"),
            Self::InvalidValue(arg, value) => write!(f, "Invalid port number after {arg}: {value} (must be 1 to 65535)"),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum UrlErrorType {
    UnexpectedEnd(String),
    EmptyHost(String, String),
}

impl fmt::Display for UrlErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEnd(arg) => write!(f, "Expected URL after {arg}"),
            Self::EmptyHost(arg, value) => write!(f, "Invalid URL after {arg}: {value}"),
        }
    }
}

impl From<RoleErrorType> for ArgumentsError {
    fn from(value: RoleErrorType) -> Self {
        ArgumentsError::RoleError(value)
    }
}

impl From<PortErrorType> for ArgumentsError {
    fn from(value: PortErrorType) -> Self {
        ArgumentsError::PortError(value)
    }
}

impl From<UrlErrorType> for ArgumentsError {
    fn from(value: UrlErrorType) -> Self {
        ArgumentsError::UrlError(value)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum Role {
    Host,
    Client,
}

#[derive(Default)]
struct ArgumentsParser {
    role: Option<Role>,
    port: Option<u16>,
    ws_port: Option<u16>,
    ws_listen: bool,
    ws_url: Option<String>,
    debug: bool,
}

impl ArgumentsParser {
    fn finish(self) -> Result<ArgumentsRequest, ArgumentsError> {
        let role = match self.role {
            Some(role) => role,
            None => return Err(ArgumentsError::MissingRole),
        };

        let startup_role = match role {
            Role::Host => {
                if self.ws_url.is_some() {
                    return Err(ArgumentsError::HostFoundClientArgument("-wsUrl".to_string()));
                }

                StartupRole::Host(HostConfig {
                    target_port: self.port.ok_or(ArgumentsError::MissingPort)?,
                    ws_port: self.ws_port.unwrap_or(0),
                    ws_listen: self.ws_listen,
                })
            }
            Role::Client => {
                if self.ws_port.is_some() {
                    return Err(ArgumentsError::ClientFoundHostArgument("-wsPort".to_string()));
                }
                if self.ws_listen {
                    return Err(ArgumentsError::ClientFoundHostArgument("-wsListen".to_string()));
                }

                StartupRole::Client(ClientConfig {
                    local_port: self.port.ok_or(ArgumentsError::MissingPort)?,
                    ws_url: self.ws_url.ok_or(ArgumentsError::MissingUrl)?,
                })
            }
        };

        Ok(ArgumentsRequest::Run(StartupArguments {
            role: startup_role,
            debug: self.debug,
        }))
    }
}

/// Matches an argument against a flag name, accepting one or two leading
/// dashes and ignoring case.
fn is_flag(arg: &str, name: &str) -> bool {
    let stripped = match arg.strip_prefix("--") {
        Some(stripped) => stripped,
        None => match arg.strip_prefix('-') {
            Some(stripped) => stripped,
            None => return false,
        },
    };

    stripped.eq_ignore_ascii_case(name)
}

fn parse_role_arg(arg: String, maybe_arg2: Option<String>) -> Result<Role, RoleErrorType> {
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(RoleErrorType::UnexpectedEnd(arg)),
    };

    match arg2.to_ascii_lowercase().as_str() {
        "host" => Ok(Role::Host),
        "client" => Ok(Role::Client),
        _ => Err(RoleErrorType::InvalidValue(arg, arg2)),
    }
}

fn parse_port_arg(arg: String, maybe_arg2: Option<String>) -> Result<u16, PortErrorType> {
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(PortErrorType::UnexpectedEnd(arg)),
    };

    match arg2.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(PortErrorType::InvalidValue(arg, arg2)),
    }
}

/// Validates and normalizes a signaling URL: the scheme defaults to `ws`, the
/// path defaults to `/ws`, and the query (which carries the PIN) is kept.
/// Returns `None` when no host is present.
pub fn normalize_ws_url(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let (scheme, rest) = match trimmed.split_once("://") {
        Some(("ws", rest)) => ("ws", rest),
        Some(("wss", rest)) => ("wss", rest),
        Some((_, rest)) => ("wss", rest),
        None => ("ws", trimmed),
    };

    if rest.is_empty() || rest.starts_with('/') || rest.starts_with('?') {
        return None;
    }

    let (host, tail) = match rest.find(['/', '?']) {
        Some(index) => rest.split_at(index),
        None => (rest, ""),
    };

    match tail.chars().next() {
        None => Some(format!("{scheme}://{host}/ws")),
        Some('?') => Some(format!("{scheme}://{host}/ws{tail}")),
        Some(_) => Some(format!("{scheme}://{host}{tail}")),
    }
}

fn parse_url_arg(arg: String, maybe_arg2: Option<String>) -> Result<String, UrlErrorType> {
    let arg2 = match maybe_arg2 {
        Some(arg2) => arg2,
        None => return Err(UrlErrorType::UnexpectedEnd(arg)),
    };

    match normalize_ws_url(&arg2) {
        Some(normalized) => Ok(normalized),
        None => Err(UrlErrorType::EmptyHost(arg, arg2)),
    }
}

pub fn parse_arguments<T>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError>
where
    T: Iterator<Item = String>,
{
    let mut parser = ArgumentsParser::default();

    // Ignore the first argument, as it's by convention the name of the program
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        } else if is_flag(&arg, "role") {
            parser.role = Some(parse_role_arg(arg, args.next())?);
        } else if arg.eq("-p") || is_flag(&arg, "port") {
            parser.port = Some(parse_port_arg(arg, args.next())?);
        } else if is_flag(&arg, "wsPort") {
            parser.ws_port = Some(parse_port_arg(arg, args.next())?);
        } else if is_flag(&arg, "wsListen") {
            parser.ws_listen = true;
        } else if is_flag(&arg, "wsUrl") {
            parser.ws_url = Some(parse_url_arg(arg, args.next())?);
        } else if is_flag(&arg, "debug") {
            parser.debug = true;
        } else {
            return Err(ArgumentsError::UnknownArgument(arg));
        }
    }

    parser.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<ArgumentsRequest, ArgumentsError> {
        let full: Vec<String> = std::iter::once("burrow".to_string())
            .chain(args.iter().map(|s| s.to_string()))
            .collect();
        parse_arguments(full.into_iter())
    }

    #[test]
    fn host_arguments() {
        let parsed = parse(&["-role", "host", "-port", "8080", "-wsPort", "9000", "-wsListen"]).unwrap();

        assert_eq!(
            parsed,
            ArgumentsRequest::Run(StartupArguments {
                role: StartupRole::Host(HostConfig {
                    target_port: 8080,
                    ws_port: 9000,
                    ws_listen: true,
                }),
                debug: false,
            })
        );
    }

    #[test]
    fn client_arguments() {
        let parsed = parse(&["-role", "client", "-port", "8080", "-wsUrl", "ws://10.0.0.2:9000/ws?pin=1234", "-debug"]).unwrap();

        assert_eq!(
            parsed,
            ArgumentsRequest::Run(StartupArguments {
                role: StartupRole::Client(ClientConfig {
                    local_port: 8080,
                    ws_url: "ws://10.0.0.2:9000/ws?pin=1234".to_string(),
                }),
                debug: true,
            })
        );
    }

    #[test]
    fn double_dash_and_case_insensitive_flags() {
        let parsed = parse(&["--Role", "host", "--PORT", "80"]).unwrap();
        assert!(matches!(
            parsed,
            ArgumentsRequest::Run(StartupArguments {
                role: StartupRole::Host(HostConfig { target_port: 80, .. }),
                ..
            })
        ));
    }

    #[test]
    fn missing_role_and_port() {
        assert_eq!(parse(&[]), Err(ArgumentsError::MissingRole));
        assert_eq!(parse(&["-role", "host"]), Err(ArgumentsError::MissingPort));
        assert_eq!(parse(&["-role", "client", "-port", "80"]), Err(ArgumentsError::MissingUrl));
    }

    #[test]
    fn invalid_port_values() {
        for value in ["0", "65536", "http", "-1"] {
            assert_eq!(
                parse(&["-role", "host", "-port", value]),
                Err(ArgumentsError::PortError(PortErrorType::InvalidValue(
                    "-port".to_string(),
                    value.to_string()
                )))
            );
        }
    }

    #[test]
    fn cross_role_arguments_are_rejected() {
        assert_eq!(
            parse(&["-role", "host", "-port", "80", "-wsUrl", "ws://example.com/ws"]),
            Err(ArgumentsError::HostFoundClientArgument("-wsUrl".to_string()))
        );
        assert_eq!(
            parse(&["-role", "client", "-port", "80", "-wsUrl", "ws://example.com/ws", "-wsListen"]),
            Err(ArgumentsError::ClientFoundHostArgument("-wsListen".to_string()))
        );
    }

    #[test]
    fn unknown_argument() {
        assert_eq!(
            parse(&["-role", "host", "-port", "80", "-frobnicate"]),
            Err(ArgumentsError::UnknownArgument("-frobnicate".to_string()))
        );
    }

    #[test]
    fn url_normalization() {
        let cases = [
            ("example.com:9000", "ws://example.com:9000/ws"),
            ("ws://example.com:9000", "ws://example.com:9000/ws"),
            ("wss://example.com/ws?pin=1234", "wss://example.com/ws?pin=1234"),
            ("example.com?pin=9", "ws://example.com/ws?pin=9"),
            ("https://example.com", "wss://example.com/ws"),
        ];

        for (input, expected) in cases {
            match parse(&["-role", "client", "-port", "80", "-wsUrl", input]).unwrap() {
                ArgumentsRequest::Run(StartupArguments {
                    role: StartupRole::Client(config),
                    ..
                }) => assert_eq!(config.ws_url, expected, "input {input}"),
                other => panic!("unexpected parse result: {other:?}"),
            }
        }
    }

    #[test]
    fn help_and_version_win() {
        assert_eq!(parse(&["-role", "host", "--help"]), Ok(ArgumentsRequest::Help));
        assert_eq!(parse(&["-V"]), Ok(ArgumentsRequest::Version));
    }
}
