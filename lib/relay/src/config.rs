//! Configuration model: the JSON document accepted by the daemon, the
//! forward-string grammar, and their resolution into runtime service specs.

use crate::logging::{error, Logger};
use crate::net::shared::Protocol;
use crate::net::timer::TimeoutClass;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
    Forward(String),
    Log(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "config file error: {}", err),
            ConfigError::Parse(err) => write!(f, "config parse error: {}", err),
            ConfigError::Forward(reason) => write!(f, "invalid forward entry: {}", reason),
            ConfigError::Log(reason) => write!(f, "logging setup error: {}", reason),
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::Io(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub sink: SinkKind,
    pub file: Option<PathBuf>,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> LogConfig {
        LogConfig {
            sink: SinkKind::Stdout,
            file: None,
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSetting {
    pub connect: u64,
    pub session: u64,
    pub release: u64,
    pub udp: u64,
}

impl Default for TimeoutSetting {
    fn default() -> TimeoutSetting {
        TimeoutSetting {
            connect: 15,
            session: 180,
            release: 15,
            udp: 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferSetting {
    /// Shared arena capacity, in MiB.
    pub size: u64,
    /// Per-endpoint queued-bytes high-water mark, in MiB.
    #[serde(rename = "perSessionLimit")]
    pub per_session_limit: u64,
}

impl Default for BufferSetting {
    fn default() -> BufferSetting {
        BufferSetting {
            size: 64,
            per_session_limit: 1,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Setting {
    pub timeout: TimeoutSetting,
    pub buffer: BufferSetting,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSection {
    pub setting: Setting,
    pub forward: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatisticSection {
    pub interval: u64,
}

impl Default for StatisticSection {
    fn default() -> StatisticSection {
        StatisticSection { interval: 60 }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub service: ServiceSection,
    pub statistic: StatisticSection,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let file = fs::File::open(path)?;
        let config = serde_json::from_reader(file)?;
        Ok(config)
    }
}

/// One parsed forward entry: `[[protocol:]iface:]sport:host:dport` with
/// protocol defaulting to `tcp` and the interface to `any`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ForwardSpec {
    pub protocol: Protocol,
    pub interface: String,
    pub service_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl ForwardSpec {
    pub fn parse(entry: &str) -> Result<ForwardSpec, ConfigError> {
        let parts: Vec<&str> = entry.trim().split(':').collect();

        let (protocol, interface, service_port, target_host, target_port) = match parts.len() {
            3 => (None, None, parts[0], parts[1], parts[2]),
            4 => match parse_protocol(parts[0]) {
                // Four fields are ambiguous: a leading protocol keyword wins
                // over an interface of the same name.
                Some(_) => (Some(parts[0]), None, parts[1], parts[2], parts[3]),
                None => (None, Some(parts[0]), parts[1], parts[2], parts[3]),
            },
            5 => (Some(parts[0]), Some(parts[1]), parts[2], parts[3], parts[4]),
            _ => {
                return Err(ConfigError::Forward(format!(
                    "expected 3 to 5 colon-separated fields: [{}]",
                    entry
                )));
            }
        };

        let protocol = match protocol {
            Some(name) => parse_protocol(name).ok_or_else(|| {
                ConfigError::Forward(format!("unknown protocol [{}] in [{}]", name, entry))
            })?,
            None => Protocol::Tcp,
        };

        Ok(ForwardSpec {
            protocol,
            interface: interface.unwrap_or("any").to_string(),
            service_port: parse_port(service_port, entry)?,
            target_host: target_host.to_string(),
            target_port: parse_port(target_port, entry)?,
        })
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}:{}",
            self.protocol, self.interface, self.service_port, self.target_host, self.target_port
        )
    }
}

fn parse_protocol(name: &str) -> Option<Protocol> {
    if name.eq_ignore_ascii_case("tcp") {
        Some(Protocol::Tcp)
    } else if name.eq_ignore_ascii_case("udp") {
        Some(Protocol::Udp)
    } else {
        None
    }
}

fn parse_port(text: &str, entry: &str) -> Result<u16, ConfigError> {
    match text.parse::<u16>() {
        Ok(port) if port > 0 => Ok(port),
        _ => Err(ConfigError::Forward(format!(
            "port [{}] out of range in [{}]",
            text, entry
        ))),
    }
}

/// A forward entry made runtime: resolved listen address and target list.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub protocol: Protocol,
    pub listen: SocketAddr,
    pub targets: Vec<SocketAddr>,
    pub label: String,
}

impl ServiceSpec {
    pub fn from_forward(forward: &ForwardSpec) -> Result<ServiceSpec, ConfigError> {
        let ip = interface_ip(&forward.interface).ok_or_else(|| {
            ConfigError::Forward(format!(
                "no usable address on interface [{}]",
                forward.interface
            ))
        })?;

        let targets = resolve_target(&forward.target_host, forward.target_port)?;

        Ok(ServiceSpec {
            protocol: forward.protocol,
            listen: SocketAddr::new(ip, forward.service_port),
            targets,
            label: forward.to_string(),
        })
    }
}

/// `any` (or an empty field) binds the wildcard address; otherwise the field
/// is an IP literal or the name of a local interface.
fn interface_ip(name: &str) -> Option<IpAddr> {
    if name.is_empty() || name.eq_ignore_ascii_case("any") {
        return Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }

    if let Ok(ip) = name.parse::<IpAddr>() {
        return Some(ip);
    }

    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        if let Some(storage) = ifaddr.address {
            if let Some(sin) = storage.as_sockaddr_in() {
                return Some(IpAddr::V4(Ipv4Addr::from(sin.ip())));
            }
        }
    }

    None
}

/// Resolves a target host at startup. IPv4 addresses are preferred in the
/// rotation; resolution failure disables the entry.
fn resolve_target(host: &str, port: u16) -> Result<Vec<SocketAddr>, ConfigError> {
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|err| ConfigError::Forward(format!("cannot resolve [{}]: {}", host, err)))?
        .collect();

    if addrs.is_empty() {
        return Err(ConfigError::Forward(format!(
            "host [{}] resolved to no addresses",
            host
        )));
    }

    let (v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
        addrs.into_iter().partition(|addr| addr.is_ipv4());

    Ok(v4.into_iter().chain(v6).collect())
}

/// Parses and resolves every forward entry, logging and skipping the ones
/// that do not hold up.
pub fn build_specs(config: &Config, log: &Logger) -> Vec<ServiceSpec> {
    let mut specs = Vec::new();

    for entry in &config.service.forward {
        let forward = match ForwardSpec::parse(entry) {
            Ok(forward) => forward,
            Err(err) => {
                error!(log, "skipping forward entry"; "entry" => entry.as_str(), "reason" => %err);
                continue;
            }
        };

        match ServiceSpec::from_forward(&forward) {
            Ok(spec) => specs.push(spec),
            Err(err) => {
                error!(log, "skipping forward entry"; "entry" => entry.as_str(), "reason" => %err);
            }
        }
    }

    specs
}

/// Per-class timeout intervals.
#[derive(Debug, Copy, Clone)]
pub struct Timeouts {
    pub connect: Duration,
    pub established: Duration,
    pub broken: Duration,
    pub idle: Duration,
}

impl Timeouts {
    #[inline]
    pub fn for_class(&self, class: TimeoutClass) -> Duration {
        match class {
            TimeoutClass::Connect => self.connect,
            TimeoutClass::Established => self.established,
            TimeoutClass::Broken => self.broken,
            TimeoutClass::Idle => self.idle,
        }
    }
}

/// Settings digested into the units the data plane works in.
#[derive(Debug, Copy, Clone)]
pub struct Tuning {
    pub timeouts: Timeouts,
    pub arena_bytes: usize,
    pub session_limit: usize,
}

impl<'a> From<&'a Setting> for Tuning {
    fn from(setting: &Setting) -> Tuning {
        Tuning {
            timeouts: Timeouts {
                connect: Duration::from_secs(setting.timeout.connect),
                established: Duration::from_secs(setting.timeout.session),
                broken: Duration::from_secs(setting.timeout.release),
                idle: Duration::from_secs(setting.timeout.udp),
            },
            arena_bytes: (setting.buffer.size * MIB) as usize,
            session_limit: (setting.buffer.per_session_limit * MIB) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_forward() {
        let forward = ForwardSpec::parse("udp:any:5300:192.0.2.1:53").unwrap();

        assert_eq!(forward.protocol, Protocol::Udp);
        assert_eq!(forward.interface, "any");
        assert_eq!(forward.service_port, 5300);
        assert_eq!(forward.target_host, "192.0.2.1");
        assert_eq!(forward.target_port, 53);
    }

    #[test]
    fn test_parse_defaults() {
        let forward = ForwardSpec::parse("9000:127.0.0.1:7").unwrap();

        assert_eq!(forward.protocol, Protocol::Tcp);
        assert_eq!(forward.interface, "any");
        assert_eq!(forward.service_port, 9000);
    }

    #[test]
    fn test_parse_four_fields_protocol_wins() {
        let forward = ForwardSpec::parse("udp:5300:192.0.2.1:53").unwrap();
        assert_eq!(forward.protocol, Protocol::Udp);
        assert_eq!(forward.interface, "any");

        let forward = ForwardSpec::parse("eth0:9000:192.0.2.1:80").unwrap();
        assert_eq!(forward.protocol, Protocol::Tcp);
        assert_eq!(forward.interface, "eth0");
    }

    #[test]
    fn test_parse_rejects_bad_entries() {
        assert!(ForwardSpec::parse("").is_err());
        assert!(ForwardSpec::parse("9000:127.0.0.1").is_err());
        assert!(ForwardSpec::parse("abc:127.0.0.1:7").is_err());
        assert!(ForwardSpec::parse("0:127.0.0.1:7").is_err());
        assert!(ForwardSpec::parse("70000:127.0.0.1:7").is_err());
        assert!(ForwardSpec::parse("sctp:any:9:127.0.0.1:7").is_err());
    }

    #[test]
    fn test_config_defaults_from_empty_document() {
        let config: Config = serde_json::from_str("{}").unwrap();

        assert_eq!(config.log.sink, SinkKind::Stdout);
        assert_eq!(config.log.level, "info");
        assert_eq!(config.service.setting.timeout.connect, 15);
        assert_eq!(config.service.setting.timeout.session, 180);
        assert_eq!(config.service.setting.buffer.size, 64);
        assert_eq!(config.service.setting.buffer.per_session_limit, 1);
        assert_eq!(config.statistic.interval, 60);
        assert!(config.service.forward.is_empty());
    }

    #[test]
    fn test_config_full_document() {
        let doc = r#"{
            "log": { "sink": "file", "file": "/tmp/relay.log", "level": "debug" },
            "service": {
                "setting": {
                    "timeout": { "connect": 5, "session": 30, "release": 5, "udp": 5 },
                    "buffer": { "size": 8, "perSessionLimit": 2 }
                },
                "forward": [ "tcp:any:9000:127.0.0.1:7" ]
            },
            "statistic": { "interval": 10 }
        }"#;

        let config: Config = serde_json::from_str(doc).unwrap();

        assert_eq!(config.log.sink, SinkKind::File);
        assert_eq!(config.service.setting.timeout.session, 30);
        assert_eq!(config.service.setting.buffer.per_session_limit, 2);
        assert_eq!(config.service.forward.len(), 1);

        let tuning = Tuning::from(&config.service.setting);
        assert_eq!(tuning.arena_bytes, 8 * 1024 * 1024);
        assert_eq!(tuning.session_limit, 2 * 1024 * 1024);
        assert_eq!(tuning.timeouts.established, Duration::from_secs(30));
    }

    #[test]
    fn test_interface_any_and_literal() {
        assert_eq!(
            interface_ip("any"),
            Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
        );
        assert_eq!(
            interface_ip("127.0.0.1"),
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
        );
        assert_eq!(interface_ip("no-such-interface-0"), None);
    }

    #[test]
    fn test_resolve_target_literal() {
        let addrs = resolve_target("127.0.0.1", 7).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:7".parse().unwrap()]);
    }

    #[test]
    fn test_spec_from_forward() {
        let forward = ForwardSpec::parse("tcp:any:9000:127.0.0.1:7").unwrap();
        let spec = ServiceSpec::from_forward(&forward).unwrap();

        assert_eq!(spec.protocol, Protocol::Tcp);
        assert_eq!(spec.listen, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(spec.targets, vec!["127.0.0.1:7".parse().unwrap()]);
    }
}
