//! 启动参数：隧道服务端地址/密钥、本地 SOCKS5 监听地址。
//!
//! 镜像原始实现 `Client.cpp` 的最小 CLI（`ServerIP Port Key`），并在其上叠加一层
//! 可选的 TOML 配置文件；位置参数存在时覆盖文件里的同名字段。

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;

use serde::Deserialize;

const DEFAULT_SOCKS_LISTEN: &str = "127.0.0.1:1080";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("usage: <program> [--config FILE] ServerIP Port Key")]
    Usage,

    #[error("failed to resolve tunnel server address {host}:{port}: {source}")]
    ResolveServer {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to resolve SOCKS5 listen address {addr}: {source}")]
    ResolveListen {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("tunnel key must not be empty")]
    EmptyKey,

    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    ParseFile {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// 客户端运行所需的全部参数；一旦构造完成即不可变。
#[derive(Debug, Clone)]
pub struct Config {
    pub server_addr: SocketAddr,
    pub key: Vec<u8>,
    pub socks_listen_addr: SocketAddr,
}

/// TOML 配置文件的原始字段，每一项都可被对应的 CLI 位置参数覆盖。
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    server_host: Option<String>,
    server_port: Option<u16>,
    key: Option<String>,
    socks_listen_addr: Option<String>,
}

impl Config {
    /// 解析形如 `[--config FILE] ServerIP Port Key` 的命令行参数。
    ///
    /// `--config FILE` 提供默认值；其余三个位置参数（若给出）总是覆盖文件里的
    /// 同名字段,与原始实现"CLI 优先于配置"的顺序一致。
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let mut raw = RawConfig::default();
        let mut positional = Vec::new();

        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "--config" {
                let path = iter.next().ok_or(ConfigError::Usage)?;
                raw = read_toml_file(path)?;
            } else {
                positional.push(arg.clone());
            }
        }

        match positional.as_slice() {
            [] => {}
            [host, port, key] => {
                raw.server_host = Some(host.clone());
                raw.server_port = Some(port.parse().map_err(|_| ConfigError::Usage)?);
                raw.key = Some(key.clone());
            }
            _ => return Err(ConfigError::Usage),
        }

        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let host = raw.server_host.ok_or(ConfigError::Usage)?;
        let port = raw.server_port.ok_or(ConfigError::Usage)?;
        let key = raw.key.ok_or(ConfigError::Usage)?;
        if key.is_empty() {
            return Err(ConfigError::EmptyKey);
        }

        let server_addr = resolve_one(&host, port)
            .map_err(|source| ConfigError::ResolveServer { host, port, source })?;

        let socks_listen = raw
            .socks_listen_addr
            .unwrap_or_else(|| DEFAULT_SOCKS_LISTEN.to_string());
        let socks_listen_addr =
            socks_listen
                .to_socket_addrs()
                .map_err(|source| ConfigError::ResolveListen {
                    addr: socks_listen.clone(),
                    source,
                })?
                .next()
                .ok_or_else(|| ConfigError::ResolveListen {
                    addr: socks_listen,
                    source: std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        "no address resolved",
                    ),
                })?;

        Ok(Config {
            server_addr,
            key: key.into_bytes(),
            socks_listen_addr,
        })
    }
}

fn resolve_one(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no IPv4 address found"))
}

fn read_toml_file(path: &str) -> Result<RawConfig, ConfigError> {
    let text = std::fs::read_to_string(Path::new(path)).map_err(|source| ConfigError::ReadFile {
        path: path.to_string(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::ParseFile {
        path: path.to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_positional_args() {
        let args = vec![
            "127.0.0.1".to_string(),
            "9000".to_string(),
            "sekrit".to_string(),
        ];
        let config = Config::from_args(&args).unwrap();
        assert_eq!(config.server_addr.port(), 9000);
        assert_eq!(config.key, b"sekrit".to_vec());
        assert_eq!(config.socks_listen_addr.port(), 1080);
    }

    #[test]
    fn rejects_wrong_positional_count() {
        let args = vec!["127.0.0.1".to_string()];
        assert!(matches!(Config::from_args(&args), Err(ConfigError::Usage)));
    }

    #[test]
    fn rejects_empty_key() {
        let args = vec![
            "127.0.0.1".to_string(),
            "9000".to_string(),
            "".to_string(),
        ];
        assert!(matches!(
            Config::from_args(&args),
            Err(ConfigError::EmptyKey)
        ));
    }
}
