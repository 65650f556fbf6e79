/*
Copyright 2020 Steven Siloti

This program is free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation, either version 3 of the License, or
(at your option) any later version.

This program is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

use directories::ProjectDirs;
use ini::Ini;
use log::{debug, warn};
use std::fmt;
use std::fs::read_dir;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

use crate::pcp::rfc_6887;

#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("invalid port range {0}, expected <low>-<high> with 0 < low < high")]
	PortRange(String),
	#[error("invalid value for {key}: {value}")]
	Value { key: String, value: String },
	#[error("cannot load {path}: {reason}")]
	File { path: String, reason: String },
}

/// Inclusive `low`, exclusive `high`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
	pub low: u16,
	pub high: u16,
}

impl FromStr for PortRange {
	type Err = ConfigError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let err = || ConfigError::PortRange(s.to_string());
		let mut parts = s.splitn(2, '-');
		let low = parts.next().and_then(|p| p.trim().parse::<u16>().ok()).ok_or_else(err)?;
		let high = parts.next().and_then(|p| p.trim().parse::<u16>().ok()).ok_or_else(err)?;
		if low == 0 || low >= high {
			return Err(err());
		}
		Ok(PortRange { low, high })
	}
}

impl fmt::Display for PortRange {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}-{}", self.low, self.high)
	}
}

/// Everything the daemon reads at startup. Nothing here is reloaded.
#[derive(Debug, Clone)]
pub struct Config {
	pub host: Ipv4Addr,
	pub port: u16,
	/// Path of the natmap executable
	pub exec: String,
	pub bind_ports: PortRange,
	pub stun_server: String,
	/// Server natmap keeps a TCP connection to, holding the NAT binding open
	pub hold_server: String,
	/// Extra natmap arguments per protocol, split into words with shell
	/// quoting rules (see [`crate::mapping::split_args`])
	pub tcp_args: String,
	pub udp_args: String,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			host: Ipv4Addr::UNSPECIFIED,
			port: rfc_6887::SERVER_PORT,
			exec: "natmap".to_string(),
			bind_ports: PortRange {
				low: 9000,
				high: 9999,
			},
			stun_server: "stunserver.stunprotocol.org".to_string(),
			hold_server: "qq.com".to_string(),
			tcp_args: String::new(),
			udp_args: "-u".to_string(),
		}
	}
}

pub fn default_config_path() -> PathBuf {
	match ProjectDirs::from("us", "silotis", "natpmpd") {
		Some(d) => d.config_dir().to_path_buf(),
		None => PathBuf::from("/etc/natpmpd"),
	}
}

impl Config {
	/// Sets one option by its configuration file key.
	pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
		let invalid = || ConfigError::Value {
			key: key.to_string(),
			value: value.to_string(),
		};
		if key == "Host" {
			self.host = value.parse().map_err(|_| invalid())?;
		} else if key == "Port" {
			self.port = match value.parse::<u16>() {
				Ok(p) if p > 1 => p,
				_ => return Err(invalid()),
			};
		} else if key == "Bind" {
			self.bind_ports = value.parse()?;
		} else if key == "Exec" {
			self.exec = value.to_string();
		} else if key == "StunServer" {
			self.stun_server = value.to_string();
		} else if key == "HoldServer" {
			self.hold_server = value.to_string();
		} else if key == "TcpArgs" {
			self.tcp_args = value.to_string();
		} else if key == "UdpArgs" {
			self.udp_args = value.to_string();
		} else {
			warn!("Ignoring unknown configuration key {}", key);
		}
		Ok(())
	}

	pub fn load_file<P: AsRef<Path>>(&mut self, file_name: P) -> Result<(), ConfigError> {
		let path = file_name.as_ref();
		let ini = Ini::load_from_file(path).map_err(|e| ConfigError::File {
			path: path.display().to_string(),
			reason: e.to_string(),
		})?;
		for (_, prop) in ini.iter() {
			for (k, v) in prop.iter() {
				self.set(k, v)?;
			}
		}
		debug!("Loaded configuration from {}", path.display());
		Ok(())
	}

	/// Loads `path` if it is a file, or every `*.conf` file in it if it is
	/// a directory. A missing path is not an error unless `required`.
	pub fn load_path<P: AsRef<Path>>(
		&mut self,
		path: P,
		required: bool,
	) -> Result<(), ConfigError> {
		let path = path.as_ref();
		if path.is_file() {
			return self.load_file(path);
		}
		let entries = match read_dir(path) {
			Ok(i) => i,
			Err(e) => {
				if required {
					return Err(ConfigError::File {
						path: path.display().to_string(),
						reason: e.to_string(),
					});
				}
				debug!("No configuration at {}", path.display());
				return Ok(());
			}
		};
		let mut files: Vec<PathBuf> = entries
			.filter_map(|x| x.ok())
			.filter(|e| e.file_name().to_string_lossy().ends_with(".conf"))
			.map(|e| e.path())
			.collect();
		files.sort();
		for f in files {
			self.load_file(f)?;
		}
		Ok(())
	}
}
