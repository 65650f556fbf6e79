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

//! NAT-PMP (RFC 6886) and PCP (RFC 6887) server which creates port
//! mappings by running natmap, one process per mapping.

use std::io;
use thiserror::Error;

pub mod announce;
pub mod config;
pub mod handler;
pub mod helper;
pub mod mapping;
pub mod natpmp;
pub mod pcp;
pub mod public_addr;
pub mod server;
pub mod stun;
pub mod wire;

pub use config::{Config, ConfigError, PortRange};
pub use server::Server;

#[derive(Debug, Error)]
pub enum Error {
	#[error("{0}")]
	Io(#[from] io::Error),
	#[error("{0}")]
	Config(#[from] ConfigError),
}
