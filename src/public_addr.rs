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

use log::info;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("public address is not known yet")]
pub struct NotReady;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressChange {
	pub old: Option<Ipv4Addr>,
	pub new: Ipv4Addr,
}

/// Last known public IPv4 address of this host.
///
/// Filled by the startup STUN probe and overwritten whenever a helper
/// reports an external address. There is no default: reading before the
/// first update fails with [`NotReady`].
#[derive(Debug, Default)]
pub struct PublicAddress {
	addr: Option<Ipv4Addr>,
}

impl PublicAddress {
	pub fn new() -> Self {
		PublicAddress { addr: None }
	}

	pub fn get(&self) -> Result<Ipv4Addr, NotReady> {
		self.addr.ok_or(NotReady)
	}

	/// Stores `addr` and reports the change, or `None` if it was already
	/// the current value.
	pub fn set(&mut self, addr: Ipv4Addr) -> Option<AddressChange> {
		if self.addr == Some(addr) {
			return None;
		}
		let old = self.addr.replace(addr);
		match old {
			Some(o) => info!("Public address changed from {} to {}", o, addr),
			None => info!("Public address is {}", addr),
		}
		Some(AddressChange { old, new: addr })
	}
}
