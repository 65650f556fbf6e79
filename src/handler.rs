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

//! What every per-request handler gets to work with.

use std::fmt::Write;
use std::net::SocketAddrV4;
use std::time::Instant;

use crate::mapping::MappingManager;
use crate::public_addr::PublicAddress;
use crate::wire::Reply;

/// One inbound datagram.
pub struct Request<'a> {
	pub id: u32,
	pub payload: &'a [u8],
	pub remote: SocketAddrV4,
}

impl<'a> Request<'a> {
	pub fn new(id: u32, payload: &'a [u8], remote: SocketAddrV4) -> Self {
		Request { id, payload, remote }
	}

	pub fn version(&self) -> u8 {
		self.payload.first().cloned().unwrap_or(0)
	}

	/// Log prefix identifying this request.
	pub fn tag(&self) -> String {
		format!("[req-{:03x} {} V{}]", self.id, self.remote, self.version())
	}

	pub fn hex(&self) -> String {
		let mut s = String::with_capacity(self.payload.len() * 2);
		for b in self.payload {
			let _ = write!(s, "{:02x}", b);
		}
		s
	}
}

/// Shared state a handler may act on. Handlers never talk to each other;
/// everything goes through the mapping manager and the public address.
pub struct Context<'a> {
	pub mappings: &'a mut MappingManager,
	pub public: &'a PublicAddress,
	pub reply: Reply<'a>,
	pub now: Instant,
	/// Set by a handler that needed the public address and found it
	/// missing; the server then starts a new STUN probe.
	pub probe_wanted: bool,
}

impl<'a> Context<'a> {
	pub fn new(
		mappings: &'a mut MappingManager,
		public: &'a PublicAddress,
		reply: Reply<'a>,
		now: Instant,
	) -> Self {
		Context {
			mappings,
			public,
			reply,
			now,
			probe_wanted: false,
		}
	}
}
