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

//! Multicast announcement of the public address (RFC 6886 Section 3.2.1).

use log::debug;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

use crate::natpmp::rfc_6886::{self, ResultCode};
use crate::public_addr::PublicAddress;
use crate::wire::Reply;

/// One burst of announcements is `ANNOUNCE_COUNT` datagrams; the first goes
/// out right away, then the gap starts at `ANNOUNCE_INITIAL_DELAY` and
/// doubles after every send.
#[derive(Debug)]
pub struct Announcer {
	dest: SocketAddr,
	remaining: u32,
	delay: Duration,
	next: Option<Instant>,
}

impl Announcer {
	/// Announces to the all-hosts group on `server_port - 1`.
	pub fn new(server_port: u16) -> Self {
		Announcer {
			dest: SocketAddr::V4(SocketAddrV4::new(
				rfc_6886::ANNOUNCE_GROUP,
				server_port.wrapping_sub(1),
			)),
			remaining: 0,
			delay: rfc_6886::ANNOUNCE_INITIAL_DELAY,
			next: None,
		}
	}

	/// Starts a new burst, abandoning the current one if any.
	pub fn restart(&mut self, now: Instant) {
		self.remaining = rfc_6886::ANNOUNCE_COUNT;
		self.delay = rfc_6886::ANNOUNCE_INITIAL_DELAY;
		self.next = Some(now);
	}

	pub fn next_deadline(&self) -> Option<Instant> {
		self.next
	}

	/// Queues an announcement if one is due. Returns whether one was sent.
	pub fn poll(&mut self, now: Instant, public: &PublicAddress, reply: &mut Reply<'_>) -> bool {
		match self.next {
			Some(t) if t <= now => (),
			_ => return false,
		}
		let addr = match public.get() {
			Ok(a) => a,
			Err(_) => {
				self.next = None;
				return false;
			}
		};

		let epoch = reply.epoch.now();
		reply.send(
			self.dest,
			rfc_6886::public_address_response(epoch, ResultCode::Success, addr),
		);
		self.remaining -= 1;
		debug!(
			"Announced {} to {}, {} left",
			addr, self.dest, self.remaining
		);

		if self.remaining == 0 {
			self.next = None;
		} else {
			self.next = Some(now + self.delay);
			self.delay *= 2;
		}
		true
	}
}
