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

//! Byte-level helpers shared by both protocol handlers, plus the queue
//! handlers use to emit response datagrams.

use std::convert::TryInto;
use std::net::SocketAddr;
use std::time::Instant;

pub fn read_slice<'a>(s: &mut &'a [u8], count: usize) -> Option<&'a [u8]> {
	if s.len() < count {
		return None;
	}
	let (bytes, rest) = s.split_at(count);
	*s = rest;
	Some(bytes)
}

pub fn read_u8(s: &mut &[u8]) -> Option<u8> {
	let (octet, rest) = s.split_first()?;
	*s = rest;
	Some(*octet)
}

pub fn read_u16(s: &mut &[u8]) -> Option<u16> {
	Some(u16::from_be_bytes(read_slice(s, 2)?.try_into().ok()?))
}

pub fn read_u32(s: &mut &[u8]) -> Option<u32> {
	Some(u32::from_be_bytes(read_slice(s, 4)?.try_into().ok()?))
}

pub fn write_u16(buf: &mut [u8], offset: usize, value: u16) {
	buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
	buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// Seconds-since-start-of-epoch clock carried in every NAT-PMP and PCP
/// response header.
#[derive(Debug, Clone, Copy)]
pub struct Epoch {
	start: Instant,
}

impl Epoch {
	pub fn new(start: Instant) -> Self {
		Epoch { start }
	}

	pub fn now(&self) -> u32 {
		let secs = Instant::now().saturating_duration_since(self.start).as_secs();
		if secs > u32::max_value() as u64 {
			u32::max_value()
		} else {
			secs as u32
		}
	}
}

/// Datagrams queued by handlers, flushed to the socket by the server.
#[derive(Debug, Default)]
pub struct Outbox {
	queued: Vec<(SocketAddr, Vec<u8>)>,
}

impl Outbox {
	pub fn new() -> Self {
		Outbox { queued: Vec::new() }
	}

	pub fn push(&mut self, dest: SocketAddr, payload: Vec<u8>) {
		self.queued.push((dest, payload));
	}

	pub fn is_empty(&self) -> bool {
		self.queued.is_empty()
	}

	pub fn drain(&mut self) -> std::vec::Drain<'_, (SocketAddr, Vec<u8>)> {
		self.queued.drain(..)
	}
}

/// What a handler or subscriber needs to answer a client: the epoch, read
/// at the moment the answer is built, and somewhere to put the datagram.
pub struct Reply<'a> {
	pub epoch: Epoch,
	pub outbox: &'a mut Outbox,
}

impl<'a> Reply<'a> {
	pub fn new(epoch: Epoch, outbox: &'a mut Outbox) -> Self {
		Reply { epoch, outbox }
	}

	pub fn send(&mut self, dest: SocketAddr, payload: Vec<u8>) {
		self.outbox.push(dest, payload);
	}
}
