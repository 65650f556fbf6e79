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

//! NAT-PMP (protocol version 0) request handling.

use int_enum::IntEnum;
use log::{debug, info, warn};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::handler::{Context, Request};
use crate::mapping::{MappingError, MappingEvent, MappingKey, Protocol, StopReason};
use crate::wire::{read_slice, read_u16, read_u32, read_u8, Reply};

// constants and functions defined by RFC 6886
pub mod rfc_6886 {
	use crate::wire::{write_u16, write_u32};
	use std::net::Ipv4Addr;
	use std::time::Duration;

	pub const VERSION: u8 = 0;

	// Section 3.1 / 3.3
	#[derive(Debug, Copy, Clone, PartialEq, Eq, int_enum::IntEnum)]
	#[repr(u8)]
	pub enum Opcode {
		PublicAddress = 0,
		NewUdpPortMapping = 1,
		NewTcpPortMapping = 2,
	}

	// Section 3.5
	#[derive(Debug, Copy, Clone, PartialEq, Eq, int_enum::IntEnum)]
	#[repr(u16)]
	pub enum ResultCode {
		Success = 0,
		UnsuppVersion = 1,
		NotAuthorized = 2,
		NetworkFailure = 3,
		OutOfResources = 4,
		UnsuppOpcode = 5,
	}

	pub const RESPONSE_BIT: u8 = 128;

	pub const HEADER_LEN: usize = 8;
	pub const PUBLIC_ADDRESS_LEN: usize = 12;
	pub const MAPPING_RESPONSE_LEN: usize = 16;

	// Section 3.2.1
	pub const ANNOUNCE_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
	pub const ANNOUNCE_COUNT: u32 = 10;
	pub const ANNOUNCE_INITIAL_DELAY: Duration = Duration::from_millis(250);

	/// Response header for `opcode`, zero padded to `len`.
	pub fn response(epoch: u32, opcode: u8, result: ResultCode, len: usize) -> Vec<u8> {
		let mut b = vec![0u8; len];
		b[0] = VERSION;
		b[1] = opcode.wrapping_add(RESPONSE_BIT);
		write_u16(&mut b, 2, result as u16);
		write_u32(&mut b, 4, epoch);
		b
	}

	pub fn public_address_response(epoch: u32, result: ResultCode, addr: Ipv4Addr) -> Vec<u8> {
		let mut b = response(epoch, Opcode::PublicAddress as u8, result, PUBLIC_ADDRESS_LEN);
		b[8..12].copy_from_slice(&addr.octets());
		b
	}

	pub fn mapping_response(
		epoch: u32,
		opcode: u8,
		result: ResultCode,
		private_port: u16,
		public_port: u16,
		lifetime: u32,
	) -> Vec<u8> {
		let mut b = response(epoch, opcode, result, MAPPING_RESPONSE_LEN);
		write_u16(&mut b, 8, private_port);
		write_u16(&mut b, 10, public_port);
		write_u32(&mut b, 12, lifetime);
		b
	}
}

use rfc_6886::{Opcode, ResultCode};

pub fn handle(req: &Request, ctx: &mut Context) {
	let tag = req.tag();
	let mut msg = req.payload;
	let m = &mut msg;
	let (version, opcode) = match (read_u8(m), read_u8(m)) {
		(Some(v), Some(o)) => (v, o),
		_ => {
			warn!("{} Dropping truncated request {}", tag, req.hex());
			return;
		}
	};
	let remote = SocketAddr::V4(req.remote);

	if version != rfc_6886::VERSION {
		let epoch = ctx.reply.epoch.now();
		ctx.reply.send(
			remote,
			rfc_6886::response(epoch, opcode, ResultCode::UnsuppVersion, rfc_6886::HEADER_LEN),
		);
		warn!("{} Unsupported pmp version {}", tag, version);
		debug!("{} payload {}", tag, req.hex());
		return;
	}

	match Opcode::from_int(opcode) {
		Ok(Opcode::PublicAddress) => public_address(&tag, req, ctx),
		Ok(Opcode::NewUdpPortMapping) => port_mapping(&tag, req, ctx, opcode, Protocol::Udp),
		Ok(Opcode::NewTcpPortMapping) => port_mapping(&tag, req, ctx, opcode, Protocol::Tcp),
		Err(_) => {
			let epoch = ctx.reply.epoch.now();
			ctx.reply.send(
				remote,
				rfc_6886::response(epoch, opcode, ResultCode::UnsuppOpcode, rfc_6886::HEADER_LEN),
			);
			warn!("{} Unsupported pmp op code {}", tag, opcode);
			debug!("{} payload {}", tag, req.hex());
		}
	}
}

fn public_address(tag: &str, req: &Request, ctx: &mut Context) {
	info!("{} Request public ip", tag);
	let remote = SocketAddr::V4(req.remote);
	let epoch = ctx.reply.epoch.now();
	match ctx.public.get() {
		Ok(ip) => {
			ctx.reply.send(
				remote,
				rfc_6886::public_address_response(epoch, ResultCode::Success, ip),
			);
			info!("{} Respond with {}", tag, ip);
		}
		Err(e) => {
			ctx.reply.send(
				remote,
				rfc_6886::public_address_response(
					epoch,
					ResultCode::NetworkFailure,
					Ipv4Addr::UNSPECIFIED,
				),
			);
			ctx.probe_wanted = true;
			warn!("{} {}", tag, e);
		}
	}
}

/// Mapping response without a public port or lifetime.
fn answer_unmapped(
	reply: &mut Reply,
	remote: SocketAddr,
	opcode: u8,
	private_port: u16,
	result: ResultCode,
) {
	let epoch = reply.epoch.now();
	reply.send(
		remote,
		rfc_6886::mapping_response(epoch, opcode, result, private_port, 0, 0),
	);
}

fn port_mapping(tag: &str, req: &Request, ctx: &mut Context, opcode: u8, protocol: Protocol) {
	let mut msg = req.payload;
	let m = &mut msg;
	let fields = read_slice(m, 4).and_then(|_| Some((read_u16(m)?, read_u16(m)?, read_u32(m)?)));
	let (private_port, external_port, lifetime) = match fields {
		Some(f) => f,
		None => {
			warn!("{} Dropping truncated mapping request {}", tag, req.hex());
			return;
		}
	};
	let remote = SocketAddr::V4(req.remote);
	let source_addr = *req.remote.ip();

	if lifetime == 0 {
		info!(
			"{} Request remove {} port mapping: {}:{} => {}",
			tag, protocol, source_addr, private_port, external_port
		);
		let removed = if private_port == 0 {
			// Section 3.4: all mappings of this client for the protocol
			ctx.mappings
				.stop_all(source_addr, protocol, StopReason::Request, &mut ctx.reply)
		} else {
			let key = MappingKey {
				source_addr,
				source_port: private_port,
				protocol,
			};
			ctx.mappings
				.stop(&key, StopReason::Request, &mut ctx.reply)
				.map_or(0, |_| 1)
		};
		if removed == 0 {
			warn!("{} Mapping not found", tag);
		}
		answer_unmapped(&mut ctx.reply, remote, opcode, private_port, ResultCode::Success);
		return;
	}

	info!(
		"{} Request new {} port mapping: {}:{} => {}, lifetime {}s",
		tag, protocol, source_addr, private_port, external_port, lifetime
	);
	let key = MappingKey {
		source_addr,
		source_port: private_port,
		protocol,
	};
	let mapping = match ctx.mappings.start(
		key,
		Duration::from_secs(lifetime as u64),
		ctx.now,
		&mut ctx.reply,
	) {
		Ok(m) => m,
		Err(e) => {
			warn!("{} {}", tag, e);
			let result = match e {
				MappingError::PortsExhausted(_) => ResultCode::OutOfResources,
				MappingError::Spawn(_) => ResultCode::NetworkFailure,
			};
			answer_unmapped(&mut ctx.reply, remote, opcode, private_port, result);
			return;
		}
	};

	let tag = tag.to_string();
	mapping.subscribe(
		Box::new(move |event: &MappingEvent, reply: &mut Reply<'_>| match *event {
			MappingEvent::Changed { public, lifetime } => {
				if public.port() == 0 {
					return;
				}
				let epoch = reply.epoch.now();
				reply.send(
					remote,
					rfc_6886::mapping_response(
						epoch,
						opcode,
						ResultCode::Success,
						private_port,
						public.port(),
						lifetime,
					),
				);
				info!(
					"{} Respond with {}:{} => {}, lifetime {}s",
					tag,
					source_addr,
					private_port,
					public.port(),
					lifetime
				);
			}
			MappingEvent::Terminated { reason, ready: false } => {
				answer_unmapped(reply, remote, opcode, private_port, ResultCode::NetworkFailure);
				warn!("{} Mapping failed before it was ready: {}", tag, reason);
			}
			MappingEvent::Terminated { .. } => (),
		}),
		&mut ctx.reply,
	);
}
