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

//! PCP (protocol version 2) request handling. Only the MAP opcode is
//! served and no options are understood.

use log::{debug, info, warn};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::handler::{Context, Request};
use crate::mapping::{MappingError, MappingEvent, MappingKey, Protocol, StopReason};
use crate::wire::{read_slice, read_u16, read_u32, read_u8, write_u16, write_u32, Reply};

// constants and functions defined by RFC 6887
pub mod rfc_6887 {
	use crate::wire::write_u32;
	use std::cmp;
	use std::net::Ipv4Addr;

	pub const VERSION: u8 = 2;

	// Section 19.2
	pub enum Opcode {
		Announce = 0,
		Map = 1,
		Peer = 2,
	}

	// Section 7.4
	#[derive(Debug, Copy, Clone, PartialEq, Eq, int_enum::IntEnum)]
	#[repr(u8)]
	pub enum ResultCode {
		Success = 0,
		UnsuppVersion = 1,
		NotAuthorized = 2,
		MalformedRequest = 3,
		UnsuppOpcode = 4,
		UnsuppOption = 5,
		MalformedOption = 6,
		NetworkFailure = 7,
		NoResources = 8,
		UnsuppProtocol = 9,
		UserExQuota = 10,
		CannotProvideExternal = 11,
		AddressMismatch = 12,
		ExcessiveRemotePeers = 13,
	}

	// Section 19.1
	pub const SERVER_PORT: u16 = 5351;

	// Section 7.1
	pub const RESPONSE_BIT: u8 = 0x80;
	pub const HEADER_LEN: usize = 24;
	pub const MAX_LEN: usize = 1100;
	// Section 11.1
	pub const MAP_LEN: usize = 60;

	// Section 7.4, lifetimes of error responses
	pub const LONG_LIFETIME: u32 = 30 * 60;
	pub const SHORT_LIFETIME: u32 = 30;

	/// Error response per Section 8.3: the request echoed back (at most
	/// `MAX_LEN` octets, zero padded to a multiple of four) with the result
	/// code, lifetime and epoch filled in.
	pub fn error_response(
		request: &[u8],
		result: ResultCode,
		lifetime: u32,
		epoch: u32,
	) -> Vec<u8> {
		let mut len = cmp::min(request.len(), MAX_LEN);
		if len % 4 != 0 {
			len += 4 - len % 4;
		}
		let len = cmp::max(len, HEADER_LEN);
		let mut b = vec![0u8; len];
		let copied = cmp::min(request.len(), len);
		b[..copied].copy_from_slice(&request[..copied]);
		b[1] |= RESPONSE_BIT;
		b[2] = 0; // reserved
		b[3] = result as u8;
		write_u32(&mut b, 4, lifetime);
		write_u32(&mut b, 8, epoch);
		for x in &mut b[12..24] {
			*x = 0; // reserved
		}
		b
	}

	/// The IPv4 address inside an IPv4-mapped IPv6 address (::ffff:0:0/96).
	pub fn from_pcp_address(octets: &[u8]) -> Option<Ipv4Addr> {
		if octets.len() != 16 || octets[..10].iter().any(|&o| o != 0) {
			return None;
		}
		if octets[10] != 0xff || octets[11] != 0xff {
			return None;
		}
		Some(Ipv4Addr::new(octets[12], octets[13], octets[14], octets[15]))
	}

	pub fn to_pcp_address(addr: Ipv4Addr) -> [u8; 16] {
		addr.to_ipv6_mapped().octets()
	}
}

use rfc_6887::ResultCode;

// byte offsets in a MAP request and response
const LIFETIME: usize = 4;
const EPOCH: usize = 8;
const EXTERNAL_PORT: usize = 42;
const EXTERNAL_ADDRESS: usize = 44;

fn send_error(req: &Request, reply: &mut Reply, result: ResultCode, long_lifetime: bool) {
	let lifetime = if long_lifetime {
		rfc_6887::LONG_LIFETIME
	} else {
		rfc_6887::SHORT_LIFETIME
	};
	let epoch = reply.epoch.now();
	reply.send(
		SocketAddr::V4(req.remote),
		rfc_6887::error_response(req.payload, result, lifetime, epoch),
	);
}

struct MapRequest {
	lifetime: u32,
	source_ip: Option<Ipv4Addr>,
	protocol: u8,
	internal_port: u16,
	external_port: u16,
	external_ip: Option<Ipv4Addr>,
	external_unspecified: bool,
}

fn parse_map(mut msg: &[u8]) -> Option<MapRequest> {
	let m = &mut msg;
	let _ = read_slice(m, 4)?; // version, opcode, reserved
	let lifetime = read_u32(m)?;
	let source = read_slice(m, 16)?;
	let _ = read_slice(m, 12)?; // nonce, echoed verbatim
	let protocol = read_u8(m)?;
	let _ = read_slice(m, 3)?; // reserved
	let internal_port = read_u16(m)?;
	let external_port = read_u16(m)?;
	let external = read_slice(m, 16)?;
	Some(MapRequest {
		lifetime,
		source_ip: rfc_6887::from_pcp_address(source),
		protocol,
		internal_port,
		external_port,
		external_ip: rfc_6887::from_pcp_address(external),
		external_unspecified: external.iter().all(|&o| o == 0),
	})
}

pub fn handle(req: &Request, ctx: &mut Context) {
	let tag = req.tag();
	if req.payload.len() < 2 {
		warn!("{} Dropping truncated request {}", tag, req.hex());
		return;
	}
	let version = req.payload[0];
	let opcode = req.payload[1];

	if version != rfc_6887::VERSION {
		send_error(req, &mut ctx.reply, ResultCode::UnsuppVersion, true);
		warn!("{} Unsupported pcp version {}", tag, version);
		debug!("{} payload {}", tag, req.hex());
		return;
	}
	if opcode != rfc_6887::Opcode::Map as u8 {
		send_error(req, &mut ctx.reply, ResultCode::UnsuppOpcode, true);
		warn!("{} Unsupported pcp op code {}", tag, opcode);
		debug!("{} payload {}", tag, req.hex());
		return;
	}
	if req.payload.len() < rfc_6887::MAP_LEN {
		send_error(req, &mut ctx.reply, ResultCode::MalformedRequest, true);
		warn!("{} Malformed pcp request", tag);
		debug!("{} payload {}", tag, req.hex());
		return;
	}
	if req.payload.len() > rfc_6887::MAP_LEN {
		send_error(req, &mut ctx.reply, ResultCode::UnsuppOption, true);
		warn!("{} Pcp request with unsupported option (no options are supported)", tag);
		debug!("{} payload {}", tag, req.hex());
		return;
	}

	let map = match parse_map(req.payload) {
		Some(m) => m,
		None => {
			send_error(req, &mut ctx.reply, ResultCode::MalformedRequest, true);
			return;
		}
	};

	let protocol = match Protocol::from_number(map.protocol) {
		Some(p) => p,
		None => {
			send_error(req, &mut ctx.reply, ResultCode::UnsuppProtocol, true);
			warn!("{} Unsupported protocol {}", tag, map.protocol);
			return;
		}
	};
	if map.internal_port == 0 {
		send_error(req, &mut ctx.reply, ResultCode::UnsuppProtocol, true);
		warn!("{} Unsupported wildcard port", tag);
		return;
	}
	let source_ip = match map.source_ip {
		Some(ip) if map.external_ip.is_some() || map.external_unspecified => ip,
		_ => {
			send_error(req, &mut ctx.reply, ResultCode::MalformedRequest, true);
			warn!(
				"{} Malformed pcp request, source or external address is not IPv4-mapped",
				tag
			);
			debug!("{} payload {}", tag, req.hex());
			return;
		}
	};
	if source_ip != *req.remote.ip() {
		send_error(req, &mut ctx.reply, ResultCode::AddressMismatch, true);
		warn!("{} Address mismatch, request claims {}", tag, source_ip);
		return;
	}

	let mut resp = req.payload[..rfc_6887::MAP_LEN].to_vec();
	resp[1] |= rfc_6887::RESPONSE_BIT;
	resp[2] = 0; // reserved
	resp[3] = ResultCode::Success as u8;
	for x in &mut resp[12..24] {
		*x = 0; // reserved
	}
	for x in &mut resp[37..40] {
		*x = 0; // reserved
	}

	let key = MappingKey {
		source_addr: source_ip,
		source_port: map.internal_port,
		protocol,
	};
	let remote = SocketAddr::V4(req.remote);

	if map.lifetime == 0 {
		info!(
			"{} Request remove {} port mapping: {}:{} => {}",
			tag, protocol, source_ip, map.internal_port, map.external_port
		);
		if ctx
			.mappings
			.stop(&key, StopReason::Request, &mut ctx.reply)
			.is_none()
		{
			warn!("{} Mapping not found", tag);
		}
		write_u32(&mut resp, LIFETIME, 0);
		write_u32(&mut resp, EPOCH, ctx.reply.epoch.now());
		write_u16(&mut resp, EXTERNAL_PORT, 0);
		for x in &mut resp[EXTERNAL_ADDRESS..] {
			*x = 0;
		}
		ctx.reply.send(remote, resp);
		return;
	}

	info!(
		"{} Request new {} port mapping: {}:{} => {}, lifetime {}s",
		tag, protocol, source_ip, map.internal_port, map.external_port, map.lifetime
	);
	let mapping = match ctx.mappings.start(
		key,
		Duration::from_secs(map.lifetime as u64),
		ctx.now,
		&mut ctx.reply,
	) {
		Ok(m) => m,
		Err(e) => {
			warn!("{} {}", tag, e);
			let result = match e {
				MappingError::PortsExhausted(_) => ResultCode::NoResources,
				MappingError::Spawn(_) => ResultCode::NetworkFailure,
			};
			send_error(req, &mut ctx.reply, result, false);
			return;
		}
	};

	let request = req.payload.to_vec();
	let internal_port = map.internal_port;
	mapping.subscribe(
		Box::new(move |event: &MappingEvent, reply: &mut Reply<'_>| match *event {
			MappingEvent::Changed { public, lifetime } => {
				if public.port() == 0 || public.ip().is_unspecified() {
					return;
				}
				let mut b = resp.clone();
				write_u32(&mut b, LIFETIME, lifetime);
				write_u32(&mut b, EPOCH, reply.epoch.now());
				write_u16(&mut b, EXTERNAL_PORT, public.port());
				b[EXTERNAL_ADDRESS..].copy_from_slice(&rfc_6887::to_pcp_address(*public.ip()));
				reply.send(remote, b);
				info!(
					"{} Response new {} port mapping: {}:{} => {}",
					tag,
					protocol,
					remote.ip(),
					internal_port,
					public
				);
			}
			MappingEvent::Terminated { reason, ready: false } => {
				let epoch = reply.epoch.now();
				reply.send(
					remote,
					rfc_6887::error_response(
						&request,
						ResultCode::NetworkFailure,
						rfc_6887::SHORT_LIFETIME,
						epoch,
					),
				);
				warn!("{} Mapping failed before it was ready: {}", tag, reason);
			}
			MappingEvent::Terminated { .. } => (),
		}),
		&mut ctx.reply,
	);
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::handler::testing::Harness;
	use std::net::SocketAddrV4;

	fn client() -> SocketAddrV4 {
		SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 20), 40123)
	}

	fn map_request(lifetime: u32, source: Ipv4Addr, protocol: u8, internal_port: u16) -> Vec<u8> {
		let mut b = vec![rfc_6887::VERSION, rfc_6887::Opcode::Map as u8, 0, 0];
		b.extend_from_slice(&lifetime.to_be_bytes());
		b.extend_from_slice(&rfc_6887::to_pcp_address(source));
		b.extend_from_slice(&[0xa5; 12]); // nonce
		b.push(protocol);
		b.extend_from_slice(&[0, 0, 0]);
		b.extend_from_slice(&internal_port.to_be_bytes());
		b.extend_from_slice(&internal_port.to_be_bytes());
		b.extend_from_slice(&rfc_6887::to_pcp_address(Ipv4Addr::UNSPECIFIED));
		assert_eq!(b.len(), rfc_6887::MAP_LEN);
		b
	}

	fn u32_at(b: &[u8], offset: usize) -> u32 {
		u32::from_be_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]])
	}

	fn single(h: &mut Harness) -> Vec<u8> {
		let mut sent = h.sent();
		assert_eq!(sent.len(), 1);
		assert_eq!(sent[0].0, SocketAddr::V4(client()));
		sent.remove(0).1
	}

	#[test]
	fn short_request_is_malformed() {
		let mut h = Harness::new();
		let req = map_request(3600, *client().ip(), 17, 51413);
		h.handle(&req[..59], client(), handle);
		let b = single(&mut h);
		assert_eq!(b.len(), 60);
		assert_eq!(b[1], 0x81);
		assert_eq!(b[3], ResultCode::MalformedRequest as u8);
		assert_eq!(u32_at(&b, 4), 1800);
		assert_eq!(&b[24..59], &req[24..59]);
	}

	#[test]
	fn long_request_has_unsupported_option() {
		let mut h = Harness::new();
		let mut req = map_request(3600, *client().ip(), 17, 51413);
		req.push(0x01);
		h.handle(&req, client(), handle);
		let b = single(&mut h);
		assert_eq!(b.len(), 64);
		assert_eq!(b[3], ResultCode::UnsuppOption as u8);
		assert_eq!(u32_at(&b, 4), 1800);
		assert_eq!(b[60], 0x01);
		assert_eq!(&b[61..], &[0, 0, 0]);
	}

	#[test]
	fn only_map_is_supported() {
		let mut h = Harness::new();
		let mut req = map_request(3600, *client().ip(), 17, 51413);
		req[1] = rfc_6887::Opcode::Peer as u8;
		h.handle(&req, client(), handle);
		let b = single(&mut h);
		assert_eq!(b[1], 0x82);
		assert_eq!(b[3], ResultCode::UnsuppOpcode as u8);

		req[1] = rfc_6887::Opcode::Announce as u8;
		h.handle(&req, client(), handle);
		assert_eq!(single(&mut h)[3], ResultCode::UnsuppOpcode as u8);
	}

	#[test]
	fn error_response_is_capped_and_padded() {
		let mut h = Harness::new();
		let mut req = map_request(3600, *client().ip(), 17, 51413);
		req.resize(1500, 0x33);
		h.handle(&req, client(), handle);
		let b = single(&mut h);
		assert_eq!(b.len(), 1100);
		assert_eq!(&b[12..24], &[0u8; 12]);
	}

	#[test]
	fn field_validation() {
		let mut h = Harness::new();
		h.handle(&map_request(3600, *client().ip(), 1, 51413), client(), handle);
		assert_eq!(single(&mut h)[3], ResultCode::UnsuppProtocol as u8);

		h.handle(&map_request(3600, *client().ip(), 6, 0), client(), handle);
		assert_eq!(single(&mut h)[3], ResultCode::UnsuppProtocol as u8);

		let mut req = map_request(3600, *client().ip(), 6, 80);
		req[8] = 0x20; // 2000::/3, not IPv4-mapped
		h.handle(&req, client(), handle);
		assert_eq!(single(&mut h)[3], ResultCode::MalformedRequest as u8);

		h.handle(&map_request(3600, Ipv4Addr::new(192, 168, 1, 21), 6, 80), client(), handle);
		let b = single(&mut h);
		assert_eq!(b[3], ResultCode::AddressMismatch as u8);
		assert_eq!(u32_at(&b, 4), 1800);

		assert!(h.mappings.is_empty());
		assert!(h.launcher.launched().is_empty());
	}

	#[test]
	fn map_is_answered_with_external_endpoint() {
		let mut h = Harness::new();
		let req = map_request(7200, *client().ip(), 17, 51413);
		h.handle(&req, client(), handle);
		assert!(h.sent().is_empty());

		let key = MappingKey {
			source_addr: *client().ip(),
			source_port: 51413,
			protocol: Protocol::Udp,
		};
		h.helper_reports(&key, "203.0.113.8:40000");
		let b = single(&mut h);
		assert_eq!(b.len(), 60);
		assert_eq!(b[0], 2);
		assert_eq!(b[1], 0x81);
		assert_eq!(b[3], 0);
		let lifetime = u32_at(&b, 4);
		assert!(lifetime <= 7200 && lifetime > 7190);
		assert_eq!(&b[12..24], &[0u8; 12]);
		assert_eq!(&b[24..36], &[0xa5; 12]);
		assert_eq!(b[36], 17);
		assert_eq!(&b[40..42], &51413u16.to_be_bytes());
		assert_eq!(&b[42..44], &40000u16.to_be_bytes());
		assert_eq!(
			rfc_6887::from_pcp_address(&b[44..60]),
			Some(Ipv4Addr::new(203, 0, 113, 8))
		);
	}

	#[test]
	fn reserved_fields_are_cleared_in_success() {
		let mut h = Harness::new();
		let mut req = map_request(7200, *client().ip(), 17, 51413);
		for x in &mut req[12..24] {
			*x = 0xee;
		}
		req[37] = 0x11;
		req[38] = 0x22;
		req[39] = 0x33;
		h.handle(&req, client(), handle);
		let key = MappingKey {
			source_addr: *client().ip(),
			source_port: 51413,
			protocol: Protocol::Udp,
		};
		h.helper_reports(&key, "203.0.113.8:40000");
		let b = single(&mut h);
		assert_eq!(b[3], 0);
		assert_eq!(&b[12..24], &[0u8; 12]);
		assert_eq!(b[36], 17);
		assert_eq!(&b[37..40], &[0, 0, 0]);
		assert_eq!(&b[40..42], &51413u16.to_be_bytes());
	}

	#[test]
	fn delete_clears_external_fields() {
		let mut h = Harness::new();
		h.handle(&map_request(7200, *client().ip(), 6, 22), client(), handle);
		let key = MappingKey {
			source_addr: *client().ip(),
			source_port: 22,
			protocol: Protocol::Tcp,
		};
		h.helper_reports(&key, "203.0.113.8:40022");
		h.sent();

		h.handle(&map_request(0, *client().ip(), 6, 22), client(), handle);
		let b = single(&mut h);
		assert_eq!(b[3], 0);
		assert_eq!(u32_at(&b, 4), 0);
		assert_eq!(&b[42..60], &[0u8; 18]);
		assert_eq!(h.launcher.terminated().len(), 1);
		assert!(h.mappings.is_empty());
	}

	#[test]
	fn helper_exit_before_ready_is_a_network_failure() {
		use std::os::unix::process::ExitStatusExt;
		use std::process::ExitStatus;
		use std::time::Instant;

		let mut h = Harness::new();
		h.handle(&map_request(7200, *client().ip(), 17, 5000), client(), handle);
		let key = MappingKey {
			source_addr: *client().ip(),
			source_port: 5000,
			protocol: Protocol::Udp,
		};
		let id = h.mappings.get(&key, Instant::now()).unwrap().id();
		let mut reply = Reply::new(h.epoch, &mut h.outbox);
		h.mappings.on_helper_exit(id, ExitStatus::from_raw(9), &mut reply);

		let b = single(&mut h);
		assert_eq!(b[3], ResultCode::NetworkFailure as u8);
		assert_eq!(u32_at(&b, 4), 30);
	}
}
