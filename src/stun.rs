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

//! Minimal STUN (RFC 5389) Binding client, used only to learn our own
//! public IPv4 address.

use log::{debug, trace};
use rand::prelude::*;
use std::cmp;
use std::convert::TryInto;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::wire::{read_slice, read_u16, read_u32};

pub const STUN_PORT: u16 = 3478;

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;

pub const INITIAL_TIMEOUT: Duration = Duration::from_millis(500);
pub const TIMEOUT_CEILING: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum StunError {
	#[error("timed out waiting for a binding response")]
	Timeout,
	#[error("no IPv4 address found in binding response")]
	NoAddressFound,
	#[error("cannot resolve STUN server {0}")]
	Resolve(String),
	#[error("STUN socket error: {0}")]
	Io(#[from] io::Error),
}

pub type TransactionId = [u8; 12];

pub fn new_transaction_id() -> TransactionId {
	let mut id: TransactionId = [0; 12];
	for x in &mut id {
		*x = random();
	}
	id
}

pub fn binding_request(transaction_id: &TransactionId) -> Vec<u8> {
	let mut b = Vec::with_capacity(HEADER_LEN);
	b.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
	b.extend_from_slice(&0u16.to_be_bytes()); // no attributes
	b.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
	b.extend_from_slice(transaction_id);
	b
}

fn ipv4_attribute(value: &[u8]) -> Option<u32> {
	if value.len() < 8 || value[1] != FAMILY_IPV4 {
		return None;
	}
	Some(u32::from_be_bytes(value[4..8].try_into().ok()?))
}

/// Returns `None` when `msg` is not the success response to
/// `transaction_id` and should be ignored.
pub fn parse_binding_response(
	mut msg: &[u8],
	transaction_id: &TransactionId,
) -> Option<Result<Ipv4Addr, StunError>> {
	let total = msg.len();
	let m = &mut msg;
	let kind = read_u16(m)?;
	let length = read_u16(m)? as usize;
	let cookie = read_u32(m)?;
	let id = read_slice(m, 12)?;

	if kind != BINDING_SUCCESS
		|| length != total - HEADER_LEN
		|| cookie != MAGIC_COOKIE
		|| id != &transaction_id[..]
	{
		return None;
	}

	let mut xor_mapped = None;
	let mut mapped = None;
	let mut body = *m;
	while body.len() >= 4 {
		let b = &mut body;
		let (attr, len) = match (read_u16(b), read_u16(b)) {
			(Some(a), Some(l)) => (a, l as usize),
			_ => break,
		};
		let value = &body[..cmp::min(len, body.len())];
		match attr {
			ATTR_XOR_MAPPED_ADDRESS if xor_mapped.is_none() => {
				xor_mapped = ipv4_attribute(value).map(|a| a ^ MAGIC_COOKIE)
			}
			ATTR_MAPPED_ADDRESS if mapped.is_none() => mapped = ipv4_attribute(value),
			_ => (),
		}
		// attribute values are padded to a multiple of four
		let padded = (len + 3) & !3;
		body = &body[cmp::min(padded, body.len())..];
	}

	if let Some(a) = xor_mapped {
		trace!("Got address from XOR-MAPPED-ADDRESS");
		return Some(Ok(Ipv4Addr::from(a)));
	}
	if let Some(a) = mapped {
		trace!("Got address from MAPPED-ADDRESS");
		return Some(Ok(Ipv4Addr::from(a)));
	}
	Some(Err(StunError::NoAddressFound))
}

/// Accepts `host` or `host:port`; only IPv4 results are used.
pub fn resolve_server(server: &str) -> Result<SocketAddrV4, StunError> {
	let addrs = match server.to_socket_addrs() {
		Ok(a) => a.collect::<Vec<_>>(),
		Err(_) => (server, STUN_PORT)
			.to_socket_addrs()
			.map_err(|e| StunError::Resolve(format!("{}: {}", server, e)))?
			.collect(),
	};
	addrs
		.into_iter()
		.find_map(|a| match a {
			SocketAddr::V4(v4) => Some(v4),
			SocketAddr::V6(_) => None,
		})
		.ok_or_else(|| StunError::Resolve(format!("{}: no IPv4 address", server)))
}

/// One Binding transaction, waiting at most `timeout` for the answer.
pub fn query(server: SocketAddrV4, timeout: Duration) -> Result<Ipv4Addr, StunError> {
	let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
	let transaction_id = new_transaction_id();
	sock.send_to(&binding_request(&transaction_id), server)?;

	let deadline = Instant::now() + timeout;
	let mut buf = [0u8; 1500];
	loop {
		let now = Instant::now();
		if now >= deadline {
			return Err(StunError::Timeout);
		}
		sock.set_read_timeout(Some(deadline - now))?;
		match sock.recv_from(&mut buf) {
			Ok((size, _)) => {
				if let Some(result) = parse_binding_response(&buf[..size], &transaction_id) {
					return result;
				}
			}
			Err(e) => match e.kind() {
				ErrorKind::WouldBlock | ErrorKind::TimedOut => return Err(StunError::Timeout),
				ErrorKind::Interrupted => (),
				_ => return Err(e.into()),
			},
		}
	}
}

/// Runs `attempt` with `initial`, doubling the timeout after every
/// `Timeout` until the next one would exceed `ceiling`.
pub fn with_backoff<F>(
	initial: Duration,
	ceiling: Duration,
	mut attempt: F,
) -> Result<Ipv4Addr, StunError>
where
	F: FnMut(Duration) -> Result<Ipv4Addr, StunError>,
{
	let mut timeout = initial;
	loop {
		match attempt(timeout) {
			Err(StunError::Timeout) => {
				let next = timeout * 2;
				if next > ceiling {
					return Err(StunError::Timeout);
				}
				debug!("STUN request timed out after {:?}, retrying", timeout);
				timeout = next;
			}
			result => return result,
		}
	}
}

pub fn resolve_public_address(server: &str, initial: Duration) -> Result<Ipv4Addr, StunError> {
	let addr = resolve_server(server)?;
	with_backoff(initial, TIMEOUT_CEILING, |t| query(addr, t))
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::thread;

	fn response(id: &TransactionId, attrs: &[(u16, Vec<u8>)]) -> Vec<u8> {
		let mut body = Vec::new();
		for (kind, value) in attrs {
			body.extend_from_slice(&kind.to_be_bytes());
			body.extend_from_slice(&(value.len() as u16).to_be_bytes());
			body.extend_from_slice(value);
			while body.len() % 4 != 0 {
				body.push(0);
			}
		}
		let mut b = Vec::new();
		b.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
		b.extend_from_slice(&(body.len() as u16).to_be_bytes());
		b.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
		b.extend_from_slice(id);
		b.extend_from_slice(&body);
		b
	}

	fn ipv4_value(family: u8, addr: u32) -> Vec<u8> {
		let mut v = vec![0, family, 0x1f, 0x90];
		v.extend_from_slice(&addr.to_be_bytes());
		v
	}

	#[test]
	fn request_header_layout() {
		let id = [7u8; 12];
		let req = binding_request(&id);
		assert_eq!(req.len(), 20);
		assert_eq!(&req[0..4], &[0x00, 0x01, 0x00, 0x00]);
		assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
		assert_eq!(&req[8..], &id);
	}

	#[test]
	fn xor_mapped_address_is_preferred() {
		let id = [1u8; 12];
		let public = u32::from(Ipv4Addr::new(198, 51, 100, 23));
		let private = u32::from(Ipv4Addr::new(10, 0, 0, 1));
		let msg = response(
			&id,
			&[
				(ATTR_MAPPED_ADDRESS, ipv4_value(FAMILY_IPV4, private)),
				(ATTR_XOR_MAPPED_ADDRESS, ipv4_value(FAMILY_IPV4, public ^ MAGIC_COOKIE)),
			],
		);
		let addr = parse_binding_response(&msg, &id).unwrap().unwrap();
		assert_eq!(addr, Ipv4Addr::new(198, 51, 100, 23));
	}

	#[test]
	fn falls_back_to_mapped_address() {
		let id = [2u8; 12];
		let mapped = u32::from(Ipv4Addr::new(203, 0, 113, 9));
		let msg = response(
			&id,
			&[
				(0x8022, b"software".to_vec()),
				(ATTR_MAPPED_ADDRESS, ipv4_value(FAMILY_IPV4, mapped)),
			],
		);
		let addr = parse_binding_response(&msg, &id).unwrap().unwrap();
		assert_eq!(addr, Ipv4Addr::new(203, 0, 113, 9));
	}

	#[test]
	fn ipv6_family_is_no_address() {
		let id = [3u8; 12];
		let msg = response(&id, &[(ATTR_XOR_MAPPED_ADDRESS, ipv4_value(0x02, 1))]);
		match parse_binding_response(&msg, &id) {
			Some(Err(StunError::NoAddressFound)) => (),
			other => panic!("unexpected {:?}", other),
		}
	}

	#[test]
	fn foreign_transaction_is_ignored() {
		let msg = response(&[4u8; 12], &[]);
		assert!(parse_binding_response(&msg, &[5u8; 12]).is_none());
		assert!(parse_binding_response(&msg[..19], &[4u8; 12]).is_none());
	}

	#[test]
	fn backoff_doubles_until_ceiling() {
		let mut seen = Vec::new();
		let result = with_backoff(Duration::from_millis(500), Duration::from_millis(5000), |t| {
			seen.push(t.as_millis());
			Err(StunError::Timeout)
		});
		assert!(matches!(result, Err(StunError::Timeout)));
		assert_eq!(seen, vec![500, 1000, 2000, 4000]);
	}

	#[test]
	fn backoff_stops_on_success_or_final_error() {
		let mut calls = 0;
		let result = with_backoff(INITIAL_TIMEOUT, TIMEOUT_CEILING, |_| {
			calls += 1;
			if calls < 3 {
				Err(StunError::Timeout)
			} else {
				Ok(Ipv4Addr::new(192, 0, 2, 1))
			}
		});
		assert_eq!(result.unwrap(), Ipv4Addr::new(192, 0, 2, 1));
		assert_eq!(calls, 3);

		let mut calls = 0;
		let result = with_backoff(INITIAL_TIMEOUT, TIMEOUT_CEILING, |_| {
			calls += 1;
			Err(StunError::NoAddressFound)
		});
		assert!(matches!(result, Err(StunError::NoAddressFound)));
		assert_eq!(calls, 1);
	}

	#[test]
	fn query_against_loopback_server() {
		let server = UdpSocket::bind("127.0.0.1:0").unwrap();
		let addr = match server.local_addr().unwrap() {
			SocketAddr::V4(a) => a,
			_ => unreachable!(),
		};
		let responder = thread::spawn(move || {
			let mut buf = [0u8; 64];
			let (size, from) = server.recv_from(&mut buf).unwrap();
			assert_eq!(size, 20);
			let id: TransactionId = buf[8..20].try_into().unwrap();
			let public = u32::from(Ipv4Addr::new(198, 51, 100, 77));
			let value = ipv4_value(FAMILY_IPV4, public ^ MAGIC_COOKIE);
			let msg = response(&id, &[(ATTR_XOR_MAPPED_ADDRESS, value)]);
			server.send_to(&msg, from).unwrap();
		});
		let public = query(addr, Duration::from_secs(2)).unwrap();
		assert_eq!(public, Ipv4Addr::new(198, 51, 100, 77));
		responder.join().unwrap();
	}

	#[test]
	fn silent_server_times_out_with_backoff() {
		let silent = UdpSocket::bind("127.0.0.1:0").unwrap();
		let addr = match silent.local_addr().unwrap() {
			SocketAddr::V4(a) => a,
			_ => unreachable!(),
		};
		let mut seen = Vec::new();
		let result = with_backoff(Duration::from_millis(10), Duration::from_millis(100), |t| {
			seen.push(t.as_millis());
			query(addr, t)
		});
		assert!(matches!(result, Err(StunError::Timeout)));
		assert_eq!(seen, vec![10, 20, 40, 80]);
	}
}
