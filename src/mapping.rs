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

//! Port mappings and their lifecycle.
//!
//! Every live mapping is backed by one helper process which does the
//! actual NAT traversal and reports the public endpoint it obtained on
//! stdout. The [`MappingManager`] is the single owner of all mappings;
//! handlers never hold on to a mapping, they subscribe to it.

use log::{debug, info, warn};
use rand::prelude::*;
use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::process::ExitStatus;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::config::{Config, PortRange};
use crate::helper::{HelperCommand, HelperProcess, Launcher};
use crate::wire::Reply;

/// Transport protocols a mapping can be made for, numbered as in the IANA
/// protocol registry (which is what PCP carries on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
	Tcp = 6,
	Udp = 17,
}

impl Protocol {
	pub fn from_number(number: u8) -> Option<Self> {
		match number {
			6 => Some(Protocol::Tcp),
			17 => Some(Protocol::Udp),
			_ => None,
		}
	}

	pub fn number(self) -> u8 {
		self as u8
	}

	pub fn name(self) -> &'static str {
		match self {
			Protocol::Tcp => "TCP",
			Protocol::Udp => "UDP",
		}
	}
}

impl fmt::Display for Protocol {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(self.name())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingKey {
	pub source_addr: Ipv4Addr,
	pub source_port: u16,
	pub protocol: Protocol,
}

impl fmt::Display for MappingKey {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "[{}]{}:{}", self.protocol, self.source_addr, self.source_port)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingId(pub(crate) u64);

impl fmt::Display for MappingId {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
	Request,
	Timeout,
	ProcessExited,
}

impl fmt::Display for StopReason {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		f.write_str(match self {
			StopReason::Request => "client request",
			StopReason::Timeout => "timeout",
			StopReason::ProcessExited => "helper exited",
		})
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingEvent {
	/// The helper reported a (possibly new) public endpoint.
	Changed { public: SocketAddrV4, lifetime: u32 },
	/// The mapping is gone. `ready` tells whether it ever had a public
	/// endpoint; subscribers still waiting for one must fail their request.
	Terminated { reason: StopReason, ready: bool },
}

pub type Subscriber = Box<dyn FnMut(&MappingEvent, &mut Reply<'_>)>;

#[derive(Debug, Error)]
pub enum MappingError {
	#[error("no free {0} bind port")]
	PortsExhausted(Protocol),
	#[error("failed to start helper: {0}")]
	Spawn(#[from] io::Error),
}

pub struct Mapping {
	id: MappingId,
	key: MappingKey,
	bind_port: u16,
	public: Option<SocketAddrV4>,
	expires: Instant,
	process: Box<dyn HelperProcess>,
	subscribers: Vec<Subscriber>,
}

impl Mapping {
	pub fn id(&self) -> MappingId {
		self.id
	}

	pub fn bind_port(&self) -> u16 {
		self.bind_port
	}

	pub fn public(&self) -> Option<SocketAddrV4> {
		self.public
	}

	pub fn lifetime_remaining(&self, now: Instant) -> Duration {
		self.expires.saturating_duration_since(now)
	}

	fn lifetime_secs(&self, now: Instant) -> u32 {
		let secs = self.lifetime_remaining(now).as_secs();
		if secs > u32::max_value() as u64 {
			u32::max_value()
		} else {
			secs as u32
		}
	}

	/// Registers `subscriber` for every future event. If the public
	/// endpoint is already known it is told about it right away.
	pub fn subscribe(&mut self, mut subscriber: Subscriber, reply: &mut Reply<'_>) {
		if let Some(public) = self.public {
			let lifetime = self.lifetime_secs(Instant::now());
			subscriber(&MappingEvent::Changed { public, lifetime }, reply);
		}
		self.subscribers.push(subscriber);
	}

	fn notify(&mut self, event: &MappingEvent, reply: &mut Reply<'_>) {
		for s in self.subscribers.iter_mut() {
			s(event, reply);
		}
	}
}

impl fmt::Display for Mapping {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{} => {} => ", self.key, self.bind_port)?;
		match self.public {
			Some(p) => write!(f, "{}", p),
			None => write!(f, "?:?"),
		}
	}
}

fn seed_cursor(range: PortRange) -> u16 {
	thread_rng().gen_range(range.low, range.high)
}

/// Cyclic bind port cursors, one per protocol.
///
/// Each cursor starts at a random point of `[low, high)` and then moves up
/// by one per allocation, wrapping back to `low`.
#[derive(Debug)]
pub struct BindPorts {
	range: PortRange,
	tcp: Option<u16>,
	udp: Option<u16>,
}

impl BindPorts {
	pub fn new(range: PortRange) -> Self {
		BindPorts {
			range,
			tcp: None,
			udp: None,
		}
	}

	/// Next port for `protocol` for which `in_use` is false, or `None` once
	/// a whole cycle found nothing.
	pub fn allocate<F>(&mut self, protocol: Protocol, in_use: F) -> Option<u16>
	where
		F: Fn(u16) -> bool,
	{
		let range = self.range;
		if range.low >= range.high {
			return None;
		}
		let cursor = match protocol {
			Protocol::Tcp => &mut self.tcp,
			Protocol::Udp => &mut self.udp,
		};
		for _ in range.low..range.high {
			let candidate = match *cursor {
				None => seed_cursor(range),
				Some(prev) => {
					let next = prev as u32 + 1;
					if next >= range.high as u32 {
						range.low
					} else {
						next as u16
					}
				}
			};
			*cursor = Some(candidate);
			if !in_use(candidate) {
				return Some(candidate);
			}
		}
		None
	}
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReportError {
	#[error("expected 5 fields, got {0}")]
	Fields(usize),
	#[error("protocol mismatch: got {0}")]
	Protocol(String),
	#[error("invalid public ip: got {0}")]
	Address(String),
	#[error("invalid public port: got {0}")]
	Port(String),
	#[error("bind port mismatch: got {0}")]
	BindPort(String),
}

fn parse_dotted_quad(s: &str) -> Option<Ipv4Addr> {
	let mut octets = [0u8; 4];
	let mut fields = s.split('.');
	for o in octets.iter_mut() {
		*o = fields.next()?.parse().ok()?;
	}
	if fields.next().is_some() {
		return None;
	}
	Some(Ipv4Addr::from(octets))
}

/// Parses one status line of the helper:
/// `<public address> <public port> <extra> <bind port> <protocol>`.
pub fn parse_report(
	line: &str,
	protocol: Protocol,
	bind_port: u16,
) -> Result<SocketAddrV4, ReportError> {
	let fields: Vec<&str> = line.split_whitespace().collect();
	if fields.len() < 5 {
		return Err(ReportError::Fields(fields.len()));
	}
	let (addr, port) = (fields[0], fields[1]);
	let (reported_bind, reported_protocol) = (fields[3], fields[4]);

	if reported_protocol.to_uppercase() != protocol.name() {
		return Err(ReportError::Protocol(reported_protocol.to_string()));
	}
	let ip = parse_dotted_quad(addr).ok_or_else(|| ReportError::Address(addr.to_string()))?;
	let port = port
		.parse::<u16>()
		.map_err(|_| ReportError::Port(port.to_string()))?;
	match reported_bind.parse::<u16>() {
		Ok(p) if p == bind_port => (),
		_ => return Err(ReportError::BindPort(reported_bind.to_string())),
	}
	Ok(SocketAddrV4::new(ip, port))
}

/// Splits extra helper arguments the way a POSIX shell splits words.
/// Whitespace separates words, single quotes are literal, and a backslash
/// escapes the next character (inside double quotes only `"`, `\`, `$`
/// and the backtick). No expansion of any kind is done.
pub fn split_args(s: &str) -> Vec<String> {
	let mut args = Vec::new();
	let mut word = String::new();
	let mut in_word = false;
	let mut chars = s.chars();
	while let Some(c) = chars.next() {
		match c {
			'\'' => {
				in_word = true;
				for c in chars.by_ref().take_while(|&c| c != '\'') {
					word.push(c);
				}
			}
			'"' => {
				in_word = true;
				while let Some(c) = chars.next() {
					match c {
						'"' => break,
						'\\' => match chars.next() {
							Some(n) if "\"\\$`".contains(n) => word.push(n),
							Some(n) => {
								word.push('\\');
								word.push(n);
							}
							None => word.push('\\'),
						},
						_ => word.push(c),
					}
				}
			}
			'\\' => {
				in_word = true;
				if let Some(n) = chars.next() {
					word.push(n);
				}
			}
			c if c.is_whitespace() => {
				if in_word {
					args.push(std::mem::replace(&mut word, String::new()));
					in_word = false;
				}
			}
			c => {
				in_word = true;
				word.push(c);
			}
		}
	}
	if in_word {
		args.push(word);
	}
	args
}

fn helper_command(config: &Config, key: &MappingKey, bind_port: u16) -> HelperCommand {
	let mut args: Vec<String> = vec![
		"-s".into(),
		config.stun_server.clone(),
		"-h".into(),
		config.hold_server.clone(),
		"-b".into(),
		bind_port.to_string(),
		"-t".into(),
		key.source_addr.to_string(),
		"-p".into(),
		key.source_port.to_string(),
	];
	let extra = match key.protocol {
		Protocol::Tcp => &config.tcp_args,
		Protocol::Udp => &config.udp_args,
	};
	args.extend(split_args(extra));
	HelperCommand {
		program: config.exec.clone(),
		args,
	}
}

pub struct MappingManager {
	config: Config,
	launcher: Box<dyn Launcher>,
	ports: BindPorts,
	mappings: HashMap<MappingKey, Mapping>,
	keys: HashMap<MappingId, MappingKey>,
	next_id: u64,
}

impl MappingManager {
	pub fn new(config: Config, launcher: Box<dyn Launcher>) -> Self {
		MappingManager {
			ports: BindPorts::new(config.bind_ports),
			config,
			launcher,
			mappings: HashMap::new(),
			keys: HashMap::new(),
			next_id: 1,
		}
	}

	pub fn len(&self) -> usize {
		self.mappings.len()
	}

	pub fn is_empty(&self) -> bool {
		self.mappings.is_empty()
	}

	/// The live mapping for `key`, if any. Expired mappings waiting for the
	/// next timer tick are not returned.
	pub fn get(&self, key: &MappingKey, now: Instant) -> Option<&Mapping> {
		self.mappings.get(key).filter(|m| m.expires > now)
	}

	/// Creates the mapping for `key`, or renews it if it already exists.
	///
	/// A new mapping is returned as soon as its helper is spawned; the
	/// public endpoint arrives later as a [`MappingEvent::Changed`].
	pub fn start(
		&mut self,
		key: MappingKey,
		lifetime: Duration,
		now: Instant,
		reply: &mut Reply<'_>,
	) -> Result<&mut Mapping, MappingError> {
		if self.mappings.get(&key).map_or(false, |m| m.expires <= now) {
			self.stop(&key, StopReason::Timeout, reply);
		}

		let in_use: HashSet<u16> = self
			.mappings
			.values()
			.filter(|m| m.key.protocol == key.protocol)
			.map(|m| m.bind_port)
			.collect();

		match self.mappings.entry(key) {
			Entry::Occupied(o) => {
				let mapping = o.into_mut();
				mapping.expires = now + lifetime;
				info!(
					"{}: Mapping lifetime updated to {} seconds",
					mapping,
					lifetime.as_secs()
				);
				Ok(mapping)
			}
			Entry::Vacant(v) => {
				let bind_port = self
					.ports
					.allocate(key.protocol, |p| in_use.contains(&p))
					.ok_or(MappingError::PortsExhausted(key.protocol))?;
				let id = MappingId(self.next_id);
				self.next_id += 1;

				let command = helper_command(&self.config, &key, bind_port);
				debug!("> {}", command);
				let label = format!("{} => {}", key, bind_port);
				let process = self.launcher.launch(id, &label, &command)?;

				self.keys.insert(id, key);
				let mapping = v.insert(Mapping {
					id,
					key,
					bind_port,
					public: None,
					expires: now + lifetime,
					process,
					subscribers: Vec::new(),
				});
				info!("{}: Mapping created", mapping);
				Ok(mapping)
			}
		}
	}

	/// Tears down the mapping for `key`: the helper is signalled, the
	/// lease is dropped and subscribers get a final
	/// [`MappingEvent::Terminated`].
	pub fn stop(
		&mut self,
		key: &MappingKey,
		reason: StopReason,
		reply: &mut Reply<'_>,
	) -> Option<Mapping> {
		let mut mapping = self.mappings.remove(key)?;
		self.keys.remove(&mapping.id);
		mapping.process.terminate();
		let ready = mapping.public.is_some();
		mapping.notify(&MappingEvent::Terminated { reason, ready }, reply);
		mapping.subscribers.clear();
		info!("{}: Mapping removed ({})", mapping, reason);
		Some(mapping)
	}

	/// Stops every mapping of `protocol` held by `source_addr`.
	pub fn stop_all(
		&mut self,
		source_addr: Ipv4Addr,
		protocol: Protocol,
		reason: StopReason,
		reply: &mut Reply<'_>,
	) -> usize {
		let keys: Vec<MappingKey> = self
			.mappings
			.keys()
			.filter(|k| k.source_addr == source_addr && k.protocol == protocol)
			.cloned()
			.collect();
		keys.iter()
			.filter(|k| self.stop(k, reason, reply).is_some())
			.count()
	}

	/// Earliest lease expiry, for the event loop's poll timeout.
	pub fn next_deadline(&self) -> Option<Instant> {
		self.mappings.values().map(|m| m.expires).min()
	}

	pub fn expire(&mut self, now: Instant, reply: &mut Reply<'_>) -> usize {
		let expired: Vec<MappingKey> = self
			.mappings
			.values()
			.filter(|m| m.expires <= now)
			.map(|m| m.key)
			.collect();
		expired
			.iter()
			.filter(|k| self.stop(k, StopReason::Timeout, reply).is_some())
			.count()
	}

	/// Handles one stdout line of helper `id`. Returns the reported public
	/// address when the line was a valid update.
	pub fn on_helper_output(
		&mut self,
		id: MappingId,
		line: &str,
		now: Instant,
		reply: &mut Reply<'_>,
	) -> Option<Ipv4Addr> {
		let key = match self.keys.get(&id) {
			Some(k) => *k,
			None => {
				debug!("Ignoring output of retired helper {}: {}", id, line);
				return None;
			}
		};
		let mapping = self.mappings.get_mut(&key)?;
		match parse_report(line, key.protocol, mapping.bind_port) {
			Ok(public) => {
				mapping.public = Some(public);
				info!("{}: Mapping updated", mapping);
				let lifetime = mapping.lifetime_secs(now);
				mapping.notify(&MappingEvent::Changed { public, lifetime }, reply);
				Some(*public.ip())
			}
			Err(e) => {
				warn!("{}: {} from {}", mapping, e, self.config.exec);
				None
			}
		}
	}

	/// Handles the exit of helper `id`. A mapping whose helper dies is
	/// torn down.
	pub fn on_helper_exit(
		&mut self,
		id: MappingId,
		status: ExitStatus,
		reply: &mut Reply<'_>,
	) -> Option<Mapping> {
		let key = match self.keys.get(&id) {
			Some(k) => *k,
			None => {
				debug!("Helper {} exited with {}", id, status);
				return None;
			}
		};
		warn!("{}: helper exited unexpectedly with {}", key, status);
		self.stop(&key, StopReason::ProcessExited, reply)
	}
}
