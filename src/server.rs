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

//! The dispatcher: one poll loop owning the socket and all daemon state.
//!
//! Work that may block (the STUN probe, reading helper output, reaping
//! helpers) runs on its own thread and reports back through a [`Notifier`].

use log::{debug, info, warn};
use mio::net::UdpSocket;
use mio::{Events, Poll, PollOpt, Ready, Registration, SetReadiness, Token};
use std::cmp;
use std::io::{self, ErrorKind};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::process::ExitStatus;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::announce::Announcer;
use crate::config::Config;
use crate::handler::{Context, Request};
use crate::helper::ProcessLauncher;
use crate::mapping::{MappingId, MappingManager};
use crate::pcp::rfc_6887;
use crate::public_addr::PublicAddress;
use crate::stun::{self, StunError};
use crate::wire::{Epoch, Outbox, Reply};
use crate::{natpmp, pcp, Error};

const SOCKET_TOKEN: Token = Token(0);
const EVENTS_TOKEN: Token = Token(1);

// larger than any request either protocol accepts
const RECEIVE_BUFFER_LEN: usize = 2048;

/// Results delivered to the poll loop by worker threads.
#[derive(Debug)]
pub enum Event {
	PublicAddress(Result<Ipv4Addr, StunError>),
	HelperOutput { id: MappingId, line: String },
	HelperExited { id: MappingId, status: ExitStatus },
}

/// Sending half of the event channel; wakes the poll loop.
#[derive(Clone)]
pub struct Notifier {
	tx: Sender<Event>,
	readiness: SetReadiness,
}

impl Notifier {
	pub fn new(tx: Sender<Event>, readiness: SetReadiness) -> Self {
		Notifier { tx, readiness }
	}

	/// Events sent after the server is gone are dropped.
	pub fn send(&self, event: Event) {
		if self.tx.send(event).is_ok() {
			let _ = self.readiness.set_readiness(Ready::readable());
		}
	}
}

pub struct Server {
	config: Config,
	poll: Poll,
	socket: UdpSocket,
	// must outlive its poll registration
	_registration: Registration,
	events: Receiver<Event>,
	notifier: Notifier,
	mappings: MappingManager,
	public: PublicAddress,
	announcer: Announcer,
	outbox: Outbox,
	epoch: Epoch,
	next_request: u32,
	probing: bool,
}

impl Server {
	pub fn bind(config: Config) -> Result<Server, Error> {
		let addr = SocketAddr::V4(SocketAddrV4::new(config.host, config.port));
		let socket = UdpSocket::bind(&addr)?;
		let local = socket.local_addr()?;

		let poll = Poll::new()?;
		poll.register(&socket, SOCKET_TOKEN, Ready::readable(), PollOpt::edge())?;
		let (registration, readiness) = Registration::new2();
		poll.register(&registration, EVENTS_TOKEN, Ready::readable(), PollOpt::edge())?;

		let (tx, events) = mpsc::channel();
		let notifier = Notifier::new(tx, readiness);
		let launcher = ProcessLauncher::new(notifier.clone());
		info!("Listening on {}", local);

		Ok(Server {
			mappings: MappingManager::new(config.clone(), Box::new(launcher)),
			announcer: Announcer::new(local.port()),
			config,
			poll,
			socket,
			_registration: registration,
			events,
			notifier,
			public: PublicAddress::new(),
			outbox: Outbox::new(),
			epoch: Epoch::new(Instant::now()),
			next_request: 1,
			probing: false,
		})
	}

	pub fn local_addr(&self) -> io::Result<SocketAddr> {
		self.socket.local_addr()
	}

	/// Serves requests until a fatal poll error.
	pub fn run(&mut self) -> Result<(), Error> {
		self.probe();

		let mut events = Events::with_capacity(32);
		let mut receive_buffer = vec![0u8; RECEIVE_BUFFER_LEN];
		loop {
			let timeout = self.next_timeout(Instant::now());
			if let Err(e) = self.poll.poll(&mut events, timeout) {
				if e.kind() == ErrorKind::Interrupted {
					continue;
				}
				return Err(e.into());
			}

			for event in &events {
				match event.token() {
					SOCKET_TOKEN => self.receive(&mut receive_buffer),
					EVENTS_TOKEN => self.drain_events(),
					Token(t) => warn!("Event with unknown token: {}", t),
				}
			}

			self.tick(Instant::now());
			self.flush();
		}
	}

	fn next_timeout(&self, now: Instant) -> Option<Duration> {
		let deadline = match (self.mappings.next_deadline(), self.announcer.next_deadline()) {
			(Some(a), Some(b)) => Some(cmp::min(a, b)),
			(a, b) => a.or(b),
		};
		deadline.map(|d| d.saturating_duration_since(now))
	}

	fn receive(&mut self, buf: &mut [u8]) {
		loop {
			match self.socket.recv_from(buf) {
				Ok((size, SocketAddr::V4(remote))) => self.dispatch(&buf[..size], remote),
				Ok((_, remote)) => debug!("Ignoring datagram from {}", remote),
				Err(e) => {
					match e.kind() {
						ErrorKind::WouldBlock => (),
						_ => warn!("Error reading from socket {}", e),
					};
					break;
				}
			}
		}
	}

	fn dispatch(&mut self, payload: &[u8], remote: SocketAddrV4) {
		let id = self.next_request;
		self.next_request = self.next_request.wrapping_add(1);
		let request = Request::new(id, payload, remote);

		let reply = Reply::new(self.epoch, &mut self.outbox);
		let mut ctx = Context::new(&mut self.mappings, &self.public, reply, Instant::now());
		match request.version() {
			rfc_6887::VERSION => pcp::handle(&request, &mut ctx),
			// anything else gets rejected by the NAT-PMP version check
			_ => natpmp::handle(&request, &mut ctx),
		}
		let probe_wanted = ctx.probe_wanted;
		if probe_wanted {
			self.probe();
		}
	}

	fn drain_events(&mut self) {
		let _ = self.notifier.readiness.set_readiness(Ready::empty());
		while let Ok(event) = self.events.try_recv() {
			self.on_event(event);
		}
	}

	fn on_event(&mut self, event: Event) {
		let now = Instant::now();
		match event {
			Event::PublicAddress(result) => {
				self.probing = false;
				match result {
					Ok(addr) => self.update_public(addr, now),
					Err(e) => warn!(
						"Failed to resolve public address via {}: {}",
						self.config.stun_server, e
					),
				}
			}
			Event::HelperOutput { id, line } => {
				let mut reply = Reply::new(self.epoch, &mut self.outbox);
				let reported = self.mappings.on_helper_output(id, &line, now, &mut reply);
				if let Some(addr) = reported {
					self.update_public(addr, now);
				}
			}
			Event::HelperExited { id, status } => {
				let mut reply = Reply::new(self.epoch, &mut self.outbox);
				self.mappings.on_helper_exit(id, status, &mut reply);
			}
		}
	}

	fn update_public(&mut self, addr: Ipv4Addr, now: Instant) {
		if self.public.set(addr).is_some() {
			self.announcer.restart(now);
		}
	}

	fn tick(&mut self, now: Instant) {
		let mut reply = Reply::new(self.epoch, &mut self.outbox);
		let expired = self.mappings.expire(now, &mut reply);
		if expired > 0 {
			debug!("{} mapping(s) expired, {} left", expired, self.mappings.len());
		}
		self.announcer.poll(now, &self.public, &mut reply);
	}

	fn flush(&mut self) {
		for (dest, payload) in self.outbox.drain() {
			if let Err(e) = self.socket.send_to(&payload, &dest) {
				debug!("Failed to send {} bytes to {}: {}", payload.len(), dest, e);
			}
		}
	}

	/// Starts a STUN probe on its own thread unless one is running.
	fn probe(&mut self) {
		if self.probing {
			return;
		}
		self.probing = true;
		let server = self.config.stun_server.clone();
		let notifier = self.notifier.clone();
		debug!("Resolving public address via {}", server);
		let spawned = thread::Builder::new()
			.name("stun".to_string())
			.spawn(move || {
				let result = stun::resolve_public_address(&server, stun::INITIAL_TIMEOUT);
				notifier.send(Event::PublicAddress(result));
			});
		if let Err(e) = spawned {
			self.probing = false;
			warn!("Failed to start STUN probe: {}", e);
		}
	}
}
