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

//! Supervision of the external helper (natmap) processes.
//!
//! The manager only sees the [`Launcher`] and [`HelperProcess`] traits.
//! [`ProcessLauncher`] is the real implementation: it spawns the program,
//! forwards each stdout line and the final exit status to the event loop,
//! and logs whatever the helper writes to stderr.

use log::{debug, warn};
use std::fmt;
use std::io::{self, BufRead, BufReader, ErrorKind, Read};
use std::mem;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::mapping::MappingId;
use crate::server::{Event, Notifier};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
	pub program: String,
	pub args: Vec<String>,
}

impl fmt::Display for HelperCommand {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}", self.program)?;
		for a in &self.args {
			write!(f, " {}", a)?;
		}
		Ok(())
	}
}

/// A running helper. Owned by exactly one mapping.
pub trait HelperProcess {
	/// Ask the helper to exit. Its exit is reported later as an event.
	fn terminate(&mut self);
}

pub trait Launcher {
	fn launch(
		&mut self,
		id: MappingId,
		label: &str,
		command: &HelperCommand,
	) -> io::Result<Box<dyn HelperProcess>>;
}

pub struct ProcessLauncher {
	notifier: Notifier,
}

impl ProcessLauncher {
	pub fn new(notifier: Notifier) -> Self {
		ProcessLauncher { notifier }
	}
}

/// Signal used to stop a helper.
pub const STOP_SIGNAL: libc::c_int = libc::SIGINT;

/// Liveness of a spawned helper, shared between the mapping that owns it
/// and the thread that reaps it. The pid is only valid while `exited` is
/// false; the reaper sets it under the lock before the zombie is released.
#[derive(Debug)]
struct ChildState {
	pid: u32,
	exited: bool,
	signalled: bool,
}

impl ChildState {
	/// Returns whether `signal` was delivered.
	fn signal(&mut self, signal: libc::c_int) -> bool {
		if self.exited || self.signalled {
			return false;
		}
		self.signalled = true;
		match send_signal(self.pid, signal) {
			Ok(()) => true,
			Err(e) => {
				debug!("Failed to signal helper {}: {}", self.pid, e);
				false
			}
		}
	}
}

struct SpawnedHelper {
	state: Arc<Mutex<ChildState>>,
}

fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
	let r = unsafe { libc::kill(pid as libc::pid_t, signal) };
	if r == 0 {
		Ok(())
	} else {
		Err(io::Error::last_os_error())
	}
}

/// Blocks until `pid` has exited, leaving it unreaped.
fn wait_exited(pid: u32) -> io::Result<()> {
	loop {
		let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
		let r = unsafe {
			libc::waitid(
				libc::P_PID,
				pid as libc::id_t,
				&mut info,
				libc::WEXITED | libc::WNOWAIT,
			)
		};
		if r == 0 {
			return Ok(());
		}
		let e = io::Error::last_os_error();
		if e.kind() != ErrorKind::Interrupted {
			return Err(e);
		}
	}
}

/// Calls `f` with every line of `source`. Lines are decoded lossily so a
/// stray byte never stops the reader (and with it the helper, on SIGPIPE).
fn for_each_line<R: Read, F: FnMut(String)>(source: R, mut f: F) -> io::Result<()> {
	let mut reader = BufReader::new(source);
	let mut buf = Vec::new();
	loop {
		buf.clear();
		match reader.read_until(b'\n', &mut buf) {
			Ok(0) => return Ok(()),
			Ok(_) => {
				while buf.last().map_or(false, |&b| b == b'\n' || b == b'\r') {
					buf.pop();
				}
				f(String::from_utf8_lossy(&buf).into_owned());
			}
			Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
			Err(e) => return Err(e),
		}
	}
}

impl HelperProcess for SpawnedHelper {
	fn terminate(&mut self) {
		match self.state.lock() {
			Ok(mut state) => {
				state.signal(STOP_SIGNAL);
			}
			Err(_) => warn!("Helper state poisoned, not signalling"),
		}
	}
}

impl ProcessLauncher {
	fn spawn(
		&self,
		id: MappingId,
		label: &str,
		command: &HelperCommand,
	) -> io::Result<Arc<Mutex<ChildState>>> {
		let mut child = Command::new(&command.program)
			.args(&command.args)
			.stdin(Stdio::null())
			.stdout(Stdio::piped())
			.stderr(Stdio::piped())
			.spawn()?;
		let pid = child.id();
		let stdout = child.stdout.take();
		let stderr = child.stderr.take();

		if let Some(err) = stderr {
			let prefix = label.to_string();
			let spawned = thread::Builder::new()
				.name(format!("helper-{}-stderr", id))
				.spawn(move || {
					let logged = for_each_line(err, |line| debug!("{}: {}", prefix, line));
					if let Err(e) = logged {
						debug!("{}: error reading stderr: {}", prefix, e);
					}
				});
			if let Err(e) = spawned {
				warn!("{}: cannot start stderr logger: {}", label, e);
				let _ = child.kill();
				let _ = child.wait();
				return Err(e);
			}
		}

		let state = Arc::new(Mutex::new(ChildState {
			pid,
			exited: false,
			signalled: false,
		}));
		let reaper_state = state.clone();
		let notifier = self.notifier.clone();
		let spawned = thread::Builder::new()
			.name(format!("helper-{}", id))
			.spawn(move || {
				if let Some(out) = stdout {
					let read = for_each_line(out, |line| {
						notifier.send(Event::HelperOutput { id, line })
					});
					if let Err(e) = read {
						warn!("Error reading helper output: {}", e);
					}
				}
				if let Err(e) = wait_exited(pid) {
					warn!("Error waiting for helper {}: {}", pid, e);
				}
				if let Ok(mut s) = reaper_state.lock() {
					s.exited = true;
				}
				match child.wait() {
					Ok(status) => notifier.send(Event::HelperExited { id, status }),
					Err(e) => warn!("Error reaping helper {}: {}", pid, e),
				}
			});
		if let Err(e) = spawned {
			// the closure owning the child is gone; kill and reap by pid
			let _ = send_signal(pid, libc::SIGKILL);
			let mut status = 0;
			unsafe { libc::waitpid(pid as libc::pid_t, &mut status, 0) };
			return Err(e);
		}

		debug!("{}: started helper pid {}", label, pid);
		Ok(state)
	}
}

impl Launcher for ProcessLauncher {
	fn launch(
		&mut self,
		id: MappingId,
		label: &str,
		command: &HelperCommand,
	) -> io::Result<Box<dyn HelperProcess>> {
		let state = self.spawn(id, label, command)?;
		Ok(Box::new(SpawnedHelper { state }))
	}
}
