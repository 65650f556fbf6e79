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

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use natpmpd::{Config, Server};

// Reports a fixed public endpoint for whatever bind port it was given,
// then idles until signalled.
const FAKE_NATMAP: &str = r#"#!/bin/sh
while [ $# -gt 0 ]; do
	case "$1" in
		-b) bind="$2"; shift ;;
		-p) port="$2"; shift ;;
	esac
	shift
done
echo $$ > "$PID_DIR/$port.pid"
$BANNER
echo "203.0.113.7 40000 0 $bind udp"
exec sleep 30
"#;

fn install_helper(dir: &Path) -> PathBuf {
	install_helper_with_banner(dir, ":")
}

/// `banner` is a shell command run before the status line is printed.
fn install_helper_with_banner(dir: &Path, banner: &str) -> PathBuf {
	let path = dir.join("natmap");
	let script = FAKE_NATMAP
		.replace("$PID_DIR", &dir.display().to_string())
		.replace("$BANNER", banner);
	fs::write(&path, script).unwrap();
	fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
	path
}

/// Runs a server on an ephemeral loopback port until the test exits.
fn start_server(helper: &Path) -> SocketAddr {
	let mut config = Config::default();
	config.host = Ipv4Addr::LOCALHOST;
	config.port = 0;
	config.exec = helper.display().to_string();
	config.udp_args = String::new();
	// nothing answers here, so the helper is the only address source
	config.stun_server = "127.0.0.1:9".to_string();

	let (tx, rx) = mpsc::channel();
	thread::spawn(move || {
		let mut server = Server::bind(config).unwrap();
		tx.send(server.local_addr().unwrap()).unwrap();
		server.run().unwrap();
	});
	rx.recv_timeout(Duration::from_secs(5)).unwrap()
}

fn client() -> UdpSocket {
	let sock = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
	sock.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
	sock
}

fn exchange(sock: &UdpSocket, server: SocketAddr, request: &[u8]) -> Vec<u8> {
	sock.send_to(request, server).unwrap();
	let mut buf = [0u8; 1100];
	let (size, from) = sock.recv_from(&mut buf).unwrap();
	assert_eq!(from, server);
	buf[..size].to_vec()
}

fn u16_at(b: &[u8], offset: usize) -> u16 {
	u16::from_be_bytes([b[offset], b[offset + 1]])
}

fn u32_at(b: &[u8], offset: usize) -> u32 {
	u32::from_be_bytes([b[offset], b[offset + 1], b[offset + 2], b[offset + 3]])
}

fn read_pid(path: &Path) -> libc::pid_t {
	let deadline = Instant::now() + Duration::from_secs(5);
	loop {
		if let Ok(s) = fs::read_to_string(path) {
			if let Ok(pid) = s.trim().parse() {
				return pid;
			}
		}
		assert!(Instant::now() < deadline, "helper never wrote {}", path.display());
		thread::sleep(Duration::from_millis(10));
	}
}

fn wait_for_exit(pid: libc::pid_t) {
	let deadline = Instant::now() + Duration::from_secs(5);
	while unsafe { libc::kill(pid, 0) } == 0 {
		assert!(Instant::now() < deadline, "helper {} still running", pid);
		thread::sleep(Duration::from_millis(10));
	}
}

#[test]
fn natpmp_map_and_unmap() {
	let dir = tempfile::tempdir().unwrap();
	let server = start_server(&install_helper(dir.path()));
	let sock = client();

	let mut request = vec![0, 1, 0, 0];
	request.extend_from_slice(&51413u16.to_be_bytes());
	request.extend_from_slice(&51413u16.to_be_bytes());
	request.extend_from_slice(&3600u32.to_be_bytes());
	let b = exchange(&sock, server, &request);
	assert_eq!(b.len(), 16);
	assert_eq!(b[0], 0);
	assert_eq!(b[1], 129);
	assert_eq!(u16_at(&b, 2), 0);
	assert_eq!(u16_at(&b, 8), 51413);
	assert_eq!(u16_at(&b, 10), 40000);
	let lifetime = u32_at(&b, 12);
	assert!(lifetime > 0 && lifetime <= 3600);

	// the helper's report also fed the public address
	let b = exchange(&sock, server, &[0, 0]);
	assert_eq!(b.len(), 12);
	assert_eq!(u16_at(&b, 2), 0);
	assert_eq!(&b[8..12], &[203, 0, 113, 7]);

	let pid = read_pid(&dir.path().join("51413.pid"));
	request[8..12].copy_from_slice(&0u32.to_be_bytes());
	let b = exchange(&sock, server, &request);
	assert_eq!(u16_at(&b, 2), 0);
	assert_eq!(u16_at(&b, 10), 0);
	assert_eq!(u32_at(&b, 12), 0);
	wait_for_exit(pid);
}

#[test]
fn versions_are_dispatched() {
	let dir = tempfile::tempdir().unwrap();
	let server = start_server(&install_helper(dir.path()));
	let sock = client();

	let b = exchange(&sock, server, &[1, 0]);
	assert_eq!(b, vec![0, 128, 0, 1, b[4], b[5], b[6], b[7]]);

	// PCP MAP for 127.0.0.1:6881/UDP
	let mut request = vec![2, 1, 0, 0];
	request.extend_from_slice(&600u32.to_be_bytes());
	request.extend_from_slice(&Ipv4Addr::LOCALHOST.to_ipv6_mapped().octets());
	request.extend_from_slice(&[7; 12]);
	request.extend_from_slice(&[17, 0, 0, 0]);
	request.extend_from_slice(&6881u16.to_be_bytes());
	request.extend_from_slice(&0u16.to_be_bytes());
	request.extend_from_slice(&[0; 16]);
	let b = exchange(&sock, server, &request);
	assert_eq!(b.len(), 60);
	assert_eq!(b[1], 0x81);
	assert_eq!(b[3], 0);
	assert_eq!(&b[24..36], &[7; 12]);
	assert_eq!(u16_at(&b, 42), 40000);
	assert_eq!(&b[44..60], &Ipv4Addr::new(203, 0, 113, 7).to_ipv6_mapped().octets());

	let pid = read_pid(&dir.path().join("6881.pid"));
	request[4..8].copy_from_slice(&0u32.to_be_bytes());
	let b = exchange(&sock, server, &request);
	assert_eq!(b[3], 0);
	assert_eq!(u32_at(&b, 4), 0);
	wait_for_exit(pid);
}

#[test]
fn invalid_helper_output_does_not_break_mapping() {
	let dir = tempfile::tempdir().unwrap();
	let helper = install_helper_with_banner(dir.path(), r"printf 'natmap \377\n'; sleep 0.3");
	let server = start_server(&helper);
	let sock = client();

	let mut request = vec![0, 1, 0, 0];
	request.extend_from_slice(&7000u16.to_be_bytes());
	request.extend_from_slice(&7000u16.to_be_bytes());
	request.extend_from_slice(&600u32.to_be_bytes());
	let b = exchange(&sock, server, &request);
	assert_eq!(b.len(), 16);
	assert_eq!(u16_at(&b, 2), 0);
	assert_eq!(u16_at(&b, 10), 40000);

	let pid = read_pid(&dir.path().join("7000.pid"));
	request[8..12].copy_from_slice(&0u32.to_be_bytes());
	let b = exchange(&sock, server, &request);
	assert_eq!(u16_at(&b, 2), 0);
	wait_for_exit(pid);
}
