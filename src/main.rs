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

use clap::{App, Arg, ArgMatches};
use env_logger::Env;
use log::error;
use std::process;

use natpmpd::config::default_config_path;
use natpmpd::{Config, Error, Server};

// command line option => configuration file key
const OVERRIDES: [(&str, &str); 8] = [
	("host", "Host"),
	("port", "Port"),
	("bind", "Bind"),
	("exec", "Exec"),
	("stun-server", "StunServer"),
	("hold-server", "HoldServer"),
	("tcp-args", "TcpArgs"),
	("udp-args", "UdpArgs"),
];

fn run(matches: &ArgMatches) -> Result<(), Error> {
	let mut config = Config::default();
	match matches.value_of("config") {
		Some(p) => config.load_path(p, true)?,
		None => config.load_path(default_config_path(), false)?,
	}
	for (arg, key) in OVERRIDES.iter() {
		if let Some(v) = matches.value_of(arg) {
			config.set(key, v)?;
		}
	}

	let mut server = Server::bind(config)?;
	server.run()
}

fn main() {
	let matches = App::new("natpmpd")
		.version("0.1.0")
		.author("Steven Siloti <ssiloti@gmail.com>")
		.about("NAT-PMP and PCP server backed by natmap")
		.arg(
			Arg::with_name("config")
				.short("c")
				.long("config")
				.value_name("PATH")
				.help("Sets a custom config file or directory")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("host")
				.short("H")
				.long("host")
				.value_name("ADDRESS")
				.help("IPv4 address to listen on [default: 0.0.0.0]")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("port")
				.short("p")
				.long("port")
				.value_name("PORT")
				.help("UDP port to listen on [default: 5351]")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("bind")
				.short("b")
				.long("bind")
				.value_name("LOW-HIGH")
				.help("Range of local ports natmap binds to [default: 9000-9999]")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("exec")
				.long("exec")
				.value_name("PATH")
				.help("natmap executable [default: natmap]")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("stun-server")
				.short("s")
				.long("stun-server")
				.value_name("HOST")
				.help("STUN server [default: stunserver.stunprotocol.org]")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("hold-server")
				.short("h")
				.long("hold-server")
				.value_name("HOST")
				.help("Server natmap keeps the TCP binding alive with [default: qq.com]")
				.takes_value(true),
		)
		.arg(
			Arg::with_name("tcp-args")
				.long("tcp-args")
				.value_name("ARGS")
				.help("Extra natmap arguments for TCP mappings")
				.allow_hyphen_values(true)
				.takes_value(true),
		)
		.arg(
			Arg::with_name("udp-args")
				.long("udp-args")
				.value_name("ARGS")
				.help("Extra natmap arguments for UDP mappings [default: -u]")
				.allow_hyphen_values(true)
				.takes_value(true),
		)
		.arg(
			Arg::with_name("log-level")
				.long("log-level")
				.value_name("LEVEL")
				.help("Log filter, overridden by RUST_LOG [default: info]")
				.takes_value(true),
		)
		.get_matches();

	let level = matches.value_of("log-level").unwrap_or("info");
	env_logger::Builder::from_env(Env::default().default_filter_or(level)).init();

	if let Err(e) = run(&matches) {
		error!("{}", e);
		process::exit(1);
	}
}
