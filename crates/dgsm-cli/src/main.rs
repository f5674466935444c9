mod config;
mod console;
mod coordinator;
mod paths;

use config::{Config, Located};
use console::Console;
use coordinator::{Coordinator, RemoteHandler};
use dgsm_link::{Link, LinkConfig};
use owo_colors::OwoColorize;
use paths::AppPaths;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() {
	let args: Vec<String> = std::env::args().skip(1).collect();
	let mut config_path: Option<PathBuf> = None;

	let mut i = 0;
	while i < args.len() {
		match args[i].as_str() {
			"help" | "--help" | "-h" => {
				print_usage();
				return;
			}
			"version" | "--version" | "-V" => {
				println!("dgsm {}", env!("CARGO_PKG_VERSION"));
				return;
			}
			"--config" | "-c" => {
				i += 1;
				match args.get(i) {
					Some(path) => config_path = Some(PathBuf::from(path)),
					None => {
						eprintln!("{} --config needs a path", "error:".red());
						std::process::exit(1);
					}
				}
			}
			other => {
				eprintln!("{} unknown argument '{}'", "error:".red(), other);
				print_usage();
				std::process::exit(1);
			}
		}
		i += 1;
	}

	let paths = AppPaths::from_env();
	init_logging(&paths);

	let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
	let path = match config::locate(config_path.as_deref(), &cwd, paths.config_dir()) {
		Ok(Located::Found(path)) => path,
		Ok(Located::Created(path)) => {
			println!("No config file was found. A template was written to:");
			println!("  {}", path.display().cyan());
			println!("Fill it in and start dgsm again.");
			return;
		}
		Err(e) => {
			eprintln!("{} {}", "error:".red(), e);
			std::process::exit(1);
		}
	};
	let config = match config::load(&path) {
		Ok(config) => config,
		Err(e) => {
			eprintln!("{} {}", "error:".red(), e);
			std::process::exit(1);
		}
	};
	println!("Using {} to configure this instance", path.display());
	tracing::info!("loaded config from {}", path.display());

	run(config).await;
}

async fn run(config: Config) {
	let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
	let (console_tx, console_rx) = mpsc::unbounded_channel();

	let (coordinator, warnings) = Coordinator::from_config(&config, outbox_tx);
	for warning in &warnings {
		eprintln!("{} {}", "warning:".yellow(), warning);
	}

	let link_config = LinkConfig::new(config.role, config.link_addr())
		.poll_interval(Duration::from_secs(config.reconnect_secs.max(1)));
	let link = Link::new(link_config, RemoteHandler::new(Arc::clone(&coordinator)));
	tokio::spawn(coordinator::route(
		outbox_rx,
		link.clone(),
		console_tx.clone(),
		Arc::clone(&coordinator),
	));
	link.spawn().await;

	print_banner(&coordinator, &config);
	coordinator.start_defaults(&config.default_apps);

	let shutdown = coordinator.shutdown_token();
	{
		let shutdown = shutdown.clone();
		tokio::spawn(async move {
			if tokio::signal::ctrl_c().await.is_ok() {
				tracing::info!("interrupted");
				shutdown.cancel();
			}
		});
	}

	Console::new(Arc::clone(&coordinator), console_tx, console_rx)
		.run(shutdown)
		.await;

	coordinator.shutdown_apps().await;
	tracing::info!("all applications stopped");
	// Let queued replies reach the controller before the link goes away.
	tokio::time::sleep(Duration::from_millis(500)).await;
	link.stop().await;

	if coordinator.wants_power_off() {
		if let Some(cmd) = &config.sleep_command {
			power_off(cmd).await;
		}
	}
}

async fn power_off(cmd: &str) {
	tracing::info!("running sleep command: {}", cmd);
	match shell(cmd).status().await {
		Ok(status) if status.success() => {}
		Ok(status) => {
			tracing::error!("sleep command exited with {}", status);
			eprintln!("{} sleep command exited with {}", "error:".red(), status);
		}
		Err(e) => {
			tracing::error!("failed to run sleep command: {}", e);
			eprintln!("{} failed to run sleep command: {}", "error:".red(), e);
		}
	}
}

#[cfg(unix)]
fn shell(cmd: &str) -> tokio::process::Command {
	let mut shell = tokio::process::Command::new("sh");
	shell.arg("-c").arg(cmd);
	shell
}

#[cfg(windows)]
fn shell(cmd: &str) -> tokio::process::Command {
	let mut shell = tokio::process::Command::new("cmd");
	shell.arg("/C").arg(cmd);
	shell
}

fn init_logging(paths: &AppPaths) {
	let log_path = paths.log_path();
	let opened = std::fs::create_dir_all(paths.state_dir()).and_then(|_| {
		std::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&log_path)
	});
	match opened {
		Ok(file) => {
			tracing_subscriber::fmt()
				.with_writer(std::sync::Mutex::new(file))
				.with_ansi(false)
				.init();
		}
		Err(e) => {
			eprintln!(
				"{} could not open {}: {}; logging to stderr",
				"warning:".yellow(),
				log_path.display(),
				e
			);
			tracing_subscriber::fmt()
				.with_writer(std::io::stderr)
				.with_max_level(tracing::Level::WARN)
				.init();
		}
	}
}

fn print_banner(coordinator: &Coordinator, config: &Config) {
	println!("The following applications have been added to the configuration:");
	for app in coordinator.apps() {
		println!("  {} - {}", app.name().bold(), app.profile().id);
	}
	match config.role {
		dgsm_link::Role::Listen => println!(
			"Waiting for the remote controller to connect on {}",
			config.link_addr().cyan()
		),
		dgsm_link::Role::Dial => println!(
			"Connecting to the remote controller at {}",
			config.link_addr().cyan()
		),
	}
	println!("Use {} to stop", "exit".bold());
}

fn print_usage() {
	println!("{} - game server manager", "dgsm".bold());
	println!();
	println!("{}", "Usage:".bold());
	println!("  dgsm [--config <path>]");
	println!();
	println!("{}", "Options:".bold());
	println!("  {}  Config file (default: ./dgsm.toml, then ~/.config/dgsm/dgsm.toml)", "-c, --config".cyan());
	println!("  {}    Show this help", "-h, --help".cyan());
	println!("  {} Show version", "-V, --version".cyan());
	println!();
	println!("Once running, type {} for the list of commands.", "help".cyan());
}
