#![cfg(unix)]

use dgsm_proc::detect::DetectorSet;
use dgsm_proc::{
	profiles, AppDef, CommandError, Lifecycle, Notice, Reply, Supervisor, SupervisorOptions,
	TeeConfig, Timeouts,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn timeouts(start_ms: u64) -> Timeouts {
	Timeouts {
		start: Duration::from_millis(start_ms),
		stop: Duration::from_secs(5),
		force: Duration::from_secs(1),
	}
}

fn def(name: &str, script: &str) -> AppDef {
	let mut app_info = BTreeMap::new();
	app_info.insert("endpoint".to_string(), "play.example.net".to_string());
	AppDef {
		name: name.to_string(),
		argv: vec!["sh".into(), "-c".into(), script.into()],
		app_info,
		new_console: false,
	}
}

fn minecraft(script: &str, t: Timeouts) -> Arc<Supervisor> {
	let profile = profiles::lookup("minecraft").unwrap();
	Supervisor::new(
		def("mc", script),
		profile,
		profile.detectors().unwrap(),
		SupervisorOptions {
			timeouts: t,
			..SupervisorOptions::default()
		},
	)
}

fn plain(script: &str, ready_after: Duration) -> Arc<Supervisor> {
	Supervisor::new(
		def("tool", script),
		&profiles::DEFAULT,
		DetectorSet::delayed(ready_after),
		SupervisorOptions {
			timeouts: timeouts(5_000),
			..SupervisorOptions::default()
		},
	)
}

fn sink() -> (Reply, mpsc::UnboundedReceiver<Notice>) {
	let (tx, rx) = mpsc::unbounded_channel();
	(Arc::new(tx), rx)
}

fn texts(rx: &mut mpsc::UnboundedReceiver<Notice>) -> Vec<String> {
	let mut out = Vec::new();
	while let Ok(notice) = rx.try_recv() {
		if let Notice::Text(text) = notice {
			out.push(text);
		}
	}
	out
}

async fn until_idle(sup: &Supervisor) {
	let mut life = sup.watch();
	timeout(Duration::from_secs(5), life.wait_for(|s| *s == Lifecycle::Idle))
		.await
		.expect("supervisor never went idle")
		.unwrap();
}

const SERVER: &str = "echo 'Starting minecraft server version 1.20.4'; \
	echo 'Done (1.5s)! For help, type \"help\"'; \
	while read line; do echo \"got $line\"; done";

// --- Start ---

#[tokio::test]
async fn start_reports_ready_and_stop_cleans_up() {
	let sup = minecraft(SERVER, timeouts(5_000));
	let (reply, mut rx) = sink();

	sup.start(reply.clone()).await;
	let got = texts(&mut rx);
	assert_eq!(got[0], "Starting mc");
	assert_eq!(got[1], "mc has started\nEndpoint: play.example.net");
	assert_eq!(sup.lifecycle(), Lifecycle::Running);
	assert_eq!(sup.status(), "Online");
	assert_eq!(sup.app_state().version.as_deref(), Some("1.20.4"));

	let report = sup.status_report();
	assert!(report.starts_with("mc - Minecraft\n  version: 1.20.4\n"), "{}", report);
	assert!(report.contains("  endpoint: play.example.net\n"));
	assert!(report.contains("0 players online"));
	assert!(report.contains("CPU: "));

	let waiter = sup
		.broker()
		.count_waiter(1, false, Duration::from_secs(5))
		.unwrap();
	assert!(sup.message_app("  hello  ").await);
	assert_eq!(waiter.wait().await, "got hello\n");

	sup.stop(reply).await;
	assert_eq!(texts(&mut rx), vec!["mc has stopped"]);
	assert_eq!(sup.lifecycle(), Lifecycle::Idle);
	assert!(sup.broker().is_empty());
	assert!(!sup.message_app("late").await);
	assert_eq!(sup.status(), "Offline");
}

#[tokio::test]
async fn second_start_is_refused() {
	let sup = minecraft(SERVER, timeouts(5_000));
	let (reply, mut rx) = sink();
	sup.start(reply.clone()).await;
	texts(&mut rx);

	sup.start(reply).await;
	assert_eq!(texts(&mut rx), vec!["mc is already running"]);

	sup.force_stop().await;
	assert_eq!(sup.lifecycle(), Lifecycle::Idle);
}

#[tokio::test]
async fn start_timeout_keeps_process_supervised() {
	let sup = minecraft("sleep 30", timeouts(300));
	let (reply, mut rx) = sink();

	sup.start(reply).await;
	let got = texts(&mut rx);
	assert_eq!(got, vec!["Starting mc", "mc is unable to start"]);
	assert_eq!(sup.lifecycle(), Lifecycle::Running);
	assert_eq!(sup.status(), "Offline");
	assert!(sup.pid().is_some());

	sup.force_stop().await;
	assert_eq!(sup.lifecycle(), Lifecycle::Idle);
	assert!(texts(&mut rx).is_empty());
}

#[tokio::test]
async fn exit_before_ready_fails_immediately() {
	let sup = minecraft("echo booting; exit 3", timeouts(30_000));
	let (reply, mut rx) = sink();

	timeout(Duration::from_secs(5), sup.start(reply))
		.await
		.expect("start should not wait for the full timeout");
	let got = texts(&mut rx);
	assert_eq!(got, vec!["Starting mc", "mc is unable to start"]);
	assert_eq!(sup.lifecycle(), Lifecycle::Idle);
}

#[tokio::test]
async fn retry_after_early_exit_starts_again() {
	let sup = minecraft("echo booting; exit 3", timeouts(30_000));
	let (reply, mut rx) = sink();

	for attempt in 0..5 {
		timeout(Duration::from_secs(5), sup.start(reply.clone()))
			.await
			.expect("start should not wait for the full timeout");
		assert_eq!(sup.lifecycle(), Lifecycle::Idle, "attempt {}", attempt);
		assert_eq!(
			texts(&mut rx),
			vec!["Starting mc", "mc is unable to start"],
			"attempt {}",
			attempt
		);
	}
}

#[tokio::test]
async fn teed_app_runs_under_the_relay() {
	let profile = profiles::lookup("minecraft").unwrap();
	let sup = Supervisor::new(
		AppDef {
			new_console: true,
			..def("mc", SERVER)
		},
		profile,
		profile.detectors().unwrap(),
		SupervisorOptions {
			tee: TeeConfig {
				terminal: vec![],
				relay: Some(PathBuf::from(env!("CARGO_BIN_EXE_dgsm-tee"))),
			},
			timeouts: timeouts(5_000),
		},
	);
	let (reply, mut rx) = sink();

	sup.start(reply.clone()).await;
	assert_eq!(
		texts(&mut rx),
		vec!["Starting mc", "mc has started\nEndpoint: play.example.net"]
	);
	assert_eq!(sup.lifecycle(), Lifecycle::Running);

	let waiter = sup
		.broker()
		.count_waiter(1, false, Duration::from_secs(5))
		.unwrap();
	assert!(sup.message_app("hi").await);
	assert_eq!(waiter.wait().await, "got hi\n");

	sup.stop(reply).await;
	assert_eq!(texts(&mut rx), vec!["mc has stopped"]);
	assert_eq!(sup.lifecycle(), Lifecycle::Idle);
}

#[tokio::test]
async fn missing_executable() {
	let profile = profiles::lookup("minecraft").unwrap();
	let sup = Supervisor::new(
		AppDef {
			name: "ghost".into(),
			argv: vec!["/nonexistent/dgsm/server".into()],
			..AppDef::default()
		},
		profile,
		profile.detectors().unwrap(),
		SupervisorOptions::default(),
	);
	let (reply, mut rx) = sink();
	sup.start(reply).await;
	assert_eq!(
		texts(&mut rx),
		vec![
			"Starting ghost",
			"ghost did not start - unable to locate the executable."
		]
	);
	assert_eq!(sup.lifecycle(), Lifecycle::Idle);
}

#[tokio::test]
async fn delayed_readiness_for_plain_apps() {
	let sup = plain("sleep 30", Duration::from_millis(200));
	let (reply, mut rx) = sink();

	sup.start(reply).await;
	assert_eq!(texts(&mut rx), vec!["tool has started\nEndpoint: play.example.net"]);
	assert_eq!(sup.status(), "Running");
	assert!(sup.status_report().starts_with("tool is Running\n  CPU: "));

	sup.force_stop().await;
	assert_eq!(sup.status(), "Stopped");
	assert_eq!(sup.status_report(), "tool is Stopped");
}

// --- Stop ---

#[tokio::test]
async fn stop_refused_while_players_connected() {
	let script = "echo 'Done (0.1s)!'; echo 'steve joined the game'; \
		while read line; do echo \"$line\"; done";
	let sup = minecraft(script, timeouts(5_000));
	let (reply, mut rx) = sink();
	sup.start(reply.clone()).await;
	texts(&mut rx);

	for _ in 0..100 {
		if !sup.app_state().players.is_empty() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	assert_eq!(sup.app_state().player_names(), vec!["steve"]);

	sup.stop(reply.clone()).await;
	assert_eq!(texts(&mut rx), vec!["Cannot stop mc with players connected"]);
	assert_eq!(sup.lifecycle(), Lifecycle::Running);

	let left = sup
		.broker()
		.substring_waiter("left", false, false, Duration::from_secs(5))
		.unwrap();
	assert!(sup.message_app("steve left the game").await);
	assert_eq!(left.wait().await, "steve left the game\n");

	sup.stop(reply).await;
	assert_eq!(texts(&mut rx), vec!["mc has stopped"]);
}

#[tokio::test]
async fn stop_times_out_then_force_stop_kills() {
	let script = "trap '' TERM; echo 'Done (0.1s)!'; while true; do sleep 0.1; done";
	let sup = minecraft(
		script,
		Timeouts {
			start: Duration::from_secs(5),
			stop: Duration::from_millis(300),
			force: Duration::from_secs(1),
		},
	);
	let (reply, mut rx) = sink();
	sup.start(reply.clone()).await;
	texts(&mut rx);

	sup.stop(reply).await;
	assert_eq!(texts(&mut rx), vec!["mc is unable to stop"]);
	assert_eq!(sup.lifecycle(), Lifecycle::Running);

	timeout(Duration::from_secs(5), sup.force_stop())
		.await
		.expect("force stop should escalate to SIGKILL");
	assert_eq!(sup.lifecycle(), Lifecycle::Idle);
	assert!(texts(&mut rx).is_empty());
}

#[tokio::test]
async fn stop_when_idle() {
	let sup = minecraft(SERVER, timeouts(5_000));
	let (reply, mut rx) = sink();
	sup.stop(reply).await;
	assert_eq!(texts(&mut rx), vec!["mc is not running"]);
	sup.force_stop().await;
	assert_eq!(sup.lifecycle(), Lifecycle::Idle);
}

#[tokio::test]
async fn unexpected_exit_is_reported_once() {
	let script = "echo 'Done (0.1s)!'; sleep 0.3";
	let sup = minecraft(script, timeouts(5_000));
	let (reply, mut rx) = sink();
	sup.start(reply).await;
	texts(&mut rx);
	let _mirror = sup.broker().subscribe(|_| {});

	until_idle(&sup).await;
	assert_eq!(texts(&mut rx), vec!["mc was terminated unexpectedly"]);
	assert!(sup.broker().is_empty());
	assert!(sup.app_state().players.is_empty());
	assert!(!sup.app_state().online);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn unexpected_exit_takes_descendants_down() {
	let script = "sleep 100 & echo \"bg $!\"; echo 'Done (0.1s)!'; sleep 0.3";
	let sup = minecraft(script, timeouts(5_000));
	let background = Arc::new(parking_lot::Mutex::new(None::<u32>));
	let _watch = {
		let background = Arc::clone(&background);
		sup.broker().subscribe(move |line| {
			if let Some(pid) = line.strip_prefix("bg ").and_then(|p| p.trim().parse().ok()) {
				*background.lock() = Some(pid);
			}
		})
	};
	let (reply, mut rx) = sink();
	sup.start(reply).await;
	texts(&mut rx);

	until_idle(&sup).await;
	let pid = background.lock().expect("background pid was not printed");

	let mut gone = false;
	for _ in 0..100 {
		gone = match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
			Err(_) => true,
			Ok(stat) => stat
				.rfind(')')
				.and_then(|i| stat[i + 1..].split_whitespace().next())
				.is_some_and(|state| state == "Z" || state == "X"),
		};
		if gone {
			break;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
	assert!(gone, "background process {} survived its server", pid);
}

// --- Commands ---

#[tokio::test]
async fn command_table_dispatch() {
	let sup = minecraft(SERVER, timeouts(5_000));
	let (reply, mut rx) = sink();

	sup.command("echo", Some("hi there".into()), reply.clone())
		.await
		.unwrap();
	sup.command("ECHO", None, reply.clone()).await.unwrap();
	assert_eq!(texts(&mut rx), vec!["hi there", "nothing but silence"]);

	assert_eq!(
		sup.command("start", Some("now".into()), reply.clone()).await,
		Err(CommandError::ArityMismatch("mc.start".into()))
	);
	assert_eq!(
		sup.command("input", Some("   ".into()), reply.clone()).await,
		Err(CommandError::ArityMismatch("mc.input".into()))
	);
	assert_eq!(
		sup.command("fly", None, reply.clone()).await,
		Err(CommandError::Unsupported {
			app: "mc".into(),
			cmd: "fly".into()
		})
	);
	assert!(texts(&mut rx).is_empty());

	sup.command("help", None, reply.clone()).await.unwrap();
	let help = texts(&mut rx).remove(0);
	assert!(help.starts_with("mc Supported Commands:"));
	assert!(help.contains("  seed - "));

	sup.command("input", Some("list".into()), reply.clone())
		.await
		.unwrap();
	assert_eq!(texts(&mut rx), vec!["mc is not running"]);

	sup.start(reply.clone()).await;
	texts(&mut rx);
	sup.command("input", Some("list".into()), reply.clone())
		.await
		.unwrap();
	assert_eq!(texts(&mut rx), vec!["got list"]);

	sup.force_stop().await;
}

#[tokio::test]
async fn seed_reads_reply_from_output() {
	let script = "echo 'Done (0.1s)!'; \
		while read line; do \
			if [ \"$line\" = seed ]; then echo '[Server thread/INFO]: Seed: [-4172144997902289642]'; fi; \
		done";
	let sup = minecraft(script, timeouts(5_000));
	let (reply, mut rx) = sink();
	sup.start(reply.clone()).await;
	texts(&mut rx);

	sup.command("seed", None, reply).await.unwrap();
	assert_eq!(texts(&mut rx), vec!["mc Seed: -4172144997902289642"]);
	sup.force_stop().await;
}
