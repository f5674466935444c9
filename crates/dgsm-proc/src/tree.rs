//! Process tree enumeration, termination and resource sampling.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Instant;

/// All descendants of `root`, breadth first. Does not include `root`.
pub fn descendants(root: u32) -> Vec<u32> {
	let mut found = Vec::new();
	let mut seen = HashSet::from([root]);
	let mut queue = VecDeque::from([root]);
	while let Some(pid) = queue.pop_front() {
		for child in children(pid) {
			if seen.insert(child) {
				found.push(child);
				queue.push_back(child);
			}
		}
	}
	found
}

#[cfg(target_os = "linux")]
fn children(parent: u32) -> Vec<u32> {
	let Ok(entries) = std::fs::read_dir("/proc") else {
		return Vec::new();
	};
	entries
		.flatten()
		.filter_map(|e| e.file_name().to_str()?.parse::<u32>().ok())
		.filter(|pid| parent_of(*pid) == Some(parent))
		.collect()
}

#[cfg(target_os = "linux")]
fn parent_of(pid: u32) -> Option<u32> {
	let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
	status
		.lines()
		.find_map(|line| line.strip_prefix("PPid:"))
		.and_then(|v| v.trim().parse().ok())
}

#[cfg(target_os = "macos")]
fn children(parent: u32) -> Vec<u32> {
	use libproc::processes::{pids_by_type, ProcFilter};
	pids_by_type(ProcFilter::ByParentProcess { ppid: parent }).unwrap_or_default()
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn children(_parent: u32) -> Vec<u32> {
	Vec::new()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sig {
	/// Ask politely: SIGTERM, or `taskkill /T` on Windows.
	Term,
	/// SIGKILL, or `taskkill /T /F` on Windows.
	Kill,
}

/// Send `sig` to every pid, ignoring processes that are already gone.
#[cfg(unix)]
pub fn signal_all(pids: &[u32], sig: Sig) {
	use nix::sys::signal::{kill, Signal};
	use nix::unistd::Pid;

	let signal = match sig {
		Sig::Term => Signal::SIGTERM,
		Sig::Kill => Signal::SIGKILL,
	};
	for &pid in pids {
		if pid <= 1 {
			continue;
		}
		match kill(Pid::from_raw(pid as i32), signal) {
			Ok(()) => tracing::debug!("sent {:?} to {}", signal, pid),
			Err(nix::errno::Errno::ESRCH) => {}
			Err(e) => tracing::warn!("failed to send {:?} to {}: {}", signal, pid, e),
		}
	}
}

/// Send `sig` to every pid, ignoring processes that are already gone.
#[cfg(windows)]
pub fn signal_all(pids: &[u32], sig: Sig) {
	use std::process::{Command, Stdio};

	for &pid in pids {
		if pid == 0 {
			continue;
		}
		let pid_arg = pid.to_string();
		let mut args = vec!["/PID", pid_arg.as_str(), "/T"];
		if sig == Sig::Kill {
			args.push("/F");
		}
		let launched = Command::new("taskkill")
			.args(&args)
			.stdin(Stdio::null())
			.stdout(Stdio::null())
			.stderr(Stdio::null())
			.spawn();
		match launched {
			Ok(_) => tracing::debug!("sent {:?} to {}", sig, pid),
			Err(e) => tracing::warn!("failed to run taskkill for {}: {}", pid, e),
		}
	}
}

/// A pid pinned to the process that held it when it was recorded.
///
/// Start times come from the OS, so a recycled pid never matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcId {
	pub pid: u32,
	started: u64,
}

impl ProcId {
	/// None when the process is gone or its start time cannot be read.
	pub fn of(pid: u32) -> Option<Self> {
		Some(Self {
			pid,
			started: read_stat(pid)?.started,
		})
	}

	/// Whether the same process still holds the pid.
	pub fn is_current(&self) -> bool {
		read_stat(self.pid).is_some_and(|stat| stat.started == self.started)
	}
}

/// Point-in-time resource usage of a tracked process set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
	/// Percent of total machine capacity, all cores together.
	pub cpu_percent: u32,
	pub mem_gb: f64,
}

#[derive(Clone)]
struct Sample {
	cpu_secs: f64,
	at: Instant,
}

/// A fixed set of processes whose CPU time is sampled between calls to
/// [`usage`].
///
/// [`usage`]: Tracked::usage
#[derive(Default, Clone)]
pub struct Tracked {
	procs: Vec<ProcId>,
	last: HashMap<ProcId, Sample>,
}

impl Tracked {
	/// Track `root` and everything below it, priming the CPU counters.
	pub fn snapshot(root: u32) -> Self {
		let procs = std::iter::once(root)
			.chain(descendants(root))
			.filter_map(ProcId::of)
			.collect();
		let mut tracked = Self {
			procs,
			last: HashMap::new(),
		};
		tracked.sample();
		tracked
	}

	pub fn procs(&self) -> &[ProcId] {
		&self.procs
	}

	/// Pids of tracked processes that are still the ones recorded.
	pub fn live_pids(&self) -> Vec<u32> {
		self.procs
			.iter()
			.filter(|p| p.is_current())
			.map(|p| p.pid)
			.collect()
	}

	pub fn is_empty(&self) -> bool {
		self.procs.is_empty()
	}

	/// CPU since the previous call and current resident memory.
	pub fn usage(&mut self) -> Usage {
		let previous = std::mem::take(&mut self.last);
		let mut busy = 0.0;
		let mut rss = 0u64;
		for proc in &self.procs {
			let Some(stat) = read_stat(proc.pid) else {
				continue;
			};
			if stat.started != proc.started {
				continue;
			}
			rss += stat.rss_bytes;
			if let Some(prev) = previous.get(proc) {
				let elapsed = prev.at.elapsed().as_secs_f64();
				if elapsed > 0.0 {
					busy += (stat.cpu_secs - prev.cpu_secs).max(0.0) / elapsed;
				}
			}
			self.last.insert(
				*proc,
				Sample {
					cpu_secs: stat.cpu_secs,
					at: Instant::now(),
				},
			);
		}
		let cores = std::thread::available_parallelism()
			.map(|n| n.get())
			.unwrap_or(1) as f64;
		Usage {
			cpu_percent: (busy * 100.0 / cores).round() as u32,
			mem_gb: to_gb(rss),
		}
	}

	fn sample(&mut self) {
		let now = Instant::now();
		for proc in &self.procs {
			match read_stat(proc.pid) {
				Some(stat) if stat.started == proc.started => {
					self.last.insert(
						*proc,
						Sample {
							cpu_secs: stat.cpu_secs,
							at: now,
						},
					);
				}
				_ => {}
			}
		}
	}
}

/// Bytes to GiB, one decimal.
fn to_gb(bytes: u64) -> f64 {
	round_tenth(bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

fn round_tenth(v: f64) -> f64 {
	(v * 10.0).round() / 10.0
}

struct Stat {
	cpu_secs: f64,
	rss_bytes: u64,
	started: u64,
}

#[cfg(target_os = "linux")]
fn read_stat(pid: u32) -> Option<Stat> {
	let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
	let fields = parse_stat(&stat)?;
	let status = std::fs::read_to_string(format!("/proc/{}/status", pid)).ok()?;
	let rss_kb: u64 = status
		.lines()
		.find_map(|line| line.strip_prefix("VmRSS:"))
		.and_then(|v| v.trim().trim_end_matches("kB").trim().parse().ok())
		.unwrap_or(0);
	Some(Stat {
		cpu_secs: (fields.utime + fields.stime) as f64 / clock_ticks(),
		rss_bytes: rss_kb * 1024,
		started: fields.starttime,
	})
}

#[cfg(target_os = "linux")]
#[derive(Debug, PartialEq, Eq)]
struct StatFields {
	utime: u64,
	stime: u64,
	/// Clock ticks after boot.
	starttime: u64,
}

#[cfg(target_os = "linux")]
fn parse_stat(stat: &str) -> Option<StatFields> {
	// the command name may itself contain spaces and parens
	let rest = &stat[stat.rfind(')')? + 1..];
	let fields: Vec<&str> = rest.split_whitespace().collect();
	Some(StatFields {
		utime: fields.get(11)?.parse().ok()?,
		stime: fields.get(12)?.parse().ok()?,
		starttime: fields.get(19)?.parse().ok()?,
	})
}

#[cfg(target_os = "linux")]
fn clock_ticks() -> f64 {
	use nix::unistd::{sysconf, SysconfVar};
	match sysconf(SysconfVar::CLK_TCK) {
		Ok(Some(ticks)) if ticks > 0 => ticks as f64,
		_ => 100.0,
	}
}

#[cfg(target_os = "macos")]
fn read_stat(pid: u32) -> Option<Stat> {
	use libproc::libproc::pid_rusage::{pidrusage, RUsageInfoV2};
	let info: RUsageInfoV2 = pidrusage(pid as i32).ok()?;
	Some(Stat {
		cpu_secs: (info.ri_user_time + info.ri_system_time) as f64 / 1e9,
		rss_bytes: info.ri_resident_size,
		started: info.ri_proc_start_abstime,
	})
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
fn read_stat(_pid: u32) -> Option<Stat> {
	None
}
