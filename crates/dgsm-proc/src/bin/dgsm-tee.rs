#[cfg(unix)]
#[tokio::main]
async fn main() {
	tracing_subscriber::fmt()
		.with_writer(std::io::stderr)
		.with_max_level(tracing::Level::WARN)
		.init();

	let argv: Vec<String> = std::env::args().skip(1).collect();
	if argv.is_empty() {
		eprintln!("usage: dgsm-tee <program> [args...]");
		eprintln!("Started by dgsm for applications with opts.new_console = true.");
		std::process::exit(2);
	}

	match dgsm_proc::tee::run_relay(argv).await {
		Ok(code) => std::process::exit(code),
		Err(e) => {
			eprintln!("dgsm-tee: {}", e);
			std::process::exit(1);
		}
	}
}

#[cfg(not(unix))]
fn main() {
	eprintln!("dgsm-tee: the terminal relay needs a unix host");
	std::process::exit(1);
}
