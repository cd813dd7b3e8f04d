use std::path::PathBuf;

use thread_tracker::RunOptions;

fn main() {
    let Some(options) = handle_cli_flags() else {
        return;
    };

    if let Err(err) = thread_tracker::run(options) {
        eprintln!("error: {err:?}");
        std::process::exit(1);
    }
}

/// Returns `None` when a flag was fully handled and the program should exit.
fn handle_cli_flags() -> Option<RunOptions> {
    let mut options = RunOptions::default();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("thread-tracker {}", thread_tracker::VERSION);
                return None;
            }
            "--help" | "-h" => {
                println!(
                    "thread-tracker - Follow keyword-matched board threads as one merged feed.\n\n  --once               Sync once, print the feed and exit\n  --config PATH        Read configuration from PATH\n  --version, -V        Show version and exit\n  --help,    -h        Show this help message"
                );
                return None;
            }
            "--once" => options.once = true,
            "--config" => match args.next() {
                Some(path) => options.config_file = Some(PathBuf::from(path)),
                None => {
                    eprintln!("error: --config needs a path");
                    std::process::exit(2);
                }
            },
            other => {
                eprintln!("error: unknown argument {other}");
                std::process::exit(2);
            }
        }
    }
    Some(options)
}
