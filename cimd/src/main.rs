use cimd::{server, signal::ControlSignal, Cli, Error, Mode, RunOptions};
use cimd_log::error;
use std::{env, process};

const NAME: &str = "cimd";

fn main() {
    let cli = match Cli::try_from_args(env::args_os()) {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            process::exit(1);
        }
    };

    let options = match RunOptions::load(&cli) {
        Ok(options) => options,
        Err(err) => {
            eprintln!("{}: {}", NAME, err);
            process::exit(err.exit_code());
        }
    };

    let _guard = match cimd_log::sync_logger(NAME, options.log_config()) {
        Ok(guard) => guard,
        Err(err) => {
            eprintln!("{}: failed to initialize logging: {}", NAME, err);
            process::exit(1);
        }
    };

    let code = match options.mode() {
        Mode::Help => {
            eprintln!("{}", Cli::help_text());
            1
        }
        Mode::Version => {
            println!("{} {}", NAME, env!("CARGO_PKG_VERSION"));
            0
        }
        Mode::Timestamp => {
            println!(
                "{}: timestamp: {}",
                NAME,
                option_env!("CIMD_BUILD_TIMESTAMP").unwrap_or("unknown")
            );
            0
        }
        Mode::Locations => {
            print!("{}", options.paths);
            0
        }
        Mode::Control(kind) => match server::control(&options, kind) {
            Ok(pid) => {
                let done = match kind {
                    ControlSignal::Terminate => "stopped server",
                    ControlSignal::ReloadConfig => "refreshed server",
                    _ => "server has reloaded its dispatcher",
                };
                println!("{}: {} (pid {})", NAME, done, pid);
                0
            }
            Err(err) => report(err),
        },
        Mode::Daemon => match server::run(cli, options) {
            Ok(()) => 0,
            Err(err) => report(err),
        },
    };

    process::exit(code);
}

fn report(err: Error) -> i32 {
    match err {
        Error::NotRunning => println!("{}: server is not running", NAME),
        ref err => {
            error!("{}", err);
            eprintln!("{}: {}", NAME, err);
        }
    }
    err.exit_code()
}
