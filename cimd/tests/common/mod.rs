#![allow(dead_code)]

use async_trait::async_trait;
use cimd::{config::RunOptions, imsg::Handler, transport::Transport, Cli, Error};
use nix::unistd::{getuid, User};
use parking_lot::{const_mutex, Mutex, MutexGuard};
use std::{
    cell::Cell,
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    rc::Rc,
    time::Duration,
};
use tokio::time::sleep;

/// Signal handlers and child reaping are process-wide.
static SERIAL: Mutex<()> = const_mutex(());

pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

/// Transport that records the calls of the lifecycle driver.
#[derive(Debug, Default)]
pub struct FakeTransport {
    pub calls: Vec<String>,
    pub channel: Option<Handler>,
    /// Number of `listen_wsman` calls that should fail.
    pub fail_wsman: Rc<Cell<usize>>,
}

impl FakeTransport {
    pub fn calls(&self) -> Vec<&str> {
        self.calls.iter().map(String::as_str).collect()
    }
}

#[async_trait(?Send)]
impl Transport for FakeTransport {
    fn initialize_network(&mut self, _options: &RunOptions) -> Result<(), Error> {
        self.calls.push("initialize_network".to_string());
        Ok(())
    }

    fn listen_path(&mut self, path: &Path) -> Result<(), Error> {
        self.calls.push(format!("listen_path {}", path.display()));
        Ok(())
    }

    fn listen_channel(&mut self, channel: Handler) -> Result<(), Error> {
        self.calls.push("listen_channel".to_string());
        self.channel = Some(channel);
        Ok(())
    }

    fn listen_wsman(&mut self, _options: &RunOptions) -> Result<(), Error> {
        self.calls.push("listen_wsman".to_string());
        let failures = self.fail_wsman.get();
        if failures > 0 {
            self.fail_wsman.set(failures - 1);
            return Err(Error::Configuration("port in use".to_string()));
        }
        Ok(())
    }

    async fn run(&mut self, slice: Duration) -> Result<(), Error> {
        sleep(slice).await;
        Ok(())
    }

    async fn reload_dispatcher(&mut self) -> Result<(), Error> {
        self.calls.push("reload_dispatcher".to_string());
        Ok(())
    }

    fn close_listeners(&mut self) {
        self.calls.push("close_listeners".to_string());
    }

    fn close(&mut self) {
        self.calls.push("close".to_string());
        self.channel = None;
    }
}

/// Options of a test instance relocated below `destdir`.
pub fn options(destdir: &Path, extra: &[&str]) -> (Cli, RunOptions) {
    let mut args = vec![
        "cimd".to_string(),
        "-i".to_string(),
        "--destdir".to_string(),
        destdir.display().to_string(),
        "--httpport".to_string(),
        "0".to_string(),
        "--httpsport".to_string(),
        "0".to_string(),
    ];
    args.extend(extra.iter().map(|arg| arg.to_string()));

    let cli = Cli::try_from_args(args).unwrap();
    let options = RunOptions::load(&cli).unwrap();
    fs::create_dir_all(&options.paths.rundir).unwrap();
    (cli, options)
}

pub fn current_user() -> String {
    User::from_uid(getuid()).unwrap().unwrap().name
}

/// Install an engine shell script at `path`.
pub fn install_engine(path: &Path, script: &str) -> PathBuf {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, script).unwrap();
    fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_path_buf()
}

/// Engine script that reports its descriptors and waits to be stopped.
pub const REPORT_ENGINE: &str = r#"#!/bin/sh
out="$(dirname "$0")/engine.out"
{
    echo "pid: $$"
    echo "args: $*"
    if [ -e /proc/$$/fd/200 ]; then echo "fd200: open"; else echo "fd200: closed"; fi
    echo "fd3: $(readlink /proc/$$/fd/3)"
} > "$out.tmp"
mv "$out.tmp" "$out"
exec sleep 60
"#;

/// Poll `condition` until it holds.
pub async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out");
}
