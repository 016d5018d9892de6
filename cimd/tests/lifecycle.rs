mod common;

use cimd::{
    server::{self, Server, State},
    signal::{self, ControlSignal},
    transport::{Multiplexer, NullDispatcher},
    Error,
};
use common::FakeTransport;
use nix::{
    sys::{signal::kill, wait::WaitStatus},
    unistd::getpid,
};
use std::{fs, time::Duration};
use tokio::{
    net::UnixStream,
    time::{sleep, timeout},
};

const TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test]
async fn test_reload_then_stop() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (cli, options) = common::options(dir.path(), &[]);
    let socket = options.paths.socket_file();
    let pid_file = options.paths.pid_file();

    let mut server = Server::new(cli, options, Multiplexer::new(NullDispatcher::default()));
    let control = async {
        common::wait_for(|| socket.exists()).await;
        let pid = fs::read_to_string(&pid_file).unwrap();
        assert_eq!(pid.trim(), getpid().to_string());

        signal::raise(ControlSignal::ReloadConfig);
        sleep(Duration::from_millis(200)).await;
        // Still serving on the rebuilt listener.
        let _client = UnixStream::connect(&socket).await.unwrap();
        sleep(Duration::from_millis(100)).await;

        signal::raise(ControlSignal::ReloadDispatcher);
        sleep(Duration::from_millis(100)).await;
        signal::raise(ControlSignal::Terminate);
    };

    let (result, ()) = tokio::join!(timeout(TIMEOUT, server.run()), control);
    result.unwrap().unwrap();

    assert_eq!(server.state(), State::Stopped);
    assert!(!socket.exists());
    assert!(!pid_file.exists());
    let dispatcher = server.transport().dispatcher();
    assert_eq!(dispatcher.reloads, 1);
    assert!(dispatcher.connections >= 1);
}

#[tokio::test]
async fn test_second_instance_rejected() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (cli, options) = common::options(dir.path(), &[]);
    let socket = options.paths.socket_file();
    let pid_file = options.paths.pid_file();

    let mut first = Server::new(cli.clone(), options.clone(), FakeTransport::default());
    let mut second = Server::new(cli, options.clone(), FakeTransport::default());
    let control = async {
        common::wait_for(|| pid_file.exists() && first_listening(&pid_file)).await;
        sleep(Duration::from_millis(100)).await;

        assert!(matches!(server::prepare(&options), Err(Error::AlreadyRunning(_))));
        match second.run().await {
            Err(Error::AlreadyRunning(pid)) => assert_eq!(pid, getpid()),
            result => panic!("unexpected result: {:?}", result),
        }
        assert!(second.transport().calls.is_empty());
        assert!(pid_file.exists());

        signal::raise(ControlSignal::Terminate);
    };

    let (result, ()) = tokio::join!(timeout(TIMEOUT, first.run()), control);
    result.unwrap().unwrap();

    assert_eq!(
        first.transport().calls(),
        vec![
            "initialize_network",
            "listen_wsman",
            format!("listen_path {}", socket.display()).as_str(),
            "close",
        ]
    );
    assert!(!pid_file.exists());
}

fn first_listening(pid_file: &std::path::Path) -> bool {
    fs::read_to_string(pid_file)
        .map(|pid| pid.trim() == getpid().to_string())
        .unwrap_or(false)
}

#[test]
fn test_stop_not_running() {
    let dir = tempfile::tempdir().unwrap();
    let (_, options) = common::options(dir.path(), &["-s"]);
    let pid_file = options.paths.pid_file();

    for kind in ControlSignal::ALL.iter().take(3) {
        assert!(matches!(
            server::control(&options, *kind),
            Err(Error::NotRunning)
        ));
    }
    assert!(!pid_file.exists());
}

#[tokio::test]
async fn test_invalid_reload_keeps_listeners() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (cli, options) = common::options(dir.path(), &[]);
    let config = options.paths.config_file();
    let pid_file = options.paths.pid_file();
    fs::create_dir_all(config.parent().unwrap()).unwrap();

    let transport = FakeTransport::default();
    let fail_wsman = transport.fail_wsman.clone();
    let mut server = Server::new(cli, options, transport);
    let control = async {
        common::wait_for(|| first_listening(&pid_file)).await;
        sleep(Duration::from_millis(100)).await;

        // Broken configuration file: nothing is torn down.
        fs::write(&config, "httpport=80\nbogus=1\n").unwrap();
        signal::raise(ControlSignal::ReloadConfig);
        sleep(Duration::from_millis(200)).await;

        // Valid configuration but the new listeners fail once.
        fs::write(&config, "loglevel=info\n").unwrap();
        fail_wsman.set(1);
        signal::raise(ControlSignal::ReloadConfig);
        sleep(Duration::from_millis(200)).await;

        signal::raise(ControlSignal::Terminate);
    };

    let (result, ()) = tokio::join!(timeout(TIMEOUT, server.run()), control);
    result.unwrap().unwrap();

    let socket = format!("listen_path {}", server.options().paths.socket_file().display());
    assert_eq!(
        server.transport().calls(),
        vec![
            "initialize_network",
            "listen_wsman",
            socket.as_str(),
            // failed attempt with the new options
            "close_listeners",
            "initialize_network",
            "listen_wsman",
            // restored previous options
            "close_listeners",
            "initialize_network",
            "listen_wsman",
            socket.as_str(),
            "close",
        ]
    );
    assert_eq!(server.options().log_level, cimd::config::LogLevel::Warning);
}

#[tokio::test]
async fn test_live_time() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let (cli, options) = common::options(dir.path(), &["--livetime", "1"]);
    let pid_file = options.paths.pid_file();

    let mut server = Server::new(cli, options, FakeTransport::default());
    timeout(TIMEOUT, server.run()).await.unwrap().unwrap();

    assert_eq!(server.state(), State::Stopped);
    assert_eq!(server.transport().calls.last().map(String::as_str), Some("close"));
    assert!(!pid_file.exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_split_mode() {
    use nix::{errno::Errno, unistd::{close, dup2, Pid}};
    use std::os::unix::io::AsRawFd;

    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let user = common::current_user();
    let (cli, options) = common::options(dir.path(), &["--nonroot", "--service", &user]);
    let engine = common::install_engine(&options.paths.engine(), common::REPORT_ENGINE);
    let output = engine.parent().unwrap().join("engine.out");
    let socket_dir = options.paths.socket_dir();
    let pid_file = options.paths.pid_file();

    let null = fs::File::open("/dev/null").unwrap();
    let held = dup2(null.as_raw_fd(), 200).unwrap();

    let mut server = Server::new(cli, options, FakeTransport::default());
    let control = async {
        common::wait_for(|| output.exists()).await;
        signal::raise(ControlSignal::ReloadConfig);
        sleep(Duration::from_millis(200)).await;
        signal::raise(ControlSignal::ReloadDispatcher);
        sleep(Duration::from_millis(200)).await;
        signal::raise(ControlSignal::Terminate);
    };

    let (result, ()) = tokio::join!(timeout(TIMEOUT, server.run()), control);
    close(held).unwrap();
    result.unwrap().unwrap();

    let report = fs::read_to_string(&output).unwrap();
    assert!(report.contains("fd200: closed"), "{}", report);
    assert!(report.contains("fd3: socket:"), "{}", report);
    assert!(!report.contains("--nonroot"), "{}", report);
    assert!(report.contains("--socketpair 3\n"), "{}", report);

    let calls = server.transport().calls();
    assert_eq!(calls.len(), 7, "{:?}", calls);
    assert_eq!(calls[0], "initialize_network");
    let rendezvous = calls[1].trim_start_matches("listen_path ");
    assert!(rendezvous.starts_with(&format!("{}/cimd_", socket_dir.display())));
    assert_eq!(
        &calls[2..],
        &[
            "listen_channel",
            "initialize_network",
            "reload_dispatcher",
            "reload_dispatcher",
            "close"
        ]
    );

    // The engine is gone and nothing is left behind.
    let pid = report
        .lines()
        .find_map(|line| line.strip_prefix("pid: "))
        .and_then(|pid| pid.parse().ok())
        .map(Pid::from_raw)
        .unwrap();
    assert_eq!(kill(pid, None), Err(Errno::ESRCH));
    assert_eq!(fs::read_dir(&socket_dir).unwrap().count(), 0);
    assert!(!pid_file.exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_engine_exit_is_fatal() {
    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let user = common::current_user();
    let (cli, options) = common::options(dir.path(), &["--nonroot", "--service", &user]);
    common::install_engine(&options.paths.engine(), "#!/bin/sh\nexit 3\n");
    let pid_file = options.paths.pid_file();

    let mut server = Server::new(cli, options, FakeTransport::default());
    match timeout(TIMEOUT, server.run()).await.unwrap() {
        Err(Error::EngineExited(pid, WaitStatus::Exited(exited, 3))) => assert_eq!(pid, exited),
        result => panic!("unexpected result: {:?}", result),
    }
    assert_eq!(server.state(), State::Stopped);
    assert!(server.engine().is_none());
    assert!(!pid_file.exists());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_engine_exit_during_stop() {
    use nix::{sys::signal::Signal, unistd::Pid};

    let _serial = common::serial();
    let dir = tempfile::tempdir().unwrap();
    let user = common::current_user();
    let (cli, options) = common::options(dir.path(), &["--nonroot", "--service", &user]);
    let engine = common::install_engine(&options.paths.engine(), common::REPORT_ENGINE);
    let output = engine.parent().unwrap().join("engine.out");
    let pid_file = options.paths.pid_file();

    let mut server = Server::new(cli, options, FakeTransport::default());
    let control = async {
        common::wait_for(|| output.exists()).await;
        let pid = fs::read_to_string(&output)
            .unwrap()
            .lines()
            .find_map(|line| line.strip_prefix("pid: ").map(str::to_owned))
            .and_then(|pid| pid.parse().ok())
            .map(Pid::from_raw)
            .unwrap();

        // Block the runtime so that the engine exit and the stop request
        // are both pending when the loop wakes up.
        kill(pid, Signal::SIGTERM).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        signal::raise(ControlSignal::Terminate);
    };

    let (result, ()) = tokio::join!(timeout(TIMEOUT, server.run()), control);
    result.unwrap().unwrap();

    assert_eq!(server.state(), State::Stopped);
    assert!(server.engine().is_none());
    assert!(!pid_file.exists());
}
