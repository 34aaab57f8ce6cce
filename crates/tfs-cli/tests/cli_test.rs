//! End-to-end tests driving the `tfs` binary against isolated stores.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};

use tfs_config::testing::TestEnvironment;
use tfs_config::Config;

fn tfs(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tfs"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("TFS_STORAGE_DIR")
        .env_remove("TFS_PASSWORD")
        .env_remove("TFS_ROOT_NAME")
        .env_remove("TFS_BACKEND")
        .output()
        .expect("Failed to execute tfs")
}

fn stdout(output: &Output) -> String {
    assert!(
        output.status.success(),
        "tfs failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn test_init_config_prints_valid_toml() {
    let output = Command::new(env!("CARGO_BIN_EXE_tfs"))
        .arg("init-config")
        .output()
        .unwrap();
    let text = stdout(&output);
    let parsed: Config = toml::from_str(&text).unwrap();
    assert_eq!(parsed.fs.root_name, "fs");
    assert!(text.contains("[crypto]"));
}

#[test]
fn test_put_then_cat() {
    let env = TestEnvironment::new().unwrap();
    let config = env.write_config().unwrap();
    let local = env.create_file("hello.txt", b"hello, tfs\n").unwrap();

    stdout(&tfs(&config, &["put", local.to_str().unwrap(), "/hello.txt"]));
    assert_eq!(stdout(&tfs(&config, &["cat", "/hello.txt"])), "hello, tfs\n");
    assert_eq!(stdout(&tfs(&config, &["ls", "/"])), "hello.txt\n");
}

#[test]
fn test_large_file_survives_reopen() {
    let env = TestEnvironment::new().unwrap();
    let config = env.write_config().unwrap();
    let content: Vec<u8> = (0..300_000u32).map(|i| (i % 251) as u8).collect();
    let local = env.create_file("big.bin", &content).unwrap();

    stdout(&tfs(&config, &["put", local.to_str().unwrap(), "/big.bin"]));
    let output = tfs(&config, &["cat", "/big.bin"]);
    assert!(output.status.success());
    assert_eq!(output.stdout, content);
}

#[test]
fn test_put_directory_tree() {
    let env = TestEnvironment::new().unwrap();
    let config = env.write_config().unwrap();
    env.create_file("tree/a.txt", b"a").unwrap();
    env.create_file("tree/sub/b.txt", b"bb").unwrap();
    let tree = env.root().join("local/tree");

    let out = stdout(&tfs(&config, &["put", tree.to_str().unwrap(), "/imported"]));
    assert!(out.contains("2 files, 3 bytes"));
    assert_eq!(stdout(&tfs(&config, &["ls", "/imported"])), "a.txt\nsub\n");
    assert_eq!(stdout(&tfs(&config, &["cat", "/imported/sub/b.txt"])), "bb");
}

#[test]
fn test_mkdir_and_recursive_rm() {
    let env = TestEnvironment::new().unwrap();
    let config = env.write_config().unwrap();
    let local = env.create_file("f", b"x").unwrap();

    stdout(&tfs(&config, &["mkdir", "-p", "/a/b/c"]));
    stdout(&tfs(&config, &["put", local.to_str().unwrap(), "/a/b/c/f"]));

    assert!(!tfs(&config, &["rm", "/a"]).status.success());
    stdout(&tfs(&config, &["rm", "-r", "/a"]));
    assert_eq!(stdout(&tfs(&config, &["ls", "/"])), "");
}

#[test]
fn test_stat_json() {
    let env = TestEnvironment::new().unwrap();
    let config = env.write_config().unwrap();
    let local = env.create_file("s", b"12345").unwrap();
    stdout(&tfs(&config, &["put", local.to_str().unwrap(), "/s"]));

    let text = stdout(&tfs(&config, &["stat", "--json", "/s"]));
    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["size"], 5);
    assert_eq!(value["nlink"], 1);
}

#[test]
fn test_missing_path_fails() {
    let env = TestEnvironment::new().unwrap();
    let config = env.write_config().unwrap();
    let output = tfs(&config, &["cat", "/nope"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("/nope"));
}

#[test]
fn test_wrong_password_cannot_read() {
    let env = TestEnvironment::new().unwrap();
    let config = env.write_config().unwrap();
    let local = env.create_file("secret", b"top secret").unwrap();
    stdout(&tfs(&config, &["put", local.to_str().unwrap(), "/secret"]));

    let output = tfs(&config, &["--password", "wrong", "cat", "/secret"]);
    assert!(!output.status.success());
}

/// A `tfs serve` child, killed on drop if not stopped
struct Served {
    child: Option<Child>,
    addr: String,
}

impl Served {
    fn start(config: &Path) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_tfs"))
            .arg("--config")
            .arg(config)
            .args(["serve", "--listen", "127.0.0.1:0"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut line = String::new();
        let read = BufReader::new(child.stdout.take().unwrap()).read_line(&mut line);
        let mut served = Self {
            child: Some(child),
            addr: String::new(),
        };
        read.unwrap();
        served.addr = line.trim().strip_prefix("listening on ").unwrap().to_string();
        served
    }

    /// Interrupt and wait, so the store is flushed
    fn stop(mut self) {
        let mut child = self.child.take().unwrap();
        let pid = nix::unistd::Pid::from_raw(child.id() as i32);
        nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGINT).unwrap();
        assert!(child.wait().unwrap().success());
    }
}

impl Drop for Served {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

#[test]
fn test_served_child_is_killed_on_drop() {
    let env = TestEnvironment::new().unwrap();
    let config = env.write_config().unwrap();
    let served = Served::start(&config);
    let pid = nix::unistd::Pid::from_raw(served.child.as_ref().unwrap().id() as i32);
    drop(served);
    // Reaped, so the pid no longer names our child
    assert!(nix::sys::wait::waitpid(pid, Some(nix::sys::wait::WaitPidFlag::WNOHANG)).is_err());
}

#[test]
fn test_serve_and_sync_once() {
    let a = TestEnvironment::new().unwrap();
    let b = TestEnvironment::new().unwrap();
    let config_a = a.write_config().unwrap();
    let config_b = b.write_config().unwrap();
    let local = a.create_file("doc", b"from a").unwrap();
    stdout(&tfs(&config_a, &["put", local.to_str().unwrap(), "/doc"]));

    let served_a = Served::start(&config_a);
    let served_b = Served::start(&config_b);
    let root_a = a.config().fs.root_name;
    let root_b = b.config().fs.root_name;
    let out = stdout(&tfs(
        &config_a,
        &[
            "sync",
            "--once",
            "--left",
            &served_a.addr,
            "--left-root",
            &root_a,
            "--left-other",
            "peer",
            "--right",
            &served_b.addr,
            "--right-root",
            &root_b,
            "--right-other",
            "peer",
        ],
    ));
    assert!(out.contains("blocks copied"));
    served_a.stop();
    served_b.stop();

    assert_eq!(stdout(&tfs(&config_b, &["cat", "/doc"])), "from a");
}
