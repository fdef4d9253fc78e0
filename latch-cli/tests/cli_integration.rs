// SPDX-FileCopyrightText: © 2026 PrivKey LLC
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::time::{Duration, Instant};

use tempfile::TempDir;

const TEST_PASSWORD: &str = "testpass123";
const TEST_PHRASE: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";
// Public key and address of the secp256k1 secret 0x..01.
const ONE_PUBKEY: &str = "0279be667ef9dcbbac55a06295ce870b07029bfcdb2dce28d959f2815b16f81798";
const ONE_ADDRESS: &str = "0x7e5f4552091a69125d5dfcb7b8c2659029395bdf";
const ONE_SECRET: &str = "0000000000000000000000000000000000000000000000000000000000000001";

struct LatchCmd {
    cmd: Command,
}

impl LatchCmd {
    fn new(env: &TestEnv) -> Self {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_latch"));
        cmd.env("LATCH_PASSWORD", TEST_PASSWORD);
        cmd.env("LATCH_YES", "1");
        cmd.env("LATCH_TESTING_MODE", "1");
        cmd.env_remove("RUST_LOG");
        cmd.arg("--config").arg(&env.config);
        cmd.arg("--path").arg(&env.vault);
        Self { cmd }
    }

    fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        self.cmd.args(args);
        self
    }

    fn env(mut self, key: &str, val: &str) -> Self {
        self.cmd.env(key, val);
        self
    }

    fn without_password(mut self) -> Self {
        self.cmd.env_remove("LATCH_PASSWORD");
        self
    }

    fn run(mut self) -> Output {
        self.cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = self.cmd.spawn().expect("failed to spawn");
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(_)) => return child.wait_with_output().expect("failed to wait"),
                Ok(None) if start.elapsed() > Duration::from_secs(60) => {
                    child.kill().ok();
                    panic!("command timed out after 60 seconds");
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(100)),
                Err(e) => panic!("error waiting for child: {e}"),
            }
        }
    }

    fn spawn(mut self) -> Child {
        self.cmd.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        self.cmd.spawn().expect("failed to spawn")
    }
}

struct TestEnv {
    dir: TempDir,
    vault: PathBuf,
    config: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let vault = dir.path().join("vault.redb");
        let config = dir.path().join("config.toml");
        std::fs::write(&config, "").unwrap();
        Self { dir, vault, config }
    }

    fn initialized() -> Self {
        let env = Self::new();
        let out = env.cmd(["init"]).run();
        assert_success(&out);
        env
    }

    fn cmd<I, S>(&self, args: I) -> LatchCmd
    where
        I: IntoIterator<Item = S>,
        S: AsRef<std::ffi::OsStr>,
    {
        LatchCmd::new(self).args(args)
    }

    fn socket(&self) -> PathBuf {
        self.dir.path().join("latch.sock")
    }
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

fn assert_success(out: &Output) {
    assert!(out.status.success(), "command failed: {}", stderr(out));
}

fn field<'a>(text: &'a str, label: &str) -> Option<&'a str> {
    let prefix = format!("{label}: ");
    text.lines()
        .find_map(|line| line.trim().strip_prefix(prefix.as_str()))
        .map(str::trim)
}

#[test]
fn test_init_creates_vault() {
    let env = TestEnv::initialized();
    assert!(env.vault.exists());
}

#[test]
fn test_init_twice_fails() {
    let env = TestEnv::initialized();
    let out = env.cmd(["init"]).run();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("already exists"));
}

#[test]
fn test_short_password_rejected() {
    let env = TestEnv::new();
    let out = env.cmd(["init"]).env("LATCH_PASSWORD", "short").run();
    assert!(!out.status.success());
    assert!(!env.vault.exists());
}

#[test]
fn test_missing_vault_reported() {
    let env = TestEnv::new();
    let out = env.cmd(["list"]).run();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("latch init"));
}

#[test]
fn test_generate_and_list() {
    let env = TestEnv::initialized();
    let out = env.cmd(["generate", "--family", "evm", "--name", "main"]).run();
    assert_success(&out);
    let text = stderr(&out);
    let address = field(&text, "Address").expect("address printed");
    assert!(address.starts_with("0x"));

    let out = env.cmd(["generate", "--family", "substrate", "--name", "dot"]).run();
    assert_success(&out);

    let out = env.cmd(["list"]).without_password().run();
    assert_success(&out);
    let text = stderr(&out);
    assert!(text.contains("main"));
    assert!(text.contains("dot"));
    assert!(text.contains(address));
}

#[test]
fn test_wrong_password_fails() {
    let env = TestEnv::initialized();
    let out = env
        .cmd(["generate", "--name", "main"])
        .env("LATCH_PASSWORD", "wrongpass999")
        .run();
    assert!(!out.status.success());
}

#[test]
fn test_import_then_watch_only_conflicts() {
    let env = TestEnv::initialized();
    let out = env
        .cmd(["import", "--family", "evm", "--name", "one"])
        .env("LATCH_SECRET", ONE_SECRET)
        .run();
    assert_success(&out);
    assert_eq!(field(&stderr(&out), "Address"), Some(ONE_ADDRESS));

    let out = env
        .cmd(["watch-only", "--family", "evm", "--public-key", ONE_PUBKEY, "--name", "dup"])
        .run();
    assert!(!out.status.success());
}

#[test]
fn test_watch_only_and_remove() {
    let env = TestEnv::initialized();
    let out = env
        .cmd(["watch-only", "--family", "evm", "--public-key", ONE_PUBKEY, "--hardware"])
        .run();
    assert_success(&out);
    assert_eq!(field(&stderr(&out), "Address"), Some(ONE_ADDRESS));

    let out = env.cmd(["list"]).run();
    assert!(stderr(&out).contains("hardware"));

    assert_success(&env.cmd(["remove", ONE_ADDRESS]).run());
    let out = env.cmd(["list"]).run();
    assert!(stderr(&out).contains("No accounts found"));
}

#[test]
fn test_import_rejects_bad_hex() {
    let env = TestEnv::initialized();
    let out = env
        .cmd(["import", "--name", "bad"])
        .env("LATCH_SECRET", "not-hex")
        .run();
    assert!(!out.status.success());
}

#[test]
fn test_mnemonic_add_and_derive() {
    let env = TestEnv::initialized();
    let out = env
        .cmd(["mnemonic", "add", "--label", "paper"])
        .env("LATCH_MNEMONIC", TEST_PHRASE)
        .run();
    assert_success(&out);
    let text = stderr(&out);
    let id = field(&text, "Id").expect("id printed").to_string();

    let out = env
        .cmd(["derive", "--mnemonic", id.as_str(), "--family", "evm", "--index", "0"])
        .run();
    assert_success(&out);
    let first = field(&stderr(&out), "Address").map(str::to_string);
    assert!(first.is_some());

    let out = env
        .cmd([
            "derive",
            "--mnemonic",
            id.as_str(),
            "--family",
            "evm",
            "--index",
            "1",
            "--name",
            "second",
        ])
        .run();
    assert_success(&out);
    assert_ne!(first.as_deref(), field(&stderr(&out), "Address"));

    let out = env.cmd(["mnemonic", "reveal", id.as_str()]).run();
    assert_success(&out);
    assert!(stderr(&out).contains(TEST_PHRASE));
}

#[test]
fn test_unconfirmed_backup_blocks_password_change() {
    let env = TestEnv::initialized();
    let out = env
        .cmd(["mnemonic", "generate", "--label", "fresh", "--words", "12"])
        .run();
    assert_success(&out);
    let text = stderr(&out);
    let id = field(&text, "Id").expect("id printed").to_string();

    let out = env.cmd(["mnemonic", "list"]).run();
    assert!(stderr(&out).contains("PENDING"));

    let out = env
        .cmd(["change-password"])
        .env("LATCH_NEW_PASSWORD", "newpass456")
        .run();
    assert!(!out.status.success());

    assert_success(&env.cmd(["mnemonic", "confirm", id.as_str()]).run());
    let out = env.cmd(["mnemonic", "list"]).run();
    assert!(stderr(&out).contains("confirmed"));

    let out = env
        .cmd(["change-password"])
        .env("LATCH_NEW_PASSWORD", "newpass456")
        .run();
    assert_success(&out);
}

#[test]
fn test_mnemonic_add_rejects_invalid_phrase() {
    let env = TestEnv::initialized();
    let out = env
        .cmd(["mnemonic", "add"])
        .env("LATCH_MNEMONIC", "not a real recovery phrase")
        .run();
    assert!(!out.status.success());
}

#[test]
fn test_change_password() {
    let env = TestEnv::initialized();
    assert_success(&env.cmd(["generate", "--name", "main"]).run());

    let out = env
        .cmd(["change-password"])
        .env("LATCH_NEW_PASSWORD", "newpass456")
        .run();
    assert_success(&out);

    let out = env.cmd(["generate", "--name", "second"]).run();
    assert!(!out.status.success());

    let out = env
        .cmd(["generate", "--name", "second"])
        .env("LATCH_PASSWORD", "newpass456")
        .run();
    assert_success(&out);
}

#[test]
fn test_invalid_config_rejected() {
    let env = TestEnv::new();
    std::fs::write(&env.config, "argon2_profile = \"extreme\"").unwrap();
    let out = env.cmd(["list"]).run();
    assert!(!out.status.success());
    assert!(stderr(&out).contains("Invalid config"));
}

fn wait_for_socket(path: &Path) -> UnixStream {
    let start = Instant::now();
    loop {
        if let Ok(stream) = UnixStream::connect(path) {
            return stream;
        }
        assert!(start.elapsed() < Duration::from_secs(30), "broker never listened");
        std::thread::sleep(Duration::from_millis(100));
    }
}

struct KillOnDrop(Child);

impl Drop for KillOnDrop {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

#[test]
fn test_serve_refuses_unauthorized_origin() {
    let env = TestEnv::initialized();
    assert_success(&env.cmd(["generate", "--name", "main"]).run());

    let socket = env.socket();
    let _child = KillOnDrop(
        env.cmd(["serve", "--socket"])
            .args([socket.as_os_str()])
            .spawn(),
    );

    let stream = wait_for_socket(&socket);
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    writeln!(writer, r#"{{"origin":"https://app.example"}}"#).unwrap();
    writeln!(writer, r#"{{"id":"1","operation":"accounts"}}"#).unwrap();

    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["id"], "1");
    assert!(reply.get("error").is_some(), "unexpected reply: {line}");
    assert!(reply.get("result").is_none());
}

#[test]
fn test_serve_rejects_bad_hello() {
    let env = TestEnv::initialized();
    let socket = env.socket();
    let _child = KillOnDrop(
        env.cmd(["serve", "--socket"])
            .args([socket.as_os_str()])
            .spawn(),
    );

    let stream = wait_for_socket(&socket);
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let mut reader = BufReader::new(stream);

    writeln!(writer, r#"{{"origin":"not a url"}}"#).unwrap();
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
    assert_eq!(reply["id"], "hello");
    assert!(reply.get("error").is_some());
}
