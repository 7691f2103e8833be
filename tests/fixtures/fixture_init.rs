use anyhow::{Context, Result, anyhow};
use rand::Rng;
use rstest::*;
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Child, ChildStderr, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

/// Opt-in gate for tests that need root and namespace privileges.
pub const ISOLATED_ENV: &str = "SANDBOX_INIT_ISOLATED_TESTS";

pub fn rid() -> String {
    let mut rng = rand::rng();
    let rid: String = (0..10)
        .map(|_| rng.sample(rand::distr::Alphanumeric) as char)
        .collect();
    rid
}

pub fn get_init_bin() -> String {
    env!("CARGO_BIN_EXE_sandbox-init").to_string()
}

#[allow(dead_code)]
pub fn isolated_enabled() -> bool {
    std::env::var(ISOLATED_ENV).is_ok() && nix::unistd::geteuid().is_root()
}

/// A descriptor that needs nothing from the host beyond the usual system
/// directories: no display, no network, nothing created on the host.
pub fn descriptor_for(sockaddr: &str, root_dir: &str) -> Value {
    let system_dirs: Vec<Value> = ["/usr", "/bin", "/lib", "/lib64"]
        .iter()
        .map(|path| {
            json!({ "path": path, "read_only": true, "can_create": false })
        })
        .collect();
    json!({
        "profile": {
            "name": "integration",
            "path": "/bin/true",
            "whitelist": system_dirs,
        },
        "config": { "root_dir": root_dir },
        "sockaddr": sockaddr,
        "launch_env": ["LANG=C"],
        "uid": 1000,
        "gid": 1000,
        "user": {
            "username": "user",
            "uid": 1000,
            "gid": 1000,
            "home_dir": "/home/user",
            "shell": "/bin/sh",
        },
        "display": 0,
    })
}

pub struct InitManager {
    pub name: String,
    pub sockaddr: String,
    pub init_bin: String,
    pub last_status: Option<i32>,
    pub last_stderr: String,
    child: Option<Child>,
    stderr_lines: Option<mpsc::Receiver<String>>,
}

impl InitManager {
    pub fn new() -> Self {
        let name = format!("sandbox-init-test-{}", rid());
        Self {
            sockaddr: format!("/tmp/{}.sock", name),
            name,
            init_bin: get_init_bin(),
            last_status: None,
            last_stderr: String::new(),
            child: None,
            stderr_lines: None,
        }
    }

    pub fn descriptor(&self) -> Value {
        descriptor_for(&self.sockaddr, &format!("/tmp/{}-root", self.name))
    }

    /// Runs the binary to completion with `stdin` as the descriptor input.
    pub fn run(&mut self, args: &[&str], stdin: &str) -> Result<()> {
        let mut child = Command::new(&self.init_bin)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to start sandbox-init")?;

        if let Some(mut input) = child.stdin.take() {
            // The binary may exit before reading anything
            let _ = input.write_all(stdin.as_bytes());
        }
        let output = child.wait_with_output()?;
        self.last_status = output.status.code();
        self.last_stderr = String::from_utf8_lossy(&output.stderr).to_string();
        println!("stderr:\n{}", self.last_stderr);
        Ok(())
    }

    pub fn xfail(&mut self, args: &[&str], stdin: &str) -> bool {
        match self.run(args, stdin) {
            Ok(()) => self.last_status != Some(0),
            Err(e) => {
                println!("Failed to run sandbox-init: {:#}", e);
                false
            }
        }
    }

    pub fn pass(&mut self, args: &[&str], stdin: &str) -> bool {
        match self.run(args, stdin) {
            Ok(()) => self.last_status == Some(0),
            Err(e) => {
                println!("Failed to run sandbox-init: {:#}", e);
                false
            }
        }
    }

    /// Starts the binary as pid 1 of fresh namespaces and waits for the
    /// readiness line.
    #[allow(dead_code)]
    pub fn start_isolated(&mut self) -> Result<()> {
        let descriptor = self.descriptor().to_string();
        let mut child = Command::new("unshare")
            .args([
                "--pid",
                "--fork",
                "--mount",
                "--uts",
                "--ipc",
                "--net",
                "--kill-child",
                &self.init_bin,
                "-v",
            ])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to start unshare")?;

        if let Some(mut input) = child.stdin.take() {
            input.write_all(descriptor.as_bytes())?;
        }
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr not captured"))?;
        self.stderr_lines = Some(forward_lines(stderr));
        self.child = Some(child);

        let lines = self
            .stderr_lines
            .as_ref()
            .ok_or_else(|| anyhow!("stderr not captured"))?;
        loop {
            let line = lines
                .recv_timeout(Duration::from_secs(20))
                .context("sandbox-init never became ready")?;
            println!("{}", line);
            if line == "OK" {
                return Ok(());
            }
            if line.starts_with("E ") {
                return Err(anyhow!("sandbox-init failed: {}", line));
            }
        }
    }

    #[allow(dead_code)]
    pub fn connect(&self) -> Result<UnixStream> {
        let stream = UnixStream::connect(&self.sockaddr)
            .context(format!("failed to connect to {}", self.sockaddr))?;
        stream.set_read_timeout(Some(Duration::from_secs(10)))?;
        Ok(stream)
    }

    /// Sends SIGTERM to the init process and waits for it to go away.
    #[allow(dead_code)]
    pub fn terminate(&mut self) -> Result<Option<i32>> {
        let mut child = self
            .child
            .take()
            .ok_or_else(|| anyhow!("sandbox-init is not running"))?;
        let status = Command::new("pkill")
            .args(["-TERM", "-P", &child.id().to_string()])
            .status()?;
        if !status.success() {
            return Err(anyhow!("failed to signal sandbox-init"));
        }
        let status = child.wait()?;
        Ok(status.code())
    }
}

impl Drop for InitManager {
    fn drop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        let _ = std::fs::remove_file(PathBuf::from(&self.sockaddr));
        let _ = std::fs::remove_dir(format!("/tmp/{}-root", self.name));
    }
}

fn forward_lines(stderr: ChildStderr) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for line in BufReader::new(stderr).lines() {
            let Ok(line) = line else { break };
            if tx.send(line).is_err() {
                break;
            }
        }
    });
    rx
}

#[allow(dead_code)]
pub fn request(stream: &mut UnixStream, message: &Value) -> Result<Value> {
    let payload = serde_json::to_vec(message)?;
    stream.write_all(&(payload.len() as u32).to_be_bytes())?;
    stream.write_all(&payload)?;

    let mut len = [0u8; 4];
    stream.read_exact(&mut len)?;
    let mut response = vec![0u8; u32::from_be_bytes(len) as usize];
    stream.read_exact(&mut response)?;
    Ok(serde_json::from_slice(&response)?)
}

#[fixture]
pub fn init() -> InitManager {
    InitManager::new()
}
