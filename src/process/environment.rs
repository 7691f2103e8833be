use log::warn;
use std::path::Path;
use std::process::Command;

const DEFAULT_PATH: &str = "/usr/bin:/bin";

/// The environment handed to every child: the caller's variables, then the
/// ones we add. Later entries win when a key repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchEnv {
    vars: Vec<(String, String)>,
}

impl LaunchEnv {
    pub fn build(caller: &[String], display: Option<u32>) -> Self {
        let mut env = Self::default();
        for entry in caller {
            match entry.split_once('=') {
                Some((key, value)) if !key.is_empty() => env.push(key, value),
                _ => warn!("Ignoring malformed launch variable: {}", entry),
            }
        }
        env.push("PATH", DEFAULT_PATH);
        if let Some(display) = display {
            env.push("DISPLAY", &format!(":{}", display));
        }
        env
    }

    pub fn push(&mut self, key: &str, value: &str) {
        self.vars.push((key.to_string(), value.to_string()));
    }

    pub fn push_home(&mut self, home: &Path) {
        if !home.as_os_str().is_empty() {
            self.push("HOME", &home.to_string_lossy());
        }
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Replaces the command's environment with ours.
    pub fn apply(&self, command: &mut Command) {
        command.env_clear();
        command.envs(self.iter());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(vars: &[&str]) -> Vec<String> {
        vars.iter().map(|s| s.to_string()).collect()
    }

    fn entries(env: &LaunchEnv) -> Vec<String> {
        env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
    }

    #[test]
    fn test_build_with_display() {
        let raw = strings(&["LANG=C.UTF-8", "A=b=c"]);
        let env = LaunchEnv::build(&raw, Some(3));
        assert_eq!(
            entries(&env),
            vec!["LANG=C.UTF-8", "A=b=c", "PATH=/usr/bin:/bin", "DISPLAY=:3"]
        );
    }

    #[test]
    fn test_build_without_display_drops_malformed() {
        let raw = strings(&["NOEQUALS", "=value", "EMPTY="]);
        let env = LaunchEnv::build(&raw, None);
        assert_eq!(entries(&env), vec!["EMPTY=", "PATH=/usr/bin:/bin"]);
        assert_eq!(env.get("DISPLAY"), None);
    }

    #[test]
    fn test_home_and_overrides() {
        let mut env = LaunchEnv::build(&strings(&["PATH=/opt/bin"]), None);
        assert_eq!(env.get("PATH"), Some("/usr/bin:/bin"));

        env.push_home(Path::new(""));
        assert_eq!(env.get("HOME"), None);
        env.push_home(Path::new("/home/user"));
        assert_eq!(env.get("HOME"), Some("/home/user"));
    }

    #[test]
    fn test_apply_replaces_environment() {
        let env = LaunchEnv::build(&strings(&["ONLY=this"]), None);
        let output = {
            let mut command = Command::new("/usr/bin/env");
            env.apply(&mut command);
            command.output().unwrap()
        };
        let stdout = String::from_utf8(output.stdout).unwrap();
        let mut lines: Vec<&str> = stdout.lines().collect();
        lines.sort();
        assert_eq!(lines, vec!["ONLY=this", "PATH=/usr/bin:/bin"]);
    }
}
