/*!
Fake CloudflareSpeedTest: a `/bin/sh` script that prints a few progress
lines, writes a chosen CSV to the path given after `-o` and exits with a
chosen code. Unix only.
*/

use anyhow::Result;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct FakeSpeedTest {
    csv: Option<String>,
    exit_code: i32,
    delay_secs: u32,
}

impl FakeSpeedTest {
    /// Writes `csv` and exits 0.
    pub fn succeeding(csv: &str) -> Self {
        Self { csv: Some(csv.to_string()), exit_code: 0, delay_secs: 0 }
    }

    /// Writes nothing and exits with `code`.
    pub fn failing(code: i32) -> Self {
        Self { csv: None, exit_code: code, delay_secs: 0 }
    }

    /// Exits 0 without producing a result file.
    pub fn silent() -> Self {
        Self { csv: None, exit_code: 0, delay_secs: 0 }
    }

    /// Sleeps before writing, so concurrent triggers overlap.
    pub fn with_delay(mut self, secs: u32) -> Self {
        self.delay_secs = secs;
        self
    }

    pub fn script(&self) -> String {
        let mut s = String::from("#!/bin/sh\nout=\"\"\nwhile [ $# -gt 0 ]; do\n  if [ \"$1\" = \"-o\" ]; then out=\"$2\"; fi\n  shift\ndone\n");
        s.push_str("echo \"fake speed test: probing latency\"\n");
        if self.delay_secs > 0 {
            s.push_str(&format!("sleep {}\n", self.delay_secs));
        }
        if let Some(csv) = &self.csv {
            s.push_str("cat > \"$out\" <<'CFOPT_CSV'\n");
            s.push_str(csv);
            if !csv.ends_with('\n') {
                s.push('\n');
            }
            s.push_str("CFOPT_CSV\n");
        }
        s.push_str(&format!("exit {}\n", self.exit_code));
        s
    }

    /// Writes the executable script into `dir` and returns its path.
    #[cfg(unix)]
    pub fn install(&self, dir: &Path) -> Result<PathBuf> {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("CloudflareST");
        std::fs::write(&path, self.script())?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_shape() {
        let s = FakeSpeedTest::succeeding("IP 地址\n1.1.1.1").with_delay(2).script();
        assert!(s.starts_with("#!/bin/sh\n"));
        assert!(s.contains("sleep 2\n"));
        assert!(s.contains("1.1.1.1\nCFOPT_CSV\n"));
        assert!(s.ends_with("exit 0\n"));

        let s = FakeSpeedTest::failing(3).script();
        assert!(!s.contains("CFOPT_CSV"));
        assert!(s.ends_with("exit 3\n"));
    }

    #[cfg(unix)]
    #[test]
    fn test_install_is_executable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = FakeSpeedTest::silent().install(dir.path()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o111, 0o111);
    }
}
