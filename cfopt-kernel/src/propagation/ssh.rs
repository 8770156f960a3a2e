//! SSH/SFTP transport (ssh2). Password or key authentication; every
//! blocking call is bounded by the target's timeout.

use super::{CommandOutput, RemoteConfigStore, RemoteConnector, RemoteError};
use crate::config::PropagationTarget;
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

impl From<ssh2::Error> for RemoteError {
    fn from(e: ssh2::Error) -> Self {
        RemoteError::Transport(e.to_string())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl SshConnector {
    pub fn new() -> Self {
        Self
    }
}

impl RemoteConnector for SshConnector {
    fn connect(&self, target: &PropagationTarget) -> Result<Box<dyn RemoteConfigStore>, RemoteError> {
        let timeout = Duration::from_secs(target.timeout_seconds);
        let addr = (target.host.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|e| RemoteError::Connect(format!("{}:{}: {}", target.host, target.port, e)))?
            .next()
            .ok_or_else(|| RemoteError::Connect(format!("{} did not resolve", target.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| RemoteError::Connect(format!("{addr}: {e}")))?;
        tcp.set_read_timeout(Some(timeout))?;
        tcp.set_write_timeout(Some(timeout))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.set_timeout(u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake()?;

        let who = format!("{}@{}", target.username, target.host);
        let auth = match (&target.private_key, &target.password) {
            (Some(key), _) => session.userauth_pubkey_file(&target.username, None, key, target.passphrase.as_deref()),
            (None, Some(password)) => session.userauth_password(&target.username, password),
            (None, None) => return Err(RemoteError::Auth(who)),
        };
        if let Err(e) = auth {
            debug!(target = %target.name, "ssh auth error: {}", e);
            return Err(RemoteError::Auth(who));
        }
        if !session.authenticated() {
            return Err(RemoteError::Auth(who));
        }

        debug!(target = %target.name, %addr, "ssh session established");
        Ok(Box::new(SshStore { session }))
    }
}

pub struct SshStore {
    session: Session,
}

impl RemoteConfigStore for SshStore {
    fn read(&mut self, path: &str) -> Result<String, RemoteError> {
        let sftp = self.session.sftp()?;
        let mut file = sftp.open(Path::new(path))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;
        String::from_utf8(bytes).map_err(|_| RemoteError::NotUtf8 { path: path.to_string() })
    }

    fn replace(&mut self, path: &str, content: &str) -> Result<(), RemoteError> {
        let tmp = format!("{path}.cfopt-{}.tmp", Uuid::new_v4().simple());
        {
            let sftp = self.session.sftp()?;
            let mut file = sftp.create(Path::new(&tmp))?;
            file.write_all(content.as_bytes())?;
        }

        let mv = mv_command(&tmp, path);
        let out = self.exec(&mv)?;
        if out.exit_code != 0 {
            if let Err(e) = self.session.sftp().and_then(|s| s.unlink(Path::new(&tmp))) {
                warn!("could not remove temp file {}: {}", tmp, e);
            }
            return Err(RemoteError::CommandFailed {
                command: mv,
                code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            });
        }
        Ok(())
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let mut channel = self.session.channel_session()?;
        channel.exec(command)?;
        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr)?;
        channel.wait_close()?;
        Ok(CommandOutput { exit_code: channel.exit_status()?, stdout, stderr })
    }
}

/// Atomic rename of the uploaded temp file over the target.
fn mv_command(tmp: &str, path: &str) -> String {
    format!("mv -f {} {}", shell_words::quote(tmp), shell_words::quote(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TargetFormat;

    fn target(host: &str, port: u16) -> PropagationTarget {
        PropagationTarget {
            name: "t".into(),
            enabled: true,
            host: host.into(),
            port,
            username: "root".into(),
            password: Some("pw".into()),
            private_key: None,
            passphrase: None,
            remote_path: "/etc/hosts".into(),
            format: TargetFormat::HostsBlock,
            post_update_command: None,
            timeout_seconds: 1,
        }
    }

    #[test]
    fn test_refused_connection_is_connect_error() {
        // bind then drop to get a port nobody listens on
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let err = SshConnector::new().connect(&target("127.0.0.1", port)).err().unwrap();
        assert!(matches!(err, RemoteError::Connect(_)));
    }

    #[test]
    fn test_unresolvable_host_is_connect_error() {
        let err = SshConnector::new().connect(&target("no-such-host.invalid", 22)).err().unwrap();
        assert!(matches!(err, RemoteError::Connect(_)));
    }

    #[test]
    fn test_mv_command_quotes_paths() {
        assert_eq!(mv_command("/tmp/a b.tmp", "/etc/a b"), "mv -f '/tmp/a b.tmp' '/etc/a b'");
        assert_eq!(
            mv_command("/etc/hosts.cfopt-1.tmp", "/etc/hosts"),
            "mv -f /etc/hosts.cfopt-1.tmp /etc/hosts"
        );
    }
}
