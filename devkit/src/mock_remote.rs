/*!
In-memory remote device for propagation tests.

Records every write and command so tests can assert that an unchanged file
is never rewritten and that the post-update command runs after a write.
*/

use cfopt_kernel::config::PropagationTarget;
use cfopt_kernel::propagation::{CommandOutput, RemoteConfigStore, RemoteConnector, RemoteError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Default)]
struct Device {
    files: HashMap<String, String>,
    writes: Vec<(String, String)>,
    commands: Vec<String>,
    command_exit_code: i32,
}

/// Shared handle on one fake device; clones see the same files.
#[derive(Debug, Clone, Default)]
pub struct MockRemoteStore {
    device: Arc<Mutex<Device>>,
}

impl MockRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: &str, content: &str) -> Self {
        self.device.lock().unwrap().files.insert(path.to_string(), content.to_string());
        self
    }

    /// Exit code returned by every `exec`.
    pub fn with_command_exit_code(self, code: i32) -> Self {
        self.device.lock().unwrap().command_exit_code = code;
        self
    }

    pub fn file(&self, path: &str) -> Option<String> {
        self.device.lock().unwrap().files.get(path).cloned()
    }

    pub fn write_count(&self) -> usize {
        self.device.lock().unwrap().writes.len()
    }

    pub fn commands(&self) -> Vec<String> {
        self.device.lock().unwrap().commands.clone()
    }
}

impl RemoteConfigStore for MockRemoteStore {
    fn read(&mut self, path: &str) -> Result<String, RemoteError> {
        self.file(path).ok_or_else(|| {
            RemoteError::Io(std::io::Error::new(std::io::ErrorKind::NotFound, format!("{path}: no such file")))
        })
    }

    fn replace(&mut self, path: &str, content: &str) -> Result<(), RemoteError> {
        let mut device = self.device.lock().unwrap();
        device.files.insert(path.to_string(), content.to_string());
        device.writes.push((path.to_string(), content.to_string()));
        Ok(())
    }

    fn exec(&mut self, command: &str) -> Result<CommandOutput, RemoteError> {
        let mut device = self.device.lock().unwrap();
        device.commands.push(command.to_string());
        let exit_code = device.command_exit_code;
        Ok(CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: if exit_code == 0 { String::new() } else { format!("{command}: failed") },
        })
    }
}

/// Hands out the same store for every target, or refuses every connection.
#[derive(Debug, Clone, Default)]
pub struct MockConnector {
    store: MockRemoteStore,
    refuse: bool,
    connect_delay: Option<Duration>,
    connects: Arc<Mutex<Vec<String>>>,
}

impl MockConnector {
    pub fn new(store: MockRemoteStore) -> Self {
        Self { store, ..Default::default() }
    }

    pub fn unreachable() -> Self {
        Self { refuse: true, ..Default::default() }
    }

    /// Blocks for `delay` in every `connect`, like a device that stopped answering.
    pub fn hanging(store: MockRemoteStore, delay: Duration) -> Self {
        Self { store, connect_delay: Some(delay), ..Default::default() }
    }

    pub fn store(&self) -> MockRemoteStore {
        self.store.clone()
    }

    /// Target names in connection order.
    pub fn connections(&self) -> Vec<String> {
        self.connects.lock().unwrap().clone()
    }
}

impl RemoteConnector for MockConnector {
    fn connect(&self, target: &PropagationTarget) -> Result<Box<dyn RemoteConfigStore>, RemoteError> {
        self.connects.lock().unwrap().push(target.name.clone());
        if let Some(delay) = self.connect_delay {
            std::thread::sleep(delay);
        }
        if self.refuse {
            return Err(RemoteError::Connect(format!("{}:{} refused", target.host, target.port)));
        }
        Ok(Box::new(self.store.clone()))
    }
}
