//! In-process backend for unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::DuplexStream;
use tokio::sync::oneshot;

use super::credentials::Credential;
use super::{
    ConnectionTarget, Connector, PtyRequest, RemoteConnection, RemoteEntry, RemoteFs,
    RemoteMetadata, RemoteShell, ShellExit, ShellInput,
};
use crate::error::BridgeError;

/// Records everything written to the shell.
#[derive(Default)]
pub struct MockInput {
    pub written: Mutex<Vec<u8>>,
    pub resizes: Mutex<Vec<(u32, u32)>>,
}

#[async_trait]
impl ShellInput for MockInput {
    async fn write(&self, data: &[u8]) -> Result<(), BridgeError> {
        self.written.lock().extend_from_slice(data);
        Ok(())
    }

    async fn resize(&self, cols: u32, rows: u32) -> Result<(), BridgeError> {
        self.resizes.lock().push((cols, rows));
        Ok(())
    }
}

/// Test-side ends of the scripted shell.
pub struct ShellControl {
    /// Bytes written here appear as shell output; drop it for EOF.
    pub output: DuplexStream,
    pub exit: oneshot::Sender<ShellExit>,
}

struct MockFile {
    path: String,
    is_dir: bool,
    /// Reported by `stat` when set, independent of `data`.
    size: Option<u64>,
    data: Vec<u8>,
}

/// Flat in-memory filesystem. `read_dir` lists direct children in
/// insertion order.
#[derive(Default)]
pub struct MockFs {
    files: Mutex<Vec<MockFile>>,
    failing: Mutex<HashSet<String>>,
    pub removed: Mutex<Vec<String>>,
    pub closes: AtomicUsize,
}

impl MockFs {
    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.upsert(path, false, None, data.to_vec());
    }

    /// A file whose `stat` claims `size` bytes without holding them.
    pub fn add_sized(&self, path: &str, size: u64) {
        self.upsert(path, false, Some(size), Vec::new());
    }

    pub fn add_dir(&self, path: &str) {
        self.upsert(path, true, None, Vec::new());
    }

    /// Make every operation on `path` fail.
    pub fn fail_on(&self, path: &str) {
        self.failing.lock().insert(path.to_string());
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .iter()
            .find(|f| f.path == path)
            .map(|f| f.data.clone())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.files.lock().iter().any(|f| f.path == path)
    }

    fn upsert(&self, path: &str, is_dir: bool, size: Option<u64>, data: Vec<u8>) {
        let mut files = self.files.lock();
        files.retain(|f| f.path != path);
        files.push(MockFile {
            path: path.to_string(),
            is_dir,
            size,
            data,
        });
    }

    fn check(&self, path: &str) -> Result<(), BridgeError> {
        if self.failing.lock().contains(path) {
            return Err(BridgeError::Remote(format!("permission denied: {path}")));
        }
        Ok(())
    }

    fn metadata(file: &MockFile) -> RemoteMetadata {
        RemoteMetadata {
            size: file.size.unwrap_or(file.data.len() as u64),
            is_dir: file.is_dir,
            permissions: if file.is_dir { 0o040_755 } else { 0o100_644 },
            modified: 1_700_000_000,
        }
    }
}

/// `RemoteFs` handle onto a shared [`MockFs`].
struct MockFsClient(Arc<MockFs>);

#[async_trait]
impl RemoteFs for MockFsClient {
    async fn stat(&self, path: &str) -> Result<RemoteMetadata, BridgeError> {
        self.0.check(path)?;
        self.0
            .files
            .lock()
            .iter()
            .find(|f| f.path == path)
            .map(MockFs::metadata)
            .ok_or_else(|| BridgeError::Remote(format!("no such file: {path}")))
    }

    async fn read_dir(&self, path: &str) -> Result<Vec<RemoteEntry>, BridgeError> {
        self.0.check(path)?;
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(self
            .0
            .files
            .lock()
            .iter()
            .filter_map(|f| {
                let name = f.path.strip_prefix(&prefix)?;
                (!name.contains('/')).then(|| RemoteEntry {
                    name: name.to_string(),
                    metadata: MockFs::metadata(f),
                })
            })
            .collect())
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>, BridgeError> {
        self.0.check(path)?;
        self.0
            .contents(path)
            .ok_or_else(|| BridgeError::Remote(format!("no such file: {path}")))
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<(), BridgeError> {
        self.0.check(path)?;
        self.0.add_file(path, content);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), BridgeError> {
        self.0.check(path)?;
        let mut files = self.0.files.lock();
        let before = files.len();
        files.retain(|f| f.path != path);
        if files.len() == before {
            return Err(BridgeError::Remote(format!("no such file: {path}")));
        }
        self.0.removed.lock().push(path.to_string());
        Ok(())
    }

    async fn close(&self) {
        self.0.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct MockConnection {
    pub fs: Arc<MockFs>,
    pub input: Arc<MockInput>,
    pub close_calls: AtomicUsize,
    pub fs_opens: AtomicUsize,
    pub pty: Mutex<Option<PtyRequest>>,
    shell: Mutex<Option<RemoteShell>>,
    control: Mutex<Option<ShellControl>>,
}

impl MockConnection {
    pub fn new() -> Arc<Self> {
        let (remote_out, local_out) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();
        let input = Arc::new(MockInput::default());
        Arc::new(Self {
            fs: Arc::new(MockFs::default()),
            input: Arc::clone(&input),
            close_calls: AtomicUsize::new(0),
            fs_opens: AtomicUsize::new(0),
            pty: Mutex::new(None),
            shell: Mutex::new(Some(RemoteShell {
                output: Box::new(local_out),
                input,
                exit: exit_rx,
            })),
            control: Mutex::new(Some(ShellControl {
                output: remote_out,
                exit: exit_tx,
            })),
        })
    }

    /// Take the test-side ends of the shell. Panics when called twice.
    pub fn shell_control(&self) -> ShellControl {
        self.control.lock().take().expect("shell control already taken")
    }

    pub fn closes(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RemoteConnection for MockConnection {
    async fn open_shell(&self, pty: &PtyRequest) -> Result<RemoteShell, BridgeError> {
        *self.pty.lock() = Some(pty.clone());
        self.shell
            .lock()
            .take()
            .ok_or_else(|| BridgeError::Remote("shell already opened".into()))
    }

    async fn open_fs(&self) -> Result<Box<dyn RemoteFs>, BridgeError> {
        self.fs_opens.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockFsClient(Arc::clone(&self.fs))))
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

/// Hands out one prepared connection, or fails with a fixed error.
pub struct MockConnector {
    connection: Arc<MockConnection>,
    failure: Option<Box<dyn Fn() -> BridgeError + Send + Sync>>,
    pub targets: Mutex<Vec<ConnectionTarget>>,
    pub methods: Mutex<Vec<&'static str>>,
}

impl MockConnector {
    pub fn new(connection: Arc<MockConnection>) -> Arc<Self> {
        Arc::new(Self {
            connection,
            failure: None,
            targets: Mutex::new(Vec::new()),
            methods: Mutex::new(Vec::new()),
        })
    }

    pub fn failing(failure: impl Fn() -> BridgeError + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            connection: MockConnection::new(),
            failure: Some(Box::new(failure)),
            targets: Mutex::new(Vec::new()),
            methods: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        target: &ConnectionTarget,
        attempts: Vec<Credential>,
    ) -> Result<Arc<dyn RemoteConnection>, BridgeError> {
        self.targets.lock().push(target.clone());
        self.methods
            .lock()
            .extend(attempts.iter().map(Credential::method));
        if let Some(failure) = &self.failure {
            return Err(failure());
        }
        Ok(Arc::clone(&self.connection) as Arc<dyn RemoteConnection>)
    }
}
