//! Fixtures shared by the unit tests.

use async_trait::async_trait;
use buildfarm_core::filemap::FileLocator;
use buildfarm_core::job::ArchivePurpose;
use buildfarm_core::kind::{ArchiveDependency, BinaryPackageBuild, BuildKind, SnapBuild, SourceFile};
use buildfarm_core::notify::Notifier;
use buildfarm_core::store::JobStore;
use buildfarm_core::worker::WorkerInfo;
use buildfarm_core::{BuildCookie, BuildJob, BuildStatus, BuildTarget, Error, ImageType, Pocket, Result};
use buildfarm_worker::{MemoryWorker, sha256_hex};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

use crate::collector::ResultCollector;
use crate::content::FsContentStore;
use crate::context::{ArchiveKeyring, BuildContextProvider, ImageRegistry};
use crate::dispatcher::Dispatcher;
use crate::files::RegistryFileResolver;
use crate::notify::StaticSourceCatalog;
use crate::session::BuilderSession;
use crate::status::StatusHandler;
use crate::store::MemoryJobStore;

pub(crate) fn make_target() -> BuildTarget {
    BuildTarget {
        archive_id: 1,
        archive_purpose: ArchivePurpose::Primary,
        archive_private: false,
        distribution: "ubuntu".to_string(),
        series: "noble".to_string(),
        arch: "amd64".to_string(),
        pocket: Pocket::Release,
    }
}

pub(crate) fn source_sha(filename: &str) -> String {
    sha256_hex(filename.as_bytes())
}

pub(crate) fn make_binary_job() -> BuildJob {
    let source = |filename: &str| SourceFile {
        filename: filename.to_string(),
        url: format!("https://files.example.net/{}", filename),
        sha256: source_sha(filename),
    };
    BuildJob::new(
        BuildKind::BinaryPackage(BinaryPackageBuild {
            source_name: "hello".to_string(),
            version: "2.10-3".to_string(),
            source_files: vec![source("hello_2.10-3.dsc"), source("hello_2.10.orig.tar.gz")],
            arch_indep: true,
            build_debug_symbols: false,
            archive_dependencies: vec![ArchiveDependency {
                line: "deb http://archive.example.net/ubuntu noble main".to_string(),
                private: false,
            }],
            trusted_keys: vec![],
        }),
        make_target(),
    )
}

pub(crate) fn make_snap_job() -> BuildJob {
    BuildJob::new(
        BuildKind::Snap(SnapBuild {
            name: "hello-snap".to_string(),
            git_repository: "https://git.example.net/hello-snap".to_string(),
            git_path: Some("main".to_string()),
            build_source_tarball: false,
            channels: BTreeMap::new(),
        }),
        make_target(),
    )
}

pub(crate) fn image_locator(image_type: ImageType) -> FileLocator {
    FileLocator {
        url: format!("https://images.example.net/noble-amd64.{}", image_type),
        sha256: sha256_hex(format!("noble-amd64-{}", image_type).as_bytes()),
        credentials: None,
    }
}

pub(crate) fn worker_info(name: &str, virtualized: bool) -> WorkerInfo {
    WorkerInfo {
        name: name.to_string(),
        url: format!("memory://{}", name),
        virtualized,
    }
}

/// Notifier that remembers what it was asked to send.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
    sent: Mutex<Vec<(BuildCookie, BuildStatus)>>,
    fail_next: Mutex<bool>,
}

impl RecordingNotifier {
    pub(crate) fn sent(&self) -> Vec<(BuildCookie, BuildStatus)> {
        self.sent.lock().clone()
    }

    pub(crate) fn fail_next(&self) {
        *self.fail_next.lock() = true;
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, job: &BuildJob) -> Result<()> {
        if std::mem::take(&mut *self.fail_next.lock()) {
            return Err(Error::Transport("mail server unavailable".to_string()));
        }
        self.sent.lock().push((job.cookie.clone(), job.status()));
        Ok(())
    }
}

/// A dispatcher and status handler wired to in-memory collaborators and a
/// temporary farm root.
pub(crate) struct Harness {
    pub root: TempDir,
    pub store: Arc<MemoryJobStore>,
    pub content: Arc<FsContentStore>,
    pub notifier: Arc<RecordingNotifier>,
    pub sources: Arc<StaticSourceCatalog>,
    pub dispatcher: Arc<Dispatcher>,
    pub handler: Arc<StatusHandler>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        Self::with_images(&[ImageType::Chroot, ImageType::Lxd])
    }

    pub(crate) fn with_images(types: &[ImageType]) -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut registry = ImageRegistry::new();
        for t in types {
            registry.register("noble", "amd64", *t, image_locator(*t));
        }
        let images = Arc::new(registry);

        let store = Arc::new(MemoryJobStore::new());
        let content = Arc::new(FsContentStore::new(root.path().join("content")));
        let notifier = Arc::new(RecordingNotifier::default());
        let sources = Arc::new(StaticSourceCatalog::new());

        let dispatcher = Arc::new(Dispatcher::new(
            BuildContextProvider::new(images.clone(), ArchiveKeyring::new()),
            Arc::new(RegistryFileResolver::new(images)),
            store.clone(),
        ));
        let handler = Arc::new(StatusHandler::new(
            store.clone(),
            content.clone(),
            notifier.clone(),
            sources.clone(),
            ResultCollector::new(root.path()),
        ));

        Self {
            root,
            store,
            content,
            notifier,
            sources,
            dispatcher,
            handler,
        }
    }

    pub(crate) fn collector(&self) -> ResultCollector {
        ResultCollector::new(self.root.path())
    }

    pub(crate) async fn enqueue(&self, job: BuildJob) -> BuildJob {
        self.store.enqueue(job).await.unwrap()
    }

    /// Enqueue `job` and dispatch it to `worker`.
    pub(crate) async fn dispatched(&self, job: BuildJob, worker: Arc<MemoryWorker>) -> BuilderSession {
        let job = self.enqueue(job).await;
        let mut session = BuilderSession::new(job, worker);
        self.dispatcher.dispatch(&mut session).await.unwrap();
        session
    }
}
