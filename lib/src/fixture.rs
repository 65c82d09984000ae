//! On-disk fixtures for the test suite: a scratch installation plus a
//! file-backed remote repository that tests publish refs into.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};

use crate::frontend::{Answer, Frontend, OpOutcome, Readiness};
use crate::installation::{DeployData, Installation};
use crate::refname::default_arch;
use crate::remote::{RemoteConfig, Summary, SummaryRef};
use crate::resolve::{Operation, Plan};
use crate::store::pull::{sign_payload, PullProgress};
use crate::store::{
    Commit, DirMeta, DirTree, DirEntry, FileEntry, ObjectId, ObjectKind, ObjectStore,
};

/// A scratch directory holding an installation and a remote repo.
#[derive(Debug)]
pub struct Fixture {
    _tempdir: tempfile::TempDir,
    /// Root scratch path.
    pub path: Utf8PathBuf,
}

enum Node {
    File(Vec<u8>),
    Dir(BTreeMap<String, Node>),
}

fn insert_node(root: &mut BTreeMap<String, Node>, path: &str, data: &[u8]) {
    let mut parts = path.split('/').peekable();
    let mut cur = root;
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            cur.insert(part.to_string(), Node::File(data.to_vec()));
            return;
        }
        let entry = cur
            .entry(part.to_string())
            .or_insert_with(|| Node::Dir(BTreeMap::new()));
        match entry {
            Node::Dir(map) => cur = map,
            Node::File(_) => panic!("fixture path {path} crosses a file"),
        }
    }
}

fn write_tree(store: &ObjectStore, nodes: &BTreeMap<String, Node>) -> Result<(ObjectId, ObjectId)> {
    let meta = store.write_object(ObjectKind::DirMeta, &DirMeta::default_dir().to_bytes()?)?;
    let mut tree = DirTree::default();
    for (name, node) in nodes {
        match node {
            Node::File(data) => {
                let object = store.write_object(ObjectKind::File, data)?;
                tree.files.push(FileEntry {
                    name: name.clone(),
                    object,
                    mode: 0o644,
                });
            }
            Node::Dir(children) => {
                let (sub_tree, sub_meta) = write_tree(store, children)?;
                tree.dirs.push(DirEntry {
                    name: name.clone(),
                    tree: sub_tree,
                    meta: sub_meta,
                });
            }
        }
    }
    tree.sort();
    let tree_id = store.write_object(ObjectKind::DirTree, &tree.to_bytes()?)?;
    Ok((tree_id, meta))
}

impl Fixture {
    /// Create a fresh scratch area.
    pub fn new() -> Result<Self> {
        let tempdir = tempfile::tempdir().context("Creating fixture tempdir")?;
        let path = Utf8Path::from_path(tempdir.path())
            .context("Non-UTF8 tempdir")?
            .to_owned();
        Ok(Self {
            _tempdir: tempdir,
            path,
        })
    }

    /// The scratch installation (created on first call).
    pub fn installation(&self) -> Result<Installation> {
        Installation::open("test", &self.path.join("inst"))
    }

    /// A second installation, for cross-installation scenarios.
    pub fn second_installation(&self) -> Result<Installation> {
        Installation::open("extra", &self.path.join("inst2"))
    }

    /// The scratch remote repository store.
    pub fn remote_repo(&self) -> Result<ObjectStore> {
        ObjectStore::ensure(&self.path.join("remote"))
    }

    /// A second repository usable as a sideload source.
    pub fn sideload_repo(&self) -> Result<ObjectStore> {
        ObjectStore::ensure(&self.path.join("sideload"))
    }

    /// Write a file tree (nested paths allowed) and commit it; returns
    /// the commit id.
    pub fn commit_sample_tree(&self, store: &ObjectStore, files: &[(&str, &[u8])]) -> ObjectId {
        self.commit_tree_with_meta(store, files, BTreeMap::new())
    }

    /// Like [`Self::commit_sample_tree`] with commit metadata attached.
    pub fn commit_tree_with_meta(
        &self,
        store: &ObjectStore,
        files: &[(&str, &[u8])],
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> ObjectId {
        let mut root = BTreeMap::new();
        for (path, data) in files {
            insert_node(&mut root, path, data);
        }
        let (tree, dirmeta) = write_tree(store, &root).expect("writing fixture tree");
        let commit = Commit {
            tree,
            dirmeta,
            parent: None,
            timestamp: 1_721_000_000,
            subject: "fixture".into(),
            body: String::new(),
            metadata,
        };
        store.write_commit(&commit, false).expect("writing fixture commit")
    }

    /// A minimal deploy-data record.
    pub fn deploy_data(origin: &str, commit: &ObjectId) -> DeployData {
        DeployData {
            origin: origin.to_string(),
            commit: commit.clone(),
            subpaths: Vec::new(),
            installed_size: 0,
            timestamp: 1_721_000_000,
            previous_id: None,
            runtime_ref: None,
            sdk_ref: None,
            related_to: None,
            delete_with_primary: false,
            autoprune: false,
            metadata: BTreeMap::new(),
        }
    }

    /// A summary entry pointing at a commit.
    pub fn summary_ref(commit: &ObjectId) -> SummaryRef {
        SummaryRef {
            commit: commit.clone(),
            download_size: 1024,
            installed_size: 4096,
            runtime_ref: None,
            sdk_ref: None,
            related: Vec::new(),
            metadata: BTreeMap::new(),
        }
    }

    /// Publish a summary (unsigned) into a repository.
    pub fn write_summary(&self, repo: &ObjectStore, summary: &Summary) -> Result<()> {
        use cap_std_ext::dirext::CapStdExtDirExt;
        let data = serde_json::to_vec(summary)?;
        repo.dir().atomic_write("summary", &data)?;
        Ok(())
    }

    /// Publish a summary signed with `key`.
    pub fn write_summary_signed(
        &self,
        repo: &ObjectStore,
        summary: &Summary,
        key: &[u8],
    ) -> Result<()> {
        use cap_std_ext::dirext::CapStdExtDirExt;
        let data = serde_json::to_vec(summary)?;
        let sig = sign_payload(key, &data)?;
        repo.dir().atomic_write("summary", &data)?;
        repo.dir().atomic_write("summary.sig", sig.as_bytes())?;
        Ok(())
    }

    /// Configure a `file://` remote named `name` pointing at the
    /// fixture's remote repo.
    pub fn add_file_remote(&self, installation: &Installation, name: &str) -> Result<()> {
        installation.add_remote(&RemoteConfig {
            name: name.to_string(),
            url: format!("file://{}", self.path.join("remote")),
            ..Default::default()
        })
    }

    /// The architecture fixtures should publish for, so bare-id
    /// arguments resolve on the host running the tests.
    pub fn arch() -> &'static str {
        default_arch()
    }
}

#[derive(Debug)]
struct RecordingInner {
    events: RefCell<Vec<String>>,
    ready_answer: Cell<Readiness>,
    confirm_answer: Cell<Answer>,
    choose_answer: Cell<Option<usize>>,
}

/// A frontend that records every engine callback and answers from
/// scripted values. Clones share state, so a test can keep one half
/// while the transaction owns the other.
#[derive(Debug, Clone)]
pub struct RecordingFrontend {
    inner: std::rc::Rc<RecordingInner>,
}

impl Default for RecordingFrontend {
    fn default() -> Self {
        Self {
            inner: std::rc::Rc::new(RecordingInner {
                events: RefCell::new(Vec::new()),
                ready_answer: Cell::new(Readiness::Continue),
                confirm_answer: Cell::new(Answer::Yes),
                choose_answer: Cell::new(Some(0)),
            }),
        }
    }
}

impl RecordingFrontend {
    fn record(&self, line: String) {
        self.inner.events.borrow_mut().push(line);
    }

    /// All recorded event lines.
    pub fn lines(&self) -> Vec<String> {
        self.inner.events.borrow().clone()
    }

    /// Script the answer to [`Frontend::ready`].
    pub fn set_ready_answer(&self, r: Readiness) {
        self.inner.ready_answer.set(r);
    }

    /// Script the answer to [`Frontend::confirm`].
    pub fn set_confirm_answer(&self, a: Answer) {
        self.inner.confirm_answer.set(a);
    }

    /// Script the answer to [`Frontend::choose_one`].
    pub fn set_choose_answer(&self, c: Option<usize>) {
        self.inner.choose_answer.set(c);
    }
}

impl Frontend for RecordingFrontend {
    fn ready(&self, plan: &Plan) -> Readiness {
        let refs: Vec<String> = plan
            .ops
            .iter()
            .map(|o| format!("{}:{}", o.kind.verb(), o.refname))
            .collect();
        self.record(format!("ready [{}]", refs.join(", ")));
        self.inner.ready_answer.get()
    }

    fn op_begin(&self, op: &Operation) {
        self.record(format!("begin {}:{}", op.kind.verb(), op.refname));
    }

    fn progress(&self, _op: &Operation, _progress: &PullProgress) {}

    fn op_end(&self, op: &Operation, outcome: &OpOutcome) {
        let tag = match outcome {
            OpOutcome::Done => "done".to_string(),
            OpOutcome::Skipped { reason } => format!("skipped ({reason})"),
            OpOutcome::Failed { message } => format!("failed ({message})"),
        };
        self.record(format!("end {}:{} {tag}", op.kind.verb(), op.refname));
    }

    fn choose_one(&self, prompt: &str, options: &[String]) -> Option<usize> {
        self.record(format!("choose {prompt} [{}]", options.join(", ")));
        self.inner.choose_answer.get()
    }

    fn confirm(&self, prompt: &str) -> Answer {
        self.record(format!("confirm {prompt}"));
        self.inner.confirm_answer.get()
    }

    fn warn(&self, kind: crate::frontend::WarningKind, detail: &str) {
        self.record(format!("warn {kind:?}: {detail}"));
    }
}
