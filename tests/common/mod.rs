#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use safefs::{AccessMode, AllowRule, Identity, MemoryAuditSink, SafeFs, SafeFsPolicy, Session};

pub const UID: u32 = 1000;

/// A throwaway home directory with a project inside it and a backup root beside it.
pub struct Home {
    pub dir: tempfile::TempDir,
    pub home: PathBuf,
    pub project: PathBuf,
    pub backups: PathBuf,
}

impl Home {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().canonicalize().expect("canonicalize tempdir");
        let home = root.join("home").join("alice");
        let project = home.join("src").join("app");
        std::fs::create_dir_all(project.join(".git")).expect("mkdir project");
        Self {
            backups: root.join("backups"),
            dir,
            home,
            project,
        }
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.home.join(relative)
    }

    pub fn write(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir parent");
        }
        std::fs::write(&path, content).expect("write fixture");
        path
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.path(relative)).expect("read fixture")
    }

    /// Outside the home directory but inside the tempdir.
    pub fn outside(&self) -> PathBuf {
        let outside = self.dir.path().join("outside");
        std::fs::create_dir_all(&outside).expect("mkdir outside");
        outside.canonicalize().expect("canonicalize outside")
    }

    pub fn identity(&self) -> Identity {
        Identity::new(UID, "alice", &self.home)
    }

    pub fn root_identity(&self) -> Identity {
        Identity::new(0, "root", &self.home)
    }

    /// Session rooted in the project with read-write access there.
    pub fn session(&self) -> Session {
        Session::with_project_root(
            self.identity(),
            &self.project,
            &self.project,
            AccessMode::ReadWrite,
        )
    }

    pub fn policy(&self, rules: &[(&str, AccessMode)]) -> SafeFsPolicy {
        let mut policy = SafeFsPolicy::with_rules(
            rules
                .iter()
                .map(|(pattern, mode)| AllowRule::new(*pattern, *mode))
                .collect(),
        );
        policy.backups.dir = Some(self.backups.clone());
        policy.retention.thin_in_background = false;
        policy
    }

    pub fn safefs(&self, rules: &[(&str, AccessMode)]) -> (SafeFs, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let safefs = SafeFs::new(self.policy(rules))
            .expect("safefs")
            .with_audit_sink(audit.clone());
        (safefs, audit)
    }
}

pub fn bashrc_rules() -> Vec<(&'static str, AccessMode)> {
    vec![
        (".bashrc", AccessMode::ReadWrite),
        (".config/**", AccessMode::Read),
    ]
}

pub fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|entry| {
                entry
                    .expect("dir entry")
                    .file_name()
                    .to_string_lossy()
                    .into_owned()
            })
            .collect(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(err) => panic!("read_dir {}: {err}", dir.display()),
    };
    names.sort();
    names
}
