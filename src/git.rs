use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use git2::build::CheckoutBuilder;
use git2::{ErrorCode, IndexAddOption, Repository, Signature, StatusOptions, Tree};

use crate::core::task::Task;
use crate::orchestration::Vcs;
use crate::util::{blocking, resource_path};
use crate::{Error, Result};

/// [`Vcs`] backed by a local git repository.
///
/// Every call opens the repository afresh on a blocking thread, so one
/// instance can be shared by all groups of a run. Clones share one lock
/// that serializes all index and HEAD access; separately constructed
/// instances do not.
#[derive(Debug, Clone)]
pub struct GitVcs {
    repo_path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl GitVcs {
    pub fn new(repo_path: &Path) -> Result<Self> {
        tracing::debug!(path = %repo_path.display(), "GitVcs::new");
        let repo = Repository::discover(repo_path)?;
        let workdir = repo
            .workdir()
            .ok_or_else(|| Error::Validation("bare repositories are not supported".to_string()))?;
        Ok(Self {
            repo_path: workdir.to_path_buf(),
            lock: Arc::new(Mutex::new(())),
        })
    }

    /// Run `f` on a blocking thread while holding the repository lock.
    async fn locked<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Path) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let repo_path = self.repo_path.clone();
        let lock = Arc::clone(&self.lock);
        blocking(move || {
            // Guards no data; poisoning is ignored.
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f(&repo_path)
        })
        .await
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::open(&self.repo_path)?)
    }

    /// Root of the working tree.
    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn head_commit(&self) -> Result<String> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let repo = self.repo()?;
        let head = repo.head()?;
        let commit = head.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn is_dirty(&self) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let repo = self.repo()?;
        let mut options = StatusOptions::new();
        options.include_untracked(true).include_ignored(false);
        let statuses = repo.statuses(Some(&mut options))?;
        Ok(!statuses.is_empty())
    }

    /// Caller must hold the repository lock.
    fn revert_blocking(repo_path: &Path, resources: &[String]) -> Result<()> {
        let repo = Repository::open(repo_path)?;
        let head_commit = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        let head_tree = head_commit.as_ref().map(|c| c.tree()).transpose()?;

        let mut tracked = Vec::new();
        let mut untracked = Vec::new();
        for resource in resources {
            let path = resource_path(resource)?;
            if in_tree(head_tree.as_ref(), path) {
                tracked.push(resource.as_str());
            } else {
                untracked.push(path);
            }
        }

        if let Some(commit) = &head_commit {
            if !tracked.is_empty() {
                repo.reset_default(Some(commit.as_object()), tracked.iter().copied())?;
                let mut checkout = CheckoutBuilder::new();
                checkout.force();
                for path in &tracked {
                    checkout.path(*path);
                }
                repo.checkout_head(Some(&mut checkout))?;
            }
        }

        let mut index = repo.index()?;
        for path in untracked {
            let full = repo_path.join(path);
            if full.is_dir() {
                std::fs::remove_dir_all(&full)?;
                index.remove_dir(path, 0)?;
            } else {
                if full.exists() {
                    std::fs::remove_file(&full)?;
                }
                if index.get_path(path, 0).is_some() {
                    index.remove_path(path)?;
                }
            }
        }
        index.write()?;

        tracing::debug!(
            tracked = tracked.len(),
            total = resources.len(),
            "resources reverted"
        );
        Ok(())
    }

    /// Caller must hold the repository lock.
    fn commit_blocking(repo_path: &Path, resources: &[String], message: &str) -> Result<String> {
        let repo = Repository::open(repo_path)?;
        let mut index = repo.index()?;
        for resource in resources {
            let path = resource_path(resource)?;
            let full = repo_path.join(path);
            if full.is_dir() {
                index.add_all([resource.as_str()].iter(), IndexAddOption::DEFAULT, None)?;
            } else if full.exists() {
                index.add_path(path)?;
            } else if index.get_path(path, 0).is_some() {
                index.remove_path(path)?;
            }
        }
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Stagewise", "stagewise@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        tracing::debug!(commit = %commit_id, "commit created");
        Ok(commit_id.to_string())
    }
}

fn in_tree(tree: Option<&Tree<'_>>, path: &Path) -> bool {
    tree.is_some_and(|t| t.get_path(path).is_ok())
}

#[async_trait]
impl Vcs for GitVcs {
    async fn revert(&self, resources: &[String]) -> Result<()> {
        let resources = resources.to_vec();
        self.locked(move |repo_path| Self::revert_blocking(repo_path, &resources))
            .await
    }

    async fn commit(&self, task: &Task) -> Result<String> {
        let resources = task.resource_touches.clone();
        let message = format!("{}: {}", task.id, task.title);
        self.locked(move |repo_path| Self::commit_blocking(repo_path, &resources, &message))
            .await
    }
}
