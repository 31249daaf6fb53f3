//! Git working copy for the manifest repository.
//!
//! All libgit2 calls are blocking. [`GitWorkspace::run`] moves a whole
//! sequence of them onto the blocking pool, holding the clone's mutex for
//! as long as the blocking task runs, and bounds it with a timeout.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use finops_core::config::GitopsConfig;
use git2::build::{CheckoutBuilder, RepoBuilder};
use git2::{
    Commit, Cred, FetchOptions, IndexAddOption, Oid, PushOptions, RemoteCallbacks, Repository,
    Signature,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::ApplyError;

/// Where the repository lives and how to talk to it.
#[derive(Clone)]
pub struct GitSettings {
    pub url: String,
    pub base_branch: String,
    pub clone_path: PathBuf,
    pub username: Option<String>,
    pub password: Option<String>,
    pub author_name: String,
    pub author_email: String,
    /// Bound on one full apply sequence, network included.
    pub timeout: Duration,
}

impl GitSettings {
    /// Settings from config; the password is read from the environment.
    pub fn from_config(config: &GitopsConfig) -> Self {
        let password = config
            .password_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|p| !p.is_empty());
        if config.username.is_some() && password.is_none() {
            warn!(username = ?config.username, "git username set but no password found");
        }
        Self {
            url: config.url.clone(),
            base_branch: config.base_branch.clone(),
            clone_path: config.clone_path.clone(),
            username: config.username.clone(),
            password,
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            timeout: Duration::from_secs(config.network_timeout_secs.max(1)),
        }
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        callbacks.credentials(move |_url, username_from_url, _allowed_types| {
            match &self.password {
                Some(password) => Cred::userpass_plaintext(
                    self.username
                        .as_deref()
                        .or(username_from_url)
                        .unwrap_or("git"),
                    password,
                ),
                None => Cred::default(),
            }
        });
        callbacks
    }
}

/// A single working clone, shared by every apply.
#[derive(Clone)]
pub struct GitWorkspace {
    settings: Arc<GitSettings>,
    lock: Arc<Mutex<()>>,
}

impl GitWorkspace {
    pub fn new(settings: GitSettings) -> Self {
        Self {
            settings: Arc::new(settings),
            lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn settings(&self) -> &GitSettings {
        &self.settings
    }

    /// Acquire the working copy and run `f` against it on the blocking pool.
    pub async fn run<F, T, E>(&self, operation: &'static str, f: F) -> Result<T, E>
    where
        F: FnOnce(&RepoSession) -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: From<ApplyError> + Send + 'static,
    {
        let guard = self.lock.clone().lock_owned().await;
        let settings = self.settings.clone();
        let timeout = settings.timeout;

        let task = tokio::task::spawn_blocking(move || {
            // Held until the blocking work is done, even if the caller
            // stops waiting.
            let _guard = guard;
            let session = RepoSession::acquire(settings).map_err(E::from)?;
            f(&session)
        });

        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(ApplyError::Join(join.to_string()).into()),
            Err(_) => Err(ApplyError::Timeout {
                operation,
                secs: timeout.as_secs(),
            }
            .into()),
        }
    }
}

/// An open repository plus its settings. Only lives on the blocking pool.
pub struct RepoSession {
    repo: Repository,
    settings: Arc<GitSettings>,
}

impl RepoSession {
    /// Open the clone, cloning fresh if absent and re-cloning if the
    /// directory is not a usable repository.
    fn acquire(settings: Arc<GitSettings>) -> Result<Self, ApplyError> {
        let path = settings.clone_path.clone();

        if path.join(".git").exists() {
            match Repository::open(&path) {
                Ok(repo) => {
                    let session = Self { repo, settings };
                    session.fetch_base()?;
                    debug!(path = %path.display(), "opened existing clone");
                    return Ok(session);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "clone is unusable, re-cloning");
                }
            }
        }
        if path.exists() {
            warn!(path = %path.display(), "removing non-repository directory before clone");
            std::fs::remove_dir_all(&path)?;
        }

        info!(url = %settings.url, path = %path.display(), "cloning manifest repository");
        let repo = {
            let mut fetch_options = FetchOptions::new();
            fetch_options.remote_callbacks(settings.callbacks());
            let mut builder = RepoBuilder::new();
            builder.fetch_options(fetch_options);
            builder.branch(&settings.base_branch);
            builder.clone(&settings.url, &path)?
        };
        Ok(Self { repo, settings })
    }

    pub fn workdir(&self) -> &Path {
        self.repo
            .workdir()
            .unwrap_or(self.settings.clone_path.as_path())
    }

    fn fetch_base(&self) -> Result<(), ApplyError> {
        let base = &self.settings.base_branch;
        let refspec = format!("+refs/heads/{base}:refs/remotes/origin/{base}");
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.settings.callbacks());
        let mut remote = self.repo.find_remote("origin")?;
        remote.fetch(&[refspec.as_str()], Some(&mut options), None)?;
        debug!(branch = %base, "fetched base branch");
        Ok(())
    }

    /// Newest known commit of the base branch, remote first.
    fn base_commit(&self) -> Result<Commit<'_>, ApplyError> {
        let base = &self.settings.base_branch;
        let reference = self
            .repo
            .find_reference(&format!("refs/remotes/origin/{base}"))
            .or_else(|_| self.repo.find_reference(&format!("refs/heads/{base}")))?;
        Ok(reference.peel_to_commit()?)
    }

    /// Force-checkout the base branch at its newest commit, discarding
    /// anything left behind by an earlier run.
    pub fn checkout_base(&self) -> Result<Oid, ApplyError> {
        let base = &self.settings.base_branch;
        let commit = self.base_commit()?;

        // Detach first: a branch cannot be force-moved while it is HEAD.
        self.repo.set_head_detached(commit.id())?;
        self.repo.checkout_head(Some(
            CheckoutBuilder::new().force().remove_untracked(true),
        ))?;
        self.repo.branch(base, &commit, true)?;
        self.repo.set_head(&format!("refs/heads/{base}"))?;
        debug!(branch = %base, commit = %commit.id(), "checked out base");
        Ok(commit.id())
    }

    /// (Re)create `branch` at the base head and check it out.
    pub fn start_branch(&self, branch: &str) -> Result<(), ApplyError> {
        let base = self.checkout_base()?;
        let commit = self.repo.find_commit(base)?;
        self.repo.branch(branch, &commit, true)?;
        self.repo.set_head(&format!("refs/heads/{branch}"))?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))?;
        info!(%branch, base = %self.settings.base_branch, "branch created");
        Ok(())
    }

    /// Stage everything and commit if the tree differs from HEAD.
    pub fn commit_all(&self, message: &str) -> Result<Option<Oid>, ApplyError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = self.repo.head()?.peel_to_commit()?;
        if parent.tree_id() == tree_id {
            debug!("working tree unchanged, nothing to commit");
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_id)?;
        let signature = Signature::now(&self.settings.author_name, &self.settings.author_email)?;
        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &[&parent])?;
        info!(commit = %oid, "committed");
        Ok(Some(oid))
    }

    /// Force-push `branch` to origin.
    pub fn push_branch(&self, branch: &str) -> Result<(), ApplyError> {
        let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
        let mut options = PushOptions::new();
        options.remote_callbacks(self.settings.callbacks());
        let mut remote = self.repo.find_remote("origin")?;
        remote.push(&[refspec.as_str()], Some(&mut options))?;
        info!(%branch, "pushed");
        Ok(())
    }
}
