use anyhow::Result;
use async_trait::async_trait;
use squadron_core::agent_session::WorktreeProvisioner;
use squadron_core::git::Git;

/// Creates one git worktree per spawned agent under the repo's own git
/// directory, branch-named `squadron/<role>-<agent_id>`. Git's worktree
/// machinery itself is synchronous (it shells out); the trait is async
/// only so the Agent Manager can call it without blocking its runtime.
pub struct GitWorktreeProvisioner {
    git: Git,
}

impl GitWorktreeProvisioner {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self { git: Git::new(repo_path) }
    }
}

#[async_trait]
impl WorktreeProvisioner for GitWorktreeProvisioner {
    async fn create_worktree(&self, agent_id: i64, role: &str, base_branch: &str) -> Result<(String, String)> {
        let branch = format!("squadron/{role}-{agent_id}");
        let path = self.git.create_worktree(&branch, base_branch)?;
        Ok((branch, path))
    }

    async fn remove_worktree(&self, worktree_path: &str, branch: &str) -> Result<()> {
        self.git.remove_worktree(worktree_path)?;
        self.git.delete_branch(branch).ok();
        Ok(())
    }
}
