//! Single-writer SQLite-backed state store for agents, pipeline runs and
//! per-PR bookkeeping. All mutating methods take the connection mutex for
//! their whole body and commit in one transaction — no partial writes are
//! visible to a concurrent reader.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::RegistryError;
use crate::types::{AgentRecord, AgentStatus, MailMessage, PrApprovalState};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

/// Maximum DFS depth when walking the blocker graph for cycle detection.
/// Bounds pathological inputs (a corrupted `blocked_by` column) to a
/// predictable cost instead of looping forever.
const MAX_CYCLE_DFS_DEPTH: usize = 256;

pub struct Registry {
    conn: Mutex<Connection>,
    /// Mail queues are explicitly in-memory per the spec's data model —
    /// they do not survive a restart, unlike every other table here.
    mail: Mutex<HashMap<i64, VecDeque<MailMessage>>>,
}

fn now_str() -> String {
    Utc::now().to_rfc3339()
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_ts_opt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_ts(&s))
}

fn row_to_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<AgentRecord> {
    let status_str: String = row.get(5)?;
    let blocked_by_json: String = row.get(8)?;
    let blocked_by: BTreeSet<i64> = serde_json::from_str(&blocked_by_json).unwrap_or_default();
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;
    let active_since: Option<String> = row.get(14)?;
    let sleeping_since: Option<String> = row.get(15)?;
    Ok(AgentRecord {
        agent_id: row.get(0)?,
        role: row.get(1)?,
        issue_number: row.get(2)?,
        pr_number: row.get(3)?,
        session_id: row.get(4)?,
        status: status_str.parse().unwrap_or(AgentStatus::Failed),
        branch: row.get(6)?,
        worktree_path: row.get(7)?,
        blocked_by,
        iteration_count: row.get(9)?,
        tool_call_count: row.get(10)?,
        turn_count: row.get(11)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        active_since: parse_ts_opt(active_since),
        sleeping_since: parse_ts_opt(sleeping_since),
    })
}

const AGENT_COLUMNS: &str = "agent_id, role, issue_number, pr_number, session_id, status, \
     branch, worktree_path, blocked_by, iteration_count, tool_call_count, turn_count, \
     created_at, updated_at, active_since, sleeping_since";

#[derive(Debug, Clone, Serialize)]
pub struct PipelineRun {
    pub run_id: i64,
    pub pipeline_name: String,
    pub scope: String,
    pub issue_number: Option<i64>,
    pub pr_number: Option<i64>,
    pub status: String,
    pub current_stage: Option<String>,
    pub context: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StageRun {
    pub stage_run_id: i64,
    pub run_id: i64,
    pub stage_id: String,
    pub stage_type: String,
    pub status: String,
    pub agent_id: Option<i64>,
    pub result: Option<String>,
    pub error_message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PrApproval {
    pub id: i64,
    pub pr_number: i64,
    pub approver: String,
    pub role: Option<String>,
    pub is_human: bool,
    pub state: PrApprovalState,
    pub stale: bool,
    pub approved_at: DateTime<Utc>,
}

use serde::Serialize;

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineRun> {
    let context_str: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    let completed_at: Option<String> = row.get(9)?;
    Ok(PipelineRun {
        run_id: row.get(0)?,
        pipeline_name: row.get(1)?,
        scope: row.get(2)?,
        issue_number: row.get(3)?,
        pr_number: row.get(4)?,
        status: row.get(5)?,
        current_stage: row.get(10)?,
        context: serde_json::from_str(&context_str).unwrap_or(serde_json::json!({})),
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
        completed_at: parse_ts_opt(completed_at),
    })
}

fn row_to_stage_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageRun> {
    let started_at: Option<String> = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;
    Ok(StageRun {
        stage_run_id: row.get(0)?,
        run_id: row.get(1)?,
        stage_id: row.get(2)?,
        stage_type: row.get(3)?,
        status: row.get(4)?,
        agent_id: row.get(5)?,
        result: row.get(6)?,
        started_at: parse_ts_opt(started_at),
        completed_at: parse_ts_opt(completed_at),
        error_message: row.get(9)?,
        attempt: row.get(10)?,
    })
}

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<PrApproval> {
    let state_str: String = row.get(5)?;
    let approved_at: String = row.get(7)?;
    Ok(PrApproval {
        id: row.get(0)?,
        pr_number: row.get(1)?,
        approver: row.get(2)?,
        role: row.get(3)?,
        is_human: row.get::<_, i64>(4)? != 0,
        state: state_str.parse().unwrap_or(PrApprovalState::Approved),
        stale: row.get::<_, i64>(6)? != 0,
        approved_at: parse_ts(&approved_at),
    })
}

impl Registry {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open registry database at {path:?}"))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("failed to set PRAGMAs")?;
        let registry = Self {
            conn: Mutex::new(conn),
            mail: Mutex::new(HashMap::new()),
        };
        registry.migrate()?;
        Ok(registry)
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute_batch(SCHEMA_SQL)
            .context("failed to apply schema")?;
        Ok(())
    }

    // ── Agents ────────────────────────────────────────────────────────────

    pub fn create_agent(&self, agent: &AgentRecord) -> Result<i64, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let blocked_by = serde_json::to_string(&agent.blocked_by).unwrap_or_else(|_| "[]".into());
        conn.execute(
            "INSERT INTO agents (role, issue_number, pr_number, session_id, status, branch, \
             worktree_path, blocked_by, iteration_count, tool_call_count, turn_count, \
             created_at, updated_at, active_since, sleeping_since) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                agent.role,
                agent.issue_number,
                agent.pr_number,
                agent.session_id,
                agent.status.as_str(),
                agent.branch,
                agent.worktree_path,
                blocked_by,
                agent.iteration_count,
                agent.tool_call_count,
                agent.turn_count,
                agent.created_at.to_rfc3339(),
                agent.updated_at.to_rfc3339(),
                agent.active_since.map(|t| t.to_rfc3339()),
                agent.sleeping_since.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_agent(&self, agent_id: i64) -> Result<AgentRecord, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1");
        conn.query_row(&sql, params![agent_id], row_to_agent)
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(format!("agent {agent_id}")))
    }

    /// Non-terminal agents currently holding a given role — used for the
    /// singleton-role spawn guard in the Agent Manager.
    pub fn find_active_by_role(&self, role: &str) -> Result<Vec<AgentRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE role = ?1 \
             AND status NOT IN ('completed','failed','cancelled')"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![role], row_to_agent)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("find_active_by_role")?;
        Ok(rows)
    }

    /// Agents already assigned to this (role, issue/pr) pair — the
    /// duplicate-spawn guard.
    pub fn find_by_role_and_target(
        &self,
        role: &str,
        issue_number: Option<i64>,
        pr_number: Option<i64>,
    ) -> Result<Vec<AgentRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents WHERE role = ?1 \
             AND (issue_number IS ?2) AND (pr_number IS ?3) \
             AND status NOT IN ('completed','failed','cancelled')"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![role, issue_number, pr_number], row_to_agent)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("find_by_role_and_target")?;
        Ok(rows)
    }

    pub fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents ORDER BY agent_id ASC");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_agent)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_agents")?;
        Ok(rows)
    }

    pub fn list_active_agents(&self) -> Result<Vec<AgentRecord>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!(
            "SELECT {AGENT_COLUMNS} FROM agents \
             WHERE status IN ('created','active','sleeping') ORDER BY agent_id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_agent)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_active_agents")?;
        Ok(rows)
    }

    /// Invariant 1: `status = active ⇔ active_since ≠ null` and
    /// `status = sleeping ⇔ sleeping_since ≠ null`. Every transition sets
    /// exactly the field implied by the new status and clears the other —
    /// including terminal statuses, which clear both.
    pub fn update_agent_status(&self, agent_id: i64, status: AgentStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        let (active_since, sleeping_since): (Option<&str>, Option<&str>) = match status {
            AgentStatus::Active => (Some(now.as_str()), None),
            AgentStatus::Sleeping => (None, Some(now.as_str())),
            _ => (None, None),
        };
        conn.execute(
            "UPDATE agents SET status = ?1, updated_at = ?2, active_since = ?3, sleeping_since = ?4 \
             WHERE agent_id = ?5",
            params![status.as_str(), now, active_since, sleeping_since, agent_id],
        )
        .context("update_agent_status")?;
        Ok(())
    }

    /// Recovery Phase 1's transition: every agent found `active`/`created`
    /// at startup becomes `failed` with `active_since` cleared, since the
    /// process that owned its task is gone and the field would otherwise
    /// keep reporting stale uptime.
    pub fn mark_failed_and_clear_active(&self, agent_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agents SET status = ?1, active_since = NULL, updated_at = ?2 WHERE agent_id = ?3",
            params![AgentStatus::Failed.as_str(), now_str(), agent_id],
        )
        .context("mark_failed_and_clear_active")?;
        Ok(())
    }

    pub fn update_agent_session(&self, agent_id: i64, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agents SET session_id = ?1, updated_at = ?2 WHERE agent_id = ?3",
            params![session_id, now_str(), agent_id],
        )
        .context("update_agent_session")?;
        Ok(())
    }

    pub fn set_agent_branch(&self, agent_id: i64, branch: &str, worktree_path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agents SET branch = ?1, worktree_path = ?2, updated_at = ?3 WHERE agent_id = ?4",
            params![branch, worktree_path, now_str(), agent_id],
        )
        .context("set_agent_branch")?;
        Ok(())
    }

    pub fn set_agent_pr(&self, agent_id: i64, pr_number: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agents SET pr_number = ?1, updated_at = ?2 WHERE agent_id = ?3",
            params![pr_number, now_str(), agent_id],
        )
        .context("set_agent_pr")?;
        Ok(())
    }

    pub fn set_agent_issue(&self, agent_id: i64, issue_number: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agents SET issue_number = ?1, updated_at = ?2 WHERE agent_id = ?3",
            params![issue_number, now_str(), agent_id],
        )
        .context("set_agent_issue")?;
        Ok(())
    }

    pub fn increment_iteration(&self, agent_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agents SET iteration_count = iteration_count + 1, updated_at = ?1 WHERE agent_id = ?2",
            params![now_str(), agent_id],
        )
        .context("increment_iteration")?;
        conn.query_row(
            "SELECT iteration_count FROM agents WHERE agent_id = ?1",
            params![agent_id],
            |r| r.get(0),
        )
        .context("increment_iteration readback")
    }

    pub fn increment_turn(&self, agent_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agents SET turn_count = turn_count + 1, updated_at = ?1 WHERE agent_id = ?2",
            params![now_str(), agent_id],
        )
        .context("increment_turn")?;
        Ok(())
    }

    /// Bumps `tool_call_count` by `n` and persists. The Agent Manager's
    /// circuit breaker L1 calls this every tool call but only actually hits
    /// the database every 10 calls, batching the rest in memory — see
    /// `agent_manager.rs`.
    pub fn add_tool_calls(&self, agent_id: i64, n: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE agents SET tool_call_count = tool_call_count + ?1, updated_at = ?2 WHERE agent_id = ?3",
            params![n, now_str(), agent_id],
        )
        .context("add_tool_calls")?;
        conn.query_row(
            "SELECT tool_call_count FROM agents WHERE agent_id = ?1",
            params![agent_id],
            |r| r.get(0),
        )
        .context("add_tool_calls readback")
    }

    // ── Blocker graph ─────────────────────────────────────────────────────

    /// Adds `blocker` (an issue/PR number) to `agent_id`'s `blocked_by` set,
    /// rejecting the mutation if it would introduce a cycle in the blocker
    /// graph: walk from `blocker`'s owning agent(s) back through their own
    /// `blocked_by` sets, bounded to `MAX_CYCLE_DFS_DEPTH`, and fail if we
    /// ever reach `agent_id`'s own issue/pr number.
    pub fn add_blocker(&self, agent_id: i64, blocker: i64) -> Result<(), RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1");
        let agent = conn
            .query_row(&sql, params![agent_id], row_to_agent)
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(format!("agent {agent_id}")))?;

        let own_key = agent.pr_number.or(agent.issue_number);
        if let Some(own_key) = own_key {
            if Self::would_cycle(&conn, own_key, blocker, 0)? {
                return Err(RegistryError::CycleDetected { agent_id, blocker });
            }
        }

        let mut blocked_by = agent.blocked_by;
        blocked_by.insert(blocker);
        let json = serde_json::to_string(&blocked_by).unwrap_or_else(|_| "[]".into());
        conn.execute(
            "UPDATE agents SET blocked_by = ?1, updated_at = ?2 WHERE agent_id = ?3",
            params![json, now_str(), agent_id],
        )?;
        Ok(())
    }

    /// Depth-bounded DFS: does `target` (reached directly as `blocker`, or
    /// transitively through some agent that `blocker` itself blocks on)
    /// ever resolve back to `target`? `target` is the issue/PR number that
    /// owns the agent we're adding a blocker to.
    fn would_cycle(conn: &Connection, target: i64, blocker: i64, depth: usize) -> rusqlite::Result<bool> {
        if blocker == target {
            return Ok(true);
        }
        if depth >= MAX_CYCLE_DFS_DEPTH {
            return Ok(false);
        }
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE issue_number = ?1 OR pr_number = ?1");
        let mut stmt = conn.prepare(&sql)?;
        let owners = stmt
            .query_map(params![blocker], row_to_agent)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        for owner in owners {
            for next in &owner.blocked_by {
                if Self::would_cycle(conn, target, *next, depth + 1)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    pub fn remove_blocker(&self, agent_id: i64, blocker: i64) -> Result<BTreeSet<i64>, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = format!("SELECT {AGENT_COLUMNS} FROM agents WHERE agent_id = ?1");
        let agent = conn
            .query_row(&sql, params![agent_id], row_to_agent)
            .optional()?
            .ok_or_else(|| RegistryError::NotFound(format!("agent {agent_id}")))?;
        let mut blocked_by = agent.blocked_by;
        blocked_by.remove(&blocker);
        let json = serde_json::to_string(&blocked_by).unwrap_or_else(|_| "[]".into());
        conn.execute(
            "UPDATE agents SET blocked_by = ?1, updated_at = ?2 WHERE agent_id = ?3",
            params![json, now_str(), agent_id],
        )?;
        Ok(blocked_by)
    }

    /// Agents whose `blocked_by` set contains `resolved_key`. The
    /// Reconciliation Loop resolves blockers in a single pass over all
    /// active agents instead (one query per tick rather than one per
    /// closed issue); this is the inverse lookup for dashboard/debugging
    /// use — "what is still waiting on #123?".
    pub fn find_blocked_on(&self, resolved_key: i64) -> Result<Vec<AgentRecord>> {
        let agents = self.list_agents()?;
        Ok(agents
            .into_iter()
            .filter(|a| a.blocked_by.contains(&resolved_key))
            .collect())
    }

    // ── Mail (in-memory) ──────────────────────────────────────────────────

    pub fn push_mail(&self, agent_id: i64, message: MailMessage) {
        let mut mail = self.mail.lock().unwrap_or_else(|e| e.into_inner());
        mail.entry(agent_id).or_default().push_back(message);
    }

    /// Drains the full queue for `agent_id`. Subsequent reads see nothing
    /// until new mail arrives — there is no re-delivery.
    pub fn drain_mail(&self, agent_id: i64) -> Vec<MailMessage> {
        let mut mail = self.mail.lock().unwrap_or_else(|e| e.into_inner());
        mail.remove(&agent_id)
            .map(|q| q.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn mail_pending(&self, agent_id: i64) -> bool {
        let mail = self.mail.lock().unwrap_or_else(|e| e.into_inner());
        mail.get(&agent_id).is_some_and(|q| !q.is_empty())
    }

    // ── Pipeline runs ─────────────────────────────────────────────────────

    pub fn create_run(
        &self,
        pipeline_name: &str,
        scope: &str,
        issue_number: Option<i64>,
        pr_number: Option<i64>,
        context: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "INSERT INTO pipeline_runs (pipeline_name, scope, issue_number, pr_number, status, \
             context, created_at, updated_at) VALUES (?1,?2,?3,?4,'running',?5,?6,?6)",
            params![pipeline_name, scope, issue_number, pr_number, context.to_string(), now],
        )
        .context("create_run")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_run(&self, run_id: i64) -> Result<PipelineRun, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT run_id, pipeline_name, scope, issue_number, pr_number, status, context, \
             created_at, updated_at, completed_at, current_stage FROM pipeline_runs WHERE run_id = ?1",
            params![run_id],
            row_to_run,
        )
        .optional()?
        .ok_or_else(|| RegistryError::NotFound(format!("pipeline run {run_id}")))
    }

    pub fn find_runs_for_pr(&self, pr_number: i64, pipeline_name: Option<&str>) -> Result<Vec<PipelineRun>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT run_id, pipeline_name, scope, issue_number, pr_number, status, context, \
             created_at, updated_at, completed_at, current_stage FROM pipeline_runs \
             WHERE pr_number = ?1 AND (?2 IS NULL OR pipeline_name = ?2) ORDER BY run_id DESC",
        )?;
        let rows = stmt
            .query_map(params![pr_number, pipeline_name], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("find_runs_for_pr")?;
        Ok(rows)
    }

    pub fn list_runs(&self, status: Option<&str>) -> Result<Vec<PipelineRun>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT run_id, pipeline_name, scope, issue_number, pr_number, status, context, \
             created_at, updated_at, completed_at, current_stage FROM pipeline_runs \
             WHERE (?1 IS NULL OR status = ?1) ORDER BY run_id DESC",
        )?;
        let rows = stmt
            .query_map(params![status], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_runs")?;
        Ok(rows)
    }

    pub fn update_run_stage(&self, run_id: i64, current_stage: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_runs SET current_stage = ?1, updated_at = ?2 WHERE run_id = ?3",
            params![current_stage, now_str(), run_id],
        )
        .context("update_run_stage")?;
        Ok(())
    }

    pub fn update_run_context(&self, run_id: i64, context: &serde_json::Value) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pipeline_runs SET context = ?1, updated_at = ?2 WHERE run_id = ?3",
            params![context.to_string(), now_str(), run_id],
        )
        .context("update_run_context")?;
        Ok(())
    }

    pub fn complete_run(&self, run_id: i64, status: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let now = now_str();
        conn.execute(
            "UPDATE pipeline_runs SET status = ?1, updated_at = ?2, completed_at = ?2 WHERE run_id = ?3",
            params![status, now, run_id],
        )
        .context("complete_run")?;
        Ok(())
    }

    /// Deletes a run and, via `ON DELETE CASCADE`, every stage run, gate
    /// check, human-stage-state row and PR association that hung off it.
    pub fn delete_run_cascade(&self, run_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute("DELETE FROM pipeline_runs WHERE run_id = ?1", params![run_id])
            .context("delete_run_cascade")?;
        Ok(())
    }

    // ── Stage runs ────────────────────────────────────────────────────────

    pub fn create_stage_run(&self, run_id: i64, stage_id: &str, stage_type: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO stage_runs (run_id, stage_id, stage_type, status, attempt) \
             VALUES (?1,?2,?3,'pending',1)",
            params![run_id, stage_id, stage_type],
        )
        .context("create_stage_run")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn start_stage_run(&self, stage_run_id: i64, agent_id: Option<i64>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE stage_runs SET status = 'running', started_at = ?1, agent_id = ?2 WHERE stage_run_id = ?3",
            params![now_str(), agent_id, stage_run_id],
        )
        .context("start_stage_run")?;
        Ok(())
    }

    pub fn complete_stage_run(&self, stage_run_id: i64, status: &str, result: Option<&str>, error: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE stage_runs SET status = ?1, result = ?2, error_message = ?3, completed_at = ?4 WHERE stage_run_id = ?5",
            params![status, result, error, now_str(), stage_run_id],
        )
        .context("complete_stage_run")?;
        Ok(())
    }

    pub fn retry_stage_run(&self, stage_run_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE stage_runs SET status = 'pending', attempt = attempt + 1, \
             started_at = NULL, completed_at = NULL WHERE stage_run_id = ?1",
            params![stage_run_id],
        )
        .context("retry_stage_run")?;
        Ok(())
    }

    pub fn get_stage_run(&self, stage_run_id: i64) -> Result<StageRun, RegistryError> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT stage_run_id, run_id, stage_id, stage_type, status, agent_id, result, \
             started_at, completed_at, error_message, attempt FROM stage_runs WHERE stage_run_id = ?1",
            params![stage_run_id],
            row_to_stage_run,
        )
        .optional()?
        .ok_or_else(|| RegistryError::NotFound(format!("stage run {stage_run_id}")))
    }

    pub fn list_stage_runs(&self, run_id: i64) -> Result<Vec<StageRun>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT stage_run_id, run_id, stage_id, stage_type, status, agent_id, result, \
             started_at, completed_at, error_message, attempt FROM stage_runs \
             WHERE run_id = ?1 ORDER BY stage_run_id ASC",
        )?;
        let rows = stmt
            .query_map(params![run_id], row_to_stage_run)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("list_stage_runs")?;
        Ok(rows)
    }

    // ── Gate checks ───────────────────────────────────────────────────────

    pub fn record_gate_check(&self, stage_run_id: i64, check_name: &str, passed: bool, error_message: Option<&str>) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO gate_checks (stage_run_id, check_name, passed, error_message, checked_at) \
             VALUES (?1,?2,?3,?4,?5)",
            params![stage_run_id, check_name, passed as i64, error_message, now_str()],
        )
        .context("record_gate_check")?;
        Ok(conn.last_insert_rowid())
    }

    // ── Human stage state ─────────────────────────────────────────────────

    pub fn upsert_human_stage_state(&self, stage_run_id: i64, wait_type: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO human_stage_state (stage_run_id, wait_type, notified_at) VALUES (?1,?2,?3) \
             ON CONFLICT(stage_run_id) DO UPDATE SET wait_type = excluded.wait_type, notified_at = excluded.notified_at",
            params![stage_run_id, wait_type, now_str()],
        )
        .context("upsert_human_stage_state")?;
        Ok(())
    }

    pub fn record_human_response(&self, stage_run_id: i64, response: &str, responder: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE human_stage_state SET response = ?1, responder = ?2, responded_at = ?3 WHERE stage_run_id = ?4",
            params![response, responder, now_str(), stage_run_id],
        )
        .context("record_human_response")?;
        Ok(())
    }

    // ── Per-PR tables ─────────────────────────────────────────────────────

    pub fn upsert_pr_requirements(&self, pr_number: i64, required_roles: &[String], include_humans: bool, min_approvals: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let roles_json = serde_json::to_string(required_roles).unwrap_or_else(|_| "[]".into());
        conn.execute(
            "INSERT INTO pr_requirements (pr_number, required_roles, include_humans, min_approvals, updated_at) \
             VALUES (?1,?2,?3,?4,?5) \
             ON CONFLICT(pr_number) DO UPDATE SET required_roles = excluded.required_roles, \
             include_humans = excluded.include_humans, min_approvals = excluded.min_approvals, \
             updated_at = excluded.updated_at",
            params![pr_number, roles_json, include_humans as i64, min_approvals, now_str()],
        )
        .context("upsert_pr_requirements")?;
        Ok(())
    }

    pub fn get_pr_requirements(&self, pr_number: i64) -> Result<Option<(Vec<String>, bool, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let row: Option<(String, i64, i64)> = conn
            .query_row(
                "SELECT required_roles, include_humans, min_approvals FROM pr_requirements WHERE pr_number = ?1",
                params![pr_number],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
            )
            .optional()
            .context("get_pr_requirements")?;
        Ok(row.map(|(roles_json, include_humans, min_approvals)| {
            let roles: Vec<String> = serde_json::from_str(&roles_json).unwrap_or_default();
            (roles, include_humans != 0, min_approvals)
        }))
    }

    pub fn record_pr_approval(
        &self,
        pr_number: i64,
        approver: &str,
        role: Option<&str>,
        is_human: bool,
        state: PrApprovalState,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO pr_approvals (pr_number, approver, role, is_human, state, stale, approved_at) \
             VALUES (?1,?2,?3,?4,?5,0,?6)",
            params![pr_number, approver, role, is_human as i64, state.as_str(), now_str()],
        )
        .context("record_pr_approval")?;
        Ok(conn.last_insert_rowid())
    }

    /// Resolves Open Question 3: invalidation sets `stale = 1` on every
    /// current (non-stale) approval row for the PR. Rows are never deleted.
    pub fn invalidate_pr_approvals(&self, pr_number: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "UPDATE pr_approvals SET stale = 1 WHERE pr_number = ?1 AND stale = 0",
            params![pr_number],
        )
        .context("invalidate_pr_approvals")?;
        Ok(())
    }

    pub fn get_pr_approvals(&self, pr_number: i64, include_stale: bool) -> Result<Vec<PrApproval>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let sql = if include_stale {
            "SELECT id, pr_number, approver, role, is_human, state, stale, approved_at FROM pr_approvals \
             WHERE pr_number = ?1 ORDER BY id ASC"
        } else {
            "SELECT id, pr_number, approver, role, is_human, state, stale, approved_at FROM pr_approvals \
             WHERE pr_number = ?1 AND stale = 0 ORDER BY id ASC"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params![pr_number], row_to_approval)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_pr_approvals")?;
        Ok(rows)
    }

    /// Invariant 5: a PR is merge-ready only once every required role (and,
    /// if configured, a human) has a non-stale `approved` row and no
    /// non-stale `changes_requested` row exists for the PR. A PR with no
    /// `pr_requirements` row is not merge-ready — requirements must be
    /// registered explicitly before a gate can pass.
    pub fn check_pr_merge_ready(&self, pr_number: i64) -> Result<bool> {
        let Some((required_roles, include_humans, min_approvals)) = self.get_pr_requirements(pr_number)? else {
            return Ok(false);
        };
        let approvals = self.get_pr_approvals(pr_number, false)?;

        if approvals.iter().any(|a| a.state == PrApprovalState::ChangesRequested) {
            return Ok(false);
        }

        let approved: Vec<&PrApproval> = approvals.iter().filter(|a| a.state == PrApprovalState::Approved).collect();

        for role in &required_roles {
            if !approved.iter().any(|a| a.role.as_deref() == Some(role.as_str())) {
                return Ok(false);
            }
        }
        if include_humans && !approved.iter().any(|a| a.is_human) {
            return Ok(false);
        }
        if (approved.len() as i64) < min_approvals {
            return Ok(false);
        }
        Ok(true)
    }

    pub fn set_pr_sequence_state(&self, pr_number: i64, sequence_name: &str, position: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO pr_sequence_state (pr_number, sequence_name, position, updated_at) \
             VALUES (?1,?2,?3,?4) \
             ON CONFLICT(pr_number) DO UPDATE SET sequence_name = excluded.sequence_name, \
             position = excluded.position, updated_at = excluded.updated_at",
            params![pr_number, sequence_name, position, now_str()],
        )
        .context("set_pr_sequence_state")?;
        Ok(())
    }

    pub fn get_pr_sequence_state(&self, pr_number: i64) -> Result<Option<(String, i64)>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.query_row(
            "SELECT sequence_name, position FROM pr_sequence_state WHERE pr_number = ?1",
            params![pr_number],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .context("get_pr_sequence_state")
    }

    pub fn associate_pr(&self, pr_number: i64, run_id: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT OR IGNORE INTO pr_associations (pr_number, run_id) VALUES (?1,?2)",
            params![pr_number, run_id],
        )
        .context("associate_pr")?;
        Ok(())
    }

    pub fn runs_for_pr(&self, pr_number: i64) -> Result<Vec<i64>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare("SELECT run_id FROM pr_associations WHERE pr_number = ?1")?;
        let rows = stmt
            .query_map(params![pr_number], |r| r.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()
            .context("runs_for_pr")?;
        Ok(rows)
    }

    // ── Activity log ──────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn append_activity(
        &self,
        agent_id: Option<i64>,
        event_type: &str,
        summary: &str,
        detail: Option<&str>,
        tool_name: Option<&str>,
        tool_result: Option<&str>,
        metadata: &serde_json::Value,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO agent_activity (agent_id, event_type, timestamp, summary, detail, \
             tool_name, tool_result, metadata) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            params![
                agent_id,
                event_type,
                now_str(),
                summary,
                detail,
                tool_name,
                tool_result,
                metadata.to_string(),
            ],
        )
        .context("append_activity")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_agent_activity(&self, agent_id: i64, limit: i64) -> Result<Vec<ActivityRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, event_type, timestamp, summary, detail, tool_name, \
             tool_result, metadata FROM agent_activity WHERE agent_id = ?1 \
             ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![agent_id, limit], row_to_activity)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_agent_activity")?;
        Ok(rows)
    }

    pub fn get_recent_activity(&self, limit: i64) -> Result<Vec<ActivityRow>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, event_type, timestamp, summary, detail, tool_name, \
             tool_result, metadata FROM agent_activity ORDER BY timestamp DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit], row_to_activity)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("get_recent_activity")?;
        Ok(rows)
    }

    /// Per-agent counters used by the dashboard: total events, tool calls,
    /// and the timestamp of the most recent event.
    pub fn get_agent_stats(&self, agent_id: i64) -> Result<AgentActivityStats> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agent_activity WHERE agent_id = ?1",
            params![agent_id],
            |r| r.get(0),
        )?;
        let tool_calls: i64 = conn.query_row(
            "SELECT COUNT(*) FROM agent_activity WHERE agent_id = ?1 AND tool_name IS NOT NULL",
            params![agent_id],
            |r| r.get(0),
        )?;
        let last_event_at: Option<String> = conn
            .query_row(
                "SELECT timestamp FROM agent_activity WHERE agent_id = ?1 ORDER BY timestamp DESC LIMIT 1",
                params![agent_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(AgentActivityStats {
            total_events: total,
            tool_calls,
            last_event_at: parse_ts_opt(last_event_at),
        })
    }

    /// Deletes activity rows older than `retain_days`. Backs the
    /// reconciliation sweep's retention policy.
    pub fn prune_old_activity(&self, retain_days: i64) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let cutoff = (Utc::now() - chrono::Duration::days(retain_days)).to_rfc3339();
        let n = conn
            .execute("DELETE FROM agent_activity WHERE timestamp < ?1", params![cutoff])
            .context("prune_old_activity")?;
        Ok(n)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivityRow {
    pub id: i64,
    pub agent_id: Option<i64>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub detail: Option<String>,
    pub tool_name: Option<String>,
    pub tool_result: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentActivityStats {
    pub total_events: i64,
    pub tool_calls: i64,
    pub last_event_at: Option<DateTime<Utc>>,
}

fn row_to_activity(row: &rusqlite::Row<'_>) -> rusqlite::Result<ActivityRow> {
    let timestamp: String = row.get(3)?;
    let metadata_str: String = row.get(8)?;
    Ok(ActivityRow {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        event_type: row.get(2)?,
        timestamp: parse_ts(&timestamp),
        summary: row.get(4)?,
        detail: row.get(5)?,
        tool_name: row.get(6)?,
        tool_result: row.get(7)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::json!({})),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_registry() -> Registry {
        Registry::open(":memory:").expect("open registry")
    }

    #[test]
    fn create_and_get_agent_round_trips() {
        let reg = tmp_registry();
        let record = AgentRecord::new(0, "reviewer");
        let id = reg.create_agent(&record).unwrap();
        let fetched = reg.get_agent(id).unwrap();
        assert_eq!(fetched.role, "reviewer");
        assert_eq!(fetched.status, AgentStatus::Created);
    }

    #[test]
    fn get_agent_missing_is_not_found() {
        let reg = tmp_registry();
        let err = reg.get_agent(999).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
    }

    #[test]
    fn blocker_cycle_is_rejected() {
        let reg = tmp_registry();
        let mut a = AgentRecord::new(0, "implementer");
        a.issue_number = Some(10);
        let a_id = reg.create_agent(&a).unwrap();
        let mut b = AgentRecord::new(0, "reviewer");
        b.issue_number = Some(20);
        let b_id = reg.create_agent(&b).unwrap();

        // a blocked on 20 (b's issue) is fine.
        reg.add_blocker(a_id, 20).unwrap();
        // b blocked on 10 (a's issue) would close the cycle 10 -> 20 -> 10.
        let err = reg.add_blocker(b_id, 10).unwrap_err();
        assert!(matches!(err, RegistryError::CycleDetected { .. }));
    }

    #[test]
    fn mail_drains_once() {
        let reg = tmp_registry();
        reg.push_mail(
            1,
            MailMessage {
                sender: "alice".into(),
                body: "hi".into(),
                provenance: crate::types::MessageProvenance::IssueComment,
                received_at: Utc::now(),
            },
        );
        assert!(reg.mail_pending(1));
        let drained = reg.drain_mail(1);
        assert_eq!(drained.len(), 1);
        assert!(!reg.mail_pending(1));
        assert!(reg.drain_mail(1).is_empty());
    }

    #[test]
    fn invalidate_approvals_sets_stale_not_delete() {
        let reg = tmp_registry();
        reg.record_pr_approval(5, "reviewer-bot", Some("reviewer"), false, PrApprovalState::Approved).unwrap();
        assert_eq!(reg.get_pr_approvals(5, false).unwrap().len(), 1);
        reg.invalidate_pr_approvals(5).unwrap();
        assert_eq!(reg.get_pr_approvals(5, false).unwrap().len(), 0);
        assert_eq!(reg.get_pr_approvals(5, true).unwrap().len(), 1);
    }

    #[test]
    fn merge_ready_false_without_requirements_row() {
        let reg = tmp_registry();
        assert!(!reg.check_pr_merge_ready(9).unwrap());
    }

    #[test]
    fn merge_ready_requires_every_role_and_blocks_on_changes_requested() {
        let reg = tmp_registry();
        reg.upsert_pr_requirements(9, &["reviewer".to_string(), "security".to_string()], false, 1).unwrap();
        assert!(!reg.check_pr_merge_ready(9).unwrap());

        reg.record_pr_approval(9, "reviewer-bot", Some("reviewer"), false, PrApprovalState::Approved).unwrap();
        assert!(!reg.check_pr_merge_ready(9).unwrap(), "security role still unapproved");

        reg.record_pr_approval(9, "security-bot", Some("security"), false, PrApprovalState::Approved).unwrap();
        assert!(reg.check_pr_merge_ready(9).unwrap());

        reg.record_pr_approval(9, "reviewer-bot", Some("reviewer"), false, PrApprovalState::ChangesRequested).unwrap();
        assert!(!reg.check_pr_merge_ready(9).unwrap(), "fresh changes_requested row blocks merge");
    }

    #[test]
    fn merge_ready_ignores_stale_approvals() {
        let reg = tmp_registry();
        reg.upsert_pr_requirements(9, &["reviewer".to_string()], false, 1).unwrap();
        reg.record_pr_approval(9, "reviewer-bot", Some("reviewer"), false, PrApprovalState::Approved).unwrap();
        assert!(reg.check_pr_merge_ready(9).unwrap());
        reg.invalidate_pr_approvals(9).unwrap();
        assert!(!reg.check_pr_merge_ready(9).unwrap(), "invalidated approval no longer counts");
    }
}
