use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info};
use rusqlite::Connection;
use tokio::sync::oneshot;

use super::{migrations::run_migrations, models::SubmissionState};

/// A live call and `hirecall recover` may write the journal at the same time.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to journal thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join journal thread: {join_err:?}");
            }
        }
    }
}

/// SQLite connection owned by a dedicated thread; callers hop onto it with
/// [`Database::execute`].
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Arc<PathBuf>,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create journal directory {}", parent.display())
            })?;
        }

        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let path_for_thread = db_path.clone();

        let worker = thread::Builder::new()
            .name("hirecall-journal".into())
            .spawn(move || {
                let mut conn = match Connection::open(&path_for_thread) {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite journal")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.busy_timeout(BUSY_TIMEOUT) {
                    error!("Failed to set journal busy timeout: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run journal migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("Journal initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => task(&mut conn),
                        DbCommand::Shutdown => break,
                    }
                }

                // fold the WAL back so the journal is a single file between runs
                if let Err(err) = conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(())) {
                    error!("Journal checkpoint on shutdown failed: {err}");
                }
                info!("Journal thread shutting down");
            })
            .with_context(|| "failed to spawn journal worker thread")?;

        ready_rx
            .recv()
            .context("journal worker exited before signaling readiness")??;

        info!("Submission journal opened at {}", db_path.display());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: Arc::new(db_path),
        })
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    /// Pending end-call reports that survived a previous run.
    pub async fn has_pending(&self) -> Result<bool> {
        self.execute(|conn| {
            let pending: i64 = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM call_submissions WHERE state = ?1)",
                [SubmissionState::Pending.as_str()],
                |row| row.get(0),
            )?;
            Ok(pending != 0)
        })
        .await
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("Journal caller dropped before receiving result");
            }
        }));

        self.inner
            .sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to journal thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("journal thread terminated unexpectedly"))?
    }
}
