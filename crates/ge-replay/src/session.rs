//! Replay session lifecycle.
//!
//! [`ReplaySession::poll`] is the entry point the bootstrap program invokes
//! once per display refresh on the primary context. The first call loads the
//! dump and spawns the worker thread; every call then services exactly one
//! marshalled operation and reports whether the bootstrap should call again
//! immediately or yield until the next refresh.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use ge_dump::{Dump, DumpReadError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::env::{ReplayConfig, ReplayEnv};
use crate::exec::{DumpExecutor, RunOutcome};
use crate::ops::{OpKind, OpSlot, Operation};

/// Cycle cost billed for a stall update serviced on the primary context.
const UPDATE_STALL_CYCLES: u32 = 190;
/// Cycle cost billed for a list enqueue.
const ENQUEUE_LIST_CYCLES: u32 = 490;
/// Cycle cost billed for a blocking list sync.
const LIST_SYNC_CYCLES: u32 = 220;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplayResult {
    /// Poll again immediately; the worker has more operations coming.
    Continue,
    /// The replay ran to completion; yield until the next refresh.
    Done,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("failed to load dump: {0}")]
    Load(#[from] DumpReadError),
    #[error("failed to spawn replay worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("replay aborted on an unsupported command")]
    Aborted,
}

struct CurrentDump {
    path: PathBuf,
    dump: Arc<Dump>,
}

/// One mounted dump and its worker thread.
///
/// Owned by the primary context; all methods must be called from there.
pub struct ReplaySession<E: ReplayEnv + 'static> {
    env: Arc<E>,
    config: ReplayConfig,
    ops: Arc<OpSlot>,
    current: Option<CurrentDump>,
    worker: Option<JoinHandle<()>>,
}

impl<E: ReplayEnv + 'static> ReplaySession<E> {
    pub fn new(env: Arc<E>, config: ReplayConfig) -> ReplaySession<E> {
        ReplaySession {
            env,
            config,
            ops: Arc::new(OpSlot::new()),
            current: None,
            worker: None,
        }
    }

    /// Asks the host to splice the bootstrap program at `code_start`. The
    /// bootstrap invokes [`ReplaySession::poll`] in a loop, yielding a display
    /// refresh whenever poll reports `Done`.
    pub fn install_bootstrap(&self, code_start: u32) {
        self.env.install_bootstrap(code_start);
    }

    /// Services one operation of the replay of `path`, (re)loading the dump
    /// and spawning the worker first if needed.
    pub fn poll(&mut self, path: &Path) -> Result<ReplayResult, ReplayError> {
        let dump = match &self.current {
            Some(current) if current.path.as_path() == path => Arc::clone(&current.dump),
            _ => {
                // A worker still replaying the previous dump is abandoned,
                // not waited out.
                if let Some(worker) = self.worker.take() {
                    warn!("dump changed mid-replay, cancelling previous worker");
                    self.ops.cancel();
                    let _ = worker.join();
                }

                let dump = Arc::new(Dump::load(path)?);
                info!(
                    version = dump.version,
                    commands = dump.commands.len(),
                    pushbuf_bytes = dump.pushbuf.len(),
                    "loaded dump"
                );
                if let Some(game_id) = &dump.game_id {
                    self.env.on_game_identified(game_id);
                }
                self.current = Some(CurrentDump {
                    path: path.to_owned(),
                    dump: Arc::clone(&dump),
                });
                dump
            }
        };

        if self.worker.is_none() {
            self.spawn_worker(dump)?;
        }

        let Some(op) = self.ops.wait_for_op() else {
            // Cancelled under us; nothing left to service.
            return Ok(ReplayResult::Done);
        };
        self.service(op)
    }

    fn spawn_worker(&mut self, dump: Arc<Dump>) -> Result<(), ReplayError> {
        self.ops.reset();
        let env = Arc::clone(&self.env);
        let ops = Arc::clone(&self.ops);
        let config = self.config;

        let handle = thread::Builder::new()
            .name("GeReplay".to_string())
            .spawn(move || {
                let mut executor = DumpExecutor::new(dump, env, Arc::clone(&ops), config);
                let outcome = executor.run();
                debug!(?outcome, "replay worker finished");
                ops.execute_on_main(Operation {
                    kind: OpKind::Done,
                    list_id: 0,
                    param: (outcome == RunOutcome::Error) as u32,
                });
            })?;
        self.worker = Some(handle);
        Ok(())
    }

    /// Performs one marshalled operation on behalf of the worker, then wakes
    /// it. The worker only resumes after the completion, so every engine call
    /// here happens-before the worker's next step.
    fn service(&mut self, op: Operation) -> Result<ReplayResult, ReplayError> {
        match op.kind {
            OpKind::UpdateStall => {
                self.env.eat_cycles(UPDATE_STALL_CYCLES);
                self.env.force_reschedule_check();
                let resumed = self.env.update_stall(op.list_id, op.param);
                if resumed {
                    self.env.defer_to_ge();
                }
                self.ops.complete(0);
                Ok(ReplayResult::Continue)
            }
            OpKind::EnqueueList => {
                let (list_id, resumed) = self.env.enqueue_list(op.list_id, op.param);
                self.env.eat_cycles(ENQUEUE_LIST_CYCLES);
                self.env.force_reschedule_check();
                if resumed {
                    self.env.defer_to_ge();
                }
                self.ops.complete(list_id);
                Ok(ReplayResult::Continue)
            }
            OpKind::ListSync => {
                self.env.eat_cycles(LIST_SYNC_CYCLES);
                self.env.list_sync(op.list_id, op.param);
                self.ops.complete(0);
                Ok(ReplayResult::Continue)
            }
            OpKind::ReapplyGfxState => {
                self.env.reapply_gfx_state();
                self.ops.complete(0);
                Ok(ReplayResult::Continue)
            }
            OpKind::Done => {
                let failed = op.param != 0;
                self.ops.complete(0);
                if let Some(worker) = self.worker.take() {
                    let _ = worker.join();
                }
                self.ops.reset();
                if failed {
                    Err(ReplayError::Aborted)
                } else {
                    Ok(ReplayResult::Done)
                }
            }
        }
    }

    /// Tears the session down: cancels and joins the worker, then drops the
    /// dump. Safe to call with no replay mounted.
    pub fn unload(&mut self) {
        if let Some(worker) = self.worker.take() {
            // The worker may be blocked mid-operation; force it out.
            self.ops.cancel();
            let _ = worker.join();
        }
        self.current = None;
        self.ops.reset();
    }
}

impl<E: ReplayEnv + 'static> Drop for ReplaySession<E> {
    fn drop(&mut self) {
        self.unload();
    }
}
